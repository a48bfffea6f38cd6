use arrayvec::ArrayString;
use core::fmt::Write;
use serde::Serialize;
use thiserror::Error;
use tracing::warn;

pub const MAX_TOPIC_LEN: usize = 128;
pub const MAX_METHOD_NAME_LEN: usize = 32;
pub const MAX_REQUEST_ID_LEN: usize = 64;
pub const MAX_METHOD_BODY_LEN: usize = 128;
pub const MAX_TELEMETRY_LEN: usize = 256;
pub const MAX_INBOUND_PAYLOAD_LEN: usize = 256;

pub const API_VERSION: &str = "2021-04-12";

/// Subscription filter for inbound direct-method requests.
pub const METHOD_POST_FILTER: &str = "$iothub/methods/POST/#";
pub const METHOD_POST_PREFIX: &str = "$iothub/methods/POST/";

pub type TopicBuffer = ArrayString<MAX_TOPIC_LEN>;
pub type MethodBodyBuffer = ArrayString<MAX_METHOD_BODY_LEN>;
pub type TelemetryBuffer = ArrayString<MAX_TELEMETRY_LEN>;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum WireError {
    #[error("serialized payload exceeds {MAX_TELEMETRY_LEN} bytes")]
    PayloadTooLarge,
    #[error("payload serialization failed")]
    Serialization,
    #[error("topic exceeds {MAX_TOPIC_LEN} bytes")]
    TopicTooLong,
}

/// Copies `source` into a fixed buffer, dropping anything past capacity.
pub fn truncated<const CAP: usize>(source: &str) -> ArrayString<CAP> {
    let mut buffer = ArrayString::new();
    for ch in source.chars() {
        if buffer.try_push(ch).is_err() {
            break;
        }
    }
    buffer
}

pub fn telemetry_topic(device_id: &str) -> Result<TopicBuffer, WireError> {
    let mut topic = TopicBuffer::new();
    write!(topic, "devices/{device_id}/messages/events/").map_err(|_| WireError::TopicTooLong)?;
    Ok(topic)
}

/// Response topic carries the status code and echoes the request id verbatim
/// so the hub can correlate request and response.
pub fn method_response_topic(status: u16, request_id: &str) -> Result<TopicBuffer, WireError> {
    let mut topic = TopicBuffer::new();
    write!(topic, "$iothub/methods/res/{status}/?$rid={request_id}")
        .map_err(|_| WireError::TopicTooLong)?;
    Ok(topic)
}

/// Method name and correlation id live in the topic, not the payload:
/// `$iothub/methods/POST/<method>/?$rid=<id>`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MethodRequest {
    pub method: ArrayString<MAX_METHOD_NAME_LEN>,
    pub request_id: ArrayString<MAX_REQUEST_ID_LEN>,
}

pub fn parse_method_topic(topic: &str) -> Option<MethodRequest> {
    let rest = topic.strip_prefix(METHOD_POST_PREFIX)?;
    let (method, tail) = rest.split_once('/')?;
    let request_id = tail.strip_prefix("?$rid=")?;
    if method.is_empty() || request_id.is_empty() {
        return None;
    }
    if method.len() > MAX_METHOD_NAME_LEN || request_id.len() > MAX_REQUEST_ID_LEN {
        warn!(topic, "method topic fields truncated to buffer capacity");
    }
    Some(MethodRequest {
        method: truncated(method),
        request_id: truncated(request_id),
    })
}

/// One telemetry report per duty cycle. The timestamp is only emitted when
/// wall-clock time is known to be synchronized.
#[derive(Debug, Serialize)]
pub struct TelemetryReport<'a> {
    #[serde(rename = "deviceId")]
    pub device_id: &'a str,
    #[serde(rename = "pulseRate")]
    pub pulse_rate: f32,
    pub temperature: f32,
    #[serde(rename = "spO2")]
    pub spo2: f32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<String>,
}

pub fn rfc3339_timestamp(unix_s: i64) -> Option<String> {
    chrono::DateTime::from_timestamp(unix_s, 0)
        .map(|t| t.to_rfc3339_opts(chrono::SecondsFormat::Secs, true))
}

pub fn encode_telemetry(report: &TelemetryReport<'_>) -> Result<TelemetryBuffer, WireError> {
    let json = serde_json::to_string(report).map_err(|_| WireError::Serialization)?;
    let mut buffer = TelemetryBuffer::new();
    buffer
        .try_push_str(&json)
        .map_err(|_| WireError::PayloadTooLarge)?;
    Ok(buffer)
}
