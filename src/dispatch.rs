use core::fmt::Write;
use tracing::{debug, info, warn};

use crate::protocol::{
    method_response_topic, parse_method_topic, MethodBodyBuffer, TopicBuffer, METHOD_POST_PREFIX,
};
use crate::transport::Inbound;

#[derive(Debug, Clone, Copy, Default)]
pub struct DispatchStats {
    pub handled: u32,
    pub unknown: u32,
    pub malformed: u32,
}

/// Result of running one method handler.
#[derive(Debug)]
pub struct MethodOutcome {
    pub status: u16,
    pub body: MethodBodyBuffer,
}

/// Correlated response ready to publish back to the hub.
#[derive(Debug)]
pub struct MethodReply {
    pub topic: TopicBuffer,
    pub body: MethodBodyBuffer,
}

/// Decodes direct-method requests and runs the matching handler.
///
/// Handlers run in the transport's inbound context where stack is scarcest,
/// so bodies are assembled into fixed buffers with `fmt::Write` rather than
/// growable strings.
#[derive(Debug, Default)]
pub struct CommandDispatcher {
    output_enabled: bool,
    stats: DispatchStats,
}

impl CommandDispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    /// State of the controllable output (indicator/actuator line).
    pub fn output_enabled(&self) -> bool {
        self.output_enabled
    }

    pub fn stats(&self) -> &DispatchStats {
        &self.stats
    }

    /// Handles one inbound message. `None` when the topic is not a method
    /// request (other cloud-to-device traffic is ignored here) or when no
    /// correlated response can be built.
    pub fn dispatch(&mut self, message: &Inbound) -> Option<MethodReply> {
        if !message.topic.starts_with(METHOD_POST_PREFIX) {
            debug!(topic = %message.topic, "inbound message is not a method request");
            return None;
        }
        let Some(request) = parse_method_topic(&message.topic) else {
            // No request id to correlate a response with; drop it.
            warn!(topic = %message.topic, "malformed method topic");
            self.stats.malformed += 1;
            return None;
        };

        let outcome = self.handle(request.method.as_str());
        match method_response_topic(outcome.status, request.request_id.as_str()) {
            Ok(topic) => Some(MethodReply {
                topic,
                body: outcome.body,
            }),
            Err(err) => {
                warn!(error = %err, "response topic construction failed");
                None
            }
        }
    }

    pub fn handle(&mut self, method: &str) -> MethodOutcome {
        let mut body = MethodBodyBuffer::new();
        match method {
            "activate-output" => {
                self.output_enabled = true;
                self.stats.handled += 1;
                info!("output activated by direct method");
                let _ = body.try_push_str(r#"{"output":"on"}"#);
                MethodOutcome { status: 200, body }
            }
            "deactivate-output" => {
                self.output_enabled = false;
                self.stats.handled += 1;
                info!("output deactivated by direct method");
                let _ = body.try_push_str(r#"{"output":"off"}"#);
                MethodOutcome { status: 200, body }
            }
            "report-status" => {
                self.stats.handled += 1;
                let _ = write!(
                    body,
                    r#"{{"output":"{}","firmware":"{}"}}"#,
                    if self.output_enabled { "on" } else { "off" },
                    crate::FIRMWARE_VERSION
                );
                MethodOutcome { status: 200, body }
            }
            _ => {
                self.stats.unknown += 1;
                warn!(method, "unknown direct method");
                // Method names are already truncated to 32 bytes; this fits.
                let _ = write!(body, r#"{{"error":"unknown method: {method}"}}"#);
                MethodOutcome { status: 404, body }
            }
        }
    }
}
