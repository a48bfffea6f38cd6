use arrayvec::ArrayString;
use core::fmt::Write;
use tracing::{debug, info, warn};

use crate::clock::Clock;
use crate::config::TransportConfig;
use crate::credential::{CredentialProvider, TokenIssuer};
use crate::protocol::{
    self, TopicBuffer, API_VERSION, MAX_INBOUND_PAYLOAD_LEN, METHOD_POST_FILTER,
};

const MAX_USERNAME_LEN: usize = 160;

/// Inbound messages buffered per keep-alive poll. Anything beyond this in a
/// single poll is dropped; the hub redelivers direct methods on timeout.
pub const MAX_INBOUND_PER_POLL: usize = 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Failed(ConnectFailure),
}

/// Broker rejection taxonomy. Diagnostics only, with one exception:
/// `CredentialRejected` triggers a credential renewal during `connect`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectFailure {
    ProtocolUnsupported,
    IdentityRejected,
    ServiceUnavailable,
    CredentialRejected,
    NotAuthorized,
    NetworkLost,
    Timeout,
    Unknown,
}

#[derive(Debug)]
pub struct SessionOptions<'a> {
    pub client_id: &'a str,
    pub username: &'a str,
    pub password: &'a str,
}

/// Raw encrypted pub/sub session owned by the platform layer. The firmware
/// core drives it exclusively through `TransportConnection`.
pub trait BrokerLink {
    fn open_session(&mut self, options: &SessionOptions<'_>) -> Result<(), ConnectFailure>;

    fn send(&mut self, topic: &str, payload: &[u8]) -> bool;

    fn subscribe(&mut self, filter: &str) -> bool;

    /// Delivers pending inbound messages to `sink`. Returns `false` when the
    /// session has been lost.
    fn poll(&mut self, sink: &mut dyn FnMut(&str, &[u8])) -> bool;

    fn close(&mut self);
}

/// Inbound message copied into fixed buffers. Oversized topics and payloads
/// are truncated, not rejected; handling runs where stack is scarcest.
#[derive(Debug, Clone)]
pub struct Inbound {
    pub topic: TopicBuffer,
    pub payload: heapless::Vec<u8, MAX_INBOUND_PAYLOAD_LEN>,
}

impl Inbound {
    fn bounded(topic: &str, payload: &[u8]) -> Self {
        let mut bounded_payload = heapless::Vec::new();
        let take = payload.len().min(MAX_INBOUND_PAYLOAD_LEN);
        // Infallible: `take` never exceeds capacity.
        let _ = bounded_payload.extend_from_slice(&payload[..take]);
        Self {
            topic: protocol::truncated(topic),
            payload: bounded_payload,
        }
    }
}

/// Connect/reconnect state machine over a `BrokerLink`.
///
/// `connect` and `poll` can be invoked from both the timer callback and the
/// main loop; the in-progress flags reject the overlapping call outright
/// rather than nesting it on the limited call stack.
#[derive(Debug)]
pub struct TransportConnection {
    state: ConnectionState,
    config: TransportConfig,
    connect_in_progress: bool,
    poll_in_progress: bool,
}

impl TransportConnection {
    pub fn new(config: TransportConfig) -> Self {
        Self {
            state: ConnectionState::Disconnected,
            config,
            connect_in_progress: false,
            poll_in_progress: false,
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn is_connected(&self) -> bool {
        self.state == ConnectionState::Connected
    }

    /// Establishes the session, renewing the credential once if the broker
    /// rejects it. Bounded: at most `connect_max_attempts` handshakes with a
    /// fixed backoff in between, then the caller decides whether to try again
    /// next tick. A no-op returning `true` when already connected.
    pub fn connect<L: BrokerLink, I: TokenIssuer, C: Clock>(
        &mut self,
        link: &mut L,
        credentials: &mut CredentialProvider,
        issuer: &mut I,
        clock: &C,
    ) -> bool {
        if self.is_connected() {
            return true;
        }
        if self.connect_in_progress {
            warn!("connect invoked reentrantly; rejecting");
            return false;
        }
        self.connect_in_progress = true;
        self.state = ConnectionState::Connecting;

        let mut renewed = false;
        let mut last_failure = ConnectFailure::Unknown;
        let max_attempts = self.config.connect_max_attempts;

        for attempt in 1..=max_attempts {
            match credentials.acquire(issuer, clock.now_ms()) {
                Ok(credential) => {
                    let token = credential.token.clone();
                    let identity = credentials.identity();
                    let mut username = ArrayString::<MAX_USERNAME_LEN>::new();
                    let _ = write!(
                        username,
                        "{}/{}/?api-version={}",
                        identity.hostname, identity.device_id, API_VERSION
                    );
                    let options = SessionOptions {
                        client_id: &identity.device_id,
                        username: &username,
                        password: &token,
                    };

                    match link.open_session(&options) {
                        Ok(()) => {
                            self.state = ConnectionState::Connected;
                            if !link.subscribe(METHOD_POST_FILTER) {
                                warn!(filter = METHOD_POST_FILTER, "method subscription refused");
                            }
                            self.connect_in_progress = false;
                            info!(attempt, "broker session established");
                            return true;
                        }
                        Err(failure) => {
                            warn!(?failure, attempt, "broker handshake failed");
                            last_failure = failure;
                            if failure == ConnectFailure::CredentialRejected && !renewed {
                                credentials.invalidate();
                                renewed = true;
                            }
                        }
                    }
                }
                Err(err) => {
                    warn!(error = %err, attempt, "credential acquisition failed");
                    last_failure = ConnectFailure::CredentialRejected;
                }
            }

            if attempt < max_attempts {
                clock.delay_ms(self.config.connect_backoff_ms);
            }
        }

        self.state = ConnectionState::Failed(last_failure);
        self.connect_in_progress = false;
        false
    }

    /// Best-effort publish. `false` when disconnected or the send fails;
    /// callers queue the message for retry instead of blocking.
    pub fn publish<L: BrokerLink>(&mut self, link: &mut L, topic: &str, payload: &[u8]) -> bool {
        if !self.is_connected() {
            debug!(topic, "publish skipped; not connected");
            return false;
        }
        let sent = link.send(topic, payload);
        if !sent {
            warn!(topic, "publish failed");
        }
        sent
    }

    /// Keep-alive poll. Collects inbound messages into a bounded batch and
    /// detects session loss. Rejected outright when invoked reentrantly.
    pub fn poll<L: BrokerLink>(&mut self, link: &mut L) -> heapless::Vec<Inbound, MAX_INBOUND_PER_POLL> {
        let mut inbound: heapless::Vec<Inbound, MAX_INBOUND_PER_POLL> = heapless::Vec::new();
        if self.poll_in_progress {
            warn!("poll invoked reentrantly; rejecting");
            return inbound;
        }
        if !self.is_connected() {
            return inbound;
        }
        self.poll_in_progress = true;

        let alive = link.poll(&mut |topic, payload| {
            if inbound.push(Inbound::bounded(topic, payload)).is_err() {
                warn!(topic, "inbound burst exceeded poll buffer; message dropped");
            }
        });
        if !alive {
            info!("keep-alive poll detected session loss");
            self.state = ConnectionState::Disconnected;
        }

        self.poll_in_progress = false;
        inbound
    }

    pub fn disconnect<L: BrokerLink>(&mut self, link: &mut L) {
        if self.state != ConnectionState::Disconnected {
            info!("closing broker session");
        }
        link.close();
        self.state = ConnectionState::Disconnected;
    }

    /// Drops session state when the network bearer disappears underneath it.
    pub fn mark_lost(&mut self) {
        if self.is_connected() {
            warn!("network bearer lost; discarding session state");
            self.state = ConnectionState::Failed(ConnectFailure::NetworkLost);
        }
    }
}
