use arrayvec::ArrayString;
use serde::Serialize;
use tracing::{debug, warn};

use crate::config::{RetryConfig, RETRY_QUEUE_CAP};
use crate::protocol::{MAX_TELEMETRY_LEN, MAX_TOPIC_LEN};
use crate::transport::{BrokerLink, TransportConnection};

/// A publish that failed and is waiting for re-delivery. Destroyed on
/// successful re-publish or when the retry ceiling is exceeded.
#[derive(Debug, Clone)]
pub struct OutboundMessage {
    pub topic: ArrayString<MAX_TOPIC_LEN>,
    pub payload: heapless::Vec<u8, MAX_TELEMETRY_LEN>,
    pub enqueued_at_ms: u64,
    pub retry_count: u8,
}

impl OutboundMessage {
    fn bounded(topic: &str, payload: &[u8], now_ms: u64) -> Option<Self> {
        let topic = ArrayString::from(topic).ok()?;
        let mut bounded_payload = heapless::Vec::new();
        bounded_payload.extend_from_slice(payload).ok()?;
        Some(Self {
            topic,
            payload: bounded_payload,
            enqueued_at_ms: now_ms,
            retry_count: 0,
        })
    }
}

#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct RetryStats {
    pub enqueued: u32,
    pub delivered: u32,
    pub dropped_overflow: u32,
    pub dropped_exhausted: u32,
    pub rejected_oversize: u32,
}

/// Bounded FIFO of messages that failed to publish. Lossy by design: when
/// full, the oldest entry is evicted to admit a new one, and entries past the
/// retry ceiling are dropped. Delivery is best-effort, never guaranteed.
#[derive(Debug)]
pub struct RetryQueue {
    entries: heapless::Vec<OutboundMessage, RETRY_QUEUE_CAP>,
    config: RetryConfig,
    stats: RetryStats,
}

impl RetryQueue {
    pub fn new(config: RetryConfig) -> Self {
        Self {
            entries: heapless::Vec::new(),
            config,
            stats: RetryStats::default(),
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn stats(&self) -> &RetryStats {
        &self.stats
    }

    pub fn entries(&self) -> &[OutboundMessage] {
        &self.entries
    }

    /// Appends a failed message. Never blocks: at capacity the head (oldest)
    /// is evicted first. Messages that do not fit the fixed buffers are
    /// rejected outright; truncating JSON would only corrupt it.
    pub fn enqueue(&mut self, topic: &str, payload: &[u8], now_ms: u64) {
        let Some(message) = OutboundMessage::bounded(topic, payload, now_ms) else {
            warn!(topic, "oversized message rejected by retry queue");
            self.stats.rejected_oversize += 1;
            return;
        };
        if self.entries.is_full() {
            self.entries.remove(0);
            self.stats.dropped_overflow += 1;
            warn!("retry queue full; evicted oldest entry");
        }
        // Cannot fail: eviction above guarantees a free slot.
        let _ = self.entries.push(message);
        self.stats.enqueued += 1;
    }

    /// Re-attempts queued messages in insertion order. Runs from the idle
    /// poll path, only while connected. Entries younger than the minimum
    /// spacing are skipped so a broken link is not hammered.
    pub fn drain<L: BrokerLink>(
        &mut self,
        transport: &mut TransportConnection,
        link: &mut L,
        now_ms: u64,
    ) {
        if !transport.is_connected() {
            return;
        }

        let mut index = 0;
        while index < self.entries.len() {
            let age_ms = now_ms.saturating_sub(self.entries[index].enqueued_at_ms);
            if age_ms < self.config.min_spacing_ms {
                index += 1;
                continue;
            }

            let delivered = {
                let entry = &self.entries[index];
                transport.publish(link, &entry.topic, &entry.payload)
            };

            if delivered {
                debug!(topic = %self.entries[index].topic, "queued message delivered");
                self.entries.remove(index);
                self.stats.delivered += 1;
                continue;
            }

            let entry = &mut self.entries[index];
            entry.retry_count += 1;
            entry.enqueued_at_ms = now_ms;
            if entry.retry_count > self.config.max_attempts {
                warn!(
                    topic = %entry.topic,
                    retries = entry.retry_count,
                    "retry ceiling exceeded; dropping message"
                );
                self.entries.remove(index);
                self.stats.dropped_exhausted += 1;
            } else {
                index += 1;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::config::{CredentialConfig, DeviceIdentity, TransportConfig};
    use crate::credential::{CredentialProvider, IssuerReply, TokenIssuer, TokenRequest};
    use crate::transport::{ConnectFailure, SessionOptions};

    struct StubIssuer;

    impl TokenIssuer for StubIssuer {
        fn request_token(
            &mut self,
            _request: &TokenRequest<'_>,
        ) -> Result<IssuerReply, &'static str> {
            Ok(IssuerReply {
                status: 200,
                body: r#"{"data":{"sasToken":"token"}}"#.into(),
            })
        }
    }

    struct FlakyLink {
        send_ok: bool,
        sent: Vec<String>,
    }

    impl BrokerLink for FlakyLink {
        fn open_session(&mut self, _options: &SessionOptions<'_>) -> Result<(), ConnectFailure> {
            Ok(())
        }
        fn send(&mut self, topic: &str, _payload: &[u8]) -> bool {
            if self.send_ok {
                self.sent.push(topic.to_string());
            }
            self.send_ok
        }
        fn subscribe(&mut self, _filter: &str) -> bool {
            true
        }
        fn poll(&mut self, _sink: &mut dyn FnMut(&str, &[u8])) -> bool {
            true
        }
        fn close(&mut self) {}
    }

    fn connected_transport(link: &mut FlakyLink) -> TransportConnection {
        let mut transport = TransportConnection::new(TransportConfig::default());
        let mut creds = CredentialProvider::new(
            DeviceIdentity::new("hub.example.net", "dev-1", "a2V5"),
            CredentialConfig::default(),
        );
        assert!(transport.connect(link, &mut creds, &mut StubIssuer, &ManualClock::new()));
        transport
    }

    fn config() -> RetryConfig {
        RetryConfig {
            min_spacing_ms: 30_000,
            max_attempts: 2,
        }
    }

    #[test]
    fn length_never_exceeds_capacity_and_oldest_is_evicted() {
        let mut queue = RetryQueue::new(config());
        for i in 0..RETRY_QUEUE_CAP + 3 {
            let topic = format!("t/{i}");
            queue.enqueue(&topic, b"{}", 0);
            assert!(queue.len() <= RETRY_QUEUE_CAP);
        }
        assert_eq!(queue.len(), RETRY_QUEUE_CAP);
        assert_eq!(queue.stats().dropped_overflow, 3);
        // The three oldest are the ones missing.
        assert_eq!(queue.entries()[0].topic.as_str(), "t/3");
    }

    #[test]
    fn drain_respects_minimum_spacing() {
        let mut queue = RetryQueue::new(config());
        let mut link = FlakyLink {
            send_ok: true,
            sent: Vec::new(),
        };
        let mut transport = connected_transport(&mut link);

        queue.enqueue("t/young", b"{}", 10_000);
        queue.drain(&mut transport, &mut link, 20_000);
        assert_eq!(queue.len(), 1);
        assert!(link.sent.is_empty());

        queue.drain(&mut transport, &mut link, 40_000);
        assert!(queue.is_empty());
        assert_eq!(link.sent, vec!["t/young".to_string()]);
    }

    #[test]
    fn failed_retry_resets_spacing_and_ceiling_drops_entry() {
        let mut queue = RetryQueue::new(config());
        let mut link = FlakyLink {
            send_ok: false,
            sent: Vec::new(),
        };
        let mut transport = connected_transport(&mut link);

        queue.enqueue("t/doomed", b"{}", 0);

        // Attempt 1 fails; timestamp resets so the entry is not immediately due.
        queue.drain(&mut transport, &mut link, 30_000);
        assert_eq!(queue.len(), 1);
        assert_eq!(queue.entries()[0].retry_count, 1);
        queue.drain(&mut transport, &mut link, 30_001);
        assert_eq!(queue.entries()[0].retry_count, 1);

        // Attempt 2 fails, then attempt 3 exceeds the ceiling of 2.
        queue.drain(&mut transport, &mut link, 60_000);
        assert_eq!(queue.entries()[0].retry_count, 2);
        queue.drain(&mut transport, &mut link, 90_000);
        assert!(queue.is_empty());
        assert_eq!(queue.stats().dropped_exhausted, 1);

        // Gone for good.
        queue.drain(&mut transport, &mut link, 300_000);
        assert!(queue.is_empty());
    }

    #[test]
    fn drain_is_noop_while_disconnected() {
        let mut queue = RetryQueue::new(config());
        let mut link = FlakyLink {
            send_ok: true,
            sent: Vec::new(),
        };
        let mut transport = TransportConnection::new(TransportConfig::default());

        queue.enqueue("t/waiting", b"{}", 0);
        queue.drain(&mut transport, &mut link, 100_000);
        assert_eq!(queue.len(), 1);
        assert!(link.sent.is_empty());
    }

    #[test]
    fn oversized_submissions_are_rejected_not_truncated() {
        let mut queue = RetryQueue::new(config());
        let huge_payload = vec![b'x'; MAX_TELEMETRY_LEN + 1];
        queue.enqueue("t/big", &huge_payload, 0);
        assert!(queue.is_empty());
        assert_eq!(queue.stats().rejected_oversize, 1);

        let huge_topic = "t/".repeat(MAX_TOPIC_LEN);
        queue.enqueue(&huge_topic, b"{}", 0);
        assert!(queue.is_empty());
        assert_eq!(queue.stats().rejected_oversize, 2);
    }
}
