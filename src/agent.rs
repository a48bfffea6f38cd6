use tracing::warn;

use crate::clock::Clock;
use crate::config::{DeviceIdentity, FirmwareConfig};
use crate::console::{ConfigStore, Console, DeviceProfile, LinkStatus};
use crate::credential::{CredentialProvider, TokenIssuer};
use crate::dispatch::CommandDispatcher;
use crate::job::{AggregationJob, CycleAverages, CycleSink, VitalsSource};
use crate::lifecycle::{LifecycleCoordinator, NetworkBearer, PowerControl, TickSource};
use crate::protocol::{
    encode_telemetry, rfc3339_timestamp, telemetry_topic, TelemetryBuffer, TelemetryReport,
    TopicBuffer,
};
use crate::retry::RetryQueue;
use crate::transport::{BrokerLink, TransportConnection};

/// Delivery path for one cycle report: connect on demand, encode, publish.
/// Borrowed together from the agent so the job can drive it without the job
/// knowing anything about brokers or credentials.
struct TelemetryUplink<'a, L, I, C> {
    transport: &'a mut TransportConnection,
    link: &'a mut L,
    credentials: &'a mut CredentialProvider,
    issuer: &'a mut I,
    retry: &'a mut RetryQueue,
    clock: &'a C,
}

impl<L, I, C> TelemetryUplink<'_, L, I, C>
where
    L: BrokerLink,
    I: TokenIssuer,
    C: Clock,
{
    fn encode(&self, averages: &CycleAverages) -> Option<(TopicBuffer, TelemetryBuffer)> {
        let device_id = &self.credentials.identity().device_id;
        let topic = match telemetry_topic(device_id) {
            Ok(topic) => topic,
            Err(err) => {
                warn!(error = %err, "telemetry topic construction failed");
                return None;
            }
        };
        let report = TelemetryReport {
            device_id,
            pulse_rate: averages.pulse_rate,
            temperature: averages.temperature,
            spo2: averages.spo2,
            timestamp: self.clock.unix_time().and_then(rfc3339_timestamp),
        };
        match encode_telemetry(&report) {
            Ok(payload) => Some((topic, payload)),
            Err(err) => {
                warn!(error = %err, "telemetry encoding failed");
                None
            }
        }
    }
}

impl<L, I, C> CycleSink for TelemetryUplink<'_, L, I, C>
where
    L: BrokerLink,
    I: TokenIssuer,
    C: Clock,
{
    fn try_send(&mut self, averages: &CycleAverages) -> bool {
        if !self
            .transport
            .connect(self.link, self.credentials, self.issuer, self.clock)
        {
            return false;
        }
        let Some((topic, payload)) = self.encode(averages) else {
            return false;
        };
        self.transport.publish(self.link, &topic, payload.as_bytes())
    }

    fn queue_for_retry(&mut self, averages: &CycleAverages) {
        if let Some((topic, payload)) = self.encode(averages) {
            self.retry
                .enqueue(&topic, payload.as_bytes(), self.clock.now_ms());
        }
    }
}

/// Top-level firmware core. Owns every stateful component; the platform
/// collaborators (link, issuer, sensors, bearer, power) are borrowed per
/// call so the same agent runs against hardware and against test doubles.
pub struct DeviceAgent {
    credentials: CredentialProvider,
    transport: TransportConnection,
    retry: RetryQueue,
    dispatcher: CommandDispatcher,
    job: AggregationJob,
    coordinator: LifecycleCoordinator,
    console: Console,
}

impl DeviceAgent {
    pub fn new(
        identity: DeviceIdentity,
        config: FirmwareConfig,
        stored_profile: Option<DeviceProfile>,
    ) -> Self {
        let console = Console::new(&identity.device_id, DeviceProfile::default(), stored_profile);
        Self {
            credentials: CredentialProvider::new(identity, config.credential),
            transport: TransportConnection::new(config.transport),
            retry: RetryQueue::new(config.retry),
            dispatcher: CommandDispatcher::new(),
            job: AggregationJob::new(config.duty),
            coordinator: LifecycleCoordinator::new(config.lifecycle),
            console,
        }
    }

    /// Kicks off the duty cycle. Called once after boot.
    pub fn start(&mut self) {
        self.job.start_job();
    }

    pub fn job(&self) -> &AggregationJob {
        &self.job
    }

    pub fn dispatcher(&self) -> &CommandDispatcher {
        &self.dispatcher
    }

    pub fn retry(&self) -> &RetryQueue {
        &self.retry
    }

    pub fn transport(&self) -> &TransportConnection {
        &self.transport
    }

    pub fn ready_for_suspend(&self) -> bool {
        self.coordinator.is_ready_for_suspend(&self.job)
    }

    /// One sampling step, driven by the tick source.
    pub fn tick<S, L, I, C>(&mut self, source: &mut S, link: &mut L, issuer: &mut I, clock: &C)
    where
        S: VitalsSource,
        L: BrokerLink,
        I: TokenIssuer,
        C: Clock,
    {
        let Self {
            credentials,
            transport,
            retry,
            job,
            ..
        } = self;
        let mut uplink = TelemetryUplink {
            transport,
            link,
            credentials,
            issuer,
            retry,
            clock,
        };
        job.tick(source, &mut uplink, clock);
    }

    /// One idle step, driven by the main loop: keep-alive poll, direct-method
    /// dispatch, deferred retry delivery.
    pub fn poll<L, I, B, C>(&mut self, link: &mut L, issuer: &mut I, bearer: &mut B, clock: &C)
    where
        L: BrokerLink,
        I: TokenIssuer,
        B: NetworkBearer,
        C: Clock,
    {
        if !bearer.available() {
            self.transport.mark_lost();
            return;
        }

        for message in self.transport.poll(link) {
            if let Some(reply) = self.dispatcher.dispatch(&message) {
                if !self
                    .transport
                    .publish(link, &reply.topic, reply.body.as_bytes())
                {
                    warn!(topic = %reply.topic, "method response publish failed");
                }
            }
        }

        if !self.retry.is_empty() && !self.transport.is_connected() {
            self.transport
                .connect(link, &mut self.credentials, issuer, clock);
        }
        self.retry.drain(&mut self.transport, link, clock.now_ms());
    }

    /// Tears the stack down and suspends. Never returns.
    pub fn shutdown<T, L, B, C, P>(
        &mut self,
        ticker: &mut T,
        link: &mut L,
        bearer: &mut B,
        clock: &C,
        power: &mut P,
    ) -> !
    where
        T: TickSource,
        L: BrokerLink,
        B: NetworkBearer,
        C: Clock,
        P: PowerControl,
    {
        self.coordinator
            .shutdown(ticker, &mut self.transport, link, bearer, clock, power)
    }

    pub fn handle_console_line<S: ConfigStore>(
        &mut self,
        line: &str,
        store: &mut S,
        status: &LinkStatus,
        battery_volts: f32,
    ) -> String {
        self.console.handle_line(line, store, status, battery_volts)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::config::DutyCycleConfig;
    use crate::credential::{IssuerReply, TokenRequest};
    use crate::job::JobPhase;
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

    struct StubBearer {
        up: bool,
    }

    impl NetworkBearer for StubBearer {
        fn available(&mut self) -> bool {
            self.up
        }
        fn disconnect(&mut self) {}
    }

    struct ConstantVitals;

    impl VitalsSource for ConstantVitals {
        fn temperature(&mut self) -> f32 {
            38.5
        }
        fn pulse_rate(&mut self) -> f32 {
            72.0
        }
    }

    #[derive(Default)]
    struct MemoryLink {
        sent: Vec<(String, Vec<u8>)>,
        inbound: Vec<(String, Vec<u8>)>,
    }

    impl BrokerLink for MemoryLink {
        fn open_session(&mut self, _options: &SessionOptions<'_>) -> Result<(), ConnectFailure> {
            Ok(())
        }
        fn send(&mut self, topic: &str, payload: &[u8]) -> bool {
            self.sent.push((topic.to_string(), payload.to_vec()));
            true
        }
        fn subscribe(&mut self, _filter: &str) -> bool {
            true
        }
        fn poll(&mut self, sink: &mut dyn FnMut(&str, &[u8])) -> bool {
            for (topic, payload) in self.inbound.drain(..) {
                sink(&topic, &payload);
            }
            true
        }
        fn close(&mut self) {}
    }

    fn agent() -> DeviceAgent {
        let config = FirmwareConfig {
            duty: DutyCycleConfig {
                samples_per_window: 2,
                windows_per_cycle: 2,
                ..DutyCycleConfig::default()
            },
            ..FirmwareConfig::default()
        };
        DeviceAgent::new(
            DeviceIdentity::new("hub.example.net", "dev-1", "a2V5"),
            config,
            None,
        )
    }

    #[test]
    fn duty_cycle_publishes_telemetry_and_becomes_ready() {
        let mut agent = agent();
        let mut link = MemoryLink::default();
        let clock = ManualClock::new();
        clock.set_unix_time(Some(1_700_000_000));

        agent.start();
        for _ in 0..4 {
            agent.tick(&mut ConstantVitals, &mut link, &mut StubIssuer, &clock);
        }

        assert!(agent.ready_for_suspend());
        assert_eq!(link.sent.len(), 1);
        let (topic, payload) = &link.sent[0];
        assert_eq!(topic, "devices/dev-1/messages/events/");
        let value: serde_json::Value = serde_json::from_slice(payload).unwrap();
        assert_eq!(value["deviceId"], "dev-1");
        assert_eq!(value["pulseRate"], 72.0);
        assert!(value["timestamp"].as_str().unwrap().starts_with("2023-11-1"));
    }

    #[test]
    fn poll_dispatches_methods_and_publishes_replies() {
        let mut agent = agent();
        let mut link = MemoryLink::default();
        let clock = ManualClock::new();
        let mut bearer = StubBearer { up: true };

        agent.start();
        agent.tick(&mut ConstantVitals, &mut link, &mut StubIssuer, &clock);
        // First window is still filling; force the connection via a full cycle.
        for _ in 0..3 {
            agent.tick(&mut ConstantVitals, &mut link, &mut StubIssuer, &clock);
        }
        link.sent.clear();

        link.inbound.push((
            "$iothub/methods/POST/activate-output/?$rid=5".into(),
            b"{}".to_vec(),
        ));
        agent.poll(&mut link, &mut StubIssuer, &mut bearer, &clock);

        assert!(agent.dispatcher().output_enabled());
        assert_eq!(link.sent.len(), 1);
        assert_eq!(link.sent[0].0, "$iothub/methods/res/200/?$rid=5");
    }

    #[test]
    fn bearer_loss_marks_the_session_lost() {
        let mut agent = agent();
        let mut link = MemoryLink::default();
        let clock = ManualClock::new();
        let mut bearer = StubBearer { up: true };

        agent.start();
        for _ in 0..4 {
            agent.tick(&mut ConstantVitals, &mut link, &mut StubIssuer, &clock);
        }
        assert!(agent.transport().is_connected());

        bearer.up = false;
        agent.poll(&mut link, &mut StubIssuer, &mut bearer, &clock);
        assert!(!agent.transport().is_connected());
    }

    #[test]
    fn console_lines_are_routed() {
        struct NullStore;
        impl ConfigStore for NullStore {
            fn save(&mut self, _profile: &DeviceProfile) -> bool {
                true
            }
        }

        let mut agent = agent();
        let reply =
            agent.handle_console_line("INFO", &mut NullStore, &LinkStatus::default(), 3.8);
        assert!(reply.contains("device_info"));
        assert_eq!(agent.job().phase(), JobPhase::Idle);
    }
}
