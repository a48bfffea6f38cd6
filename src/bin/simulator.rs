use clap::{App, Arg};
use colored::*;
use std::process;
use tracing::{info, warn};

use vitalnode::credential::{IssuerReply, TokenRequest};
use vitalnode::transport::SessionOptions;
use vitalnode::{
    BrokerLink, Clock, ConfigStore, ConnectFailure, DeviceAgent, DeviceIdentity, DeviceProfile,
    FirmwareConfig, NetworkBearer, PowerControl, SystemClock, TickSource, TokenIssuer,
    VitalsSource,
};

const DEFAULT_TICK_INTERVAL_MS: u64 = 20;

/// Sine-modulated vitals around healthy livestock baselines.
struct SimVitals {
    step: u32,
}

impl VitalsSource for SimVitals {
    fn temperature(&mut self) -> f32 {
        self.step += 1;
        38.4 + 0.3 * (self.step as f32 * 0.05).sin()
    }

    fn pulse_rate(&mut self) -> f32 {
        70.0 + 6.0 * (self.step as f32 * 0.03).cos()
    }
}

struct SimIssuer;

impl TokenIssuer for SimIssuer {
    fn request_token(&mut self, request: &TokenRequest<'_>) -> Result<IssuerReply, &'static str> {
        info!(device_id = request.device_id, "issuing simulated token");
        Ok(IssuerReply {
            status: 200,
            body: format!(
                r#"{{"data":{{"sasToken":"SharedAccessSignature sr={}%2Fdevices%2F{}&sig=simulated&se=9999999999"}}}}"#,
                request.hostname, request.device_id
            ),
        })
    }
}

/// In-memory broker. Optionally refuses the first N handshakes and injects
/// one direct-method request after the session comes up.
struct SimBroker {
    connect_failures_left: u32,
    connected: bool,
    pending_method: Option<&'static str>,
    published: u32,
}

impl SimBroker {
    fn new(flaky_connects: u32) -> Self {
        Self {
            connect_failures_left: flaky_connects,
            connected: false,
            pending_method: Some("$iothub/methods/POST/report-status/?$rid=sim-1"),
            published: 0,
        }
    }
}

impl BrokerLink for SimBroker {
    fn open_session(&mut self, options: &SessionOptions<'_>) -> Result<(), ConnectFailure> {
        if self.connect_failures_left > 0 {
            self.connect_failures_left -= 1;
            return Err(ConnectFailure::ServiceUnavailable);
        }
        info!(client_id = options.client_id, "session opened");
        self.connected = true;
        Ok(())
    }

    fn send(&mut self, topic: &str, payload: &[u8]) -> bool {
        self.published += 1;
        println!(
            "{} {} {}",
            "📡 PUBLISH".green().bold(),
            topic.cyan(),
            String::from_utf8_lossy(payload)
        );
        true
    }

    fn subscribe(&mut self, filter: &str) -> bool {
        info!(filter, "subscribed");
        true
    }

    fn poll(&mut self, sink: &mut dyn FnMut(&str, &[u8])) -> bool {
        if let Some(topic) = self.pending_method.take() {
            sink(topic, b"{}");
        }
        self.connected
    }

    fn close(&mut self) {
        self.connected = false;
    }
}

struct SimBearer;

impl NetworkBearer for SimBearer {
    fn available(&mut self) -> bool {
        true
    }
    fn disconnect(&mut self) {
        info!("bearer detached");
    }
}

struct SimTicker;

impl TickSource for SimTicker {
    fn stop(&mut self) {
        info!("tick source stopped");
    }
}

struct SimPower;

impl PowerControl for SimPower {
    fn suspend_micros(&mut self, duration_us: u64) -> ! {
        println!(
            "{} {}s",
            "💤 Deep sleep for".blue().bold(),
            duration_us / 1_000_000
        );
        process::exit(0)
    }
}

struct NullStore;

impl ConfigStore for NullStore {
    fn save(&mut self, _profile: &DeviceProfile) -> bool {
        true
    }
}

fn main() {
    tracing_subscriber::fmt::init();

    let matches = App::new("vitalnode-sim")
        .version(vitalnode::FIRMWARE_VERSION)
        .about("🐄 VitalNode firmware core - host-side duty cycle simulator")
        .arg(
            Arg::with_name("hostname")
                .long("hostname")
                .value_name("HOST")
                .help("IoT hub hostname")
                .takes_value(true)
                .default_value("hub.example.net"),
        )
        .arg(
            Arg::with_name("device-id")
                .long("device-id")
                .value_name("ID")
                .help("Device identity")
                .takes_value(true)
                .default_value("VN-02-5im"),
        )
        .arg(
            Arg::with_name("samples")
                .long("samples")
                .value_name("N")
                .help("Samples per window")
                .takes_value(true)
                .default_value("50"),
        )
        .arg(
            Arg::with_name("windows")
                .long("windows")
                .value_name("K")
                .help("Windows per cycle")
                .takes_value(true)
                .default_value("5"),
        )
        .arg(
            Arg::with_name("flaky")
                .long("flaky")
                .value_name("N")
                .help("Fail the first N broker handshakes")
                .takes_value(true)
                .default_value("0"),
        )
        .get_matches();

    let hostname = matches.value_of("hostname").unwrap_or("hub.example.net");
    let device_id = matches.value_of("device-id").unwrap_or("VN-02-5im");
    let samples: usize = matches
        .value_of("samples")
        .and_then(|v| v.parse().ok())
        .unwrap_or(50);
    let windows: usize = matches
        .value_of("windows")
        .and_then(|v| v.parse().ok())
        .unwrap_or(5);
    let flaky: u32 = matches
        .value_of("flaky")
        .and_then(|v| v.parse().ok())
        .unwrap_or(0);

    println!("{}", "🐄 VitalNode Duty Cycle Simulator".bold());
    println!("==================================");

    let mut config = FirmwareConfig::default();
    config.duty.samples_per_window = samples;
    config.duty.windows_per_cycle = windows;

    let identity = DeviceIdentity::new(hostname, device_id, "c2ltdWxhdGVkLWtleQ==");
    let mut agent = DeviceAgent::new(identity, config, None);
    let mut vitals = SimVitals { step: 0 };
    let mut broker = SimBroker::new(flaky);
    let mut issuer = SimIssuer;
    let mut bearer = SimBearer;
    let mut ticker = SimTicker;
    let mut power = SimPower;
    let clock = SystemClock::new();

    agent.start();

    while !agent.ready_for_suspend() {
        agent.tick(&mut vitals, &mut broker, &mut issuer, &clock);
        agent.poll(&mut broker, &mut issuer, &mut bearer, &clock);
        clock.delay_ms(DEFAULT_TICK_INTERVAL_MS);
    }

    let stats = agent.job().stats();
    println!(
        "{} samples={} windows={} publishes={}",
        "✅ Cycle complete".green().bold(),
        stats.samples_taken,
        stats.windows_completed,
        broker.published
    );
    if !agent.retry().is_empty() {
        warn!(queued = agent.retry().len(), "undelivered reports remain queued");
    }

    agent.shutdown(&mut ticker, &mut broker, &mut bearer, &clock, &mut power)
}
