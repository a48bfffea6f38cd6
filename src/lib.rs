//! Firmware core for a battery-powered biometric sensing node.
//!
//! The node wakes, samples vitals in fixed windows, averages a full duty
//! cycle, pushes one telemetry report to an IoT-hub-style MQTT broker, and
//! goes back to deep sleep. Everything platform-specific (the broker socket,
//! the token issuance channel, the sensors, the radio, the sleep controller)
//! sits behind a trait, so the same core runs on hardware and in the
//! host-side simulator.
//!
//! ```
//! use vitalnode::{DeviceAgent, DeviceIdentity, FirmwareConfig};
//!
//! let identity = DeviceIdentity::new("hub.example.net", "dev-1", "a2V5");
//! let mut agent = DeviceAgent::new(identity, FirmwareConfig::default(), None);
//! agent.start();
//! assert!(!agent.ready_for_suspend());
//! ```

pub mod agent;
pub mod clock;
pub mod config;
pub mod console;
pub mod credential;
pub mod dispatch;
pub mod job;
pub mod lifecycle;
pub mod protocol;
pub mod retry;
pub mod transport;

pub const FIRMWARE_VERSION: &str = env!("CARGO_PKG_VERSION");

pub use agent::DeviceAgent;
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{DeviceIdentity, FirmwareConfig};
pub use console::{ConfigStore, Console, DeviceProfile, LinkStatus};
pub use credential::{CredentialProvider, TokenIssuer};
pub use dispatch::CommandDispatcher;
pub use job::{AggregationJob, CycleAverages, CycleSink, JobPhase, VitalsSource};
pub use lifecycle::{LifecycleCoordinator, NetworkBearer, PowerControl, TickSource};
pub use retry::RetryQueue;
pub use transport::{BrokerLink, ConnectFailure, ConnectionState, SessionOptions, TransportConnection};
