use static_assertions::const_assert;

// Compile-time buffer capacities. Runtime configuration is clamped to these,
// never the other way around.
pub const WINDOW_CAP: usize = 64;
pub const CYCLE_CAP: usize = 8;
pub const RETRY_QUEUE_CAP: usize = 8;

pub const DEFAULT_SAMPLES_PER_WINDOW: usize = 50;
pub const DEFAULT_WINDOWS_PER_CYCLE: usize = 5;

const_assert!(WINDOW_CAP >= DEFAULT_SAMPLES_PER_WINDOW);
const_assert!(CYCLE_CAP >= DEFAULT_WINDOWS_PER_CYCLE);
const_assert!(RETRY_QUEUE_CAP >= 1);

/// Identity used for both credential issuance and the broker handshake.
#[derive(Debug, Clone)]
pub struct DeviceIdentity {
    pub hostname: String,
    pub device_id: String,
    pub primary_key: String,
}

impl DeviceIdentity {
    pub fn new(hostname: &str, device_id: &str, primary_key: &str) -> Self {
        Self {
            hostname: hostname.into(),
            device_id: device_id.into(),
            primary_key: primary_key.into(),
        }
    }

    /// Derives the device id from the MCU chip id, e.g. `VN-02-9a3f01`.
    pub fn from_chip_id(hostname: &str, chip_id: u32, primary_key: &str) -> Self {
        Self {
            hostname: hostname.into(),
            device_id: format!("VN-02-{chip_id:x}"),
            primary_key: primary_key.into(),
        }
    }
}

/// Sampling cadence and transmission budget for one duty cycle.
///
/// Field deployments have shipped with several window/cycle shapes, so these
/// are runtime values rather than constants. `samples_per_window` and
/// `windows_per_cycle` are clamped to `WINDOW_CAP` / `CYCLE_CAP`.
#[derive(Debug, Clone)]
pub struct DutyCycleConfig {
    pub samples_per_window: usize,
    pub windows_per_cycle: usize,
    /// Wall-clock budget for the whole connect-and-send attempt. Once spent,
    /// the cycle gives up and the device sleeps with the data unsent.
    pub transmit_budget_ms: u64,
    pub transmit_retry_pause_ms: u64,
    /// Reported as-is; no SpO2 transducer is wired on current hardware.
    pub default_spo2: f32,
}

impl Default for DutyCycleConfig {
    fn default() -> Self {
        Self {
            samples_per_window: DEFAULT_SAMPLES_PER_WINDOW,
            windows_per_cycle: DEFAULT_WINDOWS_PER_CYCLE,
            transmit_budget_ms: 10_000,
            transmit_retry_pause_ms: 1_000,
            default_spo2: 1.0,
        }
    }
}

#[derive(Debug, Clone)]
pub struct TransportConfig {
    pub connect_max_attempts: u8,
    pub connect_backoff_ms: u64,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            connect_max_attempts: 3,
            connect_backoff_ms: 3_000,
        }
    }
}

#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Minimum age before a queued message is re-attempted. Keeps the drain
    /// path from hot-looping on a broken link.
    pub min_spacing_ms: u64,
    /// Retry ceiling; entries past it are dropped unconditionally.
    pub max_attempts: u8,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            min_spacing_ms: 30_000,
            max_attempts: 5,
        }
    }
}

#[derive(Debug, Clone)]
pub struct CredentialConfig {
    pub ttl_s: u64,
    /// Renewal happens this long before actual expiry so a handshake never
    /// races the token going stale mid-connect.
    pub renewal_margin_s: u64,
}

impl Default for CredentialConfig {
    fn default() -> Self {
        Self {
            ttl_s: 3_600,
            renewal_margin_s: 300,
        }
    }
}

#[derive(Debug, Clone)]
pub struct LifecycleConfig {
    /// Settle interval between bearer teardown and the suspend call.
    pub settle_ms: u64,
    pub sleep_duration_us: u64,
}

impl Default for LifecycleConfig {
    fn default() -> Self {
        Self {
            settle_ms: 500,
            sleep_duration_us: 300_000_000,
        }
    }
}

/// Bundle of every tunable the firmware core takes at startup.
#[derive(Debug, Clone, Default)]
pub struct FirmwareConfig {
    pub duty: DutyCycleConfig,
    pub transport: TransportConfig,
    pub retry: RetryConfig,
    pub credential: CredentialConfig,
    pub lifecycle: LifecycleConfig,
}
