use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::info;

/// Operator-editable device settings, persisted across deep sleep.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceProfile {
    pub device_name: String,
    pub location: String,
    pub installation_date: String,
    pub wifi_ssid: String,
    pub wifi_password: String,
}

impl Default for DeviceProfile {
    fn default() -> Self {
        Self {
            device_name: "VitalNode-01".into(),
            location: "Not set".into(),
            installation_date: "Not set".into(),
            wifi_ssid: String::new(),
            wifi_password: String::new(),
        }
    }
}

/// Persistence for the device profile. `false` means the write failed and
/// the in-memory profile is the only copy.
pub trait ConfigStore {
    fn save(&mut self, profile: &DeviceProfile) -> bool;
}

/// Snapshot of the network bearer for status reporting.
#[derive(Debug, Clone, Default)]
pub struct LinkStatus {
    pub online: bool,
    pub ip_address: Option<String>,
    pub rssi_dbm: Option<i16>,
}

/// Line-oriented maintenance console, reachable over the service UART.
/// Commands are uppercase verbs with colon-separated arguments; every line
/// gets exactly one reply string.
#[derive(Debug)]
pub struct Console {
    device_id: String,
    defaults: DeviceProfile,
    profile: DeviceProfile,
}

impl Console {
    pub fn new(device_id: &str, defaults: DeviceProfile, stored: Option<DeviceProfile>) -> Self {
        let profile = stored.unwrap_or_else(|| defaults.clone());
        Self {
            device_id: device_id.to_string(),
            defaults,
            profile,
        }
    }

    pub fn profile(&self) -> &DeviceProfile {
        &self.profile
    }

    pub fn handle_line<S: ConfigStore>(
        &mut self,
        line: &str,
        store: &mut S,
        status: &LinkStatus,
        battery_volts: f32,
    ) -> String {
        let line = line.trim();
        if line == "INFO" {
            return self.info_report(status, battery_volts);
        }
        if line == "INFO_CONNECTION" {
            return serde_json::to_string_pretty(&self.connectivity_status(status))
                .unwrap_or_else(|_| "ERROR: report serialization failed".into());
        }
        if let Some(rest) = line.strip_prefix("SET_WIFI:") {
            return match rest.split_once(':') {
                Some((ssid, password)) if !ssid.is_empty() => {
                    self.profile.wifi_ssid = ssid.to_string();
                    self.profile.wifi_password = password.to_string();
                    info!(ssid, "wifi credentials staged");
                    format!("OK: WiFi set to '{ssid}' (SAVE_CONFIG to persist)")
                }
                _ => "ERROR: usage SET_WIFI:<ssid>:<password>".into(),
            };
        }
        if let Some(rest) = line.strip_prefix("SET_DEVICE:") {
            return match rest.split_once(':') {
                Some(("DEVICE_NAME", value)) if !value.is_empty() => {
                    self.profile.device_name = value.to_string();
                    format!("OK: device name set to '{value}'")
                }
                Some(("LOCATION", value)) if !value.is_empty() => {
                    self.profile.location = value.to_string();
                    format!("OK: location set to '{value}'")
                }
                Some(("INSTALLATION_DATE", value)) if !value.is_empty() => {
                    self.profile.installation_date = value.to_string();
                    format!("OK: installation date set to '{value}'")
                }
                _ => {
                    "ERROR: usage SET_DEVICE:<DEVICE_NAME|LOCATION|INSTALLATION_DATE>:<value>"
                        .into()
                }
            };
        }
        if line == "SAVE_CONFIG" {
            return if store.save(&self.profile) {
                info!("device profile persisted");
                "OK: configuration saved".into()
            } else {
                "ERROR: configuration save failed".into()
            };
        }
        if line == "RESET_CONFIG" {
            self.profile = self.defaults.clone();
            return if store.save(&self.profile) {
                "OK: configuration reset to defaults".into()
            } else {
                "ERROR: reset applied but save failed".into()
            };
        }
        format!("ERROR: unknown command '{line}'")
    }

    fn info_report(&self, status: &LinkStatus, battery_volts: f32) -> String {
        let report = json!({
            "device_info": {
                "device_id": self.device_id,
                "device_name": self.profile.device_name,
                "location": self.profile.location,
                "installation_date": self.profile.installation_date,
                "firmware_version": crate::FIRMWARE_VERSION,
            },
            "connectivity_status": self.connectivity_status(status),
            "power_status": power_status(battery_volts),
        });
        serde_json::to_string_pretty(&report)
            .unwrap_or_else(|_| "ERROR: report serialization failed".into())
    }

    fn connectivity_status(&self, status: &LinkStatus) -> serde_json::Value {
        let ssid = if self.profile.wifi_ssid.is_empty() {
            "Not set"
        } else {
            self.profile.wifi_ssid.as_str()
        };
        let (current_status, ip_address, signal_strength) = if status.online {
            (
                "Online",
                status
                    .ip_address
                    .clone()
                    .unwrap_or_else(|| "Not available".into()),
                status
                    .rssi_dbm
                    .map(|rssi| format!("{rssi} dBm"))
                    .unwrap_or_else(|| "Not available".into()),
            )
        } else {
            (
                "Offline",
                "Not available".to_string(),
                "Not available".to_string(),
            )
        };
        json!({
            "current_status": current_status,
            "connection_type": "Wi-Fi",
            "wifi_ssid": ssid,
            "ip_address": ip_address,
            "signal_strength": signal_strength,
        })
    }
}

/// Classifies the supply from the sensed voltage. Readings below 1V mean the
/// divider is unpowered and the board is running from USB.
fn power_status(volts: f32) -> serde_json::Value {
    let (power_source, charging_status, battery_level) = if volts < 1.0 {
        ("USB (External Power)", "External Power", "N/A (USB Powered)".to_string())
    } else if volts < 3.0 {
        ("Battery (Low)", "Not Charging", "Low/Critical".to_string())
    } else if volts <= 4.2 {
        let percent = ((volts - 3.0) / 1.2 * 100.0) as u32;
        ("Battery", "Not Charging", format!("{percent}%"))
    } else {
        ("External/Charging", "Charging", "100%+ (Charging)".to_string())
    };
    json!({
        "power_source": power_source,
        "battery_level": battery_level,
        "charging_status": charging_status,
        "voltage_reading": format!("{volts:.2}V"),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    struct MemoryStore {
        saved: Option<DeviceProfile>,
        ok: bool,
    }

    impl MemoryStore {
        fn working() -> Self {
            Self {
                saved: None,
                ok: true,
            }
        }
    }

    impl ConfigStore for MemoryStore {
        fn save(&mut self, profile: &DeviceProfile) -> bool {
            if self.ok {
                self.saved = Some(profile.clone());
            }
            self.ok
        }
    }

    fn console() -> Console {
        Console::new("VN-02-9a3f", DeviceProfile::default(), None)
    }

    fn offline() -> LinkStatus {
        LinkStatus::default()
    }

    #[test]
    fn info_reports_all_three_sections_without_password() {
        let mut console = console();
        let mut store = MemoryStore::working();
        let status = LinkStatus {
            online: true,
            ip_address: Some("10.0.0.7".into()),
            rssi_dbm: Some(-61),
        };

        let reply = console.handle_line("INFO", &mut store, &status, 3.9);
        let value: serde_json::Value = serde_json::from_str(&reply).unwrap();
        assert_eq!(value["device_info"]["device_id"], "VN-02-9a3f");
        assert_eq!(value["device_info"]["device_name"], "VitalNode-01");
        assert_eq!(value["connectivity_status"]["current_status"], "Online");
        assert_eq!(value["connectivity_status"]["connection_type"], "Wi-Fi");
        assert_eq!(value["connectivity_status"]["ip_address"], "10.0.0.7");
        assert_eq!(value["connectivity_status"]["signal_strength"], "-61 dBm");
        assert_eq!(value["power_status"]["voltage_reading"], "3.90V");
        assert!(!reply.contains("wifi_password"));
    }

    #[test]
    fn set_device_fields_show_up_in_info() {
        let mut console = console();
        let mut store = MemoryStore::working();

        let reply = console.handle_line(
            "SET_DEVICE:DEVICE_NAME:Barn-7",
            &mut store,
            &offline(),
            3.5,
        );
        assert!(reply.starts_with("OK"));
        console.handle_line("SET_DEVICE:LOCATION:North paddock", &mut store, &offline(), 3.5);

        let info = console.handle_line("INFO", &mut store, &offline(), 3.5);
        let value: serde_json::Value = serde_json::from_str(&info).unwrap();
        assert_eq!(value["device_info"]["device_name"], "Barn-7");
        assert_eq!(value["device_info"]["location"], "North paddock");
    }

    #[test]
    fn save_persists_and_reset_restores_defaults() {
        let mut console = console();
        let mut store = MemoryStore::working();

        console.handle_line("SET_WIFI:barn-ap:hunter2", &mut store, &offline(), 3.5);
        let reply = console.handle_line("SAVE_CONFIG", &mut store, &offline(), 3.5);
        assert!(reply.starts_with("OK"));
        assert_eq!(store.saved.as_ref().unwrap().wifi_ssid, "barn-ap");

        console.handle_line("RESET_CONFIG", &mut store, &offline(), 3.5);
        assert_eq!(console.profile(), &DeviceProfile::default());
        assert!(store.saved.as_ref().unwrap().wifi_ssid.is_empty());
    }

    #[test]
    fn malformed_and_unknown_commands_error() {
        let mut console = console();
        let mut store = MemoryStore::working();
        for line in ["SET_WIFI:", "SET_DEVICE:VOLUME:11", "FLY", "SET_WIFI::pw"] {
            let reply = console.handle_line(line, &mut store, &offline(), 3.5);
            assert!(reply.starts_with("ERROR"), "line: {line}");
        }
    }

    #[test]
    fn failed_save_is_reported() {
        let mut console = console();
        let mut store = MemoryStore {
            saved: None,
            ok: false,
        };
        let reply = console.handle_line("SAVE_CONFIG", &mut store, &offline(), 3.5);
        assert!(reply.starts_with("ERROR"));
    }

    #[test]
    fn power_classification_boundaries() {
        assert_eq!(power_status(0.2)["power_source"], "USB (External Power)");
        assert_eq!(power_status(2.5)["battery_level"], "Low/Critical");
        assert_eq!(power_status(3.0)["battery_level"], "0%");
        assert_eq!(power_status(3.6)["battery_level"], "50%");
        assert_eq!(power_status(4.2)["battery_level"], "100%");
        assert_eq!(power_status(4.5)["charging_status"], "Charging");
    }

    #[test]
    fn offline_link_reports_placeholders() {
        let mut console = console();
        let mut store = MemoryStore::working();
        let reply = console.handle_line("INFO_CONNECTION", &mut store, &offline(), 3.5);
        let value: serde_json::Value = serde_json::from_str(&reply).unwrap();
        assert_eq!(value["current_status"], "Offline");
        assert_eq!(value["connection_type"], "Wi-Fi");
        assert_eq!(value["ip_address"], "Not available");
        assert_eq!(value["signal_strength"], "Not available");
    }
}
