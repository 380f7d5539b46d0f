use serde::{Deserialize, Serialize};

use crate::types::NodeKind;

pub const DEFAULT_MQTT_PORT: u16 = 1883;
pub const DEFAULT_OTA_PORT: u16 = 8266;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    pub wifi_ssid: String,
    pub wifi_pass: String,
    pub mqtt_host: String,
    pub mqtt_port: u16,
    pub mqtt_user: String,
    pub mqtt_pass: String,
    pub wifi_poll_ms: u64,
    /// `None` blocks until the access point accepts us.
    pub wifi_timeout_ms: Option<u64>,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            wifi_ssid: String::new(),
            wifi_pass: String::new(),
            mqtt_host: "192.168.1.100".to_string(),
            mqtt_port: DEFAULT_MQTT_PORT,
            mqtt_user: String::new(),
            mqtt_pass: String::new(),
            wifi_poll_ms: 500,
            wifi_timeout_ms: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    pub retry_interval_ms: u64,
    pub max_attempts: Option<u32>,
    pub connect_timeout_ms: u64,
    pub keep_alive_secs: u64,
    pub client_id_prefix: String,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            retry_interval_ms: 5_000,
            max_attempts: None,
            connect_timeout_ms: 5_000,
            keep_alive_secs: 15,
            client_id_prefix: "home-node".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OtaConfig {
    pub hostname: String,
    pub port: u16,
    /// Empty means pushes are accepted without a password.
    pub password: String,
    pub read_timeout_ms: u64,
}

impl Default for OtaConfig {
    fn default() -> Self {
        Self {
            hostname: "home-node".to_string(),
            port: DEFAULT_OTA_PORT,
            password: String::new(),
            read_timeout_ms: 10_000,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct Calibration {
    /// Raw reading of a probe in dry air (0% moisture).
    pub air: i32,
    /// Raw reading of a probe in water (100% moisture).
    pub water: i32,
    pub enabled: bool,
}

impl Default for Calibration {
    fn default() -> Self {
        Self {
            air: 1024,
            water: 567,
            enabled: false,
        }
    }
}

impl Calibration {
    /// Span between the dry and wet readings, widened so extreme values
    /// loaded from a config file cannot overflow.
    pub fn delta(&self) -> i64 {
        i64::from(self.air) - i64::from(self.water)
    }

    pub fn moisture_percent(&self, raw: i32) -> i32 {
        let delta = self.delta();
        if delta <= 0 {
            return raw;
        }
        let percent = (i64::from(self.air) - i64::from(raw)) * 100 / delta;
        percent.clamp(i64::from(i32::MIN), i64::from(i32::MAX)) as i32
    }

    /// Value published for a raw sample: percent when enabled, raw otherwise.
    pub fn apply(&self, raw: i32) -> i32 {
        if self.enabled {
            self.moisture_percent(raw)
        } else {
            raw
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PlantsConfig {
    pub sample_interval_ms: u64,
    pub enabled_channels: u8,
    pub moisture_min: i32,
    pub moisture_max: i32,
    pub calibration: Calibration,
}

impl Default for PlantsConfig {
    fn default() -> Self {
        Self {
            sample_interval_ms: 50_000,
            enabled_channels: 2,
            moisture_min: -50,
            moisture_max: 2_000,
            calibration: Calibration::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct IrHardwareConfig {
    pub tx_pin: i32,
    pub rmt_channel: u8,
    pub carrier_khz: u32,
}

impl Default for IrHardwareConfig {
    fn default() -> Self {
        Self {
            tx_pin: 4,
            rmt_channel: 0,
            carrier_khz: 38,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BedroomConfig {
    pub sample_interval_ms: u64,
    pub ir: IrHardwareConfig,
}

impl Default for BedroomConfig {
    fn default() -> Self {
        Self {
            sample_interval_ms: 50_000,
            ir: IrHardwareConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    pub network: NetworkConfig,
    pub session: SessionConfig,
    pub ota: OtaConfig,
    pub plants: PlantsConfig,
    pub bedroom: BedroomConfig,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self::for_node(NodeKind::Plants)
    }
}

impl RuntimeConfig {
    pub fn for_node(kind: NodeKind) -> Self {
        Self {
            network: NetworkConfig::default(),
            session: SessionConfig {
                client_id_prefix: kind.hostname().to_string(),
                ..SessionConfig::default()
            },
            ota: OtaConfig {
                hostname: kind.hostname().to_string(),
                ..OtaConfig::default()
            },
            plants: PlantsConfig::default(),
            bedroom: BedroomConfig::default(),
        }
    }

    pub fn sanitize(&mut self) {
        self.network.wifi_poll_ms = self.network.wifi_poll_ms.max(10);
        self.session.retry_interval_ms = self.session.retry_interval_ms.max(100);
        self.session.connect_timeout_ms = self.session.connect_timeout_ms.max(100);
        self.session.keep_alive_secs = self.session.keep_alive_secs.max(1);
        self.ota.read_timeout_ms = self.ota.read_timeout_ms.max(100);
        self.plants.sanitize();
        self.bedroom.ir.sanitize();
    }
}

impl PlantsConfig {
    pub fn sanitize(&mut self) {
        self.enabled_channels = self.enabled_channels.clamp(1, 4);

        if self.moisture_min > self.moisture_max {
            core::mem::swap(&mut self.moisture_min, &mut self.moisture_max);
        }

        if self.calibration.delta() <= 0 {
            self.calibration.enabled = false;
        }
    }
}

impl IrHardwareConfig {
    pub fn sanitize(&mut self) {
        if self.tx_pin < 0 {
            self.tx_pin = 4;
        }

        if self.rmt_channel > 7 {
            self.rmt_channel = 0;
        }

        self.carrier_khz = self.carrier_khz.clamp(10, 100);
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn node_defaults_carry_hostname() {
        let plants = RuntimeConfig::for_node(NodeKind::Plants);
        assert_eq!(plants.ota.hostname, "ESPlant");
        assert_eq!(plants.session.client_id_prefix, "ESPlant");
        assert_eq!(plants.ota.port, 8266);
        assert_eq!(plants.network.mqtt_port, 1883);

        let bedroom = RuntimeConfig::for_node(NodeKind::Bedroom);
        assert_eq!(bedroom.ota.hostname, "ESPBedroom");
    }

    #[test]
    fn partial_json_falls_back_to_defaults() {
        let raw = r#"{
            "network": { "wifi_ssid": "garden", "mqtt_host": "10.0.0.2" },
            "plants": { "moisture_min": 300 }
        }"#;

        let config: RuntimeConfig = serde_json::from_str(raw).unwrap();

        assert_eq!(config.network.wifi_ssid, "garden");
        assert_eq!(config.network.mqtt_host, "10.0.0.2");
        assert_eq!(config.network.mqtt_port, 1883);
        assert_eq!(config.network.wifi_timeout_ms, None);
        assert_eq!(config.plants.moisture_min, 300);
        assert_eq!(config.plants.moisture_max, 2_000);
        assert_eq!(config.plants.sample_interval_ms, 50_000);
        assert_eq!(config.session.retry_interval_ms, 5_000);
    }

    #[test]
    fn sanitize_clamps_channels_and_thresholds() {
        let mut config = RuntimeConfig::default();
        config.plants.enabled_channels = 9;
        config.plants.moisture_min = 800;
        config.plants.moisture_max = 200;
        config.session.retry_interval_ms = 0;
        config.sanitize();

        assert_eq!(config.plants.enabled_channels, 4);
        assert_eq!(config.plants.moisture_min, 200);
        assert_eq!(config.plants.moisture_max, 800);
        assert_eq!(config.session.retry_interval_ms, 100);

        config.plants.enabled_channels = 0;
        config.sanitize();
        assert_eq!(config.plants.enabled_channels, 1);
    }

    #[test]
    fn calibration_is_disabled_by_default_and_when_inverted() {
        let calibration = Calibration::default();
        assert_eq!(calibration.delta(), 457);
        assert_eq!(calibration.apply(700), 700);

        let mut config = PlantsConfig {
            calibration: Calibration {
                air: 500,
                water: 600,
                enabled: true,
            },
            ..PlantsConfig::default()
        };
        config.sanitize();
        assert!(!config.calibration.enabled);
    }

    #[test]
    fn calibration_maps_air_and_water_to_percent() {
        let calibration = Calibration {
            enabled: true,
            ..Calibration::default()
        };

        assert_eq!(calibration.apply(1024), 0);
        assert_eq!(calibration.apply(567), 100);
        // (1024 - 800) * 100 / 457 = 49.01..
        assert_eq!(calibration.apply(800), 49);
    }

    #[test]
    fn extreme_calibration_values_do_not_overflow() {
        let mut config = PlantsConfig {
            calibration: Calibration {
                air: i32::MAX,
                water: -1,
                enabled: true,
            },
            ..PlantsConfig::default()
        };
        config.sanitize();
        assert!(config.calibration.enabled);
        assert_eq!(config.calibration.delta(), 1_i64 << 31);
        assert_eq!(config.calibration.apply(i32::MAX), 0);
        assert_eq!(config.calibration.apply(-1), 100);

        let narrow = Calibration {
            air: i32::MIN + 10,
            water: i32::MIN,
            enabled: true,
        };
        assert_eq!(narrow.apply(100), i32::MIN);
        assert_eq!(narrow.apply(i32::MIN), 100);
    }

    #[test]
    fn ir_sanitize_restores_defaults() {
        let mut ir = IrHardwareConfig {
            tx_pin: -1,
            rmt_channel: 12,
            carrier_khz: 500,
        };
        ir.sanitize();

        assert_eq!(
            ir,
            IrHardwareConfig {
                tx_pin: 4,
                rmt_channel: 0,
                carrier_khz: 100,
            }
        );
    }
}
