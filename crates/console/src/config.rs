//! TOML config file loading and validation for the device registry and the
//! numeric limits applied to outbound device configuration, plus the broker
//! settings taken from the environment.

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::env;

// ---------------------------------------------------------------------------
// Config file structures
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub devices: Vec<DeviceEntry>,
    #[serde(default)]
    pub limits: Limits,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DeviceEntry {
    pub device_id: String,
    pub instances: u32,
    /// Whether the UI should offer weight-control settings for this group.
    #[serde(default)]
    pub weight_control: bool,
}

/// Inclusive range plus the value assumed before a device reports one.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Bound {
    pub min: f64,
    pub max: f64,
    pub default: f64,
}

impl Bound {
    pub const fn new(min: f64, max: f64, default: f64) -> Self {
        Self { min, max, default }
    }

    /// NaN clamps to `min`.
    pub fn clamp(&self, value: f64) -> f64 {
        if value.is_nan() {
            return self.min;
        }
        value.max(self.min).min(self.max)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Limits {
    /// Minutes.
    pub heartbeat_interval: Bound,
    pub target_weight_change: Bound,
    pub tolerance_weight: Bound,
    pub tolerance_duration_ms: Bound,
    pub weight_read_interval_ms: Bound,
}

impl Default for Limits {
    fn default() -> Self {
        Self {
            heartbeat_interval: Bound::new(0.1, 20.0, 5.0),
            target_weight_change: Bound::new(0.1, 5000.0, 50.0),
            tolerance_weight: Bound::new(0.1, 1000.0, 5.0),
            tolerance_duration_ms: Bound::new(1000.0, 600_000.0, 30_000.0),
            weight_read_interval_ms: Bound::new(100.0, 60_000.0, 1000.0),
        }
    }
}

impl Limits {
    fn named(&self) -> [(&'static str, &Bound); 5] {
        [
            ("heartbeat_interval", &self.heartbeat_interval),
            ("target_weight_change", &self.target_weight_change),
            ("tolerance_weight", &self.tolerance_weight),
            ("tolerance_duration_ms", &self.tolerance_duration_ms),
            ("weight_read_interval_ms", &self.weight_read_interval_ms),
        ]
    }
}

/// Upper bound on instances per device group; guards against typos like
/// `instances = 1000`.
const MAX_INSTANCES: u32 = 64;

// ---------------------------------------------------------------------------
// Validation
// ---------------------------------------------------------------------------

impl Config {
    /// Validate all config entries. Returns `Ok(())` or an error describing
    /// every violation found (not just the first one).
    pub fn validate(&self) -> Result<()> {
        let mut errors: Vec<String> = Vec::new();

        self.validate_devices(&mut errors);
        self.validate_limits(&mut errors);

        if errors.is_empty() {
            Ok(())
        } else {
            bail!(
                "config validation failed ({} error{}):\n  - {}",
                errors.len(),
                if errors.len() == 1 { "" } else { "s" },
                errors.join("\n  - ")
            );
        }
    }

    fn validate_devices(&self, errors: &mut Vec<String>) {
        let mut seen_ids: HashSet<&str> = HashSet::new();

        for (i, d) in self.devices.iter().enumerate() {
            let ctx = || {
                if d.device_id.is_empty() {
                    format!("devices[{i}]")
                } else {
                    format!("device '{}'", d.device_id)
                }
            };

            if d.device_id.trim().is_empty() {
                errors.push(format!("{}: device_id is empty", ctx()));
            } else if d.device_id.contains(['/', '+', '#']) {
                errors.push(format!(
                    "{}: device_id must not contain '/', '+' or '#'",
                    ctx()
                ));
            } else if !seen_ids.insert(&d.device_id) {
                errors.push(format!("{}: duplicate device_id", ctx()));
            }

            if d.instances == 0 || d.instances > MAX_INSTANCES {
                errors.push(format!(
                    "{}: instances {} out of range [1, {MAX_INSTANCES}]",
                    ctx(),
                    d.instances
                ));
            }
        }
    }

    fn validate_limits(&self, errors: &mut Vec<String>) {
        for (name, b) in self.limits.named() {
            if !(b.min.is_finite() && b.max.is_finite() && b.default.is_finite()) {
                errors.push(format!("limits.{name}: values must be finite numbers"));
                continue;
            }
            if b.min > b.max {
                errors.push(format!(
                    "limits.{name}: min ({}) is greater than max ({})",
                    b.min, b.max
                ));
            } else if !(b.min..=b.max).contains(&b.default) {
                errors.push(format!(
                    "limits.{name}: default {} outside [{}, {}]",
                    b.default, b.min, b.max
                ));
            }
        }
    }

    /// `device_id -> instance count`, the static device registry.
    pub fn device_counts(&self) -> BTreeMap<String, u32> {
        self.devices
            .iter()
            .map(|d| (d.device_id.clone(), d.instances))
            .collect()
    }

    pub fn weight_control_enabled(&self, device_id: &str) -> bool {
        self.devices
            .iter()
            .any(|d| d.device_id == device_id && d.weight_control)
    }
}

// ---------------------------------------------------------------------------
// Load
// ---------------------------------------------------------------------------

/// Read, parse, and validate a TOML config file.
pub fn load(path: &str) -> Result<Config> {
    let contents =
        std::fs::read_to_string(path).with_context(|| format!("failed to read config: {path}"))?;
    let config: Config =
        toml::from_str(&contents).with_context(|| format!("failed to parse config: {path}"))?;
    config
        .validate()
        .with_context(|| format!("invalid config: {path}"))?;
    Ok(config)
}

// ---------------------------------------------------------------------------
// Broker settings (environment)
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct BrokerSettings {
    pub host: String,
    pub port: u16,
    pub client_id: String,
    pub credentials: Option<(String, String)>,
}

impl BrokerSettings {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| env::var(key).ok())
    }

    pub fn from_lookup(var: impl Fn(&str) -> Option<String>) -> Self {
        let credentials = match (var("MQTT_USERNAME"), var("MQTT_PASSWORD")) {
            (Some(user), Some(pass)) => Some((user, pass)),
            (Some(user), None) => Some((user, String::new())),
            _ => None,
        };
        Self {
            host: var("MQTT_HOST").unwrap_or_else(|| "127.0.0.1".to_string()),
            port: var("MQTT_PORT")
                .and_then(|s| s.parse().ok())
                .unwrap_or(1883),
            client_id: var("MQTT_CLIENT_ID").unwrap_or_else(|| "irrigation-console".to_string()),
            credentials,
        }
    }
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn valid_device() -> DeviceEntry {
        DeviceEntry {
            device_id: "esp32-DEE3".into(),
            instances: 2,
            weight_control: true,
        }
    }

    fn valid_config() -> Config {
        Config {
            devices: vec![valid_device()],
            limits: Limits::default(),
        }
    }

    /// Assert validation fails and the error message contains `needle`.
    fn assert_validation_err(cfg: &Config, needle: &str) {
        let err = cfg.validate().unwrap_err();
        let msg = format!("{err:#}");
        assert!(
            msg.contains(needle),
            "expected error containing {needle:?}, got: {msg}"
        );
    }

    // -- Parsing ----------------------------------------------------------

    #[test]
    fn parse_minimal_config() {
        let toml_str = r#"
[[devices]]
device_id = "esp32-DEE3"
instances = 2
weight_control = true

[[devices]]
device_id = "esp32-aircon-015C"
instances = 1
"#;
        let config: Config = toml::from_str(toml_str).unwrap();
        assert_eq!(config.devices.len(), 2);
        assert!(config.devices[0].weight_control);
        assert!(!config.devices[1].weight_control);
        assert_eq!(config.limits, Limits::default());
    }

    #[test]
    fn parse_partial_limits_keeps_other_defaults() {
        let toml_str = r#"
[limits.heartbeat_interval]
min = 1.0
max = 10.0
default = 2.0
"#;
        let config: Config = toml::from_str(toml_str).unwrap();
        assert_eq!(config.limits.heartbeat_interval, Bound::new(1.0, 10.0, 2.0));
        assert_eq!(
            config.limits.tolerance_weight,
            Limits::default().tolerance_weight
        );
    }

    #[test]
    fn parse_empty_config() {
        let config: Config = toml::from_str("").unwrap();
        assert!(config.devices.is_empty());
        config.validate().unwrap();
    }

    // -- Validation ---------------------------------------------------------

    #[test]
    fn valid_config_passes() {
        valid_config().validate().unwrap();
    }

    #[test]
    fn device_empty_id_rejected() {
        let mut cfg = valid_config();
        cfg.devices[0].device_id = " ".into();
        assert_validation_err(&cfg, "device_id is empty");
    }

    #[test]
    fn device_id_with_topic_separator_rejected() {
        let mut cfg = valid_config();
        cfg.devices[0].device_id = "valves/front".into();
        assert_validation_err(&cfg, "must not contain");
    }

    #[test]
    fn device_duplicate_id_rejected() {
        let mut cfg = valid_config();
        cfg.devices.push(valid_device());
        assert_validation_err(&cfg, "duplicate device_id");
    }

    #[test]
    fn device_zero_instances_rejected() {
        let mut cfg = valid_config();
        cfg.devices[0].instances = 0;
        assert_validation_err(&cfg, "instances 0 out of range");
    }

    #[test]
    fn limits_inverted_range_rejected() {
        let mut cfg = valid_config();
        cfg.limits.tolerance_weight = Bound::new(10.0, 1.0, 5.0);
        assert_validation_err(&cfg, "limits.tolerance_weight: min (10) is greater than max (1)");
    }

    #[test]
    fn limits_default_outside_range_rejected() {
        let mut cfg = valid_config();
        cfg.limits.heartbeat_interval = Bound::new(0.1, 20.0, 30.0);
        assert_validation_err(&cfg, "limits.heartbeat_interval: default 30 outside");
    }

    #[test]
    fn multiple_errors_collected() {
        let cfg = Config {
            devices: vec![DeviceEntry {
                device_id: "".into(),
                instances: 0,
                weight_control: false,
            }],
            limits: Limits {
                weight_read_interval_ms: Bound::new(f64::NAN, 1.0, 1.0),
                ..Limits::default()
            },
        };
        let msg = format!("{:#}", cfg.validate().unwrap_err());
        assert!(msg.contains("device_id is empty"), "{msg}");
        assert!(msg.contains("instances 0"), "{msg}");
        assert!(msg.contains("must be finite"), "{msg}");
    }

    // -- Bound ---------------------------------------------------------------

    #[test]
    fn bound_clamps_both_ends() {
        let b = Bound::new(0.1, 20.0, 5.0);
        assert_eq!(b.clamp(-5.0), 0.1);
        assert_eq!(b.clamp(25.0), 20.0);
        assert_eq!(b.clamp(7.5), 7.5);
        assert_eq!(b.clamp(f64::NAN), 0.1);
        assert_eq!(b.clamp(f64::INFINITY), 20.0);
    }

    // -- Registry helpers ----------------------------------------------------

    #[test]
    fn device_counts_and_weight_flag() {
        let mut cfg = valid_config();
        cfg.devices.push(DeviceEntry {
            device_id: "aircon".into(),
            instances: 1,
            weight_control: false,
        });
        let counts = cfg.device_counts();
        assert_eq!(counts["esp32-DEE3"], 2);
        assert_eq!(counts["aircon"], 1);
        assert!(cfg.weight_control_enabled("esp32-DEE3"));
        assert!(!cfg.weight_control_enabled("aircon"));
        assert!(!cfg.weight_control_enabled("missing"));
    }

    // -- Broker settings -----------------------------------------------------

    #[test]
    fn broker_settings_defaults() {
        let s = BrokerSettings::from_lookup(|_| None);
        assert_eq!(s.host, "127.0.0.1");
        assert_eq!(s.port, 1883);
        assert!(s.credentials.is_none());
    }

    #[test]
    fn broker_settings_from_vars() {
        let vars: HashMap<&str, &str> = HashMap::from([
            ("MQTT_HOST", "broker.local"),
            ("MQTT_PORT", "8883"),
            ("MQTT_USERNAME", "ui"),
            ("MQTT_PASSWORD", "secret"),
        ]);
        let s = BrokerSettings::from_lookup(|k| vars.get(k).map(|v| v.to_string()));
        assert_eq!(s.host, "broker.local");
        assert_eq!(s.port, 8883);
        assert_eq!(s.credentials, Some(("ui".into(), "secret".into())));
    }
}
