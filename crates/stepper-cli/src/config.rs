//! Configuration vault – reads/writes `~/.stepper-bridge/config.toml`.
//!
//! `STEPPER_CONFIG` points the vault at another file.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use stepper_bridge::BridgeConfig;
use stepper_hal::{HardwareProfile, ProfileError, SerialSettings};
use stepper_middleware::MqttSettings;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read config at {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("failed to parse config at {path}: {source}")]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },

    #[error("failed to serialize config: {0}")]
    Serialize(#[from] toml::ser::Error),

    #[error("failed to write config at {path}: {source}")]
    Write {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("invalid hardware profile: {0}")]
    Profile(#[from] ProfileError),
}

/// `[mqtt]` section.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MqttConfig {
    pub host: String,
    pub port: u16,
    pub client_id: String,
    pub keep_alive_secs: u64,
    pub qos: u8,
    pub connect_timeout_ms: u64,
}

impl Default for MqttConfig {
    fn default() -> Self {
        let suffix = uuid::Uuid::new_v4().simple().to_string();
        Self {
            host: "localhost".to_string(),
            port: 1883,
            client_id: format!("stepper-bridge-{}", &suffix[..8]),
            keep_alive_secs: 30,
            qos: 0,
            connect_timeout_ms: 5000,
        }
    }
}

/// `[serial]` section.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SerialConfig {
    pub port: String,
    pub baud_rate: u32,
    /// Per-transaction response timeout.
    pub timeout_ms: u64,
}

impl Default for SerialConfig {
    fn default() -> Self {
        Self {
            port: "/dev/ttyUSB0".to_string(),
            baud_rate: 115_200,
            timeout_ms: 500,
        }
    }
}

/// Persisted bridge configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Modbus slave id, also the `{deviceId}` topic segment.
    pub device_id: u8,
    pub topic_root: String,
    pub poll_interval_ms: u64,
    pub join_timeout_ms: u64,
    pub mqtt: MqttConfig,
    pub serial: SerialConfig,
    pub profile: HardwareProfile,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            device_id: 1,
            topic_root: "stepper".to_string(),
            poll_interval_ms: 100,
            join_timeout_ms: 2000,
            mqtt: MqttConfig::default(),
            serial: SerialConfig::default(),
            profile: HardwareProfile::default(),
        }
    }
}

impl Config {
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.profile.validate()?;
        Ok(())
    }

    pub fn bridge_config(&self) -> BridgeConfig {
        BridgeConfig {
            device_id: self.device_id,
            topic_root: self.topic_root.clone(),
            poll_interval: Duration::from_millis(self.poll_interval_ms.max(1)),
            join_timeout: Duration::from_millis(self.join_timeout_ms),
            profile: self.profile.clone(),
        }
    }

    pub fn mqtt_settings(&self) -> MqttSettings {
        MqttSettings {
            host: self.mqtt.host.clone(),
            port: self.mqtt.port,
            client_id: self.mqtt.client_id.clone(),
            keep_alive: Duration::from_secs(self.mqtt.keep_alive_secs),
            qos: self.mqtt.qos,
            connect_timeout: Duration::from_millis(self.mqtt.connect_timeout_ms),
        }
    }

    pub fn serial_settings(&self) -> SerialSettings {
        SerialSettings {
            port: self.serial.port.clone(),
            baud_rate: self.serial.baud_rate,
            device_id: self.device_id,
            timeout: Duration::from_millis(self.serial.timeout_ms),
        }
    }
}

/// `$STEPPER_CONFIG`, or `~/.stepper-bridge/config.toml`.
pub fn config_path() -> PathBuf {
    if let Ok(path) = std::env::var("STEPPER_CONFIG") {
        return PathBuf::from(path);
    }
    config_path_for_home(
        &std::env::var("HOME")
            .or_else(|_| std::env::var("USERPROFILE"))
            .unwrap_or_else(|_| ".".to_string()),
    )
}

pub(crate) fn config_path_for_home(home: &str) -> PathBuf {
    PathBuf::from(home).join(".stepper-bridge").join("config.toml")
}

/// Load the config from disk with environment overrides applied.
/// Returns `None` if the file does not exist.
pub fn load() -> Result<Option<Config>, ConfigError> {
    let mut cfg = load_from(&config_path())?;
    if let Some(cfg) = cfg.as_mut() {
        apply_env_overrides(cfg);
    }
    Ok(cfg)
}

pub(crate) fn load_from(path: &Path) -> Result<Option<Config>, ConfigError> {
    if !path.exists() {
        return Ok(None);
    }
    let raw = fs::read_to_string(path).map_err(|source| ConfigError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    let cfg = toml::from_str(&raw).map_err(|source| ConfigError::Parse {
        path: path.to_path_buf(),
        source,
    })?;
    Ok(Some(cfg))
}

/// Apply `STEPPER_*` environment variable overrides to `cfg`.
///
/// | Variable | Config field |
/// |---|---|
/// | `STEPPER_MQTT_HOST` | `mqtt.host` |
/// | `STEPPER_MQTT_PORT` | `mqtt.port` |
/// | `STEPPER_SERIAL_PORT` | `serial.port` |
/// | `STEPPER_BAUD_RATE` | `serial.baud_rate` |
/// | `STEPPER_DEVICE_ID` | `device_id` |
/// | `STEPPER_POLL_INTERVAL_MS` | `poll_interval_ms` |
///
/// Numeric values that do not parse are ignored.
pub fn apply_env_overrides(cfg: &mut Config) {
    apply_overrides(cfg, |key| std::env::var(key).ok());
}

fn apply_overrides(cfg: &mut Config, lookup: impl Fn(&str) -> Option<String>) {
    if let Some(v) = lookup("STEPPER_MQTT_HOST") {
        cfg.mqtt.host = v;
    }
    if let Some(v) = lookup("STEPPER_MQTT_PORT")
        && let Ok(port) = v.parse()
    {
        cfg.mqtt.port = port;
    }
    if let Some(v) = lookup("STEPPER_SERIAL_PORT") {
        cfg.serial.port = v;
    }
    if let Some(v) = lookup("STEPPER_BAUD_RATE")
        && let Ok(baud) = v.parse()
    {
        cfg.serial.baud_rate = baud;
    }
    if let Some(v) = lookup("STEPPER_DEVICE_ID")
        && let Ok(id) = v.parse()
    {
        cfg.device_id = id;
    }
    if let Some(v) = lookup("STEPPER_POLL_INTERVAL_MS")
        && let Ok(ms) = v.parse()
    {
        cfg.poll_interval_ms = ms;
    }
}

/// Save the config to [`config_path`], creating its directory if necessary.
pub fn save(cfg: &Config) -> Result<(), ConfigError> {
    save_to(cfg, &config_path())
}

pub(crate) fn save_to(cfg: &Config, path: &Path) -> Result<(), ConfigError> {
    let write_err = |source| ConfigError::Write {
        path: path.to_path_buf(),
        source,
    };
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent).map_err(write_err)?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(parent, fs::Permissions::from_mode(0o700)).map_err(write_err)?;
        }
    }
    let raw = toml::to_string_pretty(cfg)?;
    #[cfg(unix)]
    {
        use std::io::Write;
        use std::os::unix::fs::OpenOptionsExt;
        fs::OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .mode(0o600)
            .open(path)
            .and_then(|mut f| f.write_all(raw.as_bytes()))
            .map_err(write_err)?;
    }
    #[cfg(not(unix))]
    fs::write(path, raw).map_err(write_err)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn env(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key: &str| map.get(key).cloned()
    }

    #[test]
    fn roundtrip_default_config() {
        let dir = tempfile::tempdir().expect("tmp dir");
        let path = config_path_for_home(&dir.path().to_string_lossy());

        let cfg = Config::default();
        save_to(&cfg, &path).expect("save");

        let loaded = load_from(&path).expect("load ok").expect("some");
        assert_eq!(loaded, cfg);
        assert_eq!(loaded.profile.status_address, 0x000D);
        assert_eq!(loaded.serial.baud_rate, 115_200);
    }

    #[cfg(unix)]
    #[test]
    fn config_file_has_restrictive_permissions() {
        use std::os::unix::fs::PermissionsExt;
        let dir = tempfile::tempdir().expect("tmp dir");
        let path = config_path_for_home(&dir.path().to_string_lossy());
        save_to(&Config::default(), &path).expect("save");

        let file_mode = std::fs::metadata(&path).unwrap().permissions().mode() & 0o777;
        assert_eq!(file_mode, 0o600);
        let dir_mode = std::fs::metadata(path.parent().unwrap())
            .unwrap()
            .permissions()
            .mode()
            & 0o777;
        assert_eq!(dir_mode, 0o700);
    }

    #[test]
    fn load_from_returns_none_when_missing() {
        let dir = tempfile::tempdir().expect("tmp dir");
        let path = config_path_for_home(&dir.path().to_string_lossy());
        assert!(load_from(&path).expect("no error").is_none());
    }

    #[test]
    fn partial_file_fills_defaults() {
        let dir = tempfile::tempdir().expect("tmp dir");
        let path = dir.path().join("config.toml");
        std::fs::write(
            &path,
            "device_id = 3\n\n[serial]\nport = \"/dev/ttyACM0\"\n\n[profile]\nstatus_address = 32\n",
        )
        .unwrap();

        let cfg = load_from(&path).unwrap().unwrap();
        assert_eq!(cfg.device_id, 3);
        assert_eq!(cfg.serial.port, "/dev/ttyACM0");
        assert_eq!(cfg.serial.timeout_ms, 500);
        assert_eq!(cfg.profile.status_address, 32);
        assert_eq!(cfg.profile.opcodes.move_absolute, 0x0102);
        assert_eq!(cfg.topic_root, "stepper");
    }

    #[test]
    fn malformed_file_is_a_parse_error() {
        let dir = tempfile::tempdir().expect("tmp dir");
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "device_id = \"one\"").unwrap();
        assert!(matches!(load_from(&path), Err(ConfigError::Parse { .. })));
    }

    #[test]
    fn config_path_points_to_bridge_dir() {
        let p = config_path_for_home("/home/testuser");
        assert_eq!(p, PathBuf::from("/home/testuser/.stepper-bridge/config.toml"));
    }

    #[test]
    fn overrides_replace_fields() {
        let mut cfg = Config::default();
        apply_overrides(
            &mut cfg,
            env(&[
                ("STEPPER_MQTT_HOST", "broker.local"),
                ("STEPPER_MQTT_PORT", "8883"),
                ("STEPPER_SERIAL_PORT", "/dev/ttyS1"),
                ("STEPPER_BAUD_RATE", "9600"),
                ("STEPPER_DEVICE_ID", "4"),
                ("STEPPER_POLL_INTERVAL_MS", "250"),
            ]),
        );
        assert_eq!(cfg.mqtt.host, "broker.local");
        assert_eq!(cfg.mqtt.port, 8883);
        assert_eq!(cfg.serial.port, "/dev/ttyS1");
        assert_eq!(cfg.serial.baud_rate, 9600);
        assert_eq!(cfg.device_id, 4);
        assert_eq!(cfg.poll_interval_ms, 250);
    }

    #[test]
    fn invalid_numeric_overrides_are_ignored() {
        let mut cfg = Config::default();
        apply_overrides(
            &mut cfg,
            env(&[
                ("STEPPER_MQTT_PORT", "not-a-port"),
                ("STEPPER_DEVICE_ID", "300"),
                ("STEPPER_BAUD_RATE", ""),
            ]),
        );
        assert_eq!(cfg.mqtt.port, 1883);
        assert_eq!(cfg.device_id, 1);
        assert_eq!(cfg.serial.baud_rate, 115_200);
    }

    #[test]
    fn settings_derive_from_config() {
        let cfg = Config::default();
        let bridge = cfg.bridge_config();
        assert_eq!(bridge.poll_interval, Duration::from_millis(100));
        assert_eq!(bridge.join_timeout, Duration::from_secs(2));
        assert_eq!(cfg.serial_settings().device_id, 1);
        assert_eq!(cfg.serial_settings().timeout, Duration::from_millis(500));
        assert!(cfg.mqtt_settings().client_id.starts_with("stepper-bridge-"));
    }

    #[test]
    fn inconsistent_profile_fails_validation() {
        let mut cfg = Config::default();
        cfg.profile.servo_bits.push(15);
        assert!(matches!(cfg.validate(), Err(ConfigError::Profile(_))));
    }
}
