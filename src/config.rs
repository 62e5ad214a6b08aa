//! Configuration for safety-io
//!
//! Loads configuration from a TOML file. Every field has a default, so a
//! partial file (or no file at all) yields a usable configuration.
//!
//! ```toml
//! [transport]
//! min_gap_ms = 120
//! lock_scope = "global"      # or "per_endpoint"
//! connection = "fresh"       # or "pooled"
//!
//! [runtime.battery]
//! host = "192.168.1.12"
//! battery_unit = 2
//! query_hz = 1.0
//!
//! [[runtime.spd_lidar.instances]]
//! id = "front"
//! mode = "client"
//! device_ip = "192.168.0.7"
//! ```

use crate::error::{Error, Result};
use crate::transport::{ConnectionPolicy, Endpoint, LockScope, SerialSettings};
use serde::{Deserialize, Serialize};
use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Environment variable naming an explicit config file
pub const CONFIG_ENV: &str = "SAFETY_IO_CONFIG";

/// Relative locations searched when no explicit path is given
pub const CONFIG_CANDIDATES: [&str; 3] = [
    "config/safety_io.toml",
    "../config/safety_io.toml",
    "../../config/safety_io.toml",
];

const DEFAULT_GATEWAY: &str = "192.168.1.12";
const DEFAULT_MODBUS_PORT: u16 = 502;

/// Top-level configuration
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct Config {
    pub transport: TransportConfig,
    pub reporter: ReporterConfig,
    pub runtime: RuntimeConfig,
}

/// Shared transport behaviour
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct TransportConfig {
    /// Minimum spacing between exchanges on one endpoint
    pub min_gap_ms: u64,
    pub lock_scope: LockScope,
    pub connection: ConnectionPolicy,
    /// Connect/send/receive timeout
    pub timeout_ms: u64,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            min_gap_ms: 120,
            lock_scope: LockScope::Global,
            connection: ConnectionPolicy::Fresh,
            timeout_ms: 5000,
        }
    }
}

impl TransportConfig {
    pub fn min_gap(&self) -> Duration {
        Duration::from_millis(self.min_gap_ms)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

/// Periodic snapshot printer
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ReporterConfig {
    pub enable: bool,
    pub period_ms: u64,
}

impl Default for ReporterConfig {
    fn default() -> Self {
        Self {
            enable: true,
            period_ms: 1000,
        }
    }
}

/// Per-driver sections
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct RuntimeConfig {
    pub battery: BatteryConfig,
    pub solar: SolarConfig,
    pub hoist_hook: HoistHookConfig,
    pub io_relay: IoRelayConfig,
    pub multi_turn_encoder: EncoderConfig,
    pub spd_lidar: SpdLidarConfig,
}

/// Battery management system behind the gateway
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct BatteryConfig {
    pub enable: bool,
    #[serde(alias = "module_ip")]
    pub host: String,
    #[serde(alias = "module_port")]
    pub port: u16,
    /// Unit id of the gateway module itself
    #[serde(alias = "module_slave_id")]
    pub module_unit: u8,
    #[serde(alias = "battery_slave_id")]
    pub battery_unit: u8,
    /// Poll rate; 0 disables polling
    pub query_hz: f64,
}

impl Default for BatteryConfig {
    fn default() -> Self {
        Self {
            enable: true,
            host: DEFAULT_GATEWAY.to_string(),
            port: DEFAULT_MODBUS_PORT,
            module_unit: 3,
            battery_unit: 2,
            query_hz: 0.0,
        }
    }
}

impl BatteryConfig {
    pub fn endpoint(&self) -> Endpoint {
        Endpoint::new(&self.host, self.port)
    }
}

/// Solar charge controller
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct SolarConfig {
    pub enable: bool,
    #[serde(alias = "module_ip")]
    pub host: String,
    #[serde(alias = "module_port")]
    pub port: u16,
    #[serde(alias = "module_slave_id")]
    pub module_unit: u8,
    #[serde(alias = "solar_slave_id")]
    pub solar_unit: u8,
    pub query_hz: f64,
}

impl Default for SolarConfig {
    fn default() -> Self {
        Self {
            enable: true,
            host: DEFAULT_GATEWAY.to_string(),
            port: DEFAULT_MODBUS_PORT,
            module_unit: 3,
            solar_unit: 4,
            query_hz: 0.0,
        }
    }
}

impl SolarConfig {
    pub fn endpoint(&self) -> Endpoint {
        Endpoint::new(&self.host, self.port)
    }
}

/// Hoist-hook accessory module
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct HoistHookConfig {
    pub enable: bool,
    #[serde(alias = "module_ip")]
    pub host: String,
    #[serde(alias = "module_port")]
    pub port: u16,
    #[serde(alias = "hook_slave_id")]
    pub hook_unit: u8,
    #[serde(alias = "power_slave_id")]
    pub power_unit: u8,
    pub query_hz: f64,
}

impl Default for HoistHookConfig {
    fn default() -> Self {
        Self {
            enable: true,
            host: DEFAULT_GATEWAY.to_string(),
            port: DEFAULT_MODBUS_PORT,
            hook_unit: 3,
            power_unit: 4,
            query_hz: 0.0,
        }
    }
}

impl HoistHookConfig {
    pub fn endpoint(&self) -> Endpoint {
        Endpoint::new(&self.host, self.port)
    }
}

/// 16-channel relay bank
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct IoRelayConfig {
    pub enable: bool,
    #[serde(alias = "module_ip")]
    pub host: String,
    #[serde(alias = "module_port")]
    pub port: u16,
    #[serde(alias = "module_slave_id")]
    pub unit: u8,
    pub query_hz: f64,
}

impl Default for IoRelayConfig {
    fn default() -> Self {
        Self {
            enable: true,
            host: DEFAULT_GATEWAY.to_string(),
            port: DEFAULT_MODBUS_PORT,
            unit: 3,
            query_hz: 0.0,
        }
    }
}

impl IoRelayConfig {
    pub fn endpoint(&self) -> Endpoint {
        Endpoint::new(&self.host, self.port)
    }
}

/// Encoder link type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum EncoderTransport {
    Rtu,
    Tcp,
}

/// Multi-turn absolute encoder
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct EncoderConfig {
    pub enable: bool,
    pub transport: EncoderTransport,
    pub device: String,
    pub baud: u32,
    pub parity: char,
    #[serde(alias = "data_bit")]
    pub data_bits: u8,
    #[serde(alias = "stop_bit")]
    pub stop_bits: u8,
    #[serde(alias = "slave")]
    pub unit: u8,
    #[serde(alias = "ip")]
    pub host: String,
    pub port: u16,
    /// Background reader period
    pub sample_ms: u64,
    /// Exponential smoothing factor in (0, 1]
    pub filter_alpha: f64,
    pub query_hz: f64,
}

impl Default for EncoderConfig {
    fn default() -> Self {
        Self {
            enable: true,
            transport: EncoderTransport::Rtu,
            device: "/dev/ttyUSB0".to_string(),
            baud: 9600,
            parity: 'N',
            data_bits: 8,
            stop_bits: 1,
            unit: 1,
            host: "192.168.1.100".to_string(),
            port: DEFAULT_MODBUS_PORT,
            sample_ms: 50,
            filter_alpha: 0.3,
            query_hz: 0.0,
        }
    }
}

impl EncoderConfig {
    pub fn endpoint(&self) -> Endpoint {
        Endpoint::new(&self.host, self.port)
    }

    pub fn serial(&self) -> SerialSettings {
        SerialSettings {
            device: self.device.clone(),
            baud: self.baud,
            parity: self.parity,
            data_bits: self.data_bits,
            stop_bits: self.stop_bits,
        }
    }
}

/// Which side of the lidar TCP link this process dials
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LidarMode {
    /// Dial the device address
    Client,
    /// Dial the local bridge address
    Server,
}

impl LidarMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            LidarMode::Client => "client",
            LidarMode::Server => "server",
        }
    }
}

/// One single-point lidar
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct LidarInstanceConfig {
    pub id: String,
    pub enable: bool,
    pub mode: LidarMode,
    pub local_ip: String,
    pub local_port: u16,
    pub device_ip: String,
    pub device_port: u16,
    pub role: String,
    pub priority: i32,
}

impl Default for LidarInstanceConfig {
    fn default() -> Self {
        Self {
            id: "default".to_string(),
            enable: true,
            mode: LidarMode::Server,
            local_ip: "192.168.0.201".to_string(),
            local_port: 8234,
            device_ip: "192.168.0.7".to_string(),
            device_port: 8234,
            role: String::new(),
            priority: 0,
        }
    }
}

impl LidarInstanceConfig {
    /// Address this process connects to for an exchange
    pub fn target(&self) -> Endpoint {
        match self.mode {
            LidarMode::Client => Endpoint::new(&self.device_ip, self.device_port),
            LidarMode::Server => Endpoint::new(&self.local_ip, self.local_port),
        }
    }
}

/// Lidar family; one adapter serves every instance
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct SpdLidarConfig {
    pub enable: bool,
    pub query_hz: f64,
    pub instances: Vec<LidarInstanceConfig>,
}

impl Default for SpdLidarConfig {
    fn default() -> Self {
        Self {
            enable: true,
            query_hz: 0.0,
            instances: Vec::new(),
        }
    }
}

impl SpdLidarConfig {
    /// Configured instances, or the single default instance when none are listed
    pub fn effective_instances(&self) -> Vec<LidarInstanceConfig> {
        if self.instances.is_empty() {
            vec![LidarInstanceConfig::default()]
        } else {
            self.instances.clone()
        }
    }
}

impl Config {
    /// Load configuration from a TOML file
    ///
    /// # Example
    /// ```no_run
    /// use safety_io::config::Config;
    ///
    /// let config = Config::from_file("config/safety_io.toml")?;
    /// # Ok::<(), Box<dyn std::error::Error>>(())
    /// ```
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let contents = fs::read_to_string(path)?;
        let config: Config = toml::from_str(&contents)?;
        config.validate()?;
        Ok(config)
    }

    /// Find and load a config file
    ///
    /// Search order: `explicit`, `$SAFETY_IO_CONFIG`, then [`CONFIG_CANDIDATES`].
    /// Returns defaults and `None` when nothing is found; an explicit path that
    /// does not exist is an error.
    pub fn load(explicit: Option<&Path>) -> Result<(Self, Option<PathBuf>)> {
        if let Some(path) = explicit {
            if !path.exists() {
                return Err(Error::Config(format!(
                    "config file not found: {}",
                    path.display()
                )));
            }
            return Ok((Self::from_file(path)?, Some(path.to_path_buf())));
        }

        match Self::resolve_path() {
            Some(path) => {
                log::info!("Using config: {}", path.display());
                Ok((Self::from_file(&path)?, Some(path)))
            }
            None => {
                log::info!("No config file found, using defaults");
                Ok((Self::default(), None))
            }
        }
    }

    fn resolve_path() -> Option<PathBuf> {
        let from_env = env::var_os(CONFIG_ENV).map(PathBuf::from);
        from_env
            .into_iter()
            .chain(CONFIG_CANDIDATES.iter().map(PathBuf::from))
            .find(|candidate| candidate.exists())
    }

    /// Reject values the drivers cannot work with
    pub fn validate(&self) -> Result<()> {
        let alpha = self.runtime.multi_turn_encoder.filter_alpha;
        if !(alpha > 0.0 && alpha <= 1.0) {
            return Err(Error::Config(format!(
                "multi_turn_encoder.filter_alpha {} not in (0, 1]",
                alpha
            )));
        }
        let mut ids: Vec<&str> = self
            .runtime
            .spd_lidar
            .instances
            .iter()
            .map(|i| i.id.as_str())
            .collect();
        ids.sort_unstable();
        if let Some(pair) = ids.windows(2).find(|pair| pair[0] == pair[1]) {
            return Err(Error::Config(format!(
                "duplicate spd_lidar instance id '{}'",
                pair[0]
            )));
        }
        Ok(())
    }

    /// Render the active configuration as TOML
    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self).map_err(|e| Error::Config(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.transport.min_gap_ms, 120);
        assert_eq!(config.transport.lock_scope, LockScope::Global);
        assert_eq!(config.transport.connection, ConnectionPolicy::Fresh);
        assert_eq!(config.runtime.battery.endpoint().key(), "192.168.1.12:502");
        assert_eq!(config.runtime.battery.battery_unit, 2);
        assert_eq!(config.runtime.solar.solar_unit, 4);
        assert_eq!(config.runtime.hoist_hook.power_unit, 4);
        assert_eq!(config.runtime.multi_turn_encoder.transport, EncoderTransport::Rtu);
        assert_eq!(config.runtime.multi_turn_encoder.serial().baud, 9600);
        assert_eq!(config.runtime.battery.query_hz, 0.0);
    }

    #[test]
    fn test_partial_toml() {
        let toml_content = r#"
[transport]
lock_scope = "per_endpoint"
connection = "pooled"

[runtime.battery]
module_ip = "10.0.0.5"
battery_slave_id = 7
query_hz = 2.5

[runtime.multi_turn_encoder]
transport = "tcp"
ip = "10.0.0.9"
slave = 3

[[runtime.spd_lidar.instances]]
id = "front"
mode = "client"
device_ip = "10.0.0.20"
device_port = 9000

[[runtime.spd_lidar.instances]]
id = "rear"
enable = false
"#;

        let config: Config = toml::from_str(toml_content).unwrap();
        assert_eq!(config.transport.lock_scope, LockScope::PerEndpoint);
        assert_eq!(config.transport.connection, ConnectionPolicy::Pooled);
        assert_eq!(config.transport.min_gap_ms, 120);
        assert_eq!(config.runtime.battery.host, "10.0.0.5");
        assert_eq!(config.runtime.battery.battery_unit, 7);
        assert_eq!(config.runtime.battery.module_unit, 3);
        assert_eq!(config.runtime.battery.query_hz, 2.5);
        assert_eq!(config.runtime.multi_turn_encoder.transport, EncoderTransport::Tcp);
        assert_eq!(config.runtime.multi_turn_encoder.endpoint().key(), "10.0.0.9:502");
        assert_eq!(config.runtime.multi_turn_encoder.unit, 3);

        let lidars = config.runtime.spd_lidar.effective_instances();
        assert_eq!(lidars.len(), 2);
        assert_eq!(lidars[0].target().key(), "10.0.0.20:9000");
        assert!(!lidars[1].enable);
        assert_eq!(lidars[1].mode, LidarMode::Server);
    }

    #[test]
    fn test_default_lidar_instance_when_none_listed() {
        let config = Config::default();
        let lidars = config.runtime.spd_lidar.effective_instances();
        assert_eq!(lidars.len(), 1);
        assert_eq!(lidars[0].id, "default");
        // Server mode dials the local bridge address
        assert_eq!(lidars[0].target().key(), "192.168.0.201:8234");
    }

    #[test]
    fn test_validate_rejects_duplicates_and_bad_alpha() {
        let mut config = Config::default();
        config.runtime.spd_lidar.instances = vec![
            LidarInstanceConfig::default(),
            LidarInstanceConfig::default(),
        ];
        assert!(matches!(config.validate(), Err(Error::Config(_))));

        let mut config = Config::default();
        config.runtime.multi_turn_encoder.filter_alpha = 0.0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_from_file_and_explicit_load() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("safety_io.toml");
        let mut file = fs::File::create(&path).unwrap();
        writeln!(file, "[runtime.io_relay]\nunit = 9\nquery_hz = 1.0").unwrap();

        let (config, loaded) = Config::load(Some(&path)).unwrap();
        assert_eq!(config.runtime.io_relay.unit, 9);
        assert_eq!(loaded.as_deref(), Some(path.as_path()));

        let missing = dir.path().join("missing.toml");
        assert!(matches!(Config::load(Some(&missing)), Err(Error::Config(_))));
    }

    #[test]
    fn test_shipped_config_parses() {
        let config: Config = toml::from_str(include_str!("../config/safety_io.toml")).unwrap();
        config.validate().unwrap();
        assert_eq!(config.runtime.battery.query_hz, 1.0);
        assert!(!config.runtime.multi_turn_encoder.enable);
        assert_eq!(config.runtime.multi_turn_encoder.parity, 'N');
        let lidars = config.runtime.spd_lidar.effective_instances();
        assert_eq!(lidars[0].id, "front");
        assert_eq!(lidars[0].role, "primary");
    }

    #[test]
    fn test_toml_roundtrip_contains_sections() {
        let rendered = Config::default().to_toml().unwrap();
        assert!(rendered.contains("[transport]"));
        assert!(rendered.contains("[runtime.battery]"));
        let parsed: Config = toml::from_str(&rendered).unwrap();
        assert_eq!(parsed.runtime.solar.solar_unit, 4);
    }
}
