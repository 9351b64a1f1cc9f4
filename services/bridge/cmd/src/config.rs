//! Configuration handling for the bridge binary.
//!
//! Settings come from a YAML file, then `BRIDGE_*` environment variables,
//! then command-line flags (applied in `main`). Durations are humantime
//! strings such as `"30s"` or `"5m"`.

use anyhow::{anyhow, bail, Context, Result};
use bridge_devices::DEFAULT_CACHE_CAPACITY;
use bridge_session::{ConnectionConfig, RetryPolicy, TimeoutConfig, DEFAULT_DATA_QUEUE_CAPACITY};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{info, warn};

/// TLS settings for one connection
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct TlsConfig {
    /// Whether to wrap the TCP stream in TLS
    pub enabled: bool,
    /// CA bundle used to verify the device
    pub ca_file: Option<PathBuf>,
    /// Client certificate for devices requiring mutual TLS
    pub cert_file: Option<PathBuf>,
    /// Client private key (PKCS#8)
    pub key_file: Option<PathBuf>,
    /// SNI name; defaults to the host part of the address
    pub server_name: Option<String>,
}

/// One device connection
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionSpec {
    /// Name used in logs and metrics
    pub name: String,
    /// `host:port` of the device
    pub address: String,
    /// Endpoint id sent in the handshake
    pub endpoint: [u8; 4],
    /// Auth code sent in the handshake
    pub auth_code: String,
    /// Configured primary flag
    pub primary: bool,
    /// TLS settings
    pub tls: TlsConfig,
}

impl ConnectionSpec {
    /// Host part of the address, used as the default SNI name
    pub fn host(&self) -> &str {
        self.address
            .rsplit_once(':')
            .map(|(host, _)| host)
            .unwrap_or(&self.address)
    }
}

/// Bridge configuration
#[derive(Debug, Clone)]
pub struct BridgeConfig {
    /// Log level (trace, debug, info, warn, error)
    pub log_level: String,
    /// Interval between mesh polls on the primary connection
    pub poll_interval: Duration,
    /// Interval between metrics summaries
    pub metrics_interval: Duration,
    /// Maximum number of cached devices per connection
    pub cache_capacity: usize,
    /// Per-connection settings shared by every link
    pub connection: ConnectionConfig,
    /// Device connections
    pub connections: Vec<ConnectionSpec>,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            poll_interval: Duration::from_secs(60),
            metrics_interval: Duration::from_secs(300),
            cache_capacity: DEFAULT_CACHE_CAPACITY,
            connection: ConnectionConfig::default(),
            connections: Vec::new(),
        }
    }
}

/// Root of the YAML file
#[derive(Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
struct FileConfig {
    log_level: Option<String>,
    poll_interval: Option<String>,
    metrics_interval: Option<String>,
    cache_capacity: Option<usize>,
    data_queue_capacity: Option<usize>,
    retry: Option<RetryFile>,
    timeouts: Option<TimeoutsFile>,
    connections: Vec<ConnectionFile>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
struct RetryFile {
    max_attempts: Option<u32>,
    base_delay: Option<String>,
    max_delay: Option<String>,
    multiplier: Option<f64>,
    jitter: Option<f64>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
struct TimeoutsFile {
    handshake: Option<String>,
    read: Option<String>,
    write: Option<String>,
    heartbeat_interval: Option<String>,
    heartbeat_timeout: Option<String>,
    ack: Option<String>,
    mesh_send: Option<String>,
    mesh_collection: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct ConnectionFile {
    name: String,
    address: String,
    endpoint: String,
    auth_code: String,
    #[serde(default)]
    primary: bool,
    #[serde(default)]
    tls: TlsConfig,
}

/// Parse a humantime duration, naming the setting on failure
pub fn parse_duration(setting: &str, value: &str) -> Result<Duration> {
    humantime::parse_duration(value.trim())
        .with_context(|| format!("invalid duration for {}: {:?}", setting, value))
}

/// Parse an 8-digit hex endpoint id such as `3987c857`
pub fn parse_endpoint(value: &str) -> Result<[u8; 4]> {
    let digits = value.trim().trim_start_matches("0x");
    if digits.len() != 8 || !digits.is_ascii() {
        bail!("endpoint id must be 8 hex digits, got {:?}", value);
    }
    let mut endpoint = [0u8; 4];
    for (i, byte) in endpoint.iter_mut().enumerate() {
        *byte = u8::from_str_radix(&digits[i * 2..i * 2 + 2], 16)
            .map_err(|_| anyhow!("endpoint id must be 8 hex digits, got {:?}", value))?;
    }
    Ok(endpoint)
}

fn set_duration(target: &mut Duration, setting: &str, value: Option<String>) -> Result<()> {
    if let Some(value) = value {
        *target = parse_duration(setting, &value)?;
    }
    Ok(())
}

impl BridgeConfig {
    /// Load configuration from `path` and the environment.
    ///
    /// A missing file falls back to defaults; a malformed one is an error.
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let mut config = match std::fs::read_to_string(path) {
            Ok(content) => {
                let config = Self::from_yaml(&content)
                    .with_context(|| format!("failed to parse config file {:?}", path))?;
                info!("Loaded configuration from {:?}", path);
                config
            }
            Err(e) => {
                warn!("Config file {:?} not readable ({}), using defaults", path, e);
                Self::default()
            }
        };

        config.apply_environment_overrides()?;

        info!(
            connections = config.connections.len(),
            poll_interval = %humantime::format_duration(config.poll_interval),
            log_level = %config.log_level,
            "Final bridge configuration"
        );
        Ok(config)
    }

    /// Build a configuration from YAML text
    pub fn from_yaml(content: &str) -> Result<Self> {
        let file: FileConfig = serde_yaml::from_str(content)?;
        Self::from_file_config(file)
    }

    fn from_file_config(file: FileConfig) -> Result<Self> {
        let mut config = Self::default();

        if let Some(level) = file.log_level {
            config.log_level = level;
        }
        set_duration(&mut config.poll_interval, "poll_interval", file.poll_interval)?;
        set_duration(&mut config.metrics_interval, "metrics_interval", file.metrics_interval)?;
        if let Some(capacity) = file.cache_capacity {
            config.cache_capacity = capacity;
        }
        config.connection.data_queue_capacity =
            file.data_queue_capacity.unwrap_or(DEFAULT_DATA_QUEUE_CAPACITY);

        if let Some(retry) = file.retry {
            config.connection.retry = retry_policy(retry)?;
        }
        if let Some(timeouts) = file.timeouts {
            config.connection.timeouts = timeout_config(timeouts)?;
        }

        for conn in file.connections {
            let endpoint = parse_endpoint(&conn.endpoint)
                .with_context(|| format!("connection {:?}", conn.name))?;
            config.connections.push(ConnectionSpec {
                name: conn.name,
                address: conn.address,
                endpoint,
                auth_code: conn.auth_code,
                primary: conn.primary,
                tls: conn.tls,
            });
        }

        config.validate()?;
        Ok(config)
    }

    /// Apply `BRIDGE_*` environment variable overrides
    pub fn apply_environment_overrides(&mut self) -> Result<()> {
        self.apply_overrides(|key| std::env::var(key).ok())
    }

    fn apply_overrides<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(level) = lookup("BRIDGE_LOG_LEVEL") {
            info!("Log level overridden by environment: {}", level);
            self.log_level = level;
        }
        if let Some(interval) = lookup("BRIDGE_POLL_INTERVAL") {
            self.poll_interval = parse_duration("BRIDGE_POLL_INTERVAL", &interval)?;
            info!("Poll interval overridden by environment: {}", interval);
        }
        if let Some(primary) = lookup("BRIDGE_PRIMARY") {
            self.set_primary(&primary)?;
            info!("Primary connection overridden by environment: {}", primary);
        }
        Ok(())
    }

    /// Make `name` the only primary connection
    pub fn set_primary(&mut self, name: &str) -> Result<()> {
        if !self.connections.iter().any(|c| c.name == name) {
            bail!("unknown connection {:?}", name);
        }
        for conn in &mut self.connections {
            conn.primary = conn.name == name;
        }
        Ok(())
    }

    /// Index of the connection allowed to issue mesh queries.
    ///
    /// The first connection flagged primary wins; without a flag the first
    /// connection is elected.
    pub fn primary_index(&self) -> Option<usize> {
        if self.connections.is_empty() {
            return None;
        }
        Some(self.connections.iter().position(|c| c.primary).unwrap_or(0))
    }

    fn validate(&self) -> Result<()> {
        let mut names: Vec<&str> = self.connections.iter().map(|c| c.name.as_str()).collect();
        names.sort_unstable();
        if let Some(pair) = names.windows(2).find(|pair| pair[0] == pair[1]) {
            bail!("duplicate connection name {:?}", pair[0]);
        }
        let flagged = self.connections.iter().filter(|c| c.primary).count();
        if flagged > 1 {
            warn!(
                flagged,
                "more than one connection flagged primary, only the first is used"
            );
        }
        if self.poll_interval.is_zero() {
            bail!("poll_interval must be positive");
        }
        Ok(())
    }
}

fn retry_policy(file: RetryFile) -> Result<RetryPolicy> {
    let mut retry = RetryPolicy::default();
    if let Some(attempts) = file.max_attempts {
        retry.max_attempts = attempts.max(1);
    }
    set_duration(&mut retry.base_delay, "retry.base_delay", file.base_delay)?;
    set_duration(&mut retry.max_delay, "retry.max_delay", file.max_delay)?;
    if let Some(multiplier) = file.multiplier {
        retry.multiplier = multiplier;
    }
    if let Some(jitter) = file.jitter {
        retry.jitter = jitter.clamp(0.0, 1.0);
    }
    Ok(retry)
}

fn timeout_config(file: TimeoutsFile) -> Result<TimeoutConfig> {
    let mut t = TimeoutConfig::default();
    set_duration(&mut t.handshake, "timeouts.handshake", file.handshake)?;
    set_duration(&mut t.read, "timeouts.read", file.read)?;
    set_duration(&mut t.write, "timeouts.write", file.write)?;
    set_duration(&mut t.heartbeat_interval, "timeouts.heartbeat_interval", file.heartbeat_interval)?;
    set_duration(&mut t.heartbeat_timeout, "timeouts.heartbeat_timeout", file.heartbeat_timeout)?;
    set_duration(&mut t.ack, "timeouts.ack", file.ack)?;
    set_duration(&mut t.mesh_send, "timeouts.mesh_send", file.mesh_send)?;
    set_duration(&mut t.mesh_collection, "timeouts.mesh_collection", file.mesh_collection)?;
    Ok(t)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::io::Write;
    use tempfile::NamedTempFile;

    const SAMPLE: &str = r#"
log_level: debug
poll_interval: 2m
cache_capacity: 500
retry:
  max_attempts: 5
  base_delay: 500ms
timeouts:
  heartbeat_interval: 15s
  mesh_collection: 4s
connections:
  - name: living-room
    address: 192.168.1.40:23778
    endpoint: 3987c857
    auth_code: "0123456789abcdef"
  - name: kitchen
    address: kitchen.local:23779
    endpoint: "0x1a2b3c4d"
    auth_code: "fedcba9876543210"
    primary: true
    tls:
      enabled: true
      ca_file: /etc/bridge/ca.pem
"#;

    #[test]
    fn test_default_config() {
        let config = BridgeConfig::default();
        assert_eq!(config.log_level, "info");
        assert_eq!(config.poll_interval, Duration::from_secs(60));
        assert_eq!(config.cache_capacity, 1000);
        assert!(config.connections.is_empty());
        assert_eq!(config.primary_index(), None);
    }

    #[test]
    fn test_load_from_file() {
        let mut temp_file = NamedTempFile::new().unwrap();
        temp_file.write_all(SAMPLE.as_bytes()).unwrap();

        let config = BridgeConfig::load_from_file(temp_file.path()).unwrap();

        assert_eq!(config.poll_interval, Duration::from_secs(120));
        assert_eq!(config.cache_capacity, 500);
        assert_eq!(config.connection.retry.max_attempts, 5);
        assert_eq!(config.connection.retry.base_delay, Duration::from_millis(500));
        assert_eq!(config.connection.retry.max_delay, Duration::from_secs(30));
        assert_eq!(config.connection.timeouts.heartbeat_interval, Duration::from_secs(15));
        assert_eq!(config.connection.timeouts.mesh_collection, Duration::from_secs(4));
        assert_eq!(config.connection.timeouts.handshake, Duration::from_secs(10));

        assert_eq!(config.connections.len(), 2);
        let kitchen = &config.connections[1];
        assert_eq!(kitchen.endpoint, [0x1a, 0x2b, 0x3c, 0x4d]);
        assert!(kitchen.tls.enabled);
        assert_eq!(kitchen.host(), "kitchen.local");
        assert_eq!(config.primary_index(), Some(1));
    }

    #[test]
    fn test_missing_file_uses_defaults() {
        let config = BridgeConfig::load_from_file("/nonexistent/bridge.yaml").unwrap();
        assert!(config.connections.is_empty());
    }

    #[test]
    fn test_malformed_file_is_an_error() {
        let mut temp_file = NamedTempFile::new().unwrap();
        temp_file.write_all(b"poll_interval: soon\n").unwrap();
        assert!(BridgeConfig::load_from_file(temp_file.path()).is_err());
    }

    #[test]
    fn test_unknown_keys_are_rejected() {
        assert!(BridgeConfig::from_yaml("pol_interval: 5s\n").is_err());
    }

    #[test]
    fn test_first_connection_is_primary_by_default() {
        let yaml = SAMPLE.replace("    primary: true\n", "");
        let config = BridgeConfig::from_yaml(&yaml).unwrap();
        assert_eq!(config.primary_index(), Some(0));
    }

    #[test]
    fn test_environment_overrides() {
        let mut config = BridgeConfig::from_yaml(SAMPLE).unwrap();
        let env: HashMap<&str, &str> = [
            ("BRIDGE_LOG_LEVEL", "warn"),
            ("BRIDGE_POLL_INTERVAL", "45s"),
            ("BRIDGE_PRIMARY", "living-room"),
        ]
        .into_iter()
        .collect();

        config
            .apply_overrides(|key| env.get(key).map(|v| v.to_string()))
            .unwrap();

        assert_eq!(config.log_level, "warn");
        assert_eq!(config.poll_interval, Duration::from_secs(45));
        assert_eq!(config.primary_index(), Some(0));
        assert!(!config.connections[1].primary);
    }

    #[test]
    fn test_unknown_primary_is_rejected() {
        let mut config = BridgeConfig::from_yaml(SAMPLE).unwrap();
        assert!(config.set_primary("garage").is_err());
    }

    #[test]
    fn test_endpoint_parsing() {
        assert_eq!(parse_endpoint("3987C857").unwrap(), [0x39, 0x87, 0xC8, 0x57]);
        assert!(parse_endpoint("3987c8").is_err());
        assert!(parse_endpoint("zz87c857").is_err());
    }

    #[test]
    fn test_duplicate_names_are_rejected() {
        let yaml = SAMPLE.replace("name: kitchen", "name: living-room");
        assert!(BridgeConfig::from_yaml(&yaml).is_err());
    }
}
