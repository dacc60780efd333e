//! ---
//! gw_section: "01-core-functionality"
//! gw_subsection: "module"
//! gw_type: "source"
//! gw_scope: "code"
//! gw_description: "Shared primitives and utilities for the gateway runtime."
//! gw_version: "v0.0.0-prealpha"
//! gw_owner: "tbd"
//! ---
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};
use serde_with::{serde_as, DurationMilliSeconds, DurationSeconds};
use tracing::debug;

use crate::logging::LogFormat;

fn default_adapter_id() -> String {
    "0x0".to_owned()
}

fn default_fw_version() -> String {
    env!("CARGO_PKG_VERSION").to_owned()
}

fn default_protocol_version() -> String {
    "1.1".to_owned()
}

fn default_gateway_type() -> String {
    "other".to_owned()
}

fn default_server_host() -> String {
    "localhost".to_owned()
}

fn default_server_port() -> u16 {
    9092
}

fn default_server_uri() -> String {
    "/".to_owned()
}

fn default_socket_timeout() -> Duration {
    Duration::from_secs(5)
}

fn default_receive_timeout() -> Duration {
    Duration::from_secs(3)
}

fn default_reconnect_delay() -> Duration {
    Duration::from_secs(5)
}

fn default_response_poll_interval() -> Duration {
    Duration::from_secs(1)
}

fn default_response_attempts() -> u32 {
    10
}

fn default_receive_queue_capacity() -> usize {
    10
}

fn default_true() -> bool {
    true
}

fn default_keepalive_time() -> Duration {
    Duration::from_secs(900)
}

fn default_keepalive_interval() -> Duration {
    Duration::from_secs(60)
}

fn default_keepalive_probes() -> u32 {
    8
}

fn default_minimal_items_cached() -> usize {
    10
}

fn default_minimal_saving_time() -> u64 {
    10
}

fn default_permanent_cache_path() -> PathBuf {
    PathBuf::from("/tmp/permanent.cache")
}

fn default_drain_interval() -> Duration {
    Duration::from_secs(2)
}

fn default_lock_timeout() -> Duration {
    Duration::from_secs(2)
}

fn default_geek_mode_path() -> PathBuf {
    PathBuf::from("/tmp/geek_mode")
}

fn default_distributor_cadence() -> Duration {
    Duration::from_millis(100)
}

fn default_history_limit() -> usize {
    1024
}

fn default_data_topic() -> String {
    "BeeeOn/sensors".to_owned()
}

fn default_qos() -> u8 {
    2
}

fn default_logging_directory() -> PathBuf {
    PathBuf::from("logs")
}

fn default_log_format() -> LogFormat {
    LogFormat::StructuredJson
}

/// Primary configuration object for the gateway daemon.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub gateway: GatewayConfig,
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub cache: CacheConfig,
    #[serde(default)]
    pub distributor: DistributorConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Metadata describing where an [`AppConfig`] was loaded from.
#[derive(Debug, Clone)]
pub struct LoadedAppConfig {
    pub config: AppConfig,
    pub source: PathBuf,
}

impl AppConfig {
    pub const ENV_CONFIG_PATH: &str = "ADAGW_CONFIG";

    /// Load configuration from disk, respecting the `ADAGW_CONFIG` override.
    pub fn load<P: AsRef<Path>>(candidates: &[P]) -> Result<Self> {
        Ok(Self::load_with_source(candidates)?.config)
    }

    /// Load configuration from disk together with the effective source path.
    pub fn load_with_source<P: AsRef<Path>>(candidates: &[P]) -> Result<LoadedAppConfig> {
        if let Ok(env_path) = std::env::var(Self::ENV_CONFIG_PATH) {
            if !env_path.trim().is_empty() {
                let path = PathBuf::from(env_path);
                let config = Self::from_path(&path)?;
                return Ok(LoadedAppConfig {
                    config,
                    source: path,
                });
            }
        }

        for candidate in candidates {
            if candidate.as_ref().exists() {
                let path = candidate.as_ref().to_path_buf();
                let config = Self::from_path(&path)?;
                return Ok(LoadedAppConfig {
                    config,
                    source: path,
                });
            }
        }

        Err(anyhow!(
            "no configuration files found. inspected: {}",
            candidates
                .iter()
                .map(|p| p.as_ref().display().to_string())
                .collect::<Vec<_>>()
                .join(", ")
        ))
    }

    fn from_path(path: &Path) -> Result<Self> {
        debug!(config_path = %path.display(), "loading configuration");
        let contents = fs::read_to_string(path)
            .with_context(|| format!("unable to read config file {}", path.display()))?;
        let config = toml::from_str::<AppConfig>(&contents)
            .with_context(|| format!("failed to parse config file {}", path.display()))?;
        config.validate()?;
        Ok(config)
    }

    /// Validate structural invariants.
    pub fn validate(&self) -> Result<()> {
        self.gateway.validate()?;
        self.server.validate()?;
        self.cache.validate()?;
        self.distributor.validate()?;
        Ok(())
    }

    /// Render the effective configuration back to TOML.
    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self).context("failed to render configuration")
    }
}

impl std::str::FromStr for AppConfig {
    type Err = anyhow::Error;

    fn from_str(content: &str) -> std::result::Result<Self, Self::Err> {
        let config: AppConfig =
            toml::from_str(content).with_context(|| "failed to parse configuration")?;
        config.validate()?;
        Ok(config)
    }
}

/// Identity the gateway reports in every envelope.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayConfig {
    #[serde(default = "default_adapter_id")]
    pub adapter_id: String,
    #[serde(default = "default_fw_version")]
    pub fw_version: String,
    #[serde(default = "default_protocol_version")]
    pub protocol_version: String,
    #[serde(rename = "type", default = "default_gateway_type")]
    pub gateway_type: String,
}

impl GatewayConfig {
    fn validate(&self) -> Result<()> {
        if self.adapter_id.trim().is_empty() {
            return Err(anyhow!("gateway.adapter_id must not be empty"));
        }
        if self.protocol_version.trim().parse::<f32>().is_err() {
            return Err(anyhow!(
                "gateway.protocol_version '{}' is not numeric",
                self.protocol_version
            ));
        }
        Ok(())
    }
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            adapter_id: default_adapter_id(),
            fw_version: default_fw_version(),
            protocol_version: default_protocol_version(),
            gateway_type: default_gateway_type(),
        }
    }
}

/// Which server transport the daemon runs.
#[derive(Debug, Copy, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum LinkKind {
    /// One request per connection plus a dedicated receive connection.
    #[default]
    Synchronous,
    /// Single full-duplex socket with request/response ids.
    Correlated,
}

#[serde_as]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_server_host")]
    pub host: String,
    #[serde(default = "default_server_port")]
    pub port: u16,
    #[serde(default = "default_server_uri")]
    pub uri: String,
    #[serde(default)]
    pub link: LinkKind,
    #[serde_as(as = "DurationSeconds<u64>")]
    #[serde(default = "default_socket_timeout")]
    pub timeout: Duration,
    #[serde_as(as = "DurationSeconds<u64>")]
    #[serde(default = "default_receive_timeout")]
    pub receive_timeout: Duration,
    #[serde_as(as = "DurationSeconds<u64>")]
    #[serde(default = "default_reconnect_delay")]
    pub reconnect_delay: Duration,
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    #[serde(default = "default_response_poll_interval")]
    pub response_poll_interval: Duration,
    #[serde(default = "default_response_attempts")]
    pub response_attempts: u32,
    #[serde(default = "default_receive_queue_capacity")]
    pub receive_queue_capacity: usize,
    #[serde(default)]
    pub tls: TlsSettings,
    #[serde(default)]
    pub keepalive: KeepaliveConfig,
}

impl ServerConfig {
    fn validate(&self) -> Result<()> {
        if self.host.trim().is_empty() {
            return Err(anyhow!("server.host must not be empty"));
        }
        if self.port == 0 {
            return Err(anyhow!("server.port must be non-zero"));
        }
        if !self.uri.starts_with('/') {
            return Err(anyhow!("server.uri '{}' must start with '/'", self.uri));
        }
        if self.response_attempts == 0 {
            return Err(anyhow!("server.response_attempts must be at least 1"));
        }
        if self.receive_queue_capacity == 0 {
            return Err(anyhow!("server.receive_queue_capacity must be at least 1"));
        }
        self.tls.validate()
    }

    /// Host name presented during the TLS handshake.
    pub fn tls_server_name(&self) -> &str {
        self.tls.server_name.as_deref().unwrap_or(&self.host)
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_server_host(),
            port: default_server_port(),
            uri: default_server_uri(),
            link: LinkKind::default(),
            timeout: default_socket_timeout(),
            receive_timeout: default_receive_timeout(),
            reconnect_delay: default_reconnect_delay(),
            response_poll_interval: default_response_poll_interval(),
            response_attempts: default_response_attempts(),
            receive_queue_capacity: default_receive_queue_capacity(),
            tls: TlsSettings::default(),
            keepalive: KeepaliveConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TlsSettings {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default)]
    pub ca_file: Option<PathBuf>,
    #[serde(default)]
    pub certificate: Option<PathBuf>,
    #[serde(default)]
    pub private_key: Option<PathBuf>,
    #[serde(default)]
    pub server_name: Option<String>,
}

impl TlsSettings {
    fn validate(&self) -> Result<()> {
        if !self.enabled {
            return Ok(());
        }
        if self.ca_file.is_none() {
            return Err(anyhow!("server.tls.ca_file is required when tls is enabled"));
        }
        if self.certificate.is_some() != self.private_key.is_some() {
            return Err(anyhow!(
                "server.tls.certificate and server.tls.private_key must be set together"
            ));
        }
        Ok(())
    }
}

impl Default for TlsSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            ca_file: None,
            certificate: None,
            private_key: None,
            server_name: None,
        }
    }
}

/// TCP keepalive applied to the long-lived receive connection.
#[serde_as]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KeepaliveConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde_as(as = "DurationSeconds<u64>")]
    #[serde(default = "default_keepalive_time")]
    pub time: Duration,
    #[serde_as(as = "DurationSeconds<u64>")]
    #[serde(default = "default_keepalive_interval")]
    pub interval: Duration,
    #[serde(default = "default_keepalive_probes")]
    pub probes: u32,
}

impl Default for KeepaliveConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            time: default_keepalive_time(),
            interval: default_keepalive_interval(),
            probes: default_keepalive_probes(),
        }
    }
}

#[serde_as]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    #[serde(default = "default_minimal_items_cached")]
    pub minimal_items_cached: usize,
    /// Minutes the queue must stay non-empty before it is written to disk.
    #[serde(default = "default_minimal_saving_time")]
    pub minimal_saving_time: u64,
    #[serde(default = "default_permanent_cache_path")]
    pub permanent_cache_path: PathBuf,
    #[serde_as(as = "DurationSeconds<u64>")]
    #[serde(default = "default_drain_interval")]
    pub drain_interval: Duration,
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    #[serde(default = "default_lock_timeout")]
    pub lock_timeout: Duration,
}

impl CacheConfig {
    pub fn minimal_saving_interval(&self) -> Duration {
        Duration::from_secs(self.minimal_saving_time.saturating_mul(60))
    }

    fn validate(&self) -> Result<()> {
        if self.permanent_cache_path.as_os_str().is_empty() {
            return Err(anyhow!("cache.permanent_cache_path must not be empty"));
        }
        if self.drain_interval.is_zero() {
            return Err(anyhow!("cache.drain_interval must be positive"));
        }
        Ok(())
    }
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            minimal_items_cached: default_minimal_items_cached(),
            minimal_saving_time: default_minimal_saving_time(),
            permanent_cache_path: default_permanent_cache_path(),
            drain_interval: default_drain_interval(),
            lock_timeout: default_lock_timeout(),
        }
    }
}

#[serde_as]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DistributorConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub geek_mode_enabled: bool,
    #[serde(default = "default_geek_mode_path")]
    pub geek_mode_path: PathBuf,
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    #[serde(default = "default_distributor_cadence")]
    pub cadence: Duration,
    #[serde(default = "default_history_limit")]
    pub history_limit: usize,
    #[serde(default = "default_data_topic")]
    pub data_topic: String,
    #[serde(default = "default_qos")]
    pub qos: u8,
}

impl DistributorConfig {
    fn validate(&self) -> Result<()> {
        if self.qos > 2 {
            return Err(anyhow!("distributor.qos must be 0, 1 or 2"));
        }
        if self.history_limit == 0 {
            return Err(anyhow!("distributor.history_limit must be at least 1"));
        }
        if self.cadence.is_zero() {
            return Err(anyhow!("distributor.cadence must be positive"));
        }
        Ok(())
    }
}

impl Default for DistributorConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            geek_mode_enabled: false,
            geek_mode_path: default_geek_mode_path(),
            cadence: default_distributor_cadence(),
            history_limit: default_history_limit(),
            data_topic: default_data_topic(),
            qos: default_qos(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_logging_directory")]
    pub directory: PathBuf,
    #[serde(default = "default_log_format")]
    pub format: LogFormat,
    #[serde(default)]
    pub file_prefix: Option<String>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            directory: default_logging_directory(),
            format: default_log_format(),
            file_prefix: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
[gateway]
adapter_id = "0xA1B2"
protocol_version = "1.1"

[server]
host = "gw.example.net"
port = 4444
link = "correlated"
response_poll_interval = 250

[server.tls]
enabled = false

[cache]
minimal_items_cached = 3
minimal_saving_time = 2
permanent_cache_path = "/var/lib/adagw/cache"

[distributor]
enabled = true
geek_mode_enabled = true
"#;

    #[test]
    fn parses_sample_with_defaults() {
        let config: AppConfig = SAMPLE.parse().unwrap();
        assert_eq!(config.gateway.adapter_id, "0xA1B2");
        assert_eq!(config.server.link, LinkKind::Correlated);
        assert_eq!(
            config.server.response_poll_interval,
            Duration::from_millis(250)
        );
        assert_eq!(config.server.timeout, Duration::from_secs(5));
        assert_eq!(config.server.keepalive.probes, 8);
        assert_eq!(config.cache.minimal_saving_interval(), Duration::from_secs(120));
        assert_eq!(config.cache.drain_interval, Duration::from_secs(2));
        assert_eq!(config.distributor.data_topic, "BeeeOn/sensors");
        assert_eq!(config.distributor.cadence, Duration::from_millis(100));
    }

    #[test]
    fn tls_requires_ca_file() {
        let err = "[server]\nhost = \"a\"\n".parse::<AppConfig>().unwrap_err();
        assert!(err.to_string().contains("ca_file"));
    }

    #[test]
    fn client_identity_must_be_complete() {
        let raw = r#"
[server.tls]
ca_file = "/etc/adagw/ca.pem"
certificate = "/etc/adagw/gw.pem"
"#;
        let err = raw.parse::<AppConfig>().unwrap_err();
        assert!(err.to_string().contains("private_key"));
    }

    #[test]
    fn load_with_source_reports_candidates() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("absent.toml");
        let err = AppConfig::load_with_source(&[missing.clone()]).unwrap_err();
        assert!(err.to_string().contains(&missing.display().to_string()));

        let present = dir.path().join("adagw.toml");
        fs::write(&present, SAMPLE).unwrap();
        let loaded = AppConfig::load_with_source(&[missing, present.clone()]).unwrap();
        assert_eq!(loaded.source, present);
        assert_eq!(loaded.config.server.port, 4444);
    }

    #[test]
    fn effective_config_renders_back_to_toml() {
        let config: AppConfig = SAMPLE.parse().unwrap();
        let rendered = config.to_toml().unwrap();
        let reparsed: AppConfig = rendered.parse().unwrap();
        assert_eq!(reparsed.server.host, "gw.example.net");
        assert_eq!(reparsed.cache.minimal_items_cached, 3);
    }

    #[test]
    fn shipped_sample_config_is_valid() {
        let config: AppConfig = include_str!("../../../configs/adagw.toml").parse().unwrap();
        assert_eq!(config.server.link, LinkKind::Synchronous);
        assert_eq!(config.server.response_poll_interval, Duration::from_secs(1));
        assert_eq!(config.cache.lock_timeout, Duration::from_secs(2));
        assert_eq!(config.logging.format, LogFormat::StructuredJson);
    }
}
