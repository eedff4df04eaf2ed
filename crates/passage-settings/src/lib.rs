//! TOML configuration for the passage proxy.
//!
//! Provides structured configuration types for the proxy server and the
//! DNS resolver, loading from a single TOML file:
//!
//! ```toml
//! [proxy]
//! bind_addr = "127.0.0.1:3128"
//! io_chunk_size = 32768
//! idle_connection_timeout_secs = 300
//!
//! [dns]
//! cache_cleanup_period_secs = 10
//! ```
//!
//! Every field has a default, so an empty file (or no file at all) yields a
//! runnable configuration.

mod loader;

pub use loader::ConfigLoader;

use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

/// Errors from settings operations.
#[derive(Error, Debug)]
pub enum SettingsError {
    /// TOML deserialization failed.
    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    /// TOML serialization failed.
    #[error("failed to serialize config: {0}")]
    Serialize(#[from] toml::ser::Error),

    /// I/O error reading or writing a config file.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// A field value is outside its allowed range.
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Settings for the connection-serving proxy.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProxySection {
    /// Address the proxy listens on.
    /// Default: `127.0.0.1:3128`
    pub bind_addr: SocketAddr,

    /// Timeout for establishing the outbound connection.
    /// Default: 30 seconds
    pub connect_timeout_secs: u64,

    /// Maximum concurrent connections; further clients are dropped.
    /// Default: 1000
    pub max_connections: usize,

    /// Maximum bytes moved per read step, per direction.
    /// Must be positive. Default: 32 KiB
    pub io_chunk_size: usize,

    /// A connection with no successful read for this long is closed.
    /// Default: 300 seconds
    pub idle_connection_timeout_secs: u64,

    /// Cadence of the per-connection supervision timer.
    /// Must be positive. Default: 1000 ms
    pub tick_interval_ms: u64,

    /// Per-direction byte budget granted on each timer tick.
    /// `None` disables traffic limiting. Default: `None`
    pub bytes_per_tick: Option<usize>,
}

impl Default for ProxySection {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:3128".parse().expect("hardcoded loopback address"),
            connect_timeout_secs: 30,
            max_connections: 1000,
            io_chunk_size: 32 * 1024,
            idle_connection_timeout_secs: 300,
            tick_interval_ms: 1000,
            bytes_per_tick: None,
        }
    }
}

impl ProxySection {
    /// Outbound connect timeout as a [`Duration`].
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    /// Idle-connection timeout as a [`Duration`].
    pub fn idle_connection_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_connection_timeout_secs)
    }

    /// Supervision timer period as a [`Duration`].
    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_interval_ms)
    }
}

/// Settings for the DNS resolver agent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DnsSection {
    /// Cadence of cache sweeps that evict expired entries.
    /// Must be positive. Default: 10 seconds
    pub cache_cleanup_period_secs: u64,
}

impl Default for DnsSection {
    fn default() -> Self {
        Self {
            cache_cleanup_period_secs: 10,
        }
    }
}

impl DnsSection {
    /// Cache-cleanup period as a [`Duration`].
    pub fn cache_cleanup_period(&self) -> Duration {
        Duration::from_secs(self.cache_cleanup_period_secs)
    }
}

/// Complete passage configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PassageConfig {
    pub proxy: ProxySection,
    pub dns: DnsSection,
}

impl PassageConfig {
    /// Load configuration from a TOML file.
    ///
    /// # Errors
    /// * `SettingsError::Io` - The file could not be read.
    /// * `SettingsError::Parse` - The file is not valid TOML for this schema.
    pub fn load(path: &Path) -> Result<Self, SettingsError> {
        let contents = std::fs::read_to_string(path)?;
        Ok(toml::from_str(&contents)?)
    }

    /// Write the configuration to a TOML file.
    ///
    /// # Errors
    /// * `SettingsError::Serialize` - The configuration could not be rendered.
    /// * `SettingsError::Io` - The file could not be written.
    pub fn save(&self, path: &Path) -> Result<(), SettingsError> {
        let contents = toml::to_string_pretty(self)?;
        std::fs::write(path, contents)?;
        Ok(())
    }

    /// Check field ranges that serde cannot express.
    ///
    /// # Errors
    /// * `SettingsError::Invalid` - A field is zero that must be positive.
    pub fn validate(&self) -> Result<(), SettingsError> {
        if self.proxy.io_chunk_size == 0 {
            return Err(SettingsError::Invalid(
                "proxy.io_chunk_size must be positive".to_string(),
            ));
        }
        if self.proxy.tick_interval_ms == 0 {
            return Err(SettingsError::Invalid(
                "proxy.tick_interval_ms must be positive".to_string(),
            ));
        }
        if self.dns.cache_cleanup_period_secs == 0 {
            return Err(SettingsError::Invalid(
                "dns.cache_cleanup_period_secs must be positive".to_string(),
            ));
        }
        if let Some(0) = self.proxy.bytes_per_tick {
            return Err(SettingsError::Invalid(
                "proxy.bytes_per_tick must be positive when set".to_string(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // ========================================================================
    // Defaults
    // ========================================================================

    #[test]
    fn test_proxy_section_defaults() {
        let proxy = ProxySection::default();
        assert_eq!(proxy.bind_addr.port(), 3128);
        assert!(proxy.bind_addr.ip().is_loopback());
        assert_eq!(proxy.connect_timeout(), Duration::from_secs(30));
        assert_eq!(proxy.idle_connection_timeout(), Duration::from_secs(300));
        assert_eq!(proxy.tick_interval(), Duration::from_millis(1000));
        assert_eq!(proxy.io_chunk_size, 32 * 1024);
        assert_eq!(proxy.max_connections, 1000);
        assert!(proxy.bytes_per_tick.is_none());
    }

    #[test]
    fn test_dns_section_defaults() {
        let dns = DnsSection::default();
        assert_eq!(dns.cache_cleanup_period(), Duration::from_secs(10));
    }

    #[test]
    fn test_default_config_is_valid() {
        PassageConfig::default().validate().unwrap();
    }

    // ========================================================================
    // Parsing
    // ========================================================================

    #[test]
    fn test_empty_file_yields_defaults() {
        let config: PassageConfig = toml::from_str("").unwrap();
        assert_eq!(config, PassageConfig::default());
    }

    #[test]
    fn test_partial_section_keeps_other_defaults() {
        let config: PassageConfig =
            toml::from_str("[proxy]\nio_chunk_size = 4096\n").unwrap();
        assert_eq!(config.proxy.io_chunk_size, 4096);
        assert_eq!(config.proxy.max_connections, 1000);
        assert_eq!(config.dns, DnsSection::default());
    }

    #[test]
    fn test_parse_all_fields() {
        let config: PassageConfig = toml::from_str(
            "[proxy]\n\
             bind_addr = \"0.0.0.0:8080\"\n\
             connect_timeout_secs = 5\n\
             max_connections = 32\n\
             io_chunk_size = 1024\n\
             idle_connection_timeout_secs = 60\n\
             tick_interval_ms = 250\n\
             bytes_per_tick = 65536\n\
             [dns]\n\
             cache_cleanup_period_secs = 3\n",
        )
        .unwrap();
        assert_eq!(config.proxy.bind_addr.port(), 8080);
        assert_eq!(config.proxy.connect_timeout_secs, 5);
        assert_eq!(config.proxy.max_connections, 32);
        assert_eq!(config.proxy.bytes_per_tick, Some(65536));
        assert_eq!(config.dns.cache_cleanup_period_secs, 3);
    }

    #[test]
    fn test_parse_ignores_unknown_fields() {
        // Older binaries tolerate newer config files.
        let config: PassageConfig =
            toml::from_str("[proxy]\nfuture_knob = true\n").unwrap();
        assert_eq!(config.proxy, ProxySection::default());
    }

    // ========================================================================
    // Validation
    // ========================================================================

    #[test]
    fn test_validate_rejects_zero_chunk_size() {
        let mut config = PassageConfig::default();
        config.proxy.io_chunk_size = 0;
        assert!(matches!(
            config.validate(),
            Err(SettingsError::Invalid(msg)) if msg.contains("io_chunk_size")
        ));
    }

    #[test]
    fn test_validate_rejects_zero_tick_interval() {
        let mut config = PassageConfig::default();
        config.proxy.tick_interval_ms = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_zero_cleanup_period() {
        let mut config = PassageConfig::default();
        config.dns.cache_cleanup_period_secs = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_zero_rate() {
        let mut config = PassageConfig::default();
        config.proxy.bytes_per_tick = Some(0);
        assert!(config.validate().is_err());
    }

    // ========================================================================
    // File round trip
    // ========================================================================

    #[test]
    fn test_save_and_load_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("passage.toml");

        let mut config = PassageConfig::default();
        config.proxy.io_chunk_size = 8192;
        config.dns.cache_cleanup_period_secs = 7;
        config.save(&path).unwrap();

        let loaded = PassageConfig::load(&path).unwrap();
        assert_eq!(loaded, config);
    }

    #[test]
    fn test_load_missing_file_is_io_error() {
        let dir = tempfile::tempdir().unwrap();
        let result = PassageConfig::load(&dir.path().join("absent.toml"));
        assert!(matches!(result, Err(SettingsError::Io(_))));
    }

    #[test]
    fn test_load_malformed_file_is_parse_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("passage.toml");
        std::fs::write(&path, "not valid toml :::").unwrap();
        let result = PassageConfig::load(&path);
        assert!(matches!(result, Err(SettingsError::Parse(_))));
    }
}
