// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Plugin configuration.
//!
//! Loaded from TOML; every field has a default so an empty file is valid.

use crate::device::DeviceSettings;
use crate::protocol::OfVersion;
use crate::role::RetryPolicy;
use serde::{Deserialize, Serialize};
use std::net::{IpAddr, Ipv4Addr};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

/// Configuration errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("TOML parse error: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("TOML serialize error: {0}")]
    Serialize(#[from] toml::ser::Error),

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PluginConfig {
    /// Listen address.
    #[serde(default = "default_bind_address")]
    pub bind_address: IpAddr,

    /// Listen port.
    #[serde(default = "default_port")]
    pub port: u16,

    /// Simultaneous transports (0 = unlimited).
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,

    #[serde(default)]
    pub tls_enabled: bool,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tls_cert_path: Option<PathBuf>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tls_key_path: Option<PathBuf>,

    /// Wire versions offered in the hello, any order.
    #[serde(default = "default_supported_versions")]
    pub supported_versions: Vec<OfVersion>,

    /// Advertise and honour hello version bitmaps.
    #[serde(default = "default_true")]
    pub use_version_bitmap: bool,

    #[serde(default = "default_request_timeout")]
    pub request_timeout_ms: u64,

    #[serde(default = "default_sweep_interval")]
    pub timeout_sweep_interval_ms: u64,

    /// Fall back to SLAVE if ownership stays undecided this long.
    #[serde(default = "default_role_wait")]
    pub role_wait_timeout_secs: u64,

    #[serde(default = "default_retry_initial")]
    pub ownership_retry_initial_ms: u64,

    #[serde(default = "default_retry_max")]
    pub ownership_retry_max_ms: u64,

    #[serde(default = "default_retry_attempts")]
    pub ownership_retry_attempts: u32,

    /// 0 disables the hold time.
    #[serde(default)]
    pub device_connection_hold_time_ms: u64,

    /// 0 = unlimited.
    #[serde(default)]
    pub connection_rate_limit_per_sec: u32,

    #[serde(default = "default_history_capacity")]
    pub history_capacity: usize,

    #[serde(default = "default_outbound_queue_capacity")]
    pub outbound_queue_capacity: usize,

    #[serde(default = "default_max_message_size")]
    pub max_message_size: usize,

    /// Statistics log period (0 = off).
    #[serde(default = "default_stats_interval")]
    pub stats_interval_secs: u64,
}

fn default_bind_address() -> IpAddr {
    IpAddr::V4(Ipv4Addr::UNSPECIFIED)
}

fn default_port() -> u16 {
    6653
}

fn default_max_connections() -> usize {
    1000
}

fn default_supported_versions() -> Vec<OfVersion> {
    vec![OfVersion::V1_3, OfVersion::V1_0]
}

fn default_true() -> bool {
    true
}

fn default_request_timeout() -> u64 {
    10_000
}

fn default_sweep_interval() -> u64 {
    250
}

fn default_role_wait() -> u64 {
    10
}

fn default_retry_initial() -> u64 {
    100
}

fn default_retry_max() -> u64 {
    5_000
}

fn default_retry_attempts() -> u32 {
    10
}

fn default_history_capacity() -> usize {
    10_000
}

fn default_outbound_queue_capacity() -> usize {
    1024
}

fn default_max_message_size() -> usize {
    65535
}

fn default_stats_interval() -> u64 {
    30
}

impl Default for PluginConfig {
    fn default() -> Self {
        Self {
            bind_address: default_bind_address(),
            port: default_port(),
            max_connections: default_max_connections(),
            tls_enabled: false,
            tls_cert_path: None,
            tls_key_path: None,
            supported_versions: default_supported_versions(),
            use_version_bitmap: true,
            request_timeout_ms: default_request_timeout(),
            timeout_sweep_interval_ms: default_sweep_interval(),
            role_wait_timeout_secs: default_role_wait(),
            ownership_retry_initial_ms: default_retry_initial(),
            ownership_retry_max_ms: default_retry_max(),
            ownership_retry_attempts: default_retry_attempts(),
            device_connection_hold_time_ms: 0,
            connection_rate_limit_per_sec: 0,
            history_capacity: default_history_capacity(),
            outbound_queue_capacity: default_outbound_queue_capacity(),
            max_message_size: default_max_message_size(),
            stats_interval_secs: default_stats_interval(),
        }
    }
}

impl PluginConfig {
    /// Load and validate a TOML file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        let config: Self = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn to_toml(&self) -> Result<String, ConfigError> {
        Ok(toml::to_string_pretty(self)?)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn timeout_sweep_interval(&self) -> Duration {
        Duration::from_millis(self.timeout_sweep_interval_ms)
    }

    pub fn role_wait_timeout(&self) -> Duration {
        Duration::from_secs(self.role_wait_timeout_secs)
    }

    pub fn device_connection_hold_time(&self) -> Duration {
        Duration::from_millis(self.device_connection_hold_time_ms)
    }

    pub fn stats_interval(&self) -> Option<Duration> {
        (self.stats_interval_secs > 0).then(|| Duration::from_secs(self.stats_interval_secs))
    }

    pub fn ownership_retry(&self) -> RetryPolicy {
        RetryPolicy {
            initial: Duration::from_millis(self.ownership_retry_initial_ms),
            max: Duration::from_millis(self.ownership_retry_max_ms),
            attempts: self.ownership_retry_attempts,
        }
    }

    /// Settings handed to every device context.
    pub fn device_settings(&self) -> DeviceSettings {
        DeviceSettings {
            supported_versions: self.supported_versions.clone(),
            use_version_bitmap: self.use_version_bitmap,
            request_timeout: self.request_timeout(),
            role_wait_timeout: self.role_wait_timeout(),
            ownership_retry: self.ownership_retry(),
        }
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.supported_versions.is_empty() {
            return Err(ConfigError::Invalid("supported_versions is empty".into()));
        }
        if let Some(unknown) = self.supported_versions.iter().find(|v| !v.is_known()) {
            return Err(ConfigError::Invalid(format!(
                "Unknown OpenFlow wire version {}",
                unknown.0
            )));
        }

        if self.tls_enabled && (self.tls_cert_path.is_none() || self.tls_key_path.is_none()) {
            return Err(ConfigError::Invalid(
                "TLS enabled but tls_cert_path or tls_key_path missing".into(),
            ));
        }

        if self.request_timeout_ms == 0 {
            return Err(ConfigError::Invalid("request_timeout_ms must be > 0".into()));
        }
        if self.timeout_sweep_interval_ms == 0 {
            return Err(ConfigError::Invalid(
                "timeout_sweep_interval_ms must be > 0".into(),
            ));
        }
        if self.role_wait_timeout_secs == 0 {
            return Err(ConfigError::Invalid(
                "role_wait_timeout_secs must be > 0".into(),
            ));
        }
        if self.history_capacity == 0 {
            return Err(ConfigError::Invalid("history_capacity must be > 0".into()));
        }
        if self.outbound_queue_capacity == 0 {
            return Err(ConfigError::Invalid(
                "outbound_queue_capacity must be > 0".into(),
            ));
        }
        if self.ownership_retry_initial_ms > self.ownership_retry_max_ms {
            return Err(ConfigError::Invalid(format!(
                "ownership_retry_initial_ms ({}) exceeds ownership_retry_max_ms ({})",
                self.ownership_retry_initial_ms, self.ownership_retry_max_ms
            )));
        }
        if self.max_message_size < 8 {
            return Err(ConfigError::Invalid(format!(
                "max_message_size too small: {}",
                self.max_message_size
            )));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_default_is_valid() {
        let config = PluginConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.port, 6653);
        assert_eq!(
            config.supported_versions,
            vec![OfVersion::V1_3, OfVersion::V1_0]
        );
        assert_eq!(config.request_timeout(), Duration::from_secs(10));
        assert_eq!(config.stats_interval(), Some(Duration::from_secs(30)));
    }

    #[test]
    fn test_from_file_partial() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(
            file,
            r#"
port = 6633
supported_versions = [4]
request_timeout_ms = 500
device_connection_hold_time_ms = 2000
"#
        )
        .unwrap();

        let config = PluginConfig::from_file(file.path()).unwrap();
        assert_eq!(config.port, 6633);
        assert_eq!(config.supported_versions, vec![OfVersion::V1_3]);
        assert_eq!(config.request_timeout(), Duration::from_millis(500));
        assert_eq!(config.device_connection_hold_time(), Duration::from_secs(2));
        assert_eq!(config.history_capacity, 10_000);
    }

    #[test]
    fn test_empty_file_is_default() {
        let file = NamedTempFile::new().unwrap();
        let config = PluginConfig::from_file(file.path()).unwrap();
        assert_eq!(config, PluginConfig::default());
    }

    #[test]
    fn test_toml_round_trip() {
        let config = PluginConfig::default();
        let text = config.to_toml().unwrap();
        let parsed: PluginConfig = toml::from_str(&text).unwrap();
        assert_eq!(parsed, config);
    }

    #[test]
    fn test_validation_failures() {
        let cases = [
            PluginConfig {
                supported_versions: Vec::new(),
                ..PluginConfig::default()
            },
            PluginConfig {
                supported_versions: vec![OfVersion(0x2a)],
                ..PluginConfig::default()
            },
            PluginConfig {
                tls_enabled: true,
                tls_cert_path: Some("cert.pem".into()),
                ..PluginConfig::default()
            },
            PluginConfig {
                request_timeout_ms: 0,
                ..PluginConfig::default()
            },
            PluginConfig {
                history_capacity: 0,
                ..PluginConfig::default()
            },
            PluginConfig {
                ownership_retry_initial_ms: 10_000,
                ..PluginConfig::default()
            },
            PluginConfig {
                max_message_size: 4,
                ..PluginConfig::default()
            },
        ];
        for config in cases {
            assert!(
                matches!(config.validate(), Err(ConfigError::Invalid(_))),
                "{:?} should be invalid",
                config
            );
        }
    }

    #[test]
    fn test_missing_file() {
        assert!(matches!(
            PluginConfig::from_file("/nonexistent/ofplugin.toml"),
            Err(ConfigError::Io(_))
        ));
    }
}
