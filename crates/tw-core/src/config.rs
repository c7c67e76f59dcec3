//! Engine configuration
//!
//! All sections are optional in the TOML file; missing fields fall back
//! to the defaults below. Durations are written as integer seconds
//! (`cache_ttl = 30`) except where noted.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// Top-level engine configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Directory service settings
    pub directory: DirectoryConfig,
    /// Tunnel binary and supervision settings
    pub tunnel: TunnelConfig,
    /// Privilege grant renewal settings
    pub grant: GrantConfig,
    /// Observer server settings
    pub observer: ObserverConfig,
}

/// Directory service client settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DirectoryConfig {
    /// Base URL of the directory service API
    pub api_url: String,

    /// How long a fetched host list stays fresh
    #[serde(with = "serde_utils::duration_secs")]
    pub cache_ttl: Duration,

    /// HTTP request timeout
    #[serde(with = "serde_utils::duration_secs")]
    pub request_timeout: Duration,

    /// Attempts per refresh before giving up. Failures beyond this are
    /// surfaced to the caller; the engine never retries in a loop.
    pub fetch_attempts: u32,

    /// Delay between refresh attempts, in milliseconds
    #[serde(with = "serde_utils::duration_millis")]
    pub retry_delay: Duration,
}

impl Default for DirectoryConfig {
    fn default() -> Self {
        Self {
            api_url: "https://api.nordvpn.com".to_string(),
            cache_ttl: Duration::from_secs(30),
            request_timeout: Duration::from_secs(10),
            fetch_attempts: 2,
            retry_delay: Duration::from_millis(500),
        }
    }
}

/// Tunnel binary and supervision settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TunnelConfig {
    /// Path to the external tunnel binary
    pub binary: PathBuf,

    /// Command prefix that grants the process elevated privileges.
    /// Empty means the binary is launched directly.
    pub elevation_command: Vec<String>,

    /// Stdout line that marks the tunnel as up
    pub ready_marker: String,

    /// How long to wait for the readiness marker
    #[serde(with = "serde_utils::duration_secs")]
    pub ready_timeout: Duration,

    /// Grace period between SIGTERM and SIGKILL on stop
    #[serde(with = "serde_utils::duration_secs")]
    pub stop_grace: Duration,

    /// Account username used when a connect intent carries none
    pub username: Option<String>,

    /// Account password used when a connect intent carries none
    pub password: Option<String>,
}

impl Default for TunnelConfig {
    fn default() -> Self {
        Self {
            binary: PathBuf::from("/usr/sbin/openvpn"),
            elevation_command: vec!["sudo".to_string(), "-n".to_string()],
            ready_marker: "Initialization Sequence Completed".to_string(),
            ready_timeout: Duration::from_secs(30),
            stop_grace: Duration::from_secs(5),
            username: None,
            password: None,
        }
    }
}

/// Privilege grant renewal settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GrantConfig {
    /// Renewal cadence. Must sit well inside the grant's validity
    /// window; sudo's default timestamp lifetime is several minutes.
    #[serde(with = "serde_utils::duration_secs")]
    pub renew_period: Duration,
}

impl Default for GrantConfig {
    fn default() -> Self {
        Self {
            renew_period: Duration::from_secs(30),
        }
    }
}

/// Observer server settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ObserverConfig {
    /// Bind address; loopback only, non-loopback peers are rejected
    pub bind_address: String,

    /// Per-observer message buffer. An observer that falls this far
    /// behind is dropped rather than delaying the others.
    pub channel_capacity: usize,
}

impl Default for ObserverConfig {
    fn default() -> Self {
        Self {
            bind_address: default_observer_address(),
            channel_capacity: 64,
        }
    }
}

/// Default address the observer server listens on
pub fn default_observer_address() -> String {
    "127.0.0.1:7757".to_string()
}

/// Default config file location: `~/.config/tunwarden/config.toml`
pub fn default_config_path() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("tunwarden")
        .join("config.toml")
}

/// Load an [`EngineConfig`] from a TOML file
pub fn load_config(path: &Path) -> Result<EngineConfig, ConfigError> {
    if !path.exists() {
        return Err(ConfigError::NotFound(path.to_path_buf()));
    }

    let content = std::fs::read_to_string(path)
        .map_err(|e| ConfigError::Invalid(format!("failed to read config: {e}")))?;

    let config: EngineConfig = toml::from_str(&content)?;
    Ok(config)
}

/// Serde helpers for duration fields
pub mod serde_utils {
    /// Serialize a `Duration` as whole seconds
    pub mod duration_secs {
        use serde::{Deserialize, Deserializer, Serializer};
        use std::time::Duration;

        pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
        where
            S: Serializer,
        {
            serializer.serialize_u64(duration.as_secs())
        }

        pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
        where
            D: Deserializer<'de>,
        {
            let secs = u64::deserialize(deserializer)?;
            Ok(Duration::from_secs(secs))
        }
    }

    /// Serialize a `Duration` as whole milliseconds
    pub mod duration_millis {
        use serde::{Deserialize, Deserializer, Serializer};
        use std::time::Duration;

        pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
        where
            S: Serializer,
        {
            serializer.serialize_u64(duration.as_millis() as u64)
        }

        pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
        where
            D: Deserializer<'de>,
        {
            let millis = u64::deserialize(deserializer)?;
            Ok(Duration::from_millis(millis))
        }
    }
}
