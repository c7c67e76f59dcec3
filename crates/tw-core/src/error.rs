//! Error taxonomy for the tunwarden engine

use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

use crate::types::InvalidTarget;

/// Top-level error type for the engine
#[derive(Error, Debug)]
pub enum EngineError {
    /// Directory service error
    #[error(transparent)]
    Directory(#[from] DirectoryError),

    /// Privilege grant error
    #[error(transparent)]
    Grant(#[from] GrantError),

    /// Tunnel process error
    #[error(transparent)]
    Supervisor(#[from] SupervisorError),

    /// Session state machine error
    #[error(transparent)]
    Session(#[from] SessionError),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// Malformed connect target
    #[error(transparent)]
    Target(#[from] InvalidTarget),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Directory-service errors
#[derive(Error, Debug)]
pub enum DirectoryError {
    /// Service unreachable and no usable cache to fall back on
    #[error("directory service unavailable: {0}")]
    Unavailable(String),

    /// Requested country or host is not in the directory
    #[error("no matching host for {0}")]
    NoMatchingHost(String),
}

/// Elevated-privilege grant errors
#[derive(Error, Debug)]
pub enum GrantError {
    /// Grant acquisition was rejected (bad credentials, denied prompt)
    #[error("privilege elevation denied: {0}")]
    ElevationDenied(String),

    /// Periodic renewal failed while a tunnel was active
    #[error("privilege grant renewal failed: {0}")]
    RenewalFailed(String),
}

/// Tunnel process supervision errors
#[derive(Error, Debug)]
pub enum SupervisorError {
    /// The tunnel binary failed to launch
    #[error("failed to spawn tunnel process: {0}")]
    Spawn(String),

    /// The process never signaled readiness within its timeout
    #[error("tunnel process not ready within {0:?}")]
    ReadinessTimeout(Duration),

    /// The process exited before signaling readiness
    #[error("tunnel process exited during startup{}", exit_suffix(.0))]
    EarlyExit(Option<i32>),

    /// The process survived both the graceful and the forced stop
    #[error("tunnel process {0} is still alive after SIGKILL")]
    StopFailed(u32),

    /// I/O error talking to the process
    #[error("tunnel process I/O error: {0}")]
    Io(#[from] std::io::Error),
}

fn exit_suffix(code: &Option<i32>) -> String {
    match code {
        Some(c) => format!(" (exit code {c})"),
        None => String::new(),
    }
}

/// Session state machine errors
#[derive(Error, Debug)]
pub enum SessionError {
    /// Connect/disconnect requested in an incompatible state
    #[error("session already active or request incompatible with current state")]
    AlreadyActive,

    /// No credentials were supplied and none are configured
    #[error("no tunnel credentials supplied or configured")]
    MissingCredentials,

    /// The engine is shutting down or has stopped
    #[error("engine is not running")]
    EngineStopped,
}

/// Configuration errors
#[derive(Error, Debug)]
pub enum ConfigError {
    /// Config file not found
    #[error("config file not found: {0}")]
    NotFound(PathBuf),

    /// TOML parse error
    #[error("TOML parse error: {0}")]
    Parse(#[from] toml::de::Error),

    /// Invalid configuration
    #[error("invalid config: {0}")]
    Invalid(String),
}
