//! Core domain types

use std::fmt;
use std::time::SystemTime;

use serde::{Deserialize, Serialize};

/// Unique identifier for a VPN endpoint
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct HostId(pub String);

impl HostId {
    /// Create a new host ID
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Get the raw ID string
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for HostId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<String> for HostId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// Two-letter ISO 3166-1 country code, stored uppercase
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct CountryCode(String);

impl CountryCode {
    /// Parse a country code, normalizing to uppercase.
    ///
    /// Fails unless the input is exactly two ASCII letters.
    pub fn parse(code: &str) -> Result<Self, InvalidTarget> {
        if code.len() == 2 && code.chars().all(|c| c.is_ascii_alphabetic()) {
            Ok(Self(code.to_ascii_uppercase()))
        } else {
            Err(InvalidTarget::Country(code.to_string()))
        }
    }

    /// Get the raw code string
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CountryCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl TryFrom<String> for CountryCode {
    type Error = InvalidTarget;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        Self::parse(&s)
    }
}

impl From<CountryCode> for String {
    fn from(cc: CountryCode) -> Self {
        cc.0
    }
}

/// Error parsing a connect target
#[derive(Debug, Clone, thiserror::Error)]
pub enum InvalidTarget {
    /// Not a valid two-letter country code
    #[error("invalid country code '{0}': must be two letters, e.g. US, GB")]
    Country(String),

    /// Neither a country nor a host was given, or both were
    #[error("a connect target must name exactly one of a country or a host")]
    Ambiguous,
}

/// What a connect request is aimed at: a whole country (pick the best
/// endpoint) or one specific endpoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TargetSpec {
    /// Best host in the given country
    Country(CountryCode),
    /// A specific host by ID
    Host(HostId),
}

impl TargetSpec {
    /// Parse a CLI-style target: two ASCII letters mean a country code,
    /// anything else is taken as a host ID.
    pub fn parse(target: &str) -> Result<Self, InvalidTarget> {
        if target.len() == 2 && target.chars().all(|c| c.is_ascii_alphabetic()) {
            Ok(Self::Country(CountryCode::parse(target)?))
        } else if target.is_empty() {
            Err(InvalidTarget::Ambiguous)
        } else {
            Ok(Self::Host(HostId::new(target)))
        }
    }

    /// Build a target from the optional wire-protocol fields.
    pub fn from_parts(
        country: Option<CountryCode>,
        host: Option<HostId>,
    ) -> Result<Self, InvalidTarget> {
        match (country, host) {
            (Some(cc), None) => Ok(Self::Country(cc)),
            (None, Some(id)) => Ok(Self::Host(id)),
            _ => Err(InvalidTarget::Ambiguous),
        }
    }
}

impl fmt::Display for TargetSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Country(cc) => write!(f, "country {cc}"),
            Self::Host(id) => write!(f, "host {id}"),
        }
    }
}

/// Immutable snapshot of one VPN endpoint as reported by the directory
/// service. Replaced wholesale on every directory refresh.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Host {
    /// Endpoint identifier, e.g. "us720"
    pub id: HostId,
    /// Two-letter country code
    pub country: CountryCode,
    /// ISO country name, e.g. "United States"
    pub country_name: String,
    /// Network address the tunnel binary should dial
    pub address: String,
    /// Current load as a percentage; lower is better
    pub load: u8,
    /// When this snapshot was fetched; used to break ranking ties
    #[serde(skip, default = "SystemTime::now")]
    pub refreshed_at: SystemTime,
}

/// Session lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    /// No tunnel, no attempt in flight (initial state)
    Disconnected,
    /// A connect attempt is in flight
    Connecting,
    /// The tunnel process is up
    Connected,
    /// Teardown in progress
    Disconnecting,
    /// A terminal failure; cleared by reset or a fresh connect
    Error,
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Disconnected => "disconnected",
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::Disconnecting => "disconnecting",
            Self::Error => "error",
        };
        write!(f, "{s}")
    }
}

/// Point-in-time view of the session, as reported by the session actor
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionSnapshot {
    /// Current lifecycle state
    pub state: SessionState,
    /// Selected endpoint, present only while a host is selected
    pub host: Option<Host>,
    /// When the tunnel came up
    pub started_at: Option<SystemTime>,
    /// Reason for the most recent terminal failure
    pub last_error: Option<String>,
}

impl SessionSnapshot {
    /// Snapshot of a freshly started engine
    pub fn disconnected() -> Self {
        Self {
            state: SessionState::Disconnected,
            host: None,
            started_at: None,
            last_error: None,
        }
    }
}

/// Credentials handed to the tunnel binary for endpoint authentication
#[derive(Clone, Serialize, Deserialize)]
pub struct Credentials {
    /// Account username
    pub username: String,
    /// Account password
    pub password: String,
}

impl Credentials {
    /// Create a new credential pair
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            password: password.into(),
        }
    }
}

// Manual Debug so passwords never reach logs.
impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .finish()
    }
}
