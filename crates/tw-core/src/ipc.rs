//! Observer wire protocol
//!
//! Newline-delimited JSON over localhost TCP. The engine pushes one
//! [`StatusMessage`] per session transition to every attached observer,
//! and the first message after attach always reflects the current state
//! so a new observer never starts blind. Observers send [`Intent`]s;
//! a synchronously rejected intent is answered with a [`Rejection`] on
//! that observer's channel only, without touching session state.
//!
//! Malformed lines are logged and ignored; they never tear down the
//! observer connection.

use serde::{Deserialize, Serialize};

use crate::types::{CountryCode, Credentials, HostId, TargetSpec};

/// Client → engine request
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "method", rename_all = "snake_case")]
pub enum Intent {
    /// Establish a tunnel to a country's best host or a specific host.
    /// Exactly one of `country` and `host` must be present.
    Connect {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        country: Option<CountryCode>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        host: Option<HostId>,
        /// Optional credential override; the engine falls back to its
        /// configured credentials when absent.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        username: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        password: Option<String>,
    },

    /// Tear down the active tunnel (or cancel an in-flight connect)
    Disconnect,
}

impl Intent {
    /// Build a connect intent from a parsed target
    pub fn connect(target: TargetSpec, credentials: Option<Credentials>) -> Self {
        let (country, host) = match target {
            TargetSpec::Country(cc) => (Some(cc), None),
            TargetSpec::Host(id) => (None, Some(id)),
        };
        let (username, password) = match credentials {
            Some(c) => (Some(c.username), Some(c.password)),
            None => (None, None),
        };
        Self::Connect {
            country,
            host,
            username,
            password,
        }
    }
}

/// Engine → client state push, one per session transition
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum StatusMessage {
    /// A connect attempt is in flight
    Connecting {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        country: Option<CountryCode>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        host: Option<HostId>,
    },

    /// The tunnel is up
    Connected {
        host: HostId,
        /// Address of the selected endpoint
        address: String,
    },

    /// Teardown in progress
    Disconnecting,

    /// No tunnel active
    Disconnected,

    /// Terminal failure; cleared by reset or a fresh connect
    Error { message: String },
}

/// Synchronous per-observer rejection of an intent. Not a state
/// transition: nothing is broadcast and session state is untouched.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Rejection {
    /// Why the intent was refused
    pub rejected: String,
}

/// Any line an observer may receive from the engine
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ObserverFrame {
    /// Broadcast session state
    Status(StatusMessage),
    /// Per-observer intent rejection
    Rejection(Rejection),
}
