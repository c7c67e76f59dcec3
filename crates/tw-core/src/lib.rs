//! tw-core: Shared abstractions for the tunwarden engine
//!
//! This crate provides the domain types, error taxonomy, configuration
//! structures, and the observer wire protocol shared by the engine and
//! the CLI.

pub mod config;
pub mod error;
pub mod ipc;
pub mod types;

pub use error::EngineError;
pub use types::{CountryCode, Credentials, Host, HostId, SessionSnapshot, SessionState, TargetSpec};
