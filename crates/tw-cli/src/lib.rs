//! tunwarden CLI library
//!
//! Command implementations, the observer-protocol client, and terminal
//! output helpers. The binary in `main.rs` is a thin clap layer over
//! these.

pub mod commands;
pub mod ipc;
pub mod output;
