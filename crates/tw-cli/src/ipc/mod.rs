//! Observer-protocol client for talking to a running engine

mod client;

pub use client::EngineClient;
