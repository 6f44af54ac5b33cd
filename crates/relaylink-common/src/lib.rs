//! Shared utilities for Relaylink: logging, error types, signaling wire protocol.
//!
//! This crate provides common infrastructure used by the client and the diagnostics CLI.

#![forbid(unsafe_code)]

pub mod error;
pub mod helpers;
pub mod protocol;

pub use error::{
    CredentialError, Error, NegotiationError, ParseError, ResolutionError, Result, SignalingError,
};
pub use protocol::*;

/// Installs the fmt subscriber. `RUST_LOG` wins over `default_level`.
///
/// A second call is a no-op.
pub fn init_tracing_with_default(default_level: &str) {
    use tracing_subscriber::EnvFilter;

    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(true)
        .try_init();
}
