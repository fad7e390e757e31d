//! Yellowstone gRPC monitor for pump.fun token creation.
//!
//! The crate is organized by concern:
//! - `stream`: gRPC transport, request builders, and the keep-alive session.
//! - `supervisor`: reconnect loop around sessions.
//! - `retry`: backoff and timeout utilities.
//! - `mint`: token-creation decoding and logging.
//! - `config`: environment-driven configuration.

/// Environment-driven configuration.
pub mod config;
/// Token-creation decoding and the logging update handler.
pub mod mint;
/// Reconnect backoff and timeout helpers.
pub mod retry;
/// Stream transport, request builders, and session handling.
pub mod stream;
/// Reconnect supervisor.
pub mod supervisor;
