//! Subscription stream modules.
//!
//! - `client`: gRPC connector and transport error types.
//! - `proto`: subscription and ping request builders.
//! - `session`: one subscription session with keep-alive pings.

/// gRPC connector seam and production connector.
pub mod client;
/// Subscription request builders.
pub mod proto;
/// Session manager with keep-alive timer.
pub mod session;
