//! # parley-server
//!
//! WebSocket gateway for Parley: configuration, request handling over the
//! session coordinator, and Prometheus metrics.

pub mod config;
pub mod handlers;
pub mod metrics;

pub use config::Config;
pub use handlers::{build_app, run_server, AppState, ConnectionSlot, HandshakeError};
