#![warn(missing_docs)]

//! Stratus transport core: connection keep-alive, graceful drain and per-stream request state

pub mod access_log;
pub mod config;
pub mod controller;
pub mod driver;
pub mod error;
pub mod keepalive;
pub mod logging;
pub mod metrics;
pub mod request;
pub mod route;
pub mod shutdown;
pub mod traffic;

pub use config::TransportConfig;
pub use controller::{ConnectionController, ProtocolKind, ServerContext, TransportSink};
pub use driver::{ConnectionRegistry, ConnectionEvent};
pub use error::{AbortCause, Result, TransportError};
