#![forbid(unsafe_code)]

//! Client-side connector for the Maven build daemon.
//!
//! A transient client invocation calls [`DaemonConnector::connect`] to obtain
//! a socket session with exactly one compatible long-lived daemon on the
//! local host, starting one if necessary. Daemon discovery goes through the
//! shared [`registry::DaemonRegistry`], whose persistence layer is owned by a
//! separate subsystem.

pub mod clock;
pub mod config;
pub mod connect;
#[cfg(feature = "embedded")]
pub mod embedded;
pub mod error;
mod paths;
pub mod registry;
pub mod telemetry;

pub use error::{Error, Transience};
pub type Result<T> = std::result::Result<T, Error>;

// Re-export the primary surface at the crate root for convenience
pub use crate::config::DaemonParameters;
pub use crate::connect::{
    ClientOutput, ConnectError, DaemonClientConnection, DaemonConnector, DEFAULT_CONNECT_TIMEOUT,
};
pub use crate::registry::{
    DaemonId, DaemonInfo, DaemonRegistry, DaemonState, DaemonStopEvent, MemoryRegistry,
    RuntimeProfile,
};
