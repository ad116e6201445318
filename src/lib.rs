//! connmux Library
//!
//! Client-side connection multiplexing for an XRootD-style request/response
//! protocol: many logical sessions share one physical TCP connection per
//! server endpoint, and idle physical connections are reclaimed in the
//! background once their time-to-live has elapsed.

pub mod config;
pub mod connection;
pub mod metrics;
pub mod protocol;
pub mod shutdown;

pub use config::Config;
pub use connection::{
    ConnError, ConnResult, ConnectionManager, Endpoint, LogicalId, PhysicalId, ServerRole,
    UnsolicitedHandler,
};
pub use protocol::{Message, StreamId};
pub use shutdown::ShutdownCoordinator;

/// Common error type for configuration and application glue
pub type Result<T> = anyhow::Result<T>;
