//! Connection Management Module
//!
//! Logical connections for client sessions, multiplexed onto one physical
//! connection per server endpoint, with idle physical connections reclaimed
//! in the background.

pub mod endpoint;
pub mod error;
mod gc;
pub mod logical;
pub mod manager;
pub mod physical;
pub mod registry;

use std::sync::{Mutex, MutexGuard, PoisonError};

pub use endpoint::{Endpoint, ServerRole};
pub use error::{ConnError, ConnResult};
pub use logical::{LogicalConnection, UnsolicitedHandler};
pub use manager::{ConnectionManager, PhysicalStats, RegistryStats};
pub use physical::{ConnectionState, PhysicalConnection, PhysicalSettings, UnsolicitedSink};
pub use registry::{LogicalId, PhysicalId, SlotId};

/// Lock a std mutex, recovering the data if a holder panicked. None of the
/// guarded state is left half-updated across a panic point.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
