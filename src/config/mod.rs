//! Configuration Module
//!
//! Handles configuration loading, validation, and management.

pub mod manager;
pub mod types;

pub use manager::{parse_read_mode, parse_socket_mode, ConfigManager};
pub use types::*;
