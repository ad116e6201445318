//! Wire Protocol Framing
//!
//! Minimal framing for server responses: enough to split the inbound byte
//! stream into messages and read their correlation (stream) id. Full request
//! marshalling lives above this crate.

pub mod codec;
pub mod constants;
pub mod types;

pub use codec::{encode_message, read_message, FrameError};
pub use constants::*;
pub use types::*;
