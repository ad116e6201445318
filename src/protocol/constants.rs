//! Wire Protocol Constants

// Server response header: streamid[2] + status[2] + dlen[4]
pub const RESPONSE_HEADER_LEN: usize = 8;

// Response status codes
pub const STATUS_OK: u16 = 0;
pub const STATUS_OKSOFAR: u16 = 4000;
pub const STATUS_ATTN: u16 = 4001;
pub const STATUS_AUTHMORE: u16 = 4002;
pub const STATUS_ERROR: u16 = 4003;
pub const STATUS_REDIRECT: u16 = 4004;
pub const STATUS_WAIT: u16 = 4005;
pub const STATUS_WAITRESP: u16 = 4006;

// Stream id reserved for frames not addressed to any session
pub const UNADDRESSED_STREAM_ID: u16 = 0;

// Protocol error codes reported through ConnError::Protocol
pub const PROTOCOL_ERR_NEGATIVE_LENGTH: u16 = 1;
pub const PROTOCOL_ERR_OVERSIZED: u16 = 2;
pub const PROTOCOL_ERR_UNKNOWN_STATUS: u16 = 3;
