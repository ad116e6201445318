//! Wire Protocol Types

use bytes::Bytes;
use std::fmt;

use crate::protocol::constants::*;

/// Two-byte correlation id carried by every request and response.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct StreamId(pub u16);

impl StreamId {
    pub fn from_bytes(bytes: [u8; 2]) -> Self {
        StreamId(u16::from_be_bytes(bytes))
    }

    pub fn to_bytes(self) -> [u8; 2] {
        self.0.to_be_bytes()
    }
}

impl fmt::Display for StreamId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:04x}", self.0)
    }
}

/// Response status
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseStatus {
    Ok,
    OkSoFar,
    Attn,
    AuthMore,
    Error,
    Redirect,
    Wait,
    WaitResp,
}

impl ResponseStatus {
    /// Get the wire code for this status
    pub fn code(&self) -> u16 {
        match self {
            ResponseStatus::Ok => STATUS_OK,
            ResponseStatus::OkSoFar => STATUS_OKSOFAR,
            ResponseStatus::Attn => STATUS_ATTN,
            ResponseStatus::AuthMore => STATUS_AUTHMORE,
            ResponseStatus::Error => STATUS_ERROR,
            ResponseStatus::Redirect => STATUS_REDIRECT,
            ResponseStatus::Wait => STATUS_WAIT,
            ResponseStatus::WaitResp => STATUS_WAITRESP,
        }
    }

    /// Create from a wire code, `None` for codes outside the protocol
    pub fn from_code(code: u16) -> Option<Self> {
        match code {
            STATUS_OK => Some(ResponseStatus::Ok),
            STATUS_OKSOFAR => Some(ResponseStatus::OkSoFar),
            STATUS_ATTN => Some(ResponseStatus::Attn),
            STATUS_AUTHMORE => Some(ResponseStatus::AuthMore),
            STATUS_ERROR => Some(ResponseStatus::Error),
            STATUS_REDIRECT => Some(ResponseStatus::Redirect),
            STATUS_WAIT => Some(ResponseStatus::Wait),
            STATUS_WAITRESP => Some(ResponseStatus::WaitResp),
            _ => None,
        }
    }
}

/// Fixed-size header preceding every server response
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MessageHeader {
    pub stream_id: StreamId,
    pub status: ResponseStatus,
    pub dlen: u32,
}

/// A decoded server response
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub header: MessageHeader,
    pub body: Bytes,
}

impl Message {
    pub fn new(stream_id: StreamId, status: ResponseStatus, body: impl Into<Bytes>) -> Self {
        let body = body.into();
        Self {
            header: MessageHeader {
                stream_id,
                status,
                dlen: body.len() as u32,
            },
            body,
        }
    }

    /// Server-initiated message, not correlated with any pending request.
    pub fn unsolicited(body: impl Into<Bytes>) -> Self {
        Self::new(StreamId(UNADDRESSED_STREAM_ID), ResponseStatus::Attn, body)
    }

    pub fn stream_id(&self) -> StreamId {
        self.header.stream_id
    }

    pub fn status(&self) -> ResponseStatus {
        self.header.status
    }

    pub fn is_unsolicited(&self) -> bool {
        self.header.status == ResponseStatus::Attn
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_codes() {
        assert_eq!(ResponseStatus::from_code(4001), Some(ResponseStatus::Attn));
        assert_eq!(ResponseStatus::Redirect.code(), 4004);
        assert_eq!(ResponseStatus::from_code(17), None);
    }

    #[test]
    fn test_unsolicited_classification() {
        assert!(Message::unsolicited("ping").is_unsolicited());
        assert!(!Message::new(StreamId(3), ResponseStatus::Ok, "data").is_unsolicited());
    }

    #[test]
    fn test_stream_id_is_big_endian() {
        assert_eq!(StreamId(0x0102).to_bytes(), [0x01, 0x02]);
        assert_eq!(StreamId::from_bytes([0xab, 0xcd]), StreamId(0xabcd));
    }
}
