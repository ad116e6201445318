//! Response Frame Codec

use bytes::{BufMut, Bytes, BytesMut};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt};

use super::{Message, MessageHeader, ResponseStatus, StreamId};
use crate::protocol::constants::*;

/// Failure while pulling one frame off the wire
#[derive(Debug, Error)]
pub enum FrameError {
    #[error("socket error: {0}")]
    Io(#[from] std::io::Error),

    /// The frame was malformed. The stream is still positioned on a frame
    /// boundary, so the caller may keep reading.
    #[error("protocol error {code}: {message}")]
    Protocol { code: u16, message: String },
}

/// Read one complete response frame.
pub async fn read_message<R>(reader: &mut R, max_message_size: usize) -> Result<Message, FrameError>
where
    R: AsyncRead + Unpin,
{
    let mut header = [0u8; RESPONSE_HEADER_LEN];
    reader.read_exact(&mut header).await?;

    let stream_id = StreamId::from_bytes([header[0], header[1]]);
    let status_code = u16::from_be_bytes([header[2], header[3]]);
    let dlen = i32::from_be_bytes([header[4], header[5], header[6], header[7]]);

    if dlen < 0 {
        return Err(FrameError::Protocol {
            code: PROTOCOL_ERR_NEGATIVE_LENGTH,
            message: format!("negative body length {} on stream {}", dlen, stream_id),
        });
    }
    let dlen = dlen as u32;

    if dlen as usize > max_message_size {
        discard(reader, dlen as u64).await?;
        return Err(FrameError::Protocol {
            code: PROTOCOL_ERR_OVERSIZED,
            message: format!(
                "body length {} exceeds limit {} on stream {}",
                dlen, max_message_size, stream_id
            ),
        });
    }

    let Some(status) = ResponseStatus::from_code(status_code) else {
        discard(reader, dlen as u64).await?;
        return Err(FrameError::Protocol {
            code: PROTOCOL_ERR_UNKNOWN_STATUS,
            message: format!("unknown status {} on stream {}", status_code, stream_id),
        });
    };

    let mut body = vec![0u8; dlen as usize];
    reader.read_exact(&mut body).await?;

    Ok(Message {
        header: MessageHeader {
            stream_id,
            status,
            dlen,
        },
        body: Bytes::from(body),
    })
}

/// Serialize a response frame. Used by servers and test peers.
pub fn encode_message(message: &Message) -> Result<Bytes, FrameError> {
    let dlen = frame_length(message.body.len())?;

    let mut buf = BytesMut::with_capacity(RESPONSE_HEADER_LEN + message.body.len());
    buf.put_slice(&message.header.stream_id.to_bytes());
    buf.put_u16(message.header.status.code());
    buf.put_i32(dlen);
    buf.put_slice(&message.body);
    Ok(buf.freeze())
}

/// Body length as carried in the header's signed 32-bit field
fn frame_length(len: usize) -> Result<i32, FrameError> {
    i32::try_from(len).map_err(|_| FrameError::Protocol {
        code: PROTOCOL_ERR_OVERSIZED,
        message: format!("body length {} does not fit the frame header", len),
    })
}

async fn discard<R>(reader: &mut R, len: u64) -> std::io::Result<()>
where
    R: AsyncRead + Unpin,
{
    let mut limited = reader.take(len);
    let copied = tokio::io::copy(&mut limited, &mut tokio::io::sink()).await?;
    if copied < len {
        return Err(std::io::ErrorKind::UnexpectedEof.into());
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn raw_frame(stream: u16, status: u16, dlen: i32, body: &[u8]) -> Vec<u8> {
        let mut frame = Vec::new();
        frame.extend_from_slice(&stream.to_be_bytes());
        frame.extend_from_slice(&status.to_be_bytes());
        frame.extend_from_slice(&dlen.to_be_bytes());
        frame.extend_from_slice(body);
        frame
    }

    #[tokio::test]
    async fn test_reads_back_encoded_frame() {
        let message = Message::new(StreamId(7), ResponseStatus::Ok, &b"payload"[..]);
        let mut cursor = Cursor::new(encode_message(&message).unwrap().to_vec());

        let decoded = read_message(&mut cursor, 1024).await.unwrap();
        assert_eq!(decoded, message);
    }

    #[tokio::test]
    async fn test_negative_length_is_protocol_error() {
        let mut cursor = Cursor::new(raw_frame(1, STATUS_OK, -5, &[]));

        match read_message(&mut cursor, 1024).await {
            Err(FrameError::Protocol { code, .. }) => assert_eq!(code, PROTOCOL_ERR_NEGATIVE_LENGTH),
            other => panic!("expected protocol error, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_oversized_body_is_skipped() {
        let mut bytes = raw_frame(1, STATUS_OK, 16, &[0xaa; 16]);
        bytes.extend(encode_message(&Message::new(StreamId(2), ResponseStatus::Ok, &b"next"[..])).unwrap());
        let mut cursor = Cursor::new(bytes);

        match read_message(&mut cursor, 8).await {
            Err(FrameError::Protocol { code, .. }) => assert_eq!(code, PROTOCOL_ERR_OVERSIZED),
            other => panic!("expected protocol error, got {:?}", other),
        }

        // The following frame is still readable
        let next = read_message(&mut cursor, 8).await.unwrap();
        assert_eq!(next.stream_id(), StreamId(2));
        assert_eq!(&next.body[..], b"next");
    }

    #[tokio::test]
    async fn test_unknown_status_is_skipped() {
        let mut bytes = raw_frame(4, 9999, 3, b"abc");
        bytes.extend(encode_message(&Message::unsolicited(&b"x"[..])).unwrap());
        let mut cursor = Cursor::new(bytes);

        assert!(matches!(
            read_message(&mut cursor, 1024).await,
            Err(FrameError::Protocol { code: PROTOCOL_ERR_UNKNOWN_STATUS, .. })
        ));
        assert!(read_message(&mut cursor, 1024).await.unwrap().is_unsolicited());
    }

    #[tokio::test]
    async fn test_truncated_frame_is_io_error() {
        let mut cursor = Cursor::new(raw_frame(1, STATUS_OK, 10, b"short"));
        assert!(matches!(read_message(&mut cursor, 1024).await, Err(FrameError::Io(_))));
    }

    #[tokio::test]
    async fn test_frame_split_across_reads() {
        let frame = raw_frame(3, STATUS_OK, 5, b"hello");
        let mut mock = tokio_test::io::Builder::new()
            .read(&frame[..3])
            .read(&frame[3..9])
            .read(&frame[9..])
            .build();

        let message = read_message(&mut mock, 1024).await.unwrap();
        assert_eq!(message.stream_id(), StreamId(3));
        assert_eq!(&message.body[..], b"hello");
    }

    #[test]
    fn test_body_length_must_fit_header() {
        assert_eq!(frame_length(5).unwrap(), 5);
        assert_eq!(frame_length(i32::MAX as usize).unwrap(), i32::MAX);
        assert!(matches!(
            frame_length(i32::MAX as usize + 1),
            Err(FrameError::Protocol { code: PROTOCOL_ERR_OVERSIZED, .. })
        ));
    }
}
