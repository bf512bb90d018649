use std::io::Cursor;

use anyhow::{Context, Result};
use bytes::{Buf, Bytes};
use thiserror::Error;
use tokio::io::{AsyncWrite, AsyncWriteExt};

/// Maximum payload size carried by a single frame, in bytes.
pub const MAX_PAYLOAD_SIZE: usize = 10 << 20;

/// Maximum value of the length header: packet type plus payload.
pub const MAX_FRAME_LEN: u32 = (MAX_PAYLOAD_SIZE as u32) + 2;

/// Minimum value of the length header: a frame always carries at least the
/// two packet type bytes.
pub const MIN_FRAME_LEN: u32 = 2;

/// Frame layout on the wire:
///
/// ```text
/// u32 big-endian total_len   // covers type + payload, not itself
/// u16 big-endian packet_type
/// u8[total_len - 2] payload
/// ```
#[derive(Debug, Clone, PartialEq)]
pub struct RawFrame {
    pub packet_type: u16,
    pub payload: Bytes,
}

#[derive(Debug, Error)]
pub enum FrameError {
    #[error("not enough data is available to parse a frame")]
    Incomplete,

    #[error("frame length {0} out of bounds")]
    BadLength(u32),

    #[error("unknown packet type {0}")]
    UnknownType(u16),

    #[error("invalid packet payload: {0}")]
    Payload(&'static str),
}

impl RawFrame {
    pub fn new(packet_type: u16, payload: impl Into<Bytes>) -> Self {
        Self {
            packet_type,
            payload: payload.into(),
        }
    }

    /// Attempts to parse a complete frame from the buffered bytes. Returns
    /// the frame and the number of bytes it consumed, or `None` when more
    /// data must be read first. Length violations are fatal for the
    /// connection.
    pub fn parse(src: &mut Cursor<&[u8]>) -> Result<Option<(RawFrame, usize)>, FrameError> {
        // The check pass only walks the header, so a partially received
        // frame costs no allocation.
        match Self::check(src) {
            Ok(_) => {
                let len = src.position() as usize;
                src.set_position(0);

                let frame = Self::parse_frame(src);
                Ok(Some((frame, len)))
            }

            // Not an error, the caller reads more data and retries.
            Err(FrameError::Incomplete) => Ok(None),

            Err(err) => Err(err),
        }
    }

    fn check(src: &mut Cursor<&[u8]>) -> Result<(), FrameError> {
        if src.remaining() < 4 {
            return Err(FrameError::Incomplete);
        }
        let total_len = src.get_u32();
        if !(MIN_FRAME_LEN..=MAX_FRAME_LEN).contains(&total_len) {
            return Err(FrameError::BadLength(total_len));
        }
        if src.remaining() < total_len as usize {
            return Err(FrameError::Incomplete);
        }
        src.advance(total_len as usize);
        Ok(())
    }

    /// Called only after `check` succeeded, so all bounds are known good.
    fn parse_frame(src: &mut Cursor<&[u8]>) -> RawFrame {
        let total_len = src.get_u32();
        let packet_type = src.get_u16();
        let payload_len = (total_len - 2) as usize;
        let payload = Bytes::copy_from_slice(&src.chunk()[..payload_len]);
        src.advance(payload_len);
        RawFrame {
            packet_type,
            payload,
        }
    }

    pub async fn write_to<W>(&self, stream: &mut W) -> Result<()>
    where
        W: AsyncWrite + Unpin,
    {
        if self.payload.len() > MAX_PAYLOAD_SIZE {
            return Err(FrameError::BadLength((self.payload.len() + 2) as u32))
                .context("refusing to write oversize frame");
        }
        let total_len = (self.payload.len() + 2) as u32;
        stream.write_u32(total_len).await?;
        stream.write_u16(self.packet_type).await?;
        stream.write_all(&self.payload).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cursor_parse(data: &[u8]) -> Result<Option<(RawFrame, usize)>, FrameError> {
        let mut src = Cursor::new(data);
        RawFrame::parse(&mut src)
    }

    #[tokio::test]
    async fn test_round_trip() {
        let frame = RawFrame::new(42, b"hello world".to_vec());
        let mut buf = Vec::new();
        frame.write_to(&mut buf).await.unwrap();

        let (parsed, len) = cursor_parse(&buf).unwrap().unwrap();
        assert_eq!(len, buf.len());
        assert_eq!(parsed, frame);
    }

    #[tokio::test]
    async fn test_empty_payload() {
        let frame = RawFrame::new(7, Vec::new());
        let mut buf = Vec::new();
        frame.write_to(&mut buf).await.unwrap();
        assert_eq!(buf, [0, 0, 0, 2, 0, 7]);

        let (parsed, _) = cursor_parse(&buf).unwrap().unwrap();
        assert_eq!(parsed.packet_type, 7);
        assert!(parsed.payload.is_empty());
    }

    #[test]
    fn test_incomplete() {
        // Header split across reads.
        assert!(matches!(cursor_parse(&[0, 0]), Ok(None)));
        // Full header, missing payload bytes.
        assert!(matches!(cursor_parse(&[0, 0, 0, 10, 0, 1, 0xaa]), Ok(None)));
    }

    #[test]
    fn test_bad_length() {
        // total_len below the packet type size.
        assert!(matches!(
            cursor_parse(&[0, 0, 0, 1, 0]),
            Err(FrameError::BadLength(1))
        ));
        // total_len above the cap.
        let huge = (MAX_FRAME_LEN + 1).to_be_bytes();
        assert!(matches!(
            cursor_parse(&huge),
            Err(FrameError::BadLength(_))
        ));
    }

    #[tokio::test]
    async fn test_oversize_write_rejected() {
        let frame = RawFrame::new(1, vec![0u8; MAX_PAYLOAD_SIZE + 1]);
        let mut buf = Vec::new();
        assert!(frame.write_to(&mut buf).await.is_err());
        assert!(buf.is_empty());
    }

    #[tokio::test]
    async fn test_two_frames_in_buffer() {
        let first = RawFrame::new(1, b"one".to_vec());
        let second = RawFrame::new(2, b"two".to_vec());
        let mut buf = Vec::new();
        first.write_to(&mut buf).await.unwrap();
        second.write_to(&mut buf).await.unwrap();

        let (parsed, len) = cursor_parse(&buf).unwrap().unwrap();
        assert_eq!(parsed, first);
        let (parsed, _) = cursor_parse(&buf[len..]).unwrap().unwrap();
        assert_eq!(parsed, second);
    }
}
