//! Length-prefixed framing.
//!
//! Frame format: `[4-byte BE u32 length][payload bytes]`. The length
//! `0xFFFFFFFF` is reserved as an end signal and never carries a payload.

use crate::config::BridgeConfig;
use crate::error::{FrameError, FrameStage};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Upper bound on the buffer reserved up front for a payload.
///
/// Larger payloads grow the buffer as bytes arrive, so a corrupt length
/// prefix cannot force a huge allocation by itself.
const PREALLOC_LIMIT: usize = 1 << 20;

/// One unit read off the channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Data(Vec<u8>),
    End,
}

/// Read a single frame.
///
/// Returns `Ok(None)` on clean end-of-stream (no bytes before EOF). A stream
/// that ends inside the length prefix or inside the payload is a
/// [`FrameError::Truncated`] error, never a frame.
///
/// Not cancel safe: a partially read frame is lost if the future is dropped.
pub async fn read_frame<R: AsyncRead + Unpin>(
    reader: &mut R,
) -> Result<Option<Frame>, FrameError> {
    let mut len_buf = [0u8; 4];
    let mut filled = 0;
    while filled < len_buf.len() {
        let n = reader.read(&mut len_buf[filled..]).await?;
        if n == 0 {
            if filled == 0 {
                return Ok(None);
            }
            return Err(FrameError::Truncated {
                stage: FrameStage::Header,
                expected: len_buf.len() as u64,
                actual: filled as u64,
            });
        }
        filled += n;
    }

    let len = u32::from_be_bytes(len_buf);
    if len == BridgeConfig::END_SIGNAL_LEN {
        return Ok(Some(Frame::End));
    }

    let expected = u64::from(len);
    let mut payload = Vec::with_capacity((len as usize).min(PREALLOC_LIMIT));
    let actual = (&mut *reader).take(expected).read_to_end(&mut payload).await? as u64;
    if actual != expected {
        return Err(FrameError::Truncated {
            stage: FrameStage::Payload,
            expected,
            actual,
        });
    }

    Ok(Some(Frame::Data(payload)))
}

/// Write a length-prefixed frame.
///
/// Payloads longer than [`BridgeConfig::MAX_FRAME_LEN`] are rejected before
/// anything is written.
pub async fn write_frame<W: AsyncWrite + Unpin>(
    writer: &mut W,
    payload: &[u8],
) -> Result<(), FrameError> {
    if payload.len() > BridgeConfig::MAX_FRAME_LEN {
        return Err(FrameError::TooLarge { len: payload.len() });
    }
    let len = payload.len() as u32;
    writer.write_all(&len.to_be_bytes()).await?;
    writer.write_all(payload).await?;
    writer.flush().await?;
    Ok(())
}

/// Write the reserved end signal.
pub async fn write_end_signal<W: AsyncWrite + Unpin>(writer: &mut W) -> Result<(), FrameError> {
    writer
        .write_all(&BridgeConfig::END_SIGNAL_LEN.to_be_bytes())
        .await?;
    writer.flush().await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    async fn encode(payload: &[u8]) -> Vec<u8> {
        let mut buf = Vec::new();
        write_frame(&mut buf, payload).await.unwrap();
        buf
    }

    #[tokio::test]
    async fn test_frame_read_write_roundtrip() {
        let payload = b"hello world";
        let buf = encode(payload).await;
        assert_eq!(&buf[..4], &[0, 0, 0, 11]);

        let mut cursor = Cursor::new(buf);
        let read_back = read_frame(&mut cursor).await.unwrap();
        assert_eq!(read_back, Some(Frame::Data(payload.to_vec())));
    }

    #[tokio::test]
    async fn test_frame_empty_payload() {
        let mut cursor = Cursor::new(encode(b"").await);
        assert_eq!(
            read_frame(&mut cursor).await.unwrap(),
            Some(Frame::Data(Vec::new()))
        );
        assert_eq!(read_frame(&mut cursor).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_consecutive_frames() {
        let mut buf = encode(b"add").await;
        buf.extend(encode(br#"{"a":5,"b":6}"#).await);

        let mut cursor = Cursor::new(buf);
        assert_eq!(
            read_frame(&mut cursor).await.unwrap(),
            Some(Frame::Data(b"add".to_vec()))
        );
        assert_eq!(
            read_frame(&mut cursor).await.unwrap(),
            Some(Frame::Data(br#"{"a":5,"b":6}"#.to_vec()))
        );
        assert_eq!(read_frame(&mut cursor).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_large_payload_roundtrip() {
        let payload: Vec<u8> = (0..3 * PREALLOC_LIMIT).map(|i| (i % 251) as u8).collect();
        let mut cursor = Cursor::new(encode(&payload).await);
        assert_eq!(
            read_frame(&mut cursor).await.unwrap(),
            Some(Frame::Data(payload))
        );
    }

    #[tokio::test]
    async fn test_frame_read_empty_stream_returns_none() {
        let mut cursor = Cursor::new(Vec::<u8>::new());
        assert!(read_frame(&mut cursor).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_truncated_header() {
        let mut cursor = Cursor::new(vec![0u8, 0]);
        match read_frame(&mut cursor).await {
            Err(FrameError::Truncated {
                stage: FrameStage::Header,
                expected: 4,
                actual: 2,
            }) => {}
            other => panic!("Expected truncated header, got: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_truncated_payload() {
        let mut buf = encode(b"0123456789").await;
        buf.truncate(4 + 6);

        let mut cursor = Cursor::new(buf);
        match read_frame(&mut cursor).await {
            Err(FrameError::Truncated {
                stage: FrameStage::Payload,
                expected: 10,
                actual: 6,
            }) => {}
            other => panic!("Expected truncated payload, got: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_length_prefix_only() {
        let mut cursor = Cursor::new(7u32.to_be_bytes().to_vec());
        assert!(matches!(
            read_frame(&mut cursor).await,
            Err(FrameError::Truncated {
                stage: FrameStage::Payload,
                actual: 0,
                ..
            })
        ));
    }

    #[tokio::test]
    async fn test_end_signal() {
        let mut buf = encode(b"last").await;
        write_end_signal(&mut buf).await.unwrap();
        assert_eq!(&buf[buf.len() - 4..], &[0xFF; 4]);

        let mut cursor = Cursor::new(buf);
        assert_eq!(
            read_frame(&mut cursor).await.unwrap(),
            Some(Frame::Data(b"last".to_vec()))
        );
        assert_eq!(read_frame(&mut cursor).await.unwrap(), Some(Frame::End));
    }

    #[tokio::test]
    async fn test_frame_over_pipe_with_split_writes() {
        let (mut client, mut server) = tokio::io::duplex(8);
        let writer = tokio::spawn(async move {
            write_frame(&mut client, &[7u8; 100]).await.unwrap();
        });

        let frame = read_frame(&mut server).await.unwrap();
        assert_eq!(frame, Some(Frame::Data(vec![7u8; 100])));
        writer.await.unwrap();
    }
}
