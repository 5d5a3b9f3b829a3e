//! Handshake and call-envelope conventions layered on the frame codec.

use crate::config::BridgeConfig;
use crate::error::FrameError;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Key of the single-entry JSON object a worker sends to report a failed call.
///
/// `{"_error": "unknown function 'foo'"}`
pub const REMOTE_ERROR_KEY: &str = "_error";

/// Read the unframed handshake literal.
///
/// Exactly `BridgeConfig::HANDSHAKE.len()` bytes are consumed. A short read or
/// different content is a [`FrameError::BadHandshake`].
pub async fn read_handshake<R: AsyncRead + Unpin>(reader: &mut R) -> Result<(), FrameError> {
    let expected = BridgeConfig::HANDSHAKE;
    let mut received = Vec::with_capacity(expected.len());
    (&mut *reader)
        .take(expected.len() as u64)
        .read_to_end(&mut received)
        .await?;

    if received != expected {
        return Err(FrameError::BadHandshake { received });
    }
    Ok(())
}

/// Write the handshake literal (worker side).
pub async fn write_handshake<W: AsyncWrite + Unpin>(writer: &mut W) -> Result<(), FrameError> {
    writer.write_all(BridgeConfig::HANDSHAKE).await?;
    writer.flush().await?;
    Ok(())
}

/// Build the payload reporting a failed call.
pub fn error_response(message: &str) -> Vec<u8> {
    let mut body = serde_json::Map::new();
    body.insert(
        REMOTE_ERROR_KEY.to_string(),
        serde_json::Value::String(message.to_string()),
    );
    serde_json::Value::Object(body).to_string().into_bytes()
}

/// Extract the message from a remote-error response, if `value` is one.
pub fn remote_error(value: &serde_json::Value) -> Option<String> {
    let object = value.as_object()?;
    if object.len() != 1 {
        return None;
    }
    let message = object.get(REMOTE_ERROR_KEY)?;
    Some(match message.as_str() {
        Some(text) => text.to_string(),
        None => message.to_string(),
    })
}
