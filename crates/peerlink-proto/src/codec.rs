//! Codec for encoding/decoding signaling messages and stream frames

use serde::de::DeserializeOwned;
use serde::Serialize;
use thiserror::Error;

use crate::messages::SignalMessage;

/// Codec errors
#[derive(Debug, Error)]
pub enum CodecError {
    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),

    #[error("Message too large: {0} bytes")]
    MessageTooLarge(usize),

    #[error("Frame is not valid UTF-8")]
    InvalidUtf8,
}

/// JSON codec shared by the signaling socket and the proxy channel handshake.
///
/// Every message is one self-delimiting JSON document carried in a single
/// websocket text message or data channel message, so no length prefix is
/// needed.
pub struct SignalCodec;

impl SignalCodec {
    /// Maximum message size (1MB). SDP blobs stay well below this.
    pub const MAX_MESSAGE_SIZE: usize = 1024 * 1024;

    /// Encode a signaling message to its text form
    pub fn encode(msg: &SignalMessage) -> Result<String, CodecError> {
        Self::encode_frame(msg)
    }

    /// Decode a signaling message from a text frame
    pub fn decode(text: &str) -> Result<SignalMessage, CodecError> {
        Self::decode_frame(text.as_bytes())
    }

    /// Encode any protocol frame (e.g. `DialRequest`, `DialResponse`)
    pub fn encode_frame<T: Serialize>(frame: &T) -> Result<String, CodecError> {
        let text = serde_json::to_string(frame)?;

        if text.len() > Self::MAX_MESSAGE_SIZE {
            return Err(CodecError::MessageTooLarge(text.len()));
        }

        Ok(text)
    }

    /// Decode any protocol frame from raw bytes
    pub fn decode_frame<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, CodecError> {
        if bytes.len() > Self::MAX_MESSAGE_SIZE {
            return Err(CodecError::MessageTooLarge(bytes.len()));
        }

        let text = std::str::from_utf8(bytes).map_err(|_| CodecError::InvalidUtf8)?;
        Ok(serde_json::from_str(text)?)
    }
}
