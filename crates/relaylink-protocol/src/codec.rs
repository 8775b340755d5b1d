//! Newline-delimited JSON framing.
//!
//! Each request is one compact JSON object followed by `\n`. Compact JSON
//! never contains a raw newline, so the delimiter is unambiguous.

use thiserror::Error;

use crate::Request;

/// Frame delimiter.
pub const DELIMITER: u8 = b'\n';

/// Codec error.
#[derive(Debug, Error)]
pub enum CodecError {
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("Empty frame")]
    EmptyFrame,
}

/// Encode a request as one frame, delimiter included.
///
/// # Errors
/// Returns error if the request cannot be serialized.
pub fn encode(request: &Request) -> Result<Vec<u8>, CodecError> {
    let mut frame = serde_json::to_vec(request)?;
    frame.push(DELIMITER);
    Ok(frame)
}

/// Decode one frame. Surrounding whitespace and the delimiter are ignored.
///
/// # Errors
/// Returns error if the frame is blank, not UTF-8, or not a known request.
pub fn decode(frame: &[u8]) -> Result<Request, CodecError> {
    let frame = frame.trim_ascii();
    if frame.is_empty() {
        return Err(CodecError::EmptyFrame);
    }
    Ok(serde_json::from_slice(frame)?)
}
