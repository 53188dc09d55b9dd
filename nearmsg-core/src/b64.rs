//! Base64 for text-encoded characteristic values. Standard alphabet, `=` padding.
//! Only the central write path needs it; notifications carry raw bytes.

use base64::engine::general_purpose::STANDARD;
use base64::Engine;

pub fn encode(bytes: &[u8]) -> String {
    STANDARD.encode(bytes)
}

pub fn decode(text: &str) -> Result<Vec<u8>, DecodeError> {
    STANDARD.decode(text).map_err(DecodeError)
}

/// Characteristic value was not valid standard base64.
#[derive(Debug, thiserror::Error)]
#[error("invalid base64 characteristic value: {0}")]
pub struct DecodeError(#[source] base64::DecodeError);
