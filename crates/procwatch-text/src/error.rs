//! Error types for the text reading layer

use thiserror::Error;

/// Errors produced while reading and decoding captured output.
#[derive(Error, Debug)]
pub enum TextError {
    /// Strict-mode decode failure: no encoding could be detected for the
    /// offending line. Carries the raw bytes for diagnostics.
    #[error("failed to decode line in strict mode, no encoding detected for bytes: {bytes:?}")]
    Decode { bytes: Vec<u8> },

    #[error(transparent)]
    Io(#[from] std::io::Error),
}
