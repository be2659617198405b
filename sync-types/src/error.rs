//! Error types for liftsync-types.

use thiserror::Error;

/// Errors produced by the message codec.
#[derive(Debug, Error)]
pub enum CodecError {
    /// MessagePack serialization failed
    #[error("encode failed: {0}")]
    Encode(#[source] rmp_serde::encode::Error),

    /// Required fields absent or of the wrong shape
    #[error("malformed message: {0}")]
    Malformed(String),

    /// Protocol version this build does not speak
    #[error("unsupported protocol version: {0}")]
    UnsupportedVersion(u8),
}
