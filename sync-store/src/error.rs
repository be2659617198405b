//! Error types for liftsync-store.

use std::path::PathBuf;

use thiserror::Error;

/// Errors that can occur while reading or writing the durable store.
#[derive(Error, Debug)]
pub enum PersistenceError {
    /// Filesystem operation failed.
    #[error("I/O error at {path}: {source}")]
    Io {
        /// File or directory involved.
        path: PathBuf,
        /// Underlying I/O error.
        source: std::io::Error,
    },

    /// Typed value could not be (de)serialized.
    #[error("serialization error for key {key}: {source}")]
    Serialization {
        /// The key being read or written.
        key: String,
        /// Underlying JSON error.
        source: serde_json::Error,
    },

    /// Key or blob name is not usable as a storage name.
    #[error("invalid key: {0:?}")]
    InvalidKey(String),
}

impl PersistenceError {
    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }
}
