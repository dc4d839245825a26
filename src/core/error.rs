//! Error handling - crate-wide error hierarchy

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

/// Platform error hierarchy
#[derive(Debug, Error)]
pub enum Error {
    /// Configuration errors (bad flag, bad config file, missing adapter params)
    #[error("configuration error: {0}")]
    Config(String),

    /// Reference store errors (missing rows, unreadable file)
    #[error("reference store error: {0}")]
    Store(String),

    /// Journal errors (corrupted record on cold recovery)
    #[error("journal error: {0}")]
    Journal(String),

    /// IO errors
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization errors
    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),
}
