//! Error types for the request shaper.

use thiserror::Error;

/// Main error type for request shaper operations.
#[derive(Error, Debug)]
pub enum ShaperError {
    /// Configuration-related errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// The configured period is negative
    #[error("negative value not valid for period: {0}")]
    InvalidPeriod(String),

    /// The configured time-to-live is negative
    #[error("negative value not valid for ttl: {0}")]
    InvalidTtl(String),

    /// A duration string could not be parsed
    #[error("invalid duration {value:?}: {reason}")]
    InvalidDuration { value: String, reason: String },

    /// A bucket store was created with no room for entries
    #[error("store capacity must be greater than zero")]
    CapacityInvalid,

    /// The bucket store holds `capacity` live entries and none could be evicted
    #[error("bucket store is full ({capacity} sources)")]
    StoreFull { capacity: usize },

    /// The source of a request could not be determined
    #[error("could not extract source of request: {0}")]
    SourceExtraction(String),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type alias for request shaper operations.
pub type Result<T> = std::result::Result<T, ShaperError>;
