//! Engine error types

use thiserror::Error;

/// Errors surfaced by the cadence engine.
#[derive(Error, Debug)]
pub enum EngineError {
    /// Decoding a variant set failed; nothing was committed.
    #[error("Failed to load variant set {track}: {source:#}")]
    LoadFailed {
        track: String,
        #[source]
        source: anyhow::Error,
    },

    /// The operation needs a loaded variant and none is current.
    #[error("No tempo variant is loaded")]
    NotLoaded,

    /// Variant BPMs are not strictly increasing slow < original < fast.
    #[error("Invalid variant set {track}: slow={slow} original={original} fast={fast}")]
    InvalidVariantSet {
        track: String,
        slow: i32,
        original: i32,
        fast: i32,
    },

    /// The track library has no variant sets.
    #[error("Track library is empty")]
    EmptyLibrary,

    /// The PCM sink rejected an operation.
    #[error("Audio sink error: {0}")]
    Sink(String),
}

/// Result type for engine operations
pub type EngineResult<T> = Result<T, EngineError>;
