use thiserror::Error;

/// Errors surfaced by the indexer's public entry points.
///
/// Mirrors the error-kind taxonomy from the design: configuration errors are
/// rejected at entry, capacity and I/O errors are fatal per-volume failures,
/// and malformed ambiguity blobs never appear here because the decoder
/// degrades silently instead of erroring (see [`crate::ambig::decode`]).
#[derive(Debug, Error)]
pub enum IndexError {
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("k-mer {kmer} has count {count} which exceeds u32::MAX; k is too small for this corpus")]
    CapacityExceeded { kmer: u64, count: u64 },

    #[error("malformed {file} header: {reason}")]
    MalformedHeader { file: &'static str, reason: String },
}

pub type Result<T> = std::result::Result<T, IndexError>;
