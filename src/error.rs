//! Error types for kmerbin.
//!
//! One crate-level error enum covers every failure the pipeline can hit,
//! from malformed input records to temp-file I/O, so worker threads can
//! report a single `Result` type through the shutdown broker.

use std::path::PathBuf;
use thiserror::Error;

/// Errors that can occur while counting k-mers.
#[derive(Debug, Error)]
pub enum KmerBinError {
    /// Malformed FASTA/FASTQ record, BAM magic mismatch, BGZF corruption.
    #[error("malformed {format} input in '{path}': {details}")]
    InputFormat {
        format: &'static str,
        path: PathBuf,
        details: String,
    },

    /// Gzip/BGZF inflation failure or unexpected end of stream.
    #[error("failed to decompress '{path}': {details}")]
    Decompress { path: PathBuf, details: String },

    /// Temp-file or database file I/O failure.
    #[error("I/O error on '{path}': {source}")]
    Io {
        #[source]
        source: std::io::Error,
        path: PathBuf,
    },

    /// Out-of-range or mutually exclusive configuration.
    #[error("invalid configuration: {0}")]
    Config(String),

    /// A bin does not fit the declared memory ceiling even in the
    /// strict-memory engine.
    #[error("bin {bin_id} needs {required} bytes but only {available} are allowed")]
    Capacity {
        bin_id: usize,
        required: u64,
        available: u64,
    },

    /// Descriptor or sorter bookkeeping mismatch; indicates a bug.
    #[error("internal invariant violated: {0}")]
    InternalInvariant(String),

    /// Failed to serialize the JSON summary.
    #[error("failed to serialize JSON summary: {source}")]
    Json {
        #[source]
        source: serde_json::Error,
    },

    /// The run was cancelled because another worker failed first.
    ///
    /// Never surfaced to the user; the broker keeps the first real error
    /// and workers unwinding with `Cancelled` are discarded.
    #[error("cancelled")]
    Cancelled,
}

impl KmerBinError {
    /// Wraps an I/O error with the path it happened on.
    pub fn io(source: std::io::Error, path: impl Into<PathBuf>) -> Self {
        Self::Io {
            source,
            path: path.into(),
        }
    }

    /// True for the internal cancellation marker.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }
}

impl From<serde_json::Error> for KmerBinError {
    fn from(source: serde_json::Error) -> Self {
        Self::Json { source }
    }
}

/// Crate-wide result alias.
pub type Result<T> = std::result::Result<T, KmerBinError>;

/// Error for an invalid k-mer length.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("k-mer length {k} is out of range: must be between {min} and {max}")]
pub struct KmerLengthError {
    /// The invalid k value that was provided.
    pub k: usize,
    /// Minimum valid k-mer length.
    pub min: usize,
    /// Maximum valid k-mer length.
    pub max: usize,
}

impl From<KmerLengthError> for KmerBinError {
    fn from(err: KmerLengthError) -> Self {
        Self::Config(err.to_string())
    }
}
