//! Error types for conversion scanning and gene aggregation.

use std::path::PathBuf;

use thiserror::Error;

/// Result type alias for gconv operations
pub type Result<T> = std::result::Result<T, ConvError>;

/// Error type for gconv operations
#[derive(Error, Debug)]
pub enum ConvError {
    /// A required flag combination was violated. Raised before any scan begins.
    #[error("Invalid configuration: {0}")]
    Configuration(String),

    /// One alignment record could not be interpreted. The pair is skipped.
    #[error("Malformed record '{read}': {reason}")]
    RecordParse {
        /// Read name of the offending pair
        read: String,
        /// What was wrong with it
        reason: String,
    },

    /// One or more shards failed, so the run produced no output.
    #[error("{failed} of {total} shards failed; first error: {first}")]
    ShardFailure {
        /// Number of shards that did not complete
        failed: usize,
        /// Number of shards in the run
        total: usize,
        /// Message of the first failure observed
        first: String,
    },

    /// A worker stopped early because another shard failed.
    #[error("Shard cancelled")]
    Cancelled,

    /// A worker thread panicked.
    #[error("Worker panicked: {0}")]
    WorkerPanic(String),

    /// Failure reading or decoding the alignment source.
    #[error("Alignment source error: {0}")]
    Htslib(#[from] rust_htslib::errors::Error),

    /// Failure writing an output table.
    #[error("I/O error on '{path}': {source}")]
    Io {
        /// File being written
        path: PathBuf,
        /// Underlying error
        #[source]
        source: std::io::Error,
    },
}

impl ConvError {
    /// Build a `RecordParse` error from a raw read name.
    pub fn record(read: &[u8], reason: impl Into<String>) -> Self {
        ConvError::RecordParse {
            read: String::from_utf8_lossy(read).into_owned(),
            reason: reason.into(),
        }
    }

    /// Per-pair data errors are skipped and counted; everything else is fatal.
    pub fn is_record_error(&self) -> bool {
        matches!(self, ConvError::RecordParse { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_configuration_message() {
        let error = ConvError::Configuration("use_g_t or use_g_c is required".to_string());
        let msg = format!("{error}");
        assert!(msg.contains("Invalid configuration"));
        assert!(msg.contains("use_g_t"));
    }

    #[test]
    fn test_record_error_from_bytes() {
        let error = ConvError::record(b"read_17", "missing MD tag");
        assert!(error.is_record_error());
        let msg = format!("{error}");
        assert!(msg.contains("'read_17'"));
        assert!(msg.contains("missing MD tag"));
    }

    #[test]
    fn test_shard_failure_message() {
        let error = ConvError::ShardFailure {
            failed: 2,
            total: 8,
            first: "truncated BGZF block".to_string(),
        };
        assert!(!error.is_record_error());
        let msg = format!("{error}");
        assert!(msg.contains("2 of 8 shards failed"));
        assert!(msg.contains("truncated BGZF block"));
    }
}
