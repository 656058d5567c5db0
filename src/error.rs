//! Error taxonomy for the storage, retrieval, and ingestion engine.
//!
//! Fatal and per-file failures share one enum so that callers can match on
//! the variant to decide whether a run can continue:
//!
//! | Variant | Scope |
//! |---------|-------|
//! | [`Error::SchemaMigration`], [`Error::SchemaTooNew`] | fatal, the store does not open |
//! | [`Error::StorageTransaction`] | fatal to the enclosing batch only |
//! | [`Error::Processing`] | one file; logged, counted, skipped |
//! | [`Error::Embedding`] | one file, unless the circuit breaker trips |
//!
//! Validation problems are not errors: they are reported as
//! [`Issue`](crate::validate::Issue)s with a severity.

use std::fmt;
use std::path::PathBuf;

use thiserror::Error;

use crate::embedding::EmbeddingError;
use crate::vector::VectorError;

/// Result alias used across the library.
pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    #[error("schema migration v{version} ({description}) failed: {cause}")]
    SchemaMigration {
        version: i64,
        description: &'static str,
        cause: String,
    },

    #[error("store schema v{found} is newer than the supported v{supported}")]
    SchemaTooNew { found: i64, supported: i64 },

    #[error("storage transaction failed in batch {batch}: {source}")]
    StorageTransaction {
        batch: usize,
        #[source]
        source: Box<Error>,
    },

    #[error("failed to process {} during {stage}: {message}", path.display())]
    Processing {
        path: PathBuf,
        stage: Stage,
        message: String,
    },

    #[error("embedding dimension mismatch: store holds {expected}, got {actual}")]
    DimensionMismatch { expected: usize, actual: usize },

    #[error(transparent)]
    Embedding(#[from] EmbeddingError),

    #[error(transparent)]
    Vector(#[from] VectorError),

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("invalid glob pattern: {0}")]
    Glob(#[from] globset::Error),
}

impl Error {
    /// Wrap a storage failure with the batch it happened in.
    pub fn in_batch(self, batch: usize) -> Self {
        match self {
            already @ Error::StorageTransaction { .. } => already,
            other => Error::StorageTransaction {
                batch,
                source: Box::new(other),
            },
        }
    }

    pub fn processing(path: impl Into<PathBuf>, stage: Stage, message: impl fmt::Display) -> Self {
        Error::Processing {
            path: path.into(),
            stage,
            message: message.to_string(),
        }
    }
}

/// The per-file stage at which a processing failure happened.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Read,
    Parse,
    Embed,
    Store,
    Weave,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Stage::Read => "read",
            Stage::Parse => "parse",
            Stage::Embed => "embed",
            Stage::Store => "store",
            Stage::Weave => "weave",
        };
        f.write_str(name)
    }
}
