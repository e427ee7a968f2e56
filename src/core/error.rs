//! Error taxonomy.
//!
//! Only conditions the caller must act on are errors. Degenerate quantizer
//! states are reported through stats and failed partition writes through
//! `PersistResult`, never through these types.

use std::io;
use std::path::PathBuf;

use crate::ids::ClusterId;

/// Input that carries no encodable signal. Recovered locally by the encoder.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum EncodingError {
    #[error("empty input")]
    Empty,

    #[error("input has no alphanumeric content: {0:?}")]
    NoSignal(String),
}

#[derive(thiserror::Error, Debug)]
pub enum QuantizerError {
    #[error("vector dimension mismatch: expected {expected}, got {got}")]
    DimensionMismatch { expected: usize, got: usize },

    #[error("invalid codebook snapshot: {0}")]
    InvalidSnapshot(&'static str),

    #[error("invalid quantizer config: {0}")]
    InvalidConfig(&'static str),

    #[error("malformed region id: {0:?}")]
    MalformedRegion(String),
}

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum IdError {
    #[error("malformed identifier: {0:?}")]
    Malformed(String),
}

#[derive(thiserror::Error, Debug)]
pub enum StoreError {
    #[error("io error on {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("unknown cluster {0}")]
    UnknownCluster(ClusterId),

    #[error("cluster {0} already exists")]
    DuplicateCluster(ClusterId),

    #[error("invalid store config: {0}")]
    InvalidConfig(&'static str),

    #[error("store has no storage root (in-memory)")]
    NoStorageRoot,
}

impl StoreError {
    pub(crate) fn io(path: impl Into<PathBuf>, source: io::Error) -> Self {
        StoreError::Io {
            path: path.into(),
            source,
        }
    }
}

/// Crate-level error type.
#[derive(thiserror::Error, Debug)]
pub enum CoreError {
    #[error("encoding error: {0}")]
    Encoding(#[from] EncodingError),

    #[error("quantizer error: {0}")]
    Quantizer(#[from] QuantizerError),

    #[error("identifier error: {0}")]
    Id(#[from] IdError),

    #[error("store error: {0}")]
    Store(#[from] StoreError),

    #[error("unknown cluster {0}")]
    UnknownCluster(ClusterId),

    #[error("invalid config: {0}")]
    InvalidConfig(&'static str),

    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

pub type Result<T> = std::result::Result<T, CoreError>;
