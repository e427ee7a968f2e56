use std::path::PathBuf;

use neurocluster::error::CoreError;

#[derive(Debug, thiserror::Error)]
pub enum DaemonError {
    #[error(transparent)]
    Core(#[from] CoreError),

    #[error("request needs either `text` or `vector`")]
    MissingPattern,

    #[error("vector has dimension {got}, expected {expected}")]
    Dimension { expected: usize, got: usize },

    #[error("could not determine the OS data directory")]
    NoDataDir,

    #[error("failed to create data directory {path:?}: {source}")]
    DataDir {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid config {path:?}: {reason}")]
    Config { path: PathBuf, reason: String },

    #[error("invalid value for {var}: {value:?}")]
    Env { var: &'static str, value: String },

    #[error("worker task failed: {0}")]
    Join(#[from] tokio::task::JoinError),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}
