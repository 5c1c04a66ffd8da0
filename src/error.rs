use std::path::PathBuf;

/// Errors surfaced by the training/evaluation executor and its collaborators.
///
/// Configuration and structure errors indicate a setup defect and are fatal;
/// there is no retry path. `Divergence` is raised mid-training once the
/// consecutive non-finite-epoch limit is exceeded.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("checkpoint does not match model structure: {0}")]
    StructureMismatch(String),

    #[error("training diverged: {0}")]
    Divergence(String),

    #[error("data source yielded no batches: {0}")]
    DataExhausted(String),

    #[error("failed to read {path}: {source}")]
    FileRead {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error(transparent)]
    Torch(#[from] tch::TchError),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
