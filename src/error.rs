use std::path::PathBuf;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum QdError {
    #[error("I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("RPC error: {0}")]
    Rpc(#[from] tonic::Status),

    #[error("Transport error: {0}")]
    Transport(#[from] tonic::transport::Error),

    #[error("Download error: {0}")]
    Download(#[from] reqwest::Error),

    #[error("Lock already held: {0}")]
    LockBusy(PathBuf),

    #[error("No sequences could be read for job {0}")]
    EmptyQuery(String),

    #[error("Corrupt state: {0}")]
    Corrupt(String),
}

impl QdError {
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }
}

pub type Result<T> = std::result::Result<T, QdError>;
