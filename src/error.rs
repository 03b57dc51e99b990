use std::path::PathBuf;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("I/O error on {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to download {url}: {reason}")]
    Download { url: String, reason: String },

    #[error("Invalid IDX file {name}: {reason}")]
    InvalidIdx { name: String, reason: String },

    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error("Failed to record {what} at {path:?}: {reason}")]
    Record {
        what: &'static str,
        path: PathBuf,
        reason: String,
    },

    #[error("Invalid arguments: {0}")]
    InvalidArgs(String),

    #[error("Failed to read tensor data: {0}")]
    TensorData(String),
}

impl Error {
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    pub(crate) fn idx(name: &str, reason: impl Into<String>) -> Self {
        Self::InvalidIdx {
            name: name.to_owned(),
            reason: reason.into(),
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
