//! Error handling module for the image publisher

use thiserror::Error;

#[derive(Error, Debug)]
pub enum PublishError {
    /// Registry cannot be resolved or the request is inconsistent
    #[error("Configuration error: {0}")]
    Configuration(String),
    /// Access check denied or failed
    #[error("Authorization error: {0}")]
    Authorization(String),
    /// Reading or writing layer/archive files failed
    #[error("Build error: {0}")]
    Build(String),
    /// Commit, tag, load or push failed at the engine/registry boundary
    #[error("Transport error: {0}")]
    Transport(String),
    /// The push status stream reported an explicit error
    #[error("{0}")]
    Protocol(String),
    /// The push status stream ended without confirming the tag
    #[error("Docker push failed to complete. Please check logs for any error condition.. (tag: {tag})")]
    UnconfirmedPush { tag: String },
    /// The surrounding pipeline aborted an in-flight push
    #[error("Push cancelled: {0}")]
    Cancelled(String),
    /// Artifact collection produced an empty tarball
    #[error("Empty tarball: {0}")]
    EmptyTarball(String),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl PublishError {
    /// Process exit status reported for this error. Always non-zero.
    pub fn exit_code(&self) -> i32 {
        match self {
            PublishError::Configuration(_) => 2,
            PublishError::Authorization(_) => 3,
            PublishError::Build(_) | PublishError::Io(_) | PublishError::EmptyTarball(_) => 4,
            PublishError::Serialization(_) => 4,
            PublishError::Transport(_) => 1,
            PublishError::Protocol(_) | PublishError::UnconfirmedPush { .. } => 1,
            PublishError::Cancelled(_) => 130,
        }
    }

    pub fn build(context: &str, err: impl std::fmt::Display) -> Self {
        PublishError::Build(format!("{}: {}", context, err))
    }
}

impl From<reqwest::Error> for PublishError {
    fn from(err: reqwest::Error) -> Self {
        PublishError::Transport(err.to_string())
    }
}

impl From<url::ParseError> for PublishError {
    fn from(err: url::ParseError) -> Self {
        PublishError::Configuration(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, PublishError>;
