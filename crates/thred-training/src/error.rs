use thiserror::Error;

pub type TrainingResult<T> = std::result::Result<T, TrainingError>;

#[derive(Debug, Error)]
pub enum TrainingError {
    /// Configuration rejected before any work started.
    #[error("precondition violated: {0}")]
    Precondition(String),

    #[error("dataset error: {0}")]
    Dataset(String),

    #[error("checkpoint error: {0}")]
    Checkpoint(String),

    /// A train/eval/infer execution context failed.
    #[error("{kind} session error: {message}")]
    Session { kind: crate::context::ContextKind, message: String },

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    TomlDe(#[from] toml::de::Error),

    #[error(transparent)]
    TomlSer(#[from] toml::ser::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl TrainingError {
    pub fn session(kind: crate::context::ContextKind, message: impl Into<String>) -> Self {
        Self::Session { kind, message: message.into() }
    }
}
