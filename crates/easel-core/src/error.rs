use thiserror::Error;

#[derive(Debug, Error)]
pub enum EaselError {
    #[error("Config error: {0}")]
    Config(String),

    #[error("Conversation error: {0}")]
    Conversation(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, EaselError>;
