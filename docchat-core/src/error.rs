use thiserror::Error;

pub type Result<T> = std::result::Result<T, ChatError>;

#[derive(Error, Debug)]
pub enum ChatError {
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("API error ({status}): {message}")]
    Api { status: u16, message: String },

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Decode error: {0}")]
    Decode(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Config error: {0}")]
    Config(#[from] config::ConfigError),
}

impl ChatError {
    /// Whether an idempotent request that failed this way is worth retrying.
    pub fn is_transient(&self) -> bool {
        match self {
            ChatError::Http(e) => e.is_timeout() || e.is_connect() || e.is_request(),
            ChatError::Api { status, .. } => *status == 429 || *status >= 500,
            _ => false,
        }
    }
}
