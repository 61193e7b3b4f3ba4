pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("invalid config: {message}")]
    InvalidConfig { message: String },

    #[error("connection error: {message}")]
    Connection { message: String },

    #[error("not found: {message}")]
    NotFound { message: String },

    #[error("transfer error: {message}")]
    Transfer { message: String },

    #[error("{context} failed after {attempts} attempts: {message}")]
    RetriesExhausted {
        context: String,
        attempts: u32,
        message: String,
    },

    #[error("cancelled")]
    Cancelled,

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("sqlite error: {0}")]
    Sqlite(#[from] sqlx::Error),

    #[error("walkdir error: {0}")]
    Walkdir(#[from] walkdir::Error),
}

impl Error {
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::Connection { .. }
            | Error::NotFound { .. }
            | Error::Transfer { .. }
            | Error::Io(_)
            | Error::Sqlite(_) => true,
            Error::InvalidConfig { .. }
            | Error::RetriesExhausted { .. }
            | Error::Cancelled
            | Error::Json(_)
            | Error::Walkdir(_) => false,
        }
    }
}
