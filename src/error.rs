use thiserror::Error;

#[derive(Error, Debug)]
pub enum PgFeError {
    #[error("protocol violation: {0}")]
    Protocol(String),

    #[error("authentication failed for user '{0}'")]
    AuthFailed(String),

    #[error("backend error: {0}")]
    Backend(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("connection closed")]
    ConnectionClosed,
}

pub type Result<T> = std::result::Result<T, PgFeError>;
