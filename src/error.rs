use std::io;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, StatsError>;

#[derive(Debug, Error)]
pub enum StatsError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
    #[error("serialization error: {0}")]
    Serialization(String),
    #[error("app_id can't contain ',' (comma): {0:?}")]
    InvalidAppId(String),
    #[error("name can't contain ',' (comma): {0:?}")]
    InvalidName(String),
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
    #[error("archive unavailable: {0}")]
    ArchiveUnavailable(String),
    #[error("{0} not found")]
    NotFound(&'static str),
}

impl StatsError {
    /// Whether a retry at the call site can reasonably succeed.
    pub fn is_transient(&self) -> bool {
        matches!(self, StatsError::ArchiveUnavailable(_) | StatsError::Io(_))
    }
}
