use thiserror::Error;

#[derive(Error, Debug)]
pub enum BatchqError {
    #[error("Job not found: {0}")]
    JobNotFound(i64),

    #[error("Resource not found: {0}")]
    ResourceNotFound(String),

    #[error("Malformed record for job {0}: {1}")]
    MalformedRecord(i64, String),

    #[error("Job {0} cannot join a bundle in its current state")]
    NotBundleable(i64),

    #[error("Store error: {0}")]
    Store(#[from] rusqlite::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, BatchqError>;
