use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StreamError {
    /// The caller used an id this service never issued.
    #[error("Exec handle not found: {0}")]
    HandleNotFound(String),
}

pub type Result<T> = std::result::Result<T, StreamError>;
