use thiserror::Error;

#[derive(Error, Debug)]
pub enum SourceError {
    #[error("HTTP error: {0}")]
    HttpError(#[from] reqwest::Error),

    #[error("Query error: {0}")]
    QueryError(String),

    #[error("Decode error: {0}")]
    DecodeError(String),

    #[error("Timeout after {0:?}")]
    Timeout(std::time::Duration),
}
