use thiserror::Error;

#[derive(Error, Debug)]
pub enum StoreError {
    /// The backing store failed to open. Fatal for every pending
    /// operation; the open is retried on the next call.
    #[error("store unavailable: {0}")]
    Unavailable(String),
    #[error("query failed: {0}")]
    Query(String),
    #[error("corrupt record: {0}")]
    Corrupt(String),
}

impl From<tokio_rusqlite::Error> for StoreError {
    fn from(e: tokio_rusqlite::Error) -> Self {
        StoreError::Query(e.to_string())
    }
}
