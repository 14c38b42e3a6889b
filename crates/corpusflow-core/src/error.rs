use thiserror::Error;

type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Errors raised by the metadata cache.
#[derive(Debug, Error)]
pub enum CacheError {
    #[error("Cache database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Cache serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Cache I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid cache record {doc_id}: {reason}")]
    InvalidRecord { doc_id: String, reason: String },
}

/// Errors raised by sources and the document manager.
#[derive(Debug, Error)]
pub enum SourceError {
    /// Authorization or network failure while connecting. Retrying the
    /// connect call may succeed.
    #[error("Failed to connect: {message}")]
    Connection {
        message: String,
        #[source]
        source: Option<BoxError>,
    },

    #[error("Source not found: {0}")]
    SourceNotFound(String),

    #[error("Document not found: {0}")]
    DocumentNotFound(String),

    #[error("Unsupported document type: {0}")]
    UnsupportedType(String),

    #[error("Source {0} is not connected")]
    NotConnected(String),

    /// The backing repository itself is absent (missing root, missing bucket).
    #[error("Repository unavailable: {0}")]
    Unavailable(String),

    #[error("Provider error: {0}")]
    Provider(String),

    #[error("Watch error: {0}")]
    Watch(String),

    #[error(transparent)]
    Cache(#[from] CacheError),
}

impl SourceError {
    /// Build a connection error wrapping its underlying cause.
    pub fn connection<E>(message: impl Into<String>, cause: E) -> Self
    where
        E: Into<BoxError>,
    {
        SourceError::Connection {
            message: message.into(),
            source: Some(cause.into()),
        }
    }

    /// Build a connection error without an underlying cause.
    pub fn connection_msg(message: impl Into<String>) -> Self {
        SourceError::Connection {
            message: message.into(),
            source: None,
        }
    }
}
