use thiserror::Error;

#[derive(Debug, Error)]
#[allow(clippy::enum_variant_names)]
pub enum RepositoryError {
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),

    #[error("Database error: {0}")]
    DatabaseError(#[from] sqlx::Error),

    #[error("HTTP error: {0}")]
    HttpError(#[from] reqwest::Error),

    #[error("Unexpected status {status} from {url}")]
    StatusError { status: u16, url: String },

    #[error("Store unavailable: {message}")]
    Unavailable { message: String },
}

pub type RepositoryResult<T> = Result<T, RepositoryError>;
