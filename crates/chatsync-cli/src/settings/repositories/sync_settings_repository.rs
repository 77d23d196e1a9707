use std::future::Future;
use std::pin::Pin;

use thiserror::Error;

use crate::settings::models::SyncSettings;

/// Repository error type - abstracts over specific implementation errors
#[derive(Debug, Error)]
pub enum RepositoryError {
    #[error("I/O error: {0}")]
    IoError(#[from] std::io::Error),
    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),
    #[error("Path error: {0}")]
    PathError(String),
}

pub type RepositoryResult<T> = Result<T, RepositoryError>;
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

pub trait SyncSettingsRepository: Send + Sync + 'static {
    /// Load settings from storage
    fn load(&self) -> BoxFuture<'static, RepositoryResult<SyncSettings>>;

    /// Save settings to storage
    fn save(&self, settings: SyncSettings) -> BoxFuture<'static, RepositoryResult<()>>;
}
