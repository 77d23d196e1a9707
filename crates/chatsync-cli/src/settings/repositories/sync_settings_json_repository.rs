use std::path::{Path, PathBuf};

use tracing::debug;

use super::sync_settings_repository::{
    BoxFuture, RepositoryError, RepositoryResult, SyncSettingsRepository,
};
use crate::settings::models::SyncSettings;

pub struct SyncSettingsJsonRepository {
    file_path: PathBuf,
}

impl SyncSettingsJsonRepository {
    /// Create repository with XDG-compliant path
    pub fn new() -> RepositoryResult<Self> {
        Ok(Self::at(app_dir()?.join("settings.json")))
    }

    pub fn at(file_path: impl Into<PathBuf>) -> Self {
        Self {
            file_path: file_path.into(),
        }
    }

    pub fn file_path(&self) -> &Path {
        &self.file_path
    }
}

/// `<config_dir>/chatsync`
pub fn app_dir() -> RepositoryResult<PathBuf> {
    let config_dir = dirs::config_dir()
        .ok_or_else(|| RepositoryError::PathError("Cannot determine config directory".into()))?;
    Ok(config_dir.join("chatsync"))
}

impl SyncSettingsRepository for SyncSettingsJsonRepository {
    fn load(&self) -> BoxFuture<'static, RepositoryResult<SyncSettings>> {
        let path = self.file_path.clone();

        Box::pin(async move {
            if !tokio::fs::try_exists(&path).await? {
                debug!(path = %path.display(), "No settings file, using defaults");
                return Ok(SyncSettings::default());
            }

            let contents = tokio::fs::read_to_string(&path).await?;
            let settings: SyncSettings = serde_json::from_str(&contents)?;
            Ok(settings)
        })
    }

    fn save(&self, settings: SyncSettings) -> BoxFuture<'static, RepositoryResult<()>> {
        let path = self.file_path.clone();

        Box::pin(async move {
            let json = serde_json::to_string_pretty(&settings)?;

            if let Some(parent) = path.parent() {
                tokio::fs::create_dir_all(parent).await?;
            }

            // Write atomically using temp file + rename
            let temp_path = path.with_extension("json.tmp");
            tokio::fs::write(&temp_path, &json).await?;
            tokio::fs::rename(&temp_path, &path).await?;

            Ok(())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_missing_file_loads_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let repo = SyncSettingsJsonRepository::at(dir.path().join("settings.json"));

        let settings = repo.load().await.unwrap();
        assert_eq!(settings, SyncSettings::default());
    }

    #[tokio::test]
    async fn test_save_then_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("settings.json");
        let repo = SyncSettingsJsonRepository::at(&path);

        let settings = SyncSettings {
            page_size: 5,
            default_model_id: Some("model-a".to_string()),
            ..SyncSettings::default()
        };
        repo.save(settings.clone()).await.unwrap();

        assert!(path.exists());
        assert!(!path.with_extension("json.tmp").exists());
        assert_eq!(repo.load().await.unwrap(), settings);
    }

    #[tokio::test]
    async fn test_corrupt_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");
        std::fs::write(&path, "{not json").unwrap();

        let result = SyncSettingsJsonRepository::at(&path).load().await;
        assert!(matches!(result, Err(RepositoryError::SerializationError(_))));
    }
}
