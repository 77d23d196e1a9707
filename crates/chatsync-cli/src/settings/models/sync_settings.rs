use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncSettings {
    /// Base URL of the conversation/message endpoints
    pub remote_base_url: String,
    /// Streaming generation endpoint
    pub gateway_url: String,
    /// Page size used when walking remote listings
    pub page_size: usize,
    pub request_timeout_seconds: u64,
    /// SQLite database file. Defaults to `<config_dir>/chatsync/chatsync.db`.
    pub database_path: Option<PathBuf>,
    pub default_model_id: Option<String>,
}

impl Default for SyncSettings {
    fn default() -> Self {
        Self {
            remote_base_url: "http://localhost:3000/api".to_string(),
            gateway_url: "http://localhost:3000/api/chat".to_string(),
            page_size: 50,
            request_timeout_seconds: 30,
            database_path: None,
            default_model_id: None,
        }
    }
}

impl SyncSettings {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_seconds.max(1))
    }

    /// The configured database path, or the default location under `app_dir`.
    pub fn database_path_in(&self, app_dir: &std::path::Path) -> PathBuf {
        self.database_path
            .clone()
            .unwrap_or_else(|| app_dir.join("chatsync.db"))
    }
}
