pub mod models;
pub mod repositories;

pub use models::SyncSettings;
pub use repositories::{SyncSettingsJsonRepository, SyncSettingsRepository};
