pub mod sync_settings_json_repository;
pub mod sync_settings_repository;

pub use sync_settings_json_repository::SyncSettingsJsonRepository;
pub use sync_settings_repository::SyncSettingsRepository;
