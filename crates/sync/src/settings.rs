use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwap;
use figment::{
    Figment,
    providers::{Env, Format, Json, Serialized},
};
use serde::{Deserialize, Serialize};
use snafu::{ResultExt, Snafu};

use chatsync_storage::DEFAULT_CONVERSATION_TITLE;

pub const SETTINGS_DIRECTORY_NAME: &str = "chatsync";
pub const SETTINGS_FILE_NAME: &str = "settings.json";
pub const DATABASE_FILE_NAME: &str = "chatsync.db";
pub const SETTINGS_ENV_PREFIX: &str = "CHATSYNC_";
pub const DEFAULT_TERMINAL_SENTINEL: &str = "[DONE]";
pub const DEFAULT_RESOLUTION_CACHE_CAPACITY: usize = 256;
pub const DEFAULT_RESOLUTION_CACHE_TTL_SECS: u64 = 600;
pub const DEFAULT_LOG_FILTER: &str = "info";

/// Settings shared between the settings store and running controllers.
pub type SharedSettings = Arc<ArcSwap<SyncSettings>>;

pub fn shared_settings(settings: SyncSettings) -> SharedSettings {
    Arc::new(ArcSwap::from_pointee(settings.normalized()))
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncSettings {
    #[serde(default = "default_database_location")]
    pub database_location: String,
    #[serde(default = "default_placeholder_title")]
    pub placeholder_title: String,
    #[serde(default = "default_terminal_sentinel")]
    pub terminal_sentinel: String,
    #[serde(default = "default_resolution_cache_capacity")]
    pub resolution_cache_capacity: usize,
    #[serde(default = "default_resolution_cache_ttl_secs")]
    pub resolution_cache_ttl_secs: u64,
    #[serde(default = "default_log_filter")]
    pub log_filter: String,
}

impl Default for SyncSettings {
    fn default() -> Self {
        Self {
            database_location: default_database_location(),
            placeholder_title: default_placeholder_title(),
            terminal_sentinel: default_terminal_sentinel(),
            resolution_cache_capacity: default_resolution_cache_capacity(),
            resolution_cache_ttl_secs: default_resolution_cache_ttl_secs(),
            log_filter: default_log_filter(),
        }
    }
}

impl SyncSettings {
    pub fn normalized(mut self) -> Self {
        self.database_location = non_blank_or(self.database_location, default_database_location);
        self.placeholder_title = non_blank_or(self.placeholder_title, default_placeholder_title);
        self.terminal_sentinel = non_blank_or(self.terminal_sentinel, default_terminal_sentinel);
        self.log_filter = non_blank_or(self.log_filter, default_log_filter);
        if self.resolution_cache_capacity == 0 {
            self.resolution_cache_capacity = default_resolution_cache_capacity();
        }
        if self.resolution_cache_ttl_secs == 0 {
            self.resolution_cache_ttl_secs = default_resolution_cache_ttl_secs();
        }

        self
    }

    pub fn resolution_cache_ttl(&self) -> Duration {
        Duration::from_secs(self.resolution_cache_ttl_secs)
    }
}

pub struct SettingsStore {
    settings: SharedSettings,
    config_path: PathBuf,
}

impl SettingsStore {
    pub fn default_config_dir() -> PathBuf {
        dirs::config_dir()
            .map(|path| path.join(SETTINGS_DIRECTORY_NAME))
            .unwrap_or_else(|| PathBuf::from(".chatsync"))
    }

    pub fn default_config_path() -> PathBuf {
        Self::default_config_dir().join(SETTINGS_FILE_NAME)
    }

    pub fn new(config_path: PathBuf) -> Self {
        let settings = Self::load_from_disk(&config_path);
        Self {
            settings: shared_settings(settings),
            config_path,
        }
    }

    pub fn load() -> Self {
        Self::new(Self::default_config_path())
    }

    pub fn config_path(&self) -> &Path {
        &self.config_path
    }

    /// Snapshot of the current settings; later updates do not affect it.
    pub fn settings(&self) -> Arc<SyncSettings> {
        self.settings.load_full()
    }

    /// Handle for components that re-read settings on their own schedule.
    pub fn shared(&self) -> SharedSettings {
        Arc::clone(&self.settings)
    }

    pub fn update(&self, settings: SyncSettings) -> Result<(), SettingsError> {
        let normalized_settings = settings.normalized();
        self.persist(&normalized_settings)?;
        self.settings.store(Arc::new(normalized_settings));
        Ok(())
    }

    /// Applies settings for this process only.
    pub fn override_in_memory(&self, settings: SyncSettings) {
        self.settings.store(Arc::new(settings.normalized()));
    }

    pub fn reload(&self) {
        self.settings
            .store(Arc::new(Self::load_from_disk(&self.config_path)));
    }

    fn load_from_disk(path: &Path) -> SyncSettings {
        if !path.exists() {
            tracing::info!(path = ?path, "settings file not found, using defaults");
        }

        let figment = Figment::from(Serialized::defaults(SyncSettings::default()))
            .merge(Json::file(path))
            .merge(Env::prefixed(SETTINGS_ENV_PREFIX));

        match figment.extract::<SyncSettings>() {
            Ok(settings) => settings.normalized(),
            Err(error) => {
                tracing::warn!(
                    path = ?path,
                    error = %error,
                    "failed to parse settings, using defaults"
                );
                SyncSettings::default()
            }
        }
    }

    fn persist(&self, settings: &SyncSettings) -> Result<(), SettingsError> {
        if let Some(parent) = self.config_path.parent() {
            std::fs::create_dir_all(parent).context(CreateDirSnafu {
                stage: "create-settings-directory",
                path: parent.to_path_buf(),
            })?;
        }

        let content = serde_json::to_string_pretty(settings).context(SerializeConfigSnafu {
            stage: "serialize-settings-json",
        })?;

        let temp_path = self.config_path.with_extension("json.tmp");
        std::fs::write(&temp_path, content).context(WriteFileSnafu {
            stage: "write-temporary-settings-file",
            path: temp_path.clone(),
        })?;

        std::fs::rename(&temp_path, &self.config_path).context(RenameTempFileSnafu {
            stage: "rename-temporary-settings-file",
            from: temp_path,
            to: self.config_path.clone(),
        })?;

        tracing::info!(path = ?self.config_path, "saved settings");
        Ok(())
    }
}

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum SettingsError {
    #[snafu(display("failed to create settings directory at {path:?} on `{stage}`: {source}"))]
    CreateDir {
        stage: &'static str,
        path: PathBuf,
        source: std::io::Error,
    },
    #[snafu(display("failed to serialize settings on `{stage}`: {source}"))]
    SerializeConfig {
        stage: &'static str,
        source: serde_json::Error,
    },
    #[snafu(display("failed to write settings file at {path:?} on `{stage}`: {source}"))]
    WriteFile {
        stage: &'static str,
        path: PathBuf,
        source: std::io::Error,
    },
    #[snafu(display(
        "failed to replace settings file from {from:?} to {to:?} on `{stage}`: {source}"
    ))]
    RenameTempFile {
        stage: &'static str,
        from: PathBuf,
        to: PathBuf,
        source: std::io::Error,
    },
}

fn non_blank_or(value: String, fallback: fn() -> String) -> String {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        fallback()
    } else {
        trimmed.to_string()
    }
}

fn default_database_location() -> String {
    SettingsStore::default_config_dir()
        .join(DATABASE_FILE_NAME)
        .to_string_lossy()
        .into_owned()
}

fn default_placeholder_title() -> String {
    DEFAULT_CONVERSATION_TITLE.to_string()
}

fn default_terminal_sentinel() -> String {
    DEFAULT_TERMINAL_SENTINEL.to_string()
}

fn default_resolution_cache_capacity() -> usize {
    DEFAULT_RESOLUTION_CACHE_CAPACITY
}

fn default_resolution_cache_ttl_secs() -> u64 {
    DEFAULT_RESOLUTION_CACHE_TTL_SECS
}

fn default_log_filter() -> String {
    DEFAULT_LOG_FILTER.to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_file_is_merged_over_defaults() {
        let directory = tempfile::tempdir().unwrap();
        let path = directory.path().join(SETTINGS_FILE_NAME);
        std::fs::write(
            &path,
            r#"{ "placeholder_title": "  Untitled  ", "resolution_cache_capacity": 8 }"#,
        )
        .unwrap();

        let settings = SettingsStore::new(path).settings();

        assert_eq!(settings.placeholder_title, "Untitled");
        assert_eq!(settings.resolution_cache_capacity, 8);
        assert_eq!(settings.terminal_sentinel, DEFAULT_TERMINAL_SENTINEL);
    }

    #[test]
    fn unreadable_file_falls_back_to_defaults() {
        let directory = tempfile::tempdir().unwrap();
        let path = directory.path().join(SETTINGS_FILE_NAME);
        std::fs::write(&path, "{ not json").unwrap();

        let settings = SettingsStore::new(path).settings();

        assert_eq!(settings.placeholder_title, DEFAULT_CONVERSATION_TITLE);
        assert_eq!(settings.resolution_cache_ttl_secs, DEFAULT_RESOLUTION_CACHE_TTL_SECS);
    }

    #[test]
    fn update_persists_and_swaps_snapshot() {
        let directory = tempfile::tempdir().unwrap();
        let path = directory.path().join("nested").join(SETTINGS_FILE_NAME);
        let store = SettingsStore::new(path.clone());
        let before = store.settings();

        store
            .update(SyncSettings {
                terminal_sentinel: "[END]".to_string(),
                resolution_cache_capacity: 0,
                ..SyncSettings::default()
            })
            .unwrap();

        assert_eq!(before.terminal_sentinel, DEFAULT_TERMINAL_SENTINEL);
        assert_eq!(store.settings().terminal_sentinel, "[END]");
        assert_eq!(
            store.settings().resolution_cache_capacity,
            DEFAULT_RESOLUTION_CACHE_CAPACITY
        );
        assert_eq!(SettingsStore::new(path).settings().terminal_sentinel, "[END]");
    }
}
