use std::path::PathBuf;

use directories::ProjectDirs;
use serde::Deserialize;

use crate::labels::DEFAULT_MODEL;

/// Application configuration loaded from TOML config file.
/// Every field has a default, so the config file is optional.
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    /// Custom database path (overrides XDG default).
    pub db_path: Option<PathBuf>,
    /// AI model whose automatic tags are compared against human tags.
    pub compare_ai: String,
    /// Visits per page for `visits` and `pages`.
    pub page_size: u32,
    /// Viewer identity used by the CLI.
    pub viewer: ViewerConfig,
    pub digest: DigestConfig,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            db_path: None,
            compare_ai: DEFAULT_MODEL.to_string(),
            page_size: 20,
            viewer: ViewerConfig::default(),
            digest: DigestConfig::default(),
        }
    }
}

/// Who the CLI acts as. Without `user` the CLI runs as the local operator.
#[derive(Debug, Deserialize, Default)]
#[serde(default)]
pub struct ViewerConfig {
    pub user: Option<String>,
    pub groups: Vec<i64>,
    pub super_user: bool,
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct DigestConfig {
    /// Hours back from now that a digest covers.
    pub hours: i64,
    /// Groups to summarise (all visible when empty).
    pub groups: Vec<i64>,
}

impl Default for DigestConfig {
    fn default() -> Self {
        Self {
            hours: 24,
            groups: Vec::new(),
        }
    }
}

impl AppConfig {
    /// Load config from `~/.config/fieldvisits/config.toml`.
    /// Returns default config if file doesn't exist.
    /// Logs a warning if the file exists but can't be parsed.
    pub fn load() -> Self {
        match Self::config_path() {
            Some(path) if path.exists() => match std::fs::read_to_string(&path) {
                Ok(contents) => match Self::parse(&contents) {
                    Ok(config) => {
                        log::info!("Loaded config from {}", path.display());
                        config
                    }
                    Err(e) => {
                        log::warn!("Failed to parse {}: {}. Using defaults.", path.display(), e);
                        Self::default()
                    }
                },
                Err(e) => {
                    log::warn!("Failed to read {}: {}. Using defaults.", path.display(), e);
                    Self::default()
                }
            },
            _ => {
                log::debug!("No config file found, using defaults");
                Self::default()
            }
        }
    }

    pub fn parse(contents: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(contents)
    }

    /// The viewer the CLI queries as.
    pub fn viewer(&self) -> crate::visits::Viewer {
        match &self.viewer.user {
            Some(user) => crate::visits::Viewer {
                user: user.clone(),
                groups: self.viewer.groups.clone(),
                super_user: self.viewer.super_user,
            },
            None => crate::visits::Viewer::operator(),
        }
    }

    /// Get the config file path.
    fn config_path() -> Option<PathBuf> {
        ProjectDirs::from("", "", crate::APP_NAME)
            .map(|dirs| dirs.config_dir().join("config.toml"))
    }
}

/// Resolve the default database path using XDG data directory.
pub fn default_db_path() -> PathBuf {
    if let Some(dirs) = ProjectDirs::from("", "", crate::APP_NAME) {
        let data_dir = dirs.data_dir();
        std::fs::create_dir_all(data_dir).ok();
        data_dir.join("fieldvisits.db")
    } else {
        // Fallback: current directory
        PathBuf::from("fieldvisits.db")
    }
}
