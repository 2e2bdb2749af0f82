use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::config::{self, ConfigError, ConfigResult};
use crate::retry::RetrySettings;

pub const SETTINGS_FILE: &str = "massip.toml";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Settings {
    /// Directory of plugin manifests.
    pub plugin_dir: PathBuf,
    /// Directory of parser definitions.
    pub parser_dir: PathBuf,
    /// Hard limit for a single plugin attempt, unless the plugin overrides it.
    pub attempt_timeout_secs: u64,
    pub retry: RetrySettings,
    /// Capacity of the progress channel.
    pub progress_buffer: usize,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            plugin_dir: PathBuf::from("plugins"),
            parser_dir: PathBuf::from("parsers"),
            attempt_timeout_secs: 60,
            retry: RetrySettings::default(),
            progress_buffer: 256,
        }
    }
}

impl Settings {
    /// Load and validate a settings file. Relative directories are resolved
    /// against the file's own directory.
    pub fn load(path: &Path) -> ConfigResult<Self> {
        let mut settings: Self = config::load_definition(path)?;
        if let Some(base) = path.parent() {
            settings.plugin_dir = base.join(&settings.plugin_dir);
            settings.parser_dir = base.join(&settings.parser_dir);
        }
        settings.validate()?;
        tracing::debug!(path = %path.display(), "loaded settings");
        Ok(settings)
    }

    /// `massip.toml` in `cwd`, then in the user config directory, then
    /// defaults.
    pub fn discover(cwd: &Path) -> ConfigResult<Self> {
        let local = cwd.join(SETTINGS_FILE);
        if local.is_file() {
            return Self::load(&local);
        }

        if let Some(user) = Self::user_settings_path().filter(|p| p.is_file()) {
            return Self::load(&user);
        }

        Ok(Self::default())
    }

    pub fn user_settings_path() -> Option<PathBuf> {
        dirs::config_dir().map(|dir| dir.join("massip").join(SETTINGS_FILE))
    }

    pub const fn attempt_timeout(&self) -> Duration {
        Duration::from_secs(self.attempt_timeout_secs)
    }

    pub fn validate(&self) -> ConfigResult<()> {
        if self.attempt_timeout_secs == 0 {
            return Err(ConfigError::Settings(
                "attempt_timeout_secs must be greater than 0".into(),
            ));
        }
        if self.progress_buffer == 0 {
            return Err(ConfigError::Settings(
                "progress_buffer must be greater than 0".into(),
            ));
        }
        self.retry.validate()
    }

    #[must_use]
    pub fn with_plugin_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.plugin_dir = dir.into();
        self
    }

    #[must_use]
    pub fn with_parser_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.parser_dir = dir.into();
        self
    }
}
