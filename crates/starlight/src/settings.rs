use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::remote::DEFAULT_API_URL;

pub const SETTINGS_FILE_NAME: &str = "settings.toml";

#[derive(Debug, thiserror::Error)]
pub enum SettingsError {
    #[error("failed to read settings file {}: {source}", .path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("failed to write settings file {}: {source}", .path.display())]
    Write {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("failed to parse settings: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("failed to serialize settings: {0}")]
    Serialize(#[from] toml::ser::Error),
    #[error("invalid settings: {0}")]
    Invalid(String),
}

/// Read-only inputs to backend selection. An empty `binary_path` disables the
/// local compiler.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub binary_path: String,
    pub api_url: String,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            binary_path: String::new(),
            api_url: DEFAULT_API_URL.to_string(),
        }
    }
}

impl Settings {
    pub fn from_toml_str(input: &str) -> Result<Self, SettingsError> {
        let settings: Settings = toml::from_str(input)?;
        settings.validate()?;
        Ok(settings)
    }

    pub fn load_or_default(path: &Path) -> Result<Self, SettingsError> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let contents = fs::read_to_string(path).map_err(|source| SettingsError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&contents)
    }

    pub fn persist(&self, path: &Path) -> Result<(), SettingsError> {
        let serialized = toml::to_string_pretty(self)?;
        let write_err = |source| SettingsError::Write {
            path: path.to_path_buf(),
            source,
        };
        if let Some(dir) = path.parent() {
            fs::create_dir_all(dir).map_err(write_err)?;
        }
        fs::write(path, serialized).map_err(write_err)
    }

    pub fn validate(&self) -> Result<(), SettingsError> {
        if self.binary_path.trim().is_empty() && self.api_url.trim().is_empty() {
            return Err(SettingsError::Invalid(
                "either binary_path or api_url must be set".into(),
            ));
        }
        Ok(())
    }

    /// Applies command-line overrides on top of file values.
    pub fn with_overrides(mut self, binary_path: Option<String>, api_url: Option<String>) -> Self {
        if let Some(binary_path) = binary_path {
            self.binary_path = binary_path;
        }
        if let Some(api_url) = api_url {
            self.api_url = api_url;
        }
        self
    }

    pub fn uses_local_compiler(&self) -> bool {
        !self.binary_path.trim().is_empty()
    }
}
