use std::path::{Path, PathBuf};

use celia_common::{Error, Result};
use tracing::info;

use crate::model::AppConfig;

const YAML_FILE: &str = "celia.yml";
const TOML_FILE: &str = "celia.toml";

pub struct ConfigLoader {
    config_dir: PathBuf,
}

impl ConfigLoader {
    pub fn new() -> Self {
        Self {
            config_dir: Self::default_config_dir(),
        }
    }

    /// The working directory when it holds a config file, otherwise the
    /// XDG config directory (`~/.config/celia`).
    pub fn default_config_dir() -> PathBuf {
        let cwd = std::env::current_dir().unwrap_or_else(|_| PathBuf::from("."));
        if cwd.join(YAML_FILE).exists() || cwd.join(TOML_FILE).exists() {
            return cwd;
        }

        dirs::config_dir()
            .map(|c| c.join("celia"))
            .unwrap_or(cwd)
    }

    pub fn with_dir(config_dir: impl Into<PathBuf>) -> Self {
        Self {
            config_dir: config_dir.into(),
        }
    }

    pub fn config_dir(&self) -> &Path {
        &self.config_dir
    }

    /// Returns true if a config file (YAML or TOML) exists on disk.
    pub fn config_file_exists(&self) -> bool {
        self.config_dir.join(YAML_FILE).exists() || self.config_dir.join(TOML_FILE).exists()
    }

    pub fn load(&self) -> Result<AppConfig> {
        let yaml_path = self.config_dir.join(YAML_FILE);
        let toml_path = self.config_dir.join(TOML_FILE);

        if yaml_path.exists() {
            Self::load_file(&yaml_path)
        } else if toml_path.exists() {
            Self::load_file(&toml_path)
        } else {
            info!("no config file found, using defaults");
            Ok(AppConfig::default())
        }
    }

    /// Load an explicit config file; the format follows its extension.
    pub fn load_file(path: &Path) -> Result<AppConfig> {
        info!("loading config from {}", path.display());
        let contents = std::fs::read_to_string(path)?;

        match path.extension().and_then(|e| e.to_str()) {
            Some("toml") => toml::from_str(&contents)
                .map_err(|e| Error::Config(format!("failed to parse TOML config: {e}"))),
            Some("yml") | Some("yaml") => serde_yaml::from_str(&contents)
                .map_err(|e| Error::Config(format!("failed to parse YAML config: {e}"))),
            _ => Err(Error::Config(format!(
                "unsupported config file extension: {}",
                path.display()
            ))),
        }
    }
}

impl Default for ConfigLoader {
    fn default() -> Self {
        Self::new()
    }
}
