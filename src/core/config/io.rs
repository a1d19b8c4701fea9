use crate::core::config::data::{path_display, Config};
use directories::ProjectDirs;
use std::error::Error as StdError;
use std::fmt;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;

/// Errors that can occur when loading or persisting configuration.
#[derive(Debug)]
pub enum ConfigError {
    /// Failed to read the configuration file from disk.
    Read {
        /// Path to the configuration file that could not be read.
        path: PathBuf,
        /// The underlying I/O error.
        source: std::io::Error,
    },

    /// Failed to parse the configuration file as valid TOML.
    Parse {
        /// Path to the configuration file with invalid TOML.
        path: PathBuf,
        /// The TOML deserialization error.
        source: toml::de::Error,
    },

    /// Failed to write the configuration file back to disk.
    Write {
        /// Path that could not be written.
        path: PathBuf,
        /// The underlying I/O error.
        source: std::io::Error,
    },
}

impl ConfigError {
    fn display_path(path: &Path) -> String {
        path_display(path)
    }
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigError::Read { path, source } => {
                write!(
                    f,
                    "Failed to read config at {}: {}",
                    Self::display_path(path),
                    source
                )
            }
            ConfigError::Parse { path, source } => {
                write!(
                    f,
                    "Failed to parse config at {}: {}",
                    Self::display_path(path),
                    source
                )
            }
            ConfigError::Write { path, source } => {
                write!(
                    f,
                    "Failed to write config at {}: {}",
                    Self::display_path(path),
                    source
                )
            }
        }
    }
}

impl StdError for ConfigError {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        match self {
            ConfigError::Read { source, .. } | ConfigError::Write { source, .. } => Some(source),
            ConfigError::Parse { source, .. } => Some(source),
        }
    }
}

impl Config {
    pub fn load() -> Result<Config, ConfigError> {
        Self::load_from_path(&default_config_path())
    }

    pub fn load_from_path(config_path: &Path) -> Result<Config, ConfigError> {
        if !config_path.exists() {
            return Ok(Config::default());
        }
        let contents = fs::read_to_string(config_path).map_err(|source| ConfigError::Read {
            path: config_path.to_path_buf(),
            source,
        })?;
        toml::from_str(&contents).map_err(|source| ConfigError::Parse {
            path: config_path.to_path_buf(),
            source,
        })
    }

    pub fn save(&self) -> Result<(), ConfigError> {
        self.save_to_path(&default_config_path())
    }

    /// Persists via a temp file in the target directory so the config is
    /// replaced atomically, never left half-written.
    pub fn save_to_path(&self, config_path: &Path) -> Result<(), ConfigError> {
        let write_error = |source| ConfigError::Write {
            path: config_path.to_path_buf(),
            source,
        };

        let parent = config_path.parent().unwrap_or_else(|| Path::new("."));
        fs::create_dir_all(parent).map_err(write_error)?;

        let contents = toml::to_string_pretty(self).map_err(|source| ConfigError::Write {
            path: config_path.to_path_buf(),
            source: std::io::Error::other(source),
        })?;

        let mut temp_file = NamedTempFile::new_in(parent).map_err(write_error)?;
        temp_file.write_all(contents.as_bytes()).map_err(write_error)?;
        temp_file.flush().map_err(write_error)?;
        temp_file
            .persist(config_path)
            .map_err(|err| write_error(err.error))?;
        Ok(())
    }
}

fn default_config_path() -> PathBuf {
    if let Some(proj_dirs) = ProjectDirs::from("org", "permacommons", "tandem") {
        proj_dirs.config_dir().join("config.toml")
    } else {
        PathBuf::from("tandem.toml")
    }
}
