//! Persisted user preferences
//!
//! Only the yield-step quantum survives restarts. Stored values are kept raw
//! and normalized on load, so a hand-edited file cannot push an out-of-range
//! quantum into the engine.

use std::io;
use std::path::{Path, PathBuf};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

/// Errors reading or writing preferences
#[derive(Debug, Error)]
pub enum PreferencesError {
    /// Filesystem failure
    #[error("Failed to access preferences at {path}: {source}")]
    Io {
        /// Preferences file
        path: PathBuf,
        /// Underlying error
        #[source]
        source: io::Error,
    },

    /// The file is not valid TOML
    #[error("Failed to parse preferences: {0}")]
    Parse(#[from] toml::de::Error),

    /// The preferences could not be rendered
    #[error("Failed to serialize preferences: {0}")]
    Serialize(#[from] toml::ser::Error),
}

/// Stored preference values
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Preferences {
    /// Raw yield-step value as last saved
    #[serde(skip_serializing_if = "Option::is_none")]
    pub yield_steps: Option<f64>,
}

/// Where preferences live
pub trait PreferenceStore: Send + Sync {
    /// Read stored preferences (defaults if none were saved)
    ///
    /// # Errors
    ///
    /// Returns an error if stored data exists but cannot be read.
    fn load(&self) -> Result<Preferences, PreferencesError>;

    /// Replace stored preferences
    ///
    /// # Errors
    ///
    /// Returns an error if the preferences cannot be written.
    fn save(&self, preferences: &Preferences) -> Result<(), PreferencesError>;
}

// ============================================================================
// TOML file store
// ============================================================================

/// Preferences kept in a TOML file
#[derive(Debug, Clone)]
pub struct TomlPreferences {
    path: PathBuf,
}

impl TomlPreferences {
    /// Store preferences at `path`
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// The backing file
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn io_error(&self, source: io::Error) -> PreferencesError {
        PreferencesError::Io {
            path: self.path.clone(),
            source,
        }
    }
}

impl PreferenceStore for TomlPreferences {
    fn load(&self) -> Result<Preferences, PreferencesError> {
        let contents = match std::fs::read_to_string(&self.path) {
            Ok(contents) => contents,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                debug!(path = %self.path.display(), "No saved preferences");
                return Ok(Preferences::default());
            }
            Err(e) => return Err(self.io_error(e)),
        };
        Ok(toml::from_str(&contents)?)
    }

    fn save(&self, preferences: &Preferences) -> Result<(), PreferencesError> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| self.io_error(e))?;
        }
        let contents = toml::to_string(preferences)?;
        std::fs::write(&self.path, contents).map_err(|e| self.io_error(e))?;
        debug!(path = %self.path.display(), "Saved preferences");
        Ok(())
    }
}

// ============================================================================
// In-memory store
// ============================================================================

/// Preferences that live only as long as the process
#[derive(Debug, Default)]
pub struct MemoryPreferences {
    inner: Mutex<Preferences>,
}

impl MemoryPreferences {
    /// Start with the given values
    #[must_use]
    pub fn with(preferences: Preferences) -> Self {
        Self {
            inner: Mutex::new(preferences),
        }
    }
}

impl PreferenceStore for MemoryPreferences {
    fn load(&self) -> Result<Preferences, PreferencesError> {
        Ok(self.inner.lock().clone())
    }

    fn save(&self, preferences: &Preferences) -> Result<(), PreferencesError> {
        *self.inner.lock() = preferences.clone();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use tempfile::TempDir;

    use super::*;

    #[test]
    fn test_missing_file_loads_defaults() {
        let dir = TempDir::new().unwrap();
        let store = TomlPreferences::new(dir.path().join("preferences.toml"));
        assert_eq!(store.load().unwrap(), Preferences::default());
    }

    #[test]
    fn test_save_creates_parent_dirs() {
        let dir = TempDir::new().unwrap();
        let store = TomlPreferences::new(dir.path().join("nested/deeper/preferences.toml"));
        store
            .save(&Preferences {
                yield_steps: Some(2500.0),
            })
            .unwrap();
        assert_eq!(store.load().unwrap().yield_steps, Some(2500.0));
    }

    #[test]
    fn test_integer_values_load() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("preferences.toml");
        std::fs::write(&path, "yield_steps = 200000\n").unwrap();
        let store = TomlPreferences::new(&path);
        assert_eq!(store.load().unwrap().yield_steps, Some(200_000.0));
    }

    #[test]
    fn test_invalid_toml() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("preferences.toml");
        std::fs::write(&path, "yield_steps = [").unwrap();
        let store = TomlPreferences::new(&path);
        assert!(matches!(store.load(), Err(PreferencesError::Parse(_))));
    }

    #[test]
    fn test_memory_store() {
        let store = MemoryPreferences::default();
        assert_eq!(store.load().unwrap().yield_steps, None);
        store
            .save(&Preferences {
                yield_steps: Some(7.0),
            })
            .unwrap();
        assert_eq!(store.load().unwrap().yield_steps, Some(7.0));
    }
}
