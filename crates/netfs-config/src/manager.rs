use std::path::{Path, PathBuf};
use std::sync::Arc;

use arc_swap::ArcSwap;
use serde::de::DeserializeOwned;

use crate::{Config, ConfigError};

/// Holds the live configuration; readers never block a reload.
pub struct ConfigManager<T: Config> {
    config: ArcSwap<T>,
    path: Option<PathBuf>,
}

fn parse_file<T: Config + DeserializeOwned>(path: &Path) -> Result<T, ConfigError> {
    let content = std::fs::read_to_string(path)?;
    let value: toml::Value = toml::from_str(&content)?;
    let config = T::from_toml(&value)?;
    config.validate()?;
    Ok(config)
}

impl<T: Config> ConfigManager<T> {
    pub fn new(config: T) -> Self {
        Self {
            config: ArcSwap::from_pointee(config),
            path: None,
        }
    }

    pub fn get(&self) -> arc_swap::Guard<Arc<T>> {
        self.config.load()
    }

    pub fn get_full(&self) -> Arc<T> {
        self.config.load_full()
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    pub fn update(&self, new_config: T) -> Result<(), ConfigError> {
        new_config.validate()?;
        self.config.store(Arc::new(new_config));
        Ok(())
    }
}

impl<T: Config + DeserializeOwned> ConfigManager<T> {
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let config = parse_file(path)?;
        tracing::info!(path = %path.display(), "config loaded");
        Ok(Self {
            config: ArcSwap::from_pointee(config),
            path: Some(path.to_path_buf()),
        })
    }
}

impl<T: Config + DeserializeOwned + Clone> ConfigManager<T> {
    /// Re-read the backing file and apply its hot-updatable fields.
    /// A manager built with `new` has no file and keeps its config.
    pub fn reload(&self) -> Result<(), ConfigError> {
        let Some(path) = &self.path else {
            return Ok(());
        };
        let fresh: T = parse_file(path)?;
        let mut current = (*self.config.load_full()).clone();
        current.hot_update(&fresh);
        current.validate()?;
        self.config.store(Arc::new(current));
        tracing::info!(path = %path.display(), "config reloaded");
        Ok(())
    }

    pub fn snapshot(&self) -> T {
        (*self.config.load_full()).clone()
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use serde::{Deserialize, Serialize};

    use super::*;

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Sample {
        port: u16,
        verbose: bool,
    }

    impl Config for Sample {
        fn validate(&self) -> Result<(), ConfigError> {
            crate::require_nonzero("port", self.port)
        }

        fn hot_update(&mut self, other: &Self) {
            self.verbose = other.verbose;
        }
    }

    fn write_file(file: &mut tempfile::NamedTempFile, text: &str) {
        let f = file.as_file_mut();
        f.set_len(0).unwrap();
        std::io::Seek::rewind(f).unwrap();
        f.write_all(text.as_bytes()).unwrap();
        f.flush().unwrap();
    }

    #[test]
    fn test_load_and_get() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write_file(&mut file, "port = 55555\nverbose = false\n");
        let mgr = ConfigManager::<Sample>::load(file.path()).unwrap();
        assert_eq!(mgr.get().port, 55555);
        assert_eq!(mgr.path(), Some(file.path()));
    }

    #[test]
    fn test_load_rejects_invalid() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write_file(&mut file, "port = 0\nverbose = false\n");
        let err = ConfigManager::<Sample>::load(file.path()).err().unwrap();
        assert!(matches!(err, ConfigError::OutOfRange { field: "port", .. }));
    }

    #[test]
    fn test_reload_only_applies_hot_fields() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write_file(&mut file, "port = 1000\nverbose = false\n");
        let mgr = ConfigManager::<Sample>::load(file.path()).unwrap();

        write_file(&mut file, "port = 2000\nverbose = true\n");
        mgr.reload().unwrap();
        let snap = mgr.snapshot();
        assert_eq!(snap.port, 1000);
        assert!(snap.verbose);
    }

    #[test]
    fn test_update_validates() {
        let mgr = ConfigManager::new(Sample {
            port: 1,
            verbose: false,
        });
        assert!(mgr
            .update(Sample {
                port: 0,
                verbose: true
            })
            .is_err());
        assert_eq!(mgr.get().port, 1);
        mgr.reload().unwrap();
    }

    #[test]
    fn test_to_toml_string() {
        let text = Sample {
            port: 7,
            verbose: true,
        }
        .to_toml_string()
        .unwrap();
        assert!(text.contains("port = 7"));
    }
}
