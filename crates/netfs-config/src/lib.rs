pub mod manager;

pub use manager::ConfigManager;

use serde::Serialize;
use serde::de::DeserializeOwned;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("parse error: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("serialize error: {0}")]
    Serialize(#[from] toml::ser::Error),
    #[error("{field} out of range: {message}")]
    OutOfRange { field: &'static str, message: String },
    #[error("invalid config: {0}")]
    Invalid(String),
}

/// A TOML-backed configuration section.
///
/// `hot_update` copies over the fields that may change while the client
/// runs; everything else keeps its startup value.
pub trait Config: Sized + Send + Sync + 'static {
    fn from_toml(value: &toml::Value) -> Result<Self, ConfigError>
    where
        Self: DeserializeOwned,
    {
        Ok(value.clone().try_into()?)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        Ok(())
    }

    fn hot_update(&mut self, _other: &Self) {}

    fn to_toml_string(&self) -> Result<String, ConfigError>
    where
        Self: Serialize,
    {
        Ok(toml::to_string_pretty(self)?)
    }
}

/// Reject a zero value for a count or a port.
pub fn require_nonzero<T: Default + PartialEq + std::fmt::Display>(
    field: &'static str,
    value: T,
) -> Result<(), ConfigError> {
    if value == T::default() {
        return Err(ConfigError::OutOfRange {
            field,
            message: format!("must not be {}", value),
        });
    }
    Ok(())
}
