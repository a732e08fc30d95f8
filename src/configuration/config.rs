use super::types::*;
use crate::error_handling::types::ConfigError;
use log::debug;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

/// Session store configuration.
///
/// One value is handed to every coordinator/store constructor; nothing is read
/// from process-wide state, so several independently configured stores can live
/// in the same process.
///
/// # Examples
///
/// ```
/// use alveole::configuration::StoreConfig;
///
/// let config = StoreConfig::from_toml_str(r#"
///     application_scope = "/shop"
///     timeout_minutes = 30
///
///     [backend]
///     kind = "sqlite"
///     path = "/var/lib/alveole/sessions.sqlite3"
/// "#).unwrap();
/// assert_eq!(config.timeout_minutes, 30);
/// ```
///
/// # Fields Overview
///
/// - `application_scope`: partition key isolating this application's sessions
/// - `timeout_minutes`: sliding session lifetime applied on reset and on new data
/// - `write_exceptions_to_log`: log every failed store operation at error level
/// - `verify_token_on_commit`: require the lock token to still match when saving
/// - `backend`: which `SessionBackend` to open and where
#[derive(Debug, PartialEq, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    pub application_scope: String,

    #[serde(default = "default_timeout_minutes")]
    pub timeout_minutes: u32,

    #[serde(default)]
    pub write_exceptions_to_log: bool,

    /// Off by default: a save trusts the token validated when the lock was taken.
    #[serde(default)]
    pub verify_token_on_commit: bool,

    #[serde(default)]
    pub backend: BackendConfig,
}

/// Twenty minutes, the usual web session lifetime.
fn default_timeout_minutes() -> u32 {
    20
}

impl StoreConfig {
    pub const MAX_TIMEOUT_MINUTES: u32 = 525_600;

    pub fn new<S: Into<String>>(application_scope: S, timeout_minutes: u32) -> Self {
        Self {
            application_scope: application_scope.into(),
            timeout_minutes,
            write_exceptions_to_log: false,
            verify_token_on_commit: false,
            backend: BackendConfig::default(),
        }
    }

    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = fs::read_to_string(path)?;
        debug!("Read configuration from {}", path.display());
        Self::from_toml_str(&content)
    }

    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        let config: StoreConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.application_scope.trim().is_empty() {
            return Err(ConfigError::ScopeEmpty(
                "application_scope must not be empty".to_string(),
            ));
        }
        if self.timeout_minutes == 0 || self.timeout_minutes > Self::MAX_TIMEOUT_MINUTES {
            return Err(ConfigError::NotInRange(format!(
                "timeout_minutes must be within 1..={}, got {}",
                Self::MAX_TIMEOUT_MINUTES,
                self.timeout_minutes
            )));
        }
        if let Some(path) = &self.backend.path {
            if self.backend.kind == BackendKind::Memory {
                return Err(ConfigError::MissingPath(format!(
                    "memory backend does not take a path, got {}",
                    path.display()
                )));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use std::path::PathBuf;
    use tempfile::NamedTempFile;

    #[test]
    fn test_from_toml_str_full() {
        let config = StoreConfig::from_toml_str(
            r#"
            application_scope = "/shop"
            timeout_minutes = 45
            write_exceptions_to_log = true
            verify_token_on_commit = true

            [backend]
            kind = "file"
            path = "/tmp/alveole"
            "#,
        )
        .unwrap_or_else(|e| panic!("{}", e));

        assert_eq!(config.application_scope, "/shop");
        assert_eq!(config.timeout_minutes, 45);
        assert!(config.write_exceptions_to_log);
        assert!(config.verify_token_on_commit);
        assert_eq!(config.backend.kind, BackendKind::File);
        assert_eq!(config.backend.path, Some(PathBuf::from("/tmp/alveole")));
    }

    #[test]
    fn test_defaults() {
        let config = StoreConfig::from_toml_str(r#"application_scope = "app1""#).unwrap();
        assert_eq!(config, StoreConfig::new("app1", 20));
        assert_eq!(config.backend.kind, BackendKind::Memory);
    }

    #[test]
    fn test_validation_errors() {
        assert!(matches!(
            StoreConfig::from_toml_str(r#"application_scope = "  ""#),
            Err(ConfigError::ScopeEmpty(_))
        ));
        assert!(matches!(
            StoreConfig::from_toml_str("application_scope = \"a\"\ntimeout_minutes = 0"),
            Err(ConfigError::NotInRange(_))
        ));
        assert!(matches!(
            StoreConfig::from_toml_str("application_scope = \"a\"\n[backend]\npath = \"/tmp/x\""),
            Err(ConfigError::MissingPath(_))
        ));
        assert!(matches!(
            StoreConfig::from_toml_str("application_scope = "),
            Err(ConfigError::TomlError(_))
        ));
    }

    #[test]
    fn test_from_file() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(file, "application_scope = \"app1\"\n[backend]\nkind = \"sqlite\"").unwrap();
        let config = StoreConfig::from_file(file.path()).unwrap();
        assert_eq!(config.backend.kind, BackendKind::Sqlite);
        assert!(config.backend.path.is_none());

        let missing = StoreConfig::from_file(Path::new("/nonexistent/alveole.toml"));
        assert!(matches!(missing, Err(ConfigError::IoError(_))));
    }
}
