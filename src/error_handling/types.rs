use std::fmt;

#[derive(Debug)]
pub enum ConfigError {
    IoError(std::io::Error),
    TomlError(String),
    ScopeEmpty(String),
    NotInRange(String),
    MissingPath(String),
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigError::IoError(e) => write!(f, "IO error: {}", e),
            ConfigError::TomlError(e) => write!(f, "TOML parsing error: {}", e),
            ConfigError::ScopeEmpty(e) => write!(f, "Application scope error: {}", e),
            ConfigError::NotInRange(e) => write!(f, "Value out of range: {}", e),
            ConfigError::MissingPath(e) => write!(f, "Backend path error: {}", e),
        }
    }
}

impl std::error::Error for ConfigError {}

impl From<std::io::Error> for ConfigError {
    fn from(err: std::io::Error) -> Self {
        ConfigError::IoError(err)
    }
}

impl From<toml::de::Error> for ConfigError {
    fn from(err: toml::de::Error) -> Self {
        ConfigError::TomlError(err.to_string())
    }
}

/// Failures reported by a [`SessionBackend`](crate::storage::storage_trait::SessionBackend).
///
/// `NotFound`, `AlreadyExists` and `Conflict` are the expected negative answers of the
/// backend contract; the remaining variants mean the store itself misbehaved.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StorageError {
    ConnectionFailed,
    WriteFailed,
    ReadFailed,
    NotFound,
    AlreadyExists,
    Conflict,
}

impl StorageError {
    /// True for infrastructure failures, as opposed to contract answers.
    pub fn is_unavailable(&self) -> bool {
        matches!(
            self,
            StorageError::ConnectionFailed | StorageError::WriteFailed | StorageError::ReadFailed
        )
    }
}

impl fmt::Display for StorageError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StorageError::ConnectionFailed => write!(f, "Storage connection failed"),
            StorageError::WriteFailed => write!(f, "Storage write failed"),
            StorageError::ReadFailed => write!(f, "Storage read failed"),
            StorageError::NotFound => write!(f, "Session record not found"),
            StorageError::AlreadyExists => write!(f, "Session record already exists"),
            StorageError::Conflict => write!(f, "Session record changed concurrently"),
        }
    }
}

impl std::error::Error for StorageError {}

#[derive(Debug)]
pub enum SessionError {
    NotFound,
    AlreadyExists,
    /// The presented fencing token is not the one currently stored.
    TokenMismatch { presented: Option<i64>, current: i64 },
    Storage(StorageError),
    Serialization(String),
}

impl fmt::Display for SessionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionError::NotFound => write!(f, "Session not found"),
            SessionError::AlreadyExists => write!(f, "Session already exists"),
            SessionError::TokenMismatch { presented: Some(token), current } => write!(
                f,
                "Lock token mismatch: presented {} but current lock id is {}",
                token, current
            ),
            SessionError::TokenMismatch { presented: None, current } => {
                write!(f, "Lock token required: current lock id is {}", current)
            }
            SessionError::Storage(e) => write!(f, "Storage error: {}", e),
            SessionError::Serialization(e) => write!(f, "Session items serialization error: {}", e),
        }
    }
}

impl std::error::Error for SessionError {}

impl From<StorageError> for SessionError {
    fn from(err: StorageError) -> Self {
        match err {
            StorageError::NotFound => SessionError::NotFound,
            StorageError::AlreadyExists => SessionError::AlreadyExists,
            other => SessionError::Storage(other),
        }
    }
}

impl From<serde_json::Error> for SessionError {
    fn from(err: serde_json::Error) -> Self {
        SessionError::Serialization(err.to_string())
    }
}
