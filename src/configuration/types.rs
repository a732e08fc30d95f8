use serde::{Deserialize, Serialize};
use std::path::PathBuf;

#[derive(Debug, PartialEq, Eq, Clone, Copy, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    #[default]
    Memory,
    File,
    Sqlite,
}

#[derive(Debug, PartialEq, Clone, Default, Serialize, Deserialize)]
pub struct BackendConfig {
    #[serde(default)]
    pub kind: BackendKind,
    /// Directory for `file`, database file for `sqlite`. When absent the backend
    /// picks its default location.
    #[serde(default)]
    pub path: Option<PathBuf>,
}
