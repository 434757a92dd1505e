//! Provider configuration loading.

use std::path::{Path, PathBuf};

use figment::Figment;
use figment::providers::{Env, Format, Serialized, Toml};
use ocm_core::{BackendKind, StoreError};
use serde::{Deserialize, Serialize};

/// File name of the `OpenCode` database inside the data root.
pub const DATABASE_FILE_NAME: &str = "opencode.db";

/// Which backend to open and where its data lives.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProviderConfig {
    pub backend: BackendKind,
    /// Metadata root containing `storage/` (JSONL backend).
    pub root: PathBuf,
    /// Database file (`SQLite` backend).
    pub database_path: PathBuf,
    /// Raise on malformed stored data instead of skipping it.
    pub strict: bool,
    /// Wait for other writers' locks instead of failing immediately.
    pub force_write: bool,
}

impl Default for ProviderConfig {
    fn default() -> Self {
        let root = opencode_data_path().unwrap_or_else(|| PathBuf::from("."));
        Self {
            backend: BackendKind::default(),
            database_path: root.join(DATABASE_FILE_NAME),
            root,
            strict: false,
            force_write: false,
        }
    }
}

impl ProviderConfig {
    /// Loads configuration from default locations.
    pub fn load() -> Result<Self, StoreError> {
        Self::load_from(None)
    }

    /// Loads configuration, optionally from a specific file.
    ///
    /// Later sources win: defaults, `<config_dir>/ocm/config.toml`, the given
    /// file, then `OCM_*` environment variables.
    pub fn load_from(config_path: Option<&Path>) -> Result<Self, StoreError> {
        let mut figment = Figment::from(Serialized::defaults(Self::default()));

        if let Some(config_dir) = dirs_config_path() {
            figment = figment.merge(Toml::file(config_dir.join("config.toml")));
        }

        if let Some(path) = config_path {
            figment = figment.merge(Toml::file(path));
        }

        figment = figment.merge(Env::prefixed("OCM_"));

        Self::from_figment(&figment)
    }

    /// Extracts a configuration; any failure, including an unknown backend
    /// name, is a [`StoreError::Config`].
    pub fn from_figment(figment: &Figment) -> Result<Self, StoreError> {
        figment
            .extract()
            .map_err(|err| StoreError::Config(err.to_string()))
    }

    /// JSONL configuration rooted at `root`.
    pub fn jsonl(root: impl Into<PathBuf>) -> Self {
        Self {
            backend: BackendKind::Jsonl,
            root: root.into(),
            ..Self::default()
        }
    }

    /// `SQLite` configuration for the database at `path`.
    pub fn sqlite(path: impl Into<PathBuf>) -> Self {
        Self {
            backend: BackendKind::Sqlite,
            database_path: path.into(),
            ..Self::default()
        }
    }

    #[must_use]
    pub fn with_strict(mut self, strict: bool) -> Self {
        self.strict = strict;
        self
    }

    #[must_use]
    pub fn with_force_write(mut self, force_write: bool) -> Self {
        self.force_write = force_write;
        self
    }
}

/// Returns the platform-specific config directory for ocm.
fn dirs_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|p| p.join("ocm"))
}

/// Returns the directory `OpenCode` keeps its metadata in.
///
/// On Linux: `~/.local/share/opencode`
pub fn opencode_data_path() -> Option<PathBuf> {
    dirs::data_dir().map(|p| p.join("opencode"))
}
