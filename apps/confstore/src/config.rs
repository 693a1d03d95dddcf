//! # Configuration
//!
//! Optional TOML settings file plus the schema-definition file it points at.
//!
//! ```toml
//! database = "confstore.redb"
//! backend = "redb"            # or "memory"
//! schemas = "schemas.toml"
//! log_format = "json"         # or "text"
//! ```
//!
//! Command-line flags win over file values; file values win over defaults.

use confstore_core::{ConfstoreError, Schema};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Settings file looked up in the working directory when `--config` is absent.
pub const DEFAULT_CONFIG_FILE: &str = "confstore.toml";

/// Database path used when neither flag nor file names one.
pub const DEFAULT_DATABASE: &str = "confstore.redb";

/// Maximum size of a settings, schema or bean input file (16 MB).
pub const MAX_INPUT_FILE_SIZE: u64 = 16 * 1024 * 1024;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum Backend {
    /// Persistent redb database file
    #[default]
    Redb,
    /// Process-local store, discarded on exit
    Memory,
}

impl std::fmt::Display for Backend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Redb => write!(f, "redb"),
            Self::Memory => write!(f, "memory"),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

/// Contents of the settings file. Every key is optional.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AppConfig {
    pub database: Option<PathBuf>,
    pub backend: Option<Backend>,
    pub schemas: Option<PathBuf>,
    pub log_format: Option<LogFormat>,
}

impl AppConfig {
    pub fn from_toml_str(text: &str) -> Result<Self, ConfstoreError> {
        toml::from_str(text)
            .map_err(|e| ConfstoreError::InvalidData(format!("Invalid settings file: {}", e)))
    }

    /// Read a settings file. Relative paths inside it are taken relative to
    /// the file's directory.
    pub fn load(path: &Path) -> Result<Self, ConfstoreError> {
        let text = read_input(path)?;
        let mut config = Self::from_toml_str(&text)?;
        if let Some(base) = path.parent() {
            config.database = config.database.map(|p| rebase(base, p));
            config.schemas = config.schemas.map(|p| rebase(base, p));
        }
        Ok(config)
    }

    /// Load `explicit` if given, else the default file if it exists, else
    /// an empty configuration.
    pub fn discover(explicit: Option<&Path>) -> Result<Self, ConfstoreError> {
        match explicit {
            Some(path) => Self::load(path),
            None => {
                let default = Path::new(DEFAULT_CONFIG_FILE);
                if default.is_file() {
                    Self::load(default)
                } else {
                    Ok(Self::default())
                }
            }
        }
    }
}

fn rebase(base: &Path, path: PathBuf) -> PathBuf {
    if path.is_relative() && !base.as_os_str().is_empty() {
        base.join(path)
    } else {
        path
    }
}

/// Effective settings after merging flags over the file.
#[derive(Debug, Clone, PartialEq)]
pub struct Settings {
    pub database: PathBuf,
    pub backend: Backend,
    pub schemas: Option<PathBuf>,
    pub log_format: LogFormat,
}

impl Settings {
    pub fn resolve(
        file: AppConfig,
        database: Option<PathBuf>,
        backend: Option<Backend>,
        schemas: Option<PathBuf>,
    ) -> Self {
        Self {
            database: database
                .or(file.database)
                .unwrap_or_else(|| PathBuf::from(DEFAULT_DATABASE)),
            backend: backend.or(file.backend).unwrap_or_default(),
            schemas: schemas.or(file.schemas),
            log_format: file.log_format.unwrap_or_default(),
        }
    }
}

// =============================================================================
// SCHEMA FILES
// =============================================================================

/// A schema-definition file: a list of `[[schema]]` tables.
///
/// ```toml
/// [[schema]]
/// name = "Server"
///
/// [[schema.property]]
/// name = "host"
/// kind = "scalar"
/// value_type = "string"
/// indexed = true
/// ```
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SchemaFile {
    #[serde(default)]
    pub schema: Vec<Schema>,
}

impl SchemaFile {
    pub fn from_toml_str(text: &str) -> Result<Self, ConfstoreError> {
        toml::from_str(text)
            .map_err(|e| ConfstoreError::InvalidData(format!("Invalid schema file: {}", e)))
    }

    pub fn load(path: &Path) -> Result<Self, ConfstoreError> {
        Self::from_toml_str(&read_input(path)?)
    }
}

/// Read a text input file after checking that it is a regular file of
/// bounded size.
pub fn read_input(path: &Path) -> Result<String, ConfstoreError> {
    let metadata = std::fs::metadata(path).map_err(|e| {
        ConfstoreError::Storage(format!("Cannot read '{}': {}", path.display(), e))
    })?;
    if !metadata.is_file() {
        return Err(ConfstoreError::Storage(format!(
            "Path '{}' is not a regular file",
            path.display()
        )));
    }
    if metadata.len() > MAX_INPUT_FILE_SIZE {
        return Err(ConfstoreError::InvalidData(format!(
            "File size {} bytes exceeds maximum allowed {} bytes",
            metadata.len(),
            MAX_INPUT_FILE_SIZE
        )));
    }
    std::fs::read_to_string(path)
        .map_err(|e| ConfstoreError::Storage(format!("Read '{}': {}", path.display(), e)))
}
