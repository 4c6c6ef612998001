//! Configuration management for the backup engine.
//!
//! Loads configuration from a TOML file with environment variable overrides.
//! The transform hook and compression toggle only drive backups; restores take
//! both from the MANIFEST of the backup being restored.

use crate::storage::ScopeKey;
use crate::utils::errors::{EngineError, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub node: NodeConfig,
    #[serde(default)]
    pub backup: BackupConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub log: LogConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeConfig {
    /// Node identity, part of every container name
    pub alias: String,

    pub keyspace: String,

    pub shard: String,

    /// Directory holding the node's on-disk data files
    pub data_dir: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackupConfig {
    /// Name of the external transform hook (empty = no transform)
    #[serde(default)]
    pub hook: String,

    /// Directory the hook executables live in
    #[serde(default = "default_hooks_dir")]
    pub hooks_dir: PathBuf,

    /// Run the built-in zstd stage after the hook
    #[serde(default = "default_compress")]
    pub compress: bool,

    /// Compression level (1-22 for zstd)
    #[serde(default = "default_compression_level")]
    pub compression_level: i32,

    /// Maximum files transformed and uploaded at once
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Storage backend (file)
    #[serde(default = "default_backend")]
    pub backend: String,

    /// Root directory of the file backend
    #[serde(default = "default_storage_root")]
    pub root: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,
}

// Default values
fn default_hooks_dir() -> PathBuf {
    PathBuf::from("/var/lib/backup-engine/hooks")
}

fn default_compress() -> bool {
    true
}

fn default_compression_level() -> i32 {
    3
}

fn default_concurrency() -> usize {
    4
}

fn default_backend() -> String {
    "file".to_string()
}

fn default_storage_root() -> PathBuf {
    PathBuf::from("/var/lib/backup-engine/backups")
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for BackupConfig {
    fn default() -> Self {
        Self {
            hook: String::new(),
            hooks_dir: default_hooks_dir(),
            compress: default_compress(),
            compression_level: default_compression_level(),
            concurrency: default_concurrency(),
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            backend: default_backend(),
            root: default_storage_root(),
        }
    }
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Config {
            node: NodeConfig {
                alias: hostname::get()
                    .ok()
                    .and_then(|h| h.into_string().ok())
                    .unwrap_or_else(|| "node-01".to_string()),
                keyspace: "default".to_string(),
                shard: "0".to_string(),
                data_dir: PathBuf::from("/var/lib/backup-engine/data"),
            },
            backup: BackupConfig::default(),
            storage: StorageConfig::default(),
            log: LogConfig::default(),
        }
    }
}

impl Config {
    /// Load configuration from a TOML file
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        toml::from_str(&content)
            .map_err(|e| EngineError::Config(format!("{}: {}", path.display(), e)))
    }

    /// Load from `path` (or defaults), then apply `.env` and environment overrides.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let _ = dotenvy::dotenv();

        let mut config = match path {
            Some(path) => Self::from_file(path)?,
            None => Self::default(),
        };
        config.apply_overrides(|key| std::env::var(key).ok())?;
        config.validate()?;
        Ok(config)
    }

    /// Apply overrides from a key lookup (the process environment in production).
    pub fn apply_overrides<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(v) = lookup("BACKUP_NODE_ALIAS") {
            self.node.alias = v;
        }
        if let Some(v) = lookup("BACKUP_KEYSPACE") {
            self.node.keyspace = v;
        }
        if let Some(v) = lookup("BACKUP_SHARD") {
            self.node.shard = v;
        }
        if let Some(v) = lookup("BACKUP_DATA_DIR") {
            self.node.data_dir = PathBuf::from(v);
        }
        if let Some(v) = lookup("BACKUP_STORAGE_HOOK") {
            self.backup.hook = v;
        }
        if let Some(v) = lookup("BACKUP_HOOKS_DIR") {
            self.backup.hooks_dir = PathBuf::from(v);
        }
        if let Some(v) = lookup("BACKUP_STORAGE_COMPRESS") {
            self.backup.compress = parse_bool("BACKUP_STORAGE_COMPRESS", &v)?;
        }
        if let Some(v) = lookup("BACKUP_CONCURRENCY") {
            self.backup.concurrency = v.parse().map_err(|_| {
                EngineError::Config(format!("BACKUP_CONCURRENCY must be a number, got {:?}", v))
            })?;
        }
        if let Some(v) = lookup("BACKUP_STORAGE_BACKEND") {
            self.storage.backend = v;
        }
        if let Some(v) = lookup("BACKUP_STORAGE_ROOT") {
            self.storage.root = PathBuf::from(v);
        }
        if let Some(v) = lookup("LOG_LEVEL") {
            self.log.level = v;
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        if self.node.alias.is_empty() {
            return Err(EngineError::Config("node.alias must not be empty".into()));
        }
        if self.backup.concurrency == 0 {
            return Err(EngineError::Config("backup.concurrency must be at least 1".into()));
        }
        match self.storage.backend.as_str() {
            "file" => {}
            other => {
                return Err(EngineError::Config(format!("unknown storage backend: {}", other)));
            }
        }
        self.scope()?;
        Ok(())
    }

    /// Keyspace/shard the node's backups are filed under
    pub fn scope(&self) -> Result<ScopeKey> {
        ScopeKey::new(&self.node.keyspace, &self.node.shard)
    }
}

fn parse_bool(key: &str, value: &str) -> Result<bool> {
    match value.to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(EngineError::Config(format!("{} must be a boolean, got {:?}", key, value))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_parse_minimal_toml() {
        let config: Config = toml::from_str(
            r#"
            [node]
            alias = "zone1-0000000101"
            keyspace = "test_keyspace"
            shard = "0"
            data_dir = "/data/vt_0000000101"

            [backup]
            hook = "test_backup_transform"
            compress = false
            "#,
        )
        .unwrap();

        assert_eq!(config.backup.hook, "test_backup_transform");
        assert!(!config.backup.compress);
        assert_eq!(config.backup.concurrency, 4);
        assert_eq!(config.storage.backend, "file");
        assert_eq!(config.log.level, "info");
        assert_eq!(config.scope().unwrap().to_string(), "test_keyspace/0");
    }

    #[test]
    fn test_env_overrides() {
        let env: HashMap<&str, &str> = [
            ("BACKUP_STORAGE_HOOK", "test_backup_error"),
            ("BACKUP_STORAGE_COMPRESS", "false"),
            ("BACKUP_CONCURRENCY", "2"),
        ]
        .into_iter()
        .collect();

        let mut config = Config::default();
        config
            .apply_overrides(|k| env.get(k).map(|v| v.to_string()))
            .unwrap();

        assert_eq!(config.backup.hook, "test_backup_error");
        assert!(!config.backup.compress);
        assert_eq!(config.backup.concurrency, 2);
    }

    #[test]
    fn test_bad_override_rejected() {
        let mut config = Config::default();
        let err = config
            .apply_overrides(|k| (k == "BACKUP_STORAGE_COMPRESS").then(|| "maybe".to_string()))
            .unwrap_err();
        assert!(matches!(err, EngineError::Config(_)));
    }

    #[test]
    fn test_validate() {
        let mut config = Config::default();
        config.node.alias = "zone1-100".into();
        assert!(config.validate().is_ok());

        config.storage.backend = "s3".into();
        assert!(config.validate().is_err());

        config.storage.backend = "file".into();
        config.backup.concurrency = 0;
        assert!(config.validate().is_err());
    }
}
