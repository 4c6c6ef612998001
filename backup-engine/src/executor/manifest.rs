//! Backup MANIFEST.
//!
//! The MANIFEST is the last object written to a container and the only
//! record of how the backup was produced. Restores rebuild the inverse
//! pipeline from `TransformHook` and `SkipCompress` alone.
//!
//! ```json
//! {"TransformHook": "test_backup_transform", "SkipCompress": true,
//!  "FileEntries": [{"Name": "ibdata1", "Size": 12582912, "Hash": "…"}]}
//! ```

use crate::node::RESTORE_MARKER;
use crate::utils::errors::{EngineError, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::{Component, Path};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct Manifest {
    /// Hook the files were encoded with ("" for none)
    #[serde(default)]
    pub transform_hook: String,

    /// True when the built-in compression stage did not run
    #[serde(default)]
    pub skip_compress: bool,

    /// Slot `i` holds the bytes of `file_entries[i]`
    #[serde(default)]
    pub file_entries: Vec<FileEntry>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub backup_time: Option<DateTime<Utc>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node_alias: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct FileEntry {
    /// Path relative to the data directory
    pub name: String,

    /// Size of the original (untransformed) file
    pub size: u64,

    /// Hex SHA-256 of the original bytes
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hash: Option<String>,
}

impl Manifest {
    pub fn to_json(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec_pretty(self)?)
    }

    /// Parse and validate MANIFEST bytes read back from storage.
    pub fn from_json(bytes: &[u8]) -> Result<Self> {
        let manifest: Manifest = serde_json::from_slice(bytes)
            .map_err(|e| EngineError::ManifestInvalid(e.to_string()))?;
        manifest.validate()?;
        Ok(manifest)
    }

    pub fn total_size(&self) -> u64 {
        self.file_entries.iter().map(|e| e.size).sum()
    }

    /// Entry names must be unique relative paths that stay inside the data
    /// directory and never name the restore marker.
    pub fn validate(&self) -> Result<()> {
        let mut seen = HashSet::new();
        for entry in &self.file_entries {
            if !is_contained(&entry.name) {
                return Err(EngineError::ManifestInvalid(format!(
                    "file entry escapes the data directory: {:?}",
                    entry.name
                )));
            }
            if Path::new(&entry.name)
                .components()
                .any(|c| c.as_os_str() == RESTORE_MARKER)
            {
                return Err(EngineError::ManifestInvalid(format!(
                    "file entry names the restore marker: {:?}",
                    entry.name
                )));
            }
            if !seen.insert(entry.name.as_str()) {
                return Err(EngineError::ManifestInvalid(format!(
                    "duplicate file entry: {:?}",
                    entry.name
                )));
            }
        }
        Ok(())
    }
}

fn is_contained(name: &str) -> bool {
    !name.is_empty()
        && Path::new(name)
            .components()
            .all(|c| matches!(c, Component::Normal(_)))
}
