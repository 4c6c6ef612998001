//! Backup storage contract.
//!
//! A backup lives in a named container filed under a keyspace/shard scope.
//! Containers hold numbered file slots plus one MANIFEST. Writing the
//! MANIFEST (`finalize`) is what makes a container visible to
//! `list_containers`; anything never finalized must stay hidden and must
//! still be removable.

pub mod file;
pub mod memory;

use crate::utils::errors::{EngineError, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};

pub use file::FileBackupStorage;
pub use memory::MemoryBackupStorage;

/// Name of the manifest object inside every container
pub const MANIFEST_NAME: &str = "MANIFEST";

pub type SlotWriter = Box<dyn AsyncWrite + Send + Unpin>;
pub type SlotReader = Box<dyn AsyncRead + Send + Unpin>;

/// Keyspace/shard pair that groups the backups of all replicas of a shard.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ScopeKey {
    pub keyspace: String,
    pub shard: String,
}

impl ScopeKey {
    pub fn new(keyspace: &str, shard: &str) -> Result<Self> {
        for part in [keyspace, shard] {
            if !is_safe_component(part) {
                return Err(EngineError::Config(format!(
                    "invalid keyspace/shard component: {:?}",
                    part
                )));
            }
        }
        Ok(Self {
            keyspace: keyspace.to_string(),
            shard: shard.to_string(),
        })
    }
}

impl fmt::Display for ScopeKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.keyspace, self.shard)
    }
}

impl FromStr for ScopeKey {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self> {
        match s.split_once('/') {
            Some((keyspace, shard)) => ScopeKey::new(keyspace, shard),
            None => Err(EngineError::Config(format!(
                "expected <keyspace>/<shard>, got {:?}",
                s
            ))),
        }
    }
}

/// Container name for a backup of `node_alias` taken at `at`.
///
/// Names sort lexically in time order, so the newest backup is the last one
/// listed.
pub fn container_name(at: DateTime<Utc>, node_alias: &str) -> String {
    format!("{}.{}", at.format("%Y-%m-%d.%H%M%S"), node_alias)
}

/// True if `name` can be used as a single path component.
pub(crate) fn is_safe_component(name: &str) -> bool {
    !name.is_empty()
        && name != "."
        && name != ".."
        && !name.contains('/')
        && !name.contains('\\')
        && !name.contains('\0')
}

/// Pluggable persistence backend for backup containers.
#[async_trait]
pub trait BackupStorage: Send + Sync {
    /// Create an empty container. Fails if `name` already exists.
    async fn create_container(&self, scope: &ScopeKey, name: &str) -> Result<Arc<dyn ContainerWriter>>;

    /// Finalized container names in `scope`, oldest first.
    async fn list_containers(&self, scope: &ScopeKey) -> Result<Vec<String>>;

    /// Delete a container, finalized or not.
    async fn remove_container(&self, scope: &ScopeKey, name: &str) -> Result<()>;

    /// Open a finalized container for reading.
    async fn open_container(&self, scope: &ScopeKey, name: &str) -> Result<Arc<dyn ContainerReader>>;
}

/// Write side of a container being built by a backup.
#[async_trait]
pub trait ContainerWriter: Send + Sync {
    fn name(&self) -> &str;

    /// Sink for slot `index`. The caller must `shutdown()` it once done.
    async fn write_slot(&self, index: usize) -> Result<SlotWriter>;

    /// Persist the manifest. After this returns the container is listable.
    async fn finalize(&self, manifest: &[u8]) -> Result<()>;
}

/// Read side of a finalized container.
#[async_trait]
pub trait ContainerReader: Send + Sync {
    fn name(&self) -> &str;

    async fn read_slot(&self, index: usize) -> Result<SlotReader>;

    async fn read_manifest(&self) -> Result<Vec<u8>>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_scope_key_parse() {
        let scope: ScopeKey = "test_keyspace/0".parse().unwrap();
        assert_eq!(scope.keyspace, "test_keyspace");
        assert_eq!(scope.shard, "0");
        assert_eq!(scope.to_string(), "test_keyspace/0");

        assert!("no-shard".parse::<ScopeKey>().is_err());
        assert!("ks/../etc".parse::<ScopeKey>().is_err());
        assert!("../0".parse::<ScopeKey>().is_err());
    }

    #[test]
    fn test_container_names_sort_by_time() {
        let early = Utc.with_ymd_and_hms(2026, 1, 2, 3, 4, 5).unwrap();
        let late = Utc.with_ymd_and_hms(2026, 11, 2, 3, 4, 5).unwrap();

        let a = container_name(early, "zone1-0000000101");
        let b = container_name(late, "zone1-0000000100");
        assert_eq!(a, "2026-01-02.030405.zone1-0000000101");
        assert!(a < b);
    }
}
