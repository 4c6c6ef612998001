//! Directory-tree backup storage.
//!
//! Layout: `<root>/<keyspace>/<shard>/<container>/{0,1,...,MANIFEST}`.

use super::{
    is_safe_component, BackupStorage, ContainerReader, ContainerWriter, ScopeKey, SlotReader,
    SlotWriter, MANIFEST_NAME,
};
use crate::utils::errors::{EngineError, Result};
use async_trait::async_trait;
use std::io::ErrorKind;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info};

pub struct FileBackupStorage {
    root: PathBuf,
}

impl FileBackupStorage {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn scope_dir(&self, scope: &ScopeKey) -> PathBuf {
        self.root.join(&scope.keyspace).join(&scope.shard)
    }

    fn container_dir(&self, scope: &ScopeKey, name: &str) -> Result<PathBuf> {
        if !is_safe_component(name) {
            return Err(EngineError::storage("resolve container", format!("invalid name {:?}", name)));
        }
        Ok(self.scope_dir(scope).join(name))
    }
}

#[async_trait]
impl BackupStorage for FileBackupStorage {
    async fn create_container(&self, scope: &ScopeKey, name: &str) -> Result<Arc<dyn ContainerWriter>> {
        let dir = self.container_dir(scope, name)?;
        tokio::fs::create_dir_all(self.scope_dir(scope))
            .await
            .map_err(|e| EngineError::storage("create scope directory", e))?;
        // create_dir (not _all) so two writers can never share a container
        tokio::fs::create_dir(&dir)
            .await
            .map_err(|e| EngineError::storage(&format!("create container {}", name), e))?;

        debug!(container = %dir.display(), "Created backup container");
        Ok(Arc::new(FileContainer {
            name: name.to_string(),
            dir,
        }))
    }

    async fn list_containers(&self, scope: &ScopeKey) -> Result<Vec<String>> {
        let dir = self.scope_dir(scope);
        let mut entries = match tokio::fs::read_dir(&dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(EngineError::storage("list containers", e)),
        };

        let mut names = Vec::new();
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| EngineError::storage("list containers", e))?
        {
            let is_dir = entry
                .file_type()
                .await
                .map(|t| t.is_dir())
                .unwrap_or(false);
            if !is_dir {
                continue;
            }
            // Unfinalized containers have no MANIFEST yet
            if tokio::fs::metadata(entry.path().join(MANIFEST_NAME)).await.is_ok() {
                names.push(entry.file_name().to_string_lossy().to_string());
            }
        }

        names.sort();
        Ok(names)
    }

    async fn remove_container(&self, scope: &ScopeKey, name: &str) -> Result<()> {
        let dir = self.container_dir(scope, name)?;
        match tokio::fs::remove_dir_all(&dir).await {
            Ok(()) => {
                info!(scope = %scope, container = %name, "Removed backup container");
                Ok(())
            }
            Err(e) if e.kind() == ErrorKind::NotFound => Err(EngineError::BackupNotFound {
                scope: scope.to_string(),
                name: name.to_string(),
            }),
            Err(e) => Err(EngineError::storage(&format!("remove container {}", name), e)),
        }
    }

    async fn open_container(&self, scope: &ScopeKey, name: &str) -> Result<Arc<dyn ContainerReader>> {
        let dir = self.container_dir(scope, name)?;
        if tokio::fs::metadata(&dir).await.is_err() {
            return Err(EngineError::BackupNotFound {
                scope: scope.to_string(),
                name: name.to_string(),
            });
        }
        Ok(Arc::new(FileContainer {
            name: name.to_string(),
            dir,
        }))
    }
}

struct FileContainer {
    name: String,
    dir: PathBuf,
}

#[async_trait]
impl ContainerWriter for FileContainer {
    fn name(&self) -> &str {
        &self.name
    }

    async fn write_slot(&self, index: usize) -> Result<SlotWriter> {
        let path = self.dir.join(index.to_string());
        let file = tokio::fs::File::create(&path)
            .await
            .map_err(|e| EngineError::storage(&format!("create slot {}", index), e))?;
        Ok(Box::new(file))
    }

    async fn finalize(&self, manifest: &[u8]) -> Result<()> {
        let tmp = self.dir.join(format!("{}.tmp", MANIFEST_NAME));
        let target = self.dir.join(MANIFEST_NAME);

        let mut file = tokio::fs::File::create(&tmp)
            .await
            .map_err(|e| EngineError::storage("write MANIFEST", e))?;
        file.write_all(manifest)
            .await
            .map_err(|e| EngineError::storage("write MANIFEST", e))?;
        file.sync_all()
            .await
            .map_err(|e| EngineError::storage("sync MANIFEST", e))?;
        drop(file);

        tokio::fs::rename(&tmp, &target)
            .await
            .map_err(|e| EngineError::storage("commit MANIFEST", e))?;
        Ok(())
    }
}

#[async_trait]
impl ContainerReader for FileContainer {
    fn name(&self) -> &str {
        &self.name
    }

    async fn read_slot(&self, index: usize) -> Result<SlotReader> {
        let path = self.dir.join(index.to_string());
        let file = tokio::fs::File::open(&path)
            .await
            .map_err(|e| EngineError::storage(&format!("open slot {}", index), e))?;
        Ok(Box::new(file))
    }

    async fn read_manifest(&self) -> Result<Vec<u8>> {
        match tokio::fs::read(self.dir.join(MANIFEST_NAME)).await {
            Ok(bytes) => Ok(bytes),
            Err(e) if e.kind() == ErrorKind::NotFound => {
                Err(EngineError::ManifestMissing(self.name.clone()))
            }
            Err(e) => Err(EngineError::storage("read MANIFEST", e)),
        }
    }
}
