//! In-process backup storage, used by tests and embedders that keep
//! backups in memory.

use super::{
    is_safe_component, BackupStorage, ContainerReader, ContainerWriter, ScopeKey, SlotReader,
    SlotWriter,
};
use crate::utils::errors::{EngineError, Result};
use async_trait::async_trait;
use dashmap::DashMap;
use std::collections::BTreeMap;
use std::io;
use std::pin::Pin;
use std::sync::{Arc, Mutex, PoisonError};
use std::task::{Context, Poll};
use tokio::io::AsyncWrite;

type Slot = Arc<Mutex<Vec<u8>>>;

#[derive(Default)]
struct MemoryContainer {
    slots: Mutex<BTreeMap<usize, Slot>>,
    manifest: Mutex<Option<Vec<u8>>>,
}

impl MemoryContainer {
    fn is_finalized(&self) -> bool {
        self.manifest
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_some()
    }
}

/// Backend keeping every container in a map keyed by `(scope, name)`.
#[derive(Clone, Default)]
pub struct MemoryBackupStorage {
    containers: Arc<DashMap<(ScopeKey, String), Arc<MemoryContainer>>>,
    failing_slot: Option<usize>,
}

impl MemoryBackupStorage {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make `write_slot(index)` fail, to exercise storage-failure handling.
    pub fn with_failing_slot(mut self, index: usize) -> Self {
        self.failing_slot = Some(index);
        self
    }

    /// Every container in `scope`, finalized or not.
    pub fn all_containers(&self, scope: &ScopeKey) -> Vec<String> {
        let mut names: Vec<String> = self
            .containers
            .iter()
            .filter(|entry| &entry.key().0 == scope)
            .map(|entry| entry.key().1.clone())
            .collect();
        names.sort();
        names
    }

    /// Raw bytes of a slot, if present.
    pub fn slot_bytes(&self, scope: &ScopeKey, name: &str, index: usize) -> Option<Vec<u8>> {
        let container = self.containers.get(&(scope.clone(), name.to_string()))?;
        let slots = container.slots.lock().unwrap_or_else(PoisonError::into_inner);
        let slot = slots.get(&index)?;
        let bytes = slot.lock().unwrap_or_else(PoisonError::into_inner).clone();
        Some(bytes)
    }

    fn get(&self, scope: &ScopeKey, name: &str) -> Result<Arc<MemoryContainer>> {
        self.containers
            .get(&(scope.clone(), name.to_string()))
            .map(|entry| Arc::clone(entry.value()))
            .ok_or_else(|| EngineError::BackupNotFound {
                scope: scope.to_string(),
                name: name.to_string(),
            })
    }
}

#[async_trait]
impl BackupStorage for MemoryBackupStorage {
    async fn create_container(&self, scope: &ScopeKey, name: &str) -> Result<Arc<dyn ContainerWriter>> {
        if !is_safe_component(name) {
            return Err(EngineError::storage("create container", format!("invalid name {:?}", name)));
        }
        let container = Arc::new(MemoryContainer::default());
        match self.containers.entry((scope.clone(), name.to_string())) {
            dashmap::mapref::entry::Entry::Occupied(_) => {
                return Err(EngineError::storage(
                    &format!("create container {}", name),
                    "already exists",
                ));
            }
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                slot.insert(Arc::clone(&container));
            }
        }
        Ok(Arc::new(MemoryHandle {
            name: name.to_string(),
            container,
            failing_slot: self.failing_slot,
        }))
    }

    async fn list_containers(&self, scope: &ScopeKey) -> Result<Vec<String>> {
        let mut names: Vec<String> = self
            .containers
            .iter()
            .filter(|entry| &entry.key().0 == scope && entry.value().is_finalized())
            .map(|entry| entry.key().1.clone())
            .collect();
        names.sort();
        Ok(names)
    }

    async fn remove_container(&self, scope: &ScopeKey, name: &str) -> Result<()> {
        self.containers
            .remove(&(scope.clone(), name.to_string()))
            .map(|_| ())
            .ok_or_else(|| EngineError::BackupNotFound {
                scope: scope.to_string(),
                name: name.to_string(),
            })
    }

    async fn open_container(&self, scope: &ScopeKey, name: &str) -> Result<Arc<dyn ContainerReader>> {
        let container = self.get(scope, name)?;
        Ok(Arc::new(MemoryHandle {
            name: name.to_string(),
            container,
            failing_slot: None,
        }))
    }
}

struct MemoryHandle {
    name: String,
    container: Arc<MemoryContainer>,
    failing_slot: Option<usize>,
}

#[async_trait]
impl ContainerWriter for MemoryHandle {
    fn name(&self) -> &str {
        &self.name
    }

    async fn write_slot(&self, index: usize) -> Result<SlotWriter> {
        if self.failing_slot == Some(index) {
            return Err(EngineError::storage(&format!("create slot {}", index), "injected failure"));
        }
        let slot: Slot = Arc::default();
        self.container
            .slots
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(index, Arc::clone(&slot));
        Ok(Box::new(MemorySlotWriter { slot }))
    }

    async fn finalize(&self, manifest: &[u8]) -> Result<()> {
        *self
            .container
            .manifest
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(manifest.to_vec());
        Ok(())
    }
}

#[async_trait]
impl ContainerReader for MemoryHandle {
    fn name(&self) -> &str {
        &self.name
    }

    async fn read_slot(&self, index: usize) -> Result<SlotReader> {
        let slots = self.container.slots.lock().unwrap_or_else(PoisonError::into_inner);
        let slot = slots
            .get(&index)
            .ok_or_else(|| EngineError::storage(&format!("open slot {}", index), "no such slot"))?;
        let bytes = slot.lock().unwrap_or_else(PoisonError::into_inner).clone();
        Ok(Box::new(io::Cursor::new(bytes)))
    }

    async fn read_manifest(&self) -> Result<Vec<u8>> {
        self.container
            .manifest
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
            .ok_or_else(|| EngineError::ManifestMissing(self.name.clone()))
    }
}

struct MemorySlotWriter {
    slot: Slot,
}

impl AsyncWrite for MemorySlotWriter {
    fn poll_write(self: Pin<&mut Self>, _cx: &mut Context<'_>, buf: &[u8]) -> Poll<io::Result<usize>> {
        self.slot
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .extend_from_slice(buf);
        Poll::Ready(Ok(buf.len()))
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }
}
