//! Backup and restore execution.
//!
//! `BackupEngine` is the entry point for one node: it owns the node's
//! operation lock and wires the node, storage backend and transform
//! resolver into the backup and restore coordinators.

pub mod backup;
pub mod manifest;
pub mod restore;
pub mod tracker;

use crate::config::{BackupConfig, Config};
use crate::node::{LocalNode, Node};
use crate::storage::{BackupStorage, FileBackupStorage, ScopeKey};
use crate::transform::{HookDirectory, TransformResolver};
use crate::utils::errors::{EngineError, Result};
use backup::{BackupCoordinator, BackupOutcome};
use restore::{RestoreCoordinator, RestoreOutcome};
use std::future::Future;
use std::sync::Arc;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracker::{OperationKind, OperationTracker};
use tracing::{info, warn};

pub use manifest::{FileEntry, Manifest};

/// Backup/restore entry point for one node
pub struct BackupEngine {
    node: Arc<dyn Node>,
    scope: ScopeKey,
    storage: Arc<dyn BackupStorage>,
    resolver: Arc<dyn TransformResolver>,
    settings: BackupConfig,
    tracker: OperationTracker,
}

impl BackupEngine {
    pub fn new(
        node: Arc<dyn Node>,
        scope: ScopeKey,
        storage: Arc<dyn BackupStorage>,
        resolver: Arc<dyn TransformResolver>,
        settings: BackupConfig,
    ) -> Self {
        Self {
            node,
            scope,
            storage,
            resolver,
            settings,
            tracker: OperationTracker::new(),
        }
    }

    /// Engine for a local node backed by the configured storage backend.
    pub fn from_config(config: &Config) -> Result<Self> {
        config.validate()?;

        let storage: Arc<dyn BackupStorage> = match config.storage.backend.as_str() {
            "file" => Arc::new(FileBackupStorage::new(&config.storage.root)),
            other => {
                return Err(EngineError::Config(format!("unknown storage backend: {}", other)));
            }
        };

        Ok(Self::new(
            Arc::new(LocalNode::new(&config.node.alias, &config.node.data_dir)),
            config.scope()?,
            storage,
            Arc::new(HookDirectory::new(&config.backup.hooks_dir)),
            config.backup.clone(),
        ))
    }

    /// Share operation locks with other engines in the process.
    pub fn with_tracker(mut self, tracker: OperationTracker) -> Self {
        self.tracker = tracker;
        self
    }

    pub fn tracker(&self) -> &OperationTracker {
        &self.tracker
    }

    pub fn scope(&self) -> &ScopeKey {
        &self.scope
    }

    pub fn node(&self) -> &Arc<dyn Node> {
        &self.node
    }

    /// Take a backup of the node using the configured hook and compression.
    ///
    /// On failure nothing is left in storage: the in-progress container is
    /// removed before the error is returned.
    pub async fn backup(&self, cancel: &CancellationToken) -> Result<BackupOutcome> {
        let guard = self.tracker.begin(self.node.alias(), OperationKind::Backup, cancel)?;

        let coordinator = BackupCoordinator {
            node: self.node.as_ref(),
            scope: &self.scope,
            storage: Arc::clone(&self.storage),
            resolver: self.resolver.as_ref(),
            settings: &self.settings,
        };
        let result = coordinator.run(guard.token()).await;
        drop(guard);
        result
    }

    /// Restore the node's data directory from `backup`, or from the newest
    /// backup of the node's shard when `backup` is None.
    ///
    /// Hook and compression are taken from the backup's MANIFEST only.
    pub async fn restore(&self, backup: Option<&str>, cancel: &CancellationToken) -> Result<RestoreOutcome> {
        let guard = self.tracker.begin(self.node.alias(), OperationKind::Restore, cancel)?;

        let coordinator = RestoreCoordinator {
            node: self.node.as_ref(),
            scope: &self.scope,
            storage: self.storage.as_ref(),
            resolver: self.resolver.as_ref(),
            concurrency: self.settings.concurrency,
        };
        let result = coordinator.run(backup, guard.token()).await;
        drop(guard);
        result
    }

    /// Finalized backups of `scope`, oldest first.
    pub async fn list_backups(&self, scope: &ScopeKey) -> Result<Vec<String>> {
        self.storage.list_containers(scope).await
    }

    pub async fn remove_backup(&self, scope: &ScopeKey, name: &str) -> Result<()> {
        self.storage.remove_container(scope, name).await?;
        info!(scope = %scope, backup = %name, "Removed backup");
        Ok(())
    }
}

/// Run `work` over `items` with at most `concurrency` in flight.
///
/// Results come back in item order. The first failure cancels the
/// remaining workers; the error returned is the one that caused the
/// cancellation, not the cancellations it triggered.
pub(crate) async fn run_bounded<I, T, F, Fut>(
    items: Vec<I>,
    concurrency: usize,
    cancel: &CancellationToken,
    work: F,
) -> Result<Vec<T>>
where
    I: Send + 'static,
    T: Send + 'static,
    F: Fn(usize, I, CancellationToken) -> Fut,
    Fut: Future<Output = Result<T>> + Send + 'static,
{
    let semaphore = Arc::new(Semaphore::new(concurrency.max(1)));
    let workers = cancel.child_token();
    let count = items.len();
    let mut set = JoinSet::new();

    for (idx, item) in items.into_iter().enumerate() {
        let sem = Arc::clone(&semaphore);
        let token = workers.clone();
        let task = work(idx, item, token.clone());

        set.spawn(async move {
            let _permit = tokio::select! {
                permit = sem.acquire_owned() => permit.map_err(|e| EngineError::Io(std::io::Error::other(e)))?,
                _ = token.cancelled() => return Err(EngineError::Cancelled),
            };
            tokio::select! {
                result = task => result.map(|value| (idx, value)),
                _ = token.cancelled() => Err(EngineError::Cancelled),
            }
        });
    }

    let mut slots: Vec<Option<T>> = (0..count).map(|_| None).collect();
    let mut first_error: Option<EngineError> = None;

    while let Some(joined) = set.join_next().await {
        let outcome = joined.unwrap_or_else(|e| {
            Err(EngineError::Io(std::io::Error::other(format!("worker failed: {}", e))))
        });
        match outcome {
            Ok((idx, value)) => slots[idx] = Some(value),
            Err(e) => {
                if !workers.is_cancelled() {
                    if !e.is_cancelled() {
                        warn!(error = %e, "Worker failed, cancelling remaining work");
                    }
                    workers.cancel();
                }
                let replace = match &first_error {
                    None => true,
                    Some(prev) => prev.is_cancelled() && !e.is_cancelled(),
                };
                if replace {
                    first_error = Some(e);
                }
            }
        }
    }

    if let Some(e) = first_error {
        return Err(e);
    }
    Ok(slots.into_iter().flatten().collect())
}
