//! Restore coordinator.
//!
//! The pipeline is rebuilt from the MANIFEST alone. A backup that cannot be
//! opened, parsed or decoded is rejected before the node is paused. While
//! files are being written the data directory carries the restore marker;
//! it is removed only once every file has been verified, so a restore that
//! fails part way leaves a node that refuses to serve.

use super::manifest::{FileEntry, Manifest};
use super::run_bounded;
use crate::node::{Node, RESTORE_MARKER};
use crate::storage::{BackupStorage, ContainerReader, ScopeKey};
use crate::transfer::digest::DigestWriter;
use crate::transform::{resolve_transform, Compression, FileContext, Pipeline, TransformResolver};
use crate::utils::errors::{EngineError, Result};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;
use tokio::fs::{self, File};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// A completed restore.
#[derive(Debug, Clone)]
pub struct RestoreOutcome {
    pub name: String,
    pub files: usize,
    pub bytes: u64,
}

pub(crate) struct RestoreCoordinator<'a> {
    pub node: &'a dyn Node,
    pub scope: &'a ScopeKey,
    pub storage: &'a dyn BackupStorage,
    pub resolver: &'a dyn TransformResolver,
    pub concurrency: usize,
}

/// A backup whose MANIFEST has been read and whose pipeline resolved.
struct Prepared {
    name: String,
    container: Arc<dyn ContainerReader>,
    manifest: Manifest,
    pipeline: Pipeline,
}

impl RestoreCoordinator<'_> {
    pub async fn run(&self, backup: Option<&str>, cancel: &CancellationToken) -> Result<RestoreOutcome> {
        let name = match backup {
            Some(name) => name.to_string(),
            None => self.latest().await?,
        };
        // Nothing is touched until the backup is known to be readable
        let prepared = self.prepare(name).await?;

        let alias = self.node.alias();
        let data_dir = self.node.data_dir();
        let name = prepared.name.clone();

        self.node.pause_serving().await?;
        fs::create_dir_all(data_dir).await?;
        fs::write(data_dir.join(RESTORE_MARKER), name.as_bytes()).await?;

        info!(node = %alias, backup = %name, scope = %self.scope, "Starting restore");
        let started = Instant::now();

        match self.restore_files(prepared, cancel).await {
            Ok(outcome) => {
                fs::remove_file(data_dir.join(RESTORE_MARKER)).await?;
                self.node.resume_serving().await?;
                info!(
                    node = %alias,
                    backup = %name,
                    files = outcome.files,
                    bytes = outcome.bytes,
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    "Restore complete"
                );
                Ok(outcome)
            }
            Err(e) => {
                if e.is_cancelled() {
                    warn!(node = %alias, backup = %name, "Restore cancelled, data directory left unusable");
                } else {
                    error!(node = %alias, backup = %name, error = %e, "Restore failed, data directory left unusable");
                }
                Err(e)
            }
        }
    }

    /// Newest finalized backup of the node's shard.
    async fn latest(&self) -> Result<String> {
        self.storage
            .list_containers(self.scope)
            .await?
            .pop()
            .ok_or_else(|| EngineError::NoBackups(self.scope.to_string()))
    }

    /// Open `name`, parse its MANIFEST and rebuild the pipeline it records.
    async fn prepare(&self, name: String) -> Result<Prepared> {
        let container = self.storage.open_container(self.scope, &name).await?;
        let manifest = Manifest::from_json(&container.read_manifest().await?)?;

        let transform = resolve_transform(self.resolver, &manifest.transform_hook)?;
        let compression = (!manifest.skip_compress).then(Compression::default);
        let pipeline = Pipeline::new(transform, compression);

        debug!(
            backup = %name,
            files = manifest.file_entries.len(),
            hook = %manifest.transform_hook,
            skip_compress = manifest.skip_compress,
            "Read MANIFEST"
        );
        Ok(Prepared {
            name,
            container,
            manifest,
            pipeline,
        })
    }

    async fn restore_files(&self, prepared: Prepared, cancel: &CancellationToken) -> Result<RestoreOutcome> {
        let Prepared {
            name,
            container,
            manifest,
            pipeline,
        } = prepared;

        let alias = self.node.alias().to_string();
        let data_dir = self.node.data_dir().to_path_buf();
        let files = manifest.file_entries.len();

        let sizes = run_bounded(manifest.file_entries, self.concurrency, cancel, |index, entry, _token| {
            let container = Arc::clone(&container);
            let pipeline = pipeline.clone();
            let data_dir = data_dir.clone();
            let ctx = FileContext {
                node_alias: alias.clone(),
                backup_name: name.clone(),
                file_name: entry.name.clone(),
            };
            async move { restore_file(container.as_ref(), &pipeline, &data_dir, index, entry, ctx).await }
        })
        .await?;

        if cancel.is_cancelled() {
            return Err(EngineError::Cancelled);
        }

        Ok(RestoreOutcome {
            name,
            files,
            bytes: sizes.iter().sum(),
        })
    }
}

/// Decode slot `index` into its file under `data_dir` and verify it.
async fn restore_file(
    container: &dyn ContainerReader,
    pipeline: &Pipeline,
    data_dir: &Path,
    index: usize,
    entry: FileEntry,
    ctx: FileContext,
) -> Result<u64> {
    let target: PathBuf = data_dir.join(&entry.name);
    if let Some(parent) = target.parent() {
        fs::create_dir_all(parent).await?;
    }

    let mut slot = container.read_slot(index).await?;
    let mut writer = DigestWriter::new(File::create(&target).await?);

    pipeline.decode(&ctx, &mut *slot, &mut writer).await?;

    let digest = writer.finish();
    if digest.size != entry.size {
        return Err(EngineError::SizeMismatch {
            file: entry.name,
            expected: entry.size,
            actual: digest.size,
        });
    }
    if let Some(expected) = &entry.hash {
        if *expected != digest.hash {
            return Err(EngineError::HashMismatch { file: entry.name });
        }
    }

    debug!(file = %entry.name, slot = index, bytes = digest.size, "Restored file");
    Ok(digest.size)
}
