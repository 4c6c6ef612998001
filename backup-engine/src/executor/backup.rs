//! Backup coordinator.
//!
//! Runs `Idle -> Snapshotting -> TransformAndUpload -> Finalizing -> Done`.
//! Any failure once the container exists moves to `Aborting`, which removes
//! the container before the error is returned, so a failed backup never
//! shows up in a listing.

use super::manifest::{FileEntry, Manifest};
use super::run_bounded;
use crate::config::BackupConfig;
use crate::fs::walker::{total_size, FileInfo};
use crate::node::{restore_incomplete, Node};
use crate::storage::{container_name, BackupStorage, ContainerWriter, ScopeKey};
use crate::transfer::digest::DigestReader;
use crate::transform::{resolve_transform, Compression, FileContext, Pipeline, TransformResolver};
use crate::utils::errors::{EngineError, Result};
use chrono::Utc;
use std::fmt;
use std::sync::Arc;
use std::time::Instant;
use tokio::fs::File;
use tokio::io::BufReader;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackupPhase {
    Idle,
    Snapshotting,
    TransformAndUpload,
    Finalizing,
    Done,
    Aborting,
}

impl fmt::Display for BackupPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            BackupPhase::Idle => "idle",
            BackupPhase::Snapshotting => "snapshotting",
            BackupPhase::TransformAndUpload => "transform_and_upload",
            BackupPhase::Finalizing => "finalizing",
            BackupPhase::Done => "done",
            BackupPhase::Aborting => "aborting",
        };
        f.write_str(name)
    }
}

/// A finalized, listable backup.
#[derive(Debug, Clone)]
pub struct BackupOutcome {
    pub name: String,
    pub scope: ScopeKey,
    pub manifest: Manifest,
}

impl BackupOutcome {
    pub fn file_count(&self) -> usize {
        self.manifest.file_entries.len()
    }

    pub fn total_size(&self) -> u64 {
        self.manifest.total_size()
    }
}

pub(crate) struct BackupCoordinator<'a> {
    pub node: &'a dyn Node,
    pub scope: &'a ScopeKey,
    pub storage: Arc<dyn BackupStorage>,
    pub resolver: &'a dyn TransformResolver,
    pub settings: &'a BackupConfig,
}

struct Upload {
    file: FileInfo,
    ctx: FileContext,
}

impl BackupCoordinator<'_> {
    pub async fn run(&self, cancel: &CancellationToken) -> Result<BackupOutcome> {
        let alias = self.node.alias();
        if restore_incomplete(self.node.data_dir()) {
            return Err(EngineError::RestoreIncomplete(self.node.data_dir().display().to_string()));
        }

        // Hook problems surface here, before the node is paused or any file is read
        let transform = resolve_transform(self.resolver, &self.settings.hook)?;
        let compression = self
            .settings
            .compress
            .then(|| Compression::new(self.settings.compression_level));
        let pipeline = Pipeline::new(transform, compression);

        let was_serving = self.node.pause_serving().await?;
        let result = self.take(&pipeline, cancel).await;

        if was_serving {
            if let Err(e) = self.node.resume_serving().await {
                warn!(node = %alias, error = %e, "Failed to resume serving after backup");
                if result.is_ok() {
                    return Err(e);
                }
            }
        }
        result
    }

    async fn take(&self, pipeline: &Pipeline, cancel: &CancellationToken) -> Result<BackupOutcome> {
        let alias = self.node.alias();
        let started = Instant::now();

        enter(BackupPhase::Snapshotting, alias);
        let files = self.node.data_files().await?;
        let name = container_name(Utc::now(), alias);

        info!(
            backup = %name,
            scope = %self.scope,
            files = files.len(),
            bytes = total_size(&files),
            hook = %pipeline.hook_name(),
            compress = !pipeline.skip_compress(),
            "Starting backup"
        );

        let container = self.storage.create_container(self.scope, &name).await?;

        match self.upload_all(&container, pipeline, files, cancel).await {
            Ok(manifest) => {
                enter(BackupPhase::Done, alias);
                info!(
                    backup = %name,
                    files = manifest.file_entries.len(),
                    bytes = manifest.total_size(),
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    "Backup complete"
                );
                Ok(BackupOutcome {
                    name,
                    scope: self.scope.clone(),
                    manifest,
                })
            }
            Err(e) => {
                enter(BackupPhase::Aborting, alias);
                if e.is_cancelled() {
                    warn!(backup = %name, "Backup cancelled");
                } else {
                    error!(backup = %name, error = %e, "Backup failed");
                }
                if let Err(cleanup) = self.storage.remove_container(self.scope, &name).await {
                    error!(backup = %name, error = %cleanup, "Failed to remove aborted backup");
                }
                enter(BackupPhase::Idle, alias);
                Err(EngineError::NotUsable(Box::new(e)))
            }
        }
    }

    async fn upload_all(
        &self,
        container: &Arc<dyn ContainerWriter>,
        pipeline: &Pipeline,
        files: Vec<FileInfo>,
        cancel: &CancellationToken,
    ) -> Result<Manifest> {
        let alias = self.node.alias();

        enter(BackupPhase::TransformAndUpload, alias);
        let uploads: Vec<Upload> = files
            .into_iter()
            .map(|file| Upload {
                ctx: FileContext {
                    node_alias: alias.to_string(),
                    backup_name: container.name().to_string(),
                    file_name: file.relative_path.clone(),
                },
                file,
            })
            .collect();

        let file_entries = run_bounded(uploads, self.settings.concurrency, cancel, |index, upload, _token| {
            let container = Arc::clone(container);
            let pipeline = pipeline.clone();
            async move { upload_file(container.as_ref(), &pipeline, index, upload).await }
        })
        .await?;

        if cancel.is_cancelled() {
            return Err(EngineError::Cancelled);
        }

        enter(BackupPhase::Finalizing, alias);
        let manifest = Manifest {
            transform_hook: pipeline.hook_name().to_string(),
            skip_compress: pipeline.skip_compress(),
            file_entries,
            backup_time: Some(Utc::now()),
            node_alias: Some(alias.to_string()),
        };
        container.finalize(&manifest.to_json()?).await?;
        Ok(manifest)
    }
}

/// Stream one data file through the pipeline into slot `index`.
async fn upload_file(
    container: &dyn ContainerWriter,
    pipeline: &Pipeline,
    index: usize,
    upload: Upload,
) -> Result<FileEntry> {
    let Upload { file, ctx } = upload;

    let source = File::open(&file.path).await?;
    let mut reader = DigestReader::new(BufReader::new(source));
    let mut slot = container.write_slot(index).await?;

    pipeline.encode(&ctx, &mut reader, &mut *slot).await?;

    let digest = reader.finish();
    if digest.size != file.size {
        // The file changed between enumeration and upload
        return Err(EngineError::SizeMismatch {
            file: file.relative_path,
            expected: file.size,
            actual: digest.size,
        });
    }

    debug!(file = %file.relative_path, slot = index, bytes = digest.size, "Uploaded file");
    Ok(FileEntry {
        name: file.relative_path,
        size: digest.size,
        hash: Some(digest.hash),
    })
}

fn enter(phase: BackupPhase, node: &str) {
    debug!(node = %node, phase = %phase, "Backup phase");
}
