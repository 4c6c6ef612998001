//! Node lifecycle collaborator.
//!
//! The engine never manages the database process itself. It only needs a
//! node that can stop and resume serving and enumerate its data directory.

use crate::fs::walker::{walk_directory, FileInfo, WalkOptions};
use crate::utils::errors::{EngineError, Result};
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::info;

/// Marker file present in a data directory while a restore is incomplete.
pub const RESTORE_MARKER: &str = ".restore_in_progress";

#[async_trait]
pub trait Node: Send + Sync {
    /// Node identity, unique within the shard
    fn alias(&self) -> &str;

    fn data_dir(&self) -> &Path;

    /// Stop serving and hold the data directory stable. Returns whether
    /// the node was serving, so callers resume only what they paused.
    async fn pause_serving(&self) -> Result<bool>;

    /// Resume serving. Fails if the data directory is not usable.
    async fn resume_serving(&self) -> Result<()>;

    /// Data files, path-ordered.
    async fn data_files(&self) -> Result<Vec<FileInfo>>;
}

/// True if `data_dir` carries the marker of an unfinished restore.
pub fn restore_incomplete(data_dir: &Path) -> bool {
    data_dir.join(RESTORE_MARKER).exists()
}

/// A node whose data lives in a local directory.
pub struct LocalNode {
    alias: String,
    data_dir: PathBuf,
    serving: AtomicBool,
}

impl LocalNode {
    pub fn new(alias: impl Into<String>, data_dir: impl Into<PathBuf>) -> Self {
        Self {
            alias: alias.into(),
            data_dir: data_dir.into(),
            serving: AtomicBool::new(false),
        }
    }

    pub fn is_serving(&self) -> bool {
        self.serving.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Node for LocalNode {
    fn alias(&self) -> &str {
        &self.alias
    }

    fn data_dir(&self) -> &Path {
        &self.data_dir
    }

    async fn pause_serving(&self) -> Result<bool> {
        let was_serving = self.serving.swap(false, Ordering::SeqCst);
        if was_serving {
            info!(node = %self.alias, "Stopped serving");
        }
        Ok(was_serving)
    }

    async fn resume_serving(&self) -> Result<()> {
        if restore_incomplete(&self.data_dir) {
            return Err(EngineError::RestoreIncomplete(self.data_dir.display().to_string()));
        }
        if !self.serving.swap(true, Ordering::SeqCst) {
            info!(node = %self.alias, "Serving");
        }
        Ok(())
    }

    async fn data_files(&self) -> Result<Vec<FileInfo>> {
        let root = self.data_dir.clone();
        let options = WalkOptions {
            follow_links: false,
            exclude_names: vec![RESTORE_MARKER.to_string()],
        };
        let files = tokio::task::spawn_blocking(move || walk_directory(&root, &options))
            .await
            .map_err(|e| EngineError::Io(std::io::Error::other(e)))??;
        Ok(files)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_marker_blocks_serving() {
        let temp_dir = TempDir::new().unwrap();
        let node = LocalNode::new("zone1-102", temp_dir.path());

        node.resume_serving().await.unwrap();
        assert!(node.is_serving());
        assert!(node.pause_serving().await.unwrap());
        assert!(!node.is_serving());
        assert!(!node.pause_serving().await.unwrap());

        std::fs::write(temp_dir.path().join(RESTORE_MARKER), b"").unwrap();
        let err = node.resume_serving().await.unwrap_err();
        assert!(matches!(err, EngineError::RestoreIncomplete(_)));
        assert!(!node.is_serving());
    }

    #[tokio::test]
    async fn test_data_files_skip_marker() {
        let temp_dir = TempDir::new().unwrap();
        std::fs::write(temp_dir.path().join("ibdata1"), b"1234").unwrap();
        std::fs::write(temp_dir.path().join(RESTORE_MARKER), b"").unwrap();

        let node = LocalNode::new("zone1-102", temp_dir.path());
        let files = node.data_files().await.unwrap();
        assert_eq!(files.len(), 1);
        assert_eq!(files[0].relative_path, "ibdata1");
        assert_eq!(files[0].size, 4);
    }
}
