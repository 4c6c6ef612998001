//! Data-directory enumeration.
//!
//! Produces the stable, path-ordered file list a backup works from. The
//! position of a file in this list is the slot index it is stored under.

use std::path::{Path, PathBuf};
use walkdir::{DirEntry, WalkDir};

/// Options for directory walking
#[derive(Debug, Clone, Default)]
pub struct WalkOptions {
    /// Follow symbolic links
    pub follow_links: bool,

    /// File names skipped wherever they appear (exact match)
    pub exclude_names: Vec<String>,
}

/// A regular file found under the data directory
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileInfo {
    /// Full path to the file
    pub path: PathBuf,

    /// Path relative to the data directory, `/`-separated
    pub relative_path: String,

    /// File size in bytes
    pub size: u64,
}

impl FileInfo {
    /// Returns None for directories and for symlinks that do not resolve to a file.
    fn from_entry(entry: &DirEntry, root: &Path) -> std::io::Result<Option<Self>> {
        let path = entry.path().to_path_buf();
        let metadata = if entry.path_is_symlink() {
            match std::fs::metadata(&path) {
                Ok(resolved) => resolved,
                // Broken symlink
                Err(_) => return Ok(None),
            }
        } else {
            entry.metadata()?
        };
        if !metadata.is_file() {
            return Ok(None);
        }

        let relative = path.strip_prefix(root).unwrap_or(&path);
        let relative_path = relative
            .components()
            .map(|c| c.as_os_str().to_string_lossy())
            .collect::<Vec<_>>()
            .join("/");

        Ok(Some(Self {
            path,
            relative_path,
            size: metadata.len(),
        }))
    }
}

/// Walk `root` and return every regular file, sorted by relative path.
///
/// # Example
/// ```no_run
/// use backup_engine::fs::walker::{walk_directory, WalkOptions};
/// use std::path::Path;
///
/// let files = walk_directory(Path::new("/data"), &WalkOptions::default()).unwrap();
/// println!("Found {} files", files.len());
/// ```
pub fn walk_directory(root: &Path, options: &WalkOptions) -> std::io::Result<Vec<FileInfo>> {
    let mut files = Vec::new();

    let walker = WalkDir::new(root)
        .follow_links(options.follow_links)
        .sort_by_file_name();

    for entry in walker {
        let entry = entry?;

        if should_exclude(&entry, &options.exclude_names) {
            continue;
        }

        if entry.file_type().is_dir() {
            continue;
        }

        if let Some(file_info) = FileInfo::from_entry(&entry, root)? {
            files.push(file_info);
        }
    }

    files.sort_by(|a, b| a.relative_path.cmp(&b.relative_path));
    Ok(files)
}

/// Calculate total size of a file list
pub fn total_size(files: &[FileInfo]) -> u64 {
    files.iter().map(|f| f.size).sum()
}

fn should_exclude(entry: &DirEntry, names: &[String]) -> bool {
    let file_name = entry.file_name().to_string_lossy();
    names.iter().any(|n| *n == file_name)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    #[test]
    fn test_walk_empty_directory() -> std::io::Result<()> {
        let temp_dir = TempDir::new()?;
        let files = walk_directory(temp_dir.path(), &WalkOptions::default())?;
        assert_eq!(files.len(), 0);
        Ok(())
    }

    #[test]
    fn test_walk_is_path_ordered() -> std::io::Result<()> {
        let temp_dir = TempDir::new()?;

        fs::create_dir(temp_dir.path().join("vt_test_keyspace"))?;
        fs::write(temp_dir.path().join("ibdata1"), b"system")?;
        fs::write(temp_dir.path().join("vt_test_keyspace/vt_insert_test.ibd"), b"rows")?;
        fs::write(temp_dir.path().join("auto.cnf"), b"uuid")?;

        let files = walk_directory(temp_dir.path(), &WalkOptions::default())?;
        let names: Vec<&str> = files.iter().map(|f| f.relative_path.as_str()).collect();
        assert_eq!(names, vec!["auto.cnf", "ibdata1", "vt_test_keyspace/vt_insert_test.ibd"]);
        assert_eq!(total_size(&files), 14);

        Ok(())
    }

    #[test]
    fn test_exclude_names() -> std::io::Result<()> {
        let temp_dir = TempDir::new()?;

        fs::write(temp_dir.path().join("ib_logfile0"), b"keep")?;
        fs::write(temp_dir.path().join(".restore_in_progress"), b"")?;

        let options = WalkOptions {
            exclude_names: vec![".restore_in_progress".to_string()],
            ..Default::default()
        };
        let files = walk_directory(temp_dir.path(), &options)?;
        assert_eq!(files.len(), 1);
        assert_eq!(files[0].relative_path, "ib_logfile0");

        Ok(())
    }

    #[cfg(unix)]
    #[test]
    fn test_broken_symlink_skipped() -> std::io::Result<()> {
        let temp_dir = TempDir::new()?;
        fs::write(temp_dir.path().join("real"), b"x")?;
        std::os::unix::fs::symlink(temp_dir.path().join("gone"), temp_dir.path().join("dangling"))?;

        let files = walk_directory(temp_dir.path(), &WalkOptions::default())?;
        assert_eq!(files.len(), 1);
        Ok(())
    }
}
