//! External transform hooks.
//!
//! A hook is an executable in the hooks directory, run once per file per
//! direction as `<hook> --operation encode|decode`. It reads the input on
//! stdin and writes the transformed bytes on stdout. A non-zero exit status
//! or a broken pipe fails the file.

use super::{Direction, FileContext, Input, Output, Transform, TransformResolver};
use crate::storage::is_safe_component;
use crate::utils::errors::{EngineError, Result};
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::process::Command;
use tracing::{debug, warn};

/// Longest stderr excerpt carried in an error.
const MAX_STDERR_EXCERPT: usize = 512;

/// Resolves hook names to executables under one directory.
#[derive(Debug, Clone)]
pub struct HookDirectory {
    dir: PathBuf,
}

impl HookDirectory {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }
}

impl TransformResolver for HookDirectory {
    fn resolve(&self, hook: &str) -> Result<Arc<dyn Transform>> {
        Ok(Arc::new(ExternalHook::locate(&self.dir, hook)?))
    }
}

/// A transform backed by an external program.
#[derive(Debug, Clone)]
pub struct ExternalHook {
    name: String,
    program: PathBuf,
}

impl ExternalHook {
    /// Find `name` in `dir`. The name must be a bare file name.
    pub fn locate(dir: &Path, name: &str) -> Result<Self> {
        if !is_safe_component(name) {
            return Err(EngineError::InvalidHookName(name.to_string()));
        }
        let program = dir.join(name);
        if !program.is_file() {
            return Err(EngineError::HookNotFound(program.display().to_string()));
        }
        Ok(Self {
            name: name.to_string(),
            program,
        })
    }

    pub fn program(&self) -> &Path {
        &self.program
    }

    fn failure(&self, ctx: &FileContext, message: String) -> EngineError {
        EngineError::Transform {
            hook: self.name.clone(),
            file: ctx.file_name.clone(),
            message,
        }
    }
}

#[async_trait]
impl Transform for ExternalHook {
    fn name(&self) -> &str {
        &self.name
    }

    async fn filter(
        &self,
        direction: Direction,
        ctx: &FileContext,
        input: Input<'_>,
        output: Output<'_>,
    ) -> Result<()> {
        debug!(hook = %self.name, file = %ctx.file_name, %direction, "Spawning transform hook");

        let mut child = Command::new(&self.program)
            .arg("--operation")
            .arg(direction.as_str())
            .env("BACKUP_NODE_ALIAS", &ctx.node_alias)
            .env("BACKUP_NAME", &ctx.backup_name)
            .env("BACKUP_FILE", &ctx.file_name)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            // dropping the future (cancellation) must not leave the hook running
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| self.failure(ctx, format!("spawn {}: {}", self.program.display(), e)))?;

        let (Some(stdin), Some(mut stdout), Some(mut stderr)) =
            (child.stdin.take(), child.stdout.take(), child.stderr.take())
        else {
            return Err(self.failure(ctx, "hook pipes unavailable".into()));
        };

        let collect_stderr = tokio::spawn(async move {
            let mut buf = Vec::new();
            let _ = stderr.read_to_end(&mut buf).await;
            buf
        });
        let feed = async move {
            let mut stdin = stdin;
            let copied = tokio::io::copy(input, &mut stdin)
                .await
                .map_err(|e| format!("writing hook stdin: {}", e))?;
            stdin
                .shutdown()
                .await
                .map_err(|e| format!("closing hook stdin: {}", e))?;
            Ok::<u64, String>(copied)
        };
        let drain = async {
            let copied = tokio::io::copy(&mut stdout, &mut *output)
                .await
                .map_err(|e| format!("forwarding hook stdout: {}", e))?;
            output
                .flush()
                .await
                .map_err(|e| format!("forwarding hook stdout: {}", e))?;
            Ok::<u64, String>(copied)
        };

        let pumped = tokio::try_join!(feed, drain);
        drop(stdout);
        if pumped.is_err() {
            // Nothing reads the hook's stdout any more, so it may never exit
            let _ = child.start_kill();
        }

        let status = child
            .wait()
            .await
            .map_err(|e| self.failure(ctx, format!("wait: {}", e)))?;
        let stderr_bytes = collect_stderr.await.unwrap_or_default();

        // A hook that failed on its own accounts for any broken pipe
        if !status.success() && (pumped.is_ok() || status.code().is_some()) {
            let excerpt = stderr_excerpt(&stderr_bytes);
            warn!(hook = %self.name, file = %ctx.file_name, %status, stderr = %excerpt, "Transform hook failed");
            let message = if excerpt.is_empty() {
                status.to_string()
            } else {
                format!("{}: {}", status, excerpt)
            };
            return Err(self.failure(ctx, message));
        }

        let (fed, drained) = pumped.map_err(|message| {
            warn!(hook = %self.name, file = %ctx.file_name, error = %message, "Transform hook aborted");
            self.failure(ctx, message)
        })?;

        debug!(hook = %self.name, file = %ctx.file_name, %direction, bytes_in = fed, bytes_out = drained, "Transform hook finished");
        Ok(())
    }
}

/// Last non-empty stderr line, trimmed to a bounded length.
fn stderr_excerpt(stderr: &[u8]) -> String {
    let text = String::from_utf8_lossy(stderr);
    let line = text
        .lines()
        .rev()
        .map(str::trim)
        .find(|l| !l.is_empty())
        .unwrap_or("");
    line.chars().take(MAX_STDERR_EXCERPT).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io;
    use std::pin::Pin;
    use std::task::{Context, Poll};
    use std::time::Duration;
    use tempfile::TempDir;
    use tokio::io::AsyncWrite;

    /// Accepts one write, then fails like a full disk.
    struct FullDisk {
        writes: usize,
    }

    impl AsyncWrite for FullDisk {
        fn poll_write(mut self: Pin<&mut Self>, _cx: &mut Context<'_>, buf: &[u8]) -> Poll<io::Result<usize>> {
            self.writes += 1;
            if self.writes > 1 {
                return Poll::Ready(Err(io::Error::other("no space left on device")));
            }
            Poll::Ready(Ok(buf.len()))
        }

        fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
            Poll::Ready(Ok(()))
        }

        fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
            Poll::Ready(Ok(()))
        }
    }

    #[test]
    fn test_rejects_path_like_names() {
        let temp_dir = TempDir::new().unwrap();
        for bad in ["", ".", "..", "../bin/sh", "sub/hook"] {
            let err = ExternalHook::locate(temp_dir.path(), bad).unwrap_err();
            assert!(matches!(err, EngineError::InvalidHookName(_)), "{:?}", bad);
        }
    }

    #[test]
    fn test_missing_hook() {
        let temp_dir = TempDir::new().unwrap();
        let resolver = HookDirectory::new(temp_dir.path());
        let err = resolver.resolve("test_backup_transform").err().unwrap();
        assert!(matches!(err, EngineError::HookNotFound(_)));
    }

    #[test]
    fn test_locate_existing_hook() {
        let temp_dir = TempDir::new().unwrap();
        std::fs::write(temp_dir.path().join("gpg_hook"), b"#!/bin/sh\ncat\n").unwrap();

        let hook = ExternalHook::locate(temp_dir.path(), "gpg_hook").unwrap();
        assert_eq!(hook.name(), "gpg_hook");
        assert_eq!(hook.program(), temp_dir.path().join("gpg_hook"));
    }

    #[test]
    fn test_stderr_excerpt() {
        assert_eq!(stderr_excerpt(b"warming up\nkey not found\n\n"), "key not found");
        assert_eq!(stderr_excerpt(b""), "");
        assert_eq!(stderr_excerpt(&[b'x'; 2000]).len(), MAX_STDERR_EXCERPT);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_failing_sink_stops_hook() {
        use std::os::unix::fs::PermissionsExt;

        let temp_dir = TempDir::new().unwrap();
        let program = temp_dir.path().join("passthrough");
        std::fs::write(&program, b"#!/bin/sh\nexec cat\n").unwrap();
        std::fs::set_permissions(&program, std::fs::Permissions::from_mode(0o755)).unwrap();

        let hook = ExternalHook::locate(temp_dir.path(), "passthrough").unwrap();
        let ctx = FileContext {
            node_alias: "zone1-101".into(),
            backup_name: "b".into(),
            file_name: "ibdata1".into(),
        };
        let mut input = io::Cursor::new(vec![7u8; 4 * 1024 * 1024]);
        let mut sink = FullDisk { writes: 0 };

        let result = tokio::time::timeout(Duration::from_secs(30), hook.encode(&ctx, &mut input, &mut sink))
            .await
            .expect("hook kept running after its output failed");
        let err = result.unwrap_err();
        assert!(matches!(err, EngineError::Transform { .. }), "{}", err);
        assert!(err.to_string().contains("no space left on device"), "{}", err);
    }
}
