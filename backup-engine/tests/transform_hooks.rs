//! End-to-end backups and restores through real hook programs and the
//! file storage backend.
#![cfg(unix)]

use backup_engine::config::Config;
use backup_engine::node::RESTORE_MARKER;
use backup_engine::{BackupEngine, EngineError};
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

const TRANSFORM_HOOK: &str = r#"#!/bin/sh
case "$2" in
  encode) printf 'header\n'; cat ;;
  decode) tail -n +2 ;;
  *) echo "unknown operation: $2" >&2; exit 2 ;;
esac
"#;

const ERROR_HOOK: &str = r#"#!/bin/sh
cat >/dev/null
echo "refusing to transform $BACKUP_FILE" >&2
exit 1
"#;

/// Hooks are written once, before any test execs them.
fn hooks_dir() -> &'static Path {
    static HOOKS: OnceLock<TempDir> = OnceLock::new();
    HOOKS
        .get_or_init(|| {
            let dir = TempDir::new().unwrap();
            for (name, body) in [("test_backup_transform", TRANSFORM_HOOK), ("test_backup_error", ERROR_HOOK)] {
                let path = dir.path().join(name);
                std::fs::write(&path, body).unwrap();
                std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
            }
            dir
        })
        .path()
}

struct Fixture {
    storage: TempDir,
    primary: TempDir,
    replica: TempDir,
}

impl Fixture {
    fn new() -> Self {
        let fixture = Self {
            storage: TempDir::new().unwrap(),
            primary: TempDir::new().unwrap(),
            replica: TempDir::new().unwrap(),
        };
        let data = fixture.primary.path();
        std::fs::create_dir_all(data.join("vt_test_keyspace")).unwrap();
        std::fs::write(data.join("auto.cnf"), b"[auto]\nserver-uuid=0000000101\n").unwrap();
        std::fs::write(data.join("ibdata1"), (0..=255u8).cycle().take(64 * 1024).collect::<Vec<u8>>()).unwrap();
        std::fs::write(data.join("vt_test_keyspace/vt_insert_test.ibd"), b"no trailing newline").unwrap();
        fixture
    }

    fn config(&self, alias: &str, data_dir: &Path, hook: &str, compress: bool) -> Config {
        let mut config = Config::default();
        config.node.alias = alias.to_string();
        config.node.keyspace = "test_keyspace".to_string();
        config.node.shard = "0".to_string();
        config.node.data_dir = data_dir.to_path_buf();
        config.backup.hook = hook.to_string();
        config.backup.hooks_dir = hooks_dir().to_path_buf();
        config.backup.compress = compress;
        config.storage.root = self.storage.path().to_path_buf();
        config
    }

    fn primary(&self, hook: &str, compress: bool) -> BackupEngine {
        BackupEngine::from_config(&self.config("zone1-0000000101", self.primary.path(), hook, compress)).unwrap()
    }

    /// A replica configured without any hook.
    fn replica(&self) -> BackupEngine {
        BackupEngine::from_config(&self.config("zone1-0000000102", self.replica.path(), "", true)).unwrap()
    }

    fn container_dir(&self, name: &str) -> PathBuf {
        self.storage.path().join("test_keyspace").join("0").join(name)
    }
}

fn assert_same_file(a: &Path, b: &Path, name: &str) {
    assert_eq!(std::fs::read(a.join(name)).unwrap(), std::fs::read(b.join(name)).unwrap(), "{}", name);
}

#[tokio::test]
async fn test_backup_records_hook_in_manifest() {
    let fixture = Fixture::new();
    let engine = fixture.primary("test_backup_transform", false);

    let outcome = engine.backup(&CancellationToken::new()).await.unwrap();

    let manifest: serde_json::Value =
        serde_json::from_slice(&std::fs::read(fixture.container_dir(&outcome.name).join("MANIFEST")).unwrap())
            .unwrap();
    assert_eq!(manifest["TransformHook"], "test_backup_transform");
    assert_eq!(manifest["SkipCompress"], true);

    let entries = manifest["FileEntries"].as_array().unwrap();
    assert_eq!(entries.len(), 3);
    assert_eq!(entries[1]["Name"], "ibdata1");
    assert_eq!(entries[1]["Size"], 64 * 1024);

    for index in 0..entries.len() {
        let slot = std::fs::read(fixture.container_dir(&outcome.name).join(index.to_string())).unwrap();
        assert!(slot.starts_with(b"header\n"), "slot {}", index);
    }
}

#[tokio::test]
async fn test_restore_takes_hook_from_manifest() {
    let fixture = Fixture::new();
    let outcome = fixture
        .primary("test_backup_transform", false)
        .backup(&CancellationToken::new())
        .await
        .unwrap();

    let replica = fixture.replica();
    let restored = replica.restore(None, &CancellationToken::new()).await.unwrap();

    assert_eq!(restored.name, outcome.name);
    for name in ["auto.cnf", "ibdata1", "vt_test_keyspace/vt_insert_test.ibd"] {
        assert_same_file(fixture.primary.path(), fixture.replica.path(), name);
    }
    assert!(!fixture.replica.path().join(RESTORE_MARKER).exists());
}

#[tokio::test]
async fn test_hook_with_compression_roundtrip() {
    let fixture = Fixture::new();
    let outcome = fixture
        .primary("test_backup_transform", true)
        .backup(&CancellationToken::new())
        .await
        .unwrap();

    // The hook's header is inside the zstd frame
    let slot = std::fs::read(fixture.container_dir(&outcome.name).join("1")).unwrap();
    assert!(!slot.starts_with(b"header\n"));

    fixture
        .replica()
        .restore(Some(&outcome.name), &CancellationToken::new())
        .await
        .unwrap();
    assert_same_file(fixture.primary.path(), fixture.replica.path(), "ibdata1");
}

#[tokio::test]
async fn test_failing_hook_aborts_backup() {
    let fixture = Fixture::new();
    let engine = fixture.primary("test_backup_error", true);

    let err = engine.backup(&CancellationToken::new()).await.unwrap_err();
    let message = err.to_string();
    assert!(message.contains("backup is not usable, aborting it"), "{}", message);
    assert!(message.contains("refusing to transform"), "{}", message);

    assert!(engine.list_backups(engine.scope()).await.unwrap().is_empty());
    let leftovers = std::fs::read_dir(fixture.storage.path().join("test_keyspace").join("0"))
        .map(|dir| dir.count())
        .unwrap_or(0);
    assert_eq!(leftovers, 0);
}

#[tokio::test]
async fn test_missing_hook_rejected_up_front() {
    let fixture = Fixture::new();
    let engine = fixture.primary("no_such_hook", true);

    let err = engine.backup(&CancellationToken::new()).await.unwrap_err();
    assert!(matches!(err, EngineError::HookNotFound(_)));
    assert!(!fixture.storage.path().join("test_keyspace").exists());

    let err = fixture
        .primary("../test_backup_transform", true)
        .backup(&CancellationToken::new())
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::InvalidHookName(_)));
}
