//! Backup Engine - Main entry point
//!
//! Runs one backup, restore, list or remove against the configured node.

use anyhow::Result;
use backup_engine::daemon::shutdown::ShutdownCoordinator;
use backup_engine::storage::ScopeKey;
use backup_engine::{utils, BackupEngine, Config};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to configuration file
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Back up the node's data directory
    Backup,

    /// Restore the node's data directory
    Restore {
        /// Backup to restore (defaults to the newest one of the node's shard)
        #[arg(short, long)]
        backup: Option<String>,
    },

    /// List finalized backups
    List {
        /// keyspace/shard (defaults to the node's own)
        scope: Option<String>,
    },

    /// Remove a backup
    Remove {
        /// keyspace/shard
        scope: String,
        name: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Load configuration
    let config = Config::load(args.config.as_deref())?;

    // Initialize logging
    let log_level = args.log_level.as_deref().unwrap_or(&config.log.level);
    utils::logger::init(log_level)?;

    tracing::info!(
        node = %config.node.alias,
        scope = %config.scope()?,
        "Starting backup-engine v{}",
        env!("CARGO_PKG_VERSION")
    );

    let engine = BackupEngine::from_config(&config)?;

    match args.command {
        Command::Backup => {
            let outcome = cancellable(|token| async move { engine.backup(&token).await }).await?;
            println!("{}", outcome.name);
        }
        Command::Restore { backup } => {
            let outcome =
                cancellable(|token| async move { engine.restore(backup.as_deref(), &token).await }).await?;
            println!("{}", outcome.name);
        }
        Command::List { scope } => {
            let scope = match scope {
                Some(s) => s.parse::<ScopeKey>()?,
                None => engine.scope().clone(),
            };
            for name in engine.list_backups(&scope).await? {
                println!("{}", name);
            }
        }
        Command::Remove { scope, name } => {
            engine.remove_backup(&scope.parse::<ScopeKey>()?, &name).await?;
        }
    }

    Ok(())
}

/// Run `op` with a token that SIGINT/SIGTERM cancels.
async fn cancellable<F, Fut, T>(op: F) -> backup_engine::Result<T>
where
    F: FnOnce(tokio_util::sync::CancellationToken) -> Fut,
    Fut: std::future::Future<Output = backup_engine::Result<T>>,
{
    let shutdown = Arc::new(ShutdownCoordinator::new());
    let signals = {
        let shutdown = Arc::clone(&shutdown);
        tokio::spawn(async move { shutdown.wait_for_signal().await })
    };

    let result = op(shutdown.token()).await;

    shutdown.finish();
    let _ = signals.await;
    result
}
