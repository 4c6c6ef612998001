//! Backup Engine Library
//!
//! Backup and restore of a database node's data directory through an
//! optional external transform hook, with all-or-nothing backups and
//! MANIFEST-driven restores.

pub mod config;
pub mod daemon;
pub mod executor;
pub mod fs;
pub mod node;
pub mod storage;
pub mod transfer;
pub mod transform;
pub mod utils;

// Re-export commonly used types
pub use config::Config;
pub use executor::BackupEngine;
pub use utils::errors::{EngineError, Result};
