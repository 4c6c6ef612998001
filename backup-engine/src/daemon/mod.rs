//! Process-level plumbing for the CLI.

pub mod shutdown;
