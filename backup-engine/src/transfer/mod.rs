//! Stream plumbing shared by backup and restore.

pub mod digest;
