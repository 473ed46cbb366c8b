//! Backup placement for segment replicas

pub mod selector;

pub use selector::{BackupHost, BackupRoster, BackupSelector, BackupStats};
