//! # memkv coordinator
//!
//! Cluster-membership coordinator for a distributed in-memory key-value
//! store:
//! - Authoritative server registry (masters and backups) with durable,
//!   replayable mutations
//! - Asynchronous fan-out of membership deltas to every subscribed server
//! - Replication grouping and backup placement for segment replicas
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────┐
//! │              Coordinator                     │
//! │  server registry + versioned update buffer   │
//! │  (durable log replayed on failover)          │
//! └───────┬───────────────────┬──────────────────┘
//!         │ enlist/down RPCs  │ pushed deltas / full lists
//!   ┌─────┴─────┐      ┌──────┴─────┬─────────────┐
//!   │           │      │            │             │
//! ┌─▼────────┐ ┌▼─────────┐  ┌──────▼───┐   ┌─────▼────┐
//! │ Master 1 │ │ Master 2 │  │ Backup 1 │   │ Backup 2 │
//! └──────────┘ └──────────┘  └──────────┘   └──────────┘
//! ```
//!
//! ## Usage
//!
//! ```bash
//! memkv-coord serve \
//!   --bind 0.0.0.0:5100 \
//!   --admin 0.0.0.0:5180 \
//!   --log ./coord-log
//! ```

pub mod common;
pub mod coordinator;
pub mod placement;

// Re-export commonly used types
pub use common::{CoordinatorConfig, Error, Result};
pub use coordinator::{Coordinator, CoordinatorServerList};
pub use placement::BackupSelector;

// Generated protobuf code
pub mod proto {
    tonic::include_proto!("memkv");
}

/// Current version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
