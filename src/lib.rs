//! # tierweave
//!
//! A hierarchical memory store with recipe-driven workflows on top.
//!
//! Records live in namespaces (`project/context_type/memory_type`) across
//! three tiers, short-term, working and long-term, each with its own
//! retention. Every write appends a revision; nothing is mutated in place.
//!
//! ## Quick Start
//!
//! ```ignore
//! use tierweave::prelude::*;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let weave = Weave::in_memory().await?;
//!     let ns: Namespace = "acme/research/interviews".parse()?;
//!
//!     weave.put(&ns, Tier::Working, "p1", json!({"quote": "pricing is confusing"}))?;
//!     let record = weave.get(&ns, Tier::Working, "p1").await?;
//!     println!("rev {}: {:?}", record.revision, record.value);
//!
//!     weave.promote(&ns, "p1", Tier::Working, Tier::LongTerm)?;
//!     Ok(())
//! }
//! ```
//!
//! ## Architecture
//!
//! Leaves first:
//!
//! 1. [`CompressionEngine`] - threshold-based compression with a
//!    decompression cache
//! 2. [`TieredStore`] - revisioned, namespaced storage with an optional
//!    journal on disk
//! 3. [`CacheLayer`] - write-through LRU with per-key locking
//! 4. [`BackupManager`] - encrypted snapshots with daily/weekly/monthly
//!    retention
//! 5. [`IntegrityValidator`] - checks plus cache, backup and rebuild recovery
//! 6. [`WorkflowEngine`] - runs recipe step graphs with checkpoints
//! 7. [`BatchCoordinator`] - runs one recipe over many inputs on a bounded
//!    worker pool
//!
//! [`Weave`] assembles all of them from a [`WeaveConfig`].

pub mod backup;
pub mod batch;
pub mod cache;
pub mod compression;
pub mod config;
pub mod error;
pub mod integrity;
pub mod persistence;
pub mod recipe;
pub mod retry;
pub mod schema;
pub mod search;
pub mod storage;
pub mod tool;
pub mod types;
pub mod watch;
pub mod weave;
pub mod workflow;

pub use backup::{BackupManager, BackupSnapshot, RetentionClass, SnapshotScope};
pub use batch::{BatchCoordinator, BatchJob, BatchReport, ItemStatus, JobStatus, Progress};
pub use cache::CacheLayer;
pub use compression::{Algorithm, CompressionEngine};
pub use config::WeaveConfig;
pub use error::{WeaveError, WeaveResult};
pub use integrity::{IntegrityValidator, RecoveryOutcome, RecoveryStage, ValidationReport};
pub use recipe::Recipe;
pub use search::{SearchHit, SearchOptions, SearchQuery};
pub use storage::TieredStore;
pub use tool::{FnTool, Tool, ToolInvocation, ToolOutput, ToolRegistry};
pub use types::{MemoryRecord, MemoryValue, Namespace, Tier};
pub use watch::DirectoryWatcher;
pub use weave::{Weave, WeaveStats};
pub use workflow::{Decision, RunInput, RunReport, RunStatus, WorkflowEngine};

// Re-export commonly used external types for convenience
pub use chrono::{DateTime, Utc};
pub use serde_json::{Value as JsonValue, json};

/// Prelude module for convenient imports.
///
/// ```ignore
/// use tierweave::prelude::*;
/// ```
pub mod prelude {
    pub use crate::backup::SnapshotScope;
    pub use crate::batch::{BatchJob, JobStatus};
    pub use crate::config::WeaveConfig;
    pub use crate::error::{WeaveError, WeaveResult};
    pub use crate::recipe::Recipe;
    pub use crate::search::{SearchOptions, SearchQuery};
    pub use crate::tool::{FnTool, Tool, ToolInvocation, ToolOutput};
    pub use crate::types::{MemoryRecord, MemoryValue, Namespace, Tier};
    pub use crate::weave::Weave;
    pub use crate::workflow::{Decision, RunInput, RunStatus};
    pub use chrono::{DateTime, Utc};
    pub use serde_json::{Value as JsonValue, json};
}
