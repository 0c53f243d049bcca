//! Qualifier-Store: durable session and checkpoint persistence
//!
//! This crate is the persistence layer for batch screening sessions. It
//! records which entities a session covers and an append-only log of
//! per-entity checkpoints, so that a batch interrupted by a crash or a
//! cancellation can be resumed by a different process instance.
//!
//! ## Layer 0 - Data/Persistence
//!
//! Focus: per-key atomic appends, self-describing records, crash-safe
//! session metadata.
//!
//! ## Key Components
//!
//! - `CheckpointStore`: backend-agnostic async trait
//! - `SessionRecord` / `CheckpointRecord`: persisted schema
//! - `FsCheckpointStore`: JSON files on the local filesystem
//! - `fakes::MemoryCheckpointStore`: in-memory fake for tests

mod error;
pub mod fakes;
mod fs_store;
pub mod storage_traits;

pub use error::StorageError;
pub use fs_store::FsCheckpointStore;
pub use storage_traits::{
    CheckpointRecord, CheckpointStore, ContentDigest, EntityEntry, NewCheckpoint, SessionId,
    SessionRecord, SessionStatus, StorageResult,
};
