//! Gantry core: an in-process distributed task-graph execution engine.
//!
//! Callers open a [`Session`] from a [`GantryContext`], create blobs, and
//! submit tasks whose inputs reference those blobs. The engine resolves
//! dependencies as producing tasks complete, dispatches ready tasks to
//! registered [`TaskProcessor`]s under per-partition slot budgets, retries
//! transient failures, and fails dependent tasks fast when an upstream
//! blob ends in error.

pub mod blob;
pub mod context;
pub mod graph;
pub mod scheduler;
pub mod session;
pub mod types;
pub mod worker;

pub use blob::{BlobEvent, BlobRecord, BlobStore};
pub use context::{EngineConfig, GantryContext};
pub use gantry_common::{BlobFailure, EngineError, FailureCause, Result};
pub use graph::{ReadyTask, Readiness, TaskGraph, TaskSpec};
pub use scheduler::{Scheduler, WorkerSlots};
pub use session::{
    BlobCompletionListener, BlobHandle, BlobReference, CompletedBlob, ErroredBlob, Session,
    SessionConfig, TaskDefinition, TaskHandle,
};
pub use types::{BlobId, BlobState, PartitionId, SessionId, TaskId, TaskOptions, TaskState};
pub use worker::{FnProcessor, TaskContext, TaskProcessor, WorkerError, WorkerRegistry};
