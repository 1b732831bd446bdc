//! Sessions: the caller-facing scope for blobs and tasks.
//!
//! A session binds a set of allowed partitions and a default task
//! configuration, resolves task definitions into graph submissions, and
//! tracks every declared task output so `await_outputs_processed` can block
//! until the whole workload drains.

use crate::context::EngineShared;
use crate::graph::{Readiness, TaskSpec};
use crate::types::{BlobId, BlobState, PartitionId, SessionId, TaskId, TaskOptions};
use gantry_common::{BlobFailure, EngineError, FailureCause, Result};
use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::{Mutex, Notify};
use tracing::{debug, info};

/// Session-level configuration: allowed partitions and task defaults.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub partitions: HashSet<PartitionId>,
    pub default_partition: PartitionId,
    pub default_options: TaskOptions,
}

impl SessionConfig {
    /// Configuration with a single allowed partition used as the default.
    pub fn with_partition(partition: impl Into<PartitionId>) -> Self {
        let partition = partition.into();
        Self {
            partitions: HashSet::from([partition.clone()]),
            default_partition: partition,
            default_options: TaskOptions::default(),
        }
    }

    pub fn allow_partition(mut self, partition: impl Into<PartitionId>) -> Self {
        self.partitions.insert(partition.into());
        self
    }

    pub fn default_options(mut self, options: TaskOptions) -> Self {
        self.default_options = options;
        self
    }
}

/// A blob completed under this session.
#[derive(Debug, Clone)]
pub struct CompletedBlob {
    pub blob_id: BlobId,
    pub data: Vec<u8>,
}

/// A blob under this session ended in error.
#[derive(Debug, Clone)]
pub struct ErroredBlob {
    pub blob_id: BlobId,
    pub cause: FailureCause,
}

/// Observer for terminal blob events of a session.
///
/// Called from the engine event loop after the store transition committed;
/// each blob produces exactly one terminal call.
pub trait BlobCompletionListener: Send + Sync {
    fn on_success(&self, blob: CompletedBlob);
    fn on_error(&self, blob: ErroredBlob);
}

/// Reference to a blob owned by a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BlobHandle {
    id: BlobId,
}

impl BlobHandle {
    pub(crate) fn new(id: BlobId) -> Self {
        Self { id }
    }

    pub fn id(&self) -> BlobId {
        self.id
    }
}

/// Input reference in a task definition: inline bytes, a file to read at
/// submission, or a handle from a prior blob creation or task output.
#[derive(Debug, Clone)]
pub enum BlobReference {
    Inline(Vec<u8>),
    File(PathBuf),
    Handle(BlobHandle),
}

impl From<Vec<u8>> for BlobReference {
    fn from(data: Vec<u8>) -> Self {
        Self::Inline(data)
    }
}

impl From<&[u8]> for BlobReference {
    fn from(data: &[u8]) -> Self {
        Self::Inline(data.to_vec())
    }
}

impl<const N: usize> From<&[u8; N]> for BlobReference {
    fn from(data: &[u8; N]) -> Self {
        Self::Inline(data.to_vec())
    }
}

impl From<BlobHandle> for BlobReference {
    fn from(handle: BlobHandle) -> Self {
        Self::Handle(handle)
    }
}

/// Caller-specified description of a task prior to submission.
#[derive(Debug, Clone, Default)]
pub struct TaskDefinition {
    inputs: Vec<(String, BlobReference)>,
    outputs: Vec<String>,
    bound_outputs: Vec<(String, BlobHandle)>,
    library: Option<String>,
    options: Option<TaskOptions>,
}

impl TaskDefinition {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_input(mut self, key: impl Into<String>, reference: impl Into<BlobReference>) -> Self {
        self.inputs.push((key.into(), reference.into()));
        self
    }

    /// Declare an output; the engine allocates its blob at submission.
    pub fn with_output(mut self, key: impl Into<String>) -> Self {
        self.outputs.push(key.into());
        self
    }

    /// Declare an output bound to a caller-allocated pending blob.
    pub fn with_bound_output(mut self, key: impl Into<String>, handle: BlobHandle) -> Self {
        self.bound_outputs.push((key.into(), handle));
        self
    }

    /// Select a worker library; unset tasks use the default processor.
    pub fn with_library(mut self, library: impl Into<String>) -> Self {
        self.library = Some(library.into());
        self
    }

    /// Override the session's default task options wholesale.
    pub fn with_options(mut self, options: TaskOptions) -> Self {
        self.options = Some(options);
        self
    }
}

/// Handle to a submitted task; exposes its declared output blobs so later
/// submissions can reference them as inputs.
#[derive(Debug, Clone)]
pub struct TaskHandle {
    task_id: TaskId,
    outputs: HashMap<String, BlobHandle>,
}

impl TaskHandle {
    pub fn task_id(&self) -> TaskId {
        self.task_id
    }

    pub fn outputs(&self) -> &HashMap<String, BlobHandle> {
        &self.outputs
    }

    /// The blob handle for one declared output key.
    pub fn output(&self, key: &str) -> Result<BlobHandle> {
        self.outputs
            .get(key)
            .copied()
            .ok_or_else(|| EngineError::not_found(format!("task has no output named '{key}'")))
    }
}

/// Await bookkeeping: the declared outputs not yet terminal, and the
/// failures observed so far.
#[derive(Debug, Default)]
pub(crate) struct AwaitState {
    pub(crate) outstanding: HashSet<BlobId>,
    pub(crate) failures: Vec<BlobFailure>,
}

/// Session state shared with the engine event loop.
pub(crate) struct SessionShared {
    pub(crate) listener: Option<Arc<dyn BlobCompletionListener>>,
    pub(crate) await_state: Mutex<AwaitState>,
    pub(crate) drained: Notify,
    /// Set by [`Session::close`]. A closed session that finishes draining
    /// is released by the event loop.
    pub(crate) closed: AtomicBool,
}

/// A caller's scope for submitting blobs and tasks.
pub struct Session {
    id: SessionId,
    config: SessionConfig,
    engine: Arc<EngineShared>,
    shared: Arc<SessionShared>,
}

impl Session {
    pub(crate) fn new(
        id: SessionId,
        config: SessionConfig,
        engine: Arc<EngineShared>,
        shared: Arc<SessionShared>,
    ) -> Self {
        Self {
            id,
            config,
            engine,
            shared,
        }
    }

    pub fn id(&self) -> SessionId {
        self.id
    }

    /// Create a blob from inline data; Completed immediately.
    pub async fn create_blob(&self, data: impl Into<Vec<u8>>) -> Result<BlobHandle> {
        self.ensure_open()?;
        let blob_id = self.engine.store.create(self.id, Some(data.into())).await;
        Ok(BlobHandle::new(blob_id))
    }

    /// Create a blob from a file's contents.
    pub async fn create_blob_from_file(&self, path: impl Into<PathBuf>) -> Result<BlobHandle> {
        self.ensure_open()?;
        let path = path.into();
        let data = tokio::fs::read(&path).await.map_err(|e| {
            EngineError::internal_with_source(
                format!("failed to read blob file {}", path.display()),
                e,
            )
        })?;
        let blob_id = self.engine.store.create(self.id, Some(data)).await;
        Ok(BlobHandle::new(blob_id))
    }

    /// Allocate a Pending blob to be produced later, typically bound as a
    /// task output with [`TaskDefinition::with_bound_output`].
    pub async fn create_pending_blob(&self) -> Result<BlobHandle> {
        self.ensure_open()?;
        let blob_id = self.engine.store.create(self.id, None).await;
        Ok(BlobHandle::new(blob_id))
    }

    /// Resolve and submit a task definition.
    pub async fn submit_task(&self, definition: TaskDefinition) -> Result<TaskHandle> {
        self.ensure_open()?;

        let options = definition
            .options
            .unwrap_or_else(|| self.config.default_options.clone());
        let partition = options
            .partition
            .clone()
            .unwrap_or_else(|| self.config.default_partition.clone());
        if !self.config.partitions.contains(&partition) {
            return Err(EngineError::validation(format!(
                "partition '{partition}' is not allowed by this session"
            )));
        }

        let mut inputs = Vec::with_capacity(definition.inputs.len());
        for (key, reference) in definition.inputs {
            let blob_id = match reference {
                BlobReference::Inline(data) => self.engine.store.create(self.id, Some(data)).await,
                BlobReference::File(path) => {
                    let data = tokio::fs::read(&path).await.map_err(|e| {
                        EngineError::internal_with_source(
                            format!("failed to read input file {}", path.display()),
                            e,
                        )
                    })?;
                    self.engine.store.create(self.id, Some(data)).await
                }
                BlobReference::Handle(handle) => handle.id(),
            };
            inputs.push((key, blob_id));
        }

        let submission = self
            .engine
            .graph
            .submit(TaskSpec {
                session_id: self.id,
                inputs,
                fresh_outputs: definition.outputs,
                bound_outputs: definition
                    .bound_outputs
                    .into_iter()
                    .map(|(key, handle)| (key, handle.id()))
                    .collect(),
                partition,
                library: definition.library,
                options,
            })
            .await?;

        // Register the declared outputs before acting on readiness.
        {
            let mut state = self.shared.await_state.lock().await;
            state.outstanding.extend(submission.outputs.values().copied());
        }

        match submission.readiness {
            Readiness::Ready(ready) => self.engine.scheduler.enqueue(ready),
            Readiness::Waiting => {}
            Readiness::Doomed(cause) => {
                for blob_id in submission.outputs.values() {
                    // A racing failure of the same blob is already terminal.
                    let _ = self.engine.store.fail(blob_id, cause.clone()).await;
                }
            }
        }

        // The graph wired this task's consumer edges before the outputs were
        // registered above, so an upstream completion in that window can run
        // the task all the way to terminal events that found nothing to
        // settle. Re-read the registered outputs and settle any that are
        // already terminal.
        let registered: Vec<BlobId> = submission.outputs.values().copied().collect();
        self.settle_terminal_outputs(&registered).await;

        debug!(session_id = %self.id, task_id = %submission.task_id, "task submitted");
        Ok(TaskHandle {
            task_id: submission.task_id,
            outputs: submission
                .outputs
                .into_iter()
                .map(|(key, blob_id)| (key, BlobHandle::new(blob_id)))
                .collect(),
        })
    }

    /// Settle outstanding outputs whose terminal event fired before their
    /// registration was visible to the event loop. Shares the
    /// `outstanding.remove` dedup token with the event-loop path, so each
    /// blob is settled exactly once whichever side gets there first.
    async fn settle_terminal_outputs(&self, outputs: &[BlobId]) {
        for blob_id in outputs {
            let Ok(record) = self.engine.store.get(blob_id).await else {
                continue;
            };
            if !record.state.is_terminal() {
                continue;
            }
            let mut state = self.shared.await_state.lock().await;
            if !state.outstanding.remove(blob_id) {
                continue;
            }
            if record.state == BlobState::Error {
                state.failures.push(BlobFailure {
                    blob_id: blob_id.to_string(),
                    cause: record.cause.unwrap_or(FailureCause::Application {
                        message: "failure cause not recorded".to_string(),
                    }),
                });
            }
            if state.outstanding.is_empty() {
                drop(state);
                self.shared.drained.notify_waiters();
                if self.shared.closed.load(Ordering::SeqCst) {
                    self.engine.release_session(self.id).await;
                }
            }
        }
    }

    /// Fetch a Completed blob's payload. Repeated calls return identical
    /// bytes; terminal blobs never change.
    pub async fn download_blob(&self, handle: BlobHandle) -> Result<Vec<u8>> {
        let record = self.engine.store.get(&handle.id()).await?;
        match record.state {
            BlobState::Completed => record.payload.ok_or_else(|| {
                EngineError::internal("completed blob is missing its payload")
            }),
            BlobState::Error => Err(EngineError::invalid_state(format!(
                "blob {} ended in error: {}",
                handle.id(),
                record
                    .cause
                    .map(|c| c.to_string())
                    .unwrap_or_else(|| "unknown cause".to_string())
            ))),
            state => Err(EngineError::invalid_state(format!(
                "blob {} is not completed (state: {state:?})",
                handle.id()
            ))),
        }
    }

    /// Current state of a blob owned by this session.
    pub async fn blob_state(&self, handle: BlobHandle) -> Result<BlobState> {
        self.engine.store.state(&handle.id()).await
    }

    /// Block until every declared task output of this session is terminal.
    ///
    /// Returns `Ok(())` when all outputs Completed; otherwise an aggregate
    /// error listing every output blob that ended in Error.
    pub async fn await_outputs_processed(&self) -> Result<()> {
        loop {
            let drained = self.shared.drained.notified();
            {
                let state = self.shared.await_state.lock().await;
                if state.outstanding.is_empty() {
                    if state.failures.is_empty() {
                        return Ok(());
                    }
                    return Err(EngineError::OutputsFailed {
                        failures: state.failures.clone(),
                    });
                }
            }
            drained.await;
        }
    }

    /// Like [`Self::await_outputs_processed`] but gives up after `deadline`,
    /// returning a timeout error without perturbing any task state.
    pub async fn await_outputs_processed_with_deadline(&self, deadline: Duration) -> Result<()> {
        tokio::time::timeout(deadline, self.await_outputs_processed())
            .await
            .map_err(|_| {
                EngineError::timeout(format!(
                    "outputs not processed within {deadline:?}"
                ))
            })?
    }

    /// Stop accepting submissions. If the session is already fully drained
    /// its blobs and tasks are released immediately; otherwise in-flight
    /// tasks drain and the engine releases it on the last terminal event.
    pub async fn close(&self) {
        if self.shared.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        info!(session_id = %self.id, "session closed");

        let drained = self.shared.await_state.lock().await.outstanding.is_empty();
        if drained {
            self.engine.release_session(self.id).await;
        }
    }

    /// Whether `close` has been called.
    pub fn is_closed(&self) -> bool {
        self.shared.closed.load(Ordering::SeqCst)
    }

    fn ensure_open(&self) -> Result<()> {
        if self.shared.closed.load(Ordering::SeqCst) {
            return Err(EngineError::SessionClosed);
        }
        Ok(())
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("closed", &self.is_closed())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::GantryContext;

    #[tokio::test]
    async fn test_outputs_terminal_before_registration_still_settle() {
        let context = GantryContext::default();
        let session = context
            .open_session(SessionConfig::with_partition("default"), None)
            .await
            .unwrap();

        // Both blobs reach their terminal state before the await bookkeeping
        // learns about them, as when a producer finishes inside the
        // submission window.
        let completed = session.create_blob(b"done".to_vec()).await.unwrap();
        let failed = session.create_pending_blob().await.unwrap();
        session
            .engine
            .store
            .fail(&failed.id(), FailureCause::Timeout)
            .await
            .unwrap();

        {
            let mut state = session.shared.await_state.lock().await;
            state.outstanding.insert(completed.id());
            state.outstanding.insert(failed.id());
        }
        session
            .settle_terminal_outputs(&[completed.id(), failed.id()])
            .await;

        // Without the settling pass these blobs would stay outstanding
        // forever and this await would hang.
        let err = session.await_outputs_processed().await.unwrap_err();
        match err {
            EngineError::OutputsFailed { failures } => {
                assert_eq!(failures.len(), 1);
                assert_eq!(failures[0].blob_id, failed.id().to_string());
                assert_eq!(failures[0].cause, FailureCause::Timeout);
            }
            other => panic!("expected OutputsFailed, got {other:?}"),
        }

        context.shutdown();
    }

    #[tokio::test]
    async fn test_settling_skips_blobs_still_pending() {
        let context = GantryContext::default();
        let session = context
            .open_session(SessionConfig::with_partition("default"), None)
            .await
            .unwrap();

        let pending = session.create_pending_blob().await.unwrap();
        {
            let mut state = session.shared.await_state.lock().await;
            state.outstanding.insert(pending.id());
        }
        session.settle_terminal_outputs(&[pending.id()]).await;

        let state = session.shared.await_state.lock().await;
        assert!(state.outstanding.contains(&pending.id()));
        assert!(state.failures.is_empty());
        drop(state);

        context.shutdown();
    }
}
