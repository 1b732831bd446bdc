//! Task graph: dependency edges between blobs and the tasks consuming them.
//!
//! The graph records a consumer edge for every input blob that is not yet
//! Completed at submission. Blob terminal events drain those edges: a
//! completion decrements the dependent's pending-input count (Ready at
//! zero), a failure fails every dependent outright and hands its declared
//! outputs back to the caller for fail-fast propagation.

use crate::blob::BlobStore;
use crate::types::{BlobId, BlobState, PartitionId, SessionId, TaskId, TaskOptions, TaskState};
use gantry_common::{EngineError, FailureCause, Result};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, warn};

/// Fully resolved task definition handed to [`TaskGraph::submit`].
///
/// References are already resolved to blob ids by the session layer; the
/// graph only validates and wires them.
#[derive(Debug, Clone)]
pub struct TaskSpec {
    pub session_id: SessionId,
    /// Ordered input key to blob mapping.
    pub inputs: Vec<(String, BlobId)>,
    /// Output keys whose blobs the graph allocates Pending.
    pub fresh_outputs: Vec<String>,
    /// Output keys bound to caller-allocated Pending blobs.
    pub bound_outputs: Vec<(String, BlobId)>,
    pub partition: PartitionId,
    /// Worker library resolved at dispatch time; `None` selects the default.
    pub library: Option<String>,
    pub options: TaskOptions,
}

/// A task eligible for dispatch, as queued with the scheduler.
#[derive(Debug, Clone)]
pub struct ReadyTask {
    pub task_id: TaskId,
    pub partition: PartitionId,
    pub priority: i32,
    /// Monotonic submission sequence; FIFO tie-break within a priority.
    pub seq: u64,
}

/// Readiness of a task at the end of submission.
#[derive(Debug)]
pub enum Readiness {
    /// One or more inputs still Pending.
    Waiting,
    /// All inputs Completed; enqueue with the scheduler.
    Ready(ReadyTask),
    /// An input was already in Error; the task failed without dispatching.
    Doomed(FailureCause),
}

/// Result of a successful submission.
#[derive(Debug)]
pub struct Submission {
    pub task_id: TaskId,
    pub outputs: HashMap<String, BlobId>,
    pub readiness: Readiness,
}

/// A dependent task failed by an upstream blob error, with the output blobs
/// that must now be failed in turn.
#[derive(Debug)]
pub struct FailedDependent {
    pub task_id: TaskId,
    pub outputs: Vec<BlobId>,
    pub cause: FailureCause,
}

/// Everything the scheduler needs to invoke a task's worker.
#[derive(Debug, Clone)]
pub struct DispatchInfo {
    pub task_id: TaskId,
    pub session_id: SessionId,
    pub inputs: Vec<(String, BlobId)>,
    pub outputs: HashMap<String, BlobId>,
    pub partition: PartitionId,
    pub library: Option<String>,
    pub options: TaskOptions,
    pub attempts: u32,
}

/// Point-in-time snapshot of a task, for callers and tests.
#[derive(Debug, Clone)]
pub struct TaskRecord {
    pub id: TaskId,
    pub session_id: SessionId,
    pub state: TaskState,
    pub attempts: u32,
    pub outputs: HashMap<String, BlobId>,
}

#[derive(Debug)]
struct TaskNode {
    id: TaskId,
    session_id: SessionId,
    inputs: Vec<(String, BlobId)>,
    outputs: HashMap<String, BlobId>,
    partition: PartitionId,
    library: Option<String>,
    options: TaskOptions,
    state: TaskState,
    attempts: u32,
    /// Distinct input blobs not yet observed Completed. Zero means Ready.
    pending_inputs: usize,
    seq: u64,
}

impl TaskNode {
    fn ready_task(&self) -> ReadyTask {
        ReadyTask {
            task_id: self.id,
            partition: self.partition.clone(),
            priority: self.options.priority,
            seq: self.seq,
        }
    }
}

/// In-memory DAG of tasks keyed by blob dependencies.
pub struct TaskGraph {
    store: Arc<BlobStore>,
    tasks: RwLock<HashMap<TaskId, Arc<Mutex<TaskNode>>>>,
    /// Consumer edges: blob -> tasks waiting on it. Presence in this map is
    /// the dedup token for resolving an input exactly once.
    consumers: RwLock<HashMap<BlobId, Vec<TaskId>>>,
    seq: AtomicU64,
}

impl TaskGraph {
    pub fn new(store: Arc<BlobStore>) -> Self {
        Self {
            store,
            tasks: RwLock::new(HashMap::new()),
            consumers: RwLock::new(HashMap::new()),
            seq: AtomicU64::new(0),
        }
    }

    /// Validate and record a task, allocating its fresh output blobs.
    ///
    /// Validation failures (unknown input, output key collision, cycle)
    /// reject the definition before anything is mutated.
    pub async fn submit(&self, spec: TaskSpec) -> Result<Submission> {
        let task_id = TaskId::new();

        // Inputs must reference known blobs of the same session.
        for (key, blob_id) in &spec.inputs {
            let record = self.store.get(blob_id).await.map_err(|_| {
                EngineError::validation(format!(
                    "input '{key}' does not reference a known blob ({blob_id})"
                ))
            })?;
            if record.session_id != spec.session_id {
                return Err(EngineError::validation(format!(
                    "input '{key}' references blob {blob_id} owned by another session"
                )));
            }
        }

        // Output keys must be distinct across fresh and bound declarations.
        let mut output_keys: HashSet<&str> = HashSet::new();
        for key in spec
            .fresh_outputs
            .iter()
            .chain(spec.bound_outputs.iter().map(|(k, _)| k))
        {
            if !output_keys.insert(key.as_str()) {
                return Err(EngineError::validation(format!(
                    "duplicate output key '{key}'"
                )));
            }
        }

        // Bound outputs must be unclaimed Pending blobs of this session.
        for (key, blob_id) in &spec.bound_outputs {
            let record = self.store.get(blob_id).await.map_err(|_| {
                EngineError::validation(format!(
                    "output '{key}' does not reference a known blob ({blob_id})"
                ))
            })?;
            if record.session_id != spec.session_id {
                return Err(EngineError::validation(format!(
                    "output '{key}' references blob {blob_id} owned by another session"
                )));
            }
            if record.state != BlobState::Pending {
                return Err(EngineError::validation(format!(
                    "output '{key}' references blob {blob_id} in state {:?}",
                    record.state
                )));
            }
            if let Some(producer) = record.producer {
                return Err(EngineError::validation(format!(
                    "output '{key}' references blob {blob_id} already produced by task {producer}"
                )));
            }
        }

        self.reject_cycles(&spec).await?;

        // Validation passed; allocate and claim outputs.
        let mut outputs = HashMap::new();
        for key in &spec.fresh_outputs {
            let blob_id = self.store.create(spec.session_id, None).await;
            self.store.claim_producer(&blob_id, task_id).await?;
            outputs.insert(key.clone(), blob_id);
        }
        for (key, blob_id) in &spec.bound_outputs {
            self.store.claim_producer(blob_id, task_id).await?;
            outputs.insert(key.clone(), *blob_id);
        }

        let distinct_inputs: HashSet<BlobId> = spec.inputs.iter().map(|(_, b)| *b).collect();
        let node = Arc::new(Mutex::new(TaskNode {
            id: task_id,
            session_id: spec.session_id,
            inputs: spec.inputs.clone(),
            outputs: outputs.clone(),
            partition: spec.partition,
            library: spec.library,
            options: spec.options,
            state: TaskState::Submitted,
            attempts: 0,
            pending_inputs: distinct_inputs.len(),
            seq: self.seq.fetch_add(1, Ordering::Relaxed),
        }));
        self.tasks.write().await.insert(task_id, node.clone());

        // Register a consumer edge per distinct input, then reconcile with
        // the blob's current state. Edge removal is the dedup token shared
        // with the event-loop path, so a concurrent completion resolves each
        // input exactly once.
        let mut doomed_by: Option<BlobId> = None;
        for blob_id in &distinct_inputs {
            self.consumers
                .write()
                .await
                .entry(*blob_id)
                .or_default()
                .push(task_id);

            match self.store.state(blob_id).await? {
                BlobState::Completed => {
                    self.resolve_input(task_id, blob_id).await;
                }
                BlobState::Error => {
                    doomed_by = Some(*blob_id);
                }
                _ => {}
            }
        }

        if let Some(blob_id) = doomed_by {
            let cause = FailureCause::UpstreamFailed {
                blob_id: blob_id.to_string(),
            };
            let mut guard = node.lock().await;
            guard.state = TaskState::Failed;
            warn!(%task_id, %blob_id, "task failed at submission, input blob already in error");
            return Ok(Submission {
                task_id,
                outputs,
                readiness: Readiness::Doomed(cause),
            });
        }

        let guard = node.lock().await;
        let readiness = if guard.state == TaskState::Ready {
            Readiness::Ready(guard.ready_task())
        } else {
            Readiness::Waiting
        };
        debug!(%task_id, pending = guard.pending_inputs, "task submitted");
        Ok(Submission {
            task_id,
            outputs,
            readiness,
        })
    }

    /// A blob completed: resolve it for every waiting consumer and return
    /// the tasks that became Ready.
    pub async fn on_blob_completed(&self, blob_id: &BlobId) -> Vec<ReadyTask> {
        let waiting = self
            .consumers
            .write()
            .await
            .remove(blob_id)
            .unwrap_or_default();

        let mut ready = Vec::new();
        for task_id in waiting {
            if let Some(ready_task) = self.count_input_resolved(task_id).await {
                ready.push(ready_task);
            }
        }
        ready
    }

    /// A blob failed: every waiting consumer fails directly, without retry
    /// and without ever dispatching. Returns each failed task's declared
    /// outputs so the caller can propagate the error through the store.
    pub async fn on_blob_failed(
        &self,
        blob_id: &BlobId,
        _cause: &FailureCause,
    ) -> Vec<FailedDependent> {
        let waiting = self
            .consumers
            .write()
            .await
            .remove(blob_id)
            .unwrap_or_default();

        let cause = FailureCause::UpstreamFailed {
            blob_id: blob_id.to_string(),
        };

        let mut failed = Vec::new();
        for task_id in waiting {
            let Some(node) = self.node(&task_id).await else {
                continue;
            };
            let mut guard = node.lock().await;
            if guard.state.is_terminal() {
                continue;
            }
            guard.state = TaskState::Failed;
            warn!(%task_id, %blob_id, "task failed, upstream input blob ended in error");
            failed.push(FailedDependent {
                task_id,
                outputs: guard.outputs.values().copied().collect(),
                cause: cause.clone(),
            });
        }
        failed
    }

    /// Everything the scheduler needs to run the task.
    pub async fn dispatch_info(&self, task_id: &TaskId) -> Result<DispatchInfo> {
        let node = self.require_node(task_id).await?;
        let guard = node.lock().await;
        Ok(DispatchInfo {
            task_id: guard.id,
            session_id: guard.session_id,
            inputs: guard.inputs.clone(),
            outputs: guard.outputs.clone(),
            partition: guard.partition.clone(),
            library: guard.library.clone(),
            options: guard.options.clone(),
            attempts: guard.attempts,
        })
    }

    /// Ready -> Dispatched. Rejects tasks that were failed while queued
    /// (e.g. by an upstream error racing the scheduler).
    pub async fn mark_dispatched(&self, task_id: &TaskId) -> Result<()> {
        self.transition(task_id, TaskState::Ready, TaskState::Dispatched)
            .await
    }

    /// Dispatched -> Running.
    pub async fn mark_running(&self, task_id: &TaskId) -> Result<()> {
        self.transition(task_id, TaskState::Dispatched, TaskState::Running)
            .await
    }

    /// Terminal success.
    pub async fn mark_succeeded(&self, task_id: &TaskId) -> Result<()> {
        let node = self.require_node(task_id).await?;
        let mut guard = node.lock().await;
        guard.state = TaskState::Succeeded;
        Ok(())
    }

    /// Terminal failure. Returns the declared outputs to fail.
    pub async fn mark_failed(&self, task_id: &TaskId) -> Result<Vec<BlobId>> {
        let node = self.require_node(task_id).await?;
        let mut guard = node.lock().await;
        guard.state = TaskState::Failed;
        Ok(guard.outputs.values().copied().collect())
    }

    /// Count another attempt and requeue: back to Ready for redispatch.
    pub async fn prepare_retry(&self, task_id: &TaskId) -> Result<ReadyTask> {
        let node = self.require_node(task_id).await?;
        let mut guard = node.lock().await;
        guard.attempts += 1;
        guard.state = TaskState::Ready;
        Ok(guard.ready_task())
    }

    /// Snapshot a task's observable state.
    pub async fn task(&self, task_id: &TaskId) -> Result<TaskRecord> {
        let node = self.require_node(task_id).await?;
        let guard = node.lock().await;
        Ok(TaskRecord {
            id: guard.id,
            session_id: guard.session_id,
            state: guard.state,
            attempts: guard.attempts,
            outputs: guard.outputs.clone(),
        })
    }

    /// Drop every task owned by `session_id`. Called at session teardown.
    pub async fn remove_session_tasks(&self, session_id: SessionId) {
        let mut tasks = self.tasks.write().await;
        let mut removed = HashSet::new();
        for (id, node) in tasks.iter() {
            if node.lock().await.session_id == session_id {
                removed.insert(*id);
            }
        }
        tasks.retain(|id, _| !removed.contains(id));
        drop(tasks);

        let mut consumers = self.consumers.write().await;
        for waiting in consumers.values_mut() {
            waiting.retain(|id| !removed.contains(id));
        }
        consumers.retain(|_, waiting| !waiting.is_empty());
    }

    /// Resolve one input of `task_id` at submission time, deduplicating
    /// against the event-loop path via consumer-edge removal.
    async fn resolve_input(&self, task_id: TaskId, blob_id: &BlobId) {
        let mut consumers = self.consumers.write().await;
        let Some(waiting) = consumers.get_mut(blob_id) else {
            // The event loop already drained this blob's edges.
            return;
        };
        let Some(position) = waiting.iter().position(|id| *id == task_id) else {
            return;
        };
        waiting.remove(position);
        if waiting.is_empty() {
            consumers.remove(blob_id);
        }
        drop(consumers);

        self.count_input_resolved(task_id).await;
    }

    /// Decrement the pending-input count; Submitted -> Ready at zero.
    async fn count_input_resolved(&self, task_id: TaskId) -> Option<ReadyTask> {
        let node = self.node(&task_id).await?;
        let mut guard = node.lock().await;
        if guard.state != TaskState::Submitted {
            // Failed while waiting (upstream error) or already counted.
            return None;
        }
        guard.pending_inputs = guard.pending_inputs.saturating_sub(1);
        if guard.pending_inputs == 0 {
            guard.state = TaskState::Ready;
            debug!(%task_id, "task ready, all inputs resolved");
            return Some(guard.ready_task());
        }
        None
    }

    /// Reject the spec if any bound output transitively feeds back into one
    /// of its inputs. Walks downstream (blob -> consuming tasks -> their
    /// outputs) from each bound output; reaching an input blob is a cycle.
    /// Fresh outputs cannot participate, nobody can reference them yet.
    async fn reject_cycles(&self, spec: &TaskSpec) -> Result<()> {
        if spec.bound_outputs.is_empty() {
            return Ok(());
        }
        let input_blobs: HashSet<BlobId> = spec.inputs.iter().map(|(_, b)| *b).collect();
        let consumers = self.consumers.read().await;
        let tasks = self.tasks.read().await;

        let mut stack: Vec<BlobId> = spec.bound_outputs.iter().map(|(_, b)| *b).collect();
        let mut seen: HashSet<BlobId> = stack.iter().copied().collect();

        while let Some(blob_id) = stack.pop() {
            if input_blobs.contains(&blob_id) {
                return Err(EngineError::cycle(format!(
                    "output blob would transitively feed input blob {blob_id}"
                )));
            }
            let Some(waiting) = consumers.get(&blob_id) else {
                continue;
            };
            for task_id in waiting {
                let Some(node) = tasks.get(task_id) else {
                    continue;
                };
                for output in node.lock().await.outputs.values() {
                    if seen.insert(*output) {
                        stack.push(*output);
                    }
                }
            }
        }
        Ok(())
    }

    async fn transition(&self, task_id: &TaskId, from: TaskState, to: TaskState) -> Result<()> {
        let node = self.require_node(task_id).await?;
        let mut guard = node.lock().await;
        if guard.state != from {
            return Err(EngineError::invalid_state(format!(
                "task {task_id} is {:?}, expected {from:?}",
                guard.state
            )));
        }
        guard.state = to;
        Ok(())
    }

    async fn node(&self, task_id: &TaskId) -> Option<Arc<Mutex<TaskNode>>> {
        self.tasks.read().await.get(task_id).cloned()
    }

    async fn require_node(&self, task_id: &TaskId) -> Result<Arc<Mutex<TaskNode>>> {
        self.node(task_id)
            .await
            .ok_or_else(|| EngineError::not_found(format!("unknown task {task_id}")))
    }
}

impl std::fmt::Debug for TaskGraph {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskGraph").finish()
    }
}
