//! Scheduler: per-partition ready queues and bounded worker slots.
//!
//! The dispatch loop is purely event-driven. It wakes on a task becoming
//! Ready or on a slot being freed by a finished attempt, pops the
//! highest-priority queued task (FIFO within a priority level) for any
//! partition with a free slot, and spawns the worker invocation. There is
//! no polling interval anywhere on this path.

use crate::blob::BlobStore;
use crate::graph::{DispatchInfo, ReadyTask, TaskGraph};
use crate::types::{BlobId, PartitionId, TaskId};
use crate::worker::{TaskContext, WorkerRegistry};
use gantry_common::FailureCause;
use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashMap};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Worker slot budget per partition.
#[derive(Debug, Clone)]
pub struct WorkerSlots {
    per_partition: HashMap<PartitionId, usize>,
    default_slots: usize,
}

impl WorkerSlots {
    pub fn new(default_slots: usize) -> Self {
        Self {
            per_partition: HashMap::new(),
            default_slots: default_slots.max(1),
        }
    }

    pub fn with_partition(mut self, partition: impl Into<PartitionId>, slots: usize) -> Self {
        self.per_partition.insert(partition.into(), slots.max(1));
        self
    }

    fn slots_for(&self, partition: &str) -> usize {
        self.per_partition
            .get(partition)
            .copied()
            .unwrap_or(self.default_slots)
    }
}

impl Default for WorkerSlots {
    fn default() -> Self {
        Self::new(num_cpus::get())
    }
}

/// Queue entry ordered by priority (descending), then submission order.
#[derive(Debug, Clone)]
struct QueuedTask {
    priority: i32,
    seq: u64,
    task_id: TaskId,
}

impl PartialEq for QueuedTask {
    fn eq(&self, other: &Self) -> bool {
        self.priority == other.priority && self.seq == other.seq
    }
}
impl Eq for QueuedTask {}

impl Ord for QueuedTask {
    fn cmp(&self, other: &Self) -> Ordering {
        // Max-heap: higher priority first, then lower sequence (FIFO).
        self.priority
            .cmp(&other.priority)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

impl PartialOrd for QueuedTask {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// Result of one execution attempt, reported back to the dispatch loop.
#[derive(Debug)]
enum AttemptOutcome {
    Success(HashMap<String, Vec<u8>>),
    Failure(FailureCause),
}

enum SchedulerEvent {
    TaskReady(ReadyTask),
    AttemptFinished {
        task_id: TaskId,
        partition: PartitionId,
        max_retries: u32,
        attempts: u32,
        outputs: HashMap<String, BlobId>,
        outcome: AttemptOutcome,
    },
}

/// Handle to the dispatch loop.
#[derive(Clone)]
pub struct Scheduler {
    events: mpsc::UnboundedSender<SchedulerEvent>,
}

impl Scheduler {
    /// Spawn the dispatch loop and return its handle.
    pub fn start(
        store: Arc<BlobStore>,
        graph: Arc<TaskGraph>,
        registry: Arc<WorkerRegistry>,
        slots: WorkerSlots,
        cancel: CancellationToken,
    ) -> Self {
        let (events, receiver) = mpsc::unbounded_channel();
        let scheduler = Self {
            events: events.clone(),
        };

        let mut rt = DispatchLoop {
            store,
            graph,
            registry,
            slots,
            events,
            queues: HashMap::new(),
            free_slots: HashMap::new(),
        };
        tokio::spawn(async move {
            rt.run(receiver, cancel).await;
            info!("scheduler dispatch loop stopped");
        });
        scheduler
    }

    /// Queue a Ready task for dispatch.
    pub fn enqueue(&self, ready: ReadyTask) {
        if self.events.send(SchedulerEvent::TaskReady(ready)).is_err() {
            warn!("scheduler is stopped, dropping ready task");
        }
    }
}

impl std::fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Scheduler").finish()
    }
}

struct DispatchLoop {
    store: Arc<BlobStore>,
    graph: Arc<TaskGraph>,
    registry: Arc<WorkerRegistry>,
    slots: WorkerSlots,
    events: mpsc::UnboundedSender<SchedulerEvent>,
    queues: HashMap<PartitionId, BinaryHeap<QueuedTask>>,
    free_slots: HashMap<PartitionId, usize>,
}

impl DispatchLoop {
    async fn run(
        &mut self,
        mut receiver: mpsc::UnboundedReceiver<SchedulerEvent>,
        cancel: CancellationToken,
    ) {
        loop {
            let event = tokio::select! {
                _ = cancel.cancelled() => break,
                event = receiver.recv() => match event {
                    Some(event) => event,
                    None => break,
                },
            };

            match event {
                SchedulerEvent::TaskReady(ready) => {
                    let partition = ready.partition.clone();
                    self.queues
                        .entry(partition.clone())
                        .or_default()
                        .push(QueuedTask {
                            priority: ready.priority,
                            seq: ready.seq,
                            task_id: ready.task_id,
                        });
                    self.dispatch(&partition).await;
                }
                SchedulerEvent::AttemptFinished {
                    task_id,
                    partition,
                    max_retries,
                    attempts,
                    outputs,
                    outcome,
                } => {
                    self.finish_attempt(task_id, max_retries, attempts, outputs, outcome)
                        .await;
                    // The attempt's slot is free again.
                    *self.free_slots.entry(partition.clone()).or_insert(0) += 1;
                    self.dispatch(&partition).await;
                }
            }
        }
    }

    /// Hand queued tasks to workers while the partition has free slots.
    async fn dispatch(&mut self, partition: &str) {
        let available = self
            .free_slots
            .entry(partition.to_string())
            .or_insert_with(|| self.slots.slots_for(partition));

        while *available > 0 {
            let Some(queue) = self.queues.get_mut(partition) else {
                return;
            };
            let Some(next) = queue.pop() else {
                return;
            };

            // A task failed while queued (upstream error) is skipped without
            // consuming a slot.
            if self.graph.mark_dispatched(&next.task_id).await.is_err() {
                debug!(task_id = %next.task_id, "skipping queued task no longer dispatchable");
                continue;
            }

            let info = match self.graph.dispatch_info(&next.task_id).await {
                Ok(info) => info,
                Err(e) => {
                    error!(task_id = %next.task_id, error = %e, "failed to load dispatch info");
                    continue;
                }
            };

            *available -= 1;
            debug!(task_id = %next.task_id, partition, "dispatching task");

            let store = Arc::clone(&self.store);
            let graph = Arc::clone(&self.graph);
            let registry = Arc::clone(&self.registry);
            let events = self.events.clone();
            tokio::spawn(async move {
                let outcome = run_attempt(&store, &graph, &registry, &info).await;
                let _ = events.send(SchedulerEvent::AttemptFinished {
                    task_id: info.task_id,
                    partition: info.partition.clone(),
                    max_retries: info.options.max_retries,
                    attempts: info.attempts,
                    outputs: info.outputs.clone(),
                    outcome,
                });
            });
        }
    }

    /// Apply an attempt's outcome: complete outputs, or retry, or fail
    /// terminally and propagate the cause to every declared output.
    async fn finish_attempt(
        &mut self,
        task_id: TaskId,
        max_retries: u32,
        attempts: u32,
        outputs: HashMap<String, BlobId>,
        outcome: AttemptOutcome,
    ) {
        match outcome {
            AttemptOutcome::Success(written) => {
                // The task must read Succeeded before any output turns
                // Completed, so no observer sees a finished output on a
                // still-running task.
                if let Err(e) = self.graph.mark_succeeded(&task_id).await {
                    error!(%task_id, error = %e, "failed to mark task succeeded");
                }
                for (key, blob_id) in &outputs {
                    // Completeness was verified by the attempt; a written map
                    // missing a key here would be an engine bug.
                    let Some(data) = written.get(key) else {
                        error!(%task_id, key, "verified output missing from written set");
                        continue;
                    };
                    if let Err(e) = self.store.complete(blob_id, data.clone()).await {
                        error!(%task_id, %blob_id, error = %e, "failed to complete output blob");
                    }
                }
                info!(%task_id, "task succeeded");
            }
            AttemptOutcome::Failure(cause) => {
                if cause.is_retriable() && attempts < max_retries {
                    match self.graph.prepare_retry(&task_id).await {
                        Ok(ready) => {
                            warn!(
                                %task_id,
                                attempt = attempts + 1,
                                max_retries,
                                %cause,
                                "re-queueing task after transient failure"
                            );
                            self.queues
                                .entry(ready.partition.clone())
                                .or_default()
                                .push(QueuedTask {
                                    priority: ready.priority,
                                    seq: ready.seq,
                                    task_id: ready.task_id,
                                });
                            return;
                        }
                        Err(e) => {
                            error!(%task_id, error = %e, "failed to re-queue task");
                        }
                    }
                }

                let terminal_cause = if cause.is_retriable() {
                    FailureCause::RetriesExhausted {
                        attempts,
                        last: cause.to_string(),
                    }
                } else {
                    cause
                };
                error!(%task_id, cause = %terminal_cause, "task failed terminally");

                match self.graph.mark_failed(&task_id).await {
                    Ok(declared) => {
                        for blob_id in declared {
                            if let Err(e) =
                                self.store.fail(&blob_id, terminal_cause.clone()).await
                            {
                                error!(%task_id, %blob_id, error = %e, "failed to fail output blob");
                            }
                        }
                    }
                    Err(e) => error!(%task_id, error = %e, "failed to mark task failed"),
                }
            }
        }
    }
}

/// Execute one attempt: resolve inputs, run the worker under the task's
/// max-duration budget, and classify the outcome.
async fn run_attempt(
    store: &Arc<BlobStore>,
    graph: &Arc<TaskGraph>,
    registry: &Arc<WorkerRegistry>,
    info: &DispatchInfo,
) -> AttemptOutcome {
    if let Err(e) = graph.mark_running(&info.task_id).await {
        return AttemptOutcome::Failure(FailureCause::WorkerCrash {
            message: format!("task vanished before execution: {e}"),
        });
    }

    let mut inputs = HashMap::new();
    for (key, blob_id) in &info.inputs {
        match store.get(blob_id).await {
            Ok(record) => match record.payload {
                Some(bytes) => {
                    inputs.insert(key.clone(), bytes);
                }
                None => {
                    // Dispatch happens strictly after all inputs complete.
                    return AttemptOutcome::Failure(FailureCause::WorkerCrash {
                        message: format!("input blob {blob_id} has no payload at dispatch"),
                    });
                }
            },
            Err(e) => {
                return AttemptOutcome::Failure(FailureCause::WorkerCrash {
                    message: format!("input blob {blob_id} unavailable: {e}"),
                });
            }
        }
    }

    let Some(processor) = registry.resolve(info.library.as_deref()).await else {
        return AttemptOutcome::Failure(FailureCause::UnknownLibrary {
            library: info.library.clone().unwrap_or_else(|| "<default>".to_string()),
        });
    };

    let ctx = TaskContext::new(
        info.task_id,
        info.session_id,
        info.partition.clone(),
        info.attempts,
        info.options.max_duration,
        inputs,
        info.outputs.keys().cloned().collect(),
    );

    // The worker body runs in its own tokio task so a panic is contained to
    // this attempt, and so an expired deadline can abort it.
    let body = tokio::spawn(async move {
        let mut ctx = ctx;
        match processor.process(&mut ctx).await {
            Ok(()) => Ok(ctx),
            Err(e) => Err(e),
        }
    });
    let aborter = body.abort_handle();

    match timeout(info.options.max_duration, body).await {
        Err(_) => {
            aborter.abort();
            warn!(task_id = %info.task_id, "task exceeded max duration");
            AttemptOutcome::Failure(FailureCause::Timeout)
        }
        Ok(Err(join_error)) => AttemptOutcome::Failure(FailureCause::WorkerCrash {
            message: format!("worker body panicked: {join_error}"),
        }),
        Ok(Ok(Err(worker_error))) => {
            if worker_error.retriable {
                AttemptOutcome::Failure(FailureCause::WorkerCrash {
                    message: worker_error.message,
                })
            } else {
                AttemptOutcome::Failure(FailureCause::Application {
                    message: worker_error.message,
                })
            }
        }
        Ok(Ok(Ok(ctx))) => {
            let missing = ctx.missing_outputs();
            if missing.is_empty() {
                AttemptOutcome::Success(ctx.into_written())
            } else {
                AttemptOutcome::Failure(FailureCause::IncompleteOutputs { missing })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_queue_orders_by_priority_then_fifo() {
        let mut heap = BinaryHeap::new();
        let low_first = TaskId::new();
        let high = TaskId::new();
        let low_second = TaskId::new();

        heap.push(QueuedTask {
            priority: 0,
            seq: 1,
            task_id: low_first,
        });
        heap.push(QueuedTask {
            priority: 5,
            seq: 2,
            task_id: high,
        });
        heap.push(QueuedTask {
            priority: 0,
            seq: 3,
            task_id: low_second,
        });

        assert_eq!(heap.pop().unwrap().task_id, high);
        assert_eq!(heap.pop().unwrap().task_id, low_first);
        assert_eq!(heap.pop().unwrap().task_id, low_second);
    }

    #[test]
    fn test_slot_budget_lookup() {
        let slots = WorkerSlots::new(4).with_partition("gpu", 2);
        assert_eq!(slots.slots_for("gpu"), 2);
        assert_eq!(slots.slots_for("anything-else"), 4);

        // A zero budget would deadlock the partition; clamp to one.
        let slots = WorkerSlots::new(0).with_partition("tiny", 0);
        assert_eq!(slots.slots_for("tiny"), 1);
        assert_eq!(slots.slots_for("other"), 1);
    }
}
