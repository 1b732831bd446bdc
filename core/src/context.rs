//! GantryContext - the engine facade.
//!
//! Owns the blob store, task graph, worker registry, and scheduler, and
//! runs the engine event loop that turns blob terminal events into
//! dependency resolution, listener delivery, and session await bookkeeping.

use crate::blob::{BlobEvent, BlobStore};
use crate::scheduler::{Scheduler, WorkerSlots};
use crate::session::{
    AwaitState, BlobCompletionListener, CompletedBlob, ErroredBlob, Session, SessionConfig,
    SessionShared,
};
use crate::graph::TaskGraph;
use crate::types::{BlobId, SessionId};
use crate::worker::{TaskProcessor, WorkerRegistry};
use gantry_common::{BlobFailure, EngineError, FailureCause, Result};
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::{Mutex, Notify, RwLock, mpsc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// Process-wide engine configuration, built once and passed by reference
/// into the components that need it.
#[derive(Debug, Clone, Default)]
pub struct EngineConfig {
    /// Worker slot budget per partition.
    pub worker_slots: WorkerSlots,
}

/// Engine internals shared between the context, sessions, and the event loop.
pub(crate) struct EngineShared {
    pub(crate) store: Arc<BlobStore>,
    pub(crate) graph: Arc<TaskGraph>,
    pub(crate) scheduler: Scheduler,
    pub(crate) registry: Arc<WorkerRegistry>,
    pub(crate) sessions: RwLock<HashMap<SessionId, Arc<SessionShared>>>,
}

impl EngineShared {
    /// Drop a session's registration, tasks, and blobs.
    pub(crate) async fn release_session(&self, session_id: SessionId) {
        self.sessions.write().await.remove(&session_id);
        self.graph.remove_session_tasks(session_id).await;
        self.store.remove_session_blobs(session_id).await;
        debug!(%session_id, "released session resources");
    }
}

/// Entry point for callers: register workers, open sessions, shut down.
pub struct GantryContext {
    shared: Arc<EngineShared>,
    cancel: CancellationToken,
}

impl GantryContext {
    pub fn new(config: EngineConfig) -> Self {
        let (store, blob_events) = BlobStore::new();
        let store = Arc::new(store);
        let graph = Arc::new(TaskGraph::new(Arc::clone(&store)));
        let registry = Arc::new(WorkerRegistry::new());
        let cancel = CancellationToken::new();

        let scheduler = Scheduler::start(
            Arc::clone(&store),
            Arc::clone(&graph),
            Arc::clone(&registry),
            config.worker_slots,
            cancel.child_token(),
        );

        let shared = Arc::new(EngineShared {
            store,
            graph,
            scheduler,
            registry,
            sessions: RwLock::new(HashMap::new()),
        });

        let loop_shared = Arc::clone(&shared);
        let loop_cancel = cancel.child_token();
        tokio::spawn(async move {
            event_loop(loop_shared, blob_events, loop_cancel).await;
            info!("engine event loop stopped");
        });

        Self { shared, cancel }
    }

    /// Register a worker processor under a library identifier.
    pub async fn register_worker(
        &self,
        library: impl Into<String>,
        processor: Arc<dyn TaskProcessor>,
    ) {
        self.shared.registry.register(library, processor).await;
    }

    /// Register the processor used by tasks that name no library.
    pub async fn register_default_worker(&self, processor: Arc<dyn TaskProcessor>) {
        self.shared.registry.register_default(processor).await;
    }

    /// Open a session bound to the configured partitions, registering the
    /// listener for every terminal blob event under the session.
    pub async fn open_session(
        &self,
        config: SessionConfig,
        listener: Option<Arc<dyn BlobCompletionListener>>,
    ) -> Result<Session> {
        if config.partitions.is_empty() {
            return Err(EngineError::validation(
                "session must allow at least one partition",
            ));
        }
        if !config.partitions.contains(&config.default_partition) {
            return Err(EngineError::validation(format!(
                "default partition '{}' is not in the allowed set",
                config.default_partition
            )));
        }

        let session_id = SessionId::new();
        let shared = Arc::new(SessionShared {
            listener,
            await_state: Mutex::new(AwaitState::default()),
            drained: Notify::new(),
            closed: AtomicBool::new(false),
        });
        self.shared
            .sessions
            .write()
            .await
            .insert(session_id, Arc::clone(&shared));

        info!(%session_id, partitions = ?config.partitions, "opened session");
        Ok(Session::new(
            session_id,
            config,
            Arc::clone(&self.shared),
            shared,
        ))
    }

    /// Stop the scheduler and event loop. In-flight worker bodies are
    /// abandoned; no further events are processed.
    pub fn shutdown(&self) {
        self.cancel.cancel();
    }
}

impl Default for GantryContext {
    fn default() -> Self {
        Self::new(EngineConfig::default())
    }
}

impl Drop for GantryContext {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

impl std::fmt::Debug for GantryContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GantryContext").finish()
    }
}


/// Single consumer of blob terminal events. Processing order here is what
/// gives the causal chain: blob completion, then dependency resolution,
/// then task readiness.
async fn event_loop(
    shared: Arc<EngineShared>,
    mut events: mpsc::UnboundedReceiver<BlobEvent>,
    cancel: CancellationToken,
) {
    loop {
        let event = tokio::select! {
            _ = cancel.cancelled() => break,
            event = events.recv() => match event {
                Some(event) => event,
                None => break,
            },
        };

        match event {
            BlobEvent::Completed {
                blob_id,
                session_id,
                data,
            } => {
                for ready in shared.graph.on_blob_completed(&blob_id).await {
                    shared.scheduler.enqueue(ready);
                }

                let session = shared.sessions.read().await.get(&session_id).cloned();
                if let Some(session) = session {
                    if let Some(listener) = &session.listener {
                        listener.on_success(CompletedBlob { blob_id, data });
                    }
                    note_terminal_blob(&shared, session_id, &session, blob_id, None).await;
                }
            }
            BlobEvent::Failed {
                blob_id,
                session_id,
                cause,
            } => {
                // Fail-fast cascade: dependents of the failed blob fail
                // without dispatching, and failing their outputs re-enters
                // this loop until the affected chain is drained.
                for dependent in shared.graph.on_blob_failed(&blob_id, &cause).await {
                    for output in dependent.outputs {
                        let _ = shared.store.fail(&output, dependent.cause.clone()).await;
                    }
                }

                let session = shared.sessions.read().await.get(&session_id).cloned();
                if let Some(session) = session {
                    if let Some(listener) = &session.listener {
                        listener.on_error(ErroredBlob {
                            blob_id,
                            cause: cause.clone(),
                        });
                    }
                    note_terminal_blob(&shared, session_id, &session, blob_id, Some(cause)).await;
                }
            }
        }
    }
}

/// Session await bookkeeping for one terminal blob. Waking waiters on the
/// last outstanding output also releases a session that already closed.
async fn note_terminal_blob(
    shared: &Arc<EngineShared>,
    session_id: SessionId,
    session: &Arc<SessionShared>,
    blob_id: BlobId,
    failure: Option<FailureCause>,
) {
    let mut state = session.await_state.lock().await;
    if !state.outstanding.remove(&blob_id) {
        return;
    }
    if let Some(cause) = failure {
        state.failures.push(BlobFailure {
            blob_id: blob_id.to_string(),
            cause,
        });
    }
    if state.outstanding.is_empty() {
        drop(state);
        session.drained.notify_waiters();
        if session.closed.load(Ordering::SeqCst) {
            shared.release_session(session_id).await;
        }
    }
}
