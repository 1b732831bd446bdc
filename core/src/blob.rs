//! Blob store: session-owned byte payloads with a single terminal transition.
//!
//! Blobs are the unit of data flowing between tasks. A blob created with
//! inline data completes immediately; a blob allocated for a declared task
//! output stays Pending until its producer finishes. Every terminal
//! transition emits a [`BlobEvent`] consumed by the engine event loop, which
//! is the sole trigger for downstream scheduling.

use crate::types::{BlobId, BlobState, SessionId, TaskId};
use gantry_common::{EngineError, FailureCause, Result};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock, mpsc};
use tracing::{debug, warn};

/// Terminal blob transition, delivered to the engine event loop.
#[derive(Debug, Clone)]
pub enum BlobEvent {
    Completed {
        blob_id: BlobId,
        session_id: SessionId,
        data: Vec<u8>,
    },
    Failed {
        blob_id: BlobId,
        session_id: SessionId,
        cause: FailureCause,
    },
}

/// Point-in-time snapshot of a blob.
#[derive(Debug, Clone)]
pub struct BlobRecord {
    pub id: BlobId,
    pub session_id: SessionId,
    pub state: BlobState,
    /// Payload bytes, present once the blob is Completed.
    pub payload: Option<Vec<u8>>,
    /// Failure cause, present once the blob is Error.
    pub cause: Option<FailureCause>,
    /// The task whose declared output this blob is, if any.
    pub producer: Option<TaskId>,
}

/// Mutable state of a single blob, guarded by its own lock.
#[derive(Debug)]
struct SlotInner {
    state: BlobState,
    payload: Option<Vec<u8>>,
    cause: Option<FailureCause>,
    producer: Option<TaskId>,
}

/// One blob. The per-slot mutex makes the transition out of Pending
/// single-writer without serializing unrelated blobs.
#[derive(Debug)]
struct BlobSlot {
    session_id: SessionId,
    inner: Mutex<SlotInner>,
}

/// Store of all blobs across sessions.
#[derive(Debug)]
pub struct BlobStore {
    slots: RwLock<HashMap<BlobId, Arc<BlobSlot>>>,
    events: mpsc::UnboundedSender<BlobEvent>,
}

impl BlobStore {
    /// Create a store together with the receiving end of its event channel.
    pub fn new() -> (Self, mpsc::UnboundedReceiver<BlobEvent>) {
        let (events, receiver) = mpsc::unbounded_channel();
        (
            Self {
                slots: RwLock::new(HashMap::new()),
                events,
            },
            receiver,
        )
    }

    /// Create a blob. Inline data completes the blob immediately; `None`
    /// allocates a Pending blob to be produced later (a declared task output
    /// or a caller-allocated result).
    pub async fn create(&self, session_id: SessionId, data: Option<Vec<u8>>) -> BlobId {
        let blob_id = BlobId::new();
        let (state, payload) = match data {
            Some(bytes) => (BlobState::Completed, Some(bytes)),
            None => (BlobState::Pending, None),
        };

        let slot = Arc::new(BlobSlot {
            session_id,
            inner: Mutex::new(SlotInner {
                state,
                payload: payload.clone(),
                cause: None,
                producer: None,
            }),
        });
        self.slots.write().await.insert(blob_id, slot);
        debug!(%blob_id, ?state, "created blob");

        // Inline data is a completion like any other; consumers registered
        // later observe the terminal state directly, so the event is only
        // informational for listeners.
        if let Some(bytes) = payload {
            self.emit(BlobEvent::Completed {
                blob_id,
                session_id,
                data: bytes,
            });
        }
        blob_id
    }

    /// Record `task_id` as the producer of a Pending blob.
    ///
    /// Fails if the blob is already terminal or already has a producer;
    /// a blob has at most one producing task.
    pub async fn claim_producer(&self, blob_id: &BlobId, task_id: TaskId) -> Result<()> {
        let slot = self.slot(blob_id).await?;
        let mut inner = slot.inner.lock().await;
        if inner.state != BlobState::Pending {
            return Err(EngineError::invalid_state(format!(
                "blob {blob_id} is {:?}, only Pending blobs can be bound as outputs",
                inner.state
            )));
        }
        if let Some(existing) = inner.producer {
            return Err(EngineError::validation(format!(
                "blob {blob_id} is already the output of task {existing}"
            )));
        }
        inner.producer = Some(task_id);
        Ok(())
    }

    /// Store `data` and mark the blob Completed. Pending-only.
    pub async fn complete(&self, blob_id: &BlobId, data: Vec<u8>) -> Result<()> {
        let slot = self.slot(blob_id).await?;
        let mut inner = slot.inner.lock().await;
        if inner.state != BlobState::Pending {
            return Err(EngineError::invalid_state(format!(
                "cannot complete blob {blob_id} in state {:?}",
                inner.state
            )));
        }
        inner.state = BlobState::Completed;
        inner.payload = Some(data.clone());
        drop(inner);

        debug!(%blob_id, "blob completed");
        self.emit(BlobEvent::Completed {
            blob_id: *blob_id,
            session_id: slot.session_id,
            data,
        });
        Ok(())
    }

    /// Mark the blob Error with `cause`. Pending-only.
    pub async fn fail(&self, blob_id: &BlobId, cause: FailureCause) -> Result<()> {
        let slot = self.slot(blob_id).await?;
        let mut inner = slot.inner.lock().await;
        if inner.state != BlobState::Pending {
            return Err(EngineError::invalid_state(format!(
                "cannot fail blob {blob_id} in state {:?}",
                inner.state
            )));
        }
        inner.state = BlobState::Error;
        inner.cause = Some(cause.clone());
        drop(inner);

        debug!(%blob_id, %cause, "blob failed");
        self.emit(BlobEvent::Failed {
            blob_id: *blob_id,
            session_id: slot.session_id,
            cause,
        });
        Ok(())
    }

    /// Snapshot the blob's current state and payload.
    pub async fn get(&self, blob_id: &BlobId) -> Result<BlobRecord> {
        let slot = self.slot(blob_id).await?;
        let inner = slot.inner.lock().await;
        Ok(BlobRecord {
            id: *blob_id,
            session_id: slot.session_id,
            state: inner.state,
            payload: inner.payload.clone(),
            cause: inner.cause.clone(),
            producer: inner.producer,
        })
    }

    /// Current state of the blob.
    pub async fn state(&self, blob_id: &BlobId) -> Result<BlobState> {
        let slot = self.slot(blob_id).await?;
        let inner = slot.inner.lock().await;
        Ok(inner.state)
    }

    /// Session owning the blob.
    pub async fn session_of(&self, blob_id: &BlobId) -> Result<SessionId> {
        Ok(self.slot(blob_id).await?.session_id)
    }

    /// Drop every blob owned by `session_id`. Called at session teardown.
    pub async fn remove_session_blobs(&self, session_id: SessionId) {
        let mut slots = self.slots.write().await;
        slots.retain(|_, slot| slot.session_id != session_id);
    }

    async fn slot(&self, blob_id: &BlobId) -> Result<Arc<BlobSlot>> {
        self.slots
            .read()
            .await
            .get(blob_id)
            .cloned()
            .ok_or_else(|| EngineError::not_found(format!("unknown blob {blob_id}")))
    }

    fn emit(&self, event: BlobEvent) {
        if self.events.send(event).is_err() {
            // Only happens after engine shutdown when the loop is gone.
            warn!("blob event dropped, engine event loop is not running");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tracing_test::traced_test;

    #[tokio::test]
    async fn test_inline_blob_is_completed_immediately() {
        let (store, mut events) = BlobStore::new();
        let session = SessionId::new();

        let blob_id = store.create(session, Some(b"7".to_vec())).await;
        let record = store.get(&blob_id).await.unwrap();
        assert_eq!(record.state, BlobState::Completed);
        assert_eq!(record.payload.as_deref(), Some(b"7".as_slice()));

        match events.recv().await.unwrap() {
            BlobEvent::Completed { blob_id: id, data, .. } => {
                assert_eq!(id, blob_id);
                assert_eq!(data, b"7".to_vec());
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_pending_blob_completes_once() {
        let (store, _events) = BlobStore::new();
        let session = SessionId::new();

        let blob_id = store.create(session, None).await;
        assert_eq!(store.state(&blob_id).await.unwrap(), BlobState::Pending);

        store.complete(&blob_id, b"out".to_vec()).await.unwrap();
        assert_eq!(store.state(&blob_id).await.unwrap(), BlobState::Completed);

        // Second terminal transition is rejected, in either direction.
        assert!(matches!(
            store.complete(&blob_id, b"again".to_vec()).await,
            Err(EngineError::InvalidState { .. })
        ));
        assert!(matches!(
            store.fail(&blob_id, FailureCause::Timeout).await,
            Err(EngineError::InvalidState { .. })
        ));
    }

    #[tokio::test]
    #[traced_test]
    async fn test_failed_blob_keeps_cause() {
        let (store, _events) = BlobStore::new();
        let blob_id = store.create(SessionId::new(), None).await;

        store
            .fail(
                &blob_id,
                FailureCause::Application {
                    message: "bad operand".to_string(),
                },
            )
            .await
            .unwrap();

        let record = store.get(&blob_id).await.unwrap();
        assert_eq!(record.state, BlobState::Error);
        assert!(record.payload.is_none());
        assert!(matches!(
            record.cause,
            Some(FailureCause::Application { .. })
        ));

        assert!(matches!(
            store.complete(&blob_id, b"late".to_vec()).await,
            Err(EngineError::InvalidState { .. })
        ));
        assert!(logs_contain("blob failed"));
    }

    #[tokio::test]
    async fn test_completed_reads_are_idempotent() {
        let (store, _events) = BlobStore::new();
        let blob_id = store.create(SessionId::new(), Some(b"stable".to_vec())).await;

        let first = store.get(&blob_id).await.unwrap().payload;
        let second = store.get(&blob_id).await.unwrap().payload;
        assert_eq!(first, second);
        assert_eq!(first.as_deref(), Some(b"stable".as_slice()));
    }

    #[tokio::test]
    async fn test_unknown_blob_is_not_found() {
        let (store, _events) = BlobStore::new();
        assert!(matches!(
            store.get(&BlobId::new()).await,
            Err(EngineError::NotFound { .. })
        ));
    }

    #[tokio::test]
    async fn test_producer_claimed_once() {
        let (store, _events) = BlobStore::new();
        let blob_id = store.create(SessionId::new(), None).await;

        let task_a = TaskId::new();
        store.claim_producer(&blob_id, task_a).await.unwrap();
        assert_eq!(store.get(&blob_id).await.unwrap().producer, Some(task_a));

        assert!(matches!(
            store.claim_producer(&blob_id, TaskId::new()).await,
            Err(EngineError::Validation { .. })
        ));
    }

    #[tokio::test]
    async fn test_completed_blob_cannot_be_bound_as_output() {
        let (store, _events) = BlobStore::new();
        let blob_id = store.create(SessionId::new(), Some(b"x".to_vec())).await;

        assert!(matches!(
            store.claim_producer(&blob_id, TaskId::new()).await,
            Err(EngineError::InvalidState { .. })
        ));
    }
}
