//! Worker invocation protocol.
//!
//! A worker implements [`TaskProcessor`]: it reads named input payloads from
//! a [`TaskContext`], computes, and writes named outputs back. The context
//! is the worker's only channel to the engine; a worker cannot touch blobs
//! outside its own declared inputs and outputs.
//!
//! Workers are resolved at dispatch time through a [`WorkerRegistry`] keyed
//! by a library identifier, the in-process stand-in for loading worker
//! images at runtime.

use crate::types::{PartitionId, SessionId, TaskId};
use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::RwLock;
use tracing::debug;

/// Failure reported by a worker body.
///
/// Transient errors (infrastructure hiccups the worker believes may heal)
/// are eligible for redispatch; terminal errors are application failures
/// that retrying cannot fix.
#[derive(Debug, Clone, Error)]
#[error("{message}")]
pub struct WorkerError {
    pub message: String,
    pub retriable: bool,
}

impl WorkerError {
    /// Non-retriable application error.
    pub fn terminal<S: Into<String>>(message: S) -> Self {
        Self {
            message: message.into(),
            retriable: false,
        }
    }

    /// Retriable infrastructure error.
    pub fn transient<S: Into<String>>(message: S) -> Self {
        Self {
            message: message.into(),
            retriable: true,
        }
    }
}

/// Execution context handed to a worker: resolved inputs, task metadata,
/// and the write surface for declared outputs.
#[derive(Debug)]
pub struct TaskContext {
    task_id: TaskId,
    session_id: SessionId,
    partition: PartitionId,
    attempt: u32,
    max_duration: Duration,
    inputs: HashMap<String, Vec<u8>>,
    declared_outputs: HashSet<String>,
    written: HashMap<String, Vec<u8>>,
}

impl TaskContext {
    pub(crate) fn new(
        task_id: TaskId,
        session_id: SessionId,
        partition: PartitionId,
        attempt: u32,
        max_duration: Duration,
        inputs: HashMap<String, Vec<u8>>,
        declared_outputs: HashSet<String>,
    ) -> Self {
        Self {
            task_id,
            session_id,
            partition,
            attempt,
            max_duration,
            inputs,
            declared_outputs,
            written: HashMap::new(),
        }
    }

    pub fn task_id(&self) -> TaskId {
        self.task_id
    }

    pub fn session_id(&self) -> SessionId {
        self.session_id
    }

    pub fn partition(&self) -> &str {
        &self.partition
    }

    /// Zero-based attempt number; nonzero on a redispatch.
    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    pub fn max_duration(&self) -> Duration {
        self.max_duration
    }

    /// Raw bytes of the named input.
    pub fn input(&self, key: &str) -> Result<&[u8], WorkerError> {
        self.inputs
            .get(key)
            .map(|bytes| bytes.as_slice())
            .ok_or_else(|| WorkerError::terminal(format!("no input named '{key}'")))
    }

    /// The named input decoded as UTF-8.
    pub fn input_str(&self, key: &str) -> Result<&str, WorkerError> {
        std::str::from_utf8(self.input(key)?)
            .map_err(|e| WorkerError::terminal(format!("input '{key}' is not valid UTF-8: {e}")))
    }

    /// Keys of the outputs this task declared.
    pub fn declared_outputs(&self) -> impl Iterator<Item = &str> {
        self.declared_outputs.iter().map(String::as_str)
    }

    /// Write the named declared output. Writing an undeclared key is a
    /// contract violation; the last write for a key wins.
    pub fn write_output(
        &mut self,
        key: &str,
        data: impl Into<Vec<u8>>,
    ) -> Result<(), WorkerError> {
        if !self.declared_outputs.contains(key) {
            return Err(WorkerError::terminal(format!(
                "task declared no output named '{key}'"
            )));
        }
        self.written.insert(key.to_string(), data.into());
        Ok(())
    }

    /// Declared outputs the worker has not written yet.
    pub(crate) fn missing_outputs(&self) -> Vec<String> {
        let mut missing: Vec<String> = self
            .declared_outputs
            .iter()
            .filter(|key| !self.written.contains_key(*key))
            .cloned()
            .collect();
        missing.sort();
        missing
    }

    pub(crate) fn into_written(self) -> HashMap<String, Vec<u8>> {
        self.written
    }
}

/// The boundary contract a worker implements: read named inputs, compute,
/// write named outputs, report the outcome.
#[async_trait]
pub trait TaskProcessor: Send + Sync {
    async fn process(&self, ctx: &mut TaskContext) -> Result<(), WorkerError>;
}

/// Adapter turning a plain closure into a [`TaskProcessor`].
pub struct FnProcessor<F> {
    body: F,
}

impl<F> FnProcessor<F>
where
    F: Fn(&mut TaskContext) -> Result<(), WorkerError> + Send + Sync,
{
    pub fn new(body: F) -> Self {
        Self { body }
    }
}

#[async_trait]
impl<F> TaskProcessor for FnProcessor<F>
where
    F: Fn(&mut TaskContext) -> Result<(), WorkerError> + Send + Sync,
{
    async fn process(&self, ctx: &mut TaskContext) -> Result<(), WorkerError> {
        (self.body)(ctx)
    }
}

/// Lookup table from a worker library identifier to its processor.
///
/// Tasks that name no library use the default entry. Resolution happens at
/// dispatch time, so a library registered after submission but before
/// dispatch is still found.
#[derive(Default)]
pub struct WorkerRegistry {
    processors: RwLock<HashMap<String, Arc<dyn TaskProcessor>>>,
    default: RwLock<Option<Arc<dyn TaskProcessor>>>,
}

impl WorkerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a processor under a library identifier.
    pub async fn register(&self, library: impl Into<String>, processor: Arc<dyn TaskProcessor>) {
        let library = library.into();
        debug!(%library, "registered worker library");
        self.processors.write().await.insert(library, processor);
    }

    /// Register the processor used by tasks that name no library.
    pub async fn register_default(&self, processor: Arc<dyn TaskProcessor>) {
        *self.default.write().await = Some(processor);
    }

    /// Resolve the processor for a task's library reference.
    pub async fn resolve(&self, library: Option<&str>) -> Option<Arc<dyn TaskProcessor>> {
        match library {
            Some(name) => self.processors.read().await.get(name).cloned(),
            None => self.default.read().await.clone(),
        }
    }
}

impl std::fmt::Debug for WorkerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerRegistry").finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn context(inputs: &[(&str, &[u8])], outputs: &[&str]) -> TaskContext {
        TaskContext::new(
            TaskId::new(),
            SessionId::new(),
            "default".to_string(),
            0,
            Duration::from_secs(10),
            inputs
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_vec()))
                .collect(),
            outputs.iter().map(|k| k.to_string()).collect(),
        )
    }

    #[test]
    fn test_inputs_by_name() {
        let ctx = context(&[("num1", b"3"), ("num2", b"4")], &["result"]);
        assert_eq!(ctx.input("num1").unwrap(), b"3");
        assert_eq!(ctx.input_str("num2").unwrap(), "4");

        let err = ctx.input("missing").unwrap_err();
        assert!(!err.retriable);
    }

    #[test]
    fn test_undeclared_output_rejected() {
        let mut ctx = context(&[], &["result"]);
        ctx.write_output("result", b"7".to_vec()).unwrap();
        assert!(ctx.write_output("extra", b"x".to_vec()).is_err());
        assert!(ctx.missing_outputs().is_empty());
    }

    #[test]
    fn test_missing_outputs_reported() {
        let ctx = context(&[], &["a", "b"]);
        assert_eq!(ctx.missing_outputs(), vec!["a".to_string(), "b".to_string()]);
    }

    #[tokio::test]
    async fn test_registry_resolution() {
        let registry = WorkerRegistry::new();
        assert!(registry.resolve(None).await.is_none());
        assert!(registry.resolve(Some("sum")).await.is_none());

        let sum = Arc::new(FnProcessor::new(|ctx: &mut TaskContext| {
            let a: i64 = ctx
                .input_str("num1")?
                .parse()
                .map_err(|e| WorkerError::terminal(format!("num1: {e}")))?;
            let b: i64 = ctx
                .input_str("num2")?
                .parse()
                .map_err(|e| WorkerError::terminal(format!("num2: {e}")))?;
            ctx.write_output("result", (a + b).to_string().into_bytes())
        }));
        registry.register("sum", sum.clone()).await;
        registry.register_default(sum).await;

        let processor = registry.resolve(Some("sum")).await.unwrap();
        let mut ctx = context(&[("num1", b"3"), ("num2", b"4")], &["result"]);
        processor.process(&mut ctx).await.unwrap();
        assert_eq!(ctx.into_written()["result"], b"7".to_vec());

        assert!(registry.resolve(None).await.is_some());
    }
}
