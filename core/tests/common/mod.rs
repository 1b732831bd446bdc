//! Common helpers for the engine integration tests.

use async_trait::async_trait;
use gantry_core::{FnProcessor, TaskContext, TaskProcessor, WorkerError};
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt::try_init();
}

/// Parses the "left" and "right" inputs as integers and writes their sum
/// to the "sum" output.
#[allow(dead_code)]
pub fn sum_processor() -> Arc<dyn TaskProcessor> {
    Arc::new(FnProcessor::new(|ctx: &mut TaskContext| {
        let left: i64 = parse_int(ctx, "left")?;
        let right: i64 = parse_int(ctx, "right")?;
        ctx.write_output("sum", (left + right).to_string())?;
        Ok(())
    }))
}

/// Copies the "value" input to the "value" output.
#[allow(dead_code)]
pub fn echo_processor() -> Arc<dyn TaskProcessor> {
    Arc::new(FnProcessor::new(|ctx: &mut TaskContext| {
        let value = ctx.input("value")?.to_vec();
        ctx.write_output("value", value)?;
        Ok(())
    }))
}

/// Fails with a transient error while the attempt number is below
/// `fail_below`, then writes "value". Counts every invocation.
#[allow(dead_code)]
pub fn flaky_processor(fail_below: u32, invocations: Arc<AtomicU32>) -> Arc<dyn TaskProcessor> {
    Arc::new(FnProcessor::new(move |ctx: &mut TaskContext| {
        invocations.fetch_add(1, Ordering::SeqCst);
        if ctx.attempt() < fail_below {
            return Err(WorkerError::transient("simulated infrastructure failure"));
        }
        ctx.write_output("value", b"ok".as_slice())?;
        Ok(())
    }))
}

/// Always fails with a terminal application error.
#[allow(dead_code)]
pub fn failing_processor() -> Arc<dyn TaskProcessor> {
    Arc::new(FnProcessor::new(|_ctx: &mut TaskContext| {
        Err(WorkerError::terminal("bad input data"))
    }))
}

/// Reports success without writing any declared output.
#[allow(dead_code)]
pub fn silent_processor() -> Arc<dyn TaskProcessor> {
    Arc::new(FnProcessor::new(|_ctx: &mut TaskContext| Ok(())))
}

/// Sleeps for a fixed duration, then writes "value".
#[allow(dead_code)]
pub struct SleepProcessor {
    pub delay: Duration,
}

#[async_trait]
impl TaskProcessor for SleepProcessor {
    async fn process(&self, ctx: &mut TaskContext) -> Result<(), WorkerError> {
        tokio::time::sleep(self.delay).await;
        ctx.write_output("value", b"slow".as_slice())?;
        Ok(())
    }
}

/// Sleeps past any reasonable deadline on the first attempt, then succeeds
/// immediately on later attempts.
#[allow(dead_code)]
pub struct SlowFirstAttemptProcessor;

#[async_trait]
impl TaskProcessor for SlowFirstAttemptProcessor {
    async fn process(&self, ctx: &mut TaskContext) -> Result<(), WorkerError> {
        if ctx.attempt() == 0 {
            tokio::time::sleep(Duration::from_secs(60)).await;
        }
        ctx.write_output("value", b"second wind".as_slice())?;
        Ok(())
    }
}

#[allow(dead_code)]
fn parse_int(ctx: &TaskContext, key: &str) -> Result<i64, WorkerError> {
    ctx.input_str(key)?
        .parse()
        .map_err(|e| WorkerError::terminal(format!("input '{key}' is not an integer: {e}")))
}
