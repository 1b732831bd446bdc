//! Retry and failure propagation: a flaky worker that succeeds on its third
//! attempt, and an always-failing task whose error cascades to a dependent
//! task without ever dispatching it.

use gantry_core::{
    EngineError, FnProcessor, GantryContext, SessionConfig, TaskContext, TaskDefinition,
    TaskOptions, WorkerError,
};
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use tracing::info;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt::init();

    info!("=== Gantry Retries and Failures ===");

    let context = GantryContext::default();

    let attempts_seen = Arc::new(AtomicU32::new(0));
    let counter = Arc::clone(&attempts_seen);
    context
        .register_worker(
            "flaky",
            Arc::new(FnProcessor::new(move |ctx: &mut TaskContext| {
                counter.fetch_add(1, Ordering::SeqCst);
                if ctx.attempt() < 2 {
                    return Err(WorkerError::transient("simulated outage"));
                }
                ctx.write_output("value", b"recovered".as_slice())?;
                Ok(())
            })),
        )
        .await;
    context
        .register_worker(
            "broken",
            Arc::new(FnProcessor::new(|_ctx: &mut TaskContext| {
                Err(WorkerError::terminal("unrecoverable input"))
            })),
        )
        .await;
    context
        .register_worker(
            "echo",
            Arc::new(FnProcessor::new(|ctx: &mut TaskContext| {
                let value = ctx.input("value")?.to_vec();
                ctx.write_output("value", value)?;
                Ok(())
            })),
        )
        .await;

    // The flaky task heals within its retry budget.
    let session = context
        .open_session(SessionConfig::with_partition("default"), None)
        .await?;
    let flaky = session
        .submit_task(
            TaskDefinition::new()
                .with_library("flaky")
                .with_output("value")
                .with_options(TaskOptions::default().with_max_retries(3)),
        )
        .await?;
    session.await_outputs_processed().await?;
    let value = session.download_blob(flaky.output("value")?).await?;
    info!(
        "flaky task produced '{}' after {} attempts",
        String::from_utf8(value)?,
        attempts_seen.load(Ordering::SeqCst)
    );
    session.close().await;

    // A terminal failure fails the dependent echo task without dispatch.
    let session = context
        .open_session(SessionConfig::with_partition("default"), None)
        .await?;
    let broken = session
        .submit_task(
            TaskDefinition::new()
                .with_library("broken")
                .with_output("value"),
        )
        .await?;
    session
        .submit_task(
            TaskDefinition::new()
                .with_library("echo")
                .with_input("value", broken.output("value")?)
                .with_output("value"),
        )
        .await?;

    match session.await_outputs_processed().await {
        Err(EngineError::OutputsFailed { failures }) => {
            for failure in failures {
                info!("blob {} failed: {}", failure.blob_id, failure.cause);
            }
        }
        other => info!("unexpected outcome: {other:?}"),
    }

    session.close().await;
    context.shutdown();
    Ok(())
}
