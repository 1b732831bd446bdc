//! Two-level task graph: two independent sums feed a third task that only
//! becomes ready once both upstream outputs complete.

use gantry_core::{
    BlobCompletionListener, CompletedBlob, ErroredBlob, FnProcessor, GantryContext, SessionConfig,
    TaskContext, TaskDefinition, WorkerError,
};
use std::sync::Arc;
use tracing::info;

struct LoggingListener;

impl BlobCompletionListener for LoggingListener {
    fn on_success(&self, blob: CompletedBlob) {
        info!(
            "blob {} completed with {} bytes",
            blob.blob_id,
            blob.data.len()
        );
    }

    fn on_error(&self, blob: ErroredBlob) {
        info!("blob {} failed: {}", blob.blob_id, blob.cause);
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt::init();

    info!("=== Gantry Task Dependencies ===");

    let context = GantryContext::default();
    context
        .register_worker(
            "sum",
            Arc::new(FnProcessor::new(|ctx: &mut TaskContext| {
                let left: i64 = ctx
                    .input_str("left")?
                    .parse()
                    .map_err(|e| WorkerError::terminal(format!("bad left: {e}")))?;
                let right: i64 = ctx
                    .input_str("right")?
                    .parse()
                    .map_err(|e| WorkerError::terminal(format!("bad right: {e}")))?;
                ctx.write_output("sum", (left + right).to_string())?;
                Ok(())
            })),
        )
        .await;

    let session = context
        .open_session(
            SessionConfig::with_partition("default"),
            Some(Arc::new(LoggingListener)),
        )
        .await?;

    // First level: 1 + 2 and 3 + 4, independent of each other.
    let first = session
        .submit_task(
            TaskDefinition::new()
                .with_library("sum")
                .with_input("left", b"1")
                .with_input("right", b"2")
                .with_output("sum"),
        )
        .await?;
    let second = session
        .submit_task(
            TaskDefinition::new()
                .with_library("sum")
                .with_input("left", b"3")
                .with_input("right", b"4")
                .with_output("sum"),
        )
        .await?;

    // Second level: waits for both upstream sums.
    let total = session
        .submit_task(
            TaskDefinition::new()
                .with_library("sum")
                .with_input("left", first.output("sum")?)
                .with_input("right", second.output("sum")?)
                .with_output("sum"),
        )
        .await?;

    session.await_outputs_processed().await?;

    let result = session.download_blob(total.output("sum")?).await?;
    info!("(1 + 2) + (3 + 4) = {}", String::from_utf8(result)?);

    session.close().await;
    context.shutdown();
    Ok(())
}
