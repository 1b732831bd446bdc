//! Minimal end-to-end run: one session, one task, one output.

use gantry_core::{FnProcessor, GantryContext, SessionConfig, TaskContext, TaskDefinition};
use std::sync::Arc;
use tracing::info;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt::init();

    info!("=== Gantry Hello World ===");

    let context = GantryContext::default();
    context
        .register_default_worker(Arc::new(FnProcessor::new(|ctx: &mut TaskContext| {
            let name = ctx.input_str("name")?;
            ctx.write_output("greeting", format!("Hello, {name}!"))?;
            Ok(())
        })))
        .await;

    let session = context
        .open_session(SessionConfig::with_partition("default"), None)
        .await?;
    info!("Opened session {}", session.id());

    let task = session
        .submit_task(
            TaskDefinition::new()
                .with_input("name", b"World")
                .with_output("greeting"),
        )
        .await?;
    info!("Submitted task {}", task.task_id());

    session.await_outputs_processed().await?;

    let greeting = session.download_blob(task.output("greeting")?).await?;
    info!("Result: {}", String::from_utf8(greeting)?);

    session.close().await;
    context.shutdown();
    Ok(())
}
