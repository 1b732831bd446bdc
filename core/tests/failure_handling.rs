//! Failure paths: terminal errors, retry of transient failures, timeout
//! aborts, output-contract violations, and error propagation to dependents.

mod common;

use common::{
    echo_processor, failing_processor, flaky_processor, init_tracing, silent_processor,
    SlowFirstAttemptProcessor,
};
use gantry_core::{
    EngineError, FailureCause, FnProcessor, GantryContext, SessionConfig, TaskContext,
    TaskDefinition, TaskOptions,
};
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

fn outputs_failed(err: EngineError) -> Vec<gantry_core::BlobFailure> {
    match err {
        EngineError::OutputsFailed { failures } => failures,
        other => panic!("expected OutputsFailed, got {other:?}"),
    }
}

#[tokio::test]
async fn terminal_failure_cascades_to_dependents_without_dispatch() {
    init_tracing();
    let context = GantryContext::default();
    context.register_worker("failing", failing_processor()).await;

    let dependent_ran = Arc::new(AtomicU32::new(0));
    let counter = Arc::clone(&dependent_ran);
    context
        .register_worker(
            "count",
            Arc::new(FnProcessor::new(move |ctx: &mut TaskContext| {
                counter.fetch_add(1, Ordering::SeqCst);
                ctx.write_output("value", b"".as_slice())?;
                Ok(())
            })),
        )
        .await;

    let session = context
        .open_session(SessionConfig::with_partition("default"), None)
        .await
        .unwrap();

    let failing = session
        .submit_task(
            TaskDefinition::new()
                .with_library("failing")
                .with_output("value"),
        )
        .await
        .unwrap();
    let dependent = session
        .submit_task(
            TaskDefinition::new()
                .with_library("count")
                .with_input("value", failing.output("value").unwrap())
                .with_output("value"),
        )
        .await
        .unwrap();

    let failures = outputs_failed(session.await_outputs_processed().await.unwrap_err());
    assert_eq!(failures.len(), 2);

    let failing_id = failing.output("value").unwrap().id().to_string();
    let dependent_id = dependent.output("value").unwrap().id().to_string();

    let direct = failures.iter().find(|f| f.blob_id == failing_id).unwrap();
    assert!(matches!(direct.cause, FailureCause::Application { .. }));

    let cascaded = failures.iter().find(|f| f.blob_id == dependent_id).unwrap();
    assert!(
        matches!(&cascaded.cause, FailureCause::UpstreamFailed { blob_id } if *blob_id == failing_id)
    );

    // The dependent never reached a worker.
    assert_eq!(dependent_ran.load(Ordering::SeqCst), 0);

    session.close().await;
    context.shutdown();
}

#[tokio::test]
async fn transient_failures_retry_until_success() {
    init_tracing();
    let context = GantryContext::default();
    let invocations = Arc::new(AtomicU32::new(0));
    context
        .register_worker("flaky", flaky_processor(2, Arc::clone(&invocations)))
        .await;

    let session = context
        .open_session(SessionConfig::with_partition("default"), None)
        .await
        .unwrap();

    let task = session
        .submit_task(
            TaskDefinition::new()
                .with_library("flaky")
                .with_output("value")
                .with_options(TaskOptions::default().with_max_retries(2)),
        )
        .await
        .unwrap();

    session.await_outputs_processed().await.unwrap();

    // Attempts 0 and 1 failed, attempt 2 succeeded.
    assert_eq!(invocations.load(Ordering::SeqCst), 3);
    let result = session.download_blob(task.output("value").unwrap()).await.unwrap();
    assert_eq!(result, b"ok");

    session.close().await;
    context.shutdown();
}

#[tokio::test]
async fn exhausted_retries_fail_terminally() {
    init_tracing();
    let context = GantryContext::default();
    let invocations = Arc::new(AtomicU32::new(0));
    context
        .register_worker("flaky", flaky_processor(u32::MAX, Arc::clone(&invocations)))
        .await;

    let session = context
        .open_session(SessionConfig::with_partition("default"), None)
        .await
        .unwrap();

    session
        .submit_task(
            TaskDefinition::new()
                .with_library("flaky")
                .with_output("value")
                .with_options(TaskOptions::default().with_max_retries(2)),
        )
        .await
        .unwrap();

    let failures = outputs_failed(session.await_outputs_processed().await.unwrap_err());
    assert_eq!(failures.len(), 1);
    assert!(matches!(
        failures[0].cause,
        FailureCause::RetriesExhausted { attempts: 2, .. }
    ));
    // Attempts 0, 1, and 2 all ran.
    assert_eq!(invocations.load(Ordering::SeqCst), 3);

    session.close().await;
    context.shutdown();
}

#[tokio::test]
async fn timed_out_attempt_is_aborted_and_retried() {
    init_tracing();
    let context = GantryContext::default();
    context
        .register_worker("slow_start", Arc::new(SlowFirstAttemptProcessor))
        .await;

    let session = context
        .open_session(SessionConfig::with_partition("default"), None)
        .await
        .unwrap();

    let task = session
        .submit_task(
            TaskDefinition::new()
                .with_library("slow_start")
                .with_output("value")
                .with_options(
                    TaskOptions::default()
                        .with_max_duration(Duration::from_millis(100))
                        .with_max_retries(1),
                ),
        )
        .await
        .unwrap();

    session.await_outputs_processed().await.unwrap();

    let result = session.download_blob(task.output("value").unwrap()).await.unwrap();
    assert_eq!(result, b"second wind");

    session.close().await;
    context.shutdown();
}

#[tokio::test]
async fn missing_declared_output_is_a_contract_violation() {
    init_tracing();
    let context = GantryContext::default();
    context.register_worker("silent", silent_processor()).await;

    let session = context
        .open_session(SessionConfig::with_partition("default"), None)
        .await
        .unwrap();

    session
        .submit_task(
            TaskDefinition::new()
                .with_library("silent")
                .with_output("value"),
        )
        .await
        .unwrap();

    let failures = outputs_failed(session.await_outputs_processed().await.unwrap_err());
    assert_eq!(failures.len(), 1);
    match &failures[0].cause {
        FailureCause::IncompleteOutputs { missing } => {
            assert_eq!(missing, &vec!["value".to_string()]);
        }
        other => panic!("expected IncompleteOutputs, got {other:?}"),
    }

    session.close().await;
    context.shutdown();
}

#[tokio::test]
async fn unknown_worker_library_fails_the_task() {
    init_tracing();
    let context = GantryContext::default();

    let session = context
        .open_session(SessionConfig::with_partition("default"), None)
        .await
        .unwrap();

    session
        .submit_task(
            TaskDefinition::new()
                .with_library("not_registered")
                .with_output("value"),
        )
        .await
        .unwrap();

    let failures = outputs_failed(session.await_outputs_processed().await.unwrap_err());
    assert_eq!(failures.len(), 1);
    assert!(matches!(
        &failures[0].cause,
        FailureCause::UnknownLibrary { library } if library == "not_registered"
    ));

    session.close().await;
    context.shutdown();
}

#[tokio::test]
async fn worker_panic_is_contained_and_counted_as_a_crash() {
    init_tracing();
    let context = GantryContext::default();
    context
        .register_worker(
            "panicky",
            Arc::new(FnProcessor::new(|_ctx: &mut TaskContext| {
                panic!("worker bug");
            })),
        )
        .await;

    let session = context
        .open_session(SessionConfig::with_partition("default"), None)
        .await
        .unwrap();

    session
        .submit_task(
            TaskDefinition::new()
                .with_library("panicky")
                .with_output("value")
                .with_options(TaskOptions::default().with_max_retries(0)),
        )
        .await
        .unwrap();

    // A crash is retriable; with no retry budget it surfaces as exhaustion.
    let failures = outputs_failed(session.await_outputs_processed().await.unwrap_err());
    assert_eq!(failures.len(), 1);
    assert!(matches!(
        failures[0].cause,
        FailureCause::RetriesExhausted { attempts: 0, .. }
    ));

    session.close().await;
    context.shutdown();
}

#[tokio::test]
async fn dependent_of_retried_task_still_completes() {
    init_tracing();
    let context = GantryContext::default();
    let invocations = Arc::new(AtomicU32::new(0));
    context
        .register_worker("flaky", flaky_processor(1, Arc::clone(&invocations)))
        .await;
    context.register_worker("echo", echo_processor()).await;

    let session = context
        .open_session(SessionConfig::with_partition("default"), None)
        .await
        .unwrap();

    let flaky = session
        .submit_task(
            TaskDefinition::new()
                .with_library("flaky")
                .with_output("value")
                .with_options(TaskOptions::default().with_max_retries(2)),
        )
        .await
        .unwrap();
    let echo = session
        .submit_task(
            TaskDefinition::new()
                .with_library("echo")
                .with_input("value", flaky.output("value").unwrap())
                .with_output("value"),
        )
        .await
        .unwrap();

    session.await_outputs_processed().await.unwrap();

    let result = session.download_blob(echo.output("value").unwrap()).await.unwrap();
    assert_eq!(result, b"ok");
    assert_eq!(invocations.load(Ordering::SeqCst), 2);

    session.close().await;
    context.shutdown();
}
