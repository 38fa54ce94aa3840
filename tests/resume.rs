//! Restarting a process against durable storage.

use std::sync::atomic::Ordering;
use std::sync::Arc;

use serde_json::{json, Value};
use stepwise::{
    Edge, FunctionSpec, KernelEvent, ProcessBuilder, ProcessContext, ProcessInfo,
    ProcessStateRecord, ProcessStorage, RuntimeConfig, RuntimeServices, SqliteStorage,
    StepwiseError, Termination,
};
use stepwise_test_utils::{init_tracing, FnStep, RecordingObserver};

/// Adds `amount` to a running total kept in the step's persisted state.
fn counter() -> FnStep {
    FnStep::new(vec![FunctionSpec::new("add").param("amount")], |_, args, ctx| {
        let total: i64 = ctx.state_as()?.unwrap_or(0);
        let total = total + args.get_as::<i64>("amount")?;
        ctx.set_state(&total)?;
        Ok(json!(total))
    })
}

fn echo() -> FnStep {
    FnStep::new(vec![FunctionSpec::new("run").param("input")], |_, args, _| {
        Ok(args.get("input").cloned().unwrap_or(Value::Null))
    })
}

fn ledger(counter: FnStep) -> ProcessInfo {
    ProcessBuilder::new("Ledger")
        .add_step(counter.into_info("Counter").with_state("total", 0))
        .add_step(echo().into_info("Audit"))
        .on_input_event("Deposit", Edge::to_function("Counter", "add"))
        .build()
        .unwrap()
}

fn sqlite_services(path: &std::path::Path) -> (Arc<SqliteStorage>, RuntimeServices) {
    let storage = Arc::new(SqliteStorage::open(path).unwrap());
    let services = RuntimeServices::default().with_storage(storage.clone());
    (storage, services)
}

#[tokio::test]
async fn test_restart_reuses_child_ids_and_step_state() {
    init_tracing();
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("ledger.db");

    let (first_counter, first_audit) = {
        let (_, services) = sqlite_services(&path);
        let context = ProcessContext::with_id(ledger(counter()), "ledger-1", services);
        context
            .run_once(KernelEvent::new("Deposit").with_data(json!(5)))
            .await
            .unwrap();
        let ids = (
            context.process().child_id("Counter").await.unwrap(),
            context.process().child_id("Audit").await.unwrap(),
        );
        context.close().await.unwrap();
        ids
    };

    let observer = RecordingObserver::new();
    let (_, services) = sqlite_services(&path);
    let context = ProcessContext::with_id(
        ledger(counter()),
        "ledger-1",
        services.with_observer(observer.clone()),
    );
    context.process().initialize().await.unwrap();
    assert_eq!(
        context.process().child_id("Counter").await.as_deref(),
        Some(first_counter.as_str())
    );
    assert_eq!(
        context.process().child_id("Audit").await.as_deref(),
        Some(first_audit.as_str())
    );

    context
        .run_once(KernelEvent::new("Deposit").with_data(json!(3)))
        .await
        .unwrap();
    let result = observer.find("Counter.add.OnResult").unwrap();
    assert_eq!(result.data, Some(json!(8)));

    let snapshot = context.get_state().await.unwrap();
    let counter_state = snapshot.find("Counter").unwrap();
    assert_eq!(counter_state.id, first_counter);
    assert_eq!(counter_state.state.value, Some(json!(8)));
}

#[tokio::test]
async fn test_fresh_instance_gets_fresh_ids() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("ledger.db");

    let (_, services_a) = sqlite_services(&path);
    let a = ProcessContext::with_id(ledger(counter()), "ledger-a", services_a);
    a.process().initialize().await.unwrap();

    let (_, services_b) = sqlite_services(&path);
    let b = ProcessContext::with_id(ledger(counter()), "ledger-b", services_b);
    b.process().initialize().await.unwrap();

    let id_a = a.process().child_id("Counter").await.unwrap();
    let id_b = b.process().child_id("Counter").await.unwrap();
    assert_ne!(id_a, id_b);
    assert!(id_a.starts_with("ledger-a"));
}

#[tokio::test]
async fn test_pending_messages_survive_step_limit() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("chain.db");
    let tail = echo();
    let tail_calls = tail.calls();

    let chain = |tail: FnStep| {
        ProcessBuilder::new("Chain")
            .add_step(
                echo()
                    .into_info("Head")
                    .on_function_result("run", Edge::to_function("Tail", "run")),
            )
            .add_step(tail.into_info("Tail"))
            .on_input_event("Start", Edge::to_function("Head", "run"))
            .build()
            .unwrap()
    };

    {
        let mut config = RuntimeConfig::default();
        config.process.max_supersteps = 1;
        let storage = Arc::new(SqliteStorage::open(&path).unwrap());
        let services = RuntimeServices::new(config).with_storage(storage);
        let context = ProcessContext::with_id(chain(tail.clone()), "chain-1", services);
        let outcome = context
            .run_once(KernelEvent::new("Start").with_data(json!("x")))
            .await
            .unwrap();
        assert_eq!(outcome.termination, Termination::StepLimit);
        assert_eq!(tail_calls.load(Ordering::SeqCst), 0);
        context.close().await.unwrap();
    }

    let (storage, services) = sqlite_services(&path);
    let record = storage
        .get_process_state("Chain", "chain-1")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(record.pending_messages.len(), 1);
    assert_eq!(record.pending_messages[0].destination, "Tail");

    let context = ProcessContext::with_id(chain(tail), "chain-1", services);
    let outcome = context.run_once(KernelEvent::new("Resume")).await.unwrap();
    assert_eq!(outcome.termination, Termination::Quiescent);
    assert_eq!(tail_calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_mismatched_persisted_identity_is_rejected() {
    let storage = Arc::new(SqliteStorage::in_memory().unwrap());
    storage
        .save_process_state(
            "Ledger",
            "ledger-9",
            &ProcessStateRecord::new("Inventory", "ledger-9"),
        )
        .await
        .unwrap();

    let services = RuntimeServices::default().with_storage(storage);
    let context = ProcessContext::with_id(ledger(counter()), "ledger-9", services);
    let err = context.process().initialize().await.unwrap_err();
    assert!(matches!(err, StepwiseError::ProcessIdentityMismatch { .. }));
}
