use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tokio::sync::{Mutex, MutexGuard};
use tokio::task::{JoinError, JoinHandle};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use stepwise_core::error::{Result, StepwiseError};
use stepwise_core::types::KernelEvent;

use crate::info::ProcessInfo;
use crate::process::{ExternalInput, LocalProcess, RunOutcome, RunPolicy};
use crate::services::RuntimeServices;
use crate::snapshot::StepSnapshot;

struct RunHandle {
    keep_alive: bool,
    cancel: CancellationToken,
    task: JoinHandle<Result<RunOutcome>>,
}

/// External handle to a root process and its background run task.
///
/// At most one run task exists at a time. The task owns a cancellation token
/// that [`stop`](Self::stop) triggers; in-flight dispatches finish first.
pub struct ProcessContext {
    process: Arc<LocalProcess>,
    run: Mutex<Option<RunHandle>>,
}

fn settle(joined: std::result::Result<Result<RunOutcome>, JoinError>) -> Result<RunOutcome> {
    match joined {
        Ok(result) => result,
        Err(e) if e.is_cancelled() => Err(StepwiseError::Cancelled),
        Err(e) => Err(StepwiseError::TaskFailed(e.to_string())),
    }
}

impl ProcessContext {
    async fn reap(&self, slot: &mut MutexGuard<'_, Option<RunHandle>>) {
        if let Some(previous) = slot.take() {
            match settle(previous.task.await) {
                Ok(outcome) => debug!(process = %self.name(), ?outcome, "Reaped previous run"),
                Err(e) => warn!(process = %self.name(), error = %e, "Previous run failed"),
            }
        }
    }

    pub fn new(info: ProcessInfo, services: RuntimeServices) -> Self {
        Self::from_process(LocalProcess::new(info, services))
    }

    /// Bind to an existing instance id so persisted step ids are reused.
    pub fn with_id(info: ProcessInfo, id: impl Into<String>, services: RuntimeServices) -> Self {
        Self::from_process(LocalProcess::with_id(Arc::new(info), id, services))
    }

    fn from_process(process: LocalProcess) -> Self {
        Self {
            process: Arc::new(process),
            run: Mutex::new(None),
        }
    }

    pub fn id(&self) -> &str {
        self.process.id()
    }

    pub fn name(&self) -> &str {
        self.process.name()
    }

    pub fn process(&self) -> &Arc<LocalProcess> {
        &self.process
    }

    /// Initialize the process and launch the run loop in the background.
    /// A no-op while a run is active.
    pub async fn start(&self, keep_alive: bool) -> Result<()> {
        let mut slot = self.run.lock().await;
        self.start_locked(&mut slot, keep_alive).await
    }

    async fn start_locked(
        &self,
        slot: &mut MutexGuard<'_, Option<RunHandle>>,
        keep_alive: bool,
    ) -> Result<()> {
        if let Some(handle) = slot.as_ref() {
            // A finishing task no longer drains the queue; reap it and start over.
            if !handle.task.is_finished() && self.process.accepts_input() {
                return Ok(());
            }
        }
        self.reap(slot).await;

        self.process.initialize().await?;

        let policy = if keep_alive {
            RunPolicy::KeepAlive {
                idle_timeout: self.process.services().config.process.idle_timeout(),
            }
        } else {
            RunPolicy::RunOnce
        };
        let cancel = CancellationToken::new();
        let process = self.process.clone();
        self.process.open_input();
        let token = cancel.clone();
        let task = tokio::spawn(async move { process.run(policy, token).await });

        info!(process = %self.name(), id = %self.id(), keep_alive, "Process started");
        **slot = Some(RunHandle {
            keep_alive,
            cancel,
            task,
        });
        Ok(())
    }

    /// Seed an event and run until no messages remain.
    ///
    /// A run-once session still in flight is awaited first; the seeded event
    /// always gets a fresh session of its own.
    pub async fn run_once(&self, event: KernelEvent) -> Result<RunOutcome> {
        let mut slot = self.run.lock().await;
        if slot.as_ref().map_or(false, |h| h.keep_alive && !h.task.is_finished()) {
            return Err(StepwiseError::Config(format!(
                "process '{}' is already running in keep-alive mode",
                self.name()
            )));
        }
        self.reap(&mut slot).await;
        self.process.send(ExternalInput::Event(event));
        self.start_locked(&mut slot, false).await?;

        let handle = slot
            .take()
            .ok_or_else(|| StepwiseError::TaskFailed("run task was not started".into()))?;
        settle(handle.task.await)
    }

    /// Seed an event and keep the process alive until it reaches the end
    /// marker, idles out, or `timeout` elapses. On timeout the run is stopped.
    pub async fn run_until_end(&self, event: KernelEvent, timeout: Duration) -> Result<RunOutcome> {
        let mut slot = self.run.lock().await;
        if slot.as_ref().map_or(false, |h| !h.keep_alive) {
            self.reap(&mut slot).await;
        }
        self.process.send(ExternalInput::Event(event));
        self.start_locked(&mut slot, true).await?;

        let joined = {
            let handle = slot
                .as_mut()
                .ok_or_else(|| StepwiseError::TaskFailed("run task was not started".into()))?;
            tokio::time::timeout(timeout, &mut handle.task).await
        };

        match joined {
            Ok(joined) => {
                slot.take();
                settle(joined)
            }
            Err(_) => {
                warn!(process = %self.name(), timeout_secs = timeout.as_secs(), "Run timed out, stopping");
                if let Some(handle) = slot.take() {
                    handle.cancel.cancel();
                    let _ = settle(handle.task.await);
                }
                Err(StepwiseError::Timeout(timeout.as_secs()))
            }
        }
    }

    /// Cancel the active run and wait for it to settle. Idempotent.
    pub async fn stop(&self) -> Result<()> {
        let mut slot = self.run.lock().await;
        let Some(handle) = slot.take() else {
            return Ok(());
        };
        handle.cancel.cancel();
        match settle(handle.task.await) {
            Ok(outcome) => {
                info!(process = %self.name(), ?outcome, "Process stopped");
                Ok(())
            }
            Err(e) if e.is_cancellation() => Ok(()),
            Err(e) => Err(e),
        }
    }

    /// Queue an event; starts a run if none is active.
    pub async fn send_event(&self, event: KernelEvent) -> Result<()> {
        self.process.send(ExternalInput::Event(event));
        self.ensure_running().await
    }

    /// Surface an external payload as a public event of a proxy step.
    pub async fn deliver_to_proxy(
        &self,
        step: impl Into<String>,
        event_id: impl Into<String>,
        data: Option<Value>,
    ) -> Result<()> {
        self.process.send(ExternalInput::Proxy {
            step: step.into(),
            event_id: event_id.into(),
            data,
        });
        self.ensure_running().await
    }

    async fn ensure_running(&self) -> Result<()> {
        // Checked after the input was queued: an accepting loop drains it.
        if self.process.accepts_input() {
            return Ok(());
        }
        let mut slot = self.run.lock().await;
        self.start_locked(&mut slot, false).await
    }

    /// Wait for the active run, if any, and return its outcome.
    pub async fn wait(&self) -> Result<Option<RunOutcome>> {
        let mut slot = self.run.lock().await;
        match slot.take() {
            Some(handle) => settle(handle.task.await).map(Some),
            None => Ok(None),
        }
    }

    pub async fn is_running(&self) -> bool {
        let slot = self.run.lock().await;
        slot.as_ref().map_or(false, |h| !h.task.is_finished())
    }

    /// Deep snapshot of the process tree. Does not pause an active run.
    ///
    /// Each child is read under the lock its dispatch holds, so a step that
    /// is mid-invocation (or a nested process mid-run) delays the snapshot
    /// until that call returns. The result never shows a half-applied step.
    pub async fn get_state(&self) -> Result<StepSnapshot> {
        self.process.extract_state().await
    }

    /// Stop, tear down the process and close storage.
    pub async fn close(&self) -> Result<()> {
        self.stop().await?;
        self.process.deinitialize().await?;
        if let Some(storage) = &self.process.services().storage {
            storage.close().await?;
        }
        Ok(())
    }
}

impl Drop for ProcessContext {
    fn drop(&mut self) {
        if let Some(handle) = self.run.get_mut().as_ref() {
            handle.cancel.cancel();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use futures::future::BoxFuture;
    use serde_json::json;
    use stepwise_core::config::RuntimeConfig;
    use stepwise_core::function::{FunctionArgs, FunctionSpec, KernelStep, StepContext};

    use crate::edge::Edge;
    use crate::info::{ProcessBuilder, StepInfo};
    use crate::process::Termination;

    struct Count(Arc<AtomicUsize>);

    impl KernelStep for Count {
        fn functions(&self) -> Vec<FunctionSpec> {
            vec![FunctionSpec::new("run").param("input")]
        }

        fn invoke<'a>(
            &'a self,
            _function: &'a str,
            args: FunctionArgs,
            _ctx: StepContext,
        ) -> BoxFuture<'a, Result<Value>> {
            Box::pin(async move {
                self.0.fetch_add(1, Ordering::SeqCst);
                Ok(args.get("input").cloned().unwrap_or(Value::Null))
            })
        }
    }

    fn process(calls: &Arc<AtomicUsize>, finish: bool) -> ProcessInfo {
        let calls = calls.clone();
        let mut step = StepInfo::new("A", move || Count(calls.clone()));
        if finish {
            step = step.on_function_result("run", Edge::to_end());
        }
        ProcessBuilder::new("P")
            .add_step(step)
            .on_input_event("Start", Edge::to_function("A", "run"))
            .build()
            .unwrap()
    }

    #[tokio::test]
    async fn test_run_once() {
        let calls = Arc::new(AtomicUsize::new(0));
        let ctx = ProcessContext::new(process(&calls, false), RuntimeServices::default());
        let outcome = ctx
            .run_once(KernelEvent::new("Start").with_data(json!(1)))
            .await
            .unwrap();
        assert_eq!(outcome.termination, Termination::Quiescent);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(!ctx.is_running().await);
    }

    #[tokio::test]
    async fn test_run_until_end_reaches_marker() {
        let calls = Arc::new(AtomicUsize::new(0));
        let ctx = ProcessContext::new(process(&calls, true), RuntimeServices::default());
        let outcome = ctx
            .run_until_end(KernelEvent::new("Start").with_data(json!(1)), Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(outcome.termination, Termination::EndReached);
    }

    #[tokio::test]
    async fn test_run_until_end_times_out() {
        let calls = Arc::new(AtomicUsize::new(0));
        let ctx = ProcessContext::new(process(&calls, false), RuntimeServices::default());
        let err = ctx
            .run_until_end(KernelEvent::new("Start").with_data(json!(1)), Duration::from_millis(100))
            .await
            .unwrap_err();
        assert!(matches!(err, StepwiseError::Timeout(_)));
        assert!(!ctx.is_running().await);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_keep_alive_accepts_events_and_stops() {
        let calls = Arc::new(AtomicUsize::new(0));
        let ctx = ProcessContext::new(process(&calls, false), RuntimeServices::default());
        ctx.start(true).await.unwrap();
        assert!(ctx.is_running().await);

        for i in 0..3 {
            ctx.send_event(KernelEvent::new("Start").with_data(json!(i)))
                .await
                .unwrap();
        }
        tokio::time::timeout(Duration::from_secs(5), async {
            while calls.load(Ordering::SeqCst) < 3 {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();

        ctx.stop().await.unwrap();
        ctx.stop().await.unwrap();
        assert!(!ctx.is_running().await);
    }

    #[tokio::test]
    async fn test_send_event_starts_run() {
        let calls = Arc::new(AtomicUsize::new(0));
        let ctx = ProcessContext::new(process(&calls, false), RuntimeServices::default());
        ctx.send_event(KernelEvent::new("Start").with_data(json!(1)))
            .await
            .unwrap();
        let outcome = ctx.wait().await.unwrap().unwrap();
        assert_eq!(outcome.termination, Termination::Quiescent);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_keep_alive_idle_timeout_from_config() {
        let calls = Arc::new(AtomicUsize::new(0));
        let mut config = RuntimeConfig::default();
        config.process.idle_timeout_secs = Some(0);
        let ctx = ProcessContext::new(process(&calls, false), RuntimeServices::new(config));
        ctx.start(true).await.unwrap();
        let outcome = ctx.wait().await.unwrap().unwrap();
        assert_eq!(outcome.termination, Termination::IdleTimeout);
    }

    #[tokio::test]
    async fn test_get_state_snapshot() {
        let calls = Arc::new(AtomicUsize::new(0));
        let ctx = ProcessContext::new(process(&calls, false), RuntimeServices::default());
        let snapshot = ctx.get_state().await.unwrap();
        assert_eq!(snapshot.name, "P");
        assert!(snapshot.parent_id.is_none());
        assert_eq!(snapshot.steps.len(), 1);
        assert!(snapshot.steps[0].id.starts_with(ctx.id()));
        ctx.close().await.unwrap();
    }

    struct Marker;

    impl KernelStep for Marker {
        fn functions(&self) -> Vec<FunctionSpec> {
            vec![FunctionSpec::new("run").param("input")]
        }

        fn invoke<'a>(
            &'a self,
            _function: &'a str,
            _args: FunctionArgs,
            ctx: StepContext,
        ) -> BoxFuture<'a, Result<Value>> {
            Box::pin(async move {
                ctx.set_state(&"started")?;
                tokio::time::sleep(Duration::from_millis(100)).await;
                ctx.set_state(&"done")?;
                Ok(Value::Null)
            })
        }
    }

    #[tokio::test]
    async fn test_get_state_waits_for_in_flight_invocation() {
        let info = ProcessBuilder::new("P")
            .add_step(StepInfo::new("A", || Marker).with_state("Marker", "idle"))
            .on_input_event("Start", Edge::to_function("A", "run"))
            .build()
            .unwrap();
        let ctx = ProcessContext::new(info, RuntimeServices::default());
        ctx.send_event(KernelEvent::new("Start").with_data(json!(1)))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;

        let snapshot = ctx.get_state().await.unwrap();
        assert_eq!(snapshot.steps[0].state.value, Some(json!("done")));
        ctx.wait().await.unwrap();
    }
}
