//! Mocks and fixtures shared by the stepwise test suites.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, Once};

use futures::future::BoxFuture;
use serde_json::Value;

use stepwise_core::error::{Result, StepwiseError};
use stepwise_core::function::{FunctionArgs, FunctionSpec, KernelStep, StepContext};
use stepwise_core::traits::{AgentService, EventObserver, ExternalChannel};
use stepwise_core::types::ProcessEvent;
use stepwise_runtime::StepInfo;

/// Install a test subscriber once per binary. Honors `RUST_LOG`.
pub fn init_tracing() {
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(
                tracing_subscriber::EnvFilter::try_from_default_env()
                    .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
            )
            .with_test_writer()
            .try_init();
    });
}

type Body = dyn Fn(&str, FunctionArgs, &StepContext) -> Result<Value> + Send + Sync;

/// Closure-backed callable that counts its invocations.
#[derive(Clone)]
pub struct FnStep {
    functions: Vec<FunctionSpec>,
    body: Arc<Body>,
    calls: Arc<AtomicUsize>,
}

impl FnStep {
    pub fn new<F>(functions: Vec<FunctionSpec>, body: F) -> Self
    where
        F: Fn(&str, FunctionArgs, &StepContext) -> Result<Value> + Send + Sync + 'static,
    {
        Self {
            functions,
            body: Arc::new(body),
            calls: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Shared counter; clones of this step report into the same counter.
    pub fn calls(&self) -> Arc<AtomicUsize> {
        self.calls.clone()
    }

    /// Declare a step whose every activation reuses this callable.
    pub fn into_info(self, name: impl Into<String>) -> StepInfo {
        StepInfo::new(name, move || self.clone())
    }
}

impl KernelStep for FnStep {
    fn functions(&self) -> Vec<FunctionSpec> {
        self.functions.clone()
    }

    fn invoke<'a>(
        &'a self,
        function: &'a str,
        args: FunctionArgs,
        ctx: StepContext,
    ) -> BoxFuture<'a, Result<Value>> {
        Box::pin(async move {
            self.calls.fetch_add(1, Ordering::SeqCst);
            (self.body)(function, args, &ctx)
        })
    }
}

/// Observer that records every public event it sees.
#[derive(Default)]
pub struct RecordingObserver {
    events: Mutex<Vec<ProcessEvent>>,
}

impl RecordingObserver {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn events(&self) -> Vec<ProcessEvent> {
        self.events.lock().unwrap().clone()
    }

    /// Qualified ids in observation order.
    pub fn ids(&self) -> Vec<String> {
        self.events().iter().map(ProcessEvent::qualified_id).collect()
    }

    pub fn find(&self, qualified_id: &str) -> Option<ProcessEvent> {
        self.events()
            .into_iter()
            .find(|e| e.qualified_id() == qualified_id)
    }
}

impl EventObserver for RecordingObserver {
    fn on_event(&self, event: &ProcessEvent) {
        self.events.lock().unwrap().push(event.clone());
    }
}

/// External channel that records forwarded payloads, or fails on demand.
#[derive(Default)]
pub struct RecordingChannel {
    sent: Mutex<Vec<(String, Value)>>,
    fail: bool,
}

impl RecordingChannel {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn failing() -> Arc<Self> {
        Arc::new(Self {
            fail: true,
            ..Default::default()
        })
    }

    pub fn sent(&self) -> Vec<(String, Value)> {
        self.sent.lock().unwrap().clone()
    }
}

impl ExternalChannel for RecordingChannel {
    fn forward<'a>(&'a self, topic: &'a str, payload: Value) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            if self.fail {
                return Err(StepwiseError::invocation("channel", topic, "channel offline"));
            }
            self.sent.lock().unwrap().push((topic.to_string(), payload));
            Ok(())
        })
    }
}

/// Agent service that answers with a fixed reply and tracks thread lifecycle.
pub struct MockAgentService {
    reply: Value,
    next_thread: AtomicUsize,
    created: Mutex<Vec<String>>,
    deleted: Mutex<Vec<String>>,
    invocations: Mutex<Vec<(String, String, Value)>>,
}

impl MockAgentService {
    pub fn new(reply: Value) -> Arc<Self> {
        Arc::new(Self {
            reply,
            next_thread: AtomicUsize::new(1),
            created: Mutex::new(Vec::new()),
            deleted: Mutex::new(Vec::new()),
            invocations: Mutex::new(Vec::new()),
        })
    }

    pub fn created_threads(&self) -> Vec<String> {
        self.created.lock().unwrap().clone()
    }

    pub fn deleted_threads(&self) -> Vec<String> {
        self.deleted.lock().unwrap().clone()
    }

    /// `(agent, thread_id, args)` per invocation.
    pub fn invocations(&self) -> Vec<(String, String, Value)> {
        self.invocations.lock().unwrap().clone()
    }
}

impl AgentService for MockAgentService {
    fn create_thread(&self) -> BoxFuture<'_, Result<String>> {
        Box::pin(async move {
            let id = format!("thread-{}", self.next_thread.fetch_add(1, Ordering::SeqCst));
            self.created.lock().unwrap().push(id.clone());
            Ok(id)
        })
    }

    fn invoke<'a>(
        &'a self,
        agent: &'a str,
        thread_id: &'a str,
        args: FunctionArgs,
    ) -> BoxFuture<'a, Result<Value>> {
        Box::pin(async move {
            self.invocations.lock().unwrap().push((
                agent.to_string(),
                thread_id.to_string(),
                args.into_value(),
            ));
            Ok(self.reply.clone())
        })
    }

    fn delete_thread<'a>(&'a self, thread_id: &'a str) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            self.deleted.lock().unwrap().push(thread_id.to_string());
            Ok(())
        })
    }
}
