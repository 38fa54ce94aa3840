use futures::future::BoxFuture;

use crate::error::Result;
use crate::function::FunctionArgs;
use crate::types::{ProcessEvent, ProcessStateRecord, StepState};

/// Storage connector for per-instance persistence of process and step state.
pub trait ProcessStorage: Send + Sync + 'static {
    /// Prepare the backend (create tables, open files).
    fn initialize(&self) -> BoxFuture<'_, Result<()>>;

    /// Load the identity record of a process instance.
    fn get_process_state<'a>(
        &'a self,
        process_name: &'a str,
        instance_id: &'a str,
    ) -> BoxFuture<'a, Result<Option<ProcessStateRecord>>>;

    /// Save (upsert) the identity record of a process instance.
    fn save_process_state<'a>(
        &'a self,
        process_name: &'a str,
        instance_id: &'a str,
        record: &'a ProcessStateRecord,
    ) -> BoxFuture<'a, Result<()>>;

    /// Load the persisted user state of a step instance.
    fn get_step_state<'a>(
        &'a self,
        step_name: &'a str,
        step_id: &'a str,
    ) -> BoxFuture<'a, Result<Option<StepState>>>;

    /// Save (upsert) the persisted user state of a step instance.
    fn save_step_state<'a>(&'a self, state: &'a StepState) -> BoxFuture<'a, Result<()>>;

    /// Release backend resources.
    fn close(&self) -> BoxFuture<'_, Result<()>> {
        Box::pin(async { Ok(()) })
    }
}

/// Agent service: creates conversation threads and runs agents against them.
pub trait AgentService: Send + Sync + 'static {
    /// Create a new conversation thread, returning its id.
    fn create_thread(&self) -> BoxFuture<'_, Result<String>>;

    /// Invoke an agent on a thread with the gathered arguments.
    fn invoke<'a>(
        &'a self,
        agent: &'a str,
        thread_id: &'a str,
        args: FunctionArgs,
    ) -> BoxFuture<'a, Result<serde_json::Value>>;

    /// Dispose of a thread created for a single invocation.
    fn delete_thread<'a>(&'a self, thread_id: &'a str) -> BoxFuture<'a, Result<()>> {
        let _ = thread_id;
        Box::pin(async { Ok(()) })
    }
}

/// External message channel used by proxy steps.
pub trait ExternalChannel: Send + Sync + 'static {
    /// Forward a payload to an external topic.
    fn forward<'a>(
        &'a self,
        topic: &'a str,
        payload: serde_json::Value,
    ) -> BoxFuture<'a, Result<()>>;
}

/// Observer of public process events. Purely observational.
pub trait EventObserver: Send + Sync + 'static {
    fn on_event(&self, event: &ProcessEvent);
}
