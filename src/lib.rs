//! Superstep-based local process runtime.
//!
//! Declare a graph with [`ProcessBuilder`], wrap it in a [`ProcessContext`]
//! and feed it [`KernelEvent`]s:
//!
//! ```no_run
//! # async fn demo() -> stepwise::Result<()> {
//! use stepwise::{Edge, FunctionSpec, KernelEvent, ProcessBuilder, ProcessContext,
//!     RuntimeServices, StepInfo};
//! # use stepwise::{FunctionArgs, KernelStep, StepContext};
//! # struct Greeter;
//! # impl KernelStep for Greeter {
//! #     fn functions(&self) -> Vec<FunctionSpec> { vec![FunctionSpec::new("greet").param("name")] }
//! #     fn invoke<'a>(&'a self, _: &'a str, args: FunctionArgs, _: StepContext)
//! #         -> futures::future::BoxFuture<'a, stepwise::Result<serde_json::Value>> {
//! #         Box::pin(async move { Ok(serde_json::json!(format!("hi {}", args.get_str("name").unwrap_or("")))) })
//! #     }
//! # }
//!
//! let process = ProcessBuilder::new("Hello")
//!     .add_step(StepInfo::new("Greeter", || Greeter))
//!     .on_input_event("Start", Edge::to_function("Greeter", "greet").with_parameter("name"))
//!     .build()?;
//!
//! let context = ProcessContext::new(process, RuntimeServices::default());
//! let outcome = context
//!     .run_once(KernelEvent::new("Start").with_data(serde_json::json!("ada")))
//!     .await?;
//! println!("finished after {} supersteps", outcome.supersteps);
//! # Ok(())
//! # }
//! ```

use tracing_subscriber::EnvFilter;

pub use stepwise_core::config::{
    LogConfig, ProcessConfig, RuntimeConfig, StorageBackend, StorageConfig, UnroutedErrorPolicy,
};
pub use stepwise_core::error::{Result, StepwiseError};
pub use stepwise_core::event::EventBus;
pub use stepwise_core::function::{
    FunctionArgs, FunctionSpec, KernelStep, ParameterKind, ParameterSpec, StepContext,
};
pub use stepwise_core::traits::{AgentService, EventObserver, ExternalChannel, ProcessStorage};
pub use stepwise_core::types::{
    EventVisibility, KernelEvent, ProcessEvent, ProcessMessage, ProcessStateRecord, StepState,
    END_STEP_ID, GLOBAL_ERROR_EVENT, ON_ENTER_EVENT,
};

pub use stepwise_runtime::{
    AgentStepInfo, Edge, EdgeCondition, EdgeGroup, EdgeTarget, ExternalInput, LocalProcess,
    MapInfo, MapOperation, ProcessBuilder, ProcessContext, ProcessInfo, ProxyInfo, RunOutcome, RunPolicy,
    RuntimeServices, StateManager, StateOperation, StepInfo, StepKind, StepSnapshot, Termination,
    ThreadDeclaration, ThreadPolicy,
};

pub use stepwise_store::{open_storage, InMemoryStorage, SqliteStorage};

/// Install the global tracing subscriber. `RUST_LOG` overrides `config.filter`.
///
/// Returns an error if a subscriber is already installed.
pub fn init_logging(config: &LogConfig) -> Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&config.filter))
        .map_err(|e| StepwiseError::Config(format!("invalid log filter: {}", e)))?;

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .try_init()
        .map_err(|e| StepwiseError::Config(e.to_string()))
}

/// Build runtime services from config, opening the configured storage backend.
pub async fn services_from_config(config: RuntimeConfig) -> Result<RuntimeServices> {
    let storage = match &config.storage {
        Some(storage) => Some(open_storage(storage).await?),
        None => None,
    };
    let services = RuntimeServices::new(config);
    Ok(match storage {
        Some(storage) => services.with_storage(storage),
        None => services,
    })
}
