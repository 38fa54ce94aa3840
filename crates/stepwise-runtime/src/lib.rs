//! Local process runtime.
//!
//! A process is a fixed graph of steps joined by edges. The run loop works in
//! supersteps: collect the messages produced so far, dispatch them to their
//! steps concurrently, wait for every step to settle, then route the events
//! the steps emitted through the edge index to form the next generation.

pub mod agent;
pub mod context;
pub mod edge;
pub mod edge_group;
pub mod info;
pub mod local_step;
pub mod map;
pub mod process;
pub mod proxy;
pub mod services;
pub mod snapshot;
pub mod state;
pub mod step;

pub use agent::{AgentStep, ThreadHandle, ThreadRegistry};
pub use context::ProcessContext;
pub use edge::{
    apply_state_operation, evaluate_condition, Edge, EdgeCondition, EdgeGroup, EdgeMap,
    EdgeTarget, StateOperation,
};
pub use edge_group::{EdgeGroupProcessor, EdgeGroups};
pub use info::{
    AgentStepInfo, MapInfo, MapOperation, ProcessBuilder, ProcessInfo, ProxyInfo, StepInfo,
    StepKindInfo, ThreadDeclaration, ThreadPolicy,
};
pub use local_step::LocalStep;
pub use map::MapStep;
pub use process::{ExternalInput, LocalProcess, RunOutcome, RunPolicy, Termination};
pub use proxy::ProxyStep;
pub use services::RuntimeServices;
pub use snapshot::{StepKind, StepSnapshot};
pub use state::StateManager;
pub use step::{FunctionStep, FunctionTable, InputSlot};
