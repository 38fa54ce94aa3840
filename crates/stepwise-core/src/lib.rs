pub mod config;
pub mod error;
pub mod event;
pub mod function;
pub mod traits;
pub mod types;

pub use config::RuntimeConfig;
pub use error::{Result, StepwiseError};
pub use event::EventBus;
pub use function::{
    FunctionArgs, FunctionSpec, KernelStep, ParameterKind, ParameterSpec, StepContext,
    StepFactory,
};
pub use types::*;
