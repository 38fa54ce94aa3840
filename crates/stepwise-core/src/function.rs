use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard};

use futures::future::BoxFuture;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::error::{Result, StepwiseError};
use crate::types::{ProcessEvent, StepState};

/// How a parameter slot is filled.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ParameterKind {
    /// Supplied by incoming messages.
    #[default]
    Value,
    /// Injected by the runtime: a [`StepContext`] handle back to the step.
    Context,
}

/// A declared function parameter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParameterSpec {
    pub name: String,
    #[serde(default = "default_required")]
    pub required: bool,
    #[serde(default)]
    pub kind: ParameterKind,
    /// Value used when an optional parameter was never supplied.
    #[serde(default)]
    pub default: Option<serde_json::Value>,
}

fn default_required() -> bool {
    true
}

impl ParameterSpec {
    pub fn required(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            required: true,
            kind: ParameterKind::Value,
            default: None,
        }
    }

    pub fn optional(name: impl Into<String>, default: Option<serde_json::Value>) -> Self {
        Self {
            name: name.into(),
            required: false,
            kind: ParameterKind::Value,
            default,
        }
    }

    pub fn context(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            required: true,
            kind: ParameterKind::Context,
            default: None,
        }
    }
}

/// A function a callable exposes, with its parameter list.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FunctionSpec {
    pub name: String,
    #[serde(default)]
    pub parameters: Vec<ParameterSpec>,
}

impl FunctionSpec {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            parameters: vec![],
        }
    }

    pub fn with_parameter(mut self, parameter: ParameterSpec) -> Self {
        self.parameters.push(parameter);
        self
    }

    /// Shorthand for adding a required value parameter.
    pub fn param(self, name: impl Into<String>) -> Self {
        self.with_parameter(ParameterSpec::required(name))
    }

    /// Value parameters, excluding injected context.
    pub fn value_parameters(&self) -> impl Iterator<Item = &ParameterSpec> {
        self.parameters
            .iter()
            .filter(|p| p.kind == ParameterKind::Value)
    }
}

/// Gathered arguments for one invocation.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FunctionArgs(BTreeMap<String, serde_json::Value>);

impl FunctionArgs {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, name: impl Into<String>, value: serde_json::Value) {
        self.0.insert(name.into(), value);
    }

    pub fn get(&self, name: &str) -> Option<&serde_json::Value> {
        self.0.get(name)
    }

    pub fn get_str(&self, name: &str) -> Option<&str> {
        self.0.get(name).and_then(|v| v.as_str())
    }

    /// Deserialize a named argument into a concrete type.
    pub fn get_as<T: DeserializeOwned>(&self, name: &str) -> Result<T> {
        let value = self
            .0
            .get(name)
            .cloned()
            .unwrap_or(serde_json::Value::Null);
        Ok(serde_json::from_value(value)?)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn into_value(self) -> serde_json::Value {
        serde_json::Value::Object(self.0.into_iter().collect())
    }
}

impl FromIterator<(String, serde_json::Value)> for FunctionArgs {
    fn from_iter<I: IntoIterator<Item = (String, serde_json::Value)>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}

/// Handle a callable receives for the context-injection parameter.
///
/// Events emitted through it are buffered and routed by the owning process
/// once the current invocation completes. The handle also exposes the step's
/// persisted user state.
#[derive(Debug, Clone)]
pub struct StepContext {
    step_name: String,
    step_id: String,
    events: Arc<Mutex<Vec<ProcessEvent>>>,
    state: Arc<Mutex<StepState>>,
}

impl StepContext {
    pub fn new(state: StepState) -> Self {
        Self {
            step_name: state.name.clone(),
            step_id: state.id.clone(),
            events: Arc::new(Mutex::new(Vec::new())),
            state: Arc::new(Mutex::new(state)),
        }
    }

    pub fn step_name(&self) -> &str {
        &self.step_name
    }

    pub fn step_id(&self) -> &str {
        &self.step_id
    }

    /// Emit an event visible only inside the owning process.
    pub fn emit_event(&self, event_id: impl Into<String>, data: Option<serde_json::Value>) {
        let event = ProcessEvent::new(&self.step_name, &self.step_id, event_id, data);
        self.push_event(event);
    }

    /// Emit an event that is also surfaced to the parent or observer.
    pub fn emit_public_event(&self, event_id: impl Into<String>, data: Option<serde_json::Value>) {
        let event = ProcessEvent::new(&self.step_name, &self.step_id, event_id, data).public();
        self.push_event(event);
    }

    /// Buffer an already-built event.
    pub fn push_event(&self, event: ProcessEvent) {
        lock(&self.events).push(event);
    }

    /// Drain buffered events in emission order.
    pub fn take_events(&self) -> Vec<ProcessEvent> {
        std::mem::take(&mut *lock(&self.events))
    }

    pub fn state(&self) -> Option<serde_json::Value> {
        lock(&self.state).value.clone()
    }

    pub fn state_as<T: DeserializeOwned>(&self) -> Result<Option<T>> {
        match self.state() {
            Some(value) => Ok(Some(serde_json::from_value(value)?)),
            None => Ok(None),
        }
    }

    pub fn set_state<T: Serialize>(&self, value: &T) -> Result<()> {
        let value = serde_json::to_value(value)?;
        lock(&self.state).value = Some(value);
        Ok(())
    }

    /// Replace the whole persisted state record.
    pub fn restore_state(&self, state: StepState) {
        *lock(&self.state) = state;
    }

    pub fn snapshot_state(&self) -> StepState {
        lock(&self.state).clone()
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// A callable unit of work wrapped by a step.
pub trait KernelStep: Send + Sync + 'static {
    /// Functions this callable exposes.
    fn functions(&self) -> Vec<FunctionSpec>;

    /// Lifecycle hook run once when the owning step activates.
    fn activate<'a>(&'a mut self, ctx: &'a StepContext) -> BoxFuture<'a, Result<()>> {
        let _ = ctx;
        Box::pin(async { Ok(()) })
    }

    /// Invoke a function with a complete argument set.
    fn invoke<'a>(
        &'a self,
        function: &'a str,
        args: FunctionArgs,
        ctx: StepContext,
    ) -> BoxFuture<'a, Result<serde_json::Value>>;
}

/// Builds a fresh callable instance at activation time.
pub type StepFactory = Arc<dyn Fn() -> Box<dyn KernelStep> + Send + Sync>;

/// Look up a function by name or fail with `UnknownFunction`.
pub fn find_function<'a>(
    functions: &'a [FunctionSpec],
    step: &str,
    name: &str,
) -> Result<&'a FunctionSpec> {
    functions
        .iter()
        .find(|f| f.name == name)
        .ok_or_else(|| StepwiseError::UnknownFunction {
            step: step.to_string(),
            function: name.to_string(),
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_function_spec_builder() {
        let spec = FunctionSpec::new("greet")
            .param("name")
            .with_parameter(ParameterSpec::optional("greeting", Some("hi".into())))
            .with_parameter(ParameterSpec::context("ctx"));

        assert_eq!(spec.parameters.len(), 3);
        let values: Vec<&str> = spec.value_parameters().map(|p| p.name.as_str()).collect();
        assert_eq!(values, vec!["name", "greeting"]);
    }

    #[test]
    fn test_context_buffers_events() {
        let ctx = StepContext::new(StepState {
            name: "A".into(),
            id: "a-1".into(),
            ..Default::default()
        });
        ctx.emit_event("Started", None);
        ctx.clone().emit_public_event("Done", Some(serde_json::json!(1)));

        let events = ctx.take_events();
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].qualified_id(), "A.Started");
        assert!(events[1].is_public());
        assert!(ctx.take_events().is_empty());
    }

    #[test]
    fn test_context_state_roundtrip() {
        let ctx = StepContext::new(StepState::default());
        assert_eq!(ctx.state_as::<u32>().unwrap(), None);
        ctx.set_state(&7u32).unwrap();
        assert_eq!(ctx.state_as::<u32>().unwrap(), Some(7));
    }

    #[test]
    fn test_args_get_as() {
        let mut args = FunctionArgs::new();
        args.insert("n", serde_json::json!(4));
        assert_eq!(args.get_as::<u64>("n").unwrap(), 4);
        assert!(args.get_as::<u64>("missing").is_err());
    }

    #[test]
    fn test_find_function() {
        let functions = vec![FunctionSpec::new("a")];
        assert!(find_function(&functions, "S", "a").is_ok());
        assert!(matches!(
            find_function(&functions, "S", "b"),
            Err(StepwiseError::UnknownFunction { .. })
        ));
    }
}
