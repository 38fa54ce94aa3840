use std::collections::BTreeMap;

use serde_json::{json, Value};
use tracing::{debug, warn};

use stepwise_core::error::{Result, StepwiseError};
use stepwise_core::function::{
    find_function, FunctionArgs, FunctionSpec, KernelStep, ParameterKind, StepContext,
};
use stepwise_core::types::{
    error_event_id, result_event_id, ActivationState, ProcessEvent, ProcessMessage, StepState,
};

use crate::edge_group::EdgeGroups;
use crate::info::StepInfo;
use crate::services::RuntimeServices;
use crate::snapshot::{StepKind, StepSnapshot};

/// One parameter slot of a function's current inputs.
#[derive(Debug, Clone, PartialEq)]
pub enum InputSlot {
    Missing,
    Value(Value),
    /// Filled by the runtime with the step's [`StepContext`].
    Context,
}

impl InputSlot {
    pub fn is_missing(&self) -> bool {
        matches!(self, Self::Missing)
    }
}

pub type FunctionInputs = BTreeMap<String, InputSlot>;

/// Per-function input buffers of a step.
///
/// Messages fill slots; a function is invocable once every required slot is
/// filled, whether or not the message addressed it. A function without
/// required parameters is therefore always invocable, and declaring it next
/// to other functions makes every message to that step ambiguous.
#[derive(Debug, Clone)]
pub struct FunctionTable {
    step: String,
    functions: Vec<FunctionSpec>,
    initial: BTreeMap<String, FunctionInputs>,
    current: BTreeMap<String, FunctionInputs>,
}

impl FunctionTable {
    pub fn new(step: impl Into<String>, functions: Vec<FunctionSpec>) -> Self {
        let initial: BTreeMap<String, FunctionInputs> = functions
            .iter()
            .map(|f| {
                let inputs = f
                    .parameters
                    .iter()
                    .map(|p| {
                        let slot = match (p.kind, &p.default) {
                            (ParameterKind::Context, _) => InputSlot::Context,
                            (ParameterKind::Value, Some(default)) if !p.required => {
                                InputSlot::Value(default.clone())
                            }
                            _ => InputSlot::Missing,
                        };
                        (p.name.clone(), slot)
                    })
                    .collect();
                (f.name.clone(), inputs)
            })
            .collect();

        Self {
            step: step.into(),
            functions,
            current: initial.clone(),
            initial,
        }
    }

    pub fn functions(&self) -> &[FunctionSpec] {
        &self.functions
    }

    pub fn inputs(&self, function: &str) -> Option<&FunctionInputs> {
        self.current.get(function)
    }

    pub fn initial_inputs(&self, function: &str) -> Option<&FunctionInputs> {
        self.initial.get(function)
    }

    /// Target function of a message: its named function, or the only declared one.
    pub fn target(&self, message: &ProcessMessage) -> Result<String> {
        match &message.function {
            Some(name) => Ok(find_function(&self.functions, &self.step, name)?.name.clone()),
            None if self.functions.len() == 1 => Ok(self.functions[0].name.clone()),
            None => Err(StepwiseError::InvocationAmbiguity {
                step: self.step.clone(),
                detail: format!(
                    "message names no function and the step declares {}",
                    self.functions.len()
                ),
            }),
        }
    }

    /// Write a message's payload into its target function's slots.
    ///
    /// Named values bind by parameter name. Unbound data fills the single
    /// value parameter, or is spread over parameters when it is an object
    /// whose keys name them. Repeated values overwrite.
    pub fn assign(&mut self, message: &ProcessMessage) -> Result<String> {
        let function = self.target(message)?;
        let spec = find_function(&self.functions, &self.step, &function)?.clone();
        let unknown = |parameter: &str| StepwiseError::UnknownParameter {
            step: self.step.clone(),
            function: function.clone(),
            parameter: parameter.to_string(),
        };

        let mut bindings: Vec<(String, Value)> = Vec::new();
        for (name, value) in &message.values {
            match spec.parameters.iter().find(|p| p.name == *name) {
                Some(p) if p.kind == ParameterKind::Value => {
                    bindings.push((name.clone(), value.clone()))
                }
                _ => return Err(unknown(name)),
            }
        }

        if let Some(data) = &message.data {
            let params: Vec<&str> = spec.value_parameters().map(|p| p.name.as_str()).collect();
            match (params.as_slice(), data) {
                ([], _) => {}
                ([single], _) => bindings.push((single.to_string(), data.clone())),
                (_, Value::Object(map)) if map.keys().all(|k| params.contains(&k.as_str())) => {
                    bindings.extend(map.iter().map(|(k, v)| (k.clone(), v.clone())));
                }
                _ => return Err(unknown("<unbound payload>")),
            }
        }

        let inputs = self.current.entry(function.clone()).or_default();
        for (name, value) in bindings {
            inputs.insert(name, InputSlot::Value(value));
        }
        Ok(function)
    }

    fn is_complete(&self, function: &FunctionSpec) -> bool {
        let Some(inputs) = self.current.get(&function.name) else {
            return false;
        };
        function.parameters.iter().all(|p| {
            !p.required || inputs.get(&p.name).map_or(false, |s| !s.is_missing())
        })
    }

    /// Function to invoke after assigning a message for `requested`, if any.
    pub fn select(&self, requested: &str) -> Result<Option<String>> {
        let invocable: Vec<&str> = self
            .functions
            .iter()
            .filter(|f| self.is_complete(f))
            .map(|f| f.name.as_str())
            .collect();

        match invocable.as_slice() {
            [] => Ok(None),
            [only] if *only == requested => Ok(Some(only.to_string())),
            [only] => Err(StepwiseError::InvocationAmbiguity {
                step: self.step.clone(),
                detail: format!(
                    "message targets '{}' but '{}' became invocable",
                    requested, only
                ),
            }),
            many => Err(StepwiseError::InvocationAmbiguity {
                step: self.step.clone(),
                detail: format!("multiple functions invocable: {}", many.join(", ")),
            }),
        }
    }

    /// Gathered value arguments of a function.
    pub fn args(&self, function: &str) -> FunctionArgs {
        self.current
            .get(function)
            .map(|inputs| {
                inputs
                    .iter()
                    .filter_map(|(name, slot)| match slot {
                        InputSlot::Value(v) => Some((name.clone(), v.clone())),
                        _ => None,
                    })
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Restore a function's slots to the initial template.
    pub fn reset(&mut self, function: &str) {
        if let Some(initial) = self.initial.get(function) {
            self.current.insert(function.to_string(), initial.clone());
        }
    }
}

/// Outcome event of a function invocation.
pub(crate) fn outcome_event(
    step: &str,
    step_id: &str,
    function: &str,
    result: Result<Value>,
) -> ProcessEvent {
    match result {
        Ok(value) => {
            ProcessEvent::new(step, step_id, result_event_id(function), Some(value)).public()
        }
        Err(e) => {
            warn!(step = %step, function = %function, error = %e, "Step invocation failed");
            let data = json!({ "function": function, "message": e.to_string() });
            ProcessEvent::new(step, step_id, error_event_id(function), Some(data))
                .public()
                .error()
        }
    }
}

/// A step wrapping one user callable.
pub struct FunctionStep {
    info: StepInfo,
    id: String,
    parent_id: String,
    services: RuntimeServices,
    activation: ActivationState,
    callable: Option<Box<dyn KernelStep>>,
    table: Option<FunctionTable>,
    ctx: StepContext,
    groups: EdgeGroups,
    events: Vec<ProcessEvent>,
}

impl FunctionStep {
    pub fn new(
        info: StepInfo,
        id: impl Into<String>,
        parent_id: impl Into<String>,
        services: RuntimeServices,
        groups: EdgeGroups,
    ) -> Self {
        let id = id.into();
        let ctx = StepContext::new(StepState {
            name: info.name.clone(),
            id: id.clone(),
            ..Default::default()
        });
        Self {
            info,
            id,
            parent_id: parent_id.into(),
            services,
            activation: ActivationState::Uninitialized,
            callable: None,
            table: None,
            ctx,
            groups,
            events: Vec::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.info.name
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn table(&self) -> Option<&FunctionTable> {
        self.table.as_ref()
    }

    /// One-time activation; a no-op once ready.
    pub async fn activate(&mut self) -> Result<()> {
        if self.activation.is_ready() {
            return Ok(());
        }
        self.activation = ActivationState::Initializing;
        match self.try_activate().await {
            Ok(()) => {
                self.activation = ActivationState::Ready;
                debug!(step = %self.info.name, id = %self.id, "Step activated");
                Ok(())
            }
            Err(e) => {
                self.activation = ActivationState::Uninitialized;
                Err(e)
            }
        }
    }

    async fn try_activate(&mut self) -> Result<()> {
        let mut callable = (self.info.factory)();
        let table = FunctionTable::new(&self.info.name, callable.functions());

        let persisted = match &self.services.storage {
            Some(storage) => storage.get_step_state(&self.info.name, &self.id).await?,
            None => None,
        };
        let state = match persisted {
            Some(state) => StepState {
                name: self.info.name.clone(),
                id: self.id.clone(),
                ..state
            },
            None => StepState {
                name: self.info.name.clone(),
                id: self.id.clone(),
                state_type: self.info.state.as_ref().map(|s| s.type_name.clone()),
                value: self.info.state.as_ref().map(|s| s.default.clone()),
            },
        };
        self.ctx.restore_state(state);

        callable.activate(&self.ctx).await?;
        self.callable = Some(callable);
        self.table = Some(table);
        Ok(())
    }

    /// Buffer a message and invoke the function it completes, if any.
    ///
    /// Configuration errors are returned; invocation failures become an
    /// `OnError` event.
    pub async fn handle(&mut self, message: ProcessMessage) -> Result<()> {
        self.activate().await?;

        let Some(message) = self.groups.resolve(message)? else {
            return Ok(());
        };

        let (function, args) = {
            let table = self.table.as_mut().ok_or_else(|| not_ready(&self.info.name))?;
            let requested = table.assign(&message)?;
            match table.select(&requested)? {
                Some(function) => {
                    let args = table.args(&function);
                    (function, args)
                }
                None => {
                    debug!(step = %self.info.name, function = %requested, "Waiting for inputs");
                    return Ok(());
                }
            }
        };

        let callable = self.callable.as_ref().ok_or_else(|| not_ready(&self.info.name))?;
        debug!(step = %self.info.name, function = %function, "Invoking step function");
        let result = callable.invoke(&function, args, self.ctx.clone()).await;

        self.events.extend(self.ctx.take_events());
        self.events
            .push(outcome_event(&self.info.name, &self.id, &function, result));

        if let Some(table) = self.table.as_mut() {
            table.reset(&function);
        }
        Ok(())
    }

    /// Drain events produced since the last call.
    pub fn take_events(&mut self) -> Vec<ProcessEvent> {
        std::mem::take(&mut self.events)
    }

    pub async fn extract_state(&mut self) -> Result<StepSnapshot> {
        self.activate().await?;
        Ok(StepSnapshot {
            name: self.info.name.clone(),
            id: self.id.clone(),
            parent_id: Some(self.parent_id.clone()),
            kind: StepKind::Function,
            state: self.ctx.snapshot_state(),
            edges: self.info.edges.clone(),
            steps: vec![],
        })
    }

    /// Save the step's user state, if it was ever activated.
    pub async fn persist(&self) -> Result<()> {
        if !self.activation.is_ready() {
            return Ok(());
        }
        if let Some(storage) = &self.services.storage {
            storage.save_step_state(&self.ctx.snapshot_state()).await?;
        }
        Ok(())
    }

    pub fn deinitialize(&mut self) {
        self.callable = None;
        self.table = None;
        self.events.clear();
        self.activation = ActivationState::Uninitialized;
    }
}

fn not_ready(step: &str) -> StepwiseError {
    StepwiseError::Config(format!("step '{}' is not activated", step))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    use futures::future::BoxFuture;
    use stepwise_core::function::ParameterSpec;
    use stepwise_core::traits::ProcessStorage;

    struct Adder {
        calls: Arc<AtomicUsize>,
    }

    impl KernelStep for Adder {
        fn functions(&self) -> Vec<FunctionSpec> {
            vec![
                FunctionSpec::new("add")
                    .param("a")
                    .param("b")
                    .with_parameter(ParameterSpec::context("ctx")),
                FunctionSpec::new("fail").param("reason"),
            ]
        }

        fn invoke<'a>(
            &'a self,
            function: &'a str,
            args: FunctionArgs,
            ctx: StepContext,
        ) -> BoxFuture<'a, Result<Value>> {
            Box::pin(async move {
                self.calls.fetch_add(1, Ordering::SeqCst);
                match function {
                    "add" => {
                        let sum = args.get_as::<i64>("a")? + args.get_as::<i64>("b")?;
                        let total = ctx.state_as::<i64>()?.unwrap_or(0) + sum;
                        ctx.set_state(&total)?;
                        ctx.emit_event("Added", Some(json!(sum)));
                        Ok(json!(sum))
                    }
                    _ => Err(StepwiseError::invocation("Adder", function, "boom")),
                }
            })
        }
    }

    fn message(function: &str, values: &[(&str, Value)]) -> ProcessMessage {
        let mut msg = ProcessMessage::new("Adder", Some(function.to_string()));
        for (k, v) in values {
            msg.values.insert(k.to_string(), v.clone());
        }
        msg
    }

    fn step(calls: Arc<AtomicUsize>) -> FunctionStep {
        let info = StepInfo::new("Adder", move || Adder {
            calls: calls.clone(),
        })
        .with_state("Total", 0i64);
        FunctionStep::new(info, "p/adder", "p", RuntimeServices::default(), EdgeGroups::default())
    }

    #[test]
    fn test_table_initial_template() {
        let table = FunctionTable::new(
            "S",
            vec![FunctionSpec::new("f")
                .param("x")
                .with_parameter(ParameterSpec::optional("y", Some(json!(2))))
                .with_parameter(ParameterSpec::context("ctx"))],
        );
        let inputs = table.initial_inputs("f").unwrap();
        assert_eq!(inputs["x"], InputSlot::Missing);
        assert_eq!(inputs["y"], InputSlot::Value(json!(2)));
        assert_eq!(inputs["ctx"], InputSlot::Context);
    }

    #[test]
    fn test_table_invocable_only_when_complete() {
        let mut table = FunctionTable::new("S", vec![FunctionSpec::new("f").param("x").param("y")]);
        table.assign(&message("f", &[("x", json!(1))])).unwrap();
        assert_eq!(table.select("f").unwrap(), None);

        table.assign(&message("f", &[("x", json!(5))])).unwrap();
        table.assign(&message("f", &[("y", json!(2))])).unwrap();
        assert_eq!(table.select("f").unwrap(), Some("f".into()));
        let args = table.args("f");
        assert_eq!(args.get("x"), Some(&json!(5)));

        table.reset("f");
        assert_eq!(table.inputs("f"), table.initial_inputs("f"));
        assert_eq!(table.select("f").unwrap(), None);
    }

    #[test]
    fn test_table_unbound_payload() {
        let mut table = FunctionTable::new(
            "S",
            vec![FunctionSpec::new("one").param("x"), FunctionSpec::new("two").param("a").param("b")],
        );
        let mut msg = ProcessMessage::new("S", Some("one".into()));
        msg.data = Some(json!(3));
        table.assign(&msg).unwrap();
        assert_eq!(table.args("one").get("x"), Some(&json!(3)));

        let mut msg = ProcessMessage::new("S", Some("two".into()));
        msg.data = Some(json!({"a": 1, "b": 2}));
        table.assign(&msg).unwrap();
        assert_eq!(table.args("two").len(), 2);

        msg.data = Some(json!(1));
        assert!(matches!(
            table.assign(&msg),
            Err(StepwiseError::UnknownParameter { .. })
        ));
    }

    #[test]
    fn test_table_target_resolution() {
        let table = FunctionTable::new("S", vec![FunctionSpec::new("a"), FunctionSpec::new("b")]);
        let msg = ProcessMessage::new("S", None);
        assert!(matches!(
            table.target(&msg),
            Err(StepwiseError::InvocationAmbiguity { .. })
        ));
        let msg = ProcessMessage::new("S", Some("c".into()));
        assert!(matches!(
            table.target(&msg),
            Err(StepwiseError::UnknownFunction { .. })
        ));
    }

    #[test]
    fn test_table_completeness_spans_all_functions() {
        let mut table = FunctionTable::new(
            "S",
            vec![FunctionSpec::new("first"), FunctionSpec::new("second")],
        );
        table.assign(&message("first", &[])).unwrap();
        let err = table.select("first").unwrap_err();
        assert!(matches!(
            err,
            StepwiseError::InvocationAmbiguity { ref detail, .. } if detail.contains("first, second")
        ));

        let mut table = FunctionTable::new(
            "S",
            vec![FunctionSpec::new("idle"), FunctionSpec::new("work").param("x")],
        );
        table.assign(&message("work", &[])).unwrap();
        let err = table.select("work").unwrap_err();
        assert!(matches!(
            err,
            StepwiseError::InvocationAmbiguity { ref detail, .. } if detail.contains("'idle'")
        ));
    }

    #[test]
    fn test_table_rejects_unknown_parameter() {
        let mut table = FunctionTable::new("S", vec![FunctionSpec::new("f").param("x")]);
        let err = table.assign(&message("f", &[("z", json!(1))])).unwrap_err();
        assert!(matches!(err, StepwiseError::UnknownParameter { parameter, .. } if parameter == "z"));
    }

    #[tokio::test]
    async fn test_step_invokes_once_per_complete_set() {
        let calls = Arc::new(AtomicUsize::new(0));
        let mut step = step(calls.clone());

        step.handle(message("add", &[("a", json!(1))])).await.unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 0);
        assert!(step.take_events().is_empty());

        step.handle(message("add", &[("b", json!(2))])).await.unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        let events = step.take_events();
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].qualified_id(), "Adder.Added");
        assert_eq!(events[1].qualified_id(), "Adder.add.OnResult");
        assert_eq!(events[1].data, Some(json!(3)));
        assert!(events[1].is_public());

        let table = step.table().unwrap();
        assert_eq!(table.inputs("add"), table.initial_inputs("add"));
    }

    #[tokio::test]
    async fn test_step_failure_becomes_error_event() {
        let calls = Arc::new(AtomicUsize::new(0));
        let mut step = step(calls);
        step.handle(message("fail", &[("reason", json!("bad input"))]))
            .await
            .unwrap();

        let events = step.take_events();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].qualified_id(), "Adder.fail.OnError");
        assert!(events[0].is_error);
        assert_eq!(events[0].data.as_ref().unwrap()["function"], json!("fail"));
    }

    #[tokio::test]
    async fn test_step_state_persists_through_storage() {
        let storage = Arc::new(stepwise_store::InMemoryStorage::new());
        let services = RuntimeServices::default().with_storage(storage.clone());
        let calls = Arc::new(AtomicUsize::new(0));

        let make = |services: RuntimeServices| {
            let calls = calls.clone();
            let info = StepInfo::new("Adder", move || Adder {
                calls: calls.clone(),
            })
            .with_state("Total", 0i64);
            FunctionStep::new(info, "p/adder", "p", services, EdgeGroups::default())
        };

        let mut first = make(services.clone());
        first.handle(message("add", &[("a", json!(2)), ("b", json!(3))])).await.unwrap();
        first.persist().await.unwrap();

        let saved = storage.get_step_state("Adder", "p/adder").await.unwrap().unwrap();
        assert_eq!(saved.value, Some(json!(5)));

        let mut second = make(services);
        let snapshot = second.extract_state().await.unwrap();
        assert_eq!(snapshot.state.value, Some(json!(5)));
        assert_eq!(snapshot.state.state_type.as_deref(), Some("Total"));
        assert_eq!(snapshot.parent_id.as_deref(), Some("p"));
    }

    #[tokio::test]
    async fn test_activation_is_idempotent() {
        let mut step = step(Arc::new(AtomicUsize::new(0)));
        step.activate().await.unwrap();
        step.activate().await.unwrap();
        step.deinitialize();
        assert!(step.table().is_none());
        step.activate().await.unwrap();
        assert!(step.table().is_some());
    }
}
