//! Declarative descriptions of steps and processes.
//!
//! A process is declared once with [`ProcessBuilder`] and materialized into
//! live steps by [`LocalProcess`](crate::process::LocalProcess). The
//! descriptors are immutable after `build()`.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use stepwise_core::error::{Result, StepwiseError};
use stepwise_core::function::{FunctionSpec, KernelStep, StepFactory};
use stepwise_core::types::{
    error_event_id, result_event_id, END_STEP_ID, GLOBAL_ERROR_EVENT, ON_ENTER_EVENT,
};

use crate::edge::{Edge, EdgeMap};
use crate::state::{validator_for, StateValidator};

fn insert_edge(edges: &mut EdgeMap, key: String, source: &str, mut edge: Edge) {
    if edge.source.is_empty() {
        edge.source = source.to_string();
    }
    edges.entry(key).or_default().push(edge);
}

/// Declared persisted state of a function step.
#[derive(Debug, Clone, PartialEq)]
pub struct StateSpec {
    pub type_name: String,
    pub default: Value,
}

/// A function step: a named callable plus its outgoing edges.
#[derive(Clone)]
pub struct StepInfo {
    pub name: String,
    pub factory: StepFactory,
    pub state: Option<StateSpec>,
    pub edges: EdgeMap,
}

impl std::fmt::Debug for StepInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StepInfo")
            .field("name", &self.name)
            .field("state", &self.state)
            .field("edges", &self.edges)
            .finish_non_exhaustive()
    }
}

impl StepInfo {
    /// Declare a step; `factory` builds a fresh callable on every activation.
    pub fn new<S, F>(name: impl Into<String>, factory: F) -> Self
    where
        S: KernelStep,
        F: Fn() -> S + Send + Sync + 'static,
    {
        Self {
            name: name.into(),
            factory: Arc::new(move || Box::new(factory()) as Box<dyn KernelStep>),
            state: None,
            edges: EdgeMap::new(),
        }
    }

    /// Declare the step's persisted user state with its default value.
    pub fn with_state<T: Serialize>(mut self, type_name: impl Into<String>, default: T) -> Self {
        self.state = Some(StateSpec {
            type_name: type_name.into(),
            default: serde_json::to_value(default).unwrap_or(Value::Null),
        });
        self
    }

    /// Route a custom event emitted by this step.
    pub fn on_event(mut self, event_id: &str, edge: Edge) -> Self {
        let key = format!("{}.{}", self.name, event_id);
        insert_edge(&mut self.edges, key, &self.name, edge);
        self
    }

    pub fn on_function_result(self, function: &str, edge: Edge) -> Self {
        self.on_event(&result_event_id(function), edge)
    }

    pub fn on_function_error(self, function: &str, edge: Edge) -> Self {
        self.on_event(&error_event_id(function), edge)
    }
}

/// Lifetime of a declared conversation thread.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ThreadPolicy {
    /// Created once at process initialization and shared by every invocation.
    #[default]
    Scoped,
    /// Created for each invocation and deleted afterwards.
    PerInvocation,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ThreadDeclaration {
    #[serde(default)]
    pub policy: ThreadPolicy,
}

/// A step that runs an external agent on a conversation thread.
#[derive(Debug, Clone)]
pub struct AgentStepInfo {
    pub name: String,
    /// Agent identifier handed to the agent service.
    pub agent: String,
    /// Declared thread used when a message names none.
    pub thread: Option<String>,
    pub function: FunctionSpec,
    pub edges: EdgeMap,
}

impl AgentStepInfo {
    /// Agent step exposing `invoke(message)`.
    pub fn new(name: impl Into<String>, agent: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            agent: agent.into(),
            thread: None,
            function: FunctionSpec::new("invoke").param("message"),
            edges: EdgeMap::new(),
        }
    }

    pub fn with_thread(mut self, thread: impl Into<String>) -> Self {
        self.thread = Some(thread.into());
        self
    }

    pub fn with_function(mut self, function: FunctionSpec) -> Self {
        self.function = function;
        self
    }

    pub fn on_event(mut self, event_id: &str, edge: Edge) -> Self {
        let key = format!("{}.{}", self.name, event_id);
        insert_edge(&mut self.edges, key, &self.name, edge);
        self
    }

    pub fn on_function_result(self, function: &str, edge: Edge) -> Self {
        self.on_event(&result_event_id(function), edge)
    }

    pub fn on_function_error(self, function: &str, edge: Edge) -> Self {
        self.on_event(&error_event_id(function), edge)
    }
}

/// A step bridging to an external channel.
#[derive(Debug, Clone, Default)]
pub struct ProxyInfo {
    pub name: String,
    /// Function name -> external topic. Unmapped functions use their own name.
    pub topics: BTreeMap<String, String>,
    pub edges: EdgeMap,
}

impl ProxyInfo {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    pub fn with_topic(mut self, function: impl Into<String>, topic: impl Into<String>) -> Self {
        self.topics.insert(function.into(), topic.into());
        self
    }

    pub fn topic_for(&self, function: &str) -> String {
        self.topics
            .get(function)
            .cloned()
            .unwrap_or_else(|| function.to_string())
    }

    /// Route an externally delivered event.
    pub fn on_event(mut self, event_id: &str, edge: Edge) -> Self {
        let key = format!("{}.{}", self.name, event_id);
        insert_edge(&mut self.edges, key, &self.name, edge);
        self
    }

    pub fn on_function_error(self, function: &str, edge: Edge) -> Self {
        self.on_event(&error_event_id(function), edge)
    }
}

/// What a map step runs for each element.
#[derive(Debug, Clone)]
pub enum MapOperation {
    /// One fresh step instance per element; its single function receives the element.
    Step(StepInfo),
    /// One nested process run per element.
    Process {
        process: Arc<ProcessInfo>,
        /// Input event the element is sent as.
        input_event: String,
        /// Surfaced event id whose payload is the element's result.
        output_event: String,
    },
}

/// A fan-out step over a collection payload.
#[derive(Debug, Clone)]
pub struct MapInfo {
    pub name: String,
    pub operation: MapOperation,
    pub edges: EdgeMap,
}

impl MapInfo {
    pub fn over_step(name: impl Into<String>, step: StepInfo) -> Self {
        Self {
            name: name.into(),
            operation: MapOperation::Step(step),
            edges: EdgeMap::new(),
        }
    }

    pub fn over_process(
        name: impl Into<String>,
        process: ProcessInfo,
        input_event: impl Into<String>,
        output_event: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            operation: MapOperation::Process {
                process: Arc::new(process),
                input_event: input_event.into(),
                output_event: output_event.into(),
            },
            edges: EdgeMap::new(),
        }
    }

    pub fn on_event(mut self, event_id: &str, edge: Edge) -> Self {
        let key = format!("{}.{}", self.name, event_id);
        insert_edge(&mut self.edges, key, &self.name, edge);
        self
    }

    pub fn on_function_result(self, function: &str, edge: Edge) -> Self {
        self.on_event(&result_event_id(function), edge)
    }

    pub fn on_function_error(self, function: &str, edge: Edge) -> Self {
        self.on_event(&error_event_id(function), edge)
    }
}

/// Declared shared state of a process.
#[derive(Clone)]
pub struct SharedStateSpec {
    pub type_name: String,
    pub default: Value,
    pub validate: StateValidator,
}

impl std::fmt::Debug for SharedStateSpec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SharedStateSpec")
            .field("type_name", &self.type_name)
            .field("default", &self.default)
            .finish_non_exhaustive()
    }
}

/// Any declarable child of a process.
#[derive(Debug, Clone)]
pub enum StepKindInfo {
    Function(StepInfo),
    Process(ProcessInfo),
    Map(MapInfo),
    Proxy(ProxyInfo),
    Agent(AgentStepInfo),
}

impl StepKindInfo {
    pub fn name(&self) -> &str {
        match self {
            Self::Function(s) => &s.name,
            Self::Process(p) => &p.name,
            Self::Map(m) => &m.name,
            Self::Proxy(p) => &p.name,
            Self::Agent(a) => &a.name,
        }
    }

    /// Edges routing this step's events inside the owning process.
    pub fn edges(&self) -> &EdgeMap {
        match self {
            Self::Function(s) => &s.edges,
            Self::Process(p) => &p.output_edges,
            Self::Map(m) => &m.edges,
            Self::Proxy(p) => &p.edges,
            Self::Agent(a) => &a.edges,
        }
    }
}

impl From<StepInfo> for StepKindInfo {
    fn from(info: StepInfo) -> Self {
        Self::Function(info)
    }
}

impl From<ProcessInfo> for StepKindInfo {
    fn from(info: ProcessInfo) -> Self {
        Self::Process(info)
    }
}

impl From<MapInfo> for StepKindInfo {
    fn from(info: MapInfo) -> Self {
        Self::Map(info)
    }
}

impl From<ProxyInfo> for StepKindInfo {
    fn from(info: ProxyInfo) -> Self {
        Self::Proxy(info)
    }
}

impl From<AgentStepInfo> for StepKindInfo {
    fn from(info: AgentStepInfo) -> Self {
        Self::Agent(info)
    }
}

/// A validated process declaration.
#[derive(Debug, Clone)]
pub struct ProcessInfo {
    pub name: String,
    /// Children in declaration order.
    pub steps: Vec<StepKindInfo>,
    /// Process-level edges: input events, on-enter and the global error group.
    pub edges: EdgeMap,
    /// Edges the owning parent applies to this process's surfaced events.
    pub output_edges: EdgeMap,
    pub threads: BTreeMap<String, ThreadDeclaration>,
    pub state: Option<SharedStateSpec>,
}

impl ProcessInfo {
    pub fn step(&self, name: &str) -> Option<&StepKindInfo> {
        self.steps.iter().find(|s| s.name() == name)
    }

    /// Merged edge index of the process and all of its children.
    pub fn edge_index(&self) -> EdgeMap {
        let mut index = self.edges.clone();
        for step in &self.steps {
            for (key, edges) in step.edges() {
                index.entry(key.clone()).or_default().extend(edges.iter().cloned());
            }
        }
        index
    }
}

/// Builder for [`ProcessInfo`].
#[derive(Debug, Clone)]
pub struct ProcessBuilder {
    info: ProcessInfo,
}

impl ProcessBuilder {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            info: ProcessInfo {
                name: name.into(),
                steps: vec![],
                edges: EdgeMap::new(),
                output_edges: EdgeMap::new(),
                threads: BTreeMap::new(),
                state: None,
            },
        }
    }

    pub fn add_step(mut self, step: impl Into<StepKindInfo>) -> Self {
        self.info.steps.push(step.into());
        self
    }

    /// Route an external input event (`"{process}.{event_id}"`).
    pub fn on_input_event(mut self, event_id: &str, edge: Edge) -> Self {
        let key = format!("{}.{}", self.info.name, event_id);
        let source = self.info.name.clone();
        insert_edge(&mut self.info.edges, key, &source, edge);
        self
    }

    /// Edges fired once at the start of the first superstep.
    pub fn on_enter(mut self, edge: Edge) -> Self {
        let source = self.info.name.clone();
        insert_edge(&mut self.info.edges, ON_ENTER_EVENT.to_string(), &source, edge);
        self
    }

    /// Edges receiving error events nothing else handled.
    pub fn on_error(mut self, edge: Edge) -> Self {
        let source = self.info.name.clone();
        insert_edge(&mut self.info.edges, GLOBAL_ERROR_EVENT.to_string(), &source, edge);
        self
    }

    /// Edges the parent applies to an event this process surfaces when nested.
    pub fn on_output_event(mut self, event_id: &str, edge: Edge) -> Self {
        let key = format!("{}.{}", self.info.name, event_id);
        let source = self.info.name.clone();
        insert_edge(&mut self.info.output_edges, key, &source, edge);
        self
    }

    pub fn with_thread(mut self, name: impl Into<String>, policy: ThreadPolicy) -> Self {
        self.info
            .threads
            .insert(name.into(), ThreadDeclaration { policy });
        self
    }

    /// Declare typed shared state; every update must still deserialize into `T`.
    pub fn with_state<T>(mut self, type_name: impl Into<String>, default: T) -> Self
    where
        T: Serialize + DeserializeOwned + 'static,
    {
        self.info.state = Some(SharedStateSpec {
            type_name: type_name.into(),
            default: serde_json::to_value(default).unwrap_or(Value::Null),
            validate: validator_for::<T>(),
        });
        self
    }

    /// Validate names, edge targets and thread bindings.
    pub fn build(self) -> Result<ProcessInfo> {
        let info = self.info;

        let mut names = BTreeSet::new();
        for step in &info.steps {
            let name = step.name();
            if name == END_STEP_ID || !names.insert(name.to_string()) {
                return Err(StepwiseError::Config(format!(
                    "duplicate or reserved step name '{}' in process '{}'",
                    name, info.name
                )));
            }
            if let StepKindInfo::Agent(agent) = step {
                if let Some(thread) = &agent.thread {
                    if !info.threads.contains_key(thread) {
                        return Err(StepwiseError::MissingThread {
                            step: agent.name.clone(),
                            thread: thread.clone(),
                        });
                    }
                }
            }
        }

        for edge in info.edge_index().values().flatten() {
            if let Some(target) = edge.target_step() {
                if target != END_STEP_ID && !names.contains(target) {
                    return Err(StepwiseError::UnknownStep(target.to_string()));
                }
            }
        }

        Ok(info)
    }
}
