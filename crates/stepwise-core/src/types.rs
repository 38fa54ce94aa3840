use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Pseudo-event whose edges fire once at the start of a process's first superstep.
pub const ON_ENTER_EVENT: &str = "stepwise.process.on_enter";

/// Edge group receiving error events that no specific edge handled.
pub const GLOBAL_ERROR_EVENT: &str = "stepwise.process.on_error";

/// Destination id that ends the current process run.
pub const END_STEP_ID: &str = "stepwise.process.end";

/// Suffix of the event emitted when a function returns.
pub const ON_RESULT_SUFFIX: &str = "OnResult";

/// Suffix of the event emitted when a function fails.
pub const ON_ERROR_SUFFIX: &str = "OnError";

/// Event id for a function's successful result.
pub fn result_event_id(function: &str) -> String {
    format!("{}.{}", function, ON_RESULT_SUFFIX)
}

/// Event id for a function's failure.
pub fn error_event_id(function: &str) -> String {
    format!("{}.{}", function, ON_ERROR_SUFFIX)
}

/// Generate a child id scoped under its parent.
pub fn new_child_id(parent_id: &str) -> String {
    format!("{}/{}", parent_id, Uuid::new_v4().simple())
}

/// Generate a root process instance id.
pub fn new_instance_id() -> String {
    Uuid::new_v4().to_string()
}

/// Who may observe an emitted event.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventVisibility {
    /// Routed only inside the owning process.
    #[default]
    Internal,
    /// Also surfaced to the parent process or the external observer.
    Public,
}

/// An event as submitted from outside a process.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KernelEvent {
    pub id: String,
    #[serde(default)]
    pub data: Option<serde_json::Value>,
    #[serde(default)]
    pub visibility: EventVisibility,
}

impl KernelEvent {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            data: None,
            visibility: EventVisibility::Internal,
        }
    }

    pub fn with_data(mut self, data: serde_json::Value) -> Self {
        self.data = Some(data);
        self
    }
}

/// An event produced inside a process, routed through the edge index.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProcessEvent {
    /// Scoping prefix: the owning step's (or process's) name.
    pub namespace: String,
    /// Instance id of the emitter.
    pub source_id: String,
    /// Event name local to the namespace.
    pub event_id: String,
    #[serde(default)]
    pub data: Option<serde_json::Value>,
    #[serde(default)]
    pub visibility: EventVisibility,
    #[serde(default)]
    pub is_error: bool,
}

impl ProcessEvent {
    pub fn new(
        namespace: impl Into<String>,
        source_id: impl Into<String>,
        event_id: impl Into<String>,
        data: Option<serde_json::Value>,
    ) -> Self {
        Self {
            namespace: namespace.into(),
            source_id: source_id.into(),
            event_id: event_id.into(),
            data,
            visibility: EventVisibility::Internal,
            is_error: false,
        }
    }

    pub fn public(mut self) -> Self {
        self.visibility = EventVisibility::Public;
        self
    }

    pub fn error(mut self) -> Self {
        self.is_error = true;
        self
    }

    /// Routing key into the edge index: `namespace.event_id`.
    pub fn qualified_id(&self) -> String {
        format!("{}.{}", self.namespace, self.event_id)
    }

    pub fn is_public(&self) -> bool {
        self.visibility == EventVisibility::Public
    }
}

/// A routed message addressed to one step of a process.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProcessMessage {
    /// Destination step name, or [`END_STEP_ID`].
    pub destination: String,
    /// Target function; `None` for targets that are not functions.
    #[serde(default)]
    pub function: Option<String>,
    /// Id of the step or process that produced the originating event.
    pub source_id: String,
    /// Qualified id of the originating event.
    pub source_event: String,
    /// Parameter bindings.
    #[serde(default)]
    pub values: BTreeMap<String, serde_json::Value>,
    /// Event payload not bound to a named parameter.
    #[serde(default)]
    pub data: Option<serde_json::Value>,
    /// Join group this message contributes to.
    #[serde(default)]
    pub group_id: Option<String>,
    /// Conversation thread name for agent targets.
    #[serde(default)]
    pub thread: Option<String>,
}

impl ProcessMessage {
    pub fn new(destination: impl Into<String>, function: Option<String>) -> Self {
        Self {
            destination: destination.into(),
            function,
            source_id: String::new(),
            source_event: String::new(),
            values: BTreeMap::new(),
            data: None,
            group_id: None,
            thread: None,
        }
    }

    pub fn is_end(&self) -> bool {
        self.destination == END_STEP_ID
    }

    /// The single payload of the message, whether bound or not.
    pub fn payload(&self) -> Option<serde_json::Value> {
        if let Some(data) = &self.data {
            return Some(data.clone());
        }
        match self.values.len() {
            0 => None,
            1 => self.values.values().next().cloned(),
            _ => Some(serde_json::Value::Object(
                self.values
                    .iter()
                    .map(|(k, v)| (k.clone(), v.clone()))
                    .collect(),
            )),
        }
    }
}

/// Persisted user state of a step.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StepState {
    pub name: String,
    pub id: String,
    #[serde(default)]
    pub state_type: Option<String>,
    #[serde(default)]
    pub value: Option<serde_json::Value>,
}

/// Persisted identity record of a process instance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProcessStateRecord {
    pub process_name: String,
    pub process_id: String,
    /// Step name -> assigned child instance id.
    #[serde(default)]
    pub steps: BTreeMap<String, String>,
    /// Messages generated but not yet dispatched when the last run ended.
    #[serde(default)]
    pub pending_messages: Vec<ProcessMessage>,
    /// Shared user state of the process.
    #[serde(default)]
    pub shared_state: Option<serde_json::Value>,
    pub updated_at: DateTime<Utc>,
}

impl ProcessStateRecord {
    pub fn new(process_name: impl Into<String>, process_id: impl Into<String>) -> Self {
        Self {
            process_name: process_name.into(),
            process_id: process_id.into(),
            steps: BTreeMap::new(),
            pending_messages: Vec::new(),
            shared_state: None,
            updated_at: Utc::now(),
        }
    }
}

/// One-time activation status of a step or process.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ActivationState {
    #[default]
    Uninitialized,
    Initializing,
    Ready,
}

impl ActivationState {
    pub fn is_ready(&self) -> bool {
        matches!(self, Self::Ready)
    }
}
