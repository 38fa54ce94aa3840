use std::collections::BTreeMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use stepwise_core::error::{Result, StepwiseError};
use stepwise_core::types::{ProcessEvent, ProcessMessage, END_STEP_ID};

/// Edge index: qualified event id -> edges in declaration order.
pub type EdgeMap = BTreeMap<String, Vec<Edge>>;

/// Guard predicate evaluated against the event and the shared state.
pub type ConditionFn = Arc<dyn Fn(&ProcessEvent, &Value) -> Result<bool> + Send + Sync>;

/// A routing rule from an emitted event to a target.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Edge {
    /// Name of the step (or process) that emits the source event.
    #[serde(default)]
    pub source: String,
    pub target: EdgeTarget,
    /// Guard that must hold for the edge to fire.
    #[serde(default)]
    pub condition: EdgeCondition,
    /// Catch-all edge, considered only when no other edge for the event matched.
    #[serde(default)]
    pub is_default: bool,
    /// Join group the produced message belongs to.
    #[serde(default)]
    pub group: Option<EdgeGroup>,
}

/// What an edge does when it fires.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EdgeTarget {
    /// Invoke a function on a step. `parameter` binds the event payload.
    Function {
        step: String,
        function: String,
        #[serde(default)]
        parameter: Option<String>,
    },
    /// Mutate the shared process state.
    State {
        path: String,
        operation: StateOperation,
        #[serde(default)]
        value: Option<Value>,
    },
    /// Surface a process-scoped public event; queues no message.
    Emit { event: String },
    /// Invoke an agent step, optionally overriding its conversation thread.
    Agent {
        step: String,
        function: String,
        #[serde(default)]
        parameter: Option<String>,
        #[serde(default)]
        thread: Option<String>,
    },
}

/// Operation applied to a path of the shared state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StateOperation {
    Set,
    Increment,
    Decrement,
    Append,
    Remove,
}

/// Condition for traversing an edge.
#[derive(Clone, Default, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EdgeCondition {
    /// Always traverse this edge.
    #[default]
    Always,
    /// Traverse if a simple expression over `event` and `state` holds.
    /// Supported: `==`, `!=`, `contains`, `>`, `>=`, `<`, `<=`.
    Expr { expr: String },
    /// Traverse if a predicate returns true. Not serializable.
    #[serde(skip)]
    Predicate(ConditionFn),
}

impl std::fmt::Debug for EdgeCondition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Always => write!(f, "Always"),
            Self::Expr { expr } => f.debug_struct("Expr").field("expr", expr).finish(),
            Self::Predicate(_) => write!(f, "Predicate(<fn>)"),
        }
    }
}

impl EdgeCondition {
    pub fn evaluate(&self, event: &ProcessEvent, state: &Value) -> Result<bool> {
        match self {
            Self::Always => Ok(true),
            Self::Expr { expr } => evaluate_condition(expr, event, state),
            Self::Predicate(predicate) => predicate(event, state),
        }
    }
}

/// Join declaration: the message is held until every source has arrived.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EdgeGroup {
    pub group_id: String,
    /// Qualified event ids that must all arrive.
    pub sources: Vec<String>,
    /// Parameter name -> source event id. Empty delivers the combined map unbound.
    #[serde(default)]
    pub input_mapping: BTreeMap<String, String>,
}

impl EdgeGroup {
    pub fn new(group_id: impl Into<String>, sources: Vec<String>) -> Self {
        Self {
            group_id: group_id.into(),
            sources,
            input_mapping: BTreeMap::new(),
        }
    }

    pub fn map_input(mut self, parameter: impl Into<String>, source: impl Into<String>) -> Self {
        self.input_mapping.insert(parameter.into(), source.into());
        self
    }
}

impl Edge {
    fn with_target(target: EdgeTarget) -> Self {
        Self {
            source: String::new(),
            target,
            condition: EdgeCondition::Always,
            is_default: false,
            group: None,
        }
    }

    /// Edge invoking `function` on `step`.
    pub fn to_function(step: impl Into<String>, function: impl Into<String>) -> Self {
        Self::with_target(EdgeTarget::Function {
            step: step.into(),
            function: function.into(),
            parameter: None,
        })
    }

    /// Edge ending the process run.
    pub fn to_end() -> Self {
        Self::with_target(EdgeTarget::Function {
            step: END_STEP_ID.to_string(),
            function: String::new(),
            parameter: None,
        })
    }

    /// Edge mutating the shared state. `value = None` applies the event payload.
    pub fn to_state(path: impl Into<String>, operation: StateOperation, value: Option<Value>) -> Self {
        Self::with_target(EdgeTarget::State {
            path: path.into(),
            operation,
            value,
        })
    }

    pub fn to_emit(event: impl Into<String>) -> Self {
        Self::with_target(EdgeTarget::Emit {
            event: event.into(),
        })
    }

    pub fn to_agent(step: impl Into<String>, function: impl Into<String>) -> Self {
        Self::with_target(EdgeTarget::Agent {
            step: step.into(),
            function: function.into(),
            parameter: None,
            thread: None,
        })
    }

    /// Bind the event payload to a named parameter.
    pub fn with_parameter(mut self, name: impl Into<String>) -> Self {
        match &mut self.target {
            EdgeTarget::Function { parameter, .. } | EdgeTarget::Agent { parameter, .. } => {
                *parameter = Some(name.into());
            }
            _ => {}
        }
        self
    }

    /// Route agent invocations through a specific named thread.
    pub fn with_thread(mut self, name: impl Into<String>) -> Self {
        if let EdgeTarget::Agent { thread, .. } = &mut self.target {
            *thread = Some(name.into());
        }
        self
    }

    pub fn from_source(mut self, source: impl Into<String>) -> Self {
        self.source = source.into();
        self
    }

    pub fn when(mut self, expr: impl Into<String>) -> Self {
        self.condition = EdgeCondition::Expr { expr: expr.into() };
        self
    }

    pub fn when_fn<F>(mut self, predicate: F) -> Self
    where
        F: Fn(&ProcessEvent, &Value) -> Result<bool> + Send + Sync + 'static,
    {
        self.condition = EdgeCondition::Predicate(Arc::new(predicate));
        self
    }

    pub fn as_default(mut self) -> Self {
        self.is_default = true;
        self
    }

    pub fn in_group(mut self, group: EdgeGroup) -> Self {
        self.group = Some(group);
        self
    }

    /// Destination step of message-producing targets.
    pub fn target_step(&self) -> Option<&str> {
        match &self.target {
            EdgeTarget::Function { step, .. } | EdgeTarget::Agent { step, .. } => Some(step),
            _ => None,
        }
    }

    /// Build the routed message for a function or agent target.
    pub fn build_message(&self, event: &ProcessEvent) -> Result<ProcessMessage> {
        let (step, function, parameter, thread) = match &self.target {
            EdgeTarget::Function {
                step,
                function,
                parameter,
            } => (step, function, parameter, None),
            EdgeTarget::Agent {
                step,
                function,
                parameter,
                thread,
            } => (step, function, parameter, thread.clone()),
            other => {
                return Err(StepwiseError::UnsupportedEdgeTarget(format!(
                    "{:?} does not produce messages",
                    other
                )))
            }
        };

        let function = (!function.is_empty()).then(|| function.clone());
        let mut message = ProcessMessage::new(step.clone(), function);
        message.source_id = event.source_id.clone();
        message.source_event = event.qualified_id();
        message.group_id = self.group.as_ref().map(|g| g.group_id.clone());
        message.thread = thread;
        match parameter {
            Some(name) => {
                message
                    .values
                    .insert(name.clone(), event.data.clone().unwrap_or(Value::Null));
            }
            None => message.data = event.data.clone(),
        }
        Ok(message)
    }
}

/// Evaluate a conditional expression against an event and the shared state.
///
/// The left-hand side is a dotted path rooted at `event` (the payload) or
/// `state`. The right-hand side is a quoted string or a JSON literal.
/// A path that does not resolve evaluates to `false`; an expression that
/// cannot be parsed is an error.
pub fn evaluate_condition(expr: &str, event: &ProcessEvent, state: &Value) -> Result<bool> {
    let expr = expr.trim();
    let (path, op, literal) = split_expression(expr)
        .ok_or_else(|| StepwiseError::Condition(format!("unrecognized expression '{}'", expr)))?;

    let expected = parse_literal(literal)
        .ok_or_else(|| StepwiseError::Condition(format!("invalid literal in '{}'", expr)))?;
    let actual = match resolve_path(path, event, state)? {
        Some(v) => v,
        None => return Ok(false),
    };
    Ok(compare(op, actual, &expected))
}

/// Split `path OP literal`. The path is a leading run of identifier
/// characters and dots; the operator must follow it directly, so operator
/// text inside the path or the literal is never mistaken for one.
fn split_expression(expr: &str) -> Option<(&str, &'static str, &str)> {
    let end = expr
        .find(|c: char| !(c.is_ascii_alphanumeric() || c == '_' || c == '.'))
        .unwrap_or(expr.len());
    let (path, rest) = expr.split_at(end);
    if path.is_empty() {
        return None;
    }

    let rest = rest.trim_start();
    // Longer operators first so `>=` is not read as `>`.
    let op = ["contains", ">=", "<=", "!=", "==", ">", "<"]
        .into_iter()
        .find(|op| rest.starts_with(op))?;
    let literal = rest[op.len()..].trim();
    if literal.is_empty() {
        return None;
    }
    Some((path, op, literal))
}

fn parse_literal(literal: &str) -> Option<Value> {
    if literal.len() >= 2 && literal.starts_with('"') && literal.ends_with('"') {
        return Some(Value::String(literal[1..literal.len() - 1].to_string()));
    }
    serde_json::from_str(literal).ok()
}

fn resolve_path<'a>(
    path: &str,
    event: &'a ProcessEvent,
    state: &'a Value,
) -> Result<Option<&'a Value>> {
    let mut segments = path.split('.');
    let root = match segments.next() {
        Some("event") => match &event.data {
            Some(data) => data,
            None => return Ok(None),
        },
        Some("state") => state,
        _ => {
            return Err(StepwiseError::Condition(format!(
                "path '{}' must start with 'event' or 'state'",
                path
            )))
        }
    };

    let mut current = root;
    for segment in segments {
        current = match current {
            Value::Object(map) => match map.get(segment) {
                Some(v) => v,
                None => return Ok(None),
            },
            Value::Array(items) => match segment.parse::<usize>().ok().and_then(|i| items.get(i)) {
                Some(v) => v,
                None => return Ok(None),
            },
            _ => return Ok(None),
        };
    }
    Ok(Some(current))
}

fn compare(op: &str, actual: &Value, expected: &Value) -> bool {
    match op {
        "contains" => match (actual, expected) {
            (Value::String(s), Value::String(sub)) => s.contains(sub.as_str()),
            (Value::Array(items), v) => items.contains(v),
            _ => false,
        },
        "==" => values_equal(actual, expected),
        "!=" => !values_equal(actual, expected),
        _ => match (actual.as_f64(), expected.as_f64()) {
            (Some(a), Some(b)) => match op {
                ">" => a > b,
                ">=" => a >= b,
                "<" => a < b,
                "<=" => a <= b,
                _ => false,
            },
            _ => false,
        },
    }
}

fn values_equal(a: &Value, b: &Value) -> bool {
    match (a.as_f64(), b.as_f64()) {
        (Some(x), Some(y)) => x == y,
        _ => a == b,
    }
}

/// Apply a state operation at a dotted path of a JSON tree.
pub fn apply_state_operation(
    root: &mut Value,
    path: &str,
    operation: StateOperation,
    value: Value,
) -> Result<()> {
    let segments: Vec<&str> = path.split('.').filter(|s| !s.is_empty()).collect();
    let Some((last, parents)) = segments.split_last() else {
        return match operation {
            StateOperation::Set => {
                *root = value;
                Ok(())
            }
            _ => Err(StepwiseError::StateUpdate(format!(
                "{:?} requires a non-empty path",
                operation
            ))),
        };
    };

    let mut current = root;
    for segment in parents {
        if current.is_null() {
            *current = Value::Object(Default::default());
        }
        current = match current {
            Value::Object(map) => map
                .entry(segment.to_string())
                .or_insert(Value::Null),
            _ => {
                return Err(StepwiseError::StateUpdate(format!(
                    "'{}' in path '{}' is not an object",
                    segment, path
                )))
            }
        };
    }

    if current.is_null() {
        *current = Value::Object(Default::default());
    }
    let map = current.as_object_mut().ok_or_else(|| {
        StepwiseError::StateUpdate(format!("parent of '{}' is not an object", path))
    })?;

    match operation {
        StateOperation::Set => {
            map.insert(last.to_string(), value);
        }
        StateOperation::Increment | StateOperation::Decrement => {
            let delta = if value.is_null() {
                1.0
            } else {
                value.as_f64().ok_or_else(|| {
                    StepwiseError::StateUpdate(format!("'{}' is not a number", value))
                })?
            };
            let delta = if operation == StateOperation::Decrement {
                -delta
            } else {
                delta
            };
            let slot = map.entry(last.to_string()).or_insert(Value::from(0));
            *slot = add_number(slot, delta, path)?;
        }
        StateOperation::Append => {
            let slot = map
                .entry(last.to_string())
                .or_insert_with(|| Value::Array(vec![]));
            match slot {
                Value::Array(items) => items.push(value),
                _ => {
                    return Err(StepwiseError::StateUpdate(format!(
                        "'{}' is not an array",
                        path
                    )))
                }
            }
        }
        StateOperation::Remove => {
            map.remove(*last);
        }
    }
    Ok(())
}

fn add_number(current: &Value, delta: f64, path: &str) -> Result<Value> {
    let overflow = || StepwiseError::StateUpdate(format!("'{}' overflows", path));

    let whole_delta = delta.fract() == 0.0 && delta >= i64::MIN as f64 && delta < i64::MAX as f64;
    if let (Some(i), true) = (current.as_i64(), whole_delta) {
        return i.checked_add(delta as i64).map(Value::from).ok_or_else(overflow);
    }
    let sum = current
        .as_f64()
        .ok_or_else(|| StepwiseError::StateUpdate(format!("'{}' is not a number", path)))?
        + delta;
    serde_json::Number::from_f64(sum)
        .map(Value::Number)
        .ok_or_else(overflow)
}
