use futures::StreamExt;
use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use stepwise_core::error::{Result, StepwiseError};
use stepwise_core::types::{
    KernelEvent, ProcessEvent, ProcessMessage, StepState, ON_ERROR_SUFFIX, ON_RESULT_SUFFIX,
};

use crate::edge_group::EdgeGroups;
use crate::info::{MapInfo, MapOperation};
use crate::process::{ExternalInput, LocalProcess, RunPolicy};
use crate::services::RuntimeServices;
use crate::snapshot::{StepKind, StepSnapshot};
use crate::step::{outcome_event, FunctionStep};

/// Function name used when a message to a map step names none.
pub const DEFAULT_MAP_FUNCTION: &str = "map";

/// Fan-out step: runs its operation once per element of an array payload.
pub struct MapStep {
    info: MapInfo,
    id: String,
    parent_id: String,
    root_id: String,
    services: RuntimeServices,
    groups: EdgeGroups,
    events: Vec<ProcessEvent>,
}

impl MapStep {
    pub fn new(
        info: MapInfo,
        id: impl Into<String>,
        parent_id: impl Into<String>,
        root_id: impl Into<String>,
        services: RuntimeServices,
        groups: EdgeGroups,
    ) -> Self {
        Self {
            info,
            id: id.into(),
            parent_id: parent_id.into(),
            root_id: root_id.into(),
            services,
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

    /// Fan out over the payload, then emit one aggregate event.
    ///
    /// Results keep element order. The first failing element fails the whole
    /// map with an `OnError` event.
    pub async fn handle(&mut self, message: ProcessMessage) -> Result<()> {
        let Some(message) = self.groups.resolve(message)? else {
            return Ok(());
        };
        let function = message
            .function
            .clone()
            .unwrap_or_else(|| DEFAULT_MAP_FUNCTION.to_string());

        let items = match message.payload() {
            Some(Value::Array(items)) => items,
            other => {
                let err = StepwiseError::invocation(
                    &self.info.name,
                    &function,
                    format!("expected an array payload, got {}", describe(&other)),
                );
                self.events
                    .push(outcome_event(&self.info.name, &self.id, &function, Err(err)));
                return Ok(());
            }
        };

        let concurrency = self.services.config.process.map_concurrency.max(1);
        let services = self.services.without_storage();
        debug!(step = %self.info.name, items = items.len(), concurrency, "Fanning out map step");

        let results: Vec<Result<Value>> = futures::stream::iter(items.into_iter().enumerate())
            .map(|(index, item)| {
                let instance_id = format!("{}/{}", self.id, index);
                run_instance(
                    &self.info.operation,
                    instance_id,
                    &self.id,
                    &self.root_id,
                    services.clone(),
                    item,
                )
            })
            .buffered(concurrency)
            .collect()
            .await;

        let mut outputs = Vec::with_capacity(results.len());
        let mut failure = None;
        for (index, result) in results.into_iter().enumerate() {
            match result {
                Ok(value) => outputs.push(value),
                Err(e) => {
                    failure = Some(StepwiseError::invocation(
                        &self.info.name,
                        &function,
                        format!("element {} failed: {}", index, e),
                    ));
                    break;
                }
            }
        }

        let outcome = match failure {
            Some(err) => Err(err),
            None => Ok(Value::Array(outputs)),
        };
        self.events
            .push(outcome_event(&self.info.name, &self.id, &function, outcome));
        Ok(())
    }

    pub fn take_events(&mut self) -> Vec<ProcessEvent> {
        std::mem::take(&mut self.events)
    }

    pub fn extract_state(&self) -> StepSnapshot {
        StepSnapshot {
            name: self.info.name.clone(),
            id: self.id.clone(),
            parent_id: Some(self.parent_id.clone()),
            kind: StepKind::Map,
            state: StepState {
                name: self.info.name.clone(),
                id: self.id.clone(),
                ..Default::default()
            },
            edges: self.info.edges.clone(),
            steps: vec![],
        }
    }

    pub fn deinitialize(&mut self) {
        self.events.clear();
    }
}

fn describe(value: &Option<Value>) -> &'static str {
    match value {
        None | Some(Value::Null) => "nothing",
        Some(Value::Bool(_)) => "a boolean",
        Some(Value::Number(_)) => "a number",
        Some(Value::String(_)) => "a string",
        Some(Value::Object(_)) => "an object",
        Some(Value::Array(_)) => "an array",
    }
}

/// Run one element through the map operation and return its output.
async fn run_instance(
    operation: &MapOperation,
    instance_id: String,
    map_id: &str,
    root_id: &str,
    services: RuntimeServices,
    item: Value,
) -> Result<Value> {
    match operation {
        MapOperation::Step(info) => {
            let mut step = FunctionStep::new(
                info.clone(),
                instance_id,
                map_id,
                services,
                EdgeGroups::default(),
            );
            let mut message = ProcessMessage::new(info.name.clone(), None);
            message.data = Some(item);
            step.handle(message).await?;

            let outcome = step.take_events().into_iter().rev().find(|e| {
                e.event_id.ends_with(ON_RESULT_SUFFIX) || e.event_id.ends_with(ON_ERROR_SUFFIX)
            });
            match outcome {
                Some(event) if event.is_error => Err(failure_of(&info.name, &event)),
                Some(event) => Ok(event.data.unwrap_or(Value::Null)),
                None => Err(StepwiseError::Config(format!(
                    "map step '{}' produced no result",
                    info.name
                ))),
            }
        }
        MapOperation::Process {
            process,
            input_event,
            output_event,
        } => {
            let nested = LocalProcess::nested(process.clone(), instance_id, map_id, root_id, services);
            nested.send(ExternalInput::Event(
                KernelEvent::new(input_event.clone()).with_data(item),
            ));
            nested
                .run(RunPolicy::RunOnce, CancellationToken::new())
                .await?;

            let surfaced = nested.take_outgoing();
            if let Some(event) = surfaced.iter().find(|e| e.is_error) {
                return Err(failure_of(process.name.as_str(), event));
            }
            surfaced
                .into_iter()
                .rev()
                .find(|e| nested.surface_id(e) == *output_event)
                .map(|e| e.data.unwrap_or(Value::Null))
                .ok_or_else(|| {
                    StepwiseError::Config(format!(
                        "process '{}' did not emit '{}'",
                        process.name, output_event
                    ))
                })
        }
    }
}

fn failure_of(step: &str, event: &ProcessEvent) -> StepwiseError {
    let message = event
        .data
        .as_ref()
        .and_then(|d| d.get("message"))
        .and_then(Value::as_str)
        .map(String::from)
        .unwrap_or_else(|| json!(event.data).to_string());
    StepwiseError::invocation(step, event.event_id.clone(), message)
}
