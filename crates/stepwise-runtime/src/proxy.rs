use serde_json::Value;
use tracing::debug;

use stepwise_core::error::{Result, StepwiseError};
use stepwise_core::types::{ProcessEvent, ProcessMessage, StepState};

use crate::info::ProxyInfo;
use crate::services::RuntimeServices;
use crate::snapshot::{StepKind, StepSnapshot};
use crate::step::outcome_event;

/// A step that forwards payloads to an external channel.
///
/// Inbound payloads delivered through the process context surface as
/// public events of this step.
pub struct ProxyStep {
    info: ProxyInfo,
    id: String,
    parent_id: String,
    services: RuntimeServices,
    events: Vec<ProcessEvent>,
}

impl ProxyStep {
    pub fn new(
        info: ProxyInfo,
        id: impl Into<String>,
        parent_id: impl Into<String>,
        services: RuntimeServices,
    ) -> Self {
        Self {
            info,
            id: id.into(),
            parent_id: parent_id.into(),
            services,
            events: Vec::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.info.name
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// Forward the message payload unchanged; a channel failure becomes `OnError`.
    pub async fn handle(&mut self, message: ProcessMessage) -> Result<()> {
        let channel = self
            .services
            .channel
            .clone()
            .ok_or_else(|| StepwiseError::MissingService("external channel".into()))?;
        let function = message.function.clone().unwrap_or_default();
        let topic = self.info.topic_for(&function);
        let payload = message.payload().unwrap_or(Value::Null);

        debug!(step = %self.info.name, topic = %topic, "Forwarding to external channel");
        if let Err(e) = channel.forward(&topic, payload).await {
            self.events
                .push(outcome_event(&self.info.name, &self.id, &function, Err(e)));
        }
        Ok(())
    }

    /// Surface an externally delivered payload as a public event.
    pub fn deliver(&mut self, event_id: impl Into<String>, data: Option<Value>) {
        let event = ProcessEvent::new(&self.info.name, &self.id, event_id, data).public();
        self.events.push(event);
    }

    pub fn take_events(&mut self) -> Vec<ProcessEvent> {
        std::mem::take(&mut self.events)
    }

    pub fn extract_state(&self) -> StepSnapshot {
        StepSnapshot {
            name: self.info.name.clone(),
            id: self.id.clone(),
            parent_id: Some(self.parent_id.clone()),
            kind: StepKind::Proxy,
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
