use std::collections::BTreeMap;

use serde_json::Value;
use tracing::debug;

use stepwise_core::error::{Result, StepwiseError};
use stepwise_core::types::ProcessMessage;

use crate::edge::EdgeGroup;

/// Join synchronization for one edge group.
///
/// Holds each awaited source's payload until every source has arrived, then
/// yields one combined message and closes.
#[derive(Debug)]
pub struct EdgeGroupProcessor {
    group: EdgeGroup,
    received: BTreeMap<String, Value>,
    closed: bool,
}

impl EdgeGroupProcessor {
    pub fn new(group: EdgeGroup) -> Self {
        Self {
            group,
            received: BTreeMap::new(),
            closed: false,
        }
    }

    pub fn group_id(&self) -> &str {
        &self.group.group_id
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    /// Source event ids still awaited.
    pub fn awaiting(&self) -> Vec<&str> {
        self.group
            .sources
            .iter()
            .filter(|s| !self.received.contains_key(s.as_str()))
            .map(String::as_str)
            .collect()
    }

    /// Record a message; returns the combined message once the join completes.
    pub fn process(&mut self, message: &ProcessMessage) -> Result<Option<ProcessMessage>> {
        if self.closed {
            return Err(StepwiseError::EdgeGroupClosed(self.group.group_id.clone()));
        }
        if !self.group.sources.iter().any(|s| *s == message.source_event) {
            return Err(StepwiseError::Config(format!(
                "event '{}' is not a source of edge group '{}'",
                message.source_event, self.group.group_id
            )));
        }

        self.received.insert(
            message.source_event.clone(),
            message.payload().unwrap_or(Value::Null),
        );

        let remaining = self.awaiting().len();
        if remaining > 0 {
            debug!(
                group = %self.group.group_id,
                source = %message.source_event,
                remaining,
                "Edge group waiting for sources"
            );
            return Ok(None);
        }

        self.closed = true;
        let mut combined = ProcessMessage::new(message.destination.clone(), message.function.clone());
        combined.source_id = message.source_id.clone();
        combined.source_event = message.source_event.clone();
        combined.group_id = Some(self.group.group_id.clone());
        combined.thread = message.thread.clone();

        let received = std::mem::take(&mut self.received);
        if self.group.input_mapping.is_empty() {
            combined.data = Some(Value::Object(received.into_iter().collect()));
        } else {
            for (parameter, source) in &self.group.input_mapping {
                let value = received.get(source).cloned().unwrap_or(Value::Null);
                combined.values.insert(parameter.clone(), value);
            }
        }
        Ok(Some(combined))
    }
}

/// The edge groups feeding a single step, keyed by group id.
#[derive(Debug, Default)]
pub struct EdgeGroups {
    processors: BTreeMap<String, EdgeGroupProcessor>,
}

impl EdgeGroups {
    pub fn new(groups: impl IntoIterator<Item = EdgeGroup>) -> Self {
        let processors = groups
            .into_iter()
            .map(|g| (g.group_id.clone(), EdgeGroupProcessor::new(g)))
            .collect();
        Self { processors }
    }

    pub fn is_empty(&self) -> bool {
        self.processors.is_empty()
    }

    /// Pass ungrouped messages through; feed grouped ones to their processor.
    pub fn resolve(&mut self, message: ProcessMessage) -> Result<Option<ProcessMessage>> {
        let Some(group_id) = message.group_id.clone() else {
            return Ok(Some(message));
        };
        let processor = self.processors.get_mut(&group_id).ok_or_else(|| {
            StepwiseError::Config(format!(
                "step '{}' has no edge group '{}'",
                message.destination, group_id
            ))
        })?;
        processor.process(&message)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn msg(source: &str, data: Value) -> ProcessMessage {
        let mut m = ProcessMessage::new("C", Some("join".into()));
        m.source_event = source.to_string();
        m.group_id = Some("g".into());
        m.data = Some(data);
        m
    }

    fn group() -> EdgeGroup {
        EdgeGroup::new("g", vec!["A.run.OnResult".into(), "B.run.OnResult".into()])
    }

    #[test]
    fn test_join_waits_for_all_sources() {
        let mut p = EdgeGroupProcessor::new(group());
        assert!(p.process(&msg("A.run.OnResult", json!(1))).unwrap().is_none());
        assert_eq!(p.awaiting(), vec!["B.run.OnResult"]);

        let combined = p.process(&msg("B.run.OnResult", json!(2))).unwrap().unwrap();
        assert_eq!(
            combined.data,
            Some(json!({"A.run.OnResult": 1, "B.run.OnResult": 2}))
        );
        assert!(p.is_closed());
    }

    #[test]
    fn test_join_with_input_mapping() {
        let g = group()
            .map_input("left", "A.run.OnResult")
            .map_input("right", "B.run.OnResult");
        let mut p = EdgeGroupProcessor::new(g);
        p.process(&msg("B.run.OnResult", json!("b"))).unwrap();
        let combined = p.process(&msg("A.run.OnResult", json!("a"))).unwrap().unwrap();
        assert_eq!(combined.values.get("left"), Some(&json!("a")));
        assert_eq!(combined.values.get("right"), Some(&json!("b")));
        assert!(combined.data.is_none());
    }

    #[test]
    fn test_repeated_source_overwrites() {
        let mut p = EdgeGroupProcessor::new(group());
        p.process(&msg("A.run.OnResult", json!(1))).unwrap();
        p.process(&msg("A.run.OnResult", json!(5))).unwrap();
        let combined = p.process(&msg("B.run.OnResult", json!(2))).unwrap().unwrap();
        assert_eq!(combined.data.unwrap()["A.run.OnResult"], json!(5));
    }

    #[test]
    fn test_closed_group_rejects_messages() {
        let mut p = EdgeGroupProcessor::new(group());
        p.process(&msg("A.run.OnResult", json!(1))).unwrap();
        p.process(&msg("B.run.OnResult", json!(2))).unwrap();
        let err = p.process(&msg("A.run.OnResult", json!(3))).unwrap_err();
        assert!(matches!(err, StepwiseError::EdgeGroupClosed(_)));
    }

    #[test]
    fn test_unknown_source_rejected() {
        let mut p = EdgeGroupProcessor::new(group());
        assert!(p.process(&msg("Z.run.OnResult", json!(1))).is_err());
    }

    #[test]
    fn test_groups_pass_through_ungrouped() {
        let mut groups = EdgeGroups::new(vec![group()]);
        let mut plain = ProcessMessage::new("C", Some("join".into()));
        plain.data = Some(json!(1));
        assert_eq!(groups.resolve(plain.clone()).unwrap(), Some(plain));

        let mut unknown = msg("A.run.OnResult", json!(1));
        unknown.group_id = Some("other".into());
        assert!(groups.resolve(unknown).is_err());
    }
}
