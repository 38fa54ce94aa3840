use serde::{Deserialize, Serialize};

use stepwise_core::types::StepState;

use crate::edge::EdgeMap;

/// Variant tag of a step in a snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepKind {
    Function,
    Process,
    Map,
    Proxy,
    Agent,
}

/// Immutable view of a step (and, for processes, its whole subtree).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepSnapshot {
    pub name: String,
    pub id: String,
    /// `None` only for the root process.
    pub parent_id: Option<String>,
    pub kind: StepKind,
    /// Persisted user state; for processes, the shared state.
    pub state: StepState,
    pub edges: EdgeMap,
    #[serde(default)]
    pub steps: Vec<StepSnapshot>,
}

impl StepSnapshot {
    /// Depth-first lookup by step name.
    pub fn find(&self, name: &str) -> Option<&StepSnapshot> {
        if self.name == name {
            return Some(self);
        }
        self.steps.iter().find_map(|s| s.find(name))
    }
}
