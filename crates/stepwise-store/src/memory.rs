use std::collections::HashMap;

use futures::future::BoxFuture;
use tokio::sync::RwLock;

use stepwise_core::error::Result;
use stepwise_core::traits::ProcessStorage;
use stepwise_core::types::{ProcessStateRecord, StepState};

/// Process storage held in memory; lost when dropped.
#[derive(Debug, Default)]
pub struct InMemoryStorage {
    processes: RwLock<HashMap<(String, String), ProcessStateRecord>>,
    steps: RwLock<HashMap<(String, String), StepState>>,
}

impl InMemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored process records.
    pub async fn process_count(&self) -> usize {
        self.processes.read().await.len()
    }
}

impl ProcessStorage for InMemoryStorage {
    fn initialize(&self) -> BoxFuture<'_, Result<()>> {
        Box::pin(async { Ok(()) })
    }

    fn get_process_state<'a>(
        &'a self,
        process_name: &'a str,
        instance_id: &'a str,
    ) -> BoxFuture<'a, Result<Option<ProcessStateRecord>>> {
        Box::pin(async move {
            let key = (process_name.to_string(), instance_id.to_string());
            Ok(self.processes.read().await.get(&key).cloned())
        })
    }

    fn save_process_state<'a>(
        &'a self,
        process_name: &'a str,
        instance_id: &'a str,
        record: &'a ProcessStateRecord,
    ) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            let key = (process_name.to_string(), instance_id.to_string());
            self.processes.write().await.insert(key, record.clone());
            Ok(())
        })
    }

    fn get_step_state<'a>(
        &'a self,
        step_name: &'a str,
        step_id: &'a str,
    ) -> BoxFuture<'a, Result<Option<StepState>>> {
        Box::pin(async move {
            let key = (step_name.to_string(), step_id.to_string());
            Ok(self.steps.read().await.get(&key).cloned())
        })
    }

    fn save_step_state<'a>(&'a self, state: &'a StepState) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            let key = (state.name.clone(), state.id.clone());
            self.steps.write().await.insert(key, state.clone());
            Ok(())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_process_state_upsert() {
        let storage = InMemoryStorage::new();
        let mut record = ProcessStateRecord::new("P", "p-1");
        record.steps.insert("A".into(), "p-1/a".into());
        storage.save_process_state("P", "p-1", &record).await.unwrap();

        record.steps.insert("B".into(), "p-1/b".into());
        storage.save_process_state("P", "p-1", &record).await.unwrap();

        let loaded = storage.get_process_state("P", "p-1").await.unwrap().unwrap();
        assert_eq!(loaded.steps.len(), 2);
        assert_eq!(storage.process_count().await, 1);
        assert!(storage.get_process_state("P", "p-2").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_step_state_keyed_by_name_and_id() {
        let storage = InMemoryStorage::new();
        let state = StepState {
            name: "A".into(),
            id: "p-1/a".into(),
            state_type: Some("Counter".into()),
            value: Some(serde_json::json!(3)),
        };
        storage.save_step_state(&state).await.unwrap();
        assert_eq!(storage.get_step_state("A", "p-1/a").await.unwrap(), Some(state));
        assert!(storage.get_step_state("A", "other").await.unwrap().is_none());
    }
}
