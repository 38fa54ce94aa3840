use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde_json::Value;
use tokio::sync::RwLock;

use stepwise_core::error::{Result, StepwiseError};

use crate::edge::{apply_state_operation, StateOperation};

/// Checks that a JSON view still deserializes into the declared state type.
pub type StateValidator = Arc<dyn Fn(&Value) -> Result<()> + Send + Sync>;

/// Holder of a process's shared user state.
///
/// Writers go through [`StateManager::reduce`], which holds the write lock for
/// the whole read-modify-write so concurrent reducers never interleave.
pub struct StateManager {
    state_type: Option<String>,
    validate: Option<StateValidator>,
    value: RwLock<Value>,
}

impl std::fmt::Debug for StateManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StateManager")
            .field("state_type", &self.state_type)
            .finish_non_exhaustive()
    }
}

impl StateManager {
    /// Untyped state starting from `initial`.
    pub fn new(initial: Value) -> Self {
        Self {
            state_type: None,
            validate: None,
            value: RwLock::new(initial),
        }
    }

    /// State checked against a declared type after every reduce.
    pub fn typed(type_name: impl Into<String>, initial: Value, validate: StateValidator) -> Self {
        Self {
            state_type: Some(type_name.into()),
            validate: Some(validate),
            value: RwLock::new(initial),
        }
    }

    pub fn state_type(&self) -> Option<&str> {
        self.state_type.as_deref()
    }

    /// Atomically replace the state with `transform(type, current)`.
    ///
    /// A failed transform or validation leaves the state untouched.
    pub async fn reduce<F>(&self, transform: F) -> Result<Value>
    where
        F: FnOnce(Option<&str>, &Value) -> Result<Value>,
    {
        let mut guard = self.value.write().await;
        let next = transform(self.state_type.as_deref(), &guard)?;
        if let Some(validate) = &self.validate {
            validate(&next)?;
        }
        *guard = next.clone();
        Ok(next)
    }

    /// Apply a path operation through [`reduce`](Self::reduce).
    pub async fn apply(&self, path: &str, operation: StateOperation, value: Value) -> Result<Value> {
        self.reduce(|_, current| {
            let mut next = current.clone();
            apply_state_operation(&mut next, path, operation, value)?;
            Ok(next)
        })
        .await
    }

    pub async fn replace(&self, value: Value) -> Result<Value> {
        self.reduce(|_, _| Ok(value)).await
    }

    /// Current snapshot.
    pub async fn get_state(&self) -> Value {
        self.value.read().await.clone()
    }

    pub async fn get_typed<T: DeserializeOwned>(&self) -> Result<T> {
        let value = self.get_state().await;
        Ok(serde_json::from_value(value)?)
    }
}

/// Validator that round-trips the JSON view through `T`.
pub fn validator_for<T: DeserializeOwned + 'static>() -> StateValidator {
    Arc::new(|value: &Value| {
        serde_json::from_value::<T>(value.clone())
            .map(|_| ())
            .map_err(|e| StepwiseError::StateUpdate(e.to_string()))
    })
}
