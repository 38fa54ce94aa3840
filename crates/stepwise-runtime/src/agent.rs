use std::collections::BTreeMap;
use std::sync::Arc;

use tracing::{debug, info, warn};

use stepwise_core::error::{Result, StepwiseError};
use stepwise_core::traits::AgentService;
use stepwise_core::types::{ProcessEvent, ProcessMessage, StepState};

use crate::edge_group::EdgeGroups;
use crate::info::{AgentStepInfo, ThreadDeclaration, ThreadPolicy};
use crate::services::RuntimeServices;
use crate::snapshot::{StepKind, StepSnapshot};
use crate::step::{outcome_event, FunctionTable};

/// A declared thread and, for scoped threads, its backing id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ThreadHandle {
    pub policy: ThreadPolicy,
    pub thread_id: Option<String>,
}

/// Named conversation threads of one process instance.
#[derive(Debug, Default)]
pub struct ThreadRegistry {
    threads: BTreeMap<String, ThreadHandle>,
}

impl ThreadRegistry {
    /// Register declared threads, eagerly creating scoped ones.
    pub async fn create(
        declarations: &BTreeMap<String, ThreadDeclaration>,
        agents: Option<&Arc<dyn AgentService>>,
    ) -> Result<Self> {
        let mut threads = BTreeMap::new();
        for (name, declaration) in declarations {
            let thread_id = match (declaration.policy, agents) {
                (ThreadPolicy::Scoped, Some(agents)) => {
                    let id = agents.create_thread().await?;
                    info!(thread = %name, thread_id = %id, "Created scoped thread");
                    Some(id)
                }
                _ => None,
            };
            threads.insert(
                name.clone(),
                ThreadHandle {
                    policy: declaration.policy,
                    thread_id,
                },
            );
        }
        Ok(Self { threads })
    }

    pub fn get(&self, name: &str) -> Option<&ThreadHandle> {
        self.threads.get(name)
    }

    /// Backing ids of scoped threads.
    pub fn scoped_ids(&self) -> BTreeMap<String, String> {
        self.threads
            .iter()
            .filter_map(|(name, h)| h.thread_id.clone().map(|id| (name.clone(), id)))
            .collect()
    }

    /// Delete scoped threads; used when the owning process is torn down.
    pub async fn release(&mut self, agents: Option<&Arc<dyn AgentService>>) -> Result<()> {
        let Some(agents) = agents else {
            return Ok(());
        };
        for handle in self.threads.values_mut() {
            if let Some(id) = handle.thread_id.take() {
                agents.delete_thread(&id).await?;
            }
        }
        Ok(())
    }
}

/// How a single invocation obtains its thread.
enum ThreadLease {
    Shared(String),
    Owned,
}

/// A step that runs an external agent instead of a local callable.
pub struct AgentStep {
    info: AgentStepInfo,
    id: String,
    parent_id: String,
    services: RuntimeServices,
    threads: Arc<ThreadRegistry>,
    table: FunctionTable,
    groups: EdgeGroups,
    events: Vec<ProcessEvent>,
}

impl AgentStep {
    pub fn new(
        info: AgentStepInfo,
        id: impl Into<String>,
        parent_id: impl Into<String>,
        services: RuntimeServices,
        threads: Arc<ThreadRegistry>,
        groups: EdgeGroups,
    ) -> Self {
        let table = FunctionTable::new(&info.name, vec![info.function.clone()]);
        Self {
            info,
            id: id.into(),
            parent_id: parent_id.into(),
            services,
            threads,
            table,
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

    fn lease(&self, message: &ProcessMessage) -> Result<ThreadLease> {
        let Some(name) = message.thread.as_ref().or(self.info.thread.as_ref()) else {
            return Ok(ThreadLease::Owned);
        };
        let handle = self.threads.get(name).ok_or_else(|| StepwiseError::MissingThread {
            step: self.info.name.clone(),
            thread: name.clone(),
        })?;
        match (&handle.policy, &handle.thread_id) {
            (ThreadPolicy::Scoped, Some(id)) => Ok(ThreadLease::Shared(id.clone())),
            (ThreadPolicy::Scoped, None) => Err(StepwiseError::MissingService(format!(
                "agent service for scoped thread '{}'",
                name
            ))),
            (ThreadPolicy::PerInvocation, _) => Ok(ThreadLease::Owned),
        }
    }

    pub async fn handle(&mut self, message: ProcessMessage) -> Result<()> {
        let Some(message) = self.groups.resolve(message)? else {
            return Ok(());
        };

        let requested = self.table.assign(&message)?;
        let Some(function) = self.table.select(&requested)? else {
            return Ok(());
        };

        let lease = self.lease(&message)?;
        let agents = self
            .services
            .agents
            .clone()
            .ok_or_else(|| StepwiseError::MissingService("agent service".into()))?;
        let args = self.table.args(&function);

        debug!(step = %self.info.name, agent = %self.info.agent, "Invoking agent");
        let result = match lease {
            ThreadLease::Shared(thread_id) => {
                agents.invoke(&self.info.agent, &thread_id, args).await
            }
            ThreadLease::Owned => match agents.create_thread().await {
                Ok(thread_id) => {
                    let result = agents.invoke(&self.info.agent, &thread_id, args).await;
                    if let Err(e) = agents.delete_thread(&thread_id).await {
                        warn!(step = %self.info.name, thread_id = %thread_id, error = %e, "Failed to delete thread");
                    }
                    result
                }
                Err(e) => Err(e),
            },
        };

        self.events
            .push(outcome_event(&self.info.name, &self.id, &function, result));
        self.table.reset(&function);
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
            kind: StepKind::Agent,
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
        self.table = FunctionTable::new(&self.info.name, vec![self.info.function.clone()]);
        self.events.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    use futures::future::BoxFuture;
    use serde_json::{json, Value};
    use stepwise_core::function::FunctionArgs;

    #[derive(Default)]
    struct Agents {
        created: Mutex<Vec<String>>,
        deleted: Mutex<Vec<String>>,
        calls: Mutex<Vec<(String, String)>>,
    }

    impl AgentService for Agents {
        fn create_thread(&self) -> BoxFuture<'_, Result<String>> {
            Box::pin(async move {
                let mut created = self.created.lock().unwrap();
                let id = format!("t{}", created.len());
                created.push(id.clone());
                Ok(id)
            })
        }

        fn invoke<'a>(
            &'a self,
            agent: &'a str,
            thread_id: &'a str,
            args: FunctionArgs,
        ) -> BoxFuture<'a, Result<Value>> {
            Box::pin(async move {
                self.calls
                    .lock()
                    .unwrap()
                    .push((agent.to_string(), thread_id.to_string()));
                Ok(json!({ "reply": args.get("message").cloned() }))
            })
        }

        fn delete_thread<'a>(&'a self, thread_id: &'a str) -> BoxFuture<'a, Result<()>> {
            Box::pin(async move {
                self.deleted.lock().unwrap().push(thread_id.to_string());
                Ok(())
            })
        }
    }

    fn declarations() -> BTreeMap<String, ThreadDeclaration> {
        let mut d = BTreeMap::new();
        d.insert("main".into(), ThreadDeclaration { policy: ThreadPolicy::Scoped });
        d.insert("temp".into(), ThreadDeclaration { policy: ThreadPolicy::PerInvocation });
        d
    }

    fn message(thread: Option<&str>) -> ProcessMessage {
        let mut msg = ProcessMessage::new("Chat", Some("invoke".into()));
        msg.values.insert("message".into(), json!("hi"));
        msg.thread = thread.map(String::from);
        msg
    }

    async fn setup(bound: Option<&str>) -> (Arc<Agents>, AgentStep) {
        let agents = Arc::new(Agents::default());
        let dyn_agents: Arc<dyn AgentService> = agents.clone();
        let registry = ThreadRegistry::create(&declarations(), Some(&dyn_agents))
            .await
            .unwrap();
        let mut info = AgentStepInfo::new("Chat", "assistant");
        info.thread = bound.map(String::from);
        let services = RuntimeServices::default().with_agents(dyn_agents);
        let step = AgentStep::new(info, "p/chat", "p", services, Arc::new(registry), EdgeGroups::default());
        (agents, step)
    }

    #[tokio::test]
    async fn test_scoped_thread_is_shared() {
        let (agents, mut step) = setup(Some("main")).await;
        step.handle(message(None)).await.unwrap();
        step.handle(message(None)).await.unwrap();

        let calls = agents.calls.lock().unwrap().clone();
        assert_eq!(calls.len(), 2);
        assert!(calls.iter().all(|(agent, t)| agent == "assistant" && t == "t0"));

        let events = step.take_events();
        assert_eq!(events[0].qualified_id(), "Chat.invoke.OnResult");
        assert_eq!(events[0].data, Some(json!({"reply": "hi"})));
    }

    #[tokio::test]
    async fn test_per_invocation_thread_is_deleted() {
        let (agents, mut step) = setup(None).await;
        step.handle(message(Some("temp"))).await.unwrap();
        let created = agents.created.lock().unwrap().clone();
        assert_eq!(created.len(), 2);
        assert_eq!(agents.deleted.lock().unwrap().clone(), vec![created[1].clone()]);
    }

    #[tokio::test]
    async fn test_undeclared_thread_is_config_error() {
        let (_, mut step) = setup(None).await;
        let err = step.handle(message(Some("other"))).await.unwrap_err();
        assert!(matches!(err, StepwiseError::MissingThread { thread, .. } if thread == "other"));
    }

    #[tokio::test]
    async fn test_missing_agent_service() {
        let registry = ThreadRegistry::create(&BTreeMap::new(), None).await.unwrap();
        let mut step = AgentStep::new(
            AgentStepInfo::new("Chat", "assistant"),
            "p/chat",
            "p",
            RuntimeServices::default(),
            Arc::new(registry),
            EdgeGroups::default(),
        );
        let err = step.handle(message(None)).await.unwrap_err();
        assert!(matches!(err, StepwiseError::MissingService(_)));
    }

    #[tokio::test]
    async fn test_release_deletes_scoped_threads() {
        let agents = Arc::new(Agents::default());
        let dyn_agents: Arc<dyn AgentService> = agents.clone();
        let mut registry = ThreadRegistry::create(&declarations(), Some(&dyn_agents))
            .await
            .unwrap();
        assert_eq!(registry.scoped_ids().get("main").map(String::as_str), Some("t0"));
        registry.release(Some(&dyn_agents)).await.unwrap();
        assert!(registry.scoped_ids().is_empty());
        assert_eq!(agents.deleted.lock().unwrap().clone(), vec!["t0".to_string()]);
    }
}
