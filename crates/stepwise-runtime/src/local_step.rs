use std::sync::Arc;

use futures::future::BoxFuture;

use stepwise_core::error::{Result, StepwiseError};
use stepwise_core::types::{ProcessEvent, ProcessMessage};

use crate::agent::{AgentStep, ThreadRegistry};
use crate::edge_group::EdgeGroups;
use crate::info::StepKindInfo;
use crate::map::MapStep;
use crate::process::LocalProcess;
use crate::proxy::ProxyStep;
use crate::services::RuntimeServices;
use crate::snapshot::StepSnapshot;
use crate::step::FunctionStep;

/// A materialized child of a process, one variant per step kind.
pub enum LocalStep {
    Function(FunctionStep),
    Process(LocalProcess),
    Map(MapStep),
    Proxy(ProxyStep),
    Agent(AgentStep),
}

/// Identity and shared collaborators handed to a child at materialization.
pub(crate) struct ChildContext<'a> {
    pub id: String,
    pub parent_id: &'a str,
    pub root_id: &'a str,
    pub services: &'a RuntimeServices,
    pub threads: &'a Arc<ThreadRegistry>,
    pub groups: EdgeGroups,
}

impl LocalStep {
    pub(crate) fn materialize(info: &StepKindInfo, cx: ChildContext<'_>) -> Self {
        let services = cx.services.clone();
        match info {
            StepKindInfo::Function(step) => Self::Function(FunctionStep::new(
                step.clone(),
                cx.id,
                cx.parent_id,
                services,
                cx.groups,
            )),
            StepKindInfo::Process(process) => Self::Process(
                LocalProcess::nested(
                    Arc::new(process.clone()),
                    cx.id,
                    cx.parent_id,
                    cx.root_id,
                    services,
                )
                .with_input_groups(cx.groups),
            ),
            StepKindInfo::Map(map) => Self::Map(MapStep::new(
                map.clone(),
                cx.id,
                cx.parent_id,
                cx.root_id,
                services,
                cx.groups,
            )),
            StepKindInfo::Proxy(proxy) => {
                Self::Proxy(ProxyStep::new(proxy.clone(), cx.id, cx.parent_id, services))
            }
            StepKindInfo::Agent(agent) => Self::Agent(AgentStep::new(
                agent.clone(),
                cx.id,
                cx.parent_id,
                services,
                cx.threads.clone(),
                cx.groups,
            )),
        }
    }

    pub fn name(&self) -> &str {
        match self {
            Self::Function(s) => s.name(),
            Self::Process(p) => p.name(),
            Self::Map(m) => m.name(),
            Self::Proxy(p) => p.name(),
            Self::Agent(a) => a.name(),
        }
    }

    pub fn id(&self) -> &str {
        match self {
            Self::Function(s) => s.id(),
            Self::Process(p) => p.id(),
            Self::Map(m) => m.id(),
            Self::Proxy(p) => p.id(),
            Self::Agent(a) => a.id(),
        }
    }

    /// Deliver one message. A nested process runs to quiescence before this returns.
    pub fn handle(&mut self, message: ProcessMessage) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move {
            match self {
                Self::Function(s) => s.handle(message).await,
                Self::Process(p) => p.handle_message(message).await,
                Self::Map(m) => m.handle(message).await,
                Self::Proxy(p) => p.handle(message).await,
                Self::Agent(a) => a.handle(message).await,
            }
        })
    }

    /// Events produced since the last call, in emission order.
    ///
    /// Events surfaced by a nested process are re-namespaced under the
    /// nested process's step name.
    pub fn take_events(&mut self) -> Vec<ProcessEvent> {
        match self {
            Self::Function(s) => s.take_events(),
            Self::Process(p) => p.take_surfaced_events(),
            Self::Map(m) => m.take_events(),
            Self::Proxy(p) => p.take_events(),
            Self::Agent(a) => a.take_events(),
        }
    }

    pub fn extract_state(&mut self) -> BoxFuture<'_, Result<StepSnapshot>> {
        Box::pin(async move {
            match self {
                Self::Function(s) => s.extract_state().await,
                Self::Process(p) => p.extract_state().await,
                Self::Map(m) => Ok(m.extract_state()),
                Self::Proxy(p) => Ok(p.extract_state()),
                Self::Agent(a) => Ok(a.extract_state()),
            }
        })
    }

    /// Persist the step; processes save their record before their children.
    pub fn persist(&self) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move {
            match self {
                Self::Function(s) => s.persist().await,
                Self::Process(p) => p.persist().await,
                _ => Ok(()),
            }
        })
    }

    pub fn deinitialize(&mut self) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move {
            match self {
                Self::Function(s) => s.deinitialize(),
                Self::Process(p) => p.deinitialize().await?,
                Self::Map(m) => m.deinitialize(),
                Self::Proxy(p) => p.deinitialize(),
                Self::Agent(a) => a.deinitialize(),
            }
            Ok(())
        })
    }

    /// Surface an externally delivered payload on a proxy step.
    pub fn deliver(&mut self, event_id: &str, data: Option<serde_json::Value>) -> Result<()> {
        match self {
            Self::Proxy(p) => {
                p.deliver(event_id, data);
                Ok(())
            }
            other => Err(StepwiseError::Config(format!(
                "step '{}' is not a proxy step",
                other.name()
            ))),
        }
    }
}
