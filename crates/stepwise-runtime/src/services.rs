use std::sync::Arc;

use stepwise_core::config::RuntimeConfig;
use stepwise_core::traits::{AgentService, EventObserver, ExternalChannel, ProcessStorage};

/// Collaborators handed down the process tree at materialization time.
#[derive(Clone, Default)]
pub struct RuntimeServices {
    pub config: Arc<RuntimeConfig>,
    pub storage: Option<Arc<dyn ProcessStorage>>,
    pub observer: Option<Arc<dyn EventObserver>>,
    pub agents: Option<Arc<dyn AgentService>>,
    pub channel: Option<Arc<dyn ExternalChannel>>,
}

impl std::fmt::Debug for RuntimeServices {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RuntimeServices")
            .field("config", &self.config)
            .field("storage", &self.storage.is_some())
            .field("observer", &self.observer.is_some())
            .field("agents", &self.agents.is_some())
            .field("channel", &self.channel.is_some())
            .finish()
    }
}

impl RuntimeServices {
    pub fn new(config: RuntimeConfig) -> Self {
        Self {
            config: Arc::new(config),
            ..Default::default()
        }
    }

    pub fn with_storage(mut self, storage: Arc<dyn ProcessStorage>) -> Self {
        self.storage = Some(storage);
        self
    }

    pub fn with_observer(mut self, observer: Arc<dyn EventObserver>) -> Self {
        self.observer = Some(observer);
        self
    }

    pub fn with_agents(mut self, agents: Arc<dyn AgentService>) -> Self {
        self.agents = Some(agents);
        self
    }

    pub fn with_channel(mut self, channel: Arc<dyn ExternalChannel>) -> Self {
        self.channel = Some(channel);
        self
    }

    /// Copy for transient instances that must not persist anything.
    pub fn without_storage(&self) -> Self {
        Self {
            storage: None,
            ..self.clone()
        }
    }
}
