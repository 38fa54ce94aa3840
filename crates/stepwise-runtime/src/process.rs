use std::collections::{BTreeMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex as StdMutex, MutexGuard};
use std::time::Duration;

use futures::future::join_all;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::{mpsc, Mutex, RwLock};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use stepwise_core::config::UnroutedErrorPolicy;
use stepwise_core::error::{Result, StepwiseError};
use stepwise_core::types::{
    new_child_id, new_instance_id, KernelEvent, ProcessEvent, ProcessMessage,
    ProcessStateRecord, StepState, GLOBAL_ERROR_EVENT, ON_ENTER_EVENT,
};

use crate::agent::ThreadRegistry;
use crate::edge::{Edge, EdgeGroup, EdgeMap, EdgeTarget};
use crate::edge_group::EdgeGroups;
use crate::info::ProcessInfo;
use crate::local_step::{ChildContext, LocalStep};
use crate::services::RuntimeServices;
use crate::snapshot::{StepKind, StepSnapshot};
use crate::state::StateManager;

/// How a run session ends when no messages remain.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunPolicy {
    /// Stop at the first superstep that produces no messages.
    RunOnce,
    /// Wait for external input instead; `None` waits until cancelled.
    KeepAlive { idle_timeout: Option<Duration> },
}

/// Why a run session stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Termination {
    /// A superstep produced no messages.
    Quiescent,
    /// A message addressed the end marker.
    EndReached,
    /// The superstep cap was hit; undispatched messages stay pending.
    StepLimit,
    /// Keep-alive wait expired without input.
    IdleTimeout,
    /// Cancellation was requested.
    Cancelled,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunOutcome {
    pub supersteps: usize,
    pub termination: Termination,
}

/// Input arriving from outside the superstep loop.
#[derive(Debug, Clone)]
pub enum ExternalInput {
    /// An event routed through the process-level edges (`"{process}.{id}"`).
    Event(KernelEvent),
    /// A payload surfaced as a public event of a proxy step.
    Proxy {
        step: String,
        event_id: String,
        data: Option<Value>,
    },
}

struct ChildStep {
    name: String,
    id: String,
    step: Arc<Mutex<LocalStep>>,
}

/// Materialized topology; fixed for the lifetime of the instance.
struct ProcessGraph {
    children: Vec<ChildStep>,
    index: BTreeMap<String, usize>,
    edges: EdgeMap,
    threads: Arc<ThreadRegistry>,
}

enum Wake {
    Input(Option<ExternalInput>),
    Cancelled,
    Idle,
}

/// A process instance: owns its children, edge index and shared state,
/// and runs the superstep loop over them.
pub struct LocalProcess {
    info: Arc<ProcessInfo>,
    id: String,
    parent_id: Option<String>,
    root_id: String,
    services: RuntimeServices,
    graph: RwLock<Option<Arc<ProcessGraph>>>,
    state: StateManager,
    input_groups: StdMutex<EdgeGroups>,
    inbox: StdMutex<VecDeque<ProcessMessage>>,
    external_tx: mpsc::UnboundedSender<ExternalInput>,
    external_rx: Mutex<mpsc::UnboundedReceiver<ExternalInput>>,
    queued: AtomicUsize,
    accepting: AtomicBool,
    on_enter_fired: AtomicBool,
    outgoing: StdMutex<Vec<ProcessEvent>>,
}

fn lock<T>(mutex: &StdMutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

async fn idle(timeout: Option<Duration>) {
    match timeout {
        Some(duration) => tokio::time::sleep(duration).await,
        None => std::future::pending::<()>().await,
    }
}

impl LocalProcess {
    /// Root process with a fresh instance id.
    pub fn new(info: ProcessInfo, services: RuntimeServices) -> Self {
        Self::with_id(Arc::new(info), new_instance_id(), services)
    }

    /// Root process bound to an existing instance id, for resuming.
    pub fn with_id(info: Arc<ProcessInfo>, id: impl Into<String>, services: RuntimeServices) -> Self {
        let id = id.into();
        Self::build(info, id.clone(), None, id, services)
    }

    pub(crate) fn nested(
        info: Arc<ProcessInfo>,
        id: impl Into<String>,
        parent_id: impl Into<String>,
        root_id: impl Into<String>,
        services: RuntimeServices,
    ) -> Self {
        Self::build(info, id.into(), Some(parent_id.into()), root_id.into(), services)
    }

    fn build(
        info: Arc<ProcessInfo>,
        id: String,
        parent_id: Option<String>,
        root_id: String,
        services: RuntimeServices,
    ) -> Self {
        let state = match &info.state {
            Some(spec) => StateManager::typed(
                spec.type_name.clone(),
                spec.default.clone(),
                spec.validate.clone(),
            ),
            None => StateManager::new(Value::Null),
        };
        let (external_tx, external_rx) = mpsc::unbounded_channel();
        Self {
            info,
            id,
            parent_id,
            root_id,
            services,
            graph: RwLock::new(None),
            state,
            input_groups: StdMutex::new(EdgeGroups::default()),
            inbox: StdMutex::new(VecDeque::new()),
            external_tx,
            external_rx: Mutex::new(external_rx),
            queued: AtomicUsize::new(0),
            accepting: AtomicBool::new(false),
            on_enter_fired: AtomicBool::new(false),
            outgoing: StdMutex::new(Vec::new()),
        }
    }

    pub(crate) fn with_input_groups(self, groups: EdgeGroups) -> Self {
        *lock(&self.input_groups) = groups;
        self
    }

    pub fn name(&self) -> &str {
        &self.info.name
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn root_id(&self) -> &str {
        &self.root_id
    }

    pub fn info(&self) -> &ProcessInfo {
        &self.info
    }

    pub fn services(&self) -> &RuntimeServices {
        &self.services
    }

    pub fn state(&self) -> &StateManager {
        &self.state
    }

    /// Queue external input; never blocks.
    pub fn send(&self, input: ExternalInput) {
        self.queued.fetch_add(1, Ordering::SeqCst);
        // The receiver lives as long as `self`.
        let _ = self.external_tx.send(input);
    }

    /// Whether a run loop is still going to drain queued input.
    ///
    /// Read after [`send`](Self::send): when this returns `false` the caller
    /// must start a new run, otherwise the active loop picks the input up.
    pub fn accepts_input(&self) -> bool {
        self.accepting.load(Ordering::SeqCst)
    }

    pub(crate) fn open_input(&self) {
        self.accepting.store(true, Ordering::SeqCst);
    }

    /// Materialize children, resolving persisted ids. Idempotent.
    pub async fn initialize(&self) -> Result<()> {
        self.ensure_initialized().await.map(|_| ())
    }

    /// Materialize children once; later calls return the same graph.
    async fn ensure_initialized(&self) -> Result<Arc<ProcessGraph>> {
        if let Some(graph) = self.graph.read().await.as_ref() {
            return Ok(graph.clone());
        }
        let mut slot = self.graph.write().await;
        if let Some(graph) = slot.as_ref() {
            return Ok(graph.clone());
        }

        let record = match &self.services.storage {
            Some(storage) => storage.get_process_state(&self.info.name, &self.id).await?,
            None => None,
        };
        if let Some(record) = &record {
            if record.process_name != self.info.name || record.process_id != self.id {
                return Err(StepwiseError::ProcessIdentityMismatch {
                    expected: format!("{}/{}", self.info.name, self.id),
                    found: format!("{}/{}", record.process_name, record.process_id),
                });
            }
        }

        let threads = Arc::new(
            ThreadRegistry::create(&self.info.threads, self.services.agents.as_ref()).await?,
        );
        let edges = self.info.edge_index();
        let mut groups = collect_groups(&edges);

        let mut children = Vec::with_capacity(self.info.steps.len());
        let mut index = BTreeMap::new();
        let mut reused = 0usize;
        for step_info in &self.info.steps {
            let name = step_info.name().to_string();
            let id = match record.as_ref().and_then(|r| r.steps.get(&name)) {
                Some(id) => {
                    reused += 1;
                    id.clone()
                }
                None => new_child_id(&self.id),
            };
            let step = LocalStep::materialize(
                step_info,
                ChildContext {
                    id: id.clone(),
                    parent_id: &self.id,
                    root_id: &self.root_id,
                    services: &self.services,
                    threads: &threads,
                    groups: EdgeGroups::new(groups.remove(&name).unwrap_or_default()),
                },
            );
            index.insert(name.clone(), children.len());
            children.push(ChildStep {
                name,
                id,
                step: Arc::new(Mutex::new(step)),
            });
        }

        if let Some(record) = record {
            if let Some(shared) = record.shared_state {
                self.state.replace(shared).await?;
            }
            lock(&self.inbox).extend(record.pending_messages);
        }

        let graph = Arc::new(ProcessGraph {
            children,
            index,
            edges,
            threads,
        });
        self.save_record(&graph).await?;
        *slot = Some(graph.clone());

        info!(
            process = %self.info.name,
            id = %self.id,
            root = %self.root_id,
            steps = graph.children.len(),
            reused,
            "Process initialized"
        );
        Ok(graph)
    }

    /// Run supersteps until the policy says stop.
    ///
    /// Configuration errors abort the run; reaching the superstep cap does not.
    pub async fn run(&self, policy: RunPolicy, cancel: CancellationToken) -> Result<RunOutcome> {
        let result = self.run_supersteps(policy, cancel).await;
        self.accepting.store(false, Ordering::SeqCst);
        result
    }

    async fn run_supersteps(
        &self,
        policy: RunPolicy,
        cancel: CancellationToken,
    ) -> Result<RunOutcome> {
        let graph = self.ensure_initialized().await?;
        let max_supersteps = self.services.config.process.max_supersteps;
        let mut rx = self.external_rx.lock().await;
        let mut supersteps = 0usize;

        debug!(process = %self.info.name, id = %self.id, ?policy, "Process run started");

        self.open_input();
        let termination = loop {
            let termination = loop {
                if cancel.is_cancelled() {
                    break Termination::Cancelled;
                }

                let mut messages = Vec::new();

                if !self.on_enter_fired.swap(true, Ordering::SeqCst) {
                    let enter = ProcessEvent::new(&self.info.name, &self.id, ON_ENTER_EVENT, None);
                    self.apply_edges(graph.edges.get(ON_ENTER_EVENT), &enter, &mut messages)
                        .await?;
                }

                messages.extend(lock(&self.inbox).drain(..));

                while let Ok(input) = rx.try_recv() {
                    self.accept_input(&graph, input, &mut messages).await?;
                }

                for child in &graph.children {
                    let events = child.step.lock().await.take_events();
                    for event in events {
                        self.route_event(&graph, event, &mut messages).await?;
                    }
                }

                if messages.is_empty() {
                    let RunPolicy::KeepAlive { idle_timeout } = policy else {
                        break Termination::Quiescent;
                    };
                    let wake = tokio::select! {
                        biased;
                        _ = cancel.cancelled() => Wake::Cancelled,
                        input = rx.recv() => Wake::Input(input),
                        _ = idle(idle_timeout) => Wake::Idle,
                    };
                    match wake {
                        Wake::Cancelled => break Termination::Cancelled,
                        Wake::Idle => {
                            info!(process = %self.info.name, "Keep-alive wait timed out");
                            break Termination::IdleTimeout;
                        }
                        Wake::Input(None) => break Termination::Quiescent,
                        Wake::Input(Some(input)) => {
                            self.accept_input(&graph, input, &mut messages).await?;
                        }
                    }
                    if messages.is_empty() {
                        continue;
                    }
                }

                if supersteps >= max_supersteps {
                    warn!(
                        process = %self.info.name,
                        max_supersteps,
                        pending = messages.len(),
                        "Superstep limit reached, keeping messages pending"
                    );
                    lock(&self.inbox).extend(messages);
                    break Termination::StepLimit;
                }

                supersteps += 1;
                if let Some(pos) = messages.iter().position(ProcessMessage::is_end) {
                    let dropped = messages.len() - pos - 1;
                    messages.truncate(pos);
                    info!(process = %self.info.name, superstep = supersteps, dropped, "End marker reached");
                    self.dispatch(&graph, messages, supersteps).await?;
                    break Termination::EndReached;
                }

                self.dispatch(&graph, messages, supersteps).await?;
            };

            self.persist().await?;

            // Input queued after the last drain must not be stranded.
            self.accepting.store(false, Ordering::SeqCst);
            if termination == Termination::Quiescent && self.queued.load(Ordering::SeqCst) > 0 {
                debug!(process = %self.info.name, "Input arrived while finishing, resuming");
                self.open_input();
                continue;
            }
            break termination;
        };

        drop(rx);

        info!(
            process = %self.info.name,
            id = %self.id,
            supersteps,
            termination = ?termination,
            "Process run finished"
        );
        Ok(RunOutcome {
            supersteps,
            termination,
        })
    }

    async fn accept_input(
        &self,
        graph: &ProcessGraph,
        input: ExternalInput,
        messages: &mut Vec<ProcessMessage>,
    ) -> Result<()> {
        self.queued.fetch_sub(1, Ordering::SeqCst);
        match input {
            ExternalInput::Event(event) => {
                let mut routed = ProcessEvent::new(&self.info.name, &self.id, event.id, event.data);
                routed.visibility = event.visibility;
                self.evaluate_edges(graph, &routed, messages).await
            }
            ExternalInput::Proxy {
                step,
                event_id,
                data,
            } => {
                let idx = *graph
                    .index
                    .get(&step)
                    .ok_or_else(|| StepwiseError::UnknownStep(step.clone()))?;
                graph.children[idx].step.lock().await.deliver(&event_id, data)
            }
        }
    }

    /// Dispatch one superstep's messages and wait for every step to settle.
    ///
    /// Steps run concurrently; messages for the same step run in order.
    async fn dispatch(
        &self,
        graph: &ProcessGraph,
        messages: Vec<ProcessMessage>,
        superstep: usize,
    ) -> Result<()> {
        let mut batches: Vec<(usize, Vec<ProcessMessage>)> = Vec::new();
        for message in messages {
            let idx = *graph
                .index
                .get(&message.destination)
                .ok_or_else(|| StepwiseError::UnknownStep(message.destination.clone()))?;
            match batches.iter_mut().find(|(i, _)| *i == idx) {
                Some((_, batch)) => batch.push(message),
                None => batches.push((idx, vec![message])),
            }
        }

        debug!(
            process = %self.info.name,
            superstep,
            steps = batches.len(),
            "Dispatching superstep"
        );

        let tasks = batches.into_iter().map(|(idx, batch)| {
            let step = graph.children[idx].step.clone();
            async move {
                let mut step = step.lock().await;
                for message in batch {
                    step.handle(message).await?;
                }
                Ok::<(), StepwiseError>(())
            }
        });

        for result in join_all(tasks).await {
            result?;
        }
        Ok(())
    }

    async fn route_event(
        &self,
        graph: &ProcessGraph,
        event: ProcessEvent,
        messages: &mut Vec<ProcessMessage>,
    ) -> Result<()> {
        if event.is_public() {
            self.surface(event.clone());
        }
        self.evaluate_edges(graph, &event, messages).await
    }

    /// Hand a public event to the observer (root) or the parent (nested).
    fn surface(&self, event: ProcessEvent) {
        if self.parent_id.is_some() {
            lock(&self.outgoing).push(event);
        } else if let Some(observer) = &self.services.observer {
            observer.on_event(&event);
        }
    }

    /// Expand an event into messages through the edge index.
    async fn evaluate_edges(
        &self,
        graph: &ProcessGraph,
        event: &ProcessEvent,
        messages: &mut Vec<ProcessMessage>,
    ) -> Result<()> {
        let key = event.qualified_id();
        if self
            .apply_edges(graph.edges.get(&key), event, messages)
            .await?
        {
            return Ok(());
        }
        if !event.is_error {
            return Ok(());
        }

        if self
            .apply_edges(graph.edges.get(GLOBAL_ERROR_EVENT), event, messages)
            .await?
        {
            return Ok(());
        }

        match self.services.config.process.unrouted_errors {
            UnroutedErrorPolicy::LogAndDrop => {
                warn!(process = %self.info.name, event = %key, "Dropping unrouted error event");
                Ok(())
            }
            UnroutedErrorPolicy::Fail => Err(StepwiseError::UnroutedError { event: key }),
        }
    }

    /// Realize matching edges; default edges only when nothing else matched.
    async fn apply_edges(
        &self,
        edges: Option<&Vec<Edge>>,
        event: &ProcessEvent,
        messages: &mut Vec<ProcessMessage>,
    ) -> Result<bool> {
        let Some(edges) = edges else {
            return Ok(false);
        };

        let mut matched = false;
        for edge in edges.iter().filter(|e| !e.is_default) {
            let state = self.state.get_state().await;
            if edge.condition.evaluate(event, &state)? {
                self.realize(edge, event, messages).await?;
                matched = true;
            }
        }
        if !matched {
            for edge in edges.iter().filter(|e| e.is_default) {
                self.realize(edge, event, messages).await?;
                matched = true;
            }
        }
        Ok(matched)
    }

    async fn realize(
        &self,
        edge: &Edge,
        event: &ProcessEvent,
        messages: &mut Vec<ProcessMessage>,
    ) -> Result<()> {
        match &edge.target {
            EdgeTarget::Function { .. } | EdgeTarget::Agent { .. } => {
                messages.push(edge.build_message(event)?);
            }
            EdgeTarget::State {
                path,
                operation,
                value,
            } => {
                let value = value
                    .clone()
                    .or_else(|| event.data.clone())
                    .unwrap_or(Value::Null);
                self.state.apply(path, *operation, value).await?;
            }
            EdgeTarget::Emit { event: name } => {
                let emitted =
                    ProcessEvent::new(&self.info.name, &self.id, name.clone(), event.data.clone())
                        .public();
                self.surface(emitted);
            }
        }
        Ok(())
    }

    /// Run as a child step: the message's function names the input event.
    pub async fn handle_message(&self, message: ProcessMessage) -> Result<()> {
        let resolved = lock(&self.input_groups).resolve(message)?;
        let Some(message) = resolved else {
            return Ok(());
        };
        let event_id = message.function.clone().ok_or_else(|| {
            StepwiseError::Config(format!(
                "message to nested process '{}' names no input event",
                self.info.name
            ))
        })?;
        let mut event = KernelEvent::new(event_id);
        event.data = message.payload();
        self.send(ExternalInput::Event(event));
        self.run(RunPolicy::RunOnce, CancellationToken::new()).await?;
        Ok(())
    }

    /// Event id a surfaced event carries in the parent.
    ///
    /// Process-scoped events keep their name; step events keep their
    /// qualified id.
    pub fn surface_id(&self, event: &ProcessEvent) -> String {
        if event.namespace == self.info.name {
            event.event_id.clone()
        } else {
            event.qualified_id()
        }
    }

    /// Drain surfaced events as produced.
    pub fn take_outgoing(&self) -> Vec<ProcessEvent> {
        std::mem::take(&mut *lock(&self.outgoing))
    }

    /// Drain surfaced events re-namespaced under this process's name.
    pub fn take_surfaced_events(&self) -> Vec<ProcessEvent> {
        self.take_outgoing()
            .into_iter()
            .map(|event| ProcessEvent {
                namespace: self.info.name.clone(),
                source_id: self.id.clone(),
                event_id: self.surface_id(&event),
                data: event.data,
                visibility: event.visibility,
                is_error: event.is_error,
            })
            .collect()
    }

    /// Snapshot of the whole subtree. Initializes the process if needed.
    ///
    /// Waits on each child's dispatch lock in turn.
    pub async fn extract_state(&self) -> Result<StepSnapshot> {
        let graph = self.ensure_initialized().await?;
        let mut steps = Vec::with_capacity(graph.children.len());
        for child in &graph.children {
            steps.push(child.step.lock().await.extract_state().await?);
        }
        Ok(StepSnapshot {
            name: self.info.name.clone(),
            id: self.id.clone(),
            parent_id: self.parent_id.clone(),
            kind: StepKind::Process,
            state: StepState {
                name: self.info.name.clone(),
                id: self.id.clone(),
                state_type: self.state.state_type().map(String::from),
                value: Some(self.state.get_state().await),
            },
            edges: self.info.edges.clone(),
            steps,
        })
    }

    async fn save_record(&self, graph: &ProcessGraph) -> Result<()> {
        let Some(storage) = &self.services.storage else {
            return Ok(());
        };
        let mut record = ProcessStateRecord::new(&self.info.name, &self.id);
        record.steps = graph
            .children
            .iter()
            .map(|c| (c.name.clone(), c.id.clone()))
            .collect();
        record.pending_messages = lock(&self.inbox).iter().cloned().collect();
        record.shared_state = Some(self.state.get_state().await);
        storage
            .save_process_state(&self.info.name, &self.id, &record)
            .await?;
        debug!(
            process = %self.info.name,
            id = %self.id,
            pending = record.pending_messages.len(),
            "Saved process state"
        );
        Ok(())
    }

    /// Save the process record, then every child's state.
    pub async fn persist(&self) -> Result<()> {
        let Some(graph) = self.graph.read().await.clone() else {
            return Ok(());
        };
        self.save_record(&graph).await?;
        for child in &graph.children {
            child.step.lock().await.persist().await?;
        }
        Ok(())
    }

    /// Tear down children and release scoped threads.
    pub async fn deinitialize(&self) -> Result<()> {
        let Some(graph) = self.graph.write().await.take() else {
            return Ok(());
        };
        for child in &graph.children {
            child.step.lock().await.deinitialize().await?;
        }
        self.on_enter_fired.store(false, Ordering::SeqCst);

        match Arc::try_unwrap(graph) {
            Ok(ProcessGraph {
                children, threads, ..
            }) => {
                drop(children);
                if let Ok(mut threads) = Arc::try_unwrap(threads) {
                    threads.release(self.services.agents.as_ref()).await?;
                }
            }
            Err(_) => debug!(process = %self.info.name, "Graph still referenced, threads kept"),
        }
        debug!(process = %self.info.name, id = %self.id, "Process deinitialized");
        Ok(())
    }

    /// Child id assigned to a declared step, once initialized.
    pub async fn child_id(&self, name: &str) -> Option<String> {
        let graph = self.graph.read().await.clone()?;
        let idx = *graph.index.get(name)?;
        Some(graph.children[idx].id.clone())
    }
}

/// Edge groups declared on edges, collected per target step.
fn collect_groups(edges: &EdgeMap) -> BTreeMap<String, Vec<EdgeGroup>> {
    let mut groups: BTreeMap<String, Vec<EdgeGroup>> = BTreeMap::new();
    for edge in edges.values().flatten() {
        if let (Some(target), Some(group)) = (edge.target_step(), &edge.group) {
            let list = groups.entry(target.to_string()).or_default();
            if !list.iter().any(|g| g.group_id == group.group_id) {
                list.push(group.clone());
            }
        }
    }
    groups
}
