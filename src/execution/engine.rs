//! Orchestration engine - owns every status change of plan and node executions
//!
//! Handlers never trust what they read earlier. Each change re-reads the
//! latest stored record, checks that the transition still applies, and writes
//! back conditionally on the version it read. A lost race is re-evaluated
//! against the fresh record and usually turns into a no-op.

use super::events::{EventHandler, ExecutionEvent};
use super::interrupts::InterruptError;
use crate::{
    advise::{AdviseError, AdviserRegistry},
    consumer::{ConsumerError, ConsumerHandle, EngineMessage, MessageKind, Publisher, ResumeEventConsumer},
    core::{
        config::EngineConfig, Ambiance, FailureInfo, FailureType, Interrupt, InterruptFilter, InterruptType, Level,
        Node, NodeExecution, Plan, PlanError, PlanExecution, Status,
    },
    dispatch::{ScopingContext, TaskExecutor, TaskResponse},
    persistence::{with_retry, ExecutionStore, StoreError, StoreResult},
    strategy::{StepContext, StepRegistry},
    timeout::{TimeoutError, TimeoutMonitor, TimeoutTrackerFactory},
};
use chrono::Utc;
use serde_json::{json, Value};
use std::collections::{BTreeMap, HashMap};
use std::future::Future;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{Mutex, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Upper bound on re-reads after conflicting writes to the same record
const MAX_CONFLICT_RETRIES: usize = 16;

/// Error types for engine operations
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("Invalid plan: {0}")]
    Plan(#[from] PlanError),

    #[error("Plan '{0}' not found")]
    PlanNotFound(String),

    #[error("Node '{node_id}' not found in plan '{plan_id}'")]
    NodeNotFound { plan_id: String, node_id: String },

    #[error("Plan execution {0} not found")]
    PlanExecutionNotFound(Uuid),

    #[error("Node execution {0} not found")]
    NodeExecutionNotFound(Uuid),

    #[error(transparent)]
    Interrupt(#[from] InterruptError),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error(transparent)]
    Publish(#[from] ConsumerError),

    #[error(transparent)]
    Timeout(#[from] TimeoutError),

    #[error(transparent)]
    Advise(#[from] AdviseError),
}

impl EngineError {
    /// The store kept failing after every retry
    pub fn is_persistence_failure(&self) -> bool {
        matches!(self, EngineError::Store(e) if e.is_retryable())
    }
}

pub type EngineResult<T> = std::result::Result<T, EngineError>;

/// Configures an [`OrchestrationEngine`] before it is shared
pub struct EngineBuilder {
    store: Arc<dyn ExecutionStore>,
    dispatcher: Arc<dyn TaskExecutor>,
    publisher: Publisher,
    steps: StepRegistry,
    advisers: AdviserRegistry,
    timeouts: TimeoutTrackerFactory,
    config: EngineConfig,
}

impl EngineBuilder {
    pub fn steps(mut self, steps: StepRegistry) -> Self {
        self.steps = steps;
        self
    }

    pub fn advisers(mut self, advisers: AdviserRegistry) -> Self {
        self.advisers = advisers;
        self
    }

    pub fn timeouts(mut self, timeouts: TimeoutTrackerFactory) -> Self {
        self.timeouts = timeouts;
        self
    }

    pub fn config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    pub fn build(self) -> OrchestrationEngine {
        OrchestrationEngine {
            inner: Arc::new(EngineInner {
                store: self.store,
                dispatcher: self.dispatcher,
                publisher: self.publisher,
                steps: self.steps,
                advisers: self.advisers,
                timeouts: self.timeouts,
                config: self.config,
                plans: RwLock::new(HashMap::new()),
                event_handlers: Mutex::new(Vec::new()),
            }),
        }
    }
}

struct EngineInner {
    store: Arc<dyn ExecutionStore>,
    dispatcher: Arc<dyn TaskExecutor>,
    publisher: Publisher,
    steps: StepRegistry,
    advisers: AdviserRegistry,
    timeouts: TimeoutTrackerFactory,
    config: EngineConfig,

    /// Plans are immutable once saved
    plans: RwLock<HashMap<String, Arc<Plan>>>,
    event_handlers: Mutex<Vec<EventHandler>>,
}

/// Cloneable handle to the engine; every clone shares the same state
#[derive(Clone)]
pub struct OrchestrationEngine {
    inner: Arc<EngineInner>,
}

/// Background tasks started by [`OrchestrationEngine::start`]
pub struct EngineHandle {
    consumer: ConsumerHandle,
    monitor: JoinHandle<()>,
}

impl EngineHandle {
    pub fn shutdown(self) {
        self.monitor.abort();
        self.consumer.shutdown();
    }
}

impl OrchestrationEngine {
    pub fn builder(
        store: Arc<dyn ExecutionStore>,
        dispatcher: Arc<dyn TaskExecutor>,
        publisher: Publisher,
    ) -> EngineBuilder {
        EngineBuilder {
            store,
            dispatcher,
            publisher,
            steps: StepRegistry::with_builtins(),
            advisers: AdviserRegistry::with_defaults(),
            timeouts: TimeoutTrackerFactory::with_defaults(),
            config: EngineConfig::default(),
        }
    }

    /// Attach the consumer workers and the timeout monitor
    pub fn start(&self, consumer: ResumeEventConsumer) -> EngineHandle {
        let consumer = consumer.start(self.clone());
        let monitor = TimeoutMonitor::new(self.clone(), self.inner.config.timeout_tick()).spawn();
        EngineHandle { consumer, monitor }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.inner.config
    }

    pub fn publisher(&self) -> &Publisher {
        &self.inner.publisher
    }

    pub(super) fn store(&self) -> &dyn ExecutionStore {
        self.inner.store.as_ref()
    }

    pub(super) fn steps(&self) -> &StepRegistry {
        &self.inner.steps
    }

    pub(super) fn advisers(&self) -> &AdviserRegistry {
        &self.inner.advisers
    }

    pub(super) fn timeouts(&self) -> &TimeoutTrackerFactory {
        &self.inner.timeouts
    }

    pub(super) fn dispatcher(&self) -> &Arc<dyn TaskExecutor> {
        &self.inner.dispatcher
    }

    /// Add an event handler
    pub async fn add_event_handler<F>(&self, handler: F)
    where
        F: Fn(ExecutionEvent) + Send + Sync + 'static,
    {
        self.inner.event_handlers.lock().await.push(Arc::new(handler));
    }

    /// Emit an event to all handlers
    pub(super) async fn emit_event(&self, event: ExecutionEvent) {
        let handlers = self.inner.event_handlers.lock().await;
        for handler in handlers.iter() {
            handler(event.clone());
        }
    }

    /// Validate and persist a plan, then start its root node
    pub async fn start_plan(&self, plan: Plan, setup_abstractions: BTreeMap<String, String>) -> EngineResult<Uuid> {
        plan.validate()?;
        let start = plan
            .start_node()
            .cloned()
            .ok_or_else(|| PlanError::MissingStartNode(plan.start_node_id.clone()))?;

        let store = self.store();
        let record = &plan;
        self.persist("save plan", move || store.save_plan(record)).await?;
        self.inner
            .plans
            .write()
            .await
            .insert(plan.id.clone(), Arc::new(plan.clone()));

        let ambiance = Ambiance::new(Uuid::new_v4(), &plan.id, setup_abstractions);
        let root = self.instantiate(&start, &ambiance);
        let mut execution = PlanExecution::new(ambiance);
        execution.root_node_execution_id = Some(root.id);

        let record = &execution;
        self.persist("insert plan execution", move || store.insert_plan_execution(record))
            .await?;
        let record = &root;
        self.persist("insert node execution", move || store.insert_node_execution(record))
            .await?;

        info!("Started plan '{}' as execution {}", plan.name(), execution.id);
        self.emit_event(ExecutionEvent::PlanStarted {
            plan_execution_id: execution.id,
            plan_id: plan.id.clone(),
        })
        .await;

        self.publish(EngineMessage::StartNode {
            node_execution_id: root.id,
        })?;
        Ok(execution.id)
    }

    /// Route a worker result to the node execution that issued the callback.
    ///
    /// Returns false when no node execution knows the callback.
    pub async fn resume_callback(&self, callback_id: &str, response: TaskResponse) -> EngineResult<bool> {
        let store = self.store();
        let Some(execution) = self
            .persist("find callback", move || store.find_node_execution_by_callback(callback_id))
            .await?
        else {
            warn!("No node execution is waiting for callback {}", callback_id);
            return Ok(false);
        };

        self.publish(EngineMessage::Resume {
            node_execution_id: execution.id,
            callback_id: callback_id.to_string(),
            response,
        })?;
        Ok(true)
    }

    /// Progress heartbeat for a running node execution
    pub fn report_progress(&self, node_execution_id: Uuid, data: Value) -> EngineResult<()> {
        self.publish(EngineMessage::Progress { node_execution_id, data })
    }

    pub async fn get_plan_execution(&self, id: Uuid) -> EngineResult<PlanExecution> {
        let store = self.store();
        self.persist("load plan execution", move || store.get_plan_execution(id))
            .await?
            .ok_or(EngineError::PlanExecutionNotFound(id))
    }

    pub async fn get_node_execution(&self, id: Uuid) -> EngineResult<NodeExecution> {
        let store = self.store();
        self.persist("load node execution", move || store.get_node_execution(id))
            .await?
            .ok_or(EngineError::NodeExecutionNotFound(id))
    }

    /// Every node execution of a plan execution, including replaced attempts
    pub async fn node_executions(&self, plan_execution_id: Uuid) -> EngineResult<Vec<NodeExecution>> {
        let store = self.store();
        self.persist("list node executions", move || {
            store.node_executions_for_plan(plan_execution_id)
        })
        .await
    }

    pub async fn list_plan_executions(&self, limit: usize) -> EngineResult<Vec<PlanExecution>> {
        let store = self.store();
        self.persist("list plan executions", move || store.list_plan_executions(limit))
            .await
    }

    /// Interrupts of a plan execution, newest first
    pub async fn interrupt_history(
        &self,
        plan_execution_id: Uuid,
        filter: &InterruptFilter,
    ) -> EngineResult<Vec<Interrupt>> {
        let store = self.store();
        self.persist("list interrupts", move || store.interrupts_for_plan(plan_execution_id, filter))
            .await
    }

    /// Entry point of the consumer workers
    pub async fn handle_message(&self, message: EngineMessage) {
        let kind = message.kind();
        let key = message.partition_key();

        let result = match message {
            EngineMessage::StartNode { node_execution_id } => self.start_node(node_execution_id).await,
            EngineMessage::Resume {
                node_execution_id,
                callback_id,
                response,
            } => self.resume_node(node_execution_id, callback_id, response).await,
            EngineMessage::Wake { node_execution_id } => self.wake_node(node_execution_id).await,
            EngineMessage::Advise {
                node_execution_id,
                from_status,
            } => self.advise_node(node_execution_id, from_status).await,
            EngineMessage::ChildConcluded { parent_id, child_round } => {
                self.child_concluded(parent_id, child_round).await
            }
            EngineMessage::Progress { node_execution_id, data } => self.record_progress(node_execution_id, data).await,
            EngineMessage::Interrupt { plan_execution_id } => self.process_interrupts(plan_execution_id).await,
        };

        if let Err(e) = result {
            error!("Failed to handle {:?} message for {}: {}", kind, key, e);
            if e.is_persistence_failure() {
                self.abandon(kind, key).await;
            }
        }
    }

    /// Give up on a plan execution whose records can no longer be written
    async fn abandon(&self, kind: MessageKind, key: Uuid) {
        let plan_execution_id = match kind {
            MessageKind::Interrupt => Some(key),
            _ => self
                .inner
                .store
                .get_node_execution(key)
                .await
                .ok()
                .flatten()
                .map(|e| e.plan_execution_id),
        };

        let Some(plan_execution_id) = plan_execution_id else {
            return;
        };
        let failure = FailureInfo::new("Persistence retries exhausted", FailureType::Unknown);
        if let Err(e) = self
            .finish_plan(plan_execution_id, Status::Errored, Some(failure), None)
            .await
        {
            error!("Could not mark plan execution {} as errored: {}", plan_execution_id, e);
        }
    }

    /// Expire overdue node executions. Returns how many expiries were registered.
    pub async fn check_timeouts(&self) -> EngineResult<usize> {
        let now = Utc::now();
        let store = self.store();
        let candidates = self
            .persist("scan timeouts", move || {
                store.node_executions_with_status(&[
                    Status::Running,
                    Status::TaskWaiting,
                    Status::ChildWaiting,
                    Status::Suspended,
                    Status::InterventionWaiting,
                ])
            })
            .await?;

        let mut expired = 0;
        for execution in candidates {
            let Some(instance) = execution.timeout.as_ref() else {
                continue;
            };
            if !self.inner.timeouts.is_expired(instance, now) {
                continue;
            }

            // Claim the expiry first so overlapping scans fire it once
            let instance_id = instance.id;
            let claimed = self
                .update_node(execution.id, |e| {
                    if e.status.is_final() {
                        return false;
                    }
                    match e.timeout.as_mut() {
                        Some(t) if t.id == instance_id && t.expired_at.is_none() => {
                            t.expired_at = Some(now);
                            true
                        }
                        _ => false,
                    }
                })
                .await?;
            if claimed.is_none() {
                continue;
            }

            info!("Node execution {} ({}) timed out", execution.id, execution.node_id);
            let metadata = json!({ "source": "timeout", "timeout_instance_id": instance_id });
            match self
                .register_interrupt(
                    execution.plan_execution_id,
                    InterruptType::MarkExpired,
                    Some(execution.id),
                    metadata,
                )
                .await
            {
                Ok(_) => expired += 1,
                Err(EngineError::Interrupt(e)) => debug!("Expiry of {} not registered: {}", execution.id, e),
                Err(e) => return Err(e),
            }
        }

        Ok(expired)
    }

    /// Re-publish the messages a restarted engine needs to pick up where it left off
    pub async fn recover(&self) -> EngineResult<usize> {
        let store = self.store();
        let mut republished = 0;

        let queued = self
            .persist("scan queued", move || store.node_executions_with_status(&[Status::Queued]))
            .await?;
        for execution in queued.iter().filter(|e| !e.old_retry) {
            self.schedule_start(execution)?;
            republished += 1;
        }

        let waiting = self
            .persist("scan waiting", move || {
                store.node_executions_with_status(&[Status::TaskWaiting, Status::ChildWaiting])
            })
            .await?;
        for execution in waiting {
            let message = match execution.status {
                Status::ChildWaiting => EngineMessage::ChildConcluded {
                    parent_id: execution.id,
                    child_round: execution.child_round,
                },
                _ if execution.pending_callbacks.is_empty() => EngineMessage::Wake {
                    node_execution_id: execution.id,
                },
                _ => continue,
            };
            self.publish(message)?;
            republished += 1;
        }

        let finished = self
            .persist("scan unconcluded", move || store.node_executions_with_status(Status::FINAL))
            .await?;
        for execution in finished.iter().filter(|e| !e.concluded && !e.old_retry) {
            self.publish(EngineMessage::Advise {
                node_execution_id: execution.id,
                from_status: Status::Running,
            })?;
            republished += 1;
        }

        let plans = self.list_plan_executions(usize::MAX).await?;
        for plan in plans.iter().filter(|p| !p.is_final()) {
            self.publish(EngineMessage::Interrupt {
                plan_execution_id: plan.id,
            })?;
            republished += 1;
        }

        info!("Recovery re-published {} messages", republished);
        Ok(republished)
    }

    // ---- helpers shared by the message handlers ----

    /// Run a store operation under the configured persistence retry policy
    pub(super) async fn persist<T, F, Fut>(&self, operation: &str, op: F) -> EngineResult<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = StoreResult<T>>,
    {
        Ok(with_retry(&self.inner.config.persistence, operation, op).await?)
    }

    pub(super) fn publish(&self, message: EngineMessage) -> EngineResult<()> {
        Ok(self.inner.publisher.publish(message)?)
    }

    /// Publish the start of a queued node, honoring its retry wait
    pub(super) fn schedule_start(&self, execution: &NodeExecution) -> EngineResult<()> {
        let message = EngineMessage::StartNode {
            node_execution_id: execution.id,
        };
        let delay = execution
            .queued_until
            .and_then(|until| (until - Utc::now()).to_std().ok())
            .filter(|d| !d.is_zero());

        match delay {
            Some(delay) => {
                debug!("Node execution {} starts in {:?}", execution.id, delay);
                let publisher = self.inner.publisher.clone();
                tokio::spawn(async move {
                    tokio::time::sleep(delay).await;
                    if let Err(e) = publisher.publish(message) {
                        warn!("Delayed start dropped: {}", e);
                    }
                });
                Ok(())
            }
            None => self.publish(message),
        }
    }

    pub(super) async fn load_node(&self, id: Uuid) -> EngineResult<NodeExecution> {
        self.get_node_execution(id).await
    }

    pub(super) async fn plan(&self, plan_id: &str) -> EngineResult<Arc<Plan>> {
        if let Some(plan) = self.inner.plans.read().await.get(plan_id) {
            return Ok(plan.clone());
        }

        let store = self.store();
        let plan = self
            .persist("load plan", move || store.get_plan(plan_id))
            .await?
            .ok_or_else(|| EngineError::PlanNotFound(plan_id.to_string()))?;
        let plan = Arc::new(plan);
        self.inner
            .plans
            .write()
            .await
            .insert(plan_id.to_string(), plan.clone());
        Ok(plan)
    }

    pub(super) async fn node_definition(&self, plan_id: &str, node_id: &str) -> EngineResult<Node> {
        self.plan(plan_id)
            .await?
            .node(node_id)
            .cloned()
            .ok_or_else(|| EngineError::NodeNotFound {
                plan_id: plan_id.to_string(),
                node_id: node_id.to_string(),
            })
    }

    /// Create a queued execution of `node` below `base`
    pub(super) fn instantiate(&self, node: &Node, base: &Ambiance) -> NodeExecution {
        let id = Uuid::new_v4();
        let level = Level::new(&node.id, id, node.identifier())
            .with_group(node.group.clone())
            .with_step_type(&node.step_type);
        NodeExecution::new(id, &node.id, node.mode, base.clone_for_child(level))
    }

    /// Persist a new node execution and schedule its start
    pub(super) async fn enqueue(&self, execution: NodeExecution) -> EngineResult<Uuid> {
        let store = self.store();
        let record = &execution;
        self.persist("insert node execution", move || store.insert_node_execution(record))
            .await?;
        debug!(
            "Queued node '{}' as {} (parent {:?})",
            execution.node_id, execution.id, execution.parent_id
        );
        self.schedule_start(&execution)?;
        Ok(execution.id)
    }

    pub(super) fn step_context(&self, execution: &NodeExecution, node: Node) -> StepContext {
        StepContext {
            ambiance: execution.ambiance.clone(),
            node,
            inputs: execution.additional_inputs.clone(),
            dispatcher: self.inner.dispatcher.clone(),
        }
    }

    /// Apply `mutate` to the latest stored version until it lands.
    ///
    /// `mutate` returns false when the change no longer applies, in which case
    /// nothing is written and `None` is returned.
    pub(super) async fn update_node<F>(&self, id: Uuid, mut mutate: F) -> EngineResult<Option<NodeExecution>>
    where
        F: FnMut(&mut NodeExecution) -> bool + Send,
    {
        let store = self.store();
        for _ in 0..MAX_CONFLICT_RETRIES {
            let current = self.load_node(id).await?;
            let mut next = current.clone();
            if !mutate(&mut next) {
                return Ok(None);
            }
            next.updated_at = Utc::now();

            let record = &next;
            match with_retry(&self.inner.config.persistence, "update node execution", move || {
                store.update_node_execution(record)
            })
            .await
            {
                Ok(updated) => {
                    if updated.status != current.status {
                        debug!(
                            "Node execution {} ({}): {} -> {}",
                            updated.id, updated.node_id, current.status, updated.status
                        );
                        self.emit_event(ExecutionEvent::NodeStatusChanged {
                            plan_execution_id: updated.plan_execution_id,
                            node_execution_id: updated.id,
                            node_id: updated.node_id.clone(),
                            from: current.status,
                            to: updated.status,
                        })
                        .await;
                    }
                    return Ok(Some(updated));
                }
                Err(e) if e.is_conflict() => {
                    debug!("Node execution {} changed concurrently, re-evaluating", id);
                }
                Err(e) => return Err(e.into()),
            }
        }

        warn!("Giving up on node execution {} after repeated conflicts", id);
        Ok(None)
    }

    /// Move a node execution to `to` when it is in one of `from` (any status when empty)
    pub(super) async fn transition_node<F>(
        &self,
        id: Uuid,
        from: &[Status],
        to: Status,
        mut apply: F,
    ) -> EngineResult<Option<NodeExecution>>
    where
        F: FnMut(&mut NodeExecution) + Send,
    {
        self.update_node(id, |e| {
            if !from.is_empty() && !from.contains(&e.status) {
                return false;
            }
            if !e.status.can_transition_to(to) {
                return false;
            }
            e.set_status(to);
            apply(e);
            true
        })
        .await
    }

    pub(super) async fn update_plan_execution<F>(&self, id: Uuid, mut mutate: F) -> EngineResult<Option<PlanExecution>>
    where
        F: FnMut(&mut PlanExecution) -> bool + Send,
    {
        let store = self.store();
        for _ in 0..MAX_CONFLICT_RETRIES {
            let mut next = self.get_plan_execution(id).await?;
            if !mutate(&mut next) {
                return Ok(None);
            }

            let record = &next;
            match with_retry(&self.inner.config.persistence, "update plan execution", move || {
                store.update_plan_execution(record)
            })
            .await
            {
                Ok(updated) => return Ok(Some(updated)),
                Err(e) if e.is_conflict() => {
                    debug!("Plan execution {} changed concurrently, re-evaluating", id);
                }
                Err(e) => return Err(e.into()),
            }
        }

        warn!("Giving up on plan execution {} after repeated conflicts", id);
        Ok(None)
    }

    /// Move a plan execution to a final status, once
    pub(super) async fn finish_plan(
        &self,
        id: Uuid,
        status: Status,
        failure: Option<FailureInfo>,
        interrupt_id: Option<Uuid>,
    ) -> EngineResult<Option<PlanExecution>> {
        let finished = self
            .update_plan_execution(id, |p| {
                if p.is_final() {
                    return false;
                }
                p.status = status;
                p.ended_at = Some(Utc::now());
                p.failure = failure.clone();
                p.interrupt_id = interrupt_id;
                true
            })
            .await?;

        if let Some(plan) = &finished {
            info!("Plan execution {} finished: {}", plan.id, plan.status);
            self.emit_event(ExecutionEvent::PlanCompleted {
                plan_execution_id: plan.id,
                status: plan.status,
            })
            .await;
        }
        Ok(finished)
    }

    /// Cancel outstanding worker tasks of a node, without waiting for them
    pub(super) fn abort_tasks(&self, execution: &NodeExecution) {
        if execution.pending_callbacks.is_empty() {
            return;
        }
        let dispatcher = self.inner.dispatcher.clone();
        let scope = ScopingContext::from_ambiance(&execution.ambiance);
        let callbacks: Vec<String> = execution.pending_callbacks.iter().cloned().collect();
        tokio::spawn(async move {
            for callback_id in callbacks {
                if let Err(e) = dispatcher.abort_task(&scope, &callback_id).await {
                    debug!("Abort of task {} failed: {}", callback_id, e);
                }
            }
        });
    }

    /// Force-expire outstanding worker tasks of a node
    pub(super) fn expire_tasks(&self, execution: &NodeExecution) {
        if execution.pending_callbacks.is_empty() {
            return;
        }
        let dispatcher = self.inner.dispatcher.clone();
        let scope = ScopingContext::from_ambiance(&execution.ambiance);
        let callbacks: Vec<String> = execution.pending_callbacks.iter().cloned().collect();
        tokio::spawn(async move {
            for callback_id in callbacks {
                if let Err(e) = dispatcher.expire_task(&scope, &callback_id).await {
                    debug!("Expiry of task {} failed: {}", callback_id, e);
                }
            }
        });
    }
}
