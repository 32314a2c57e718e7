//! Test utilities shared by the engine scenarios

use async_trait::async_trait;
use orchestrator::advise::{AdviserFactory, AdviserRegistry};
use orchestrator::consumer::{self, ConsumerHandle, ResumeEventConsumer};
use orchestrator::core::config::{EngineConfig, PersistenceConfig};
use orchestrator::core::{FailureType, NodeExecution, Plan, PlanExecution};
use orchestrator::dispatch::local::{EchoHandler, LocalTaskExecutor, SleepHandler, TaskHandler};
use orchestrator::dispatch::{ScopingContext, TaskRequest, TaskResponse};
use orchestrator::execution::{ExecutionEvent, OrchestrationEngine};
use orchestrator::persistence::{ExecutionStore, InMemoryStore};
use orchestrator::strategy::builtin::summarize_task_responses;
use orchestrator::strategy::{
    AsyncExecutable, AsyncExecutableResponse, ChildChainExecutable, ChildChainResponse, ChildOutcome, Executable,
    StepContext, StepRegistry, StepResponse, StrategyError, SyncExecutable,
};
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use uuid::Uuid;

/// Upper bound for any scenario to settle
pub const WAIT: Duration = Duration::from_secs(30);

/// Task handler whose tasks never finish on their own
pub struct PendingHandler;

#[async_trait]
impl TaskHandler for PendingHandler {
    async fn run(&self, _scope: &ScopingContext, _request: &TaskRequest) -> TaskResponse {
        std::future::pending().await
    }
}

/// Async step that queues `tasks` (default 2) never-finishing tasks and records
/// every batch of results it is handed
#[derive(Default)]
pub struct RecordingAsyncStep {
    pub deliveries: Mutex<Vec<BTreeMap<String, TaskResponse>>>,
}

impl RecordingAsyncStep {
    pub fn deliveries(&self) -> Vec<BTreeMap<String, TaskResponse>> {
        self.deliveries.lock().unwrap().clone()
    }
}

#[async_trait]
impl AsyncExecutable for RecordingAsyncStep {
    async fn execute_async(&self, ctx: &StepContext) -> Result<AsyncExecutableResponse, StrategyError> {
        let tasks = ctx.parameter("tasks").and_then(Value::as_u64).unwrap_or(2);
        let mut callback_ids = Vec::new();
        for _ in 0..tasks {
            callback_ids.push(ctx.queue_task("pending", Value::Null, None).await?);
        }
        Ok(AsyncExecutableResponse { callback_ids })
    }

    async fn handle_async_response(
        &self,
        _ctx: &StepContext,
        responses: &BTreeMap<String, TaskResponse>,
    ) -> Result<StepResponse, StrategyError> {
        self.deliveries.lock().unwrap().push(responses.clone());
        summarize_task_responses(responses)
    }
}

/// Sync step that fails a fixed number of times before succeeding
pub struct FlakyStep {
    failures_left: AtomicUsize,
    calls: AtomicUsize,
}

impl FlakyStep {
    pub fn failing(times: usize) -> Self {
        Self {
            failures_left: AtomicUsize::new(times),
            calls: AtomicUsize::new(0),
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl SyncExecutable for FlakyStep {
    async fn execute_sync(&self, ctx: &StepContext) -> Result<StepResponse, StrategyError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let failed = self
            .failures_left
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failed {
            return Err(StrategyError::failed("flaky failure", FailureType::Application));
        }
        Ok(StepResponse::success(ctx.parameter("outcome").cloned()))
    }
}

/// Chain step that answers with a link that neither continues nor suspends
pub struct StalledChainStep;

#[async_trait]
impl ChildChainExecutable for StalledChainStep {
    async fn start_chain_link(&self, _ctx: &StepContext) -> Result<ChildChainResponse, StrategyError> {
        ChildChainResponse::try_new(None, None, None, false, false)
    }

    async fn execute_next_link(
        &self,
        _ctx: &StepContext,
        pass_through_data: Option<&Value>,
        previous: &ChildOutcome,
    ) -> Result<ChildChainResponse, StrategyError> {
        ChildChainResponse::try_new(None, Some(previous.node_id.clone()), pass_through_data.cloned(), false, false)
    }
}

/// Engine configuration tuned for tests: fast persistence backoff
pub fn test_config() -> EngineConfig {
    EngineConfig {
        partitions: 4,
        persistence: PersistenceConfig {
            max_attempts: 3,
            base_delay_ms: 1,
        },
        timeout_tick_ms: 3_600_000,
        database_path: None,
    }
}

/// Builder for an engine wired to an in-process worker pool
pub struct HarnessBuilder {
    store: Arc<dyn ExecutionStore>,
    steps: StepRegistry,
    advisers: AdviserRegistry,
    config: EngineConfig,
}

pub fn harness() -> HarnessBuilder {
    HarnessBuilder {
        store: Arc::new(InMemoryStore::new()),
        steps: StepRegistry::with_builtins(),
        advisers: AdviserRegistry::with_defaults(),
        config: test_config(),
    }
}

/// Running engine plus every event it emitted
pub struct Harness {
    pub engine: OrchestrationEngine,
    pub events: Arc<Mutex<Vec<ExecutionEvent>>>,
    _consumer: ConsumerHandle,
}

impl HarnessBuilder {
    pub fn store(mut self, store: Arc<dyn ExecutionStore>) -> Self {
        self.store = store;
        self
    }

    pub fn step(mut self, step_type: &str, executable: Executable) -> Self {
        self.steps.register(step_type, executable);
        self
    }

    pub fn adviser(mut self, adviser_type: &str, factory: AdviserFactory) -> Self {
        self.advisers.register(adviser_type, factory);
        self
    }

    /// Engine whose consumer has not been started yet
    pub fn idle(self) -> (OrchestrationEngine, ResumeEventConsumer) {
        let (publisher, consumer) = consumer::channel(self.config.partitions);
        let dispatcher = LocalTaskExecutor::new(publisher.clone())
            .register("echo", Arc::new(EchoHandler))
            .register("sleep", Arc::new(SleepHandler))
            .register("pending", Arc::new(PendingHandler));
        let engine = OrchestrationEngine::builder(self.store, Arc::new(dispatcher), publisher)
            .steps(self.steps)
            .advisers(self.advisers)
            .config(self.config)
            .build();
        (engine, consumer)
    }

    /// Engine with its consumer workers running; timeouts are only checked on demand
    pub async fn start(self) -> Harness {
        let (engine, consumer) = self.idle();
        let events = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&events);
        engine
            .add_event_handler(move |event| sink.lock().unwrap().push(event))
            .await;
        let consumer = consumer.start(engine.clone());
        Harness {
            engine,
            events,
            _consumer: consumer,
        }
    }
}

impl Harness {
    pub async fn run(&self, yaml: &str) -> Uuid {
        self.run_with(yaml, BTreeMap::new()).await
    }

    pub async fn run_with(&self, yaml: &str, setup: BTreeMap<String, String>) -> Uuid {
        self.engine.start_plan(plan(yaml), setup).await.unwrap()
    }

    pub fn events(&self) -> Vec<ExecutionEvent> {
        self.events.lock().unwrap().clone()
    }
}

pub fn plan(yaml: &str) -> Plan {
    Plan::from_yaml(yaml).unwrap()
}

/// Poll until the plan execution reaches a final status
pub async fn wait_for_plan(engine: &OrchestrationEngine, id: Uuid) -> PlanExecution {
    tokio::time::timeout(WAIT, async {
        loop {
            let execution = engine.get_plan_execution(id).await.unwrap();
            if execution.is_final() {
                return execution;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("plan execution did not finish in time")
}

/// Poll until the live execution of `node_id` satisfies `ready`
pub async fn wait_for_node<F>(engine: &OrchestrationEngine, plan_execution_id: Uuid, node_id: &str, ready: F) -> NodeExecution
where
    F: Fn(&NodeExecution) -> bool,
{
    tokio::time::timeout(WAIT, async {
        loop {
            let executions = engine.node_executions(plan_execution_id).await.unwrap();
            if let Some(found) = executions
                .into_iter()
                .filter(|e| e.node_id == node_id && !e.old_retry)
                .find(|e| ready(e))
            {
                return found;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap_or_else(|_| panic!("node '{}' never reached the expected state", node_id))
}

/// Every execution of `node_id`, replaced attempts included, oldest first
pub async fn executions_of(engine: &OrchestrationEngine, plan_execution_id: Uuid, node_id: &str) -> Vec<NodeExecution> {
    engine
        .node_executions(plan_execution_id)
        .await
        .unwrap()
        .into_iter()
        .filter(|e| e.node_id == node_id)
        .collect()
}
