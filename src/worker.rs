//! Worker contract and execution harness.
//!
//! A worker is a polymorphic unit that declares a capability set and a
//! concurrency limit, executes tasks asynchronously, and answers inbound
//! messages. Implementations provide `perform` (the domain work) and
//! optionally `answer` (domain message kinds such as vote requests); the
//! trait's provided methods supply the full contract — acceptance checks,
//! timeout enforcement, state transitions, bounded result history, and the
//! built-in message handlers — through the shared [`WorkerCore`].

use crate::error::Result;
use crate::task::{Task, TaskId, TaskResult};
use crate::{hlog, hlog_warn};
use async_trait::async_trait;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Mutex, RwLock};
use std::time::Instant;
use uuid::Uuid;

/// Message kind answered with a liveness payload.
pub const MSG_PING: &str = "ping";
/// Message kind answered with a status snapshot.
pub const MSG_STATUS: &str = "status";
/// Message kind answered with the declared capability set.
pub const MSG_CAPABILITIES: &str = "capabilities";
/// Message kind that transitions the worker to Shutdown.
pub const MSG_SHUTDOWN: &str = "shutdown";
/// Message kind a voting-capable worker answers with a vote payload.
pub const MSG_VOTE_REQUEST: &str = "vote_request";

/// Unique identifier for a worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct WorkerId(pub Uuid);

impl WorkerId {
    /// Create a new unique worker identifier.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Return first 8 characters of the UUID for display.
    pub fn short(&self) -> String {
        self.0.to_string()[..8].to_string()
    }
}

impl Default for WorkerId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for WorkerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::str::FromStr for WorkerId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Ok(Self(Uuid::parse_str(s)?))
    }
}

/// Worker lifecycle state.
///
/// Idle→Working on task acceptance, Working→Idle on completion,
/// Working→Error on an unrecoverable fault, any→Shutdown on a shutdown
/// command. Shutdown is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerState {
    Idle,
    Working,
    Waiting,
    Error,
    Shutdown,
}

impl std::fmt::Display for WorkerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            WorkerState::Idle => "idle",
            WorkerState::Working => "working",
            WorkerState::Waiting => "waiting",
            WorkerState::Error => "error",
            WorkerState::Shutdown => "shutdown",
        };
        write!(f, "{}", s)
    }
}

/// A declared worker capability.
///
/// Confidence feeds the capability-based assignment strategy; parameters
/// are opaque capability metadata.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Capability {
    pub name: String,
    pub description: String,
    pub confidence: f64,
    #[serde(default)]
    pub parameters: HashMap<String, Value>,
}

impl Capability {
    /// Create a capability with full confidence and no parameters.
    pub fn new(name: &str, description: &str) -> Self {
        Self {
            name: name.to_string(),
            description: description.to_string(),
            confidence: 1.0,
            parameters: HashMap::new(),
        }
    }

    /// Set the confidence for this capability.
    pub fn with_confidence(mut self, confidence: f64) -> Self {
        self.confidence = confidence;
        self
    }

    /// Attach a parameter.
    pub fn with_parameter(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.parameters.insert(key.to_string(), value.into());
        self
    }
}

/// Point-in-time metrics snapshot for a worker.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerMetrics {
    pub worker_id: WorkerId,
    pub name: String,
    pub state: WorkerState,
    pub total_tasks: usize,
    pub successful_tasks: usize,
    pub success_rate: f64,
    pub average_execution_time: f64,
    pub current_load: usize,
    pub capability_count: usize,
}

/// Maximum completed results retained per worker for introspection.
const HISTORY_LIMIT: usize = 100;

/// Shared harness state embedded by every worker implementation.
///
/// Holds identity, the capability map, the concurrency limit, the state
/// cell, the active-task set, and a bounded history of completed results.
/// Locks guard short critical sections only and are never held across an
/// await.
pub struct WorkerCore {
    id: WorkerId,
    name: String,
    max_concurrent: usize,
    capabilities: HashMap<String, Capability>,
    state: RwLock<WorkerState>,
    active: Mutex<HashSet<TaskId>>,
    history: Mutex<VecDeque<TaskResult>>,
}

impl WorkerCore {
    /// Create a core with the given name and concurrency limit.
    pub fn new(name: &str, max_concurrent: usize) -> Self {
        Self {
            id: WorkerId::new(),
            name: name.to_string(),
            max_concurrent,
            capabilities: HashMap::new(),
            state: RwLock::new(WorkerState::Idle),
            active: Mutex::new(HashSet::new()),
            history: Mutex::new(VecDeque::new()),
        }
    }

    /// Declare a capability. Builder-style, used before the worker is shared.
    pub fn with_capability(mut self, capability: Capability) -> Self {
        self.capabilities.insert(capability.name.clone(), capability);
        self
    }

    pub fn id(&self) -> WorkerId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn max_concurrent(&self) -> usize {
        self.max_concurrent
    }

    pub fn state(&self) -> WorkerState {
        *self.state.read().expect("worker state lock poisoned")
    }

    /// Force a state transition. Shutdown is sticky: transitions out of it
    /// are ignored.
    pub fn set_state(&self, state: WorkerState) {
        let mut cell = self.state.write().expect("worker state lock poisoned");
        if *cell == WorkerState::Shutdown {
            return;
        }
        *cell = state;
    }

    pub fn current_load(&self) -> usize {
        self.active.lock().expect("active set lock poisoned").len()
    }

    pub fn capabilities(&self) -> Vec<Capability> {
        self.capabilities.values().cloned().collect()
    }

    pub fn capability_names(&self) -> Vec<String> {
        self.capabilities.keys().cloned().collect()
    }

    pub fn has_capability(&self, name: &str) -> bool {
        self.capabilities.contains_key(name)
    }

    pub fn capability(&self, name: &str) -> Option<&Capability> {
        self.capabilities.get(name)
    }

    /// Completed results, oldest first, bounded to the retention limit.
    pub fn history(&self) -> Vec<TaskResult> {
        self.history
            .lock()
            .expect("history lock poisoned")
            .iter()
            .cloned()
            .collect()
    }

    fn begin(&self, task_id: TaskId) {
        self.active
            .lock()
            .expect("active set lock poisoned")
            .insert(task_id);
        self.set_state(WorkerState::Working);
    }

    fn finish(&self, result: TaskResult) {
        let remaining = {
            let mut active = self.active.lock().expect("active set lock poisoned");
            active.remove(&result.task_id);
            active.len()
        };
        {
            let mut history = self.history.lock().expect("history lock poisoned");
            history.push_back(result);
            while history.len() > HISTORY_LIMIT {
                history.pop_front();
            }
        }
        if remaining == 0 {
            self.set_state(WorkerState::Idle);
        }
    }
}

/// The polymorphic worker contract.
///
/// Implementations provide [`Worker::core`] and [`Worker::perform`];
/// everything else has a provided implementation. The scheduler and
/// orchestrator never branch on the concrete type.
#[async_trait]
pub trait Worker: Send + Sync {
    /// Access the shared harness state.
    fn core(&self) -> &WorkerCore;

    /// Execute the domain work for a task.
    async fn perform(&self, task: &Task) -> Result<Value>;

    /// Answer a domain-specific message kind (e.g. `vote_request`).
    /// Return None for kinds this worker does not handle.
    async fn answer(&self, kind: &str, content: &Value, sender: WorkerId) -> Option<Value> {
        let _ = (kind, content, sender);
        None
    }

    fn id(&self) -> WorkerId {
        self.core().id()
    }

    fn name(&self) -> &str {
        self.core().name()
    }

    fn state(&self) -> WorkerState {
        self.core().state()
    }

    fn capabilities(&self) -> Vec<Capability> {
        self.core().capabilities()
    }

    fn max_concurrent(&self) -> usize {
        self.core().max_concurrent()
    }

    fn current_load(&self) -> usize {
        self.core().current_load()
    }

    /// True iff current load is below the concurrency limit and every
    /// required capability is declared.
    fn can_accept(&self, task: &Task) -> bool {
        let core = self.core();
        core.current_load() < core.max_concurrent()
            && task
                .requirements
                .iter()
                .all(|requirement| core.has_capability(requirement))
    }

    /// Run a task under the optional enforced timeout.
    ///
    /// Timeouts and faults from `perform` are folded into a failed
    /// [`TaskResult`]; they never escape as errors. The state transitions
    /// Idle→Working→Idle around the attempt and the result is appended to
    /// the bounded history.
    async fn execute(&self, task: Task) -> TaskResult {
        let core = self.core();
        if !self.can_accept(&task) {
            return TaskResult::failure(
                task.id,
                Some(core.id()),
                "worker cannot accept this task",
                std::time::Duration::ZERO,
            );
        }

        core.begin(task.id);
        let started = Instant::now();

        let outcome = match task.timeout {
            Some(limit) => match tokio::time::timeout(limit, self.perform(&task)).await {
                Ok(inner) => inner,
                Err(_) => Err(crate::error::Error::Timeout(limit)),
            },
            None => self.perform(&task).await,
        };
        let elapsed = started.elapsed();

        let result = match outcome {
            Ok(output) => {
                hlog!(
                    "worker {} completed task {} in {:.2}s",
                    core.id().short(),
                    task.id.short(),
                    elapsed.as_secs_f64()
                );
                TaskResult::success(task.id, core.id(), output, elapsed)
            }
            Err(err) => {
                hlog_warn!(
                    "worker {} failed task {}: {}",
                    core.id().short(),
                    task.id.short(),
                    err
                );
                TaskResult::failure(task.id, Some(core.id()), err.to_string(), elapsed)
            }
        };

        core.finish(result.clone());
        result
    }

    /// Dispatch an inbound message to the built-in handlers, then to
    /// [`Worker::answer`]. Unknown kinds are logged and answered with None.
    async fn handle_message(&self, kind: &str, content: &Value, sender: WorkerId) -> Option<Value> {
        let core = self.core();
        match kind {
            MSG_PING => Some(json!({
                "worker_id": core.id(),
                "name": core.name(),
                "state": core.state().to_string(),
                "timestamp": Utc::now().to_rfc3339(),
            })),
            MSG_STATUS => Some(json!({
                "worker_id": core.id(),
                "name": core.name(),
                "state": core.state().to_string(),
                "current_load": core.current_load(),
                "completed_tasks": core.history().len(),
                "capabilities": core.capability_names(),
            })),
            MSG_CAPABILITIES => serde_json::to_value(core.capabilities()).ok(),
            MSG_SHUTDOWN => {
                hlog!("worker {} shutting down", core.id().short());
                core.set_state(WorkerState::Shutdown);
                None
            }
            other => match self.answer(other, content, sender).await {
                Some(response) => Some(response),
                None => {
                    hlog_warn!(
                        "worker {} has no handler for message kind '{}'",
                        core.id().short(),
                        other
                    );
                    None
                }
            },
        }
    }

    /// Metrics snapshot computed over the bounded result history.
    fn metrics(&self) -> WorkerMetrics {
        let core = self.core();
        let history = core.history();
        let total = history.len();
        let successful = history.iter().filter(|r| r.success).count();
        let average_execution_time = if total > 0 {
            history
                .iter()
                .map(|r| r.execution_time.as_secs_f64())
                .sum::<f64>()
                / total as f64
        } else {
            0.0
        };

        WorkerMetrics {
            worker_id: core.id(),
            name: core.name().to_string(),
            state: core.state(),
            total_tasks: total,
            successful_tasks: successful,
            success_rate: if total > 0 {
                successful as f64 / total as f64
            } else {
                0.0
            },
            average_execution_time,
            current_load: core.current_load(),
            capability_count: core.capabilities().len(),
        }
    }
}
