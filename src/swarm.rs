//! Swarm orchestrator: lifecycle, background loops, and the public API.
//!
//! The swarm owns the channel, the scheduler, and the collective. `start`
//! launches independent background loops (health check, task distribution,
//! message processing, optional auto-scaling placeholder) that cooperate
//! through a shared `CancellationToken`; `stop` cancels them, shuts workers
//! down, and stops the channel. Each loop logs and continues on a failed
//! iteration so one faulty pass never terminates it.

use crate::channel::{Channel, ChannelStats, Message};
use crate::collective::Collective;
use crate::config::SwarmConfig;
use crate::error::{Error, Result};
use crate::scheduler::{QueueStatus, Scheduler, SchedulerEvent};
use crate::task::{Task, TaskId, TaskResult, TaskStatus};
use crate::worker::{Worker, WorkerId, WorkerMetrics, WorkerState, MSG_SHUTDOWN};
use crate::{hlog, hlog_debug, hlog_error, hlog_warn};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock as StdRwLock};
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, RwLock};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Interval of the auto-scaling placeholder loop.
const AUTO_SCALE_INTERVAL: Duration = Duration::from_secs(60);

/// Buffer size of the scheduler event channel.
const EVENT_BUFFER: usize = 1024;

/// Swarm lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SwarmState {
    Initializing,
    Running,
    Paused,
    Stopping,
    Stopped,
    Error,
}

impl std::fmt::Display for SwarmState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            SwarmState::Initializing => "initializing",
            SwarmState::Running => "running",
            SwarmState::Paused => "paused",
            SwarmState::Stopping => "stopping",
            SwarmState::Stopped => "stopped",
            SwarmState::Error => "error",
        };
        write!(f, "{}", s)
    }
}

/// Point-in-time swarm status snapshot.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SwarmStatus {
    pub state: SwarmState,
    pub uptime_secs: f64,
    pub worker_count: usize,
    pub tasks_processed: u64,
    pub successful_tasks: u64,
    pub failed_tasks: u64,
    pub success_rate: f64,
    pub queue: QueueStatus,
    pub channel: ChannelStats,
}

/// Public view of one registered worker.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerInfo {
    pub id: WorkerId,
    pub name: String,
    pub state: WorkerState,
    pub capabilities: Vec<String>,
    pub current_load: usize,
    pub metrics: WorkerMetrics,
}

#[derive(Default)]
struct Counters {
    processed: AtomicU64,
    successful: AtomicU64,
    failed: AtomicU64,
}

type ErrorCallback = Box<dyn Fn(&Error) + Send + Sync>;

/// The swarm manager.
pub struct Swarm {
    config: SwarmConfig,
    /// Identity the swarm uses as message sender.
    sender_id: WorkerId,
    state: Arc<StdRwLock<SwarmState>>,
    channel: Arc<Channel>,
    scheduler: Arc<RwLock<Scheduler>>,
    collective: Arc<Collective>,
    workers: Arc<RwLock<HashMap<WorkerId, Arc<dyn Worker>>>>,
    counters: Arc<Counters>,
    started_at: Mutex<Option<Instant>>,
    cancel: Mutex<Option<CancellationToken>>,
    loop_handles: Mutex<Vec<JoinHandle<()>>>,
    events: Mutex<Option<mpsc::Receiver<SchedulerEvent>>>,
    on_error: Mutex<Option<ErrorCallback>>,
}

impl Swarm {
    /// Create a stopped swarm from configuration.
    pub fn new(config: SwarmConfig) -> Self {
        let channel = Arc::new(Channel::new(config.mailbox_capacity.max(1)));
        let (event_tx, event_rx) = mpsc::channel(EVENT_BUFFER);
        let scheduler = Scheduler::new(config.strategy, config.max_task_attempts, event_tx);
        let collective = Collective::new(Arc::clone(&channel));

        Self {
            sender_id: WorkerId::new(),
            state: Arc::new(StdRwLock::new(SwarmState::Initializing)),
            channel,
            scheduler: Arc::new(RwLock::new(scheduler)),
            collective: Arc::new(collective),
            workers: Arc::new(RwLock::new(HashMap::new())),
            counters: Arc::new(Counters::default()),
            started_at: Mutex::new(None),
            cancel: Mutex::new(None),
            loop_handles: Mutex::new(Vec::new()),
            events: Mutex::new(Some(event_rx)),
            on_error: Mutex::new(None),
            config,
        }
    }

    pub fn config(&self) -> &SwarmConfig {
        &self.config
    }

    pub fn state(&self) -> SwarmState {
        *self.state.read().expect("state lock poisoned")
    }

    fn set_state(&self, state: SwarmState) {
        *self.state.write().expect("state lock poisoned") = state;
        hlog_debug!("swarm state -> {}", state);
    }

    /// The collective-intelligence engine for this swarm.
    pub fn collective(&self) -> Arc<Collective> {
        Arc::clone(&self.collective)
    }

    /// The message channel for this swarm.
    pub fn channel(&self) -> Arc<Channel> {
        Arc::clone(&self.channel)
    }

    /// Register a callback invoked on unrecoverable swarm errors.
    pub fn set_error_callback(&self, callback: impl Fn(&Error) + Send + Sync + 'static) {
        *self.on_error.lock().expect("callback lock poisoned") = Some(Box::new(callback));
    }

    /// Start the channel and launch the background loops.
    ///
    /// Startup failure is fatal: the swarm transitions to Error, the error
    /// callback runs, and the error is returned to the caller.
    pub fn start(&self) -> Result<()> {
        if let Err(err) = self.try_start() {
            self.set_state(SwarmState::Error);
            hlog_error!("swarm startup failed: {}", err);
            if let Some(callback) = self.on_error.lock().expect("callback lock poisoned").as_ref()
            {
                callback(&err);
            }
            return Err(err);
        }
        Ok(())
    }

    fn try_start(&self) -> Result<()> {
        if self.config.max_workers == 0 {
            return Err(Error::Startup("max_workers must be positive".to_string()));
        }
        let event_rx = self
            .events
            .lock()
            .expect("events lock poisoned")
            .take()
            .ok_or_else(|| Error::Startup("swarm already started".to_string()))?;

        self.channel.start();
        self.set_state(SwarmState::Running);
        *self.started_at.lock().expect("started_at lock poisoned") = Some(Instant::now());

        let cancel = CancellationToken::new();
        let mut handles = Vec::new();
        handles.push(self.spawn_health_loop(cancel.child_token()));
        handles.push(self.spawn_distribution_loop(cancel.child_token()));
        handles.push(self.spawn_message_loop(cancel.child_token()));
        handles.push(self.spawn_event_loop(cancel.child_token(), event_rx));
        if self.config.auto_scale {
            handles.push(self.spawn_auto_scale_loop(cancel.child_token()));
        }

        *self.cancel.lock().expect("cancel lock poisoned") = Some(cancel);
        *self.loop_handles.lock().expect("handles lock poisoned") = handles;

        hlog!("swarm started with strategy {}", self.config.strategy);
        Ok(())
    }

    /// Cancel the background loops, shut every worker down, stop the channel.
    pub async fn stop(&self) {
        self.set_state(SwarmState::Stopping);

        if let Some(cancel) = self.cancel.lock().expect("cancel lock poisoned").take() {
            cancel.cancel();
        }
        let handles = std::mem::take(
            &mut *self.loop_handles.lock().expect("handles lock poisoned"),
        );
        for handle in handles {
            let _ = handle.await;
        }

        let workers: Vec<Arc<dyn Worker>> = self.workers.read().await.values().cloned().collect();
        for worker in workers {
            worker
                .handle_message(MSG_SHUTDOWN, &Value::Null, self.sender_id)
                .await;
        }

        self.channel.stop();
        self.set_state(SwarmState::Stopped);
        hlog!("swarm stopped");
    }

    /// Pause task distribution and message processing. Loops keep ticking
    /// but skip their work until `resume`.
    pub fn pause(&self) {
        if self.state() == SwarmState::Running {
            self.set_state(SwarmState::Paused);
        }
    }

    /// Resume from a paused state.
    pub fn resume(&self) {
        if self.state() == SwarmState::Paused {
            self.set_state(SwarmState::Running);
        }
    }

    /// Register a worker with the channel, the scheduler, and the
    /// collective. Rejects (false) at capacity or on a duplicate id.
    pub async fn add_worker(&self, worker: Arc<dyn Worker>) -> bool {
        let mut workers = self.workers.write().await;
        if workers.len() >= self.config.max_workers {
            hlog_warn!("worker limit reached ({})", self.config.max_workers);
            return false;
        }
        let id = worker.id();
        if workers.contains_key(&id) {
            hlog_warn!("worker {} already registered", id.short());
            return false;
        }

        self.channel.register(id);
        self.scheduler.write().await.register_worker(Arc::clone(&worker));
        self.collective.register_worker(id);
        workers.insert(id, worker);
        hlog!("worker {} joined the swarm", id.short());
        true
    }

    /// Shut a worker down, cancel its in-flight assignments, and remove its
    /// registrations. Returns false for an unknown id.
    pub async fn remove_worker(&self, worker_id: WorkerId) -> bool {
        let worker = {
            let mut workers = self.workers.write().await;
            match workers.remove(&worker_id) {
                Some(worker) => worker,
                None => {
                    hlog_warn!("worker {} not found", worker_id.short());
                    return false;
                }
            }
        };

        worker
            .handle_message(MSG_SHUTDOWN, &Value::Null, self.sender_id)
            .await;

        {
            let mut scheduler = self.scheduler.write().await;
            for task_id in scheduler.active_tasks_for(worker_id) {
                scheduler.cancel(task_id);
            }
            scheduler.unregister_worker(worker_id);
        }
        self.channel.unregister(worker_id);
        self.collective.unregister_worker(worker_id);

        hlog!("worker {} left the swarm", worker_id.short());
        true
    }

    /// Submit a task and wait for its terminal result.
    ///
    /// A task without a timeout gets the configured default. The wait is
    /// bounded by the task timeout plus a grace period; if no terminal
    /// result appears in time a failure result is returned.
    pub async fn submit(&self, mut task: Task) -> TaskResult {
        if self.state() != SwarmState::Running {
            return TaskResult::failure(task.id, None, "swarm is not running", Duration::ZERO);
        }
        if task.timeout.is_none() {
            task.timeout = Some(self.config.task_timeout());
        }
        let task_id = task.id;
        let wait = task.timeout.unwrap_or_default() + self.config.result_grace();

        self.scheduler.write().await.enqueue(task);
        self.wait_for_result(task_id, wait).await
    }

    /// Submit a batch, enqueuing everything first so scheduling can
    /// interleave across the batch, then await each result in order.
    pub async fn submit_batch(&self, tasks: Vec<Task>) -> Vec<TaskResult> {
        if self.state() != SwarmState::Running {
            return tasks
                .into_iter()
                .map(|task| {
                    TaskResult::failure(task.id, None, "swarm is not running", Duration::ZERO)
                })
                .collect();
        }

        let mut waits = Vec::with_capacity(tasks.len());
        {
            let mut scheduler = self.scheduler.write().await;
            for mut task in tasks {
                if task.timeout.is_none() {
                    task.timeout = Some(self.config.task_timeout());
                }
                waits.push((task.id, task.timeout.unwrap_or_default() + self.config.result_grace()));
                scheduler.enqueue(task);
            }
        }

        let mut results = Vec::with_capacity(waits.len());
        for (task_id, wait) in waits {
            results.push(self.wait_for_result(task_id, wait).await);
        }
        results
    }

    async fn wait_for_result(&self, task_id: TaskId, wait: Duration) -> TaskResult {
        let deadline = Instant::now() + wait;
        loop {
            {
                let scheduler = self.scheduler.read().await;
                if let Some(assignment) = scheduler.assignment(task_id) {
                    if assignment.status.is_terminal() {
                        if let Some(result) = scheduler.result(task_id) {
                            return result;
                        }
                        if assignment.status == TaskStatus::Cancelled {
                            return TaskResult::failure(
                                task_id,
                                None,
                                "task was cancelled",
                                Duration::ZERO,
                            );
                        }
                    }
                }
            }
            if Instant::now() >= deadline {
                hlog_warn!("timed out waiting for result of task {}", task_id.short());
                return TaskResult::failure(
                    task_id,
                    None,
                    "timed out waiting for task result",
                    Duration::ZERO,
                );
            }
            tokio::time::sleep(self.config.result_poll_interval()).await;
        }
    }

    /// Cancel a task by id. Returns whether anything was found.
    pub async fn cancel_task(&self, task_id: TaskId) -> bool {
        self.scheduler.write().await.cancel(task_id)
    }

    /// Status snapshot: state, uptime, counters, queue and channel stats.
    pub async fn status(&self) -> SwarmStatus {
        let queue = self.scheduler.read().await.queue_status();
        let processed = self.counters.processed.load(Ordering::Relaxed);
        let successful = self.counters.successful.load(Ordering::Relaxed);
        SwarmStatus {
            state: self.state(),
            uptime_secs: self
                .started_at
                .lock()
                .expect("started_at lock poisoned")
                .map(|t| t.elapsed().as_secs_f64())
                .unwrap_or(0.0),
            worker_count: self.workers.read().await.len(),
            tasks_processed: processed,
            successful_tasks: successful,
            failed_tasks: self.counters.failed.load(Ordering::Relaxed),
            success_rate: if processed > 0 {
                successful as f64 / processed as f64
            } else {
                0.0
            },
            queue,
            channel: self.channel.stats(),
        }
    }

    /// Public view of every registered worker.
    pub async fn worker_list(&self) -> Vec<WorkerInfo> {
        self.workers
            .read()
            .await
            .values()
            .map(|worker| WorkerInfo {
                id: worker.id(),
                name: worker.name().to_string(),
                state: worker.state(),
                capabilities: worker
                    .capabilities()
                    .into_iter()
                    .map(|c| c.name)
                    .collect(),
                current_load: worker.current_load(),
                metrics: worker.metrics(),
            })
            .collect()
    }

    fn spawn_health_loop(&self, cancel: CancellationToken) -> JoinHandle<()> {
        let interval = self.config.health_check_interval();
        let workers = Arc::clone(&self.workers);
        let state = Arc::clone(&self.state);
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(interval) => {
                        if *state.read().expect("state lock poisoned") != SwarmState::Running {
                            continue;
                        }
                        let workers = workers.read().await;
                        let busy = workers.values().filter(|w| w.state() == WorkerState::Working).count();
                        hlog_debug!("health check: {} workers, {} working", workers.len(), busy);
                    }
                }
            }
        })
    }

    fn spawn_distribution_loop(&self, cancel: CancellationToken) -> JoinHandle<()> {
        let interval = self.config.distribution_interval();
        let scheduler = Arc::clone(&self.scheduler);
        let workers = Arc::clone(&self.workers);
        let state = Arc::clone(&self.state);
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(interval) => {
                        if *state.read().expect("state lock poisoned") != SwarmState::Running {
                            continue;
                        }
                        distribution_pass(&scheduler, &workers).await;
                    }
                }
            }
        })
    }

    fn spawn_message_loop(&self, cancel: CancellationToken) -> JoinHandle<()> {
        let poll = self.config.message_poll_timeout();
        let channel = Arc::clone(&self.channel);
        let workers = Arc::clone(&self.workers);
        let state = Arc::clone(&self.state);
        tokio::spawn(async move {
            loop {
                if cancel.is_cancelled() {
                    break;
                }
                if *state.read().expect("state lock poisoned") != SwarmState::Running {
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        _ = tokio::time::sleep(poll) => continue,
                    }
                }
                message_pass(&channel, &workers, poll).await;
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(poll) => {}
                }
            }
        })
    }

    fn spawn_event_loop(
        &self,
        cancel: CancellationToken,
        mut events: mpsc::Receiver<SchedulerEvent>,
    ) -> JoinHandle<()> {
        let counters = Arc::clone(&self.counters);
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    event = events.recv() => {
                        let Some(event) = event else { break };
                        match event {
                            SchedulerEvent::TaskCompleted { .. } => {
                                counters.processed.fetch_add(1, Ordering::Relaxed);
                                counters.successful.fetch_add(1, Ordering::Relaxed);
                            }
                            SchedulerEvent::TaskFailed { .. } => {
                                counters.processed.fetch_add(1, Ordering::Relaxed);
                                counters.failed.fetch_add(1, Ordering::Relaxed);
                            }
                            _ => {}
                        }
                    }
                }
            }
        })
    }

    fn spawn_auto_scale_loop(&self, cancel: CancellationToken) -> JoinHandle<()> {
        let workers = Arc::clone(&self.workers);
        let min_workers = self.config.min_workers;
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(AUTO_SCALE_INTERVAL) => {
                        // Placeholder hook: observe only, never scales.
                        let count = workers.read().await.len();
                        if count < min_workers {
                            hlog_warn!("worker count {} below minimum {}", count, min_workers);
                        }
                    }
                }
            }
        })
    }
}

/// One task-distribution iteration: run an assignment pass, then dispatch
/// each assignment as an independent execution task that records its result
/// back into the scheduler.
async fn distribution_pass(
    scheduler: &Arc<RwLock<Scheduler>>,
    workers: &Arc<RwLock<HashMap<WorkerId, Arc<dyn Worker>>>>,
) {
    let assignments = scheduler.write().await.assignment_pass();
    for assignment in assignments {
        let worker = workers.read().await.get(&assignment.worker_id).cloned();
        let Some(worker) = worker else {
            hlog_warn!(
                "assigned worker {} vanished before dispatch",
                assignment.worker_id.short()
            );
            scheduler.write().await.record_result(TaskResult::failure(
                assignment.task.id,
                None,
                "worker no longer registered",
                Duration::ZERO,
            ));
            continue;
        };

        scheduler.write().await.mark_started(assignment.task.id);
        let scheduler = Arc::clone(scheduler);
        tokio::spawn(async move {
            let result = worker.execute(assignment.task).await;
            scheduler.write().await.record_result(result);
        });
    }
}

/// One message-processing iteration: drain each registered worker's mailbox
/// with a short timeout and forward to its handler, replying when the
/// message asked for a response.
async fn message_pass(
    channel: &Arc<Channel>,
    workers: &Arc<RwLock<HashMap<WorkerId, Arc<dyn Worker>>>>,
    poll: Duration,
) {
    let snapshot: Vec<(WorkerId, Arc<dyn Worker>)> = workers
        .read()
        .await
        .iter()
        .map(|(id, worker)| (*id, Arc::clone(worker)))
        .collect();

    for (worker_id, worker) in snapshot {
        let Some(message) = channel.receive(worker_id, Some(poll)).await else {
            continue;
        };
        let response = worker
            .handle_message(&message.kind, &message.content, message.sender)
            .await;
        if message.requires_response {
            if let Some(content) = response {
                channel.send(Message::response_to(&message, worker_id, content));
            }
        }
    }
}
