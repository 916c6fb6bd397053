//! Task scheduler: priority backlog, worker selection, retry accounting.
//!
//! The scheduler owns the pending-task backlog (a binary heap keyed on
//! priority descending, arrival order ascending), tracks per-worker
//! performance, and binds tasks to eligible idle workers according to a
//! configurable strategy. An assignment pass stops at the first task it
//! cannot place: a stuck high-priority task is never skipped in favor of a
//! lower one.

use crate::task::{Task, TaskId, TaskResult, TaskStatus};
use crate::worker::{Worker, WorkerId, WorkerState};
use crate::{hlog, hlog_debug, hlog_warn};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashMap};
use std::sync::Arc;
use tokio::sync::mpsc;

/// Tasks at or above this priority use performance-based selection under
/// the priority-based strategy.
pub const HIGH_PRIORITY_THRESHOLD: i64 = 8;

/// Default maximum execution attempts per task.
pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;

/// Worker-selection strategy for the assignment pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Strategy {
    /// Cycle workers in registration order, skipping ineligible ones.
    RoundRobin,
    /// Pick the eligible worker with the lowest current load.
    LoadBalanced,
    /// Score by capability confidence and requirement coverage.
    CapabilityBased,
    /// Performance-based for high-priority tasks, else load-balanced.
    PriorityBased,
    /// Score by reliability, speed, and load.
    PerformanceBased,
}

impl Default for Strategy {
    fn default() -> Self {
        Self::LoadBalanced
    }
}

impl std::fmt::Display for Strategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Strategy::RoundRobin => "round_robin",
            Strategy::LoadBalanced => "load_balanced",
            Strategy::CapabilityBased => "capability_based",
            Strategy::PriorityBased => "priority_based",
            Strategy::PerformanceBased => "performance_based",
        };
        write!(f, "{}", s)
    }
}

/// The binding of a task to a worker for one or more execution attempts.
///
/// The attempt count survives requeue-on-retry: a re-assignment of a
/// retried task carries the prior count forward, so a task fails
/// terminally after exactly `max_attempts` failed attempts.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Assignment {
    pub task: Task,
    pub worker_id: WorkerId,
    pub assigned_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub status: TaskStatus,
    pub attempts: u32,
    pub max_attempts: u32,
}

/// Rolling performance counters for one worker. Owned exclusively by the
/// scheduler and mutated only when a result is recorded or a task is
/// assigned/cancelled.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerPerformance {
    pub worker_id: WorkerId,
    pub total_tasks: usize,
    pub successful_tasks: usize,
    pub failed_tasks: usize,
    pub average_execution_time: f64,
    pub last_activity: DateTime<Utc>,
    pub current_load: usize,
    pub reliability: f64,
}

impl WorkerPerformance {
    fn new(worker_id: WorkerId) -> Self {
        Self {
            worker_id,
            total_tasks: 0,
            successful_tasks: 0,
            failed_tasks: 0,
            average_execution_time: 0.0,
            last_activity: Utc::now(),
            current_load: 0,
            reliability: 1.0,
        }
    }
}

/// Lifecycle events emitted by the scheduler.
#[derive(Debug, Clone)]
pub enum SchedulerEvent {
    /// A task was bound to a worker.
    TaskAssigned { task_id: TaskId, worker_id: WorkerId },
    /// A dispatched assignment began executing.
    TaskStarted { task_id: TaskId, worker_id: WorkerId },
    /// A task finished successfully.
    TaskCompleted { result: TaskResult },
    /// A task failed terminally (attempts exhausted).
    TaskFailed { result: TaskResult },
    /// A failed task went back to the backlog for another attempt.
    TaskRequeued { task_id: TaskId, attempt: u32 },
    /// A task was cancelled.
    TaskCancelled { task_id: TaskId },
}

/// Counts of tasks by lifecycle stage, for observability.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueStatus {
    pub pending_tasks: usize,
    pub assigned_tasks: usize,
    pub in_progress_tasks: usize,
    pub completed_tasks: usize,
    pub failed_tasks: usize,
    pub total_assignments: usize,
}

/// Backlog entry. Orders by priority descending, then arrival ascending via
/// a monotonic sequence number (stable FIFO among equal priorities without
/// relying on wall-clock precision).
struct QueuedTask {
    priority: i64,
    seq: u64,
    task: Task,
}

impl PartialEq for QueuedTask {
    fn eq(&self, other: &Self) -> bool {
        self.priority == other.priority && self.seq == other.seq
    }
}

impl Eq for QueuedTask {}

impl PartialOrd for QueuedTask {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for QueuedTask {
    fn cmp(&self, other: &Self) -> Ordering {
        // Max-heap: greatest = highest priority, then earliest arrival.
        self.priority
            .cmp(&other.priority)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

/// The task distributor.
pub struct Scheduler {
    strategy: Strategy,
    max_attempts: u32,
    backlog: BinaryHeap<QueuedTask>,
    seq: u64,
    assignments: HashMap<TaskId, Assignment>,
    /// Last recorded result per task; what submitters poll for.
    results: HashMap<TaskId, TaskResult>,
    performance: HashMap<WorkerId, WorkerPerformance>,
    workers: HashMap<WorkerId, Arc<dyn Worker>>,
    registration_order: Vec<WorkerId>,
    rr_cursor: usize,
    events: mpsc::Sender<SchedulerEvent>,
}

impl Scheduler {
    /// Create a scheduler emitting lifecycle events on `events`.
    pub fn new(strategy: Strategy, max_attempts: u32, events: mpsc::Sender<SchedulerEvent>) -> Self {
        Self {
            strategy,
            max_attempts,
            backlog: BinaryHeap::new(),
            seq: 0,
            assignments: HashMap::new(),
            results: HashMap::new(),
            performance: HashMap::new(),
            workers: HashMap::new(),
            registration_order: Vec::new(),
            rr_cursor: 0,
            events,
        }
    }

    pub fn strategy(&self) -> Strategy {
        self.strategy
    }

    /// Register a worker for assignment and start tracking its performance.
    pub fn register_worker(&mut self, worker: Arc<dyn Worker>) {
        let id = worker.id();
        if self.workers.insert(id, worker).is_none() {
            self.registration_order.push(id);
            self.performance.insert(id, WorkerPerformance::new(id));
            hlog!("scheduler registered worker {}", id.short());
        }
    }

    /// Remove a worker from assignment consideration.
    pub fn unregister_worker(&mut self, worker_id: WorkerId) {
        if self.workers.remove(&worker_id).is_some() {
            self.registration_order.retain(|id| *id != worker_id);
            self.performance.remove(&worker_id);
            hlog!("scheduler unregistered worker {}", worker_id.short());
        }
    }

    /// Insert a task into the priority backlog.
    pub fn enqueue(&mut self, task: Task) {
        self.seq += 1;
        hlog_debug!(
            "enqueued task {} (priority {})",
            task.id.short(),
            task.priority
        );
        self.backlog.push(QueuedTask {
            priority: task.priority,
            seq: self.seq,
            task,
        });
    }

    /// Bind pending tasks to eligible idle workers, highest priority first.
    ///
    /// Stops at the first task without an eligible worker, pushing it back
    /// (head-of-line blocking by design). Returns the assignments made.
    pub fn assignment_pass(&mut self) -> Vec<Assignment> {
        let mut assignments = Vec::new();

        while let Some(queued) = self.backlog.pop() {
            match self.find_worker(&queued.task) {
                Some(worker_id) => {
                    let task = queued.task;
                    // A retried task keeps its accumulated attempt count.
                    let attempts = self
                        .assignments
                        .get(&task.id)
                        .map(|a| a.attempts)
                        .unwrap_or(0);
                    let assignment = Assignment {
                        worker_id,
                        assigned_at: Utc::now(),
                        started_at: None,
                        completed_at: None,
                        status: TaskStatus::Assigned,
                        attempts,
                        max_attempts: self.max_attempts,
                        task,
                    };

                    if let Some(perf) = self.performance.get_mut(&worker_id) {
                        perf.current_load += 1;
                        perf.last_activity = Utc::now();
                    }

                    hlog!(
                        "task {} assigned to worker {}",
                        assignment.task.id.short(),
                        worker_id.short()
                    );
                    let _ = self.events.try_send(SchedulerEvent::TaskAssigned {
                        task_id: assignment.task.id,
                        worker_id,
                    });

                    self.assignments
                        .insert(assignment.task.id, assignment.clone());
                    assignments.push(assignment);
                }
                None => {
                    self.backlog.push(queued);
                    break;
                }
            }
        }

        assignments
    }

    /// Mark a dispatched assignment as executing.
    pub fn mark_started(&mut self, task_id: TaskId) {
        if let Some(assignment) = self.assignments.get_mut(&task_id) {
            assignment.status = TaskStatus::InProgress;
            assignment.started_at = Some(Utc::now());
            let _ = self.events.try_send(SchedulerEvent::TaskStarted {
                task_id,
                worker_id: assignment.worker_id,
            });
        }
    }

    /// Record the outcome of an execution attempt.
    ///
    /// Updates the owning worker's counters, frees its load slot, and on
    /// failure requeues the task while attempts remain or marks it
    /// terminally failed.
    pub fn record_result(&mut self, result: TaskResult) {
        let (worker_id, requeue) = {
            let Some(assignment) = self.assignments.get_mut(&result.task_id) else {
                hlog_warn!("result for unknown task {}", result.task_id.short());
                return;
            };
            if assignment.status == TaskStatus::Cancelled {
                hlog_debug!(
                    "ignoring result for cancelled task {}",
                    result.task_id.short()
                );
                return;
            }

            assignment.completed_at = Some(Utc::now());
            if result.success {
                assignment.status = TaskStatus::Completed;
                (assignment.worker_id, None)
            } else {
                assignment.attempts += 1;
                if assignment.attempts < assignment.max_attempts {
                    assignment.status = TaskStatus::Pending;
                    let retry = assignment.task.clone();
                    let attempt = assignment.attempts;
                    (assignment.worker_id, Some((retry, attempt)))
                } else {
                    assignment.status = TaskStatus::Failed;
                    (assignment.worker_id, None)
                }
            }
        };

        if let Some(perf) = self.performance.get_mut(&worker_id) {
            perf.total_tasks += 1;
            perf.current_load = perf.current_load.saturating_sub(1);
            perf.last_activity = Utc::now();
            if result.success {
                perf.successful_tasks += 1;
                let total = perf.total_tasks as f64;
                perf.average_execution_time = (perf.average_execution_time * (total - 1.0)
                    + result.execution_time.as_secs_f64())
                    / total;
            } else {
                perf.failed_tasks += 1;
            }
            perf.reliability = perf.successful_tasks as f64 / perf.total_tasks as f64;
        }

        self.results.insert(result.task_id, result.clone());

        match requeue {
            Some((task, attempt)) => {
                hlog!(
                    "task {} failed, retrying (attempt {}/{})",
                    task.id.short(),
                    attempt,
                    self.max_attempts
                );
                let _ = self.events.try_send(SchedulerEvent::TaskRequeued {
                    task_id: task.id,
                    attempt,
                });
                self.enqueue(task);
            }
            None if result.success => {
                hlog!("task {} completed", result.task_id.short());
                let _ = self
                    .events
                    .try_send(SchedulerEvent::TaskCompleted { result });
            }
            None => {
                hlog_warn!("task {} failed terminally", result.task_id.short());
                let _ = self.events.try_send(SchedulerEvent::TaskFailed { result });
            }
        }
    }

    /// Cancel a task: remove it from the backlog if still pending, or mark
    /// its active assignment cancelled and free the worker's load slot.
    /// Returns whether anything was found.
    pub fn cancel(&mut self, task_id: TaskId) -> bool {
        let before = self.backlog.len();
        let entries = std::mem::take(&mut self.backlog).into_vec();
        self.backlog = entries
            .into_iter()
            .filter(|queued| queued.task.id != task_id)
            .collect();
        if self.backlog.len() < before {
            hlog!("task {} cancelled from backlog", task_id.short());
            let _ = self
                .events
                .try_send(SchedulerEvent::TaskCancelled { task_id });
            return true;
        }

        if let Some(assignment) = self.assignments.get_mut(&task_id) {
            if assignment.status.is_terminal() {
                return false;
            }
            assignment.status = TaskStatus::Cancelled;
            assignment.completed_at = Some(Utc::now());
            if let Some(perf) = self.performance.get_mut(&assignment.worker_id) {
                perf.current_load = perf.current_load.saturating_sub(1);
            }
            hlog!("task {} cancelled", task_id.short());
            let _ = self
                .events
                .try_send(SchedulerEvent::TaskCancelled { task_id });
            return true;
        }

        false
    }

    /// Last recorded result for a task, if any.
    pub fn result(&self, task_id: TaskId) -> Option<TaskResult> {
        self.results.get(&task_id).cloned()
    }

    /// Ids of this worker's non-terminal assignments.
    pub fn active_tasks_for(&self, worker_id: WorkerId) -> Vec<TaskId> {
        self.assignments
            .values()
            .filter(|a| a.worker_id == worker_id && !a.status.is_terminal())
            .map(|a| a.task.id)
            .collect()
    }

    /// Current assignment for a task, if any.
    pub fn assignment(&self, task_id: TaskId) -> Option<&Assignment> {
        self.assignments.get(&task_id)
    }

    /// Snapshot of all worker performance rows.
    pub fn performance(&self) -> HashMap<WorkerId, WorkerPerformance> {
        self.performance.clone()
    }

    /// Counts of tasks by lifecycle stage.
    pub fn queue_status(&self) -> QueueStatus {
        let count = |status: TaskStatus| {
            self.assignments
                .values()
                .filter(|a| a.status == status)
                .count()
        };
        QueueStatus {
            pending_tasks: self.backlog.len(),
            assigned_tasks: count(TaskStatus::Assigned),
            in_progress_tasks: count(TaskStatus::InProgress),
            completed_tasks: count(TaskStatus::Completed),
            failed_tasks: count(TaskStatus::Failed),
            total_assignments: self.assignments.len(),
        }
    }

    fn eligible(&self, worker_id: WorkerId, task: &Task) -> bool {
        match self.workers.get(&worker_id) {
            Some(worker) => worker.state() == WorkerState::Idle && worker.can_accept(task),
            None => false,
        }
    }

    fn find_worker(&mut self, task: &Task) -> Option<WorkerId> {
        match self.strategy {
            Strategy::RoundRobin => self.find_round_robin(task),
            Strategy::LoadBalanced => self.find_load_balanced(task),
            Strategy::CapabilityBased => self.find_capability_based(task),
            Strategy::PriorityBased => {
                if task.priority >= HIGH_PRIORITY_THRESHOLD {
                    self.find_performance_based(task)
                } else {
                    self.find_load_balanced(task)
                }
            }
            Strategy::PerformanceBased => self.find_performance_based(task),
        }
    }

    fn find_round_robin(&mut self, task: &Task) -> Option<WorkerId> {
        if self.registration_order.is_empty() {
            return None;
        }
        for _ in 0..self.registration_order.len() {
            let worker_id = self.registration_order[self.rr_cursor % self.registration_order.len()];
            self.rr_cursor = self.rr_cursor.wrapping_add(1);
            if self.eligible(worker_id, task) {
                return Some(worker_id);
            }
        }
        None
    }

    fn find_load_balanced(&self, task: &Task) -> Option<WorkerId> {
        let mut best: Option<(usize, WorkerId)> = None;
        for worker_id in &self.registration_order {
            if !self.eligible(*worker_id, task) {
                continue;
            }
            let load = self
                .performance
                .get(worker_id)
                .map(|p| p.current_load)
                .unwrap_or(0);
            if best.map(|(l, _)| load < l).unwrap_or(true) {
                best = Some((load, *worker_id));
            }
        }
        best.map(|(_, id)| id)
    }

    fn find_capability_based(&self, task: &Task) -> Option<WorkerId> {
        let mut best: Option<(f64, WorkerId)> = None;
        for worker_id in &self.registration_order {
            if !self.eligible(*worker_id, task) {
                continue;
            }
            let Some(worker) = self.workers.get(worker_id) else {
                continue;
            };
            let score = capability_score(worker.as_ref(), task);
            if score > best.map(|(s, _)| s).unwrap_or(0.0) {
                best = Some((score, *worker_id));
            }
        }
        best.map(|(_, id)| id)
    }

    fn find_performance_based(&self, task: &Task) -> Option<WorkerId> {
        let mut best: Option<(f64, WorkerId)> = None;
        for worker_id in &self.registration_order {
            if !self.eligible(*worker_id, task) {
                continue;
            }
            let Some(perf) = self.performance.get(worker_id) else {
                continue;
            };
            let speed = 1.0 / (perf.average_execution_time + 1.0);
            let load_penalty = 1.0 / (perf.current_load as f64 + 1.0);
            let score = perf.reliability * speed * load_penalty;
            if score > best.map(|(s, _)| s).unwrap_or(0.0) {
                best = Some((score, *worker_id));
            }
        }
        best.map(|(_, id)| id)
    }
}

/// Capability-match score: mean confidence over matched requirements scaled
/// by the fraction of requirements matched. 1.0 when the task has no
/// requirements, 0.0 when none match.
fn capability_score(worker: &dyn Worker, task: &Task) -> f64 {
    if task.requirements.is_empty() {
        return 1.0;
    }
    let capabilities = worker.capabilities();
    let mut total_confidence = 0.0;
    let mut matched = 0usize;
    for requirement in &task.requirements {
        if let Some(capability) = capabilities.iter().find(|c| &c.name == requirement) {
            total_confidence += capability.confidence;
            matched += 1;
        }
    }
    if matched == 0 {
        return 0.0;
    }
    let average_confidence = total_confidence / matched as f64;
    let coverage = matched as f64 / task.requirements.len() as f64;
    average_confidence * coverage
}
