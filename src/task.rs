//! Task data model for the swarm.
//!
//! Tasks are the atomic units of work pulled from the backlog and assigned
//! to workers. A task is immutable once enqueued; retries re-enqueue the
//! same task under its original id.

use crate::worker::WorkerId;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::time::Duration;
use uuid::Uuid;

/// Unique identifier for a task.
///
/// Uses UUID v4 for generation and provides a short form display
/// for human-readable output.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskId(pub Uuid);

impl TaskId {
    /// Create a new unique task identifier.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Return first 8 characters of the UUID for display.
    pub fn short(&self) -> String {
        self.0.to_string()[..8].to_string()
    }
}

impl Default for TaskId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for TaskId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::str::FromStr for TaskId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Ok(Self(Uuid::parse_str(s)?))
    }
}

/// Lifecycle status of a task assignment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    /// Waiting in the backlog for assignment.
    Pending,
    /// Bound to a worker but not yet dispatched.
    Assigned,
    /// Dispatched and currently executing.
    InProgress,
    /// Finished successfully.
    Completed,
    /// Finished unsuccessfully; terminal once attempts are exhausted.
    Failed,
    /// Cancelled before or during execution.
    Cancelled,
}

impl TaskStatus {
    /// Whether this status ends the assignment's lifecycle.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskStatus::Completed | TaskStatus::Failed | TaskStatus::Cancelled
        )
    }
}

impl Default for TaskStatus {
    fn default() -> Self {
        Self::Pending
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            TaskStatus::Pending => "pending",
            TaskStatus::Assigned => "assigned",
            TaskStatus::InProgress => "in_progress",
            TaskStatus::Completed => "completed",
            TaskStatus::Failed => "failed",
            TaskStatus::Cancelled => "cancelled",
        };
        write!(f, "{}", s)
    }
}

/// A unit of work submitted to the swarm.
///
/// Priority is an integer where higher means more urgent. Requirements name
/// capabilities the executing worker must declare. The context map carries
/// opaque caller data through to the worker.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    /// Unique identifier for this task.
    pub id: TaskId,
    /// Opaque work payload handed to the worker.
    pub content: Value,
    /// Scheduling priority; higher values are served first.
    pub priority: i64,
    /// Capability names the executing worker must declare.
    pub requirements: Vec<String>,
    /// Opaque caller context passed through to the worker.
    pub context: HashMap<String, Value>,
    /// Per-attempt execution timeout; the swarm default applies when unset.
    pub timeout: Option<Duration>,
    /// When the task was created.
    pub created_at: DateTime<Utc>,
}

impl Task {
    /// Create a new task with the given payload and default priority 1.
    pub fn new(content: impl Into<Value>) -> Self {
        Self {
            id: TaskId::new(),
            content: content.into(),
            priority: 1,
            requirements: Vec::new(),
            context: HashMap::new(),
            timeout: None,
            created_at: Utc::now(),
        }
    }

    /// Set the scheduling priority.
    pub fn with_priority(mut self, priority: i64) -> Self {
        self.priority = priority;
        self
    }

    /// Add a required capability name.
    pub fn requiring(mut self, capability: &str) -> Self {
        self.requirements.push(capability.to_string());
        self
    }

    /// Attach a context entry.
    pub fn with_context(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.context.insert(key.to_string(), value.into());
        self
    }

    /// Set the per-attempt execution timeout.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

/// Outcome of one execution attempt of a task.
///
/// A retried task produces several results under the same task id; only the
/// last one matters to the submitter. `worker_id` is absent when the swarm
/// itself fabricates a result (e.g. a submit-side wait timeout).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskResult {
    pub task_id: TaskId,
    pub worker_id: Option<WorkerId>,
    pub success: bool,
    pub output: Option<Value>,
    pub error: Option<String>,
    pub execution_time: Duration,
    /// Worker's confidence in the output, in [0, 1].
    pub confidence: f64,
}

impl TaskResult {
    /// Build a successful result.
    pub fn success(
        task_id: TaskId,
        worker_id: WorkerId,
        output: Value,
        execution_time: Duration,
    ) -> Self {
        Self {
            task_id,
            worker_id: Some(worker_id),
            success: true,
            output: Some(output),
            error: None,
            execution_time,
            confidence: 1.0,
        }
    }

    /// Build a failed result carrying an error description.
    pub fn failure(
        task_id: TaskId,
        worker_id: Option<WorkerId>,
        error: impl Into<String>,
        execution_time: Duration,
    ) -> Self {
        Self {
            task_id,
            worker_id,
            success: false,
            output: None,
            error: Some(error.into()),
            execution_time,
            confidence: 1.0,
        }
    }

    /// Override the confidence attached to this result.
    pub fn with_confidence(mut self, confidence: f64) -> Self {
        self.confidence = confidence;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    // TaskId tests

    #[test]
    fn test_task_id_new_is_unique() {
        assert_ne!(TaskId::new(), TaskId::new());
    }

    #[test]
    fn test_task_id_short() {
        assert_eq!(TaskId::new().short().len(), 8);
    }

    #[test]
    fn test_task_id_display_roundtrip() {
        let id = TaskId::new();
        let parsed: TaskId = id.to_string().parse().unwrap();
        assert_eq!(id, parsed);
    }

    #[test]
    fn test_task_id_from_str_invalid() {
        let result: std::result::Result<TaskId, _> = "not-a-uuid".parse();
        assert!(result.is_err());
    }

    #[test]
    fn test_task_id_serialization_transparent() {
        let id = TaskId::new();
        let json = serde_json::to_string(&id).unwrap();
        assert_eq!(json, format!("\"{}\"", id.0));
        let parsed: TaskId = serde_json::from_str(&json).unwrap();
        assert_eq!(id, parsed);
    }

    // TaskStatus tests

    #[test]
    fn test_task_status_default() {
        assert_eq!(TaskStatus::default(), TaskStatus::Pending);
    }

    #[test]
    fn test_task_status_display() {
        assert_eq!(format!("{}", TaskStatus::Pending), "pending");
        assert_eq!(format!("{}", TaskStatus::InProgress), "in_progress");
        assert_eq!(format!("{}", TaskStatus::Cancelled), "cancelled");
    }

    #[test]
    fn test_task_status_terminal() {
        assert!(!TaskStatus::Pending.is_terminal());
        assert!(!TaskStatus::Assigned.is_terminal());
        assert!(!TaskStatus::InProgress.is_terminal());
        assert!(TaskStatus::Completed.is_terminal());
        assert!(TaskStatus::Failed.is_terminal());
        assert!(TaskStatus::Cancelled.is_terminal());
    }

    #[test]
    fn test_task_status_serialization() {
        let json = serde_json::to_string(&TaskStatus::InProgress).unwrap();
        assert_eq!(json, "\"in_progress\"");
        let parsed: TaskStatus = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, TaskStatus::InProgress);
    }

    // Task tests

    #[test]
    fn test_task_new_defaults() {
        let task = Task::new("analyze this");
        assert_eq!(task.content, json!("analyze this"));
        assert_eq!(task.priority, 1);
        assert!(task.requirements.is_empty());
        assert!(task.context.is_empty());
        assert!(task.timeout.is_none());
    }

    #[test]
    fn test_task_builders() {
        let task = Task::new(json!({"op": "review"}))
            .with_priority(9)
            .requiring("analyze")
            .requiring("review")
            .with_context("origin", "test")
            .with_timeout(Duration::from_secs(5));

        assert_eq!(task.priority, 9);
        assert_eq!(task.requirements, vec!["analyze", "review"]);
        assert_eq!(task.context.get("origin"), Some(&json!("test")));
        assert_eq!(task.timeout, Some(Duration::from_secs(5)));
    }

    #[test]
    fn test_task_serialization_roundtrip() {
        let task = Task::new("payload").with_priority(3).requiring("analyze");
        let json = serde_json::to_string(&task).unwrap();
        let parsed: Task = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed.id, task.id);
        assert_eq!(parsed.priority, 3);
        assert_eq!(parsed.requirements, vec!["analyze"]);
    }

    // TaskResult tests

    #[test]
    fn test_task_result_success() {
        let task_id = TaskId::new();
        let worker_id = WorkerId::new();
        let result = TaskResult::success(
            task_id,
            worker_id,
            json!("done"),
            Duration::from_millis(120),
        );

        assert!(result.success);
        assert_eq!(result.worker_id, Some(worker_id));
        assert_eq!(result.output, Some(json!("done")));
        assert!(result.error.is_none());
        assert_eq!(result.confidence, 1.0);
    }

    #[test]
    fn test_task_result_failure() {
        let result = TaskResult::failure(
            TaskId::new(),
            None,
            "execution timed out",
            Duration::from_secs(30),
        );

        assert!(!result.success);
        assert!(result.worker_id.is_none());
        assert!(result.output.is_none());
        assert_eq!(result.error.as_deref(), Some("execution timed out"));
    }

    #[test]
    fn test_task_result_with_confidence() {
        let result = TaskResult::success(
            TaskId::new(),
            WorkerId::new(),
            json!(42),
            Duration::ZERO,
        )
        .with_confidence(0.25);
        assert_eq!(result.confidence, 0.25);
    }
}
