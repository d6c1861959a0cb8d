use crate::constants::{
    DEFAULT_MAX_CONCURRENCY, DEFAULT_RETRY_COUNT, DEFAULT_RETRY_DELAY_MS, DEFAULT_TASK_TIMEOUT_MS,
};
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use uuid::Uuid;

/// Milliseconds since the Unix epoch.
///
/// Every timestamp in the system uses this representation: on the wire as
/// a JSON integer, on storage as the stringified integer.
pub type TimestampMs = i64;

pub fn now_ms() -> TimestampMs {
    chrono::Utc::now().timestamp_millis()
}

/// Lifecycle states of a queue.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum QueueStatus {
    Idle,
    Running,
    Paused,
    Completed,
    Failed,
}

impl QueueStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            QueueStatus::Idle => "idle",
            QueueStatus::Running => "running",
            QueueStatus::Paused => "paused",
            QueueStatus::Completed => "completed",
            QueueStatus::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, QueueStatus::Completed | QueueStatus::Failed)
    }
}

impl FromStr for QueueStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "idle" => Ok(QueueStatus::Idle),
            "running" => Ok(QueueStatus::Running),
            "paused" => Ok(QueueStatus::Paused),
            "completed" => Ok(QueueStatus::Completed),
            "failed" => Ok(QueueStatus::Failed),
            _ => Err(format!("Unknown queue status: {s}")),
        }
    }
}

/// Lifecycle states of a task.
///
/// `Queued` is a synonym of `Pending` from before the scheduler has
/// observed the task; both are dispatchable. Terminal states are
/// `Completed`, `Failed`, and `Cancelled`.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    Queued,
    InProgress,
    Retrying,
    Completed,
    Failed,
    Cancelled,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Pending => "pending",
            TaskStatus::Queued => "queued",
            TaskStatus::InProgress => "in_progress",
            TaskStatus::Retrying => "retrying",
            TaskStatus::Completed => "completed",
            TaskStatus::Failed => "failed",
            TaskStatus::Cancelled => "cancelled",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskStatus::Completed | TaskStatus::Failed | TaskStatus::Cancelled
        )
    }

    /// States eligible for dispatch selection.
    pub fn is_dispatchable(&self) -> bool {
        matches!(self, TaskStatus::Pending | TaskStatus::Queued)
    }
}

impl FromStr for TaskStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(TaskStatus::Pending),
            "queued" => Ok(TaskStatus::Queued),
            "in_progress" => Ok(TaskStatus::InProgress),
            "retrying" => Ok(TaskStatus::Retrying),
            "completed" => Ok(TaskStatus::Completed),
            "failed" => Ok(TaskStatus::Failed),
            "cancelled" => Ok(TaskStatus::Cancelled),
            _ => Err(format!("Unknown task status: {s}")),
        }
    }
}

/// Rough task sizing supplied by the client. Informational only; the
/// scheduler orders by `priority`.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Complexity {
    Low,
    Medium,
    High,
}

/// Per-queue execution knobs.
///
/// Unknown keys in client input are ignored; omitted keys take the
/// defaults below.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase", default)]
pub struct QueueSettings {
    /// Cap on simultaneous dispatches.
    pub max_concurrency: usize,
    /// Upper bound on retry attempts per task.
    pub retry_count: u32,
    /// Base backoff in milliseconds; attempt n waits `retryDelay * 2^(n-1)`.
    pub retry_delay: u64,
    /// Hard deadline for one dispatch, in milliseconds.
    pub timeout_per_task: u64,
}

impl Default for QueueSettings {
    fn default() -> Self {
        Self {
            max_concurrency: DEFAULT_MAX_CONCURRENCY,
            retry_count: DEFAULT_RETRY_COUNT,
            retry_delay: DEFAULT_RETRY_DELAY_MS,
            timeout_per_task: DEFAULT_TASK_TIMEOUT_MS,
        }
    }
}

/// Outcome of a successful (or partially successful) invocation.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct TaskResult {
    #[serde(rename = "type")]
    pub kind: ResultKind,
    pub content: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    pub completed_at: TimestampMs,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ResultKind {
    Success,
    /// The agent stream ended before a `done` frame but produced content.
    Partial,
}

/// Classified invocation failure.
///
/// The invoker's retryability classification is final; the scheduler acts
/// on it without second-guessing.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct TaskError {
    #[serde(rename = "type")]
    pub kind: ErrorKind,
    pub message: String,
    pub retryable: bool,
    pub occurred_at: TimestampMs,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Remote agent reported an error, bad auth, or malformed response.
    Execution,
    /// Per-read or per-task deadline exceeded.
    Timeout,
    /// Transport failure or 5xx from the agent.
    Network,
    /// Cancellation observed; never retryable.
    Abort,
}

impl TaskError {
    pub fn execution(message: impl Into<String>, retryable: bool) -> Self {
        Self {
            kind: ErrorKind::Execution,
            message: message.into(),
            retryable,
            occurred_at: now_ms(),
        }
    }

    pub fn timeout(message: impl Into<String>) -> Self {
        Self {
            kind: ErrorKind::Timeout,
            message: message.into(),
            retryable: true,
            occurred_at: now_ms(),
        }
    }

    pub fn network(message: impl Into<String>) -> Self {
        Self {
            kind: ErrorKind::Network,
            message: message.into(),
            retryable: true,
            occurred_at: now_ms(),
        }
    }

    pub fn abort(message: impl Into<String>) -> Self {
        Self {
            kind: ErrorKind::Abort,
            message: message.into(),
            retryable: false,
            occurred_at: now_ms(),
        }
    }
}

/// One unit of work addressed to one agent.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Task {
    pub id: String,
    pub queue_id: String,
    pub agent_id: String,
    pub message: String,
    /// 1..=10, lower dispatches earlier.
    pub priority: u8,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub estimated_complexity: Option<Complexity>,
    pub retry_count: u32,
    pub max_retries: u32,
    pub status: TaskStatus,
    pub created_at: TimestampMs,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<TimestampMs>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<TimestampMs>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<TaskResult>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<TaskError>,
}

impl Task {
    pub fn new(
        queue_id: String,
        agent_id: String,
        message: String,
        priority: u8,
        max_retries: u32,
    ) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            queue_id,
            agent_id,
            message,
            priority: priority.clamp(1, 10),
            estimated_complexity: None,
            retry_count: 0,
            max_retries,
            status: TaskStatus::Pending,
            created_at: now_ms(),
            started_at: None,
            completed_at: None,
            result: None,
            error: None,
        }
    }

    pub fn with_complexity(mut self, complexity: Complexity) -> Self {
        self.estimated_complexity = Some(complexity);
        self
    }
}

/// A named unit of work: ordered tasks plus shared settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Queue {
    pub id: String,
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub status: QueueStatus,
    pub settings: QueueSettings,
    pub metrics: QueueMetrics,
    /// Insertion order is preserved; it breaks priority ties at dispatch.
    pub tasks: Vec<Task>,
    pub created_at: TimestampMs,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<TimestampMs>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<TimestampMs>,
}

impl Queue {
    pub fn new(name: String, description: Option<String>, settings: QueueSettings) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            name,
            description,
            status: QueueStatus::Idle,
            settings,
            metrics: QueueMetrics::default(),
            tasks: Vec::new(),
            created_at: now_ms(),
            started_at: None,
            completed_at: None,
        }
    }

    /// Recompute the metrics snapshot from ground-truth task statuses.
    pub fn recompute_metrics(&mut self) {
        self.metrics = QueueMetrics::compute(&self.tasks);
    }
}

/// Derived-but-persisted counters for a queue.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct QueueMetrics {
    pub total_tasks: usize,
    pub completed_tasks: usize,
    pub failed_tasks: usize,
    pub pending_tasks: usize,
    pub in_progress_tasks: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub average_task_duration: Option<f64>,
}

impl QueueMetrics {
    pub fn compute(tasks: &[Task]) -> Self {
        let mut metrics = QueueMetrics {
            total_tasks: tasks.len(),
            ..Default::default()
        };

        let mut durations = Vec::new();
        for task in tasks {
            match task.status {
                TaskStatus::Completed => {
                    metrics.completed_tasks += 1;
                    if let (Some(started), Some(completed)) = (task.started_at, task.completed_at) {
                        durations.push((completed - started) as f64);
                    }
                }
                TaskStatus::Failed => metrics.failed_tasks += 1,
                TaskStatus::Pending | TaskStatus::Queued | TaskStatus::Retrying => {
                    metrics.pending_tasks += 1
                }
                TaskStatus::InProgress => metrics.in_progress_tasks += 1,
                TaskStatus::Cancelled => {}
            }
        }

        if !durations.is_empty() {
            metrics.average_task_duration =
                Some(durations.iter().sum::<f64>() / durations.len() as f64);
        }

        metrics
    }
}

/// Lightweight queue listing entry.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct QueueSummary {
    pub id: String,
    pub name: String,
    pub status: QueueStatus,
    pub task_count: usize,
    pub completed_count: usize,
    pub created_at: TimestampMs,
}

/// Lifecycle events emitted by the scheduler and carried over SSE and
/// the store's pub/sub channels.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TaskQueueEvent {
    #[serde(rename_all = "camelCase")]
    QueueStarted { queue_id: String },
    #[serde(rename_all = "camelCase")]
    QueuePaused { queue_id: String },
    #[serde(rename_all = "camelCase")]
    QueueResumed { queue_id: String },
    #[serde(rename_all = "camelCase")]
    QueueCompleted {
        queue_id: String,
        metrics: QueueMetrics,
    },
    #[serde(rename_all = "camelCase")]
    QueueFailed { queue_id: String, error: String },
    #[serde(rename_all = "camelCase")]
    TaskStarted {
        queue_id: String,
        task_id: String,
        agent_id: String,
    },
    #[serde(rename_all = "camelCase")]
    TaskCompleted {
        queue_id: String,
        task_id: String,
        result: TaskResult,
    },
    #[serde(rename_all = "camelCase")]
    TaskFailed {
        queue_id: String,
        task_id: String,
        error: TaskError,
    },
    #[serde(rename_all = "camelCase")]
    TaskRetrying {
        queue_id: String,
        task_id: String,
        attempt: u32,
        max_retries: u32,
    },
    /// Reserved for streaming partial content; not emitted yet.
    #[serde(rename_all = "camelCase")]
    TaskProgress {
        queue_id: String,
        task_id: String,
        content: String,
    },
}

impl TaskQueueEvent {
    /// The wire tag, also used as the SSE `event:` name.
    pub fn kind(&self) -> &'static str {
        match self {
            TaskQueueEvent::QueueStarted { .. } => "queue_started",
            TaskQueueEvent::QueuePaused { .. } => "queue_paused",
            TaskQueueEvent::QueueResumed { .. } => "queue_resumed",
            TaskQueueEvent::QueueCompleted { .. } => "queue_completed",
            TaskQueueEvent::QueueFailed { .. } => "queue_failed",
            TaskQueueEvent::TaskStarted { .. } => "task_started",
            TaskQueueEvent::TaskCompleted { .. } => "task_completed",
            TaskQueueEvent::TaskFailed { .. } => "task_failed",
            TaskQueueEvent::TaskRetrying { .. } => "task_retrying",
            TaskQueueEvent::TaskProgress { .. } => "task_progress",
        }
    }

    pub fn queue_id(&self) -> &str {
        match self {
            TaskQueueEvent::QueueStarted { queue_id }
            | TaskQueueEvent::QueuePaused { queue_id }
            | TaskQueueEvent::QueueResumed { queue_id }
            | TaskQueueEvent::QueueCompleted { queue_id, .. }
            | TaskQueueEvent::QueueFailed { queue_id, .. }
            | TaskQueueEvent::TaskStarted { queue_id, .. }
            | TaskQueueEvent::TaskCompleted { queue_id, .. }
            | TaskQueueEvent::TaskFailed { queue_id, .. }
            | TaskQueueEvent::TaskRetrying { queue_id, .. }
            | TaskQueueEvent::TaskProgress { queue_id, .. } => queue_id,
        }
    }
}

/// Partial update applied to a stored task.
///
/// Only supplied fields are written; `TaskPatch::default()` is a storage
/// identity.
#[derive(Debug, Clone, Default)]
pub struct TaskPatch {
    pub status: Option<TaskStatus>,
    pub started_at: Option<Option<TimestampMs>>,
    pub completed_at: Option<Option<TimestampMs>>,
    pub result: Option<Option<TaskResult>>,
    pub error: Option<Option<TaskError>>,
    pub retry_count: Option<u32>,
}

impl TaskPatch {
    pub fn status(status: TaskStatus) -> Self {
        Self {
            status: Some(status),
            ..Default::default()
        }
    }

    pub fn is_empty(&self) -> bool {
        self.status.is_none()
            && self.started_at.is_none()
            && self.completed_at.is_none()
            && self.result.is_none()
            && self.error.is_none()
            && self.retry_count.is_none()
    }

    /// Apply the patch to an in-memory task, mirroring what the store
    /// writes.
    pub fn apply(&self, task: &mut Task) {
        if let Some(status) = self.status {
            task.status = status;
        }
        if let Some(started_at) = self.started_at {
            task.started_at = started_at;
        }
        if let Some(completed_at) = self.completed_at {
            task.completed_at = completed_at;
        }
        if let Some(ref result) = self.result {
            task.result = result.clone();
        }
        if let Some(ref error) = self.error {
            task.error = error.clone();
        }
        if let Some(retry_count) = self.retry_count {
            task.retry_count = retry_count;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn settings_defaults_fill_omitted_fields() {
        let settings: QueueSettings = serde_json::from_str(r#"{"maxConcurrency": 5}"#).unwrap();
        assert_eq!(settings.max_concurrency, 5);
        assert_eq!(settings.retry_count, DEFAULT_RETRY_COUNT);
        assert_eq!(settings.retry_delay, DEFAULT_RETRY_DELAY_MS);
        assert_eq!(settings.timeout_per_task, DEFAULT_TASK_TIMEOUT_MS);
    }

    #[test]
    fn settings_ignore_unknown_keys() {
        let settings: QueueSettings =
            serde_json::from_str(r#"{"retryCount": 1, "adminOverride": true}"#).unwrap();
        assert_eq!(settings.retry_count, 1);
    }

    #[test]
    fn task_priority_is_clamped() {
        let task = Task::new("q".into(), "a".into(), "m".into(), 0, 3);
        assert_eq!(task.priority, 1);
        let task = Task::new("q".into(), "a".into(), "m".into(), 200, 3);
        assert_eq!(task.priority, 10);
    }

    #[test]
    fn event_serializes_with_snake_case_tag() {
        let event = TaskQueueEvent::TaskRetrying {
            queue_id: "q1".into(),
            task_id: "t1".into(),
            attempt: 1,
            max_retries: 3,
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "task_retrying");
        assert_eq!(json["queueId"], "q1");
        assert_eq!(json["maxRetries"], 3);
        assert_eq!(event.kind(), "task_retrying");
    }

    #[test]
    fn task_status_round_trips_through_str() {
        for status in [
            TaskStatus::Pending,
            TaskStatus::Queued,
            TaskStatus::InProgress,
            TaskStatus::Retrying,
            TaskStatus::Completed,
            TaskStatus::Failed,
            TaskStatus::Cancelled,
        ] {
            assert_eq!(status.as_str().parse::<TaskStatus>().unwrap(), status);
        }
    }

    #[test]
    fn metrics_count_every_status_bucket() {
        let mut tasks = vec![
            Task::new("q".into(), "a".into(), "m".into(), 1, 3),
            Task::new("q".into(), "a".into(), "m".into(), 1, 3),
            Task::new("q".into(), "a".into(), "m".into(), 1, 3),
            Task::new("q".into(), "a".into(), "m".into(), 1, 3),
        ];
        tasks[0].status = TaskStatus::Completed;
        tasks[0].started_at = Some(1_000);
        tasks[0].completed_at = Some(3_000);
        tasks[1].status = TaskStatus::Failed;
        tasks[2].status = TaskStatus::InProgress;
        // tasks[3] stays pending

        let metrics = QueueMetrics::compute(&tasks);
        assert_eq!(metrics.total_tasks, 4);
        assert_eq!(metrics.completed_tasks, 1);
        assert_eq!(metrics.failed_tasks, 1);
        assert_eq!(metrics.in_progress_tasks, 1);
        assert_eq!(metrics.pending_tasks, 1);
        assert_eq!(metrics.average_task_duration, Some(2_000.0));
    }

    #[test]
    fn empty_patch_is_identity() {
        let mut task = Task::new("q".into(), "a".into(), "m".into(), 5, 3);
        let before = task.clone();
        TaskPatch::default().apply(&mut task);
        assert_eq!(task, before);
        assert!(TaskPatch::default().is_empty());
    }
}
