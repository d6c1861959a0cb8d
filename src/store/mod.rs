//! Durable queue store (C2).
//!
//! `QueueStore` is the process-wide persistence facade: queues, tasks,
//! pending lists, and the busy-agents set live behind it, and lifecycle
//! events fan out through its per-queue broadcast channels. Storage is
//! pluggable: Redis when `storeEndpoint` is configured and reachable, an
//! in-process fallback with identical semantics otherwise. A
//! connection-class failure at runtime degrades to the fallback once,
//! transparently retrying the failed operation.

mod backend;
mod codec;
mod memory;

pub use backend::{QueueBackend, RedisBackend};
pub use memory::MemoryBackend;

use crate::{
    config::StoreConfig,
    constants::{CHANNEL_QUEUE_EVENTS_PREFIX, EVENT_CHANNEL_CAPACITY},
    models::{
        Queue, QueueMetrics, QueueStatus, QueueSummary, Task, TaskPatch, TaskQueueEvent,
        TaskStatus, TimestampMs,
    },
    ConductorError, Result,
};
use dashmap::DashMap;
use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc, RwLock,
};
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

/// Retry one store operation against the in-memory fallback when the
/// durable backend reports a connection-class failure.
macro_rules! with_fallback {
    ($self:ident . $method:ident ( $($arg:expr),* )) => {{
        let backend = $self.backend();
        match backend.$method($($arg),*).await {
            Err(e) if e.is_store_connection() && $self.is_available() => {
                $self.degrade(&e);
                $self.backend().$method($($arg),*).await
            }
            other => other,
        }
    }};
}

pub struct QueueStore {
    backend: RwLock<Arc<dyn QueueBackend>>,
    /// True while the durable backend is in use.
    available: AtomicBool,
    channels: DashMap<String, broadcast::Sender<TaskQueueEvent>>,
}

impl QueueStore {
    /// Connect according to configuration. An empty endpoint selects the
    /// in-memory fallback; an unreachable endpoint does too unless
    /// `require_store` makes it fatal.
    pub async fn connect(config: &StoreConfig) -> Result<Arc<Self>> {
        if config.endpoint.trim().is_empty() {
            info!("No store endpoint configured; using in-memory queue store");
            return Ok(Self::in_memory());
        }

        match RedisBackend::connect(&config.endpoint).await {
            Ok(redis) => Ok(Arc::new(Self {
                backend: RwLock::new(Arc::new(redis)),
                available: AtomicBool::new(true),
                channels: DashMap::new(),
            })),
            Err(e) if config.require_store => Err(ConductorError::StoreUnavailable {
                message: format!("Required store at {} is unreachable: {e}", config.endpoint),
            }),
            Err(e) => {
                warn!(
                    "Store at {} unreachable ({e}); degrading to in-memory fallback",
                    config.endpoint
                );
                Ok(Self::in_memory())
            }
        }
    }

    /// A store backed purely by process memory.
    pub fn in_memory() -> Arc<Self> {
        Arc::new(Self {
            backend: RwLock::new(Arc::new(MemoryBackend::new())),
            available: AtomicBool::new(false),
            channels: DashMap::new(),
        })
    }

    /// Whether the durable backend is in use (false in fallback mode).
    pub fn is_available(&self) -> bool {
        self.available.load(Ordering::SeqCst)
    }

    /// Release the durable backend and finish the process lifecycle in
    /// fallback mode.
    pub fn disconnect(&self) {
        if self.is_available() {
            info!("Disconnecting queue store");
            self.swap_to_memory();
        }
    }

    fn backend(&self) -> Arc<dyn QueueBackend> {
        self.backend
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    fn swap_to_memory(&self) {
        let mut backend = self
            .backend
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        *backend = Arc::new(MemoryBackend::new());
        self.available.store(false, Ordering::SeqCst);
    }

    fn degrade(&self, cause: &ConductorError) {
        warn!("Queue store backend lost ({cause}); degrading to in-memory fallback");
        self.swap_to_memory();
    }

    // ------------------------------------------------------------------
    // Queue and task persistence
    // ------------------------------------------------------------------

    pub async fn save_queue(&self, queue: &Queue) -> Result<()> {
        with_fallback!(self.save_queue(queue))
    }

    pub async fn load_queue(&self, queue_id: &str) -> Result<Option<Queue>> {
        with_fallback!(self.load_queue(queue_id))
    }

    pub async fn delete_queue(&self, queue_id: &str) -> Result<()> {
        self.channels.remove(queue_id);
        with_fallback!(self.delete_queue(queue_id))
    }

    pub async fn list_queues(&self) -> Result<Vec<QueueSummary>> {
        with_fallback!(self.list_queues())
    }

    pub async fn update_queue_status(
        &self,
        queue_id: &str,
        status: QueueStatus,
        timestamp: Option<TimestampMs>,
    ) -> Result<()> {
        with_fallback!(self.update_queue_status(queue_id, status, timestamp))
    }

    pub async fn update_queue_metrics(
        &self,
        queue_id: &str,
        metrics: &QueueMetrics,
    ) -> Result<()> {
        with_fallback!(self.update_queue_metrics(queue_id, metrics))
    }

    pub async fn save_task(&self, task: &Task) -> Result<()> {
        with_fallback!(self.save_task(task))
    }

    pub async fn load_task(&self, task_id: &str) -> Result<Option<Task>> {
        with_fallback!(self.load_task(task_id))
    }

    pub async fn update_task(&self, task_id: &str, patch: &TaskPatch) -> Result<()> {
        with_fallback!(self.update_task(task_id, patch))
    }

    // ------------------------------------------------------------------
    // Pending list and busy agents
    // ------------------------------------------------------------------

    pub async fn pop_next_task(&self, queue_id: &str) -> Result<Option<String>> {
        with_fallback!(self.pop_next_task(queue_id))
    }

    pub async fn requeue_task(&self, queue_id: &str, task_id: &str) -> Result<()> {
        with_fallback!(self.requeue_task(queue_id, task_id))
    }

    pub async fn replace_pending(&self, queue_id: &str, task_ids: &[String]) -> Result<()> {
        with_fallback!(self.replace_pending(queue_id, task_ids))
    }

    pub async fn pending_list(&self, queue_id: &str) -> Result<Vec<String>> {
        with_fallback!(self.pending_list(queue_id))
    }

    pub async fn mark_agent_busy(&self, agent_id: &str) -> Result<()> {
        with_fallback!(self.mark_agent_busy(agent_id))
    }

    pub async fn mark_agent_available(&self, agent_id: &str) -> Result<()> {
        with_fallback!(self.mark_agent_available(agent_id))
    }

    pub async fn get_busy_agents(&self) -> Result<Vec<String>> {
        with_fallback!(self.get_busy_agents())
    }

    pub async fn clear_busy_agents(&self) -> Result<()> {
        with_fallback!(self.clear_busy_agents())
    }

    // ------------------------------------------------------------------
    // Events
    // ------------------------------------------------------------------

    /// Deliver one event to every current subscriber of the queue's
    /// channel. Best-effort, no replay buffer.
    pub async fn publish_event(&self, event: &TaskQueueEvent) -> Result<()> {
        let queue_id = event.queue_id().to_string();
        if let Some(sender) = self.channels.get(&queue_id) {
            // No receivers is not an error.
            let _ = sender.send(event.clone());
        }

        if self.is_available() {
            let payload = serde_json::to_string(event)?;
            let channel = format!("{CHANNEL_QUEUE_EVENTS_PREFIX}{queue_id}");
            if let Err(e) = self.backend().publish(&channel, &payload).await {
                if e.is_store_connection() {
                    self.degrade(&e);
                } else {
                    return Err(e);
                }
            }
        }
        Ok(())
    }

    /// Register a consumer of the queue's event channel. Dropping the
    /// receiver unsubscribes.
    pub fn subscribe_to_queue(&self, queue_id: &str) -> broadcast::Receiver<TaskQueueEvent> {
        self.channels
            .entry(queue_id.to_string())
            .or_insert_with(|| broadcast::channel(EVENT_CHANNEL_CAPACITY).0)
            .subscribe()
    }

    // ------------------------------------------------------------------
    // Recovery
    // ------------------------------------------------------------------

    /// Queues whose last persisted status was `running` or `paused`.
    pub async fn load_interrupted_queues(&self) -> Result<Vec<Queue>> {
        let summaries = self.list_queues().await?;
        let mut interrupted = Vec::new();
        for summary in summaries {
            if matches!(summary.status, QueueStatus::Running | QueueStatus::Paused) {
                if let Some(queue) = self.load_queue(&summary.id).await? {
                    interrupted.push(queue);
                }
            }
        }
        Ok(interrupted)
    }

    /// Re-normalize one interrupted queue: pause it, fold in-flight tasks
    /// back to pending, rebuild the pending list in insertion order, and
    /// clear the busy-agents set. Idempotent.
    pub async fn reset_interrupted_queue(&self, queue_id: &str) -> Result<()> {
        let queue = self
            .load_queue(queue_id)
            .await?
            .ok_or_else(|| ConductorError::NotFound(format!("Queue {queue_id}")))?;

        self.update_queue_status(queue_id, QueueStatus::Paused, None)
            .await?;

        for task in &queue.tasks {
            if matches!(task.status, TaskStatus::InProgress | TaskStatus::Retrying) {
                let patch = TaskPatch {
                    status: Some(TaskStatus::Pending),
                    started_at: Some(None),
                    ..Default::default()
                };
                self.update_task(&task.id, &patch).await?;
            }
        }

        let pending: Vec<String> = queue
            .tasks
            .iter()
            .filter(|t| !t.status.is_terminal())
            .map(|t| t.id.clone())
            .collect();
        self.replace_pending(queue_id, &pending).await?;
        self.clear_busy_agents().await?;

        debug!(
            "Reset interrupted queue {queue_id}: {} tasks back in pending",
            pending.len()
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::QueueSettings;

    fn build_queue(name: &str, task_count: usize) -> Queue {
        let mut queue = Queue::new(name.to_string(), None, QueueSettings::default());
        for i in 0..task_count {
            queue.tasks.push(Task::new(
                queue.id.clone(),
                format!("agent-{i}"),
                format!("task {i}"),
                1,
                3,
            ));
        }
        queue.recompute_metrics();
        queue
    }

    #[tokio::test]
    async fn save_then_load_reconstructs_the_queue() {
        let store = QueueStore::in_memory();
        let queue = build_queue("alpha", 3);

        store.save_queue(&queue).await.unwrap();
        let loaded = store.load_queue(&queue.id).await.unwrap().unwrap();
        assert_eq!(loaded, queue);

        // Insertion order of tasks is preserved.
        let ids: Vec<&str> = loaded.tasks.iter().map(|t| t.id.as_str()).collect();
        let expected: Vec<&str> = queue.tasks.iter().map(|t| t.id.as_str()).collect();
        assert_eq!(ids, expected);
    }

    #[tokio::test]
    async fn load_absent_queue_returns_none() {
        let store = QueueStore::in_memory();
        assert!(store.load_queue("nope").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn delete_cascades_to_tasks_and_pending() {
        let store = QueueStore::in_memory();
        let queue = build_queue("alpha", 2);
        let task_id = queue.tasks[0].id.clone();

        store.save_queue(&queue).await.unwrap();
        store.delete_queue(&queue.id).await.unwrap();

        assert!(store.load_queue(&queue.id).await.unwrap().is_none());
        assert!(store.load_task(&task_id).await.unwrap().is_none());
        assert!(store.pending_list(&queue.id).await.unwrap().is_empty());
        assert!(store.list_queues().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn list_queues_sorts_newest_first() {
        let store = QueueStore::in_memory();
        let mut old = build_queue("old", 1);
        old.created_at = 1_000;
        let mut new = build_queue("new", 1);
        new.created_at = 2_000;

        store.save_queue(&old).await.unwrap();
        store.save_queue(&new).await.unwrap();

        let names: Vec<String> = store
            .list_queues()
            .await
            .unwrap()
            .into_iter()
            .map(|s| s.name)
            .collect();
        assert_eq!(names, vec!["new", "old"]);
    }

    #[tokio::test]
    async fn concurrent_pops_never_hand_out_the_same_task() {
        let store = QueueStore::in_memory();
        let queue = build_queue("alpha", 10);
        store.save_queue(&queue).await.unwrap();

        let mut handles = Vec::new();
        for _ in 0..10 {
            let store = store.clone();
            let queue_id = queue.id.clone();
            handles.push(tokio::spawn(async move {
                store.pop_next_task(&queue_id).await.unwrap()
            }));
        }

        let mut popped = Vec::new();
        for handle in handles {
            if let Some(id) = handle.await.unwrap() {
                popped.push(id);
            }
        }

        popped.sort();
        popped.dedup();
        assert_eq!(popped.len(), 10);
        assert!(store.pop_next_task(&queue.id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn update_task_merges_without_clobbering() {
        let store = QueueStore::in_memory();
        let queue = build_queue("alpha", 1);
        let task = queue.tasks[0].clone();
        store.save_queue(&queue).await.unwrap();

        store
            .update_task(&task.id, &TaskPatch::status(TaskStatus::InProgress))
            .await
            .unwrap();
        store
            .update_task(
                &task.id,
                &TaskPatch {
                    retry_count: Some(2),
                    ..Default::default()
                },
            )
            .await
            .unwrap();

        let loaded = store.load_task(&task.id).await.unwrap().unwrap();
        assert_eq!(loaded.status, TaskStatus::InProgress);
        assert_eq!(loaded.retry_count, 2);
        assert_eq!(loaded.message, task.message);
    }

    #[tokio::test]
    async fn update_queue_status_stamps_lifecycle_timestamps() {
        let store = QueueStore::in_memory();
        let queue = build_queue("alpha", 1);
        store.save_queue(&queue).await.unwrap();

        store
            .update_queue_status(&queue.id, QueueStatus::Running, Some(5_000))
            .await
            .unwrap();
        let loaded = store.load_queue(&queue.id).await.unwrap().unwrap();
        assert_eq!(loaded.status, QueueStatus::Running);
        assert_eq!(loaded.started_at, Some(5_000));

        store
            .update_queue_status(&queue.id, QueueStatus::Completed, Some(9_000))
            .await
            .unwrap();
        let loaded = store.load_queue(&queue.id).await.unwrap().unwrap();
        assert_eq!(loaded.status, QueueStatus::Completed);
        assert_eq!(loaded.completed_at, Some(9_000));
    }

    #[tokio::test]
    async fn busy_agent_set_tracks_membership() {
        let store = QueueStore::in_memory();
        store.mark_agent_busy("a2").await.unwrap();
        store.mark_agent_busy("a1").await.unwrap();
        store.mark_agent_busy("a1").await.unwrap();

        assert_eq!(store.get_busy_agents().await.unwrap(), vec!["a1", "a2"]);

        store.mark_agent_available("a1").await.unwrap();
        assert_eq!(store.get_busy_agents().await.unwrap(), vec!["a2"]);

        store.clear_busy_agents().await.unwrap();
        assert!(store.get_busy_agents().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn publish_reaches_subscriber() {
        let store = QueueStore::in_memory();
        let mut rx = store.subscribe_to_queue("q-1");

        let event = TaskQueueEvent::QueueStarted {
            queue_id: "q-1".into(),
        };
        store.publish_event(&event).await.unwrap();

        assert_eq!(rx.recv().await.unwrap(), event);
    }

    #[tokio::test]
    async fn reset_interrupted_queue_is_idempotent() {
        let store = QueueStore::in_memory();
        let mut queue = build_queue("alpha", 3);
        queue.status = QueueStatus::Running;
        queue.tasks[0].status = TaskStatus::InProgress;
        queue.tasks[0].started_at = Some(1_000);
        queue.tasks[1].status = TaskStatus::Completed;
        store.save_queue(&queue).await.unwrap();
        store.mark_agent_busy("agent-0").await.unwrap();

        store.reset_interrupted_queue(&queue.id).await.unwrap();
        let after_first = store.load_queue(&queue.id).await.unwrap().unwrap();
        let pending_first = store.pending_list(&queue.id).await.unwrap();

        store.reset_interrupted_queue(&queue.id).await.unwrap();
        let after_second = store.load_queue(&queue.id).await.unwrap().unwrap();
        let pending_second = store.pending_list(&queue.id).await.unwrap();

        assert_eq!(after_first, after_second);
        assert_eq!(pending_first, pending_second);

        assert_eq!(after_first.status, QueueStatus::Paused);
        assert_eq!(after_first.tasks[0].status, TaskStatus::Pending);
        assert!(after_first.tasks[0].started_at.is_none());
        // Insertion order preserved; the completed task stays out.
        assert_eq!(
            pending_first,
            vec![queue.tasks[0].id.clone(), queue.tasks[2].id.clone()]
        );
        assert!(store.get_busy_agents().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn interrupted_queues_are_running_or_paused_only() {
        let store = QueueStore::in_memory();

        let mut running = build_queue("running", 1);
        running.status = QueueStatus::Running;
        let mut paused = build_queue("paused", 1);
        paused.status = QueueStatus::Paused;
        let idle = build_queue("idle", 1);
        let mut done = build_queue("done", 1);
        done.status = QueueStatus::Completed;

        for queue in [&running, &paused, &idle, &done] {
            store.save_queue(queue).await.unwrap();
        }

        let mut names: Vec<String> = store
            .load_interrupted_queues()
            .await
            .unwrap()
            .into_iter()
            .map(|q| q.name)
            .collect();
        names.sort();
        assert_eq!(names, vec!["paused", "running"]);
    }
}
