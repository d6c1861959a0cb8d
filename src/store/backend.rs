//! Storage backends for the queue store.
//!
//! `QueueBackend` is the pluggable persistence seam: `RedisBackend` is the
//! durable implementation, `MemoryBackend` (see `memory.rs`) the in-process
//! fallback with identical semantics minus durability.

use crate::{
    constants::{
        KEY_BUSY_AGENTS, KEY_QUEUE_INDEX, KEY_QUEUE_PENDING_PREFIX, KEY_QUEUE_PREFIX,
        KEY_QUEUE_TASKS_PREFIX, KEY_TASK_PREFIX,
    },
    models::{Queue, QueueMetrics, QueueStatus, QueueSummary, Task, TaskPatch, TimestampMs},
    store::codec,
    Result,
};
use async_trait::async_trait;
use redis::{aio::ConnectionManager, AsyncCommands};
use tracing::{debug, info};

pub fn queue_key(queue_id: &str) -> String {
    format!("{KEY_QUEUE_PREFIX}{queue_id}")
}

pub fn queue_tasks_key(queue_id: &str) -> String {
    format!("{KEY_QUEUE_TASKS_PREFIX}{queue_id}")
}

pub fn queue_pending_key(queue_id: &str) -> String {
    format!("{KEY_QUEUE_PENDING_PREFIX}{queue_id}")
}

pub fn task_key(task_id: &str) -> String {
    format!("{KEY_TASK_PREFIX}{task_id}")
}

/// Persistence operations of the queue store.
///
/// Implementations must make `pop_next_task` atomic with respect to
/// concurrent poppers, and `update_task` must merge only the supplied
/// fields.
#[async_trait]
pub trait QueueBackend: Send + Sync {
    async fn save_queue(&self, queue: &Queue) -> Result<()>;
    async fn load_queue(&self, queue_id: &str) -> Result<Option<Queue>>;
    async fn delete_queue(&self, queue_id: &str) -> Result<()>;
    async fn list_queues(&self) -> Result<Vec<QueueSummary>>;
    async fn update_queue_status(
        &self,
        queue_id: &str,
        status: QueueStatus,
        timestamp: Option<TimestampMs>,
    ) -> Result<()>;
    async fn update_queue_metrics(&self, queue_id: &str, metrics: &QueueMetrics) -> Result<()>;

    async fn save_task(&self, task: &Task) -> Result<()>;
    async fn load_task(&self, task_id: &str) -> Result<Option<Task>>;
    async fn update_task(&self, task_id: &str, patch: &TaskPatch) -> Result<()>;

    async fn pop_next_task(&self, queue_id: &str) -> Result<Option<String>>;
    async fn requeue_task(&self, queue_id: &str, task_id: &str) -> Result<()>;
    async fn replace_pending(&self, queue_id: &str, task_ids: &[String]) -> Result<()>;
    async fn pending_list(&self, queue_id: &str) -> Result<Vec<String>>;

    async fn mark_agent_busy(&self, agent_id: &str) -> Result<()>;
    async fn mark_agent_available(&self, agent_id: &str) -> Result<()>;
    async fn get_busy_agents(&self) -> Result<Vec<String>>;
    async fn clear_busy_agents(&self) -> Result<()>;

    /// Deliver a payload on a named channel for observers outside this
    /// process. Best-effort; in-process subscribers are served by the
    /// store's broadcast hub, not by this call.
    async fn publish(&self, channel: &str, payload: &str) -> Result<()>;

    fn name(&self) -> &'static str;
}

/// Redis-backed persistence.
pub struct RedisBackend {
    conn: ConnectionManager,
}

impl RedisBackend {
    /// Open a connection manager against `url` and verify it with a PING.
    pub async fn connect(url: &str) -> Result<Self> {
        let client = redis::Client::open(url)?;
        let mut conn = client.get_connection_manager().await?;

        let _: String = redis::cmd("PING").query_async(&mut conn).await?;
        info!("Queue store connected to Redis at {url}");

        Ok(Self { conn })
    }

    fn conn(&self) -> ConnectionManager {
        self.conn.clone()
    }
}

#[async_trait]
impl QueueBackend for RedisBackend {
    async fn save_queue(&self, queue: &Queue) -> Result<()> {
        let mut conn = self.conn();

        let queue_fields = codec::queue_to_record(queue)?;
        let task_ids: Vec<String> = queue.tasks.iter().map(|t| t.id.clone()).collect();
        let pending_ids: Vec<String> = queue
            .tasks
            .iter()
            .filter(|t| t.status.is_dispatchable())
            .map(|t| t.id.clone())
            .collect();

        let mut pipe = redis::pipe();
        pipe.atomic();
        pipe.del(queue_tasks_key(&queue.id)).ignore();
        pipe.del(queue_pending_key(&queue.id)).ignore();
        pipe.hset_multiple(queue_key(&queue.id), &queue_fields).ignore();
        if !task_ids.is_empty() {
            pipe.rpush(queue_tasks_key(&queue.id), &task_ids).ignore();
        }
        if !pending_ids.is_empty() {
            pipe.rpush(queue_pending_key(&queue.id), &pending_ids).ignore();
        }
        for task in &queue.tasks {
            let task_fields = codec::task_to_record(task)?;
            pipe.hset_multiple(task_key(&task.id), &task_fields).ignore();
        }
        pipe.sadd(KEY_QUEUE_INDEX, &queue.id).ignore();

        pipe.query_async::<_, ()>(&mut conn).await?;
        debug!("Saved queue {} ({} tasks)", queue.id, queue.tasks.len());
        Ok(())
    }

    async fn load_queue(&self, queue_id: &str) -> Result<Option<Queue>> {
        let mut conn = self.conn();

        let record: codec::Record = conn.hgetall(queue_key(queue_id)).await?;
        if record.is_empty() {
            return Ok(None);
        }

        let task_ids: Vec<String> = conn.lrange(queue_tasks_key(queue_id), 0, -1).await?;
        let mut tasks = Vec::with_capacity(task_ids.len());
        for task_id in &task_ids {
            let task_record: codec::Record = conn.hgetall(task_key(task_id)).await?;
            if !task_record.is_empty() {
                tasks.push(codec::task_from_record(&task_record)?);
            }
        }

        Ok(Some(codec::queue_from_record(&record, tasks)?))
    }

    async fn delete_queue(&self, queue_id: &str) -> Result<()> {
        let mut conn = self.conn();

        let task_ids: Vec<String> = conn.lrange(queue_tasks_key(queue_id), 0, -1).await?;

        let mut pipe = redis::pipe();
        pipe.atomic();
        for task_id in &task_ids {
            pipe.del(task_key(task_id)).ignore();
        }
        pipe.del(queue_key(queue_id)).ignore();
        pipe.del(queue_tasks_key(queue_id)).ignore();
        pipe.del(queue_pending_key(queue_id)).ignore();
        pipe.srem(KEY_QUEUE_INDEX, queue_id).ignore();

        pipe.query_async::<_, ()>(&mut conn).await?;
        debug!("Deleted queue {queue_id} and {} tasks", task_ids.len());
        Ok(())
    }

    async fn list_queues(&self) -> Result<Vec<QueueSummary>> {
        let mut conn = self.conn();

        let queue_ids: Vec<String> = conn.smembers(KEY_QUEUE_INDEX).await?;
        let mut summaries = Vec::with_capacity(queue_ids.len());
        for queue_id in &queue_ids {
            let record: codec::Record = conn.hgetall(queue_key(queue_id)).await?;
            if record.is_empty() {
                continue;
            }
            let task_count: usize = conn.llen(queue_tasks_key(queue_id)).await?;
            summaries.push(codec::summary_from_record(&record, task_count)?);
        }

        summaries.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(summaries)
    }

    async fn update_queue_status(
        &self,
        queue_id: &str,
        status: QueueStatus,
        timestamp: Option<TimestampMs>,
    ) -> Result<()> {
        let mut fields = vec![("status".to_string(), status.as_str().to_string())];
        if let Some(ts) = timestamp {
            match status {
                QueueStatus::Running => fields.push(("startedAt".to_string(), ts.to_string())),
                QueueStatus::Completed | QueueStatus::Failed => {
                    fields.push(("completedAt".to_string(), ts.to_string()))
                }
                _ => {}
            }
        }

        let mut conn = self.conn();
        conn.hset_multiple::<_, _, _, ()>(queue_key(queue_id), &fields)
            .await?;
        Ok(())
    }

    async fn update_queue_metrics(&self, queue_id: &str, metrics: &QueueMetrics) -> Result<()> {
        let mut conn = self.conn();
        conn.hset::<_, _, _, ()>(
            queue_key(queue_id),
            "metrics",
            serde_json::to_string(metrics)?,
        )
        .await?;
        Ok(())
    }

    async fn save_task(&self, task: &Task) -> Result<()> {
        let mut conn = self.conn();
        let fields = codec::task_to_record(task)?;
        conn.hset_multiple::<_, _, _, ()>(task_key(&task.id), &fields)
            .await?;
        Ok(())
    }

    async fn load_task(&self, task_id: &str) -> Result<Option<Task>> {
        let mut conn = self.conn();
        let record: codec::Record = conn.hgetall(task_key(task_id)).await?;
        if record.is_empty() {
            return Ok(None);
        }
        Ok(Some(codec::task_from_record(&record)?))
    }

    async fn update_task(&self, task_id: &str, patch: &TaskPatch) -> Result<()> {
        let fields = codec::patch_to_fields(patch)?;
        if fields.is_empty() {
            return Ok(());
        }
        let mut conn = self.conn();
        conn.hset_multiple::<_, _, _, ()>(task_key(task_id), &fields)
            .await?;
        Ok(())
    }

    async fn pop_next_task(&self, queue_id: &str) -> Result<Option<String>> {
        let mut conn = self.conn();
        // LPOP is atomic server-side; concurrent poppers never see the
        // same id.
        let popped: Option<String> = conn.lpop(queue_pending_key(queue_id), None).await?;
        Ok(popped)
    }

    async fn requeue_task(&self, queue_id: &str, task_id: &str) -> Result<()> {
        let mut conn = self.conn();
        conn.rpush::<_, _, ()>(queue_pending_key(queue_id), task_id)
            .await?;
        Ok(())
    }

    async fn replace_pending(&self, queue_id: &str, task_ids: &[String]) -> Result<()> {
        let mut conn = self.conn();
        let mut pipe = redis::pipe();
        pipe.atomic();
        pipe.del(queue_pending_key(queue_id)).ignore();
        if !task_ids.is_empty() {
            pipe.rpush(queue_pending_key(queue_id), task_ids).ignore();
        }
        pipe.query_async::<_, ()>(&mut conn).await?;
        Ok(())
    }

    async fn pending_list(&self, queue_id: &str) -> Result<Vec<String>> {
        let mut conn = self.conn();
        Ok(conn.lrange(queue_pending_key(queue_id), 0, -1).await?)
    }

    async fn mark_agent_busy(&self, agent_id: &str) -> Result<()> {
        let mut conn = self.conn();
        conn.sadd::<_, _, ()>(KEY_BUSY_AGENTS, agent_id).await?;
        Ok(())
    }

    async fn mark_agent_available(&self, agent_id: &str) -> Result<()> {
        let mut conn = self.conn();
        conn.srem::<_, _, ()>(KEY_BUSY_AGENTS, agent_id).await?;
        Ok(())
    }

    async fn get_busy_agents(&self) -> Result<Vec<String>> {
        let mut conn = self.conn();
        let mut agents: Vec<String> = conn.smembers(KEY_BUSY_AGENTS).await?;
        agents.sort();
        Ok(agents)
    }

    async fn clear_busy_agents(&self) -> Result<()> {
        let mut conn = self.conn();
        conn.del::<_, ()>(KEY_BUSY_AGENTS).await?;
        Ok(())
    }

    async fn publish(&self, channel: &str, payload: &str) -> Result<()> {
        let mut conn = self.conn();
        conn.publish::<_, _, ()>(channel, payload).await?;
        Ok(())
    }

    fn name(&self) -> &'static str {
        "redis"
    }
}
