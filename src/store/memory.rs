//! In-process fallback backend.
//!
//! Holds the same flat string records the Redis backend writes, behind one
//! mutex, so the serialization contract and pop atomicity are identical;
//! only durability across restarts is lost.

use crate::{
    models::{Queue, QueueMetrics, QueueStatus, QueueSummary, Task, TaskPatch, TimestampMs},
    store::{backend::QueueBackend, codec},
    Result,
};
use async_trait::async_trait;
use std::collections::{HashMap, HashSet, VecDeque};
use tokio::sync::Mutex;

#[derive(Default)]
struct MemoryState {
    queues: HashMap<String, codec::Record>,
    queue_tasks: HashMap<String, Vec<String>>,
    tasks: HashMap<String, codec::Record>,
    pending: HashMap<String, VecDeque<String>>,
    busy_agents: HashSet<String>,
    index: HashSet<String>,
}

#[derive(Default)]
pub struct MemoryBackend {
    state: Mutex<MemoryState>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl QueueBackend for MemoryBackend {
    async fn save_queue(&self, queue: &Queue) -> Result<()> {
        let queue_record: codec::Record = codec::queue_to_record(queue)?.into_iter().collect();
        let mut task_records = Vec::with_capacity(queue.tasks.len());
        for task in &queue.tasks {
            let record: codec::Record = codec::task_to_record(task)?.into_iter().collect();
            task_records.push((task.id.clone(), record));
        }

        let mut state = self.state.lock().await;
        state
            .queue_tasks
            .insert(queue.id.clone(), queue.tasks.iter().map(|t| t.id.clone()).collect());
        state.pending.insert(
            queue.id.clone(),
            queue
                .tasks
                .iter()
                .filter(|t| t.status.is_dispatchable())
                .map(|t| t.id.clone())
                .collect(),
        );
        for (task_id, record) in task_records {
            state.tasks.insert(task_id, record);
        }
        state.queues.insert(queue.id.clone(), queue_record);
        state.index.insert(queue.id.clone());
        Ok(())
    }

    async fn load_queue(&self, queue_id: &str) -> Result<Option<Queue>> {
        let state = self.state.lock().await;
        let Some(record) = state.queues.get(queue_id) else {
            return Ok(None);
        };

        let task_ids = state.queue_tasks.get(queue_id).cloned().unwrap_or_default();
        let mut tasks = Vec::with_capacity(task_ids.len());
        for task_id in &task_ids {
            if let Some(task_record) = state.tasks.get(task_id) {
                tasks.push(codec::task_from_record(task_record)?);
            }
        }

        Ok(Some(codec::queue_from_record(record, tasks)?))
    }

    async fn delete_queue(&self, queue_id: &str) -> Result<()> {
        let mut state = self.state.lock().await;
        if let Some(task_ids) = state.queue_tasks.remove(queue_id) {
            for task_id in task_ids {
                state.tasks.remove(&task_id);
            }
        }
        state.queues.remove(queue_id);
        state.pending.remove(queue_id);
        state.index.remove(queue_id);
        Ok(())
    }

    async fn list_queues(&self) -> Result<Vec<QueueSummary>> {
        let state = self.state.lock().await;
        let mut summaries = Vec::with_capacity(state.index.len());
        for queue_id in &state.index {
            if let Some(record) = state.queues.get(queue_id) {
                let task_count = state
                    .queue_tasks
                    .get(queue_id)
                    .map(Vec::len)
                    .unwrap_or_default();
                summaries.push(codec::summary_from_record(record, task_count)?);
            }
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
        let mut state = self.state.lock().await;
        if let Some(record) = state.queues.get_mut(queue_id) {
            record.insert("status".to_string(), status.as_str().to_string());
            if let Some(ts) = timestamp {
                match status {
                    QueueStatus::Running => {
                        record.insert("startedAt".to_string(), ts.to_string());
                    }
                    QueueStatus::Completed | QueueStatus::Failed => {
                        record.insert("completedAt".to_string(), ts.to_string());
                    }
                    _ => {}
                }
            }
        }
        Ok(())
    }

    async fn update_queue_metrics(&self, queue_id: &str, metrics: &QueueMetrics) -> Result<()> {
        let encoded = serde_json::to_string(metrics)?;
        let mut state = self.state.lock().await;
        if let Some(record) = state.queues.get_mut(queue_id) {
            record.insert("metrics".to_string(), encoded);
        }
        Ok(())
    }

    async fn save_task(&self, task: &Task) -> Result<()> {
        let record: codec::Record = codec::task_to_record(task)?.into_iter().collect();
        let mut state = self.state.lock().await;
        state.tasks.insert(task.id.clone(), record);
        Ok(())
    }

    async fn load_task(&self, task_id: &str) -> Result<Option<Task>> {
        let state = self.state.lock().await;
        match state.tasks.get(task_id) {
            Some(record) => Ok(Some(codec::task_from_record(record)?)),
            None => Ok(None),
        }
    }

    async fn update_task(&self, task_id: &str, patch: &TaskPatch) -> Result<()> {
        let fields = codec::patch_to_fields(patch)?;
        if fields.is_empty() {
            return Ok(());
        }
        let mut state = self.state.lock().await;
        if let Some(record) = state.tasks.get_mut(task_id) {
            for (name, value) in fields {
                record.insert(name, value);
            }
        }
        Ok(())
    }

    async fn pop_next_task(&self, queue_id: &str) -> Result<Option<String>> {
        let mut state = self.state.lock().await;
        Ok(state
            .pending
            .get_mut(queue_id)
            .and_then(VecDeque::pop_front))
    }

    async fn requeue_task(&self, queue_id: &str, task_id: &str) -> Result<()> {
        let mut state = self.state.lock().await;
        state
            .pending
            .entry(queue_id.to_string())
            .or_default()
            .push_back(task_id.to_string());
        Ok(())
    }

    async fn replace_pending(&self, queue_id: &str, task_ids: &[String]) -> Result<()> {
        let mut state = self.state.lock().await;
        state
            .pending
            .insert(queue_id.to_string(), task_ids.iter().cloned().collect());
        Ok(())
    }

    async fn pending_list(&self, queue_id: &str) -> Result<Vec<String>> {
        let state = self.state.lock().await;
        Ok(state
            .pending
            .get(queue_id)
            .map(|pending| pending.iter().cloned().collect())
            .unwrap_or_default())
    }

    async fn mark_agent_busy(&self, agent_id: &str) -> Result<()> {
        let mut state = self.state.lock().await;
        state.busy_agents.insert(agent_id.to_string());
        Ok(())
    }

    async fn mark_agent_available(&self, agent_id: &str) -> Result<()> {
        let mut state = self.state.lock().await;
        state.busy_agents.remove(agent_id);
        Ok(())
    }

    async fn get_busy_agents(&self) -> Result<Vec<String>> {
        let state = self.state.lock().await;
        let mut agents: Vec<String> = state.busy_agents.iter().cloned().collect();
        agents.sort();
        Ok(agents)
    }

    async fn clear_busy_agents(&self) -> Result<()> {
        let mut state = self.state.lock().await;
        state.busy_agents.clear();
        Ok(())
    }

    async fn publish(&self, _channel: &str, _payload: &str) -> Result<()> {
        // In-process subscribers are served by the store's broadcast hub.
        Ok(())
    }

    fn name(&self) -> &'static str {
        "memory"
    }
}
