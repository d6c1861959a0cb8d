//! Startup recovery (C5).
//!
//! Runs once before the control API accepts traffic. Every queue whose
//! last persisted status was `running` or `paused` is re-normalized:
//! paused, in-flight tasks folded back to pending, pending list rebuilt
//! in insertion order, busy-agents set cleared. Execution resumes only on
//! an explicit user resume.

use crate::{store::QueueStore, Result};
use tracing::{info, warn};

pub async fn recover_interrupted_queues(store: &QueueStore) -> Result<usize> {
    let interrupted = store.load_interrupted_queues().await?;
    if interrupted.is_empty() {
        info!("Recovery: no interrupted queues");
        return Ok(0);
    }

    let mut recovered = 0;
    for queue in &interrupted {
        match store.reset_interrupted_queue(&queue.id).await {
            Ok(()) => {
                info!(
                    "Recovery: queue {} ({}) paused pending resume",
                    queue.id, queue.name
                );
                recovered += 1;
            }
            Err(e) => warn!("Recovery: failed to reset queue {}: {e}", queue.id),
        }
    }

    info!("Recovery: {recovered}/{} interrupted queues reset", interrupted.len());
    Ok(recovered)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Queue, QueueSettings, QueueStatus, Task, TaskStatus};

    #[tokio::test]
    async fn recovery_normalizes_running_queue() {
        let store = QueueStore::in_memory();

        let mut queue = Queue::new("interrupted".into(), None, QueueSettings::default());
        let mut t1 = Task::new(queue.id.clone(), "a1".into(), "first".into(), 1, 3);
        t1.status = TaskStatus::InProgress;
        t1.started_at = Some(1_000);
        let t2 = Task::new(queue.id.clone(), "a2".into(), "second".into(), 2, 3);
        let (t1_id, t2_id) = (t1.id.clone(), t2.id.clone());
        queue.tasks = vec![t1, t2];
        queue.status = QueueStatus::Running;
        queue.recompute_metrics();

        store.save_queue(&queue).await.unwrap();
        store.mark_agent_busy("a1").await.unwrap();

        let recovered = recover_interrupted_queues(&store).await.unwrap();
        assert_eq!(recovered, 1);

        let after = store.load_queue(&queue.id).await.unwrap().unwrap();
        assert_eq!(after.status, QueueStatus::Paused);
        assert_eq!(after.tasks[0].status, TaskStatus::Pending);
        assert!(after.tasks[0].started_at.is_none());
        assert_eq!(
            store.pending_list(&queue.id).await.unwrap(),
            vec![t1_id, t2_id]
        );
        assert!(store.get_busy_agents().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn recovery_leaves_settled_queues_alone() {
        let store = QueueStore::in_memory();

        let mut queue = Queue::new("done".into(), None, QueueSettings::default());
        queue.status = QueueStatus::Completed;
        store.save_queue(&queue).await.unwrap();

        assert_eq!(recover_interrupted_queues(&store).await.unwrap(), 0);
        let after = store.load_queue(&queue.id).await.unwrap().unwrap();
        assert_eq!(after.status, QueueStatus::Completed);
    }
}
