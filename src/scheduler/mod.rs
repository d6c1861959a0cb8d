//! Per-queue scheduler (C3).
//!
//! One `QueueScheduler` drives one queue: it selects dispatchable tasks by
//! priority under the queue's concurrency cap, spawns invocations through
//! the agent invoker, applies the retry policy, keeps the store current,
//! and emits the lifecycle event sequence consumed by the SSE stream.
//!
//! The loop is a single cooperative task. Spawned dispatches communicate
//! back through two guarded maps: the running map (loop inserts on
//! dispatch, background task clears on finish) and the completion map
//! (background writes, loop drains). All other per-queue state is touched
//! only by the loop.

pub mod control;
pub mod recovery;

pub use control::{SchedulerControl, SchedulerRegistry};

#[cfg(test)]
mod tests;

use crate::{
    agents::AgentRegistry,
    constants::{
        DISPATCH_POLL_INTERVAL_MS, RETRY_BACKOFF_CAP_MS, SCHEDULER_EVENT_BUFFER,
        SCHEDULER_TICK_INTERVAL_MS,
    },
    invoker::{AgentInvoker, InvocationOutcome},
    models::{
        now_ms, Queue, QueueMetrics, QueueStatus, Task, TaskError, TaskPatch, TaskQueueEvent,
        TaskStatus,
    },
    store::QueueStore,
    Result,
};
use std::{collections::HashMap, sync::Arc, time::Duration};
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Message a background dispatch or retry timer hands back to the loop.
enum Completion {
    Finished(InvocationOutcome),
    RetryDelayElapsed,
}

pub struct QueueScheduler {
    queue_id: String,
    settings: crate::models::QueueSettings,
    /// Loop-local task state; the authoritative copy lives in the store.
    tasks: HashMap<String, Task>,
    /// Task ids in insertion order; breaks priority ties.
    order: Vec<String>,
    store: Arc<QueueStore>,
    agents: Arc<AgentRegistry>,
    invoker: Arc<AgentInvoker>,
    control: Arc<SchedulerControl>,
    running: Arc<Mutex<HashMap<String, CancellationToken>>>,
    completions: Arc<Mutex<HashMap<String, Completion>>>,
    queue_started_at: Option<i64>,
}

impl QueueScheduler {
    pub fn new(
        queue: Queue,
        store: Arc<QueueStore>,
        agents: Arc<AgentRegistry>,
        invoker: Arc<AgentInvoker>,
        control: Arc<SchedulerControl>,
    ) -> Self {
        let order: Vec<String> = queue.tasks.iter().map(|t| t.id.clone()).collect();
        let tasks: HashMap<String, Task> =
            queue.tasks.into_iter().map(|t| (t.id.clone(), t)).collect();

        Self {
            queue_id: queue.id,
            settings: queue.settings,
            tasks,
            order,
            store,
            agents,
            invoker,
            control,
            running: Arc::new(Mutex::new(HashMap::new())),
            completions: Arc::new(Mutex::new(HashMap::new())),
            queue_started_at: queue.started_at,
        }
    }

    /// Run the scheduler on a background task; the receiver yields the
    /// queue's event sequence and closes when the loop ends.
    pub fn spawn(self) -> mpsc::Receiver<TaskQueueEvent> {
        let (tx, rx) = mpsc::channel(SCHEDULER_EVENT_BUFFER);
        tokio::spawn(async move { self.run(tx).await });
        rx
    }

    async fn run(mut self, events: mpsc::Sender<TaskQueueEvent>) {
        if let Err(e) = self.execute(&events).await {
            // Housekeeping failure (store write, not a task outcome):
            // terminate the queue with the cause.
            error!("Scheduler for queue {} failed: {e}", self.queue_id);
            let _ = self
                .store
                .update_queue_status(&self.queue_id, QueueStatus::Failed, Some(now_ms()))
                .await;
            emit(
                &events,
                TaskQueueEvent::QueueFailed {
                    queue_id: self.queue_id.clone(),
                    error: e.to_string(),
                },
            )
            .await;
        }
    }

    async fn execute(&mut self, events: &mpsc::Sender<TaskQueueEvent>) -> Result<()> {
        let started_ts = if self.queue_started_at.is_none() {
            Some(now_ms())
        } else {
            None
        };
        self.store
            .update_queue_status(&self.queue_id, QueueStatus::Running, started_ts)
            .await?;
        emit(
            events,
            TaskQueueEvent::QueueStarted {
                queue_id: self.queue_id.clone(),
            },
        )
        .await;
        info!(
            "Queue {} started ({} tasks, concurrency {})",
            self.queue_id,
            self.order.len(),
            self.settings.max_concurrency
        );

        loop {
            if self.control.is_stopped() {
                break;
            }

            if self.control.is_paused() {
                self.pause_gate(events).await?;
                continue;
            }

            self.drain_completions(events).await?;

            if !self.has_live_work() {
                break;
            }

            let running_count = self.running.lock().await.len();
            let slots = self.settings.max_concurrency.saturating_sub(running_count);
            if slots > 0 {
                self.dispatch_ready(slots, events).await?;
            }

            tokio::time::sleep(Duration::from_millis(DISPATCH_POLL_INTERVAL_MS)).await;
        }

        self.finish(events).await
    }

    /// Step 1 of the loop: while paused, no new dispatches begin but
    /// running tasks continue to completion and their results are drained.
    async fn pause_gate(&mut self, events: &mpsc::Sender<TaskQueueEvent>) -> Result<()> {
        emit(
            events,
            TaskQueueEvent::QueuePaused {
                queue_id: self.queue_id.clone(),
            },
        )
        .await;
        info!("Queue {} paused", self.queue_id);

        while self.control.is_paused() && !self.control.is_stopped() {
            tokio::time::sleep(Duration::from_millis(SCHEDULER_TICK_INTERVAL_MS)).await;
            self.drain_completions(events).await?;
        }

        if !self.control.is_stopped() {
            emit(
                events,
                TaskQueueEvent::QueueResumed {
                    queue_id: self.queue_id.clone(),
                },
            )
            .await;
            info!("Queue {} resumed", self.queue_id);
        }
        Ok(())
    }

    fn has_live_work(&self) -> bool {
        self.tasks.values().any(|t| {
            matches!(
                t.status,
                TaskStatus::Pending
                    | TaskStatus::Queued
                    | TaskStatus::InProgress
                    | TaskStatus::Retrying
            )
        })
    }

    /// Step 2: select dispatchable tasks by priority (stable; insertion
    /// order breaks ties), mirror the order into the durable pending
    /// list, and claim up to `slots` of them with atomic pops.
    async fn dispatch_ready(
        &mut self,
        slots: usize,
        events: &mpsc::Sender<TaskQueueEvent>,
    ) -> Result<()> {
        let mut ready: Vec<String> = self
            .order
            .iter()
            .filter(|id| {
                self.tasks
                    .get(*id)
                    .map(|t| t.status.is_dispatchable())
                    .unwrap_or(false)
            })
            .cloned()
            .collect();
        if ready.is_empty() {
            return Ok(());
        }
        ready.sort_by_key(|id| self.tasks[id].priority);

        self.store.replace_pending(&self.queue_id, &ready).await?;

        for _ in 0..slots.min(ready.len()) {
            match self.store.pop_next_task(&self.queue_id).await? {
                Some(task_id) => self.dispatch(&task_id, events).await?,
                None => break,
            }
        }
        Ok(())
    }

    /// Step 3: start one invocation in the background.
    async fn dispatch(
        &mut self,
        task_id: &str,
        events: &mpsc::Sender<TaskQueueEvent>,
    ) -> Result<()> {
        let Some(task) = self.tasks.get(task_id).cloned() else {
            warn!("Pending list referenced unknown task {task_id}");
            return Ok(());
        };

        let Some(agent) = self.agents.get(&task.agent_id) else {
            let error = TaskError::execution(format!("Agent not found: {}", task.agent_id), false);
            self.mark_task_failed(task_id, error, events).await?;
            return Ok(());
        };

        let started = now_ms();
        let mut snapshot = task.clone();
        snapshot.status = TaskStatus::InProgress;
        snapshot.started_at = Some(started);
        if let Some(task) = self.tasks.get_mut(task_id) {
            task.status = TaskStatus::InProgress;
            task.started_at = Some(started);
        }
        self.store
            .update_task(
                task_id,
                &TaskPatch {
                    status: Some(TaskStatus::InProgress),
                    started_at: Some(Some(started)),
                    ..Default::default()
                },
            )
            .await?;
        self.store.mark_agent_busy(&task.agent_id).await?;
        emit(
            events,
            TaskQueueEvent::TaskStarted {
                queue_id: self.queue_id.clone(),
                task_id: task_id.to_string(),
                agent_id: task.agent_id.clone(),
            },
        )
        .await;

        let token = self.control.stop_token().child_token();
        self.running
            .lock()
            .await
            .insert(task_id.to_string(), token.clone());

        let invoker = self.invoker.clone();
        let running = self.running.clone();
        let completions = self.completions.clone();
        let timeout = Duration::from_millis(self.settings.timeout_per_task);
        let id = task_id.to_string();
        tokio::spawn(async move {
            let outcome = invoker.invoke(&agent, &snapshot, token, timeout).await;
            // Completion lands before the running entry clears, so a loop
            // that observes an empty running map has every outcome.
            completions
                .lock()
                .await
                .insert(id.clone(), Completion::Finished(outcome));
            running.lock().await.remove(&id);
        });

        Ok(())
    }

    /// Step 4: fold finished invocations and elapsed retry delays back
    /// into task state.
    async fn drain_completions(&mut self, events: &mpsc::Sender<TaskQueueEvent>) -> Result<()> {
        let drained: Vec<(String, Completion)> = {
            let mut completions = self.completions.lock().await;
            completions.drain().collect()
        };

        for (task_id, completion) in drained {
            match completion {
                Completion::Finished(outcome) => {
                    self.handle_finished(&task_id, outcome, events).await?
                }
                Completion::RetryDelayElapsed => self.handle_retry_ready(&task_id).await?,
            }
        }
        Ok(())
    }

    async fn handle_finished(
        &mut self,
        task_id: &str,
        outcome: InvocationOutcome,
        events: &mpsc::Sender<TaskQueueEvent>,
    ) -> Result<()> {
        let Some(task) = self.tasks.get(task_id).cloned() else {
            return Ok(());
        };
        self.store.mark_agent_available(&task.agent_id).await?;

        match outcome {
            Ok(result) => {
                let completed_at = result.completed_at;
                if let Some(task) = self.tasks.get_mut(task_id) {
                    task.status = TaskStatus::Completed;
                    task.completed_at = Some(completed_at);
                    task.result = Some(result.clone());
                }
                self.store
                    .update_task(
                        task_id,
                        &TaskPatch {
                            status: Some(TaskStatus::Completed),
                            completed_at: Some(Some(completed_at)),
                            result: Some(Some(result.clone())),
                            ..Default::default()
                        },
                    )
                    .await?;
                debug!(
                    "Task {task_id} completed in {}ms",
                    completed_at - task.started_at.unwrap_or(completed_at)
                );
                emit(
                    events,
                    TaskQueueEvent::TaskCompleted {
                        queue_id: self.queue_id.clone(),
                        task_id: task_id.to_string(),
                        result,
                    },
                )
                .await;
            }
            Err(error)
                if error.retryable
                    && task.retry_count < task.max_retries
                    && !self.control.is_stopped() =>
            {
                let attempt = task.retry_count + 1;
                if let Some(task) = self.tasks.get_mut(task_id) {
                    task.retry_count = attempt;
                    task.status = TaskStatus::Retrying;
                }
                self.store
                    .update_task(
                        task_id,
                        &TaskPatch {
                            status: Some(TaskStatus::Retrying),
                            retry_count: Some(attempt),
                            ..Default::default()
                        },
                    )
                    .await?;
                emit(
                    events,
                    TaskQueueEvent::TaskRetrying {
                        queue_id: self.queue_id.clone(),
                        task_id: task_id.to_string(),
                        attempt,
                        max_retries: task.max_retries,
                    },
                )
                .await;

                let delay = backoff_delay(self.settings.retry_delay, attempt);
                debug!(
                    "Task {task_id} retrying (attempt {attempt}/{}) after {}ms: {}",
                    task.max_retries,
                    delay.as_millis(),
                    error.message
                );

                // Stop during the delay discards the requeue; the stop
                // path then fails the task with an abort error.
                let stop = self.control.stop_token();
                let completions = self.completions.clone();
                let id = task_id.to_string();
                tokio::spawn(async move {
                    tokio::select! {
                        _ = stop.cancelled() => {}
                        _ = tokio::time::sleep(delay) => {
                            completions
                                .lock()
                                .await
                                .insert(id, Completion::RetryDelayElapsed);
                        }
                    }
                });
            }
            Err(error) => {
                self.mark_task_failed(task_id, error, events).await?;
            }
        }
        Ok(())
    }

    /// A retry delay elapsed: fold the task back to pending and requeue.
    async fn handle_retry_ready(&mut self, task_id: &str) -> Result<()> {
        if self.control.is_stopped() {
            return Ok(());
        }
        let Some(task) = self.tasks.get_mut(task_id) else {
            return Ok(());
        };
        if task.status != TaskStatus::Retrying {
            return Ok(());
        }

        task.status = TaskStatus::Pending;
        task.started_at = None;

        self.store
            .update_task(
                task_id,
                &TaskPatch {
                    status: Some(TaskStatus::Pending),
                    started_at: Some(None),
                    ..Default::default()
                },
            )
            .await?;
        self.store.requeue_task(&self.queue_id, task_id).await?;
        Ok(())
    }

    async fn mark_task_failed(
        &mut self,
        task_id: &str,
        error: TaskError,
        events: &mpsc::Sender<TaskQueueEvent>,
    ) -> Result<()> {
        let completed_at = now_ms();
        if let Some(task) = self.tasks.get_mut(task_id) {
            task.status = TaskStatus::Failed;
            task.completed_at = Some(completed_at);
            task.error = Some(error.clone());
        }
        self.store
            .update_task(
                task_id,
                &TaskPatch {
                    status: Some(TaskStatus::Failed),
                    completed_at: Some(Some(completed_at)),
                    error: Some(Some(error.clone())),
                    ..Default::default()
                },
            )
            .await?;
        warn!("Task {task_id} failed: {}", error.message);
        emit(
            events,
            TaskQueueEvent::TaskFailed {
                queue_id: self.queue_id.clone(),
                task_id: task_id.to_string(),
                error,
            },
        )
        .await;
        Ok(())
    }

    /// Step 5: drain still-running invocations (aborting them on stop),
    /// recompute metrics from ground truth, persist, and emit the
    /// terminal queue event.
    async fn finish(&mut self, events: &mpsc::Sender<TaskQueueEvent>) -> Result<()> {
        let stopped = self.control.is_stopped();

        if stopped {
            for token in self.running.lock().await.values() {
                token.cancel();
            }
        }

        while !self.running.lock().await.is_empty() {
            self.drain_completions(events).await?;
            tokio::time::sleep(Duration::from_millis(DISPATCH_POLL_INTERVAL_MS)).await;
        }
        self.drain_completions(events).await?;

        if stopped {
            self.terminalize_remaining(events).await?;
        }

        let tasks: Vec<Task> = self
            .order
            .iter()
            .filter_map(|id| self.tasks.get(id).cloned())
            .collect();
        let metrics = QueueMetrics::compute(&tasks);
        self.store
            .update_queue_metrics(&self.queue_id, &metrics)
            .await?;

        let now = now_ms();
        if stopped {
            self.store
                .update_queue_status(&self.queue_id, QueueStatus::Failed, Some(now))
                .await?;
            info!("Queue {} stopped", self.queue_id);
            emit(
                events,
                TaskQueueEvent::QueueFailed {
                    queue_id: self.queue_id.clone(),
                    error: "Queue was stopped".to_string(),
                },
            )
            .await;
        } else if metrics.failed_tasks > 0 {
            self.store
                .update_queue_status(&self.queue_id, QueueStatus::Failed, Some(now))
                .await?;
            info!(
                "Queue {} failed ({}/{} tasks failed)",
                self.queue_id, metrics.failed_tasks, metrics.total_tasks
            );
            emit(
                events,
                TaskQueueEvent::QueueFailed {
                    queue_id: self.queue_id.clone(),
                    error: format!("{} task(s) failed", metrics.failed_tasks),
                },
            )
            .await;
        } else {
            self.store
                .update_queue_status(&self.queue_id, QueueStatus::Completed, Some(now))
                .await?;
            info!(
                "Queue {} completed ({} tasks)",
                self.queue_id, metrics.completed_tasks
            );
            emit(
                events,
                TaskQueueEvent::QueueCompleted {
                    queue_id: self.queue_id.clone(),
                    metrics,
                },
            )
            .await;
        }

        Ok(())
    }

    /// After a stop every task must reach a terminal state: in-flight and
    /// retrying work fails with an abort error, never-dispatched work is
    /// cancelled.
    async fn terminalize_remaining(
        &mut self,
        events: &mpsc::Sender<TaskQueueEvent>,
    ) -> Result<()> {
        for task_id in self.order.clone() {
            let Some(status) = self.tasks.get(&task_id).map(|t| t.status) else {
                continue;
            };
            match status {
                TaskStatus::InProgress | TaskStatus::Retrying => {
                    let error = TaskError::abort("Queue was stopped");
                    if let Some(task) = self.tasks.get(&task_id) {
                        self.store.mark_agent_available(&task.agent_id).await?;
                    }
                    self.mark_task_failed(&task_id, error, events).await?;
                }
                TaskStatus::Pending | TaskStatus::Queued => {
                    let completed_at = now_ms();
                    if let Some(task) = self.tasks.get_mut(&task_id) {
                        task.status = TaskStatus::Cancelled;
                        task.completed_at = Some(completed_at);
                    }
                    self.store
                        .update_task(
                            &task_id,
                            &TaskPatch {
                                status: Some(TaskStatus::Cancelled),
                                completed_at: Some(Some(completed_at)),
                                ..Default::default()
                            },
                        )
                        .await?;
                }
                _ => {}
            }
        }
        Ok(())
    }
}

/// `retryDelay * 2^(attempt-1)`, capped.
fn backoff_delay(base_ms: u64, attempt: u32) -> Duration {
    let shift = (attempt.saturating_sub(1)).min(31);
    let delay = base_ms.saturating_mul(1u64 << shift);
    Duration::from_millis(delay.min(RETRY_BACKOFF_CAP_MS))
}

async fn emit(events: &mpsc::Sender<TaskQueueEvent>, event: TaskQueueEvent) {
    debug!("Emitting {} for queue {}", event.kind(), event.queue_id());
    // A dropped receiver means the consumer disconnected; the loop keeps
    // going until it observes stop.
    let _ = events.send(event).await;
}
