//! Control API (C4): queue lifecycle over HTTP plus the per-queue SSE
//! event stream that drives execution.
//!
//! `/start` only transitions a queue to `running` and hands back the
//! stream URL; opening `GET /api/queue/stream/{id}` is what creates the
//! scheduler and begins dispatching. Task-level failures never surface as
//! HTTP errors; they travel on the event stream and in subsequent reads.

use crate::{
    agents::AgentRegistry,
    config::{ApiConfig, Config},
    invoker::AgentInvoker,
    models::{
        now_ms, Complexity, Queue, QueueSettings, QueueStatus, Task, TaskPatch, TaskStatus,
    },
    scheduler::{QueueScheduler, SchedulerControl, SchedulerRegistry},
    store::QueueStore,
    Result,
};
use axum::{
    extract::{Path, Query, State},
    http::{header, HeaderValue, StatusCode},
    response::{
        sse::{Event, KeepAlive, Sse},
        IntoResponse, Response,
    },
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use std::{convert::Infallible, sync::Arc};
use tower::ServiceBuilder;
use tower_http::{
    cors::{Any, CorsLayer},
    set_header::SetResponseHeaderLayer,
    trace::TraceLayer,
};
use tracing::{info, warn};

#[cfg(test)]
mod tests;

const SERVICE_NAME: &str = "conductor-core";
const SERVICE_VERSION: &str = env!("CARGO_PKG_VERSION");

const ROUTE_HEALTH: &str = "/health";
const ROUTE_QUEUE: &str = "/api/queue";
const ROUTE_QUEUES: &str = "/api/queues";
const ROUTE_QUEUE_BY_ID: &str = "/api/queue/{id}";
const ROUTE_QUEUE_START: &str = "/api/queue/{id}/start";
const ROUTE_QUEUE_PAUSE: &str = "/api/queue/{id}/pause";
const ROUTE_QUEUE_RESUME: &str = "/api/queue/{id}/resume";
const ROUTE_TASK_RETRY: &str = "/api/queue/{id}/tasks/{task_id}/retry";
const ROUTE_QUEUE_STREAM: &str = "/api/queue/stream/{id}";
const ROUTE_BUSY_AGENTS: &str = "/api/queue/busy-agents";
const ROUTE_AGENTS: &str = "/api/agents";

const ERROR_INTERNAL: &str = "Internal server error";

const DEFAULT_TASK_PRIORITY: u8 = 5;

type ApiError = (StatusCode, Json<ErrorResponse>);
type ApiResult<T> = std::result::Result<T, ApiError>;

#[derive(Clone)]
pub struct ApiServer {
    config: ApiConfig,
    store: Arc<QueueStore>,
    agents: Arc<AgentRegistry>,
    invoker: Arc<AgentInvoker>,
    schedulers: Arc<SchedulerRegistry>,
    default_settings: QueueSettings,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateQueueRequest {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub tasks: Vec<CreateTaskRequest>,
    #[serde(default)]
    pub settings: Option<QueueSettings>,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateTaskRequest {
    pub agent_id: String,
    pub message: String,
    #[serde(default)]
    pub priority: Option<u8>,
    #[serde(default)]
    pub estimated_complexity: Option<Complexity>,
    #[serde(default)]
    pub max_retries: Option<u32>,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateQueueResponse {
    pub queue_id: String,
    pub queue: Queue,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StartQueueResponse {
    pub queue_id: String,
    pub status: QueueStatus,
    pub stream_url: String,
}

#[derive(Debug, Deserialize)]
pub struct DeleteQueueParams {
    #[serde(default)]
    pub force: bool,
}

impl ApiServer {
    pub fn new(
        config: Config,
        store: Arc<QueueStore>,
        agents: Arc<AgentRegistry>,
        schedulers: Arc<SchedulerRegistry>,
    ) -> Self {
        let invoker = Arc::new(AgentInvoker::new(config.agents.credentials.clone()));
        Self {
            config: config.api.clone(),
            store,
            agents,
            invoker,
            schedulers,
            default_settings: config.scheduler.default_queue_settings(),
        }
    }

    pub async fn run(&self) -> Result<()> {
        let app = self.build_router();

        let listener =
            tokio::net::TcpListener::bind(format!("{}:{}", self.config.host, self.config.port))
                .await
                .map_err(|e| crate::ConductorError::Internal(e.into()))?;

        info!(
            "Control API listening on {}:{}",
            self.config.host, self.config.port
        );

        axum::serve(listener, app)
            .await
            .map_err(|e| crate::ConductorError::Internal(e.into()))?;

        Ok(())
    }

    pub fn build_router(&self) -> Router {
        let cors_layer = CorsLayer::new()
            .allow_origin(Any)
            .allow_methods(Any)
            .allow_headers(Any);

        Router::new()
            .route(ROUTE_HEALTH, get(health_check))
            .route(ROUTE_QUEUE, post(create_queue))
            .route(ROUTE_QUEUES, get(list_queues))
            .route(ROUTE_BUSY_AGENTS, get(get_busy_agents))
            .route(ROUTE_QUEUE_BY_ID, get(get_queue).delete(delete_queue))
            .route(ROUTE_QUEUE_START, post(start_queue))
            .route(ROUTE_QUEUE_PAUSE, post(pause_queue))
            .route(ROUTE_QUEUE_RESUME, post(resume_queue))
            .route(ROUTE_TASK_RETRY, post(retry_task))
            .route(ROUTE_QUEUE_STREAM, get(stream_queue))
            .route(ROUTE_AGENTS, get(list_agents))
            .layer(
                ServiceBuilder::new()
                    .layer(TraceLayer::new_for_http())
                    .layer(SetResponseHeaderLayer::if_not_present(
                        header::CACHE_CONTROL,
                        HeaderValue::from_static("no-cache, no-store"),
                    ))
                    .layer(cors_layer),
            )
            .with_state(self.clone())
    }
}

fn not_found(what: impl Into<String>) -> ApiError {
    (
        StatusCode::NOT_FOUND,
        Json(ErrorResponse {
            error: "Not found".to_string(),
            details: Some(what.into()),
        }),
    )
}

fn bad_request(message: impl Into<String>) -> ApiError {
    (
        StatusCode::BAD_REQUEST,
        Json(ErrorResponse {
            error: message.into(),
            details: None,
        }),
    )
}

fn internal(e: crate::ConductorError) -> ApiError {
    warn!("Request handling failed: {e}");
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(ErrorResponse {
            error: ERROR_INTERNAL.to_string(),
            details: None,
        }),
    )
}

async fn health_check() -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "status": "healthy",
        "service": SERVICE_NAME,
        "version": SERVICE_VERSION
    }))
}

async fn create_queue(
    State(server): State<ApiServer>,
    Json(request): Json<CreateQueueRequest>,
) -> ApiResult<(StatusCode, Json<CreateQueueResponse>)> {
    if request.name.trim().is_empty() {
        return Err(bad_request("Queue name is required"));
    }
    if request.tasks.is_empty() {
        return Err(bad_request("At least one task is required"));
    }
    for (index, task) in request.tasks.iter().enumerate() {
        if task.agent_id.trim().is_empty() {
            return Err(bad_request(format!("Task {index} is missing agentId")));
        }
        if task.message.trim().is_empty() {
            return Err(bad_request(format!("Task {index} is missing message")));
        }
    }

    let settings = request
        .settings
        .unwrap_or_else(|| server.default_settings.clone());
    let mut queue = Queue::new(request.name, request.description, settings.clone());

    for spec in request.tasks {
        let mut task = Task::new(
            queue.id.clone(),
            spec.agent_id,
            spec.message,
            spec.priority.unwrap_or(DEFAULT_TASK_PRIORITY),
            spec.max_retries.unwrap_or(settings.retry_count),
        );
        if let Some(complexity) = spec.estimated_complexity {
            task = task.with_complexity(complexity);
        }
        queue.tasks.push(task);
    }
    queue.recompute_metrics();

    server.store.save_queue(&queue).await.map_err(internal)?;
    info!("Created queue {} ({} tasks)", queue.id, queue.tasks.len());

    Ok((
        StatusCode::CREATED,
        Json(CreateQueueResponse {
            queue_id: queue.id.clone(),
            queue,
        }),
    ))
}

async fn get_queue(
    State(server): State<ApiServer>,
    Path(queue_id): Path<String>,
) -> ApiResult<Json<serde_json::Value>> {
    let queue = load_queue_or_404(&server, &queue_id).await?;
    Ok(Json(serde_json::json!({ "queue": queue })))
}

async fn list_queues(State(server): State<ApiServer>) -> ApiResult<Json<serde_json::Value>> {
    let queues = server.store.list_queues().await.map_err(internal)?;
    Ok(Json(serde_json::json!({ "queues": queues })))
}

async fn delete_queue(
    State(server): State<ApiServer>,
    Path(queue_id): Path<String>,
    Query(params): Query<DeleteQueueParams>,
) -> ApiResult<Json<serde_json::Value>> {
    let queue = load_queue_or_404(&server, &queue_id).await?;

    if queue.status == QueueStatus::Running && !params.force {
        return Err(bad_request(
            "Queue is running; pass force=true to delete it",
        ));
    }

    if params.force && server.schedulers.stop(&queue_id) {
        info!("Stopped active scheduler for queue {queue_id} before delete");
    }

    server.store.delete_queue(&queue_id).await.map_err(internal)?;
    info!("Deleted queue {queue_id}");
    Ok(Json(serde_json::json!({
        "queueId": queue_id,
        "deleted": true
    })))
}

async fn start_queue(
    State(server): State<ApiServer>,
    Path(queue_id): Path<String>,
) -> ApiResult<Json<StartQueueResponse>> {
    let queue = load_queue_or_404(&server, &queue_id).await?;

    if queue.status == QueueStatus::Running {
        return Err(bad_request("Queue is already running"));
    }

    server
        .store
        .update_queue_status(&queue_id, QueueStatus::Running, Some(now_ms()))
        .await
        .map_err(internal)?;

    Ok(Json(StartQueueResponse {
        queue_id: queue_id.clone(),
        status: QueueStatus::Running,
        stream_url: format!("/api/queue/stream/{queue_id}"),
    }))
}

async fn pause_queue(
    State(server): State<ApiServer>,
    Path(queue_id): Path<String>,
) -> ApiResult<Json<serde_json::Value>> {
    load_queue_or_404(&server, &queue_id).await?;

    let signalled = server.schedulers.pause(&queue_id);
    server
        .store
        .update_queue_status(&queue_id, QueueStatus::Paused, None)
        .await
        .map_err(internal)?;

    Ok(Json(serde_json::json!({
        "queueId": queue_id,
        "status": "paused",
        "schedulerSignalled": signalled
    })))
}

async fn resume_queue(
    State(server): State<ApiServer>,
    Path(queue_id): Path<String>,
) -> ApiResult<Json<serde_json::Value>> {
    load_queue_or_404(&server, &queue_id).await?;

    let signalled = server.schedulers.resume(&queue_id);
    server
        .store
        .update_queue_status(&queue_id, QueueStatus::Running, None)
        .await
        .map_err(internal)?;

    Ok(Json(serde_json::json!({
        "queueId": queue_id,
        "status": "running",
        "schedulerSignalled": signalled
    })))
}

/// Reset a task for a fresh run and put it back on the pending list.
async fn retry_task(
    State(server): State<ApiServer>,
    Path((queue_id, task_id)): Path<(String, String)>,
) -> ApiResult<Json<serde_json::Value>> {
    load_queue_or_404(&server, &queue_id).await?;

    let task = server
        .store
        .load_task(&task_id)
        .await
        .map_err(internal)?
        .filter(|t| t.queue_id == queue_id)
        .ok_or_else(|| not_found(format!("Task {task_id} in queue {queue_id}")))?;

    let patch = TaskPatch {
        status: Some(TaskStatus::Pending),
        retry_count: Some(0),
        started_at: Some(None),
        completed_at: Some(None),
        result: Some(None),
        error: Some(None),
    };
    server
        .store
        .update_task(&task_id, &patch)
        .await
        .map_err(internal)?;
    server
        .store
        .requeue_task(&queue_id, &task_id)
        .await
        .map_err(internal)?;

    let task = server
        .store
        .load_task(&task_id)
        .await
        .map_err(internal)?
        .unwrap_or(task);

    info!("Task {task_id} reset for retry in queue {queue_id}");
    Ok(Json(serde_json::json!({ "task": task })))
}

async fn get_busy_agents(State(server): State<ApiServer>) -> ApiResult<Json<serde_json::Value>> {
    let busy = server.store.get_busy_agents().await.map_err(internal)?;
    Ok(Json(serde_json::json!({ "busyAgents": busy })))
}

async fn list_agents(State(server): State<ApiServer>) -> Json<serde_json::Value> {
    Json(serde_json::json!({ "agents": server.agents.list() }))
}

/// Open the SSE stream for a queue and drive its execution.
///
/// The scheduler lives exactly as long as this stream: client disconnect
/// or loop end tears it down and frees the queue for a later scheduler.
async fn stream_queue(State(server): State<ApiServer>, Path(queue_id): Path<String>) -> Response {
    let queue = match server.store.load_queue(&queue_id).await {
        Ok(Some(queue)) => queue,
        Ok(None) => return not_found(format!("Queue {queue_id}")).into_response(),
        Err(e) => return internal(e).into_response(),
    };

    let control = SchedulerControl::new();
    if !server.schedulers.try_register(&queue_id, control.clone()) {
        return bad_request("Queue already has an active scheduler").into_response();
    }

    let scheduler = QueueScheduler::new(
        queue,
        server.store.clone(),
        server.agents.clone(),
        server.invoker.clone(),
        control.clone(),
    );
    let mut events = scheduler.spawn();

    let guard = StreamGuard {
        schedulers: server.schedulers.clone(),
        queue_id: queue_id.clone(),
        control,
    };
    let store = server.store.clone();

    let stream = async_stream::stream! {
        let _guard = guard;
        while let Some(event) = events.recv().await {
            // Mirror every streamed event onto the store's pub/sub
            // channel for non-SSE observers.
            if let Err(e) = store.publish_event(&event).await {
                warn!("Event publish failed: {e}");
            }
            let payload = serde_json::to_string(&event).unwrap_or_default();
            yield Ok::<_, Infallible>(Event::default().event(event.kind()).data(payload));
        }
    };

    let sse = Sse::new(stream).keep_alive(KeepAlive::default());
    (
        [
            ("connection", "keep-alive"),
            ("cache-control", "no-cache, no-store"),
            ("x-accel-buffering", "no"),
        ],
        sse,
    )
        .into_response()
}

/// Tears the scheduler down when the SSE stream ends for any reason.
struct StreamGuard {
    schedulers: Arc<SchedulerRegistry>,
    queue_id: String,
    control: Arc<SchedulerControl>,
}

impl Drop for StreamGuard {
    fn drop(&mut self) {
        self.control.stop();
        self.schedulers.unregister(&self.queue_id);
    }
}

async fn load_queue_or_404(server: &ApiServer, queue_id: &str) -> ApiResult<Queue> {
    server
        .store
        .load_queue(queue_id)
        .await
        .map_err(internal)?
        .ok_or_else(|| not_found(format!("Queue {queue_id}")))
}
