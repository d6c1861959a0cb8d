//! Flat-record serialization of queues and tasks.
//!
//! Every scalar field is stored as a string and the empty string encodes
//! "absent", so any key/value backend that speaks field maps can hold the
//! state. Complex subfields (settings, metrics, result, error) are nested
//! JSON within their field.

use crate::{
    models::{
        Complexity, Queue, QueueMetrics, QueueSettings, QueueStatus, Task, TaskError, TaskPatch,
        TaskResult, TaskStatus, TimestampMs,
    },
    ConductorError, Result,
};
use std::collections::HashMap;

pub type Record = HashMap<String, String>;

fn complexity_to_str(complexity: Option<Complexity>) -> &'static str {
    match complexity {
        None => "",
        Some(Complexity::Low) => "low",
        Some(Complexity::Medium) => "medium",
        Some(Complexity::High) => "high",
    }
}

fn complexity_from_str(raw: &str) -> Result<Option<Complexity>> {
    match raw {
        "" => Ok(None),
        "low" => Ok(Some(Complexity::Low)),
        "medium" => Ok(Some(Complexity::Medium)),
        "high" => Ok(Some(Complexity::High)),
        other => Err(ConductorError::Validation(format!(
            "Unknown complexity: {other}"
        ))),
    }
}

fn opt_ts_to_string(ts: Option<TimestampMs>) -> String {
    ts.map(|v| v.to_string()).unwrap_or_default()
}

fn field<'a>(record: &'a Record, name: &str) -> Result<&'a str> {
    record
        .get(name)
        .map(String::as_str)
        .ok_or_else(|| ConductorError::Validation(format!("Record missing field: {name}")))
}

fn parse_ts(raw: &str, name: &str) -> Result<TimestampMs> {
    raw.parse()
        .map_err(|_| ConductorError::Validation(format!("Field {name} is not a timestamp: {raw}")))
}

fn parse_opt_ts(record: &Record, name: &str) -> Result<Option<TimestampMs>> {
    match record.get(name).map(String::as_str).unwrap_or("") {
        "" => Ok(None),
        raw => parse_ts(raw, name).map(Some),
    }
}

fn parse_opt_json<T: serde::de::DeserializeOwned>(record: &Record, name: &str) -> Result<Option<T>> {
    match record.get(name).map(String::as_str).unwrap_or("") {
        "" => Ok(None),
        raw => Ok(Some(serde_json::from_str(raw)?)),
    }
}

pub fn queue_to_record(queue: &Queue) -> Result<Vec<(String, String)>> {
    Ok(vec![
        ("id".into(), queue.id.clone()),
        ("name".into(), queue.name.clone()),
        (
            "description".into(),
            queue.description.clone().unwrap_or_default(),
        ),
        ("status".into(), queue.status.as_str().to_string()),
        ("settings".into(), serde_json::to_string(&queue.settings)?),
        ("metrics".into(), serde_json::to_string(&queue.metrics)?),
        ("createdAt".into(), queue.created_at.to_string()),
        ("startedAt".into(), opt_ts_to_string(queue.started_at)),
        ("completedAt".into(), opt_ts_to_string(queue.completed_at)),
    ])
}

/// Rebuild a queue from its record plus its tasks in insertion order.
pub fn queue_from_record(record: &Record, tasks: Vec<Task>) -> Result<Queue> {
    let settings: QueueSettings = serde_json::from_str(field(record, "settings")?)?;
    let metrics: QueueMetrics = serde_json::from_str(field(record, "metrics")?)?;
    let description = match field(record, "description")? {
        "" => None,
        d => Some(d.to_string()),
    };

    Ok(Queue {
        id: field(record, "id")?.to_string(),
        name: field(record, "name")?.to_string(),
        description,
        status: field(record, "status")?
            .parse::<QueueStatus>()
            .map_err(ConductorError::Validation)?,
        settings,
        metrics,
        tasks,
        created_at: parse_ts(field(record, "createdAt")?, "createdAt")?,
        started_at: parse_opt_ts(record, "startedAt")?,
        completed_at: parse_opt_ts(record, "completedAt")?,
    })
}

pub fn task_to_record(task: &Task) -> Result<Vec<(String, String)>> {
    let result = match &task.result {
        Some(result) => serde_json::to_string(result)?,
        None => String::new(),
    };
    let error = match &task.error {
        Some(error) => serde_json::to_string(error)?,
        None => String::new(),
    };

    Ok(vec![
        ("id".into(), task.id.clone()),
        ("queueId".into(), task.queue_id.clone()),
        ("agentId".into(), task.agent_id.clone()),
        ("message".into(), task.message.clone()),
        ("priority".into(), task.priority.to_string()),
        (
            "estimatedComplexity".into(),
            complexity_to_str(task.estimated_complexity).to_string(),
        ),
        ("retryCount".into(), task.retry_count.to_string()),
        ("maxRetries".into(), task.max_retries.to_string()),
        ("status".into(), task.status.as_str().to_string()),
        ("createdAt".into(), task.created_at.to_string()),
        ("startedAt".into(), opt_ts_to_string(task.started_at)),
        ("completedAt".into(), opt_ts_to_string(task.completed_at)),
        ("result".into(), result),
        ("error".into(), error),
    ])
}

pub fn task_from_record(record: &Record) -> Result<Task> {
    let priority: u8 = field(record, "priority")?
        .parse()
        .map_err(|_| ConductorError::Validation("Field priority is not an integer".into()))?;
    let retry_count: u32 = field(record, "retryCount")?
        .parse()
        .map_err(|_| ConductorError::Validation("Field retryCount is not an integer".into()))?;
    let max_retries: u32 = field(record, "maxRetries")?
        .parse()
        .map_err(|_| ConductorError::Validation("Field maxRetries is not an integer".into()))?;

    Ok(Task {
        id: field(record, "id")?.to_string(),
        queue_id: field(record, "queueId")?.to_string(),
        agent_id: field(record, "agentId")?.to_string(),
        message: field(record, "message")?.to_string(),
        priority,
        estimated_complexity: complexity_from_str(
            record
                .get("estimatedComplexity")
                .map(String::as_str)
                .unwrap_or(""),
        )?,
        retry_count,
        max_retries,
        status: field(record, "status")?
            .parse::<TaskStatus>()
            .map_err(ConductorError::Validation)?,
        created_at: parse_ts(field(record, "createdAt")?, "createdAt")?,
        started_at: parse_opt_ts(record, "startedAt")?,
        completed_at: parse_opt_ts(record, "completedAt")?,
        result: parse_opt_json::<TaskResult>(record, "result")?,
        error: parse_opt_json::<TaskError>(record, "error")?,
    })
}

/// Fields written by a partial task update. Unsupplied patch members
/// produce no field at all, so the merge never clears sibling data.
pub fn patch_to_fields(patch: &TaskPatch) -> Result<Vec<(String, String)>> {
    let mut fields = Vec::new();

    if let Some(status) = patch.status {
        fields.push(("status".to_string(), status.as_str().to_string()));
    }
    if let Some(started_at) = patch.started_at {
        fields.push(("startedAt".to_string(), opt_ts_to_string(started_at)));
    }
    if let Some(completed_at) = patch.completed_at {
        fields.push(("completedAt".to_string(), opt_ts_to_string(completed_at)));
    }
    if let Some(ref result) = patch.result {
        let encoded = match result {
            Some(result) => serde_json::to_string(result)?,
            None => String::new(),
        };
        fields.push(("result".to_string(), encoded));
    }
    if let Some(ref error) = patch.error {
        let encoded = match error {
            Some(error) => serde_json::to_string(error)?,
            None => String::new(),
        };
        fields.push(("error".to_string(), encoded));
    }
    if let Some(retry_count) = patch.retry_count {
        fields.push(("retryCount".to_string(), retry_count.to_string()));
    }

    Ok(fields)
}

/// Read the listing summary straight from a queue record.
pub fn summary_from_record(record: &Record, task_count: usize) -> Result<crate::models::QueueSummary> {
    let metrics: QueueMetrics = serde_json::from_str(field(record, "metrics")?)?;
    Ok(crate::models::QueueSummary {
        id: field(record, "id")?.to_string(),
        name: field(record, "name")?.to_string(),
        status: field(record, "status")?
            .parse::<QueueStatus>()
            .map_err(ConductorError::Validation)?,
        task_count,
        completed_count: metrics.completed_tasks,
        created_at: parse_ts(field(record, "createdAt")?, "createdAt")?,
    })
}
