//! Agent invoker (C1): one streaming HTTP invocation per task.
//!
//! Issues a chat request to a worker agent, reads the newline-delimited
//! JSON response, aggregates assistant text, and classifies every failure
//! into a `TaskError`. The classification made here is final; the
//! scheduler acts on `retryable` without second-guessing it.

use crate::{
    agents::WorkerAgent,
    constants::STREAM_READ_TIMEOUT_SECS,
    models::{now_ms, ResultKind, Task, TaskError, TaskResult},
};
use futures::StreamExt;
use reqwest::{header, StatusCode};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};
use uuid::Uuid;

#[cfg(test)]
mod tests;

/// Outcome of one dispatch attempt.
pub type InvocationOutcome = std::result::Result<TaskResult, TaskError>;

pub struct AgentInvoker {
    client: reqwest::Client,
    /// Opaque credential blob forwarded as `claudeAuth`; never inspected.
    credentials: Option<serde_json::Value>,
}

impl AgentInvoker {
    pub fn new(credentials: Option<serde_json::Value>) -> Self {
        Self {
            client: reqwest::Client::new(),
            credentials,
        }
    }

    /// Invoke `task` against `agent`.
    ///
    /// Returns when the agent finishes, the cancellation token fires
    /// (`abort`), or the per-task deadline elapses (`timeout`, after
    /// triggering the token so the transfer stops).
    pub async fn invoke(
        &self,
        agent: &WorkerAgent,
        task: &Task,
        cancel: CancellationToken,
        timeout: Duration,
    ) -> InvocationOutcome {
        tokio::select! {
            _ = cancel.cancelled() => {
                debug!("Invocation of task {} aborted", task.id);
                Err(TaskError::abort("Invocation aborted"))
            }
            outcome = tokio::time::timeout(timeout, self.run_invocation(agent, task)) => {
                match outcome {
                    Ok(outcome) => outcome,
                    Err(_) => {
                        cancel.cancel();
                        Err(TaskError::timeout(format!(
                            "Task exceeded {}ms deadline",
                            timeout.as_millis()
                        )))
                    }
                }
            }
        }
    }

    async fn run_invocation(&self, agent: &WorkerAgent, task: &Task) -> InvocationOutcome {
        let body = serde_json::json!({
            "message": task.message,
            "requestId": Uuid::new_v4().to_string(),
            "workingDirectory": agent.working_directory,
            "claudeAuth": self.credentials,
        });

        let response = self
            .client
            .post(agent.chat_url())
            .header(header::CONNECTION, "keep-alive")
            .header(header::CACHE_CONTROL, "no-cache")
            .json(&body)
            .send()
            .await
            .map_err(|e| TaskError::network(format!("Transport failure: {e}")))?;

        let status = response.status();
        if !status.is_success() {
            return Err(classify_status(status));
        }

        let mut stream = response.bytes_stream();
        let mut buffer: Vec<u8> = Vec::new();
        let mut content = String::new();
        let mut session_id: Option<String> = None;
        let read_deadline = Duration::from_secs(STREAM_READ_TIMEOUT_SECS);

        loop {
            // A silent proxy or hung agent produces no frames at all; the
            // per-read deadline catches that independently of the outer
            // task deadline.
            let chunk = tokio::time::timeout(read_deadline, stream.next())
                .await
                .map_err(|_| {
                    TaskError::timeout(format!(
                        "No frame from agent within {}s",
                        read_deadline.as_secs()
                    ))
                })?;

            match chunk {
                Some(Ok(bytes)) => {
                    buffer.extend_from_slice(&bytes);
                    while let Some(pos) = buffer.iter().position(|b| *b == b'\n') {
                        let line: Vec<u8> = buffer.drain(..=pos).collect();
                        let line = String::from_utf8_lossy(&line);
                        let line = line.trim();
                        if line.is_empty() {
                            continue;
                        }
                        match handle_frame(line, &mut content, &mut session_id) {
                            FrameOutcome::Continue => {}
                            FrameOutcome::Done => {
                                return Ok(TaskResult {
                                    kind: ResultKind::Success,
                                    content,
                                    session_id,
                                    completed_at: now_ms(),
                                });
                            }
                            FrameOutcome::Error(message) => {
                                return Err(TaskError::execution(message, true));
                            }
                            FrameOutcome::Aborted => {
                                return Err(TaskError::abort("Agent reported abort"));
                            }
                        }
                    }
                }
                Some(Err(e)) => {
                    return Err(TaskError::network(format!("Stream error: {e}")));
                }
                None => {
                    // Clean end of stream without a done frame.
                    if !content.is_empty() {
                        return Ok(TaskResult {
                            kind: ResultKind::Partial,
                            content,
                            session_id,
                            completed_at: now_ms(),
                        });
                    }
                    return Err(TaskError::network("Stream ended before done frame"));
                }
            }
        }
    }
}

impl Default for AgentInvoker {
    fn default() -> Self {
        Self::new(None)
    }
}

fn classify_status(status: StatusCode) -> TaskError {
    match status {
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
            TaskError::execution(format!("Agent rejected credentials ({status})"), false)
        }
        s if s.is_server_error() => TaskError::network(format!("Agent returned {status}")),
        _ => TaskError::execution(format!("Agent returned {status}"), false),
    }
}

enum FrameOutcome {
    Continue,
    Done,
    Error(String),
    Aborted,
}

/// Interpret one NDJSON envelope. Malformed lines and unknown types are
/// skipped silently.
fn handle_frame(line: &str, content: &mut String, session_id: &mut Option<String>) -> FrameOutcome {
    let Ok(envelope) = serde_json::from_str::<serde_json::Value>(line) else {
        trace!("Skipping malformed frame: {line}");
        return FrameOutcome::Continue;
    };

    match envelope.get("type").and_then(|t| t.as_str()) {
        Some("claude_json") => {
            let data = envelope.get("data").unwrap_or(&serde_json::Value::Null);

            if let Some(fragments) = data
                .get("message")
                .and_then(|m| m.get("content"))
                .and_then(|c| c.as_array())
            {
                for fragment in fragments {
                    if fragment.get("type").and_then(|t| t.as_str()) == Some("text") {
                        if let Some(text) = fragment.get("text").and_then(|t| t.as_str()) {
                            content.push_str(text);
                        }
                    }
                }
            } else if let Some(text) = data.get("text").and_then(|t| t.as_str()) {
                content.push_str(text);
            }

            if session_id.is_none() {
                *session_id = data
                    .get("session_id")
                    .or_else(|| data.get("sessionId"))
                    .and_then(|s| s.as_str())
                    .map(str::to_string);
            }
            FrameOutcome::Continue
        }
        Some("error") => {
            let message = envelope
                .get("error")
                .or_else(|| envelope.get("message"))
                .and_then(|m| m.as_str())
                .unwrap_or("Agent reported an error")
                .to_string();
            FrameOutcome::Error(message)
        }
        Some("aborted") => FrameOutcome::Aborted,
        Some("done") => FrameOutcome::Done,
        _ => FrameOutcome::Continue,
    }
}
