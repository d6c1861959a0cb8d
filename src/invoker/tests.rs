use super::*;
use crate::models::ErrorKind;
use std::io::Write;

fn test_agent(endpoint: &str) -> WorkerAgent {
    WorkerAgent {
        id: "agent-1".to_string(),
        name: None,
        endpoint: endpoint.to_string(),
        working_directory: Some("/work".to_string()),
    }
}

fn test_task() -> Task {
    Task::new("q-1".into(), "agent-1".into(), "say ok".into(), 1, 3)
}

async fn invoke_against(server: &mockito::ServerGuard) -> InvocationOutcome {
    let invoker = AgentInvoker::new(None);
    invoker
        .invoke(
            &test_agent(&server.url()),
            &test_task(),
            CancellationToken::new(),
            Duration::from_secs(5),
        )
        .await
}

#[tokio::test]
async fn streams_text_fragments_until_done() {
    let mut server = mockito::Server::new_async().await;
    let body = concat!(
        r#"{"type":"claude_json","data":{"session_id":"sess-9","message":{"content":[{"type":"text","text":"Hello"}]}}}"#,
        "\n",
        r#"{"type":"claude_json","data":{"message":{"content":[{"type":"text","text":" world"}]}}}"#,
        "\n",
        r#"{"type":"done"}"#,
        "\n",
    );
    let mock = server
        .mock("POST", "/api/chat")
        .with_status(200)
        .with_body(body)
        .create_async()
        .await;

    let result = invoke_against(&server).await.unwrap();
    assert_eq!(result.kind, ResultKind::Success);
    assert_eq!(result.content, "Hello world");
    assert_eq!(result.session_id.as_deref(), Some("sess-9"));
    mock.assert_async().await;
}

#[tokio::test]
async fn unknown_and_malformed_frames_are_skipped() {
    let mut server = mockito::Server::new_async().await;
    let body = concat!(
        "this is not json\n",
        r#"{"type":"telemetry","cpu":93}"#,
        "\n",
        r#"{"type":"claude_json","data":{"message":{"content":[{"type":"text","text":"ok"}]}}}"#,
        "\n",
        r#"{"type":"done"}"#,
        "\n",
    );
    server
        .mock("POST", "/api/chat")
        .with_status(200)
        .with_body(body)
        .create_async()
        .await;

    let result = invoke_against(&server).await.unwrap();
    assert_eq!(result.content, "ok");
}

#[tokio::test]
async fn unauthorized_is_execution_and_final() {
    let mut server = mockito::Server::new_async().await;
    server
        .mock("POST", "/api/chat")
        .with_status(401)
        .create_async()
        .await;

    let error = invoke_against(&server).await.unwrap_err();
    assert_eq!(error.kind, ErrorKind::Execution);
    assert!(!error.retryable);
}

#[tokio::test]
async fn server_error_is_network_and_retryable() {
    let mut server = mockito::Server::new_async().await;
    server
        .mock("POST", "/api/chat")
        .with_status(503)
        .create_async()
        .await;

    let error = invoke_against(&server).await.unwrap_err();
    assert_eq!(error.kind, ErrorKind::Network);
    assert!(error.retryable);
}

#[tokio::test]
async fn other_client_errors_are_execution_and_final() {
    let mut server = mockito::Server::new_async().await;
    server
        .mock("POST", "/api/chat")
        .with_status(404)
        .create_async()
        .await;

    let error = invoke_against(&server).await.unwrap_err();
    assert_eq!(error.kind, ErrorKind::Execution);
    assert!(!error.retryable);
}

#[tokio::test]
async fn error_frame_is_execution_and_retryable() {
    let mut server = mockito::Server::new_async().await;
    server
        .mock("POST", "/api/chat")
        .with_status(200)
        .with_body("{\"type\":\"error\",\"error\":\"model overloaded\"}\n")
        .create_async()
        .await;

    let error = invoke_against(&server).await.unwrap_err();
    assert_eq!(error.kind, ErrorKind::Execution);
    assert!(error.retryable);
    assert_eq!(error.message, "model overloaded");
}

#[tokio::test]
async fn aborted_frame_is_abort_and_final() {
    let mut server = mockito::Server::new_async().await;
    server
        .mock("POST", "/api/chat")
        .with_status(200)
        .with_body("{\"type\":\"aborted\"}\n")
        .create_async()
        .await;

    let error = invoke_against(&server).await.unwrap_err();
    assert_eq!(error.kind, ErrorKind::Abort);
    assert!(!error.retryable);
}

#[tokio::test]
async fn clean_eof_with_content_yields_partial_result() {
    let mut server = mockito::Server::new_async().await;
    server
        .mock("POST", "/api/chat")
        .with_status(200)
        .with_body(
            "{\"type\":\"claude_json\",\"data\":{\"message\":{\"content\":[{\"type\":\"text\",\"text\":\"half\"}]}}}\n",
        )
        .create_async()
        .await;

    let result = invoke_against(&server).await.unwrap();
    assert_eq!(result.kind, ResultKind::Partial);
    assert_eq!(result.content, "half");
}

#[tokio::test]
async fn clean_eof_without_content_is_network_error() {
    let mut server = mockito::Server::new_async().await;
    server
        .mock("POST", "/api/chat")
        .with_status(200)
        .with_body("")
        .create_async()
        .await;

    let error = invoke_against(&server).await.unwrap_err();
    assert_eq!(error.kind, ErrorKind::Network);
    assert!(error.retryable);
}

#[tokio::test]
async fn unreachable_agent_is_network_error() {
    let invoker = AgentInvoker::new(None);
    // Nothing listens on port 1.
    let error = invoker
        .invoke(
            &test_agent("http://127.0.0.1:1"),
            &test_task(),
            CancellationToken::new(),
            Duration::from_secs(2),
        )
        .await
        .unwrap_err();
    assert_eq!(error.kind, ErrorKind::Network);
    assert!(error.retryable);
}

#[tokio::test]
async fn pre_cancelled_token_aborts_before_dispatch() {
    let mut server = mockito::Server::new_async().await;
    server
        .mock("POST", "/api/chat")
        .with_status(200)
        .with_body("{\"type\":\"done\"}\n")
        .create_async()
        .await;

    let cancel = CancellationToken::new();
    cancel.cancel();

    let invoker = AgentInvoker::new(None);
    let error = invoker
        .invoke(
            &test_agent(&server.url()),
            &test_task(),
            cancel,
            Duration::from_secs(5),
        )
        .await
        .unwrap_err();
    assert_eq!(error.kind, ErrorKind::Abort);
}

#[tokio::test]
async fn outer_deadline_cancels_and_reports_timeout() {
    let mut server = mockito::Server::new_async().await;
    server
        .mock("POST", "/api/chat")
        .with_status(200)
        .with_chunked_body(|writer| {
            std::thread::sleep(std::time::Duration::from_millis(500));
            writer.write_all(b"{\"type\":\"done\"}\n")
        })
        .create_async()
        .await;

    let cancel = CancellationToken::new();
    let invoker = AgentInvoker::new(None);
    let error = invoker
        .invoke(
            &test_agent(&server.url()),
            &test_task(),
            cancel.clone(),
            Duration::from_millis(50),
        )
        .await
        .unwrap_err();

    assert_eq!(error.kind, ErrorKind::Timeout);
    assert!(error.retryable);
    assert!(cancel.is_cancelled());
}
