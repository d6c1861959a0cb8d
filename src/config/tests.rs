use super::*;

// Parsing helpers are tested directly so the suite never mutates process
// environment variables.

#[test]
fn parse_agents_accepts_valid_descriptors() {
    let agents = parse_agents(
        r#"[
            {"id": "agent-1", "endpoint": "http://localhost:9001"},
            {"id": "agent-2", "name": "builder", "endpoint": "https://agents.internal:9002", "workingDirectory": "/work"}
        ]"#,
    )
    .unwrap();

    assert_eq!(agents.len(), 2);
    assert_eq!(agents[0].id, "agent-1");
    assert_eq!(agents[1].name.as_deref(), Some("builder"));
    assert_eq!(agents[1].working_directory.as_deref(), Some("/work"));
}

#[test]
fn parse_agents_rejects_malformed_json() {
    let result = parse_agents("not json");
    assert!(matches!(
        result,
        Err(crate::ConductorError::ConfigurationError(_))
    ));
}

#[test]
fn parse_agents_rejects_empty_id() {
    let result = parse_agents(r#"[{"id": " ", "endpoint": "http://x"}]"#);
    assert!(result.is_err());
}

#[test]
fn parse_agents_rejects_non_http_endpoint() {
    let result = parse_agents(r#"[{"id": "a", "endpoint": "ftp://x"}]"#);
    assert!(result.is_err());
}

#[test]
fn parse_credentials_passes_blob_through_opaque() {
    let blob = parse_credentials(r#"{"claudeAiOauth": {"accessToken": "tok"}}"#).unwrap();
    assert_eq!(blob["claudeAiOauth"]["accessToken"], "tok");
}

#[test]
fn scheduler_config_maps_to_queue_settings() {
    let scheduler = SchedulerConfig {
        max_concurrency: 7,
        retry_count: 2,
        retry_delay_ms: 50,
        timeout_per_task_ms: 1_000,
    };
    let settings = scheduler.default_queue_settings();
    assert_eq!(settings.max_concurrency, 7);
    assert_eq!(settings.retry_count, 2);
    assert_eq!(settings.retry_delay, 50);
    assert_eq!(settings.timeout_per_task, 1_000);
}
