use crate::core::config::data::{Config, McpServerConfig};

fn parse(toml_text: &str) -> Config {
    toml::from_str(toml_text).expect("config should parse")
}

#[test]
fn empty_config_uses_orchestrator_defaults() {
    let config = parse("");
    assert!(config.mcp_servers.is_empty());
    assert_eq!(config.orchestrator.max_tool_rounds_per_turn, 8);
    assert_eq!(config.orchestrator.dispatch_timeout_ms, 30_000);
    assert_eq!(config.orchestrator.retry_count, 2);
    assert_eq!(config.orchestrator.max_queue_depth, 32);
    assert!(config.orchestrator.per_tool_concurrency_cap.is_none());
}

#[test]
fn server_entries_parse_with_partial_fields() {
    let config = parse(
        r#"
        [[mcp_servers]]
        id = "files"
        display_name = "File Tools"
        transport = "stdio"
        command = "file-server"
        args = ["--root", "/tmp"]

        [orchestrator]
        max_tool_rounds_per_turn = 3
        per_tool_concurrency_cap = 2
        "#,
    );

    let server = config.find_server("FILES").expect("server should resolve");
    assert_eq!(server.display_name, "File Tools");
    assert_eq!(server.args.as_deref(), Some(&["--root".to_string(), "/tmp".to_string()][..]));
    assert!(server.is_enabled());
    assert!(!server.is_yolo());
    assert_eq!(config.orchestrator.max_tool_rounds_per_turn, 3);
    assert_eq!(config.orchestrator.per_tool_concurrency_cap, Some(2));
}

#[test]
fn validate_accepts_a_well_formed_config() {
    let config = parse(
        r#"
        [[mcp_servers]]
        id = "search"
        display_name = "Search"
        base_url = "https://mcp.example.com"
        "#,
    );
    assert!(config.validate().is_empty());
}

#[test]
fn validate_flags_duplicate_ids_case_insensitively() {
    let mut config = Config::default();
    config.mcp_servers.push(McpServerConfig::stub("alpha"));
    config.mcp_servers.push(McpServerConfig::stub("ALPHA"));

    let issues = config.validate();
    assert!(issues.iter().any(|issue| issue.contains("Duplicate")));
}

#[test]
fn validate_flags_transport_misconfiguration() {
    let config = parse(
        r#"
        [[mcp_servers]]
        id = "broken-stdio"
        display_name = "Broken"
        transport = "stdio"

        [[mcp_servers]]
        id = "broken-http"
        display_name = "Broken Too"
        transport = "streamable-http"

        [[mcp_servers]]
        id = "broken-kind"
        display_name = "Broken Three"
        transport = "telepathy"
        "#,
    );

    let issues = config.validate();
    assert_eq!(issues.len(), 3);
    assert!(issues[0].contains("no command"));
    assert!(issues[1].contains("no base_url"));
    assert!(issues[2].contains("Unsupported MCP transport"));
}

#[test]
fn validate_ignores_disabled_servers() {
    let config = parse(
        r#"
        [[mcp_servers]]
        id = "parked"
        display_name = "Parked"
        transport = "stdio"
        enabled = false
        "#,
    );
    assert!(config.validate().is_empty());
}

#[test]
fn validate_flags_zero_round_limit() {
    let config = parse(
        r#"
        [orchestrator]
        max_tool_rounds_per_turn = 0
        "#,
    );
    let issues = config.validate();
    assert!(issues
        .iter()
        .any(|issue| issue.contains("max_tool_rounds_per_turn")));
}

#[test]
fn save_and_load_round_trip() {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("nested").join("config.toml");

    let mut config = Config::default();
    config.mcp_servers.push(McpServerConfig::stub("alpha"));
    config.orchestrator.retry_count = 5;
    config.save_to_path(&path).expect("save should succeed");

    let loaded = Config::load_from_path(&path).expect("load should succeed");
    assert_eq!(loaded.mcp_servers.len(), 1);
    assert_eq!(loaded.mcp_servers[0].id, "alpha");
    assert_eq!(loaded.orchestrator.retry_count, 5);
}

#[test]
fn loading_a_missing_file_yields_defaults() {
    let dir = tempfile::tempdir().expect("tempdir");
    let loaded =
        Config::load_from_path(&dir.path().join("absent.toml")).expect("load should succeed");
    assert!(loaded.mcp_servers.is_empty());
}
