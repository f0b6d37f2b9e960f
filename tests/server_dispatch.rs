mod common;
use common::{tmp_dir, ENV_LOCK};

use serde_json::json;
use ssh_broker::app::App;
use ssh_broker::mcp::server::McpServer;
use ssh_broker::services::logger::Logger;
use std::sync::Arc;

async fn server() -> McpServer {
    let dir = tmp_dir("broker-dispatch");
    std::fs::create_dir_all(&dir).expect("create dir");
    std::env::set_var("SSH_BROKER_DATA_DIR", &dir);
    std::env::set_var("SSH_BROKER_KEY_PATH", dir.join(".broker.key"));
    std::env::set_var("SSH_BROKER_DISABLE_KEYRING", "1");
    let app = App::initialize(Logger::new("test")).expect("app");
    McpServer::new(Arc::new(app))
}

fn content_text(result: &serde_json::Value) -> &str {
    result
        .get("content")
        .and_then(|v| v.as_array())
        .and_then(|items| items.first())
        .and_then(|item| item.get("text"))
        .and_then(|v| v.as_str())
        .unwrap_or_default()
}

#[tokio::test]
async fn list_connections_starts_empty() {
    let _guard = ENV_LOCK.lock().await;
    let server = server().await;
    let result = server
        .handle_tools_call("listConnections", json!({}))
        .await
        .expect("call");
    assert_eq!(result.get("isError").and_then(|v| v.as_bool()), Some(false));
    assert_eq!(content_text(&result), "No connections");
}

#[tokio::test]
async fn unknown_connection_is_a_tool_level_error() {
    let _guard = ENV_LOCK.lock().await;
    let server = server().await;
    let result = server
        .handle_tools_call(
            "executeCommand",
            json!({"connectionId": "nope", "command": "ls"}),
        )
        .await
        .expect("call");
    assert_eq!(result.get("isError").and_then(|v| v.as_bool()), Some(true));
    assert!(content_text(&result).contains("not_found"));
}

#[tokio::test]
async fn schema_violations_are_protocol_errors() {
    let _guard = ENV_LOCK.lock().await;
    let server = server().await;
    let err = server
        .handle_tools_call("connect", json!({"host": "h"}))
        .await
        .expect_err("missing username must be rejected");
    assert!(err.message.contains("connect"));
}

#[tokio::test]
async fn unknown_tools_are_rejected_at_the_protocol_level() {
    let _guard = ENV_LOCK.lock().await;
    let server = server().await;
    assert!(server
        .handle_tools_call("selfDestruct", json!({}))
        .await
        .is_err());
}

#[tokio::test]
async fn tunnel_close_of_unknown_id_is_idempotent_text() {
    let _guard = ENV_LOCK.lock().await;
    let server = server().await;
    let result = server
        .handle_tools_call("closeTunnel", json!({"tunnelId": "t-missing"}))
        .await
        .expect("call");
    assert_eq!(result.get("isError").and_then(|v| v.as_bool()), Some(false));
    assert!(content_text(&result).contains("was not open"));
}
