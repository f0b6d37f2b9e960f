pub mod commands;
pub mod connections;
pub mod docker;
pub mod terminals;
pub mod transfers;
pub mod tunnels;

use crate::errors::ToolError;
use async_trait::async_trait;
use serde_json::Value;

/// One handler per tool family; the dispatcher routes by tool name.
#[async_trait]
pub trait ToolHandler: Send + Sync {
    async fn handle(&self, tool: &str, args: &Value) -> Result<Value, ToolError>;
}

pub(crate) fn text_result(text: impl Into<String>) -> Value {
    serde_json::json!({ "text": text.into() })
}

pub(crate) fn opt_str(args: &Value, key: &str) -> Option<String> {
    args.get(key)
        .and_then(|v| v.as_str())
        .map(|s| s.to_string())
        .filter(|s| !s.trim().is_empty())
}

pub(crate) fn opt_bool(args: &Value, key: &str) -> Option<bool> {
    args.get(key).and_then(|v| v.as_bool())
}

pub(crate) fn opt_u16(args: &Value, key: &str) -> Option<u16> {
    args.get(key)
        .and_then(|v| v.as_u64())
        .and_then(|n| u16::try_from(n).ok())
}

pub(crate) fn unknown_tool(tool: &str) -> ToolError {
    ToolError::internal(format!("Tool {} is not wired to this handler", tool))
}
