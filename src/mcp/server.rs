use crate::app::App;
use crate::errors::{ErrorCode, McpError, ToolError};
use crate::mcp::catalog::{tool_by_name, tool_catalog, validate_tool_args};
use crate::mcp::protocol::{JsonRpcNotification, JsonRpcRequest, JsonRpcResponse};
use serde_json::Value;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, BufWriter};
use tokio::sync::mpsc;

const PROTOCOL_VERSION: &str = "2025-06-18";
const SERVER_NAME: &str = "ssh-broker";
const SERVER_VERSION: &str = env!("CARGO_PKG_VERSION");

const EVENT_METHOD: &str = "notifications/ssh-broker/event";

pub struct McpServer {
    app: Arc<App>,
}

impl McpServer {
    pub fn new(app: Arc<App>) -> Self {
        Self { app }
    }

    async fn handle_initialize(&self) -> Value {
        serde_json::json!({
            "protocolVersion": PROTOCOL_VERSION,
            "capabilities": {"tools": {"list": true, "call": true}},
            "serverInfo": {"name": SERVER_NAME, "version": SERVER_VERSION},
        })
    }

    async fn handle_tools_list(&self) -> Value {
        serde_json::json!({ "tools": tool_catalog() })
    }

    /// Tool failures come back as `isError` results; only malformed requests
    /// and unknown tools surface as JSON-RPC errors.
    pub async fn handle_tools_call(&self, name: &str, args: Value) -> Result<Value, McpError> {
        if tool_by_name(name).is_none() {
            return Err(McpError::new(
                ErrorCode::InvalidRequest,
                format!("Unknown tool: {}", name),
            ));
        }
        let args = if args.is_null() {
            Value::Object(Default::default())
        } else {
            args
        };
        validate_tool_args(name, &args)?;

        let handler = self.app.handler_for(name).ok_or_else(|| {
            McpError::new(
                ErrorCode::InternalError,
                format!("Tool {} has no handler wired", name),
            )
        })?;

        match handler.handle(name, &args).await {
            Ok(result) => {
                let text = result
                    .get("text")
                    .and_then(|v| v.as_str())
                    .unwrap_or_default()
                    .to_string();
                let mut structured = serde_json::Map::new();
                if let Value::Object(map) = &result {
                    for (key, value) in map {
                        if key != "text" {
                            structured.insert(key.clone(), value.clone());
                        }
                    }
                }
                let mut payload = serde_json::json!({
                    "content": [ { "type": "text", "text": text } ],
                    "isError": false,
                });
                if !structured.is_empty() {
                    if let Value::Object(map) = &mut payload {
                        map.insert(
                            "structuredContent".to_string(),
                            Value::Object(structured),
                        );
                    }
                }
                Ok(payload)
            }
            Err(err) => Ok(serde_json::json!({
                "content": [ { "type": "text", "text": render_tool_error(name, &err) } ],
                "isError": true,
            })),
        }
    }

    pub async fn run_stdio(&self) -> Result<(), ToolError> {
        let stdin = tokio::io::stdin();
        let mut reader = BufReader::new(stdin).lines();

        let (out_tx, mut out_rx) = mpsc::channel::<String>(256);
        let writer_task = tokio::spawn(async move {
            let mut writer = BufWriter::new(tokio::io::stdout());
            while let Some(line) = out_rx.recv().await {
                if writer.write_all(line.as_bytes()).await.is_err() {
                    break;
                }
                if writer.write_all(b"\n").await.is_err() {
                    break;
                }
                if writer.flush().await.is_err() {
                    break;
                }
            }
        });

        // Forward broker events as one-way notifications. A full channel
        // drops the event rather than stalling the emitter.
        let mut event_rx = self.app.events.subscribe();
        let event_tx = out_tx.clone();
        let event_task = tokio::spawn(async move {
            loop {
                match event_rx.recv().await {
                    Ok(event) => {
                        let params = serde_json::to_value(&event).unwrap_or(Value::Null);
                        let notification = JsonRpcNotification::new(EVENT_METHOD, params);
                        if let Ok(payload) = serde_json::to_string(&notification) {
                            let _ = event_tx.try_send(payload);
                        }
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                }
            }
        });

        while let Some(line) = reader
            .next_line()
            .await
            .map_err(|err| ToolError::internal(err.to_string()))?
        {
            let trimmed = line.trim();
            if trimmed.is_empty() {
                continue;
            }

            let parsed: Value = match serde_json::from_str(trimmed) {
                Ok(value) => value,
                Err(_) => {
                    self.send_response(
                        &out_tx,
                        JsonRpcResponse::failure(
                            Value::Null,
                            ErrorCode::ParseError.as_i32(),
                            "Parse error".to_string(),
                        ),
                    )
                    .await;
                    continue;
                }
            };

            let request: JsonRpcRequest = match serde_json::from_value(parsed) {
                Ok(request) => request,
                Err(_) => {
                    self.send_response(
                        &out_tx,
                        JsonRpcResponse::failure(
                            Value::Null,
                            ErrorCode::InvalidRequest.as_i32(),
                            "Invalid request".to_string(),
                        ),
                    )
                    .await;
                    continue;
                }
            };

            let response = match request.method.as_str() {
                _ if request.method.starts_with("notifications/") && request.id.is_none() => None,
                "initialize" => match request.id.clone() {
                    Some(id) => Some(JsonRpcResponse::success(id, self.handle_initialize().await)),
                    None => None,
                },
                "tools/list" => match request.id.clone() {
                    Some(id) => Some(JsonRpcResponse::success(id, self.handle_tools_list().await)),
                    None => None,
                },
                "tools/call" => match request.id.clone() {
                    Some(id) => {
                        let params = request.params.as_object().cloned().unwrap_or_default();
                        let name = params.get("name").and_then(|v| v.as_str()).unwrap_or("");
                        if name.is_empty() {
                            Some(JsonRpcResponse::failure(
                                id,
                                ErrorCode::InvalidParams.as_i32(),
                                "Missing tool name".to_string(),
                            ))
                        } else {
                            let args = params.get("arguments").cloned().unwrap_or(Value::Null);
                            let call = match self.handle_tools_call(name, args).await {
                                Ok(result) => JsonRpcResponse::success(id, result),
                                Err(err) => {
                                    JsonRpcResponse::failure(id, err.code.as_i32(), err.message)
                                }
                            };
                            Some(call)
                        }
                    }
                    None => None,
                },
                _ => request.id.clone().map(|id| {
                    JsonRpcResponse::failure(
                        id,
                        ErrorCode::MethodNotFound.as_i32(),
                        "Method not found".to_string(),
                    )
                }),
            };

            if let Some(response) = response {
                self.send_response(&out_tx, response).await;
            }
        }

        event_task.abort();
        drop(out_tx);
        let _ = writer_task.await;
        Ok(())
    }

    async fn send_response(&self, out_tx: &mpsc::Sender<String>, response: JsonRpcResponse) {
        if let Ok(payload) = serde_json::to_string(&response) {
            let _ = out_tx.send(payload).await;
        }
    }
}

fn render_tool_error(tool: &str, err: &ToolError) -> String {
    let kind = serde_json::to_value(err.kind)
        .ok()
        .and_then(|v| v.as_str().map(|s| s.to_string()))
        .unwrap_or_else(|| "internal".to_string());
    let mut lines = vec![format!("{} failed ({}): {}", tool, kind, err.message)];
    if let Some(hint) = &err.hint {
        lines.push(format!("Hint: {}", hint));
    }
    lines.join("\n")
}

pub async fn run_stdio(app: Arc<App>) -> Result<(), ToolError> {
    McpServer::new(app).run_stdio().await
}
