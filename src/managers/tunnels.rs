use crate::errors::ToolError;
use crate::managers::{opt_str, text_result, unknown_tool, ToolHandler};
use crate::services::logger::Logger;
use crate::services::tunnels::TunnelManager;
use crate::services::validation::Validation;
use async_trait::async_trait;
use serde_json::Value;
use std::sync::Arc;

/// Tools: createTunnel, closeTunnel, listTunnels.
pub struct TunnelToolManager {
    logger: Logger,
    validation: Validation,
    tunnels: Arc<TunnelManager>,
}

impl TunnelToolManager {
    pub fn new(logger: Logger, validation: Validation, tunnels: Arc<TunnelManager>) -> Self {
        Self {
            logger: logger.child("tunnel-tools"),
            validation,
            tunnels,
        }
    }

    async fn create(&self, args: &Value) -> Result<Value, ToolError> {
        let connection_id = self.validation.ensure_string(
            args.get("connectionId").unwrap_or(&Value::Null),
            "connectionId",
            true,
        )?;
        let local_port = self.validation.ensure_port(args.get("localPort"), None)?;
        let remote_host = self.validation.ensure_string(
            args.get("remoteHost").unwrap_or(&Value::Null),
            "remoteHost",
            true,
        )?;
        let remote_port = self.validation.ensure_port(args.get("remotePort"), None)?;
        let record = self
            .tunnels
            .create(
                &connection_id,
                local_port,
                &remote_host,
                remote_port,
                opt_str(args, "description"),
            )
            .await?;
        self.logger.info(
            "tunnel created",
            Some(&serde_json::json!({"tunnel_id": record.id})),
        );
        let mut result = text_result(format!(
            "Tunnel {}: 127.0.0.1:{} -> {}:{}",
            record.id, local_port, remote_host, remote_port
        ));
        if let Value::Object(map) = &mut result {
            map.insert("tunnelId".to_string(), Value::String(record.id.clone()));
            map.insert(
                "tunnel".to_string(),
                serde_json::to_value(&record).unwrap_or(Value::Null),
            );
        }
        Ok(result)
    }

    fn close(&self, args: &Value) -> Result<Value, ToolError> {
        let id = self.validation.ensure_string(
            args.get("tunnelId").unwrap_or(&Value::Null),
            "tunnelId",
            true,
        )?;
        if self.tunnels.close(&id) {
            Ok(text_result(format!("Tunnel {} closed", id)))
        } else {
            Ok(text_result(format!("Tunnel {} was not open", id)))
        }
    }

    fn list(&self) -> Result<Value, ToolError> {
        let tunnels = self.tunnels.list();
        if tunnels.is_empty() {
            return Ok(text_result("No tunnels"));
        }
        let lines: Vec<String> = tunnels
            .iter()
            .map(|t| {
                format!(
                    "{}  127.0.0.1:{} -> {}:{}  pairs: {}{}",
                    t.get("id").and_then(|v| v.as_str()).unwrap_or(""),
                    t.get("localPort").and_then(|v| v.as_u64()).unwrap_or(0),
                    t.get("remoteHost").and_then(|v| v.as_str()).unwrap_or(""),
                    t.get("remotePort").and_then(|v| v.as_u64()).unwrap_or(0),
                    t.get("livePairs").and_then(|v| v.as_u64()).unwrap_or(0),
                    t.get("description")
                        .and_then(|v| v.as_str())
                        .map(|d| format!("  ({})", d))
                        .unwrap_or_default(),
                )
            })
            .collect();
        let mut result = text_result(lines.join("\n"));
        if let Value::Object(map) = &mut result {
            map.insert("tunnels".to_string(), Value::Array(tunnels));
        }
        Ok(result)
    }
}

#[async_trait]
impl ToolHandler for TunnelToolManager {
    async fn handle(&self, tool: &str, args: &Value) -> Result<Value, ToolError> {
        match tool {
            "createTunnel" => self.create(args).await,
            "closeTunnel" => self.close(args),
            "listTunnels" => self.list(),
            _ => Err(unknown_tool(tool)),
        }
    }
}
