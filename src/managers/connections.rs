use crate::constants;
use crate::errors::ToolError;
use crate::managers::{opt_bool, opt_str, text_result, unknown_tool, ToolHandler};
use crate::services::logger::Logger;
use crate::services::registry::{ConnectParams, ConnectionRegistry, ReconnectPolicy};
use crate::services::validation::Validation;
use crate::utils::redact::redact_args;
use async_trait::async_trait;
use serde_json::Value;
use std::sync::Arc;

/// Tools: connect, disconnect, getConnection, deleteConnection,
/// listConnections.
pub struct ConnectionManager {
    logger: Logger,
    validation: Validation,
    registry: Arc<ConnectionRegistry>,
}

impl ConnectionManager {
    pub fn new(logger: Logger, validation: Validation, registry: Arc<ConnectionRegistry>) -> Self {
        Self {
            logger: logger.child("connections"),
            validation,
            registry,
        }
    }

    async fn connect(&self, args: &Value) -> Result<Value, ToolError> {
        let host = self
            .validation
            .ensure_string(args.get("host").unwrap_or(&Value::Null), "host", true)?;
        let username = self.validation.ensure_string(
            args.get("username").unwrap_or(&Value::Null),
            "username",
            true,
        )?;
        let port = self
            .validation
            .ensure_port(args.get("port"), Some(constants::resolve_default_port()))?;
        let tags = args
            .get("tags")
            .and_then(|v| v.as_array())
            .map(|items| {
                items
                    .iter()
                    .filter_map(|v| v.as_str().map(|s| s.to_string()))
                    .collect()
            })
            .unwrap_or_default();

        self.logger
            .debug("connect", Some(&redact_args(args)));

        let params = ConnectParams {
            host: host.clone(),
            username: username.clone(),
            port,
            password: opt_str(args, "password"),
            private_key: opt_str(args, "privateKey"),
            passphrase: opt_str(args, "passphrase"),
            name: opt_str(args, "name"),
            remember_password: opt_bool(args, "rememberPassword").unwrap_or(true),
            tags,
            reconnect: ReconnectPolicy::default(),
        };
        let summary = self.registry.connect(params).await?;
        let mut result = text_result(format!(
            "Connected to {}@{}:{} (connection id {})",
            username, host, port, summary.id
        ));
        if let Value::Object(map) = &mut result {
            map.insert("connectionId".to_string(), Value::String(summary.id.clone()));
            map.insert(
                "connection".to_string(),
                serde_json::to_value(&summary).unwrap_or(Value::Null),
            );
        }
        Ok(result)
    }

    async fn disconnect(&self, args: &Value) -> Result<Value, ToolError> {
        let id = self.require_connection_id(args)?;
        if self.registry.disconnect(&id).await? {
            Ok(text_result(format!("Disconnected connection {}", id)))
        } else {
            Ok(text_result(format!("Connection {} was not connected", id)))
        }
    }

    async fn delete(&self, args: &Value) -> Result<Value, ToolError> {
        let id = self.require_connection_id(args)?;
        if self.registry.delete(&id).await? {
            Ok(text_result(format!(
                "Deleted connection {} and its stored credentials",
                id
            )))
        } else {
            Ok(text_result(format!("Connection {} was not known", id)))
        }
    }

    fn get(&self, args: &Value) -> Result<Value, ToolError> {
        let id = self.require_connection_id(args)?;
        let summary = self
            .registry
            .get(&id)
            .ok_or_else(|| ToolError::not_found(format!("Unknown connection: {}", id)))?;
        let text = format!(
            "{}@{}:{} [{}] {}",
            summary.username,
            summary.host,
            summary.port,
            summary.state.as_str(),
            summary.current_directory.as_deref().unwrap_or("-"),
        );
        let mut result = text_result(text);
        if let Value::Object(map) = &mut result {
            map.insert(
                "connection".to_string(),
                serde_json::to_value(&summary).unwrap_or(Value::Null),
            );
        }
        Ok(result)
    }

    fn list(&self) -> Result<Value, ToolError> {
        let summaries = self.registry.list();
        if summaries.is_empty() {
            return Ok(text_result("No connections"));
        }
        let lines: Vec<String> = summaries
            .iter()
            .map(|s| {
                format!(
                    "{}  {}@{}:{}  [{}]{}",
                    s.id,
                    s.username,
                    s.host,
                    s.port,
                    s.state.as_str(),
                    s.name
                        .as_ref()
                        .map(|n| format!("  ({})", n))
                        .unwrap_or_default(),
                )
            })
            .collect();
        let mut result = text_result(lines.join("\n"));
        if let Value::Object(map) = &mut result {
            map.insert(
                "connections".to_string(),
                serde_json::to_value(&summaries).unwrap_or(Value::Null),
            );
        }
        Ok(result)
    }

    fn require_connection_id(&self, args: &Value) -> Result<String, ToolError> {
        self.validation.ensure_string(
            args.get("connectionId").unwrap_or(&Value::Null),
            "connectionId",
            true,
        )
    }
}

#[async_trait]
impl ToolHandler for ConnectionManager {
    async fn handle(&self, tool: &str, args: &Value) -> Result<Value, ToolError> {
        match tool {
            "connect" => self.connect(args).await,
            "disconnect" => self.disconnect(args).await,
            "deleteConnection" => self.delete(args).await,
            "getConnection" => self.get(args),
            "listConnections" => self.list(),
            _ => Err(unknown_tool(tool)),
        }
    }
}
