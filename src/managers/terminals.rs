use crate::errors::ToolError;
use crate::managers::{opt_str, opt_u16, text_result, unknown_tool, ToolHandler};
use crate::services::logger::Logger;
use crate::services::terminals::TerminalManager;
use crate::services::validation::Validation;
use async_trait::async_trait;
use serde_json::Value;
use std::sync::Arc;

/// Tools: createTerminalSession, writeToTerminal, resizeTerminal,
/// closeTerminalSession, listTerminalSessions.
pub struct TerminalToolManager {
    logger: Logger,
    validation: Validation,
    terminals: Arc<TerminalManager>,
}

impl TerminalToolManager {
    pub fn new(logger: Logger, validation: Validation, terminals: Arc<TerminalManager>) -> Self {
        Self {
            logger: logger.child("terminal-tools"),
            validation,
            terminals,
        }
    }

    async fn create(&self, args: &Value) -> Result<Value, ToolError> {
        let connection_id = self.validation.ensure_string(
            args.get("connectionId").unwrap_or(&Value::Null),
            "connectionId",
            true,
        )?;
        let record = self
            .terminals
            .create(
                &connection_id,
                opt_u16(args, "rows"),
                opt_u16(args, "cols"),
                opt_str(args, "term"),
            )
            .await?;
        self.logger.info(
            "terminal session created",
            Some(&serde_json::json!({"session_id": record.id})),
        );
        let mut result = text_result(format!(
            "Terminal session {} opened ({}x{}, {})",
            record.id, record.rows, record.cols, record.term
        ));
        if let Value::Object(map) = &mut result {
            map.insert("sessionId".to_string(), Value::String(record.id.clone()));
            map.insert(
                "session".to_string(),
                serde_json::to_value(&record).unwrap_or(Value::Null),
            );
        }
        Ok(result)
    }

    fn write(&self, args: &Value) -> Result<Value, ToolError> {
        let session_id = self.require_session_id(args)?;
        let data = self.validation.ensure_string(
            args.get("data").unwrap_or(&Value::Null),
            "data",
            false,
        )?;
        self.terminals.write(&session_id, data.as_bytes())?;
        let mut result = text_result("ok");
        if let Value::Object(map) = &mut result {
            map.insert("success".to_string(), Value::Bool(true));
        }
        Ok(result)
    }

    fn resize(&self, args: &Value) -> Result<Value, ToolError> {
        let session_id = self.require_session_id(args)?;
        let rows = opt_u16(args, "rows")
            .ok_or_else(|| ToolError::invalid_params("rows must be a positive integer"))?;
        let cols = opt_u16(args, "cols")
            .ok_or_else(|| ToolError::invalid_params("cols must be a positive integer"))?;
        self.terminals.resize(&session_id, rows, cols)?;
        Ok(text_result(format!(
            "Terminal {} resized to {}x{}",
            session_id, rows, cols
        )))
    }

    fn close(&self, args: &Value) -> Result<Value, ToolError> {
        let session_id = self.require_session_id(args)?;
        if self.terminals.close(&session_id) {
            Ok(text_result(format!("Terminal session {} closed", session_id)))
        } else {
            Ok(text_result(format!(
                "Terminal session {} was not open",
                session_id
            )))
        }
    }

    fn list(&self) -> Result<Value, ToolError> {
        let sessions = self.terminals.list();
        if sessions.is_empty() {
            return Ok(text_result("No terminal sessions"));
        }
        let lines: Vec<String> = sessions
            .iter()
            .map(|s| {
                format!(
                    "{}  connection {}  {}x{}  last activity {}",
                    s.get("id").and_then(|v| v.as_str()).unwrap_or(""),
                    s.get("connectionId").and_then(|v| v.as_str()).unwrap_or(""),
                    s.get("rows").and_then(|v| v.as_u64()).unwrap_or(0),
                    s.get("cols").and_then(|v| v.as_u64()).unwrap_or(0),
                    s.get("lastActivity").and_then(|v| v.as_str()).unwrap_or(""),
                )
            })
            .collect();
        let mut result = text_result(lines.join("\n"));
        if let Value::Object(map) = &mut result {
            map.insert("sessions".to_string(), Value::Array(sessions));
        }
        Ok(result)
    }

    fn require_session_id(&self, args: &Value) -> Result<String, ToolError> {
        self.validation.ensure_string(
            args.get("sessionId").unwrap_or(&Value::Null),
            "sessionId",
            true,
        )
    }
}

#[async_trait]
impl ToolHandler for TerminalToolManager {
    async fn handle(&self, tool: &str, args: &Value) -> Result<Value, ToolError> {
        match tool {
            "createTerminalSession" => self.create(args).await,
            "writeToTerminal" => self.write(args),
            "resizeTerminal" => self.resize(args),
            "closeTerminalSession" => self.close(args),
            "listTerminalSessions" => self.list(),
            _ => Err(unknown_tool(tool)),
        }
    }
}
