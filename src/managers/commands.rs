use crate::constants::{limits, network};
use crate::errors::ToolError;
use crate::managers::{opt_bool, opt_str, text_result, unknown_tool, ToolHandler};
use crate::services::background::BackgroundRunner;
use crate::services::exec::{CommandEngine, CommandOutcome, ExecOptions};
use crate::services::logger::Logger;
use crate::services::registry::{ConnectionHandle, ConnectionRegistry};
use crate::services::terminals::TerminalManager;
use crate::services::tunnels::TunnelManager;
use crate::services::validation::{read_positive_int, Validation};
use crate::utils::text::truncate_middle;
use async_trait::async_trait;
use serde_json::Value;
use std::sync::Arc;

/// Tools: executeCommand, backgroundExecute, stopBackground,
/// listBackgroundTasks, stopAllBackgroundTasks, listActiveSessions.
pub struct CommandManager {
    logger: Logger,
    validation: Validation,
    registry: Arc<ConnectionRegistry>,
    engine: Arc<CommandEngine>,
    background: Arc<BackgroundRunner>,
    terminals: Arc<TerminalManager>,
    tunnels: Arc<TunnelManager>,
}

impl CommandManager {
    pub fn new(
        logger: Logger,
        validation: Validation,
        registry: Arc<ConnectionRegistry>,
        engine: Arc<CommandEngine>,
        background: Arc<BackgroundRunner>,
        terminals: Arc<TerminalManager>,
        tunnels: Arc<TunnelManager>,
    ) -> Self {
        Self {
            logger: logger.child("commands"),
            validation,
            registry,
            engine,
            background,
            terminals,
            tunnels,
        }
    }

    async fn execute_command(&self, args: &Value) -> Result<Value, ToolError> {
        let connection_id = self.require_connection_id(args)?;
        let command = self.validation.ensure_string(
            args.get("command").unwrap_or(&Value::Null),
            "command",
            false,
        )?;
        let opts = ExecOptions {
            cwd: opt_str(args, "cwd"),
            timeout_ms: read_positive_int(args.get("timeout")),
            force: opt_bool(args, "force").unwrap_or(false),
        };
        let outcome = self.engine.execute(&connection_id, &command, opts).await?;
        let handle = self.registry.handle(&connection_id)?;
        let text = render_command_result(&handle, &outcome);
        let mut result = text_result(text);
        if let Value::Object(map) = &mut result {
            map.insert("exitCode".to_string(), Value::Number(outcome.exit_code.into()));
        }
        Ok(result)
    }

    async fn background_execute(&self, args: &Value) -> Result<Value, ToolError> {
        let connection_id = self.require_connection_id(args)?;
        let command = self.validation.ensure_string(
            args.get("command").unwrap_or(&Value::Null),
            "command",
            false,
        )?;
        let interval_ms =
            read_positive_int(args.get("interval")).unwrap_or(network::BACKGROUND_INTERVAL_MS);
        let task = self
            .background
            .start(&connection_id, &command, interval_ms, opt_str(args, "cwd"))?;
        self.logger.info(
            "background task started",
            Some(&serde_json::json!({
                "connection_id": connection_id,
                "interval_ms": interval_ms,
            })),
        );
        Ok(text_result(format!(
            "Background task started on {} every {}ms: {}",
            connection_id, task.interval_ms, task.command
        )))
    }

    fn stop_background(&self, args: &Value) -> Result<Value, ToolError> {
        let connection_id = self.require_connection_id(args)?;
        if self.background.stop(&connection_id) {
            Ok(text_result(format!(
                "Background task on {} stopped",
                connection_id
            )))
        } else {
            Ok(text_result(format!(
                "No background task on {}",
                connection_id
            )))
        }
    }

    fn list_background(&self) -> Result<Value, ToolError> {
        let tasks = self.background.list();
        if tasks.is_empty() {
            return Ok(text_result("No background tasks"));
        }
        let lines: Vec<String> = tasks
            .iter()
            .map(|t| {
                format!(
                    "{}  every {}ms  {}  last error: {}",
                    t.get("connectionId").and_then(|v| v.as_str()).unwrap_or(""),
                    t.get("intervalMs").and_then(|v| v.as_u64()).unwrap_or(0),
                    t.get("command").and_then(|v| v.as_str()).unwrap_or(""),
                    t.get("lastError").and_then(|v| v.as_str()).unwrap_or("-"),
                )
            })
            .collect();
        let mut result = text_result(lines.join("\n"));
        if let Value::Object(map) = &mut result {
            map.insert("tasks".to_string(), Value::Array(tasks));
        }
        Ok(result)
    }

    fn stop_all_background(&self) -> Result<Value, ToolError> {
        let stopped = self.background.stop_all();
        Ok(text_result(format!("Stopped {} background tasks", stopped)))
    }

    fn list_active_sessions(&self) -> Result<Value, ToolError> {
        let connections = self.registry.list();
        if connections.is_empty() {
            return Ok(text_result("No active sessions"));
        }
        let lines: Vec<String> = connections
            .iter()
            .map(|summary| {
                format!(
                    "{}  {}@{}:{}  [{}]  terminals: {}  background: {}",
                    summary.id,
                    summary.username,
                    summary.host,
                    summary.port,
                    summary.state.as_str(),
                    self.terminals
                        .list()
                        .iter()
                        .filter(|t| {
                            t.get("connectionId").and_then(|v| v.as_str())
                                == Some(summary.id.as_str())
                        })
                        .count(),
                    if self.background.get(&summary.id).is_some() {
                        "yes"
                    } else {
                        "no"
                    },
                )
            })
            .collect();
        let mut text = lines.join("\n");
        let tunnels = self.tunnels.len();
        if tunnels > 0 {
            text.push_str(&format!("\nActive tunnels: {}", tunnels));
        }
        Ok(text_result(text))
    }

    fn require_connection_id(&self, args: &Value) -> Result<String, ToolError> {
        self.validation.ensure_string(
            args.get("connectionId").unwrap_or(&Value::Null),
            "connectionId",
            true,
        )
    }
}

/// Final rendering: enriched (tmux) or raw output, exit code note, a
/// prompt-style trailer, then middle-out truncation.
pub fn render_command_result(handle: &Arc<ConnectionHandle>, outcome: &CommandOutcome) -> String {
    let mut body = match &outcome.enriched {
        Some(enriched) => enriched.clone(),
        None => {
            let mut text = outcome.stdout.clone();
            if !outcome.stderr.is_empty() {
                if !text.is_empty() && !text.ends_with('\n') {
                    text.push('\n');
                }
                text.push_str(&outcome.stderr);
            }
            text
        }
    };
    if outcome.exit_code != 0 {
        if !body.is_empty() && !body.ends_with('\n') {
            body.push('\n');
        }
        body.push_str(&format!("[exit code {}]", outcome.exit_code));
    }
    if !body.is_empty() && !body.ends_with('\n') {
        body.push('\n');
    }
    body.push_str(&prompt_line(handle));
    truncate_middle(
        &body,
        limits::MAX_RENDERED_CHARS,
        limits::RENDERED_HEAD_CHARS,
        limits::RENDERED_TAIL_CHARS,
    )
}

fn prompt_line(handle: &Arc<ConnectionHandle>) -> String {
    let settings = handle.settings();
    let display = display_directory(
        handle.current_directory().as_deref(),
        handle.home_directory().as_deref(),
    );
    format!("[{}@{} {}]$ ", settings.username, settings.host, display)
}

/// `~` for the login directory, basename otherwise; `~` again when nothing
/// is known yet.
pub fn display_directory(current: Option<&str>, home: Option<&str>) -> String {
    let Some(current) = current else {
        return "~".to_string();
    };
    if Some(current) == home {
        return "~".to_string();
    }
    match current.rsplit('/').find(|part| !part.is_empty()) {
        Some(base) => base.to_string(),
        None => "/".to_string(),
    }
}

#[async_trait]
impl ToolHandler for CommandManager {
    async fn handle(&self, tool: &str, args: &Value) -> Result<Value, ToolError> {
        match tool {
            "executeCommand" => self.execute_command(args).await,
            "backgroundExecute" => self.background_execute(args).await,
            "stopBackground" => self.stop_background(args),
            "listBackgroundTasks" => self.list_background(),
            "stopAllBackgroundTasks" => self.stop_all_background(),
            "listActiveSessions" => self.list_active_sessions(),
            _ => Err(unknown_tool(tool)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::display_directory;

    #[test]
    fn home_directory_renders_as_tilde() {
        assert_eq!(display_directory(Some("/home/u"), Some("/home/u")), "~");
        assert_eq!(display_directory(None, None), "~");
    }

    #[test]
    fn other_directories_render_as_basename() {
        assert_eq!(display_directory(Some("/tmp"), Some("/home/u")), "tmp");
        assert_eq!(
            display_directory(Some("/var/www/html"), Some("/home/u")),
            "html"
        );
        assert_eq!(display_directory(Some("/"), Some("/home/u")), "/");
    }
}
