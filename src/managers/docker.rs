use crate::constants::{self, network};
use crate::errors::ToolError;
use crate::managers::{opt_bool, opt_str, text_result, unknown_tool, ToolHandler};
use crate::services::context::{
    build_exec, parse_docker_ps, ContainerContext, ContainerInfo, ContainerSession,
    DOCKER_PS_COMMAND,
};
use crate::services::exec::{CommandEngine, ExecOptions};
use crate::services::logger::Logger;
use crate::services::validation::{read_positive_int, Validation};
use crate::utils::docker_cmd::DockerExecSpec;
use crate::utils::shellwords::{quote_if_needed, shell_quote};
use async_trait::async_trait;
use serde_json::Value;
use std::sync::Arc;

/// Tools: executeCommandInDocker, diagnoseContainerEnvironment,
/// exitContainer, listContainers.
pub struct DockerManager {
    logger: Logger,
    validation: Validation,
    engine: Arc<CommandEngine>,
    context: Arc<ContainerContext>,
}

impl DockerManager {
    pub fn new(
        logger: Logger,
        validation: Validation,
        engine: Arc<CommandEngine>,
        context: Arc<ContainerContext>,
    ) -> Self {
        Self {
            logger: logger.child("docker"),
            validation,
            engine,
            context,
        }
    }

    /// Resolve the remote container list, preferring the 30-second cache.
    async fn containers(
        &self,
        connection_id: &str,
        force_refresh: bool,
    ) -> Result<Vec<ContainerInfo>, ToolError> {
        if !force_refresh {
            if let Some(cached) = self.context.cached_containers(connection_id) {
                return Ok(cached);
            }
        }
        let output = self
            .engine
            .run_host(connection_id, DOCKER_PS_COMMAND, network::TIMEOUT_PROBE_MS)
            .await?;
        if output.exit_code != 0 {
            return Err(ToolError::docker_failed(format!(
                "docker ps failed: {}",
                output.stderr.trim()
            )));
        }
        let containers = parse_docker_ps(&output.stdout);
        self.context
            .store_containers(connection_id, containers.clone());
        Ok(containers)
    }

    async fn ensure_known_container(
        &self,
        connection_id: &str,
        container: &str,
    ) -> Result<(), ToolError> {
        let matches = |list: &[ContainerInfo]| {
            list.iter()
                .any(|c| c.name == container || c.id.starts_with(container))
        };
        if matches(&self.containers(connection_id, false).await?) {
            return Ok(());
        }
        // The cache may predate a freshly started container.
        if matches(&self.containers(connection_id, true).await?) {
            return Ok(());
        }
        Err(ToolError::unknown_container(format!(
            "No container named '{}' on this host",
            container
        ))
        .with_hint("Use listContainers to see what is running."))
    }

    async fn execute_in_docker(&self, args: &Value) -> Result<Value, ToolError> {
        let connection_id = self.require_connection_id(args)?;
        let container = self.validation.ensure_string(
            args.get("containerName").unwrap_or(&Value::Null),
            "containerName",
            true,
        )?;
        let command = self.validation.ensure_string(
            args.get("command").unwrap_or(&Value::Null),
            "command",
            false,
        )?;
        let interactive = opt_bool(args, "interactive").unwrap_or(false);

        self.ensure_known_container(&connection_id, &container).await?;

        let spec = DockerExecSpec {
            raw: String::new(),
            container: container.clone(),
            inner_command: command.clone(),
            workdir: opt_str(args, "workdir"),
            user: opt_str(args, "user"),
            env: Vec::new(),
            passthrough_flags: Vec::new(),
        };
        // Merge the requested overrides onto whatever session is already
        // tracked, without touching the context yet: a failing exec must not
        // become the active container.
        let mut view = self
            .context
            .get_session(&connection_id, &container)
            .unwrap_or_else(|| ContainerSession {
                container: container.clone(),
                working_directory: None,
                env: Vec::new(),
                user: None,
                last_activity: chrono::Utc::now(),
                is_active: true,
            });
        if spec.workdir.is_some() {
            view.working_directory = spec.workdir.clone();
        }
        if spec.user.is_some() {
            view.user = spec.user.clone();
        }
        let built = build_exec(&container, &command, Some(&view), interactive);

        let outcome = self
            .engine
            .execute(
                &connection_id,
                &built,
                ExecOptions {
                    cwd: None,
                    timeout_ms: read_positive_int(args.get("timeout")),
                    force: false,
                },
            )
            .await?;
        if outcome.exit_code == 0 {
            self.context.set_context(&connection_id, &spec);
        }

        let mut text = outcome.stdout.clone();
        if !outcome.stderr.is_empty() {
            if !text.is_empty() && !text.ends_with('\n') {
                text.push('\n');
            }
            text.push_str(&outcome.stderr);
        }
        if outcome.exit_code != 0 {
            if !text.is_empty() && !text.ends_with('\n') {
                text.push('\n');
            }
            text.push_str(&format!("[exit code {}]", outcome.exit_code));
        }
        let mut result = text_result(text);
        if let Value::Object(map) = &mut result {
            map.insert("exitCode".to_string(), Value::Number(outcome.exit_code.into()));
            map.insert("container".to_string(), Value::String(container));
        }
        Ok(result)
    }

    async fn diagnose(&self, args: &Value) -> Result<Value, ToolError> {
        let connection_id = self.require_connection_id(args)?;
        let container = self.validation.ensure_string(
            args.get("containerName").unwrap_or(&Value::Null),
            "containerName",
            true,
        )?;
        self.ensure_known_container(&connection_id, &container).await?;

        let container_q = quote_if_needed(&container);
        let mut probes = vec![
            ("shell", format!("docker exec {} sh -c 'echo ok'", container_q)),
            (
                "os",
                format!(
                    "docker exec {} sh -c 'cat /etc/os-release 2>/dev/null || uname -a'",
                    container_q
                ),
            ),
            ("user", format!("docker exec {} id", container_q)),
            ("workdir", format!("docker exec {} pwd", container_q)),
            (
                "packageManager",
                format!(
                    "docker exec {} sh -c 'command -v apt-get || command -v yum || command -v apk || echo none'",
                    container_q
                ),
            ),
        ];
        if let Some(package) = opt_str(args, "packageName") {
            probes.push((
                "package",
                format!(
                    "docker exec {} sh -c {}",
                    container_q,
                    shell_quote(&format!(
                        "command -v {pkg} || dpkg -s {pkg} 2>/dev/null | head -n 2 || rpm -q {pkg} 2>/dev/null || echo '{pkg}: not found'",
                        pkg = package
                    )),
                ),
            ));
        }

        let mut report = serde_json::Map::new();
        let mut lines = Vec::new();
        for (key, probe) in probes {
            let entry = match self
                .engine
                .run_host(&connection_id, &probe, constants::resolve_command_timeout_ms())
                .await
            {
                Ok(output) => {
                    let text = if output.exit_code == 0 {
                        output.stdout.trim().to_string()
                    } else {
                        format!("(exit {}) {}", output.exit_code, output.stderr.trim())
                    };
                    lines.push(format!("{}: {}", key, text));
                    serde_json::json!({
                        "success": output.exit_code == 0,
                        "output": text,
                    })
                }
                Err(err) => {
                    lines.push(format!("{}: probe failed: {}", key, err.message));
                    serde_json::json!({"success": false, "error": err.message})
                }
            };
            report.insert(key.to_string(), entry);
        }

        let mut result = text_result(format!(
            "Environment of container '{}':\n{}",
            container,
            lines.join("\n")
        ));
        if let Value::Object(map) = &mut result {
            map.insert("report".to_string(), Value::Object(report));
        }
        Ok(result)
    }

    fn exit_container(&self, args: &Value) -> Result<Value, ToolError> {
        let connection_id = self.require_connection_id(args)?;
        let deactivated = self.context.exit_container(&connection_id);
        self.logger.debug(
            "container context cleared",
            Some(&serde_json::json!({
                "connection_id": connection_id,
                "deactivated": deactivated,
            })),
        );
        if deactivated == 0 {
            Ok(text_result("No active container context"))
        } else {
            Ok(text_result(format!(
                "Left container context ({} session(s) deactivated); commands now run on the host",
                deactivated
            )))
        }
    }

    async fn list_containers(&self, args: &Value) -> Result<Value, ToolError> {
        let connection_id = self.require_connection_id(args)?;
        let force = opt_bool(args, "forceRefresh").unwrap_or(false);
        let containers = self.containers(&connection_id, force).await?;
        if containers.is_empty() {
            return Ok(text_result("No containers on this host"));
        }
        let active = self
            .context
            .active_container(&connection_id)
            .map(|s| s.container);
        let lines: Vec<String> = containers
            .iter()
            .map(|c| {
                format!(
                    "{}{}  {}  {}  {}",
                    if active.as_deref() == Some(c.name.as_str()) {
                        "* "
                    } else {
                        "  "
                    },
                    c.name,
                    c.id,
                    c.image,
                    c.status,
                )
            })
            .collect();
        let mut result = text_result(lines.join("\n"));
        if let Value::Object(map) = &mut result {
            map.insert(
                "containers".to_string(),
                serde_json::to_value(&containers).unwrap_or(Value::Null),
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
impl ToolHandler for DockerManager {
    async fn handle(&self, tool: &str, args: &Value) -> Result<Value, ToolError> {
        match tool {
            "executeCommandInDocker" => self.execute_in_docker(args).await,
            "diagnoseContainerEnvironment" => self.diagnose(args).await,
            "exitContainer" => self.exit_container(args),
            "listContainers" => self.list_containers(args).await,
            _ => Err(unknown_tool(tool)),
        }
    }
}
