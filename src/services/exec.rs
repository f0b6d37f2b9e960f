use crate::constants::{self, network, tmux as tmux_constants};
use crate::errors::ToolError;
use crate::services::context::{build_exec, ContainerContext};
use crate::services::credentials::CredentialStore;
use crate::services::logger::Logger;
use crate::services::registry::{ConnectionHandle, ConnectionRegistry};
use crate::services::transport::{exec_on_session, ExecOutput};
use crate::utils::docker_cmd::{parse_command_line, DockerExecSpec, ParsedCommand};
use crate::utils::redact::redact_command;
use crate::utils::shellwords::{quote_if_needed, shell_quote, tokenize};
use crate::utils::tmux_cmd::{
    self, is_blocked_process_state, is_blocking_pane_command, parse_pane_probe, TmuxKind,
};
use once_cell::sync::Lazy;
use regex::Regex;
use ssh2::Session;
use std::sync::Arc;
use std::time::Duration;

static SUDO_TOKEN: Lazy<Regex> = Lazy::new(|| Regex::new(r"\bsudo\b").expect("sudo regex"));

#[derive(Debug, Clone, Default)]
pub struct ExecOptions {
    pub cwd: Option<String>,
    pub timeout_ms: Option<u64>,
    pub force: bool,
}

#[derive(Debug, Clone)]
pub struct CommandOutcome {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: i64,
    pub duration_ms: u64,
    /// Tmux-shaped rendering that replaces raw stdout in the final text.
    pub enriched: Option<String>,
}

impl CommandOutcome {
    fn from_output(output: ExecOutput) -> Self {
        Self {
            stdout: output.stdout,
            stderr: output.stderr,
            exit_code: output.exit_code,
            duration_ms: output.duration_ms,
            enriched: None,
        }
    }
}

/// Dispatches one-shot commands: Docker context threading, sudo password
/// feeding, tmux pre-flight checks and output enrichment, cwd tracking.
pub struct CommandEngine {
    logger: Logger,
    registry: Arc<ConnectionRegistry>,
    credentials: Arc<CredentialStore>,
    context: Arc<ContainerContext>,
}

impl CommandEngine {
    pub fn new(
        logger: Logger,
        registry: Arc<ConnectionRegistry>,
        credentials: Arc<CredentialStore>,
        context: Arc<ContainerContext>,
    ) -> Self {
        Self {
            logger: logger.child("exec"),
            registry,
            credentials,
            context,
        }
    }

    pub async fn execute(
        &self,
        connection_id: &str,
        command: &str,
        opts: ExecOptions,
    ) -> Result<CommandOutcome, ToolError> {
        let (handle, session) = self.registry.connected_session(connection_id)?;
        handle.touch();
        // One in-flight command per transport; capture-send-capture sequences
        // stay a single logical operation.
        let _exec_guard = handle.exec_lock.lock().await;
        self.logger.debug(
            "execute",
            Some(&serde_json::json!({
                "connection_id": connection_id,
                "command": redact_command(command),
            })),
        );

        let timeout_ms = opts
            .timeout_ms
            .unwrap_or_else(constants::resolve_command_timeout_ms);

        match parse_command_line(command) {
            ParsedCommand::Compound {
                exec_segments,
                regular_segments,
                needs_container_context: true,
                ..
            } => {
                self.run_compound_docker(
                    &handle,
                    &session,
                    exec_segments,
                    regular_segments,
                    &opts,
                    timeout_ms,
                )
                .await
            }
            ParsedCommand::DockerExec { spec } => {
                let rewritten = self.apply_sudo(&handle, command);
                let output = self
                    .run_shell(&handle.id, &session, &rewritten, opts.cwd.as_deref(), timeout_ms)
                    .await?;
                if output.exit_code == 0 {
                    self.context.set_context(&handle.id, &spec);
                }
                Ok(CommandOutcome::from_output(output))
            }
            ParsedCommand::Regular { command: plain } => {
                if let Some(active) = self.context.active_container(&handle.id) {
                    let wrapped =
                        build_exec(&active.container, &plain, Some(&active), false);
                    let rewritten = self.apply_sudo(&handle, &wrapped);
                    let output = self
                        .run_shell(&handle.id, &session, &rewritten, opts.cwd.as_deref(), timeout_ms)
                        .await?;
                    if output.exit_code == 0 {
                        if let Some(session_state) =
                            self.context.get_session(&handle.id, &active.container)
                        {
                            let spec = DockerExecSpec {
                                raw: wrapped,
                                container: active.container.clone(),
                                inner_command: plain,
                                workdir: session_state.working_directory.clone(),
                                user: session_state.user.clone(),
                                env: session_state.env.clone(),
                                passthrough_flags: Vec::new(),
                            };
                            self.context.set_context(&handle.id, &spec);
                        }
                    }
                    Ok(CommandOutcome::from_output(output))
                } else {
                    self.run_plain(&handle, &session, &plain, &opts, timeout_ms)
                        .await
                }
            }
            ParsedCommand::DockerRun { command: raw }
            | ParsedCommand::Compound { command: raw, .. } => {
                self.run_plain(&handle, &session, &raw, &opts, timeout_ms).await
            }
        }
    }

    /// Run a command directly on the host, skipping Docker context wrapping
    /// and tmux handling. Internal probes (`docker ps`, diagnostics) use
    /// this so an active container never swallows them.
    pub async fn run_host(
        &self,
        connection_id: &str,
        command: &str,
        timeout_ms: u64,
    ) -> Result<ExecOutput, ToolError> {
        let (handle, session) = self.registry.connected_session(connection_id)?;
        handle.touch();
        let _exec_guard = handle.exec_lock.lock().await;
        self.run_shell(&handle.id, &session, command, None, timeout_ms).await
    }

    /// Plain path: sudo rewrite, tmux safety, execution, cwd refresh, tmux
    /// enrichment.
    async fn run_plain(
        &self,
        handle: &Arc<ConnectionHandle>,
        session: &Arc<Session>,
        command: &str,
        opts: &ExecOptions,
        timeout_ms: u64,
    ) -> Result<CommandOutcome, ToolError> {
        let rewritten = self.apply_sudo(handle, command);
        let tmux_kind = tmux_cmd::classify(command);

        let mut before_capture = None;
        if let Some(TmuxKind::SendKeys {
            target,
            presses_enter,
        }) = &tmux_kind
        {
            if *presses_enter && !opts.force {
                self.tmux_preflight(&handle.id, session, target).await?;
            }
            before_capture = self.capture_pane(&handle.id, session, target).await.ok();
        }

        let output = self
            .run_shell(&handle.id, session, &rewritten, opts.cwd.as_deref(), timeout_ms)
            .await?;

        if output.exit_code == 0 {
            if let Some(probe) = cd_probe_command(handle.current_directory().as_deref(), command) {
                if let Ok(pwd_out) = self
                    .run_shell(&handle.id, session, &probe, None, network::TIMEOUT_PROBE_MS)
                    .await
                {
                    if pwd_out.exit_code == 0 {
                        let dir = pwd_out.stdout.trim().to_string();
                        if !dir.is_empty() {
                            handle.set_current_directory(Some(dir));
                        }
                    }
                }
            }
        }

        let mut outcome = CommandOutcome::from_output(output);
        if outcome.exit_code == 0 {
            outcome.enriched = match &tmux_kind {
                Some(TmuxKind::SendKeys { target, .. }) => {
                    tokio::time::sleep(Duration::from_millis(tmux_constants::SETTLE_DELAY_MS))
                        .await;
                    let after = self
                        .capture_pane(&handle.id, session, target)
                        .await
                        .unwrap_or_default();
                    let before = before_capture.unwrap_or_default();
                    Some(tmux_cmd::render_send_keys_output(
                        &before,
                        &after,
                        tmux_constants::CONTEXT_WINDOW_LINES,
                    ))
                }
                Some(kind) => tmux_cmd::summarize(kind, outcome.exit_code, &outcome.stdout),
                None => None,
            };
        }
        Ok(outcome)
    }

    /// Compound lines mixing `docker exec` and regular segments: thread the
    /// container context through each exec segment, then run the leftover
    /// regular segments inside the last container.
    async fn run_compound_docker(
        &self,
        handle: &Arc<ConnectionHandle>,
        session: &Arc<Session>,
        exec_segments: Vec<DockerExecSpec>,
        regular_segments: Vec<String>,
        opts: &ExecOptions,
        timeout_ms: u64,
    ) -> Result<CommandOutcome, ToolError> {
        let mut stdout = String::new();
        let mut stderr = String::new();
        let mut exit_code = 0;
        let mut duration_ms = 0;
        let mut last_container = None;

        for spec in &exec_segments {
            let output = self
                .run_shell(&handle.id, session, &spec.raw, opts.cwd.as_deref(), timeout_ms)
                .await?;
            stdout.push_str(&output.stdout);
            stderr.push_str(&output.stderr);
            exit_code = output.exit_code;
            duration_ms += output.duration_ms;
            if output.exit_code == 0 {
                self.context.set_context(&handle.id, spec);
                last_container = Some(spec.container.clone());
            }
        }

        if exit_code == 0 && !regular_segments.is_empty() {
            if let Some(container) = last_container {
                let tracked = self.context.get_session(&handle.id, &container);
                let joined = regular_segments.join(" && ");
                let inner = format!("sh -c {}", shell_quote(&joined));
                let wrapped = build_exec(&container, &inner, tracked.as_ref(), false);
                let output = self
                    .run_shell(&handle.id, session, &wrapped, opts.cwd.as_deref(), timeout_ms)
                    .await?;
                stdout.push_str(&output.stdout);
                stderr.push_str(&output.stderr);
                exit_code = output.exit_code;
                duration_ms += output.duration_ms;
            }
        }

        Ok(CommandOutcome {
            stdout,
            stderr,
            exit_code,
            duration_ms,
            enriched: None,
        })
    }

    /// Abort a send-keys when the target pane is occupied by an interactive
    /// or uninterruptible process. Nothing is sent on a block.
    async fn tmux_preflight(
        &self,
        connection_id: &str,
        session: &Arc<Session>,
        target: &str,
    ) -> Result<(), ToolError> {
        let probe_cmd = format!(
            "tmux list-panes -t {} -F \"#{{pane_pid}} #{{pane_current_command}}\"",
            shell_quote(target)
        );
        let probe = self
            .run_shell(connection_id, session, &probe_cmd, None, network::TIMEOUT_PROBE_MS)
            .await?;
        if probe.exit_code != 0 {
            // No such session: let the real send-keys surface tmux's error.
            return Ok(());
        }
        let Some(pane) = parse_pane_probe(&probe.stdout) else {
            return Ok(());
        };

        let state_out = self
            .run_shell(
                connection_id,
                session,
                &format!("ps -o state= -p {}", pane.pid),
                None,
                network::TIMEOUT_PROBE_MS,
            )
            .await?;
        let state = state_out.stdout.trim().to_string();

        let children_out = self
            .run_shell(
                connection_id,
                session,
                &format!("pgrep -P {}", pane.pid),
                None,
                network::TIMEOUT_PROBE_MS,
            )
            .await?;
        let has_children =
            children_out.exit_code == 0 && !children_out.stdout.trim().is_empty();

        let blocked = is_blocked_process_state(&state)
            || is_blocking_pane_command(&pane.command)
            || has_children;
        if !blocked {
            return Ok(());
        }

        let capture_cmd = format!(
            "tmux capture-pane -p -t {} -S -{}",
            shell_quote(target),
            tmux_constants::BLOCKED_CAPTURE_LINES
        );
        let capture = self
            .run_shell(connection_id, session, &capture_cmd, None, network::TIMEOUT_PROBE_MS)
            .await
            .map(|out| out.stdout)
            .unwrap_or_default();

        Err(ToolError::tmux_blocked(format!(
            "tmux send-keys blocked: pane '{}' is running '{}' (ps: {} {}).\nRecent pane output:\n{}\nPass force: true to send the keys anyway.",
            target,
            pane.command,
            pane.pid,
            state,
            capture.trim_end()
        ))
        .with_details(serde_json::json!({
            "target": target,
            "panePid": pane.pid,
            "paneCommand": pane.command,
            "processState": state,
            "hasChildren": has_children,
        })))
    }

    async fn capture_pane(
        &self,
        connection_id: &str,
        session: &Arc<Session>,
        target: &str,
    ) -> Result<String, ToolError> {
        let cmd = format!("tmux capture-pane -p -t {}", shell_quote(target));
        let out = self
            .run_shell(connection_id, session, &cmd, None, network::TIMEOUT_PROBE_MS)
            .await?;
        if out.exit_code != 0 {
            return Err(ToolError::command_failed("tmux capture-pane failed"));
        }
        Ok(out.stdout)
    }

    fn apply_sudo(&self, handle: &Arc<ConnectionHandle>, command: &str) -> String {
        if !SUDO_TOKEN.is_match(command) {
            return command.to_string();
        }
        let password = handle
            .sudo_password()
            .or_else(|| self.credentials.load(&handle.id).password);
        match password {
            Some(password) => rewrite_sudo(command, &password),
            None => command.to_string(),
        }
    }

    async fn run_shell(
        &self,
        connection_id: &str,
        session: &Arc<Session>,
        command: &str,
        cwd: Option<&str>,
        timeout_ms: u64,
    ) -> Result<ExecOutput, ToolError> {
        let full = match cwd {
            Some(cwd) => format!("cd {} && {}", shell_quote(cwd), command),
            None => command.to_string(),
        };
        let session = session.clone();
        let result = tokio::task::spawn_blocking(move || exec_on_session(&session, &full, timeout_ms))
            .await
            .map_err(|_| ToolError::internal("SSH exec task failed"))?;
        if let Err(err) = &result {
            self.note_transport_failure(connection_id, err);
        }
        result
    }

    /// Channel I/O failures mean the transport itself is gone; hand the
    /// connection to the reconnect loop before surfacing the error.
    fn note_transport_failure(&self, connection_id: &str, err: &ToolError) {
        if matches!(
            err.kind,
            crate::errors::ToolErrorKind::Internal | crate::errors::ToolErrorKind::Retryable
        ) {
            self.registry.mark_transport_error(connection_id, &err.message);
        }
    }
}

/// Feed the stored password to every sudo in the line over stdin. The
/// password never appears in logs; `2>/dev/null` swallows the prompt echo.
pub fn rewrite_sudo(command: &str, password: &str) -> String {
    let rewritten = SUDO_TOKEN.replace_all(command, "sudo -S");
    let escaped = password
        .replace('\\', "\\\\")
        .replace('"', "\\\"")
        .replace('$', "\\$")
        .replace('`', "\\`");
    format!("echo \"{}\" | {} 2>/dev/null", escaped, rewritten)
}

/// Build the `pwd` refresh probe for commands that change directory. The
/// exec channel is stateless, so the probe replays the `cd` target against
/// the tracked directory instead of trusting the dead shell.
pub fn cd_probe_command(current_directory: Option<&str>, command: &str) -> Option<String> {
    let trimmed = command.trim_start();
    if !trimmed.starts_with("cd ") && trimmed != "cd" {
        return None;
    }
    let first_segment = crate::utils::shellwords::split_unquoted(trimmed)
        .into_iter()
        .next()?;
    let tokens = tokenize(&first_segment);
    let target = tokens.get(1).cloned();
    let target_part = match target {
        Some(target) => format!("cd {} && pwd", quote_if_needed(&target)),
        None => "cd && pwd".to_string(),
    };
    Some(match current_directory {
        Some(current) => format!("cd {} 2>/dev/null; {}", shell_quote(current), target_part),
        None => target_part,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sudo_rewrite_pipes_password_and_silences_prompt() {
        assert_eq!(
            rewrite_sudo("sudo -n id", "p"),
            "echo \"p\" | sudo -S -n id 2>/dev/null"
        );
    }

    #[test]
    fn sudo_rewrite_hits_every_token() {
        assert_eq!(
            rewrite_sudo("sudo apt update && sudo apt upgrade", "pw"),
            "echo \"pw\" | sudo -S apt update && sudo -S apt upgrade 2>/dev/null"
        );
    }

    #[test]
    fn sudo_rewrite_escapes_shell_specials_in_password() {
        let out = rewrite_sudo("sudo id", "a\"b$c");
        assert!(out.starts_with("echo \"a\\\"b\\$c\" | sudo -S id"));
    }

    #[test]
    fn sudoers_is_not_a_sudo_token() {
        // Word boundary: "sudoers" must not be rewritten.
        assert!(!SUDO_TOKEN.is_match("cat /etc/sudoers-x"));
        assert!(SUDO_TOKEN.is_match("sudo cat /etc/sudoers"));
    }

    #[test]
    fn cd_probe_resolves_relative_to_tracked_directory() {
        let probe = cd_probe_command(Some("/home/u"), "cd /tmp").unwrap();
        assert_eq!(probe, "cd '/home/u' 2>/dev/null; cd /tmp && pwd");
        let probe = cd_probe_command(None, "cd work && make").unwrap();
        assert_eq!(probe, "cd work && pwd");
    }

    #[test]
    fn non_cd_commands_have_no_probe() {
        assert!(cd_probe_command(None, "ls -la").is_none());
        assert!(cd_probe_command(None, "cdparanoia").is_none());
    }

    #[test]
    fn bare_cd_goes_home() {
        assert_eq!(cd_probe_command(None, "cd").unwrap(), "cd && pwd");
    }
}
