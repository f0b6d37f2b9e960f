use crate::constants::sweep;
use crate::utils::docker_cmd::DockerExecSpec;
use crate::utils::shellwords::quote_if_needed;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use dashmap::DashMap;
use serde::Serialize;
use std::time::{Duration, Instant};

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ContainerSession {
    pub container: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub working_directory: Option<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub env: Vec<(String, String)>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user: Option<String>,
    pub last_activity: DateTime<Utc>,
    pub is_active: bool,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ContainerInfo {
    pub id: String,
    pub image: String,
    pub status: String,
    pub name: String,
    pub running: bool,
}

/// Tracks the "current container" per connection plus a short-lived cache of
/// the remote `docker ps -a` view.
pub struct ContainerContext {
    sessions: DashMap<(String, String), ContainerSession>,
    ps_cache: DashMap<String, (Instant, Vec<ContainerInfo>)>,
}

impl ContainerContext {
    pub fn new() -> Self {
        Self {
            sessions: DashMap::new(),
            ps_cache: DashMap::new(),
        }
    }

    pub fn set_context(&self, connection_id: &str, spec: &DockerExecSpec) {
        let key = (connection_id.to_string(), spec.container.clone());
        let mut session = self
            .sessions
            .get(&key)
            .map(|e| e.value().clone())
            .unwrap_or_else(|| ContainerSession {
                container: spec.container.clone(),
                working_directory: None,
                env: Vec::new(),
                user: None,
                last_activity: Utc::now(),
                is_active: true,
            });
        if spec.workdir.is_some() {
            session.working_directory = spec.workdir.clone();
        }
        if spec.user.is_some() {
            session.user = spec.user.clone();
        }
        for (key_name, value) in &spec.env {
            match session.env.iter_mut().find(|(k, _)| k == key_name) {
                Some(existing) => existing.1 = value.clone(),
                None => session.env.push((key_name.clone(), value.clone())),
            }
        }
        session.last_activity = Utc::now();
        session.is_active = true;
        self.sessions.insert(key, session);
    }

    /// The most recently touched, still-active session for this connection.
    pub fn active_container(&self, connection_id: &str) -> Option<ContainerSession> {
        self.sessions
            .iter()
            .filter(|entry| entry.key().0 == connection_id && entry.value().is_active)
            .max_by_key(|entry| entry.value().last_activity)
            .map(|entry| entry.value().clone())
    }

    pub fn get_session(&self, connection_id: &str, container: &str) -> Option<ContainerSession> {
        self.sessions
            .get(&(connection_id.to_string(), container.to_string()))
            .map(|e| e.value().clone())
    }

    pub fn list_sessions(&self, connection_id: &str) -> Vec<ContainerSession> {
        let mut sessions: Vec<ContainerSession> = self
            .sessions
            .iter()
            .filter(|entry| entry.key().0 == connection_id)
            .map(|entry| entry.value().clone())
            .collect();
        sessions.sort_by(|a, b| b.last_activity.cmp(&a.last_activity));
        sessions
    }

    /// Deactivate every session for the connection so later commands stop
    /// being wrapped. Sessions stay in history.
    pub fn exit_container(&self, connection_id: &str) -> usize {
        let mut deactivated = 0;
        for mut entry in self.sessions.iter_mut() {
            if entry.key().0 == connection_id && entry.value().is_active {
                entry.value_mut().is_active = false;
                deactivated += 1;
            }
        }
        deactivated
    }

    pub fn drop_connection(&self, connection_id: &str) {
        self.sessions.retain(|(conn, _), _| conn != connection_id);
        self.ps_cache.remove(connection_id);
    }

    /// Mark sessions idle past the cutoff as inactive; nothing is deleted.
    pub fn sweep_idle(&self, idle_ms: i64) -> usize {
        let cutoff = Utc::now() - ChronoDuration::milliseconds(idle_ms);
        let mut swept = 0;
        for mut entry in self.sessions.iter_mut() {
            let session = entry.value_mut();
            if session.is_active && session.last_activity < cutoff {
                session.is_active = false;
                swept += 1;
            }
        }
        swept
    }

    pub fn cached_containers(&self, connection_id: &str) -> Option<Vec<ContainerInfo>> {
        let ttl = Duration::from_millis(sweep::CONTAINER_CACHE_TTL_MS);
        self.ps_cache.get(connection_id).and_then(|entry| {
            let (stamp, containers) = entry.value();
            if stamp.elapsed() < ttl {
                Some(containers.clone())
            } else {
                None
            }
        })
    }

    pub fn store_containers(&self, connection_id: &str, containers: Vec<ContainerInfo>) {
        self.ps_cache
            .insert(connection_id.to_string(), (Instant::now(), containers));
    }

    pub fn invalidate_containers(&self, connection_id: &str) {
        self.ps_cache.remove(connection_id);
    }
}

impl Default for ContainerContext {
    fn default() -> Self {
        Self::new()
    }
}

/// Reassemble a `docker exec` invocation from a tracked session. Programmatic
/// execution stays non-interactive unless a TTY is explicitly requested.
pub fn build_exec(
    container: &str,
    inner_command: &str,
    session: Option<&ContainerSession>,
    interactive: bool,
) -> String {
    let mut parts = vec!["docker".to_string(), "exec".to_string()];
    if interactive {
        parts.push("-it".to_string());
    }
    if let Some(session) = session {
        if let Some(workdir) = &session.working_directory {
            parts.push("-w".to_string());
            parts.push(quote_if_needed(workdir));
        }
        if let Some(user) = &session.user {
            parts.push("-u".to_string());
            parts.push(quote_if_needed(user));
        }
        for (key, value) in &session.env {
            parts.push("-e".to_string());
            parts.push(quote_if_needed(&format!("{}={}", key, value)));
        }
    }
    parts.push(quote_if_needed(container));
    parts.push(inner_command.to_string());
    parts.join(" ")
}

/// Parse `docker ps -a` output in the broker's tab-separated format:
/// `ID\tImage\tStatus\tNames`.
pub fn parse_docker_ps(stdout: &str) -> Vec<ContainerInfo> {
    stdout
        .lines()
        .filter(|line| !line.trim().is_empty())
        .filter_map(|line| {
            let mut parts = line.split('\t');
            let id = parts.next()?.trim().to_string();
            let image = parts.next()?.trim().to_string();
            let status = parts.next()?.trim().to_string();
            let name = parts.next().unwrap_or("").trim().to_string();
            let running = status.starts_with("Up");
            Some(ContainerInfo {
                id,
                image,
                status,
                name,
                running,
            })
        })
        .collect()
}

pub const DOCKER_PS_COMMAND: &str =
    "docker ps -a --format '{{.ID}}\\t{{.Image}}\\t{{.Status}}\\t{{.Names}}'";

#[cfg(test)]
mod tests {
    use super::*;
    use crate::utils::docker_cmd::{parse_command_line, ParsedCommand};

    fn exec_spec(line: &str) -> DockerExecSpec {
        match parse_command_line(line) {
            ParsedCommand::DockerExec { spec } => spec,
            other => panic!("expected docker exec, got {:?}", other),
        }
    }

    #[test]
    fn set_context_tracks_workdir_user_and_recency() {
        let ctx = ContainerContext::new();
        ctx.set_context("c1", &exec_spec("docker exec -w /srv -u www-data web ls"));
        let active = ctx.active_container("c1").expect("active container");
        assert_eq!(active.container, "web");
        assert_eq!(active.working_directory.as_deref(), Some("/srv"));
        assert_eq!(active.user.as_deref(), Some("www-data"));
    }

    #[test]
    fn most_recent_session_wins() {
        let ctx = ContainerContext::new();
        ctx.set_context("c1", &exec_spec("docker exec api pwd"));
        std::thread::sleep(std::time::Duration::from_millis(5));
        ctx.set_context("c1", &exec_spec("docker exec web pwd"));
        assert_eq!(ctx.active_container("c1").unwrap().container, "web");
    }

    #[test]
    fn exit_container_clears_active_context_but_keeps_history() {
        let ctx = ContainerContext::new();
        ctx.set_context("c1", &exec_spec("docker exec web ls"));
        assert_eq!(ctx.exit_container("c1"), 1);
        assert!(ctx.active_container("c1").is_none());
        assert_eq!(ctx.list_sessions("c1").len(), 1);
    }

    #[test]
    fn rewrite_matches_tracked_exec_form() {
        let ctx = ContainerContext::new();
        ctx.set_context("c1", &exec_spec("docker exec -w /srv -u www-data web ls"));
        let active = ctx.active_container("c1").unwrap();
        let rewritten = build_exec(&active.container, "ls", Some(&active), false);
        assert_eq!(rewritten, "docker exec -w /srv -u www-data web ls");
    }

    #[test]
    fn sweep_deactivates_idle_sessions() {
        let ctx = ContainerContext::new();
        ctx.set_context("c1", &exec_spec("docker exec web ls"));
        assert_eq!(ctx.sweep_idle(0), 1);
        assert!(ctx.active_container("c1").is_none());
    }

    #[test]
    fn parses_docker_ps_rows() {
        let out =
            "abc123\tnginx:1.25\tUp 2 hours\tweb\ndef456\tredis:7\tExited (0) 1 day ago\tcache\n";
        let containers = parse_docker_ps(out);
        assert_eq!(containers.len(), 2);
        assert!(containers[0].running);
        assert_eq!(containers[0].name, "web");
        assert!(!containers[1].running);
    }
}
