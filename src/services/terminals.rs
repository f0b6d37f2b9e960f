use crate::errors::ToolError;
use crate::services::credentials::CredentialStore;
use crate::services::events::{BrokerEvent, EventBus};
use crate::services::logger::Logger;
use crate::services::registry::ConnectionRegistry;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use dashmap::DashMap;
use serde::Serialize;
use serde_json::Value;
use std::io::{Read, Write};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tokio::sync::mpsc;

pub const DEFAULT_ROWS: u16 = 24;
pub const DEFAULT_COLS: u16 = 80;
pub const DEFAULT_TERM: &str = "xterm-256color";

const SUDO_PROMPTS: &[&str] = &["[sudo] password for", "Password:", "密码："];

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TerminalRecord {
    pub id: String,
    pub connection_id: String,
    pub rows: u16,
    pub cols: u16,
    pub term: String,
    pub is_active: bool,
    pub start_time: String,
    pub last_activity: String,
}

enum TermCmd {
    Write(Vec<u8>),
    Resize(u16, u16),
    Close,
}

struct TerminalEntry {
    connection_id: String,
    rows: RwLock<u16>,
    cols: RwLock<u16>,
    term: String,
    start_time: DateTime<Utc>,
    last_activity: RwLock<DateTime<Utc>>,
    cmd_tx: mpsc::Sender<TermCmd>,
    sudo_prompt: Arc<AtomicBool>,
}

impl TerminalEntry {
    fn record(&self, id: &str) -> TerminalRecord {
        TerminalRecord {
            id: id.to_string(),
            connection_id: self.connection_id.clone(),
            rows: *self.rows.read().unwrap(),
            cols: *self.cols.read().unwrap(),
            term: self.term.clone(),
            is_active: true,
            start_time: self.start_time.to_rfc3339(),
            last_activity: self.last_activity.read().unwrap().to_rfc3339(),
        }
    }
}

/// Detect a sudo password prompt in the recent output window.
pub fn contains_sudo_prompt(window: &str) -> bool {
    SUDO_PROMPTS.iter().any(|p| window.contains(p))
}

/// Shell channels with a PTY. Every chunk read from the channel is fanned
/// out as a `terminal_data` event; a recognized sudo prompt is answered
/// once from the stored password, and the next orchestrator write clears
/// the prompt flag.
pub struct TerminalManager {
    logger: Logger,
    registry: Arc<ConnectionRegistry>,
    credentials: Arc<CredentialStore>,
    events: EventBus,
    sessions: Arc<DashMap<String, TerminalEntry>>,
}

impl TerminalManager {
    pub fn new(
        logger: Logger,
        registry: Arc<ConnectionRegistry>,
        credentials: Arc<CredentialStore>,
        events: EventBus,
    ) -> Self {
        Self {
            logger: logger.child("terminals"),
            registry,
            credentials,
            events,
            sessions: Arc::new(DashMap::new()),
        }
    }

    pub async fn create(
        &self,
        connection_id: &str,
        rows: Option<u16>,
        cols: Option<u16>,
        term: Option<String>,
    ) -> Result<TerminalRecord, ToolError> {
        let handle = self.registry.handle(connection_id)?;
        let rows = rows.unwrap_or(DEFAULT_ROWS);
        let cols = cols.unwrap_or(DEFAULT_COLS);
        let term = term.unwrap_or_else(|| DEFAULT_TERM.to_string());

        let session = self.registry.open_dedicated_session(connection_id).await?;
        let session_id = uuid::Uuid::new_v4().to_string();
        let (cmd_tx, cmd_rx) = mpsc::channel::<TermCmd>(256);
        let sudo_prompt = Arc::new(AtomicBool::new(false));

        let entry = TerminalEntry {
            connection_id: connection_id.to_string(),
            rows: RwLock::new(rows),
            cols: RwLock::new(cols),
            term: term.clone(),
            start_time: Utc::now(),
            last_activity: RwLock::new(Utc::now()),
            cmd_tx,
            sudo_prompt: sudo_prompt.clone(),
        };
        let record = entry.record(&session_id);
        self.sessions.insert(session_id.clone(), entry);

        let pump = PumpContext {
            session_id: session_id.clone(),
            connection_id: connection_id.to_string(),
            config_password: handle.sudo_password(),
            credentials: self.credentials.clone(),
            events: self.events.clone(),
            logger: self.logger.clone(),
            sessions: self.sessions.clone(),
            sudo_prompt,
        };
        tokio::task::spawn_blocking(move || {
            pump.run(session, cmd_rx, term, rows, cols);
        });

        self.logger.info(
            "terminal created",
            Some(&serde_json::json!({
                "session_id": session_id,
                "connection_id": connection_id,
            })),
        );
        Ok(record)
    }

    pub fn write(&self, session_id: &str, data: &[u8]) -> Result<(), ToolError> {
        let entry = self.entry(session_id)?;
        // An explicit write consumes any pending autofill flag.
        entry.sudo_prompt.store(false, Ordering::Relaxed);
        *entry.last_activity.write().unwrap() = Utc::now();
        entry
            .cmd_tx
            .try_send(TermCmd::Write(data.to_vec()))
            .map_err(|_| ToolError::session_closed("Terminal session is closed"))
    }

    pub fn resize(&self, session_id: &str, rows: u16, cols: u16) -> Result<(), ToolError> {
        let entry = self.entry(session_id)?;
        *entry.rows.write().unwrap() = rows;
        *entry.cols.write().unwrap() = cols;
        *entry.last_activity.write().unwrap() = Utc::now();
        entry
            .cmd_tx
            .try_send(TermCmd::Resize(rows, cols))
            .map_err(|_| ToolError::session_closed("Terminal session is closed"))
    }

    pub fn close(&self, session_id: &str) -> bool {
        match self.sessions.remove(session_id) {
            Some((_, entry)) => {
                let _ = entry.cmd_tx.try_send(TermCmd::Close);
                self.logger.info(
                    "terminal closed",
                    Some(&serde_json::json!({"session_id": session_id})),
                );
                true
            }
            None => false,
        }
    }

    pub fn close_for_connection(&self, connection_id: &str) -> usize {
        let ids: Vec<String> = self
            .sessions
            .iter()
            .filter(|entry| entry.value().connection_id == connection_id)
            .map(|entry| entry.key().clone())
            .collect();
        let mut closed = 0;
        for id in ids {
            if self.close(&id) {
                closed += 1;
            }
        }
        closed
    }

    pub fn get(&self, session_id: &str) -> Option<TerminalRecord> {
        self.sessions.get(session_id).map(|e| e.value().record(session_id))
    }

    pub fn list(&self) -> Vec<Value> {
        let mut sessions: Vec<Value> = self
            .sessions
            .iter()
            .map(|entry| {
                serde_json::to_value(entry.value().record(entry.key())).unwrap_or(Value::Null)
            })
            .collect();
        sessions.sort_by_key(|s| {
            s.get("startTime")
                .and_then(|v| v.as_str())
                .unwrap_or("")
                .to_string()
        });
        sessions
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    /// Auto-close sessions idle past the cutoff.
    pub fn sweep_idle(&self, idle_ms: i64) -> usize {
        let cutoff = Utc::now() - ChronoDuration::milliseconds(idle_ms);
        let stale: Vec<String> = self
            .sessions
            .iter()
            .filter(|entry| *entry.value().last_activity.read().unwrap() < cutoff)
            .map(|entry| entry.key().clone())
            .collect();
        let mut closed = 0;
        for id in stale {
            if self.close(&id) {
                closed += 1;
            }
        }
        closed
    }

    fn entry(
        &self,
        session_id: &str,
    ) -> Result<dashmap::mapref::one::Ref<'_, String, TerminalEntry>, ToolError> {
        self.sessions
            .get(session_id)
            .ok_or_else(|| ToolError::session_closed(format!("Unknown terminal session: {}", session_id)))
    }
}

struct PumpContext {
    session_id: String,
    connection_id: String,
    config_password: Option<String>,
    credentials: Arc<CredentialStore>,
    events: EventBus,
    logger: Logger,
    sessions: Arc<DashMap<String, TerminalEntry>>,
    sudo_prompt: Arc<AtomicBool>,
}

impl PumpContext {
    /// Blocking I/O loop owning the shell channel: drains queued writes,
    /// fans out received chunks, feeds sudo prompts.
    fn run(
        self,
        session: ssh2::Session,
        mut cmd_rx: mpsc::Receiver<TermCmd>,
        term: String,
        rows: u16,
        cols: u16,
    ) {
        let channel = (|| -> Result<ssh2::Channel, ToolError> {
            let mut channel = session
                .channel_session()
                .map_err(crate::services::transport::map_ssh_error)?;
            channel
                .handle_extended_data(ssh2::ExtendedData::Merge)
                .map_err(crate::services::transport::map_ssh_error)?;
            channel
                .request_pty(&term, None, Some((cols as u32, rows as u32, 0, 0)))
                .map_err(crate::services::transport::map_ssh_error)?;
            channel
                .shell()
                .map_err(crate::services::transport::map_ssh_error)?;
            Ok(channel)
        })();
        let mut channel = match channel {
            Ok(channel) => channel,
            Err(err) => {
                self.logger.error(
                    "failed to open shell channel",
                    Some(&serde_json::json!({
                        "session_id": self.session_id,
                        "error": err.message,
                    })),
                );
                self.sessions.remove(&self.session_id);
                return;
            }
        };
        session.set_blocking(false);

        let mut buf = [0u8; 16 * 1024];
        // Rolling tail so prompts split across reads still match.
        let mut tail = String::new();
        loop {
            let mut progressed = false;

            loop {
                match cmd_rx.try_recv() {
                    Ok(TermCmd::Write(data)) => {
                        self.write_channel(&session, &mut channel, &data);
                        progressed = true;
                    }
                    Ok(TermCmd::Resize(rows, cols)) => {
                        session.set_blocking(true);
                        let _ = channel.request_pty_size(cols as u32, rows as u32, None, None);
                        session.set_blocking(false);
                    }
                    Ok(TermCmd::Close) => {
                        session.set_blocking(true);
                        let _ = channel.close();
                        self.sessions.remove(&self.session_id);
                        return;
                    }
                    Err(mpsc::error::TryRecvError::Empty) => break,
                    Err(mpsc::error::TryRecvError::Disconnected) => {
                        session.set_blocking(true);
                        let _ = channel.close();
                        self.sessions.remove(&self.session_id);
                        return;
                    }
                }
            }

            match channel.read(&mut buf) {
                Ok(0) => {}
                Ok(n) => {
                    progressed = true;
                    let text = String::from_utf8_lossy(&buf[..n]).to_string();
                    self.events.emit(BrokerEvent::TerminalData {
                        session_id: self.session_id.clone(),
                        data: text.clone(),
                    });
                    if let Some(entry) = self.sessions.get(&self.session_id) {
                        *entry.last_activity.write().unwrap() = Utc::now();
                    }
                    tail.push_str(&text);
                    if tail.len() > 256 {
                        let cut = tail.len() - 256;
                        let boundary = (cut..tail.len())
                            .find(|i| tail.is_char_boundary(*i))
                            .unwrap_or(0);
                        tail = tail[boundary..].to_string();
                    }
                    self.maybe_feed_sudo(&session, &mut channel, &mut tail);
                }
                Err(err) if err.kind() == std::io::ErrorKind::WouldBlock => {}
                Err(_) => break,
            }

            if channel.eof() {
                break;
            }
            if !progressed {
                std::thread::sleep(Duration::from_millis(15));
            }
        }

        session.set_blocking(true);
        let _ = channel.close();
        self.sessions.remove(&self.session_id);
        self.logger.info(
            "terminal pump finished",
            Some(&serde_json::json!({"session_id": self.session_id})),
        );
    }

    fn maybe_feed_sudo(
        &self,
        session: &ssh2::Session,
        channel: &mut ssh2::Channel,
        window: &mut String,
    ) {
        if !contains_sudo_prompt(window) {
            return;
        }
        // Drain the matched window: once a prompt is handled, later output
        // must not re-trigger on the same stale bytes after the flag clears.
        window.clear();
        // Exactly once per prompt; the flag clears on the next explicit write.
        if self.sudo_prompt.swap(true, Ordering::Relaxed) {
            return;
        }
        let password = self
            .config_password
            .clone()
            .or_else(|| self.credentials.load(&self.connection_id).password);
        let Some(password) = password else {
            return;
        };
        let mut payload = password.into_bytes();
        payload.push(b'\n');
        self.write_channel(session, channel, &payload);
        self.logger.debug(
            "sudo password auto-filled",
            Some(&serde_json::json!({"session_id": self.session_id})),
        );
    }

    fn write_channel(&self, session: &ssh2::Session, channel: &mut ssh2::Channel, data: &[u8]) {
        session.set_blocking(true);
        if let Err(err) = channel.write_all(data) {
            self.logger.warn(
                "terminal write failed",
                Some(&serde_json::json!({
                    "session_id": self.session_id,
                    "error": err.to_string(),
                })),
            );
        }
        let _ = channel.flush();
        session.set_blocking(false);
    }
}

#[cfg(test)]
mod tests {
    use super::contains_sudo_prompt;

    #[test]
    fn recognizes_sudo_prompt_variants() {
        assert!(contains_sudo_prompt("[sudo] password for deploy: "));
        assert!(contains_sudo_prompt("Password:"));
        assert!(contains_sudo_prompt("密码："));
        assert!(!contains_sudo_prompt("password hint: none"));
    }
}
