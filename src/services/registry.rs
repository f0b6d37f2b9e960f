use crate::constants::{self, network};
use crate::errors::ToolError;
use crate::services::credentials::CredentialStore;
use crate::services::events::{BrokerEvent, EventBus};
use crate::services::logger::Logger;
use crate::services::store::{ConnectionRecord, ConnectionStore};
use crate::services::transport::{
    self, connect_session, connection_id, exec_on_session, ConnectSettings,
};
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::Serialize;
use ssh2::Session;
use std::sync::{Arc, RwLock};
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
    Error,
}

impl ConnectionState {
    pub fn as_str(self) -> &'static str {
        match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
            ConnectionState::Reconnecting => "reconnecting",
            ConnectionState::Error => "error",
        }
    }
}

#[derive(Debug, Clone)]
pub struct ReconnectPolicy {
    pub enabled: bool,
    pub max_tries: u32,
    pub delay_ms: u64,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            enabled: true,
            max_tries: constants::resolve_reconnect_attempts(),
            delay_ms: network::RECONNECT_DELAY_MS,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ConnectParams {
    pub host: String,
    pub username: String,
    pub port: u16,
    pub password: Option<String>,
    pub private_key: Option<String>,
    pub passphrase: Option<String>,
    pub name: Option<String>,
    pub remember_password: bool,
    pub tags: Vec<String>,
    pub reconnect: ReconnectPolicy,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionSummary {
    pub id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    pub host: String,
    pub port: u16,
    pub username: String,
    pub state: ConnectionState,
    pub last_used: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub current_directory: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fingerprint: Option<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub tags: Vec<String>,
}

struct ConnState {
    settings: ConnectSettings,
    name: Option<String>,
    tags: Vec<String>,
    state: ConnectionState,
    last_error: Option<String>,
    last_used: DateTime<Utc>,
    current_directory: Option<String>,
    home_directory: Option<String>,
    fingerprint: Option<String>,
    session: Option<Arc<Session>>,
    reconnect: ReconnectPolicy,
    reconnect_in_flight: bool,
}

/// One registry entry. The live `ssh2::Session` is shared out as an `Arc`
/// clone taken under the lock; the lock is never held across remote I/O.
/// `exec_lock` serializes one-shot commands on the shared transport.
/// `retired` flips once the registry stops pointing at this handle, which
/// tells any detached reconnect loop to stand down.
pub struct ConnectionHandle {
    pub id: String,
    state: RwLock<ConnState>,
    pub exec_lock: tokio::sync::Mutex<()>,
    retired: std::sync::atomic::AtomicBool,
}

impl ConnectionHandle {
    pub fn state(&self) -> ConnectionState {
        self.state.read().unwrap().state
    }

    fn retire(&self) {
        self.retired
            .store(true, std::sync::atomic::Ordering::Relaxed);
        self.state.write().unwrap().session = None;
    }

    fn is_retired(&self) -> bool {
        self.retired.load(std::sync::atomic::Ordering::Relaxed)
    }

    pub fn session(&self) -> Option<Arc<Session>> {
        self.state.read().unwrap().session.clone()
    }

    pub fn settings(&self) -> ConnectSettings {
        self.state.read().unwrap().settings.clone()
    }

    pub fn sudo_password(&self) -> Option<String> {
        self.state.read().unwrap().settings.password.clone()
    }

    pub fn current_directory(&self) -> Option<String> {
        self.state.read().unwrap().current_directory.clone()
    }

    /// The remote `pwd` observed right after connecting; used to render the
    /// `~` shorthand in prompt lines.
    pub fn home_directory(&self) -> Option<String> {
        self.state.read().unwrap().home_directory.clone()
    }

    pub fn set_current_directory(&self, dir: Option<String>) {
        self.state.write().unwrap().current_directory = dir;
    }

    pub fn touch(&self) {
        self.state.write().unwrap().last_used = Utc::now();
    }

    pub fn summary(&self) -> ConnectionSummary {
        let guard = self.state.read().unwrap();
        ConnectionSummary {
            id: self.id.clone(),
            name: guard.name.clone(),
            host: guard.settings.host.clone(),
            port: guard.settings.port,
            username: guard.settings.username.clone(),
            state: guard.state,
            last_used: guard.last_used.to_rfc3339(),
            current_directory: guard.current_directory.clone(),
            last_error: guard.last_error.clone(),
            fingerprint: guard.fingerprint.clone(),
            tags: guard.tags.clone(),
        }
    }
}

type DisconnectHook = Box<dyn Fn(&str) + Send + Sync>;

pub struct ConnectionRegistry {
    logger: Logger,
    store: Arc<ConnectionStore>,
    credentials: Arc<CredentialStore>,
    events: EventBus,
    connections: Arc<DashMap<String, Arc<ConnectionHandle>>>,
    on_disconnect: RwLock<Vec<DisconnectHook>>,
}

impl ConnectionRegistry {
    pub fn new(
        logger: Logger,
        store: Arc<ConnectionStore>,
        credentials: Arc<CredentialStore>,
        events: EventBus,
    ) -> Self {
        Self {
            logger: logger.child("registry"),
            store,
            credentials,
            events,
            connections: Arc::new(DashMap::new()),
            on_disconnect: RwLock::new(Vec::new()),
        }
    }

    /// Hooks run whenever a connection stops being usable (disconnect or
    /// delete). Dependent subsystems register teardown callbacks here so the
    /// registry never has to know about them.
    pub fn register_disconnect_hook(&self, hook: DisconnectHook) {
        self.on_disconnect.write().unwrap().push(hook);
    }

    fn fire_disconnect_hooks(&self, id: &str) {
        for hook in self.on_disconnect.read().unwrap().iter() {
            hook(id);
        }
    }

    pub async fn connect(&self, params: ConnectParams) -> Result<ConnectionSummary, ToolError> {
        let id = connection_id(&params.username, &params.host, params.port);

        if let Some(handle) = self.connections.get(&id).map(|e| e.value().clone()) {
            if handle.state() == ConnectionState::Connected {
                return Ok(handle.summary());
            }
        }

        let mut settings = ConnectSettings {
            host: params.host.clone(),
            port: params.port,
            username: params.username.clone(),
            password: params.password.clone(),
            private_key: params.private_key.clone(),
            passphrase: params.passphrase.clone(),
            ready_timeout_ms: constants::resolve_connection_timeout_ms(),
            keepalive_interval_ms: network::KEEPALIVE_INTERVAL_MS,
        };
        if settings.private_key.is_none() {
            if let Some(record) = self.store.get(&id) {
                settings.private_key = record.private_key;
            }
        }
        if settings.password.is_none() || settings.passphrase.is_none() {
            let stored = self.credentials.load(&id);
            if settings.password.is_none() {
                settings.password = stored.password;
            }
            if settings.passphrase.is_none() {
                settings.passphrase = stored.passphrase;
            }
        }

        let handle = Arc::new(ConnectionHandle {
            id: id.clone(),
            state: RwLock::new(ConnState {
                settings: settings.clone(),
                name: params.name.clone(),
                tags: params.tags.clone(),
                state: ConnectionState::Connecting,
                last_error: None,
                last_used: Utc::now(),
                current_directory: None,
                home_directory: None,
                fingerprint: None,
                session: None,
                reconnect: params.reconnect.clone(),
                reconnect_in_flight: false,
            }),
            exec_lock: tokio::sync::Mutex::new(()),
            retired: std::sync::atomic::AtomicBool::new(false),
        });
        // Stand down any previous handle (and its reconnect loop) before the
        // new one takes the slot: one live client per identity.
        if let Some(previous) = self.connections.get(&id).map(|e| e.value().clone()) {
            previous.retire();
        }
        self.connections.insert(id.clone(), handle.clone());
        self.events.emit(BrokerEvent::ConnectionState {
            connection_id: id.clone(),
            state: ConnectionState::Connecting.as_str().to_string(),
        });

        match Self::dial(settings.clone()).await {
            Ok((session, fingerprint, cwd)) => {
                {
                    let mut guard = handle.state.write().unwrap();
                    guard.session = Some(Arc::new(session));
                    guard.state = ConnectionState::Connected;
                    guard.last_error = None;
                    guard.fingerprint = fingerprint;
                    guard.current_directory = cwd.clone();
                    guard.home_directory = cwd;
                    guard.last_used = Utc::now();
                }
                self.events.emit(BrokerEvent::ConnectionState {
                    connection_id: id.clone(),
                    state: ConnectionState::Connected.as_str().to_string(),
                });
                self.persist_record(&handle)?;
                if params.remember_password {
                    if let Err(err) = self.credentials.save(
                        &id,
                        settings.password.as_deref(),
                        settings.passphrase.as_deref(),
                    ) {
                        self.logger.warn(
                            "failed to persist credentials",
                            Some(&serde_json::json!({"connection_id": id, "error": err.message})),
                        );
                    }
                }
                self.logger.info(
                    "connected",
                    Some(&serde_json::json!({
                        "connection_id": id,
                        "host": params.host,
                        "username": params.username,
                    })),
                );
                Ok(handle.summary())
            }
            Err(err) => {
                {
                    let mut guard = handle.state.write().unwrap();
                    guard.state = ConnectionState::Error;
                    guard.last_error = Some(err.message.clone());
                }
                self.events.emit(BrokerEvent::ConnectionState {
                    connection_id: id.clone(),
                    state: ConnectionState::Error.as_str().to_string(),
                });
                self.schedule_reconnect(handle);
                Err(err)
            }
        }
    }

    async fn dial(
        settings: ConnectSettings,
    ) -> Result<(Session, Option<String>, Option<String>), ToolError> {
        tokio::task::spawn_blocking(move || {
            let session = connect_session(&settings)?;
            let fingerprint = transport::host_key_fingerprint(&session);
            let cwd = exec_on_session(&session, "pwd", network::TIMEOUT_PROBE_MS)
                .ok()
                .filter(|out| out.exit_code == 0)
                .map(|out| out.stdout.trim().to_string())
                .filter(|s| !s.is_empty());
            Ok((session, fingerprint, cwd))
        })
        .await
        .map_err(|_| ToolError::internal("SSH connect task failed"))?
    }

    /// Retry loop after a failed dial. Runs detached; each attempt walks the
    /// connection through `reconnecting` and the loop parks it in `error`
    /// once the budget is spent.
    fn schedule_reconnect(&self, handle: Arc<ConnectionHandle>) {
        let (enabled, already_running) = {
            let mut guard = handle.state.write().unwrap();
            let enabled = guard.reconnect.enabled && guard.reconnect.max_tries > 0;
            let already = guard.reconnect_in_flight;
            if enabled && !already {
                guard.reconnect_in_flight = true;
            }
            (enabled, already)
        };
        if !enabled || already_running {
            return;
        }

        let logger = self.logger.clone();
        let events = self.events.clone();
        tokio::spawn(async move {
            let (max_tries, delay_ms) = {
                let guard = handle.state.read().unwrap();
                (guard.reconnect.max_tries, guard.reconnect.delay_ms)
            };
            for attempt in 1..=max_tries {
                tokio::time::sleep(Duration::from_millis(delay_ms)).await;
                if handle.is_retired() || handle.state() != ConnectionState::Error {
                    break;
                }
                {
                    handle.state.write().unwrap().state = ConnectionState::Reconnecting;
                }
                events.emit(BrokerEvent::ConnectionState {
                    connection_id: handle.id.clone(),
                    state: ConnectionState::Reconnecting.as_str().to_string(),
                });
                let settings = handle.settings();
                match Self::dial(settings).await {
                    Ok((session, fingerprint, cwd)) => {
                        if handle.is_retired() {
                            // A newer connect replaced this handle while we
                            // were dialing; drop the session instead of
                            // resurrecting an unreachable client.
                            drop(session);
                            break;
                        }
                        {
                            let mut guard = handle.state.write().unwrap();
                            guard.session = Some(Arc::new(session));
                            guard.state = ConnectionState::Connected;
                            guard.last_error = None;
                            guard.fingerprint = fingerprint;
                            guard.current_directory = cwd.clone();
                            guard.home_directory = cwd;
                        }
                        events.emit(BrokerEvent::ConnectionState {
                            connection_id: handle.id.clone(),
                            state: ConnectionState::Connected.as_str().to_string(),
                        });
                        logger.info(
                            "reconnected",
                            Some(&serde_json::json!({
                                "connection_id": handle.id,
                                "attempt": attempt,
                            })),
                        );
                        break;
                    }
                    Err(err) => {
                        {
                            let mut guard = handle.state.write().unwrap();
                            guard.state = ConnectionState::Error;
                            guard.last_error = Some(err.message.clone());
                        }
                        logger.warn(
                            "reconnect attempt failed",
                            Some(&serde_json::json!({
                                "connection_id": handle.id,
                                "attempt": attempt,
                                "error": err.message,
                            })),
                        );
                    }
                }
            }
            handle.state.write().unwrap().reconnect_in_flight = false;
        });
    }

    /// Called when command I/O shows the transport is gone: drop the dead
    /// client, park the connection in `error` and let the reconnect loop
    /// take over.
    pub fn mark_transport_error(&self, id: &str, message: &str) {
        let Some(handle) = self.connections.get(id).map(|e| e.value().clone()) else {
            return;
        };
        {
            let mut guard = handle.state.write().unwrap();
            if guard.state != ConnectionState::Connected {
                return;
            }
            guard.session = None;
            guard.state = ConnectionState::Error;
            guard.last_error = Some(message.to_string());
            guard.current_directory = None;
        }
        self.events.emit(BrokerEvent::ConnectionState {
            connection_id: id.to_string(),
            state: ConnectionState::Error.as_str().to_string(),
        });
        self.fire_disconnect_hooks(id);
        self.logger.warn(
            "transport error",
            Some(&serde_json::json!({"connection_id": id, "error": message})),
        );
        self.schedule_reconnect(handle);
    }

    fn persist_record(&self, handle: &ConnectionHandle) -> Result<(), ToolError> {
        let guard = handle.state.read().unwrap();
        self.store.upsert(ConnectionRecord {
            id: handle.id.clone(),
            name: guard.name.clone(),
            host: guard.settings.host.clone(),
            port: guard.settings.port,
            username: guard.settings.username.clone(),
            private_key: guard.settings.private_key.clone(),
            last_used: Some(guard.last_used.to_rfc3339()),
            tags: guard.tags.clone(),
        })
    }

    pub async fn disconnect(&self, id: &str) -> Result<bool, ToolError> {
        let Some(handle) = self.connections.get(id).map(|e| e.value().clone()) else {
            return Ok(false);
        };
        {
            let mut guard = handle.state.write().unwrap();
            guard.session = None;
            guard.state = ConnectionState::Disconnected;
            guard.current_directory = None;
        }
        self.events.emit(BrokerEvent::ConnectionState {
            connection_id: id.to_string(),
            state: ConnectionState::Disconnected.as_str().to_string(),
        });
        self.fire_disconnect_hooks(id);
        self.logger
            .info("disconnected", Some(&serde_json::json!({"connection_id": id})));
        Ok(true)
    }

    pub async fn delete(&self, id: &str) -> Result<bool, ToolError> {
        let existed = self.disconnect(id).await?;
        if let Some((_, handle)) = self.connections.remove(id) {
            handle.retire();
        }
        let stored = self.store.remove(id)?;
        self.credentials.delete(id);
        Ok(existed || stored)
    }

    pub fn get(&self, id: &str) -> Option<ConnectionSummary> {
        self.connections.get(id).map(|e| e.value().summary())
    }

    pub fn list(&self) -> Vec<ConnectionSummary> {
        let mut summaries: Vec<ConnectionSummary> = self
            .connections
            .iter()
            .map(|entry| entry.value().summary())
            .collect();
        summaries.sort_by(|a, b| a.id.cmp(&b.id));
        summaries
    }

    pub fn handle(&self, id: &str) -> Result<Arc<ConnectionHandle>, ToolError> {
        self.connections
            .get(id)
            .map(|e| e.value().clone())
            .ok_or_else(|| {
                ToolError::not_found(format!("Unknown connection: {}", id))
                    .with_hint("Use listConnections to see known connections.")
            })
    }

    /// Resolve a handle plus its live session, rejecting anything that is
    /// not currently connected.
    pub fn connected_session(
        &self,
        id: &str,
    ) -> Result<(Arc<ConnectionHandle>, Arc<Session>), ToolError> {
        let handle = self.handle(id)?;
        let session = {
            let guard = handle.state.read().unwrap();
            if guard.state != ConnectionState::Connected {
                return Err(ToolError::not_connected(format!(
                    "Connection {} is {}",
                    id,
                    guard.state.as_str()
                )));
            }
            guard.session.clone()
        };
        let session = session
            .ok_or_else(|| ToolError::not_connected(format!("Connection {} has no live client", id)))?;
        Ok((handle, session))
    }

    /// Open a fresh SSH session with the connection's stored settings.
    /// SFTP streams, tunnels and PTYs run on their own transport so they
    /// never contend with one-shot commands.
    pub async fn open_dedicated_session(&self, id: &str) -> Result<Session, ToolError> {
        let handle = self.handle(id)?;
        if handle.state() != ConnectionState::Connected {
            return Err(ToolError::not_connected(format!(
                "Connection {} is {}",
                id,
                handle.state().as_str()
            )));
        }
        let settings = handle.settings();
        tokio::task::spawn_blocking(move || connect_session(&settings))
            .await
            .map_err(|_| ToolError::internal("SSH session task failed"))?
    }
}
