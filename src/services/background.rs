use crate::errors::ToolError;
use crate::services::exec::{CommandEngine, ExecOptions};
use crate::services::logger::Logger;
use crate::services::registry::{ConnectionRegistry, ConnectionState};
use dashmap::DashMap;
use serde_json::Value;
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tokio::task::JoinHandle;

#[derive(Debug)]
pub struct BackgroundTask {
    pub connection_id: String,
    pub command: String,
    pub interval_ms: u64,
    pub cwd: Option<String>,
    pub started_at: chrono::DateTime<chrono::Utc>,
    pub last_check: RwLock<Option<chrono::DateTime<chrono::Utc>>>,
    pub last_error: RwLock<Option<String>>,
    pub runs: std::sync::atomic::AtomicU64,
}

impl BackgroundTask {
    pub fn summary(&self) -> Value {
        serde_json::json!({
            "connectionId": self.connection_id,
            "command": self.command,
            "intervalMs": self.interval_ms,
            "cwd": self.cwd,
            "startedAt": self.started_at.to_rfc3339(),
            "lastCheck": self.last_check.read().unwrap().map(|t| t.to_rfc3339()),
            "lastError": self.last_error.read().unwrap().clone(),
            "runs": self.runs.load(std::sync::atomic::Ordering::Relaxed),
        })
    }
}

struct TaskEntry {
    info: Arc<BackgroundTask>,
    handle: JoinHandle<()>,
}

/// Periodic commands keyed by connection. One task per connection; starting
/// a second replaces the first. Per-tick errors are recorded on the task and
/// never stop the timer; leaving `connected` does.
pub struct BackgroundRunner {
    logger: Logger,
    engine: Arc<CommandEngine>,
    registry: Arc<ConnectionRegistry>,
    tasks: Arc<DashMap<String, TaskEntry>>,
}

impl BackgroundRunner {
    pub fn new(
        logger: Logger,
        engine: Arc<CommandEngine>,
        registry: Arc<ConnectionRegistry>,
    ) -> Self {
        Self {
            logger: logger.child("background"),
            engine,
            registry,
            tasks: Arc::new(DashMap::new()),
        }
    }

    pub fn start(
        &self,
        connection_id: &str,
        command: &str,
        interval_ms: u64,
        cwd: Option<String>,
    ) -> Result<Arc<BackgroundTask>, ToolError> {
        if self.registry.handle(connection_id)?.state() != ConnectionState::Connected {
            return Err(ToolError::not_connected(format!(
                "Connection {} is not connected",
                connection_id
            )));
        }

        let info = Arc::new(BackgroundTask {
            connection_id: connection_id.to_string(),
            command: command.to_string(),
            interval_ms,
            cwd: cwd.clone(),
            started_at: chrono::Utc::now(),
            last_check: RwLock::new(None),
            last_error: RwLock::new(None),
            runs: std::sync::atomic::AtomicU64::new(0),
        });

        let engine = self.engine.clone();
        let registry = self.registry.clone();
        let logger = self.logger.clone();
        let tasks = self.tasks.clone();
        let task_info = info.clone();
        let conn_id = connection_id.to_string();
        let handle = tokio::spawn(async move {
            loop {
                let connected = registry
                    .handle(&conn_id)
                    .map(|h| h.state() == ConnectionState::Connected)
                    .unwrap_or(false);
                if !connected {
                    logger.info(
                        "background task stopping, connection left connected state",
                        Some(&serde_json::json!({"connection_id": conn_id})),
                    );
                    // Only remove our own entry; a replacement may already
                    // have taken the slot.
                    tasks.remove_if(&conn_id, |_, entry| Arc::ptr_eq(&entry.info, &task_info));
                    break;
                }

                let result = engine
                    .execute(
                        &conn_id,
                        &task_info.command,
                        ExecOptions {
                            cwd: task_info.cwd.clone(),
                            timeout_ms: None,
                            force: false,
                        },
                    )
                    .await;
                *task_info.last_check.write().unwrap() = Some(chrono::Utc::now());
                task_info
                    .runs
                    .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
                match result {
                    Ok(outcome) if outcome.exit_code != 0 => {
                        *task_info.last_error.write().unwrap() =
                            Some(format!("exit code {}: {}", outcome.exit_code, outcome.stderr));
                    }
                    Ok(_) => {
                        *task_info.last_error.write().unwrap() = None;
                    }
                    Err(err) => {
                        *task_info.last_error.write().unwrap() = Some(err.message.clone());
                        logger.warn(
                            "background run failed",
                            Some(&serde_json::json!({
                                "connection_id": conn_id,
                                "error": err.message,
                            })),
                        );
                    }
                }

                tokio::time::sleep(Duration::from_millis(task_info.interval_ms)).await;
            }
        });

        self.install(connection_id, info.clone(), handle);
        Ok(info)
    }

    fn install(&self, connection_id: &str, info: Arc<BackgroundTask>, handle: JoinHandle<()>) {
        if let Some((_, previous)) = self.tasks.remove(connection_id) {
            previous.handle.abort();
            self.logger.info(
                "replaced background task",
                Some(&serde_json::json!({"connection_id": connection_id})),
            );
        }
        self.tasks
            .insert(connection_id.to_string(), TaskEntry { info, handle });
    }

    pub fn stop(&self, connection_id: &str) -> bool {
        match self.tasks.remove(connection_id) {
            Some((_, entry)) => {
                entry.handle.abort();
                true
            }
            None => false,
        }
    }

    pub fn stop_all(&self) -> usize {
        let ids: Vec<String> = self.tasks.iter().map(|e| e.key().clone()).collect();
        let mut stopped = 0;
        for id in ids {
            if self.stop(&id) {
                stopped += 1;
            }
        }
        stopped
    }

    pub fn get(&self, connection_id: &str) -> Option<Value> {
        self.tasks.get(connection_id).map(|e| e.value().info.summary())
    }

    pub fn list(&self) -> Vec<Value> {
        let mut tasks: Vec<Value> = self
            .tasks
            .iter()
            .map(|entry| entry.value().info.summary())
            .collect();
        tasks.sort_by_key(|t| {
            t.get("connectionId")
                .and_then(|v| v.as_str())
                .unwrap_or("")
                .to_string()
        });
        tasks
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU64;

    fn dummy_task(connection_id: &str) -> Arc<BackgroundTask> {
        Arc::new(BackgroundTask {
            connection_id: connection_id.to_string(),
            command: "uptime".to_string(),
            interval_ms: 10_000,
            cwd: None,
            started_at: chrono::Utc::now(),
            last_check: RwLock::new(None),
            last_error: RwLock::new(None),
            runs: AtomicU64::new(0),
        })
    }

    fn dummy_runner() -> BackgroundRunner {
        // Only the task table is exercised; engine and registry stay unused.
        let logger = Logger::new("test");
        let events = crate::services::events::EventBus::default();
        let security =
            Arc::new(crate::services::security::Security::from_key(&[7u8; 32]).expect("security"));
        let dir = std::env::temp_dir().join(format!("broker-bg-{}", uuid::Uuid::new_v4()));
        let store = Arc::new(
            crate::services::store::ConnectionStore::open(dir.join("connections.json"))
                .expect("store"),
        );
        let credentials = Arc::new(
            crate::services::credentials::CredentialStore::with_encrypted_backend(
                logger.clone(),
                security,
                dir.join("credentials.json"),
            ),
        );
        let registry = Arc::new(ConnectionRegistry::new(
            logger.clone(),
            store,
            credentials.clone(),
            events,
        ));
        let context = Arc::new(crate::services::context::ContainerContext::new());
        let engine = Arc::new(CommandEngine::new(
            logger.clone(),
            registry.clone(),
            credentials,
            context,
        ));
        BackgroundRunner::new(logger, engine, registry)
    }

    #[tokio::test]
    async fn second_task_replaces_first_per_connection() {
        let runner = dummy_runner();
        let first = tokio::spawn(async {
            tokio::time::sleep(Duration::from_secs(60)).await;
        });
        runner.install("c1", dummy_task("c1"), first);
        let second = tokio::spawn(async {
            tokio::time::sleep(Duration::from_secs(60)).await;
        });
        runner.install("c1", dummy_task("c1"), second);
        assert_eq!(runner.len(), 1);
        assert!(runner.stop("c1"));
        assert!(!runner.stop("c1"), "stop is idempotent");
    }

    #[tokio::test]
    async fn stop_all_clears_every_task() {
        let runner = dummy_runner();
        for id in ["a", "b", "c"] {
            let handle = tokio::spawn(async {
                tokio::time::sleep(Duration::from_secs(60)).await;
            });
            runner.install(id, dummy_task(id), handle);
        }
        assert_eq!(runner.stop_all(), 3);
        assert!(runner.is_empty());
    }
}
