use crate::errors::ToolError;
use crate::services::logger::Logger;
use crate::utils::fs_atomic::atomic_write_text_file;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::{Duration, Instant};

const TAKEOVER_POLL_MS: u64 = 100;
const TAKEOVER_WAIT_MS: u64 = 5_000;

#[derive(Debug, Serialize, Deserialize)]
struct LockRecord {
    pid: u32,
    instance_id: String,
    timestamp: String,
}

/// PID lockfile keeping the broker a per-user singleton. A live previous
/// holder gets a graceful SIGTERM and five seconds to leave; a stale file is
/// replaced. Release only removes the file when it still carries our
/// instance id, so a successor's lock survives our exit.
pub struct SingletonGuard {
    logger: Logger,
    path: PathBuf,
    instance_id: String,
}

impl SingletonGuard {
    pub fn acquire(logger: Logger, path: PathBuf) -> Result<Self, ToolError> {
        let logger = logger.child("singleton");
        let instance_id = uuid::Uuid::new_v4().to_string();

        if let Some(existing) = read_lock(&path) {
            if existing.pid != std::process::id() && pid_alive(existing.pid) {
                logger.info(
                    "previous broker instance is running, requesting termination",
                    Some(&serde_json::json!({"pid": existing.pid})),
                );
                terminate(existing.pid);
                let deadline = Instant::now() + Duration::from_millis(TAKEOVER_WAIT_MS);
                while pid_alive(existing.pid) {
                    if Instant::now() > deadline {
                        return Err(ToolError::conflict(format!(
                            "Another broker instance (pid {}) refused to exit",
                            existing.pid
                        ))
                        .with_hint("Stop the other instance or remove the lockfile manually."));
                    }
                    std::thread::sleep(Duration::from_millis(TAKEOVER_POLL_MS));
                }
                logger.info("previous instance exited", None);
            } else {
                logger.debug(
                    "removing stale lockfile",
                    Some(&serde_json::json!({"pid": existing.pid})),
                );
            }
            let _ = std::fs::remove_file(&path);
        }

        let record = LockRecord {
            pid: std::process::id(),
            instance_id: instance_id.clone(),
            timestamp: chrono::Utc::now().to_rfc3339(),
        };
        let payload = serde_json::to_string_pretty(&record)
            .map_err(|err| ToolError::internal(err.to_string()))?;
        atomic_write_text_file(&path, &format!("{}\n", payload), 0o600)
            .map_err(|err| ToolError::internal(format!("Cannot write lockfile: {}", err)))?;

        Ok(Self {
            logger,
            path,
            instance_id,
        })
    }

    /// Remove the lockfile iff it is still ours.
    pub fn release(&self) {
        match read_lock(&self.path) {
            Some(record) if record.instance_id == self.instance_id => {
                if std::fs::remove_file(&self.path).is_ok() {
                    self.logger.debug("lockfile removed", None);
                }
            }
            Some(_) => {
                self.logger
                    .debug("lockfile now belongs to a successor, leaving it", None);
            }
            None => {}
        }
    }

    pub fn instance_id(&self) -> &str {
        &self.instance_id
    }
}

fn read_lock(path: &PathBuf) -> Option<LockRecord> {
    let raw = std::fs::read_to_string(path).ok()?;
    serde_json::from_str(&raw).ok()
}

#[cfg(unix)]
fn pid_alive(pid: u32) -> bool {
    unsafe { libc::kill(pid as libc::pid_t, 0) == 0 }
}

#[cfg(unix)]
fn terminate(pid: u32) {
    unsafe {
        libc::kill(pid as libc::pid_t, libc::SIGTERM);
    }
}

#[cfg(not(unix))]
fn pid_alive(_pid: u32) -> bool {
    false
}

#[cfg(not(unix))]
fn terminate(_pid: u32) {}
