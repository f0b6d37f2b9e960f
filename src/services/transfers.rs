use crate::constants::{self, limits};
use crate::errors::ToolError;
use crate::services::events::{BrokerEvent, EventBus};
use crate::services::logger::Logger;
use crate::services::registry::ConnectionRegistry;
use crate::services::transport::{exec_on_session, map_ssh_error};
use crate::utils::shellwords::shell_quote;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use dashmap::DashMap;
use regex::Regex;
use serde::Serialize;
use sha2::{Digest, Sha256};
use ssh2::{OpenFlags, OpenType};
use std::io::{Read, Write};
use std::path::Path;
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TransferDirection {
    Upload,
    Download,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum TransferStatus {
    Pending,
    InProgress,
    Completed,
    Failed,
}

impl TransferStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, TransferStatus::Completed | TransferStatus::Failed)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            TransferStatus::Pending => "pending",
            TransferStatus::InProgress => "in-progress",
            TransferStatus::Completed => "completed",
            TransferStatus::Failed => "failed",
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TransferRecord {
    pub id: String,
    pub connection_id: String,
    pub direction: TransferDirection,
    pub local_path: String,
    pub remote_path: String,
    pub size: u64,
    pub bytes_transferred: u64,
    pub progress: u8,
    pub status: TransferStatus,
    pub start_time: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub end_time: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

pub fn progress_percent(bytes: u64, size: u64) -> u8 {
    if size == 0 {
        return 0;
    }
    (((bytes as f64 / size as f64) * 100.0).round() as u64).min(100) as u8
}

/// Decides when a progress update is worth an event: every time the rounded
/// percentage crosses a 5% boundary.
#[derive(Debug, Default)]
pub struct ProgressGate {
    last_bucket: Option<u8>,
}

impl ProgressGate {
    pub fn should_emit(&mut self, progress: u8) -> bool {
        let bucket = progress / limits::PROGRESS_STEP_PERCENT;
        if self.last_bucket != Some(bucket) {
            self.last_bucket = Some(bucket);
            true
        } else {
            false
        }
    }
}

/// Shared handle the blocking stream loop uses to publish byte counts into
/// the record table and onto the event bus.
struct TransferTracker {
    id: String,
    records: Arc<DashMap<String, TransferRecord>>,
    events: EventBus,
    gate: ProgressGate,
}

impl TransferTracker {
    fn update<F>(&self, mutate: F) -> Option<TransferRecord>
    where
        F: FnOnce(&mut TransferRecord),
    {
        let mut entry = self.records.get_mut(&self.id)?;
        mutate(entry.value_mut());
        Some(entry.value().clone())
    }

    fn emit(&self, record: &TransferRecord) {
        self.events.emit(BrokerEvent::TransferProgress {
            transfer_id: record.id.clone(),
            status: record.status.as_str().to_string(),
            progress: record.progress,
            bytes_transferred: record.bytes_transferred,
            size: record.size,
        });
    }

    fn start(&mut self, size: u64) {
        if let Some(record) = self.update(|r| {
            r.size = size;
            r.status = TransferStatus::InProgress;
        }) {
            self.gate.should_emit(0);
            self.emit(&record);
        }
    }

    fn on_bytes(&mut self, transferred: u64) {
        let updated = self.update(|r| {
            r.bytes_transferred = if r.size > 0 {
                transferred.min(r.size)
            } else {
                transferred
            };
            r.progress = progress_percent(r.bytes_transferred, r.size);
        });
        if let Some(record) = updated {
            if self.gate.should_emit(record.progress) {
                self.emit(&record);
            }
        }
    }

    fn complete(&mut self) {
        if let Some(record) = self.update(|r| {
            r.bytes_transferred = r.size;
            r.progress = 100;
            r.status = TransferStatus::Completed;
            r.end_time = Some(Utc::now().to_rfc3339());
        }) {
            self.emit(&record);
        }
    }

    fn fail(&mut self, message: &str) {
        if let Some(record) = self.update(|r| {
            r.status = TransferStatus::Failed;
            r.end_time = Some(Utc::now().to_rfc3339());
            r.error = Some(message.to_string());
        }) {
            self.emit(&record);
        }
    }
}

/// SFTP uploads/downloads with progress accounting. Every transfer streams
/// on a dedicated SSH session so bulk data never contends with command
/// execution on the shared transport.
#[derive(Clone)]
pub struct TransferManager {
    logger: Logger,
    registry: Arc<ConnectionRegistry>,
    events: EventBus,
    records: Arc<DashMap<String, TransferRecord>>,
}

impl TransferManager {
    pub fn new(logger: Logger, registry: Arc<ConnectionRegistry>, events: EventBus) -> Self {
        Self {
            logger: logger.child("transfers"),
            registry,
            events,
            records: Arc::new(DashMap::new()),
        }
    }

    pub fn track(
        &self,
        connection_id: &str,
        direction: TransferDirection,
        local_path: &str,
        remote_path: &str,
    ) -> TransferRecord {
        let record = TransferRecord {
            id: uuid::Uuid::new_v4().to_string(),
            connection_id: connection_id.to_string(),
            direction,
            local_path: local_path.to_string(),
            remote_path: remote_path.to_string(),
            size: 0,
            bytes_transferred: 0,
            progress: 0,
            status: TransferStatus::Pending,
            start_time: Utc::now().to_rfc3339(),
            end_time: None,
            error: None,
        };
        self.records.insert(record.id.clone(), record.clone());
        record
    }

    pub async fn upload(
        &self,
        connection_id: &str,
        local_path: &str,
        remote_path: &str,
    ) -> Result<TransferRecord, ToolError> {
        let record = self.track(
            connection_id,
            TransferDirection::Upload,
            local_path,
            remote_path,
        );
        self.run(record.id.clone()).await
    }

    pub async fn download(
        &self,
        connection_id: &str,
        remote_path: &str,
        local_path: &str,
    ) -> Result<TransferRecord, ToolError> {
        let record = self.track(
            connection_id,
            TransferDirection::Download,
            local_path,
            remote_path,
        );
        self.run(record.id.clone()).await
    }

    /// Execute a tracked transfer to completion. Failures mark the record
    /// and surface as `transfer_failed`; the record stays for inspection.
    pub async fn run(&self, transfer_id: String) -> Result<TransferRecord, ToolError> {
        let record = self
            .records
            .get(&transfer_id)
            .map(|e| e.value().clone())
            .ok_or_else(|| ToolError::not_found(format!("Unknown transfer: {}", transfer_id)))?;

        let session = match self
            .registry
            .open_dedicated_session(&record.connection_id)
            .await
        {
            Ok(session) => session,
            Err(err) => {
                let mut tracker = self.tracker(&transfer_id);
                tracker.fail(&err.message);
                return Err(ToolError::transfer_failed(err.message)
                    .with_details(serde_json::json!({"transferId": transfer_id})));
            }
        };

        let mut tracker = self.tracker(&transfer_id);
        let direction = record.direction;
        let local = record.local_path.clone();
        let remote = record.remote_path.clone();
        let result = tokio::task::spawn_blocking(move || {
            let outcome = match direction {
                TransferDirection::Upload => stream_upload(&session, &local, &remote, &mut tracker),
                TransferDirection::Download => {
                    stream_download(&session, &remote, &local, &mut tracker)
                }
            };
            match outcome {
                Ok(()) => {
                    tracker.complete();
                    Ok(())
                }
                Err(err) => {
                    tracker.fail(&err.message);
                    Err(err)
                }
            }
        })
        .await
        .map_err(|_| ToolError::internal("SFTP task failed"))?;

        let final_record = self
            .records
            .get(&transfer_id)
            .map(|e| e.value().clone())
            .ok_or_else(|| ToolError::internal("Transfer record vanished"))?;
        match result {
            Ok(()) => {
                self.logger.info(
                    "transfer completed",
                    Some(&serde_json::json!({
                        "transfer_id": transfer_id,
                        "bytes": final_record.bytes_transferred,
                    })),
                );
                Ok(final_record)
            }
            Err(err) => Err(ToolError::transfer_failed(err.message)
                .with_details(serde_json::json!({"transferId": transfer_id}))),
        }
    }

    fn tracker(&self, transfer_id: &str) -> TransferTracker {
        TransferTracker {
            id: transfer_id.to_string(),
            records: self.records.clone(),
            events: self.events.clone(),
            gate: ProgressGate::default(),
        }
    }

    /// Create records for every item up front and stream them sequentially
    /// in the background. Callers poll the returned ids.
    pub fn batch(
        &self,
        connection_id: &str,
        direction: TransferDirection,
        items: Vec<(String, String)>,
    ) -> Vec<String> {
        let ids: Vec<String> = items
            .iter()
            .map(|(local, remote)| {
                self.track(connection_id, direction, local, remote).id
            })
            .collect();
        let manager = self.clone();
        let batch_ids = ids.clone();
        tokio::spawn(async move {
            for id in batch_ids {
                let _ = manager.run(id).await;
            }
        });
        ids
    }

    pub fn get(&self, transfer_id: &str) -> Option<TransferRecord> {
        self.records.get(transfer_id).map(|e| e.value().clone())
    }

    pub fn list(&self) -> Vec<TransferRecord> {
        let mut records: Vec<TransferRecord> =
            self.records.iter().map(|e| e.value().clone()).collect();
        records.sort_by(|a, b| a.start_time.cmp(&b.start_time));
        records
    }

    /// Drop terminal records whose end time is older than the retention
    /// window.
    pub fn sweep(&self, now: DateTime<Utc>, retention_ms: i64) -> usize {
        let cutoff = now - ChronoDuration::milliseconds(retention_ms);
        let stale: Vec<String> = self
            .records
            .iter()
            .filter(|entry| {
                let record = entry.value();
                record.status.is_terminal()
                    && record
                        .end_time
                        .as_ref()
                        .and_then(|t| DateTime::parse_from_rfc3339(t).ok())
                        .map(|t| t.with_timezone(&Utc) < cutoff)
                        .unwrap_or(false)
            })
            .map(|entry| entry.key().clone())
            .collect();
        let count = stale.len();
        for id in stale {
            self.records.remove(&id);
        }
        count
    }
}

fn stream_upload(
    session: &ssh2::Session,
    local_path: &str,
    remote_path: &str,
    tracker: &mut TransferTracker,
) -> Result<(), ToolError> {
    let mut local = std::fs::File::open(local_path).map_err(|err| {
        ToolError::transfer_failed(format!("Cannot open local file {}: {}", local_path, err))
    })?;
    let size = local
        .metadata()
        .map_err(|err| ToolError::transfer_failed(err.to_string()))?
        .len();
    tracker.start(size);

    let sftp = session.sftp().map_err(map_ssh_error)?;
    let mut remote = sftp
        .open_mode(
            Path::new(remote_path),
            OpenFlags::WRITE | OpenFlags::CREATE | OpenFlags::TRUNCATE,
            0o644,
            OpenType::File,
        )
        .map_err(|err| {
            ToolError::transfer_failed(format!("Cannot open remote file {}: {}", remote_path, err))
        })?;

    let mut transferred = 0u64;
    let mut hasher = Sha256::new();
    let mut buf = vec![0u8; limits::TRANSFER_CHUNK_BYTES];
    loop {
        let n = local
            .read(&mut buf)
            .map_err(|err| ToolError::transfer_failed(err.to_string()))?;
        if n == 0 {
            break;
        }
        remote
            .write_all(&buf[..n])
            .map_err(|err| ToolError::transfer_failed(err.to_string()))?;
        hasher.update(&buf[..n]);
        transferred += n as u64;
        tracker.on_bytes(transferred);
    }
    // Close the remote handle before verifying so everything is flushed.
    drop(remote);

    let local_sha256 = format!("{:x}", hasher.finalize());
    let remote_sha256 = match exec_on_session(
        session,
        &build_remote_sha256_command(remote_path),
        constants::resolve_command_timeout_ms(),
    ) {
        Ok(out) if out.exit_code == 0 => parse_sha256_from_output(&out.stdout),
        _ => None,
    };
    match remote_sha256 {
        Some(remote_sha256) if remote_sha256 == local_sha256 => Ok(()),
        Some(remote_sha256) => Err(ToolError::transfer_failed(format!(
            "Upload verification failed for {}: local sha256 {} but remote {}",
            remote_path, local_sha256, remote_sha256
        ))),
        None => {
            // No usable hash tool on the remote; fall back to a size check.
            let stat = sftp.stat(Path::new(remote_path)).map_err(|err| {
                ToolError::transfer_failed(format!(
                    "Cannot stat uploaded file {}: {}",
                    remote_path, err
                ))
            })?;
            if stat.size == Some(transferred) {
                Ok(())
            } else {
                Err(ToolError::transfer_failed(format!(
                    "Upload verification failed for {}: sent {} bytes but remote reports {:?}",
                    remote_path, transferred, stat.size
                )))
            }
        }
    }
}

/// Remote-side hash command in the reference style: try the common sha256
/// tools in order, printing just the digest.
fn build_remote_sha256_command(remote_path: &str) -> String {
    let quoted = shell_quote(remote_path);
    [
        "set -u".to_string(),
        format!("PATH_ARG={}", quoted),
        "if command -v sha256sum >/dev/null 2>&1; then sha256sum -- \"$PATH_ARG\" 2>/dev/null | awk '{print $1}'; exit 0; fi".to_string(),
        "if command -v shasum >/dev/null 2>&1; then shasum -a 256 -- \"$PATH_ARG\" 2>/dev/null | awk '{print $1}'; exit 0; fi".to_string(),
        "if command -v openssl >/dev/null 2>&1; then openssl dgst -sha256 -- \"$PATH_ARG\" 2>/dev/null | awk '{print $NF}'; exit 0; fi".to_string(),
        "exit 127".to_string(),
    ]
    .join("\n")
}

fn parse_sha256_from_output(text: &str) -> Option<String> {
    let re = Regex::new(r"\b[a-fA-F0-9]{64}\b").ok()?;
    let found = re.find(text)?;
    Some(found.as_str().to_lowercase())
}

fn stream_download(
    session: &ssh2::Session,
    remote_path: &str,
    local_path: &str,
    tracker: &mut TransferTracker,
) -> Result<(), ToolError> {
    let sftp = session.sftp().map_err(map_ssh_error)?;
    let stat = sftp.stat(Path::new(remote_path)).map_err(|err| {
        ToolError::transfer_failed(format!("Cannot stat remote file {}: {}", remote_path, err))
    })?;
    let size = stat.size.unwrap_or(0);
    tracker.start(size);

    let mut remote = sftp.open(Path::new(remote_path)).map_err(|err| {
        ToolError::transfer_failed(format!("Cannot open remote file {}: {}", remote_path, err))
    })?;

    let tmp_path = crate::utils::fs_atomic::temp_sibling_path(local_path);
    crate::utils::fs_atomic::ensure_dir_for_file(local_path)
        .map_err(|err| ToolError::transfer_failed(err.to_string()))?;
    let mut local = std::fs::File::create(&tmp_path).map_err(|err| {
        ToolError::transfer_failed(format!("Cannot create local file: {}", err))
    })?;

    let mut transferred = 0u64;
    let mut buf = vec![0u8; limits::TRANSFER_CHUNK_BYTES];
    let result = loop {
        let n = match remote.read(&mut buf) {
            Ok(0) => break Ok(()),
            Ok(n) => n,
            Err(err) => break Err(ToolError::transfer_failed(err.to_string())),
        };
        if let Err(err) = local.write_all(&buf[..n]) {
            break Err(ToolError::transfer_failed(err.to_string()));
        }
        transferred += n as u64;
        tracker.on_bytes(transferred);
    };

    match result {
        Ok(()) => {
            drop(local);
            if size > 0 && transferred != size {
                let _ = std::fs::remove_file(&tmp_path);
                return Err(ToolError::transfer_failed(format!(
                    "Download verification failed for {}: expected {} bytes, received {}",
                    remote_path, size, transferred
                )));
            }
            std::fs::rename(&tmp_path, local_path).map_err(|err| {
                ToolError::transfer_failed(format!("Cannot finalize download: {}", err))
            })
        }
        Err(err) => {
            drop(local);
            let _ = std::fs::remove_file(&tmp_path);
            Err(err)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn progress_is_rounded_and_clamped() {
        assert_eq!(progress_percent(0, 100), 0);
        assert_eq!(progress_percent(33, 100), 33);
        assert_eq!(progress_percent(100, 100), 100);
        assert_eq!(progress_percent(250, 100), 100);
        assert_eq!(progress_percent(5, 0), 0);
    }

    #[test]
    fn gate_fires_on_five_percent_boundaries() {
        let mut gate = ProgressGate::default();
        assert!(gate.should_emit(0));
        assert!(!gate.should_emit(2));
        assert!(!gate.should_emit(4));
        assert!(gate.should_emit(5));
        assert!(!gate.should_emit(9));
        assert!(gate.should_emit(10));
        assert!(gate.should_emit(100));
    }

    #[test]
    fn remote_hash_command_quotes_the_path_and_tries_fallback_tools() {
        let cmd = build_remote_sha256_command("/srv/my file.bin");
        assert!(cmd.contains("PATH_ARG='/srv/my file.bin'"));
        assert!(cmd.contains("sha256sum"));
        assert!(cmd.contains("shasum -a 256"));
        assert!(cmd.contains("openssl dgst -sha256"));
        assert!(cmd.ends_with("exit 127"));
    }

    #[test]
    fn sha256_is_parsed_from_tool_output() {
        let digest = "A".repeat(64);
        let out = format!("{}  /srv/file\n", digest);
        assert_eq!(
            parse_sha256_from_output(&out).as_deref(),
            Some(digest.to_lowercase().as_str())
        );
        assert_eq!(parse_sha256_from_output("no digest here"), None);
        assert_eq!(parse_sha256_from_output("deadbeef"), None);
    }

    #[test]
    fn ten_megabyte_upload_emits_at_least_twenty_events() {
        // 5% granularity over a full transfer is 21 buckets (0..=100).
        let size: u64 = 10 * 1024 * 1024;
        let chunk: u64 = 32 * 1024;
        let mut gate = ProgressGate::default();
        let mut events = 0;
        let mut sent = 0;
        while sent < size {
            sent = (sent + chunk).min(size);
            if gate.should_emit(progress_percent(sent, size)) {
                events += 1;
            }
        }
        assert!(events >= 20, "expected >= 20 events, got {}", events);
    }
}
