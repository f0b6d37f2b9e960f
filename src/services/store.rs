use crate::errors::ToolError;
use crate::utils::fs_atomic::atomic_write_text_file;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::RwLock;

/// Non-secret connection document persisted across broker restarts.
/// Passwords never enter this store; private keys may, since the original
/// config can reference key material directly.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectionRecord {
    pub id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    pub host: String,
    pub port: u16,
    pub username: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub private_key: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_used: Option<String>,
    #[serde(default)]
    pub tags: Vec<String>,
}

pub struct ConnectionStore {
    path: PathBuf,
    records: RwLock<HashMap<String, ConnectionRecord>>,
}

impl ConnectionStore {
    pub fn open(path: PathBuf) -> Result<Self, ToolError> {
        let records = match std::fs::read_to_string(&path) {
            Ok(raw) => serde_json::from_str::<HashMap<String, ConnectionRecord>>(&raw)
                .map_err(|err| {
                    ToolError::internal(format!("Failed to parse connection store: {}", err))
                })?,
            Err(_) => HashMap::new(),
        };
        Ok(Self {
            path,
            records: RwLock::new(records),
        })
    }

    fn persist(&self) -> Result<(), ToolError> {
        let guard = self.records.read().unwrap();
        let data = serde_json::to_string_pretty(&*guard).map_err(|err| {
            ToolError::internal(format!("Failed to serialize connection store: {}", err))
        })?;
        atomic_write_text_file(&self.path, &format!("{}\n", data), 0o600)
            .map_err(|err| ToolError::internal(format!("Failed to save connections: {}", err)))
    }

    pub fn upsert(&self, record: ConnectionRecord) -> Result<(), ToolError> {
        self.records
            .write()
            .unwrap()
            .insert(record.id.clone(), record);
        self.persist()
    }

    pub fn touch_last_used(&self, id: &str, timestamp: &str) -> Result<(), ToolError> {
        {
            let mut guard = self.records.write().unwrap();
            if let Some(record) = guard.get_mut(id) {
                record.last_used = Some(timestamp.to_string());
            } else {
                return Ok(());
            }
        }
        self.persist()
    }

    pub fn get(&self, id: &str) -> Option<ConnectionRecord> {
        self.records.read().unwrap().get(id).cloned()
    }

    pub fn remove(&self, id: &str) -> Result<bool, ToolError> {
        let removed = self.records.write().unwrap().remove(id).is_some();
        if removed {
            self.persist()?;
        }
        Ok(removed)
    }

    pub fn list(&self) -> Vec<ConnectionRecord> {
        let mut records: Vec<ConnectionRecord> =
            self.records.read().unwrap().values().cloned().collect();
        records.sort_by(|a, b| a.id.cmp(&b.id));
        records
    }
}
