use crate::constants::keyring_service::{PASSPHRASE_SERVICE, PASSWORD_SERVICE};
use crate::errors::ToolError;
use crate::services::logger::Logger;
use crate::services::security::Security;
use crate::utils::fs_atomic::atomic_write_text_file;
use keyring::Entry;
use serde_json::Value;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, RwLock};

#[derive(Debug, Clone, Default)]
pub struct StoredSecrets {
    pub password: Option<String>,
    pub passphrase: Option<String>,
}

impl StoredSecrets {
    pub fn is_empty(&self) -> bool {
        self.password.is_none() && self.passphrase.is_none()
    }
}

enum Backend {
    Keyring,
    Encrypted(EncryptedCollection),
}

/// Per-connection secrets. Uses the OS keyring under two service names when
/// one is reachable, otherwise an AES-GCM encrypted JSON collection beside
/// the connection store. Lookup failures are downgraded to "no stored
/// secret" so connect flows can fall back to config-supplied material.
pub struct CredentialStore {
    logger: Logger,
    backend: Backend,
}

impl CredentialStore {
    pub fn new(logger: Logger, security: Arc<Security>, fallback_path: PathBuf) -> Self {
        let logger = logger.child("credentials");
        let keyring_enabled = std::env::var("SSH_BROKER_DISABLE_KEYRING").is_err();
        let backend = if keyring_enabled && keyring_available() {
            logger.debug("using OS keyring backend", None);
            Backend::Keyring
        } else {
            logger.info(
                "OS keyring unavailable, using encrypted local collection",
                None,
            );
            Backend::Encrypted(EncryptedCollection::open(security, fallback_path))
        };
        Self { logger, backend }
    }

    /// Force the encrypted collection, bypassing the keyring probe.
    pub fn with_encrypted_backend(
        logger: Logger,
        security: Arc<Security>,
        fallback_path: PathBuf,
    ) -> Self {
        Self {
            logger: logger.child("credentials"),
            backend: Backend::Encrypted(EncryptedCollection::open(security, fallback_path)),
        }
    }

    pub fn save(
        &self,
        connection_id: &str,
        password: Option<&str>,
        passphrase: Option<&str>,
    ) -> Result<(), ToolError> {
        match &self.backend {
            Backend::Keyring => {
                if let Some(password) = password {
                    keyring_set(PASSWORD_SERVICE, connection_id, password)?;
                }
                if let Some(passphrase) = passphrase {
                    keyring_set(PASSPHRASE_SERVICE, connection_id, passphrase)?;
                }
                Ok(())
            }
            Backend::Encrypted(collection) => collection.save(connection_id, password, passphrase),
        }
    }

    pub fn load(&self, connection_id: &str) -> StoredSecrets {
        let result = match &self.backend {
            Backend::Keyring => Ok(StoredSecrets {
                password: keyring_get(PASSWORD_SERVICE, connection_id),
                passphrase: keyring_get(PASSPHRASE_SERVICE, connection_id),
            }),
            Backend::Encrypted(collection) => collection.load(connection_id),
        };
        match result {
            Ok(secrets) => secrets,
            Err(err) => {
                self.logger.warn(
                    "credential lookup failed",
                    Some(&serde_json::json!({"connection_id": connection_id, "error": err.message})),
                );
                StoredSecrets::default()
            }
        }
    }

    pub fn delete(&self, connection_id: &str) {
        match &self.backend {
            Backend::Keyring => {
                keyring_delete(PASSWORD_SERVICE, connection_id);
                keyring_delete(PASSPHRASE_SERVICE, connection_id);
            }
            Backend::Encrypted(collection) => {
                if let Err(err) = collection.delete(connection_id) {
                    self.logger.warn(
                        "credential delete failed",
                        Some(&serde_json::json!({"connection_id": connection_id, "error": err.message})),
                    );
                }
            }
        }
    }
}

fn keyring_available() -> bool {
    let probe = match Entry::new(PASSWORD_SERVICE, "__broker_keyring_probe__") {
        Ok(entry) => entry,
        Err(_) => return false,
    };
    if probe.set_password("probe").is_err() {
        return false;
    }
    let _ = probe.delete_password();
    true
}

fn keyring_set(service: &str, user: &str, secret: &str) -> Result<(), ToolError> {
    Entry::new(service, user)
        .and_then(|entry| entry.set_password(secret))
        .map_err(|err| ToolError::internal(format!("Keyring write failed: {}", err)))
}

fn keyring_get(service: &str, user: &str) -> Option<String> {
    Entry::new(service, user)
        .ok()
        .and_then(|entry| entry.get_password().ok())
}

fn keyring_delete(service: &str, user: &str) {
    if let Ok(entry) = Entry::new(service, user) {
        let _ = entry.delete_password();
    }
}

struct EncryptedCollection {
    security: Arc<Security>,
    path: PathBuf,
    entries: RwLock<HashMap<String, Value>>,
}

impl EncryptedCollection {
    fn open(security: Arc<Security>, path: PathBuf) -> Self {
        let entries = std::fs::read_to_string(&path)
            .ok()
            .and_then(|raw| serde_json::from_str::<HashMap<String, Value>>(&raw).ok())
            .unwrap_or_default();
        Self {
            security,
            path,
            entries: RwLock::new(entries),
        }
    }

    fn persist(&self) -> Result<(), ToolError> {
        let guard = self.entries.read().unwrap();
        let data = serde_json::to_string_pretty(&*guard)
            .map_err(|err| ToolError::internal(format!("Failed to serialize credentials: {}", err)))?;
        atomic_write_text_file(&self.path, &format!("{}\n", data), 0o600)
            .map_err(|err| ToolError::internal(format!("Failed to save credentials: {}", err)))?;
        Ok(())
    }

    fn save(
        &self,
        connection_id: &str,
        password: Option<&str>,
        passphrase: Option<&str>,
    ) -> Result<(), ToolError> {
        let mut record = serde_json::Map::new();
        if let Some(password) = password {
            record.insert(
                "password".to_string(),
                Value::String(self.security.encrypt(password)?),
            );
        }
        if let Some(passphrase) = passphrase {
            record.insert(
                "passphrase".to_string(),
                Value::String(self.security.encrypt(passphrase)?),
            );
        }
        {
            let mut guard = self.entries.write().unwrap();
            let existing = guard
                .entry(connection_id.to_string())
                .or_insert_with(|| Value::Object(Default::default()));
            if let Value::Object(map) = existing {
                for (key, value) in record {
                    map.insert(key, value);
                }
            }
        }
        self.persist()
    }

    fn load(&self, connection_id: &str) -> Result<StoredSecrets, ToolError> {
        let guard = self.entries.read().unwrap();
        let Some(record) = guard.get(connection_id) else {
            return Ok(StoredSecrets::default());
        };
        let decrypt_field = |field: &str| -> Result<Option<String>, ToolError> {
            match record.get(field).and_then(|v| v.as_str()) {
                Some(cipher) => self.security.decrypt(cipher).map(Some),
                None => Ok(None),
            }
        };
        Ok(StoredSecrets {
            password: decrypt_field("password")?,
            passphrase: decrypt_field("passphrase")?,
        })
    }

    fn delete(&self, connection_id: &str) -> Result<(), ToolError> {
        let removed = self.entries.write().unwrap().remove(connection_id);
        if removed.is_some() {
            self.persist()?;
        }
        Ok(())
    }
}
