use crate::constants::crypto::{IV_SIZE, KEY_SIZE, TAG_SIZE};
use crate::errors::ToolError;
use crate::utils::paths::resolve_store_key_path;
use aes_gcm::aead::{Aead, KeyInit, OsRng};
use aes_gcm::Aes256Gcm;
use rand::RngCore;
use std::fs;
use std::io::Write;
use std::path::PathBuf;

fn decode_key(raw: &str) -> Option<Vec<u8>> {
    let trimmed = raw.trim();
    if trimmed.len() == KEY_SIZE * 2 {
        return hex::decode(trimmed).ok();
    }
    if trimmed.len() == KEY_SIZE {
        return Some(trimmed.as_bytes().to_vec());
    }
    None
}

/// AES-256-GCM envelope for secrets that land on disk. The key lives beside
/// the data files with 0600 permissions and is generated on first use.
#[derive(Clone)]
pub struct Security {
    cipher: Aes256Gcm,
}

impl Security {
    pub fn new() -> Result<Self, ToolError> {
        let key_path = resolve_store_key_path();
        let secret_key = Self::load_or_create_secret(&key_path)?;
        Self::from_key(&secret_key)
    }

    pub fn from_key(secret_key: &[u8]) -> Result<Self, ToolError> {
        if secret_key.len() != KEY_SIZE {
            return Err(ToolError::internal("Encryption key must be 32 bytes"));
        }
        let key = aes_gcm::Key::<Aes256Gcm>::from_slice(secret_key);
        Ok(Self {
            cipher: Aes256Gcm::new(key),
        })
    }

    fn load_or_create_secret(path: &PathBuf) -> Result<Vec<u8>, ToolError> {
        if let Ok(raw) = std::env::var("SSH_BROKER_ENCRYPTION_KEY") {
            if let Some(decoded) = decode_key(&raw) {
                return Ok(decoded);
            }
        }

        if path.exists() {
            if let Ok(stored) = fs::read_to_string(path) {
                if let Some(decoded) = decode_key(&stored) {
                    return Ok(decoded);
                }
            }
        }

        let mut generated = vec![0u8; KEY_SIZE];
        OsRng.fill_bytes(&mut generated);
        if let Some(parent) = path.parent() {
            let _ = fs::create_dir_all(parent);
        }
        if let Ok(mut file) = fs::OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(path)
        {
            #[cfg(unix)]
            {
                use std::os::unix::fs::PermissionsExt;
                let _ = file.set_permissions(fs::Permissions::from_mode(0o600));
            }
            let _ = file.write_all(hex::encode(&generated).as_bytes());
        }
        Ok(generated)
    }

    pub fn encrypt(&self, text: &str) -> Result<String, ToolError> {
        let mut iv = [0u8; IV_SIZE];
        OsRng.fill_bytes(&mut iv);
        let nonce = aes_gcm::Nonce::from_slice(&iv);
        let mut ciphertext = self
            .cipher
            .encrypt(nonce, text.as_bytes())
            .map_err(|_| ToolError::internal("Failed to encrypt secret payload"))?;
        if ciphertext.len() < TAG_SIZE {
            return Err(ToolError::internal("Failed to encrypt secret payload"));
        }
        let tag = ciphertext.split_off(ciphertext.len() - TAG_SIZE);
        Ok(format!(
            "{}:{}:{}",
            hex::encode(iv),
            hex::encode(tag),
            hex::encode(ciphertext)
        ))
    }

    pub fn decrypt(&self, payload: &str) -> Result<String, ToolError> {
        let mut parts = payload.split(':');
        let (Some(iv_hex), Some(tag_hex), Some(cipher_hex)) =
            (parts.next(), parts.next(), parts.next())
        else {
            return Err(ToolError::internal("Malformed encrypted payload"));
        };
        let iv = hex::decode(iv_hex)
            .map_err(|_| ToolError::internal("Malformed encrypted payload"))?;
        let tag = hex::decode(tag_hex)
            .map_err(|_| ToolError::internal("Malformed encrypted payload"))?;
        let mut ciphertext = hex::decode(cipher_hex)
            .map_err(|_| ToolError::internal("Malformed encrypted payload"))?;
        if iv.len() != IV_SIZE || tag.len() != TAG_SIZE {
            return Err(ToolError::internal("Malformed encrypted payload"));
        }
        ciphertext.extend_from_slice(&tag);
        let nonce = aes_gcm::Nonce::from_slice(&iv);
        let plain = self
            .cipher
            .decrypt(nonce, ciphertext.as_ref())
            .map_err(|_| ToolError::internal("Failed to decrypt secret payload"))?;
        String::from_utf8(plain).map_err(|_| ToolError::internal("Decrypted payload is not UTF-8"))
    }
}

#[cfg(test)]
mod tests {
    use super::Security;

    #[test]
    fn roundtrips_secret_payloads() {
        let security = Security::from_key(&[3u8; 32]).expect("security");
        let cipher = security.encrypt("hunter2").expect("encrypt");
        assert_ne!(cipher, "hunter2");
        assert_eq!(cipher.split(':').count(), 3);
        assert_eq!(security.decrypt(&cipher).expect("decrypt"), "hunter2");
    }

    #[test]
    fn rejects_tampered_payloads() {
        let security = Security::from_key(&[3u8; 32]).expect("security");
        let cipher = security.encrypt("secret").expect("encrypt");
        let mut tampered: Vec<String> = cipher.split(':').map(|s| s.to_string()).collect();
        tampered[2] = tampered[2].chars().rev().collect();
        assert!(security.decrypt(&tampered.join(":")).is_err());
    }
}
