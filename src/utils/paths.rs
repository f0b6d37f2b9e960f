use std::env;
use std::path::PathBuf;

fn normalize_env_path(value: Option<String>) -> Option<PathBuf> {
    let raw = value?;
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return None;
    }
    Some(PathBuf::from(trimmed))
}

fn resolve_home_dir() -> Option<PathBuf> {
    env::var("HOME").ok().map(PathBuf::from)
}

fn resolve_xdg_state_dir() -> Option<PathBuf> {
    if let Some(path) = normalize_env_path(env::var("XDG_STATE_HOME").ok()) {
        return Some(path);
    }
    resolve_home_dir().map(|home| home.join(".local").join("state"))
}

fn resolve_entry_dir() -> Option<PathBuf> {
    env::current_exe()
        .ok()
        .and_then(|exe| exe.parent().map(|p| p.to_path_buf()))
}

pub fn resolve_data_dir() -> PathBuf {
    if let Some(path) = normalize_env_path(env::var("SSH_BROKER_DATA_DIR").ok()) {
        return path;
    }
    if let Some(path) = resolve_xdg_state_dir() {
        return path.join("ssh-broker");
    }
    resolve_entry_dir().unwrap_or_else(|| env::current_dir().unwrap_or_else(|_| PathBuf::from(".")))
}

pub fn resolve_connections_path() -> PathBuf {
    resolve_data_dir().join("connections.json")
}

pub fn resolve_credentials_path() -> PathBuf {
    resolve_data_dir().join("credentials.json")
}

pub fn resolve_store_key_path() -> PathBuf {
    if let Some(path) = normalize_env_path(env::var("SSH_BROKER_KEY_PATH").ok()) {
        return path;
    }
    resolve_data_dir().join(".broker.key")
}

pub fn resolve_lockfile_path() -> PathBuf {
    if let Some(path) = normalize_env_path(env::var("SSH_BROKER_LOCKFILE").ok()) {
        return path;
    }
    resolve_data_dir().join("broker.lock")
}
