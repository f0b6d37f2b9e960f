mod common;
use common::tmp_dir;

use ssh_broker::services::credentials::CredentialStore;
use ssh_broker::services::logger::Logger;
use ssh_broker::services::security::Security;
use std::sync::Arc;

fn encrypted_store(dir: &std::path::Path) -> CredentialStore {
    let security = Arc::new(Security::from_key(&[11u8; 32]).expect("security"));
    CredentialStore::with_encrypted_backend(
        Logger::new("test"),
        security,
        dir.join("credentials.json"),
    )
}

#[test]
fn save_load_delete_roundtrip() {
    let dir = tmp_dir("broker-creds");
    std::fs::create_dir_all(&dir).expect("create dir");
    let store = encrypted_store(&dir);

    store
        .save("conn-1", Some("hunter2"), Some("keyphrase"))
        .expect("save");
    let loaded = store.load("conn-1");
    assert_eq!(loaded.password.as_deref(), Some("hunter2"));
    assert_eq!(loaded.passphrase.as_deref(), Some("keyphrase"));

    store.delete("conn-1");
    assert!(store.load("conn-1").is_empty());
}

#[test]
fn secrets_never_land_on_disk_in_plaintext() {
    let dir = tmp_dir("broker-creds-plain");
    std::fs::create_dir_all(&dir).expect("create dir");
    let store = encrypted_store(&dir);
    store
        .save("conn-2", Some("supersecretpw"), None)
        .expect("save");

    let raw = std::fs::read_to_string(dir.join("credentials.json")).expect("read file");
    assert!(!raw.contains("supersecretpw"));
    assert!(raw.contains("conn-2"));
}

#[test]
fn partial_save_keeps_other_secret() {
    let dir = tmp_dir("broker-creds-partial");
    std::fs::create_dir_all(&dir).expect("create dir");
    let store = encrypted_store(&dir);

    store.save("conn-3", Some("pw"), None).expect("save pw");
    store
        .save("conn-3", None, Some("phrase"))
        .expect("save phrase");
    let loaded = store.load("conn-3");
    assert_eq!(loaded.password.as_deref(), Some("pw"));
    assert_eq!(loaded.passphrase.as_deref(), Some("phrase"));
}

#[test]
fn lookup_of_unknown_connection_is_empty_not_fatal() {
    let dir = tmp_dir("broker-creds-missing");
    std::fs::create_dir_all(&dir).expect("create dir");
    let store = encrypted_store(&dir);
    assert!(store.load("nope").is_empty());
}

#[test]
fn persists_across_reopen() {
    let dir = tmp_dir("broker-creds-reopen");
    std::fs::create_dir_all(&dir).expect("create dir");
    {
        let store = encrypted_store(&dir);
        store.save("conn-4", Some("pw4"), None).expect("save");
    }
    let reopened = encrypted_store(&dir);
    assert_eq!(reopened.load("conn-4").password.as_deref(), Some("pw4"));
}
