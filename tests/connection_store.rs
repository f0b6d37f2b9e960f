mod common;
use common::tmp_dir;

use ssh_broker::services::store::{ConnectionRecord, ConnectionStore};

fn record(id: &str, host: &str) -> ConnectionRecord {
    ConnectionRecord {
        id: id.to_string(),
        name: Some("staging".to_string()),
        host: host.to_string(),
        port: 22,
        username: "deploy".to_string(),
        private_key: None,
        last_used: None,
        tags: vec!["web".to_string()],
    }
}

#[test]
fn upsert_get_remove_roundtrip() {
    let path = tmp_dir("broker-store").join("connections.json");
    let store = ConnectionStore::open(path).expect("open");

    store.upsert(record("c1", "h1")).expect("upsert");
    let loaded = store.get("c1").expect("record");
    assert_eq!(loaded.host, "h1");
    assert_eq!(loaded.tags, vec!["web".to_string()]);

    assert!(store.remove("c1").expect("remove"));
    assert!(!store.remove("c1").expect("second remove is a no-op"));
    assert!(store.get("c1").is_none());
}

#[test]
fn records_survive_reopen() {
    let path = tmp_dir("broker-store-reopen").join("connections.json");
    {
        let store = ConnectionStore::open(path.clone()).expect("open");
        store.upsert(record("c2", "h2")).expect("upsert");
        store
            .touch_last_used("c2", "2026-08-02T00:00:00Z")
            .expect("touch");
    }
    let store = ConnectionStore::open(path).expect("reopen");
    let loaded = store.get("c2").expect("record");
    assert_eq!(loaded.host, "h2");
    assert_eq!(loaded.last_used.as_deref(), Some("2026-08-02T00:00:00Z"));
}

#[test]
fn list_is_sorted_by_id() {
    let path = tmp_dir("broker-store-list").join("connections.json");
    let store = ConnectionStore::open(path).expect("open");
    store.upsert(record("b", "h2")).expect("upsert");
    store.upsert(record("a", "h1")).expect("upsert");
    let ids: Vec<String> = store.list().into_iter().map(|r| r.id).collect();
    assert_eq!(ids, vec!["a".to_string(), "b".to_string()]);
}
