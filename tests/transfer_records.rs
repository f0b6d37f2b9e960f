mod common;
use common::tmp_dir;

use chrono::{Duration, Utc};
use ssh_broker::services::credentials::CredentialStore;
use ssh_broker::services::events::EventBus;
use ssh_broker::services::logger::Logger;
use ssh_broker::services::registry::ConnectionRegistry;
use ssh_broker::services::security::Security;
use ssh_broker::services::store::ConnectionStore;
use ssh_broker::services::transfers::{
    TransferDirection, TransferManager, TransferStatus,
};
use std::sync::Arc;

fn manager() -> Arc<TransferManager> {
    let logger = Logger::new("test");
    let dir = tmp_dir("broker-transfers");
    let store = Arc::new(ConnectionStore::open(dir.join("connections.json")).expect("store"));
    let security = Arc::new(Security::from_key(&[5u8; 32]).expect("security"));
    let credentials = Arc::new(CredentialStore::with_encrypted_backend(
        logger.clone(),
        security,
        dir.join("credentials.json"),
    ));
    let registry = Arc::new(ConnectionRegistry::new(
        logger.clone(),
        store,
        credentials,
        EventBus::default(),
    ));
    Arc::new(TransferManager::new(logger, registry, EventBus::default()))
}

#[test]
fn tracked_transfer_starts_pending_with_zero_progress() {
    let manager = manager();
    let record = manager.track(
        "conn-1",
        TransferDirection::Upload,
        "/tmp/a.txt",
        "/srv/a.txt",
    );
    assert_eq!(record.status, TransferStatus::Pending);
    assert_eq!(record.progress, 0);
    assert_eq!(record.bytes_transferred, 0);
    assert!(manager.get(&record.id).is_some());
}

#[tokio::test]
async fn failed_transfer_keeps_record_for_inspection() {
    let manager = manager();
    let record = manager.track(
        "unknown-conn",
        TransferDirection::Upload,
        "/tmp/a.txt",
        "/srv/a.txt",
    );
    let err = manager.run(record.id.clone()).await.expect_err("must fail");
    assert_eq!(err.code, "TRANSFER_FAILED");

    let kept = manager.get(&record.id).expect("record retained");
    assert_eq!(kept.status, TransferStatus::Failed);
    assert!(kept.error.is_some());
    assert!(kept.end_time.is_some());
}

#[tokio::test]
async fn sweep_removes_only_old_terminal_records() {
    let manager = manager();
    let failed = manager.track(
        "unknown-conn",
        TransferDirection::Download,
        "./x",
        "/srv/x",
    );
    let _ = manager.run(failed.id.clone()).await;
    let pending = manager.track("conn-2", TransferDirection::Upload, "./y", "/srv/y");

    // Within the retention window nothing goes away.
    assert_eq!(manager.sweep(Utc::now(), 3_600_000), 0);
    assert!(manager.get(&failed.id).is_some());

    // Two hours later the failed record is swept, the pending one stays.
    let later = Utc::now() + Duration::hours(2);
    assert_eq!(manager.sweep(later, 3_600_000), 1);
    assert!(manager.get(&failed.id).is_none());
    assert!(manager.get(&pending.id).is_some());
}

#[tokio::test]
async fn batch_returns_one_id_per_item_up_front() {
    let manager = manager();
    let ids = manager.batch(
        "unknown-conn",
        TransferDirection::Download,
        vec![
            ("./a".to_string(), "/srv/a".to_string()),
            ("./b".to_string(), "/srv/b".to_string()),
            ("./c".to_string(), "/srv/c".to_string()),
        ],
    );
    assert_eq!(ids.len(), 3);
    for id in &ids {
        assert!(manager.get(id).is_some());
    }

    // The background worker runs the items sequentially; with an unknown
    // connection every record must end up failed, none removed.
    for _ in 0..100 {
        let all_terminal = ids
            .iter()
            .all(|id| manager.get(id).map(|r| r.status.is_terminal()).unwrap_or(false));
        if all_terminal {
            break;
        }
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
    }
    for id in &ids {
        let record = manager.get(id).expect("record");
        assert_eq!(record.status, TransferStatus::Failed);
    }
}
