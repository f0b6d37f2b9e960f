mod common;
use common::tmp_dir;

use ssh_broker::services::logger::Logger;
use ssh_broker::services::singleton::SingletonGuard;

fn lock_path() -> std::path::PathBuf {
    let dir = tmp_dir("broker-lock");
    std::fs::create_dir_all(&dir).expect("create dir");
    dir.join("broker.lock")
}

#[test]
fn acquire_writes_and_release_removes_the_lockfile() {
    let path = lock_path();
    let guard = SingletonGuard::acquire(Logger::new("test"), path.clone()).expect("acquire");
    assert!(path.exists());

    let raw = std::fs::read_to_string(&path).expect("read lock");
    let parsed: serde_json::Value = serde_json::from_str(&raw).expect("lock is JSON");
    assert_eq!(
        parsed.get("pid").and_then(|v| v.as_u64()),
        Some(std::process::id() as u64)
    );
    assert_eq!(
        parsed.get("instance_id").and_then(|v| v.as_str()),
        Some(guard.instance_id())
    );

    guard.release();
    assert!(!path.exists());
}

#[test]
fn stale_lockfile_is_replaced() {
    let path = lock_path();

    // A reaped child pid is guaranteed dead.
    let dead_pid = {
        let mut child = std::process::Command::new("true").spawn().expect("spawn");
        let pid = child.id();
        child.wait().expect("wait");
        pid
    };
    std::fs::write(
        &path,
        serde_json::json!({
            "pid": dead_pid,
            "instance_id": "stale-instance",
            "timestamp": "2020-01-01T00:00:00Z",
        })
        .to_string(),
    )
    .expect("write stale lock");

    let guard = SingletonGuard::acquire(Logger::new("test"), path.clone()).expect("acquire");
    let raw = std::fs::read_to_string(&path).expect("read lock");
    assert!(raw.contains(guard.instance_id()));
    guard.release();
}

#[test]
fn live_holder_is_terminated_gracefully() {
    let path = lock_path();

    let mut child = std::process::Command::new("sleep")
        .arg("30")
        .spawn()
        .expect("spawn sleeper");
    let pid = child.id();
    std::fs::write(
        &path,
        serde_json::json!({
            "pid": pid,
            "instance_id": "previous-instance",
            "timestamp": "2020-01-01T00:00:00Z",
        })
        .to_string(),
    )
    .expect("write lock");

    // Reap concurrently so the signalled sleeper does not linger as a
    // zombie, which would still count as alive for the takeover poll.
    let waiter = std::thread::spawn(move || child.wait());
    let guard = SingletonGuard::acquire(Logger::new("test"), path.clone()).expect("takeover");
    let status = waiter.join().expect("join").expect("child exits");
    assert!(!status.success(), "sleeper must have been signalled");
    assert!(path.exists());
    guard.release();
}

#[test]
fn release_leaves_a_successors_lockfile_alone() {
    let path = lock_path();
    let guard = SingletonGuard::acquire(Logger::new("test"), path.clone()).expect("acquire");

    // A successor replaced the file while we were shutting down.
    std::fs::write(
        &path,
        serde_json::json!({
            "pid": std::process::id(),
            "instance_id": "successor-instance",
            "timestamp": "2030-01-01T00:00:00Z",
        })
        .to_string(),
    )
    .expect("overwrite lock");

    guard.release();
    assert!(path.exists(), "successor lockfile must survive");
}

#[test]
fn corrupt_lockfile_is_treated_as_stale() {
    let path = lock_path();
    std::fs::write(&path, "not json at all").expect("write garbage");
    let guard = SingletonGuard::acquire(Logger::new("test"), path.clone()).expect("acquire");
    guard.release();
    assert!(!path.exists());
}
