use std::fs;
use std::sync::mpsc;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use procpool::testsupport::{test_pool, EchoSpawner, EchoSpawnerFactory};
use procpool::{DisableResult, EnableState, Options, Pool, RandomGenerator};

const TIMEOUT: Duration = Duration::from_secs(10);

fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

fn wait_until<F: FnMut() -> bool>(mut condition: F, what: &str) {
    let deadline = Instant::now() + TIMEOUT;
    while !condition() {
        assert!(Instant::now() < deadline, "timed out waiting for {}", what);
        thread::sleep(Duration::from_millis(10));
    }
}

#[test]
fn test_restart_while_busy() {
    init_logging();
    let (pool, spawner) = test_pool(6);
    let options = Options::new("/a").min_processes(1);

    let session = pool.get_sync(&options, TIMEOUT).unwrap();
    let old_gupid = session.gupid().to_string();

    assert!(pool.restart("/a"));
    assert!(!pool.restart("/missing"));

    // the next get is served by a replacement worker, not the old one
    let replacement = pool.get_sync(&options, TIMEOUT).unwrap();
    assert_ne!(replacement.gupid(), old_gupid);
    assert!(spawner.spawn_count() >= 2);

    // the open session on the detached worker runs to completion
    drop(session);
    drop(replacement);
    pool.verify_invariants().unwrap();
}

#[test]
fn test_restart_file_triggers_one_shot_restart() {
    init_logging();
    let (pool, _spawner) = test_pool(6);
    let dir = tempfile::tempdir().unwrap();
    let app_root = dir.path().to_str().unwrap().to_string();
    fs::create_dir_all(dir.path().join("tmp")).unwrap();
    let options = Options::new(&app_root);

    let session = pool.get_sync(&options, TIMEOUT).unwrap();
    let old_gupid = session.gupid().to_string();
    drop(session);

    let restart_file = dir.path().join("tmp").join("restart.txt");
    fs::write(&restart_file, b"").unwrap();

    let session = pool.get_sync(&options, TIMEOUT).unwrap();
    assert_ne!(session.gupid(), old_gupid);
    // the trigger is consumed
    assert!(!restart_file.exists());
    drop(session);

    // no further restart without a new touch
    let session = pool.get_sync(&options, TIMEOUT).unwrap();
    let settled_gupid = session.gupid().to_string();
    drop(session);
    let session = pool.get_sync(&options, TIMEOUT).unwrap();
    assert_eq!(session.gupid(), settled_gupid);
    drop(session);
}

#[test]
fn test_always_restart_file_triggers_on_mtime_change() {
    init_logging();
    let (pool, _spawner) = test_pool(6);
    let dir = tempfile::tempdir().unwrap();
    let app_root = dir.path().to_str().unwrap().to_string();
    let options = Options::new(&app_root);

    let session = pool.get_sync(&options, TIMEOUT).unwrap();
    let old_gupid = session.gupid().to_string();
    drop(session);

    // the file appearing counts as an mtime change
    fs::write(dir.path().join("always_restart.txt"), b"").unwrap();
    let session = pool.get_sync(&options, TIMEOUT).unwrap();
    assert_ne!(session.gupid(), old_gupid);
    let new_gupid = session.gupid().to_string();
    drop(session);

    // unchanged mtime does not restart again
    let session = pool.get_sync(&options, TIMEOUT).unwrap();
    assert_eq!(session.gupid(), new_gupid);
    drop(session);
}

#[test]
fn test_oobw_walks_worker_through_disable_and_back() {
    init_logging();
    let (pool, spawner) = test_pool(6);
    let options = Options::new("/a");

    let session = pool.get_sync(&options, TIMEOUT).unwrap();
    let password = session.connect_password().to_string();
    let process = session.process().clone();
    session.request_oobw();
    assert!(process.oobw_requested());
    drop(session);

    // the probe reaches the worker with the right credentials
    wait_until(
        || {
            spawner
                .requests()
                .iter()
                .any(|r| r.method == "OOBW" && r.connect_password == password)
        },
        "the OOBW probe",
    );

    // and the worker returns to the rotation afterwards
    wait_until(
        || process.enable_state() == EnableState::Enabled && !process.oobw_requested(),
        "the worker to be re-enabled",
    );
    let snapshot = pool.snapshot();
    let group = &snapshot.super_groups[0].groups[0];
    assert_eq!(group.enabled_count, 1);
    assert_eq!(group.disabled_count, 0);
    pool.verify_invariants().unwrap();
}

#[test]
fn test_disable_defers_until_idle() {
    init_logging();
    let (pool, _spawner) = test_pool(6);
    let options = Options::new("/a").min_processes(2).concurrency(1);

    let session = pool.get_sync(&options, TIMEOUT).unwrap();
    let process = session.process().clone();
    wait_until(
        || pool.snapshot().super_groups[0].groups[0].enabled_count == 2,
        "the second worker",
    );

    let (tx, rx) = mpsc::channel();
    let result = pool.disable_process(
        &process,
        Box::new(move |result| {
            tx.send(result).ok();
        }),
    );
    assert_eq!(result, DisableResult::Deferred);
    assert_eq!(process.enable_state(), EnableState::Disabling);

    // the disable completes when the session finishes
    drop(session);
    assert_eq!(rx.recv_timeout(TIMEOUT).unwrap(), DisableResult::Success);
    assert_eq!(process.enable_state(), EnableState::Disabled);
    pool.verify_invariants().unwrap();

    // disabling again is a no-op; enabling restores the rotation
    let result = pool.disable_process(&process, Box::new(|_| {}));
    assert_eq!(result, DisableResult::Noop);
    pool.enable_process(&process);
    assert_eq!(process.enable_state(), EnableState::Enabled);
    assert_eq!(
        pool.snapshot().super_groups[0].groups[0].enabled_count,
        2
    );
    pool.verify_invariants().unwrap();
}

#[test]
fn test_disable_idle_worker_completes_synchronously() {
    init_logging();
    let (pool, _spawner) = test_pool(6);
    let options = Options::new("/a").min_processes(2).concurrency(1);

    let session = pool.get_sync(&options, TIMEOUT).unwrap();
    let process = session.process().clone();
    drop(session);

    let (tx, rx) = mpsc::channel();
    let result = pool.disable_process(
        &process,
        Box::new(move |result| {
            tx.send(result).ok();
        }),
    );
    assert_eq!(result, DisableResult::Success);
    assert_eq!(rx.recv_timeout(TIMEOUT).unwrap(), DisableResult::Success);
    assert_eq!(process.enable_state(), EnableState::Disabled);
    pool.verify_invariants().unwrap();
}

#[test]
fn test_cleanup_idle_respects_min_processes() {
    init_logging();
    let random = Arc::new(RandomGenerator::new());
    let spawner = Arc::new(EchoSpawner::new(random.clone()));
    let factory = Arc::new(EchoSpawnerFactory::new(spawner.clone()));
    let pool = Pool::builder(factory)
        .max(6)
        .max_idle_time(Duration::from_millis(0))
        .random_generator(random)
        .build();

    // a group that may shrink to nothing
    let session = pool.get_sync(&Options::new("/shrinks").min_processes(0), TIMEOUT).unwrap();
    drop(session);
    // and one that must keep its worker
    let session = pool.get_sync(&Options::new("/keeps").min_processes(1), TIMEOUT).unwrap();
    drop(session);

    assert_eq!(pool.process_count(), 2);
    assert_eq!(pool.cleanup_idle(), 1);
    assert_eq!(pool.process_count(), 1);
    pool.verify_invariants().unwrap();
}

#[test]
fn test_stderr_output_is_drained() {
    init_logging();
    let (pool, spawner) = test_pool(6);
    spawner.set_emit_stderr(true);
    // smoke test: the watcher thread must not disturb the lifecycle
    let session = pool.get_sync(&Options::new("/a"), TIMEOUT).unwrap();
    drop(session);
    pool.verify_invariants().unwrap();
}
