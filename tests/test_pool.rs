use std::sync::mpsc;
use std::thread;
use std::time::{Duration, Instant};

use procpool::testsupport::test_pool;
use procpool::{Options, PoolError, Session};

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
fn test_simple_get_and_close() {
    init_logging();
    let (pool, spawner) = test_pool(6);
    let options = Options::new("/a").min_processes(1).max_processes(2);

    let mut session = pool.get_sync(&options, TIMEOUT).unwrap();
    assert_eq!(spawner.spawn_count(), 1);
    assert_eq!(pool.process_count(), 1);
    assert!(pool.spawn_loop_iterations() >= 1);
    assert_eq!(session.process().sessions(), 1);
    session.close();

    let snapshot = pool.snapshot();
    assert_eq!(snapshot.super_groups[0].secret.len(), 43);
    let group = &snapshot.super_groups[0].groups[0];
    assert_eq!(group.name, "/a#default");
    assert_eq!(group.secret.len(), 43);
    assert_eq!(group.enabled_count, 1);
    assert_eq!(group.processes[0].sessions, 0);
    assert_eq!(group.processes[0].processed, 1);
    pool.verify_invariants().unwrap();

    // closing twice is a no-op
    session.close();
    assert_eq!(pool.snapshot().super_groups[0].groups[0].processes[0].processed, 1);
}

#[test]
fn test_detach_process_is_idempotent() {
    init_logging();
    let (pool, _spawner) = test_pool(6);
    let session = pool.get_sync(&Options::new("/a"), TIMEOUT).unwrap();
    let process = session.process().clone();

    assert!(pool.detach_process(&process));
    assert!(!pool.detach_process(&process));
    assert_eq!(pool.process_count(), 0);

    let (tx, rx) = mpsc::channel();
    pool.detach_process_async(
        &process,
        Box::new(move |removed| {
            tx.send(removed).ok();
        }),
    );
    assert!(!rx.recv_timeout(TIMEOUT).unwrap());

    // the open session on the detached worker still closes cleanly
    drop(session);
    pool.verify_invariants().unwrap();
}

#[test]
fn test_session_connects_to_worker() {
    init_logging();
    let (pool, _spawner) = test_pool(6);
    let options = Options::new("/a");

    let mut session = pool.get_sync(&options, TIMEOUT).unwrap();
    session.initiate().unwrap();
    assert!(session.stream().is_some());
    session.close();
}

#[test]
fn test_concurrent_gets_spawn_up_to_group_max() {
    init_logging();
    let (pool, spawner) = test_pool(6);
    let options = Options::new("/a")
        .min_processes(1)
        .max_processes(2)
        .concurrency(1);

    let (tx, rx) = mpsc::channel::<Result<Session, PoolError>>();
    for _ in 0..3 {
        let tx = tx.clone();
        pool.get(
            &options,
            Box::new(move |result| {
                tx.send(result).ok();
            }),
        );
    }

    let first = rx.recv_timeout(TIMEOUT).unwrap().unwrap();
    let second = rx.recv_timeout(TIMEOUT).unwrap().unwrap();
    // both workers are at full capacity, so the third get waits
    assert!(rx.recv_timeout(Duration::from_millis(300)).is_err());
    assert_eq!(spawner.spawn_count(), 2);
    pool.verify_invariants().unwrap();

    drop(first);
    let third = rx.recv_timeout(TIMEOUT).unwrap().unwrap();
    assert_eq!(spawner.spawn_count(), 2);
    drop(second);
    drop(third);
    pool.verify_invariants().unwrap();
}

#[test]
fn test_spawn_failure_reaches_waiters() {
    init_logging();
    let (pool, spawner) = test_pool(6);
    spawner.fail_next(1);

    let err = pool.get_sync(&Options::new("/a"), TIMEOUT).unwrap_err();
    assert!(err.is_spawn_failed());
    assert_eq!(pool.process_count(), 0);

    let snapshot = pool.snapshot();
    let group = &snapshot.super_groups[0].groups[0];
    assert_eq!(group.enabled_count, 0);
    assert!(!group.spawning);
    pool.verify_invariants().unwrap();

    // the failure was transient; the next get spawns normally
    let session = pool.get_sync(&Options::new("/a"), TIMEOUT).unwrap();
    assert_eq!(spawner.spawn_count(), 1);
    drop(session);
}

#[test]
fn test_max_requests_retires_worker() {
    init_logging();
    let (pool, spawner) = test_pool(6);
    let options = Options::new("/a").min_processes(1).max_requests(1);

    let session = pool.get_sync(&options, TIMEOUT).unwrap();
    let first_gupid = session.gupid().to_string();
    drop(session);

    // the worker served its one request and was detached on close
    assert_eq!(pool.process_count(), 0);
    pool.verify_invariants().unwrap();

    let session = pool.get_sync(&options, TIMEOUT).unwrap();
    assert_ne!(session.gupid(), first_gupid);
    assert_eq!(spawner.spawn_count(), 2);
    drop(session);
}

#[test]
fn test_full_pool_parks_new_group_until_capacity_frees() {
    init_logging();
    let (pool, _spawner) = test_pool(1);
    let options_a = Options::new("/a").concurrency(1);

    let session_a = pool.get_sync(&options_a, TIMEOUT).unwrap();
    assert!(pool.at_full_capacity());

    // /b cannot grow: /a's only worker is busy
    let (tx, rx) = mpsc::channel::<Result<Session, PoolError>>();
    pool.get(
        &Options::new("/b"),
        Box::new(move |result| {
            tx.send(result).ok();
        }),
    );
    assert!(rx.recv_timeout(Duration::from_millis(300)).is_err());
    pool.verify_invariants().unwrap();

    // closing /a's session frees the slot: the worker is detached and
    // /b is served
    drop(session_a);
    let session_b = rx.recv_timeout(TIMEOUT).unwrap().unwrap();
    assert_eq!(pool.process_count(), 1);
    drop(session_b);
    pool.verify_invariants().unwrap();
}

#[test]
fn test_full_pool_evicts_idle_worker_for_new_group() {
    init_logging();
    let (pool, spawner) = test_pool(1);

    let session = pool.get_sync(&Options::new("/a"), TIMEOUT).unwrap();
    drop(session);
    assert_eq!(pool.process_count(), 1);

    // /a's worker is idle, so the get for /b evicts it immediately
    let session = pool.get_sync(&Options::new("/b"), TIMEOUT).unwrap();
    assert_eq!(spawner.spawn_count(), 2);
    assert_eq!(pool.process_count(), 1);
    drop(session);
    pool.verify_invariants().unwrap();
}

#[test]
fn test_eviction_picks_group_with_greatest_spare_capacity() {
    init_logging();
    let (pool, spawner) = test_pool(3);

    // /big ends up with two workers, one of them busy
    let options_big = Options::new("/big").min_processes(2).concurrency(1);
    let busy = pool.get_sync(&options_big, TIMEOUT).unwrap();
    wait_until(
        || pool.snapshot().super_groups[0].groups[0].enabled_count == 2,
        "the second /big worker",
    );

    // /idle has a single, completely idle worker
    let session = pool
        .get_sync(&Options::new("/idle").concurrency(1), TIMEOUT)
        .unwrap();
    drop(session);
    assert!(pool.at_full_capacity());

    // /big is the larger group but carries load; /idle has the greater
    // spare capacity and must be the one evicted from
    let session = pool
        .get_sync(&Options::new("/new").concurrency(1), TIMEOUT)
        .unwrap();
    assert_eq!(spawner.spawn_count(), 4);

    let snapshot = pool.snapshot();
    for super_group in &snapshot.super_groups {
        let enabled = super_group.groups[0].enabled_count;
        match super_group.name.as_str() {
            "/big" => assert_eq!(enabled, 2),
            "/idle" => assert_eq!(enabled, 0),
            "/new" => assert_eq!(enabled, 1),
            other => panic!("unexpected group {}", other),
        }
    }
    drop(busy);
    drop(session);
    pool.verify_invariants().unwrap();
}

#[test]
fn test_get_times_out_when_pool_cannot_grow() {
    init_logging();
    let (pool, _spawner) = test_pool(0);
    let err = pool
        .get_sync(&Options::new("/a"), Duration::from_millis(200))
        .unwrap_err();
    assert!(err.is_timeout());
}

#[test]
fn test_inspect_mentions_groups_and_processes() {
    init_logging();
    let (pool, _spawner) = test_pool(6);
    let session = pool.get_sync(&Options::new("/a"), TIMEOUT).unwrap();
    let inspect = pool.inspect();
    assert!(inspect.contains("/a#default"));
    assert!(inspect.contains("sessions=1"));
    drop(session);
}

#[test]
fn test_destroy_fails_parked_waiters() {
    init_logging();
    let (pool, _spawner) = test_pool(1);
    let session = pool.get_sync(&Options::new("/a"), TIMEOUT).unwrap();

    let (tx, rx) = mpsc::channel::<Result<Session, PoolError>>();
    pool.get(
        &Options::new("/b"),
        Box::new(move |result| {
            tx.send(result).ok();
        }),
    );

    pool.destroy();
    let err = rx.recv_timeout(TIMEOUT).unwrap().unwrap_err();
    assert!(err.is_gone());
    assert_eq!(pool.process_count(), 0);

    // closing a session after destruction is silently ignored
    drop(session);
}
