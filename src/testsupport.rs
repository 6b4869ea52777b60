//! Supports testing the pool without real application workers.
//!
//! [`EchoSpawner`] is an in-process [`Spawner`]: every "worker" is a
//! Unix listener plus an accept thread that answers the session
//! protocol, so the full scheduler path can run inside one test binary.
//! Spawn failures and slow spawns are scriptable.
//!
//! Requires the `test-support` feature.

use std::io::Read;
use std::os::unix::net::{UnixListener, UnixStream};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use tempfile::TempDir;

use crate::channel::MessageChannel;
use crate::error::PoolError;
use crate::options::Options;
use crate::pool::Pool;
use crate::process::{Process, Socket};
use crate::random::RandomGenerator;
use crate::spawn::{Spawner, SpawnerFactory};

/// One request a fake worker received, parsed from the session protocol.
#[derive(Debug, Clone)]
pub struct WorkerRequest {
    pub method: String,
    pub connect_password: String,
}

/// An in-process spawner producing fake echo workers.
pub struct EchoSpawner {
    dir: TempDir,
    random: Arc<RandomGenerator>,
    spawn_count: AtomicUsize,
    fail_next: AtomicUsize,
    spawn_delay: Mutex<Duration>,
    emit_stderr: AtomicBool,
    interrupted: AtomicBool,
    requests: Arc<Mutex<Vec<WorkerRequest>>>,
}

impl EchoSpawner {
    pub fn new(random: Arc<RandomGenerator>) -> EchoSpawner {
        EchoSpawner {
            dir: TempDir::new().expect("cannot create temp dir for echo workers"),
            random,
            spawn_count: AtomicUsize::new(0),
            fail_next: AtomicUsize::new(0),
            spawn_delay: Mutex::new(Duration::from_millis(0)),
            emit_stderr: AtomicBool::new(false),
            interrupted: AtomicBool::new(false),
            requests: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Makes the next `n` spawn attempts fail.
    pub fn fail_next(&self, n: usize) {
        self.fail_next.store(n, Ordering::SeqCst);
    }

    /// Artificial spawn latency, to widen race windows in tests.
    pub fn set_spawn_delay(&self, delay: Duration) {
        *self.spawn_delay.lock().unwrap() = delay;
    }

    /// Makes workers write a greeting to their stderr pipe.
    pub fn set_emit_stderr(&self, enabled: bool) {
        self.emit_stderr.store(enabled, Ordering::SeqCst);
    }

    /// How many workers were spawned successfully.
    pub fn spawn_count(&self) -> usize {
        self.spawn_count.load(Ordering::SeqCst)
    }

    /// Every request any fake worker has received so far.
    pub fn requests(&self) -> Vec<WorkerRequest> {
        self.requests.lock().unwrap().clone()
    }
}

impl Spawner for EchoSpawner {
    fn spawn(&self, options: &Options) -> Result<Process, PoolError> {
        let failed = self
            .fail_next
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |v| {
                if v > 0 {
                    Some(v - 1)
                } else {
                    None
                }
            })
            .is_ok();
        if failed {
            return Err(PoolError::spawn_failed("simulated spawn failure"));
        }

        let delay = *self.spawn_delay.lock().unwrap();
        let mut waited = Duration::from_millis(0);
        while waited < delay {
            if self.interrupted.load(Ordering::SeqCst) {
                return Err(PoolError::spawn_failed("spawn interrupted"));
            }
            let step = Duration::from_millis(5).min(delay - waited);
            thread::sleep(step);
            waited += step;
        }
        if self.interrupted.load(Ordering::SeqCst) {
            return Err(PoolError::spawn_failed("spawn interrupted"));
        }

        let n = self.spawn_count.fetch_add(1, Ordering::SeqCst) + 1;
        let path = self.dir.path().join(format!("worker-{}.sock", n));
        let listener = UnixListener::bind(&path)
            .map_err(|e| PoolError::spawn_failed(format!("cannot bind worker socket: {}", e)))?;
        let password = self.random.ascii_string(43);

        let requests = self.requests.clone();
        let worker_password = password.clone();
        thread::Builder::new()
            .name(format!("echo worker {}", n))
            .spawn(move || {
                for stream in listener.incoming() {
                    match stream {
                        Ok(stream) => serve_connection(stream, &requests, &worker_password),
                        Err(_) => break,
                    }
                }
            })
            .map_err(|e| PoolError::spawn_failed(format!("cannot start worker thread: {}", e)))?;

        let stderr: Option<Box<dyn Read + Send>> = if self.emit_stderr.load(Ordering::SeqCst) {
            match UnixStream::pair() {
                Ok((reader, writer)) => {
                    thread::spawn(move || {
                        use std::io::Write;
                        let mut writer = writer;
                        writeln!(writer, "worker {} booted", n).ok();
                    });
                    Some(Box::new(reader))
                }
                Err(_) => None,
            }
        } else {
            None
        };

        Ok(Process::new(
            0,
            self.random.gupid(),
            password,
            options.concurrency,
            vec![Socket::new(path)],
            stderr,
        ))
    }

    fn interrupt(&self) {
        self.interrupted.store(true, Ordering::SeqCst);
    }
}

fn serve_connection(stream: UnixStream, requests: &Arc<Mutex<Vec<WorkerRequest>>>, password: &str) {
    let channel = MessageChannel::from_stream(stream);
    let payload = match channel.read_scalar() {
        Ok(payload) => payload,
        Err(_) => return,
    };
    let fields: Vec<String> = payload
        .split(|&b| b == 0)
        .filter(|f| !f.is_empty())
        .map(|f| String::from_utf8_lossy(f).into_owned())
        .collect();
    let mut method = String::new();
    let mut connect_password = String::new();
    for pair in fields.chunks(2) {
        if pair.len() != 2 {
            continue;
        }
        match pair[0].as_str() {
            "REQUEST_METHOD" => method = pair[1].clone(),
            "PASSENGER_CONNECT_PASSWORD" => connect_password = pair[1].clone(),
            _ => {}
        }
    }
    if connect_password == password {
        requests.lock().unwrap().push(WorkerRequest {
            method,
            connect_password,
        });
    }
    channel.write_scalar(b"ok").ok();
}

/// Hands the same [`EchoSpawner`] to every group, so tests can steer
/// and observe spawning across groups and restarts.
pub struct EchoSpawnerFactory {
    spawner: Arc<EchoSpawner>,
}

impl EchoSpawnerFactory {
    pub fn new(spawner: Arc<EchoSpawner>) -> EchoSpawnerFactory {
        EchoSpawnerFactory { spawner }
    }
}

impl SpawnerFactory for EchoSpawnerFactory {
    fn create(&self, _options: &Options) -> Arc<dyn Spawner> {
        self.spawner.clone()
    }
}

/// A pool wired to a shared [`EchoSpawner`], ready for tests.
pub fn test_pool(max: usize) -> (Pool, Arc<EchoSpawner>) {
    let random = Arc::new(RandomGenerator::new());
    let spawner = Arc::new(EchoSpawner::new(random.clone()));
    let factory = Arc::new(EchoSpawnerFactory::new(spawner.clone()));
    let pool = Pool::builder(factory)
        .max(max)
        .random_generator(random)
        .build();
    (pool, spawner)
}
