use std::fs::OpenOptions;
use std::os::unix::io::{AsRawFd, FromRawFd, RawFd};
use std::path::PathBuf;
use std::process::{Child, Command, Stdio};
use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use nix::sys::socket::{self, AddressFamily, SockFlag, SockType};

use crate::channel::MessageChannel;
use crate::error::PoolError;
use crate::options::Options;
use crate::process::{Process, Socket};
use crate::random::RandomGenerator;

/// Creates worker processes.
///
/// Implementations are called from a dedicated spawn thread and may
/// block for seconds.  `interrupt` must make a blocked `spawn` return
/// promptly; the returned error is then discarded by the caller.
pub trait Spawner: Send + Sync {
    fn spawn(&self, options: &Options) -> Result<Process, PoolError>;

    /// Best-effort cancellation of an in-flight spawn.
    fn interrupt(&self) {}
}

/// Produces a [`Spawner`] appropriate for a group's options.
pub trait SpawnerFactory: Send + Sync {
    fn create(&self, options: &Options) -> Arc<dyn Spawner>;
}

/// Configuration for [`SpawnManager`].
#[derive(Debug, Clone)]
pub struct SpawnManagerConfig {
    /// The spawn server program, run through `interpreter`.
    pub server_command: String,
    /// Interpreter the server is executed with.
    pub interpreter: String,
    /// Where the server's stdout and stderr go; inherited when `None`.
    pub log_file: Option<PathBuf>,
    /// Pause before restarting a dead spawn server.
    pub respawn_delay: Duration,
}

impl SpawnManagerConfig {
    pub fn new<S: Into<String>>(server_command: S) -> SpawnManagerConfig {
        SpawnManagerConfig {
            server_command: server_command.into(),
            interpreter: "ruby".into(),
            log_file: None,
            respawn_delay: Duration::from_secs(0),
        }
    }
}

/// Client of the external spawn server.
///
/// The server is a long-lived child process reached over a socketpair
/// on its stdin.  A spawn request is the array message
/// `["spawn_application", app_root, user, group, app_type,
/// spawn_method, max_preloader_idle_time]` — the trailing parameters
/// tell the server what kind of application to boot, whether to fork
/// from a preloader ("smart") or exec afresh ("direct"), and how long
/// an idle preloader may be kept around.  The response is an array
/// message carrying the worker pid followed by one passed file
/// descriptor, the worker's listen socket.
///
/// If the server dies in the middle of an operation it is restarted
/// once and the spawn is retried exactly once more; a second failure
/// surfaces to the caller.
pub struct SpawnManager {
    config: SpawnManagerConfig,
    environment: String,
    random: Arc<RandomGenerator>,
    server: Mutex<ServerState>,
    channel_fd: AtomicI32,
    interrupted: AtomicBool,
}

struct ServerState {
    channel: Option<MessageChannel>,
    child: Option<Child>,
}

impl SpawnManager {
    pub fn new(
        config: SpawnManagerConfig,
        environment: String,
        random: Arc<RandomGenerator>,
    ) -> SpawnManager {
        SpawnManager {
            config,
            environment,
            random,
            server: Mutex::new(ServerState {
                channel: None,
                child: None,
            }),
            channel_fd: AtomicI32::new(-1),
            interrupted: AtomicBool::new(false),
        }
    }

    /// The spawn server's pid, if it is running.
    pub fn server_pid(&self) -> Option<u32> {
        self.server.lock().unwrap().child.as_ref().map(|c| c.id())
    }

    fn restart_server(&self, state: &mut ServerState) -> Result<(), PoolError> {
        if let Some(mut child) = state.child.take() {
            state.channel = None;
            self.channel_fd.store(-1, Ordering::SeqCst);
            // TODO: bound this wait; a wedged spawn server stalls the restart
            child.wait().ok();
        }

        let (ours, theirs) = socket::socketpair(
            AddressFamily::Unix,
            SockType::Stream,
            None,
            SockFlag::empty(),
        )
        .map_err(|e| PoolError::spawn_failed(format!("cannot create a Unix socket pair: {}", e)))?;

        let mut cmd = Command::new(&self.config.interpreter);
        cmd.arg(&self.config.server_command);
        cmd.stdin(Stdio::from(theirs));
        match self.config.log_file {
            Some(ref path) => {
                let file = OpenOptions::new()
                    .create(true)
                    .append(true)
                    .open(path)
                    .map_err(|e| {
                        PoolError::spawn_failed(format!(
                            "cannot open log file '{}' for writing: {}",
                            path.display(),
                            e
                        ))
                    })?;
                let file2 = file.try_clone().map_err(|e| {
                    PoolError::spawn_failed(format!("cannot duplicate log file handle: {}", e))
                })?;
                cmd.stdout(Stdio::from(file));
                cmd.stderr(Stdio::from(file2));
            }
            None => {
                // Fold the server's stdout into our stderr.
                let fd = unsafe { libc::dup(libc::STDERR_FILENO) };
                if fd >= 0 {
                    cmd.stdout(unsafe { Stdio::from_raw_fd(fd) });
                }
            }
        }
        if !self.environment.is_empty() {
            cmd.env("RAILS_ENV", &self.environment);
        }

        let child = cmd.spawn().map_err(|e| {
            PoolError::spawn_failed(format!(
                "could not start the spawn server: {}: {}",
                self.config.interpreter, e
            ))
        })?;

        self.channel_fd.store(ours.as_raw_fd(), Ordering::SeqCst);
        state.channel = Some(MessageChannel::new(ours));
        state.child = Some(child);
        Ok(())
    }

    fn send_spawn_command(
        &self,
        channel: &MessageChannel,
        options: &Options,
    ) -> Result<Process, PoolError> {
        let max_preloader_idle_time = options.max_preloader_idle_time.as_secs().to_string();
        channel.write_array([
            "spawn_application",
            options.app_root.as_str(),
            options.user.as_str(),
            options.group.as_str(),
            options.app_type.as_str(),
            options.spawn_method.as_str(),
            max_preloader_idle_time.as_str(),
        ])?;
        let args = channel.read_array()?;
        let pid: u32 = args
            .first()
            .and_then(|s| s.parse().ok())
            .ok_or_else(|| PoolError::protocol("spawn server sent an invalid pid"))?;
        let listen_fd = channel.read_file_descriptor()?;
        let socket = Socket::from_listener_fd(listen_fd)?;
        Ok(Process::new(
            pid,
            self.random.gupid(),
            self.random.ascii_string(43),
            options.concurrency,
            vec![socket],
            None,
        ))
    }
}

impl Spawner for SpawnManager {
    fn spawn(&self, options: &Options) -> Result<Process, PoolError> {
        let mut server = self.server.lock().unwrap();
        if server.channel.is_none() {
            self.restart_server(&mut server)?;
        }
        let first_try = {
            let channel = server.channel.as_ref().unwrap();
            self.send_spawn_command(channel, options)
        };
        let err = match first_try {
            Ok(process) => return Ok(process),
            Err(err) => err,
        };
        if self.interrupted.load(Ordering::SeqCst) {
            return Err(PoolError::spawn_failed("spawn interrupted"));
        }

        log::debug!("spawn server died ({}); attempting to restart it", err);
        if self.config.respawn_delay > Duration::from_secs(0) {
            thread::sleep(self.config.respawn_delay);
        }
        self.restart_server(&mut server)?;
        let channel = server.channel.as_ref().unwrap();
        self.send_spawn_command(channel, options).map_err(|e| {
            PoolError::spawn_failed(format!(
                "could not spawn the application at '{}': {}",
                options.app_root, e
            ))
        })
    }

    fn interrupt(&self) {
        self.interrupted.store(true, Ordering::SeqCst);
        let fd = self.channel_fd.load(Ordering::SeqCst);
        if fd >= 0 {
            socket::shutdown(fd as RawFd, socket::Shutdown::Both).ok();
        }
    }
}

impl Drop for SpawnManager {
    fn drop(&mut self) {
        let mut server = self.server.lock().unwrap();
        server.channel = None;
        if let Some(mut child) = server.child.take() {
            child.wait().ok();
        }
    }
}

/// Factory producing one [`SpawnManager`] per group.
///
/// Both [`SpawnMethod`](crate::SpawnMethod)s route through the same
/// client; the requested method travels in the spawn request and the
/// server acts on it.
pub struct SpawnManagerFactory {
    config: SpawnManagerConfig,
    random: Arc<RandomGenerator>,
}

impl SpawnManagerFactory {
    pub fn new(config: SpawnManagerConfig, random: Arc<RandomGenerator>) -> SpawnManagerFactory {
        SpawnManagerFactory { config, random }
    }
}

impl SpawnerFactory for SpawnManagerFactory {
    fn create(&self, options: &Options) -> Arc<dyn Spawner> {
        Arc::new(SpawnManager::new(
            self.config.clone(),
            options.environment.clone(),
            self.random.clone(),
        ))
    }
}
