use std::io::{BufRead, BufReader, Read};
use std::os::unix::io::{AsRawFd, OwnedFd};
use std::os::unix::net::UnixStream;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Instant;

use nix::sys::socket::{getsockname, UnixAddr};

use crate::error::PoolError;
use crate::group::GroupLink;
use crate::pqueue::PqHandle;

const PQ_HANDLE_NONE: usize = usize::MAX;

/// Where a process sits in its group's routing lists.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnableState {
    Enabled,
    Disabling,
    Disabled,
}

impl EnableState {
    fn to_u8(self) -> u8 {
        match self {
            EnableState::Enabled => 0,
            EnableState::Disabling => 1,
            EnableState::Disabled => 2,
        }
    }

    fn from_u8(raw: u8) -> EnableState {
        match raw {
            0 => EnableState::Enabled,
            1 => EnableState::Disabling,
            _ => EnableState::Disabled,
        }
    }
}

/// A connection to a worker, checked out of a [`Socket`].
pub(crate) struct Connection {
    pub stream: UnixStream,
    /// Marked connections are closed on checkin instead of recycled.
    pub fail: bool,
}

/// One listen address of a worker, with a small pool of idle connections.
pub struct Socket {
    path: PathBuf,
    /// Keeps a passed-in listen descriptor alive for the worker's lifetime.
    listener: Option<OwnedFd>,
    sessions: AtomicU32,
    pooled: Mutex<Vec<UnixStream>>,
}

impl Socket {
    /// A socket reachable at a Unix path.
    pub fn new<P: Into<PathBuf>>(path: P) -> Socket {
        Socket {
            path: path.into(),
            listener: None,
            sessions: AtomicU32::new(0),
            pooled: Mutex::new(Vec::new()),
        }
    }

    /// Wraps a listen descriptor received from a spawner, resolving the
    /// address it is bound to.
    pub fn from_listener_fd(fd: OwnedFd) -> Result<Socket, PoolError> {
        let addr = getsockname::<UnixAddr>(fd.as_raw_fd())
            .map_err(|e| PoolError::protocol(format!("cannot resolve listen socket: {}", e)))?;
        let path = addr
            .path()
            .ok_or_else(|| PoolError::protocol("listen socket has no filesystem address"))?
            .to_path_buf();
        Ok(Socket {
            path,
            listener: Some(fd),
            sessions: AtomicU32::new(0),
            pooled: Mutex::new(Vec::new()),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub(crate) fn sessions(&self) -> u32 {
        self.sessions.load(Ordering::SeqCst)
    }

    /// Takes an idle pooled connection if one is available.
    pub(crate) fn checkout(&self) -> Option<Connection> {
        self.pooled.lock().unwrap().pop().map(|stream| Connection {
            stream,
            fail: false,
        })
    }

    /// Opens a fresh connection.  Blocking; never call under the pool lock.
    pub(crate) fn connect(&self) -> Result<Connection, PoolError> {
        let stream = UnixStream::connect(&self.path).map_err(PoolError::io_write)?;
        Ok(Connection {
            stream,
            fail: false,
        })
    }

    /// Returns a connection; failed connections are closed, not recycled.
    pub(crate) fn checkin(&self, conn: Connection) {
        if !conn.fail {
            self.pooled.lock().unwrap().push(conn.stream);
        }
    }
}

/// A single worker process.
///
/// The scheduling counters are atomics so that sessions can read them
/// without the pool lock; all mutation happens under it.
pub struct Process {
    pid: u32,
    gupid: String,
    connect_password: String,
    concurrency: u32,
    sockets: Vec<Socket>,
    sessions: AtomicU32,
    processed: AtomicU64,
    enabled: AtomicU32,
    oobw_requested: AtomicBool,
    detached: AtomicBool,
    pq_handle: AtomicUsize,
    last_used: Mutex<Instant>,
    group: Mutex<Option<Arc<GroupLink>>>,
}

impl Process {
    /// Creates a fully initialized process handle.
    ///
    /// A `pid` of zero marks a process without an OS identity (used by
    /// in-process spawners); it is skipped when signals are delivered.
    pub fn new(
        pid: u32,
        gupid: String,
        connect_password: String,
        concurrency: u32,
        sockets: Vec<Socket>,
        stderr: Option<Box<dyn Read + Send>>,
    ) -> Process {
        if let Some(stderr) = stderr {
            watch_stderr(pid, &gupid, stderr);
        }
        Process {
            pid,
            gupid,
            connect_password,
            concurrency,
            sockets,
            sessions: AtomicU32::new(0),
            processed: AtomicU64::new(0),
            enabled: AtomicU32::new(EnableState::Enabled.to_u8() as u32),
            oobw_requested: AtomicBool::new(false),
            detached: AtomicBool::new(false),
            pq_handle: AtomicUsize::new(PQ_HANDLE_NONE),
            last_used: Mutex::new(Instant::now()),
            group: Mutex::new(None),
        }
    }

    pub fn pid(&self) -> u32 {
        self.pid
    }

    pub fn gupid(&self) -> &str {
        &self.gupid
    }

    pub fn connect_password(&self) -> &str {
        &self.connect_password
    }

    pub fn concurrency(&self) -> u32 {
        self.concurrency
    }

    pub fn sessions(&self) -> u32 {
        self.sessions.load(Ordering::SeqCst)
    }

    pub fn processed(&self) -> u64 {
        self.processed.load(Ordering::SeqCst)
    }

    pub fn enable_state(&self) -> EnableState {
        EnableState::from_u8(self.enabled.load(Ordering::SeqCst) as u8)
    }

    pub(crate) fn set_enable_state(&self, state: EnableState) {
        self.enabled.store(state.to_u8() as u32, Ordering::SeqCst);
    }

    pub fn oobw_requested(&self) -> bool {
        self.oobw_requested.load(Ordering::SeqCst)
    }

    pub(crate) fn set_oobw_requested(&self, value: bool) {
        self.oobw_requested.store(value, Ordering::SeqCst);
    }

    pub fn detached(&self) -> bool {
        self.detached.load(Ordering::SeqCst)
    }

    /// Marks the process as detached.  Returns false if it already was.
    pub(crate) fn detach(&self) -> bool {
        !self.detached.swap(true, Ordering::SeqCst)
    }

    pub(crate) fn pq_handle(&self) -> Option<PqHandle> {
        match self.pq_handle.load(Ordering::SeqCst) {
            PQ_HANDLE_NONE => None,
            raw => Some(PqHandle::from_raw(raw)),
        }
    }

    pub(crate) fn set_pq_handle(&self, handle: Option<PqHandle>) {
        let raw = handle.map(PqHandle::to_raw).unwrap_or(PQ_HANDLE_NONE);
        self.pq_handle.store(raw, Ordering::SeqCst);
    }

    pub(crate) fn group_link(&self) -> Option<Arc<GroupLink>> {
        self.group.lock().unwrap().clone()
    }

    pub(crate) fn set_group_link(&self, link: Arc<GroupLink>) {
        *self.group.lock().unwrap() = Some(link);
    }

    /// The scheduler key: a fixed-point session count, scaled by the
    /// concurrency limit when one exists.  Zero exactly when idle.
    pub fn utilization(&self) -> u64 {
        let sessions = (self.sessions() as u64) << 16;
        if self.concurrency == 0 {
            sessions
        } else {
            sessions / self.concurrency as u64
        }
    }

    pub fn at_full_capacity(&self) -> bool {
        self.concurrency > 0 && self.sessions() >= self.concurrency
    }

    pub(crate) fn sockets(&self) -> &[Socket] {
        &self.sockets
    }

    /// The least-loaded socket; ties go to the earliest one.
    pub(crate) fn best_socket_index(&self) -> usize {
        let mut best = 0;
        for (i, socket) in self.sockets.iter().enumerate().skip(1) {
            if socket.sessions() < self.sockets[best].sessions() {
                best = i;
            }
        }
        best
    }

    /// Atomically claims a session slot on the least-loaded socket,
    /// together with a pooled connection when one is idle.
    pub(crate) fn open_session_slot(&self) -> Result<(usize, Option<Connection>), PoolError> {
        if self.at_full_capacity() {
            return Err(PoolError::at_capacity());
        }
        let socket_index = self.best_socket_index();
        self.sessions.fetch_add(1, Ordering::SeqCst);
        self.sockets[socket_index]
            .sessions
            .fetch_add(1, Ordering::SeqCst);
        let connection = self.sockets[socket_index].checkout();
        Ok((socket_index, connection))
    }

    pub(crate) fn session_closed(&self, socket_index: usize) {
        self.sessions.fetch_sub(1, Ordering::SeqCst);
        self.sockets[socket_index]
            .sessions
            .fetch_sub(1, Ordering::SeqCst);
        self.processed.fetch_add(1, Ordering::SeqCst);
        *self.last_used.lock().unwrap() = Instant::now();
    }

    pub(crate) fn idle_since(&self) -> Instant {
        *self.last_used.lock().unwrap()
    }

    /// Human-readable identification for log messages.
    pub fn inspect(&self) -> String {
        match self.group_link() {
            Some(link) => format!("(pid={}, group={})", self.pid, link.name),
            None => format!("(pid={})", self.pid),
        }
    }

    fn terminate(&self) {
        if self.pid == 0 {
            return;
        }
        log::debug!("terminating process {}", self.inspect());
        unsafe {
            libc::kill(self.pid as libc::pid_t, libc::SIGTERM);
        }
    }
}

impl Drop for Process {
    fn drop(&mut self) {
        self.terminate();
    }
}

/// Forwards a worker's stderr to the log sink, line by line, until EOF.
fn watch_stderr(pid: u32, gupid: &str, stderr: Box<dyn Read + Send>) {
    let result = thread::Builder::new()
        .name(format!("stderr watcher: process {}", gupid))
        .spawn(move || {
            let reader = BufReader::new(stderr);
            for line in reader.lines() {
                match line {
                    Ok(line) => log::info!(target: "procpool::app_output", "[pid {}] {}", pid, line),
                    Err(_) => break,
                }
            }
        });
    if result.is_err() {
        log::warn!("could not start stderr watcher for pid {}", pid);
    }
}
