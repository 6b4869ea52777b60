use std::fmt;
use std::os::unix::net::UnixStream;
use std::sync::{Arc, Weak};

use crate::error::PoolError;
use crate::group::GroupLink;
use crate::pool::{self, PoolShared};
use crate::process::{Connection, Process};

/// A single-use lease of one worker for one request.
///
/// Closing the session (explicitly or on drop) notifies the worker's
/// group so the scheduler can re-balance, drain waiters, or retire the
/// worker.  `close` is idempotent.
pub struct Session {
    pool: Weak<PoolShared>,
    link: Arc<GroupLink>,
    process: Arc<Process>,
    socket_index: usize,
    connection: Option<Connection>,
    closed: bool,
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("socket_index", &self.socket_index)
            .field("closed", &self.closed)
            .finish()
    }
}

impl Session {
    pub(crate) fn new(
        pool: Weak<PoolShared>,
        link: Arc<GroupLink>,
        process: Arc<Process>,
        socket_index: usize,
        connection: Option<Connection>,
    ) -> Session {
        Session {
            pool,
            link,
            process,
            socket_index,
            connection,
            closed: false,
        }
    }

    pub fn pid(&self) -> u32 {
        self.process.pid()
    }

    pub fn gupid(&self) -> &str {
        self.process.gupid()
    }

    /// The token the worker requires on every request.
    pub fn connect_password(&self) -> &str {
        self.process.connect_password()
    }

    pub fn process(&self) -> &Arc<Process> {
        &self.process
    }

    /// Opens the connection to the worker if no pooled one was available.
    ///
    /// Called by the request handler outside any pool-internal lock; the
    /// session was created without blocking I/O.
    pub fn initiate(&mut self) -> Result<(), PoolError> {
        if self.connection.is_none() {
            let socket = &self.process.sockets()[self.socket_index];
            self.connection = Some(socket.connect()?);
        }
        Ok(())
    }

    /// The connection to the worker, once `initiate` has run.
    pub fn stream(&self) -> Option<&UnixStream> {
        self.connection.as_ref().map(|c| &c.stream)
    }

    /// Marks the connection as failed so it is closed instead of recycled.
    pub fn discard_connection(&mut self) {
        if let Some(ref mut conn) = self.connection {
            conn.fail = true;
        }
    }

    /// Asks the pool to give this worker an out-of-band maintenance
    /// window once it goes idle.
    pub fn request_oobw(&self) {
        pool::on_request_oobw(&self.pool, &self.link, &self.process);
    }

    /// Ends the lease and lets the group re-establish its invariants.
    pub fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        if let Some(conn) = self.connection.take() {
            self.process.sockets()[self.socket_index].checkin(conn);
        }
        pool::on_session_close(&self.pool, &self.link, &self.process, self.socket_index);
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.close();
    }
}
