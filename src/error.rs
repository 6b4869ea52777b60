use std::fmt;
use std::io::Error as IoError;
use std::sync::Arc;

/// Encapsulates errors of the procpool crate.
///
/// A single error value can be fanned out to every waiter parked on a
/// wait list, so the type is cheap to clone; I/O causes are kept behind
/// an `Arc`.
#[derive(Debug, Clone)]
pub struct PoolError {
    kind: PoolErrorKind,
}

#[derive(Debug, Clone)]
enum PoolErrorKind {
    /// A read on a channel or worker socket failed.
    IoRead(Arc<IoError>),
    /// A write on a channel or worker socket failed.
    IoWrite(Arc<IoError>),
    /// The peer closed the stream in the middle of a message.
    Eof,
    /// Well-formed I/O carrying something semantically unexpected.
    Protocol(String),
    /// The spawner exited, timed out or returned an error response.
    SpawnFailed(String),
    /// The target process cannot accept another session right now.
    AtCapacity,
    /// The super group was destroyed while the request was in flight.
    SuperGroupGone,
    /// The group was destroyed while the request was in flight.
    GroupGone,
    /// A bounded wait ran out.
    Timeout,
    /// Fatal bookkeeping inconsistency.
    InvariantViolation(String),
}

impl PoolError {
    pub(crate) fn io_read(err: IoError) -> PoolError {
        PoolError {
            kind: PoolErrorKind::IoRead(Arc::new(err)),
        }
    }

    pub(crate) fn io_write(err: IoError) -> PoolError {
        PoolError {
            kind: PoolErrorKind::IoWrite(Arc::new(err)),
        }
    }

    pub(crate) fn eof() -> PoolError {
        PoolError {
            kind: PoolErrorKind::Eof,
        }
    }

    pub(crate) fn protocol<S: Into<String>>(msg: S) -> PoolError {
        PoolError {
            kind: PoolErrorKind::Protocol(msg.into()),
        }
    }

    pub(crate) fn spawn_failed<S: Into<String>>(msg: S) -> PoolError {
        PoolError {
            kind: PoolErrorKind::SpawnFailed(msg.into()),
        }
    }

    pub(crate) fn at_capacity() -> PoolError {
        PoolError {
            kind: PoolErrorKind::AtCapacity,
        }
    }

    pub(crate) fn super_group_gone() -> PoolError {
        PoolError {
            kind: PoolErrorKind::SuperGroupGone,
        }
    }

    pub(crate) fn group_gone() -> PoolError {
        PoolError {
            kind: PoolErrorKind::GroupGone,
        }
    }

    pub(crate) fn timeout() -> PoolError {
        PoolError {
            kind: PoolErrorKind::Timeout,
        }
    }

    pub(crate) fn invariant<S: Into<String>>(msg: S) -> PoolError {
        PoolError {
            kind: PoolErrorKind::InvariantViolation(msg.into()),
        }
    }

    /// True if the error came from an unexpected end of stream.
    pub fn is_eof(&self) -> bool {
        matches!(self.kind, PoolErrorKind::Eof)
    }

    /// True for well-formed I/O that violated the message protocol.
    pub fn is_protocol_violation(&self) -> bool {
        matches!(self.kind, PoolErrorKind::Protocol(_))
    }

    /// True if a worker could not be spawned.
    pub fn is_spawn_failed(&self) -> bool {
        matches!(self.kind, PoolErrorKind::SpawnFailed(_))
    }

    /// True if the target process had no session slot free.
    pub fn is_at_capacity(&self) -> bool {
        matches!(self.kind, PoolErrorKind::AtCapacity)
    }

    /// True if the target group or super group no longer exists.
    pub fn is_gone(&self) -> bool {
        matches!(
            self.kind,
            PoolErrorKind::SuperGroupGone | PoolErrorKind::GroupGone
        )
    }

    /// True if a bounded wait expired.
    pub fn is_timeout(&self) -> bool {
        matches!(self.kind, PoolErrorKind::Timeout)
    }

    /// The spawn diagnostic, if this is a spawn failure.
    pub fn spawn_diagnostic(&self) -> Option<&str> {
        if let PoolErrorKind::SpawnFailed(ref msg) = self.kind {
            Some(msg.as_str())
        } else {
            None
        }
    }
}

impl std::error::Error for PoolError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self.kind {
            PoolErrorKind::IoRead(ref err) => Some(&**err),
            PoolErrorKind::IoWrite(ref err) => Some(&**err),
            _ => None,
        }
    }
}

impl fmt::Display for PoolError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self.kind {
            PoolErrorKind::IoRead(ref err) => write!(f, "read failed: {}", err),
            PoolErrorKind::IoWrite(ref err) => write!(f, "write failed: {}", err),
            PoolErrorKind::Eof => write!(f, "unexpected end of stream"),
            PoolErrorKind::Protocol(ref msg) => write!(f, "protocol violation: {}", msg),
            PoolErrorKind::SpawnFailed(ref msg) => write!(f, "could not spawn process: {}", msg),
            PoolErrorKind::AtCapacity => write!(f, "process is at full capacity"),
            PoolErrorKind::SuperGroupGone => write!(f, "super group no longer exists"),
            PoolErrorKind::GroupGone => write!(f, "group no longer exists"),
            PoolErrorKind::Timeout => write!(f, "operation timed out"),
            PoolErrorKind::InvariantViolation(ref msg) => {
                write!(f, "invariant violation: {}", msg)
            }
        }
    }
}
