use std::io::{IoSlice, IoSliceMut};
use std::os::unix::io::{AsRawFd, BorrowedFd, FromRawFd, IntoRawFd, OwnedFd, RawFd};
use std::os::unix::net::UnixStream;

use nix::sys::socket::{recvmsg, sendmsg, ControlMessage, ControlMessageOwned, MsgFlags};

use crate::error::PoolError;

const DELIMITER: u8 = b'\0';

/// Framed message I/O on a stream file descriptor.
///
/// Two kinds of messages travel over the same stream:
///
/// - *Array messages*: a 16-bit big-endian length followed by that many
///   bytes of NUL-delimited text fields.  Fields may not contain NUL.
/// - *Scalar messages*: a 32-bit big-endian length followed by that many
///   bytes of arbitrary binary data.
///
/// Additionally a single file descriptor can be passed out-of-band when
/// the underlying descriptor is a Unix stream socket.
///
/// All three share the stream, so sender and receiver must agree on the
/// exact sequence.  Nothing is buffered across message boundaries.
pub struct MessageChannel {
    fd: OwnedFd,
}

impl MessageChannel {
    /// Wraps an owned file descriptor.
    pub fn new(fd: OwnedFd) -> MessageChannel {
        MessageChannel { fd }
    }

    /// Wraps one end of a Unix stream socket.
    pub fn from_stream(stream: UnixStream) -> MessageChannel {
        MessageChannel {
            fd: unsafe { OwnedFd::from_raw_fd(stream.into_raw_fd()) },
        }
    }

    /// Releases the underlying file descriptor.
    pub fn into_fd(self) -> OwnedFd {
        self.fd
    }

    /// Sends an array message.
    ///
    /// Fails with a protocol violation if a field contains a NUL byte or
    /// the message does not fit in the 16-bit length prefix.
    pub fn write_array<I, S>(&self, fields: I) -> Result<(), PoolError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut payload = Vec::new();
        for field in fields {
            let field = field.as_ref().as_bytes();
            if field.contains(&DELIMITER) {
                return Err(PoolError::protocol("array message field contains NUL"));
            }
            payload.extend_from_slice(field);
            payload.push(DELIMITER);
        }
        if payload.len() > u16::MAX as usize {
            return Err(PoolError::protocol("array message too large"));
        }
        let mut data = Vec::with_capacity(payload.len() + 2);
        data.extend_from_slice(&(payload.len() as u16).to_be_bytes());
        data.extend_from_slice(&payload);
        self.write_raw(&data)
    }

    /// Receives an array message.
    pub fn read_array(&self) -> Result<Vec<String>, PoolError> {
        let mut header = [0u8; 2];
        self.read_exact(&mut header)?;
        let size = u16::from_be_bytes(header) as usize;
        let mut payload = vec![0u8; size];
        self.read_exact(&mut payload)?;

        let mut fields = Vec::new();
        if !payload.is_empty() {
            let mut start = 0;
            while let Some(pos) = payload[start..].iter().position(|&b| b == DELIMITER) {
                let field = &payload[start..start + pos];
                fields.push(
                    String::from_utf8(field.to_vec())
                        .map_err(|_| PoolError::protocol("array message field is not UTF-8"))?,
                );
                start += pos + 1;
            }
            // A payload not ending in a delimiter keeps its trailing token.
            if start < payload.len() {
                fields.push(
                    String::from_utf8(payload[start..].to_vec())
                        .map_err(|_| PoolError::protocol("array message field is not UTF-8"))?,
                );
            }
        }
        Ok(fields)
    }

    /// Sends a scalar message.
    pub fn write_scalar(&self, data: &[u8]) -> Result<(), PoolError> {
        if data.len() > u32::MAX as usize {
            return Err(PoolError::protocol("scalar message too large"));
        }
        self.write_raw(&(data.len() as u32).to_be_bytes())?;
        self.write_raw(data)
    }

    /// Receives a scalar message.
    pub fn read_scalar(&self) -> Result<Vec<u8>, PoolError> {
        let mut header = [0u8; 4];
        self.read_exact(&mut header)?;
        let size = u32::from_be_bytes(header) as usize;
        let mut payload = vec![0u8; size];
        self.read_exact(&mut payload)?;
        Ok(payload)
    }

    /// Passes a file descriptor over the underlying Unix socket.
    pub fn write_file_descriptor(&self, fd: BorrowedFd) -> Result<(), PoolError> {
        let raw = fd.as_raw_fd();
        let fds = [raw];
        let cmsg = [ControlMessage::ScmRights(&fds)];
        // Some kernels reject empty iovecs, so a single NUL byte rides along.
        let buf = [0u8; 1];
        let iov = [IoSlice::new(&buf)];
        sendmsg::<()>(
            self.fd.as_raw_fd(),
            &iov,
            &cmsg,
            MsgFlags::empty(),
            None,
        )
        .map_err(|e| PoolError::io_write(e.into()))?;
        Ok(())
    }

    /// Receives a file descriptor passed over the underlying Unix socket.
    ///
    /// The transfer must carry exactly one `SCM_RIGHTS` control message
    /// with exactly one descriptor; anything else is a protocol violation.
    pub fn read_file_descriptor(&self) -> Result<OwnedFd, PoolError> {
        let mut buf = [0u8; 1];
        let mut iov = [IoSliceMut::new(&mut buf)];
        let mut cmsg_buf = nix::cmsg_space!(RawFd);
        let msg = recvmsg::<()>(
            self.fd.as_raw_fd(),
            &mut iov,
            Some(&mut cmsg_buf),
            MsgFlags::empty(),
        )
        .map_err(|e| PoolError::io_read(e.into()))?;
        if msg.bytes == 0 {
            return Err(PoolError::eof());
        }

        let mut received = None;
        let mut count = 0;
        for cmsg in msg
            .cmsgs()
            .map_err(|e| PoolError::io_read(e.into()))?
        {
            count += 1;
            if let ControlMessageOwned::ScmRights(fds) = cmsg {
                if fds.len() == 1 {
                    received = Some(fds[0]);
                } else {
                    for fd in fds {
                        drop(unsafe { OwnedFd::from_raw_fd(fd) });
                    }
                }
            }
        }
        match (count, received) {
            (1, Some(fd)) => Ok(unsafe { OwnedFd::from_raw_fd(fd) }),
            _ => Err(PoolError::protocol("no valid file descriptor received")),
        }
    }

    fn write_raw(&self, data: &[u8]) -> Result<(), PoolError> {
        let fd = self.fd.as_raw_fd();
        let mut written = 0;
        while written < data.len() {
            let rv = unsafe {
                libc::write(
                    fd,
                    data[written..].as_ptr() as *const libc::c_void,
                    data.len() - written,
                )
            };
            if rv < 0 {
                let err = std::io::Error::last_os_error();
                if err.raw_os_error() == Some(libc::EINTR) {
                    continue;
                }
                return Err(PoolError::io_write(err));
            }
            written += rv as usize;
        }
        Ok(())
    }

    fn read_exact(&self, buf: &mut [u8]) -> Result<(), PoolError> {
        let fd = self.fd.as_raw_fd();
        let mut read = 0;
        while read < buf.len() {
            let rv = unsafe {
                libc::read(
                    fd,
                    buf[read..].as_mut_ptr() as *mut libc::c_void,
                    buf.len() - read,
                )
            };
            if rv < 0 {
                let err = std::io::Error::last_os_error();
                if err.raw_os_error() == Some(libc::EINTR) {
                    continue;
                }
                return Err(PoolError::io_read(err));
            }
            if rv == 0 {
                return Err(PoolError::eof());
            }
            read += rv as usize;
        }
        Ok(())
    }
}

impl AsRawFd for MessageChannel {
    fn as_raw_fd(&self) -> RawFd {
        self.fd.as_raw_fd()
    }
}
