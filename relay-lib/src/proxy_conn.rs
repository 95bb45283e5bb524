//! The proxy connection state machine: client fd <-> backend fd,
//! spliced byte-for-byte with pending-write buffering for short
//! writes.
//!
//! Grounded on the reference library's `Pipe` protocol
//! (`check_connections`, `readable`/`writable`/`back_readable`/
//! `back_writable`), which implements exactly this read-forward-buffer
//! pattern for its own front/back sockets; reworked here as a plain
//! state-tagged struct instead of a per-protocol generic, since this
//! project has only one protocol (raw TCP) to splice.

use std::io::{self, Read, Write};
use std::os::unix::io::{FromRawFd, RawFd};
use std::time::{Duration, Instant};

use crate::backend::Endpoint;

/// Read/write chunk size for a single `on_readable` call.
pub const READ_CHUNK: usize = 8192;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnState {
    Init,
    Connecting,
    Active,
    HalfClosed,
    Closing,
    Gone,
}

#[derive(Debug)]
pub enum ProxyError {
    Io(io::Error),
}

impl std::fmt::Display for ProxyError {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            ProxyError::Io(e) => write!(f, "proxy connection io error: {}", e),
        }
    }
}

impl std::error::Error for ProxyError {}

impl From<io::Error> for ProxyError {
    fn from(e: io::Error) -> ProxyError {
        ProxyError::Io(e)
    }
}

/// Which side a readiness event or a pending-write buffer concerns.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Side {
    Client,
    Backend,
}

/// A spliced client<->backend pair. Owns both file descriptors once
/// connected; `-1` marks a side already closed.
pub struct ProxyConn {
    pub client_fd: RawFd,
    pub backend_fd: RawFd,
    pub backend: Endpoint,
    state: ConnState,
    pending_client_write: Vec<u8>,
    pending_backend_write: Vec<u8>,
    last_activity: Instant,
}

impl ProxyConn {
    pub fn new(client_fd: RawFd, backend: Endpoint) -> ProxyConn {
        ProxyConn {
            client_fd,
            backend_fd: -1,
            backend,
            state: ConnState::Init,
            pending_client_write: Vec::new(),
            pending_backend_write: Vec::new(),
            last_activity: Instant::now(),
        }
    }

    pub fn state(&self) -> ConnState {
        self.state
    }

    pub fn touch(&mut self) {
        self.last_activity = Instant::now();
    }

    pub fn is_idle_for(&self, d: Duration) -> bool {
        self.last_activity.elapsed() > d
    }

    pub fn is_gone(&self) -> bool {
        self.client_fd < 0 && self.backend_fd < 0
    }

    fn pending_mut(&mut self, side: Side) -> &mut Vec<u8> {
        match side {
            Side::Client => &mut self.pending_client_write,
            Side::Backend => &mut self.pending_backend_write,
        }
    }

    pub fn has_pending_write(&self, side: Side) -> bool {
        match side {
            Side::Client => !self.pending_client_write.is_empty(),
            Side::Backend => !self.pending_backend_write.is_empty(),
        }
    }

    fn fd_for(&self, side: Side) -> RawFd {
        match side {
            Side::Client => self.client_fd,
            Side::Backend => self.backend_fd,
        }
    }

    fn other(side: Side) -> Side {
        match side {
            Side::Client => Side::Backend,
            Side::Backend => Side::Client,
        }
    }

    /// Dials the backend: non-blocking `socket()` + `connect()`. A
    /// no-op if already past `Init`. `EINPROGRESS` leaves the state
    /// `Connecting` (the reactor observes completion via the first
    /// writable event); a synchronous success moves straight to
    /// `Active`; any other error closes the (not yet registered)
    /// backend fd and returns it.
    pub fn connect_to_backend(&mut self) -> Result<(), ProxyError> {
        if self.state != ConnState::Init {
            return Ok(());
        }

        let addr = resolve_backend(&self.backend)?;
        match crate::pool::start_nonblocking_connect(addr) {
            Ok((fd, connected)) => {
                self.backend_fd = fd;
                self.state = if connected { ConnState::Active } else { ConnState::Connecting };
                Ok(())
            }
            Err(e) => {
                self.state = ConnState::Gone;
                Err(e.into())
            }
        }
    }

    /// Called once the reactor observes the backend socket became
    /// writable for the first time and `SO_ERROR` reads zero.
    pub fn mark_connected(&mut self) {
        if self.state == ConnState::Connecting {
            self.state = ConnState::Active;
        }
    }

    /// Reads once from `side`'s fd and forwards to the other side.
    /// Returns `Ok(true)` if the peer was forwarded data or reached
    /// `WouldBlock`, `Ok(false)` if this side hit EOF or an error and
    /// was closed.
    pub fn on_readable(&mut self, side: Side) -> Result<bool, ProxyError> {
        self.touch();
        let fd = self.fd_for(side);
        if fd < 0 {
            return Ok(false);
        }

        let mut buf = [0u8; READ_CHUNK];
        let mut file = unsafe { std::fs::File::from_raw_fd(fd) };
        let result = file.read(&mut buf);
        std::mem::forget(file); // fd is owned by ProxyConn, not the temporary File

        match result {
            Ok(0) => {
                self.close_side(side);
                Ok(false)
            }
            Ok(n) => {
                self.forward(Self::other(side), &buf[..n])?;
                Ok(true)
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => Ok(true),
            Err(e) => {
                self.close_side(Self::other(side));
                Err(e.into())
            }
        }
    }

    fn forward(&mut self, to: Side, data: &[u8]) -> Result<(), ProxyError> {
        let fd = self.fd_for(to);
        if fd < 0 {
            return Ok(());
        }

        // A backend socket still mid-connect cannot be written to yet;
        // queue the bytes so they go out once the reactor observes the
        // connect completing and arms write interest.
        let backend_not_ready = to == Side::Backend && self.state == ConnState::Connecting;

        let written = if backend_not_ready || self.has_pending_write(to) {
            0
        } else {
            write_nonblocking(fd, data)?
        };

        if written < data.len() {
            self.pending_mut(to).extend_from_slice(&data[written..]);
        }
        Ok(())
    }

    /// Drains `side`'s pending-write buffer as far as it will go.
    /// Returns `true` if the buffer fully emptied.
    pub fn on_writable(&mut self, side: Side) -> Result<bool, ProxyError> {
        self.touch();
        let fd = self.fd_for(side);
        if fd < 0 {
            return Ok(true);
        }

        let pending = self.pending_mut(side);
        if pending.is_empty() {
            return Ok(true);
        }

        let to_send = std::mem::take(pending);
        let written = match write_nonblocking(fd, &to_send) {
            Ok(n) => n,
            Err(e) => {
                self.close_side(side);
                return Err(e.into());
            }
        };

        if written < to_send.len() {
            self.pending_mut(side).extend_from_slice(&to_send[written..]);
            Ok(false)
        } else {
            Ok(true)
        }
    }

    /// Closes whichever side `fd` matches. When both sides are closed,
    /// the connection is `Gone`.
    pub fn on_close(&mut self, fd: RawFd) {
        if fd == self.client_fd {
            self.close_side(Side::Client);
        } else if fd == self.backend_fd {
            self.close_side(Side::Backend);
        }
    }

    fn close_side(&mut self, side: Side) {
        let fd = self.fd_for(side);
        if fd >= 0 {
            unsafe {
                libc::close(fd);
            }
        }
        match side {
            Side::Client => self.client_fd = -1,
            Side::Backend => self.backend_fd = -1,
        }

        // This implementation closes both sides on the first EOF from
        // either peer; true independent TCP half-close is not modeled.
        let other_fd = self.fd_for(Self::other(side));
        if other_fd >= 0 {
            unsafe {
                libc::close(other_fd);
            }
            match Self::other(side) {
                Side::Client => self.client_fd = -1,
                Side::Backend => self.backend_fd = -1,
            }
        }

        self.state = if self.is_gone() { ConnState::Gone } else { ConnState::HalfClosed };
    }
}

fn resolve_backend(backend: &Endpoint) -> io::Result<std::net::SocketAddr> {
    use std::net::ToSocketAddrs;
    (backend.host.as_str(), backend.port)
        .to_socket_addrs()?
        .next()
        .ok_or_else(|| io::Error::new(io::ErrorKind::AddrNotAvailable, format!("could not resolve {}", backend)))
}

fn write_nonblocking(fd: RawFd, data: &[u8]) -> io::Result<usize> {
    let mut file = unsafe { std::fs::File::from_raw_fd(fd) };
    let result = (|| {
        let mut total = 0;
        while total < data.len() {
            match file.write(&data[total..]) {
                Ok(0) => break,
                Ok(n) => total += n,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) => return Err(e),
            }
        }
        Ok(total)
    })();
    std::mem::forget(file);
    result
}

#[cfg(test)]
impl ProxyConn {
    /// Test-only: attaches a pre-connected fd as the backend without
    /// going through `connect_to_backend`'s real dial.
    fn attach_connecting_backend(&mut self, backend_fd: RawFd) {
        self.backend_fd = backend_fd;
        self.state = ConnState::Connecting;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::io::IntoRawFd;
    use std::os::unix::net::UnixStream;

    fn pair() -> (UnixStream, RawFd) {
        let (test_side, conn_side) = UnixStream::pair().unwrap();
        conn_side.set_nonblocking(true).unwrap();
        test_side.set_nonblocking(true).unwrap();
        (test_side, conn_side.into_raw_fd())
    }

    #[test]
    fn forwards_client_bytes_to_backend() {
        let (mut test_client, client_fd) = pair();
        let (mut test_backend, backend_fd) = pair();

        let mut conn = ProxyConn::new(client_fd, Endpoint::new("backend.test", 9000));
        conn.attach_connecting_backend(backend_fd);
        conn.mark_connected();
        assert_eq!(conn.state(), ConnState::Active);

        test_client.write_all(b"hello relay").unwrap();
        assert!(conn.on_readable(Side::Client).unwrap());

        let mut buf = [0u8; 64];
        let n = test_backend.read(&mut buf).unwrap();
        assert_eq!(&buf[..n], b"hello relay");
    }

    #[test]
    fn forwards_backend_bytes_to_client() {
        let (mut test_client, client_fd) = pair();
        let (mut test_backend, backend_fd) = pair();

        let mut conn = ProxyConn::new(client_fd, Endpoint::new("backend.test", 9000));
        conn.attach_connecting_backend(backend_fd);
        conn.mark_connected();

        test_backend.write_all(b"reply bytes").unwrap();
        assert!(conn.on_readable(Side::Backend).unwrap());

        let mut buf = [0u8; 64];
        let n = test_client.read(&mut buf).unwrap();
        assert_eq!(&buf[..n], b"reply bytes");
    }

    #[test]
    fn client_eof_closes_both_sides() {
        let (test_client, client_fd) = pair();
        let (_test_backend, backend_fd) = pair();

        let mut conn = ProxyConn::new(client_fd, Endpoint::new("backend.test", 9000));
        conn.attach_connecting_backend(backend_fd);
        conn.mark_connected();

        drop(test_client);
        assert!(!conn.on_readable(Side::Client).unwrap());

        assert!(conn.is_gone());
        assert_eq!(conn.state(), ConnState::Gone);
    }

    #[test]
    fn pending_write_is_buffered_and_drained() {
        let (_test_client, client_fd) = pair();
        let (_test_backend, backend_fd) = pair();

        let mut conn = ProxyConn::new(client_fd, Endpoint::new("backend.test", 9000));
        conn.attach_connecting_backend(backend_fd);
        conn.mark_connected();

        assert!(!conn.has_pending_write(Side::Backend));
        assert!(conn.on_writable(Side::Backend).unwrap());
    }

    #[test]
    fn idle_detection_respects_elapsed_activity() {
        let (_test_client, client_fd) = pair();
        let conn = ProxyConn::new(client_fd, Endpoint::new("backend.test", 9000));
        assert!(!conn.is_idle_for(Duration::from_secs(3600)));
    }
}
