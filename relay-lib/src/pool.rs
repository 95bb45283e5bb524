//! Upstream connection pool: bounded, idle-evicting, keyed by
//! `"host:port"`.
//!
//! The non-blocking connect-with-timeout sequence here is grounded on
//! the reference library's own `try_connect`/`BackendConnectionStatus`
//! dance (`Connecting` until `SO_ERROR` reads clean), reimplemented
//! directly against `libc` rather than through `mio`'s `TcpStream`,
//! since this pool's dial is a short-lived bounded wait independent of
//! the reactor's own notifier.

use std::collections::HashMap;
use std::error::Error;
use std::fmt;
use std::io;
use std::net::{SocketAddr, ToSocketAddrs};
use std::os::unix::io::RawFd;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use relay_command::config::ConnectionPoolConfig;

use crate::backend::Endpoint;

#[derive(Debug)]
pub enum PoolError {
    Io(io::Error),
    Full,
    Timeout,
}

impl fmt::Display for PoolError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            PoolError::Io(e) => write!(f, "connection pool io error: {}", e),
            PoolError::Full => write!(f, "connection pool is at capacity for this backend"),
            PoolError::Timeout => write!(f, "connect timed out"),
        }
    }
}

impl Error for PoolError {}

impl From<io::Error> for PoolError {
    fn from(e: io::Error) -> PoolError {
        PoolError::Io(e)
    }
}

struct PooledEntry {
    fd: RawFd,
    in_use: bool,
    last_used: Instant,
}

impl Drop for PooledEntry {
    fn drop(&mut self) {
        unsafe {
            libc::close(self.fd);
        }
    }
}

pub struct ConnectionPool {
    entries: Mutex<HashMap<String, Vec<PooledEntry>>>,
    max_per_backend: usize,
    connect_timeout: Duration,
    idle_ttl: Duration,
}

impl ConnectionPool {
    pub fn new(config: &ConnectionPoolConfig) -> ConnectionPool {
        ConnectionPool {
            entries: Mutex::new(HashMap::new()),
            max_per_backend: config.max_connections_per_backend,
            connect_timeout: Duration::from_millis(config.connect_timeout_ms as u64),
            idle_ttl: Duration::from_secs(config.idle_ttl_seconds as u64),
        }
    }

    /// Returns an idle connection to `backend`, dialing a fresh one if
    /// none is idle.
    pub fn acquire(&self, backend: &Endpoint) -> Result<RawFd, PoolError> {
        {
            let mut entries = self.entries.lock().unwrap();
            if let Some(list) = entries.get_mut(&backend.pool_key()) {
                if let Some(entry) = list.iter_mut().find(|e| !e.in_use) {
                    entry.in_use = true;
                    entry.last_used = Instant::now();
                    return Ok(entry.fd);
                }
            }
        }
        self.add_new_connection(backend)
    }

    /// Dials a fresh backend connection and adds it to the pool. While
    /// still under capacity, evicts the oldest idle entry first as
    /// proactive maintenance; at or over capacity the dial is rejected
    /// outright rather than evicting someone else's idle connection to
    /// make room.
    pub fn add_new_connection(&self, backend: &Endpoint) -> Result<RawFd, PoolError> {
        let addr = resolve(backend)?;
        let fd = connect_with_timeout(addr, self.connect_timeout)?;

        let mut entries = self.entries.lock().unwrap();
        let list = entries.entry(backend.pool_key()).or_insert_with(Vec::new);

        if list.len() >= self.max_per_backend {
            drop(entries);
            unsafe {
                libc::close(fd);
            }
            return Err(PoolError::Full);
        }

        evict_oldest_idle(list, self.max_per_backend);

        list.push(PooledEntry {
            fd,
            in_use: true,
            last_used: Instant::now(),
        });
        Ok(fd)
    }

    /// Marks `fd` idle again. Unknown or negative fds are ignored.
    pub fn release(&self, backend: &Endpoint, fd: RawFd) {
        if fd < 0 {
            return;
        }
        let mut entries = self.entries.lock().unwrap();
        if let Some(list) = entries.get_mut(&backend.pool_key()) {
            if let Some(entry) = list.iter_mut().find(|e| e.fd == fd) {
                entry.in_use = false;
                entry.last_used = Instant::now();
            }
        }
    }

    /// Drops idle entries past `idle_ttl`, closing their sockets.
    pub fn sweep_idle(&self) {
        let idle_ttl = self.idle_ttl;
        let mut entries = self.entries.lock().unwrap();
        entries.retain(|_, list| {
            let now = Instant::now();
            list.retain(|e| !(!e.in_use && now.duration_since(e.last_used) > idle_ttl));
            !list.is_empty()
        });
    }

    pub fn contains(&self, backend: &Endpoint, fd: RawFd) -> bool {
        let entries = self.entries.lock().unwrap();
        entries
            .get(&backend.pool_key())
            .map_or(false, |list| list.iter().any(|e| e.fd == fd))
    }
}

fn evict_oldest_idle(list: &mut Vec<PooledEntry>, target_len: usize) {
    while list.len() > target_len {
        let oldest = list
            .iter()
            .enumerate()
            .filter(|(_, e)| !e.in_use)
            .min_by_key(|(_, e)| e.last_used)
            .map(|(i, _)| i);
        match oldest {
            Some(i) => {
                list.remove(i);
            }
            None => break,
        }
    }
}

fn resolve(backend: &Endpoint) -> Result<SocketAddr, PoolError> {
    (backend.host.as_str(), backend.port)
        .to_socket_addrs()?
        .next()
        .ok_or_else(|| {
            PoolError::Io(io::Error::new(
                io::ErrorKind::AddrNotAvailable,
                format!("could not resolve {}", backend),
            ))
        })
}

fn set_nonblocking(fd: RawFd) -> io::Result<()> {
    let flags = unsafe { libc::fcntl(fd, libc::F_GETFL, 0) };
    if flags < 0 {
        return Err(io::Error::last_os_error());
    }
    let ret = unsafe { libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK) };
    if ret < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

fn socket_addr_to_raw(addr: SocketAddr) -> (libc::sockaddr_storage, libc::socklen_t) {
    unsafe {
        let mut storage: libc::sockaddr_storage = std::mem::zeroed();
        let len = match addr {
            SocketAddr::V4(v4) => {
                let sin = &mut *(&mut storage as *mut libc::sockaddr_storage as *mut libc::sockaddr_in);
                sin.sin_family = libc::AF_INET as libc::sa_family_t;
                sin.sin_port = v4.port().to_be();
                sin.sin_addr = libc::in_addr {
                    s_addr: u32::from_ne_bytes(v4.ip().octets()),
                };
                std::mem::size_of::<libc::sockaddr_in>() as libc::socklen_t
            }
            SocketAddr::V6(v6) => {
                let sin6 = &mut *(&mut storage as *mut libc::sockaddr_storage as *mut libc::sockaddr_in6);
                sin6.sin6_family = libc::AF_INET6 as libc::sa_family_t;
                sin6.sin6_port = v6.port().to_be();
                sin6.sin6_addr = libc::in6_addr {
                    s6_addr: v6.ip().octets(),
                };
                sin6.sin6_scope_id = v6.scope_id();
                std::mem::size_of::<libc::sockaddr_in6>() as libc::socklen_t
            }
        };
        (storage, len)
    }
}

/// Opens a non-blocking socket and issues `connect()`, returning as
/// soon as the kernel has either accepted it immediately or started
/// it asynchronously (`EINPROGRESS`). Does not wait for completion;
/// callers either poll `SO_ERROR` themselves after a bounded wait (see
/// `connect_with_timeout`) or, in the reactor's case, register the fd
/// with the notifier and observe the first writable event.
///
/// The returned `bool` is `true` when `connect()` completed
/// synchronously (rare but possible, e.g. connecting to a socket in
/// the same process), `false` when it is still in progress.
pub fn start_nonblocking_connect(addr: SocketAddr) -> io::Result<(RawFd, bool)> {
    let domain = match addr {
        SocketAddr::V4(_) => libc::AF_INET,
        SocketAddr::V6(_) => libc::AF_INET6,
    };

    let fd = unsafe { libc::socket(domain, libc::SOCK_STREAM, 0) };
    if fd < 0 {
        return Err(io::Error::last_os_error());
    }

    if let Err(e) = set_nonblocking(fd) {
        unsafe {
            libc::close(fd);
        }
        return Err(e);
    }

    let (storage, len) = socket_addr_to_raw(addr);
    let ret = unsafe { libc::connect(fd, &storage as *const _ as *const libc::sockaddr, len) };

    if ret == 0 {
        return Ok((fd, true));
    }

    let err = io::Error::last_os_error();
    if err.raw_os_error() != Some(libc::EINPROGRESS) {
        unsafe {
            libc::close(fd);
        }
        return Err(err);
    }

    Ok((fd, false))
}

/// Non-blocking connect with a bounded wait for completion, independent
/// of the reactor's own notifier: `socket` -> `O_NONBLOCK` -> `connect`
/// -> on `EINPROGRESS`, a one-shot `poll(2)` for writability -> read
/// `SO_ERROR` to learn the outcome. Used by the connection pool, whose
/// dials are short-lived and not worth registering with the reactor.
pub fn connect_with_timeout(addr: SocketAddr, timeout: Duration) -> Result<RawFd, PoolError> {
    let (fd, connected) = start_nonblocking_connect(addr)?;
    if connected {
        return Ok(fd);
    }

    let mut pfd = libc::pollfd {
        fd,
        events: libc::POLLOUT,
        revents: 0,
    };
    let timeout_ms = timeout.as_millis().min(i32::max_value() as u128) as libc::c_int;
    let ret = unsafe { libc::poll(&mut pfd as *mut libc::pollfd, 1, timeout_ms) };
    if ret == 0 {
        unsafe {
            libc::close(fd);
        }
        return Err(PoolError::Timeout);
    }
    if ret < 0 {
        let err = io::Error::last_os_error();
        unsafe {
            libc::close(fd);
        }
        return Err(PoolError::Io(err));
    }

    let mut so_err: libc::c_int = 0;
    let mut so_err_len = std::mem::size_of::<libc::c_int>() as libc::socklen_t;
    let ret = unsafe {
        libc::getsockopt(
            fd,
            libc::SOL_SOCKET,
            libc::SO_ERROR,
            &mut so_err as *mut libc::c_int as *mut libc::c_void,
            &mut so_err_len,
        )
    };
    if ret < 0 {
        let err = io::Error::last_os_error();
        unsafe {
            libc::close(fd);
        }
        return Err(PoolError::Io(err));
    }
    if so_err != 0 {
        unsafe {
            libc::close(fd);
        }
        return Err(PoolError::Io(io::Error::from_raw_os_error(so_err)));
    }

    Ok(fd)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::TcpListener;

    fn config(max: usize) -> ConnectionPoolConfig {
        ConnectionPoolConfig {
            max_connections_per_backend: max,
            connect_timeout_ms: 500,
            idle_ttl_seconds: 300,
        }
    }

    fn backend_from(listener: &TcpListener) -> Endpoint {
        let addr = listener.local_addr().unwrap();
        Endpoint::new(addr.ip().to_string(), addr.port())
    }

    #[test]
    fn acquire_dials_then_release_allows_reuse() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let backend = backend_from(&listener);
        let pool = ConnectionPool::new(&config(2));

        let fd1 = pool.acquire(&backend).expect("first dial");
        let _peer = listener.accept().expect("accept");
        assert!(pool.contains(&backend, fd1));

        pool.release(&backend, fd1);
        let fd2 = pool.acquire(&backend).expect("reused dial");
        assert_eq!(fd1, fd2);
    }

    #[test]
    fn release_of_unknown_fd_is_a_no_op() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let backend = backend_from(&listener);
        let pool = ConnectionPool::new(&config(2));
        pool.release(&backend, -1);
        pool.release(&backend, 99999);
    }

    #[test]
    fn dial_at_capacity_is_rejected_even_with_an_idle_entry() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let backend = backend_from(&listener);
        let pool = ConnectionPool::new(&config(1));

        let fd1 = pool.add_new_connection(&backend).expect("first dial");
        let _peer1 = listener.accept().unwrap();
        pool.release(&backend, fd1);

        match pool.add_new_connection(&backend) {
            Err(PoolError::Full) => {}
            other => panic!("expected PoolError::Full, got {:?}", other),
        }

        assert!(pool.contains(&backend, fd1));
    }

    #[test]
    fn dial_under_capacity_evicts_oldest_idle_first() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let backend = backend_from(&listener);
        let pool = ConnectionPool::new(&config(2));

        let fd1 = pool.add_new_connection(&backend).expect("first dial");
        let _peer1 = listener.accept().unwrap();
        pool.release(&backend, fd1);

        let fd2 = pool.add_new_connection(&backend).expect("second dial, still under cap");
        let _peer2 = listener.accept().unwrap();

        assert!(pool.contains(&backend, fd1));
        assert!(pool.contains(&backend, fd2));
    }

    #[test]
    fn dial_to_refused_port_fails() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let backend = backend_from(&listener);
        drop(listener);

        let pool = ConnectionPool::new(&config(1));
        assert!(pool.acquire(&backend).is_err());
    }
}
