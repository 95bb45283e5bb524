//! The accept loop: owns the listening socket, dials the chosen
//! backend for each new client, and hands the resulting connection to
//! the reactor.
//!
//! Grounded on the reference library's `Listener::accept`
//! (`https_rustls/configuration.rs`): non-blocking `accept()`,
//! `WouldBlock` handled as the normal idle case, other errors counted
//! rather than fatal. This project has no event loop token to plug an
//! accept readiness notification into, since the acceptor runs on its
//! own thread rather than inside the reactor's poll loop, so it falls
//! back to a short sleep between non-blocking accept attempts.

use std::io;
use std::net::SocketAddr;
use std::os::unix::io::RawFd;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use relay_command::config::ListenConfig;

use crate::proxy_conn::ProxyConn;
use crate::reactor::ReactorHandle;
use crate::router::Router;

/// How long the accept loop sleeps after a `WouldBlock` before trying
/// again. The listener is non-blocking so this is a busy-wait ceiling,
/// not a readiness mechanism.
const ACCEPT_IDLE_SLEEP: Duration = Duration::from_millis(10);

pub struct Acceptor {
    listener_fd: RawFd,
    router: Arc<Router>,
    reactor: ReactorHandle,
    running: Arc<AtomicBool>,
    accept_errors: Arc<AtomicU64>,
}

impl Acceptor {
    /// Binds and listens on `listen`'s address with `SO_REUSEADDR` and
    /// the configured backlog. Fails fast: a bind/listen error here is
    /// fatal to process startup.
    pub fn bind(listen: &ListenConfig, router: Arc<Router>, reactor: ReactorHandle) -> io::Result<Acceptor> {
        let listener_fd = bind_listener(listen)?;
        Ok(Acceptor {
            listener_fd,
            router,
            reactor,
            running: Arc::new(AtomicBool::new(false)),
            accept_errors: Arc::new(AtomicU64::new(0)),
        })
    }

    /// Spawns the accept loop on its own thread. Idempotent: calling
    /// `start()` while already running is a no-op.
    pub fn start(&self) -> io::Result<JoinHandle<()>> {
        if self.running.swap(true, Ordering::SeqCst) {
            return Err(io::Error::new(io::ErrorKind::Other, "acceptor already running"));
        }

        let listener_fd = self.listener_fd;
        let router = self.router.clone();
        let reactor = self.reactor.clone();
        let running = self.running.clone();
        let accept_errors = self.accept_errors.clone();

        thread::Builder::new()
            .name("relay-acceptor".to_string())
            .spawn(move || accept_loop(listener_fd, &router, &reactor, &running, &accept_errors))
    }

    /// Idempotent: flips the running flag so the loop exits after its
    /// current iteration. Does not itself join the thread; callers
    /// keep the `JoinHandle` returned by `start()`.
    pub fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
    }

    pub fn accept_error_count(&self) -> u64 {
        self.accept_errors.load(Ordering::Relaxed)
    }
}

impl Drop for Acceptor {
    fn drop(&mut self) {
        unsafe {
            libc::close(self.listener_fd);
        }
    }
}

fn accept_loop(
    listener_fd: RawFd,
    router: &Router,
    reactor: &ReactorHandle,
    running: &AtomicBool,
    accept_errors: &AtomicU64,
) {
    while running.load(Ordering::SeqCst) {
        match accept_nonblocking(listener_fd) {
            Ok(client_fd) => handle_new_client(client_fd, router, reactor),
            Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => {
                thread::sleep(ACCEPT_IDLE_SLEEP);
            }
            Err(ref e) if e.kind() == io::ErrorKind::Interrupted => {
                continue;
            }
            Err(e) => {
                error!("ACCEPT\taccept() error: {}", e);
                accept_errors.fetch_add(1, Ordering::Relaxed);
            }
        }
    }
}

/// Picks a backend, builds the `ProxyConn`, starts its non-blocking
/// dial, and hands it to the reactor. On any failure before the
/// reactor takes ownership, the client fd is closed here instead of
/// leaking it into the mapping.
fn handle_new_client(client_fd: RawFd, router: &Router, reactor: &ReactorHandle) {
    let backend = router.next_backend().clone();
    let mut conn = ProxyConn::new(client_fd, backend);

    if let Err(e) = conn.connect_to_backend() {
        warn!("ACCEPT\tbackend dial failed: {}", e);
        unsafe {
            libc::close(client_fd);
        }
        return;
    }

    if reactor.submit(conn).is_err() {
        // Reactor thread is gone (shutting down); the dropped ProxyConn
        // never closes its own fds on drop, so close them here.
        unsafe {
            libc::close(client_fd);
        }
    }
}

fn accept_nonblocking(listener_fd: RawFd) -> io::Result<RawFd> {
    let mut storage: libc::sockaddr_storage = unsafe { std::mem::zeroed() };
    let mut len = std::mem::size_of::<libc::sockaddr_storage>() as libc::socklen_t;

    let fd = unsafe {
        libc::accept(
            listener_fd,
            &mut storage as *mut _ as *mut libc::sockaddr,
            &mut len,
        )
    };
    if fd < 0 {
        return Err(io::Error::last_os_error());
    }

    if let Err(e) = set_nonblocking(fd) {
        unsafe {
            libc::close(fd);
        }
        return Err(e);
    }

    Ok(fd)
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

/// Binds a non-blocking `SOCK_STREAM` listener with `SO_REUSEADDR` set
/// and the configured backlog, built directly against `libc` so the
/// backlog (fixed at 128 by `std::net::TcpListener`) is configurable.
fn bind_listener(listen: &ListenConfig) -> io::Result<RawFd> {
    use std::net::ToSocketAddrs;
    let addr = (listen.host.as_str(), listen.port)
        .to_socket_addrs()?
        .next()
        .ok_or_else(|| io::Error::new(io::ErrorKind::AddrNotAvailable, "could not resolve listen address"))?;

    let domain = match addr {
        SocketAddr::V4(_) => libc::AF_INET,
        SocketAddr::V6(_) => libc::AF_INET6,
    };

    let fd = unsafe { libc::socket(domain, libc::SOCK_STREAM, 0) };
    if fd < 0 {
        return Err(io::Error::last_os_error());
    }

    let result = (|| -> io::Result<()> {
        set_reuseaddr(fd)?;
        set_nonblocking(fd)?;
        bind_raw(fd, addr)?;
        listen_raw(fd, listen.backlog)?;
        Ok(())
    })();

    if let Err(e) = result {
        unsafe {
            libc::close(fd);
        }
        return Err(e);
    }

    Ok(fd)
}

fn set_reuseaddr(fd: RawFd) -> io::Result<()> {
    let one: libc::c_int = 1;
    let ret = unsafe {
        libc::setsockopt(
            fd,
            libc::SOL_SOCKET,
            libc::SO_REUSEADDR,
            &one as *const libc::c_int as *const libc::c_void,
            std::mem::size_of::<libc::c_int>() as libc::socklen_t,
        )
    };
    if ret < 0 {
        Err(io::Error::last_os_error())
    } else {
        Ok(())
    }
}

fn bind_raw(fd: RawFd, addr: SocketAddr) -> io::Result<()> {
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
        let ret = libc::bind(fd, &storage as *const _ as *const libc::sockaddr, len);
        if ret < 0 {
            Err(io::Error::last_os_error())
        } else {
            Ok(())
        }
    }
}

fn listen_raw(fd: RawFd, backlog: i32) -> io::Result<()> {
    let ret = unsafe { libc::listen(fd, backlog) };
    if ret < 0 {
        Err(io::Error::last_os_error())
    } else {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{BackendPool, Endpoint};
    use crate::reactor::Reactor;
    use crate::router::RoutingAlgorithm;
    use std::io::{Read, Write};
    use std::net::{TcpListener, TcpStream};

    fn free_port() -> u16 {
        TcpListener::bind("127.0.0.1:0").unwrap().local_addr().unwrap().port()
    }

    fn spawn_echo_backend() -> SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        thread::spawn(move || {
            if let Ok((mut stream, _)) = listener.accept() {
                let mut buf = [0u8; 1024];
                loop {
                    match stream.read(&mut buf) {
                        Ok(0) | Err(_) => break,
                        Ok(n) => {
                            if stream.write_all(&buf[..n]).is_err() {
                                break;
                            }
                        }
                    }
                }
            }
        });
        addr
    }

    #[test]
    fn accepts_and_proxies_a_client_round_trip() {
        let backend_addr = spawn_echo_backend();
        let pool = BackendPool::new(vec![Endpoint::new(
            backend_addr.ip().to_string(),
            backend_addr.port(),
        )]);
        let router = Arc::new(Router::new(pool, RoutingAlgorithm::RoundRobin).unwrap());

        let (join, reactor_handle) = Reactor::spawn(Duration::from_secs(30)).unwrap();

        let listen = ListenConfig {
            host: "127.0.0.1".to_string(),
            port: free_port(),
            backlog: 16,
        };
        let listen_addr: SocketAddr = format!("{}:{}", listen.host, listen.port).parse().unwrap();

        let acceptor = Acceptor::bind(&listen, router, reactor_handle.clone()).unwrap();
        let accept_join = acceptor.start().unwrap();

        let mut client = TcpStream::connect(listen_addr).expect("connect to listener");
        client.set_read_timeout(Some(Duration::from_secs(2))).unwrap();
        client.write_all(b"hello").unwrap();

        let mut buf = [0u8; 16];
        let n = client.read(&mut buf).expect("echoed reply");
        assert_eq!(&buf[..n], b"hello");

        acceptor.stop();
        accept_join.join().unwrap();
        reactor_handle.stop();
        join.join().unwrap();
    }

    #[test]
    fn start_twice_without_stop_is_an_error() {
        let pool = BackendPool::new(vec![Endpoint::new("127.0.0.1", 1)]);
        let router = Arc::new(Router::new(pool, RoutingAlgorithm::RoundRobin).unwrap());
        let (join, reactor_handle) = Reactor::spawn(Duration::from_secs(30)).unwrap();

        let listen = ListenConfig {
            host: "127.0.0.1".to_string(),
            port: free_port(),
            backlog: 16,
        };
        let acceptor = Acceptor::bind(&listen, router, reactor_handle.clone()).unwrap();
        let first = acceptor.start().unwrap();
        assert!(acceptor.start().is_err());

        acceptor.stop();
        first.join().unwrap();
        reactor_handle.stop();
        join.join().unwrap();
    }
}
