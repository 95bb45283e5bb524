//! The single-threaded I/O loop: owns the notifier and the fd ->
//! connection mapping, dispatches readiness events, and folds the
//! idle sweeper into its own bounded wait.
//!
//! Grounded on the reference library's `Server`/`Proxy` event loop
//! (`https_rustls/configuration.rs`: `poll.register`, `connect_to_backend`
//! reading `SO_ERROR` after a writable wake-up, `notify()` handling
//! inbound requests) — reworked around this project's own `Notifier`
//! trait instead of `mio::Poll`, and around a channel handing off newly
//! accepted connections instead of an internal request queue, since
//! the acceptor here runs on its own OS thread.

use std::cell::RefCell;
use std::collections::HashMap;
use std::io;
use std::os::unix::io::RawFd;
use std::rc::Rc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, Sender, TryRecvError};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crate::notifier::{EventBuffer, Interest, Notifier, PlatformNotifier};
use crate::proxy_conn::{ProxyConn, Side};

/// A cloneable, `Send` front for submitting newly accepted connections
/// to a running reactor and requesting its shutdown.
#[derive(Clone)]
pub struct ReactorHandle {
    sender: Sender<ProxyConn>,
    running: Arc<AtomicBool>,
    notifier: Arc<PlatformNotifier>,
}

impl ReactorHandle {
    /// Hands a connection to the reactor for registration. The
    /// acceptor has already called `connect_to_backend()` on it; the
    /// reactor only wraps it in the shared mapping and arms interest.
    pub fn submit(&self, conn: ProxyConn) -> Result<(), ProxyConn> {
        self.sender.send(conn).map_err(|e| e.0)
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Stops the reactor loop: flips the running flag and closes the
    /// notifier so a blocked `poll` returns promptly.
    pub fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
        self.notifier.close();
    }
}

type SharedConn = Rc<RefCell<ProxyConn>>;

pub struct Reactor {
    notifier: Arc<PlatformNotifier>,
    connections: HashMap<RawFd, SharedConn>,
    incoming: Receiver<ProxyConn>,
    running: Arc<AtomicBool>,
    idle_timeout: Duration,
}

impl Reactor {
    /// Creates the notifier synchronously (so bind-time failures
    /// surface before any thread is spawned) and starts the reactor's
    /// own thread.
    pub fn spawn(idle_timeout: Duration) -> io::Result<(JoinHandle<()>, ReactorHandle)> {
        let notifier = Arc::new(PlatformNotifier::new()?);
        let (sender, incoming) = mpsc::channel();
        let running = Arc::new(AtomicBool::new(true));

        let handle = ReactorHandle {
            sender,
            running: running.clone(),
            notifier: notifier.clone(),
        };

        // The fd->connection map is built inside the spawned thread,
        // not here: `Rc<RefCell<ProxyConn>>` is neither `Send` nor
        // `Sync`, so it must never cross the thread boundary. Only the
        // `Send` pieces (notifier, channel, running flag) are moved in.
        let join = thread::Builder::new()
            .name("relay-reactor".to_string())
            .spawn(move || {
                let mut reactor = Reactor {
                    notifier,
                    connections: HashMap::new(),
                    incoming,
                    running,
                    idle_timeout,
                };
                reactor.run();
            })?;

        Ok((join, handle))
    }

    fn run(&mut self) {
        let mut events = EventBuffer::with_capacity(1024);
        let poll_timeout = Some(Duration::from_secs(1));

        while self.running.load(Ordering::SeqCst) {
            self.drain_incoming();

            match self.notifier.poll(&mut events, poll_timeout) {
                Ok(_) => {
                    let batch: Vec<_> = events.iter().cloned().collect();
                    for event in batch {
                        self.handle_event(event);
                    }
                }
                Err(_) => break, // notifier closed by stop(), or fatal
            }

            self.sweep_idle();
        }

        self.shutdown_all();
    }

    fn drain_incoming(&mut self) {
        loop {
            match self.incoming.try_recv() {
                Ok(conn) => self.register_connection(conn),
                Err(TryRecvError::Empty) => break,
                Err(TryRecvError::Disconnected) => break,
            }
        }
    }

    /// Inserts both fds into the mapping and arms the notifier:
    /// client read-only, backend read+write (to observe connect
    /// completion). The acceptor has already called
    /// `connect_to_backend()`; if that dial failed outright the
    /// connection arrives already `Gone` and is just torn down here.
    fn register_connection(&mut self, mut conn: ProxyConn) {
        if conn.state() == crate::proxy_conn::ConnState::Gone {
            conn.on_close(conn.client_fd);
            return;
        }

        let client_fd = conn.client_fd;
        let backend_fd = conn.backend_fd;
        let shared = Rc::new(RefCell::new(conn));

        if self.notifier.register(client_fd, Interest::READABLE).is_err() {
            return;
        }
        if self
            .notifier
            .register(backend_fd, Interest::READ_WRITE)
            .is_err()
        {
            let _ = self.notifier.deregister(client_fd);
            return;
        }

        self.connections.insert(client_fd, shared.clone());
        self.connections.insert(backend_fd, shared);
    }

    fn unregister_connection(&mut self, fd: RawFd) {
        let _ = self.notifier.deregister(fd);
        self.connections.remove(&fd);
    }

    fn handle_event(&mut self, event: crate::notifier::Event) {
        let conn = match self.connections.get(&event.fd) {
            Some(c) => c.clone(),
            None => return,
        };

        if event.is_error_or_closed() {
            conn.borrow_mut().on_close(event.fd);
            self.retire_gone_connections();
            return;
        }

        if event.writable {
            let is_backend = { conn.borrow().backend_fd == event.fd };
            let just_connected = {
                let c = conn.borrow();
                is_backend && c.state() == crate::proxy_conn::ConnState::Connecting
            };

            if just_connected {
                match check_connect_result(event.fd) {
                    Ok(()) => {
                        let needs_write = {
                            let mut c = conn.borrow_mut();
                            c.mark_connected();
                            c.has_pending_write(Side::Backend)
                        };
                        let interest = if needs_write {
                            Interest::READ_WRITE
                        } else {
                            Interest::READABLE
                        };
                        let _ = self.notifier.reregister(event.fd, interest);
                    }
                    Err(_) => {
                        conn.borrow_mut().on_close(event.fd);
                        self.retire_gone_connections();
                        return;
                    }
                }
            } else {
                let side = if is_backend { Side::Backend } else { Side::Client };
                let drained = conn.borrow_mut().on_writable(side).unwrap_or(true);
                if drained {
                    let _ = self.notifier.reregister(event.fd, Interest::READABLE);
                }
            }
        }

        if event.readable {
            let is_backend = { conn.borrow().backend_fd == event.fd };
            let side = if is_backend { Side::Backend } else { Side::Client };
            let still_open = conn.borrow_mut().on_readable(side).unwrap_or(false);

            if !still_open {
                self.retire_gone_connections();
                return;
            }

            let other_side = match side {
                Side::Client => Side::Backend,
                Side::Backend => Side::Client,
            };
            let other_fd = {
                let c = conn.borrow();
                match other_side {
                    Side::Client => c.client_fd,
                    Side::Backend => c.backend_fd,
                }
            };
            if other_fd >= 0 && conn.borrow().has_pending_write(other_side) {
                let _ = self.notifier.reregister(other_fd, Interest::READ_WRITE);
            }
        }
    }

    /// Removes every mapping entry whose connection has reached
    /// `Gone` (both fds closed). `on_close` always closes both sides
    /// together (see `proxy_conn`'s half-close note), so a single scan
    /// after any close call catches both of a pair's entries.
    fn retire_gone_connections(&mut self) {
        let keys: Vec<RawFd> = self
            .connections
            .iter()
            .filter(|(_, c)| c.borrow().is_gone())
            .map(|(fd, _)| *fd)
            .collect();
        for fd in keys {
            self.unregister_connection(fd);
        }
    }

    fn sweep_idle(&mut self) {
        let idle_timeout = self.idle_timeout;
        let stale: Vec<RawFd> = self
            .connections
            .iter()
            .filter(|(_, c)| c.borrow().is_idle_for(idle_timeout))
            .map(|(fd, _)| *fd)
            .collect();

        for fd in &stale {
            if let Some(conn) = self.connections.get(fd) {
                conn.borrow_mut().on_close(*fd);
            }
        }

        self.retire_gone_connections();
    }

    fn shutdown_all(&mut self) {
        let fds: Vec<RawFd> = self.connections.keys().cloned().collect();
        for fd in fds {
            if let Some(conn) = self.connections.get(&fd) {
                conn.borrow_mut().on_close(fd);
            }
        }
        self.connections.clear();
    }
}

fn check_connect_result(fd: RawFd) -> io::Result<()> {
    let mut so_err: libc::c_int = 0;
    let mut len = std::mem::size_of::<libc::c_int>() as libc::socklen_t;
    let ret = unsafe {
        libc::getsockopt(
            fd,
            libc::SOL_SOCKET,
            libc::SO_ERROR,
            &mut so_err as *mut libc::c_int as *mut libc::c_void,
            &mut len,
        )
    };
    if ret < 0 {
        return Err(io::Error::last_os_error());
    }
    if so_err != 0 {
        return Err(io::Error::from_raw_os_error(so_err));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::Endpoint;
    use std::io::{Read, Write};
    use std::net::TcpListener;
    use std::os::unix::io::IntoRawFd;
    use std::os::unix::net::UnixStream;

    fn spawn_echo_backend() -> (std::net::SocketAddr, thread::JoinHandle<()>) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let handle = thread::spawn(move || {
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
        (addr, handle)
    }

    #[test]
    fn echoes_bytes_through_backend_connection() {
        let (backend_addr, _echo_thread) = spawn_echo_backend();
        let (join, handle) = Reactor::spawn(Duration::from_secs(30)).expect("spawn reactor");

        let (mut test_client, conn_side) = UnixStream::pair().unwrap();
        conn_side.set_nonblocking(true).unwrap();
        let client_fd = conn_side.into_raw_fd();

        let mut conn = ProxyConn::new(
            client_fd,
            Endpoint::new(backend_addr.ip().to_string(), backend_addr.port()),
        );
        conn.connect_to_backend().expect("dial backend");

        handle.submit(conn).ok().expect("submit");

        test_client
            .set_read_timeout(Some(Duration::from_secs(2)))
            .unwrap();
        test_client.write_all(b"ping").unwrap();

        let mut buf = [0u8; 16];
        let n = test_client.read(&mut buf).expect("echoed reply");
        assert_eq!(&buf[..n], b"ping");

        handle.stop();
        join.join().unwrap();
    }

    #[test]
    fn stop_is_idempotent_and_joins_cleanly() {
        let (join, handle) = Reactor::spawn(Duration::from_secs(30)).expect("spawn reactor");
        handle.stop();
        handle.stop();
        join.join().unwrap();
        assert!(!handle.is_running());
    }
}
