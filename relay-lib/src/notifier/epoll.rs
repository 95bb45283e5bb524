//! Linux backend for the readiness notifier, built directly on
//! `epoll_create1`/`epoll_ctl`/`epoll_wait` via `libc`. Edge-triggered
//! (`EPOLLET`) throughout, per the design.

use std::io;
use std::os::unix::io::RawFd;
use std::sync::atomic::{AtomicI32, Ordering};
use std::time::Duration;

use libc::{
    c_int, epoll_create1, epoll_ctl, epoll_event, epoll_wait, EPOLLERR, EPOLLET, EPOLLHUP, EPOLLIN,
    EPOLLOUT, EPOLLRDHUP, EPOLL_CLOEXEC, EPOLL_CTL_ADD, EPOLL_CTL_DEL, EPOLL_CTL_MOD,
};

use super::{Event, EventBuffer, Interest, Notifier};

const CLOSED_FD: RawFd = -1;

pub struct EpollNotifier {
    epfd: AtomicI32,
}

fn interest_bits(interest: Interest) -> u32 {
    let mut bits = EPOLLET as u32;
    if interest.readable {
        bits |= EPOLLIN as u32;
    }
    if interest.writable {
        bits |= EPOLLOUT as u32;
    }
    bits
}

fn ctl(epfd: RawFd, op: c_int, fd: RawFd, events: u32) -> io::Result<()> {
    let mut ev = epoll_event { events, u64: fd as u64 };
    let ret = unsafe { epoll_ctl(epfd, op, fd, &mut ev as *mut epoll_event) };
    if ret < 0 {
        Err(io::Error::last_os_error())
    } else {
        Ok(())
    }
}

impl Notifier for EpollNotifier {
    fn new() -> io::Result<EpollNotifier> {
        let fd = unsafe { epoll_create1(EPOLL_CLOEXEC) };
        if fd < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(EpollNotifier { epfd: AtomicI32::new(fd) })
    }

    fn register(&self, fd: RawFd, interest: Interest) -> io::Result<()> {
        ctl(self.epfd.load(Ordering::SeqCst), EPOLL_CTL_ADD, fd, interest_bits(interest))
    }

    fn reregister(&self, fd: RawFd, interest: Interest) -> io::Result<()> {
        ctl(self.epfd.load(Ordering::SeqCst), EPOLL_CTL_MOD, fd, interest_bits(interest))
    }

    fn deregister(&self, fd: RawFd) -> io::Result<()> {
        ctl(self.epfd.load(Ordering::SeqCst), EPOLL_CTL_DEL, fd, 0)
    }

    fn poll(&self, out: &mut EventBuffer, timeout: Option<Duration>) -> io::Result<usize> {
        out.clear();

        let timeout_ms: c_int = match timeout {
            None => -1,
            Some(d) => {
                let ms = d.as_millis();
                if ms > i32::max_value() as u128 {
                    i32::max_value()
                } else {
                    ms as i32
                }
            }
        };

        const MAX_EVENTS: usize = 1024;
        let mut raw: [epoll_event; MAX_EVENTS] = unsafe { std::mem::zeroed() };

        let n = loop {
            let ret = unsafe {
                epoll_wait(self.epfd.load(Ordering::SeqCst), raw.as_mut_ptr(), MAX_EVENTS as c_int, timeout_ms)
            };
            if ret < 0 {
                let err = io::Error::last_os_error();
                if err.kind() == io::ErrorKind::Interrupted {
                    continue;
                }
                return Err(err);
            }
            break ret as usize;
        };

        for entry in raw.iter().take(n) {
            let bits = { entry.events };
            let fd = { entry.u64 } as RawFd;
            out.push(Event {
                fd,
                readable: bits & (EPOLLIN as u32) != 0,
                writable: bits & (EPOLLOUT as u32) != 0,
                error: bits & (EPOLLERR as u32) != 0,
                closed: bits & (EPOLLHUP as u32 | EPOLLRDHUP as u32) != 0,
            });
        }

        Ok(n)
    }

    fn close(&self) {
        let fd = self.epfd.load(Ordering::SeqCst);
        if fd != CLOSED_FD {
            unsafe {
                libc::close(fd);
            }
            self.epfd.store(CLOSED_FD, Ordering::SeqCst);
        }
    }
}

impl Drop for EpollNotifier {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::TcpListener;
    use std::os::unix::io::AsRawFd;

    #[test]
    fn register_and_observe_readable_listener() {
        let notifier = EpollNotifier::new().expect("epoll_create1");
        let listener = TcpListener::bind("127.0.0.1:0").expect("bind");
        listener.set_nonblocking(true).unwrap();
        let fd = listener.as_raw_fd();

        notifier.register(fd, Interest::READABLE).expect("register");

        let client = std::net::TcpStream::connect(listener.local_addr().unwrap()).expect("connect");
        drop(client);

        let mut events = EventBuffer::with_capacity(8);
        let n = notifier
            .poll(&mut events, Some(Duration::from_secs(2)))
            .expect("poll");
        assert!(n >= 1);
        assert!(events.iter().any(|e| e.fd == fd && e.readable));

        notifier.deregister(fd).expect("deregister");
    }

    #[test]
    fn close_is_idempotent() {
        let notifier = EpollNotifier::new().expect("epoll_create1");
        notifier.close();
        notifier.close();
    }
}
