//! BSD/macOS backend for the readiness notifier, built directly on
//! `kqueue`/`kevent` via `libc`. `EV_CLEAR` gives the same
//! edge-triggered behavior as `EPOLLET` on Linux.

use std::io;
use std::os::unix::io::RawFd;
use std::ptr;
use std::sync::atomic::{AtomicI32, Ordering};
use std::time::Duration;

use libc::{
    c_int, kevent, kqueue, timespec, EVFILT_READ, EVFILT_WRITE, EV_ADD, EV_CLEAR, EV_DELETE,
    EV_EOF, EV_ERROR,
};

use super::{Event, EventBuffer, Interest, Notifier};

const CLOSED_FD: RawFd = -1;

pub struct KqueueNotifier {
    kq: AtomicI32,
}

fn filter_change(fd: RawFd, filter: i16, add: bool) -> kevent {
    let flags = if add { EV_ADD | EV_CLEAR } else { EV_DELETE };
    kevent {
        ident: fd as usize,
        filter,
        flags,
        fflags: 0,
        data: 0,
        udata: ptr::null_mut(),
    }
}

fn apply(kq: RawFd, changes: &mut [kevent]) -> io::Result<()> {
    if changes.is_empty() {
        return Ok(());
    }
    let ret = unsafe {
        kevent(
            kq,
            changes.as_ptr(),
            changes.len() as c_int,
            ptr::null_mut(),
            0,
            ptr::null(),
        )
    };
    if ret < 0 {
        let err = io::Error::last_os_error();
        // Deleting a filter that was never added fails ENOENT; harmless,
        // since the end state (no such filter registered) already holds.
        if err.raw_os_error() == Some(libc::ENOENT) {
            return Ok(());
        }
        Err(err)
    } else {
        Ok(())
    }
}

impl Notifier for KqueueNotifier {
    fn new() -> io::Result<KqueueNotifier> {
        let fd = unsafe { kqueue() };
        if fd < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(KqueueNotifier { kq: AtomicI32::new(fd) })
    }

    fn register(&self, fd: RawFd, interest: Interest) -> io::Result<()> {
        self.reregister(fd, interest)
    }

    fn reregister(&self, fd: RawFd, interest: Interest) -> io::Result<()> {
        let kq = self.kq.load(Ordering::SeqCst);
        let mut read_change = filter_change(fd, EVFILT_READ, interest.readable);
        apply(kq, std::slice::from_mut(&mut read_change))?;

        let mut write_change = filter_change(fd, EVFILT_WRITE, interest.writable);
        apply(kq, std::slice::from_mut(&mut write_change))?;

        Ok(())
    }

    fn deregister(&self, fd: RawFd) -> io::Result<()> {
        let kq = self.kq.load(Ordering::SeqCst);
        let _ = apply(kq, &mut [filter_change(fd, EVFILT_READ, false)]);
        let _ = apply(kq, &mut [filter_change(fd, EVFILT_WRITE, false)]);
        Ok(())
    }

    fn poll(&self, out: &mut EventBuffer, timeout: Option<Duration>) -> io::Result<usize> {
        out.clear();

        let ts = timeout.map(|d| timespec {
            tv_sec: d.as_secs() as libc::time_t,
            tv_nsec: d.subsec_nanos() as libc::c_long,
        });

        const MAX_EVENTS: usize = 1024;
        let mut raw: [kevent; MAX_EVENTS] = unsafe { std::mem::zeroed() };

        let n = loop {
            let ts_ptr = match &ts {
                Some(t) => t as *const timespec,
                None => ptr::null(),
            };
            let ret = unsafe {
                kevent(
                    self.kq.load(Ordering::SeqCst),
                    ptr::null(),
                    0,
                    raw.as_mut_ptr(),
                    MAX_EVENTS as c_int,
                    ts_ptr,
                )
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
            let fd = entry.ident as RawFd;
            let filter = entry.filter;
            let flags = entry.flags;
            let is_error = flags & EV_ERROR != 0;
            let is_eof = flags & EV_EOF != 0;

            out.push(Event {
                fd,
                readable: filter == EVFILT_READ,
                writable: filter == EVFILT_WRITE,
                error: is_error,
                closed: is_eof,
            });
        }

        Ok(n)
    }

    fn close(&self) {
        let fd = self.kq.load(Ordering::SeqCst);
        if fd != CLOSED_FD {
            unsafe {
                libc::close(fd);
            }
            self.kq.store(CLOSED_FD, Ordering::SeqCst);
        }
    }
}

impl Drop for KqueueNotifier {
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
        let notifier = KqueueNotifier::new().expect("kqueue");
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
        let notifier = KqueueNotifier::new().expect("kqueue");
        notifier.close();
        notifier.close();
    }
}
