//! The readiness notifier capability: register/reregister/deregister
//! a file descriptor's interest set, and block waiting for readiness
//! events.
//!
//! Two concrete backends exist, chosen at compile time by
//! `cfg(target_os)`: [`epoll`] on Linux and [`kqueue`] on the BSDs and
//! macOS. Both are edge-triggered; callers must drain reads and
//! writes until `WouldBlock`.

use std::io;
use std::os::unix::io::RawFd;
use std::time::Duration;

#[cfg(target_os = "linux")]
pub mod epoll;
#[cfg(any(
    target_os = "macos",
    target_os = "ios",
    target_os = "freebsd",
    target_os = "dragonfly",
    target_os = "netbsd",
    target_os = "openbsd"
))]
pub mod kqueue;

/// The interest set for a single fd: which readiness transitions
/// should be reported.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Interest {
    pub readable: bool,
    pub writable: bool,
}

impl Interest {
    pub const NONE: Interest = Interest { readable: false, writable: false };
    pub const READABLE: Interest = Interest { readable: true, writable: false };
    pub const WRITABLE: Interest = Interest { readable: false, writable: true };
    pub const READ_WRITE: Interest = Interest { readable: true, writable: true };
}

/// A readiness transition delivered for a single fd.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Event {
    pub fd: RawFd,
    pub readable: bool,
    pub writable: bool,
    pub error: bool,
    pub closed: bool,
}

impl Event {
    pub fn is_error_or_closed(&self) -> bool {
        self.error || self.closed
    }
}

/// Reusable output buffer for [`Notifier::poll`]. Cleared before each
/// `poll` fills it, never grown past what the OS delivers in a batch.
#[derive(Debug, Default)]
pub struct EventBuffer {
    events: Vec<Event>,
}

impl EventBuffer {
    pub fn with_capacity(capacity: usize) -> EventBuffer {
        EventBuffer { events: Vec::with_capacity(capacity) }
    }

    pub fn iter(&self) -> impl Iterator<Item = &Event> {
        self.events.iter()
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    fn clear(&mut self) {
        self.events.clear();
    }

    fn push(&mut self, e: Event) {
        self.events.push(e);
    }
}

/// The readiness notifier capability described in the design: register,
/// modify, unregister interest for a fd, and block waiting for events.
///
/// Implementations own one OS-level polling instance (an epoll or
/// kqueue fd) and must make `close` idempotent: a second call is a
/// no-op, never a double-close.
pub trait Notifier: Sized {
    fn new() -> io::Result<Self>;
    fn register(&self, fd: RawFd, interest: Interest) -> io::Result<()>;
    fn reregister(&self, fd: RawFd, interest: Interest) -> io::Result<()>;
    fn deregister(&self, fd: RawFd) -> io::Result<()>;
    /// Blocks until at least one event is ready or `timeout` elapses.
    /// `events` is cleared before being filled. Returns the number of
    /// events delivered.
    fn poll(&self, events: &mut EventBuffer, timeout: Option<Duration>) -> io::Result<usize>;
    /// Closes the underlying OS handle. Idempotent.
    fn close(&self);
}

#[cfg(target_os = "linux")]
pub type PlatformNotifier = epoll::EpollNotifier;

#[cfg(any(
    target_os = "macos",
    target_os = "ios",
    target_os = "freebsd",
    target_os = "dragonfly",
    target_os = "netbsd",
    target_os = "openbsd"
))]
pub type PlatformNotifier = kqueue::KqueueNotifier;
