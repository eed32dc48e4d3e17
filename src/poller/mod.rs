//! Readiness multiplexers.
//!
//! Each worker owns exactly one [`Poller`], chosen by its [`SocketType`] when
//! the worker is initialized: the kernel's edge-triggered epoll for TCP/UDP,
//! or the SRT library's own epoll for reliable UDP. Both report readiness in
//! the same [`EventFlags`] vocabulary so the event loop never branches on the
//! backend.

pub mod epoll;
pub mod srt;

use std::fmt;
use std::ops::{BitOr, BitOrAssign};
use std::sync::Arc;
use std::time::Duration;

use crate::errors::{Error, Result};
use crate::types::{RawHandle, SocketType};

pub use epoll::EpollPoller;
pub use srt::{SrtApi, SrtPoller};

/// Unified readiness flags. The bit values follow epoll.
#[derive(Clone, Copy, PartialEq, Eq, Default, Hash)]
pub struct EventFlags(u32);

impl EventFlags {
    pub const EMPTY: EventFlags = EventFlags(0);
    pub const READABLE: EventFlags = EventFlags(libc::EPOLLIN as u32);
    pub const WRITABLE: EventFlags = EventFlags(libc::EPOLLOUT as u32);
    pub const ERROR: EventFlags = EventFlags(libc::EPOLLERR as u32);
    pub const HANGUP: EventFlags = EventFlags(libc::EPOLLHUP as u32);
    pub const PEER_HALF_CLOSE: EventFlags = EventFlags(libc::EPOLLRDHUP as u32);
    pub const EDGE_TRIGGERED: EventFlags = EventFlags(libc::EPOLLET as u32);

    const NAMES: [(EventFlags, &'static str); 6] = [
        (EventFlags::READABLE, "IN"),
        (EventFlags::WRITABLE, "OUT"),
        (EventFlags::ERROR, "ERR"),
        (EventFlags::HANGUP, "HUP"),
        (EventFlags::PEER_HALF_CLOSE, "RDHUP"),
        (EventFlags::EDGE_TRIGGERED, "ET"),
    ];

    pub const fn from_bits(bits: u32) -> Self {
        EventFlags(bits)
    }

    pub const fn bits(self) -> u32 {
        self.0
    }

    pub const fn contains(self, other: EventFlags) -> bool {
        self.0 & other.0 == other.0
    }

    pub const fn intersects(self, other: EventFlags) -> bool {
        self.0 & other.0 != 0
    }

    pub const fn is_empty(self) -> bool {
        self.0 == 0
    }

    pub fn insert(&mut self, other: EventFlags) {
        self.0 |= other.0;
    }

    pub fn remove(&mut self, other: EventFlags) {
        self.0 &= !other.0;
    }
}

impl BitOr for EventFlags {
    type Output = EventFlags;

    fn bitor(self, rhs: EventFlags) -> EventFlags {
        EventFlags(self.0 | rhs.0)
    }
}

impl BitOrAssign for EventFlags {
    fn bitor_assign(&mut self, rhs: EventFlags) {
        self.insert(rhs);
    }
}

impl fmt::Debug for EventFlags {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut first = true;
        for (flag, name) in EventFlags::NAMES {
            if self.contains(flag) {
                if !first {
                    f.write_str("|")?;
                }
                f.write_str(name)?;
                first = false;
            }
        }
        if first {
            f.write_str("NONE")?;
        }
        Ok(())
    }
}

/// A readiness notification, already translated to the unified flag set.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PollEvent {
    pub handle: RawHandle,
    pub flags: EventFlags,
}

/// Readiness multiplexer backend.
///
/// `register`/`unregister` are called from any thread; `wait` only from the
/// owning worker's event-loop thread. The native handle is released when the
/// poller is dropped.
pub trait Poller: Send + Sync {
    fn native_handle(&self) -> RawHandle;

    /// Registers for readable, writable, error and hangup readiness,
    /// edge-triggered.
    fn register(&self, handle: RawHandle) -> Result<()>;

    fn unregister(&self, handle: RawHandle) -> Result<()>;

    /// Replaces the content of `events` with the next batch of readiness
    /// events. Returns `Ok(0)` on timeout.
    fn wait(&self, events: &mut Vec<PollEvent>, timeout: Duration) -> Result<usize>;
}

/// Creates the poller matching a worker's transport.
pub(crate) fn create(
    socket_type: SocketType,
    srt_api: Option<&Arc<dyn SrtApi>>,
    max_events: usize,
) -> Result<Arc<dyn Poller>> {
    match socket_type {
        SocketType::Tcp | SocketType::Udp => Ok(Arc::new(EpollPoller::new(max_events)?)),
        SocketType::Srt => match srt_api {
            Some(api) => Ok(Arc::new(SrtPoller::new(api.clone(), max_events)?)),
            None => Err(Error::Unsupported(socket_type)),
        },
    }
}
