//! Reliable-UDP (SRT) readiness backend.
//!
//! SRT sockets live in user space and are polled through the library's own
//! epoll (`srt_epoll_*`), not the kernel's. [`SrtApi`] is the slice of that
//! library the worker needs; the application provides the binding.
//! [`SrtPoller`] folds each socket's connection status into synthetic
//! hangup flags so the event loop sees the same [`EventFlags`] as for TCP.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tracing::{debug, trace};

use super::{EventFlags, PollEvent, Poller};
use crate::errors::Result;
use crate::types::RawHandle;

pub type SrtEpollId = i32;

pub const SRT_EPOLL_IN: u32 = 0x1;
pub const SRT_EPOLL_OUT: u32 = 0x4;
pub const SRT_EPOLL_ERR: u32 = 0x8;
pub const SRT_EPOLL_ET: u32 = 1 << 31;

/// `SRT_SOCKSTATUS`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SrtSockStatus {
    Init,
    Opened,
    Listening,
    Connecting,
    Connected,
    /// Peer went away unexpectedly.
    Broken,
    Closing,
    /// Closed as expected.
    Closed,
    NonExist,
}

/// `SRT_EPOLL_EVENT`.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct SrtEpollEvent {
    pub socket: RawHandle,
    pub events: u32,
}

/// The SRT library calls used by the worker.
pub trait SrtApi: Send + Sync {
    fn epoll_create(&self) -> Result<SrtEpollId>;

    /// `srt_epoll_set(eid, SRT_EPOLL_ENABLE_EMPTY)`: allow waiting with no
    /// sockets registered.
    fn epoll_enable_empty(&self, eid: SrtEpollId) -> Result<()>;

    fn epoll_add_usock(&self, eid: SrtEpollId, socket: RawHandle, events: u32) -> Result<()>;

    fn epoll_remove_usock(&self, eid: SrtEpollId, socket: RawHandle) -> Result<()>;

    /// `srt_epoll_uwait`: unlike the kernel wait, `Ok(0)` means the timeout
    /// elapsed with nothing ready.
    fn epoll_uwait(
        &self,
        eid: SrtEpollId,
        events: &mut [SrtEpollEvent],
        timeout: Duration,
    ) -> Result<usize>;

    fn sock_state(&self, socket: RawHandle) -> SrtSockStatus;

    fn epoll_release(&self, eid: SrtEpollId);
}

pub struct SrtPoller {
    api: Arc<dyn SrtApi>,
    eid: SrtEpollId,
    events: Mutex<Vec<SrtEpollEvent>>,
}

impl SrtPoller {
    pub fn new(api: Arc<dyn SrtApi>, max_events: usize) -> Result<Self> {
        let eid = api.epoll_create()?;
        if let Err(err) = api.epoll_enable_empty(eid) {
            api.epoll_release(eid);
            return Err(err);
        }
        Ok(Self {
            api,
            eid,
            events: Mutex::new(vec![SrtEpollEvent::default(); max_events.max(1)]),
        })
    }

    fn translate(&self, event: SrtEpollEvent) -> PollEvent {
        let mut flags = EventFlags::EMPTY;
        if event.events & SRT_EPOLL_IN != 0 {
            flags |= EventFlags::READABLE;
        }
        if event.events & SRT_EPOLL_OUT != 0 {
            flags |= EventFlags::WRITABLE;
        }
        if event.events & SRT_EPOLL_ERR != 0 {
            flags |= EventFlags::ERROR;
        }

        match self.api.sock_state(event.socket) {
            // A new client is waiting to be accepted, or the socket is up.
            SrtSockStatus::Listening | SrtSockStatus::Connected => {}
            SrtSockStatus::NonExist | SrtSockStatus::Broken | SrtSockStatus::Closed => {
                flags |= EventFlags::HANGUP;
            }
            status => {
                debug!(socket = event.socket, ?status, "Not handled SRT status");
            }
        }

        PollEvent {
            handle: event.socket,
            flags,
        }
    }
}

impl Poller for SrtPoller {
    fn native_handle(&self) -> RawHandle {
        self.eid
    }

    fn register(&self, handle: RawHandle) -> Result<()> {
        let events = SRT_EPOLL_IN | SRT_EPOLL_OUT | SRT_EPOLL_ERR | SRT_EPOLL_ET;
        self.api.epoll_add_usock(self.eid, handle, events)
    }

    fn unregister(&self, handle: RawHandle) -> Result<()> {
        self.api.epoll_remove_usock(self.eid, handle)
    }

    fn wait(&self, events: &mut Vec<PollEvent>, timeout: Duration) -> Result<usize> {
        events.clear();

        let mut buffer = self.events.lock();
        let count = self.api.epoll_uwait(self.eid, &mut buffer[..], timeout)?;
        let count = count.min(buffer.len());

        events.extend(buffer[..count].iter().map(|event| self.translate(*event)));
        trace!(eid = self.eid, count, "srt_epoll_uwait returned");

        Ok(count)
    }
}

impl Drop for SrtPoller {
    fn drop(&mut self) {
        self.api.epoll_release(self.eid);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::FakeSrt;

    fn poller(api: &Arc<FakeSrt>) -> SrtPoller {
        SrtPoller::new(api.clone(), 16).unwrap()
    }

    #[test]
    fn status_is_folded_into_hangup() {
        let api = Arc::new(FakeSrt::default());
        let poller = poller(&api);
        for socket in [10, 11, 12, 13] {
            poller.register(socket).unwrap();
        }
        api.set_status(10, SrtSockStatus::Connected);
        api.set_status(11, SrtSockStatus::Broken);
        api.set_status(12, SrtSockStatus::Closed);
        api.set_status(13, SrtSockStatus::NonExist);
        api.push_ready(&[
            (10, SRT_EPOLL_IN | SRT_EPOLL_OUT),
            (11, SRT_EPOLL_IN),
            (12, SRT_EPOLL_ERR),
            (13, SRT_EPOLL_OUT),
        ]);

        let mut events = Vec::new();
        assert_eq!(poller.wait(&mut events, Duration::from_millis(50)).unwrap(), 4);

        assert_eq!(events[0].flags, EventFlags::READABLE | EventFlags::WRITABLE);
        assert_eq!(events[1].flags, EventFlags::READABLE | EventFlags::HANGUP);
        assert_eq!(events[2].flags, EventFlags::ERROR | EventFlags::HANGUP);
        assert_eq!(events[3].flags, EventFlags::WRITABLE | EventFlags::HANGUP);
    }

    #[test]
    fn listening_socket_gets_no_synthetic_flags() {
        let api = Arc::new(FakeSrt::default());
        let poller = poller(&api);
        poller.register(20).unwrap();
        api.set_status(20, SrtSockStatus::Listening);
        api.push_ready(&[(20, SRT_EPOLL_IN)]);

        let mut events = Vec::new();
        poller.wait(&mut events, Duration::from_millis(50)).unwrap();
        assert_eq!(events, vec![PollEvent { handle: 20, flags: EventFlags::READABLE }]);
    }

    #[test]
    fn empty_uwait_is_a_timeout_and_release_happens_on_drop() {
        let api = Arc::new(FakeSrt::default());
        let poller = poller(&api);
        let eid = poller.native_handle();
        assert!(api.empty_enabled(eid));

        let mut events = Vec::new();
        assert_eq!(poller.wait(&mut events, Duration::from_millis(5)).unwrap(), 0);

        drop(poller);
        assert!(api.is_released(eid));
    }

    #[test]
    fn registration_uses_edge_triggered_interest() {
        let api = Arc::new(FakeSrt::default());
        let poller = poller(&api);
        poller.register(30).unwrap();
        assert_eq!(
            api.registered_events(30),
            Some(SRT_EPOLL_IN | SRT_EPOLL_OUT | SRT_EPOLL_ERR | SRT_EPOLL_ET)
        );
        poller.unregister(30).unwrap();
        assert_eq!(api.registered_events(30), None);
    }
}
