use std::os::fd::{AsRawFd, FromRawFd, OwnedFd};
use std::time::Duration;

use nix::errno::Errno;
use parking_lot::Mutex;
use tracing::trace;

use super::{EventFlags, PollEvent, Poller};
use crate::errors::Result;
use crate::types::RawHandle;

/// Interest set used for every socket: IN, OUT, ERR, HUP, RDHUP, edge-triggered.
const INTEREST: EventFlags = EventFlags::from_bits(
    EventFlags::READABLE.bits()
        | EventFlags::WRITABLE.bits()
        | EventFlags::ERROR.bits()
        | EventFlags::HANGUP.bits()
        | EventFlags::PEER_HALF_CLOSE.bits()
        | EventFlags::EDGE_TRIGGERED.bits(),
);

/// Kernel epoll instance for TCP and UDP sockets.
///
/// The socket's native handle is stored in the event's user data and is
/// resolved back to the socket by the worker.
pub struct EpollPoller {
    epfd: OwnedFd,
    // Only locked by the event-loop thread.
    events: Mutex<Vec<libc::epoll_event>>,
}

impl EpollPoller {
    pub fn new(max_events: usize) -> Result<Self> {
        let fd = Errno::result(unsafe { libc::epoll_create1(libc::EPOLL_CLOEXEC) })?;
        // SAFETY: `fd` was just returned by epoll_create1 and is owned by nobody else.
        let epfd = unsafe { OwnedFd::from_raw_fd(fd) };
        let events = vec![libc::epoll_event { events: 0, u64: 0 }; max_events.max(1)];
        Ok(Self {
            epfd,
            events: Mutex::new(events),
        })
    }

    fn ctl(&self, op: libc::c_int, handle: RawHandle, flags: EventFlags) -> Result<()> {
        let mut event = libc::epoll_event {
            events: flags.bits(),
            u64: handle as u64,
        };
        let event_ptr = if op == libc::EPOLL_CTL_DEL {
            std::ptr::null_mut()
        } else {
            &mut event as *mut libc::epoll_event
        };
        Errno::result(unsafe { libc::epoll_ctl(self.epfd.as_raw_fd(), op, handle, event_ptr) })?;
        Ok(())
    }
}

impl Poller for EpollPoller {
    fn native_handle(&self) -> RawHandle {
        self.epfd.as_raw_fd()
    }

    fn register(&self, handle: RawHandle) -> Result<()> {
        self.ctl(libc::EPOLL_CTL_ADD, handle, INTEREST)
    }

    fn unregister(&self, handle: RawHandle) -> Result<()> {
        self.ctl(libc::EPOLL_CTL_DEL, handle, EventFlags::EMPTY)
    }

    fn wait(&self, events: &mut Vec<PollEvent>, timeout: Duration) -> Result<usize> {
        events.clear();

        let mut buffer = self.events.lock();
        let timeout_ms = timeout.as_millis().min(i32::MAX as u128) as libc::c_int;
        let count = unsafe {
            libc::epoll_wait(
                self.epfd.as_raw_fd(),
                buffer.as_mut_ptr(),
                buffer.len() as libc::c_int,
                timeout_ms,
            )
        };

        let count = match Errno::result(count) {
            Ok(count) => count as usize,
            // Interrupted by a signal handler; the next iteration retries.
            Err(Errno::EINTR) => return Ok(0),
            Err(errno) => return Err(errno.into()),
        };

        events.extend(buffer[..count].iter().map(|raw| {
            // epoll_event is packed; copy it out before reading fields.
            let raw = *raw;
            PollEvent {
                handle: raw.u64 as RawHandle,
                flags: EventFlags::from_bits(raw.events),
            }
        }));
        trace!(epoll = self.native_handle(), count, "epoll_wait returned");

        Ok(count)
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;
    use std::net::{TcpListener, TcpStream};

    use super::*;

    fn connected_pair() -> (TcpStream, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let client = TcpStream::connect(listener.local_addr().unwrap()).unwrap();
        let (server, _) = listener.accept().unwrap();
        (client, server)
    }

    #[test]
    fn registered_socket_reports_readiness() {
        let poller = EpollPoller::new(8).unwrap();
        let (mut client, server) = connected_pair();
        server.set_nonblocking(true).unwrap();
        let handle = server.as_raw_fd();

        poller.register(handle).unwrap();
        client.write_all(b"ping").unwrap();

        let mut events = Vec::new();
        let count = poller.wait(&mut events, Duration::from_secs(1)).unwrap();
        assert_eq!(count, 1);
        assert_eq!(events[0].handle, handle);
        assert!(events[0].flags.contains(EventFlags::READABLE));
    }

    #[test]
    fn double_registration_is_rejected() {
        let poller = EpollPoller::new(8).unwrap();
        let (_client, server) = connected_pair();
        poller.register(server.as_raw_fd()).unwrap();

        let err = poller.register(server.as_raw_fd()).unwrap_err();
        assert!(matches!(err, crate::errors::Error::Os(Errno::EEXIST)));
    }

    #[test]
    fn unregistering_a_closed_handle_is_bad_descriptor() {
        let poller = EpollPoller::new(8).unwrap();
        // Never opened in this process, so it behaves like a handle closed elsewhere.
        let err = poller.unregister(1 << 20).unwrap_err();
        assert!(err.is_bad_descriptor());
    }

    extern "C" fn ignore_signal(_: libc::c_int) {}

    #[test]
    fn signal_interrupted_wait_reports_no_events() {
        use std::os::unix::thread::JoinHandleExt;
        use std::time::Instant;

        // Installed without SA_RESTART so the wait fails with EINTR.
        unsafe {
            let mut action: libc::sigaction = std::mem::zeroed();
            action.sa_sigaction = ignore_signal as libc::sighandler_t;
            libc::sigemptyset(&mut action.sa_mask);
            assert_eq!(libc::sigaction(libc::SIGUSR1, &action, std::ptr::null_mut()), 0);
        }

        let poller = std::sync::Arc::new(EpollPoller::new(8).unwrap());
        let waiter = {
            let poller = poller.clone();
            std::thread::spawn(move || {
                let started = Instant::now();
                let mut events = Vec::new();
                let count = poller.wait(&mut events, Duration::from_secs(10)).unwrap();
                (count, events.len(), started.elapsed())
            })
        };
        while !waiter.is_finished() {
            std::thread::sleep(Duration::from_millis(20));
            unsafe { libc::pthread_kill(waiter.as_pthread_t(), libc::SIGUSR1) };
        }

        let (count, len, elapsed) = waiter.join().unwrap();
        assert_eq!((count, len), (0, 0));
        assert!(elapsed < Duration::from_secs(10));
    }

    #[test]
    fn idle_wait_times_out_with_no_events() {
        let poller = EpollPoller::new(8).unwrap();
        let mut events = vec![PollEvent {
            handle: 7,
            flags: EventFlags::READABLE,
        }];
        assert_eq!(poller.wait(&mut events, Duration::from_millis(10)).unwrap(), 0);
        assert!(events.is_empty());
    }
}
