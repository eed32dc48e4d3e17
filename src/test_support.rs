//! Doubles shared by the unit tests.

use std::collections::{HashMap, HashSet, VecDeque};
use std::io;
use std::sync::{Arc, Weak};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::thread;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

use crate::api::{SharedSocket, Socket};
use crate::errors::{Error, Result, SocketError};
use crate::poller::srt::{SrtApi, SrtEpollEvent, SrtEpollId, SrtSockStatus};
use crate::types::{BlockingMode, DispatchResult, RawHandle, SocketState, SocketType};
use crate::worker::WorkerHandle;

/// Polls `condition` until it holds or `deadline` elapses.
pub fn wait_until(deadline: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let started = Instant::now();
    loop {
        if condition() {
            return true;
        }
        if started.elapsed() >= deadline {
            return false;
        }
        thread::sleep(Duration::from_millis(2));
    }
}

#[derive(Default)]
struct FakeSrtState {
    next_eid: SrtEpollId,
    ready: VecDeque<Vec<SrtEpollEvent>>,
    statuses: HashMap<RawHandle, SrtSockStatus>,
    registered: HashMap<RawHandle, u32>,
    removals: HashMap<RawHandle, usize>,
    failing_waits: usize,
    empty_enabled: HashSet<SrtEpollId>,
    released: HashSet<SrtEpollId>,
}

/// In-memory SRT library: readiness is scripted with [`FakeSrt::push_ready`].
#[derive(Default)]
pub struct FakeSrt {
    state: Mutex<FakeSrtState>,
    wakeup: Condvar,
}

impl FakeSrt {
    pub fn set_status(&self, socket: RawHandle, status: SrtSockStatus) {
        self.state.lock().statuses.insert(socket, status);
    }

    /// Queues one readiness batch, returned by a single `epoll_uwait`.
    pub fn push_ready(&self, events: &[(RawHandle, u32)]) {
        let batch = events
            .iter()
            .map(|&(socket, events)| SrtEpollEvent { socket, events })
            .collect();
        self.state.lock().ready.push_back(batch);
        self.wakeup.notify_all();
    }

    pub fn empty_enabled(&self, eid: SrtEpollId) -> bool {
        self.state.lock().empty_enabled.contains(&eid)
    }

    pub fn is_released(&self, eid: SrtEpollId) -> bool {
        self.state.lock().released.contains(&eid)
    }

    pub fn registered_events(&self, socket: RawHandle) -> Option<u32> {
        self.state.lock().registered.get(&socket).copied()
    }

    /// Number of `epoll_remove_usock` calls made for `socket`, failed ones included.
    pub fn removal_count(&self, socket: RawHandle) -> usize {
        self.state.lock().removals.get(&socket).copied().unwrap_or(0)
    }

    /// Makes the next `count` waits fail.
    pub fn fail_waits(&self, count: usize) {
        self.state.lock().failing_waits = count;
        self.wakeup.notify_all();
    }

    pub fn failing_waits(&self) -> usize {
        self.state.lock().failing_waits
    }
}

impl SrtApi for FakeSrt {
    fn epoll_create(&self) -> Result<SrtEpollId> {
        let mut state = self.state.lock();
        state.next_eid += 1;
        Ok(state.next_eid)
    }

    fn epoll_enable_empty(&self, eid: SrtEpollId) -> Result<()> {
        self.state.lock().empty_enabled.insert(eid);
        Ok(())
    }

    fn epoll_add_usock(&self, _eid: SrtEpollId, socket: RawHandle, events: u32) -> Result<()> {
        let mut state = self.state.lock();
        if state.registered.contains_key(&socket) {
            return Err(Error::srt(5001, "socket already registered"));
        }
        state.registered.insert(socket, events);
        Ok(())
    }

    fn epoll_remove_usock(&self, _eid: SrtEpollId, socket: RawHandle) -> Result<()> {
        let mut state = self.state.lock();
        *state.removals.entry(socket).or_default() += 1;
        match state.registered.remove(&socket) {
            Some(_) => Ok(()),
            None => Err(Error::srt(5004, "invalid socket")),
        }
    }

    fn epoll_uwait(
        &self,
        _eid: SrtEpollId,
        events: &mut [SrtEpollEvent],
        timeout: Duration,
    ) -> Result<usize> {
        let deadline = Instant::now() + timeout;
        let mut state = self.state.lock();
        loop {
            if state.failing_waits > 0 {
                state.failing_waits -= 1;
                return Err(Error::srt(6003, "epoll wait failed"));
            }
            if let Some(batch) = state.ready.pop_front() {
                let mut count = 0;
                for event in batch {
                    if count < events.len() && state.registered.contains_key(&event.socket) {
                        events[count] = event;
                        count += 1;
                    }
                }
                return Ok(count);
            }
            if self.wakeup.wait_until(&mut state, deadline).timed_out() {
                return Ok(0);
            }
        }
    }

    fn sock_state(&self, socket: RawHandle) -> SrtSockStatus {
        self.state
            .lock()
            .statuses
            .get(&socket)
            .copied()
            .unwrap_or(SrtSockStatus::Connected)
    }

    fn epoll_release(&self, eid: SrtEpollId) {
        self.state.lock().released.insert(eid);
    }
}

/// Scriptable [`Socket`] that counts every callback the worker makes.
#[derive(Debug)]
pub struct RecordingSocket {
    this: Weak<RecordingSocket>,
    // Unregisters itself on close once attached.
    worker: Mutex<Option<WorkerHandle>>,
    handle: RawHandle,
    socket_type: SocketType,
    state: Mutex<SocketState>,
    blocking: AtomicBool,
    closable: AtomicBool,
    awaiting_first_event: AtomicBool,
    socket_error: Mutex<std::result::Result<i32, i32>>,
    dispatch_results: Mutex<VecDeque<DispatchResult>>,
    has_command: AtomicBool,
    expired: AtomicBool,
    pub connected: AtomicUsize,
    pub connect_errors: Mutex<Vec<SocketError>>,
    pub data_available: AtomicUsize,
    pub dispatches: AtomicUsize,
    pub closes: Mutex<Vec<SocketState>>,
    pub end_of_stream: AtomicUsize,
}

impl RecordingSocket {
    pub fn new(handle: RawHandle, socket_type: SocketType, state: SocketState) -> Arc<Self> {
        Arc::new_cyclic(|this| Self {
            this: this.clone(),
            worker: Mutex::new(None),
            handle,
            socket_type,
            state: Mutex::new(state),
            blocking: AtomicBool::new(false),
            closable: AtomicBool::new(true),
            awaiting_first_event: AtomicBool::new(false),
            socket_error: Mutex::new(Ok(0)),
            dispatch_results: Mutex::new(VecDeque::new()),
            has_command: AtomicBool::new(false),
            expired: AtomicBool::new(false),
            connected: AtomicUsize::new(0),
            connect_errors: Mutex::new(Vec::new()),
            data_available: AtomicUsize::new(0),
            dispatches: AtomicUsize::new(0),
            closes: Mutex::new(Vec::new()),
            end_of_stream: AtomicUsize::new(0),
        })
    }

    pub fn shared(self: &Arc<Self>) -> SharedSocket {
        self.clone()
    }

    pub fn attach(&self, worker: WorkerHandle) {
        *self.worker.lock() = Some(worker);
    }

    pub fn set_blocking(&self, blocking: bool) {
        self.blocking.store(blocking, Ordering::SeqCst);
    }

    pub fn set_awaiting_first_event(&self, awaiting: bool) {
        self.awaiting_first_event.store(awaiting, Ordering::SeqCst);
    }

    pub fn set_pending_error(&self, code: i32) {
        *self.socket_error.lock() = Ok(code);
    }

    pub fn fail_error_query(&self, code: i32) {
        *self.socket_error.lock() = Err(code);
    }

    /// Results returned by the next `dispatch_events` calls, then `Dispatched`.
    pub fn push_dispatch_result(&self, result: DispatchResult) {
        self.dispatch_results.lock().push_back(result);
    }

    pub fn set_has_command(&self, has_command: bool) {
        self.has_command.store(has_command, Ordering::SeqCst);
    }

    pub fn set_expired(&self, expired: bool) {
        self.expired.store(expired, Ordering::SeqCst);
    }

    pub fn connected_count(&self) -> usize {
        self.connected.load(Ordering::SeqCst)
    }

    pub fn connect_error_count(&self) -> usize {
        self.connect_errors.lock().len()
    }

    pub fn data_count(&self) -> usize {
        self.data_available.load(Ordering::SeqCst)
    }

    pub fn dispatch_count(&self) -> usize {
        self.dispatches.load(Ordering::SeqCst)
    }

    pub fn close_states(&self) -> Vec<SocketState> {
        self.closes.lock().clone()
    }

    fn record_close(&self, state: SocketState) -> bool {
        if !self.closable.swap(false, Ordering::SeqCst) {
            return false;
        }
        let worker = self.worker.lock().clone();
        if let (Some(worker), Some(this)) = (worker, self.this.upgrade()) {
            worker.delete_from_epoll(&(this as SharedSocket));
        }
        *self.state.lock() = state;
        self.closes.lock().push(state);
        true
    }
}

impl Socket for RecordingSocket {
    fn native_handle(&self) -> RawHandle {
        self.handle
    }

    fn socket_type(&self) -> SocketType {
        self.socket_type
    }

    fn state(&self) -> SocketState {
        *self.state.lock()
    }

    fn set_state(&self, state: SocketState) {
        *self.state.lock() = state;
    }

    fn blocking_mode(&self) -> BlockingMode {
        if self.blocking.load(Ordering::SeqCst) {
            BlockingMode::Blocking
        } else {
            BlockingMode::NonBlocking
        }
    }

    fn is_closable(&self) -> bool {
        self.closable.load(Ordering::SeqCst)
    }

    fn need_to_wait_first_event(&self) -> bool {
        self.awaiting_first_event.load(Ordering::SeqCst)
    }

    fn set_first_event_received(&self) {
        self.awaiting_first_event.store(false, Ordering::SeqCst);
    }

    fn socket_error(&self) -> io::Result<i32> {
        (*self.socket_error.lock()).map_err(io::Error::from_raw_os_error)
    }

    fn dispatch_events(&self) -> DispatchResult {
        self.dispatches.fetch_add(1, Ordering::SeqCst);
        self.dispatch_results
            .lock()
            .pop_front()
            .unwrap_or(DispatchResult::Dispatched)
    }

    fn on_connected_event(&self, error: Option<&SocketError>) {
        match error {
            None => {
                self.connected.fetch_add(1, Ordering::SeqCst);
                let mut state = self.state.lock();
                if *state == SocketState::Connecting {
                    *state = SocketState::Connected;
                }
            }
            Some(err) => self.connect_errors.lock().push(err.clone()),
        }
    }

    fn on_data_available_event(&self) {
        self.data_available.fetch_add(1, Ordering::SeqCst);
    }

    fn has_command(&self) -> bool {
        self.has_command.load(Ordering::SeqCst)
    }

    fn has_expired_command(&self) -> bool {
        self.expired.load(Ordering::SeqCst)
    }

    fn close(&self) -> bool {
        self.record_close(SocketState::Closed)
    }

    fn close_internal(&self) -> bool {
        self.record_close(SocketState::Closed)
    }

    fn close_with_state(&self, state: SocketState) -> bool {
        self.record_close(state)
    }

    fn set_end_of_stream(&self) {
        self.end_of_stream.fetch_add(1, Ordering::SeqCst);
    }
}
