//! A single epoll thread and the sockets it owns.
//!
//! Producers never touch the live socket map: registration and removal go
//! through lock-free queues that the event loop merges once per iteration.
//! Re-dispatch requests and connection-timeout verdicts have their own small
//! locks so nothing serializes the hot dispatch path.

mod event_loop;

use std::collections::VecDeque;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam::queue::SegQueue;
use parking_lot::{Mutex, RwLock};
use tracing::{debug, error, info};

use crate::api::SharedSocket;
use crate::config::WorkerConfig;
use crate::delay_queue::{DelayQueue, DelayQueueAction};
use crate::errors::{Error, Result};
use crate::poller::{self, Poller, SrtApi};
use crate::types::{INVALID_HANDLE, RawHandle, SocketType};

use event_loop::EventLoop;

/// Linux limits thread names to 15 bytes plus the terminator.
const MAX_THREAD_NAME_LEN: usize = 15;

pub(crate) fn thread_name(prefix: &str, pool_name: &str) -> String {
    let mut name: String = format!("{prefix}{pool_name}")
        .chars()
        .filter(|c| *c != ' ')
        .collect();
    if name.len() > MAX_THREAD_NAME_LEN {
        let mut end = MAX_THREAD_NAME_LEN;
        while !name.is_char_boundary(end) {
            end -= 1;
        }
        name.truncate(end);
    }
    name
}

/// State reachable from producer threads, the event loop and the timeout
/// scheduler.
pub(crate) struct WorkerShared {
    name: String,
    socket_type: SocketType,
    poller: RwLock<Option<Arc<dyn Poller>>>,
    stop: AtomicBool,

    sockets_to_insert: SegQueue<SharedSocket>,
    sockets_to_delete: SegQueue<SharedSocket>,
    // `None` while the loop is not running; closed by the loop on shutdown.
    sockets_to_dispatch: Mutex<Option<VecDeque<SharedSocket>>>,
    connection_timed_out_queue: Mutex<Vec<SharedSocket>>,
    connection_callback_queue: DelayQueue,

    // Published by the event loop after each merge.
    socket_count: AtomicUsize,
    gc_candidate_count: AtomicUsize,
}

impl WorkerShared {
    fn poller(&self) -> Result<Arc<dyn Poller>> {
        self.poller.read().clone().ok_or(Error::NotInitialized)
    }

    fn native_handle(&self) -> RawHandle {
        self.poller
            .read()
            .as_ref()
            .map_or(INVALID_HANDLE, |poller| poller.native_handle())
    }

    fn add_to_epoll(&self, socket: &SharedSocket) -> Result<()> {
        let handle = socket.native_handle();
        debug!(worker = %self.name, handle, "Trying to add socket to epoll");

        self.poller()?.register(handle)?;
        self.sockets_to_insert.push(socket.clone());
        Ok(())
    }

    fn delete_from_epoll(&self, socket: &SharedSocket) -> Result<()> {
        let handle = socket.native_handle();
        debug!(worker = %self.name, handle, "Trying to unregister socket from epoll");

        match self.poller()?.unregister(handle) {
            Ok(()) => {
                debug!(worker = %self.name, handle, "Socket is unregistered");
                self.sockets_to_delete.push(socket.clone());
                Ok(())
            }
            Err(err) if err.is_bad_descriptor() => {
                // The kernel dropped the registration when the handle was closed.
                self.sockets_to_delete.push(socket.clone());
                Err(err)
            }
            Err(err) => Err(err),
        }
    }

    /// `false` when no loop will run the dispatch; the caller must finish
    /// the socket itself.
    fn enqueue_to_dispatch_later(&self, socket: &SharedSocket) -> bool {
        match self.sockets_to_dispatch.lock().as_mut() {
            Some(sockets) => {
                sockets.push_back(socket.clone());
                true
            }
            None => false,
        }
    }

    fn enqueue_to_check_connection_timeout(
        self: &Arc<Self>,
        socket: &SharedSocket,
        timeout: Duration,
    ) {
        let worker = Arc::downgrade(self);
        let mut socket = Some(socket.clone());
        self.connection_callback_queue.push(
            move || {
                if let (Some(worker), Some(socket)) = (worker.upgrade(), socket.take()) {
                    worker.connection_timed_out_queue.lock().push(socket);
                }
                DelayQueueAction::Stop
            },
            timeout,
        );
    }

    fn log_add_error(&self, socket: &SharedSocket, err: &Error) {
        error!(
            worker = %self.name,
            handle = socket.native_handle(),
            %err,
            "Could not add to epoll"
        );
    }

    fn log_delete_error(&self, socket: &SharedSocket, err: &Error) {
        if err.is_bad_descriptor() {
            debug!(
                worker = %self.name,
                handle = socket.native_handle(),
                "Socket was already closed before unregistering"
            );
        } else {
            error!(
                worker = %self.name,
                handle = socket.native_handle(),
                %err,
                "Could not delete from epoll"
            );
        }
    }
}

/// Point-in-time queue sizes of a worker.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct WorkerSummary {
    pub native_handle: RawHandle,
    pub socket_count: usize,
    pub sockets_to_insert: usize,
    pub sockets_to_delete: usize,
    pub connection_timed_out: usize,
    pub sockets_to_dispatch: usize,
    pub gc_candidates: usize,
}

/// Owns one readiness multiplexer and the thread that drives it.
pub struct SocketPoolWorker {
    socket_type: SocketType,
    config: WorkerConfig,
    srt_api: Option<Arc<dyn SrtApi>>,
    shared: Arc<WorkerShared>,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl SocketPoolWorker {
    pub fn new(pool_name: impl Into<String>, socket_type: SocketType, config: WorkerConfig) -> Self {
        Self::build(pool_name.into(), socket_type, config, None)
    }

    /// A worker for SRT sockets, polled through `api`.
    pub fn with_srt(pool_name: impl Into<String>, config: WorkerConfig, api: Arc<dyn SrtApi>) -> Self {
        Self::build(pool_name.into(), SocketType::Srt, config, Some(api))
    }

    pub(crate) fn build(
        name: String,
        socket_type: SocketType,
        config: WorkerConfig,
        srt_api: Option<Arc<dyn SrtApi>>,
    ) -> Self {
        let connection_callback_queue =
            DelayQueue::new(thread_name("DQ", &name), config.delay_queue_resolution);
        let shared = Arc::new(WorkerShared {
            name,
            socket_type,
            poller: RwLock::new(None),
            stop: AtomicBool::new(false),
            sockets_to_insert: SegQueue::new(),
            sockets_to_delete: SegQueue::new(),
            sockets_to_dispatch: Mutex::new(None),
            connection_timed_out_queue: Mutex::new(Vec::new()),
            connection_callback_queue,
            socket_count: AtomicUsize::new(0),
            gc_candidate_count: AtomicUsize::new(0),
        });
        Self {
            socket_type,
            config,
            srt_api,
            shared,
            thread: Mutex::new(None),
        }
    }

    pub fn name(&self) -> &str {
        &self.shared.name
    }

    pub fn socket_type(&self) -> SocketType {
        self.socket_type
    }

    /// Handle of the multiplexer, [`INVALID_HANDLE`] while uninitialized.
    pub fn native_handle(&self) -> RawHandle {
        self.shared.native_handle()
    }

    pub fn is_initialized(&self) -> bool {
        self.shared.poller.read().is_some()
    }

    /// Number of sockets in the live map as of the last merge.
    pub fn socket_count(&self) -> usize {
        self.shared.socket_count.load(Ordering::Acquire)
    }

    pub fn handle(&self) -> WorkerHandle {
        WorkerHandle {
            shared: Arc::downgrade(&self.shared),
        }
    }

    pub fn initialize(&self) -> bool {
        match self.try_initialize() {
            Ok(()) => true,
            Err(err) => {
                error!(
                    worker = %self.shared.name,
                    socket_type = %self.socket_type,
                    %err,
                    "Could not initialize worker"
                );
                false
            }
        }
    }

    /// Creates the multiplexer and starts the event loop.
    pub fn try_initialize(&self) -> Result<()> {
        let mut thread_slot = self.thread.lock();
        let poller = {
            let mut slot = self.shared.poller.write();
            if slot.is_some() {
                return Err(Error::AlreadyInitialized);
            }
            let poller =
                poller::create(self.socket_type, self.srt_api.as_ref(), self.config.max_events)?;
            *slot = Some(poller.clone());
            poller
        };
        debug!(
            worker = %self.shared.name,
            epoll = poller.native_handle(),
            socket_type = %self.socket_type,
            "Epoll is created"
        );

        self.shared.stop.store(false, Ordering::Release);
        *self.shared.sockets_to_dispatch.lock() = Some(VecDeque::new());

        let event_loop = EventLoop::new(self.shared.clone(), poller, self.config.clone());
        let spawned = thread::Builder::new()
            .name(thread_name("SP", &self.shared.name))
            .spawn(move || event_loop.run());

        match spawned {
            Ok(handle) => {
                *thread_slot = Some(handle);
                Ok(())
            }
            Err(err) => {
                self.shared.sockets_to_dispatch.lock().take();
                self.shared.poller.write().take();
                Err(Error::ThreadSpawn(err))
            }
        }
    }

    pub fn uninitialize(&self) -> bool {
        match self.try_uninitialize() {
            Ok(()) => true,
            Err(err) => {
                error!(
                    worker = %self.shared.name,
                    socket_type = %self.socket_type,
                    %err,
                    "Could not uninitialize worker"
                );
                false
            }
        }
    }

    /// Stops the event loop, closing every socket it still owns, and
    /// releases the multiplexer.
    pub fn try_uninitialize(&self) -> Result<()> {
        let mut thread_slot = self.thread.lock();
        if self.shared.poller.read().is_none() {
            return Err(Error::NotInitialized);
        }

        let shared = &self.shared;
        shared.connection_callback_queue.clear();
        shared.stop.store(true, Ordering::Release);

        if let Some(handle) = thread_slot.take() {
            if handle.join().is_err() {
                error!(worker = %shared.name, "Event loop thread panicked");
            }
        }

        while shared.sockets_to_insert.pop().is_some() {}
        while shared.sockets_to_delete.pop().is_some() {}
        shared.sockets_to_dispatch.lock().take();
        shared.connection_timed_out_queue.lock().clear();
        shared.socket_count.store(0, Ordering::Release);
        shared.gc_candidate_count.store(0, Ordering::Release);

        // Dropping the last reference closes the multiplexer handle.
        shared.poller.write().take();
        info!(worker = %shared.name, socket_type = %self.socket_type, "Worker is stopped");
        Ok(())
    }

    pub fn add_to_epoll(&self, socket: &SharedSocket) -> bool {
        self.try_add_to_epoll(socket)
            .map_err(|err| self.shared.log_add_error(socket, &err))
            .is_ok()
    }

    /// Registers `socket`; it reaches the live map on the next merge.
    pub fn try_add_to_epoll(&self, socket: &SharedSocket) -> Result<()> {
        self.shared.add_to_epoll(socket)
    }

    pub fn delete_from_epoll(&self, socket: &SharedSocket) -> bool {
        self.try_delete_from_epoll(socket)
            .map_err(|err| self.shared.log_delete_error(socket, &err))
            .is_ok()
    }

    /// Unregisters `socket`; it leaves the live map on the next merge.
    ///
    /// A bad-descriptor failure is returned, but the deletion is still
    /// queued.
    pub fn try_delete_from_epoll(&self, socket: &SharedSocket) -> Result<()> {
        self.shared.delete_from_epoll(socket)
    }

    /// Asks the loop to call `dispatch_events` on its next pass. Returns
    /// `false` once the loop has stopped.
    pub fn enqueue_to_dispatch_later(&self, socket: &SharedSocket) -> bool {
        self.shared.enqueue_to_dispatch_later(socket)
    }

    /// Delivers a timeout error after `timeout` if the socket is still
    /// connecting by then.
    pub fn enqueue_to_check_connection_timeout(&self, socket: &SharedSocket, timeout: Duration) {
        self.shared.enqueue_to_check_connection_timeout(socket, timeout);
    }

    pub fn release_socket(&self, socket: Option<&SharedSocket>) -> bool {
        socket.is_some_and(|socket| socket.close())
    }

    pub fn summary(&self) -> WorkerSummary {
        let shared = &self.shared;
        WorkerSummary {
            native_handle: shared.native_handle(),
            socket_count: shared.socket_count.load(Ordering::Acquire),
            sockets_to_insert: shared.sockets_to_insert.len(),
            sockets_to_delete: shared.sockets_to_delete.len(),
            connection_timed_out: shared.connection_timed_out_queue.lock().len(),
            sockets_to_dispatch: shared
                .sockets_to_dispatch
                .lock()
                .as_ref()
                .map_or(0, VecDeque::len),
            gc_candidates: shared.gc_candidate_count.load(Ordering::Acquire),
        }
    }
}

impl fmt::Display for SocketPoolWorker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let summary = self.summary();
        write!(
            f,
            "<SocketPoolWorker: {} #{}, socket_map: {}, insert queue: {}, delete queue: {}, \
             connection queue: {}, dispatch queue: {}, gc candidates: {}>",
            self.socket_type,
            summary.native_handle,
            summary.socket_count,
            summary.sockets_to_insert,
            summary.sockets_to_delete,
            summary.connection_timed_out,
            summary.sockets_to_dispatch,
            summary.gc_candidates,
        )
    }
}

impl fmt::Debug for SocketPoolWorker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SocketPoolWorker")
            .field("name", &self.shared.name)
            .field("summary", &self.summary())
            .finish()
    }
}

impl Drop for SocketPoolWorker {
    fn drop(&mut self) {
        if self.is_initialized() {
            self.uninitialize();
        }
    }
}

/// Non-owning reference from a socket back to the worker that polls it.
///
/// Every call is a no-op returning `false` once the worker is gone.
/// Re-dispatch requests are also refused once its loop has stopped.
#[derive(Clone, Default)]
pub struct WorkerHandle {
    shared: Weak<WorkerShared>,
}

impl WorkerHandle {
    /// A handle attached to no worker.
    pub fn detached() -> Self {
        Self::default()
    }

    pub fn is_attached(&self) -> bool {
        self.shared.strong_count() > 0
    }

    pub fn socket_type(&self) -> Option<SocketType> {
        self.shared.upgrade().map(|shared| shared.socket_type)
    }

    pub fn add_to_epoll(&self, socket: &SharedSocket) -> bool {
        let Some(shared) = self.shared.upgrade() else {
            return false;
        };
        shared
            .add_to_epoll(socket)
            .map_err(|err| shared.log_add_error(socket, &err))
            .is_ok()
    }

    pub fn try_add_to_epoll(&self, socket: &SharedSocket) -> Result<()> {
        self.shared
            .upgrade()
            .ok_or(Error::NotInitialized)?
            .add_to_epoll(socket)
    }

    pub fn delete_from_epoll(&self, socket: &SharedSocket) -> bool {
        let Some(shared) = self.shared.upgrade() else {
            return false;
        };
        shared
            .delete_from_epoll(socket)
            .map_err(|err| shared.log_delete_error(socket, &err))
            .is_ok()
    }

    pub fn enqueue_to_dispatch_later(&self, socket: &SharedSocket) -> bool {
        self.shared
            .upgrade()
            .is_some_and(|shared| shared.enqueue_to_dispatch_later(socket))
    }

    pub fn enqueue_to_check_connection_timeout(&self, socket: &SharedSocket, timeout: Duration) -> bool {
        let Some(shared) = self.shared.upgrade() else {
            return false;
        };
        shared.enqueue_to_check_connection_timeout(socket, timeout);
        true
    }
}

impl fmt::Debug for WorkerHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.shared.upgrade() {
            Some(shared) => write!(f, "WorkerHandle({}#{})", shared.name, shared.native_handle()),
            None => f.write_str("WorkerHandle(detached)"),
        }
    }
}
