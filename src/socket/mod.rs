//! Non-blocking TCP/UDP socket driven by a [`SocketPoolWorker`](crate::worker::SocketPoolWorker).
//!
//! Outbound data is queued as commands and flushed from `dispatch_events`,
//! either inline from [`PoolSocket::send`] or by the worker once the kernel
//! reports the socket writable again. The application hears about
//! connection, data and close through a [`SocketObserver`].

mod command;

use std::collections::VecDeque;
use std::fmt;
use std::io::{self, ErrorKind};
use std::mem::MaybeUninit;
use std::net::{SocketAddr, TcpStream};
use std::os::fd::AsRawFd;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;
use socket2::{Domain, Protocol, SockAddr, Type};
use tracing::{debug, trace};

use crate::api::{SharedSocket, Socket};
use crate::config::SocketConfig;
use crate::errors::{Result, SocketError};
use crate::types::{BlockingMode, DispatchResult, RawHandle, SocketState, SocketType};
use crate::worker::WorkerHandle;

use command::{Command, CommandKind};

/// Application callbacks, invoked from the worker thread (or from the
/// thread calling [`PoolSocket::send`] / [`PoolSocket::close`]).
pub trait SocketObserver: Send + Sync {
    fn on_connected(&self, _socket: &Arc<PoolSocket>, _error: Option<&SocketError>) {}

    /// Edge-triggered: read until `WouldBlock`.
    fn on_data_available(&self, _socket: &Arc<PoolSocket>) {}

    /// Fired exactly once, after the native socket is gone.
    fn on_closed(&self, _socket: &Arc<PoolSocket>, _state: SocketState) {}
}

/// Observer that ignores everything.
pub struct NoopObserver;

impl SocketObserver for NoopObserver {}

struct Inner {
    socket: Option<socket2::Socket>,
    state: SocketState,
    commands: VecDeque<Command>,
    // Terminal state not yet reported to the observer.
    pending_close_notification: Option<SocketState>,
}

pub struct PoolSocket {
    this: Weak<PoolSocket>,
    handle: RawHandle,
    socket_type: SocketType,
    config: SocketConfig,
    worker: WorkerHandle,
    observer: Arc<dyn SocketObserver>,
    awaiting_first_event: AtomicBool,
    end_of_stream: AtomicBool,
    inner: Mutex<Inner>,
}

impl PoolSocket {
    /// Takes over an already connected stream, e.g. one returned by
    /// [`PoolSocket::accept`].
    pub fn from_stream(
        worker: &WorkerHandle,
        stream: TcpStream,
        config: SocketConfig,
        observer: Arc<dyn SocketObserver>,
    ) -> Result<Arc<Self>> {
        stream.set_nonblocking(true)?;
        let socket = socket2::Socket::from(stream);
        Self::register(worker, socket, SocketType::Tcp, SocketState::Connected, true, config, observer)
    }

    /// Starts a non-blocking connect. `on_connected` reports the outcome,
    /// or a timeout error once `timeout` elapses.
    pub fn connect(
        worker: &WorkerHandle,
        addr: SocketAddr,
        timeout: Option<Duration>,
        config: SocketConfig,
        observer: Arc<dyn SocketObserver>,
    ) -> Result<Arc<Self>> {
        let socket = socket2::Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))?;
        socket.set_nonblocking(true)?;

        match socket.connect(&addr.into()) {
            Ok(()) => {}
            Err(err) if err.raw_os_error() == Some(libc::EINPROGRESS) => {}
            Err(err) if err.kind() == ErrorKind::WouldBlock => {}
            Err(err) => return Err(err.into()),
        }

        // Even an immediate success is reported through the writable event.
        let pool_socket = Self::register(
            worker,
            socket,
            SocketType::Tcp,
            SocketState::Connecting,
            false,
            config,
            observer,
        )?;

        if let Some(timeout) = timeout {
            let shared: SharedSocket = pool_socket.clone();
            worker.enqueue_to_check_connection_timeout(&shared, timeout);
        }
        Ok(pool_socket)
    }

    pub fn listen(
        worker: &WorkerHandle,
        addr: SocketAddr,
        backlog: i32,
        config: SocketConfig,
        observer: Arc<dyn SocketObserver>,
    ) -> Result<Arc<Self>> {
        let socket = socket2::Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))?;
        socket.set_reuse_address(true)?;
        socket.set_nonblocking(true)?;
        socket.bind(&addr.into())?;
        socket.listen(backlog)?;
        Self::register(worker, socket, SocketType::Tcp, SocketState::Listening, false, config, observer)
    }

    /// A datagram socket is usable as soon as it is bound.
    pub fn bind_udp(
        worker: &WorkerHandle,
        addr: SocketAddr,
        config: SocketConfig,
        observer: Arc<dyn SocketObserver>,
    ) -> Result<Arc<Self>> {
        let socket = socket2::Socket::new(Domain::for_address(addr), Type::DGRAM, Some(Protocol::UDP))?;
        socket.set_nonblocking(true)?;
        socket.bind(&addr.into())?;
        Self::register(worker, socket, SocketType::Udp, SocketState::Connected, false, config, observer)
    }

    fn register(
        worker: &WorkerHandle,
        socket: socket2::Socket,
        socket_type: SocketType,
        state: SocketState,
        awaiting_first_event: bool,
        config: SocketConfig,
        observer: Arc<dyn SocketObserver>,
    ) -> Result<Arc<Self>> {
        let handle = socket.as_raw_fd();
        let pool_socket = Arc::new_cyclic(|this| PoolSocket {
            this: this.clone(),
            handle,
            socket_type,
            config,
            worker: worker.clone(),
            observer,
            awaiting_first_event: AtomicBool::new(awaiting_first_event),
            end_of_stream: AtomicBool::new(false),
            inner: Mutex::new(Inner {
                socket: Some(socket),
                state,
                commands: VecDeque::new(),
                pending_close_notification: None,
            }),
        });

        let shared: SharedSocket = pool_socket.clone();
        worker.try_add_to_epoll(&shared)?;
        debug!(handle, %socket_type, %state, "Socket is registered");
        Ok(pool_socket)
    }

    fn shared(&self) -> Option<SharedSocket> {
        self.this.upgrade().map(|this| this as SharedSocket)
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.with_socket(|socket| socket.local_addr())?
            .as_socket()
            .ok_or_else(|| io::Error::from(ErrorKind::AddrNotAvailable))
    }

    pub fn peer_addr(&self) -> io::Result<SocketAddr> {
        self.with_socket(|socket| socket.peer_addr())?
            .as_socket()
            .ok_or_else(|| io::Error::from(ErrorKind::AddrNotAvailable))
    }

    pub fn is_end_of_stream(&self) -> bool {
        self.end_of_stream.load(Ordering::Acquire)
    }

    /// Queues `data` and tries to send it right away.
    pub fn send(&self, data: &[u8]) -> bool {
        self.enqueue(Command::send(data.to_vec(), None))
    }

    pub fn send_to(&self, data: &[u8], peer: SocketAddr) -> bool {
        self.enqueue(Command::send(data.to_vec(), Some(peer.into())))
    }

    fn enqueue(&self, command: Command) -> bool {
        {
            let mut inner = self.inner.lock();
            let closing = inner.commands.back().is_some_and(Command::is_close);
            if inner.socket.is_none() || closing {
                return false;
            }
            inner.commands.push_back(command);
        }

        match self.dispatch_events() {
            DispatchResult::Dispatched => {}
            DispatchResult::PartialDispatched | DispatchResult::Error => {
                if let Some(shared) = self.shared() {
                    self.worker.enqueue_to_dispatch_later(&shared);
                }
            }
        }
        true
    }

    pub fn recv(&self, buf: &mut [u8]) -> io::Result<usize> {
        self.with_socket(|socket| socket.recv(as_uninit(buf)))
    }

    pub fn recv_from(&self, buf: &mut [u8]) -> io::Result<(usize, SocketAddr)> {
        let (len, peer) = self.with_socket(|socket| socket.recv_from(as_uninit(buf)))?;
        let peer = peer
            .as_socket()
            .ok_or_else(|| io::Error::from(ErrorKind::AddrNotAvailable))?;
        Ok((len, peer))
    }

    /// Accepts one pending connection; `WouldBlock` once the backlog is empty.
    pub fn accept(&self) -> io::Result<(TcpStream, SocketAddr)> {
        let (socket, peer) = self.with_socket(|socket| socket.accept())?;
        let peer = peer
            .as_socket()
            .ok_or_else(|| io::Error::from(ErrorKind::AddrNotAvailable))?;
        Ok((socket.into(), peer))
    }

    fn with_socket<T>(&self, f: impl FnOnce(&socket2::Socket) -> io::Result<T>) -> io::Result<T> {
        let inner = self.inner.lock();
        match inner.socket.as_ref() {
            Some(socket) => f(socket),
            None => Err(ErrorKind::NotConnected.into()),
        }
    }

    /// Releases the native socket. The observer is told on the next
    /// `dispatch_events`.
    fn close_locked(&self, inner: &mut Inner, state: SocketState) -> bool {
        let Some(socket) = inner.socket.take() else {
            return false;
        };

        inner.state = state;
        inner.commands.clear();
        inner.pending_close_notification = Some(state);

        // Unregister before the descriptor can be reused.
        if let Some(shared) = self.shared() {
            self.worker.delete_from_epoll(&shared);
        }
        drop(socket);
        debug!(handle = self.handle, %state, "Socket is closed");
        true
    }

    fn close_now(&self, state: SocketState) -> bool {
        let closed = self.close_locked(&mut self.inner.lock(), state);
        if closed {
            if let Some(shared) = self.shared() {
                if !self.worker.enqueue_to_dispatch_later(&shared) {
                    // No worker left to deliver the notification.
                    self.notify_closed();
                }
            }
        }
        closed
    }

    /// Writes queued commands until the kernel pushes back.
    fn flush(&self, inner: &mut Inner) -> DispatchResult {
        loop {
            let Some(command) = inner.commands.front_mut() else {
                return DispatchResult::Dispatched;
            };

            match &mut command.kind {
                CommandKind::Send { data, offset, peer } => {
                    let Some(socket) = inner.socket.as_ref() else {
                        inner.commands.clear();
                        return DispatchResult::Dispatched;
                    };

                    let sent = match peer {
                        Some(peer) => socket.send_to(&data[*offset..], peer),
                        None => socket.send(&data[*offset..]),
                    };

                    match sent {
                        Ok(len) => {
                            *offset += len;
                            if *offset >= data.len() || self.socket_type == SocketType::Udp {
                                inner.commands.pop_front();
                            }
                        }
                        Err(err) if err.kind() == ErrorKind::WouldBlock => {
                            trace!(handle = self.handle, pending = inner.commands.len(), "Send would block");
                            return DispatchResult::PartialDispatched;
                        }
                        Err(err) if err.kind() == ErrorKind::Interrupted => {}
                        Err(err) => {
                            debug!(handle = self.handle, %err, "Could not send data");
                            return DispatchResult::Error;
                        }
                    }
                }
                CommandKind::Close => {
                    inner.commands.pop_front();
                    self.close_locked(inner, SocketState::Closed);
                    return DispatchResult::Dispatched;
                }
            }
        }
    }

    fn notify_closed(&self) {
        let state = self.inner.lock().pending_close_notification.take();
        if let (Some(state), Some(this)) = (state, self.this.upgrade()) {
            self.observer.on_closed(&this, state);
        }
    }
}

fn as_uninit(buf: &mut [u8]) -> &mut [MaybeUninit<u8>] {
    // SAFETY: `MaybeUninit<u8>` has the layout of `u8`, and the kernel only
    // writes initialized bytes into the buffer.
    unsafe { &mut *(buf as *mut [u8] as *mut [MaybeUninit<u8>]) }
}

impl Socket for PoolSocket {
    fn native_handle(&self) -> RawHandle {
        self.handle
    }

    fn socket_type(&self) -> SocketType {
        self.socket_type
    }

    fn state(&self) -> SocketState {
        self.inner.lock().state
    }

    fn set_state(&self, state: SocketState) {
        self.inner.lock().state = state;
    }

    fn blocking_mode(&self) -> BlockingMode {
        self.config.blocking_mode
    }

    fn is_closable(&self) -> bool {
        self.inner.lock().socket.is_some()
    }

    fn need_to_wait_first_event(&self) -> bool {
        self.awaiting_first_event.load(Ordering::Acquire)
    }

    fn set_first_event_received(&self) {
        self.awaiting_first_event.store(false, Ordering::Release);
    }

    fn socket_error(&self) -> io::Result<i32> {
        match self.with_socket(|socket| socket.take_error())? {
            Some(err) => Ok(err.raw_os_error().unwrap_or(libc::EIO)),
            None => Ok(0),
        }
    }

    fn dispatch_events(&self) -> DispatchResult {
        let result = {
            let mut inner = self.inner.lock();
            self.flush(&mut inner)
        };
        self.notify_closed();
        result
    }

    fn on_connected_event(&self, error: Option<&SocketError>) {
        let Some(this) = self.this.upgrade() else {
            return;
        };

        match error {
            None => {
                {
                    let mut inner = self.inner.lock();
                    if inner.state == SocketState::Connecting {
                        inner.state = SocketState::Connected;
                    }
                }
                debug!(handle = self.handle, "Connected");
                self.observer.on_connected(&this, None);
            }
            Some(err) => {
                debug!(handle = self.handle, %err, "Could not connect");
                self.set_state(SocketState::Error);
                self.observer.on_connected(&this, Some(err));
                self.close_now(SocketState::Error);
            }
        }
    }

    fn on_data_available_event(&self) {
        if let Some(this) = self.this.upgrade() {
            self.observer.on_data_available(&this);
        }
    }

    fn has_command(&self) -> bool {
        !self.inner.lock().commands.is_empty()
    }

    fn has_expired_command(&self) -> bool {
        self.inner
            .lock()
            .commands
            .front()
            .is_some_and(|command| command.is_expired(self.config.command_expire_timeout))
    }

    /// Closes after everything already queued has been sent.
    fn close(&self) -> bool {
        {
            let mut inner = self.inner.lock();
            if inner.socket.is_none() || inner.commands.back().is_some_and(Command::is_close) {
                return false;
            }
            inner.commands.push_back(Command::close());
        }

        if self.dispatch_events() != DispatchResult::Dispatched {
            if let Some(shared) = self.shared() {
                self.worker.enqueue_to_dispatch_later(&shared);
            }
        }
        true
    }

    fn close_internal(&self) -> bool {
        self.close_now(SocketState::Closed)
    }

    fn close_with_state(&self, state: SocketState) -> bool {
        self.close_now(state)
    }

    fn set_end_of_stream(&self) {
        self.end_of_stream.store(true, Ordering::Release);
    }
}

impl fmt::Debug for PoolSocket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PoolSocket")
            .field("handle", &self.handle)
            .field("type", &self.socket_type)
            .field("state", &self.state())
            .field("worker", &self.worker)
            .finish()
    }
}
