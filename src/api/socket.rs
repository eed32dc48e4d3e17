//! Socket trait consumed by the worker.

use std::fmt::Debug;
use std::io;
use std::sync::Arc;

use crate::errors::SocketError;
use crate::types::{BlockingMode, DispatchResult, RawHandle, SocketState, SocketType};

/// A connection or endpoint driven by a [`SocketPoolWorker`](crate::worker::SocketPoolWorker).
///
/// The worker holds a shared reference while the socket is registered and
/// calls back into it from its event-loop thread only. Implementations must
/// not block inside any of these methods.
///
/// # Closing
///
/// `close` is graceful (pending data goes out first), `close_internal`
/// discards pending data, and `close_with_state` closes and records the
/// terminal state. Each of them returns `false` when the socket was not
/// closable. Closing unregisters the handle from the worker (before the
/// descriptor is released); the worker never unregisters a socket it has
/// closed. The final close notification is expected to be delivered from
/// the next [`dispatch_events`](Socket::dispatch_events) call, which the
/// worker schedules after closing a socket.
pub trait Socket: Send + Sync + Debug {
    fn native_handle(&self) -> RawHandle;

    fn socket_type(&self) -> SocketType;

    fn state(&self) -> SocketState;

    fn set_state(&self, state: SocketState);

    fn blocking_mode(&self) -> BlockingMode {
        BlockingMode::NonBlocking
    }

    /// `false` once the socket has been torn down; events for it are dropped.
    fn is_closable(&self) -> bool;

    /// Freshly registered sockets may receive one spurious writable event.
    fn need_to_wait_first_event(&self) -> bool {
        false
    }

    fn set_first_event_received(&self) {}

    /// Pending socket error (`SO_ERROR`), `0` when there is none.
    fn socket_error(&self) -> io::Result<i32>;

    /// Flushes as much of the pending-command queue as possible.
    fn dispatch_events(&self) -> DispatchResult;

    fn on_connected_event(&self, error: Option<&SocketError>);

    fn on_data_available_event(&self);

    fn has_command(&self) -> bool;

    /// The oldest pending command has been waiting longer than the send expiry.
    fn has_expired_command(&self) -> bool;

    fn close(&self) -> bool;

    fn close_internal(&self) -> bool;

    fn close_with_state(&self, state: SocketState) -> bool;

    fn set_end_of_stream(&self);
}

pub type SharedSocket = Arc<dyn Socket>;

/// Identity comparison of two shared sockets.
pub(crate) fn same_socket(a: &SharedSocket, b: &SharedSocket) -> bool {
    std::ptr::addr_eq(Arc::as_ptr(a), Arc::as_ptr(b))
}
