use std::fmt::Display;

/// Native handle of a socket or a poller.
///
/// Kernel sockets use their file descriptor, SRT sockets their `SRTSOCKET`
/// id; both are plain integers.
pub type RawHandle = i32;

pub const INVALID_HANDLE: RawHandle = -1;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum SocketType {
    Tcp,
    Udp,
    /// Reliable UDP (SRT), driven by its own user-space readiness API.
    Srt,
}

impl Display for SocketType {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            SocketType::Tcp => write!(f, "TCP"),
            SocketType::Udp => write!(f, "UDP"),
            SocketType::Srt => write!(f, "SRT"),
        }
    }
}

/// Lifecycle of a socket owned by a worker.
///
/// `Disconnected`, `Error` and `Closed` are terminal once the native handle
/// has been released.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SocketState {
    Created,
    Listening,
    Connecting,
    Connected,
    Disconnected,
    Error,
    Closed,
}

impl Display for SocketState {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        let name = match self {
            SocketState::Created => "Created",
            SocketState::Listening => "Listening",
            SocketState::Connecting => "Connecting",
            SocketState::Connected => "Connected",
            SocketState::Disconnected => "Disconnected",
            SocketState::Error => "Error",
            SocketState::Closed => "Closed",
        };
        write!(f, "{name}")
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum BlockingMode {
    /// Only the connect outcome is delivered by the worker.
    Blocking,
    #[default]
    NonBlocking,
}

/// Outcome of flushing a socket's pending-command queue.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DispatchResult {
    Dispatched,
    /// Backpressure: some commands are still queued.
    PartialDispatched,
    Error,
}
