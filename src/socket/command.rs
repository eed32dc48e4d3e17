use std::time::{Duration, Instant};

use socket2::SockAddr;

pub(super) enum CommandKind {
    Send {
        data: Vec<u8>,
        offset: usize,
        peer: Option<SockAddr>,
    },
    /// Graceful close, executed once everything queued before it is sent.
    Close,
}

pub(super) struct Command {
    pub(super) kind: CommandKind,
    enqueued_at: Instant,
}

impl Command {
    pub(super) fn send(data: Vec<u8>, peer: Option<SockAddr>) -> Self {
        Self {
            kind: CommandKind::Send {
                data,
                offset: 0,
                peer,
            },
            enqueued_at: Instant::now(),
        }
    }

    pub(super) fn close() -> Self {
        Self {
            kind: CommandKind::Close,
            enqueued_at: Instant::now(),
        }
    }

    pub(super) fn is_expired(&self, timeout: Duration) -> bool {
        self.enqueued_at.elapsed() > timeout
    }

    pub(super) fn is_close(&self) -> bool {
        matches!(self.kind, CommandKind::Close)
    }
}
