use std::io;

use nix::errno::Errno;
use thiserror::Error;

use crate::types::SocketType;

#[derive(Error, Debug)]
pub enum Error {
    #[error("poller is already initialized")]
    AlreadyInitialized,
    #[error("poller is not initialized")]
    NotInitialized,
    #[error("{0} sockets are not supported by this worker")]
    Unsupported(SocketType),
    #[error("{0}")]
    Os(#[from] Errno),
    #[error("{0}")]
    Io(#[from] io::Error),
    #[error("SRT error {code}: {message}")]
    Srt { code: i32, message: String },
    #[error("could not spawn worker thread: {0}")]
    ThreadSpawn(io::Error),
}

impl Error {
    pub fn srt(code: i32, message: impl Into<String>) -> Self {
        Error::Srt {
            code,
            message: message.into(),
        }
    }

    /// The handle was already closed elsewhere.
    pub fn is_bad_descriptor(&self) -> bool {
        match self {
            Error::Os(errno) => *errno == Errno::EBADF,
            Error::Io(err) => err.raw_os_error() == Some(libc::EBADF),
            _ => false,
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;

/// Socket-level failure delivered to the connected callback.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{message} (code {code})")]
pub struct SocketError {
    code: i32,
    message: String,
}

impl SocketError {
    pub fn new(code: i32, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    /// Builds the error from a `SO_ERROR` value.
    pub fn from_os_code(code: i32) -> Self {
        Self::new(
            code,
            format!("Socket error occurred: {}", Errno::from_raw(code).desc()),
        )
    }

    pub fn timed_out(message: impl Into<String>) -> Self {
        Self::new(libc::ETIMEDOUT, message)
    }

    pub fn code(&self) -> i32 {
        self.code
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub fn is_timed_out(&self) -> bool {
        self.code == libc::ETIMEDOUT
    }
}
