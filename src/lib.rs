//! Epoll-driven socket worker pool.
//!
//! A [`SocketPool`] owns one [`SocketPoolWorker`] per core, each running an
//! edge-triggered readiness loop for the sockets assigned to it. TCP and UDP
//! sockets are polled with the kernel's epoll; SRT sockets with the SRT
//! library's own epoll, supplied through [`poller::SrtApi`].

pub mod api;
pub mod config;
pub mod delay_queue;
pub mod errors;
pub mod poller;
pub mod pool;
pub mod socket;
pub mod types;
pub mod worker;

#[cfg(test)]
mod test_support;

pub use api::{SharedSocket, Socket};
pub use config::{PoolConfig, SocketConfig, WorkerConfig};
pub use errors::{Error, Result, SocketError};
pub use pool::SocketPool;
pub use socket::{NoopObserver, PoolSocket, SocketObserver};
pub use types::{BlockingMode, DispatchResult, RawHandle, SocketState, SocketType};
pub use worker::{SocketPoolWorker, WorkerHandle, WorkerSummary};
