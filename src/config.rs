//! Tunables for workers, pools and sockets.

use std::time::Duration;

use crate::types::{BlockingMode, SocketType};

const DEFAULT_WAIT_TIMEOUT: Duration = Duration::from_millis(100);
const DEFAULT_GC_INTERVAL: Duration = Duration::from_millis(1000);
const DEFAULT_MAX_EVENTS: usize = 1024;
const DEFAULT_DELAY_QUEUE_RESOLUTION: Duration = Duration::from_millis(10);
const DEFAULT_COMMAND_EXPIRE_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Clone, Debug)]
pub struct WorkerConfig {
    /// Upper bound of a single readiness wait; also bounds shutdown latency.
    pub wait_timeout: Duration,
    /// How often GC candidates are scanned.
    pub gc_interval: Duration,
    /// Size of the readiness-event buffer.
    pub max_events: usize,
    /// Longest sleep of the connection-timeout scheduler between checks.
    pub delay_queue_resolution: Duration,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            wait_timeout: DEFAULT_WAIT_TIMEOUT,
            gc_interval: DEFAULT_GC_INTERVAL,
            max_events: DEFAULT_MAX_EVENTS,
            delay_queue_resolution: DEFAULT_DELAY_QUEUE_RESOLUTION,
        }
    }
}

#[derive(Clone, Debug)]
pub struct PoolConfig {
    pub name: String,
    pub socket_type: SocketType,
    pub worker_count: usize,
    pub worker: WorkerConfig,
}

impl PoolConfig {
    pub fn new(name: impl Into<String>, socket_type: SocketType) -> Self {
        Self {
            name: name.into(),
            socket_type,
            worker_count: num_cpus::get(),
            worker: WorkerConfig::default(),
        }
    }
}

#[derive(Clone, Debug)]
pub struct SocketConfig {
    /// A queued command older than this marks the socket as stalled.
    pub command_expire_timeout: Duration,
    pub blocking_mode: BlockingMode,
}

impl Default for SocketConfig {
    fn default() -> Self {
        Self {
            command_expire_timeout: DEFAULT_COMMAND_EXPIRE_TIMEOUT,
            blocking_mode: BlockingMode::NonBlocking,
        }
    }
}
