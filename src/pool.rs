//! A set of workers of one transport kind.

use std::fmt;
use std::sync::Arc;

use tracing::{error, info};

use crate::api::SharedSocket;
use crate::config::PoolConfig;
use crate::errors::{Error, Result};
use crate::poller::SrtApi;
use crate::types::SocketType;
use crate::worker::SocketPoolWorker;

pub struct SocketPool {
    config: PoolConfig,
    workers: Vec<Arc<SocketPoolWorker>>,
}

impl SocketPool {
    pub fn new(config: PoolConfig) -> Self {
        Self::build(config, None)
    }

    /// A pool of SRT workers sharing one library binding.
    pub fn with_srt(mut config: PoolConfig, api: Arc<dyn SrtApi>) -> Self {
        config.socket_type = SocketType::Srt;
        Self::build(config, Some(api))
    }

    fn build(config: PoolConfig, srt_api: Option<Arc<dyn SrtApi>>) -> Self {
        let workers = (0..config.worker_count.max(1))
            .map(|_| {
                Arc::new(SocketPoolWorker::build(
                    config.name.clone(),
                    config.socket_type,
                    config.worker.clone(),
                    srt_api.clone(),
                ))
            })
            .collect();
        Self { config, workers }
    }

    pub fn name(&self) -> &str {
        &self.config.name
    }

    pub fn socket_type(&self) -> SocketType {
        self.config.socket_type
    }

    pub fn workers(&self) -> &[Arc<SocketPoolWorker>] {
        &self.workers
    }

    pub fn initialize(&self) -> bool {
        match self.try_initialize() {
            Ok(()) => true,
            Err(err) => {
                error!(pool = %self.config.name, %err, "Could not initialize socket pool");
                false
            }
        }
    }

    /// Starts every worker. Workers already started are stopped again if one
    /// of them fails.
    pub fn try_initialize(&self) -> Result<()> {
        for (index, worker) in self.workers.iter().enumerate() {
            if let Err(err) = worker.try_initialize() {
                for started in &self.workers[..index] {
                    started.uninitialize();
                }
                return Err(err);
            }
        }
        info!(
            pool = %self.config.name,
            socket_type = %self.config.socket_type,
            workers = self.workers.len(),
            "Socket pool is initialized"
        );
        Ok(())
    }

    pub fn uninitialize(&self) -> bool {
        match self.try_uninitialize() {
            Ok(()) => true,
            Err(err) => {
                error!(pool = %self.config.name, %err, "Could not uninitialize socket pool");
                false
            }
        }
    }

    /// Stops every worker; the first failure is returned after all of them
    /// have been tried.
    pub fn try_uninitialize(&self) -> Result<()> {
        let mut result = Ok(());
        for worker in &self.workers {
            if let Err(err) = worker.try_uninitialize() {
                if result.is_ok() {
                    result = Err(err);
                }
            }
        }
        result
    }

    /// The worker currently owning the fewest sockets.
    pub fn alloc_worker(&self) -> Result<Arc<SocketPoolWorker>> {
        self.workers
            .iter()
            .filter(|worker| worker.is_initialized())
            .min_by_key(|worker| worker.socket_count())
            .cloned()
            .ok_or(Error::NotInitialized)
    }

    /// Registers `socket` with the least loaded worker and returns it.
    pub fn add_to_epoll(&self, socket: &SharedSocket) -> Option<Arc<SocketPoolWorker>> {
        let worker = self.alloc_worker().ok()?;
        worker.add_to_epoll(socket).then_some(worker)
    }

    pub fn delete_from_epoll(&self, worker: &SocketPoolWorker, socket: &SharedSocket) -> bool {
        worker.delete_from_epoll(socket)
    }
}

impl fmt::Display for SocketPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "<SocketPool: {} ({}), {} workers>",
            self.config.name,
            self.config.socket_type,
            self.workers.len()
        )?;
        for worker in &self.workers {
            writeln!(f, "  {worker}")?;
        }
        Ok(())
    }
}

impl Drop for SocketPool {
    fn drop(&mut self) {
        for worker in &self.workers {
            if worker.is_initialized() {
                worker.uninitialize();
            }
        }
    }
}
