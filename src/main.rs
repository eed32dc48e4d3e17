use std::io::ErrorKind;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::thread;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use sockpool::{
    PoolConfig, PoolSocket, Socket, SocketConfig, SocketObserver, SocketPool, SocketState,
    SocketType,
};
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;

/// TCP echo server running on a socket pool.
#[derive(Parser, Debug)]
#[clap(author, version, about, long_about = None)]
struct Args {
    /// Address to listen on.
    #[clap(short, long, default_value = "127.0.0.1:9000")]
    listen: SocketAddr,

    /// Number of workers (default: one per CPU).
    #[clap(short, long)]
    workers: Option<usize>,

    /// Upper bound of a single epoll wait, in milliseconds.
    #[clap(long, default_value_t = 100)]
    wait_timeout_ms: u64,

    /// Interval between stalled-socket scans, in milliseconds.
    #[clap(long, default_value_t = 1000)]
    gc_interval_ms: u64,

    /// A send queued longer than this closes the connection, in milliseconds.
    #[clap(long, default_value_t = 10_000)]
    expire_ms: u64,
}

#[derive(Default)]
struct Stats {
    accepted: AtomicU64,
    closed: AtomicU64,
    bytes: AtomicU64,
}

struct Echo {
    stats: Arc<Stats>,
}

impl SocketObserver for Echo {
    fn on_data_available(&self, socket: &Arc<PoolSocket>) {
        let mut buf = [0u8; 16 * 1024];
        loop {
            match socket.recv(&mut buf) {
                Ok(0) => break,
                Ok(len) => {
                    self.stats.bytes.fetch_add(len as u64, Ordering::Relaxed);
                    if !socket.send(&buf[..len]) {
                        break;
                    }
                }
                Err(err) if err.kind() == ErrorKind::WouldBlock => break,
                Err(err) => {
                    debug!(handle = socket.native_handle(), %err, "recv failed");
                    break;
                }
            }
        }
    }

    fn on_closed(&self, socket: &Arc<PoolSocket>, state: SocketState) {
        self.stats.closed.fetch_add(1, Ordering::Relaxed);
        debug!(handle = socket.native_handle(), %state, "Connection closed");
    }
}

struct Acceptor {
    pool: Arc<SocketPool>,
    config: SocketConfig,
    echo: Arc<Echo>,
    stats: Arc<Stats>,
}

impl SocketObserver for Acceptor {
    fn on_data_available(&self, listener: &Arc<PoolSocket>) {
        loop {
            let (stream, peer) = match listener.accept() {
                Ok(accepted) => accepted,
                Err(err) if err.kind() == ErrorKind::WouldBlock => break,
                Err(err) => {
                    warn!(%err, "accept failed");
                    break;
                }
            };

            let worker = match self.pool.alloc_worker() {
                Ok(worker) => worker,
                Err(err) => {
                    warn!(%peer, %err, "No worker for client");
                    continue;
                }
            };
            match PoolSocket::from_stream(&worker.handle(), stream, self.config.clone(), self.echo.clone()) {
                Ok(client) => {
                    self.stats.accepted.fetch_add(1, Ordering::Relaxed);
                    debug!(%peer, handle = client.native_handle(), "Client accepted");
                }
                Err(err) => warn!(%peer, %err, "Could not register client"),
            }
        }
    }
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let args = Args::parse();

    let mut config = PoolConfig::new("echo", SocketType::Tcp);
    if let Some(workers) = args.workers {
        config.worker_count = workers;
    }
    config.worker.wait_timeout = Duration::from_millis(args.wait_timeout_ms);
    config.worker.gc_interval = Duration::from_millis(args.gc_interval_ms);
    let socket_config = SocketConfig {
        command_expire_timeout: Duration::from_millis(args.expire_ms),
        ..SocketConfig::default()
    };

    info!(
        listen = %args.listen,
        workers = config.worker_count,
        wait_timeout_ms = args.wait_timeout_ms,
        gc_interval_ms = args.gc_interval_ms,
        expire_ms = args.expire_ms,
        "Starting echo server"
    );

    let pool = Arc::new(SocketPool::new(config));
    pool.try_initialize().context("could not start socket pool")?;

    // Setup a termination flag (triggered on Ctrl+C).
    let term = Arc::new(AtomicBool::new(false));
    {
        let term = term.clone();
        ctrlc::set_handler(move || {
            term.store(true, Ordering::SeqCst);
        })
        .context("could not set Ctrl-C handler")?;
    }

    let stats = Arc::new(Stats::default());
    let acceptor = Arc::new(Acceptor {
        pool: pool.clone(),
        config: socket_config.clone(),
        echo: Arc::new(Echo {
            stats: stats.clone(),
        }),
        stats: stats.clone(),
    });

    let worker = pool.alloc_worker()?;
    let listener = PoolSocket::listen(&worker.handle(), args.listen, 1024, socket_config, acceptor.clone())
        .with_context(|| format!("could not listen on {}", args.listen))?;

    let mut old_bytes = 0;
    while !term.load(Ordering::SeqCst) {
        thread::sleep(Duration::from_secs(1));
        let bytes = stats.bytes.load(Ordering::Relaxed);
        info!(
            accepted = stats.accepted.load(Ordering::Relaxed),
            closed = stats.closed.load(Ordering::Relaxed),
            bytes_per_sec = bytes.saturating_sub(old_bytes),
            "Echo stats"
        );
        for worker in pool.workers() {
            debug!("{worker}");
        }
        old_bytes = bytes;
    }

    info!("Shutting down");
    listener.close_internal();
    pool.try_uninitialize().context("could not stop socket pool")?;
    Ok(())
}
