//! The server: configuration, startup, and the reactor topology.
//!
//! A [`Server`] owns one or more listen sockets and a set of worker
//! reactors. Each listen address gets its own acceptor thread(s) (the
//! sockets share the address via `SO_REUSEPORT`); accepted connections
//! are spread round-robin across the workers, and each worker runs its
//! own epoll loop, timer wheel, and handler pool.

pub(crate) mod acceptor;
pub(crate) mod conn;
pub(crate) mod reactor;

use std::io;
use std::net::{SocketAddr, TcpListener};
use std::path::PathBuf;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use tracing::{error, info};

use crate::server::reactor::Reactor;

const DEFAULT_POOL_SIZE: usize = 4;
const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_secs(5);

/// Immutable runtime settings shared by every worker.
#[derive(Debug)]
pub(crate) struct Config {
    /// Canonical absolute document root; every served path must stay
    /// under this prefix after symlink resolution.
    pub(crate) root: Arc<PathBuf>,
    pub(crate) idle_timeout: Duration,
    pub(crate) pool_size: usize,
}

/// Configures a [`Server`] before it starts.
///
/// ```no_run
/// # fn main() -> hearth::Result<()> {
/// let server = hearth::Server::builder()
///     .root("./root")
///     .bind("0.0.0.0:12345".parse().unwrap())
///     .build()?;
/// server.run()
/// # }
/// ```
#[derive(Debug)]
pub struct Builder {
    root: PathBuf,
    binds: Vec<(SocketAddr, usize)>,
    worker_threads: Option<usize>,
    pool_size: usize,
    idle_timeout: Duration,
}

impl Builder {
    fn new() -> Builder {
        Builder {
            root: PathBuf::from("./root"),
            binds: Vec::new(),
            worker_threads: None,
            pool_size: DEFAULT_POOL_SIZE,
            idle_timeout: DEFAULT_IDLE_TIMEOUT,
        }
    }

    /// Set the document root directory.
    pub fn root<P: Into<PathBuf>>(mut self, root: P) -> Builder {
        self.root = root.into();
        self
    }

    /// Listen on `addr` with a single acceptor thread.
    pub fn bind(self, addr: SocketAddr) -> Builder {
        self.bind_with_acceptors(addr, 1)
    }

    /// Listen on `addr` with `acceptors` acceptor threads, each with its
    /// own `SO_REUSEPORT` listen socket.
    pub fn bind_with_acceptors(mut self, addr: SocketAddr, acceptors: usize) -> Builder {
        self.binds.push((addr, acceptors.max(1)));
        self
    }

    /// Number of worker reactor threads. Defaults to the number of CPUs.
    pub fn worker_threads(mut self, count: usize) -> Builder {
        self.worker_threads = Some(count.max(1));
        self
    }

    /// Size of each worker's handler thread pool. Zero runs handlers
    /// inline on the reactor thread.
    pub fn worker_pool_size(mut self, size: usize) -> Builder {
        self.pool_size = size;
        self
    }

    /// How long a connection may sit idle before it is closed.
    pub fn idle_timeout(mut self, timeout: Duration) -> Builder {
        self.idle_timeout = timeout;
        self
    }

    /// Validate the configuration and bind every listen socket.
    pub fn build(self) -> crate::Result<Server> {
        let root = std::fs::canonicalize(&self.root).map_err(crate::Error::new_root)?;
        let meta = std::fs::metadata(&root).map_err(crate::Error::new_root)?;
        if !meta.is_dir() {
            return Err(crate::Error::new_root(io::Error::new(
                io::ErrorKind::Other,
                format!("{} is not a directory", root.display()),
            )));
        }

        if self.binds.is_empty() {
            return Err(crate::Error::new_listen(io::Error::new(
                io::ErrorKind::Other,
                "no listen address configured",
            )));
        }

        let mut listeners = Vec::new();
        let mut addrs = Vec::new();
        for (addr, acceptors) in &self.binds {
            let first = acceptor::bind(*addr)?;
            // Port 0 resolves on the first bind; the rest of this
            // address's acceptors must share the resolved port.
            let resolved = first.local_addr().map_err(crate::Error::new_listen)?;
            listeners.push(first);
            for _ in 1..*acceptors {
                listeners.push(acceptor::bind(resolved)?);
            }
            addrs.push(resolved);
        }

        let worker_threads = self.worker_threads.unwrap_or_else(num_cpus::get).max(1);

        Ok(Server {
            config: Arc::new(Config {
                root: Arc::new(root),
                idle_timeout: self.idle_timeout,
                pool_size: self.pool_size,
            }),
            listeners,
            addrs,
            worker_threads,
        })
    }
}

/// A configured static-file server, ready to start.
#[derive(Debug)]
pub struct Server {
    config: Arc<Config>,
    listeners: Vec<TcpListener>,
    addrs: Vec<SocketAddr>,
    worker_threads: usize,
}

impl Server {
    /// Start configuring a server.
    pub fn builder() -> Builder {
        Builder::new()
    }

    /// Spawn the worker reactors and acceptor threads, then return.
    pub fn start(self) -> crate::Result<Handle> {
        info!(
            root = %self.config.root.display(),
            workers = self.worker_threads,
            pool = self.config.pool_size,
            "starting server"
        );

        let mut workers = Vec::with_capacity(self.worker_threads);
        for _ in 0..self.worker_threads {
            workers.push(Reactor::new(Arc::clone(&self.config)).map_err(crate::Error::new_io)?);
        }
        for (i, worker) in workers.iter().enumerate() {
            let worker = Arc::clone(worker);
            thread::Builder::new()
                .name(format!("hearth-worker-{}", i))
                .spawn(move || Reactor::run(&worker))
                .map_err(crate::Error::new_io)?;
        }

        let mut acceptors = Vec::with_capacity(self.listeners.len());
        for (i, listener) in self.listeners.into_iter().enumerate() {
            let addr = listener.local_addr().map_err(crate::Error::new_listen)?;
            let workers = workers.clone();
            let handle = thread::Builder::new()
                .name(format!("hearth-acceptor-{}", i))
                .spawn(move || {
                    info!(%addr, "acceptor listening");
                    if let Err(e) = acceptor::run(listener, workers) {
                        error!(%addr, error = %e, "acceptor exited");
                    }
                })
                .map_err(crate::Error::new_io)?;
            acceptors.push(handle);
        }

        Ok(Handle {
            addrs: self.addrs,
            acceptors,
            workers,
        })
    }

    /// Start and block until the acceptors exit (normally: forever).
    pub fn run(self) -> crate::Result<()> {
        self.start()?.join()
    }
}

/// A running server's addresses and threads.
pub struct Handle {
    addrs: Vec<SocketAddr>,
    acceptors: Vec<JoinHandle<()>>,
    workers: Vec<Arc<Reactor>>,
}

impl Handle {
    /// The first bound address (with any port 0 resolved).
    pub fn local_addr(&self) -> SocketAddr {
        self.addrs[0]
    }

    /// All bound addresses, one per `bind` call.
    pub fn local_addrs(&self) -> &[SocketAddr] {
        &self.addrs
    }

    /// Block on the acceptor threads.
    pub fn join(self) -> crate::Result<()> {
        for handle in self.acceptors {
            handle
                .join()
                .map_err(|_| crate::Error::new_accept(io::Error::new(
                    io::ErrorKind::Other,
                    "acceptor thread panicked",
                )))?;
        }
        drop(self.workers);
        Ok(())
    }
}

impl std::fmt::Debug for Handle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Handle").field("addrs", &self.addrs).finish()
    }
}
