//! The server surface: listeners, lifecycle, and registration.
//!
//! A [`Server`] owns its configuration, route registry, and error
//! handler chain. `start` opens a listening endpoint and serves
//! connections on the process-wide worker pool; `stop` closes the
//! listeners and resolves once in-flight exchanges drain; `stop_now`
//! additionally aborts them.

mod config;

pub use self::config::ServerConfig;

use std::fmt;
use std::future::Future;
use std::net::{Ipv4Addr, SocketAddr, TcpListener as StdTcpListener};
use std::pin::Pin;
use std::sync::{Arc, Mutex, RwLock};
use std::task::{Context, Poll};
use std::time::Duration;

use tokio::net::TcpListener;
use tracing::{debug, error, trace};

use crate::common::{drain, exec};
use crate::error::{Error, Result};
use crate::proto::h1::dispatch;
use crate::recover::ErrorHandler;
use crate::route::tree::Registry;
use crate::route::Route;

/// How long the accept loop backs off after a failed accept.
const ACCEPT_ERROR_BACKOFF: Duration = Duration::from_secs(1);

/// An HTTP/1.x server.
pub struct Server {
    shared: Arc<ServerShared>,
    state: Mutex<ListenState>,
}

/// What every connection task needs a handle to.
pub(crate) struct ServerShared {
    pub(crate) config: Arc<ServerConfig>,
    pub(crate) registry: Registry,
    handlers: RwLock<Arc<[Arc<dyn ErrorHandler>]>>,
}

struct ListenState {
    graceful: Option<(drain::Signal, drain::Watch)>,
    abort: Option<(drain::Signal, drain::Watch)>,
    addrs: Vec<SocketAddr>,
}

impl ServerShared {
    pub(crate) fn error_handlers(&self) -> Arc<[Arc<dyn ErrorHandler>]> {
        self.handlers.read().unwrap().clone()
    }
}

impl Server {
    /// Creates a server around `config`.
    pub fn new(config: Arc<ServerConfig>) -> Server {
        Server {
            shared: Arc::new(ServerShared {
                config,
                registry: Registry::new(),
                handlers: RwLock::new(Vec::new().into()),
            }),
            state: Mutex::new(ListenState {
                graceful: None,
                abort: None,
                addrs: Vec::new(),
            }),
        }
    }

    /// Registers a route, refusing shape collisions.
    pub fn add(&self, route: Route) -> Result<()> {
        self.shared.registry.insert(route)
    }

    /// Removes whatever route occupies `pattern`'s shape.
    pub fn remove(&self, pattern: &str) -> Result<Option<Route>> {
        self.shared.registry.remove_pattern(pattern)
    }

    /// Removes `route` if it is still the occupant of its shape.
    pub fn remove_route(&self, route: &Route) -> bool {
        self.shared.registry.remove(route)
    }

    /// Appends an error handler to the recovery chain.
    pub fn add_error_handler<H: ErrorHandler>(&self, handler: H) {
        let mut guard = self.shared.handlers.write().unwrap();
        let mut handlers: Vec<Arc<dyn ErrorHandler>> = guard.iter().cloned().collect();
        handlers.push(Arc::new(handler));
        *guard = handlers.into();
    }

    /// Opens a listening endpoint and starts serving it.
    ///
    /// `None` binds the loopback interface on an ephemeral port. The
    /// bound address is returned either way. The first `start` in the
    /// process creates the shared worker pool.
    pub fn start(&self, addr: Option<SocketAddr>) -> Result<SocketAddr> {
        let addr =
            addr.unwrap_or_else(|| SocketAddr::from((Ipv4Addr::LOCALHOST, 0)));
        let listener = StdTcpListener::bind(addr).map_err(Error::new_listen)?;
        listener.set_nonblocking(true).map_err(Error::new_listen)?;
        let local_addr = listener.local_addr().map_err(Error::new_listen)?;

        let workers = self
            .shared
            .config
            .worker_pool_size
            .unwrap_or_else(num_cpus::get);
        let pool = exec::pool(workers);

        let mut state = self.state.lock().unwrap();
        if state.graceful.is_none() {
            state.graceful = Some(drain::channel());
        }
        if state.abort.is_none() {
            state.abort = Some(drain::channel());
        }
        let watch = state.graceful.as_ref().expect("created above").1.clone();
        let abort_watch = state.abort.as_ref().expect("created above").1.clone();
        state.addrs.push(local_addr);
        drop(state);

        let shared = self.shared.clone();
        pool.spawn(accept_loop(listener, shared, watch, abort_watch));
        debug!("listening on {}", local_addr);
        Ok(local_addr)
    }

    /// The first bound address, once started.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.state.lock().unwrap().addrs.first().copied()
    }

    /// Closes the listeners and lets in-flight exchanges finish.
    ///
    /// The returned [`Shutdown`] resolves when the last connection is
    /// gone.
    pub fn stop(&self) -> Shutdown {
        let mut state = self.state.lock().unwrap();
        state.addrs.clear();
        match state.graceful.take() {
            Some((signal, watch)) => {
                drop(watch);
                Shutdown {
                    inner: Some(signal.drain()),
                }
            }
            None => Shutdown { inner: None },
        }
    }

    /// Closes the listeners and aborts in-flight exchanges.
    pub fn stop_now(&self) -> Shutdown {
        {
            let mut state = self.state.lock().unwrap();
            if let Some((signal, watch)) = state.abort.take() {
                drop(watch);
                // Connection tasks select against this; dropping the
                // drained side is enough to fire them all.
                drop(signal.drain());
            }
        }
        self.stop()
    }
}

impl fmt::Debug for Server {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Server")
            .field("addrs", &self.state.lock().unwrap().addrs)
            .finish()
    }
}

pin_project_lite::pin_project! {
    /// A future resolving when a stopped server has drained.
    #[must_use = "futures do nothing unless polled"]
    pub struct Shutdown {
        #[pin]
        inner: Option<drain::Draining>,
    }
}

impl Shutdown {
    /// Blocks the calling (non-worker) thread until drained.
    pub fn wait(self) {
        if let Some(pool) = exec::try_pool() {
            let (tx, rx) = std::sync::mpsc::channel();
            pool.spawn(async move {
                self.await;
                let _ = tx.send(());
            });
            let _ = rx.recv();
        }
    }
}

impl Future for Shutdown {
    type Output = ();

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        match self.project().inner.as_pin_mut() {
            Some(draining) => draining.poll(cx),
            None => Poll::Ready(()),
        }
    }
}

impl fmt::Debug for Shutdown {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Shutdown").finish()
    }
}

async fn accept_loop(
    listener: StdTcpListener,
    shared: Arc<ServerShared>,
    watch: drain::Watch,
    abort_watch: drain::Watch,
) {
    let listener = match TcpListener::from_std(listener) {
        Ok(listener) => listener,
        Err(e) => {
            error!("listener registration failed: {}", e);
            return;
        }
    };

    loop {
        tokio::select! {
            _ = watch.signaled() => {
                trace!("listener closing");
                return;
            }
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    trace!("accepted connection from {}", peer);
                    let shared = shared.clone();
                    let conn_watch = watch.clone();
                    let conn_abort = abort_watch.clone();
                    tokio::spawn(async move {
                        tokio::select! {
                            _ = dispatch::serve_connection(stream, shared, conn_watch) => {}
                            _ = conn_abort.signaled() => {
                                trace!("connection to {} aborted", peer);
                            }
                        }
                    });
                }
                Err(e) => {
                    error!("accept error: {}", e);
                    tokio::time::sleep(ACCEPT_ERROR_BACKOFF).await;
                }
            }
        }
    }
}
