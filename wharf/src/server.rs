//! The accepting side of the framework.
//!
//! A [`Server`] listens on one TCP endpoint with `SO_REUSEADDR` and keeps
//! `accept_queue_length` accept slots in flight on a dedicated single-loop
//! accept pool. Each slot checks a handler out of the pool *before* awaiting
//! its accept, so an incoming connection binds to a preallocated handler with
//! no allocation on the hot path. When the pool is saturated a slot backs off
//! for `accept_delay` and retries; the listener is never dropped, so pending
//! connections wait in the backlog instead of being refused.

use prometheus_client::metrics::counter::Counter;
use prometheus_client::registry::Registry;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::net::{TcpListener, TcpSocket};
use tokio::sync::watch;
use tracing::{debug, warn};

use crate::group::{GroupConfig, PoolGroup};
use crate::handler::WorkAllocator;
use crate::handler_pool::HandlerPool;
use crate::loop_pool::LoopPool;
use crate::{lock, Error};

/// Listen backlog handed to the OS.
const LISTEN_BACKLOG: u32 = 1024;

/// Acceptor parameters.
#[derive(Clone, Debug)]
pub struct ServerConfig {
    /// Concurrent outstanding accepts.
    pub accept_queue_length: usize,
    /// Back-off before retrying a saturated handler pool.
    pub accept_delay: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            accept_queue_length: 250,
            accept_delay: Duration::from_secs(1),
        }
    }
}

/// Metrics for the acceptor.
struct ServerMetrics {
    /// Connections accepted and handed to a handler.
    accepted_total: Counter,
    /// Accept attempts delayed because the handler pool was saturated.
    throttled_total: Counter,
}

impl ServerMetrics {
    fn new(registry: &mut Registry) -> Self {
        let metrics = Self {
            accepted_total: Counter::default(),
            throttled_total: Counter::default(),
        };
        registry.register(
            "server_accepted_total",
            "Connections accepted and handed to a handler",
            metrics.accepted_total.clone(),
        );
        registry.register(
            "server_throttled_total",
            "Accept attempts delayed by handler pool saturation",
            metrics.throttled_total.clone(),
        );
        metrics
    }
}

struct ServerState {
    started: bool,
    blocking: bool,
    local_addr: Option<SocketAddr>,
    shutdown: Option<watch::Sender<bool>>,
}

/// A pooled TCP server.
pub struct Server<A: WorkAllocator> {
    pool: Arc<HandlerPool<A>>,
    group: Arc<PoolGroup>,
    owns_group: bool,
    accept_pool: Arc<LoopPool>,
    cfg: ServerConfig,
    addr: SocketAddr,
    metrics: Arc<ServerMetrics>,
    inner: Mutex<ServerState>,
}

impl<A: WorkAllocator> Server<A> {
    /// Build a server with its own internal [`PoolGroup`], sized by
    /// `group_cfg`. Opens the handler pool.
    pub fn new(
        pool: Arc<HandlerPool<A>>,
        addr: SocketAddr,
        group_cfg: GroupConfig,
        cfg: ServerConfig,
        registry: &mut Registry,
    ) -> Self {
        Self::build(pool, addr, PoolGroup::new(group_cfg), true, cfg, registry)
    }

    /// Build a server on an externally owned [`PoolGroup`]. The caller is
    /// responsible for starting and stopping the group; sharing one group
    /// between a server and a [`Connector`] keeps a proxy's inbound and
    /// outbound legs on the same loops.
    ///
    /// [`Connector`]: crate::Connector
    pub fn with_group(
        pool: Arc<HandlerPool<A>>,
        addr: SocketAddr,
        group: Arc<PoolGroup>,
        cfg: ServerConfig,
        registry: &mut Registry,
    ) -> Self {
        Self::build(pool, addr, group, false, cfg, registry)
    }

    fn build(
        pool: Arc<HandlerPool<A>>,
        addr: SocketAddr,
        group: Arc<PoolGroup>,
        owns_group: bool,
        cfg: ServerConfig,
        registry: &mut Registry,
    ) -> Self {
        assert!(
            cfg.accept_queue_length >= 1,
            "accept queue must hold at least one slot"
        );
        pool.init();
        Self {
            pool,
            group,
            owns_group,
            accept_pool: Arc::new(LoopPool::new("wharf-accept", 1, 1, 1)),
            cfg,
            addr,
            metrics: Arc::new(ServerMetrics::new(registry)),
            inner: Mutex::new(ServerState {
                started: false,
                blocking: false,
                local_addr: None,
                shutdown: None,
            }),
        }
    }

    /// Start accepting, non-blocking.
    pub fn start(&self) -> Result<(), Error> {
        self.start_with(false)
    }

    /// Start accepting and block until [`Server::stop`] is called from
    /// another thread.
    pub fn run(&self) -> Result<(), Error> {
        self.start_with(true)
    }

    /// The bound listen address, available once started. Useful when binding
    /// port zero.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        lock(&self.inner).local_addr
    }

    /// The group whose loops this server binds handlers to.
    pub fn group(&self) -> &Arc<PoolGroup> {
        &self.group
    }

    /// The handler pool backing this server.
    pub fn pool(&self) -> &Arc<HandlerPool<A>> {
        &self.pool
    }

    fn start_with(&self, blocking: bool) -> Result<(), Error> {
        {
            let mut state = lock(&self.inner);
            if state.started {
                return Ok(());
            }

            // Bind synchronously so the caller sees bind failures and the
            // resolved address; listening starts on the accept loop.
            let socket = match self.addr {
                SocketAddr::V4(_) => TcpSocket::new_v4(),
                SocketAddr::V6(_) => TcpSocket::new_v6(),
            }?;
            socket.set_reuseaddr(true)?;
            socket.bind(self.addr).map_err(|_| Error::BindFailed)?;
            let local_addr = socket.local_addr()?;
            debug!(addr = %local_addr, "server listening");

            let (shutdown_tx, shutdown_rx) = watch::channel(false);
            state.local_addr = Some(local_addr);
            state.shutdown = Some(shutdown_tx);
            state.started = true;
            state.blocking = blocking;

            if self.owns_group {
                self.group.start();
            }

            let accept_loop = self.accept_pool.get();
            let slots = self.cfg.accept_queue_length;
            let pool = self.pool.clone();
            let group = self.group.clone();
            let delay = self.cfg.accept_delay;
            let metrics = self.metrics.clone();
            let slot_loop = accept_loop.clone();
            let slot_shutdown = shutdown_rx.clone();
            accept_loop.spawn(async move {
                let listener = match socket.listen(LISTEN_BACKLOG) {
                    Ok(listener) => Arc::new(listener),
                    Err(error) => {
                        warn!(?error, "failed to listen");
                        return;
                    }
                };
                for _ in 0..slots {
                    slot_loop.spawn(accept_slot(
                        listener.clone(),
                        pool.clone(),
                        group.clone(),
                        delay,
                        slot_shutdown.clone(),
                        metrics.clone(),
                    ));
                }
            });
        }

        self.accept_pool.start(blocking);

        if blocking {
            // We only get here after stop() ended the accept pool.
            if self.owns_group {
                self.group.stop();
            }
            lock(&self.inner).started = false;
        }
        Ok(())
    }

    /// Stop accepting and, for an internally owned group, drain it. Active
    /// connections are not force-closed in graceful mode; the group's drain
    /// lets them finish.
    pub fn stop(&self) {
        let (blocking, shutdown) = {
            let mut state = lock(&self.inner);
            if !state.started {
                return;
            }
            state.started = false;
            (state.blocking, state.shutdown.take())
        };

        // Cancel the accept slots, then let the accept loop drain.
        if let Some(shutdown) = shutdown {
            let _ = shutdown.send(true);
        }
        self.accept_pool.stop(false);

        if !blocking && self.owns_group {
            self.group.stop();
        }
    }
}

impl<A: WorkAllocator> Drop for Server<A> {
    fn drop(&mut self) {
        self.stop();
        self.pool.close();
    }
}

/// One accept slot: bind a pooled handler, wait for a connection, hand it
/// over, repeat. Exits on shutdown or on a listener error.
async fn accept_slot<A: WorkAllocator>(
    listener: Arc<TcpListener>,
    pool: Arc<HandlerPool<A>>,
    group: Arc<PoolGroup>,
    delay: Duration,
    mut shutdown: watch::Receiver<bool>,
    metrics: Arc<ServerMetrics>,
) {
    loop {
        // Acquire before accepting; back off while the pool is saturated.
        let handler = loop {
            let reactor = group.io_pool().get();
            let worker = group.work_pool().get_with_load(pool.outstanding());
            match pool.acquire(reactor, worker) {
                Some(handler) => break handler,
                None => {
                    metrics.throttled_total.inc();
                    debug!("handler pool saturated, delaying accept");
                    tokio::select! {
                        _ = tokio::time::sleep(delay) => {}
                        _ = shutdown.changed() => return,
                    }
                }
            }
        };

        tokio::select! {
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    metrics.accepted_total.inc();
                    debug!(ip = ?peer.ip(), port = ?peer.port(), "accepted incoming connection");
                    // Re-register the stream on the handler's reactor loop;
                    // this loop stops with the server, the reactors do not.
                    match stream.into_std() {
                        Ok(stream) => handler.start(stream),
                        Err(error) => {
                            warn!(?error, "failed to detach accepted stream");
                            handler.close_with(Some(error.into()));
                        }
                    }
                }
                Err(error) => {
                    warn!(?error, "accept failed");
                    handler.close_with(Some(error.into()));
                    return;
                }
            },
            _ = shutdown.changed() => {
                handler.close();
                return;
            }
        }
    }
}
