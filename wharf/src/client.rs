//! The dialing side of the framework.
//!
//! A [`Connector`] draws handlers from its own pool and points them at one
//! peer address. The plain [`Connector::connect`] binds a handler to loops of
//! the caller's choosing; [`Connector::connect_with_parent`] builds the
//! outbound half of a proxy pair: the child handler shares the parent's
//! reactor and worker loops (no thread hop between the inbound read and the
//! outbound write) and both parent/child links are installed before the
//! connect is issued, so events posted during the handshake are legal.

use std::net::SocketAddr;
use std::sync::Arc;

use crate::event_loop::LoopHandle;
use crate::handler::{ServiceHandler, WorkAllocator, WorkHandler};
use crate::handler_pool::HandlerPool;

/// A pooled TCP client.
pub struct Connector<A: WorkAllocator> {
    pool: Arc<HandlerPool<A>>,
    peer: SocketAddr,
    local: Option<SocketAddr>,
}

impl<A: WorkAllocator> Connector<A> {
    /// Build a connector for one peer address. Opens the handler pool.
    pub fn new(pool: Arc<HandlerPool<A>>, peer: SocketAddr) -> Self {
        pool.init();
        Self {
            pool,
            peer,
            local: None,
        }
    }

    /// Bind outbound sockets to this local address before connecting.
    pub fn with_local(mut self, local: SocketAddr) -> Self {
        self.local = Some(local);
        self
    }

    /// The handler pool backing this connector.
    pub fn pool(&self) -> &Arc<HandlerPool<A>> {
        &self.pool
    }

    /// Dial the peer on the given loops. Returns `false` when the handler
    /// pool is saturated; saturation is back-pressure, not an error, so
    /// nothing reaches any work handler.
    pub fn connect(&self, reactor: LoopHandle, worker: LoopHandle) -> bool {
        let Some(handler) = self.pool.acquire(reactor, worker) else {
            return false;
        };
        handler.connect(self.peer, self.local);
        true
    }

    /// Dial the peer as the child of `parent`: the new handler shares the
    /// parent's loops and both sides' links (and `on_set_parent` /
    /// `on_set_child` hooks) are installed before the connect is issued.
    /// Returns `false` when the parent is unbound or the pool is saturated.
    pub fn connect_with_parent<P: WorkHandler>(&self, parent: &ServiceHandler<P>) -> bool {
        let (Some(reactor), Some(worker)) = (parent.reactor_loop(), parent.worker_loop()) else {
            return false;
        };
        let Some(child) = self.pool.acquire(reactor, worker) else {
            return false;
        };

        parent.set_child(child.link());
        child.set_parent(parent.link());
        child.connect(self.peer, self.local);
        true
    }
}

impl<A: WorkAllocator> std::fmt::Debug for Connector<A> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connector")
            .field("peer", &self.peer)
            .field("local", &self.local)
            .finish()
    }
}
