//! Watermark-managed pool of service handlers.
//!
//! Handlers are preallocated so the accept hot path binds an existing handler
//! instead of allocating one. The pool grows by `increment` whenever a
//! checkout finds the idle list at or below the low watermark (and the hard
//! maximum allows it), and destroys returning handlers instead of storing them
//! once the idle list has reached the high watermark. When `maximum` handlers
//! are outstanding the pool reports saturation and the acceptor throttles.
//!
//! All pool state is serialized by one mutex, held briefly; binding and
//! unbinding happen outside of it.

use prometheus_client::metrics::counter::Counter;
use prometheus_client::metrics::gauge::Gauge;
use prometheus_client::registry::Registry;
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;
use tracing::debug;

use crate::event_loop::LoopHandle;
use crate::handler::{ReleasePool, ServiceHandler, WorkAllocator};
use crate::lock;

/// Sizing and per-connection parameters for a [`HandlerPool`].
#[derive(Clone, Debug)]
pub struct HandlerPoolConfig {
    /// Handlers preallocated by `init`.
    pub initial: usize,
    /// Grow when the idle list is at or below this size.
    pub low_watermark: usize,
    /// Destroy returning handlers once the idle list holds this many.
    pub high_watermark: usize,
    /// Handlers added per growth step.
    pub increment: usize,
    /// Hard cap on live handlers; reaching it saturates the pool.
    pub maximum: usize,
    /// Capacity of each handler's read buffer.
    pub read_buffer_size: usize,
    /// Capacity of each handler's write buffer; zero means writes drain the
    /// read buffer instead.
    pub write_buffer_size: usize,
    /// Whole-connection timeout; zero disables.
    pub session_timeout: Duration,
    /// Per-operation timeout; zero disables.
    pub io_timeout: Duration,
}

impl Default for HandlerPoolConfig {
    fn default() -> Self {
        Self {
            initial: 1000,
            low_watermark: 0,
            high_watermark: 5000,
            increment: 500,
            maximum: 50000,
            read_buffer_size: 256,
            write_buffer_size: 0,
            session_timeout: Duration::from_secs(30),
            io_timeout: Duration::ZERO,
        }
    }
}

impl HandlerPoolConfig {
    /// Validates the configuration, panicking on invalid values.
    fn validate(&self) {
        assert!(self.initial >= 1, "initial must be at least one");
        assert!(
            self.low_watermark <= self.initial,
            "low watermark above initial size"
        );
        assert!(
            self.high_watermark > self.low_watermark,
            "high watermark must exceed low watermark"
        );
        assert!(
            self.maximum >= self.high_watermark,
            "maximum below high watermark"
        );
        assert!(self.increment >= 1, "increment must be at least one");
    }
}

/// Metrics for the handler pool.
struct PoolMetrics {
    /// Handlers currently idle in the pool.
    idle: Gauge,
    /// Live handlers, idle plus outstanding.
    total: Gauge,
    /// Total handlers ever constructed.
    created_total: Counter,
    /// Handlers returned to the idle list on release.
    recycled_total: Counter,
    /// Handlers destroyed on release (pool closed or above high watermark).
    destroyed_total: Counter,
    /// Checkouts that found the pool saturated.
    saturated_total: Counter,
}

impl PoolMetrics {
    fn new(registry: &mut Registry) -> Self {
        let metrics = Self {
            idle: Gauge::default(),
            total: Gauge::default(),
            created_total: Counter::default(),
            recycled_total: Counter::default(),
            destroyed_total: Counter::default(),
            saturated_total: Counter::default(),
        };

        registry.register(
            "handler_pool_idle",
            "Handlers currently idle in the pool",
            metrics.idle.clone(),
        );
        registry.register(
            "handler_pool_total",
            "Live handlers, idle plus outstanding",
            metrics.total.clone(),
        );
        registry.register(
            "handler_pool_created_total",
            "Total handlers constructed",
            metrics.created_total.clone(),
        );
        registry.register(
            "handler_pool_recycled_total",
            "Handlers returned to the idle list",
            metrics.recycled_total.clone(),
        );
        registry.register(
            "handler_pool_destroyed_total",
            "Handlers destroyed on release",
            metrics.destroyed_total.clone(),
        );
        registry.register(
            "handler_pool_saturated_total",
            "Checkouts rejected because the pool was saturated",
            metrics.saturated_total.clone(),
        );

        metrics
    }
}

struct Inner<W: crate::WorkHandler> {
    idle: Vec<Arc<ServiceHandler<W>>>,
    /// Idle plus outstanding.
    total: usize,
    closed: bool,
}

/// A pool of reusable [`ServiceHandler`]s.
pub struct HandlerPool<A: WorkAllocator> {
    allocator: A,
    cfg: HandlerPoolConfig,
    inner: Mutex<Inner<A::Work>>,
    metrics: PoolMetrics,
}

impl<A: WorkAllocator> HandlerPool<A> {
    /// Create a pool. The pool starts closed; [`HandlerPool::init`] opens it
    /// and preallocates handlers.
    ///
    /// # Panics
    ///
    /// Panics if the configuration is invalid.
    pub fn new(allocator: A, cfg: HandlerPoolConfig, registry: &mut Registry) -> Arc<Self> {
        cfg.validate();
        let metrics = PoolMetrics::new(registry);
        Arc::new(Self {
            allocator,
            cfg,
            inner: Mutex::new(Inner {
                idle: Vec::new(),
                total: 0,
                closed: true,
            }),
            metrics,
        })
    }

    /// Open the pool and fill it to its initial size. A no-op when already
    /// open.
    pub fn init(self: &Arc<Self>) {
        let mut inner = lock(&self.inner);
        if !inner.closed {
            return;
        }
        inner.closed = false;
        let initial = self.cfg.initial;
        self.grow(&mut inner, initial);
    }

    /// Close the pool: destroy all idle handlers and make subsequent releases
    /// destroy instead of recycle.
    pub fn close(&self) {
        let mut inner = lock(&self.inner);
        if inner.closed {
            return;
        }
        inner.closed = true;
        let drained = inner.idle.len();
        inner.idle.clear();
        inner.total -= drained;
        self.metrics.idle.set(0);
        self.metrics.total.set(inner.total as i64);
        self.metrics.destroyed_total.inc_by(drained as u64);
    }

    /// Check out a handler bound to the given loops, or `None` when the pool
    /// is saturated (or closed).
    pub fn acquire(
        self: &Arc<Self>,
        reactor: LoopHandle,
        worker: LoopHandle,
    ) -> Option<Arc<ServiceHandler<A::Work>>> {
        let handler = {
            let mut inner = lock(&self.inner);
            if inner.closed {
                return None;
            }
            if inner.idle.len() <= self.cfg.low_watermark && inner.total < self.cfg.maximum {
                let step = self.cfg.increment.min(self.cfg.maximum - inner.total);
                debug!(step, total = inner.total, "growing handler pool");
                self.grow(&mut inner, step);
            }
            let handler = inner.idle.pop();
            if handler.is_none() {
                self.metrics.saturated_total.inc();
            } else {
                self.metrics.idle.set(inner.idle.len() as i64);
            }
            handler?
        };

        // Bind outside the pool mutex: it spawns the driver and runs the
        // work handler's on_bind.
        handler.bind(reactor, worker);
        Some(handler)
    }

    /// Handlers checked out and not yet released.
    pub fn outstanding(&self) -> usize {
        let inner = lock(&self.inner);
        inner.total - inner.idle.len()
    }

    /// Live handlers, idle plus outstanding.
    pub fn total(&self) -> usize {
        lock(&self.inner).total
    }

    /// Handlers currently idle in the pool.
    pub fn idle(&self) -> usize {
        lock(&self.inner).idle.len()
    }

    fn grow(self: &Arc<Self>, inner: &mut Inner<A::Work>, count: usize) {
        let self_dyn: Arc<dyn ReleasePool<A::Work>> = self.clone();
        let home: Weak<dyn ReleasePool<A::Work>> = Arc::downgrade(&self_dyn);
        for _ in 0..count {
            let work = self.allocator.make_work();
            let home = home.clone();
            let handler = Arc::new_cyclic(|self_ref| {
                ServiceHandler::new(
                    work,
                    self.cfg.read_buffer_size,
                    self.cfg.write_buffer_size,
                    self.cfg.session_timeout,
                    self.cfg.io_timeout,
                    home,
                    self_ref.clone(),
                )
            });
            inner.idle.push(handler);
            inner.total += 1;
        }
        self.metrics.created_total.inc_by(count as u64);
        self.metrics.idle.set(inner.idle.len() as i64);
        self.metrics.total.set(inner.total as i64);
    }
}

impl<A: WorkAllocator> ReleasePool<A::Work> for HandlerPool<A> {
    /// Return a handler after its close completed. Recycles onto the idle
    /// list unless the pool is closed or the idle list has reached the high
    /// watermark, in which case the handler is destroyed.
    fn release(&self, handler: Arc<ServiceHandler<A::Work>>) {
        handler.unbind();
        let mut inner = lock(&self.inner);
        if inner.closed || inner.idle.len() >= self.cfg.high_watermark {
            inner.total -= 1;
            self.metrics.total.set(inner.total as i64);
            self.metrics.destroyed_total.inc();
        } else {
            inner.idle.push(handler);
            self.metrics.idle.set(inner.idle.len() as i64);
            self.metrics.recycled_total.inc();
        }
    }
}

impl<A: WorkAllocator> std::fmt::Debug for HandlerPool<A> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = lock(&self.inner);
        f.debug_struct("HandlerPool")
            .field("idle", &inner.idle.len())
            .field("total", &inner.total)
            .field("closed", &inner.closed)
            .finish()
    }
}
