//! A reactor pool paired with a worker pool.
//!
//! Servers and connectors draw both of a handler's loops from one group: the
//! reactor pool owns socket I/O, the worker pool owns business callbacks.
//! Stopping a group is graceful by default: the pools are re-armed and
//! re-stopped until neither executes any further work, so handlers queued by
//! closing operations (final callbacks, pool releases) run to completion.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::lock;
use crate::loop_pool::LoopPool;

/// Sizing for a [`PoolGroup`]'s two pools.
#[derive(Clone, Debug)]
pub struct GroupConfig {
    /// Fixed reactor loop count.
    pub reactor_threads: usize,
    /// Worker loops created at start.
    pub worker_initial: usize,
    /// Hard cap on worker loops.
    pub worker_high: usize,
    /// Outstanding connections per worker loop before the pool grows.
    pub worker_load: usize,
    /// Cancel in-flight work on stop instead of draining it.
    pub force_stop: bool,
}

impl Default for GroupConfig {
    fn default() -> Self {
        Self {
            reactor_threads: 4,
            worker_initial: 4,
            worker_high: 32,
            worker_load: 100,
            force_stop: false,
        }
    }
}

/// One reactor pool plus one worker pool with a shared lifecycle.
pub struct PoolGroup {
    io_pool: Arc<LoopPool>,
    work_pool: Arc<LoopPool>,
    inner: Mutex<GroupState>,
}

struct GroupState {
    started: bool,
    force_stop: bool,
}

impl PoolGroup {
    pub fn new(cfg: GroupConfig) -> Arc<Self> {
        let io_pool = Arc::new(LoopPool::new(
            "wharf-io",
            cfg.reactor_threads,
            cfg.reactor_threads,
            1,
        ));
        let work_pool = Arc::new(LoopPool::new(
            "wharf-work",
            cfg.worker_initial,
            cfg.worker_high,
            cfg.worker_load,
        ));
        Arc::new(Self {
            io_pool,
            work_pool,
            inner: Mutex::new(GroupState {
                started: false,
                force_stop: cfg.force_stop,
            }),
        })
    }

    /// The pool that drives socket I/O.
    pub fn io_pool(&self) -> &Arc<LoopPool> {
        &self.io_pool
    }

    /// The pool that runs business callbacks.
    pub fn work_pool(&self) -> &Arc<LoopPool> {
        &self.work_pool
    }

    pub fn started(&self) -> bool {
        lock(&self.inner).started
    }

    /// Switch between graceful and forced stop. Only honored while stopped.
    pub fn set_force_stop(&self, force: bool) {
        let mut inner = lock(&self.inner);
        if !inner.started {
            inner.force_stop = force;
        }
    }

    /// Start both pools, non-blocking. A no-op when already started.
    pub fn start(&self) {
        {
            let mut inner = lock(&self.inner);
            if inner.started {
                return;
            }
            inner.started = true;
        }
        self.io_pool.start(false);
        self.work_pool.start(false);
    }

    /// Stop both pools. In graceful mode, keep re-arming and re-stopping the
    /// pools until neither reports progress, so that every queued closing
    /// handler has run.
    pub fn stop(&self) {
        let force = {
            let mut inner = lock(&self.inner);
            if !inner.started {
                return;
            }
            inner.started = false;
            inner.force_stop
        };

        self.io_pool.stop(force);
        self.work_pool.stop(force);

        while !force {
            if self.io_pool.is_idle() && self.work_pool.is_idle() {
                break;
            }
            self.io_pool.start(false);
            self.work_pool.start(false);
            // Give pending completions a moment to land before draining.
            std::thread::sleep(Duration::from_millis(1));
            self.io_pool.stop(false);
            self.work_pool.stop(false);
        }
    }
}

impl std::fmt::Debug for PoolGroup {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PoolGroup")
            .field("io_pool", &self.io_pool)
            .field("work_pool", &self.work_pool)
            .finish()
    }
}
