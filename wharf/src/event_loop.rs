//! A single-threaded event loop pinned to one OS thread.
//!
//! Each loop wraps a current-thread tokio runtime. The owning pool arms the
//! loop with a keep-alive [`Work`] token and runs it on a dedicated thread;
//! [`EventLoop::run`] returns only after every token for the cycle has been
//! dropped and the loop's ready queue has been drained. Tasks spawned while
//! the loop is between cycles are queued and polled on the next cycle, which
//! is what lets a graceful shutdown re-arm the loops until everything pending
//! has run to completion.

use futures::channel::mpsc::{self, UnboundedReceiver, UnboundedSender};
use futures::StreamExt;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tokio::runtime::{Builder, Runtime};

use crate::lock;

/// Keep-alive token for an event loop. The loop's `run` does not return while
/// any token from the current cycle is alive; dropping the last one lets the
/// loop drain and stop.
pub struct Work {
    _keep: UnboundedSender<()>,
}

/// A single-threaded event loop.
pub(crate) struct EventLoop {
    runtime: Runtime,
    /// Completed-task counter shared with every loop in the owning pool.
    executed: Arc<AtomicU64>,
    /// Receiver armed for the current run cycle.
    keepalive: Mutex<Option<UnboundedReceiver<()>>>,
}

impl EventLoop {
    /// Create a loop. Panics if the runtime cannot be built, which only
    /// happens when the process is out of basic OS resources.
    pub(crate) fn new(executed: Arc<AtomicU64>) -> Self {
        let runtime = Builder::new_current_thread()
            .enable_all()
            .build()
            .expect("failed to create event loop runtime");
        Self {
            runtime,
            executed,
            keepalive: Mutex::new(None),
        }
    }

    /// Arm the loop for one run cycle and return its keep-alive token.
    pub(crate) fn arm(&self) -> Work {
        let (tx, rx) = mpsc::unbounded();
        *lock(&self.keepalive) = Some(rx);
        Work { _keep: tx }
    }

    /// Drive the loop until all keep-alive tokens are dropped, then keep
    /// polling until no queued task makes progress, so that work scheduled by
    /// closing operations still runs before the thread exits.
    pub(crate) fn run(&self) {
        let Some(mut keepalive) = lock(&self.keepalive).take() else {
            return;
        };
        self.runtime
            .block_on(async move { while keepalive.next().await.is_some() {} });

        // Tokens are gone; drain ready tasks. Tasks blocked on I/O or timers
        // stay pending and are picked up by the next cycle, if any.
        loop {
            let before = self.executed.load(Ordering::Acquire);
            self.runtime.block_on(async {
                for _ in 0..16 {
                    tokio::task::yield_now().await;
                }
            });
            if self.executed.load(Ordering::Acquire) == before {
                break;
            }
        }
    }

    /// A cheap handle for spawning onto this loop from any thread.
    pub(crate) fn handle(&self) -> LoopHandle {
        LoopHandle {
            handle: self.runtime.handle().clone(),
            executed: self.executed.clone(),
        }
    }
}

/// Clonable handle to one event loop. Handlers are affinitized to a reactor
/// handle and a worker handle at bind time; the handle never owns the runtime,
/// so tasks holding one cannot keep a stopped loop alive.
#[derive(Clone)]
pub struct LoopHandle {
    handle: tokio::runtime::Handle,
    executed: Arc<AtomicU64>,
}

impl LoopHandle {
    /// Queue a task on the loop. The task starts on the loop's next poll; its
    /// completion is counted for the pool's idle tracking.
    pub fn spawn<F>(&self, future: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let executed = self.executed.clone();
        self.handle.spawn(async move {
            future.await;
            executed.fetch_add(1, Ordering::Release);
        });
    }
}

impl std::fmt::Debug for LoopHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LoopHandle").finish_non_exhaustive()
    }
}
