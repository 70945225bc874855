//! Pools of single-threaded event loops.
//!
//! One pool instance serves either role: the reactor flavor is created with
//! `initial == high_watermark` and never grows, while the worker flavor grows
//! one loop at a time via [`LoopPool::get_with_load`] when the outstanding
//! load exceeds `loops × thread_load`, up to the high watermark. Loops are
//! handed out round-robin. All pool state sits behind one mutex, held briefly.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use tracing::debug;

use crate::event_loop::{EventLoop, LoopHandle, Work};
use crate::lock;

/// A pool of event loops, each running on its own named OS thread.
pub struct LoopPool {
    label: String,
    initial: usize,
    high_watermark: usize,
    thread_load: usize,
    /// Completed-task counter shared by every loop in the pool.
    executed: Arc<AtomicU64>,
    inner: Mutex<Inner>,
}

struct Inner {
    loops: Vec<Arc<EventLoop>>,
    threads: Vec<thread::JoinHandle<()>>,
    work: Vec<Work>,
    next: usize,
    started: bool,
    /// Executed-counter snapshot taken at the last start.
    snapshot: u64,
}

impl LoopPool {
    /// Create a pool with `initial` loops. `label` names the pool's threads.
    ///
    /// # Panics
    ///
    /// Panics unless `1 <= initial <= high_watermark` and `thread_load >= 1`.
    pub fn new(label: &str, initial: usize, high_watermark: usize, thread_load: usize) -> Self {
        assert!(initial >= 1, "pool must have at least one loop");
        assert!(
            high_watermark >= initial,
            "high watermark below initial size"
        );
        assert!(thread_load >= 1, "thread load must be at least one");

        let executed = Arc::new(AtomicU64::new(0));
        let loops = (0..initial)
            .map(|_| Arc::new(EventLoop::new(executed.clone())))
            .collect();
        Self {
            label: label.to_string(),
            initial,
            high_watermark,
            thread_load,
            executed,
            inner: Mutex::new(Inner {
                loops,
                threads: Vec::new(),
                work: Vec::new(),
                next: 0,
                started: false,
                snapshot: 0,
            }),
        }
    }

    /// Current loop count.
    pub fn size(&self) -> usize {
        lock(&self.inner).loops.len()
    }

    /// True iff no task has completed on any loop since the last start.
    pub fn is_idle(&self) -> bool {
        let snapshot = lock(&self.inner).snapshot;
        self.executed.load(Ordering::Acquire) == snapshot
    }

    /// Bring the pool up to its initial loop count and run every loop on its
    /// own thread. A no-op when already started. Blocking mode joins the
    /// threads before returning (another thread must call [`LoopPool::stop`]).
    pub fn start(&self, blocking: bool) {
        {
            let mut inner = lock(&self.inner);
            if inner.started {
                return;
            }

            // Top up or trim to the initial size; a force stop may have
            // dropped the loops entirely.
            while inner.loops.len() < self.initial {
                inner
                    .loops
                    .push(Arc::new(EventLoop::new(self.executed.clone())));
            }
            while inner.loops.len() > self.initial {
                inner.loops.pop();
            }

            inner.snapshot = self.executed.load(Ordering::Acquire);
            inner.started = true;
            for index in 0..inner.loops.len() {
                self.start_one(&mut inner, index);
            }
        }

        if blocking {
            self.join_threads();
        }
    }

    /// Run the pool in blocking mode.
    pub fn run(&self) {
        self.start(true);
    }

    /// Stop the pool. Graceful mode drops the keep-alive tokens and joins the
    /// threads, letting each loop drain its ready queue. Force mode
    /// additionally drops the loops themselves, cancelling tasks still pending
    /// on I/O or timers; the next start recreates them.
    pub fn stop(&self, force: bool) {
        {
            let mut inner = lock(&self.inner);
            if !inner.started {
                return;
            }
            inner.started = false;
            inner.work.clear();
        }

        self.join_threads();

        if force {
            lock(&self.inner).loops.clear();
        }
    }

    /// Next loop handle, round-robin.
    ///
    /// # Panics
    ///
    /// Panics if the pool was force-stopped and not restarted (no loops).
    pub fn get(&self) -> LoopHandle {
        let mut inner = lock(&self.inner);
        assert!(!inner.loops.is_empty(), "loop pool has no loops");
        if inner.next >= inner.loops.len() {
            inner.next = 0;
        }
        let handle = inner.loops[inner.next].handle();
        inner.next += 1;
        handle
    }

    /// Next loop handle, growing the pool first when `load` asks for more
    /// threads than are running and the high watermark allows it.
    pub fn get_with_load(&self, load: usize) -> LoopHandle {
        let wanted = load / self.thread_load;
        {
            let mut inner = lock(&self.inner);
            let current = inner.loops.len();
            if inner.started
                && !inner.work.is_empty()
                && wanted > current
                && current < self.high_watermark
            {
                debug!(
                    pool = %self.label,
                    loops = current + 1,
                    load,
                    "growing loop pool"
                );
                inner
                    .loops
                    .push(Arc::new(EventLoop::new(self.executed.clone())));
                let index = inner.loops.len() - 1;
                self.start_one(&mut inner, index);
                inner.next = index;
            }
        }
        self.get()
    }

    /// Arm one loop with a keep-alive token and spawn its thread.
    fn start_one(&self, inner: &mut Inner, index: usize) {
        let event_loop = inner.loops[index].clone();
        inner.work.push(event_loop.arm());
        let name = format!("{}-{}", self.label, index);
        let thread = thread::Builder::new()
            .name(name)
            .spawn(move || event_loop.run())
            .expect("failed to spawn event loop thread");
        inner.threads.push(thread);
    }

    fn join_threads(&self) {
        let threads = std::mem::take(&mut lock(&self.inner).threads);
        for thread in threads {
            let _ = thread.join();
        }
    }
}

impl std::fmt::Debug for LoopPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LoopPool")
            .field("label", &self.label)
            .field("initial", &self.initial)
            .field("high_watermark", &self.high_watermark)
            .field("thread_load", &self.thread_load)
            .finish()
    }
}
