//! Pooled asynchronous TCP endpoints with split reactor and worker thread pools.
//!
//! `wharf` provides the scaffolding on which business logic is placed to obtain a
//! production-shaped multi-threaded TCP server or client: connections are accepted
//! (or dialed) at high rate, each connection's socket I/O is driven on a fixed pool
//! of reactor loops, and business callbacks run on a separate, elastic pool of
//! worker loops so that blocking or CPU-bound work cannot starve the reactors.
//!
//! The moving parts:
//!
//! - [`LoopPool`]: a pool of single-threaded event loops, each pinned to one OS
//!   thread and kept alive by [`Work`] tokens. The reactor flavor is fixed-size;
//!   the worker flavor grows under load up to a high watermark.
//! - [`PoolGroup`]: one reactor pool paired with one worker pool, with graceful
//!   (drain until idle) or forced shutdown ordering.
//! - [`ServiceHandler`]: the per-connection state machine. It owns the stream,
//!   the read/write [`IoBuffer`]s, and the session/I/O timers, and it posts the
//!   [`WorkHandler`] callbacks to the connection's worker loop.
//! - [`HandlerPool`]: a preallocated, watermark-managed pool of service handlers,
//!   recycled on close.
//! - [`Server`]: listens on one endpoint, keeps a queue of concurrent accepts
//!   bound to pooled handlers, and throttles (never drops) when the pool
//!   saturates.
//! - [`Connector`]: dials outbound connections, optionally paired to a parent
//!   handler so proxy-like pipelines can be expressed as an exchange of
//!   [`Event`]s between the two sides.
//! - [`sync`]: a small blocking facade for callers that want plain
//!   request/response calls bridged onto a reactor loop.
//!
//! # Example
//!
//! An echo server is a work handler that reads, writes what it read, and reads
//! again:
//!
//! ```no_run
//! use wharf::{GroupConfig, HandlerPool, HandlerPoolConfig, Server, ServerConfig,
//!     ServiceHandler, WorkAllocator, WorkHandler};
//! use prometheus_client::registry::Registry;
//! use std::sync::Arc;
//!
//! struct Echo;
//!
//! impl WorkHandler for Echo {
//!     fn on_open(&mut self, handler: &ServiceHandler<Self>) {
//!         handler.async_read_some();
//!     }
//!     fn on_read(&mut self, handler: &ServiceHandler<Self>, bytes: usize) {
//!         handler.async_write(bytes);
//!     }
//!     fn on_write(&mut self, handler: &ServiceHandler<Self>, _bytes: usize) {
//!         handler.async_read_some();
//!     }
//!     fn on_close(&mut self, _handler: &ServiceHandler<Self>, _error: Option<wharf::Error>) {}
//! }
//!
//! struct EchoAllocator;
//!
//! impl WorkAllocator for EchoAllocator {
//!     type Work = Echo;
//!     fn make_work(&self) -> Echo {
//!         Echo
//!     }
//! }
//!
//! let mut registry = Registry::default();
//! let pool = HandlerPool::new(EchoAllocator, HandlerPoolConfig::default(), &mut registry);
//! let server = Server::new(
//!     pool,
//!     "0.0.0.0:7".parse().unwrap(),
//!     GroupConfig::default(),
//!     ServerConfig::default(),
//!     &mut registry,
//! );
//! server.run().unwrap();
//! ```

pub mod buffer;
pub mod client;
pub mod event;
pub mod event_loop;
pub mod group;
pub mod handler;
pub mod handler_pool;
pub mod loop_pool;
pub mod server;
pub mod sync;

pub use buffer::IoBuffer;
pub use client::Connector;
pub use event::{Event, EventKind};
pub use event_loop::{LoopHandle, Work};
pub use group::{GroupConfig, PoolGroup};
pub use handler::{Link, Peer, ServiceHandler, WorkAllocator, WorkHandler};
pub use handler_pool::{HandlerPool, HandlerPoolConfig};
pub use loop_pool::LoopPool;
pub use server::{Server, ServerConfig};

use std::sync::{Arc, Mutex, MutexGuard};
use thiserror::Error as ThisError;

/// Terminal conditions observed by [`WorkHandler::on_close`] and surfaced by the
/// synchronous flavor.
///
/// An orderly local close is reported as `None`, not as a variant here.
#[derive(ThisError, Debug, Clone)]
pub enum Error {
    /// The peer shut down its half of the connection.
    #[error("end of stream")]
    Eof,
    /// The session timer or the per-operation I/O timer fired.
    #[error("timed out")]
    Timeout,
    /// An operation referenced more bytes than the buffer can hold.
    #[error("no buffer space")]
    NoBufferSpace,
    #[error("connection aborted")]
    ConnectionAborted,
    #[error("connection reset")]
    ConnectionReset,
    #[error("connection refused")]
    ConnectionRefused,
    /// A second synchronous call was made while one was already in flight.
    #[error("operation already started")]
    AlreadyStarted,
    /// The handler was closed before or during the operation.
    #[error("shut down")]
    ShutDown,
    #[error("bind failed")]
    BindFailed,
    /// Any other I/O error, reported verbatim.
    #[error("i/o error: {0}")]
    Io(Arc<std::io::Error>),
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        use std::io::ErrorKind;
        match err.kind() {
            ErrorKind::UnexpectedEof => Self::Eof,
            ErrorKind::TimedOut => Self::Timeout,
            ErrorKind::ConnectionAborted => Self::ConnectionAborted,
            ErrorKind::ConnectionReset | ErrorKind::BrokenPipe => Self::ConnectionReset,
            ErrorKind::ConnectionRefused => Self::ConnectionRefused,
            _ => Self::Io(Arc::new(err)),
        }
    }
}

impl PartialEq for Error {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Self::Io(a), Self::Io(b)) => a.kind() == b.kind(),
            _ => std::mem::discriminant(self) == std::mem::discriminant(other),
        }
    }
}

impl Eq for Error {}

/// Lock a mutex, recovering the guard if a business callback panicked while
/// holding it. The framework's own critical sections never panic, and a
/// poisoned work handler must still be able to reach `on_close`.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
}
