//! Blocking request/response flavor.
//!
//! [`SyncHandler`] bridges a reactor loop to synchronous callers: every
//! operation is posted to the loop and the calling thread parks on a condition
//! variable until the completion lands or the configured timeout expires. This
//! is the one place in the crate that uses a condvar; the async core never
//! blocks. One operation may be in flight per handler: a second concurrent
//! call observes [`Error::AlreadyStarted`], and any call after a close (or
//! before the first connect) observes [`Error::ShutDown`].

use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::time::Duration;
use tokio::net::{TcpSocket, TcpStream};

use crate::buffer::IoBuffer;
use crate::event_loop::LoopHandle;
use crate::loop_pool::LoopPool;
use crate::{lock, Error};

/// A peer address plus an optional local address to bind before connecting.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Endpoint {
    pub peer: SocketAddr,
    pub local: Option<SocketAddr>,
}

impl Endpoint {
    pub fn new(peer: SocketAddr) -> Self {
        Self { peer, local: None }
    }

    pub fn with_local(mut self, local: SocketAddr) -> Self {
        self.local = Some(local);
        self
    }
}

/// An ordered set of endpoints handed out round-robin.
pub struct EndpointGroup {
    endpoints: Vec<Endpoint>,
    next: AtomicUsize,
}

impl EndpointGroup {
    /// # Panics
    ///
    /// Panics when `endpoints` is empty.
    pub fn new(endpoints: Vec<Endpoint>) -> Self {
        assert!(!endpoints.is_empty(), "endpoint group must not be empty");
        Self {
            endpoints,
            next: AtomicUsize::new(0),
        }
    }

    pub fn len(&self) -> usize {
        self.endpoints.len()
    }

    pub fn is_empty(&self) -> bool {
        self.endpoints.is_empty()
    }

    /// The next endpoint, round-robin.
    pub fn next(&self) -> Endpoint {
        let index = self.next.fetch_add(1, Ordering::Relaxed) % self.endpoints.len();
        self.endpoints[index]
    }
}

/// Parameters for a [`SyncHandler`].
#[derive(Clone, Debug)]
pub struct SyncHandlerConfig {
    /// Capacity of the handler's single buffer.
    pub buffer_size: usize,
    /// Per-operation timeout. Must be nonzero: a synchronous caller with no
    /// timeout would park forever on a dead peer.
    pub timeout: Duration,
}

impl Default for SyncHandlerConfig {
    fn default() -> Self {
        Self {
            buffer_size: 256,
            timeout: Duration::from_secs(30),
        }
    }
}

enum Op {
    Connect { endpoint: Endpoint },
    ReadSome,
    ReadExact(usize),
    Write(usize),
    /// Write the staged bytes, clear the buffer, then read the response.
    WriteRead(usize),
}

struct OpState {
    stream: Option<TcpStream>,
    /// An operation is in flight and a caller is parked on the condvar.
    waiting: bool,
    opened: bool,
    /// Error observed by the last operation; starts as `ShutDown` so calls
    /// before the first connect fail cleanly.
    last_error: Option<Error>,
    bytes: usize,
    /// Pairs completions with the caller that posted them.
    seq: u64,
}

struct Shared {
    state: Mutex<OpState>,
    cond: Condvar,
    buffer: Mutex<IoBuffer>,
}

/// Blocking socket operations bridged onto a reactor loop.
pub struct SyncHandler {
    reactor: LoopHandle,
    endpoint: Endpoint,
    cfg: SyncHandlerConfig,
    shared: Arc<Shared>,
}

impl SyncHandler {
    /// # Panics
    ///
    /// Panics when the configured timeout is zero.
    pub fn new(reactor: LoopHandle, endpoint: Endpoint, cfg: SyncHandlerConfig) -> Self {
        assert!(!cfg.timeout.is_zero(), "sync handler timeout must be nonzero");
        let buffer_size = cfg.buffer_size;
        Self {
            reactor,
            endpoint,
            cfg,
            shared: Arc::new(Shared {
                state: Mutex::new(OpState {
                    stream: None,
                    waiting: false,
                    opened: false,
                    last_error: Some(Error::ShutDown),
                    bytes: 0,
                    seq: 0,
                }),
                cond: Condvar::new(),
                buffer: Mutex::new(IoBuffer::with_capacity(buffer_size)),
            }),
        }
    }

    /// The handler's buffer: reads land here, writes drain from here.
    pub fn buffer(&self) -> MutexGuard<'_, IoBuffer> {
        lock(&self.shared.buffer)
    }

    pub fn endpoint(&self) -> Endpoint {
        self.endpoint
    }

    /// The error observed by the last operation, or [`Error::AlreadyStarted`]
    /// while one is in flight. `None` means the last operation succeeded.
    pub fn error_code(&self) -> Option<Error> {
        let state = lock(&self.shared.state);
        if state.waiting {
            return Some(Error::AlreadyStarted);
        }
        state.last_error.clone()
    }

    /// Establish the connection. Already-open handlers return immediately
    /// unless `reconnect` forces a fresh socket.
    pub fn connect(&self, reconnect: bool) -> Result<(), Error> {
        {
            let state = lock(&self.shared.state);
            if state.waiting {
                return Err(Error::AlreadyStarted);
            }
            if state.opened && state.last_error.is_none() && !reconnect {
                return Ok(());
            }
        }
        self.run_op(Op::Connect {
            endpoint: self.endpoint,
        })
        .map(|_| ())
    }

    /// Read any number of bytes into the buffer's free tail.
    pub fn read_some(&self) -> Result<usize, Error> {
        if self.buffer().space() == 0 {
            return Err(Error::NoBufferSpace);
        }
        self.run_op(Op::ReadSome)
    }

    /// Read exactly `length` bytes into the buffer's free tail.
    pub fn read(&self, length: usize) -> Result<usize, Error> {
        if length == 0 || length > self.buffer().space() {
            return Err(Error::NoBufferSpace);
        }
        self.run_op(Op::ReadExact(length))
    }

    /// Write `length` bytes from the front of the buffer.
    pub fn write(&self, length: usize) -> Result<usize, Error> {
        if length == 0 || length > self.buffer().len() {
            return Err(Error::NoBufferSpace);
        }
        self.run_op(Op::Write(length))
    }

    /// Write the whole buffer, clear it, and read the response into it.
    /// Returns the bytes read.
    pub fn write_read(&self) -> Result<usize, Error> {
        let staged = self.buffer().len();
        if staged == 0 {
            return Err(Error::NoBufferSpace);
        }
        self.run_op(Op::WriteRead(staged))
    }

    /// Drop the connection. Later operations observe [`Error::ShutDown`]
    /// until the next connect.
    pub fn close(&self) {
        let mut state = lock(&self.shared.state);
        state.stream = None;
        state.opened = false;
        state.last_error = Some(Error::ShutDown);
    }

    fn run_op(&self, op: Op) -> Result<usize, Error> {
        let (seq, stream) = {
            let mut state = lock(&self.shared.state);
            if state.waiting {
                return Err(Error::AlreadyStarted);
            }
            if !state.opened && !matches!(op, Op::Connect { .. }) {
                return Err(state.last_error.clone().unwrap_or(Error::ShutDown));
            }
            state.waiting = true;
            state.seq += 1;
            (state.seq, state.stream.take())
        };

        let shared = self.shared.clone();
        let timeout = self.cfg.timeout;
        self.reactor
            .spawn(perform(shared, stream, op, seq, timeout));

        let state = lock(&self.shared.state);
        // The posted operation times itself out; the doubled bound here only
        // guards against a stopped loop never running it at all.
        let (mut state, _timed_out) = self
            .shared
            .cond
            .wait_timeout_while(state, timeout * 2, |state| {
                state.waiting && state.seq == seq
            })
            .unwrap_or_else(std::sync::PoisonError::into_inner);

        if state.waiting && state.seq == seq {
            // Nothing completed the operation; abandon the connection.
            state.waiting = false;
            state.opened = false;
            state.stream = None;
            state.last_error = Some(Error::Timeout);
            return Err(Error::Timeout);
        }

        match state.last_error.clone() {
            None => Ok(state.bytes),
            Some(error) => Err(error),
        }
    }
}

impl std::fmt::Debug for SyncHandler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncHandler")
            .field("endpoint", &self.endpoint)
            .finish()
    }
}

/// Run one operation on the reactor loop and wake the parked caller.
async fn perform(shared: Arc<Shared>, stream: Option<TcpStream>, op: Op, seq: u64, timeout: Duration) {
    let connecting = matches!(op, Op::Connect { .. });
    let outcome = tokio::time::timeout(timeout, execute(&shared, stream, op)).await;
    let (stream, result) = match outcome {
        Ok((stream, result)) => (stream, result),
        Err(_elapsed) => (None, Err(Error::Timeout)),
    };

    let mut state = lock(&shared.state);
    if !state.waiting || state.seq != seq {
        // The caller gave up; the connection is no longer trustworthy.
        state.opened = false;
        return;
    }
    state.waiting = false;
    match result {
        Ok(bytes) => {
            if connecting || state.opened {
                state.stream = stream;
                state.opened = state.stream.is_some();
                state.bytes = bytes;
                state.last_error = None;
            } else {
                // Closed while the operation was in flight.
                state.bytes = 0;
                state.last_error = Some(Error::ShutDown);
            }
        }
        Err(error) => {
            state.stream = None;
            state.opened = false;
            state.bytes = 0;
            state.last_error = Some(error);
        }
    }
    shared.cond.notify_one();
}

async fn execute(
    shared: &Shared,
    stream: Option<TcpStream>,
    op: Op,
) -> (Option<TcpStream>, Result<usize, Error>) {
    match op {
        Op::Connect { endpoint } => {
            // A reconnect drops the previous socket.
            drop(stream);
            let socket = match if endpoint.peer.is_ipv4() {
                TcpSocket::new_v4()
            } else {
                TcpSocket::new_v6()
            } {
                Ok(socket) => socket,
                Err(error) => return (None, Err(error.into())),
            };
            if let Some(local) = endpoint.local {
                if let Err(error) = socket.bind(local) {
                    return (None, Err(error.into()));
                }
            }
            match socket.connect(endpoint.peer).await {
                Ok(stream) => (Some(stream), Ok(0)),
                Err(error) => (None, Err(error.into())),
            }
        }
        Op::ReadSome => {
            let Some(stream) = stream else {
                return (None, Err(Error::ShutDown));
            };
            match read_some(&shared.buffer, &stream).await {
                Ok(bytes) => (Some(stream), Ok(bytes)),
                Err(error) => (None, Err(error)),
            }
        }
        Op::ReadExact(length) => {
            let Some(stream) = stream else {
                return (None, Err(Error::ShutDown));
            };
            match read_exact(&shared.buffer, &stream, length).await {
                Ok(bytes) => (Some(stream), Ok(bytes)),
                Err(error) => (None, Err(error)),
            }
        }
        Op::Write(length) => {
            let Some(stream) = stream else {
                return (None, Err(Error::ShutDown));
            };
            match write(&shared.buffer, &stream, length).await {
                Ok(bytes) => (Some(stream), Ok(bytes)),
                Err(error) => (None, Err(error)),
            }
        }
        Op::WriteRead(length) => {
            let Some(stream) = stream else {
                return (None, Err(Error::ShutDown));
            };
            if let Err(error) = write(&shared.buffer, &stream, length).await {
                return (None, Err(error));
            }
            // The request is out; the buffer now stages the response.
            lock(&shared.buffer).clear();
            match read_some(&shared.buffer, &stream).await {
                Ok(bytes) => (Some(stream), Ok(bytes)),
                Err(error) => (None, Err(error)),
            }
        }
    }
}

async fn read_some(buffer: &Mutex<IoBuffer>, stream: &TcpStream) -> Result<usize, Error> {
    loop {
        stream.readable().await?;
        let mut buffer = lock(buffer);
        if buffer.space() == 0 {
            return Err(Error::NoBufferSpace);
        }
        match stream.try_read(buffer.space_mut()) {
            Ok(0) => return Err(Error::Eof),
            Ok(read) => {
                buffer.produce(read);
                return Ok(read);
            }
            Err(error) if error.kind() == std::io::ErrorKind::WouldBlock => continue,
            Err(error) => return Err(error.into()),
        }
    }
}

async fn read_exact(
    buffer: &Mutex<IoBuffer>,
    stream: &TcpStream,
    length: usize,
) -> Result<usize, Error> {
    let mut got = 0;
    while got < length {
        stream.readable().await?;
        let mut buffer = lock(buffer);
        let want = length - got;
        if buffer.space() < want {
            return Err(Error::NoBufferSpace);
        }
        match stream.try_read(&mut buffer.space_mut()[..want]) {
            Ok(0) => return Err(Error::Eof),
            Ok(read) => {
                buffer.produce(read);
                got += read;
            }
            Err(error) if error.kind() == std::io::ErrorKind::WouldBlock => continue,
            Err(error) => return Err(error.into()),
        }
    }
    Ok(length)
}

async fn write(buffer: &Mutex<IoBuffer>, stream: &TcpStream, length: usize) -> Result<usize, Error> {
    let mut remaining = length;
    while remaining > 0 {
        stream.writable().await?;
        let mut buffer = lock(buffer);
        let chunk = remaining.min(buffer.len());
        if chunk == 0 {
            return Err(Error::NoBufferSpace);
        }
        match stream.try_write(&buffer.data()[..chunk]) {
            Ok(0) => return Err(Error::ConnectionReset),
            Ok(written) => {
                buffer.consume(written);
                remaining -= written;
            }
            Err(error) if error.kind() == std::io::ErrorKind::WouldBlock => continue,
            Err(error) => return Err(error.into()),
        }
    }
    Ok(length)
}

/// A small pool of [`SyncHandler`]s over an [`EndpointGroup`].
pub struct SyncClient {
    endpoints: EndpointGroup,
    loops: Arc<LoopPool>,
    cfg: SyncHandlerConfig,
    idle: Mutex<Vec<Arc<SyncHandler>>>,
}

impl SyncClient {
    /// The caller owns the loop pool's lifecycle; handlers are lazily created
    /// against its loops, round-robin over the endpoint group.
    pub fn new(endpoints: EndpointGroup, loops: Arc<LoopPool>, cfg: SyncHandlerConfig) -> Self {
        Self {
            endpoints,
            loops,
            cfg,
            idle: Mutex::new(Vec::new()),
        }
    }

    /// Check out a handler, creating one when none is idle.
    pub fn handler(&self) -> Arc<SyncHandler> {
        if let Some(handler) = lock(&self.idle).pop() {
            return handler;
        }
        Arc::new(SyncHandler::new(
            self.loops.get(),
            self.endpoints.next(),
            self.cfg.clone(),
        ))
    }

    /// Return a handler for reuse. The connection is kept open, so the next
    /// caller's connect is a no-op.
    pub fn recycle(&self, handler: Arc<SyncHandler>) {
        lock(&self.idle).push(handler);
    }
}
