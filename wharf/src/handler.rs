//! The per-connection state machine.
//!
//! A [`ServiceHandler`] is bound to one reactor loop and one worker loop when
//! it leaves the pool and does not migrate. All socket work happens in a
//! single driver task on the reactor loop; business callbacks are posted to
//! the worker loop, serialized per handler. The public methods are callable
//! from any thread: they validate against the buffers, then hand the operation
//! to the driver through its command mailbox.
//!
//! Two timers guard a connection. The session timer spans the whole bind
//! cycle; the I/O timer is re-armed before each asynchronous operation and
//! cancelled on its completion. Either firing closes the handler with
//! [`Error::Timeout`]. A timeout of zero disables the corresponding timer
//! entirely.
//!
//! Paired handlers (proxy pipelines) hold non-owning [`Link`]s to each other.
//! Events posted through a link are delivered on the receiving side's worker
//! loop; once either side closes, the links are cleared and further posts are
//! silently dropped.

use futures::channel::mpsc::{self, UnboundedReceiver, UnboundedSender};
use futures::StreamExt;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpSocket, TcpStream};
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::buffer::IoBuffer;
use crate::event::{Event, EventKind};
use crate::event_loop::LoopHandle;
use crate::{lock, Error};

/// Business callbacks for one connection.
///
/// Exactly one `on_open` and one `on_close` are delivered per bind cycle;
/// every `on_read`/`on_write`/event callback falls strictly between them, and
/// nothing runs after `on_close` returns. All callbacks except `on_bind` run
/// on the handler's worker loop.
pub trait WorkHandler: Send + Sized + 'static {
    /// Called synchronously while the handler is checked out of the pool.
    /// Reset per-connection state here and return quickly.
    fn on_bind(&mut self, _handler: &ServiceHandler<Self>) {}

    /// First callback after an accept or a successful connect.
    fn on_open(&mut self, handler: &ServiceHandler<Self>);

    /// `bytes` new bytes were appended to the read buffer (produce already
    /// applied).
    fn on_read(&mut self, _handler: &ServiceHandler<Self>, _bytes: usize) {}

    /// `bytes` were drained from the write source (consume already applied).
    fn on_write(&mut self, _handler: &ServiceHandler<Self>, _bytes: usize) {}

    /// Terminal callback. `None` is an orderly close; [`Error::Eof`] is an
    /// orderly close by the peer.
    fn on_close(&mut self, handler: &ServiceHandler<Self>, error: Option<Error>);

    /// An event arrived from the parent side of a pair.
    fn on_parent_event(&mut self, _handler: &ServiceHandler<Self>, _event: Event) {}

    /// An event arrived from the child side of a pair.
    fn on_child_event(&mut self, _handler: &ServiceHandler<Self>, _event: Event) {}

    /// A parent link was installed on this handler.
    fn on_set_parent(&mut self, _handler: &ServiceHandler<Self>, _parent: Link) {}

    /// A child link was installed on this handler.
    fn on_set_child(&mut self, _handler: &ServiceHandler<Self>, _child: Link) {}
}

/// Factory for per-connection work handlers, supplied to the handler pool.
pub trait WorkAllocator: Send + Sync + 'static {
    type Work: WorkHandler;

    fn make_work(&self) -> Self::Work;
}

/// The capability surface one side of a pair exposes to the other.
pub(crate) trait PeerHandler: Send + Sync {
    fn peer_read_buffer(&self) -> MutexGuard<'_, IoBuffer>;
    fn peer_write_buffer(&self) -> MutexGuard<'_, IoBuffer>;
    /// Run `on_parent_event` on this handler's worker loop.
    fn deliver_parent_event(&self, event: Event);
    /// Run `on_child_event` on this handler's worker loop.
    fn deliver_child_event(&self, event: Event);
    fn drop_parent_link(&self);
    fn drop_child_link(&self);
    fn request_close(&self, error: Option<Error>);
}

/// Non-owning handle to a paired handler. Cheap to clone; never keeps the
/// peer alive. Dereference with [`Link::peer`], which fails once the peer has
/// been recycled.
#[derive(Clone)]
pub struct Link {
    pub(crate) peer: Weak<dyn PeerHandler>,
}

impl Link {
    /// Upgrade to the peer, if it is still live.
    pub fn peer(&self) -> Option<Peer> {
        self.peer.upgrade().map(|inner| Peer { inner })
    }

    pub fn is_alive(&self) -> bool {
        self.peer.strong_count() > 0
    }
}

impl std::fmt::Debug for Link {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Link")
            .field("alive", &self.is_alive())
            .finish()
    }
}

/// An upgraded [`Link`]: direct access to the peer's buffers for staging
/// proxy payloads, plus a close request.
pub struct Peer {
    inner: Arc<dyn PeerHandler>,
}

impl Peer {
    pub fn read_buffer(&self) -> MutexGuard<'_, IoBuffer> {
        self.inner.peer_read_buffer()
    }

    pub fn write_buffer(&self) -> MutexGuard<'_, IoBuffer> {
        self.inner.peer_write_buffer()
    }

    pub fn close(&self) {
        self.inner.request_close(None);
    }

    pub fn close_with(&self, error: Option<Error>) {
        self.inner.request_close(error);
    }
}

/// Operations executed by the reactor driver.
enum Command {
    /// Adopt an accepted stream and start running.
    Start(std::net::TcpStream),
    /// Dial the peer, optionally binding a local address first.
    Connect {
        peer: SocketAddr,
        local: Option<SocketAddr>,
    },
    ReadSome,
    ReadExact(usize),
    Write {
        length: usize,
        from_write_buffer: bool,
    },
    Close(Option<Error>),
}

/// Everything installed at bind time and torn down at unbind.
struct BoundState {
    reactor: Option<LoopHandle>,
    worker: Option<LoopHandle>,
    commands: Option<UnboundedSender<Command>>,
    parent: Option<Link>,
    child: Option<Link>,
    peer_addr: Option<SocketAddr>,
}

/// Hook back into the pool a handler was drawn from.
pub(crate) trait ReleasePool<W: WorkHandler>: Send + Sync {
    fn release(&self, handler: Arc<ServiceHandler<W>>);
}

/// Per-connection state machine. Created by a [`HandlerPool`], bound to a
/// reactor loop and a worker loop at checkout, recycled on close.
///
/// [`HandlerPool`]: crate::HandlerPool
pub struct ServiceHandler<W: WorkHandler> {
    work: Mutex<W>,
    read_buffer: Mutex<IoBuffer>,
    write_buffer: Mutex<IoBuffer>,
    session_timeout: Duration,
    io_timeout: Duration,
    /// Set at close initiation; makes every later `async_*` a silent no-op.
    stopped: AtomicBool,
    /// Bumped on every bind. Posted callbacks carry the epoch they were
    /// scheduled in and refuse to run in a later cycle.
    epoch: AtomicU64,
    state: Mutex<BoundState>,
    self_ref: Weak<ServiceHandler<W>>,
    home: Weak<dyn ReleasePool<W>>,
}

impl<W: WorkHandler> ServiceHandler<W> {
    pub(crate) fn new(
        work: W,
        read_buffer_size: usize,
        write_buffer_size: usize,
        session_timeout: Duration,
        io_timeout: Duration,
        home: Weak<dyn ReleasePool<W>>,
        self_ref: Weak<ServiceHandler<W>>,
    ) -> Self {
        Self {
            work: Mutex::new(work),
            read_buffer: Mutex::new(IoBuffer::with_capacity(read_buffer_size)),
            write_buffer: Mutex::new(IoBuffer::with_capacity(write_buffer_size)),
            session_timeout,
            io_timeout,
            stopped: AtomicBool::new(true),
            epoch: AtomicU64::new(0),
            state: Mutex::new(BoundState {
                reactor: None,
                worker: None,
                commands: None,
                parent: None,
                child: None,
                peer_addr: None,
            }),
            self_ref,
            home,
        }
    }

    /// The buffer incoming data lands in.
    pub fn read_buffer(&self) -> MutexGuard<'_, IoBuffer> {
        lock(&self.read_buffer)
    }

    /// The staging buffer for outgoing data. Zero capacity when the pool was
    /// configured without one; writes then drain the read buffer instead.
    pub fn write_buffer(&self) -> MutexGuard<'_, IoBuffer> {
        lock(&self.write_buffer)
    }

    /// The reactor loop this handler is bound to, if bound.
    pub fn reactor_loop(&self) -> Option<LoopHandle> {
        lock(&self.state).reactor.clone()
    }

    /// The worker loop this handler is bound to, if bound.
    pub fn worker_loop(&self) -> Option<LoopHandle> {
        lock(&self.state).worker.clone()
    }

    /// Remote address of the current connection, once established.
    pub fn peer_addr(&self) -> Option<SocketAddr> {
        lock(&self.state).peer_addr
    }

    /// A non-owning handle to this handler, suitable for pairing.
    pub fn link(&self) -> Link {
        Link {
            peer: self.self_ref.clone(),
        }
    }

    /// Read any number of bytes into the read buffer's free tail. Requesting
    /// a read with no free space closes the handler with
    /// [`Error::NoBufferSpace`].
    pub fn async_read_some(&self) {
        if lock(&self.read_buffer).space() == 0 {
            self.close_with(Some(Error::NoBufferSpace));
            return;
        }
        self.send(Command::ReadSome);
    }

    /// Read exactly `length` bytes into the read buffer's free tail. A zero
    /// or oversized length closes the handler with [`Error::NoBufferSpace`].
    pub fn async_read(&self, length: usize) {
        if length == 0 || length > lock(&self.read_buffer).space() {
            self.close_with(Some(Error::NoBufferSpace));
            return;
        }
        self.send(Command::ReadExact(length));
    }

    /// Write `length` bytes from the front of the write source: the write
    /// buffer when one is configured, the read buffer's committed region
    /// otherwise. The source is consumed as bytes drain to the socket; the
    /// completion callback sees the consume already applied.
    pub fn async_write(&self, length: usize) {
        let from_write_buffer = lock(&self.write_buffer).capacity() > 0;
        let available = if from_write_buffer {
            lock(&self.write_buffer).len()
        } else {
            lock(&self.read_buffer).len()
        };
        if length == 0 || length > available {
            self.close_with(Some(Error::NoBufferSpace));
            return;
        }
        self.send(Command::Write {
            length,
            from_write_buffer,
        });
    }

    /// Write the write source's whole committed region.
    pub fn async_write_all(&self) {
        let from_write_buffer = lock(&self.write_buffer).capacity() > 0;
        let available = if from_write_buffer {
            lock(&self.write_buffer).len()
        } else {
            lock(&self.read_buffer).len()
        };
        if available == 0 {
            self.close_with(Some(Error::NoBufferSpace));
            return;
        }
        self.send(Command::Write {
            length: available,
            from_write_buffer,
        });
    }

    /// Initiate an orderly close. Idempotent; callable from any thread.
    pub fn close(&self) {
        self.close_with(None);
    }

    /// Initiate a close that reports `error` to `on_close`.
    pub fn close_with(&self, error: Option<Error>) {
        if self.stopped.load(Ordering::Acquire) {
            return;
        }
        if let Some(commands) = lock(&self.state).commands.clone() {
            let _ = commands.unbounded_send(Command::Close(error));
        }
    }

    /// Post an event to the parent side of the pair. The parent observes it
    /// as `on_child_event` on its own worker loop. A no-op when no parent
    /// link is installed or the parent is gone.
    pub fn post_parent(&self, event: Event) {
        let link = lock(&self.state).parent.clone();
        if let Some(peer) = link.and_then(|link| link.peer.upgrade()) {
            peer.deliver_child_event(event);
        }
    }

    /// Post an event to the child side of the pair. The child observes it as
    /// `on_parent_event` on its own worker loop. A no-op when no child link
    /// is installed or the child is gone.
    pub fn post_child(&self, event: Event) {
        let link = lock(&self.state).child.clone();
        if let Some(peer) = link.and_then(|link| link.peer.upgrade()) {
            peer.deliver_parent_event(event);
        }
    }

    /// Bind to a reactor/worker pair: reset buffers and flags, open a fresh
    /// command mailbox, spawn the driver, and give the work handler its
    /// `on_bind`.
    pub(crate) fn bind(&self, reactor: LoopHandle, worker: LoopHandle) {
        self.epoch.fetch_add(1, Ordering::AcqRel);
        lock(&self.read_buffer).clear();
        lock(&self.write_buffer).clear();

        let (tx, rx) = mpsc::unbounded();
        {
            let mut state = lock(&self.state);
            state.reactor = Some(reactor.clone());
            state.worker = Some(worker);
            state.commands = Some(tx);
            state.parent = None;
            state.child = None;
            state.peer_addr = None;
        }
        self.stopped.store(false, Ordering::Release);

        if let Some(handler) = self.self_ref.upgrade() {
            reactor.spawn(Driver::new(handler, rx).run());
        }

        let mut work = lock(&self.work);
        work.on_bind(self);
    }

    /// Drop every per-connection resource. The handler must already be
    /// stopped; this runs under the pool's release path.
    pub(crate) fn unbind(&self) {
        {
            let mut state = lock(&self.state);
            state.reactor = None;
            state.worker = None;
            state.commands = None;
            state.parent = None;
            state.child = None;
            state.peer_addr = None;
        }
        lock(&self.read_buffer).clear();
        lock(&self.write_buffer).clear();
    }

    /// Adopt an accepted connection and start running.
    pub(crate) fn start(&self, stream: std::net::TcpStream) {
        self.send(Command::Start(stream));
    }

    /// Begin dialing out.
    pub(crate) fn connect(&self, peer: SocketAddr, local: Option<SocketAddr>) {
        self.send(Command::Connect { peer, local });
    }

    /// Install the parent link and notify the work handler on its loop.
    pub(crate) fn set_parent(&self, link: Link) {
        lock(&self.state).parent = Some(link.clone());
        self.post_to_worker(move |work, handler| work.on_set_parent(handler, link));
    }

    /// Install the child link and notify the work handler on its loop.
    pub(crate) fn set_child(&self, link: Link) {
        lock(&self.state).child = Some(link.clone());
        self.post_to_worker(move |work, handler| work.on_set_child(handler, link));
    }

    fn send(&self, command: Command) {
        if self.stopped.load(Ordering::Acquire) {
            return;
        }
        if let Some(commands) = lock(&self.state).commands.clone() {
            let _ = commands.unbounded_send(command);
        }
    }

    /// Queue a business callback on the worker loop. The callback is dropped
    /// if the handler stopped or was rebound before it ran.
    fn post_to_worker<F>(&self, callback: F)
    where
        F: FnOnce(&mut W, &ServiceHandler<W>) + Send + 'static,
    {
        let epoch = self.epoch.load(Ordering::Acquire);
        let Some(handler) = self.self_ref.upgrade() else {
            return;
        };
        let Some(worker) = lock(&self.state).worker.clone() else {
            return;
        };
        worker.spawn(async move {
            if handler.epoch.load(Ordering::Acquire) != epoch
                || handler.stopped.load(Ordering::Acquire)
            {
                return;
            }
            let mut work = lock(&handler.work);
            callback(&mut work, &handler);
        });
    }

    fn post_open(&self) {
        self.post_to_worker(|work, handler| work.on_open(handler));
    }

    fn post_read(&self, bytes: usize) {
        self.post_to_worker(move |work, handler| work.on_read(handler, bytes));
    }

    fn post_write(&self, bytes: usize) {
        self.post_to_worker(move |work, handler| work.on_write(handler, bytes));
    }

    /// Queue the terminal callback, then hand the handler back to its pool.
    /// Runs regardless of the stopped flag (which is set by now), but never
    /// across a rebind.
    fn post_close(&self, error: Option<Error>) {
        let epoch = self.epoch.load(Ordering::Acquire);
        let Some(handler) = self.self_ref.upgrade() else {
            return;
        };
        let Some(worker) = lock(&self.state).worker.clone() else {
            return;
        };
        worker.spawn(async move {
            if handler.epoch.load(Ordering::Acquire) != epoch {
                return;
            }
            {
                let mut work = lock(&handler.work);
                work.on_close(&handler, error);
            }
            if let Some(home) = handler.home.upgrade() {
                home.release(handler.clone());
            }
        });
    }

    /// Clear both links, telling each live peer that this side closed. The
    /// peer's back-link is dropped before the Close event is delivered, so
    /// the peer's own close cannot echo one back.
    fn sever_links(&self, error: &Option<Error>) {
        let (parent, child) = {
            let mut state = lock(&self.state);
            (state.parent.take(), state.child.take())
        };
        if let Some(peer) = parent.and_then(|link| link.peer.upgrade()) {
            peer.drop_child_link();
            let mut event = Event::new(EventKind::Close);
            event.error = error.clone();
            peer.deliver_child_event(event);
        }
        if let Some(peer) = child.and_then(|link| link.peer.upgrade()) {
            peer.drop_parent_link();
            let mut event = Event::new(EventKind::Close);
            event.error = error.clone();
            peer.deliver_parent_event(event);
        }
    }
}

impl<W: WorkHandler> PeerHandler for ServiceHandler<W> {
    fn peer_read_buffer(&self) -> MutexGuard<'_, IoBuffer> {
        lock(&self.read_buffer)
    }

    fn peer_write_buffer(&self) -> MutexGuard<'_, IoBuffer> {
        lock(&self.write_buffer)
    }

    fn deliver_parent_event(&self, event: Event) {
        self.post_to_worker(move |work, handler| work.on_parent_event(handler, event));
    }

    fn deliver_child_event(&self, event: Event) {
        self.post_to_worker(move |work, handler| work.on_child_event(handler, event));
    }

    fn drop_parent_link(&self) {
        lock(&self.state).parent = None;
    }

    fn drop_child_link(&self) {
        lock(&self.state).child = None;
    }

    fn request_close(&self, error: Option<Error>) {
        self.close_with(error);
    }
}

impl<W: WorkHandler> std::fmt::Debug for ServiceHandler<W> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServiceHandler")
            .field("stopped", &self.stopped.load(Ordering::Acquire))
            .field("epoch", &self.epoch.load(Ordering::Acquire))
            .finish()
    }
}

/// Progress of one readiness-driven operation attempt.
enum IoStep {
    Pending,
    Done(usize),
    Eof,
    Abort(Error),
}

enum ReadOp {
    /// Read whatever is available into the free tail.
    Any,
    /// Read until `target` bytes have accumulated.
    Exact { target: usize, got: usize },
}

struct WriteOp {
    remaining: usize,
    total: usize,
    from_write_buffer: bool,
}

/// What woke the driver.
enum Wake {
    Command(Option<Command>),
    Readable(std::io::Result<()>),
    Writable(std::io::Result<()>),
    IoTimeout,
    SessionTimeout,
}

/// The reactor-side owner of one bind cycle: socket halves, timers, and the
/// command mailbox. Lives as a single task on the handler's reactor loop, so
/// completions for one handler are serialized by construction.
struct Driver<W: WorkHandler> {
    handler: Arc<ServiceHandler<W>>,
    commands: UnboundedReceiver<Command>,
    reader: Option<OwnedReadHalf>,
    writer: Option<OwnedWriteHalf>,
    read_op: Option<ReadOp>,
    write_op: Option<WriteOp>,
    io_deadline: Option<Instant>,
    session_deadline: Option<Instant>,
}

impl<W: WorkHandler> Driver<W> {
    fn new(handler: Arc<ServiceHandler<W>>, commands: UnboundedReceiver<Command>) -> Self {
        Self {
            handler,
            commands,
            reader: None,
            writer: None,
            read_op: None,
            write_op: None,
            io_deadline: None,
            session_deadline: None,
        }
    }

    async fn run(mut self) {
        loop {
            let wake = {
                let want_read = if self.read_op.is_some() {
                    self.reader.as_ref()
                } else {
                    None
                };
                let want_write = if self.write_op.is_some() {
                    self.writer.as_ref()
                } else {
                    None
                };
                let io_deadline = self.io_deadline;
                let session_deadline = self.session_deadline;
                tokio::select! {
                    biased;
                    command = self.commands.next() => Wake::Command(command),
                    result = readable(want_read), if want_read.is_some() => Wake::Readable(result),
                    result = writable(want_write), if want_write.is_some() => Wake::Writable(result),
                    _ = wait_until(io_deadline), if io_deadline.is_some() => Wake::IoTimeout,
                    _ = wait_until(session_deadline), if session_deadline.is_some() => Wake::SessionTimeout,
                }
            };

            match wake {
                Wake::Command(None) => {
                    // The handler was unbound underneath us; nothing left to
                    // drive.
                    return;
                }
                Wake::Command(Some(Command::Close(error))) => {
                    self.shutdown(error).await;
                    return;
                }
                Wake::Command(Some(Command::Start(stream))) => {
                    if let Err(error) = self.begin(stream) {
                        self.shutdown(Some(error)).await;
                        return;
                    }
                }
                Wake::Command(Some(Command::Connect { peer, local })) => {
                    if let Err(error) = self.establish(peer, local).await {
                        self.shutdown(Some(error)).await;
                        return;
                    }
                }
                Wake::Command(Some(Command::ReadSome)) => self.begin_read(ReadOp::Any),
                Wake::Command(Some(Command::ReadExact(length))) => {
                    self.begin_read(ReadOp::Exact {
                        target: length,
                        got: 0,
                    });
                }
                Wake::Command(Some(Command::Write {
                    length,
                    from_write_buffer,
                })) => self.begin_write(length, from_write_buffer),
                Wake::Readable(Ok(())) => match self.progress_read() {
                    IoStep::Pending => {}
                    IoStep::Done(bytes) => {
                        self.read_op = None;
                        self.io_deadline = None;
                        self.handler.post_read(bytes);
                    }
                    IoStep::Eof => {
                        self.shutdown(Some(Error::Eof)).await;
                        return;
                    }
                    IoStep::Abort(error) => {
                        self.shutdown(Some(error)).await;
                        return;
                    }
                },
                Wake::Writable(Ok(())) => match self.progress_write() {
                    IoStep::Pending => {}
                    IoStep::Done(bytes) => {
                        self.write_op = None;
                        self.io_deadline = None;
                        self.handler.post_write(bytes);
                    }
                    IoStep::Eof => {
                        self.shutdown(Some(Error::Eof)).await;
                        return;
                    }
                    IoStep::Abort(error) => {
                        self.shutdown(Some(error)).await;
                        return;
                    }
                },
                Wake::Readable(Err(error)) | Wake::Writable(Err(error)) => {
                    self.shutdown(Some(error.into())).await;
                    return;
                }
                Wake::IoTimeout | Wake::SessionTimeout => {
                    self.shutdown(Some(Error::Timeout)).await;
                    return;
                }
            }
        }
    }

    /// Adopt an accepted stream: register it with this loop's runtime, arm
    /// the session timer, and post `on_open`.
    fn begin(&mut self, stream: std::net::TcpStream) -> Result<(), Error> {
        if self.reader.is_some() {
            warn!("handler already has a stream, dropping start");
            return Ok(());
        }
        lock(&self.handler.state).peer_addr = stream.peer_addr().ok();
        let stream = TcpStream::from_std(stream)?;
        let (reader, writer) = stream.into_split();
        self.reader = Some(reader);
        self.writer = Some(writer);
        self.arm_session();
        self.handler.post_open();
        Ok(())
    }

    /// Dial out, guarded by both timers, then start running.
    async fn establish(
        &mut self,
        peer: SocketAddr,
        local: Option<SocketAddr>,
    ) -> Result<(), Error> {
        if self.reader.is_some() {
            warn!("handler already has a stream, dropping connect");
            return Ok(());
        }
        self.arm_session();
        self.arm_io();

        let socket = if peer.is_ipv4() {
            TcpSocket::new_v4()
        } else {
            TcpSocket::new_v6()
        }?;
        if let Some(local) = local {
            socket.bind(local)?;
        }

        let io_deadline = self.io_deadline;
        let session_deadline = self.session_deadline;
        let stream = tokio::select! {
            biased;
            connected = socket.connect(peer) => connected.map_err(Error::from)?,
            _ = wait_until(io_deadline), if io_deadline.is_some() => return Err(Error::Timeout),
            _ = wait_until(session_deadline), if session_deadline.is_some() => return Err(Error::Timeout),
        };
        self.io_deadline = None;

        debug!(peer = %peer, "connected");
        lock(&self.handler.state).peer_addr = Some(peer);
        let (reader, writer) = stream.into_split();
        self.reader = Some(reader);
        self.writer = Some(writer);
        // Re-arm for the session proper, as the connect consumed part of it.
        self.arm_session();
        self.handler.post_open();
        Ok(())
    }

    fn begin_read(&mut self, op: ReadOp) {
        if self.reader.is_none() {
            warn!("read requested before the handler has a stream");
            return;
        }
        if self.read_op.is_some() {
            warn!("read requested while one is outstanding, dropping");
            return;
        }
        self.arm_io();
        self.read_op = Some(op);
    }

    fn begin_write(&mut self, length: usize, from_write_buffer: bool) {
        if self.writer.is_none() {
            warn!("write requested before the handler has a stream");
            return;
        }
        if self.write_op.is_some() {
            warn!("write requested while one is outstanding, dropping");
            return;
        }
        self.arm_io();
        self.write_op = Some(WriteOp {
            remaining: length,
            total: length,
            from_write_buffer,
        });
    }

    /// One non-blocking read attempt against the read buffer's tail.
    fn progress_read(&mut self) -> IoStep {
        let (Some(op), Some(reader)) = (self.read_op.as_mut(), self.reader.as_ref()) else {
            return IoStep::Pending;
        };
        let mut buffer = lock(&self.handler.read_buffer);
        match op {
            ReadOp::Any => {
                let space = buffer.space_mut();
                if space.is_empty() {
                    return IoStep::Abort(Error::NoBufferSpace);
                }
                match reader.try_read(space) {
                    Ok(0) => IoStep::Eof,
                    Ok(read) => {
                        buffer.produce(read);
                        IoStep::Done(read)
                    }
                    Err(error) if error.kind() == std::io::ErrorKind::WouldBlock => IoStep::Pending,
                    Err(error) => IoStep::Abort(error.into()),
                }
            }
            ReadOp::Exact { target, got } => {
                let want = *target - *got;
                if buffer.space() < want {
                    return IoStep::Abort(Error::NoBufferSpace);
                }
                let space = &mut buffer.space_mut()[..want];
                match reader.try_read(space) {
                    Ok(0) => IoStep::Eof,
                    Ok(read) => {
                        buffer.produce(read);
                        *got += read;
                        if got == target {
                            IoStep::Done(*target)
                        } else {
                            IoStep::Pending
                        }
                    }
                    Err(error) if error.kind() == std::io::ErrorKind::WouldBlock => IoStep::Pending,
                    Err(error) => IoStep::Abort(error.into()),
                }
            }
        }
    }

    /// One non-blocking write attempt from the front of the write source,
    /// consuming what the socket took.
    fn progress_write(&mut self) -> IoStep {
        let (Some(op), Some(writer)) = (self.write_op.as_mut(), self.writer.as_ref()) else {
            return IoStep::Pending;
        };
        let mut buffer = if op.from_write_buffer {
            lock(&self.handler.write_buffer)
        } else {
            lock(&self.handler.read_buffer)
        };
        let chunk = op.remaining.min(buffer.len());
        if chunk == 0 {
            return IoStep::Abort(Error::NoBufferSpace);
        }
        match writer.try_write(&buffer.data()[..chunk]) {
            Ok(0) => IoStep::Abort(Error::ConnectionReset),
            Ok(written) => {
                buffer.consume(written);
                op.remaining -= written;
                if op.remaining == 0 {
                    IoStep::Done(op.total)
                } else {
                    IoStep::Pending
                }
            }
            Err(error) if error.kind() == std::io::ErrorKind::WouldBlock => IoStep::Pending,
            Err(error) => IoStep::Abort(error.into()),
        }
    }

    fn arm_session(&mut self) {
        if !self.handler.session_timeout.is_zero() {
            self.session_deadline = Some(Instant::now() + self.handler.session_timeout);
        }
    }

    fn arm_io(&mut self) {
        if !self.handler.io_timeout.is_zero() {
            self.io_deadline = Some(Instant::now() + self.handler.io_timeout);
        }
    }

    /// Tear the connection down: flip the stopped flag, cancel timers and
    /// outstanding operations, send FIN, notify the paired side, and post the
    /// terminal callback. Safe to call at most once per bind cycle; the
    /// stopped flag makes a second call a no-op.
    async fn shutdown(&mut self, error: Option<Error>) {
        if self.handler.stopped.swap(true, Ordering::AcqRel) {
            return;
        }
        self.read_op = None;
        self.write_op = None;
        self.io_deadline = None;
        self.session_deadline = None;

        if let Some(mut writer) = self.writer.take() {
            let _ = writer.shutdown().await;
        }
        drop(self.reader.take());

        self.handler.sever_links(&error);
        self.handler.post_close(error);
    }
}

async fn readable(half: Option<&OwnedReadHalf>) -> std::io::Result<()> {
    match half {
        Some(half) => half.readable().await,
        None => std::future::pending().await,
    }
}

async fn writable(half: Option<&OwnedWriteHalf>) -> std::io::Result<()> {
    match half {
        Some(half) => half.writable().await,
        None => std::future::pending().await,
    }
}

async fn wait_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}
