//! End-to-end exercises over real sockets: echo servers, a proxy chain,
//! timeouts, pool saturation, and shutdown draining.

use prometheus_client::registry::Registry;
use std::io::{Read, Write};
use std::net::SocketAddr;
use std::sync::mpsc::{Receiver, Sender};
use std::sync::{mpsc, Arc, Mutex};
use std::time::{Duration, Instant};
use wharf::{
    Connector, Error, Event, EventKind, GroupConfig, HandlerPool, HandlerPoolConfig, Link,
    PoolGroup, Server, ServerConfig, ServiceHandler, WorkAllocator, WorkHandler,
};

const MESSAGE: &[u8] = b"echo server test message.\r\n";

/// One observed callback, recorded in order by the work handlers under test.
#[derive(Debug, Clone, PartialEq)]
enum Cb {
    Open,
    Read(usize),
    Write(usize),
    Close(Option<Error>),
    ParentEvent(EventKind, usize),
    ChildEvent(EventKind, usize),
    Payload(Vec<u8>),
}

/// Sends each connection's full callback log when it closes.
#[derive(Clone)]
struct LogSink {
    tx: Arc<Mutex<Sender<Vec<Cb>>>>,
}

impl LogSink {
    fn new() -> (Self, Receiver<Vec<Cb>>) {
        let (tx, rx) = mpsc::channel();
        (
            Self {
                tx: Arc::new(Mutex::new(tx)),
            },
            rx,
        )
    }

    fn send(&self, log: Vec<Cb>) {
        let _ = self.tx.lock().unwrap().send(log);
    }
}

/// Collect logs until `count` of them saw an open, ignoring the logs of
/// handlers that were bound to an accept slot but never served a connection.
fn collect_opened(rx: &Receiver<Vec<Cb>>, count: usize) -> Vec<Vec<Cb>> {
    let deadline = Instant::now() + Duration::from_secs(30);
    let mut logs = Vec::new();
    while logs.len() < count {
        let remaining = deadline
            .checked_duration_since(Instant::now())
            .expect("timed out collecting connection logs");
        match rx.recv_timeout(remaining) {
            Ok(log) => {
                if log.contains(&Cb::Open) {
                    logs.push(log);
                }
            }
            Err(error) => panic!("collecting connection logs: {error}"),
        }
    }
    logs
}

struct EchoWork {
    log: Vec<Cb>,
    sink: LogSink,
}

impl WorkHandler for EchoWork {
    fn on_bind(&mut self, _handler: &ServiceHandler<Self>) {
        self.log.clear();
    }

    fn on_open(&mut self, handler: &ServiceHandler<Self>) {
        self.log.push(Cb::Open);
        handler.async_read_some();
    }

    fn on_read(&mut self, handler: &ServiceHandler<Self>, bytes: usize) {
        self.log.push(Cb::Read(bytes));
        handler.async_write(bytes);
    }

    fn on_write(&mut self, handler: &ServiceHandler<Self>, bytes: usize) {
        self.log.push(Cb::Write(bytes));
        handler.async_read_some();
    }

    fn on_close(&mut self, _handler: &ServiceHandler<Self>, error: Option<Error>) {
        self.log.push(Cb::Close(error));
        self.sink.send(std::mem::take(&mut self.log));
    }
}

struct EchoAllocator {
    sink: LogSink,
}

impl WorkAllocator for EchoAllocator {
    type Work = EchoWork;

    fn make_work(&self) -> EchoWork {
        EchoWork {
            log: Vec::new(),
            sink: self.sink.clone(),
        }
    }
}

fn small_group() -> GroupConfig {
    GroupConfig {
        reactor_threads: 1,
        worker_initial: 1,
        worker_high: 1,
        worker_load: 100,
        force_stop: false,
    }
}

fn echo_pool_config() -> HandlerPoolConfig {
    HandlerPoolConfig {
        initial: 1,
        low_watermark: 0,
        high_watermark: 4,
        increment: 1,
        maximum: 8,
        read_buffer_size: 64,
        write_buffer_size: 0,
        session_timeout: Duration::from_secs(5),
        io_timeout: Duration::ZERO,
        ..HandlerPoolConfig::default()
    }
}

fn small_server_config() -> ServerConfig {
    ServerConfig {
        accept_queue_length: 2,
        accept_delay: Duration::from_secs(1),
    }
}

fn echo_server(
    pool_cfg: HandlerPoolConfig,
    group_cfg: GroupConfig,
    server_cfg: ServerConfig,
) -> (Server<EchoAllocator>, Receiver<Vec<Cb>>, SocketAddr) {
    let (sink, rx) = LogSink::new();
    let mut registry = Registry::default();
    let pool = HandlerPool::new(EchoAllocator { sink }, pool_cfg, &mut registry);
    let server = Server::new(
        pool,
        "127.0.0.1:0".parse().unwrap(),
        group_cfg,
        server_cfg,
        &mut registry,
    );
    server.start().unwrap();
    let addr = server.local_addr().unwrap();
    (server, rx, addr)
}

/// Blocking echo round trip against `addr`; returns what came back.
fn raw_echo_roundtrip(addr: SocketAddr) -> Vec<u8> {
    let mut socket = std::net::TcpStream::connect(addr).unwrap();
    socket
        .set_read_timeout(Some(Duration::from_secs(10)))
        .unwrap();
    socket.write_all(MESSAGE).unwrap();
    let mut reply = vec![0u8; MESSAGE.len()];
    socket.read_exact(&mut reply).unwrap();
    reply
}

#[test]
fn echo_single_connection() {
    let (server, rx, addr) = echo_server(echo_pool_config(), small_group(), small_server_config());

    let reply = raw_echo_roundtrip(addr);
    assert_eq!(reply, MESSAGE);

    let logs = collect_opened(&rx, 1);
    assert_eq!(
        logs[0],
        vec![
            Cb::Open,
            Cb::Read(MESSAGE.len()),
            Cb::Write(MESSAGE.len()),
            Cb::Close(Some(Error::Eof)),
        ]
    );

    server.stop();
}

#[test]
fn echo_sequential_connections_reuse_handlers() {
    let (server, rx, addr) = echo_server(echo_pool_config(), small_group(), small_server_config());

    for _ in 0..5 {
        assert_eq!(raw_echo_roundtrip(addr), MESSAGE);
    }

    let logs = collect_opened(&rx, 5);
    for log in logs {
        assert_eq!(log.first(), Some(&Cb::Open));
        assert_eq!(log.last(), Some(&Cb::Close(Some(Error::Eof))));
        // Exactly one open and one close per connection.
        assert_eq!(log.iter().filter(|cb| **cb == Cb::Open).count(), 1);
        assert_eq!(
            log.iter()
                .filter(|cb| matches!(cb, Cb::Close(_)))
                .count(),
            1
        );
    }

    // Five connections were served by a pool that never needed five handlers.
    assert!(server.pool().total() < 5);
    server.stop();
}

struct ClientWork {
    log: Vec<Cb>,
    sink: LogSink,
}

impl WorkHandler for ClientWork {
    fn on_bind(&mut self, _handler: &ServiceHandler<Self>) {
        self.log.clear();
    }

    fn on_open(&mut self, handler: &ServiceHandler<Self>) {
        self.log.push(Cb::Open);
        handler.write_buffer().produce_slice(MESSAGE);
        handler.async_write_all();
    }

    fn on_write(&mut self, handler: &ServiceHandler<Self>, bytes: usize) {
        self.log.push(Cb::Write(bytes));
        handler.async_read(MESSAGE.len());
    }

    fn on_read(&mut self, handler: &ServiceHandler<Self>, bytes: usize) {
        self.log.push(Cb::Read(bytes));
        self.log.push(Cb::Payload(handler.read_buffer().data().to_vec()));
        handler.close();
    }

    fn on_close(&mut self, _handler: &ServiceHandler<Self>, error: Option<Error>) {
        self.log.push(Cb::Close(error));
        self.sink.send(std::mem::take(&mut self.log));
    }
}

struct ClientAllocator {
    sink: LogSink,
}

impl WorkAllocator for ClientAllocator {
    type Work = ClientWork;

    fn make_work(&self) -> ClientWork {
        ClientWork {
            log: Vec::new(),
            sink: self.sink.clone(),
        }
    }
}

#[test]
fn echo_framework_client() {
    let (server, server_rx, addr) =
        echo_server(echo_pool_config(), small_group(), small_server_config());

    let (sink, client_rx) = LogSink::new();
    let mut registry = Registry::default();
    let client_pool = HandlerPool::new(
        ClientAllocator { sink },
        HandlerPoolConfig {
            initial: 1,
            low_watermark: 0,
            high_watermark: 2,
            increment: 1,
            maximum: 4,
            read_buffer_size: 64,
            write_buffer_size: 64,
            session_timeout: Duration::from_secs(5),
            io_timeout: Duration::from_secs(5),
            ..HandlerPoolConfig::default()
        },
        &mut registry,
    );
    let group = PoolGroup::new(small_group());
    group.start();

    let connector = Connector::new(client_pool, addr);
    assert!(connector.connect(group.io_pool().get(), group.work_pool().get()));

    let client_logs = collect_opened(&client_rx, 1);
    assert_eq!(
        client_logs[0],
        vec![
            Cb::Open,
            Cb::Write(MESSAGE.len()),
            Cb::Read(MESSAGE.len()),
            Cb::Payload(MESSAGE.to_vec()),
            Cb::Close(None),
        ]
    );

    let server_logs = collect_opened(&server_rx, 1);
    assert_eq!(
        server_logs[0],
        vec![
            Cb::Open,
            Cb::Read(MESSAGE.len()),
            Cb::Write(MESSAGE.len()),
            Cb::Close(Some(Error::Eof)),
        ]
    );

    server.stop();
    group.stop();
}

struct ProxyWork {
    connector: Arc<Connector<ProxyChildAllocator>>,
    child: Option<Link>,
    log: Vec<Cb>,
    sink: LogSink,
}

impl WorkHandler for ProxyWork {
    fn on_bind(&mut self, _handler: &ServiceHandler<Self>) {
        self.log.clear();
        self.child = None;
    }

    fn on_open(&mut self, handler: &ServiceHandler<Self>) {
        self.log.push(Cb::Open);
        if !self.connector.connect_with_parent(handler) {
            handler.close();
        }
    }

    fn on_set_child(&mut self, _handler: &ServiceHandler<Self>, child: Link) {
        self.child = Some(child);
    }

    fn on_child_event(&mut self, handler: &ServiceHandler<Self>, event: Event) {
        self.log.push(Cb::ChildEvent(event.kind, event.value));
        match event.kind {
            // The outbound leg is up: start serving the client.
            EventKind::Open => handler.async_read_some(),
            EventKind::Write => {}
            // The backend replied: pull the bytes over and answer the client.
            EventKind::Read => {
                let Some(peer) = self.child.as_ref().and_then(Link::peer) else {
                    handler.close();
                    return;
                };
                {
                    let mut own = handler.read_buffer();
                    own.clear();
                    let mut childs = peer.read_buffer();
                    own.produce_slice(childs.data());
                    let drained = childs.len();
                    childs.consume(drained);
                }
                handler.async_write(event.value);
            }
            EventKind::Close => {
                self.child = None;
                handler.close();
            }
            _ => {}
        }
    }

    fn on_read(&mut self, handler: &ServiceHandler<Self>, bytes: usize) {
        self.log.push(Cb::Read(bytes));
        // Stage the client's bytes in the outbound leg's write buffer and ask
        // it to forward them and fetch the reply.
        let Some(peer) = self.child.as_ref().and_then(Link::peer) else {
            handler.close();
            return;
        };
        {
            let mut staged = peer.write_buffer();
            staged.clear();
            let mut own = handler.read_buffer();
            staged.produce_slice(own.data());
            let drained = own.len();
            own.consume(drained);
        }
        handler.post_child(Event::with_value(EventKind::WriteRead, bytes));
    }

    fn on_write(&mut self, handler: &ServiceHandler<Self>, bytes: usize) {
        self.log.push(Cb::Write(bytes));
        handler.async_read_some();
    }

    fn on_close(&mut self, _handler: &ServiceHandler<Self>, error: Option<Error>) {
        self.log.push(Cb::Close(error));
        self.sink.send(std::mem::take(&mut self.log));
    }
}

struct ProxyAllocator {
    connector: Arc<Connector<ProxyChildAllocator>>,
    sink: LogSink,
}

impl WorkAllocator for ProxyAllocator {
    type Work = ProxyWork;

    fn make_work(&self) -> ProxyWork {
        ProxyWork {
            connector: self.connector.clone(),
            child: None,
            log: Vec::new(),
            sink: self.sink.clone(),
        }
    }
}

struct ProxyChildWork {
    log: Vec<Cb>,
    sink: LogSink,
}

impl WorkHandler for ProxyChildWork {
    fn on_bind(&mut self, _handler: &ServiceHandler<Self>) {
        self.log.clear();
    }

    fn on_open(&mut self, handler: &ServiceHandler<Self>) {
        self.log.push(Cb::Open);
        handler.post_parent(Event::new(EventKind::Open));
    }

    fn on_parent_event(&mut self, handler: &ServiceHandler<Self>, event: Event) {
        self.log.push(Cb::ParentEvent(event.kind, event.value));
        match event.kind {
            EventKind::WriteRead => handler.async_write_all(),
            EventKind::Write => handler.async_write_all(),
            EventKind::Read => handler.async_read_some(),
            EventKind::Close => handler.close(),
            _ => {}
        }
    }

    fn on_write(&mut self, handler: &ServiceHandler<Self>, bytes: usize) {
        self.log.push(Cb::Write(bytes));
        handler.post_parent(Event::with_value(EventKind::Write, bytes));
        handler.async_read_some();
    }

    fn on_read(&mut self, handler: &ServiceHandler<Self>, bytes: usize) {
        self.log.push(Cb::Read(bytes));
        handler.post_parent(Event::with_value(EventKind::Read, bytes));
    }

    fn on_close(&mut self, _handler: &ServiceHandler<Self>, error: Option<Error>) {
        self.log.push(Cb::Close(error));
        self.sink.send(std::mem::take(&mut self.log));
    }
}

struct ProxyChildAllocator {
    sink: LogSink,
}

impl WorkAllocator for ProxyChildAllocator {
    type Work = ProxyChildWork;

    fn make_work(&self) -> ProxyChildWork {
        ProxyChildWork {
            log: Vec::new(),
            sink: self.sink.clone(),
        }
    }
}

#[test]
fn proxy_forwards_to_echo_backend() {
    // Backend echo server.
    let (backend, backend_rx, backend_addr) =
        echo_server(echo_pool_config(), small_group(), small_server_config());

    // Outbound-leg pool, bound to the backend address. The two pools share a
    // registry through prefixed sub-registries.
    let (child_sink, child_rx) = LogSink::new();
    let mut registry = Registry::default();
    let child_registry = registry.sub_registry_with_prefix("proxy_child");
    let child_pool = HandlerPool::new(
        ProxyChildAllocator { sink: child_sink },
        HandlerPoolConfig {
            initial: 1,
            low_watermark: 0,
            high_watermark: 2,
            increment: 1,
            maximum: 4,
            read_buffer_size: 64,
            write_buffer_size: 64,
            session_timeout: Duration::from_secs(5),
            io_timeout: Duration::from_secs(5),
            ..HandlerPoolConfig::default()
        },
        child_registry,
    );
    let connector = Arc::new(Connector::new(child_pool, backend_addr));

    // The proxy server itself.
    let (proxy_sink, proxy_rx) = LogSink::new();
    let proxy_pool = HandlerPool::new(
        ProxyAllocator {
            connector,
            sink: proxy_sink,
        },
        echo_pool_config(),
        registry.sub_registry_with_prefix("proxy"),
    );
    let proxy = Server::new(
        proxy_pool,
        "127.0.0.1:0".parse().unwrap(),
        small_group(),
        small_server_config(),
        &mut registry,
    );
    proxy.start().unwrap();
    let proxy_addr = proxy.local_addr().unwrap();

    // One round trip through the proxy.
    assert_eq!(raw_echo_roundtrip(proxy_addr), MESSAGE);

    let proxy_logs = collect_opened(&proxy_rx, 1);
    assert_eq!(
        proxy_logs[0],
        vec![
            Cb::Open,
            Cb::ChildEvent(EventKind::Open, 0),
            Cb::Read(MESSAGE.len()),
            Cb::ChildEvent(EventKind::Write, MESSAGE.len()),
            Cb::ChildEvent(EventKind::Read, MESSAGE.len()),
            Cb::Write(MESSAGE.len()),
            Cb::Close(Some(Error::Eof)),
        ]
    );

    // The outbound leg saw a whole echo exchange and was told to close when
    // the inbound side went away.
    let child_logs = collect_opened(&child_rx, 1);
    let child_log = &child_logs[0];
    assert_eq!(child_log.first(), Some(&Cb::Open));
    assert!(child_log.contains(&Cb::Write(MESSAGE.len())));
    assert!(child_log.contains(&Cb::Read(MESSAGE.len())));
    assert!(matches!(child_log.last(), Some(Cb::Close(_))));

    // The backend served a normal echo connection.
    let backend_logs = collect_opened(&backend_rx, 1);
    assert_eq!(
        backend_logs[0],
        vec![
            Cb::Open,
            Cb::Read(MESSAGE.len()),
            Cb::Write(MESSAGE.len()),
            Cb::Close(Some(Error::Eof)),
        ]
    );

    proxy.stop();
    backend.stop();
}

#[test]
fn session_timeout_closes_idle_connection() {
    let (server, rx, addr) = echo_server(
        HandlerPoolConfig {
            session_timeout: Duration::from_secs(1),
            ..echo_pool_config()
        },
        small_group(),
        small_server_config(),
    );

    // Connect but never write.
    let socket = std::net::TcpStream::connect(addr).unwrap();
    let started = Instant::now();

    let logs = collect_opened(&rx, 1);
    let elapsed = started.elapsed();
    assert_eq!(logs[0], vec![Cb::Open, Cb::Close(Some(Error::Timeout))]);
    assert!(elapsed >= Duration::from_millis(900), "closed too early: {elapsed:?}");
    assert!(elapsed < Duration::from_secs(4), "closed too late: {elapsed:?}");

    drop(socket);
    server.stop();
}

#[test]
fn saturated_pool_delays_accepts_without_dropping() {
    let (server, rx, addr) = echo_server(
        HandlerPoolConfig {
            initial: 4,
            low_watermark: 0,
            high_watermark: 4,
            increment: 1,
            maximum: 4,
            read_buffer_size: 64,
            write_buffer_size: 0,
            session_timeout: Duration::from_secs(30),
            io_timeout: Duration::ZERO,
            ..HandlerPoolConfig::default()
        },
        small_group(),
        ServerConfig {
            accept_queue_length: 2,
            accept_delay: Duration::from_millis(200),
        },
    );

    let clients: Vec<_> = (0..10)
        .map(|_| std::thread::spawn(move || raw_echo_roundtrip(addr)))
        .collect();
    for client in clients {
        assert_eq!(client.join().unwrap(), MESSAGE);
    }

    let logs = collect_opened(&rx, 10);
    assert_eq!(logs.len(), 10);
    // The hard maximum was never exceeded; delayed accepts reused handlers.
    assert_eq!(server.pool().total(), 4);

    server.stop();
}

#[test]
fn graceful_stop_drains_all_connections() {
    let (server, rx, addr) = echo_server(
        HandlerPoolConfig {
            initial: 32,
            low_watermark: 4,
            high_watermark: 64,
            increment: 8,
            maximum: 128,
            read_buffer_size: 64,
            write_buffer_size: 0,
            session_timeout: Duration::from_secs(30),
            io_timeout: Duration::ZERO,
            ..HandlerPoolConfig::default()
        },
        GroupConfig {
            reactor_threads: 2,
            worker_initial: 2,
            worker_high: 4,
            worker_load: 100,
            force_stop: false,
        },
        ServerConfig {
            accept_queue_length: 16,
            accept_delay: Duration::from_secs(1),
        },
    );

    let clients: Vec<_> = (0..100)
        .map(|_| std::thread::spawn(move || raw_echo_roundtrip(addr)))
        .collect();
    for client in clients {
        assert_eq!(client.join().unwrap(), MESSAGE);
    }

    server.stop();

    // Every served connection reached its terminal callback by the time the
    // graceful stop finished draining.
    let logs = collect_opened(&rx, 100);
    for log in &logs {
        assert!(matches!(log.last(), Some(Cb::Close(_))));
    }
    // Everything was released back to the pool, including the handlers the
    // accept slots were holding.
    assert_eq!(server.pool().outstanding(), 0);
}

struct OverflowWork {
    log: Vec<Cb>,
    sink: LogSink,
}

impl WorkHandler for OverflowWork {
    fn on_open(&mut self, handler: &ServiceHandler<Self>) {
        self.log.push(Cb::Open);
        // One byte more than the read buffer can take.
        let oversized = handler.read_buffer().capacity() + 1;
        handler.async_read(oversized);
    }

    fn on_read(&mut self, _handler: &ServiceHandler<Self>, bytes: usize) {
        self.log.push(Cb::Read(bytes));
    }

    fn on_close(&mut self, _handler: &ServiceHandler<Self>, error: Option<Error>) {
        self.log.push(Cb::Close(error));
        self.sink.send(std::mem::take(&mut self.log));
    }
}

struct OverflowAllocator {
    sink: LogSink,
}

impl WorkAllocator for OverflowAllocator {
    type Work = OverflowWork;

    fn make_work(&self) -> OverflowWork {
        OverflowWork {
            log: Vec::new(),
            sink: self.sink.clone(),
        }
    }
}

#[test]
fn oversized_read_closes_with_no_buffer_space() {
    let (sink, rx) = LogSink::new();
    let mut registry = Registry::default();
    let pool = HandlerPool::new(OverflowAllocator { sink }, echo_pool_config(), &mut registry);
    let server = Server::new(
        pool,
        "127.0.0.1:0".parse().unwrap(),
        small_group(),
        small_server_config(),
        &mut registry,
    );
    server.start().unwrap();
    let addr = server.local_addr().unwrap();

    let _socket = std::net::TcpStream::connect(addr).unwrap();
    let logs = collect_opened(&rx, 1);
    assert_eq!(
        logs[0],
        vec![Cb::Open, Cb::Close(Some(Error::NoBufferSpace))]
    );

    server.stop();
}

struct CloseThriceWork {
    log: Vec<Cb>,
    sink: LogSink,
}

impl WorkHandler for CloseThriceWork {
    fn on_open(&mut self, handler: &ServiceHandler<Self>) {
        self.log.push(Cb::Open);
        handler.close();
        handler.close();
        handler.close();
    }

    fn on_close(&mut self, _handler: &ServiceHandler<Self>, error: Option<Error>) {
        self.log.push(Cb::Close(error));
        self.sink.send(std::mem::take(&mut self.log));
    }
}

struct CloseThriceAllocator {
    sink: LogSink,
}

impl WorkAllocator for CloseThriceAllocator {
    type Work = CloseThriceWork;

    fn make_work(&self) -> CloseThriceWork {
        CloseThriceWork {
            log: Vec::new(),
            sink: self.sink.clone(),
        }
    }
}

#[test]
fn repeated_close_reports_once() {
    let (sink, rx) = LogSink::new();
    let mut registry = Registry::default();
    let pool = HandlerPool::new(
        CloseThriceAllocator { sink },
        echo_pool_config(),
        &mut registry,
    );
    let server = Server::new(
        pool,
        "127.0.0.1:0".parse().unwrap(),
        small_group(),
        small_server_config(),
        &mut registry,
    );
    server.start().unwrap();
    let addr = server.local_addr().unwrap();

    let _socket = std::net::TcpStream::connect(addr).unwrap();
    let logs = collect_opened(&rx, 1);
    assert_eq!(logs[0], vec![Cb::Open, Cb::Close(None)]);

    // No second close arrives.
    assert!(rx.recv_timeout(Duration::from_millis(500)).is_err());

    server.stop();
}

struct HoldWork {
    log: Vec<Cb>,
    sink: LogSink,
}

impl WorkHandler for HoldWork {
    fn on_open(&mut self, handler: &ServiceHandler<Self>) {
        self.log.push(Cb::Open);
        // Wait for the peer to hang up.
        handler.async_read_some();
    }

    fn on_close(&mut self, _handler: &ServiceHandler<Self>, error: Option<Error>) {
        self.log.push(Cb::Close(error));
        self.sink.send(std::mem::take(&mut self.log));
    }
}

struct HoldAllocator {
    sink: LogSink,
}

impl WorkAllocator for HoldAllocator {
    type Work = HoldWork;

    fn make_work(&self) -> HoldWork {
        HoldWork {
            log: Vec::new(),
            sink: self.sink.clone(),
        }
    }
}

#[test]
fn worker_pool_grows_under_load_and_respects_cap() {
    let (sink, rx) = LogSink::new();
    let mut registry = Registry::default();
    let pool = HandlerPool::new(
        HoldAllocator { sink },
        HandlerPoolConfig {
            initial: 16,
            low_watermark: 0,
            high_watermark: 16,
            increment: 4,
            maximum: 32,
            read_buffer_size: 64,
            write_buffer_size: 0,
            session_timeout: Duration::from_secs(30),
            io_timeout: Duration::ZERO,
            ..HandlerPoolConfig::default()
        },
        &mut registry,
    );
    let server = Server::new(
        pool,
        "127.0.0.1:0".parse().unwrap(),
        GroupConfig {
            reactor_threads: 1,
            worker_initial: 1,
            worker_high: 2,
            worker_load: 3,
            force_stop: false,
        },
        ServerConfig {
            accept_queue_length: 4,
            accept_delay: Duration::from_secs(1),
        },
        &mut registry,
    );
    server.start().unwrap();
    let addr = server.local_addr().unwrap();

    // Hold several connections open so the outstanding load climbs past
    // worker_load × current loops.
    let sockets: Vec<_> = (0..8)
        .map(|_| std::net::TcpStream::connect(addr).unwrap())
        .collect();

    // The worker pool grows, but never past its high watermark.
    let deadline = Instant::now() + Duration::from_secs(10);
    loop {
        let size = server.group().work_pool().size();
        assert!(size <= 2, "worker pool exceeded its cap: {size}");
        if size == 2 {
            break;
        }
        assert!(Instant::now() < deadline, "worker pool never grew");
        std::thread::sleep(Duration::from_millis(50));
    }

    drop(sockets);
    let logs = collect_opened(&rx, 8);
    assert_eq!(logs.len(), 8);
    server.stop();
}
