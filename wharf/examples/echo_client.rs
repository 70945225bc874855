//! A pooled echo client: opens a batch of connections, sends one message on
//! each, and reports the echoed replies.
//!
//! ```sh
//! cargo run --example echo_client -- 127.0.0.1:7000 16
//! ```

use prometheus_client::registry::Registry;
use std::sync::mpsc;
use std::sync::{Arc, Mutex};
use tracing::{info, warn};
use wharf::{
    Connector, Error, GroupConfig, HandlerPool, HandlerPoolConfig, PoolGroup, ServiceHandler,
    WorkAllocator, WorkHandler,
};

const MESSAGE: &[u8] = b"echo server test message.\r\n";

struct EchoCall {
    done: Arc<Mutex<mpsc::Sender<Result<usize, Error>>>>,
}

impl WorkHandler for EchoCall {
    fn on_open(&mut self, handler: &ServiceHandler<Self>) {
        handler.write_buffer().produce_slice(MESSAGE);
        handler.async_write_all();
    }

    fn on_write(&mut self, handler: &ServiceHandler<Self>, _bytes: usize) {
        handler.async_read(MESSAGE.len());
    }

    fn on_read(&mut self, handler: &ServiceHandler<Self>, bytes: usize) {
        if handler.read_buffer().data() == MESSAGE {
            let _ = self.done.lock().unwrap().send(Ok(bytes));
        } else {
            warn!("reply did not match what was sent");
        }
        handler.close();
    }

    fn on_close(&mut self, _handler: &ServiceHandler<Self>, error: Option<Error>) {
        if let Some(error) = error {
            let _ = self.done.lock().unwrap().send(Err(error));
        }
    }
}

struct EchoCallAllocator {
    done: Arc<Mutex<mpsc::Sender<Result<usize, Error>>>>,
}

impl WorkAllocator for EchoCallAllocator {
    type Work = EchoCall;

    fn make_work(&self) -> EchoCall {
        EchoCall {
            done: self.done.clone(),
        }
    }
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let mut args = std::env::args().skip(1);
    let addr = args
        .next()
        .unwrap_or_else(|| "127.0.0.1:7000".into())
        .parse()
        .expect("invalid server address");
    let connections: usize = args
        .next()
        .unwrap_or_else(|| "16".into())
        .parse()
        .expect("invalid connection count");

    let (tx, rx) = mpsc::channel();
    let mut registry = Registry::default();
    let pool = HandlerPool::new(
        EchoCallAllocator {
            done: Arc::new(Mutex::new(tx)),
        },
        HandlerPoolConfig {
            initial: connections.max(1),
            high_watermark: connections.max(1) + 1,
            maximum: 2 * connections.max(1) + 1,
            write_buffer_size: 256,
            io_timeout: std::time::Duration::from_secs(10),
            ..HandlerPoolConfig::default()
        },
        &mut registry,
    );

    let group = PoolGroup::new(GroupConfig::default());
    group.start();

    let connector = Connector::new(pool, addr);
    for _ in 0..connections {
        if !connector.connect(group.io_pool().get(), group.work_pool().get()) {
            warn!("connector pool saturated");
        }
    }

    let mut ok = 0usize;
    let mut failed = 0usize;
    for _ in 0..connections {
        match rx.recv_timeout(std::time::Duration::from_secs(30)) {
            Ok(Ok(_)) => ok += 1,
            Ok(Err(error)) => {
                warn!(%error, "echo call failed");
                failed += 1;
            }
            Err(_) => {
                warn!("timed out waiting for replies");
                break;
            }
        }
    }
    info!(ok, failed, "echo batch finished");

    group.stop();
}
