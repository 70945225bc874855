//! A pooled echo server.
//!
//! ```sh
//! cargo run --example echo_server -- 127.0.0.1:7000
//! ```

use prometheus_client::registry::Registry;
use tracing::info;
use wharf::{
    Error, GroupConfig, HandlerPool, HandlerPoolConfig, Server, ServerConfig, ServiceHandler,
    WorkAllocator, WorkHandler,
};

struct Echo;

impl WorkHandler for Echo {
    fn on_open(&mut self, handler: &ServiceHandler<Self>) {
        handler.async_read_some();
    }

    fn on_read(&mut self, handler: &ServiceHandler<Self>, bytes: usize) {
        handler.async_write(bytes);
    }

    fn on_write(&mut self, handler: &ServiceHandler<Self>, _bytes: usize) {
        handler.async_read_some();
    }

    fn on_close(&mut self, handler: &ServiceHandler<Self>, error: Option<Error>) {
        match error {
            None | Some(Error::Eof) => {}
            Some(error) => info!(peer = ?handler.peer_addr(), %error, "connection failed"),
        }
    }
}

struct EchoAllocator;

impl WorkAllocator for EchoAllocator {
    type Work = Echo;

    fn make_work(&self) -> Echo {
        Echo
    }
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let addr = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "127.0.0.1:7000".into())
        .parse()
        .expect("invalid listen address");

    let mut registry = Registry::default();
    let pool = HandlerPool::new(
        EchoAllocator,
        HandlerPoolConfig {
            session_timeout: std::time::Duration::from_secs(30),
            ..HandlerPoolConfig::default()
        },
        &mut registry,
    );
    let server = Server::new(
        pool,
        addr,
        GroupConfig::default(),
        ServerConfig::default(),
        &mut registry,
    );

    info!(%addr, "echo server starting");
    server.run().expect("failed to start echo server");
}
