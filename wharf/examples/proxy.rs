//! A forwarding proxy: every inbound connection opens a paired outbound
//! connection to the backend, and the two legs exchange events to move bytes
//! in both directions.
//!
//! ```sh
//! cargo run --example proxy -- 127.0.0.1:7100 127.0.0.1:7000
//! ```

use prometheus_client::registry::Registry;
use std::sync::Arc;
use tracing::info;
use wharf::{
    Connector, Error, Event, EventKind, GroupConfig, HandlerPool, HandlerPoolConfig, Link, Server,
    ServerConfig, ServiceHandler, WorkAllocator, WorkHandler,
};

/// Inbound leg: forwards client bytes to the backend leg and answers the
/// client with whatever the backend returned.
struct Inbound {
    connector: Arc<Connector<OutboundAllocator>>,
    backend: Option<Link>,
}

impl WorkHandler for Inbound {
    fn on_bind(&mut self, _handler: &ServiceHandler<Self>) {
        self.backend = None;
    }

    fn on_open(&mut self, handler: &ServiceHandler<Self>) {
        if !self.connector.connect_with_parent(handler) {
            handler.close();
        }
    }

    fn on_set_child(&mut self, _handler: &ServiceHandler<Self>, child: Link) {
        self.backend = Some(child);
    }

    fn on_read(&mut self, handler: &ServiceHandler<Self>, bytes: usize) {
        let Some(backend) = self.backend.as_ref().and_then(Link::peer) else {
            handler.close();
            return;
        };
        {
            let mut staged = backend.write_buffer();
            staged.clear();
            let mut own = handler.read_buffer();
            staged.produce_slice(own.data());
            let drained = own.len();
            own.consume(drained);
        }
        handler.post_child(Event::with_value(EventKind::WriteRead, bytes));
    }

    fn on_write(&mut self, handler: &ServiceHandler<Self>, _bytes: usize) {
        handler.async_read_some();
    }

    fn on_child_event(&mut self, handler: &ServiceHandler<Self>, event: Event) {
        match event.kind {
            EventKind::Open => handler.async_read_some(),
            EventKind::Read => {
                let Some(backend) = self.backend.as_ref().and_then(Link::peer) else {
                    handler.close();
                    return;
                };
                {
                    let mut own = handler.read_buffer();
                    own.clear();
                    let mut reply = backend.read_buffer();
                    own.produce_slice(reply.data());
                    let drained = reply.len();
                    reply.consume(drained);
                }
                handler.async_write(event.value);
            }
            EventKind::Close => {
                self.backend = None;
                handler.close();
            }
            _ => {}
        }
    }

    fn on_close(&mut self, _handler: &ServiceHandler<Self>, _error: Option<Error>) {
        self.backend = None;
    }
}

struct InboundAllocator {
    connector: Arc<Connector<OutboundAllocator>>,
}

impl WorkAllocator for InboundAllocator {
    type Work = Inbound;

    fn make_work(&self) -> Inbound {
        Inbound {
            connector: self.connector.clone(),
            backend: None,
        }
    }
}

/// Outbound leg: writes what the inbound leg staged, reads the backend's
/// reply, and reports both back.
struct Outbound;

impl WorkHandler for Outbound {
    fn on_open(&mut self, handler: &ServiceHandler<Self>) {
        handler.post_parent(Event::new(EventKind::Open));
    }

    fn on_parent_event(&mut self, handler: &ServiceHandler<Self>, event: Event) {
        match event.kind {
            EventKind::Write | EventKind::WriteRead => handler.async_write_all(),
            EventKind::Read => handler.async_read_some(),
            EventKind::Close => handler.close(),
            _ => {}
        }
    }

    fn on_write(&mut self, handler: &ServiceHandler<Self>, bytes: usize) {
        handler.post_parent(Event::with_value(EventKind::Write, bytes));
        handler.async_read_some();
    }

    fn on_read(&mut self, handler: &ServiceHandler<Self>, bytes: usize) {
        handler.post_parent(Event::with_value(EventKind::Read, bytes));
    }

    fn on_close(&mut self, _handler: &ServiceHandler<Self>, _error: Option<Error>) {}
}

struct OutboundAllocator;

impl WorkAllocator for OutboundAllocator {
    type Work = Outbound;

    fn make_work(&self) -> Outbound {
        Outbound
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
    let listen = args
        .next()
        .unwrap_or_else(|| "127.0.0.1:7100".into())
        .parse()
        .expect("invalid listen address");
    let backend = args
        .next()
        .unwrap_or_else(|| "127.0.0.1:7000".into())
        .parse()
        .expect("invalid backend address");

    let mut registry = Registry::default();
    let outbound_pool = HandlerPool::new(
        OutboundAllocator,
        HandlerPoolConfig {
            write_buffer_size: 4096,
            read_buffer_size: 4096,
            ..HandlerPoolConfig::default()
        },
        registry.sub_registry_with_prefix("outbound"),
    );
    let connector = Arc::new(Connector::new(outbound_pool, backend));

    let inbound_pool = HandlerPool::new(
        InboundAllocator { connector },
        HandlerPoolConfig {
            read_buffer_size: 4096,
            ..HandlerPoolConfig::default()
        },
        registry.sub_registry_with_prefix("inbound"),
    );
    let server = Server::new(
        inbound_pool,
        listen,
        GroupConfig::default(),
        ServerConfig::default(),
        &mut registry,
    );

    info!(%listen, %backend, "proxy starting");
    server.run().expect("failed to start proxy");
}
