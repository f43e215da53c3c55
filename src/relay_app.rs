//! A reverse WebSocket relay that logs everything it forwards.
//!
//! ```text
//! relay [listen] [upstream] [config.json]
//! ```
//!
//! Accepts clients on `listen` (default `127.0.0.1:9000`), proxies each Upgrade request to
//! `upstream` (default `127.0.0.1:8080`), passes the response back, and hands both sockets to a
//! [`ChannelRegistry`] with a [`LoggingObserver`] registered.

use interpose::config::RelayConfig;
use interpose::handshake::{self, HandshakeRecord, HttpHead};
use interpose::observer::LoggingObserver;
use interpose::registry::{self, ChannelRegistry};
use interpose::store::MemorySessionStore;
use std::io::Write;
use std::net::{TcpListener, TcpStream};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

#[derive(Debug, thiserror::Error)]
enum ConnectionError {
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
    #[error("handshake failed: {0}")]
    Handshake(#[from] handshake::Error),
    #[error("relay refused the channel: {0}")]
    Registry(#[from] registry::Error),
}

/// Stands in for the storage collaborator: every handshake is "stored" under a sequence number.
static NEXT_HANDSHAKE_ID: AtomicU64 = AtomicU64::new(1);

fn relay_connection(
    registry: &ChannelRegistry,
    mut client: TcpStream,
    upstream_addr: &str,
) -> Result<(), ConnectionError> {
    let (request, early_frames) = HttpHead::read(&mut client)?;
    let mut upstream = TcpStream::connect(upstream_addr)?;
    upstream.write_all(&request.to_bytes())?;
    upstream.write_all(&early_frames)?;
    upstream.flush()?;

    let (response, prefetched) = HttpHead::read(&mut upstream)?;
    client.write_all(&response.to_bytes())?;
    client.flush()?;

    let record = HandshakeRecord::from_exchange(&request, &response)?;
    record
        .reference
        .mark_stored(NEXT_HANDSHAKE_ID.fetch_add(1, Ordering::Relaxed));
    let channel = registry.add_channel(&record, client, upstream, prefetched)?;
    eprintln!("Channel {} relaying {}", channel.id(), channel.url());
    Ok(())
}

fn main() {
    let mut args = std::env::args().skip(1);
    let listen = args.next().unwrap_or_else(|| "127.0.0.1:9000".to_string());
    let upstream: Arc<str> = args
        .next()
        .unwrap_or_else(|| "127.0.0.1:8080".to_string())
        .into();
    let config = match args.next() {
        Some(path) => RelayConfig::load(&path).expect("Failed to load configuration"),
        None => RelayConfig::default(),
    };

    let registry = Arc::new(
        ChannelRegistry::new(config, Arc::new(MemorySessionStore::new()))
            .expect("Invalid ignore patterns in configuration"),
    );
    registry.add_observer(Arc::new(LoggingObserver::default()));
    let pool = registry.pool().clone();

    let server = TcpListener::bind(&listen).expect("Failed to bind listen address");
    eprintln!("Relaying WebSocket connections from {listen} to {upstream}");
    for stream in server.incoming() {
        match stream {
            Ok(stream) => {
                eprintln!("New connection from {:?}", stream.peer_addr());
                let registry = registry.clone();
                let upstream = upstream.clone();
                let spawned = pool.spawn("interpose::handshake".to_string(), move || {
                    if let Err(e) = relay_connection(&registry, stream, &upstream) {
                        eprintln!("Connection failed: {e}");
                    }
                });
                if let Err(e) = spawned {
                    eprintln!("Failed to start handshake thread: {e}");
                }
            }
            Err(e) => {
                eprintln!("Error: {}", e);
            }
        }
    }
}
