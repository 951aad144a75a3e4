//! Livecode relay: fans editor updates out to the other sockets of a room.
//!
//! Usage: `livecode-relay [BIND_ADDR]` (default `127.0.0.1:5000`).
//! Clients connect to `ws://BIND_ADDR/<room-id>`. Log level via `RUST_LOG`.

use log::{error, info};

use livecode_sync::server::{RelayConfig, RelayServer};

fn config_from_args(mut args: impl Iterator<Item = String>) -> RelayConfig {
    let mut config = RelayConfig::default();
    if let Some(addr) = args.next() {
        config.bind_addr = addr;
    }
    config
}

#[tokio::main]
async fn main() {
    env_logger::init();

    let config = config_from_args(std::env::args().skip(1));
    info!(
        "Starting relay on {} (room capacity {}, {} peers max)",
        config.bind_addr, config.broadcast_capacity, config.max_peers_per_room
    );

    let server = RelayServer::new(config);
    if let Err(e) = server.run().await {
        error!("Relay stopped: {e}");
        std::process::exit(1);
    }
}
