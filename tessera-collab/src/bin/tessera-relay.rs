//! Standalone relay: `tessera-relay [addr]`
//!
//! Log level via `RUST_LOG` (defaults to `info`).

use tessera_collab::{RelayConfig, RelayServer};

#[tokio::main]
async fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let config = match std::env::args().nth(1) {
        Some(bind_addr) => RelayConfig {
            bind_addr,
            ..RelayConfig::default()
        },
        None => RelayConfig::default(),
    };

    let server = RelayServer::new(config);
    if let Err(e) = server.run().await {
        log::error!("Relay stopped: {e}");
        std::process::exit(1);
    }
}
