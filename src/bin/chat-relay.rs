//! Development server: in-memory storage, credentials trusted as user ids.
//!
//! ```text
//! RUST_LOG=info CHAT_RELAY_ADDR=127.0.0.1:9090 cargo run --bin chat-relay
//! ```

use std::sync::Arc;

use chat_relay::repository::{MemoryRepository, StaticVerifier};
use chat_relay::server::{ChatServer, ServerConfig};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();

    let bind_addr =
        std::env::var("CHAT_RELAY_ADDR").unwrap_or_else(|_| "127.0.0.1:9090".to_string());
    let config = ServerConfig {
        bind_addr,
        ..ServerConfig::default()
    };

    let repo = Arc::new(MemoryRepository::new());
    let verifier = Arc::new(StaticVerifier::trusting());
    log::warn!("Running with in-memory storage and a trusting verifier — development only");

    let server = ChatServer::new(config, repo, verifier);
    server.run().await
}
