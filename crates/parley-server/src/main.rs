//! # parley-server
//!
//! Multi-user chat server. Clients connect over TCP and speak a
//! newline-delimited JSON protocol to:
//! - **authenticate** (register / login)
//! - **chat** in named groups, including 2-person private chats and a
//!   default public room everyone joins
//! - **transfer files** through the server, chunked over the same
//!   connection as chat traffic
//! - **hear from an AI participant** that answers `@ai` mentions
//!
//! Administrators can mute (ban) individual users or entire groups;
//! bans are enforced on every message.

mod ai;
mod auth;
mod codec;
mod config;
mod error;
mod file_store;
mod gate;
mod registry;
mod router;
mod server;
mod session;
mod storage;
mod transfer;

use std::sync::Arc;

use tracing::info;
use tracing_subscriber::EnvFilter;

use parley_store::Database;

use crate::ai::CannedReplyGenerator;
use crate::auth::Blake3Verifier;
use crate::config::ServerConfig;
use crate::server::{ChatServer, ServerState};
use crate::storage::SqliteStorage;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // -----------------------------------------------------------------------
    // 1. Initialize tracing (respects RUST_LOG env var)
    // -----------------------------------------------------------------------
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info,parley_server=debug")),
        )
        .init();

    info!("Starting Parley chat server v{}", env!("CARGO_PKG_VERSION"));

    // -----------------------------------------------------------------------
    // 2. Load configuration
    // -----------------------------------------------------------------------
    let config = ServerConfig::from_env();
    info!(?config, "Loaded configuration");

    // -----------------------------------------------------------------------
    // 3. Initialize subsystems
    // -----------------------------------------------------------------------
    let db = match &config.db_path {
        Some(path) => Database::open_at(path)?,
        None => Database::new()?,
    };
    let storage = Arc::new(SqliteStorage::new(db));

    let state = ServerState::initialize(
        config,
        storage,
        Arc::new(CannedReplyGenerator),
        Arc::new(Blake3Verifier),
    )
    .await
    .map_err(|e| anyhow::anyhow!("server bootstrap failed: {e}"))?;

    // -----------------------------------------------------------------------
    // 4. Spawn background tasks
    // -----------------------------------------------------------------------
    state.spawn_transfer_reaper();

    // -----------------------------------------------------------------------
    // 5. Run the accept loop (blocks until shutdown)
    // -----------------------------------------------------------------------
    let server = ChatServer::bind(Arc::clone(&state)).await?;

    tokio::select! {
        result = server.run() => {
            if let Err(e) = result {
                tracing::error!(error = %e, "Server failed");
                return Err(e);
            }
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Received Ctrl+C, shutting down");
        }
    }

    Ok(())
}
