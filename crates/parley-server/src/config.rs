//! Server configuration loaded from environment variables.
//!
//! All settings have sensible defaults so the server can start with zero
//! configuration for local development.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// TCP socket address to listen on.
    /// Env: `BIND_ADDR`
    /// Default: `127.0.0.1:7600`
    pub bind_addr: SocketAddr,

    /// Maximum number of concurrent client connections.
    /// Env: `MAX_CONNECTIONS`
    /// Default: `256`
    pub max_connections: usize,

    /// Connections idle longer than this are closed.
    /// Env: `IDLE_TIMEOUT_SECS`
    /// Default: `300`
    pub idle_timeout: Duration,

    /// Maximum bytes one wire frame (one line) may occupy.
    /// Env: `MAX_FRAME_BYTES`
    /// Default: `262144` (256 KiB)
    pub max_frame_bytes: usize,

    /// Consecutive malformed frames tolerated before the connection is
    /// dropped.
    /// Env: `PROTOCOL_STRIKES`
    /// Default: `5`
    pub protocol_strikes: u32,

    /// Maximum accepted upload size in bytes.
    /// Env: `MAX_FILE_SIZE`
    /// Default: `52428800` (50 MiB)
    pub max_file_size: u64,

    /// Chunk size for file transfers, in bytes.
    /// Env: `CHUNK_SIZE`
    /// Default: `65536` (64 KiB)
    pub chunk_size: u32,

    /// Transfers with no chunk activity for this long are cancelled.
    /// The owning connection is unaffected.
    /// Env: `TRANSFER_IDLE_SECS`
    /// Default: `60`
    pub transfer_idle: Duration,

    /// Upper bound on one AI reply generation.
    /// Env: `AI_TIMEOUT_SECS`
    /// Default: `10`
    pub ai_timeout: Duration,

    /// SQLite database file. Empty means the platform data directory.
    /// Env: `DB_PATH`
    pub db_path: Option<PathBuf>,

    /// Directory for staged and completed file uploads.
    /// Env: `FILE_STORAGE_PATH`
    /// Default: `./files`
    pub file_storage_path: PathBuf,

    /// Name of the public group every user joins at login.
    /// Env: `DEFAULT_GROUP`
    /// Default: `lobby`
    pub default_group: String,

    /// History entries returned by `enter_chat_request` when the client
    /// does not ask for a specific limit.
    /// Env: `HISTORY_LIMIT`
    /// Default: `50`
    pub history_limit: u32,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: ([127, 0, 0, 1], 7600).into(),
            max_connections: 256,
            idle_timeout: Duration::from_secs(300),
            max_frame_bytes: 256 * 1024,
            protocol_strikes: 5,
            max_file_size: 50 * 1024 * 1024, // 50 MiB
            chunk_size: 64 * 1024,
            transfer_idle: Duration::from_secs(60),
            ai_timeout: Duration::from_secs(10),
            db_path: None,
            file_storage_path: PathBuf::from("./files"),
            default_group: "lobby".to_string(),
            history_limit: 50,
        }
    }
}

impl ServerConfig {
    /// Load configuration from environment variables, falling back to
    /// defaults.
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Ok(addr) = std::env::var("BIND_ADDR") {
            if let Ok(parsed) = addr.parse::<SocketAddr>() {
                config.bind_addr = parsed;
            } else {
                tracing::warn!(value = %addr, "Invalid BIND_ADDR, using default");
            }
        }

        if let Some(n) = env_usize("MAX_CONNECTIONS") {
            config.max_connections = n;
        }

        if let Some(secs) = env_u64("IDLE_TIMEOUT_SECS") {
            config.idle_timeout = Duration::from_secs(secs);
        }

        if let Some(n) = env_usize("MAX_FRAME_BYTES") {
            config.max_frame_bytes = n;
        }

        if let Some(n) = env_u64("PROTOCOL_STRIKES") {
            config.protocol_strikes = n as u32;
        }

        if let Some(n) = env_u64("MAX_FILE_SIZE") {
            config.max_file_size = n;
        }

        if let Some(n) = env_u64("CHUNK_SIZE") {
            config.chunk_size = n as u32;
        }

        if let Some(secs) = env_u64("TRANSFER_IDLE_SECS") {
            config.transfer_idle = Duration::from_secs(secs);
        }

        if let Some(secs) = env_u64("AI_TIMEOUT_SECS") {
            config.ai_timeout = Duration::from_secs(secs);
        }

        if let Ok(path) = std::env::var("DB_PATH") {
            if !path.is_empty() {
                config.db_path = Some(PathBuf::from(path));
            }
        }

        if let Ok(path) = std::env::var("FILE_STORAGE_PATH") {
            config.file_storage_path = PathBuf::from(path);
        }

        if let Ok(name) = std::env::var("DEFAULT_GROUP") {
            if !name.is_empty() {
                config.default_group = name;
            }
        }

        if let Some(n) = env_u64("HISTORY_LIMIT") {
            config.history_limit = n as u32;
        }

        // RUST_LOG is handled directly by tracing-subscriber's EnvFilter,
        // so we do not store it here.

        config
    }
}

fn env_u64(key: &str) -> Option<u64> {
    let value = std::env::var(key).ok()?;
    match value.parse::<u64>() {
        Ok(n) => Some(n),
        Err(_) => {
            tracing::warn!(key, value = %value, "Invalid numeric setting, using default");
            None
        }
    }
}

fn env_usize(key: &str) -> Option<usize> {
    env_u64(key).map(|n| n as usize)
}
