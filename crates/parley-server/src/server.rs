//! Server wiring: shared state, bootstrap, and the accept loop.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use parley_shared::protocol::{ErrorCode, ErrorMessage};
use parley_shared::types::GroupId;
use parley_shared::{unix_now, WireMessage};
use parley_store::{StoreError, User};

use crate::ai::{ReplyGenerator, AI_USERNAME};
use crate::auth::{unusable_hash, CredentialVerifier};
use crate::codec::LineCodec;
use crate::config::ServerConfig;
use crate::error::ServerError;
use crate::file_store::FileStore;
use crate::gate::PermissionGate;
use crate::registry::GroupRegistry;
use crate::session::Session;
use crate::storage::Storage;
use crate::transfer::TransferCoordinator;

/// Everything shared across connection tasks.
pub struct ServerState {
    pub config: ServerConfig,
    pub storage: Arc<dyn Storage>,
    pub registry: GroupRegistry,
    pub gate: PermissionGate,
    pub transfers: Arc<TransferCoordinator>,
    pub ai: Arc<dyn ReplyGenerator>,
    pub verifier: Arc<dyn CredentialVerifier>,
    /// Identity the AI participant posts under. Created at bootstrap with
    /// an unusable password hash.
    pub ai_user: User,
    /// The public group every user is joined to at login.
    pub default_group_id: GroupId,
}

impl ServerState {
    /// Build shared state and make sure the fixed records (default public
    /// group, AI identity) exist.
    pub async fn initialize(
        config: ServerConfig,
        storage: Arc<dyn Storage>,
        ai: Arc<dyn ReplyGenerator>,
        verifier: Arc<dyn CredentialVerifier>,
    ) -> Result<Arc<Self>, ServerError> {
        let files = FileStore::new(config.file_storage_path.clone()).await?;

        let default_group = match storage.get_group_by_name(&config.default_group) {
            Ok(group) => group,
            Err(StoreError::NotFound) => {
                info!(name = %config.default_group, "Creating default public group");
                storage.create_group(&config.default_group)?
            }
            Err(e) => return Err(e.into()),
        };

        let ai_user = match storage.get_user_by_name(AI_USERNAME) {
            Ok(user) => user,
            Err(StoreError::NotFound) => {
                info!(name = AI_USERNAME, "Creating AI participant identity");
                storage.create_user(AI_USERNAME, &unusable_hash(), false)?
            }
            Err(e) => return Err(e.into()),
        };

        let transfers = Arc::new(TransferCoordinator::new(
            files,
            Arc::clone(&storage),
            config.max_file_size,
            config.chunk_size,
            config.transfer_idle,
        ));
        let gate = PermissionGate::new(Arc::clone(&storage), ai_user.id);

        Ok(Arc::new(Self {
            config,
            storage,
            registry: GroupRegistry::new(),
            gate,
            transfers,
            ai,
            verifier,
            ai_user,
            default_group_id: default_group.id,
        }))
    }

    /// Periodically cancel transfers that stopped making progress. The
    /// owning connections stay up; only the transfer slot is reclaimed.
    pub fn spawn_transfer_reaper(self: &Arc<Self>) -> JoinHandle<()> {
        let state = Arc::clone(self);
        let period = (state.config.transfer_idle / 2).max(Duration::from_secs(1));
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            loop {
                interval.tick().await;
                state.transfers.reap_idle().await;
            }
        })
    }
}

/// TCP listener: accepts connections and spawns one session task each.
pub struct ChatServer {
    state: Arc<ServerState>,
    listener: TcpListener,
}

impl ChatServer {
    pub async fn bind(state: Arc<ServerState>) -> anyhow::Result<Self> {
        let listener = TcpListener::bind(state.config.bind_addr).await?;
        info!(addr = %listener.local_addr()?, "Listening");
        Ok(Self { state, listener })
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    pub async fn run(self) -> anyhow::Result<()> {
        let semaphore = Arc::new(Semaphore::new(self.state.config.max_connections));

        loop {
            let (stream, peer) = self.listener.accept().await?;

            match Arc::clone(&semaphore).try_acquire_owned() {
                Ok(permit) => {
                    let state = Arc::clone(&self.state);
                    tokio::spawn(async move {
                        Session::run(stream, peer, state).await;
                        drop(permit);
                    });
                }
                Err(_) => {
                    warn!(peer = %peer, "Connection limit reached, refusing");
                    tokio::spawn(refuse(stream));
                }
            }
        }
    }
}

/// Tell an over-limit client why it is being dropped, then close.
async fn refuse(mut stream: TcpStream) {
    let msg = WireMessage::ErrorMessage(ErrorMessage {
        code: ErrorCode::Network.as_u16(),
        message: "server is at capacity".to_string(),
        timestamp: unix_now(),
    });
    if let Ok(bytes) = LineCodec::encode(&msg) {
        let _ = stream.write_all(&bytes).await;
    }
    let _ = stream.shutdown().await;
}
