//! Per-connection session state and I/O loops.
//!
//! Each accepted connection gets one task running [`Session::run`]: a
//! blocking read loop that decodes frames and hands them to the router
//! synchronously, so one client's messages are processed in the order
//! sent. Outbound traffic — including broadcasts originating from other
//! sessions — goes through the [`SessionHandle`] channel and is written
//! by a dedicated writer task, so concurrent senders can never interleave
//! bytes on the wire.

use std::collections::HashSet;
use std::net::SocketAddr;
use std::sync::{Arc, RwLock};

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::time::timeout;
use tracing::{debug, info, warn};
use uuid::Uuid;

use parley_shared::protocol::{ErrorMessage, UserSummary};
use parley_shared::types::GroupId;
use parley_shared::{unix_now, WireMessage};
use parley_store::User;

use crate::codec::LineCodec;
use crate::error::ServerError;
use crate::router;
use crate::server::ServerState;

/// Opaque identifier for one live connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SessionId(Uuid);

impl SessionId {
    fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl std::fmt::Display for SessionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Cloneable write-side reference to a session.
///
/// This is the only thing other components ever hold: they can enqueue
/// outbound messages and read the authenticated identity, nothing more.
/// All other session state is owned by the connection task.
#[derive(Clone)]
pub struct SessionHandle {
    id: SessionId,
    user: Arc<RwLock<Option<UserSummary>>>,
    outbound: mpsc::UnboundedSender<WireMessage>,
}

impl SessionHandle {
    pub fn id(&self) -> SessionId {
        self.id
    }

    /// Enqueue a message for delivery. Returns `false` if the session has
    /// closed; callers treat that as a skipped recipient, not an error.
    pub fn send(&self, msg: WireMessage) -> bool {
        self.outbound.send(msg).is_ok()
    }

    /// Authenticated identity, if any.
    pub fn user(&self) -> Option<UserSummary> {
        self.user.read().expect("session user lock poisoned").clone()
    }

    fn set_user(&self, summary: UserSummary) {
        *self.user.write().expect("session user lock poisoned") = Some(summary);
    }
}

/// State owned by the connection task.
pub struct Session {
    handle: SessionHandle,
    peer: SocketAddr,
    /// Resolved account after login/register; ban flags on this copy are
    /// a snapshot — the gate re-reads ban state per message.
    user: Option<User>,
    joined_groups: HashSet<GroupId>,
    strikes: u32,
}

impl Session {
    fn new(handle: SessionHandle, peer: SocketAddr) -> Self {
        Self {
            handle,
            peer,
            user: None,
            joined_groups: HashSet::new(),
            strikes: 0,
        }
    }

    pub fn id(&self) -> SessionId {
        self.handle.id()
    }

    pub fn handle(&self) -> &SessionHandle {
        &self.handle
    }

    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    pub fn user(&self) -> Option<&User> {
        self.user.as_ref()
    }

    /// The authenticated user, or the error every gated request maps to.
    pub fn require_user(&self) -> Result<&User, ServerError> {
        self.user.as_ref().ok_or(ServerError::AuthRequired)
    }

    /// Record a successful login on this session.
    pub fn set_authenticated(&mut self, user: User) {
        self.handle.set_user(UserSummary {
            id: user.id,
            username: user.username.clone(),
            is_admin: user.is_admin,
        });
        self.user = Some(user);
    }

    pub fn joined_groups(&self) -> &HashSet<GroupId> {
        &self.joined_groups
    }

    pub fn mark_joined(&mut self, group_id: GroupId) {
        self.joined_groups.insert(group_id);
    }

    pub fn mark_left(&mut self, group_id: GroupId) {
        self.joined_groups.remove(&group_id);
    }

    /// Send a message to this session's own client.
    pub fn reply(&self, msg: WireMessage) {
        self.handle.send(msg);
    }

    fn reply_error(&self, err: &ServerError) {
        self.reply(WireMessage::ErrorMessage(ErrorMessage {
            code: err.code().as_u16(),
            message: err.client_message(),
            timestamp: unix_now(),
        }));
    }

    /// Run the session to completion. Consumes the socket; returns once
    /// the connection is closed and cleanup may begin.
    pub async fn run(stream: TcpStream, peer: SocketAddr, state: Arc<ServerState>) {
        let (read_half, write_half) = stream.into_split();
        let (tx, rx) = mpsc::unbounded_channel();

        let handle = SessionHandle {
            id: SessionId::new(),
            user: Arc::new(RwLock::new(None)),
            outbound: tx,
        };
        let session_id = handle.id();

        let writer = tokio::spawn(write_loop(write_half, rx));

        info!(session = %session_id, peer = %peer, "Connection accepted");

        let mut session = Session::new(handle, peer);
        session.read_loop(read_half, &state).await;

        // Closed: self-heal every shared view of this session.
        state.registry.remove_session(session_id);
        state.transfers.cancel_for_session(session_id).await;
        drop(session); // drops the last inbound-side sender
        let _ = writer.await;

        info!(session = %session_id, peer = %peer, "Connection closed");
    }

    async fn read_loop(&mut self, mut reader: OwnedReadHalf, state: &Arc<ServerState>) {
        let mut codec = LineCodec::new(state.config.max_frame_bytes);
        let mut chunk = vec![0u8; 4096];

        loop {
            let n = match timeout(state.config.idle_timeout, reader.read(&mut chunk)).await {
                Err(_) => {
                    info!(session = %self.id(), "Idle timeout, closing connection");
                    return;
                }
                Ok(Ok(0)) => {
                    debug!(session = %self.id(), "EOF from client");
                    return;
                }
                Ok(Ok(n)) => n,
                Ok(Err(e)) => {
                    warn!(session = %self.id(), error = %e, "Socket read error");
                    return;
                }
            };

            codec.feed(&chunk[..n]);

            loop {
                match codec.decode_next() {
                    Ok(Some(msg)) => {
                        self.strikes = 0;
                        if let Err(e) = router::dispatch(state, self, msg).await {
                            if matches!(e, ServerError::Internal(_)) {
                                warn!(session = %self.id(), error = %e, "Request failed");
                            } else {
                                debug!(session = %self.id(), error = %e, "Request rejected");
                            }
                            self.reply_error(&e);
                        }
                    }
                    Ok(None) => break,
                    Err(e) => {
                        self.strikes += 1;
                        warn!(
                            session = %self.id(),
                            strikes = self.strikes,
                            error = %e,
                            "Malformed frame"
                        );
                        self.reply_error(&ServerError::Protocol(e));
                        if self.strikes >= state.config.protocol_strikes {
                            warn!(session = %self.id(), "Too many malformed frames, closing");
                            return;
                        }
                    }
                }
            }
        }
    }
}

/// Drain the outbound channel onto the socket. Exits when the channel
/// closes (session dropped) or the peer stops accepting writes.
async fn write_loop(
    mut writer: OwnedWriteHalf,
    mut rx: mpsc::UnboundedReceiver<WireMessage>,
) {
    while let Some(msg) = rx.recv().await {
        let bytes = match LineCodec::encode(&msg) {
            Ok(bytes) => bytes,
            Err(e) => {
                warn!(error = %e, "Failed to encode outbound frame");
                continue;
            }
        };
        if let Err(e) = writer.write_all(&bytes).await {
            debug!(error = %e, "Socket write error, stopping writer");
            break;
        }
    }
    let _ = writer.shutdown().await;
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;

    /// A handle detached from any socket; messages land in the returned
    /// receiver. Used by registry/router tests.
    pub(crate) fn loopback_handle() -> (SessionHandle, mpsc::UnboundedReceiver<WireMessage>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let handle = SessionHandle {
            id: SessionId::new(),
            user: Arc::new(RwLock::new(None)),
            outbound: tx,
        };
        (handle, rx)
    }

    /// A full session without a socket, for driving the router directly.
    pub(crate) fn socketless_session() -> (Session, mpsc::UnboundedReceiver<WireMessage>) {
        let (handle, rx) = loopback_handle();
        let peer = "127.0.0.1:0".parse().expect("static addr");
        (Session::new(handle, peer), rx)
    }
}
