//! Message routing: the single place where a parsed inbound frame becomes
//! zero or more outgoing deliveries.
//!
//! The dispatch match is exhaustive over [`WireMessage`]; adding a message
//! kind without handling it here is a compile error. Handler errors are
//! converted by the session into one `error_message` reply to the sender —
//! they never terminate the connection.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::time::timeout;
use tracing::{debug, warn};

use parley_shared::protocol::{
    BanResponse, BanSubject, ChatMessage, CreateChatResponse, EnterChatResponse, FileChunk,
    FileUploadRequest, FileUploadResponse, GroupSummary, HistoryEntry, JoinChatResponse,
    LeaveChatResponse, ListGroupsResponse, ListUsersResponse, LoginResponse, RegisterResponse,
    SystemMessage, UserInfoResponse, UserSummary,
};
use parley_shared::types::{GroupId, MessageId};
use parley_shared::{unix_now, WireMessage};
use parley_store::{Group, StoreError, User};

use crate::ai::ai_trigger;
use crate::error::ServerError;
use crate::server::ServerState;
use crate::session::Session;

/// Route one inbound message. Called synchronously from the session's
/// read loop, so one client's requests are handled in the order sent.
pub async fn dispatch(
    state: &Arc<ServerState>,
    session: &mut Session,
    msg: WireMessage,
) -> Result<(), ServerError> {
    if session.user().is_none() && !allowed_unauthenticated(&msg) {
        return Err(ServerError::AuthRequired);
    }

    match msg {
        WireMessage::LoginRequest(req) => {
            login(state, session, &req.username, &req.password)
        }
        WireMessage::RegisterRequest(req) => {
            register(state, session, &req.username, &req.password)
        }
        WireMessage::ChatMessage(msg) => chat_message(state, session, msg),
        WireMessage::UserInfoRequest(req) => user_info(state, session, &req.username),
        WireMessage::ListUsersRequest(_) => list_users(state, session),
        WireMessage::ListGroupsRequest(_) => list_groups(state, session),
        WireMessage::CreateChatRequest(req) => {
            create_chat(state, session, &req.chat_name, &req.member_usernames)
        }
        WireMessage::JoinChatRequest(req) => join_chat(state, session, req.group_id),
        WireMessage::LeaveChatRequest(req) => leave_chat(state, session, req.group_id),
        WireMessage::EnterChatRequest(req) => {
            enter_chat(state, session, req.group_id, req.limit)
        }
        WireMessage::BanRequest(req) => ban(state, session, req.subject, req.banned),
        WireMessage::FileUploadRequest(req) => file_upload(state, session, req).await,
        WireMessage::FileChunk(chunk) => file_chunk(state, session, chunk).await,
        WireMessage::FileDownloadRequest(req) => {
            file_download(state, session, req.file_id).await
        }
        WireMessage::CancelTransfer(req) => {
            cancel_transfer(state, session, req.transfer_id).await
        }

        // Server-to-client message kinds are invalid when sent by a client.
        WireMessage::LoginResponse(_)
        | WireMessage::RegisterResponse(_)
        | WireMessage::UserInfoResponse(_)
        | WireMessage::ListUsersResponse(_)
        | WireMessage::ListGroupsResponse(_)
        | WireMessage::CreateChatResponse(_)
        | WireMessage::JoinChatResponse(_)
        | WireMessage::LeaveChatResponse(_)
        | WireMessage::EnterChatResponse(_)
        | WireMessage::BanResponse(_)
        | WireMessage::FileUploadResponse(_)
        | WireMessage::FileDownloadResponse(_)
        | WireMessage::SystemMessage(_)
        | WireMessage::ErrorMessage(_) => Err(ServerError::BadRequest(
            "unexpected server-to-client message".to_string(),
        )),
    }
}

/// Requests a connection may issue before authenticating: login, register,
/// and a small allow-list of informational queries.
fn allowed_unauthenticated(msg: &WireMessage) -> bool {
    matches!(
        msg,
        WireMessage::LoginRequest(_)
            | WireMessage::RegisterRequest(_)
            | WireMessage::ListUsersRequest(_)
            | WireMessage::UserInfoRequest(_)
    )
}

// ---------------------------------------------------------------------------
// Authentication
// ---------------------------------------------------------------------------

fn login(
    state: &Arc<ServerState>,
    session: &mut Session,
    username: &str,
    password: &str,
) -> Result<(), ServerError> {
    if session.user().is_some() {
        return Err(ServerError::BadRequest("already authenticated".to_string()));
    }

    let user = state
        .storage
        .get_user_by_name(username)
        .map_err(|e| match e {
            // Same reply for unknown user and wrong password.
            StoreError::NotFound => bad_credentials(),
            other => other.into(),
        })?;

    if !state.verifier.verify(password, &user.password_hash) {
        return Err(bad_credentials());
    }

    let (user, groups) = complete_auth(state, session, user)?;
    session.reply(WireMessage::LoginResponse(LoginResponse {
        user,
        groups,
        timestamp: unix_now(),
    }));
    Ok(())
}

fn register(
    state: &Arc<ServerState>,
    session: &mut Session,
    username: &str,
    password: &str,
) -> Result<(), ServerError> {
    if session.user().is_some() {
        return Err(ServerError::BadRequest("already authenticated".to_string()));
    }
    let username = username.trim();
    if username.is_empty() || username.len() > 32 {
        return Err(ServerError::BadRequest(
            "username must be 1-32 characters".to_string(),
        ));
    }
    if password.is_empty() {
        return Err(ServerError::BadRequest("password must not be empty".to_string()));
    }

    let hash = state.verifier.hash_password(password);
    let user = state
        .storage
        .create_user(username, &hash, false)
        .map_err(|e| match e {
            StoreError::AlreadyExists => ServerError::UserExists(username.to_string()),
            other => other.into(),
        })?;

    let (user, groups) = complete_auth(state, session, user)?;
    session.reply(WireMessage::RegisterResponse(RegisterResponse {
        user,
        groups,
        timestamp: unix_now(),
    }));
    Ok(())
}

fn bad_credentials() -> ServerError {
    ServerError::Auth("unknown user or wrong password".to_string())
}

/// Shared tail of login and register: mark the session authenticated,
/// auto-join the default public group plus every persisted membership,
/// and register the session in the live-user directory.
fn complete_auth(
    state: &Arc<ServerState>,
    session: &mut Session,
    user: User,
) -> Result<(UserSummary, Vec<GroupSummary>), ServerError> {
    state.storage.add_member(state.default_group_id, user.id)?;
    let groups = state.storage.list_groups_for_user(user.id)?;

    session.set_authenticated(user.clone());
    let handle = session.handle().clone();
    state.registry.register_user_session(user.id, handle.clone());

    for group in &groups {
        // AlreadyMember can only mean a concurrent join; the live set is
        // already correct then.
        let _ = state.registry.join(group.id, handle.clone());
        session.mark_joined(group.id);
    }

    let summaries = groups
        .iter()
        .map(|g| group_summary(state, g))
        .collect::<Result<Vec<_>, _>>()?;

    debug!(user = %user.username, groups = summaries.len(), "Session authenticated");

    Ok((user_summary(&user), summaries))
}

// ---------------------------------------------------------------------------
// Chat
// ---------------------------------------------------------------------------

fn chat_message(
    state: &Arc<ServerState>,
    session: &mut Session,
    msg: ChatMessage,
) -> Result<(), ServerError> {
    let user = session.require_user()?.clone();
    let group_id = msg.group_id;

    if !state.storage.is_member(group_id, user.id)? {
        return Err(ServerError::Permission(
            "not a member of this group".to_string(),
        ));
    }
    state.gate.can_post(&user, group_id)?;

    let message_id = MessageId::new();
    state
        .storage
        .save_message(message_id, group_id, user.id, &msg.content, Utc::now())?;

    let outbound = WireMessage::ChatMessage(ChatMessage {
        message_id: Some(message_id),
        group_id,
        sender_id: Some(user.id),
        sender_name: Some(user.username.clone()),
        content: msg.content.clone(),
        timestamp: unix_now(),
    });

    // Snapshot, then deliver: the registry lock is long released before
    // any handle is written to. The sender is never echoed.
    for member in state.registry.members(group_id) {
        if member.id() != session.id() {
            member.send(outbound.clone());
        }
    }

    if let Some(prompt) = ai_trigger(&msg.content) {
        spawn_ai_reply(Arc::clone(state), group_id, prompt.to_string());
    }

    Ok(())
}

/// Generate and deliver an AI reply out-of-band. The triggering message
/// has already been persisted and fanned out; nothing here can delay or
/// fail it. Every failure path is logged and swallowed.
fn spawn_ai_reply(state: Arc<ServerState>, group_id: GroupId, prompt: String) {
    tokio::spawn(async move {
        let context = match state.storage.get_history(group_id, 10) {
            Ok(context) => context,
            Err(e) => {
                warn!(group = %group_id, error = %e, "AI context load failed");
                return;
            }
        };

        let reply = match timeout(
            state.config.ai_timeout,
            state.ai.generate_reply(&prompt, &context),
        )
        .await
        {
            Err(_) => {
                warn!(group = %group_id, "AI reply timed out");
                return;
            }
            Ok(Err(e)) => {
                warn!(group = %group_id, error = %e, "AI reply failed");
                return;
            }
            Ok(Ok(reply)) => reply,
        };

        // Same send path as a human message, under the AI identity.
        if let Err(e) = state.gate.can_post(&state.ai_user, group_id) {
            debug!(group = %group_id, error = %e, "AI reply suppressed");
            return;
        }
        let message_id = MessageId::new();
        if let Err(e) =
            state
                .storage
                .save_message(message_id, group_id, state.ai_user.id, &reply, Utc::now())
        {
            warn!(group = %group_id, error = %e, "AI reply not persisted");
            return;
        }

        let outbound = WireMessage::ChatMessage(ChatMessage {
            message_id: Some(message_id),
            group_id,
            sender_id: Some(state.ai_user.id),
            sender_name: Some(state.ai_user.username.clone()),
            content: reply,
            timestamp: unix_now(),
        });
        for member in state.registry.members(group_id) {
            member.send(outbound.clone());
        }
    });
}

// ---------------------------------------------------------------------------
// Queries
// ---------------------------------------------------------------------------

fn user_info(
    state: &Arc<ServerState>,
    session: &Session,
    username: &str,
) -> Result<(), ServerError> {
    let user = state
        .storage
        .get_user_by_name(username)
        .map_err(|e| match e {
            StoreError::NotFound => ServerError::UserNotFound(username.to_string()),
            other => other.into(),
        })?;

    session.reply(WireMessage::UserInfoResponse(UserInfoResponse {
        user: user_summary(&user),
        timestamp: unix_now(),
    }));
    Ok(())
}

fn list_users(state: &Arc<ServerState>, session: &Session) -> Result<(), ServerError> {
    let users = state
        .storage
        .list_users()?
        .iter()
        .map(user_summary)
        .collect();

    session.reply(WireMessage::ListUsersResponse(ListUsersResponse {
        users,
        timestamp: unix_now(),
    }));
    Ok(())
}

fn list_groups(state: &Arc<ServerState>, session: &Session) -> Result<(), ServerError> {
    let user = session.require_user()?;
    let groups = state
        .storage
        .list_groups_for_user(user.id)?
        .iter()
        .map(|g| group_summary(state, g))
        .collect::<Result<Vec<_>, _>>()?;

    session.reply(WireMessage::ListGroupsResponse(ListGroupsResponse {
        groups,
        timestamp: unix_now(),
    }));
    Ok(())
}

// ---------------------------------------------------------------------------
// Group lifecycle
// ---------------------------------------------------------------------------

fn create_chat(
    state: &Arc<ServerState>,
    session: &mut Session,
    chat_name: &str,
    member_usernames: &[String],
) -> Result<(), ServerError> {
    let creator = session.require_user()?.clone();
    let name = chat_name.trim();
    if name.is_empty() || name.len() > 64 {
        return Err(ServerError::BadRequest(
            "chat name must be 1-64 characters".to_string(),
        ));
    }

    // Resolve every initial member before creating anything, so an
    // unknown name cannot leave a half-built group behind.
    let mut initial_members = Vec::new();
    for username in member_usernames {
        if username == &creator.username {
            continue;
        }
        let member = state
            .storage
            .get_user_by_name(username)
            .map_err(|e| match e {
                StoreError::NotFound => ServerError::UserNotFound(username.clone()),
                other => other.into(),
            })?;
        initial_members.push(member);
    }

    let group = state.storage.create_group(name).map_err(|e| match e {
        StoreError::AlreadyExists => {
            ServerError::BadRequest(format!("group name already in use: {name}"))
        }
        other => other.into(),
    })?;

    state.storage.add_member(group.id, creator.id)?;
    let _ = state.registry.join(group.id, session.handle().clone());
    session.mark_joined(group.id);

    // Initial members are added unconditionally — a 2-person private chat
    // and a 20-person room use exactly the same path.
    for member in &initial_members {
        state.storage.add_member(group.id, member.id)?;

        let notice = WireMessage::SystemMessage(SystemMessage {
            group_id: Some(group.id),
            content: format!("{} added you to \"{}\"", creator.username, group.name),
            timestamp: unix_now(),
        });
        for handle in state.registry.sessions_for_user(member.id) {
            let _ = state.registry.join(group.id, handle.clone());
            handle.send(notice.clone());
        }
    }

    session.reply(WireMessage::CreateChatResponse(CreateChatResponse {
        group: group_summary(state, &group)?,
        timestamp: unix_now(),
    }));
    Ok(())
}

fn join_chat(
    state: &Arc<ServerState>,
    session: &mut Session,
    group_id: GroupId,
) -> Result<(), ServerError> {
    let user = session.require_user()?.clone();
    let group = get_group(state, group_id)?;

    if state.storage.is_member(group.id, user.id)? {
        return Err(ServerError::BadRequest(format!(
            "already a member of \"{}\"",
            group.name
        )));
    }

    state.storage.add_member(group.id, user.id)?;
    let _ = state.registry.join(group.id, session.handle().clone());
    session.mark_joined(group.id);

    let notice = WireMessage::SystemMessage(SystemMessage {
        group_id: Some(group.id),
        content: format!("{} joined \"{}\"", user.username, group.name),
        timestamp: unix_now(),
    });
    for member in state.registry.members(group.id) {
        if member.id() != session.id() {
            member.send(notice.clone());
        }
    }

    session.reply(WireMessage::JoinChatResponse(JoinChatResponse {
        group: group_summary(state, &group)?,
        timestamp: unix_now(),
    }));
    Ok(())
}

fn leave_chat(
    state: &Arc<ServerState>,
    session: &mut Session,
    group_id: GroupId,
) -> Result<(), ServerError> {
    let user = session.require_user()?.clone();
    let group = get_group(state, group_id)?;

    if !state.storage.remove_member(group.id, user.id)? {
        return Err(ServerError::BadRequest(format!(
            "not a member of \"{}\"",
            group.name
        )));
    }
    state.registry.leave(group.id, session.id());
    session.mark_left(group.id);

    let notice = WireMessage::SystemMessage(SystemMessage {
        group_id: Some(group.id),
        content: format!("{} left \"{}\"", user.username, group.name),
        timestamp: unix_now(),
    });
    for member in state.registry.members(group.id) {
        member.send(notice.clone());
    }

    session.reply(WireMessage::LeaveChatResponse(LeaveChatResponse {
        group_id: group.id,
        timestamp: unix_now(),
    }));
    Ok(())
}

fn enter_chat(
    state: &Arc<ServerState>,
    session: &mut Session,
    group_id: GroupId,
    limit: Option<u32>,
) -> Result<(), ServerError> {
    let user = session.require_user()?.clone();
    let group = get_group(state, group_id)?;

    if !state.storage.is_member(group.id, user.id)? {
        return Err(ServerError::Permission(
            "not a member of this group".to_string(),
        ));
    }

    // Idempotent for the live set: entering twice is fine.
    let _ = state.registry.join(group.id, session.handle().clone());
    session.mark_joined(group.id);

    let limit = limit.unwrap_or(state.config.history_limit).min(500);
    let history = state
        .storage
        .get_history(group.id, limit)?
        .into_iter()
        .map(|m| HistoryEntry {
            message_id: m.id,
            sender_id: m.sender_id,
            sender_name: m.sender_name,
            content: m.content,
            timestamp: to_wire_ts(m.sent_at),
        })
        .collect();

    session.reply(WireMessage::EnterChatResponse(EnterChatResponse {
        group: group_summary(state, &group)?,
        history,
        timestamp: unix_now(),
    }));
    Ok(())
}

// ---------------------------------------------------------------------------
// Administration
// ---------------------------------------------------------------------------

fn ban(
    state: &Arc<ServerState>,
    session: &Session,
    subject: BanSubject,
    banned: bool,
) -> Result<(), ServerError> {
    let admin = session.require_user()?;
    if !admin.is_admin {
        return Err(ServerError::Permission(
            "admin privileges required".to_string(),
        ));
    }

    match subject {
        BanSubject::User { ref username } => {
            let target = state
                .storage
                .get_user_by_name(username)
                .map_err(|e| match e {
                    StoreError::NotFound => ServerError::UserNotFound(username.clone()),
                    other => other.into(),
                })?;
            state.storage.set_user_ban(target.id, banned)?;
            tracing::info!(
                admin = %admin.username,
                target = %target.username,
                banned,
                "User ban updated"
            );
        }
        BanSubject::Group { group_id } => {
            let group = get_group(state, group_id)?;
            state.storage.set_group_ban(group.id, banned)?;
            tracing::info!(
                admin = %admin.username,
                group = %group.name,
                banned,
                "Group ban updated"
            );
        }
    }

    session.reply(WireMessage::BanResponse(BanResponse {
        timestamp: unix_now(),
    }));
    Ok(())
}

// ---------------------------------------------------------------------------
// File transfer
// ---------------------------------------------------------------------------

async fn file_upload(
    state: &Arc<ServerState>,
    session: &mut Session,
    req: FileUploadRequest,
) -> Result<(), ServerError> {
    let user = session.require_user()?.clone();

    if !state.storage.is_member(req.group_id, user.id)? {
        return Err(ServerError::Permission(
            "not a member of this group".to_string(),
        ));
    }
    // Sharing a file into a group is posting into it.
    state.gate.can_post(&user, req.group_id)?;

    let transfer_id = state
        .transfers
        .begin_upload(
            session.handle(),
            user.id,
            req.group_id,
            &req.file_name,
            req.total_size,
        )
        .await?;

    session.reply(WireMessage::FileUploadResponse(FileUploadResponse {
        transfer_id,
        chunk_size: state.transfers.chunk_size(),
        timestamp: unix_now(),
    }));
    Ok(())
}

async fn file_chunk(
    state: &Arc<ServerState>,
    session: &mut Session,
    chunk: FileChunk,
) -> Result<(), ServerError> {
    let user = session.require_user()?.clone();

    if let Some(record) = state.transfers.handle_chunk(session.id(), chunk).await? {
        // Upload finished: announce the file to the whole group,
        // uploader included, so every client learns the file id.
        let notice = WireMessage::SystemMessage(SystemMessage {
            group_id: Some(record.group_id),
            content: format!(
                "{} shared \"{}\" ({} bytes, file id {})",
                user.username, record.file_name, record.size_bytes, record.id
            ),
            timestamp: unix_now(),
        });
        for member in state.registry.members(record.group_id) {
            member.send(notice.clone());
        }
    }
    Ok(())
}

async fn file_download(
    state: &Arc<ServerState>,
    session: &mut Session,
    file_id: parley_shared::types::FileId,
) -> Result<(), ServerError> {
    let user = session.require_user()?.clone();

    let record = state.storage.get_file(file_id).map_err(|e| match e {
        StoreError::NotFound => ServerError::FileNotFound(file_id.to_string()),
        other => other.into(),
    })?;

    if !state.storage.is_member(record.group_id, user.id)? {
        return Err(ServerError::Permission(
            "not a member of this group".to_string(),
        ));
    }

    state
        .transfers
        .begin_download(session.handle(), user.id, &record)
        .await?;
    Ok(())
}

async fn cancel_transfer(
    state: &Arc<ServerState>,
    session: &mut Session,
    transfer_id: parley_shared::types::TransferId,
) -> Result<(), ServerError> {
    session.require_user()?;
    state.transfers.cancel(session.id(), transfer_id).await?;

    session.reply(WireMessage::SystemMessage(SystemMessage {
        group_id: None,
        content: format!("transfer {transfer_id} cancelled"),
        timestamp: unix_now(),
    }));
    Ok(())
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn get_group(state: &Arc<ServerState>, group_id: GroupId) -> Result<Group, ServerError> {
    state.storage.get_group(group_id).map_err(|e| match e {
        StoreError::NotFound => ServerError::GroupNotFound(group_id.to_string()),
        other => other.into(),
    })
}

fn user_summary(user: &User) -> UserSummary {
    UserSummary {
        id: user.id,
        username: user.username.clone(),
        is_admin: user.is_admin,
    }
}

fn group_summary(state: &Arc<ServerState>, group: &Group) -> Result<GroupSummary, ServerError> {
    Ok(GroupSummary {
        id: group.id,
        name: group.name.clone(),
        member_count: state.storage.member_count(group.id)?,
    })
}

fn to_wire_ts(dt: DateTime<Utc>) -> f64 {
    dt.timestamp_millis() as f64 / 1000.0
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use futures::future::BoxFuture;
    use futures::FutureExt;
    use tempfile::TempDir;
    use tokio::sync::mpsc::UnboundedReceiver;

    use parley_shared::protocol::{
        CreateChatRequest, EnterChatRequest, FileDownloadRequest, JoinChatRequest,
        LeaveChatRequest, ListGroupsRequest, ListUsersRequest, LoginRequest, RegisterRequest,
    };
    use parley_store::{Database, StoredMessage};

    use crate::ai::{CannedReplyGenerator, ReplyGenerator};
    use crate::auth::Blake3Verifier;
    use crate::config::ServerConfig;
    use crate::server::ServerState;
    use crate::session::testing::socketless_session;
    use crate::storage::{SqliteStorage, Storage};

    struct SleepyGenerator;

    impl ReplyGenerator for SleepyGenerator {
        fn generate_reply<'a>(
            &'a self,
            _prompt: &'a str,
            _context: &'a [StoredMessage],
        ) -> BoxFuture<'a, anyhow::Result<String>> {
            async {
                tokio::time::sleep(Duration::from_secs(30)).await;
                Ok("too late".to_string())
            }
            .boxed()
        }
    }

    struct EchoGenerator;

    impl ReplyGenerator for EchoGenerator {
        fn generate_reply<'a>(
            &'a self,
            prompt: &'a str,
            _context: &'a [StoredMessage],
        ) -> BoxFuture<'a, anyhow::Result<String>> {
            let reply = format!("you said: {prompt}");
            async move { Ok(reply) }.boxed()
        }
    }

    async fn state_with_ai(ai: Arc<dyn ReplyGenerator>) -> (Arc<ServerState>, TempDir) {
        let dir = TempDir::new().unwrap();
        let config = ServerConfig {
            file_storage_path: dir.path().to_path_buf(),
            ai_timeout: Duration::from_millis(100),
            chunk_size: 8,
            ..ServerConfig::default()
        };
        let storage: Arc<dyn Storage> =
            Arc::new(SqliteStorage::new(Database::open_in_memory().unwrap()));
        let state = ServerState::initialize(config, storage, ai, Arc::new(Blake3Verifier))
            .await
            .unwrap();
        (state, dir)
    }

    async fn test_state() -> (Arc<ServerState>, TempDir) {
        state_with_ai(Arc::new(CannedReplyGenerator)).await
    }

    /// Register a fresh session and consume its register_response.
    async fn register(
        state: &Arc<ServerState>,
        username: &str,
    ) -> (Session, UnboundedReceiver<WireMessage>) {
        let (mut session, mut rx) = socketless_session();
        dispatch(
            state,
            &mut session,
            WireMessage::RegisterRequest(RegisterRequest {
                username: username.into(),
                password: "pw".into(),
                timestamp: 0.0,
            }),
        )
        .await
        .unwrap();
        match recv(&mut rx).await {
            WireMessage::RegisterResponse(_) => {}
            other => panic!("unexpected reply: {other:?}"),
        }
        (session, rx)
    }

    async fn recv(rx: &mut UnboundedReceiver<WireMessage>) -> WireMessage {
        tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .expect("message within deadline")
            .expect("channel open")
    }

    fn chat_frame(group_id: GroupId, content: &str) -> WireMessage {
        WireMessage::ChatMessage(ChatMessage {
            message_id: None,
            group_id,
            sender_id: None,
            sender_name: None,
            content: content.into(),
            timestamp: 0.0,
        })
    }

    #[tokio::test]
    async fn unauthenticated_requests_are_gated() {
        let (state, _dir) = test_state().await;
        let (mut session, mut rx) = socketless_session();

        // Informational queries are allowed before login.
        dispatch(
            &state,
            &mut session,
            WireMessage::ListUsersRequest(ListUsersRequest { timestamp: 0.0 }),
        )
        .await
        .unwrap();
        assert!(matches!(
            recv(&mut rx).await,
            WireMessage::ListUsersResponse(_)
        ));

        // Chat is not.
        let err = dispatch(&state, &mut session, chat_frame(state.default_group_id, "hi"))
            .await
            .unwrap_err();
        assert!(matches!(err, ServerError::AuthRequired));
    }

    #[tokio::test]
    async fn per_sender_order_is_preserved() {
        let (state, _dir) = test_state().await;
        let (mut alice, _rx) = register(&state, "alice").await;
        let group = state.default_group_id;

        for i in 0..5 {
            dispatch(&state, &mut alice, chat_frame(group, &format!("m{i}")))
                .await
                .unwrap();
        }

        let history = state.storage.get_history(group, 10).unwrap();
        let contents: Vec<_> = history.iter().map(|m| m.content.as_str()).collect();
        assert_eq!(contents, vec!["m0", "m1", "m2", "m3", "m4"]);
        assert!(history.windows(2).all(|w| w[0].seq < w[1].seq));
    }

    #[tokio::test]
    async fn fan_out_reaches_members_but_never_echoes() {
        let (state, _dir) = test_state().await;
        let (mut alice, mut alice_rx) = register(&state, "alice").await;
        let (_bob, mut bob_rx) = register(&state, "bob").await;

        dispatch(&state, &mut alice, chat_frame(state.default_group_id, "hello"))
            .await
            .unwrap();

        match recv(&mut bob_rx).await {
            WireMessage::ChatMessage(msg) => {
                assert_eq!(msg.content, "hello");
                assert_eq!(msg.sender_name.as_deref(), Some("alice"));
                assert!(msg.message_id.is_some());
            }
            other => panic!("unexpected message: {other:?}"),
        }
        assert!(alice_rx.try_recv().is_err(), "sender must not be echoed");
    }

    #[tokio::test]
    async fn non_member_cannot_post() {
        let (state, _dir) = test_state().await;
        let (mut alice, mut alice_rx) = register(&state, "alice").await;
        let (mut bob, _bob_rx) = register(&state, "bob").await;

        dispatch(
            &state,
            &mut alice,
            WireMessage::CreateChatRequest(CreateChatRequest {
                chat_name: "private-corner".into(),
                member_usernames: vec![],
                timestamp: 0.0,
            }),
        )
        .await
        .unwrap();
        let group = match recv(&mut alice_rx).await {
            WireMessage::CreateChatResponse(resp) => resp.group,
            other => panic!("unexpected reply: {other:?}"),
        };

        let err = dispatch(&state, &mut bob, chat_frame(group.id, "let me in"))
            .await
            .unwrap_err();
        assert!(matches!(err, ServerError::Permission(_)));
    }

    #[tokio::test]
    async fn ban_takes_effect_on_the_very_next_message() {
        let (state, _dir) = test_state().await;
        let (mut alice, _rx) = register(&state, "alice").await;
        let group = state.default_group_id;
        let alice_id = alice.user().unwrap().id;

        dispatch(&state, &mut alice, chat_frame(group, "before")).await.unwrap();

        state.storage.set_user_ban(alice_id, true).unwrap();
        let err = dispatch(&state, &mut alice, chat_frame(group, "during"))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("user is muted"));

        // No caching lag after the un-ban either.
        state.storage.set_user_ban(alice_id, false).unwrap();
        dispatch(&state, &mut alice, chat_frame(group, "after")).await.unwrap();

        let history = state.storage.get_history(group, 10).unwrap();
        let contents: Vec<_> = history.iter().map(|m| m.content.as_str()).collect();
        assert_eq!(contents, vec!["before", "after"]);
    }

    #[tokio::test]
    async fn muted_group_rejects_posts() {
        let (state, _dir) = test_state().await;
        let (mut alice, _rx) = register(&state, "alice").await;
        let group = state.default_group_id;

        state.storage.set_group_ban(group, true).unwrap();
        let err = dispatch(&state, &mut alice, chat_frame(group, "anyone?"))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("group is muted"));
    }

    #[tokio::test]
    async fn admin_ban_request_round_trip() {
        let (state, _dir) = test_state().await;
        let (mut bob, _bob_rx) = register(&state, "bob").await;

        // Admin accounts are provisioned out of band.
        let hash = state.verifier.hash_password("pw");
        state.storage.create_user("root", &hash, true).unwrap();

        let (mut admin, mut admin_rx) = socketless_session();
        dispatch(
            &state,
            &mut admin,
            WireMessage::LoginRequest(LoginRequest {
                username: "root".into(),
                password: "pw".into(),
                timestamp: 0.0,
            }),
        )
        .await
        .unwrap();
        assert!(matches!(
            recv(&mut admin_rx).await,
            WireMessage::LoginResponse(_)
        ));

        dispatch(
            &state,
            &mut admin,
            WireMessage::BanRequest(parley_shared::protocol::BanRequest {
                subject: BanSubject::User {
                    username: "bob".into(),
                },
                banned: true,
                timestamp: 0.0,
            }),
        )
        .await
        .unwrap();
        assert!(matches!(recv(&mut admin_rx).await, WireMessage::BanResponse(_)));

        let err = dispatch(&state, &mut bob, chat_frame(state.default_group_id, "hi"))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("user is muted"));

        // Non-admins cannot issue bans.
        let err = dispatch(
            &state,
            &mut bob,
            WireMessage::BanRequest(parley_shared::protocol::BanRequest {
                subject: BanSubject::Group {
                    group_id: state.default_group_id,
                },
                banned: true,
                timestamp: 0.0,
            }),
        )
        .await
        .unwrap_err();
        assert!(err.to_string().contains("admin privileges"));
    }

    /// The documented scenario: initial members are added unconditionally,
    /// regardless of group size — bob never sends join_chat_request.
    #[tokio::test]
    async fn create_chat_adds_initial_members_unconditionally() {
        let (state, _dir) = test_state().await;
        let (mut alice, mut alice_rx) = register(&state, "alice").await;
        let (mut bob, mut bob_rx) = register(&state, "bob").await;

        dispatch(
            &state,
            &mut alice,
            WireMessage::CreateChatRequest(CreateChatRequest {
                chat_name: "t".into(),
                member_usernames: vec!["bob".into()],
                timestamp: 0.0,
            }),
        )
        .await
        .unwrap();

        let group = match recv(&mut alice_rx).await {
            WireMessage::CreateChatResponse(resp) => {
                // Two members: a private chat purely by derivation.
                assert_eq!(resp.group.member_count, 2);
                resp.group
            }
            other => panic!("unexpected reply: {other:?}"),
        };

        // Bob was told, and his live session is already in the fan-out set.
        match recv(&mut bob_rx).await {
            WireMessage::SystemMessage(msg) => {
                assert_eq!(msg.group_id, Some(group.id));
                assert!(msg.content.contains("added you"));
            }
            other => panic!("unexpected message: {other:?}"),
        }

        dispatch(
            &state,
            &mut bob,
            WireMessage::ListGroupsRequest(ListGroupsRequest { timestamp: 0.0 }),
        )
        .await
        .unwrap();
        match recv(&mut bob_rx).await {
            WireMessage::ListGroupsResponse(resp) => {
                assert!(resp.groups.iter().any(|g| g.id == group.id));
            }
            other => panic!("unexpected reply: {other:?}"),
        }

        dispatch(&state, &mut alice, chat_frame(group.id, "welcome"))
            .await
            .unwrap();
        match recv(&mut bob_rx).await {
            WireMessage::ChatMessage(msg) => assert_eq!(msg.content, "welcome"),
            other => panic!("unexpected message: {other:?}"),
        }
    }

    #[tokio::test]
    async fn join_chat_rejects_unknown_group_and_double_join() {
        let (state, _dir) = test_state().await;
        let (mut alice, _rx) = register(&state, "alice").await;

        let err = dispatch(
            &state,
            &mut alice,
            WireMessage::JoinChatRequest(JoinChatRequest {
                group_id: GroupId(9999),
                timestamp: 0.0,
            }),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, ServerError::GroupNotFound(_)));

        // Already a member of the default group via registration.
        let err = dispatch(
            &state,
            &mut alice,
            WireMessage::JoinChatRequest(JoinChatRequest {
                group_id: state.default_group_id,
                timestamp: 0.0,
            }),
        )
        .await
        .unwrap_err();
        assert!(err.to_string().contains("already a member"));
    }

    #[tokio::test]
    async fn leave_chat_removes_membership_and_stops_fan_out() {
        let (state, _dir) = test_state().await;
        let (mut alice, mut alice_rx) = register(&state, "alice").await;
        let (mut bob, mut bob_rx) = register(&state, "bob").await;
        let group = state.default_group_id;
        let bob_id = bob.user().unwrap().id;

        dispatch(
            &state,
            &mut bob,
            WireMessage::LeaveChatRequest(LeaveChatRequest {
                group_id: group,
                timestamp: 0.0,
            }),
        )
        .await
        .unwrap();

        match recv(&mut bob_rx).await {
            WireMessage::LeaveChatResponse(resp) => assert_eq!(resp.group_id, group),
            other => panic!("unexpected reply: {other:?}"),
        }
        match recv(&mut alice_rx).await {
            WireMessage::SystemMessage(msg) => assert!(msg.content.contains("left")),
            other => panic!("unexpected message: {other:?}"),
        }

        assert!(!state.storage.is_member(group, bob_id).unwrap());
        dispatch(&state, &mut alice, chat_frame(group, "gone?")).await.unwrap();
        assert!(bob_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn enter_chat_replays_history() {
        let (state, _dir) = test_state().await;
        let (mut alice, mut alice_rx) = register(&state, "alice").await;
        let group = state.default_group_id;

        for content in ["one", "two", "three"] {
            dispatch(&state, &mut alice, chat_frame(group, content)).await.unwrap();
        }

        dispatch(
            &state,
            &mut alice,
            WireMessage::EnterChatRequest(EnterChatRequest {
                group_id: group,
                limit: Some(2),
                timestamp: 0.0,
            }),
        )
        .await
        .unwrap();

        match recv(&mut alice_rx).await {
            WireMessage::EnterChatResponse(resp) => {
                let contents: Vec<_> =
                    resp.history.iter().map(|m| m.content.as_str()).collect();
                assert_eq!(contents, vec!["two", "three"]);
                assert_eq!(resp.history[0].sender_name, "alice");
            }
            other => panic!("unexpected reply: {other:?}"),
        }
    }

    /// A hung AI collaborator must not delay or suppress the triggering
    /// human message.
    #[tokio::test]
    async fn ai_timeout_never_blocks_the_human_message() {
        let (state, _dir) = state_with_ai(Arc::new(SleepyGenerator)).await;
        let (mut alice, _alice_rx) = register(&state, "alice").await;
        let (_bob, mut bob_rx) = register(&state, "bob").await;
        let group = state.default_group_id;

        dispatch(&state, &mut alice, chat_frame(group, "@ai are you there?"))
            .await
            .unwrap();

        // The human message arrives immediately.
        match recv(&mut bob_rx).await {
            WireMessage::ChatMessage(msg) => {
                assert_eq!(msg.content, "@ai are you there?")
            }
            other => panic!("unexpected message: {other:?}"),
        }

        // Past the AI timeout: no reply ever materializes, and only the
        // human message was persisted.
        tokio::time::sleep(Duration::from_millis(300)).await;
        assert!(bob_rx.try_recv().is_err());
        assert_eq!(state.storage.get_history(group, 10).unwrap().len(), 1);
    }

    #[tokio::test]
    async fn ai_reply_travels_the_full_send_path() {
        let (state, _dir) = state_with_ai(Arc::new(EchoGenerator)).await;
        let (mut alice, mut alice_rx) = register(&state, "alice").await;
        let (_bob, mut bob_rx) = register(&state, "bob").await;
        let group = state.default_group_id;

        dispatch(&state, &mut alice, chat_frame(group, "@ai ping")).await.unwrap();

        // Bob: the human message first, then the assistant's reply.
        match recv(&mut bob_rx).await {
            WireMessage::ChatMessage(msg) => assert_eq!(msg.content, "@ai ping"),
            other => panic!("unexpected message: {other:?}"),
        }
        match recv(&mut bob_rx).await {
            WireMessage::ChatMessage(msg) => {
                assert_eq!(msg.content, "you said: ping");
                assert_eq!(msg.sender_name.as_deref(), Some("assistant"));
                assert_eq!(msg.sender_id, Some(state.ai_user.id));
            }
            other => panic!("unexpected message: {other:?}"),
        }

        // The triggering sender hears the AI (it is not an echo of her own
        // message), and the reply was persisted like any other message.
        match recv(&mut alice_rx).await {
            WireMessage::ChatMessage(msg) => assert_eq!(msg.content, "you said: ping"),
            other => panic!("unexpected message: {other:?}"),
        }
        assert_eq!(state.storage.get_history(group, 10).unwrap().len(), 2);
    }

    #[tokio::test]
    async fn ai_reply_respects_group_mute() {
        let (state, _dir) = state_with_ai(Arc::new(EchoGenerator)).await;
        let (mut admin_session, mut admin_rx) = socketless_session();

        let hash = state.verifier.hash_password("pw");
        state.storage.create_user("root", &hash, true).unwrap();
        dispatch(
            &state,
            &mut admin_session,
            WireMessage::LoginRequest(LoginRequest {
                username: "root".into(),
                password: "pw".into(),
                timestamp: 0.0,
            }),
        )
        .await
        .unwrap();
        let _ = recv(&mut admin_rx).await;

        let group = state.default_group_id;
        state.storage.set_group_ban(group, true).unwrap();

        // Admins may post into a muted group, but the AI reply is gated
        // out; it is logged and swallowed, never an error to the sender.
        dispatch(&state, &mut admin_session, chat_frame(group, "@ai speak"))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(200)).await;

        let history = state.storage.get_history(group, 10).unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].content, "@ai speak");
    }

    /// Upload then download through the router: every byte survives the
    /// round trip and the group hears about the new file.
    #[tokio::test]
    async fn file_round_trip_through_the_router() {
        let (state, _dir) = test_state().await;
        let (mut alice, mut alice_rx) = register(&state, "alice").await;
        let (mut bob, mut bob_rx) = register(&state, "bob").await;
        let group = state.default_group_id;
        let payload = b"chunked file payload that spans several frames";

        dispatch(
            &state,
            &mut alice,
            WireMessage::FileUploadRequest(FileUploadRequest {
                file_name: "notes.txt".into(),
                total_size: payload.len() as u64,
                group_id: group,
                timestamp: 0.0,
            }),
        )
        .await
        .unwrap();
        let (transfer_id, chunk_size) = match recv(&mut alice_rx).await {
            WireMessage::FileUploadResponse(resp) => (resp.transfer_id, resp.chunk_size),
            other => panic!("unexpected reply: {other:?}"),
        };

        for (seq, piece) in payload.chunks(chunk_size as usize).enumerate() {
            dispatch(
                &state,
                &mut alice,
                WireMessage::FileChunk(FileChunk {
                    transfer_id,
                    seq: seq as u32,
                    data: piece.to_vec(),
                    timestamp: 0.0,
                }),
            )
            .await
            .unwrap();
        }

        // Both members, uploader included, hear the announcement.
        let file_id = match recv(&mut bob_rx).await {
            WireMessage::SystemMessage(msg) => {
                assert!(msg.content.contains("notes.txt"));
                let id_str = msg
                    .content
                    .rsplit_once("file id ")
                    .map(|(_, tail)| tail.trim_end_matches(')'))
                    .expect("announcement carries the file id");
                parley_shared::types::FileId(id_str.parse().unwrap())
            }
            other => panic!("unexpected message: {other:?}"),
        };
        assert!(matches!(
            recv(&mut alice_rx).await,
            WireMessage::SystemMessage(_)
        ));

        // Bob downloads it.
        dispatch(
            &state,
            &mut bob,
            WireMessage::FileDownloadRequest(FileDownloadRequest {
                file_id,
                timestamp: 0.0,
            }),
        )
        .await
        .unwrap();

        let total = match recv(&mut bob_rx).await {
            WireMessage::FileDownloadResponse(meta) => {
                assert_eq!(meta.file_name, "notes.txt");
                assert_eq!(
                    meta.blake3_hex,
                    blake3::hash(payload).to_hex().to_string()
                );
                meta.total_size
            }
            other => panic!("unexpected reply: {other:?}"),
        };

        let mut reassembled = Vec::new();
        while (reassembled.len() as u64) < total {
            match recv(&mut bob_rx).await {
                WireMessage::FileChunk(chunk) => reassembled.extend_from_slice(&chunk.data),
                other => panic!("unexpected message: {other:?}"),
            }
        }
        assert_eq!(reassembled, payload);
    }

    #[tokio::test]
    async fn duplicate_registration_is_a_user_exists_error() {
        let (state, _dir) = test_state().await;
        let (_alice, _rx) = register(&state, "alice").await;

        let (mut dup, _dup_rx) = socketless_session();
        let err = dispatch(
            &state,
            &mut dup,
            WireMessage::RegisterRequest(RegisterRequest {
                username: "alice".into(),
                password: "pw".into(),
                timestamp: 0.0,
            }),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, ServerError::UserExists(_)));
    }

    #[tokio::test]
    async fn disconnect_self_heals_the_registry() {
        let (state, _dir) = test_state().await;
        let (mut alice, _alice_rx) = register(&state, "alice").await;
        let (bob, mut bob_rx) = register(&state, "bob").await;
        let group = state.default_group_id;

        // Simulate bob's connection closing.
        state.registry.remove_session(bob.id());
        drop(bob);

        dispatch(&state, &mut alice, chat_frame(group, "anyone home?"))
            .await
            .unwrap();
        assert!(
            bob_rx.try_recv().is_err(),
            "closed session must not receive fan-out"
        );
        assert_eq!(state.registry.members(group).len(), 1);
        assert!(state.registry.is_live_member(group, alice.id()));
    }
}
