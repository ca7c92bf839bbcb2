//! Wire protocol messages exchanged between client and server.
//!
//! Every frame is one JSON object on one line, tagged by a `message_type`
//! field and carrying a `timestamp` in Unix seconds. The closed
//! [`WireMessage`] enum means an unhandled message kind is a compile error
//! in the server's dispatch, not a runtime string mismatch.

use serde::{Deserialize, Serialize};

use crate::types::{FileId, GroupId, MessageId, TransferId, UserId};

/// Stable numeric error codes carried in `error_message` frames.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum ErrorCode {
    Ok = 0,
    AuthFailure = 1001,
    UserExists = 1002,
    UserNotFound = 1003,
    GroupNotFound = 1004,
    PermissionDenied = 1005,
    FileNotFound = 1006,
    FileTooLarge = 1007,
    InvalidCommand = 1008,
    Internal = 1009,
    Network = 1010,
}

impl ErrorCode {
    pub fn as_u16(self) -> u16 {
        self as u16
    }
}

/// All wire protocol messages.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "message_type", rename_all = "snake_case")]
pub enum WireMessage {
    LoginRequest(LoginRequest),
    LoginResponse(LoginResponse),
    RegisterRequest(RegisterRequest),
    RegisterResponse(RegisterResponse),
    ChatMessage(ChatMessage),
    UserInfoRequest(UserInfoRequest),
    UserInfoResponse(UserInfoResponse),
    ListUsersRequest(ListUsersRequest),
    ListUsersResponse(ListUsersResponse),
    ListGroupsRequest(ListGroupsRequest),
    ListGroupsResponse(ListGroupsResponse),
    CreateChatRequest(CreateChatRequest),
    CreateChatResponse(CreateChatResponse),
    JoinChatRequest(JoinChatRequest),
    JoinChatResponse(JoinChatResponse),
    LeaveChatRequest(LeaveChatRequest),
    LeaveChatResponse(LeaveChatResponse),
    EnterChatRequest(EnterChatRequest),
    EnterChatResponse(EnterChatResponse),
    BanRequest(BanRequest),
    BanResponse(BanResponse),
    FileUploadRequest(FileUploadRequest),
    FileUploadResponse(FileUploadResponse),
    FileChunk(FileChunk),
    FileDownloadRequest(FileDownloadRequest),
    FileDownloadResponse(FileDownloadResponse),
    CancelTransfer(CancelTransfer),
    SystemMessage(SystemMessage),
    ErrorMessage(ErrorMessage),
}

/// Public view of a user, safe to send over the wire.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct UserSummary {
    pub id: UserId,
    pub username: String,
    pub is_admin: bool,
}

/// Public view of a chat group. "Private" chats are simply groups with
/// two members; there is no mode flag.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct GroupSummary {
    pub id: GroupId,
    pub name: String,
    pub member_count: u32,
}

/// One persisted message, as returned in chat history.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct HistoryEntry {
    pub message_id: MessageId,
    pub sender_id: UserId,
    pub sender_name: String,
    pub content: String,
    pub timestamp: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LoginRequest {
    pub username: String,
    pub password: String,
    pub timestamp: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LoginResponse {
    pub user: UserSummary,
    /// Groups the user is a persisted member of, auto-joined at login.
    pub groups: Vec<GroupSummary>,
    pub timestamp: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RegisterRequest {
    pub username: String,
    pub password: String,
    pub timestamp: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RegisterResponse {
    pub user: UserSummary,
    pub groups: Vec<GroupSummary>,
    pub timestamp: f64,
}

/// A chat message. On the inbound path the server overwrites `message_id`,
/// `sender_id` and `sender_name` from the authenticated session before
/// persisting or delivering anything.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ChatMessage {
    #[serde(default)]
    pub message_id: Option<MessageId>,
    pub group_id: GroupId,
    #[serde(default)]
    pub sender_id: Option<UserId>,
    #[serde(default)]
    pub sender_name: Option<String>,
    pub content: String,
    pub timestamp: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct UserInfoRequest {
    pub username: String,
    pub timestamp: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct UserInfoResponse {
    pub user: UserSummary,
    pub timestamp: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ListUsersRequest {
    pub timestamp: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ListUsersResponse {
    pub users: Vec<UserSummary>,
    pub timestamp: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ListGroupsRequest {
    pub timestamp: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ListGroupsResponse {
    pub groups: Vec<GroupSummary>,
    pub timestamp: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CreateChatRequest {
    pub chat_name: String,
    /// Initial members, added unconditionally regardless of group size.
    #[serde(default)]
    pub member_usernames: Vec<String>,
    pub timestamp: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CreateChatResponse {
    pub group: GroupSummary,
    pub timestamp: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct JoinChatRequest {
    pub group_id: GroupId,
    pub timestamp: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct JoinChatResponse {
    pub group: GroupSummary,
    pub timestamp: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LeaveChatRequest {
    pub group_id: GroupId,
    pub timestamp: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LeaveChatResponse {
    pub group_id: GroupId,
    pub timestamp: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EnterChatRequest {
    pub group_id: GroupId,
    /// Maximum history entries to return; server default applies if absent.
    #[serde(default)]
    pub limit: Option<u32>,
    pub timestamp: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EnterChatResponse {
    pub group: GroupSummary,
    pub history: Vec<HistoryEntry>,
    pub timestamp: f64,
}

/// The subject of a ban request.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "subject_type", rename_all = "snake_case")]
pub enum BanSubject {
    User { username: String },
    Group { group_id: GroupId },
}

/// Admin-only: mute or unmute a user or an entire group.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BanRequest {
    #[serde(flatten)]
    pub subject: BanSubject,
    pub banned: bool,
    pub timestamp: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BanResponse {
    pub timestamp: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FileUploadRequest {
    pub file_name: String,
    pub total_size: u64,
    pub group_id: GroupId,
    pub timestamp: f64,
}

/// "Ready" reply: the server accepted the upload and expects chunks of
/// `chunk_size` bytes (the final chunk may be shorter).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FileUploadResponse {
    pub transfer_id: TransferId,
    pub chunk_size: u32,
    pub timestamp: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FileChunk {
    pub transfer_id: TransferId,
    /// Zero-based chunk index; chunks must arrive in order.
    pub seq: u32,
    #[serde(with = "base64_bytes")]
    pub data: Vec<u8>,
    pub timestamp: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FileDownloadRequest {
    pub file_id: FileId,
    pub timestamp: f64,
}

/// Download metadata; the chunks that follow reference `transfer_id`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FileDownloadResponse {
    pub transfer_id: TransferId,
    pub file_id: FileId,
    pub file_name: String,
    pub total_size: u64,
    pub chunk_size: u32,
    /// BLAKE3 hash of the file content, for client-side verification.
    pub blake3_hex: String,
    pub timestamp: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CancelTransfer {
    pub transfer_id: TransferId,
    #[serde(default)]
    pub reason: Option<String>,
    pub timestamp: f64,
}

/// Server-originated notification (member joined, file available, ...).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SystemMessage {
    #[serde(default)]
    pub group_id: Option<GroupId>,
    pub content: String,
    pub timestamp: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ErrorMessage {
    pub code: u16,
    pub message: String,
    pub timestamp: f64,
}

/// Serialize binary chunk payloads as standard base64 strings, keeping
/// the wire format line-oriented JSON.
mod base64_bytes {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine as _;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let s = String::deserialize(deserializer)?;
        STANDARD.decode(s.as_bytes()).map_err(serde::de::Error::custom)
    }
}
