use parley_shared::protocol::ErrorCode;
use parley_shared::ProtocolError;
use parley_store::StoreError;
use thiserror::Error;

/// Errors surfaced while handling one client request.
///
/// Every variant maps to a stable numeric [`ErrorCode`]; the session turns
/// the error into a single `error_message` reply to the sender. None of
/// these terminate a connection — only transport failures do that.
#[derive(Debug, Error)]
pub enum ServerError {
    #[error("Malformed frame: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("Authentication required")]
    AuthRequired,

    #[error("Authentication failed: {0}")]
    Auth(String),

    #[error("Username already taken: {0}")]
    UserExists(String),

    #[error("User not found: {0}")]
    UserNotFound(String),

    #[error("Group not found: {0}")]
    GroupNotFound(String),

    #[error("File not found: {0}")]
    FileNotFound(String),

    #[error("Permission denied: {0}")]
    Permission(String),

    #[error("File too large: {size} bytes (max {max})")]
    FileTooLarge { size: u64, max: u64 },

    #[error("Transfer error: {0}")]
    Transfer(String),

    #[error("Invalid request: {0}")]
    BadRequest(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl ServerError {
    /// The wire error code for this error.
    pub fn code(&self) -> ErrorCode {
        match self {
            ServerError::Protocol(_) => ErrorCode::InvalidCommand,
            ServerError::AuthRequired => ErrorCode::AuthFailure,
            ServerError::Auth(_) => ErrorCode::AuthFailure,
            ServerError::UserExists(_) => ErrorCode::UserExists,
            ServerError::UserNotFound(_) => ErrorCode::UserNotFound,
            ServerError::GroupNotFound(_) => ErrorCode::GroupNotFound,
            ServerError::FileNotFound(_) => ErrorCode::FileNotFound,
            ServerError::Permission(_) => ErrorCode::PermissionDenied,
            ServerError::FileTooLarge { .. } => ErrorCode::FileTooLarge,
            ServerError::Transfer(_) => ErrorCode::InvalidCommand,
            ServerError::BadRequest(_) => ErrorCode::InvalidCommand,
            ServerError::Internal(_) => ErrorCode::Internal,
        }
    }

    /// The message text sent to the client. Internal errors are reported
    /// generically; the detail stays in the server log.
    pub fn client_message(&self) -> String {
        match self {
            ServerError::Internal(_) => "Internal server error".to_string(),
            other => other.to_string(),
        }
    }
}

/// Collaborator failures that are not a specific not-found/conflict case
/// handled at the call site degrade to a generic internal error.
impl From<StoreError> for ServerError {
    fn from(e: StoreError) -> Self {
        ServerError::Internal(e.to_string())
    }
}

impl From<std::io::Error> for ServerError {
    fn from(e: std::io::Error) -> Self {
        ServerError::Internal(e.to_string())
    }
}
