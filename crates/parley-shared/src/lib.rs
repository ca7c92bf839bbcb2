//! # parley-shared
//!
//! Types shared between the Parley server and its clients: the wire
//! protocol messages, id newtypes, and the protocol error taxonomy.

pub mod error;
pub mod protocol;
pub mod types;

pub use error::ProtocolError;
pub use protocol::{ErrorCode, WireMessage};
pub use types::{FileId, GroupId, MessageId, TransferId, UserId};

use std::time::{SystemTime, UNIX_EPOCH};

/// Current time as Unix seconds, the timestamp format carried on every
/// wire frame.
pub fn unix_now() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs_f64()
}
