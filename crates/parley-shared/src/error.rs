use thiserror::Error;

/// Errors produced while framing or parsing the wire protocol.
#[derive(Error, Debug)]
pub enum ProtocolError {
    /// The frame was not valid JSON, or its `message_type` is not a
    /// recognized variant.
    #[error("malformed frame: {0}")]
    Malformed(#[from] serde_json::Error),

    /// A line exceeded the configured frame size limit before a newline
    /// was seen.
    #[error("frame exceeds {max} bytes")]
    Oversized { max: usize },
}
