//! Newline-delimited JSON framing.
//!
//! TCP gives no message boundaries: one logical frame may arrive split
//! across many reads, and one read may carry many frames. [`LineCodec`]
//! buffers fed bytes and only yields a message once a full
//! `\n`-terminated line is available, so callers never see a partial
//! frame regardless of how the stream is fragmented.

use bytes::{Buf, BytesMut};

use parley_shared::{ProtocolError, WireMessage};

/// Incremental decoder for one connection's inbound byte stream.
pub struct LineCodec {
    buf: BytesMut,
    max_frame: usize,
    /// Set after an oversized line: drop bytes until the next newline.
    discarding: bool,
}

impl LineCodec {
    pub fn new(max_frame: usize) -> Self {
        Self {
            buf: BytesMut::with_capacity(4096),
            max_frame,
            discarding: false,
        }
    }

    /// Append raw bytes read from the socket.
    pub fn feed(&mut self, data: &[u8]) {
        self.buf.extend_from_slice(data);
    }

    /// Decode the next complete frame, if one is buffered.
    ///
    /// `Ok(None)` means more bytes are needed. An `Err` consumes the bad
    /// line (or marks it for discarding) and leaves the codec usable for
    /// subsequent frames.
    pub fn decode_next(&mut self) -> Result<Option<WireMessage>, ProtocolError> {
        loop {
            if self.discarding {
                match find_newline(&self.buf) {
                    Some(idx) => {
                        self.buf.advance(idx + 1);
                        self.discarding = false;
                    }
                    None => {
                        self.buf.clear();
                        return Ok(None);
                    }
                }
                continue;
            }

            match find_newline(&self.buf) {
                Some(idx) => {
                    let line = self.buf.split_to(idx + 1);
                    let mut frame = &line[..idx];
                    if frame.ends_with(b"\r") {
                        frame = &frame[..frame.len() - 1];
                    }
                    if frame.iter().all(u8::is_ascii_whitespace) {
                        continue; // tolerate blank lines
                    }
                    return serde_json::from_slice::<WireMessage>(frame)
                        .map(Some)
                        .map_err(ProtocolError::from);
                }
                None => {
                    if self.buf.len() > self.max_frame {
                        self.discarding = true;
                        return Err(ProtocolError::Oversized {
                            max: self.max_frame,
                        });
                    }
                    return Ok(None);
                }
            }
        }
    }

    /// Encode one message as a `\n`-terminated JSON line.
    pub fn encode(msg: &WireMessage) -> Result<Vec<u8>, ProtocolError> {
        let mut bytes = serde_json::to_vec(msg)?;
        bytes.push(b'\n');
        Ok(bytes)
    }
}

fn find_newline(buf: &[u8]) -> Option<usize> {
    buf.iter().position(|&b| b == b'\n')
}
