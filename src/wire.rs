//! Binary wire format: ordinal envelope encoding and length-prefixed framing.
//!
//! # Frame format
//!
//! ```text
//! [length: 4 bytes (u32, little-endian)]   // body length, excludes itself
//! [envelope body: length bytes]
//! ```
//!
//! # Envelope body format (ordinal; field position is identity)
//!
//! ```text
//! [id_len: 4 (u32)] [id: UTF-8]
//! [method_len: 4]   [method_name: UTF-8]
//! [payload_len: 4]  [payload: bytes]
//! [is_error: 1]                            // 0 or 1
//! [header_count: 4]
//!   repeated: [key_len:4][key][value_len:4][value]
//! [interface_len: 4] [interface_name: UTF-8]
//! ```
//!
//! All integers are little-endian. Strings are length-prefixed UTF-8.
//! Decoding is resumable: [`FrameDecoder`] buffers partial reads and yields
//! one envelope per complete frame.

use std::collections::HashMap;

use crate::envelope::Envelope;
use crate::error::WireError;

/// Maximum envelope body size: 1 MiB.
///
/// Frames claiming more than this are rejected before allocation.
pub const MAX_FRAME_SIZE: usize = 1024 * 1024;

/// Size of the frame length prefix.
pub const LENGTH_PREFIX_SIZE: usize = 4;

/// Encode an envelope body in ordinal order (no frame prefix).
pub fn encode_envelope(envelope: &Envelope) -> Result<Vec<u8>, WireError> {
    let mut buf = Vec::with_capacity(128 + envelope.payload.len());

    write_str(&mut buf, &envelope.id);
    write_str(&mut buf, &envelope.method_name);
    write_bytes(&mut buf, &envelope.payload);
    buf.push(u8::from(envelope.is_error));

    buf.extend_from_slice(&(envelope.headers.len() as u32).to_le_bytes());
    for (key, value) in &envelope.headers {
        write_str(&mut buf, key);
        write_str(&mut buf, value);
    }

    write_str(&mut buf, &envelope.interface_name);

    if buf.len() > MAX_FRAME_SIZE {
        return Err(WireError::FrameTooLarge {
            size: buf.len(),
            max: MAX_FRAME_SIZE,
        });
    }
    Ok(buf)
}

/// Decode one envelope body. The body must be consumed exactly.
pub fn decode_envelope(body: &[u8]) -> Result<Envelope, WireError> {
    let mut pos = 0usize;

    let id = read_str(body, &mut pos, "id")?;
    let method_name = read_str(body, &mut pos, "method_name")?;
    let payload = read_bytes(body, &mut pos, "payload")?.to_vec();
    let is_error = read_u8(body, &mut pos, "is_error")? != 0;

    let header_count = read_u32(body, &mut pos, "header_count")? as usize;
    // The count is untrusted; cap preallocation by what the remaining bytes
    // could actually hold (a header is at least two length prefixes).
    let remaining = body.len().saturating_sub(pos);
    let mut headers = HashMap::with_capacity(header_count.min(remaining / 8));
    for _ in 0..header_count {
        let key = read_str(body, &mut pos, "header_key")?;
        let value = read_str(body, &mut pos, "header_value")?;
        headers.insert(key, value);
    }

    let interface_name = read_str(body, &mut pos, "interface_name")?;

    if pos != body.len() {
        return Err(WireError::TrailingBytes {
            extra: body.len() - pos,
        });
    }

    Ok(Envelope {
        id,
        interface_name,
        method_name,
        payload,
        is_error,
        headers,
    })
}

/// Encode an envelope as one complete frame: length prefix plus body.
pub fn encode_frame(envelope: &Envelope) -> Result<Vec<u8>, WireError> {
    let body = encode_envelope(envelope)?;
    let mut frame = Vec::with_capacity(LENGTH_PREFIX_SIZE + body.len());
    frame.extend_from_slice(&(body.len() as u32).to_le_bytes());
    frame.extend_from_slice(&body);
    Ok(frame)
}

/// Streaming frame decoder.
///
/// Feed it raw bytes as they arrive from the transport; it buffers partial
/// frames and yields decoded envelopes one at a time. A partial frame is
/// never an error, only a reason to wait for more bytes.
#[derive(Debug, Default)]
pub struct FrameDecoder {
    buf: Vec<u8>,
}

impl FrameDecoder {
    /// Create an empty decoder.
    pub fn new() -> Self {
        Self::default()
    }

    /// Append bytes read from the transport.
    pub fn extend(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    /// Number of bytes currently buffered.
    pub fn buffered(&self) -> usize {
        self.buf.len()
    }

    /// Try to decode the next complete frame.
    ///
    /// Returns `Ok(None)` when fewer than `4 + length` bytes are buffered.
    /// On a malformed body the offending frame is consumed before the error
    /// is returned, so the caller can decide whether to continue; a
    /// [`WireError::is_stream_fatal`] error means the stream must be closed.
    pub fn try_next(&mut self) -> Result<Option<Envelope>, WireError> {
        if self.buf.len() < LENGTH_PREFIX_SIZE {
            return Ok(None);
        }

        let length =
            u32::from_le_bytes([self.buf[0], self.buf[1], self.buf[2], self.buf[3]]) as usize;
        if length > MAX_FRAME_SIZE {
            return Err(WireError::FrameTooLarge {
                size: length,
                max: MAX_FRAME_SIZE,
            });
        }
        if self.buf.len() < LENGTH_PREFIX_SIZE + length {
            return Ok(None);
        }

        let result = decode_envelope(&self.buf[LENGTH_PREFIX_SIZE..LENGTH_PREFIX_SIZE + length]);
        self.buf.drain(..LENGTH_PREFIX_SIZE + length);
        result.map(Some)
    }
}

fn write_str(buf: &mut Vec<u8>, s: &str) {
    write_bytes(buf, s.as_bytes());
}

fn write_bytes(buf: &mut Vec<u8>, bytes: &[u8]) {
    buf.extend_from_slice(&(bytes.len() as u32).to_le_bytes());
    buf.extend_from_slice(bytes);
}

fn read_u8(body: &[u8], pos: &mut usize, field: &'static str) -> Result<u8, WireError> {
    let byte = *body
        .get(*pos)
        .ok_or(WireError::Truncated { field })?;
    *pos += 1;
    Ok(byte)
}

fn read_u32(body: &[u8], pos: &mut usize, field: &'static str) -> Result<u32, WireError> {
    let end = pos.checked_add(4).ok_or(WireError::Truncated { field })?;
    let slice = body
        .get(*pos..end)
        .ok_or(WireError::Truncated { field })?;
    *pos = end;
    Ok(u32::from_le_bytes([slice[0], slice[1], slice[2], slice[3]]))
}

fn read_bytes<'a>(
    body: &'a [u8],
    pos: &mut usize,
    field: &'static str,
) -> Result<&'a [u8], WireError> {
    let len = read_u32(body, pos, field)? as usize;
    let end = pos.checked_add(len).ok_or(WireError::Truncated { field })?;
    let slice = body
        .get(*pos..end)
        .ok_or(WireError::Truncated { field })?;
    *pos = end;
    Ok(slice)
}

fn read_str(body: &[u8], pos: &mut usize, field: &'static str) -> Result<String, WireError> {
    let bytes = read_bytes(body, pos, field)?;
    String::from_utf8(bytes.to_vec()).map_err(|_| WireError::InvalidUtf8 { field })
}
