// ABOUTME: WebSocket upgrade handshake and per-frame header parse/emit (component B)
// ABOUTME: Lets the same Bolt state machine and chunk framer drive both raw-TCP and WS clients

use base64::Engine;
use num_enum::TryFromPrimitive;
use sha1::{Digest, Sha1};

use crate::buffer::{ChunkedBuffer, Cursor};
use crate::error::WsError;

const WS_GUID: &str = "258EAFA5-E914-47DA-95CA-C5AB0DC85B11";
const MAX_HANDSHAKE_HEADER: usize = 16 * 1024;

/// The Bolt magic preamble. Checked here only to distinguish a raw-TCP Bolt
/// client (which sends this immediately) from an HTTP upgrade request.
pub(crate) const BOLT_MAGIC: [u8; 4] = [0x60, 0x60, 0xB0, 0x17];

/// Outcome of peeking the bytes buffered so far for a WebSocket upgrade.
#[derive(Debug, PartialEq, Eq)]
pub enum HandshakeOutcome {
    /// Not enough data buffered yet to decide either way.
    NeedMoreData,
    /// The buffered bytes are not an HTTP upgrade request (e.g. they start
    /// with the raw Bolt magic preamble); the caller should fall back to
    /// raw-TCP framing without consuming anything.
    NotWebSocket,
    /// A 101 Switching Protocols response was written to the write buffer;
    /// the caller should flip the connection into WebSocket mode.
    Upgraded,
}

/// Peeks `read_buf` from `read_cursor` for an HTTP upgrade request with a
/// `Sec-WebSocket-Key` header. On a match, writes the RFC 6455 accept
/// response into `write_buf` and returns the cursors advanced past what was
/// consumed/produced; otherwise returns the original cursors unchanged.
pub fn try_handshake(
    read_buf: &ChunkedBuffer,
    write_buf: &mut ChunkedBuffer,
    read_cursor: Cursor,
    write_cursor: Cursor,
) -> Result<(HandshakeOutcome, Cursor, Cursor), WsError> {
    let available = read_buf
        .diff(read_buf.write_cursor(), read_cursor)
        .unwrap_or(0) as usize;

    if available < BOLT_MAGIC.len() {
        return Ok((HandshakeOutcome::NeedMoreData, read_cursor, write_cursor));
    }

    let preamble = read_buf.read_bytes(read_cursor, BOLT_MAGIC.len())?;
    if preamble.as_slice() == BOLT_MAGIC {
        return Ok((HandshakeOutcome::NotWebSocket, read_cursor, write_cursor));
    }

    let capped = available.min(MAX_HANDSHAKE_HEADER);
    let bytes = read_buf.read_bytes(read_cursor, capped)?;
    let text = String::from_utf8_lossy(&bytes);

    let Some(header_end) = text.find("\r\n\r\n") else {
        if available >= MAX_HANDSHAKE_HEADER {
            return Err(WsError::MissingKey);
        }
        return Ok((HandshakeOutcome::NeedMoreData, read_cursor, write_cursor));
    };

    let key = text[..header_end]
        .lines()
        .find_map(|line| {
            let (name, value) = line.split_once(':')?;
            name.trim()
                .eq_ignore_ascii_case("Sec-WebSocket-Key")
                .then(|| value.trim().to_string())
        })
        .ok_or(WsError::MissingKey)?;

    let response = format!(
        "HTTP/1.1 101 Switching Protocols\r\n\
         Upgrade: websocket\r\n\
         Connection: Upgrade\r\n\
         Sec-WebSocket-Accept: {}\r\n\r\n",
        accept_key(&key)
    );

    let new_write = write_buf.write_bytes(write_cursor, response.as_bytes());
    let new_read = read_buf.advance(read_cursor, (header_end + 4) as u64);
    Ok((HandshakeOutcome::Upgraded, new_read, new_write))
}

fn accept_key(client_key: &str) -> String {
    let mut hasher = Sha1::new();
    hasher.update(client_key.as_bytes());
    hasher.update(WS_GUID.as_bytes());
    base64::engine::general_purpose::STANDARD.encode(hasher.finalize())
}

/// WebSocket frame opcodes this core recognizes. Ping/Pong/Close are decoded
/// so the connection can honor them per RFC 6455 even though they carry no
/// Bolt-level meaning.
#[derive(Debug, Clone, Copy, PartialEq, Eq, TryFromPrimitive)]
#[repr(u8)]
pub enum WsOpcode {
    Continuation = 0x0,
    Text = 0x1,
    Binary = 0x2,
    Close = 0x8,
    Ping = 0x9,
    Pong = 0xA,
}

impl WsOpcode {
    pub fn is_control(self) -> bool {
        matches!(self, WsOpcode::Close | WsOpcode::Ping | WsOpcode::Pong)
    }
}

#[derive(Debug, Clone, Copy)]
pub struct WsFrameHeader {
    pub fin: bool,
    pub opcode: WsOpcode,
    pub masked: bool,
    pub mask: Option<[u8; 4]>,
    pub payload_len: u64,
}

/// Consumes one WebSocket frame header starting at `*cursor`, advancing it
/// past the header (but not the payload) on success. Returns `Ok(None)` if
/// the header is not yet fully buffered, leaving the cursor untouched.
pub fn read_frame_header(
    buf: &ChunkedBuffer,
    cursor: &mut Cursor,
) -> Result<Option<WsFrameHeader>, WsError> {
    let mut temp = *cursor;

    if buf.diff(buf.write_cursor(), temp).unwrap_or(0) < 2 {
        return Ok(None);
    }
    let b0 = buf.read_u8(&mut temp).map_err(WsError::Buffer)?;
    let b1 = buf.read_u8(&mut temp).map_err(WsError::Buffer)?;

    let fin = b0 & 0x80 != 0;
    if b0 & 0x70 != 0 {
        return Err(WsError::ReservedBitsSet);
    }
    let opcode = WsOpcode::try_from(b0 & 0x0F).map_err(|e| WsError::ReservedOpcode(e.number))?;

    let masked = b1 & 0x80 != 0;
    let mut payload_len = (b1 & 0x7F) as u64;

    if payload_len == 126 {
        if buf.diff(buf.write_cursor(), temp).unwrap_or(0) < 2 {
            return Ok(None);
        }
        payload_len = buf.read_u16_be(&mut temp).map_err(WsError::Buffer)? as u64;
    } else if payload_len == 127 {
        if buf.diff(buf.write_cursor(), temp).unwrap_or(0) < 8 {
            return Ok(None);
        }
        payload_len = buf.read_u64_be(&mut temp).map_err(WsError::Buffer)?;
    }

    if opcode.is_control() && payload_len > 125 {
        return Err(WsError::ControlFrameTooLarge(payload_len as usize));
    }

    let mask = if masked {
        if buf.diff(buf.write_cursor(), temp).unwrap_or(0) < 4 {
            return Ok(None);
        }
        let bytes = buf.read_bytes(temp, 4).map_err(WsError::Buffer)?;
        temp = buf.advance(temp, 4);
        Some([bytes[0], bytes[1], bytes[2], bytes[3]])
    } else {
        None
    };

    *cursor = temp;
    Ok(Some(WsFrameHeader {
        fin,
        opcode,
        masked,
        mask,
        payload_len,
    }))
}

/// Applies (or reverses — XOR is its own inverse) the frame mask to `data`
/// in place. The caller invokes this lazily as it reads the payload, as the
/// masking key carries no meaning beyond a per-frame XOR stream.
pub fn apply_mask(mask: [u8; 4], data: &mut [u8]) {
    for (i, byte) in data.iter_mut().enumerate() {
        *byte ^= mask[i % 4];
    }
}

/// Writes an unmasked frame header (server → client frames are never
/// masked per RFC 6455) for a payload of `payload_len` bytes, selecting the
/// 1-byte, 126, or 127 length form as required.
pub fn write_frame_header(
    buf: &mut ChunkedBuffer,
    start: Cursor,
    opcode: WsOpcode,
    fin: bool,
    payload_len: usize,
) -> Cursor {
    let mut cursor = start;
    let first_byte = (if fin { 0x80 } else { 0 }) | opcode as u8;
    buf.write_u8(&mut cursor, first_byte);

    if payload_len <= 125 {
        buf.write_u8(&mut cursor, payload_len as u8);
    } else if payload_len <= 0xFFFF {
        buf.write_u8(&mut cursor, 126);
        buf.write_u16_be(&mut cursor, payload_len as u16);
    } else {
        buf.write_u8(&mut cursor, 127);
        buf.write_u64_be(&mut cursor, payload_len as u64);
    }
    cursor
}

/// Writes a full binary frame (header + payload) for `payload`, the
/// envelope every Bolt message travels in once a connection is upgraded.
pub fn write_binary_frame(buf: &mut ChunkedBuffer, start: Cursor, payload: &[u8]) -> Cursor {
    let after_header = write_frame_header(buf, start, WsOpcode::Binary, true, payload.len());
    buf.write_bytes(after_header, payload)
}
