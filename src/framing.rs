// ABOUTME: Bolt chunk framing: `(u16 length, bytes)* 0x0000` message envelopes over a ChunkedBuffer
// ABOUTME: Reassembly mirrors the check-then-copy two-phase pattern so a short read never corrupts cursors

use crate::buffer::{ChunkedBuffer, Cursor};
use crate::error::FramingError;

/// A chunk's length prefix is a 16-bit field, so a single chunk can carry at
/// most `u16::MAX` payload bytes; larger messages span multiple chunks.
const MAX_CHUNK_SIZE: usize = u16::MAX as usize;

/// Encodes `payload` as one or more length-prefixed Bolt chunks, each no
/// larger than `MAX_CHUNK_SIZE` bytes, followed by the zero-length
/// terminator. Returns the cursor positioned after the terminator — the new
/// write cursor for the connection's write buffer.
pub fn encode_message(buf: &mut ChunkedBuffer, start: Cursor, payload: &[u8]) -> Cursor {
    let mut cursor = start;
    for chunk in payload.chunks(MAX_CHUNK_SIZE) {
        buf.write_u16_be(&mut cursor, chunk.len() as u16);
        cursor = buf.write_bytes(cursor, chunk);
    }
    buf.write_u16_be(&mut cursor, 0);
    cursor
}

/// Checks whether a complete Bolt message (a run of length-prefixed chunks
/// ending in a zero-length terminator) is fully buffered starting at
/// `start`, without consuming anything. Returns the cursor just past the
/// terminator and the total payload length on success.
fn check_message(
    read_buf: &ChunkedBuffer,
    start: Cursor,
    max_message_size: usize,
) -> Result<Option<(Cursor, usize)>, FramingError> {
    let mut cursor = start;
    let mut total = 0usize;
    loop {
        match read_buf.diff(read_buf.write_cursor(), cursor) {
            Some(available) if available >= 2 => {}
            _ => return Ok(None),
        }
        let len = read_buf.read_u16_be(&mut cursor)?;
        if len == 0 {
            return Ok(Some((cursor, total)));
        }
        match read_buf.diff(read_buf.write_cursor(), cursor) {
            Some(available) if available >= len as u64 => {}
            _ => return Ok(None),
        }
        cursor = read_buf.advance(cursor, len as u64);
        total += len as usize;
        if total > max_message_size {
            return Err(FramingError::MessageTooLarge(total));
        }
    }
}

/// Attempts to decode one Bolt message from `read_buf` starting at
/// `*read_cursor`, staging the reassembled payload into `msg_buf`. On
/// success, `*read_cursor` is advanced past the terminator and the payload
/// bytes are returned; on an incomplete message `*read_cursor` is left
/// untouched and `Ok(None)` is returned so the caller can read more from the
/// socket and retry.
pub fn decode_message(
    read_buf: &ChunkedBuffer,
    msg_buf: &mut ChunkedBuffer,
    read_cursor: &mut Cursor,
    max_message_size: usize,
) -> Result<Option<Vec<u8>>, FramingError> {
    let Some((end, total_len)) = check_message(read_buf, *read_cursor, max_message_size)? else {
        return Ok(None);
    };

    let msg_start = msg_buf.write_cursor();
    let mut cursor = *read_cursor;
    loop {
        let len = read_buf.read_u16_be(&mut cursor)?;
        if len == 0 {
            break;
        }
        let (_, dst_after) =
            msg_buf.copy_from(read_buf, cursor, msg_buf.write_cursor(), len as u64)?;
        msg_buf.set_write_cursor(dst_after);
        cursor = read_buf.advance(cursor, len as u64);
    }
    debug_assert_eq!(cursor, end);

    *read_cursor = end;
    let payload = msg_buf.read_bytes(msg_start, total_len)?;
    Ok(Some(payload))
}
