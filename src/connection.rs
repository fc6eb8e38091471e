// ABOUTME: Connection object (component E): owns the socket, buffers, and state; orchestrates A-D
// ABOUTME: Generic over any AsyncRead+AsyncWrite stream so the same core drives raw-TCP and WS clients

use tokio::io::{AsyncRead, AsyncWrite};
use tracing::{debug, instrument, warn};

use crate::buffer::{ChunkedBuffer, Cursor};
use crate::config::ConnectionConfig;
use crate::error::{BoltError, BoltResult};
use crate::framing;
use crate::state::{self, MessageType, ProtocolState};
use crate::ws::{self, WsOpcode, BOLT_MAGIC};

/// `SUCCESS{}` — a tiny struct of arity 1 (tag `0x70`) whose sole field is an
/// empty map, synthesized directly by the connection for the RESET flush
/// sequence (the real handler never needs to produce this one itself).
const SUCCESS_EMPTY: [u8; 3] = [0xB1, 0x70, 0xA0];

/// `IGNORED` — a tiny struct of arity 0 (tag `0x7E`), synthesized the same way.
const IGNORED_EMPTY: [u8; 2] = [0xB0, 0x7E];

/// Bolt protocol versions this core accepts proposals for, most preferred
/// first within a given proposal slot (the client already orders its own
/// proposals by preference; we just check each against this set in order).
const SUPPORTED_VERSIONS: &[(u8, u8)] = &[(5, 4), (5, 3), (5, 2), (5, 1), (5, 0), (4, 4)];

/// A Bolt connection bound to a single socket-like stream, owning every
/// buffer and piece of state named in the connection object's data model.
pub struct Connection<S> {
    stream: S,
    config: ConnectionConfig,

    read_buf: ChunkedBuffer,
    write_buf: ChunkedBuffer,
    msg_buf: ChunkedBuffer,

    /// Reassembled Bolt bytes once a WebSocket frame's payload has been
    /// unmasked and unwrapped; only used once `ws` is true.
    ws_payload_buf: ChunkedBuffer,

    ws: bool,
    state: ProtocolState,

    reset: bool,
    /// State captured the moment a RESET is first observed, before any
    /// further replies run through `step()`. Read back at flush time so the
    /// IGNORED+SUCCESS vs SUCCESS-only choice doesn't depend on `state`
    /// having already moved on by the time `send()` runs.
    pre_reset_state: Option<ProtocolState>,

    shutdown: bool,
    processing: bool,

    on_writable: Option<Box<dyn FnMut() + Send>>,
    span: tracing::Span,
}

impl<S> Connection<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    pub fn new(stream: S, config: ConnectionConfig) -> Self {
        let span = tracing::info_span!("bolt_connection");
        debug!(parent: &span, "connection accepted");
        Connection {
            stream,
            config,
            read_buf: ChunkedBuffer::new(),
            write_buf: ChunkedBuffer::new(),
            msg_buf: ChunkedBuffer::new(),
            ws_payload_buf: ChunkedBuffer::new(),
            ws: false,
            state: ProtocolState::Negotiation,
            reset: false,
            pre_reset_state: None,
            shutdown: false,
            processing: false,
            on_writable: None,
            span,
        }
    }

    pub fn state(&self) -> ProtocolState {
        self.state
    }

    pub fn is_websocket(&self) -> bool {
        self.ws
    }

    pub fn is_shutdown(&self) -> bool {
        self.shutdown
    }

    pub fn begin_processing(&mut self) {
        self.processing = true;
    }

    pub fn end_processing(&mut self) {
        self.processing = false;
    }

    /// Registers the write-readiness callback the host event loop invokes;
    /// `finish_write` calls into it rather than this crate blocking on the
    /// socket directly.
    pub fn set_write_ready_callback(&mut self, callback: Box<dyn FnMut() + Send>) {
        self.on_writable = Some(callback);
    }

    fn pending_write_bytes(&self) -> u64 {
        self.write_buf
            .diff(self.write_buf.write_cursor(), Cursor::ZERO)
            .unwrap_or(0)
    }

    /// Schedules a flush on the host event loop by registering the
    /// write-readiness callback, edge-triggered: only when bytes are
    /// actually pending.
    pub fn finish_write(&mut self) {
        if self.pending_write_bytes() == 0 {
            return;
        }
        if let Some(callback) = self.on_writable.as_mut() {
            callback();
        }
    }

    // ---- handshake -----------------------------------------------------

    #[instrument(skip(self), fields(ws))]
    pub async fn handshake(&mut self) -> BoltResult<()> {
        if self.config.websocket_enabled {
            self.try_websocket_upgrade().await?;
        }
        self.negotiate_bolt_version().await?;
        tracing::Span::current().record("ws", self.ws);
        Ok(())
    }

    async fn try_websocket_upgrade(&mut self) -> BoltResult<()> {
        loop {
            let (outcome, read_cursor, write_cursor) = ws::try_handshake(
                &self.read_buf,
                &mut self.write_buf,
                self.read_buf.read_cursor(),
                self.write_buf.write_cursor(),
            )?;

            match outcome {
                ws::HandshakeOutcome::Upgraded => {
                    self.read_buf.set_read_cursor(read_cursor);
                    self.write_buf.set_write_cursor(write_cursor);
                    self.ws = true;
                    self.flush_raw().await?;
                    debug!(parent: &self.span, "upgraded to websocket transport");
                    return Ok(());
                }
                ws::HandshakeOutcome::NotWebSocket => return Ok(()),
                ws::HandshakeOutcome::NeedMoreData => {
                    if !self.read_buf.socket_read(&mut self.stream).await? {
                        return Err(BoltError::Handshake(
                            "connection closed during websocket handshake".into(),
                        ));
                    }
                }
            }
        }
    }

    /// Reads the magic preamble and four version proposals. A client that
    /// upgraded to WebSocket transport sends these wrapped in a binary frame
    /// just like every Bolt message after it, so once `self.ws` is set this
    /// unwraps frames via `drain_ws_frames` instead of reading `read_buf`
    /// directly; a raw-TCP client is read straight off `read_buf`.
    async fn negotiate_bolt_version(&mut self) -> BoltResult<()> {
        const PREAMBLE_AND_PROPOSALS: u64 = 4 + 16;

        loop {
            if self.ws {
                self.drain_ws_frames().await?;
            }
            let available = if self.ws {
                self.ws_payload_buf
                    .diff(self.ws_payload_buf.write_cursor(), self.ws_payload_buf.read_cursor())
                    .unwrap_or(0)
            } else {
                self.read_buf
                    .diff(self.read_buf.write_cursor(), self.read_buf.read_cursor())
                    .unwrap_or(0)
            };
            if available >= PREAMBLE_AND_PROPOSALS {
                break;
            }
            if !self.read_buf.socket_read(&mut self.stream).await? {
                return Err(BoltError::Handshake("connection closed during handshake".into()));
            }
        }

        let proposals = if self.ws {
            let mut cursor = self.ws_payload_buf.read_cursor();
            let proposals = read_handshake_proposals(&self.ws_payload_buf, &mut cursor)?;
            self.ws_payload_buf.set_read_cursor(cursor);
            self.compact_ws_payload();
            proposals
        } else {
            let mut cursor = self.read_buf.read_cursor();
            let proposals = read_handshake_proposals(&self.read_buf, &mut cursor)?;
            self.read_buf.set_read_cursor(cursor);
            self.compact_read_buf();
            proposals
        };

        let chosen = negotiate_version(&proposals);
        let reply = chosen.unwrap_or(0).to_be_bytes();

        if self.ws {
            self.enqueue_ws_frame(WsOpcode::Binary, &reply);
        } else {
            let write_cursor = self.write_buf.write_cursor();
            let end = self.write_buf.write_bytes(write_cursor, &reply);
            self.write_buf.set_write_cursor(end);
        }
        self.flush_raw().await?;

        match chosen {
            Some(version) => {
                debug!(parent: &self.span, version, "negotiated bolt version");
                Ok(())
            }
            None => Err(BoltError::Handshake(
                "no mutually supported Bolt version".into(),
            )),
        }
    }

    /// Writes the entire write buffer and resets it, bypassing the Bolt
    /// framing / reset flush policy. Used for the handshake responses,
    /// which are not chunk-framed Bolt messages.
    async fn flush_raw(&mut self) -> BoltResult<()> {
        self.write_buf
            .socket_write(self.write_buf.write_cursor(), &mut self.stream)
            .await?;
        self.write_buf.set_read_cursor(Cursor::ZERO);
        self.write_buf.set_write_cursor(Cursor::ZERO);
        Ok(())
    }

    // ---- reading ---------------------------------------------------------

    /// Reads and reassembles the next Bolt message, draining the socket and
    /// (when upgraded) unwrapping WebSocket frames as needed. Returns `None`
    /// once the peer has cleanly closed the connection.
    pub async fn read_message(&mut self) -> BoltResult<Option<Vec<u8>>> {
        loop {
            if self.ws {
                self.drain_ws_frames().await?;
                let mut cursor = self.ws_payload_buf.read_cursor();
                if let Some(payload) = framing::decode_message(
                    &self.ws_payload_buf,
                    &mut self.msg_buf,
                    &mut cursor,
                    self.config.max_message_size,
                )? {
                    self.ws_payload_buf.set_read_cursor(cursor);
                    self.compact_ws_payload();
                    self.msg_buf = ChunkedBuffer::new();
                    return Ok(Some(payload));
                }
            } else {
                let mut cursor = self.read_buf.read_cursor();
                if let Some(payload) = framing::decode_message(
                    &self.read_buf,
                    &mut self.msg_buf,
                    &mut cursor,
                    self.config.max_message_size,
                )? {
                    self.read_buf.set_read_cursor(cursor);
                    self.compact_read_buf();
                    self.msg_buf = ChunkedBuffer::new();
                    return Ok(Some(payload));
                }
            }

            if !self.read_buf.socket_read(&mut self.stream).await? {
                self.shutdown = true;
                return Ok(None);
            }
        }
    }

    async fn drain_ws_frames(&mut self) -> BoltResult<()> {
        loop {
            let mut cursor = self.read_buf.read_cursor();
            let Some(header) = ws::read_frame_header(&self.read_buf, &mut cursor)? else {
                return Ok(());
            };

            let payload_len = header.payload_len;
            if self.read_buf.diff(self.read_buf.write_cursor(), cursor).unwrap_or(0) < payload_len {
                return Ok(());
            }

            let mut payload = self.read_buf.read_bytes(cursor, payload_len as usize)?;
            cursor = self.read_buf.advance(cursor, payload_len);
            self.read_buf.set_read_cursor(cursor);
            self.compact_read_buf();

            if let Some(mask) = header.mask {
                ws::apply_mask(mask, &mut payload);
            }

            match header.opcode {
                WsOpcode::Binary | WsOpcode::Continuation => {
                    let end = self
                        .ws_payload_buf
                        .write_bytes(self.ws_payload_buf.write_cursor(), &payload);
                    self.ws_payload_buf.set_write_cursor(end);
                }
                WsOpcode::Ping => {
                    self.enqueue_ws_frame(WsOpcode::Pong, &payload);
                    self.flush_raw().await?;
                }
                WsOpcode::Pong => {}
                WsOpcode::Close => {
                    self.enqueue_ws_frame(WsOpcode::Close, &payload);
                    self.flush_raw().await?;
                    self.shutdown = true;
                    return Ok(());
                }
                WsOpcode::Text => {
                    warn!(parent: &self.span, "dropping unexpected text frame");
                }
            }
        }
    }

    fn compact_read_buf(&mut self) {
        if self.read_buf.diff(self.read_buf.write_cursor(), self.read_buf.read_cursor()) == Some(0) {
            self.read_buf = ChunkedBuffer::new();
        }
    }

    fn compact_ws_payload(&mut self) {
        if self
            .ws_payload_buf
            .diff(self.ws_payload_buf.write_cursor(), self.ws_payload_buf.read_cursor())
            == Some(0)
        {
            self.ws_payload_buf = ChunkedBuffer::new();
        }
    }

    // ---- writing / state transitions -------------------------------------

    /// Serializes `payload` as one chunk-framed Bolt message (wrapped in a
    /// WebSocket binary frame when upgraded), then advances the protocol
    /// state per `step(state, request, response)`. Validates before
    /// enqueuing so an illegal pair never reaches the wire.
    #[instrument(skip(self, payload), fields(?request, ?response))]
    pub fn reply_for(
        &mut self,
        request: MessageType,
        response: MessageType,
        payload: &[u8],
    ) -> BoltResult<ProtocolState> {
        let next = state::step(self.state, request, response)?;
        self.enqueue_message(payload);
        self.state = next;
        Ok(next)
    }

    pub fn reply_ignored(&mut self, request: MessageType) -> BoltResult<ProtocolState> {
        self.reply_for(request, MessageType::Ignored, &IGNORED_EMPTY)
    }

    pub fn reply_success_empty(&mut self, request: MessageType) -> BoltResult<ProtocolState> {
        self.reply_for(request, MessageType::Success, &SUCCESS_EMPTY)
    }

    /// Called when a RESET request is decoded. If work is in flight, the
    /// connection is interrupted immediately; the RESET's own reply is
    /// synthesized later by `send()`, not through `reply_for`.
    pub fn begin_reset(&mut self) {
        if self.pre_reset_state.is_none() {
            self.pre_reset_state = Some(self.state);
        }
        self.reset = true;
        if self.processing {
            self.state = ProtocolState::Interrupted;
        }
    }

    fn enqueue_message(&mut self, payload: &[u8]) {
        if self.ws {
            let mut scratch = ChunkedBuffer::new();
            let end = framing::encode_message(&mut scratch, Cursor::ZERO, payload);
            scratch.set_write_cursor(end);
            let len = scratch.diff(end, Cursor::ZERO).unwrap_or(0) as usize;
            let bytes = scratch
                .read_bytes(Cursor::ZERO, len)
                .expect("scratch buffer holds exactly what encode_message just wrote");
            self.enqueue_ws_frame(WsOpcode::Binary, &bytes);
        } else {
            let start = self.write_buf.write_cursor();
            let end = framing::encode_message(&mut self.write_buf, start, payload);
            self.write_buf.set_write_cursor(end);
        }
    }

    fn enqueue_ws_frame(&mut self, opcode: WsOpcode, payload: &[u8]) {
        let start = self.write_buf.write_cursor();
        let after_header = ws::write_frame_header(&mut self.write_buf, start, opcode, true, payload.len());
        let end = self.write_buf.write_bytes(after_header, payload);
        self.write_buf.set_write_cursor(end);
    }

    /// Flushes pending writes to the socket. If a RESET is pending, its
    /// synthesized reply is enqueued first: `IGNORED` then `SUCCESS{}` if
    /// the state captured at reset time was `FAILED`, otherwise `SUCCESS{}`
    /// alone. Either way the connection ends the sequence in `READY`.
    #[instrument(skip(self))]
    pub async fn send(&mut self) -> BoltResult<()> {
        if self.reset {
            let was_failed = self.pre_reset_state == Some(ProtocolState::Failed);
            if was_failed {
                self.enqueue_message(&IGNORED_EMPTY);
            }
            self.enqueue_message(&SUCCESS_EMPTY);
            self.state = ProtocolState::Ready;
            self.reset = false;
            self.pre_reset_state = None;
        }

        if self.pending_write_bytes() > 0 {
            self.write_buf
                .socket_write(self.write_buf.write_cursor(), &mut self.stream)
                .await?;
            self.write_buf.set_read_cursor(Cursor::ZERO);
            self.write_buf.set_write_cursor(Cursor::ZERO);
        }
        Ok(())
    }
}

/// Parses the 4-byte magic preamble and four big-endian version proposal
/// words starting at `*cursor`, advancing it past them. Does not check that
/// the bytes are actually available; callers must have already confirmed at
/// least `4 + 16` bytes are buffered.
fn read_handshake_proposals(buf: &ChunkedBuffer, cursor: &mut Cursor) -> BoltResult<[u32; 4]> {
    let magic = buf.read_bytes(*cursor, 4)?;
    if magic.as_slice() != BOLT_MAGIC {
        return Err(BoltError::Handshake(format!("bad magic preamble: {magic:02x?}")));
    }
    *cursor = buf.advance(*cursor, 4);

    let mut proposals = [0u32; 4];
    for slot in proposals.iter_mut() {
        *slot = buf.read_u32_be(cursor)?;
    }
    Ok(proposals)
}

fn negotiate_version(proposals: &[u32; 4]) -> Option<u32> {
    for &word in proposals {
        if word == 0 {
            continue;
        }
        let major = (word & 0xFF) as u8;
        let minor = ((word >> 8) & 0xFF) as u8;
        if SUPPORTED_VERSIONS.contains(&(major, minor)) {
            return Some(word);
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::MessageType::*;
    use crate::state::ProtocolState::*;

    fn proposal(major: u8, minor: u8) -> u32 {
        (minor as u32) << 8 | major as u32
    }

    #[test]
    fn negotiate_version_picks_first_supported_proposal() {
        let proposals = [proposal(9, 9), proposal(5, 4), proposal(4, 4), 0];
        assert_eq!(negotiate_version(&proposals), Some(proposal(5, 4)));
    }

    #[test]
    fn negotiate_version_rejects_when_nothing_matches() {
        let proposals = [proposal(9, 9), 0, 0, 0];
        assert_eq!(negotiate_version(&proposals), None);
    }

    #[tokio::test]
    async fn reply_for_validates_before_enqueuing_and_advances_state() {
        let (_client, server) = tokio::io::duplex(4096);
        let mut conn = Connection::new(server, ConnectionConfig::default());
        conn.state = Authentication;

        let next = conn.reply_for(Logon, Success, &SUCCESS_EMPTY).unwrap();
        assert_eq!(next, Ready);
        assert_eq!(conn.state(), Ready);
        assert!(conn.pending_write_bytes() > 0);

        let err = conn.reply_for(Run, Record, &[]).unwrap_err();
        assert!(matches!(err, BoltError::Protocol(_)));
        assert_eq!(conn.state(), Ready);
    }

    #[tokio::test]
    async fn reset_from_failed_emits_ignored_then_success_and_returns_to_ready() {
        let (_client, server) = tokio::io::duplex(4096);
        let mut conn = Connection::new(server, ConnectionConfig::default());
        conn.state = Ready;
        conn.reply_for(Run, Failure, &[0xB1, 0x7F, 0xA0]).unwrap();
        assert_eq!(conn.state(), Failed);

        conn.begin_reset();
        assert_eq!(conn.pre_reset_state, Some(Failed));

        conn.send().await.unwrap();
        assert_eq!(conn.state(), Ready);
        assert!(!conn.reset);
        assert_eq!(conn.pre_reset_state, None);
    }

    #[tokio::test]
    async fn reset_from_ready_emits_success_only() {
        let (_client, server) = tokio::io::duplex(4096);
        let mut conn = Connection::new(server, ConnectionConfig::default());
        conn.state = Ready;

        conn.begin_reset();
        assert_eq!(conn.pre_reset_state, Some(Ready));
        conn.send().await.unwrap();
        assert_eq!(conn.state(), Ready);
    }

    #[tokio::test]
    async fn reset_while_processing_interrupts_then_ignores_pending_replies() {
        let (_client, server) = tokio::io::duplex(4096);
        let mut conn = Connection::new(server, ConnectionConfig::default());
        conn.state = TxStreaming;
        conn.begin_processing();

        conn.begin_reset();
        assert_eq!(conn.state(), Interrupted);

        conn.reply_ignored(Pull).unwrap();
        assert_eq!(conn.state(), Failed);
        conn.reply_ignored(Run).unwrap();
        assert_eq!(conn.state(), Failed);

        conn.end_processing();
        conn.send().await.unwrap();
        assert_eq!(conn.state(), Ready);
    }

    #[tokio::test]
    async fn websocket_wrapped_reply_round_trips_through_a_client_reader() {
        let (mut client, server) = tokio::io::duplex(64 * 1024);
        let mut conn = Connection::new(server, ConnectionConfig::default());
        conn.ws = true;
        conn.state = Authentication;

        conn.reply_for(Logon, Success, &SUCCESS_EMPTY).unwrap();
        conn.send().await.unwrap();

        use tokio::io::AsyncReadExt;
        let mut frame = [0u8; 2 + 2 + 3 + 2]; // ws header + bolt len + payload + terminator
        client.read_exact(&mut frame).await.unwrap();
        assert_eq!(frame[0], 0x82); // FIN + binary
        assert_eq!(frame[1], 7); // unmasked length of the bolt-framed payload
        assert_eq!(&frame[2..4], &[0x00, 0x03]); // bolt chunk length prefix
        assert_eq!(&frame[4..7], &SUCCESS_EMPTY);
        assert_eq!(&frame[7..9], &[0x00, 0x00]); // terminator
    }
}
