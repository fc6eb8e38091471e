//! Crate-level integration tests driving `Connection` end to end over an
//! in-memory duplex stream, plus the buffer/framing invariants that don't
//! belong to any single module.

use tokio::io::{duplex, AsyncReadExt, AsyncWriteExt, DuplexStream};

use crate::buffer::{ChunkedBuffer, Cursor, CHUNK_SIZE};
use crate::config::ConnectionConfig;
use crate::connection::Connection;
use crate::framing;
use crate::state;
use crate::state::MessageType::*;
use crate::state::ProtocolState::*;
use crate::ws;

const BOLT_MAGIC: [u8; 4] = [0x60, 0x60, 0xB0, 0x17];

fn version_proposal(major: u8, minor: u8) -> [u8; 4] {
    // wire order is reserved, reserved, minor, major
    [0, 0, minor, major]
}

async fn write_handshake_bytes(client: &mut DuplexStream) {
    let mut req = Vec::from(BOLT_MAGIC);
    req.extend_from_slice(&version_proposal(5, 4));
    req.extend_from_slice(&version_proposal(0, 0));
    req.extend_from_slice(&version_proposal(0, 0));
    req.extend_from_slice(&version_proposal(0, 0));
    client.write_all(&req).await.unwrap();
}

async fn read_handshake_reply(client: &mut DuplexStream) {
    let mut reply = [0u8; 4];
    client.read_exact(&mut reply).await.unwrap();
    assert_eq!(reply, version_proposal(5, 4));
}

async fn client_send_message(client: &mut DuplexStream, payload: &[u8]) {
    let mut buf = ChunkedBuffer::new();
    let end = framing::encode_message(&mut buf, buf.write_cursor(), payload);
    buf.set_write_cursor(end);
    let len = buf.diff(end, Cursor::ZERO).unwrap() as usize;
    let bytes = buf.read_bytes(Cursor::ZERO, len).unwrap();
    client.write_all(&bytes).await.unwrap();
}

async fn client_read_message(client: &mut DuplexStream) -> Vec<u8> {
    let mut len_bytes = [0u8; 2];
    client.read_exact(&mut len_bytes).await.unwrap();
    let len = u16::from_be_bytes(len_bytes) as usize;
    let mut payload = vec![0u8; len];
    if len > 0 {
        client.read_exact(&mut payload).await.unwrap();
    }
    let mut terminator = [0u8; 2];
    client.read_exact(&mut terminator).await.unwrap();
    assert_eq!(terminator, [0, 0]);
    payload
}

fn structure(tag: u8) -> Vec<u8> {
    vec![0xB0, tag]
}

/// Builds a masked client-to-server WebSocket binary frame (RFC 6455
/// requires every client frame to be masked; `payload.len()` must fit the
/// single-byte length encoding used here).
fn masked_client_frame(payload: &[u8]) -> Vec<u8> {
    assert!(payload.len() <= 125);
    let mask = [0x11, 0x22, 0x33, 0x44];
    let mut frame = vec![0x80 | 0x02, 0x80 | payload.len() as u8];
    frame.extend_from_slice(&mask);
    frame.extend(payload.iter().enumerate().map(|(i, b)| b ^ mask[i % 4]));
    frame
}

#[tokio::test]
async fn scenario_1_happy_path() {
    let (mut client, server) = duplex(16 * 1024);
    let mut conn = Connection::new(server, ConnectionConfig::default().with_websocket(false));

    write_handshake_bytes(&mut client).await;
    conn.handshake().await.unwrap();
    read_handshake_reply(&mut client).await;
    assert_eq!(conn.state(), Negotiation);

    client_send_message(&mut client, &structure(Hello as u8)).await;
    let msg = conn.read_message().await.unwrap().unwrap();
    assert_eq!(msg[1], Hello as u8);
    conn.reply_for(Hello, Success, &structure(Success as u8)).unwrap();
    conn.send().await.unwrap();
    assert_eq!(conn.state(), Authentication);
    assert_eq!(client_read_message(&mut client).await, structure(Success as u8));

    client_send_message(&mut client, &structure(Logon as u8)).await;
    conn.read_message().await.unwrap().unwrap();
    conn.reply_for(Logon, Success, &structure(Success as u8)).unwrap();
    conn.send().await.unwrap();
    assert_eq!(conn.state(), Ready);
    client_read_message(&mut client).await;

    client_send_message(&mut client, &structure(Run as u8)).await;
    conn.read_message().await.unwrap().unwrap();
    conn.reply_for(Run, Success, &structure(Success as u8)).unwrap();
    conn.send().await.unwrap();
    assert_eq!(conn.state(), Streaming);
    client_read_message(&mut client).await;

    client_send_message(&mut client, &structure(Pull as u8)).await;
    conn.read_message().await.unwrap().unwrap();
    // a RECORD precedes the terminal SUCCESS and never changes state
    let record = state::step(conn.state(), Pull, Record).unwrap();
    assert_eq!(record, Streaming);
    conn.reply_for(Pull, Success, &structure(Success as u8)).unwrap();
    conn.send().await.unwrap();
    assert_eq!(conn.state(), Ready);
    client_read_message(&mut client).await;

    client_send_message(&mut client, &structure(Goodbye as u8)).await;
    conn.read_message().await.unwrap().unwrap();
    conn.reply_for(Goodbye, Success, &[]).unwrap();
    conn.send().await.unwrap();
    assert_eq!(conn.state(), Defunct);
}

#[tokio::test]
async fn scenario_2_failed_query_then_reset() {
    let (mut client, server) = duplex(16 * 1024);
    let mut conn = Connection::new(server, ConnectionConfig::default().with_websocket(false));
    conn.reply_for(Hello, Success, &[]).unwrap();
    conn.reply_for(Logon, Success, &[]).unwrap();
    conn.send().await.unwrap();
    client_read_message(&mut client).await;
    client_read_message(&mut client).await;
    assert_eq!(conn.state(), Ready);

    conn.reply_for(Run, Failure, &structure(Failure as u8)).unwrap();
    conn.send().await.unwrap();
    assert_eq!(conn.state(), Failed);
    client_read_message(&mut client).await;

    conn.reply_ignored(Pull).unwrap();
    conn.send().await.unwrap();
    assert_eq!(conn.state(), Failed);
    assert_eq!(client_read_message(&mut client).await, vec![0xB0, Ignored as u8]);

    conn.begin_reset();
    conn.send().await.unwrap();
    assert_eq!(conn.state(), Ready);
    // FAILED reset emits IGNORED then SUCCESS{}
    assert_eq!(client_read_message(&mut client).await, vec![0xB0, Ignored as u8]);
    assert_eq!(client_read_message(&mut client).await, vec![0xB1, Success as u8, 0xA0]);
}

#[tokio::test]
async fn scenario_3_transaction_lifecycle() {
    let (mut client, server) = duplex(16 * 1024);
    let mut conn = Connection::new(server, ConnectionConfig::default().with_websocket(false));
    conn.reply_for(Hello, Success, &[]).unwrap();
    conn.reply_for(Logon, Success, &[]).unwrap();
    conn.send().await.unwrap();
    client_read_message(&mut client).await;
    client_read_message(&mut client).await;

    conn.reply_for(Begin, Success, &[]).unwrap();
    assert_eq!(conn.state(), TxReady);
    conn.reply_for(Run, Success, &[]).unwrap();
    assert_eq!(conn.state(), TxStreaming);

    // intermediate RECORD responses never change state
    assert_eq!(state::step(conn.state(), Pull, Record).unwrap(), TxStreaming);
    conn.reply_for(Pull, Success, &[]).unwrap();
    assert_eq!(conn.state(), TxStreaming);

    conn.reply_for(Commit, Success, &[]).unwrap();
    assert_eq!(conn.state(), Ready);
    conn.send().await.unwrap();
}

#[tokio::test]
async fn scenario_4_websocket_upgrade_then_bolt_round_trip() {
    let (mut client, server) = duplex(16 * 1024);
    let mut conn = Connection::new(server, ConnectionConfig::default());

    // Both the HTTP upgrade request and the Bolt magic/version proposals
    // that immediately follow it are written up front: `handshake()` drains
    // and answers both in a single call, so nothing must be read back from
    // the connection until it returns. A real WebSocket client wraps the
    // handshake bytes in a binary frame exactly like every Bolt message
    // after it, so that's what's written here too.
    let request = "GET / HTTP/1.1\r\nUpgrade: websocket\r\nConnection: Upgrade\r\n\
         Sec-WebSocket-Key: dGhlIHNhbXBsZSBub25jZQ==\r\n\r\n";
    client.write_all(request.as_bytes()).await.unwrap();
    let mut handshake_payload = Vec::from(BOLT_MAGIC);
    handshake_payload.extend_from_slice(&version_proposal(5, 4));
    handshake_payload.extend_from_slice(&version_proposal(0, 0));
    handshake_payload.extend_from_slice(&version_proposal(0, 0));
    handshake_payload.extend_from_slice(&version_proposal(0, 0));
    client.write_all(&masked_client_frame(&handshake_payload)).await.unwrap();

    conn.handshake().await.unwrap();
    assert!(conn.is_websocket());

    let mut response = vec![0u8; 129];
    client.read_exact(&mut response).await.unwrap();
    let response = String::from_utf8(response).unwrap();
    assert!(response.starts_with("HTTP/1.1 101"));
    assert!(response.contains("Sec-WebSocket-Accept: s3pPLMBiTxaQ9kYGzzhZRbK+xOo="));

    // the version reply arrives wrapped in its own (unmasked, server → client) frame
    let mut reply_header = [0u8; 2];
    client.read_exact(&mut reply_header).await.unwrap();
    assert_eq!(reply_header, [0x82, 4]);
    let mut version_reply = [0u8; 4];
    client.read_exact(&mut version_reply).await.unwrap();
    assert_eq!(version_reply, version_proposal(5, 4));

    conn.reply_for(Hello, Success, &structure(Success as u8)).unwrap();
    conn.send().await.unwrap();

    let mut header = [0u8; 2];
    client.read_exact(&mut header).await.unwrap();
    assert_eq!(header[0], 0x82);
    let len = header[1] as usize;
    let mut frame_payload = vec![0u8; len];
    client.read_exact(&mut frame_payload).await.unwrap();
    // frame_payload is itself a bolt-chunk-framed message
    assert_eq!(&frame_payload[2..frame_payload.len() - 2], &structure(Success as u8)[..]);
}

#[tokio::test]
async fn scenario_5_reset_mid_stream() {
    let (_client, server) = duplex(16 * 1024);
    let mut conn = Connection::new(server, ConnectionConfig::default().with_websocket(false));
    conn.reply_for(Hello, Success, &[]).unwrap();
    conn.reply_for(Logon, Success, &[]).unwrap();
    conn.reply_for(Begin, Success, &[]).unwrap();
    conn.reply_for(Run, Success, &[]).unwrap();
    assert_eq!(conn.state(), TxStreaming);

    conn.begin_processing();
    conn.begin_reset();
    assert_eq!(conn.state(), Interrupted);

    conn.reply_ignored(Pull).unwrap();
    assert_eq!(conn.state(), Failed);
    conn.reply_ignored(Run).unwrap();
    assert_eq!(conn.state(), Failed);
    conn.reply_ignored(Pull).unwrap();
    assert_eq!(conn.state(), Failed);

    conn.end_processing();
    conn.send().await.unwrap();
    assert_eq!(conn.state(), Ready);
}

#[tokio::test]
async fn scenario_6_buffer_straddle() {
    let mut buf = ChunkedBuffer::new();
    let cursor = buf.index((CHUNK_SIZE - 2) as u64).unwrap();

    let payload = vec![0xABu8; CHUNK_SIZE];
    let end = buf.write_bytes(cursor, &payload);
    buf.set_write_cursor(end);

    assert_eq!(end.chunk, 1);
    assert_eq!(end.offset, CHUNK_SIZE - 2);

    let read_back = buf.read_bytes(cursor, CHUNK_SIZE).unwrap();
    assert_eq!(read_back, payload);
    assert_eq!(&read_back[..2], &payload[..2]);
    assert_eq!(&read_back[2..], &payload[2..]);
}

#[tokio::test]
async fn diff_write_read_is_zero_iff_nothing_pending() {
    let mut buf = ChunkedBuffer::new();
    assert_eq!(buf.diff(buf.write_cursor(), buf.read_cursor()), Some(0));

    let end = buf.write_bytes(buf.write_cursor(), b"abc");
    buf.set_write_cursor(end);
    assert_ne!(buf.diff(buf.write_cursor(), buf.read_cursor()), Some(0));

    let bytes = buf.read_bytes(buf.read_cursor(), 3).unwrap();
    assert_eq!(bytes, b"abc");
    buf.set_read_cursor(buf.advance(buf.read_cursor(), 3));
    assert_eq!(buf.diff(buf.write_cursor(), buf.read_cursor()), Some(0));
}

#[tokio::test]
async fn socket_write_transmits_exactly_the_pending_byte_count() {
    let (mut client, server) = duplex(16 * 1024);
    let mut buf = ChunkedBuffer::new();
    let end = buf.write_bytes(buf.write_cursor(), b"hello bolt");
    buf.set_write_cursor(end);
    let expected = buf.diff(end, Cursor::ZERO).unwrap();

    let mut server = server;
    buf.socket_write(end, &mut server).await.unwrap();
    drop(server);

    let mut received = Vec::new();
    client.read_to_end(&mut received).await.unwrap();
    assert_eq!(received.len(), expected as usize);
    assert_eq!(received, b"hello bolt");
}

#[tokio::test]
async fn outgoing_payload_length_selects_correct_websocket_encoding() {
    let mut buf = ChunkedBuffer::new();
    let small = vec![0u8; 125];
    let end = ws::write_binary_frame(&mut buf, buf.write_cursor(), &small);
    assert_eq!(buf.diff(end, buf.read_cursor()), Some(127)); // 1 opcode + 1 len byte + 125

    let mut buf = ChunkedBuffer::new();
    let large = vec![0u8; 126];
    let end = ws::write_binary_frame(&mut buf, buf.write_cursor(), &large);
    assert_eq!(buf.diff(end, buf.read_cursor()), Some(130)); // 1 opcode + 1 marker + 2 ext len + 126
}

#[tokio::test]
async fn reset_while_failed_emits_ignored_then_success_and_ends_ready() {
    let (_client, server) = duplex(4096);
    let mut conn = Connection::new(server, ConnectionConfig::default());
    conn.reply_for(Hello, Success, &[]).unwrap();
    conn.reply_for(Logon, Success, &[]).unwrap();
    conn.reply_for(Run, Failure, &[]).unwrap();
    assert_eq!(conn.state(), Failed);

    conn.begin_reset();
    conn.send().await.unwrap();
    assert_eq!(conn.state(), Ready);
}
