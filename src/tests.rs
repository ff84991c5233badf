use crate::channel::Channel;
use crate::codec::{self, ErrorEnvelope, Meta, PacketType, ParserTag};
use crate::config::{ChannelConfig, ConnectionConfig, HeartbeatConfig};
use crate::connection::Connection;
use crate::error::{codes, registry, Error};
use crate::frame::{apply_mask, decode_frame, encode_frame, generate_mask, OpCode, WsFrame};
use crate::handshake::{
    accept_upgrade, connect_upgrade, construct_http_request, generate_websocket_accept_value,
};
use crate::hash::{HashNode, HashRing, MaglevHash};
use crate::stream::{Endpoint, NetStream};
use crate::stub::{MethodDescriptor, ServiceStub};
use futures::future::join_all;
use futures::FutureExt;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;

fn init_logs() {
    let _ = env_logger::builder().is_test(true).try_init();
}

async fn wait_until<F: Fn() -> bool>(condition: F, deadline: Duration) -> bool {
    let start = Instant::now();
    while start.elapsed() < deadline {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    condition()
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct EchoMessage {
    message: Vec<u8>,
}

const ECHO: MethodDescriptor = MethodDescriptor::unary("EchoService.echo");
const SLOW_ECHO: MethodDescriptor = MethodDescriptor::unary("EchoService.slow_echo");
const NEWS: MethodDescriptor = MethodDescriptor::notification("NewsService.publish");

fn echo_server_config() -> ChannelConfig {
    ChannelConfig::default()
}

fn register_echo_handlers(server: &Arc<Channel>) {
    server.on_request(ECHO.service_method, |conn, packet| {
        async move {
            let request: EchoMessage = codec::decode_payload(conn.parser(), &packet.content)?;
            codec::encode_payload(
                conn.parser(),
                &EchoMessage {
                    message: request.message,
                },
            )
        }
        .boxed()
    });
    server.on_request(SLOW_ECHO.service_method, |_conn, packet| {
        async move {
            tokio::time::sleep(Duration::from_millis(400)).await;
            Ok(packet.content.to_vec())
        }
        .boxed()
    });
}

async fn start_echo_server(config: ChannelConfig) -> (Arc<Channel>, Endpoint) {
    let server = Channel::new(config);
    register_echo_handlers(&server);
    let endpoint = server
        .listen(Endpoint::tcp("127.0.0.1:0"))
        .await
        .unwrap();
    server.start();
    (server, endpoint)
}

// ---------------------------------------------------------------------------
// schema frame codec

#[test]
fn test_codec_round_trip() {
    for tag in [ParserTag::Postcard, ParserTag::Json] {
        let content = b"some payload bytes".to_vec();
        let meta = Meta::request("EchoService.echo", 7);
        let encoded = codec::encode(tag, meta, &content, 8192).unwrap();

        let (consumed, packet) = codec::decode(&encoded, 8192).unwrap().unwrap();
        assert_eq!(consumed, encoded.len());
        assert_eq!(packet.meta.packet_type, PacketType::Request);
        assert_eq!(packet.meta.transmission_id, 7);
        assert_eq!(packet.meta.service_method, "EchoService.echo");
        assert_eq!(packet.meta.content_size as usize, content.len());
        assert_eq!(packet.content.as_ref(), content.as_slice());
    }
}

#[test]
fn test_codec_incomplete_input_consumes_nothing() {
    let encoded = codec::encode(
        ParserTag::Postcard,
        Meta::notification("NewsService.publish"),
        b"hello",
        8192,
    )
    .unwrap();

    for prefix in 0..encoded.len() {
        assert!(
            codec::decode(&encoded[..prefix], 8192).unwrap().is_none(),
            "prefix of {} bytes should not decode",
            prefix
        );
    }
    assert!(codec::decode(&encoded, 8192).unwrap().is_some());
}

// Feeding the same byte stream in arbitrary chunk sizes must produce the
// same frames in the same order.
#[test]
fn test_codec_streaming_chunked() {
    let mut wire = Vec::new();
    let mut expected = Vec::new();
    for id in 1..=3u32 {
        let content = vec![id as u8; 100 * id as usize];
        wire.extend(codec::encode(ParserTag::Postcard, Meta::request("m", id), &content, 8192).unwrap());
        expected.push(content);
    }

    for chunk_size in [1, 2, 3, 7, 64, wire.len()] {
        let mut buffered = Vec::new();
        let mut decoded = Vec::new();
        for chunk in wire.chunks(chunk_size) {
            buffered.extend_from_slice(chunk);
            while let Some((used, packet)) = codec::decode(&buffered, 8192).unwrap() {
                buffered.drain(..used);
                decoded.push(packet);
            }
        }
        assert!(buffered.is_empty());
        assert_eq!(decoded.len(), 3);
        for (idx, packet) in decoded.iter().enumerate() {
            assert_eq!(packet.meta.transmission_id, idx as u32 + 1);
            assert_eq!(packet.content.as_ref(), expected[idx].as_slice());
        }
    }
}

#[test]
fn test_codec_rejects_oversized_packets() {
    let oversized = vec![0u8; 9000];
    let result = codec::encode(ParserTag::Postcard, Meta::request("m", 1), &oversized, 8192);
    assert!(matches!(result, Err(Error::PacketTooLarge(_, _))));

    // A header declaring an absurd meta length fails straight away, before
    // any of those bytes showed up.
    let mut header = vec![1u8];
    header.extend_from_slice(&u32::MAX.to_be_bytes());
    let result = codec::decode(&header, 8192);
    assert!(matches!(result, Err(Error::PacketTooLarge(_, _))));
}

#[test]
fn test_codec_unknown_parser_tag() {
    let mut frame = codec::encode(ParserTag::Postcard, Meta::request("m", 1), b"x", 8192).unwrap();
    frame[0] = 99;
    assert!(matches!(
        codec::decode(&frame, 8192),
        Err(Error::DecodeError(99))
    ));
}

#[test]
fn test_error_envelope_round_trip() {
    let envelope = ErrorEnvelope {
        error_code: codes::METHOD_NOT_FOUND,
        error_message: "no handler registered for `nope`".to_string(),
    };
    let bytes = codec::encode_payload(ParserTag::Postcard, &envelope).unwrap();
    let decoded: ErrorEnvelope = codec::decode_payload(ParserTag::Postcard, &bytes).unwrap();
    assert_eq!(decoded.error_code, envelope.error_code);
    assert_eq!(decoded.error_message, envelope.error_message);
}

// ---------------------------------------------------------------------------
// websocket frame codec

#[test]
fn test_opcode() {
    let byte = 0x0;
    let res = OpCode::from(byte).unwrap();
    assert_eq!(res, OpCode::Continue);

    let opcode = OpCode::Text;
    let op_byte = opcode.as_u8();
    assert_eq!(op_byte, 0x1);

    assert!(OpCode::Close.is_control());
    assert!(!OpCode::Text.is_control());
}

#[test]
fn test_apply_mask_involution() {
    let original: Vec<u8> = (0..1024).map(|_| rand::random()).collect();
    for _ in 0..16 {
        let mask = generate_mask();
        let mut payload = original.clone();
        apply_mask(&mut payload, mask);
        apply_mask(&mut payload, mask);
        assert_eq!(payload, original);
    }
}

#[test]
fn test_ws_frame_round_trip() {
    for payload_len in [0usize, 5, 125, 126, 200, 65535, 70_000] {
        let payload: Vec<u8> = (0..payload_len).map(|i| i as u8).collect();
        for masked in [false, true] {
            let frame = if masked {
                WsFrame::masked(true, OpCode::Binary, payload.clone())
            } else {
                WsFrame::new(true, OpCode::Binary, payload.clone())
            };
            let encoded = encode_frame(&frame);
            let (used, decoded) = decode_frame(&encoded, 1 << 20).unwrap().unwrap();
            assert_eq!(used, encoded.len());
            assert!(decoded.final_fragment);
            assert_eq!(decoded.opcode, OpCode::Binary);
            assert_eq!(decoded.mask.is_some(), masked);
            assert_eq!(decoded.payload, payload);
        }
    }
}

#[test]
fn test_ws_frame_incomplete_input_consumes_nothing() {
    let frame = WsFrame::masked(true, OpCode::Text, b"fragmented arrival".to_vec());
    let encoded = encode_frame(&frame);
    for prefix in 0..encoded.len() {
        assert!(decode_frame(&encoded[..prefix], 1 << 20).unwrap().is_none());
    }
    assert!(decode_frame(&encoded, 1 << 20).unwrap().is_some());
}

#[test]
fn test_ws_control_frame_rules() {
    // A ping without the FIN bit set is a protocol violation.
    let fragmented_ping = [0x09u8, 0x00];
    assert!(matches!(
        decode_frame(&fragmented_ping, 1 << 20),
        Err(Error::ProtocolError(_))
    ));

    // Control frames announcing an extended payload exceed the 125 bytes
    // they are allowed to carry.
    let oversized_close = [0x88u8, 126, 0x00, 0xC8];
    assert!(matches!(
        decode_frame(&oversized_close, 1 << 20),
        Err(Error::FrameTooLarge(_, _))
    ));
}

#[test]
fn test_ws_reserved_flags_rejected() {
    let rsv1_text = [0xC1u8, 0x00];
    assert!(matches!(
        decode_frame(&rsv1_text, 1 << 20),
        Err(Error::ProtocolError(_))
    ));
}

#[test]
fn test_ws_frame_size_limit() {
    let frame = WsFrame::new(true, OpCode::Binary, vec![0u8; 2048]);
    let encoded = encode_frame(&frame);
    assert!(matches!(
        decode_frame(&encoded, 1024),
        Err(Error::FrameTooLarge(2048, 1024))
    ));
}

// ---------------------------------------------------------------------------
// websocket handshake

#[test]
fn test_websocket_accept_value() {
    // Sample nonce straight from RFC 6455.
    assert_eq!(
        generate_websocket_accept_value("dGhlIHNhbXBsZSBub25jZQ=="),
        "s3pPLMBiTxaQ9kYGzzhZRbK+xOo="
    );
}

#[test]
fn test_construct_http_request_valid() {
    let (request, host_with_port) =
        construct_http_request("ws://localhost:8080", "dGhlIHNhbXBsZSBub25jZQ==").unwrap();
    assert_eq!(host_with_port, "localhost:8080");
    assert!(request.starts_with("GET / HTTP/1.1"));
    assert!(request.contains("Host: localhost:8080"));
    assert!(request.contains("Upgrade: websocket"));
    assert!(request.contains("Sec-WebSocket-Key: dGhlIHNhbXBsZSBub25jZQ=="));
}

#[test]
fn test_construct_http_request_invalid_scheme() {
    let result = construct_http_request("ftp://localhost:8080", "dGhlIHNhbXBsZSBub25jZQ==");
    assert!(matches!(result, Err(Error::InvalidSchemeURL)));
}

#[test]
fn test_construct_http_request_no_host() {
    let result = construct_http_request("ws://:8080", "dGhlIHNhbXBsZSBub25jZQ==");
    assert!(result.is_err());
}

#[tokio::test]
async fn test_server_upgrade_answers_with_accept() {
    let (mut client, mut server) = tokio::io::duplex(4096);

    let request = "GET /chat HTTP/1.1\r\nHost: localhost\r\nConnection: Upgrade\r\nUpgrade: websocket\r\nSec-WebSocket-Key: dGhlIHNhbXBsZSBub25jZQ==\r\nSec-WebSocket-Version: 13\r\n\r\n";
    client.write_all(request.as_bytes()).await.unwrap();

    accept_upgrade(&mut server).await.unwrap();

    let mut response = vec![0u8; 1024];
    let n = tokio::io::AsyncReadExt::read(&mut client, &mut response)
        .await
        .unwrap();
    let response = String::from_utf8_lossy(&response[..n]).to_string();
    assert!(response.starts_with("HTTP/1.1 101 Switching Protocols"));
    assert!(response.contains("Sec-WebSocket-Accept: s3pPLMBiTxaQ9kYGzzhZRbK+xOo="));
}

#[tokio::test]
async fn test_server_upgrade_rejects_unsupported_version() {
    let (mut client, mut server) = tokio::io::duplex(4096);

    let request = "GET / HTTP/1.1\r\nHost: localhost\r\nConnection: Upgrade\r\nUpgrade: websocket\r\nSec-WebSocket-Key: dGhlIHNhbXBsZSBub25jZQ==\r\nSec-WebSocket-Version: 12\r\n\r\n";
    client.write_all(request.as_bytes()).await.unwrap();

    let result = accept_upgrade(&mut server).await;
    assert!(matches!(result, Err(Error::UnsupportedVersion)));
}

#[tokio::test]
async fn test_client_server_upgrade_round_trip() {
    let (mut client, mut server) = tokio::io::duplex(4096);

    let server_side = tokio::spawn(async move { accept_upgrade(&mut server).await });
    connect_upgrade(&mut client, "ws://localhost/chat")
        .await
        .unwrap();
    server_side.await.unwrap().unwrap();
}

// ---------------------------------------------------------------------------
// hash placement

fn sample_keys(count: usize) -> Vec<String> {
    (0..count).map(|i| format!("k{}", i)).collect()
}

#[test]
fn test_ring_is_deterministic() {
    let mut first = HashRing::new("backends");
    let mut second = HashRing::new("backends");
    for name in ["alpha", "beta", "gamma", "delta"] {
        first.add_node(HashNode::new(name));
        second.add_node(HashNode::new(name));
    }

    for key in sample_keys(200) {
        let a = first.get_node(&key).unwrap().key.clone();
        let b = second.get_node(&key).unwrap().key.clone();
        assert_eq!(a, b);
        // Lookup has no side effects, asking twice answers the same.
        assert_eq!(a, first.get_node(&key).unwrap().key);
    }

    let cloned = first.clone();
    for key in sample_keys(200) {
        assert_eq!(
            cloned.get_node(&key).unwrap().key,
            first.get_node(&key).unwrap().key
        );
    }
}

#[test]
fn test_ring_addition_only_moves_keys_to_new_node() {
    let mut ring = HashRing::new("backends");
    for name in ["alpha", "beta", "gamma"] {
        ring.add_node(HashNode::new(name));
    }

    let keys = sample_keys(1000);
    let before: Vec<String> = keys
        .iter()
        .map(|key| ring.get_node(key).unwrap().key.clone())
        .collect();

    ring.add_node(HashNode::new("delta"));

    for (key, old_owner) in keys.iter().zip(&before) {
        let new_owner = &ring.get_node(key).unwrap().key;
        if new_owner != old_owner {
            assert_eq!(new_owner, "delta");
        }
    }
}

#[test]
fn test_ring_removal_only_moves_keys_of_removed_node() {
    let mut ring = HashRing::new("backends");
    for name in ["alpha", "beta", "gamma", "delta"] {
        ring.add_node(HashNode::new(name));
    }

    let keys = sample_keys(1000);
    let before: Vec<String> = keys
        .iter()
        .map(|key| ring.get_node(key).unwrap().key.clone())
        .collect();

    ring.remove_node("beta");

    for (key, old_owner) in keys.iter().zip(&before) {
        let new_owner = &ring.get_node(key).unwrap().key;
        if old_owner != "beta" {
            assert_eq!(new_owner, old_owner);
        } else {
            assert_ne!(new_owner, "beta");
        }
    }
}

#[test]
fn test_ring_duplicate_keys_ignored() {
    let mut ring = HashRing::new("backends");
    ring.add_node(HashNode::new("alpha"));
    ring.add_node(HashNode::with_weight("alpha", 64));
    assert_eq!(ring.node_count(), 1);
    assert_eq!(ring.get_node("anything").unwrap().weight, 16);
}

#[test]
fn test_ring_disable_enable_round_trip() {
    let mut ring = HashRing::new("backends");
    for name in ["alpha", "beta", "gamma"] {
        ring.add_node(HashNode::new(name));
    }

    let keys = sample_keys(500);
    let before: Vec<String> = keys
        .iter()
        .map(|key| ring.get_node(key).unwrap().key.clone())
        .collect();

    ring.disable_node("beta");
    for key in &keys {
        assert_ne!(ring.get_node(key).unwrap().key, "beta");
    }

    ring.enable_node("beta");
    for (key, old_owner) in keys.iter().zip(&before) {
        assert_eq!(&ring.get_node(key).unwrap().key, old_owner);
    }
}

#[test]
fn test_ring_filter() {
    let mut ring = HashRing::new("backends");
    for name in ["alpha", "beta", "gamma", "delta"] {
        ring.add_node(HashNode::new(name));
    }

    let filtered = ring.filter(&["alpha", "beta"]);
    assert_eq!(filtered.node_count(), 2);
    for key in sample_keys(200) {
        let owner = filtered.get_node(&key).unwrap().key.clone();
        assert!(owner == "alpha" || owner == "beta");
    }
}

#[test]
fn test_ring_empty_returns_none() {
    let ring = HashRing::new("backends");
    assert!(ring.get_node("k").is_none());

    let mut drained = HashRing::new("backends");
    drained.add_node(HashNode::new("alpha"));
    drained.reset();
    assert!(drained.get_node("k").is_none());
}

#[test]
fn test_maglev_balance() {
    let mut maglev = MaglevHash::new("backends");
    maglev.add_nodes((0..16).map(|i| HashNode::new(format!("node{}", i))).collect());

    // 16 nodes with 16 virtual entries each round up to the next prime.
    assert_eq!(maglev.table_len(), 257);

    let mut keys_per_node: HashMap<String, usize> = HashMap::new();
    for key in sample_keys(100_000) {
        *keys_per_node
            .entry(maglev.get_node(&key).unwrap().key.clone())
            .or_default() += 1;
    }
    assert_eq!(keys_per_node.len(), 16);

    // Every node owns either floor(257/16) or ceil(257/16) table slots, so
    // with a large uniform key sample each share stays near 1/16.
    for (_, count) in keys_per_node {
        assert!(count > 5_700, "count {} too low", count);
        assert!(count < 7_100, "count {} too high", count);
    }
}

#[test]
fn test_maglev_is_deterministic() {
    let mut first = MaglevHash::new("backends");
    let mut second = MaglevHash::new("backends");
    for i in 0..8 {
        first.add_node(HashNode::new(format!("node{}", i)));
        second.add_node(HashNode::new(format!("node{}", i)));
    }
    for key in sample_keys(500) {
        assert_eq!(
            first.get_node(&key).unwrap().key,
            second.get_node(&key).unwrap().key
        );
    }
}

#[test]
fn test_maglev_minimal_disruption_on_removal() {
    // A virtual entry count large enough pins the table length at the top
    // of the prime table, so the removal is measured against an unchanged
    // table geometry.
    let mut maglev = MaglevHash::with_hash_fn("backends", crate::hash::md5_hash, 100);
    maglev.add_nodes((0..16).map(|i| HashNode::new(format!("node{}", i))).collect());
    assert_eq!(maglev.table_len(), 997);

    let keys = sample_keys(100_000);
    let before: Vec<String> = keys
        .iter()
        .map(|key| maglev.get_node(key).unwrap().key.clone())
        .collect();

    maglev.remove_node("node0");
    assert_eq!(maglev.table_len(), 997);

    let mut moved = 0;
    for (key, old_owner) in keys.iter().zip(&before) {
        if &maglev.get_node(key).unwrap().key != old_owner {
            moved += 1;
        }
    }

    // Keys owned by the removed node have to move (about 1/16 of them), and
    // only a slice of the remainder may get shuffled by the refill. A naive
    // rebuild would reshuffle nearly everything.
    assert!(moved >= 3_000, "moved only {}", moved);
    assert!(moved <= 30_000, "moved {} keys, far from minimal", moved);

    for (key, old_owner) in keys.iter().zip(&before) {
        if old_owner == "node0" {
            assert_ne!(&maglev.get_node(key).unwrap().key, "node0");
        }
    }
}

#[test]
fn test_maglev_prime_table_saturates() {
    let mut maglev = MaglevHash::with_hash_fn("backends", crate::hash::md5_hash, 500);
    maglev.add_nodes((0..16).map(|i| HashNode::new(format!("node{}", i))).collect());
    // 16 * 500 is far past the last prime on file.
    assert_eq!(maglev.table_len(), 997);
}

#[test]
fn test_maglev_empty_returns_none() {
    let maglev = MaglevHash::new("backends");
    assert!(maglev.get_node("k").is_none());
}

// ---------------------------------------------------------------------------
// error registry

#[test]
fn test_error_code_registry() {
    registry().register(9001, "TestError").unwrap();
    assert!(matches!(
        registry().register(9001, "TestErrorAgain"),
        Err(Error::DuplicatedErrorCode(9001))
    ));

    let err = registry().error_for_code(9001, "boom".to_string());
    assert!(matches!(
        err,
        Error::Remote {
            name: "TestError",
            code: 9001,
            ..
        }
    ));

    let unknown = registry().error_for_code(123_456, "boom".to_string());
    assert!(matches!(unknown, Error::Remote { name: "RemoteError", .. }));
}

// ---------------------------------------------------------------------------
// connection and channel

#[tokio::test]
async fn test_echo_rpc_hundred_concurrent_callers() {
    init_logs();
    let (_server, endpoint) = start_echo_server(echo_server_config()).await;

    let client = Channel::new(ChannelConfig::default());
    let conn = client.connect(&endpoint, Some(Duration::from_secs(1))).await.unwrap();
    let stub = Arc::new(ServiceStub::new(conn));

    let calls = (0..100).map(|_| {
        let stub = Arc::clone(&stub);
        async move {
            let message: Vec<u8> = (0..1024).map(|_| rand::random()).collect();
            let request = EchoMessage {
                message: message.clone(),
            };
            let response: EchoMessage = stub.call(&ECHO, &request, None, None).await.unwrap();
            assert_eq!(response.message, message);
        }
    });
    join_all(calls).await;
}

#[tokio::test]
async fn test_unix_socket_echo() {
    init_logs();
    let path = std::env::temp_dir().join(format!("rpc-flow-test-{}.sock", rand::random::<u32>()));

    let server = Channel::new(ChannelConfig::default());
    register_echo_handlers(&server);
    let endpoint = server.listen(Endpoint::unix(&path)).await.unwrap();
    server.start();

    let client = Channel::new(ChannelConfig::default());
    let conn = client.connect(&endpoint, Some(Duration::from_secs(1))).await.unwrap();
    let stub = ServiceStub::new(conn);

    let request = EchoMessage {
        message: b"over the unix socket".to_vec(),
    };
    let response: EchoMessage = stub.call(&ECHO, &request, None, None).await.unwrap();
    assert_eq!(response.message, request.message);

    let _ = std::fs::remove_file(&path);
}

#[tokio::test]
async fn test_method_not_found_surfaces_remote_error() {
    init_logs();
    let (_server, endpoint) = start_echo_server(echo_server_config()).await;

    let client = Channel::new(ChannelConfig::default());
    let conn = client.connect(&endpoint, Some(Duration::from_secs(1))).await.unwrap();
    let stub = ServiceStub::new(conn);

    let missing = MethodDescriptor::unary("GhostService.vanish");
    let result: Result<EchoMessage, Error> = stub
        .call(&missing, &EchoMessage { message: vec![] }, None, None)
        .await;
    match result {
        Err(Error::Remote { name, code, .. }) => {
            assert_eq!(name, "MethodNotFound");
            assert_eq!(code, codes::METHOD_NOT_FOUND);
        }
        other => panic!("expected remote error, got {:?}", other.map(|_| ())),
    }
}

#[tokio::test]
async fn test_handler_error_reraised_on_caller_side() {
    init_logs();
    let server = Channel::new(ChannelConfig::default());
    server.on_request("FailingService.fail", |_conn, _packet| {
        async move {
            Err(Error::Remote {
                name: "HandlerFailed",
                code: codes::HANDLER_FAILED,
                message: "told you so".to_string(),
            })
        }
        .boxed()
    });
    let endpoint = server.listen(Endpoint::tcp("127.0.0.1:0")).await.unwrap();
    server.start();

    let client = Channel::new(ChannelConfig::default());
    let conn = client.connect(&endpoint, Some(Duration::from_secs(1))).await.unwrap();
    let stub = ServiceStub::new(conn);

    let failing = MethodDescriptor::unary("FailingService.fail");
    let result: Result<EchoMessage, Error> = stub
        .call(&failing, &EchoMessage { message: vec![] }, None, None)
        .await;
    match result {
        Err(Error::Remote { code, message, .. }) => {
            assert_eq!(code, codes::HANDLER_FAILED);
            assert!(message.contains("told you so"));
        }
        other => panic!("expected remote error, got {:?}", other.map(|_| ())),
    }
}

#[tokio::test]
async fn test_rpc_timeout_removes_slot_and_drops_late_response() {
    init_logs();
    let (_server, endpoint) = start_echo_server(echo_server_config()).await;

    let client = Channel::new(ChannelConfig::default());
    let conn = client.connect(&endpoint, Some(Duration::from_secs(1))).await.unwrap();
    let stub = ServiceStub::new(Arc::clone(&conn));

    let request = EchoMessage {
        message: b"slow down".to_vec(),
    };
    let result: Result<EchoMessage, Error> = stub
        .call(&SLOW_ECHO, &request, None, Some(Duration::from_millis(50)))
        .await;
    assert!(matches!(result, Err(Error::Timeout { .. })));
    assert_eq!(conn.pending_transmissions(), 0);

    // Let the late response arrive, it has no slot left and is dropped
    // silently. The connection keeps serving afterwards.
    tokio::time::sleep(Duration::from_millis(500)).await;
    let response: EchoMessage = stub.call(&ECHO, &request, None, None).await.unwrap();
    assert_eq!(response.message, request.message);
}

#[tokio::test]
async fn test_close_fails_pending_calls() {
    init_logs();
    let (_server, endpoint) = start_echo_server(echo_server_config()).await;

    let client = Channel::new(ChannelConfig::default());
    let conn = client.connect(&endpoint, Some(Duration::from_secs(1))).await.unwrap();
    let stub = Arc::new(ServiceStub::new(Arc::clone(&conn)));

    let pending = {
        let stub = Arc::clone(&stub);
        tokio::spawn(async move {
            stub.call::<EchoMessage, EchoMessage>(
                &SLOW_ECHO,
                &EchoMessage { message: vec![1] },
                None,
                Some(Duration::from_secs(5)),
            )
            .await
        })
    };

    tokio::time::sleep(Duration::from_millis(100)).await;
    conn.close(None, false);

    let result = pending.await.unwrap();
    assert!(matches!(result, Err(Error::ConnectionClosed(_))));
    assert_eq!(conn.pending_transmissions(), 0);
}

#[tokio::test]
async fn test_close_is_idempotent_and_callback_fires_once() {
    init_logs();
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let accept = tokio::spawn(async move { listener.accept().await.unwrap().0 });
    let stream = TcpStream::connect(addr).await.unwrap();
    let _peer = accept.await.unwrap();

    let conn = Connection::new(
        NetStream::tcp(stream).unwrap(),
        false,
        ConnectionConfig::default(),
    );
    let fired = Arc::new(AtomicUsize::new(0));
    let fired_clone = Arc::clone(&fired);
    conn.set_close_cb(Box::new(move |_conn, _reason| {
        fired_clone.fetch_add(1, Ordering::SeqCst);
    }));

    conn.close(None, false);
    conn.close(Some(Error::NoConnection), true);
    conn.close(None, false);

    assert!(wait_until(|| fired.load(Ordering::SeqCst) == 1, Duration::from_secs(1)).await);
    assert!(conn.is_closed());
    assert!(conn.send(vec![1, 2, 3]).is_err());

    conn.close(None, false);
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(fired.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_heartbeat_timeout_closes_silent_connection() {
    init_logs();
    let mut config = ChannelConfig::default();
    config.heartbeat = Some(HeartbeatConfig {
        interval: Duration::from_millis(100),
        max_timeouts: 3,
    });
    let (server, endpoint) = start_echo_server(config).await;

    let started = Instant::now();
    let client = Channel::new(ChannelConfig::default());
    let conn = client.connect(&endpoint, Some(Duration::from_secs(1))).await.unwrap();

    assert!(wait_until(|| server.connection_count() == 1, Duration::from_secs(1)).await);
    // Complete silence from the client from here on.
    assert!(wait_until(|| server.connection_count() == 0, Duration::from_secs(2)).await);
    let elapsed = started.elapsed();
    assert!(elapsed >= Duration::from_millis(250), "closed after {:?}", elapsed);

    // The orderly shutdown reaches the client as an end of stream.
    assert!(wait_until(|| conn.is_closed(), Duration::from_secs(1)).await);
}

#[tokio::test]
async fn test_client_heartbeat_keeps_connection_alive() {
    init_logs();
    let mut config = ChannelConfig::default();
    config.heartbeat = Some(HeartbeatConfig {
        interval: Duration::from_millis(100),
        max_timeouts: 3,
    });
    let (server, endpoint) = start_echo_server(config).await;

    let client = Channel::new(ChannelConfig::default());
    let conn = client.connect(&endpoint, Some(Duration::from_secs(1))).await.unwrap();
    conn.setup_client_heartbeat(Duration::from_millis(50));

    tokio::time::sleep(Duration::from_millis(700)).await;
    assert_eq!(server.connection_count(), 1);
    assert!(!conn.is_closed());
}

#[tokio::test]
async fn test_concurrency_cap_refuses_and_resumes() {
    init_logs();
    let mut config = echo_server_config();
    config.max_concurrency = 2;
    let (server, endpoint) = start_echo_server(config).await;

    let client = Channel::new(ChannelConfig::default());
    let first = client.connect(&endpoint, Some(Duration::from_secs(1))).await.unwrap();
    let _second = client.connect(&endpoint, Some(Duration::from_secs(1))).await.unwrap();
    // The third connect succeeds at the TCP level, the kernel backlog holds
    // it while the channel refuses to accept past the cap.
    let _third = client.connect(&endpoint, Some(Duration::from_secs(1))).await.unwrap();

    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(server.connection_count(), 2);

    let before_ids: Vec<u64> = server.connections().iter().map(|conn| conn.conn_id).collect();
    first.close(None, false);
    // The freed slot lets the accept loop pick up the parked connection, a
    // fresh conn_id shows up in the live map.
    assert!(
        wait_until(
            || {
                let ids: Vec<u64> =
                    server.connections().iter().map(|conn| conn.conn_id).collect();
                ids.len() == 2 && ids.iter().any(|id| !before_ids.contains(id))
            },
            Duration::from_secs(2)
        )
        .await
    );
    assert_eq!(server.connection_count(), 2);
}

#[tokio::test]
async fn test_broadcast_reaches_every_connection_exactly_once() {
    init_logs();
    let (server, endpoint) = start_echo_server(echo_server_config()).await;

    let received: Arc<Mutex<HashMap<u64, usize>>> = Arc::new(Mutex::new(HashMap::new()));
    let client = Channel::new(ChannelConfig::default());
    let received_clone = Arc::clone(&received);
    client.on_notification(NEWS.service_method, move |conn, _packet| {
        let received = Arc::clone(&received_clone);
        async move {
            *received.lock().unwrap().entry(conn.conn_id).or_default() += 1;
        }
        .boxed()
    });

    let mut client_conns = Vec::new();
    for _ in 0..20 {
        client_conns.push(client.connect(&endpoint, Some(Duration::from_secs(1))).await.unwrap());
    }
    assert!(wait_until(|| server.connection_count() == 20, Duration::from_secs(2)).await);

    let frame = codec::encode(
        ParserTag::Postcard,
        Meta::notification(NEWS.service_method),
        &codec::encode_payload(ParserTag::Postcard, &EchoMessage { message: b"extra".to_vec() }).unwrap(),
        8192,
    )
    .unwrap();
    server.broadcast(&frame);

    assert!(
        wait_until(
            || received.lock().unwrap().values().sum::<usize>() == 20,
            Duration::from_secs(2)
        )
        .await
    );
    tokio::time::sleep(Duration::from_millis(200)).await;
    {
        let received = received.lock().unwrap();
        assert_eq!(received.len(), 20);
        assert!(received.values().all(|&count| count == 1));
    }

    // Server goes away, every client observes its connection closing.
    for conn in server.connections() {
        conn.close(None, false);
    }
    assert!(
        wait_until(
            || client_conns.iter().all(|conn| conn.is_closed()),
            Duration::from_secs(2)
        )
        .await
    );
}

#[tokio::test]
async fn test_oversized_frame_resets_only_offender() {
    init_logs();
    let (server, endpoint) = start_echo_server(echo_server_config()).await;

    let client = Channel::new(ChannelConfig::default());
    let healthy = client.connect(&endpoint, Some(Duration::from_secs(1))).await.unwrap();
    let stub = ServiceStub::new(healthy);
    assert!(wait_until(|| server.connection_count() == 1, Duration::from_secs(1)).await);

    // A raw peer declaring a frame far beyond the limit.
    let addr = match &endpoint {
        Endpoint::Tcp(addr) => addr.clone(),
        Endpoint::Unix(_) => unreachable!(),
    };
    let mut offender = TcpStream::connect(addr).await.unwrap();
    assert!(wait_until(|| server.connection_count() == 2, Duration::from_secs(1)).await);

    let mut bogus = vec![1u8];
    bogus.extend_from_slice(&((16 * 1024) as u32).to_be_bytes());
    offender.write_all(&bogus).await.unwrap();

    assert!(wait_until(|| server.connection_count() == 1, Duration::from_secs(2)).await);

    // The neighbour never noticed.
    let request = EchoMessage {
        message: b"still here".to_vec(),
    };
    let response: EchoMessage = stub.call(&ECHO, &request, None, None).await.unwrap();
    assert_eq!(response.message, request.message);
}

#[tokio::test]
async fn test_accept_loop_starts_and_stops() {
    init_logs();
    let server = Channel::new(ChannelConfig::default());
    register_echo_handlers(&server);
    let endpoint = server.listen(Endpoint::tcp("127.0.0.1:0")).await.unwrap();
    // Deliberately not started yet.

    let client = Channel::new(ChannelConfig::default());
    let conn = client.connect(&endpoint, Some(Duration::from_secs(1))).await.unwrap();
    let stub = ServiceStub::new(Arc::clone(&conn));

    let request = EchoMessage {
        message: b"anyone there?".to_vec(),
    };
    let result: Result<EchoMessage, Error> = stub
        .call(&ECHO, &request, None, Some(Duration::from_millis(200)))
        .await;
    assert!(matches!(result, Err(Error::Timeout { .. })));

    server.start();
    assert!(wait_until(|| server.connection_count() == 1, Duration::from_secs(2)).await);

    let response: EchoMessage = stub.call(&ECHO, &request, None, None).await.unwrap();
    assert_eq!(response.message, request.message);

    // Stopping parks the accept loop again, later arrivals sit in the
    // backlog. Connections accepted earlier keep working.
    server.stop();
    let parked = client.connect(&endpoint, Some(Duration::from_secs(1))).await.unwrap();
    let parked_stub = ServiceStub::new(parked);
    let result: Result<EchoMessage, Error> = parked_stub
        .call(&ECHO, &request, None, Some(Duration::from_millis(200)))
        .await;
    assert!(matches!(result, Err(Error::Timeout { .. })));
    let response: EchoMessage = stub.call(&ECHO, &request, None, None).await.unwrap();
    assert_eq!(response.message, request.message);

    server.start();
    assert!(wait_until(|| server.connection_count() == 2, Duration::from_secs(2)).await);
}

#[tokio::test]
async fn test_notification_and_stub_broadcast() {
    init_logs();
    let server = Channel::new(ChannelConfig::default());
    let (seen_tx, mut seen_rx) = mpsc::unbounded_channel();
    server.on_notification(NEWS.service_method, move |_conn, packet| {
        let seen_tx = seen_tx.clone();
        async move {
            let news: EchoMessage =
                codec::decode_payload(ParserTag::Postcard, &packet.content).unwrap();
            let _ = seen_tx.send(news.message);
        }
        .boxed()
    });
    let endpoint = server.listen(Endpoint::tcp("127.0.0.1:0")).await.unwrap();
    server.start();

    let client = Channel::new(ChannelConfig::default());
    let first = client.connect(&endpoint, Some(Duration::from_secs(1))).await.unwrap();
    let second = client.connect(&endpoint, Some(Duration::from_secs(1))).await.unwrap();

    let stub = ServiceStub::new(Arc::clone(&first));
    stub.notify(&NEWS, &EchoMessage { message: b"single".to_vec() }, None)
        .unwrap();
    assert_eq!(seen_rx.recv().await.unwrap(), b"single");

    stub.broadcast(
        &NEWS,
        &EchoMessage { message: b"everyone".to_vec() },
        &[first, second],
    )
    .unwrap();
    assert_eq!(seen_rx.recv().await.unwrap(), b"everyone");
    assert_eq!(seen_rx.recv().await.unwrap(), b"everyone");
}

#[tokio::test]
async fn test_transmission_ids_are_monotonic() {
    init_logs();
    let (_server, endpoint) = start_echo_server(echo_server_config()).await;
    let client = Channel::new(ChannelConfig::default());
    let conn = client.connect(&endpoint, Some(Duration::from_secs(1))).await.unwrap();

    let first = conn.next_transmission_id();
    let second = conn.next_transmission_id();
    let third = conn.next_transmission_id();
    assert_eq!(second, first + 1);
    assert_eq!(third, second + 1);
}
