//! WebSocket handshake and frame codec against a fake transport.

mod common;

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use cellular_mux::WebSocket;
use common::{init_log, wait_until, FakeFactory};

/// Answer the upgrade request from a background thread while `connect`
/// blocks, then return the connected socket.
fn connect_ws(factory: &Arc<FakeFactory>, uri: &str, accept: bool) -> (WebSocket, bool) {
    let mut ws = WebSocket::new(factory.clone(), 0);

    let handshake_factory = factory.clone();
    let responder = thread::spawn(move || {
        assert!(wait_until(
            || {
                handshake_factory
                    .last
                    .lock()
                    .unwrap()
                    .as_ref()
                    .map(|c| c.has_stream_callback() && !c.sent_frames().is_empty())
                    .unwrap_or(false)
            },
            Duration::from_secs(5)
        ));
        let connection = handshake_factory.last_connection();
        if accept {
            connection.feed(b"HTTP/1.1 101 Switching Protocols\r\n\r\n");
        } else {
            connection.feed(b"HTTP/1.1 403 Forbidden\r\n\r\n");
        }
    });

    let connected = ws.connect(uri);
    responder.join().unwrap();
    (ws, connected)
}

#[test]
fn handshake_and_text_frame() {
    init_log();
    let factory = Arc::new(FakeFactory::default());

    let connected_flag = Arc::new(AtomicBool::new(false));
    let received: Arc<Mutex<Vec<(Vec<u8>, bool)>>> = Arc::new(Mutex::new(Vec::new()));

    let mut ws = WebSocket::new(factory.clone(), 0);
    let flag = connected_flag.clone();
    ws.on_connected(Box::new(move || flag.store(true, Ordering::SeqCst)));
    let sink = received.clone();
    ws.on_data(Box::new(move |data, binary| {
        sink.lock().unwrap().push((data.to_vec(), binary))
    }));

    let handshake_factory = factory.clone();
    let responder = thread::spawn(move || {
        assert!(wait_until(
            || {
                handshake_factory
                    .last
                    .lock()
                    .unwrap()
                    .as_ref()
                    .map(|c| !c.sent_frames().is_empty())
                    .unwrap_or(false)
            },
            Duration::from_secs(5)
        ));
        handshake_factory
            .last_connection()
            .feed(b"HTTP/1.1 101 Switching Protocols\r\n\r\n");
    });

    assert!(ws.connect("ws://host/path"));
    responder.join().unwrap();
    assert!(ws.is_connected());
    assert!(connected_flag.load(Ordering::SeqCst));

    let connection = factory.last_connection();
    let request = String::from_utf8(connection.sent_frames()[0].clone()).unwrap();
    assert!(request.starts_with("GET /path HTTP/1.1\r\n"));
    assert!(request.contains("Host: host\r\n"));
    assert!(request.contains("Upgrade: websocket\r\n"));
    assert!(request.contains("Connection: Upgrade\r\n"));
    assert!(request.contains("Sec-WebSocket-Version: 13\r\n"));
    assert!(request.contains("Sec-WebSocket-Key: "));

    // Unmasked server frame: 0x81 0x05 "Hello".
    connection.feed(&[0x81, 0x05, b'H', b'e', b'l', b'l', b'o']);
    assert!(wait_until(
        || !received.lock().unwrap().is_empty(),
        Duration::from_secs(2)
    ));
    let events = received.lock().unwrap();
    assert_eq!(events[0], (b"Hello".to_vec(), false));
}

#[test]
fn rejected_handshake_fails_connect() {
    init_log();
    let factory = Arc::new(FakeFactory::default());
    let (ws, connected) = connect_ws(&factory, "ws://host/", false);
    assert!(!connected);
    assert!(!ws.is_connected());
}

#[test]
fn client_frames_are_masked() {
    init_log();
    let factory = Arc::new(FakeFactory::default());
    let (ws, connected) = connect_ws(&factory, "ws://host/", true);
    assert!(connected);
    let connection = factory.last_connection();

    assert!(ws.send(b"Hi", false, true));
    let frame = connection.sent_frames().last().unwrap().clone();
    assert_eq!(frame[0], 0x81); // FIN + text
    assert_eq!(frame[1] & 0x80, 0x80); // MASK set
    assert_eq!((frame[1] & 0x7F) as usize, 2);
    let mask = &frame[2..6];
    let payload: Vec<u8> = frame[6..8]
        .iter()
        .enumerate()
        .map(|(i, &b)| b ^ mask[i % 4])
        .collect();
    assert_eq!(payload, b"Hi");
}

#[test]
fn oversized_payloads_are_refused() {
    init_log();
    let factory = Arc::new(FakeFactory::default());
    let (ws, connected) = connect_ws(&factory, "ws://host/", true);
    assert!(connected);
    assert!(!ws.send(&vec![0u8; 70000], true, true));
}

#[test]
fn fragmented_message_reassembly() {
    init_log();
    let factory = Arc::new(FakeFactory::default());
    let received: Arc<Mutex<Vec<(Vec<u8>, bool)>>> = Arc::new(Mutex::new(Vec::new()));

    let (mut ws, connected) = connect_ws(&factory, "ws://host/", true);
    assert!(connected);
    let sink = received.clone();
    ws.on_data(Box::new(move |data, binary| {
        sink.lock().unwrap().push((data.to_vec(), binary))
    }));

    let connection = factory.last_connection();
    // Binary frame without FIN, then the final continuation.
    connection.feed(&[0x02, 0x03, b'f', b'o', b'o']);
    connection.feed(&[0x80, 0x03, b'b', b'a', b'r']);

    assert!(wait_until(
        || !received.lock().unwrap().is_empty(),
        Duration::from_secs(2)
    ));
    let events = received.lock().unwrap();
    assert_eq!(events.len(), 1);
    assert_eq!(events[0], (b"foobar".to_vec(), true));
}

#[test]
fn masked_server_frame_is_unmasked() {
    init_log();
    let factory = Arc::new(FakeFactory::default());
    let received: Arc<Mutex<Vec<(Vec<u8>, bool)>>> = Arc::new(Mutex::new(Vec::new()));

    let (mut ws, connected) = connect_ws(&factory, "ws://host/", true);
    assert!(connected);
    let sink = received.clone();
    ws.on_data(Box::new(move |data, binary| {
        sink.lock().unwrap().push((data.to_vec(), binary))
    }));

    // Mask key 1,2,3,4 over "AB"; the parser honors the MASK bit even on
    // server frames.
    let frame = [0x81, 0x82, 1, 2, 3, 4, b'A' ^ 1, b'B' ^ 2];
    factory.last_connection().feed(&frame);

    assert!(wait_until(
        || !received.lock().unwrap().is_empty(),
        Duration::from_secs(2)
    ));
    assert_eq!(received.lock().unwrap()[0], (b"AB".to_vec(), false));
}

#[test]
fn ping_is_answered_with_pong() {
    init_log();
    let factory = Arc::new(FakeFactory::default());
    let (_ws, connected) = connect_ws(&factory, "ws://host/", true);
    assert!(connected);
    let connection = factory.last_connection();

    connection.feed(&[0x89, 0x02, b'h', b'i']);

    // The pong goes out from a helper thread.
    assert!(wait_until(
        || {
            connection
                .sent_frames()
                .iter()
                .any(|f| f.len() >= 2 && f[0] == 0x8A)
        },
        Duration::from_secs(2)
    ));
    let frames = connection.sent_frames();
    let pong = frames.iter().find(|f| f[0] == 0x8A).unwrap();
    assert_eq!(pong[1] & 0x80, 0x80);
    assert_eq!((pong[1] & 0x7F) as usize, 2);
    let mask = &pong[2..6];
    let payload: Vec<u8> = pong[6..8]
        .iter()
        .enumerate()
        .map(|(i, &b)| b ^ mask[i % 4])
        .collect();
    assert_eq!(payload, b"hi");
}

#[test]
fn close_frame_from_server_disconnects() {
    init_log();
    let factory = Arc::new(FakeFactory::default());
    let disconnects = Arc::new(AtomicUsize::new(0));

    let (mut ws, connected) = connect_ws(&factory, "ws://host/", true);
    assert!(connected);
    let counter = disconnects.clone();
    ws.on_disconnected(Box::new(move || {
        counter.fetch_add(1, Ordering::SeqCst);
    }));

    factory.last_connection().feed(&[0x88, 0x00]);
    assert!(wait_until(
        || disconnects.load(Ordering::SeqCst) == 1,
        Duration::from_secs(2)
    ));
    assert!(!ws.is_connected());
}

#[test]
fn wss_uses_tls_transport() {
    init_log();
    let factory = Arc::new(FakeFactory::default());
    let (_ws, connected) = connect_ws(&factory, "wss://secure/feed", true);
    assert!(connected);
    assert!(factory.created_ssl.load(Ordering::SeqCst));
}
