//! Streaming HTTP/1.1 client against a fake transport.

mod common;

use std::sync::Arc;
use std::thread;
use std::time::Duration;

use cellular_mux::{Http, HttpClient};
use common::{init_log, FakeFactory};

fn open_get(factory: &Arc<FakeFactory>, url: &str) -> HttpClient {
    let mut http = HttpClient::new(factory.clone(), 0);
    http.set_timeout(Duration::from_secs(2));
    assert!(http.open("GET", url));
    http
}

#[test]
fn chunked_response_roundtrip() {
    init_log();
    let factory = Arc::new(FakeFactory::default());
    let mut http = open_get(&factory, "http://host/path");
    let connection = factory.last_connection();

    let request = String::from_utf8(connection.sent_bytes()).unwrap();
    assert!(request.starts_with("GET /path HTTP/1.1\r\n"));
    assert!(request.contains("Host: host\r\n"));
    assert!(request.contains("Connection: close\r\n"));

    connection.feed(b"HTTP/1.1 200 OK\r\nTransfer-Encoding: chunked\r\n\r\n");
    connection.feed(b"5\r\nHello\r\n6\r\n World\r\n");
    connection.feed(b"0\r\n\r\n");

    assert_eq!(http.get_status_code(), 200);
    assert_eq!(http.read_all(), b"Hello World");
    assert_eq!(http.get_body_length(), 0); // chunked: length unknown

    let mut buffer = [0u8; 16];
    assert_eq!(http.read(&mut buffer), 0);
}

#[test]
fn fixed_length_response_in_pieces() {
    init_log();
    let factory = Arc::new(FakeFactory::default());
    let mut http = open_get(&factory, "http://host:8080/data");
    let connection = factory.last_connection();

    let request = String::from_utf8(connection.sent_bytes()).unwrap();
    assert!(request.contains("Host: host:8080\r\n"));

    connection.feed(b"HTTP/1.1 200 OK\r\nContent-Le");
    connection.feed(b"ngth: 11\r\nX-Served-By: test\r\n\r\nHello");
    assert_eq!(http.get_status_code(), 200);
    assert_eq!(
        http.get_response_header("x-served-by").as_deref(),
        Some("test")
    );
    assert_eq!(http.get_body_length(), 11);

    let mut buffer = [0u8; 32];
    assert_eq!(http.read(&mut buffer), 5);
    assert_eq!(&buffer[..5], b"Hello");

    connection.feed(b" World");
    assert_eq!(http.read(&mut buffer), 6);
    assert_eq!(&buffer[..6], b" World");
    // Fixed-length EOF: nothing further extends the body.
    assert_eq!(http.read(&mut buffer), 0);
}

#[test]
fn premature_close_reports_error_after_drain() {
    init_log();
    let factory = Arc::new(FakeFactory::default());
    let mut http = open_get(&factory, "http://host/big");
    let connection = factory.last_connection();

    connection.feed(b"HTTP/1.1 200 OK\r\nContent-Length: 11\r\n\r\nHello");
    connection.drop_link();

    let mut buffer = [0u8; 32];
    assert_eq!(http.read(&mut buffer), 5);
    assert_eq!(&buffer[..5], b"Hello");
    assert_eq!(http.read(&mut buffer), -1);
    assert_eq!(http.read_all(), Vec::<u8>::new());
}

#[test]
fn clean_close_without_length_is_eof() {
    init_log();
    let factory = Arc::new(FakeFactory::default());
    let mut http = open_get(&factory, "http://host/stream");
    let connection = factory.last_connection();

    connection.feed(b"HTTP/1.1 200 OK\r\n\r\nHi");
    connection.drop_link();

    let mut buffer = [0u8; 8];
    assert_eq!(http.read(&mut buffer), 2);
    assert_eq!(&buffer[..2], b"Hi");
    assert_eq!(http.read(&mut buffer), 0);
}

#[test]
fn request_header_rules() {
    init_log();

    // Preset content: Content-Length is added for the caller.
    let factory = Arc::new(FakeFactory::default());
    let mut http = HttpClient::new(factory.clone(), 0);
    http.set_header("Content-Type", "application/json");
    http.set_content(b"{\"a\":1}".to_vec());
    assert!(http.open("POST", "http://host/api"));
    let request = String::from_utf8(factory.last_connection().sent_bytes()).unwrap();
    assert!(request.contains("Content-Type: application/json\r\n"));
    assert!(request.contains("Content-Length: 7\r\n"));
    assert!(request.ends_with("\r\n\r\n{\"a\":1}"));

    // No content: POST switches to chunked uploads.
    let factory = Arc::new(FakeFactory::default());
    let mut http = HttpClient::new(factory.clone(), 0);
    assert!(http.open("POST", "http://host/upload"));
    let connection = factory.last_connection();
    let request = String::from_utf8(connection.sent_bytes()).unwrap();
    assert!(request.contains("Transfer-Encoding: chunked\r\n"));

    assert_eq!(http.write(b"Hello"), 10); // "5\r\nHello\r\n"
    assert_eq!(http.write(b""), 5); // "0\r\n\r\n"
    let frames = connection.sent_frames();
    assert_eq!(frames[frames.len() - 2], b"5\r\nHello\r\n");
    assert_eq!(frames[frames.len() - 1], b"0\r\n\r\n");

    // User-supplied Connection header wins.
    let factory = Arc::new(FakeFactory::default());
    let mut http = HttpClient::new(factory.clone(), 0);
    http.set_header("Connection", "keep-alive");
    assert!(http.open("GET", "http://host/"));
    let request = String::from_utf8(factory.last_connection().sent_bytes()).unwrap();
    assert!(request.contains("Connection: keep-alive\r\n"));
    assert!(!request.contains("Connection: close\r\n"));
}

#[test]
fn https_uses_tls_transport() {
    init_log();
    let factory = Arc::new(FakeFactory::default());
    let _http = open_get(&factory, "https://secure/");
    assert!(factory.created_ssl.load(std::sync::atomic::Ordering::SeqCst));
}

#[test]
fn malformed_status_line_raises_error() {
    init_log();
    let factory = Arc::new(FakeFactory::default());
    let mut http = open_get(&factory, "http://host/");
    factory.last_connection().feed(b"NOT-HTTP\r\n");
    assert_eq!(http.get_status_code(), -1);
}

#[test]
fn backpressure_lets_large_bodies_through() {
    init_log();
    let factory = Arc::new(FakeFactory::default());
    let mut http = open_get(&factory, "http://host/large");
    let connection = factory.last_connection();

    let body: Vec<u8> = (0..30000u32).map(|i| (i % 251) as u8).collect();
    let header = format!("HTTP/1.1 200 OK\r\nContent-Length: {}\r\n\r\n", body.len());

    let feeder_connection = connection.clone();
    let feeder_body = body.clone();
    let feeder = thread::spawn(move || {
        feeder_connection.feed(header.as_bytes());
        // Well past the 8 KiB FIFO cap; the producer must block until the
        // reader drains.
        for piece in feeder_body.chunks(1024) {
            feeder_connection.feed(piece);
        }
    });

    let mut received = Vec::new();
    let mut buffer = [0u8; 2048];
    loop {
        match http.read(&mut buffer) {
            n if n > 0 => received.extend_from_slice(&buffer[..n as usize]),
            0 => break,
            _ => panic!("read error"),
        }
    }
    feeder.join().unwrap();
    assert_eq!(received, body);
}
