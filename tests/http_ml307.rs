//! Modem-internal HTTP over a scripted ML307.

mod common;

use std::sync::Arc;
use std::time::Duration;

use cellular_mux::test_helpers::ScriptedSerial;
use cellular_mux::{hex, AtUart, Http, Ml307Http, UartConfig};
use common::init_log;

fn starts_with(data: &[u8], prefix: &str) -> bool {
    data.starts_with(prefix.as_bytes())
}

fn http_responder(data: &[u8], _baud: u32) -> Vec<u8> {
    if starts_with(data, "AT+MHTTPCREATE=") {
        b"OK\r\n+MHTTPCREATE: 0\r\n".to_vec()
    } else if starts_with(data, "AT+MHTTPCFG=")
        || starts_with(data, "AT+MHTTPHEADER=")
        || starts_with(data, "AT+MHTTPREQUEST=")
        || starts_with(data, "AT+MHTTPCONTENT=")
        || starts_with(data, "AT+MHTTPDEL=")
        // Raw data phase after a content command.
        || !starts_with(data, "AT")
    {
        b"OK\r\n".to_vec()
    } else {
        Vec::new()
    }
}

fn header_urc(status: u16, headers: &str) -> Vec<u8> {
    let mut line = format!("+MHTTPURC: \"header\",0,{},{},\"", status, headers.len());
    line.push_str(&hex::to_hex(headers.as_bytes()));
    line.push_str("\"\r\n");
    line.into_bytes()
}

#[test]
fn fixed_length_download() {
    init_log();
    let port = Arc::new(ScriptedSerial::with_responder(http_responder));
    let uart = Arc::new(AtUart::new(port.clone(), UartConfig::new()));
    let mut http = Ml307Http::new(uart);
    http.set_timeout(Duration::from_secs(2));
    http.set_header("Accept", "text/plain");

    assert!(http.open("GET", "http://files.example/readme"));
    let transcript = port.transcript();
    assert!(transcript.contains("AT+MHTTPCREATE=\"http://files.example\""));
    assert!(transcript.contains("AT+MHTTPCFG=\"encoding\",0,1,1"));
    // Path travels HEX-encoded: "/readme".
    assert!(transcript.contains(&format!(
        "AT+MHTTPREQUEST=0,1,0,{}",
        hex::to_hex(b"/readme")
    )));
    // Single header carries the is-last flag 0.
    assert!(transcript.contains("AT+MHTTPHEADER=0,0,18,\"Accept: text/plain\""));

    port.inject(&header_urc(200, "Content-Length: 11\r\nServer: tiny\r\n"));
    port.inject(b"+MHTTPURC: \"content\",0,11,5,5,\"48656C6C6F\"\r\n");
    port.inject(b"+MHTTPURC: \"content\",0,11,11,6,\"20576F726C64\"\r\n");

    assert_eq!(http.get_status_code(), 200);
    assert_eq!(http.get_body_length(), 11);
    assert_eq!(http.get_response_header("server").as_deref(), Some("tiny"));

    let mut buffer = [0u8; 32];
    let mut body = Vec::new();
    loop {
        match http.read(&mut buffer) {
            n if n > 0 => body.extend_from_slice(&buffer[..n as usize]),
            0 => break,
            _ => panic!("read error"),
        }
    }
    assert_eq!(body, b"Hello World");
}

#[test]
fn chunked_download_ends_on_empty_chunk() {
    init_log();
    let port = Arc::new(ScriptedSerial::with_responder(http_responder));
    let uart = Arc::new(AtUart::new(port.clone(), UartConfig::new()));
    let mut http = Ml307Http::new(uart);
    http.set_timeout(Duration::from_secs(2));

    assert!(http.open("GET", "http://files.example/feed"));
    port.inject(&header_urc(200, "Transfer-Encoding: chunked\r\n"));
    port.inject(b"+MHTTPURC: \"content\",0,0,5,5,\"48656C6C6F\"\r\n");
    port.inject(b"+MHTTPURC: \"content\",0,0,5,0,\"\"\r\n");

    assert_eq!(http.get_status_code(), 200);
    assert_eq!(http.read_all(), b"Hello");
    // Chunked bodies report no length.
    assert_eq!(http.get_body_length(), 0);
}

#[test]
fn error_urc_fails_the_request() {
    init_log();
    let port = Arc::new(ScriptedSerial::with_responder(http_responder));
    let uart = Arc::new(AtUart::new(port.clone(), UartConfig::new()));
    let mut http = Ml307Http::new(uart);
    http.set_timeout(Duration::from_secs(2));

    assert!(http.open("GET", "http://files.example/missing"));
    // 1 = DNS failure.
    port.inject(b"+MHTTPURC: \"err\",0,1\r\n");
    assert_eq!(http.get_status_code(), -1);
}

#[test]
fn unknown_method_is_rejected_without_side_effects() {
    init_log();
    let port = Arc::new(ScriptedSerial::with_responder(http_responder));
    let uart = Arc::new(AtUart::new(port.clone(), UartConfig::new()));
    let mut http = Ml307Http::new(uart);

    assert!(!http.open("BREW", "http://files.example/"));
    assert!(port.writes().is_empty());
}

#[test]
fn empty_chunk_upload_sends_bare_crlf() {
    init_log();
    let port = Arc::new(ScriptedSerial::with_responder(http_responder));
    let uart = Arc::new(AtUart::new(port.clone(), UartConfig::new()));
    let mut http = Ml307Http::new(uart);
    http.set_timeout(Duration::from_secs(2));

    let open_thread_port = port.clone();
    // "ind" arrives once the module is ready for the chunked upload.
    let responder = std::thread::spawn(move || {
        assert!(common::wait_until(
            || open_thread_port.transcript().contains("AT+MHTTPREQUEST="),
            Duration::from_secs(5)
        ));
        open_thread_port.inject(b"+MHTTPURC: \"ind\",0\r\n");
    });
    assert!(http.open("POST", "http://files.example/upload"));
    responder.join().unwrap();
    assert!(port.transcript().contains("AT+MHTTPCFG=\"chunked\",0,1"));

    assert_eq!(http.write(b"data"), 4);
    assert!(port.transcript().contains("AT+MHTTPCONTENT=0,1,4"));
    assert_eq!(http.write(b""), 0);
    assert!(port.transcript().contains("AT+MHTTPCONTENT=0,0,2,\"0D0A\""));
}
