//! WebSocket client over any [`Tcp`] transport.
//!
//! HTTP/1.1 upgrade handshake, then a pull-style frame decoder over an
//! append buffer. Client frames are always masked; a mutex around the
//! transport serializes emission so data and pong frames never interleave
//! on the wire.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use base64ct::{Base64, Encoding};
use rand::RngCore;

use crate::event::EventGroup;
use crate::http::{parse_url, HeaderMap};
use crate::transport::{Tcp, TransportFactory};

const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);
const HANDSHAKE_SUCCESS: u32 = 1 << 0;
const HANDSHAKE_FAILED: u32 = 1 << 1;

const OPCODE_CONTINUATION: u8 = 0x0;
const OPCODE_TEXT: u8 = 0x1;
const OPCODE_BINARY: u8 = 0x2;
const OPCODE_CLOSE: u8 = 0x8;
const OPCODE_PING: u8 = 0x9;
const OPCODE_PONG: u8 = 0xA;

/// Data frames carry at most a 16-bit extended length here.
const MAX_PAYLOAD: usize = 65535;
const MAX_CONTROL_PAYLOAD: usize = 125;

pub type ConnectedCallback = Box<dyn Fn() + Send>;
pub type DisconnectedCallback = Box<dyn Fn() + Send>;
pub type DataCallback = Box<dyn FnMut(&[u8], bool) + Send>;
pub type ErrorCallback = Box<dyn Fn(i32) + Send>;

struct FrameAssembly {
    buffer: Vec<u8>,
    message: Vec<u8>,
    fragmented: bool,
    binary: bool,
}

struct WsShared {
    handshake_events: EventGroup,
    handshake_completed: AtomicBool,
    connected: AtomicBool,
    /// FIN=false emitted; the next data frame must be a continuation.
    continuation: AtomicBool,
    /// Send mutex: one frame's bytes hit the wire at a time.
    tcp: Mutex<Option<Box<dyn Tcp>>>,
    recv: Mutex<FrameAssembly>,
    on_connected: Mutex<Option<ConnectedCallback>>,
    on_disconnected: Mutex<Option<DisconnectedCallback>>,
    on_data: Mutex<Option<DataCallback>>,
    on_error: Mutex<Option<ErrorCallback>>,
}

impl WsShared {
    fn new() -> Self {
        Self {
            handshake_events: EventGroup::new(),
            handshake_completed: AtomicBool::new(false),
            connected: AtomicBool::new(false),
            continuation: AtomicBool::new(false),
            tcp: Mutex::new(None),
            recv: Mutex::new(FrameAssembly {
                buffer: Vec::new(),
                message: Vec::new(),
                fragmented: false,
                binary: false,
            }),
            on_connected: Mutex::new(None),
            on_disconnected: Mutex::new(None),
            on_data: Mutex::new(None),
            on_error: Mutex::new(None),
        }
    }

    fn notify_disconnected(&self) {
        if self.connected.swap(false, Ordering::AcqRel) {
            if let Some(callback) = self.on_disconnected.lock().unwrap().as_ref() {
                callback();
            }
        }
    }

    fn send_frame(&self, opcode: u8, fin: bool, payload: &[u8]) -> bool {
        let mut frame = Vec::with_capacity(payload.len() + 8);
        frame.push((fin as u8) << 7 | opcode);

        if payload.len() < 126 {
            frame.push(0x80 | payload.len() as u8);
        } else {
            frame.push(0x80 | 126);
            frame.push((payload.len() >> 8) as u8);
            frame.push((payload.len() & 0xFF) as u8);
        }

        let mut mask = [0u8; 4];
        rand::thread_rng().fill_bytes(&mut mask);
        frame.extend_from_slice(&mask);
        frame.extend(
            payload
                .iter()
                .enumerate()
                .map(|(i, &b)| b ^ mask[i % 4]),
        );

        let mut tcp = self.tcp.lock().unwrap();
        match tcp.as_mut() {
            Some(tcp) => tcp.send(&frame) >= 0,
            None => false,
        }
    }

    fn send_control_frame(&self, opcode: u8, payload: &[u8]) -> bool {
        if payload.len() > MAX_CONTROL_PAYLOAD {
            error!("Control frame payload too large");
            return false;
        }
        self.send_frame(opcode, true, payload)
    }

    fn on_tcp_data(shared: &Arc<WsShared>, data: &[u8]) {
        let mut recv = shared.recv.lock().unwrap();
        recv.buffer.extend_from_slice(data);

        if !shared.handshake_completed.load(Ordering::Acquire) {
            // The upgrade response runs to the first blank line.
            let Some(end) = recv
                .buffer
                .windows(4)
                .position(|w| w == b"\r\n\r\n")
            else {
                return;
            };
            let response: Vec<u8> = recv.buffer.drain(..end + 4).collect();
            if response.starts_with(b"HTTP/1.1 101") {
                shared.handshake_completed.store(true, Ordering::Release);
                shared.handshake_events.set(HANDSHAKE_SUCCESS);
            } else {
                error!("WebSocket handshake failed");
                shared.handshake_events.set(HANDSHAKE_FAILED);
                return;
            }
        }

        WsShared::process_frames(shared, &mut recv);
    }

    fn process_frames(shared: &Arc<WsShared>, recv: &mut FrameAssembly) {
        let mut offset = 0;
        loop {
            let buffer = &recv.buffer[offset..];
            if buffer.len() < 2 {
                break;
            }

            let fin = buffer[0] & 0x80 != 0;
            let opcode = buffer[0] & 0x0F;
            let masked = buffer[1] & 0x80 != 0;
            let mut payload_length = (buffer[1] & 0x7F) as u64;

            let mut header_length = 2;
            if payload_length == 126 {
                if buffer.len() < 4 {
                    break;
                }
                payload_length = (buffer[2] as u64) << 8 | buffer[3] as u64;
                header_length += 2;
            } else if payload_length == 127 {
                if buffer.len() < 10 {
                    break;
                }
                payload_length = 0;
                for i in 0..8 {
                    payload_length = payload_length << 8 | buffer[2 + i] as u64;
                }
                header_length += 8;
            }
            let payload_length = payload_length as usize;

            let mut mask_key = [0u8; 4];
            if masked {
                if buffer.len() < header_length + 4 {
                    break;
                }
                mask_key.copy_from_slice(&buffer[header_length..header_length + 4]);
                header_length += 4;
            }

            if buffer.len() < header_length + payload_length {
                break;
            }

            let mut payload = buffer[header_length..header_length + payload_length].to_vec();
            if masked {
                for (i, b) in payload.iter_mut().enumerate() {
                    *b ^= mask_key[i % 4];
                }
            }

            match opcode {
                OPCODE_CONTINUATION | OPCODE_TEXT | OPCODE_BINARY => {
                    if opcode != OPCODE_CONTINUATION && recv.fragmented {
                        error!("Received new message frame while still fragmenting");
                    } else {
                        if opcode != OPCODE_CONTINUATION {
                            recv.fragmented = !fin;
                            recv.binary = opcode == OPCODE_BINARY;
                            recv.message.clear();
                        }
                        recv.message.extend_from_slice(&payload);
                        if fin {
                            let message = std::mem::take(&mut recv.message);
                            let binary = recv.binary;
                            recv.fragmented = false;
                            if let Some(callback) = shared.on_data.lock().unwrap().as_mut() {
                                callback(&message, binary);
                            }
                        }
                    }
                }
                OPCODE_CLOSE => {
                    shared.notify_disconnected();
                }
                OPCODE_PING => {
                    // Reply off the receive thread so it is not blocked by
                    // the send path.
                    let pong_shared = shared.clone();
                    thread::spawn(move || {
                        pong_shared.send_control_frame(OPCODE_PONG, &payload);
                    });
                }
                OPCODE_PONG => {}
                other => {
                    error!("Unknown opcode: {}", other);
                }
            }

            offset += header_length + payload_length;
        }

        if offset > 0 {
            recv.buffer.drain(..offset);
        }
    }
}

pub struct WebSocket {
    factory: Arc<dyn TransportFactory>,
    connect_id: i32,
    headers: HeaderMap,
    shared: Arc<WsShared>,
}

impl WebSocket {
    pub fn new(factory: Arc<dyn TransportFactory>, connect_id: i32) -> Self {
        Self {
            factory,
            connect_id,
            headers: HeaderMap::new(),
            shared: Arc::new(WsShared::new()),
        }
    }

    pub fn set_header(&mut self, key: &str, value: &str) {
        self.headers.set(key, value);
    }

    pub fn is_connected(&self) -> bool {
        self.shared.connected.load(Ordering::Acquire)
    }

    pub fn connect(&mut self, uri: &str) -> bool {
        let Ok(parsed) = parse_url(uri) else {
            error!("Invalid URI format");
            return false;
        };
        if !matches!(parsed.scheme.as_str(), "ws" | "wss" | "http" | "https") {
            error!("Invalid URI scheme: {}", parsed.scheme);
            return false;
        }
        debug!(
            "Connecting to {}://{}:{}{}",
            parsed.scheme, parsed.host, parsed.port, parsed.path
        );

        self.headers.set("Upgrade", "websocket");
        self.headers.set("Connection", "Upgrade");
        self.headers.set("Sec-WebSocket-Version", "13");

        let mut key = [0u8; 16];
        rand::thread_rng().fill_bytes(&mut key);
        self.headers
            .set("Sec-WebSocket-Key", &Base64::encode_string(&key));

        let mut tcp = if matches!(parsed.scheme.as_str(), "wss" | "https") {
            self.factory.create_ssl(self.connect_id)
        } else {
            self.factory.create_tcp(self.connect_id)
        };

        self.shared.connected.store(false, Ordering::Release);
        self.shared.handshake_completed.store(false, Ordering::Release);
        self.shared
            .handshake_events
            .clear(HANDSHAKE_SUCCESS | HANDSHAKE_FAILED);

        let stream_shared = self.shared.clone();
        tcp.on_stream(Box::new(move |data| WsShared::on_tcp_data(&stream_shared, data)));
        let disconnect_shared = self.shared.clone();
        tcp.on_disconnected(Box::new(move || disconnect_shared.notify_disconnected()));

        if !tcp.connect(&parsed.host, parsed.port) {
            error!("Failed to connect to server");
            return false;
        }

        let mut request = format!("GET {} HTTP/1.1\r\n", parsed.path);
        if !self.headers.contains("Host") {
            request.push_str(&format!("Host: {}\r\n", parsed.host));
        }
        for (header_key, value) in self.headers.iter() {
            request.push_str(&format!("{}: {}\r\n", header_key, value));
        }
        request.push_str("\r\n");

        if tcp.send(request.as_bytes()) < 0 {
            error!("Failed to send WebSocket handshake request");
            return false;
        }
        *self.shared.tcp.lock().unwrap() = Some(tcp);

        let bits = self.shared.handshake_events.wait(
            HANDSHAKE_SUCCESS | HANDSHAKE_FAILED,
            false,
            Some(HANDSHAKE_TIMEOUT),
        );
        if bits & HANDSHAKE_SUCCESS != 0 {
            self.shared.connected.store(true, Ordering::Release);
            if let Some(callback) = self.shared.on_connected.lock().unwrap().as_ref() {
                callback();
            }
            true
        } else if bits & HANDSHAKE_FAILED != 0 {
            error!("WebSocket handshake failed");
            if let Some(callback) = self.shared.on_error.lock().unwrap().as_ref() {
                callback(-1);
            }
            false
        } else {
            error!("WebSocket handshake timeout");
            false
        }
    }

    /// Send one data frame. `fin = false` starts (or continues) a
    /// fragmented message; the final fragment carries `fin = true`.
    pub fn send(&self, data: &[u8], binary: bool, fin: bool) -> bool {
        if data.len() > MAX_PAYLOAD {
            error!("Data too large, maximum supported size is 65535 bytes");
            return false;
        }

        let opcode = if self.shared.continuation.load(Ordering::Acquire) {
            OPCODE_CONTINUATION
        } else if binary {
            OPCODE_BINARY
        } else {
            OPCODE_TEXT
        };
        self.shared.continuation.store(!fin, Ordering::Release);
        self.shared.send_frame(opcode, fin, data)
    }

    pub fn send_text(&self, text: &str) -> bool {
        self.send(text.as_bytes(), false, true)
    }

    pub fn ping(&self) -> bool {
        self.shared.send_control_frame(OPCODE_PING, &[])
    }

    /// Best-effort close frame, then drop the transport link.
    pub fn close(&mut self) {
        if self.shared.connected.load(Ordering::Acquire) {
            self.shared.send_control_frame(OPCODE_CLOSE, &[]);
        }
        let mut tcp = self.shared.tcp.lock().unwrap();
        if let Some(tcp) = tcp.as_mut() {
            tcp.disconnect();
        }
        *tcp = None;
        self.shared.connected.store(false, Ordering::Release);
    }

    pub fn on_connected(&mut self, callback: ConnectedCallback) {
        *self.shared.on_connected.lock().unwrap() = Some(callback);
    }

    pub fn on_disconnected(&mut self, callback: DisconnectedCallback) {
        *self.shared.on_disconnected.lock().unwrap() = Some(callback);
    }

    pub fn on_data(&mut self, callback: DataCallback) {
        *self.shared.on_data.lock().unwrap() = Some(callback);
    }

    pub fn on_error(&mut self, callback: ErrorCallback) {
        *self.shared.on_error.lock().unwrap() = Some(callback);
    }
}

impl Drop for WebSocket {
    fn drop(&mut self) {
        if self.shared.connected.load(Ordering::Acquire) {
            let mut tcp = self.shared.tcp.lock().unwrap();
            if let Some(tcp) = tcp.as_mut() {
                tcp.disconnect();
            }
            *tcp = None;
        }
    }
}
