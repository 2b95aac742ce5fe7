//! Shared harness: log setup, polling helper, and a fake `Tcp` transport
//! for the endpoints that layer on one.

#![allow(dead_code)]

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Once};
use std::time::{Duration, Instant};

use cellular_mux::transport::{
    DisconnectCallback, StreamCallback, Tcp, TransportFactory, Udp,
};

pub fn init_log() {
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
            .is_test(true)
            .init();
    });
}

/// Poll `predicate` until it holds or `timeout` passes.
pub fn wait_until<F: Fn() -> bool>(predicate: F, timeout: Duration) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if predicate() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(5));
    }
    predicate()
}

/// Callbacks and transcript of one fake connection, shared with the test.
#[derive(Default)]
pub struct FakeTcpState {
    pub stream: Mutex<Option<StreamCallback>>,
    pub disconnect: Mutex<Option<DisconnectCallback>>,
    pub sent: Mutex<Vec<Vec<u8>>>,
    pub connected: AtomicBool,
    pub refuse_connect: AtomicBool,
}

impl FakeTcpState {
    /// Push bytes through the registered stream callback, as the receive
    /// thread would.
    pub fn feed(&self, data: &[u8]) {
        if let Some(callback) = self.stream.lock().unwrap().as_mut() {
            callback(data);
        }
    }

    /// Report a remote close.
    pub fn drop_link(&self) {
        self.connected.store(false, Ordering::SeqCst);
        if let Some(callback) = self.disconnect.lock().unwrap().as_ref() {
            callback();
        }
    }

    pub fn sent_bytes(&self) -> Vec<u8> {
        self.sent.lock().unwrap().concat()
    }

    pub fn sent_frames(&self) -> Vec<Vec<u8>> {
        self.sent.lock().unwrap().clone()
    }

    pub fn has_stream_callback(&self) -> bool {
        self.stream.lock().unwrap().is_some()
    }
}

pub struct FakeTcp(pub Arc<FakeTcpState>);

impl Tcp for FakeTcp {
    fn connect(&mut self, _host: &str, _port: u16) -> bool {
        if self.0.refuse_connect.load(Ordering::SeqCst) {
            return false;
        }
        self.0.connected.store(true, Ordering::SeqCst);
        true
    }

    fn disconnect(&mut self) {
        self.0.connected.store(false, Ordering::SeqCst);
    }

    fn send(&mut self, data: &[u8]) -> isize {
        if !self.0.connected.load(Ordering::SeqCst) {
            return -1;
        }
        self.0.sent.lock().unwrap().push(data.to_vec());
        data.len() as isize
    }

    fn on_stream(&mut self, callback: StreamCallback) {
        *self.0.stream.lock().unwrap() = Some(callback);
    }

    fn on_disconnected(&mut self, callback: DisconnectCallback) {
        *self.0.disconnect.lock().unwrap() = Some(callback);
    }

    fn connected(&self) -> bool {
        self.0.connected.load(Ordering::SeqCst)
    }
}

/// Hands out [`FakeTcp`]s and keeps the state of the most recent one so
/// the test can reach its callbacks.
#[derive(Default)]
pub struct FakeFactory {
    pub last: Mutex<Option<Arc<FakeTcpState>>>,
    pub created_ssl: AtomicBool,
}

impl FakeFactory {
    pub fn last_connection(&self) -> Arc<FakeTcpState> {
        self.last.lock().unwrap().clone().expect("no connection created")
    }

    fn make(&self) -> Box<dyn Tcp> {
        let state = Arc::new(FakeTcpState::default());
        *self.last.lock().unwrap() = Some(state.clone());
        Box::new(FakeTcp(state))
    }
}

impl TransportFactory for FakeFactory {
    fn create_tcp(&self, _connect_id: i32) -> Box<dyn Tcp> {
        self.make()
    }

    fn create_ssl(&self, _connect_id: i32) -> Box<dyn Tcp> {
        self.created_ssl.store(true, Ordering::SeqCst);
        self.make()
    }

    fn create_udp(&self, _connect_id: i32) -> Box<dyn Udp> {
        unreachable!("tests do not route UDP through the fake factory")
    }
}
