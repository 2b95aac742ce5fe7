//! Per-connection transports multiplexed over the shared AT link.
//!
//! Every endpoint owns one modem-side slot, identified by a small integer
//! connect-id assigned by the application (ML307 modules expose slots
//! 0..=5, EC801E 0..=11; ids are not pooled here). URCs are tagged with
//! that id; an endpoint ignores URCs for any other id, so concurrent
//! endpoints never interfere.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use crate::event::EventGroup;

pub mod ec801e;
pub mod ml307;

pub use ec801e::{Ec801eSsl, Ec801eTcp, Ec801eUdp};
pub use ml307::{Ml307Tcp, Ml307Udp};

/// Stream/message payload callback. Runs synchronously on the receive
/// thread; keep the work small.
pub type StreamCallback = Box<dyn FnMut(&[u8]) + Send>;
pub type DisconnectCallback = Box<dyn Fn() + Send>;

pub trait Tcp: Send {
    fn connect(&mut self, host: &str, port: u16) -> bool;
    fn disconnect(&mut self);
    /// Bytes sent, or -1.
    fn send(&mut self, data: &[u8]) -> isize;
    fn on_stream(&mut self, callback: StreamCallback);
    fn on_disconnected(&mut self, callback: DisconnectCallback);
    fn connected(&self) -> bool;
}

pub trait Udp: Send {
    fn connect(&mut self, host: &str, port: u16) -> bool;
    fn disconnect(&mut self);
    /// Bytes sent, or -1.
    fn send(&mut self, data: &[u8]) -> isize;
    fn on_message(&mut self, callback: StreamCallback);
    fn connected(&self) -> bool;
}

/// Endpoint factory implemented by every modem variant. The application
/// owns connect-id assignment; ids are not pooled here.
pub trait TransportFactory: Send + Sync {
    fn create_tcp(&self, connect_id: i32) -> Box<dyn Tcp>;
    fn create_ssl(&self, connect_id: i32) -> Box<dyn Tcp>;
    fn create_udp(&self, connect_id: i32) -> Box<dyn Udp>;
}

pub(crate) const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

pub(crate) const SLOT_CONNECTED: u32 = 1 << 0;
pub(crate) const SLOT_DISCONNECTED: u32 = 1 << 1;
pub(crate) const SLOT_ERROR: u32 = 1 << 2;
pub(crate) const SLOT_SEND_COMPLETE: u32 = 1 << 3;
pub(crate) const SLOT_SEND_FAILED: u32 = 1 << 4;
pub(crate) const SLOT_PROBED: u32 = 1 << 5;

/// State shared between an endpoint and its URC callback.
///
/// `connected` and `instance_active` are read without locking;
/// `instance_active = true` means the modem-side slot must still be closed
/// on teardown even when the link itself is down.
pub(crate) struct SlotState {
    pub events: EventGroup,
    pub connected: AtomicBool,
    pub instance_active: AtomicBool,
    pub stream_callback: Mutex<Option<StreamCallback>>,
    pub disconnect_callback: Mutex<Option<DisconnectCallback>>,
}

impl SlotState {
    pub fn new() -> Self {
        Self {
            events: EventGroup::new(),
            connected: AtomicBool::new(false),
            instance_active: AtomicBool::new(false),
            stream_callback: Mutex::new(None),
            disconnect_callback: Mutex::new(None),
        }
    }

    pub fn connected(&self) -> bool {
        self.connected.load(Ordering::Acquire)
    }

    pub fn instance_active(&self) -> bool {
        self.instance_active.load(Ordering::Acquire)
    }

    /// Deliver a payload to the stream callback. Dropped when the endpoint
    /// is not connected or no callback is registered; the modem has
    /// already acknowledged the data either way.
    pub fn deliver(&self, data: &[u8]) {
        if !self.connected() {
            return;
        }
        if let Some(callback) = self.stream_callback.lock().unwrap().as_mut() {
            callback(data);
        }
    }

    /// Fire the disconnect callback exactly once per connection.
    pub fn notify_disconnected(&self) {
        if self.connected.swap(false, Ordering::AcqRel) {
            if let Some(callback) = self.disconnect_callback.lock().unwrap().as_ref() {
                callback();
            }
        }
    }
}
