//! Modem-internal MQTT clients.

use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use crate::event::EventGroup;

pub mod ec801e;
pub mod ml307;

pub use ec801e::Ec801eMqtt;
pub use ml307::Ml307Mqtt;

pub type ConnectedCallback = Box<dyn Fn() + Send>;
pub type DisconnectedCallback = Box<dyn Fn() + Send>;
pub type MessageCallback = Box<dyn FnMut(&str, &[u8]) + Send>;
pub type ErrorCallback = Box<dyn Fn(&str) + Send>;

pub trait Mqtt: Send {
    fn set_keep_alive(&mut self, seconds: u32);
    fn connect(
        &mut self,
        broker_address: &str,
        broker_port: u16,
        client_id: &str,
        username: &str,
        password: &str,
    ) -> bool;
    fn disconnect(&mut self);
    fn publish(&mut self, topic: &str, payload: &[u8], qos: u8) -> bool;
    fn subscribe(&mut self, topic: &str, qos: u8) -> bool;
    fn unsubscribe(&mut self, topic: &str) -> bool;
    fn is_connected(&mut self) -> bool;

    fn on_connected(&mut self, callback: ConnectedCallback);
    fn on_disconnected(&mut self, callback: DisconnectedCallback);
    fn on_message(&mut self, callback: MessageCallback);
    fn on_error(&mut self, callback: ErrorCallback);
}

pub(crate) const MQTT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
pub(crate) const DEFAULT_KEEP_ALIVE_SECONDS: u32 = 120;

pub(crate) const MQTT_CONNECTED: u32 = 1 << 0;
pub(crate) const MQTT_DISCONNECTED: u32 = 1 << 1;
pub(crate) const MQTT_PROBED: u32 = 1 << 2;
pub(crate) const MQTT_OPEN_COMPLETE: u32 = 1 << 3;
pub(crate) const MQTT_OPEN_FAILED: u32 = 1 << 4;

/// State shared between an MQTT endpoint and its URC callback.
pub(crate) struct MqttShared {
    pub events: EventGroup,
    pub connected: AtomicBool,
    pub error_code: AtomicI32,
    /// Reassembly buffer for publishes split across URCs.
    pub payload: Mutex<Vec<u8>>,
    pub on_connected: Mutex<Option<ConnectedCallback>>,
    pub on_disconnected: Mutex<Option<DisconnectedCallback>>,
    pub on_message: Mutex<Option<MessageCallback>>,
    pub on_error: Mutex<Option<ErrorCallback>>,
}

impl MqttShared {
    pub fn new() -> Self {
        Self {
            events: EventGroup::new(),
            connected: AtomicBool::new(false),
            error_code: AtomicI32::new(0),
            payload: Mutex::new(Vec::new()),
            on_connected: Mutex::new(None),
            on_disconnected: Mutex::new(None),
            on_message: Mutex::new(None),
            on_error: Mutex::new(None),
        }
    }

    pub fn connected(&self) -> bool {
        self.connected.load(Ordering::Acquire)
    }

    pub fn mark_connected(&self) {
        if !self.connected.swap(true, Ordering::AcqRel) {
            if let Some(callback) = self.on_connected.lock().unwrap().as_ref() {
                callback();
            }
        }
    }

    pub fn mark_disconnected(&self) {
        if self.connected.swap(false, Ordering::AcqRel) {
            if let Some(callback) = self.on_disconnected.lock().unwrap().as_ref() {
                callback();
            }
        }
    }

    pub fn deliver(&self, topic: &str, payload: &[u8]) {
        if let Some(callback) = self.on_message.lock().unwrap().as_mut() {
            callback(topic, payload);
        }
    }

    pub fn report_error(&self, message: &str) {
        if let Some(callback) = self.on_error.lock().unwrap().as_ref() {
            callback(message);
        }
    }
}
