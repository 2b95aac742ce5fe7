//! ML307 MQTT client (`+MQTT*` family).
//!
//! Sends ASCII, receives HEX (`MQTTCFG "encoding" 0,1`). Large publishes
//! arrive split across several `"publish"` URCs and are reassembled here.

use core::fmt::Write as _;
use std::sync::Arc;
use std::sync::atomic::Ordering;

use super::{
    ConnectedCallback, DisconnectedCallback, ErrorCallback, MessageCallback, Mqtt, MqttShared,
    DEFAULT_KEEP_ALIVE_SECONDS, MQTT_CONNECTED, MQTT_CONNECT_TIMEOUT, MQTT_DISCONNECTED,
    MQTT_PROBED,
};
use crate::hex;
use crate::types::ArgumentValue;
use crate::uart::{AtUart, UrcSubscription, DEFAULT_COMMAND_TIMEOUT};

/// `"conn"` URC result codes.
fn connection_state_to_string(error_code: i32) -> &'static str {
    match error_code {
        0 => "Connected",
        1 => "Reconnecting",
        2 => "Disconnected: user initiated",
        3 => "Disconnected: rejected (protocol version, identifier, username or password)",
        4 => "Disconnected: server disconnected",
        5 => "Disconnected: ping timeout",
        6 => "Disconnected: network error",
        255 => "Disconnected: unknown error",
        _ => "Unknown error",
    }
}

fn handle_urc(shared: &MqttShared, mqtt_id: i32, command: &str, arguments: &[ArgumentValue]) {
    match command {
        "MQTTURC" if arguments.len() >= 2 => {
            if arguments[1].int_value() != mqtt_id {
                return;
            }
            match arguments[0].string_value() {
                "conn" if arguments.len() >= 3 => {
                    let error_code = arguments[2].int_value();
                    if error_code == 0 {
                        shared.mark_connected();
                        shared.events.set(MQTT_CONNECTED);
                    } else {
                        shared.mark_disconnected();
                        shared.events.set(MQTT_DISCONNECTED);
                    }
                    if error_code == 5 || error_code == 6 {
                        let message = connection_state_to_string(error_code);
                        warn!("MQTT error occurred: {}", message);
                        shared.report_error(message);
                    }
                }
                "suback" => {}
                "publish" if arguments.len() >= 7 => {
                    let topic = arguments[3].string_value();
                    let total_len = arguments[4].int_value() as usize;
                    let current_len = arguments[5].int_value() as usize;
                    if total_len == current_len {
                        shared.deliver(topic, &hex::from_hex(arguments[6].string_value()));
                    } else {
                        let mut payload = shared.payload.lock().unwrap();
                        hex::from_hex_append(&mut payload, arguments[6].string_value());
                        if payload.len() >= total_len {
                            let assembled = std::mem::take(&mut *payload);
                            drop(payload);
                            shared.deliver(topic, &assembled);
                        }
                    }
                }
                other => {
                    info!("unhandled MQTT event: {}", other);
                }
            }
        }
        "MQTTSTATE" if arguments.len() == 1 => {
            // State 3 = disconnected.
            shared
                .connected
                .store(arguments[0].int_value() != 3, Ordering::Release);
            shared.events.set(MQTT_PROBED);
        }
        _ => {}
    }
}

pub struct Ml307Mqtt {
    uart: Arc<AtUart>,
    mqtt_id: i32,
    keep_alive_seconds: u32,
    shared: Arc<MqttShared>,
    subscription: UrcSubscription,
}

impl Ml307Mqtt {
    pub fn new(uart: Arc<AtUart>, mqtt_id: i32) -> Self {
        let shared = Arc::new(MqttShared::new());
        let urc_shared = shared.clone();
        let subscription = uart.register_urc_callback(move |command, arguments| {
            handle_urc(&urc_shared, mqtt_id, command, arguments);
        });
        Self {
            uart,
            mqtt_id,
            keep_alive_seconds: DEFAULT_KEEP_ALIVE_SECONDS,
            shared,
            subscription,
        }
    }

    fn config(&self, item: &str, value: &str) -> bool {
        let command = format!("AT+MQTTCFG=\"{}\",{},{}", item, self.mqtt_id, value);
        self.uart
            .send_command(&command, DEFAULT_COMMAND_TIMEOUT, true)
    }
}

impl Mqtt for Ml307Mqtt {
    fn set_keep_alive(&mut self, seconds: u32) {
        self.keep_alive_seconds = seconds;
    }

    fn connect(
        &mut self,
        broker_address: &str,
        broker_port: u16,
        client_id: &str,
        username: &str,
        password: &str,
    ) -> bool {
        if self.is_connected() {
            self.disconnect();
            if self
                .shared
                .events
                .wait(MQTT_DISCONNECTED, true, Some(MQTT_CONNECT_TIMEOUT))
                == 0
            {
                error!("Failed to disconnect from previous connection");
                return false;
            }
        }

        if broker_port == 8883 && !self.config("ssl", "1") {
            error!("Failed to set MQTT to use SSL");
            return false;
        }
        if !self.config("clean", "1") {
            error!("Failed to set MQTT clean session");
            return false;
        }
        // The module needs both the keepalive and the ping-request interval.
        let keep_alive = self.keep_alive_seconds.to_string();
        if !self.config("keepalive", &keep_alive) {
            error!("Failed to set MQTT keepalive interval");
            return false;
        }
        if !self.config("pingreq", &keep_alive) {
            error!("Failed to set MQTT ping interval");
            return false;
        }
        // ASCII out, HEX in.
        if !self.config("encoding", "0,1") {
            error!("Failed to set MQTT to use HEX encoding");
            return false;
        }

        self.shared.events.clear(MQTT_CONNECTED | MQTT_DISCONNECTED);
        let command = format!(
            "AT+MQTTCONN={},\"{}\",{},\"{}\",\"{}\",\"{}\"",
            self.mqtt_id, broker_address, broker_port, client_id, username, password
        );
        if !self.uart.send_command(&command, DEFAULT_COMMAND_TIMEOUT, true) {
            error!("Failed to create MQTT connection");
            return false;
        }

        let bits = self.shared.events.wait(
            MQTT_CONNECTED | MQTT_DISCONNECTED,
            true,
            Some(MQTT_CONNECT_TIMEOUT),
        );
        if bits & MQTT_CONNECTED == 0 {
            error!("Failed to connect to MQTT broker");
            return false;
        }
        true
    }

    fn disconnect(&mut self) {
        if !self.shared.connected() {
            return;
        }
        let mut command: heapless::String<24> = heapless::String::new();
        let _ = write!(command, "AT+MQTTDISC={}", self.mqtt_id);
        self.uart
            .send_command(&command, DEFAULT_COMMAND_TIMEOUT, true);
    }

    fn publish(&mut self, topic: &str, payload: &[u8], qos: u8) -> bool {
        if !self.shared.connected() {
            return false;
        }
        // Payloads past 64 KiB are rejected by the module with CME 601.
        let command = format!(
            "AT+MQTTPUB={},\"{}\",{},0,0,{}",
            self.mqtt_id,
            topic,
            qos,
            payload.len()
        );
        self.uart
            .send_command_with_data(&command, DEFAULT_COMMAND_TIMEOUT, true, payload)
    }

    fn subscribe(&mut self, topic: &str, qos: u8) -> bool {
        if !self.shared.connected() {
            return false;
        }
        let command = format!("AT+MQTTSUB={},\"{}\",{}", self.mqtt_id, topic, qos);
        self.uart
            .send_command(&command, DEFAULT_COMMAND_TIMEOUT, true)
    }

    fn unsubscribe(&mut self, topic: &str) -> bool {
        if !self.shared.connected() {
            return false;
        }
        let command = format!("AT+MQTTUNSUB={},\"{}\"", self.mqtt_id, topic);
        self.uart
            .send_command(&command, DEFAULT_COMMAND_TIMEOUT, true)
    }

    fn is_connected(&mut self) -> bool {
        // Ask the module rather than trusting the local flag.
        let mut command: heapless::String<24> = heapless::String::new();
        let _ = write!(command, "AT+MQTTSTATE={}", self.mqtt_id);
        self.uart
            .send_command(&command, DEFAULT_COMMAND_TIMEOUT, true);
        if self
            .shared
            .events
            .wait(MQTT_PROBED, true, Some(MQTT_CONNECT_TIMEOUT))
            == 0
        {
            error!("Failed to query MQTT connection state");
            return false;
        }
        self.shared.connected()
    }

    fn on_connected(&mut self, callback: ConnectedCallback) {
        *self.shared.on_connected.lock().unwrap() = Some(callback);
    }

    fn on_disconnected(&mut self, callback: DisconnectedCallback) {
        *self.shared.on_disconnected.lock().unwrap() = Some(callback);
    }

    fn on_message(&mut self, callback: MessageCallback) {
        *self.shared.on_message.lock().unwrap() = Some(callback);
    }

    fn on_error(&mut self, callback: ErrorCallback) {
        *self.shared.on_error.lock().unwrap() = Some(callback);
    }
}

impl Drop for Ml307Mqtt {
    fn drop(&mut self) {
        self.uart.unregister_urc_callback(self.subscription);
    }
}
