//! EC801E MQTT client (`+QMT*` family).
//!
//! Connection setup is two-stage: `QMTOPEN` brings up the network link,
//! `QMTCONN` performs the MQTT handshake. Both report through URCs.

use core::fmt::Write as _;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use super::{
    ConnectedCallback, DisconnectedCallback, ErrorCallback, MessageCallback, Mqtt, MqttShared,
    DEFAULT_KEEP_ALIVE_SECONDS, MQTT_CONNECTED, MQTT_CONNECT_TIMEOUT, MQTT_DISCONNECTED,
    MQTT_OPEN_COMPLETE, MQTT_OPEN_FAILED,
};
use crate::hex;
use crate::types::ArgumentValue;
use crate::uart::{AtUart, UrcSubscription, DEFAULT_COMMAND_TIMEOUT};

/// `QMTOPEN` result codes.
fn open_result_to_string(error_code: i32) -> &'static str {
    match error_code {
        0 => "Network opened",
        1 => "Wrong parameter",
        2 => "MQTT identifier occupied",
        3 => "PDP activation failed",
        4 => "Domain name resolution failed",
        5 => "Network disconnected",
        _ => "Unknown error",
    }
}

/// `QMTCONN` CONNACK result codes.
fn connack_to_string(error_code: i32) -> &'static str {
    match error_code {
        0 => "Connection accepted",
        1 => "Refused: unacceptable protocol version",
        2 => "Refused: identifier rejected",
        3 => "Refused: server unavailable",
        4 => "Refused: bad username or password",
        5 => "Refused: not authorized",
        _ => "Unknown error",
    }
}

/// `QMTSTAT` link-drop reasons.
fn disconnect_reason_to_string(error_code: i32) -> &'static str {
    match error_code {
        0 => "Connection closed",
        1 => "Connection reset by peer",
        2 => "PINGREQ timed out",
        3 => "CONNECT timed out",
        4 => "CONNACK timed out",
        5 => "Server closed the connection",
        6 => "Send failure, client closed the connection",
        7 => "Link not working or server unreachable",
        8 => "Closed by user",
        _ => "Unknown error",
    }
}

fn handle_urc(shared: &MqttShared, mqtt_id: i32, command: &str, arguments: &[ArgumentValue]) {
    match command {
        "QMTRECV" if arguments.len() >= 4 => {
            if arguments[0].int_value() == mqtt_id {
                let topic = arguments[2].string_value();
                shared.deliver(topic, &hex::from_hex(arguments[3].string_value()));
            }
        }
        "QMTSTAT" if arguments.len() >= 2 => {
            if arguments[0].int_value() == mqtt_id {
                let reason = disconnect_reason_to_string(arguments[1].int_value());
                warn!("MQTT connection state: {}", reason);
                shared.mark_disconnected();
                shared.events.set(MQTT_DISCONNECTED);
                shared.report_error(reason);
            }
        }
        "QMTCONN" if arguments.len() == 3 => {
            if arguments[0].int_value() == mqtt_id {
                let error_code = arguments[2].int_value();
                shared.error_code.store(error_code, Ordering::Release);
                if error_code == 0 {
                    shared.connected.store(true, Ordering::Release);
                    shared.events.set(MQTT_CONNECTED);
                } else {
                    shared.mark_disconnected();
                    shared.events.set(MQTT_DISCONNECTED);
                }
            }
        }
        "QMTOPEN" if arguments.len() == 2 => {
            if arguments[0].int_value() == mqtt_id {
                let error_code = arguments[1].int_value();
                shared.error_code.store(error_code, Ordering::Release);
                if error_code == 0 {
                    shared.events.set(MQTT_OPEN_COMPLETE);
                } else {
                    shared.events.set(MQTT_OPEN_FAILED);
                }
            }
        }
        _ => {}
    }
}

pub struct Ec801eMqtt {
    uart: Arc<AtUart>,
    mqtt_id: i32,
    keep_alive_seconds: u32,
    shared: Arc<MqttShared>,
    subscription: UrcSubscription,
}

impl Ec801eMqtt {
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
        let command = format!("AT+QMTCFG=\"{}\",{},{}", item, self.mqtt_id, value);
        self.uart
            .send_command(&command, DEFAULT_COMMAND_TIMEOUT, true)
    }
}

impl Mqtt for Ec801eMqtt {
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

        if broker_port == 8883 {
            // TLS 1.2, any cipher suite, no certificate validation.
            self.uart.send_command(
                "AT+QSSLCFG=\"sslversion\",2,4;+QSSLCFG=\"ciphersuite\",2,0xFFFF;+QSSLCFG=\"seclevel\",2,0",
                DEFAULT_COMMAND_TIMEOUT,
                true,
            );
            if !self.config("ssl", "1,2") {
                error!("Failed to set MQTT to use SSL");
                return false;
            }
        }

        // MQTT 3.1.1.
        if !self.config("version", "4") {
            error!("Failed to set MQTT version to 3.1.1");
            return false;
        }
        if !self.config("session", "1") {
            error!("Failed to set MQTT clean session");
            return false;
        }
        if !self.config("keepalive", &self.keep_alive_seconds.to_string()) {
            error!("Failed to set MQTT keep alive");
            return false;
        }
        // ASCII out, HEX in.
        if !self.config("dataformat", "0,1") {
            error!("Failed to set MQTT to use HEX encoding");
            return false;
        }

        let command = format!(
            "AT+QMTOPEN={},\"{}\",{}",
            self.mqtt_id, broker_address, broker_port
        );
        if !self.uart.send_command(&command, DEFAULT_COMMAND_TIMEOUT, true) {
            error!("Failed to open MQTT connection");
            return false;
        }

        let bits = self.shared.events.wait(
            MQTT_OPEN_COMPLETE | MQTT_OPEN_FAILED,
            true,
            Some(MQTT_CONNECT_TIMEOUT),
        );
        if bits & MQTT_OPEN_FAILED != 0 {
            let error_code = self.shared.error_code.load(Ordering::Acquire);
            error!(
                "Failed to open MQTT connection: {}",
                open_result_to_string(error_code)
            );
            // An occupied identifier still accepts QMTCONN.
            if error_code != 2 {
                return false;
            }
        } else if bits & MQTT_OPEN_COMPLETE == 0 {
            error!("MQTT connection timeout");
            return false;
        }

        self.shared.events.clear(MQTT_CONNECTED | MQTT_DISCONNECTED);
        let command = format!(
            "AT+QMTCONN={},\"{}\",\"{}\",\"{}\"",
            self.mqtt_id, client_id, username, password
        );
        if !self.uart.send_command(&command, DEFAULT_COMMAND_TIMEOUT, true) {
            error!("Failed to connect to MQTT broker");
            return false;
        }

        let bits = self.shared.events.wait(
            MQTT_CONNECTED | MQTT_DISCONNECTED,
            true,
            Some(MQTT_CONNECT_TIMEOUT),
        );
        if bits & MQTT_DISCONNECTED != 0 {
            error!(
                "Failed to connect to MQTT broker: {}",
                connack_to_string(self.shared.error_code.load(Ordering::Acquire))
            );
            return false;
        } else if bits & MQTT_CONNECTED == 0 {
            error!("MQTT connection timeout");
            return false;
        }

        if let Some(callback) = self.shared.on_connected.lock().unwrap().as_ref() {
            callback();
        }
        true
    }

    fn disconnect(&mut self) {
        if !self.shared.connected() {
            return;
        }
        let mut command: heapless::String<24> = heapless::String::new();
        let _ = write!(command, "AT+QMTDISC={}", self.mqtt_id);
        self.uart
            .send_command(&command, DEFAULT_COMMAND_TIMEOUT, true);
    }

    fn publish(&mut self, topic: &str, payload: &[u8], qos: u8) -> bool {
        if !self.shared.connected() {
            return false;
        }
        // Payloads past 64 KiB are rejected by the module with CME 601.
        let message_id = if qos > 0 { 1 } else { 0 };
        let command = format!(
            "AT+QMTPUBEX={},{},{},0,\"{}\",{}",
            self.mqtt_id,
            message_id,
            qos,
            topic,
            payload.len()
        );
        if !self.uart.send_command(&command, DEFAULT_COMMAND_TIMEOUT, true) {
            return false;
        }
        self.uart.send_data(payload)
    }

    fn subscribe(&mut self, topic: &str, qos: u8) -> bool {
        if !self.shared.connected() {
            return false;
        }
        let command = format!("AT+QMTSUB={},0,\"{}\",{}", self.mqtt_id, topic, qos);
        self.uart
            .send_command(&command, DEFAULT_COMMAND_TIMEOUT, true)
    }

    fn unsubscribe(&mut self, topic: &str) -> bool {
        if !self.shared.connected() {
            return false;
        }
        let command = format!("AT+QMTUNS={},0,\"{}\"", self.mqtt_id, topic);
        self.uart
            .send_command(&command, DEFAULT_COMMAND_TIMEOUT, true)
    }

    fn is_connected(&mut self) -> bool {
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

impl Drop for Ec801eMqtt {
    fn drop(&mut self) {
        self.uart.unregister_urc_callback(self.subscription);
    }
}
