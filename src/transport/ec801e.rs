//! EC801E socket endpoints (`+QI*` family, `+QSSL*` for TLS).
//!
//! Unlike the ML307 path, outbound data travels as a raw binary phase
//! behind the `>` prompt, so a full 1460-byte frame fits per chunk.
//! Inbound payloads are still HEX (`QICFG "dataformat" 0,1`).

use core::fmt::Write as _;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use super::{
    DisconnectCallback, SlotState, StreamCallback, Tcp, Udp, CONNECT_TIMEOUT, SLOT_CONNECTED,
    SLOT_DISCONNECTED, SLOT_ERROR, SLOT_PROBED, SLOT_SEND_COMPLETE, SLOT_SEND_FAILED,
};
use crate::hex;
use crate::types::ArgumentValue;
use crate::uart::{AtUart, UrcSubscription, DEFAULT_COMMAND_TIMEOUT, FIFO_OVERFLOW_URC};

const MAX_PACKET_SIZE: usize = 1460;

/// Keep data in one line, report send results, HEX-encode received data.
const QICFG_PREAMBLE: &str =
    "AT+QICFG=\"close/mode\",1;+QICFG=\"viewmode\",1;+QICFG=\"sendinfo\",1;+QICFG=\"dataformat\",0,1";

const SEND_RETRY_DELAY: Duration = Duration::from_millis(100);

fn handle_open(slot: &SlotState, result: i32) {
    if result == 0 {
        slot.connected.store(true, Ordering::Release);
        slot.instance_active.store(true, Ordering::Release);
        slot.events.clear(SLOT_DISCONNECTED | SLOT_ERROR);
        slot.events.set(SLOT_CONNECTED);
    } else {
        slot.connected.store(false, Ordering::Release);
        slot.events.set(SLOT_ERROR);
    }
}

fn handle_send_result(slot: &SlotState, result: i32) {
    if result == 0 {
        slot.events.set(SLOT_SEND_COMPLETE);
    } else {
        slot.events.set(SLOT_SEND_FAILED);
    }
}

fn handle_data_urc(slot: &SlotState, arguments: &[ArgumentValue]) {
    match arguments[0].string_value() {
        "recv" if arguments.len() >= 4 => {
            slot.deliver(&hex::from_hex(arguments[3].string_value()));
        }
        "closed" => {
            // The slot stays active; a QICLOSE is still owed to the modem.
            slot.notify_disconnected();
            slot.events.set(SLOT_DISCONNECTED);
        }
        other => {
            error!("Unknown data URC: {}", other);
        }
    }
}

fn handle_state(slot: &SlotState, arguments: &[ArgumentValue]) {
    // <socket_state> 2 = connected
    slot.connected
        .store(arguments[5].int_value() == 2, Ordering::Release);
    slot.instance_active.store(true, Ordering::Release);
    slot.events.set(SLOT_PROBED);
}

fn handle_overflow(slot: &SlotState) {
    // Cleanup of the modem side happens on the caller thread, never here.
    slot.events.set(SLOT_ERROR);
    slot.notify_disconnected();
}

pub struct Ec801eTcp {
    uart: Arc<AtUart>,
    tcp_id: i32,
    slot: Arc<SlotState>,
    subscription: UrcSubscription,
}

impl Ec801eTcp {
    pub fn new(uart: Arc<AtUart>, tcp_id: i32) -> Self {
        let slot = Arc::new(SlotState::new());
        let urc_slot = slot.clone();
        let subscription = uart.register_urc_callback(move |command, arguments| {
            match command {
                "QIOPEN" if arguments.len() == 2 => {
                    if arguments[0].int_value() == tcp_id {
                        handle_open(&urc_slot, arguments[1].int_value());
                    }
                }
                "QISEND" if arguments.len() == 3 => {
                    if arguments[0].int_value() == tcp_id {
                        handle_send_result(&urc_slot, arguments[1].int_value());
                    }
                }
                "QIURC" if arguments.len() >= 2 => {
                    if arguments[1].int_value() == tcp_id {
                        handle_data_urc(&urc_slot, arguments);
                    }
                }
                "QISTATE" if arguments.len() > 5 => {
                    if arguments[0].int_value() == tcp_id {
                        handle_state(&urc_slot, arguments);
                    }
                }
                FIFO_OVERFLOW_URC => handle_overflow(&urc_slot),
                _ => {}
            }
        });
        Self {
            uart,
            tcp_id,
            slot,
            subscription,
        }
    }

    fn close_slot(&self) {
        if !self.slot.instance_active() {
            return;
        }
        let mut command: heapless::String<32> = heapless::String::new();
        let _ = write!(command, "AT+QICLOSE={}", self.tcp_id);
        self.uart
            .send_command(&command, DEFAULT_COMMAND_TIMEOUT, true);
        self.slot.instance_active.store(false, Ordering::Release);
        self.slot.notify_disconnected();
    }
}

impl Tcp for Ec801eTcp {
    fn connect(&mut self, host: &str, port: u16) -> bool {
        self.slot
            .events
            .clear(SLOT_CONNECTED | SLOT_DISCONNECTED | SLOT_ERROR);

        self.uart
            .send_command(QICFG_PREAMBLE, DEFAULT_COMMAND_TIMEOUT, true);

        // QISTATE replies before its OK, so instance_active is current
        // once the command returns.
        let mut command: heapless::String<32> = heapless::String::new();
        let _ = write!(command, "AT+QISTATE=1,{}", self.tcp_id);
        self.uart
            .send_command(&command, DEFAULT_COMMAND_TIMEOUT, true);

        if self.slot.instance_active() {
            let mut command: heapless::String<32> = heapless::String::new();
            let _ = write!(command, "AT+QICLOSE={}", self.tcp_id);
            self.uart
                .send_command(&command, DEFAULT_COMMAND_TIMEOUT, true);
            self.slot
                .events
                .wait(SLOT_DISCONNECTED, true, Some(CONNECT_TIMEOUT));
            self.slot.instance_active.store(false, Ordering::Release);
        }

        let open = format!(
            "AT+QIOPEN=1,{},\"TCP\",\"{}\",{},0,1",
            self.tcp_id, host, port
        );
        if !self.uart.send_command(&open, DEFAULT_COMMAND_TIMEOUT, true) {
            error!("Failed to open TCP connection");
            return false;
        }

        let bits = self
            .slot
            .events
            .wait(SLOT_CONNECTED | SLOT_ERROR, true, Some(CONNECT_TIMEOUT));
        if bits & SLOT_CONNECTED == 0 {
            error!("Failed to connect to {}:{}", host, port);
            return false;
        }
        true
    }

    fn disconnect(&mut self) {
        self.close_slot();
    }

    fn send(&mut self, data: &[u8]) -> isize {
        if !self.slot.connected() {
            error!("Not connected");
            return -1;
        }

        let mut total_sent = 0;
        while total_sent < data.len() {
            let chunk = &data[total_sent..data.len().min(total_sent + MAX_PACKET_SIZE)];

            let mut command: heapless::String<32> = heapless::String::new();
            let _ = write!(command, "AT+QISEND={},{}", self.tcp_id, chunk.len());
            if !self
                .uart
                .send_command_with_data(&command, DEFAULT_COMMAND_TIMEOUT, true, chunk)
            {
                error!("Send command failed");
                self.close_slot();
                return -1;
            }

            let bits = self.slot.events.wait(
                SLOT_SEND_COMPLETE | SLOT_SEND_FAILED,
                true,
                Some(CONNECT_TIMEOUT),
            );
            if bits & SLOT_SEND_FAILED != 0 {
                // Modem buffer momentarily full; retry the same chunk.
                error!("Send failed, retry later");
                thread::sleep(SEND_RETRY_DELAY);
                continue;
            } else if bits & SLOT_SEND_COMPLETE == 0 {
                error!("Send timeout");
                return -1;
            }

            total_sent += chunk.len();
        }
        data.len() as isize
    }

    fn on_stream(&mut self, callback: StreamCallback) {
        *self.slot.stream_callback.lock().unwrap() = Some(callback);
    }

    fn on_disconnected(&mut self, callback: DisconnectCallback) {
        *self.slot.disconnect_callback.lock().unwrap() = Some(callback);
    }

    fn connected(&self) -> bool {
        self.slot.connected()
    }
}

impl Drop for Ec801eTcp {
    fn drop(&mut self) {
        self.close_slot();
        self.uart.unregister_urc_callback(self.subscription);
    }
}

/// TLS endpoint over the module's `+QSSL*` family.
pub struct Ec801eSsl {
    uart: Arc<AtUart>,
    ssl_id: i32,
    slot: Arc<SlotState>,
    subscription: UrcSubscription,
}

impl Ec801eSsl {
    pub fn new(uart: Arc<AtUart>, ssl_id: i32) -> Self {
        let slot = Arc::new(SlotState::new());
        let urc_slot = slot.clone();
        let subscription = uart.register_urc_callback(move |command, arguments| {
            match command {
                "QSSLOPEN" if arguments.len() == 2 => {
                    // A second QSSLOPEN for a live slot is stale.
                    if arguments[0].int_value() == ssl_id && !urc_slot.instance_active() {
                        handle_open(&urc_slot, arguments[1].int_value());
                    }
                }
                "QSSLCLOSE" if arguments.len() == 1 => {
                    if arguments[0].int_value() == ssl_id {
                        urc_slot.instance_active.store(false, Ordering::Release);
                    }
                }
                "QISEND" if arguments.len() == 3 => {
                    if arguments[0].int_value() == ssl_id {
                        handle_send_result(&urc_slot, arguments[1].int_value());
                    }
                }
                "QSSLURC" if arguments.len() >= 2 => {
                    if arguments[1].int_value() == ssl_id {
                        handle_data_urc(&urc_slot, arguments);
                    }
                }
                "QSSLSTATE" if arguments.len() > 5 => {
                    if arguments[0].int_value() == ssl_id {
                        handle_state(&urc_slot, arguments);
                    }
                }
                FIFO_OVERFLOW_URC => handle_overflow(&urc_slot),
                _ => {}
            }
        });
        Self {
            uart,
            ssl_id,
            slot,
            subscription,
        }
    }

    fn close_slot(&self) {
        if !self.slot.instance_active() {
            return;
        }
        let mut command: heapless::String<32> = heapless::String::new();
        let _ = write!(command, "AT+QSSLCLOSE={}", self.ssl_id);
        self.uart
            .send_command(&command, DEFAULT_COMMAND_TIMEOUT, true);
        self.slot.instance_active.store(false, Ordering::Release);
        self.slot.notify_disconnected();
    }
}

impl Tcp for Ec801eSsl {
    fn connect(&mut self, host: &str, port: u16) -> bool {
        self.slot
            .events
            .clear(SLOT_CONNECTED | SLOT_DISCONNECTED | SLOT_ERROR);

        self.uart
            .send_command(QICFG_PREAMBLE, DEFAULT_COMMAND_TIMEOUT, true);
        // TLS 1.2, any cipher suite, no certificate validation.
        self.uart.send_command(
            "AT+QSSLCFG=\"sslversion\",1,4;+QSSLCFG=\"ciphersuite\",1,0xFFFF;+QSSLCFG=\"seclevel\",1,0",
            DEFAULT_COMMAND_TIMEOUT,
            true,
        );

        let mut command: heapless::String<32> = heapless::String::new();
        let _ = write!(command, "AT+QSSLSTATE=1,{}", self.ssl_id);
        self.uart
            .send_command(&command, DEFAULT_COMMAND_TIMEOUT, true);

        if self.slot.instance_active() {
            let mut command: heapless::String<32> = heapless::String::new();
            let _ = write!(command, "AT+QSSLCLOSE={}", self.ssl_id);
            self.uart
                .send_command(&command, DEFAULT_COMMAND_TIMEOUT, true);
            self.slot
                .events
                .wait(SLOT_DISCONNECTED, true, Some(CONNECT_TIMEOUT));
            self.slot.instance_active.store(false, Ordering::Release);
        }

        let open = format!(
            "AT+QSSLOPEN=1,1,{},\"{}\",{},1",
            self.ssl_id, host, port
        );
        if !self.uart.send_command(&open, DEFAULT_COMMAND_TIMEOUT, true) {
            error!("Failed to open SSL connection");
            return false;
        }

        let bits = self
            .slot
            .events
            .wait(SLOT_CONNECTED | SLOT_ERROR, true, Some(CONNECT_TIMEOUT));
        if bits & SLOT_CONNECTED == 0 {
            error!("Failed to connect to {}:{}", host, port);
            return false;
        }
        true
    }

    fn disconnect(&mut self) {
        self.close_slot();
    }

    fn send(&mut self, data: &[u8]) -> isize {
        if !self.slot.connected() {
            error!("Not connected");
            return -1;
        }

        let mut total_sent = 0;
        while total_sent < data.len() {
            let chunk = &data[total_sent..data.len().min(total_sent + MAX_PACKET_SIZE)];

            let mut command: heapless::String<32> = heapless::String::new();
            let _ = write!(command, "AT+QSSLSEND={},{}", self.ssl_id, chunk.len());
            if !self
                .uart
                .send_command_with_data(&command, DEFAULT_COMMAND_TIMEOUT, true, chunk)
            {
                error!("Send command failed");
                self.close_slot();
                return -1;
            }

            let bits = self.slot.events.wait(
                SLOT_SEND_COMPLETE | SLOT_SEND_FAILED,
                true,
                Some(CONNECT_TIMEOUT),
            );
            if bits & SLOT_SEND_FAILED != 0 {
                error!("Send failed, retry later");
                thread::sleep(SEND_RETRY_DELAY);
                continue;
            } else if bits & SLOT_SEND_COMPLETE == 0 {
                error!("Send timeout");
                return -1;
            }

            total_sent += chunk.len();
        }
        data.len() as isize
    }

    fn on_stream(&mut self, callback: StreamCallback) {
        *self.slot.stream_callback.lock().unwrap() = Some(callback);
    }

    fn on_disconnected(&mut self, callback: DisconnectCallback) {
        *self.slot.disconnect_callback.lock().unwrap() = Some(callback);
    }

    fn connected(&self) -> bool {
        self.slot.connected()
    }
}

impl Drop for Ec801eSsl {
    fn drop(&mut self) {
        self.close_slot();
        self.uart.unregister_urc_callback(self.subscription);
    }
}

pub struct Ec801eUdp {
    uart: Arc<AtUart>,
    udp_id: i32,
    slot: Arc<SlotState>,
    subscription: UrcSubscription,
}

impl Ec801eUdp {
    pub fn new(uart: Arc<AtUart>, udp_id: i32) -> Self {
        let slot = Arc::new(SlotState::new());
        let urc_slot = slot.clone();
        let subscription = uart.register_urc_callback(move |command, arguments| {
            match command {
                "QIOPEN" if arguments.len() == 2 => {
                    if arguments[0].int_value() == udp_id {
                        handle_open(&urc_slot, arguments[1].int_value());
                    }
                }
                "QISEND" if arguments.len() == 3 => {
                    if arguments[0].int_value() == udp_id {
                        handle_send_result(&urc_slot, arguments[1].int_value());
                    }
                }
                "QIURC" if arguments.len() >= 2 => {
                    if arguments[1].int_value() == udp_id {
                        match arguments[0].string_value() {
                            "recv" if arguments.len() >= 4 => {
                                urc_slot.deliver(&hex::from_hex(arguments[3].string_value()));
                            }
                            "closed" => {
                                urc_slot.connected.store(false, Ordering::Release);
                                urc_slot.instance_active.store(false, Ordering::Release);
                                urc_slot.events.set(SLOT_DISCONNECTED);
                            }
                            other => {
                                error!("Unknown QIURC command: {}", other);
                            }
                        }
                    }
                }
                "QISTATE" if arguments.len() > 5 => {
                    if arguments[0].int_value() == udp_id {
                        handle_state(&urc_slot, arguments);
                    }
                }
                FIFO_OVERFLOW_URC => handle_overflow(&urc_slot),
                _ => {}
            }
        });
        Self {
            uart,
            udp_id,
            slot,
            subscription,
        }
    }
}

impl Udp for Ec801eUdp {
    fn connect(&mut self, host: &str, port: u16) -> bool {
        self.slot
            .events
            .clear(SLOT_CONNECTED | SLOT_DISCONNECTED | SLOT_ERROR);

        self.uart
            .send_command(QICFG_PREAMBLE, DEFAULT_COMMAND_TIMEOUT, true);

        let mut command: heapless::String<32> = heapless::String::new();
        let _ = write!(command, "AT+QISTATE=1,{}", self.udp_id);
        self.uart
            .send_command(&command, DEFAULT_COMMAND_TIMEOUT, true);

        if self.slot.instance_active() {
            let mut command: heapless::String<32> = heapless::String::new();
            let _ = write!(command, "AT+QICLOSE={}", self.udp_id);
            self.uart
                .send_command(&command, DEFAULT_COMMAND_TIMEOUT, true);
            self.slot
                .events
                .wait(SLOT_DISCONNECTED, true, Some(CONNECT_TIMEOUT));
            self.slot.instance_active.store(false, Ordering::Release);
        }

        let open = format!(
            "AT+QIOPEN=1,{},\"UDP\",\"{}\",{},0,1",
            self.udp_id, host, port
        );
        if !self.uart.send_command(&open, DEFAULT_COMMAND_TIMEOUT, true) {
            error!("Failed to open UDP connection");
            return false;
        }

        let bits = self
            .slot
            .events
            .wait(SLOT_CONNECTED | SLOT_ERROR, true, Some(CONNECT_TIMEOUT));
        if bits & SLOT_CONNECTED == 0 {
            error!("Failed to connect to {}:{}", host, port);
            return false;
        }
        true
    }

    fn disconnect(&mut self) {
        if !self.slot.instance_active() {
            return;
        }
        let mut command: heapless::String<32> = heapless::String::new();
        let _ = write!(command, "AT+QICLOSE={}", self.udp_id);
        self.uart
            .send_command(&command, DEFAULT_COMMAND_TIMEOUT, true);
        self.slot.instance_active.store(false, Ordering::Release);
        self.slot.connected.store(false, Ordering::Release);
    }

    fn send(&mut self, data: &[u8]) -> isize {
        if !self.slot.connected() {
            error!("Not connected");
            return -1;
        }
        if data.len() > MAX_PACKET_SIZE {
            error!("Data block exceeds maximum limit");
            return -1;
        }

        let mut command: heapless::String<32> = heapless::String::new();
        let _ = write!(command, "AT+QISEND={},{}", self.udp_id, data.len());
        if !self
            .uart
            .send_command_with_data(&command, DEFAULT_COMMAND_TIMEOUT, true, data)
        {
            error!("Failed to send command");
            return -1;
        }

        let bits = self.slot.events.wait(
            SLOT_SEND_COMPLETE | SLOT_SEND_FAILED,
            true,
            Some(CONNECT_TIMEOUT),
        );
        if bits & SLOT_SEND_FAILED != 0 {
            error!("Failed to send data");
            return -1;
        } else if bits & SLOT_SEND_COMPLETE == 0 {
            error!("Send timeout");
            return -1;
        }

        data.len() as isize
    }

    fn on_message(&mut self, callback: StreamCallback) {
        *self.slot.stream_callback.lock().unwrap() = Some(callback);
    }

    fn connected(&self) -> bool {
        self.slot.connected()
    }
}

impl Drop for Ec801eUdp {
    fn drop(&mut self) {
        self.disconnect();
        self.uart.unregister_urc_callback(self.subscription);
    }
}
