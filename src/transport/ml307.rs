//! ML307 socket endpoints (`+MIP*` AT family).
//!
//! Payloads travel HEX-encoded in both directions (`MIPCFG "encoding" 1,1`),
//! which halves the usable packet size to 730 bytes of binary per chunk.

use core::fmt::Write as _;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use super::{
    DisconnectCallback, SlotState, StreamCallback, Tcp, Udp, CONNECT_TIMEOUT, SLOT_CONNECTED,
    SLOT_DISCONNECTED, SLOT_ERROR, SLOT_PROBED, SLOT_SEND_COMPLETE,
};
use crate::hex;
use crate::uart::{AtUart, UrcSubscription, DEFAULT_COMMAND_TIMEOUT, FIFO_OVERFLOW_URC};
use crate::types::ArgumentValue;

/// Binary bytes per `MIPSEND`; the HEX doubling fills a 1460-byte frame.
const MAX_PACKET_SIZE: usize = 1460 / 2;

fn handle_urc(slot: &SlotState, id: i32, command: &str, arguments: &[ArgumentValue]) {
    match command {
        "MIPOPEN" if arguments.len() == 2 => {
            if arguments[0].int_value() != id {
                return;
            }
            if arguments[1].int_value() == 0 {
                slot.connected.store(true, Ordering::Release);
                slot.instance_active.store(true, Ordering::Release);
                slot.events.clear(SLOT_DISCONNECTED | SLOT_ERROR);
                slot.events.set(SLOT_CONNECTED);
            } else {
                slot.connected.store(false, Ordering::Release);
                slot.events.set(SLOT_ERROR);
            }
        }
        "MIPCLOSE" if arguments.len() == 1 => {
            if arguments[0].int_value() == id {
                slot.instance_active.store(false, Ordering::Release);
                slot.events.set(SLOT_DISCONNECTED);
            }
        }
        "MIPSEND" if arguments.len() == 2 => {
            if arguments[0].int_value() == id {
                slot.events.set(SLOT_SEND_COMPLETE);
            }
        }
        "MIPURC" if arguments.len() >= 2 => {
            if arguments[1].int_value() != id {
                return;
            }
            match arguments[0].string_value() {
                "rtcp" | "rudp" if arguments.len() >= 4 => {
                    slot.deliver(&hex::from_hex(arguments[3].string_value()));
                }
                "disconn" => {
                    slot.notify_disconnected();
                    slot.instance_active.store(false, Ordering::Release);
                    slot.events.set(SLOT_DISCONNECTED);
                }
                other => {
                    error!("Unknown MIPURC command: {}", other);
                }
            }
        }
        "MIPSTATE" if arguments.len() >= 5 => {
            if arguments[0].int_value() == id {
                let state = arguments[4].string_value();
                slot.connected.store(state == "CONNECTED", Ordering::Release);
                slot.instance_active.store(state != "INITIAL", Ordering::Release);
                slot.events.set(SLOT_PROBED);
            }
        }
        FIFO_OVERFLOW_URC => {
            // Receive path lost data: fatal for the slot. Cleanup of the
            // modem side happens on the caller thread, never from here.
            slot.events.set(SLOT_ERROR);
            slot.notify_disconnected();
        }
        _ => {}
    }
}

/// TCP endpoint, or TLS when built via [`Ml307Tcp::new_ssl`] (the module's
/// own TLS stack behind the same `+MIP*` family).
pub struct Ml307Tcp {
    uart: Arc<AtUart>,
    tcp_id: i32,
    secure: bool,
    slot: Arc<SlotState>,
    subscription: UrcSubscription,
}

impl Ml307Tcp {
    pub fn new(uart: Arc<AtUart>, tcp_id: i32) -> Self {
        Self::with_security(uart, tcp_id, false)
    }

    pub fn new_ssl(uart: Arc<AtUart>, tcp_id: i32) -> Self {
        Self::with_security(uart, tcp_id, true)
    }

    fn with_security(uart: Arc<AtUart>, tcp_id: i32, secure: bool) -> Self {
        let slot = Arc::new(SlotState::new());
        let urc_slot = slot.clone();
        let subscription = uart.register_urc_callback(move |command, arguments| {
            handle_urc(&urc_slot, tcp_id, command, arguments);
        });
        Self {
            uart,
            tcp_id,
            secure,
            slot,
            subscription,
        }
    }

    fn configure_ssl(&self) -> bool {
        let mut command: heapless::String<40> = heapless::String::new();
        let _ = write!(
            command,
            "AT+MIPCFG=\"ssl\",{},{},0",
            self.tcp_id, self.secure as u8
        );
        if !self.uart.send_command(&command, DEFAULT_COMMAND_TIMEOUT, true) {
            error!("Failed to set SSL configuration");
            return false;
        }
        true
    }

    fn close_slot(&self) {
        if !self.slot.instance_active() {
            return;
        }
        let mut command: heapless::String<32> = heapless::String::new();
        let _ = write!(command, "AT+MIPCLOSE={}", self.tcp_id);
        if self.uart.send_command(&command, DEFAULT_COMMAND_TIMEOUT, true) {
            self.slot
                .events
                .wait(SLOT_DISCONNECTED, true, Some(CONNECT_TIMEOUT));
        }
        self.slot.instance_active.store(false, Ordering::Release);
        self.slot.notify_disconnected();
    }
}

impl Tcp for Ml307Tcp {
    fn connect(&mut self, host: &str, port: u16) -> bool {
        self.slot
            .events
            .clear(SLOT_CONNECTED | SLOT_DISCONNECTED | SLOT_ERROR);

        // Probe whether the modem-side slot is still live.
        let mut command: heapless::String<32> = heapless::String::new();
        let _ = write!(command, "AT+MIPSTATE={}", self.tcp_id);
        self.uart
            .send_command(&command, DEFAULT_COMMAND_TIMEOUT, true);
        if self
            .slot
            .events
            .wait(SLOT_PROBED, true, Some(CONNECT_TIMEOUT))
            == 0
        {
            error!("Failed to query connection state");
            return false;
        }

        // A stale slot has to be drained before reuse.
        if self.slot.instance_active() {
            let mut command: heapless::String<32> = heapless::String::new();
            let _ = write!(command, "AT+MIPCLOSE={}", self.tcp_id);
            if self.uart.send_command(&command, DEFAULT_COMMAND_TIMEOUT, true) {
                self.slot
                    .events
                    .wait(SLOT_DISCONNECTED, true, Some(CONNECT_TIMEOUT));
            }
        }

        if !self.configure_ssl() {
            return false;
        }

        let mut command: heapless::String<40> = heapless::String::new();
        let _ = write!(command, "AT+MIPCFG=\"encoding\",{},1,1", self.tcp_id);
        if !self.uart.send_command(&command, DEFAULT_COMMAND_TIMEOUT, true) {
            error!("Failed to set HEX encoding");
            return false;
        }

        let open = format!(
            "AT+MIPOPEN={},\"TCP\",\"{}\",{},,0",
            self.tcp_id, host, port
        );
        if !self.uart.send_command(&open, DEFAULT_COMMAND_TIMEOUT, true) {
            error!(
                "Failed to open TCP connection, error={}",
                self.uart.cme_error_code()
            );
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
        let mut command = String::with_capacity(32 + MAX_PACKET_SIZE * 2);
        while total_sent < data.len() {
            let chunk = &data[total_sent..data.len().min(total_sent + MAX_PACKET_SIZE)];

            command.clear();
            let _ = write!(command, "AT+MIPSEND={},{},", self.tcp_id, chunk.len());
            hex::to_hex_append(&mut command, chunk);
            command.push_str("\r\n");

            // Line time at 10 bits per byte, plus handling margin.
            let baud = self.uart.baud_rate().max(1) as u64;
            let tx_time_ms = (command.len() as u64 * 10 * 1000) / baud;
            let timeout = Duration::from_millis(tx_time_ms + 100);

            if !self.uart.send_command(&command, timeout, false) {
                error!("Failed to send data chunk");
                self.close_slot();
                return -1;
            }

            if self
                .slot
                .events
                .wait(SLOT_SEND_COMPLETE, true, Some(CONNECT_TIMEOUT))
                == 0
            {
                error!("No send confirmation received");
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

impl Drop for Ml307Tcp {
    fn drop(&mut self) {
        self.close_slot();
        self.uart.unregister_urc_callback(self.subscription);
    }
}

pub struct Ml307Udp {
    uart: Arc<AtUart>,
    udp_id: i32,
    slot: Arc<SlotState>,
    subscription: UrcSubscription,
}

impl Ml307Udp {
    pub fn new(uart: Arc<AtUart>, udp_id: i32) -> Self {
        let slot = Arc::new(SlotState::new());
        let urc_slot = slot.clone();
        let subscription = uart.register_urc_callback(move |command, arguments| {
            handle_urc(&urc_slot, udp_id, command, arguments);
        });
        Self {
            uart,
            udp_id,
            slot,
            subscription,
        }
    }
}

impl Udp for Ml307Udp {
    fn connect(&mut self, host: &str, port: u16) -> bool {
        self.slot
            .events
            .clear(SLOT_CONNECTED | SLOT_DISCONNECTED | SLOT_ERROR);

        let mut command: heapless::String<32> = heapless::String::new();
        let _ = write!(command, "AT+MIPSTATE={}", self.udp_id);
        self.uart
            .send_command(&command, DEFAULT_COMMAND_TIMEOUT, true);
        if self
            .slot
            .events
            .wait(SLOT_PROBED, true, Some(CONNECT_TIMEOUT))
            == 0
        {
            error!("Failed to query connection state");
            return false;
        }

        if self.slot.instance_active() {
            let mut command: heapless::String<32> = heapless::String::new();
            let _ = write!(command, "AT+MIPCLOSE={}", self.udp_id);
            if self.uart.send_command(&command, DEFAULT_COMMAND_TIMEOUT, true) {
                self.slot
                    .events
                    .wait(SLOT_DISCONNECTED, true, Some(CONNECT_TIMEOUT));
            }
        }

        let mut command: heapless::String<40> = heapless::String::new();
        let _ = write!(command, "AT+MIPCFG=\"encoding\",{},1,1", self.udp_id);
        if !self.uart.send_command(&command, DEFAULT_COMMAND_TIMEOUT, true) {
            error!("Failed to set HEX encoding");
            return false;
        }
        let mut command: heapless::String<40> = heapless::String::new();
        let _ = write!(command, "AT+MIPCFG=\"ssl\",{},0,0", self.udp_id);
        if !self.uart.send_command(&command, DEFAULT_COMMAND_TIMEOUT, true) {
            error!("Failed to set SSL configuration");
            return false;
        }

        let open = format!(
            "AT+MIPOPEN={},\"UDP\",\"{}\",{},,0",
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
        let _ = write!(command, "AT+MIPCLOSE={}", self.udp_id);
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
        // UDP is datagram-per-command; no chunking.
        if data.len() > MAX_PACKET_SIZE {
            error!("Data chunk exceeds maximum limit");
            return -1;
        }

        let mut command = String::with_capacity(32 + data.len() * 2);
        let _ = write!(command, "AT+MIPSEND={},{},", self.udp_id, data.len());
        hex::to_hex_append(&mut command, data);
        command.push_str("\r\n");

        if !self.uart.send_command(&command, DEFAULT_COMMAND_TIMEOUT, false) {
            error!("Failed to send data chunk");
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

impl Drop for Ml307Udp {
    fn drop(&mut self) {
        self.disconnect();
        self.uart.unregister_urc_callback(self.subscription);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    fn int(value: i32) -> ArgumentValue {
        ArgumentValue::int(value)
    }

    fn string(value: &str) -> ArgumentValue {
        ArgumentValue::String(value.into())
    }

    #[test]
    fn open_result_drives_slot_state() {
        let slot = SlotState::new();
        handle_urc(&slot, 2, "MIPOPEN", &[int(2), int(0)]);
        assert!(slot.connected());
        assert!(slot.instance_active());
        assert_eq!(slot.events.peek() & SLOT_CONNECTED, SLOT_CONNECTED);

        let slot = SlotState::new();
        handle_urc(&slot, 2, "MIPOPEN", &[int(2), int(1)]);
        assert!(!slot.connected());
        assert_eq!(slot.events.peek() & SLOT_ERROR, SLOT_ERROR);
    }

    #[test]
    fn urcs_for_other_ids_are_ignored() {
        let slot = SlotState::new();
        handle_urc(&slot, 2, "MIPOPEN", &[int(3), int(0)]);
        assert!(!slot.connected());
        assert_eq!(slot.events.peek(), 0);

        handle_urc(
            &slot,
            2,
            "MIPSTATE",
            &[int(3), string("TCP"), string("1.2.3.4"), int(80), string("CONNECTED")],
        );
        assert!(!slot.connected());
    }

    #[test]
    fn state_probe_classifies_slot() {
        let slot = SlotState::new();
        handle_urc(
            &slot,
            1,
            "MIPSTATE",
            &[int(1), string("TCP"), string("1.2.3.4"), int(80), string("CONNECTED")],
        );
        assert!(slot.connected());
        assert!(slot.instance_active());
        assert_eq!(slot.events.peek() & SLOT_PROBED, SLOT_PROBED);

        handle_urc(
            &slot,
            1,
            "MIPSTATE",
            &[int(1), string("TCP"), string("0.0.0.0"), int(0), string("INITIAL")],
        );
        assert!(!slot.connected());
        assert!(!slot.instance_active());
    }

    #[test]
    fn disconn_notifies_exactly_once() {
        let slot = SlotState::new();
        let fired = std::sync::Arc::new(AtomicUsize::new(0));
        let counter = fired.clone();
        *slot.disconnect_callback.lock().unwrap() = Some(Box::new(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        }));

        handle_urc(&slot, 2, "MIPOPEN", &[int(2), int(0)]);
        handle_urc(&slot, 2, "MIPURC", &[string("disconn"), int(2)]);
        handle_urc(&slot, 2, "MIPURC", &[string("disconn"), int(2)]);
        assert_eq!(fired.load(Ordering::SeqCst), 1);
        assert!(!slot.instance_active());
    }

    #[test]
    fn stream_payload_dropped_unless_connected() {
        let slot = SlotState::new();
        let bytes: std::sync::Arc<std::sync::Mutex<Vec<u8>>> = Default::default();
        let sink = bytes.clone();
        *slot.stream_callback.lock().unwrap() = Some(Box::new(move |data| {
            sink.lock().unwrap().extend_from_slice(data)
        }));

        // Not connected yet: dropped.
        handle_urc(&slot, 2, "MIPURC", &[string("rtcp"), int(2), int(2), string("4849")]);
        assert!(bytes.lock().unwrap().is_empty());

        handle_urc(&slot, 2, "MIPOPEN", &[int(2), int(0)]);
        handle_urc(&slot, 2, "MIPURC", &[string("rtcp"), int(2), int(2), string("4849")]);
        assert_eq!(bytes.lock().unwrap().as_slice(), b"HI");
    }

    #[test]
    fn overflow_is_fatal_but_defers_cleanup() {
        let slot = SlotState::new();
        handle_urc(&slot, 2, "MIPOPEN", &[int(2), int(0)]);
        handle_urc(&slot, 2, "FIFO_OVERFLOW", &[]);
        assert!(!slot.connected());
        // The slot still owes the modem a close from caller context.
        assert!(slot.instance_active());
        assert_eq!(slot.events.peek() & SLOT_ERROR, SLOT_ERROR);
    }
}
