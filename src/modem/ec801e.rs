//! Quectel EC801E (and NT26K) supervisor.

use core::fmt::Write as _;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use super::{Modem, ModemCore, ModemShared, NetworkStatus};
use crate::http::{Http, HttpClient};
use crate::mqtt::{Ec801eMqtt, Mqtt};
use crate::transport::{Ec801eSsl, Ec801eTcp, Ec801eUdp, Tcp, TransportFactory, Udp};
use crate::uart::{AtUart, DEFAULT_COMMAND_TIMEOUT};
use crate::websocket::WebSocket;

pub struct Ec801eModem {
    core: ModemCore,
}

impl Ec801eModem {
    pub fn new(uart: Arc<AtUart>) -> Arc<Self> {
        let shared = Arc::new(ModemShared::new());
        let core = ModemCore::new(uart, shared, |_, _| {});

        let modem = Arc::new(Self { core });
        // Echo off, URCs on the command port.
        modem
            .core
            .uart
            .send_command("ATE0", DEFAULT_COMMAND_TIMEOUT, true);
        modem.core.uart.send_command(
            "AT+QURCCFG=\"urcport\",\"uart1\"",
            DEFAULT_COMMAND_TIMEOUT,
            true,
        );
        modem
    }
}

impl TransportFactory for Ec801eModem {
    fn create_tcp(&self, connect_id: i32) -> Box<dyn Tcp> {
        assert!(connect_id >= 0);
        Box::new(Ec801eTcp::new(self.core.uart.clone(), connect_id))
    }

    fn create_ssl(&self, connect_id: i32) -> Box<dyn Tcp> {
        assert!(connect_id >= 0);
        Box::new(Ec801eSsl::new(self.core.uart.clone(), connect_id))
    }

    fn create_udp(&self, connect_id: i32) -> Box<dyn Udp> {
        assert!(connect_id >= 0);
        Box::new(Ec801eUdp::new(self.core.uart.clone(), connect_id))
    }
}

impl Modem for Ec801eModem {
    fn at_uart(&self) -> Arc<AtUart> {
        self.core.uart.clone()
    }

    fn wait_for_network_ready(&self, timeout: Option<Duration>) -> NetworkStatus {
        self.core.wait_for_network_ready(timeout)
    }

    fn get_imei(&self) -> String {
        self.core.get_imei()
    }

    fn get_iccid(&self) -> String {
        self.core.get_iccid()
    }

    fn get_module_revision(&self) -> String {
        self.core.get_module_revision()
    }

    fn get_carrier_name(&self) -> String {
        self.core.get_carrier_name()
    }

    fn get_csq(&self) -> i32 {
        self.core.get_csq()
    }

    fn get_registration_state(&self) -> super::CeregState {
        self.core.get_registration_state()
    }

    fn reboot(&self) {
        debug!("reboot not supported on this module");
    }

    fn set_flight_mode(&self, enable: bool) {
        self.core.set_flight_mode(enable);
    }

    fn set_sleep_mode(&self, enable: bool, delay_seconds: u32) -> bool {
        if enable {
            if delay_seconds > 0 {
                let mut command: heapless::String<32> = heapless::String::new();
                let _ = write!(command, "AT+QSCLKEX=1,{},30", delay_seconds);
                self.core
                    .uart
                    .send_command(&command, DEFAULT_COMMAND_TIMEOUT, true);
            }
            self.core
                .uart
                .send_command("AT+QSCLK=1", DEFAULT_COMMAND_TIMEOUT, true)
        } else {
            // The module only listens once DTR wakes it.
            let _active = self.core.uart.activate();
            self.core
                .uart
                .send_command("AT+QSCLK=0", DEFAULT_COMMAND_TIMEOUT, true)
        }
    }

    fn on_network_state_changed(&self, callback: super::NetworkStateCallback) {
        *self.core.shared.on_network_state_changed.lock().unwrap() = Some(callback);
    }

    fn pin_ready(&self) -> bool {
        self.core.shared.pin_ready.load(Ordering::Acquire)
    }

    fn network_ready(&self) -> bool {
        self.core.shared.network_ready.load(Ordering::Acquire)
    }

    fn create_mqtt(&self, connect_id: i32) -> Box<dyn Mqtt> {
        assert!(connect_id >= 0);
        Box::new(Ec801eMqtt::new(self.core.uart.clone(), connect_id))
    }

    fn create_http(self: Arc<Self>, connect_id: i32) -> Box<dyn Http> {
        assert!(connect_id >= 0);
        // No usable modem-internal HTTP on this family; the streaming
        // client runs over a module socket instead.
        Box::new(HttpClient::new(self, connect_id))
    }

    fn create_websocket(self: Arc<Self>, connect_id: i32) -> WebSocket {
        assert!(connect_id >= 0);
        WebSocket::new(self, connect_id)
    }
}
