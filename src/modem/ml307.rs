//! China Mobile ML307 supervisor.

use core::fmt::Write as _;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use super::{Modem, ModemCore, ModemShared, NetworkStatus, EVENT_NETWORK_READY};
use crate::http::{Http, Ml307Http};
use crate::mqtt::{Ml307Mqtt, Mqtt};
use crate::transport::{Ml307Tcp, Ml307Udp, Tcp, TransportFactory, Udp};
use crate::uart::{AtUart, DEFAULT_COMMAND_TIMEOUT};
use crate::websocket::WebSocket;

pub struct Ml307Modem {
    core: ModemCore,
}

impl Ml307Modem {
    pub fn new(uart: Arc<AtUart>) -> Arc<Self> {
        let shared = Arc::new(ModemShared::new());
        let urc_shared = shared.clone();
        let core = ModemCore::new(uart, shared, move |command, arguments| match command {
            "MIPCALL" if arguments.len() >= 3 => {
                if arguments[1].int_value() == 1 {
                    info!(
                        "PDP context {} IP: {}",
                        arguments[0].int_value(),
                        arguments[2].string_value()
                    );
                    urc_shared.network_ready.store(true, Ordering::Release);
                    urc_shared.events.set(EVENT_NETWORK_READY);
                }
            }
            "MATREADY" => {
                // The module restarted; any previous link state is gone.
                urc_shared.set_network_ready(false);
            }
            _ => {}
        });

        let modem = Arc::new(Self { core });
        modem.reset_connections();
        modem
    }

    /// Drop any HTTP slots that survived a host reset.
    fn reset_connections(&self) {
        for id in 0..4 {
            let mut command: heapless::String<24> = heapless::String::new();
            let _ = write!(command, "AT+MHTTPDEL={}", id);
            self.core
                .uart
                .send_command(&command, DEFAULT_COMMAND_TIMEOUT, true);
        }
    }
}

impl TransportFactory for Ml307Modem {
    fn create_tcp(&self, connect_id: i32) -> Box<dyn Tcp> {
        assert!(connect_id >= 0);
        Box::new(Ml307Tcp::new(self.core.uart.clone(), connect_id))
    }

    fn create_ssl(&self, connect_id: i32) -> Box<dyn Tcp> {
        assert!(connect_id >= 0);
        Box::new(Ml307Tcp::new_ssl(self.core.uart.clone(), connect_id))
    }

    fn create_udp(&self, connect_id: i32) -> Box<dyn Udp> {
        assert!(connect_id >= 0);
        Box::new(Ml307Udp::new(self.core.uart.clone(), connect_id))
    }
}

impl Modem for Ml307Modem {
    fn at_uart(&self) -> Arc<AtUart> {
        self.core.uart.clone()
    }

    fn wait_for_network_ready(&self, timeout: Option<Duration>) -> NetworkStatus {
        let status = self.core.wait_for_network_ready(timeout);
        if status != NetworkStatus::Ready {
            return status;
        }

        // Registration alone is not enough; poll until the PDP context has
        // an address, backing off 10 ms up to 1 s per round.
        let mut delay = Duration::from_millis(10);
        for _ in 0..10 {
            self.core
                .uart
                .send_command("AT+MIPCALL?", DEFAULT_COMMAND_TIMEOUT, true);
            if self
                .core
                .shared
                .events
                .wait(EVENT_NETWORK_READY, false, Some(delay))
                != 0
            {
                return NetworkStatus::Ready;
            }
            delay = (delay * 2).min(Duration::from_millis(1000));
        }
        error!("Network ready but no IP address");
        status
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
        self.core
            .uart
            .send_command("AT+MREBOOT=0", DEFAULT_COMMAND_TIMEOUT, true);
    }

    fn set_flight_mode(&self, enable: bool) {
        self.core.set_flight_mode(enable);
    }

    fn set_sleep_mode(&self, enable: bool, delay_seconds: u32) -> bool {
        if enable {
            if delay_seconds > 0 {
                let mut command: heapless::String<40> = heapless::String::new();
                let _ = write!(command, "AT+MLPMCFG=\"delaysleep\",{}", delay_seconds);
                self.core
                    .uart
                    .send_command(&command, DEFAULT_COMMAND_TIMEOUT, true);
            }
            self.core.uart.send_command(
                "AT+MLPMCFG=\"sleepmode\",2,0",
                DEFAULT_COMMAND_TIMEOUT,
                true,
            )
        } else {
            // The module only listens once DTR wakes it.
            let _active = self.core.uart.activate();
            self.core.uart.send_command(
                "AT+MLPMCFG=\"sleepmode\",0,0",
                DEFAULT_COMMAND_TIMEOUT,
                true,
            )
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
        Box::new(Ml307Mqtt::new(self.core.uart.clone(), connect_id))
    }

    fn create_http(self: Arc<Self>, _connect_id: i32) -> Box<dyn Http> {
        // HTTP slots are numbered by the module itself via MHTTPCREATE.
        Box::new(Ml307Http::new(self.core.uart.clone()))
    }

    fn create_websocket(self: Arc<Self>, connect_id: i32) -> WebSocket {
        assert!(connect_id >= 0);
        WebSocket::new(self, connect_id)
    }
}
