//! Modem supervisor: module detection, SIM and registration state,
//! lifecycle control, and the endpoint factory.

use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use crate::event::EventGroup;
use crate::http::Http;
use crate::mqtt::Mqtt;
use crate::serial::SerialPort;
use crate::transport::TransportFactory;
use crate::types::ArgumentValue;
use crate::uart::{AtUart, UrcSubscription, DEFAULT_COMMAND_TIMEOUT};
use crate::websocket::WebSocket;
use crate::config::UartConfig;

pub mod ec801e;
pub mod ml307;

pub use ec801e::Ec801eModem;
pub use ml307::Ml307Modem;

pub(crate) const EVENT_NETWORK_ERROR: u32 = 1 << 3;
pub(crate) const EVENT_NETWORK_READY: u32 = 1 << 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum NetworkStatus {
    Ready,
    ErrorInsertPin,
    ErrorRegistrationDenied,
    ErrorTimeout,
    Error,
}

/// EPS registration state from `+CEREG`.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct CeregState {
    pub stat: i32,
    pub tac: String,
    pub ci: String,
    pub act: i32,
}

impl CeregState {
    pub fn new() -> Self {
        Self {
            stat: 0,
            tac: String::new(),
            ci: String::new(),
            act: -1,
        }
    }

    pub fn is_registered(&self) -> bool {
        self.stat == 1 || self.stat == 5
    }

    /// Diagnostic JSON rendering.
    pub fn to_json(&self) -> String {
        let mut json = String::from("{");
        json.push_str(&format!("\"stat\":{}", self.stat));
        if !self.tac.is_empty() {
            json.push_str(&format!(",\"tac\":\"{}\"", self.tac));
        }
        if !self.ci.is_empty() {
            json.push_str(&format!(",\"ci\":\"{}\"", self.ci));
        }
        if self.act >= 0 {
            json.push_str(&format!(",\"AcT\":{}", self.act));
        }
        json.push('}');
        json
    }
}

pub type NetworkStateCallback = Box<dyn Fn(bool) + Send>;

#[derive(Default)]
pub(crate) struct Identity {
    pub imei: String,
    pub iccid: String,
    pub carrier_name: String,
    pub module_revision: String,
}

/// State shared between a modem supervisor and its URC callback.
pub(crate) struct ModemShared {
    pub events: EventGroup,
    pub pin_ready: AtomicBool,
    pub network_ready: AtomicBool,
    pub csq: AtomicI32,
    pub identity: Mutex<Identity>,
    pub cereg: Mutex<CeregState>,
    pub on_network_state_changed: Mutex<Option<NetworkStateCallback>>,
}

impl ModemShared {
    pub fn new() -> Self {
        Self {
            events: EventGroup::new(),
            pin_ready: AtomicBool::new(true),
            network_ready: AtomicBool::new(false),
            csq: AtomicI32::new(-1),
            identity: Mutex::new(Identity::default()),
            cereg: Mutex::new(CeregState::new()),
            on_network_state_changed: Mutex::new(None),
        }
    }

    pub(crate) fn set_network_ready(&self, ready: bool) {
        if self.network_ready.swap(ready, Ordering::AcqRel) != ready {
            if let Some(callback) = self.on_network_state_changed.lock().unwrap().as_ref() {
                callback(ready);
            }
        }
    }
}

pub(crate) fn handle_common_urc(shared: &ModemShared, command: &str, arguments: &[ArgumentValue]) {
    match command {
        "CGSN" if !arguments.is_empty() => {
            shared.identity.lock().unwrap().imei = arguments[0].string_value().to_string();
        }
        "ICCID" if !arguments.is_empty() => {
            shared.identity.lock().unwrap().iccid = arguments[0].string_value().to_string();
        }
        "COPS" if arguments.len() >= 4 => {
            shared.identity.lock().unwrap().carrier_name =
                arguments[2].string_value().to_string();
        }
        "CSQ" if !arguments.is_empty() => {
            shared.csq.store(arguments[0].int_value(), Ordering::Release);
        }
        "CEREG" if !arguments.is_empty() => {
            let mut state = CeregState::new();
            if arguments.len() >= 2 {
                // A solicited reply leads with the URC mode; skip it.
                let index = if arguments[1].is_int() { 1 } else { 0 };
                state.stat = arguments[index].int_value();
                if let Some(tac) = arguments.get(index + 1) {
                    state.tac = tac.string_value().to_string();
                }
                if let Some(ci) = arguments.get(index + 2) {
                    state.ci = ci.string_value().to_string();
                }
                if let Some(act) = arguments.get(index + 3) {
                    state.act = act.int_value();
                }
            }

            let registered = state.is_registered();
            let denied = state.stat == 3;
            *shared.cereg.lock().unwrap() = state;

            shared.set_network_ready(registered);
            if registered {
                shared.events.set(EVENT_NETWORK_READY);
            } else if denied {
                shared.events.set(EVENT_NETWORK_ERROR);
            }
        }
        "CPIN" if !arguments.is_empty() => {
            shared
                .pin_ready
                .store(arguments[0].string_value() == "READY", Ordering::Release);
        }
        _ => {}
    }
}

/// Supervisor plumbing common to both modem families.
pub(crate) struct ModemCore {
    pub uart: Arc<AtUart>,
    pub shared: Arc<ModemShared>,
    subscription: UrcSubscription,
}

impl ModemCore {
    pub fn new<F>(uart: Arc<AtUart>, shared: Arc<ModemShared>, extra_urc: F) -> Self
    where
        F: Fn(&str, &[ArgumentValue]) + Send + Sync + 'static,
    {
        let callback_shared = shared.clone();
        let subscription = uart.register_urc_callback(move |command, arguments| {
            handle_common_urc(&callback_shared, command, arguments);
            extra_urc(command, arguments);
        });
        Self {
            uart,
            shared,
            subscription,
        }
    }

    /// SIM check, registration URC enable, then block for a registration
    /// verdict. Shared by both families; ML307 layers an IP-address wait
    /// on top.
    pub fn wait_for_network_ready(&self, timeout: Option<Duration>) -> NetworkStatus {
        info!("Waiting for network ready...");
        self.shared.network_ready.store(false, Ordering::Release);
        *self.shared.cereg.lock().unwrap() = CeregState::new();
        self.shared
            .events
            .clear(EVENT_NETWORK_READY | EVENT_NETWORK_ERROR);

        for _ in 0..10 {
            if self
                .uart
                .send_command("AT+CPIN?", DEFAULT_COMMAND_TIMEOUT, true)
            {
                self.shared.pin_ready.store(true, Ordering::Release);
                break;
            }
            // CME 10: SIM not inserted.
            if self.uart.cme_error_code() == 10 {
                self.shared.pin_ready.store(false, Ordering::Release);
                return NetworkStatus::ErrorInsertPin;
            }
            thread::sleep(Duration::from_secs(1));
        }

        if !self
            .uart
            .send_command("AT+CEREG=2", DEFAULT_COMMAND_TIMEOUT, true)
        {
            return NetworkStatus::Error;
        }
        if !self
            .uart
            .send_command("AT+CEREG?", DEFAULT_COMMAND_TIMEOUT, true)
        {
            return NetworkStatus::Error;
        }

        let bits = self
            .shared
            .events
            .wait(EVENT_NETWORK_READY | EVENT_NETWORK_ERROR, true, timeout);
        if bits & EVENT_NETWORK_READY != 0 {
            NetworkStatus::Ready
        } else if bits & EVENT_NETWORK_ERROR != 0 {
            if self.shared.cereg.lock().unwrap().stat == 3 {
                NetworkStatus::ErrorRegistrationDenied
            } else if !self.shared.pin_ready.load(Ordering::Acquire) {
                NetworkStatus::ErrorInsertPin
            } else {
                NetworkStatus::Error
            }
        } else {
            NetworkStatus::ErrorTimeout
        }
    }

    pub fn get_imei(&self) -> String {
        {
            let identity = self.shared.identity.lock().unwrap();
            if !identity.imei.is_empty() {
                return identity.imei.clone();
            }
        }
        self.uart
            .send_command("AT+CGSN=1", DEFAULT_COMMAND_TIMEOUT, true);
        self.shared.identity.lock().unwrap().imei.clone()
    }

    pub fn get_iccid(&self) -> String {
        self.uart
            .send_command("AT+ICCID", DEFAULT_COMMAND_TIMEOUT, true);
        self.shared.identity.lock().unwrap().iccid.clone()
    }

    pub fn get_module_revision(&self) -> String {
        {
            let identity = self.shared.identity.lock().unwrap();
            if !identity.module_revision.is_empty() {
                return identity.module_revision.clone();
            }
        }
        if self
            .uart
            .send_command("AT+CGMR", DEFAULT_COMMAND_TIMEOUT, true)
        {
            let mut identity = self.shared.identity.lock().unwrap();
            identity.module_revision = self.uart.response();
            return identity.module_revision.clone();
        }
        String::new()
    }

    pub fn get_carrier_name(&self) -> String {
        self.uart
            .send_command("AT+COPS?", DEFAULT_COMMAND_TIMEOUT, true);
        self.shared.identity.lock().unwrap().carrier_name.clone()
    }

    pub fn get_csq(&self) -> i32 {
        self.uart
            .send_command("AT+CSQ", Duration::from_millis(10), true);
        self.shared.csq.load(Ordering::Acquire)
    }

    pub fn get_registration_state(&self) -> CeregState {
        self.uart
            .send_command("AT+CEREG?", DEFAULT_COMMAND_TIMEOUT, true);
        self.shared.cereg.lock().unwrap().clone()
    }

    pub fn set_flight_mode(&self, enable: bool) {
        if enable {
            self.uart
                .send_command("AT+CFUN=4", DEFAULT_COMMAND_TIMEOUT, true);
            self.uart.set_dtr_pin(true);
            self.shared.network_ready.store(false, Ordering::Release);
        } else {
            self.uart.set_dtr_pin(false);
            self.uart
                .send_command("AT+CFUN=1", DEFAULT_COMMAND_TIMEOUT, true);
        }
    }
}

impl Drop for ModemCore {
    fn drop(&mut self) {
        self.uart.unregister_urc_callback(self.subscription);
    }
}

/// Capability-neutral modem interface. Every variant is also the factory
/// for the endpoints it can multiplex.
pub trait Modem: TransportFactory {
    fn at_uart(&self) -> Arc<AtUart>;

    fn wait_for_network_ready(&self, timeout: Option<Duration>) -> NetworkStatus;
    fn get_imei(&self) -> String;
    fn get_iccid(&self) -> String;
    fn get_module_revision(&self) -> String;
    fn get_carrier_name(&self) -> String;
    fn get_csq(&self) -> i32;
    fn get_registration_state(&self) -> CeregState;

    fn reboot(&self);
    fn set_flight_mode(&self, enable: bool);
    fn set_sleep_mode(&self, enable: bool, delay_seconds: u32) -> bool;
    fn on_network_state_changed(&self, callback: NetworkStateCallback);

    fn pin_ready(&self) -> bool;
    fn network_ready(&self) -> bool;

    fn create_mqtt(&self, connect_id: i32) -> Box<dyn Mqtt>;
    fn create_http(self: Arc<Self>, connect_id: i32) -> Box<dyn Http>;
    fn create_websocket(self: Arc<Self>, connect_id: i32) -> WebSocket;
}

/// Bring the link up and pick the driver for whatever module answers.
///
/// Probes the line speed, switches to `baud_rate`, then dispatches on the
/// `AT+CGMR` revision prefix: `ML307*` and `EC801E*`/`NT26K*` are known;
/// anything else falls back to the ML307 driver with a warning.
pub fn detect(
    port: Arc<dyn SerialPort>,
    config: UartConfig,
    baud_rate: u32,
) -> Option<Arc<dyn Modem>> {
    let uart = Arc::new(AtUart::new(port, config));

    if !uart.set_baud_rate(baud_rate, None) {
        return None;
    }

    if !uart.send_command("AT+CGMR", Duration::from_secs(3), true) {
        error!("Failed to send AT+CGMR command");
        return None;
    }

    let response = uart.response();
    info!("Detected modem: {}", response);

    if response.starts_with("EC801E") || response.starts_with("NT26K") {
        Some(Ec801eModem::new(uart))
    } else if response.starts_with("ML307") {
        Some(Ml307Modem::new(uart))
    } else {
        warn!(
            "Unrecognized modem type: {}, using the ML307 driver as default",
            response
        );
        Some(Ml307Modem::new(uart))
    }
}
