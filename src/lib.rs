//! AT-command multiplexer for cellular modems.
//!
//! Turns the single UART of an ML307 or EC801E module into a set of
//! concurrent, typed network endpoints: TCP, TLS and UDP sockets, MQTT and
//! HTTP clients, and WebSockets. Logical connections share the serial link
//! and are told apart by small integer connect-ids carried in every URC.
//!
//! ```no_run
//! use std::sync::Arc;
//! use cellular_mux::{detect, UartConfig};
//! # fn port() -> Arc<dyn cellular_mux::SerialPort> { unimplemented!() }
//!
//! let modem = detect(port(), UartConfig::new(), 115200).unwrap();
//! modem.wait_for_network_ready(Some(std::time::Duration::from_secs(60)));
//!
//! let mut tcp = modem.create_tcp(0);
//! tcp.on_stream(Box::new(|data| println!("{} bytes in", data.len())));
//! if tcp.connect("example.com", 80) {
//!     tcp.send(b"GET / HTTP/1.1\r\nHost: example.com\r\n\r\n");
//! }
//! ```

mod fmt;

mod config;
mod digest;
mod error;
mod event;
pub mod hex;
mod serial;
mod types;
mod uart;

pub mod http;
pub mod modem;
pub mod mqtt;
pub mod transport;
pub mod websocket;

pub mod test_helpers;

pub use config::UartConfig;
pub use error::Error;
pub use event::EventGroup;
pub use serial::{DtrPin, NoPowerLock, PowerLock, SerialEvent, SerialPort};
pub use types::ArgumentValue;
pub use uart::{ActivationGuard, AtUart, UrcSubscription, DEFAULT_COMMAND_TIMEOUT};

pub use http::{Http, HttpClient, Ml307Http};
pub use modem::{detect, CeregState, Ec801eModem, Ml307Modem, Modem, NetworkStatus};
pub use mqtt::{Ec801eMqtt, Ml307Mqtt, Mqtt};
pub use transport::{
    Ec801eSsl, Ec801eTcp, Ec801eUdp, Ml307Tcp, Ml307Udp, Tcp, TransportFactory, Udp,
};
pub use websocket::WebSocket;
