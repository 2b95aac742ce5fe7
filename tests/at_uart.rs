//! End-to-end tests of the AT driver over a scripted serial port.

mod common;

use std::sync::{Arc, Mutex};
use std::time::Duration;

use cellular_mux::test_helpers::ScriptedSerial;
use cellular_mux::{ArgumentValue, AtUart, SerialEvent, UartConfig};
use common::{init_log, wait_until};

type Captured = Arc<Mutex<Vec<(String, Vec<ArgumentValue>)>>>;

fn capture(uart: &AtUart) -> Captured {
    let captured: Captured = Arc::new(Mutex::new(Vec::new()));
    let sink = captured.clone();
    uart.register_urc_callback(move |command, arguments| {
        sink.lock()
            .unwrap()
            .push((command.to_string(), arguments.to_vec()));
    });
    captured
}

#[test]
fn single_urc_parse() {
    init_log();
    let port = Arc::new(ScriptedSerial::new());
    let uart = AtUart::new(port.clone(), UartConfig::new());
    let captured = capture(&uart);

    port.inject(b"+CSQ: 25,99\r\n");

    assert!(wait_until(
        || !captured.lock().unwrap().is_empty(),
        Duration::from_secs(2)
    ));
    let events = captured.lock().unwrap();
    assert_eq!(events.len(), 1);
    let (command, arguments) = &events[0];
    assert_eq!(command, "CSQ");
    assert_eq!(arguments.len(), 2);
    assert_eq!(arguments[0].int_value(), 25);
    assert_eq!(arguments[1].int_value(), 99);
}

#[test]
fn command_and_urc_interleave() {
    init_log();
    let port = Arc::new(ScriptedSerial::with_responder(|data, _| {
        if data.starts_with(b"AT+MIPCALL?") {
            b"+MIPCALL: 0,1,\"10.0.0.1\"\r\nOK\r\n".to_vec()
        } else {
            Vec::new()
        }
    }));
    let uart = AtUart::new(port.clone(), UartConfig::new());
    let captured = capture(&uart);

    assert!(uart.send_command("AT+MIPCALL?", Duration::from_secs(1), true));

    // The URC was dispatched before the command completed.
    let events = captured.lock().unwrap();
    assert_eq!(events.len(), 1);
    let (command, arguments) = &events[0];
    assert_eq!(command, "MIPCALL");
    assert_eq!(arguments[0].int_value(), 0);
    assert_eq!(arguments[1].int_value(), 1);
    assert_eq!(arguments[2].string_value(), "10.0.0.1");
}

#[test]
fn cme_error_sets_code_and_stays_internal() {
    init_log();
    let port = Arc::new(ScriptedSerial::with_responder(|data, _| {
        if data.starts_with(b"AT+CPIN?") {
            b"+CME ERROR: 10\r\n".to_vec()
        } else {
            Vec::new()
        }
    }));
    let uart = AtUart::new(port.clone(), UartConfig::new());
    let captured = capture(&uart);

    assert!(!uart.send_command("AT+CPIN?", Duration::from_secs(1), true));
    assert_eq!(uart.cme_error_code(), 10);
    // CME errors never reach subscribers.
    assert!(captured.lock().unwrap().is_empty());
}

#[test]
fn response_slot_keeps_last_plain_line() {
    init_log();
    let port = Arc::new(ScriptedSerial::with_responder(|data, _| {
        if data.starts_with(b"AT+CGMR") {
            b"ML307R-DL-00\r\nOK\r\n".to_vec()
        } else {
            Vec::new()
        }
    }));
    let uart = AtUart::new(port.clone(), UartConfig::new());

    assert!(uart.send_command("AT+CGMR", Duration::from_secs(1), true));
    assert_eq!(uart.response(), "ML307R-DL-00");

    // The slot is cleared when the next command starts.
    assert!(!uart.send_command("AT+NOREPLY", Duration::from_millis(50), true));
    assert_eq!(uart.response(), "");
}

#[test]
fn baud_detection_and_switch() {
    init_log();
    let port = Arc::new(ScriptedSerial::with_responder({
        let mut rate_set = false;
        move |data, baud_rate| {
            if data.starts_with(b"AT+IPR=115200") {
                rate_set = true;
                return b"OK\r\n".to_vec();
            }
            if data == b"AT\r\n" && (baud_rate == 9600 || (rate_set && baud_rate == 115200)) {
                return b"OK\r\n".to_vec();
            }
            Vec::new()
        }
    }));
    let uart = AtUart::new(port.clone(), UartConfig::new());

    assert!(uart.set_baud_rate(115200, Some(Duration::from_secs(10))));
    assert_eq!(uart.baud_rate(), 115200);
    assert_eq!(port.baud_rate(), 115200);
    assert!(uart.send_command("AT", Duration::from_secs(1), true));
    assert!(port.transcript().contains("AT+IPR=115200"));
}

#[test]
fn data_prompt_two_phase_send() {
    init_log();
    let port = Arc::new(ScriptedSerial::with_responder(|data, _| {
        if data.starts_with(b"AT+QISEND=") {
            b">".to_vec()
        } else if data == b"Hello" {
            b"OK\r\n".to_vec()
        } else {
            Vec::new()
        }
    }));
    let uart = AtUart::new(port.clone(), UartConfig::new());

    assert!(uart.send_command_with_data(
        "AT+QISEND=0,5",
        Duration::from_secs(1),
        true,
        b"Hello"
    ));
    let writes = port.writes();
    assert_eq!(writes[0], b"AT+QISEND=0,5\r\n");
    assert_eq!(writes[1], b"Hello");
}

#[test]
fn fifo_overflow_becomes_synthetic_urc() {
    init_log();
    let port = Arc::new(ScriptedSerial::new());
    let uart = AtUart::new(port.clone(), UartConfig::new());
    let captured = capture(&uart);

    port.inject_event(SerialEvent::FifoOverflow);

    assert!(wait_until(
        || !captured.lock().unwrap().is_empty(),
        Duration::from_secs(2)
    ));
    let events = captured.lock().unwrap();
    assert_eq!(events[0].0, "FIFO_OVERFLOW");
    assert!(events[0].1.is_empty());
}

#[test]
fn urc_callbacks_run_in_registration_order() {
    init_log();
    let port = Arc::new(ScriptedSerial::new());
    let uart = AtUart::new(port.clone(), UartConfig::new());

    let order: Arc<Mutex<Vec<&'static str>>> = Arc::new(Mutex::new(Vec::new()));
    let first = order.clone();
    let a = uart.register_urc_callback(move |_, _| first.lock().unwrap().push("a"));
    let second = order.clone();
    uart.register_urc_callback(move |_, _| second.lock().unwrap().push("b"));

    port.inject(b"+CPIN: READY\r\n");
    assert!(wait_until(
        || order.lock().unwrap().len() == 2,
        Duration::from_secs(2)
    ));
    assert_eq!(*order.lock().unwrap(), vec!["a", "b"]);

    uart.unregister_urc_callback(a);
    port.inject(b"+CPIN: READY\r\n");
    assert!(wait_until(
        || order.lock().unwrap().len() == 3,
        Duration::from_secs(2)
    ));
    assert_eq!(*order.lock().unwrap(), vec!["a", "b", "b"]);
}

#[test]
fn chunked_delivery_matches_single_burst() {
    init_log();
    let port = Arc::new(ScriptedSerial::new());
    let uart = AtUart::new(port.clone(), UartConfig::new());
    let captured = capture(&uart);

    // Byte-at-a-time delivery of a URC still parses once, identically.
    for byte in b"+MIPURC: \"rtcp\",2,5,\"48656C6C6F\"\r\n" {
        port.inject(&[*byte]);
    }

    assert!(wait_until(
        || !captured.lock().unwrap().is_empty(),
        Duration::from_secs(2)
    ));
    let events = captured.lock().unwrap();
    assert_eq!(events.len(), 1);
    let (command, arguments) = &events[0];
    assert_eq!(command, "MIPURC");
    assert_eq!(arguments[0].string_value(), "rtcp");
    assert_eq!(arguments[1].int_value(), 2);
    assert_eq!(arguments[3].string_value(), "48656C6C6F");
}

#[test]
fn activation_guard_drives_dtr_and_power() {
    init_log();
    let states = Arc::new(Mutex::new(Vec::new()));
    let power = Arc::new(cellular_mux::test_helpers::CountingPowerLock::default());
    let port = Arc::new(ScriptedSerial::new());
    let uart = AtUart::new(
        port,
        UartConfig::new()
            .dtr_pin(cellular_mux::test_helpers::RecordingDtrPin {
                states: states.clone(),
            })
            .power_lock(power.clone()),
    );

    {
        let _guard = uart.activate();
        assert_eq!(*states.lock().unwrap(), vec![false]);
        assert_eq!(power.acquired.load(std::sync::atomic::Ordering::SeqCst), 1);
    }
    assert_eq!(*states.lock().unwrap(), vec![false, true]);
    assert_eq!(power.acquired.load(std::sync::atomic::Ordering::SeqCst), 0);
}
