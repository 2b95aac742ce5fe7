//! Full-duplex AT driver over one serial port.
//!
//! Two dedicated threads run per [`AtUart`]: the event thread drains serial
//! driver events, the receive thread is the sole reader of the line and the
//! sole mutator of the receive buffer and the response slot. Synchronous
//! commands from any number of caller threads are serialized by the command
//! mutex, so at most one command is in flight over the UART at any time.
//! URC callbacks run synchronously on the receive thread; they must not
//! block it for long.

use core::fmt::Write as _;
use std::sync::atomic::{AtomicBool, AtomicI32, AtomicU32, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crate::config::UartConfig;
use crate::digest::{digest, Digested};
use crate::event::EventGroup;
use crate::serial::{no_power_lock, DtrPin, PowerLock, SerialEvent, SerialPort};
use crate::types::ArgumentValue;

pub const DEFAULT_COMMAND_TIMEOUT: Duration = Duration::from_millis(1000);

/// Synthetic URC delivered to every subscriber when the driver FIFO
/// overflows; transports treat it as fatal for their slot.
pub const FIFO_OVERFLOW_URC: &str = "FIFO_OVERFLOW";

const EVENT_SHUTDOWN: u32 = 1 << 0;
const EVENT_DATA_AVAILABLE: u32 = 1 << 1;
const EVENT_COMMAND_DONE: u32 = 1 << 2;
const EVENT_COMMAND_ERROR: u32 = 1 << 3;
const EVENT_BUFFER_FULL: u32 = 1 << 4;
const EVENT_FIFO_OVERFLOW: u32 = 1 << 5;
const EVENT_BREAK: u32 = 1 << 6;
const EVENT_RING_INDICATOR: u32 = 1 << 7;

const BAUD_RATES: [u32; 8] = [115200, 921600, 460800, 230400, 57600, 38400, 19200, 9600];

type UrcFn = dyn Fn(&str, &[ArgumentValue]) + Send + Sync;

/// Stable handle into the URC callback registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UrcSubscription(u64);

struct UrcRegistry {
    next_id: u64,
    entries: Vec<(u64, Arc<UrcFn>)>,
}

pub(crate) struct DtrState {
    pin: Option<Box<dyn DtrPin>>,
    power: Arc<dyn PowerLock>,
}

struct UartInner {
    port: Arc<dyn SerialPort>,
    events: EventGroup,
    command_lock: Mutex<()>,
    response: Mutex<String>,
    urc_callbacks: Mutex<UrcRegistry>,
    wait_for_response: AtomicBool,
    cme_error_code: AtomicI32,
    baud_rate: AtomicU32,
    running: AtomicBool,
    debug: AtomicBool,
    dtr: Mutex<DtrState>,
    power: Arc<dyn PowerLock>,
}

pub struct AtUart {
    inner: Arc<UartInner>,
    event_thread: Option<JoinHandle<()>>,
    receive_thread: Option<JoinHandle<()>>,
}

impl AtUart {
    pub fn new(port: Arc<dyn SerialPort>, config: UartConfig) -> Self {
        let power = config.power_lock.unwrap_or_else(no_power_lock);
        let inner = Arc::new(UartInner {
            port,
            events: EventGroup::new(),
            command_lock: Mutex::new(()),
            response: Mutex::new(String::new()),
            urc_callbacks: Mutex::new(UrcRegistry {
                next_id: 0,
                entries: Vec::new(),
            }),
            wait_for_response: AtomicBool::new(false),
            cme_error_code: AtomicI32::new(0),
            baud_rate: AtomicU32::new(115200),
            running: AtomicBool::new(true),
            debug: AtomicBool::new(config.debug),
            dtr: Mutex::new(DtrState {
                pin: config.dtr,
                power: power.clone(),
            }),
            power,
        });

        let event_inner = inner.clone();
        let event_thread = thread::Builder::new()
            .name("modem-event".into())
            .spawn(move || event_loop(event_inner))
            .expect("failed to spawn modem event thread");

        let receive_inner = inner.clone();
        let receive_thread = thread::Builder::new()
            .name("modem-receive".into())
            .spawn(move || receive_loop(receive_inner))
            .expect("failed to spawn modem receive thread");

        Self {
            inner,
            event_thread: Some(event_thread),
            receive_thread: Some(receive_thread),
        }
    }

    /// Send `command`, wait up to `timeout` for `OK`/`ERROR`. A zero
    /// timeout fires and forgets. Returns `true` only on `OK`.
    pub fn send_command(&self, command: &str, timeout: Duration, add_crlf: bool) -> bool {
        self.send_command_with_data(command, timeout, add_crlf, &[])
    }

    /// Like [`send_command`](Self::send_command), but after the first
    /// completion (`OK` or the `>` data prompt) writes `data` raw and waits
    /// for a second completion.
    pub fn send_command_with_data(
        &self,
        command: &str,
        timeout: Duration,
        add_crlf: bool,
        data: &[u8],
    ) -> bool {
        let inner = &self.inner;
        let _guard = inner.command_lock.lock().unwrap();

        self.log_tx(command);

        inner.events.clear(EVENT_COMMAND_DONE | EVENT_COMMAND_ERROR);
        inner.wait_for_response.store(true, Ordering::Release);
        inner.cme_error_code.store(0, Ordering::Release);
        inner.response.lock().unwrap().clear();

        let written = if add_crlf {
            let mut line = String::with_capacity(command.len() + 2);
            line.push_str(command);
            line.push_str("\r\n");
            inner.port.write(line.as_bytes())
        } else {
            inner.port.write(command.as_bytes())
        };
        if written.is_err() {
            inner.wait_for_response.store(false, Ordering::Release);
            error!("serial write failed");
            return false;
        }

        if !timeout.is_zero() {
            let bits = inner
                .events
                .wait(EVENT_COMMAND_DONE | EVENT_COMMAND_ERROR, true, Some(timeout));
            inner.wait_for_response.store(false, Ordering::Release);
            if bits & EVENT_COMMAND_DONE == 0 {
                return false;
            }
        } else {
            inner.wait_for_response.store(false, Ordering::Release);
        }

        if !data.is_empty() {
            inner.wait_for_response.store(true, Ordering::Release);
            if inner.port.write(data).is_err() {
                inner.wait_for_response.store(false, Ordering::Release);
                error!("serial write failed");
                return false;
            }
            let bits = inner
                .events
                .wait(EVENT_COMMAND_DONE | EVENT_COMMAND_ERROR, true, Some(timeout));
            inner.wait_for_response.store(false, Ordering::Release);
            if bits & EVENT_COMMAND_DONE == 0 {
                return false;
            }
        }
        true
    }

    /// Raw write, bypassing command framing. Used for data phases that the
    /// modem acknowledges with a URC instead of `OK`.
    pub fn send_data(&self, data: &[u8]) -> bool {
        self.inner.port.write(data).is_ok()
    }

    /// Text of the last non-terminator, non-URC line received after the
    /// most recent command send.
    pub fn response(&self) -> String {
        self.inner.response.lock().unwrap().clone()
    }

    /// Numeric code of the last `+CME ERROR`, 0 when the last command saw
    /// none.
    pub fn cme_error_code(&self) -> i32 {
        self.inner.cme_error_code.load(Ordering::Acquire)
    }

    pub fn register_urc_callback<F>(&self, callback: F) -> UrcSubscription
    where
        F: Fn(&str, &[ArgumentValue]) + Send + Sync + 'static,
    {
        let mut registry = self.inner.urc_callbacks.lock().unwrap();
        let id = registry.next_id;
        registry.next_id += 1;
        registry.entries.push((id, Arc::new(callback)));
        UrcSubscription(id)
    }

    pub fn unregister_urc_callback(&self, subscription: UrcSubscription) {
        let mut registry = self.inner.urc_callbacks.lock().unwrap();
        registry.entries.retain(|(id, _)| *id != subscription.0);
    }

    /// Drive the DTR output. High releases the modem into sleep, low wakes
    /// it. No-op without a configured pin.
    pub fn set_dtr_pin(&self, high: bool) {
        let mut dtr = self.inner.dtr.lock().unwrap();
        if let Some(pin) = dtr.pin.as_mut() {
            if self.inner.debug.load(Ordering::Relaxed) {
                info!("Set DTR pin to {}", high as u8);
            }
            pin.set_high(high);
            // The module needs a moment after a DTR edge before it accepts
            // commands.
            thread::sleep(Duration::from_millis(20));
        }
    }

    /// Scoped wake: asserts DTR (low) and holds the power-management
    /// reference until the guard drops.
    pub fn activate(&self) -> ActivationGuard<'_> {
        let mut dtr = self.inner.dtr.lock().unwrap();
        dtr.power.acquire();
        if let Some(pin) = dtr.pin.as_mut() {
            pin.set_high(false);
            thread::sleep(Duration::from_millis(20));
        }
        ActivationGuard { dtr }
    }

    pub fn baud_rate(&self) -> u32 {
        self.inner.baud_rate.load(Ordering::Acquire)
    }

    /// Probe the line speed, then switch modem and UART to `new_baud_rate`.
    /// `timeout` bounds the detection loop; `None` retries forever.
    pub fn set_baud_rate(&self, new_baud_rate: u32, timeout: Option<Duration>) -> bool {
        if !self.detect_baud_rate(timeout) {
            error!("Failed to detect baud rate");
            return false;
        }
        if new_baud_rate == self.baud_rate() {
            return true;
        }

        let mut command: heapless::String<24> = heapless::String::new();
        let _ = write!(command, "AT+IPR={}", new_baud_rate);
        if !self.send_command(&command, DEFAULT_COMMAND_TIMEOUT, true) {
            info!("Failed to set baud rate to {}", new_baud_rate);
            return false;
        }
        if self.inner.port.set_baud_rate(new_baud_rate).is_err() {
            return false;
        }
        self.inner.baud_rate.store(new_baud_rate, Ordering::Release);
        info!("Set baud rate to {}", new_baud_rate);
        self.send_command("AT", DEFAULT_COMMAND_TIMEOUT, true)
    }

    fn detect_baud_rate(&self, timeout: Option<Duration>) -> bool {
        let start = Instant::now();
        loop {
            info!("Detecting baud rate...");
            for &rate in &BAUD_RATES {
                if self.inner.port.set_baud_rate(rate).is_err() {
                    return false;
                }
                if self.send_command("AT", Duration::from_millis(20), true) {
                    info!("Detected baud rate: {}", rate);
                    self.inner.baud_rate.store(rate, Ordering::Release);
                    return true;
                }
            }
            if let Some(timeout) = timeout {
                if start.elapsed() >= timeout {
                    error!("Baud rate detection timeout");
                    return false;
                }
            }
            thread::sleep(Duration::from_secs(1));
        }
    }

    pub fn set_debug(&self, enable: bool) {
        self.inner.debug.store(enable, Ordering::Relaxed);
    }

    fn log_tx(&self, command: &str) {
        let shown = &command[..command.len().min(64)];
        if self.inner.debug.load(Ordering::Relaxed) {
            info!(">> {} ({} bytes)", shown, command.len());
        } else {
            trace!(">> {} ({} bytes)", shown, command.len());
        }
    }
}

impl Drop for AtUart {
    fn drop(&mut self) {
        self.inner.running.store(false, Ordering::Release);
        self.inner.events.set(EVENT_SHUTDOWN);
        if let Some(handle) = self.receive_thread.take() {
            handle.join().ok();
        }
        if let Some(handle) = self.event_thread.take() {
            handle.join().ok();
        }
    }
}

/// Holds the modem awake for a scope. Acquired via [`AtUart::activate`];
/// the DTR mutex is held for the guard's lifetime.
pub struct ActivationGuard<'a> {
    dtr: MutexGuard<'a, DtrState>,
}

impl Drop for ActivationGuard<'_> {
    fn drop(&mut self) {
        if let Some(pin) = self.dtr.pin.as_mut() {
            pin.set_high(true);
        }
        self.dtr.power.release();
    }
}

fn event_loop(inner: Arc<UartInner>) {
    while inner.running.load(Ordering::Acquire) {
        let event = inner.port.poll_event(Duration::from_millis(100));
        let bits = match event {
            Some(SerialEvent::DataAvailable) => EVENT_DATA_AVAILABLE,
            Some(SerialEvent::FifoOverflow) => EVENT_FIFO_OVERFLOW,
            Some(SerialEvent::BufferFull) => EVENT_BUFFER_FULL,
            Some(SerialEvent::Break) => EVENT_BREAK,
            Some(SerialEvent::RingIndicator) => EVENT_RING_INDICATOR,
            None => continue,
        };
        inner.events.set(bits);
    }
}

fn receive_loop(inner: Arc<UartInner>) {
    let mut rx_buffer: Vec<u8> = Vec::new();
    let mut chunk = [0u8; 512];
    let mut ri_lock_held = false;

    while inner.running.load(Ordering::Acquire) {
        let bits = inner.events.wait(
            EVENT_DATA_AVAILABLE
                | EVENT_FIFO_OVERFLOW
                | EVENT_BUFFER_FULL
                | EVENT_BREAK
                | EVENT_RING_INDICATOR
                | EVENT_SHUTDOWN,
            true,
            None,
        );
        if bits & EVENT_SHUTDOWN != 0 {
            break;
        }

        if bits & EVENT_DATA_AVAILABLE != 0 {
            loop {
                let read = inner.port.read(&mut chunk);
                if read == 0 {
                    break;
                }
                rx_buffer.extend_from_slice(&chunk[..read]);
            }
            parse_buffer(&inner, &mut rx_buffer);
        }
        if bits & EVENT_FIFO_OVERFLOW != 0 {
            error!("FIFO overflow");
            handle_urc(&inner, FIFO_OVERFLOW_URC, &[]);
        }
        if bits & EVENT_BREAK != 0 {
            error!("Break");
        }
        if bits & EVENT_BUFFER_FULL != 0 {
            error!("Buffer full");
        }

        if bits & EVENT_RING_INDICATOR != 0 {
            // Ring indicator went low: keep the host awake until the URC
            // burst behind it has been received.
            if !ri_lock_held {
                inner.power.acquire();
                ri_lock_held = true;
                debug!("RI low, power lock acquired");
            }
        } else if ri_lock_held {
            inner.power.release();
            ri_lock_held = false;
            debug!("Data available, RI power lock released");
        }
    }

    if ri_lock_held {
        inner.power.release();
    }
}

fn parse_buffer(inner: &UartInner, rx_buffer: &mut Vec<u8>) {
    loop {
        let waiting = inner.wait_for_response.load(Ordering::Acquire);
        match digest(rx_buffer, waiting) {
            Digested::Incomplete => break,
            Digested::Skipped => continue,
            Digested::Prompt | Digested::CommandDone => {
                inner.events.set(EVENT_COMMAND_DONE);
            }
            Digested::CommandError => {
                inner.events.set(EVENT_COMMAND_ERROR);
            }
            Digested::Urc { command, arguments } => {
                handle_urc(inner, &command, &arguments);
            }
            Digested::Response(line) => {
                if inner.debug.load(Ordering::Relaxed) {
                    info!("<< {}", line);
                }
                *inner.response.lock().unwrap() = line;
            }
        }
    }
}

fn handle_urc(inner: &UartInner, command: &str, arguments: &[ArgumentValue]) {
    if command == "CME ERROR" {
        let code = arguments.first().map(|a| a.int_value()).unwrap_or(0);
        inner.cme_error_code.store(code, Ordering::Release);
        inner.events.set(EVENT_COMMAND_ERROR);
        return;
    }

    trace!("[URC] {} ({} args)", command, arguments.len());
    // Snapshot under the lock, invoke without it: a callback may add or
    // remove subscriptions.
    let callbacks: Vec<Arc<UrcFn>> = {
        let registry = inner.urc_callbacks.lock().unwrap();
        registry.entries.iter().map(|(_, cb)| cb.clone()).collect()
    };
    for callback in callbacks {
        callback(command, arguments);
    }
}
