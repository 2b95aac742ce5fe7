//! Test doubles for driving the stack without modem hardware.
//!
//! [`ScriptedSerial`] stands in for the UART driver: a responder closure
//! maps each written command to the bytes the "modem" answers with, and
//! URC bursts can be injected at any time from the test thread.

use std::collections::VecDeque;
use std::sync::{Condvar, Mutex};
use std::time::{Duration, Instant};

use crate::error::Error;
use crate::serial::{SerialEvent, SerialPort};

/// Maps one written command to the modem's reply bytes. Called once per
/// `write`, with the current baud rate; an empty return means silence.
pub type Responder = Box<dyn FnMut(&[u8], u32) -> Vec<u8> + Send>;

struct ScriptedInner {
    rx: VecDeque<u8>,
    events: VecDeque<SerialEvent>,
    baud_rate: u32,
    writes: Vec<Vec<u8>>,
    responder: Option<Responder>,
}

pub struct ScriptedSerial {
    inner: Mutex<ScriptedInner>,
    event_cv: Condvar,
}

impl ScriptedSerial {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(ScriptedInner {
                rx: VecDeque::new(),
                events: VecDeque::new(),
                baud_rate: 115200,
                writes: Vec::new(),
                responder: None,
            }),
            event_cv: Condvar::new(),
        }
    }

    pub fn with_responder<F>(responder: F) -> Self
    where
        F: FnMut(&[u8], u32) -> Vec<u8> + Send + 'static,
    {
        let serial = Self::new();
        serial.inner.lock().unwrap().responder = Some(Box::new(responder));
        serial
    }

    /// Deliver unsolicited bytes, as the modem would between commands.
    pub fn inject(&self, data: &[u8]) {
        let mut inner = self.inner.lock().unwrap();
        inner.rx.extend(data);
        inner.events.push_back(SerialEvent::DataAvailable);
        self.event_cv.notify_all();
    }

    /// Raise a driver event (overflow, break, ring indicator).
    pub fn inject_event(&self, event: SerialEvent) {
        let mut inner = self.inner.lock().unwrap();
        inner.events.push_back(event);
        self.event_cv.notify_all();
    }

    /// Everything written to the line so far, one entry per `write` call.
    pub fn writes(&self) -> Vec<Vec<u8>> {
        self.inner.lock().unwrap().writes.clone()
    }

    /// The full write transcript as text.
    pub fn transcript(&self) -> String {
        let inner = self.inner.lock().unwrap();
        inner
            .writes
            .iter()
            .map(|w| String::from_utf8_lossy(w).into_owned())
            .collect()
    }

    pub fn baud_rate(&self) -> u32 {
        self.inner.lock().unwrap().baud_rate
    }
}

impl Default for ScriptedSerial {
    fn default() -> Self {
        Self::new()
    }
}

impl SerialPort for ScriptedSerial {
    fn read(&self, buf: &mut [u8]) -> usize {
        let mut inner = self.inner.lock().unwrap();
        let mut read = 0;
        while read < buf.len() {
            match inner.rx.pop_front() {
                Some(byte) => {
                    buf[read] = byte;
                    read += 1;
                }
                None => break,
            }
        }
        read
    }

    fn write(&self, data: &[u8]) -> Result<(), Error> {
        let mut inner = self.inner.lock().unwrap();
        inner.writes.push(data.to_vec());
        let baud_rate = inner.baud_rate;
        if let Some(mut responder) = inner.responder.take() {
            let reply = responder(data, baud_rate);
            inner.responder = Some(responder);
            if !reply.is_empty() {
                inner.rx.extend(&reply);
                inner.events.push_back(SerialEvent::DataAvailable);
                self.event_cv.notify_all();
            }
        }
        Ok(())
    }

    fn set_baud_rate(&self, baud_rate: u32) -> Result<(), Error> {
        self.inner.lock().unwrap().baud_rate = baud_rate;
        Ok(())
    }

    fn poll_event(&self, timeout: Duration) -> Option<SerialEvent> {
        let deadline = Instant::now() + timeout;
        let mut inner = self.inner.lock().unwrap();
        loop {
            if let Some(event) = inner.events.pop_front() {
                return Some(event);
            }
            let now = Instant::now();
            if now >= deadline {
                return None;
            }
            let (guard, _) = self.event_cv.wait_timeout(inner, deadline - now).unwrap();
            inner = guard;
        }
    }
}

/// Records DTR transitions for assertions. Implements the `embedded_hal`
/// pin trait, so it goes through the same adapter as a real GPIO.
pub struct RecordingDtrPin {
    pub states: std::sync::Arc<Mutex<Vec<bool>>>,
}

impl embedded_hal::digital::ErrorType for RecordingDtrPin {
    type Error = core::convert::Infallible;
}

impl embedded_hal::digital::OutputPin for RecordingDtrPin {
    fn set_low(&mut self) -> Result<(), Self::Error> {
        self.states.lock().unwrap().push(false);
        Ok(())
    }

    fn set_high(&mut self) -> Result<(), Self::Error> {
        self.states.lock().unwrap().push(true);
        Ok(())
    }
}

/// Counts acquire/release pairs.
#[derive(Default)]
pub struct CountingPowerLock {
    pub acquired: std::sync::atomic::AtomicI32,
}

impl crate::serial::PowerLock for CountingPowerLock {
    fn acquire(&self) {
        self.acquired
            .fetch_add(1, std::sync::atomic::Ordering::SeqCst);
    }

    fn release(&self) {
        self.acquired
            .fetch_sub(1, std::sync::atomic::Ordering::SeqCst);
    }
}
