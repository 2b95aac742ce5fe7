//! Seams to the host serial and GPIO drivers.
//!
//! The crate never touches hardware directly: integrations implement
//! [`SerialPort`] over the platform UART driver (8N1, no flow control) and
//! optionally provide a DTR output pin and a power-management hook.

use std::sync::Arc;
use std::time::Duration;

use crate::error::Error;

/// Driver events drained by the UART event thread.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum SerialEvent {
    /// Received bytes are waiting in the driver buffer.
    DataAvailable,
    /// The driver FIFO overflowed and data was lost.
    FifoOverflow,
    /// The driver ring buffer filled up.
    BufferFull,
    /// Break condition on the line.
    Break,
    /// The modem pulled the ring-indicator line low.
    RingIndicator,
}

pub trait SerialPort: Send + Sync {
    /// Non-blocking drain of buffered receive data. Returns the number of
    /// bytes written into `buf`; 0 when nothing is pending.
    fn read(&self, buf: &mut [u8]) -> usize;

    /// Write the whole buffer to the line.
    fn write(&self, data: &[u8]) -> Result<(), Error>;

    /// Reconfigure the line speed. Takes effect for subsequent traffic.
    fn set_baud_rate(&self, baud_rate: u32) -> Result<(), Error>;

    /// Block up to `timeout` for the next driver event.
    fn poll_event(&self, timeout: Duration) -> Option<SerialEvent>;
}

/// Object-safe view of an active-low DTR output.
///
/// Blanket-implemented for any `embedded_hal` output pin, so integrations
/// hand in their pin type directly.
pub trait DtrPin: Send {
    /// `high = false` asserts "modem awake".
    fn set_high(&mut self, high: bool);
}

impl<P> DtrPin for P
where
    P: embedded_hal::digital::OutputPin + Send,
{
    fn set_high(&mut self, high: bool) {
        if high {
            embedded_hal::digital::OutputPin::set_high(self).ok();
        } else {
            embedded_hal::digital::OutputPin::set_low(self).ok();
        }
    }
}

/// Power-management hook owned by the host.
///
/// Acquired while the modem must stay reachable (DTR asserted, or the ring
/// indicator is low and a URC burst is expected), released when the link
/// may sleep again.
pub trait PowerLock: Send + Sync {
    fn acquire(&self);
    fn release(&self);
}

/// A no-op lock for hosts without power management.
pub struct NoPowerLock;

impl PowerLock for NoPowerLock {
    fn acquire(&self) {}
    fn release(&self) {}
}

pub(crate) fn no_power_lock() -> Arc<dyn PowerLock> {
    Arc::new(NoPowerLock)
}
