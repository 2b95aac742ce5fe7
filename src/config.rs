use std::sync::Arc;

use crate::serial::{DtrPin, PowerLock};

/// Construction options for [`crate::AtUart`].
pub struct UartConfig {
    pub(crate) dtr: Option<Box<dyn DtrPin>>,
    pub(crate) power_lock: Option<Arc<dyn PowerLock>>,
    pub(crate) debug: bool,
}

impl UartConfig {
    pub fn new() -> Self {
        Self {
            dtr: None,
            power_lock: None,
            debug: false,
        }
    }

    /// Attach the active-low DTR output. Optional; without it sleep/wake
    /// control degrades to AT commands only.
    pub fn dtr_pin<P: DtrPin + 'static>(mut self, pin: P) -> Self {
        self.dtr = Some(Box::new(pin));
        self
    }

    /// Hook host power management. Held while the modem must stay awake.
    pub fn power_lock(mut self, lock: Arc<dyn PowerLock>) -> Self {
        self.power_lock = Some(lock);
        self
    }

    /// Log every line in both directions at info level.
    pub fn debug(mut self, enable: bool) -> Self {
        self.debug = enable;
        self
    }
}

impl Default for UartConfig {
    fn default() -> Self {
        Self::new()
    }
}
