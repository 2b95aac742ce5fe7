//! Condvar-backed event bits.
//!
//! Endpoints block on "one of N bits, then clear" waits: the URC callback
//! sets a bit from the receive thread and the caller thread consumes it.
//! Consumed bits are cleared before the wait returns so the next wait
//! distinguishes fresh events.

use std::sync::{Condvar, Mutex};
use std::time::{Duration, Instant};

pub struct EventGroup {
    bits: Mutex<u32>,
    cond: Condvar,
}

impl EventGroup {
    pub const fn new() -> Self {
        Self {
            bits: Mutex::new(0),
            cond: Condvar::new(),
        }
    }

    pub fn set(&self, bits: u32) {
        let mut state = self.bits.lock().unwrap();
        *state |= bits;
        self.cond.notify_all();
    }

    pub fn clear(&self, bits: u32) {
        let mut state = self.bits.lock().unwrap();
        *state &= !bits;
    }

    pub fn peek(&self) -> u32 {
        *self.bits.lock().unwrap()
    }

    /// Block until any bit in `mask` is set, up to `timeout` (`None` waits
    /// forever). Returns the matched bits, or 0 on timeout. When
    /// `clear_on_exit` is set the matched bits are cleared before returning.
    pub fn wait(&self, mask: u32, clear_on_exit: bool, timeout: Option<Duration>) -> u32 {
        let deadline = timeout.map(|t| Instant::now() + t);
        let mut state = self.bits.lock().unwrap();
        loop {
            let hit = *state & mask;
            if hit != 0 {
                if clear_on_exit {
                    *state &= !hit;
                }
                return hit;
            }
            match deadline {
                None => state = self.cond.wait(state).unwrap(),
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        return 0;
                    }
                    let (guard, result) = self.cond.wait_timeout(state, deadline - now).unwrap();
                    state = guard;
                    if result.timed_out() {
                        let hit = *state & mask;
                        if hit != 0 && clear_on_exit {
                            *state &= !hit;
                        }
                        return hit;
                    }
                }
            }
        }
    }
}

impl Default for EventGroup {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    const BIT_A: u32 = 1 << 0;
    const BIT_B: u32 = 1 << 1;

    #[test]
    fn wait_returns_already_set_bits_and_clears_them() {
        let group = EventGroup::new();
        group.set(BIT_A | BIT_B);
        let hit = group.wait(BIT_A, true, Some(Duration::from_millis(10)));
        assert_eq!(hit, BIT_A);
        // BIT_A consumed, BIT_B untouched.
        assert_eq!(group.peek(), BIT_B);
    }

    #[test]
    fn wait_times_out_with_zero() {
        let group = EventGroup::new();
        let hit = group.wait(BIT_A, true, Some(Duration::from_millis(20)));
        assert_eq!(hit, 0);
    }

    #[test]
    fn wait_without_clear_keeps_bits() {
        let group = EventGroup::new();
        group.set(BIT_A);
        assert_eq!(group.wait(BIT_A, false, None), BIT_A);
        assert_eq!(group.wait(BIT_A, false, None), BIT_A);
    }

    #[test]
    fn cross_thread_wakeup() {
        let group = Arc::new(EventGroup::new());
        let setter = group.clone();
        let handle = thread::spawn(move || {
            thread::sleep(Duration::from_millis(20));
            setter.set(BIT_B);
        });
        let hit = group.wait(BIT_A | BIT_B, true, Some(Duration::from_secs(5)));
        assert_eq!(hit, BIT_B);
        handle.join().unwrap();
    }
}
