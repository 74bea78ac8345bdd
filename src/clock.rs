/// Monotonic tick source used to bound every polling loop.
///
/// A Cortex-M implementation typically reads the DWT cycle counter and
/// reports the core clock divided by 1000.
pub trait Clock {
    /// Current value of a free-running counter, allowed to wrap.
    fn now(&self) -> u32;

    /// Counter ticks per millisecond.
    fn ticks_per_ms(&self) -> u32;
}

/// Point in time after which a wait is abandoned.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Deadline {
    start: u32,
    ticks: u32,
}

impl Deadline {
    /// Starts counting `timeout_ms` from now.
    pub(crate) fn start<C: Clock>(clock: &C, timeout_ms: u32) -> Self {
        Deadline {
            start: clock.now(),
            ticks: timeout_ms.saturating_mul(clock.ticks_per_ms()),
        }
    }

    /// At least the budget has elapsed since the deadline was started.
    pub(crate) fn expired<C: Clock>(&self, clock: &C) -> bool {
        clock.now().wrapping_sub(self.start) > self.ticks
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use core::cell::Cell;

    struct ManualClock(Cell<u32>);

    impl Clock for ManualClock {
        fn now(&self) -> u32 {
            self.0.get()
        }

        fn ticks_per_ms(&self) -> u32 {
            72_000
        }
    }

    #[test]
    fn expires_after_budget() {
        let clock = ManualClock(Cell::new(5));
        let deadline = Deadline::start(&clock, 1000);

        clock.set(5 + 72_000_000);
        assert!(!deadline.expired(&clock));
        clock.set(5 + 72_000_001);
        assert!(deadline.expired(&clock));
    }

    #[test]
    fn survives_counter_wrap() {
        let clock = ManualClock(Cell::new(u32::MAX - 10));
        let deadline = Deadline::start(&clock, 1);

        clock.set(50);
        assert!(!deadline.expired(&clock));
        clock.set(80_000);
        assert!(deadline.expired(&clock));
    }

    impl ManualClock {
        fn set(&self, value: u32) {
            self.0.set(value);
        }
    }
}
