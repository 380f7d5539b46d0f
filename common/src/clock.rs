use std::{
    sync::OnceLock,
    thread,
    time::{Duration, Instant},
};

/// Time source for the control loop. Every suspension point in the firmware
/// goes through `sleep_ms`, which lets tests run retry storms instantly.
pub trait Clock {
    fn now_ms(&self) -> u64;

    fn now_us(&self) -> u64;

    fn sleep_ms(&mut self, ms: u64);
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_ms(&self) -> u64 {
        monotonic_ms()
    }

    fn now_us(&self) -> u64 {
        start_instant()
            .elapsed()
            .as_micros()
            .try_into()
            .unwrap_or(u64::MAX)
    }

    fn sleep_ms(&mut self, ms: u64) {
        thread::sleep(Duration::from_millis(ms));
    }
}

pub fn monotonic_ms() -> u64 {
    start_instant()
        .elapsed()
        .as_millis()
        .try_into()
        .unwrap_or(u64::MAX)
}

fn start_instant() -> &'static Instant {
    static START: OnceLock<Instant> = OnceLock::new();
    START.get_or_init(Instant::now)
}

/// Fixed-interval trigger measured from the previous firing, not from a
/// fixed phase, so a late pass pushes every later pass back as well.
#[derive(Debug, Clone)]
pub struct PassTimer {
    interval_ms: u64,
    last_ms: u64,
}

impl PassTimer {
    pub fn new(interval_ms: u64) -> Self {
        Self {
            interval_ms,
            last_ms: 0,
        }
    }

    pub fn interval_ms(&self) -> u64 {
        self.interval_ms
    }

    pub fn due(&mut self, now_ms: u64) -> bool {
        if now_ms.saturating_sub(self.last_ms) > self.interval_ms {
            self.last_ms = now_ms;
            true
        } else {
            false
        }
    }
}
