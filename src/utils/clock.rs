use std::marker::PhantomData;

use rustix::time::{ClockId, Timespec};

/// Monotonic clock
#[derive(Debug)]
pub struct Monotonic;

/// Id for a clock according to unix clockid_t
pub trait ClockSource {
    /// Gets the id of the clock source
    const ID: ClockId;
}

impl ClockSource for Monotonic {
    const ID: ClockId = ClockId::Monotonic;
}

/// Defines a clock with a specific kind
#[derive(Debug)]
pub struct Clock<Kind: ClockSource> {
    _kind: PhantomData<Kind>,
}

impl<Kind: ClockSource> Clock<Kind> {
    /// Initialize a new clock
    #[allow(clippy::new_without_default)]
    pub fn new() -> Self {
        Clock { _kind: PhantomData }
    }

    /// Returns the current time in milliseconds.
    ///
    /// Matches the timestamps carried on input events, i.e. truncated to
    /// 32 bits. The monotonic clock does not fit as milliseconds in 32 bits
    /// after ~50 days of uptime, so this wraps the same way frame timestamps
    /// do.
    pub fn now_ms(&self) -> u32 {
        let tp: Timespec = rustix::time::clock_gettime(Kind::ID);
        (tp.tv_sec as u64 * 1000 + tp.tv_nsec as u64 / 1_000_000) as u32
    }
}
