use std::fmt;

use nix::time::{ClockId, clock_gettime};

/// Nanoseconds since boot from the monotonic clock, the same clock read by
/// `bpf_ktime_get_ns`. Values are only comparable within one boot.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(transparent)]
pub struct Timestamp(u64);

impl Timestamp {
    pub fn now() -> Self {
        match clock_gettime(ClockId::CLOCK_MONOTONIC) {
            Ok(ts) => Self(ts.tv_sec() as u64 * 1_000_000_000 + ts.tv_nsec() as u64),
            Err(err) => {
                log::warn!("reading CLOCK_MONOTONIC failed: {err}");
                Self(0)
            }
        }
    }

    pub fn as_nanos(self) -> u64 {
        self.0
    }
}

impl From<u64> for Timestamp {
    fn from(ns: u64) -> Self {
        Self(ns)
    }
}

impl fmt::Display for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}
