//! Replay timing
//!
//! Captures every clock domain the result summary reports in one call so
//! start and end snapshots are directly comparable.

use serde::Serialize;

/// Clock domain read through `clock_gettime`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClockDomain {
    Monotonic,
    MonotonicRaw,
    Boot,
    ProcessCpu,
}

impl ClockDomain {
    fn clock_id(self) -> libc::clockid_t {
        match self {
            ClockDomain::Monotonic => libc::CLOCK_MONOTONIC,
            #[cfg(target_os = "linux")]
            ClockDomain::MonotonicRaw => libc::CLOCK_MONOTONIC_RAW,
            #[cfg(target_os = "linux")]
            ClockDomain::Boot => libc::CLOCK_BOOTTIME,
            #[cfg(not(target_os = "linux"))]
            ClockDomain::MonotonicRaw | ClockDomain::Boot => libc::CLOCK_MONOTONIC,
            ClockDomain::ProcessCpu => libc::CLOCK_PROCESS_CPUTIME_ID,
        }
    }

    /// Current reading in nanoseconds, 0 if the clock is unavailable
    pub fn now_ns(self) -> u64 {
        let mut ts = libc::timespec {
            tv_sec: 0,
            tv_nsec: 0,
        };
        // SAFETY: `ts` is a valid, writable timespec.
        let rc = unsafe { libc::clock_gettime(self.clock_id(), &mut ts) };
        if rc != 0 {
            return 0;
        }
        (ts.tv_sec as u64) * 1_000_000_000 + ts.tv_nsec as u64
    }
}

/// All clock readings taken at one instant
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct ClockSnapshot {
    /// Monotonic time in nanoseconds, used for fps
    pub time_ns: u64,
    pub monotonic_ns: u64,
    pub monotonic_raw_ns: u64,
    pub boot_ns: u64,
    pub process_ns: u64,
    /// Wall clock, seconds since the Unix epoch
    pub timestamp: i64,
}

impl ClockSnapshot {
    pub fn capture() -> Self {
        let monotonic_ns = ClockDomain::Monotonic.now_ns();
        Self {
            time_ns: monotonic_ns,
            monotonic_ns,
            monotonic_raw_ns: ClockDomain::MonotonicRaw.now_ns(),
            boot_ns: ClockDomain::Boot.now_ns(),
            process_ns: ClockDomain::ProcessCpu.now_ns(),
            timestamp: chrono::Utc::now().timestamp(),
        }
    }
}

/// Nanoseconds to seconds
pub fn ns_to_secs(ns: u64) -> f64 {
    ns as f64 / 1_000_000_000.0
}
