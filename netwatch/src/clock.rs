//! Converts kernel `bpf_ktime_get_ns` timestamps (CLOCK_MONOTONIC) to Unix
//! time.

use std::time::{Duration, Instant};

use tracing::warn;

use crate::error::Result;

/// NTP and manual clock changes move CLOCK_REALTIME but not
/// CLOCK_MONOTONIC, so the offset between them is re-read this often.
pub const REFRESH_INTERVAL: Duration = Duration::from_secs(30);

pub fn clock_gettime_ns(clock: libc::clockid_t) -> Result<i64> {
    let mut ts = libc::timespec {
        tv_sec: 0,
        tv_nsec: 0,
    };
    if unsafe { libc::clock_gettime(clock, &mut ts) } != 0 {
        return Err(std::io::Error::last_os_error().into());
    }
    Ok((ts.tv_sec as i64)
        .saturating_mul(1_000_000_000)
        .saturating_add(ts.tv_nsec as i64))
}

/// CLOCK_REALTIME minus CLOCK_MONOTONIC, in nanoseconds.
pub fn epoch_offset_ns() -> Result<i64> {
    let realtime = clock_gettime_ns(libc::CLOCK_REALTIME)?;
    let monotonic = clock_gettime_ns(libc::CLOCK_MONOTONIC)?;
    Ok(realtime - monotonic)
}

#[derive(Debug)]
pub struct WallClock {
    offset_ns: i64,
    last_refresh: Instant,
}

impl WallClock {
    pub fn new() -> Result<Self> {
        Ok(WallClock::fixed(epoch_offset_ns()?))
    }

    pub fn fixed(offset_ns: i64) -> Self {
        WallClock {
            offset_ns,
            last_refresh: Instant::now(),
        }
    }

    /// Unix time of a monotonic kernel timestamp.
    pub fn unix_ns(&mut self, ktime_ns: u64) -> u64 {
        if self.last_refresh.elapsed() >= REFRESH_INTERVAL {
            self.refresh_with(epoch_offset_ns);
        }
        ktime_ns.saturating_add_signed(self.offset_ns)
    }

    /// On failure the previous offset stays in use until the next interval.
    fn refresh_with(&mut self, read: impl FnOnce() -> Result<i64>) {
        match read() {
            Ok(offset_ns) => self.offset_ns = offset_ns,
            Err(e) => warn!("failed to refresh epoch offset, reusing previous value: {}", e),
        }
        self.last_refresh = Instant::now();
    }
}
