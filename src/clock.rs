//! Server clock oracle
//!
//! Authoritative server time for "calculate, don't count" clients. Remaining
//! time is never maintained by a ticking timer anywhere in the engine; it is
//! always derived from timestamps read here. Successive reads are strictly
//! monotonic under normal operation so that observers can compute a stable
//! offset from `midpoint(client_t0, client_t1) - server_t`.

use std::sync::atomic::{AtomicI64, Ordering};

use chrono::{DateTime, TimeZone, Utc};
use serde::Serialize;

/// What a time read returns to callers
#[derive(Debug, Clone, Serialize)]
pub struct TimeReading {
    pub timestamp_ms: i64,
    pub server_version: &'static str,
    pub drift_tolerance_ms: i64,
}

/// Strictly monotonic millisecond clock over the system wall clock.
///
/// A backwards wall-clock step (NTP correction) is absorbed by returning
/// `last + 1` until real time catches up.
pub struct ServerClock {
    last_ms: AtomicI64,
    drift_tolerance_ms: i64,
}

impl ServerClock {
    pub fn new(drift_tolerance_ms: i64) -> Self {
        Self {
            last_ms: AtomicI64::new(0),
            drift_tolerance_ms,
        }
    }

    /// Current server time in epoch milliseconds, strictly increasing
    pub fn now_ms(&self) -> i64 {
        let wall = Utc::now().timestamp_millis();
        self.last_ms
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |last| {
                Some(wall.max(last + 1))
            })
            .map(|last| wall.max(last + 1))
            .unwrap_or(wall)
    }

    /// Current server time as a UTC timestamp
    pub fn now(&self) -> DateTime<Utc> {
        let ms = self.now_ms();
        Utc.timestamp_millis_opt(ms).single().unwrap_or_else(Utc::now)
    }

    /// The oracle read exposed on the request surface
    pub fn read(&self) -> TimeReading {
        TimeReading {
            timestamp_ms: self.now_ms(),
            server_version: env!("CARGO_PKG_VERSION"),
            drift_tolerance_ms: self.drift_tolerance_ms,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reads_strictly_increase() {
        let clock = ServerClock::new(50);
        let mut last = clock.now_ms();
        for _ in 0..1_000 {
            let next = clock.now_ms();
            assert!(next > last, "expected {next} > {last}");
            last = next;
        }
    }

    #[test]
    fn reading_carries_version_and_tolerance() {
        let clock = ServerClock::new(50);
        let reading = clock.read();
        assert_eq!(reading.drift_tolerance_ms, 50);
        assert_eq!(reading.server_version, env!("CARGO_PKG_VERSION"));
        assert!(reading.timestamp_ms > 0);
    }

    #[test]
    fn now_tracks_wall_clock() {
        let clock = ServerClock::new(50);
        let before = Utc::now().timestamp_millis();
        let read = clock.now_ms();
        let after = Utc::now().timestamp_millis();
        assert!(read >= before && read <= after + 2);
    }
}
