//! Fixed-size time windows used to bucket event counts.

use std::fmt;
use std::time::Duration;

use chrono::{DateTime, TimeZone, Utc};

/// A fixed-duration time bucket identified by its start instant.
///
/// The start is stored as nanoseconds since the UNIX epoch (UTC). Windows
/// are aligned to multiples of their size since the epoch, so every caller
/// evaluating the same instant with the same size lands in the same window.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Window {
    /// Window start, nanoseconds since the UNIX epoch
    start_nanos: i64,
}

impl Window {
    /// Get the window of `size` that contains `instant`.
    pub fn containing(instant: DateTime<Utc>, size: Duration) -> Self {
        let ts = timestamp_nanos(instant);
        let size = duration_nanos(size).max(1);
        Self {
            start_nanos: ts - ts.rem_euclid(size),
        }
    }

    /// Create a window starting exactly at `start`, without alignment.
    pub fn starting_at(start: DateTime<Utc>) -> Self {
        Self {
            start_nanos: timestamp_nanos(start),
        }
    }

    /// Get the window immediately preceding this one.
    pub fn previous(&self, size: Duration) -> Self {
        Self {
            start_nanos: self.start_nanos.saturating_sub(duration_nanos(size)),
        }
    }

    /// Get the time elapsed since this window started.
    ///
    /// Returns `Duration::ZERO` if `now` precedes the window start.
    pub fn elapsed_at(&self, now: DateTime<Utc>) -> Duration {
        let elapsed = timestamp_nanos(now).saturating_sub(self.start_nanos);
        Duration::from_nanos(u64::try_from(elapsed).unwrap_or(0))
    }

    /// Get the start of this window.
    pub fn start(&self) -> DateTime<Utc> {
        Utc.timestamp_nanos(self.start_nanos)
    }

    /// Get the start of this window as nanoseconds since the UNIX epoch.
    pub fn start_nanos(&self) -> i64 {
        self.start_nanos
    }
}

impl fmt::Display for Window {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.start().to_rfc3339())
    }
}

fn timestamp_nanos(instant: DateTime<Utc>) -> i64 {
    // Out of range only past the year 2262.
    instant.timestamp_nanos_opt().unwrap_or(i64::MAX)
}

pub(crate) fn duration_nanos(duration: Duration) -> i64 {
    i64::try_from(duration.as_nanos()).unwrap_or(i64::MAX)
}
