//! Time source abstraction so validity checks, backoff and refill are testable.
use chrono::{DateTime, FixedOffset, Offset, Utc};
use std::sync::Mutex;

/// Costa Rica is UTC-6 all year.
const COSTA_RICA_WEST_SECS: i32 = 6 * 3600;

pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

/// The instant in Costa Rica local time, as used for document dates.
pub fn costa_rica_time(instant: DateTime<Utc>) -> DateTime<FixedOffset> {
    let offset = FixedOffset::west_opt(COSTA_RICA_WEST_SECS).unwrap_or_else(|| Utc.fix());
    instant.with_timezone(&offset)
}

/// Wall-clock time.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// A clock that only moves when told to.
#[derive(Debug)]
pub struct ManualClock {
    now: Mutex<DateTime<Utc>>,
}

impl ManualClock {
    pub fn new(now: DateTime<Utc>) -> Self {
        Self {
            now: Mutex::new(now),
        }
    }

    pub fn set(&self, now: DateTime<Utc>) {
        *self.now.lock().unwrap_or_else(|e| e.into_inner()) = now;
    }

    pub fn advance(&self, by: chrono::Duration) {
        let mut now = self.now.lock().unwrap_or_else(|e| e.into_inner());
        *now += by;
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn manual_clock_advances() {
        let start = Utc.with_ymd_and_hms(2025, 3, 1, 12, 0, 0).unwrap();
        let clock = ManualClock::new(start);
        clock.advance(chrono::Duration::minutes(5));
        assert_eq!(clock.now(), start + chrono::Duration::minutes(5));
        clock.set(start);
        assert_eq!(clock.now(), start);
    }

    #[test]
    fn costa_rica_time_is_six_hours_behind() {
        let instant = Utc.with_ymd_and_hms(2025, 1, 1, 3, 0, 0).unwrap();
        assert_eq!(
            costa_rica_time(instant).to_rfc3339(),
            "2024-12-31T21:00:00-06:00"
        );
    }
}
