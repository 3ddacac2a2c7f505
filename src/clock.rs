use chrono::{DateTime, Utc};

/// Source of the current instant. The engine never calls `Utc::now()`
/// directly so tests can drive time by hand.
pub trait Clock {
    fn now(&self) -> DateTime<Utc>;
}

pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

#[cfg(test)]
pub mod test_support {
    use std::cell::Cell;

    use chrono::{DateTime, Duration, TimeZone, Utc};

    use super::Clock;

    /// A clock that only moves when told to.
    pub struct ManualClock {
        now: Cell<DateTime<Utc>>,
    }

    impl ManualClock {
        pub fn new(start: DateTime<Utc>) -> Self {
            ManualClock {
                now: Cell::new(start),
            }
        }

        pub fn at_epoch() -> Self {
            Self::new(Utc.with_ymd_and_hms(2025, 6, 1, 9, 0, 0).unwrap())
        }

        pub fn advance_secs(&self, secs: i64) {
            self.now.set(self.now.get() + Duration::seconds(secs));
        }

        pub fn advance_mins(&self, mins: i64) {
            self.advance_secs(mins * 60);
        }
    }

    impl Clock for ManualClock {
        fn now(&self) -> DateTime<Utc> {
            self.now.get()
        }
    }
}
