#[cfg(test)]
use std::cell::Cell;

use chrono::{Local, NaiveDate, NaiveDateTime};

/// Local wall-clock time, injectable so day rollover can be driven in tests.
pub trait Clock {
    fn now(&self) -> NaiveDateTime;

    fn today(&self) -> NaiveDate {
        self.now().date()
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> NaiveDateTime {
        Local::now().naive_local()
    }
}

/// A clock that only moves when told to.
#[cfg(test)]
#[derive(Debug, Clone)]
pub struct ManualClock {
    now: Cell<NaiveDateTime>,
}

#[cfg(test)]
impl ManualClock {
    pub fn new(now: NaiveDateTime) -> Self {
        Self {
            now: Cell::new(now),
        }
    }

    pub fn set(&self, now: NaiveDateTime) {
        self.now.set(now);
    }
}

#[cfg(test)]
impl Clock for ManualClock {
    fn now(&self) -> NaiveDateTime {
        self.now.get()
    }
}

#[cfg(test)]
mod tests {
    use chrono::NaiveDate;

    use super::{Clock, ManualClock};

    #[test]
    fn manual_clock_reports_date_of_current_instant() {
        let start = NaiveDate::from_ymd_opt(2026, 10, 19)
            .and_then(|date| date.and_hms_opt(23, 59, 59))
            .expect("valid timestamp");
        let clock = ManualClock::new(start);
        assert_eq!(clock.today(), start.date());

        let next = start + chrono::Duration::seconds(1);
        clock.set(next);
        assert_eq!(clock.today(), NaiveDate::from_ymd_opt(2026, 10, 20).expect("valid date"));
    }
}
