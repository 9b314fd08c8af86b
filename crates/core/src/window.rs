//! UTC day windows used by the aggregation jobs and the quota gate.
//!
//! All windows are half-open `[start, end)` and aligned to UTC midnight so
//! every instance agrees on boundaries.

use chrono::{DateTime, Days, NaiveDate, NaiveTime, Utc};
use serde::{Deserialize, Serialize};

/// A half-open range of UTC calendar days.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DayWindow {
    pub start: NaiveDate,
    pub end: NaiveDate,
}

impl DayWindow {
    pub fn new(start: NaiveDate, end: NaiveDate) -> Self {
        Self { start, end }
    }

    /// The one-day window containing `day`.
    pub fn single(day: NaiveDate) -> Self {
        Self {
            start: day,
            end: next_day(day),
        }
    }

    /// The `lookback` days strictly before the day containing `now`.
    ///
    /// `lookback` is clamped to at least one day.
    pub fn prior_days(now: &DateTime<Utc>, lookback: u32) -> Self {
        let today = now.date_naive();
        let start = today
            .checked_sub_days(Days::new(u64::from(lookback.max(1))))
            .unwrap_or(NaiveDate::MIN);
        Self { start, end: today }
    }

    pub fn contains(self, day: NaiveDate) -> bool {
        day >= self.start && day < self.end
    }

    pub fn is_empty(self) -> bool {
        self.start >= self.end
    }

    /// Midnight UTC at the start of the window.
    pub fn start_instant(self) -> DateTime<Utc> {
        midnight(self.start)
    }

    /// Midnight UTC at the (exclusive) end of the window.
    pub fn end_instant(self) -> DateTime<Utc> {
        midnight(self.end)
    }

    /// Each day in the window, in order.
    pub fn days(self) -> impl Iterator<Item = NaiveDate> {
        let end = self.end;
        self.start.iter_days().take_while(move |d| *d < end)
    }
}

impl std::fmt::Display for DayWindow {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{}, {})", self.start, self.end)
    }
}

/// Midnight UTC at the start of `day`.
pub fn midnight(day: NaiveDate) -> DateTime<Utc> {
    day.and_time(NaiveTime::MIN).and_utc()
}

/// The day after `day`, saturating at the calendar maximum.
pub fn next_day(day: NaiveDate) -> NaiveDate {
    day.succ_opt().unwrap_or(NaiveDate::MAX)
}

/// Seconds from `now` until the next UTC midnight. Never zero.
pub fn seconds_until_next_day(now: &DateTime<Utc>) -> u64 {
    let next = midnight(next_day(now.date_naive()));
    let secs = (next - *now).num_seconds().max(1);
    secs.unsigned_abs()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn day(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    #[test]
    fn single_day_window() {
        let w = DayWindow::single(day(2026, 5, 31));
        assert_eq!(w.end, day(2026, 6, 1));
        assert!(w.contains(day(2026, 5, 31)));
        assert!(!w.contains(day(2026, 6, 1)));
        assert_eq!(w.days().count(), 1);
    }

    #[test]
    fn prior_days_excludes_today() {
        let now = Utc.with_ymd_and_hms(2026, 3, 10, 1, 0, 0).unwrap();
        let w = DayWindow::prior_days(&now, 3);
        assert_eq!(w.start, day(2026, 3, 7));
        assert_eq!(w.end, day(2026, 3, 10));
        let days: Vec<_> = w.days().collect();
        assert_eq!(days, vec![day(2026, 3, 7), day(2026, 3, 8), day(2026, 3, 9)]);
    }

    #[test]
    fn prior_days_clamps_zero_lookback() {
        let now = Utc.with_ymd_and_hms(2026, 3, 10, 1, 0, 0).unwrap();
        let w = DayWindow::prior_days(&now, 0);
        assert_eq!(w, DayWindow::single(day(2026, 3, 9)));
    }

    #[test]
    fn instants_are_midnight_utc() {
        let w = DayWindow::single(day(2026, 1, 1));
        assert_eq!(w.start_instant(), Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap());
        assert_eq!(w.end_instant(), Utc.with_ymd_and_hms(2026, 1, 2, 0, 0, 0).unwrap());
    }

    #[test]
    fn seconds_until_midnight() {
        let now = Utc.with_ymd_and_hms(2026, 1, 1, 23, 59, 0).unwrap();
        assert_eq!(seconds_until_next_day(&now), 60);
        let start = Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap();
        assert_eq!(seconds_until_next_day(&start), 86_400);
    }

    #[test]
    fn empty_window() {
        assert!(DayWindow::new(day(2026, 1, 2), day(2026, 1, 2)).is_empty());
        assert!(!DayWindow::single(day(2026, 1, 2)).is_empty());
    }
}
