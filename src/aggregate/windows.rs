//! Leaderboard time windows.
//!
//! Window boundaries are computed on the UTC calendar, matching how hour
//! buckets are stored. `daily` runs from midnight up to the reference
//! instant; `weekly`/`monthly`/`yearly` cover their full calendar span, not
//! just the elapsed part.

use chrono::{DateTime, Datelike, Duration, NaiveDate, TimeZone, Utc};

/// A leaderboard time window.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TimeWindow {
    Daily,
    Weekly,
    Monthly,
    Yearly,
    Total,
}

impl TimeWindow {
    /// All windows, in reporting order.
    pub const ALL: [TimeWindow; 5] = [
        TimeWindow::Daily,
        TimeWindow::Weekly,
        TimeWindow::Monthly,
        TimeWindow::Yearly,
        TimeWindow::Total,
    ];

    /// Inclusive (start, end) bounds for the window around `now`.
    /// `Total` is unbounded and returns `None`.
    pub fn range(&self, now: DateTime<Utc>) -> Option<(DateTime<Utc>, DateTime<Utc>)> {
        let day = now.date_naive();
        match self {
            TimeWindow::Daily => Some((start_of(day), now)),
            TimeWindow::Weekly => {
                let monday = day - Duration::days(day.weekday().num_days_from_monday() as i64);
                let start = start_of(monday);
                Some((start, start + Duration::days(7) - Duration::microseconds(1)))
            }
            TimeWindow::Monthly => {
                let first = day.with_day(1)?;
                let next_month = if first.month() == 12 {
                    NaiveDate::from_ymd_opt(first.year() + 1, 1, 1)?
                } else {
                    NaiveDate::from_ymd_opt(first.year(), first.month() + 1, 1)?
                };
                Some((start_of(first), start_of(next_month) - Duration::microseconds(1)))
            }
            TimeWindow::Yearly => {
                let jan1 = NaiveDate::from_ymd_opt(day.year(), 1, 1)?;
                let next_jan1 = NaiveDate::from_ymd_opt(day.year() + 1, 1, 1)?;
                Some((start_of(jan1), start_of(next_jan1) - Duration::microseconds(1)))
            }
            TimeWindow::Total => None,
        }
    }
}

impl std::fmt::Display for TimeWindow {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TimeWindow::Daily => write!(f, "daily"),
            TimeWindow::Weekly => write!(f, "weekly"),
            TimeWindow::Monthly => write!(f, "monthly"),
            TimeWindow::Yearly => write!(f, "yearly"),
            TimeWindow::Total => write!(f, "total"),
        }
    }
}

fn start_of(day: NaiveDate) -> DateTime<Utc> {
    Utc.from_utc_datetime(&day.and_hms_opt(0, 0, 0).expect("midnight is valid"))
}
