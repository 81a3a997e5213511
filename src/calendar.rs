//! Weeks, business dates and working hours.
//!
//! Pure functions over an explicit `today`/`now`; nothing here reads the clock.
//! Weeks run Monday..Saturday; Sunday is closed and never offered.

use chrono::{Datelike, Duration, NaiveDate, NaiveDateTime, Timelike, Weekday};
use serde::{Deserialize, Serialize};

use crate::model::HourSpan;

/// Opening hours `[open, close)` on a 24h clock.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkingHours {
    pub open: u32,
    pub close: u32,
}

/// Weekday class → opening hours. Sunday has no entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HoursTable {
    pub mon_thu: WorkingHours,
    pub fri: WorkingHours,
    pub sat: WorkingHours,
}

impl Default for HoursTable {
    fn default() -> Self {
        Self {
            mon_thu: WorkingHours { open: 18, close: 23 },
            fri: WorkingHours { open: 17, close: 23 },
            sat: WorkingHours { open: 14, close: 19 },
        }
    }
}

impl HoursTable {
    /// `None` on a closed day.
    pub fn for_date(&self, date: NaiveDate) -> Option<WorkingHours> {
        match date.weekday() {
            Weekday::Mon | Weekday::Tue | Weekday::Wed | Weekday::Thu => Some(self.mon_thu),
            Weekday::Fri => Some(self.fri),
            Weekday::Sat => Some(self.sat),
            Weekday::Sun => None,
        }
    }
}

/// A bookable week, Monday..Saturday.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Week {
    pub offset: u32,
    pub start: NaiveDate,
    pub end: NaiveDate,
}

impl Week {
    pub fn contains(&self, date: NaiveDate) -> bool {
        self.start <= date && date <= self.end
    }
}

/// Monday and Saturday of the week `offset` weeks after the one containing `today`.
pub fn week_range(offset: u32, today: NaiveDate) -> (NaiveDate, NaiveDate) {
    let monday = today - Duration::days(i64::from(today.weekday().num_days_from_monday()));
    let start = monday + Duration::weeks(i64::from(offset));
    (start, start + Duration::days(5))
}

pub fn week(offset: u32, today: NaiveDate) -> Week {
    let (start, end) = week_range(offset, today);
    Week { offset, start, end }
}

/// The next `horizon_weeks` weeks starting with the current one, minus any
/// that already ended (on a Sunday the current week is over).
pub fn available_weeks(horizon_weeks: u32, today: NaiveDate) -> Vec<Week> {
    (0..horizon_weeks)
        .map(|offset| week(offset, today))
        .filter(|w| w.end >= today)
        .collect()
}

/// Monday..Saturday of the given week, without dates before `today`.
pub fn dates_in_week(offset: u32, today: NaiveDate) -> Vec<NaiveDate> {
    let (start, end) = week_range(offset, today);
    start
        .iter_days()
        .take_while(|d| *d <= end)
        .filter(|d| d.weekday() != Weekday::Sun && *d >= today)
        .collect()
}

/// Whole-hour start times still bookable on `date` as seen at `now`.
///
/// On the current day, past hours are dropped and the current hour survives
/// only when `now` is exactly on the hour.
pub fn legal_start_times(table: &HoursTable, date: NaiveDate, now: NaiveDateTime) -> Vec<u32> {
    let Some(hours) = table.for_date(date) else {
        return Vec::new();
    };
    let today = now.date();
    if date < today {
        return Vec::new();
    }
    (hours.open..hours.close)
        .filter(|&h| {
            if date > today {
                return true;
            }
            h > now.hour() || (h == now.hour() && now.minute() == 0)
        })
        .collect()
}

/// Durations in hours that keep the reservation inside closing time.
pub fn legal_durations(table: &HoursTable, date: NaiveDate, start: u32) -> Vec<u32> {
    match table.for_date(date) {
        Some(hours) if hours.open <= start && start < hours.close => (1..=hours.close - start).collect(),
        _ => Vec::new(),
    }
}

/// Whether `span` lies fully inside the opening hours of `date`.
pub fn within_hours(table: &HoursTable, date: NaiveDate, span: &HourSpan) -> bool {
    table
        .for_date(date)
        .is_some_and(|h| h.open <= span.start && span.end <= h.close && span.start < span.end)
}
