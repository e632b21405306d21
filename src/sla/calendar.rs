//! Business calendar
//!
//! Deadlines for `business_hours_only` policies only count time inside the
//! daily opening window on working days. A `cutoff_at` moves the start of the
//! clock to the next opening when an instance arrives late in the day.

use chrono::{
    DateTime, Datelike, Duration as ChronoDuration, FixedOffset, NaiveDate, NaiveDateTime, NaiveTime, Offset, Utc,
    Weekday,
};
use std::time::Duration;

use crate::config::BusinessHoursConfig;

#[derive(Debug, Clone)]
pub struct BusinessCalendar {
    offset: FixedOffset,
    open_hour: u32,
    close_hour: u32,
    working_days: Vec<Weekday>,
}

impl Default for BusinessCalendar {
    fn default() -> Self {
        Self::from_config(&BusinessHoursConfig::default())
    }
}

impl BusinessCalendar {
    pub fn from_config(config: &BusinessHoursConfig) -> Self {
        let offset = FixedOffset::east_opt(config.utc_offset_minutes * 60)
            .unwrap_or_else(|| Utc.fix());
        let close_hour = config.close_hour.clamp(1, 24);
        let open_hour = config.open_hour.min(close_hour - 1);
        Self {
            offset,
            open_hour,
            close_hour,
            working_days: config.weekdays(),
        }
    }

    /// When the SLA clock starts for something entering at `entered_at`.
    pub fn clock_start(&self, entered_at: DateTime<Utc>, cutoff_at: Option<NaiveTime>) -> DateTime<Utc> {
        match cutoff_at {
            Some(cutoff) if self.local(entered_at).time() >= cutoff => {
                self.next_opening_after_day(self.local(entered_at).date())
            }
            _ => entered_at,
        }
    }

    /// Deadline for a duration measured from `entered_at`.
    pub fn deadline(
        &self,
        entered_at: DateTime<Utc>,
        after: Duration,
        business_hours_only: bool,
        cutoff_at: Option<NaiveTime>,
    ) -> DateTime<Utc> {
        let start = self.clock_start(entered_at, cutoff_at);
        if business_hours_only {
            self.add_business_time(start, after)
        } else {
            add_wall_time(start, after)
        }
    }

    /// Add `duration` of open time to `start`.
    pub fn add_business_time(&self, start: DateTime<Utc>, duration: Duration) -> DateTime<Utc> {
        if self.working_days.is_empty() {
            return add_wall_time(start, duration);
        }

        let mut cursor = self.local(start);
        let mut remaining = to_chrono(duration);
        loop {
            let day = cursor.date();
            let (open, close) = self.window(day);
            if !self.is_working_day(day) || cursor >= close {
                cursor = self.local(self.next_opening_after_day(day));
                continue;
            }
            if cursor < open {
                cursor = open;
            }
            let available = close - cursor;
            if remaining <= available {
                return self.to_utc(cursor + remaining);
            }
            remaining -= available;
            cursor = close;
        }
    }

    fn is_working_day(&self, day: NaiveDate) -> bool {
        self.working_days.contains(&day.weekday())
    }

    fn window(&self, day: NaiveDate) -> (NaiveDateTime, NaiveDateTime) {
        let midnight = day.and_time(NaiveTime::MIN);
        (
            midnight + ChronoDuration::hours(i64::from(self.open_hour)),
            midnight + ChronoDuration::hours(i64::from(self.close_hour)),
        )
    }

    /// Opening time of the first working day after `day`.
    fn next_opening_after_day(&self, day: NaiveDate) -> DateTime<Utc> {
        let mut next = day;
        for _ in 0..8 {
            next = next.succ_opt().unwrap_or(next);
            if self.working_days.is_empty() || self.is_working_day(next) {
                break;
            }
        }
        self.to_utc(self.window(next).0)
    }

    fn local(&self, at: DateTime<Utc>) -> NaiveDateTime {
        at.with_timezone(&self.offset).naive_local()
    }

    fn to_utc(&self, local: NaiveDateTime) -> DateTime<Utc> {
        (local - self.offset_duration()).and_utc()
    }

    fn offset_duration(&self) -> ChronoDuration {
        ChronoDuration::seconds(i64::from(self.offset.local_minus_utc()))
    }
}

fn to_chrono(duration: Duration) -> ChronoDuration {
    ChronoDuration::from_std(duration).unwrap_or(ChronoDuration::MAX)
}

fn add_wall_time(start: DateTime<Utc>, duration: Duration) -> DateTime<Utc> {
    start
        .checked_add_signed(to_chrono(duration))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}
