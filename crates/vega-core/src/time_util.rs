//! Wall-clock helpers: epoch timestamps, the exchange trading session and
//! fixed time-of-day schedules.
//!
//! Exchange-local times are expressed as a [`NaiveTime`] plus a fixed UTC
//! offset in minutes (`330` for IST). Durations and deadlines inside the
//! runtime use `tokio::time::Instant`; this module is only for calendar
//! questions.

use chrono::{
    DateTime, Datelike, FixedOffset, NaiveDate, NaiveTime, Offset, TimeZone, Utc, Weekday,
};
use serde::{Deserialize, Serialize};

/// Current time as **milliseconds** since Unix epoch.
#[inline]
pub fn now_ms() -> i64 {
    Utc::now().timestamp_millis()
}

/// Fixed offset for `minutes` east of UTC, clamped to a valid range.
pub fn offset(minutes: i32) -> FixedOffset {
    let secs = minutes.clamp(-23 * 60, 23 * 60) * 60;
    FixedOffset::east_opt(secs).unwrap_or_else(|| Utc.fix())
}

/// Next instant strictly after `now` at which the local clock reads `at`.
pub fn next_daily(now: DateTime<Utc>, at: NaiveTime, utc_offset_minutes: i32) -> DateTime<Utc> {
    let tz = offset(utc_offset_minutes);
    let local = now.with_timezone(&tz);
    let mut date = local.date_naive();
    loop {
        if let Some(candidate) = tz.from_local_datetime(&date.and_time(at)).single() {
            let candidate = candidate.with_timezone(&Utc);
            if candidate > now {
                return candidate;
            }
        }
        date = date.succ_opt().unwrap_or(date);
    }
}

/// UTC instant at which the exchange-local clock reads `at` on `date`.
pub fn local_instant(date: NaiveDate, at: NaiveTime, utc_offset_minutes: i32) -> DateTime<Utc> {
    let tz = offset(utc_offset_minutes);
    tz.from_local_datetime(&date.and_time(at))
        .single()
        .map(|d| d.with_timezone(&Utc))
        .unwrap_or_else(|| Utc.from_utc_datetime(&date.and_time(at)))
}

/// Year fraction between two instants on an ACT/365 basis. Negative when
/// `to` precedes `from`.
pub fn year_fraction(from: DateTime<Utc>, to: DateTime<Utc>) -> f64 {
    let secs = (to - from).num_milliseconds() as f64 / 1_000.0;
    secs / (365.0 * 24.0 * 3_600.0)
}

fn default_open() -> NaiveTime {
    NaiveTime::from_hms_opt(9, 15, 0).unwrap_or_default()
}

fn default_close() -> NaiveTime {
    NaiveTime::from_hms_opt(15, 30, 0).unwrap_or_default()
}

fn default_offset() -> i32 {
    330
}

fn default_true() -> bool {
    true
}

/// Regular trading session of the exchange.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MarketHours {
    /// Session open, exchange-local (`"09:15:00"`).
    #[serde(default = "default_open")]
    pub open: NaiveTime,
    /// Session close, exchange-local (`"15:30:00"`).
    #[serde(default = "default_close")]
    pub close: NaiveTime,
    #[serde(default = "default_offset")]
    pub utc_offset_minutes: i32,
    /// Treat Saturday and Sunday as closed.
    #[serde(default = "default_true")]
    pub weekdays_only: bool,
}

impl Default for MarketHours {
    fn default() -> Self {
        Self {
            open: default_open(),
            close: default_close(),
            utc_offset_minutes: default_offset(),
            weekdays_only: true,
        }
    }
}

impl MarketHours {
    /// Always-open session, used in tests and for 24h venues.
    pub fn always_open() -> Self {
        Self {
            open: NaiveTime::MIN,
            close: NaiveTime::from_hms_opt(23, 59, 59).unwrap_or_default(),
            utc_offset_minutes: 0,
            weekdays_only: false,
        }
    }

    pub fn is_open(&self, at: DateTime<Utc>) -> bool {
        let local = at.with_timezone(&offset(self.utc_offset_minutes));
        if self.weekdays_only && matches!(local.weekday(), Weekday::Sat | Weekday::Sun) {
            return false;
        }
        let t = local.time();
        t >= self.open && t <= self.close
    }

    /// Contract expiry instant: session close on the expiry date.
    pub fn expiry_instant(&self, expiry: NaiveDate) -> DateTime<Utc> {
        local_instant(expiry, self.close, self.utc_offset_minutes)
    }
}
