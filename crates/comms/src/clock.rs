// Copyright (C) 2025 Ryan Daum <ryan.daum@gmail.com> This program is free
// software: you can redistribute it and/or modify it under the terms of the GNU
// General Public License as published by the Free Software Foundation, version
// 3.
//
// This program is distributed in the hope that it will be useful, but WITHOUT
// ANY WARRANTY; without even the implied warranty of MERCHANTABILITY or FITNESS
// FOR A PARTICULAR PURPOSE. See the GNU General Public License for more details.
//
// You should have received a copy of the GNU General Public License along with
// this program. If not, see <https://www.gnu.org/licenses/>.
//

//! Injected wall-clock time. Every protocol deadline is an `i64` of UNIX seconds.

use chrono::{DateTime, Datelike, TimeZone, Timelike, Utc};
use std::sync::Arc;
use std::sync::atomic::{AtomicI64, Ordering};

pub type Timestamp = i64;

pub trait Clock: Send + Sync {
    fn now(&self) -> Timestamp;
}

pub type SharedClock = Arc<dyn Clock>;

#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Timestamp {
        Utc::now().timestamp()
    }
}

/// A clock that only moves when told to.
#[derive(Debug, Default)]
pub struct ManualClock {
    now: AtomicI64,
}

impl ManualClock {
    pub fn new(start: Timestamp) -> Self {
        Self {
            now: AtomicI64::new(start),
        }
    }

    pub fn set(&self, t: Timestamp) {
        self.now.store(t, Ordering::SeqCst);
    }

    pub fn advance(&self, secs: i64) -> Timestamp {
        self.now.fetch_add(secs, Ordering::SeqCst) + secs
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Timestamp {
        self.now.load(Ordering::SeqCst)
    }
}

pub(crate) fn utc(t: Timestamp) -> Option<DateTime<Utc>> {
    Utc.timestamp_opt(t, 0).single()
}

/// `hh:mm:ss dd/mm/yyyy`, or `never` for a zero time.
pub fn short_time(t: Timestamp) -> String {
    if t == 0 {
        return "never".to_string();
    }
    match utc(t) {
        Some(dt) => dt.format("%H:%M:%S %d/%m/%Y").to_string(),
        None => format!("{t}"),
    }
}

/// Calendar fields (year, month, day, hour, minute, second) in UTC.
pub fn calendar(t: Timestamp) -> (i32, u32, u32, u32, u32, u32) {
    match utc(t) {
        Some(dt) => (
            dt.year(),
            dt.month(),
            dt.day(),
            dt.hour(),
            dt.minute(),
            dt.second(),
        ),
        None => (1970, 1, 1, 0, 0, 0),
    }
}

pub fn from_calendar(
    year: i32,
    month: u32,
    day: u32,
    hour: u32,
    min: u32,
    sec: u32,
) -> Option<Timestamp> {
    Utc.with_ymd_and_hms(year, month, day, hour, min, sec)
        .single()
        .map(|dt| dt.timestamp())
}

/// Splits a Rapic `dddyy` julian date into (year, month, day).
/// Two digit years below 70 are taken to be 20yy.
pub fn julian_to_ymd(dddyy: i32) -> Option<(i32, u32, u32)> {
    let yy = dddyy % 100;
    let ddd = dddyy / 100;
    if ddd < 1 {
        return None;
    }
    let year = if yy < 70 { 2000 + yy } else { 1900 + yy };
    let date = chrono::NaiveDate::from_yo_opt(year, ddd as u32)?;
    Some((year, date.month(), date.day()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn manual_clock_advances() {
        let clock = ManualClock::new(1000);
        assert_eq!(clock.now(), 1000);
        assert_eq!(clock.advance(30), 1030);
        clock.set(5);
        assert_eq!(clock.now(), 5);
    }

    #[test]
    fn julian_dates() {
        assert_eq!(julian_to_ymd(3224), Some((2024, 2, 1)));
        assert_eq!(julian_to_ymd(36599), Some((1999, 12, 31)));
        assert_eq!(julian_to_ymd(24), None);
    }

    #[test]
    fn calendar_round_trip() {
        let t = from_calendar(2024, 3, 5, 6, 7, 8).unwrap();
        assert_eq!(calendar(t), (2024, 3, 5, 6, 7, 8));
        assert_eq!(short_time(t), "06:07:08 05/03/2024");
        assert_eq!(short_time(0), "never");
    }
}
