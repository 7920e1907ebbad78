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

//! Recurring request generation.

use crate::clock::{Timestamp, short_time};
use crate::error::{CommsError, ParseError};
use crate::request::CommRequest;
use crate::types::RpScanType;
use itertools::Itertools;
use tracing::{info, warn};

pub type SchedId = u64;

const SECS_PER_DAY: i64 = 86_400;

#[derive(Debug, Clone, PartialEq)]
pub struct ScheduleEntry {
    pub id: SchedId,
    pub template: CommRequest,
    pub min_period: i64,
    pub period: i64,
    pub fallback_period: i64,
    pub offset: i64,
    /// Daily firing window, seconds after midnight UTC. Equal values mean all day.
    pub start: i64,
    pub stop: i64,
    /// Only fire if no matching scan has arrived for this long.
    pub backup: i64,
    pub backup_until: Timestamp,
    pub group_id: i32,
    pub disabled: bool,
    /// Per-entry fallback, set by the network fallback watcher.
    pub fallback: bool,
    pub sched_time: Timestamp,
}

fn minutes(field: &'static str, s: &str) -> Result<i64, ParseError> {
    s.parse::<i64>()
        .map(|m| m * 60)
        .map_err(|_| ParseError::invalid(field, s))
}

impl ScheduleEntry {
    /// `<stn> <minperiod> <period[/fb]> <offset> <type> [<start> <stop>] [backup=m] [groupid=n]`
    /// with every duration in minutes.
    pub fn parse(args: &str) -> Result<Self, ParseError> {
        let mut backup = 0;
        let mut group_id = 0;
        let mut tokens = vec![];
        for t in args.split_whitespace() {
            if let Some(v) = t.strip_prefix("backup=") {
                backup = minutes("backup", v)?;
            } else if let Some(v) = t.strip_prefix("groupid=") {
                group_id = v.parse().map_err(|_| ParseError::invalid("groupid", v))?;
            } else {
                tokens.push(t);
            }
        }
        if tokens.len() < 5 {
            return Err(ParseError::TooFewFields {
                directive: "schedule",
                expected: 5,
                got: tokens.len(),
            });
        }
        let station: i32 = tokens[0]
            .parse()
            .map_err(|_| ParseError::invalid("station", tokens[0]))?;
        let min_period = minutes("minperiod", tokens[1])?;
        let (period, fallback_period) = match tokens[2].split_once('/') {
            Some((p, fb)) => (minutes("period", p)?, minutes("fallback period", fb)?),
            None => {
                let p = minutes("period", tokens[2])?;
                (p, p)
            }
        };
        let offset = minutes("offset", tokens[3])?;
        let template = CommRequest::new(station, RpScanType::parse(tokens[4]));
        let (start, stop) = match (tokens.get(5), tokens.get(6)) {
            (Some(a), Some(b)) => (minutes("start", a)?, minutes("stop", b)?),
            _ => (0, 0),
        };
        Ok(Self {
            id: 0,
            template,
            min_period,
            period,
            fallback_period,
            offset,
            start,
            stop,
            backup,
            backup_until: 0,
            group_id,
            disabled: false,
            fallback: false,
            sched_time: 0,
        })
    }

    pub fn station(&self) -> i32 {
        self.template.station
    }

    pub fn has_distinct_fallback(&self) -> bool {
        self.fallback_period != self.period
    }

    fn period_token(&self) -> String {
        if self.has_distinct_fallback() {
            format!("{}/{}", self.period / 60, self.fallback_period / 60)
        } else {
            format!("{}", self.period / 60)
        }
    }

    /// The config line this entry was (or could have been) loaded from.
    pub fn encode(&self) -> String {
        let mut out = format!(
            "schedule={}\t{}\t{}\t{}\t{}",
            self.template.station,
            self.min_period / 60,
            self.period_token(),
            self.offset / 60,
            self.template.scan_type.token()
        );
        if self.start != self.stop {
            out.push_str(&format!("\t{}\t{}", self.start / 60, self.stop / 60));
        }
        if self.backup > 0 {
            out.push_str(&format!(" backup={}", self.backup / 60));
        }
        if self.group_id > 0 {
            out.push_str(&format!(" groupid={}", self.group_id));
        }
        out.push('\n');
        out
    }

    pub fn describe(&self) -> String {
        let mut out = format!(
            "{} {} {}min (+{})",
            self.template.station,
            self.template.scan_type.readable(),
            self.period_token(),
            self.offset / 60
        );
        if self.fallback {
            out.push_str(" Fallback");
        }
        out
    }

    /// Time of the next firing after `now`, or 0 if the entry should not fire.
    pub fn next_fire_time(&self, now: Timestamp, global_fallback: bool) -> Timestamp {
        if self.disabled || (self.backup > 0 && now < self.backup_until) {
            return 0;
        }
        let period = if global_fallback || self.fallback {
            self.fallback_period
        } else {
            self.period
        };
        if period <= 0 {
            return 0;
        }
        let local = now - self.offset;
        let mut next = local - local.rem_euclid(period) + period + self.offset;
        if self.start != self.stop {
            for _ in 0..=(SECS_PER_DAY / period) {
                if self.in_window(next) {
                    break;
                }
                next += period;
            }
        }
        next
    }

    fn in_window(&self, t: Timestamp) -> bool {
        let tod = t.rem_euclid(SECS_PER_DAY);
        if self.start < self.stop {
            tod >= self.start && tod < self.stop
        } else {
            tod >= self.start || tod < self.stop
        }
    }

    /// Same station, scan type and angle.
    pub fn same_target(&self, other: &ScheduleEntry) -> bool {
        self.template.station == other.template.station
            && self.template.scan_type == other.template.scan_type
            && self.template.angle == other.template.angle
    }

    /// A fresh request from the template.
    pub fn spawn(&self) -> CommRequest {
        let mut req = self.template.clone();
        req.id = 0;
        req.candidates.clear();
        req.current = None;
        req.rx_device = None;
        req
    }
}

/// Splits a description produced by [`ScheduleEntry::describe`] into
/// (station, scan type, period, offset).
pub fn decode_description(desc: &str) -> Option<(i32, RpScanType, i64, i64)> {
    let desc = desc.trim().trim_end_matches(" Fallback");
    let (stn, rest) = desc.split_once(' ')?;
    let station = stn.parse().ok()?;
    let (head, offset) = rest.rsplit_once(" (+")?;
    let offset = offset.trim_end_matches(')').parse::<i64>().ok()? * 60;
    let (type_name, period) = head.rsplit_once(' ')?;
    let period = period.strip_suffix("min")?;
    let period = period.split('/').next()?.parse::<i64>().ok()? * 60;
    Some((station, RpScanType::parse(type_name), period, offset))
}

#[derive(Debug, Default)]
pub struct ScheduleList {
    entries: Vec<ScheduleEntry>,
    next_id: SchedId,
}

impl ScheduleList {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds an entry at the head so it fires on the next sweep. An entry for the same
    /// target is replaced.
    pub fn add(
        &mut self,
        mut entry: ScheduleEntry,
        now: Timestamp,
        serviceable: bool,
    ) -> Result<SchedId, CommsError> {
        if entry.station() == 0 {
            return Err(ParseError::invalid("station", "0").into());
        }
        if let Some(pos) = self.entries.iter().position(|e| e.same_target(&entry)) {
            let old = self.entries.remove(pos);
            warn!("schedule OVERWRITING DUPLICATE: {}", old.describe());
        }
        if !serviceable {
            warn!(
                station = entry.station(),
                "schedule rejected, no viable connection: {}",
                entry.describe()
            );
            return Err(CommsError::NoViableConnection {
                station: entry.station(),
            });
        }
        self.next_id += 1;
        entry.id = self.next_id;
        entry.sched_time = now;
        info!("schedule added: {}", entry.describe());
        let id = entry.id;
        self.entries.insert(0, entry);
        Ok(id)
    }

    /// Requests for every entry now due. Idle entries get their next time computed.
    pub fn check(&mut self, now: Timestamp, global_fallback: bool) -> Vec<CommRequest> {
        let mut fired = vec![];
        for entry in self.entries.iter_mut() {
            if entry.sched_time == 0 {
                entry.sched_time = entry.next_fire_time(now, global_fallback);
                continue;
            }
            if entry.sched_time <= now {
                if !entry.disabled && !(entry.backup > 0 && now < entry.backup_until) {
                    fired.push(entry.spawn());
                }
                entry.sched_time = entry.next_fire_time(now, global_fallback);
            }
        }
        fired
    }

    /// Re-arms backup entries for `station` after a scan arrives.
    pub fn note_scan(&mut self, station: i32, now: Timestamp) {
        for e in self
            .entries
            .iter_mut()
            .filter(|e| e.backup > 0 && e.station() == station)
        {
            e.backup_until = now + e.backup;
        }
    }

    /// Enables or disables entries in `group_id` (-1 for every grouped entry).
    pub fn set_group_enable(&mut self, group_id: i32, enabled: bool) -> usize {
        let mut n = 0;
        for e in self
            .entries
            .iter_mut()
            .filter(|e| e.group_id != 0 && (group_id == -1 || e.group_id == group_id))
        {
            e.disabled = !enabled;
            if !enabled {
                e.sched_time = 0;
            }
            n += 1;
        }
        n
    }

    /// Marks per-station fallback on entries for `station`.
    pub fn set_station_fallback(&mut self, station: i32, fallback: bool) -> bool {
        let mut changed = false;
        for e in self.entries.iter_mut().filter(|e| e.station() == station) {
            if e.fallback != fallback {
                e.fallback = fallback;
                e.sched_time = 0;
                changed = true;
            }
        }
        changed
    }

    pub fn any_distinct_fallback(&self) -> bool {
        self.entries.iter().any(ScheduleEntry::has_distinct_fallback)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &ScheduleEntry> {
        self.entries.iter()
    }

    pub fn get(&self, index: usize) -> Option<&ScheduleEntry> {
        self.entries.get(index)
    }

    pub fn find_by_description(&self, desc: &str) -> Option<usize> {
        let (stn, scan_type, period, offset) = decode_description(desc)?;
        self.entries.iter().position(|e| {
            e.station() == stn
                && e.template.scan_type == scan_type
                && e.period == period
                && e.offset == offset
        })
    }

    pub fn delete(&mut self, index: usize) -> Result<ScheduleEntry, CommsError> {
        if index >= self.entries.len() {
            return Err(CommsError::NoSuchSchedule(format!("index {index}")));
        }
        let e = self.entries.remove(index);
        info!("schedule deleted: {}", e.describe());
        Ok(e)
    }

    pub fn delete_by_description(&mut self, desc: &str) -> Result<ScheduleEntry, CommsError> {
        let index = self
            .find_by_description(desc)
            .ok_or_else(|| CommsError::NoSuchSchedule(desc.to_string()))?;
        self.delete(index)
    }

    pub fn remove_id(&mut self, id: SchedId) -> Option<ScheduleEntry> {
        let pos = self.entries.iter().position(|e| e.id == id)?;
        Some(self.entries.remove(pos))
    }

    /// Changes period and offset (seconds). The entry fires again on the next sweep.
    pub fn modify(
        &mut self,
        index: usize,
        period: i64,
        offset: i64,
        now: Timestamp,
    ) -> Result<(), CommsError> {
        let e = self
            .entries
            .get_mut(index)
            .ok_or_else(|| CommsError::NoSuchSchedule(format!("index {index}")))?;
        if !e.has_distinct_fallback() {
            e.fallback_period = period;
        }
        e.period = period;
        e.offset = offset;
        e.sched_time = now;
        info!("schedule modified: {}", e.describe());
        Ok(())
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    pub fn encode_all(&self) -> String {
        self.entries.iter().map(ScheduleEntry::encode).collect()
    }

    pub fn dump(&self) -> String {
        self.entries
            .iter()
            .enumerate()
            .map(|(i, e)| {
                format!(
                    "{i:3} {} next={}{}{}",
                    e.describe(),
                    short_time(e.sched_time),
                    if e.disabled { " DISABLED" } else { "" },
                    if e.group_id > 0 {
                        format!(" group={}", e.group_id)
                    } else {
                        String::new()
                    }
                )
            })
            .join("\n")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use test_case::test_case;

    fn entry(args: &str) -> ScheduleEntry {
        ScheduleEntry::parse(args).unwrap()
    }

    #[test]
    fn parse_scenario_line() {
        let e = entry("003 10 10 0 DFLT_PPI1");
        assert_eq!(e.station(), 3);
        assert_eq!(e.period, 600);
        assert_eq!(e.fallback_period, 600);
        assert_eq!(e.template.scan_type, RpScanType::DfltPpi1);
        assert_eq!(e.encode(), "schedule=3\t10\t10\t0\tComp1\n");
        assert_eq!(e.describe(), "3 BaseScan 10min (+0)");
    }

    #[test]
    fn parse_options() {
        let e = entry("2 5 10/30 2 VOL 60 120 backup=15 groupid=4");
        assert_eq!(e.fallback_period, 1800);
        assert_eq!(e.offset, 120);
        assert_eq!((e.start, e.stop), (3600, 7200));
        assert_eq!(e.backup, 900);
        assert_eq!(e.group_id, 4);
        assert_eq!(
            e.encode(),
            "schedule=2\t5\t10/30\t2\tVOL\t60\t120 backup=15 groupid=4\n"
        );
        assert_eq!(e.describe(), "2 Volumetric 10/30min (+2)");
        assert!(ScheduleEntry::parse("2 5 10 2").is_err());
        assert!(ScheduleEntry::parse("2 x 10 2 VOL").is_err());
    }

    #[test_case(0; "at epoch")]
    #[test_case(1_700_000_123; "arbitrary")]
    #[test_case(1_700_000_400; "on boundary")]
    fn fire_times_are_aligned_and_monotonic(start: i64) {
        let e = entry("3 10 10 2 Comp1");
        let mut last = 0;
        for step in 0..50 {
            let now = start + step * 37;
            let t = e.next_fire_time(now, false);
            assert!(t > now);
            assert!(t >= last);
            assert_eq!((t - 120).rem_euclid(600), 0);
            last = t;
        }
    }

    #[test]
    fn fallback_period_used() {
        let mut e = entry("3 10 10/2 0 Comp1");
        assert_eq!(e.next_fire_time(1000, false), 1200);
        assert_eq!(e.next_fire_time(1000, true), 1080);
        e.fallback = true;
        assert_eq!(e.next_fire_time(1000, false), 1080);
        e.disabled = true;
        assert_eq!(e.next_fire_time(1000, false), 0);
    }

    #[test]
    fn window_skips_to_start() {
        // 01:00 to 02:00 UTC
        let e = entry("3 10 10 0 Comp1 60 120");
        let t = e.next_fire_time(0, false);
        assert_eq!(t, 3600);
    }

    #[test]
    fn backup_entries_wait_for_silence() {
        let mut list = ScheduleList::new();
        list.add(entry("3 10 10 0 Comp1 backup=5"), 0, true).unwrap();
        list.note_scan(3, 0);
        assert!(list.check(0, false).is_empty());
        // still inside the backup window, nothing scheduled
        assert!(list.check(200, false).is_empty());
        assert_eq!(list.get(0).unwrap().sched_time, 0);
        list.check(300, false);
        assert_eq!(list.get(0).unwrap().sched_time, 600);
        assert_eq!(list.check(600, false).len(), 1);
    }

    #[test]
    fn add_fires_first_sweep_and_replaces_duplicates() {
        let mut list = ScheduleList::new();
        list.add(entry("3 10 10 0 Comp1"), 100, true).unwrap();
        list.add(entry("4 10 10 0 Comp1"), 100, true).unwrap();
        list.add(entry("3 10 5 0 Comp1"), 100, true).unwrap();
        assert_eq!(list.len(), 2);
        assert_eq!(list.get(0).unwrap().period, 300);
        let fired = list.check(100, false);
        assert_eq!(fired.len(), 2);
        assert_eq!(fired[0].station, 3);
        assert_eq!(list.get(0).unwrap().sched_time, 300);
        assert!(list.check(299, false).is_empty());
        assert_eq!(list.check(300, false).len(), 1);
    }

    #[test]
    fn unserviceable_and_zero_station_rejected() {
        let mut list = ScheduleList::new();
        assert!(matches!(
            list.add(entry("3 10 10 0 Comp1"), 0, false),
            Err(CommsError::NoViableConnection { station: 3 })
        ));
        assert!(list.add(entry("0 10 10 0 Comp1"), 0, true).is_err());
        assert!(list.is_empty());
    }

    #[test]
    fn group_enable() {
        let mut list = ScheduleList::new();
        list.add(entry("3 10 10 0 Comp1 groupid=2"), 10, true).unwrap();
        list.add(entry("4 10 10 0 Comp1"), 10, true).unwrap();
        assert_eq!(list.set_group_enable(-1, false), 1);
        let fired = list.check(10, false);
        assert_eq!(fired.len(), 1);
        assert_eq!(fired[0].station, 4);
        assert_eq!(list.set_group_enable(2, true), 1);
        list.check(20, false);
        assert_eq!(list.check(600, false).len(), 2);
    }

    #[test]
    fn edit_by_description() {
        let mut list = ScheduleList::new();
        list.add(entry("3 10 10 2 Comp1"), 0, true).unwrap();
        list.add(entry("5 10 10/5 0 UsrPPI"), 0, true).unwrap();
        assert_eq!(
            decode_description("5 User Def PPI 10/5min (+0) Fallback"),
            Some((5, RpScanType::UsrPpi, 600, 0))
        );
        assert_eq!(list.find_by_description("3 BaseScan 10min (+2)"), Some(1));
        list.modify(1, 300, 60, 50).unwrap();
        assert_eq!(list.get(1).unwrap().describe(), "3 BaseScan 5min (+1)");
        let gone = list.delete_by_description("5 User Def PPI 10/5min (+0)").unwrap();
        assert_eq!(gone.station(), 5);
        assert!(list.delete(4).is_err());
        assert_eq!(list.encode_all(), "schedule=3\t10\t5\t1\tComp1\n");
    }
}
