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

//! A radar scan as assembled from the line stream: header fields, radials and terminators.
//!
//! Scans are built by an rxdevice, then frozen behind an `Arc` and handed to every
//! txdevice whose filters accept them. The serialized form is the original line list.

use crate::clock::{Timestamp, from_calendar, julian_to_ymd};
use crate::types::{ScanType, data_type_index, format_for_levels};
use uuid::Uuid;

pub const END_IMAGE: &str = "END RADAR IMAG";
pub const END_SCAN_SET_MARKERS: [&str; 3] = ["END RADAR VOL", "END SCAN SET", "END INCOMPLETE VOL"];

/// Where a scan came from, as carried in filters.
pub mod source {
    pub const COMM: i32 = 0;
    pub const DB: i32 = 1;
    pub const COMM_REQ: i32 = 2;
    pub const PROD_ACCUM: i32 = 3;
}

#[derive(Debug, Clone)]
pub struct Scan {
    pub id: Uuid,
    pub station: i32,
    pub scan_type: ScanType,
    pub levels: i32,
    pub data_fmt: i32,
    pub data_source: i32,
    pub data_type: i32,
    pub julian_date: i32,
    pub hour: u32,
    pub minute: u32,
    pub scan_time: Timestamp,
    pub product: String,
    pub radar_name: String,
    pub pass: i32,
    pub passes: i32,
    pub images: i32,
    pub radials: usize,
    pub fault_no: i32,
    pub fault_text: String,
    pub complete: bool,
    pub finished: bool,
    lines: Vec<String>,
}

impl Scan {
    pub fn new(data_source: i32) -> Self {
        Self {
            id: Uuid::now_v7(),
            station: 0,
            scan_type: ScanType::Ppi,
            levels: 0,
            data_fmt: -1,
            data_source,
            data_type: 0,
            julian_date: 0,
            hour: 0,
            minute: 0,
            scan_time: 0,
            product: String::new(),
            radar_name: String::new(),
            pass: 0,
            passes: 0,
            images: 0,
            radials: 0,
            fault_no: 0,
            fault_text: String::new(),
            complete: false,
            finished: false,
            lines: vec![],
        }
    }

    pub fn is_vol(&self) -> bool {
        self.scan_type == ScanType::Vol
    }

    pub fn is_faulty(&self) -> bool {
        self.fault_no != 0
    }

    /// Absorbs a header line, picking out the fields later used for filtering and acks.
    pub fn header_line(&mut self, line: &str) {
        if let Some((key, value)) = line.split_once(':') {
            let value = value.trim();
            match key.trim() {
                "STNID" => self.station = value.parse().unwrap_or(self.station),
                "NAME" => self.radar_name = value.to_string(),
                "DATE" => {
                    self.julian_date = value.parse().unwrap_or(0);
                    self.recompute_time();
                }
                "TIME" => {
                    if let Some((h, m)) = value.split_once('.') {
                        self.hour = h.trim().parse().unwrap_or(0);
                        self.minute = m.trim().parse().unwrap_or(0);
                        self.recompute_time();
                    }
                }
                "TIMESTAMP" => {
                    if let Some(t) = parse_timestamp(value) {
                        self.scan_time = t;
                    }
                }
                "PRODUCT" => {
                    self.product = value.to_string();
                    if value.contains("VOLUMETRIC") {
                        self.scan_type = ScanType::Vol;
                    }
                }
                "IMGFMT" => {
                    if !self.is_vol()
                        && let Some(t) = ScanType::from_name(value)
                    {
                        self.scan_type = t;
                    }
                }
                "VIDRES" => {
                    self.levels = value.parse().unwrap_or(0);
                    self.data_fmt = format_for_levels(self.levels);
                }
                "VIDEO" => {
                    if let Some(t) = data_type_index(value) {
                        self.data_type = t;
                    }
                }
                "PASS" => {
                    let mut parts = value.split_whitespace();
                    self.pass = parts.next().and_then(|p| p.parse().ok()).unwrap_or(0);
                    self.passes = parts.nth(1).and_then(|p| p.parse().ok()).unwrap_or(0);
                }
                _ => {}
            }
        }
        self.lines.push(line.to_string());
    }

    pub fn radial(&mut self, line: &str) {
        self.radials += 1;
        self.lines.push(line.to_string());
    }

    /// Records the end of one image. A volume is complete once every pass has arrived.
    pub fn end_image(&mut self, line: &str) {
        self.images += 1;
        self.lines.push(line.to_string());
        self.complete = !self.is_vol() || (self.passes > 0 && self.pass >= self.passes);
    }

    pub fn end_scan_set(&mut self, line: &str) {
        self.lines.push(line.to_string());
    }

    pub fn set_fault(&mut self, no: i32, text: &str) {
        self.fault_no = no;
        self.fault_text = text.to_string();
    }

    pub fn finish(&mut self) {
        self.finished = true;
    }

    pub fn line_count(&self) -> usize {
        self.lines.len()
    }

    /// The serialized scan as streamed by a txdevice.
    pub fn text(&self) -> String {
        let mut out = self.lines.join("\n");
        out.push('\n');
        out
    }

    /// Scans are the same product if station, geometry and format agree.
    pub fn same_product(&self, other: &Scan) -> bool {
        self.station == other.station
            && self.scan_type == other.scan_type
            && self.data_fmt == other.data_fmt
    }

    /// The acknowledgement a receiver returns for this scan.
    pub fn ack_line(&self) -> String {
        let product = self.product.split_whitespace().next().unwrap_or("NONE");
        format!(
            "RDRSCAN_ACK: {} {:05} {:02}.{:02} {} RADLCOUNT:{}",
            self.station, self.julian_date, self.hour, self.minute, product, self.radials
        )
    }

    pub fn describe(&self) -> String {
        format!(
            "stn={} {} {:05} {:02}.{:02} pass {}/{}",
            self.station, self.scan_type, self.julian_date, self.hour, self.minute, self.pass,
            self.passes
        )
    }

    fn recompute_time(&mut self) {
        if let Some((y, m, d)) = julian_to_ymd(self.julian_date)
            && let Some(t) = from_calendar(y, m, d, self.hour, self.minute, 0)
        {
            self.scan_time = t;
        }
    }
}

/// Parses `yyyymmddhhmmss`.
pub fn parse_timestamp(s: &str) -> Option<Timestamp> {
    let s = s.trim();
    if s.len() < 14 || !s.is_char_boundary(14) {
        return None;
    }
    let field = |a: usize, b: usize| s.get(a..b).and_then(|v| v.parse::<u32>().ok());
    from_calendar(
        field(0, 4)? as i32,
        field(4, 6)?,
        field(6, 8)?,
        field(8, 10)?,
        field(10, 12)?,
        field(12, 14)?,
    )
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AckMatch {
    Ok,
    Mismatch,
    Nacked,
}

/// Compares an `RDRSCAN_ACK:` line against the scan that was sent.
pub fn check_ack(line: &str, scan: &Scan) -> AckMatch {
    if line.contains("FAILED, BAD SCAN") {
        return AckMatch::Nacked;
    }
    let Some(rest) = line
        .find("RDRSCAN_ACK:")
        .map(|i| &line[i + "RDRSCAN_ACK:".len()..])
    else {
        return AckMatch::Mismatch;
    };
    let mut tokens = rest.split_whitespace();
    let stn = tokens.next().and_then(|t| t.parse::<i32>().ok());
    let date = tokens.next().and_then(|t| t.parse::<i32>().ok());
    let time = tokens.next().and_then(|t| t.split_once('.')).and_then(|(h, m)| {
        Some((h.parse::<u32>().ok()?, m.parse::<u32>().ok()?))
    });
    let (Some(stn), Some(date), Some((hour, minute))) = (stn, date, time) else {
        return AckMatch::Mismatch;
    };
    let same_day = match (julian_to_ymd(date), julian_to_ymd(scan.julian_date)) {
        (Some(a), Some(b)) => a == b,
        _ => date == scan.julian_date,
    };
    if stn != scan.station || !same_day || hour != scan.hour || minute != scan.minute {
        return AckMatch::Mismatch;
    }
    for t in tokens {
        if let Some(count) = t.strip_prefix("RADLCOUNT:")
            && count.parse::<usize>().ok() != Some(scan.radials)
        {
            return AckMatch::Mismatch;
        }
    }
    AckMatch::Ok
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    /// A complete single-image PPI scan for station `stn`.
    pub(crate) fn ppi_scan(stn: i32, minute: u32) -> Scan {
        let mut scan = Scan::new(source::COMM);
        scan.header_line(&format!("STNID: {stn}"));
        scan.header_line("DATE: 03224");
        scan.header_line(&format!("TIME: 12.{minute:02}"));
        scan.header_line("PRODUCT: NORMAL");
        scan.header_line("IMGFMT: PPI");
        scan.header_line("VIDRES: 16");
        scan.header_line("VIDEO: Refl");
        scan.radial("%001abcdef");
        scan.radial("%002abcdef");
        scan.end_image("END RADAR IMAGE");
        scan.finish();
        scan
    }

    #[test]
    fn header_fields() {
        let scan = ppi_scan(3, 30);
        assert_eq!(scan.station, 3);
        assert_eq!(scan.scan_type, ScanType::Ppi);
        assert_eq!(scan.data_fmt, 1);
        assert_eq!(scan.levels, 16);
        assert_eq!(scan.radials, 2);
        assert!(scan.complete);
        assert_eq!(
            scan.scan_time,
            from_calendar(2024, 2, 1, 12, 30, 0).unwrap()
        );
        assert!(scan.text().ends_with("END RADAR IMAGE\n"));
    }

    #[test]
    fn volume_completes_on_last_pass() {
        let mut scan = Scan::new(source::COMM);
        scan.header_line("STNID: 2");
        scan.header_line("PRODUCT: VOLUMETRIC [1]");
        scan.header_line("IMGFMT: PPI");
        scan.header_line("PASS: 1 of 2");
        scan.end_image("END RADAR IMAGE");
        assert!(scan.is_vol());
        assert!(!scan.complete);
        scan.header_line("PASS: 2 of 2");
        scan.end_image("END RADAR IMAGE");
        assert!(scan.complete);
    }

    #[test]
    fn ack_checks() {
        let scan = ppi_scan(3, 30);
        assert_eq!(check_ack(&scan.ack_line(), &scan), AckMatch::Ok);
        assert_eq!(
            check_ack("RDRSCAN_ACK: 3 03224 12.30 NORMAL", &scan),
            AckMatch::Ok
        );
        assert_eq!(
            check_ack("RDRSCAN_ACK: 3 03224 12.31 NORMAL", &scan),
            AckMatch::Mismatch
        );
        assert_eq!(
            check_ack("RDRSCAN_ACK: 3 03224 12.30 NORMAL RADLCOUNT:7", &scan),
            AckMatch::Mismatch
        );
        assert_eq!(
            check_ack("RDRSCAN_ACK: FAILED, BAD SCAN", &scan),
            AckMatch::Nacked
        );
        assert_eq!(check_ack("RDRSCAN_ACK: junk", &scan), AckMatch::Mismatch);
    }

    #[test]
    fn timestamps() {
        assert_eq!(
            parse_timestamp("20240201123000"),
            from_calendar(2024, 2, 1, 12, 30, 0)
        );
        assert_eq!(parse_timestamp("2024"), None);
    }
}
