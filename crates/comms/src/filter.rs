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

//! `RPFILTER:<station>:<scantype>:<format-or-levels>:<datasource>[:<datatype>]`
//!
//! A negative field matches anything. A filter prefixed with `*` is "raw": it is
//! forwarded to the peer exactly as written rather than re-encoded.

use crate::error::FilterError;
use crate::scan::Scan;
use crate::types::{ScanType, data_type_index};

pub const FILTER_PREFIX: &str = "RPFILTER";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScanFilter {
    pub station: i32,
    pub scan_type: i32,
    pub format: i32,
    pub source: i32,
    pub data_type: i32,
    raw: Option<String>,
}

impl Default for ScanFilter {
    fn default() -> Self {
        Self::any()
    }
}

impl ScanFilter {
    pub fn any() -> Self {
        Self {
            station: -1,
            scan_type: -1,
            format: -1,
            source: -1,
            data_type: -1,
            raw: None,
        }
    }

    pub fn new(station: i32, scan_type: i32, format: i32, source: i32, data_type: i32) -> Self {
        Self {
            station,
            scan_type,
            format,
            source,
            data_type,
            raw: None,
        }
    }

    pub fn decode(s: &str) -> Result<Self, FilterError> {
        let trimmed = s.trim();
        if trimmed.is_empty() {
            return Err(FilterError::Empty);
        }
        let (is_raw, body) = match trimmed.strip_prefix('*') {
            Some(rest) => (true, rest.trim_end_matches('\\').trim_end()),
            None => (false, trimmed),
        };

        let mut tokens = body
            .split([' ', ':', '\t'])
            .filter(|t| !t.is_empty());
        match tokens.next() {
            Some(p) if p.eq_ignore_ascii_case(FILTER_PREFIX) => {}
            _ => return Err(FilterError::MissingPrefix(s.to_string())),
        }

        let station = match tokens.next().and_then(|t| t.parse::<i32>().ok()) {
            Some(stn) if stn != 0 => stn,
            _ => return Err(FilterError::InvalidStation(s.to_string())),
        };
        let scan_type = tokens
            .next()
            .and_then(|t| {
                t.parse::<i32>()
                    .ok()
                    .or_else(|| ScanType::from_name(t).map(ScanType::code))
            })
            .unwrap_or(-1);
        let format = tokens.next().and_then(|t| t.parse().ok()).unwrap_or(-1);
        let source = tokens.next().and_then(|t| t.parse().ok()).unwrap_or(-1);
        let data_type = tokens
            .next()
            .and_then(|t| {
                t.parse::<i32>().ok().or_else(|| {
                    t.split(',').next().and_then(data_type_index)
                })
            })
            .unwrap_or(-1);

        Ok(Self {
            station,
            scan_type,
            format,
            source,
            data_type,
            raw: is_raw.then(|| body.to_string()),
        })
    }

    pub fn encode(&self) -> String {
        if let Some(raw) = &self.raw {
            return raw.clone();
        }
        let mut out = format!(
            "{FILTER_PREFIX}:{}:{}:{}:{}",
            self.station, self.scan_type, self.format, self.source
        );
        if self.data_type >= 0 {
            out.push_str(&format!(":{}", self.data_type));
        }
        out
    }

    pub fn is_raw(&self) -> bool {
        self.raw.is_some()
    }

    /// Matches any station.
    pub fn is_open(&self) -> bool {
        self.station < 0
    }

    pub fn matches(&self, scan: &Scan) -> bool {
        if self.station >= 0 && self.station != scan.station {
            return false;
        }
        if self.scan_type >= 0 && self.scan_type != scan.scan_type.code() {
            let both_ppi = ScanType::from_code(self.scan_type).is_some_and(ScanType::is_ppi_like)
                && scan.scan_type.is_ppi_like();
            if !both_ppi {
                return false;
            }
        }
        if self.format >= 0 {
            let ok = if self.format < 4 {
                self.format == scan.data_fmt
            } else {
                self.format == scan.levels
            };
            if !ok {
                return false;
            }
        }
        if self.source >= 0 && self.source != scan.data_source {
            return false;
        }
        self.data_type < 0 || self.data_type == scan.data_type
    }
}

/// True if any filter in `filters` accepts `scan`.
pub fn any_match(filters: &[ScanFilter], scan: &Scan) -> bool {
    filters.iter().any(|f| f.matches(scan))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scan::tests::ppi_scan;
    use pretty_assertions::assert_eq;
    use test_case::test_case;

    #[test]
    fn wildcard_matches_everything() {
        let f = ScanFilter::any();
        assert!(f.matches(&ppi_scan(3, 0)));
        assert!(f.matches(&ppi_scan(70, 10)));
    }

    #[test]
    fn round_trip() {
        let f = ScanFilter::new(3, 4, 1, 0, 1);
        assert_eq!(f.encode(), "RPFILTER:3:4:1:0:1");
        assert_eq!(ScanFilter::decode(&f.encode()), Ok(f));
        let g = ScanFilter::new(-1, 0, -1, -1, -1);
        assert_eq!(g.encode(), "RPFILTER:-1:0:-1:-1");
        assert_eq!(ScanFilter::decode(&g.encode()), Ok(g));
    }

    #[test]
    fn raw_literal_preserved() {
        let f = ScanFilter::decode("*RPFILTER:3:VOL:-1:-1:Refl,Vel \\").unwrap();
        assert!(f.is_raw());
        assert_eq!(f.encode(), "RPFILTER:3:VOL:-1:-1:Refl,Vel");
        assert_eq!(f.scan_type, ScanType::Vol.code());
        assert_eq!(f.data_type, 0);
    }

    #[test_case("RPFILTER:0:1:1:0"; "zero station")]
    #[test_case("RPFILTER:abc"; "non numeric station")]
    fn invalid_station(s: &str) {
        assert!(matches!(
            ScanFilter::decode(s),
            Err(FilterError::InvalidStation(_))
        ));
    }

    #[test]
    fn missing_prefix() {
        assert!(matches!(
            ScanFilter::decode("FILTER:1"),
            Err(FilterError::MissingPrefix(_))
        ));
        assert_eq!(ScanFilter::decode("   "), Err(FilterError::Empty));
    }

    #[test]
    fn partial_fields_are_permissive() {
        let f = ScanFilter::decode("RPFILTER:3 : junk").unwrap();
        assert_eq!(f.station, 3);
        assert_eq!(f.scan_type, -1);
        assert!(f.matches(&ppi_scan(3, 0)));
        assert!(!f.matches(&ppi_scan(4, 0)));
    }

    #[test]
    fn ppi_and_comp_ppi_are_interchangeable() {
        let f = ScanFilter::new(-1, ScanType::CompPpi.code(), -1, -1, -1);
        assert!(f.matches(&ppi_scan(3, 0)));
        let rhi = ScanFilter::new(-1, ScanType::Rhi.code(), -1, -1, -1);
        assert!(!rhi.matches(&ppi_scan(3, 0)));
    }

    #[test]
    fn format_versus_levels() {
        let scan = ppi_scan(3, 0);
        assert!(ScanFilter::new(-1, -1, 1, -1, -1).matches(&scan));
        assert!(!ScanFilter::new(-1, -1, 0, -1, -1).matches(&scan));
        assert!(ScanFilter::new(-1, -1, 16, -1, -1).matches(&scan));
        assert!(!ScanFilter::new(-1, -1, 64, -1, -1).matches(&scan));
    }
}
