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

//! Enumerations shared across the comms layer, with their wire and config spellings.

use serde::{Deserialize, Serialize};
use strum::{Display, EnumIter, IntoStaticStr};

/// Devices are numbered from 1 in creation order across both rx and tx pools.
pub type DeviceId = usize;

/// Physical transport kind. Ordering in the rank table is by preference.
#[derive(
    Debug, Default, Clone, Copy, PartialEq, Eq, Hash, Display, EnumIter, Serialize, Deserialize,
)]
pub enum ConnMode {
    #[default]
    Generic,
    Serial,
    X28,
    Hayes,
    Socket,
    SockX25,
}

impl ConnMode {
    pub fn rank(self) -> i32 {
        match self {
            ConnMode::Generic => 0,
            ConnMode::Serial => 300,
            ConnMode::X28 => 200,
            ConnMode::Hayes => 100,
            ConnMode::Socket => 500,
            ConnMode::SockX25 => 400,
        }
    }

    /// Case-insensitive. `SockX25` is tested before `Socket` since both share a prefix.
    pub fn parse(s: &str) -> Option<Self> {
        let s = s.trim().to_ascii_lowercase();
        if s.starts_with("sockx25") {
            Some(ConnMode::SockX25)
        } else if s.starts_with("socket") {
            Some(ConnMode::Socket)
        } else if s.starts_with("serial") {
            Some(ConnMode::Serial)
        } else if s.starts_with("x28") {
            Some(ConnMode::X28)
        } else if s.starts_with("hayes") {
            Some(ConnMode::Hayes)
        } else if s.starts_with("generic") {
            Some(ConnMode::Generic)
        } else {
            None
        }
    }
}

/// The role of the remote port a connection reaches.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash, Display, IntoStaticStr, EnumIter)]
pub enum PortType {
    #[default]
    Std1,
    Std2,
    Vol,
    Srv,
}

impl PortType {
    pub fn parse(s: &str) -> Self {
        match s.trim().to_ascii_lowercase().as_str() {
            "std2" => PortType::Std2,
            "vol" => PortType::Vol,
            "srv" => PortType::Srv,
            _ => PortType::Std1,
        }
    }

    /// Whether a request for `scan_type` can be satisfied through this port role.
    pub fn serves(self, scan_type: RpScanType) -> bool {
        match self {
            PortType::Std1 => scan_type == RpScanType::DfltPpi1,
            PortType::Std2 => scan_type == RpScanType::DfltPpi2,
            PortType::Vol => scan_type == RpScanType::Vol,
            PortType::Srv => matches!(
                scan_type,
                RpScanType::Vol | RpScanType::DfltPpi1 | RpScanType::UsrPpi | RpScanType::UsrRhi
            ),
        }
    }
}

/// The kind of scan a request asks a radar for.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash, EnumIter)]
pub enum RpScanType {
    #[default]
    DfltPpi1,
    DfltPpi2,
    UsrPpi,
    UsrRhi,
    Vol,
}

impl RpScanType {
    pub fn token(self) -> &'static str {
        match self {
            RpScanType::DfltPpi1 => "Comp1",
            RpScanType::DfltPpi2 => "Comp2",
            RpScanType::UsrPpi => "UsrPPI",
            RpScanType::UsrRhi => "UsrRHI",
            RpScanType::Vol => "VOL",
        }
    }

    pub fn readable(self) -> &'static str {
        match self {
            RpScanType::DfltPpi1 => "BaseScan",
            RpScanType::DfltPpi2 => "BaseScan2",
            RpScanType::UsrPpi => "User Def PPI",
            RpScanType::UsrRhi => "User Def RHI",
            RpScanType::Vol => "Volumetric",
        }
    }

    /// Substring match on either spelling. Anything unrecognised is the default PPI.
    pub fn parse(s: &str) -> Self {
        let lower = s.to_ascii_lowercase();
        for t in [
            RpScanType::DfltPpi2,
            RpScanType::UsrPpi,
            RpScanType::UsrRhi,
            RpScanType::Vol,
        ] {
            if lower.contains(&t.token().to_ascii_lowercase())
                || lower.contains(&t.readable().to_ascii_lowercase())
            {
                return t;
            }
        }
        RpScanType::DfltPpi1
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash, Display, IntoStaticStr, EnumIter)]
pub enum QueryType {
    #[default]
    Latest,
    ToTime,
    FromTime,
    CentreTime,
}

impl QueryType {
    pub fn parse(s: &str) -> Self {
        let lower = s.to_ascii_lowercase();
        if lower.starts_with("totime") {
            QueryType::ToTime
        } else if lower.starts_with("fromtime") {
            QueryType::FromTime
        } else if lower.starts_with("centretime") || lower.starts_with("centertime") {
            QueryType::CentreTime
        } else {
            QueryType::Latest
        }
    }
}

/// Session state shared by rx and tx devices.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash, EnumIter)]
pub enum CommStatus {
    #[default]
    Idle,
    Connecting,
    Connected,
    StatusFail,
    ReqComplete,
    ReqFailed,
    Clear,
    ConnFailed,
    ConnLost,
    ReconnFailed,
    Disabled,
    AckFail,
    Listening,
}

impl CommStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            CommStatus::Idle => "IDLE",
            CommStatus::Connecting => "CONNECTING",
            CommStatus::Connected => "CONNECTED",
            CommStatus::StatusFail => "STATUSFAIL",
            CommStatus::ReqComplete => "REQCOMPLET",
            CommStatus::ReqFailed => "REQ FAILED",
            CommStatus::Clear => "CLEAR COMM",
            CommStatus::ConnFailed => "CONNFAILED",
            CommStatus::ConnLost => "CONNLOST",
            CommStatus::ReconnFailed => "RECONNFAIL",
            CommStatus::Disabled => "DISABLED",
            CommStatus::AckFail => "ACK FAILED",
            CommStatus::Listening => "LISTENING",
        }
    }
}

impl std::fmt::Display for CommStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ServiceType {
    #[default]
    None,
    Request,
    SemiPerm,
}

impl ServiceType {
    pub fn as_str(self) -> &'static str {
        match self {
            ServiceType::None => "",
            ServiceType::Request => "Req.",
            ServiceType::SemiPerm => "Perm.",
        }
    }
}

/// Geometry of a received scan. Discriminants are the numeric codes used in filters.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash, Display, EnumIter)]
pub enum ScanType {
    #[default]
    #[strum(serialize = "PPI")]
    Ppi = 0,
    #[strum(serialize = "RHI")]
    Rhi = 1,
    #[strum(serialize = "CompPPI")]
    CompPpi = 2,
    #[strum(serialize = "IMAGE")]
    Image = 3,
    #[strum(serialize = "VOL")]
    Vol = 4,
    #[strum(serialize = "RHISet")]
    RhiSet = 5,
    #[strum(serialize = "MERGE")]
    Merge = 6,
}

impl ScanType {
    pub fn code(self) -> i32 {
        self as i32
    }

    pub fn from_code(code: i32) -> Option<Self> {
        Some(match code {
            0 => ScanType::Ppi,
            1 => ScanType::Rhi,
            2 => ScanType::CompPpi,
            3 => ScanType::Image,
            4 => ScanType::Vol,
            5 => ScanType::RhiSet,
            6 => ScanType::Merge,
            _ => return None,
        })
    }

    pub fn from_name(name: &str) -> Option<Self> {
        use strum::IntoEnumIterator;
        ScanType::iter().find(|t| t.to_string().eq_ignore_ascii_case(name.trim()))
    }

    pub fn is_ppi_like(self) -> bool {
        matches!(self, ScanType::Ppi | ScanType::CompPpi)
    }
}

pub const DATA_TYPE_NAMES: [&str; 16] = [
    "Refl",
    "Vel",
    "SpWdth",
    "DiffZ",
    "UnCorRefl",
    "RainAccum",
    "FiltVel",
    "VIL",
    "3DTops",
    "TerrainHt",
    "RainRate",
    "RainAccum",
    "RFFcstAccum",
    "RFProb",
    "PartID",
    "QPERate",
];

/// Index of a named data type; the first match wins for the duplicated `RainAccum`.
pub fn data_type_index(name: &str) -> Option<i32> {
    DATA_TYPE_NAMES
        .iter()
        .position(|n| n.eq_ignore_ascii_case(name.trim()))
        .map(|i| i as i32)
}

/// Video level counts for the four run-length formats, indexed by format code.
pub const FORMAT_LEVELS: [i32; 4] = [6, 16, 32, 64];

pub fn format_for_levels(levels: i32) -> i32 {
    FORMAT_LEVELS
        .iter()
        .position(|l| *l == levels)
        .map(|i| i as i32)
        .unwrap_or(-1)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use test_case::test_case;

    #[test_case("Socket", Some(ConnMode::Socket); "socket")]
    #[test_case("SOCKX25", Some(ConnMode::SockX25); "sockx25 before socket")]
    #[test_case("hayes", Some(ConnMode::Hayes); "lowercase")]
    #[test_case("carrier-pigeon", None; "unknown")]
    fn conn_mode_parse(s: &str, expected: Option<ConnMode>) {
        assert_eq!(ConnMode::parse(s), expected);
    }

    #[test]
    fn ranks_prefer_sockets() {
        assert!(ConnMode::Socket.rank() > ConnMode::SockX25.rank());
        assert!(ConnMode::SockX25.rank() > ConnMode::Serial.rank());
        assert_eq!(ConnMode::Generic.rank(), 0);
    }

    #[test_case("DFLT_PPI1", RpScanType::DfltPpi1; "default spelling")]
    #[test_case("Comp2", RpScanType::DfltPpi2; "comp2")]
    #[test_case("VOL", RpScanType::Vol; "vol")]
    #[test_case("Volumetric", RpScanType::Vol; "readable vol")]
    #[test_case("usrrhi", RpScanType::UsrRhi; "user rhi")]
    fn scan_type_parse(s: &str, expected: RpScanType) {
        assert_eq!(RpScanType::parse(s), expected);
    }

    #[test]
    fn port_compatibility() {
        assert!(PortType::Std1.serves(RpScanType::DfltPpi1));
        assert!(!PortType::Std1.serves(RpScanType::Vol));
        assert!(PortType::Srv.serves(RpScanType::Vol));
        assert!(PortType::Srv.serves(RpScanType::DfltPpi1));
        assert!(!PortType::Vol.serves(RpScanType::DfltPpi1));
    }

    #[test]
    fn status_strings() {
        assert_eq!(CommStatus::ReqComplete.to_string(), "REQCOMPLET");
        assert_eq!(CommStatus::AckFail.as_str(), "ACK FAILED");
    }

    #[test]
    fn scan_type_names() {
        assert_eq!(ScanType::from_name("CompPPI"), Some(ScanType::CompPpi));
        assert_eq!(ScanType::from_code(4), Some(ScanType::Vol));
        assert_eq!(ScanType::Vol.to_string(), "VOL");
        assert_eq!(data_type_index("vel"), Some(1));
        assert_eq!(format_for_levels(16), 1);
        assert_eq!(format_for_levels(256), -1);
    }
}
