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

//! The catalog of dial targets per station.

use crate::clock::{Timestamp, short_time};
use crate::error::ParseError;
use crate::types::{ConnMode, PortType, RpScanType};
use indexmap::IndexMap;
use itertools::Itertools;

pub type ConnId = usize;

#[derive(Debug, Clone, PartialEq)]
pub struct Connection {
    pub station: i32,
    pub retries: i32,
    /// Minimum spacing between uses, seconds.
    pub spacing: i64,
    pub protocol: String,
    pub port_type: PortType,
    pub mode: ConnMode,
    pub connstr: String,
    pub connstr2: Option<String>,
    /// Data timeout the servicing device adopts, if set.
    pub data_timeout: Option<i64>,
    pub rank: i32,
    pub ready_at: Timestamp,
    pub in_use: bool,
    pub attempts: u32,
    pub successes: u32,
    pub fails: u32,
}

impl Connection {
    /// `<stn> <retries> <tmout> <protocol> <porttype> <mode> <connstr> [<connstr2>] [timeout=n]`
    ///
    /// A socket connect string is two tokens (`host port`); other modes use one.
    pub fn parse(args: &str) -> Result<Self, ParseError> {
        let mut data_timeout = None;
        let mut tokens = vec![];
        for t in args.split_whitespace() {
            match t.strip_prefix("timeout=") {
                Some(v) => {
                    data_timeout = Some(v.parse().map_err(|_| ParseError::invalid("timeout", v))?)
                }
                None => tokens.push(t),
            }
        }
        if tokens.len() < 7 {
            return Err(ParseError::TooFewFields {
                directive: "connection",
                expected: 7,
                got: tokens.len(),
            });
        }
        let station = tokens[0]
            .parse()
            .map_err(|_| ParseError::invalid("station", tokens[0]))?;
        let retries = tokens[1]
            .parse()
            .map_err(|_| ParseError::invalid("retries", tokens[1]))?;
        let spacing = tokens[2]
            .parse()
            .map_err(|_| ParseError::invalid("tmout", tokens[2]))?;
        let mode =
            ConnMode::parse(tokens[5]).ok_or_else(|| ParseError::UnknownMode(tokens[5].into()))?;
        let width = if matches!(mode, ConnMode::Socket | ConnMode::SockX25) {
            2
        } else {
            1
        };
        let rest = &tokens[6..];
        if rest.len() < width {
            return Err(ParseError::BadConnectString(rest.join(" ")));
        }
        let connstr = rest[..width].join(" ");
        let connstr2 = (rest.len() > width).then(|| rest[width..].join(" "));
        Ok(Self {
            station,
            retries,
            spacing,
            protocol: tokens[3].to_string(),
            port_type: PortType::parse(tokens[4]),
            mode,
            connstr,
            connstr2,
            data_timeout,
            rank: mode.rank(),
            ready_at: 0,
            in_use: false,
            attempts: 0,
            successes: 0,
            fails: 0,
        })
    }

    pub fn encode(&self) -> String {
        let mut out = format!(
            "connection={} {} {} {} {} {} {}",
            self.station,
            self.retries,
            self.spacing,
            self.protocol,
            self.port_type,
            self.mode,
            self.connstr
        );
        if let Some(c2) = &self.connstr2 {
            out.push(' ');
            out.push_str(c2);
        }
        if let Some(t) = self.data_timeout {
            out.push_str(&format!(" timeout={t}"));
        }
        out
    }

    pub fn serves(&self, station: i32, scan_type: RpScanType) -> bool {
        self.station == station && self.port_type.serves(scan_type)
    }

    pub fn is_ready(&self, now: Timestamp) -> bool {
        !self.in_use && now >= self.ready_at
    }
}

/// Connections in insertion order, indexed by station.
#[derive(Debug, Default)]
pub struct ConnectionCatalog {
    conns: Vec<Connection>,
    by_station: IndexMap<i32, Vec<ConnId>>,
}

impl ConnectionCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a connection. An identical entry already present is not added twice.
    pub fn add(&mut self, conn: Connection) -> ConnId {
        if let Some(existing) = self.for_station(conn.station).find(|(_, c)| {
            c.mode == conn.mode && c.connstr == conn.connstr && c.port_type == conn.port_type
        }) {
            return existing.0;
        }
        let id = self.conns.len();
        self.by_station.entry(conn.station).or_default().push(id);
        self.conns.push(conn);
        id
    }

    pub fn get(&self, id: ConnId) -> Option<&Connection> {
        self.conns.get(id)
    }

    pub fn get_mut(&mut self, id: ConnId) -> Option<&mut Connection> {
        self.conns.get_mut(id)
    }

    pub fn for_station(&self, station: i32) -> impl Iterator<Item = (ConnId, &Connection)> {
        self.by_station
            .get(&station)
            .into_iter()
            .flatten()
            .filter_map(|id| self.conns.get(*id).map(|c| (*id, c)))
    }

    pub fn iter(&self) -> impl Iterator<Item = (ConnId, &Connection)> {
        self.conns.iter().enumerate()
    }

    pub fn len(&self) -> usize {
        self.conns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.conns.is_empty()
    }

    pub fn clear(&mut self) {
        self.conns.clear();
        self.by_station.clear();
    }

    pub fn stations(&self) -> impl Iterator<Item = i32> + '_ {
        self.by_station.keys().copied()
    }

    /// Text dump of every connection with its counters.
    pub fn dump(&self) -> String {
        self.conns
            .iter()
            .enumerate()
            .map(|(id, c)| {
                format!(
                    "{id:3} stn={:3} {:8} {:5} {:24} rank={:3} retries={} inuse={} ready={} att={} ok={} fail={}",
                    c.station,
                    c.mode,
                    c.port_type,
                    c.connstr,
                    c.rank,
                    c.retries,
                    c.in_use,
                    short_time(c.ready_at),
                    c.attempts,
                    c.successes,
                    c.fails
                )
            })
            .join("\n")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn parse_socket_connection() {
        let c = Connection::parse("3 3 0 Rapic Std1 Socket host.example 15555").unwrap();
        assert_eq!(c.station, 3);
        assert_eq!(c.retries, 3);
        assert_eq!(c.mode, ConnMode::Socket);
        assert_eq!(c.port_type, PortType::Std1);
        assert_eq!(c.connstr, "host.example 15555");
        assert_eq!(c.connstr2, None);
        assert_eq!(c.rank, 500);
        assert_eq!(
            c.encode(),
            "connection=3 3 0 Rapic Std1 Socket host.example 15555"
        );
    }

    #[test]
    fn parse_alternate_and_timeout() {
        let c = Connection::parse(
            "2 1 60 Rapic Vol Socket a.example 15555 b.example 15555 timeout=120",
        )
        .unwrap();
        assert_eq!(c.connstr2.as_deref(), Some("b.example 15555"));
        assert_eq!(c.data_timeout, Some(120));
        assert_eq!(c.spacing, 60);
        let s = Connection::parse("2 1 0 Rapic Std1 Hayes 5551234").unwrap();
        assert_eq!(s.connstr, "5551234");
    }

    #[test]
    fn parse_errors() {
        assert!(matches!(
            Connection::parse("3 3 0 Rapic Std1"),
            Err(ParseError::TooFewFields { .. })
        ));
        assert!(matches!(
            Connection::parse("3 3 0 Rapic Std1 Pigeon x"),
            Err(ParseError::UnknownMode(_))
        ));
        assert!(matches!(
            Connection::parse("3 3 0 Rapic Std1 Socket host"),
            Err(ParseError::BadConnectString(_))
        ));
    }

    #[test]
    fn catalog_indexes_by_station() {
        let mut cat = ConnectionCatalog::new();
        let a = cat.add(Connection::parse("3 3 0 Rapic Std1 Socket a 1").unwrap());
        let b = cat.add(Connection::parse("4 3 0 Rapic Std1 Socket b 1").unwrap());
        let c = cat.add(Connection::parse("3 3 0 Rapic Vol Socket c 1").unwrap());
        let again = cat.add(Connection::parse("3 3 0 Rapic Std1 Socket a 1").unwrap());
        assert_eq!(again, a);
        assert_eq!(cat.len(), 3);
        let ids: Vec<_> = cat.for_station(3).map(|(id, _)| id).collect();
        assert_eq!(ids, vec![a, c]);
        assert_eq!(cat.for_station(4).next().map(|(id, _)| id), Some(b));
        assert_eq!(cat.for_station(9).count(), 0);
        assert_eq!(cat.dump().lines().count(), 3);
    }
}
