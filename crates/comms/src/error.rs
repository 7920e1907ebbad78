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

use crate::types::ConnMode;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FilterError {
    #[error("empty filter string")]
    Empty,
    #[error("filter does not start with RPFILTER: {0}")]
    MissingPrefix(String),
    #[error("filter has no valid station: {0}")]
    InvalidStation(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ParseError {
    #[error("unknown directive: {0}")]
    UnknownDirective(String),
    #[error("too few fields in {directive}: expected at least {expected}, got {got}")]
    TooFewFields {
        directive: &'static str,
        expected: usize,
        got: usize,
    },
    #[error("invalid {field} value: {value}")]
    InvalidField { field: &'static str, value: String },
    #[error("unknown connection mode: {0}")]
    UnknownMode(String),
    #[error("bad connect string: {0}")]
    BadConnectString(String),
}

impl ParseError {
    pub fn invalid(field: &'static str, value: impl Into<String>) -> Self {
        ParseError::InvalidField {
            field,
            value: value.into(),
        }
    }
}

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("connect to {target} failed: {source}")]
    Connect {
        target: String,
        #[source]
        source: std::io::Error,
    },
    #[error("bind to port {port} failed: {source}")]
    Bind {
        port: u16,
        #[source]
        source: std::io::Error,
    },
    #[error("accept failed: {0}")]
    Accept(#[source] std::io::Error),
    #[error("connection closed by peer")]
    Closed,
    #[error("not connected")]
    NotConnected,
    #[error("unresolvable address: {0}")]
    Address(String),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Error)]
pub enum CommsError {
    #[error("transport mode {0} has no implementation")]
    UnsupportedMode(ConnMode),
    #[error("no viable connection for station {station}")]
    NoViableConnection { station: i32 },
    #[error("duplicate entry: {0}")]
    Duplicate(String),
    #[error("unknown device {0}")]
    UnknownDevice(usize),
    #[error("no request with id {0}")]
    NoSuchRequest(u64),
    #[error("request {0} is being serviced")]
    RequestBusy(u64),
    #[error("no schedule entry matches {0}")]
    NoSuchSchedule(String),
    #[error("group id 0 is not a valid group")]
    InvalidGroup,
    #[error("unable to start device worker: {0}")]
    Worker(#[source] std::io::Error),
    #[error(transparent)]
    Parse(#[from] ParseError),
    #[error(transparent)]
    Filter(#[from] FilterError),
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error("config file {path}: {source}")]
    ConfigIo {
        path: String,
        #[source]
        source: std::io::Error,
    },
}
