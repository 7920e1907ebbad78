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

//! Connection and session management for distributing Rapic radar scans.
//!
//! `CommMngr` owns the device pools, the shared listen socket, the request and
//! schedule queues and the connection catalog. Each `RxDevice` pulls scans from one
//! radar or upstream node; each `TxDevice` serves filtered scans to one consumer.

use std::sync::{Mutex, MutexGuard, PoisonError};

pub mod alert;
pub mod catalog;
pub mod clock;
pub mod codec;
pub mod config;
pub mod control;
pub mod device;
pub mod error;
pub mod fallback;
pub mod filter;
pub mod manager;
pub mod request;
pub mod rxdevice;
pub mod scan;
pub mod schedule;
pub mod status;
pub mod transport;
pub mod txdevice;
pub mod types;
pub mod worker;

pub use clock::{Clock, ManualClock, SharedClock, SystemClock, Timestamp};
pub use error::{CommsError, FilterError, ParseError, TransportError};
pub use filter::ScanFilter;
pub use manager::{CommMngr, ManagerOptions};
pub use scan::Scan;
pub use types::{CommStatus, ConnMode, PortType, QueryType, RpScanType, ScanType};

pub(crate) fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}
