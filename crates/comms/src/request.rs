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

//! Outstanding data requests and their ranked connection candidates.

use crate::catalog::{ConnId, Connection, ConnectionCatalog};
use crate::clock::Timestamp;
use crate::error::{CommsError, ParseError};
use crate::types::{ConnMode, DeviceId, QueryType, RpScanType};
use itertools::Itertools;
use tracing::{debug, info, warn};

pub type ReqId = u64;

pub const QUERY_PREFIX: &str = "RPQUERY:";
pub const SEMI_PERM_QUERY: &str = "SEMIPERMANENT CONNECTION - SEND ALL DATA";
/// Angle used when a request does not name one, in tenths of a degree.
pub const ANY_ANGLE: i32 = -9999;
/// Spacing between attempts on one candidate.
pub const CANDIDATE_RETRY_SECS: i64 = 20;
/// How long a candidate's device is held available after an attempt.
pub const DEVICE_AVAIL_SECS: i64 = 600;

#[derive(Debug, Clone, PartialEq)]
pub struct ReqConnCandidate {
    pub conn: ConnId,
    pub retries_left: i32,
    pub retry_at: Timestamp,
    pub dev_avail: Timestamp,
    pub rank: i32,
}

/// What the manager knows about one rx device when ranking.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RxAvailability {
    pub device: DeviceId,
    pub mode: ConnMode,
    /// In the free pool, enabled and idle.
    pub idle: bool,
    pub request: Option<ReqId>,
}

fn device_available(devices: &[RxAvailability], mode: ConnMode, req: ReqId) -> bool {
    devices
        .iter()
        .any(|d| d.mode == mode && (d.idle || d.request == Some(req)))
}

/// 0 when `conn` cannot be used for the request now (wrong station or port role,
/// still spacing out, or no device of its mode to run it), 1 when it is usable but
/// busy, otherwise the transport rank plus the retries remaining.
pub fn connection_rank(
    conn: &Connection,
    req: &CommRequest,
    retries_left: i32,
    now: Timestamp,
    devices: &[RxAvailability],
) -> i32 {
    if !conn.serves(req.station, req.scan_type)
        || now < conn.ready_at
        || !device_available(devices, conn.mode, req.id)
    {
        return 0;
    }
    if conn.in_use {
        return 1;
    }
    conn.rank + retries_left
}

#[derive(Debug, Clone, PartialEq)]
pub struct CommRequest {
    pub id: ReqId,
    pub station: i32,
    pub scan_type: RpScanType,
    /// Tenths of a degree.
    pub angle: i32,
    pub count: i32,
    pub query_type: QueryType,
    pub query_time: Timestamp,
    pub priority: i32,
    pub queued_at: Timestamp,
    pub last_attempt: Timestamp,
    pub attempt_in_progress: bool,
    pub completed: bool,
    pub candidates: Vec<ReqConnCandidate>,
    pub current: Option<ConnId>,
    pub rx_device: Option<DeviceId>,
}

impl Default for CommRequest {
    fn default() -> Self {
        Self {
            id: 0,
            station: 0,
            scan_type: RpScanType::DfltPpi1,
            angle: ANY_ANGLE,
            count: 1,
            query_type: QueryType::Latest,
            query_time: 0,
            priority: 0,
            queued_at: 0,
            last_attempt: 0,
            attempt_in_progress: false,
            completed: false,
            candidates: vec![],
            current: None,
            rx_device: None,
        }
    }
}

impl CommRequest {
    pub fn new(station: i32, scan_type: RpScanType) -> Self {
        Self {
            station,
            scan_type,
            ..Default::default()
        }
    }

    /// `<stn> <type> <angle> <count> <qtype> <qtime>`; trailing fields may be omitted.
    pub fn parse(args: &str) -> Result<Self, ParseError> {
        let mut req = Self::default();
        let mut tokens = args.split_whitespace();
        let stn = tokens.next().ok_or(ParseError::TooFewFields {
            directive: "request",
            expected: 1,
            got: 0,
        })?;
        req.station = stn
            .parse()
            .map_err(|_| ParseError::invalid("station", stn))?;
        if let Some(t) = tokens.next() {
            req.scan_type = RpScanType::parse(t);
        }
        if let Some(a) = tokens.next() {
            let angle: f32 = a.parse().map_err(|_| ParseError::invalid("angle", a))?;
            req.angle = (angle * 10.0).round() as i32;
        }
        if let Some(c) = tokens.next() {
            req.count = c.parse().map_err(|_| ParseError::invalid("count", c))?;
        }
        if let Some(q) = tokens.next() {
            req.query_type = QueryType::parse(q);
        }
        if let Some(t) = tokens.next() {
            req.query_time = t.parse().map_err(|_| ParseError::invalid("qtime", t))?;
        }
        Ok(req)
    }

    /// Parses the body of an `RPQUERY:` line that is not a semi-permanent marker.
    pub fn parse_query(line: &str) -> Result<Self, ParseError> {
        let body = line
            .find(QUERY_PREFIX)
            .map(|i| &line[i + QUERY_PREFIX.len()..])
            .ok_or_else(|| ParseError::invalid("query", line))?;
        Self::parse(body)
    }

    pub fn angle_degrees(&self) -> f32 {
        self.angle as f32 / 10.0
    }

    pub fn query_string(&self) -> String {
        let vol_types = if self.scan_type == RpScanType::Vol {
            " Refl,Vel"
        } else {
            ""
        };
        format!(
            "{QUERY_PREFIX} {} {} {:3.1} {} {} {}{vol_types}\n",
            self.station,
            self.scan_type.token(),
            self.angle_degrees(),
            self.count,
            self.query_type,
            self.query_time
        )
    }

    pub fn encode(&self) -> String {
        format!(
            "request={} {} {:.1} {} {} {}",
            self.station,
            self.scan_type.token(),
            self.angle_degrees(),
            self.count,
            self.query_type,
            self.query_time
        )
    }

    pub fn describe(&self, now: Timestamp) -> String {
        let on_queue = if self.queued_at > 0 {
            now - self.queued_at
        } else {
            0
        };
        format!(
            "{:>12} TYP-{} ANG-{:1.1} NO-{} QTYP-{} QTM-{} TMONQ-{} PR-{}",
            self.station,
            self.scan_type.readable(),
            self.angle_degrees(),
            self.count,
            self.query_type,
            self.query_time,
            on_queue,
            self.priority
        )
    }

    pub fn is_same(&self, other: &CommRequest) -> bool {
        self.station == other.station
            && self.scan_type == other.scan_type
            && self.angle == other.angle
            && self.count == other.count
            && self.query_type == other.query_type
            && self.query_time == other.query_time
    }

    /// Highest connection rank over the catalog for this request's station.
    pub fn best_candidate(
        &self,
        catalog: &ConnectionCatalog,
        now: Timestamp,
        devices: &[RxAvailability],
    ) -> i32 {
        catalog
            .for_station(self.station)
            .map(|(_, c)| connection_rank(c, self, c.retries.max(1), now, devices))
            .max()
            .unwrap_or(0)
    }

    /// One candidate per connection with a non-zero rank, best first.
    pub fn build_candidates(
        &mut self,
        catalog: &ConnectionCatalog,
        now: Timestamp,
        devices: &[RxAvailability],
    ) {
        let mut candidates = vec![];
        for (id, conn) in catalog.for_station(self.station) {
            let retries_left = conn.retries.max(1);
            let rank = connection_rank(conn, self, retries_left, now, devices);
            if rank > 0 {
                candidates.push(ReqConnCandidate {
                    conn: id,
                    retries_left,
                    retry_at: now,
                    dev_avail: now + DEVICE_AVAIL_SECS,
                    rank,
                });
            }
        }
        self.candidates = candidates;
        self.sort_candidates();
    }

    pub fn rerank(&mut self, catalog: &ConnectionCatalog, now: Timestamp, devices: &[RxAvailability]) {
        let snapshot = self.clone();
        for cand in self.candidates.iter_mut() {
            cand.rank = match catalog.get(cand.conn) {
                Some(conn) => connection_rank(conn, &snapshot, cand.retries_left, now, devices),
                None => 0,
            };
        }
        self.sort_candidates();
    }

    // Stable, so equal ranks keep catalog order.
    fn sort_candidates(&mut self) {
        self.candidates.sort_by(|a, b| b.rank.cmp(&a.rank));
    }

    /// Index of the best candidate a device of `mode` could use now.
    pub fn pick_for_mode(
        &self,
        catalog: &ConnectionCatalog,
        mode: ConnMode,
        now: Timestamp,
    ) -> Option<usize> {
        self.candidates
            .iter()
            .enumerate()
            .filter(|(_, cand)| cand.retries_left > 0 && cand.retry_at <= now)
            .filter_map(|(i, cand)| catalog.get(cand.conn).map(|c| (i, cand, c)))
            .filter(|(_, _, c)| c.mode == mode && c.is_ready(now))
            .max_by(|a, b| {
                (a.2.rank + a.1.retries_left)
                    .cmp(&(b.2.rank + b.1.retries_left))
                    .then(b.0.cmp(&a.0))
            })
            .map(|(i, _, _)| i)
    }
}

/// Everything a device needs to run one request.
#[derive(Debug, Clone, PartialEq)]
pub struct Binding {
    pub request: CommRequest,
    pub conn: ConnId,
    pub connstr: String,
    pub data_timeout: Option<i64>,
}

#[derive(Debug, Default)]
pub struct RequestQueue {
    reqs: Vec<CommRequest>,
    next_id: ReqId,
}

impl RequestQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queues a request. Duplicates and requests no connection can serve are rejected.
    pub fn submit(
        &mut self,
        mut req: CommRequest,
        catalog: &ConnectionCatalog,
        now: Timestamp,
        devices: &[RxAvailability],
    ) -> Result<ReqId, CommsError> {
        if let Some(existing) = self.reqs.iter().find(|r| r.is_same(&req)) {
            debug!(request = existing.id, "duplicate request ignored");
            return Err(CommsError::Duplicate(req.describe(now)));
        }
        self.next_id += 1;
        req.id = self.next_id;
        req.build_candidates(catalog, now, devices);
        if req.candidates.is_empty() {
            warn!(
                station = req.station,
                "request rejected, no viable connection: {}",
                req.describe(now)
            );
            return Err(CommsError::NoViableConnection {
                station: req.station,
            });
        }
        req.queued_at = now;
        req.attempt_in_progress = false;
        req.completed = false;
        req.rx_device = None;
        info!(request = req.id, "request queued: {}", req.describe(now));
        let id = req.id;
        self.reqs.push(req);
        Ok(id)
    }

    pub fn get(&self, id: ReqId) -> Option<&CommRequest> {
        self.reqs.iter().find(|r| r.id == id)
    }

    pub fn get_mut(&mut self, id: ReqId) -> Option<&mut CommRequest> {
        self.reqs.iter_mut().find(|r| r.id == id)
    }

    pub fn iter(&self) -> impl Iterator<Item = &CommRequest> {
        self.reqs.iter()
    }

    pub fn len(&self) -> usize {
        self.reqs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.reqs.is_empty()
    }

    /// Requests not currently being attempted.
    pub fn waiting(&self) -> usize {
        self.reqs.iter().filter(|r| !r.attempt_in_progress).count()
    }

    pub fn clear(&mut self) {
        self.reqs.clear();
    }

    /// Among queued requests not in progress, the one a device of `mode` could take,
    /// preferring the longest since its last attempt and then queue order.
    pub fn best_for_device(
        &self,
        mode: ConnMode,
        catalog: &ConnectionCatalog,
        now: Timestamp,
    ) -> Option<ReqId> {
        self.reqs
            .iter()
            .filter(|r| !r.attempt_in_progress && !r.completed)
            .filter(|r| r.pick_for_mode(catalog, mode, now).is_some())
            .min_by_key(|r| r.last_attempt)
            .map(|r| r.id)
    }

    /// Marks request `id` as being attempted by `device` over the best compatible candidate.
    pub fn bind(
        &mut self,
        id: ReqId,
        device: DeviceId,
        mode: ConnMode,
        catalog: &mut ConnectionCatalog,
        now: Timestamp,
    ) -> Option<Binding> {
        let req = self.reqs.iter_mut().find(|r| r.id == id)?;
        let idx = req.pick_for_mode(catalog, mode, now)?;
        let cand = req.candidates.get_mut(idx)?;
        cand.retries_left -= 1;
        cand.retry_at = now + CANDIDATE_RETRY_SECS;
        cand.dev_avail = now + DEVICE_AVAIL_SECS;
        let conn_id = cand.conn;
        let conn = catalog.get_mut(conn_id)?;
        conn.in_use = true;
        conn.attempts += 1;
        conn.ready_at = now + conn.spacing;
        req.attempt_in_progress = true;
        req.last_attempt = now;
        req.current = Some(conn_id);
        req.rx_device = Some(device);
        let mut request = req.clone();
        request.candidates.clear();
        Some(Binding {
            request,
            conn: conn_id,
            connstr: conn.connstr.clone(),
            data_timeout: conn.data_timeout,
        })
    }

    /// Records how a device finished with a request.
    pub fn record_outcome(
        &mut self,
        id: ReqId,
        completed: bool,
        catalog: &mut ConnectionCatalog,
        now: Timestamp,
    ) {
        let Some(req) = self.get_mut(id) else {
            return;
        };
        let conn = req.current.and_then(|c| catalog.get_mut(c));
        if completed {
            req.completed = true;
            if let Some(conn) = conn {
                conn.successes += 1;
            }
        } else {
            req.last_attempt = now;
            if let Some(conn) = conn {
                conn.fails += 1;
            }
        }
    }

    /// Detaches a request from its device. Completed requests leave the queue.
    pub fn release(
        &mut self,
        id: ReqId,
        catalog: &mut ConnectionCatalog,
        now: Timestamp,
    ) -> Option<CommRequest> {
        let pos = self.reqs.iter().position(|r| r.id == id)?;
        let req = &mut self.reqs[pos];
        if let Some(conn) = req.current.take().and_then(|c| catalog.get_mut(c)) {
            conn.in_use = false;
        }
        req.attempt_in_progress = false;
        req.rx_device = None;
        if req.completed {
            info!(request = id, "request completed: {}", req.describe(now));
            return Some(self.reqs.remove(pos));
        }
        req.last_attempt = now;
        req.candidates.retain(|c| c.retries_left > 0);
        None
    }

    /// Refuses while an attempt is in progress.
    pub fn delete(&mut self, id: ReqId) -> Result<CommRequest, CommsError> {
        let pos = self
            .reqs
            .iter()
            .position(|r| r.id == id)
            .ok_or(CommsError::NoSuchRequest(id))?;
        if self.reqs[pos].attempt_in_progress {
            return Err(CommsError::RequestBusy(id));
        }
        Ok(self.reqs.remove(pos))
    }

    /// Drops stale bindings and requests with no candidates left. `bound_to` reports
    /// which request a device currently holds.
    pub fn purge(
        &mut self,
        catalog: &mut ConnectionCatalog,
        bound_to: impl Fn(DeviceId) -> Option<Option<ReqId>>,
        now: Timestamp,
    ) -> Vec<CommRequest> {
        for req in self.reqs.iter_mut() {
            if !req.attempt_in_progress {
                continue;
            }
            let orphaned = match req.rx_device {
                None => true,
                // `None` means the device state is unknown this sweep; leave it alone.
                Some(dev) => matches!(bound_to(dev), Some(held) if held != Some(req.id)),
            };
            if orphaned {
                warn!(request = req.id, device = ?req.rx_device, "orphaned request unbound");
                if let Some(conn) = req.current.take().and_then(|c| catalog.get_mut(c)) {
                    conn.in_use = false;
                }
                req.attempt_in_progress = false;
                req.rx_device = None;
                req.last_attempt = now;
            }
        }
        let (dead, live): (Vec<_>, Vec<_>) = std::mem::take(&mut self.reqs)
            .into_iter()
            .partition(|r| !r.attempt_in_progress && r.candidates.is_empty());
        self.reqs = live;
        for r in &dead {
            warn!(request = r.id, "request dropped, connections exhausted: {}", r.describe(now));
        }
        dead
    }

    pub fn dump(&self, now: Timestamp) -> String {
        self.reqs
            .iter()
            .map(|r| {
                format!(
                    "{} {}{}",
                    r.describe(now),
                    if r.attempt_in_progress { "ACTIVE" } else { "WAITING" },
                    r.rx_device
                        .map(|d| format!(" rxdev={d}"))
                        .unwrap_or_default()
                )
            })
            .join("\n")
    }
}
