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

//! The outbound session: serves filtered scans to one consumer.
//!
//! A txdevice either dials out to a fixed consumer ("calling mode", always
//! semi-permanent) or waits in the listening pool for the manager to hand it a call.
//! A caller then either subscribes (`RPQUERY: SEMIPERMANENT ...`) or asks for one
//! scan with a structured query.

use crate::alert::{AlertState, AlertStatus};
use crate::clock::{Timestamp, calendar};
use crate::codec::RapicLineCodec;
use crate::device::{
    CommEvent, DeviceCommand, DeviceEnv, DeviceKind, DeviceSnapshot, Mailbox, ScanSink,
};
use crate::filter::{FILTER_PREFIX, ScanFilter, any_match};
use crate::request::{CommRequest, QUERY_PREFIX, SEMI_PERM_QUERY};
use crate::scan::{AckMatch, Scan, check_ack, source};
use crate::transport::Transport;
use crate::types::{CommStatus, ConnMode, DeviceId, RpScanType, ServiceType, ScanType};
use crate::error::TransportError;
use bytes::{Buf, Bytes, BytesMut};
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::codec::Decoder;
use tracing::{debug, info, trace, warn};

/// Absolute cap on queued scans, whatever the per-product limit.
pub const SCAN_Q_HARD_LIMIT: usize = 200;
pub const DEFAULT_MAX_QUEUE: usize = 16;
/// Idle peers are dropped after this long without traffic.
pub const RDR_STAT_TIMEOUT: i64 = 60;
const MSSG_INTERVAL: i64 = 10;
/// A scan that makes no progress for this long is abandoned.
const SCAN_CHANGE_TIMEOUT: i64 = 150;
const ACK_FAIL_LIMIT: u32 = 3;
const TX_CHUNK: usize = 4096;
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
/// Terminates every scan on the wire.
const EOT: u8 = 0x04;
/// An on-demand device that has not been used by then is retired.
pub const TRANSIENT_TIMEOUT: i64 = 600;
pub const REFUSAL: &str = "MSSG: 9 Sorry,  no 3D-Rapic data splits free...BYE\n";

#[derive(Debug, Clone, PartialEq)]
pub struct TxOptions {
    pub description: String,
    pub expect_ack: bool,
    pub loop_delay: f64,
    pub fail_sound: Option<String>,
    pub ackfail_sound: Option<String>,
    pub cleared_sound: Option<String>,
    pub ackfail_timeout: i64,
    pub reconn_period: i64,
    pub reconn_delay: i64,
    pub send_tx_stn_set: bool,
    pub send_ref_time: bool,
    pub suppress_alerts: bool,
    pub silence_alerts: bool,
    pub realert_period: i64,
    pub query_mode_timeout: i64,
    pub debug: i32,
    pub max_queue: usize,
    pub transient: bool,
}

impl Default for TxOptions {
    fn default() -> Self {
        Self {
            description: String::new(),
            expect_ack: false,
            loop_delay: 0.5,
            fail_sound: None,
            ackfail_sound: None,
            cleared_sound: None,
            ackfail_timeout: 30,
            reconn_period: 10,
            reconn_delay: 2,
            send_tx_stn_set: false,
            send_ref_time: false,
            suppress_alerts: false,
            silence_alerts: false,
            realert_period: crate::alert::DEFAULT_REALERT_SECS,
            query_mode_timeout: 5,
            debug: 0,
            max_queue: DEFAULT_MAX_QUEUE,
            transient: false,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TxStats {
    pub bytes: u64,
    pub scans: u64,
    pub connects: u64,
    pub ack_fails: u64,
    pub evicted: u64,
}

/// The scan being streamed and how far it has got.
struct TxScan {
    scan: Arc<Scan>,
    data: Bytes,
    offset: usize,
    last_progress: Timestamp,
    sent: bool,
}

pub struct TxDevice {
    pub id: DeviceId,
    pub mode: ConnMode,
    pub port_name: String,
    pub opts: TxOptions,
    pub filters: Vec<ScanFilter>,
    pub stats: TxStats,
    env: DeviceEnv,
    mailbox: Mailbox,
    transport: Box<dyn Transport>,
    codec: RapicLineCodec,
    rxbuf: BytesMut,
    /// Control lines not yet accepted by the link.
    outbox: BytesMut,
    status: CommStatus,
    enabled: bool,
    stopped: bool,
    /// Dial-out target; set for calling-mode devices.
    target: Option<String>,
    /// A connect to `target` still in progress.
    dialing: bool,
    listening: bool,
    semi_perm: bool,
    query: Option<CommRequest>,
    query_deadline: Option<Timestamp>,
    temp_filters: Vec<ScanFilter>,
    queue: VecDeque<Arc<Scan>>,
    tx: Option<TxScan>,
    ack_deadline: Option<Timestamp>,
    ack_fail_count: u32,
    expect_ack: bool,
    tx_complete_scans: bool,
    latest_only: bool,
    allow_replay: bool,
    recent_from: Timestamp,
    rdr_stat_request: bool,
    rdr_stat_timeout: Timestamp,
    mssg_time: Timestamp,
    retry_at: Timestamp,
    disconnected_at: Timestamp,
    pending_connect: bool,
    disconnect_flag: bool,
    reconnect_flag: bool,
    listen_flag: bool,
    created_at: Timestamp,
    served: bool,
    last_sent: String,
    alert: AlertState,
}

impl TxDevice {
    pub fn new(
        id: DeviceId,
        mode: ConnMode,
        port_name: &str,
        opts: TxOptions,
        transport: Box<dyn Transport>,
        mailbox: Mailbox,
        env: DeviceEnv,
    ) -> Self {
        let alert = AlertState {
            realert_period: opts.realert_period,
            suppressed: opts.suppress_alerts,
            silenced: opts.silence_alerts,
            fail_sound: opts.fail_sound.clone(),
            cleared_sound: opts.cleared_sound.clone(),
            ackfail_sound: opts.ackfail_sound.clone(),
            ..Default::default()
        };
        let created_at = env.now();
        let expect_ack = opts.expect_ack;
        Self {
            id,
            mode,
            port_name: port_name.to_string(),
            opts,
            filters: vec![],
            stats: TxStats::default(),
            env,
            mailbox,
            transport,
            codec: RapicLineCodec::default(),
            rxbuf: BytesMut::with_capacity(1024),
            outbox: BytesMut::new(),
            status: CommStatus::Idle,
            enabled: false,
            stopped: false,
            target: None,
            dialing: false,
            listening: false,
            semi_perm: false,
            query: None,
            query_deadline: None,
            temp_filters: vec![],
            queue: VecDeque::new(),
            tx: None,
            ack_deadline: None,
            ack_fail_count: 0,
            expect_ack,
            tx_complete_scans: true,
            latest_only: false,
            allow_replay: false,
            recent_from: 0,
            rdr_stat_request: false,
            rdr_stat_timeout: 0,
            mssg_time: 0,
            retry_at: 0,
            disconnected_at: 0,
            pending_connect: false,
            disconnect_flag: false,
            reconnect_flag: false,
            listen_flag: false,
            created_at,
            served: false,
            last_sent: String::new(),
            alert,
        }
    }

    pub fn label(&self) -> String {
        if self.opts.description.is_empty() {
            format!("txdev{}", self.id)
        } else {
            self.opts.description.clone()
        }
    }

    pub fn status(&self) -> CommStatus {
        self.status
    }

    pub fn alert(&self) -> &AlertState {
        &self.alert
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped
    }

    pub fn is_listening(&self) -> bool {
        self.listening && self.enabled && !self.stopped
    }

    pub fn queue_len(&self) -> usize {
        self.queue.len()
    }

    pub fn queued(&self) -> impl Iterator<Item = &Arc<Scan>> {
        self.queue.iter()
    }

    fn calling_mode(&self) -> bool {
        self.target.is_some()
    }

    /// An on-demand device that has finished its call, or was never used in time.
    pub fn is_retired(&self, now: Timestamp) -> bool {
        if !self.opts.transient || self.transport.is_connected() {
            return false;
        }
        self.served || now - self.created_at > TRANSIENT_TIMEOUT
    }

    fn active_filters(&self) -> &[ScanFilter] {
        if self.temp_filters.is_empty() {
            &self.filters
        } else {
            &self.temp_filters
        }
    }

    fn wants(&self, scan: &Scan) -> bool {
        let filters = self.active_filters();
        filters.is_empty() || any_match(filters, scan)
    }

    /// Scans are only held for a live peer or a calling-mode feed that will reconnect.
    fn accepting(&self) -> bool {
        self.enabled && !self.stopped && (self.transport.is_connected() || self.calling_mode())
    }

    pub fn snapshot(&self) -> DeviceSnapshot {
        DeviceSnapshot {
            id: self.id,
            kind: DeviceKind::Tx,
            mode: self.mode,
            description: self.label(),
            status: self.status,
            service: if self.semi_perm {
                ServiceType::SemiPerm
            } else if self.query.is_some() {
                ServiceType::Request
            } else {
                ServiceType::None
            },
            enabled: self.enabled,
            connected: self.transport.is_connected(),
            peer: self.transport.peer(),
            request: None,
            alert: self.alert.status,
            alert_text: self.alert.text.clone(),
            bytes: self.stats.bytes,
            scans: self.stats.scans,
            radar_name: self.last_sent.clone(),
            queue_len: self.queue.len(),
            semi_perm: self.semi_perm,
            retired: self.is_retired(self.env.now()),
        }
    }

    pub fn tick(&mut self) {
        let now = self.env.now();
        for cmd in self.mailbox.drain() {
            self.apply(cmd, now);
        }
        if self.stopped {
            self.cancel_dial();
            if self.transport.is_connected() {
                self.transport.disconnect();
            }
            self.listening = false;
            return;
        }
        if !self.enabled {
            self.cancel_dial();
            if self.transport.is_connected() {
                info!(device = self.id, "disabled, disconnecting");
                self.transport.disconnect();
                self.disconnected_at = now;
            }
            self.listening = false;
            self.set_status(CommStatus::Disabled);
            return;
        }
        if self.status == CommStatus::Disabled {
            self.set_status(CommStatus::Idle);
        }
        if self.disconnect_flag {
            self.disconnect_flag = false;
            self.drop_peer(now);
            self.set_status(CommStatus::Idle);
        }
        if self.reconnect_flag {
            self.reconnect_flag = false;
            self.drop_peer(now);
            self.retry_at = now;
        }
        if self.pending_connect {
            self.pending_connect = false;
            self.dial(now);
        } else {
            self.poll_dial(now);
        }
        if self.dialing {
            return;
        }
        if let Some(deadline) = self.query_deadline
            && now > deadline
        {
            info!(device = self.id, "no query received from peer");
            self.query_deadline = None;
        }
        self.check_data_rx(now);
        if self.transport.is_connected() && !self.calling_mode() && now > self.rdr_stat_timeout {
            warn!(device = self.id, peer = %self.transport.peer(), "status failed, resetting listen");
            if self.semi_perm {
                let text = format!("{} handshake with remote failed, disconnecting", self.label());
                self.post_alert(AlertStatus::StatFailed, &text, now);
            }
            self.drop_peer(now);
            self.set_status(CommStatus::StatusFail);
        }
        self.check_data_tx(now);
        if self.listen_flag
            || (!self.calling_mode()
                && !self.opts.transient
                && !self.listening
                && !self.transport.is_connected())
        {
            self.listen_flag = false;
            self.enter_listen(now);
        }
    }

    fn apply(&mut self, cmd: DeviceCommand, now: Timestamp) {
        debug!(device = self.id, ?cmd, "command");
        match cmd {
            DeviceCommand::Connect(target) => {
                self.target = Some(target);
                self.listening = false;
                self.semi_perm = true;
                self.pending_connect = true;
            }
            DeviceCommand::Request(b) => {
                warn!(device = self.id, "txdevice cannot service request {}", b.request.id);
            }
            DeviceCommand::Disconnect => self.disconnect_flag = true,
            DeviceCommand::Reconnect => self.reconnect_flag = true,
            DeviceCommand::Clear => {
                self.queue.clear();
                self.tx = None;
                self.ack_deadline = None;
            }
            DeviceCommand::Listen => {
                if !self.calling_mode() {
                    self.listen_flag = true;
                }
            }
            DeviceCommand::Accept(t) => self.accept(t, now),
            DeviceCommand::Enable => self.enabled = true,
            DeviceCommand::Disable => self.enabled = false,
            DeviceCommand::Stop => {
                self.stopped = true;
                self.pending_connect = false;
                self.listen_flag = false;
                self.listening = false;
            }
        }
    }

    fn set_status(&mut self, status: CommStatus) {
        if self.status == status {
            return;
        }
        info!(device = self.id, state = %status, was = %self.status, "txdevice state");
        self.status = status;
        self.env.emit(CommEvent::StateChanged {
            device: self.id,
            status,
        });
    }

    fn post_alert(&mut self, status: AlertStatus, text: &str, now: Timestamp) {
        let who = self.label();
        let switches = self.env.alert_switches();
        self.alert
            .post(status, text, now, switches, self.env.sounds.as_ref(), &who);
    }

    fn clear_alert(&mut self, now: Timestamp) {
        let who = self.label();
        let switches = self.env.alert_switches();
        self.alert
            .clear(now, switches, self.env.sounds.as_ref(), &who);
    }

    /// Queues a control line; it goes out ahead of any further scan data.
    fn write_str(&mut self, s: &str) {
        self.outbox.extend_from_slice(s.as_bytes());
    }

    /// Writes queued control lines. True once the link has taken all of them.
    fn flush_outbox(&mut self, now: Timestamp) -> bool {
        while !self.outbox.is_empty() {
            match self.transport.write(&self.outbox) {
                Ok(0) => return false,
                Ok(n) => {
                    self.outbox.advance(n);
                    self.stats.bytes += n as u64;
                }
                Err(e) => {
                    self.conn_lost(&e, now);
                    return false;
                }
            }
        }
        true
    }

    fn conn_lost(&mut self, e: &TransportError, now: Timestamp) {
        warn!(device = self.id, "write failed: {e}");
        let text = format!("{} conn. lost while writing data", self.label());
        self.post_alert(AlertStatus::ConnLost, &text, now);
        self.set_status(CommStatus::ConnLost);
        self.transport.disconnect();
        self.outbox.clear();
        self.disconnected_at = now;
    }

    fn enter_listen(&mut self, now: Timestamp) {
        if self.transport.is_connected() {
            self.drop_peer(now);
        }
        self.reset_session();
        self.listening = true;
        self.set_status(CommStatus::Listening);
    }

    fn accept(&mut self, mut t: Box<dyn Transport>, now: Timestamp) {
        let takes_calls = self.listening || (self.opts.transient && !self.served);
        if !takes_calls || !self.enabled || self.transport.is_connected() {
            warn!(device = self.id, peer = %t.peer(), "not listening, call refused");
            let _ = t.write(REFUSAL.as_bytes());
            t.disconnect();
            return;
        }
        info!(device = self.id, peer = %t.peer(), "call accepted");
        self.transport = t;
        self.listening = false;
        self.check_new_connection(now);
    }

    fn dial(&mut self, now: Timestamp) {
        let Some(target) = self.target.clone() else {
            return;
        };
        self.set_status(CommStatus::Connecting);
        match self.transport.connect(&target, CONNECT_TIMEOUT) {
            Ok(()) => {
                self.dialing = true;
                self.poll_dial(now);
            }
            Err(e) => self.dial_failed(&e, now),
        }
    }

    fn poll_dial(&mut self, now: Timestamp) {
        if !self.dialing {
            return;
        }
        match self.transport.poll_connect() {
            Ok(true) => {
                self.dialing = false;
                info!(device = self.id, peer = %self.transport.peer(), "connected");
                self.retry_at = 0;
                self.check_new_connection(now);
            }
            Ok(false) => {}
            Err(e) => {
                self.dialing = false;
                self.dial_failed(&e, now);
            }
        }
    }

    fn cancel_dial(&mut self) {
        if self.dialing {
            self.dialing = false;
            self.transport.disconnect();
        }
    }

    fn dial_failed(&mut self, e: &TransportError, now: Timestamp) {
        debug!(device = self.id, peer = %self.transport.peer(), "connect failed: {e}");
        self.post_alert(AlertStatus::ReconnFailed, "Reconnect attempt failed", now);
        self.set_status(CommStatus::ReconnFailed);
        self.retry_at = now + self.opts.reconn_period;
        self.disconnected_at = now;
    }

    fn check_new_connection(&mut self, now: Timestamp) {
        self.codec.reset();
        self.rxbuf.clear();
        self.outbox.clear();
        self.clear_alert(now);
        self.set_status(CommStatus::Connected);
        self.stats.connects += 1;
        self.served = true;
        self.rdr_stat_timeout = now + RDR_STAT_TIMEOUT;
        self.mssg_time = now + MSSG_INTERVAL;
        self.tx_complete_scans = true;
        self.latest_only = false;
        self.rdr_stat_request = true;
        if let Some(t) = self.tx.as_mut() {
            t.offset = 0;
            t.sent = false;
        }
        if self.calling_mode() {
            self.semi_perm = true;
        } else {
            self.query_deadline = Some(now + self.opts.query_mode_timeout);
        }
    }

    /// Forgets everything the last peer asked for.
    fn reset_session(&mut self) {
        self.tx_complete_scans = true;
        self.latest_only = false;
        self.allow_replay = false;
        self.recent_from = 0;
        self.expect_ack = self.opts.expect_ack;
        if !self.semi_perm {
            self.tx = None;
        } else if let Some(t) = self.tx.as_mut() {
            t.offset = 0;
            t.sent = false;
        }
        if !self.calling_mode() {
            self.semi_perm = false;
            self.queue.clear();
            self.tx = None;
        }
        self.temp_filters.clear();
        self.outbox.clear();
        self.query = None;
        self.query_deadline = None;
        self.ack_deadline = None;
        self.rdr_stat_request = false;
        self.alert.realert_at = 0;
    }

    fn drop_peer(&mut self, now: Timestamp) {
        self.cancel_dial();
        if self.transport.is_connected() {
            self.transport.disconnect();
        }
        self.disconnected_at = now;
        self.reset_session();
    }

    fn check_data_rx(&mut self, now: Timestamp) {
        if !self.transport.is_connected() {
            return;
        }
        if let Err(e) = self.transport.read_into(&mut self.rxbuf) {
            info!(device = self.id, "read failed: {e}");
            let text = format!("{} conn. lost while reading data", self.label());
            self.post_alert(AlertStatus::ConnLost, &text, now);
            self.disconnected_at = now;
            self.set_status(CommStatus::ConnLost);
            return;
        }
        loop {
            match self.codec.decode(&mut self.rxbuf) {
                Ok(Some(line)) => self.new_line(&line, now),
                Ok(None) => break,
                Err(e) => {
                    warn!(device = self.id, "line assembly failed: {e}");
                    break;
                }
            }
        }
    }

    /// Handles one line from the peer.
    pub fn new_line(&mut self, line: &str, now: Timestamp) {
        trace!(device = self.id, "rx: {line}");
        self.rdr_stat_timeout = now + RDR_STAT_TIMEOUT;
        if line.contains("RDRSTAT") {
            self.rdr_stat_request = true;
            return;
        }
        if line.contains("RDRSCAN_ACK") {
            self.handle_ack(line, now);
            return;
        }
        let is_filter = line
            .trim_start_matches('*')
            .get(..FILTER_PREFIX.len())
            .is_some_and(|p| p.eq_ignore_ascii_case(FILTER_PREFIX));
        if is_filter {
            match ScanFilter::decode(line) {
                Ok(f) => {
                    debug!(device = self.id, "peer filter {}", f.encode());
                    self.temp_filters.push(f);
                }
                Err(e) => warn!(device = self.id, "bad filter from peer: {e}"),
            }
            return;
        }
        if line.contains(QUERY_PREFIX) {
            if line.contains("SEMIPERMANENT") || line.contains(SEMI_PERM_QUERY) {
                info!(device = self.id, peer = %self.transport.peer(), "semi-permanent session");
                self.semi_perm = true;
                self.query = None;
                self.query_deadline = None;
            } else {
                match CommRequest::parse_query(line) {
                    Ok(q) => {
                        info!(device = self.id, "query: {}", q.describe(now));
                        self.semi_perm = false;
                        self.query = Some(q);
                        self.query_deadline = None;
                    }
                    Err(e) => warn!(device = self.id, "bad query: {e}"),
                }
            }
        }
        self.parse_modifiers(line, now);
    }

    fn parse_modifiers(&mut self, line: &str, now: Timestamp) {
        for token in line.split_whitespace() {
            let (key, value) = token.split_once('=').unwrap_or((token, ""));
            match key {
                "TXCOMPLETESCANS" => self.tx_complete_scans = value != "0",
                "TXLATESTSCANONLY" => {
                    self.latest_only = true;
                    self.prune_to_latest();
                }
                "EXPECTACK" => self.expect_ack = value == "1",
                "ALLOWREPLAY" => self.allow_replay = value == "1",
                "SendRecentDataMins" => {
                    if let Ok(mins) = value.parse::<i64>()
                        && self.recent_from == 0
                        && mins > 0
                    {
                        self.recent_from = now - mins * 60;
                    }
                }
                "SendRecentDataFrom" => {
                    if let Some(t) = crate::scan::parse_timestamp(value) {
                        self.recent_from = t;
                    }
                }
                _ => {}
            }
        }
    }

    fn prune_to_latest(&mut self) {
        let keep = self.queue.len().saturating_sub(1);
        let in_flight = self.tx.as_ref().map(|t| t.scan.id);
        let mut i = 0;
        self.queue.retain(|s| {
            i += 1;
            i > keep || Some(s.id) == in_flight
        });
    }

    fn handle_ack(&mut self, line: &str, now: Timestamp) {
        let Some(t) = self.tx.as_ref().filter(|t| t.sent) else {
            debug!(device = self.id, "unsolicited ack: {line}");
            return;
        };
        match check_ack(line, &t.scan) {
            AckMatch::Ok => {
                trace!(device = self.id, "ack ok");
                let id = t.scan.id;
                self.ack_fail_count = 0;
                self.ack_deadline = None;
                self.remove_scan(id);
                self.tx = None;
                self.post_alert(AlertStatus::ClearAckFail, "Scan acknowledged OK", now);
                self.set_status(CommStatus::Connected);
                self.send_preamble(now);
            }
            AckMatch::Mismatch => self.ack_failed(now, &format!("ack mismatch: {line}")),
            AckMatch::Nacked => self.ack_failed(now, "scan rejected by peer"),
        }
    }

    fn ack_failed(&mut self, now: Timestamp, reason: &str) {
        self.ack_fail_count += 1;
        self.stats.ack_fails += 1;
        self.ack_deadline = None;
        let text = format!("{} ack failed: {reason}", self.label());
        self.post_alert(AlertStatus::AckFail, &text, now);
        self.set_status(CommStatus::AckFail);
        if let Some(t) = self.tx.take() {
            if self.ack_fail_count >= ACK_FAIL_LIMIT {
                warn!(
                    device = self.id,
                    "dropping {} after {} ack failures",
                    t.scan.describe(),
                    self.ack_fail_count
                );
                self.remove_scan(t.scan.id);
                self.ack_fail_count = 0;
            } else {
                self.tx = Some(t);
            }
        }
        // Force a fresh session; the scan is resent from the start.
        if self.transport.is_connected() {
            self.transport.disconnect();
        }
        self.disconnected_at = now;
        self.retry_at = now;
    }

    fn remove_scan(&mut self, id: uuid::Uuid) {
        self.queue.retain(|s| s.id != id);
    }

    fn eligible(&self, scan: &Scan) -> bool {
        self.recent_from == 0 || scan.scan_time == 0 || scan.scan_time >= self.recent_from
    }

    fn get_filter_tx_scan(&self) -> Option<Arc<Scan>> {
        self.queue
            .iter()
            .find(|s| self.wants(s) && self.eligible(s))
            .cloned()
    }

    fn get_query_scan(&self, q: &CommRequest) -> Option<Arc<Scan>> {
        self.queue
            .iter()
            .filter(|s| s.station == q.station)
            .filter(|s| query_matches_type(q.scan_type, s))
            .max_by_key(|s| s.scan_time)
            .cloned()
    }

    fn start_tx(&mut self, scan: Arc<Scan>, now: Timestamp) {
        debug!(device = self.id, "sending {}", scan.describe());
        let mut data = scan.text().into_bytes();
        data.push(EOT);
        let data = Bytes::from(data);
        self.tx = Some(TxScan {
            scan,
            data,
            offset: 0,
            last_progress: now,
            sent: false,
        });
    }

    /// Optional reference time and station set lines ahead of a scan.
    fn send_preamble(&mut self, now: Timestamp) {
        if self.opts.send_ref_time {
            self.write_str(&ref_time_line(now));
        }
        if self.opts.send_tx_stn_set {
            let line = tx_stn_set(self.active_filters());
            self.write_str(&line);
        }
    }

    fn check_data_tx(&mut self, now: Timestamp) {
        if !self.transport.is_connected() {
            self.reconnect_if_due(now);
            return;
        }
        if let Some(deadline) = self.ack_deadline {
            if now > deadline {
                self.ack_failed(now, "no acknowledgement received");
            }
            return;
        }

        if self.tx.is_none() {
            if self.semi_perm {
                if let Some(scan) = self.get_filter_tx_scan() {
                    if !self.expect_ack {
                        self.send_preamble(now);
                    }
                    self.start_tx(scan, now);
                }
            } else if let Some(q) = self.query.clone() {
                match self.get_query_scan(&q) {
                    Some(scan) => {
                        if !self.expect_ack {
                            self.send_preamble(now);
                        }
                        self.start_tx(scan, now);
                    }
                    None => {
                        info!(device = self.id, "query failed: {}", q.describe(now));
                        let text = q.query_string();
                        let body = text.trim_start_matches(QUERY_PREFIX).trim_start();
                        self.write_str(&format!("RPQUERYFAILED: {body}"));
                        if !self.flush_outbox(now) {
                            warn!(device = self.id, "query failure notice not delivered");
                        }
                        self.set_status(CommStatus::ReqFailed);
                        self.query = None;
                        self.drop_peer(now);
                        return;
                    }
                }
            }
        }

        if self.tx.is_none() {
            if self.rdr_stat_request {
                self.rdr_stat_request = false;
                let reply = format!(
                    "MSSG: 30 Status information following - {}\nEND STATUS\n",
                    rapic_common::build::txdevice_banner()
                );
                self.write_str(&reply);
            }
            if !self.calling_mode() && now >= self.mssg_time && self.outbox.is_empty() {
                let left = (self.rdr_stat_timeout - now).max(0);
                self.write_str(&format!(
                    "MSSG: 17 Disconnection will occur in {left} seconds\n"
                ));
                self.mssg_time = now + MSSG_INTERVAL;
            }
            self.flush_outbox(now);
            return;
        }

        self.stream(now);
    }

    fn stream(&mut self, now: Timestamp) {
        if !self.flush_outbox(now) {
            return;
        }
        let Some(t) = self.tx.as_mut() else {
            return;
        };
        if t.offset < t.data.len() {
            let end = (t.offset + TX_CHUNK).min(t.data.len());
            let chunk = t.data.slice(t.offset..end);
            match self.transport.write(&chunk) {
                Ok(n) => {
                    t.offset += n;
                    if n > 0 {
                        t.last_progress = now;
                    }
                    self.stats.bytes += n as u64;
                    self.mssg_time = now + MSSG_INTERVAL;
                    self.rdr_stat_timeout = now + RDR_STAT_TIMEOUT;
                }
                Err(e) => {
                    self.conn_lost(&e, now);
                    return;
                }
            }
            if t.offset < t.data.len() {
                if now - t.last_progress > SCAN_CHANGE_TIMEOUT {
                    warn!(device = self.id, "scan stalled, abandoning {}", t.scan.describe());
                    self.tx = None;
                }
                return;
            }
        }
        if t.sent {
            return;
        }
        t.sent = true;
        let scan = t.scan.clone();
        self.stats.scans += 1;
        self.last_sent = scan.describe();
        if self.semi_perm {
            if self.expect_ack {
                self.ack_deadline = Some(now + self.opts.ackfail_timeout);
            } else {
                self.remove_scan(scan.id);
                self.tx = None;
            }
        } else {
            info!(device = self.id, "Send complete, Disconnecting");
            self.remove_scan(scan.id);
            self.tx = None;
            self.set_status(CommStatus::ReqComplete);
            self.drop_peer(now);
            self.set_status(CommStatus::Idle);
        }
    }

    fn reconnect_if_due(&mut self, now: Timestamp) {
        if !self.calling_mode() || self.pending_connect {
            return;
        }
        if now < self.retry_at || now < self.disconnected_at + self.opts.reconn_delay {
            return;
        }
        if self.status == CommStatus::Connected || self.status == CommStatus::ConnLost {
            self.post_alert(AlertStatus::ConnLost, "Connection lost,  attempting reconnect", now);
        }
        self.dial(now);
    }

    /// Places `scan` on the queue, evicting the oldest of the same product past the limit.
    fn admit(&mut self, scan: &Arc<Scan>) -> bool {
        if self.full() {
            warn!(device = self.id, "queue full, {} dropped", scan.describe());
            return false;
        }
        if self.latest_only {
            self.queue.retain(|s| !s.same_product(scan));
        }
        self.queue.push_back(scan.clone());
        let in_flight = self.tx.as_ref().map(|t| t.scan.id);
        let matching = self
            .queue
            .iter()
            .filter(|s| s.same_product(scan) && Some(s.id) != in_flight)
            .count();
        if matching > self.opts.max_queue.max(1) {
            let oldest = self
                .queue
                .iter()
                .enumerate()
                .filter(|(_, s)| s.same_product(scan) && Some(s.id) != in_flight)
                .min_by_key(|(i, s)| (s.scan_time, *i))
                .map(|(i, _)| i);
            if let Some(i) = oldest
                && let Some(gone) = self.queue.remove(i)
            {
                debug!(device = self.id, "evicted {}", gone.describe());
                self.stats.evicted += 1;
            }
        }
        true
    }
}

impl ScanSink for TxDevice {
    fn new_data_avail(&mut self, scan: &Arc<Scan>) -> bool {
        let wanted = self.accepting() && self.wants(scan);
        if wanted && !self.tx_complete_scans {
            trace!(device = self.id, "scan by scan peer notified of {}", scan.describe());
        }
        wanted
    }

    fn finished_data_avail(&mut self, scan: &Arc<Scan>) -> bool {
        if !self.accepting() || !self.wants(scan) {
            return false;
        }
        if scan.data_source == source::DB && !self.allow_replay {
            return false;
        }
        if self.query.is_some() && !self.semi_perm {
            return false;
        }
        self.admit(scan)
    }

    fn full(&self) -> bool {
        self.queue.len() >= SCAN_Q_HARD_LIMIT
    }
}

fn query_matches_type(wanted: RpScanType, scan: &Scan) -> bool {
    match wanted {
        RpScanType::Vol => scan.scan_type == ScanType::Vol,
        RpScanType::UsrRhi => scan.scan_type == ScanType::Rhi,
        _ => scan.scan_type.is_ppi_like(),
    }
}

/// `RPTXSTNSET:` naming every station the filters admit, or `ANY`.
pub fn tx_stn_set(filters: &[ScanFilter]) -> String {
    if filters.is_empty() || filters.iter().any(ScanFilter::is_open) {
        return "RPTXSTNSET:ANY\r\x04".to_string();
    }
    let mut stations: Vec<i32> = filters.iter().map(|f| f.station).collect();
    stations.dedup();
    let list: String = stations.iter().map(|s| format!(":{s}")).collect();
    format!("RPTXSTNSET{list}\r\x04")
}

/// Reference time line for `t`.
pub fn ref_time_line(t: Timestamp) -> String {
    let (y, mo, d, h, mi, s) = calendar(t);
    format!("RPREFTIME: {d:02}/{mo:02}/{y:04} {h:02}:{mi:02}:{s:02}\r\x04")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alert::LogSoundPlayer;
    use crate::clock::{Clock, ManualClock, from_calendar};
    use crate::device::{CommandSender, GlobalSettings, mailbox};
    use crate::scan::tests::ppi_scan;
    use crate::transport::mock::{MockNet, SharedWire};
    use crate::transport::{Listener, TransportFactory};
    use arc_swap::ArcSwap;
    use pretty_assertions::assert_eq;

    struct Rig {
        dev: TxDevice,
        cmds: CommandSender,
        clock: Arc<ManualClock>,
        net: MockNet,
        listener: Box<dyn Listener>,
        events: flume::Receiver<CommEvent>,
    }

    fn rig(opts: TxOptions) -> Rig {
        let net = MockNet::new();
        let clock = Arc::new(ManualClock::new(1_000));
        let (tx, events) = flume::unbounded();
        let env = DeviceEnv {
            clock: clock.clone(),
            events: tx,
            settings: Arc::new(ArcSwap::from_pointee(GlobalSettings::default())),
            sounds: Arc::new(LogSoundPlayer),
        };
        let (cmds, mb) = mailbox();
        let transport = net.create(ConnMode::Socket).unwrap();
        let dev = TxDevice::new(1, ConnMode::Socket, "15555", opts, transport, mb, env);
        cmds.send(DeviceCommand::Enable);
        let listener = net.bind(15555, 1).unwrap();
        Rig {
            dev,
            cmds,
            clock,
            net,
            listener,
            events,
        }
    }

    /// Takes a call and subscribes it to everything.
    fn subscriber(r: &mut Rig) -> SharedWire {
        r.dev.tick();
        let wire = call(r);
        wire.lock()
            .unwrap()
            .push("RPQUERY: SEMIPERMANENT CONNECTION - SEND ALL DATA\n");
        r.dev.tick();
        output(&wire);
        wire
    }

    fn saw_status(r: &Rig, wanted: CommStatus) -> bool {
        r.events
            .drain()
            .any(|e| matches!(e, CommEvent::StateChanged { status, .. } if status == wanted))
    }

    /// Takes a call into the device, returning the caller's end of the wire.
    fn call(r: &mut Rig) -> SharedWire {
        let wire = r.net.dial_in();
        let t = r.listener.accept().unwrap().unwrap();
        r.cmds.send(DeviceCommand::Accept(t));
        r.dev.tick();
        wire
    }

    fn output(w: &SharedWire) -> String {
        w.lock().unwrap().take_output()
    }

    #[test]
    fn listens_then_serves_a_subscription() {
        let mut r = rig(TxOptions::default());
        r.dev.tick();
        assert_eq!(r.dev.status(), CommStatus::Listening);
        let wire = call(&mut r);
        assert_eq!(r.dev.status(), CommStatus::Connected);
        assert!(output(&wire).starts_with("MSSG: 30 Status information following - 3D-Rapic TxDevice"));

        wire.lock()
            .unwrap()
            .push("RPQUERY: SEMIPERMANENT CONNECTION - SEND ALL DATA\nRPFILTER:3:-1:-1:-1\n");
        r.dev.tick();
        assert!(r.dev.snapshot().semi_perm);

        assert!(r.dev.finished_data_avail(&Arc::new(ppi_scan(3, 30))));
        assert!(!r.dev.finished_data_avail(&Arc::new(ppi_scan(4, 30))));
        r.dev.tick();
        let out = output(&wire);
        assert!(out.starts_with("STNID: 3\n"));
        assert!(out.ends_with("END RADAR IMAGE\n\x04"));
        assert_eq!(r.dev.queue_len(), 0);
        assert_eq!(r.dev.stats.scans, 1);
    }

    #[test]
    fn missing_ack_keeps_scan_and_reconnects() {
        let opts = TxOptions {
            expect_ack: true,
            ..Default::default()
        };
        let mut r = rig(opts);
        r.cmds.send(DeviceCommand::Connect("consumer 1".into()));
        r.dev.tick();
        assert_eq!(r.dev.status(), CommStatus::Connected);
        assert!(r.dev.finished_data_avail(&Arc::new(ppi_scan(3, 30))));
        r.dev.tick();

        r.clock.advance(31);
        r.dev.tick();
        assert_eq!(r.dev.status(), CommStatus::AckFail);
        assert_eq!(r.dev.alert().status, AlertStatus::AckFail);
        assert_eq!(r.dev.queue_len(), 1);

        r.clock.advance(2);
        r.dev.tick();
        assert_eq!(r.net.connects().len(), 2);
        assert_eq!(r.dev.status(), CommStatus::Connected);
        // the held ack failure outlives the reconnect
        assert_eq!(r.dev.alert().status, AlertStatus::AckFail);
    }

    #[test]
    fn matching_ack_releases_scan() {
        let opts = TxOptions {
            expect_ack: true,
            ..Default::default()
        };
        let mut r = rig(opts);
        r.cmds.send(DeviceCommand::Connect("consumer 1".into()));
        r.dev.tick();
        let scan = Arc::new(ppi_scan(3, 30));
        r.dev.finished_data_avail(&scan);
        r.dev.tick();
        let wire = r.net.wire_for("consumer 1").unwrap();
        wire.lock().unwrap().push(&format!("{}\n", scan.ack_line()));
        r.dev.tick();
        assert_eq!(r.dev.queue_len(), 0);
        assert_eq!(r.dev.status(), CommStatus::Connected);
    }

    #[test]
    fn third_ack_failure_drops_scan() {
        let opts = TxOptions {
            expect_ack: true,
            ..Default::default()
        };
        let mut r = rig(opts);
        r.cmds.send(DeviceCommand::Connect("consumer 1".into()));
        r.dev.tick();
        r.dev.finished_data_avail(&Arc::new(ppi_scan(3, 30)));
        let wire = r.net.wire_for("consumer 1").unwrap();
        for _ in 0..3 {
            r.dev.tick();
            assert_eq!(r.dev.queue_len(), 1);
            wire.lock().unwrap().push("RDRSCAN_ACK: 3 03224 12.31 NORMAL\n");
            r.dev.tick();
            assert_eq!(r.dev.status(), CommStatus::AckFail);
            r.clock.advance(2);
            r.dev.tick();
        }
        assert_eq!(r.dev.queue_len(), 0);
        assert_eq!(r.dev.stats.ack_fails, 3);
    }

    #[test]
    fn query_without_data_fails() {
        let mut r = rig(TxOptions::default());
        r.dev.tick();
        let wire = call(&mut r);
        output(&wire);
        wire.lock().unwrap().push("RPQUERY: 3 Comp1 -999.9 1 Latest 0\n");
        r.dev.tick();
        assert_eq!(output(&wire), "RPQUERYFAILED: 3 Comp1 -999.9 1 Latest 0\n");
        assert_eq!(r.dev.status(), CommStatus::Listening);
    }

    #[test]
    fn query_sends_latest_match_and_hangs_up() {
        let mut r = rig(TxOptions::default());
        r.dev.tick();
        let wire = call(&mut r);
        output(&wire);
        r.dev.finished_data_avail(&Arc::new(ppi_scan(3, 10)));
        r.dev.finished_data_avail(&Arc::new(ppi_scan(3, 20)));
        wire.lock().unwrap().push("RPQUERY: 3 Comp1 -999.9 1 Latest 0\n");
        r.dev.tick();
        let out = output(&wire);
        assert!(out.contains("TIME: 12.20"));
        assert!(!wire.lock().unwrap().connected);
        assert_eq!(r.dev.status(), CommStatus::Listening);
    }

    #[test]
    fn calling_device_waits_out_a_slow_connect() {
        let mut r = rig(TxOptions::default());
        r.net.set_slow("consumer 1", true);
        r.cmds.send(DeviceCommand::Connect("consumer 1".into()));
        r.dev.tick();
        assert_eq!(r.dev.status(), CommStatus::Connecting);
        assert!(r.dev.finished_data_avail(&Arc::new(ppi_scan(3, 30))));
        r.clock.advance(3);
        r.dev.tick();
        assert_eq!(r.dev.status(), CommStatus::Connecting);
        assert_eq!(r.net.connects().len(), 1);

        r.net.set_slow("consumer 1", false);
        r.dev.tick();
        assert_eq!(r.dev.status(), CommStatus::Connected);
        assert_eq!(r.net.connects().len(), 1);
        let wire = r.net.wire_for("consumer 1").unwrap();
        assert!(output(&wire).ends_with("END RADAR IMAGE\n\x04"));
        assert_eq!(r.dev.queue_len(), 0);
    }

    #[test]
    fn eviction_takes_oldest_of_product() {
        let opts = TxOptions {
            max_queue: 2,
            ..Default::default()
        };
        let mut r = rig(opts);
        r.net.set_unreachable("consumer 1", true);
        r.cmds.send(DeviceCommand::Connect("consumer 1".into()));
        r.dev.tick();
        let scans: Vec<_> = [20, 10, 30].map(|m| Arc::new(ppi_scan(3, m))).into();
        for s in &scans {
            assert!(r.dev.finished_data_avail(s));
        }
        let other = Arc::new(ppi_scan(4, 5));
        assert!(r.dev.finished_data_avail(&other));
        let left: Vec<_> = r.dev.queued().map(|s| (s.station, s.minute)).collect();
        assert_eq!(left, vec![(3, 20), (3, 30), (4, 5)]);

        // equal times: the first admitted goes
        let same: Vec<_> = (0..3).map(|_| Arc::new(ppi_scan(3, 40))).collect();
        for s in &same {
            r.dev.finished_data_avail(s);
        }
        let ids: Vec<_> = r
            .dev
            .queued()
            .filter(|s| s.minute == 40)
            .map(|s| s.id)
            .collect();
        assert_eq!(ids, vec![same[1].id, same[2].id]);
        assert_eq!(r.dev.stats.evicted, 4);
    }

    #[test]
    fn refuses_calls_when_not_listening() {
        let mut r = rig(TxOptions::default());
        r.net.set_unreachable("consumer 1", true);
        r.cmds.send(DeviceCommand::Connect("consumer 1".into()));
        r.dev.tick();
        let wire = call(&mut r);
        assert_eq!(output(&wire), REFUSAL);
        assert!(!wire.lock().unwrap().connected);
    }

    #[test]
    fn idle_peer_is_warned_then_dropped() {
        let mut r = rig(TxOptions::default());
        r.dev.tick();
        let wire = call(&mut r);
        output(&wire);
        r.clock.advance(10);
        r.dev.tick();
        assert_eq!(output(&wire), "MSSG: 17 Disconnection will occur in 50 seconds\n");
        r.clock.advance(51);
        r.dev.tick();
        assert!(!wire.lock().unwrap().connected);
        assert!(saw_status(&r, CommStatus::StatusFail));
        assert_eq!(r.dev.status(), CommStatus::Listening);
        // only subscribers raise an alert
        assert_eq!(r.dev.alert().status, AlertStatus::Ok);
    }

    #[test]
    fn silent_subscriber_fails_status() {
        let mut r = rig(TxOptions::default());
        let wire = subscriber(&mut r);
        assert!(r.dev.snapshot().semi_perm);
        r.clock.advance(10);
        r.dev.tick();
        assert_eq!(output(&wire), "MSSG: 17 Disconnection will occur in 50 seconds\n");
        r.clock.advance(51);
        r.dev.tick();
        assert!(!wire.lock().unwrap().connected);
        assert!(saw_status(&r, CommStatus::StatusFail));
        assert_eq!(r.dev.alert().status, AlertStatus::StatFailed);
        assert_eq!(r.dev.status(), CommStatus::Listening);
    }

    #[test]
    fn scan_terminator_survives_a_full_link() {
        let mut r = rig(TxOptions::default());
        let wire = subscriber(&mut r);
        let scan = Arc::new(ppi_scan(3, 30));
        let body = scan.text();
        wire.lock().unwrap().room = Some(body.len());
        assert!(r.dev.finished_data_avail(&scan));
        r.dev.tick();
        assert_eq!(output(&wire), body);
        assert_eq!(r.dev.stats.scans, 0);
        assert_eq!(r.dev.queue_len(), 1);

        wire.lock().unwrap().room = None;
        r.dev.tick();
        assert_eq!(output(&wire), "\x04");
        assert_eq!(r.dev.stats.scans, 1);
        assert_eq!(r.dev.queue_len(), 0);
    }

    #[test]
    fn control_lines_go_out_whole_before_the_scan() {
        let opts = TxOptions {
            send_ref_time: true,
            ..Default::default()
        };
        let mut r = rig(opts);
        let wire = subscriber(&mut r);
        let scan = Arc::new(ppi_scan(3, 30));
        wire.lock().unwrap().room = Some(5);
        r.dev.finished_data_avail(&scan);
        r.dev.tick();
        let ref_time = ref_time_line(r.clock.now());
        assert_eq!(output(&wire), &ref_time[..5]);

        wire.lock().unwrap().room = None;
        r.dev.tick();
        assert_eq!(output(&wire), format!("{}{}\x04", &ref_time[5..], scan.text()));
        assert_eq!(r.dev.stats.scans, 1);
    }

    #[test]
    fn failed_write_is_a_lost_connection() {
        let mut r = rig(TxOptions::default());
        r.cmds.send(DeviceCommand::Connect("consumer 1".into()));
        r.dev.tick();
        assert_eq!(r.dev.status(), CommStatus::Connected);
        let wire = r.net.wire_for("consumer 1").unwrap();
        output(&wire);
        wire.lock().unwrap().broken = true;
        assert!(r.dev.finished_data_avail(&Arc::new(ppi_scan(3, 30))));
        r.dev.tick();
        assert_eq!(r.dev.status(), CommStatus::ConnLost);
        assert_eq!(r.dev.alert().status, AlertStatus::ConnLost);
        assert!(!wire.lock().unwrap().connected);
        assert_eq!(r.dev.queue_len(), 1);
        assert_eq!(r.dev.stats.scans, 0);

        wire.lock().unwrap().broken = false;
        r.clock.advance(2);
        r.dev.tick();
        assert_eq!(r.dev.status(), CommStatus::Connected);
        r.dev.tick();
        assert!(output(&wire).ends_with("END RADAR IMAGE\n\x04"));
        assert_eq!(r.dev.queue_len(), 0);
    }

    #[test]
    fn transient_device_retires_after_its_call() {
        let opts = TxOptions {
            transient: true,
            ..Default::default()
        };
        let mut r = rig(opts);
        r.dev.tick();
        assert_ne!(r.dev.status(), CommStatus::Listening);
        assert!(!r.dev.is_retired(r.clock.now()));
        call(&mut r);
        assert_eq!(r.dev.status(), CommStatus::Connected);
        r.cmds.send(DeviceCommand::Disconnect);
        r.dev.tick();
        assert!(r.dev.is_retired(r.clock.now()));
    }

    #[test]
    fn station_set_and_reference_time() {
        assert_eq!(tx_stn_set(&[]), "RPTXSTNSET:ANY\r\x04");
        let f = [
            ScanFilter::new(3, -1, -1, -1, -1),
            ScanFilter::new(4, -1, -1, -1, -1),
        ];
        assert_eq!(tx_stn_set(&f), "RPTXSTNSET:3:4\r\x04");
        assert_eq!(tx_stn_set(&[ScanFilter::any()]), "RPTXSTNSET:ANY\r\x04");
        let t = from_calendar(2024, 2, 1, 12, 30, 5).unwrap();
        assert_eq!(ref_time_line(t), "RPREFTIME: 01/02/2024 12:30:05\r\x04");
    }
}
