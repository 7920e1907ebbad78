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

//! The inbound session: pulls scans from one radar or upstream node.
//!
//! A device either runs a semi-permanent subscription, reconnecting whenever the
//! link drops, or services one bound `CommRequest` and then reports back. All waits
//! are deadlines checked on later ticks; a tick never sleeps.

use crate::alert::{AlertState, AlertStatus};
use crate::clock::{Timestamp, calendar};
use crate::codec::{RapicLineCodec, split_embedded_status};
use crate::device::{CommEvent, DeviceCommand, DeviceEnv, DeviceKind, DeviceSnapshot, Mailbox};
use crate::fallback::{FallbackAction, FallbackController};
use crate::filter::ScanFilter;
use crate::request::{Binding, QUERY_PREFIX, ReqId, SEMI_PERM_QUERY};
use crate::scan::{END_IMAGE, END_SCAN_SET_MARKERS, Scan, source};
use crate::error::TransportError;
use crate::transport::Transport;
use crate::types::{CommStatus, ConnMode, DeviceId, RpScanType, ServiceType};
use bytes::BytesMut;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::codec::Decoder;
use tracing::{debug, error, info, trace, warn};

/// How long a semi-permanent reconnect waits for the far end to speak.
pub const CONFIRM_SECS: i64 = 15;
const STATUS_REQUEST: &str = "\rRDRSTAT:\r";
const MAX_HEADER_LINES: usize = 64;

/// Modifiers carried on the semi-permanent query.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Subscription {
    pub complete_scans: bool,
    pub latest_only: bool,
    pub allow_replay: bool,
    pub recent_mins: i64,
}

impl Default for Subscription {
    fn default() -> Self {
        Self {
            complete_scans: true,
            latest_only: false,
            allow_replay: false,
            recent_mins: 0,
        }
    }
}

impl Subscription {
    pub fn query(&self, recent_from: Timestamp) -> String {
        let mut q = format!("{QUERY_PREFIX} {SEMI_PERM_QUERY}");
        if !self.complete_scans {
            q.push_str(" TXCOMPLETESCANS=0");
        }
        if self.latest_only {
            q.push_str(" TXLATESTSCANONLY");
        }
        if self.allow_replay {
            q.push_str(" ALLOWREPLAY=1");
        }
        if self.recent_mins > 0 {
            q.push_str(&format!(" SendRecentDataMins={}", self.recent_mins));
            if recent_from > 0 {
                let (y, mo, d, h, mi, s) = calendar(recent_from);
                q.push_str(&format!(
                    " SendRecentDataFrom={y:04}{mo:02}{d:02}{h:02}{mi:02}{s:02}"
                ));
            }
        }
        q.push('\n');
        q
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct RxOptions {
    pub description: String,
    pub init_string: Option<String>,
    pub radar_status_file: Option<PathBuf>,
    pub disable_connect_confirm: bool,
    pub disabled_on_startup: bool,
    pub debug: i32,
    pub loop_delay: f64,
    pub reconn_period: i64,
    pub reconn_delay: i64,
    /// 0 disables the cap on a whole scan set.
    pub scanset_timeout: i64,
    /// Seconds a manual enable lasts, 0 for no limit.
    pub enabled_timeout: i64,
    pub timeout: i64,
    pub status_check_rate: i64,
    pub status_ack_time: i64,
    pub scan_timeout: i64,
    pub fail_sound: Option<String>,
    pub cleared_sound: Option<String>,
    pub suppress_alerts: bool,
    pub silence_alerts: bool,
    pub realert_period: i64,
    pub group_id: i32,
    pub fb_group: i32,
    pub subscription: Subscription,
}

impl Default for RxOptions {
    fn default() -> Self {
        Self {
            description: String::new(),
            init_string: None,
            radar_status_file: None,
            disable_connect_confirm: false,
            disabled_on_startup: false,
            debug: 0,
            loop_delay: 0.5,
            reconn_period: 10,
            reconn_delay: 2,
            scanset_timeout: 0,
            enabled_timeout: 0,
            timeout: 40,
            status_check_rate: 30,
            status_ack_time: 40,
            scan_timeout: 300,
            fail_sound: None,
            cleared_sound: None,
            suppress_alerts: false,
            silence_alerts: false,
            realert_period: crate::alert::DEFAULT_REALERT_SECS,
            group_id: 0,
            fb_group: 0,
            subscription: Subscription::default(),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RxStats {
    pub bytes: u64,
    pub scans: u64,
    pub connects: u64,
    pub conn_fails: u64,
}

struct ActiveRequest {
    binding: Box<Binding>,
    reported: bool,
}

/// What a connect in progress is for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Dial {
    SemiPerm,
    Request,
    Reconnect,
}

pub struct RxDevice {
    pub id: DeviceId,
    pub mode: ConnMode,
    pub port_name: String,
    pub opts: RxOptions,
    pub filters: Vec<ScanFilter>,
    pub fallback: Option<FallbackController>,
    pub stats: RxStats,
    env: DeviceEnv,
    mailbox: Mailbox,
    transport: Box<dyn Transport>,
    codec: RapicLineCodec,
    rxbuf: BytesMut,
    status: CommStatus,
    service: ServiceType,
    enabled: bool,
    enabled_until: Timestamp,
    stopped: bool,
    auto_reconnect: bool,
    target: Option<String>,
    request: Option<ActiveRequest>,
    pending_connect: bool,
    pending_request: bool,
    dialing: Option<(Dial, String)>,
    disconnect_flag: bool,
    reconnect_flag: bool,
    clear_flag: bool,
    ever_attempted: bool,
    timeout: i64,
    status_req: bool,
    status_check_at: Timestamp,
    status_ack_at: Timestamp,
    radl_deadline: Timestamp,
    scan_deadline: Timestamp,
    scanset_deadline: Timestamp,
    last_data_rx: Timestamp,
    retry_at: Timestamp,
    disconnected_at: Timestamp,
    confirm_deadline: Option<Timestamp>,
    confirmed: bool,
    header: Vec<String>,
    scan: Option<Scan>,
    radar_name: String,
    pending_fault: Option<(i32, String)>,
    secs_to_next_vol: i32,
    line_mismatch: bool,
    last_ext_status: String,
    last_scan_time: Timestamp,
    fb_group_on: bool,
    alert: AlertState,
}

impl RxDevice {
    pub fn new(
        id: DeviceId,
        mode: ConnMode,
        port_name: &str,
        opts: RxOptions,
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
            ..Default::default()
        };
        let timeout = opts.timeout;
        Self {
            id,
            mode,
            port_name: port_name.to_string(),
            opts,
            filters: vec![],
            fallback: None,
            stats: RxStats::default(),
            env,
            mailbox,
            transport,
            codec: RapicLineCodec::default(),
            rxbuf: BytesMut::with_capacity(4096),
            status: CommStatus::Idle,
            service: ServiceType::None,
            enabled: false,
            enabled_until: 0,
            stopped: false,
            auto_reconnect: false,
            target: None,
            request: None,
            pending_connect: false,
            pending_request: false,
            dialing: None,
            disconnect_flag: false,
            reconnect_flag: false,
            clear_flag: false,
            ever_attempted: false,
            timeout,
            status_req: false,
            status_check_at: 0,
            status_ack_at: 0,
            radl_deadline: 0,
            scan_deadline: 0,
            scanset_deadline: 0,
            last_data_rx: 0,
            retry_at: 0,
            disconnected_at: 0,
            confirm_deadline: None,
            confirmed: false,
            header: vec![],
            scan: None,
            radar_name: String::new(),
            pending_fault: None,
            secs_to_next_vol: -1,
            line_mismatch: false,
            last_ext_status: String::new(),
            last_scan_time: 0,
            fb_group_on: false,
            alert,
        }
    }

    pub fn label(&self) -> String {
        if self.opts.description.is_empty() {
            format!("rxdev{}", self.id)
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

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped
    }

    pub fn request_id(&self) -> Option<ReqId> {
        self.request.as_ref().map(|a| a.binding.request.id)
    }

    /// Auto-reconnecting sessions, and requests for anything but the default PPI,
    /// are kept open across timeouts.
    pub fn is_semi_perm(&self) -> bool {
        self.auto_reconnect
            || self
                .request
                .as_ref()
                .is_some_and(|a| a.binding.request.scan_type != RpScanType::DfltPpi1)
    }

    pub fn snapshot(&self) -> DeviceSnapshot {
        DeviceSnapshot {
            id: self.id,
            kind: DeviceKind::Rx,
            mode: self.mode,
            description: self.label(),
            status: self.status,
            service: self.service,
            enabled: self.enabled,
            connected: self.transport.is_connected(),
            peer: self.transport.peer(),
            request: self.request_id(),
            alert: self.alert.status,
            alert_text: self.alert.text.clone(),
            bytes: self.stats.bytes,
            scans: self.stats.scans,
            radar_name: self.radar_name.clone(),
            queue_len: 0,
            semi_perm: self.is_semi_perm(),
            retired: false,
        }
    }

    /// Re-evaluates the fallback controller. A station-specific one is in fallback
    /// while its station is among `notices`.
    pub fn check_fallback(&mut self, notices: &[i32]) -> Option<Vec<FallbackAction>> {
        let fb = self.fallback.as_mut()?;
        if !fb.follows_parent() {
            fb.detected = notices.contains(&fb.station);
        }
        let (_, actions) = fb.check();
        (!actions.is_empty()).then_some(actions)
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
            return;
        }
        if self.enabled && self.enabled_until > 0 && now > self.enabled_until {
            info!(device = self.id, "enable period expired, disabling");
            self.enabled = false;
        }
        if !self.enabled {
            self.cancel_dial();
            if self.transport.is_connected() {
                info!(device = self.id, "disabled, disconnecting");
                self.terminate_scan(None);
                self.transport.disconnect();
                self.disconnected_at = now;
            }
            self.set_status(CommStatus::Disabled);
            return;
        }
        if self.status == CommStatus::Disabled {
            self.set_status(CommStatus::Idle);
        }

        if self.transport.is_connected() {
            self.read_rp(now);
        }
        if self.disconnect_flag {
            self.disconnect_flag = false;
            self.cancel_dial();
            self.terminate_scan(None);
            self.transport.disconnect();
            self.disconnected_at = now;
            self.set_status(CommStatus::Idle);
        }
        if self.reconnect_flag {
            self.reconnect_flag = false;
            info!(device = self.id, "reconnect requested");
            self.cancel_dial();
            self.terminate_scan(None);
            self.transport.disconnect();
            self.disconnected_at = now;
            self.retry_at = now;
        }
        if self.clear_flag {
            self.clear_flag = false;
            self.do_clear(now);
        }
        if self.service != ServiceType::None {
            self.poll_dial(now);
            if self.dialing.is_some() {
                return;
            }
            if self.request.is_some() || self.auto_reconnect {
                self.check_rapic_status(now);
            }
            if self.pending_connect {
                self.pending_connect = false;
                self.connect_semi_perm(now);
            }
            if self.pending_request {
                self.pending_request = false;
                self.connect_request(now);
            }
            self.check_confirm(now);
        }
    }

    fn apply(&mut self, cmd: DeviceCommand, now: Timestamp) {
        debug!(device = self.id, ?cmd, "command");
        match cmd {
            DeviceCommand::Connect(target) => {
                self.target = Some(target);
                self.service = ServiceType::SemiPerm;
                self.auto_reconnect = true;
                self.pending_connect = true;
            }
            DeviceCommand::Request(binding) => {
                if self.request.is_some() || self.service == ServiceType::SemiPerm {
                    warn!(device = self.id, "busy, request {} not taken", binding.request.id);
                    return;
                }
                self.timeout = binding.data_timeout.unwrap_or(self.opts.timeout);
                self.request = Some(ActiveRequest {
                    binding,
                    reported: false,
                });
                self.service = ServiceType::Request;
                self.auto_reconnect = false;
                self.pending_request = true;
            }
            DeviceCommand::Disconnect => self.disconnect_flag = true,
            DeviceCommand::Reconnect => self.reconnect_flag = true,
            DeviceCommand::Clear => self.clear_flag = true,
            DeviceCommand::Listen => debug!(device = self.id, "listen ignored by rxdevice"),
            DeviceCommand::Accept(mut t) => {
                warn!(device = self.id, peer = %t.peer(), "rxdevice cannot take calls");
                t.disconnect();
            }
            DeviceCommand::Enable => {
                self.enabled = true;
                if self.opts.enabled_timeout > 0 {
                    self.enabled_until = now + self.opts.enabled_timeout;
                }
            }
            DeviceCommand::Disable => {
                self.enabled = false;
                self.enabled_until = 0;
            }
            DeviceCommand::Stop => {
                self.stopped = true;
                self.disconnect_flag = true;
                self.pending_connect = false;
                self.pending_request = false;
                self.auto_reconnect = false;
            }
        }
    }

    fn set_status(&mut self, status: CommStatus) {
        if self.status == status {
            return;
        }
        info!(device = self.id, state = %status, was = %self.status, "rxdevice state");
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
        if !self.alert.is_active() {
            return;
        }
        let who = self.label();
        let switches = self.env.alert_switches();
        self.alert
            .clear(now, switches, self.env.sounds.as_ref(), &who);
    }

    fn write(&mut self, data: &str) -> bool {
        match self.transport.write(data.as_bytes()) {
            Ok(_) => true,
            Err(e) => {
                warn!(device = self.id, "write failed: {e}");
                false
            }
        }
    }

    /// Reports the bound request's outcome once.
    fn report_request(&mut self, completed: bool) {
        let Some(active) = self.request.as_mut() else {
            return;
        };
        if active.reported {
            return;
        }
        active.reported = true;
        self.env.emit(CommEvent::RequestDone {
            device: self.id,
            request: active.binding.request.id,
            completed,
        });
    }

    fn link_health(&mut self, healthy: bool) {
        if let Some(fb) = self.fallback.as_mut()
            && fb.follows_parent()
        {
            fb.detected = !healthy;
            let (_, actions) = fb.check();
            if !actions.is_empty() {
                self.env.emit(CommEvent::Fallback {
                    device: self.id,
                    actions,
                });
            }
        }
        if self.opts.fb_group > 0 {
            if !healthy && !self.fb_group_on {
                self.fb_group_on = true;
                self.env.emit(CommEvent::GroupEnable {
                    group: self.opts.fb_group,
                    enabled: true,
                });
            } else if healthy && self.fb_group_on {
                self.fb_group_on = false;
                self.env.emit(CommEvent::GroupEnable {
                    group: self.opts.fb_group,
                    enabled: false,
                });
            }
        }
    }

    fn do_clear(&mut self, now: Timestamp) {
        debug!(device = self.id, "clear");
        self.cancel_dial();
        self.terminate_scan(None);
        if self.transport.is_connected() {
            self.transport.disconnect();
            self.disconnected_at = now;
        }
        self.codec.reset();
        self.rxbuf.clear();
        self.auto_reconnect = false;
        self.service = ServiceType::None;
        self.request = None;
        self.target = None;
        self.pending_connect = false;
        self.pending_request = false;
        self.radar_name.clear();
        self.timeout = self.opts.timeout;
        self.secs_to_next_vol = -1;
        self.pending_fault = None;
        self.status_req = false;
        self.radl_deadline = 0;
        self.scan_deadline = 0;
        self.scanset_deadline = 0;
        self.last_data_rx = 0;
        self.retry_at = 0;
        self.confirm_deadline = None;
        self.set_status(CommStatus::Idle);
    }

    fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.timeout.clamp(1, 900) as u64)
    }

    fn recent_from(&self, now: Timestamp) -> Timestamp {
        if self.last_scan_time > 0 {
            self.last_scan_time - 600
        } else {
            now - self.opts.subscription.recent_mins * 60 - 600
        }
    }

    /// The subscription query, any init string and the filters.
    fn send_session_start(&mut self, now: Timestamp) {
        if let Some(init) = self.opts.init_string.clone() {
            self.write(&format!("{init}\r"));
        }
        let query = self.opts.subscription.query(self.recent_from(now));
        self.write(&query);
        let filters: String = self
            .filters
            .iter()
            .map(|f| format!("{}\n", f.encode()))
            .collect();
        if !filters.is_empty() {
            self.write(&filters);
        }
    }

    fn connect_semi_perm(&mut self, now: Timestamp) {
        let Some(target) = self.target.clone() else {
            return;
        };
        self.set_status(CommStatus::Connecting);
        self.timeout = self.opts.timeout;
        self.ever_attempted = true;
        self.stats.connects += 1;
        self.start_dial(Dial::SemiPerm, target, now);
    }

    /// Starts a connect; it completes in this tick or a later one.
    fn start_dial(&mut self, dial: Dial, target: String, now: Timestamp) {
        match self.transport.connect(&target, self.connect_timeout()) {
            Ok(()) => {
                self.dialing = Some((dial, target));
                self.poll_dial(now);
            }
            Err(e) => self.dial_failed(dial, &target, &e, now),
        }
    }

    fn poll_dial(&mut self, now: Timestamp) {
        let Some((dial, target)) = self.dialing.take() else {
            return;
        };
        match self.transport.poll_connect() {
            Ok(true) => self.dial_done(dial, &target, now),
            Ok(false) => self.dialing = Some((dial, target)),
            Err(e) => self.dial_failed(dial, &target, &e, now),
        }
    }

    fn cancel_dial(&mut self) {
        if let Some((_, target)) = self.dialing.take() {
            debug!(device = self.id, peer = %target, "connect abandoned");
            self.transport.disconnect();
        }
    }

    fn dial_done(&mut self, dial: Dial, target: &str, now: Timestamp) {
        self.codec.reset();
        match dial {
            Dial::SemiPerm => {
                info!(device = self.id, peer = %target, "connected");
                self.send_session_start(now);
                self.on_connected(now);
            }
            Dial::Request => {
                let Some(active) = self.request.as_ref() else {
                    self.transport.disconnect();
                    return;
                };
                let query = active.binding.request.query_string();
                let id = active.binding.request.id;
                info!(device = self.id, peer = %target, request = id, "connected for request");
                self.set_status(CommStatus::Connected);
                self.radl_deadline = now + self.timeout;
                self.scan_deadline = 0;
                self.status_req = false;
                self.status_check_at = now + self.opts.status_check_rate;
                self.status_ack_at = now + self.opts.status_ack_time;
                self.write(&query);
            }
            Dial::Reconnect => {
                self.send_session_start(now);
                if self.opts.disable_connect_confirm {
                    info!(device = self.id, peer = %target, "reconnected");
                    self.on_connected(now);
                } else {
                    self.write(STATUS_REQUEST);
                    self.confirmed = false;
                    self.confirm_deadline = Some(now + CONFIRM_SECS);
                }
            }
        }
    }

    fn dial_failed(&mut self, dial: Dial, target: &str, e: &TransportError, now: Timestamp) {
        self.stats.conn_fails += 1;
        match dial {
            Dial::SemiPerm => {
                warn!(device = self.id, peer = %target, "connect failed: {e}");
                self.disconnected_at = now;
                self.link_health(false);
            }
            Dial::Request => {
                warn!(device = self.id, peer = %target, "request connect failed: {e}");
                self.set_status(CommStatus::ReqFailed);
                self.report_request(false);
            }
            Dial::Reconnect => {
                debug!(device = self.id, peer = %target, "reconnect failed: {e}");
                self.set_status(CommStatus::ConnFailed);
                self.link_health(false);
                self.post_alert(AlertStatus::ReconnFailed, "Reconnect attempt failed", now);
                self.retry_at = now + self.opts.reconn_period;
                self.disconnected_at = now;
            }
        }
    }

    fn on_connected(&mut self, now: Timestamp) {
        self.clear_alert(now);
        self.set_status(CommStatus::Connected);
        self.status_req = false;
        self.status_check_at = now;
        self.status_ack_at = now + self.opts.status_ack_time;
        self.radl_deadline = 0;
        self.scan_deadline = 0;
        self.last_data_rx = 0;
        self.retry_at = 0;
        self.scanset_deadline = if self.opts.scanset_timeout > 0 {
            now + self.opts.scanset_timeout
        } else {
            0
        };
        self.link_health(true);
    }

    fn connect_request(&mut self, now: Timestamp) {
        let Some(active) = self.request.as_ref() else {
            return;
        };
        let target = active.binding.connstr.clone();
        self.set_status(CommStatus::Connecting);
        self.ever_attempted = true;
        self.stats.connects += 1;
        self.start_dial(Dial::Request, target, now);
    }

    fn check_confirm(&mut self, now: Timestamp) {
        let Some(deadline) = self.confirm_deadline else {
            return;
        };
        if self.confirmed {
            self.confirm_deadline = None;
            info!(device = self.id, "reconnection confirmed");
            self.on_connected(now);
        } else if now > deadline || !self.transport.is_connected() {
            self.confirm_deadline = None;
            warn!(device = self.id, "reconnection not confirmed within {CONFIRM_SECS}s");
            self.transport.disconnect();
            self.disconnected_at = now;
            self.retry_at = now + self.opts.reconn_period;
            self.set_status(CommStatus::ConnLost);
            self.link_health(false);
        }
    }

    fn attempt_reconnect(&mut self, now: Timestamp) {
        let Some(target) = self.target.clone() else {
            return;
        };
        self.stats.connects += 1;
        debug!(device = self.id, peer = %target, "reconnecting");
        self.start_dial(Dial::Reconnect, target, now);
    }

    fn check_rapic_status(&mut self, now: Timestamp) {
        if self.disconnect_flag || self.clear_flag || self.confirm_deadline.is_some() {
            return;
        }
        if self.request.is_some()
            && matches!(
                self.status,
                CommStatus::ReqFailed | CommStatus::ReqComplete | CommStatus::Idle
            )
        {
            return;
        }
        let connected = self.transport.is_connected();
        let status_to = self.status_req && now > self.status_ack_at;
        let radl_to = self.radl_deadline > 0 && now > self.radl_deadline;
        let scan_to = self.scan_deadline > 0 && now > self.scan_deadline;
        let scanset_to = self.scanset_deadline > 0 && now > self.scanset_deadline;
        let data_to = self.last_data_rx > 0 && now - self.last_data_rx > self.timeout;
        if status_to || radl_to || scan_to || scanset_to || data_to {
            warn!(
                device = self.id,
                status_to, radl_to, scan_to, scanset_to, data_to, "timeout"
            );
            self.terminate_scan(None);
            self.radl_deadline = 0;
            self.scan_deadline = 0;
            self.scanset_deadline = 0;
            self.last_data_rx = 0;
            self.status_req = false;
            self.status_check_at = now;
            self.status_ack_at = now + self.opts.status_ack_time;
        }
        let semi_perm = self.is_semi_perm();
        let force = status_to
            || scanset_to
            || ((radl_to || data_to) && !semi_perm)
            || (self.request.is_some() && scan_to);

        if force || !connected {
            if force {
                self.set_status(CommStatus::ConnLost);
            }
            if self.auto_reconnect {
                if !self.ever_attempted || now < self.retry_at {
                    return;
                }
                if status_to {
                    self.post_alert(AlertStatus::StatFailed, "Status request timed out", now);
                }
                if !connected && self.retry_at == 0 && !self.alert.is_active() {
                    self.post_alert(AlertStatus::ConnFailed, "Connection failed", now);
                }
                if self.transport.is_connected() {
                    self.transport.disconnect();
                    self.disconnected_at = now;
                }
                if now < self.disconnected_at + self.opts.reconn_delay {
                    return;
                }
                self.attempt_reconnect(now);
            } else {
                let peer = self.transport.peer();
                if status_to {
                    warn!(device = self.id, peer = %peer, "status request timed out");
                } else {
                    warn!(device = self.id, peer = %peer, "connection lost");
                }
                self.terminate_scan(None);
                self.transport.disconnect();
                self.disconnected_at = now;
                self.set_status(CommStatus::ReqFailed);
                self.report_request(false);
            }
            return;
        }

        if self.alert.status != AlertStatus::RadarFault {
            self.clear_alert(now);
        }
        if semi_perm && now >= self.status_check_at {
            self.send_status_request(now);
            self.status_check_at = now + self.opts.status_check_rate;
        }
    }

    fn send_status_request(&mut self, now: Timestamp) {
        let default_ppi = self
            .request
            .as_ref()
            .is_some_and(|a| a.binding.request.scan_type == RpScanType::DfltPpi1);
        if default_ppi {
            return;
        }
        trace!(device = self.id, "status request");
        self.write(STATUS_REQUEST);
        if !self.status_req {
            self.status_req = true;
            self.status_ack_at = now + self.opts.status_ack_time;
        }
    }

    fn status_reset(&mut self, now: Timestamp) {
        self.status_req = false;
        self.status_check_at = now + self.opts.status_check_rate;
    }

    fn read_rp(&mut self, now: Timestamp) {
        match self.transport.read_into(&mut self.rxbuf) {
            Ok(n) => self.stats.bytes += n as u64,
            Err(e) => {
                info!(device = self.id, "read failed: {e}");
                if self.auto_reconnect {
                    self.post_alert(
                        AlertStatus::ConnLost,
                        "Connection lost while reading data",
                        now,
                    );
                }
                self.terminate_scan(None);
                self.disconnected_at = now;
                self.set_status(CommStatus::ConnLost);
                return;
            }
        }
        let split = self.env.check_radls_for_mssg();
        loop {
            let line = match self.codec.decode(&mut self.rxbuf) {
                Ok(Some(line)) => line,
                Ok(None) => break,
                Err(e) => {
                    warn!(device = self.id, "line assembly failed: {e}");
                    break;
                }
            };
            if split {
                let (radial, mssg) = split_embedded_status(&line);
                if let Some(mssg) = mssg {
                    let (radial, mssg) = (radial.to_string(), mssg.to_string());
                    self.new_line(&radial, now);
                    self.new_line(&mssg, now);
                    continue;
                }
            }
            self.new_line(&line, now);
            if !self.transport.is_connected() {
                break;
            }
        }
    }

    /// Dispatches one assembled line.
    pub fn new_line(&mut self, line: &str, now: Timestamp) {
        if self.opts.debug > 1 {
            debug!(device = self.id, "rx: {line}");
        } else {
            trace!(device = self.id, "rx: {line}");
        }
        if self.confirm_deadline.is_some() {
            self.confirmed = true;
        }
        if line.starts_with('%') || line.starts_with('@') {
            self.last_data_rx = now;
            self.radl_deadline = now + self.timeout;
            self.status_reset(now);
            self.ensure_scan();
            if let Some(scan) = self.scan.as_mut() {
                scan.radial(line);
            }
            return;
        }
        if let Some(rest) = line.strip_prefix("MSSG:") {
            self.handle_mssg(line, rest, now);
            return;
        }
        if let Some(text) = line.strip_prefix("EXTSTS:") {
            self.external_status(text.trim());
            return;
        }
        if line.starts_with("RDRSTAT") {
            self.last_data_rx = now;
            return;
        }
        if line.contains("END STATUS") {
            trace!(device = self.id, "status acknowledged");
            self.status_reset(now);
            return;
        }
        if let Some(rest) = line.strip_prefix("FAULT:") {
            self.handle_fault(rest.trim(), now);
            return;
        }
        if line.starts_with("RPQUERY: Query data not") {
            info!(device = self.id, "{line}");
            if !self.auto_reconnect && self.request.is_some() {
                self.terminate_scan(None);
                self.transport.disconnect();
                self.disconnected_at = now;
                self.set_status(CommStatus::ReqFailed);
                self.report_request(false);
            }
            return;
        }
        if line.starts_with(END_IMAGE) {
            self.end_image(line, now);
            return;
        }
        if END_SCAN_SET_MARKERS.iter().any(|m| line.starts_with(m)) {
            self.end_scan_set(Some(line), now);
            return;
        }
        if line.starts_with("PRODUCT:") {
            self.status_reset(now);
            if line.contains("ERROR") {
                self.pending_fault = Some((1, "ERROR PRODUCT".to_string()));
            }
            if self.volume_label_mismatch(line) {
                error!(device = self.id, "volume label mismatch, closing scan: {line}");
                self.line_mismatch = true;
                self.end_scan_set(None, now);
                self.line_mismatch = false;
            }
        }
        if let Some(name) = line.strip_prefix("NAME:") {
            self.radar_name = name.trim().to_string();
        }
        if self.header.len() < MAX_HEADER_LINES {
            self.header.push(line.to_string());
        }
    }

    fn volume_label_mismatch(&self, line: &str) -> bool {
        let Some(scan) = self.scan.as_ref() else {
            return false;
        };
        if !scan.is_vol() || scan.passes == 0 {
            return false;
        }
        let product = line.trim_start_matches("PRODUCT:").trim();
        product != scan.product
    }

    fn handle_mssg(&mut self, line: &str, rest: &str, now: Timestamp) {
        let mut tokens = rest.split_whitespace();
        let code: i32 = tokens.next().and_then(|t| t.parse().ok()).unwrap_or(-1);
        match code {
            9 => {
                info!(device = self.id, "remote refused: {line}");
                self.terminate_scan(None);
                self.transport.disconnect();
                self.disconnected_at = now;
                if self.auto_reconnect {
                    self.retry_at = now + self.opts.reconn_period;
                    self.set_status(CommStatus::ConnFailed);
                } else {
                    self.set_status(CommStatus::ReqFailed);
                    self.report_request(false);
                }
            }
            10 => {
                if self.request.is_some() {
                    warn!(device = self.id, "radar in calibration mode, request aborted");
                    self.terminate_scan(Some((1, "RADAR IN CALIBRATION MODE")));
                    self.transport.disconnect();
                    self.disconnected_at = now;
                    self.set_status(CommStatus::ReqFailed);
                    self.report_request(false);
                }
            }
            23 => {
                let secs = tokens.find_map(|t| t.parse::<i32>().ok()).unwrap_or(-1);
                if secs > self.secs_to_next_vol
                    && self.secs_to_next_vol >= 0
                    && self.request.is_some()
                {
                    info!(device = self.id, "volume countdown restarted, request over");
                    self.end_scan_set(None, now);
                }
                self.secs_to_next_vol = secs;
            }
            30 => trace!(device = self.id, "status information follows"),
            _ => debug!(device = self.id, "{line}"),
        }
        if code != 17 {
            self.status_reset(now);
        }
    }

    fn handle_fault(&mut self, rest: &str, now: Timestamp) {
        let (no, text) = match rest.split_once(char::is_whitespace) {
            Some((n, t)) => (n.parse().unwrap_or(1), t.trim()),
            None => (rest.parse().unwrap_or(1), ""),
        };
        warn!(device = self.id, fault = no, "radar fault: {text}");
        match self.scan.as_mut() {
            Some(scan) => scan.set_fault(no, text),
            None => self.pending_fault = Some((no, text.to_string())),
        }
        if self.is_semi_perm() {
            let msg = format!("Radar Fault - {no} {text}");
            self.post_alert(AlertStatus::RadarFault, &msg, now);
        }
    }

    fn external_status(&mut self, text: &str) {
        if text == self.last_ext_status {
            return;
        }
        self.last_ext_status = text.to_string();
        if let Some(path) = self.opts.radar_status_file.clone()
            && let Err(e) = crate::status::write_radar_status(&path, text)
        {
            warn!(device = self.id, path = %path.display(), "radar status write failed: {e}");
        }
    }

    /// Opens a scan for the buffered header, or folds the header into the open volume.
    fn ensure_scan(&mut self) {
        match self.scan.as_mut() {
            Some(scan) => {
                for h in self.header.drain(..) {
                    scan.header_line(&h);
                }
            }
            None => {
                let src = if self.request.is_some() {
                    source::COMM_REQ
                } else {
                    source::COMM
                };
                let mut scan = Scan::new(src);
                for h in self.header.drain(..) {
                    scan.header_line(&h);
                }
                if let Some((no, text)) = self.pending_fault.take() {
                    scan.set_fault(no, &text);
                }
                if scan.radar_name.is_empty() {
                    scan.radar_name = self.radar_name.clone();
                }
                debug!(device = self.id, "scan started: {}", scan.describe());
                self.env.emit(CommEvent::ScanStarted {
                    device: self.id,
                    scan: Arc::new(scan.clone()),
                });
                self.scan = Some(scan);
            }
        }
    }

    fn end_image(&mut self, line: &str, now: Timestamp) {
        self.scan_deadline = now + self.opts.scan_timeout;
        self.last_data_rx = now;
        self.status_reset(now);
        self.ensure_scan();
        let semi = self.is_semi_perm();
        let Some(scan) = self.scan.as_mut() else {
            return;
        };
        scan.end_image(line);
        let hold_for_fault = scan.is_faulty() && matches!(scan.fault_no, 1 | 2) && semi;
        if scan.complete && !hold_for_fault {
            self.end_scan_set(None, now);
        }
    }

    fn end_scan_set(&mut self, line: Option<&str>, now: Timestamp) {
        self.radl_deadline = 0;
        self.scan_deadline = 0;
        let mut completed = false;
        if let Some(mut scan) = self.scan.take() {
            if let Some(l) = line {
                scan.end_scan_set(l);
            }
            if scan.is_vol() && scan.passes > 0 && scan.pass < scan.passes && !scan.is_faulty() {
                let text = format!("SCAN SET INCOMPLETE: {} of {} scans", scan.pass, scan.passes);
                scan.set_fault(20, &text);
            }
            completed = !scan.is_faulty() || matches!(scan.fault_no, 1 | 6);
            self.finish_scan(scan);
        }
        if self.request.is_some() {
            self.transport.disconnect();
            self.disconnected_at = now;
            self.set_status(CommStatus::ReqComplete);
            self.report_request(completed);
        }
        if !self.line_mismatch {
            self.header.clear();
            if self.is_semi_perm() && self.transport.is_connected() {
                self.send_status_request(now);
            }
        }
        if self.opts.scanset_timeout > 0 && self.is_semi_perm() {
            self.scanset_deadline = now + self.opts.scanset_timeout;
        }
    }

    fn finish_scan(&mut self, mut scan: Scan) {
        scan.finish();
        if !scan.is_faulty() && self.alert.status == AlertStatus::RadarFault {
            let now = self.env.now();
            self.clear_alert(now);
        }
        if scan.scan_time > 0 {
            self.last_scan_time = scan.scan_time;
        }
        self.stats.scans += 1;
        info!(device = self.id, station = scan.station, "scan finished: {}", scan.describe());
        self.env.emit(CommEvent::ScanFinished {
            device: self.id,
            scan: Arc::new(scan),
        });
    }

    /// Closes any scan in progress, e.g. on timeout or loss of link.
    fn terminate_scan(&mut self, fault: Option<(i32, &str)>) {
        self.header.clear();
        let Some(mut scan) = self.scan.take() else {
            return;
        };
        if let Some((no, text)) = fault {
            scan.set_fault(no, text);
        }
        if scan.radials == 0 {
            debug!(device = self.id, "empty scan discarded");
            return;
        }
        self.finish_scan(scan);
    }
}
