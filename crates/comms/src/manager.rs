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

//! The process-wide comms manager.
//!
//! `CommMngr` owns every device handle, the free and in-use rx pools, the shared
//! listen socket, the request and schedule queues and the connection catalog. All of
//! it is driven from `check_comms`, called periodically by the daemon. Devices talk
//! back through one event channel which is drained at the start of each sweep (and
//! again after the device ticks when running single-threaded).

use crate::alert::SoundPlayer;
use crate::catalog::ConnectionCatalog;
use crate::clock::{SharedClock, Timestamp};
use crate::config::{CommsConfig, Globals, RxDeviceSpec, TxDeviceSpec};
use crate::control::{ControlAction, ControlFiles, DUMP_CONN_FILE, DUMP_SCHED_FILE};
use crate::device::{
    CommEvent, Device, DeviceCommand, DeviceEnv, DeviceKind, DeviceSnapshot, GlobalSettings,
    ScanSink, mailbox,
};
use crate::error::CommsError;
use crate::fallback::{FallbackAction, FallbackController};
use crate::request::{CommRequest, ReqId, RequestQueue, RxAvailability};
use crate::rxdevice::RxDevice;
use crate::scan::Scan;
use crate::schedule::{SchedId, ScheduleEntry, ScheduleList};
use crate::status::{StatusReport, write_status_file};
use crate::transport::{Listener, TransportFactory};
use crate::txdevice::{REFUSAL, TxDevice, TxOptions};
use crate::types::{CommStatus, DeviceId};
use crate::worker::DeviceHandle;
use ahash::{AHashMap, AHashSet};
use arc_swap::ArcSwap;
use indexmap::{IndexMap, IndexSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// Minimum spacing of repeated bind-failure warnings.
pub const BIND_WARN_SECS: i64 = 300;
pub const MAX_ACCEPTS_PER_SWEEP: usize = 4;

#[derive(Debug, Clone)]
pub struct ManagerOptions {
    /// Where control flag files are looked for, and where relative status and dump
    /// files are written.
    pub control_dir: PathBuf,
    /// One worker thread per device instead of ticking devices from the sweep.
    pub threaded: bool,
    pub lock_timeout: Duration,
}

impl Default for ManagerOptions {
    fn default() -> Self {
        Self {
            control_dir: PathBuf::from("."),
            threaded: false,
            lock_timeout: Duration::from_millis(50),
        }
    }
}

pub struct CommMngr {
    opts: ManagerOptions,
    clock: SharedClock,
    factory: Arc<dyn TransportFactory>,
    sounds: Arc<dyn SoundPlayer>,
    settings: Arc<ArcSwap<GlobalSettings>>,
    events_tx: flume::Sender<CommEvent>,
    events: flume::Receiver<CommEvent>,

    config_path: Option<PathBuf>,
    source: CommsConfig,
    globals: Globals,

    rx: IndexMap<DeviceId, DeviceHandle>,
    tx: IndexMap<DeviceId, DeviceHandle>,
    rx_free: IndexSet<DeviceId>,
    rx_in_use: IndexSet<DeviceId>,
    snapshots: AHashMap<DeviceId, DeviceSnapshot>,
    /// Command count each device's snapshot is known to reflect.
    settled: AHashMap<DeviceId, u64>,
    next_device_id: DeviceId,
    /// Devices whose fallback keeps every other rxdevice off while healthy.
    primary: AHashSet<DeviceId>,

    catalog: ConnectionCatalog,
    requests: RequestQueue,
    schedules: ScheduleList,
    fallback_schedules: AHashMap<DeviceId, Vec<SchedId>>,
    schedule_enabled: bool,
    global_fallback: bool,
    /// Stations last named in fallback notices.
    fallback_stations: Vec<i32>,

    listener: Option<Box<dyn Listener>>,
    listen_backlog: i32,
    bind_failed: bool,
    last_bind_warn: Option<Timestamp>,
    bind_warnings: u32,
    refused: u64,

    control: ControlFiles,
    quiet: bool,
    state_changed: bool,
    next_status_write: Timestamp,
}

impl CommMngr {
    pub fn new(
        opts: ManagerOptions,
        clock: SharedClock,
        factory: Arc<dyn TransportFactory>,
        sounds: Arc<dyn SoundPlayer>,
    ) -> Self {
        let (events_tx, events) = flume::unbounded();
        let control = ControlFiles::new(opts.control_dir.clone());
        Self {
            opts,
            clock,
            factory,
            sounds,
            settings: Arc::new(ArcSwap::from_pointee(GlobalSettings::default())),
            events_tx,
            events,
            config_path: None,
            source: CommsConfig::default(),
            globals: Globals::default(),
            rx: IndexMap::new(),
            tx: IndexMap::new(),
            rx_free: IndexSet::new(),
            rx_in_use: IndexSet::new(),
            snapshots: AHashMap::new(),
            settled: AHashMap::new(),
            next_device_id: 0,
            primary: AHashSet::new(),
            catalog: ConnectionCatalog::new(),
            requests: RequestQueue::new(),
            schedules: ScheduleList::new(),
            fallback_schedules: AHashMap::new(),
            schedule_enabled: true,
            global_fallback: false,
            fallback_stations: vec![],
            listener: None,
            listen_backlog: 0,
            bind_failed: false,
            last_bind_warn: None,
            bind_warnings: 0,
            refused: 0,
            control,
            quiet: false,
            state_changed: true,
            next_status_write: 0,
        }
    }

    fn env(&self) -> DeviceEnv {
        DeviceEnv {
            clock: self.clock.clone(),
            events: self.events_tx.clone(),
            settings: self.settings.clone(),
            sounds: self.sounds.clone(),
        }
    }

    /// Replaces whatever is running with the config at `path`.
    pub fn open(&mut self, path: &Path) -> Result<(), CommsError> {
        self.load_config(path, true)
    }

    /// Stops every device and forgets the running configuration.
    pub fn close(&mut self) {
        let count = self.rx.len() + self.tx.len();
        for (_, mut h) in self.rx.drain(..).chain(self.tx.drain(..)) {
            h.stop();
        }
        self.rx_free.clear();
        self.rx_in_use.clear();
        self.snapshots.clear();
        self.settled.clear();
        self.primary.clear();
        self.catalog.clear();
        self.requests.clear();
        self.schedules.clear();
        self.fallback_schedules.clear();
        self.listener = None;
        self.listen_backlog = 0;
        self.bind_failed = false;
        self.schedule_enabled = true;
        self.state_changed = true;
        // Stale events refer to devices that are gone.
        let stale = self.events.drain().count();
        info!(devices = count, stale_events = stale, "comms closed");
    }

    /// The file a bare reload request reads, and the default target of `save_config`.
    pub fn set_config_path(&mut self, path: impl Into<PathBuf>) {
        self.config_path = Some(path.into());
    }

    /// Loads `path`, either replacing the running config or adding to it.
    pub fn load_config(&mut self, path: &Path, replace: bool) -> Result<(), CommsError> {
        let cfg = CommsConfig::load(path)?;
        if replace {
            self.config_path = Some(path.to_path_buf());
        }
        self.apply_config(cfg, replace);
        Ok(())
    }

    /// Brings up everything `cfg` describes. An added config contributes devices,
    /// connections, requests and schedules; its global settings are ignored.
    pub fn apply_config(&mut self, cfg: CommsConfig, replace: bool) {
        if replace {
            self.close();
            self.globals = cfg.globals.clone();
            self.settings.store(Arc::new(GlobalSettings {
                alerts: self.globals.alerts,
                check_radls_for_mssg: self.globals.check_radls_for_mssg,
            }));
            self.source = CommsConfig {
                path: cfg.path.clone(),
                source: cfg.source.clone(),
                ..Default::default()
            };
            if self.globals.use_ip_name_cache {
                debug!("useIPNameCache set; host names are resolved per connect");
            }
            if self.globals.serve_recent_data_mins > 0 {
                debug!(
                    mins = self.globals.serve_recent_data_mins,
                    "serveRecentDataMins set; no scan history is kept to serve from"
                );
            }
        } else {
            self.source.source.extend(cfg.source.iter().cloned());
        }

        for conn in cfg.connections {
            self.catalog.add(conn);
        }
        for spec in cfg.rx_devices {
            if let Err(e) = self.create_rx(spec) {
                error!("rxdevice not created: {e}");
            }
        }
        for spec in cfg.tx_devices {
            if let Err(e) = self.create_tx(spec) {
                error!("txdevice not created: {e}");
            }
        }
        for req in cfg.requests {
            if let Err(e) = self.add_request(req) {
                warn!("config request not queued: {e}");
            }
        }
        for entry in cfg.schedules {
            if let Err(e) = self.add_schedule(entry) {
                warn!("config schedule not added: {e}");
            }
        }
        if let Err(e) = self.set_group_enable(-1, false) {
            warn!("group disable failed: {e}");
        }

        let healthy: Vec<(DeviceId, Vec<FallbackAction>)> = self
            .rx
            .values()
            .filter_map(|h| {
                h.with_device(self.opts.lock_timeout, |d| {
                    d.as_rx_mut()
                        .and_then(|rx| rx.fallback.as_ref())
                        .map(|fb| (fb.parent, fb.healthy_actions()))
                })
                .flatten()
            })
            .collect();
        for (parent, actions) in healthy {
            self.apply_fallback(parent, actions);
        }
        self.state_changed = true;
        info!(
            rx = self.rx.len(),
            tx = self.tx.len(),
            connections = self.catalog.len(),
            schedules = self.schedules.len(),
            requests = self.requests.len(),
            "comms config applied"
        );
    }

    fn alloc_id(&mut self) -> DeviceId {
        self.next_device_id += 1;
        self.next_device_id
    }

    fn create_rx(&mut self, spec: RxDeviceSpec) -> Result<DeviceId, CommsError> {
        let transport = self.factory.create(spec.mode)?;
        let id = self.alloc_id();
        let (cmds, mb) = mailbox();
        let mut dev = RxDevice::new(
            id,
            spec.mode,
            &spec.port_name,
            spec.opts.clone(),
            transport,
            mb,
            self.env(),
        );
        dev.filters = spec.filters.clone();

        if let Some(fb) = spec.fallback {
            let mut ctl = FallbackController::new(id);
            ctl.station = fb.station;
            ctl.entries = fb.schedules;
            ctl.suppress_main_schedule = fb.suppress_main_schedule;
            ctl.suppress_other_devices = fb.suppress_other_devices;
            if let Some(mut standby) = fb.device.map(|d| *d) {
                standby.opts.disabled_on_startup = true;
                match self.create_rx(standby) {
                    Ok(sid) => ctl.secondary = Some(sid),
                    Err(e) => error!(device = id, "fallback rxdevice not created: {e}"),
                }
            }
            if ctl.suppress_other_devices {
                self.primary.insert(id);
            }
            if ctl.is_configured() || !ctl.follows_parent() {
                dev.fallback = Some(ctl);
            }
        }

        let mut handle =
            DeviceHandle::new(Device::Rx(dev), cmds, spec.opts.group_id, spec.opts.fb_group);
        if self.opts.threaded {
            handle.spawn()?;
        }
        match &spec.connstr {
            Some(target) => {
                handle.send(DeviceCommand::Connect(target.clone()));
                self.rx_in_use.insert(id);
            }
            None => {
                self.rx_free.insert(id);
            }
        }
        if !spec.opts.disabled_on_startup {
            handle.enabled = true;
            handle.send(DeviceCommand::Enable);
        }
        info!(device = id, mode = %spec.mode, port = %spec.port_name, dedicated = spec.connstr.is_some(), "rxdevice created");
        self.rx.insert(id, handle);
        Ok(id)
    }

    fn create_tx(&mut self, spec: TxDeviceSpec) -> Result<DeviceId, CommsError> {
        let id = self.alloc_id();
        self.build_tx(id, spec)
    }

    fn build_tx(&mut self, id: DeviceId, spec: TxDeviceSpec) -> Result<DeviceId, CommsError> {
        let transport = self.factory.create(spec.mode)?;
        let (cmds, mb) = mailbox();
        let mut dev = TxDevice::new(
            id,
            spec.mode,
            &spec.port_name,
            spec.opts,
            transport,
            mb,
            self.env(),
        );
        dev.filters = spec.filters;
        let mut handle = DeviceHandle::new(Device::Tx(dev), cmds, 0, 0);
        if self.opts.threaded {
            handle.spawn()?;
        }
        if let Some(target) = spec.connstr {
            handle.send(DeviceCommand::Connect(target));
        }
        handle.enabled = true;
        handle.send(DeviceCommand::Enable);
        info!(device = id, mode = %spec.mode, port = %spec.port_name, "txdevice created");
        self.tx.insert(id, handle);
        Ok(id)
    }

    fn handle(&self, id: DeviceId) -> Option<&DeviceHandle> {
        self.rx.get(&id).or_else(|| self.tx.get(&id))
    }

    fn handle_mut(&mut self, id: DeviceId) -> Option<&mut DeviceHandle> {
        if self.rx.contains_key(&id) {
            self.rx.get_mut(&id)
        } else {
            self.tx.get_mut(&id)
        }
    }

    fn set_device_enabled(&mut self, id: DeviceId, enabled: bool) {
        let Some(h) = self.handle_mut(id) else {
            warn!(device = id, "no such device to enable");
            return;
        };
        h.enabled = enabled;
        h.send(if enabled {
            DeviceCommand::Enable
        } else {
            DeviceCommand::Disable
        });
        self.state_changed = true;
    }

    /// Moves an rxdevice to the in-use pool.
    fn use_device(&mut self, id: DeviceId) {
        self.rx_free.shift_remove(&id);
        self.rx_in_use.insert(id);
    }

    /// Returns an rxdevice to the free pool.
    fn free_device(&mut self, id: DeviceId) {
        self.rx_in_use.shift_remove(&id);
        self.rx_free.insert(id);
    }

    fn rx_availability(&self) -> Vec<RxAvailability> {
        self.rx
            .values()
            .map(|h| {
                let snap = self.snapshots.get(&h.id);
                let request = snap.and_then(|s| s.request);
                RxAvailability {
                    device: h.id,
                    mode: h.mode,
                    idle: self.rx_free.contains(&h.id) && h.enabled && request.is_none(),
                    request,
                }
            })
            .collect()
    }

    pub fn add_request(&mut self, req: CommRequest) -> Result<ReqId, CommsError> {
        let now = self.clock.now();
        let avail = self.rx_availability();
        let id = self.requests.submit(req, &self.catalog, now, &avail)?;
        self.state_changed = true;
        Ok(id)
    }

    /// Refuses while the request is being attempted.
    pub fn delete_request(&mut self, id: ReqId) -> Result<CommRequest, CommsError> {
        let req = self.requests.delete(id)?;
        self.state_changed = true;
        Ok(req)
    }

    /// Adds a schedule entry, provided some connection can serve it.
    pub fn add_schedule(&mut self, entry: ScheduleEntry) -> Result<SchedId, CommsError> {
        let now = self.clock.now();
        let avail = self.rx_availability();
        let serviceable = entry.template.best_candidate(&self.catalog, now, &avail) > 0;
        let id = self.schedules.add(entry, now, serviceable)?;
        self.state_changed = true;
        Ok(id)
    }

    pub fn schedule(&self, index: usize) -> Option<&ScheduleEntry> {
        self.schedules.get(index)
    }

    pub fn delete_schedule(&mut self, index: usize) -> Result<ScheduleEntry, CommsError> {
        self.state_changed = true;
        self.schedules.delete(index)
    }

    pub fn delete_schedule_by_description(&mut self, desc: &str) -> Result<ScheduleEntry, CommsError> {
        self.state_changed = true;
        self.schedules.delete_by_description(desc)
    }

    /// `period` and `offset` in seconds.
    pub fn modify_schedule(&mut self, index: usize, period: i64, offset: i64) -> Result<(), CommsError> {
        let now = self.clock.now();
        self.state_changed = true;
        self.schedules.modify(index, period, offset, now)
    }

    pub fn set_schedule_enabled(&mut self, enabled: bool) {
        if self.schedule_enabled != enabled {
            info!(enabled, "schedule enable changed");
            self.schedule_enabled = enabled;
            self.state_changed = true;
        }
    }

    /// Enables or disables the rxdevices and schedule entries in `group` (-1 for every
    /// nonzero group). Disabling a device also disables its downstream fallback group.
    pub fn set_group_enable(&mut self, group: i32, enabled: bool) -> Result<usize, CommsError> {
        if group == 0 {
            return Err(CommsError::InvalidGroup);
        }
        let mut visited = AHashSet::new();
        Ok(self.group_enable(group, enabled, &mut visited))
    }

    fn group_enable(&mut self, group: i32, enabled: bool, visited: &mut AHashSet<i32>) -> usize {
        if !visited.insert(group) {
            return 0;
        }
        let targets: Vec<(DeviceId, i32)> = self
            .rx
            .values()
            .filter(|h| h.group_id != 0 && (group == -1 || h.group_id == group))
            .map(|h| (h.id, h.fb_group))
            .collect();
        let mut n = targets.len();
        for (id, fb_group) in targets {
            self.set_device_enabled(id, enabled);
            if !enabled && fb_group > 0 && fb_group != group {
                n += self.group_enable(fb_group, false, visited);
            }
        }
        n += self.schedules.set_group_enable(group, enabled);
        if n > 0 {
            info!(group, enabled, count = n, "group enable");
        }
        n
    }

    fn apply_fallback(&mut self, parent: DeviceId, actions: Vec<FallbackAction>) {
        for action in actions {
            debug!(device = parent, ?action, "fallback action");
            match action {
                FallbackAction::ActivateSchedules { parent, entries } => {
                    let mut ids = vec![];
                    for entry in entries {
                        match self.add_schedule(entry) {
                            Ok(id) => ids.push(id),
                            Err(e) => warn!(device = parent, "fallback schedule not added: {e}"),
                        }
                    }
                    self.fallback_schedules.entry(parent).or_default().extend(ids);
                }
                FallbackAction::DeactivateSchedules { parent } => {
                    for id in self.fallback_schedules.remove(&parent).unwrap_or_default() {
                        self.schedules.remove_id(id);
                    }
                    self.state_changed = true;
                }
                FallbackAction::EnableDevice(id) => self.set_device_enabled(id, true),
                FallbackAction::DisableDevice(id) => self.set_device_enabled(id, false),
                FallbackAction::SetScheduleEnabled(enabled) => self.set_schedule_enabled(enabled),
                FallbackAction::SetOtherDevicesEnabled(enabled) => {
                    let others: Vec<DeviceId> = self
                        .rx
                        .values()
                        .filter(|h| h.id != parent && !self.primary.contains(&h.id))
                        .filter(|h| h.enabled != enabled)
                        .map(|h| h.id)
                        .collect();
                    for id in others {
                        self.set_device_enabled(id, enabled);
                    }
                }
            }
        }
    }

    fn drain_events(&mut self, now: Timestamp) {
        let events: Vec<CommEvent> = self.events.try_iter().collect();
        for event in events {
            self.handle_event(event, now);
        }
    }

    fn handle_event(&mut self, event: CommEvent, now: Timestamp) {
        match event {
            CommEvent::ScanStarted { scan, .. } => {
                self.route_scan(&scan, |tx, scan| {
                    tx.new_data_avail(scan);
                });
            }
            CommEvent::ScanFinished { device, scan } => {
                if self.quiet {
                    debug!(device, station = scan.station, "scan received: {}", scan.product);
                } else {
                    info!(device, station = scan.station, "scan received: {}", scan.product);
                }
                self.schedules.note_scan(scan.station, now);
                self.route_scan(&scan, |tx, scan| {
                    tx.finished_data_avail(scan);
                });
            }
            CommEvent::RequestDone {
                device,
                request,
                completed,
            } => {
                self.requests
                    .record_outcome(request, completed, &mut self.catalog, now);
                self.requests.release(request, &mut self.catalog, now);
                if let Some(h) = self.rx.get(&device) {
                    h.send(DeviceCommand::Clear);
                }
                self.free_device(device);
                self.state_changed = true;
            }
            CommEvent::GroupEnable { group, enabled } => {
                if let Err(e) = self.set_group_enable(group, enabled) {
                    warn!(group, "group enable failed: {e}");
                }
            }
            CommEvent::Fallback { device, actions } => self.apply_fallback(device, actions),
            CommEvent::StateChanged { .. } => self.state_changed = true,
        }
    }

    fn route_scan(&self, scan: &Arc<Scan>, f: impl Fn(&mut TxDevice, &Arc<Scan>)) {
        for h in self.tx.values() {
            h.with_device(self.opts.lock_timeout, |d| {
                if let Some(tx) = d.as_tx_mut() {
                    f(tx, scan);
                }
            });
        }
    }

    fn refresh_snapshots(&mut self) {
        for h in self.rx.values().chain(self.tx.values()) {
            if let Some((snap, settled)) = h.settled_snapshot(self.opts.lock_timeout) {
                self.snapshots.insert(h.id, snap);
                match settled {
                    Some(sent) => self.settled.insert(h.id, sent),
                    None => self.settled.remove(&h.id),
                };
            }
        }
    }

    fn retire_transients(&mut self) {
        let retired: Vec<DeviceId> = self
            .tx
            .keys()
            .copied()
            .filter(|id| self.snapshots.get(id).is_some_and(|s| s.retired))
            .collect();
        for id in retired {
            if let Some(mut h) = self.tx.shift_remove(&id) {
                h.stop();
            }
            self.snapshots.remove(&id);
            self.settled.remove(&id);
            self.state_changed = true;
            info!(device = id, "transient txdevice retired");
        }
    }

    fn listening_count(&self) -> i32 {
        self.tx
            .keys()
            .filter(|id| {
                self.snapshots
                    .get(id)
                    .is_some_and(|s| s.enabled && s.status == CommStatus::Listening)
            })
            .count() as i32
    }

    /// Keeps the advertised backlog equal to the number of listening txdevices,
    /// binding the shared port first if need be.
    fn reconcile_listen(&mut self, now: Timestamp, may_bind: bool) {
        if self.globals.disable_listen {
            return;
        }
        let listening = self.listening_count();
        if self.listener.is_none() {
            if !may_bind {
                return;
            }
            let port = self.globals.server_port;
            match self.factory.bind(port, listening) {
                Ok(l) => {
                    info!(port, backlog = listening, "listening for calls");
                    self.listener = Some(l);
                    self.listen_backlog = listening;
                    self.bind_failed = false;
                    self.state_changed = true;
                }
                Err(e) => {
                    self.bind_failed = true;
                    let due = self
                        .last_bind_warn
                        .is_none_or(|t| now - t >= BIND_WARN_SECS);
                    if due {
                        warn!(port, "unable to listen for incoming connections: {e}");
                        self.last_bind_warn = Some(now);
                        self.bind_warnings += 1;
                    } else {
                        debug!(port, "bind retry failed: {e}");
                    }
                }
            }
            return;
        }
        let Some(listener) = self.listener.as_mut() else {
            return;
        };
        if listening != self.listen_backlog {
            match listener.set_backlog(listening) {
                Ok(()) => {
                    debug!(from = self.listen_backlog, to = listening, "listen backlog adjusted");
                    self.listen_backlog = listening;
                    self.state_changed = true;
                }
                Err(e) => warn!("unable to adjust listen backlog: {e}"),
            }
        }
    }

    /// Hands up to `MAX_ACCEPTS_PER_SWEEP` pending calls to listening txdevices,
    /// creating on-demand devices or refusing when none are free.
    fn accept_calls(&mut self) {
        let Some(mut listener) = self.listener.take() else {
            return;
        };
        let mut handed: AHashSet<DeviceId> = AHashSet::new();
        for _ in 0..MAX_ACCEPTS_PER_SWEEP {
            let mut call = match listener.accept() {
                Ok(Some(call)) => call,
                Ok(None) => break,
                Err(e) => {
                    warn!("accept failed: {e}");
                    break;
                }
            };
            let free = self.tx.keys().copied().find(|id| {
                !handed.contains(id)
                    && self
                        .snapshots
                        .get(id)
                        .is_some_and(|s| s.enabled && s.status == CommStatus::Listening)
            });
            if let Some(id) = free
                && let Some(h) = self.tx.get(&id)
            {
                debug!(device = id, peer = %call.peer(), "call handed to txdevice");
                h.send(DeviceCommand::Accept(call));
                handed.insert(id);
                continue;
            }
            if self.globals.create_txdev_on_demand {
                let id = self.alloc_id();
                let opts = TxOptions {
                    description: format!("Auto-Created TxDev ID={id}"),
                    transient: true,
                    ..self.globals.tx_defaults.clone()
                };
                let spec = TxDeviceSpec {
                    mode: crate::types::ConnMode::Socket,
                    port_name: listener.port().to_string(),
                    connstr: None,
                    opts,
                    filters: vec![],
                };
                match self.build_tx(id, spec) {
                    Ok(id) => {
                        if let Some(h) = self.tx.get(&id) {
                            info!(device = id, peer = %call.peer(), "on-demand txdevice created");
                            h.send(DeviceCommand::Accept(call));
                            handed.insert(id);
                        }
                        continue;
                    }
                    Err(e) => error!("on-demand txdevice not created: {e}"),
                }
            }
            info!(peer = %call.peer(), "no free txdevice, call refused");
            if let Err(e) = call.write(REFUSAL.as_bytes()) {
                debug!("refusal not delivered: {e}");
            }
            call.disconnect();
            self.refused += 1;
            self.state_changed = true;
        }
        self.listener = Some(listener);
    }

    fn run_schedules(&mut self, now: Timestamp) {
        if !self.schedule_enabled {
            return;
        }
        for req in self.schedules.check(now, self.global_fallback) {
            match self.add_request(req) {
                Ok(_) => {}
                Err(CommsError::Duplicate(d)) => debug!("scheduled request already queued: {d}"),
                Err(e) => debug!("scheduled request not queued: {e}"),
            }
        }
    }

    fn service_requests(&mut self, now: Timestamp) {
        let idle: Vec<RxAvailability> = self
            .rx_availability()
            .into_iter()
            .filter(|a| a.idle)
            .collect();
        for a in idle {
            let Some(req) = self.requests.best_for_device(a.mode, &self.catalog, now) else {
                continue;
            };
            let Some(binding) = self
                .requests
                .bind(req, a.device, a.mode, &mut self.catalog, now)
            else {
                continue;
            };
            if let Some(h) = self.rx.get(&a.device) {
                info!(device = a.device, request = req, peer = %binding.connstr, "request assigned");
                h.send(DeviceCommand::Request(Box::new(binding)));
            }
            self.use_device(a.device);
            self.state_changed = true;
        }

        // Only snapshots that have seen every command sent to the device are judged.
        let bound: AHashMap<DeviceId, Option<ReqId>> = self
            .rx
            .values()
            .filter(|h| self.settled.get(&h.id) == Some(&h.cmds.sent()))
            .filter_map(|h| self.snapshots.get(&h.id).map(|s| (h.id, s.request)))
            .collect();
        let dropped = self
            .requests
            .purge(&mut self.catalog, |dev| bound.get(&dev).copied(), now);
        if !dropped.is_empty() {
            self.state_changed = true;
        }
    }

    fn check_fallback_files(&mut self) {
        let global = self.schedules.any_distinct_fallback() && self.control.global_fallback();
        if global != self.global_fallback {
            warn!(global, "global fallback mode changed");
            self.global_fallback = global;
            self.state_changed = true;
        }

        if let Some(stations) = self.control.network_status() {
            self.fallback_stations = stations;
        }
        let stations = &self.fallback_stations;
        let scheduled: AHashSet<i32> = self.schedules.iter().map(|e| e.station()).collect();
        for stn in scheduled {
            let fallback = stations.contains(&stn);
            if self.schedules.set_station_fallback(stn, fallback) {
                info!(station = stn, fallback, "schedule fallback changed");
            }
        }
        let actions: Vec<(DeviceId, Vec<FallbackAction>)> = self
            .rx
            .values()
            .filter_map(|h| {
                h.with_device(self.opts.lock_timeout, |d| {
                    let rx = d.as_rx_mut()?;
                    rx.check_fallback(stations).map(|actions| (rx.id, actions))
                })
                .flatten()
            })
            .collect();
        for (parent, actions) in actions {
            self.apply_fallback(parent, actions);
        }
    }

    fn check_control_files(&mut self, now: Timestamp) {
        for action in self.control.poll(now) {
            match action {
                ControlAction::Quiet(quiet) => self.quiet = quiet,
                ControlAction::Reload(path) => {
                    let Some(path) = path.or_else(|| self.config_path.clone()) else {
                        warn!("reload requested with no config file");
                        continue;
                    };
                    if let Err(e) = self.load_config(&path, true) {
                        error!("reload of {} failed: {e}", path.display());
                    }
                }
                ControlAction::Add(path) => {
                    if let Err(e) = self.load_config(&path, false) {
                        error!("add of {} failed: {e}", path.display());
                    }
                }
                ControlAction::DumpSchedules => {
                    if let Err(e) = self.control.write_dump(DUMP_SCHED_FILE, &self.schedules.dump()) {
                        warn!("schedule dump failed: {e}");
                    }
                }
                ControlAction::DumpConnections => {
                    let text = format!("{}\n{}\n", self.catalog.dump(), self.requests.dump(now));
                    if let Err(e) = self.control.write_dump(DUMP_CONN_FILE, &text) {
                        warn!("connection dump failed: {e}");
                    }
                }
            }
        }
    }

    fn status_path(&self) -> PathBuf {
        if self.globals.status_file.is_absolute() {
            self.globals.status_file.clone()
        } else {
            self.opts.control_dir.join(&self.globals.status_file)
        }
    }

    pub fn status_report(&self) -> StatusReport {
        let mut devices: Vec<DeviceSnapshot> = self.snapshots.values().cloned().collect();
        devices.sort_by_key(|d| (d.kind == DeviceKind::Tx, d.id));
        StatusReport {
            now: self.clock.now(),
            schedule_enabled: self.schedule_enabled,
            create_txdev_on_demand: self.globals.create_txdev_on_demand,
            listen_backlog: self.listen_backlog,
            refused: self.refused,
            port: self.globals.server_port,
            bind_failed: self.bind_failed,
            total_rx_bytes: self.total_rx_bytes(),
            devices,
        }
    }

    fn write_status(&mut self, now: Timestamp) {
        let period = self.globals.status_period;
        if !self.state_changed && (period <= 0 || now < self.next_status_write) {
            return;
        }
        let path = self.status_path();
        if let Err(e) = write_status_file(&path, &self.status_report()) {
            warn!("status file {} not written: {e}", path.display());
        }
        self.next_status_write = now + period.max(1);
        self.state_changed = false;
    }

    /// One pass of the comms machinery.
    pub fn check_comms(&mut self) {
        let now = self.clock.now();
        self.drain_events(now);
        self.refresh_snapshots();
        self.retire_transients();
        self.reconcile_listen(now, true);
        self.check_fallback_files();
        self.run_schedules(now);
        self.service_requests(now);
        self.accept_calls();
        if !self.opts.threaded {
            for h in self.rx.values().chain(self.tx.values()) {
                h.tick(self.opts.lock_timeout);
            }
            self.drain_events(now);
            self.refresh_snapshots();
            self.reconcile_listen(now, false);
        }
        self.write_status(now);
        self.check_control_files(now);
    }

    /// Saves the running config with the current schedule entries.
    pub fn save_config(&self, path: Option<&Path>) -> Result<(), CommsError> {
        let path = path
            .map(Path::to_path_buf)
            .or_else(|| self.config_path.clone())
            .ok_or_else(|| CommsError::ConfigIo {
                path: String::new(),
                source: std::io::Error::new(std::io::ErrorKind::NotFound, "no config path"),
            })?;
        self.source.save_config(&path, &self.schedules)
    }

    pub fn snapshots(&self) -> Vec<DeviceSnapshot> {
        self.status_report().devices
    }

    pub fn snapshot(&self, id: DeviceId) -> Option<&DeviceSnapshot> {
        self.snapshots.get(&id)
    }

    pub fn rx_ids(&self) -> Vec<DeviceId> {
        self.rx.keys().copied().collect()
    }

    pub fn tx_ids(&self) -> Vec<DeviceId> {
        self.tx.keys().copied().collect()
    }

    pub fn free_rx(&self) -> Vec<DeviceId> {
        self.rx_free.iter().copied().collect()
    }

    pub fn in_use_rx(&self) -> Vec<DeviceId> {
        self.rx_in_use.iter().copied().collect()
    }

    pub fn requests(&self) -> &RequestQueue {
        &self.requests
    }

    pub fn schedules(&self) -> &ScheduleList {
        &self.schedules
    }

    pub fn catalog(&self) -> &ConnectionCatalog {
        &self.catalog
    }

    pub fn globals(&self) -> &Globals {
        &self.globals
    }

    pub fn schedule_enabled(&self) -> bool {
        self.schedule_enabled
    }

    pub fn global_fallback(&self) -> bool {
        self.global_fallback
    }

    pub fn listen_backlog(&self) -> i32 {
        self.listen_backlog
    }

    pub fn bind_failed(&self) -> bool {
        self.bind_failed
    }

    pub fn bind_warnings(&self) -> u32 {
        self.bind_warnings
    }

    pub fn refused(&self) -> u64 {
        self.refused
    }

    pub fn is_quiet(&self) -> bool {
        self.quiet
    }

    pub fn total_rx_bytes(&self) -> u64 {
        self.snapshots
            .values()
            .filter(|s| s.kind == DeviceKind::Rx)
            .map(|s| s.bytes)
            .sum()
    }

    /// Runs `f` against a device, if its lock can be had.
    pub fn with_device<R>(&self, id: DeviceId, f: impl FnOnce(&mut Device) -> R) -> Option<R> {
        self.handle(id)?.with_device(self.opts.lock_timeout, f)
    }
}

impl Drop for CommMngr {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alert::LogSoundPlayer;
    use crate::clock::ManualClock;
    use crate::status::DEFAULT_STATUS_FILE;
    use crate::transport::mock::MockNet;
    use pretty_assertions::assert_eq;
    use std::fs;

    struct Rig {
        mgr: CommMngr,
        net: MockNet,
        clock: Arc<ManualClock>,
        dir: tempfile::TempDir,
    }

    fn rig(config: &str) -> Rig {
        let dir = tempfile::tempdir().unwrap();
        let net = MockNet::new();
        let clock = Arc::new(ManualClock::new(1_000));
        let opts = ManagerOptions {
            control_dir: dir.path().to_path_buf(),
            ..Default::default()
        };
        let mut mgr = CommMngr::new(opts, clock.clone(), Arc::new(net.clone()), Arc::new(LogSoundPlayer));
        mgr.apply_config(CommsConfig::parse(config), true);
        Rig {
            mgr,
            net,
            clock,
            dir,
        }
    }

    const POOL: &str = "\
connection=3 3 0 Rapic Std1 Socket radar.example 15555
rxdevice=socket 1
rxdevice=socket 2
";

    fn assert_pools_disjoint(mgr: &CommMngr) {
        let free = mgr.free_rx();
        let used = mgr.in_use_rx();
        for id in mgr.rx_ids() {
            assert_eq!(
                free.contains(&id) as u8 + used.contains(&id) as u8,
                1,
                "device {id} in free={free:?} used={used:?}"
            );
        }
    }

    #[test]
    fn request_moves_device_between_pools() {
        let mut r = rig(POOL);
        r.mgr.check_comms();
        assert_eq!(r.mgr.free_rx().len(), 2);
        r.mgr.add_request(CommRequest::new(3, crate::types::RpScanType::DfltPpi1)).unwrap();
        r.mgr.check_comms();
        assert_eq!(r.mgr.in_use_rx().len(), 1);
        assert_pools_disjoint(&r.mgr);
        assert_eq!(r.net.connects(), vec!["radar.example 15555"]);

        let wire = r.net.wire_for("radar.example 15555").unwrap();
        wire.lock().unwrap().push(
            "STNID: 3\nDATE: 03224\nTIME: 12.30\nPRODUCT: NORMAL\nIMGFMT: PPI\n\
             VIDRES: 16\n%001abc\n%002abc\nEND RADAR IMAGE\n",
        );
        r.mgr.check_comms();
        r.mgr.check_comms();
        assert!(r.mgr.requests().is_empty());
        assert_eq!(r.mgr.free_rx().len(), 2);
        assert_pools_disjoint(&r.mgr);
    }

    #[test]
    fn duplicate_request_rejected() {
        let mut r = rig(POOL);
        r.mgr.check_comms();
        let req = CommRequest::new(3, crate::types::RpScanType::DfltPpi1);
        r.mgr.add_request(req.clone()).unwrap();
        assert!(matches!(r.mgr.add_request(req), Err(CommsError::Duplicate(_))));
        assert_eq!(r.mgr.requests().len(), 1);
        assert!(matches!(
            r.mgr.add_request(CommRequest::new(9, crate::types::RpScanType::DfltPpi1)),
            Err(CommsError::NoViableConnection { station: 9 })
        ));
    }

    #[test]
    fn group_disable_reaches_downstream_fallback_group() {
        let mut r = rig("\
rxdevice=socket 1 connstr=a 1 \\
    groupid=1 fbgroup=2
rxdevice=socket 2 connstr=b 1 \\
    groupid=2 fbgroup=1
rxdevice=socket 3 connstr=c 1
");
        assert_eq!(r.mgr.set_group_enable(1, true).unwrap(), 1);
        assert_eq!(r.mgr.set_group_enable(2, true).unwrap(), 1);
        r.mgr.check_comms();
        let enabled = |m: &CommMngr, id| m.snapshot(id).unwrap().enabled;
        assert!(enabled(&r.mgr, 1) && enabled(&r.mgr, 2) && enabled(&r.mgr, 3));

        assert_eq!(r.mgr.set_group_enable(1, false).unwrap(), 2);
        r.mgr.check_comms();
        assert!(!enabled(&r.mgr, 1));
        assert!(!enabled(&r.mgr, 2));
        assert!(enabled(&r.mgr, 3));
        assert!(matches!(r.mgr.set_group_enable(0, true), Err(CommsError::InvalidGroup)));
    }

    #[test]
    fn healthy_parent_keeps_suppressing_others() {
        let mut r = rig("\
rxdevice=socket 1 connstr=a 1 fbstn=7 fbtocommserver
rxdevice=socket 2 connstr=b 1 groupid=3
");
        r.mgr.check_comms();
        let enabled = |m: &CommMngr, id| m.snapshot(id).unwrap().enabled;
        assert!(!r.mgr.schedule_enabled());
        assert!(!enabled(&r.mgr, 2));

        // a group enable does not outlast the next sweep while the parent is healthy
        assert_eq!(r.mgr.set_group_enable(3, true).unwrap(), 1);
        r.mgr.set_schedule_enabled(true);
        r.mgr.check_comms();
        assert!(!r.mgr.schedule_enabled());
        assert!(!enabled(&r.mgr, 2));

        fs::write(
            r.dir.path().join(crate::control::NETWORK_STATUS_FILE),
            "Fallback mode invoked for stnid=7\n",
        )
        .unwrap();
        r.mgr.check_comms();
        assert!(r.mgr.schedule_enabled());
        assert!(enabled(&r.mgr, 2));
        assert!(!enabled(&r.mgr, 1));
    }

    #[test]
    fn backlog_follows_listening_devices() {
        let mut r = rig("txdevice=socket 15555\ntxdevice=socket 15555\n");
        r.mgr.check_comms();
        assert_eq!(r.mgr.listen_backlog(), 2);
        assert_eq!(r.net.backlog(), 2);

        r.net.dial_in();
        r.mgr.check_comms();
        assert_eq!(r.mgr.listen_backlog(), 1);
        assert_eq!(r.net.backlog(), 1);
    }

    #[test]
    fn calls_refused_without_free_device() {
        let mut r = rig("");
        r.mgr.check_comms();
        let wire = r.net.dial_in();
        r.mgr.check_comms();
        assert_eq!(r.mgr.refused(), 1);
        let mut w = wire.lock().unwrap();
        assert_eq!(w.take_output(), REFUSAL);
        assert!(!w.connected);
    }

    #[test]
    fn on_demand_device_serves_then_retires() {
        let mut r = rig("create_txdev_on_demand\n");
        r.mgr.check_comms();
        let wire = r.net.dial_in();
        r.mgr.check_comms();
        assert_eq!(r.mgr.refused(), 0);
        let ids = r.mgr.tx_ids();
        assert_eq!(ids.len(), 1);
        let snap = r.mgr.snapshot(ids[0]).unwrap();
        assert_eq!(snap.description, format!("Auto-Created TxDev ID={}", ids[0]));
        assert!(snap.connected);
        assert!(!wire.lock().unwrap().take_output().starts_with("MSSG: 9"));

        wire.lock().unwrap().drop_link();
        r.mgr.check_comms();
        r.mgr.check_comms();
        assert!(r.mgr.tx_ids().is_empty());
    }

    #[test]
    fn only_four_calls_taken_per_sweep() {
        let mut r = rig("");
        r.mgr.check_comms();
        for _ in 0..6 {
            r.net.dial_in();
        }
        r.mgr.check_comms();
        assert_eq!(r.mgr.refused(), 4);
        assert_eq!(r.net.pending_calls(), 2);
    }

    #[test]
    fn status_file_and_dumps() {
        let mut r = rig(POOL);
        fs::write(r.dir.path().join(crate::control::DUMP_CONN_FLAG), "").unwrap();
        r.mgr.check_comms();
        let status = fs::read_to_string(r.dir.path().join(DEFAULT_STATUS_FILE)).unwrap();
        assert!(status.contains("---------Rx Devices----------"));
        assert!(status.contains("rxdev1 (Socket)"));
        let dump = fs::read_to_string(r.dir.path().join(DUMP_CONN_FILE)).unwrap();
        assert!(dump.contains("radar.example 15555"));

        // unchanged state is rewritten only once the period has passed
        fs::remove_file(r.dir.path().join(DEFAULT_STATUS_FILE)).unwrap();
        r.clock.advance(10);
        r.mgr.check_comms();
        assert!(!r.dir.path().join(DEFAULT_STATUS_FILE).exists());
        r.clock.advance(200);
        r.mgr.check_comms();
        assert!(r.dir.path().join(DEFAULT_STATUS_FILE).exists());
    }

    #[test]
    fn busy_device_keeps_its_new_request() {
        let mut r = rig(POOL);
        r.mgr.check_comms();
        let id = r
            .mgr
            .add_request(CommRequest::new(3, crate::types::RpScanType::DfltPpi1))
            .unwrap();
        let dev = r.mgr.free_rx()[0];
        let shared = r.mgr.rx[&dev].device.clone();
        {
            let _held = shared.lock().unwrap();
            r.mgr.check_comms();
        }
        assert_eq!(r.mgr.in_use_rx(), vec![dev]);

        // the device picks the request up, then stays locked through the next sweep
        let mut held = shared.lock().unwrap();
        held.tick();
        r.mgr.check_comms();
        drop(held);
        assert!(r.mgr.requests().get(id).unwrap().attempt_in_progress);

        r.mgr.check_comms();
        assert!(r.mgr.requests().get(id).unwrap().attempt_in_progress);
        assert_eq!(r.mgr.snapshot(dev).unwrap().request, Some(id));
    }

    #[test]
    fn schedule_needs_a_device_to_run_it() {
        let r = rig("\
connection=3 3 0 Rapic Std1 Socket radar.example 15555
rxdevice=socket 1 connstr=other.example 15555
schedule=003 10 10 0 DFLT_PPI1
");
        assert!(r.mgr.schedules().is_empty());
        let r = rig(&format!("{POOL}schedule=003 10 10 0 DFLT_PPI1\n"));
        assert_eq!(r.mgr.schedules().len(), 1);
    }

    #[test]
    fn unsupported_mode_skipped() {
        let r = rig("rxdevice=hayes 1\nrxdevice=socket 2\n");
        assert_eq!(r.mgr.rx_ids(), vec![1]);
    }
}
