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

//! What rx and tx devices share: the command mailbox, the event channel back to the
//! manager, the environment they tick in, and the status snapshot.

use crate::alert::{AlertStatus, AlertSwitches, SoundPlayer};
use crate::clock::{SharedClock, Timestamp};
use crate::fallback::FallbackAction;
use crate::request::{Binding, ReqId};
use crate::rxdevice::RxDevice;
use crate::scan::Scan;
use crate::transport::Transport;
use crate::txdevice::TxDevice;
use crate::types::{CommStatus, ConnMode, DeviceId, ServiceType};
use arc_swap::ArcSwap;
use std::fmt;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, TryLockError};
use std::time::{Duration, Instant};
use tracing::{trace, warn};

/// Control-plane requests to a device. Drained at the start of every tick.
pub enum DeviceCommand {
    /// Long-lived session to the given target, reconnecting on loss.
    Connect(String),
    Request(Box<Binding>),
    Disconnect,
    Reconnect,
    Clear,
    Listen,
    /// A call taken on the shared listen socket.
    Accept(Box<dyn Transport>),
    Enable,
    Disable,
    Stop,
}

impl fmt::Debug for DeviceCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeviceCommand::Connect(target) => write!(f, "Connect({target})"),
            DeviceCommand::Request(b) => write!(f, "Request({})", b.request.id),
            DeviceCommand::Disconnect => f.write_str("Disconnect"),
            DeviceCommand::Reconnect => f.write_str("Reconnect"),
            DeviceCommand::Clear => f.write_str("Clear"),
            DeviceCommand::Listen => f.write_str("Listen"),
            DeviceCommand::Accept(t) => write!(f, "Accept({})", t.peer()),
            DeviceCommand::Enable => f.write_str("Enable"),
            DeviceCommand::Disable => f.write_str("Disable"),
            DeviceCommand::Stop => f.write_str("Stop"),
        }
    }
}

/// Device-to-manager notifications.
#[derive(Debug, Clone)]
pub enum CommEvent {
    ScanStarted {
        device: DeviceId,
        scan: Arc<Scan>,
    },
    ScanFinished {
        device: DeviceId,
        scan: Arc<Scan>,
    },
    RequestDone {
        device: DeviceId,
        request: ReqId,
        completed: bool,
    },
    GroupEnable {
        group: i32,
        enabled: bool,
    },
    Fallback {
        device: DeviceId,
        actions: Vec<FallbackAction>,
    },
    StateChanged {
        device: DeviceId,
        status: CommStatus,
    },
}

/// Settings every device reads on each tick; swapped whole on config reload.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GlobalSettings {
    pub alerts: AlertSwitches,
    pub check_radls_for_mssg: bool,
}

#[derive(Clone)]
pub struct DeviceEnv {
    pub clock: SharedClock,
    pub events: flume::Sender<CommEvent>,
    pub settings: Arc<ArcSwap<GlobalSettings>>,
    pub sounds: Arc<dyn SoundPlayer>,
}

impl DeviceEnv {
    pub fn now(&self) -> Timestamp {
        self.clock.now()
    }

    pub fn emit(&self, event: CommEvent) {
        if self.events.send(event).is_err() {
            trace!("event channel closed");
        }
    }

    pub fn alert_switches(&self) -> AlertSwitches {
        self.settings.load().alerts
    }

    pub fn check_radls_for_mssg(&self) -> bool {
        self.settings.load().check_radls_for_mssg
    }
}

/// Sending half of a device mailbox. Tracks how many commands are not yet drained,
/// and how many were ever sent.
#[derive(Clone)]
pub struct CommandSender {
    tx: flume::Sender<DeviceCommand>,
    pending: Arc<AtomicUsize>,
    sent: Arc<AtomicU64>,
}

impl CommandSender {
    pub fn send(&self, cmd: DeviceCommand) -> bool {
        self.pending.fetch_add(1, Ordering::SeqCst);
        if self.tx.send(cmd).is_err() {
            self.pending.fetch_sub(1, Ordering::SeqCst);
            return false;
        }
        self.sent.fetch_add(1, Ordering::SeqCst);
        true
    }

    pub fn pending(&self) -> usize {
        self.pending.load(Ordering::SeqCst)
    }

    pub fn sent(&self) -> u64 {
        self.sent.load(Ordering::SeqCst)
    }
}

pub struct Mailbox {
    rx: flume::Receiver<DeviceCommand>,
    pending: Arc<AtomicUsize>,
}

impl Mailbox {
    pub fn drain(&self) -> Vec<DeviceCommand> {
        let cmds: Vec<_> = self.rx.try_iter().collect();
        if !cmds.is_empty() {
            self.pending.fetch_sub(cmds.len(), Ordering::SeqCst);
        }
        cmds
    }
}

pub fn mailbox() -> (CommandSender, Mailbox) {
    let (tx, rx) = flume::unbounded();
    let pending = Arc::new(AtomicUsize::new(0));
    (
        CommandSender {
            tx,
            pending: pending.clone(),
            sent: Arc::new(AtomicU64::new(0)),
        },
        Mailbox { rx, pending },
    )
}

/// Accepts scans from rxdevices for onward delivery.
pub trait ScanSink {
    /// A scan has begun arriving. Returns whether this sink wants it.
    fn new_data_avail(&mut self, scan: &Arc<Scan>) -> bool;
    /// A scan is complete. Returns whether it was queued.
    fn finished_data_avail(&mut self, scan: &Arc<Scan>) -> bool;
    fn full(&self) -> bool;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceKind {
    Rx,
    Tx,
}

/// A point-in-time view of one device, for the manager and the status report.
#[derive(Debug, Clone, PartialEq)]
pub struct DeviceSnapshot {
    pub id: DeviceId,
    pub kind: DeviceKind,
    pub mode: ConnMode,
    pub description: String,
    pub status: CommStatus,
    pub service: ServiceType,
    pub enabled: bool,
    pub connected: bool,
    pub peer: String,
    pub request: Option<ReqId>,
    pub alert: AlertStatus,
    pub alert_text: String,
    pub bytes: u64,
    pub scans: u64,
    pub radar_name: String,
    pub queue_len: usize,
    pub semi_perm: bool,
    /// Transient device that has served its call or timed out.
    pub retired: bool,
}

pub enum Device {
    Rx(RxDevice),
    Tx(TxDevice),
}

impl Device {
    pub fn id(&self) -> DeviceId {
        match self {
            Device::Rx(d) => d.id,
            Device::Tx(d) => d.id,
        }
    }

    pub fn tick(&mut self) {
        match self {
            Device::Rx(d) => d.tick(),
            Device::Tx(d) => d.tick(),
        }
    }

    pub fn snapshot(&self) -> DeviceSnapshot {
        match self {
            Device::Rx(d) => d.snapshot(),
            Device::Tx(d) => d.snapshot(),
        }
    }

    pub fn loop_delay(&self) -> Duration {
        let secs = match self {
            Device::Rx(d) => d.opts.loop_delay,
            Device::Tx(d) => d.opts.loop_delay,
        };
        Duration::from_secs_f64(secs.clamp(0.01, 60.0))
    }

    pub fn is_stopped(&self) -> bool {
        match self {
            Device::Rx(d) => d.is_stopped(),
            Device::Tx(d) => d.is_stopped(),
        }
    }

    pub fn as_rx_mut(&mut self) -> Option<&mut RxDevice> {
        match self {
            Device::Rx(d) => Some(d),
            Device::Tx(_) => None,
        }
    }

    pub fn as_tx_mut(&mut self) -> Option<&mut TxDevice> {
        match self {
            Device::Tx(d) => Some(d),
            Device::Rx(_) => None,
        }
    }
}

pub type SharedDevice = Arc<Mutex<Device>>;

/// Tries for `timeout` to take `m`, then gives up with a warning instead of blocking.
pub fn advisory_lock<'a, T>(
    m: &'a Mutex<T>,
    timeout: Duration,
    who: &str,
) -> Option<MutexGuard<'a, T>> {
    let start = Instant::now();
    loop {
        match m.try_lock() {
            Ok(guard) => return Some(guard),
            Err(TryLockError::Poisoned(p)) => return Some(p.into_inner()),
            Err(TryLockError::WouldBlock) => {
                if start.elapsed() >= timeout {
                    warn!(device = who, "lock not acquired within {timeout:?}, skipping");
                    return None;
                }
                std::thread::sleep(Duration::from_millis(1));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn pending_counts_follow_drain() {
        let (tx, mb) = mailbox();
        assert!(tx.send(DeviceCommand::Enable));
        assert!(tx.send(DeviceCommand::Clear));
        assert_eq!(tx.pending(), 2);
        let cmds = mb.drain();
        assert_eq!(cmds.len(), 2);
        assert_eq!(format!("{:?}", cmds[1]), "Clear");
        assert_eq!(tx.pending(), 0);
        drop(mb);
        assert!(!tx.send(DeviceCommand::Stop));
        assert_eq!(tx.pending(), 0);
    }

    #[test]
    fn advisory_lock_gives_up() {
        let m = Mutex::new(1);
        let held = m.lock().unwrap();
        assert!(advisory_lock(&m, Duration::from_millis(20), "test").is_none());
        drop(held);
        assert_eq!(
            advisory_lock(&m, Duration::from_millis(20), "test").map(|g| *g),
            Some(1)
        );
    }
}
