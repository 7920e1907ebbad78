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

//! The manager's handle on one device, and the per-device worker thread.

use crate::device::{
    CommandSender, Device, DeviceCommand, DeviceKind, DeviceSnapshot, SharedDevice, advisory_lock,
};
use crate::error::CommsError;
use crate::types::{ConnMode, DeviceId};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::{debug, error, info};

pub struct DeviceHandle {
    pub id: DeviceId,
    pub kind: DeviceKind,
    pub mode: ConnMode,
    pub group_id: i32,
    pub fb_group: i32,
    /// Last enable state the manager asked for; the device catches up on its next tick.
    pub enabled: bool,
    pub cmds: CommandSender,
    pub device: SharedDevice,
    stop: Arc<AtomicBool>,
    worker: Option<JoinHandle<()>>,
}

impl DeviceHandle {
    pub fn new(device: Device, cmds: CommandSender, group_id: i32, fb_group: i32) -> Self {
        let (id, kind, mode) = match &device {
            Device::Rx(d) => (d.id, DeviceKind::Rx, d.mode),
            Device::Tx(d) => (d.id, DeviceKind::Tx, d.mode),
        };
        Self {
            id,
            kind,
            mode,
            group_id,
            fb_group,
            enabled: false,
            cmds,
            device: Arc::new(Mutex::new(device)),
            stop: Arc::new(AtomicBool::new(false)),
            worker: None,
        }
    }

    fn thread_name(&self) -> String {
        match self.kind {
            DeviceKind::Rx => format!("rxdev-{}", self.id),
            DeviceKind::Tx => format!("txdev-{}", self.id),
        }
    }

    /// Starts a thread that ticks the device every loop delay until stopped.
    pub fn spawn(&mut self) -> Result<(), CommsError> {
        let device = self.device.clone();
        let stop = self.stop.clone();
        let name = self.thread_name();
        let handle = thread::Builder::new()
            .name(name.clone())
            .spawn(move || {
                debug!(worker = %name, "device worker started");
                while !stop.load(Ordering::Relaxed) {
                    let delay = {
                        let mut d = crate::lock(&device);
                        d.tick();
                        if d.is_stopped() {
                            break;
                        }
                        d.loop_delay()
                    };
                    thread::sleep(delay);
                }
                debug!(worker = %name, "device worker exiting");
            })
            .map_err(CommsError::Worker)?;
        self.worker = Some(handle);
        Ok(())
    }

    pub fn is_threaded(&self) -> bool {
        self.worker.is_some()
    }

    pub fn send(&self, cmd: DeviceCommand) -> bool {
        self.cmds.send(cmd)
    }

    /// One tick from the sweep; used when the device has no worker.
    pub fn tick(&self, lock_timeout: Duration) {
        if let Some(mut d) = advisory_lock(&self.device, lock_timeout, &self.thread_name()) {
            d.tick();
        }
    }

    pub fn snapshot(&self, lock_timeout: Duration) -> Option<DeviceSnapshot> {
        advisory_lock(&self.device, lock_timeout, &self.thread_name()).map(|d| d.snapshot())
    }

    /// The snapshot plus, when it was taken with no command waiting, the number of
    /// commands it reflects. Devices drain their mailbox under the same lock, so such
    /// a snapshot has seen every command sent before it.
    pub fn settled_snapshot(&self, lock_timeout: Duration) -> Option<(DeviceSnapshot, Option<u64>)> {
        advisory_lock(&self.device, lock_timeout, &self.thread_name()).map(|d| {
            let sent = self.cmds.sent();
            let settled = (self.cmds.pending() == 0).then_some(sent);
            (d.snapshot(), settled)
        })
    }

    pub fn with_device<R>(&self, lock_timeout: Duration, f: impl FnOnce(&mut Device) -> R) -> Option<R> {
        advisory_lock(&self.device, lock_timeout, &self.thread_name()).map(|mut d| f(&mut d))
    }

    /// Sends `Stop`, raises the stop flag and waits for the worker to exit.
    pub fn stop(&mut self) {
        self.send(DeviceCommand::Stop);
        self.stop.store(true, Ordering::Relaxed);
        match self.worker.take() {
            Some(handle) => {
                if handle.join().is_err() {
                    error!(device = self.id, "device worker panicked");
                }
                // The worker may have exited before draining Stop.
                crate::lock(&self.device).tick();
            }
            None => crate::lock(&self.device).tick(),
        }
        info!(device = self.id, kind = ?self.kind, "device stopped");
    }
}

impl Drop for DeviceHandle {
    fn drop(&mut self) {
        if self.worker.is_some() {
            self.stop();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alert::LogSoundPlayer;
    use crate::clock::ManualClock;
    use crate::device::{DeviceEnv, GlobalSettings, mailbox};
    use crate::rxdevice::{RxDevice, RxOptions};
    use crate::transport::TransportFactory;
    use crate::transport::mock::MockNet;
    use crate::types::CommStatus;
    use arc_swap::ArcSwap;
    use std::time::Instant;

    fn handle(net: &MockNet) -> DeviceHandle {
        let (events, _rx) = flume::unbounded();
        let env = DeviceEnv {
            clock: Arc::new(ManualClock::new(1000)),
            events,
            settings: Arc::new(ArcSwap::from_pointee(GlobalSettings::default())),
            sounds: Arc::new(LogSoundPlayer),
        };
        let (cmds, mb) = mailbox();
        let opts = RxOptions {
            loop_delay: 0.01,
            ..Default::default()
        };
        let transport = net.create(ConnMode::Socket).unwrap();
        let dev = RxDevice::new(7, ConnMode::Socket, "7", opts, transport, mb, env);
        DeviceHandle::new(Device::Rx(dev), cmds, 0, 0)
    }

    #[test]
    fn worker_ticks_until_stopped() {
        let net = MockNet::new();
        let mut h = handle(&net);
        h.spawn().unwrap();
        assert!(h.is_threaded());
        h.send(DeviceCommand::Enable);
        h.send(DeviceCommand::Connect("radar.example 15555".into()));

        let start = Instant::now();
        while net.connects().is_empty() && start.elapsed() < Duration::from_secs(5) {
            thread::sleep(Duration::from_millis(5));
        }
        assert_eq!(net.connects(), vec!["radar.example 15555".to_string()]);

        h.stop();
        assert!(!h.is_threaded());
        let snap = h.snapshot(Duration::from_millis(50)).unwrap();
        assert!(!snap.connected);
    }

    #[test]
    fn settled_only_once_commands_are_drained() {
        let net = MockNet::new();
        let h = handle(&net);
        let lock_timeout = Duration::from_millis(50);
        assert_eq!(h.settled_snapshot(lock_timeout).unwrap().1, Some(0));
        h.send(DeviceCommand::Enable);
        assert_eq!(h.settled_snapshot(lock_timeout).unwrap().1, None);
        h.tick(lock_timeout);
        assert_eq!(h.settled_snapshot(lock_timeout).unwrap().1, Some(1));
        assert_eq!(h.cmds.sent(), 1);
    }

    #[test]
    fn unthreaded_handle_ticks_from_sweep() {
        let net = MockNet::new();
        let h = handle(&net);
        h.send(DeviceCommand::Disable);
        h.tick(Duration::from_millis(50));
        let snap = h.snapshot(Duration::from_millis(50)).unwrap();
        assert_eq!(snap.status, CommStatus::Disabled);
        assert_eq!(h.cmds.pending(), 0);
    }
}
