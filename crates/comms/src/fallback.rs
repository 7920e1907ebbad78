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

//! Failover control attached to an rxdevice.
//!
//! A controller watches a `detected` flag. With `station == 0` the flag follows the
//! parent device's own connection state; otherwise it is driven by the network
//! status watcher for that station. Transitions produce actions the manager applies;
//! the suppression switches are restated on every check.

use crate::schedule::ScheduleEntry;
use crate::types::DeviceId;
use tracing::info;

#[derive(Debug, Clone, PartialEq)]
pub enum FallbackAction {
    ActivateSchedules {
        parent: DeviceId,
        entries: Vec<ScheduleEntry>,
    },
    DeactivateSchedules {
        parent: DeviceId,
    },
    EnableDevice(DeviceId),
    DisableDevice(DeviceId),
    SetScheduleEnabled(bool),
    SetOtherDevicesEnabled(bool),
}

#[derive(Debug, Clone, Default)]
pub struct FallbackController {
    pub parent: DeviceId,
    /// 0 follows the parent's connection; otherwise the station named in fallback notices.
    pub station: i32,
    pub entries: Vec<ScheduleEntry>,
    pub secondary: Option<DeviceId>,
    /// Keep the main schedule off while the parent is healthy.
    pub suppress_main_schedule: bool,
    /// Keep every other rxdevice off while the parent is healthy.
    pub suppress_other_devices: bool,
    pub detected: bool,
    pub in_fallback: bool,
}

impl FallbackController {
    pub fn new(parent: DeviceId) -> Self {
        Self {
            parent,
            ..Default::default()
        }
    }

    pub fn is_configured(&self) -> bool {
        !self.entries.is_empty()
            || self.secondary.is_some()
            || self.suppress_main_schedule
            || self.suppress_other_devices
    }

    pub fn follows_parent(&self) -> bool {
        self.station == 0
    }

    /// What the healthy state implies, applied once after loading.
    pub fn healthy_actions(&self) -> Vec<FallbackAction> {
        self.suppress_actions(false)
    }

    /// The schedule and other-device switches for `in_fallback`.
    fn suppress_actions(&self, in_fallback: bool) -> Vec<FallbackAction> {
        let mut actions = vec![];
        if self.suppress_main_schedule {
            actions.push(FallbackAction::SetScheduleEnabled(in_fallback));
        }
        if self.suppress_other_devices {
            actions.push(FallbackAction::SetOtherDevicesEnabled(in_fallback));
        }
        actions
    }

    /// Compares `detected` with the current mode. Returns whether the mode changed
    /// along with the actions to apply. The suppression switches are always included.
    pub fn check(&mut self) -> (bool, Vec<FallbackAction>) {
        if self.detected == self.in_fallback {
            return (false, self.suppress_actions(self.in_fallback));
        }
        self.in_fallback = self.detected;
        let entering = self.in_fallback;
        info!(
            device = self.parent,
            station = self.station,
            "fallback {}",
            if entering { "invoked" } else { "cleared" }
        );

        let mut actions = vec![];
        if !self.entries.is_empty() {
            actions.push(if entering {
                FallbackAction::ActivateSchedules {
                    parent: self.parent,
                    entries: self.entries.clone(),
                }
            } else {
                FallbackAction::DeactivateSchedules {
                    parent: self.parent,
                }
            });
        }
        if let Some(dev) = self.secondary {
            actions.push(if entering {
                FallbackAction::EnableDevice(dev)
            } else {
                FallbackAction::DisableDevice(dev)
            });
        }
        if !self.follows_parent() {
            actions.push(if entering {
                FallbackAction::DisableDevice(self.parent)
            } else {
                FallbackAction::EnableDevice(self.parent)
            });
        }
        actions.extend(self.suppress_actions(entering));
        (true, actions)
    }
}
