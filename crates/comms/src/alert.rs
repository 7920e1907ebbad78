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

//! Operator alerts raised by devices, with re-alert timing and sounds.

use crate::clock::Timestamp;
use serde::{Deserialize, Serialize};
use strum::Display;
use tracing::{debug, info, warn};

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash, Display)]
pub enum AlertStatus {
    #[default]
    Ok,
    ConnFailed,
    ConnLost,
    ReconnFailed,
    AckFail,
    StatFailed,
    ClearAckFail,
    RadarFault,
    ConnTimedOut,
}

/// Plays an alert sound file.
pub trait SoundPlayer: Send + Sync {
    fn play(&self, file: &str);
}

/// Sound player for headless operation.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogSoundPlayer;

impl SoundPlayer for LogSoundPlayer {
    fn play(&self, file: &str) {
        debug!(file, "alert sound");
    }
}

/// Process-wide alert switches.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AlertSwitches {
    pub silence_all: bool,
    pub suppress_all: bool,
}

pub const DEFAULT_REALERT_SECS: i64 = 15 * 60;

#[derive(Debug, Clone)]
pub struct AlertState {
    pub status: AlertStatus,
    pub text: String,
    pub first_posted: Timestamp,
    pub realert_at: Timestamp,
    pub realert_period: i64,
    pub suppressed: bool,
    pub silenced: bool,
    pub fail_sound: Option<String>,
    pub cleared_sound: Option<String>,
    pub ackfail_sound: Option<String>,
    pub posted: u32,
}

impl Default for AlertState {
    fn default() -> Self {
        Self {
            status: AlertStatus::Ok,
            text: String::new(),
            first_posted: 0,
            realert_at: 0,
            realert_period: DEFAULT_REALERT_SECS,
            suppressed: false,
            silenced: false,
            fail_sound: None,
            cleared_sound: None,
            ackfail_sound: None,
            posted: 0,
        }
    }
}

impl AlertState {
    pub fn is_active(&self) -> bool {
        self.status != AlertStatus::Ok
    }

    fn sound(&self, switches: AlertSwitches, player: &dyn SoundPlayer, file: Option<&String>) {
        if self.silenced || switches.silence_all {
            return;
        }
        if let Some(f) = file {
            player.play(f);
        }
    }

    /// Raises `status`. A repeat of the current alert is only re-posted once its
    /// re-alert time has passed. An ack failure holds until `ClearAckFail` is posted.
    /// Returns whether anything was posted.
    pub fn post(
        &mut self,
        status: AlertStatus,
        text: &str,
        now: Timestamp,
        switches: AlertSwitches,
        player: &dyn SoundPlayer,
        who: &str,
    ) -> bool {
        match status {
            AlertStatus::Ok => return self.clear(now, switches, player, who),
            AlertStatus::ClearAckFail => {
                if self.status != AlertStatus::AckFail {
                    return false;
                }
                self.status = AlertStatus::Ok;
                self.text = text.to_string();
                info!(device = who, "{text}");
                self.sound(switches, player, self.cleared_sound.as_ref());
                return true;
            }
            _ => {}
        }
        if self.status == AlertStatus::AckFail && status != AlertStatus::AckFail {
            return false;
        }
        if self.status == status && now < self.realert_at {
            return false;
        }
        if self.status != status {
            self.first_posted = now;
        }
        self.status = status;
        self.text = text.to_string();
        self.realert_at = now + self.realert_period;
        if self.suppressed || switches.suppress_all {
            debug!(device = who, alert = %status, "suppressed alert: {text}");
            return false;
        }
        self.posted += 1;
        warn!(device = who, alert = %status, "{text}");
        let file = if status == AlertStatus::AckFail {
            self.ackfail_sound.as_ref().or(self.fail_sound.as_ref())
        } else {
            self.fail_sound.as_ref()
        };
        self.sound(switches, player, file);
        true
    }

    /// Clears any alert other than a held ack failure.
    pub fn clear(
        &mut self,
        _now: Timestamp,
        switches: AlertSwitches,
        player: &dyn SoundPlayer,
        who: &str,
    ) -> bool {
        if matches!(self.status, AlertStatus::Ok | AlertStatus::AckFail) {
            return false;
        }
        info!(device = who, was = %self.status, "alert cleared");
        self.status = AlertStatus::Ok;
        self.text.clear();
        self.realert_at = 0;
        if !(self.suppressed || switches.suppress_all) {
            self.sound(switches, player, self.cleared_sound.as_ref());
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::sync::Mutex;

    #[derive(Default)]
    struct Recorder(Mutex<Vec<String>>);

    impl SoundPlayer for Recorder {
        fn play(&self, file: &str) {
            self.0.lock().unwrap().push(file.to_string());
        }
    }

    fn state() -> AlertState {
        AlertState {
            fail_sound: Some("fail.au".into()),
            cleared_sound: Some("ok.au".into()),
            ackfail_sound: Some("ack.au".into()),
            ..Default::default()
        }
    }

    #[test]
    fn realert_after_period() {
        let player = Recorder::default();
        let sw = AlertSwitches::default();
        let mut a = state();
        assert!(a.post(AlertStatus::ConnLost, "lost", 0, sw, &player, "rx1"));
        assert!(!a.post(AlertStatus::ConnLost, "lost", 100, sw, &player, "rx1"));
        assert!(a.post(AlertStatus::ConnLost, "lost", 900, sw, &player, "rx1"));
        assert_eq!(a.first_posted, 0);
        assert!(a.clear(901, sw, &player, "rx1"));
        assert!(!a.clear(902, sw, &player, "rx1"));
        assert_eq!(
            *player.0.lock().unwrap(),
            vec!["fail.au", "fail.au", "ok.au"]
        );
    }

    #[test]
    fn ack_fail_is_sticky() {
        let player = Recorder::default();
        let sw = AlertSwitches::default();
        let mut a = state();
        assert!(a.post(AlertStatus::AckFail, "no ack", 0, sw, &player, "tx1"));
        assert!(!a.post(AlertStatus::ConnLost, "lost", 1, sw, &player, "tx1"));
        assert!(!a.clear(2, sw, &player, "tx1"));
        assert_eq!(a.status, AlertStatus::AckFail);
        assert!(a.post(AlertStatus::ClearAckFail, "Scan acknowledged OK", 3, sw, &player, "tx1"));
        assert_eq!(a.status, AlertStatus::Ok);
        assert_eq!(*player.0.lock().unwrap(), vec!["ack.au", "ok.au"]);
    }

    #[test]
    fn switches_quiet_alerts() {
        let player = Recorder::default();
        let mut a = state();
        let silent = AlertSwitches {
            silence_all: true,
            suppress_all: false,
        };
        assert!(a.post(AlertStatus::ConnFailed, "x", 0, silent, &player, "rx"));
        let suppressed = AlertSwitches {
            silence_all: false,
            suppress_all: true,
        };
        assert!(!a.post(AlertStatus::RadarFault, "y", 1, suppressed, &player, "rx"));
        assert_eq!(a.status, AlertStatus::RadarFault);
        assert!(player.0.lock().unwrap().is_empty());
    }
}
