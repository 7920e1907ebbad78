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

//! Flag files dropped into the control directory by operators and other processes.

use crate::clock::Timestamp;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::SystemTime;
use tracing::{info, warn};

pub const QUIET_FLAG: &str = "rpcomm.quiet";
pub const NEW_CONFIG_FLAG: &str = "rpcomm.newcfg";
pub const ADD_CONFIG_FLAG: &str = "rpcomm.addcfg";
pub const DUMP_SCHED_FLAG: &str = "rpcomm.dumpsched";
pub const DUMP_CONN_FLAG: &str = "rpcomm.dumpconn";
pub const DUMP_SCHED_FILE: &str = "dumpsched.txt";
pub const DUMP_CONN_FILE: &str = "dumpconn.txt";
pub const NETWORK_STATUS_FILE: &str = "cisco_status.warn";
pub const GLOBAL_FALLBACK_FLAG: &str = "rpcomm.fallback";
pub const CONTROL_POLL_SECS: i64 = 15;

const FALLBACK_NOTICE: &str = "Fallback mode invoked for stnid=";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlAction {
    Quiet(bool),
    /// Close everything and load again, from the named file if one was given.
    Reload(Option<PathBuf>),
    /// Merge another config into the running one.
    Add(PathBuf),
    DumpSchedules,
    DumpConnections,
}

pub struct ControlFiles {
    dir: PathBuf,
    next_poll: Timestamp,
    quiet: bool,
    network_mtime: Option<SystemTime>,
}

impl ControlFiles {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            next_poll: 0,
            quiet: false,
            network_mtime: None,
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn path(&self, name: &str) -> PathBuf {
        self.dir.join(name)
    }

    pub fn is_quiet(&self) -> bool {
        self.quiet
    }

    /// Reads and deletes a flag file, returning its first word (possibly empty).
    fn take_flag(&self, name: &str) -> Option<String> {
        let path = self.path(name);
        let contents = match fs::read_to_string(&path) {
            Ok(c) => c,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return None,
            Err(e) => {
                warn!("cannot read flag {}: {e}", path.display());
                String::new()
            }
        };
        if let Err(e) = fs::remove_file(&path) {
            warn!("cannot remove flag {}: {e}", path.display());
        }
        Some(
            contents
                .split_whitespace()
                .next()
                .unwrap_or_default()
                .to_string(),
        )
    }

    fn existing_config(&self, name: &str) -> Option<PathBuf> {
        if name.is_empty() {
            return None;
        }
        let p = Path::new(name);
        let p = if p.is_absolute() {
            p.to_path_buf()
        } else {
            self.dir.join(p)
        };
        p.exists().then_some(p)
    }

    /// Checks the flag files if the poll period has passed.
    pub fn poll(&mut self, now: Timestamp) -> Vec<ControlAction> {
        if now < self.next_poll {
            return vec![];
        }
        self.next_poll = now + CONTROL_POLL_SECS;
        let mut actions = vec![];

        let quiet = self.path(QUIET_FLAG).exists();
        if quiet != self.quiet {
            self.quiet = quiet;
            actions.push(ControlAction::Quiet(quiet));
        }
        if let Some(name) = self.take_flag(NEW_CONFIG_FLAG) {
            let path = self.existing_config(&name);
            warn!(
                "new config flag detected, reloading comms config from {}",
                path.as_ref()
                    .map(|p| p.display().to_string())
                    .unwrap_or_else(|| "the current file".into())
            );
            actions.push(ControlAction::Reload(path));
        }
        if let Some(name) = self.take_flag(ADD_CONFIG_FLAG) {
            match self.existing_config(&name) {
                Some(path) => {
                    warn!("add config flag detected, adding comms config from {}", path.display());
                    actions.push(ControlAction::Add(path));
                }
                None => warn!("add config flag detected but no valid file to add"),
            }
        }
        if self.take_flag(DUMP_SCHED_FLAG).is_some() {
            actions.push(ControlAction::DumpSchedules);
        }
        if self.take_flag(DUMP_CONN_FLAG).is_some() {
            actions.push(ControlAction::DumpConnections);
        }
        actions
    }

    pub fn global_fallback(&self) -> bool {
        self.path(GLOBAL_FALLBACK_FLAG).exists()
    }

    /// The stations named in the network status file, when it changed since last read.
    pub fn network_status(&mut self) -> Option<Vec<i32>> {
        let path = self.path(NETWORK_STATUS_FILE);
        let mtime = fs::metadata(&path).and_then(|m| m.modified()).ok()?;
        if self.network_mtime == Some(mtime) {
            return None;
        }
        self.network_mtime = Some(mtime);
        info!("{} changed", path.display());
        let text = fs::read_to_string(&path).ok()?;
        let stations = text
            .lines()
            .filter_map(|l| l.trim().strip_prefix(FALLBACK_NOTICE))
            .filter_map(|s| s.trim().parse().ok())
            .collect::<Vec<i32>>();
        for stn in &stations {
            info!(station = stn, "fallback mode detected");
        }
        Some(stations)
    }

    pub fn write_dump(&self, name: &str, text: &str) -> io::Result<()> {
        fs::write(self.path(name), text)
    }
}
