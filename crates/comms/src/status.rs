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

//! The plain-text status report, and the per-radar external status files.

use crate::alert::AlertStatus;
use crate::clock::Timestamp;
use crate::device::{DeviceKind, DeviceSnapshot};
use std::fmt;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

pub const DEFAULT_STATUS_FILE: &str = "rpcomm_status.txt";
pub const DEFAULT_STATUS_PERIOD: i64 = 120;

/// Everything the status report shows, gathered by the manager in one sweep.
#[derive(Debug, Clone)]
pub struct StatusReport {
    pub now: Timestamp,
    pub schedule_enabled: bool,
    pub create_txdev_on_demand: bool,
    pub listen_backlog: i32,
    pub refused: u64,
    pub port: u16,
    pub bind_failed: bool,
    pub total_rx_bytes: u64,
    pub devices: Vec<DeviceSnapshot>,
}

fn wall_time(t: Timestamp) -> SystemTime {
    UNIX_EPOCH + Duration::from_secs(t.max(0) as u64)
}

fn write_alerts(f: &mut fmt::Formatter<'_>, devices: &[&DeviceSnapshot]) -> fmt::Result {
    for d in devices.iter().filter(|d| d.alert != AlertStatus::Ok) {
        writeln!(f, "{} ALERT {} - {}", d.description, d.alert, d.alert_text)?;
    }
    Ok(())
}

fn write_device(f: &mut fmt::Formatter<'_>, d: &DeviceSnapshot) -> fmt::Result {
    write!(
        f,
        "{} ({}) state={} enabled={} ",
        d.description, d.mode, d.status, d.enabled as i32
    )?;
    if d.connected {
        write!(f, "peer={} ", d.peer)?;
    }
    match d.kind {
        DeviceKind::Rx => {
            write!(f, "rx={:.1}KB scans={}", d.bytes as f64 / 1000.0, d.scans)?;
            if let Some(req) = d.request {
                write!(f, " request={req}")?;
            }
            if d.semi_perm {
                f.write_str(" semi-permanent")?;
            }
            if !d.radar_name.is_empty() {
                write!(f, " radar={}", d.radar_name)?;
            }
        }
        DeviceKind::Tx => {
            write!(
                f,
                "tx={:.1}KB scans={} queued={}",
                d.bytes as f64 / 1000.0,
                d.scans,
                d.queue_len
            )?;
            if !d.radar_name.is_empty() {
                write!(f, " last={}", d.radar_name)?;
            }
        }
    }
    writeln!(f)
}

impl fmt::Display for StatusReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "Rapic Communications Status Report - {}",
            humantime::format_rfc3339_seconds(wall_time(self.now))
        )?;
        writeln!(f, "Schedule Enabled = {}", self.schedule_enabled as i32)?;
        writeln!(f, "createTxDevOnDemand={}", self.create_txdev_on_demand as i32)?;
        writeln!(f, "Available TxDevices={}", self.listen_backlog)?;
        if self.refused > 0 {
            writeln!(f, "Txdevice service requests refused={}", self.refused)?;
        }
        writeln!(f, "Rapic Serving on port {}", self.port)?;
        if self.bind_failed {
            writeln!(
                f,
                "**** BIND TO PORT {} FAILED, UNABLE TO LISTEN FOR INCOMING CONNECTIONS ****",
                self.port
            )?;
        }
        writeln!(
            f,
            "Total Comms data received = {:.1}MB",
            self.total_rx_bytes as f64 / 1_000_000.0
        )?;

        let rx: Vec<_> = self.devices.iter().filter(|d| d.kind == DeviceKind::Rx).collect();
        let tx: Vec<_> = self.devices.iter().filter(|d| d.kind == DeviceKind::Tx).collect();
        writeln!(f, "\n---------Rx Device Alerts---")?;
        write_alerts(f, &rx)?;
        writeln!(f, "\n---------Tx Devices Alerts---")?;
        write_alerts(f, &tx)?;
        writeln!(f, "\n---------Rx Devices----------")?;
        for d in &rx {
            write_device(f, d)?;
        }
        writeln!(f, "\n---------Tx Devices----------")?;
        for d in &tx {
            write_device(f, d)?;
        }
        Ok(())
    }
}

fn with_suffix(path: &Path, suffix: &str) -> PathBuf {
    let mut s = path.as_os_str().to_os_string();
    s.push(suffix);
    PathBuf::from(s)
}

/// Writes `contents` to `<path>.temp` and renames it into place.
pub fn replace_file(path: &Path, contents: &str) -> io::Result<()> {
    let temp = with_suffix(path, ".temp");
    fs::write(&temp, contents)?;
    fs::rename(&temp, path)
}

pub fn write_status_file(path: &Path, report: &StatusReport) -> io::Result<()> {
    replace_file(path, &report.to_string())
}

/// Writes a radar's `EXTSTS:` text and raises its `.flg` marker for whatever
/// picks the status up.
pub fn write_radar_status(path: &Path, text: &str) -> io::Result<()> {
    fs::write(path, format!("{text}\n"))?;
    let flag = with_suffix(path, ".flg");
    match fs::remove_file(&flag) {
        Ok(()) => {}
        Err(e) if e.kind() == io::ErrorKind::NotFound => {}
        Err(e) => return Err(e),
    }
    #[cfg(unix)]
    {
        std::os::unix::fs::symlink(path, &flag)
    }
    #[cfg(not(unix))]
    {
        fs::write(&flag, b"")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{CommStatus, ConnMode, ServiceType};
    use pretty_assertions::assert_eq;

    fn snapshot(id: usize, kind: DeviceKind) -> DeviceSnapshot {
        DeviceSnapshot {
            id,
            kind,
            mode: ConnMode::Socket,
            description: format!("dev{id}"),
            status: CommStatus::Connected,
            service: ServiceType::SemiPerm,
            enabled: true,
            connected: true,
            peer: "radar.example 15555".into(),
            request: None,
            alert: AlertStatus::Ok,
            alert_text: String::new(),
            bytes: 2500,
            scans: 3,
            radar_name: String::new(),
            queue_len: 1,
            semi_perm: true,
            retired: false,
        }
    }

    #[test]
    fn report_sections() {
        let mut lost = snapshot(2, DeviceKind::Rx);
        lost.alert = AlertStatus::ConnLost;
        lost.alert_text = "Connection lost while reading data".into();
        let report = StatusReport {
            now: 0,
            schedule_enabled: true,
            create_txdev_on_demand: false,
            listen_backlog: 2,
            refused: 0,
            port: 15555,
            bind_failed: true,
            total_rx_bytes: 1_500_000,
            devices: vec![snapshot(1, DeviceKind::Rx), lost, snapshot(3, DeviceKind::Tx)],
        };
        let text = report.to_string();
        assert!(text.starts_with("Rapic Communications Status Report - 1970-01-01T00:00:00Z\n"));
        assert!(text.contains("Available TxDevices=2\n"));
        assert!(text.contains("**** BIND TO PORT 15555 FAILED"));
        assert!(text.contains("Total Comms data received = 1.5MB\n"));
        assert!(text.contains(
            "---------Rx Device Alerts---\ndev2 ALERT ConnLost - Connection lost while reading data\n"
        ));
        assert!(text.contains(
            "dev3 (Socket) state=CONNECTED enabled=1 peer=radar.example 15555 tx=2.5KB scans=3 queued=1\n"
        ));
    }

    #[test]
    fn status_file_replaced_whole() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(DEFAULT_STATUS_FILE);
        replace_file(&path, "first\n").unwrap();
        replace_file(&path, "second\n").unwrap();
        assert_eq!(fs::read_to_string(&path).unwrap(), "second\n");
        assert!(!with_suffix(&path, ".temp").exists());
    }

    #[test]
    fn radar_status_raises_flag() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("stn3.status");
        write_radar_status(&path, "TX ON").unwrap();
        write_radar_status(&path, "TX OFF").unwrap();
        assert_eq!(fs::read_to_string(&path).unwrap(), "TX OFF\n");
        assert!(with_suffix(&path, ".flg").exists());
    }
}
