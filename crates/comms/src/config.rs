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

//! The `rpcomm.ini` style comms configuration.
//!
//! The file is line oriented. `#` starts a comment line and a trailing `\` carries an
//! entry onto the next line; device entries use those continuation lines for their
//! options. Each entry is dispatched on its leading directive name. A line that does
//! not parse is logged and skipped, and the rest of the file still loads.
//!
//! Device-wide settings such as `rxdevice_loopdelay=` only affect device lines that
//! follow them.

use crate::alert::AlertSwitches;
use crate::catalog::Connection;
use crate::error::{CommsError, ParseError};
use crate::filter::{FILTER_PREFIX, ScanFilter};
use crate::request::CommRequest;
use crate::rxdevice::RxOptions;
use crate::schedule::{ScheduleEntry, ScheduleList};
use crate::status::{DEFAULT_STATUS_FILE, DEFAULT_STATUS_PERIOD};
use crate::transport::SocketOptions;
use crate::txdevice::TxOptions;
use crate::types::ConnMode;
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::SystemTime;
use tracing::{debug, info, warn};

pub const DEFAULT_SERVER_PORT: u16 = 15555;
const MAX_RECENT_MINS: i64 = 360;
const SAVE_HEADER: &str = "# rpcomm config saved";

#[derive(Debug, Clone, Default)]
pub struct FallbackSpec {
    /// 0 follows the parent's own link; otherwise the station named in fallback notices.
    pub station: i32,
    pub schedules: Vec<ScheduleEntry>,
    pub device: Option<Box<RxDeviceSpec>>,
    pub suppress_main_schedule: bool,
    pub suppress_other_devices: bool,
}

#[derive(Debug, Clone)]
pub struct RxDeviceSpec {
    pub mode: ConnMode,
    pub port_name: String,
    /// Present for a dedicated semi-permanent device; absent for a request pool device.
    pub connstr: Option<String>,
    pub opts: RxOptions,
    pub filters: Vec<ScanFilter>,
    pub fallback: Option<FallbackSpec>,
}

impl RxDeviceSpec {
    fn fallback(&mut self) -> &mut FallbackSpec {
        self.fallback.get_or_insert_with(FallbackSpec::default)
    }
}

#[derive(Debug, Clone)]
pub struct TxDeviceSpec {
    pub mode: ConnMode,
    pub port_name: String,
    /// Present for a device that calls out; absent for one that listens.
    pub connstr: Option<String>,
    pub opts: TxOptions,
    pub filters: Vec<ScanFilter>,
}

/// Process-wide settings from the config file.
#[derive(Debug, Clone)]
pub struct Globals {
    pub alerts: AlertSwitches,
    pub check_radls_for_mssg: bool,
    pub create_txdev_on_demand: bool,
    pub disable_listen: bool,
    pub status_file: PathBuf,
    pub status_period: i64,
    pub server_port: u16,
    pub serve_recent_data_mins: i64,
    pub socket: SocketOptions,
    pub use_ip_name_cache: bool,
    /// Template for on-demand txdevices.
    pub tx_defaults: TxOptions,
}

impl Default for Globals {
    fn default() -> Self {
        Self {
            alerts: AlertSwitches::default(),
            check_radls_for_mssg: false,
            create_txdev_on_demand: false,
            disable_listen: false,
            status_file: PathBuf::from(DEFAULT_STATUS_FILE),
            status_period: DEFAULT_STATUS_PERIOD,
            server_port: DEFAULT_SERVER_PORT,
            serve_recent_data_mins: 0,
            socket: SocketOptions::default(),
            use_ip_name_cache: false,
            tx_defaults: TxOptions::default(),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct CommsConfig {
    /// The file actually read, which may be the `.sav` copy.
    pub path: Option<PathBuf>,
    /// Physical lines as read, kept for `save_config`.
    pub source: Vec<String>,
    pub rx_devices: Vec<RxDeviceSpec>,
    pub tx_devices: Vec<TxDeviceSpec>,
    pub connections: Vec<Connection>,
    pub requests: Vec<CommRequest>,
    pub schedules: Vec<ScheduleEntry>,
    pub globals: Globals,
    /// Lines rejected while loading.
    pub rejected: usize,
}

fn with_suffix(path: &Path, suffix: &str) -> PathBuf {
    let mut s = path.as_os_str().to_os_string();
    s.push(suffix);
    PathBuf::from(s)
}

/// Splits the text into entries of one head line plus its continuation lines.
/// Comment lines inside a continuation are dropped but keep the entry open.
fn entries(text: &str) -> Vec<(usize, Vec<&str>)> {
    let mut out: Vec<(usize, Vec<&str>)> = vec![];
    let mut open = false;
    for (n, raw) in text.lines().enumerate() {
        let trimmed = raw.trim_end();
        let continues = trimmed.ends_with('\\');
        let body = trimmed.trim_end_matches('\\').trim();
        let comment = body.starts_with('#');
        if open {
            if let Some((_, lines)) = out.last_mut()
                && !comment
                && !body.is_empty()
            {
                lines.push(body);
            }
        } else if !comment && !body.is_empty() {
            out.push((n + 1, vec![body]));
        } else {
            continue;
        }
        open = continues;
    }
    out
}

/// The directive name: everything before the first `=` or blank.
fn directive(line: &str) -> (&str, &str) {
    let end = line
        .find(|c: char| c == '=' || c.is_whitespace())
        .unwrap_or(line.len());
    let rest = line[end..].trim_start();
    let rest = rest.strip_prefix('=').unwrap_or(rest).trim();
    (&line[..end], rest)
}

fn num<T: FromStr>(field: &'static str, v: &str) -> Result<T, ParseError> {
    v.trim()
        .parse()
        .map_err(|_| ParseError::invalid(field, v.trim()))
}

fn first_token(v: &str) -> &str {
    v.split_whitespace().next().unwrap_or("")
}

/// `<mode> <port> [connstr=<host> <port>] [options]`
fn device_head(args: &str) -> Result<(ConnMode, String, Option<String>, Vec<&str>), ParseError> {
    let (head, conn) = match args.find("connstr=") {
        Some(i) => (&args[..i], Some(&args[i + "connstr=".len()..])),
        None => (args, None),
    };
    let mut tokens = head.split_whitespace();
    let mode_tok = tokens.next().ok_or(ParseError::TooFewFields {
        directive: "device",
        expected: 1,
        got: 0,
    })?;
    let mode = ConnMode::parse(mode_tok).ok_or_else(|| ParseError::UnknownMode(mode_tok.into()))?;
    let port = tokens.next().unwrap_or("").to_string();
    let mut options: Vec<&str> = tokens.collect();
    let connstr = match conn {
        Some(c) => {
            let mut ct = c.split_whitespace();
            let host = ct
                .next()
                .ok_or_else(|| ParseError::BadConnectString(c.to_string()))?;
            let mut rest: Vec<&str> = ct.collect();
            let connstr = match rest.first() {
                Some(p) if p.starts_with(|ch: char| ch.is_ascii_digit()) => {
                    let p = rest.remove(0);
                    format!("{host} {p}")
                }
                _ => host.to_string(),
            };
            options.extend(rest);
            Some(connstr)
        }
        None => None,
    };
    Ok((mode, port, connstr, options))
}

fn filter_token(token: &str) -> bool {
    token
        .trim_start_matches('*')
        .get(..FILTER_PREFIX.len())
        .is_some_and(|p| p.eq_ignore_ascii_case(FILTER_PREFIX))
}

fn ranged(v: i64, max: i64) -> Option<i64> {
    (v > 0 && v < max).then_some(v)
}

impl CommsConfig {
    /// Reads `path`, falling back to `<path>.sav`.
    pub fn load(path: &Path) -> Result<Self, CommsError> {
        let sav = with_suffix(path, ".sav");
        let (used, text) = match fs::read_to_string(path) {
            Ok(t) => (path.to_path_buf(), t),
            Err(e) => {
                warn!("cannot read {}: {e}, trying {}", path.display(), sav.display());
                let t = fs::read_to_string(&sav).map_err(|source| CommsError::ConfigIo {
                    path: path.display().to_string(),
                    source,
                })?;
                (sav, t)
            }
        };
        let mut cfg = Self::parse(&text);
        info!(
            "loaded {}: {} rx, {} tx, {} connections, {} schedules, {} rejected",
            used.display(),
            cfg.rx_devices.len(),
            cfg.tx_devices.len(),
            cfg.connections.len(),
            cfg.schedules.len(),
            cfg.rejected
        );
        cfg.path = Some(used);
        Ok(cfg)
    }

    pub fn parse(text: &str) -> Self {
        let mut cfg = CommsConfig {
            source: text.lines().map(str::to_string).collect(),
            ..Default::default()
        };
        let mut rx_defaults = RxOptions::default();
        for (line_no, lines) in entries(text) {
            if let Err(e) = cfg.apply_entry(&lines, &mut rx_defaults) {
                warn!(line = line_no, "config entry skipped: {e}: {}", lines[0]);
                cfg.rejected += 1;
            }
        }
        cfg
    }

    fn apply_entry(&mut self, lines: &[&str], rx_defaults: &mut RxOptions) -> Result<(), ParseError> {
        let (key, args) = directive(lines[0]);
        let g = &mut self.globals;
        match key {
            "rxdevice" | "device" => {
                let spec = parse_rx_device(args, &lines[1..], rx_defaults)?;
                self.rx_devices.push(spec);
            }
            "fbdev" => {
                // A standby device only brought up by fallback actions.
                let mut spec = parse_rx_device(args, &lines[1..], rx_defaults)?;
                spec.opts.disabled_on_startup = true;
                self.rx_devices.push(spec);
            }
            "txdevice" | "datasplit" => {
                let spec = parse_tx_device(args, &lines[1..], &g.tx_defaults)?;
                self.tx_devices.push(spec);
            }
            "connection" => self.connections.push(Connection::parse(args)?),
            "request" => self.requests.push(CommRequest::parse(args)?),
            "schedule" | "fbsched" => self.schedules.push(ScheduleEntry::parse(args)?),
            "rdrxlat" => info!("rdrxlat not supported, ignored: {args}"),
            "txdevice_qsize" | "datasplit_qsize" => g.tx_defaults.max_queue = num("qsize", args)?,
            "rxdevice_alertcleared_sound" => rx_defaults.cleared_sound = Some(first_token(args).into()),
            "rxdevice_connfail_sound" => rx_defaults.fail_sound = Some(first_token(args).into()),
            "txdevice_alertcleared_sound" => g.tx_defaults.cleared_sound = Some(first_token(args).into()),
            "txdevice_connfail_sound" => g.tx_defaults.fail_sound = Some(first_token(args).into()),
            "txdevice_ackfail_sound" => g.tx_defaults.ackfail_sound = Some(first_token(args).into()),
            "rxdevice_connfail_realerttime" => rx_defaults.realert_period = num("realerttime", args)?,
            "txdevice_connfail_realerttime" => g.tx_defaults.realert_period = num("realerttime", args)?,
            "rxdevice_loopdelay" => rx_defaults.loop_delay = num("loopdelay", args)?,
            "txdevice_loopdelay" => g.tx_defaults.loop_delay = num("loopdelay", args)?,
            "rxdevice_reconnperiod" => rx_defaults.reconn_period = num("reconnperiod", args)?,
            "txdevice_reconnperiod" => g.tx_defaults.reconn_period = num("reconnperiod", args)?,
            "rxdevice_reconndelay" => rx_defaults.reconn_delay = num("reconndelay", args)?,
            "txdevice_reconndelay" => g.tx_defaults.reconn_delay = num("reconndelay", args)?,
            "txdevice_ackfail_tmout" => g.tx_defaults.ackfail_timeout = num("ackfail_tmout", args)?,
            "txdevice_sendtxstnset" => g.tx_defaults.send_tx_stn_set = true,
            "txdevice_sendreftime" => g.tx_defaults.send_ref_time = true,
            "silence_all_alerts" => g.alerts.silence_all = true,
            "suppress_all_alerts" => g.alerts.suppress_all = true,
            "create_txdev_on_demand" => g.create_txdev_on_demand = true,
            "disable_listen" => g.disable_listen = true,
            "rxdevice_check_radls_for_mssg" => g.check_radls_for_mssg = true,
            "statusFileName" => g.status_file = PathBuf::from(first_token(args)),
            "writeStatusFilePeriod" => g.status_period = num("writeStatusFilePeriod", args)?,
            "rapicServerPort" => g.server_port = num("rapicServerPort", args)?,
            "serveRecentDataMins" => g.serve_recent_data_mins = num("serveRecentDataMins", args)?,
            "noRp_SO_KEEPALIVE" => g.socket.keepalive = false,
            "noRp_SO_LINGER" => g.socket.linger = false,
            "useIPNameCache" => g.use_ip_name_cache = true,
            _ => return Err(ParseError::UnknownDirective(key.to_string())),
        }
        debug!("config: {key} {args}");
        Ok(())
    }

    /// Every non-schedule line of the source, then `schedules` re-encoded.
    pub fn render_saved(&self, schedules: &ScheduleList) -> String {
        let stamp = humantime::format_rfc3339_seconds(SystemTime::now());
        let mut out = format!("{SAVE_HEADER} {stamp}\n");
        let mut in_schedule = false;
        for line in &self.source {
            let trimmed = line.trim();
            let is_schedule = !trimmed.starts_with('#') && directive(trimmed).0 == "schedule";
            let skip = in_schedule || is_schedule || trimmed.starts_with(SAVE_HEADER);
            if is_schedule || in_schedule {
                in_schedule = trimmed.ends_with('\\');
            }
            if !skip {
                out.push_str(line);
                out.push('\n');
            }
        }
        out.push_str(&schedules.encode_all());
        out
    }

    /// Writes the config back via `<path>.tmp` and a rename.
    pub fn save_config(&self, path: &Path, schedules: &ScheduleList) -> Result<(), CommsError> {
        let tmp = with_suffix(path, ".tmp");
        let io_err = |source| CommsError::ConfigIo {
            path: path.display().to_string(),
            source,
        };
        fs::write(&tmp, self.render_saved(schedules)).map_err(io_err)?;
        fs::rename(&tmp, path).map_err(io_err)?;
        info!("config saved to {}", path.display());
        Ok(())
    }
}

fn parse_rx_device(
    args: &str,
    continuation: &[&str],
    defaults: &RxOptions,
) -> Result<RxDeviceSpec, ParseError> {
    let (mode, port_name, connstr, head_opts) = device_head(args)?;
    let mut spec = RxDeviceSpec {
        mode,
        port_name,
        connstr,
        opts: defaults.clone(),
        filters: vec![],
        fallback: None,
    };
    for token in head_opts {
        rx_option(&mut spec, token)?;
    }
    for line in continuation {
        rx_line(&mut spec, line, defaults)?;
    }
    Ok(spec)
}

/// One continuation line. A few options take the rest of the line.
fn rx_line(spec: &mut RxDeviceSpec, line: &str, defaults: &RxOptions) -> Result<(), ParseError> {
    if let Some(i) = line.find("description=") {
        spec.opts.description = line[i + "description=".len()..].trim().to_string();
        return Ok(());
    }
    if let Some(i) = line.find("fbsched=") {
        let entry = ScheduleEntry::parse(&line[i + "fbsched=".len()..])?;
        spec.fallback().schedules.push(entry);
        return Ok(());
    }
    if let Some(i) = line.find("fbdev=") {
        let nested = parse_rx_device(&line[i + "fbdev=".len()..], &[], defaults)?;
        let fb = spec.fallback();
        if fb.device.is_none() {
            fb.device = Some(Box::new(nested));
        } else {
            warn!("second fbdev= ignored: {line}");
        }
        return Ok(());
    }
    for token in line.split_whitespace() {
        rx_option(spec, token)?;
    }
    Ok(())
}

fn rx_option(spec: &mut RxDeviceSpec, token: &str) -> Result<(), ParseError> {
    if filter_token(token) {
        spec.filters.push(ScanFilter::decode(token).map_err(|e| {
            ParseError::invalid("filter", e.to_string())
        })?);
        return Ok(());
    }
    let (key, v) = token.split_once('=').unwrap_or((token, ""));
    let o = &mut spec.opts;
    match key {
        "fbstn" => spec.fallback().station = num("fbstn", v)?,
        "fbtomainsched" => spec.fallback().suppress_main_schedule = true,
        "fbtocommserver" => {
            let fb = spec.fallback();
            fb.suppress_main_schedule = true;
            fb.suppress_other_devices = true;
        }
        "loopdelay" => o.loop_delay = num("loopdelay", v)?,
        "txcomplete" if v == "0" => o.subscription.complete_scans = false,
        "scanbyscan" => o.subscription.complete_scans = false,
        "txcompleted" => o.subscription.complete_scans = true,
        "txlatestonly" => o.subscription.latest_only = true,
        "allowreplay" => o.subscription.allow_replay = true,
        "sendrecentdatamins" => {
            let mins: i64 = num("sendrecentdatamins", v)?;
            if mins > 0 {
                o.subscription.recent_mins = mins.min(MAX_RECENT_MINS);
            }
        }
        "connfail_sound" => o.fail_sound = Some(v.to_string()),
        "reconnperiod" => o.reconn_period = num("reconnperiod", v)?,
        "reconndelay" => o.reconn_delay = num("reconndelay", v)?,
        "initstring" => o.init_string = Some(v.to_string()),
        "radarstatusfile" => o.radar_status_file = Some(PathBuf::from(v)),
        "suppress_alerts" => o.suppress_alerts = true,
        "enable_alerts" => o.suppress_alerts = false,
        "disable_connect_confirm" => o.disable_connect_confirm = true,
        "silence_all_alerts" => o.silence_alerts = true,
        "scansettimeout" => o.scanset_timeout = num("scansettimeout", v)?,
        "disabled_on_startup" => o.disabled_on_startup = true,
        "enabled_timeout" => {
            let hours: f64 = num("enabled_timeout", v)?;
            o.enabled_timeout = (hours * 3600.0) as i64;
        }
        "timeout" => {
            if let Some(t) = ranged(num("timeout", v)?, 900) {
                o.timeout = t;
            }
        }
        "statuscheckrate" => {
            if let Some(t) = ranged(num("statuscheckrate", v)?, 900) {
                o.status_check_rate = t;
            }
        }
        "statusacktimeout" => {
            if let Some(t) = ranged(num("statusacktimeout", v)?, 900) {
                o.status_ack_time = t;
            }
        }
        "debug" => o.debug = num("debug", v)?,
        "groupid" => {
            let id: i32 = num("groupid", v)?;
            if id > 0 {
                o.group_id = id;
                o.disabled_on_startup = true;
            }
        }
        "fbgroup" => {
            let id: i32 = num("fbgroup", v)?;
            if id > 0 {
                o.fb_group = id;
            }
        }
        _ => debug!("unrecognised rxdevice option {token}"),
    }
    Ok(())
}

fn parse_tx_device(
    args: &str,
    continuation: &[&str],
    defaults: &TxOptions,
) -> Result<TxDeviceSpec, ParseError> {
    let (mode, port_name, connstr, head_opts) = device_head(args)?;
    let mut spec = TxDeviceSpec {
        mode,
        port_name,
        connstr,
        opts: defaults.clone(),
        filters: vec![],
    };
    for token in head_opts {
        tx_option(&mut spec, token)?;
    }
    for line in continuation {
        if let Some(i) = line.find("description=") {
            spec.opts.description = line[i + "description=".len()..].trim().to_string();
            continue;
        }
        for token in line.split_whitespace() {
            tx_option(&mut spec, token)?;
        }
    }
    Ok(spec)
}

fn tx_option(spec: &mut TxDeviceSpec, token: &str) -> Result<(), ParseError> {
    if filter_token(token) {
        spec.filters.push(ScanFilter::decode(token).map_err(|e| {
            ParseError::invalid("filter", e.to_string())
        })?);
        return Ok(());
    }
    let (key, v) = token.split_once('=').unwrap_or((token, ""));
    let o = &mut spec.opts;
    match key {
        "expect_ack" => o.expect_ack = true,
        "loopdelay" => o.loop_delay = num("loopdelay", v)?,
        "connfail_sound" => o.fail_sound = Some(v.to_string()),
        "ackfail_sound" => o.ackfail_sound = Some(v.to_string()),
        "ackfail_tmout" => o.ackfail_timeout = num("ackfail_tmout", v)?,
        "reconnperiod" => o.reconn_period = num("reconnperiod", v)?,
        "reconndelay" => o.reconn_delay = num("reconndelay", v)?,
        "sendtxstnset" => o.send_tx_stn_set = true,
        "sendreftime" => o.send_ref_time = true,
        "suppress_alerts" => o.suppress_alerts = true,
        "enable_alerts" => o.suppress_alerts = false,
        "silence_all_alerts" => o.silence_alerts = true,
        "querymodetimeout" => o.query_mode_timeout = num("querymodetimeout", v)?,
        "debug" => o.debug = num("debug", v)?,
        _ => debug!("unrecognised txdevice option {token}"),
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::RpScanType;
    use pretty_assertions::assert_eq;
    use test_case::test_case;

    const SAMPLE: &str = "\
# comms config
rxdevice_loopdelay=0.25
rxdevice=socket 5000 connstr=host.example 15555 timeout=30 \\
    description=Melbourne radar \\
    RPFILTER:2:-1:-1:-1 \\
# commented continuation \\
    fbstn=2 fbtocommserver \\
    fbsched=2 10 10 0 DFLT_PPI1 \\
    fbdev=socket 5001 connstr=backup.example 15555
rxdevice=socket 5002
txdevice=socket 15555 \\
    expect_ack ackfail_tmout=45 RPFILTER:3:-1:-1:-1
txdevice_qsize=4
datasplit=socket 0 connstr=consumer.example 16000
connection=3 3 0 Rapic Std1 Socket host.example 15555
schedule=003 10 10 0 DFLT_PPI1
request=3 VOL 0.5
create_txdev_on_demand
rapicServerPort=16555
bogus_directive=1
";

    #[test]
    fn sample_config() {
        let cfg = CommsConfig::parse(SAMPLE);
        assert_eq!(cfg.rejected, 1);
        assert_eq!(cfg.rx_devices.len(), 2);
        assert_eq!(cfg.tx_devices.len(), 2);

        let rx = &cfg.rx_devices[0];
        assert_eq!(rx.mode, ConnMode::Socket);
        assert_eq!(rx.port_name, "5000");
        assert_eq!(rx.connstr.as_deref(), Some("host.example 15555"));
        assert_eq!(rx.opts.timeout, 30);
        assert_eq!(rx.opts.loop_delay, 0.25);
        assert_eq!(rx.opts.description, "Melbourne radar");
        assert_eq!(rx.filters.len(), 1);
        let fb = rx.fallback.as_ref().unwrap();
        assert_eq!(fb.station, 2);
        assert!(fb.suppress_main_schedule && fb.suppress_other_devices);
        assert_eq!(fb.schedules.len(), 1);
        let fbdev = fb.device.as_ref().unwrap();
        assert_eq!(fbdev.connstr.as_deref(), Some("backup.example 15555"));

        assert_eq!(cfg.rx_devices[1].connstr, None);
        assert_eq!(cfg.rx_devices[1].opts.loop_delay, 0.25);

        let listen = &cfg.tx_devices[0];
        assert!(listen.opts.expect_ack);
        assert_eq!(listen.opts.ackfail_timeout, 45);
        assert_eq!(listen.opts.max_queue, 16);
        assert_eq!(listen.filters[0].station, 3);
        let calling = &cfg.tx_devices[1];
        assert_eq!(calling.connstr.as_deref(), Some("consumer.example 16000"));
        assert_eq!(calling.opts.max_queue, 4);

        assert_eq!(cfg.connections.len(), 1);
        assert_eq!(cfg.schedules[0].station(), 3);
        assert_eq!(cfg.schedules[0].period, 600);
        assert_eq!(cfg.requests[0].scan_type, RpScanType::Vol);
        assert!(cfg.globals.create_txdev_on_demand);
        assert_eq!(cfg.globals.server_port, 16555);
        assert_eq!(cfg.globals.status_period, DEFAULT_STATUS_PERIOD);
    }

    #[test_case("groupid=4", 4, true ; "group marks disabled")]
    #[test_case("groupid=0", 0, false ; "zero group ignored")]
    #[test_case("disabled_on_startup", 0, true ; "explicit disable")]
    fn rx_group_options(option: &str, group: i32, disabled: bool) {
        let cfg = CommsConfig::parse(&format!("rxdevice=socket 1 \\\n {option}\n"));
        let o = &cfg.rx_devices[0].opts;
        assert_eq!((o.group_id, o.disabled_on_startup), (group, disabled));
    }

    #[test]
    fn rx_option_limits() {
        let cfg = CommsConfig::parse(
            "rxdevice=socket 1 connstr=a 1 \\\n timeout=2000 sendrecentdatamins=999 enabled_timeout=1.5\n",
        );
        let o = &cfg.rx_devices[0].opts;
        assert_eq!(o.timeout, 40);
        assert_eq!(o.subscription.recent_mins, 360);
        assert_eq!(o.enabled_timeout, 5400);
    }

    #[test]
    fn connstr_needs_numeric_port() {
        let cfg = CommsConfig::parse("rxdevice=socket 1 connstr=host scanbyscan\n");
        let rx = &cfg.rx_devices[0];
        assert_eq!(rx.connstr.as_deref(), Some("host"));
        assert!(!rx.opts.subscription.complete_scans);
    }

    #[test]
    fn unknown_mode_rejected_rest_loads() {
        let cfg = CommsConfig::parse("rxdevice=pigeon 1\nrxdevice=hayes 2\n");
        assert_eq!(cfg.rejected, 1);
        assert_eq!(cfg.rx_devices.len(), 1);
        assert_eq!(cfg.rx_devices[0].mode, ConnMode::Hayes);
    }

    #[test]
    fn falls_back_to_saved_copy() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("rpcomm.ini");
        fs::write(with_suffix(&path, ".sav"), "rxdevice=socket 1\n").unwrap();
        let cfg = CommsConfig::load(&path).unwrap();
        assert_eq!(cfg.rx_devices.len(), 1);
        assert_eq!(cfg.path, Some(with_suffix(&path, ".sav")));

        let missing = dir.path().join("nothing.ini");
        assert!(matches!(
            CommsConfig::load(&missing),
            Err(CommsError::ConfigIo { .. })
        ));
    }

    #[test]
    fn save_reencodes_schedules() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("rpcomm.ini");
        let cfg = CommsConfig::parse("rxdevice=socket 1\nschedule=3 10 10 0 DFLT_PPI1\nconnection=3 3 0 Rapic Std1 Socket h 1\n");
        let mut list = ScheduleList::new();
        list.add(ScheduleEntry::parse("4 5 5 1 DFLT_PPI1").unwrap(), 0, true)
            .unwrap();
        cfg.save_config(&path, &list).unwrap();
        let saved = fs::read_to_string(&path).unwrap();
        let lines: Vec<_> = saved.lines().collect();
        assert!(lines[0].starts_with(SAVE_HEADER));
        assert_eq!(
            &lines[1..],
            &[
                "rxdevice=socket 1",
                "connection=3 3 0 Rapic Std1 Socket h 1",
                "schedule=4\t5\t5\t1\tComp1",
            ]
        );
        assert!(!with_suffix(&path, ".tmp").exists());

        // a second save replaces the header rather than stacking another
        let again = CommsConfig::parse(&saved).render_saved(&list);
        assert_eq!(again.matches(SAVE_HEADER).count(), 1);
    }
}
