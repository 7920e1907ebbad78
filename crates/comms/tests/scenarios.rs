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

//! End-to-end sweeps of the manager over simulated links.

use pretty_assertions::assert_eq;
use rapic_comms::alert::{AlertStatus, SoundPlayer};
use rapic_comms::transport::mock::MockNet;
use rapic_comms::{CommMngr, CommStatus, ManagerOptions, ManualClock};
use std::fs;
use std::sync::{Arc, Mutex};

const PPI: &str = "STNID: 3\nDATE: 03224\nTIME: 12.30\nPRODUCT: NORMAL\nIMGFMT: PPI\n\
                   VIDRES: 16\n%001abc\n%002abc\nEND RADAR IMAGE\n";

/// Keeps every alert sound played.
#[derive(Default)]
struct Chimes(Mutex<Vec<String>>);

impl Chimes {
    fn played(&self) -> Vec<String> {
        self.0.lock().unwrap().clone()
    }
}

impl SoundPlayer for Chimes {
    fn play(&self, file: &str) {
        self.0.lock().unwrap().push(file.to_string());
    }
}

struct World {
    mgr: CommMngr,
    net: MockNet,
    clock: Arc<ManualClock>,
    chimes: Arc<Chimes>,
    dir: tempfile::TempDir,
}

impl World {
    fn new(config: &str) -> Self {
        let net = MockNet::new();
        Self::with_net(config, net)
    }

    fn with_net(config: &str, net: MockNet) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("rpcomm.ini");
        fs::write(&path, config).unwrap();
        let clock = Arc::new(ManualClock::new(1_000));
        let opts = ManagerOptions {
            control_dir: dir.path().to_path_buf(),
            ..Default::default()
        };
        let chimes = Arc::new(Chimes::default());
        let mut mgr = CommMngr::new(opts, clock.clone(), Arc::new(net.clone()), chimes.clone());
        mgr.open(&path).unwrap();
        Self {
            mgr,
            net,
            clock,
            chimes,
            dir,
        }
    }

    fn sweep(&mut self) {
        self.mgr.check_comms();
    }

    fn connects_to(&self, target: &str) -> usize {
        self.net.connects().iter().filter(|c| *c == target).count()
    }
}

#[test]
fn scheduled_request_goes_to_pool_device() {
    let mut w = World::new(
        "\
connection=3 3 0 Rapic Std1 Socket host.example 15555
rxdevice=socket 5000 connstr=host.example 15555
rxdevice=socket 5002
schedule=003 10 10 0 DFLT_PPI1
",
    );
    assert_eq!(w.mgr.schedules().len(), 1);
    assert_eq!(w.mgr.schedules().get(0).unwrap().period, 600);

    w.sweep();
    assert_eq!(w.mgr.requests().len(), 1);
    let req = w.mgr.requests().iter().next().unwrap();
    assert_eq!(req.station, 3);
    assert_eq!(w.mgr.free_rx(), Vec::<usize>::new());
    assert_eq!(w.connects_to("host.example 15555"), 2);

    // the same schedule does not fire again within its period
    w.clock.advance(10);
    w.sweep();
    assert_eq!(w.mgr.requests().len(), 1);
}

#[test]
fn relayed_scan_held_until_acknowledged() {
    let mut w = World::new(
        "\
rxdevice=socket 1 connstr=radar.example 15555
datasplit=socket 0 connstr=consumer.example 16000 expect_ack ackfail_sound=ackfail.au
",
    );
    w.sweep();
    let tx = w.mgr.tx_ids()[0];
    let snap = w.mgr.snapshot(tx).unwrap();
    assert_eq!(snap.status, CommStatus::Connected);
    assert_eq!(snap.alert, AlertStatus::Ok);

    w.net
        .wire_for("radar.example 15555")
        .unwrap()
        .lock()
        .unwrap()
        .push(PPI);
    w.sweep();
    assert_eq!(w.mgr.snapshot(tx).unwrap().queue_len, 1);
    w.sweep();
    let sent = w
        .net
        .wire_for("consumer.example 16000")
        .unwrap()
        .lock()
        .unwrap()
        .take_output();
    assert!(sent.contains("STNID: 3"));

    w.clock.advance(31);
    w.sweep();
    let snap = w.mgr.snapshot(tx).unwrap();
    assert_eq!(snap.status, CommStatus::AckFail);
    assert_eq!(snap.alert, AlertStatus::AckFail);
    assert!(snap.alert_text.contains("no acknowledgement received"));
    assert_eq!(snap.queue_len, 1);
    assert_eq!(w.chimes.played(), vec!["ackfail.au"]);

    w.clock.advance(2);
    w.sweep();
    assert_eq!(w.connects_to("consumer.example 16000"), 2);
    // the reconnect does not clear a held ack failure
    let snap = w.mgr.snapshot(tx).unwrap();
    assert_eq!(snap.status, CommStatus::Connected);
    assert_eq!(snap.alert, AlertStatus::AckFail);
}

#[test]
fn lost_parent_brings_up_fallback() {
    let net = MockNet::new();
    net.set_unreachable("main.example 15555", true);
    let mut w = World::with_net(
        "\
connection=2 3 0 Rapic Std1 Socket stn2.example 15555
rxdevice=socket 1 connstr=main.example 15555 \\
    fbsched=002 10 10 0 DFLT_PPI1 \\
    fbdev=socket 2 connstr=backup.example 15555
rxdevice=socket 3
",
        net,
    );
    assert!(w.mgr.schedules().is_empty());
    let (parent, standby, pool) = (1, 2, 3);
    assert_eq!(w.mgr.free_rx(), vec![pool]);

    w.sweep();
    assert_eq!(w.mgr.schedules().len(), 1);
    assert_eq!(w.mgr.schedules().get(0).unwrap().station(), 2);
    w.sweep();
    assert!(w.mgr.snapshot(standby).unwrap().enabled);
    assert_eq!(w.connects_to("backup.example 15555"), 1);

    w.net.set_unreachable("main.example 15555", false);
    w.clock.advance(3);
    w.sweep();
    assert_eq!(w.connects_to("main.example 15555"), 2);
    w.net
        .wire_for("main.example 15555")
        .unwrap()
        .lock()
        .unwrap()
        .push("MSSG: 30 Status information following\n");
    w.sweep();
    assert_eq!(w.mgr.snapshot(parent).unwrap().status, CommStatus::Connected);
    assert!(w.mgr.schedules().is_empty());
    w.sweep();
    assert!(!w.mgr.snapshot(standby).unwrap().enabled);
}

#[test]
fn bind_failure_warned_at_intervals() {
    let net = MockNet::new();
    net.set_fail_bind(true);
    let mut w = World::with_net("txdevice=socket 15555\n", net);

    w.sweep();
    assert!(w.mgr.bind_failed());
    assert_eq!(w.mgr.bind_warnings(), 1);
    w.clock.set(1_100);
    w.sweep();
    assert_eq!(w.mgr.bind_warnings(), 1);
    w.clock.set(1_301);
    w.sweep();
    assert_eq!(w.mgr.bind_warnings(), 2);
    assert_eq!(w.net.bind_attempts(), 3);

    let status = fs::read_to_string(w.dir.path().join("rpcomm_status.txt")).unwrap();
    assert!(status.contains("**** BIND TO PORT 15555 FAILED"));

    w.net.set_fail_bind(false);
    w.sweep();
    assert!(!w.mgr.bind_failed());
    assert_eq!(w.mgr.listen_backlog(), 1);
}

#[test]
fn reload_flag_replaces_running_config() {
    let mut w = World::new("rxdevice=socket 1\n");
    w.sweep();
    assert_eq!(w.mgr.rx_ids().len(), 1);

    fs::write(
        w.dir.path().join("second.ini"),
        "rxdevice=socket 1\nrxdevice=socket 2\ntxdevice=socket 15555\n",
    )
    .unwrap();
    fs::write(w.dir.path().join("rpcomm.newcfg"), "second.ini\n").unwrap();
    w.clock.advance(15);
    w.sweep();
    assert_eq!(w.mgr.rx_ids().len(), 2);
    assert_eq!(w.mgr.tx_ids().len(), 1);
    assert!(!w.dir.path().join("rpcomm.newcfg").exists());
}
