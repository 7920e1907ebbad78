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

use crate::args::Args;
use ::tracing::{error, info, warn};
use clap::Parser;
use eyre::{Report, bail, eyre};
use fs2::FileExt;
use mimalloc::MiMalloc;
use rapic_common::{build, tracing};
use rapic_comms::alert::LogSoundPlayer;
use rapic_comms::config::CommsConfig;
use rapic_comms::transport::TcpFactory;
use rapic_comms::{CommMngr, ManagerOptions, SystemClock};
use std::fs::{File, OpenOptions};
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Instant;

mod args;

#[global_allocator]
static GLOBAL: MiMalloc = MiMalloc;

/// Acquire an exclusive lock on the control directory so two daemons never act on
/// the same flag files.
fn acquire_control_dir_lock(control_dir: &Path) -> Result<File, Report> {
    std::fs::create_dir_all(control_dir)?;
    let lock_file_path = control_dir.join(".rapic-commd.lock");
    let lock_file = OpenOptions::new()
        .create(true)
        .write(true)
        .truncate(true)
        .open(&lock_file_path)?;

    match lock_file.try_lock_exclusive() {
        Ok(()) => {
            info!("Acquired exclusive lock on control directory: {:?}", control_dir);
            Ok(lock_file)
        }
        Err(e) => {
            error!(
                "Failed to acquire lock on control directory {:?}. Another rapic-commd instance may already be running there.",
                control_dir
            );
            bail!("Directory lock acquisition failed: {}", e);
        }
    }
}

fn main() -> Result<(), Report> {
    color_eyre::install()?;

    let args: Args = Args::parse();

    tracing::init_tracing(args.debug).map_err(|e| eyre!("Unable to configure logging: {}", e))?;

    let config = args.load_config()?;
    let _lock = acquire_control_dir_lock(&config.control_dir)?;

    let comms_path = config.resolved_comms_config();
    let comms = CommsConfig::load(&comms_path)
        .map_err(|e| eyre!("Unable to load comms config {:?}: {}", comms_path, e))?;

    // Socket options apply to every socket the factory makes, so they come from the
    // config as first loaded.
    let factory = TcpFactory {
        options: comms.globals.socket,
    };
    let options = ManagerOptions {
        control_dir: config.control_dir.clone(),
        threaded: config.threaded,
        lock_timeout: config.lock_timeout(),
    };
    let mut mgr = CommMngr::new(
        options,
        Arc::new(SystemClock),
        Arc::new(factory),
        Arc::new(LogSoundPlayer),
    );
    mgr.set_config_path(&comms_path);
    mgr.apply_config(comms, true);

    let kill_switch = Arc::new(AtomicBool::new(false));
    signal_hook::flag::register(signal_hook::consts::SIGTERM, kill_switch.clone())?;
    signal_hook::flag::register(signal_hook::consts::SIGINT, kill_switch.clone())?;
    info!(
        version = build::PKG_VERSION,
        config = ?comms_path,
        control_dir = ?config.control_dir,
        threaded = config.threaded,
        "Daemon started. Sweeping comms."
    );

    let interval = config.sweep_interval();
    while !kill_switch.load(Ordering::Relaxed) {
        let start = Instant::now();
        mgr.check_comms();
        let elapsed = start.elapsed();
        if elapsed > interval {
            warn!(?elapsed, ?interval, "comms sweep overran its interval");
        } else {
            std::thread::sleep(interval - elapsed);
        }
    }
    warn!("Shutdown signal received. Departing...");

    mgr.close();

    info!("Done.");
    Ok(())
}
