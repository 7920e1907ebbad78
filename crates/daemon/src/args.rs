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

use clap::builder::ValueHint;
use clap_derive::Parser;
use eyre::eyre;
use figment::Figment;
use figment::providers::{Format as ProviderFormat, Serialized, Yaml};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Daemon settings, as read from the YAML file and then overridden from the command line.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DaemonConfig {
    /// The comms config (`rpcomm.ini` style). Relative paths resolve against `control_dir`.
    pub comms_config: PathBuf,
    pub control_dir: PathBuf,
    pub threaded: bool,
    pub sweep_interval_ms: u64,
    pub lock_timeout_ms: u64,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            comms_config: PathBuf::from("rpcomm.ini"),
            control_dir: PathBuf::from("."),
            threaded: false,
            sweep_interval_ms: 1000,
            lock_timeout_ms: 50,
        }
    }
}

impl DaemonConfig {
    pub fn resolved_comms_config(&self) -> PathBuf {
        if self.comms_config.is_absolute() {
            self.comms_config.clone()
        } else {
            self.control_dir.join(&self.comms_config)
        }
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_millis(self.sweep_interval_ms.max(10))
    }

    pub fn lock_timeout(&self) -> Duration {
        Duration::from_millis(self.lock_timeout_ms)
    }
}

#[derive(Parser, Debug)]
#[command(version, about = "Rapic radar communications daemon")]
pub struct Args {
    #[arg(
        long,
        value_name = "config",
        help = "Path to configuration (YAML) file to use, if any. If not specified, defaults are used.\
                Configuration file values can be overridden by command line arguments.",
        value_hint = ValueHint::FilePath
    )]
    pub config_file: Option<PathBuf>,

    #[arg(
        short,
        long,
        value_name = "comms-config",
        help = "Comms config file to load (relative to control-dir if not absolute)",
        value_hint = ValueHint::FilePath
    )]
    pub comms_config: Option<PathBuf>,

    #[arg(
        long,
        value_name = "control-dir",
        help = "Directory watched for control flags and where the status file is written",
        value_hint = ValueHint::DirPath
    )]
    pub control_dir: Option<PathBuf>,

    #[arg(long, help = "Run every device on its own thread instead of from the sweep")]
    pub threaded: bool,

    #[arg(
        long,
        value_name = "sweep-interval-ms",
        help = "Milliseconds between comms sweeps"
    )]
    pub sweep_interval_ms: Option<u64>,

    #[arg(long, help = "Enable debug logging", default_value = "false")]
    pub debug: bool,
}

impl Args {
    fn merge_config(&self, mut config: DaemonConfig) -> DaemonConfig {
        if let Some(path) = &self.comms_config {
            config.comms_config = path.clone();
        }
        if let Some(dir) = &self.control_dir {
            config.control_dir = dir.clone();
        }
        if self.threaded {
            config.threaded = true;
        }
        if let Some(ms) = self.sweep_interval_ms {
            config.sweep_interval_ms = ms;
        }
        config
    }

    /// Load the configuration file if we have it, and then we'll merge the arguments into it.
    pub fn load_config(&self) -> Result<DaemonConfig, eyre::Report> {
        let config = match &self.config_file {
            Some(config_path) => Figment::new()
                .merge(Serialized::defaults(DaemonConfig::default()))
                .merge(Yaml::file(config_path.clone()))
                .extract::<DaemonConfig>()
                .map_err(|e| {
                    eyre!(
                        "Failed to parse configuration from {:?}: {}",
                        config_path,
                        e
                    )
                })?,
            None => DaemonConfig::default(),
        };
        Ok(self.merge_config(config))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;
    use pretty_assertions::assert_eq;
    use std::fs;

    #[test]
    fn yaml_then_command_line() {
        let dir = tempfile::tempdir().unwrap();
        let yaml = dir.path().join("commd.yaml");
        fs::write(
            &yaml,
            "comms_config: /etc/rapic/rpcomm.ini\nsweep_interval_ms: 250\nthreaded: true\n",
        )
        .unwrap();
        let args = Args::parse_from([
            "rapic-commd",
            "--config-file",
            yaml.to_str().unwrap(),
            "--sweep-interval-ms",
            "500",
            "--control-dir",
            "/var/rapic",
        ]);
        let config = args.load_config().unwrap();
        assert_eq!(
            config,
            DaemonConfig {
                comms_config: PathBuf::from("/etc/rapic/rpcomm.ini"),
                control_dir: PathBuf::from("/var/rapic"),
                threaded: true,
                sweep_interval_ms: 500,
                lock_timeout_ms: 50,
            }
        );
        assert_eq!(
            config.resolved_comms_config(),
            PathBuf::from("/etc/rapic/rpcomm.ini")
        );
    }

    #[test]
    fn defaults_resolve_against_control_dir() {
        let args = Args::parse_from(["rapic-commd", "--control-dir", "/var/rapic"]);
        let config = args.load_config().unwrap();
        assert_eq!(
            config.resolved_comms_config(),
            PathBuf::from("/var/rapic/rpcomm.ini")
        );
        assert!(!config.threaded);
        assert_eq!(config.sweep_interval(), Duration::from_millis(1000));
    }
}
