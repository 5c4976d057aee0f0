// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Interfaces for parsing the driver's configuration file.

use camino::{Utf8Path, Utf8PathBuf};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

/// Where the driver looks for its configuration unless told otherwise.
pub const DEFAULT_CONFIG_PATH: &str = "/etc/kubernetes/vcd-flexvol.toml";

/// Environment variable overriding [`DEFAULT_CONFIG_PATH`].
pub const CONFIG_PATH_ENV: &str = "VCD_FLEXVOL_CONFIG";

/// Configuration for the FlexVolume driver.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// Connection to the cloud director.
    pub vcd: vcd_client::Config,
    #[serde(default)]
    pub host: HostConfig,
    #[serde(default)]
    pub lock: LockConfig,
    #[serde(default)]
    pub log: LogConfig,
    /// When set, unmount reports success without touching anything and
    /// operators detach disks by hand.
    #[serde(default)]
    pub manual_unmount: bool,
}

impl Config {
    /// Load a `Config` from the given TOML file
    pub fn from_file(path: &Utf8Path) -> Result<Config, LoadError> {
        let file_contents = std::fs::read_to_string(path)
            .map_err(|err| LoadError::Io { path: path.into(), err })?;
        let config_parsed: Config = toml::from_str(&file_contents)
            .map_err(|err| LoadError::Parse { path: path.into(), err })?;
        Ok(config_parsed)
    }
}

#[derive(Clone, Debug, Deserialize, PartialEq, Eq, Serialize)]
#[serde(deny_unknown_fields, default)]
pub struct HostConfig {
    /// Name of this node's VM in the vApp. Defaults to the hostname.
    pub node_name: Option<String>,
    pub sysfs_root: Utf8PathBuf,
    pub format_timeout_secs: u64,
    /// Extra pause after a SCSI rescan before listing devices.
    pub settle_delay_millis: u64,
}

impl Default for HostConfig {
    fn default() -> Self {
        HostConfig {
            node_name: None,
            sysfs_root: Utf8PathBuf::from("/sys"),
            format_timeout_secs: 60,
            settle_delay_millis: 0,
        }
    }
}

impl HostConfig {
    pub fn format_timeout(&self) -> Duration {
        Duration::from_secs(self.format_timeout_secs)
    }

    pub fn settle_delay(&self) -> Duration {
        Duration::from_millis(self.settle_delay_millis)
    }
}

#[derive(Clone, Debug, Deserialize, PartialEq, Eq, Serialize)]
#[serde(deny_unknown_fields, default)]
pub struct LockConfig {
    /// Defaults to `vcd-flexvol.lock` in the system temporary directory.
    pub path: Option<Utf8PathBuf>,
    /// How long a contended invocation waits before reporting failure.
    pub contention_backoff_secs: u64,
}

impl Default for LockConfig {
    fn default() -> Self {
        LockConfig { path: None, contention_backoff_secs: 30 }
    }
}

impl LockConfig {
    pub fn path(&self) -> Utf8PathBuf {
        self.path.clone().unwrap_or_else(|| {
            let tmp = std::env::temp_dir();
            Utf8PathBuf::try_from(tmp)
                .unwrap_or_else(|_| Utf8PathBuf::from("/tmp"))
                .join("vcd-flexvol.lock")
        })
    }

    pub fn contention_backoff(&self) -> Duration {
        Duration::from_secs(self.contention_backoff_secs)
    }
}

#[derive(Clone, Copy, Debug, Deserialize, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Trace,
    Debug,
    Info,
    Warn,
    Error,
    Critical,
}

impl From<LogLevel> for slog::Level {
    fn from(level: LogLevel) -> Self {
        match level {
            LogLevel::Trace => slog::Level::Trace,
            LogLevel::Debug => slog::Level::Debug,
            LogLevel::Info => slog::Level::Info,
            LogLevel::Warn => slog::Level::Warning,
            LogLevel::Error => slog::Level::Error,
            LogLevel::Critical => slog::Level::Critical,
        }
    }
}

#[derive(Clone, Debug, Deserialize, PartialEq, Eq, Serialize)]
#[serde(deny_unknown_fields, default)]
pub struct LogConfig {
    /// Log file, appended to. No file logging when unset.
    pub path: Option<Utf8PathBuf>,
    pub level: LogLevel,
    /// Also log to stderr, filtered by `RUST_LOG`. The kubelet mixes stderr
    /// into the reply it parses, so this is for manual runs only.
    pub stderr: bool,
}

impl Default for LogConfig {
    fn default() -> Self {
        LogConfig {
            path: Some(Utf8PathBuf::from("/var/log/vcd-flexvol.log")),
            level: LogLevel::Info,
            stderr: false,
        }
    }
}

#[derive(Debug, Error)]
pub enum LoadError {
    #[error("error reading \"{path}\": {err}")]
    Io {
        path: Utf8PathBuf,
        #[source]
        err: std::io::Error,
    },
    #[error("error parsing \"{path}\": {err}")]
    Parse {
        path: Utf8PathBuf,
        #[source]
        err: toml::de::Error,
    },
}
