// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The `vcd-flexvol` command line, as the kubelet invokes it.

use crate::agent::Agent;
use crate::config::{Config, CONFIG_PATH_ENV, DEFAULT_CONFIG_PATH};
use crate::lock::acquire_or_back_off;
use crate::logging::setup_log;
use crate::operation::{ExecResult, MountRequest, Request, UnmountRequest};
use crate::Error;
use anyhow::Context;
use blockdev_utils::host::Host;
use camino::{Utf8Path, Utf8PathBuf};
use clap::{Parser, Subcommand};
use slog::{info, warn};
use std::sync::Arc;
use vcd_client::ClientConnector;

/// FlexVolume driver for cloud director independent disks.
#[derive(Debug, Parser)]
#[command(version)]
pub struct Args {
    /// Path to the driver configuration file.
    #[clap(long, env = CONFIG_PATH_ENV, default_value = DEFAULT_CONFIG_PATH)]
    config: Utf8PathBuf,

    #[clap(subcommand)]
    callout: Callout,
}

#[derive(Debug, Subcommand)]
enum Callout {
    /// Initialize the driver.
    Init,
    /// Attach the volume's disk to this node and mount it.
    Mount {
        mount_dir: String,
        /// Mount options as a JSON object.
        options: String,
    },
    /// Unmount the volume and detach its disk from this node.
    Unmount { mount_dir: String },
    #[command(external_subcommand)]
    Other(Vec<String>),
}

impl Callout {
    fn into_request(self) -> Result<Request, Error> {
        Ok(match self {
            Callout::Init => Request::Init,
            Callout::Mount { mount_dir, options } => {
                Request::Mount(MountRequest::from_json(&mount_dir, &options)?)
            }
            Callout::Unmount { mount_dir } => {
                Request::Unmount(UnmountRequest { mount_dir })
            }
            Callout::Other(words) => Request::NotSupported(
                words.into_iter().next().unwrap_or_default(),
            ),
        })
    }
}

impl Args {
    /// Serves the invocation. Every outcome, including failure to start up,
    /// becomes a reply for the kubelet.
    pub async fn exec(self) -> ExecResult {
        let request = match self.callout.into_request() {
            Ok(request) => request,
            Err(err) => return ExecResult::failure(&err),
        };
        if request.touches_disks() {
            return match serve(&self.config, request).await {
                Ok(result) => result,
                Err(err) => ExecResult::failure(&format!("{err:#}")),
            };
        }
        // Nothing else needs the configuration, the lock or the cloud.
        match request {
            Request::NotSupported(_) => ExecResult::not_supported(),
            _ => ExecResult::init(),
        }
    }
}

async fn serve(
    config_path: &Utf8Path,
    request: Request,
) -> anyhow::Result<ExecResult> {
    let config = Config::from_file(config_path)?;
    let log = setup_log(&config.log).context("setting up logging")?;
    let node_name = match &config.host.node_name {
        Some(name) => name.clone(),
        None => gethostname::gethostname().into_string().map_err(|name| {
            anyhow::anyhow!("hostname {name:?} is not valid UTF-8")
        })?,
    };
    info!(log, "serving request"; "request" => ?request, "node" => &node_name);

    let lock_path = config.lock.path();
    let _lock = match acquire_or_back_off(
        &log,
        &lock_path,
        config.lock.contention_backoff(),
    )
    .await
    {
        Ok(lock) => lock,
        Err(err) => {
            warn!(log, "could not take invocation lock"; "error" => %err);
            return Ok(ExecResult::failure(&err));
        }
    };

    let host = Host::new(
        &log,
        config.host.sysfs_root.clone(),
        config.host.settle_delay(),
    );
    let connector = Arc::new(ClientConnector::new(&log, config.vcd.clone()));
    let agent = Agent::new(&log, config, node_name, connector, host);
    Ok(agent.run(request).await)
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::operation::ExecStatus;

    fn parse(args: &[&str]) -> Args {
        Args::try_parse_from(std::iter::once("vcd-flexvol").chain(args.iter().copied()))
            .unwrap()
    }

    #[test]
    fn parses_kubelet_callouts() {
        let args = parse(&["init"]);
        assert!(matches!(args.callout, Callout::Init));

        let args = parse(&[
            "mount",
            "/var/lib/kubelet/pods/p/volumes/vcd~flexvol/data1",
            r#"{"kubernetes.io/pvOrVolumeName": "data1", "diskInitialSize": "1g"}"#,
        ]);
        match args.callout.into_request().unwrap() {
            Request::Mount(request) => {
                assert_eq!(request.options.volume_name, "data1");
                assert!(request.mount_dir.ends_with("/data1"));
            }
            other => panic!("unexpected request: {other:?}"),
        }

        let args = parse(&["unmount", "/mnt/data1"]);
        assert_eq!(
            args.callout.into_request().unwrap(),
            Request::Unmount(UnmountRequest { mount_dir: "/mnt/data1".to_string() })
        );

        let args = parse(&["--config", "/tmp/x.toml", "attach", "{}", "node"]);
        assert_eq!(args.config, "/tmp/x.toml");
        assert_eq!(
            args.callout.into_request().unwrap(),
            Request::NotSupported("attach".to_string())
        );
    }

    #[tokio::test]
    async fn callouts_that_touch_no_disk_need_no_config() {
        let args = parse(&["--config", "/nonexistent/vcd-flexvol.toml", "init"]);
        let result = args.exec().await;
        assert_eq!(result.status, ExecStatus::Success);
        assert!(result.capabilities.is_some());

        let args =
            parse(&["--config", "/nonexistent/vcd-flexvol.toml", "getvolumename"]);
        assert_eq!(args.exec().await.status, ExecStatus::NotSupported);
    }

    #[tokio::test]
    async fn bad_options_and_missing_config_fail() {
        let args = parse(&["mount", "/mnt/data1", "{oops"]);
        let result = args.exec().await;
        assert_eq!(result.status, ExecStatus::Failure);
        assert!(result.message.contains("invalid mount options"));

        let args = parse(&[
            "--config",
            "/nonexistent/vcd-flexvol.toml",
            "unmount",
            "/mnt/data1",
        ]);
        let result = args.exec().await;
        assert_eq!(result.status, ExecStatus::Failure);
        assert!(result.message.contains("/nonexistent/vcd-flexvol.toml"));
    }
}
