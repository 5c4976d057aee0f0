// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Operator tool for inspecting and releasing the driver's disks.

use anyhow::{bail, Context, Result};
use camino::Utf8PathBuf;
use clap::{Parser, Subcommand};
use flexvol_agent::config::{Config, CONFIG_PATH_ENV, DEFAULT_CONFIG_PATH};
use flexvol_agent::lock::acquire_or_back_off;
use flexvol_agent::logging::setup_log;
use flexvol_agent::DiskMeta;
use slog::info;
use vcd_client::{Api as _, Connector, VAppVm};

#[derive(Debug, Parser)]
#[command(version)]
struct Args {
    /// Path to the driver configuration file.
    #[clap(long, env = CONFIG_PATH_ENV, default_value = DEFAULT_CONFIG_PATH)]
    config: Utf8PathBuf,

    #[clap(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Print a disk, its attachment and its binding as JSON.
    Show { disk: String },
    /// Detach a disk from the VM holding it.
    Detach {
        disk: String,
        /// Only detach if the disk is attached to this VM.
        #[clap(long)]
        vm: Option<String>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let config = Config::from_file(&args.config)?;
    let log = setup_log(&config.log).context("setting up logging")?;
    let connector = vcd_client::ClientConnector::new(&log, config.vcd.clone());
    let cloud = connector.connect().await.context("connecting")?;

    match args.command {
        Command::Show { disk } => {
            let disk = cloud.find_disk_by_name(&disk).await?;
            let meta = DiskMeta::of(&disk);
            let out = serde_json::json!({ "disk": disk, "binding": meta });
            println!("{}", serde_json::to_string_pretty(&out)?);
        }
        Command::Detach { disk, vm } => {
            // The driver must not snapshot devices while we detach.
            let _lock = acquire_or_back_off(
                &log,
                &config.lock.path(),
                config.lock.contention_backoff(),
            )
            .await?;
            let disk = cloud.find_disk_by_name(&disk).await?;
            let Some(holder) = &disk.attached_vm else {
                bail!("disk {} is not attached", disk.name);
            };
            if let Some(vm) = vm.as_deref().filter(|vm| *vm != holder.name) {
                bail!(
                    "disk {} is attached to {}, not {vm}",
                    disk.name,
                    holder.name
                );
            }
            cloud.detach_disk(&VAppVm::from(holder), &disk).await?;
            info!(log, "detached disk"; "disk" => &disk.name, "vm" => &holder.name);
            println!("detached {} from {}", disk.name, holder.name);
        }
    }
    Ok(())
}
