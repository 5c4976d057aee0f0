// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! SCSI bus rescans and device removal through sysfs.

use crate::{execute_async, ExecutionError, UDEVADM};
use camino::{Utf8Path, Utf8PathBuf};
use slog::{debug, info, Logger};

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("failed to access {path}: {err}")]
    Io {
        path: Utf8PathBuf,
        #[source]
        err: std::io::Error,
    },

    #[error("invalid block device name {0:?}")]
    InvalidDeviceName(String),

    #[error("udev did not settle: {0}")]
    Settle(#[source] ExecutionError),
}

/// Asks every SCSI host adapter to rescan its bus, then waits for udev to
/// finish creating device nodes.
pub async fn rescan(log: &Logger, sysfs_root: &Utf8Path) -> Result<(), Error> {
    let scanned = scan_hosts(log, sysfs_root).await?;
    info!(log, "rescanned SCSI hosts"; "count" => scanned);
    settle(log).await
}

/// Writes the wildcard scan request to every SCSI host under `sysfs_root`,
/// returning how many hosts were asked.
pub async fn scan_hosts(
    log: &Logger,
    sysfs_root: &Utf8Path,
) -> Result<usize, Error> {
    let hosts = sysfs_root.join("class/scsi_host");
    let mut entries = tokio::fs::read_dir(&hosts)
        .await
        .map_err(|err| Error::Io { path: hosts.clone(), err })?;
    let mut scanned = 0;
    while let Some(entry) = entries
        .next_entry()
        .await
        .map_err(|err| Error::Io { path: hosts.clone(), err })?
    {
        let Ok(name) = entry.file_name().into_string() else {
            continue;
        };
        let scan = hosts.join(&name).join("scan");
        debug!(log, "scanning SCSI host"; "path" => %scan);
        tokio::fs::write(&scan, b"- - -")
            .await
            .map_err(|err| Error::Io { path: scan.clone(), err })?;
        scanned += 1;
    }
    Ok(scanned)
}

/// Removes the kernel's node for block device `name`.
pub async fn remove_device(
    log: &Logger,
    sysfs_root: &Utf8Path,
    name: &str,
) -> Result<(), Error> {
    if name.is_empty() || name.contains('/') || name == "." || name == ".." {
        return Err(Error::InvalidDeviceName(name.to_string()));
    }
    let delete = sysfs_root.join("block").join(name).join("device/delete");
    info!(log, "removing SCSI device"; "device" => name, "path" => %delete);
    tokio::fs::write(&delete, b"1")
        .await
        .map_err(|err| Error::Io { path: delete, err })?;
    Ok(())
}

pub async fn settle(log: &Logger) -> Result<(), Error> {
    let mut cmd = tokio::process::Command::new(UDEVADM);
    cmd.arg("settle");
    execute_async(log, &mut cmd).await.map_err(Error::Settle)?;
    Ok(())
}
