// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The block-device operations a node performs, behind a trait so callers
//! can be exercised without touching real hardware.

use crate::fs::{FsType, MountMode};
use crate::lsblk::BlockDevice;
use crate::{lsblk, mkfs, mount, scsi, ExecutionError};
use camino::{Utf8Path, Utf8PathBuf};
use slog::Logger;
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("failed to rescan SCSI hosts: {0}")]
    Rescan(#[source] scsi::Error),

    #[error("failed to list block devices: {0}")]
    List(#[source] ExecutionError),

    #[error("failed to format /dev/{device}: {err}")]
    Format {
        device: String,
        #[source]
        err: ExecutionError,
    },

    #[error("failed to mount /dev/{device} at {dir}: {err}")]
    Mount {
        device: String,
        dir: Utf8PathBuf,
        #[source]
        err: mount::Error,
    },

    #[error("failed to unmount {dir}: {err}")]
    Unmount {
        dir: Utf8PathBuf,
        #[source]
        err: mount::Error,
    },

    #[error("failed to remove SCSI device {device}: {err}")]
    RemoveDevice {
        device: String,
        #[source]
        err: scsi::Error,
    },
}

#[async_trait::async_trait]
pub trait Api: Send + Sync {
    /// Returns a fresh snapshot of the host's block devices.
    async fn block_devices(&self) -> Result<Vec<BlockDevice>, Error>;

    async fn format(
        &self,
        device: &BlockDevice,
        fs_type: FsType,
        label: &str,
        uuid: Uuid,
        timeout: Duration,
    ) -> Result<(), Error>;

    async fn mount(
        &self,
        device: &BlockDevice,
        dir: &Utf8Path,
        fs_type: FsType,
        mode: MountMode,
    ) -> Result<(), Error>;

    /// Returns `Ok(false)` if nothing was mounted at `dir`.
    async fn unmount(&self, dir: &Utf8Path) -> Result<bool, Error>;

    async fn remove_scsi_device(&self, name: &str) -> Result<(), Error>;
}

/// The real host, driven through lsblk, mkfs, mount and sysfs.
pub struct Host {
    log: Logger,
    sysfs_root: Utf8PathBuf,
    settle_delay: Duration,
}

impl Host {
    pub fn new(
        log: &Logger,
        sysfs_root: Utf8PathBuf,
        settle_delay: Duration,
    ) -> Arc<Self> {
        Arc::new(Self {
            log: log.new(slog::o!("component" => "Host")),
            sysfs_root,
            settle_delay,
        })
    }
}

#[async_trait::async_trait]
impl Api for Host {
    async fn block_devices(&self) -> Result<Vec<BlockDevice>, Error> {
        // Callers diff successive snapshots, so a listing taken without a
        // rescan and settle is not worth returning.
        scsi::rescan(&self.log, &self.sysfs_root).await.map_err(Error::Rescan)?;
        if !self.settle_delay.is_zero() {
            tokio::time::sleep(self.settle_delay).await;
        }
        lsblk::list(&self.log).await.map_err(Error::List)
    }

    async fn format(
        &self,
        device: &BlockDevice,
        fs_type: FsType,
        label: &str,
        uuid: Uuid,
        timeout: Duration,
    ) -> Result<(), Error> {
        mkfs::format(&self.log, device, fs_type, label, uuid, timeout)
            .await
            .map_err(|err| Error::Format { device: device.name.clone(), err })
    }

    async fn mount(
        &self,
        device: &BlockDevice,
        dir: &Utf8Path,
        fs_type: FsType,
        mode: MountMode,
    ) -> Result<(), Error> {
        mount::mount(&self.log, device, dir, fs_type, mode).await.map_err(
            |err| Error::Mount {
                device: device.name.clone(),
                dir: dir.to_owned(),
                err,
            },
        )
    }

    async fn unmount(&self, dir: &Utf8Path) -> Result<bool, Error> {
        mount::unmount(&self.log, dir)
            .await
            .map_err(|err| Error::Unmount { dir: dir.to_owned(), err })
    }

    async fn remove_scsi_device(&self, name: &str) -> Result<(), Error> {
        scsi::remove_device(&self.log, &self.sysfs_root, name).await.map_err(
            |err| Error::RemoveDevice { device: name.to_string(), err },
        )
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::test_log;
    use camino_tempfile::Utf8TempDir;

    #[tokio::test]
    async fn listing_fails_when_rescan_fails() {
        let log = test_log();
        let dir = Utf8TempDir::new().unwrap();
        // No class/scsi_host directory to write scan requests into.
        let host = Host::new(&log, dir.path().join("sys"), Duration::ZERO);

        let err = host.block_devices().await.unwrap_err();
        assert!(
            matches!(err, Error::Rescan(scsi::Error::Io { .. })),
            "{err}"
        );
    }
}
