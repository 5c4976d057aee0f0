// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Mounting and unmounting filesystems.

use crate::fs::{FsType, MountMode};
use crate::lsblk::BlockDevice;
use crate::{execute_async, ExecutionError, MOUNT, UMOUNT};
use camino::{Utf8Path, Utf8PathBuf};
use slog::{info, Logger};

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("failed to create mount directory {path}: {err}")]
    CreateDir {
        path: Utf8PathBuf,
        #[source]
        err: std::io::Error,
    },

    #[error(transparent)]
    Execution(#[from] ExecutionError),
}

fn mount_command(
    device: &BlockDevice,
    dir: &Utf8Path,
    fs_type: FsType,
    mode: MountMode,
) -> tokio::process::Command {
    let mut cmd = tokio::process::Command::new(MOUNT);
    cmd.env("LC_ALL", "C.UTF-8")
        .arg("-t")
        .arg(fs_type.as_str())
        .arg("-o")
        .arg(mode.as_option())
        .arg(device.dev_path().as_str())
        .arg(dir.as_str());
    cmd
}

/// Mounts `device` at `dir`, creating the directory if needed.
pub async fn mount(
    log: &Logger,
    device: &BlockDevice,
    dir: &Utf8Path,
    fs_type: FsType,
    mode: MountMode,
) -> Result<(), Error> {
    tokio::fs::create_dir_all(dir)
        .await
        .map_err(|err| Error::CreateDir { path: dir.to_owned(), err })?;
    let mut cmd = mount_command(device, dir, fs_type, mode);
    execute_async(log, &mut cmd).await?;
    Ok(())
}

/// Unmounts whatever is mounted at `dir`.
///
/// Returns `Ok(false)` if nothing was mounted there.
pub async fn unmount(log: &Logger, dir: &Utf8Path) -> Result<bool, Error> {
    let mut cmd = tokio::process::Command::new(UMOUNT);
    cmd.env("LC_ALL", "C.UTF-8").arg(dir.as_str());
    match execute_async(log, &mut cmd).await {
        Ok(_) => Ok(true),
        Err(err) if err.stderr().is_some_and(is_not_mounted) => {
            info!(log, "nothing mounted"; "dir" => %dir);
            Ok(false)
        }
        Err(err) => Err(err.into()),
    }
}

fn is_not_mounted(stderr: &str) -> bool {
    stderr.contains("not mounted") || stderr.contains("no mount point specified")
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn read_only_mount_command_line() {
        let cmd = mount_command(
            &BlockDevice::new("sdb"),
            Utf8Path::new("/mnt/data1"),
            FsType::Ext4,
            MountMode::ReadOnly,
        );
        let args: Vec<_> = cmd
            .as_std()
            .get_args()
            .map(|a| a.to_string_lossy().into_owned())
            .collect();
        assert_eq!(args, ["-t", "ext4", "-o", "ro", "/dev/sdb", "/mnt/data1"]);
    }

    #[test]
    fn recognizes_not_mounted_messages() {
        assert!(is_not_mounted("umount: /mnt/data1: not mounted.\n"));
        assert!(is_not_mounted(
            "umount: /mnt/gone: no mount point specified.\n"
        ));
        assert!(!is_not_mounted("umount: /mnt/data1: target is busy.\n"));
    }
}
