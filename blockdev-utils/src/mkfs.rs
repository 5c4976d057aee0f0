// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Creating filesystems on whole block devices.

use crate::fs::FsType;
use crate::lsblk::BlockDevice;
use crate::{execute_with_timeout, ExecutionError, MKFS_EXT4};
use slog::Logger;
use std::time::Duration;
use uuid::Uuid;

fn format_command(
    device: &BlockDevice,
    fs_type: FsType,
    label: &str,
    uuid: Uuid,
) -> tokio::process::Command {
    let mut cmd = match fs_type {
        FsType::Ext4 => tokio::process::Command::new(MKFS_EXT4),
    };
    cmd.env("LC_ALL", "C.UTF-8")
        .arg("-F")
        .arg("-L")
        .arg(label)
        .arg("-U")
        .arg(uuid.to_string())
        .arg(device.dev_path().as_str());
    cmd
}

/// Formats `device` with a filesystem carrying `label` and `uuid`.
///
/// The mkfs process is killed if it has not finished within `timeout`.
pub async fn format(
    log: &Logger,
    device: &BlockDevice,
    fs_type: FsType,
    label: &str,
    uuid: Uuid,
    timeout: Duration,
) -> Result<(), ExecutionError> {
    let mut cmd = format_command(device, fs_type, label, uuid);
    execute_with_timeout(log, &mut cmd, timeout).await?;
    Ok(())
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn ext4_command_line() {
        let uuid: Uuid = "6b1c2ad0-4c5b-4a3b-8a1e-5f0f3b2c9d10".parse().unwrap();
        let cmd =
            format_command(&BlockDevice::new("sdc"), FsType::Ext4, "data1", uuid);
        let cmd = cmd.as_std();
        assert_eq!(cmd.get_program(), MKFS_EXT4);
        let args: Vec<_> =
            cmd.get_args().map(|a| a.to_string_lossy().into_owned()).collect();
        assert_eq!(
            args,
            [
                "-F",
                "-L",
                "data1",
                "-U",
                "6b1c2ad0-4c5b-4a3b-8a1e-5f0f3b2c9d10",
                "/dev/sdc"
            ]
        );
    }
}
