// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use crate::agent::Context;
use crate::operation::{UnmountRequest, VolumeBinding};
use crate::Error;
use camino::{Utf8Path, Utf8PathBuf};
use slog::info;

pub(crate) fn validate(request: &UnmountRequest) -> Result<Utf8PathBuf, Error> {
    if request.mount_dir.is_empty() {
        return Err(Error::Validation("mount directory is empty".to_string()));
    }
    Ok(Utf8PathBuf::from(&request.mount_dir))
}

impl Context<'_> {
    /// Unmounts the volume at `mount_dir`, detaches its disk from this VM
    /// and clears the disk's binding.
    pub(crate) async fn unmount(
        &self,
        mount_dir: &Utf8Path,
    ) -> Result<VolumeBinding, Error> {
        let devices = self.snapshot("list devices").await?;
        let (disk, device, resolution) =
            self.resolve_volume(&devices, mount_dir).await?;

        let holder = match &disk.attached_vm {
            Some(vm) if vm.name == self.vm.name => true,
            None => false,
            Some(vm) => {
                return Err(Error::VolumeNotResolved {
                    mount_dir: mount_dir.to_string(),
                    reason: format!(
                        "disk {} is attached to {}, not this node",
                        disk.name, vm.name
                    ),
                });
            }
        };

        let was_mounted = self
            .host
            .unmount(mount_dir)
            .await
            .map_err(Error::host("unmount filesystem"))?;
        info!(
            self.log,
            "unmounted";
            "disk" => &disk.name,
            "device" => &device.name,
            "was_mounted" => was_mounted,
            "resolution" => ?resolution,
        );

        self.host
            .remove_scsi_device(&device.name)
            .await
            .map_err(Error::host("remove SCSI device"))?;

        if holder {
            self.cloud
                .detach_disk(self.vm, &disk)
                .await
                .map_err(Error::cloud("detach disk"))?;
        } else {
            info!(self.log, "disk already detached"; "disk" => &disk.name);
        }
        let disk = self.clear_meta(&disk).await?;

        Ok(VolumeBinding {
            disk_id: disk.id,
            disk_name: disk.name,
            device_name: device.name,
            mount_point: mount_dir.to_string(),
        })
    }
}
