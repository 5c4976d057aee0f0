// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Mounting a volume: find or create its disk, attach it here, format it if
//! it is blank, record the binding and mount it.

use crate::agent::Context;
use crate::meta::DiskMeta;
use crate::operation::{MountRequest, VolumeBinding};
use crate::reconcile::{holds_disk, mounted_with_label, new_device};
use crate::size::parse_size;
use crate::Error;
use blockdev_utils::fs::{FsType, MountMode};
use blockdev_utils::lsblk::{self, BlockDevice};
use camino::Utf8PathBuf;
use slog::{info, warn};
use uuid::Uuid;
use vcd_client::{Disk, VAppVm};

/// A mount request that passed validation.
#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) struct MountPlan {
    pub mount_dir: Utf8PathBuf,
    pub volume: String,
    pub size_bytes: u64,
    pub fs_type: FsType,
    pub mode: MountMode,
}

/// Checks a request without side effects.
pub(crate) fn validate(request: &MountRequest) -> Result<MountPlan, Error> {
    let options = &request.options;
    if request.mount_dir.is_empty() {
        return Err(Error::Validation("mount directory is empty".to_string()));
    }
    if options.volume_name.is_empty() {
        return Err(Error::Validation("volume name is empty".to_string()));
    }
    if options.disk_initial_size.is_empty() {
        return Err(Error::Validation("disk initial size is empty".to_string()));
    }
    let fs_type = if options.fs_type.is_empty() {
        FsType::default()
    } else {
        options.fs_type.parse()?
    };
    let max = fs_type.max_label_len();
    if options.volume_name.len() > max {
        return Err(Error::Validation(format!(
            "volume name {:?} is {} bytes; {fs_type} labels hold at most {max}",
            options.volume_name,
            options.volume_name.len(),
        )));
    }
    Ok(MountPlan {
        mount_dir: Utf8PathBuf::from(&request.mount_dir),
        volume: options.volume_name.clone(),
        size_bytes: parse_size(&options.disk_initial_size)?,
        fs_type,
        mode: options.readwrite.parse()?,
    })
}

/// The filesystem UUID for a disk: the UUID at the end of its id.
pub(crate) fn disk_uuid(disk: &Disk) -> Result<Uuid, Error> {
    let suffix = disk.id_suffix();
    // Only the hyphenated form; Uuid::parse_str also takes bare hex.
    if suffix.len() != 36 {
        return Err(Error::InvalidDiskUuid(disk.id.clone()));
    }
    Uuid::parse_str(suffix).map_err(|_| Error::InvalidDiskUuid(disk.id.clone()))
}

impl Context<'_> {
    pub(crate) async fn mount(
        &self,
        plan: &MountPlan,
    ) -> Result<VolumeBinding, Error> {
        let disk = match self.cloud.find_disk_by_name(&plan.volume).await {
            Ok(disk) => self.release_attachment(disk).await?,
            Err(err) if err.is_not_found() => {
                info!(
                    self.log,
                    "creating disk";
                    "disk" => &plan.volume,
                    "size" => plan.size_bytes,
                );
                self.cloud
                    .create_disk(&plan.volume, plan.size_bytes)
                    .await
                    .map_err(Error::cloud("create disk"))?;
                self.cloud
                    .find_disk_by_name(&plan.volume)
                    .await
                    .map_err(Error::cloud("look up created disk"))?
            }
            Err(err) => return Err(Error::cloud("look up disk")(err)),
        };

        let before = self.snapshot("list devices before attach").await?;
        if let Some(device) = mounted_with_label(&before, &plan.volume) {
            return Err(Error::AlreadyAttached {
                disk: plan.volume.clone(),
                device: device.name.clone(),
            });
        }

        self.cloud
            .attach_disk(self.vm, &disk)
            .await
            .map_err(Error::cloud("attach disk"))?;
        let after = self.snapshot("list devices after attach").await?;
        let mut device = new_device(&before, &after)?;
        info!(
            self.log,
            "disk attached";
            "disk" => &disk.name,
            "device" => &device.name,
        );

        if !device.is_formatted() {
            let uuid = disk_uuid(&disk)?;
            info!(
                self.log,
                "formatting blank device";
                "device" => &device.name,
                "fs_type" => %plan.fs_type,
                "uuid" => %uuid,
            );
            self.host
                .format(
                    &device,
                    plan.fs_type,
                    &plan.volume,
                    uuid,
                    self.config.host.format_timeout(),
                )
                .await
                .map_err(Error::host("format device"))?;
            device.fs_type = Some(plan.fs_type.to_string());
            device.label = Some(plan.volume.clone());
            device.uuid = Some(uuid.to_string());
        }

        let (disk, device) = self.set_meta(disk, device).await?;

        self.host
            .mount(&device, &plan.mount_dir, plan.fs_type, plan.mode)
            .await
            .map_err(Error::host("mount device"))?;
        info!(
            self.log,
            "volume mounted";
            "disk" => &disk.name,
            "device" => &device.name,
            "mode" => %plan.mode,
        );

        Ok(VolumeBinding {
            disk_id: disk.id,
            disk_name: disk.name,
            device_name: device.name,
            mount_point: plan.mount_dir.to_string(),
        })
    }

    /// Detaches `disk` from whatever VM holds it, unless it is already
    /// mounted here, and returns the disk as the cloud now reports it.
    ///
    /// A disk that is attached here and mounted is left alone so the
    /// already-attached check can report it.
    async fn release_attachment(&self, disk: Disk) -> Result<Disk, Error> {
        let Some(holder) = disk.attached_vm.clone() else {
            return Ok(disk);
        };
        let ours = holder.name == self.vm.name;
        let meta_names_us =
            DiskMeta::of(&disk).is_some_and(|meta| meta.vm_name == self.vm.name);

        if ours || meta_names_us {
            let devices =
                self.snapshot("list devices before releasing disk").await?;
            if ours && mounted_with_label(&devices, &disk.name).is_some() {
                return Ok(disk);
            }
            self.remove_stale_device(&disk, &devices).await;
        }

        info!(
            self.log,
            "detaching disk from its current VM";
            "disk" => &disk.name,
            "vm" => &holder.name,
        );
        self.cloud
            .detach_disk(&VAppVm::from(&holder), &disk)
            .await
            .map_err(Error::cloud("detach disk from its current VM"))?;
        self.cloud
            .find_disk_by_name(&disk.name)
            .await
            .map_err(Error::cloud("look up disk after detach"))
    }

    /// Removes the local node of the device `disk`'s metadata names, if that
    /// device is still here and idle. Failures are only logged.
    async fn remove_stale_device(&self, disk: &Disk, devices: &[BlockDevice]) {
        let Some(meta) = DiskMeta::of(disk) else {
            return;
        };
        if meta.vm_name != self.vm.name || meta.device_name.is_empty() {
            return;
        }
        let Some(device) = lsblk::find_by_name(devices, &meta.device_name)
        else {
            return;
        };
        if device.is_mounted() {
            warn!(
                self.log,
                "not removing recorded device; it is mounted";
                "device" => &device.name,
            );
            return;
        }
        if !holds_disk(device, disk) {
            return;
        }
        if let Err(err) = self.host.remove_scsi_device(&device.name).await {
            warn!(
                self.log,
                "failed to remove stale SCSI device";
                "device" => &device.name,
                "error" => %err,
            );
        }
    }
}
