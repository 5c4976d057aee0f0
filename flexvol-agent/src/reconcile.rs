// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Working out which block device belongs to which disk.
//!
//! The cloud does not say which device node an attached disk becomes, so the
//! driver compares snapshots of the host's block devices taken around each
//! attach, and trusts the filesystem label and the disk's metadata after
//! that.

use crate::agent::Context;
use crate::meta::DiskMeta;
use crate::Error;
use blockdev_utils::lsblk::{self, BlockDevice};
use camino::Utf8Path;
use slog::info;
use std::collections::BTreeSet;
use vcd_client::Disk;

/// Returns the one device in `after` whose name is not in `before`.
pub fn new_device(
    before: &[BlockDevice],
    after: &[BlockDevice],
) -> Result<BlockDevice, Error> {
    let known: BTreeSet<&str> =
        before.iter().map(|dev| dev.name.as_str()).collect();
    let mut added: Vec<&BlockDevice> = after
        .iter()
        .filter(|dev| !known.contains(dev.name.as_str()))
        .collect();
    match added.len() {
        0 => Err(Error::NoNewDeviceFound),
        1 => Ok(added.remove(0).clone()),
        _ => Err(Error::AmbiguousNewDevice {
            devices: added.iter().map(|dev| dev.name.clone()).collect(),
        }),
    }
}

/// Finds a device that is mounted with a filesystem labelled `label`.
pub fn mounted_with_label<'a>(
    devices: &'a [BlockDevice],
    label: &str,
) -> Option<&'a BlockDevice> {
    devices.iter().find(|dev| dev.is_mounted_with_label(label))
}

/// Whether `device` can be taken for the node of `disk`: it carries the
/// disk's label, or it is blank and exactly the disk's size.
pub fn holds_disk(device: &BlockDevice, disk: &Disk) -> bool {
    match device.label.as_deref() {
        Some(label) => label == disk.name,
        None => {
            device.fs_type.is_none() && device.size == Some(disk.size_bytes)
        }
    }
}

/// How an unmount found its disk.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Resolution {
    /// A device is mounted at the directory and its label names the disk.
    MountedLabel,
    /// Nothing is mounted there; the directory's name is the disk's name and
    /// the disk's metadata names this VM and a device present on the host.
    Metadata,
}

impl Context<'_> {
    /// Finds the disk and device behind the volume at `mount_dir`.
    pub(crate) async fn resolve_volume(
        &self,
        devices: &[BlockDevice],
        mount_dir: &Utf8Path,
    ) -> Result<(Disk, BlockDevice, Resolution), Error> {
        let unresolved = |reason: String| Error::VolumeNotResolved {
            mount_dir: mount_dir.to_string(),
            reason,
        };

        if let Some((device, node)) =
            lsblk::find_by_mount_point(devices, mount_dir)
        {
            let Some(label) = node.label.as_deref() else {
                return Err(unresolved(format!(
                    "/dev/{} is mounted there but has no filesystem label",
                    node.name
                )));
            };
            let disk = self
                .cloud
                .find_disk_by_name(label)
                .await
                .map_err(Error::cloud("look up disk by filesystem label"))?;
            info!(
                self.log,
                "resolved volume from mounted device";
                "disk" => &disk.name,
                "device" => &device.name,
            );
            return Ok((disk, device.clone(), Resolution::MountedLabel));
        }

        let Some(volume) = mount_dir.file_name() else {
            return Err(unresolved(
                "nothing is mounted there and it has no final path \
                 component to name a disk"
                    .to_string(),
            ));
        };
        let disk = match self.cloud.find_disk_by_name(volume).await {
            Ok(disk) => disk,
            Err(err) if err.is_not_found() => {
                return Err(unresolved(format!(
                    "nothing is mounted there and no disk is named {volume:?}"
                )));
            }
            Err(err) => {
                return Err(Error::cloud("look up disk by volume name")(err))
            }
        };
        let meta = DiskMeta::of(&disk)
            .filter(|meta| meta.vm_name == self.vm.name)
            .filter(|meta| !meta.device_name.is_empty())
            .ok_or_else(|| {
                unresolved(format!(
                    "disk {} is not recorded as bound to this node",
                    disk.name
                ))
            })?;
        if !disk.is_attached_to(&self.vm.name) {
            return Err(unresolved(format!(
                "disk {} is not attached to this node",
                disk.name
            )));
        }
        let device = lsblk::find_by_name(devices, &meta.device_name)
            .ok_or_else(|| {
                unresolved(format!(
                    "recorded device /dev/{} is not present",
                    meta.device_name
                ))
            })?;
        if !holds_disk(device, &disk) {
            return Err(unresolved(format!(
                "recorded device /dev/{} does not hold this disk",
                meta.device_name
            )));
        }
        info!(
            self.log,
            "resolved volume from disk metadata";
            "disk" => &disk.name,
            "device" => &device.name,
        );
        Ok((disk, device.clone(), Resolution::Metadata))
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn devices(names: &[&str]) -> Vec<BlockDevice> {
        names.iter().map(|name| BlockDevice::new(*name)).collect()
    }

    #[test]
    fn single_new_device_is_found() {
        let before = devices(&["sda", "sdb"]);
        let after = devices(&["sda", "sdb", "sdc"]);
        assert_eq!(new_device(&before, &after).unwrap().name, "sdc");
    }

    #[test]
    fn identical_snapshots_find_nothing() {
        let snapshot = devices(&["sda", "sdb"]);
        assert!(matches!(
            new_device(&snapshot, &snapshot),
            Err(Error::NoNewDeviceFound)
        ));
        // A device disappearing is not a new device.
        assert!(matches!(
            new_device(&snapshot, &devices(&["sda"])),
            Err(Error::NoNewDeviceFound)
        ));
    }

    #[test]
    fn two_new_devices_are_ambiguous() {
        let before = devices(&["sda"]);
        let after = devices(&["sda", "sdb", "sdc"]);
        match new_device(&before, &after) {
            Err(Error::AmbiguousNewDevice { devices }) => {
                assert_eq!(devices, ["sdb", "sdc"]);
            }
            other => panic!("unexpected result: {other:?}"),
        }
    }

    #[test]
    fn device_ownership_needs_label_or_blank_of_same_size() {
        let disk = Disk {
            id: "urn:vcloud:disk:1".to_string(),
            name: "data1".to_string(),
            href: "https://vcd.test/api/disk/1".to_string(),
            size_bytes: 1 << 30,
            description: String::new(),
            attached_vm: None,
        };
        let mut device = BlockDevice::new("sdb");
        device.size = Some(1 << 30);
        assert!(holds_disk(&device, &disk));

        device.size = Some(5 << 30);
        assert!(!holds_disk(&device, &disk));
        device.size = None;
        assert!(!holds_disk(&device, &disk));

        device.label = Some("data1".to_string());
        device.fs_type = Some("ext4".to_string());
        assert!(holds_disk(&device, &disk));
        device.label = Some("data2".to_string());
        assert!(!holds_disk(&device, &disk));

        // A filesystem without a label belongs to someone else.
        device.label = None;
        device.size = Some(1 << 30);
        assert!(!holds_disk(&device, &disk));
    }

    #[test]
    fn finds_mounted_label() {
        let mut devices = devices(&["sda", "sdb", "sdc"]);
        devices[1].label = Some("data1".to_string());
        devices[2].label = Some("data2".to_string());
        devices[2].mount_point = Some("/mnt/data2".to_string());
        assert!(mounted_with_label(&devices, "data1").is_none());
        assert_eq!(mounted_with_label(&devices, "data2").unwrap().name, "sdc");
    }
}
