// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The record of which VM and device a disk is bound to, kept in the disk's
//! description.
//!
//! The cloud refuses to change a disk's description while it is attached, so
//! every update detaches the disk, writes the record, and reattaches it. The
//! reattached disk may come back under a different device name, in which
//! case the record is rewritten until it names the device the disk actually
//! has.

use crate::agent::Context;
use crate::reconcile::new_device;
use crate::Error;
use blockdev_utils::lsblk::BlockDevice;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use slog::{debug, info, warn};
use vcd_client::Disk;

/// How many detach and reattach rounds to try before giving up on a device
/// name that keeps changing.
pub const MAX_META_ROUNDS: usize = 3;

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DiskMeta {
    pub vm_name: String,
    pub device_name: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl DiskMeta {
    /// Reads the record from a description. Anything that is not a record,
    /// including an empty description, reads as no record.
    pub fn decode(description: &str) -> Option<DiskMeta> {
        serde_json::from_str(description).ok()
    }

    pub fn of(disk: &Disk) -> Option<DiskMeta> {
        Self::decode(&disk.description)
    }

    pub fn encode(&self) -> Result<String, Error> {
        serde_json::to_string(self).map_err(Error::EncodeMeta)
    }

    /// The record that replaces `previous`, keeping its creation time and
    /// never moving the update time backwards.
    pub fn successor(
        previous: Option<&DiskMeta>,
        vm_name: &str,
        device_name: &str,
        now: DateTime<Utc>,
    ) -> DiskMeta {
        let (created_at, updated_at) = match previous {
            Some(prev) => (prev.created_at, now.max(prev.updated_at)),
            None => (now, now),
        };
        DiskMeta {
            vm_name: vm_name.to_string(),
            device_name: device_name.to_string(),
            created_at,
            updated_at,
        }
    }

    pub fn binds(&self, vm_name: &str, device_name: &str) -> bool {
        self.vm_name == vm_name && self.device_name == device_name
    }

    pub fn is_cleared(&self) -> bool {
        self.vm_name.is_empty() && self.device_name.is_empty()
    }
}

impl Context<'_> {
    /// Records that `disk`, attached to this VM as `device`, is bound to it.
    ///
    /// Returns the refreshed disk and the device it is attached as once the
    /// record and the host agree.
    pub(crate) async fn set_meta(
        &self,
        disk: Disk,
        device: BlockDevice,
    ) -> Result<(Disk, BlockDevice), Error> {
        let mut disk = disk;
        let mut device = device;
        for round in 1..=MAX_META_ROUNDS {
            if DiskMeta::of(&disk)
                .is_some_and(|meta| meta.binds(&self.vm.name, &device.name))
            {
                debug!(
                    self.log,
                    "disk metadata already current";
                    "disk" => &disk.name,
                    "device" => &device.name,
                );
                return Ok((disk, device));
            }

            info!(
                self.log,
                "updating disk metadata";
                "disk" => &disk.name,
                "device" => &device.name,
                "round" => round,
            );
            self.cloud
                .detach_disk(self.vm, &disk)
                .await
                .map_err(Error::cloud("detach disk to update metadata"))?;
            if let Err(err) = self.host.remove_scsi_device(&device.name).await {
                warn!(
                    self.log,
                    "failed to remove stale SCSI device";
                    "device" => &device.name,
                    "error" => %err,
                );
            }
            disk = self.write_meta(&disk, &self.vm.name, &device.name).await?;

            let before = self.snapshot("list devices before reattach").await?;
            self.cloud
                .attach_disk(self.vm, &disk)
                .await
                .map_err(Error::cloud("reattach disk after metadata update"))?;
            let after = self.snapshot("list devices after reattach").await?;
            let reappeared = new_device(&before, &after)?;

            if reappeared.name == device.name && reappeared.label == device.label
            {
                let disk = self
                    .cloud
                    .find_disk_by_name(&disk.name)
                    .await
                    .map_err(Error::cloud("look up disk after reattach"))?;
                return Ok((disk, reappeared));
            }
            warn!(
                self.log,
                "disk came back as a different device";
                "disk" => &disk.name,
                "expected" => &device.name,
                "found" => &reappeared.name,
                "round" => round,
            );
            device = reappeared;
        }
        Err(Error::MetaConvergenceFailed {
            disk: disk.name,
            rounds: MAX_META_ROUNDS,
        })
    }

    /// Blanks the binding in the description of a detached disk.
    pub(crate) async fn clear_meta(&self, disk: &Disk) -> Result<Disk, Error> {
        match DiskMeta::of(disk) {
            Some(meta) if !meta.is_cleared() => {
                self.write_meta(disk, "", "").await
            }
            _ => Ok(disk.clone()),
        }
    }

    /// Writes the description of a detached disk and returns the disk as
    /// the cloud now reports it.
    async fn write_meta(
        &self,
        disk: &Disk,
        vm_name: &str,
        device_name: &str,
    ) -> Result<Disk, Error> {
        let meta = DiskMeta::successor(
            DiskMeta::of(disk).as_ref(),
            vm_name,
            device_name,
            Utc::now(),
        );
        self.cloud
            .set_disk_description(disk, &meta.encode()?)
            .await
            .map_err(Error::cloud("write disk metadata"))?;
        self.cloud
            .find_disk_by_name(&disk.name)
            .await
            .map_err(Error::cloud("look up disk after metadata update"))
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::testing::{test_log, World, NODE};
    use blockdev_utils::fakes::host::Call as HostCall;
    use chrono::TimeZone;
    use vcd_client::fakes::vdc::Call as CloudCall;

    #[test]
    fn description_round_trips_with_camel_case_keys() {
        let at = Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap();
        let meta = DiskMeta::successor(None, "worker-1", "sdb", at);
        let encoded = meta.encode().unwrap();
        let value: serde_json::Value = serde_json::from_str(&encoded).unwrap();
        assert_eq!(value["vmName"], "worker-1");
        assert_eq!(value["deviceName"], "sdb");
        assert!(value["createdAt"].as_str().unwrap().starts_with("2024-05-01"));
        assert_eq!(DiskMeta::decode(&encoded), Some(meta));
    }

    #[test]
    fn foreign_descriptions_read_as_no_record() {
        assert_eq!(DiskMeta::decode(""), None);
        assert_eq!(DiskMeta::decode("database volume"), None);
        assert_eq!(DiskMeta::decode(r#"{"vmName": "worker-1"}"#), None);
    }

    #[test]
    fn successor_keeps_creation_time_and_monotonic_updates() {
        let t0 = Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap();
        let t1 = Utc.with_ymd_and_hms(2024, 5, 2, 12, 0, 0).unwrap();
        let first = DiskMeta::successor(None, "worker-1", "sdb", t0);
        assert_eq!(first.created_at, t0);
        assert_eq!(first.updated_at, t0);

        let second = DiskMeta::successor(Some(&first), "worker-2", "sdc", t1);
        assert_eq!(second.created_at, t0);
        assert_eq!(second.updated_at, t1);

        // A clock that went backwards does not rewind the update time.
        let third = DiskMeta::successor(Some(&second), "", "", t0);
        assert_eq!(third.created_at, t0);
        assert_eq!(third.updated_at, t1);
        assert!(third.is_cleared());
    }

    #[tokio::test]
    async fn set_meta_binds_and_is_idempotent() {
        let log = test_log("set_meta_binds_and_is_idempotent");
        let world = World::new();
        let disk = world.vdc.add_disk("data1", 1 << 30);
        let device = world.attach(&disk).await;

        let cx = world.context(&log);
        let (disk, device) = cx.set_meta(disk, device).await.unwrap();
        let meta = DiskMeta::of(&disk).unwrap();
        assert!(meta.binds(NODE, &device.name));
        assert!(disk.is_attached_to(NODE));
        assert!(world.host.has_device(&device.name));

        world.vdc.clear_calls();
        world.host.clear_calls();
        let (again, same) = cx.set_meta(disk.clone(), device.clone()).await.unwrap();
        assert_eq!(again, disk);
        assert_eq!(same, device);
        assert!(world.vdc.calls().iter().all(|c| !c.is_mutation()));
        assert!(world.host.calls().is_empty());
    }

    #[tokio::test]
    async fn set_meta_follows_a_renamed_device() {
        let log = test_log("set_meta_follows_a_renamed_device");
        let world = World::new();
        let disk = world.vdc.add_disk("data1", 1 << 30);
        let device = world.attach(&disk).await;
        world.rename_on_reattach(1);

        let cx = world.context(&log);
        let (disk, bound) = cx.set_meta(disk, device.clone()).await.unwrap();
        assert_ne!(bound.name, device.name);
        assert!(world.host.has_device(&bound.name));
        assert!(disk.is_attached_to(NODE));
        assert_eq!(world.vdc.disk("data1").unwrap(), disk);
        assert!(DiskMeta::of(&disk).unwrap().binds(NODE, &bound.name));

        let detaches = world
            .vdc
            .calls()
            .into_iter()
            .filter(|c| matches!(c, CloudCall::Detach { .. }))
            .count();
        assert_eq!(detaches, 2);
    }

    #[tokio::test]
    async fn set_meta_gives_up_on_endless_renames() {
        let log = test_log("set_meta_gives_up_on_endless_renames");
        let world = World::new();
        let disk = world.vdc.add_disk("data1", 1 << 30);
        let device = world.attach(&disk).await;
        world.rename_on_reattach(usize::MAX);

        let err =
            world.context(&log).set_meta(disk, device).await.unwrap_err();
        assert!(
            matches!(
                err,
                Error::MetaConvergenceFailed { rounds: MAX_META_ROUNDS, .. }
            ),
            "{err}"
        );
    }

    #[tokio::test]
    async fn set_meta_tolerates_missing_stale_node() {
        let log = test_log("set_meta_tolerates_missing_stale_node");
        let world = World::new();
        let disk = world.vdc.add_disk("data1", 1 << 30);
        let device = world.attach(&disk).await;

        let (_, bound) =
            world.context(&log).set_meta(disk, device.clone()).await.unwrap();
        assert_eq!(bound.name, device.name);
        // Detaching already took the node away, so removal found nothing.
        assert!(world.host.calls().contains(&HostCall::RemoveScsiDevice {
            name: device.name.clone()
        }));
    }

    #[tokio::test]
    async fn clear_meta_skips_blank_records() {
        let log = test_log("clear_meta_skips_blank_records");
        let world = World::new();
        let disk = world.vdc.add_disk("data1", 1 << 30);
        let cx = world.context(&log);

        let cleared = cx.clear_meta(&disk).await.unwrap();
        assert_eq!(cleared, disk);
        assert!(world.vdc.calls().is_empty());

        let at = Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap();
        let bound = DiskMeta::successor(None, NODE, "sdb", at);
        world.vdc.set_description("data1", &bound.encode().unwrap());
        let disk = world.vdc.disk("data1").unwrap();
        let cleared = cx.clear_meta(&disk).await.unwrap();
        let meta = DiskMeta::of(&cleared).unwrap();
        assert!(meta.is_cleared());
        assert_eq!(meta.created_at, at);
    }
}
