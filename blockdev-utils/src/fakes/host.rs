// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use crate::fs::{FsType, MountMode};
use crate::host::{Api, Error};
use crate::lsblk::BlockDevice;
use crate::{mount, scsi, ExecutionError};
use camino::{Utf8Path, Utf8PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use uuid::Uuid;

/// A host operation recorded by the fake.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Call {
    BlockDevices,
    Format { device: String, label: String, uuid: Uuid },
    Mount { device: String, dir: Utf8PathBuf, mode: MountMode },
    Unmount { dir: Utf8PathBuf },
    RemoveScsiDevice { name: String },
}

struct Plugged {
    device: BlockDevice,
    // Identifies the backing storage, so a test can unplug it when the
    // storage is detached.
    backing: Option<String>,
}

#[derive(Default)]
struct State {
    plugged: Vec<Plugged>,
    // Devices whose kernel node was removed while their storage stayed
    // attached.
    removed: Vec<Plugged>,
    calls: Vec<Call>,
    fail_next_format: Option<String>,
    fail_next_remove: bool,
}

/// A fake implementation of [crate::host::Host].
///
/// This struct implements the [crate::host::Api] interface over an in-memory
/// device table instead of the host OS.
#[derive(Default)]
pub struct Host {
    state: Mutex<State>,
}

impl Host {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn with_devices(devices: Vec<BlockDevice>) -> Arc<Self> {
        let host = Self::default();
        for device in devices {
            host.plug(device, None);
        }
        Arc::new(host)
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap()
    }

    /// Makes `device` appear on the host.
    pub fn plug(&self, device: BlockDevice, backing: Option<&str>) {
        let mut state = self.state();
        state.plugged.retain(|p| p.device.name != device.name);
        state
            .plugged
            .push(Plugged { device, backing: backing.map(str::to_string) });
    }

    /// Removes the device backed by `backing`, whether or not its kernel node
    /// is still present, and returns its last known state.
    pub fn unplug_backing(&self, backing: &str) -> Option<BlockDevice> {
        let mut state = self.state();
        let State { plugged, removed, .. } = &mut *state;
        for list in [plugged, removed] {
            if let Some(i) =
                list.iter().position(|p| p.backing.as_deref() == Some(backing))
            {
                return Some(list.remove(i).device);
            }
        }
        None
    }

    pub fn device(&self, name: &str) -> Option<BlockDevice> {
        self.state()
            .plugged
            .iter()
            .find(|p| p.device.name == name)
            .map(|p| p.device.clone())
    }

    pub fn devices(&self) -> Vec<BlockDevice> {
        self.state().plugged.iter().map(|p| p.device.clone()).collect()
    }

    /// Whether `name` is currently a device node on the host.
    pub fn has_device(&self, name: &str) -> bool {
        self.state().plugged.iter().any(|p| p.device.name == name)
    }

    pub fn calls(&self) -> Vec<Call> {
        self.state().calls.clone()
    }

    pub fn clear_calls(&self) {
        self.state().calls.clear();
    }

    /// Makes the next format attempt time out with `stderr`.
    pub fn fail_next_format(&self, stderr: &str) {
        self.state().fail_next_format = Some(stderr.to_string());
    }

    /// Makes the next SCSI device removal fail as if sysfs refused it.
    pub fn fail_next_remove(&self) {
        self.state().fail_next_remove = true;
    }

    /// Unmounts `dir` behind the caller's back, as an operator would.
    pub fn force_unmount(&self, dir: &Utf8Path) -> bool {
        unmount_in(&mut self.state(), dir)
    }
}

fn unmount_in(state: &mut State, dir: &Utf8Path) -> bool {
    fn clear(node: &mut BlockDevice, dir: &Utf8Path) -> bool {
        if node.mount_point.as_deref().map(Utf8Path::new) == Some(dir) {
            node.mount_point = None;
            true
        } else {
            false
        }
    }

    let mut found = false;
    for plugged in state.plugged.iter_mut() {
        found |= clear(&mut plugged.device, dir);
        for child in plugged.device.children.iter_mut() {
            found |= clear(child, dir);
        }
    }
    found
}

fn no_such_device(command: &str, name: &str) -> ExecutionError {
    ExecutionError::ExecutionStart {
        command: format!("{command} /dev/{name}"),
        err: std::io::Error::new(
            std::io::ErrorKind::NotFound,
            format!("/dev/{name}: no such device"),
        ),
    }
}

#[async_trait::async_trait]
impl Api for Host {
    async fn block_devices(&self) -> Result<Vec<BlockDevice>, Error> {
        let mut state = self.state();
        state.calls.push(Call::BlockDevices);
        Ok(state.plugged.iter().map(|p| p.device.clone()).collect())
    }

    async fn format(
        &self,
        device: &BlockDevice,
        fs_type: FsType,
        label: &str,
        uuid: Uuid,
        timeout: Duration,
    ) -> Result<(), Error> {
        let mut state = self.state();
        state.calls.push(Call::Format {
            device: device.name.clone(),
            label: label.to_string(),
            uuid,
        });
        if let Some(stderr) = state.fail_next_format.take() {
            return Err(Error::Format {
                device: device.name.clone(),
                err: ExecutionError::Timeout {
                    command: format!("mkfs.{fs_type} /dev/{}", device.name),
                    timeout,
                    stdout: String::new(),
                    stderr,
                },
            });
        }
        let Some(plugged) =
            state.plugged.iter_mut().find(|p| p.device.name == device.name)
        else {
            return Err(Error::Format {
                device: device.name.clone(),
                err: no_such_device("mkfs", &device.name),
            });
        };
        plugged.device.fs_type = Some(fs_type.to_string());
        plugged.device.label = Some(label.to_string());
        plugged.device.uuid = Some(uuid.to_string());
        plugged.device.children.clear();
        Ok(())
    }

    async fn mount(
        &self,
        device: &BlockDevice,
        dir: &Utf8Path,
        _fs_type: FsType,
        mode: MountMode,
    ) -> Result<(), Error> {
        let mut state = self.state();
        state.calls.push(Call::Mount {
            device: device.name.clone(),
            dir: dir.to_owned(),
            mode,
        });
        let Some(plugged) =
            state.plugged.iter_mut().find(|p| p.device.name == device.name)
        else {
            return Err(Error::Mount {
                device: device.name.clone(),
                dir: dir.to_owned(),
                err: mount::Error::Execution(no_such_device(
                    "mount",
                    &device.name,
                )),
            });
        };
        plugged.device.mount_point = Some(dir.to_string());
        Ok(())
    }

    async fn unmount(&self, dir: &Utf8Path) -> Result<bool, Error> {
        let mut state = self.state();
        state.calls.push(Call::Unmount { dir: dir.to_owned() });
        Ok(unmount_in(&mut state, dir))
    }

    async fn remove_scsi_device(&self, name: &str) -> Result<(), Error> {
        let mut state = self.state();
        state.calls.push(Call::RemoveScsiDevice { name: name.to_string() });
        let path =
            Utf8PathBuf::from(format!("/sys/block/{name}/device/delete"));
        if std::mem::take(&mut state.fail_next_remove) {
            return Err(Error::RemoveDevice {
                device: name.to_string(),
                err: scsi::Error::Io {
                    path,
                    err: std::io::Error::from(
                        std::io::ErrorKind::PermissionDenied,
                    ),
                },
            });
        }
        let Some(i) = state.plugged.iter().position(|p| p.device.name == name)
        else {
            return Err(Error::RemoveDevice {
                device: name.to_string(),
                err: scsi::Error::Io {
                    path,
                    err: std::io::Error::from(std::io::ErrorKind::NotFound),
                },
            });
        };
        let plugged = state.plugged.remove(i);
        if plugged.backing.is_some() {
            state.removed.push(plugged);
        }
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[tokio::test]
    async fn removed_device_can_still_be_unplugged_by_backing() {
        let host = Host::new();
        host.plug(BlockDevice::new("sdb"), Some("disk-1"));
        host.remove_scsi_device("sdb").await.unwrap();
        assert!(!host.has_device("sdb"));
        assert!(host.block_devices().await.unwrap().is_empty());

        let device = host.unplug_backing("disk-1").unwrap();
        assert_eq!(device.name, "sdb");
        assert!(host.unplug_backing("disk-1").is_none());
    }

    #[tokio::test]
    async fn injected_removal_failure_fires_once() {
        let host = Host::with_devices(vec![BlockDevice::new("sdb")]);
        host.fail_next_remove();
        let err = host.remove_scsi_device("sdb").await.unwrap_err();
        assert!(matches!(err, Error::RemoveDevice { .. }), "{err}");
        assert!(host.has_device("sdb"));
        host.remove_scsi_device("sdb").await.unwrap();
        assert!(!host.has_device("sdb"));
    }

    #[tokio::test]
    async fn mount_and_unmount_track_mount_points() {
        let host = Host::with_devices(vec![BlockDevice::new("sdb")]);
        let dir = Utf8Path::new("/mnt/data1");
        let sdb = host.device("sdb").unwrap();
        host.format(
            &sdb,
            FsType::Ext4,
            "data1",
            Uuid::new_v4(),
            Duration::from_secs(1),
        )
        .await
        .unwrap();
        host.mount(&sdb, dir, FsType::Ext4, MountMode::ReadWrite)
            .await
            .unwrap();
        assert!(host.device("sdb").unwrap().is_mounted_with_label("data1"));

        assert!(host.unmount(dir).await.unwrap());
        assert!(!host.unmount(dir).await.unwrap());
        assert!(!host.device("sdb").unwrap().is_mounted());
    }

    #[tokio::test]
    async fn injected_format_failure_is_a_timeout() {
        let host = Host::with_devices(vec![BlockDevice::new("sdb")]);
        host.fail_next_format("mkfs hung");
        let sdb = host.device("sdb").unwrap();
        let err = host
            .format(
                &sdb,
                FsType::Ext4,
                "data1",
                Uuid::new_v4(),
                Duration::from_secs(60),
            )
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            Error::Format { err: ExecutionError::Timeout { .. }, .. }
        ));
        assert!(!host.device("sdb").unwrap().is_formatted());
    }
}
