// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Test helpers: a fake VDC wired to a fake host, so that attaching a disk
//! to this node's VM makes a block device appear.

use crate::agent::{Agent, Context};
use crate::config::{Config, LogConfig};
use crate::reconcile::new_device;
use blockdev_utils::fakes::host::Host as FakeHost;
use blockdev_utils::lsblk::BlockDevice;
use slog::{o, Drain, Logger};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Mutex};
use vcd_client::fakes::vdc::{Vdc, VdcConnector};
use vcd_client::{Disk, VAppVm};

pub(crate) const NODE: &str = "worker-1";
pub(crate) const OTHER_NODE: &str = "worker-2";
pub(crate) const VAPP: &str = "cluster";

pub(crate) fn test_log(name: &str) -> Logger {
    let decorator = slog_term::PlainSyncDecorator::new(slog_term::TestStdoutWriter);
    let drain = slog_term::FullFormat::new(decorator).build().fuse();
    Logger::root(drain, o!("test" => name.to_string()))
}

const CONFIG: &str = r#"
    [vcd]
    api_endpoint = "https://vcd.test/api"
    user = "k8s"
    password = "secret"
    org = "org1"
    vdc = "vdc1"
    vapp = "cluster"
"#;

/// What the fake host remembers about disks while they are detached.
#[derive(Default)]
struct Media {
    // Device name each disk last attached as.
    names: BTreeMap<String, String>,
    ever_used: BTreeSet<String>,
    // Filesystem on each detached disk.
    contents: BTreeMap<String, BlockDevice>,
    renames_remaining: usize,
}

fn candidate_names() -> impl Iterator<Item = String> {
    ('b'..='z')
        .map(|c| format!("sd{c}"))
        .chain(('a'..='z').map(|c| format!("sda{c}")))
}

impl Media {
    fn allocate(&mut self, disk_id: &str, host: &FakeHost) -> String {
        let in_use: BTreeSet<String> =
            host.devices().into_iter().map(|dev| dev.name).collect();
        let sticky = self
            .names
            .get(disk_id)
            .filter(|name| !in_use.contains(*name))
            .cloned();
        let name = match sticky {
            Some(_) if self.renames_remaining > 0 => {
                self.renames_remaining -= 1;
                candidate_names()
                    .find(|n| !in_use.contains(n) && !self.ever_used.contains(n))
            }
            Some(name) => Some(name),
            None => candidate_names().find(|n| !in_use.contains(n)),
        }
        .unwrap_or_else(|| panic!("fake host ran out of device names"));
        self.ever_used.insert(name.clone());
        self.names.insert(disk_id.to_string(), name.clone());
        name
    }

    fn device_for(&mut self, disk: &Disk, name: String) -> BlockDevice {
        let mut device = BlockDevice::new(name);
        device.size = Some(disk.size_bytes);
        if let Some(saved) = self.contents.remove(&disk.id) {
            device.fs_type = saved.fs_type;
            device.label = saved.label;
            device.uuid = saved.uuid;
        }
        device
    }
}

pub(crate) struct World {
    pub vdc: Arc<Vdc>,
    pub host: Arc<FakeHost>,
    pub vm: VAppVm,
    pub other_vm: VAppVm,
    pub config: Config,
    media: Arc<Mutex<Media>>,
}

impl World {
    pub fn new() -> World {
        let vdc = Vdc::new();
        let host = FakeHost::new();
        let vm = vdc.add_vm(VAPP, NODE);
        let other_vm = vdc.add_vm(VAPP, OTHER_NODE);
        let media = Arc::new(Mutex::new(Media::default()));

        let mut config: Config =
            toml::from_str(CONFIG).expect("test config parses");
        config.log = LogConfig { path: None, ..Default::default() };

        let (attach_host, attach_media) = (host.clone(), media.clone());
        vdc.on_attach(Box::new(move |disk, vm| {
            if vm.name != NODE {
                return;
            }
            let mut media = attach_media.lock().unwrap();
            let name = media.allocate(&disk.id, &attach_host);
            let device = media.device_for(disk, name);
            attach_host.plug(device, Some(&disk.id));
        }));
        let (detach_host, detach_media) = (host.clone(), media.clone());
        vdc.on_detach(Box::new(move |disk, vm| {
            if vm.name != NODE {
                return;
            }
            if let Some(device) = detach_host.unplug_backing(&disk.id) {
                detach_media.lock().unwrap().contents.insert(disk.id.clone(), device);
            }
        }));

        World { vdc, host, vm, other_vm, config, media }
    }

    /// Where the kubelet would mount `volume`.
    pub fn mount_dir(volume: &str) -> String {
        format!("/var/lib/kubelet/pods/pod-1/volumes/vcd~flexvol/{volume}")
    }

    /// Makes the next `n` reattachments of a known disk come back under a
    /// device name never used before.
    pub fn rename_on_reattach(&self, n: usize) {
        self.media.lock().unwrap().renames_remaining = n;
    }

    /// Attaches `disk` to this node directly and returns its new device.
    pub async fn attach(&self, disk: &Disk) -> BlockDevice {
        use vcd_client::Api;
        let before = self.host.devices();
        self.vdc.attach_disk(&self.vm, disk).await.unwrap();
        new_device(&before, &self.host.devices()).unwrap()
    }

    pub fn context<'a>(&'a self, log: &'a Logger) -> Context<'a> {
        Context {
            log,
            config: &self.config,
            cloud: self.vdc.as_ref(),
            host: self.host.as_ref(),
            vm: &self.vm,
        }
    }

    pub fn agent(&self, log: &Logger) -> Agent {
        Agent::new(
            log,
            self.config.clone(),
            NODE.to_string(),
            Arc::new(VdcConnector(self.vdc.clone())),
            self.host.clone(),
        )
    }
}
