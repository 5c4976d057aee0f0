// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use crate::types::{AttachedVm, Disk, VAppVm};
use crate::{Api, Connector, Error};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use uuid::Uuid;

const BASE: &str = "https://vcd.test/api";

/// A cloud operation recorded by the fake.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Call {
    FindVm { vapp: String, name: String },
    FindDisk { name: String },
    CreateDisk { name: String, size_bytes: u64 },
    Attach { disk: String, vm: String },
    Detach { disk: String, vm: String },
    SetDescription { disk: String, description: String },
}

impl Call {
    pub fn is_mutation(&self) -> bool {
        !matches!(self, Call::FindVm { .. } | Call::FindDisk { .. })
    }
}

/// Which operation an injected failure applies to.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum Op {
    Attach,
    Detach,
    SetDescription,
    CreateDisk,
}

/// Runs after the fake changes a disk's attachment, with the disk as it was
/// at that moment and the VM involved.
pub type Hook = Box<dyn Fn(&Disk, &VAppVm) + Send + Sync>;

#[derive(Default)]
struct State {
    vms: Vec<(String, VAppVm)>,
    disks: BTreeMap<String, Disk>,
    calls: Vec<Call>,
    failures: BTreeMap<Op, String>,
}

/// A fake organization VDC.
///
/// This struct implements the [crate::Api] interface over in-memory disks
/// and VMs, and [crate::Connector] by handing out itself.
#[derive(Default)]
pub struct Vdc {
    state: Mutex<State>,
    on_attach: Mutex<Vec<Hook>>,
    on_detach: Mutex<Vec<Hook>>,
    connects: AtomicUsize,
}

impl Vdc {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap()
    }

    pub fn add_vm(&self, vapp: &str, name: &str) -> VAppVm {
        let vm = VAppVm {
            name: name.to_string(),
            href: format!("{BASE}/vApp/vm-{}", Uuid::new_v4()),
        };
        self.state().vms.push((vapp.to_string(), vm.clone()));
        vm
    }

    /// Adds a detached disk without going through [Api::create_disk].
    pub fn add_disk(&self, name: &str, size_bytes: u64) -> Disk {
        let disk = new_disk(name, size_bytes);
        self.state().disks.insert(disk.id.clone(), disk.clone());
        disk
    }

    /// Returns the disk named `name`, if exactly one exists.
    pub fn disk(&self, name: &str) -> Option<Disk> {
        let state = self.state();
        let mut found = state.disks.values().filter(|d| d.name == name);
        match (found.next(), found.next()) {
            (Some(disk), None) => Some(disk.clone()),
            _ => None,
        }
    }

    /// Records `vm` as holding the disk without running any hooks.
    pub fn set_attachment(&self, disk_name: &str, vm: Option<&VAppVm>) {
        let mut state = self.state();
        for disk in state.disks.values_mut().filter(|d| d.name == disk_name) {
            disk.attached_vm = vm.map(attached);
        }
    }

    pub fn set_description(&self, disk_name: &str, description: &str) {
        let mut state = self.state();
        for disk in state.disks.values_mut().filter(|d| d.name == disk_name) {
            disk.description = description.to_string();
        }
    }

    pub fn calls(&self) -> Vec<Call> {
        self.state().calls.clone()
    }

    pub fn clear_calls(&self) {
        self.state().calls.clear();
    }

    pub fn connect_count(&self) -> usize {
        self.connects.load(Ordering::SeqCst)
    }

    /// Makes the next `op` fail with a task error carrying `message`.
    pub fn fail_next(&self, op: Op, message: &str) {
        self.state().failures.insert(op, message.to_string());
    }

    pub fn on_attach(&self, hook: Hook) {
        self.on_attach.lock().unwrap().push(hook);
    }

    pub fn on_detach(&self, hook: Hook) {
        self.on_detach.lock().unwrap().push(hook);
    }

    fn run_hooks(hooks: &Mutex<Vec<Hook>>, disk: &Disk, vm: &VAppVm) {
        for hook in hooks.lock().unwrap().iter() {
            hook(disk, vm);
        }
    }
}

fn new_disk(name: &str, size_bytes: u64) -> Disk {
    let uuid = Uuid::new_v4();
    Disk {
        id: format!("urn:vcloud:disk:{uuid}"),
        name: name.to_string(),
        href: format!("{BASE}/disk/{uuid}"),
        size_bytes,
        description: String::new(),
        attached_vm: None,
    }
}

fn attached(vm: &VAppVm) -> AttachedVm {
    AttachedVm {
        id: format!("urn:vcloud:vm:{}", vm.name),
        name: vm.name.clone(),
        href: vm.href.clone(),
    }
}

fn task_error(op: Op, message: String) -> Error {
    Error::Task {
        href: format!("{BASE}/task/{op:?}"),
        status: "error".to_string(),
        message,
    }
}

#[async_trait::async_trait]
impl Api for Vdc {
    async fn find_vm(&self, vapp: &str, vm_name: &str) -> Result<VAppVm, Error> {
        let mut state = self.state();
        state.calls.push(Call::FindVm {
            vapp: vapp.to_string(),
            name: vm_name.to_string(),
        });
        state
            .vms
            .iter()
            .find(|(a, vm)| a == vapp && vm.name == vm_name)
            .map(|(_, vm)| vm.clone())
            .ok_or_else(|| Error::NotFound {
                kind: "vm",
                name: vm_name.to_string(),
            })
    }

    async fn find_disk_by_name(&self, name: &str) -> Result<Disk, Error> {
        let mut state = self.state();
        state.calls.push(Call::FindDisk { name: name.to_string() });
        let found: Vec<&Disk> =
            state.disks.values().filter(|d| d.name == name).collect();
        match found.as_slice() {
            [] => Err(Error::NotFound { kind: "disk", name: name.to_string() }),
            [disk] => Ok((*disk).clone()),
            many => Err(Error::Duplicate {
                kind: "disk",
                name: name.to_string(),
                count: many.len(),
            }),
        }
    }

    async fn create_disk(
        &self,
        name: &str,
        size_bytes: u64,
    ) -> Result<Disk, Error> {
        let mut state = self.state();
        state.calls.push(Call::CreateDisk {
            name: name.to_string(),
            size_bytes,
        });
        if let Some(message) = state.failures.remove(&Op::CreateDisk) {
            return Err(task_error(Op::CreateDisk, message));
        }
        let disk = new_disk(name, size_bytes);
        state.disks.insert(disk.id.clone(), disk.clone());
        Ok(disk)
    }

    async fn attach_disk(&self, vm: &VAppVm, disk: &Disk) -> Result<(), Error> {
        let updated = {
            let mut state = self.state();
            state.calls.push(Call::Attach {
                disk: disk.name.clone(),
                vm: vm.name.clone(),
            });
            if let Some(message) = state.failures.remove(&Op::Attach) {
                return Err(task_error(Op::Attach, message));
            }
            let Some(stored) = state.disks.get_mut(&disk.id) else {
                return Err(Error::NotFound {
                    kind: "disk",
                    name: disk.name.clone(),
                });
            };
            if let Some(holder) = &stored.attached_vm {
                return Err(task_error(
                    Op::Attach,
                    format!("disk {} is attached to {}", disk.name, holder.name),
                ));
            }
            stored.attached_vm = Some(attached(vm));
            stored.clone()
        };
        Self::run_hooks(&self.on_attach, &updated, vm);
        Ok(())
    }

    async fn detach_disk(&self, vm: &VAppVm, disk: &Disk) -> Result<(), Error> {
        let updated = {
            let mut state = self.state();
            state.calls.push(Call::Detach {
                disk: disk.name.clone(),
                vm: vm.name.clone(),
            });
            if let Some(message) = state.failures.remove(&Op::Detach) {
                return Err(task_error(Op::Detach, message));
            }
            let Some(stored) = state.disks.get_mut(&disk.id) else {
                return Err(Error::NotFound {
                    kind: "disk",
                    name: disk.name.clone(),
                });
            };
            if !stored.is_attached_to(&vm.name) {
                return Err(task_error(
                    Op::Detach,
                    format!("disk {} is not attached to {}", disk.name, vm.name),
                ));
            }
            stored.attached_vm = None;
            stored.clone()
        };
        Self::run_hooks(&self.on_detach, &updated, vm);
        Ok(())
    }

    async fn set_disk_description(
        &self,
        disk: &Disk,
        description: &str,
    ) -> Result<(), Error> {
        let mut state = self.state();
        state.calls.push(Call::SetDescription {
            disk: disk.name.clone(),
            description: description.to_string(),
        });
        if let Some(message) = state.failures.remove(&Op::SetDescription) {
            return Err(task_error(Op::SetDescription, message));
        }
        let Some(stored) = state.disks.get_mut(&disk.id) else {
            return Err(Error::NotFound { kind: "disk", name: disk.name.clone() });
        };
        stored.description = description.to_string();
        Ok(())
    }
}

/// Hands out the same fake VDC on every connect.
pub struct VdcConnector(pub Arc<Vdc>);

#[async_trait::async_trait]
impl Connector for VdcConnector {
    async fn connect(&self) -> Result<Arc<dyn Api>, Error> {
        self.0.connects.fetch_add(1, Ordering::SeqCst);
        Ok(self.0.clone())
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[tokio::test]
    async fn attach_runs_hooks_and_rejects_double_attach() {
        let vdc = Vdc::new();
        let vm1 = vdc.add_vm("cluster", "worker-1");
        let vm2 = vdc.add_vm("cluster", "worker-2");
        let disk = vdc.add_disk("data1", 1 << 30);

        let seen = Arc::new(Mutex::new(Vec::new()));
        let hook_seen = seen.clone();
        vdc.on_attach(Box::new(move |disk, vm| {
            hook_seen.lock().unwrap().push((disk.name.clone(), vm.name.clone()));
        }));

        vdc.attach_disk(&vm1, &disk).await.unwrap();
        assert!(vdc.disk("data1").unwrap().is_attached_to("worker-1"));
        assert_eq!(
            *seen.lock().unwrap(),
            vec![("data1".to_string(), "worker-1".to_string())]
        );

        let err = vdc.attach_disk(&vm2, &disk).await.unwrap_err();
        assert!(matches!(err, Error::Task { .. }), "{err}");
        let err = vdc.detach_disk(&vm2, &disk).await.unwrap_err();
        assert!(matches!(err, Error::Task { .. }), "{err}");
        vdc.detach_disk(&vm1, &disk).await.unwrap();
        assert_eq!(vdc.disk("data1").unwrap().attached_vm, None);
    }

    #[tokio::test]
    async fn duplicate_names_are_reported() {
        let vdc = Vdc::new();
        vdc.add_disk("data1", 1 << 30);
        vdc.add_disk("data1", 1 << 30);
        let err = vdc.find_disk_by_name("data1").await.unwrap_err();
        assert!(matches!(err, Error::Duplicate { count: 2, .. }), "{err}");
        let err = vdc.find_disk_by_name("data2").await.unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn injected_failure_fires_once() {
        let vdc = Vdc::new();
        let disk = vdc.add_disk("data1", 1 << 30);
        vdc.fail_next(Op::SetDescription, "busy");
        assert!(vdc.set_disk_description(&disk, "x").await.is_err());
        vdc.set_disk_description(&disk, "x").await.unwrap();
        assert_eq!(vdc.disk("data1").unwrap().description, "x");
    }
}
