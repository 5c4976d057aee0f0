// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use serde::{Deserialize, Serialize};

/// A VM inside a vApp.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct VAppVm {
    pub name: String,
    pub href: String,
}

/// The VM an independent disk is attached to.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AttachedVm {
    pub id: String,
    pub name: String,
    pub href: String,
}

impl From<&AttachedVm> for VAppVm {
    fn from(vm: &AttachedVm) -> Self {
        VAppVm { name: vm.name.clone(), href: vm.href.clone() }
    }
}

/// An independent disk.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Disk {
    /// Composite identifier, e.g. `urn:vcloud:disk:<uuid>`.
    pub id: String,
    pub name: String,
    pub href: String,
    pub size_bytes: u64,
    pub description: String,
    pub attached_vm: Option<AttachedVm>,
}

impl Disk {
    /// The last `:`-separated segment of the disk id.
    pub fn id_suffix(&self) -> &str {
        self.id.rsplit(':').next().unwrap_or(&self.id)
    }

    pub fn is_attached_to(&self, vm_name: &str) -> bool {
        self.attached_vm.as_ref().is_some_and(|vm| vm.name == vm_name)
    }
}
