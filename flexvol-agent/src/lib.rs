// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! A FlexVolume node plugin that backs Kubernetes volumes with cloud
//! director independent disks.
//!
//! Each kubelet callout is one short-lived process. Mount finds or creates
//! the volume's disk, attaches it to this node's VM, formats it if it is
//! blank, records the binding in the disk's description and mounts it.
//! Unmount reverses that. Invocations on a node are serialized by a lock
//! file.

pub mod agent;
pub mod config;
pub mod dispatch;
mod error;
pub mod lock;
pub mod logging;
mod meta;
mod mount;
pub mod operation;
mod reconcile;
pub mod size;
#[cfg(test)]
mod testing;
mod unmount;

pub use agent::Agent;
pub use error::Error;
pub use meta::DiskMeta;
pub use operation::{ExecResult, Request};
