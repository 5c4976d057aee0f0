// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Interface for making API requests to a cloud director organization VDC:
//! finding vApp VMs and managing independent disks.

use std::sync::Arc;

mod client;
mod task;
pub mod types;

#[cfg(any(test, feature = "testing"))]
pub mod fakes;

pub use client::{Client, ClientConnector, Config};
pub use types::{AttachedVm, Disk, VAppVm};

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("{kind} {name:?} not found")]
    NotFound { kind: &'static str, name: String },

    #[error("found {count} {kind}s named {name:?}")]
    Duplicate { kind: &'static str, name: String, count: usize },

    #[error("invalid API endpoint {endpoint:?}: {message}")]
    Endpoint { endpoint: String, message: String },

    #[error("invalid href {0:?}")]
    InvalidHref(String),

    #[error("login failed: {0}")]
    Login(String),

    #[error("request to {url} failed: {err}")]
    Http {
        url: String,
        #[source]
        err: reqwest::Error,
    },

    #[error("task {href} finished with status {status}: {message}")]
    Task { href: String, status: String, message: String },

    #[error("task {href} did not finish within {timeout:?}")]
    TaskTimeout { href: String, timeout: std::time::Duration },

    #[error("unexpected response from {url}: {message}")]
    Protocol { url: String, message: String },
}

impl Error {
    pub fn is_not_found(&self) -> bool {
        matches!(self, Error::NotFound { .. })
    }
}

/// Operations against one organization VDC.
///
/// Every mutating operation returns only once the cloud has finished the
/// work it started.
#[async_trait::async_trait]
pub trait Api: Send + Sync {
    async fn find_vm(&self, vapp: &str, vm_name: &str) -> Result<VAppVm, Error>;

    /// Looks up a disk by its name, which must be unique in the VDC.
    async fn find_disk_by_name(&self, name: &str) -> Result<Disk, Error>;

    async fn create_disk(&self, name: &str, size_bytes: u64)
        -> Result<Disk, Error>;

    async fn attach_disk(&self, vm: &VAppVm, disk: &Disk) -> Result<(), Error>;

    async fn detach_disk(&self, vm: &VAppVm, disk: &Disk) -> Result<(), Error>;

    /// Replaces the disk's description, leaving its name and size alone.
    async fn set_disk_description(
        &self,
        disk: &Disk,
        description: &str,
    ) -> Result<(), Error>;
}

/// Opens an authenticated session against the cloud.
#[async_trait::async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self) -> Result<Arc<dyn Api>, Error>;
}
