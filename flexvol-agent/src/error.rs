// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use crate::lock::LockError;
use blockdev_utils::fs::{InvalidMountMode, UnsupportedFsType};
use blockdev_utils::host;

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("{0}")]
    Validation(String),

    #[error(transparent)]
    UnsupportedFsType(#[from] UnsupportedFsType),

    #[error(transparent)]
    InvalidMountMode(#[from] InvalidMountMode),

    #[error("invalid mount options: {0}")]
    MountOptions(#[source] serde_json::Error),

    #[error(
        "invalid size {0:?}: expected a number of bytes, optionally with \
         an 'm' or 'g' suffix"
    )]
    InvalidSize(String),

    #[error("disk id {0:?} does not end in a UUID")]
    InvalidDiskUuid(String),

    #[error("disk {disk} is already attached to this node as /dev/{device}")]
    AlreadyAttached { disk: String, device: String },

    #[error("no new block device appeared after attaching the disk")]
    NoNewDeviceFound,

    #[error(
        "more than one block device appeared after attaching the disk: {}",
        .devices.join(", ")
    )]
    AmbiguousNewDevice { devices: Vec<String> },

    #[error(
        "device of disk {disk} kept changing; gave up after {rounds} \
         detach and reattach rounds"
    )]
    MetaConvergenceFailed { disk: String, rounds: usize },

    #[error("cannot tell which disk is mounted at {mount_dir}: {reason}")]
    VolumeNotResolved { mount_dir: String, reason: String },

    #[error("failed to encode disk metadata: {0}")]
    EncodeMeta(#[source] serde_json::Error),

    #[error("{step}: {err}")]
    Cloud {
        step: &'static str,
        #[source]
        err: vcd_client::Error,
    },

    #[error("{step}: {err}")]
    Host {
        step: &'static str,
        #[source]
        err: host::Error,
    },

    #[error(transparent)]
    Lock(#[from] LockError),
}

impl Error {
    /// Wraps a cloud failure with the step that hit it.
    pub(crate) fn cloud(
        step: &'static str,
    ) -> impl FnOnce(vcd_client::Error) -> Error {
        move |err| Error::Cloud { step, err }
    }

    /// Wraps a host failure with the step that hit it.
    pub(crate) fn host(step: &'static str) -> impl FnOnce(host::Error) -> Error {
        move |err| Error::Host { step, err }
    }
}
