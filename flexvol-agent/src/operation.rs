// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Requests the kubelet makes of the driver, and the replies it expects.

use crate::Error;
use serde::{Deserialize, Serialize};

/// One driver invocation.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Request {
    Init,
    Mount(MountRequest),
    Unmount(UnmountRequest),
    /// Any callout this driver does not implement, by name.
    NotSupported(String),
}

impl Request {
    /// Whether serving the request touches disks, and therefore needs the
    /// configuration, the cloud and the invocation lock.
    pub fn touches_disks(&self) -> bool {
        matches!(self, Request::Mount(_) | Request::Unmount(_))
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MountRequest {
    pub mount_dir: String,
    pub options: MountOptions,
}

impl MountRequest {
    pub fn from_json(mount_dir: &str, options: &str) -> Result<Self, Error> {
        let options =
            serde_json::from_str(options).map_err(Error::MountOptions)?;
        Ok(MountRequest { mount_dir: mount_dir.to_string(), options })
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct UnmountRequest {
    pub mount_dir: String,
}

/// The JSON options the kubelet passes to mount.
///
/// Keys may carry the `kubernetes.io/` prefix or not. Unknown keys, such as
/// the pod and service account details the kubelet adds, are ignored.
#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize)]
pub struct MountOptions {
    #[serde(rename = "kubernetes.io/fsType", alias = "fsType", default)]
    pub fs_type: String,
    #[serde(rename = "kubernetes.io/readwrite", alias = "readwrite", default)]
    pub readwrite: String,
    /// Accepted for completeness; the kubelet applies group ownership itself.
    #[serde(rename = "kubernetes.io/fsGroup", alias = "fsGroup", default)]
    pub fs_group: String,
    #[serde(
        rename = "kubernetes.io/pvOrVolumeName",
        alias = "pvOrVolumeName",
        default
    )]
    pub volume_name: String,
    #[serde(rename = "diskInitialSize", default)]
    pub disk_initial_size: String,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Deserialize, Serialize)]
pub enum ExecStatus {
    Success,
    Failure,
    #[serde(rename = "Not supported")]
    NotSupported,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Deserialize, Serialize)]
pub struct Capabilities {
    pub attach: bool,
}

/// What a disk is bound to after a mount or unmount.
#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct VolumeBinding {
    pub disk_id: String,
    pub disk_name: String,
    pub device_name: String,
    pub mount_point: String,
}

/// The single JSON object printed on stdout for every invocation.
#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize)]
pub struct ExecResult {
    pub status: ExecStatus,
    #[serde(default)]
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub capabilities: Option<Capabilities>,
}

impl ExecResult {
    pub fn init() -> Self {
        ExecResult {
            status: ExecStatus::Success,
            message: String::new(),
            capabilities: Some(Capabilities { attach: false }),
        }
    }

    pub fn success(message: impl Into<String>) -> Self {
        ExecResult {
            status: ExecStatus::Success,
            message: message.into(),
            capabilities: None,
        }
    }

    pub fn bound(binding: &VolumeBinding) -> Self {
        // Serializing a struct of strings cannot fail.
        let message = serde_json::to_string(binding).unwrap_or_default();
        Self::success(message)
    }

    pub fn failure(err: &dyn std::fmt::Display) -> Self {
        let message = serde_json::json!({ "error": err.to_string() });
        ExecResult {
            status: ExecStatus::Failure,
            message: message.to_string(),
            capabilities: None,
        }
    }

    pub fn not_supported() -> Self {
        ExecResult {
            status: ExecStatus::NotSupported,
            message: String::new(),
            capabilities: None,
        }
    }

    /// The process exit code for this result.
    pub fn exit_code(&self) -> i32 {
        match self.status {
            ExecStatus::Success | ExecStatus::NotSupported => 0,
            ExecStatus::Failure => 1,
        }
    }

    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| {
            r#"{"status":"Failure","message":"failed to encode result"}"#
                .to_string()
        })
    }
}
