// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Utilities for listing block devices with `lsblk`.

use crate::{execute_async, ExecutionError, LSBLK};
use camino::{Utf8Path, Utf8PathBuf};
use serde::{Deserialize, Deserializer, Serialize};
use slog::Logger;

/// Columns requested from lsblk, in bytes (`-b`) and as JSON.
const COLUMNS: &str = "NAME,FSTYPE,LABEL,UUID,MOUNTPOINT,SIZE";

/// A block device as reported by lsblk.
///
/// Partitions and other holders appear in `children`.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockDevice {
    pub name: String,
    #[serde(rename = "fstype", default, deserialize_with = "non_empty")]
    pub fs_type: Option<String>,
    #[serde(default, deserialize_with = "non_empty")]
    pub label: Option<String>,
    #[serde(default, deserialize_with = "non_empty")]
    pub uuid: Option<String>,
    #[serde(rename = "mountpoint", default, deserialize_with = "non_empty")]
    pub mount_point: Option<String>,
    #[serde(default, deserialize_with = "size_in_bytes")]
    pub size: Option<u64>,
    #[serde(default, deserialize_with = "null_as_empty")]
    pub children: Vec<BlockDevice>,
}

impl BlockDevice {
    pub fn new(name: impl Into<String>) -> Self {
        BlockDevice { name: name.into(), ..Default::default() }
    }

    pub fn dev_path(&self) -> Utf8PathBuf {
        Utf8PathBuf::from(format!("/dev/{}", self.name))
    }

    /// A device counts as formatted when it carries a filesystem or has been
    /// partitioned.
    pub fn is_formatted(&self) -> bool {
        self.fs_type.is_some() || !self.children.is_empty()
    }

    /// Whether this device or any of its children is mounted anywhere.
    pub fn is_mounted(&self) -> bool {
        self.nodes().any(|node| node.mount_point.is_some())
    }

    /// Returns this device or the child of it that is mounted at `dir`.
    pub fn mounted_at(&self, dir: &Utf8Path) -> Option<&BlockDevice> {
        self.nodes().find(|node| {
            node.mount_point
                .as_deref()
                .is_some_and(|mp| Utf8Path::new(mp) == dir)
        })
    }

    /// Whether this device or any of its children carries `label`.
    pub fn carries_label(&self, label: &str) -> bool {
        self.nodes().any(|node| node.label.as_deref() == Some(label))
    }

    /// Whether a node carrying `label` is currently mounted.
    pub fn is_mounted_with_label(&self, label: &str) -> bool {
        self.nodes().any(|node| {
            node.mount_point.is_some() && node.label.as_deref() == Some(label)
        })
    }

    fn nodes(&self) -> impl Iterator<Item = &BlockDevice> {
        std::iter::once(self).chain(self.children.iter())
    }
}

#[derive(Deserialize)]
struct LsblkOutput {
    #[serde(default, deserialize_with = "null_as_empty")]
    blockdevices: Vec<BlockDevice>,
}

/// Lists the block devices on this host.
pub async fn list(log: &Logger) -> Result<Vec<BlockDevice>, ExecutionError> {
    let mut cmd = tokio::process::Command::new(LSBLK);
    cmd.env("LC_ALL", "C.UTF-8")
        .arg("--json")
        .arg("--bytes")
        .arg("--output")
        .arg(COLUMNS);
    let output = execute_async(log, &mut cmd).await?;
    parse(&output.stdout)
}

pub fn parse(stdout: &[u8]) -> Result<Vec<BlockDevice>, ExecutionError> {
    let parsed: LsblkOutput = serde_json::from_slice(stdout)
        .map_err(|err| ExecutionError::ParseFailure(format!("lsblk: {err}")))?;
    Ok(parsed.blockdevices)
}

pub fn find_by_name<'a>(
    devices: &'a [BlockDevice],
    name: &str,
) -> Option<&'a BlockDevice> {
    devices.iter().find(|dev| dev.name == name)
}

/// Finds the top-level device that is mounted at `dir`, either directly or
/// through one of its children, along with the node actually mounted there.
pub fn find_by_mount_point<'a>(
    devices: &'a [BlockDevice],
    dir: &Utf8Path,
) -> Option<(&'a BlockDevice, &'a BlockDevice)> {
    devices
        .iter()
        .find_map(|dev| dev.mounted_at(dir).map(|node| (dev, node)))
}

// Older lsblk releases print empty strings where newer ones print null.
fn non_empty<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<String>::deserialize(deserializer)?;
    Ok(value.filter(|s| !s.is_empty()))
}

fn null_as_empty<'de, D>(deserializer: D) -> Result<Vec<BlockDevice>, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(Option::<Vec<BlockDevice>>::deserialize(deserializer)?
        .unwrap_or_default())
}

// SIZE is a number on current util-linux and a string on older releases.
fn size_in_bytes<'de, D>(deserializer: D) -> Result<Option<u64>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Size {
        Number(u64),
        Text(String),
    }

    match Option::<Size>::deserialize(deserializer)? {
        None => Ok(None),
        Some(Size::Number(n)) => Ok(Some(n)),
        Some(Size::Text(s)) if s.is_empty() => Ok(None),
        Some(Size::Text(s)) => {
            s.parse().map(Some).map_err(serde::de::Error::custom)
        }
    }
}
