// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Filesystem types and mount modes understood by this crate.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Longest filesystem label ext4 accepts, in bytes.
pub const EXT4_LABEL_MAX_LEN: usize = 16;

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
#[error("unsupported filesystem type {0:?}; only ext4 is supported")]
pub struct UnsupportedFsType(pub String);

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
#[error("invalid mount mode {0:?}; expected \"rw\" or \"ro\"")]
pub struct InvalidMountMode(pub String);

#[derive(
    Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum FsType {
    #[default]
    Ext4,
}

impl FsType {
    pub fn as_str(&self) -> &'static str {
        match self {
            FsType::Ext4 => "ext4",
        }
    }

    pub fn max_label_len(&self) -> usize {
        match self {
            FsType::Ext4 => EXT4_LABEL_MAX_LEN,
        }
    }
}

impl fmt::Display for FsType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for FsType {
    type Err = UnsupportedFsType;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "ext4" => Ok(FsType::Ext4),
            _ => Err(UnsupportedFsType(s.to_string())),
        }
    }
}

#[derive(
    Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize,
)]
pub enum MountMode {
    #[default]
    #[serde(rename = "rw")]
    ReadWrite,
    #[serde(rename = "ro")]
    ReadOnly,
}

impl MountMode {
    /// The option passed to `mount -o`.
    pub fn as_option(&self) -> &'static str {
        match self {
            MountMode::ReadWrite => "rw",
            MountMode::ReadOnly => "ro",
        }
    }
}

impl fmt::Display for MountMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_option())
    }
}

impl FromStr for MountMode {
    type Err = InvalidMountMode;

    /// An empty string means read-write.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "" | "rw" => Ok(MountMode::ReadWrite),
            "ro" => Ok(MountMode::ReadOnly),
            _ => Err(InvalidMountMode(s.to_string())),
        }
    }
}
