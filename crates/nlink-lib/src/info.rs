//! Device information snapshot and directory listing entries, as produced by
//! a protocol engine.

use std::fmt;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Version {
    pub major: u8,
    pub minor: u8,
    pub patch: u8,
    pub build: u16,
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}.{}.{}.{}",
            self.major, self.minor, self.patch, self.build
        )
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Lcd {
    pub width: u16,
    pub height: u16,
    pub bpp: u8,
    pub sample_mode: u8,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum HardwareType {
    Cas,
    NonCas,
    CasCx,
    NonCasCx,
    Unknown(u8),
}

/// What the calculator is currently running.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RunLevel {
    Recovery,
    Os,
    Unknown(u8),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Battery {
    Powered,
    Low,
    Ok,
    Unknown(u8),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Info {
    pub free_storage: u64,
    pub total_storage: u64,
    pub free_ram: u64,
    pub total_ram: u64,
    pub version: Version,
    pub boot1_version: Version,
    pub boot2_version: Version,
    pub hw_type: HardwareType,
    /// MHz.
    pub clock_speed: u8,
    pub lcd: Lcd,
    pub os_extension: String,
    pub file_extension: String,
    pub name: String,
    pub id: String,
    pub run_level: RunLevel,
    pub battery: Battery,
    pub is_charging: bool,
}

impl Info {
    pub fn used_storage(&self) -> u64 {
        self.total_storage.saturating_sub(self.free_storage)
    }
}

/// One entry of a directory listing.
///
/// `path` is the entry's name relative to the listed directory.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileInfo {
    pub path: String,
    pub is_dir: bool,
    /// Modification time, seconds since the Unix epoch.
    pub date: u64,
    pub size: u64,
}

impl FileInfo {
    pub fn file(path: impl Into<String>, size: u64) -> Self {
        Self {
            path: path.into(),
            is_dir: false,
            date: 0,
            size,
        }
    }

    pub fn dir(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            is_dir: true,
            date: 0,
            size: 0,
        }
    }

    /// Copy of this entry with its path prefixed by `parent`.
    pub fn under(&self, parent: &str) -> Self {
        Self {
            path: format!("{parent}/{}", self.path),
            ..self.clone()
        }
    }
}
