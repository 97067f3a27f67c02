use crate::device::BLOCK_SIZE;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::SystemTime;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum FileType {
    Regular,
    Directory,
    Symlink,
}

/// A planned fragment of a source file on one device. `device` is a stable
/// index into the context's device list; fragments never own their device.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DestFile {
    pub device: usize,
    /// Absolute path under the device's mount point.
    pub path: PathBuf,
    pub size: u64,
    /// Half-open byte range into the source file. `start_byte == end_byte == 0`
    /// means the whole file.
    pub start_byte: u64,
    pub end_byte: u64,
    /// Digest of this fragment's bytes only.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sha1: Option<String>,
}

impl DestFile {
    pub fn is_whole_file(&self) -> bool {
        self.start_byte == 0 && self.end_byte == 0
    }

    /// Content bytes this fragment contributes.
    pub fn byte_len(&self) -> u64 {
        if self.is_whole_file() {
            self.size
        } else {
            self.end_byte - self.start_byte
        }
    }
}

/// One source-tree entry. Created by the walker; `dest_files` is assigned by
/// the planner and `sha1` is filled in from worker results.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct File {
    pub name: String,
    /// Absolute source path.
    pub path: PathBuf,
    pub size: u64,
    pub mode: u32,
    pub mod_time: SystemTime,
    pub owner: u32,
    pub group: u32,
    pub file_type: FileType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub symlink_target: Option<PathBuf>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sha1: Option<String>,
    #[serde(default)]
    pub dest_files: Vec<DestFile>,
}

pub type FileIndex = Vec<File>;

impl File {
    /// Bytes the planner charges a device for this entry.
    pub fn planned_cost(&self) -> u64 {
        match self.file_type {
            FileType::Regular => self.size,
            FileType::Directory | FileType::Symlink => BLOCK_SIZE,
        }
    }

    pub fn is_split(&self) -> bool {
        self.dest_files.len() > 1
    }
}

pub fn total_data_size(index: &FileIndex) -> u64 {
    index.iter().map(|f| f.size).sum()
}
