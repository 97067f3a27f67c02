use crate::config::DeviceConfig;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Block size charged to the planner for directory and symlink entries.
/// Recreating a directory on an EXT4 destination allocates one block even
/// when the source filesystem reports a larger size for it.
pub const BLOCK_SIZE: u64 = 4096;

/// Capacity contract for one removable device in the pool.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Device {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub uuid: Option<String>,
    /// Only valid while the device is mounted.
    pub mount_point: PathBuf,
    pub size_total: u64,
    #[serde(default)]
    pub size_writn: u64,
    pub padding_percent: f64,
}

pub type DeviceList = Vec<Device>;

impl Device {
    pub fn from_config(cfg: &DeviceConfig, padding_percent: f64) -> Self {
        Device {
            name: cfg.name.clone(),
            uuid: cfg.uuid.clone(),
            mount_point: cfg.mount_point.clone(),
            size_total: cfg.size,
            size_writn: 0,
            padding_percent,
        }
    }

    /// Bytes withheld from the planner to absorb filesystem overhead.
    pub fn padding(&self) -> u64 {
        (self.size_total as f64 * self.padding_percent).ceil() as u64
    }

    pub fn usable(&self) -> u64 {
        self.size_total.saturating_sub(self.padding())
    }

    /// Capacity still available to the planner.
    pub fn remaining(&self) -> u64 {
        self.usable().saturating_sub(self.size_writn)
    }

    pub(crate) fn accept(&mut self, bytes: u64) {
        self.size_writn += bytes;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn device(size_total: u64) -> Device {
        Device {
            name: "Test Device".into(),
            uuid: None,
            mount_point: PathBuf::from("/mnt/test"),
            size_total,
            size_writn: 0,
            padding_percent: 0.01,
        }
    }

    #[test]
    fn test_padding_rounds_up() {
        let d = device(9_999_999);
        assert_eq!(d.padding(), 100_000);
        assert_eq!(d.usable(), 9_899_999);
    }

    #[test]
    fn test_remaining_tracks_accepted_bytes() {
        let mut d = device(1_000_000);
        assert_eq!(d.remaining(), 990_000);
        d.accept(990_000);
        assert_eq!(d.remaining(), 0);
        d.accept(1);
        assert_eq!(d.remaining(), 0);
    }
}
