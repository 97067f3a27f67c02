use crate::config::SyncConfig;
use crate::device::{Device, DeviceList};
use crate::error::Error;
use crate::index::{total_data_size, FileIndex};
use std::path::PathBuf;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use std::time::SystemTime;

/// File name of the manifest persisted on the last device.
pub const SYNC_CONTEXT_FILE_NAME: &str = "sync-context.json";

/// Root aggregate for one run. Owns the flat file and device arenas;
/// fragments refer to devices by index so nothing here is cyclic.
#[derive(Debug)]
pub struct Context {
    pub backup_path: PathBuf,
    /// Maximum number of concurrently active device workers.
    pub output_streams: usize,
    pub file_index: FileIndex,
    pub devices: DeviceList,
    /// Bytes reserved on the last device for the serialized manifest.
    pub sync_context_size: u64,
    /// Cooperative shutdown flag shared with all workers.
    pub exit: Arc<AtomicBool>,
}

impl Context {
    pub fn new(
        backup_path: PathBuf,
        output_streams: usize,
        file_index: FileIndex,
        devices: DeviceList,
    ) -> Self {
        Context {
            backup_path,
            output_streams: output_streams.max(1),
            file_index,
            devices,
            sync_context_size: 0,
            exit: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn from_config(cfg: &SyncConfig, file_index: FileIndex) -> Self {
        let devices = cfg
            .devices
            .iter()
            .map(|d| Device::from_config(d, cfg.padding_percent))
            .collect();
        Context::new(
            cfg.backup_path.clone(),
            cfg.output_streams,
            file_index,
            devices,
        )
    }

    pub fn total_data_size(&self) -> u64 {
        total_data_size(&self.file_index)
    }

    /// Serializes the catalog, normalizing any entry whose metadata cannot
    /// be represented.
    pub fn manifest_json(&mut self, soft_errors: &mut Vec<Error>) -> Result<Vec<u8>, Error> {
        manifest_json(&mut self.file_index, soft_errors)
    }
}

/// Serializes the file index as a JSON array, one record per file with its
/// fragment list. A file whose mod time falls outside the representable
/// range has it normalized to now, the defect is reported, and serialization
/// is retried once.
pub fn manifest_json(index: &mut FileIndex, soft_errors: &mut Vec<Error>) -> Result<Vec<u8>, Error> {
    let mut out = Vec::with_capacity(index.len() * 256);
    out.push(b'[');
    for (i, file) in index.iter_mut().enumerate() {
        let record = match serde_json::to_vec(file) {
            Ok(record) => record,
            Err(err) => {
                soft_errors.push(Error::BadMetadata {
                    path: file.path.clone(),
                    reason: err.to_string(),
                });
                file.mod_time = SystemTime::now();
                serde_json::to_vec(file)?
            }
        };
        if i > 0 {
            out.push(b',');
        }
        out.extend_from_slice(&record);
    }
    out.push(b']');
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::index::{File, FileType};
    use std::time::Duration;

    fn entry(name: &str, mod_time: SystemTime) -> File {
        File {
            name: name.into(),
            path: PathBuf::from("/src").join(name),
            size: 100,
            mode: 0o644,
            mod_time,
            owner: 1000,
            group: 1000,
            file_type: FileType::Regular,
            symlink_target: None,
            sha1: None,
            dest_files: Vec::new(),
        }
    }

    #[test]
    fn test_manifest_round_trips() {
        let mut index = vec![entry("a.txt", SystemTime::now())];
        let mut soft = Vec::new();
        let json = manifest_json(&mut index, &mut soft).unwrap();
        assert!(soft.is_empty());

        let parsed: FileIndex = serde_json::from_slice(&json).unwrap();
        assert_eq!(parsed, index);
    }

    #[test]
    fn test_pre_epoch_mod_time_is_normalized_and_reported() {
        let bad = SystemTime::UNIX_EPOCH - Duration::from_secs(3600);
        let mut index = vec![entry("old.txt", bad)];
        let mut soft = Vec::new();
        let json = manifest_json(&mut index, &mut soft).unwrap();

        assert_eq!(soft.len(), 1);
        assert!(matches!(soft[0], Error::BadMetadata { .. }));
        assert!(index[0].mod_time > SystemTime::UNIX_EPOCH);
        let parsed: FileIndex = serde_json::from_slice(&json).unwrap();
        assert_eq!(parsed[0].name, "old.txt");
    }

    #[test]
    fn test_total_data_size_sums_entries() {
        let ctx = Context::new(
            PathBuf::from("/src"),
            1,
            vec![entry("a", SystemTime::now()), entry("b", SystemTime::now())],
            Vec::new(),
        );
        assert_eq!(ctx.total_data_size(), 200);
    }
}
