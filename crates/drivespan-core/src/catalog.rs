use crate::context::{manifest_json, Context};
use crate::device::DeviceList;
use crate::error::Error;
use crate::index::{DestFile, File, FileIndex, FileType};
use std::path::Path;
use tracing::{debug, info};

/// Assigns every file in the index a non-empty fragment list, greedy
/// first-fit in device order with a split fallback for regular files.
/// Returns the non-fatal errors encountered (bad metadata normalized during
/// the sync-context estimate); plan-level failures abort before anything is
/// written.
///
/// Greedy packing can split a file that a smarter packer would keep whole.
/// The greed buys deterministic plans the operator can reason about.
pub fn plan(ctx: &mut Context, save_sync_context: bool) -> Result<Vec<Error>, Error> {
    let mut soft_errors = Vec::new();

    assign(&ctx.backup_path, &mut ctx.file_index, &mut ctx.devices)?;

    if save_sync_context {
        ctx.sync_context_size = reserve_sync_context(&mut ctx.file_index, &mut ctx.devices, &mut soft_errors)?;
    }

    info!(
        files = ctx.file_index.len(),
        devices = ctx.devices.len(),
        sync_context_size = ctx.sync_context_size,
        "catalog planned"
    );
    Ok(soft_errors)
}

fn assign(backup_path: &Path, index: &mut FileIndex, devices: &mut DeviceList) -> Result<(), Error> {
    let mut current = 0usize;
    for file in index.iter_mut() {
        let rel = file
            .path
            .strip_prefix(backup_path)
            .unwrap_or(Path::new(""))
            .to_path_buf();
        match file.file_type {
            FileType::Directory | FileType::Symlink => {
                place_block(file, &rel, devices, &mut current)?
            }
            FileType::Regular => place_regular(file, &rel, devices, &mut current)?,
        }
    }
    Ok(())
}

/// Directories and symlinks cost one block and are never split.
fn place_block(
    file: &mut File,
    rel: &Path,
    devices: &mut DeviceList,
    current: &mut usize,
) -> Result<(), Error> {
    let cost = file.planned_cost();
    loop {
        let Some(device) = devices.get_mut(*current) else {
            return Err(Error::DevicePoolExceeded {
                path: file.path.clone(),
                needed: cost,
            });
        };
        if cost <= device.remaining() {
            file.dest_files.push(DestFile {
                device: *current,
                path: device.mount_point.join(rel),
                size: cost,
                start_byte: 0,
                end_byte: 0,
                sha1: None,
            });
            device.accept(cost);
            return Ok(());
        }
        *current += 1;
    }
}

fn place_regular(
    file: &mut File,
    rel: &Path,
    devices: &mut DeviceList,
    current: &mut usize,
) -> Result<(), Error> {
    let mut start = 0u64;
    loop {
        let Some(device) = devices.get_mut(*current) else {
            return Err(Error::DevicePoolExceeded {
                path: file.path.clone(),
                needed: file.size - start,
            });
        };
        let remaining = device.remaining();
        let left = file.size - start;

        if left <= remaining {
            // Final fragment. A file that never overflowed a device keeps
            // the whole-file convention of an empty byte range.
            let (start_byte, end_byte) = if start == 0 { (0, 0) } else { (start, file.size) };
            file.dest_files.push(DestFile {
                device: *current,
                path: device.mount_point.join(rel),
                size: left,
                start_byte,
                end_byte,
                sha1: None,
            });
            device.accept(left);
            return Ok(());
        }

        if remaining > 0 {
            debug!(
                file = %file.path.display(),
                device = %device.name,
                start, fragment = remaining,
                "splitting file across devices"
            );
            file.dest_files.push(DestFile {
                device: *current,
                path: device.mount_point.join(rel),
                size: remaining,
                start_byte: start,
                end_byte: start + remaining,
                sha1: None,
            });
            device.accept(remaining);
            start += remaining;
        }
        *current += 1;
    }
}

/// Estimates the serialized manifest and reserves that many bytes on the
/// last device. The estimate serializes the planned catalog with fixed-width
/// placeholder digests, so it is an upper bound on the final manifest.
fn reserve_sync_context(
    index: &mut FileIndex,
    devices: &mut DeviceList,
    soft_errors: &mut Vec<Error>,
) -> Result<u64, Error> {
    // Normalizes unserializable mod times on the real index up front.
    manifest_json(index, soft_errors)?;

    let mut probe = index.clone();
    let placeholder = "0".repeat(40);
    for file in probe.iter_mut() {
        if file.file_type == FileType::Regular {
            file.sha1 = Some(placeholder.clone());
        }
        for dest in file.dest_files.iter_mut() {
            dest.sha1 = Some(placeholder.clone());
        }
    }
    let needed = manifest_json(&mut probe, &mut Vec::new())?.len() as u64;

    match devices.last_mut() {
        Some(last) if needed <= last.remaining() => {
            last.accept(needed);
            Ok(needed)
        }
        Some(last) => Err(Error::SyncContextSpace {
            device: last.name.clone(),
            needed,
            available: last.remaining(),
        }),
        None => Err(Error::SyncContextSpace {
            device: "(no devices)".into(),
            needed,
            available: 0,
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::{Device, BLOCK_SIZE};
    use std::path::PathBuf;
    use std::time::SystemTime;

    fn file(name: &str, rel: &str, size: u64, file_type: FileType) -> File {
        File {
            name: name.into(),
            path: PathBuf::from("/src").join(rel),
            size,
            mode: 0o644,
            mod_time: SystemTime::now(),
            owner: 1000,
            group: 1000,
            file_type,
            symlink_target: None,
            sha1: None,
            dest_files: Vec::new(),
        }
    }

    fn device(name: &str, size_total: u64) -> Device {
        Device {
            name: name.into(),
            uuid: None,
            mount_point: PathBuf::from("/mnt").join(name),
            size_total,
            size_writn: 0,
            padding_percent: 0.01,
        }
    }

    fn ctx(index: FileIndex, devices: DeviceList) -> Context {
        Context::new(PathBuf::from("/src"), 1, index, devices)
    }

    #[test]
    fn test_whole_fit_single_device() {
        let mut c = ctx(
            vec![
                file("src", "", BLOCK_SIZE, FileType::Directory),
                file("a.txt", "a.txt", 10_000, FileType::Regular),
            ],
            vec![device("d0", 1_000_000)],
        );
        plan(&mut c, false).unwrap();

        let a = &c.file_index[1];
        assert_eq!(a.dest_files.len(), 1);
        assert!(a.dest_files[0].is_whole_file());
        assert_eq!(a.dest_files[0].size, 10_000);
        assert_eq!(a.dest_files[0].path, PathBuf::from("/mnt/d0/a.txt"));
        assert_eq!(c.devices[0].size_writn, BLOCK_SIZE + 10_000);
    }

    #[test]
    fn test_split_fragments_are_contiguous_and_sum_to_size() {
        // usable = 808_081 - 8_081 = 800_000; root dir leaves 795_904
        let mut c = ctx(
            vec![
                file("src", "", BLOCK_SIZE, FileType::Directory),
                file("big.bin", "big.bin", 1_200_000, FileType::Regular),
            ],
            vec![device("d0", 808_081), device("d1", 3_030_304)],
        );
        plan(&mut c, false).unwrap();

        let big = &c.file_index[1];
        assert_eq!(big.dest_files.len(), 2);
        let (f0, f1) = (&big.dest_files[0], &big.dest_files[1]);
        assert_eq!(f0.start_byte, 0);
        assert_eq!(f0.end_byte, 795_904);
        assert_eq!(f1.start_byte, f0.end_byte);
        assert_eq!(f1.end_byte, 1_200_000);
        assert_eq!(f0.size + f1.size, big.size);
        assert_eq!(f0.device, 0);
        assert_eq!(f1.device, 1);
        // A split file keeps the same relative path on every device.
        assert_eq!(f0.path, PathBuf::from("/mnt/d0/big.bin"));
        assert_eq!(f1.path, PathBuf::from("/mnt/d1/big.bin"));
    }

    #[test]
    fn test_file_skipping_a_full_device_stays_whole() {
        // usable = 99,000: the root directory and a.bin fill d0 exactly, so
        // b.bin overflows with zero remaining bytes and lands whole on d1,
        // keeping the empty byte range.
        let mut c = ctx(
            vec![
                file("src", "", BLOCK_SIZE, FileType::Directory),
                file("a.bin", "a.bin", 94_904, FileType::Regular),
                file("b.bin", "b.bin", 50_000, FileType::Regular),
            ],
            vec![device("d0", 100_000), device("d1", 1_000_000)],
        );
        plan(&mut c, false).unwrap();

        assert_eq!(c.devices[0].remaining(), 0);
        let b = &c.file_index[2];
        assert_eq!(b.dest_files.len(), 1);
        assert!(b.dest_files[0].is_whole_file());
        assert_eq!(b.dest_files[0].device, 1);
    }

    #[test]
    fn test_directory_advances_device_when_full() {
        let mut c = ctx(
            vec![
                file("src", "", BLOCK_SIZE, FileType::Directory),
                file("a.bin", "a.bin", 94_904, FileType::Regular),
                file("sub", "sub", BLOCK_SIZE, FileType::Directory),
            ],
            vec![device("d0", 100_000), device("d1", 1_000_000)],
        );
        plan(&mut c, false).unwrap();

        let sub = &c.file_index[2];
        assert_eq!(sub.dest_files.len(), 1);
        assert_eq!(sub.dest_files[0].device, 1);
        assert_eq!(sub.dest_files[0].size, BLOCK_SIZE);
    }

    #[test]
    fn test_pool_exhaustion_fails_the_plan() {
        let mut c = ctx(
            vec![
                file("src", "", BLOCK_SIZE, FileType::Directory),
                file("big.bin", "big.bin", 10_485_760, FileType::Regular),
            ],
            vec![
                device("d0", 3_499_350),
                device("d1", 3_499_350),
                device("d2", 300_000),
            ],
        );
        let err = plan(&mut c, false).unwrap_err();
        assert!(matches!(err, Error::DevicePoolExceeded { .. }));
        assert!(err.is_plan_level());
    }

    #[test]
    fn test_planning_is_deterministic() {
        let index = vec![
            file("src", "", BLOCK_SIZE, FileType::Directory),
            file("a.bin", "a.bin", 600_000, FileType::Regular),
            file("b.bin", "b.bin", 700_000, FileType::Regular),
        ];
        let devices = vec![device("d0", 808_081), device("d1", 3_030_304)];

        let mut c1 = ctx(index.clone(), devices.clone());
        let mut c2 = ctx(index, devices);
        plan(&mut c1, false).unwrap();
        plan(&mut c2, false).unwrap();

        assert_eq!(c1.file_index, c2.file_index);
        assert_eq!(
            c1.devices.iter().map(|d| d.size_writn).collect::<Vec<_>>(),
            c2.devices.iter().map(|d| d.size_writn).collect::<Vec<_>>()
        );
    }

    #[test]
    fn test_sync_context_reservation_charges_last_device() {
        let mut c = ctx(
            vec![
                file("src", "", BLOCK_SIZE, FileType::Directory),
                file("a.txt", "a.txt", 10_000, FileType::Regular),
            ],
            vec![device("d0", 1_000_000), device("d1", 1_000_000)],
        );
        plan(&mut c, true).unwrap();

        assert!(c.sync_context_size > 0);
        assert_eq!(c.devices[1].size_writn, c.sync_context_size);
    }

    #[test]
    fn test_sync_context_reservation_too_tight_fails() {
        // usable = 14_289 - 143 = 14_146: fits the two entries with 50 bytes
        // to spare, far less than any serialized manifest.
        let mut c = ctx(
            vec![
                file("src", "", BLOCK_SIZE, FileType::Directory),
                file("a.txt", "a.txt", 10_000, FileType::Regular),
            ],
            vec![device("d0", 14_289)],
        );
        let err = plan(&mut c, true).unwrap_err();
        assert!(matches!(err, Error::SyncContextSpace { .. }));
        assert!(err.is_plan_level());
    }
}
