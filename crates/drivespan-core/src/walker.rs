use crate::device::BLOCK_SIZE;
use crate::error::Error;
use crate::index::{File, FileIndex, FileType};
use std::fs;
use std::io;
use std::os::unix::fs::MetadataExt;
use std::path::{Path, PathBuf};
use std::time::SystemTime;
use tracing::warn;

/// Walks `backup_path` into a flat, ordered index: the backup path itself is
/// the first entry, then depth-first with entries sorted bytewise per
/// directory, every directory preceding its contents. Entries unreadable at
/// stat time are reported in the returned error list and skipped.
pub fn build_file_index(backup_path: &Path) -> Result<(FileIndex, Vec<Error>), Error> {
    let root = std::path::absolute(backup_path)?;
    let meta = fs::symlink_metadata(&root).map_err(|source| Error::SourceNotReadable {
        path: root.clone(),
        source,
    })?;
    if !meta.is_dir() {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("backup path {} is not a directory", root.display()),
        )
        .into());
    }

    let mut index = FileIndex::new();
    let mut errors = Vec::new();
    index.push(file_entry(&root, &meta, None));
    walk_dir(&root, &mut index, &mut errors);
    Ok((index, errors))
}

fn walk_dir(dir: &Path, index: &mut FileIndex, errors: &mut Vec<Error>) {
    let reader = match fs::read_dir(dir) {
        Ok(reader) => reader,
        Err(source) => {
            errors.push(Error::SourceNotReadable {
                path: dir.to_path_buf(),
                source,
            });
            return;
        }
    };

    let mut entries: Vec<fs::DirEntry> = Vec::new();
    for entry in reader {
        match entry {
            Ok(entry) => entries.push(entry),
            Err(source) => errors.push(Error::SourceNotReadable {
                path: dir.to_path_buf(),
                source,
            }),
        }
    }
    entries.sort_by_key(|e| e.file_name());

    for entry in entries {
        let path = entry.path();
        // DirEntry::metadata does not traverse symlinks.
        let meta = match entry.metadata() {
            Ok(meta) => meta,
            Err(source) => {
                errors.push(Error::SourceNotReadable { path, source });
                continue;
            }
        };
        let file_type = meta.file_type();

        if file_type.is_symlink() {
            let target = match fs::read_link(&path) {
                Ok(target) => target,
                Err(source) => {
                    errors.push(Error::SourceNotReadable { path, source });
                    continue;
                }
            };
            index.push(file_entry(&path, &meta, Some(target)));
        } else if file_type.is_dir() {
            index.push(file_entry(&path, &meta, None));
            walk_dir(&path, index, errors);
        } else if file_type.is_file() {
            index.push(file_entry(&path, &meta, None));
        } else {
            warn!(path = %path.display(), "skipping special file");
        }
    }
}

fn file_entry(path: &Path, meta: &fs::Metadata, symlink_target: Option<PathBuf>) -> File {
    let file_type = if symlink_target.is_some() {
        FileType::Symlink
    } else if meta.is_dir() {
        FileType::Directory
    } else {
        FileType::Regular
    };
    let size = match file_type {
        FileType::Regular => meta.len(),
        FileType::Directory | FileType::Symlink => BLOCK_SIZE,
    };
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.display().to_string());

    File {
        name,
        path: path.to_path_buf(),
        size,
        mode: meta.mode() & 0o7777,
        mod_time: meta.modified().unwrap_or(SystemTime::UNIX_EPOCH),
        owner: meta.uid(),
        group: meta.gid(),
        file_type,
        symlink_target,
        sha1: None,
        dest_files: Vec::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::fs::symlink;
    use tempfile::tempdir;

    #[test]
    fn test_root_is_first_and_order_is_depth_first() {
        let tmp = tempdir().unwrap();
        let root = tmp.path().join("tree");
        fs::create_dir(&root).unwrap();
        fs::write(root.join("a.txt"), "aaa").unwrap();
        fs::create_dir(root.join("bdir")).unwrap();
        fs::write(root.join("bdir").join("inner.txt"), "inner").unwrap();
        fs::write(root.join("c.txt"), "ccc").unwrap();

        let (index, errors) = build_file_index(&root).unwrap();
        assert!(errors.is_empty());

        let names: Vec<&str> = index.iter().map(|f| f.name.as_str()).collect();
        assert_eq!(names, vec!["tree", "a.txt", "bdir", "inner.txt", "c.txt"]);
        assert_eq!(index[0].file_type, FileType::Directory);
        assert_eq!(index[0].size, BLOCK_SIZE);
        assert_eq!(index[2].file_type, FileType::Directory);
        assert_eq!(index[3].size, 5);
    }

    #[test]
    fn test_symlink_records_target_and_block_size() {
        let tmp = tempdir().unwrap();
        let root = tmp.path().join("links");
        fs::create_dir(&root).unwrap();
        fs::write(root.join("test.txt"), "hello").unwrap();
        symlink(root.join("test.txt"), root.join("test_link")).unwrap();

        let (index, errors) = build_file_index(&root).unwrap();
        assert!(errors.is_empty());

        let link = index.iter().find(|f| f.name == "test_link").unwrap();
        assert_eq!(link.file_type, FileType::Symlink);
        assert_eq!(link.size, BLOCK_SIZE);
        assert_eq!(link.symlink_target, Some(root.join("test.txt")));
    }

    #[test]
    fn test_missing_backup_path_is_an_error() {
        let tmp = tempdir().unwrap();
        let err = build_file_index(&tmp.path().join("nope")).unwrap_err();
        assert!(matches!(err, Error::SourceNotReadable { .. }));
    }

    #[test]
    fn test_regular_file_keeps_stat_size() {
        let tmp = tempdir().unwrap();
        let root = tmp.path().join("sized");
        fs::create_dir(&root).unwrap();
        fs::write(root.join("blob.bin"), vec![0u8; 12_345]).unwrap();

        let (index, _) = build_file_index(&root).unwrap();
        let blob = index.iter().find(|f| f.name == "blob.bin").unwrap();
        assert_eq!(blob.size, 12_345);
        assert_eq!(blob.file_type, FileType::Regular);
    }
}
