use crate::error::Error;
use filetime::FileTime;
use rustix::fs::{AtFlags, CWD};
use rustix::process::{RawGid, RawUid};
use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::Path;
use std::time::SystemTime;

fn uid_from_raw(raw: RawUid) -> rustix::fs::Uid {
    unsafe { rustix::fs::Uid::from_raw(raw) }
}

fn gid_from_raw(raw: RawGid) -> rustix::fs::Gid {
    unsafe { rustix::fs::Gid::from_raw(raw) }
}

/// Restores ownership, permission bits, and mtime on a destination entry.
/// For symlinks the link itself is updated, never the target. Failures are
/// collected rather than short-circuiting so one bad attribute still leaves
/// the rest restored; a chown refusal is reported as an ownership error and
/// the entry is kept.
pub(crate) fn apply_metadata(
    dest: &Path,
    mode: u32,
    owner: u32,
    group: u32,
    mod_time: SystemTime,
    symlink: bool,
) -> Vec<Error> {
    let mut errors = Vec::new();

    // Ownership first: chown clears setuid bits, so the mode goes on after.
    let uid = uid_from_raw(owner as RawUid);
    let gid = gid_from_raw(group as RawGid);
    let chown_result = if symlink {
        rustix::fs::chownat(
            CWD,
            dest,
            Some(uid),
            Some(gid),
            AtFlags::SYMLINK_NOFOLLOW,
        )
    } else {
        rustix::fs::chown(dest, Some(uid), Some(gid))
    };
    if let Err(errno) = chown_result {
        errors.push(Error::IncorrectOwnership {
            path: dest.to_path_buf(),
            owner,
            group,
            source: errno.into(),
        });
    }

    if !symlink {
        if let Err(err) = fs::set_permissions(dest, fs::Permissions::from_mode(mode)) {
            errors.push(err.into());
        }
    }

    let mtime = FileTime::from_system_time(mod_time);
    let times_result = if symlink {
        filetime::set_symlink_file_times(dest, mtime, mtime)
    } else {
        filetime::set_file_times(dest, mtime, mtime)
    };
    if let Err(err) = times_result {
        errors.push(err.into());
    }

    errors
}
