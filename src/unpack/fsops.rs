// SPDX-License-Identifier: AGPL-3.0-or-later
// Thin wrappers over the host filesystem primitives the reconciler and
// materializer need: ownership, timestamps, mode bits, and the non-atomic
// unlink mitigation. Platform differences stay inside this module.

use crate::unpack::entry::Entry;
use crate::unpack::Config;

// File system
use std::fs::File;
use std::io;
use std::path::Path;
// Timestamps
use filetime::FileTime;

/// Whether the platform reports hard-link counts we can trust when deciding
/// to overwrite a regular file in place. Capability probe, not a host-name
/// match.
pub const fn nlink_reliable() -> bool {
    cfg!(unix)
}

cfg_if::cfg_if! {
    if #[cfg(unix)] {
        pub fn process_uid() -> u32 {
            unsafe { libc::geteuid() }
        }

        pub fn process_gid() -> u32 {
            unsafe { libc::getegid() }
        }

        /// Archive ownership is only applied by default when running as the
        /// super-user; anyone else gets the files as themselves.
        pub fn default_preserve_owner() -> bool {
            process_uid() == 0
        }

        pub fn chmod_path(path: &Path, mode: u32) -> io::Result<()> {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(
                path, std::fs::Permissions::from_mode(mode & 0o7777)
            )
        }

        pub fn chown_file(
                    f: &File, path: &Path, uid: Option<u32>, gid: Option<u32>
                ) -> io::Result<()> {
            use std::os::unix::fs as ufs;
            if ufs::fchown(f, uid, gid).is_ok() {
                return Ok(());
            }
            ufs::chown(path, uid, gid)
        }

        pub fn chown_path(
                    path: &Path, uid: Option<u32>, gid: Option<u32>
                ) -> io::Result<()> {
            std::os::unix::fs::chown(path, uid, gid)
        }
    } else {
        pub fn process_uid() -> u32 { 0 }

        pub fn process_gid() -> u32 { 0 }

        pub fn default_preserve_owner() -> bool { false }

        pub fn chmod_path(_path: &Path, _mode: u32) -> io::Result<()> {
            Ok(())
        }

        pub fn chown_file(
                    _f: &File, _path: &Path, _uid: Option<u32>, _gid: Option<u32>
                ) -> io::Result<()> {
            Ok(())
        }

        pub fn chown_path(
                    _path: &Path, _uid: Option<u32>, _gid: Option<u32>
                ) -> io::Result<()> {
            Ok(())
        }
    }
}

cfg_if::cfg_if! {
    if #[cfg(unix)] {
        /// Hard-link count of an lstat result.
        pub fn nlink(st: &std::fs::Metadata) -> u64 {
            use std::os::unix::fs::MetadataExt;
            st.nlink()
        }

        /// Permission bits of an lstat result, if the platform has them.
        pub fn file_mode(st: &std::fs::Metadata) -> Option<u32> {
            use std::os::unix::fs::MetadataExt;
            Some(st.mode() & 0o7777)
        }
    } else {
        pub fn nlink(_st: &std::fs::Metadata) -> u64 { 1 }

        pub fn file_mode(_st: &std::fs::Metadata) -> Option<u32> { None }
    }
}

cfg_if::cfg_if! {
    if #[cfg(windows)] {
        /// Unlink commits late enough here to race a same-named create and
        /// eat the replacement. Rename to a random twin first; the rename is
        /// synchronous with respect to later creates on the original name.
        pub fn unlink_file(path: &Path) -> io::Result<()> {
            let suffix: u128 = rand::random();
            let mut twin = path.as_os_str().to_os_string();
            twin.push(format!(".DELETE.{:032x}", suffix));
            let twin = std::path::PathBuf::from(twin);
            std::fs::rename(path, &twin)?;
            std::fs::remove_file(&twin)
        }
    } else {
        pub fn unlink_file(path: &Path) -> io::Result<()> {
            std::fs::remove_file(path)
        }
    }
}

/// Whether this entry gets a chown: forced, preserving archive ownership
/// that differs from the running process, or an explicit override that
/// differs from the running process.
pub fn should_chown(cfg: &Config, entry: &Entry) -> bool {
    if !cfg!(unix) {
        return false;
    }
    if cfg.force_chown {
        return true;
    }
    let me = (process_uid(), process_gid());
    if cfg.preserve_owner {
        let differs = entry.uid.map(|u| u != me.0).unwrap_or(false)
            || entry.gid.map(|g| g != me.1).unwrap_or(false);
        if differs {
            return true;
        }
    }
    cfg.uid.map(|u| u != me.0).unwrap_or(false)
        || cfg.gid.map(|g| g != me.1).unwrap_or(false)
}

/// The uid/gid actually applied: first defined of configured, entry, process.
pub fn owner_ids(cfg: &Config, entry: &Entry) -> (Option<u32>, Option<u32>) {
    let uid = cfg.uid.or(entry.uid).or(Some(process_uid()));
    let gid = cfg.gid.or(entry.gid).or(Some(process_gid()));
    (uid, gid)
}

/// Set atime/mtime through the open descriptor, falling back to the
/// path-based call. A missing atime deterministically mirrors the mtime.
pub fn set_times_file(
            f: &File, path: &Path, atime: Option<FileTime>, mtime: FileTime
        ) -> io::Result<()> {
    let atime = atime.unwrap_or(mtime);
    if filetime::set_file_handle_times(f, Some(atime), Some(mtime)).is_ok() {
        return Ok(());
    }
    filetime::set_file_times(path, atime, mtime)
}

pub fn set_times_path(
            path: &Path, atime: Option<FileTime>, mtime: FileTime
        ) -> io::Result<()> {
    let atime = atime.unwrap_or(mtime);
    filetime::set_file_times(path, atime, mtime)
}
