// SPDX-License-Identifier: AGPL-3.0-or-later
// Entry sanitizer: rewrites the archive path according to the strip/depth/
// traversal policies and resolves the host-filesystem target. An entry that
// comes out of here accepted has `absolute` set and (short of preserve-paths
// mode) pinned inside the extraction root. Rejected entries take no
// reservation; the driver drains their payload.

use crate::files::path::{
    encode_windows_chars, normalize_separators, resolve_under, strip_absolute,
    strip_trailing_slashes,
};
use crate::unpack::entry::Entry;
use crate::unpack::events::{Events, WarnCode};
use crate::unpack::Config;

// File system
use std::path::{Path, PathBuf};
// Logging
use log::debug;

/// Windows drive-relative parent segment (`c:..`), the one `..` shape a
/// plain segment comparison misses.
fn drive_relative_dotdot(seg: &str) -> bool {
    let b = seg.as_bytes();
    b.len() == 4 && b[0].is_ascii_alphabetic() && b[1] == b':' && &b[2..] == b".."
}

/// Apply the path policies to `entry`, in order: strip, depth cap, `..`
/// rejection, absolute-prefix stripping, resolution against the extraction
/// root, escape check, root-replacement check, windows re-encoding. Returns
/// whether the entry may proceed to reservation.
pub fn check_path(entry: &mut Entry, cfg: &Config, events: &Events) -> bool {
    let raw = entry.path.clone();
    let mut path = strip_trailing_slashes(&normalize_separators(&entry.path, cfg.win))
        .to_string();

    if cfg.strip > 0 {
        let parts: Vec<&str> = path.split('/').collect();
        if parts.len() <= cfg.strip {
            debug!("entry '{}' consumed entirely by strip={}", raw, cfg.strip);
            return false;
        }
        path = parts[cfg.strip..].join("/");
        if entry.kind == crate::unpack::entry::EntryKind::Link {
            if let Some(lp) = entry.linkpath.take() {
                let lp = strip_trailing_slashes(&normalize_separators(&lp, cfg.win))
                    .to_string();
                let lparts: Vec<&str> = lp.split('/').collect();
                if lparts.len() <= cfg.strip {
                    debug!(
                        "link target '{}' consumed entirely by strip={}",
                        lp, cfg.strip
                    );
                    return false;
                }
                entry.linkpath = Some(lparts[cfg.strip..].join("/"));
            }
        }
    }

    if let Some(max_depth) = cfg.max_depth {
        if path.split('/').count() > max_depth {
            events.warn(
                WarnCode::EntryError,
                "path excessively deep",
                Some(Path::new(&raw)),
            );
            return false;
        }
    }

    if !cfg.preserve_paths {
        let dotdot = path
            .split('/')
            .any(|seg| seg == ".." || (cfg.win && drive_relative_dotdot(seg)));
        if dotdot {
            events.warn(
                WarnCode::EntryError,
                "path contains '..'",
                Some(Path::new(&raw)),
            );
            return false;
        }

        let (root, rest) = strip_absolute(&path, cfg.win);
        if !root.is_empty() {
            path = rest;
            events.warn(
                WarnCode::EntryInfo,
                format!("stripping {} from absolute path", root),
                Some(Path::new(&raw)),
            );
        }
    }

    let mut absolute = resolve_under(&cfg.cwd, &path);

    // Defense in depth: nothing above survives that resolves outside the
    // root, but preserve-paths mode aside we never trust the arithmetic.
    if !cfg.preserve_paths && !absolute.starts_with(&cfg.cwd) {
        events.warn(
            WarnCode::EntryError,
            "path escaped extraction target",
            Some(Path::new(&raw)),
        );
        return false;
    }

    // An archive may tune the root directory but not replace it.
    if absolute == cfg.cwd && !entry.kind.is_dir() {
        debug!("entry '{}' targets the extraction root, skipping", raw);
        return false;
    }

    if cfg.win {
        path = encode_windows_chars(&path);
        absolute = PathBuf::from(encode_windows_chars(&absolute.to_string_lossy()));
    }

    entry.path = path;
    entry.absolute = Some(absolute);
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::unpack::entry::EntryKind;
    use crate::unpack::UnpackOptions;

    fn entry(kind: EntryKind, path: &str) -> Entry {
        Entry {
            kind,
            path: path.to_string(),
            linkpath: None,
            mode: None,
            uid: None,
            gid: None,
            mtime: None,
            atime: None,
            size: 0,
            absolute: None,
            unsupported: false,
            payload: Vec::new(),
        }
    }

    fn config(tune: impl FnOnce(&mut UnpackOptions)) -> Config {
        let mut opts = UnpackOptions::default();
        opts.cwd = PathBuf::from("/restore/root");
        tune(&mut opts);
        Config::resolve(&opts).expect("valid options")
    }

    #[test]
    fn plain_entry_resolves_under_cwd() {
        let cfg = config(|_| {});
        let events = Events::new();
        let mut e = entry(EntryKind::File, "dir/a");
        assert!(check_path(&mut e, &cfg, &events));
        assert_eq!(
            e.absolute.as_deref(),
            Some(Path::new("/restore/root/dir/a"))
        );
        assert!(events.warnings().is_empty());
    }

    #[test]
    fn absolute_prefix_is_stripped_with_info() {
        let cfg = config(|_| {});
        let events = Events::new();
        let mut e = entry(EntryKind::File, "/etc/passwd");
        assert!(check_path(&mut e, &cfg, &events));
        assert_eq!(
            e.absolute.as_deref(),
            Some(Path::new("/restore/root/etc/passwd"))
        );
        let warns = events.warnings();
        assert_eq!(warns.len(), 1);
        assert_eq!(warns[0].code, WarnCode::EntryInfo);
        assert_eq!(warns[0].message, "stripping / from absolute path");
    }

    #[test]
    fn dotdot_is_rejected() {
        let cfg = config(|_| {});
        let events = Events::new();
        let mut e = entry(EntryKind::File, "../../etc/passwd");
        assert!(!check_path(&mut e, &cfg, &events));
        let warns = events.warnings();
        assert_eq!(warns[0].code, WarnCode::EntryError);
        assert_eq!(warns[0].message, "path contains '..'");
    }

    #[test]
    fn preserve_paths_allows_dotdot() {
        let cfg = config(|o| o.preserve_paths = true);
        let events = Events::new();
        let mut e = entry(EntryKind::File, "../out");
        assert!(check_path(&mut e, &cfg, &events));
        assert_eq!(e.absolute.as_deref(), Some(Path::new("/restore/out")));
    }

    #[test]
    fn depth_cap_rejects() {
        let cfg = config(|o| o.max_depth = Some(3));
        let events = Events::new();
        let mut e = entry(EntryKind::File, "a/b/c/d/e");
        assert!(!check_path(&mut e, &cfg, &events));
        assert_eq!(events.warnings()[0].message, "path excessively deep");
    }

    #[test]
    fn strip_drops_and_skips() {
        let cfg = config(|o| o.strip = 2);
        let events = Events::new();

        let mut deep = entry(EntryKind::File, "pkg/sub/file");
        assert!(check_path(&mut deep, &cfg, &events));
        assert_eq!(deep.path, "file");

        // depth equal to strip: consumed entirely
        let mut shallow = entry(EntryKind::File, "pkg/sub");
        assert!(!check_path(&mut shallow, &cfg, &events));
        assert!(events.warnings().is_empty());
    }

    #[test]
    fn strip_applies_to_hard_link_targets() {
        let cfg = config(|o| o.strip = 1);
        let events = Events::new();
        let mut link = entry(EntryKind::Link, "pkg/b");
        link.linkpath = Some("pkg/a".to_string());
        assert!(check_path(&mut link, &cfg, &events));
        assert_eq!(link.linkpath.as_deref(), Some("a"));

        let mut bad = entry(EntryKind::Link, "pkg/b");
        bad.linkpath = Some("a".to_string());
        assert!(!check_path(&mut bad, &cfg, &events));
    }

    #[test]
    fn file_entry_for_the_root_is_skipped() {
        let cfg = config(|_| {});
        let events = Events::new();
        let mut e = entry(EntryKind::File, ".");
        assert!(!check_path(&mut e, &cfg, &events));
        // but a directory entry may tune the root
        let mut d = entry(EntryKind::Directory, ".");
        assert!(check_path(&mut d, &cfg, &events));
        assert_eq!(d.absolute.as_deref(), Some(Path::new("/restore/root")));
    }

    #[test]
    fn win32_mode_encodes_reserved_chars() {
        let cfg = config(|o| o.win32 = true);
        let events = Events::new();
        let mut e = entry(EntryKind::File, "a\\we|rd");
        assert!(check_path(&mut e, &cfg, &events));
        assert_eq!(e.path, "a/we\u{f07c}rd");
        assert_eq!(
            e.absolute.as_deref(),
            Some(Path::new("/restore/root/a/we\u{f07c}rd"))
        );
    }

    #[test]
    fn drive_relative_dotdot_is_rejected_in_win_mode() {
        let cfg = config(|o| o.win32 = true);
        let events = Events::new();
        let mut e = entry(EntryKind::File, "c:../evil");
        assert!(!check_path(&mut e, &cfg, &events));
        assert_eq!(events.warnings()[0].message, "path contains '..'");
    }
}
