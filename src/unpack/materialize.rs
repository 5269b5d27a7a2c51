// SPDX-License-Identifier: AGPL-3.0-or-later
// Materializer: the target path has been reconciled, now put the archive
// member on disk. Dispatch on kind is a closed, exhaustive match.

use crate::files::path::{normalize_separators, resolve_under};
use crate::unpack::entry::{Entry, EntryKind};
use crate::unpack::error::UnpackError;
use crate::unpack::fsops;
use crate::unpack::Ctx;

// File system
use std::borrow::Cow;
use std::fs::{self, OpenOptions};
use std::io::{self, BufWriter, Write};
use std::path::Path;

/// Payloads at or below this size go down in a single write; anything bigger
/// streams through a buffered writer.
const ONE_SHOT_MAX: usize = 64 * 1024;

pub(crate) fn make_fs(entry: &Entry, ctx: &Ctx) -> Result<(), UnpackError> {
    let abs = match entry.absolute.as_deref() {
        Some(p) => p,
        None => {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "entry reached the materializer without a resolved path",
            )
            .into())
        }
    };
    match entry.kind {
        k if k.is_file() => file(entry, abs, ctx),
        k if k.is_dir() => directory(entry, abs, ctx),
        EntryKind::SymbolicLink => symlink(entry, abs),
        EntryKind::Link => hardlink(entry, abs, ctx),
        k => Err(io::Error::new(
            io::ErrorKind::Unsupported,
            format!("cannot materialize entry type: {}", k.name()),
        )
        .into()),
    }
}

fn file(entry: &Entry, abs: &Path, ctx: &Ctx) -> Result<(), UnpackError> {
    let mode = entry.mode.map(|m| m & 0o7777).unwrap_or(ctx.cfg.fmode);
    let mut opts = OpenOptions::new();
    opts.write(true).create(true).truncate(true);
    #[cfg(unix)]
    {
        if !ctx.cfg.no_chmod {
            use std::os::unix::fs::OpenOptionsExt;
            opts.mode(mode);
        }
    }
    #[cfg(not(unix))]
    let _ = mode;

    let f = opts.open(abs)?;

    let data: Cow<[u8]> = match &ctx.cfg.transform {
        Some(t) => Cow::Owned(t(entry, &entry.payload)?),
        None => Cow::Borrowed(&entry.payload),
    };
    {
        let mut f = &f;
        if data.len() <= ONE_SHOT_MAX {
            f.write_all(&data)?;
        } else {
            let mut w = BufWriter::new(f);
            w.write_all(&data)?;
            w.flush()?;
        }
    }

    if !ctx.cfg.no_mtime {
        if let Some(mtime) = entry.mtime {
            fsops::set_times_file(&f, abs, entry.atime, mtime)?;
        }
    }
    if fsops::should_chown(&ctx.cfg, entry) {
        let (uid, gid) = fsops::owner_ids(&ctx.cfg, entry);
        fsops::chown_file(&f, abs, uid, gid)?;
    }
    drop(f);
    Ok(())
}

fn directory(entry: &Entry, abs: &Path, ctx: &Ctx) -> Result<(), UnpackError> {
    let mode = entry.mode.map(|m| m & 0o7777).unwrap_or(ctx.cfg.dmode);
    let mut dirs = crate::unpack::reconcile::mkctx(entry, ctx);
    dirs.mode = mode;
    crate::unpack::dircache::mkdirp(abs, &dirs)?;

    if !ctx.cfg.no_mtime {
        if let Some(mtime) = entry.mtime {
            fsops::set_times_path(abs, entry.atime, mtime)?;
        }
    }
    if fsops::should_chown(&ctx.cfg, entry) {
        let (uid, gid) = fsops::owner_ids(&ctx.cfg, entry);
        fsops::chown_path(abs, uid, gid)?;
    }
    Ok(())
}

fn symlink(entry: &Entry, abs: &Path) -> Result<(), UnpackError> {
    let target = match entry.linkpath.as_deref() {
        Some(t) if !t.is_empty() => t,
        _ => {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "symbolic link entry carries no target",
            )
            .into())
        }
    };
    // the target is taken verbatim; a symlink may point anywhere
    cfg_if::cfg_if! {
        if #[cfg(unix)] {
            std::os::unix::fs::symlink(target, abs)?;
        } else if #[cfg(windows)] {
            std::os::windows::fs::symlink_file(target, abs)?;
        } else {
            let _ = (target, abs);
            return Err(io::Error::new(
                io::ErrorKind::Unsupported,
                "platform has no symlink primitive",
            )
            .into());
        }
    }
    Ok(())
}

fn hardlink(entry: &Entry, abs: &Path, ctx: &Ctx) -> Result<(), UnpackError> {
    let linkpath = match entry.linkpath.as_deref() {
        Some(t) if !t.is_empty() => t,
        _ => {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "hard link entry carries no target",
            )
            .into())
        }
    };
    // hard link targets are archive-relative: resolve against the root
    let target = resolve_under(&ctx.cfg.cwd, &normalize_separators(linkpath, ctx.cfg.win));
    fs::hard_link(target, abs)?;
    Ok(())
}
