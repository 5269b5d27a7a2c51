// SPDX-License-Identifier: AGPL-3.0-or-later
// FS reconciler: runs inside a reservation, inspects what currently sits at
// the target path, and clears the way for the materializer. This is where
// keep/newer/unlink policy, in-place file reuse, clobbering, and cache
// invalidation all meet.

use crate::files::path::cache_key;
use crate::unpack::dircache::{mkdirp, MkdirCtx};
use crate::unpack::entry::{Entry, EntryKind};
use crate::unpack::error::UnpackError;
use crate::unpack::events::WarnCode;
use crate::unpack::fsops;
use crate::unpack::materialize;
use crate::unpack::Ctx;

// File system
use std::fs;
use std::io;
use std::path::Path;
// Timestamps
use filetime::FileTime;
// Atomics
use std::sync::atomic::Ordering;
// Logging
use log::debug;

enum Outcome {
    Written,
    Skipped,
}

/// Entry point for one reserved entry: invalidate, reconcile, materialize,
/// invalidate again. Every failure mode except an unusable extraction root
/// is reported as a warning and the extraction continues.
pub(crate) fn process(entry: &Entry, ctx: &Ctx) {
    if ctx.abort.load(Ordering::SeqCst) {
        return;
    }
    invalidate_cache(entry, ctx);
    let outcome = reconcile(entry, ctx);
    invalidate_cache(entry, ctx);
    match outcome {
        Ok(Outcome::Written) => {
            ctx.written.fetch_add(1, Ordering::SeqCst);
        }
        Ok(Outcome::Skipped) => {
            ctx.skipped.fetch_add(1, Ordering::SeqCst);
        }
        Err(err @ UnpackError::Cwd { .. }) => {
            // the root itself is unusable; stop the whole extraction
            ctx.set_fatal(err);
        }
        Err(err) => {
            ctx.errored.fetch_add(1, Ordering::SeqCst);
            ctx.events.warn(
                WarnCode::EntryError,
                err.to_string(),
                Some(Path::new(&entry.path)),
            );
        }
    }
}

/// Cache hygiene around the filesystem work. A symlink anywhere invalidates
/// everything (any cached path may now resolve through it); a non-directory
/// entry invalidates its own subtree; a directory entry leaves the cache
/// alone. Runs both before and after the work to cover state other handlers
/// observed transiently.
fn invalidate_cache(entry: &Entry, ctx: &Ctx) {
    if entry.kind == EntryKind::SymbolicLink {
        ctx.cache.clear();
    } else if !entry.kind.is_dir() {
        if let Some(abs) = &entry.absolute {
            ctx.cache
                .invalidate_below(&cache_key(&abs.to_string_lossy(), ctx.cfg.win));
        }
    }
}

pub(crate) fn mkctx<'a>(entry: &Entry, ctx: &'a Ctx) -> MkdirCtx<'a> {
    let chown = if fsops::should_chown(&ctx.cfg, entry) {
        Some(fsops::owner_ids(&ctx.cfg, entry))
    } else {
        None
    };
    MkdirCtx {
        cwd: &ctx.cfg.cwd,
        cache: ctx.cache.as_ref(),
        win: ctx.cfg.win,
        mode: ctx.cfg.dmode,
        no_chmod: ctx.cfg.no_chmod,
        unlink: ctx.cfg.unlink,
        chown,
    }
}

fn reconcile(entry: &Entry, ctx: &Ctx) -> Result<Outcome, UnpackError> {
    let abs = match entry.absolute.as_deref() {
        Some(p) => p,
        None => {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "entry reached the reconciler without a resolved path",
            )
            .into())
        }
    };
    let dirs = mkctx(entry, ctx);

    // Validate the extraction root. The cache makes this O(1) after the
    // first entry; failures here are fatal for the whole run.
    mkdirp(&ctx.cfg.cwd, &dirs)?;

    if abs != ctx.cfg.cwd {
        if let Some(parent) = abs.parent() {
            if parent != ctx.cfg.cwd {
                mkdirp(parent, &dirs)?;
            }
        }
    }

    let st = match fs::symlink_metadata(abs) {
        Ok(st) => st,
        // missing (or unreadable: creating will surface the real error)
        Err(_) => return materialize::make_fs(entry, ctx).map(|_| Outcome::Written),
    };

    if ctx.cfg.keep {
        debug!("'{}' exists and keep is set, skipping", abs.to_string_lossy());
        return Ok(Outcome::Skipped);
    }

    if ctx.cfg.newer {
        if let Some(entry_mtime) = entry.mtime {
            let on_disk = FileTime::from_last_modification_time(&st);
            if on_disk > entry_mtime {
                debug!(
                    "'{}' on disk is newer than the archive, skipping",
                    abs.to_string_lossy()
                );
                return Ok(Outcome::Skipped);
            }
        }
    }

    // The extraction root is never removed or replaced, only tuned.
    if abs == ctx.cfg.cwd {
        return materialize::make_fs(entry, ctx).map(|_| Outcome::Written);
    }

    if st.is_dir() {
        if entry.kind.is_dir() {
            if !ctx.cfg.no_chmod {
                if let Some(want) = entry.mode.map(|m| m & 0o7777) {
                    if fsops::file_mode(&st).map(|have| have != want).unwrap_or(false) {
                        fsops::chmod_path(abs, want)?;
                    }
                }
            }
        } else {
            // fails on a non-empty directory, which is exactly the contract
            fs::remove_dir(abs)?;
        }
        return materialize::make_fs(entry, ctx).map(|_| Outcome::Written);
    }

    if st.file_type().is_symlink() {
        fsops::unlink_file(abs)?;
        return materialize::make_fs(entry, ctx).map(|_| Outcome::Written);
    }

    // Regular file (or device node etc.) on disk. Overwrite in place when
    // that cannot corrupt a hard-link peer; otherwise clear it out first.
    let reuse = entry.kind.is_file()
        && st.is_file()
        && !ctx.cfg.unlink
        && fsops::nlink_reliable()
        && fsops::nlink(&st) <= 1;
    if !reuse {
        fsops::unlink_file(abs)?;
    }
    materialize::make_fs(entry, ctx).map(|_| Outcome::Written)
}
