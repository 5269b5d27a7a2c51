// SPDX-License-Identifier: AGPL-3.0-or-later
// Idempotent recursive directory creation with a shared "known to exist as a
// directory" cache. The cache is keyed by canonical cache key and shared by
// every reservation of an extraction (callers may also share it across
// extractions), so creating `a/b/c` once makes every later `a/b/...` O(1).

use crate::files::path::cache_key;
use crate::unpack::error::UnpackError;
use crate::unpack::fsops;

// File system
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
// Multi-threading
use std::sync::Mutex;

#[derive(Debug, Default)]
pub struct DirCache {
    map: Mutex<std::collections::HashMap<String, bool>>,
}

impl DirCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn check(&self, key: &str) -> bool {
        let map = self.map.lock().unwrap_or_else(|e| e.into_inner());
        map.get(key).copied().unwrap_or(false)
    }

    pub fn set(&self, key: String) {
        let mut map = self.map.lock().unwrap_or_else(|e| e.into_inner());
        map.insert(key, true);
    }

    /// Forget everything. Used when a symlink lands anywhere in the tree:
    /// any cached path may now resolve through it.
    pub fn clear(&self) {
        let mut map = self.map.lock().unwrap_or_else(|e| e.into_inner());
        map.clear();
    }

    /// Forget `key` and everything below it.
    pub fn invalidate_below(&self, key: &str) {
        let mut map = self.map.lock().unwrap_or_else(|e| e.into_inner());
        map.retain(|k, _| {
            !(k == key || (k.starts_with(key) && k[key.len()..].starts_with('/')))
        });
    }

    pub fn len(&self) -> usize {
        self.map.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

pub struct MkdirCtx<'a> {
    pub cwd: &'a Path,
    pub cache: &'a DirCache,
    pub win: bool,
    pub mode: u32,
    pub no_chmod: bool,
    /// Allow replacing a symlink found along the ancestor chain.
    pub unlink: bool,
    /// `Some((uid, gid))` makes every directory created here change owner.
    pub chown: Option<(Option<u32>, Option<u32>)>,
}

fn create_dir_mode(path: &Path, mode: u32, no_chmod: bool) -> io::Result<()> {
    #[cfg(unix)]
    {
        if !no_chmod {
            use std::os::unix::fs::DirBuilderExt;
            return fs::DirBuilder::new().mode(mode & 0o7777).create(path);
        }
    }
    let _ = mode;
    fs::create_dir(path)
}

/// Make sure the extraction root itself exists and is a directory. Any
/// failure here is fatal for the whole extraction.
fn ensure_cwd(ctx: &MkdirCtx) -> Result<(), UnpackError> {
    let cwd_key = cache_key(&ctx.cwd.to_string_lossy(), ctx.win);
    if ctx.cache.check(&cwd_key) {
        return Ok(());
    }
    if let Err(e) = fs::create_dir_all(ctx.cwd) {
        return Err(UnpackError::Cwd {
            path: ctx.cwd.to_path_buf(),
            code: format!("{:?}", e.kind()),
        });
    }
    // stat, not lstat: a root that is a symlink to a directory is usable
    match fs::metadata(ctx.cwd) {
        Ok(st) if st.is_dir() => {
            ctx.cache.set(cwd_key);
            Ok(())
        }
        Ok(_) => Err(UnpackError::Cwd {
            path: ctx.cwd.to_path_buf(),
            code: "NotADirectory".to_string(),
        }),
        Err(e) => Err(UnpackError::Cwd {
            path: ctx.cwd.to_path_buf(),
            code: format!("{:?}", e.kind()),
        }),
    }
}

/// Create every component from `cwd` down to `dir`, memoizing successes.
/// Calling twice with the same path is an O(1) no-op. Errors on the root are
/// `UnpackError::Cwd` (fatal); a symlink on the chain is
/// `UnpackError::Symlink` (per-entry) unless `unlink` allows replacing it.
pub fn mkdirp(dir: &Path, ctx: &MkdirCtx) -> Result<(), UnpackError> {
    let key = cache_key(&dir.to_string_lossy(), ctx.win);
    if ctx.cache.check(&key) {
        return Ok(());
    }
    ensure_cwd(ctx)?;

    let chain: Vec<PathBuf> = match dir.strip_prefix(ctx.cwd) {
        Ok(rel) => {
            let mut cur = ctx.cwd.to_path_buf();
            let mut v = Vec::new();
            for comp in rel.components() {
                cur.push(comp);
                v.push(cur.clone());
            }
            v
        }
        Err(_) => {
            // preserve-paths targets outside the root: build from the top
            let mut v: Vec<PathBuf> =
                dir.ancestors().map(|p| p.to_path_buf()).collect();
            v.reverse();
            v.retain(|p| p.parent().is_some());
            v
        }
    };

    for part in &chain {
        let part_key = cache_key(&part.to_string_lossy(), ctx.win);
        if ctx.cache.check(&part_key) {
            continue;
        }
        make_one(part, &part_key, ctx)?;
    }
    Ok(())
}

fn make_one(part: &Path, part_key: &str, ctx: &MkdirCtx) -> Result<(), UnpackError> {
    match create_dir_mode(part, ctx.mode, ctx.no_chmod) {
        Ok(()) => {
            ctx.cache.set(part_key.to_string());
            if let Some((uid, gid)) = ctx.chown {
                fsops::chown_path(part, uid, gid)?;
            }
            Ok(())
        }
        Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {
            let st = fs::symlink_metadata(part)?;
            if st.is_dir() {
                ctx.cache.set(part_key.to_string());
                return Ok(());
            }
            if st.file_type().is_symlink() {
                if !ctx.unlink {
                    return Err(UnpackError::Symlink {
                        path: part.to_path_buf(),
                    });
                }
                fsops::unlink_file(part)?;
                create_dir_mode(part, ctx.mode, ctx.no_chmod)?;
                ctx.cache.set(part_key.to_string());
                if let Some((uid, gid)) = ctx.chown {
                    fsops::chown_path(part, uid, gid)?;
                }
                return Ok(());
            }
            Err(io::Error::new(
                io::ErrorKind::AlreadyExists,
                format!(
                    "Cannot create directory over existing file '{}'",
                    part.to_string_lossy()
                ),
            )
            .into())
        }
        Err(e) => Err(e.into()),
    }
}
