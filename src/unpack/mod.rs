// SPDX-License-Identifier: AGPL-3.0-or-later
// Streaming tar extraction engine. The `tar` crate parses the byte stream;
// everything after that -- path policy, the reservation scheduler, the
// filesystem state machine -- lives in the submodules below.

// entry records and header adaptation
pub mod entry;

// error handling
pub mod error;

// warnings and lifecycle notifications
pub mod events;

// completion tracker
pub mod track;

// work distribution channel for the unpack workers
pub mod pipe;

// path reservation scheduler
pub mod reserve;

// directory-created cache and recursive mkdir
pub mod dircache;

// per-entry path policy
pub mod sanitize;

// low-level filesystem helpers
pub mod fsops;

// filesystem state machine: reconcile what is on disk ...
pub mod reconcile;

// ... then materialize what the archive says should be there
pub mod materialize;

use crate::files::path::{lexical_normalize, normalize_separators, resolve_under};
use crate::unpack::dircache::DirCache;
use crate::unpack::entry::{is_meta_type, Entry, EntryKind};
use crate::unpack::error::UnpackError;
use crate::unpack::events::{Events, WarnCode, Warning};
use crate::unpack::pipe::Pipe;
use crate::unpack::reserve::{Job, Reserver};
use crate::unpack::track::Tracker;

// Tar files
use tar::Archive;
// File system
use std::io::{self, Read};
use std::path::{Path, PathBuf};
// Multi-threading
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::thread::JoinHandle;
// Logging
use log::{debug, info, warn};
// JSON report
use serde::Serialize;

/// Optional payload transformer for file entries. Receives the entry and its
/// raw payload; whatever comes back is written instead. Errors are reported
/// like any other per-entry failure.
pub type Transform =
    Arc<dyn Fn(&Entry, &[u8]) -> io::Result<Vec<u8>> + Send + Sync>;

/// Everything the caller can tune. `Default` gives the behavior of a plain
/// `tar -x` into the current directory.
#[derive(Clone)]
pub struct UnpackOptions {
    /// Extraction root; defaults to the process working directory.
    pub cwd: PathBuf,
    /// Path segments to drop from each entry (and hard-link target).
    pub strip: usize,
    /// Reject entries with more segments than this; `None` is unlimited.
    pub max_depth: Option<usize>,
    /// Disable `..` rejection, absolute-stripping and escape rejection.
    pub preserve_paths: bool,
    /// Unconditionally unlink before creating (forbids in-place file reuse,
    /// allows replacing symlinks on directory chains).
    pub unlink: bool,
    /// Never overwrite existing filesystem objects.
    pub keep: bool,
    /// Skip entries older than what is already on disk.
    pub newer: bool,
    pub no_mtime: bool,
    pub no_chmod: bool,
    pub force_chown: bool,
    /// Apply archive uid/gid where it differs from the process. `None`
    /// defaults to "am I the super-user".
    pub preserve_owner: Option<bool>,
    pub uid: Option<u32>,
    pub gid: Option<u32>,
    /// Umask for computing default modes; defaults to `0o22`.
    pub umask: Option<u32>,
    pub dmode: Option<u32>,
    pub fmode: Option<u32>,
    /// Apply windows path semantics (separator folding, reserved-character
    /// re-encoding) even on non-windows hosts.
    pub win32: bool,
    /// Worker threads for the parallel profile; `0` picks the host
    /// parallelism.
    pub workers: usize,
    /// Directory-created cache shared across extractions.
    pub dir_cache: Option<Arc<DirCache>>,
    pub transform: Option<Transform>,
}

impl Default for UnpackOptions {
    fn default() -> Self {
        Self {
            cwd: PathBuf::from("."),
            strip: 0,
            max_depth: Some(1024),
            preserve_paths: false,
            unlink: false,
            keep: false,
            newer: false,
            no_mtime: false,
            no_chmod: false,
            force_chown: false,
            preserve_owner: None,
            uid: None,
            gid: None,
            umask: None,
            dmode: None,
            fmode: None,
            win32: false,
            workers: 0,
            dir_cache: None,
            transform: None,
        }
    }
}

/// Options after validation and defaulting. This is what the state machine
/// actually reads.
#[derive(Clone)]
pub struct Config {
    pub cwd: PathBuf,
    pub strip: usize,
    pub max_depth: Option<usize>,
    pub preserve_paths: bool,
    pub unlink: bool,
    pub keep: bool,
    pub newer: bool,
    pub no_mtime: bool,
    pub no_chmod: bool,
    pub force_chown: bool,
    pub preserve_owner: bool,
    pub uid: Option<u32>,
    pub gid: Option<u32>,
    pub dmode: u32,
    pub fmode: u32,
    pub win: bool,
    pub workers: usize,
    pub transform: Option<Transform>,
}

impl Config {
    pub(crate) fn resolve(opts: &UnpackOptions) -> Result<Config, UnpackError> {
        if opts.uid.is_some() != opts.gid.is_some() {
            return Err(UnpackError::Config(
                "uid and gid must be provided together".to_string(),
            ));
        }
        if opts.uid.is_some() && opts.preserve_owner == Some(true) {
            return Err(UnpackError::Config(
                "explicit uid/gid and preserve_owner are mutually exclusive"
                    .to_string(),
            ));
        }
        let win = cfg!(windows) || opts.win32;
        let umask = if opts.no_chmod {
            0
        } else {
            opts.umask.unwrap_or(0o22)
        };
        let cwd = if opts.cwd.is_absolute() {
            lexical_normalize(&opts.cwd)
        } else {
            lexical_normalize(&std::env::current_dir()?.join(&opts.cwd))
        };
        let workers = if opts.workers == 0 {
            thread::available_parallelism().map(|n| n.get()).unwrap_or(4)
        } else {
            opts.workers
        };
        Ok(Config {
            cwd,
            strip: opts.strip,
            max_depth: opts.max_depth,
            preserve_paths: opts.preserve_paths,
            unlink: opts.unlink,
            keep: opts.keep,
            newer: opts.newer,
            no_mtime: opts.no_mtime,
            no_chmod: opts.no_chmod,
            force_chown: opts.force_chown,
            preserve_owner: opts
                .preserve_owner
                .unwrap_or_else(fsops::default_preserve_owner),
            uid: opts.uid,
            gid: opts.gid,
            dmode: opts.dmode.unwrap_or(0o777 & !umask),
            fmode: opts.fmode.unwrap_or(0o666 & !umask),
            win,
            workers,
            transform: opts.transform.clone(),
        })
    }
}

/// Shared state of one extraction run.
pub(crate) struct Ctx {
    pub cfg: Config,
    pub events: Events,
    pub cache: Arc<DirCache>,
    pub abort: AtomicBool,
    fatal: Mutex<Option<UnpackError>>,
    pub written: AtomicUsize,
    pub skipped: AtomicUsize,
    pub errored: AtomicUsize,
}

impl Ctx {
    fn new(cfg: Config, cache: Arc<DirCache>) -> Self {
        Self {
            cfg,
            events: Events::new(),
            cache,
            abort: AtomicBool::new(false),
            fatal: Mutex::new(None),
            written: AtomicUsize::new(0),
            skipped: AtomicUsize::new(0),
            errored: AtomicUsize::new(0),
        }
    }

    /// First fatal error wins; everything after it is dropped on the floor
    /// because the extraction is already aborting.
    pub(crate) fn set_fatal(&self, err: UnpackError) {
        let mut slot = self.fatal.lock().unwrap_or_else(|e| e.into_inner());
        if slot.is_none() {
            *slot = Some(err);
        }
        self.abort.store(true, Ordering::SeqCst);
    }

    fn take_fatal(&self) -> Option<UnpackError> {
        self.fatal.lock().unwrap_or_else(|e| e.into_inner()).take()
    }
}

/// What an extraction leaves behind besides the files: counters, the ordered
/// warning list, and the lifecycle record.
#[derive(Debug, Clone, Serialize)]
pub struct UnpackSummary {
    pub entries_seen: usize,
    pub entries_written: usize,
    pub entries_skipped: usize,
    pub entries_errored: usize,
    pub warnings: Vec<Warning>,
    pub lifecycle: Vec<String>,
}

impl UnpackSummary {
    pub fn clean(&self) -> bool {
        self.warnings.is_empty()
    }
}

enum Runner {
    /// Parallel profile: eligible handlers travel over the pipe to a worker
    /// pool.
    Workers(Pipe<Job>),
    /// Sequential profile: eligible handlers queue up and the driver runs
    /// them inline after each entry.
    Inline(Arc<Mutex<VecDeque<Job>>>),
}

fn drain_inline(queue: &Arc<Mutex<VecDeque<Job>>>) {
    loop {
        let job = queue
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .pop_front();
        match job {
            Some(j) => j(),
            None => break,
        }
    }
}

fn worker_loop(idx: usize, pipe: Pipe<Job>) {
    loop {
        match pipe.take_try_many() {
            Ok(job) => job(),
            Err(error) => {
                match pipe.get_completed() {
                    Ok(true) => return,
                    Ok(false) => debug!(
                        "worker {}: take_try_many returned '{}'. Pipe not \
                         marked as completed => retrying",
                        idx, error
                    ),
                    Err(_) => return,
                }
            }
        }
    }
}

/// Parallel extraction: one driver thread parses and buffers, N workers
/// reconcile and materialize under path reservations.
pub struct Unpacker {
    cfg: Config,
    cache: Arc<DirCache>,
}

impl Unpacker {
    pub fn new(opts: UnpackOptions) -> Result<Self, UnpackError> {
        let cfg = Config::resolve(&opts)?;
        let cache = opts.dir_cache.unwrap_or_default();
        Ok(Self { cfg, cache })
    }

    pub fn extract<R: Read>(&self, reader: R) -> Result<UnpackSummary, UnpackError> {
        extract_impl(self.cfg.clone(), Arc::clone(&self.cache), reader, true)
    }
}

/// Sequential extraction: identical semantics, at most one operation in
/// flight at any time.
pub struct SyncUnpacker {
    cfg: Config,
    cache: Arc<DirCache>,
}

impl SyncUnpacker {
    pub fn new(opts: UnpackOptions) -> Result<Self, UnpackError> {
        let cfg = Config::resolve(&opts)?;
        let cache = opts.dir_cache.unwrap_or_default();
        Ok(Self { cfg, cache })
    }

    pub fn extract<R: Read>(&self, reader: R) -> Result<UnpackSummary, UnpackError> {
        extract_impl(self.cfg.clone(), Arc::clone(&self.cache), reader, false)
    }
}

fn extract_impl<R: Read>(
            cfg: Config,
            cache: Arc<DirCache>,
            reader: R,
            parallel: bool
        ) -> Result<UnpackSummary, UnpackError> {
    let ctx = Arc::new(Ctx::new(cfg, cache));
    let tracker = Arc::new(Tracker::new());

    let runner = if parallel {
        Runner::Workers(Pipe::new())
    } else {
        Runner::Inline(Arc::new(Mutex::new(VecDeque::new())))
    };
    let dispatch: Box<dyn Fn(Job) + Send + Sync> = match &runner {
        Runner::Workers(pipe) => {
            let tx = pipe.input();
            Box::new(move |job| {
                if tx.send(job).is_err() {
                    warn!("work pipe closed with jobs still pending");
                }
            })
        }
        Runner::Inline(queue) => {
            let q = Arc::clone(queue);
            Box::new(move |job| {
                q.lock().unwrap_or_else(|e| e.into_inner()).push_back(job)
            })
        }
    };
    let reserver = Arc::new(Reserver::new(
        dispatch,
        Arc::clone(&tracker),
        ctx.cfg.win,
    ));

    let mut handles: Vec<JoinHandle<()>> = Vec::new();
    if let Runner::Workers(pipe) = &runner {
        info!("Starting {} unpack worker threads", ctx.cfg.workers);
        for idx in 0..ctx.cfg.workers {
            let wp = pipe.clone();
            handles.push(thread::spawn(move || worker_loop(idx, wp)));
        }
    }

    let mut seen: usize = 0;
    let mut stream_err: Option<UnpackError> = None;
    let mut archive = Archive::new(reader);

    match archive.entries() {
        Err(e) => {
            ctx.events
                .warn(WarnCode::BadArchive, e.to_string(), None);
            stream_err = Some(UnpackError::BadArchive(e.to_string()));
        }
        Ok(entries) => {
            for next in entries {
                if ctx.abort.load(Ordering::SeqCst) {
                    break;
                }
                let mut tar_ent = match next {
                    Ok(t) => t,
                    Err(e) => {
                        ctx.events
                            .warn(WarnCode::BadArchive, e.to_string(), None);
                        stream_err = Some(UnpackError::BadArchive(e.to_string()));
                        break;
                    }
                };
                if is_meta_type(tar_ent.header().entry_type()) {
                    continue;
                }
                seen += 1;
                let mut entry = Entry::from_tar(&tar_ent);
                debug!("entry '{}' ({})", entry.path, entry.kind.name());

                if !sanitize::check_path(&mut entry, &ctx.cfg, &ctx.events) {
                    // payload is drained by the iterator's next advance
                    ctx.skipped.fetch_add(1, Ordering::SeqCst);
                    continue;
                }
                if !entry.kind.is_supported() {
                    entry.unsupported = true;
                    ctx.events.warn(
                        WarnCode::EntryUnsupported,
                        format!("unsupported entry type: {}", entry.kind.name()),
                        Some(Path::new(&entry.path)),
                    );
                    ctx.skipped.fetch_add(1, Ordering::SeqCst);
                    continue;
                }
                if entry.kind.is_file() && entry.size > 0 {
                    let mut payload =
                        Vec::with_capacity(entry.size.min(1 << 20) as usize);
                    if let Err(e) = tar_ent.read_to_end(&mut payload) {
                        ctx.events
                            .warn(WarnCode::BadArchive, e.to_string(), None);
                        stream_err =
                            Some(UnpackError::BadArchive(e.to_string()));
                        break;
                    }
                    entry.payload = payload;
                }

                // Reserve the target, plus the link target for hard links: a
                // hard link must not start until the entry it points at has
                // fully landed. Symlink targets are literal text, never
                // resolved and never locked.
                let abs = match entry.absolute.clone() {
                    Some(p) => p,
                    None => continue,
                };
                let mut paths = vec![abs.to_string_lossy().into_owned()];
                if entry.kind == EntryKind::Link {
                    if let Some(lp) = &entry.linkpath {
                        let lp = normalize_separators(lp, ctx.cfg.win);
                        paths.push(
                            resolve_under(&ctx.cfg.cwd, &lp)
                                .to_string_lossy()
                                .into_owned(),
                        );
                    }
                }
                let job_ctx = Arc::clone(&ctx);
                reserver.reserve(
                    &paths,
                    Box::new(move |token| {
                        reconcile::process(&entry, &job_ctx);
                        token.release();
                    }),
                );
                if let Runner::Inline(queue) = &runner {
                    drain_inline(queue);
                }
            }
        }
    }

    // Upstream done: wait for in-flight reservations, then stop the pool.
    tracker.end();
    if let Runner::Inline(queue) = &runner {
        drain_inline(queue);
    }
    tracker.wait_idle();
    if let Runner::Workers(pipe) = &runner {
        pipe.set_completed()?;
    }
    for h in handles {
        if let Err(e) = h.join() {
            warn!("Failed thread join: '{:?}'", e);
        }
    }

    if let Some(e) = stream_err {
        return Err(e);
    }
    if let Some(e) = ctx.take_fatal() {
        return Err(e);
    }

    ctx.events.finish();
    Ok(UnpackSummary {
        entries_seen: seen,
        entries_written: ctx.written.load(Ordering::SeqCst),
        entries_skipped: ctx.skipped.load(Ordering::SeqCst),
        entries_errored: ctx.errored.load(Ordering::SeqCst),
        warnings: ctx.events.warnings(),
        lifecycle: ctx
            .events
            .lifecycle()
            .iter()
            .map(|s| s.to_string())
            .collect(),
    })
}
