// SPDX-License-Identifier: AGPL-3.0-or-later
// Path reservation scheduler. Each reservation locks a set of paths
// exclusively plus every ancestor directory of those paths in shared mode:
// many handlers may sit inside one directory at once (they only need the
// directory to not be replaced underneath them), but a handler that targets
// the directory itself must wait for all of them. Queues are FIFO per path,
// so two archive members with the same name materialize in archive order.

use crate::files::path::{ancestors, cache_key};
use crate::unpack::track::Tracker;

// Multi-threading
use std::sync::{Arc, Mutex};
// Queue bookkeeping
use std::collections::{HashMap, VecDeque};
// Logging
use log::debug;

pub type Job = Box<dyn FnOnce() + Send>;
pub type Handler = Box<dyn FnOnce(Release) + Send>;
type HandlerId = u64;

/// Sentinel queue key used when the platform cannot support path-level
/// parallelism (8.3 short names, un-precomputable case folding). Every
/// reservation then serializes through this one queue.
const GLOBAL: &str = "//global-reserve";

#[derive(Debug)]
enum Slot {
    /// One handler owns the path itself.
    Exclusive(HandlerId),
    /// Any number of handlers occupy the path as an ancestor directory.
    Shared(Vec<HandlerId>),
}

struct Pending {
    paths: Vec<String>,
    dirs: Vec<String>,
    run: Option<Handler>,
    running: bool,
}

#[derive(Default)]
struct ReserveState {
    queues: HashMap<String, VecDeque<Slot>>,
    pending: HashMap<HandlerId, Pending>,
    next_id: HandlerId,
}

/// Single-use release token handed to every handler. Dropping it without
/// calling `release` still releases (a handler that unwinds must not stall
/// every overlapping reservation forever).
pub struct Release {
    reserver: Arc<Reserver>,
    id: HandlerId,
    fired: bool,
}

impl Release {
    pub fn release(mut self) {
        self.fire();
    }

    fn fire(&mut self) {
        if !self.fired {
            self.fired = true;
            self.reserver.release_id(self.id);
        }
    }
}

impl Drop for Release {
    fn drop(&mut self) {
        if !self.fired {
            debug!("reservation {} released on drop", self.id);
            self.fire();
        }
    }
}

pub struct Reserver {
    state: Mutex<ReserveState>,
    dispatch: Box<dyn Fn(Job) + Send + Sync>,
    tracker: Arc<Tracker>,
    single_path: bool,
    win: bool,
}

impl Reserver {
    /// `dispatch` hands an eligible handler to whatever runs it (worker pipe
    /// or an inline queue). It is never invoked while the scheduler lock is
    /// held, and never recursively from a handler's own `reserve` call.
    pub fn new(
                dispatch: Box<dyn Fn(Job) + Send + Sync>,
                tracker: Arc<Tracker>,
                win: bool
            ) -> Self {
        Self {
            state: Mutex::new(ReserveState::default()),
            dispatch,
            tracker,
            single_path: cfg!(windows),
            win,
        }
    }

    /// Force (or undo) the degraded single-queue mode regardless of host.
    pub fn with_single_path(mut self, single_path: bool) -> Self {
        self.single_path = single_path;
        self
    }

    /// Queue `handler` behind every path in `paths` (exclusive) and every
    /// ancestor of those paths (shared). Returns whether the handler was
    /// dispatched immediately.
    pub fn reserve(self: &Arc<Self>, paths: &[String], handler: Handler) -> bool {
        self.tracker.enter();
        let (keys, dirs) = self.keys_for(paths);
        let mut ready: Vec<Job> = Vec::new();
        let started;
        {
            let mut st = self.state.lock().unwrap_or_else(|e| e.into_inner());
            let id = st.next_id;
            st.next_id += 1;
            for k in &keys {
                st.queues
                    .entry(k.clone())
                    .or_default()
                    .push_back(Slot::Exclusive(id));
            }
            for d in &dirs {
                let q = st.queues.entry(d.clone()).or_default();
                match q.back_mut() {
                    Some(Slot::Shared(set)) => set.push(id),
                    _ => q.push_back(Slot::Shared(vec![id])),
                }
            }
            st.pending.insert(
                id,
                Pending {
                    paths: keys,
                    dirs,
                    run: Some(handler),
                    running: false,
                },
            );
            started = self.try_start(&mut st, id, &mut ready);
        }
        for job in ready {
            (self.dispatch)(job);
        }
        started
    }

    fn keys_for(&self, paths: &[String]) -> (Vec<String>, Vec<String>) {
        if self.single_path {
            return (vec![GLOBAL.to_string()], Vec::new());
        }
        let mut keys: Vec<String> = Vec::new();
        for p in paths {
            let k = cache_key(p, self.win);
            if !keys.contains(&k) {
                keys.push(k);
            }
        }
        let mut dirs: Vec<String> = Vec::new();
        for k in &keys {
            for d in ancestors(k) {
                if !dirs.contains(&d) && !keys.contains(&d) {
                    dirs.push(d);
                }
            }
        }
        (keys, dirs)
    }

    fn release_id(self: &Arc<Self>, id: HandlerId) {
        let mut ready: Vec<Job> = Vec::new();
        {
            let mut st = self.state.lock().unwrap_or_else(|e| e.into_inner());
            let record = match st.pending.remove(&id) {
                Some(p) => p,
                // double release; the token makes this unreachable
                None => return,
            };
            let mut affected: Vec<String> = Vec::new();
            for k in record.paths.iter().chain(record.dirs.iter()) {
                if remove_from_queue(&mut st.queues, k, id) {
                    affected.push(k.clone());
                }
            }
            let mut cands: Vec<HandlerId> = Vec::new();
            for k in &affected {
                if let Some(q) = st.queues.get(k) {
                    match q.front() {
                        Some(Slot::Exclusive(h)) => cands.push(*h),
                        Some(Slot::Shared(set)) => cands.extend(set.iter().copied()),
                        None => {}
                    }
                }
            }
            // ids are allocation-ordered, so this keeps dispatch FIFO
            cands.sort_unstable();
            cands.dedup();
            for c in cands {
                self.try_start(&mut st, c, &mut ready);
            }
            if ready.is_empty() && !st.pending.is_empty() {
                debug!(
                    "released {} with {} reservation(s) still queued",
                    id,
                    st.pending.len()
                );
            }
        }
        for job in ready {
            (self.dispatch)(job);
        }
        self.tracker.exit();
    }

    /// Dispatch `id` if every one of its queues has it at the head. Pushes
    /// the wrapped job onto `ready`; the caller runs it after unlocking.
    fn try_start(
                self: &Arc<Self>,
                st: &mut ReserveState,
                id: HandlerId,
                ready: &mut Vec<Job>
            ) -> bool {
        let eligible = match st.pending.get(&id) {
            Some(p) if !p.running && p.run.is_some() => at_heads(&st.queues, p, id),
            _ => false,
        };
        if !eligible {
            return false;
        }
        let p = match st.pending.get_mut(&id) {
            Some(p) => p,
            None => return false,
        };
        p.running = true;
        let handler = match p.run.take() {
            Some(h) => h,
            None => return false,
        };
        let token = Release {
            reserver: Arc::clone(self),
            id,
            fired: false,
        };
        ready.push(Box::new(move || handler(token)));
        true
    }
}

fn at_heads(queues: &HashMap<String, VecDeque<Slot>>, p: &Pending, id: HandlerId) -> bool {
    let own = p.paths.iter().all(|k| {
        matches!(
            queues.get(k).and_then(|q| q.front()),
            Some(Slot::Exclusive(h)) if *h == id
        )
    });
    let shared = p.dirs.iter().all(|d| {
        match queues.get(d).and_then(|q| q.front()) {
            Some(Slot::Shared(set)) => set.contains(&id),
            _ => false,
        }
    });
    own && shared
}

/// Remove `id` from the queue at `key`. An emptied shared slot is popped; an
/// emptied queue is dropped from the map. Returns whether anything changed.
fn remove_from_queue(
            queues: &mut HashMap<String, VecDeque<Slot>>,
            key: &str,
            id: HandlerId
        ) -> bool {
    let q = match queues.get_mut(key) {
        Some(q) => q,
        None => return false,
    };
    let pos = q.iter().position(|slot| match slot {
        Slot::Exclusive(h) => *h == id,
        Slot::Shared(set) => set.contains(&id),
    });
    let mut removed = false;
    if let Some(pos) = pos {
        let drop_slot = match &mut q[pos] {
            Slot::Exclusive(_) => true,
            Slot::Shared(set) => {
                set.retain(|h| *h != id);
                set.is_empty()
            }
        };
        if drop_slot {
            q.remove(pos);
        }
        removed = true;
    }
    if q.is_empty() {
        queues.remove(key);
    }
    removed
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;
    use std::sync::{Arc, Mutex};

    struct Rig {
        reserver: Arc<Reserver>,
        queue: Arc<Mutex<VecDeque<Job>>>,
        started: Arc<Mutex<Vec<&'static str>>>,
        tokens: Arc<Mutex<Vec<(&'static str, Release)>>>,
    }

    impl Rig {
        fn new() -> Rig {
            let queue: Arc<Mutex<VecDeque<Job>>> = Arc::new(Mutex::new(VecDeque::new()));
            let q2 = Arc::clone(&queue);
            let tracker = Arc::new(Tracker::new());
            let reserver = Arc::new(
                Reserver::new(
                    Box::new(move |job| q2.lock().unwrap().push_back(job)),
                    tracker,
                    false,
                )
                .with_single_path(false),
            );
            Rig {
                reserver,
                queue,
                started: Arc::new(Mutex::new(Vec::new())),
                tokens: Arc::new(Mutex::new(Vec::new())),
            }
        }

        fn reserve(&self, name: &'static str, paths: &[&str]) -> bool {
            let started = Arc::clone(&self.started);
            let tokens = Arc::clone(&self.tokens);
            let paths: Vec<String> = paths.iter().map(|s| s.to_string()).collect();
            self.reserver.reserve(
                &paths,
                Box::new(move |rel| {
                    started.lock().unwrap().push(name);
                    tokens.lock().unwrap().push((name, rel));
                }),
            )
        }

        /// Run every dispatched job (handlers park their release tokens).
        fn drain(&self) {
            loop {
                let job = self.queue.lock().unwrap().pop_front();
                match job {
                    Some(j) => j(),
                    None => break,
                }
            }
        }

        fn release(&self, name: &'static str) {
            let token = {
                let mut tokens = self.tokens.lock().unwrap();
                let idx = tokens
                    .iter()
                    .position(|(n, _)| *n == name)
                    .expect("token present");
                tokens.remove(idx).1
            };
            token.release();
            self.drain();
        }

        fn started(&self) -> Vec<&'static str> {
            self.started.lock().unwrap().clone()
        }
    }

    #[test]
    fn same_path_runs_fifo() {
        let rig = Rig::new();
        assert!(rig.reserve("first", &["/x/a"]));
        assert!(!rig.reserve("second", &["/x/a"]));
        rig.drain();
        assert_eq!(rig.started(), vec!["first"]);
        rig.release("first");
        assert_eq!(rig.started(), vec!["first", "second"]);
    }

    #[test]
    fn disjoint_paths_run_concurrently() {
        let rig = Rig::new();
        rig.reserve("a", &["/x/a"]);
        rig.reserve("b", &["/x/b"]);
        rig.drain();
        // both hold shared slots on /x and exclusive slots on disjoint leaves
        assert_eq!(rig.started(), vec!["a", "b"]);
    }

    #[test]
    fn directory_waits_for_occupants() {
        let rig = Rig::new();
        rig.reserve("occupant", &["/x/dir/f"]);
        rig.reserve("dir", &["/x/dir"]);
        rig.drain();
        assert_eq!(rig.started(), vec!["occupant"]);
        rig.release("occupant");
        assert_eq!(rig.started(), vec!["occupant", "dir"]);
    }

    #[test]
    fn occupant_waits_for_directory() {
        let rig = Rig::new();
        rig.reserve("dir", &["/x/dir"]);
        rig.reserve("occupant", &["/x/dir/f"]);
        rig.drain();
        assert_eq!(rig.started(), vec!["dir"]);
        rig.release("dir");
        assert_eq!(rig.started(), vec!["dir", "occupant"]);
    }

    #[test]
    fn link_waits_for_its_target() {
        let rig = Rig::new();
        rig.reserve("target", &["/x/a"]);
        rig.reserve("link", &["/x/b", "/x/a"]);
        rig.reserve("after", &["/x/c"]);
        rig.drain();
        // the link needs /x/a exclusively, held by "target"; /x/c is free
        assert_eq!(rig.started(), vec!["target", "after"]);
        rig.release("target");
        assert_eq!(rig.started(), vec!["target", "after", "link"]);
    }

    #[test]
    fn case_folded_paths_collide() {
        let rig = Rig::new();
        rig.reserve("lower", &["/x/name"]);
        rig.reserve("upper", &["/x/NAME"]);
        rig.drain();
        assert_eq!(rig.started(), vec!["lower"]);
        rig.release("lower");
        assert_eq!(rig.started(), vec!["lower", "upper"]);
    }

    #[test]
    fn release_on_drop_unblocks() {
        let rig = Rig::new();
        let dropped = {
            let paths = vec!["/x/a".to_string()];
            rig.reserver.reserve(&paths, Box::new(|_rel| { /* token dropped */ }))
        };
        assert!(dropped);
        rig.reserve("next", &["/x/a"]);
        rig.drain();
        assert_eq!(rig.started(), vec!["next"]);
    }

    #[test]
    fn single_path_mode_serializes_everything() {
        let queue: Arc<Mutex<VecDeque<Job>>> = Arc::new(Mutex::new(VecDeque::new()));
        let q2 = Arc::clone(&queue);
        let reserver = Arc::new(
            Reserver::new(
                Box::new(move |job| q2.lock().unwrap().push_back(job)),
                Arc::new(Tracker::new()),
                false,
            )
            .with_single_path(true),
        );
        let started = Arc::new(Mutex::new(Vec::new()));
        for name in ["a", "b"] {
            let s = Arc::clone(&started);
            reserver.reserve(
                &[format!("/x/{}", name)],
                Box::new(move |rel| {
                    s.lock().unwrap().push(name);
                    rel.release();
                }),
            );
        }
        loop {
            let job = queue.lock().unwrap().pop_front();
            match job {
                Some(j) => j(),
                None => break,
            }
        }
        // disjoint paths, but the sentinel queue forces strict order
        assert_eq!(*started.lock().unwrap(), vec!["a", "b"]);
    }
}
