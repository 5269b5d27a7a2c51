// SPDX-License-Identifier: AGPL-3.0-or-later
// Completion tracker: counts reservations in flight and lets the driver
// block until the upstream has ended and every reservation has released.

// Multi-threading
use std::sync::{Condvar, Mutex};

#[derive(Debug, Default)]
struct TrackState {
    pending: usize,
    ended: bool,
}

#[derive(Debug, Default)]
pub struct Tracker {
    state: Mutex<TrackState>,
    idle: Condvar,
}

impl Tracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// A reservation was taken.
    pub fn enter(&self) {
        let mut st = self.state.lock().unwrap_or_else(|e| e.into_inner());
        st.pending += 1;
    }

    /// A reservation released. Called from inside the scheduler's release.
    pub fn exit(&self) {
        let mut st = self.state.lock().unwrap_or_else(|e| e.into_inner());
        st.pending = st.pending.saturating_sub(1);
        if st.pending == 0 && st.ended {
            self.idle.notify_all();
        }
    }

    /// The upstream parser emitted its done signal.
    pub fn end(&self) {
        let mut st = self.state.lock().unwrap_or_else(|e| e.into_inner());
        st.ended = true;
        if st.pending == 0 {
            self.idle.notify_all();
        }
    }

    pub fn pending(&self) -> usize {
        self.state.lock().unwrap_or_else(|e| e.into_inner()).pending
    }

    /// Block until `ended && pending == 0`.
    pub fn wait_idle(&self) {
        let mut st = self.state.lock().unwrap_or_else(|e| e.into_inner());
        while !(st.ended && st.pending == 0) {
            st = self.idle.wait(st).unwrap_or_else(|e| e.into_inner());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn idle_fires_after_end_and_zero() {
        let t = Arc::new(Tracker::new());
        t.enter();
        t.enter();
        let t2 = Arc::clone(&t);
        let waiter = thread::spawn(move || t2.wait_idle());
        t.exit();
        t.end();
        assert_eq!(t.pending(), 1);
        t.exit();
        waiter.join().expect("waiter thread");
        assert_eq!(t.pending(), 0);
    }
}
