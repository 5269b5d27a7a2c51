// SPDX-License-Identifier: AGPL-3.0-or-later
use crate::unpack::error::UnpackError;

// Multi-threading
use std::sync::{Arc, Mutex};
use std::{thread, time::Duration};
pub use flume::{Receiver, Sender, TryRecvError};
use flume::unbounded;
// Logging
use log::debug;

pub fn set_mutex<T: Copy>(
            mutex: &Arc<Mutex<T>>, val: T
        ) -> Result<(), UnpackError> {
    let mut lock = mutex.lock()?;
    * lock = val;
    drop(lock);
    Ok(())
}

pub fn get_mutex<T: Copy>(mutex: &Arc<Mutex<T>>) -> Result<T, UnpackError> {
    let lock = mutex.lock()?;
    let val = * lock;
    drop(lock);
    return Ok(val);
}

/// Non-blocking (but patient -- i.e. thread sleeps when try_recv fails)
/// attempt to take (try_recv) operation, which aborts when the `completed`
/// semaphore is set to `true`
fn take_try_many_inner<T>(
            rx: &Receiver<T>,
            max_try: u32, wait: Duration,
            completed: &Arc<Mutex<bool>>
        ) -> Result<T, UnpackError> {
    let mut ct = 0;
    loop {
        match rx.try_recv() {
            Ok(input) => {
                return Ok(input);
            }
            Err(error) => {
                if (ct > max_try) || get_mutex(completed)? {
                    return Err(error.into());
                }
                ct += 1;
                thread::sleep(wait);
            }
        }
    }
}

/// Work-distribution channel shared between the driver and the unpack
/// workers. The `completed` semaphore tells idle workers when the upstream
/// has drained so they can shut down instead of retrying forever.
pub struct Pipe<T> {
    pub tx: Sender<T>,
    pub rx: Receiver<T>,
    pub completed: Arc<Mutex<bool>>
}

// hand-rolled so that cloning never demands T: Clone (jobs are not)
impl<T> Clone for Pipe<T> {
    fn clone(&self) -> Self {
        Self {
            tx: self.tx.clone(),
            rx: self.rx.clone(),
            completed: Arc::clone(&self.completed)
        }
    }
}

impl<T> Pipe<T> {
    pub fn new() -> Self {
        let (tx, rx) = unbounded();
        Self {
            tx, rx, completed: Arc::new(Mutex::new(false))
        }
    }

    pub fn input(&self) -> Sender<T> { self.tx.clone() }

    pub fn output(&self) -> Receiver<T> { self.rx.clone() }

    pub fn take_try_many(&self) -> Result<T, UnpackError> {
        return take_try_many_inner(
            &self.rx, 100, Duration::from_millis(16), &self.completed
        );
    }

    pub fn set_completed(&self) -> Result<(), UnpackError> {
        debug!("pipe marked completed");
        set_mutex(&self.completed, true)
    }

    pub fn get_completed(&self) -> Result<bool, UnpackError> {
        get_mutex(&self.completed)
    }
}

impl<T> Default for Pipe<T> {
    fn default() -> Self {
        Self::new()
    }
}
