// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2025 Oxide Computer Company

//! A single deferred work item backed by a dedicated thread.
//!
//! Queuing an item which is already pending is a no-op, so any number
//! of events arriving before the worker runs collapse into one run.

use super::sync::KCondvar;
use super::sync::KMutex;
use alloc::boxed::Box;
use alloc::string::String;
use alloc::sync::Arc;
use esw_tc_api::TcError;
use std::thread::JoinHandle;

#[derive(Debug, Default)]
struct WorkState {
    pending: bool,
    running: bool,
    shutdown: bool,
    runs: u64,
}

struct WorkShared {
    state: KMutex<WorkState>,
    cv: KCondvar,
}

pub struct DeferredWork {
    name: String,
    shared: Arc<WorkShared>,
    handle: Option<JoinHandle<()>>,
}

impl DeferredWork {
    /// Create the work item and start its thread.
    pub fn new<F>(name: &str, f: F) -> Result<Self, TcError>
    where
        F: Fn() + Send + 'static,
    {
        let shared = Arc::new(WorkShared {
            state: KMutex::new(WorkState::default()),
            cv: KCondvar::new(),
        });
        let worker = shared.clone();
        let f: Box<dyn Fn() + Send> = Box::new(f);

        let handle = std::thread::Builder::new()
            .name(name.into())
            .spawn(move || work_loop(&worker, f))
            .map_err(|e| {
                TcError::ResourceExhausted(format!("spawn {name}: {e}"))
            })?;

        Ok(Self { name: name.into(), shared, handle: Some(handle) })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Schedule a run. Returns `false` if a run was already pending.
    pub fn queue(&self) -> bool {
        let mut state = self.shared.state.lock();
        if state.pending || state.shutdown {
            return false;
        }
        state.pending = true;
        self.shared.cv.notify_all();
        true
    }

    /// Wait until no run is pending or in progress.
    pub fn flush(&self) {
        let mut state = self.shared.state.lock();
        while (state.pending || state.running) && !state.shutdown {
            state = self.shared.cv.wait(state);
        }
    }

    /// Number of completed runs.
    pub fn runs(&self) -> u64 {
        self.shared.state.lock().runs
    }

    /// Drop any pending run, wait for one in progress, and stop the
    /// thread.
    pub fn cancel_sync(mut self) {
        self.stop();
    }

    fn stop(&mut self) {
        {
            let mut state = self.shared.state.lock();
            state.pending = false;
            state.shutdown = true;
            self.shared.cv.notify_all();
        }

        if let Some(handle) = self.handle.take() {
            // The work function may drop the last reference to the
            // owner of this item, stopping it from the worker itself.
            if handle.thread().id() != std::thread::current().id() {
                // A panic in the work function has already been
                // reported on the worker thread.
                let _ = handle.join();
            }
        }
    }
}

impl Drop for DeferredWork {
    fn drop(&mut self) {
        self.stop();
    }
}

fn work_loop(shared: &WorkShared, f: Box<dyn Fn() + Send>) {
    loop {
        {
            let mut state = shared.state.lock();
            while !state.pending && !state.shutdown {
                state = shared.cv.wait(state);
            }

            if state.shutdown {
                return;
            }

            state.pending = false;
            state.running = true;
        }

        f();

        let mut state = shared.state.lock();
        state.running = false;
        state.runs += 1;
        shared.cv.notify_all();
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::sync::atomic::AtomicU32;
    use std::sync::atomic::Ordering;

    #[test]
    fn queue_runs_once_per_flush() {
        let hits = Arc::new(AtomicU32::new(0));
        let h = hits.clone();
        let work = DeferredWork::new("test-work", move || {
            h.fetch_add(1, Ordering::SeqCst);
        })
        .unwrap();

        assert!(work.queue());
        work.flush();
        assert_eq!(hits.load(Ordering::SeqCst), 1);
        assert_eq!(work.runs(), 1);

        assert!(work.queue());
        work.flush();
        assert_eq!(hits.load(Ordering::SeqCst), 2);
        work.cancel_sync();
    }

    #[test]
    fn cancel_drops_pending() {
        let gate = Arc::new(KMutex::new(()));
        let hits = Arc::new(AtomicU32::new(0));
        let (g, h) = (gate.clone(), hits.clone());
        let work = DeferredWork::new("test-cancel", move || {
            let _g = g.lock();
            h.fetch_add(1, Ordering::SeqCst);
        })
        .unwrap();

        let held = gate.lock();
        work.queue();
        // Either the first run is parked on the gate or has not
        // started; a second queue may or may not coalesce with it.
        work.queue();
        drop(held);
        work.cancel_sync();
        assert!(hits.load(Ordering::SeqCst) <= 2);
    }
}
