//! The worker pool that runs listeners.
//!
//! Every channel needs two workers blocked on socket reads for as long as it is open, so any
//! bound on the pool smaller than twice the number of open channels would let new channels
//! starve old ones of forwarding. [`WorkerPool`] is therefore unbounded: each task gets its own
//! named OS thread, created on demand, and the thread exits when the task returns.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

/// An unbounded, cached pool of named threads.
///
/// Cloning a pool yields a handle to the same counters.
#[derive(Debug, Clone, Default)]
pub struct WorkerPool {
    active: Arc<AtomicUsize>,
    spawned: Arc<AtomicUsize>,
}

/// Decrements the active count when a worker finishes, even by panicking.
struct ActiveGuard(Arc<AtomicUsize>);

impl Drop for ActiveGuard {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::AcqRel);
    }
}

impl WorkerPool {
    pub fn new() -> WorkerPool {
        WorkerPool::default()
    }

    /// Runs `task` on a new thread called `name`.
    pub fn spawn<F>(&self, name: String, task: F) -> std::io::Result<()>
    where
        F: FnOnce() + Send + 'static,
    {
        self.active.fetch_add(1, Ordering::AcqRel);
        let guard = ActiveGuard(self.active.clone());
        // on failure the closure, and with it the guard, is dropped by `spawn`
        std::thread::Builder::new().name(name).spawn(move || {
            let _guard = guard;
            task();
        })?;
        self.spawned.fetch_add(1, Ordering::AcqRel);
        Ok(())
    }

    /// Workers currently running.
    pub fn active(&self) -> usize {
        self.active.load(Ordering::Acquire)
    }

    /// Workers started since the pool was created.
    pub fn spawned(&self) -> usize {
        self.spawned.load(Ordering::Acquire)
    }
}
