//! Debounced background work
//!
//! A [`Debouncer`] holds at most one pending job. Scheduling replaces the pending
//! job and restarts the quiet period, so a burst of triggers runs once with the
//! last submitted job. Jobs run on a worker thread that is started on demand and
//! exits once nothing is pending.

use parking_lot::{Condvar, Mutex, MutexGuard};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use std::thread::{JoinHandle, ThreadId};
use std::time::{Duration, Instant};

type Job = Box<dyn FnOnce() + Send + 'static>;

struct Pending {
    deadline: Instant,
    job: Job,
}

struct State {
    pending: Option<Pending>,
    running: bool,
    worker_alive: bool,
    worker: Option<(ThreadId, JoinHandle<()>)>,
    shutdown: bool,
    executed: u64,
}

struct Shared {
    label: String,
    delay: Duration,
    state: Mutex<State>,
    changed: Condvar,
}

/// Single-slot debounced scheduler
pub struct Debouncer {
    shared: Arc<Shared>,
}

impl Debouncer {
    pub fn new(label: impl Into<String>, delay: Duration) -> Self {
        Self {
            shared: Arc::new(Shared {
                label: label.into(),
                delay,
                state: Mutex::new(State {
                    pending: None,
                    running: false,
                    worker_alive: false,
                    worker: None,
                    shutdown: false,
                    executed: 0,
                }),
                changed: Condvar::new(),
            }),
        }
    }

    pub fn delay(&self) -> Duration {
        self.shared.delay
    }

    /// Replace the pending job and restart the quiet period
    pub fn schedule(&self, job: impl FnOnce() + Send + 'static) {
        let mut state = self.shared.state.lock();
        if state.shutdown {
            drop(state);
            run_job(&self.shared.label, Box::new(job));
            return;
        }
        state.pending = Some(Pending {
            deadline: Instant::now() + self.shared.delay,
            job: Box::new(job),
        });
        if state.worker_alive {
            self.shared.changed.notify_all();
            return;
        }

        let shared = self.shared.clone();
        let spawned = std::thread::Builder::new()
            .name(format!("filebundle-{}", self.shared.label))
            .spawn(move || worker_loop(shared));
        match spawned {
            Ok(handle) => {
                state.worker_alive = true;
                state.worker = Some((handle.thread().id(), handle));
            }
            Err(e) => {
                tracing::warn!(
                    scheduler = %self.shared.label,
                    "Failed to start scheduler thread, running job inline: {}",
                    e
                );
                let pending = state.pending.take();
                drop(state);
                if let Some(pending) = pending {
                    run_job(&self.shared.label, pending.job);
                }
            }
        }
    }

    /// Drop the pending job, if any. A job that already started keeps running.
    pub fn cancel(&self) -> bool {
        let cancelled = self.shared.state.lock().pending.take().is_some();
        if cancelled {
            self.shared.changed.notify_all();
        }
        cancelled
    }

    pub fn is_pending(&self) -> bool {
        self.shared.state.lock().pending.is_some()
    }

    /// Number of jobs run so far
    pub fn executed(&self) -> u64 {
        self.shared.state.lock().executed
    }

    /// Block until nothing is pending or running
    pub fn wait_idle(&self) {
        let mut state = self.shared.state.lock();
        if is_worker_thread(&state) {
            return;
        }
        while state.pending.is_some() || state.running {
            self.shared.changed.wait(&mut state);
        }
    }
}

fn is_worker_thread(state: &MutexGuard<'_, State>) -> bool {
    state
        .worker
        .as_ref()
        .map(|(id, _)| *id == std::thread::current().id())
        .unwrap_or(false)
}

fn worker_loop(shared: Arc<Shared>) {
    let mut state = shared.state.lock();
    loop {
        let Some(deadline) = state.pending.as_ref().map(|p| p.deadline) else {
            state.worker_alive = false;
            shared.changed.notify_all();
            return;
        };
        if !state.shutdown && Instant::now() < deadline {
            shared.changed.wait_until(&mut state, deadline);
            continue;
        }
        let Some(pending) = state.pending.take() else {
            continue;
        };
        state.running = true;
        MutexGuard::unlocked(&mut state, || run_job(&shared.label, pending.job));
        state.running = false;
        state.executed += 1;
        shared.changed.notify_all();
    }
}

fn run_job(label: &str, job: Job) {
    if catch_unwind(AssertUnwindSafe(job)).is_err() {
        tracing::error!(scheduler = %label, "Scheduled job panicked");
    }
}

impl Drop for Debouncer {
    /// Runs any pending job now and waits for the worker to finish.
    fn drop(&mut self) {
        let (pending, worker, on_worker) = {
            let mut state = self.shared.state.lock();
            state.shutdown = true;
            let on_worker = is_worker_thread(&state);
            let pending = state.pending.take();
            let worker = state.worker.take();
            self.shared.changed.notify_all();
            (pending, worker, on_worker)
        };

        if let Some(pending) = pending {
            tracing::debug!(scheduler = %self.shared.label, "Draining pending job on teardown");
            run_job(&self.shared.label, pending.job);
            self.shared.state.lock().executed += 1;
        }
        if let Some((_, handle)) = worker {
            if !on_worker && handle.join().is_err() {
                tracing::error!(scheduler = %self.shared.label, "Scheduler thread panicked");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_burst_runs_last_job_once() {
        let debouncer = Debouncer::new("test", Duration::from_millis(30));
        let runs = Arc::new(AtomicUsize::new(0));
        let last = Arc::new(AtomicUsize::new(0));
        for i in 1..=5 {
            let runs = runs.clone();
            let last = last.clone();
            debouncer.schedule(move || {
                runs.fetch_add(1, Ordering::SeqCst);
                last.store(i, Ordering::SeqCst);
            });
        }
        debouncer.wait_idle();
        assert_eq!(runs.load(Ordering::SeqCst), 1);
        assert_eq!(last.load(Ordering::SeqCst), 5);
        assert_eq!(debouncer.executed(), 1);
    }

    #[test]
    fn test_cancel_drops_pending_job() {
        let debouncer = Debouncer::new("test", Duration::from_secs(60));
        let runs = Arc::new(AtomicUsize::new(0));
        let counter = runs.clone();
        debouncer.schedule(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        assert!(debouncer.is_pending());
        assert!(debouncer.cancel());
        assert!(!debouncer.cancel());
        debouncer.wait_idle();
        drop(debouncer);
        assert_eq!(runs.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_drop_drains_pending_job() {
        let debouncer = Debouncer::new("test", Duration::from_secs(60));
        let runs = Arc::new(AtomicUsize::new(0));
        let counter = runs.clone();
        debouncer.schedule(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        drop(debouncer);
        assert_eq!(runs.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_panicking_job_does_not_stop_scheduler() {
        let debouncer = Debouncer::new("test", Duration::from_millis(1));
        debouncer.schedule(|| panic!("boom"));
        debouncer.wait_idle();

        let runs = Arc::new(AtomicUsize::new(0));
        let counter = runs.clone();
        debouncer.schedule(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        debouncer.wait_idle();
        assert_eq!(runs.load(Ordering::SeqCst), 1);
    }
}
