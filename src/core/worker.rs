// Copyright (C) 2026 Michael Wilson <mike@mdwn.dev>
//
// This program is free software: you can redistribute it and/or modify it under
// the terms of the GNU General Public License as published by the Free Software
// Foundation, version 3.
//
// This program is distributed in the hope that it will be useful, but WITHOUT
// ANY WARRANTY; without even the implied warranty of MERCHANTABILITY or FITNESS
// FOR A PARTICULAR PURPOSE. See the GNU General Public License for more details.
//
// You should have received a copy of the GNU General Public License along with
// this program. If not, see <https://www.gnu.org/licenses/>.
//

//! Background job worker.
//!
//! A worker owns one OS thread and a bounded, lock-free job queue. Producers
//! (including the audio thread) enqueue jobs through a cloneable handle; the
//! thread sleeps on a semaphore and runs one job per wake-up.
//!
//! A job may be enqueued again while it is still running. Job
//! implementations must therefore be idempotent: a run that finds nothing
//! left to do returns quickly.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;

use crossbeam::queue::ArrayQueue;
use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::core::sema::Semaphore;

/// Capacity of each worker's job queue.
const JOB_QUEUE_CAPACITY: usize = 1024;

/// A unit of work that runs on a worker thread.
pub trait Job: Send + Sync {
    fn run(&self);
}

struct WorkerShared {
    jobs: ArrayQueue<Arc<dyn Job>>,
    sema: Semaphore,
    running: AtomicBool,
}

/// A background worker thread with a bounded job queue.
pub struct Worker {
    name: String,
    shared: Arc<WorkerShared>,
    thread: Mutex<Option<thread::JoinHandle<()>>>,
}

impl Worker {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            shared: Arc::new(WorkerShared {
                jobs: ArrayQueue::new(JOB_QUEUE_CAPACITY),
                sema: Semaphore::new(0),
                running: AtomicBool::new(false),
            }),
            thread: Mutex::new(None),
        }
    }

    /// Starts the worker thread. Pending jobs from a previous run are
    /// discarded. Does nothing if the worker is already running.
    pub fn start(&self) {
        let mut thread = self.thread.lock();
        if thread.is_some() {
            return;
        }

        self.purge();
        self.shared.running.store(true, Ordering::SeqCst);

        let shared = self.shared.clone();
        let name = self.name.clone();
        let handle = thread::Builder::new()
            .name(self.name.clone())
            .spawn(move || {
                debug!(worker = name.as_str(), "Worker started");
                while shared.running.load(Ordering::SeqCst) {
                    shared.sema.wait();

                    if !shared.running.load(Ordering::SeqCst) {
                        break;
                    }
                    if let Some(job) = shared.jobs.pop() {
                        job.run();
                    }
                }
                debug!(worker = name.as_str(), "Worker stopped");
            })
            .expect("failed to spawn worker thread");

        *thread = Some(handle);
    }

    /// Stops the worker and joins its thread.
    pub fn stop(&self) {
        let handle = {
            let mut thread = self.thread.lock();
            self.shared.running.store(false, Ordering::SeqCst);
            self.shared.sema.notify();
            thread.take()
        };

        if let Some(handle) = handle {
            if handle.join().is_err() {
                warn!(worker = self.name.as_str(), "Worker thread panicked");
            }
        }
    }

    pub fn is_running(&self) -> bool {
        self.shared.running.load(Ordering::SeqCst)
    }

    pub fn has_pending_jobs(&self) -> bool {
        !self.shared.jobs.is_empty()
    }

    /// Discards all queued jobs.
    pub fn purge(&self) {
        while self.shared.jobs.pop().is_some() {}
    }

    /// Returns a cloneable handle for enqueueing jobs.
    pub fn handle(&self) -> WorkerHandle {
        WorkerHandle {
            shared: self.shared.clone(),
        }
    }
}

impl Drop for Worker {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Cloneable producer handle onto a worker's job queue.
///
/// `add_job` is wait-free apart from an uncontended semaphore notify, so it
/// is safe to call from the audio thread.
#[derive(Clone)]
pub struct WorkerHandle {
    shared: Arc<WorkerShared>,
}

impl WorkerHandle {
    /// Enqueues a job and wakes the worker. Returns false if the queue is
    /// saturated and the job was dropped.
    pub fn add_job(&self, job: Arc<dyn Job>) -> bool {
        let ok = self.shared.jobs.push(job).is_ok();
        self.shared.sema.notify();
        ok
    }

    pub fn is_running(&self) -> bool {
        self.shared.running.load(Ordering::SeqCst)
    }
}
