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

//! Deferred destruction of heap-owned objects.
//!
//! Freeing memory is not a real-time operation, so the audio thread never
//! drops an effect chain, modulator, sample handle or actuator directly.
//! Instead it moves the owning handle into this pool; a background worker
//! drains the pool and runs the destructors where latency does not matter.
//!
//! Pushing never allocates: every [`Disposable`] variant wraps an allocation
//! that already exists, and the queue itself is preallocated.

use std::sync::Arc;

use crossbeam::queue::ArrayQueue;

use crate::core::worker::Job;
use crate::effect::{AudioEffect, AudioEffectChain};
use crate::modulation::GenericModulator;
use crate::sample::Sample;

/// An owning handle whose destructor must not run on the audio thread.
pub enum Disposable {
    FxChain(Box<AudioEffectChain>),
    Effect(Box<dyn AudioEffect>),
    Modulator(Box<GenericModulator>),
    Sample(Arc<Sample>),
    Actuator(Box<dyn FnMut() + Send>),
}

/// Bounded queue of owning handles awaiting destruction.
pub struct ReleasePool {
    objects: ArrayQueue<Disposable>,
}

impl ReleasePool {
    pub fn new(capacity: usize) -> Self {
        Self {
            objects: ArrayQueue::new(capacity),
        }
    }

    /// Enqueues a handle for deferred destruction. Safe to call from any
    /// thread, including the audio thread. Returns false if the pool is
    /// saturated; the object is then dropped in place, which is only
    /// acceptable off the audio thread.
    pub fn push(&self, object: Disposable) -> bool {
        self.objects.push(object).is_ok()
    }

    /// True once the pool is at least half full and a drain should be
    /// scheduled.
    pub fn is_half_full(&self) -> bool {
        self.objects.len() >= self.objects.capacity() / 2
    }

    pub fn len(&self) -> usize {
        self.objects.len()
    }

    pub fn is_empty(&self) -> bool {
        self.objects.is_empty()
    }

    /// Pops and drops everything in the pool. Runs on the background
    /// worker, or during teardown.
    pub fn drain(&self) {
        while self.objects.pop().is_some() {}
    }
}

impl Drop for ReleasePool {
    fn drop(&mut self) {
        self.drain();
    }
}

/// Job that drains the release pool on the background worker.
pub struct ReleaseDrainJob {
    pool: Arc<ReleasePool>,
}

impl ReleaseDrainJob {
    pub fn new(pool: Arc<ReleasePool>) -> Self {
        Self { pool }
    }
}

impl Job for ReleaseDrainJob {
    fn run(&self) {
        self.pool.drain();
    }
}
