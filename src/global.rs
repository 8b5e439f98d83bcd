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

//! Process-wide shared engine resources.
//!
//! All engines in a process share one [`GlobalEngine`]: the voice, sample
//! and stream pools, the disk-streaming workers, the background worker and
//! the release pool. The shared instance is created on first use and torn
//! down when the last engine drops its handle; worker threads join on
//! drop.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use tracing::{debug, info};

use crate::config::EngineConfig;
use crate::core::release::{Disposable, ReleaseDrainJob, ReleasePool};
use crate::core::worker::{Worker, WorkerHandle};
use crate::sample::SamplePool;
use crate::stream::{AudioStream, AudioStreamPool};
use crate::voice::VoicePool;
use crate::DEFAULT_RELEASE_POOL_SIZE;

static INSTANCE: Mutex<Weak<GlobalEngine>> = Mutex::new(Weak::new());

/// Shared pools, workers, and the deferred-destruction pipeline.
pub struct GlobalEngine {
    voice_pool: VoicePool,
    sample_pool: SamplePool,
    stream_pool: AudioStreamPool,

    stream_workers: Vec<Worker>,
    next_worker: AtomicUsize,

    background_worker: Worker,
    release_pool: Arc<ReleasePool>,
    drain_job: Arc<ReleaseDrainJob>,
}

impl GlobalEngine {
    /// Returns the process-wide instance, creating it with default sizing
    /// on first use.
    pub fn instance() -> Arc<GlobalEngine> {
        Self::instance_with(&EngineConfig::default())
    }

    /// Returns the process-wide instance, creating it from `config` on
    /// first use. A live instance is returned as-is; its sizing does not
    /// change.
    pub fn instance_with(config: &EngineConfig) -> Arc<GlobalEngine> {
        let mut instance = INSTANCE.lock();
        if let Some(existing) = instance.upgrade() {
            return existing;
        }

        let created = Self::create(config);
        *instance = Arc::downgrade(&created);
        created
    }

    /// Creates an isolated instance that does not touch the process-wide
    /// slot. Useful for embedders that want several independent resource
    /// domains, and for tests.
    pub fn create(config: &EngineConfig) -> Arc<GlobalEngine> {
        let release_pool = Arc::new(ReleasePool::new(DEFAULT_RELEASE_POOL_SIZE));
        let drain_job = Arc::new(ReleaseDrainJob::new(release_pool.clone()));

        let stream_workers: Vec<Worker> = (0..config.num_stream_workers.max(1))
            .map(|i| Worker::new(&format!("sampler-stream-{i}")))
            .collect();
        for worker in &stream_workers {
            worker.start();
        }

        let background_worker = Worker::new("sampler-background");
        background_worker.start();

        info!(
            voices = config.voice_pool_size,
            streams = config.stream_pool_size,
            stream_workers = stream_workers.len(),
            "Global engine created"
        );

        Arc::new(Self {
            voice_pool: VoicePool::new(config.voice_pool_size),
            sample_pool: SamplePool::new(),
            stream_pool: AudioStreamPool::new(
                config.stream_pool_size,
                config.stream_buffer_frames,
            ),
            stream_workers,
            next_worker: AtomicUsize::new(0),
            background_worker,
            release_pool,
            drain_job,
        })
    }

    pub fn voice_pool(&self) -> &VoicePool {
        &self.voice_pool
    }

    pub fn sample_pool(&self) -> &SamplePool {
        &self.sample_pool
    }

    pub fn stream_pool(&self) -> &AudioStreamPool {
        &self.stream_pool
    }

    /// Round-robin pick of a streaming worker for a new stream lease.
    pub fn next_stream_worker(&self) -> WorkerHandle {
        let index = self.next_worker.fetch_add(1, Ordering::Relaxed) % self.stream_workers.len();
        self.stream_workers[index].handle()
    }

    /// Hands an owning handle to the deferred-destruction pipeline. Safe
    /// from the audio thread: the push is lock-free and the drop happens on
    /// the background worker.
    pub fn release_object(&self, object: Disposable) {
        self.release_pool.push(object);

        if self.release_pool.is_half_full() {
            self.background_worker
                .handle()
                .add_job(self.drain_job.clone());
        }
    }

    /// Returns a stream lease to the pool, deferring the drop of its
    /// sample handle. A stream that is still streaming (killed voices)
    /// is wound down first so its worker closes the file handle.
    pub fn return_stream(&self, mut stream: AudioStream) {
        if !stream.is_over() {
            stream.release();
        }
        if let Some(sample) = stream.take_sample() {
            self.release_object(Disposable::Sample(sample));
        }
        self.stream_pool.release(stream);
    }

    /// Pending deferred-destruction objects; observability for tests and
    /// diagnostics.
    pub fn pending_release_objects(&self) -> usize {
        self.release_pool.len()
    }

    /// Drains the release pool on the calling thread. For shutdown paths
    /// and tests; during playback the background worker does this.
    pub fn drain_release_pool(&self) {
        self.release_pool.drain();
    }
}

impl Drop for GlobalEngine {
    fn drop(&mut self) {
        debug!("Global engine shutting down");
        self.sample_pool.stop();
        for worker in &self.stream_workers {
            worker.stop();
        }
        self.background_worker.stop();
        self.release_pool.drain();
    }
}

impl std::fmt::Debug for GlobalEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GlobalEngine")
            .field("active_voices", &self.voice_pool.num_active_voices())
            .field("idle_streams", &self.stream_pool.num_idle())
            .field("pending_release", &self.release_pool.len())
            .finish()
    }
}
