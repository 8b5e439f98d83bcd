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

//! Samples and the process-wide sample cache.
//!
//! A [`Sample`] is an immutable region of an audio file, identified by a
//! stable hash of `(path, start, stop)`. Its preload buffer holds the first
//! frames of the region in memory so a trigger can start producing audio
//! instantly while a disk stream warms up behind it.
//!
//! Preloading runs on the pool's own worker thread. The audio thread only
//! ever asks `is_preloaded` (an atomic read) and reads the preload buffer;
//! it never forces a load.

use std::collections::hash_map::DefaultHasher;
use std::collections::HashMap;
use std::hash::{Hash, Hasher};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock};

use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::audio_file::{AudioFile, AudioFileError, AudioFormat};
use crate::core::buffer::StereoBuffer;
use crate::core::worker::{Job, Worker};
use crate::MAX_PRELOAD_BUFFER_SIZE;

/// Error produced while registering or preloading samples.
#[derive(Debug, thiserror::Error)]
pub enum SampleError {
    #[error("audio file error: {0}")]
    File(#[from] AudioFileError),

    #[error("sample preload produced no frames: {0}")]
    EmptyPreload(String),
}

struct PreloadBuffer {
    buffer: StereoBuffer,
    frames: usize,
}

/// An immutable region of an audio file plus its in-memory preload head.
///
/// Samples are shared: any number of live streams may reference the same
/// sample. The engine keeps a referenced sample alive by deferring the drop
/// of its handle to the release pool.
pub struct Sample {
    path: PathBuf,
    format: AudioFormat,
    start_pos: u64,
    /// Stop frame; 0 means "to the end of the file".
    stop_pos: u64,
    hash: u64,
    preload: OnceLock<PreloadBuffer>,
    /// Source sample rate (f32 bits), learned during preload.
    sample_rate: AtomicU32,
}

impl Sample {
    pub fn new(path: &Path, format: AudioFormat, start_pos: u64, stop_pos: u64) -> Self {
        Self {
            path: path.to_path_buf(),
            format,
            start_pos,
            stop_pos,
            hash: Self::compute_hash(path, start_pos, stop_pos),
            preload: OnceLock::new(),
            sample_rate: AtomicU32::new(0),
        }
    }

    /// Stable identity hash. Two samples from the same file with the same
    /// region hash identically; differing regions differ.
    pub fn compute_hash(path: &Path, start_pos: u64, stop_pos: u64) -> u64 {
        let mut hasher = DefaultHasher::new();
        path.hash(&mut hasher);
        start_pos.hash(&mut hasher);
        stop_pos.hash(&mut hasher);
        hasher.finish()
    }

    pub fn hash(&self) -> u64 {
        self.hash
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn format(&self) -> AudioFormat {
        self.format
    }

    pub fn start_position(&self) -> u64 {
        self.start_pos
    }

    pub fn stop_position(&self) -> u64 {
        self.stop_pos
    }

    /// Returns a fresh, unopened decoder over the sample's file. Streams
    /// call this on their worker so each holds an exclusive OS handle.
    pub fn audio_file(&self) -> AudioFile {
        AudioFile::new(&self.path, self.format)
    }

    /// Source sample rate. Zero until the sample has been preloaded.
    pub fn sample_rate(&self) -> f32 {
        f32::from_bits(self.sample_rate.load(Ordering::Acquire))
    }

    pub fn is_preloaded(&self) -> bool {
        self.preload.get().map_or(false, |p| p.frames > 0)
    }

    pub fn num_preloaded_frames(&self) -> usize {
        self.preload.get().map_or(0, |p| p.frames)
    }

    /// The preloaded head of the region, if preloading has happened.
    pub fn preloaded(&self) -> Option<&StereoBuffer> {
        self.preload.get().map(|p| &p.buffer)
    }

    /// Reads up to `num_frames` frames (clamped to the region and to
    /// [`MAX_PRELOAD_BUFFER_SIZE`]) from the start of the region into
    /// memory. Runs on the sample pool's worker; idempotent.
    pub fn preload(&self, num_frames: usize) -> Result<(), SampleError> {
        if self.preload.get().is_some() {
            return Ok(());
        }

        let mut file = self.audio_file();
        file.open()?;
        file.seek(self.start_pos)?;

        let mut frames_to_preload = num_frames.min(MAX_PRELOAD_BUFFER_SIZE);
        if self.stop_pos > self.start_pos {
            frames_to_preload = frames_to_preload.min((self.stop_pos - self.start_pos) as usize);
        }

        let mut buffer = StereoBuffer::new(frames_to_preload);
        let (left, right) = buffer.channels_mut();
        let frames = file.read(frames_to_preload, left, right);

        self.sample_rate
            .store(file.sample_rate().to_bits(), Ordering::Release);
        file.close();

        if frames == 0 {
            return Err(SampleError::EmptyPreload(self.path.display().to_string()));
        }

        // A concurrent preload may have won the race; either buffer is fine.
        let _ = self.preload.set(PreloadBuffer { buffer, frames });

        debug!(
            path = ?self.path,
            frames,
            start = self.start_pos,
            stop = self.stop_pos,
            "Sample preloaded"
        );
        Ok(())
    }
}

impl std::fmt::Debug for Sample {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Sample")
            .field("path", &self.path)
            .field("start", &self.start_pos)
            .field("stop", &self.stop_pos)
            .field("preloaded_frames", &self.num_preloaded_frames())
            .finish()
    }
}

struct SampleRegistry {
    by_hash: HashMap<u64, Arc<Sample>>,
    /// Append-only registration order, walked by the preload job.
    ordered: Vec<Arc<Sample>>,
}

struct PoolInner {
    registry: Mutex<SampleRegistry>,
    num_samples: AtomicUsize,
    num_preloaded: AtomicUsize,
    preload_frames: AtomicUsize,
}

impl Job for PoolInner {
    fn run(&self) {
        let frames = self.preload_frames.load(Ordering::SeqCst);
        let mut index = 0;

        loop {
            // Hold the lock only long enough to fetch the next handle.
            let sample = {
                let registry = self.registry.lock();
                match registry.ordered.get(index) {
                    Some(sample) => sample.clone(),
                    None => break,
                }
            };

            if !sample.is_preloaded() {
                match sample.preload(frames) {
                    Ok(()) => {
                        self.num_preloaded.fetch_add(1, Ordering::SeqCst);
                    }
                    Err(e) => {
                        warn!(path = ?sample.path(), error = %e, "Failed to preload sample");
                    }
                }
            }

            index += 1;
        }
    }
}

/// Process-wide sample cache with hash deduplication and background
/// preloading.
pub struct SamplePool {
    inner: Arc<PoolInner>,
    preload_worker: Worker,
}

impl SamplePool {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(PoolInner {
                registry: Mutex::new(SampleRegistry {
                    by_hash: HashMap::new(),
                    ordered: Vec::new(),
                }),
                num_samples: AtomicUsize::new(0),
                num_preloaded: AtomicUsize::new(0),
                preload_frames: AtomicUsize::new(0),
            }),
            preload_worker: Worker::new("sampler-preload"),
        }
    }

    /// Registers a sample region, returning the existing handle when the
    /// same region was added before. The sample is not preloaded yet.
    pub fn add_sample(
        &self,
        path: &Path,
        start_pos: u64,
        stop_pos: u64,
    ) -> Result<Arc<Sample>, SampleError> {
        let format = AudioFormat::guess_from_path(path)
            .ok_or_else(|| AudioFileError::UnknownFormat(path.display().to_string()))?;

        let hash = Sample::compute_hash(path, start_pos, stop_pos);
        let mut registry = self.inner.registry.lock();

        if let Some(existing) = registry.by_hash.get(&hash) {
            return Ok(existing.clone());
        }

        let sample = Arc::new(Sample::new(path, format, start_pos, stop_pos));
        registry.by_hash.insert(hash, sample.clone());
        registry.ordered.push(sample.clone());
        self.inner.num_samples.fetch_add(1, Ordering::SeqCst);

        debug!(path = ?path, start = start_pos, stop = stop_pos, "Sample added to pool");
        Ok(sample)
    }

    pub fn sample_by_hash(&self, hash: u64) -> Option<Arc<Sample>> {
        self.inner.registry.lock().by_hash.get(&hash).cloned()
    }

    /// Kicks off background preloading of every registered sample that is
    /// not yet preloaded, reading `num_frames` frames each.
    pub fn preload(&self, num_frames: usize) {
        self.inner
            .preload_frames
            .store(num_frames, Ordering::SeqCst);
        self.preload_worker.start();
        self.preload_worker.handle().add_job(self.inner.clone());

        info!(
            frames = num_frames,
            samples = self.num_samples(),
            "Sample preload scheduled"
        );
    }

    /// Drops every registered sample. Streams holding sample handles keep
    /// them alive until they finish.
    pub fn clear(&self) {
        let mut registry = self.inner.registry.lock();
        registry.by_hash.clear();
        registry.ordered.clear();
        self.inner.num_samples.store(0, Ordering::SeqCst);
        self.inner.num_preloaded.store(0, Ordering::SeqCst);
    }

    pub fn num_samples(&self) -> usize {
        self.inner.num_samples.load(Ordering::SeqCst)
    }

    pub fn num_preloaded_samples(&self) -> usize {
        self.inner.num_preloaded.load(Ordering::SeqCst)
    }

    pub fn stop(&self) {
        self.preload_worker.stop();
    }
}

impl Default for SamplePool {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for SamplePool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SamplePool")
            .field("samples", &self.num_samples())
            .field("preloaded", &self.num_preloaded_samples())
            .finish()
    }
}
