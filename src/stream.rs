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

//! Disk streaming.
//!
//! An [`AudioStream`] is a lease over one [`Sample`] that produces a
//! monotonically advancing sequence of stereo frames: first straight out of
//! the sample's preload buffer, then from a ring buffer refilled from disk
//! by a worker thread. The audio thread consumes frames and re-enqueues the
//! stream on its worker whenever the ring drops to half full.
//!
//! The stream is split down the middle. The audio side owns the ring
//! consumer and the preload cursor. The worker side (decoder handle, ring
//! producer, loop bookkeeping) lives behind a mutex that only worker
//! threads lock. New leases are announced over a small SPSC control ring,
//! so the audio thread never touches worker state directly.
//!
//! State machine: `Idle → Init → Streaming → Finishing → Over`, with
//! `Over` absorbing. I/O failures collapse the stream to `Over` (open) or
//! `Finishing` (seek/read); a bound voice then just stops producing and is
//! reaped normally.

use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;

use crossbeam::queue::ArrayQueue;
use parking_lot::Mutex;
use ringbuf::traits::{Consumer, Observer, Producer, Split};
use ringbuf::{HeapCons, HeapProd, HeapRb};
use tracing::warn;

use crate::audio_file::AudioFile;
use crate::core::buffer::StereoBuffer;
use crate::core::worker::{Job, WorkerHandle};
use crate::sample::Sample;
use crate::{DEFAULT_AUDIO_STREAM_POOL_SIZE, DEFAULT_STREAM_BUFFER_SIZE, DEFAULT_XFADE_BUFFER_SIZE};

/// Frames read from disk per iteration of the worker fill loop.
const READ_CHUNK_FRAMES: usize = 1024;

/// Capacity of the per-stream lease control ring.
const CTRL_RING_CAPACITY: usize = 4;

/// Cross-fade envelope exponent; 0.5 gives an equal-power blend.
const XFADE_CURVE: f32 = 0.5;

/// Stream lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum StreamState {
    Idle = 0,
    Init = 1,
    Streaming = 2,
    Finishing = 3,
    Over = 4,
}

struct AtomicState(AtomicU8);

impl AtomicState {
    fn new(state: StreamState) -> Self {
        Self(AtomicU8::new(state as u8))
    }

    fn load(&self) -> StreamState {
        match self.0.load(Ordering::Acquire) {
            0 => StreamState::Idle,
            1 => StreamState::Init,
            2 => StreamState::Streaming,
            3 => StreamState::Finishing,
            _ => StreamState::Over,
        }
    }

    fn store(&self, state: StreamState) {
        self.0.store(state as u8, Ordering::Release);
    }
}

/// Loop region bound to a stream for one lease.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LoopConfig {
    /// Loop start, in frames from the sample start.
    pub begin: u64,
    /// Loop end, exclusive, in frames from the sample start.
    pub end: u64,
    /// Cross-fade window length in frames.
    pub xfade: usize,
}

impl LoopConfig {
    /// Normalizes raw trigger loop points. Negative begin or end disables
    /// looping. Swapped bounds are reordered, the cross-fade is clamped to
    /// its minimum length, and the loop end is pushed past the preloaded
    /// region (the ring never covers preloaded frames).
    pub fn normalize(sample: &Sample, begin: i64, end: i64, xfade: usize) -> Option<LoopConfig> {
        if begin < 0 || end < 0 {
            return None;
        }

        let lo = begin.min(end) as u64;
        let hi = begin.max(end) as u64;
        let hi = hi.max(sample.num_preloaded_frames() as u64);

        if lo >= hi {
            return None;
        }

        Some(LoopConfig {
            begin: lo,
            end: hi,
            xfade: xfade.max(DEFAULT_XFADE_BUFFER_SIZE),
        })
    }
}

/// Announces a new lease to the worker side.
struct StartCommand {
    sample: Arc<Sample>,
    loop_cfg: Option<LoopConfig>,
}

/// Worker-side stream state. Locked only by worker threads.
struct StreamBack {
    ctrl_rx: HeapCons<StartCommand>,
    ring_tx: HeapProd<(f32, f32)>,
    file: Option<AudioFile>,
    sample: Option<Arc<Sample>>,
    /// Read position in frames from the sample start. Cycles through the
    /// loop region when looping.
    stream_pos: u64,
    loop_cfg: Option<LoopConfig>,
    /// Pre-wrap frames stashed at the loop seam, blended into the frames
    /// that follow the seek back to the loop start.
    xfade_buf: StereoBuffer,
    /// Precomputed (in, out) gain pairs for the cross-fade window.
    xfade_env: Vec<(f32, f32)>,
    frames_in_xfade: usize,
    scratch: StereoBuffer,
}

impl StreamBack {
    fn run(&mut self, state: &AtomicState) {
        // Pick up a replacement lease first: anything after this line acts
        // on the new sample.
        while let Some(command) = self.ctrl_rx.try_pop() {
            if let Some(file) = self.file.as_mut() {
                file.close();
            }
            self.file = None;
            self.sample = Some(command.sample);
            self.loop_cfg = command.loop_cfg;
            self.frames_in_xfade = 0;
            self.stream_pos = 0;
        }

        if state.load() == StreamState::Init {
            self.init(state);
        }

        if state.load() == StreamState::Streaming {
            self.stream(state);
        }

        if state.load() == StreamState::Finishing {
            if let Some(file) = self.file.as_mut() {
                if file.is_open() {
                    file.close();
                }
            }
            if self.ring_tx.is_empty() {
                state.store(StreamState::Over);
            }
        }

        if state.load() == StreamState::Over {
            self.file = None;
        }
    }

    /// Opens a private decoder handle and seeks past the preloaded head.
    fn init(&mut self, state: &AtomicState) {
        let Some(sample) = self.sample.clone() else {
            state.store(StreamState::Over);
            return;
        };

        let mut file = sample.audio_file();
        if let Err(e) = file.open() {
            warn!(path = ?sample.path(), error = %e, "Failed to open stream file");
            state.store(StreamState::Over);
            return;
        }

        let preloaded = sample.num_preloaded_frames() as u64;
        match file.seek(sample.start_position() + preloaded) {
            Ok(()) => {
                if let Some(loop_cfg) = self.loop_cfg {
                    self.allocate_xfade(loop_cfg.xfade);
                }
                self.file = Some(file);
                self.stream_pos = preloaded;
                state.store(StreamState::Streaming);
            }
            Err(e) => {
                warn!(path = ?sample.path(), error = %e, "Failed to seek stream file");
                self.file = Some(file);
                state.store(StreamState::Finishing);
            }
        }
    }

    /// Fills the ring from disk until full, the region ends, or the lease
    /// is replaced. Loop wraps stash a cross-fade window and seek back.
    fn stream(&mut self, state: &AtomicState) {
        let Some(sample) = self.sample.clone() else {
            return;
        };
        let start = sample.start_position();
        let stop = sample.stop_position();

        loop {
            // A pending command means this lease has been replaced; park
            // and let the next run re-initialize.
            if !self.ctrl_rx.is_empty() {
                break;
            }

            let vacant = self.ring_tx.vacant_len();
            if vacant == 0 {
                break;
            }

            let mut read_this = vacant.min(READ_CHUNK_FRAMES);

            if stop > 0 {
                let remaining = stop.saturating_sub(start + self.stream_pos) as usize;
                read_this = read_this.min(remaining);
                if read_this == 0 {
                    state.store(StreamState::Finishing);
                    break;
                }
            }

            let mut hit_loop_end = false;
            if let Some(loop_cfg) = self.loop_cfg {
                if self.stream_pos + read_this as u64 >= loop_cfg.end {
                    read_this = (loop_cfg.end - self.stream_pos) as usize;
                    hit_loop_end = true;
                }
            }

            if read_this > 0 {
                let Some(file) = self.file.as_mut() else {
                    state.store(StreamState::Finishing);
                    break;
                };

                let (scratch_l, scratch_r) = self.scratch.channels_mut();
                let frames_read = file.read(
                    read_this,
                    &mut scratch_l[..read_this],
                    &mut scratch_r[..read_this],
                );
                if frames_read == 0 {
                    state.store(StreamState::Finishing);
                    break;
                }

                if self.frames_in_xfade > 0 {
                    let blend = self.frames_in_xfade.min(frames_read);
                    let offset = self.xfade_env.len() - self.frames_in_xfade;
                    for i in 0..blend {
                        let (gain_in, gain_out) = self.xfade_env[offset + i];
                        scratch_l[i] =
                            scratch_l[i] * gain_in + self.xfade_buf.left()[offset + i] * gain_out;
                        scratch_r[i] =
                            scratch_r[i] * gain_in + self.xfade_buf.right()[offset + i] * gain_out;
                    }
                    self.frames_in_xfade -= blend;
                }

                for i in 0..frames_read {
                    // Space was checked against vacant_len above.
                    let _ = self.ring_tx.try_push((scratch_l[i], scratch_r[i]));
                }
                self.stream_pos += frames_read as u64;

                if frames_read < read_this {
                    // Short read; retry from the new position next round.
                    hit_loop_end = false;
                }
            }

            if hit_loop_end {
                self.wrap_loop(state, &sample);
                if state.load() != StreamState::Streaming {
                    break;
                }
            }
        }
    }

    /// Stashes the frames that would have played past the loop end, then
    /// seeks back to the loop start.
    fn wrap_loop(&mut self, state: &AtomicState, sample: &Sample) {
        let Some(loop_cfg) = self.loop_cfg else {
            return;
        };
        let Some(file) = self.file.as_mut() else {
            state.store(StreamState::Finishing);
            return;
        };

        self.xfade_buf.clear();
        let window = self.xfade_env.len();
        let mut stashed = 0;
        while stashed < window {
            let (left, right) = self.xfade_buf.channels_mut();
            let n = file.read(
                window - stashed,
                &mut left[stashed..window],
                &mut right[stashed..window],
            );
            if n == 0 {
                break;
            }
            stashed += n;
        }

        if let Err(e) = file.seek(sample.start_position() + loop_cfg.begin) {
            warn!(path = ?sample.path(), error = %e, "Failed to seek to loop start");
            state.store(StreamState::Finishing);
            return;
        }

        self.stream_pos = loop_cfg.begin;
        self.frames_in_xfade = window;
    }

    fn allocate_xfade(&mut self, length: usize) {
        if self.xfade_env.len() != length {
            self.xfade_buf = StereoBuffer::new(length);
            self.xfade_env = (0..length)
                .map(|i| {
                    let t = i as f32 / length as f32;
                    (t.powf(XFADE_CURVE), (1.0 - t).powf(XFADE_CURVE))
                })
                .collect();
        }
    }
}

/// State shared between the audio side and the worker side of a stream.
pub struct StreamShared {
    state: AtomicState,
    back: Mutex<StreamBack>,
}

impl Job for StreamShared {
    fn run(&self) {
        let mut back = self.back.lock();
        back.run(&self.state);
    }
}

/// The audio-thread side of a disk stream.
///
/// Exclusively owned while leased: exactly one voice reads from it. All
/// methods here are real-time safe.
pub struct AudioStream {
    shared: Arc<StreamShared>,
    ctrl_tx: HeapProd<StartCommand>,
    ring: HeapCons<(f32, f32)>,
    ring_capacity: usize,
    sample: Option<Arc<Sample>>,
    /// Read cursor in frames from the sample start; covers the preloaded
    /// head first, then ring content.
    sample_pos: usize,
    worker: Option<WorkerHandle>,
}

impl AudioStream {
    fn new(buffer_size: usize) -> Self {
        let (ring_tx, ring_rx) = HeapRb::<(f32, f32)>::new(buffer_size).split();
        let (ctrl_tx, ctrl_rx) = HeapRb::<StartCommand>::new(CTRL_RING_CAPACITY).split();

        Self {
            shared: Arc::new(StreamShared {
                state: AtomicState::new(StreamState::Idle),
                back: Mutex::new(StreamBack {
                    ctrl_rx,
                    ring_tx,
                    file: None,
                    sample: None,
                    stream_pos: 0,
                    loop_cfg: None,
                    xfade_buf: StereoBuffer::new(0),
                    xfade_env: Vec::new(),
                    frames_in_xfade: 0,
                    scratch: StereoBuffer::new(READ_CHUNK_FRAMES),
                }),
            }),
            ctrl_tx,
            ring: ring_rx,
            ring_capacity: buffer_size,
            sample: None,
            sample_pos: 0,
            worker: None,
        }
    }

    /// Binds this stream to a sample and worker for a new lease. The first
    /// `offset` frames of the preloaded head are skipped.
    pub(crate) fn trigger(
        &mut self,
        sample: Arc<Sample>,
        worker: WorkerHandle,
        offset: usize,
        loop_cfg: Option<LoopConfig>,
    ) {
        // Command first, then clear: a stale fill job parks itself on the
        // pending command instead of writing into the cleared ring.
        let _ = self.ctrl_tx.try_push(StartCommand {
            sample: sample.clone(),
            loop_cfg,
        });
        self.ring.clear();

        self.sample = Some(sample);
        self.sample_pos = offset;
        self.shared.state.store(StreamState::Init);

        worker.add_job(self.shared.clone());
        self.worker = Some(worker);
    }

    /// Source sample rate of the bound sample; 0 while unbound.
    pub fn sample_rate(&self) -> f32 {
        self.sample.as_ref().map_or(0.0, |s| s.sample_rate())
    }

    pub fn state(&self) -> StreamState {
        self.shared.state.load()
    }

    pub fn is_over(&self) -> bool {
        self.shared.state.load() == StreamState::Over
    }

    /// Worker-side streaming position. Observability only; not meaningful
    /// on the audio path.
    pub fn stream_position(&self) -> u64 {
        self.shared.back.lock().stream_pos
    }

    /// Pulls one frame. Returns None when no data is available: either a
    /// transient underrun (state still `Streaming`) or the end of the
    /// stream, in which case the state moves `Finishing → Over` exactly
    /// once and stays there.
    pub fn read_one(&mut self) -> Option<(f32, f32)> {
        if let Some(sample) = self.sample.as_ref() {
            let preloaded = sample.num_preloaded_frames();
            if self.sample_pos < preloaded {
                let buffer = sample.preloaded()?;
                let frame = (
                    buffer.left()[self.sample_pos],
                    buffer.right()[self.sample_pos],
                );
                self.sample_pos += 1;
                return Some(frame);
            }
        }

        match self.ring.try_pop() {
            Some(frame) => {
                self.sample_pos += 1;
                self.request_refill();
                Some(frame)
            }
            None => {
                if self.shared.state.load() == StreamState::Finishing {
                    self.shared.state.store(StreamState::Over);
                }
                None
            }
        }
    }

    /// Bulk variant of [`AudioStream::read_one`]: fills the output slices
    /// with as many frames as are available and returns the count.
    pub fn fill_buffers(&mut self, left: &mut [f32], right: &mut [f32]) -> usize {
        let num_frames = left.len().min(right.len());
        let mut produced = 0;

        if let Some(sample) = self.sample.as_ref() {
            let preloaded = sample.num_preloaded_frames();
            if self.sample_pos < preloaded {
                if let Some(buffer) = sample.preloaded() {
                    let n = (preloaded - self.sample_pos).min(num_frames);
                    left[..n].copy_from_slice(&buffer.left()[self.sample_pos..self.sample_pos + n]);
                    right[..n]
                        .copy_from_slice(&buffer.right()[self.sample_pos..self.sample_pos + n]);
                    self.sample_pos += n;
                    produced = n;
                }
            }
        }

        while produced < num_frames {
            match self.ring.try_pop() {
                Some((l, r)) => {
                    left[produced] = l;
                    right[produced] = r;
                    produced += 1;
                    self.sample_pos += 1;
                }
                None => break,
            }
        }

        if produced == 0 && self.shared.state.load() == StreamState::Finishing {
            self.shared.state.store(StreamState::Over);
        }

        self.request_refill();
        produced
    }

    /// Moves the stream toward its end: the worker closes the file, and
    /// once the remaining ring content is consumed the stream is `Over`.
    pub fn release(&mut self) {
        if !self.is_over() {
            self.shared.state.store(StreamState::Finishing);
            if let Some(worker) = &self.worker {
                worker.add_job(self.shared.clone());
            }
        }
    }

    /// Detaches the sample handle so the caller can defer its drop.
    pub(crate) fn take_sample(&mut self) -> Option<Arc<Sample>> {
        self.sample.take()
    }

    fn request_refill(&mut self) {
        if self.shared.state.load() == StreamState::Streaming
            && self.ring.occupied_len() <= self.ring_capacity / 2
        {
            if let Some(worker) = &self.worker {
                worker.add_job(self.shared.clone());
            }
        }
    }
}

impl std::fmt::Debug for AudioStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AudioStream")
            .field("state", &self.state())
            .field("sample_pos", &self.sample_pos)
            .field("buffered", &self.ring.occupied_len())
            .finish()
    }
}

/// Preallocated pool of streams. Leasing is a lock-free pop.
pub struct AudioStreamPool {
    streams: ArrayQueue<AudioStream>,
    size: usize,
}

impl AudioStreamPool {
    pub fn new(num_streams: usize, buffer_size: usize) -> Self {
        let streams = ArrayQueue::new(num_streams);
        for _ in 0..num_streams {
            let _ = streams.push(AudioStream::new(buffer_size));
        }
        Self {
            streams,
            size: num_streams,
        }
    }

    /// Leases a stream. Returns None when the pool is exhausted.
    pub fn acquire(&self) -> Option<AudioStream> {
        self.streams.pop()
    }

    /// Returns a stream to the pool. The caller must have detached the
    /// sample handle first (see [`AudioStream::take_sample`]).
    pub fn release(&self, stream: AudioStream) {
        debug_assert!(stream.sample.is_none());
        let _ = self.streams.push(stream);
    }

    pub fn num_idle(&self) -> usize {
        self.streams.len()
    }

    pub fn size(&self) -> usize {
        self.size
    }
}

impl Default for AudioStreamPool {
    fn default() -> Self {
        Self::new(DEFAULT_AUDIO_STREAM_POOL_SIZE, DEFAULT_STREAM_BUFFER_SIZE)
    }
}
