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

//! Real-time polyphonic sampler playback and mixing engine.
//!
//! The engine plays samples streamed from disk on a fixed set of stereo buses
//! under a hard audio-callback deadline. Non-real-time threads enqueue
//! triggers and releases through bounded lock-free queues; the audio thread
//! leases voices and disk streams from preallocated pools, mixes all active
//! voices through per-voice and per-bus effect chains, and ships every
//! heap-owned object it is done with to a background thread for destruction.
//!
//! The cardinal rule throughout: the audio thread never allocates, never
//! locks, and never blocks. Everything it touches is preallocated, exchanged
//! through single-producer single-consumer rings, or leased from a lock-free
//! pool.

pub mod audio_file;
pub mod bus;
pub mod config;
pub mod core;
pub mod effect;
pub mod engine;
pub mod envelope;
pub mod global;
pub mod midi;
pub mod modulation;
pub mod parameter;
pub mod sample;
pub mod stream;
pub mod voice;

#[cfg(test)]
pub mod testutil;

pub use audio_file::{AudioFile, AudioFileError, AudioFormat, Decoder};
pub use bus::{AudioBus, AudioBusPool};
pub use config::EngineConfig;
pub use effect::{AudioEffect, AudioEffectChain};
pub use engine::{Engine, EngineHandle, Release, TransportInfo, Trigger};
pub use envelope::{Envelope, EnvelopeSpec, EnvelopeState};
pub use global::GlobalEngine;
pub use midi::MidiKeyboardState;
pub use modulation::{GenericModulator, ModulationProgram};
pub use parameter::{AudioParameter, AudioParameterPool};
pub use sample::{Sample, SampleError, SamplePool};
pub use stream::{AudioStream, AudioStreamPool, LoopConfig, StreamState};
pub use voice::{Voice, VoicePool, VoiceTrigger};

/// Number of frames the engine mixes per block. Hosts asking for larger
/// blocks are served in chunks of this size.
pub const MIX_BUFFER_NUM_FRAMES: usize = 32;

/// Default number of buses per engine.
pub const NUM_BUSES: usize = 16;

/// Number of voices preallocated in the process-wide voice pool.
pub const DEFAULT_VOICE_POOL_SIZE: usize = 256;

/// Number of disk streams preallocated in the process-wide stream pool.
pub const DEFAULT_AUDIO_STREAM_POOL_SIZE: usize = 256;

/// Hard cap on the per-sample preload buffer, in frames.
pub const MAX_PRELOAD_BUFFER_SIZE: usize = 65536;

/// Per-stream ring buffer capacity, in frames per channel.
pub const DEFAULT_STREAM_BUFFER_SIZE: usize = 16384;

/// Default loop cross-fade length, in frames.
pub const DEFAULT_XFADE_BUFFER_SIZE: usize = 32;

/// Number of disk-streaming worker threads, assigned round-robin.
pub const NUM_STREAM_WORKERS: usize = 4;

/// Capacity of the voice trigger command queue.
pub const DEFAULT_TRIGGER_BUFFER_SIZE: usize = 1024;

/// Capacity of the voice release command queue.
pub const DEFAULT_RELEASE_BUFFER_SIZE: usize = 1024;

/// Capacity of the actuator command queue.
pub const DEFAULT_ACTUATOR_BUFFER_SIZE: usize = 1024;

/// Capacity of the deferred-destruction release pool.
pub const DEFAULT_RELEASE_POOL_SIZE: usize = 4096;

/// Sample rate assumed before `prepare_to_play` is called.
pub const DEFAULT_SAMPLE_RATE: f32 = 44100.0;

/// Number of MIDI CC parameter slots tracked per engine.
pub const NUM_CC_PARAMETERS: usize = 128;
