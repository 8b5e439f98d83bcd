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

//! Engine configuration.
//!
//! Pool and buffer sizes are fixed for the lifetime of the shared engine
//! resources, so they are captured in a config struct the embedder can
//! deserialize from its own settings file. Everything defaults to the
//! crate-level tuning constants.

use serde::Deserialize;

use crate::{
    DEFAULT_AUDIO_STREAM_POOL_SIZE, DEFAULT_STREAM_BUFFER_SIZE, DEFAULT_VOICE_POOL_SIZE,
    NUM_BUSES, NUM_STREAM_WORKERS,
};

/// Sizing knobs for the engine's preallocated resources.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct EngineConfig {
    /// Number of mix buses per engine.
    pub num_buses: usize,
    /// Number of voices preallocated in the shared voice pool.
    pub voice_pool_size: usize,
    /// Number of disk streams preallocated in the shared stream pool.
    pub stream_pool_size: usize,
    /// Per-stream ring buffer capacity in frames.
    pub stream_buffer_frames: usize,
    /// Number of disk-streaming worker threads.
    pub num_stream_workers: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            num_buses: NUM_BUSES,
            voice_pool_size: DEFAULT_VOICE_POOL_SIZE,
            stream_pool_size: DEFAULT_AUDIO_STREAM_POOL_SIZE,
            stream_buffer_frames: DEFAULT_STREAM_BUFFER_SIZE,
            num_stream_workers: NUM_STREAM_WORKERS,
        }
    }
}
