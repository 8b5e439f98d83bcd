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

//! Stereo mix buses.
//!
//! Each bus owns a list of active voices, a send buffer, an effect chain
//! and smoothed gain/pan parameters. A block pass processes every active
//! voice, reaps finished ones back to the pools, runs the bus chain and
//! mixes the result into the host output with an equal-amplitude pan law.
//!
//! The active-voice list is a preallocated vector of pool-owned voices
//! sized to the voice pool, so appending and removal never allocate on the
//! audio thread.

use tracing::debug;

use crate::core::buffer::StereoBuffer;
use crate::core::release::Disposable;
use crate::effect::AudioEffectChain;
use crate::global::GlobalEngine;
use crate::parameter::AudioParameterPool;
use crate::stream::AudioStream;
use crate::voice::{Voice, VoiceTrigger};
use crate::{DEFAULT_SAMPLE_RATE, MIX_BUFFER_NUM_FRAMES};

/// A single stereo bus.
pub struct AudioBus {
    params: AudioParameterPool,
    fx_chain: AudioEffectChain,

    /// Active voices, owned by this bus while leased from the pool.
    voices: Vec<Box<Voice>>,

    voice_buffer: StereoBuffer,
    bus_buffer: StereoBuffer,
    send_buffer: StereoBuffer,

    sample_rate: f32,
}

impl AudioBus {
    pub const GAIN: usize = 0;
    pub const PAN: usize = 1;
    pub const NUM_PARAMS: usize = 2;

    fn new(voice_capacity: usize) -> Self {
        let mut params = AudioParameterPool::new(Self::NUM_PARAMS);
        params[Self::GAIN].set_name("gain");
        params[Self::GAIN].set_range(0.0, 16.0); // Allow +24dB gain
        params[Self::GAIN].set_value(1.0, true);

        params[Self::PAN].set_name("pan");
        params[Self::PAN].set_range(-1.0, 1.0);
        params[Self::PAN].set_value(0.0, true);

        Self {
            params,
            fx_chain: AudioEffectChain::new(),
            voices: Vec::with_capacity(voice_capacity),
            voice_buffer: StereoBuffer::new(MIX_BUFFER_NUM_FRAMES),
            bus_buffer: StereoBuffer::new(MIX_BUFFER_NUM_FRAMES),
            send_buffer: StereoBuffer::new(MIX_BUFFER_NUM_FRAMES),
            sample_rate: DEFAULT_SAMPLE_RATE,
        }
    }

    pub fn parameters(&mut self) -> &mut AudioParameterPool {
        &mut self.params
    }

    pub fn fx_chain(&mut self) -> &mut AudioEffectChain {
        &mut self.fx_chain
    }

    /// The buffer other buses' send effects write into; its content
    /// becomes this bus's input on the next block.
    pub fn send_buffer(&mut self) -> &mut StereoBuffer {
        &mut self.send_buffer
    }

    pub fn num_active_voices(&self) -> usize {
        self.voices.len()
    }

    pub fn prepare_to_play(&mut self, sample_rate: f32) {
        self.sample_rate = sample_rate;
        self.fx_chain.prepare_to_play(sample_rate);
        self.bus_buffer.clear();
        self.send_buffer.clear();
    }

    /// Leases a voice from the pool and starts it on this bus. Returns the
    /// trigger and stream on pool exhaustion so the caller can dispose of
    /// them.
    pub(crate) fn trigger(
        &mut self,
        trigger: VoiceTrigger,
        stream: AudioStream,
        global: &GlobalEngine,
    ) -> Result<(), (VoiceTrigger, AudioStream)> {
        match global.voice_pool().acquire() {
            Some(mut voice) => {
                voice.trigger(self.sample_rate, trigger, stream);
                self.voices.push(voice);
                Ok(())
            }
            None => {
                debug!("Voice pool exhausted, dropping trigger");
                Err((trigger, stream))
            }
        }
    }

    /// Stops and reclaims every active voice immediately. May click; used
    /// by engine reset.
    pub(crate) fn kill_all_voices(&mut self, global: &GlobalEngine) {
        while let Some(mut voice) = self.voices.pop() {
            if let Some(stream) = voice.take_stream() {
                global.return_stream(stream);
            }
            voice.reset(global);
            global.voice_pool().release(voice);
        }
    }

    /// Ships the bus chain's effects to the release pool and leaves the
    /// chain empty.
    pub(crate) fn clear_fx_chain(&mut self, global: &GlobalEngine) {
        for effect in self.fx_chain.take_effects() {
            global.release_object(Disposable::Effect(effect));
        }
    }

    pub fn find_voice_with_id(&mut self, voice_id: u64) -> Option<&mut Voice> {
        self.voices
            .iter_mut()
            .map(|v| v.as_mut())
            .find(|v| v.voice_id() == voice_id)
    }

    pub fn for_each_voice<F>(&mut self, mut func: F)
    where
        F: FnMut(&mut Voice),
    {
        for voice in &mut self.voices {
            func(voice);
        }
    }

    /// Processes all active voices and the bus chain, then mixes into the
    /// host output with smoothed gain and pan. Finished voices are reaped
    /// back to their pools mid-iteration.
    pub fn process_and_mix(
        &mut self,
        out_l: &mut [f32],
        out_r: &mut [f32],
        global: &GlobalEngine,
    ) {
        let num_frames = out_l.len().min(out_r.len());
        debug_assert!(num_frames <= MIX_BUFFER_NUM_FRAMES);

        // Sends written during the previous block become this bus's input
        // now: one block of latency. Only the frames consumed by this
        // chunk are cleared; a partial final chunk leaves the tail of the
        // send window for the next block.
        self.bus_buffer.copy_from(&self.send_buffer, num_frames);
        self.send_buffer.clear_frames(num_frames);

        let mut index = 0;
        while index < self.voices.len() {
            {
                let voice = &mut self.voices[index];
                let (left, right) = self.voice_buffer.channels_mut();
                voice.process(&mut left[..num_frames], &mut right[..num_frames]);
            }
            self.bus_buffer.mix_from(&self.voice_buffer, num_frames);

            if self.voices[index].is_over() {
                let mut voice = self.voices.swap_remove(index);
                if let Some(stream) = voice.take_stream() {
                    global.return_stream(stream);
                }
                voice.reset(global);
                global.voice_pool().release(voice);
            } else {
                index += 1;
            }
        }

        {
            let (left, right) = self.bus_buffer.channels_mut();
            self.fx_chain
                .process(&mut left[..num_frames], &mut right[..num_frames]);
        }

        let mut gain = self.params[Self::GAIN].target_value();
        let mut pan = self.params[Self::PAN].target_value();
        let mut pan_l = if pan <= 0.0 { 1.0 } else { 1.0 - pan };
        let mut pan_r = if pan >= 0.0 { 1.0 } else { 1.0 + pan };

        let bus_l = self.bus_buffer.left();
        let bus_r = self.bus_buffer.right();

        // Per-frame coefficients while either parameter is still gliding.
        let mut i = 0;
        while (self.params[Self::GAIN].is_smoothing() || self.params[Self::PAN].is_smoothing())
            && i < num_frames
        {
            gain = self.params[Self::GAIN].next_value();
            pan = self.params[Self::PAN].next_value();
            pan_l = if pan <= 0.0 { 1.0 } else { 1.0 - pan };
            pan_r = if pan >= 0.0 { 1.0 } else { 1.0 + pan };

            out_l[i] += bus_l[i] * gain * pan_l;
            out_r[i] += bus_r[i] * gain * pan_r;
            i += 1;
        }

        // Constant coefficients once smoothing has settled.
        pan_l *= gain;
        pan_r *= gain;
        for frame in i..num_frames {
            out_l[frame] += bus_l[frame] * pan_l;
            out_r[frame] += bus_r[frame] * pan_r;
        }
    }
}

impl std::fmt::Debug for AudioBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AudioBus")
            .field("active_voices", &self.voices.len())
            .field("fx", &self.fx_chain.len())
            .finish()
    }
}

/// The fixed set of buses belonging to one engine.
pub struct AudioBusPool {
    buses: Vec<AudioBus>,
}

impl AudioBusPool {
    pub fn new(num_buses: usize, voice_capacity: usize) -> Self {
        Self {
            buses: (0..num_buses).map(|_| AudioBus::new(voice_capacity)).collect(),
        }
    }

    pub fn len(&self) -> usize {
        self.buses.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buses.is_empty()
    }

    pub fn bus(&mut self, index: usize) -> Option<&mut AudioBus> {
        self.buses.get_mut(index)
    }

    pub fn buses_mut(&mut self) -> &mut [AudioBus] {
        &mut self.buses
    }

    pub fn prepare_to_play(&mut self, sample_rate: f32) {
        for bus in &mut self.buses {
            bus.prepare_to_play(sample_rate);
        }
    }

    pub(crate) fn kill_all_voices(&mut self, global: &GlobalEngine) {
        for bus in &mut self.buses {
            bus.kill_all_voices(global);
        }
    }

    pub(crate) fn clear_fx_chains(&mut self, global: &GlobalEngine) {
        for bus in &mut self.buses {
            bus.clear_fx_chain(global);
        }
    }

    /// Linear scan across all buses' active voices.
    pub fn find_voice_with_id(&mut self, voice_id: u64) -> Option<&mut Voice> {
        self.buses
            .iter_mut()
            .find_map(|bus| bus.find_voice_with_id(voice_id))
    }

    pub fn for_each_voice<F>(&mut self, mut func: F)
    where
        F: FnMut(&mut Voice),
    {
        for bus in &mut self.buses {
            bus.for_each_voice(&mut func);
        }
    }

    pub fn num_active_voices(&self) -> usize {
        self.buses.iter().map(|b| b.num_active_voices()).sum()
    }
}
