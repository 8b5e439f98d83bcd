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

//! Audio effect plumbing: the effect trait, serial chains, and the tag
//! factory.
//!
//! DSP algorithms live outside this crate; here we only define how effects
//! are created, chained, scheduled, and how their tails are accounted for.
//! Effects process planar stereo blocks in place, so a chain is a plain
//! serial pass over the caller's buffers and the result always ends up in
//! the buffers the caller handed in.

use std::collections::HashMap;
use std::sync::OnceLock;

use parking_lot::RwLock;

use crate::parameter::AudioParameterPool;

/// An effect's reported tail, in frames, that keeps producing output after
/// its input goes silent. Negative means unbounded (feedback delays,
/// reverbs).
pub type TailLength = i64;

/// A stereo audio effect processing blocks in place.
pub trait AudioEffect: Send {
    /// Identifying tag, matching the factory registration.
    fn tag(&self) -> &'static str;

    /// Called before playback starts or restarts, with the engine sample
    /// rate. Must reset all DSP state.
    fn prepare_to_play(&mut self, sample_rate: f32);

    /// Processes one block in place. Left and right always have equal
    /// length, at most [`crate::MIX_BUFFER_NUM_FRAMES`] frames.
    fn process(&mut self, left: &mut [f32], right: &mut [f32]);

    /// Tail length in frames; negative for unbounded.
    fn tail_length(&self) -> TailLength {
        0
    }

    /// Smoothed parameters, if the effect has any.
    fn parameters(&mut self) -> Option<&mut AudioParameterPool> {
        None
    }
}

type EffectConstructor = fn() -> Box<dyn AudioEffect>;

fn registry() -> &'static RwLock<HashMap<String, EffectConstructor>> {
    static REGISTRY: OnceLock<RwLock<HashMap<String, EffectConstructor>>> = OnceLock::new();
    REGISTRY.get_or_init(|| RwLock::new(HashMap::new()))
}

/// Registers an effect constructor under a tag. Expected to run at startup,
/// before any chains are built. Later registrations replace earlier ones.
pub fn register_effect(tag: &str, constructor: EffectConstructor) {
    registry().write().insert(tag.to_string(), constructor);
}

/// Creates an effect by its registered tag.
pub fn create_by_tag(tag: &str) -> Option<Box<dyn AudioEffect>> {
    registry().read().get(tag).map(|constructor| constructor())
}

/// A serial chain of effects attached to a voice or a bus.
///
/// Chains attached to voices are built by non-real-time producers, shipped
/// through the trigger queue, and released through the release pool rather
/// than dropped on the audio thread.
#[derive(Default)]
pub struct AudioEffectChain {
    effects: Vec<Box<dyn AudioEffect>>,
}

impl AudioEffectChain {
    pub fn new() -> Self {
        Self {
            effects: Vec::new(),
        }
    }

    pub fn add_effect(&mut self, effect: Box<dyn AudioEffect>) {
        self.effects.push(effect);
    }

    /// Creates an effect from the factory and appends it. Returns whether
    /// the tag was known.
    pub fn add_effect_by_tag(&mut self, tag: &str) -> bool {
        match create_by_tag(tag) {
            Some(effect) => {
                self.effects.push(effect);
                true
            }
            None => false,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.effects.is_empty()
    }

    pub fn len(&self) -> usize {
        self.effects.len()
    }

    pub fn effect(&mut self, index: usize) -> Option<&mut dyn AudioEffect> {
        self.effects.get_mut(index).map(|e| &mut **e as &mut dyn AudioEffect)
    }

    /// Drops all effects. Non-real-time callers only; the audio thread uses
    /// [`AudioEffectChain::take_effects`] and the release pool instead.
    pub fn clear(&mut self) {
        self.effects.clear();
    }

    /// Moves the effects out, leaving the chain empty. The vector's storage
    /// is retained, so this does not free memory on the calling thread.
    pub fn take_effects(&mut self) -> Vec<Box<dyn AudioEffect>> {
        std::mem::take(&mut self.effects)
    }

    pub fn prepare_to_play(&mut self, sample_rate: f32) {
        for effect in &mut self.effects {
            effect.prepare_to_play(sample_rate);
        }
    }

    /// Sum of all member tails. One unbounded member makes the whole chain
    /// report a negative tail.
    pub fn tail_length(&self) -> TailLength {
        self.effects.iter().map(|e| e.tail_length()).sum()
    }

    /// Runs every effect in order, in place, on the caller's buffers.
    pub fn process(&mut self, left: &mut [f32], right: &mut [f32]) {
        debug_assert_eq!(left.len(), right.len());

        for effect in &mut self.effects {
            effect.process(left, right);
        }
    }
}

impl std::fmt::Debug for AudioEffectChain {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AudioEffectChain")
            .field("effects", &self.effects.len())
            .finish()
    }
}

#[cfg(test)]
pub(crate) mod test_effects {
    use super::*;

    /// Multiplies the block by a constant.
    pub struct ScaleEffect {
        pub factor: f32,
        pub tail: TailLength,
        pub prepared_at: Option<f32>,
    }

    impl ScaleEffect {
        pub fn new(factor: f32) -> Self {
            Self {
                factor,
                tail: 0,
                prepared_at: None,
            }
        }

        pub fn with_tail(factor: f32, tail: TailLength) -> Self {
            Self {
                factor,
                tail,
                prepared_at: None,
            }
        }
    }

    impl AudioEffect for ScaleEffect {
        fn tag(&self) -> &'static str {
            "scale"
        }

        fn prepare_to_play(&mut self, sample_rate: f32) {
            self.prepared_at = Some(sample_rate);
        }

        fn process(&mut self, left: &mut [f32], right: &mut [f32]) {
            for sample in left.iter_mut().chain(right.iter_mut()) {
                *sample *= self.factor;
            }
        }

        fn tail_length(&self) -> TailLength {
            self.tail
        }
    }

    /// Adds a constant: makes processing order observable.
    pub struct BiasEffect {
        pub bias: f32,
    }

    impl AudioEffect for BiasEffect {
        fn tag(&self) -> &'static str {
            "bias"
        }

        fn prepare_to_play(&mut self, _sample_rate: f32) {}

        fn process(&mut self, left: &mut [f32], right: &mut [f32]) {
            for sample in left.iter_mut().chain(right.iter_mut()) {
                *sample += self.bias;
            }
        }
    }
}
