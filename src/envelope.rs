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

//! ADSR envelope with exponential attack and release curves.

use crate::DEFAULT_SAMPLE_RATE;

/// Attack aims past 1.0 by this ratio so the curve stays steep near the top.
const ATTACK_TARGET_RATIO: f32 = 0.3;

/// Decay and release aim slightly below their target level.
const DECAY_RELEASE_TARGET_RATIO: f32 = 0.0001;

/// Envelope timing specification. Times are in seconds.
#[derive(Debug, Clone, Copy)]
pub struct EnvelopeSpec {
    pub attack: f32,
    pub decay: f32,
    pub sustain: f32,
    pub release: f32,
    pub sample_rate: f32,
}

impl Default for EnvelopeSpec {
    fn default() -> Self {
        Self {
            attack: 0.0,
            decay: 0.0,
            sustain: 1.0,
            release: 1.0,
            sample_rate: DEFAULT_SAMPLE_RATE,
        }
    }
}

/// Envelope phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnvelopeState {
    Off,
    Attack,
    Decay,
    Sustain,
    Release,
}

/// Per-voice amplitude envelope. One call to [`Envelope::next`] advances
/// the envelope by one frame.
#[derive(Debug)]
pub struct Envelope {
    state: EnvelopeState,
    level: f32,

    attack_coef: f32,
    attack_base: f32,

    decay_coef: f32,
    decay_base: f32,

    release_coef: f32,
    release_base: f32,

    sustain_level: f32,
    sample_rate: f32,
}

impl Envelope {
    pub fn new() -> Self {
        Self {
            state: EnvelopeState::Off,
            level: 0.0,
            attack_coef: 0.0,
            attack_base: 0.0,
            decay_coef: 0.0,
            decay_base: 0.0,
            release_coef: 0.0,
            release_base: 0.0,
            sustain_level: 0.0,
            sample_rate: DEFAULT_SAMPLE_RATE,
        }
    }

    pub fn state(&self) -> EnvelopeState {
        self.state
    }

    pub fn level(&self) -> f32 {
        self.level
    }

    /// Starts the attack phase from zero using the given timing spec.
    pub fn trigger(&mut self, spec: &EnvelopeSpec) {
        self.sustain_level = spec.sustain;
        self.sample_rate = spec.sample_rate;

        let attack_rate = spec.attack * self.sample_rate;
        self.attack_coef = Self::coefficient(attack_rate, ATTACK_TARGET_RATIO);
        self.attack_base = (1.0 + ATTACK_TARGET_RATIO) * (1.0 - self.attack_coef);

        let decay_rate = spec.decay * self.sample_rate;
        self.decay_coef = Self::coefficient(decay_rate, DECAY_RELEASE_TARGET_RATIO);
        self.decay_base = (self.sustain_level - DECAY_RELEASE_TARGET_RATIO) * (1.0 - self.decay_coef);

        let release_rate = spec.release * self.sample_rate;
        self.release_coef = Self::coefficient(release_rate, DECAY_RELEASE_TARGET_RATIO);
        self.release_base = -DECAY_RELEASE_TARGET_RATIO * (1.0 - self.release_coef);

        self.state = EnvelopeState::Attack;
        self.level = 0.0;
    }

    /// Enters the release phase with the triggered release time.
    pub fn release(&mut self) {
        self.state = EnvelopeState::Release;
    }

    /// Enters the release phase with an overridden release time in seconds.
    pub fn release_with_time(&mut self, time: f32) {
        let release_rate = time * self.sample_rate;
        self.release_coef = Self::coefficient(release_rate, DECAY_RELEASE_TARGET_RATIO);
        self.release_base = -DECAY_RELEASE_TARGET_RATIO * (1.0 - self.release_coef);

        self.state = EnvelopeState::Release;
    }

    /// Advances by one frame and returns the new level.
    pub fn next(&mut self) -> f32 {
        match self.state {
            EnvelopeState::Off | EnvelopeState::Sustain => {}
            EnvelopeState::Attack => {
                self.level = self.attack_base + self.level * self.attack_coef;
                if self.level >= 1.0 {
                    self.level = 1.0;
                    self.state = EnvelopeState::Decay;
                }
            }
            EnvelopeState::Decay => {
                self.level = self.decay_base + self.level * self.decay_coef;
                if self.level <= self.sustain_level {
                    self.level = self.sustain_level;
                    self.state = EnvelopeState::Sustain;
                }
            }
            EnvelopeState::Release => {
                self.level = self.release_base + self.level * self.release_coef;
                if self.level <= 0.0 {
                    self.level = 0.0;
                    self.state = EnvelopeState::Off;
                }
            }
        }

        self.level
    }

    fn coefficient(rate: f32, target_ratio: f32) -> f32 {
        if rate <= 0.0 {
            0.0
        } else {
            (-((1.0 + target_ratio) / target_ratio).ln() / rate).exp()
        }
    }
}

impl Default for Envelope {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec(attack: f32, decay: f32, sustain: f32, release: f32) -> EnvelopeSpec {
        EnvelopeSpec {
            attack,
            decay,
            sustain,
            release,
            sample_rate: 1000.0,
        }
    }

    #[test]
    fn test_instant_attack_jumps_to_peak() {
        let mut env = Envelope::new();
        env.trigger(&spec(0.0, 0.0, 1.0, 0.0));

        assert_eq!(env.state(), EnvelopeState::Attack);
        assert_eq!(env.next(), 1.0);
        // Zero decay with unit sustain settles straight into sustain.
        env.next();
        assert_eq!(env.state(), EnvelopeState::Sustain);
        assert_eq!(env.level(), 1.0);
    }

    #[test]
    fn test_attack_rises_monotonically() {
        let mut env = Envelope::new();
        env.trigger(&spec(0.05, 0.0, 1.0, 0.1));

        let mut last = 0.0;
        while env.state() == EnvelopeState::Attack {
            let level = env.next();
            assert!(level >= last);
            last = level;
        }
        assert_eq!(last, 1.0);
    }

    #[test]
    fn test_decay_settles_at_sustain() {
        let mut env = Envelope::new();
        env.trigger(&spec(0.0, 0.02, 0.5, 0.1));

        for _ in 0..1000 {
            env.next();
            if env.state() == EnvelopeState::Sustain {
                break;
            }
        }
        assert_eq!(env.state(), EnvelopeState::Sustain);
        assert_eq!(env.level(), 0.5);

        // Sustain holds.
        env.next();
        assert_eq!(env.level(), 0.5);
    }

    #[test]
    fn test_release_reaches_off() {
        let mut env = Envelope::new();
        env.trigger(&spec(0.0, 0.0, 1.0, 0.01));
        env.next();

        env.release();
        assert_eq!(env.state(), EnvelopeState::Release);

        for _ in 0..1000 {
            env.next();
            if env.state() == EnvelopeState::Off {
                break;
            }
        }
        assert_eq!(env.state(), EnvelopeState::Off);
        assert_eq!(env.level(), 0.0);
    }

    #[test]
    fn test_instant_release_override() {
        let mut env = Envelope::new();
        env.trigger(&spec(0.0, 0.0, 1.0, 10.0));
        env.next();

        // Zero release coefficient kills the level in one frame regardless
        // of the triggered release time.
        env.release_with_time(0.0);
        env.next();
        assert_eq!(env.state(), EnvelopeState::Off);
    }

    #[test]
    fn test_release_override_is_faster() {
        let frames_to_off = |release_time: f32, override_time: Option<f32>| {
            let mut env = Envelope::new();
            env.trigger(&spec(0.0, 0.0, 1.0, release_time));
            env.next();
            match override_time {
                Some(t) => env.release_with_time(t),
                None => env.release(),
            }
            let mut frames = 0;
            while env.state() != EnvelopeState::Off && frames < 100_000 {
                env.next();
                frames += 1;
            }
            frames
        };

        let slow = frames_to_off(1.0, None);
        let fast = frames_to_off(1.0, Some(0.05));
        assert!(fast < slow, "override ({fast}) should beat envelope ({slow})");
    }
}
