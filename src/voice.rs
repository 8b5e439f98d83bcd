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

//! Voices: single playback instances.
//!
//! A voice pulls stereo frames from its disk stream through a 4-tap
//! Lagrange resampler, applies its ADSR envelope and smoothed gain, and
//! runs an optional per-voice effect chain. After the envelope closes the
//! voice lingers, producing silence through the chain, until the chain's
//! advertised tail has elapsed.
//!
//! Voices are preallocated in a process-wide pool and leased to buses; a
//! leased voice owns its stream exclusively until it is reaped.

use crossbeam::queue::ArrayQueue;

use crate::core::math;
use crate::core::release::Disposable;
use crate::effect::AudioEffectChain;
use crate::envelope::{Envelope, EnvelopeSpec, EnvelopeState};
use crate::global::GlobalEngine;
use crate::modulation::GenericModulator;
use crate::parameter::AudioParameterPool;
use crate::stream::AudioStream;
use crate::{DEFAULT_SAMPLE_RATE, DEFAULT_VOICE_POOL_SIZE};

/// Modulator variable slots published by the voice.
pub mod voice_mod {
    /// MIDI key that triggered the voice.
    pub const KEY: usize = 0;
    /// Root key of the sample mapping.
    pub const ROOT_KEY: usize = 1;
    /// Written back into the voice's smoothed gain parameter.
    pub const GAIN: usize = 2;
    /// Written back into the voice's smoothed pitch parameter.
    pub const PITCH: usize = 3;
    /// Current envelope level, updated per block.
    pub const ENVELOPE: usize = 4;
    /// Seconds since the voice started, updated per block.
    pub const TIME: usize = 5;
    pub const NUM_MODS: usize = 6;
}

/// Everything a voice needs to start playing. Built on the audio thread
/// from an engine trigger; the heap attachments (fx chain, modulator) are
/// moved in, never copied.
pub struct VoiceTrigger {
    pub voice_id: u64,
    pub key: i32,
    pub root_key: i32,
    pub gain: f32,
    pub tune: f32,
    pub envelope: EnvelopeSpec,
    pub fx_chain: Option<Box<AudioEffectChain>>,
    pub modulator: Option<Box<GenericModulator>>,
}

impl Default for VoiceTrigger {
    fn default() -> Self {
        Self {
            voice_id: 0,
            key: -1,
            root_key: -1,
            gain: 1.0,
            tune: 1.0,
            envelope: EnvelopeSpec::default(),
            fx_chain: None,
            modulator: None,
        }
    }
}

/// A single playing voice.
pub struct Voice {
    trigger: VoiceTrigger,
    stream: Option<AudioStream>,

    /// Engine sample rate at trigger time.
    sample_rate: f32,
    /// Stream-vs-engine sample rate ratio.
    sr_adjust: f32,
    /// Playback speed: tune x sample rate adjustment.
    speed: f32,

    // 4-tap interpolator state. Each tap is mirrored 4 slots up so the
    // kernel can read a contiguous window without a modulo.
    acc_l: [f32; 8],
    acc_r: [f32; 8],
    acc_index: usize,
    acc_frac: f32,

    envelope: Envelope,
    params: AudioParameterPool,

    /// Output frames produced since trigger.
    sample_pos: usize,
    /// Frames of effect tail left to drain after the envelope closed.
    fx_tail_countdown: i64,
}

impl Voice {
    pub const GAIN: usize = 0;
    pub const PITCH: usize = 1;
    pub const NUM_PARAMS: usize = 2;

    pub(crate) fn new() -> Self {
        let mut params = AudioParameterPool::new(Self::NUM_PARAMS);
        params[Self::GAIN].set_name("gain");
        params[Self::GAIN].set_range(0.0, 16.0); // Allow +24dB gain
        params[Self::GAIN].set_value(1.0, true);

        params[Self::PITCH].set_name("pitch");
        params[Self::PITCH].set_range(0.0, 4.0);
        params[Self::PITCH].set_value(1.0, true);

        Self {
            trigger: VoiceTrigger::default(),
            stream: None,
            sample_rate: DEFAULT_SAMPLE_RATE,
            sr_adjust: 1.0,
            speed: 1.0,
            acc_l: [0.0; 8],
            acc_r: [0.0; 8],
            acc_index: 0,
            acc_frac: 0.0,
            envelope: Envelope::new(),
            params,
            sample_pos: 0,
            fx_tail_countdown: 0,
        }
    }

    pub fn voice_id(&self) -> u64 {
        self.trigger.voice_id
    }

    pub fn is_for_key(&self, key: i32) -> bool {
        self.trigger.key == key
    }

    pub fn parameters(&mut self) -> &mut AudioParameterPool {
        &mut self.params
    }

    /// True when the voice has nothing left to produce: the envelope is
    /// closed, any effect tail has drained, and a depleted stream counts
    /// as finished even if the envelope is still open.
    pub fn is_over(&self) -> bool {
        if self.fx_tail_countdown > 0 {
            return false;
        }

        let over = self.envelope.state() == EnvelopeState::Off;
        if !over {
            if let Some(stream) = &self.stream {
                return stream.is_over();
            }
        }

        over
    }

    /// Binds the voice to a stream and starts its envelope.
    pub(crate) fn trigger(
        &mut self,
        engine_sample_rate: f32,
        mut trigger: VoiceTrigger,
        stream: AudioStream,
    ) {
        self.acc_l = [0.0; 8];
        self.acc_r = [0.0; 8];
        self.acc_index = 0;
        self.acc_frac = 0.0;
        self.sample_pos = 0;
        self.fx_tail_countdown = 0;

        self.sample_rate = engine_sample_rate;
        self.sr_adjust = stream.sample_rate() / engine_sample_rate;
        self.speed = trigger.tune * self.sr_adjust;

        self.params[Self::GAIN].set_value(1.0, true);
        self.params[Self::PITCH].set_value(1.0, true);

        trigger.envelope.sample_rate = engine_sample_rate;
        self.envelope.trigger(&trigger.envelope);

        if let Some(modulator) = trigger.modulator.as_mut() {
            modulator.set(voice_mod::KEY, trigger.key as f32);
            modulator.set(voice_mod::ROOT_KEY, trigger.root_key as f32);
            modulator.set(voice_mod::GAIN, 1.0);
            modulator.set(voice_mod::PITCH, 1.0);
            modulator.set(voice_mod::ENVELOPE, 0.0);
            modulator.set(voice_mod::TIME, 0.0);
        }

        self.trigger = trigger;
        self.stream = Some(stream);
    }

    /// Produces one block. Output buffers are overwritten, not mixed into.
    pub fn process(&mut self, out_l: &mut [f32], out_r: &mut [f32]) {
        let num_frames = out_l.len().min(out_r.len());

        // The envelope has closed but the chain still rings: feed it
        // silence until the tail elapses.
        if self.envelope.state() == EnvelopeState::Off && self.fx_tail_countdown > 0 {
            let frames_this_time = (num_frames as i64).min(self.fx_tail_countdown);
            out_l[..num_frames].fill(0.0);
            out_r[..num_frames].fill(0.0);
            if let Some(chain) = self.trigger.fx_chain.as_mut() {
                chain.process(&mut out_l[..num_frames], &mut out_r[..num_frames]);
            }
            self.fx_tail_countdown -= frames_this_time;
            return;
        }

        self.modulate_on_process();

        let mut generated = 0;

        if let Some(stream) = self.stream.as_mut() {
            let mut stream_active = true;
            while stream_active && generated < num_frames {
                let step = self.speed * self.params[Self::PITCH].next_value();
                self.acc_frac += step;

                while self.acc_frac >= 1.0 {
                    let (l, r) = match stream.read_one() {
                        Some(frame) => frame,
                        None => {
                            stream_active = false;
                            (0.0, 0.0)
                        }
                    };

                    self.acc_l[self.acc_index] = l;
                    self.acc_l[self.acc_index + 4] = l;
                    self.acc_r[self.acc_index] = r;
                    self.acc_r[self.acc_index + 4] = r;
                    self.acc_index = (self.acc_index + 1) % 4;
                    self.acc_frac -= 1.0;
                }

                out_l[generated] = math::lagrange(
                    &self.acc_l[self.acc_index..self.acc_index + 4],
                    self.acc_frac,
                );
                out_r[generated] = math::lagrange(
                    &self.acc_r[self.acc_index..self.acc_index + 4],
                    self.acc_frac,
                );
                generated += 1;
            }
        }

        if generated < num_frames {
            out_l[generated..num_frames].fill(0.0);
            out_r[generated..num_frames].fill(0.0);

            // A depleted stream releases the voice; a transient underrun
            // just leaves a gap and keeps going.
            if self.stream.as_ref().map_or(false, |s| s.is_over()) {
                self.release();
            }
        }

        for i in 0..num_frames {
            let gain =
                self.envelope.next() * self.trigger.gain * self.params[Self::GAIN].next_value();
            out_l[i] *= gain;
            out_r[i] *= gain;
        }

        if self.envelope.state() == EnvelopeState::Off {
            if let Some(stream) = self.stream.as_mut() {
                stream.release();
            }
            self.fx_tail_countdown = self
                .trigger
                .fx_chain
                .as_ref()
                .map_or(0, |chain| chain.tail_length());
        }

        if let Some(chain) = self.trigger.fx_chain.as_mut() {
            chain.process(&mut out_l[..num_frames], &mut out_r[..num_frames]);
        }

        self.sample_pos += num_frames;
    }

    /// Releases with the envelope's own release time.
    pub fn release(&mut self) {
        self.envelope.release();
    }

    /// Releases with an overridden release time in seconds.
    pub fn release_with_time(&mut self, time: f32) {
        self.envelope.release_with_time(time);
    }

    /// Detaches the stream lease so the caller can return it to its pool.
    pub(crate) fn take_stream(&mut self) -> Option<AudioStream> {
        self.stream.take()
    }

    pub fn stream(&self) -> Option<&AudioStream> {
        self.stream.as_ref()
    }

    /// Clears per-lease state, shipping heap attachments to the release
    /// pool. Called on the audio thread right before the voice returns to
    /// the pool.
    pub(crate) fn reset(&mut self, global: &GlobalEngine) {
        self.sample_pos = 0;
        self.fx_tail_countdown = 0;
        self.params[Self::GAIN].set_value(1.0, true);
        self.params[Self::PITCH].set_value(1.0, true);

        if let Some(chain) = self.trigger.fx_chain.take() {
            global.release_object(Disposable::FxChain(chain));
        }
        if let Some(modulator) = self.trigger.modulator.take() {
            global.release_object(Disposable::Modulator(modulator));
        }
    }

    /// Publishes per-block modulator inputs, evaluates the program, and
    /// folds the results back into the smoothed parameters.
    fn modulate_on_process(&mut self) {
        let Some(modulator) = self.trigger.modulator.as_mut() else {
            return;
        };
        if !modulator.has_program() {
            return;
        }

        modulator.set(voice_mod::ENVELOPE, self.envelope.level());
        modulator.set(voice_mod::TIME, self.sample_pos as f32 / self.sample_rate);
        modulator.eval();

        self.params[Self::GAIN].set_value(modulator.get(voice_mod::GAIN), false);
        self.params[Self::PITCH].set_value(modulator.get(voice_mod::PITCH), false);
    }
}

impl std::fmt::Debug for Voice {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Voice")
            .field("voice_id", &self.trigger.voice_id)
            .field("envelope", &self.envelope.state())
            .field("has_stream", &self.stream.is_some())
            .finish()
    }
}

/// Preallocated pool of voices shared by all engines in the process.
pub struct VoicePool {
    idle: ArrayQueue<Box<Voice>>,
    size: usize,
}

impl VoicePool {
    pub fn new(size: usize) -> Self {
        let idle = ArrayQueue::new(size);
        for _ in 0..size {
            let _ = idle.push(Box::new(Voice::new()));
        }
        Self { idle, size }
    }

    /// Leases a voice. Returns None when every voice is active.
    pub fn acquire(&self) -> Option<Box<Voice>> {
        self.idle.pop()
    }

    /// Returns a voice to the idle list.
    pub fn release(&self, voice: Box<Voice>) {
        let _ = self.idle.push(voice);
    }

    pub fn num_active_voices(&self) -> usize {
        self.size - self.idle.len()
    }

    pub fn num_idle_voices(&self) -> usize {
        self.idle.len()
    }

    pub fn size(&self) -> usize {
        self.size
    }
}

impl Default for VoicePool {
    fn default() -> Self {
        Self::new(DEFAULT_VOICE_POOL_SIZE)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio_file::AudioFormat;
    use crate::core::worker::Worker;
    use crate::effect::test_effects::ScaleEffect;
    use crate::sample::Sample;
    use crate::testutil;
    use crate::MIX_BUFFER_NUM_FRAMES;
    use std::path::Path;
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;

    fn constant_sample(dir: &Path, value: f32, num_frames: usize) -> Arc<Sample> {
        let path = dir.join(format!("const_{value}.wav"));
        testutil::write_wav(
            &path,
            &[vec![value; num_frames], vec![value; num_frames]],
            44100,
        );
        let sample = Arc::new(Sample::new(&path, AudioFormat::WavPcm, 0, 0));
        sample.preload(num_frames).expect("preload");
        sample
    }

    fn triggered_voice(
        sample: Arc<Sample>,
        worker: &Worker,
        trigger: VoiceTrigger,
    ) -> Voice {
        let mut stream = {
            let pool = crate::stream::AudioStreamPool::new(1, 1024);
            pool.acquire().expect("stream")
        };
        stream.trigger(sample, worker.handle(), 0, None);

        let mut voice = Voice::new();
        voice.trigger(44100.0, trigger, stream);
        voice
    }

    fn process_block(voice: &mut Voice) -> (Vec<f32>, Vec<f32>) {
        let mut left = vec![0.0; MIX_BUFFER_NUM_FRAMES];
        let mut right = vec![0.0; MIX_BUFFER_NUM_FRAMES];
        voice.process(&mut left, &mut right);
        (left, right)
    }

    #[test]
    fn test_voice_plays_at_unit_speed() {
        let dir = tempfile::tempdir().expect("tempdir");
        let worker = Worker::new("test-voice");
        worker.start();

        // Instant attack, full sustain: steady 0.5 after the interpolator
        // warms up.
        let sample = constant_sample(dir.path(), 0.5, 4096);
        let mut voice = triggered_voice(sample, &worker, VoiceTrigger::default());

        let (left, right) = process_block(&mut voice);
        for i in 4..MIX_BUFFER_NUM_FRAMES {
            assert!((left[i] - 0.5).abs() < 1e-4, "left frame {i}: {}", left[i]);
            assert!((right[i] - 0.5).abs() < 1e-4, "right frame {i}");
        }
        assert!(!voice.is_over());

        worker.stop();
    }

    #[test]
    fn test_trigger_gain_scales_output() {
        let dir = tempfile::tempdir().expect("tempdir");
        let worker = Worker::new("test-voice");
        worker.start();

        let sample = constant_sample(dir.path(), 0.5, 4096);
        let trigger = VoiceTrigger {
            gain: 0.5,
            ..VoiceTrigger::default()
        };
        let mut voice = triggered_voice(sample, &worker, trigger);

        let (left, _) = process_block(&mut voice);
        for i in 4..MIX_BUFFER_NUM_FRAMES {
            assert!((left[i] - 0.25).abs() < 1e-4, "frame {i}: {}", left[i]);
        }

        worker.stop();
    }

    #[test]
    fn test_tune_doubles_consumption() {
        let dir = tempfile::tempdir().expect("tempdir");
        let worker = Worker::new("test-voice");
        worker.start();

        // 128 source frames at tune 2.0 are exhausted after ~64 output
        // frames; the rest of the output is silence and the voice winds
        // down via its stream.
        let sample = constant_sample(dir.path(), 0.5, 128);
        let trigger = VoiceTrigger {
            tune: 2.0,
            ..VoiceTrigger::default()
        };
        let mut voice = triggered_voice(sample, &worker, trigger);

        let mut nonzero_frames = 0;
        for _ in 0..8 {
            let (left, _) = process_block(&mut voice);
            nonzero_frames += left.iter().filter(|&&s| s.abs() > 1e-4).count();
            if voice.is_over() {
                break;
            }
            thread::sleep(Duration::from_millis(2));
        }

        assert!(
            (56..=72).contains(&nonzero_frames),
            "expected ~64 audible frames, got {nonzero_frames}"
        );

        worker.stop();
    }

    #[test]
    fn test_release_closes_voice() {
        let dir = tempfile::tempdir().expect("tempdir");
        let worker = Worker::new("test-voice");
        worker.start();

        let sample = constant_sample(dir.path(), 0.5, 44100);
        let trigger = VoiceTrigger {
            envelope: EnvelopeSpec {
                release: 0.0001,
                ..EnvelopeSpec::default()
            },
            ..VoiceTrigger::default()
        };
        let mut voice = triggered_voice(sample, &worker, trigger);

        process_block(&mut voice);
        assert!(!voice.is_over());

        voice.release();
        for _ in 0..64 {
            process_block(&mut voice);
            if voice.is_over() {
                break;
            }
        }
        assert!(voice.is_over());

        // The voice initiated the stream's wind-down when its envelope
        // closed; leftover ring content is discarded on the next lease.
        use crate::stream::StreamState;
        let state = voice.stream().expect("stream still bound").state();
        assert!(
            matches!(state, StreamState::Finishing | StreamState::Over),
            "stream still {state:?}"
        );

        worker.stop();
    }

    #[test]
    fn test_release_with_time_is_immediate_at_zero() {
        let dir = tempfile::tempdir().expect("tempdir");
        let worker = Worker::new("test-voice");
        worker.start();

        let sample = constant_sample(dir.path(), 0.5, 44100);
        let trigger = VoiceTrigger {
            envelope: EnvelopeSpec {
                release: 100.0,
                ..EnvelopeSpec::default()
            },
            ..VoiceTrigger::default()
        };
        let mut voice = triggered_voice(sample, &worker, trigger);
        process_block(&mut voice);

        voice.release_with_time(0.0);
        let (left, _) = process_block(&mut voice);

        // The level dies within the block despite the 100s trigger value.
        assert!(left[MIX_BUFFER_NUM_FRAMES - 1].abs() < 1e-4);
        assert!(voice.is_over());

        worker.stop();
    }

    #[test]
    fn test_fx_chain_processes_output() {
        let dir = tempfile::tempdir().expect("tempdir");
        let worker = Worker::new("test-voice");
        worker.start();

        let sample = constant_sample(dir.path(), 0.5, 4096);
        let mut chain = Box::new(AudioEffectChain::new());
        chain.add_effect(Box::new(ScaleEffect::new(2.0)));
        let trigger = VoiceTrigger {
            fx_chain: Some(chain),
            ..VoiceTrigger::default()
        };
        let mut voice = triggered_voice(sample, &worker, trigger);

        let (left, _) = process_block(&mut voice);
        for i in 4..MIX_BUFFER_NUM_FRAMES {
            assert!((left[i] - 1.0).abs() < 1e-4, "frame {i}: {}", left[i]);
        }

        worker.stop();
    }

    #[test]
    fn test_fx_tail_keeps_voice_alive() {
        let dir = tempfile::tempdir().expect("tempdir");
        let worker = Worker::new("test-voice");
        worker.start();

        let sample = constant_sample(dir.path(), 0.5, 44100);
        let tail_frames = 2 * MIX_BUFFER_NUM_FRAMES as i64;
        let mut chain = Box::new(AudioEffectChain::new());
        chain.add_effect(Box::new(ScaleEffect::with_tail(1.0, tail_frames)));
        let trigger = VoiceTrigger {
            envelope: EnvelopeSpec {
                release: 0.0,
                ..EnvelopeSpec::default()
            },
            fx_chain: Some(chain),
            ..VoiceTrigger::default()
        };
        let mut voice = triggered_voice(sample, &worker, trigger);

        process_block(&mut voice);
        voice.release_with_time(0.0);
        process_block(&mut voice);

        // Envelope is closed but the tail holds the voice open for two
        // more blocks.
        assert!(!voice.is_over());
        process_block(&mut voice);
        assert!(!voice.is_over());
        process_block(&mut voice);
        assert!(voice.is_over());

        worker.stop();
    }

    #[test]
    fn test_unbounded_tail_reaps_on_envelope_close() {
        let dir = tempfile::tempdir().expect("tempdir");
        let worker = Worker::new("test-voice");
        worker.start();

        let sample = constant_sample(dir.path(), 0.5, 44100);
        let mut chain = Box::new(AudioEffectChain::new());
        chain.add_effect(Box::new(ScaleEffect::with_tail(1.0, -1)));
        let trigger = VoiceTrigger {
            fx_chain: Some(chain),
            ..VoiceTrigger::default()
        };
        let mut voice = triggered_voice(sample, &worker, trigger);

        process_block(&mut voice);
        voice.release_with_time(0.0);
        process_block(&mut voice);

        // Negative (unbounded) tails never hold the voice open.
        assert!(voice.is_over());

        worker.stop();
    }

    #[test]
    fn test_modulator_drives_gain() {
        let dir = tempfile::tempdir().expect("tempdir");
        let worker = Worker::new("test-voice");
        worker.start();

        let sample = constant_sample(dir.path(), 0.5, 44100);
        let mut modulator = Box::new(GenericModulator::new(voice_mod::NUM_MODS));
        modulator.set_program(Box::new(|vars: &mut [f32]| {
            vars[voice_mod::GAIN] = 0.0;
        }));
        let trigger = VoiceTrigger {
            modulator: Some(modulator),
            ..VoiceTrigger::default()
        };
        let mut voice = triggered_voice(sample, &worker, trigger);

        // The smoothed gain parameter converges to the modulator's zero.
        let mut last_peak = f32::MAX;
        for _ in 0..16 {
            let (left, _) = process_block(&mut voice);
            let peak = left.iter().fold(0.0f32, |m, &s| m.max(s.abs()));
            assert!(peak <= last_peak + 1e-6);
            last_peak = peak;
        }
        assert!(last_peak < 1e-3, "gain did not converge: {last_peak}");

        worker.stop();
    }

    #[test]
    fn test_pool_lease_accounting() {
        let pool = VoicePool::new(4);
        assert_eq!(pool.num_idle_voices(), 4);
        assert_eq!(pool.num_active_voices(), 0);

        let a = pool.acquire().expect("voice");
        let b = pool.acquire().expect("voice");
        assert_eq!(pool.num_active_voices(), 2);

        pool.release(a);
        pool.release(b);
        assert_eq!(pool.num_idle_voices(), 4);

        // Exhaustion is observable.
        let leased: Vec<_> = (0..4).map(|_| pool.acquire().expect("voice")).collect();
        assert!(pool.acquire().is_none());
        for voice in leased {
            pool.release(voice);
        }
    }
}
