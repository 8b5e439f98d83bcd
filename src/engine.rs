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

//! The sampler engine.
//!
//! The engine is split down the real-time boundary. [`Engine`] is the
//! audio-thread half: it owns the buses and the consumer ends of the
//! command queues, and everything it does is allocation- and lock-free.
//! [`EngineHandle`] is the cloneable control-thread half: it registers
//! samples, enqueues triggers, releases and actuators, and carries the soft
//! state (CC values, transport, keyboard).
//!
//! Once per block, before any bus is mixed, the audio thread drains the
//! command queues in a fixed order: triggers, then releases, then
//! actuators. Triggers precede releases so a trigger and release of the
//! same voice landing in one block cannot leave a stuck voice.
//!
//! Every failure on the audio thread is a silent drop, and every dropped
//! command ships its heap attachments to the release pool so nothing is
//! freed on the audio thread and nothing leaks.

use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, MutexGuard};
use ringbuf::traits::{Consumer, Producer, Split};
use ringbuf::{HeapCons, HeapProd, HeapRb};
use tracing::{debug, info};

use crate::bus::{AudioBus, AudioBusPool};
use crate::config::EngineConfig;
use crate::core::release::Disposable;
use crate::effect::AudioEffectChain;
use crate::envelope::EnvelopeSpec;
use crate::global::GlobalEngine;
use crate::midi::MidiKeyboardState;
use crate::modulation::GenericModulator;
use crate::sample::{Sample, SampleError};
use crate::stream::LoopConfig;
use crate::voice::VoiceTrigger;
use crate::{
    DEFAULT_ACTUATOR_BUFFER_SIZE, DEFAULT_RELEASE_BUFFER_SIZE, DEFAULT_SAMPLE_RATE,
    DEFAULT_TRIGGER_BUFFER_SIZE, DEFAULT_XFADE_BUFFER_SIZE, MIX_BUFFER_NUM_FRAMES, NUM_BUSES,
    NUM_CC_PARAMETERS,
};

/// Everything needed to start a voice. Built by the control thread; the
/// sample handle is resolved at enqueue time so the audio thread never
/// touches the sample registry.
pub struct Trigger {
    pub sample_id: u64,
    pub bus_number: usize,
    pub key: i32,
    pub root_key: i32,
    /// Playback start offset into the preloaded head, in frames.
    pub offset: usize,
    /// Loop start in frames; negative disables looping.
    pub loop_begin: i64,
    /// Loop end in frames; negative disables looping.
    pub loop_end: i64,
    pub loop_xfade: usize,
    pub gain: f32,
    pub tune: f32,
    pub envelope: EnvelopeSpec,
    pub fx_chain: Option<Box<AudioEffectChain>>,
    pub modulator: Option<Box<GenericModulator>>,

    /// Assigned by the engine when the trigger is enqueued; caller values
    /// are overwritten.
    pub voice_id: u64,
    /// Resolved from `sample_id` at enqueue time; caller values are
    /// overwritten.
    pub sample: Option<Arc<Sample>>,
}

impl Default for Trigger {
    fn default() -> Self {
        Self {
            sample_id: 0,
            bus_number: 0,
            key: -1,
            root_key: -1,
            offset: 0,
            loop_begin: -1,
            loop_end: -1,
            loop_xfade: DEFAULT_XFADE_BUFFER_SIZE,
            gain: 1.0,
            tune: 1.0,
            envelope: EnvelopeSpec::default(),
            fx_chain: None,
            modulator: None,
            voice_id: 0,
            sample: None,
        }
    }
}

/// Voice release command. A negative release time means "use the voice's
/// own envelope release".
#[derive(Debug, Clone, Copy)]
pub struct Release {
    pub voice_id: u64,
    pub release_time: f32,
}

/// Host transport snapshot, readable by modulators.
#[derive(Debug, Clone, Copy)]
pub struct TransportInfo {
    pub bpm: f64,
    pub time: f64,
    pub ppq_position: f64,
}

impl Default for TransportInfo {
    fn default() -> Self {
        Self {
            bpm: 120.0,
            time: 0.0,
            ppq_position: 0.0,
        }
    }
}

/// A callable executed exactly once on the audio thread; its environment
/// is freed on the background worker afterwards.
type ActuatorFn = Box<dyn FnMut() + Send>;

struct TransportCell {
    bpm: AtomicU64,
    time: AtomicU64,
    ppq: AtomicU64,
}

impl TransportCell {
    fn new(info: TransportInfo) -> Self {
        Self {
            bpm: AtomicU64::new(info.bpm.to_bits()),
            time: AtomicU64::new(info.time.to_bits()),
            ppq: AtomicU64::new(info.ppq_position.to_bits()),
        }
    }

    fn store(&self, info: TransportInfo) {
        self.bpm.store(info.bpm.to_bits(), Ordering::Release);
        self.time.store(info.time.to_bits(), Ordering::Release);
        self.ppq.store(info.ppq_position.to_bits(), Ordering::Release);
    }

    fn load(&self) -> TransportInfo {
        TransportInfo {
            bpm: f64::from_bits(self.bpm.load(Ordering::Acquire)),
            time: f64::from_bits(self.time.load(Ordering::Acquire)),
            ppq_position: f64::from_bits(self.ppq.load(Ordering::Acquire)),
        }
    }
}

/// State shared between the engine and its handles.
struct EngineShared {
    global: Arc<GlobalEngine>,

    triggers_tx: Mutex<HeapProd<Trigger>>,
    releases_tx: Mutex<HeapProd<Release>>,
    actuators_tx: Mutex<HeapProd<ActuatorFn>>,

    samples: Mutex<HashMap<u64, Arc<Sample>>>,
    next_voice_id: AtomicU64,
    next_sample_id: AtomicU64,

    sample_rate: AtomicU32,
    non_real_time: AtomicBool,
    cc: Vec<AtomicU32>,
    transport: TransportCell,
    keyboard: Mutex<MidiKeyboardState>,
}

/// The audio-thread half of the engine.
pub struct Engine {
    shared: Arc<EngineShared>,
    bus_pool: AudioBusPool,

    triggers_rx: HeapCons<Trigger>,
    releases_rx: HeapCons<Release>,
    actuators_rx: HeapCons<ActuatorFn>,

    sample_rate: f32,
    frame_size: usize,
}

impl Engine {
    /// Creates an engine bound to the process-wide shared resources.
    pub fn new(num_buses: usize) -> Self {
        Self::with_global(GlobalEngine::instance(), num_buses)
    }

    /// Creates an engine from a config, creating the process-wide shared
    /// resources from the same config if they do not exist yet.
    pub fn with_config(config: &EngineConfig) -> Self {
        Self::with_global(GlobalEngine::instance_with(config), config.num_buses)
    }

    /// Creates an engine on an explicit resource domain.
    pub fn with_global(global: Arc<GlobalEngine>, num_buses: usize) -> Self {
        let (triggers_tx, triggers_rx) =
            HeapRb::<Trigger>::new(DEFAULT_TRIGGER_BUFFER_SIZE).split();
        let (releases_tx, releases_rx) =
            HeapRb::<Release>::new(DEFAULT_RELEASE_BUFFER_SIZE).split();
        let (actuators_tx, actuators_rx) =
            HeapRb::<ActuatorFn>::new(DEFAULT_ACTUATOR_BUFFER_SIZE).split();

        let voice_capacity = global.voice_pool().size();

        let shared = Arc::new(EngineShared {
            global,
            triggers_tx: Mutex::new(triggers_tx),
            releases_tx: Mutex::new(releases_tx),
            actuators_tx: Mutex::new(actuators_tx),
            samples: Mutex::new(HashMap::new()),
            next_voice_id: AtomicU64::new(0),
            next_sample_id: AtomicU64::new(0),
            sample_rate: AtomicU32::new(DEFAULT_SAMPLE_RATE.to_bits()),
            non_real_time: AtomicBool::new(false),
            cc: (0..NUM_CC_PARAMETERS).map(|_| AtomicU32::new(0)).collect(),
            transport: TransportCell::new(TransportInfo::default()),
            keyboard: Mutex::new(MidiKeyboardState::new()),
        });

        info!(num_buses, "Engine created");

        Self {
            shared,
            bus_pool: AudioBusPool::new(num_buses, voice_capacity),
            triggers_rx,
            releases_rx,
            actuators_rx,
            sample_rate: DEFAULT_SAMPLE_RATE,
            frame_size: MIX_BUFFER_NUM_FRAMES,
        }
    }

    /// Returns a cloneable control-thread handle.
    pub fn handle(&self) -> EngineHandle {
        EngineHandle {
            shared: self.shared.clone(),
        }
    }

    pub fn sample_rate(&self) -> f32 {
        self.sample_rate
    }

    pub fn frame_size(&self) -> usize {
        self.frame_size
    }

    pub fn bus_pool(&mut self) -> &mut AudioBusPool {
        &mut self.bus_pool
    }

    pub fn bus(&mut self, index: usize) -> Option<&mut AudioBus> {
        self.bus_pool.bus(index)
    }

    pub fn global(&self) -> Arc<GlobalEngine> {
        self.shared.global.clone()
    }

    /// CC parameter read for modulators on the audio thread.
    pub fn cc(&self, index: usize) -> f32 {
        self.shared
            .cc
            .get(index)
            .map_or(0.0, |v| f32::from_bits(v.load(Ordering::Acquire)))
    }

    pub fn transport_info(&self) -> TransportInfo {
        self.shared.transport.load()
    }

    /// Marks the engine as rendering offline (faster than real time).
    /// Purely advisory; readable by effects and embedder code.
    pub fn set_non_realtime(&self, non_real_time: bool) {
        self.shared
            .non_real_time
            .store(non_real_time, Ordering::Release);
    }

    pub fn is_non_realtime(&self) -> bool {
        self.shared.non_real_time.load(Ordering::Acquire)
    }

    /// Sets the sample rate and block size and prepares all buses.
    pub fn prepare_to_play(&mut self, sample_rate: f32, frame_size: usize) {
        self.sample_rate = sample_rate;
        self.frame_size = frame_size;
        self.shared
            .sample_rate
            .store(sample_rate.to_bits(), Ordering::Release);
        self.bus_pool.prepare_to_play(sample_rate);

        info!(sample_rate, frame_size, "Engine prepared");
    }

    /// Kills all voices, clears all bus effect chains, and zeroes the soft
    /// state. Not for the audio callback; heap handles still go through
    /// the release pool, but the keyboard lock is taken.
    pub fn reset(&mut self) {
        let global = self.shared.global.clone();
        self.bus_pool.kill_all_voices(&global);
        self.bus_pool.clear_fx_chains(&global);

        for cc in &self.shared.cc {
            cc.store(0, Ordering::Release);
        }
        self.shared.keyboard.lock().reset();

        info!("Engine reset");
    }

    /// Drains all pending commands. Must be called once per audio block,
    /// before any bus is processed.
    pub fn process_audio_events(&mut self) {
        // Releases must come after triggers, otherwise a same-block
        // trigger/release pair would leave the voice stuck.
        self.process_triggers();
        self.process_releases();
        self.process_actuators();
    }

    /// Convenience block driver: chunks the host buffer into mix-sized
    /// blocks, processing events once per chunk and accumulating every bus
    /// into the output.
    pub fn process(&mut self, out_l: &mut [f32], out_r: &mut [f32]) {
        let total = out_l.len().min(out_r.len());
        let global = self.shared.global.clone();

        let mut offset = 0;
        while offset < total {
            let block = (total - offset).min(MIX_BUFFER_NUM_FRAMES);
            self.process_audio_events();

            for bus in self.bus_pool.buses_mut() {
                bus.process_and_mix(
                    &mut out_l[offset..offset + block],
                    &mut out_r[offset..offset + block],
                    &global,
                );
            }

            offset += block;
        }
    }

    fn process_triggers(&mut self) {
        let global = self.shared.global.clone();

        while let Some(mut trigger) = self.triggers_rx.try_pop() {
            if trigger.bus_number >= self.bus_pool.len() {
                Self::dispose_trigger(&global, &mut trigger);
                continue;
            }

            // Unknown sample id, or the preload worker has not caught up
            // with this sample yet. Never force a preload here.
            if !trigger.sample.as_ref().map_or(false, |s| s.is_preloaded()) {
                Self::dispose_trigger(&global, &mut trigger);
                continue;
            }

            let Some(mut stream) = global.stream_pool().acquire() else {
                Self::dispose_trigger(&global, &mut trigger);
                continue;
            };

            let Some(sample) = trigger.sample.take() else {
                global.stream_pool().release(stream);
                continue;
            };

            let loop_cfg = LoopConfig::normalize(
                &sample,
                trigger.loop_begin,
                trigger.loop_end + sample.stop_position() as i64,
                trigger.loop_xfade,
            );
            stream.trigger(
                sample,
                global.next_stream_worker(),
                trigger.offset,
                loop_cfg,
            );

            let voice_trigger = VoiceTrigger {
                voice_id: trigger.voice_id,
                key: trigger.key,
                root_key: trigger.root_key,
                gain: trigger.gain,
                tune: trigger.tune,
                envelope: trigger.envelope,
                fx_chain: trigger.fx_chain.take(),
                modulator: trigger.modulator.take(),
            };

            let bus = self
                .bus_pool
                .bus(trigger.bus_number)
                .expect("bus index validated above");
            if let Err((mut rejected, mut stream)) = bus.trigger(voice_trigger, stream, &global) {
                // No free voice: wind the stream back down and release the
                // attachments.
                stream.release();
                global.return_stream(stream);
                if let Some(chain) = rejected.fx_chain.take() {
                    global.release_object(Disposable::FxChain(chain));
                }
                if let Some(modulator) = rejected.modulator.take() {
                    global.release_object(Disposable::Modulator(modulator));
                }
            }
        }
    }

    fn process_releases(&mut self) {
        while let Some(release) = self.releases_rx.try_pop() {
            if let Some(voice) = self.bus_pool.find_voice_with_id(release.voice_id) {
                if release.release_time < 0.0 {
                    voice.release();
                } else {
                    voice.release_with_time(release.release_time);
                }
            }
        }
    }

    fn process_actuators(&mut self) {
        while let Some(mut actuator) = self.actuators_rx.try_pop() {
            actuator();
            self.shared
                .global
                .release_object(Disposable::Actuator(actuator));
        }
    }

    /// Ships a dropped trigger's heap attachments to the release pool.
    fn dispose_trigger(global: &GlobalEngine, trigger: &mut Trigger) {
        if let Some(sample) = trigger.sample.take() {
            global.release_object(Disposable::Sample(sample));
        }
        if let Some(chain) = trigger.fx_chain.take() {
            global.release_object(Disposable::FxChain(chain));
        }
        if let Some(modulator) = trigger.modulator.take() {
            global.release_object(Disposable::Modulator(modulator));
        }
    }
}

impl Default for Engine {
    fn default() -> Self {
        Self::new(NUM_BUSES)
    }
}

impl Drop for Engine {
    fn drop(&mut self) {
        // Return every leased voice and stream to the shared pools.
        let global = self.shared.global.clone();
        self.bus_pool.kill_all_voices(&global);
    }
}

impl std::fmt::Debug for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine")
            .field("buses", &self.bus_pool.len())
            .field("active_voices", &self.bus_pool.num_active_voices())
            .field("sample_rate", &self.sample_rate)
            .finish()
    }
}

/// The control-thread half of the engine. Cloneable; all methods are
/// thread-safe and may block briefly, but never block the audio thread.
#[derive(Clone)]
pub struct EngineHandle {
    shared: Arc<EngineShared>,
}

impl EngineHandle {
    /// Assigns a voice id and enqueues a trigger. The id is returned even
    /// if the queue is saturated and the trigger is dropped; starting a
    /// voice is always best-effort.
    pub fn trigger_voice(&self, mut trigger: Trigger) -> u64 {
        let voice_id = self.shared.next_voice_id.fetch_add(1, Ordering::Relaxed) + 1;
        trigger.voice_id = voice_id;

        // Resolve the sample here so the audio thread never locks the
        // registry. An unknown id ships None and is dropped over there.
        trigger.sample = self
            .shared
            .samples
            .lock()
            .get(&trigger.sample_id)
            .cloned();

        if let Some(chain) = trigger.fx_chain.as_mut() {
            chain.prepare_to_play(self.sample_rate());
        }

        if self.shared.triggers_tx.lock().try_push(trigger).is_err() {
            debug!(voice_id, "Trigger queue saturated, dropping trigger");
        }

        voice_id
    }

    /// Releases a voice with its own envelope release time.
    pub fn release_voice(&self, voice_id: u64) {
        self.push_release(voice_id, -1.0);
    }

    /// Releases a voice with an overridden release time in seconds.
    pub fn release_voice_with_time(&self, voice_id: u64, release_time: f32) {
        self.push_release(voice_id, release_time);
    }

    /// Enqueues a callable to run once on the audio thread. Asynchronous
    /// and best-effort: returns false when the queue is saturated.
    pub fn trigger_actuator<F>(&self, func: F) -> bool
    where
        F: FnMut() + Send + 'static,
    {
        self.shared
            .actuators_tx
            .lock()
            .try_push(Box::new(func))
            .is_ok()
    }

    /// Registers a sample region and returns its engine-local id. The
    /// sample still needs preloading before it can sound.
    pub fn add_sample(
        &self,
        path: &Path,
        start_pos: u64,
        stop_pos: u64,
    ) -> Result<u64, SampleError> {
        let sample = self
            .shared
            .global
            .sample_pool()
            .add_sample(path, start_pos, stop_pos)?;

        let id = self.shared.next_sample_id.fetch_add(1, Ordering::Relaxed) + 1;
        self.shared.samples.lock().insert(id, sample);

        debug!(id, path = ?path, "Sample registered");
        Ok(id)
    }

    pub fn sample_by_id(&self, id: u64) -> Option<Arc<Sample>> {
        self.shared.samples.lock().get(&id).cloned()
    }

    /// Kicks off background preloading of all registered samples.
    pub fn preload(&self, num_frames: usize) {
        self.shared.global.sample_pool().preload(num_frames);
    }

    pub fn set_cc(&self, index: usize, value: f32) {
        if let Some(slot) = self.shared.cc.get(index) {
            slot.store(value.to_bits(), Ordering::Release);
        }
    }

    pub fn cc(&self, index: usize) -> f32 {
        self.shared
            .cc
            .get(index)
            .map_or(0.0, |v| f32::from_bits(v.load(Ordering::Acquire)))
    }

    pub fn set_transport_info(&self, info: TransportInfo) {
        self.shared.transport.store(info);
    }

    pub fn transport_info(&self) -> TransportInfo {
        self.shared.transport.load()
    }

    /// Keyboard-state bookkeeping for trigger producers.
    pub fn keyboard(&self) -> MutexGuard<'_, MidiKeyboardState> {
        self.shared.keyboard.lock()
    }

    pub fn global(&self) -> Arc<GlobalEngine> {
        self.shared.global.clone()
    }

    fn sample_rate(&self) -> f32 {
        f32::from_bits(self.shared.sample_rate.load(Ordering::Acquire))
    }

    fn push_release(&self, voice_id: u64, release_time: f32) {
        let release = Release {
            voice_id,
            release_time,
        };
        if self.shared.releases_tx.lock().try_push(release).is_err() {
            debug!(voice_id, "Release queue saturated, dropping release");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::effect::test_effects::ScaleEffect;
    use crate::testutil::{self, eventually};
    use std::path::PathBuf;

    fn test_engine(num_buses: usize, pool_size: usize) -> Engine {
        let global = GlobalEngine::create(&EngineConfig {
            num_buses,
            voice_pool_size: pool_size,
            stream_pool_size: pool_size,
            stream_buffer_frames: 2048,
            num_stream_workers: 2,
        });
        let mut engine = Engine::with_global(global, num_buses);
        engine.prepare_to_play(44100.0, MIX_BUFFER_NUM_FRAMES);
        engine
    }

    /// Registers and fully preloads a sine sample, returning its id.
    fn add_tone(engine: &Engine, dir: &Path, num_frames: usize) -> u64 {
        let path: PathBuf = dir.join(format!("tone_{num_frames}.wav"));
        testutil::write_sine_wav(&path, 440.0, 44100, num_frames);

        let handle = engine.handle();
        let id = handle.add_sample(&path, 0, 0).expect("add sample");
        handle.preload(crate::MAX_PRELOAD_BUFFER_SIZE);

        let sample = handle.sample_by_id(id).expect("sample registered");
        eventually(|| sample.is_preloaded(), "sample not preloaded");
        id
    }

    fn run_blocks(engine: &mut Engine, num_blocks: usize) -> Vec<f32> {
        let mut collected = Vec::with_capacity(num_blocks * MIX_BUFFER_NUM_FRAMES);
        let mut left = [0.0f32; MIX_BUFFER_NUM_FRAMES];
        let mut right = [0.0f32; MIX_BUFFER_NUM_FRAMES];
        for _ in 0..num_blocks {
            left.fill(0.0);
            right.fill(0.0);
            engine.process(&mut left, &mut right);
            collected.extend_from_slice(&left);
        }
        collected
    }

    #[test]
    fn test_voice_plays_through_and_is_reaped() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut engine = test_engine(2, 8);
        let handle = engine.handle();

        // One second of audio, fully preloaded for determinism.
        let sample_id = add_tone(&engine, dir.path(), 44100);

        let trigger = Trigger {
            sample_id,
            bus_number: 0,
            envelope: EnvelopeSpec {
                release: 0.0,
                ..EnvelopeSpec::default()
            },
            ..Trigger::default()
        };
        let voice_id = handle.trigger_voice(trigger);
        assert!(voice_id > 0);

        // Two seconds of blocks: sound for the first second, silence after.
        let blocks = 2 * 44100 / MIX_BUFFER_NUM_FRAMES;
        let output = run_blocks(&mut engine, blocks);

        let first_second = &output[..44000];
        let second_second = &output[44200..];
        assert!(first_second.iter().any(|&s| s.abs() > 0.01));
        assert!(second_second.iter().all(|&s| s.abs() < 1e-6));

        // Exactly one voice came and went. The stream worker may still be
        // flagging the depleted file, so pump a few more blocks.
        let global = engine.global();
        for _ in 0..100 {
            if global.voice_pool().num_active_voices() == 0 {
                break;
            }
            let _ = run_blocks(&mut engine, 1);
            std::thread::sleep(std::time::Duration::from_millis(1));
        }
        assert_eq!(global.voice_pool().num_active_voices(), 0);
        assert_eq!(
            global.stream_pool().num_idle(),
            global.stream_pool().size()
        );
    }

    #[test]
    fn test_pool_exhaustion_drops_excess_triggers() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut engine = test_engine(1, 4);
        let handle = engine.handle();

        let sample_id = add_tone(&engine, dir.path(), 44100);

        // Six triggers into a four-voice pool; the overflow must not leak
        // its attachments. Track them through a shared guard.
        let guard = Arc::new(());
        for _ in 0..6 {
            let mut chain = Box::new(AudioEffectChain::new());
            chain.add_effect(Box::new(GuardedEffect {
                _guard: guard.clone(),
            }));
            handle.trigger_voice(Trigger {
                sample_id,
                bus_number: 0,
                fx_chain: Some(chain),
                ..Trigger::default()
            });
        }

        engine.process_audio_events();
        let global = engine.global();
        assert_eq!(global.voice_pool().num_active_voices(), 4);
        assert_eq!(engine.bus_pool.num_active_voices(), 4);

        // The two rejected chains sit in the release pool, exactly once
        // each; draining reclaims them.
        global.drain_release_pool();
        assert_eq!(Arc::strong_count(&guard), 5);

        // Wind everything down; all attachments eventually come home.
        for id in 1..=6u64 {
            handle.release_voice_with_time(id, 0.0);
        }
        let _ = run_blocks(&mut engine, 8);
        eventually(
            || {
                global.drain_release_pool();
                Arc::strong_count(&guard) == 1
            },
            "voice attachments were not reclaimed",
        );
        assert_eq!(global.voice_pool().num_active_voices(), 0);
    }

    struct GuardedEffect {
        _guard: Arc<()>,
    }

    impl crate::effect::AudioEffect for GuardedEffect {
        fn tag(&self) -> &'static str {
            "guarded"
        }

        fn prepare_to_play(&mut self, _sample_rate: f32) {}

        fn process(&mut self, _left: &mut [f32], _right: &mut [f32]) {}
    }

    #[test]
    fn test_same_block_trigger_and_release() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut engine = test_engine(1, 4);
        let handle = engine.handle();

        let sample_id = add_tone(&engine, dir.path(), 44100);
        let voice_id = handle.trigger_voice(Trigger {
            sample_id,
            bus_number: 0,
            ..Trigger::default()
        });
        handle.release_voice_with_time(voice_id, 0.0);

        // Trigger and release land in the same event pass; the voice
        // starts, dies within the block, and is reaped.
        let output = run_blocks(&mut engine, 1);
        assert!(output[MIX_BUFFER_NUM_FRAMES - 1].abs() < 1e-4);
        assert_eq!(engine.global().voice_pool().num_active_voices(), 0);
    }

    #[test]
    fn test_invalid_bus_and_unknown_sample_are_dropped() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut engine = test_engine(2, 4);
        let handle = engine.handle();

        let sample_id = add_tone(&engine, dir.path(), 44100);

        // Bus out of range.
        handle.trigger_voice(Trigger {
            sample_id,
            bus_number: 99,
            ..Trigger::default()
        });
        // Sample id never registered.
        handle.trigger_voice(Trigger {
            sample_id: 4040,
            bus_number: 0,
            ..Trigger::default()
        });

        engine.process_audio_events();
        assert_eq!(engine.global().voice_pool().num_active_voices(), 0);
    }

    #[test]
    fn test_unpreloaded_sample_is_dropped() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut engine = test_engine(1, 4);
        let handle = engine.handle();

        let path = dir.path().join("cold.wav");
        testutil::write_sine_wav(&path, 440.0, 44100, 1000);
        let sample_id = handle.add_sample(&path, 0, 0).expect("add sample");
        // No preload: the audio thread must drop the trigger rather than
        // touch the disk.
        handle.trigger_voice(Trigger {
            sample_id,
            bus_number: 0,
            ..Trigger::default()
        });

        engine.process_audio_events();
        assert_eq!(engine.global().voice_pool().num_active_voices(), 0);
    }

    #[test]
    fn test_add_sample_deduplicates_regions() {
        let dir = tempfile::tempdir().expect("tempdir");
        let engine = test_engine(1, 4);
        let handle = engine.handle();

        let path = dir.path().join("tone.wav");
        testutil::write_sine_wav(&path, 440.0, 44100, 1000);

        let a = handle.add_sample(&path, 0, 0).expect("add");
        let b = handle.add_sample(&path, 0, 0).expect("add again");
        assert_ne!(a, b);

        // Distinct ids, same underlying sample.
        let sample_a = handle.sample_by_id(a).expect("a");
        let sample_b = handle.sample_by_id(b).expect("b");
        assert!(Arc::ptr_eq(&sample_a, &sample_b));
    }

    #[test]
    fn test_actuator_runs_once_on_audio_thread() {
        let mut engine = test_engine(1, 4);
        let handle = engine.handle();

        let count = Arc::new(std::sync::atomic::AtomicUsize::new(0));
        {
            let count = count.clone();
            assert!(handle.trigger_actuator(move || {
                count.fetch_add(1, Ordering::SeqCst);
            }));
        }

        engine.process_audio_events();
        assert_eq!(count.load(Ordering::SeqCst), 1);

        // Already consumed; a second pass does not run it again.
        engine.process_audio_events();
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_cc_transport_and_reset() {
        let mut engine = test_engine(1, 4);
        let handle = engine.handle();

        handle.set_cc(7, 0.5);
        assert_eq!(handle.cc(7), 0.5);
        assert_eq!(engine.cc(7), 0.5);
        assert_eq!(handle.cc(2000), 0.0);

        handle.set_transport_info(TransportInfo {
            bpm: 133.0,
            time: 4.2,
            ppq_position: 16.0,
        });
        assert_eq!(engine.transport_info().bpm, 133.0);

        handle.keyboard().note_on(60);
        assert!(handle.keyboard().is_key_pressed(60));

        engine.reset();
        assert_eq!(handle.cc(7), 0.0);
        assert!(handle.keyboard().is_key_idle(60));
    }

    #[test]
    fn test_reset_reclaims_voices_and_fx() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut engine = test_engine(2, 4);
        let handle = engine.handle();

        let sample_id = add_tone(&engine, dir.path(), 44100);
        for bus in 0..2 {
            handle.trigger_voice(Trigger {
                sample_id,
                bus_number: bus,
                ..Trigger::default()
            });
        }
        engine
            .bus(0)
            .expect("bus")
            .fx_chain()
            .add_effect(Box::new(ScaleEffect::new(2.0)));

        let _ = run_blocks(&mut engine, 2);
        assert_eq!(engine.global().voice_pool().num_active_voices(), 2);

        engine.reset();
        let global = engine.global();
        assert_eq!(global.voice_pool().num_active_voices(), 0);
        assert_eq!(
            global.stream_pool().num_idle(),
            global.stream_pool().size()
        );
        assert!(engine.bus(0).expect("bus").fx_chain().is_empty());
    }

    #[test]
    fn test_trigger_queue_saturation_is_survivable() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut engine = test_engine(1, 4);
        let handle = engine.handle();

        let sample_id = add_tone(&engine, dir.path(), 44100);

        // Far more triggers than the queue holds; ids keep advancing and
        // nothing panics.
        let mut last_id = 0;
        for _ in 0..(DEFAULT_TRIGGER_BUFFER_SIZE + 100) {
            let id = handle.trigger_voice(Trigger {
                sample_id,
                bus_number: 0,
                ..Trigger::default()
            });
            assert!(id > last_id);
            last_id = id;
        }

        engine.process_audio_events();
        // The pool bounds how many actually started.
        assert_eq!(engine.global().voice_pool().num_active_voices(), 4);
        engine.reset();
    }

    #[test]
    fn test_looped_voice_sounds_past_the_file_end() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut engine = test_engine(1, 4);
        let handle = engine.handle();

        // Short sample, preloaded head only; the loop keeps it alive far
        // past its 4000 frames.
        let path = dir.path().join("loop.wav");
        testutil::write_sine_wav(&path, 220.5, 44100, 4000);
        let sample_id = handle.add_sample(&path, 0, 0).expect("add sample");
        handle.preload(256);
        let sample = handle.sample_by_id(sample_id).expect("sample");
        eventually(|| sample.is_preloaded(), "sample not preloaded");

        handle.trigger_voice(Trigger {
            sample_id,
            bus_number: 0,
            loop_begin: 1000,
            loop_end: 3000,
            loop_xfade: 32,
            ..Trigger::default()
        });

        // 8000 frames of output: twice the file length.
        let blocks = 8000 / MIX_BUFFER_NUM_FRAMES;
        let mut audible_blocks = 0;
        for _ in 0..blocks {
            let output = run_blocks(&mut engine, 1);
            if output.iter().any(|&s| s.abs() > 0.01) {
                audible_blocks += 1;
            }
            // Let the stream worker keep up with the loop wraps.
            std::thread::sleep(std::time::Duration::from_micros(200));
        }

        // The voice is still alive and still audible at the end.
        assert_eq!(engine.global().voice_pool().num_active_voices(), 1);
        assert!(
            audible_blocks > blocks * 9 / 10,
            "only {audible_blocks}/{blocks} blocks were audible"
        );

        engine.reset();
    }

    #[test]
    fn test_large_host_buffers_are_chunked() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut engine = test_engine(1, 4);
        let handle = engine.handle();

        let sample_id = add_tone(&engine, dir.path(), 8192);
        handle.trigger_voice(Trigger {
            sample_id,
            bus_number: 0,
            ..Trigger::default()
        });

        // A 1000-frame host buffer is not a multiple of the mix block;
        // the driver chunks it and the trigger still lands in the first
        // chunk.
        let mut left = vec![0.0f32; 1000];
        let mut right = vec![0.0f32; 1000];
        engine.process(&mut left, &mut right);

        assert!(left[..MIX_BUFFER_NUM_FRAMES]
            .iter()
            .any(|&s| s.abs() > 0.0));
        assert!(left[900..].iter().any(|&s| s.abs() > 0.01));

        engine.reset();
    }

    #[test]
    fn test_concurrent_control_thread_traffic() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut engine = test_engine(2, 16);
        let handle = engine.handle();

        let sample_id = add_tone(&engine, dir.path(), 2048);

        // A control thread hammers the handle while the "audio thread"
        // mixes. Drops are fine; crashes and leaks are not.
        let control = {
            let handle = handle.clone();
            let path = dir.path().join("extra.wav");
            testutil::write_sine_wav(&path, 330.0, 44100, 512);
            std::thread::spawn(move || {
                for i in 0..2000u64 {
                    let id = handle.trigger_voice(Trigger {
                        sample_id,
                        bus_number: (i % 2) as usize,
                        ..Trigger::default()
                    });
                    if i % 3 == 0 {
                        handle.release_voice(id);
                    }
                    if i % 100 == 0 {
                        let _ = handle.add_sample(&path, 0, i);
                        handle.set_cc((i % 128) as usize, i as f32);
                    }
                }
            })
        };

        let mut left = [0.0f32; MIX_BUFFER_NUM_FRAMES];
        let mut right = [0.0f32; MIX_BUFFER_NUM_FRAMES];
        while !control.is_finished() {
            left.fill(0.0);
            right.fill(0.0);
            engine.process(&mut left, &mut right);
        }
        control.join().expect("control thread");

        // Drain the engine and verify the books balance.
        let global = engine.global();
        engine.reset();
        assert_eq!(global.voice_pool().num_active_voices(), 0);
        assert_eq!(
            global.stream_pool().num_idle(),
            global.stream_pool().size()
        );
    }

    #[test]
    fn test_engine_drop_returns_leases() {
        let dir = tempfile::tempdir().expect("tempdir");
        let global = GlobalEngine::create(&EngineConfig {
            num_buses: 1,
            voice_pool_size: 4,
            stream_pool_size: 4,
            stream_buffer_frames: 1024,
            num_stream_workers: 1,
        });

        {
            let mut engine = Engine::with_global(global.clone(), 1);
            engine.prepare_to_play(44100.0, MIX_BUFFER_NUM_FRAMES);
            let handle = engine.handle();
            let sample_id = add_tone(&engine, dir.path(), 44100);
            handle.trigger_voice(Trigger {
                sample_id,
                bus_number: 0,
                ..Trigger::default()
            });
            engine.process_audio_events();
            assert_eq!(global.voice_pool().num_active_voices(), 1);
        }

        // Dropping the engine returned the voice and stream.
        assert_eq!(global.voice_pool().num_active_voices(), 0);
        assert_eq!(global.stream_pool().num_idle(), global.stream_pool().size());
    }
}
