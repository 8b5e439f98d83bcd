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

//! Test helpers: WAV fixture generation and asynchronous assertions.

use std::path::Path;
use std::thread;
use std::time::{Duration, SystemTime};

use hound::{SampleFormat, WavSpec, WavWriter};

/// Wait for the given predicate to return true or fail.
pub fn eventually<F>(predicate: F, error_msg: &str)
where
    F: Fn() -> bool,
{
    let start = SystemTime::now();
    let mut tick = Duration::from_millis(5);
    let timeout = Duration::from_secs(10);
    let max_tick = Duration::from_millis(100);

    loop {
        let elapsed = start.elapsed().expect("system time error");
        if elapsed > timeout {
            panic!("{}", error_msg);
        }
        if predicate() {
            return;
        }

        // Exponential backoff to reduce CPU contention.
        thread::sleep(tick);
        tick = std::cmp::min(tick * 2, max_tick);
    }
}

/// Writes a 32-bit float WAV file from planar channel data. All channels
/// must have the same length.
pub fn write_wav(path: &Path, channels: &[Vec<f32>], sample_rate: u32) {
    let num_channels = channels.len();
    assert!(num_channels > 0, "at least one channel required");
    let num_frames = channels[0].len();
    assert!(
        channels.iter().all(|c| c.len() == num_frames),
        "all channels must have the same length"
    );

    let spec = WavSpec {
        channels: num_channels as u16,
        sample_rate,
        bits_per_sample: 32,
        sample_format: SampleFormat::Float,
    };

    let mut writer = WavWriter::create(path, spec).expect("failed to create wav");
    for frame in 0..num_frames {
        for channel in channels {
            writer
                .write_sample(channel[frame])
                .expect("failed to write sample");
        }
    }
    writer.finalize().expect("failed to finalize wav");
}

/// Generates a sine wave at the given frequency, scaled to half amplitude.
pub fn sine_wave(frequency: f32, sample_rate: u32, num_frames: usize) -> Vec<f32> {
    (0..num_frames)
        .map(|i| {
            (2.0 * std::f32::consts::PI * frequency * i as f32 / sample_rate as f32).sin() * 0.5
        })
        .collect()
}

/// Writes a stereo sine WAV fixture at `path`.
pub fn write_sine_wav(path: &Path, frequency: f32, sample_rate: u32, num_frames: usize) {
    let wave = sine_wave(frequency, sample_rate, num_frames);
    write_wav(path, &[wave.clone(), wave], sample_rate);
}
