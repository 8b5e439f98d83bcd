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

//! WAV PCM decoder backed by hound.

use std::fs::File;
use std::io::BufReader;
use std::path::{Path, PathBuf};

use hound::{SampleFormat, WavReader, WavSpec};

use super::{AudioFileError, Decoder};

/// Reads mono or stereo WAV PCM files, scaling integer samples to f32 in
/// [-1, 1].
pub struct WavDecoder {
    path: PathBuf,
    reader: Option<WavReader<BufReader<File>>>,
    spec: Option<WavSpec>,
    num_frames: u64,
}

impl WavDecoder {
    pub fn new(path: &Path) -> Self {
        Self {
            path: path.to_path_buf(),
            reader: None,
            spec: None,
            num_frames: 0,
        }
    }

    /// Reads one interleaved frame's worth of samples into (left, right).
    /// Returns false at end of stream.
    fn read_frame(
        reader: &mut WavReader<BufReader<File>>,
        spec: &WavSpec,
    ) -> Option<(f32, f32)> {
        let channels = spec.channels as usize;
        let mut frame = [0.0f32; 2];

        match spec.sample_format {
            SampleFormat::Float => {
                let mut samples = reader.samples::<f32>();
                for slot in frame.iter_mut().take(channels) {
                    *slot = samples.next()?.ok()?;
                }
            }
            SampleFormat::Int => {
                let scale = 1.0 / (1i64 << (spec.bits_per_sample - 1)) as f32;
                let mut samples = reader.samples::<i32>();
                for slot in frame.iter_mut().take(channels) {
                    *slot = samples.next()?.ok()? as f32 * scale;
                }
            }
        }

        if channels == 1 {
            frame[1] = frame[0];
        }
        Some((frame[0], frame[1]))
    }
}

impl Decoder for WavDecoder {
    fn open(&mut self) -> Result<(), AudioFileError> {
        if self.reader.is_some() {
            return Ok(());
        }

        let reader = WavReader::open(&self.path)?;
        let spec = reader.spec();
        if spec.channels == 0 || spec.channels > 2 {
            return Err(AudioFileError::UnsupportedChannels(spec.channels));
        }

        self.num_frames = reader.duration() as u64;
        self.spec = Some(spec);
        self.reader = Some(reader);
        Ok(())
    }

    fn close(&mut self) {
        self.reader = None;
    }

    fn is_open(&self) -> bool {
        self.reader.is_some()
    }

    fn seek(&mut self, frame: u64) -> Result<(), AudioFileError> {
        let reader = self.reader.as_mut().ok_or(AudioFileError::NotOpen)?;
        // Seeking past the end parks the reader at EOF; reads return 0.
        let target = frame.min(self.num_frames);
        reader.seek(target as u32)?;
        Ok(())
    }

    fn read(&mut self, num_frames: usize, left: &mut [f32], right: &mut [f32]) -> usize {
        let (Some(reader), Some(spec)) = (self.reader.as_mut(), self.spec.as_ref()) else {
            return 0;
        };
        debug_assert!(left.len() >= num_frames);
        debug_assert!(right.len() >= num_frames);

        let mut frames_read = 0;
        while frames_read < num_frames {
            // Read errors are absorbed: the stream just ends early.
            match Self::read_frame(reader, spec) {
                Some((l, r)) => {
                    left[frames_read] = l;
                    right[frames_read] = r;
                    frames_read += 1;
                }
                None => break,
            }
        }

        frames_read
    }

    fn sample_rate(&self) -> f32 {
        self.spec.map_or(0.0, |s| s.sample_rate as f32)
    }

    fn num_channels(&self) -> u16 {
        self.spec.map_or(0, |s| s.channels)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil;
    use hound::WavWriter;

    #[test]
    fn test_open_missing_file_fails() {
        let mut decoder = WavDecoder::new(Path::new("/does/not/exist.wav"));
        assert!(decoder.open().is_err());
        assert!(!decoder.is_open());
    }

    #[test]
    fn test_int16_scaling() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("int16.wav");

        let spec = WavSpec {
            channels: 1,
            sample_rate: 44100,
            bits_per_sample: 16,
            sample_format: SampleFormat::Int,
        };
        let mut writer = WavWriter::create(&path, spec).expect("create");
        writer.write_sample(i16::MAX).expect("write");
        writer.write_sample(i16::MIN).expect("write");
        writer.write_sample(0i16).expect("write");
        writer.finalize().expect("finalize");

        let mut decoder = WavDecoder::new(&path);
        decoder.open().expect("open");

        let mut left = [0.0f32; 3];
        let mut right = [0.0f32; 3];
        assert_eq!(decoder.read(3, &mut left, &mut right), 3);
        assert!((left[0] - (i16::MAX as f32 / 32768.0)).abs() < 1e-6);
        assert!((left[1] + 1.0).abs() < 1e-6);
        assert_eq!(left[2], 0.0);
    }

    #[test]
    fn test_seek_past_end_reads_nothing() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("short.wav");
        testutil::write_wav(&path, &[vec![0.1, 0.2, 0.3]], 44100);

        let mut decoder = WavDecoder::new(&path);
        decoder.open().expect("open");
        decoder.seek(1000).expect("seek");

        let mut left = [0.0f32; 4];
        let mut right = [0.0f32; 4];
        assert_eq!(decoder.read(4, &mut left, &mut right), 0);
    }

    #[test]
    fn test_seek_not_open_fails() {
        let mut decoder = WavDecoder::new(Path::new("unopened.wav"));
        assert!(matches!(decoder.seek(0), Err(AudioFileError::NotOpen)));
    }

    #[test]
    fn test_close_and_reopen() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("cycle.wav");
        testutil::write_wav(&path, &[vec![0.5; 10]], 44100);

        let mut decoder = WavDecoder::new(&path);
        decoder.open().expect("open");
        decoder.close();
        assert!(!decoder.is_open());

        decoder.open().expect("reopen");
        let mut left = [0.0f32; 10];
        let mut right = [0.0f32; 10];
        assert_eq!(decoder.read(10, &mut left, &mut right), 10);
    }
}
