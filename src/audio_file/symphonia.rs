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

//! Compressed-format decoder backed by symphonia (Ogg Vorbis, FLAC, MP3).

use std::fs::File;
use std::path::{Path, PathBuf};
use std::time::Duration;

use symphonia::core::audio::SampleBuffer;
use symphonia::core::codecs::{Decoder as CodecDecoder, DecoderOptions, CODEC_TYPE_NULL};
use symphonia::core::errors::Error as SymphoniaError;
use symphonia::core::formats::{FormatOptions, FormatReader, SeekMode, SeekTo};
use symphonia::core::io::MediaSourceStream;
use symphonia::core::meta::MetadataOptions;
use symphonia::core::probe::Hint;
use symphonia::core::units::Time;
use symphonia::default::{get_codecs, get_probe};
use tracing::debug;

use super::{AudioFileError, Decoder};

struct OpenState {
    format: Box<dyn FormatReader>,
    decoder: Box<dyn CodecDecoder>,
    track_id: u32,
    /// Interleaved samples decoded but not yet handed out.
    leftover: Vec<f32>,
    leftover_pos: usize,
    /// Frames to discard after a coarse container seek.
    skip_frames: u64,
    sample_buf: Option<SampleBuffer<f32>>,
    finished: bool,
}

/// Decoder for formats handled by symphonia. Produces f32 frames; mono is
/// duplicated to stereo at read time.
pub struct SymphoniaDecoder {
    path: PathBuf,
    state: Option<OpenState>,
    sample_rate: f32,
    channels: u16,
}

impl SymphoniaDecoder {
    pub fn new(path: &Path) -> Self {
        Self {
            path: path.to_path_buf(),
            state: None,
            sample_rate: 0.0,
            channels: 0,
        }
    }

    /// Decodes packets until one yields audio for our track, appending the
    /// interleaved samples to `leftover`. Returns false at end of stream.
    fn decode_more(state: &mut OpenState) -> bool {
        loop {
            let packet = match state.format.next_packet() {
                Ok(packet) => packet,
                Err(SymphoniaError::ResetRequired) => {
                    state.decoder.reset();
                    continue;
                }
                Err(SymphoniaError::IoError(ref e))
                    if e.kind() == std::io::ErrorKind::UnexpectedEof =>
                {
                    return false;
                }
                // Some decoders report EOF as a decode error.
                Err(SymphoniaError::DecodeError(_)) => return false,
                Err(e) => {
                    debug!(error = %e, "Read error, ending stream");
                    return false;
                }
            };

            if packet.track_id() != state.track_id {
                continue;
            }

            let decoded = match state.decoder.decode(&packet) {
                Ok(decoded) => decoded,
                Err(SymphoniaError::ResetRequired) => {
                    state.decoder.reset();
                    continue;
                }
                // Skip over a corrupt packet.
                Err(SymphoniaError::DecodeError(_)) => continue,
                Err(e) => {
                    debug!(error = %e, "Decode error, ending stream");
                    return false;
                }
            };

            if decoded.frames() == 0 {
                continue;
            }

            let spec = *decoded.spec();
            let needs_realloc = state
                .sample_buf
                .as_ref()
                .map_or(true, |b| b.capacity() < decoded.capacity() * spec.channels.count());
            if needs_realloc {
                state.sample_buf = Some(SampleBuffer::new(decoded.capacity() as u64, spec));
            }

            let sample_buf = state.sample_buf.as_mut().expect("sample buffer exists");
            sample_buf.copy_interleaved_ref(decoded);

            state.leftover.extend_from_slice(sample_buf.samples());
            return true;
        }
    }
}

impl Decoder for SymphoniaDecoder {
    fn open(&mut self) -> Result<(), AudioFileError> {
        if self.state.is_some() {
            return Ok(());
        }

        let file = File::open(&self.path)?;
        let mss = MediaSourceStream::new(Box::new(file), Default::default());

        let mut hint = Hint::new();
        if let Some(extension) = self.path.extension().and_then(|e| e.to_str()) {
            hint.with_extension(extension);
        }

        let probed = get_probe().format(
            &hint,
            mss,
            &FormatOptions::default(),
            &MetadataOptions::default(),
        )?;
        let format = probed.format;

        let track = format
            .tracks()
            .iter()
            .find(|t| t.codec_params.codec != CODEC_TYPE_NULL)
            .ok_or_else(|| AudioFileError::NoAudioTrack(self.path.display().to_string()))?;
        let track_id = track.id;
        let params = track.codec_params.clone();

        let sample_rate = params
            .sample_rate
            .ok_or_else(|| AudioFileError::MissingParameters(self.path.display().to_string()))?;
        let channels = params
            .channels
            .map(|c| c.count() as u16)
            .ok_or_else(|| AudioFileError::MissingParameters(self.path.display().to_string()))?;
        if channels == 0 || channels > 2 {
            return Err(AudioFileError::UnsupportedChannels(channels));
        }

        let decoder = get_codecs().make(&params, &DecoderOptions::default())?;

        self.sample_rate = sample_rate as f32;
        self.channels = channels;
        self.state = Some(OpenState {
            format,
            decoder,
            track_id,
            leftover: Vec::new(),
            leftover_pos: 0,
            skip_frames: 0,
            sample_buf: None,
            finished: false,
        });

        Ok(())
    }

    fn close(&mut self) {
        self.state = None;
    }

    fn is_open(&self) -> bool {
        self.state.is_some()
    }

    fn seek(&mut self, frame: u64) -> Result<(), AudioFileError> {
        let state = self.state.as_mut().ok_or(AudioFileError::NotOpen)?;

        let time = Time::from(Duration::from_secs_f64(
            frame as f64 / self.sample_rate as f64,
        ));
        let seeked = state.format.seek(
            SeekMode::Accurate,
            SeekTo::Time {
                time,
                track_id: Some(state.track_id),
            },
        )?;

        // Container seeks land on a packet boundary at or before the target;
        // the remainder is dropped frame-accurately on the next read.
        state.decoder.reset();
        state.leftover.clear();
        state.leftover_pos = 0;
        state.skip_frames = frame.saturating_sub(seeked.actual_ts);
        state.finished = false;
        Ok(())
    }

    fn read(&mut self, num_frames: usize, left: &mut [f32], right: &mut [f32]) -> usize {
        let Some(state) = self.state.as_mut() else {
            return 0;
        };
        debug_assert!(left.len() >= num_frames);
        debug_assert!(right.len() >= num_frames);

        let channels = self.channels as usize;
        let mut produced = 0;

        while produced < num_frames {
            let available = (state.leftover.len() - state.leftover_pos) / channels;

            if available == 0 {
                if state.finished {
                    break;
                }
                state.leftover.clear();
                state.leftover_pos = 0;
                if !Self::decode_more(state) {
                    state.finished = true;
                }
                continue;
            }

            if state.skip_frames > 0 {
                let skip = (state.skip_frames as usize).min(available);
                state.leftover_pos += skip * channels;
                state.skip_frames -= skip as u64;
                continue;
            }

            let take = available.min(num_frames - produced);
            for _ in 0..take {
                let l = state.leftover[state.leftover_pos];
                let r = if channels == 2 {
                    state.leftover[state.leftover_pos + 1]
                } else {
                    l
                };
                left[produced] = l;
                right[produced] = r;
                state.leftover_pos += channels;
                produced += 1;
            }
        }

        produced
    }

    fn sample_rate(&self) -> f32 {
        self.sample_rate
    }

    fn num_channels(&self) -> u16 {
        self.channels
    }
}
