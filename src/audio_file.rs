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

//! Audio file reading.
//!
//! [`AudioFile`] is a thin facade over per-format decoders: WAV PCM is read
//! directly with hound, everything else goes through symphonia. Decoders
//! produce planar stereo f32 frames; mono content is duplicated into both
//! channels at read time. Only mono and stereo files are supported.
//!
//! An `AudioFile` is cheap to construct and carries no open OS resources
//! until [`AudioFile::open`] is called. Disk streams never share a decoder:
//! each stream clones the file description with [`AudioFile::clone_unopened`]
//! and opens its own handle on its worker thread.

mod symphonia;
mod wav;

use std::path::{Path, PathBuf};

pub use self::symphonia::SymphoniaDecoder;
pub use self::wav::WavDecoder;

/// Error produced while opening or reading an audio file.
#[derive(Debug, thiserror::Error)]
pub enum AudioFileError {
    #[error("unrecognized audio format: {0}")]
    UnknownFormat(String),

    #[error("file is not open")]
    NotOpen,

    #[error("unsupported channel count: {0}")]
    UnsupportedChannels(u16),

    #[error("no audio track found in {0}")]
    NoAudioTrack(String),

    #[error("missing stream parameters in {0}")]
    MissingParameters(String),

    #[error("WAV error: {0}")]
    Wav(#[from] hound::Error),

    #[error("decode error: {0}")]
    Decode(#[from] ::symphonia::core::errors::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Recognized audio formats.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AudioFormat {
    WavPcm,
    OggVorbis,
    Flac,
    Mp3,
}

impl AudioFormat {
    /// Guesses the format from the file extension. Returns None for
    /// anything unrecognized.
    pub fn guess_from_path(path: &Path) -> Option<AudioFormat> {
        let extension = path.extension()?.to_str()?.to_ascii_lowercase();
        match extension.as_str() {
            "wav" | "wave" => Some(AudioFormat::WavPcm),
            "ogg" | "oga" => Some(AudioFormat::OggVorbis),
            "flac" => Some(AudioFormat::Flac),
            "mp3" => Some(AudioFormat::Mp3),
            _ => None,
        }
    }
}

/// Interface to an audio format decoder.
///
/// `read` fills planar left/right buffers and returns the number of frames
/// produced; 0 means end of stream or an absorbed read error. Decoders
/// report their sample rate and channel count only after a successful
/// `open`.
pub trait Decoder: Send {
    fn open(&mut self) -> Result<(), AudioFileError>;
    fn close(&mut self);
    fn is_open(&self) -> bool;
    fn seek(&mut self, frame: u64) -> Result<(), AudioFileError>;
    fn read(&mut self, num_frames: usize, left: &mut [f32], right: &mut [f32]) -> usize;
    fn sample_rate(&self) -> f32;
    fn num_channels(&self) -> u16;
}

/// An audio file known by path and format, decodable into stereo f32.
pub struct AudioFile {
    path: PathBuf,
    format: AudioFormat,
    decoder: Box<dyn Decoder>,
}

impl AudioFile {
    /// Creates an unopened audio file for the given path and format.
    pub fn new(path: &Path, format: AudioFormat) -> Self {
        let decoder: Box<dyn Decoder> = match format {
            AudioFormat::WavPcm => Box::new(WavDecoder::new(path)),
            AudioFormat::OggVorbis | AudioFormat::Flac | AudioFormat::Mp3 => {
                Box::new(SymphoniaDecoder::new(path))
            }
        };

        Self {
            path: path.to_path_buf(),
            format,
            decoder,
        }
    }

    /// Creates an unopened audio file, guessing the format from the file
    /// extension.
    pub fn from_path(path: &Path) -> Result<Self, AudioFileError> {
        let format = AudioFormat::guess_from_path(path)
            .ok_or_else(|| AudioFileError::UnknownFormat(path.display().to_string()))?;
        Ok(Self::new(path, format))
    }

    /// Returns a fresh, unopened decoder for the same file. Used by disk
    /// streams so every stream owns an exclusive OS handle.
    pub fn clone_unopened(&self) -> AudioFile {
        AudioFile::new(&self.path, self.format)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn format(&self) -> AudioFormat {
        self.format
    }

    pub fn open(&mut self) -> Result<(), AudioFileError> {
        self.decoder.open()
    }

    pub fn close(&mut self) {
        self.decoder.close();
    }

    pub fn is_open(&self) -> bool {
        self.decoder.is_open()
    }

    /// Seeks to an absolute frame position.
    pub fn seek(&mut self, frame: u64) -> Result<(), AudioFileError> {
        self.decoder.seek(frame)
    }

    /// Reads up to `num_frames` frames into the planar output buffers.
    /// Returns the number of frames produced; 0 at end of stream.
    pub fn read(&mut self, num_frames: usize, left: &mut [f32], right: &mut [f32]) -> usize {
        self.decoder.read(num_frames, left, right)
    }

    pub fn sample_rate(&self) -> f32 {
        self.decoder.sample_rate()
    }

    pub fn num_channels(&self) -> u16 {
        self.decoder.num_channels()
    }
}

impl std::fmt::Debug for AudioFile {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AudioFile")
            .field("path", &self.path)
            .field("format", &self.format)
            .field("open", &self.is_open())
            .finish()
    }
}
