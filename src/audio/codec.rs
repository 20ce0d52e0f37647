//! Codec boundary between the pipeline and the audio libraries.
//!
//! The pipeline only talks to [`AudioCodec`]; the default implementation
//! decodes with symphonia and encodes MP3 with LAME.

use std::fmt;
use std::path::Path;
use std::time::Duration;

use crate::audio::buffer::DecodedAudio;
use crate::audio::{decoder, encoder};
use crate::config::ProcessingConfig;
use crate::error::AppResult;

/// Container hint passed to symphonia's format detection and used as the staged file suffix.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FormatHint {
    Mp3,
    Wav,
    Flac,
    Ogg,
    M4a,
    Aac,
}

impl FormatHint {
    pub fn extension(&self) -> &'static str {
        match self {
            FormatHint::Mp3 => "mp3",
            FormatHint::Wav => "wav",
            FormatHint::Flac => "flac",
            FormatHint::Ogg => "ogg",
            FormatHint::M4a => "m4a",
            FormatHint::Aac => "aac",
        }
    }

    /// Pick a hint from the client's filename, falling back to MP3.
    pub fn from_filename(filename: Option<&str>) -> Self {
        let extension = filename
            .and_then(|name| Path::new(name).extension())
            .and_then(|ext| ext.to_str())
            .map(|ext| ext.to_ascii_lowercase());

        match extension.as_deref() {
            Some("wav") | Some("wave") => FormatHint::Wav,
            Some("flac") => FormatHint::Flac,
            Some("ogg") | Some("oga") => FormatHint::Ogg,
            Some("m4a") | Some("mp4") => FormatHint::M4a,
            Some("aac") => FormatHint::Aac,
            _ => FormatHint::Mp3,
        }
    }
}

impl Default for FormatHint {
    fn default() -> Self {
        FormatHint::Mp3
    }
}

impl fmt::Display for FormatHint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.extension())
    }
}

/// Output parameters for [`AudioCodec::encode`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EncodeTarget {
    pub sample_rate: u32,
    pub bitrate_kbps: u32,
}

impl From<&ProcessingConfig> for EncodeTarget {
    fn from(config: &ProcessingConfig) -> Self {
        Self {
            sample_rate: config.output_sample_rate,
            bitrate_kbps: config.output_bitrate_kbps,
        }
    }
}

/// Decode staged files into samples and encode samples back into bytes.
///
/// Implementations are shared between concurrent requests, so they must not
/// hold per-request state.
pub trait AudioCodec: Send + Sync {
    /// Decode the file at `path`. Bad input yields `AppError::Decode`, audio
    /// longer than `max_duration` yields `AppError::Processing`.
    fn decode(&self, path: &Path, hint: FormatHint, max_duration: Duration) -> AppResult<DecodedAudio>;

    /// Encode `audio` into an in-memory MP3. Failures yield `AppError::Encode`.
    fn encode(&self, audio: &DecodedAudio, target: EncodeTarget) -> AppResult<Vec<u8>>;
}

/// Symphonia for decoding, LAME for MP3 encoding.
#[derive(Debug, Default, Clone, Copy)]
pub struct SymphoniaLameCodec;

impl AudioCodec for SymphoniaLameCodec {
    fn decode(&self, path: &Path, hint: FormatHint, max_duration: Duration) -> AppResult<DecodedAudio> {
        decoder::decode_file(path, hint, max_duration)
    }

    fn encode(&self, audio: &DecodedAudio, target: EncodeTarget) -> AppResult<Vec<u8>> {
        encoder::encode_mp3(audio, target)
    }
}
