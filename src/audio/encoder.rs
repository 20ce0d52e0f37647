//! MP3 encoding with LAME.
//!
//! The encoded file is assembled completely in memory before the caller sees
//! it, so a failing encode can never turn into a truncated download.

use std::borrow::Cow;

use mp3lame_encoder::{
    max_required_buffer_size, Bitrate, Builder, FlushGap, InterleavedPcm, MonoPcm, Quality,
};
use tracing::debug;

use crate::audio::buffer::DecodedAudio;
use crate::audio::codec::EncodeTarget;
use crate::error::{AppError, AppResult};

/// Frames handed to LAME per call.
const ENCODE_CHUNK_FRAMES: usize = 8192;

/// Encode `audio` as a constant-bitrate MP3 at the target sample rate.
///
/// Audio at another rate is resampled first (duration preserved), and layouts
/// wider than stereo are downmixed since MP3 carries at most two channels.
pub fn encode_mp3(audio: &DecodedAudio, target: EncodeTarget) -> AppResult<Vec<u8>> {
    let bitrate = bitrate_for(target.bitrate_kbps)?;

    let stereo = audio.downmix_to_stereo();
    let prepared = if stereo.sample_rate() != target.sample_rate {
        Cow::Owned(stereo.resample(stereo.duration(), target.sample_rate)?)
    } else {
        stereo
    };
    let channels = prepared.channel_count();
    let frames = prepared.frames();

    let mut builder = Builder::new()
        .ok_or_else(|| AppError::Encode("failed to allocate LAME encoder".to_string()))?;
    builder
        .set_num_channels(channels as u8)
        .map_err(|e| lame_error("set channels", e))?;
    builder
        .set_sample_rate(target.sample_rate)
        .map_err(|e| lame_error("set sample rate", e))?;
    builder
        .set_brate(bitrate)
        .map_err(|e| lame_error("set bitrate", e))?;
    builder
        .set_quality(Quality::Good)
        .map_err(|e| lame_error("set quality", e))?;
    let mut encoder = builder.build().map_err(|e| lame_error("initialize", e))?;

    let mut output = Vec::with_capacity(estimated_size(&prepared, target.bitrate_kbps));
    let mut pcm = Vec::with_capacity(ENCODE_CHUNK_FRAMES * channels);

    let mut start = 0;
    while start < frames {
        let end = (start + ENCODE_CHUNK_FRAMES).min(frames);
        prepared.pcm16_frames(start..end, &mut pcm);
        // LAME writes into spare capacity only
        output.reserve(max_required_buffer_size(end - start));
        let encoded = if channels == 1 {
            encoder.encode_to_vec(MonoPcm(pcm.as_slice()), &mut output)
        } else {
            encoder.encode_to_vec(InterleavedPcm(pcm.as_slice()), &mut output)
        };
        encoded.map_err(|e| lame_error("encode", e))?;
        start = end;
    }

    // Pads the last frame so the samples still buffered inside LAME are written
    output.reserve(max_required_buffer_size(0));
    encoder
        .flush_to_vec::<FlushGap>(&mut output)
        .map_err(|e| lame_error("flush", e))?;

    debug!(
        frames,
        channels,
        sample_rate = target.sample_rate,
        bitrate_kbps = target.bitrate_kbps,
        bytes = output.len(),
        "Encoded MP3"
    );

    if output.is_empty() && !prepared.is_empty() {
        return Err(AppError::Encode("encoder produced no output".to_string()));
    }

    Ok(output)
}

fn bitrate_for(kbps: u32) -> AppResult<Bitrate> {
    match kbps {
        96 => Ok(Bitrate::Kbps96),
        128 => Ok(Bitrate::Kbps128),
        160 => Ok(Bitrate::Kbps160),
        192 => Ok(Bitrate::Kbps192),
        256 => Ok(Bitrate::Kbps256),
        320 => Ok(Bitrate::Kbps320),
        other => Err(AppError::Encode(format!("unsupported bitrate {} kbps", other))),
    }
}

fn estimated_size(audio: &DecodedAudio, bitrate_kbps: u32) -> usize {
    let seconds = audio.duration().as_secs_f64();
    (seconds * bitrate_kbps as f64 * 1000.0 / 8.0) as usize + 8192
}

fn lame_error(step: &str, err: impl std::fmt::Debug) -> AppError {
    AppError::Encode(format!("LAME failed to {}: {:?}", step, err))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::decoder::decode_file;
    use crate::audio::test_support::{sine_wave, write_fixture};
    use crate::audio::FormatHint;
    use std::time::Duration;

    /// Frames between the first and last sample louder than `threshold`.
    fn audible_span(audio: &DecodedAudio, threshold: f32) -> usize {
        let mut pcm = Vec::new();
        audio.pcm16_frames(0..audio.frames(), &mut pcm);
        let limit = (threshold * 32768.0) as i16;
        let channels = audio.channel_count();
        let loud: Vec<usize> = pcm
            .iter()
            .enumerate()
            .filter(|(_, s)| s.saturating_abs() > limit)
            .map(|(i, _)| i / channels)
            .collect();
        match (loud.first(), loud.last()) {
            (Some(first), Some(last)) => last - first + 1,
            _ => 0,
        }
    }

    fn round_trip(audio: &DecodedAudio) -> DecodedAudio {
        let dir = tempfile::tempdir().unwrap();
        let bytes = encode_mp3(audio, TARGET).unwrap();
        let path = write_fixture(dir.path(), "out.mp3", &bytes);
        decode_file(&path, FormatHint::Mp3, Duration::from_secs(60)).unwrap()
    }

    const TARGET: EncodeTarget = EncodeTarget {
        sample_rate: 44100,
        bitrate_kbps: 192,
    };

    #[test]
    fn test_encodes_stereo_to_mp3_frames() {
        let bytes = encode_mp3(&sine_wave(44100, 2, 1.0), TARGET).unwrap();

        // Either an ID3 tag or an MPEG frame sync must open the stream
        assert!(bytes.len() > 1000);
        assert!(bytes.starts_with(b"ID3") || (bytes[0] == 0xFF && bytes[1] & 0xE0 == 0xE0));
    }

    #[test]
    fn test_size_tracks_bitrate_and_duration() {
        let bytes = encode_mp3(&sine_wave(44100, 1, 2.0), TARGET).unwrap();
        let expected = 2.0 * 192_000.0 / 8.0;
        let ratio = bytes.len() as f64 / expected;
        assert!((0.9..1.2).contains(&ratio), "size ratio {}", ratio);
    }

    #[test]
    fn test_tail_of_the_input_is_encoded() {
        // Within 20 ms of the full input length at 44.1 kHz
        let slack = 882;
        for seconds in [0.03, 0.1, 0.5, 2.0] {
            let input = sine_wave(44100, 1, seconds);
            let decoded = round_trip(&input);
            let span = audible_span(&decoded, 0.05);
            assert!(
                span + slack >= input.frames(),
                "{}s input: tone spans {} of {} frames",
                seconds,
                span,
                input.frames()
            );
        }
    }

    #[test]
    fn test_resamples_foreign_rates() {
        let bytes = encode_mp3(&sine_wave(8000, 1, 1.0), TARGET).unwrap();
        assert!(!bytes.is_empty());
    }

    #[test]
    fn test_downmixes_surround() {
        let surround = DecodedAudio::from_planar(44100, vec![vec![0.1; 4410]; 6]).unwrap();
        assert!(encode_mp3(&surround, TARGET).is_ok());
    }

    #[test]
    fn test_empty_audio_does_not_fail() {
        let empty = DecodedAudio::from_planar(44100, vec![Vec::new(), Vec::new()]).unwrap();
        assert!(encode_mp3(&empty, TARGET).is_ok());
    }

    #[test]
    fn test_unsupported_bitrate_is_an_encode_error() {
        let target = EncodeTarget {
            sample_rate: 44100,
            bitrate_kbps: 100,
        };
        let err = encode_mp3(&sine_wave(44100, 1, 0.1), target).unwrap_err();
        assert!(matches!(err, AppError::Encode(_)));
    }
}
