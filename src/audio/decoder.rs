//! Symphonia-based decoding of staged uploads.
//!
//! The whole file is decoded into memory as planar `f32`. Recoverable packet
//! corruption is skipped; anything that prevents probing or producing samples
//! is reported as `AppError::Decode`.
//!
//! Decoding stops with `AppError::Processing` as soon as the audio grows past
//! the caller's duration limit, before the rest of the file is allocated.

use std::fs::File;
use std::path::Path;
use std::time::Duration;

use symphonia::core::audio::SampleBuffer;
use symphonia::core::codecs::{DecoderOptions, CODEC_TYPE_NULL};
use symphonia::core::errors::Error as SymphoniaError;
use symphonia::core::formats::FormatOptions;
use symphonia::core::io::MediaSourceStream;
use symphonia::core::meta::MetadataOptions;
use symphonia::core::probe::Hint;
use tracing::{debug, warn};

use crate::audio::buffer::DecodedAudio;
use crate::audio::codec::FormatHint;
use crate::error::{AppError, AppResult};

pub fn decode_file(path: &Path, hint: FormatHint, max_duration: Duration) -> AppResult<DecodedAudio> {
    let file = File::open(path)
        .map_err(|e| AppError::Decode(format!("cannot open {}: {}", path.display(), e)))?;
    let mss = MediaSourceStream::new(Box::new(file), Default::default());

    let mut format_hint = Hint::new();
    format_hint.with_extension(hint.extension());

    let format_opts = FormatOptions {
        enable_gapless: true,
        ..Default::default()
    };

    let opened = symphonia::default::get_probe()
        .format(&format_hint, mss, &format_opts, &MetadataOptions::default())
        .map_err(|e| AppError::Decode(format!("unsupported or corrupt audio: {}", e)))?;
    let mut format = opened.format;

    let track = format
        .tracks()
        .iter()
        .find(|t| t.codec_params.codec != CODEC_TYPE_NULL)
        .ok_or_else(|| AppError::Decode("no decodable audio track".to_string()))?;
    let track_id = track.id;
    let declared_rate = track.codec_params.sample_rate;

    let mut decoder = symphonia::default::get_codecs()
        .make(&track.codec_params, &DecoderOptions::default())
        .map_err(|e| AppError::Decode(format!("unsupported codec: {}", e)))?;

    let mut channels: Vec<Vec<f32>> = Vec::new();
    let mut sample_buf: Option<SampleBuffer<f32>> = None;
    let mut spec_seen = None;
    let mut max_frames = usize::MAX;
    let mut skipped_packets = 0usize;

    loop {
        let packet = match format.next_packet() {
            Ok(packet) => packet,
            Err(SymphoniaError::IoError(ref e)) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
                break;
            }
            Err(SymphoniaError::ResetRequired) => break,
            Err(e) => return Err(AppError::Decode(format!("failed to read packet: {}", e))),
        };

        if packet.track_id() != track_id {
            continue;
        }

        let decoded = match decoder.decode(&packet) {
            Ok(decoded) => decoded,
            Err(SymphoniaError::DecodeError(e)) => {
                skipped_packets += 1;
                warn!(error = %e, "Skipping corrupt packet");
                continue;
            }
            Err(SymphoniaError::IoError(ref e)) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
                break;
            }
            Err(e) => return Err(AppError::Decode(format!("failed to decode packet: {}", e))),
        };

        let spec = *decoded.spec();
        let channel_count = spec.channels.count();
        if channel_count == 0 {
            return Err(AppError::Decode("audio has no channels".to_string()));
        }
        if channels.is_empty() {
            channels = vec![Vec::new(); channel_count];
            let rate = declared_rate.unwrap_or(spec.rate);
            max_frames = (max_duration.as_secs_f64() * rate as f64).ceil() as usize;
        } else if channels.len() != channel_count {
            return Err(AppError::Decode(format!(
                "channel count changed from {} to {} mid-stream",
                channels.len(),
                channel_count
            )));
        }

        let needed = decoded.capacity() * channel_count;
        if sample_buf.as_ref().map_or(true, |buf| buf.capacity() < needed) {
            sample_buf = Some(SampleBuffer::<f32>::new(decoded.capacity() as u64, spec));
        }
        if let Some(buf) = sample_buf.as_mut() {
            buf.copy_interleaved_ref(decoded);
            for frame in buf.samples().chunks_exact(channel_count) {
                for (channel, sample) in channels.iter_mut().zip(frame) {
                    channel.push(*sample);
                }
            }
        }
        spec_seen = Some(spec);

        if channels[0].len() > max_frames {
            return Err(AppError::Processing(format!(
                "audio is longer than the {}s limit",
                max_duration.as_secs()
            )));
        }
    }

    let spec = spec_seen.ok_or_else(|| AppError::Decode("file contains no audio samples".to_string()))?;
    let channel_count = channels.len();

    let sample_rate = declared_rate.unwrap_or(spec.rate);
    let audio = DecodedAudio::from_planar(sample_rate, channels)?;
    if audio.is_empty() {
        return Err(AppError::Decode("file contains no audio samples".to_string()));
    }

    debug!(
        path = %path.display(),
        hint = %hint,
        sample_rate,
        channels = channel_count,
        frames = audio.frames(),
        duration_ms = audio.duration().as_millis() as u64,
        skipped_packets,
        "Decoded audio"
    );

    Ok(audio)
}
