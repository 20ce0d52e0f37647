//! # Decoded Audio Buffer
//!
//! In-memory representation of a decoded sample stream. Samples are stored
//! planar (one `Vec<f32>` per channel) in the range [-1.0, 1.0], which is the
//! layout rubato consumes and produces.
//!
//! A `DecodedAudio` is owned by exactly one pipeline run and dropped as soon as
//! the encoded bytes exist.

use std::borrow::Cow;
use std::ops::Range;
use std::time::Duration;

use rubato::{
    Resampler, SincFixedIn, SincInterpolationParameters, SincInterpolationType, WindowFunction,
};
use tracing::debug;

use crate::error::{AppError, AppResult};

/// Ratios this close to 1.0 are copied instead of resampled.
const PASSTHROUGH_EPSILON: f64 = 1e-9;
const RESAMPLER_CHUNK_FRAMES: usize = 1024;

/// Decoded PCM audio with a known sample rate and channel layout.
#[derive(Debug, Clone, PartialEq)]
pub struct DecodedAudio {
    sample_rate: u32,
    channels: Vec<Vec<f32>>,
}

impl DecodedAudio {
    /// Build from planar channel data.
    ///
    /// Every channel must hold the same number of frames.
    pub fn from_planar(sample_rate: u32, channels: Vec<Vec<f32>>) -> AppResult<Self> {
        if sample_rate == 0 {
            return Err(AppError::Decode("sample rate is 0".to_string()));
        }
        if channels.is_empty() {
            return Err(AppError::Decode("audio has no channels".to_string()));
        }
        let frames = channels[0].len();
        if channels.iter().any(|c| c.len() != frames) {
            return Err(AppError::Decode("channels have different lengths".to_string()));
        }
        Ok(Self {
            sample_rate,
            channels,
        })
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    pub fn channel_count(&self) -> usize {
        self.channels.len()
    }

    /// Number of samples per channel.
    pub fn frames(&self) -> usize {
        self.channels[0].len()
    }

    pub fn is_empty(&self) -> bool {
        self.frames() == 0
    }

    /// Playback duration at the native sample rate.
    pub fn duration(&self) -> Duration {
        Duration::from_secs_f64(self.frames() as f64 / self.sample_rate as f64)
    }

    /// Write frames `range` into `out` as interleaved 16-bit PCM, clamping out-of-range samples.
    ///
    /// `out` is cleared first so the encoder can reuse one buffer per chunk.
    pub fn pcm16_frames(&self, range: Range<usize>, out: &mut Vec<i16>) {
        out.clear();
        out.reserve(range.len() * self.channel_count());
        for frame in range {
            for channel in &self.channels {
                let scaled = channel[frame] * 32768.0;
                out.push(scaled.clamp(-32768.0, 32767.0) as i16);
            }
        }
    }

    /// Fold any layout wider than stereo down to two channels.
    ///
    /// Even-indexed channels are averaged into the left output and odd-indexed
    /// channels into the right. Mono and stereo are borrowed unchanged.
    pub fn downmix_to_stereo(&self) -> Cow<'_, DecodedAudio> {
        if self.channel_count() <= 2 {
            return Cow::Borrowed(self);
        }

        let frames = self.frames();
        let mut left = vec![0.0f32; frames];
        let mut right = vec![0.0f32; frames];
        let (mut left_count, mut right_count) = (0usize, 0usize);

        for (index, channel) in self.channels.iter().enumerate() {
            let (target, count) = if index % 2 == 0 {
                (&mut left, &mut left_count)
            } else {
                (&mut right, &mut right_count)
            };
            *count += 1;
            for (out, sample) in target.iter_mut().zip(channel) {
                *out += *sample;
            }
        }

        for sample in &mut left {
            *sample /= left_count as f32;
        }
        for sample in &mut right {
            *sample /= right_count as f32;
        }

        Cow::Owned(DecodedAudio {
            sample_rate: self.sample_rate,
            channels: vec![left, right],
        })
    }

    /// Stretch or squeeze the timeline so it lasts `new_duration` when played
    /// at `output_rate`.
    ///
    /// The sample stream is resampled as a whole, so pitch follows the change
    /// in duration exactly like a tape played at a different speed.
    pub fn resample(&self, new_duration: Duration, output_rate: u32) -> AppResult<DecodedAudio> {
        if output_rate == 0 {
            return Err(AppError::Processing("output sample rate is 0".to_string()));
        }

        let target_frames = (new_duration.as_secs_f64() * output_rate as f64).round() as usize;
        self.resample_to_frames(target_frames, output_rate)
    }

    /// Resample so the result holds exactly `target_frames` frames at `output_rate`.
    pub(crate) fn resample_to_frames(
        &self,
        target_frames: usize,
        output_rate: u32,
    ) -> AppResult<DecodedAudio> {
        let frames = self.frames();
        let channel_count = self.channel_count();

        if frames == 0 || target_frames == 0 {
            return DecodedAudio::from_planar(output_rate, vec![Vec::new(); channel_count]);
        }

        let ratio = target_frames as f64 / frames as f64;
        if (ratio - 1.0).abs() < PASSTHROUGH_EPSILON {
            debug!(frames, output_rate, "Resample ratio is 1.0, copying samples");
            return DecodedAudio::from_planar(output_rate, self.channels.clone());
        }

        debug!(
            frames,
            target_frames,
            ratio,
            source_rate = self.sample_rate,
            output_rate,
            "Resampling audio"
        );

        let params = SincInterpolationParameters {
            sinc_len: 128,
            f_cutoff: 0.95,
            interpolation: SincInterpolationType::Linear,
            oversampling_factor: 128,
            window: WindowFunction::BlackmanHarris2,
        };

        let mut resampler =
            SincFixedIn::<f32>::new(ratio, 1.0, params, RESAMPLER_CHUNK_FRAMES, channel_count)
                .map_err(|e| AppError::Processing(format!("failed to create resampler: {}", e)))?;

        let delay = resampler.output_delay();
        let wanted = delay + target_frames;
        let mut output: Vec<Vec<f32>> = vec![Vec::with_capacity(wanted); channel_count];

        // Full chunks
        let mut position = 0;
        while position + resampler.input_frames_next() <= frames {
            let needed = resampler.input_frames_next();
            let chunk: Vec<&[f32]> = self
                .channels
                .iter()
                .map(|c| &c[position..position + needed])
                .collect();
            let produced = resampler
                .process(&chunk, None)
                .map_err(|e| AppError::Processing(format!("resampling failed: {}", e)))?;
            append_planar(&mut output, produced);
            position += needed;
        }

        // Trailing partial chunk
        if position < frames {
            let chunk: Vec<&[f32]> = self.channels.iter().map(|c| &c[position..]).collect();
            let produced = resampler
                .process_partial(Some(chunk.as_slice()), None)
                .map_err(|e| AppError::Processing(format!("resampling failed: {}", e)))?;
            append_planar(&mut output, produced);
        }

        // Drain the filter until the delayed tail is out
        while output[0].len() < wanted {
            let produced = resampler
                .process_partial::<&[f32]>(None, None)
                .map_err(|e| AppError::Processing(format!("resampling failed: {}", e)))?;
            if produced.first().map_or(true, |c| c.is_empty()) {
                break;
            }
            append_planar(&mut output, produced);
        }

        for channel in &mut output {
            let skip = delay.min(channel.len());
            channel.drain(..skip);
            channel.resize(target_frames, 0.0);
        }

        DecodedAudio::from_planar(output_rate, output)
    }
}

fn append_planar(output: &mut [Vec<f32>], produced: Vec<Vec<f32>>) {
    for (out, chunk) in output.iter_mut().zip(produced) {
        out.extend_from_slice(&chunk);
    }
}
