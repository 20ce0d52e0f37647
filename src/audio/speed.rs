//! # Speed Transform
//!
//! Changes playback speed by resampling the whole timeline. A factor `f`
//! divides the duration by `f`: `f > 1` gives a shorter, higher-pitched result,
//! `f < 1` a longer, lower-pitched one. Speed and pitch are coupled on purpose,
//! like a tape deck running fast or slow.
//!
//! The output is produced directly at the encoder's sample rate, so the rate
//! conversion and the speed change happen in a single resampling pass with
//! ratio `(output_rate / source_rate) / f`.

use std::fmt;
use std::time::Duration;

use tracing::debug;

use crate::audio::buffer::DecodedAudio;
use crate::config::ProcessingConfig;
use crate::error::{AppError, AppResult};

/// Inclusive bounds a speed factor must fall into.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SpeedLimits {
    pub min: f64,
    pub max: f64,
}

impl From<&ProcessingConfig> for SpeedLimits {
    fn from(config: &ProcessingConfig) -> Self {
        Self {
            min: config.min_speed,
            max: config.max_speed,
        }
    }
}

/// A validated playback speed multiplier.
///
/// Always finite, strictly positive and within the configured [`SpeedLimits`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SpeedFactor(f64);

impl SpeedFactor {
    pub const NORMAL: SpeedFactor = SpeedFactor(1.0);

    pub fn new(value: f64, limits: SpeedLimits) -> AppResult<Self> {
        if !value.is_finite() {
            return Err(AppError::InvalidSpeed(format!("{} is not a finite number", value)));
        }
        if value <= 0.0 {
            return Err(AppError::InvalidSpeed(format!("{} must be greater than 0", value)));
        }
        if value < limits.min || value > limits.max {
            return Err(AppError::InvalidSpeed(format!(
                "{} is outside the allowed range [{}, {}]",
                value, limits.min, limits.max
            )));
        }
        Ok(Self(value))
    }

    /// Parse the raw `speed` form value.
    ///
    /// A missing or blank value means normal speed. Anything else must be a
    /// decimal number accepted by [`SpeedFactor::new`].
    pub fn parse(raw: Option<&str>, limits: SpeedLimits) -> AppResult<Self> {
        let raw = match raw.map(str::trim) {
            None | Some("") => return Ok(Self::NORMAL),
            Some(raw) => raw,
        };

        let value: f64 = raw
            .parse()
            .map_err(|_| AppError::InvalidSpeed(format!("'{}' is not a number", raw)))?;
        Self::new(value, limits)
    }

    pub fn value(&self) -> f64 {
        self.0
    }
}

impl Default for SpeedFactor {
    fn default() -> Self {
        Self::NORMAL
    }
}

impl fmt::Display for SpeedFactor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}x", self.0)
    }
}

/// Applies a [`SpeedFactor`] to decoded audio, producing output at a fixed rate.
#[derive(Debug, Clone, Copy)]
pub struct SpeedTransform {
    factor: SpeedFactor,
    output_rate: u32,
}

impl SpeedTransform {
    pub fn new(factor: SpeedFactor, output_rate: u32) -> Self {
        Self {
            factor,
            output_rate,
        }
    }

    /// Duration the transformed audio will have.
    pub fn target_duration(&self, audio: &DecodedAudio) -> Duration {
        Duration::from_secs_f64(audio.duration().as_secs_f64() / self.factor.value())
    }

    /// Number of frames the transformed audio will have at the output rate.
    pub fn target_frames(&self, audio: &DecodedAudio) -> usize {
        let ratio = self.output_rate as f64 / audio.sample_rate() as f64 / self.factor.value();
        (audio.frames() as f64 * ratio).round() as usize
    }

    /// Consume `audio` and return it re-timed at the output rate.
    ///
    /// When neither the length nor the rate changes the buffer is handed back as is.
    pub fn apply(&self, audio: DecodedAudio) -> AppResult<DecodedAudio> {
        let target_frames = self.target_frames(&audio);
        if target_frames == audio.frames() && audio.sample_rate() == self.output_rate {
            return Ok(audio);
        }
        debug!(
            factor = self.factor.value(),
            input_frames = audio.frames(),
            input_rate = audio.sample_rate(),
            target_frames,
            output_rate = self.output_rate,
            "Applying speed transform"
        );
        audio.resample_to_frames(target_frames, self.output_rate)
    }
}
