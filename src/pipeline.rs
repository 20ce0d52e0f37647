//! # Request Pipeline
//!
//! One `RequestPipeline` runs per `POST /process` request and walks through
//! these stages:
//!
//! ```text
//! Received -> Validated -> Staged -> Decoded -> Transformed -> Encoded -> Responded
//!     \___________\___________\__________\___________\____________\---> Errored(kind)
//! ```
//!
//! Every stage returns an `AppResult`; the first error ends the run and is
//! turned into a single JSON response by the handler.
//!
//! Staging, decoding, the speed transform and encoding are blocking work.
//! They run together on tokio's blocking pool under a wall-clock timeout. The
//! staged file is owned by that blocking job, so it is deleted when the job
//! ends even if the request already timed out or the client went away.

use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::audio::{
    AudioCodec, EncodeTarget, FormatHint, SpeedFactor, SpeedLimits, SpeedTransform, TempAsset,
};
use crate::config::AppConfig;
use crate::error::{AppError, AppResult};

/// Download name of every processed file.
pub const OUTPUT_FILENAME: &str = "processed_audio.mp3";

/// MIME type of every processed file.
pub const OUTPUT_MIME_TYPE: &str = "audio/mp3";

/// The raw form fields of one upload.
#[derive(Debug, Default)]
pub struct UploadRequest {
    pub file: Option<UploadedFile>,
    pub speed: Option<String>,
}

#[derive(Debug)]
pub struct UploadedFile {
    pub bytes: Vec<u8>,
    pub filename: Option<String>,
}

/// An upload that passed validation and is ready to stage.
#[derive(Debug)]
pub struct ValidatedUpload {
    pub bytes: Vec<u8>,
    pub hint: FormatHint,
    pub speed: SpeedFactor,
}

/// Result of a successful run, held entirely in memory.
#[derive(Debug)]
pub struct ProcessedAudio {
    pub bytes: Vec<u8>,
    pub speed: SpeedFactor,
    pub input_duration: Duration,
    pub output_duration: Duration,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineStage {
    Received,
    Validated,
    Staged,
    Decoded,
    Transformed,
    Encoded,
    Responded,
}

impl fmt::Display for PipelineStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            PipelineStage::Received => "received",
            PipelineStage::Validated => "validated",
            PipelineStage::Staged => "staged",
            PipelineStage::Decoded => "decoded",
            PipelineStage::Transformed => "transformed",
            PipelineStage::Encoded => "encoded",
            PipelineStage::Responded => "responded",
        };
        f.write_str(name)
    }
}

/// Settings the blocking job needs, copied out of the shared config.
#[derive(Debug, Clone)]
struct JobSettings {
    job_id: Uuid,
    staging_dir: PathBuf,
    max_upload_bytes: usize,
    max_input: Duration,
    max_output: Duration,
    target: EncodeTarget,
}

pub struct RequestPipeline<'a> {
    config: &'a AppConfig,
    codec: Arc<dyn AudioCodec>,
    job_id: Uuid,
    stage: PipelineStage,
}

impl<'a> RequestPipeline<'a> {
    pub fn new(config: &'a AppConfig, codec: Arc<dyn AudioCodec>) -> Self {
        Self {
            config,
            codec,
            job_id: Uuid::new_v4(),
            stage: PipelineStage::Received,
        }
    }

    pub fn job_id(&self) -> Uuid {
        self.job_id
    }

    /// Run the whole pipeline for one upload.
    pub async fn run(&mut self, upload: UploadRequest) -> AppResult<ProcessedAudio> {
        let started = Instant::now();
        let result = self.execute(upload).await;

        match &result {
            Ok(processed) => {
                self.stage = PipelineStage::Responded;
                info!(
                    job_id = %self.job_id,
                    speed = processed.speed.value(),
                    input_ms = processed.input_duration.as_millis() as u64,
                    output_ms = processed.output_duration.as_millis() as u64,
                    bytes = processed.bytes.len(),
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    "Processed upload"
                );
            }
            Err(err) => {
                warn!(
                    job_id = %self.job_id,
                    stage = %self.stage,
                    kind = err.kind(),
                    error = %err,
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    "Processing failed"
                );
            }
        }

        result
    }

    async fn execute(&mut self, upload: UploadRequest) -> AppResult<ProcessedAudio> {
        let validated = self.validate(upload)?;
        self.advance(PipelineStage::Validated);

        let settings = JobSettings {
            job_id: self.job_id,
            staging_dir: self.config.staging_dir(),
            max_upload_bytes: self.config.upload.max_upload_bytes,
            max_input: self.config.processing.max_input(),
            max_output: self.config.processing.max_output(),
            target: EncodeTarget::from(&self.config.processing),
        };
        let codec = Arc::clone(&self.codec);
        let timeout = self.config.processing.timeout();

        let job = tokio::task::spawn_blocking(move || {
            let mut reached = PipelineStage::Validated;
            let result = process_upload(validated, &settings, codec.as_ref(), &mut reached);
            (result, reached)
        });

        let (result, reached) = match tokio::time::timeout(timeout, job).await {
            Ok(joined) => joined?,
            Err(_) => {
                return Err(AppError::Processing(format!(
                    "processing timed out after {}s",
                    timeout.as_secs()
                )))
            }
        };

        self.advance(reached);
        result
    }

    /// `Received -> Validated`: check the form fields before touching the disk.
    pub fn validate(&self, upload: UploadRequest) -> AppResult<ValidatedUpload> {
        let file = match upload.file {
            Some(file) if !file.bytes.is_empty() => file,
            _ => return Err(AppError::MissingFile),
        };

        let speed = SpeedFactor::parse(
            upload.speed.as_deref(),
            SpeedLimits::from(&self.config.processing),
        )?;

        let limit = self.config.upload.max_upload_bytes;
        if file.bytes.len() > limit {
            return Err(AppError::PayloadTooLarge { limit_bytes: limit });
        }

        Ok(ValidatedUpload {
            hint: FormatHint::from_filename(file.filename.as_deref()),
            bytes: file.bytes,
            speed,
        })
    }

    fn advance(&mut self, stage: PipelineStage) {
        debug!(job_id = %self.job_id, from = %self.stage, to = %stage, "Pipeline stage");
        self.stage = stage;
    }
}

/// Blocking part of the pipeline: `Validated -> Staged -> Decoded -> Transformed -> Encoded`.
///
/// The staged file lives at most as long as this function. `reached` is left at
/// the last stage that completed.
fn process_upload(
    upload: ValidatedUpload,
    settings: &JobSettings,
    codec: &dyn AudioCodec,
    reached: &mut PipelineStage,
) -> AppResult<ProcessedAudio> {
    let job_id = settings.job_id;

    if upload.bytes.len() > settings.max_upload_bytes {
        return Err(AppError::PayloadTooLarge {
            limit_bytes: settings.max_upload_bytes,
        });
    }

    let mut asset = TempAsset::acquire(&settings.staging_dir, upload.hint)?;
    asset.write(&upload.bytes)?;
    drop(upload.bytes);
    *reached = PipelineStage::Staged;
    debug!(
        job_id = %job_id,
        stage = %PipelineStage::Staged,
        path = %asset.path().display(),
        bytes = asset.bytes_written(),
        "Pipeline stage"
    );

    // Stop decoding once the result could no longer fit the output limit
    let max_decode = Duration::try_from_secs_f64(
        settings.max_output.as_secs_f64() * upload.speed.value(),
    )
    .map_or(settings.max_input, |scaled| scaled.min(settings.max_input));
    let decoded = codec.decode(asset.path(), asset.hint(), max_decode)?;
    *reached = PipelineStage::Decoded;
    debug!(
        job_id = %job_id,
        stage = %PipelineStage::Decoded,
        sample_rate = decoded.sample_rate(),
        channels = decoded.channel_count(),
        duration_ms = decoded.duration().as_millis() as u64,
        "Pipeline stage"
    );

    // The decoded samples are in memory, so the staged copy is no longer needed
    asset.release()?;

    let transform = SpeedTransform::new(upload.speed, settings.target.sample_rate);
    let output_duration = transform.target_duration(&decoded);
    if output_duration > settings.max_output {
        return Err(AppError::Processing(format!(
            "output would last {}s, longer than the {}s limit",
            output_duration.as_secs(),
            settings.max_output.as_secs()
        )));
    }
    let input_duration = decoded.duration();
    let transformed = transform.apply(decoded)?;
    *reached = PipelineStage::Transformed;
    debug!(
        job_id = %job_id,
        stage = %PipelineStage::Transformed,
        duration_ms = transformed.duration().as_millis() as u64,
        "Pipeline stage"
    );

    let bytes = codec.encode(&transformed, settings.target)?;
    *reached = PipelineStage::Encoded;

    Ok(ProcessedAudio {
        bytes,
        speed: upload.speed,
        input_duration,
        output_duration: transformed.duration(),
    })
}
