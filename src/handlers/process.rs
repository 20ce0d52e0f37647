//! # Audio Processing Handler
//!
//! ## Endpoint: `POST /process`
//!
//! ## Request:
//! Multipart form data with:
//! - `file`: the audio file (required)
//! - `speed`: decimal playback speed (optional, defaults to `1.0`)
//!
//! ## Response:
//! - **200**: the processed MP3 as an attachment named `processed_audio.mp3`
//! - **400**: `{"error": "...", "kind": "missing_file" | "invalid_speed" | "payload_too_large" | "bad_request"}`
//! - **500**: `{"error": "...", "kind": "decode_error" | "encode_error" | "staging_error" | "processing_error"}`

use actix_multipart::{Field, Multipart};
use actix_web::http::header::{ContentDisposition, DispositionParam, DispositionType};
use actix_web::{web, HttpResponse};
use futures_util::stream::StreamExt;
use tracing::debug;

use crate::error::{AppError, AppResult};
use crate::pipeline::{RequestPipeline, UploadRequest, UploadedFile, OUTPUT_FILENAME, OUTPUT_MIME_TYPE};
use crate::state::AppState;

/// Response header carrying the id used in this job's log lines.
pub const JOB_ID_HEADER: &str = "x-job-id";

const FILE_FIELD: &str = "file";
const SPEED_FIELD: &str = "speed";

/// Longest `speed` value worth parsing.
const MAX_SPEED_FIELD_BYTES: usize = 64;

pub async fn process_audio(
    state: web::Data<AppState>,
    payload: Multipart,
) -> Result<HttpResponse, AppError> {
    let config = state.config();
    let upload = read_upload(payload, config.upload.max_upload_bytes).await?;

    let mut job = state.begin_job();
    let mut pipeline = RequestPipeline::new(config, state.codec.clone());
    let processed = pipeline.run(upload).await?;
    job.complete();

    Ok(HttpResponse::Ok()
        .content_type(OUTPUT_MIME_TYPE)
        .insert_header(ContentDisposition {
            disposition: DispositionType::Attachment,
            parameters: vec![DispositionParam::Filename(OUTPUT_FILENAME.to_string())],
        })
        .insert_header((JOB_ID_HEADER, pipeline.job_id().to_string()))
        .body(processed.bytes))
}

/// Collect the form fields, enforcing `max_bytes` across the whole body.
///
/// The limit is checked chunk by chunk, so an oversized upload is rejected as
/// soon as it crosses the limit instead of being buffered completely.
pub async fn read_upload(mut payload: Multipart, max_bytes: usize) -> AppResult<UploadRequest> {
    let mut upload = UploadRequest::default();
    let mut total = 0usize;

    while let Some(item) = payload.next().await {
        let mut field: Field = item?;

        let (name, filename) = {
            let content_disposition = field.content_disposition().ok_or_else(|| {
                AppError::BadRequest("Missing content disposition".to_string())
            })?;
            (
                content_disposition.get_name().map(|s| s.to_string()),
                content_disposition.get_filename().map(|s| s.to_string()),
            )
        };

        let bytes = read_field(&mut field, &mut total, max_bytes).await?;

        match name.as_deref() {
            Some(FILE_FIELD) => {
                debug!(filename = ?filename, bytes = bytes.len(), "Received file field");
                upload.file = Some(UploadedFile { bytes, filename });
            }
            Some(SPEED_FIELD) => {
                if bytes.len() > MAX_SPEED_FIELD_BYTES {
                    return Err(AppError::InvalidSpeed("value is too long".to_string()));
                }
                let value = String::from_utf8(bytes)
                    .map_err(|_| AppError::InvalidSpeed("value is not valid UTF-8".to_string()))?;
                upload.speed = Some(value);
            }
            other => {
                debug!(field = ?other, "Ignoring unknown form field");
            }
        }
    }

    Ok(upload)
}

async fn read_field(field: &mut Field, total: &mut usize, max_bytes: usize) -> AppResult<Vec<u8>> {
    let mut bytes = Vec::new();
    while let Some(chunk) = field.next().await {
        let chunk = chunk?;
        *total += chunk.len();
        if *total > max_bytes {
            return Err(AppError::PayloadTooLarge {
                limit_bytes: max_bytes,
            });
        }
        bytes.extend_from_slice(&chunk);
    }
    Ok(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::test_support::{mp3_fixture, sine_wave, wav_fixture};
    use crate::config::AppConfig;
    use actix_web::http::StatusCode;
    use actix_web::{test, App};
    use std::path::Path;

    const BOUNDARY: &str = "----soundbite-test-boundary";

    enum Part<'a> {
        File(&'a str, &'a [u8]),
        Text(&'a str, &'a str),
    }

    fn multipart_body(parts: &[Part<'_>]) -> Vec<u8> {
        let mut body = Vec::new();
        for part in parts {
            body.extend_from_slice(format!("--{}\r\n", BOUNDARY).as_bytes());
            match part {
                Part::File(filename, bytes) => {
                    body.extend_from_slice(
                        format!(
                            "Content-Disposition: form-data; name=\"file\"; filename=\"{}\"\r\n\
                             Content-Type: application/octet-stream\r\n\r\n",
                            filename
                        )
                        .as_bytes(),
                    );
                    body.extend_from_slice(bytes);
                }
                Part::Text(name, value) => {
                    body.extend_from_slice(
                        format!("Content-Disposition: form-data; name=\"{}\"\r\n\r\n", name).as_bytes(),
                    );
                    body.extend_from_slice(value.as_bytes());
                }
            }
            body.extend_from_slice(b"\r\n");
        }
        body.extend_from_slice(format!("--{}--\r\n", BOUNDARY).as_bytes());
        body
    }

    fn process_request(parts: &[Part<'_>]) -> test::TestRequest {
        test::TestRequest::post()
            .uri("/process")
            .insert_header((
                "content-type",
                format!("multipart/form-data; boundary={}", BOUNDARY),
            ))
            .set_payload(multipart_body(parts))
    }

    fn test_state(staging_dir: &Path) -> AppState {
        let mut config = AppConfig::default();
        config.upload.staging_dir = Some(staging_dir.to_path_buf());
        AppState::new(config)
    }

    fn staged_files(dir: &Path) -> usize {
        std::fs::read_dir(dir).unwrap().count()
    }

    async fn error_kind(response: actix_web::dev::ServiceResponse) -> String {
        let body: serde_json::Value = test::read_body_json(response).await;
        assert!(body["error"].is_string());
        body["kind"].as_str().unwrap().to_string()
    }

    #[actix_web::test]
    async fn test_process_returns_mp3_attachment() {
        let dir = tempfile::tempdir().unwrap();
        let app = test::init_service(
            App::new()
                .app_data(web::Data::new(test_state(dir.path())))
                .configure(crate::handlers::configure_routes),
        )
        .await;

        let input = mp3_fixture(&sine_wave(44100, 2, 1.0));
        let request = process_request(&[Part::File("song.mp3", &input), Part::Text("speed", "1.5")]);
        let response = test::call_service(&app, request.to_request()).await;

        assert_eq!(response.status(), StatusCode::OK);
        let headers = response.headers();
        assert_eq!(headers.get("content-type").unwrap(), "audio/mp3");
        assert_eq!(
            headers.get("content-disposition").unwrap(),
            "attachment; filename=\"processed_audio.mp3\""
        );
        assert!(headers.contains_key(JOB_ID_HEADER));

        let body = test::read_body(response).await;
        assert!(!body.is_empty());
        assert_eq!(staged_files(dir.path()), 0);
    }

    #[actix_web::test]
    async fn test_speed_field_is_optional() {
        let dir = tempfile::tempdir().unwrap();
        let app = test::init_service(
            App::new()
                .app_data(web::Data::new(test_state(dir.path())))
                .configure(crate::handlers::configure_routes),
        )
        .await;

        let input = wav_fixture(16000, 1, 0.5);
        let request = process_request(&[Part::File("memo.wav", &input)]);
        let response = test::call_service(&app, request.to_request()).await;

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(staged_files(dir.path()), 0);
    }

    #[actix_web::test]
    async fn test_missing_file_is_400_without_staging() {
        let dir = tempfile::tempdir().unwrap();
        let app = test::init_service(
            App::new()
                .app_data(web::Data::new(test_state(dir.path())))
                .configure(crate::handlers::configure_routes),
        )
        .await;

        let request = process_request(&[Part::Text("speed", "2.0")]);
        let response = test::call_service(&app, request.to_request()).await;

        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert_eq!(error_kind(response).await, "missing_file");
        assert_eq!(staged_files(dir.path()), 0);
    }

    #[actix_web::test]
    async fn test_malformed_speed_is_400() {
        let dir = tempfile::tempdir().unwrap();
        let app = test::init_service(
            App::new()
                .app_data(web::Data::new(test_state(dir.path())))
                .configure(crate::handlers::configure_routes),
        )
        .await;

        let input = wav_fixture(16000, 1, 0.5);
        let request = process_request(&[Part::File("memo.wav", &input), Part::Text("speed", "abc")]);
        let response = test::call_service(&app, request.to_request()).await;

        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert_eq!(error_kind(response).await, "invalid_speed");
        assert_eq!(staged_files(dir.path()), 0);
    }

    #[actix_web::test]
    async fn test_oversized_upload_is_rejected_before_decode() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = AppConfig::default();
        config.upload.staging_dir = Some(dir.path().to_path_buf());
        config.upload.max_upload_bytes = 1024;
        let app = test::init_service(
            App::new()
                .app_data(web::Data::new(AppState::new(config)))
                .configure(crate::handlers::configure_routes),
        )
        .await;

        let input = wav_fixture(16000, 1, 0.5);
        let request = process_request(&[Part::File("memo.wav", &input)]);
        let response = test::call_service(&app, request.to_request()).await;

        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert_eq!(error_kind(response).await, "payload_too_large");
        assert_eq!(staged_files(dir.path()), 0);
    }

    #[actix_web::test]
    async fn test_corrupt_file_is_500_and_cleaned_up() {
        let dir = tempfile::tempdir().unwrap();
        let app = test::init_service(
            App::new()
                .app_data(web::Data::new(test_state(dir.path())))
                .configure(crate::handlers::configure_routes),
        )
        .await;

        let garbage: Vec<u8> = (0..4096u32).map(|i| (i * 7 % 251) as u8).collect();
        let request = process_request(&[Part::File("song.mp3", &garbage)]);
        let response = test::call_service(&app, request.to_request()).await;

        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(error_kind(response).await, "decode_error");
        assert_eq!(staged_files(dir.path()), 0);
    }

    #[actix_web::test]
    async fn test_unknown_fields_are_ignored() {
        let dir = tempfile::tempdir().unwrap();
        let app = test::init_service(
            App::new()
                .app_data(web::Data::new(test_state(dir.path())))
                .configure(crate::handlers::configure_routes),
        )
        .await;

        let input = wav_fixture(16000, 1, 0.25);
        let request = process_request(&[
            Part::Text("title", "my memo"),
            Part::File("memo.wav", &input),
            Part::Text("speed", "0.8"),
        ]);
        let response = test::call_service(&app, request.to_request()).await;

        assert_eq!(response.status(), StatusCode::OK);
    }

    #[actix_web::test]
    async fn test_job_metrics_are_recorded() {
        let dir = tempfile::tempdir().unwrap();
        let state = test_state(dir.path());
        let app = test::init_service(
            App::new()
                .app_data(web::Data::new(state.clone()))
                .configure(crate::handlers::configure_routes),
        )
        .await;

        let input = wav_fixture(16000, 1, 0.25);
        let request = process_request(&[Part::File("memo.wav", &input)]);
        let response = test::call_service(&app, request.to_request()).await;
        assert_eq!(response.status(), StatusCode::OK);

        let snapshot = state.get_metrics_snapshot();
        assert_eq!(snapshot.active_jobs, 0);
        assert_eq!(snapshot.completed_jobs, 1);
    }
}
