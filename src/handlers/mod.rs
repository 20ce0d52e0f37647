//! HTTP route table.
//!
//! - `GET /`        liveness text
//! - `POST /process` upload, re-time and download as MP3
//! - `GET /health`  health report with job and memory figures
//! - `GET /metrics` per-endpoint request statistics

pub mod process;

pub use process::{process_audio, JOB_ID_HEADER};

use actix_web::web;

use crate::health;

pub fn configure_routes(cfg: &mut web::ServiceConfig) {
    cfg.route("/", web::get().to(health::liveness))
        .route("/process", web::post().to(process_audio))
        .route("/health", web::get().to(health::health_check))
        .route("/metrics", web::get().to(health::detailed_metrics));
}
