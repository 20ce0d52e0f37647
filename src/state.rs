//! # Application State Management
//!
//! State shared by every HTTP request handler.
//!
//! ## What is shared:
//! - **Configuration**: `Arc<AppConfig>`, read-only after startup. Handlers get
//!   a reference to it; nothing can change it while requests are running.
//! - **Codec**: `Arc<dyn AudioCodec>`, stateless and safe to call concurrently.
//! - **Metrics**: `Arc<RwLock<AppMetrics>>`, counters updated by the metrics
//!   middleware and by in-flight job tracking.
//!
//! The processing pipeline itself keeps no cross-request state. Metrics are
//! observability only and never influence how a request is processed.

use crate::audio::{AudioCodec, SymphoniaLameCodec};
use crate::config::AppConfig;
use std::collections::HashMap;
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Instant;

/// The main application state that's shared across all HTTP request handlers.
///
/// Cloning is cheap: every field is either an `Arc` or `Copy`.
#[derive(Clone)]
pub struct AppState {
    /// Process-wide configuration, immutable after startup
    pub config: Arc<AppConfig>,

    /// Decoder/encoder used by the processing pipeline
    pub codec: Arc<dyn AudioCodec>,

    /// Performance metrics (constantly being updated by requests)
    pub metrics: Arc<RwLock<AppMetrics>>,

    /// When the server started
    pub start_time: Instant,
}

/// Performance metrics collected across all HTTP requests.
#[derive(Debug, Default, Clone)]
pub struct AppMetrics {
    /// Total number of HTTP requests processed since server start
    pub request_count: u64,

    /// Total number of error responses since server start
    pub error_count: u64,

    /// Uploads currently being processed
    pub active_jobs: u32,

    /// Uploads that produced an MP3 since server start
    pub completed_jobs: u64,

    /// Detailed metrics for each API endpoint
    /// Key: endpoint name (e.g., "POST /process")
    pub endpoint_metrics: HashMap<String, EndpointMetric>,
}

/// Detailed performance metrics for a specific API endpoint.
#[derive(Debug, Default, Clone)]
pub struct EndpointMetric {
    pub request_count: u64,
    pub total_duration_ms: u64,
    pub error_count: u64,
}

impl AppState {
    /// Create state with the default symphonia/LAME codec.
    pub fn new(config: AppConfig) -> Self {
        Self::with_codec(config, Arc::new(SymphoniaLameCodec))
    }

    pub fn with_codec(config: AppConfig, codec: Arc<dyn AudioCodec>) -> Self {
        Self {
            config: Arc::new(config),
            codec,
            metrics: Arc::new(RwLock::new(AppMetrics::default())),
            start_time: Instant::now(),
        }
    }

    /// Borrow the shared configuration.
    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    // A panic while holding the lock only ever interrupts a counter update,
    // so the data behind a poisoned lock is still usable.
    fn metrics_read(&self) -> RwLockReadGuard<'_, AppMetrics> {
        self.metrics.read().unwrap_or_else(|e| e.into_inner())
    }

    fn metrics_write(&self) -> RwLockWriteGuard<'_, AppMetrics> {
        self.metrics.write().unwrap_or_else(|e| e.into_inner())
    }

    pub fn increment_request_count(&self) {
        self.metrics_write().request_count += 1;
    }

    pub fn increment_error_count(&self) {
        self.metrics_write().error_count += 1;
    }

    /// Record detailed metrics for a specific endpoint.
    pub fn record_endpoint_request(&self, endpoint: &str, duration_ms: u64, is_error: bool) {
        let mut metrics = self.metrics_write();
        let endpoint_metric = metrics.endpoint_metrics.entry(endpoint.to_string()).or_default();

        endpoint_metric.request_count += 1;
        endpoint_metric.total_duration_ms += duration_ms;
        if is_error {
            endpoint_metric.error_count += 1;
        }
    }

    /// Mark an upload as in flight until the returned guard is dropped.
    pub fn begin_job(&self) -> ActiveJobGuard {
        self.metrics_write().active_jobs += 1;
        ActiveJobGuard {
            metrics: Arc::clone(&self.metrics),
            completed: false,
        }
    }

    pub fn get_metrics_snapshot(&self) -> AppMetrics {
        self.metrics_read().clone()
    }

    pub fn get_uptime_seconds(&self) -> u64 {
        self.start_time.elapsed().as_secs()
    }
}

/// Keeps `active_jobs` accurate on every exit path, including cancelled requests.
pub struct ActiveJobGuard {
    metrics: Arc<RwLock<AppMetrics>>,
    completed: bool,
}

impl ActiveJobGuard {
    /// Count the job as successfully completed when the guard drops.
    pub fn complete(&mut self) {
        self.completed = true;
    }
}

impl Drop for ActiveJobGuard {
    fn drop(&mut self) {
        let mut metrics = self.metrics.write().unwrap_or_else(|e| e.into_inner());
        metrics.active_jobs = metrics.active_jobs.saturating_sub(1);
        if self.completed {
            metrics.completed_jobs += 1;
        }
    }
}

impl EndpointMetric {
    pub fn average_duration_ms(&self) -> f64 {
        if self.request_count > 0 {
            self.total_duration_ms as f64 / self.request_count as f64
        } else {
            0.0
        }
    }

    /// Error rate between 0.0 and 1.0.
    pub fn error_rate(&self) -> f64 {
        if self.request_count > 0 {
            self.error_count as f64 / self.request_count as f64
        } else {
            0.0
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_endpoint_metrics() {
        let state = AppState::new(AppConfig::default());
        state.record_endpoint_request("POST /process", 120, false);
        state.record_endpoint_request("POST /process", 80, true);

        let snapshot = state.get_metrics_snapshot();
        let metric = &snapshot.endpoint_metrics["POST /process"];
        assert_eq!(metric.request_count, 2);
        assert_eq!(metric.average_duration_ms(), 100.0);
        assert_eq!(metric.error_rate(), 0.5);
    }

    #[test]
    fn test_job_guard_tracks_active_jobs() {
        let state = AppState::new(AppConfig::default());
        {
            let _first = state.begin_job();
            let mut second = state.begin_job();
            assert_eq!(state.get_metrics_snapshot().active_jobs, 2);
            second.complete();
        }

        let snapshot = state.get_metrics_snapshot();
        assert_eq!(snapshot.active_jobs, 0);
        assert_eq!(snapshot.completed_jobs, 1);
    }

    #[test]
    fn test_clones_share_config_and_metrics() {
        let state = AppState::new(AppConfig::default());
        let clone = state.clone();
        clone.increment_request_count();

        assert!(Arc::ptr_eq(&state.config, &clone.config));
        assert_eq!(state.get_metrics_snapshot().request_count, 1);
    }
}
