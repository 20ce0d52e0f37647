//! # Configuration Management
//!
//! This module handles loading the service configuration from multiple sources:
//! - TOML configuration files (config.toml)
//! - Environment variables (with APP_ prefix, `__` between nested keys)
//! - Default values (built into the code)
//!
//! ## Configuration Priority (highest to lowest):
//! 1. `HOST` / `PORT` environment variables (deployment platforms)
//! 2. Environment variables (APP_SERVER__PORT, APP_UPLOAD__MAX_UPLOAD_BYTES, etc.)
//! 3. Configuration file (config.toml)
//! 4. Default values (defined in the Default impl)
//!
//! The configuration is loaded once at startup and never changes afterwards.
//! Request handlers only ever see it through a shared, read-only reference.

use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::env;
use std::path::PathBuf;
use std::time::Duration;

/// Sample rates LAME can write without an internal rate change.
pub const SUPPORTED_OUTPUT_SAMPLE_RATES: [u32; 9] =
    [8000, 11025, 12000, 16000, 22050, 24000, 32000, 44100, 48000];

/// Constant bitrates (kbps) exposed for the MP3 output.
pub const SUPPORTED_BITRATES_KBPS: [u32; 6] = [96, 128, 160, 192, 256, 320];

/// Main application configuration that contains all settings.
///
/// ## Why separate config structs:
/// Breaking configuration into logical groups (server, cors, upload, processing)
/// keeps each concern small and maps one-to-one onto the TOML sections.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub cors: CorsConfig,
    pub upload: UploadConfig,
    pub processing: ProcessingConfig,
}

/// Server-specific configuration settings.
///
/// ## Common values:
/// - `host = "127.0.0.1"`: Only accept connections from localhost (development)
/// - `host = "0.0.0.0"`: Accept connections from any IP address (production)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

/// Cross-origin policy for browser callers.
///
/// Only a single origin is allowed to call `/process`. The special value `"*"`
/// allows any origin, which is handy for local development.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CorsConfig {
    pub allowed_origin: String,
}

/// Limits and placement for uploaded files.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UploadConfig {
    /// Maximum number of bytes accepted for the whole multipart body
    pub max_upload_bytes: usize,

    /// Directory for staged uploads; the system temp dir when unset
    #[serde(default)]
    pub staging_dir: Option<PathBuf>,
}

/// Output format and safety bounds for the speed transform.
///
/// ## Fields:
/// - `output_sample_rate`: Sample rate of the returned MP3 (Hz)
/// - `output_bitrate_kbps`: Constant bitrate of the returned MP3
/// - `min_speed` / `max_speed`: Inclusive bounds for the speed factor
/// - `timeout_secs`: Upper bound on staging + decode + transform + encode
/// - `max_input_seconds`: Longest upload that is decoded
/// - `max_output_seconds`: Longest result the speed transform may produce
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessingConfig {
    pub output_sample_rate: u32,
    pub output_bitrate_kbps: u32,
    pub min_speed: f64,
    pub max_speed: f64,
    pub timeout_secs: u64,
    pub max_input_seconds: u64,
    pub max_output_seconds: u64,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            server: ServerConfig {
                host: "127.0.0.1".to_string(),
                port: 5000,
            },
            cors: CorsConfig {
                allowed_origin: "https://sound-bite-v2.vercel.app".to_string(),
            },
            upload: UploadConfig {
                max_upload_bytes: 50 * 1024 * 1024, // 50 MiB
                staging_dir: None,
            },
            processing: ProcessingConfig {
                output_sample_rate: 44100,
                output_bitrate_kbps: 192,
                min_speed: 0.1,
                max_speed: 10.0,
                timeout_secs: 120,
                max_input_seconds: 1800,
                max_output_seconds: 1800,
            },
        }
    }
}

impl AppConfig {
    /// Load configuration from multiple sources in priority order.
    ///
    /// ## Environment Variable Examples:
    /// - `APP_SERVER__HOST=0.0.0.0`: Override server host
    /// - `APP_CORS__ALLOWED_ORIGIN=http://localhost:5173`: Override the allowed origin
    /// - `APP_UPLOAD__MAX_UPLOAD_BYTES=10485760`: Lower the upload limit to 10 MiB
    /// - `APP_PROCESSING__TIMEOUT_SECS=30`: Tighten the processing timeout
    /// - `HOST=0.0.0.0` / `PORT=3000`: Special cases for deployment platforms
    pub fn load() -> Result<Self> {
        let mut settings = config::Config::builder()
            .add_source(config::Config::try_from(&AppConfig::default())?)
            .add_source(config::File::with_name("config").required(false))
            .add_source(
                config::Environment::with_prefix("APP")
                    .prefix_separator("_")
                    .separator("__")
                    .try_parsing(true),
            );

        if let Ok(host) = env::var("HOST") {
            settings = settings.set_override("server.host", host)?;
        }

        if let Ok(port) = env::var("PORT") {
            settings = settings.set_override("server.port", port)?;
        }

        let config = settings.build()?.try_deserialize()?;
        Ok(config)
    }

    /// Validate that the configuration values make sense.
    ///
    /// Catching configuration errors here prevents requests from failing later
    /// with confusing codec or filesystem errors.
    pub fn validate(&self) -> Result<()> {
        if self.server.port == 0 {
            return Err(anyhow::anyhow!("Server port cannot be 0"));
        }

        if self.cors.allowed_origin.trim().is_empty() {
            return Err(anyhow::anyhow!("CORS allowed origin cannot be empty"));
        }

        if self.upload.max_upload_bytes == 0 {
            return Err(anyhow::anyhow!("Max upload size must be greater than 0"));
        }

        let p = &self.processing;
        if !p.min_speed.is_finite() || !p.max_speed.is_finite() || p.min_speed <= 0.0 {
            return Err(anyhow::anyhow!("Speed bounds must be finite and positive"));
        }

        // 1.0 is the default factor, so it must always be accepted
        if p.min_speed > 1.0 || p.max_speed < 1.0 {
            return Err(anyhow::anyhow!(
                "Speed bounds [{}, {}] must include 1.0",
                p.min_speed,
                p.max_speed
            ));
        }

        if !SUPPORTED_OUTPUT_SAMPLE_RATES.contains(&p.output_sample_rate) {
            return Err(anyhow::anyhow!(
                "Unsupported output sample rate {} Hz (supported: {:?})",
                p.output_sample_rate,
                SUPPORTED_OUTPUT_SAMPLE_RATES
            ));
        }

        if !SUPPORTED_BITRATES_KBPS.contains(&p.output_bitrate_kbps) {
            return Err(anyhow::anyhow!(
                "Unsupported output bitrate {} kbps (supported: {:?})",
                p.output_bitrate_kbps,
                SUPPORTED_BITRATES_KBPS
            ));
        }

        if p.timeout_secs == 0 {
            return Err(anyhow::anyhow!("Processing timeout must be greater than 0"));
        }

        if p.max_input_seconds == 0 || p.max_output_seconds == 0 {
            return Err(anyhow::anyhow!("Audio length limits must be greater than 0"));
        }

        Ok(())
    }

    /// Directory where uploads are staged for decoding.
    pub fn staging_dir(&self) -> PathBuf {
        self.upload
            .staging_dir
            .clone()
            .unwrap_or_else(env::temp_dir)
    }
}

impl ProcessingConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    pub fn max_input(&self) -> Duration {
        Duration::from_secs(self.max_input_seconds)
    }

    pub fn max_output(&self) -> Duration {
        Duration::from_secs(self.max_output_seconds)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = AppConfig::default();
        assert_eq!(config.server.host, "127.0.0.1");
        assert_eq!(config.upload.max_upload_bytes, 52_428_800);
        assert_eq!(config.processing.output_sample_rate, 44100);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_validation() {
        let mut config = AppConfig::default();
        config.server.port = 0;
        assert!(config.validate().is_err());

        let mut config = AppConfig::default();
        config.upload.max_upload_bytes = 0;
        assert!(config.validate().is_err());

        let mut config = AppConfig::default();
        config.cors.allowed_origin = "  ".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_speed_bounds_must_include_default() {
        let mut config = AppConfig::default();
        config.processing.min_speed = 1.5;
        assert!(config.validate().is_err());

        let mut config = AppConfig::default();
        config.processing.min_speed = 0.0;
        assert!(config.validate().is_err());

        let mut config = AppConfig::default();
        config.processing.max_speed = f64::INFINITY;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_output_format_validation() {
        let mut config = AppConfig::default();
        config.processing.output_sample_rate = 44000;
        assert!(config.validate().is_err());

        let mut config = AppConfig::default();
        config.processing.output_bitrate_kbps = 100;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_length_limits_validation() {
        let mut config = AppConfig::default();
        config.processing.max_output_seconds = 0;
        assert!(config.validate().is_err());

        let mut config = AppConfig::default();
        config.processing.max_input_seconds = 0;
        assert!(config.validate().is_err());

        let config = AppConfig::default();
        assert_eq!(config.processing.max_output(), Duration::from_secs(1800));
    }

    #[test]
    fn test_staging_dir_defaults_to_system_temp() {
        let mut config = AppConfig::default();
        assert_eq!(config.staging_dir(), env::temp_dir());

        config.upload.staging_dir = Some(PathBuf::from("/var/tmp/soundbite"));
        assert_eq!(config.staging_dir(), PathBuf::from("/var/tmp/soundbite"));
    }
}
