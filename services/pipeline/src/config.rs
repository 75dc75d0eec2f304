//! Configuration management for the Argus pipeline.
//!
//! Configuration is layered: built-in defaults, then optional files, then
//! environment variables prefixed with `ARGUS__`.

use crate::statement::{TableName, COLUMN_COUNT, MAX_BIND_PARAMS};
use config::{Config, ConfigError, Environment, File};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Main configuration for the pipeline.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ArgusConfig {
    #[serde(default)]
    pub service: ServiceConfig,

    #[serde(default)]
    pub sources: SourcesConfig,

    #[serde(default)]
    pub detector: DetectorConfig,

    #[serde(default)]
    pub windowing: WindowingConfig,

    #[serde(default)]
    pub loading: LoadingConfig,

    #[serde(default)]
    pub database: DatabaseConfig,

    #[serde(default)]
    pub staging: StagingConfig,
}

/// Service identity, logging and metrics.
#[derive(Debug, Clone, Deserialize)]
pub struct ServiceConfig {
    #[serde(default = "default_service_name")]
    pub name: String,

    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub log_level: String,

    #[serde(default)]
    pub log_format: LogFormat,

    /// Port for the Prometheus exporter; disabled when unset
    #[serde(default)]
    pub metrics_port: Option<u16>,
}

/// Log output format
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Pretty,
    Json,
}

/// Input directories and media sampling.
#[derive(Debug, Clone, Deserialize)]
pub struct SourcesConfig {
    #[serde(default = "default_image_dir")]
    pub image_dir: PathBuf,

    #[serde(default = "default_video_dir")]
    pub video_dir: PathBuf,

    #[serde(default = "default_image_extensions")]
    pub image_extensions: Vec<String>,

    #[serde(default = "default_video_extensions")]
    pub video_extensions: Vec<String>,

    /// Process every n-th video frame
    #[serde(default = "default_frame_stride")]
    pub frame_stride: u32,

    /// Videos processed at once
    #[serde(default = "default_source_concurrency")]
    pub source_concurrency: usize,

    #[serde(default = "default_ffmpeg_bin")]
    pub ffmpeg_bin: String,

    #[serde(default = "default_ffprobe_bin")]
    pub ffprobe_bin: String,
}

/// Inference endpoint settings.
#[derive(Debug, Clone, Deserialize)]
pub struct DetectorConfig {
    #[serde(default = "default_detector_endpoint")]
    pub endpoint: String,

    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,

    /// Detections below this confidence are dropped
    #[serde(default = "default_min_confidence")]
    pub min_confidence: f64,

    #[serde(default = "default_jpeg_quality")]
    pub jpeg_quality: u8,
}

#[derive(Debug, Clone, Deserialize)]
pub struct WindowingConfig {
    /// Window length in seconds of video time
    #[serde(default = "default_window_duration")]
    pub duration_secs: f64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LoadingConfig {
    /// Records per insert statement
    #[serde(default = "default_chunk_size")]
    pub chunk_size: usize,

    #[serde(default = "default_table")]
    pub table: String,

    /// Issue `CREATE TABLE IF NOT EXISTS` before loading
    #[serde(default = "default_create_table")]
    pub create_table: bool,
}

/// PostgreSQL connection configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    #[serde(default)]
    pub url: String,

    #[serde(default = "default_max_connections")]
    pub max_connections: u32,

    #[serde(default = "default_min_connections")]
    pub min_connections: u32,

    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,

    #[serde(default = "default_idle_timeout")]
    pub idle_timeout_secs: u64,

    /// Give up connecting after this long
    #[serde(default = "default_connect_retry_max_elapsed")]
    pub connect_retry_max_elapsed_secs: u64,

    #[serde(default = "default_connect_retry_initial_ms")]
    pub connect_retry_initial_ms: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct StagingConfig {
    #[serde(default = "default_staging_path")]
    pub path: PathBuf,
}

// Default value functions
fn default_service_name() -> String {
    "argus".to_string()
}
fn default_log_level() -> String {
    "info".to_string()
}
fn default_image_dir() -> PathBuf {
    PathBuf::from("imagenes_entrada")
}
fn default_video_dir() -> PathBuf {
    PathBuf::from("videos_entrada")
}
fn default_image_extensions() -> Vec<String> {
    ["jpg", "jpeg", "png", "bmp"]
        .iter()
        .map(|s| s.to_string())
        .collect()
}
fn default_video_extensions() -> Vec<String> {
    ["mp4", "avi", "mov", "mkv"]
        .iter()
        .map(|s| s.to_string())
        .collect()
}
fn default_frame_stride() -> u32 {
    30
}
fn default_source_concurrency() -> usize {
    1
}
fn default_ffmpeg_bin() -> String {
    "ffmpeg".to_string()
}
fn default_ffprobe_bin() -> String {
    "ffprobe".to_string()
}
fn default_detector_endpoint() -> String {
    "http://localhost:8000/detect".to_string()
}
fn default_request_timeout() -> u64 {
    30
}
fn default_min_confidence() -> f64 {
    0.5
}
fn default_jpeg_quality() -> u8 {
    90
}
fn default_window_duration() -> f64 {
    10.0
}
fn default_chunk_size() -> usize {
    100
}
fn default_table() -> String {
    "yolo_objects".to_string()
}
fn default_create_table() -> bool {
    true
}
fn default_max_connections() -> u32 {
    4
}
fn default_min_connections() -> u32 {
    1
}
fn default_connect_timeout() -> u64 {
    30
}
fn default_idle_timeout() -> u64 {
    600
}
fn default_connect_retry_max_elapsed() -> u64 {
    60
}
fn default_connect_retry_initial_ms() -> u64 {
    500
}
fn default_staging_path() -> PathBuf {
    PathBuf::from("data/detecciones_staging.csv")
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            name: default_service_name(),
            log_level: default_log_level(),
            log_format: LogFormat::default(),
            metrics_port: None,
        }
    }
}

impl Default for SourcesConfig {
    fn default() -> Self {
        Self {
            image_dir: default_image_dir(),
            video_dir: default_video_dir(),
            image_extensions: default_image_extensions(),
            video_extensions: default_video_extensions(),
            frame_stride: default_frame_stride(),
            source_concurrency: default_source_concurrency(),
            ffmpeg_bin: default_ffmpeg_bin(),
            ffprobe_bin: default_ffprobe_bin(),
        }
    }
}

impl Default for DetectorConfig {
    fn default() -> Self {
        Self {
            endpoint: default_detector_endpoint(),
            request_timeout_secs: default_request_timeout(),
            min_confidence: default_min_confidence(),
            jpeg_quality: default_jpeg_quality(),
        }
    }
}

impl Default for WindowingConfig {
    fn default() -> Self {
        Self {
            duration_secs: default_window_duration(),
        }
    }
}

impl Default for LoadingConfig {
    fn default() -> Self {
        Self {
            chunk_size: default_chunk_size(),
            table: default_table(),
            create_table: default_create_table(),
        }
    }
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: String::new(),
            max_connections: default_max_connections(),
            min_connections: default_min_connections(),
            connect_timeout_secs: default_connect_timeout(),
            idle_timeout_secs: default_idle_timeout(),
            connect_retry_max_elapsed_secs: default_connect_retry_max_elapsed(),
            connect_retry_initial_ms: default_connect_retry_initial_ms(),
        }
    }
}

impl Default for StagingConfig {
    fn default() -> Self {
        Self {
            path: default_staging_path(),
        }
    }
}

impl ArgusConfig {
    /// Load configuration from files and environment variables.
    ///
    /// Later sources override earlier ones:
    /// 1. `config/argus.{toml,yaml,json}`
    /// 2. `/etc/argus/argus.{toml,yaml,json}`
    /// 3. The file passed with `--config`, which must exist
    /// 4. Environment variables (e.g. `ARGUS__DATABASE__URL`)
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut builder = Config::builder()
            .add_source(File::with_name("config/argus").required(false))
            .add_source(File::with_name("/etc/argus/argus").required(false));

        if let Some(path) = path {
            builder = builder.add_source(File::from(path).required(true));
        }

        let config = builder
            .add_source(
                Environment::with_prefix("ARGUS")
                    .prefix_separator("__")
                    .separator("__")
                    .list_separator(",")
                    .with_list_parse_key("sources.image_extensions")
                    .with_list_parse_key("sources.video_extensions")
                    .try_parsing(true),
            )
            .build()?;

        config.try_deserialize()
    }

    /// Validate settings every command depends on.
    pub fn validate(&self) -> Result<(), ConfigValidationError> {
        let duration = self.windowing.duration_secs;
        if !duration.is_finite() || duration <= 0.0 {
            return Err(ConfigValidationError::InvalidValue {
                field: "windowing.duration_secs".to_string(),
                message: "Duration must be finite and greater than 0".to_string(),
            });
        }

        if self.loading.chunk_size == 0 {
            return Err(ConfigValidationError::InvalidValue {
                field: "loading.chunk_size".to_string(),
                message: "Chunk size must be at least 1".to_string(),
            });
        }

        let params = self.loading.chunk_size.checked_mul(COLUMN_COUNT);
        if params.map_or(true, |n| n > MAX_BIND_PARAMS) {
            return Err(ConfigValidationError::InvalidValue {
                field: "loading.chunk_size".to_string(),
                message: format!(
                    "Chunk size must be at most {} ({} columns per row)",
                    MAX_BIND_PARAMS / COLUMN_COUNT,
                    COLUMN_COUNT
                ),
            });
        }

        if TableName::parse(&self.loading.table).is_err() {
            return Err(ConfigValidationError::InvalidValue {
                field: "loading.table".to_string(),
                message: "Table must be an identifier, optionally schema-qualified".to_string(),
            });
        }

        if self.sources.frame_stride == 0 {
            return Err(ConfigValidationError::InvalidValue {
                field: "sources.frame_stride".to_string(),
                message: "Frame stride must be at least 1".to_string(),
            });
        }

        if self.sources.source_concurrency == 0 {
            return Err(ConfigValidationError::InvalidValue {
                field: "sources.source_concurrency".to_string(),
                message: "Concurrency must be at least 1".to_string(),
            });
        }

        if !(0.0..=1.0).contains(&self.detector.min_confidence) {
            return Err(ConfigValidationError::InvalidValue {
                field: "detector.min_confidence".to_string(),
                message: "Confidence threshold must be within [0, 1]".to_string(),
            });
        }

        if self.detector.jpeg_quality == 0 || self.detector.jpeg_quality > 100 {
            return Err(ConfigValidationError::InvalidValue {
                field: "detector.jpeg_quality".to_string(),
                message: "JPEG quality must be within 1..=100".to_string(),
            });
        }

        Ok(())
    }

    /// Settings needed to run detection.
    pub fn validate_detector(&self) -> Result<(), ConfigValidationError> {
        if self.detector.endpoint.is_empty() {
            return Err(ConfigValidationError::MissingField(
                "detector.endpoint".to_string(),
            ));
        }
        Ok(())
    }

    /// Settings needed to reach the warehouse.
    pub fn validate_database(&self) -> Result<(), ConfigValidationError> {
        if self.database.url.is_empty() {
            return Err(ConfigValidationError::MissingField(
                "database.url".to_string(),
            ));
        }
        if self.database.max_connections == 0 {
            return Err(ConfigValidationError::InvalidValue {
                field: "database.max_connections".to_string(),
                message: "Pool size must be at least 1".to_string(),
            });
        }
        Ok(())
    }
}

impl DetectorConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

/// Configuration validation errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigValidationError {
    #[error("Missing required field: {0}")]
    MissingField(String),

    #[error("Invalid value for {field}: {message}")]
    InvalidValue { field: String, message: String },
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults_are_valid() {
        let config = ArgusConfig::default();
        assert!(config.validate().is_ok());
        assert!(config.validate_detector().is_ok());
        assert_eq!(config.loading.chunk_size, 100);
        assert_eq!(config.windowing.duration_secs, 10.0);
        assert_eq!(config.sources.frame_stride, 30);
        assert_eq!(config.detector.min_confidence, 0.5);
    }

    #[test]
    fn test_database_url_required_for_loading() {
        let mut config = ArgusConfig::default();
        assert!(matches!(
            config.validate_database(),
            Err(ConfigValidationError::MissingField(_))
        ));

        config.database.url = "postgres://localhost/argus".to_string();
        assert!(config.validate_database().is_ok());
    }

    #[test]
    fn test_invalid_duration() {
        let mut config = ArgusConfig::default();
        config.windowing.duration_secs = 0.0;
        assert!(matches!(
            config.validate(),
            Err(ConfigValidationError::InvalidValue { .. })
        ));

        config.windowing.duration_secs = f64::NAN;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_chunk_size_bounds() {
        let mut config = ArgusConfig::default();
        config.loading.chunk_size = 0;
        assert!(config.validate().is_err());

        config.loading.chunk_size = 2340;
        assert!(config.validate().is_ok());

        config.loading.chunk_size = 2341;
        assert!(config.validate().is_err());

        config.loading.chunk_size = usize::MAX;
        assert!(matches!(
            config.validate(),
            Err(ConfigValidationError::InvalidValue { .. })
        ));
    }

    #[test]
    fn test_invalid_table() {
        let mut config = ArgusConfig::default();
        config.loading.table = "objects; DROP".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_min_confidence_range() {
        let mut config = ArgusConfig::default();
        config.detector.min_confidence = 1.5;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(
            file,
            r#"
[windowing]
duration_secs = 5.0

[loading]
chunk_size = 50
table = "analytics.objects"

[service]
log_format = "json"
"#
        )
        .unwrap();

        let config = ArgusConfig::load(Some(file.path())).unwrap();
        assert_eq!(config.windowing.duration_secs, 5.0);
        assert_eq!(config.loading.chunk_size, 50);
        assert_eq!(config.loading.table, "analytics.objects");
        assert_eq!(config.service.log_format, LogFormat::Json);
        assert_eq!(config.sources.frame_stride, 30);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_missing_explicit_file_is_error() {
        assert!(ArgusConfig::load(Some(Path::new("/nonexistent/argus.toml"))).is_err());
    }
}
