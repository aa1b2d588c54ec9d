//! Configuration management for the intake service.
//!
//! Values come from optional config files and `SSCAN__`-prefixed environment
//! variables. The two Supabase connection parameters have no defaults: a
//! missing URL or access key fails startup.

use serde::Deserialize;
use std::time::Duration;

/// Main configuration for the intake service
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// Service configuration
    #[serde(default)]
    pub service: ServiceConfig,
    /// Supabase connection and table/bucket names
    pub supabase: SupabaseConfig,
    /// Camera and decoder configuration
    #[serde(default)]
    pub scanner: ScannerConfig,
    /// Still capture configuration
    #[serde(default)]
    pub capture: CaptureConfig,
    /// Upload compression limits
    #[serde(default)]
    pub compression: CompressionConfig,
    /// Operator notification settings
    #[serde(default)]
    pub notifications: NotificationConfig,
    /// Operator API configuration
    #[serde(default)]
    pub api: ApiConfig,
}

/// Service-level configuration
#[derive(Debug, Clone, Deserialize)]
pub struct ServiceConfig {
    /// Service name for logging/metrics
    #[serde(default = "default_service_name")]
    pub name: String,
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub log_level: String,
    /// Log output format (json, pretty)
    #[serde(default = "default_log_format")]
    pub log_format: String,
    /// Metrics port
    #[serde(default = "default_metrics_port")]
    pub metrics_port: u16,
}

/// Supabase connection configuration
#[derive(Debug, Clone, Deserialize)]
pub struct SupabaseConfig {
    /// Project endpoint, e.g. `https://xyz.supabase.co`
    pub url: String,
    /// Anonymous access key
    pub anon_key: String,
    /// Table holding one row per product
    #[serde(default = "default_products_table")]
    pub products_table: String,
    /// Storage bucket for product photos
    #[serde(default = "default_image_bucket")]
    pub image_bucket: String,
    /// Per-request timeout in seconds
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
}

/// Camera and barcode decoder configuration
#[derive(Debug, Clone, Deserialize)]
pub struct ScannerConfig {
    /// V4L2 device of the rear-facing camera
    #[serde(default = "default_device")]
    pub device: String,
    /// Capture width in pixels
    #[serde(default = "default_width")]
    pub width: u32,
    /// Capture height in pixels
    #[serde(default = "default_height")]
    pub height: u32,
    /// Decode attempts per second
    #[serde(default = "default_fps")]
    pub fps: u32,
    /// Width of the centred scan box
    #[serde(default = "default_scan_box_width")]
    pub scan_box_width: u32,
    /// Height of the centred scan box
    #[serde(default = "default_scan_box_height")]
    pub scan_box_height: u32,
    /// Seconds to wait for the camera pipeline to start
    #[serde(default = "default_start_timeout_secs")]
    pub start_timeout_secs: u64,
    /// Capacity of the decode event channel
    #[serde(default = "default_event_buffer")]
    pub event_buffer: usize,
}

/// Still capture configuration
#[derive(Debug, Clone, Deserialize)]
pub struct CaptureConfig {
    /// JPEG quality (1-100) of the captured still
    #[serde(default = "default_jpeg_quality")]
    pub jpeg_quality: u8,
}

/// Compression limits applied before upload
#[derive(Debug, Clone, Deserialize)]
pub struct CompressionConfig {
    /// Target ceiling for the uploaded image in bytes
    #[serde(default = "default_max_size_bytes")]
    pub max_size_bytes: usize,
    /// Longest edge of the uploaded image in pixels
    #[serde(default = "default_max_dimension")]
    pub max_dimension: u32,
    /// First JPEG quality tried
    #[serde(default = "default_initial_quality")]
    pub initial_quality: u8,
    /// Lowest JPEG quality before the image is scaled down instead
    #[serde(default = "default_min_quality")]
    pub min_quality: u8,
    /// Quality decrement per iteration
    #[serde(default = "default_quality_step")]
    pub quality_step: u8,
    /// Maximum number of encode attempts
    #[serde(default = "default_max_iterations")]
    pub max_iterations: u32,
}

/// Operator notification configuration
#[derive(Debug, Clone, Deserialize)]
pub struct NotificationConfig {
    /// How long a notification stays visible, in milliseconds
    #[serde(default = "default_display_ms")]
    pub display_ms: u64,
    /// Maximum number of notifications retained
    #[serde(default = "default_notification_capacity")]
    pub capacity: usize,
}

/// Operator API configuration
#[derive(Debug, Clone, Deserialize)]
pub struct ApiConfig {
    /// API listen address
    #[serde(default = "default_api_host")]
    pub host: String,
    /// API listen port
    #[serde(default = "default_api_port")]
    pub port: u16,
    /// Enable CORS
    #[serde(default = "default_true")]
    pub cors_enabled: bool,
    /// Allowed CORS origins
    #[serde(default)]
    pub cors_origins: Vec<String>,
}

// Default value functions
fn default_service_name() -> String {
    "sscan-intake".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "json".to_string()
}

fn default_metrics_port() -> u16 {
    9090
}

fn default_products_table() -> String {
    "products".to_string()
}

fn default_image_bucket() -> String {
    "product_images".to_string()
}

fn default_request_timeout_secs() -> u64 {
    30
}

fn default_device() -> String {
    "/dev/video0".to_string()
}

fn default_width() -> u32 {
    1280
}

fn default_height() -> u32 {
    720
}

fn default_fps() -> u32 {
    10
}

fn default_scan_box_width() -> u32 {
    250
}

fn default_scan_box_height() -> u32 {
    150
}

fn default_start_timeout_secs() -> u64 {
    10
}

fn default_event_buffer() -> usize {
    16
}

fn default_jpeg_quality() -> u8 {
    95
}

fn default_max_size_bytes() -> usize {
    1024 * 1024 // 1MB
}

fn default_max_dimension() -> u32 {
    1920
}

fn default_initial_quality() -> u8 {
    90
}

fn default_min_quality() -> u8 {
    40
}

fn default_quality_step() -> u8 {
    10
}

fn default_max_iterations() -> u32 {
    10
}

fn default_display_ms() -> u64 {
    4000
}

fn default_notification_capacity() -> usize {
    20
}

fn default_api_host() -> String {
    "0.0.0.0".to_string()
}

fn default_api_port() -> u16 {
    8080
}

fn default_true() -> bool {
    true
}

impl Config {
    /// Load configuration from config files and environment variables.
    ///
    /// Later sources override earlier ones:
    /// 1. `config/intake.{toml,yaml,json}`
    /// 2. `/etc/sscan/intake.{toml,yaml,json}`
    /// 3. Environment variables, e.g. `SSCAN__SUPABASE__URL`
    pub fn load() -> Result<Self, ConfigLoadError> {
        let config = config::Config::builder()
            .add_source(config::File::with_name("config/intake").required(false))
            .add_source(config::File::with_name("/etc/sscan/intake").required(false))
            // SSCAN__SUPABASE__ANON_KEY -> supabase.anon_key
            .add_source(
                config::Environment::with_prefix("SSCAN")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        let config: Self = config.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), ConfigValidationError> {
        if self.supabase.url.trim().is_empty() {
            return Err(ConfigValidationError::MissingField("supabase.url".to_string()));
        }
        if !self.supabase.url.starts_with("http://") && !self.supabase.url.starts_with("https://")
        {
            return Err(ConfigValidationError::InvalidValue {
                field: "supabase.url".to_string(),
                message: "URL must start with http:// or https://".to_string(),
            });
        }
        if self.supabase.anon_key.trim().is_empty() {
            return Err(ConfigValidationError::MissingField(
                "supabase.anon_key".to_string(),
            ));
        }

        if self.scanner.width == 0 || self.scanner.height == 0 || self.scanner.fps == 0 {
            return Err(ConfigValidationError::InvalidValue {
                field: "scanner.width/height/fps".to_string(),
                message: "Must be greater than 0".to_string(),
            });
        }
        if self.scanner.scan_box_width > self.scanner.width
            || self.scanner.scan_box_height > self.scanner.height
        {
            return Err(ConfigValidationError::InvalidValue {
                field: "scanner.scan_box".to_string(),
                message: "Scan box must fit inside the capture size".to_string(),
            });
        }

        if !(1..=100).contains(&self.capture.jpeg_quality) {
            return Err(ConfigValidationError::InvalidValue {
                field: "capture.jpeg_quality".to_string(),
                message: "Quality must be between 1 and 100".to_string(),
            });
        }

        let c = &self.compression;
        if c.max_size_bytes == 0 || c.max_dimension == 0 {
            return Err(ConfigValidationError::InvalidValue {
                field: "compression.max_size_bytes/max_dimension".to_string(),
                message: "Limits must be greater than 0".to_string(),
            });
        }
        if c.min_quality == 0 || c.min_quality > c.initial_quality || c.initial_quality > 100 {
            return Err(ConfigValidationError::InvalidValue {
                field: "compression.quality".to_string(),
                message: "Expected 1 <= min_quality <= initial_quality <= 100".to_string(),
            });
        }

        Ok(())
    }
}

impl SupabaseConfig {
    /// Get request timeout as Duration
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

impl ScannerConfig {
    /// Get pipeline start timeout as Duration
    pub fn start_timeout(&self) -> Duration {
        Duration::from_secs(self.start_timeout_secs)
    }
}

impl NotificationConfig {
    /// Get notification display duration
    pub fn display_duration(&self) -> Duration {
        Duration::from_millis(self.display_ms)
    }
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            name: default_service_name(),
            log_level: default_log_level(),
            log_format: default_log_format(),
            metrics_port: default_metrics_port(),
        }
    }
}

impl Default for ScannerConfig {
    fn default() -> Self {
        Self {
            device: default_device(),
            width: default_width(),
            height: default_height(),
            fps: default_fps(),
            scan_box_width: default_scan_box_width(),
            scan_box_height: default_scan_box_height(),
            start_timeout_secs: default_start_timeout_secs(),
            event_buffer: default_event_buffer(),
        }
    }
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            jpeg_quality: default_jpeg_quality(),
        }
    }
}

impl Default for CompressionConfig {
    fn default() -> Self {
        Self {
            max_size_bytes: default_max_size_bytes(),
            max_dimension: default_max_dimension(),
            initial_quality: default_initial_quality(),
            min_quality: default_min_quality(),
            quality_step: default_quality_step(),
            max_iterations: default_max_iterations(),
        }
    }
}

impl Default for NotificationConfig {
    fn default() -> Self {
        Self {
            display_ms: default_display_ms(),
            capacity: default_notification_capacity(),
        }
    }
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            host: default_api_host(),
            port: default_api_port(),
            cors_enabled: true,
            cors_origins: Vec::new(),
        }
    }
}

/// Errors while reading configuration sources.
#[derive(Debug, thiserror::Error)]
pub enum ConfigLoadError {
    #[error("Failed to read configuration: {0}")]
    Source(#[from] config::ConfigError),

    #[error(transparent)]
    Invalid(#[from] ConfigValidationError),
}

/// Configuration validation errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigValidationError {
    #[error("Missing required field: {0}")]
    MissingField(String),

    #[error("Invalid value for {field}: {message}")]
    InvalidValue { field: String, message: String },
}
