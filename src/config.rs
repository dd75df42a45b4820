use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::enrichment::{ActiveEnrichers, EnricherKind};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub enrichment: EnrichmentConfig,

    #[serde(default)]
    pub faces: FacesConfig,

    #[serde(default)]
    pub retry: RetryConfig,

    #[serde(default)]
    pub scanner: ScannerConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EnrichmentConfig {
    /// Enrichers switched on for this deployment.
    #[serde(default = "default_enabled_enrichers")]
    pub enabled: Vec<EnricherKind>,

    /// How many photos may be enriched at the same time.
    #[serde(default = "default_max_parallel_photos")]
    pub max_parallel_photos: usize,

    /// Log every enricher's duration at info level instead of debug.
    #[serde(default)]
    pub log_timings: bool,

    #[serde(default = "default_preview_max_side")]
    pub preview_max_side: u32,

    #[serde(default = "default_thumbnail_size")]
    pub thumbnail_size: u32,
}

fn default_enabled_enrichers() -> Vec<EnricherKind> {
    EnricherKind::ALL.to_vec()
}

fn default_max_parallel_photos() -> usize {
    4
}

fn default_preview_max_side() -> u32 {
    2048
}

fn default_thumbnail_size() -> u32 {
    256
}

impl Default for EnrichmentConfig {
    fn default() -> Self {
        Self {
            enabled: default_enabled_enrichers(),
            max_parallel_photos: default_max_parallel_photos(),
            log_timings: false,
            preview_max_side: default_preview_max_side(),
            thumbnail_size: default_thumbnail_size(),
        }
    }
}

impl ActiveEnrichers for EnrichmentConfig {
    fn active_kinds(&self) -> BTreeSet<EnricherKind> {
        self.enabled.iter().copied().collect()
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Default, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum FaceProviderKind {
    Azure,
    Aws,
    #[default]
    Local,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FacesConfig {
    #[serde(default)]
    pub provider: FaceProviderKind,

    /// Person group / collection that holds this deployment's users.
    #[serde(default = "default_collection_id")]
    pub collection_id: String,

    /// Minimum confidence for a candidate to be returned by identify.
    #[serde(default = "default_match_threshold")]
    pub match_threshold: f64,

    #[serde(default = "default_max_candidates")]
    pub max_candidates: usize,

    /// Faces indexed concurrently during reconciliation.
    #[serde(default = "default_max_parallelism")]
    pub max_parallelism: usize,

    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,

    #[serde(default)]
    pub azure: AzureConfig,

    #[serde(default)]
    pub aws: AwsConfig,

    #[serde(default)]
    pub local: LocalFaceConfig,
}

fn default_collection_id() -> String {
    "pictor-persons".to_string()
}

fn default_match_threshold() -> f64 {
    0.6
}

fn default_max_candidates() -> usize {
    10
}

fn default_max_parallelism() -> usize {
    4
}

fn default_request_timeout_secs() -> u64 {
    30
}

impl FacesConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

impl Default for FacesConfig {
    fn default() -> Self {
        Self {
            provider: FaceProviderKind::default(),
            collection_id: default_collection_id(),
            match_threshold: default_match_threshold(),
            max_candidates: default_max_candidates(),
            max_parallelism: default_max_parallelism(),
            request_timeout_secs: default_request_timeout_secs(),
            azure: AzureConfig::default(),
            aws: AwsConfig::default(),
            local: LocalFaceConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AzureConfig {
    #[serde(default = "default_azure_endpoint")]
    pub endpoint: String,

    #[serde(default)]
    pub api_key: Option<String>,

    #[serde(default = "default_recognition_model")]
    pub recognition_model: String,

    #[serde(default = "default_detection_model")]
    pub detection_model: String,

    /// How long to wait for person-group training to finish.
    #[serde(default = "default_train_timeout_secs")]
    pub train_timeout_secs: u64,
}

fn default_azure_endpoint() -> String {
    "https://westeurope.api.cognitive.microsoft.com".to_string()
}

fn default_recognition_model() -> String {
    "recognition_04".to_string()
}

fn default_detection_model() -> String {
    "detection_03".to_string()
}

fn default_train_timeout_secs() -> u64 {
    120
}

impl Default for AzureConfig {
    fn default() -> Self {
        Self {
            endpoint: default_azure_endpoint(),
            api_key: None,
            recognition_model: default_recognition_model(),
            detection_model: default_detection_model(),
            train_timeout_secs: default_train_timeout_secs(),
        }
    }
}

/// Rekognition settings. Keys left unset here are taken from the usual
/// `AWS_*` environment variables.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AwsConfig {
    #[serde(default = "default_aws_region")]
    pub region: String,

    /// Overrides `https://rekognition.<region>.amazonaws.com`.
    #[serde(default)]
    pub endpoint: Option<String>,

    #[serde(default)]
    pub access_key_id: Option<String>,

    #[serde(default)]
    pub secret_access_key: Option<String>,

    #[serde(default)]
    pub session_token: Option<String>,

    /// `NONE`, `AUTO`, `LOW`, `MEDIUM` or `HIGH`.
    #[serde(default = "default_quality_filter")]
    pub quality_filter: String,
}

fn default_aws_region() -> String {
    "us-east-1".to_string()
}

fn default_quality_filter() -> String {
    "AUTO".to_string()
}

impl Default for AwsConfig {
    fn default() -> Self {
        Self {
            region: default_aws_region(),
            endpoint: None,
            access_key_id: None,
            secret_access_key: None,
            session_token: None,
            quality_filter: default_quality_filter(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LocalFaceConfig {
    /// Base URL of the InsightFace embedding service.
    #[serde(default = "default_local_endpoint")]
    pub endpoint: String,

    /// Where the local collection is snapshotted. In memory only when unset.
    #[serde(default)]
    pub collection_path: Option<PathBuf>,
}

fn default_local_endpoint() -> String {
    "http://127.0.0.1:5555".to_string()
}

impl Default for LocalFaceConfig {
    fn default() -> Self {
        Self {
            endpoint: default_local_endpoint(),
            collection_path: None,
        }
    }
}

/// Bounded retry for provider calls that fail transiently.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    #[serde(default = "default_initial_backoff_ms")]
    pub initial_backoff_ms: u64,

    #[serde(default = "default_max_backoff_ms")]
    pub max_backoff_ms: u64,
}

fn default_max_attempts() -> u32 {
    3
}

fn default_initial_backoff_ms() -> u64 {
    250
}

fn default_max_backoff_ms() -> u64 {
    5000
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            initial_backoff_ms: default_initial_backoff_ms(),
            max_backoff_ms: default_max_backoff_ms(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScannerConfig {
    #[serde(default = "default_image_extensions")]
    pub image_extensions: Vec<String>,
}

fn default_image_extensions() -> Vec<String> {
    vec![
        "jpg".to_string(),
        "jpeg".to_string(),
        "png".to_string(),
        "gif".to_string(),
        "webp".to_string(),
        "tif".to_string(),
        "tiff".to_string(),
        "bmp".to_string(),
    ]
}

impl Default for ScannerConfig {
    fn default() -> Self {
        Self {
            image_extensions: default_image_extensions(),
        }
    }
}

impl Config {
    /// Load from the default location, writing a default file on first run.
    pub fn load() -> Result<Self> {
        let config_path = Self::config_path();

        if config_path.exists() {
            Self::load_from(&config_path)
        } else {
            let config = Config::default();
            config.save_to(&config_path)?;
            Ok(config)
        }
    }

    pub fn load_from(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)?;
        Ok(config)
    }

    pub fn save(&self) -> Result<()> {
        self.save_to(&Self::config_path())
    }

    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let content = toml::to_string_pretty(self)?;
        std::fs::write(path, content)?;

        Ok(())
    }

    pub fn config_dir() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("pictor")
    }

    fn config_path() -> PathBuf {
        std::env::var_os("PICTOR_CONFIG")
            .map(PathBuf::from)
            .unwrap_or_else(|| Self::config_dir().join("config.toml"))
    }
}
