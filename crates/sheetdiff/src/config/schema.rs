use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub version: String,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub mode: PipelineMode,
    #[serde(default)]
    pub alignment: AlignmentConfig,
    #[serde(default)]
    pub overlay: OverlayConfig,
    #[serde(default)]
    pub pages: PagesConfig,
    #[serde(default)]
    pub workers: WorkersConfig,
    #[serde(default)]
    pub retry: RetryConfig,
    #[serde(default)]
    pub model: Option<ModelConfig>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            version: "1.0".to_string(),
            storage: StorageConfig::default(),
            mode: PipelineMode::default(),
            alignment: AlignmentConfig::default(),
            overlay: OverlayConfig::default(),
            pages: PagesConfig::default(),
            workers: WorkersConfig::default(),
            retry: RetryConfig::default(),
            model: None,
        }
    }
}

/// Whole-document stages (`legacy`) or one stage row per page (`streaming`).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PipelineMode {
    Legacy,
    #[default]
    Streaming,
}

impl PipelineMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Legacy => "legacy",
            Self::Streaming => "streaming",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "legacy" => Some(Self::Legacy),
            "streaming" => Some(Self::Streaming),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Root directory of the filesystem object store.
    #[serde(default = "default_object_root")]
    pub root: String,
    /// SQLite database file.
    #[serde(default = "default_database_path")]
    pub database: String,
}

fn data_dir() -> std::path::PathBuf {
    dirs::data_local_dir()
        .or_else(dirs::home_dir)
        .unwrap_or_else(std::env::temp_dir)
        .join("sheetdiff")
}

fn default_object_root() -> String {
    data_dir().join("objects").to_string_lossy().to_string()
}

fn default_database_path() -> String {
    data_dir().join("sheetdiff.db").to_string_lossy().to_string()
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            root: default_object_root(),
            database: default_database_path(),
        }
    }
}

/// Transform family fitted by the aligner.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransformModel {
    #[default]
    Similarity,
    Affine,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AlignmentConfig {
    pub model: TransformModel,
    /// Fraction of width/height ignored at every edge (title blocks, frames).
    pub border_margin_ratio: f32,
    pub max_features: usize,
    pub fast_threshold: u8,
    pub pyramid_levels: u32,
    pub pyramid_scale: f32,
    /// Longest side of the image used for feature detection.
    pub working_max_dimension: u32,
    pub ratio_threshold: f32,
    pub ransac_iterations: u32,
    pub ransac_reprojection_px: f32,
    pub ransac_seed: u64,
    pub scale_min: f64,
    pub scale_max: f64,
    pub rotation_deg_min: f64,
    pub rotation_deg_max: f64,
    /// Affine only.
    pub max_shear: f64,
}

impl Default for AlignmentConfig {
    fn default() -> Self {
        Self {
            model: TransformModel::Similarity,
            border_margin_ratio: 0.03,
            max_features: 3000,
            fast_threshold: 20,
            pyramid_levels: 4,
            pyramid_scale: 1.25,
            working_max_dimension: 1600,
            ratio_threshold: 0.75,
            ransac_iterations: 2000,
            ransac_reprojection_px: 3.0,
            ransac_seed: 0x5EED,
            scale_min: 0.9,
            scale_max: 1.1,
            rotation_deg_min: -5.0,
            rotation_deg_max: 5.0,
            max_shear: 0.02,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OverlayConfig {
    pub mask_gamma: f32,
    pub alpha_gamma: f32,
    pub overlap_buffer_px: u32,
    /// Mask intensity below which a pixel counts as paper.
    pub ink_threshold: f32,
    pub overlap_gray: u8,
    pub canny_low: f32,
    pub canny_high: f32,
    pub edge_threshold: f32,
    pub edge_alpha: f32,
    /// Luminance cut used by the binary fallback.
    pub binary_threshold: u8,
    pub min_change_area: u32,
    /// Safety ceiling on either output dimension.
    pub max_dimension: u32,
}

impl Default for OverlayConfig {
    fn default() -> Self {
        Self {
            mask_gamma: 1.0,
            alpha_gamma: 1.0,
            overlap_buffer_px: 2,
            ink_threshold: 0.25,
            overlap_gray: 160,
            canny_low: 50.0,
            canny_high: 120.0,
            edge_threshold: 0.3,
            edge_alpha: 0.85,
            binary_threshold: 128,
            min_change_area: 16,
            max_dimension: 10_000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PagesConfig {
    #[serde(default = "default_dpi")]
    pub dpi: u32,
}

fn default_dpi() -> u32 {
    150
}

impl Default for PagesConfig {
    fn default() -> Self {
        Self { dpi: default_dpi() }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkersConfig {
    #[serde(default = "default_io_concurrency")]
    pub ocr_concurrency: usize,
    #[serde(default = "default_diff_concurrency")]
    pub diff_concurrency: usize,
    #[serde(default = "default_io_concurrency")]
    pub summary_concurrency: usize,
}

fn default_io_concurrency() -> usize {
    num_cpus::get().clamp(2, 8)
}

fn default_diff_concurrency() -> usize {
    1
}

impl Default for WorkersConfig {
    fn default() -> Self {
        Self {
            ocr_concurrency: default_io_concurrency(),
            diff_concurrency: default_diff_concurrency(),
            summary_concurrency: default_io_concurrency(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
}

fn default_max_retries() -> u32 {
    3
}

fn default_base_delay_ms() -> u64 {
    2_000
}

fn default_max_delay_ms() -> u64 {
    60_000
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            base_delay_ms: default_base_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
        }
    }
}

/// Hosted multimodal model used for OCR and summaries.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelConfig {
    /// Base URL of an OpenAI-compatible API, e.g. `https://api.openai.com/v1`.
    pub endpoint: String,
    pub model: String,
    #[serde(default)]
    pub api_key: Option<String>,
    #[serde(default)]
    pub api_key_file: Option<String>,
    #[serde(default)]
    pub api_key_env_var: Option<String>,
    #[serde(default = "default_model_timeout")]
    pub timeout_secs: u64,
}

fn default_model_timeout() -> u64 {
    120
}
