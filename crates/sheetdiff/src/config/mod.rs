pub mod loader;
pub mod schema;

pub use loader::{load_config, load_config_from_str, resolve_model_api_key};
pub use schema::{
    AlignmentConfig, Config, ModelConfig, OverlayConfig, PagesConfig, PipelineMode, RetryConfig,
    StorageConfig, TransformModel, WorkersConfig,
};
