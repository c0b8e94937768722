use std::path::Path;

use secrecy::SecretString;

use crate::config::schema::{Config, ModelConfig, TransformModel};
use crate::error::ConfigError;
use crate::secrets::resolve_secret_optional;

const SCHEMA_JSON: &str = include_str!("../../../../schema/config-v1.json");

pub fn load_config<P: AsRef<Path>>(path: P) -> Result<Config, ConfigError> {
    let path = path.as_ref();
    let content = std::fs::read_to_string(path).map_err(|e| ConfigError::ReadFile {
        path: path.to_path_buf(),
        source: e,
    })?;

    load_config_from_str(&content)
}

pub fn load_config_from_str(content: &str) -> Result<Config, ConfigError> {
    let json_value: serde_json::Value = serde_json::from_str(content)?;

    validate_schema(&json_value)?;

    let config: Config = serde_json::from_value(json_value)?;

    validate_config(&config)?;

    Ok(config)
}

/// Resolves the hosted model API key from its configured source, if any.
pub fn resolve_model_api_key(model: &ModelConfig) -> Result<Option<SecretString>, ConfigError> {
    Ok(resolve_secret_optional(
        model.api_key.as_deref(),
        model.api_key_file.as_deref(),
        model.api_key_env_var.as_deref(),
    )?)
}

fn validate_schema(json_value: &serde_json::Value) -> Result<(), ConfigError> {
    let schema: serde_json::Value =
        serde_json::from_str(SCHEMA_JSON).map_err(|e| ConfigError::Validation {
            message: format!("Invalid embedded schema JSON: {}", e),
        })?;

    let validator = jsonschema::validator_for(&schema).map_err(|e| ConfigError::Validation {
        message: format!("Failed to compile JSON schema: {}", e),
    })?;

    let error_messages: Vec<String> = validator
        .iter_errors(json_value)
        .map(|e| format!("{} at {}", e, e.instance_path()))
        .collect();
    if !error_messages.is_empty() {
        return Err(ConfigError::SchemaValidation {
            errors: error_messages.join("; "),
        });
    }

    Ok(())
}

fn invalid(field: &str, reason: impl Into<String>) -> ConfigError {
    ConfigError::InvalidValue {
        field: field.to_string(),
        reason: reason.into(),
    }
}

fn validate_config(config: &Config) -> Result<(), ConfigError> {
    if config.version != "1.0" {
        return Err(ConfigError::Validation {
            message: format!("Unsupported config version: {}", config.version),
        });
    }

    let alignment = &config.alignment;
    if alignment.scale_min <= 0.0 || alignment.scale_min > alignment.scale_max {
        return Err(invalid(
            "alignment.scale_min",
            format!(
                "scale range [{}, {}] is empty or non-positive",
                alignment.scale_min, alignment.scale_max
            ),
        ));
    }
    if alignment.rotation_deg_min > alignment.rotation_deg_max {
        return Err(invalid(
            "alignment.rotation_deg_min",
            "must not exceed rotation_deg_max",
        ));
    }
    if !(0.0..0.5).contains(&alignment.border_margin_ratio) {
        return Err(invalid("alignment.border_margin_ratio", "must be in [0, 0.5)"));
    }
    if !(alignment.ratio_threshold > 0.0 && alignment.ratio_threshold <= 1.0) {
        return Err(invalid("alignment.ratio_threshold", "must be in (0, 1]"));
    }
    if alignment.pyramid_scale <= 1.0 {
        return Err(invalid("alignment.pyramid_scale", "must be greater than 1"));
    }
    if alignment.model == TransformModel::Affine && alignment.max_shear < 0.0 {
        return Err(invalid("alignment.max_shear", "must not be negative"));
    }

    let overlay = &config.overlay;
    if overlay.canny_low > overlay.canny_high {
        return Err(invalid("overlay.canny_low", "must not exceed canny_high"));
    }
    if overlay.max_dimension == 0 {
        return Err(invalid("overlay.max_dimension", "must be positive"));
    }

    let workers = &config.workers;
    for (field, value) in [
        ("workers.ocr_concurrency", workers.ocr_concurrency),
        ("workers.diff_concurrency", workers.diff_concurrency),
        ("workers.summary_concurrency", workers.summary_concurrency),
    ] {
        if value == 0 {
            return Err(invalid(field, "must be at least 1"));
        }
    }

    if config.retry.base_delay_ms > config.retry.max_delay_ms {
        return Err(invalid("retry.base_delay_ms", "must not exceed max_delay_ms"));
    }

    if let Some(model) = &config.model {
        if !model.endpoint.starts_with("http://") && !model.endpoint.starts_with("https://") {
            return Err(invalid("model.endpoint", "must be an http(s) URL"));
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::schema::PipelineMode;
    use secrecy::ExposeSecret;

    #[test]
    fn test_load_valid_config() {
        let config_json = r#"
        {
            "version": "1.0",
            "mode": "legacy",
            "storage": {"root": "/var/lib/sheetdiff/objects", "database": "/var/lib/sheetdiff/db.sqlite"},
            "alignment": {"model": "affine", "max_shear": 0.05},
            "overlay": {"overlap_buffer_px": 3},
            "workers": {"ocr_concurrency": 4, "diff_concurrency": 1, "summary_concurrency": 2},
            "retry": {"max_retries": 5, "base_delay_ms": 500, "max_delay_ms": 8000}
        }
        "#;

        let config = load_config_from_str(config_json).unwrap();
        assert_eq!(config.mode, PipelineMode::Legacy);
        assert_eq!(config.storage.root, "/var/lib/sheetdiff/objects");
        assert_eq!(config.alignment.model, TransformModel::Affine);
        assert_eq!(config.overlay.overlap_buffer_px, 3);
        assert_eq!(config.retry.max_retries, 5);
    }

    #[test]
    fn test_schema_rejects_unknown_mode() {
        let result = load_config_from_str(r#"{"version": "1.0", "mode": "batch"}"#);
        assert!(matches!(result, Err(ConfigError::SchemaValidation { .. })));
    }

    #[test]
    fn test_schema_requires_version() {
        let result = load_config_from_str(r#"{"mode": "legacy"}"#);
        assert!(matches!(result, Err(ConfigError::SchemaValidation { .. })));
    }

    #[test]
    fn test_unsupported_version() {
        let result = load_config_from_str(r#"{"version": "2.0"}"#);
        assert!(matches!(result, Err(ConfigError::Validation { .. })));
    }

    #[test]
    fn test_inverted_scale_range_is_rejected() {
        let result = load_config_from_str(
            r#"{"version": "1.0", "alignment": {"scale_min": 1.2, "scale_max": 1.1}}"#,
        );
        match result {
            Err(ConfigError::InvalidValue { field, .. }) => {
                assert_eq!(field, "alignment.scale_min")
            }
            other => panic!("expected InvalidValue, got {:?}", other),
        }
    }

    #[test]
    fn test_retry_delays_must_be_ordered() {
        let result = load_config_from_str(
            r#"{"version": "1.0", "retry": {"base_delay_ms": 9000, "max_delay_ms": 1000}}"#,
        );
        assert!(matches!(result, Err(ConfigError::InvalidValue { .. })));
    }

    #[test]
    fn test_model_key_resolution() {
        let config = load_config_from_str(
            r#"{
                "version": "1.0",
                "model": {"endpoint": "https://api.example.com/v1", "model": "vision-large", "api_key": "sk-test"}
            }"#,
        )
        .unwrap();
        let model = config.model.unwrap();
        let key = resolve_model_api_key(&model).unwrap().unwrap();
        assert_eq!(key.expose_secret(), "sk-test");
    }

    #[test]
    fn test_model_endpoint_must_be_http() {
        let result = load_config_from_str(
            r#"{"version": "1.0", "model": {"endpoint": "ftp://host", "model": "m"}}"#,
        );
        assert!(matches!(result, Err(ConfigError::InvalidValue { .. })));
    }
}
