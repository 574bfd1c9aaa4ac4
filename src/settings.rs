//! Application configuration for the UI server.
//!
//! Sources, later ones winning: built-in defaults, `config/default.*`,
//! `config/local.*`, then `MUSICGEN__SECTION__KEY` environment variables.
//! Command-line flags override the result per run.

use std::path::PathBuf;

use candle_core::DType;
use serde::Deserialize;

use crate::config::ModelVariant;
use crate::manager::ManagerConfig;
use crate::pipeline::{GenerationParams, ModelSource};

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub logging: LoggingConfig,
    pub model: ModelSettings,
    pub generation: GenerationParams,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 8501,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    pub format: LogFormat,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: LogFormat::default(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Pretty,
    Json,
}

/// Weight precision.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Precision {
    #[default]
    F32,
    F16,
    Bf16,
}

impl Precision {
    pub fn dtype(self) -> DType {
        match self {
            Self::F32 => DType::F32,
            Self::F16 => DType::F16,
            Self::Bf16 => DType::BF16,
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct ModelSettings {
    pub variant: ModelVariant,
    pub repo: Option<String>,
    pub revision: Option<String>,
    pub local_dir: Option<PathBuf>,
    pub cuda_device: usize,
    pub force_cpu: bool,
    pub precision: Precision,
    /// Load at startup instead of on the first request.
    pub preload: bool,
}

impl ModelSettings {
    pub fn source(&self) -> ModelSource {
        ModelSource {
            variant: self.variant,
            repo: self.repo.clone(),
            revision: self.revision.clone(),
            local_dir: self.local_dir.clone(),
        }
    }
}

impl AppConfig {
    pub fn load() -> Result<Self, config::ConfigError> {
        Self::build(
            config::Config::builder()
                .add_source(config::File::with_name("config/default").required(false))
                .add_source(config::File::with_name("config/local").required(false))
                .add_source(
                    config::Environment::with_prefix("MUSICGEN")
                        .prefix_separator("__")
                        .separator("__")
                        .try_parsing(true),
                ),
        )
    }

    fn build(
        builder: config::ConfigBuilder<config::builder::DefaultState>,
    ) -> Result<Self, config::ConfigError> {
        builder.build()?.try_deserialize()
    }

    pub fn manager_config(&self) -> ManagerConfig {
        ManagerConfig {
            cuda_device: self.model.cuda_device,
            force_cpu: self.model.force_cpu,
            dtype: self.model.precision.dtype(),
            params: self.generation.clone(),
            ..ManagerConfig::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn from_toml(toml: &str) -> AppConfig {
        AppConfig::build(
            config::Config::builder()
                .add_source(config::File::from_str(toml, config::FileFormat::Toml)),
        )
        .unwrap()
    }

    #[test]
    fn test_defaults() {
        let config = from_toml("");
        assert_eq!(config.server.host, "127.0.0.1");
        assert_eq!(config.server.port, 8501);
        assert_eq!(config.logging.level, "info");
        assert_eq!(config.logging.format, LogFormat::Pretty);
        assert_eq!(config.model.variant, ModelVariant::Small);
        assert!(!config.model.preload);
        assert_eq!(config.generation, GenerationParams::default());
    }

    #[test]
    fn test_partial_overrides() {
        let config = from_toml(
            r#"
            [server]
            port = 9000

            [logging]
            format = "json"

            [model]
            variant = "medium"
            force_cpu = true
            precision = "bf16"

            [generation]
            duration_s = 15.0
            seed = 42
            "#,
        );
        assert_eq!(config.server.port, 9000);
        assert_eq!(config.server.host, "127.0.0.1");
        assert_eq!(config.logging.format, LogFormat::Json);
        assert_eq!(config.model.source().repo_id(), "facebook/musicgen-medium");

        let manager = config.manager_config();
        assert!(manager.force_cpu);
        assert_eq!(manager.dtype, DType::BF16);
        assert_eq!(manager.params.duration_s, 15.0);
        assert_eq!(manager.params.seed, Some(42));
        assert_eq!(manager.params.top_k, 250);
    }
}
