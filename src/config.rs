use config::{Config, File};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use thiserror::Error;

pub const DEFAULT_MODEL_FILE: &str = "trained_model.safetensors";
pub const DEFAULT_CLASS_FILE: &str = "class_names.txt";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to build configuration: {0}")]
    Build(#[from] config::ConfigError),
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    /// Model artifact to load
    pub model_file: PathBuf,
    /// Label list, one class per line
    pub class_file: PathBuf,
    /// Extension scanned for when `model_file` is missing
    pub model_extension: String,
    /// Extension scanned for when `class_file` is missing
    pub class_extension: String,
    /// Whether to scan the working directory for substitutes at all
    pub scan_fallback: bool,
    pub image_width: u32,
    pub image_height: u32,
    /// Treat non-probability model output as an error
    pub strict_probabilities: bool,
}

/// Values that take precedence over everything else.
#[derive(Debug, Clone, Default)]
pub struct Overrides {
    pub model_file: Option<PathBuf>,
    pub class_file: Option<PathBuf>,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            model_file: PathBuf::from(DEFAULT_MODEL_FILE),
            class_file: PathBuf::from(DEFAULT_CLASS_FILE),
            model_extension: "safetensors".to_string(),
            class_extension: "txt".to_string(),
            scan_fallback: true,
            image_width: 224,
            image_height: 224,
            strict_probabilities: false,
        }
    }
}

impl AppConfig {
    /// Load configuration, reading `path` (format chosen by extension) if
    /// given.
    pub fn load(path: Option<&Path>, overrides: &Overrides) -> Result<Self, ConfigError> {
        let defaults = Self::default();
        let mut builder = Config::builder()
            .set_default("model_file", path_value(&defaults.model_file))?
            .set_default("class_file", path_value(&defaults.class_file))?
            .set_default("model_extension", defaults.model_extension)?
            .set_default("class_extension", defaults.class_extension)?
            .set_default("scan_fallback", defaults.scan_fallback)?
            .set_default("image_width", i64::from(defaults.image_width))?
            .set_default("image_height", i64::from(defaults.image_height))?
            .set_default("strict_probabilities", defaults.strict_probabilities)?;

        if let Some(path) = path {
            builder = builder.add_source(File::from(path));
        }

        let config: Self = builder
            .set_override_option("model_file", overrides.model_file.as_deref().map(path_value))?
            .set_override_option("class_file", overrides.class_file.as_deref().map(path_value))?
            .build()?
            .try_deserialize()?;

        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.image_width == 0 || self.image_height == 0 {
            return Err(ConfigError::Invalid(format!(
                "image size must be positive, got {}x{}",
                self.image_width, self.image_height
            )));
        }
        if self.model_extension.trim_start_matches('.').is_empty() {
            return Err(ConfigError::Invalid("model_extension is empty".to_string()));
        }
        if self.class_extension.trim_start_matches('.').is_empty() {
            return Err(ConfigError::Invalid("class_extension is empty".to_string()));
        }
        Ok(())
    }

    /// `(width, height)` images are resized to.
    pub fn target_size(&self) -> (u32, u32) {
        (self.image_width, self.image_height)
    }
}

fn path_value(path: &Path) -> String {
    path.to_string_lossy().into_owned()
}
