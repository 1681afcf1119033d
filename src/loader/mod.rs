pub mod artifact;
pub mod migrate;
pub mod resolve;

use crate::model::{config as model_config, BuildError, ImageClassifierModel};
use artifact::{Artifact, ArtifactError};
use burn::tensor::backend::Backend;
use migrate::{MigrationError, Strategy, STRATEGIES};
use std::fmt;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, info};

/// Why a single strategy could not produce a network.
#[derive(Debug, Error)]
pub enum AttemptError {
    #[error(transparent)]
    Migrate(#[from] MigrationError),
    #[error(transparent)]
    Decode(#[from] model_config::DecodeError),
    #[error(transparent)]
    Build(#[from] BuildError),
}

/// A failed strategy and its error.
#[derive(Debug)]
pub struct Attempt {
    pub strategy: &'static str,
    pub error: AttemptError,
}

impl fmt::Display for Attempt {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.strategy, self.error)
    }
}

#[derive(Debug, Error)]
pub enum LoadError {
    #[error(transparent)]
    Artifact(#[from] ArtifactError),
    #[error(
        "failed to load model '{}': tried {}; last error: {}",
        .path.display(),
        strategy_names(.attempts),
        last_error(.attempts)
    )]
    Exhausted {
        path: PathBuf,
        attempts: Vec<Attempt>,
    },
}

fn strategy_names(attempts: &[Attempt]) -> String {
    attempts
        .iter()
        .map(|a| a.strategy)
        .collect::<Vec<_>>()
        .join(", ")
}

fn last_error(attempts: &[Attempt]) -> String {
    attempts
        .last()
        .map(|a| a.error.to_string())
        .unwrap_or_else(|| "no strategy configured".to_string())
}

/// A network together with how it was obtained.
pub struct LoadedModel<B: Backend> {
    pub model: ImageClassifierModel<B>,
    /// Name of the strategy that produced the network.
    pub strategy: &'static str,
    /// Failures of the strategies tried before it.
    pub attempts: Vec<Attempt>,
    pub keras_version: Option<String>,
}

/// Loads model artifacts, trying each migration strategy in order.
pub struct ModelLoader {
    strategies: Vec<Strategy>,
}

impl Default for ModelLoader {
    fn default() -> Self {
        Self {
            strategies: STRATEGIES.to_vec(),
        }
    }
}

impl ModelLoader {
    pub fn new() -> Self {
        Self::default()
    }

    /// Use a custom strategy list instead of [`STRATEGIES`].
    pub fn with_strategies(strategies: Vec<Strategy>) -> Self {
        Self { strategies }
    }

    pub fn load<B: Backend, P: AsRef<Path>>(
        &self,
        path: P,
        device: &B::Device,
    ) -> Result<LoadedModel<B>, LoadError> {
        let path = path.as_ref();
        info!(path = %path.display(), "Loading model artifact");

        let artifact = Artifact::load(path)?;
        debug!(
            tensors = artifact.tensors.len(),
            keras_version = artifact.keras_version.as_deref().unwrap_or("unknown"),
            "Artifact read"
        );

        self.load_artifact(path, &artifact, device)
    }

    /// Run the strategy chain over an artifact already in memory.
    pub fn load_artifact<B: Backend>(
        &self,
        path: &Path,
        artifact: &Artifact,
        device: &B::Device,
    ) -> Result<LoadedModel<B>, LoadError> {
        let mut attempts = Vec::new();

        for strategy in &self.strategies {
            match Self::attempt(strategy, artifact, device) {
                Ok(model) => {
                    info!(
                        path = %path.display(),
                        strategy = strategy.name,
                        layers = model.num_layers(),
                        model = model.name().unwrap_or("unnamed"),
                        "Model loaded"
                    );
                    return Ok(LoadedModel {
                        model,
                        strategy: strategy.name,
                        attempts,
                        keras_version: artifact.keras_version.clone(),
                    });
                }
                Err(error) => {
                    debug!(strategy = strategy.name, error = %error, "Load strategy failed");
                    attempts.push(Attempt {
                        strategy: strategy.name,
                        error,
                    });
                }
            }
        }

        Err(LoadError::Exhausted {
            path: path.to_path_buf(),
            attempts,
        })
    }

    fn attempt<B: Backend>(
        strategy: &Strategy,
        artifact: &Artifact,
        device: &B::Device,
    ) -> Result<ImageClassifierModel<B>, AttemptError> {
        let migrated = (strategy.migrate)(artifact.model_config.clone())?;
        let config = model_config::decode(&migrated)?;
        Ok(ImageClassifierModel::from_config(&config, artifact, device)?)
    }
}
