use crate::config::{AppConfig, Overrides};
use crate::data::{LabelList, Preprocessor};
use crate::inference::{Classifier, Outcome, Predictor};
use crate::loader::{resolve::resolve, ModelLoader};
use crate::output::to_json_line;
use anyhow::{Context, Result};
use burn::tensor::backend::Backend;
use clap::Parser;
use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use tracing::{info, warn};

pub const NO_IMAGE_PATH: &str = "No image path provided";

#[derive(Parser, Debug)]
#[command(
    name = "classify",
    version,
    about = "Classify one image with a trained model and print the result as JSON"
)]
pub struct Cli {
    /// Image to classify; anything after it is ignored
    #[arg(value_name = "IMAGE", trailing_var_arg = true, allow_hyphen_values = true)]
    pub image: Vec<OsString>,

    /// Configuration file (TOML, JSON or YAML)
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Model artifact
    #[arg(long, env = "MODEL_FILE")]
    pub model: Option<PathBuf>,

    /// Label list, one class per line
    #[arg(long, env = "CLASS_FILE")]
    pub labels: Option<PathBuf>,
}

impl Cli {
    /// The first positional argument, taken as is.
    pub fn image_path(&self) -> Option<&Path> {
        self.image.first().map(Path::new)
    }

    fn overrides(&self) -> Overrides {
        Overrides {
            model_file: self.model.clone(),
            class_file: self.labels.clone(),
        }
    }
}

/// Install the stderr log subscriber; stdout carries only the result.
pub fn init_tracing() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("image_classifier=info".parse()?),
        )
        .with_writer(std::io::stderr)
        .init();
    Ok(())
}

/// Parse the process arguments and classify on `device`.
pub fn run<B: Backend>(device: B::Device) -> Result<ExitCode> {
    run_with::<B>(Cli::parse(), device)
}

pub fn run_with<B: Backend>(cli: Cli, device: B::Device) -> Result<ExitCode> {
    let Some(image_path) = cli.image_path() else {
        println!("{}", to_json_line(&Outcome::error(NO_IMAGE_PATH))?);
        return Ok(ExitCode::FAILURE);
    };

    let config = AppConfig::load(cli.config.as_deref(), &cli.overrides())
        .context("Failed to load configuration")?;

    let model_path = locate(&config.model_file, &config.model_extension, config.scan_fallback);
    let class_path = locate(&config.class_file, &config.class_extension, config.scan_fallback);

    let loaded = ModelLoader::new()
        .load::<B, _>(&model_path, &device)
        .context("Failed to load model")?;
    let labels = LabelList::load(&class_path).context("Failed to load class names")?;

    let outputs = loaded.model.output_width();
    let preprocessor = Preprocessor::new(config.target_size());
    let (width, height) = preprocessor.target_size();
    let classifier = Classifier::new(loaded.model, labels)
        .with_preprocessor(preprocessor)
        .with_strict_probabilities(config.strict_probabilities);

    let classes = classifier.labels().len();
    info!(strategy = loaded.strategy, classes, width, height, "Classifier ready");
    if let Some(outputs) = outputs.filter(|&n| n != classes) {
        warn!(
            outputs,
            labels = classes,
            "Model output width does not match the label count"
        );
    }

    let outcome = classifier.analyze(image_path);
    println!("{}", to_json_line(&outcome)?);
    Ok(ExitCode::SUCCESS)
}

/// Resolve a configured input against the working directory, printing the
/// substitution notice when one happens.
fn locate(configured: &Path, extension: &str, scan: bool) -> PathBuf {
    if !scan {
        return configured.to_path_buf();
    }
    let resolved = resolve(configured, extension, Path::new("."));
    if let Some(notice) = resolved.notice {
        println!("{notice}");
    }
    resolved.path
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition_is_valid() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_image_path_is_optional() {
        let cli = Cli::try_parse_from(["classify"]).unwrap();
        assert!(cli.image_path().is_none());

        let cli = Cli::try_parse_from(["classify", "-c", "classify.toml", "leaf.jpg"]).unwrap();
        assert_eq!(cli.image_path(), Some(Path::new("leaf.jpg")));
        assert_eq!(cli.config, Some(PathBuf::from("classify.toml")));
    }

    #[test]
    fn test_first_positional_is_taken_verbatim() {
        let cli = Cli::try_parse_from(["classify", ""]).unwrap();
        assert_eq!(cli.image_path(), Some(Path::new("")));

        let cli = Cli::try_parse_from(["classify", "leaf.jpg", "extra", "--labels", "x"]).unwrap();
        assert_eq!(cli.image_path(), Some(Path::new("leaf.jpg")));
        assert!(cli.labels.is_none());

        let cli = Cli::try_parse_from(["classify", "-leaf.jpg"]).unwrap();
        assert_eq!(cli.image_path(), Some(Path::new("-leaf.jpg")));
    }

    #[test]
    fn test_explicit_paths_become_overrides() {
        let cli = Cli::try_parse_from([
            "classify",
            "--model",
            "m.safetensors",
            "--labels",
            "l.txt",
            "leaf.jpg",
        ])
        .unwrap();
        let overrides = cli.overrides();
        assert_eq!(overrides.model_file, Some(PathBuf::from("m.safetensors")));
        assert_eq!(overrides.class_file, Some(PathBuf::from("l.txt")));
    }

    #[test]
    fn test_missing_image_exits_before_loading() {
        let cli = Cli {
            image: Vec::new(),
            config: Some(PathBuf::from("no/such/config.toml")),
            model: None,
            labels: None,
        };
        // the bogus config file would fail if it were read
        assert!(run_with::<burn::backend::NdArray>(cli, Default::default()).is_ok());
    }

    #[test]
    fn test_scan_disabled_keeps_configured_path() {
        let path = Path::new("definitely_missing.safetensors");
        assert_eq!(locate(path, "safetensors", false), path);
    }
}
