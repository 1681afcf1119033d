use crate::data::{ImageBatch, LabelList, Preprocessor};
use image::DynamicImage;
use serde::Serialize;
use std::panic::{self, AssertUnwindSafe};
use std::path::Path;
use thiserror::Error;
use tracing::{debug, warn};

/// Largest distance from 1 at which an output vector still counts as a
/// probability distribution.
const PROBABILITY_TOLERANCE: f32 = 1e-3;

#[derive(Debug, Error)]
pub enum PredictError {
    #[error("{0}")]
    Shape(String),
    #[error("cannot read predictor output: {0}")]
    Backend(String),
}

/// Anything that maps a batch of preprocessed images to one score vector per
/// image.
pub trait Predictor {
    fn predict(&self, batch: &ImageBatch) -> Result<Vec<Vec<f32>>, PredictError>;

    /// `[height, width, channels]` the predictor was built for, if declared.
    fn input_shape(&self) -> Option<[usize; 3]> {
        None
    }

    /// Length of each output vector, if known before running.
    fn output_width(&self) -> Option<usize> {
        None
    }
}

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error(transparent)]
    Image(#[from] image::ImageError),
    #[error("model expects {expected:?} input, got {actual:?}")]
    InputShape {
        expected: [usize; 3],
        actual: [usize; 3],
    },
    #[error(transparent)]
    Predict(#[from] PredictError),
    #[error("predictor returned no scores")]
    EmptyOutput,
    #[error("predictor output has no finite maximum (got {0})")]
    NonFiniteOutput(f32),
    #[error("class index {index} out of range for {len} labels")]
    LabelOutOfRange { index: usize, len: usize },
    #[error("output is not a probability distribution (max {max}, sum {sum})")]
    NotProbabilities { max: f32, sum: f32 },
    #[error("prediction panicked: {0}")]
    Panicked(String),
}

/// One labeled prediction.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct Prediction {
    pub label: String,
    pub confidence: f32,
}

/// What a single invocation reports.
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(untagged)]
pub enum Outcome {
    Prediction(Prediction),
    Error { error: String },
}

impl Outcome {
    pub fn error(message: impl Into<String>) -> Self {
        Outcome::Error {
            error: message.into(),
        }
    }

    pub fn is_error(&self) -> bool {
        matches!(self, Outcome::Error { .. })
    }
}

impl From<Result<Prediction, PipelineError>> for Outcome {
    fn from(result: Result<Prediction, PipelineError>) -> Self {
        match result {
            Ok(prediction) => Outcome::Prediction(prediction),
            Err(e) => Outcome::error(e.to_string()),
        }
    }
}

/// Index of the largest score; the lowest index wins ties and NaN never wins.
pub fn argmax(scores: &[f32]) -> Option<usize> {
    let mut best: Option<(usize, f32)> = None;
    for (index, &score) in scores.iter().enumerate() {
        match best {
            Some((_, top)) if !(score > top) => {}
            _ if score.is_nan() => {}
            _ => best = Some((index, score)),
        }
    }
    best.map(|(index, _)| index)
}

/// Predictor, labels and preprocessing bundled for one process lifetime.
pub struct Classifier {
    predictor: Box<dyn Predictor>,
    labels: LabelList,
    preprocessor: Preprocessor,
    strict_probabilities: bool,
}

impl Classifier {
    pub fn new(predictor: impl Predictor + 'static, labels: LabelList) -> Self {
        Self {
            predictor: Box::new(predictor),
            labels,
            preprocessor: Preprocessor::default(),
            strict_probabilities: false,
        }
    }

    pub fn with_preprocessor(mut self, preprocessor: Preprocessor) -> Self {
        self.preprocessor = preprocessor;
        self
    }

    /// Reject outputs that are not probability distributions instead of
    /// only warning about them.
    pub fn with_strict_probabilities(mut self, strict: bool) -> Self {
        self.strict_probabilities = strict;
        self
    }

    pub fn labels(&self) -> &LabelList {
        &self.labels
    }

    /// Classify the image at `image_path`; every failure becomes
    /// [`Outcome::Error`].
    pub fn analyze(&self, image_path: &Path) -> Outcome {
        let result = panic::catch_unwind(AssertUnwindSafe(|| self.classify(image_path)))
            .unwrap_or_else(|payload| Err(PipelineError::Panicked(panic_message(&*payload))));
        if let Err(e) = &result {
            debug!(path = %image_path.display(), error = %e, "Classification failed");
        }
        result.into()
    }

    pub fn classify(&self, image_path: &Path) -> Result<Prediction, PipelineError> {
        let batch = self.preprocessor.load(image_path)?;
        self.classify_batch(&batch)
    }

    pub fn classify_image(&self, image: &DynamicImage) -> Result<Prediction, PipelineError> {
        let batch = self.preprocessor.preprocess(image);
        self.classify_batch(&batch)
    }

    fn classify_batch(&self, batch: &ImageBatch) -> Result<Prediction, PipelineError> {
        if let Some(expected) = self.predictor.input_shape() {
            let actual = batch.image_shape();
            if expected != actual {
                return Err(PipelineError::InputShape { expected, actual });
            }
        }

        let outputs = self.predictor.predict(batch)?;
        let scores = outputs
            .first()
            .filter(|scores| !scores.is_empty())
            .ok_or(PipelineError::EmptyOutput)?;
        let class_id = argmax(scores).ok_or(PipelineError::NonFiniteOutput(f32::NAN))?;
        let confidence = scores[class_id];
        if !confidence.is_finite() {
            return Err(PipelineError::NonFiniteOutput(confidence));
        }

        self.check_distribution(scores, confidence)?;

        let label = self
            .labels
            .get(class_id)
            .ok_or(PipelineError::LabelOutOfRange {
                index: class_id,
                len: self.labels.len(),
            })?;

        Ok(Prediction {
            label: label.to_string(),
            confidence,
        })
    }

    fn check_distribution(&self, scores: &[f32], max: f32) -> Result<(), PipelineError> {
        let sum: f32 = scores.iter().sum();
        let in_range = scores.iter().all(|s| (0.0..=1.0).contains(s));
        if in_range && (sum - 1.0).abs() <= PROBABILITY_TOLERANCE {
            return Ok(());
        }
        if self.strict_probabilities {
            return Err(PipelineError::NotProbabilities { max, sum });
        }
        warn!(
            max,
            sum, "Predictor output is not a probability distribution; reporting the raw maximum"
        );
        Ok(())
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    payload
        .downcast_ref::<&str>()
        .map(|s| s.to_string())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "unknown panic".to_string())
}
