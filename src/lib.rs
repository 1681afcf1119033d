pub mod cli;
pub mod config;
pub mod data;
pub mod inference;
pub mod loader;
pub mod model;
pub mod output;

pub use config::AppConfig;
pub use data::{ImageBatch, LabelList, Preprocessor};
pub use inference::{Classifier, Outcome, Prediction, Predictor};
pub use loader::{LoadError, ModelLoader};
pub use model::ImageClassifierModel;
