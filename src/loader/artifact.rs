use safetensors::tensor::{Dtype, SafeTensorError, SafeTensors, TensorView};
use serde_json::Value;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Metadata key holding the architecture configuration.
pub const MODEL_CONFIG_KEY: &str = "model_config";
/// Metadata key holding the version of the library that wrote the artifact.
pub const KERAS_VERSION_KEY: &str = "keras_version";

#[derive(Debug, Error)]
pub enum ArtifactError {
    #[error("cannot read model artifact '{}': {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("'{}' is not a valid model artifact: {source}", .path.display())]
    Container {
        path: PathBuf,
        #[source]
        source: SafeTensorError,
    },
    #[error("'{}' has no 'model_config' metadata entry", .path.display())]
    MissingConfig { path: PathBuf },
    #[error("'{}' carries a malformed 'model_config': {source}", .path.display())]
    MalformedConfig {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("tensor '{name}' has unsupported dtype {dtype:?}")]
    UnsupportedDtype { name: String, dtype: Dtype },
    #[error("tensor '{name}' has shape {shape:?} but {len} values")]
    ShapeMismatch {
        name: String,
        shape: Vec<usize>,
        len: usize,
    },
    #[error("cannot encode model artifact: {0}")]
    Encode(#[source] SafeTensorError),
}

/// A dense `f32` tensor as stored in the artifact, in Keras layout.
#[derive(Debug, Clone, PartialEq)]
pub struct WeightTensor {
    pub shape: Vec<usize>,
    pub data: Vec<f32>,
}

impl WeightTensor {
    pub fn new(shape: Vec<usize>, data: Vec<f32>) -> Self {
        Self { shape, data }
    }

    fn from_view(name: &str, view: &TensorView<'_>) -> Result<Self, ArtifactError> {
        let bytes = view.data();
        let data: Vec<f32> = match view.dtype() {
            Dtype::F32 => bytes
                .chunks_exact(4)
                .map(|b| f32::from_le_bytes([b[0], b[1], b[2], b[3]]))
                .collect(),
            Dtype::F64 => bytes
                .chunks_exact(8)
                .map(|b| {
                    f64::from_le_bytes([b[0], b[1], b[2], b[3], b[4], b[5], b[6], b[7]]) as f32
                })
                .collect(),
            dtype => {
                return Err(ArtifactError::UnsupportedDtype {
                    name: name.to_string(),
                    dtype,
                })
            }
        };

        let shape = view.shape().to_vec();
        if shape.iter().product::<usize>() != data.len() {
            return Err(ArtifactError::ShapeMismatch {
                name: name.to_string(),
                shape,
                len: data.len(),
            });
        }

        Ok(Self { shape, data })
    }

    fn to_le_bytes(&self) -> Vec<u8> {
        self.data.iter().flat_map(|v| v.to_le_bytes()).collect()
    }
}

/// Raw contents of a model artifact: the undecoded architecture
/// configuration plus every weight tensor by name.
#[derive(Debug, Clone)]
pub struct Artifact {
    pub model_config: Value,
    pub keras_version: Option<String>,
    pub tensors: HashMap<String, WeightTensor>,
}

impl Artifact {
    pub fn new(model_config: Value) -> Self {
        Self {
            model_config,
            keras_version: None,
            tensors: HashMap::new(),
        }
    }

    pub fn with_keras_version(mut self, version: impl Into<String>) -> Self {
        self.keras_version = Some(version.into());
        self
    }

    pub fn with_tensor(mut self, name: impl Into<String>, tensor: WeightTensor) -> Self {
        self.tensors.insert(name.into(), tensor);
        self
    }

    /// Read and parse an artifact from disk.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ArtifactError> {
        let path = path.as_ref();
        let bytes = std::fs::read(path).map_err(|source| ArtifactError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_bytes(path, &bytes)
    }

    fn from_bytes(path: &Path, bytes: &[u8]) -> Result<Self, ArtifactError> {
        let container_err = |source| ArtifactError::Container {
            path: path.to_path_buf(),
            source,
        };

        let (_, metadata) = SafeTensors::read_metadata(bytes).map_err(container_err)?;
        let entries = metadata.metadata().clone().unwrap_or_default();

        let raw_config = entries
            .get(MODEL_CONFIG_KEY)
            .ok_or_else(|| ArtifactError::MissingConfig {
                path: path.to_path_buf(),
            })?;
        let model_config =
            serde_json::from_str(raw_config).map_err(|source| ArtifactError::MalformedConfig {
                path: path.to_path_buf(),
                source,
            })?;

        let st = SafeTensors::deserialize(bytes).map_err(container_err)?;
        let mut tensors = HashMap::new();
        for (name, view) in st.tensors() {
            let tensor = WeightTensor::from_view(&name, &view)?;
            tensors.insert(name, tensor);
        }

        Ok(Self {
            model_config,
            keras_version: entries.get(KERAS_VERSION_KEY).cloned(),
            tensors,
        })
    }

    /// Encode the artifact in its on-disk form.
    pub fn to_bytes(&self) -> Result<Vec<u8>, ArtifactError> {
        let mut metadata = HashMap::new();
        metadata.insert(MODEL_CONFIG_KEY.to_string(), self.model_config.to_string());
        if let Some(version) = &self.keras_version {
            metadata.insert(KERAS_VERSION_KEY.to_string(), version.clone());
        }

        let buffers: Vec<(&String, &WeightTensor, Vec<u8>)> = self
            .tensors
            .iter()
            .map(|(name, tensor)| (name, tensor, tensor.to_le_bytes()))
            .collect();

        let mut views = HashMap::new();
        for (name, tensor, bytes) in &buffers {
            let view = TensorView::new(Dtype::F32, tensor.shape.clone(), bytes)
                .map_err(ArtifactError::Encode)?;
            views.insert((*name).clone(), view);
        }

        safetensors::serialize(&views, &Some(metadata)).map_err(ArtifactError::Encode)
    }

    /// Write the artifact to disk.
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<(), ArtifactError> {
        let path = path.as_ref();
        let bytes = self.to_bytes()?;
        std::fs::write(path, bytes).map_err(|source| ArtifactError::Io {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Look up a layer parameter, accepting the `:0` suffix Keras appends.
    pub fn weight(&self, layer: &str, param: &str) -> Option<&WeightTensor> {
        let key = format!("{layer}/{param}");
        self.tensors
            .get(&key)
            .or_else(|| self.tensors.get(&format!("{key}:0")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn sample() -> Artifact {
        Artifact::new(json!({"class_name": "Sequential", "config": {"layers": []}}))
            .with_keras_version("2.15.0")
            .with_tensor("dense/kernel", WeightTensor::new(vec![2, 3], vec![1.0; 6]))
            .with_tensor("dense/bias:0", WeightTensor::new(vec![3], vec![0.5, -0.5, 0.0]))
    }

    #[test]
    fn test_save_and_load_keep_config_and_tensors() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("model.safetensors");
        sample().save(&path).unwrap();

        let loaded = Artifact::load(&path).unwrap();
        assert_eq!(loaded.model_config["class_name"], "Sequential");
        assert_eq!(loaded.keras_version.as_deref(), Some("2.15.0"));
        assert_eq!(loaded.tensors.len(), 2);
        assert_eq!(loaded.weight("dense", "kernel").unwrap().shape, vec![2, 3]);
    }

    #[test]
    fn test_weight_lookup_accepts_keras_suffix() {
        let artifact = sample();
        let bias = artifact.weight("dense", "bias").unwrap();
        assert_eq!(bias.data, vec![0.5, -0.5, 0.0]);
        assert!(artifact.weight("conv2d", "kernel").is_none());
    }

    #[test]
    fn test_missing_file_names_path() {
        let err = Artifact::load("does/not/exist.safetensors").unwrap_err();
        assert!(matches!(err, ArtifactError::Io { .. }));
        assert!(err.to_string().contains("does/not/exist.safetensors"));
    }

    #[test]
    fn test_garbage_is_a_container_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("broken.safetensors");
        std::fs::write(&path, b"not a model").unwrap();

        let err = Artifact::load(&path).unwrap_err();
        assert!(matches!(err, ArtifactError::Container { .. }));
    }

    #[test]
    fn test_missing_model_config_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("weights_only.safetensors");
        let data = vec![0u8; 8];
        let mut views = HashMap::new();
        views.insert(
            "w".to_string(),
            TensorView::new(Dtype::F32, vec![2], &data).unwrap(),
        );
        let bytes = safetensors::serialize(&views, &None::<HashMap<String, String>>).unwrap();
        std::fs::write(&path, bytes).unwrap();

        let err = Artifact::load(&path).unwrap_err();
        assert!(matches!(err, ArtifactError::MissingConfig { .. }));
    }
}
