use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

#[derive(Debug, Error, PartialEq)]
pub enum MigrationError {
    #[error("model config must be a JSON object")]
    NotAnObject,
    #[error("unsupported dtype policy class '{0}'")]
    UnknownPolicy(String),
    #[error("invalid dtype policy config: {0}")]
    InvalidPolicy(String),
    #[error("layer '{layer}': cannot collapse {key} {value} into a scalar")]
    NonScalar {
        layer: String,
        key: &'static str,
        value: Value,
    },
}

/// A named rewrite of the raw architecture configuration.
#[derive(Clone, Copy)]
pub struct Strategy {
    pub name: &'static str,
    pub migrate: fn(Value) -> Result<Value, MigrationError>,
}

impl std::fmt::Debug for Strategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("Strategy").field(&self.name).finish()
    }
}

/// Rewrites of the raw `model_config`, tried by the loader in this order.
/// Each is a pure function whose output the strict decoder in
/// [`crate::model::config`] may or may not accept.
pub const STRATEGIES: [Strategy; 3] = [
    Strategy {
        name: "native",
        migrate: native,
    },
    Strategy {
        name: "standalone",
        migrate: standalone,
    },
    Strategy {
        name: "compat-shim",
        migrate: compat_shim,
    },
];

/// Envelope keys the newer serializer writes around every object.
const ENVELOPE_KEYS: [&str; 4] = ["module", "registered_name", "build_config", "compile_config"];
/// Model-level keys the newer serializer adds to the Sequential config.
const MODEL_LEVEL_KEYS: [&str; 2] = ["trainable", "dtype"];

/// The configuration as written.
pub fn native(config: Value) -> Result<Value, MigrationError> {
    Ok(config)
}

/// Drop the newer serializer's object envelope from the root and from every
/// layer entry. Layer configs are left untouched.
pub fn standalone(config: Value) -> Result<Value, MigrationError> {
    let Value::Object(mut root) = config else {
        return Err(MigrationError::NotAnObject);
    };
    strip_envelope(&mut root);
    if let Some(Value::Object(model)) = root.get_mut("config") {
        strip_sequential(model);
    }
    Ok(Value::Object(root))
}

fn strip_sequential(model: &mut Map<String, Value>) {
    for key in MODEL_LEVEL_KEYS {
        model.remove(key);
    }
    let Some(Value::Array(layers)) = model.get_mut("layers") else {
        return;
    };
    for layer in layers.iter_mut() {
        let Value::Object(entry) = layer else {
            continue;
        };
        strip_envelope(entry);
        if is_sequential(entry) {
            if let Some(Value::Object(nested)) = entry.get_mut("config") {
                strip_sequential(nested);
            }
        }
    }
}

fn is_sequential(entry: &Map<String, Value>) -> bool {
    entry.get("class_name").and_then(Value::as_str) == Some("Sequential")
}

/// [`standalone`], then the per-class shims from [`ShimRegistry`].
pub fn compat_shim(config: Value) -> Result<Value, MigrationError> {
    let mut config = standalone(config)?;
    let registry = ShimRegistry::default();
    if let Some(layers) = layers_mut(&mut config) {
        shim_layers(&registry, layers)?;
    }
    Ok(config)
}

fn layers_mut(sequential: &mut Value) -> Option<&mut Vec<Value>> {
    sequential
        .get_mut("config")
        .and_then(|model| model.get_mut("layers"))
        .and_then(Value::as_array_mut)
}

fn shim_layers(registry: &ShimRegistry, layers: &mut [Value]) -> Result<(), MigrationError> {
    for layer in layers.iter_mut() {
        let nested = layer.as_object().is_some_and(is_sequential);
        if !nested {
            registry.apply(layer)?;
        } else if let Some(inner) = layers_mut(layer) {
            shim_layers(registry, inner)?;
        }
    }
    Ok(())
}

fn strip_envelope(object: &mut Map<String, Value>) {
    for key in ENVELOPE_KEYS {
        object.remove(key);
    }
}

/// Stand-in for the newer framework's dtype policy object. Accepts a config
/// with an optional `name` and round-trips it through
/// [`from_config`](Self::from_config) / [`get_config`](Self::get_config).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DTypePolicy {
    #[serde(default = "default_policy_name")]
    pub name: String,
}

fn default_policy_name() -> String {
    "float32".to_string()
}

impl Default for DTypePolicy {
    fn default() -> Self {
        Self {
            name: default_policy_name(),
        }
    }
}

impl DTypePolicy {
    pub fn from_config(config: Option<&Value>) -> Result<Self, MigrationError> {
        match config {
            None | Some(Value::Null) => Ok(Self::default()),
            Some(value) => serde_json::from_value(value.clone())
                .map_err(|e| MigrationError::InvalidPolicy(e.to_string())),
        }
    }

    pub fn get_config(&self) -> Value {
        serde_json::json!({ "name": self.name })
    }
}

type LayerShim = fn(&str, &mut Map<String, Value>) -> Result<(), MigrationError>;

/// Custom deserializers substituted for specific layer and config classes,
/// keyed by `class_name`.
pub struct ShimRegistry {
    layers: Vec<(&'static str, LayerShim)>,
    policies: Vec<&'static str>,
}

impl Default for ShimRegistry {
    fn default() -> Self {
        Self {
            layers: vec![
                ("InputLayer", legacy_input_layer as LayerShim),
                ("Rescaling", builtin_rescaling as LayerShim),
            ],
            policies: vec!["DTypePolicy", "FloatDTypePolicy"],
        }
    }
}

impl ShimRegistry {
    /// Rewrite one layer entry `{class_name, config}` in place.
    pub fn apply(&self, layer: &mut Value) -> Result<(), MigrationError> {
        let Some(entry) = layer.as_object_mut() else {
            return Ok(());
        };
        let class_name = entry
            .get("class_name")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        let Some(Value::Object(config)) = entry.get_mut("config") else {
            return Ok(());
        };

        self.apply_policy(config)?;

        let layer_name = config
            .get("name")
            .and_then(Value::as_str)
            .unwrap_or(&class_name)
            .to_string();
        if let Some((_, shim)) = self.layers.iter().find(|(name, _)| *name == class_name) {
            shim(&layer_name, config)?;
        }
        Ok(())
    }

    /// Replace a policy object under `dtype` by the plain dtype name.
    fn apply_policy(&self, config: &mut Map<String, Value>) -> Result<(), MigrationError> {
        let Some(Value::Object(policy)) = config.get("dtype") else {
            return Ok(());
        };
        let class_name = policy
            .get("class_name")
            .and_then(Value::as_str)
            .unwrap_or_default();
        if !self.policies.iter().any(|known| *known == class_name) {
            return Err(MigrationError::UnknownPolicy(class_name.to_string()));
        }

        let shim = DTypePolicy::from_config(policy.get("config"))?;
        let name = shim.get_config()["name"].clone();
        config.insert("dtype".to_string(), name);
        Ok(())
    }
}

fn legacy_input_layer(_: &str, config: &mut Map<String, Value>) -> Result<(), MigrationError> {
    if let Some(shape) = config.remove("batch_shape") {
        config.entry("batch_input_shape").or_insert(shape);
    }
    Ok(())
}

fn builtin_rescaling(layer: &str, config: &mut Map<String, Value>) -> Result<(), MigrationError> {
    for key in ["scale", "offset"] {
        if let Some(Value::Array(values)) = config.get(key) {
            let [value] = values.as_slice() else {
                return Err(MigrationError::NonScalar {
                    layer: layer.to_string(),
                    key,
                    value: Value::Array(values.clone()),
                });
            };
            let value = value.clone();
            config.insert(key.to_string(), value);
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn keras3_model() -> Value {
        json!({
            "module": "keras",
            "class_name": "Sequential",
            "config": {
                "name": "sequential",
                "trainable": true,
                "dtype": {"module": "keras", "class_name": "DTypePolicy", "config": {"name": "float32"}},
                "layers": [
                    {
                        "module": "keras.layers",
                        "class_name": "InputLayer",
                        "config": {"batch_shape": [null, 224, 224, 3], "dtype": "float32", "name": "input_layer"},
                        "registered_name": null
                    },
                    {
                        "module": "keras.layers",
                        "class_name": "Rescaling",
                        "config": {
                            "name": "rescaling",
                            "dtype": {"module": "keras", "class_name": "DTypePolicy", "config": {"name": "float32"}},
                            "scale": [0.5],
                            "offset": 0.0
                        },
                        "registered_name": null,
                        "build_config": {"input_shape": [null, 224, 224, 3]}
                    }
                ]
            },
            "registered_name": null,
            "build_config": {"input_shape": [null, 224, 224, 3]},
            "compile_config": null
        })
    }

    #[test]
    fn test_native_is_identity() {
        let config = keras3_model();
        assert_eq!(native(config.clone()).unwrap(), config);
    }

    #[test]
    fn test_standalone_strips_envelope_only() {
        let migrated = standalone(keras3_model()).unwrap();

        assert!(migrated.get("module").is_none());
        assert!(migrated.get("build_config").is_none());
        assert!(migrated["config"].get("trainable").is_none());
        assert!(migrated["config"].get("dtype").is_none());

        let input = &migrated["config"]["layers"][0];
        assert!(input.get("registered_name").is_none());
        assert_eq!(input["class_name"], "InputLayer");
        // layer configs are untouched
        assert!(input["config"].get("batch_shape").is_some());
        assert!(migrated["config"]["layers"][1]["config"]["dtype"].is_object());
    }

    #[test]
    fn test_standalone_rejects_non_object() {
        assert_eq!(standalone(json!([1, 2])), Err(MigrationError::NotAnObject));
    }

    #[test]
    fn test_compat_shim_rewrites_known_shapes() {
        let migrated = compat_shim(keras3_model()).unwrap();
        let layers = &migrated["config"]["layers"];

        assert!(layers[0]["config"].get("batch_shape").is_none());
        assert_eq!(layers[0]["config"]["batch_input_shape"], json!([null, 224, 224, 3]));
        assert_eq!(layers[0]["config"]["name"], "input_layer");
        assert_eq!(layers[1]["config"]["dtype"], "float32");
        assert_eq!(layers[1]["config"]["scale"], json!(0.5));
        assert_eq!(layers[1]["config"]["offset"], json!(0.0));
    }

    #[test]
    fn test_batch_shape_kept_on_other_layers() {
        let mut layer = json!({"class_name": "Dense", "config": {"name": "d", "batch_shape": [null, 4]}});
        ShimRegistry::default().apply(&mut layer).unwrap();
        assert!(layer["config"].get("batch_shape").is_some());
    }

    #[test]
    fn test_policy_without_name_defaults_to_float32() {
        let mut layer = json!({
            "class_name": "Dense",
            "config": {"name": "d", "dtype": {"class_name": "DTypePolicy", "config": {}}}
        });
        ShimRegistry::default().apply(&mut layer).unwrap();
        assert_eq!(layer["config"]["dtype"], "float32");

        let mut bare = json!({
            "class_name": "Dense",
            "config": {"name": "d", "dtype": {"class_name": "FloatDTypePolicy"}}
        });
        ShimRegistry::default().apply(&mut bare).unwrap();
        assert_eq!(bare["config"]["dtype"], "float32");
    }

    #[test]
    fn test_policy_round_trip() {
        let policy = DTypePolicy::from_config(Some(&json!({"name": "mixed_float16"}))).unwrap();
        assert_eq!(policy.get_config(), json!({"name": "mixed_float16"}));
        assert_eq!(DTypePolicy::from_config(Some(&policy.get_config())).unwrap(), policy);
    }

    #[test]
    fn test_unknown_policy_class_fails() {
        let mut layer = json!({
            "class_name": "Dense",
            "config": {"name": "d", "dtype": {"class_name": "QuantizedDTypePolicy", "config": {}}}
        });
        let err = ShimRegistry::default().apply(&mut layer).unwrap_err();
        assert_eq!(err, MigrationError::UnknownPolicy("QuantizedDTypePolicy".to_string()));
    }

    #[test]
    fn test_rescaling_rejects_per_channel_lists() {
        let mut layer = json!({
            "class_name": "Rescaling",
            "config": {"name": "r", "scale": [0.1, 0.2, 0.3], "offset": 0.0}
        });
        let err = ShimRegistry::default().apply(&mut layer).unwrap_err();
        assert!(err.to_string().contains("layer 'r'"));
    }

    #[test]
    fn test_nested_sequential_is_migrated_too() {
        let policy = json!({"module": "keras", "class_name": "DTypePolicy", "config": {"name": "float32"}});
        let config = json!({"module": "keras", "class_name": "Sequential", "config": {
            "name": "outer",
            "layers": [{
                "module": "keras", "class_name": "Sequential", "registered_name": null,
                "config": {"name": "data_augmentation", "trainable": true, "dtype": policy, "layers": [
                    {"module": "keras.layers", "class_name": "InputLayer",
                     "config": {"name": "in", "batch_shape": [null, 180, 180, 3]}},
                    {"module": "keras.layers", "class_name": "RandomFlip",
                     "config": {"name": "flip", "mode": "horizontal", "dtype": policy},
                     "build_config": {"input_shape": [null, 180, 180, 3]}}
                ]}
            }]
        }});

        let migrated = compat_shim(config).unwrap();
        let block = &migrated["config"]["layers"][0];
        assert!(block.get("module").is_none());
        assert!(block["config"].get("dtype").is_none());
        assert!(block["config"].get("trainable").is_none());

        let inner = &block["config"]["layers"];
        assert!(inner[1].get("build_config").is_none());
        assert_eq!(inner[0]["config"]["batch_input_shape"], json!([null, 180, 180, 3]));
        assert_eq!(inner[1]["config"]["dtype"], "float32");
    }

    #[test]
    fn test_strategy_order() {
        let names: Vec<_> = STRATEGIES.iter().map(|s| s.name).collect();
        assert_eq!(names, ["native", "standalone", "compat-shim"]);
    }
}
