use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::{Map, Value};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("malformed model config: {0}")]
    Envelope(#[source] serde_json::Error),
    #[error("unsupported model class '{0}', expected 'Sequential'")]
    ModelClass(String),
    #[error("{class}.from_config: unrecognized keyword argument '{key}'")]
    UnknownArgument { class: String, key: String },
    #[error("layer '{layer}' ({class}): {source}")]
    InvalidConfig {
        layer: String,
        class: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("unsupported layer class '{0}'")]
    UnsupportedLayer(String),
    #[error("layer '{layer}': unsupported {what}")]
    Unsupported { layer: String, what: String },
}

/// A decoded Sequential model.
#[derive(Debug, Clone, PartialEq)]
pub struct ModelConfig {
    pub name: Option<String>,
    pub layers: Vec<LayerConfig>,
    /// Declared `[H, W, C]` input, when the configuration states one.
    pub input_shape: Option<[usize; 3]>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct LayerConfig {
    pub name: String,
    pub kind: LayerKind,
}

#[derive(Debug, Clone, PartialEq)]
pub enum LayerKind {
    Input,
    Rescaling { scale: f32, offset: f32 },
    Conv2D(Conv2DConfig),
    MaxPooling2D(PoolConfig),
    AveragePooling2D(PoolConfig),
    GlobalAveragePooling2D,
    GlobalMaxPooling2D,
    Flatten,
    Dense(DenseConfig),
    BatchNormalization(BatchNormConfig),
    Dropout,
    /// Random* preprocessing layers, inactive at inference.
    Augmentation,
    Activation(Activation),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Activation {
    #[default]
    Linear,
    Relu,
    Sigmoid,
    Softmax,
    Tanh,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Padding {
    #[default]
    Valid,
    Same,
}

/// `kernel_size`, `strides` and friends are serialized either as one integer
/// or as a pair.
#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(untagged)]
enum Pair {
    One(usize),
    Two([usize; 2]),
}

impl Pair {
    fn get(self) -> [usize; 2] {
        match self {
            Pair::One(v) => [v, v],
            Pair::Two(v) => v,
        }
    }
}

fn pair_one() -> Pair {
    Pair::One(1)
}

fn pair_two() -> Pair {
    Pair::One(2)
}

fn yes() -> bool {
    true
}

#[derive(Debug, Clone, PartialEq)]
pub struct Conv2DConfig {
    pub filters: usize,
    pub kernel_size: [usize; 2],
    pub strides: [usize; 2],
    pub padding: Padding,
    pub dilation_rate: [usize; 2],
    pub groups: usize,
    pub activation: Activation,
    pub use_bias: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct DenseConfig {
    pub units: usize,
    pub activation: Activation,
    pub use_bias: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct BatchNormConfig {
    /// Normalized axis as written; `-1` is the channel axis.
    pub axis: i64,
    pub epsilon: f32,
    pub center: bool,
    pub scale: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct PoolConfig {
    pub pool_size: [usize; 2],
    pub strides: [usize; 2],
}

const BASE_ARGS: &[&str] = &["name", "trainable", "dtype", "batch_input_shape", "batch_size"];
const WEIGHT_ARGS: &[&str] = &[
    "use_bias",
    "kernel_initializer",
    "bias_initializer",
    "kernel_regularizer",
    "bias_regularizer",
    "activity_regularizer",
    "kernel_constraint",
    "bias_constraint",
];

fn accepted_args(class: &str) -> Option<Vec<&'static str>> {
    let extra: &[&str] = match class {
        "InputLayer" => return Some(vec!["name", "batch_input_shape", "dtype", "sparse", "ragged"]),
        "Rescaling" => &["scale", "offset"],
        "Conv2D" => &[
            "filters",
            "kernel_size",
            "strides",
            "padding",
            "data_format",
            "dilation_rate",
            "groups",
            "activation",
        ],
        "Dense" => &["units", "activation"],
        "MaxPooling2D" | "AveragePooling2D" => &["pool_size", "strides", "padding", "data_format"],
        "GlobalAveragePooling2D" | "GlobalMaxPooling2D" => &["data_format", "keepdims"],
        "Flatten" => &["data_format"],
        "BatchNormalization" => &[
            "axis",
            "momentum",
            "epsilon",
            "center",
            "scale",
            "beta_initializer",
            "gamma_initializer",
            "moving_mean_initializer",
            "moving_variance_initializer",
            "beta_regularizer",
            "gamma_regularizer",
            "beta_constraint",
            "gamma_constraint",
            "synchronized",
        ],
        "Dropout" => &["rate", "noise_shape", "seed"],
        "RandomFlip" => &["mode", "seed"],
        "RandomRotation" => &[
            "factor",
            "fill_mode",
            "interpolation",
            "seed",
            "fill_value",
            "value_range",
        ],
        "RandomZoom" | "RandomTranslation" => &[
            "height_factor",
            "width_factor",
            "fill_mode",
            "interpolation",
            "seed",
            "fill_value",
        ],
        "RandomContrast" | "RandomBrightness" => &["factor", "value_range", "seed"],
        "Activation" => &["activation"],
        _ => return None,
    };

    let mut args = BASE_ARGS.to_vec();
    args.extend_from_slice(extra);
    if class.starts_with("Random") {
        args.push("data_format");
    }
    if matches!(class, "Conv2D" | "Dense") {
        args.extend_from_slice(WEIGHT_ARGS);
    }
    Some(args)
}

#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
struct RootEnvelope {
    class_name: String,
    config: Value,
}

#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
struct SequentialEnvelope {
    #[serde(default)]
    name: Option<String>,
    layers: Vec<LayerEnvelope>,
    #[serde(default)]
    build_input_shape: Option<Vec<Option<usize>>>,
}

#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
struct LayerEnvelope {
    class_name: String,
    config: Map<String, Value>,
}

/// Arguments every layer class carries.
#[derive(Deserialize)]
struct CommonArgs {
    name: String,
    #[serde(default)]
    dtype: Option<String>,
    #[serde(default)]
    batch_input_shape: Option<Vec<Option<usize>>>,
    #[serde(default)]
    data_format: Option<String>,
}

#[derive(Deserialize)]
struct RescalingArgs {
    scale: f32,
    #[serde(default)]
    offset: f32,
}

#[derive(Deserialize)]
struct Conv2DArgs {
    filters: usize,
    kernel_size: Pair,
    #[serde(default = "pair_one")]
    strides: Pair,
    #[serde(default)]
    padding: Padding,
    #[serde(default = "pair_one")]
    dilation_rate: Pair,
    #[serde(default = "default_groups")]
    groups: usize,
    #[serde(default)]
    activation: Activation,
    #[serde(default = "yes")]
    use_bias: bool,
}

fn default_groups() -> usize {
    1
}

#[derive(Deserialize)]
struct DenseArgs {
    units: usize,
    #[serde(default)]
    activation: Activation,
    #[serde(default = "yes")]
    use_bias: bool,
}

#[derive(Deserialize)]
struct PoolArgs {
    #[serde(default = "pair_two")]
    pool_size: Pair,
    #[serde(default)]
    strides: Option<Pair>,
    #[serde(default)]
    padding: Padding,
}

#[derive(Deserialize)]
struct GlobalPoolArgs {
    #[serde(default)]
    keepdims: bool,
}

/// `axis` is an integer, or a one-element list once the layer was built.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
enum Axis {
    One(i64),
    Many(Vec<i64>),
}

fn last_axis() -> Axis {
    Axis::One(-1)
}

fn bn_epsilon() -> f32 {
    1e-3
}

#[derive(Deserialize)]
struct BatchNormArgs {
    #[serde(default = "last_axis")]
    axis: Axis,
    #[serde(default = "bn_epsilon")]
    epsilon: f32,
    #[serde(default = "yes")]
    center: bool,
    #[serde(default = "yes")]
    scale: bool,
}

#[derive(Deserialize)]
struct ActivationArgs {
    activation: Activation,
}

const FLOAT_DTYPES: &[&str] = &["float16", "bfloat16", "float32", "float64", "mixed_float16"];

/// Decode a Keras-style Sequential `model_config`. Envelopes must be exactly
/// `{class_name, config}` and every layer class accepts only its known
/// keyword arguments, so a configuration from another serializer version is
/// rejected here and left to the loader's migration strategies.
pub fn decode(config: &Value) -> Result<ModelConfig, DecodeError> {
    let root: RootEnvelope =
        serde_json::from_value(config.clone()).map_err(DecodeError::Envelope)?;
    if root.class_name != "Sequential" {
        return Err(DecodeError::ModelClass(root.class_name));
    }
    let sequential: SequentialEnvelope =
        serde_json::from_value(root.config).map_err(DecodeError::Envelope)?;

    let mut input_shape = sequential.build_input_shape.as_deref().and_then(spatial_shape);
    let mut layers = Vec::with_capacity(sequential.layers.len());
    decode_layers(sequential.layers, &mut layers, &mut input_shape)?;

    Ok(ModelConfig {
        name: sequential.name,
        layers,
        input_shape,
    })
}

/// Append decoded layers to `layers`, inlining nested Sequential blocks. The
/// first layer's declared shape overrides `input_shape`.
fn decode_layers(
    entries: Vec<LayerEnvelope>,
    layers: &mut Vec<LayerConfig>,
    input_shape: &mut Option<[usize; 3]>,
) -> Result<(), DecodeError> {
    for entry in entries {
        let first = layers.is_empty();

        if entry.class_name == "Sequential" {
            let nested: SequentialEnvelope = serde_json::from_value(Value::Object(entry.config))
                .map_err(DecodeError::Envelope)?;
            let declared = nested.build_input_shape.as_deref().and_then(spatial_shape);
            if let Some(shape) = declared.filter(|_| first) {
                *input_shape = Some(shape);
            }
            decode_layers(nested.layers, layers, input_shape)?;
            continue;
        }

        let (layer, declared) = decode_layer(entry)?;
        if let Some(shape) = declared.filter(|_| first) {
            *input_shape = Some(shape);
        }
        layers.push(layer);
    }
    Ok(())
}

fn spatial_shape(batch_shape: &[Option<usize>]) -> Option<[usize; 3]> {
    match batch_shape {
        [_, Some(h), Some(w), Some(c)] => Some([*h, *w, *c]),
        _ => None,
    }
}

fn parse<T: DeserializeOwned>(
    class: &str,
    layer: &str,
    config: &Map<String, Value>,
) -> Result<T, DecodeError> {
    serde_json::from_value(Value::Object(config.clone())).map_err(|source| {
        DecodeError::InvalidConfig {
            layer: layer.to_string(),
            class: class.to_string(),
            source,
        }
    })
}

fn decode_layer(entry: LayerEnvelope) -> Result<(LayerConfig, Option<[usize; 3]>), DecodeError> {
    let class = entry.class_name.as_str();
    let config = &entry.config;

    let accepted =
        accepted_args(class).ok_or_else(|| DecodeError::UnsupportedLayer(class.to_string()))?;
    if let Some(key) = config.keys().find(|key| !accepted.contains(&key.as_str())) {
        return Err(DecodeError::UnknownArgument {
            class: class.to_string(),
            key: key.clone(),
        });
    }

    let fallback_name = class.to_lowercase();
    let layer_name = config
        .get("name")
        .and_then(Value::as_str)
        .unwrap_or(&fallback_name);
    let common: CommonArgs = parse(class, layer_name, config)?;
    let name = common.name;

    let unsupported = |what: String| DecodeError::Unsupported {
        layer: name.clone(),
        what,
    };

    if let Some(dtype) = common.dtype.as_deref() {
        if !FLOAT_DTYPES.contains(&dtype) {
            return Err(unsupported(format!("dtype '{dtype}'")));
        }
    }
    if let Some(format) = common.data_format.as_deref() {
        if format != "channels_last" {
            return Err(unsupported(format!("data_format '{format}'")));
        }
    }

    let kind = match class {
        "InputLayer" => LayerKind::Input,
        "Rescaling" => {
            let args: RescalingArgs = parse(class, &name, config)?;
            LayerKind::Rescaling {
                scale: args.scale,
                offset: args.offset,
            }
        }
        "Conv2D" => {
            let args: Conv2DArgs = parse(class, &name, config)?;
            LayerKind::Conv2D(Conv2DConfig {
                filters: args.filters,
                kernel_size: args.kernel_size.get(),
                strides: args.strides.get(),
                padding: args.padding,
                dilation_rate: args.dilation_rate.get(),
                groups: args.groups,
                activation: args.activation,
                use_bias: args.use_bias,
            })
        }
        "Dense" => {
            let args: DenseArgs = parse(class, &name, config)?;
            LayerKind::Dense(DenseConfig {
                units: args.units,
                activation: args.activation,
                use_bias: args.use_bias,
            })
        }
        "MaxPooling2D" | "AveragePooling2D" => {
            let args: PoolArgs = parse(class, &name, config)?;
            if args.padding != Padding::Valid {
                return Err(unsupported("'same' padding for pooling".to_string()));
            }
            let pool_size = args.pool_size.get();
            let pool = PoolConfig {
                pool_size,
                strides: args.strides.map(Pair::get).unwrap_or(pool_size),
            };
            if class == "MaxPooling2D" {
                LayerKind::MaxPooling2D(pool)
            } else {
                LayerKind::AveragePooling2D(pool)
            }
        }
        "GlobalAveragePooling2D" | "GlobalMaxPooling2D" => {
            let args: GlobalPoolArgs = parse(class, &name, config)?;
            if args.keepdims {
                return Err(unsupported("keepdims=True".to_string()));
            }
            if class == "GlobalAveragePooling2D" {
                LayerKind::GlobalAveragePooling2D
            } else {
                LayerKind::GlobalMaxPooling2D
            }
        }
        "Flatten" => LayerKind::Flatten,
        "BatchNormalization" => {
            let args: BatchNormArgs = parse(class, &name, config)?;
            let axis = match args.axis {
                Axis::One(axis) => axis,
                Axis::Many(axes) => match axes.as_slice() {
                    [axis] => *axis,
                    _ => return Err(unsupported(format!("normalization over axes {axes:?}"))),
                },
            };
            if axis == 0 || axis < -1 {
                return Err(unsupported(format!("normalization over axis {axis}")));
            }
            LayerKind::BatchNormalization(BatchNormConfig {
                axis,
                epsilon: args.epsilon,
                center: args.center,
                scale: args.scale,
            })
        }
        "Dropout" => LayerKind::Dropout,
        class if class.starts_with("Random") => LayerKind::Augmentation,
        "Activation" => {
            let args: ActivationArgs = parse(class, &name, config)?;
            LayerKind::Activation(args.activation)
        }
        other => return Err(DecodeError::UnsupportedLayer(other.to_string())),
    };

    let declared = common.batch_input_shape.as_deref().and_then(spatial_shape);
    Ok((LayerConfig { name, kind }, declared))
}
