pub mod config;

use crate::data::ImageBatch;
use crate::inference::{PredictError, Predictor};
use crate::loader::artifact::{Artifact, WeightTensor};
use burn::{
    module::Param,
    nn::{
        conv::{Conv2d, Conv2dConfig},
        pool::{AvgPool2d, AvgPool2dConfig, MaxPool2d, MaxPool2dConfig},
        Linear, LinearConfig, PaddingConfig2d,
    },
    tensor::{
        activation::{relu, sigmoid, softmax, tanh},
        backend::Backend,
        Tensor, TensorData,
    },
};
use config::{
    Activation, BatchNormConfig, Conv2DConfig, DenseConfig, LayerKind, ModelConfig, Padding,
    PoolConfig,
};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum BuildError {
    #[error("model has no layers")]
    Empty,
    #[error("layer '{layer}': missing weight '{layer}/{param}'")]
    MissingWeight { layer: String, param: &'static str },
    #[error("layer '{layer}': {param} has shape {actual:?}, expected {expected}")]
    WeightShape {
        layer: String,
        param: &'static str,
        expected: String,
        actual: Vec<usize>,
    },
    #[error("layer '{layer}': {what}")]
    Invalid { layer: String, what: String },
}

enum Op<B: Backend> {
    Identity,
    Rescaling {
        scale: f32,
        offset: f32,
    },
    Conv2d {
        conv: Conv2d<B>,
        in_channels: usize,
        kernel_size: [usize; 2],
        strides: [usize; 2],
        dilation: [usize; 2],
        same: bool,
        activation: Activation,
    },
    MaxPool(MaxPool2d, [usize; 2]),
    AvgPool(AvgPool2d, [usize; 2]),
    GlobalAvgPool,
    GlobalMaxPool,
    Flatten,
    Dense {
        linear: Linear<B>,
        in_features: usize,
        activation: Activation,
    },
    /// Inference-mode batch normalization folded into `x * scale + shift`.
    BatchNorm {
        scale: Tensor<B, 1>,
        shift: Tensor<B, 1>,
        axis: i64,
    },
    Activation(Activation),
}

struct Layer<B: Backend> {
    name: String,
    op: Op<B>,
}

/// Intermediate value flowing between layers: NCHW feature maps until a
/// flattening layer turns them into `[batch, features]`.
enum Activations<B: Backend> {
    Spatial(Tensor<B, 4>),
    Flat(Tensor<B, 2>),
}

/// A classifier network ready for inference.
pub struct ImageClassifierModel<B: Backend> {
    name: Option<String>,
    layers: Vec<Layer<B>>,
    input_shape: Option<[usize; 3]>,
    device: B::Device,
}

impl<B: Backend> ImageClassifierModel<B> {
    /// Build the network described by `config`, taking parameters from
    /// `artifact`.
    pub fn from_config(
        config: &ModelConfig,
        artifact: &Artifact,
        device: &B::Device,
    ) -> Result<Self, BuildError> {
        if config.layers.is_empty() {
            return Err(BuildError::Empty);
        }

        let mut layers = Vec::with_capacity(config.layers.len());
        for layer in &config.layers {
            let op = match &layer.kind {
                LayerKind::Input | LayerKind::Dropout | LayerKind::Augmentation => Op::Identity,
                LayerKind::Rescaling { scale, offset } => Op::Rescaling {
                    scale: *scale,
                    offset: *offset,
                },
                LayerKind::Conv2D(conv) => build_conv(&layer.name, conv, artifact, device)?,
                LayerKind::MaxPooling2D(pool) => {
                    let PoolConfig { pool_size, strides } = *pool;
                    let module = MaxPool2dConfig::new(pool_size)
                        .with_strides(strides)
                        .with_padding(PaddingConfig2d::Valid)
                        .init();
                    Op::MaxPool(module, pool_size)
                }
                LayerKind::AveragePooling2D(pool) => {
                    let PoolConfig { pool_size, strides } = *pool;
                    let module = AvgPool2dConfig::new(pool_size)
                        .with_strides(strides)
                        .with_padding(PaddingConfig2d::Valid)
                        .init();
                    Op::AvgPool(module, pool_size)
                }
                LayerKind::GlobalAveragePooling2D => Op::GlobalAvgPool,
                LayerKind::GlobalMaxPooling2D => Op::GlobalMaxPool,
                LayerKind::Flatten => Op::Flatten,
                LayerKind::Dense(dense) => build_dense(&layer.name, dense, artifact, device)?,
                LayerKind::BatchNormalization(bn) => {
                    build_batch_norm(&layer.name, bn, artifact, device)?
                }
                LayerKind::Activation(activation) => Op::Activation(*activation),
            };
            layers.push(Layer {
                name: layer.name.clone(),
                op,
            });
        }

        Ok(Self {
            name: config.name.clone(),
            layers,
            input_shape: config.input_shape,
            device: device.clone(),
        })
    }

    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    pub fn num_layers(&self) -> usize {
        self.layers.len()
    }

    /// Run the network on an NHWC batch and return `[batch, classes]`.
    pub fn forward(&self, input: Tensor<B, 4>) -> Result<Tensor<B, 2>, PredictError> {
        // Keras layout in, burn's NCHW inside
        let mut x = Activations::Spatial(input.permute([0, 3, 1, 2]));
        for layer in &self.layers {
            x = layer.forward(x)?;
        }

        match x {
            Activations::Flat(out) => Ok(out),
            Activations::Spatial(out) => Err(PredictError::Shape(format!(
                "model output has shape {:?}, expected [batch, classes]",
                out.dims()
            ))),
        }
    }
}

impl<B: Backend> Predictor for ImageClassifierModel<B> {
    fn predict(&self, batch: &ImageBatch) -> Result<Vec<Vec<f32>>, PredictError> {
        let data = TensorData::new(batch.data.clone(), batch.shape);
        let input = Tensor::<B, 4>::from_data(data, &self.device);
        let output = self.forward(input)?;

        let [rows, width] = output.dims();
        let values = output
            .into_data()
            .to_vec::<f32>()
            .map_err(|e| PredictError::Backend(format!("{e:?}")))?;
        if width == 0 {
            return Ok(vec![Vec::new(); rows]);
        }
        Ok(values.chunks(width).map(<[f32]>::to_vec).collect())
    }

    fn input_shape(&self) -> Option<[usize; 3]> {
        self.input_shape
    }

    fn output_width(&self) -> Option<usize> {
        let mut width = None;
        for layer in &self.layers {
            width = match &layer.op {
                Op::Dense { linear, .. } => Some(linear.weight.dims()[1]),
                Op::Identity | Op::Rescaling { .. } | Op::Activation(_) | Op::BatchNorm { .. } => {
                    width
                }
                _ => None,
            };
        }
        width
    }
}

impl<B: Backend> Layer<B> {
    fn forward(&self, x: Activations<B>) -> Result<Activations<B>, PredictError> {
        let shape_err = |what: String| PredictError::Shape(format!("layer '{}': {what}", self.name));

        Ok(match (&self.op, x) {
            (Op::Identity, x) => x,
            (Op::Rescaling { scale, offset }, Activations::Spatial(x)) => {
                Activations::Spatial(x.mul_scalar(*scale).add_scalar(*offset))
            }
            (Op::Rescaling { scale, offset }, Activations::Flat(x)) => {
                Activations::Flat(x.mul_scalar(*scale).add_scalar(*offset))
            }
            (Op::Activation(activation), Activations::Spatial(x)) => {
                Activations::Spatial(activate(x, *activation))
            }
            (Op::Activation(activation), Activations::Flat(x)) => {
                Activations::Flat(activate(x, *activation))
            }
            (
                Op::Conv2d {
                    conv,
                    in_channels,
                    kernel_size,
                    strides,
                    dilation,
                    same,
                    activation,
                },
                Activations::Spatial(x),
            ) => {
                let [_, channels, height, width] = x.dims();
                if channels != *in_channels {
                    return Err(shape_err(format!(
                        "expects {in_channels} input channels, got {channels}"
                    )));
                }
                let x = if *same {
                    let rows = same_padding(height, kernel_size[0], strides[0], dilation[0]);
                    let cols = same_padding(width, kernel_size[1], strides[1], dilation[1]);
                    zero_pad(x, rows, cols)
                } else {
                    x
                };
                let [_, _, height, width] = x.dims();
                let reach = [
                    dilation[0] * (kernel_size[0] - 1) + 1,
                    dilation[1] * (kernel_size[1] - 1) + 1,
                ];
                if height < reach[0] || width < reach[1] {
                    return Err(shape_err(format!(
                        "input {height}x{width} is smaller than the kernel {}x{}",
                        reach[0], reach[1]
                    )));
                }
                Activations::Spatial(activate(conv.forward(x), *activation))
            }
            (Op::MaxPool(pool, size), Activations::Spatial(x)) => {
                check_window(&x, *size).map_err(shape_err)?;
                Activations::Spatial(pool.forward(x))
            }
            (Op::AvgPool(pool, size), Activations::Spatial(x)) => {
                check_window(&x, *size).map_err(shape_err)?;
                Activations::Spatial(pool.forward(x))
            }
            (Op::GlobalAvgPool, Activations::Spatial(x)) => {
                let [batch, channels, _, _] = x.dims();
                Activations::Flat(x.mean_dim(3).mean_dim(2).reshape([batch, channels]))
            }
            (Op::GlobalMaxPool, Activations::Spatial(x)) => {
                let [batch, channels, _, _] = x.dims();
                Activations::Flat(x.max_dim(3).max_dim(2).reshape([batch, channels]))
            }
            (Op::Flatten, Activations::Spatial(x)) => {
                let [batch, channels, height, width] = x.dims();
                // channels-last order, as the following Dense kernel was trained on
                Activations::Flat(
                    x.permute([0, 2, 3, 1])
                        .reshape([batch, height * width * channels]),
                )
            }
            (Op::Flatten, Activations::Flat(x)) => Activations::Flat(x),
            (Op::BatchNorm { scale, shift, axis }, Activations::Spatial(x)) => {
                let [_, channels, _, _] = x.dims();
                check_channels(*axis, 3, channels, scale).map_err(shape_err)?;
                let scale = scale.clone().reshape([1, channels, 1, 1]);
                let shift = shift.clone().reshape([1, channels, 1, 1]);
                Activations::Spatial(x.mul(scale).add(shift))
            }
            (Op::BatchNorm { scale, shift, axis }, Activations::Flat(x)) => {
                let [_, features] = x.dims();
                check_channels(*axis, 1, features, scale).map_err(shape_err)?;
                let scale = scale.clone().reshape([1, features]);
                let shift = shift.clone().reshape([1, features]);
                Activations::Flat(x.mul(scale).add(shift))
            }
            (
                Op::Dense {
                    linear,
                    in_features,
                    activation,
                },
                Activations::Flat(x),
            ) => {
                let [_, features] = x.dims();
                if features != *in_features {
                    return Err(shape_err(format!(
                        "expects {in_features} input features, got {features}"
                    )));
                }
                Activations::Flat(activate(linear.forward(x), *activation))
            }
            (Op::Dense { .. }, Activations::Spatial(x)) => {
                return Err(shape_err(format!(
                    "dense layer applied to a {:?} feature map; add Flatten or global pooling",
                    x.dims()
                )))
            }
            (_, Activations::Flat(x)) => {
                return Err(shape_err(format!(
                    "spatial layer applied to a flat tensor {:?}",
                    x.dims()
                )))
            }
        })
    }
}

fn activate<B: Backend, const D: usize>(x: Tensor<B, D>, activation: Activation) -> Tensor<B, D> {
    match activation {
        Activation::Linear => x,
        Activation::Relu => relu(x),
        Activation::Sigmoid => sigmoid(x),
        Activation::Tanh => tanh(x),
        // channel axis in both NCHW and [batch, features]
        Activation::Softmax => softmax(x, 1),
    }
}

/// Padding before and after one spatial axis for Keras `same` convolution.
fn same_padding(size: usize, kernel: usize, stride: usize, dilation: usize) -> (usize, usize) {
    let reach = dilation * (kernel - 1) + 1;
    let out = size.div_ceil(stride);
    let total = ((out.max(1) - 1) * stride + reach).saturating_sub(size);
    (total / 2, total - total / 2)
}

fn zero_pad<B: Backend>(
    x: Tensor<B, 4>,
    (top, bottom): (usize, usize),
    (left, right): (usize, usize),
) -> Tensor<B, 4> {
    if top + bottom + left + right == 0 {
        return x;
    }
    let [batch, channels, height, width] = x.dims();
    let device = x.device();
    Tensor::zeros(
        [batch, channels, height + top + bottom, width + left + right],
        &device,
    )
    .slice_assign(
        [
            0..batch,
            0..channels,
            top..top + height,
            left..left + width,
        ],
        x,
    )
}

/// `last` is the channels-last index of the channel axis for this rank.
fn check_channels<B: Backend>(
    axis: i64,
    last: i64,
    channels: usize,
    scale: &Tensor<B, 1>,
) -> Result<(), String> {
    if axis != -1 && axis != last {
        return Err(format!("cannot normalize over axis {axis}"));
    }
    let [expected] = scale.dims();
    if channels != expected {
        return Err(format!("expects {expected} channels, got {channels}"));
    }
    Ok(())
}

fn check_window<B: Backend>(x: &Tensor<B, 4>, size: [usize; 2]) -> Result<(), String> {
    let [_, _, height, width] = x.dims();
    if height < size[0] || width < size[1] {
        return Err(format!(
            "input {height}x{width} is smaller than the pool window {}x{}",
            size[0], size[1]
        ));
    }
    Ok(())
}

fn weight<'a>(
    artifact: &'a Artifact,
    layer: &str,
    param: &'static str,
) -> Result<&'a WeightTensor, BuildError> {
    artifact
        .weight(layer, param)
        .ok_or_else(|| BuildError::MissingWeight {
            layer: layer.to_string(),
            param,
        })
}

fn to_tensor<B: Backend, const D: usize>(weights: &WeightTensor, device: &B::Device) -> Tensor<B, D> {
    Tensor::from_data(
        TensorData::new(weights.data.clone(), weights.shape.clone()),
        device,
    )
}

fn build_conv<B: Backend>(
    name: &str,
    conv: &Conv2DConfig,
    artifact: &Artifact,
    device: &B::Device,
) -> Result<Op<B>, BuildError> {
    let kernel = weight(artifact, name, "kernel")?;
    let [kh, kw] = conv.kernel_size;

    // Keras kernel layout: [kh, kw, in / groups, filters]
    let group_channels = match kernel.shape.as_slice() {
        [h, w, c, f] if [*h, *w] == conv.kernel_size && *f == conv.filters => *c,
        _ => {
            return Err(BuildError::WeightShape {
                layer: name.to_string(),
                param: "kernel",
                expected: format!("[{kh}, {kw}, in_channels, {}]", conv.filters),
                actual: kernel.shape.clone(),
            })
        }
    };
    if conv.groups == 0 || conv.filters % conv.groups != 0 {
        return Err(BuildError::Invalid {
            layer: name.to_string(),
            what: format!("{} filters cannot be split into {} groups", conv.filters, conv.groups),
        });
    }
    if conv.strides.contains(&0) || conv.dilation_rate.contains(&0) || kh == 0 || kw == 0 {
        return Err(BuildError::Invalid {
            layer: name.to_string(),
            what: "zero-sized kernel, stride or dilation".to_string(),
        });
    }
    let in_channels = group_channels * conv.groups;

    let mut module: Conv2d<B> = Conv2dConfig::new([in_channels, conv.filters], conv.kernel_size)
        .with_stride(conv.strides)
        .with_dilation(conv.dilation_rate)
        .with_groups(conv.groups)
        .with_padding(PaddingConfig2d::Valid)
        .with_bias(conv.use_bias)
        .init(device);

    // burn wants [filters, in / groups, kh, kw]
    let kernel: Tensor<B, 4> = to_tensor(kernel, device);
    module.weight = Param::from_tensor(kernel.permute([3, 2, 0, 1]));
    module.bias = if conv.use_bias {
        Some(Param::from_tensor(bias(name, conv.filters, artifact, device)?))
    } else {
        None
    };

    Ok(Op::Conv2d {
        conv: module,
        in_channels,
        kernel_size: conv.kernel_size,
        strides: conv.strides,
        dilation: conv.dilation_rate,
        same: conv.padding == Padding::Same,
        activation: conv.activation,
    })
}

fn build_dense<B: Backend>(
    name: &str,
    dense: &DenseConfig,
    artifact: &Artifact,
    device: &B::Device,
) -> Result<Op<B>, BuildError> {
    let kernel = weight(artifact, name, "kernel")?;
    let in_features = match kernel.shape.as_slice() {
        [inputs, units] if *units == dense.units => *inputs,
        _ => {
            return Err(BuildError::WeightShape {
                layer: name.to_string(),
                param: "kernel",
                expected: format!("[in_features, {}]", dense.units),
                actual: kernel.shape.clone(),
            })
        }
    };

    let mut linear: Linear<B> = LinearConfig::new(in_features, dense.units)
        .with_bias(dense.use_bias)
        .init(device);
    // Keras and burn share the [in, out] layout
    linear.weight = Param::from_tensor(to_tensor(kernel, device));
    linear.bias = if dense.use_bias {
        Some(Param::from_tensor(bias(name, dense.units, artifact, device)?))
    } else {
        None
    };

    Ok(Op::Dense {
        linear,
        in_features,
        activation: dense.activation,
    })
}

fn build_batch_norm<B: Backend>(
    name: &str,
    bn: &BatchNormConfig,
    artifact: &Artifact,
    device: &B::Device,
) -> Result<Op<B>, BuildError> {
    let mean = vector(artifact, name, "moving_mean", None)?;
    let channels = mean.len();
    let variance = vector(artifact, name, "moving_variance", Some(channels))?;
    let gamma = if bn.scale {
        vector(artifact, name, "gamma", Some(channels))?
    } else {
        vec![1.0; channels]
    };
    let beta = if bn.center {
        vector(artifact, name, "beta", Some(channels))?
    } else {
        vec![0.0; channels]
    };

    let scale: Vec<f32> = gamma
        .iter()
        .zip(&variance)
        .map(|(g, v)| g / (v + bn.epsilon).sqrt())
        .collect();
    let shift: Vec<f32> = beta
        .iter()
        .zip(mean.iter().zip(&scale))
        .map(|(b, (m, s))| b - m * s)
        .collect();

    Ok(Op::BatchNorm {
        scale: Tensor::from_data(TensorData::new(scale, [channels]), device),
        shift: Tensor::from_data(TensorData::new(shift, [channels]), device),
        axis: bn.axis,
    })
}

/// A rank-1 parameter, optionally of a known length.
fn vector(
    artifact: &Artifact,
    layer: &str,
    param: &'static str,
    len: Option<usize>,
) -> Result<Vec<f32>, BuildError> {
    let tensor = weight(artifact, layer, param)?;
    match (tensor.shape.as_slice(), len) {
        ([n], Some(expected)) if *n == expected => Ok(tensor.data.clone()),
        ([_], None) => Ok(tensor.data.clone()),
        _ => Err(BuildError::WeightShape {
            layer: layer.to_string(),
            param,
            expected: len.map_or_else(|| "[channels]".to_string(), |n| format!("[{n}]")),
            actual: tensor.shape.clone(),
        }),
    }
}

fn bias<B: Backend>(
    name: &str,
    units: usize,
    artifact: &Artifact,
    device: &B::Device,
) -> Result<Tensor<B, 1>, BuildError> {
    let bias = weight(artifact, name, "bias")?;
    if bias.shape != [units] {
        return Err(BuildError::WeightShape {
            layer: name.to_string(),
            param: "bias",
            expected: format!("[{units}]"),
            actual: bias.shape.clone(),
        });
    }
    Ok(to_tensor(bias, device))
}
