use image::{Rgb, RgbImage};
use image_classifier::loader::artifact::{Artifact, WeightTensor};
use serde_json::{json, Value};
use std::path::{Path, PathBuf};
use std::process::{Command, Output};

pub const LABELS: &str = "cat\ndog\nfish\n";

/// Averages each colour channel and maps red to "dog", green to "cat" and
/// blue to "fish".
pub fn colour_model(config: Value) -> Artifact {
    #[rustfmt::skip]
    let kernel = vec![
        0.0, 5.0, 0.0,
        5.0, 0.0, 0.0,
        0.0, 0.0, 5.0,
    ];
    Artifact::new(config)
        .with_keras_version("2.15.0")
        .with_tensor("predictions/kernel", WeightTensor::new(vec![3, 3], kernel))
        .with_tensor("predictions/bias", WeightTensor::new(vec![3], vec![0.0; 3]))
}

pub fn keras2_config() -> Value {
    json!({"class_name": "Sequential", "config": {"name": "colours", "layers": [
        {"class_name": "InputLayer", "config": {"name": "input_1", "batch_input_shape": [null, 224, 224, 3], "dtype": "float32"}},
        {"class_name": "GlobalAveragePooling2D", "config": {"name": "pool", "dtype": "float32", "data_format": "channels_last"}},
        {"class_name": "Dense", "config": {"name": "predictions", "units": 3, "activation": "softmax", "use_bias": true}}
    ]}})
}

pub fn keras3_config() -> Value {
    let policy = json!({"module": "keras", "class_name": "DTypePolicy", "config": {"name": "float32"}, "registered_name": null});
    json!({"module": "keras", "class_name": "Sequential", "registered_name": null, "config": {
        "name": "colours", "trainable": true, "dtype": policy,
        "layers": [
            {"module": "keras.layers", "class_name": "InputLayer", "registered_name": null,
             "config": {"name": "input_layer", "batch_shape": [null, 224, 224, 3], "dtype": "float32", "sparse": false}},
            {"module": "keras.layers", "class_name": "GlobalAveragePooling2D", "registered_name": null,
             "config": {"name": "pool", "dtype": policy, "data_format": "channels_last", "keepdims": false},
             "build_config": {"input_shape": [null, 224, 224, 3]}},
            {"module": "keras.layers", "class_name": "Dense", "registered_name": null,
             "config": {"name": "predictions", "units": 3, "activation": "softmax", "use_bias": true, "dtype": policy},
             "build_config": {"input_shape": [null, 3]}}
        ]},
        "build_config": {"input_shape": [null, 224, 224, 3]},
        "compile_config": null
    })
}

pub fn write_image(dir: &Path, name: &str, colour: [u8; 3]) -> PathBuf {
    let path = dir.join(name);
    RgbImage::from_pixel(64, 48, Rgb(colour)).save(&path).unwrap();
    path
}

/// A working directory holding the default model and label files.
pub fn workspace() -> tempfile::TempDir {
    let dir = tempfile::tempdir().unwrap();
    colour_model(keras2_config())
        .save(dir.path().join("trained_model.safetensors"))
        .unwrap();
    std::fs::write(dir.path().join("class_names.txt"), LABELS).unwrap();
    dir
}

pub fn classify(dir: &Path, args: &[&str]) -> Command {
    let mut cmd = Command::new(env!("CARGO_BIN_EXE_classify"));
    cmd.current_dir(dir)
        .args(args)
        .env_remove("MODEL_FILE")
        .env_remove("CLASS_FILE")
        .env("RUST_LOG", "warn");
    cmd
}

pub fn stdout_lines(output: &Output) -> Vec<String> {
    String::from_utf8_lossy(&output.stdout)
        .lines()
        .map(str::to_string)
        .collect()
}
