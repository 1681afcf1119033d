use burn::backend::NdArray;
use image_classifier::cli;
use std::process::ExitCode;

fn main() -> anyhow::Result<ExitCode> {
    cli::init_tracing()?;
    cli::run::<NdArray>(Default::default())
}
