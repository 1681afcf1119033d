use image::{imageops::FilterType, DynamicImage, ImageReader};
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Preprocessed images, NHWC (`[batch, height, width, channels]`), values in
/// `[0, 1]`.
#[derive(Clone, Debug, PartialEq)]
pub struct ImageBatch {
    pub data: Vec<f32>,
    pub shape: [usize; 4],
}

impl ImageBatch {
    /// `[height, width, channels]` of each image in the batch.
    pub fn image_shape(&self) -> [usize; 3] {
        let [_, h, w, c] = self.shape;
        [h, w, c]
    }
}

/// Turns image files into the single-image batches the classifier expects.
#[derive(Clone, Debug)]
pub struct Preprocessor {
    target_size: (u32, u32), // (width, height)
}

impl Default for Preprocessor {
    fn default() -> Self {
        Self::new((224, 224))
    }
}

impl Preprocessor {
    pub fn new(target_size: (u32, u32)) -> Self {
        Self { target_size }
    }

    pub fn target_size(&self) -> (u32, u32) {
        self.target_size
    }

    /// Open an image, sniffing its format from the content.
    pub fn open(path: &Path) -> image::ImageResult<DynamicImage> {
        ImageReader::open(path)?.with_guessed_format()?.decode()
    }

    pub fn load(&self, path: &Path) -> image::ImageResult<ImageBatch> {
        let img = Self::open(path)?;
        Ok(self.preprocess(&img))
    }

    /// Convert to RGB, resize to the target size, scale to `[0, 1]` and add
    /// the batch axis.
    pub fn preprocess(&self, img: &DynamicImage) -> ImageBatch {
        let (width, height) = self.target_size;
        let rgb = img.to_rgb8();
        let resized = image::imageops::resize(&rgb, width, height, FilterType::CatmullRom);

        let data = resized
            .as_raw()
            .iter()
            .map(|&v| v as f32 / 255.0)
            .collect();

        ImageBatch {
            data,
            shape: [1, height as usize, width as usize, 3],
        }
    }
}

#[derive(Debug, Error)]
#[error("cannot read label list '{}': {source}", .path.display())]
pub struct LabelError {
    pub path: PathBuf,
    #[source]
    pub source: std::io::Error,
}

/// Class names in output-index order.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct LabelList(Vec<String>);

impl LabelList {
    pub fn new<S: Into<String>>(labels: impl IntoIterator<Item = S>) -> Self {
        Self(labels.into_iter().map(Into::into).collect())
    }

    /// One label per line, surrounding whitespace trimmed, line order kept.
    pub fn parse(text: &str) -> Self {
        Self(text.lines().map(|line| line.trim().to_string()).collect())
    }

    pub fn load(path: &Path) -> Result<Self, LabelError> {
        let text = std::fs::read_to_string(path).map_err(|source| LabelError {
            path: path.to_path_buf(),
            source,
        })?;
        Ok(Self::parse(&text))
    }

    pub fn get(&self, index: usize) -> Option<&str> {
        self.0.get(index).map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}
