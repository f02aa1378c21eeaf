use burn::tensor::{Tensor, TensorData, backend::Backend};
use image::{RgbImage, imageops};
use rand::{Rng, SeedableRng, rngs::StdRng};

/// Maximum pixel value for a RGB8 pixel
pub const MAX_PIXEL_VAL: f32 = 255.0;

// ImageNet mean and std values
const MEAN: [f32; 3] = [0.485, 0.456, 0.406];
const STD: [f32; 3] = [0.229, 0.224, 0.225];

/// Converts an `image::RgbImage` into a 3-channel tensor in `[C, H, W]` format.
///
/// No scaling is applied; pixel values remain in the `0–255` range.
pub fn rgb_img_as_tensor<B: Backend>(image: &RgbImage, device: &B::Device) -> Tensor<B, 3> {
    let img_vec: Vec<f32> = image.as_raw().iter().map(|&p| p as f32).collect();

    Tensor::<B, 3>::from_data(
        TensorData::new(img_vec, [image.height() as usize, image.width() as usize, 3])
            .convert::<B::FloatElem>(),
        device,
    )
    .permute([2, 0, 1])
}

/// Turns a decoded image into network input.
///
/// The image is resized to `size` x `size` with triangular interpolation, scaled to `[0, 1]` and
/// normalised with the ImageNet statistics:
///
/// ```text
///   input = (pixel / 255 - mean) / std
/// ```
///
/// Boxes given in normalised coordinates are unaffected by the resize.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Preprocess {
    size: usize,
}

impl Preprocess {
    pub fn new(size: usize) -> Self {
        Self { size }
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn resize(&self, image: &RgbImage) -> RgbImage {
        let side = self.size as u32;

        if image.dimensions() == (side, side) {
            return image.clone();
        }

        imageops::resize(image, side, side, imageops::FilterType::Triangle)
    }

    /// `[3, size, size]` normalised image tensor.
    pub fn apply<B: Backend>(&self, image: &RgbImage, device: &B::Device) -> Tensor<B, 3> {
        let mean = Tensor::<B, 1>::from_floats(MEAN, device).reshape([3, 1, 1]);
        let std = Tensor::<B, 1>::from_floats(STD, device).reshape([3, 1, 1]);

        let image = rgb_img_as_tensor::<B>(&self.resize(image), device) / MAX_PIXEL_VAL;

        (image - mean) / std
    }
}

/// Stochastic training augmentations on the host image and its normalised `xyxy` boxes.
#[derive(Debug, Clone)]
pub struct Augment<R = StdRng>
where
    R: Rng,
{
    rng: R,
    /// Probability of a horizontal flip.
    pub flip_p: f32,
    /// Probability of a brightness change.
    pub brightness_p: f32,
    /// Largest brightness offset added to every channel.
    pub max_brightness: i32,
}

impl Augment<StdRng> {
    pub fn from_seed(seed: u64) -> Self {
        Self::new_seeded(StdRng::seed_from_u64(seed))
    }
}

impl<R: Rng> Augment<R> {
    /// Augmentations driven by an explicit RNG, for reproducible pipelines.
    pub fn new_seeded(rng: R) -> Self {
        Self {
            rng,
            flip_p: 0.5,
            brightness_p: 0.5,
            max_brightness: 32,
        }
    }

    /// `true` with probability `p`, clamped to `[0, 1]`.
    pub fn should_apply(&mut self, p: f32) -> bool {
        self.rng.random::<f32>() < p.clamp(0.0, 1.0)
    }

    /// Mirrors the image left to right with probability `flip_p`.
    pub fn random_horizontal_flip(&mut self, image: RgbImage, boxes: &mut [[f32; 4]]) -> RgbImage {
        if !self.should_apply(self.flip_p) {
            return image;
        }

        horizontal_flip(image, boxes)
    }

    /// Adds a uniform offset in `[-max_brightness, max_brightness]` with probability
    /// `brightness_p`. Boxes are not affected.
    pub fn random_brightness(&mut self, image: RgbImage) -> RgbImage {
        if self.max_brightness <= 0 || !self.should_apply(self.brightness_p) {
            return image;
        }

        let value = self
            .rng
            .random_range(-self.max_brightness..=self.max_brightness);

        imageops::colorops::brighten(&image, value)
    }

    pub fn apply(&mut self, image: RgbImage, boxes: &mut [[f32; 4]]) -> RgbImage {
        let image = self.random_horizontal_flip(image, boxes);
        self.random_brightness(image)
    }
}

/// Mirrors the image left to right and the normalised `xyxy` boxes with it.
pub fn horizontal_flip(image: RgbImage, boxes: &mut [[f32; 4]]) -> RgbImage {
    for b in boxes.iter_mut() {
        let [x1, y1, x2, y2] = *b;
        *b = [1.0 - x2, y1, 1.0 - x1, y2];
    }

    imageops::flip_horizontal(&image)
}
