use burn::{prelude::Backend, tensor::Tensor};

use crate::{
    error::ConfigError,
    levels::{ANCHORS_PER_CELL, PyramidLevel},
};

/// Scale multipliers applied to a level's base anchor side.
const SCALES: [f32; 2] = [1.0, std::f32::consts::SQRT_2];

/// Aspect ratios (width / height) emitted for each scale.
const ASPECT_RATIOS: [f32; 3] = [1.0, 2.0, 0.5];

/// Generator of the fixed anchor (prior box) set of one model configuration.
///
/// Anchors tile every pyramid level in a convolutional manner: the centre of each anchor is the
/// centre of a feature map cell, `((c + 0.5) / fw, (r + 0.5) / fh)`, and every cell carries the
/// same six shapes. On level `k` the base side is `base_anchor_size * 2^k` input pixels, so
/// `base_anchor_size` is the side of the smallest anchor on the stride 8 level. The six shapes
/// are the product of two scales `{1, √2}` and three aspect ratios `{1, 2, 1/2}`:
///
/// ```text
///   w = s * scale * √ratio
///   h = s * scale / √ratio
/// ```
///
/// Ordering is level, then row, then column, then shape (scale major, ratio minor), so anchor
/// `i` always names the same box for a given `(base_anchor_size, input_size)`. Coordinates are
/// normalised to the input size and deliberately left unclamped; boxes are clamped after
/// decoding instead.
#[derive(Debug, Clone, PartialEq)]
pub struct PriorBox {
    base_anchor_size: f32,
    input_size: usize,
    levels: Vec<PyramidLevel>,
}

impl PriorBox {
    /// Validates the configuration and prepares the generator.
    ///
    /// # Errors
    ///
    /// * [`ConfigError::UnsupportedInputSize`] when `input_size` is not a positive multiple of
    ///   64.
    /// * [`ConfigError::NonPositiveAnchorSize`] when `base_anchor_size` is not finite and
    ///   positive.
    pub fn new(base_anchor_size: f32, input_size: usize) -> Result<Self, ConfigError> {
        if !(base_anchor_size.is_finite() && base_anchor_size > 0.0) {
            return Err(ConfigError::NonPositiveAnchorSize(base_anchor_size));
        }

        let levels = PyramidLevel::for_input_size(input_size)?;

        Ok(Self {
            base_anchor_size,
            input_size,
            levels,
        })
    }

    pub fn input_size(&self) -> usize {
        self.input_size
    }

    pub fn levels(&self) -> &[PyramidLevel] {
        &self.levels
    }

    /// Number of anchors the generator emits, `Σ fw * fh * 6`.
    pub fn count(&self) -> usize {
        self.levels.iter().map(PyramidLevel::anchor_count).sum()
    }

    /// Widths and heights (normalised) of the six anchor shapes of one level.
    pub fn level_shapes(&self, level: &PyramidLevel) -> [(f32, f32); ANCHORS_PER_CELL] {
        let side = self.base_anchor_size * (1usize << level.index()) as f32
            / self.input_size as f32;

        let mut shapes = [(0.0, 0.0); ANCHORS_PER_CELL];
        let mut i = 0;

        for scale in SCALES {
            for ratio in ASPECT_RATIOS {
                let r = ratio.sqrt();
                shapes[i] = (side * scale * r, side * scale / r);
                i += 1;
            }
        }

        shapes
    }

    /// Produces every anchor as `[cx, cy, w, h]` on the host.
    pub fn anchors(&self) -> Vec<[f32; 4]> {
        let mut anchors = Vec::with_capacity(self.count());

        for level in self.levels.iter() {
            let size = level.feature_size();
            let shapes = self.level_shapes(level);

            for row in 0..size {
                let cy = (row as f32 + 0.5) / size as f32;

                for col in 0..size {
                    let cx = (col as f32 + 0.5) / size as f32;

                    for (w, h) in shapes {
                        anchors.push([cx, cy, w, h]);
                    }
                }
            }
        }

        anchors
    }

    /// Produces every anchor as a `[num_anchors, 4]` tensor in `cxcywh` format.
    pub fn forward<B: Backend>(&self, device: &B::Device) -> Tensor<B, 2> {
        let flat: Vec<f32> = self.anchors().into_iter().flatten().collect();
        let count = flat.len() / 4;

        Tensor::<B, 1>::from_floats(flat.as_slice(), device).reshape([count, 4])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::debug::assert_approx_eq;
    use burn::backend::{NdArray, ndarray::NdArrayDevice};

    #[test]
    fn test_anchor_count_matches_levels() {
        for size in [64, 128, 320, 448, 512, 576, 640] {
            let priors = PriorBox::new(24.0, size).unwrap();

            let expected: usize = priors
                .levels()
                .iter()
                .map(|l| l.feature_size() * l.feature_size())
                .sum::<usize>()
                * 6;

            assert_eq!(priors.anchors().len(), expected);
            assert_eq!(priors.count(), expected);
        }
    }

    #[test]
    fn test_tensor_shape() {
        let device = &NdArrayDevice::default();
        let priors = PriorBox::new(24.0, 320).unwrap();

        let anchors = priors.forward::<NdArray<f32>>(device);

        assert_eq!(anchors.dims(), [12750, 4]);
    }

    #[test]
    fn test_deterministic_ordering() {
        let a = PriorBox::new(24.0, 320).unwrap().anchors();
        let b = PriorBox::new(24.0, 320).unwrap().anchors();

        assert_eq!(a, b);

        // first cell of the first level, all six shapes share its centre
        for anchor in a.iter().take(6) {
            assert_approx_eq(&anchor[0], &(0.5 / 40.0), 1e-7);
            assert_approx_eq(&anchor[1], &(0.5 / 40.0), 1e-7);
        }

        // seventh anchor moves one column to the right, same row
        assert_approx_eq(&a[6][0], &(1.5 / 40.0), 1e-7);
        assert_approx_eq(&a[6][1], &(0.5 / 40.0), 1e-7);

        // first anchor of the second row
        assert_approx_eq(&a[40 * 6][0], &(0.5 / 40.0), 1e-7);
        assert_approx_eq(&a[40 * 6][1], &(1.5 / 40.0), 1e-7);
    }

    #[test]
    fn test_six_distinct_shapes() {
        let priors = PriorBox::new(24.0, 320).unwrap();
        let shapes = priors.level_shapes(&priors.levels()[0]);

        // 24 px on a 320 px input
        let s = 0.075;
        let r2 = std::f32::consts::SQRT_2;

        let expected = [
            (s, s),
            (s * r2, s / r2),
            (s / r2, s * r2),
            (s * r2, s * r2),
            (s * 2.0, s),
            (s, s * 2.0),
        ];

        for ((w, h), (ew, eh)) in shapes.iter().zip(expected.iter()) {
            assert_approx_eq(w, ew, 1e-6);
            assert_approx_eq(h, eh, 1e-6);
        }

        for i in 0..6 {
            for j in (i + 1)..6 {
                assert!(shapes[i] != shapes[j]);
            }
        }
    }

    #[test]
    fn test_level_scaling_doubles() {
        let priors = PriorBox::new(24.0, 320).unwrap();
        let levels = priors.levels();

        let (w0, _) = priors.level_shapes(&levels[0])[0];
        let (w3, _) = priors.level_shapes(&levels[3])[0];

        assert_approx_eq(&(w3 / w0), &8.0, 1e-5);
    }

    #[test]
    fn test_invalid_configuration() {
        assert_eq!(
            PriorBox::new(24.0, 300),
            Err(ConfigError::UnsupportedInputSize(300))
        );
        assert_eq!(
            PriorBox::new(0.0, 320),
            Err(ConfigError::NonPositiveAnchorSize(0.0))
        );
    }
}
