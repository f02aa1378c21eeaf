use crate::error::ConfigError;

/// Number of anchor shapes emitted for every spatial cell of every pyramid level.
pub const ANCHORS_PER_CELL: usize = 6;

/// Stride of the finest pyramid level (level 0).
const BASE_STRIDE_LOG2: u32 = 3;

/// One scale tier of the feature pyramid the detection head predicts from.
///
/// Levels are ordered from the finest (stride 8) to the coarsest. Level `k` has a stride of
/// `2^(3 + k)` pixels and a square feature map of `ceil(input_size / stride)` cells.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PyramidLevel {
    index: usize,
    input_size: usize,
}

impl PyramidLevel {
    /// Returns all pyramid levels for an input resolution, finest first.
    ///
    /// Inputs smaller than 512 pixels use 4 levels (strides 8 to 64), larger inputs add a fifth
    /// level at stride 128.
    pub fn for_input_size(input_size: usize) -> Result<Vec<PyramidLevel>, ConfigError> {
        validate_input_size(input_size)?;

        let count = if input_size < 512 { 4 } else { 5 };

        Ok((0..count)
            .map(|index| PyramidLevel { index, input_size })
            .collect())
    }

    /// Zero-based position of the level in the pyramid.
    pub fn index(&self) -> usize {
        self.index
    }

    /// Spatial stride of the level in input pixels.
    pub fn stride(&self) -> usize {
        1 << (BASE_STRIDE_LOG2 as usize + self.index)
    }

    /// Side length of the (square) feature map of this level.
    pub fn feature_size(&self) -> usize {
        self.input_size.div_ceil(self.stride())
    }

    /// Number of anchors contributed by the level.
    pub fn anchor_count(&self) -> usize {
        self.feature_size() * self.feature_size() * ANCHORS_PER_CELL
    }
}

/// Rejects resolutions the pyramid cannot tile: zero or not a multiple of 64.
pub fn validate_input_size(input_size: usize) -> Result<(), ConfigError> {
    if input_size == 0 || input_size % 64 != 0 {
        return Err(ConfigError::UnsupportedInputSize(input_size));
    }

    Ok(())
}
