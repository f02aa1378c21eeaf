use thiserror::Error;

/// Fatal configuration problems. None of these are retried; the caller has to fix the
/// configuration and start again.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ConfigError {
    #[error("input size {0} is not supported, it must be a positive multiple of 64")]
    UnsupportedInputSize(usize),

    #[error("base anchor size must be positive, got {0}")]
    NonPositiveAnchorSize(f32),

    #[error("class count {0} is invalid, at least one foreground class besides background is required")]
    InvalidClassCount(usize),

    #[error("prior box generator produced {expected} anchors but the prediction head emitted {found}")]
    AnchorCountMismatch { expected: usize, found: usize },

    #[error("prediction head emitted {found} class channels, {expected} expected (background is implicit)")]
    ClassChannelMismatch { expected: usize, found: usize },

    #[error("batch holds {images} images but {targets} target sets")]
    BatchSizeMismatch { images: usize, targets: usize },

    #[error("'{0}' is not a COCO category")]
    UnknownCategory(String),

    #[error("invalid learning rate schedule: {0}")]
    InvalidSchedule(String),
}

/// Checks that the anchor dimension of a prediction tensor agrees with the prior boxes.
pub fn check_anchor_count(expected: usize, found: usize) -> Result<(), ConfigError> {
    if expected != found {
        return Err(ConfigError::AnchorCountMismatch { expected, found });
    }

    Ok(())
}
