use burn::{prelude::*, tensor::Tensor};

use crate::{error::ConfigError, priors::PriorBox};

use super::{
    backbone::{FeatureExtractor, RepVggBackbone},
    head::MultiBoxHead,
    neck::{FeatureFusion, Neck, NeckKind},
};

#[derive(Config, Debug)]
pub struct DetectorConfig {
    /// Number of classes, background included.
    pub num_classes: usize,
    #[config(default = 320)]
    pub input_size: usize,
    /// Side in pixels of the smallest anchor, on the stride 8 level.
    #[config(default = 24.0)]
    pub base_anchor_size: f32,
    #[config(default = 32)]
    pub stem_channels: usize,
    #[config(default = 64)]
    pub mid_channels: usize,
    /// Channels of every pyramid level fed to the head.
    #[config(default = 128)]
    pub fea_channel: usize,
    #[config(default = "NeckKind::Fpn")]
    pub neck: NeckKind,
    /// Build the reparameterised inference form, the layout of exported weights.
    #[config(default = false)]
    pub deploy: bool,
}

impl DetectorConfig {
    /// Validates the configuration and builds a freshly initialised detector.
    pub fn init<B: Backend>(&self, device: &B::Device) -> Result<Detector<B>, ConfigError> {
        if self.num_classes < 2 {
            return Err(ConfigError::InvalidClassCount(self.num_classes));
        }

        let priors = PriorBox::new(self.base_anchor_size, self.input_size)?;
        let num_levels = priors.levels().len();

        log::info!(
            "building detector: {} px input, {} levels, {} anchors, {} classes, {:?} neck{}",
            self.input_size,
            num_levels,
            priors.count(),
            self.num_classes,
            self.neck,
            if self.deploy { ", deploy form" } else { "" }
        );

        let backbone = RepVggBackbone::new(
            self.stem_channels,
            self.mid_channels,
            self.fea_channel,
            num_levels,
            device,
        );
        let neck = Neck::new(&self.neck, backbone.out_channels(), num_levels, device);
        let head = MultiBoxHead::new(
            backbone.out_channels(),
            num_levels,
            self.num_classes,
            device,
        );

        let detector = Detector {
            backbone,
            neck,
            head,
            input_size: self.input_size,
            base_anchor_size: self.base_anchor_size,
        };

        Ok(if self.deploy {
            detector.into_deploy()
        } else {
            detector
        })
    }
}

/// Backbone, neck and detection head.
#[derive(Module, Debug)]
pub struct Detector<B: Backend> {
    backbone: RepVggBackbone<B>,
    neck: Neck<B>,
    head: MultiBoxHead<B>,
    input_size: usize,
    base_anchor_size: f32,
}

impl<B: Backend> Detector<B> {
    /// # Arguments
    ///
    /// * `images` - Normalised images `[batch, 3, input_size, input_size]`.
    ///
    /// # Returns
    ///
    /// * `(loc, conf)` - `[batch, num_anchors, 4]` regression outputs and
    ///   `[batch, num_anchors, num_classes - 1]` class logits.
    pub fn forward(&self, images: Tensor<B, 4>) -> (Tensor<B, 3>, Tensor<B, 3>) {
        let features = self.neck.fuse(self.backbone.extract(images));
        self.head.forward(features)
    }

    pub fn input_size(&self) -> usize {
        self.input_size
    }

    /// Anchor generator matching the head's output layout.
    pub fn priors(&self) -> Result<PriorBox, ConfigError> {
        PriorBox::new(self.base_anchor_size, self.input_size)
    }

    /// Whether the backbone already runs as plain convolutions.
    pub fn is_deployed(&self) -> bool {
        self.backbone.is_deployed()
    }

    /// Reparameterises the backbone for inference.
    pub fn into_deploy(self) -> Self {
        Self {
            backbone: self.backbone.into_deploy(),
            ..self
        }
    }
}
