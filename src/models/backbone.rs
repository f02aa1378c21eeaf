use burn::{
    module::Module,
    tensor::{Tensor, backend::Backend},
};

use super::repvgg::RepVggBlock;

/// Turns a batch of images into one feature map per pyramid level.
///
/// Implementations return the maps finest first (stride 8, 16, ...), each with
/// [`FeatureExtractor::out_channels`] channels.
pub trait FeatureExtractor<B: Backend> {
    fn extract(&self, images: Tensor<B, 4>) -> Vec<Tensor<B, 4>>;

    fn out_channels(&self) -> usize;
}

/// Plain VGG style stack of [`RepVggBlock`]s.
///
/// The stem and the first stage bring the input down to stride 4, every following stage halves
/// the resolution once more and emits one pyramid level. A stage is a stride 2 block followed by
/// a stride 1 block, the latter carries the identity branch.
#[derive(Module, Debug)]
pub struct RepVggBackbone<B: Backend> {
    stem: RepVggBlock<B>,
    stages: Vec<Vec<RepVggBlock<B>>>,
    num_levels: usize,
    fea_channel: usize,
}

impl<B: Backend> RepVggBackbone<B> {
    pub fn new(
        stem_channels: usize,
        mid_channels: usize,
        fea_channel: usize,
        num_levels: usize,
        device: &B::Device,
    ) -> Self {
        let stage = |c_in: usize, c_out: usize| {
            vec![
                RepVggBlock::new([c_in, c_out], 2, device),
                RepVggBlock::new([c_out, c_out], 1, device),
            ]
        };

        let mut stages = vec![stage(stem_channels, mid_channels)];
        let mut c_in = mid_channels;

        for _ in 0..num_levels {
            stages.push(stage(c_in, fea_channel));
            c_in = fea_channel;
        }

        Self {
            stem: RepVggBlock::new([3, stem_channels], 2, device),
            stages,
            num_levels,
            fea_channel,
        }
    }

    pub fn is_deployed(&self) -> bool {
        self.stem.is_deployed()
    }

    /// Reparameterises every block, see [`RepVggBlock::into_deploy`].
    pub fn into_deploy(self) -> Self {
        Self {
            stem: self.stem.into_deploy(),
            stages: self
                .stages
                .into_iter()
                .map(|stage| stage.into_iter().map(RepVggBlock::into_deploy).collect())
                .collect(),
            num_levels: self.num_levels,
            fea_channel: self.fea_channel,
        }
    }
}

impl<B: Backend> FeatureExtractor<B> for RepVggBackbone<B> {
    fn extract(&self, images: Tensor<B, 4>) -> Vec<Tensor<B, 4>> {
        let mut x = self.stem.forward(images);
        let mut levels = Vec::with_capacity(self.num_levels);

        for (i, stage) in self.stages.iter().enumerate() {
            x = stage.iter().fold(x, |x, block| block.forward(x));

            // stage 0 ends at stride 4, the rest are pyramid levels
            if i > 0 {
                levels.push(x.clone());
            }
        }

        levels
    }

    fn out_channels(&self) -> usize {
        self.fea_channel
    }
}
