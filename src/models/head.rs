use burn::{
    module::{Module, Param},
    nn::{
        Initializer, PaddingConfig2d,
        conv::{Conv2d, Conv2dConfig},
    },
    tensor::{Tensor, backend::Backend},
};

use crate::levels::ANCHORS_PER_CELL;

/// Prior probability of a foreground class at initialisation.
const PRIOR_PROBABILITY: f64 = 0.01;

/// Per level location and classification convolutions.
///
/// Every level gets its own pair of 3x3 convolutions. The location branch emits `A * 4` channels
/// and the classification branch `A * (num_classes - 1)`, background is never predicted.
///
/// The classification bias starts at `-ln((1 - π) / π)`, a foreground logit of odds `π / (1 - π)`
/// against the implicit zero background logit. Under the softmax over `C` classes every
/// foreground class then starts at
///
/// ```text
///   p = π / (1 + (C - 2) * π)
/// ```
///
/// and the background at `1 - (C - 1) * p`, which keeps the loss of the huge number of
/// background anchors from swamping the first iterations.
///
/// "Focal Loss for Dense Object Detection"
/// Authors: Tsung-Yi Lin, Priya Goyal, Ross Girshick, Kaiming He, Piotr Dollár
/// Link (official): https://arxiv.org/abs/1708.02002
#[derive(Module, Debug)]
pub struct MultiBoxHead<B: Backend> {
    pub loc: Vec<Conv2d<B>>,
    pub conf: Vec<Conv2d<B>>,
    num_classes: usize,
}

impl<B: Backend> MultiBoxHead<B> {
    pub fn new(
        in_channels: usize,
        num_levels: usize,
        num_classes: usize,
        device: &B::Device,
    ) -> Self {
        let conv = |out_channels: usize, bias: f32| {
            let mut conv = Conv2dConfig::new([in_channels, out_channels], [3, 3])
                .with_padding(PaddingConfig2d::Explicit(1, 1))
                .with_initializer(Initializer::Normal {
                    mean: 0.0,
                    std: 0.01,
                })
                .init(device);

            conv.bias = Some(Param::from_tensor(Tensor::full([out_channels], bias, device)));
            conv
        };

        let conf_bias = -((1.0 - PRIOR_PROBABILITY) / PRIOR_PROBABILITY).ln() as f32;

        let loc = (0..num_levels)
            .map(|_| conv(ANCHORS_PER_CELL * 4, 0.0))
            .collect();
        let conf = (0..num_levels)
            .map(|_| conv(ANCHORS_PER_CELL * (num_classes - 1), conf_bias))
            .collect();

        Self {
            loc,
            conf,
            num_classes,
        }
    }

    /// # Returns
    ///
    /// * `(loc, conf)` - `[batch, num_anchors, 4]` and `[batch, num_anchors, num_classes - 1]`,
    ///   anchors ordered by level, row, column and anchor shape.
    pub fn forward(&self, features: Vec<Tensor<B, 4>>) -> (Tensor<B, 3>, Tensor<B, 3>) {
        let mut box_predictors = Vec::with_capacity(features.len());
        let mut class_predictors = Vec::with_capacity(features.len());

        for (i, feature) in features.into_iter().enumerate() {
            box_predictors.push(flatten_anchors(self.loc[i].forward(feature.clone()), 4));
            class_predictors.push(flatten_anchors(
                self.conf[i].forward(feature),
                self.num_classes - 1,
            ));
        }

        (
            Tensor::cat(box_predictors, 1),
            Tensor::cat(class_predictors, 1),
        )
    }
}

/// Reorders a prediction map so anchors line up with the prior boxes.
///
/// B = Batch Size
/// A = Anchor Boxes
/// H = Feature Height
/// W = Feature Width
/// K = Values per anchor
///
/// (B, A * K, H, W) -> (B, H, W, A, K) -> (B, H * W * A, K)
fn flatten_anchors<B: Backend>(pred: Tensor<B, 4>, k: usize) -> Tensor<B, 3> {
    let [batch_size, _, height, width] = pred.dims();

    pred.reshape([
        batch_size as i32,
        -1,
        k as i32,
        height as i32,
        width as i32,
    ])
    .permute([0, 3, 4, 1, 2])
    .reshape([batch_size as i32, -1, k as i32])
}
