use burn::nn::loss::HuberLossConfig;
use burn::prelude::*;

use crate::{
    check_nan,
    codec::BoxCodec,
    error::{ConfigError, check_anchor_count},
    matcher::{GroundTruth, MatchTable, Matcher, with_background},
};

/// Computes the cross-entropy loss for multi-class classification without requiring one-hot
/// encoding similar to how torch cross entropy works.
///
/// # Arguments
/// * `logits` - A 2D tensor of shape `[num_boxes, num_classes]` representing the predicted raw
///   scores (logits) for each class, background included.
/// * `targets` - A 1D tensor of shape `[num_boxes]` containing the integer class labels for each
///   prediction. Each label should be in the range `[0, num_classes - 1]`.
///
/// # Returns
/// A 1D tensor of shape `[num_boxes]` containing the cross-entropy loss for each prediction.
///
/// Further reading:
///
/// Lau, R. (2025, March 5). Cross-Entropy, negative Log-Likelihood, and all that jazz.
///  Towards Data Science.
/// https://towardsdatascience.com/cross-entropy-negative-log-likelihood-and-all-that-jazz-47a95bd2e81/
fn cross_entropy_loss<B: Backend>(logits: Tensor<B, 2>, targets: Tensor<B, 1, Int>) -> Tensor<B, 1> {
    let [box_count] = targets.dims();

    //                        ⎛  exp ⎛x ⎞  ⎞
    //                        ⎜      ⎝ i⎠  ⎟
    //  log(softmax(x)) = log ⎜────────────⎟
    //               i        ⎜___         ⎟
    //                        ⎜╲   exp ⎛x ⎞⎟
    //                        ⎜╱       ⎝ i⎠⎟
    //                        ⎝‾‾‾         ⎠
    let log_probabilities = burn::tensor::activation::log_softmax(logits, 1);
    let targets = targets.reshape([box_count, 1]);

    // loss  = -log ⎛P ⎛y , x ⎞⎞
    //     i        ⎝  ⎝ i   i⎠⎠
    let nll = log_probabilities.gather(1, targets) * -1;

    nll.reshape([box_count])
}

/// Configuration of [`MultiBoxLoss`].
#[derive(Config, Debug)]
pub struct MultiBoxLossConfig {
    /// Number of classes, background included.
    pub num_classes: usize,
    /// Hard negatives kept per positive.
    #[config(default = 3)]
    pub neg_pos_ratio: usize,
    #[config(default = 0.5)]
    pub pos_iou_threshold: f32,
    #[config(default = 0.1)]
    pub variance_center: f32,
    #[config(default = 0.2)]
    pub variance_size: f32,
    /// Assign positives from the quality of the current predictions instead of anchor IoU.
    #[config(default = false)]
    pub mutual_guide: bool,
    #[config(default = 15)]
    pub topk: usize,
    #[config(default = 2.0)]
    pub sigma: f32,
}

impl MultiBoxLossConfig {
    pub fn init(&self) -> Result<MultiBoxLoss, ConfigError> {
        if self.num_classes < 2 {
            return Err(ConfigError::InvalidClassCount(self.num_classes));
        }

        Ok(MultiBoxLoss {
            num_classes: self.num_classes,
            neg_pos_ratio: self.neg_pos_ratio,
            mutual_guide: self.mutual_guide,
            matcher: Matcher {
                pos_iou_threshold: self.pos_iou_threshold,
                topk: self.topk,
                sigma: self.sigma,
            },
            codec: BoxCodec::new((self.variance_center, self.variance_size)),
        })
    }
}

/// Localisation plus classification loss of a single stage anchor detector.
///
/// “SSD: Single Shot MultiBox Detector”
/// Authors: Wei Liu, Dragomir Anguelov, Dumitru Erhan, Christian Szegedy,
///          Scott Reed, Cheng-Yang Fu, Alexander C. Berg
/// Link (official): https://arxiv.org/abs/1512.02325
///
/// Training objective - Pg. 5 Liu et al.
///
/// ```text
///                 ⎛1⎞
/// L(x, c, l, g) = ⎜─⎟ ⋅ (Lconf(x, c)) + α ⋅ Lloc(x, l, g))
///                 ⎝N⎠
/// ```
///
/// The two terms are returned separately and each image is normalised by its own number of
/// positives (at least 1) before averaging over the batch.
#[derive(Debug, Clone)]
pub struct MultiBoxLoss {
    num_classes: usize,
    neg_pos_ratio: usize,
    mutual_guide: bool,
    matcher: Matcher,
    codec: BoxCodec,
}

impl MultiBoxLoss {
    pub fn codec(&self) -> &BoxCodec {
        &self.codec
    }

    /// Computes `(loc_loss, cls_loss)` for a batch.
    ///
    /// # Arguments
    ///
    /// * `loc` - Regression outputs `[batch, num_anchors, 4]`.
    /// * `conf` - Class logits `[batch, num_anchors, num_classes - 1]`.
    /// * `anchors` - Anchors `[num_anchors, 4]` in `cxcywh` format.
    /// * `targets` - One `[num_boxes, 5]` tensor per image, rows `(x1, y1, x2, y2, class)`
    ///   normalised to the input size.
    ///
    /// # Returns
    ///
    /// Both losses as `[1]` tensors, averaged over the batch. An empty batch has zero loss.
    pub fn forward<B: Backend>(
        &self,
        loc: Tensor<B, 3>,
        conf: Tensor<B, 3>,
        anchors: Tensor<B, 2>,
        targets: &[Tensor<B, 2>],
    ) -> Result<(Tensor<B, 1>, Tensor<B, 1>), ConfigError> {
        let [batch_size, num_anchors, _] = loc.dims();
        let [_, conf_anchors, channels] = conf.dims();
        let [anchor_count, _] = anchors.dims();

        check_anchor_count(anchor_count, num_anchors)?;
        check_anchor_count(anchor_count, conf_anchors)?;

        if channels != self.num_classes - 1 {
            return Err(ConfigError::ClassChannelMismatch {
                expected: self.num_classes - 1,
                found: channels,
            });
        }

        if targets.len() != batch_size {
            return Err(ConfigError::BatchSizeMismatch {
                images: batch_size,
                targets: targets.len(),
            });
        }

        if batch_size == 0 {
            let device = &loc.device();
            return Ok((Tensor::zeros([1], device), Tensor::zeros([1], device)));
        }

        let mut loc_b = Vec::with_capacity(batch_size);
        let mut cls_b = Vec::with_capacity(batch_size);

        for (i, target) in targets.iter().enumerate() {
            let loc: Tensor<B, 2> = loc.clone().slice(i).squeeze(0);
            let conf: Tensor<B, 2> = conf.clone().slice(i).squeeze(0);

            let gt = GroundTruth::from_tensor(target.clone(), self.num_classes);
            let table = self.assign(&gt, loc.clone(), conf.clone(), anchors.clone());

            log::debug!(
                "image {}: {} boxes, {} classification and {} regression positives",
                i,
                gt.len(),
                table.num_cls_positives(),
                table.num_loc_positives()
            );

            loc_b.push(self.localization_loss(loc, anchors.clone(), &gt, &table));
            cls_b.push(self.classification_loss(conf, &gt, &table));
        }

        let loc_loss = Tensor::cat(loc_b, 0).mean();
        let cls_loss = Tensor::cat(cls_b, 0).mean();

        check_nan!(loc_loss,);
        check_nan!(cls_loss,);

        Ok((loc_loss, cls_loss))
    }

    fn assign<B: Backend>(
        &self,
        gt: &GroundTruth,
        loc: Tensor<B, 2>,
        conf: Tensor<B, 2>,
        anchors: Tensor<B, 2>,
    ) -> MatchTable {
        if self.mutual_guide {
            let decoded = self.codec.decode(loc.detach(), anchors.clone());
            self.matcher
                .assign_mutual(gt, anchors, decoded, conf.detach())
        } else {
            self.matcher.assign(gt, anchors)
        }
    }

    /// Smooth L1 between the regression outputs of positive anchors and their encoded targets.
    fn localization_loss<B: Backend>(
        &self,
        loc: Tensor<B, 2>,
        anchors: Tensor<B, 2>,
        gt: &GroundTruth,
        table: &MatchTable,
    ) -> Tensor<B, 1> {
        let device = &loc.device();

        let (anchor_idx, gt_idx): (Vec<i64>, Vec<i64>) = table
            .loc_gt
            .iter()
            .enumerate()
            .filter_map(|(a, m)| m.map(|g| (a as i64, g as i64)))
            .unzip();

        if anchor_idx.is_empty() {
            return Tensor::zeros([1], device);
        }

        let npos = anchor_idx.len();
        let anchor_idx = Tensor::<B, 1, Int>::from_ints(anchor_idx.as_slice(), device);
        let gt_idx = Tensor::<B, 1, Int>::from_ints(gt_idx.as_slice(), device);

        let matched_gt = gt.boxes_tensor::<B>(device).select(0, gt_idx);
        let matched_anchors = anchors.select(0, anchor_idx.clone());
        let box_trans = self.codec.encode(matched_gt, matched_anchors);

        let pred_box_loss = HuberLossConfig::new(1.0)
            .init()
            .forward_no_reduction(loc.select(0, anchor_idx), box_trans);

        pred_box_loss.sum() / npos.max(1) as f32
    }

    /// Cross entropy over positives and mined hard negatives.
    ///
    /// Hard negative mining - Pg. 6 Liu et al.
    ///
    /// After the matching step, most of the default boxes are negatives, especially when the
    /// number of possible default boxes is large. Instead of using all the negative examples,
    /// we sort them using the highest confidence loss for each default box and pick the top ones
    /// so that the ratio between the negatives and positives is at most 3:1.
    fn classification_loss<B: Backend>(
        &self,
        conf: Tensor<B, 2>,
        gt: &GroundTruth,
        table: &MatchTable,
    ) -> Tensor<B, 1> {
        let device = &conf.device();
        let [num_anchors, _] = conf.dims();

        let class_targets = table.class_targets(gt);
        let pos_idx: Vec<i64> = class_targets
            .iter()
            .enumerate()
            .filter(|(_, c)| **c > 0)
            .map(|(a, _)| a as i64)
            .collect();

        let npos = pos_idx.len();
        let hard_neg_cnt = (npos * self.neg_pos_ratio).min(num_anchors - npos);

        if npos == 0 {
            return Tensor::zeros([1], device);
        }

        let class_targets = Tensor::<B, 1, Int>::from_ints(class_targets.as_slice(), device);
        let conf_loss = cross_entropy_loss(with_background(conf), class_targets.clone());

        let pos_idx = Tensor::<B, 1, Int>::from_ints(pos_idx.as_slice(), device);
        let mut lconf = conf_loss.clone().select(0, pos_idx).sum();

        if hard_neg_cnt > 0 {
            // Set the labeled positions to NEG INFINITY so only background values sort to the top
            let fg_mask = class_targets.greater_elem(0);
            let hrd_neg_loss = conf_loss.clone().detach().mask_fill(fg_mask, f32::NEG_INFINITY);

            let (_vals, bg_index_map) = hrd_neg_loss.sort_descending_with_indices(0);
            let bg_index_map = bg_index_map.slice(0..hard_neg_cnt);

            lconf = lconf + conf_loss.select(0, bg_index_map).sum();
        }

        lconf / npos as f32
    }
}
