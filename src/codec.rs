use burn::{prelude::Backend, tensor::Tensor};

use crate::{
    boxes::{boxes_to_components, cxcywh_to_x1y1x2y2, x1y1x2y2_to_cxcywh},
    check_nan,
};

/// Largest exponent applied when decoding a width or height, `ln(1000 / 16)`.
///
/// An untrained head can emit arbitrary offsets and `exp` overflows to `inf` quickly.
pub const BBOX_XFORM_CLIP: f32 = 4.135_166_7;

/// Floor for sizes before dividing or taking a log.
const MIN_SIZE: f32 = 1e-12;

/// Encodes boxes relative to anchors and decodes regression outputs back into boxes.
///
/// The parameterisation is the SSD one: centre offsets are measured in anchor widths, sizes
/// in log space, and both are divided by a variance so the regression targets have roughly
/// unit scale.
///
/// ```text
///   tx = (gx - ax) / aw / v0        gx = tx * v0 * aw + ax
///   ty = (gy - ay) / ah / v0        gy = ty * v0 * ah + ay
///   tw = log(gw / aw) / v1          gw = aw * exp(tw * v1)
///   th = log(gh / ah) / v1          gh = ah * exp(th * v1)
/// ```
///
/// Relevant excerpt from
///
/// "Faster R-CNN: Towards Real-Time Object Detection with Region Proposal Networks"
/// Authors: Shaoqing Ren, Kaiming He, Ross Girshick, Jian Sun
/// Paper: https://arxiv.org/abs/1506.01497
///
/// 3.1.2 Loss Function
///
/// This can be thought of as bounding-box regression from an anchor box to a nearby
/// ground-truth box.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BoxCodec {
    pub variance: (f32, f32),
}

impl Default for BoxCodec {
    fn default() -> Self {
        Self {
            variance: (0.1, 0.2),
        }
    }
}

impl BoxCodec {
    pub fn new(variance: (f32, f32)) -> Self {
        Self { variance }
    }

    /// Computes regression targets for ground truth boxes against their anchors.
    ///
    /// # Arguments
    ///
    /// * `gt` - Ground truth boxes `[num_boxes, 4]` in `xyxy` format.
    /// * `anchors` - Anchors `[num_boxes, 4]` in `cxcywh` format, row `i` pairs with `gt` row
    ///   `i`.
    ///
    /// # Returns
    ///
    /// * `Tensor<B, 2>` - Targets `[num_boxes, 4]`. Rows whose ground truth or anchor has a
    ///   non-positive width or height are all zero instead of `NaN`/`inf`.
    pub fn encode<B: Backend>(&self, gt: Tensor<B, 2>, anchors: Tensor<B, 2>) -> Tensor<B, 2> {
        let (v0, v1) = self.variance;

        let (gx, gy, gw, gh) = boxes_to_components(x1y1x2y2_to_cxcywh(gt));
        let (ax, ay, aw, ah) = boxes_to_components(anchors);

        let degenerate = gw
            .clone()
            .min_pair(gh.clone())
            .min_pair(aw.clone())
            .min_pair(ah.clone())
            .lower_equal_elem(0.0);

        // Keep every division and log well defined, the degenerate rows are zeroed below.
        let gw = gw.clamp_min(MIN_SIZE);
        let gh = gh.clamp_min(MIN_SIZE);
        let aw = aw.clamp_min(MIN_SIZE);
        let ah = ah.clamp_min(MIN_SIZE);

        let tx = (gx - ax) / aw.clone() / v0;
        let ty = (gy - ay) / ah.clone() / v0;
        let tw = (gw / aw).log() / v1;
        let th = (gh / ah).log() / v1;

        let targets = Tensor::cat(vec![tx, ty, tw, th], 1).mask_fill(degenerate.repeat_dim(1, 4), 0.0);

        check_nan!(targets,);

        targets
    }

    /// Applies regression outputs to anchors, producing boxes in `xyxy` format.
    ///
    /// The size exponent is clamped to [`BBOX_XFORM_CLIP`] before `exp`, so garbage logits from
    /// an untrained network decode to large but finite boxes.
    ///
    /// # Arguments
    ///
    /// * `offsets` - Regression outputs `[num_boxes, 4]`.
    /// * `anchors` - Anchors `[num_boxes, 4]` in `cxcywh` format.
    pub fn decode<B: Backend>(&self, offsets: Tensor<B, 2>, anchors: Tensor<B, 2>) -> Tensor<B, 2> {
        let (v0, v1) = self.variance;

        let (ax, ay, aw, ah) = boxes_to_components(anchors);
        let (tx, ty, tw, th) = boxes_to_components(offsets);

        let cx = tx * v0 * aw.clone() + ax;
        let cy = ty * v0 * ah.clone() + ay;
        let w = (tw * v1).clamp_max(BBOX_XFORM_CLIP).exp() * aw;
        let h = (th * v1).clamp_max(BBOX_XFORM_CLIP).exp() * ah;

        cxcywh_to_x1y1x2y2(Tensor::cat(vec![cx, cy, w, h], 1))
    }
}
