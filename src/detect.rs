use burn::{
    prelude::*,
    tensor::activation::softmax,
};

use crate::{
    boxes::to_vec,
    codec::BoxCodec,
    error::{ConfigError, check_anchor_count},
    matcher::with_background,
    nms::{BoundingBox, cap_per_image, nms},
};

/// Configuration of [`Detect`].
#[derive(Config, Debug)]
pub struct DetectConfig {
    /// Number of classes, background included.
    pub num_classes: usize,
    #[config(default = 0.005)]
    pub score_threshold: f32,
    #[config(default = 0.5)]
    pub nms_threshold: f32,
    /// Detections kept per image over all classes.
    ///
    /// The `max_per_image`-th best score is a threshold and boxes tied with it are all kept, so
    /// the cap is only exact when scores are distinct. An untrained model with uniform logits
    /// scores every anchor the same and keeps everything above `score_threshold`.
    #[config(default = 300)]
    pub max_per_image: usize,
    #[config(default = 0.1)]
    pub variance_center: f32,
    #[config(default = 0.2)]
    pub variance_size: f32,
}

impl DetectConfig {
    pub fn init(&self) -> Result<Detect, ConfigError> {
        if self.num_classes < 2 {
            return Err(ConfigError::InvalidClassCount(self.num_classes));
        }

        Ok(Detect {
            num_classes: self.num_classes,
            score_threshold: self.score_threshold,
            nms_threshold: self.nms_threshold,
            max_per_image: self.max_per_image,
            codec: BoxCodec::new((self.variance_center, self.variance_size)),
        })
    }
}

/// Final detections of one image, grouped by class id.
///
/// Index 0 (background) is always empty. Coordinates are normalised to `[0, 1]` until
/// [`Detections::rescale`] is applied.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Detections {
    pub classes: Vec<Vec<BoundingBox>>,
}

impl Detections {
    pub fn len(&self) -> usize {
        self.classes.iter().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn iter(&self) -> impl Iterator<Item = &BoundingBox> {
        self.classes.iter().flatten()
    }

    /// Converts the boxes to pixel coordinates of an image of `width` x `height`.
    pub fn rescale(&self, width: u32, height: u32) -> Detections {
        let (sx, sy) = (width as f32, height as f32);

        Detections {
            classes: self
                .classes
                .iter()
                .map(|class| class.iter().map(|b| b.scale(sx, sy)).collect())
                .collect(),
        }
    }
}

/// Turns raw head outputs into per class detections.
///
/// The object detection model generates a box for every anchor, each with a score per class.
/// Most of them describe background or are duplicates of one another, so per image the boxes
/// are decoded and clamped to the image, scored with a softmax over all classes (the background
/// logit is implicit and always zero), thresholded per class, suppressed per class and finally
/// capped.
#[derive(Debug, Clone)]
pub struct Detect {
    num_classes: usize,
    score_threshold: f32,
    nms_threshold: f32,
    max_per_image: usize,
    codec: BoxCodec,
}

impl Detect {
    /// # Arguments
    ///
    /// * `loc` - Regression outputs `[batch, num_anchors, 4]`.
    /// * `conf` - Class logits `[batch, num_anchors, num_classes - 1]`.
    /// * `anchors` - Anchors `[num_anchors, 4]` in `cxcywh` format.
    pub fn forward<B: Backend>(
        &self,
        loc: Tensor<B, 3>,
        conf: Tensor<B, 3>,
        anchors: Tensor<B, 2>,
    ) -> Result<Vec<Detections>, ConfigError> {
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

        let mut out = Vec::with_capacity(batch_size);

        for i in 0..batch_size {
            let loc: Tensor<B, 2> = loc.clone().slice(i).squeeze(0);
            let conf: Tensor<B, 2> = conf.clone().slice(i).squeeze(0);

            let boxes = to_vec(self.codec.decode(loc, anchors.clone()).clamp(0.0, 1.0));
            let scores = to_vec(softmax(with_background(conf), 1));

            out.push(self.detect_image(&boxes, &scores, num_anchors));
        }

        Ok(out)
    }

    fn detect_image(&self, boxes: &[f32], scores: &[f32], num_anchors: usize) -> Detections {
        let mut classes = vec![Vec::new(); self.num_classes];

        for (cls_id, class) in classes.iter_mut().enumerate().skip(1) {
            let candidates: Vec<BoundingBox> = (0..num_anchors)
                .filter_map(|a| {
                    let score = scores[a * self.num_classes + cls_id];
                    (score > self.score_threshold).then(|| {
                        let b = &boxes[a * 4..a * 4 + 4];
                        BoundingBox::new([b[0], b[1], b[2], b[3]], score, cls_id)
                    })
                })
                .collect();

            *class = nms(candidates, self.nms_threshold);
        }

        cap_per_image(&mut classes, self.max_per_image);

        let detections = Detections { classes };
        log::debug!("{} detections after suppression", detections.len());

        detections
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{boxes::cxcywh_to_x1y1x2y2, priors::PriorBox};
    use burn::backend::{NdArray, ndarray::NdArrayDevice};

    type B = NdArray<f32>;

    #[test]
    fn test_single_confident_anchor() {
        let device = &NdArrayDevice::default();
        let anchors = PriorBox::new(24.0, 64).unwrap().forward::<B>(device);
        let [a, _] = anchors.dims();

        let detect = DetectConfig::new(4).init().unwrap();

        // every anchor is confidently background except one voting for class 2
        let target = 37;
        let mut logits = vec![-10.0f32; a * 3];
        logits[target * 3 + 1] = 10.0;

        let conf = Tensor::<B, 1>::from_floats(logits.as_slice(), device).reshape([1, a, 3]);
        let loc = Tensor::<B, 3>::zeros([1, a, 4], device);

        let dets = detect.forward(loc, conf, anchors.clone()).unwrap();

        assert_eq!(dets.len(), 1);
        assert_eq!(dets[0].len(), 1);
        assert!(dets[0].classes[0].is_empty());

        let det = dets[0].classes[2][0];
        assert_eq!(det.cls_id, 2);
        assert!(det.score > 0.99);

        let anchor = to_vec(cxcywh_to_x1y1x2y2(anchors).clamp(0.0, 1.0));
        let expected = &anchor[target * 4..target * 4 + 4];
        for (a, b) in det.corners().iter().zip(expected) {
            assert!((a - b).abs() < 1e-5);
        }
    }

    #[test]
    fn test_boxes_are_clamped() {
        let device = &NdArrayDevice::default();
        let anchors = Tensor::<B, 2>::from_data([[0.05, 0.95, 0.3, 0.3]], device);

        let detect = DetectConfig::new(2).init().unwrap();
        let loc = Tensor::<B, 3>::zeros([1, 1, 4], device);
        let conf = Tensor::<B, 3>::from_data([[[5.0]]], device);

        let dets = detect.forward(loc, conf, anchors).unwrap();
        let det = dets[0].classes[1][0];

        assert_eq!(det.x1, 0.0);
        assert_eq!(det.y2, 1.0);
    }

    #[test]
    fn test_cap_applies_across_classes() {
        let device = &NdArrayDevice::default();
        let anchors = PriorBox::new(24.0, 64).unwrap().forward::<B>(device);
        let [a, _] = anchors.dims();

        let detect = DetectConfig::new(4)
            .with_max_per_image(10)
            .with_nms_threshold(1.1)
            .init()
            .unwrap();

        let loc = Tensor::<B, 3>::zeros([1, a, 4], device);
        let conf = Tensor::<B, 3>::zeros([1, a, 3], device);

        let dets = detect.forward(loc, conf, anchors).unwrap();

        // every anchor scores 0.25 in every class, all tied with the threshold score
        assert_eq!(dets[0].len(), a * 3);

        let detect = DetectConfig::new(4)
            .with_score_threshold(0.3)
            .init()
            .unwrap();
        let loc = Tensor::<B, 3>::zeros([1, a, 4], device);
        let conf = Tensor::<B, 3>::zeros([1, a, 3], device);
        let anchors = PriorBox::new(24.0, 64).unwrap().forward::<B>(device);

        assert!(detect.forward(loc, conf, anchors).unwrap()[0].is_empty());
    }

    #[test]
    fn test_rescale() {
        let dets = Detections {
            classes: vec![
                vec![],
                vec![BoundingBox::new([0.1, 0.2, 0.5, 1.0], 0.9, 1)],
            ],
        };

        let px = dets.rescale(200, 100);
        let b = px.classes[1][0];

        assert_eq!(b.corners(), [20.0, 20.0, 100.0, 100.0]);
        assert_eq!(b.score, 0.9);
    }

    #[test]
    fn test_configuration_errors() {
        let device = &NdArrayDevice::default();

        assert_eq!(
            DetectConfig::new(0).init().unwrap_err(),
            ConfigError::InvalidClassCount(0)
        );

        let detect = DetectConfig::new(3).init().unwrap();
        let anchors = Tensor::<B, 2>::zeros([4, 4], device);

        let err = detect
            .forward(
                Tensor::<B, 3>::zeros([1, 5, 4], device),
                Tensor::<B, 3>::zeros([1, 5, 2], device),
                anchors,
            )
            .unwrap_err();

        assert_eq!(
            err,
            ConfigError::AnchorCountMismatch {
                expected: 4,
                found: 5
            }
        );
    }
}
