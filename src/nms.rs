//! Greedy non-maximum suppression and the per image detection cap.

use crate::boxes::iou_f32;

/// A scored detection in `xyxy` format.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BoundingBox {
    pub x1: f32,
    pub y1: f32,
    pub x2: f32,
    pub y2: f32,
    pub score: f32,
    pub cls_id: usize,
}

impl BoundingBox {
    pub fn new(corners: [f32; 4], score: f32, cls_id: usize) -> Self {
        let [x1, y1, x2, y2] = corners;

        Self {
            x1,
            y1,
            x2,
            y2,
            score,
            cls_id,
        }
    }

    pub fn corners(&self) -> [f32; 4] {
        [self.x1, self.y1, self.x2, self.y2]
    }

    pub fn iou(&self, other: &BoundingBox) -> f32 {
        iou_f32(&self.corners(), &other.corners())
    }

    /// Scales the corners, e.g. from normalised coordinates to pixels.
    pub fn scale(&self, sx: f32, sy: f32) -> Self {
        Self {
            x1: self.x1 * sx,
            y1: self.y1 * sy,
            x2: self.x2 * sx,
            y2: self.y2 * sy,
            ..*self
        }
    }
}

/// Greedy non-maximum suppression over the boxes of one class.
///
/// Boxes are visited by descending score, equal scores keep their input order. A box is kept
/// unless it overlaps an already kept box with an IoU of at least `iou_threshold`. Running the
/// suppression again on its own output returns it unchanged.
pub fn nms(mut boxes: Vec<BoundingBox>, iou_threshold: f32) -> Vec<BoundingBox> {
    // sort_by is stable
    boxes.sort_by(|a, b| b.score.total_cmp(&a.score));

    let mut keep: Vec<BoundingBox> = Vec::with_capacity(boxes.len());

    for candidate in boxes {
        if keep.iter().all(|k| k.iou(&candidate) < iou_threshold) {
            keep.push(candidate);
        }
    }

    keep
}

/// Limits the detections of one image to `max_per_image` across all classes.
///
/// When more boxes survive, the `max_per_image`-th highest score becomes a threshold and every
/// box scoring strictly below it is dropped. Boxes tied with the threshold score are all kept.
pub fn cap_per_image(classes: &mut [Vec<BoundingBox>], max_per_image: usize) {
    let total: usize = classes.iter().map(Vec::len).sum();

    if total <= max_per_image {
        return;
    }

    if max_per_image == 0 {
        classes.iter_mut().for_each(Vec::clear);
        return;
    }

    let mut scores: Vec<f32> = classes.iter().flatten().map(|b| b.score).collect();
    scores.sort_by(|a, b| b.total_cmp(a));

    let threshold = scores[max_per_image - 1];

    for class in classes.iter_mut() {
        class.retain(|b| b.score >= threshold);
    }
}
