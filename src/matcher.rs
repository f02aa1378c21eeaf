use burn::{
    prelude::Backend,
    tensor::{Int, Tensor, activation::softmax},
};

use crate::boxes::{cxcywh_to_x1y1x2y2, get_iou, to_vec};

/// Ground truth of one image with unusable rows removed.
///
/// Rows are `(x1, y1, x2, y2, class_id)` in normalised coordinates. A row is dropped when its
/// box has a non-positive (or non-finite) width or height, or when its class is background or
/// outside `1..num_classes`.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct GroundTruth {
    pub boxes: Vec<[f32; 4]>,
    pub labels: Vec<usize>,
}

impl GroundTruth {
    /// Builds the ground truth from flat `[x1, y1, x2, y2, class]` rows.
    pub fn from_rows(rows: &[f32], num_classes: usize) -> Self {
        let mut gt = GroundTruth::default();

        for row in rows.chunks_exact(5) {
            let bx = [row[0], row[1], row[2], row[3]];
            let (w, h) = (bx[2] - bx[0], bx[3] - bx[1]);

            if !(w.is_finite() && h.is_finite() && w > 0.0 && h > 0.0) {
                log::debug!("skipping degenerate ground truth box {bx:?}");
                continue;
            }

            let class = row[4];
            if !(class >= 1.0 && (class as usize) < num_classes) {
                log::debug!("skipping ground truth box {bx:?} with class {class}");
                continue;
            }

            gt.boxes.push(bx);
            gt.labels.push(class as usize);
        }

        gt
    }

    /// Reads an `[n, 5]` target tensor back to the host.
    pub fn from_tensor<B: Backend>(targets: Tensor<B, 2>, num_classes: usize) -> Self {
        Self::from_rows(&to_vec(targets), num_classes)
    }

    pub fn len(&self) -> usize {
        self.boxes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.boxes.is_empty()
    }

    /// Boxes as an `[n, 4]` tensor in `xyxy` format.
    pub fn boxes_tensor<B: Backend>(&self, device: &B::Device) -> Tensor<B, 2> {
        let flat: Vec<f32> = self.boxes.iter().flatten().copied().collect();

        Tensor::<B, 1>::from_floats(flat.as_slice(), device).reshape([self.len(), 4])
    }

    pub fn labels_tensor<B: Backend>(&self, device: &B::Device) -> Tensor<B, 1, Int> {
        let labels: Vec<i64> = self.labels.iter().map(|&l| l as i64).collect();

        Tensor::<B, 1, Int>::from_ints(labels.as_slice(), device)
    }
}

/// Per anchor assignment of one image.
///
/// `cls_gt[a]` names the ground truth box anchor `a` is a classification positive for, and
/// `loc_gt[a]` the one it regresses towards. Plain IoU matching produces identical columns, the
/// mutual guided assignment may not.
#[derive(Debug, Clone, PartialEq)]
pub struct MatchTable {
    pub cls_gt: Vec<Option<usize>>,
    pub loc_gt: Vec<Option<usize>>,
}

impl MatchTable {
    pub fn unmatched(num_anchors: usize) -> Self {
        Self {
            cls_gt: vec![None; num_anchors],
            loc_gt: vec![None; num_anchors],
        }
    }

    pub fn num_cls_positives(&self) -> usize {
        self.cls_gt.iter().flatten().count()
    }

    pub fn num_loc_positives(&self) -> usize {
        self.loc_gt.iter().flatten().count()
    }

    /// Classification target of every anchor, `0` for background.
    pub fn class_targets(&self, gt: &GroundTruth) -> Vec<i64> {
        self.cls_gt
            .iter()
            .map(|m| m.map_or(0, |g| gt.labels[g] as i64))
            .collect()
    }
}

/// Assigns ground truth boxes to anchors.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Matcher {
    pub pos_iou_threshold: f32,
    pub topk: usize,
    pub sigma: f32,
}

impl Default for Matcher {
    fn default() -> Self {
        Self {
            pos_iou_threshold: 0.5,
            topk: 15,
            sigma: 2.0,
        }
    }
}

impl Matcher {
    /// IoU based assignment.
    ///
    /// Every anchor whose best IoU reaches `pos_iou_threshold` is matched to that ground truth
    /// box, then each ground truth box claims its best anchor even when the IoU is lower. When
    /// two boxes compete for the same anchor the lower box index keeps it and the other claims
    /// its next best anchor, so every box ends up with at least one positive.
    ///
    /// # Arguments
    ///
    /// * `gt` - Filtered ground truth of the image.
    /// * `anchors` - Anchors `[num_anchors, 4]` in `cxcywh` format.
    pub fn assign<B: Backend>(&self, gt: &GroundTruth, anchors: Tensor<B, 2>) -> MatchTable {
        let [num_anchors, _] = anchors.dims();

        if gt.is_empty() {
            return MatchTable::unmatched(num_anchors);
        }

        let device = anchors.device();
        let iou = to_vec(get_iou(
            gt.boxes_tensor::<B>(&device),
            cxcywh_to_x1y1x2y2(anchors),
        ));

        let matches = threshold_assign(&iou, gt.len(), num_anchors, self.pos_iou_threshold);
        let matches = force_match(&iou, gt.len(), num_anchors, matches, false);

        log::debug!(
            "matched {} anchors to {} ground truth boxes",
            matches.iter().flatten().count(),
            gt.len()
        );

        MatchTable {
            cls_gt: matches.clone(),
            loc_gt: matches,
        }
    }

    /// Mutual guided assignment.
    ///
    /// Classification positives are the anchors whose current prediction localises a box
    /// well, regression positives are the anchors whose current classification of the box's
    /// class is confident and that overlap it. For each box the number of positives is the
    /// (floored) sum of its `topk` best qualities, at least one.
    ///
    /// ```text
    ///   Q_cls[g, a] = IoU(G_g, P_a)
    ///   Q_loc[g, a] = min(1, IoU(G_g, D_a) * exp(p(a, L_g) / sigma))
    /// ```
    ///
    /// # Arguments
    ///
    /// * `gt` - Filtered ground truth of the image.
    /// * `anchors` - Anchors `[num_anchors, 4]` in `cxcywh` format.
    /// * `decoded` - Current predictions decoded against the anchors, `[num_anchors, 4]` `xyxy`.
    /// * `conf` - Current class logits `[num_anchors, num_classes - 1]`.
    pub fn assign_mutual<B: Backend>(
        &self,
        gt: &GroundTruth,
        anchors: Tensor<B, 2>,
        decoded: Tensor<B, 2>,
        conf: Tensor<B, 2>,
    ) -> MatchTable {
        let [num_anchors, _] = anchors.dims();

        if gt.is_empty() {
            return MatchTable::unmatched(num_anchors);
        }

        let device = anchors.device();
        let gt_boxes = gt.boxes_tensor::<B>(&device);
        let anchor_iou = get_iou(gt_boxes.clone(), cxcywh_to_x1y1x2y2(anchors));

        // Classify to regress
        let cls_quality = to_vec(get_iou(gt_boxes, decoded));

        // Regress to classify, class probabilities of every anchor for each box's label
        let probs = softmax(with_background(conf), 1);
        let label_probs = probs
            .select(1, gt.labels_tensor::<B>(&device))
            .transpose();
        let loc_quality = to_vec(
            (anchor_iou.clone() * (label_probs / self.sigma).exp()).clamp_max(1.0),
        );

        let anchor_iou = to_vec(anchor_iou);
        let n = gt.len();

        let cls_gt = topk_assign(&cls_quality, n, num_anchors, self.topk);
        let cls_gt = force_match(&anchor_iou, n, num_anchors, cls_gt, true);

        let loc_gt = topk_assign(&loc_quality, n, num_anchors, self.topk);
        let loc_gt = force_match(&anchor_iou, n, num_anchors, loc_gt, true);

        MatchTable { cls_gt, loc_gt }
    }
}

/// Prepends the implicit background logit (always zero) to `[num_anchors, num_classes - 1]`
/// class logits.
pub fn with_background<B: Backend>(conf: Tensor<B, 2>) -> Tensor<B, 2> {
    let [num_anchors, _] = conf.dims();
    let background = Tensor::zeros([num_anchors, 1], &conf.device());

    Tensor::cat(vec![background, conf], 1)
}

/// Index of the largest value in `column` of a row-major `[rows, cols]` matrix, the lowest row
/// wins ties.
fn best_row(values: &[f32], rows: usize, cols: usize, column: usize) -> (usize, f32) {
    let mut best = (0, values[column]);

    for row in 1..rows {
        let v = values[row * cols + column];
        if v > best.1 {
            best = (row, v);
        }
    }

    best
}

fn threshold_assign(iou: &[f32], n: usize, a: usize, threshold: f32) -> Vec<Option<usize>> {
    (0..a)
        .map(|anchor| {
            let (g, v) = best_row(iou, n, a, anchor);
            (v >= threshold).then_some(g)
        })
        .collect()
}

/// Keeps, for every box, the anchors that score best on `quality`.
///
/// Each anchor only counts towards the box it scores highest with, then each box takes its
/// `k = clamp(floor(sum of top-topk qualities), 1, #qualities > 0)` best anchors.
fn topk_assign(quality: &[f32], n: usize, a: usize, topk: usize) -> Vec<Option<usize>> {
    let mut rows: Vec<Vec<(usize, f32)>> = vec![Vec::new(); n];

    for anchor in 0..a {
        let (g, v) = best_row(quality, n, a, anchor);
        if v > 0.0 {
            rows[g].push((anchor, v));
        }
    }

    let mut assigned = vec![None; a];

    for (g, row) in rows.iter_mut().enumerate() {
        if row.is_empty() {
            continue;
        }

        // Stable, equal qualities keep the lower anchor index first
        row.sort_by(|x, y| y.1.total_cmp(&x.1));

        let sum: f32 = row.iter().take(topk).map(|(_, v)| v).sum();
        let k = (sum.floor() as usize).clamp(1, row.len());

        for &(anchor, _) in row.iter().take(k) {
            assigned[anchor] = Some(g);
        }
    }

    assigned
}

/// Gives every box an anchor of its own, walking boxes in index order.
///
/// With `only_missing` boxes that already have a positive are left alone, and an anchor that is
/// the only positive of another box is never taken from it.
fn force_match(
    iou: &[f32],
    n: usize,
    a: usize,
    mut assigned: Vec<Option<usize>>,
    only_missing: bool,
) -> Vec<Option<usize>> {
    let mut counts = vec![0usize; n];
    for g in assigned.iter().flatten() {
        counts[*g] += 1;
    }

    let mut claimed = vec![false; a];

    for g in 0..n {
        if only_missing && counts[g] > 0 {
            continue;
        }

        let row = &iou[g * a..(g + 1) * a];
        let mut order: Vec<usize> = (0..a).collect();
        order.sort_by(|x, y| row[*y].total_cmp(&row[*x]));

        let anchor = order.into_iter().find(|&j| {
            !claimed[j] && !(only_missing && assigned[j].is_some_and(|o| counts[o] == 1))
        });

        let Some(anchor) = anchor else {
            log::debug!("no anchor left for ground truth box {g}");
            continue;
        };

        if let Some(previous) = assigned[anchor] {
            counts[previous] -= 1;
        }

        assigned[anchor] = Some(g);
        counts[g] += 1;
        claimed[anchor] = true;
    }

    assigned
}
