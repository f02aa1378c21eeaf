use crate::broadcast;

use burn::{
    prelude::Backend,
    tensor::{Tensor, s},
};

/// Smallest area used as an IoU denominator, keeps zero-area pairs at an IoU of 0.
const MIN_UNION: f32 = 1e-12;

/// Splits a tensor of boxes in any 4 component format (cxcywh, xyxy, ect..) into its columns.
///
/// # Arguments
///
/// * `boxes` - Tensor of shape [num_boxes, 4].
///
/// # Returns
///
/// * Tuple of four tensors `(c1, c2, c3, c4)` each of shape [num_boxes, 1].
pub fn boxes_to_components<B: Backend>(
    boxes: Tensor<B, 2>,
) -> (Tensor<B, 2>, Tensor<B, 2>, Tensor<B, 2>, Tensor<B, 2>) {
    (
        boxes.clone().slice(s![.., 0..1]),
        boxes.clone().slice(s![.., 1..2]),
        boxes.clone().slice(s![.., 2..3]),
        boxes.slice(s![.., 3..4]),
    )
}

/// Converts boxes from center format (cx, cy, w, h) to corner format (x1, y1, x2, y2).
pub fn cxcywh_to_x1y1x2y2<B: Backend>(a: Tensor<B, 2>) -> Tensor<B, 2> {
    let (cx, cy, w, h) = boxes_to_components(a);

    Tensor::cat(
        vec![
            cx.clone() - w.clone() * 0.5,
            cy.clone() - h.clone() * 0.5,
            cx + w * 0.5,
            cy + h * 0.5,
        ],
        1,
    )
}

/// Converts boxes from corner format (x1, y1, x2, y2) to center format (cx, cy, w, h).
pub fn x1y1x2y2_to_cxcywh<B: Backend>(a: Tensor<B, 2>) -> Tensor<B, 2> {
    let (x1, y1, x2, y2) = boxes_to_components(a);

    let w = x2 - x1.clone();
    let h = y2 - y1.clone();
    let cx = x1 + w.clone() * 0.5;
    let cy = y1 + h.clone() * 0.5;

    Tensor::cat(vec![cx, cy, w, h], 1)
}

/// Computes the Intersection over Union (IoU) between two sets of boxes in `xyxy` format.
///
/// IoU is calculated as `intersection_area / union_area`, the union is floored at a tiny
/// positive value so two zero-area boxes give an IoU of 0 rather than NaN.
///
/// # Arguments
/// * `boxes_a` - Tensor of shape `[N, 4]`.
/// * `boxes_b` - Tensor of shape `[M, 4]`.
///
/// # Returns
/// * `Tensor<B, 2>` - IoU matrix of shape `[N, M]` where entry `(i, j)` compares box `i` of
///   the first set with box `j` of the second.
pub fn get_iou<B: Backend>(boxes_a: Tensor<B, 2>, boxes_b: Tensor<B, 2>) -> Tensor<B, 2> {
    let (ax1, ay1, ax2, ay2) = boxes_to_components(boxes_a);
    let (bx1, by1, bx2, by2) = boxes_to_components(boxes_b);

    // Intersection top-left corner, larger of the two x1/y1
    let bx1_row = bx1.clone().reshape([1, -1]);
    let (a, b) = broadcast!(ax1: Tensor<B, 2>, bx1_row: Tensor<2>);
    let x1_max = a.max_pair(b);

    let by1_row = by1.clone().reshape([1, -1]);
    let (a, b) = broadcast!(ay1: Tensor<B, 2>, by1_row: Tensor<2>);
    let y1_max = a.max_pair(b);

    // Intersection bottom-right corner, smaller of the two x2/y2
    let bx2_row = bx2.clone().reshape([1, -1]);
    let (a, b) = broadcast!(ax2: Tensor<B, 2>, bx2_row: Tensor<2>);
    let x2_min = a.min_pair(b);

    let by2_row = by2.clone().reshape([1, -1]);
    let (a, b) = broadcast!(ay2: Tensor<B, 2>, by2_row: Tensor<2>);
    let y2_min = a.min_pair(b);

    let area_a = (ax2 - ax1).clamp_min(0.0) * (ay2 - ay1).clamp_min(0.0);
    let area_b = ((bx2 - bx1).clamp_min(0.0) * (by2 - by1).clamp_min(0.0)).reshape([1, -1]);

    let intersection = (x2_min - x1_max).clamp_min(0.0) * (y2_min - y1_max).clamp_min(0.0);

    let (a, b) = broadcast!(area_a: Tensor<B, 2>, area_b: Tensor<2>);
    let union = (a + b - intersection.clone()).clamp_min(MIN_UNION);

    intersection / union
}

/// Scalar IoU between two `xyxy` boxes, used by the host-side suppression code.
pub fn iou_f32(a: &[f32; 4], b: &[f32; 4]) -> f32 {
    let iw = (a[2].min(b[2]) - a[0].max(b[0])).max(0.0);
    let ih = (a[3].min(b[3]) - a[1].max(b[1])).max(0.0);
    let intersection = iw * ih;

    let area_a = (a[2] - a[0]).max(0.0) * (a[3] - a[1]).max(0.0);
    let area_b = (b[2] - b[0]).max(0.0) * (b[3] - b[1]).max(0.0);

    intersection / (area_a + area_b - intersection).max(MIN_UNION)
}

/// Reads a float tensor back to the host as a flat row-major vector.
///
/// Reading a value back forces a device synchronisation, callers batch their reads.
pub fn to_vec<B: Backend, const D: usize>(t: Tensor<B, D>) -> Vec<f32> {
    t.into_data().iter::<f32>().collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::debug::assert_approx_eq;
    use burn::{
        backend::{NdArray, ndarray::NdArrayDevice},
        tensor::{Tolerance, ops::FloatElem},
    };

    type B = NdArray<f32>;
    type FT = FloatElem<B>;

    #[test]
    fn test_iou() {
        let device = &NdArrayDevice::default();

        let boxes1 = Tensor::<B, 2>::from_data(
            [
                [0.12, 0.15, 0.30, 0.40],
                [0.05, 0.05, 0.25, 0.20],
                [0.33, 0.20, 0.50, 0.45],
                [0.60, 0.10, 0.85, 0.35],
            ],
            device,
        );

        let boxes2 = Tensor::<B, 2>::from_data(
            [
                [0.10, 0.10, 0.30, 0.30],
                [0.20, 0.25, 0.40, 0.45],
                [0.60, 0.50, 0.80, 0.70],
                [0.35, 0.15, 0.55, 0.35],
                [0.50, 0.60, 0.70, 0.80],
                [0.25, 0.40, 0.45, 0.60],
            ],
            device,
        );

        let iou = get_iou(boxes1, boxes2);

        Tensor::<B, 2>::from_data(
            [
                [0.46551722, 0.21428573, 0.0, 0.0, 0.0, 0.0],
                [0.27272725, 0.0, 0.0, 0.0, 0.0, 0.0],
                [0.0, 0.20437954, 0.0, 0.375, 0.0, 0.07843133],
                [0.0, 0.0, 0.0, 0.0, 0.0, 0.0],
            ],
            device,
        )
        .into_data()
        .assert_approx_eq::<FT>(&iou.to_data(), Tolerance::default());
    }

    #[test]
    fn test_iou_zero_area_is_zero() {
        let device = &NdArrayDevice::default();

        let a = Tensor::<B, 2>::from_data([[0.2, 0.2, 0.2, 0.2]], device);
        let b = Tensor::<B, 2>::from_data([[0.2, 0.2, 0.2, 0.2], [0.0, 0.0, 1.0, 1.0]], device);

        let iou = to_vec(get_iou(a, b));

        assert_eq!(iou, vec![0.0, 0.0]);
    }

    #[test]
    fn test_iou_f32_fixed_pair() {
        let iou = iou_f32(&[0.0, 0.0, 10.0, 10.0], &[1.0, 1.0, 11.0, 11.0]);

        // 81 / (100 + 100 - 81)
        assert_approx_eq(&iou, &0.6806723, 1e-6);
        assert_approx_eq(&iou_f32(&[0.0, 0.0, 1.0, 1.0], &[2.0, 2.0, 3.0, 3.0]), &0.0, 1e-9);
    }

    #[test]
    fn test_format_conversions() {
        let device = &NdArrayDevice::default();

        let xyxy = Tensor::<B, 2>::from_data([[0.1, 0.2, 0.5, 0.4]], device);
        let cxcywh = x1y1x2y2_to_cxcywh(xyxy.clone());

        Tensor::<B, 2>::from_data([[0.3, 0.3, 0.4, 0.2]], device)
            .into_data()
            .assert_approx_eq::<FT>(&cxcywh.to_data(), Tolerance::default());

        cxcywh_to_x1y1x2y2(cxcywh)
            .into_data()
            .assert_approx_eq::<FT>(&xyxy.to_data(), Tolerance::default());
    }
}
