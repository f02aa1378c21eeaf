use burn::{
    backend::{NdArray, ndarray::NdArrayDevice},
    tensor::{Int, Tensor, cast::ToElement},
};
use rust_mutual_guide::{
    boxes::{iou_f32, to_vec},
    codec::BoxCodec,
    detect::DetectConfig,
    loss::MultiBoxLossConfig,
    matcher::{GroundTruth, Matcher},
    models::detector::DetectorConfig,
    priors::PriorBox,
};

type B = NdArray<f32>;

const SIZE: f32 = 320.0;
const NUM_CLASSES: usize = 4;

fn gt_box() -> [f32; 4] {
    [50.0 / SIZE, 50.0 / SIZE, 150.0 / SIZE, 150.0 / SIZE]
}

fn targets(device: &NdArrayDevice) -> Tensor<B, 2> {
    let [x1, y1, x2, y2] = gt_box();
    Tensor::from_floats([[x1, y1, x2, y2, 3.0]], device)
}

#[test]
fn single_object_train_and_detect() {
    let device = &NdArrayDevice::default();

    let anchors = PriorBox::new(24.0, 320).unwrap().forward::<B>(device);
    let [num_anchors, _] = anchors.dims();

    // matching
    let gt = GroundTruth::from_tensor(targets(device), NUM_CLASSES);
    let table = Matcher::default().assign(&gt, anchors.clone());

    assert!(table.num_cls_positives() > 0);
    let matched = table
        .cls_gt
        .iter()
        .position(|m| *m == Some(0))
        .expect("the ground truth box has a positive anchor");

    // loss of an untrained prediction
    let loss = MultiBoxLossConfig::new(NUM_CLASSES).init().unwrap();
    let (loc_loss, cls_loss) = loss
        .forward(
            Tensor::<B, 3>::zeros([1, num_anchors, 4], device),
            Tensor::<B, 3>::zeros([1, num_anchors, NUM_CLASSES - 1], device),
            anchors.clone(),
            &[targets(device)],
        )
        .unwrap();

    let total = (loc_loss + cls_loss).into_scalar().to_f32();
    assert!(total.is_finite());
    assert!(total > 0.0);

    // a perfect prediction on the matched anchor, confident background everywhere else
    let index = Tensor::<B, 1, Int>::from_ints([matched as i32], device);
    let target = BoxCodec::default().encode(
        Tensor::from_floats([gt_box()], device),
        anchors.clone().select(0, index),
    );

    let mut loc = vec![0.0f32; num_anchors * 4];
    loc[matched * 4..matched * 4 + 4].copy_from_slice(&to_vec(target));

    let mut conf = vec![-10.0f32; num_anchors * (NUM_CLASSES - 1)];
    conf[matched * (NUM_CLASSES - 1) + 2] = 10.0;

    let loc = Tensor::<B, 1>::from_floats(loc.as_slice(), device).reshape([1, num_anchors, 4]);
    let conf = Tensor::<B, 1>::from_floats(conf.as_slice(), device).reshape([
        1,
        num_anchors,
        NUM_CLASSES - 1,
    ]);

    let detections = DetectConfig::new(NUM_CLASSES)
        .init()
        .unwrap()
        .forward(loc, conf, anchors)
        .unwrap();

    assert_eq!(detections.len(), 1);
    assert_eq!(detections[0].len(), 1);

    let det = detections[0].classes[3][0];
    assert_eq!(det.cls_id, 3);
    assert!(det.score > 0.99);
    assert!(iou_f32(&det.corners(), &gt_box()) > 0.5);

    let px = detections[0].rescale(320, 320).classes[3][0];
    for (a, b) in px.corners().iter().zip([50.0, 50.0, 150.0, 150.0]) {
        assert!((a - b).abs() < 0.1, "{a} vs {b}");
    }
}

#[test]
fn mutual_guide_loss_is_finite() {
    let device = &NdArrayDevice::default();

    let anchors = PriorBox::new(24.0, 320).unwrap().forward::<B>(device);
    let [num_anchors, _] = anchors.dims();

    let loss = MultiBoxLossConfig::new(NUM_CLASSES)
        .with_mutual_guide(true)
        .init()
        .unwrap();

    let (loc_loss, cls_loss) = loss
        .forward(
            Tensor::<B, 3>::zeros([2, num_anchors, 4], device),
            Tensor::<B, 3>::zeros([2, num_anchors, NUM_CLASSES - 1], device),
            anchors,
            &[targets(device), Tensor::zeros([0, 5], device)],
        )
        .unwrap();

    let (loc_loss, cls_loss) = (loc_loss.into_scalar(), cls_loss.into_scalar());
    assert!(loc_loss.is_finite() && loc_loss >= 0.0);
    assert!(cls_loss.is_finite() && cls_loss > 0.0);
}

#[test]
fn detector_outputs_feed_loss_and_detect() {
    let device = &NdArrayDevice::default();

    let model = DetectorConfig::new(NUM_CLASSES)
        .with_input_size(128)
        .with_stem_channels(4)
        .with_mid_channels(4)
        .with_fea_channel(8)
        .init::<B>(device)
        .unwrap();
    let anchors = model.priors().unwrap().forward::<B>(device);

    let (loc, conf) = model.forward(Tensor::zeros([1, 3, 128, 128], device));

    let [x1, y1, x2, y2] = [0.2, 0.2, 0.6, 0.7];
    let target = Tensor::<B, 2>::from_floats([[x1, y1, x2, y2, 1.0]], device);

    let (loc_loss, cls_loss) = MultiBoxLossConfig::new(NUM_CLASSES)
        .init()
        .unwrap()
        .forward(loc.clone(), conf.clone(), anchors.clone(), &[target])
        .unwrap();
    assert!((loc_loss + cls_loss).into_scalar().is_finite());

    let detections = DetectConfig::new(NUM_CLASSES)
        .init()
        .unwrap()
        .forward(loc, conf, anchors)
        .unwrap();

    assert_eq!(detections.len(), 1);
    for det in detections[0].iter() {
        assert!(det.corners().iter().all(|v| (0.0..=1.0).contains(v)));
    }
}
