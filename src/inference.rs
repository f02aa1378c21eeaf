use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use anyhow::{Context, anyhow};
use burn::{
    config::Config,
    data::dataset::{Dataset, vision::ImageFolderDataset},
    module::Module,
    record::CompactRecorder,
    tensor::{Tensor, backend::Backend},
};
use image::RgbImage;

use crate::{
    config::MODEL_CONFIG_FILE,
    dataset::{COCODataSet, COCOVersion},
    detect::{Detect, DetectConfig, Detections},
    labels::ClassRemap,
    models::detector::{Detector, DetectorConfig},
    nms::BoundingBox,
    transforms::Preprocess,
};

/// Model configuration of `weights_file`, or the defaults.
///
/// Exported models keep theirs in `<weights>.json`, training checkpoints share the
/// [`MODEL_CONFIG_FILE`] of their directory.
pub fn model_config(weights_file: &Path, num_classes: usize) -> anyhow::Result<DetectorConfig> {
    let candidates = [
        weights_file.with_extension("json"),
        weights_file.with_file_name(MODEL_CONFIG_FILE),
    ];

    let mut config = match candidates.iter().find(|path| path.exists()) {
        Some(path) => {
            DetectorConfig::load(path).map_err(|e| anyhow!("{}: {}", path.display(), e))?
        }
        None => {
            log::warn!(
                "no model configuration next to {}, using the defaults",
                weights_file.display()
            );
            DetectorConfig::new(num_classes)
        }
    };

    config.num_classes = num_classes;
    Ok(config)
}

/// Loads a trained detector, either a training checkpoint or an exported model.
///
/// The record is loaded into a skeleton of the stored form, so exported weights land in the
/// reparameterised layout. With `deploy` a training checkpoint is reparameterised after loading.
pub fn load_detector<B: Backend>(
    weights_file: &Path,
    num_classes: usize,
    deploy: bool,
    device: &B::Device,
) -> anyhow::Result<Detector<B>> {
    let model = model_config(weights_file, num_classes)?
        .init::<B>(device)?
        .load_file(weights_file.to_path_buf(), &CompactRecorder::new(), device)
        .with_context(|| format!("trained model not found at {}", weights_file.display()))?;

    Ok(if deploy { model.into_deploy() } else { model })
}

/// Reparameterises a training checkpoint and saves the inference form.
///
/// The weights go to `out` (the recorder sets the extension) and the configuration, marked as
/// deployed, to `out.json`.
///
/// # Returns
///
/// The path of the written configuration.
pub fn export<B: Backend>(
    weights_file: &Path,
    out: &Path,
    num_classes: usize,
    device: &B::Device,
) -> anyhow::Result<PathBuf> {
    let config = model_config(weights_file, num_classes)?.with_deploy(true);
    let model = load_detector::<B>(weights_file, num_classes, true, device)?;

    if let Some(dir) = out.parent().filter(|dir| !dir.as_os_str().is_empty()) {
        std::fs::create_dir_all(dir).with_context(|| format!("creating {}", dir.display()))?;
    }

    model
        .save_file(out.to_path_buf(), &CompactRecorder::new())
        .with_context(|| format!("saving {}", out.display()))?;

    let config_path = out.with_extension("json");
    config
        .save(&config_path)
        .with_context(|| format!("saving {}", config_path.display()))?;

    log::info!(
        "exported {} to {} ({})",
        weights_file.display(),
        out.display(),
        config_path.display()
    );

    Ok(config_path)
}

/// Resizes, runs and post-processes a single image.
///
/// # Returns
///
/// The detections in pixels of `image` plus the time spent in the network and in
/// post-processing.
fn detect_image<B: Backend>(
    model: &Detector<B>,
    detect: &Detect,
    anchors: &Tensor<B, 2>,
    image: &RgbImage,
    device: &B::Device,
) -> anyhow::Result<(Detections, Duration, Duration)> {
    let (width, height) = image.dimensions();

    let start = Instant::now();
    let input = Preprocess::new(model.input_size())
        .apply::<B>(image, device)
        .unsqueeze::<4>();
    let (loc, conf) = model.forward(input);
    let forward_time = start.elapsed();

    let start = Instant::now();
    let detections = detect
        .forward(loc, conf, anchors.clone())?
        .pop()
        .unwrap_or_default()
        .rescale(width, height);

    Ok((detections, forward_time, start.elapsed()))
}

/// Runs the detector on a single image.
///
/// # Returns
///
/// The detections of the image in pixel coordinates of the original image, which are also
/// logged one per line.
pub fn infer<B: Backend>(
    image_path: &Path,
    weights_file: &Path,
    remap: &ClassRemap,
    detect: &DetectConfig,
    deploy: bool,
    device: &B::Device,
) -> anyhow::Result<Detections> {
    let model = load_detector::<B>(weights_file, remap.count(), deploy, device)?;
    let anchors = model.priors()?.forward::<B>(device);

    let image = image::open(image_path)
        .with_context(|| format!("reading {}", image_path.display()))?
        .to_rgb8();

    let (detections, _, _) = detect_image(&model, &detect.init()?, &anchors, &image, device)?;

    log::info!("{}: {} detections", image_path.display(), detections.len());

    for det in detections.iter() {
        log::info!(
            "{:>14} {:.3} [{:.1}, {:.1}, {:.1}, {:.1}]",
            remap.name(det.cls_id).unwrap_or("unknown"),
            det.score,
            det.x1,
            det.y1,
            det.x2,
            det.y2
        );
    }

    Ok(detections)
}

/// Detections gathered over a list of images, `boxes[class][image]` in pixels of each image.
///
/// Class 0 is background and holds an empty list for every image.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SplitDetections {
    pub image_paths: Vec<String>,
    pub boxes: Vec<Vec<Vec<BoundingBox>>>,
}

impl SplitDetections {
    pub fn new(num_classes: usize) -> Self {
        Self {
            image_paths: Vec::new(),
            boxes: vec![Vec::new(); num_classes],
        }
    }

    /// Appends the detections of the next image, every class gets an entry.
    pub fn push(&mut self, image_path: String, detections: Detections) {
        let mut classes = detections.classes.into_iter();

        for per_image in self.boxes.iter_mut() {
            per_image.push(classes.next().unwrap_or_default());
        }

        self.image_paths.push(image_path);
    }

    pub fn num_images(&self) -> usize {
        self.image_paths.len()
    }

    /// Number of detections of class `cls` over all images.
    pub fn class_count(&self, cls: usize) -> usize {
        self.boxes.get(cls).map_or(0, |images| images.iter().map(Vec::len).sum())
    }
}

/// Runs `model` over every image of `image_paths`.
///
/// An unreadable image is logged and recorded without detections so that the image index stays
/// aligned with `image_paths`.
pub fn detect_images<B: Backend, P: AsRef<Path>>(
    model: &Detector<B>,
    detect: &DetectConfig,
    image_paths: &[P],
    device: &B::Device,
) -> anyhow::Result<SplitDetections> {
    let post = detect.init()?;
    let anchors = model.priors()?.forward::<B>(device);

    let mut split = SplitDetections::new(detect.num_classes);
    let (mut forward_time, mut post_time) = (Duration::ZERO, Duration::ZERO);
    let step = (image_paths.len() / 10).max(1);

    for (i, path) in image_paths.iter().enumerate() {
        let path = path.as_ref();

        let detections = match image::open(path) {
            Ok(image) => {
                let (detections, f, p) =
                    detect_image(model, &post, &anchors, &image.to_rgb8(), device)?;
                forward_time += f;
                post_time += p;
                detections
            }
            Err(e) => {
                log::warn!("skipping {}: {e}", path.display());
                Detections::default()
            }
        };

        split.push(path.to_string_lossy().into_owned(), detections);

        if (i + 1) % step == 0 || i + 1 == image_paths.len() {
            let n = (i + 1) as f64;
            log::info!(
                "im_detect: {}/{} forward {:.1}ms nms {:.1}ms",
                i + 1,
                image_paths.len(),
                forward_time.as_secs_f64() * 1e3 / n,
                post_time.as_secs_f64() * 1e3 / n
            );
        }
    }

    Ok(split)
}

/// Runs a trained model over the COCO 2017 validation split.
///
/// # Arguments
///
/// * `limit` - Only the first `limit` images of the split are evaluated.
///
/// # Returns
///
/// Every detection of the split, per class and image, also summarised per class in the log.
pub fn evaluate<B: Backend>(
    weights_file: &Path,
    coco_root: &Path,
    remap: &ClassRemap,
    detect: &DetectConfig,
    limit: Option<usize>,
    device: &B::Device,
) -> anyhow::Result<SplitDetections> {
    let model = load_detector::<B>(weights_file, remap.count(), true, device)?;
    let dataset = ImageFolderDataset::coco_ds_val(COCOVersion::V2017, coco_root)?;

    let count = limit.map_or(dataset.len(), |n| n.min(dataset.len()));
    let image_paths: Vec<String> = (0..count)
        .filter_map(|i| dataset.get(i))
        .map(|item| item.image_path)
        .collect();

    let split = detect_images(&model, detect, &image_paths, device)?;

    for cls in 1..remap.count() {
        log::info!(
            "{:>14}: {} detections",
            remap.name(cls).unwrap_or("unknown"),
            split.class_count(cls)
        );
    }

    Ok(split)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::boxes::to_vec;
    use burn::backend::{NdArray, ndarray::NdArrayDevice};

    type B = NdArray<f32>;

    #[test]
    fn test_model_config_round_trip() {
        let dir = std::env::temp_dir().join("mutual-guide-inference-config");
        std::fs::create_dir_all(&dir).unwrap();

        let saved = DetectorConfig::new(7).with_input_size(128).with_fea_channel(16);
        saved.save(dir.join(MODEL_CONFIG_FILE)).unwrap();

        let config = model_config(&dir.join("checkpoint-3.mpk"), 4).unwrap();

        assert_eq!(config.input_size, 128);
        assert_eq!(config.fea_channel, 16);
        assert_eq!(config.num_classes, 4);

        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn test_checkpoint_round_trip() {
        let device = &NdArrayDevice::default();
        let dir = std::env::temp_dir().join("mutual-guide-inference-checkpoint");
        std::fs::create_dir_all(&dir).unwrap();

        let config = DetectorConfig::new(3)
            .with_input_size(64)
            .with_stem_channels(4)
            .with_mid_channels(4)
            .with_fea_channel(8);
        config.save(dir.join(MODEL_CONFIG_FILE)).unwrap();

        let model = config.init::<B>(device).unwrap();
        let weights = dir.join("checkpoint");
        model
            .clone()
            .save_file(weights.clone(), &CompactRecorder::new())
            .unwrap();

        let loaded = load_detector::<B>(&weights, 3, true, device).unwrap();

        let x = burn::tensor::Tensor::<B, 4>::ones([1, 3, 64, 64], device);
        let (loc_a, _) = model.forward(x.clone());
        let (loc_b, _) = loaded.forward(x);

        let a = crate::boxes::to_vec(loc_a);
        let b = crate::boxes::to_vec(loc_b);
        for (a, b) in a.iter().zip(b.iter()) {
            assert!((a - b).abs() < 1e-3, "{a} vs {b}");
        }

        let _ = std::fs::remove_dir_all(&dir);
    }

    fn small_config(num_classes: usize) -> DetectorConfig {
        DetectorConfig::new(num_classes)
            .with_input_size(64)
            .with_stem_channels(4)
            .with_mid_channels(4)
            .with_fea_channel(8)
    }

    #[test]
    fn test_export_round_trip() {
        let device = &NdArrayDevice::default();
        let dir = std::env::temp_dir().join("mutual-guide-inference-export");
        std::fs::create_dir_all(&dir).unwrap();

        let config = small_config(3);
        config.save(dir.join(MODEL_CONFIG_FILE)).unwrap();

        let model = config.init::<B>(device).unwrap();
        let checkpoint = dir.join("checkpoint-1");
        model
            .clone()
            .save_file(checkpoint.clone(), &CompactRecorder::new())
            .unwrap();

        let out = dir.join("deploy").join("detector");
        let config_path = export::<B>(&checkpoint, &out, 3, device).unwrap();

        assert_eq!(config_path, out.with_extension("json"));
        assert!(DetectorConfig::load(&config_path).unwrap().deploy);

        let exported = load_detector::<B>(&out, 3, false, device).unwrap();
        assert!(exported.is_deployed());

        let x = Tensor::<B, 4>::ones([1, 3, 64, 64], device);
        let (loc_a, conf_a) = model.forward(x.clone());
        let (loc_b, conf_b) = exported.forward(x);

        let expected = [to_vec(loc_a), to_vec(conf_a)].concat();
        let actual = [to_vec(loc_b), to_vec(conf_b)].concat();
        for (a, b) in expected.iter().zip(actual.iter()) {
            assert!((a - b).abs() < 1e-3, "{a} vs {b}");
        }

        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn test_split_gathers_every_class_per_image() {
        let mut split = SplitDetections::new(3);

        let det = BoundingBox {
            x1: 1.0,
            y1: 2.0,
            x2: 3.0,
            y2: 4.0,
            score: 0.9,
            cls_id: 2,
        };
        split.push("a.jpg".into(), Detections { classes: vec![vec![], vec![], vec![det]] });
        split.push("b.jpg".into(), Detections::default());

        assert_eq!(split.num_images(), 2);
        assert!(split.boxes.iter().all(|images| images.len() == 2));
        assert_eq!(split.boxes[2][0], vec![det]);
        assert!(split.boxes[2][1].is_empty());
        assert_eq!((split.class_count(1), split.class_count(2)), (0, 1));
    }

    #[test]
    fn test_detect_images_keeps_image_order() {
        let device = &NdArrayDevice::default();
        let dir = std::env::temp_dir().join("mutual-guide-inference-images");
        std::fs::create_dir_all(&dir).unwrap();

        let sizes = [(40, 30), (25, 50)];
        let mut paths: Vec<PathBuf> = sizes
            .iter()
            .enumerate()
            .map(|(i, &(w, h))| {
                let path = dir.join(format!("{i}.png"));
                RgbImage::from_pixel(w, h, image::Rgb([120, 80, 40]))
                    .save(&path)
                    .unwrap();
                path
            })
            .collect();
        paths.push(dir.join("missing.png"));

        let model = small_config(3).init::<B>(device).unwrap();
        let detect = DetectConfig::new(3).with_max_per_image(5);
        let split = detect_images(&model, &detect, &paths, device).unwrap();

        assert_eq!(split.num_images(), 3);
        assert_eq!(split.boxes.len(), 3);
        assert!(split.boxes[0].iter().all(Vec::is_empty));
        assert!(split.boxes.iter().all(|images| images[2].is_empty()));

        for (image, &(w, h)) in sizes.iter().enumerate() {
            for det in split.boxes.iter().flat_map(|images| images[image].iter()) {
                assert!(det.x2 <= w as f32 + 1e-3 && det.y2 <= h as f32 + 1e-3);
            }
        }

        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn test_missing_checkpoint_is_an_error() {
        let device = &NdArrayDevice::default();

        assert!(load_detector::<B>(Path::new("/nonexistent/model"), 3, false, device).is_err());
    }
}
