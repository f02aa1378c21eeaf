use std::sync::{Arc, Mutex, PoisonError};

use burn::{
    data::{
        dataloader::batcher::Batcher,
        dataset::vision::{Annotation, ImageDatasetItem},
    },
    prelude::*,
};
use image::RgbImage;
use rand::{Rng, SeedableRng, rngs::StdRng};

use crate::{
    labels::ClassRemap,
    transforms::{Augment, Preprocess},
};

/// Whether a batcher feeds training (augmented) or validation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BatchType {
    Train,
    Test,
}

#[derive(Debug, Clone)]
pub struct DetectionBatch<B: Backend> {
    /// Normalised images `[batch, 3, size, size]`.
    pub images: Tensor<B, 4>,
    /// Per image `[num_boxes, 5]` rows `(x1, y1, x2, y2, class)`, coordinates in `[0, 1]` and the
    /// class in model id space.
    pub targets: Vec<Tensor<B, 2>>,
}

impl<B: Backend> DetectionBatch<B> {
    pub fn len(&self) -> usize {
        self.targets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.targets.is_empty()
    }
}

/// Turns COCO dataset items into [`DetectionBatch`]es.
///
/// Clones share one seeded RNG stream that hands every training batch its own augmentation
/// seed. The sequence is reproducible for a fixed seed when batches are built in a fixed order,
/// that is with at most one loader worker.
#[derive(Debug, Clone)]
pub struct DetectionBatcher {
    remap: ClassRemap,
    preprocess: Preprocess,
    batch_type: BatchType,
    rng: Arc<Mutex<StdRng>>,
}

impl DetectionBatcher {
    pub fn new(remap: &ClassRemap, input_size: usize, batch_type: BatchType, seed: u64) -> Self {
        Self {
            remap: remap.clone(),
            preprocess: Preprocess::new(input_size),
            batch_type,
            rng: Arc::new(Mutex::new(StdRng::seed_from_u64(seed))),
        }
    }

    /// Augmentations of the next batch, `None` unless training.
    pub fn augmentation(&self) -> Option<Augment> {
        if self.batch_type != BatchType::Train {
            return None;
        }

        let mut rng = self.rng.lock().unwrap_or_else(PoisonError::into_inner);
        Some(Augment::from_seed(rng.random()))
    }

    /// Normalised `xyxy` boxes and model ids of the annotated objects of selected classes.
    ///
    /// COCO boxes are `[x, y, w, h]` in pixels of the original image.
    pub fn annotation_targets(
        &self,
        annotation: &Annotation,
        width: u32,
        height: u32,
    ) -> (Vec<[f32; 4]>, Vec<usize>) {
        let Annotation::BoundingBoxes(bboxes) = annotation else {
            return (vec![], vec![]);
        };

        let (w, h) = (width as f32, height as f32);

        bboxes
            .iter()
            .filter_map(|bbox| {
                let model_id = self.remap.coco_id_to_model_id(bbox.label)?;
                let [x, y, bw, bh] = bbox.coords;

                let corners = [x / w, y / h, (x + bw) / w, (y + bh) / h].map(|v| v.clamp(0.0, 1.0));

                Some((corners, model_id))
            })
            .unzip()
    }

    /// Image tensor and target rows of one decoded sample.
    pub fn sample<B: Backend>(
        &self,
        image: RgbImage,
        annotation: &Annotation,
        augment: Option<&mut Augment>,
        device: &B::Device,
    ) -> (Tensor<B, 3>, Tensor<B, 2>) {
        let (mut boxes, labels) = self.annotation_targets(annotation, image.width(), image.height());

        let image = match augment {
            Some(augment) => augment.apply(image, &mut boxes),
            None => image,
        };

        let rows: Vec<f32> = boxes
            .iter()
            .zip(labels.iter())
            .flat_map(|(b, &label)| [b[0], b[1], b[2], b[3], label as f32])
            .collect();

        let targets = Tensor::from_data(TensorData::new(rows, [labels.len(), 5]), device);

        (self.preprocess.apply(&image, device), targets)
    }
}

impl<B: Backend> Batcher<B, ImageDatasetItem, DetectionBatch<B>> for DetectionBatcher {
    fn batch(&self, items: Vec<ImageDatasetItem>, device: &B::Device) -> DetectionBatch<B> {
        let mut augment = self.augmentation();

        let mut images = Vec::with_capacity(items.len());
        let mut targets = Vec::with_capacity(items.len());

        for item in items {
            let image = match image::open(&item.image_path) {
                Ok(image) => image.to_rgb8(),
                Err(e) => {
                    log::warn!("skipping {}: {}", item.image_path, e);
                    continue;
                }
            };

            let (image, target) = self.sample(image, &item.annotation, augment.as_mut(), device);
            images.push(image);
            targets.push(target);
        }

        let images = if images.is_empty() {
            let size = self.preprocess.size();
            Tensor::zeros([0, 3, size, size], device)
        } else {
            Tensor::stack(images, 0)
        };

        DetectionBatch { images, targets }
    }
}
