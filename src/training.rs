use std::path::Path;
use std::sync::Arc;

use anyhow::Context;
use burn::{
    data::{
        dataloader::{DataLoader, DataLoaderBuilder},
        dataset::vision::ImageFolderDataset,
    },
    module::AutodiffModule,
    optim::{GradientsParams, Optimizer},
    prelude::*,
    record::CompactRecorder,
    tensor::backend::AutodiffBackend,
};

use crate::{
    config::{CHECKPOINTS_DIR, LOG_PATH, MODEL_CONFIG_FILE, TrainingConfig, checkpoint_path},
    data::{BatchType, DetectionBatch, DetectionBatcher},
    dataset::{COCODataSet, COCOVersion},
    labels::ClassRemap,
    models::detector::Detector,
    schedule::{WarmupCosine, decay_weights},
    stats::Stats,
};

fn dataloader<B: Backend>(
    batcher: DetectionBatcher,
    config: &TrainingConfig,
    device: &B::Device,
    dataset: ImageFolderDataset,
) -> Arc<dyn DataLoader<B, DetectionBatch<B>>> {
    DataLoaderBuilder::new(batcher)
        .set_device(device.clone())
        .batch_size(config.batch_size)
        .shuffle(config.seed)
        .num_workers(config.num_workers)
        .build(dataset)
}

/// Trains the detector on the selected COCO categories.
///
/// Every step uses SGD at the [`WarmupCosine`] rate of its global iteration, so a resumed run
/// continues the schedule where the checkpoint left it.
///
/// # Arguments
///
/// * `config` - Training configuration, its class counts are replaced by `remap.count()`.
/// * `remap` - Selected COCO categories.
/// * `checkpoint` - Epoch of a checkpoint under [`CHECKPOINTS_DIR`] to resume from.
/// * `coco_root` - Directory holding `annotations/` and the image folders.
pub fn train<B: AutodiffBackend>(
    config: TrainingConfig,
    device: &B::Device,
    remap: &ClassRemap,
    checkpoint: Option<usize>,
    coco_root: &Path,
) -> anyhow::Result<()> {
    let config = config.with_num_classes(remap.count());
    let names = remap.names();

    std::fs::create_dir_all(CHECKPOINTS_DIR)
        .with_context(|| format!("creating {CHECKPOINTS_DIR}"))?;
    config
        .model
        .save(Path::new(CHECKPOINTS_DIR).join(MODEL_CONFIG_FILE))
        .context("saving the model configuration")?;

    B::seed(config.seed);

    // Load a model checkpoint if the user has specified one to resume from
    let (mut model, first_epoch): (Detector<B>, usize) = match checkpoint {
        None => (config.model.init(device)?, 1),
        Some(epoch) => {
            let path = checkpoint_path(&names, epoch);
            let model = config
                .model
                .init(device)?
                .load_file(path.clone(), &CompactRecorder::new(), device)
                .with_context(|| format!("loading checkpoint {path}"))?;
            log::info!("resuming from {path}");
            (model, epoch + 1)
        }
    };

    let loss_fn = config.loss.init()?;

    // anchors only depend on the input resolution
    let priors = model.priors()?;
    let anchors = priors.forward::<B>(device);
    let anchors_valid = priors.forward::<B::InnerBackend>(device);

    let mut optim = config.optimizer.init();

    let input_size = config.model.input_size;
    let batcher_train = DetectionBatcher::new(remap, input_size, BatchType::Train, config.seed);
    let batcher_valid = DetectionBatcher::new(remap, input_size, BatchType::Test, config.seed);

    let dataloader_train = dataloader::<B>(
        batcher_train,
        &config,
        device,
        ImageFolderDataset::coco_ds_train(COCOVersion::V2017, coco_root)?,
    );
    let dataloader_valid = dataloader::<B::InnerBackend>(
        batcher_valid,
        &config,
        device,
        ImageFolderDataset::coco_ds_val(COCOVersion::V2017, coco_root)?,
    );

    let epoch_size = dataloader_train.num_items().div_ceil(config.batch_size).max(1);
    let mut schedule = WarmupCosine::new(
        config.learning_rate,
        config.min_learning_rate,
        config.warmup_iters,
        config.num_epochs * epoch_size,
    )?;
    schedule.skip((first_epoch - 1) * epoch_size);

    let mut stats = Stats::new(config.batch_size, LOG_PATH)?;

    for epoch in first_epoch..config.num_epochs + 1 {
        for (iteration, batch) in dataloader_train.iter().enumerate() {
            let lr = schedule.step();
            if iteration == 0 {
                log::info!("epoch {epoch}: learning rate {lr:.6}");
            }

            if batch.is_empty() {
                continue;
            }

            let (loc, conf) = model.forward(batch.images);
            let (loc_loss, cls_loss) = loss_fn.forward(loc, conf, anchors.clone(), &batch.targets)?;

            let loss = loc_loss.clone() + cls_loss.clone();

            let grads = GradientsParams::from_grads(loss.backward(), &model);
            let grads = decay_weights(&model, grads, config.weight_decay);
            model = optim.step(lr, model, grads);

            stats.update(loc_loss.detach(), cls_loss.detach(), iteration, "Train", epoch)?;
        }

        stats.flush()?;

        let path = checkpoint_path(&names, epoch);
        model
            .clone()
            .save_file(path.clone(), &CompactRecorder::new())
            .with_context(|| format!("saving checkpoint {path}"))?;
        log::info!("saved {path}");

        let m_valid = model.valid();
        let val_cnt = dataloader_valid.num_items();
        let val_limit = (val_cnt as f32 * config.valid_fraction) as usize;

        for (iteration, batch) in dataloader_valid.iter().enumerate() {
            if !batch.is_empty() {
                let (loc, conf) = m_valid.forward(batch.images);
                let (loc_loss, cls_loss) =
                    loss_fn.forward(loc, conf, anchors_valid.clone(), &batch.targets)?;

                stats.update(loc_loss, cls_loss, iteration, "Valid", epoch)?;
            }

            if (iteration + 1) * config.batch_size >= val_limit {
                break;
            }
        }

        stats.flush()?;
    }

    Ok(())
}
