use burn::{
    config::Config,
    optim::{SgdConfig, momentum::MomentumConfig},
};
use {argh::FromArgs, std::fmt::Debug};

use crate::{detect::DetectConfig, loss::MultiBoxLossConfig, models::detector::DetectorConfig};

pub const CHECKPOINTS_DIR: &str = "./artifacts/checkpoints/";
pub const LOG_PATH: &str = "./artifacts/log.txt";
pub const TRAINING_CONFIG: &str = "./config/training_config.json";
/// Model configuration stored next to the checkpoints.
pub const MODEL_CONFIG_FILE: &str = "detector_config.json";

/// Everything the training loop needs.
///
/// The class count of the nested model and loss configurations is overwritten from the selected
/// COCO categories when training starts.
#[derive(Config)]
pub struct TrainingConfig {
    pub optimizer: SgdConfig,
    pub model: DetectorConfig,
    pub loss: MultiBoxLossConfig,
    #[config(default = 100)]
    pub num_epochs: usize,
    #[config(default = 2)]
    pub batch_size: usize,
    #[config(default = 7)]
    pub num_workers: usize,
    #[config(default = 1)]
    pub seed: u64,
    /// Peak learning rate, reached at the end of the warmup.
    #[config(default = 0.01)]
    pub learning_rate: f64,
    /// Rate the warmup starts from and the cosine decay ends at.
    #[config(default = 1e-6)]
    pub min_learning_rate: f64,
    #[config(default = 500)]
    pub warmup_iters: usize,
    /// L2 penalty on convolution weights, biases and batch norm parameters are not decayed.
    #[config(default = 5e-4)]
    pub weight_decay: f32,
    /// Share of the validation split evaluated after every epoch.
    #[config(default = 0.2)]
    pub valid_fraction: f32,
}

impl TrainingConfig {
    /// Defaults for `num_classes` classes, background included.
    pub fn for_classes(num_classes: usize) -> Self {
        Self::new(
            sgd(),
            DetectorConfig::new(num_classes),
            MultiBoxLossConfig::new(num_classes),
        )
    }

    pub fn with_num_classes(mut self, num_classes: usize) -> Self {
        self.model.num_classes = num_classes;
        self.loss.num_classes = num_classes;
        self
    }
}

/// SGD with momentum 0.9 and no dampening.
///
/// Weight decay is left out here, [`crate::schedule::decay_weights`] applies it to weights only.
pub fn sgd() -> SgdConfig {
    SgdConfig::new().with_momentum(Some(
        MomentumConfig::new().with_momentum(0.9).with_dampening(0.0),
    ))
}

/// Checkpoint file stem for the given class names and epoch.
pub fn checkpoint_path(names: &[&str], epoch: usize) -> String {
    let names: Vec<String> = names.iter().map(|n| n.replace(' ', "_")).collect();
    format!("{CHECKPOINTS_DIR}detector-checkpoint-{}-{}", names.join("-"), epoch)
}

#[derive(FromArgs, PartialEq, Debug)]
/// Top-level command.
pub struct DetectorCmd {
    #[argh(subcommand)]
    pub commands: Commands,
    #[argh(option)]
    /// object names to learn from e.g 'dog,cat,person'
    pub o: String,
}

#[derive(FromArgs, PartialEq, Debug)]
#[argh(subcommand)]
pub enum Commands {
    Detect(SubCommandDetect),
    Train(SubCommandTrain),
    Eval(SubCommandEval),
    Export(SubCommandExport),
}

/// Post-processing configuration with the command line overrides applied.
fn post_processing(
    num_classes: usize,
    nms_threshold: Option<f32>,
    score_threshold: Option<f32>,
    max_per_image: Option<usize>,
) -> DetectConfig {
    let mut config = DetectConfig::new(num_classes);

    if let Some(i) = nms_threshold {
        config.nms_threshold = i;
    }
    if let Some(c) = score_threshold {
        config.score_threshold = c;
    }
    if let Some(k) = max_per_image {
        config.max_per_image = k;
    }

    config
}

#[derive(FromArgs, PartialEq, Debug)]
/// Detect objects in an image with a trained model
#[argh(subcommand, name = "detect")]
pub struct SubCommandDetect {
    #[argh(option)]
    /// image path to run detection on
    pub p: String,
    #[argh(option)]
    /// model file path to use
    pub m: String,
    #[argh(option)]
    /// iou overlap at which two boxes of a class are considered the same object
    pub i: Option<f32>,
    #[argh(option)]
    /// classification confidence level score
    pub c: Option<f32>,
    #[argh(option)]
    /// maximum number of detections per image
    pub k: Option<usize>,
    #[argh(switch)]
    /// reparameterise the backbone into plain 3x3 convolutions before running
    pub deploy: bool,
}

impl SubCommandDetect {
    pub fn detect_config(&self, num_classes: usize) -> DetectConfig {
        post_processing(num_classes, self.i, self.c, self.k)
    }
}

#[derive(FromArgs, PartialEq, Debug)]
/// Train the detector using the COCO dataset
#[argh(subcommand, name = "train")]
pub struct SubCommandTrain {
    #[argh(option)]
    /// COCO dataset root location (Ex: ./root/annotations/instances_train2017.json)
    pub r: String,
    #[argh(option)]
    /// checkpoint number to start training from default None
    pub c: Option<usize>,
    #[argh(option)]
    /// training configuration file, defaults to ./config/training_config.json
    pub f: Option<String>,
    #[argh(switch)]
    /// assign positives with mutual guidance instead of anchor IoU
    pub mutual_guide: bool,
}

#[derive(FromArgs, PartialEq, Debug)]
/// Run a trained model over the COCO validation split
#[argh(subcommand, name = "eval")]
pub struct SubCommandEval {
    #[argh(option)]
    /// COCO dataset root location (Ex: ./root/annotations/instances_val2017.json)
    pub r: String,
    #[argh(option)]
    /// model file path to use
    pub m: String,
    #[argh(option)]
    /// iou overlap at which two boxes of a class are considered the same object
    pub i: Option<f32>,
    #[argh(option)]
    /// classification confidence level score
    pub c: Option<f32>,
    #[argh(option)]
    /// maximum number of detections per image
    pub k: Option<usize>,
    #[argh(option)]
    /// only evaluate the first n images of the split
    pub n: Option<usize>,
}

impl SubCommandEval {
    pub fn detect_config(&self, num_classes: usize) -> DetectConfig {
        post_processing(num_classes, self.i, self.c, self.k)
    }
}

#[derive(FromArgs, PartialEq, Debug)]
/// Reparameterise a trained checkpoint into its inference form and save it
#[argh(subcommand, name = "export")]
pub struct SubCommandExport {
    #[argh(option)]
    /// checkpoint to export
    pub m: String,
    #[argh(option)]
    /// output file stem, the model configuration is written next to it as <out>.json
    pub out: String,
}
