use std::path::Path;

use anyhow::anyhow;
use burn::{backend::Autodiff, config::Config};
use rust_mutual_guide::{
    config::{Commands, DetectorCmd, TRAINING_CONFIG, TrainingConfig},
    inference,
    labels::ClassRemap,
    training,
};

#[cfg(feature = "libtorch")]
mod backend {
    pub type Backend = burn::backend::libtorch::LibTorch;

    pub fn device() -> burn::backend::libtorch::LibTorchDevice {
        burn::backend::libtorch::LibTorchDevice::Cuda(0)
    }
}

#[cfg(not(feature = "libtorch"))]
mod backend {
    pub type Backend = burn::backend::NdArray;

    pub fn device() -> burn::backend::ndarray::NdArrayDevice {
        burn::backend::ndarray::NdArrayDevice::default()
    }
}

fn main() -> anyhow::Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    type AutoDiffBackend = Autodiff<backend::Backend>;
    let device = backend::device();

    let cli_cmd: DetectorCmd = argh::from_env();
    let remap = ClassRemap::parse(&cli_cmd.o)?;

    match cli_cmd.commands {
        Commands::Detect(sub_command_detect) => {
            let detect = sub_command_detect.detect_config(remap.count());

            inference::infer::<backend::Backend>(
                Path::new(&sub_command_detect.p),
                Path::new(&sub_command_detect.m),
                &remap,
                &detect,
                sub_command_detect.deploy,
                &device,
            )?;
        }
        Commands::Train(sub_command_train) => {
            let config_path = sub_command_train.f.as_deref().unwrap_or(TRAINING_CONFIG);

            let mut config = if Path::new(config_path).exists() {
                TrainingConfig::load(config_path).map_err(|e| anyhow!("{config_path}: {e}"))?
            } else {
                log::warn!("{config_path} not found, training with the default configuration");
                TrainingConfig::for_classes(remap.count())
            };

            if sub_command_train.mutual_guide {
                config.loss.mutual_guide = true;
            }

            training::train::<AutoDiffBackend>(
                config,
                &device,
                &remap,
                sub_command_train.c,
                Path::new(&sub_command_train.r),
            )?;
        }
        Commands::Eval(sub_command_eval) => {
            let detect = sub_command_eval.detect_config(remap.count());

            let split = inference::evaluate::<backend::Backend>(
                Path::new(&sub_command_eval.m),
                Path::new(&sub_command_eval.r),
                &remap,
                &detect,
                sub_command_eval.n,
                &device,
            )?;

            log::info!("evaluated {} images", split.num_images());
        }
        Commands::Export(sub_command_export) => {
            inference::export::<backend::Backend>(
                Path::new(&sub_command_export.m),
                Path::new(&sub_command_export.out),
                remap.count(),
                &device,
            )?;
        }
    };

    Ok(())
}
