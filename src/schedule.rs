use burn::{
    LearningRate,
    lr_scheduler::{
        LrScheduler,
        cosine::{CosineAnnealingLrScheduler, CosineAnnealingLrSchedulerConfig},
        linear::{LinearLrScheduler, LinearLrSchedulerConfig},
    },
    module::{Module, ModuleVisitor, ParamId},
    optim::GradientsParams,
    tensor::{Tensor, backend::AutodiffBackend},
};

use crate::error::ConfigError;

/// Learning rate of every optimizer step, a linear warmup followed by a cosine decay:
///
/// ```text
///   lr(i) = min + (lr - min) * i / warmup                                       i <= warmup
///   lr(i) = min + (lr - min) * (1 + cos(π * (i - warmup) / (total - warmup))) / 2   otherwise
/// ```
///
/// Without warmup the decay starts at `lr` on the first step.
#[derive(Clone, Copy, Debug)]
pub struct WarmupCosine {
    warmup: Option<LinearLrScheduler>,
    warmup_left: usize,
    cosine: CosineAnnealingLrScheduler,
}

impl WarmupCosine {
    pub fn new(
        learning_rate: LearningRate,
        min_learning_rate: LearningRate,
        warmup_iters: usize,
        total_iters: usize,
    ) -> Result<Self, ConfigError> {
        let decay_iters = total_iters.saturating_sub(warmup_iters).max(1);
        let mut cosine = CosineAnnealingLrSchedulerConfig::new(learning_rate, decay_iters)
            .with_min_lr(min_learning_rate)
            .init()
            .map_err(ConfigError::InvalidSchedule)?;

        let warmup = match warmup_iters {
            0 => None,
            n => {
                // the last warmup step already hands out the peak rate
                cosine.step();
                Some(
                    LinearLrSchedulerConfig::new(min_learning_rate, learning_rate, n)
                        .init()
                        .map_err(ConfigError::InvalidSchedule)?,
                )
            }
        };

        Ok(Self {
            warmup,
            warmup_left: if warmup.is_some() { warmup_iters + 1 } else { 0 },
            cosine,
        })
    }

    /// Advances the schedule by `iters` steps, used when resuming from a checkpoint.
    pub fn skip(&mut self, iters: usize) {
        for _ in 0..iters {
            self.step();
        }
    }

    pub fn step(&mut self) -> LearningRate {
        match self.warmup.as_mut() {
            Some(warmup) if self.warmup_left > 0 => {
                self.warmup_left -= 1;
                warmup.step()
            }
            _ => self.cosine.step(),
        }
    }
}

/// Adds `penalty * w` to the gradient of every weight of rank two or more.
///
/// Biases and batch norm affine parameters keep their plain gradient.
pub fn decay_weights<B: AutodiffBackend, M: Module<B>>(
    module: &M,
    mut grads: GradientsParams,
    penalty: f32,
) -> GradientsParams {
    if penalty != 0.0 {
        module.visit(&mut WeightDecay {
            grads: &mut grads,
            penalty,
        });
    }

    grads
}

struct WeightDecay<'a> {
    grads: &'a mut GradientsParams,
    penalty: f32,
}

impl<B: AutodiffBackend> ModuleVisitor<B> for WeightDecay<'_> {
    fn visit_float<const D: usize>(&mut self, id: ParamId, tensor: &Tensor<B, D>) {
        if D < 2 {
            return;
        }

        // running statistics have no gradient and fall through here
        if let Some(grad) = self.grads.remove::<B::InnerBackend, D>(id) {
            let decayed = grad + tensor.clone().inner() * self.penalty;
            self.grads.register::<B::InnerBackend, D>(id, decayed);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{boxes::to_vec, debug::assert_approx_eq};
    use burn::{
        backend::{Autodiff, NdArray, ndarray::NdArrayDevice},
        nn::LinearConfig,
    };

    fn expected(i: usize, lr: f64, min: f64, warmup: usize, total: usize) -> f64 {
        if i <= warmup && warmup > 0 {
            return min + (lr - min) * i as f64 / warmup as f64;
        }
        let t = (i - warmup) as f64 / (total - warmup) as f64;
        min + (lr - min) * 0.5 * (1.0 + (t * std::f64::consts::PI).cos())
    }

    #[test]
    fn test_warmup_then_cosine() {
        let mut schedule = WarmupCosine::new(0.01, 1e-6, 4, 12).unwrap();

        for i in 0..=12 {
            let lr = schedule.step();
            let e = expected(i, 0.01, 1e-6, 4, 12);
            assert!((lr - e).abs() < 1e-9, "step {i}: {lr} vs {e}");
        }
    }

    #[test]
    fn test_peak_and_floor() {
        let mut schedule = WarmupCosine::new(0.01, 1e-6, 4, 12).unwrap();
        let rates: Vec<f64> = (0..=12).map(|_| schedule.step()).collect();

        assert!((rates[0] - 1e-6).abs() < 1e-12);
        assert!((rates[4] - 0.01).abs() < 1e-12);
        assert!((rates[12] - 1e-6).abs() < 1e-12);
        assert!(rates[4..].windows(2).all(|w| w[1] < w[0]));
    }

    #[test]
    fn test_without_warmup() {
        let mut schedule = WarmupCosine::new(0.01, 0.0, 0, 10).unwrap();

        assert!((schedule.step() - 0.01).abs() < 1e-12);
        schedule.skip(9);
        assert!(schedule.step().abs() < 1e-12);
    }

    #[test]
    fn test_skip_resumes_in_place() {
        let mut resumed = WarmupCosine::new(0.01, 1e-6, 3, 20).unwrap();
        resumed.skip(7);

        assert!((resumed.step() - expected(7, 0.01, 1e-6, 3, 20)).abs() < 1e-9);
    }

    #[test]
    fn test_invalid_rate_is_rejected() {
        assert!(matches!(
            WarmupCosine::new(2.0, 1e-6, 3, 20),
            Err(ConfigError::InvalidSchedule(_))
        ));
    }

    #[test]
    fn test_weights_decay_but_not_biases() {
        type AB = Autodiff<NdArray<f32>>;
        type IB = NdArray<f32>;
        let device = &NdArrayDevice::default();

        let linear = LinearConfig::new(3, 2).init::<AB>(device);
        let x = Tensor::<AB, 2>::ones([1, 3], device);
        let grads = GradientsParams::from_grads(linear.forward(x).sum().backward(), &linear);

        let weight_id = linear.weight.id;
        let bias_id = linear.bias.as_ref().unwrap().id;
        let weight_grad = to_vec(grads.get::<IB, 2>(weight_id).unwrap());
        let bias_grad = to_vec(grads.get::<IB, 1>(bias_id).unwrap());

        let grads = decay_weights(&linear, grads, 0.5);

        let weights = to_vec(linear.weight.val().inner());
        let decayed = to_vec(grads.get::<IB, 2>(weight_id).unwrap());
        for ((g, w), d) in weight_grad.iter().zip(weights.iter()).zip(decayed.iter()) {
            assert_approx_eq(&(g + 0.5 * w), d, 1e-6);
        }

        assert_eq!(to_vec(grads.get::<IB, 1>(bias_id).unwrap()), bias_grad);
    }
}
