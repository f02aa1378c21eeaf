use burn::{
    config::Config,
    module::Module,
    nn::{
        PaddingConfig2d,
        conv::{Conv2d, Conv2dConfig},
    },
    tensor::{
        Tensor,
        backend::Backend,
        module::interpolate,
        ops::{InterpolateMode, InterpolateOptions},
    },
};

/// Merges the backbone levels into the maps the head predicts from.
///
/// Input and output are ordered finest first and every output keeps the shape of the input at
/// the same position.
pub trait FeatureFusion<B: Backend> {
    fn fuse(&self, features: Vec<Tensor<B, 4>>) -> Vec<Tensor<B, 4>>;
}

#[derive(Config, Debug, PartialEq)]
pub enum NeckKind {
    /// Predict straight from the backbone levels.
    Ssd,
    /// Top-down feature pyramid.
    Fpn,
}

/// Leaves the backbone levels untouched.
#[derive(Module, Clone, Debug, Default)]
pub struct SsdNeck;

impl<B: Backend> FeatureFusion<B> for SsdNeck {
    fn fuse(&self, features: Vec<Tensor<B, 4>>) -> Vec<Tensor<B, 4>> {
        features
    }
}

/// Top-down pathway with lateral connections.
///
/// Every level goes through a 1x1 lateral convolution, the merged map of the coarser level is
/// upsampled (nearest) to its size and added, and a 3x3 convolution smooths the sum.
///
/// "Feature Pyramid Networks for Object Detection"
/// Authors: Tsung-Yi Lin, Piotr Dollár, Ross Girshick, Kaiming He, Bharath Hariharan, Serge Belongie
/// Link (official): https://arxiv.org/abs/1612.03144
#[derive(Module, Debug)]
pub struct FpnNeck<B: Backend> {
    lateral: Vec<Conv2d<B>>,
    smooth: Vec<Conv2d<B>>,
}

impl<B: Backend> FpnNeck<B> {
    pub fn new(channels: usize, num_levels: usize, device: &B::Device) -> Self {
        let lateral = (0..num_levels)
            .map(|_| Conv2dConfig::new([channels, channels], [1, 1]).init(device))
            .collect();
        let smooth = (0..num_levels)
            .map(|_| {
                Conv2dConfig::new([channels, channels], [3, 3])
                    .with_padding(PaddingConfig2d::Explicit(1, 1))
                    .init(device)
            })
            .collect();

        Self { lateral, smooth }
    }
}

impl<B: Backend> FeatureFusion<B> for FpnNeck<B> {
    fn fuse(&self, features: Vec<Tensor<B, 4>>) -> Vec<Tensor<B, 4>> {
        let laterals: Vec<Tensor<B, 4>> = features
            .into_iter()
            .zip(self.lateral.iter())
            .map(|(x, conv)| conv.forward(x))
            .collect();

        let mut merged = Vec::with_capacity(laterals.len());
        let mut coarser: Option<Tensor<B, 4>> = None;

        for x in laterals.into_iter().rev() {
            let x = match coarser {
                Some(top) => {
                    // odd sizes do not halve exactly, so upsample to the level's own size
                    let [_, _, h, w] = x.dims();
                    let options = InterpolateOptions::new(InterpolateMode::Nearest);
                    x + interpolate(top, [h, w], options)
                }
                None => x,
            };

            coarser = Some(x.clone());
            merged.push(x);
        }

        merged.reverse();

        merged
            .into_iter()
            .zip(self.smooth.iter())
            .map(|(x, conv)| conv.forward(x))
            .collect()
    }
}

/// Neck selected by [`NeckKind`].
#[derive(Module, Debug)]
pub enum Neck<B: Backend> {
    Ssd(SsdNeck),
    Fpn(FpnNeck<B>),
}

impl<B: Backend> Neck<B> {
    pub fn new(kind: &NeckKind, channels: usize, num_levels: usize, device: &B::Device) -> Self {
        match kind {
            NeckKind::Ssd => Neck::Ssd(SsdNeck),
            NeckKind::Fpn => Neck::Fpn(FpnNeck::new(channels, num_levels, device)),
        }
    }
}

impl<B: Backend> FeatureFusion<B> for Neck<B> {
    fn fuse(&self, features: Vec<Tensor<B, 4>>) -> Vec<Tensor<B, 4>> {
        match self {
            Neck::Ssd(neck) => <SsdNeck as FeatureFusion<B>>::fuse(neck, features),
            Neck::Fpn(neck) => neck.fuse(features),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::boxes::to_vec;
    use burn::{
        backend::{NdArray, ndarray::NdArrayDevice},
        tensor::Distribution,
    };

    type B = NdArray<f32>;

    fn pyramid(device: &NdArrayDevice) -> Vec<Tensor<B, 4>> {
        [10, 5, 3, 2]
            .into_iter()
            .map(|s| Tensor::random([2, 6, s, s], Distribution::Uniform(-1.0, 1.0), device))
            .collect()
    }

    #[test]
    fn test_fpn_keeps_level_shapes() {
        let device = &NdArrayDevice::default();
        let features = pyramid(device);
        let shapes: Vec<[usize; 4]> = features.iter().map(|f| f.dims()).collect();

        let fused = Neck::<B>::new(&NeckKind::Fpn, 6, 4, device).fuse(features);

        assert_eq!(fused.iter().map(|f| f.dims()).collect::<Vec<_>>(), shapes);
    }

    #[test]
    fn test_ssd_neck_is_identity() {
        let device = &NdArrayDevice::default();
        let features = pyramid(device);
        let expected: Vec<Vec<f32>> = features.iter().cloned().map(to_vec).collect();

        let fused = Neck::<B>::new(&NeckKind::Ssd, 6, 4, device).fuse(features);

        assert_eq!(fused.into_iter().map(to_vec).collect::<Vec<_>>(), expected);
    }

    #[test]
    fn test_fpn_coarse_levels_reach_fine_ones() {
        let device = &NdArrayDevice::default();
        let neck = FpnNeck::<B>::new(6, 4, device);

        let features = pyramid(device);
        let mut changed = features.clone();
        changed[3] = changed[3].clone() + 1.0;

        let a = to_vec(neck.fuse(features).swap_remove(0));
        let b = to_vec(neck.fuse(changed).swap_remove(0));

        assert!(a.iter().zip(b.iter()).any(|(a, b)| (a - b).abs() > 1e-4));
    }
}
