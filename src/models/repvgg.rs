use burn::{
    module::{Module, Param},
    nn::{
        BatchNorm, BatchNormConfig, PaddingConfig2d, Relu,
        conv::{Conv2d, Conv2dConfig},
    },
    tensor::{Tensor, backend::Backend},
};

/// Convolution without bias followed by batch normalisation.
#[derive(Module, Debug)]
pub struct ConvBn<B: Backend> {
    pub conv: Conv2d<B>,
    pub bn: BatchNorm<B, 2>,
}

impl<B: Backend> ConvBn<B> {
    pub fn new(
        channels: [usize; 2],
        kernel: usize,
        stride: usize,
        device: &B::Device,
    ) -> Self {
        let padding = kernel / 2;

        let conv = Conv2dConfig::new(channels, [kernel, kernel])
            .with_stride([stride, stride])
            .with_padding(PaddingConfig2d::Explicit(padding, padding))
            .with_bias(false)
            .init(device);

        let bn = BatchNormConfig::new(channels[1]).init::<B, 2>(device);

        Self { conv, bn }
    }

    pub fn forward(&self, x: Tensor<B, 4>) -> Tensor<B, 4> {
        self.bn.forward(self.conv.forward(x))
    }

    /// Folds the normalisation into the convolution, see [`fuse_conv_bn`].
    pub fn fuse(&self) -> (Tensor<B, 4>, Tensor<B, 1>) {
        fuse_conv_bn(self.conv.weight.val(), &self.bn)
    }
}

/// Folds inference mode batch normalisation into a preceding bias free convolution.
///
/// ```text
///   std  = sqrt(running_var + eps)
///   W'   = W * gamma / std
///   b'   = beta - running_mean * gamma / std
/// ```
///
/// # Arguments
///
/// * `kernel` - Convolution weights `[out, in, kh, kw]`.
/// * `bn` - The batch norm applied to the convolution output.
pub fn fuse_conv_bn<B: Backend>(
    kernel: Tensor<B, 4>,
    bn: &BatchNorm<B, 2>,
) -> (Tensor<B, 4>, Tensor<B, 1>) {
    let [out_channels, _, _, _] = kernel.dims();

    let std = (bn.running_var.value() + bn.epsilon).sqrt();
    let t = bn.gamma.val() / std;

    let fused_kernel = kernel * t.clone().reshape([out_channels, 1, 1, 1]);
    let fused_bias = bn.beta.val() - bn.running_mean.value() * t;

    (fused_kernel, fused_bias)
}

/// RepVGG building block.
///
/// "RepVGG: Making VGG-style ConvNets Great Again"
/// Authors: Xiaohan Ding, Xiangyu Zhang, Ningning Ma, Jungong Han, Guiguang Ding, Jian Sun
/// Link (official): https://arxiv.org/abs/2101.03697
///
/// While training the block is a sum of three branches, a 3x3 conv + BN, a 1x1 conv + BN and,
/// when the input and output shapes agree, a plain BN acting as identity:
///
/// ```text
///   y = relu(BN(conv3x3(x)) + BN(conv1x1(x)) + BN(x))
/// ```
///
/// All three branches are linear in inference mode, so they can be merged into a single 3x3
/// convolution with bias. [`RepVggBlock::into_deploy`] does exactly that.
#[derive(Module, Debug)]
pub struct RepVggBlock<B: Backend> {
    dense: Option<ConvBn<B>>,
    pointwise: Option<ConvBn<B>>,
    identity: Option<BatchNorm<B, 2>>,
    reparam: Option<Conv2d<B>>,
    activation: Relu,
    in_channels: usize,
    out_channels: usize,
    stride: usize,
}

impl<B: Backend> RepVggBlock<B> {
    pub fn new(channels: [usize; 2], stride: usize, device: &B::Device) -> Self {
        let identity = (channels[0] == channels[1] && stride == 1)
            .then(|| BatchNormConfig::new(channels[0]).init::<B, 2>(device));

        Self {
            dense: Some(ConvBn::new(channels, 3, stride, device)),
            pointwise: Some(ConvBn::new(channels, 1, stride, device)),
            identity,
            reparam: None,
            activation: Relu::new(),
            in_channels: channels[0],
            out_channels: channels[1],
            stride,
        }
    }

    pub fn is_deployed(&self) -> bool {
        self.reparam.is_some()
    }

    pub fn out_channels(&self) -> usize {
        self.out_channels
    }

    pub fn forward(&self, x: Tensor<B, 4>) -> Tensor<B, 4> {
        if let Some(conv) = &self.reparam {
            return self.activation.forward(conv.forward(x));
        }

        let branches = [&self.dense, &self.pointwise]
            .into_iter()
            .flatten()
            .map(|branch| branch.forward(x.clone()));
        let identity = self.identity.iter().map(|bn| bn.forward(x.clone()));

        let out = branches.chain(identity).reduce(|a, b| a + b).unwrap_or(x);

        self.activation.forward(out)
    }

    /// Equivalent single 3x3 kernel and bias of the block.
    pub fn reparameterize(&self) -> (Tensor<B, 4>, Tensor<B, 1>) {
        if let Some(conv) = &self.reparam {
            let bias = match &conv.bias {
                Some(bias) => bias.val(),
                None => Tensor::zeros([self.out_channels], &conv.weight.val().device()),
            };
            return (conv.weight.val(), bias);
        }

        let (in_channels, out_channels) = (self.in_channels, self.out_channels);
        let mut parts = Vec::with_capacity(3);

        if let Some(dense) = &self.dense {
            parts.push(dense.fuse());
        }

        if let Some(pointwise) = &self.pointwise {
            let (kernel, bias) = pointwise.fuse();
            // 1x1 -> 3x3, zero padded around the centre tap
            parts.push((kernel.pad((1, 1, 1, 1), 0.0), bias));
        }

        if let Some(identity) = &self.identity {
            let device = identity.gamma.val().device();
            let mut id = vec![0.0f32; out_channels * in_channels * 9];
            for c in 0..out_channels {
                id[(c * in_channels + c) * 9 + 4] = 1.0;
            }
            let kernel = Tensor::<B, 1>::from_floats(id.as_slice(), &device).reshape([
                out_channels,
                in_channels,
                3,
                3,
            ]);
            parts.push(fuse_conv_bn(kernel, identity));
        }

        parts
            .into_iter()
            .reduce(|(k1, b1), (k2, b2)| (k1 + k2, b1 + b2))
            .unwrap_or_else(|| unreachable!("a block always has at least one branch"))
    }

    /// Collapses the training branches into one 3x3 convolution with bias.
    ///
    /// The result computes the same function as the inference mode training block.
    pub fn into_deploy(self) -> Self {
        if self.is_deployed() {
            return self;
        }

        let (kernel, bias) = self.reparameterize();

        let mut conv = Conv2dConfig::new([self.in_channels, self.out_channels], [3, 3])
            .with_stride([self.stride, self.stride])
            .with_padding(PaddingConfig2d::Explicit(1, 1))
            .init(&kernel.device());

        conv.weight = Param::from_tensor(kernel);
        conv.bias = Some(Param::from_tensor(bias));

        Self {
            dense: None,
            pointwise: None,
            identity: None,
            reparam: Some(conv),
            activation: self.activation,
            in_channels: self.in_channels,
            out_channels: self.out_channels,
            stride: self.stride,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{boxes::to_vec, debug::assert_approx_eq};
    use burn::{
        backend::{NdArray, ndarray::NdArrayDevice},
        module::RunningState,
        tensor::Distribution,
    };

    type B = NdArray<f32>;

    fn randomize_bn(bn: &mut BatchNorm<B, 2>, device: &NdArrayDevice) {
        let [c] = bn.gamma.val().dims();
        let uniform = |lo, hi| Tensor::<B, 1>::random([c], Distribution::Uniform(lo, hi), device);

        bn.gamma = Param::from_tensor(uniform(0.5, 1.5));
        bn.beta = Param::from_tensor(uniform(-0.5, 0.5));
        bn.running_mean = RunningState::new(uniform(-0.5, 0.5));
        bn.running_var = RunningState::new(uniform(0.5, 2.0));
    }

    fn randomized_block(channels: [usize; 2], stride: usize, device: &NdArrayDevice) -> RepVggBlock<B> {
        let mut block = RepVggBlock::<B>::new(channels, stride, device);

        if let Some(dense) = block.dense.as_mut() {
            randomize_bn(&mut dense.bn, device);
        }
        if let Some(pointwise) = block.pointwise.as_mut() {
            randomize_bn(&mut pointwise.bn, device);
        }
        if let Some(identity) = block.identity.as_mut() {
            randomize_bn(identity, device);
        }

        block
    }

    fn assert_equivalent(channels: [usize; 2], stride: usize) {
        let device = &NdArrayDevice::default();
        let block = randomized_block(channels, stride, device);

        let x = Tensor::<B, 4>::random([2, channels[0], 9, 9], Distribution::Uniform(-1.0, 1.0), device);

        let expected = to_vec(block.forward(x.clone()));
        let deployed = block.into_deploy();
        assert!(deployed.is_deployed());

        let actual = to_vec(deployed.forward(x));

        assert_eq!(expected.len(), actual.len());
        for (a, b) in expected.iter().zip(actual.iter()) {
            assert_approx_eq(a, b, 1e-4);
        }
    }

    #[test]
    fn test_identity_branch_only_when_shapes_agree() {
        let device = &NdArrayDevice::default();

        assert!(RepVggBlock::<B>::new([8, 8], 1, device).identity.is_some());
        assert!(RepVggBlock::<B>::new([8, 8], 2, device).identity.is_none());
        assert!(RepVggBlock::<B>::new([4, 8], 1, device).identity.is_none());
    }

    #[test]
    fn test_deploy_equivalence_with_identity() {
        assert_equivalent([6, 6], 1);
    }

    #[test]
    fn test_deploy_equivalence_strided() {
        assert_equivalent([3, 8], 2);
    }

    #[test]
    fn test_fuse_conv_bn_defaults() {
        let device = &NdArrayDevice::default();
        let bn = BatchNormConfig::new(2).init::<B, 2>(device);
        let kernel = Tensor::<B, 4>::ones([2, 1, 1, 1], device);

        let (k, b) = fuse_conv_bn(kernel, &bn);

        // gamma 1, beta 0, mean 0, var 1
        let scale = 1.0 / (1.0f32 + 1e-5).sqrt();
        for v in to_vec(k) {
            assert_approx_eq(&v, &scale, 1e-6);
        }
        assert_eq!(to_vec(b), vec![0.0, 0.0]);
    }

    #[test]
    fn test_deploy_output_shape() {
        let device = &NdArrayDevice::default();
        let block = RepVggBlock::<B>::new([3, 4], 2, device).into_deploy();

        let y = block.forward(Tensor::zeros([1, 3, 7, 7], device));

        assert_eq!(y.dims(), [1, 4, 4, 4]);
    }
}
