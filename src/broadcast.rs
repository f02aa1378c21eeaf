/// Expands two tensors to a common shape so element-wise operations line up.
///
/// The second tensor may have a lower rank than the first, in which case leading unit
/// dimensions are added before expanding. Every dimension of the result is the maximum of the
/// two inputs, so each input must either match or be `1` along every axis.
///
/// Neither input is moved; both are cloned into the returned pair.
///
/// ```ignore
/// let col = gtx1;                      // [N, 1]
/// let row = dfx1.reshape([1, -1]);     // [1, M]
/// let (a, b) = broadcast!(col: Tensor<B, 2>, row: Tensor<2>);  // both [N, M]
/// ```
#[macro_export]
macro_rules! broadcast {
    ($a:ident : Tensor<$b:ty, $d:tt>, $c:ident : Tensor<$dc:tt>) => {{
        let lhs: burn::tensor::Tensor<$b, $d> = $a.clone();
        let rhs: burn::tensor::Tensor<$b, $d> = $c.clone().unsqueeze::<$d>();

        let lhs_dims = lhs.dims();
        let rhs_dims = rhs.dims();

        let mut shape = [0usize; $d];
        for i in 0..$d {
            shape[i] = lhs_dims[i].max(rhs_dims[i]);
        }

        let lhs: burn::tensor::Tensor<$b, $d> = lhs.expand(burn::tensor::Shape::new(shape));
        let rhs: burn::tensor::Tensor<$b, $d> = rhs.expand(burn::tensor::Shape::new(shape));

        (lhs, rhs)
    }};
}
