use num::Float;

/// Panics with the offending tensors when `$a` holds a NaN. Only active in debug builds.
#[macro_export]
macro_rules! check_nan {
    ($a:expr, $($ctx:expr),*) => {{
        #[cfg(debug_assertions)]
        {
            use burn::tensor::cast::ToElement;
            if $a.clone().is_nan().int().sum().into_scalar().to_i32() > 0 {
                log::error!("NaN in {} at line {}", stringify!($a), line!());
                $(log::error!("{} = {}", stringify!($ctx), $ctx);)*
                panic!("found nan in line {}", line!());
            }
        }
    }};
}

// Helper function for comparing floats
pub fn assert_approx_eq<F>(a: &F, b: &F, epsilon: F)
where
    F: Float + std::fmt::Display + std::fmt::Debug,
{
    assert!(
        (*a - *b).abs() <= epsilon,
        "Values differ: {:?} vs {:?} (tolerance: {:?})",
        *a,
        *b,
        epsilon
    );
}
