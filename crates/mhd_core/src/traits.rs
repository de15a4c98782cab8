use num_traits::{Float, FromPrimitive};
use std::fmt::Debug;

use crate::error::Result;

/// A trait for types that can flow through the compute kernels.
/// Implemented by `f64` and by the forward, hyper-dual and reverse AD numbers.
pub trait Scalar: Float + FromPrimitive + Debug + 'static {}

impl<T: Float + FromPrimitive + Debug + 'static> Scalar for T {}

/// Lifts a plain value into `T` as a constant (zero derivative part).
#[inline]
pub fn constant<T: Scalar>(value: f64) -> T {
    T::from_f64(value).unwrap_or_else(T::nan)
}

/// Reads the primal value back out of `T`.
#[inline]
pub fn primal<T: Scalar>(value: T) -> f64 {
    value.to_f64().unwrap_or(f64::NAN)
}

/// A pure numeric function of several array arguments, evaluated at scalar type `T`.
///
/// The derivative engine differentiates implementors w.r.t. one argument by
/// evaluating them at dual, hyper-dual or tape scalars.
pub trait ArgFunction<T: Scalar> {
    fn call(&self, args: &[Vec<T>]) -> Result<Vec<T>>;
}

impl<T: Scalar, F: ArgFunction<T> + ?Sized> ArgFunction<T> for &F {
    fn call(&self, args: &[Vec<T>]) -> Result<Vec<T>> {
        (**self).call(args)
    }
}
