//! Derivative engine.
//!
//! A derivative handle wraps a pure function of several array arguments and
//! differentiates it w.r.t. one of them (`argnum`) in a fixed [`Mode`].
//! Automatic differentiation and central finite differences implement the same
//! [`Derivative`] trait; callers pick one through [`DerivativeSettings`].
//!
//! The auxiliary Jacobian strategies (block-partitioned, SPSA, Broyden) share
//! the [`JacobianEstimator`] trait.

use crate::autodiff::{Dual, HyperDual, Reverse};
use crate::error::{Error, Result};
use crate::traits::{constant, ArgFunction, Scalar};
use nalgebra::{DMatrix, DVector};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

mod auto;
mod block;
mod broyden;
mod finite_diff;
mod spsa;

pub use auto::AutoDiffDerivative;
pub use block::{BlockJacobian, BlockSpec, Device};
pub use broyden::BroydenJacobian;
pub use finite_diff::FiniteDiffDerivative;
pub use spsa::SpsaJacobian;

/// Functions that can be evaluated at every scalar type the AD backends use.
pub trait Differentiable:
    ArgFunction<f64> + ArgFunction<Dual> + ArgFunction<HyperDual> + ArgFunction<Reverse>
{
}

impl<F> Differentiable for F where
    F: ?Sized
        + ArgFunction<f64>
        + ArgFunction<Dual>
        + ArgFunction<HyperDual>
        + ArgFunction<Reverse>
{
}

/// Adapter for plain `f64` closures, usable by the finite-difference and
/// stochastic strategies.
pub struct PlainFn<F>(pub F);

impl<F> ArgFunction<f64> for PlainFn<F>
where
    F: Fn(&[Vec<f64>]) -> Result<Vec<f64>>,
{
    fn call(&self, args: &[Vec<f64>]) -> Result<Vec<f64>> {
        (self.0)(args)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Mode {
    /// Full Jacobian, one forward pass per input component.
    Fwd,
    /// Full Jacobian, one reverse sweep per output component.
    Rev,
    /// Gradient of a scalar-valued function.
    Grad,
    /// Hessian of a scalar-valued function.
    Hess,
    /// Jacobian-vector product; the tangent is the first call argument.
    Jvp,
}

impl Mode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Mode::Fwd => "fwd",
            Mode::Rev => "rev",
            Mode::Grad => "grad",
            Mode::Hess => "hess",
            Mode::Jvp => "jvp",
        }
    }
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Mode {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "fwd" => Ok(Mode::Fwd),
            "rev" => Ok(Mode::Rev),
            "grad" => Ok(Mode::Grad),
            "hess" => Ok(Mode::Hess),
            "jvp" => Ok(Mode::Jvp),
            other => Err(Error::invalid_config(
                "derivative mode",
                format!("'{other}' is not one of fwd, rev, grad, hess, jvp"),
            )),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Backend {
    AutoDiff,
    FiniteDifference,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct DerivativeSettings {
    pub backend: Backend,
    /// Relative step for the finite-difference backend.
    pub rel_step: f64,
}

impl Default for DerivativeSettings {
    fn default() -> Self {
        Self {
            backend: Backend::AutoDiff,
            rel_step: 1e-3,
        }
    }
}

impl DerivativeSettings {
    pub fn finite_difference(rel_step: f64) -> Self {
        Self {
            backend: Backend::FiniteDifference,
            rel_step,
        }
    }
}

/// Result of a derivative evaluation.
///
/// Jacobians of functions with a single output collapse to `Vector`.
#[derive(Debug, Clone, PartialEq)]
pub enum Differential {
    Vector(DVector<f64>),
    Matrix(DMatrix<f64>),
}

impl Differential {
    pub fn from_jacobian(jac: DMatrix<f64>) -> Self {
        if jac.nrows() == 1 {
            Differential::Vector(jac.row(0).transpose())
        } else {
            Differential::Matrix(jac)
        }
    }

    /// A collapsed vector is read back as a single row.
    pub fn into_matrix(self) -> DMatrix<f64> {
        match self {
            Differential::Matrix(m) => m,
            Differential::Vector(v) => DMatrix::from_row_slice(1, v.len(), v.as_slice()),
        }
    }

    pub fn into_vector(self) -> Result<DVector<f64>> {
        match self {
            Differential::Vector(v) => Ok(v),
            Differential::Matrix(m) if m.ncols() == 1 => Ok(m.column(0).into_owned()),
            Differential::Matrix(m) if m.nrows() == 1 => Ok(m.row(0).transpose()),
            Differential::Matrix(m) => Err(Error::dimension(
                "derivative result as vector",
                "a single row or column",
                m.nrows() * m.ncols(),
            )),
        }
    }
}

pub trait Derivative {
    fn mode(&self) -> Mode;
    fn argnum(&self) -> usize;

    /// Evaluates the derivative at `args`. In [`Mode::Jvp`] the tangent is
    /// `args[0]` and the function arguments follow it.
    fn compute(&self, args: &[DVector<f64>]) -> Result<Differential>;

    fn jvp(&self, tangent: &DVector<f64>, args: &[DVector<f64>]) -> Result<DVector<f64>> {
        if self.mode() != Mode::Jvp {
            return Err(Error::invalid_config(
                "jvp",
                format!("derivative was built in {} mode", self.mode()),
            ));
        }
        let mut full = Vec::with_capacity(args.len() + 1);
        full.push(tangent.clone());
        full.extend(args.iter().cloned());
        self.compute(&full)?.into_vector()
    }
}

/// Single canonical interface for the approximate/partitioned Jacobian strategies.
pub trait JacobianEstimator {
    /// Jacobian w.r.t. the first argument.
    fn jacobian(&mut self, args: &[DVector<f64>]) -> Result<DMatrix<f64>>;
}

/// Builds the derivative handle selected by `settings`.
pub fn make_derivative<'a, F>(
    settings: &DerivativeSettings,
    fun: F,
    argnum: usize,
    mode: Mode,
) -> Result<Box<dyn Derivative + 'a>>
where
    F: Differentiable + 'a,
{
    match settings.backend {
        Backend::AutoDiff => Ok(Box::new(AutoDiffDerivative::new(fun, argnum, mode))),
        Backend::FiniteDifference => Ok(Box::new(FiniteDiffDerivative::new(
            fun,
            argnum,
            mode,
            settings.rel_step,
        )?)),
    }
}

/// Splits jvp-mode arguments into `(tangent, function args)`.
pub(crate) fn split_tangent(args: &[DVector<f64>]) -> Result<(&DVector<f64>, &[DVector<f64>])> {
    args.split_first()
        .ok_or_else(|| Error::dimension("jvp arguments", "a tangent followed by the function arguments", 0))
}

pub(crate) fn check_argnum(argnum: usize, args: &[DVector<f64>]) -> Result<()> {
    if argnum >= args.len() {
        return Err(Error::invalid_config(
            "derivative argnum",
            format!("argnum {argnum} but only {} arguments were given", args.len()),
        ));
    }
    Ok(())
}

pub(crate) fn check_scalar_output(mode: Mode, len: usize) -> Result<()> {
    if len != 1 {
        return Err(Error::dimension(
            format!("{mode} derivative output"),
            "a scalar function",
            len,
        ));
    }
    Ok(())
}

pub(crate) fn promote<T: Scalar>(args: &[DVector<f64>]) -> Vec<Vec<T>> {
    args.iter()
        .map(|a| a.iter().map(|&v| constant::<T>(v)).collect())
        .collect()
}

pub(crate) fn plain(args: &[DVector<f64>]) -> Vec<Vec<f64>> {
    args.iter().map(|a| a.as_slice().to_vec()).collect()
}

#[cfg(test)]
pub(crate) mod test_functions {
    use crate::error::Result;
    use crate::traits::{ArgFunction, Scalar};

    /// `f(x) = [x0², x0·x1]`
    pub struct SquareAndProduct;

    impl<T: Scalar> ArgFunction<T> for SquareAndProduct {
        fn call(&self, args: &[Vec<T>]) -> Result<Vec<T>> {
            let x = &args[0];
            Ok(vec![x[0] * x[0], x[0] * x[1]])
        }
    }

    /// `f(x, a) = a0·sin(x0)·x1² + exp(x1·x2)`
    pub struct Scalarized;

    impl<T: Scalar> ArgFunction<T> for Scalarized {
        fn call(&self, args: &[Vec<T>]) -> Result<Vec<T>> {
            let x = &args[0];
            let a = &args[1];
            Ok(vec![a[0] * x[0].sin() * x[1] * x[1] + (x[1] * x[2]).exp()])
        }
    }

    /// `f(x) = A x` for a fixed row-major `A`.
    pub struct Linear {
        pub rows: usize,
        pub cols: usize,
        pub entries: Vec<f64>,
    }

    impl<T: Scalar> ArgFunction<T> for Linear {
        fn call(&self, args: &[Vec<T>]) -> Result<Vec<T>> {
            let x = &args[0];
            Ok((0..self.rows)
                .map(|i| {
                    (0..self.cols).fold(T::zero(), |acc, j| {
                        acc + crate::traits::constant::<T>(self.entries[i * self.cols + j]) * x[j]
                    })
                })
                .collect())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::test_functions::*;
    use super::*;

    fn assert_err_contains<T: std::fmt::Debug>(result: Result<T>, needle: &str) {
        let err = result.expect_err("expected error");
        let message = format!("{err}");
        assert!(
            message.contains(needle),
            "expected error to contain \"{needle}\", got \"{message}\""
        );
    }

    #[test]
    fn unknown_mode_is_rejected_at_construction() {
        assert_err_contains("jacobian".parse::<Mode>(), "not one of fwd");
        assert_eq!("hess".parse::<Mode>().expect("valid mode"), Mode::Hess);
    }

    #[test]
    fn finite_difference_agrees_with_autodiff() {
        let x = DVector::from_vec(vec![0.7, -1.3]);
        let ad = make_derivative(&DerivativeSettings::default(), SquareAndProduct, 0, Mode::Fwd)
            .expect("ad handle")
            .compute(&[x.clone()])
            .expect("ad jacobian")
            .into_matrix();
        let fd = make_derivative(
            &DerivativeSettings::finite_difference(1e-3),
            SquareAndProduct,
            0,
            Mode::Fwd,
        )
        .expect("fd handle")
        .compute(&[x])
        .expect("fd jacobian")
        .into_matrix();
        for (a, f) in ad.iter().zip(fd.iter()) {
            assert!((a - f).abs() <= 1e-4 * a.abs().max(1.0));
        }
    }

    #[test]
    fn all_backends_agree_on_hessian_and_jvp() {
        let args = [
            DVector::from_vec(vec![0.3, 0.8, -0.4]),
            DVector::from_vec(vec![1.7]),
        ];
        let settings = [
            DerivativeSettings::default(),
            DerivativeSettings::finite_difference(1e-4),
        ];
        let hessians: Vec<DMatrix<f64>> = settings
            .iter()
            .map(|s| {
                make_derivative(s, Scalarized, 0, Mode::Hess)
                    .expect("handle")
                    .compute(&args)
                    .expect("hessian")
                    .into_matrix()
            })
            .collect();
        assert!((&hessians[0] - &hessians[0].transpose()).amax() < 1e-14);
        assert!((&hessians[0] - &hessians[1]).amax() < 1e-5);

        let v = DVector::from_vec(vec![1.0, -2.0, 0.5]);
        let grad = make_derivative(&settings[0], Scalarized, 0, Mode::Grad)
            .expect("handle")
            .compute(&args)
            .expect("gradient")
            .into_vector()
            .expect("vector");
        for s in &settings {
            let jvp = make_derivative(s, Scalarized, 0, Mode::Jvp)
                .expect("handle")
                .jvp(&v, &args)
                .expect("jvp");
            assert!((jvp[0] - grad.dot(&v)).abs() < 1e-6);
        }
    }

    #[test]
    fn single_output_jacobian_collapses_to_vector() {
        let handle = AutoDiffDerivative::new(Scalarized, 0, Mode::Rev);
        let out = handle
            .compute(&[DVector::from_vec(vec![0.1, 0.2, 0.3]), DVector::from_vec(vec![2.0])])
            .expect("jacobian");
        assert!(matches!(out, Differential::Vector(ref v) if v.len() == 3));
    }

    #[test]
    fn grad_of_vector_function_is_rejected() {
        let handle = AutoDiffDerivative::new(SquareAndProduct, 0, Mode::Grad);
        assert_err_contains(
            handle.compute(&[DVector::from_vec(vec![1.0, 2.0])]),
            "a scalar function",
        );
        let fd = FiniteDiffDerivative::new(SquareAndProduct, 0, Mode::Hess, 1e-3).expect("handle");
        assert_err_contains(fd.compute(&[DVector::from_vec(vec![1.0, 2.0])]), "a scalar function");
    }

    #[test]
    fn jvp_requires_jvp_mode() {
        let handle = AutoDiffDerivative::new(SquareAndProduct, 0, Mode::Fwd);
        let v = DVector::from_vec(vec![1.0, 0.0]);
        assert_err_contains(handle.jvp(&v, &[v.clone()]), "built in fwd mode");
    }
}
