use super::{plain, JacobianEstimator};
use crate::error::{Error, Result};
use crate::traits::ArgFunction;
use nalgebra::{DMatrix, DVector};

/// Jacobian tracked by rank-one secant updates.
///
/// Each call moves the anchor to the new point. Steps shorter than `minstep`
/// leave the estimate untouched.
pub struct BroydenJacobian<F> {
    fun: F,
    x: DVector<f64>,
    f: DVector<f64>,
    jacobian: DMatrix<f64>,
    minstep: f64,
}

impl<F: ArgFunction<f64>> BroydenJacobian<F> {
    /// Starts from `j0`, or the (rectangular) identity when `None`.
    pub fn new(
        fun: F,
        x0: DVector<f64>,
        f0: DVector<f64>,
        j0: Option<DMatrix<f64>>,
        minstep: f64,
    ) -> Result<Self> {
        let jacobian = j0.unwrap_or_else(|| DMatrix::identity(f0.len(), x0.len()));
        if jacobian.shape() != (f0.len(), x0.len()) {
            return Err(Error::dimension(
                "broyden initial jacobian",
                format!("{}x{}", f0.len(), x0.len()),
                jacobian.nrows() * jacobian.ncols(),
            ));
        }
        Ok(Self {
            fun,
            x: x0,
            f: f0,
            jacobian,
            minstep,
        })
    }

    pub fn current(&self) -> &DMatrix<f64> {
        &self.jacobian
    }
}

impl<F: ArgFunction<f64>> JacobianEstimator for BroydenJacobian<F> {
    fn jacobian(&mut self, args: &[DVector<f64>]) -> Result<DMatrix<f64>> {
        let x = args
            .first()
            .ok_or_else(|| Error::dimension("broyden arguments", "at least one argument", 0))?;
        if x.len() != self.x.len() {
            return Err(Error::dimension("broyden point", self.x.len(), x.len()));
        }
        let dx = x - &self.x;
        self.x = x.clone();
        let step = dx.norm();
        if step < self.minstep {
            log::debug!("broyden: step {step:e} below minstep, keeping previous jacobian");
            return Ok(self.jacobian.clone());
        }

        let f_new = DVector::from_vec(self.fun.call(&plain(args))?);
        if f_new.len() != self.f.len() {
            return Err(Error::dimension("broyden function output", self.f.len(), f_new.len()));
        }
        let df = &f_new - &self.f;
        self.f = f_new;
        let correction = (df - &self.jacobian * &dx) / (step * step);
        self.jacobian += correction * dx.transpose();
        Ok(self.jacobian.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::derivatives::PlainFn;

    fn quadratic() -> PlainFn<impl Fn(&[Vec<f64>]) -> Result<Vec<f64>>> {
        PlainFn(|a: &[Vec<f64>]| -> Result<Vec<f64>> {
            let x = &a[0];
            Ok(vec![x[0] * x[0] + x[1], 3.0 * x[1]])
        })
    }

    #[test]
    fn tiny_step_returns_identical_jacobian() {
        let x0 = DVector::from_vec(vec![1.0, 2.0]);
        let f0 = DVector::from_vec(vec![3.0, 6.0]);
        let j0 = DMatrix::from_row_slice(2, 2, &[2.0, 1.0, 0.0, 3.0]);
        let mut broyden =
            BroydenJacobian::new(quadratic(), x0.clone(), f0, Some(j0.clone()), 1e-12)
                .expect("broyden");
        let nudged = DVector::from_vec(vec![1.0 + 1e-14, 2.0]);
        let jac = broyden.jacobian(&[nudged]).expect("jacobian");
        assert_eq!(jac, j0);
        assert_eq!(broyden.current(), &j0);
    }

    #[test]
    fn secant_condition_holds_after_update() {
        let fun = quadratic();
        let x0 = DVector::from_vec(vec![1.0, 2.0]);
        let f0 = DVector::from_vec(fun.call(&[x0.as_slice().to_vec()]).expect("f0"));
        let mut broyden = BroydenJacobian::new(fun, x0.clone(), f0.clone(), None, 1e-12)
            .expect("broyden");
        let x1 = DVector::from_vec(vec![1.1, 1.9]);
        let jac = broyden.jacobian(&[x1.clone()]).expect("jacobian");
        let f1 = DVector::from_vec(vec![1.1 * 1.1 + 1.9, 3.0 * 1.9]);
        assert_eq!(broyden.current(), &jac);
        let predicted = &f0 + &jac * (&x1 - &x0);
        assert!((predicted - f1).amax() < 1e-12);
    }

    #[test]
    fn mismatched_initial_jacobian_is_rejected() {
        let result = BroydenJacobian::new(
            quadratic(),
            DVector::zeros(2),
            DVector::zeros(2),
            Some(DMatrix::zeros(3, 2)),
            1e-12,
        );
        assert!(result.is_err());
    }
}
