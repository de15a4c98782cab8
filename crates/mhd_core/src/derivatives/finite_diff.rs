use super::{
    check_argnum, check_scalar_output, plain, split_tangent, Derivative, Differential, Mode,
};
use crate::error::{Error, Result};
use crate::traits::ArgFunction;
use nalgebra::{DMatrix, DVector};

/// Second-order central finite differences.
///
/// Step per component is `rel_step * max(1, |x_i|)`; `jvp` takes a single
/// step of length `rel_step` along the normalized tangent.
pub struct FiniteDiffDerivative<F> {
    fun: F,
    argnum: usize,
    mode: Mode,
    rel_step: f64,
}

impl<F: ArgFunction<f64>> FiniteDiffDerivative<F> {
    pub fn new(fun: F, argnum: usize, mode: Mode, rel_step: f64) -> Result<Self> {
        if !(rel_step.is_finite() && rel_step > 0.0) {
            return Err(Error::invalid_config(
                "finite difference rel_step",
                format!("must be positive and finite, got {rel_step}"),
            ));
        }
        Ok(Self {
            fun,
            argnum,
            mode,
            rel_step,
        })
    }

    pub fn rel_step(&self) -> f64 {
        self.rel_step
    }

    fn eval(&self, work: &[Vec<f64>]) -> Result<DVector<f64>> {
        Ok(DVector::from_vec(self.fun.call(work)?))
    }

    fn step(&self, x: f64) -> f64 {
        self.rel_step * x.abs().max(1.0)
    }

    fn jacobian(&self, args: &[DVector<f64>]) -> Result<DMatrix<f64>> {
        check_argnum(self.argnum, args)?;
        let x = &args[self.argnum];
        let n = x.len();
        let mut work = plain(args);
        if n == 0 {
            return Ok(DMatrix::zeros(self.eval(&work)?.len(), 0));
        }

        let mut jacobian = DMatrix::zeros(0, 0);
        for i in 0..n {
            let h = self.step(x[i]);
            let (x_plus, x_minus) = (x[i] + h, x[i] - h);
            work[self.argnum][i] = x_plus;
            let f_plus = self.eval(&work)?;
            work[self.argnum][i] = x_minus;
            let f_minus = self.eval(&work)?;
            work[self.argnum][i] = x[i];

            if i == 0 {
                jacobian = DMatrix::zeros(f_plus.len(), n);
            }
            let dx = x_plus - x_minus;
            jacobian.set_column(i, &((f_plus - f_minus) / dx));
        }
        Ok(jacobian)
    }

    fn hessian(&self, args: &[DVector<f64>]) -> Result<DMatrix<f64>> {
        check_argnum(self.argnum, args)?;
        let x = args[self.argnum].clone();
        let n = x.len();
        let mut work = plain(args);
        let f0 = self.eval(&work)?;
        check_scalar_output(Mode::Hess, f0.len())?;
        let f0 = f0[0];
        let h: Vec<f64> = x.iter().map(|&v| self.step(v)).collect();

        let mut eval_at = |offsets: &[(usize, f64)]| -> Result<f64> {
            for &(k, delta) in offsets {
                work[self.argnum][k] += delta;
            }
            let value = self.eval(&work).map(|f| f[0]);
            for (k, _) in offsets {
                work[self.argnum][*k] = x[*k];
            }
            value
        };

        let mut hessian = DMatrix::zeros(n, n);
        for i in 0..n {
            let f_pp = eval_at(&[(i, 2.0 * h[i])])?;
            let f_mm = eval_at(&[(i, -2.0 * h[i])])?;
            hessian[(i, i)] = (f_pp - 2.0 * f0 + f_mm) / (4.0 * h[i] * h[i]);
            for j in (i + 1)..n {
                let f_pp = eval_at(&[(i, h[i]), (j, h[j])])?;
                let f_pm = eval_at(&[(i, h[i]), (j, -h[j])])?;
                let f_mp = eval_at(&[(i, -h[i]), (j, h[j])])?;
                let f_mm = eval_at(&[(i, -h[i]), (j, -h[j])])?;
                let value = (f_pp - f_pm - f_mp + f_mm) / (4.0 * h[i] * h[j]);
                hessian[(i, j)] = value;
                hessian[(j, i)] = value;
            }
        }
        Ok(hessian)
    }

    fn jvp_at(&self, tangent: &DVector<f64>, args: &[DVector<f64>]) -> Result<DVector<f64>> {
        check_argnum(self.argnum, args)?;
        let x = &args[self.argnum];
        if tangent.len() != x.len() {
            return Err(Error::dimension("jvp tangent", x.len(), tangent.len()));
        }
        let mut work = plain(args);
        let norm = tangent.norm();
        if norm == 0.0 {
            let len = self.eval(&work)?.len();
            return Ok(DVector::zeros(len));
        }
        let direction = tangent / norm;
        let h = self.rel_step;

        let forward = x + &direction * h;
        work[self.argnum].copy_from_slice(forward.as_slice());
        let f_plus = self.eval(&work)?;
        let backward = x - &direction * h;
        work[self.argnum].copy_from_slice(backward.as_slice());
        let f_minus = self.eval(&work)?;

        Ok((f_plus - f_minus) / (2.0 * h) * norm)
    }
}

impl<F: ArgFunction<f64>> Derivative for FiniteDiffDerivative<F> {
    fn mode(&self) -> Mode {
        self.mode
    }

    fn argnum(&self) -> usize {
        self.argnum
    }

    fn compute(&self, args: &[DVector<f64>]) -> Result<Differential> {
        match self.mode {
            Mode::Fwd | Mode::Rev => Ok(Differential::from_jacobian(self.jacobian(args)?)),
            Mode::Grad => {
                let jacobian = self.jacobian(args)?;
                check_scalar_output(Mode::Grad, jacobian.nrows())?;
                Ok(Differential::Vector(jacobian.row(0).transpose()))
            }
            Mode::Hess => Ok(Differential::Matrix(self.hessian(args)?)),
            Mode::Jvp => {
                let (tangent, rest) = split_tangent(args)?;
                Ok(Differential::Vector(self.jvp_at(tangent, rest)?))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::derivatives::PlainFn;

    #[test]
    fn rejects_non_positive_step() {
        let err = FiniteDiffDerivative::new(
            PlainFn(|a: &[Vec<f64>]| -> Result<Vec<f64>> { Ok(a[0].clone()) }),
            0,
            Mode::Fwd,
            0.0,
        )
        .err()
        .expect("zero step must fail");
        assert!(format!("{err}").contains("rel_step"));
    }

    #[test]
    fn step_scales_with_magnitude() {
        // f(x) = x^3 at a large x: central difference error is h^2 f'''/6 = h^2.
        let fd = FiniteDiffDerivative::new(
            PlainFn(|a: &[Vec<f64>]| -> Result<Vec<f64>> { Ok(vec![a[0][0].powi(3)]) }),
            0,
            Mode::Grad,
            1e-4,
        )
        .expect("handle");
        let x = 200.0;
        let grad = fd
            .compute(&[DVector::from_vec(vec![x])])
            .expect("gradient")
            .into_vector()
            .expect("vector");
        let h = fd.rel_step() * x;
        assert!((grad[0] - (3.0 * x * x + h * h)).abs() < 1e-4);
    }

    #[test]
    fn zero_tangent_gives_zero_product() {
        let fd = FiniteDiffDerivative::new(
            PlainFn(|a: &[Vec<f64>]| -> Result<Vec<f64>> {
                Ok(vec![a[0][0].exp(), a[0][1]])
            }),
            0,
            Mode::Jvp,
            1e-3,
        )
        .expect("handle");
        let out = fd
            .jvp(&DVector::zeros(2), &[DVector::from_vec(vec![0.2, 0.1])])
            .expect("jvp");
        assert_eq!(out.as_slice(), &[0.0, 0.0]);
    }
}
