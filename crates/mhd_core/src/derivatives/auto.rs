use super::{
    check_argnum, check_scalar_output, promote, split_tangent, Derivative, Differentiable,
    Differential, Mode,
};
use crate::autodiff::{Dual, HyperDual, Reverse, Tape};
use crate::error::{Error, Result};
use crate::traits::ArgFunction;
use nalgebra::{DMatrix, DVector};

/// Exact derivatives through the dual, hyper-dual and tape scalars.
///
/// * `fwd`: one dual pass per input component.
/// * `rev` / `grad`: one recording, one reverse sweep per output.
/// * `hess`: `n(n+1)/2` hyper-dual passes.
/// * `jvp`: one dual pass seeded with the tangent on `argnum` only.
pub struct AutoDiffDerivative<F> {
    fun: F,
    argnum: usize,
    mode: Mode,
}

impl<F: Differentiable> AutoDiffDerivative<F> {
    pub fn new(fun: F, argnum: usize, mode: Mode) -> Self {
        Self { fun, argnum, mode }
    }

    pub fn with_mode_name(fun: F, argnum: usize, mode: &str) -> Result<Self> {
        Ok(Self::new(fun, argnum, mode.parse()?))
    }

    fn output_len(&self, args: &[DVector<f64>]) -> Result<usize> {
        let plain = super::plain(args);
        Ok(ArgFunction::<f64>::call(&self.fun, &plain)?.len())
    }

    fn jacobian_forward(&self, args: &[DVector<f64>]) -> Result<DMatrix<f64>> {
        check_argnum(self.argnum, args)?;
        let x = &args[self.argnum];
        let n = x.len();
        if n == 0 {
            return Ok(DMatrix::zeros(self.output_len(args)?, 0));
        }

        let mut dual_args: Vec<Vec<Dual>> = promote(args);
        let mut jacobian = DMatrix::zeros(0, 0);
        for j in 0..n {
            for (i, value) in dual_args[self.argnum].iter_mut().enumerate() {
                *value = Dual::new(x[i], if i == j { 1.0 } else { 0.0 });
            }
            let out = ArgFunction::<Dual>::call(&self.fun, &dual_args)?;
            if j == 0 {
                jacobian = DMatrix::zeros(out.len(), n);
            }
            for (i, value) in out.iter().enumerate() {
                jacobian[(i, j)] = value.eps;
            }
        }
        Ok(jacobian)
    }

    fn record(&self, args: &[DVector<f64>]) -> Result<(Vec<Reverse>, Tape)> {
        check_argnum(self.argnum, args)?;
        let (outputs, tape) = Tape::record(args[self.argnum].as_slice(), |variables| {
            let mut rev_args: Vec<Vec<Reverse>> = promote(args);
            rev_args[self.argnum] = variables.to_vec();
            ArgFunction::<Reverse>::call(&self.fun, &rev_args)
        });
        Ok((outputs?, tape))
    }

    fn jacobian_reverse(&self, args: &[DVector<f64>]) -> Result<DMatrix<f64>> {
        let (outputs, tape) = self.record(args)?;
        let n = tape.num_inputs();
        let mut jacobian = DMatrix::zeros(outputs.len(), n);
        for (i, output) in outputs.iter().enumerate() {
            let row = tape.gradient(*output);
            for (j, value) in row.into_iter().enumerate() {
                jacobian[(i, j)] = value;
            }
        }
        Ok(jacobian)
    }

    fn gradient(&self, args: &[DVector<f64>]) -> Result<DVector<f64>> {
        let (outputs, tape) = self.record(args)?;
        check_scalar_output(Mode::Grad, outputs.len())?;
        Ok(DVector::from_vec(tape.gradient(outputs[0])))
    }

    fn hessian(&self, args: &[DVector<f64>]) -> Result<DMatrix<f64>> {
        check_argnum(self.argnum, args)?;
        let x = &args[self.argnum];
        let n = x.len();
        let mut hyper_args: Vec<Vec<HyperDual>> = promote(args);
        let mut hessian = DMatrix::zeros(n, n);
        for i in 0..n {
            for j in i..n {
                for (k, value) in hyper_args[self.argnum].iter_mut().enumerate() {
                    *value = HyperDual::new(
                        x[k],
                        if k == i { 1.0 } else { 0.0 },
                        if k == j { 1.0 } else { 0.0 },
                        0.0,
                    );
                }
                let out = ArgFunction::<HyperDual>::call(&self.fun, &hyper_args)?;
                check_scalar_output(Mode::Hess, out.len())?;
                hessian[(i, j)] = out[0].e12;
                hessian[(j, i)] = out[0].e12;
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
        let mut dual_args: Vec<Vec<Dual>> = promote(args);
        dual_args[self.argnum] = x
            .iter()
            .zip(tangent.iter())
            .map(|(&v, &t)| Dual::new(v, t))
            .collect();
        let out = ArgFunction::<Dual>::call(&self.fun, &dual_args)?;
        Ok(DVector::from_iterator(out.len(), out.iter().map(|d| d.eps)))
    }
}

impl<F: Differentiable> Derivative for AutoDiffDerivative<F> {
    fn mode(&self) -> Mode {
        self.mode
    }

    fn argnum(&self) -> usize {
        self.argnum
    }

    fn compute(&self, args: &[DVector<f64>]) -> Result<Differential> {
        match self.mode {
            Mode::Fwd => Ok(Differential::from_jacobian(self.jacobian_forward(args)?)),
            Mode::Rev => Ok(Differential::from_jacobian(self.jacobian_reverse(args)?)),
            Mode::Grad => Ok(Differential::Vector(self.gradient(args)?)),
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
    use crate::derivatives::test_functions::{Linear, SquareAndProduct};

    #[test]
    fn forward_and_reverse_jacobians_match() {
        let x = DVector::from_vec(vec![1.5, -0.5]);
        let fwd = AutoDiffDerivative::new(SquareAndProduct, 0, Mode::Fwd)
            .compute(&[x.clone()])
            .expect("fwd")
            .into_matrix();
        let rev = AutoDiffDerivative::new(SquareAndProduct, 0, Mode::Rev)
            .compute(&[x])
            .expect("rev")
            .into_matrix();
        let expected = DMatrix::from_row_slice(2, 2, &[3.0, 0.0, -0.5, 1.5]);
        assert!((&fwd - &expected).amax() < 1e-15);
        assert!((&rev - &expected).amax() < 1e-15);
    }

    #[test]
    fn jvp_perturbs_only_the_designated_argument() {
        let linear = Linear {
            rows: 2,
            cols: 3,
            entries: vec![1.0, 2.0, 3.0, -1.0, 0.0, 4.0],
        };
        let handle = AutoDiffDerivative::with_mode_name(linear, 0, "jvp").expect("valid mode");
        let v = DVector::from_vec(vec![1.0, 1.0, 1.0]);
        let out = handle
            .compute(&[v, DVector::from_vec(vec![9.0, 9.0, 9.0])])
            .expect("jvp")
            .into_vector()
            .expect("vector");
        assert_eq!(out.as_slice(), &[6.0, 3.0]);
    }

    #[test]
    fn argnum_out_of_range_is_reported() {
        let handle = AutoDiffDerivative::new(SquareAndProduct, 2, Mode::Fwd);
        let err = handle
            .compute(&[DVector::from_vec(vec![1.0, 2.0])])
            .expect_err("argnum out of range");
        assert!(format!("{err}").contains("argnum 2"));
    }
}
