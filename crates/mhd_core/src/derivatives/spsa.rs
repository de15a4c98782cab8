use super::{plain, JacobianEstimator};
use crate::error::{Error, Result};
use crate::traits::ArgFunction;
use nalgebra::{DMatrix, DVector};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

/// Simultaneous-perturbation stochastic approximation of a Jacobian.
///
/// Each sample perturbs every component at once by `±h_i`, with
/// `h_i = rel_step * sign(x_i) * max(1, |x_i|)` and independent fair signs.
/// The estimate is the mean of the `num_samples` rank-one central differences.
/// Error shrinks like `1/sqrt(num_samples)`.
pub struct SpsaJacobian<F> {
    fun: F,
    rel_step: f64,
    num_samples: usize,
    rng: StdRng,
}

impl<F: ArgFunction<f64>> SpsaJacobian<F> {
    pub fn new(fun: F, rel_step: f64, num_samples: usize, seed: Option<u64>) -> Result<Self> {
        if !(rel_step.is_finite() && rel_step > 0.0) {
            return Err(Error::invalid_config(
                "spsa rel_step",
                format!("must be positive and finite, got {rel_step}"),
            ));
        }
        if num_samples == 0 {
            return Err(Error::invalid_config(
                "spsa num_samples",
                "at least one sample is required",
            ));
        }
        let rng = match seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        Ok(Self {
            fun,
            rel_step,
            num_samples,
            rng,
        })
    }
}

impl<F: ArgFunction<f64>> JacobianEstimator for SpsaJacobian<F> {
    fn jacobian(&mut self, args: &[DVector<f64>]) -> Result<DMatrix<f64>> {
        let x0 = args
            .first()
            .ok_or_else(|| Error::dimension("spsa arguments", "at least one argument", 0))?;
        let n = x0.len();
        let mut work = plain(args);
        let m = self.fun.call(&work)?.len();

        let h: Vec<f64> = x0
            .iter()
            .map(|&x| {
                let sign = if x >= 0.0 { 1.0 } else { -1.0 };
                self.rel_step * sign * x.abs().max(1.0)
            })
            .collect();

        let mut jacobian = DMatrix::zeros(m, n);
        let mut dx = vec![0.0; n];
        for _ in 0..self.num_samples {
            for (j, step) in dx.iter_mut().enumerate() {
                *step = if self.rng.gen_bool(0.5) { h[j] } else { -h[j] };
            }
            for j in 0..n {
                work[0][j] = x0[j] + dx[j];
            }
            let f_plus = self.fun.call(&work)?;
            for j in 0..n {
                work[0][j] = x0[j] - dx[j];
            }
            let f_minus = self.fun.call(&work)?;
            if f_plus.len() != m || f_minus.len() != m {
                return Err(Error::dimension("spsa function output", m, f_plus.len()));
            }

            for j in 0..n {
                let width = (x0[j] + dx[j]) - (x0[j] - dx[j]);
                for i in 0..m {
                    jacobian[(i, j)] += (f_plus[i] - f_minus[i]) / width;
                }
            }
        }
        Ok(jacobian / self.num_samples as f64)
    }
}
