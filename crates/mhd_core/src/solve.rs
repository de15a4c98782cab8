use crate::error::{Error, Result};
use crate::objectives::ObjectiveFunction;
use nalgebra::DVector;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(default)]
pub struct LeastSquaresSettings {
    pub max_steps: usize,
    pub damping: f64,
    pub tolerance: f64,
}

impl Default for LeastSquaresSettings {
    fn default() -> Self {
        Self {
            max_steps: 25,
            damping: 1.0,
            tolerance: 1e-9,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LeastSquaresResult {
    /// Reduced variables.
    pub x: Vec<f64>,
    /// Full state `y0 + Z x`.
    pub y: Vec<f64>,
    pub residual_norm: f64,
    pub iterations: usize,
}

/// Gauss-Newton iteration on the reduced variables of a built objective function.
///
/// Stops once `|f|` or `|Jᵀ f|` drops to the tolerance. Each step is the
/// minimum-norm least-squares solution of `J dx = f`.
pub fn solve_least_squares(
    objective: &ObjectiveFunction,
    x0: &DVector<f64>,
    settings: LeastSquaresSettings,
) -> Result<LeastSquaresResult> {
    let dim = objective.dim_x()?;
    if x0.len() != dim {
        return Err(Error::dimension("least squares initial guess", dim, x0.len()));
    }
    if settings.max_steps == 0 {
        return Err(Error::invalid_config("least squares", "max_steps must be greater than zero"));
    }
    if settings.damping <= 0.0 {
        return Err(Error::invalid_config("least squares", "damping must be positive"));
    }
    if settings.tolerance <= 0.0 {
        return Err(Error::invalid_config("least squares", "tolerance must be positive"));
    }

    let mut x = x0.clone();
    let mut residual = objective.compute(&x)?;
    let mut residual_norm = residual.norm();
    let mut iterations = 0usize;

    loop {
        if residual_norm <= settings.tolerance {
            break;
        }
        let jacobian = objective.jac(&x)?;
        if jacobian.tr_mul(&residual).norm() <= settings.tolerance {
            log::debug!("least squares reached a stationary point with |f| = {residual_norm:e}");
            break;
        }
        if iterations >= settings.max_steps {
            return Err(Error::NotConverged {
                solver: "Gauss-Newton".to_string(),
                steps: settings.max_steps,
                residual: residual_norm,
            });
        }

        let delta = jacobian
            .svd(true, true)
            .solve(&residual, f64::EPSILON)
            .map_err(|e| Error::numerical("Gauss-Newton step", e))?;
        x -= settings.damping * delta;

        iterations += 1;
        residual = objective.compute(&x)?;
        residual_norm = residual.norm();
        log::debug!("step {iterations}: |f| = {residual_norm:10.3e}");
    }

    let y = objective.recover(&x)?;
    Ok(LeastSquaresResult {
        x: x.as_slice().to_vec(),
        y: y.as_slice().to_vec(),
        residual_norm,
        iterations,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::equilibrium::{Arg, Equilibrium, EquilibriumConfig};
    use crate::objectives::test_objectives::Quadratic;
    use crate::objectives::{FixPsi, ObjectiveFunctionSettings};

    fn problem() -> (ObjectiveFunction, DVector<f64>) {
        let eq = Equilibrium::from_config(&EquilibriumConfig::default()).expect("equilibrium");
        let mut of = ObjectiveFunction::new(
            vec![Box::new(Quadratic::new())],
            vec![Box::new(FixPsi::new().target(1.5))],
            ObjectiveFunctionSettings::default(),
        );
        of.build(&eq).expect("build");
        let mut y = of.y(&eq).expect("y");
        let r0 = of.y_idx().expect("y_idx")[&Arg::RLmn].start;
        y[r0] = 10.0;
        let x0 = of.project(&y).expect("x0");
        (of, x0)
    }

    #[test]
    fn gauss_newton_solves_constrained_quadratic() -> anyhow::Result<()> {
        let (of, x0) = problem();
        let result = solve_least_squares(&of, &x0, LeastSquaresSettings::default())?;
        assert!(result.residual_norm <= 1e-9);
        assert!(result.iterations > 1);
        let r0 = of.y_idx()?[&Arg::RLmn].start;
        let psi = of.y_idx()?[&Arg::Psi].start;
        assert!((result.y[r0] - 2.0).abs() < 1e-8);
        assert!((result.y[psi] - 1.5).abs() < 1e-12);
        Ok(())
    }

    #[test]
    fn step_limit_reports_residual() {
        let (of, x0) = problem();
        let settings = LeastSquaresSettings {
            max_steps: 1,
            ..LeastSquaresSettings::default()
        };
        match solve_least_squares(&of, &x0, settings) {
            Err(Error::NotConverged { steps, residual, .. }) => {
                assert_eq!(steps, 1);
                assert!(residual > 1.0);
            }
            other => panic!("expected NotConverged, got {other:?}"),
        }
    }

    #[test]
    fn invalid_settings_are_rejected() {
        let (of, x0) = problem();
        let settings = LeastSquaresSettings {
            damping: 0.0,
            ..LeastSquaresSettings::default()
        };
        assert!(matches!(
            solve_least_squares(&of, &x0, settings),
            Err(Error::InvalidConfiguration { .. })
        ));
        let short = DVector::zeros(x0.len() - 1);
        assert!(matches!(
            solve_least_squares(&of, &short, LeastSquaresSettings::default()),
            Err(Error::InvalidDimension { .. })
        ));
    }
}
