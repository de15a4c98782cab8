//! Residual objectives and their composition.
//!
//! An objective is built once against an [`Equilibrium`]; building fixes its
//! residual length `dim_f`, broadcasts scalar targets and weights, and fills
//! the per-argument derivative table. Linear objectives store constant
//! matrices; nonlinear ones differentiate on demand.

use crate::autodiff::{Dual, HyperDual, Reverse};
use crate::derivatives::{make_derivative, DerivativeSettings, Mode};
use crate::equilibrium::{Arg, ArgValues, Equilibrium};
use crate::error::{Error, Result};
use crate::traits::{constant, ArgFunction, Scalar};
use nalgebra::{DMatrix, DVector};
use std::collections::BTreeMap;

mod function;
mod generic;
mod linear;

pub use function::{CompileMode, ObjectiveFunction, ObjectiveFunctionSettings};
pub use generic::{Energy, GenericObjective, TargetCurrent, Volume};
pub use linear::{FixBoundary, FixLambdaGauge, FixProfile, FixPsi, LcfsBoundary, TargetIota};

/// Residual of an objective evaluated at scalar type `T`.
pub trait Residual<T: Scalar> {
    /// `(value - target) * weight`, length `dim_f`.
    fn compute(&self, args: &ArgValues<T>) -> Result<Vec<T>>;

    fn compute_scalar(&self, args: &ArgValues<T>) -> Result<T> {
        let f = self.compute(args)?;
        Ok(f.iter().fold(T::zero(), |acc, &v| acc + v * v) * constant::<T>(0.5))
    }
}

pub trait Objective:
    Residual<f64> + Residual<Dual> + Residual<HyperDual> + Residual<Reverse> + Send + Sync
{
    fn name(&self) -> &str;

    fn units(&self) -> &str {
        "(dimensionless)"
    }

    fn linear(&self) -> bool;

    /// Whether the natural form of the objective is a single number.
    fn scalar(&self) -> bool {
        false
    }

    fn core(&self) -> &ObjectiveCore;

    fn core_mut(&mut self) -> &mut ObjectiveCore;

    fn build(&mut self, eq: &Equilibrium, settings: &DerivativeSettings) -> Result<()>;

    /// Argument whose values are the natural target, if any.
    fn target_arg(&self) -> Option<Arg> {
        None
    }

    /// Refreshes the target from `eq` without rebuilding.
    fn update_target(&mut self, eq: &Equilibrium) -> Result<()> {
        if let Some(arg) = self.target_arg() {
            let values = eq.arg(arg).as_slice().to_vec();
            self.core_mut().set_target(values)?;
        }
        Ok(())
    }

    fn callback(&self, args: &ArgValues<f64>) -> Result<()> {
        let f = Residual::<f64>::compute(self, args)?;
        let norm = f.iter().map(|v| v * v).sum::<f64>().sqrt();
        log::info!("{} error: {:10.3e} {}", self.name(), norm, self.units());
        Ok(())
    }

    fn args(&self) -> &[Arg] {
        &self.core().args
    }

    fn dim_f(&self) -> usize {
        self.core().dim_f
    }

    fn built(&self) -> bool {
        self.core().built
    }

    /// Derivative of the residual w.r.t. `arg`, shaped `(dim_f, dimensions[arg])`
    /// whether or not the residual depends on `arg`.
    fn jacobian(&self, arg: Arg, state: &ArgValues<f64>) -> Result<DMatrix<f64>> {
        let core = self.core();
        core.require_built("jacobian")?;
        let cols = core.dimension(arg)?;
        match core.derivatives.get(&arg) {
            Some(ArgDerivative::Constant(matrix)) => Ok(matrix.clone()),
            Some(ArgDerivative::Engine) => differentiate(self, arg, state, &core.settings),
            Some(ArgDerivative::Zero) | None => Ok(DMatrix::zeros(core.dim_f, cols)),
        }
    }
}

/// Entry of an objective's derivative table.
#[derive(Debug, Clone)]
pub enum ArgDerivative {
    /// Precomputed at build (linear objectives).
    Constant(DMatrix<f64>),
    /// Evaluated by the derivative engine when requested.
    Engine,
    /// The residual does not read this argument.
    Zero,
}

/// State shared by every objective.
#[derive(Debug, Clone)]
pub struct ObjectiveCore {
    name: String,
    target: Vec<f64>,
    weight: Vec<f64>,
    dim_f: usize,
    dimensions: BTreeMap<Arg, usize>,
    args: Vec<Arg>,
    derivatives: BTreeMap<Arg, ArgDerivative>,
    settings: DerivativeSettings,
    built: bool,
}

impl ObjectiveCore {
    pub fn new(name: impl Into<String>, target: Vec<f64>, weight: Vec<f64>) -> Self {
        Self {
            name: name.into(),
            target,
            weight,
            dim_f: 0,
            dimensions: BTreeMap::new(),
            args: Vec::new(),
            derivatives: BTreeMap::new(),
            settings: DerivativeSettings::default(),
            built: false,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn target(&self) -> &[f64] {
        &self.target
    }

    pub fn weight(&self) -> &[f64] {
        &self.weight
    }

    pub fn dimensions(&self) -> &BTreeMap<Arg, usize> {
        &self.dimensions
    }

    pub fn derivatives(&self) -> &BTreeMap<Arg, ArgDerivative> {
        &self.derivatives
    }

    /// Sets the target, broadcasting a single value once `dim_f` is known.
    pub fn set_target(&mut self, target: Vec<f64>) -> Result<()> {
        self.target = if self.built {
            self.broadcast(target, "target")?
        } else {
            target
        };
        Ok(())
    }

    pub fn set_weight(&mut self, weight: Vec<f64>) -> Result<()> {
        self.weight = if self.built {
            self.broadcast(weight, "weight")?
        } else {
            weight
        };
        Ok(())
    }

    /// Stores a target (and optionally a weight) for the next build, without
    /// broadcasting.
    pub fn stage(&mut self, target: Vec<f64>, weight: Option<Vec<f64>>) {
        self.built = false;
        self.target = target;
        if let Some(weight) = weight {
            self.weight = weight;
        }
    }

    /// Uniform values are repeated to `dim_f`; anything else must already
    /// have that length.
    fn broadcast(&self, values: Vec<f64>, what: &str) -> Result<Vec<f64>> {
        let uniform = values.first().is_some_and(|&v| values.iter().all(|&x| x == v));
        match values.len() {
            n if n == self.dim_f => Ok(values),
            _ if uniform => Ok(vec![values[0]; self.dim_f]),
            n => Err(Error::dimension(
                format!("{} {what}", self.name),
                self.dim_f,
                n,
            )),
        }
    }

    pub fn require_built(&self, operation: &str) -> Result<()> {
        if self.built {
            Ok(())
        } else {
            Err(Error::not_built(self.name.clone(), operation))
        }
    }

    pub fn dimension(&self, arg: Arg) -> Result<usize> {
        self.dimensions
            .get(&arg)
            .copied()
            .ok_or_else(|| Error::not_built(self.name.clone(), format!("dimension of {arg}")))
    }

    /// Values of `arg` in `args`, checked against the built dimensions.
    pub fn input<'a, T>(&self, args: &'a ArgValues<T>, arg: Arg) -> Result<&'a [T]> {
        let values = args
            .get(&arg)
            .ok_or_else(|| Error::missing(arg.name(), self.name.clone()))?;
        let expected = self.dimension(arg)?;
        if values.len() != expected {
            return Err(Error::dimension(
                format!("{} argument {arg}", self.name),
                expected,
                values.len(),
            ));
        }
        Ok(values)
    }

    /// `(values - target) * weight`.
    pub fn shift_scale<T: Scalar>(&self, values: Vec<T>) -> Result<Vec<T>> {
        self.require_built("compute")?;
        if self.target.len() != self.dim_f {
            return Err(Error::dimension(
                format!("{} target", self.name),
                self.dim_f,
                self.target.len(),
            ));
        }
        if values.len() != self.dim_f {
            return Err(Error::dimension(
                format!("{} residual", self.name),
                self.dim_f,
                values.len(),
            ));
        }
        Ok(values
            .into_iter()
            .zip(self.target.iter().zip(&self.weight))
            .map(|(v, (&t, &w))| (v - constant::<T>(t)) * constant::<T>(w))
            .collect())
    }

    /// First half of a build: sizes, arguments and target/weight broadcast.
    /// The derivative table is filled by [`finish_build`].
    pub fn prepare(
        &mut self,
        eq: &Equilibrium,
        dim_f: usize,
        args: Vec<Arg>,
        settings: &DerivativeSettings,
    ) -> Result<()> {
        self.dim_f = dim_f;
        self.dimensions = eq.dimensions();
        self.args = args;
        self.settings = *settings;
        let target = std::mem::take(&mut self.target);
        self.target = self.broadcast(target, "target")?;
        let weight = std::mem::take(&mut self.weight);
        self.weight = self.broadcast(weight, "weight")?;
        self.derivatives.clear();
        self.built = false;
        Ok(())
    }
}

/// Completes a build started with [`ObjectiveCore::prepare`].
pub fn finish_build<O: Objective + ?Sized>(objective: &mut O) -> Result<()> {
    objective.core_mut().built = true;
    let table = match derivative_table(&*objective) {
        Ok(table) => table,
        Err(err) => {
            objective.core_mut().built = false;
            return Err(err);
        }
    };
    objective.core_mut().derivatives = table;
    log::debug!(
        "built {} (dim_f = {}, args = {:?})",
        objective.name(),
        objective.dim_f(),
        objective.args()
    );
    Ok(())
}

fn derivative_table<O: Objective + ?Sized>(objective: &O) -> Result<BTreeMap<Arg, ArgDerivative>> {
    let core = objective.core();
    // Linear objectives have the same derivative everywhere.
    let zeros: ArgValues<f64> = core
        .dimensions
        .iter()
        .map(|(&arg, &dim)| (arg, vec![0.0; dim]))
        .collect();
    let mut table = BTreeMap::new();
    for arg in Arg::ALL {
        let entry = if !core.args.contains(&arg) {
            ArgDerivative::Zero
        } else if objective.linear() {
            ArgDerivative::Constant(differentiate(objective, arg, &zeros, &core.settings)?)
        } else {
            ArgDerivative::Engine
        };
        table.insert(arg, entry);
    }
    Ok(table)
}

fn differentiate<O: Objective + ?Sized>(
    objective: &O,
    arg: Arg,
    state: &ArgValues<f64>,
    settings: &DerivativeSettings,
) -> Result<DMatrix<f64>> {
    let x = state
        .get(&arg)
        .ok_or_else(|| Error::missing(arg.name(), objective.name()))?;
    let slot = ArgSlot {
        objective,
        arg,
        state,
    };
    let handle = make_derivative(settings, slot, 0, Mode::Fwd)?;
    let jacobian = handle.compute(&[DVector::from_column_slice(x)])?.into_matrix();
    let cols = objective.core().dimension(arg)?;
    if jacobian.nrows() == objective.dim_f() && jacobian.ncols() == cols {
        Ok(jacobian)
    } else if x.is_empty() || objective.dim_f() == 0 {
        Ok(DMatrix::zeros(objective.dim_f(), cols))
    } else {
        Err(Error::dimension(
            format!("{} derivative w.r.t. {arg}", objective.name()),
            format!("{}x{}", objective.dim_f(), cols),
            jacobian.nrows() * jacobian.ncols(),
        ))
    }
}

/// An objective seen as a function of one argument, the others held fixed.
struct ArgSlot<'a, O: ?Sized> {
    objective: &'a O,
    arg: Arg,
    state: &'a ArgValues<f64>,
}

impl<T, O> ArgFunction<T> for ArgSlot<'_, O>
where
    T: Scalar,
    O: Residual<T> + ?Sized,
{
    fn call(&self, args: &[Vec<T>]) -> Result<Vec<T>> {
        let mut values: ArgValues<T> = self
            .state
            .iter()
            .filter(|(arg, _)| **arg != self.arg)
            .map(|(&arg, v)| (arg, v.iter().map(|&x| constant::<T>(x)).collect()))
            .collect();
        let x = args
            .first()
            .ok_or_else(|| Error::dimension("objective argument slot", 1, 0))?;
        values.insert(self.arg, x.clone());
        self.objective.compute(&values)
    }
}

#[cfg(test)]
pub(crate) mod test_objectives {
    use super::*;

    /// `f = [R_lmn[0]^2 - 4, R_lmn[0] * Psi - 3]`.
    pub struct Quadratic {
        pub core: ObjectiveCore,
    }

    impl Quadratic {
        pub fn new() -> Self {
            Self {
                core: ObjectiveCore::new("quadratic", vec![0.0], vec![1.0]),
            }
        }
    }

    impl<T: Scalar> Residual<T> for Quadratic {
        fn compute(&self, args: &ArgValues<T>) -> Result<Vec<T>> {
            let r = self.core.input(args, Arg::RLmn)?;
            let psi = self.core.input(args, Arg::Psi)?;
            let values = vec![
                r[0] * r[0] - constant::<T>(4.0),
                r[0] * psi[0] - constant::<T>(3.0),
            ];
            self.core.shift_scale(values)
        }
    }

    impl Objective for Quadratic {
        fn name(&self) -> &str {
            "quadratic"
        }

        fn linear(&self) -> bool {
            false
        }

        fn core(&self) -> &ObjectiveCore {
            &self.core
        }

        fn core_mut(&mut self) -> &mut ObjectiveCore {
            &mut self.core
        }

        fn build(&mut self, eq: &Equilibrium, settings: &DerivativeSettings) -> Result<()> {
            self.core.prepare(eq, 2, vec![Arg::RLmn, Arg::Psi], settings)?;
            finish_build(self)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::test_objectives::Quadratic;
    use super::*;
    use crate::equilibrium::EquilibriumConfig;

    fn equilibrium() -> Equilibrium {
        Equilibrium::from_config(&EquilibriumConfig::default()).expect("equilibrium")
    }

    fn state(eq: &Equilibrium) -> ArgValues<f64> {
        Arg::ALL
            .iter()
            .map(|&arg| (arg, eq.arg(arg).as_slice().to_vec()))
            .collect()
    }

    #[test]
    fn compute_before_build_is_not_built() {
        let eq = equilibrium();
        let objective = Quadratic::new();
        let err = Residual::<f64>::compute(&objective, &state(&eq)).expect_err("unbuilt");
        assert!(matches!(err, Error::NotBuilt { .. }));
    }

    #[test]
    fn scalar_target_and_weight_are_broadcast() {
        let eq = equilibrium();
        let mut objective = Quadratic::new();
        objective.core.set_weight(vec![2.0]).expect("weight");
        objective
            .build(&eq, &DerivativeSettings::default())
            .expect("build");
        assert_eq!(objective.core().weight(), &[2.0, 2.0]);
        assert_eq!(objective.core().target(), &[0.0, 0.0]);
        assert!(objective.core_mut().set_target(vec![1.0, 2.0, 3.0]).is_err());
    }

    #[test]
    fn target_length_mismatch_is_reported() {
        let eq = equilibrium();
        let mut objective = Quadratic::new();
        objective.core.target = vec![1.0, 2.0, 3.0];
        let err = objective
            .build(&eq, &DerivativeSettings::default())
            .expect_err("three targets for two residuals");
        assert!(format!("{err}").contains("quadratic target"));
    }

    #[test]
    fn default_scalar_is_half_sum_of_squares() {
        let eq = equilibrium();
        let mut objective = Quadratic::new();
        objective
            .build(&eq, &DerivativeSettings::default())
            .expect("build");
        let args = state(&eq);
        let f = Residual::<f64>::compute(&objective, &args).expect("residual");
        let s = Residual::<f64>::compute_scalar(&objective, &args).expect("scalar");
        assert!((s - 0.5 * f.iter().map(|v| v * v).sum::<f64>()).abs() < 1e-12);
    }

    #[test]
    fn jacobian_has_fixed_width_for_every_argument() {
        let eq = equilibrium();
        let mut objective = Quadratic::new();
        objective
            .build(&eq, &DerivativeSettings::default())
            .expect("build");
        let args = state(&eq);
        for arg in Arg::ALL {
            let jac = objective.jacobian(arg, &args).expect("jacobian");
            assert_eq!(jac.shape(), (2, eq.dimension(arg)));
        }
        let r0 = args[&Arg::RLmn][0];
        let psi = args[&Arg::Psi][0];
        let d_psi = objective.jacobian(Arg::Psi, &args).expect("jacobian");
        assert!((d_psi[(1, 0)] - r0).abs() < 1e-12);
        let d_r = objective.jacobian(Arg::RLmn, &args).expect("jacobian");
        assert!((d_r[(0, 0)] - 2.0 * r0).abs() < 1e-12);
        assert!((d_r[(1, 0)] - psi).abs() < 1e-12);
        assert!(d_r.columns(1, d_r.ncols() - 1).iter().all(|&v| v == 0.0));
        assert!(objective.jacobian(Arg::LLmn, &args).expect("zero").iter().all(|&v| v == 0.0));
    }
}
