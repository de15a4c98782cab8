use super::{finish_build, Objective, ObjectiveCore, Residual};
use crate::compute::{
    compute, ComputeInputs, Coordinates, Data, Field, Profiles, Quantity, Registry, Transforms,
};
use crate::derivatives::DerivativeSettings;
use crate::equilibrium::{Arg, ArgValues, Equilibrium};
use crate::error::{Error, Result};
use crate::grid::Grid;
use crate::traits::{constant, Scalar};
use crate::transform::Transform;
use std::time::Instant;

/// Transforms, profiles and grid needed to compute one registry quantity.
#[derive(Debug, Clone)]
struct QuantityEvaluator {
    quantity: &'static Quantity,
    grid: Grid,
    transforms: Transforms,
    profiles: Profiles,
    args: Vec<Arg>,
}

impl QuantityEvaluator {
    fn new(name: &str, owner: &str, eq: &Equilibrium, grid: Option<&Grid>) -> Result<Self> {
        let registry = Registry::global();
        let quantity = registry
            .get(name)
            .ok_or_else(|| Error::missing(format!("quantity '{name}'"), owner))?;
        let grid = match grid {
            Some(grid) => grid.clone(),
            None => eq.default_grid()?,
        };
        let plan = registry.resolve(&[name])?;

        let timer = Instant::now();
        let mut transforms = Transforms::new();
        for (field, derivs) in plan.required_derivs() {
            let basis = match field {
                Field::R => eq.r_basis(),
                Field::Z => eq.z_basis(),
                Field::Lambda => eq.l_basis(),
            };
            let derivs: Vec<[usize; 3]> = derivs.into_iter().collect();
            transforms.insert(field, Transform::new(&grid, basis, &derivs));
        }
        let mut profiles = Profiles::new();
        for kind in plan.required_profiles() {
            profiles.insert(kind, eq.profile(kind).clone().with_grid(&grid));
        }
        log::debug!("{owner}: precomputed transforms in {:?}", timer.elapsed());

        Ok(Self {
            quantity,
            grid,
            transforms,
            profiles,
            args: plan.required_args().into_iter().collect(),
        })
    }

    /// Residual length implied by where the quantity lives.
    fn dim_f(&self) -> usize {
        match self.quantity.coordinates {
            Coordinates::Rtz => self.grid.num_nodes() * self.quantity.dim.max(1),
            Coordinates::R => self.grid.num_rho(),
            Coordinates::Global => 1,
        }
    }

    fn evaluate<T: Scalar>(&self, args: &ArgValues<T>) -> Result<Vec<T>> {
        let inputs = ComputeInputs {
            params: args,
            transforms: &self.transforms,
            profiles: &self.profiles,
            grid: &self.grid,
        };
        let mut data: Data<T> = compute(&[self.quantity.name], &inputs)?;
        let values = data
            .remove(self.quantity.name)
            .ok_or_else(|| Error::missing(self.quantity.name, "compute"))?;
        Ok(match self.quantity.coordinates {
            Coordinates::R => self.grid.compress(&values),
            Coordinates::Rtz | Coordinates::Global => values,
        })
    }
}

/// Any registry quantity as a residual on a collocation grid.
#[derive(Debug, Clone)]
pub struct GenericObjective {
    quantity: String,
    grid: Option<Grid>,
    evaluator: Option<QuantityEvaluator>,
    core: ObjectiveCore,
}

impl GenericObjective {
    pub fn new(quantity: impl Into<String>, target: Vec<f64>, weight: Vec<f64>) -> Self {
        Self {
            quantity: quantity.into(),
            grid: None,
            evaluator: None,
            core: ObjectiveCore::new("generic", target, weight),
        }
    }

    pub fn grid(mut self, grid: Grid) -> Self {
        self.grid = Some(grid);
        self
    }

    fn evaluator(&self) -> Result<&QuantityEvaluator> {
        self.evaluator
            .as_ref()
            .ok_or_else(|| Error::not_built(self.core.name(), "compute"))
    }
}

impl<T: Scalar> Residual<T> for GenericObjective {
    fn compute(&self, args: &ArgValues<T>) -> Result<Vec<T>> {
        let values = self.evaluator()?.evaluate(args)?;
        self.core.shift_scale(values)
    }
}

impl Objective for GenericObjective {
    fn name(&self) -> &str {
        self.core.name()
    }

    fn units(&self) -> &str {
        self.evaluator.as_ref().map_or("(unknown)", |e| e.quantity.units)
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
        let evaluator =
            QuantityEvaluator::new(&self.quantity, self.core.name(), eq, self.grid.as_ref())?;
        let (dim_f, args) = (evaluator.dim_f(), evaluator.args.clone());
        self.evaluator = Some(evaluator);
        self.core.prepare(eq, dim_f, args, settings)?;
        finish_build(self)
    }
}

/// Plasma volume.
#[derive(Debug, Clone)]
pub struct Volume {
    grid: Option<Grid>,
    evaluator: Option<QuantityEvaluator>,
    core: ObjectiveCore,
}

impl Volume {
    pub fn new(target: f64, weight: f64) -> Self {
        Self {
            grid: None,
            evaluator: None,
            core: ObjectiveCore::new("volume", vec![target], vec![weight]),
        }
    }

    pub fn grid(mut self, grid: Grid) -> Self {
        self.grid = Some(grid);
        self
    }
}

impl<T: Scalar> Residual<T> for Volume {
    fn compute(&self, args: &ArgValues<T>) -> Result<Vec<T>> {
        let evaluator = self
            .evaluator
            .as_ref()
            .ok_or_else(|| Error::not_built(self.core.name(), "compute"))?;
        self.core.shift_scale(evaluator.evaluate(args)?)
    }
}

impl Objective for Volume {
    fn name(&self) -> &str {
        self.core.name()
    }

    fn units(&self) -> &str {
        "(m^3)"
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
        let evaluator = QuantityEvaluator::new("V", self.core.name(), eq, self.grid.as_ref())?;
        let args = evaluator.args.clone();
        self.evaluator = Some(evaluator);
        self.core.prepare(eq, 1, args, settings)?;
        finish_build(self)
    }
}

/// Total MHD energy `W = W_B + W_p`.
///
/// The scalar form is the weighted energy itself rather than half its square.
#[derive(Debug, Clone)]
pub struct Energy {
    grid: Option<Grid>,
    evaluator: Option<QuantityEvaluator>,
    core: ObjectiveCore,
}

impl Energy {
    pub fn new(weight: f64) -> Self {
        Self {
            grid: None,
            evaluator: None,
            core: ObjectiveCore::new("energy", vec![0.0], vec![weight]),
        }
    }

    pub fn grid(mut self, grid: Grid) -> Self {
        self.grid = Some(grid);
        self
    }
}

impl<T: Scalar> Residual<T> for Energy {
    fn compute(&self, args: &ArgValues<T>) -> Result<Vec<T>> {
        let evaluator = self
            .evaluator
            .as_ref()
            .ok_or_else(|| Error::not_built(self.core.name(), "compute"))?;
        self.core.shift_scale(evaluator.evaluate(args)?)
    }

    fn compute_scalar(&self, args: &ArgValues<T>) -> Result<T> {
        let f = self.compute(args)?;
        f.first()
            .copied()
            .ok_or_else(|| Error::dimension("energy residual", 1, 0))
    }
}

impl Objective for Energy {
    fn name(&self) -> &str {
        self.core.name()
    }

    fn units(&self) -> &str {
        "(J)"
    }

    fn linear(&self) -> bool {
        false
    }

    fn scalar(&self) -> bool {
        true
    }

    fn core(&self) -> &ObjectiveCore {
        &self.core
    }

    fn core_mut(&mut self) -> &mut ObjectiveCore {
        &mut self.core
    }

    fn build(&mut self, eq: &Equilibrium, settings: &DerivativeSettings) -> Result<()> {
        let evaluator = QuantityEvaluator::new("W", self.core.name(), eq, self.grid.as_ref())?;
        let args = evaluator.args.clone();
        self.evaluator = Some(evaluator);
        self.core.prepare(eq, 1, args, settings)?;
        finish_build(self)
    }
}

/// Net toroidal current enclosed by each flux surface.
///
/// Each residual is scaled by the radial spacing of its surface.
#[derive(Debug, Clone)]
pub struct TargetCurrent {
    grid: Option<Grid>,
    evaluator: Option<QuantityEvaluator>,
    core: ObjectiveCore,
}

impl TargetCurrent {
    pub fn new(target: Vec<f64>) -> Self {
        Self {
            grid: None,
            evaluator: None,
            core: ObjectiveCore::new("target-current", target, vec![1.0]),
        }
    }

    pub fn grid(mut self, grid: Grid) -> Self {
        self.grid = Some(grid);
        self
    }

    pub fn weight(mut self, weight: Vec<f64>) -> Result<Self> {
        self.core.set_weight(weight)?;
        Ok(self)
    }
}

impl<T: Scalar> Residual<T> for TargetCurrent {
    fn compute(&self, args: &ArgValues<T>) -> Result<Vec<T>> {
        let evaluator = self
            .evaluator
            .as_ref()
            .ok_or_else(|| Error::not_built(self.core.name(), "compute"))?;
        let f = self.core.shift_scale(evaluator.evaluate(args)?)?;
        let spacing = evaluator.grid.compress(evaluator.grid.spacing());
        Ok(f.into_iter()
            .zip(spacing)
            .map(|(f, [d_rho, _, _])| f * constant::<T>(d_rho))
            .collect())
    }
}

impl Objective for TargetCurrent {
    fn name(&self) -> &str {
        self.core.name()
    }

    fn units(&self) -> &str {
        "(A)"
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
        let evaluator =
            QuantityEvaluator::new("current", self.core.name(), eq, self.grid.as_ref())?;
        let (dim_f, args) = (evaluator.dim_f(), evaluator.args.clone());
        self.evaluator = Some(evaluator);
        self.core.prepare(eq, dim_f, args, settings)?;
        finish_build(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compute::fixtures::circular_torus;
    use crate::compute::ProfileKind;
    use nalgebra::DMatrix;
    use std::f64::consts::PI;

    fn state(eq: &Equilibrium) -> ArgValues<f64> {
        Arg::ALL
            .iter()
            .map(|&arg| (arg, eq.arg(arg).as_slice().to_vec()))
            .collect()
    }

    #[test]
    fn dim_f_follows_quantity_coordinates() {
        let eq = circular_torus(10.0, 1.0);
        let grid = eq.default_grid().expect("grid");
        let cases = [
            ("sqrt(g)", grid.num_nodes()),
            ("B", 3 * grid.num_nodes()),
            ("iota", grid.num_rho()),
            ("V", 1),
        ];
        for (name, dim_f) in cases {
            let mut objective = GenericObjective::new(name, vec![0.0], vec![1.0]);
            objective
                .build(&eq, &DerivativeSettings::default())
                .expect("build");
            assert_eq!(objective.dim_f(), dim_f, "{name}");
        }
    }

    #[test]
    fn unknown_quantity_fails_at_build() {
        let eq = circular_torus(10.0, 1.0);
        let mut objective = GenericObjective::new("nope", vec![0.0], vec![1.0]);
        let err = objective
            .build(&eq, &DerivativeSettings::default())
            .expect_err("unknown");
        assert!(matches!(err, Error::MissingInput { .. }));
    }

    #[test]
    fn flux_function_residual_is_one_value_per_surface() {
        let eq = circular_torus(10.0, 1.0);
        let mut objective = GenericObjective::new("iota", vec![0.4], vec![1.0]);
        objective
            .build(&eq, &DerivativeSettings::default())
            .expect("build");
        let f = Residual::<f64>::compute(&objective, &state(&eq)).expect("residual");
        let grid = eq.default_grid().expect("grid");
        for (value, [rho, _, _]) in f.iter().zip(grid.nodes()) {
            assert!((value - 0.2 * rho * rho).abs() < 1e-14);
        }
    }

    #[test]
    fn volume_jacobian_matches_finite_differences() {
        let eq = circular_torus(10.0, 1.0);
        let args = state(&eq);
        let mut jacobians = Vec::<DMatrix<f64>>::new();
        for settings in [
            DerivativeSettings::default(),
            DerivativeSettings::finite_difference(1e-6),
        ] {
            let mut objective = Volume::new(2.0 * PI * PI * 10.0, 1.0);
            objective.build(&eq, &settings).expect("build");
            let f = Residual::<f64>::compute(&objective, &args).expect("residual");
            assert!(f[0].abs() < 1e-9);
            jacobians.push(objective.jacobian(Arg::RLmn, &args).expect("jacobian"));
        }
        assert_eq!(jacobians[0].shape(), (1, eq.dimension(Arg::RLmn)));
        for (ad, fd) in jacobians[0].iter().zip(jacobians[1].iter()) {
            assert!((ad - fd).abs() < 1e-5 * ad.abs().max(1.0));
        }
        let r00 = eq.r_basis().index_of([0, 0, 0]).expect("mode");
        assert!((jacobians[0][(0, r00)] - 2.0 * PI * PI).abs() < 1e-9);
    }

    #[test]
    fn energy_scalar_is_weighted_energy() {
        let eq = circular_torus(10.0, 1.0);
        let mut objective = Energy::new(2.0);
        objective
            .build(&eq, &DerivativeSettings::default())
            .expect("build");
        let args = state(&eq);
        let f = Residual::<f64>::compute(&objective, &args).expect("residual");
        let s = Residual::<f64>::compute_scalar(&objective, &args).expect("scalar");
        assert_eq!(f.len(), 1);
        assert_eq!(s, f[0]);
        assert!(objective.scalar());
        assert!(objective.args().contains(&Arg::Psi));
        assert!(objective.args().contains(&Arg::PL));
    }

    #[test]
    fn target_current_is_one_residual_per_surface() {
        let eq = circular_torus(10.0, 1.0);
        let mut objective = TargetCurrent::new(vec![0.0]);
        objective
            .build(&eq, &DerivativeSettings::default())
            .expect("build");
        let grid = eq.default_grid().expect("grid");
        assert_eq!(objective.dim_f(), grid.num_rho());
        assert!(objective.args().contains(&Arg::IL));
        assert!(!objective.args().contains(&Arg::CL));

        let args = state(&eq);
        let f = Residual::<f64>::compute(&objective, &args).expect("residual");
        let d_rho = 1.0 / grid.num_rho() as f64;
        let mu_0 = 4.0 * PI * 1.0e-7;
        for (value, [rho, _, _]) in f.iter().zip(grid.nodes()) {
            let iota = 0.4 + 0.2 * rho * rho;
            let current = 2.0 * iota * rho * rho / (mu_0 * (100.0 - rho * rho).sqrt());
            assert!((value - current * d_rho).abs() < 1e-8 * current);
        }

        // The enclosed current is linear in the rotational transform.
        let jac = objective.jacobian(Arg::IL, &args).expect("jacobian");
        let iota = eq.profile(ProfileKind::Iota).clone().with_grid(&grid);
        let values = iota
            .compute(eq.arg(Arg::IL).as_slice(), 0)
            .expect("iota");
        for (i, value) in f.iter().enumerate() {
            assert!((jac[(i, 0)] * values[i] - value).abs() < 1e-6 * value.abs());
        }
    }
}
