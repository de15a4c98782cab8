//! Named physical quantities computed from spectral coefficients.
//!
//! The [`Registry`] is a static table of [`Quantity`] entries. Each entry
//! declares what it needs (state arguments, transform derivative orders,
//! profiles, other quantities) and names the [`Kernel`] that produces it.
//! [`compute`] resolves the requested names into a dependency-ordered plan,
//! checks every declared input, then runs the kernels into a fresh [`Data`]
//! map owned by the call.

use crate::equilibrium::{Arg, ArgValues};
use crate::error::{Error, Result};
use crate::grid::Grid;
use crate::profiles::PowerSeriesProfile;
use crate::traits::Scalar;
use crate::transform::Transform;
use std::collections::{BTreeMap, HashMap};
use std::fmt;

mod kernels;
mod registry;

pub use kernels::Kernel;
pub use registry::{Coordinates, Plan, Quantity, Registry};

/// Computed quantities of one evaluation, keyed by registry name.
pub type Data<T> = HashMap<&'static str, Vec<T>>;

/// Primitive spectral fields with their own transforms.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Field {
    R,
    Z,
    Lambda,
}

impl Field {
    pub fn arg(&self) -> Arg {
        match self {
            Field::R => Arg::RLmn,
            Field::Z => Arg::ZLmn,
            Field::Lambda => Arg::LLmn,
        }
    }

    pub fn transform_name(&self) -> &'static str {
        match self {
            Field::R => "R_transform",
            Field::Z => "Z_transform",
            Field::Lambda => "L_transform",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ProfileKind {
    Pressure,
    Iota,
    /// Enclosed toroidal current.
    Current,
}

impl ProfileKind {
    pub fn arg(&self) -> Arg {
        match self {
            ProfileKind::Pressure => Arg::PL,
            ProfileKind::Iota => Arg::IL,
            ProfileKind::Current => Arg::CL,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            ProfileKind::Pressure => "pressure",
            ProfileKind::Iota => "iota",
            ProfileKind::Current => "current",
        }
    }
}

impl fmt::Display for ProfileKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

pub type Transforms = BTreeMap<Field, Transform>;
pub type Profiles = BTreeMap<ProfileKind, PowerSeriesProfile>;

/// Everything a kernel may read besides previously computed quantities.
pub struct ComputeInputs<'a, T> {
    pub params: &'a ArgValues<T>,
    pub transforms: &'a Transforms,
    pub profiles: &'a Profiles,
    pub grid: &'a Grid,
}

impl<T: Scalar> ComputeInputs<'_, T> {
    /// Checks the declared inputs of `quantity` before its kernel runs.
    fn check(&self, quantity: &Quantity) -> Result<()> {
        for arg in quantity.params {
            if !self.params.contains_key(arg) {
                return Err(Error::missing(arg.name(), quantity.name));
            }
        }
        for (field, derivs) in quantity.transforms {
            let transform = self
                .transforms
                .get(field)
                .ok_or_else(|| Error::missing(field.transform_name(), quantity.name))?;
            for d in derivs.iter() {
                if !transform.has_derivative(*d) {
                    return Err(Error::missing(
                        format!("{} derivative order {:?}", field.transform_name(), d),
                        quantity.name,
                    ));
                }
            }
            if transform.grid().num_nodes() != self.grid.num_nodes() {
                return Err(Error::dimension(
                    format!("{} grid for {}", field.transform_name(), quantity.name),
                    self.grid.num_nodes(),
                    transform.grid().num_nodes(),
                ));
            }
        }
        for profile in quantity.profiles {
            if !self.profiles.contains_key(profile) {
                return Err(Error::missing(profile.name(), quantity.name));
            }
        }
        Ok(())
    }
}

/// Computes `names` (and everything they depend on).
pub fn compute<T: Scalar>(names: &[&str], inputs: &ComputeInputs<'_, T>) -> Result<Data<T>> {
    compute_into(names, inputs, Data::new())
}

/// Like [`compute`], reusing quantities already present in `data`.
pub fn compute_into<T: Scalar>(
    names: &[&str],
    inputs: &ComputeInputs<'_, T>,
    mut data: Data<T>,
) -> Result<Data<T>> {
    let plan = Registry::global().resolve(names)?;
    for quantity in plan.steps() {
        if data.contains_key(quantity.name) {
            continue;
        }
        inputs.check(quantity)?;
        quantity.kernel.evaluate(quantity, inputs, &mut data)?;
    }
    Ok(data)
}

#[cfg(test)]
pub(crate) mod fixtures {
    use super::*;
    use crate::equilibrium::{BoundaryMode, Equilibrium, EquilibriumConfig};

    /// Circular torus `R = R0 + a·rho·cos(theta)`, `Z = -a·rho·sin(theta)`.
    pub fn circular_torus(major: f64, minor: f64) -> Equilibrium {
        with_current(major, minor, vec![0.0])
    }

    /// [`circular_torus`] carrying a toroidal current profile.
    pub fn with_current(major: f64, minor: f64, current: Vec<f64>) -> Equilibrium {
        let config = EquilibriumConfig {
            boundary: vec![
                BoundaryMode { m: 0, n: 0, r: major, z: 0.0 },
                BoundaryMode { m: 1, n: 0, r: minor, z: 0.0 },
                BoundaryMode { m: -1, n: 0, r: 0.0, z: -minor },
            ],
            pressure: vec![1.0e3, 0.0, -1.0e3],
            iota: vec![0.4, 0.0, 0.2],
            current,
            ..EquilibriumConfig::default()
        };
        Equilibrium::from_config(&config).expect("equilibrium")
    }

    pub struct Built {
        pub grid: Grid,
        pub transforms: Transforms,
        pub profiles: Profiles,
        pub params: ArgValues<f64>,
    }

    /// Everything needed to compute `names` on the equilibrium's default grid.
    pub fn build_for(eq: &Equilibrium, names: &[&str]) -> Built {
        let grid = eq.default_grid().expect("grid");
        let plan = Registry::global().resolve(names).expect("plan");
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
        let params = plan
            .required_args()
            .into_iter()
            .map(|arg| (arg, eq.arg(arg).as_slice().to_vec()))
            .collect();
        Built {
            grid,
            transforms,
            profiles,
            params,
        }
    }
}
