use super::kernels::Kernel;
use super::{Field, ProfileKind};
use crate::equilibrium::Arg;
use crate::error::{Error, Result};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::OnceLock;

/// Where a quantity lives.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Coordinates {
    /// One value per collocation node.
    Rtz,
    /// Flux function: constant on each surface.
    R,
    /// A single global value.
    Global,
}

/// Registry entry.
#[derive(Debug)]
pub struct Quantity {
    pub name: &'static str,
    pub label: &'static str,
    pub units: &'static str,
    pub description: &'static str,
    /// 0 for scalars, 1 for scalar fields, 3 for vectors in `(R, phi, Z)` components.
    pub dim: usize,
    pub coordinates: Coordinates,
    pub params: &'static [Arg],
    pub transforms: &'static [(Field, &'static [[usize; 3]])],
    pub profiles: &'static [ProfileKind],
    pub data: &'static [&'static str],
    pub kernel: Kernel,
}

macro_rules! field_quantity {
    ($name:expr, $label:expr, $field:ident, $arg:ident, $units:literal, $d:expr) => {
        Quantity {
            name: $name,
            label: $label,
            units: $units,
            description: "Spectral field or one of its coordinate derivatives",
            dim: 1,
            coordinates: Coordinates::Rtz,
            params: &[Arg::$arg],
            transforms: &[(Field::$field, &[$d])],
            profiles: &[],
            data: &[],
            kernel: Kernel::Field(Field::$field, $d),
        }
    };
}

macro_rules! field_family {
    ($prefix:literal, $label:literal, $field:ident, $arg:ident, $units:literal) => {
        [
            field_quantity!($prefix, $label, $field, $arg, $units, [0, 0, 0]),
            field_quantity!(concat!($prefix, "_r"), concat!("\\partial_{\\rho} ", $label), $field, $arg, $units, [1, 0, 0]),
            field_quantity!(concat!($prefix, "_t"), concat!("\\partial_{\\theta} ", $label), $field, $arg, $units, [0, 1, 0]),
            field_quantity!(concat!($prefix, "_z"), concat!("\\partial_{\\zeta} ", $label), $field, $arg, $units, [0, 0, 1]),
            field_quantity!(concat!($prefix, "_rr"), concat!("\\partial_{\\rho\\rho} ", $label), $field, $arg, $units, [2, 0, 0]),
            field_quantity!(concat!($prefix, "_tt"), concat!("\\partial_{\\theta\\theta} ", $label), $field, $arg, $units, [0, 2, 0]),
            field_quantity!(concat!($prefix, "_zz"), concat!("\\partial_{\\zeta\\zeta} ", $label), $field, $arg, $units, [0, 0, 2]),
            field_quantity!(concat!($prefix, "_rt"), concat!("\\partial_{\\rho\\theta} ", $label), $field, $arg, $units, [1, 1, 0]),
            field_quantity!(concat!($prefix, "_rz"), concat!("\\partial_{\\rho\\zeta} ", $label), $field, $arg, $units, [1, 0, 1]),
            field_quantity!(concat!($prefix, "_tz"), concat!("\\partial_{\\theta\\zeta} ", $label), $field, $arg, $units, [0, 1, 1]),
        ]
    };
}

static R_FAMILY: [Quantity; 10] = field_family!("R", "R", R, RLmn, "m");
static Z_FAMILY: [Quantity; 10] = field_family!("Z", "Z", Z, ZLmn, "m");
static LAMBDA_FAMILY: [Quantity; 10] = field_family!("lambda", "\\lambda", Lambda, LLmn, "rad");

static DERIVED: &[Quantity] = &[
    Quantity {
        name: "phi",
        label: "\\phi",
        units: "rad",
        description: "Toroidal angle in lab frame",
        dim: 1,
        coordinates: Coordinates::Rtz,
        params: &[],
        transforms: &[],
        profiles: &[],
        data: &[],
        kernel: Kernel::Phi,
    },
    Quantity {
        name: "X",
        label: "X = R \\cos{\\phi}",
        units: "m",
        description: "Cartesian X coordinate",
        dim: 1,
        coordinates: Coordinates::Rtz,
        params: &[],
        transforms: &[],
        profiles: &[],
        data: &["R", "phi"],
        kernel: Kernel::Cartesian,
    },
    Quantity {
        name: "Y",
        label: "Y = R \\sin{\\phi}",
        units: "m",
        description: "Cartesian Y coordinate",
        dim: 1,
        coordinates: Coordinates::Rtz,
        params: &[],
        transforms: &[],
        profiles: &[],
        data: &["R", "phi"],
        kernel: Kernel::Cartesian,
    },
    Quantity {
        name: "psi",
        label: "\\psi = \\Psi / (2 \\pi)",
        units: "Wb",
        description: "Toroidal flux (normalized by 2pi)",
        dim: 1,
        coordinates: Coordinates::R,
        params: &[Arg::Psi],
        transforms: &[],
        profiles: &[],
        data: &[],
        kernel: Kernel::ToroidalFlux,
    },
    Quantity {
        name: "psi_r",
        label: "\\partial_{\\rho} \\psi",
        units: "Wb",
        description: "Toroidal flux (normalized by 2pi), first radial derivative",
        dim: 1,
        coordinates: Coordinates::R,
        params: &[Arg::Psi],
        transforms: &[],
        profiles: &[],
        data: &[],
        kernel: Kernel::ToroidalFlux,
    },
    Quantity {
        name: "p",
        label: "p",
        units: "Pa",
        description: "Pressure",
        dim: 1,
        coordinates: Coordinates::R,
        params: &[Arg::PL],
        transforms: &[],
        profiles: &[ProfileKind::Pressure],
        data: &[],
        kernel: Kernel::Pressure,
    },
    Quantity {
        name: "p_r",
        label: "\\partial_{\\rho} p",
        units: "Pa",
        description: "Pressure, first radial derivative",
        dim: 1,
        coordinates: Coordinates::R,
        params: &[Arg::PL],
        transforms: &[],
        profiles: &[ProfileKind::Pressure],
        data: &[],
        kernel: Kernel::Pressure,
    },
    Quantity {
        name: "iota",
        label: "\\iota",
        units: "~",
        description: "Rotational transform",
        dim: 1,
        coordinates: Coordinates::R,
        params: &[Arg::IL],
        transforms: &[],
        profiles: &[ProfileKind::Iota],
        data: &[],
        kernel: Kernel::RotationalTransform,
    },
    Quantity {
        name: "iota_r",
        label: "\\partial_{\\rho} \\iota",
        units: "~",
        description: "Rotational transform, first radial derivative",
        dim: 1,
        coordinates: Coordinates::R,
        params: &[Arg::IL],
        transforms: &[],
        profiles: &[ProfileKind::Iota],
        data: &[],
        kernel: Kernel::RotationalTransform,
    },
    Quantity {
        name: "c",
        label: "I_{c}",
        units: "A",
        description: "Toroidal current profile",
        dim: 1,
        coordinates: Coordinates::R,
        params: &[Arg::CL],
        transforms: &[],
        profiles: &[ProfileKind::Current],
        data: &[],
        kernel: Kernel::CurrentProfile,
    },
    Quantity {
        name: "c_r",
        label: "\\partial_{\\rho} I_{c}",
        units: "A",
        description: "Toroidal current profile, first radial derivative",
        dim: 1,
        coordinates: Coordinates::R,
        params: &[Arg::CL],
        transforms: &[],
        profiles: &[ProfileKind::Current],
        data: &[],
        kernel: Kernel::CurrentProfile,
    },
    Quantity {
        name: "e_rho",
        label: "\\mathbf{e}_{\\rho}",
        units: "m",
        description: "Covariant radial basis vector",
        dim: 3,
        coordinates: Coordinates::Rtz,
        params: &[],
        transforms: &[],
        profiles: &[],
        data: &["R", "R_r", "R_t", "R_z", "Z_r", "Z_t", "Z_z"],
        kernel: Kernel::BasisVectors,
    },
    Quantity {
        name: "e_theta",
        label: "\\mathbf{e}_{\\theta}",
        units: "m",
        description: "Covariant poloidal basis vector",
        dim: 3,
        coordinates: Coordinates::Rtz,
        params: &[],
        transforms: &[],
        profiles: &[],
        data: &["R", "R_r", "R_t", "R_z", "Z_r", "Z_t", "Z_z"],
        kernel: Kernel::BasisVectors,
    },
    Quantity {
        name: "e_zeta",
        label: "\\mathbf{e}_{\\zeta}",
        units: "m",
        description: "Covariant toroidal basis vector",
        dim: 3,
        coordinates: Coordinates::Rtz,
        params: &[],
        transforms: &[],
        profiles: &[],
        data: &["R", "R_r", "R_t", "R_z", "Z_r", "Z_t", "Z_z"],
        kernel: Kernel::BasisVectors,
    },
    Quantity {
        name: "sqrt(g)",
        label: "\\sqrt{g}",
        units: "m^3",
        description: "Jacobian determinant of flux coordinate system",
        dim: 1,
        coordinates: Coordinates::Rtz,
        params: &[],
        transforms: &[],
        profiles: &[],
        data: &["e_rho", "e_theta", "e_zeta"],
        kernel: Kernel::Jacobian,
    },
    Quantity {
        name: "B^theta",
        label: "B^{\\theta}",
        units: "T/m",
        description: "Contravariant poloidal component of magnetic field",
        dim: 1,
        coordinates: Coordinates::Rtz,
        params: &[],
        transforms: &[],
        profiles: &[],
        data: &["psi_r", "iota", "lambda_t", "lambda_z", "sqrt(g)"],
        kernel: Kernel::ContravariantField,
    },
    Quantity {
        name: "B^zeta",
        label: "B^{\\zeta}",
        units: "T/m",
        description: "Contravariant toroidal component of magnetic field",
        dim: 1,
        coordinates: Coordinates::Rtz,
        params: &[],
        transforms: &[],
        profiles: &[],
        data: &["psi_r", "iota", "lambda_t", "lambda_z", "sqrt(g)"],
        kernel: Kernel::ContravariantField,
    },
    Quantity {
        name: "B",
        label: "\\mathbf{B}",
        units: "T",
        description: "Magnetic field",
        dim: 3,
        coordinates: Coordinates::Rtz,
        params: &[],
        transforms: &[],
        profiles: &[],
        data: &["B^theta", "B^zeta", "e_theta", "e_zeta"],
        kernel: Kernel::MagneticField,
    },
    Quantity {
        name: "|B|^2",
        label: "|\\mathbf{B}|^{2}",
        units: "T^2",
        description: "Magnitude of magnetic field, squared",
        dim: 1,
        coordinates: Coordinates::Rtz,
        params: &[],
        transforms: &[],
        profiles: &[],
        data: &["B^theta", "B^zeta", "e_theta", "e_zeta"],
        kernel: Kernel::MagneticField,
    },
    Quantity {
        name: "|B|",
        label: "|\\mathbf{B}|",
        units: "T",
        description: "Magnitude of magnetic field",
        dim: 1,
        coordinates: Coordinates::Rtz,
        params: &[],
        transforms: &[],
        profiles: &[],
        data: &["B^theta", "B^zeta", "e_theta", "e_zeta"],
        kernel: Kernel::MagneticField,
    },
    Quantity {
        name: "B_theta",
        label: "B_{\\theta}",
        units: "T m",
        description: "Covariant poloidal component of magnetic field",
        dim: 1,
        coordinates: Coordinates::Rtz,
        params: &[],
        transforms: &[],
        profiles: &[],
        data: &["B", "e_theta"],
        kernel: Kernel::CovariantField,
    },
    Quantity {
        name: "current",
        label: "\\frac{2\\pi}{\\mu_0} \\langle B_{\\theta} \\rangle",
        units: "A",
        description: "Net toroidal current enclosed by flux surfaces",
        dim: 1,
        coordinates: Coordinates::R,
        params: &[],
        transforms: &[],
        profiles: &[],
        data: &["B_theta"],
        kernel: Kernel::ToroidalCurrent,
    },
    Quantity {
        name: "V",
        label: "V",
        units: "m^3",
        description: "Volume",
        dim: 0,
        coordinates: Coordinates::Global,
        params: &[],
        transforms: &[],
        profiles: &[],
        data: &["sqrt(g)"],
        kernel: Kernel::Volume,
    },
    Quantity {
        name: "W",
        label: "W",
        units: "J",
        description: "Plasma total energy",
        dim: 0,
        coordinates: Coordinates::Global,
        params: &[],
        transforms: &[],
        profiles: &[],
        data: &["|B|^2", "p", "sqrt(g)"],
        kernel: Kernel::Energy,
    },
    Quantity {
        name: "W_B",
        label: "W_B",
        units: "J",
        description: "Plasma magnetic energy",
        dim: 0,
        coordinates: Coordinates::Global,
        params: &[],
        transforms: &[],
        profiles: &[],
        data: &["|B|^2", "p", "sqrt(g)"],
        kernel: Kernel::Energy,
    },
    Quantity {
        name: "W_p",
        label: "W_p",
        units: "J",
        description: "Plasma thermodynamic energy",
        dim: 0,
        coordinates: Coordinates::Global,
        params: &[],
        transforms: &[],
        profiles: &[],
        data: &["|B|^2", "p", "sqrt(g)"],
        kernel: Kernel::Energy,
    },
];

/// Process-wide, read-only quantity table.
pub struct Registry {
    entries: HashMap<&'static str, &'static Quantity>,
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Mark {
    Visiting,
    Done,
}

impl Registry {
    pub fn global() -> &'static Registry {
        static REGISTRY: OnceLock<Registry> = OnceLock::new();
        REGISTRY.get_or_init(|| {
            let entries = R_FAMILY
                .iter()
                .chain(Z_FAMILY.iter())
                .chain(LAMBDA_FAMILY.iter())
                .chain(DERIVED.iter())
                .map(|q| (q.name, q))
                .collect();
            Registry { entries }
        })
    }

    pub fn get(&self, name: &str) -> Option<&'static Quantity> {
        self.entries.get(name).copied()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.entries.contains_key(name)
    }

    pub fn names(&self) -> impl Iterator<Item = &'static str> + '_ {
        self.entries.keys().copied()
    }

    /// Every declared dependency resolves and no chain is cyclic.
    pub fn validate(&self) -> Result<()> {
        let mut names: Vec<&str> = self.names().collect();
        names.sort_unstable();
        for name in names {
            self.resolve(&[name])?;
        }
        Ok(())
    }

    /// Orders `targets` and their transitive dependencies so that no
    /// quantity precedes one it depends on. Each quantity appears once.
    pub fn resolve(&self, targets: &[&str]) -> Result<Plan> {
        let mut marks: HashMap<&'static str, Mark> = HashMap::new();
        let mut steps = Vec::new();
        for target in targets {
            self.visit(target, "request", &mut marks, &mut steps)?;
        }
        Ok(Plan { steps })
    }

    fn visit(
        &self,
        name: &str,
        needed_by: &str,
        marks: &mut HashMap<&'static str, Mark>,
        steps: &mut Vec<&'static Quantity>,
    ) -> Result<()> {
        let quantity = self
            .get(name)
            .ok_or_else(|| Error::missing(format!("quantity '{name}'"), needed_by))?;
        match marks.get(quantity.name) {
            Some(Mark::Done) => return Ok(()),
            Some(Mark::Visiting) => {
                return Err(Error::invalid_config(
                    "compute registry",
                    format!("dependency cycle through '{name}'"),
                ))
            }
            None => {}
        }
        marks.insert(quantity.name, Mark::Visiting);
        for dep in quantity.data {
            self.visit(dep, quantity.name, marks, steps)?;
        }
        marks.insert(quantity.name, Mark::Done);
        steps.push(quantity);
        Ok(())
    }
}

/// Dependency-ordered compute steps for one request.
#[derive(Debug, Clone)]
pub struct Plan {
    steps: Vec<&'static Quantity>,
}

impl Plan {
    pub fn steps(&self) -> &[&'static Quantity] {
        &self.steps
    }

    /// Union of transform derivative orders, per field.
    pub fn required_derivs(&self) -> BTreeMap<Field, BTreeSet<[usize; 3]>> {
        let mut out: BTreeMap<Field, BTreeSet<[usize; 3]>> = BTreeMap::new();
        for quantity in &self.steps {
            for (field, derivs) in quantity.transforms {
                out.entry(*field).or_default().extend(derivs.iter().copied());
            }
        }
        out
    }

    pub fn required_profiles(&self) -> BTreeSet<ProfileKind> {
        self.steps
            .iter()
            .flat_map(|q| q.profiles.iter().copied())
            .collect()
    }

    /// State arguments read by any step, in canonical order.
    pub fn required_args(&self) -> BTreeSet<Arg> {
        self.steps.iter().flat_map(|q| q.params.iter().copied()).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn registry_is_consistent() {
        let registry = Registry::global();
        registry.validate().expect("registry validates");
        assert!(registry.names().all(|name| registry.contains(name)));
        assert!(registry.contains("current"));
        assert!(!registry.contains("nope"));
    }

    #[test]
    fn plan_orders_dependencies_first() {
        let plan = Registry::global().resolve(&["W"]).expect("plan");
        let position = |name: &str| {
            plan.steps()
                .iter()
                .position(|q| q.name == name)
                .expect("in plan")
        };
        assert!(position("sqrt(g)") < position("B^theta"));
        assert!(position("e_theta") < position("sqrt(g)"));
        assert!(position("|B|^2") < position("W"));
        assert_eq!(plan.steps().iter().filter(|q| q.name == "sqrt(g)").count(), 1);
    }

    #[test]
    fn plan_reports_inputs_without_reflection() {
        let plan = Registry::global().resolve(&["B^zeta"]).expect("plan");
        let derivs = plan.required_derivs();
        assert!(derivs[&Field::Lambda].contains(&[0, 1, 0]));
        assert!(derivs[&Field::R].contains(&[1, 0, 0]));
        assert_eq!(
            plan.required_args().into_iter().collect::<Vec<_>>(),
            vec![Arg::RLmn, Arg::ZLmn, Arg::LLmn, Arg::IL, Arg::Psi]
        );
        assert!(plan.required_profiles().contains(&ProfileKind::Iota));
        assert!(!plan.required_profiles().contains(&ProfileKind::Pressure));
    }

    #[test]
    fn current_from_field_does_not_read_the_current_profile() {
        let plan = Registry::global().resolve(&["current"]).expect("plan");
        let args = plan.required_args();
        assert!(args.contains(&Arg::IL));
        assert!(!args.contains(&Arg::CL));
        assert!(plan.required_profiles().contains(&ProfileKind::Iota));

        let profile = Registry::global().resolve(&["c_r"]).expect("plan");
        assert_eq!(profile.required_args().into_iter().collect::<Vec<_>>(), vec![Arg::CL]);
        assert_eq!(profile.steps().len(), 1);
    }

    #[test]
    fn unknown_dependency_is_missing_input() {
        let err = Registry::global().resolve(&["B", "nope"]).expect_err("unknown");
        assert!(format!("{err}").contains("quantity 'nope' required by request"));
    }
}
