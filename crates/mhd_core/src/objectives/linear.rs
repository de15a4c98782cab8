use super::{finish_build, Objective, ObjectiveCore, Residual};
use crate::basis::Mode;
use crate::compute::ProfileKind;
use crate::derivatives::DerivativeSettings;
use crate::equilibrium::{Arg, ArgValues, Equilibrium};
use crate::error::{Error, Result};
use crate::grid::Grid;
use crate::profiles::PowerSeriesProfile;
use crate::traits::{constant, Scalar};
use nalgebra::DMatrix;

/// Positions in `available` of the requested entries, in request order.
///
/// Returns `(request position, basis index)` pairs. Requests the basis does
/// not contain are skipped with a warning.
fn select<K: PartialEq>(
    owner: &str,
    available: &[K],
    requested: Option<&[K]>,
) -> Vec<(usize, usize)> {
    let Some(requested) = requested else {
        return (0..available.len()).map(|i| (i, i)).collect();
    };
    let found: Vec<(usize, usize)> = requested
        .iter()
        .enumerate()
        .filter_map(|(k, mode)| available.iter().position(|m| m == mode).map(|i| (k, i)))
        .collect();
    if found.len() < requested.len() {
        log::warn!(
            "{owner}: {} of the given modes are not in the basis and will not be fixed",
            requested.len() - found.len()
        );
    }
    found
}

/// Given values follow the request order; keep the entries that were found.
fn pick(values: &[f64], requested: usize, found: &[(usize, usize)]) -> Vec<f64> {
    if requested > 1 && values.len() == requested {
        found.iter().map(|&(k, _)| values[k]).collect()
    } else {
        values.to_vec()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Coordinate {
    R,
    Z,
}

/// Fixes boundary `R` or `Z` coefficients.
///
/// Without explicit targets the current surface coefficients of the same
/// coordinate are used.
#[derive(Debug, Clone)]
pub struct FixBoundary {
    coordinate: Coordinate,
    modes: Option<Vec<Mode>>,
    requested_target: Option<Vec<f64>>,
    requested_weight: Vec<f64>,
    idx: Vec<usize>,
    core: ObjectiveCore,
}

impl FixBoundary {
    pub fn r() -> Self {
        Self::new(Coordinate::R)
    }

    pub fn z() -> Self {
        Self::new(Coordinate::Z)
    }

    fn new(coordinate: Coordinate) -> Self {
        let name = match coordinate {
            Coordinate::R => "fixed-boundary R",
            Coordinate::Z => "fixed-boundary Z",
        };
        Self {
            coordinate,
            modes: None,
            requested_target: None,
            requested_weight: vec![1.0],
            idx: Vec::new(),
            core: ObjectiveCore::new(name, vec![0.0], vec![1.0]),
        }
    }

    /// Surface modes `[0, m, n]` to fix. All modes are fixed when unset.
    pub fn modes(mut self, modes: Vec<Mode>) -> Self {
        self.modes = Some(modes);
        self
    }

    pub fn target(mut self, target: Vec<f64>) -> Self {
        self.requested_target = Some(target);
        self
    }

    pub fn weight(mut self, weight: Vec<f64>) -> Self {
        self.requested_weight = weight;
        self
    }

    /// Indices into the surface coefficients, in residual order.
    pub fn indices(&self) -> &[usize] {
        &self.idx
    }

    fn arg(&self) -> Arg {
        match self.coordinate {
            Coordinate::R => Arg::RbLmn,
            Coordinate::Z => Arg::ZbLmn,
        }
    }

    fn surface_values(&self, eq: &Equilibrium) -> Vec<f64> {
        let surface = eq.surface();
        let coeffs = match self.coordinate {
            Coordinate::R => &surface.r_lmn,
            Coordinate::Z => &surface.z_lmn,
        };
        self.idx.iter().map(|&i| coeffs[i]).collect()
    }
}

impl<T: Scalar> Residual<T> for FixBoundary {
    fn compute(&self, args: &ArgValues<T>) -> Result<Vec<T>> {
        let x = self.core.input(args, self.arg())?;
        self.core.shift_scale(self.idx.iter().map(|&i| x[i]).collect())
    }
}

impl Objective for FixBoundary {
    fn name(&self) -> &str {
        self.core.name()
    }

    fn units(&self) -> &str {
        "(m)"
    }

    fn linear(&self) -> bool {
        true
    }

    fn core(&self) -> &ObjectiveCore {
        &self.core
    }

    fn core_mut(&mut self) -> &mut ObjectiveCore {
        &mut self.core
    }

    fn target_arg(&self) -> Option<Arg> {
        Some(self.arg())
    }

    fn build(&mut self, eq: &Equilibrium, settings: &DerivativeSettings) -> Result<()> {
        let surface = eq.surface();
        let basis = match self.coordinate {
            Coordinate::R => &surface.r_basis,
            Coordinate::Z => &surface.z_basis,
        };
        let found = select(self.core.name(), basis.modes(), self.modes.as_deref());
        self.idx = found.iter().map(|&(_, i)| i).collect();
        let requested = self.modes.as_ref().map_or(self.idx.len(), Vec::len);

        let target = match &self.requested_target {
            Some(values) => pick(values, requested, &found),
            None => self.surface_values(eq),
        };
        let weight = pick(&self.requested_weight, requested, &found);
        self.core.stage(target, Some(weight));
        self.core.prepare(eq, self.idx.len(), vec![self.arg()], settings)?;
        finish_build(self)
    }

    fn update_target(&mut self, eq: &Equilibrium) -> Result<()> {
        let values = self.surface_values(eq);
        self.core.set_target(values)
    }
}

/// Fixes power series coefficients of one profile.
#[derive(Debug, Clone)]
pub struct FixProfile {
    kind: ProfileKind,
    modes: Option<Vec<usize>>,
    requested_target: Option<Vec<f64>>,
    requested_weight: Vec<f64>,
    idx: Vec<usize>,
    core: ObjectiveCore,
}

impl FixProfile {
    pub fn pressure() -> Self {
        Self::new(ProfileKind::Pressure, "fixed-pressure")
    }

    pub fn iota() -> Self {
        Self::new(ProfileKind::Iota, "fixed-iota")
    }

    pub fn current() -> Self {
        Self::new(ProfileKind::Current, "fixed-current")
    }

    fn new(kind: ProfileKind, name: &str) -> Self {
        Self {
            kind,
            modes: None,
            requested_target: None,
            requested_weight: vec![1.0],
            idx: Vec::new(),
            core: ObjectiveCore::new(name, vec![0.0], vec![1.0]),
        }
    }

    /// Radial powers `l` to fix. All are fixed when unset.
    pub fn modes(mut self, modes: Vec<usize>) -> Self {
        self.modes = Some(modes);
        self
    }

    pub fn target(mut self, target: Vec<f64>) -> Self {
        self.requested_target = Some(target);
        self
    }

    pub fn weight(mut self, weight: Vec<f64>) -> Self {
        self.requested_weight = weight;
        self
    }

    fn profile_values(&self, eq: &Equilibrium) -> Vec<f64> {
        let params = eq.profile(self.kind).params();
        self.idx.iter().map(|&i| params[i]).collect()
    }
}

impl<T: Scalar> Residual<T> for FixProfile {
    fn compute(&self, args: &ArgValues<T>) -> Result<Vec<T>> {
        let x = self.core.input(args, self.kind.arg())?;
        self.core.shift_scale(self.idx.iter().map(|&i| x[i]).collect())
    }
}

impl Objective for FixProfile {
    fn name(&self) -> &str {
        self.core.name()
    }

    fn units(&self) -> &str {
        match self.kind {
            ProfileKind::Pressure => "(Pa)",
            ProfileKind::Iota => "(dimensionless)",
            ProfileKind::Current => "(A)",
        }
    }

    fn linear(&self) -> bool {
        true
    }

    fn core(&self) -> &ObjectiveCore {
        &self.core
    }

    fn core_mut(&mut self) -> &mut ObjectiveCore {
        &mut self.core
    }

    fn target_arg(&self) -> Option<Arg> {
        Some(self.kind.arg())
    }

    fn build(&mut self, eq: &Equilibrium, settings: &DerivativeSettings) -> Result<()> {
        let powers: Vec<usize> = eq
            .profile(self.kind)
            .basis()
            .modes()
            .iter()
            .map(|mode| mode[0].unsigned_abs() as usize)
            .collect();
        let found = select(self.core.name(), &powers, self.modes.as_deref());
        self.idx = found.iter().map(|&(_, i)| i).collect();
        let requested = self.modes.as_ref().map_or(self.idx.len(), Vec::len);

        let target = match &self.requested_target {
            Some(values) => pick(values, requested, &found),
            None => self.profile_values(eq),
        };
        let weight = pick(&self.requested_weight, requested, &found);
        self.core.stage(target, Some(weight));
        self.core.prepare(eq, self.idx.len(), vec![self.kind.arg()], settings)?;
        finish_build(self)
    }

    fn update_target(&mut self, eq: &Equilibrium) -> Result<()> {
        let values = self.profile_values(eq);
        self.core.set_target(values)
    }
}

/// Fixes the total toroidal flux.
#[derive(Debug, Clone)]
pub struct FixPsi {
    requested_target: Option<f64>,
    core: ObjectiveCore,
}

impl FixPsi {
    pub fn new() -> Self {
        Self {
            requested_target: None,
            core: ObjectiveCore::new("fixed-Psi", vec![0.0], vec![1.0]),
        }
    }

    pub fn target(mut self, psi: f64) -> Self {
        self.requested_target = Some(psi);
        self
    }

    pub fn weight(mut self, weight: f64) -> Self {
        self.core = ObjectiveCore::new("fixed-Psi", vec![0.0], vec![weight]);
        self
    }
}

impl Default for FixPsi {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Scalar> Residual<T> for FixPsi {
    fn compute(&self, args: &ArgValues<T>) -> Result<Vec<T>> {
        let psi = self.core.input(args, Arg::Psi)?;
        self.core.shift_scale(psi.to_vec())
    }
}

impl Objective for FixPsi {
    fn name(&self) -> &str {
        self.core.name()
    }

    fn units(&self) -> &str {
        "(Wb)"
    }

    fn linear(&self) -> bool {
        true
    }

    fn core(&self) -> &ObjectiveCore {
        &self.core
    }

    fn core_mut(&mut self) -> &mut ObjectiveCore {
        &mut self.core
    }

    fn target_arg(&self) -> Option<Arg> {
        Some(Arg::Psi)
    }

    fn build(&mut self, eq: &Equilibrium, settings: &DerivativeSettings) -> Result<()> {
        let target = self.requested_target.unwrap_or_else(|| eq.psi());
        self.core.stage(vec![target], None);
        self.core.prepare(eq, 1, vec![Arg::Psi], settings)?;
        finish_build(self)
    }
}

/// Pins the free gauge of `lambda`: every `m = n = 0` coefficient is zero.
#[derive(Debug, Clone)]
pub struct FixLambdaGauge {
    idx: Vec<usize>,
    core: ObjectiveCore,
}

impl FixLambdaGauge {
    pub fn new() -> Self {
        Self {
            idx: Vec::new(),
            core: ObjectiveCore::new("lambda gauge", vec![0.0], vec![1.0]),
        }
    }
}

impl Default for FixLambdaGauge {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Scalar> Residual<T> for FixLambdaGauge {
    fn compute(&self, args: &ArgValues<T>) -> Result<Vec<T>> {
        let l = self.core.input(args, Arg::LLmn)?;
        self.core.shift_scale(self.idx.iter().map(|&i| l[i]).collect())
    }
}

impl Objective for FixLambdaGauge {
    fn name(&self) -> &str {
        self.core.name()
    }

    fn linear(&self) -> bool {
        true
    }

    fn core(&self) -> &ObjectiveCore {
        &self.core
    }

    fn core_mut(&mut self) -> &mut ObjectiveCore {
        &mut self.core
    }

    fn build(&mut self, eq: &Equilibrium, settings: &DerivativeSettings) -> Result<()> {
        self.idx = eq
            .l_basis()
            .modes()
            .iter()
            .enumerate()
            .filter(|(_, [_, m, n])| *m == 0 && *n == 0)
            .map(|(i, _)| i)
            .collect();
        self.core.stage(vec![0.0], None);
        self.core.prepare(eq, self.idx.len(), vec![Arg::LLmn], settings)?;
        finish_build(self)
    }
}

/// Interior surface at `rho = 1` equals the boundary surface.
///
/// Zernike radial polynomials are 1 at the edge, so the edge coefficient of
/// `(m, n)` is the sum of the interior coefficients over `l`.
#[derive(Debug, Clone)]
pub struct LcfsBoundary {
    a_r: DMatrix<f64>,
    a_z: DMatrix<f64>,
    core: ObjectiveCore,
}

impl LcfsBoundary {
    pub fn new() -> Self {
        Self {
            a_r: DMatrix::zeros(0, 0),
            a_z: DMatrix::zeros(0, 0),
            core: ObjectiveCore::new("lcfs", vec![0.0], vec![1.0]),
        }
    }

    pub fn weight(mut self, weight: Vec<f64>) -> Self {
        self.core = ObjectiveCore::new("lcfs", vec![0.0], weight);
        self
    }

    fn edge_map(interior: &[Mode], edge: &[Mode]) -> DMatrix<f64> {
        let mut a = DMatrix::zeros(edge.len(), interior.len());
        for (i, [_, m, n]) in interior.iter().enumerate() {
            for (j, [_, mb, nb]) in edge.iter().enumerate() {
                if m == mb && n == nb {
                    a[(j, i)] = 1.0;
                }
            }
        }
        a
    }
}

impl Default for LcfsBoundary {
    fn default() -> Self {
        Self::new()
    }
}

fn edge_error<T: Scalar>(a: &DMatrix<f64>, interior: &[T], edge: &[T]) -> Vec<T> {
    (0..a.nrows())
        .map(|j| {
            let value = a
                .row(j)
                .iter()
                .zip(interior)
                .filter(|(c, _)| **c != 0.0)
                .fold(T::zero(), |acc, (&c, &x)| acc + constant::<T>(c) * x);
            value - edge[j]
        })
        .collect()
}

impl<T: Scalar> Residual<T> for LcfsBoundary {
    fn compute(&self, args: &ArgValues<T>) -> Result<Vec<T>> {
        let r = self.core.input(args, Arg::RLmn)?;
        let z = self.core.input(args, Arg::ZLmn)?;
        let rb = self.core.input(args, Arg::RbLmn)?;
        let zb = self.core.input(args, Arg::ZbLmn)?;
        let mut f = edge_error(&self.a_r, r, rb);
        f.extend(edge_error(&self.a_z, z, zb));
        self.core.shift_scale(f)
    }
}

impl Objective for LcfsBoundary {
    fn name(&self) -> &str {
        self.core.name()
    }

    fn units(&self) -> &str {
        "(m)"
    }

    fn linear(&self) -> bool {
        true
    }

    fn core(&self) -> &ObjectiveCore {
        &self.core
    }

    fn core_mut(&mut self) -> &mut ObjectiveCore {
        &mut self.core
    }

    fn build(&mut self, eq: &Equilibrium, settings: &DerivativeSettings) -> Result<()> {
        let surface = eq.surface();
        self.a_r = Self::edge_map(eq.r_basis().modes(), surface.r_basis.modes());
        self.a_z = Self::edge_map(eq.z_basis().modes(), surface.z_basis.modes());
        let dim_f = self.a_r.nrows() + self.a_z.nrows();
        self.core.stage(vec![0.0], None);
        self.core.prepare(
            eq,
            dim_f,
            vec![Arg::RLmn, Arg::ZLmn, Arg::RbLmn, Arg::ZbLmn],
            settings,
        )?;
        finish_build(self)
    }

    fn callback(&self, args: &ArgValues<f64>) -> Result<()> {
        let f = Residual::<f64>::compute(self, args)?;
        let (r, z) = f.split_at(self.a_r.nrows());
        let norm = |v: &[f64]| v.iter().map(|x| x * x).sum::<f64>().sqrt();
        log::info!("R boundary error: {:10.3e} (m)", norm(r));
        log::info!("Z boundary error: {:10.3e} (m)", norm(z));
        Ok(())
    }
}

/// Targets the rotational transform on a set of flux surfaces.
#[derive(Debug, Clone)]
pub struct TargetIota {
    grid: Option<Grid>,
    profile: Option<PowerSeriesProfile>,
    core: ObjectiveCore,
}

impl TargetIota {
    pub fn new(target: Vec<f64>) -> Self {
        Self {
            grid: None,
            profile: None,
            core: ObjectiveCore::new("target-iota", target, vec![1.0]),
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

impl<T: Scalar> Residual<T> for TargetIota {
    fn compute(&self, args: &ArgValues<T>) -> Result<Vec<T>> {
        let profile = self
            .profile
            .as_ref()
            .ok_or_else(|| Error::not_built(self.core.name(), "compute"))?;
        let i_l = self.core.input(args, Arg::IL)?;
        self.core.shift_scale(profile.compute(i_l, 0)?)
    }
}

impl Objective for TargetIota {
    fn name(&self) -> &str {
        self.core.name()
    }

    fn linear(&self) -> bool {
        true
    }

    fn core(&self) -> &ObjectiveCore {
        &self.core
    }

    fn core_mut(&mut self) -> &mut ObjectiveCore {
        &mut self.core
    }

    fn build(&mut self, eq: &Equilibrium, settings: &DerivativeSettings) -> Result<()> {
        let grid = match self.grid.take() {
            Some(grid) => grid,
            None => Grid::radial(&[0.0, 0.5, 1.0])?,
        };
        self.profile = Some(eq.iota().clone().with_grid(&grid));
        self.core.prepare(eq, grid.num_nodes(), vec![Arg::IL], settings)?;
        self.grid = Some(grid);
        finish_build(self)
    }
}
