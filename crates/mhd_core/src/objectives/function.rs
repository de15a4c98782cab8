use super::{Objective, Residual};
use crate::derivatives::{
    make_derivative, BlockJacobian, BlockSpec, Derivative, DerivativeSettings, Device,
    JacobianEstimator, Mode,
};
use crate::equilibrium::{Arg, ArgValues, Equilibrium};
use crate::error::{Error, Result};
use crate::traits::{constant, ArgFunction, Scalar};
use nalgebra::{DMatrix, DVector};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::ops::Range;
use std::time::Instant;

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ObjectiveFunctionSettings {
    pub derivatives: DerivativeSettings,
    /// Row partition for the Jacobian. `None` differentiates all rows at once.
    pub jac_blocks: Option<BlockSpec>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CompileMode {
    /// `Scalar` for scalar objective functions, `Lsq` otherwise.
    #[default]
    Auto,
    Lsq,
    Scalar,
    All,
}

/// Linear-constraint elimination and state layout, fixed at build.
#[derive(Debug, Clone)]
struct Layout {
    args: Vec<Arg>,
    dimensions: BTreeMap<Arg, usize>,
    y_idx: BTreeMap<Arg, Range<usize>>,
    b_idx: BTreeMap<Arg, Vec<usize>>,
    dim_y: usize,
    dim_x: usize,
    dim_c: usize,
    dim_f: usize,
    scalar: bool,
    a: DMatrix<f64>,
    b: DVector<f64>,
    ainv: DMatrix<f64>,
    y0: DVector<f64>,
    z: DMatrix<f64>,
}

/// Residual objectives plus eliminated linear constraints.
///
/// Optimization runs in the reduced variables `x`; the full state is
/// `y = y0 + Z x`, where `Z` spans the null space of the stacked constraint
/// matrix `A` and `y0` is the least-norm solution of `A y = b`.
pub struct ObjectiveFunction {
    objectives: Vec<Box<dyn Objective>>,
    constraints: Vec<Box<dyn Objective>>,
    settings: ObjectiveFunctionSettings,
    devices: Vec<Device>,
    layout: Option<Layout>,
    compiled: bool,
}

impl ObjectiveFunction {
    pub fn new(
        objectives: Vec<Box<dyn Objective>>,
        constraints: Vec<Box<dyn Objective>>,
        settings: ObjectiveFunctionSettings,
    ) -> Self {
        Self {
            objectives,
            constraints,
            settings,
            devices: Vec::new(),
            layout: None,
            compiled: false,
        }
    }

    /// Devices the Jacobian row blocks run on, used when `jac_blocks` is set.
    pub fn with_devices(mut self, devices: Vec<Device>) -> Self {
        self.devices = devices;
        self
    }

    pub fn build(&mut self, eq: &Equilibrium) -> Result<()> {
        let timer = Instant::now();
        self.layout = None;
        self.compiled = false;
        let derivatives = self.settings.derivatives;

        let mut dim_c = 0;
        for constraint in &mut self.constraints {
            if !constraint.linear() {
                return Err(Error::UnsupportedConstraint {
                    name: constraint.name().to_string(),
                });
            }
            log::info!("Building constraint: {}", constraint.name());
            constraint.build(eq, &derivatives)?;
            dim_c += constraint.dim_f();
        }

        let mut dim_f = 0;
        for objective in &mut self.objectives {
            log::info!("Building objective: {}", objective.name());
            objective.build(eq, &derivatives)?;
            dim_f += objective.dim_f();
        }

        let args: Vec<Arg> = self
            .objectives
            .iter()
            .chain(&self.constraints)
            .flat_map(|o| o.args().iter().copied())
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect();
        let dimensions = eq.dimensions();
        let mut y_idx = BTreeMap::new();
        let mut dim_y = 0;
        for &arg in &args {
            let dim = dimensions[&arg];
            y_idx.insert(arg, dim_y..dim_y + dim);
            dim_y += dim;
        }
        let mut b_idx: BTreeMap<Arg, Vec<usize>> = BTreeMap::new();
        let mut row = 0;
        for constraint in &self.constraints {
            if let Some(arg) = constraint.target_arg() {
                b_idx.entry(arg).or_default().extend(row..row + constraint.dim_f());
            }
            row += constraint.dim_f();
        }

        log::info!("Building linear constraints");
        let linear_timer = Instant::now();
        let (a, b) = self.stack_constraints(&args, &y_idx, &dimensions, dim_c, dim_y)?;
        let (ainv, y0, z) = if self.constraints.is_empty() {
            (
                DMatrix::zeros(dim_y, 0),
                DVector::zeros(dim_y),
                DMatrix::identity(dim_y, dim_y),
            )
        } else {
            null_space(&a, &b)?
        };
        log::debug!("linear constraint build: {:?}", linear_timer.elapsed());

        let dim_x = z.ncols();
        self.layout = Some(Layout {
            args,
            dimensions,
            y_idx,
            b_idx,
            dim_y,
            dim_x,
            dim_c,
            dim_f,
            scalar: dim_f == 1,
            a,
            b,
            ainv,
            y0,
            z,
        });
        log::debug!("objective build: {:?}", timer.elapsed());
        Ok(())
    }

    /// `A` from the constant constraint derivatives and `b` from their
    /// offsets, so that `A y = b` exactly where every constraint residual vanishes.
    fn stack_constraints(
        &self,
        args: &[Arg],
        y_idx: &BTreeMap<Arg, Range<usize>>,
        dimensions: &BTreeMap<Arg, usize>,
        dim_c: usize,
        dim_y: usize,
    ) -> Result<(DMatrix<f64>, DVector<f64>)> {
        let zeros = zero_state(dimensions);
        let mut a = DMatrix::zeros(dim_c, dim_y);
        let mut b = DVector::zeros(dim_c);
        let mut row = 0;
        for constraint in &self.constraints {
            let rows = constraint.dim_f();
            for &arg in args {
                let block = constraint.jacobian(arg, &zeros)?;
                let cols = &y_idx[&arg];
                a.view_mut((row, cols.start), (rows, cols.len())).copy_from(&block);
            }
            let offset = Residual::<f64>::compute(constraint.as_ref(), &zeros)?;
            for (i, value) in offset.into_iter().enumerate() {
                b[row + i] = -value;
            }
            row += rows;
        }
        Ok((a, b))
    }

    /// Refreshes constraint targets from `eq` and moves `y0` accordingly.
    pub fn rebuild_constraints(&mut self, eq: &Equilibrium) -> Result<()> {
        if self.layout.is_none() {
            return Err(Error::not_built("objective function", "rebuild_constraints"));
        }
        for constraint in &mut self.constraints {
            constraint.update_target(eq)?;
        }
        let layout = self.layout("rebuild_constraints")?;
        let zeros = zero_state(&layout.dimensions);
        let mut b = DVector::zeros(layout.dim_c);
        let mut row = 0;
        for constraint in &self.constraints {
            let offset = Residual::<f64>::compute(constraint.as_ref(), &zeros)?;
            for (i, value) in offset.into_iter().enumerate() {
                b[row + i] = -value;
            }
            row += constraint.dim_f();
        }
        let y0 = if layout.dim_c == 0 {
            DVector::zeros(layout.dim_y)
        } else {
            &layout.ainv * &b
        };
        if let Some(layout) = self.layout.as_mut() {
            layout.b = b;
            layout.y0 = y0;
        }
        Ok(())
    }

    fn layout(&self, operation: &str) -> Result<&Layout> {
        self.layout
            .as_ref()
            .ok_or_else(|| Error::not_built("objective function", operation))
    }

    /// Splits `x` (length `dim_x`) or `y` (length `dim_y`) into named arguments.
    ///
    /// A state of length `dim_x` is always read as `x` and recovered through
    /// `y0 + Z x`, including when `dim_x == dim_y`.
    pub fn unpack_state(&self, state: &DVector<f64>) -> Result<ArgValues<f64>> {
        let layout = self.layout("unpack_state")?;
        let y = if state.len() == layout.dim_x {
            self.recover(state)?
        } else if state.len() == layout.dim_y {
            state.clone()
        } else {
            return Err(Error::dimension(
                "objective function state",
                format!("{} (x) or {} (y)", layout.dim_x, layout.dim_y),
                state.len(),
            ));
        };
        Ok(layout
            .y_idx
            .iter()
            .map(|(&arg, range)| (arg, y.as_slice()[range.clone()].to_vec()))
            .collect())
    }

    /// Argument map at type `T` for the reduced vector `x`.
    fn unpack_reduced<T: Scalar>(&self, x: &[T]) -> Result<ArgValues<T>> {
        let layout = self.layout("compute")?;
        if x.len() != layout.dim_x {
            return Err(Error::dimension("objective function x", layout.dim_x, x.len()));
        }
        let y: Vec<T> = (0..layout.dim_y)
            .map(|i| {
                layout
                    .z
                    .row(i)
                    .iter()
                    .zip(x)
                    .filter(|(zij, _)| **zij != 0.0)
                    .fold(constant::<T>(layout.y0[i]), |acc, (&zij, &xj)| {
                        acc + constant::<T>(zij) * xj
                    })
            })
            .collect();
        Ok(layout
            .y_idx
            .iter()
            .map(|(&arg, range)| (arg, y[range.clone()].to_vec()))
            .collect())
    }

    fn residual<T: Scalar>(&self, args: &ArgValues<T>) -> Result<Vec<T>>
    where
        dyn Objective: Residual<T>,
    {
        let mut f = Vec::new();
        for objective in &self.objectives {
            f.extend(Residual::<T>::compute(objective.as_ref(), args)?);
        }
        Ok(f)
    }

    fn scalar_residual<T: Scalar>(&self, args: &ArgValues<T>) -> Result<T>
    where
        dyn Objective: Residual<T>,
    {
        let mut total = T::zero();
        for objective in &self.objectives {
            total = total + Residual::<T>::compute_scalar(objective.as_ref(), args)?;
        }
        Ok(total)
    }

    /// Concatenated residuals of every objective.
    pub fn compute(&self, state: &DVector<f64>) -> Result<DVector<f64>> {
        let args = self.unpack_state(state)?;
        Ok(DVector::from_vec(self.residual(&args)?))
    }

    /// Sum of the objectives' scalar forms; `0.5 * |f|^2` unless an
    /// objective overrides its scalar form.
    pub fn compute_scalar(&self, state: &DVector<f64>) -> Result<f64> {
        let args = self.unpack_state(state)?;
        self.scalar_residual(&args)
    }

    pub fn callback(&self, state: &DVector<f64>) -> Result<()> {
        let total = self.compute_scalar(state)?;
        log::info!("Total (sum of squares): {total:10.3e}");
        let args = self.unpack_state(state)?;
        for objective in &self.objectives {
            objective.callback(&args)?;
        }
        Ok(())
    }

    /// `x = Zᵀ (y - y0)`.
    pub fn project(&self, y: &DVector<f64>) -> Result<DVector<f64>> {
        let layout = self.layout("project")?;
        if y.len() != layout.dim_y {
            return Err(Error::dimension("project input y", layout.dim_y, y.len()));
        }
        Ok(layout.z.tr_mul(&(y - &layout.y0)))
    }

    /// `y = y0 + Z x`.
    pub fn recover(&self, x: &DVector<f64>) -> Result<DVector<f64>> {
        let layout = self.layout("recover")?;
        if x.len() != layout.dim_x {
            return Err(Error::dimension("recover input x", layout.dim_x, x.len()));
        }
        Ok(&layout.y0 + &layout.z * x)
    }

    /// Nearest point of the constraint subspace, in the `Z` sense.
    pub fn make_feasible(&self, y: &DVector<f64>) -> Result<DVector<f64>> {
        self.recover(&self.project(y)?)
    }

    pub fn y(&self, eq: &Equilibrium) -> Result<DVector<f64>> {
        let layout = self.layout("y")?;
        let mut y = DVector::zeros(layout.dim_y);
        for (&arg, range) in &layout.y_idx {
            let values = eq.arg(arg);
            if values.len() != range.len() {
                return Err(Error::dimension(
                    format!("equilibrium {arg}"),
                    range.len(),
                    values.len(),
                ));
            }
            y.rows_mut(range.start, range.len()).copy_from(&values);
        }
        Ok(y)
    }

    pub fn x(&self, eq: &Equilibrium) -> Result<DVector<f64>> {
        self.project(&self.y(eq)?)
    }

    pub fn grad(&self, x: &DVector<f64>) -> Result<DVector<f64>> {
        let handle = make_derivative(&self.settings.derivatives, ComposedScalar(self), 0, Mode::Grad)?;
        handle.compute(std::slice::from_ref(x))?.into_vector()
    }

    pub fn hess(&self, x: &DVector<f64>) -> Result<DMatrix<f64>> {
        let handle = make_derivative(&self.settings.derivatives, ComposedScalar(self), 0, Mode::Hess)?;
        Ok(handle.compute(std::slice::from_ref(x))?.into_matrix())
    }

    /// Jacobian of [`compute`](Self::compute) w.r.t. `x`, shaped `(dim_f, dim_x)`.
    pub fn jac(&self, x: &DVector<f64>) -> Result<DMatrix<f64>> {
        let layout = self.layout("jac")?;
        match self.settings.jac_blocks {
            Some(spec) => BlockJacobian::new(
                ComposedResidual(self),
                0,
                layout.dim_f,
                spec,
                self.devices.clone(),
                self.settings.derivatives,
            )?
            .jacobian(std::slice::from_ref(x)),
            None => {
                let handle =
                    make_derivative(&self.settings.derivatives, ComposedResidual(self), 0, Mode::Fwd)?;
                Ok(handle.compute(std::slice::from_ref(x))?.into_matrix())
            }
        }
    }

    pub fn jvp(&self, v: &DVector<f64>, x: &DVector<f64>) -> Result<DVector<f64>> {
        let handle = make_derivative(&self.settings.derivatives, ComposedResidual(self), 0, Mode::Jvp)?;
        handle.jvp(v, std::slice::from_ref(x))
    }

    /// Evaluates the requested derivatives once at `x = 0`.
    pub fn compile(&mut self, mode: CompileMode) -> Result<()> {
        let layout = self.layout("compile")?;
        let mode = match mode {
            CompileMode::Auto if layout.scalar => CompileMode::Scalar,
            CompileMode::Auto => CompileMode::Lsq,
            other => other,
        };
        let x = DVector::zeros(layout.dim_x);

        log::info!("Compiling objective function and derivatives");
        let total = Instant::now();
        if matches!(mode, CompileMode::Scalar | CompileMode::All) {
            let timer = Instant::now();
            self.compute_scalar(&x)?;
            log::debug!("objective compilation time: {:?}", timer.elapsed());
            let timer = Instant::now();
            self.grad(&x)?;
            log::debug!("gradient compilation time: {:?}", timer.elapsed());
            let timer = Instant::now();
            self.hess(&x)?;
            log::debug!("hessian compilation time: {:?}", timer.elapsed());
        }
        if matches!(mode, CompileMode::Lsq | CompileMode::All) {
            let timer = Instant::now();
            self.compute(&x)?;
            log::debug!("objective compilation time: {:?}", timer.elapsed());
            let timer = Instant::now();
            self.jac(&x)?;
            log::debug!("jacobian compilation time: {:?}", timer.elapsed());
        }
        log::debug!("total compilation time: {:?}", total.elapsed());
        self.compiled = true;
        Ok(())
    }

    pub fn objectives(&self) -> &[Box<dyn Objective>] {
        &self.objectives
    }

    pub fn constraints(&self) -> &[Box<dyn Objective>] {
        &self.constraints
    }

    pub fn settings(&self) -> &ObjectiveFunctionSettings {
        &self.settings
    }

    pub fn built(&self) -> bool {
        self.layout.is_some()
    }

    pub fn compiled(&self) -> bool {
        self.compiled
    }

    pub fn scalar(&self) -> Result<bool> {
        Ok(self.layout("scalar")?.scalar)
    }

    pub fn args(&self) -> Result<&[Arg]> {
        Ok(&self.layout("args")?.args)
    }

    pub fn dimensions(&self) -> Result<&BTreeMap<Arg, usize>> {
        Ok(&self.layout("dimensions")?.dimensions)
    }

    pub fn y_idx(&self) -> Result<&BTreeMap<Arg, Range<usize>>> {
        Ok(&self.layout("y_idx")?.y_idx)
    }

    /// Rows of `b` holding each argument's constraint targets.
    pub fn b_idx(&self) -> Result<&BTreeMap<Arg, Vec<usize>>> {
        Ok(&self.layout("b_idx")?.b_idx)
    }

    pub fn dim_y(&self) -> Result<usize> {
        Ok(self.layout("dim_y")?.dim_y)
    }

    pub fn dim_x(&self) -> Result<usize> {
        Ok(self.layout("dim_x")?.dim_x)
    }

    pub fn dim_c(&self) -> Result<usize> {
        Ok(self.layout("dim_c")?.dim_c)
    }

    pub fn dim_f(&self) -> Result<usize> {
        Ok(self.layout("dim_f")?.dim_f)
    }

    pub fn a(&self) -> Result<&DMatrix<f64>> {
        Ok(&self.layout("A")?.a)
    }

    pub fn b(&self) -> Result<&DVector<f64>> {
        Ok(&self.layout("b")?.b)
    }

    pub fn ainv(&self) -> Result<&DMatrix<f64>> {
        Ok(&self.layout("Ainv")?.ainv)
    }

    pub fn y0(&self) -> Result<&DVector<f64>> {
        Ok(&self.layout("y0")?.y0)
    }

    pub fn z(&self) -> Result<&DMatrix<f64>> {
        Ok(&self.layout("Z")?.z)
    }
}

fn zero_state(dimensions: &BTreeMap<Arg, usize>) -> ArgValues<f64> {
    dimensions
        .iter()
        .map(|(&arg, &dim)| (arg, vec![0.0; dim]))
        .collect()
}

/// Pseudoinverse, particular solution and null space of `A`.
///
/// Singular values at or below `max(s) * eps * max(M, N)` count as zero.
/// Their right singular vectors, together with the trailing ones when
/// `M < N`, form `Z`.
fn null_space(
    a: &DMatrix<f64>,
    b: &DVector<f64>,
) -> Result<(DMatrix<f64>, DVector<f64>, DMatrix<f64>)> {
    let (m, n) = a.shape();
    // Padding to square gives the full set of right singular vectors.
    let padded = if m < n {
        let mut square = DMatrix::zeros(n, n);
        square.view_mut((0, 0), (m, n)).copy_from(a);
        square
    } else {
        a.clone()
    };
    let svd = padded.svd(true, true);
    let u = svd
        .u
        .ok_or_else(|| Error::numerical("constraint SVD", "left singular vectors unavailable"))?;
    let v_t = svd
        .v_t
        .ok_or_else(|| Error::numerical("constraint SVD", "right singular vectors unavailable"))?;
    let s = svd.singular_values;

    let mut order: Vec<usize> = (0..s.len()).collect();
    order.sort_by(|&i, &j| s[j].total_cmp(&s[i]));
    let s_max = order.first().map_or(0.0, |&i| s[i]);
    let tol = s_max * f64::EPSILON * m.max(n) as f64;
    let (kept, dropped): (Vec<usize>, Vec<usize>) = order.into_iter().partition(|&i| s[i] > tol);

    let mut ainv = DMatrix::zeros(n, m);
    for &i in &kept {
        let v = v_t.row(i).transpose();
        let u_i = u.view((0, i), (m, 1));
        ainv += (v * u_i.transpose()) / s[i];
    }
    let y0 = &ainv * b;
    let z = if dropped.is_empty() {
        DMatrix::zeros(n, 0)
    } else {
        let columns: Vec<DVector<f64>> = dropped.iter().map(|&i| v_t.row(i).transpose()).collect();
        DMatrix::from_columns(&columns)
    };
    log::debug!(
        "constraints: rank {} of {}x{}, null space dimension {}",
        kept.len(),
        m,
        n,
        z.ncols()
    );
    Ok((ainv, y0, z))
}

/// `x -> compute(x)` for the derivative engine.
struct ComposedResidual<'a>(&'a ObjectiveFunction);

impl<T: Scalar> ArgFunction<T> for ComposedResidual<'_>
where
    dyn Objective: Residual<T>,
{
    fn call(&self, args: &[Vec<T>]) -> Result<Vec<T>> {
        let x = args
            .first()
            .ok_or_else(|| Error::dimension("objective function arguments", 1, 0))?;
        let values = self.0.unpack_reduced(x)?;
        self.0.residual(&values)
    }
}

/// `x -> compute_scalar(x)` for the derivative engine.
struct ComposedScalar<'a>(&'a ObjectiveFunction);

impl<T: Scalar> ArgFunction<T> for ComposedScalar<'_>
where
    dyn Objective: Residual<T>,
{
    fn call(&self, args: &[Vec<T>]) -> Result<Vec<T>> {
        let x = args
            .first()
            .ok_or_else(|| Error::dimension("objective function arguments", 1, 0))?;
        let values = self.0.unpack_reduced(x)?;
        Ok(vec![self.0.scalar_residual(&values)?])
    }
}
