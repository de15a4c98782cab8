use crate::basis::SpectralBasis;
use crate::compute::ProfileKind;
use crate::error::{Error, Result};
use crate::grid::Grid;
use crate::profiles::PowerSeriesProfile;
use nalgebra::DVector;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Named blocks of the full state vector, in canonical order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Arg {
    #[serde(rename = "R_lmn")]
    RLmn,
    #[serde(rename = "Z_lmn")]
    ZLmn,
    #[serde(rename = "L_lmn")]
    LLmn,
    #[serde(rename = "Rb_lmn")]
    RbLmn,
    #[serde(rename = "Zb_lmn")]
    ZbLmn,
    #[serde(rename = "p_l")]
    PL,
    #[serde(rename = "i_l")]
    IL,
    #[serde(rename = "c_l")]
    CL,
    Psi,
}

impl Arg {
    pub const ALL: [Arg; 9] = [
        Arg::RLmn,
        Arg::ZLmn,
        Arg::LLmn,
        Arg::RbLmn,
        Arg::ZbLmn,
        Arg::PL,
        Arg::IL,
        Arg::CL,
        Arg::Psi,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            Arg::RLmn => "R_lmn",
            Arg::ZLmn => "Z_lmn",
            Arg::LLmn => "L_lmn",
            Arg::RbLmn => "Rb_lmn",
            Arg::ZbLmn => "Zb_lmn",
            Arg::PL => "p_l",
            Arg::IL => "i_l",
            Arg::CL => "c_l",
            Arg::Psi => "Psi",
        }
    }
}

impl fmt::Display for Arg {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Per-argument values at scalar type `T`.
pub type ArgValues<T> = BTreeMap<Arg, Vec<T>>;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BoundaryMode {
    pub m: i32,
    pub n: i32,
    pub r: f64,
    pub z: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EquilibriumConfig {
    pub l: usize,
    pub m: usize,
    pub n: usize,
    pub nfp: usize,
    pub l_grid: Option<usize>,
    pub m_grid: Option<usize>,
    pub n_grid: Option<usize>,
    /// Total toroidal flux in Wb.
    pub psi: f64,
    /// Power series coefficients of the pressure profile in Pa.
    pub pressure: Vec<f64>,
    /// Power series coefficients of the rotational transform.
    pub iota: Vec<f64>,
    /// Power series coefficients of the enclosed toroidal current in A.
    pub current: Vec<f64>,
    pub boundary: Vec<BoundaryMode>,
}

impl Default for EquilibriumConfig {
    fn default() -> Self {
        Self {
            l: 2,
            m: 2,
            n: 0,
            nfp: 1,
            l_grid: None,
            m_grid: None,
            n_grid: None,
            psi: 1.0,
            pressure: vec![0.0],
            iota: vec![0.0],
            current: vec![0.0],
            boundary: vec![
                BoundaryMode { m: 0, n: 0, r: 10.0, z: 0.0 },
                BoundaryMode { m: 1, n: 0, r: 1.0, z: 0.0 },
                BoundaryMode { m: -1, n: 0, r: 0.0, z: -1.0 },
            ],
        }
    }
}

/// Fixed-boundary shape: double Fourier series for `R` and `Z` at `rho = 1`.
#[derive(Debug, Clone)]
pub struct Surface {
    pub r_basis: SpectralBasis,
    pub z_basis: SpectralBasis,
    pub r_lmn: DVector<f64>,
    pub z_lmn: DVector<f64>,
}

#[derive(Debug, Clone)]
pub struct Equilibrium {
    nfp: usize,
    l_grid: usize,
    m_grid: usize,
    n_grid: usize,
    psi: f64,
    r_basis: SpectralBasis,
    z_basis: SpectralBasis,
    l_basis: SpectralBasis,
    r_lmn: DVector<f64>,
    z_lmn: DVector<f64>,
    l_lmn: DVector<f64>,
    surface: Surface,
    pressure: PowerSeriesProfile,
    iota: PowerSeriesProfile,
    current: PowerSeriesProfile,
}

impl Equilibrium {
    /// Builds the bases, boundary and profiles, and seeds the interior by
    /// scaling every boundary mode `(m, n)` with `rho^|m|`.
    pub fn from_config(config: &EquilibriumConfig) -> Result<Self> {
        if config.nfp == 0 {
            return Err(Error::invalid_config("equilibrium", "NFP must be positive"));
        }
        let (l, m, n, nfp) = (config.l.max(config.m), config.m, config.n, config.nfp);
        let r_basis = SpectralBasis::fourier_zernike(l, m, n, nfp);
        let z_basis = r_basis.clone();
        let l_basis = r_basis.clone();
        let surface_basis = SpectralBasis::double_fourier(m, n, nfp);

        let mut surface = Surface {
            r_lmn: DVector::zeros(surface_basis.num_modes()),
            z_lmn: DVector::zeros(surface_basis.num_modes()),
            r_basis: surface_basis.clone(),
            z_basis: surface_basis,
        };
        let mut r_lmn = DVector::zeros(r_basis.num_modes());
        let mut z_lmn = DVector::zeros(z_basis.num_modes());

        for mode in &config.boundary {
            let index = surface.r_basis.index_of([0, mode.m, mode.n]).ok_or_else(|| {
                Error::invalid_config(
                    "equilibrium boundary",
                    format!("mode (m={}, n={}) exceeds resolution M={m}, N={n}", mode.m, mode.n),
                )
            })?;
            surface.r_lmn[index] = mode.r;
            surface.z_lmn[index] = mode.z;

            let interior = [mode.m.abs(), mode.m, mode.n];
            if let Some(i) = r_basis.index_of(interior) {
                r_lmn[i] = mode.r;
                z_lmn[i] = mode.z;
            }
        }

        Ok(Self {
            nfp,
            l_grid: config.l_grid.unwrap_or(2 * l.max(1)),
            m_grid: config.m_grid.unwrap_or(2 * m),
            n_grid: config.n_grid.unwrap_or(2 * n),
            psi: config.psi,
            l_lmn: DVector::zeros(l_basis.num_modes()),
            r_basis,
            z_basis,
            l_basis,
            r_lmn,
            z_lmn,
            surface,
            pressure: PowerSeriesProfile::new("pressure", config.pressure.clone())?,
            iota: PowerSeriesProfile::new("iota", config.iota.clone())?,
            current: PowerSeriesProfile::new("current", config.current.clone())?,
        })
    }

    pub fn nfp(&self) -> usize {
        self.nfp
    }

    pub fn psi(&self) -> f64 {
        self.psi
    }

    pub fn r_basis(&self) -> &SpectralBasis {
        &self.r_basis
    }

    pub fn z_basis(&self) -> &SpectralBasis {
        &self.z_basis
    }

    pub fn l_basis(&self) -> &SpectralBasis {
        &self.l_basis
    }

    pub fn surface(&self) -> &Surface {
        &self.surface
    }

    pub fn pressure(&self) -> &PowerSeriesProfile {
        &self.pressure
    }

    pub fn iota(&self) -> &PowerSeriesProfile {
        &self.iota
    }

    pub fn current(&self) -> &PowerSeriesProfile {
        &self.current
    }

    pub fn profile(&self, kind: ProfileKind) -> &PowerSeriesProfile {
        match kind {
            ProfileKind::Pressure => &self.pressure,
            ProfileKind::Iota => &self.iota,
            ProfileKind::Current => &self.current,
        }
    }

    /// Default collocation grid for volume quantities.
    pub fn default_grid(&self) -> Result<Grid> {
        Grid::linear(self.l_grid, self.m_grid, self.n_grid, self.nfp)
    }

    pub fn arg(&self, arg: Arg) -> DVector<f64> {
        match arg {
            Arg::RLmn => self.r_lmn.clone(),
            Arg::ZLmn => self.z_lmn.clone(),
            Arg::LLmn => self.l_lmn.clone(),
            Arg::RbLmn => self.surface.r_lmn.clone(),
            Arg::ZbLmn => self.surface.z_lmn.clone(),
            Arg::PL => self.pressure.params().clone(),
            Arg::IL => self.iota.params().clone(),
            Arg::CL => self.current.params().clone(),
            Arg::Psi => DVector::from_element(1, self.psi),
        }
    }

    pub fn set_arg(&mut self, arg: Arg, values: &DVector<f64>) -> Result<()> {
        let expected = self.dimension(arg);
        if values.len() != expected {
            return Err(Error::dimension(format!("equilibrium {arg}"), expected, values.len()));
        }
        match arg {
            Arg::RLmn => self.r_lmn.copy_from(values),
            Arg::ZLmn => self.z_lmn.copy_from(values),
            Arg::LLmn => self.l_lmn.copy_from(values),
            Arg::RbLmn => self.surface.r_lmn.copy_from(values),
            Arg::ZbLmn => self.surface.z_lmn.copy_from(values),
            Arg::PL => self.pressure.set_params(values)?,
            Arg::IL => self.iota.set_params(values)?,
            Arg::CL => self.current.set_params(values)?,
            Arg::Psi => self.psi = values[0],
        }
        Ok(())
    }

    pub fn dimension(&self, arg: Arg) -> usize {
        match arg {
            Arg::RLmn => self.r_basis.num_modes(),
            Arg::ZLmn => self.z_basis.num_modes(),
            Arg::LLmn => self.l_basis.num_modes(),
            Arg::RbLmn => self.surface.r_basis.num_modes(),
            Arg::ZbLmn => self.surface.z_basis.num_modes(),
            Arg::PL => self.pressure.params().len(),
            Arg::IL => self.iota.params().len(),
            Arg::CL => self.current.params().len(),
            Arg::Psi => 1,
        }
    }

    pub fn dimensions(&self) -> BTreeMap<Arg, usize> {
        Arg::ALL.iter().map(|&arg| (arg, self.dimension(arg))).collect()
    }
}
