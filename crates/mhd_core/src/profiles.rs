use crate::basis::SpectralBasis;
use crate::error::{Error, Result};
use crate::grid::Grid;
use crate::transform::Transform;
use crate::traits::Scalar;
use nalgebra::DVector;

/// Radial profile `f(rho) = Σ_l params_l · rho^l`.
///
/// A profile evaluates on the grid it was assigned with [`with_grid`](Self::with_grid).
/// Objectives clone the equilibrium's profile before re-gridding it.
#[derive(Debug, Clone)]
pub struct PowerSeriesProfile {
    name: String,
    basis: SpectralBasis,
    params: DVector<f64>,
    transform: Option<Transform>,
}

impl PowerSeriesProfile {
    pub fn new(name: impl Into<String>, params: Vec<f64>) -> Result<Self> {
        let name = name.into();
        if params.is_empty() {
            return Err(Error::invalid_config(
                format!("{name} profile"),
                "at least one coefficient is required",
            ));
        }
        Ok(Self {
            basis: SpectralBasis::power_series(params.len() - 1),
            params: DVector::from_vec(params),
            name,
            transform: None,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn params(&self) -> &DVector<f64> {
        &self.params
    }

    pub fn set_params(&mut self, params: &DVector<f64>) -> Result<()> {
        if params.len() != self.params.len() {
            return Err(Error::dimension(
                format!("{} profile params", self.name),
                self.params.len(),
                params.len(),
            ));
        }
        self.params.copy_from(params);
        Ok(())
    }

    pub fn basis(&self) -> &SpectralBasis {
        &self.basis
    }

    pub fn grid(&self) -> Option<&Grid> {
        self.transform.as_ref().map(Transform::grid)
    }

    /// Same profile evaluated on `grid` (value and first two radial derivatives).
    pub fn with_grid(mut self, grid: &Grid) -> Self {
        self.transform = Some(Transform::new(grid, &self.basis, &[[1, 0, 0], [2, 0, 0]]));
        self
    }

    /// Profile (or its `dr`-th radial derivative) at the grid nodes for
    /// coefficients `params`.
    pub fn compute<T: Scalar>(&self, params: &[T], dr: usize) -> Result<Vec<T>> {
        let transform = self
            .transform
            .as_ref()
            .ok_or_else(|| Error::missing("grid", format!("{} profile", self.name)))?;
        transform.transform(params, dr, 0, 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn evaluates_polynomial_and_derivative() {
        let grid = Grid::radial(&[0.0, 0.5, 1.0]).expect("grid");
        let profile = PowerSeriesProfile::new("pressure", vec![1.0, 0.0, -1.0])
            .expect("profile")
            .with_grid(&grid);
        let params = profile.params().as_slice().to_vec();
        let p = profile.compute(&params, 0).expect("values");
        let p_r = profile.compute(&params, 1).expect("derivative");
        assert_eq!(p, vec![1.0, 0.75, 0.0]);
        assert_eq!(p_r, vec![0.0, -1.0, -2.0]);
    }

    #[test]
    fn evaluation_requires_a_grid() {
        let profile = PowerSeriesProfile::new("iota", vec![0.5]).expect("profile");
        let err = profile.compute(&[0.5], 0).expect_err("no grid");
        assert!(format!("{err}").contains("missing input grid required by iota profile"));
    }

    #[test]
    fn regridding_a_clone_leaves_original_untouched() {
        let original = PowerSeriesProfile::new("iota", vec![0.5, 0.1]).expect("profile");
        let regridded = original.clone().with_grid(&Grid::radial(&[1.0]).expect("grid"));
        assert!(original.grid().is_none());
        assert_eq!(regridded.grid().map(Grid::num_nodes), Some(1));
    }
}
