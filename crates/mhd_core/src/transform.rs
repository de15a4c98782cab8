use crate::basis::SpectralBasis;
use crate::error::{Error, Result};
use crate::grid::Grid;
use crate::traits::{constant, Scalar};
use nalgebra::DMatrix;
use std::collections::BTreeMap;

/// Dense maps from spectral coefficients to grid values, one per derivative order.
///
/// A transform is tied to the grid and basis it was built from. The only
/// mutation allowed afterwards is adding derivative orders with [`Transform::extend`].
#[derive(Debug, Clone)]
pub struct Transform {
    grid: Grid,
    basis: SpectralBasis,
    matrices: BTreeMap<[usize; 3], DMatrix<f64>>,
}

impl Transform {
    /// The value map (`[0, 0, 0]`) is always built.
    pub fn new(grid: &Grid, basis: &SpectralBasis, derivs: &[[usize; 3]]) -> Self {
        let mut transform = Self {
            grid: grid.clone(),
            basis: basis.clone(),
            matrices: BTreeMap::new(),
        };
        transform.extend(&[[0, 0, 0]]);
        transform.extend(derivs);
        transform
    }

    pub fn extend(&mut self, derivs: &[[usize; 3]]) {
        for &d in derivs {
            if !self.matrices.contains_key(&d) {
                let matrix = self.basis.evaluate(self.grid.nodes(), d);
                self.matrices.insert(d, matrix);
            }
        }
    }

    pub fn has_derivative(&self, derivs: [usize; 3]) -> bool {
        self.matrices.contains_key(&derivs)
    }

    pub fn derivatives(&self) -> impl Iterator<Item = &[usize; 3]> {
        self.matrices.keys()
    }

    pub fn grid(&self) -> &Grid {
        &self.grid
    }

    pub fn basis(&self) -> &SpectralBasis {
        &self.basis
    }

    pub fn matrix(&self, derivs: [usize; 3]) -> Option<&DMatrix<f64>> {
        self.matrices.get(&derivs)
    }

    /// Grid values of the field with coefficients `coeffs`, differentiated
    /// `dr`, `dt`, `dz` times.
    pub fn transform<T: Scalar>(&self, coeffs: &[T], dr: usize, dt: usize, dz: usize) -> Result<Vec<T>> {
        let matrix = self.matrices.get(&[dr, dt, dz]).ok_or_else(|| {
            Error::missing(
                format!("derivative order [{dr}, {dt}, {dz}]"),
                format!("{:?} transform", self.basis.kind()),
            )
        })?;
        if coeffs.len() != matrix.ncols() {
            return Err(Error::dimension(
                format!("{:?} transform coefficients", self.basis.kind()),
                matrix.ncols(),
                coeffs.len(),
            ));
        }
        let values = (0..matrix.nrows())
            .map(|i| {
                let row = matrix.row(i);
                row.iter()
                    .zip(coeffs)
                    .filter(|(a, _)| **a != 0.0)
                    .fold(T::zero(), |acc, (&a, &c)| acc + constant::<T>(a) * c)
            })
            .collect();
        Ok(values)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::autodiff::Dual;

    #[test]
    fn transform_evaluates_series_and_derivatives() {
        let grid = Grid::linear(2, 2, 0, 1).expect("grid");
        let basis = SpectralBasis::fourier_zernike(1, 1, 0, 1);
        let transform = Transform::new(&grid, &basis, &[[1, 0, 0], [0, 1, 0]]);
        // R = 3 + 0.5 rho cos(theta)
        let mut coeffs = vec![0.0; basis.num_modes()];
        coeffs[basis.index_of([0, 0, 0]).expect("mode")] = 3.0;
        coeffs[basis.index_of([1, 1, 0]).expect("mode")] = 0.5;

        let r = transform.transform(&coeffs, 0, 0, 0).expect("values");
        let r_t = transform.transform(&coeffs, 0, 1, 0).expect("theta derivative");
        for (i, [rho, theta, _]) in grid.nodes().iter().enumerate() {
            assert!((r[i] - (3.0 + 0.5 * rho * theta.cos())).abs() < 1e-14);
            assert!((r_t[i] + 0.5 * rho * theta.sin()).abs() < 1e-14);
        }
    }

    #[test]
    fn missing_order_is_reported_until_extended() {
        let grid = Grid::linear(1, 1, 0, 1).expect("grid");
        let basis = SpectralBasis::fourier_zernike(1, 1, 0, 1);
        let mut transform = Transform::new(&grid, &basis, &[]);
        let coeffs = vec![Dual::constant(1.0); basis.num_modes()];
        let err = transform.transform(&coeffs, 0, 0, 1).expect_err("not built");
        assert!(format!("{err}").contains("derivative order [0, 0, 1]"));

        transform.extend(&[[0, 0, 1]]);
        assert!(transform.has_derivative([0, 0, 1]));
        assert!(transform.transform(&coeffs, 0, 0, 1).is_ok());
    }
}
