use crate::error::{Error, Result};
use crate::traits::{constant, Scalar};
use std::f64::consts::PI;

/// Collocation nodes in flux coordinates `(rho, theta, zeta)`.
///
/// Nodes are ordered with `rho` varying fastest, then `theta`, then `zeta`,
/// so the first `num_rho` nodes hold one value per flux surface.
/// Weights integrate over the full torus and sum to `4π²`.
#[derive(Debug, Clone, PartialEq)]
pub struct Grid {
    nodes: Vec<[f64; 3]>,
    spacing: Vec<[f64; 3]>,
    weights: Vec<f64>,
    num_rho: usize,
    num_theta: usize,
    num_zeta: usize,
    nfp: usize,
}

impl Grid {
    /// Tensor grid with `num_rho` midpoint surfaces, `2M+1` poloidal and
    /// `2N+1` toroidal nodes per field period.
    pub fn linear(num_rho: usize, m: usize, n: usize, nfp: usize) -> Result<Self> {
        if num_rho == 0 {
            return Err(Error::invalid_config("grid", "at least one radial node is required"));
        }
        if nfp == 0 {
            return Err(Error::invalid_config("grid", "NFP must be positive"));
        }
        let num_theta = 2 * m + 1;
        let num_zeta = 2 * n + 1;
        let d_rho = 1.0 / num_rho as f64;
        let d_theta = 2.0 * PI / num_theta as f64;
        let d_zeta = 2.0 * PI / (num_zeta * nfp) as f64;

        let total = num_rho * num_theta * num_zeta;
        let mut nodes = Vec::with_capacity(total);
        for k in 0..num_zeta {
            for j in 0..num_theta {
                for i in 0..num_rho {
                    nodes.push([(i as f64 + 0.5) * d_rho, j as f64 * d_theta, k as f64 * d_zeta]);
                }
            }
        }
        let spacing = vec![[d_rho, d_theta, d_zeta * nfp as f64]; total];
        let weights = vec![d_rho * d_theta * d_zeta * nfp as f64; total];
        Ok(Self {
            nodes,
            spacing,
            weights,
            num_rho,
            num_theta,
            num_zeta,
            nfp,
        })
    }

    /// One node per requested surface at `theta = zeta = 0`.
    pub fn radial(rho: &[f64]) -> Result<Self> {
        if rho.is_empty() {
            return Err(Error::invalid_config("grid", "at least one radial node is required"));
        }
        if let Some(bad) = rho.iter().find(|r| !(0.0..=1.0).contains(*r)) {
            return Err(Error::invalid_config(
                "grid",
                format!("rho = {bad} is outside [0, 1]"),
            ));
        }
        let d_rho = 1.0 / rho.len() as f64;
        let nodes = rho.iter().map(|&r| [r, 0.0, 0.0]).collect();
        Ok(Self {
            nodes,
            spacing: vec![[d_rho, 2.0 * PI, 2.0 * PI]; rho.len()],
            weights: vec![4.0 * PI * PI * d_rho; rho.len()],
            num_rho: rho.len(),
            num_theta: 1,
            num_zeta: 1,
            nfp: 1,
        })
    }

    pub fn nodes(&self) -> &[[f64; 3]] {
        &self.nodes
    }

    pub fn spacing(&self) -> &[[f64; 3]] {
        &self.spacing
    }

    pub fn weights(&self) -> &[f64] {
        &self.weights
    }

    pub fn num_nodes(&self) -> usize {
        self.nodes.len()
    }

    pub fn num_rho(&self) -> usize {
        self.num_rho
    }

    pub fn num_theta(&self) -> usize {
        self.num_theta
    }

    pub fn num_zeta(&self) -> usize {
        self.num_zeta
    }

    pub fn nfp(&self) -> usize {
        self.nfp
    }

    /// Unweighted mean over `theta` and `zeta` on each flux surface.
    pub fn surface_means<T: Scalar>(&self, values: &[T]) -> Vec<T> {
        let mut sums = vec![T::zero(); self.num_rho];
        for (i, &value) in values.iter().enumerate() {
            let surface = i % self.num_rho;
            sums[surface] = sums[surface] + value;
        }
        let count = constant::<T>((self.num_theta * self.num_zeta) as f64);
        sums.into_iter().map(|sum| sum / count).collect()
    }

    /// Keeps one value per flux surface from a full-grid array.
    pub fn compress<T: Copy>(&self, values: &[T]) -> Vec<T> {
        values.iter().take(self.num_rho).copied().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn weights_cover_the_torus() {
        let grid = Grid::linear(4, 3, 2, 5).expect("grid");
        assert_eq!(grid.num_nodes(), 4 * 7 * 5);
        let total: f64 = grid.weights().iter().sum();
        assert!((total - 4.0 * PI * PI).abs() < 1e-12);
    }

    #[test]
    fn rho_varies_fastest() {
        let grid = Grid::linear(3, 1, 0, 1).expect("grid");
        let rho: Vec<f64> = grid.compress(grid.nodes()).iter().map(|n| n[0]).collect();
        assert_eq!(rho.len(), 3);
        assert!((rho[0] - 1.0 / 6.0).abs() < 1e-15);
        assert!((rho[2] - 5.0 / 6.0).abs() < 1e-15);
        assert_eq!(grid.nodes()[3][0], grid.nodes()[0][0]);
    }

    #[test]
    fn surface_means_group_nodes_by_rho() {
        let grid = Grid::linear(2, 1, 0, 1).expect("grid");
        let values: Vec<f64> = grid.nodes().iter().map(|n| n[0] + n[1].cos()).collect();
        let means = grid.surface_means(&values);
        assert_eq!(means.len(), 2);
        assert!((means[0] - 0.25).abs() < 1e-14);
        assert!((means[1] - 0.75).abs() < 1e-14);
    }

    #[test]
    fn radial_grid_rejects_out_of_range_rho() {
        let err = Grid::radial(&[0.5, 1.2]).expect_err("rho > 1");
        assert!(format!("{err}").contains("outside [0, 1]"));
    }
}
