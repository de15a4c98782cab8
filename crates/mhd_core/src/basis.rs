//! Spectral bases.
//!
//! A mode is `[l, m, n]`: radial index, poloidal number and toroidal number.
//! Negative `m` (`n`) selects `sin(|m|θ)` (`sin(|n|·NFP·ζ)`), non-negative
//! selects the cosine.

use nalgebra::DMatrix;
use serde::{Deserialize, Serialize};
use std::f64::consts::FRAC_PI_2;

pub type Mode = [i32; 3];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BasisKind {
    /// Zernike radial polynomials times a double Fourier series.
    FourierZernike,
    /// Double Fourier series on a single surface (`l = 0`).
    DoubleFourier,
    /// Radial power series `rho^l` (`m = n = 0`).
    PowerSeries,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SpectralBasis {
    kind: BasisKind,
    l: usize,
    m: usize,
    n: usize,
    nfp: usize,
    modes: Vec<Mode>,
}

impl SpectralBasis {
    pub fn fourier_zernike(l: usize, m: usize, n: usize, nfp: usize) -> Self {
        let (li, mi, ni) = (l as i32, m as i32, n as i32);
        let mut modes = Vec::new();
        for radial in 0..=li {
            for poloidal in -mi..=mi {
                if poloidal.abs() > radial || (radial - poloidal.abs()) % 2 != 0 {
                    continue;
                }
                for toroidal in -ni..=ni {
                    modes.push([radial, poloidal, toroidal]);
                }
            }
        }
        Self {
            kind: BasisKind::FourierZernike,
            l,
            m,
            n,
            nfp,
            modes,
        }
    }

    pub fn double_fourier(m: usize, n: usize, nfp: usize) -> Self {
        let (mi, ni) = (m as i32, n as i32);
        let modes = (-mi..=mi)
            .flat_map(|poloidal| (-ni..=ni).map(move |toroidal| [0, poloidal, toroidal]))
            .collect();
        Self {
            kind: BasisKind::DoubleFourier,
            l: 0,
            m,
            n,
            nfp,
            modes,
        }
    }

    pub fn power_series(l: usize) -> Self {
        Self {
            kind: BasisKind::PowerSeries,
            l,
            m: 0,
            n: 0,
            nfp: 1,
            modes: (0..=l as i32).map(|k| [k, 0, 0]).collect(),
        }
    }

    pub fn kind(&self) -> BasisKind {
        self.kind
    }

    pub fn modes(&self) -> &[Mode] {
        &self.modes
    }

    pub fn num_modes(&self) -> usize {
        self.modes.len()
    }

    pub fn nfp(&self) -> usize {
        self.nfp
    }

    /// `(L, M, N)` resolution the basis was built with.
    pub fn resolution(&self) -> (usize, usize, usize) {
        (self.l, self.m, self.n)
    }

    pub fn index_of(&self, mode: Mode) -> Option<usize> {
        self.modes.iter().position(|m| *m == mode)
    }

    /// Basis functions (columns) differentiated `derivs = [dr, dt, dz]` times,
    /// evaluated at each node (rows).
    pub fn evaluate(&self, nodes: &[[f64; 3]], derivs: [usize; 3]) -> DMatrix<f64> {
        let [dr, dt, dz] = derivs;
        DMatrix::from_fn(nodes.len(), self.modes.len(), |row, col| {
            let [rho, theta, zeta] = nodes[row];
            let [l, m, n] = self.modes[col];
            let radial = match self.kind {
                BasisKind::FourierZernike => zernike_radial(l as usize, m.unsigned_abs() as usize, rho, dr),
                BasisKind::DoubleFourier => {
                    if dr == 0 {
                        1.0
                    } else {
                        0.0
                    }
                }
                BasisKind::PowerSeries => power(l as usize, rho, dr),
            };
            if radial == 0.0 {
                return 0.0;
            }
            let poloidal = fourier(m, 1, theta, dt);
            let toroidal = fourier(n, self.nfp, zeta, dz);
            radial * poloidal * toroidal
        })
    }
}

fn factorial(k: usize) -> f64 {
    (1..=k).map(|i| i as f64).product()
}

/// `d^d/drho^d rho^p`
fn power(p: usize, rho: f64, d: usize) -> f64 {
    if d > p {
        return 0.0;
    }
    let falling: f64 = (0..d).map(|i| (p - i) as f64).product();
    falling * rho.powi((p - d) as i32)
}

/// Derivative of order `d` of the Zernike radial polynomial `R_l^m(rho)`.
fn zernike_radial(l: usize, m: usize, rho: f64, d: usize) -> f64 {
    if m > l || (l - m) % 2 != 0 {
        return 0.0;
    }
    (0..=(l - m) / 2)
        .map(|k| {
            let sign = if k % 2 == 0 { 1.0 } else { -1.0 };
            let coeff = sign * factorial(l - k)
                / (factorial(k) * factorial((l + m) / 2 - k) * factorial((l - m) / 2 - k));
            coeff * power(l - 2 * k, rho, d)
        })
        .sum()
}

/// `d^d/dx^d` of `cos(k·x)` (`mode >= 0`) or `sin(k·x)` (`mode < 0`), `k = |mode|·nfp`.
fn fourier(mode: i32, nfp: usize, x: f64, d: usize) -> f64 {
    let k = (mode.unsigned_abs() as usize * nfp) as f64;
    let phase = k * x + d as f64 * FRAC_PI_2;
    let scale = k.powi(d as i32);
    if mode >= 0 {
        scale * phase.cos()
    } else {
        scale * phase.sin()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zernike_modes_respect_parity() {
        let basis = SpectralBasis::fourier_zernike(2, 2, 0, 1);
        let modes = basis.modes();
        assert_eq!(modes, &[[0, 0, 0], [1, -1, 0], [1, 1, 0], [2, -2, 0], [2, 0, 0], [2, 2, 0]]);
        assert_eq!(basis.resolution(), (2, 2, 0));
    }

    #[test]
    fn zernike_radial_matches_closed_forms() {
        let rho = 0.6_f64;
        assert!((zernike_radial(2, 0, rho, 0) - (2.0 * rho * rho - 1.0)).abs() < 1e-15);
        assert!((zernike_radial(2, 0, rho, 1) - 4.0 * rho).abs() < 1e-15);
        assert!((zernike_radial(3, 1, rho, 0) - (3.0 * rho.powi(3) - 2.0 * rho)).abs() < 1e-15);
        assert!((zernike_radial(4, 0, rho, 2) - (72.0 * rho * rho - 12.0)).abs() < 1e-12);
    }

    #[test]
    fn derivatives_follow_the_phase_shift() {
        let basis = SpectralBasis::double_fourier(2, 1, 3);
        let nodes = [[1.0, 0.4, 0.3]];
        let values = basis.evaluate(&nodes, [0, 0, 0]);
        let dt = basis.evaluate(&nodes, [0, 1, 0]);
        let dz = basis.evaluate(&nodes, [0, 0, 1]);
        let index = basis.index_of([0, -2, 1]).expect("mode present");
        let (theta, zeta) = (0.4_f64, 0.3_f64);
        assert!((values[(0, index)] - (2.0 * theta).sin() * (3.0 * zeta).cos()).abs() < 1e-15);
        assert!((dt[(0, index)] - 2.0 * (2.0 * theta).cos() * (3.0 * zeta).cos()).abs() < 1e-14);
        assert!((dz[(0, index)] + 3.0 * (2.0 * theta).sin() * (3.0 * zeta).sin()).abs() < 1e-14);
    }
}
