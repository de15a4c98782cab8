use super::registry::Quantity;
use super::{ComputeInputs, Data, Field, ProfileKind};
use crate::equilibrium::Arg;
use crate::error::{Error, Result};
use crate::traits::{constant, Scalar};
use std::f64::consts::PI;

/// Vacuum permeability in H/m.
const MU_0: f64 = 4.0 * PI * 1.0e-7;

/// Tagged compute function of a registry entry.
///
/// Kernels that produce several related quantities (`X`/`Y`, the three basis
/// vectors, the energy terms) write all of them in one pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Kernel {
    /// Spectral field evaluated with the given derivative order.
    Field(Field, [usize; 3]),
    Phi,
    Cartesian,
    ToroidalFlux,
    Pressure,
    RotationalTransform,
    CurrentProfile,
    BasisVectors,
    Jacobian,
    ContravariantField,
    MagneticField,
    CovariantField,
    /// Ampère's law on each flux surface.
    ToroidalCurrent,
    Volume,
    Energy,
}

fn put<T>(data: &mut Data<T>, name: &'static str, values: Vec<T>) {
    data.entry(name).or_insert(values);
}

fn fetch<'d, T>(data: &'d Data<T>, name: &str, needed_by: &str) -> Result<&'d [T]> {
    data.get(name)
        .map(Vec::as_slice)
        .ok_or_else(|| Error::missing(name, needed_by))
}

fn param<'p, T: Scalar>(inputs: &'p ComputeInputs<'_, T>, arg: Arg, needed_by: &str) -> Result<&'p [T]> {
    inputs
        .params
        .get(&arg)
        .map(Vec::as_slice)
        .ok_or_else(|| Error::missing(arg.name(), needed_by))
}

fn profile<T: Scalar>(
    inputs: &ComputeInputs<'_, T>,
    kind: ProfileKind,
    needed_by: &str,
) -> Result<(Vec<T>, Vec<T>)> {
    let profile = inputs
        .profiles
        .get(&kind)
        .ok_or_else(|| Error::missing(kind.name(), needed_by))?;
    let nodes = profile.grid().map_or(0, |g| g.num_nodes());
    if nodes != inputs.grid.num_nodes() {
        return Err(Error::dimension(
            format!("{kind} profile grid for {needed_by}"),
            inputs.grid.num_nodes(),
            nodes,
        ));
    }
    let params = param(inputs, kind.arg(), needed_by)?;
    Ok((profile.compute(params, 0)?, profile.compute(params, 1)?))
}

fn weighted_sum<T: Scalar>(values: impl Iterator<Item = T>, weights: &[f64]) -> T {
    values
        .zip(weights)
        .fold(T::zero(), |acc, (v, &w)| acc + v * constant::<T>(w))
}

impl Kernel {
    /// Runs the kernel, writing its outputs into `data`. Outputs already
    /// present are kept as they are.
    pub fn evaluate<T: Scalar>(
        &self,
        quantity: &Quantity,
        inputs: &ComputeInputs<'_, T>,
        data: &mut Data<T>,
    ) -> Result<()> {
        let name = quantity.name;
        match *self {
            Kernel::Field(field, [dr, dt, dz]) => {
                let coeffs = param(inputs, field.arg(), name)?;
                let transform = inputs
                    .transforms
                    .get(&field)
                    .ok_or_else(|| Error::missing(field.transform_name(), name))?;
                put(data, name, transform.transform(coeffs, dr, dt, dz)?);
            }
            Kernel::Phi => {
                let phi = inputs.grid.nodes().iter().map(|n| constant::<T>(n[2])).collect();
                put(data, "phi", phi);
            }
            Kernel::Cartesian => {
                let r = fetch(data, "R", name)?;
                let phi = fetch(data, "phi", name)?;
                let x = r.iter().zip(phi).map(|(&r, &p)| r * p.cos()).collect();
                let y = r.iter().zip(phi).map(|(&r, &p)| r * p.sin()).collect();
                put(data, "X", x);
                put(data, "Y", y);
            }
            Kernel::ToroidalFlux => {
                let psi = param(inputs, Arg::Psi, name)?;
                let total = *psi
                    .first()
                    .ok_or_else(|| Error::dimension(format!("Psi for {name}"), 1, 0))?;
                let nodes = inputs.grid.nodes();
                let value = nodes
                    .iter()
                    .map(|n| total * constant::<T>(n[0] * n[0] / (2.0 * PI)))
                    .collect();
                let radial = nodes
                    .iter()
                    .map(|n| total * constant::<T>(n[0] / PI))
                    .collect();
                put(data, "psi", value);
                put(data, "psi_r", radial);
            }
            Kernel::Pressure => {
                let (p, p_r) = profile(inputs, ProfileKind::Pressure, name)?;
                put(data, "p", p);
                put(data, "p_r", p_r);
            }
            Kernel::RotationalTransform => {
                let (iota, iota_r) = profile(inputs, ProfileKind::Iota, name)?;
                put(data, "iota", iota);
                put(data, "iota_r", iota_r);
            }
            Kernel::CurrentProfile => {
                let (c, c_r) = profile(inputs, ProfileKind::Current, name)?;
                put(data, "c", c);
                put(data, "c_r", c_r);
            }
            Kernel::BasisVectors => {
                let r = fetch(data, "R", name)?;
                let (r_r, r_t, r_z) = (
                    fetch(data, "R_r", name)?,
                    fetch(data, "R_t", name)?,
                    fetch(data, "R_z", name)?,
                );
                let (z_r, z_t, z_z) = (
                    fetch(data, "Z_r", name)?,
                    fetch(data, "Z_t", name)?,
                    fetch(data, "Z_z", name)?,
                );
                let zero = T::zero();
                let mut e_rho = Vec::with_capacity(3 * r.len());
                let mut e_theta = Vec::with_capacity(3 * r.len());
                let mut e_zeta = Vec::with_capacity(3 * r.len());
                for i in 0..r.len() {
                    e_rho.extend([r_r[i], zero, z_r[i]]);
                    e_theta.extend([r_t[i], zero, z_t[i]]);
                    e_zeta.extend([r_z[i], r[i], z_z[i]]);
                }
                put(data, "e_rho", e_rho);
                put(data, "e_theta", e_theta);
                put(data, "e_zeta", e_zeta);
            }
            Kernel::Jacobian => {
                let e_rho = fetch(data, "e_rho", name)?;
                let e_theta = fetch(data, "e_theta", name)?;
                let e_zeta = fetch(data, "e_zeta", name)?;
                let sqrt_g = e_rho
                    .chunks_exact(3)
                    .zip(e_theta.chunks_exact(3))
                    .zip(e_zeta.chunks_exact(3))
                    .map(|((a, b), c)| {
                        let cross = [
                            b[1] * c[2] - b[2] * c[1],
                            b[2] * c[0] - b[0] * c[2],
                            b[0] * c[1] - b[1] * c[0],
                        ];
                        a[0] * cross[0] + a[1] * cross[1] + a[2] * cross[2]
                    })
                    .collect();
                put(data, "sqrt(g)", sqrt_g);
            }
            Kernel::ContravariantField => {
                let psi_r = fetch(data, "psi_r", name)?;
                let iota = fetch(data, "iota", name)?;
                let l_t = fetch(data, "lambda_t", name)?;
                let l_z = fetch(data, "lambda_z", name)?;
                let sqrt_g = fetch(data, "sqrt(g)", name)?;
                let mut b_theta = Vec::with_capacity(sqrt_g.len());
                let mut b_zeta = Vec::with_capacity(sqrt_g.len());
                for i in 0..sqrt_g.len() {
                    let scale = psi_r[i] / sqrt_g[i];
                    b_theta.push(scale * (iota[i] - l_z[i]));
                    b_zeta.push(scale * (T::one() + l_t[i]));
                }
                put(data, "B^theta", b_theta);
                put(data, "B^zeta", b_zeta);
            }
            Kernel::MagneticField => {
                let b_theta = fetch(data, "B^theta", name)?;
                let b_zeta = fetch(data, "B^zeta", name)?;
                let e_theta = fetch(data, "e_theta", name)?;
                let e_zeta = fetch(data, "e_zeta", name)?;
                let b: Vec<T> = e_theta
                    .chunks_exact(3)
                    .zip(e_zeta.chunks_exact(3))
                    .enumerate()
                    .flat_map(|(i, (et, ez))| {
                        (0..3).map(move |k| b_theta[i] * et[k] + b_zeta[i] * ez[k])
                    })
                    .collect();
                let mag2: Vec<T> = b
                    .chunks_exact(3)
                    .map(|v| v[0] * v[0] + v[1] * v[1] + v[2] * v[2])
                    .collect();
                let mag = mag2.iter().map(|v| v.sqrt()).collect();
                put(data, "B", b);
                put(data, "|B|^2", mag2);
                put(data, "|B|", mag);
            }
            Kernel::CovariantField => {
                let b = fetch(data, "B", name)?;
                let e_theta = fetch(data, "e_theta", name)?;
                let b_theta = b
                    .chunks_exact(3)
                    .zip(e_theta.chunks_exact(3))
                    .map(|(b, e)| b[0] * e[0] + b[1] * e[1] + b[2] * e[2])
                    .collect();
                put(data, "B_theta", b_theta);
            }
            Kernel::ToroidalCurrent => {
                let b_theta = fetch(data, "B_theta", name)?;
                let means = inputs.grid.surface_means(b_theta);
                let num_rho = inputs.grid.num_rho();
                let scale = constant::<T>(2.0 * PI / MU_0);
                let current = (0..b_theta.len())
                    .map(|i| scale * means[i % num_rho])
                    .collect();
                put(data, "current", current);
            }
            Kernel::Volume => {
                let sqrt_g = fetch(data, "sqrt(g)", name)?;
                let volume = weighted_sum(sqrt_g.iter().map(|g| g.abs()), inputs.grid.weights());
                put(data, "V", vec![volume]);
            }
            Kernel::Energy => {
                let mag2 = fetch(data, "|B|^2", name)?;
                let p = fetch(data, "p", name)?;
                let sqrt_g = fetch(data, "sqrt(g)", name)?;
                let weights = inputs.grid.weights();
                let two_mu0 = constant::<T>(2.0 * MU_0);
                let w_b = weighted_sum(
                    mag2.iter().zip(sqrt_g).map(|(&b2, g)| b2 / two_mu0 * g.abs()),
                    weights,
                );
                let w_p = -weighted_sum(p.iter().zip(sqrt_g).map(|(&p, g)| p * g.abs()), weights);
                put(data, "W", vec![w_b + w_p]);
                put(data, "W_B", vec![w_b]);
                put(data, "W_p", vec![w_p]);
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::super::fixtures::{build_for, circular_torus, with_current};
    use super::super::{compute, ComputeInputs};
    use super::*;
    use crate::autodiff::Dual;

    #[test]
    fn field_without_lambda_follows_rotational_transform() {
        let eq = circular_torus(4.0, 1.0);
        let built = build_for(&eq, &["|B|", "B^theta"]);
        let inputs = ComputeInputs {
            params: &built.params,
            transforms: &built.transforms,
            profiles: &built.profiles,
            grid: &built.grid,
        };
        let data = compute(&["|B|", "B^theta"], &inputs).expect("field");
        for (i, [rho, _, _]) in built.grid.nodes().iter().enumerate() {
            let iota = 0.4 + 0.2 * rho * rho;
            let ratio = data["B^theta"][i] / data["B^zeta"][i];
            assert!((ratio - iota).abs() < 1e-12);
            let b = &data["B"][3 * i..3 * i + 3];
            let norm = (b[0] * b[0] + b[1] * b[1] + b[2] * b[2]).sqrt();
            assert!((norm - data["|B|"][i]).abs() < 1e-12);
        }
    }

    #[test]
    fn enclosed_current_follows_amperes_law() {
        let eq = circular_torus(10.0, 1.0);
        let built = build_for(&eq, &["current"]);
        let inputs = ComputeInputs {
            params: &built.params,
            transforms: &built.transforms,
            profiles: &built.profiles,
            grid: &built.grid,
        };
        let data = compute(&["current"], &inputs).expect("current");
        // B_theta = Psi iota rho^2 / (pi R), and <1/R> = 1 / sqrt(R0^2 - (a rho)^2)
        for (i, [rho, _, _]) in built.grid.nodes().iter().enumerate() {
            let iota = 0.4 + 0.2 * rho * rho;
            let expected = 2.0 * iota * rho * rho / (MU_0 * (100.0 - rho * rho).sqrt());
            assert!((data["current"][i] - expected).abs() < 1e-8 * expected);
        }
    }

    #[test]
    fn current_profile_is_evaluated_on_the_grid() {
        let eq = with_current(10.0, 1.0, vec![1.0e5, 0.0, 3.0e5]);
        let built = build_for(&eq, &["c"]);
        let inputs = ComputeInputs {
            params: &built.params,
            transforms: &built.transforms,
            profiles: &built.profiles,
            grid: &built.grid,
        };
        let data = compute(&["c"], &inputs).expect("current profile");
        for (i, [rho, _, _]) in built.grid.nodes().iter().enumerate() {
            assert!((data["c"][i] - (1.0e5 + 3.0e5 * rho * rho)).abs() < 1e-8);
            assert!((data["c_r"][i] - 6.0e5 * rho).abs() < 1e-8);
        }
    }

    #[test]
    fn energy_splits_into_magnetic_and_thermal_parts() {
        let eq = circular_torus(4.0, 1.0);
        let built = build_for(&eq, &["W"]);
        let inputs = ComputeInputs {
            params: &built.params,
            transforms: &built.transforms,
            profiles: &built.profiles,
            grid: &built.grid,
        };
        let data = compute(&["W"], &inputs).expect("energy");
        assert!(data["W_B"][0] > 0.0);
        assert!(data["W_p"][0] < 0.0);
        assert!((data["W"][0] - data["W_B"][0] - data["W_p"][0]).abs() < 1e-9);
    }

    #[test]
    fn volume_derivative_flows_through_dual_numbers() {
        let eq = circular_torus(10.0, 1.0);
        let built = build_for(&eq, &["V"]);
        let index = eq.r_basis().index_of([0, 0, 0]).expect("mode");
        let params = built
            .params
            .iter()
            .map(|(&arg, values)| {
                let lifted = values
                    .iter()
                    .enumerate()
                    .map(|(i, &v)| {
                        let seed = if arg == Arg::RLmn && i == index { 1.0 } else { 0.0 };
                        Dual::new(v, seed)
                    })
                    .collect();
                (arg, lifted)
            })
            .collect();
        let inputs = ComputeInputs {
            params: &params,
            transforms: &built.transforms,
            profiles: &built.profiles,
            grid: &built.grid,
        };
        let data = compute(&["V"], &inputs).expect("volume");
        // dV/dR0 = 2 pi^2 a^2
        assert!((data["V"][0].eps - 2.0 * PI * PI).abs() < 1e-9);
    }
}
