//! The `mhd_core` crate evaluates and differentiates toroidal MHD equilibria.
//!
//! Key components:
//! - **Compute**: a registry of physics quantities resolved into an ordered plan
//!   and evaluated on a collocation grid from spectral coefficients.
//! - **Derivatives**: forward, reverse and hyper-dual AD, finite differences,
//!   plus SPSA, Broyden and row-blocked Jacobian estimators.
//! - **Objectives**: residual objectives, linear constraints, and the
//!   `ObjectiveFunction` that eliminates those constraints through an SVD null space.
//! - **Solve**: a Gauss-Newton driver over the reduced variables.
pub mod autodiff;
pub mod basis;
pub mod compute;
pub mod derivatives;
pub mod equilibrium;
pub mod error;
pub mod grid;
pub mod objectives;
pub mod profiles;
pub mod solve;
pub mod traits;
pub mod transform;

pub use error::{Error, Result};
