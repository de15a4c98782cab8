use super::ChainRule;
use num_traits::Float;
use std::ops::{Add, Div, Mul, Sub};

/// Hyper-dual number `val + e1·ε₁ + e2·ε₂ + e12·ε₁ε₂` with `ε₁² = ε₂² = 0`.
///
/// Seeding `e1` along direction `i` and `e2` along direction `j` leaves the
/// exact mixed second derivative `∂²f/∂xᵢ∂xⱼ` in `e12`, with no truncation error.
#[derive(Debug, Clone, Copy)]
pub struct HyperDual {
    pub val: f64,
    pub e1: f64,
    pub e2: f64,
    pub e12: f64,
}

impl HyperDual {
    pub fn new(val: f64, e1: f64, e2: f64, e12: f64) -> Self {
        Self { val, e1, e2, e12 }
    }

    pub fn constant(val: f64) -> Self {
        Self::new(val, 0.0, 0.0, 0.0)
    }
}

impl ChainRule for HyperDual {
    #[inline]
    fn primal(self) -> f64 {
        self.val
    }
    #[inline]
    fn from_primal(value: f64) -> Self {
        Self::constant(value)
    }
    #[inline]
    fn chain(self, value: f64, df: f64, d2f: f64) -> Self {
        Self::new(
            value,
            df * self.e1,
            df * self.e2,
            df * self.e12 + d2f * self.e1 * self.e2,
        )
    }
    #[inline]
    fn is_constant(self) -> bool {
        self.e1 == 0.0 && self.e2 == 0.0 && self.e12 == 0.0
    }
}

impl Add for HyperDual {
    type Output = Self;
    fn add(self, rhs: Self) -> Self {
        Self::new(
            self.val + rhs.val,
            self.e1 + rhs.e1,
            self.e2 + rhs.e2,
            self.e12 + rhs.e12,
        )
    }
}

impl Sub for HyperDual {
    type Output = Self;
    fn sub(self, rhs: Self) -> Self {
        Self::new(
            self.val - rhs.val,
            self.e1 - rhs.e1,
            self.e2 - rhs.e2,
            self.e12 - rhs.e12,
        )
    }
}

impl Mul for HyperDual {
    type Output = Self;
    fn mul(self, rhs: Self) -> Self {
        Self::new(
            self.val * rhs.val,
            self.val * rhs.e1 + self.e1 * rhs.val,
            self.val * rhs.e2 + self.e2 * rhs.val,
            self.val * rhs.e12 + self.e1 * rhs.e2 + self.e2 * rhs.e1 + self.e12 * rhs.val,
        )
    }
}

impl Div for HyperDual {
    type Output = Self;
    #[allow(clippy::suspicious_arithmetic_impl)]
    fn div(self, rhs: Self) -> Self {
        self * rhs.recip()
    }
}

impl_float_via_chain!(HyperDual);
