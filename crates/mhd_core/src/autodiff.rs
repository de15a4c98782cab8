//! Scalar types for automatic differentiation.
//!
//! All three types implement [`num_traits::Float`], so every compute kernel is
//! written once against [`crate::traits::Scalar`] and can be evaluated at
//! plain values, forward duals, hyper-duals or tape variables.

/// Chain-rule hook shared by the AD scalars.
///
/// `chain(value, df, d2f)` returns `f(self)` given `f(v)`, `f'(v)` and `f''(v)`
/// at the primal value `v`.
pub(crate) trait ChainRule: Copy {
    fn primal(self) -> f64;
    fn from_primal(value: f64) -> Self;
    fn chain(self, value: f64, df: f64, d2f: f64) -> Self;
    fn is_constant(self) -> bool;
}

// Everything except the four arithmetic operators is derived from `ChainRule`.
// Callers must have `ChainRule` and `num_traits::Float` in scope.
macro_rules! impl_float_via_chain {
    ($t:ty) => {
        impl PartialEq for $t {
            fn eq(&self, other: &Self) -> bool {
                self.primal() == other.primal()
            }
        }

        impl PartialOrd for $t {
            fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
                self.primal().partial_cmp(&other.primal())
            }
        }

        impl num_traits::Zero for $t {
            fn zero() -> Self {
                Self::from_primal(0.0)
            }
            fn is_zero(&self) -> bool {
                self.primal() == 0.0 && self.is_constant()
            }
        }

        impl num_traits::One for $t {
            fn one() -> Self {
                Self::from_primal(1.0)
            }
        }

        impl std::ops::Neg for $t {
            type Output = Self;
            fn neg(self) -> Self {
                self.chain(-self.primal(), -1.0, 0.0)
            }
        }

        impl std::ops::Rem for $t {
            type Output = Self;
            fn rem(self, rhs: Self) -> Self {
                self.chain(self.primal() % rhs.primal(), 1.0, 0.0)
            }
        }

        impl std::ops::AddAssign for $t {
            fn add_assign(&mut self, rhs: Self) {
                *self = *self + rhs;
            }
        }
        impl std::ops::SubAssign for $t {
            fn sub_assign(&mut self, rhs: Self) {
                *self = *self - rhs;
            }
        }
        impl std::ops::MulAssign for $t {
            fn mul_assign(&mut self, rhs: Self) {
                *self = *self * rhs;
            }
        }
        impl std::ops::DivAssign for $t {
            fn div_assign(&mut self, rhs: Self) {
                *self = *self / rhs;
            }
        }
        impl std::ops::RemAssign for $t {
            fn rem_assign(&mut self, rhs: Self) {
                *self = *self % rhs;
            }
        }

        impl num_traits::Num for $t {
            type FromStrRadixErr = ();
            fn from_str_radix(str: &str, radix: u32) -> Result<Self, Self::FromStrRadixErr> {
                <f64 as num_traits::Num>::from_str_radix(str, radix)
                    .map(Self::from_primal)
                    .map_err(|_| ())
            }
        }

        impl num_traits::ToPrimitive for $t {
            fn to_i64(&self) -> Option<i64> {
                num_traits::ToPrimitive::to_i64(&self.primal())
            }
            fn to_u64(&self) -> Option<u64> {
                num_traits::ToPrimitive::to_u64(&self.primal())
            }
            fn to_f64(&self) -> Option<f64> {
                Some(self.primal())
            }
        }

        impl num_traits::FromPrimitive for $t {
            fn from_i64(n: i64) -> Option<Self> {
                Some(Self::from_primal(n as f64))
            }
            fn from_u64(n: u64) -> Option<Self> {
                Some(Self::from_primal(n as f64))
            }
            fn from_f64(n: f64) -> Option<Self> {
                Some(Self::from_primal(n))
            }
        }

        impl num_traits::NumCast for $t {
            fn from<N: num_traits::ToPrimitive>(n: N) -> Option<Self> {
                num_traits::ToPrimitive::to_f64(&n).map(Self::from_primal)
            }
        }

        impl num_traits::Float for $t {
            fn nan() -> Self {
                Self::from_primal(f64::NAN)
            }
            fn infinity() -> Self {
                Self::from_primal(f64::INFINITY)
            }
            fn neg_infinity() -> Self {
                Self::from_primal(f64::NEG_INFINITY)
            }
            fn neg_zero() -> Self {
                Self::from_primal(-0.0)
            }
            fn min_value() -> Self {
                Self::from_primal(f64::MIN)
            }
            fn min_positive_value() -> Self {
                Self::from_primal(f64::MIN_POSITIVE)
            }
            fn max_value() -> Self {
                Self::from_primal(f64::MAX)
            }
            fn is_nan(self) -> bool {
                self.primal().is_nan()
            }
            fn is_infinite(self) -> bool {
                self.primal().is_infinite()
            }
            fn is_finite(self) -> bool {
                self.primal().is_finite()
            }
            fn is_normal(self) -> bool {
                self.primal().is_normal()
            }
            fn classify(self) -> std::num::FpCategory {
                self.primal().classify()
            }
            fn floor(self) -> Self {
                self.chain(self.primal().floor(), 0.0, 0.0)
            }
            fn ceil(self) -> Self {
                self.chain(self.primal().ceil(), 0.0, 0.0)
            }
            fn round(self) -> Self {
                self.chain(self.primal().round(), 0.0, 0.0)
            }
            fn trunc(self) -> Self {
                self.chain(self.primal().trunc(), 0.0, 0.0)
            }
            fn fract(self) -> Self {
                self.chain(self.primal().fract(), 1.0, 0.0)
            }
            fn abs(self) -> Self {
                let v = self.primal();
                self.chain(v.abs(), if v >= 0.0 { 1.0 } else { -1.0 }, 0.0)
            }
            fn signum(self) -> Self {
                self.chain(self.primal().signum(), 0.0, 0.0)
            }
            fn is_sign_positive(self) -> bool {
                self.primal().is_sign_positive()
            }
            fn is_sign_negative(self) -> bool {
                self.primal().is_sign_negative()
            }
            fn mul_add(self, a: Self, b: Self) -> Self {
                self * a + b
            }
            fn recip(self) -> Self {
                let v = self.primal();
                self.chain(1.0 / v, -1.0 / (v * v), 2.0 / (v * v * v))
            }
            fn powi(self, n: i32) -> Self {
                let v = self.primal();
                let c = n as f64;
                let d1 = if n == 0 { 0.0 } else { c * v.powi(n - 1) };
                let d2 = if n == 0 || n == 1 {
                    0.0
                } else {
                    c * (c - 1.0) * v.powi(n - 2)
                };
                self.chain(v.powi(n), d1, d2)
            }
            fn powf(self, n: Self) -> Self {
                if n.is_constant() {
                    let v = self.primal();
                    let c = n.primal();
                    let d1 = if c == 0.0 { 0.0 } else { c * v.powf(c - 1.0) };
                    let d2 = if c == 0.0 || c == 1.0 {
                        0.0
                    } else {
                        c * (c - 1.0) * v.powf(c - 2.0)
                    };
                    self.chain(v.powf(c), d1, d2)
                } else {
                    (n * self.ln()).exp()
                }
            }
            fn sqrt(self) -> Self {
                let v = self.primal();
                let s = v.sqrt();
                self.chain(s, 0.5 / s, -0.25 / (v * s))
            }
            fn exp(self) -> Self {
                let e = self.primal().exp();
                self.chain(e, e, e)
            }
            fn exp2(self) -> Self {
                let e = self.primal().exp2();
                let ln2 = std::f64::consts::LN_2;
                self.chain(e, ln2 * e, ln2 * ln2 * e)
            }
            fn ln(self) -> Self {
                let v = self.primal();
                self.chain(v.ln(), 1.0 / v, -1.0 / (v * v))
            }
            fn log(self, base: Self) -> Self {
                self.ln() / base.ln()
            }
            fn log2(self) -> Self {
                let v = self.primal();
                let k = std::f64::consts::LN_2;
                self.chain(v.log2(), 1.0 / (v * k), -1.0 / (v * v * k))
            }
            fn log10(self) -> Self {
                let v = self.primal();
                let k = std::f64::consts::LN_10;
                self.chain(v.log10(), 1.0 / (v * k), -1.0 / (v * v * k))
            }
            fn max(self, other: Self) -> Self {
                if self.primal() > other.primal() {
                    self
                } else {
                    other
                }
            }
            fn min(self, other: Self) -> Self {
                if self.primal() < other.primal() {
                    self
                } else {
                    other
                }
            }
            fn abs_sub(self, other: Self) -> Self {
                if self.primal() > other.primal() {
                    self - other
                } else {
                    Self::from_primal(0.0)
                }
            }
            fn cbrt(self) -> Self {
                let c = self.primal().cbrt();
                self.chain(c, 1.0 / (3.0 * c * c), -2.0 / (9.0 * c.powi(5)))
            }
            fn hypot(self, other: Self) -> Self {
                (self * self + other * other).sqrt()
            }
            fn sin(self) -> Self {
                let (s, c) = self.primal().sin_cos();
                self.chain(s, c, -s)
            }
            fn cos(self) -> Self {
                let (s, c) = self.primal().sin_cos();
                self.chain(c, -s, -c)
            }
            fn tan(self) -> Self {
                let t = self.primal().tan();
                let d = 1.0 + t * t;
                self.chain(t, d, 2.0 * t * d)
            }
            fn asin(self) -> Self {
                let v = self.primal();
                let q = 1.0 - v * v;
                self.chain(v.asin(), 1.0 / q.sqrt(), v / (q * q.sqrt()))
            }
            fn acos(self) -> Self {
                let v = self.primal();
                let q = 1.0 - v * v;
                self.chain(v.acos(), -1.0 / q.sqrt(), -v / (q * q.sqrt()))
            }
            fn atan(self) -> Self {
                let v = self.primal();
                let q = 1.0 + v * v;
                self.chain(v.atan(), 1.0 / q, -2.0 * v / (q * q))
            }
            fn atan2(self, other: Self) -> Self {
                let (y, x) = (self.primal(), other.primal());
                let angle = y.atan2(x);
                // Pick the better-conditioned quotient, then shift onto the right branch.
                let base = if x.abs() >= y.abs() {
                    (self / other).atan()
                } else {
                    -(other / self).atan()
                };
                let offset = angle - base.primal();
                base + Self::from_primal(offset)
            }
            fn sin_cos(self) -> (Self, Self) {
                (self.sin(), self.cos())
            }
            fn exp_m1(self) -> Self {
                let v = self.primal();
                let e = v.exp();
                self.chain(v.exp_m1(), e, e)
            }
            fn ln_1p(self) -> Self {
                let v = self.primal();
                let q = 1.0 + v;
                self.chain(v.ln_1p(), 1.0 / q, -1.0 / (q * q))
            }
            fn sinh(self) -> Self {
                let v = self.primal();
                self.chain(v.sinh(), v.cosh(), v.sinh())
            }
            fn cosh(self) -> Self {
                let v = self.primal();
                self.chain(v.cosh(), v.sinh(), v.cosh())
            }
            fn tanh(self) -> Self {
                let t = self.primal().tanh();
                let d = 1.0 - t * t;
                self.chain(t, d, -2.0 * t * d)
            }
            fn asinh(self) -> Self {
                let v = self.primal();
                let q = v * v + 1.0;
                self.chain(v.asinh(), 1.0 / q.sqrt(), -v / (q * q.sqrt()))
            }
            fn acosh(self) -> Self {
                let v = self.primal();
                let q = v * v - 1.0;
                self.chain(v.acosh(), 1.0 / q.sqrt(), -v / (q * q.sqrt()))
            }
            fn atanh(self) -> Self {
                let v = self.primal();
                let q = 1.0 - v * v;
                self.chain(v.atanh(), 1.0 / q, 2.0 * v / (q * q))
            }
            fn integer_decode(self) -> (u64, i16, i8) {
                num_traits::Float::integer_decode(self.primal())
            }
        }
    };
}

mod dual;
mod hyper_dual;
mod reverse;

pub use dual::Dual;
pub use hyper_dual::HyperDual;
pub use reverse::{Reverse, Tape};

#[cfg(test)]
mod tests {
    use super::*;
    use num_traits::Float;

    fn forward<F: Fn(Dual) -> Dual>(f: F, x: f64) -> f64 {
        f(Dual::new(x, 1.0)).eps
    }

    fn second<F: Fn(HyperDual) -> HyperDual>(f: F, x: f64) -> f64 {
        f(HyperDual::new(x, 1.0, 1.0, 0.0)).e12
    }

    fn reverse<F: Fn(Reverse) -> Reverse>(f: F, x: f64) -> f64 {
        let (out, tape) = Tape::record(&[x], |vars| f(vars[0]));
        tape.gradient(out)[0]
    }

    #[test]
    fn elementary_functions_agree_across_modes() {
        let x = 0.4;
        let cases: Vec<(f64, f64)> = vec![
            (forward(|v| v.sin() * v.exp(), x), x.sin() * x.exp() + x.cos() * x.exp()),
            (forward(|v| v.sqrt(), x), 0.5 / x.sqrt()),
            (forward(|v| v.atan(), x), 1.0 / (1.0 + x * x)),
            (forward(|v| v.tanh(), x), 1.0 - x.tanh().powi(2)),
            (forward(|v| v.powi(3), x), 3.0 * x * x),
            (reverse(|v| v.sin() * v.exp(), x), x.sin() * x.exp() + x.cos() * x.exp()),
            (reverse(|v| v.ln() / v, x), (1.0 - x.ln()) / (x * x)),
            (reverse(|v| v.asin(), x), 1.0 / (1.0 - x * x).sqrt()),
        ];
        for (got, expected) in cases {
            assert!((got - expected).abs() < 1e-12, "{got} vs {expected}");
        }
    }

    #[test]
    fn hyper_dual_second_derivatives_are_exact() {
        let x = 0.7;
        let cases: Vec<(f64, f64)> = vec![
            (second(|v| v * v * v, x), 6.0 * x),
            (second(|v| v.sin(), x), -x.sin()),
            (second(|v| v.exp() / v, x), x.exp() * (x * x - 2.0 * x + 2.0) / x.powi(3)),
            (second(|v| v.sqrt(), x), -0.25 * x.powf(-1.5)),
            (second(|v| v.powf(HyperDual::new(2.5, 0.0, 0.0, 0.0)), x), 3.75 * x.sqrt()),
        ];
        for (got, expected) in cases {
            assert!((got - expected).abs() < 1e-10, "{got} vs {expected}");
        }
    }

    #[test]
    fn atan2_matches_quadrant_and_derivative() {
        for &(y, x) in &[(1.0, 2.0), (2.0, -0.5), (-1.5, -1.0), (-0.2, 3.0)] {
            let value = Dual::new(y, 0.0).atan2(Dual::new(x, 1.0));
            assert!((value.val - f64::atan2(y, x)).abs() < 1e-14);
            assert!((value.eps - (-y / (x * x + y * y))).abs() < 1e-12);
        }
    }

    #[test]
    fn powf_with_variable_exponent() {
        let base = Dual::new(2.0, 0.0);
        let out = base.powf(Dual::new(3.0, 1.0));
        assert!((out.val - 8.0).abs() < 1e-12);
        assert!((out.eps - 8.0 * 2.0_f64.ln()).abs() < 1e-12);
    }
}
