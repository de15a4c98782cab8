//! Tape-recorded scalar for reverse-mode AD.
//!
//! Each operation on a [`Reverse`] variable pushes one node holding the local
//! partial derivatives w.r.t. its (at most two) operands onto the thread-local
//! active tape. The reverse sweep is a single multiply-accumulate pass.

use super::ChainRule;
use num_traits::Float;
use std::cell::RefCell;
use std::ops::{Add, Div, Mul, Sub};

/// Sentinel index for values that were never recorded (constants).
const CONSTANT: usize = usize::MAX;

#[derive(Debug, Clone, Copy)]
struct Node {
    parents: [(usize, f64); 2],
}

impl Node {
    const LEAF: Node = Node {
        parents: [(CONSTANT, 0.0), (CONSTANT, 0.0)],
    };
}

/// A finished recording: operation nodes plus the number of leading input nodes.
#[derive(Debug, Clone, Default)]
pub struct Tape {
    nodes: Vec<Node>,
    num_inputs: usize,
}

thread_local! {
    static ACTIVE: RefCell<Option<Tape>> = const { RefCell::new(None) };
}

/// Restores whatever tape was active before a recording, even on unwind.
struct ActiveScope {
    previous: Option<Option<Tape>>,
}

impl Drop for ActiveScope {
    fn drop(&mut self) {
        if let Some(previous) = self.previous.take() {
            ACTIVE.with(|slot| *slot.borrow_mut() = previous);
        }
    }
}

impl Tape {
    fn with_inputs(num_inputs: usize) -> Self {
        Self {
            nodes: vec![Node::LEAF; num_inputs],
            num_inputs,
        }
    }

    /// Records `f` evaluated at fresh variables seeded with `inputs`.
    ///
    /// Variables returned by `f` are only meaningful together with the
    /// returned tape; they must not be combined with values from another
    /// recording.
    pub fn record<R>(inputs: &[f64], f: impl FnOnce(&[Reverse]) -> R) -> (R, Tape) {
        let fresh = Tape::with_inputs(inputs.len());
        let previous = ACTIVE.with(|slot| slot.replace(Some(fresh)));
        let mut scope = ActiveScope {
            previous: Some(previous),
        };

        let variables: Vec<Reverse> = inputs
            .iter()
            .enumerate()
            .map(|(index, &value)| Reverse { value, index })
            .collect();
        let result = f(&variables);

        let restored = scope.previous.take().unwrap_or_default();
        let tape = ACTIVE
            .with(|slot| slot.replace(restored))
            .unwrap_or_else(|| Tape::with_inputs(inputs.len()));
        (result, tape)
    }

    pub fn num_inputs(&self) -> usize {
        self.num_inputs
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Adjoints of the recorded inputs for a single output.
    pub fn gradient(&self, output: Reverse) -> Vec<f64> {
        let mut adjoints = vec![0.0; self.nodes.len()];
        if output.index == CONSTANT || output.index >= self.nodes.len() {
            adjoints.truncate(self.num_inputs);
            return adjoints;
        }
        adjoints[output.index] = 1.0;
        for i in (0..=output.index).rev() {
            let adjoint = adjoints[i];
            if adjoint == 0.0 {
                continue;
            }
            for &(parent, partial) in &self.nodes[i].parents {
                if parent != CONSTANT {
                    adjoints[parent] += adjoint * partial;
                }
            }
        }
        adjoints.truncate(self.num_inputs);
        adjoints
    }

    fn push(&mut self, node: Node) -> usize {
        self.nodes.push(node);
        self.nodes.len() - 1
    }
}

/// Reverse-mode scalar: a primal value plus its node index on the active tape.
#[derive(Debug, Clone, Copy)]
pub struct Reverse {
    pub value: f64,
    index: usize,
}

impl Reverse {
    pub fn constant(value: f64) -> Self {
        Self {
            value,
            index: CONSTANT,
        }
    }

    fn record(value: f64, parents: [(usize, f64); 2]) -> Self {
        if parents.iter().all(|(index, _)| *index == CONSTANT) {
            return Self::constant(value);
        }
        let index = ACTIVE.with(|slot| {
            slot.borrow_mut()
                .as_mut()
                .map_or(CONSTANT, |tape| tape.push(Node { parents }))
        });
        Self { value, index }
    }

    fn binary(value: f64, lhs: Self, d_lhs: f64, rhs: Self, d_rhs: f64) -> Self {
        Self::record(value, [(lhs.index, d_lhs), (rhs.index, d_rhs)])
    }
}

impl ChainRule for Reverse {
    #[inline]
    fn primal(self) -> f64 {
        self.value
    }
    #[inline]
    fn from_primal(value: f64) -> Self {
        Self::constant(value)
    }
    #[inline]
    fn chain(self, value: f64, df: f64, _d2f: f64) -> Self {
        Self::record(value, [(self.index, df), (CONSTANT, 0.0)])
    }
    #[inline]
    fn is_constant(self) -> bool {
        self.index == CONSTANT
    }
}

impl Add for Reverse {
    type Output = Self;
    fn add(self, rhs: Self) -> Self {
        Self::binary(self.value + rhs.value, self, 1.0, rhs, 1.0)
    }
}

impl Sub for Reverse {
    type Output = Self;
    fn sub(self, rhs: Self) -> Self {
        Self::binary(self.value - rhs.value, self, 1.0, rhs, -1.0)
    }
}

impl Mul for Reverse {
    type Output = Self;
    fn mul(self, rhs: Self) -> Self {
        Self::binary(self.value * rhs.value, self, rhs.value, rhs, self.value)
    }
}

impl Div for Reverse {
    type Output = Self;
    fn div(self, rhs: Self) -> Self {
        let inv = 1.0 / rhs.value;
        Self::binary(
            self.value * inv,
            self,
            inv,
            rhs,
            -self.value * inv * inv,
        )
    }
}

impl_float_via_chain!(Reverse);
