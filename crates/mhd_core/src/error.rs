use thiserror::Error;

/// Failures raised by the compute, derivative and objective layers.
///
/// Every variant names the quantity, argument or objective that triggered it.
#[derive(Debug, Error)]
pub enum Error {
    #[error("invalid configuration for {context}: {reason}")]
    InvalidConfiguration { context: String, reason: String },

    #[error("{name} must be built before calling {operation}")]
    NotBuilt { name: String, operation: String },

    #[error("dimension mismatch in {context}: expected {expected}, got {got}")]
    InvalidDimension {
        context: String,
        expected: String,
        got: usize,
    },

    #[error("missing input {dependency} required by {quantity}")]
    MissingInput { dependency: String, quantity: String },

    #[error("constraint {name} is nonlinear; only linear constraints can be eliminated")]
    UnsupportedConstraint { name: String },

    #[error("numerical failure in {context}: {reason}")]
    Numerical { context: String, reason: String },

    #[error("{solver} failed to converge in {steps} steps (|f| = {residual:e})")]
    NotConverged {
        solver: String,
        steps: usize,
        residual: f64,
    },
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    pub fn invalid_config(context: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidConfiguration {
            context: context.into(),
            reason: reason.into(),
        }
    }

    pub fn not_built(name: impl Into<String>, operation: impl Into<String>) -> Self {
        Self::NotBuilt {
            name: name.into(),
            operation: operation.into(),
        }
    }

    pub fn dimension(context: impl Into<String>, expected: impl ToString, got: usize) -> Self {
        Self::InvalidDimension {
            context: context.into(),
            expected: expected.to_string(),
            got,
        }
    }

    pub fn missing(dependency: impl Into<String>, quantity: impl Into<String>) -> Self {
        Self::MissingInput {
            dependency: dependency.into(),
            quantity: quantity.into(),
        }
    }

    pub fn numerical(context: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Numerical {
            context: context.into(),
            reason: reason.into(),
        }
    }
}
