//! Failure taxonomy for the moment-constrained GW pipeline.

use std::error::Error;
use std::fmt;

/// Errors raised by the core moment-construction machinery.
///
/// All variants are fatal: they indicate either an unsupported problem class
/// or numerical corruption upstream. Non-convergence of the iterative loops
/// is deliberately *not* represented here; it is reported through boolean
/// flags on the driver results.
#[derive(Debug, Clone)]
pub enum McGwError {
    /// The density-fitting provider reported an integral block shape the
    /// transform cannot handle, e.g. a low-dimensional (non-3D-periodic)
    /// block.
    UnsupportedIntegral(String),

    /// A constructed quantity violated a hard invariant, e.g. a self-energy
    /// moment that fails its Hermiticity check.
    InvariantViolation(String),

    /// A requested momentum vector does not resolve to a mesh member within
    /// the numerical tolerance. This signals a momentum-conservation bug in
    /// the caller.
    Lookup(String),
}

impl McGwError {
    /// The error returned when the exact-diagonalisation construction of the
    /// density-density response moments is requested. The recursive
    /// construction is the only supported path.
    pub fn unimplemented_exact_dd() -> Self {
        Self::UnsupportedIntegral(
            "exact-diagonalisation density-density moments are not implemented".to_string(),
        )
    }
}

impl fmt::Display for McGwError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::UnsupportedIntegral(msg) => write!(f, "Unsupported integral error: {msg}."),
            Self::InvariantViolation(msg) => write!(f, "Invariant violation error: {msg}."),
            Self::Lookup(msg) => write!(f, "Lookup error: {msg}."),
        }
    }
}

impl Error for McGwError {}
