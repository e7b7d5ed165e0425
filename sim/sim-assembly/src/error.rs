//! Error types for assembly.

use sim_constraint::ConstraintError;
use thiserror::Error;

/// Errors that can occur during an assembly call.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum AssemblyError {
    /// The velocity step length is not positive and finite.
    #[error("invalid assembly timestep: {dt} (must be positive and finite)")]
    InvalidTimestep {
        /// The offending step length.
        dt: f64,
    },

    /// The mechanism returned a vector of the wrong length.
    #[error("dimension mismatch for {what}: expected {expected}, got {actual}")]
    DimensionMismatch {
        /// Which vector was wrong.
        what: &'static str,
        /// Length announced by the mechanism.
        expected: usize,
        /// Length actually produced.
        actual: usize,
    },

    /// A solve produced a non-finite state.
    #[error("{pass} pass diverged (non-finite state after iteration {iteration})")]
    Diverged {
        /// Pass that diverged.
        pass: &'static str,
        /// Iteration (1-based) of the failing solve.
        iteration: usize,
    },

    /// Error from the constraint layer.
    #[error("constraint error: {0}")]
    Constraint(#[from] ConstraintError),
}

impl AssemblyError {
    /// Create a dimension mismatch error.
    #[must_use]
    pub fn dimension_mismatch(what: &'static str, expected: usize, actual: usize) -> Self {
        Self::DimensionMismatch {
            what,
            expected,
            actual,
        }
    }

    /// Check if the mechanism (rather than the numerics) is at fault.
    #[must_use]
    pub fn is_contract_violation(&self) -> bool {
        matches!(self, Self::DimensionMismatch { .. })
    }
}

/// Result type for assembly operations.
pub type AssemblyResult<T> = std::result::Result<T, AssemblyError>;
