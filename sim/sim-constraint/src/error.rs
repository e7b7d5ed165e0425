//! Error types for constraint bookkeeping.

use thiserror::Error;

use crate::BlockKind;

/// Errors that can occur while binding, refreshing or solving constraints.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum ConstraintError {
    /// A bound block handle points at no block.
    #[error("block slot {slot} is null (no block with id {id})")]
    NullBlock {
        /// Constraint slot (0 = a, 1 = b, 2 = c).
        slot: usize,
        /// The dangling block id.
        id: usize,
    },

    /// A block of the wrong kind or size was bound to a slot.
    #[error("block slot {slot} expects a {expected} block, got {actual:?} with {dof} DOF")]
    IncompatibleBlockType {
        /// Constraint slot (0 = a, 1 = b, 2 = c).
        slot: usize,
        /// What the slot requires.
        expected: &'static str,
        /// Kind of the block that was offered.
        actual: BlockKind,
        /// Degrees of freedom of the block that was offered.
        dof: usize,
    },

    /// Mass or inertia is not positive and finite.
    #[error("invalid mass properties: {reason}")]
    InvalidMass {
        /// Description of what's wrong.
        reason: String,
    },

    /// Jacobian slot index or row length does not fit the constraint.
    #[error("invalid Jacobian slot {slot}: expected {expected} entries, got {actual}")]
    InvalidSlot {
        /// The slot that was addressed.
        slot: usize,
        /// Number of entries the slot holds.
        expected: usize,
        /// Number of entries supplied.
        actual: usize,
    },

    /// The effective-mass cache was used after a Jacobian, binding or mass change.
    #[error("auxiliary data is stale; call update_auxiliary first")]
    StaleAuxiliary,

    /// The KKT system could not be factorized.
    #[error("singular constraint system ({rows} rows)")]
    SingularSystem {
        /// Number of active constraint rows.
        rows: usize,
    },

    /// A vector handed to the descriptor has the wrong length.
    #[error("dimension mismatch for {what}: expected {expected}, got {actual}")]
    DimensionMismatch {
        /// Which vector was wrong.
        what: &'static str,
        /// Expected length.
        expected: usize,
        /// Actual length.
        actual: usize,
    },

    /// Invalid solver configuration.
    #[error("invalid configuration: {reason}")]
    InvalidConfig {
        /// Description of the configuration error.
        reason: String,
    },

    /// A persisted constraint could not be restored.
    #[error("unsupported constraint archive: {reason}")]
    UnsupportedArchive {
        /// Description of the mismatch.
        reason: String,
    },
}

impl ConstraintError {
    /// Create an invalid mass error.
    #[must_use]
    pub fn invalid_mass(reason: impl Into<String>) -> Self {
        Self::InvalidMass {
            reason: reason.into(),
        }
    }

    /// Create an invalid configuration error.
    #[must_use]
    pub fn invalid_config(reason: impl Into<String>) -> Self {
        Self::InvalidConfig {
            reason: reason.into(),
        }
    }

    /// Create an unsupported archive error.
    #[must_use]
    pub fn unsupported_archive(reason: impl Into<String>) -> Self {
        Self::UnsupportedArchive {
            reason: reason.into(),
        }
    }

    /// Check if this is a binding error (null or incompatible block).
    #[must_use]
    pub fn is_binding_error(&self) -> bool {
        matches!(
            self,
            Self::NullBlock { .. } | Self::IncompatibleBlockType { .. }
        )
    }
}

/// Result type for constraint operations.
pub type ConstraintResult<T> = std::result::Result<T, ConstraintError>;
