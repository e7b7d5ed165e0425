//! The constraint contract shared by every constraint variant.
//!
//! A constraint is one scalar row `Cq · v` coupling a few state blocks. Each
//! variant stores one Jacobian segment per bound block and a derived
//! effective-mass term
//!
//! ```text
//! g = Σ_active Cq_i · M_i⁻¹ · Cq_iᵀ + cfm
//! ```
//!
//! which iterative solvers use as the diagonal of `J M⁻¹ Jᵀ`.
//!
//! Invalid constraints (unbound, or bound to a block that no longer exists)
//! are neutral elements: every operation is a no-op or contributes zero.

use std::fmt;

use nalgebra::DVector;

use crate::{BlockId, BlockSet, ConstraintResult, SparseSink};

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

/// Handle to a constraint stored in a [`SystemDescriptor`](crate::SystemDescriptor).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct ConstraintId(pub usize);

impl ConstraintId {
    /// Create a new constraint ID.
    #[must_use]
    pub const fn new(id: usize) -> Self {
        Self(id)
    }

    /// Get the raw index.
    #[must_use]
    pub const fn raw(self) -> usize {
        self.0
    }
}

impl fmt::Display for ConstraintId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Constraint({})", self.0)
    }
}

/// Concrete constraint variant, used as the persisted type tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum ConstraintKind {
    /// Two rigid bodies and one shaft.
    ThreeBodyShaft,
}

impl fmt::Display for ConstraintKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ThreeBodyShaft => write!(f, "ThreeBodyShaft"),
        }
    }
}

/// Scalar data common to every constraint.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct ConstraintCore {
    /// Constraint force mixing, added to the effective mass.
    pub cfm: f64,
    /// Effective mass from the last `update_auxiliary`.
    pub g: f64,
    /// Lagrange multiplier written by the last solve.
    pub multiplier: f64,
    /// Known term of the row (`b` in `Cq · v + b + cfm · l = 0`).
    pub rhs: f64,
    /// True only while every bound block exists and is type-compatible.
    pub valid: bool,
    /// User switch that excludes a valid constraint from assembly.
    pub disabled: bool,
}

/// Contract of a scalar constraint row over a few state blocks.
///
/// All operations must skip inactive blocks and must be no-ops on an invalid
/// constraint.
pub trait Constraint: fmt::Debug + Send {
    /// Variant of this constraint.
    fn kind(&self) -> ConstraintKind;

    /// Shared scalar data.
    fn core(&self) -> &ConstraintCore;

    /// Shared scalar data, mutable.
    fn core_mut(&mut self) -> &mut ConstraintCore;

    /// Blocks this constraint is bound to, in slot order. Empty when unbound.
    fn bound_blocks(&self) -> Vec<BlockId>;

    /// Jacobian segment of a slot.
    fn jacobian(&self, slot: usize) -> Option<&[f64]>;

    /// Overwrite the Jacobian segment of a slot. Marks auxiliary data stale.
    ///
    /// # Errors
    ///
    /// Returns [`ConstraintError::InvalidSlot`](crate::ConstraintError::InvalidSlot)
    /// if the slot does not exist or `row` has the wrong length.
    fn set_jacobian(&mut self, slot: usize, row: &[f64]) -> ConstraintResult<()>;

    /// Whether the effective-mass cache matches the current Jacobians,
    /// bindings and block mass operators.
    fn is_auxiliary_fresh(&self, blocks: &BlockSet) -> bool;

    /// Recompute `Eq_i = M_i⁻¹ Cq_iᵀ` and the effective mass `g`.
    fn update_auxiliary(&mut self, blocks: &BlockSet);

    /// `Σ_active Cq_i · state_i`.
    fn compute_jacobian_times_state(&self, blocks: &BlockSet) -> f64;

    /// `state_i += Eq_i · delta` for each active block.
    ///
    /// # Errors
    ///
    /// Returns [`ConstraintError::StaleAuxiliary`](crate::ConstraintError::StaleAuxiliary)
    /// if the cache is stale.
    fn increment_state(&self, blocks: &mut BlockSet, delta: f64) -> ConstraintResult<()>;

    /// `result += Cq · vect[offsets]`.
    fn add_jacobian_times_vector_into(
        &self,
        blocks: &BlockSet,
        result: &mut f64,
        vect: &DVector<f64>,
    );

    /// `result[offsets] += Cqᵀ · l`.
    fn add_jacobian_transposed_times_scalar_into(
        &self,
        blocks: &BlockSet,
        result: &mut DVector<f64>,
        l: f64,
    );

    /// Write the row segments at `(start_row, offset_i + start_col)`.
    fn paste_jacobian_into(
        &self,
        blocks: &BlockSet,
        sink: &mut dyn SparseSink,
        start_row: usize,
        start_col: usize,
    );

    /// Write the transposed segments at `(offset_i + start_row, start_col)`.
    fn paste_jacobian_transposed_into(
        &self,
        blocks: &BlockSet,
        sink: &mut dyn SparseSink,
        start_row: usize,
        start_col: usize,
    );

    /// Whether all bindings are valid.
    fn is_valid(&self) -> bool {
        self.core().valid
    }

    /// Valid and not disabled.
    fn is_active(&self) -> bool {
        self.core().valid && !self.core().disabled
    }

    /// Enable or disable the constraint without unbinding it.
    fn set_disabled(&mut self, disabled: bool) {
        self.core_mut().disabled = disabled;
    }

    /// Constraint force mixing.
    fn cfm(&self) -> f64 {
        self.core().cfm
    }

    /// Set constraint force mixing. Marks nothing stale; call
    /// `update_auxiliary` before relying on `effective_mass`.
    fn set_cfm(&mut self, cfm: f64) {
        self.core_mut().cfm = cfm;
    }

    /// Effective mass from the last `update_auxiliary`.
    fn effective_mass(&self) -> f64 {
        self.core().g
    }

    /// Last multiplier written by a solver.
    fn multiplier(&self) -> f64 {
        self.core().multiplier
    }

    /// Store a multiplier.
    fn set_multiplier(&mut self, l: f64) {
        self.core_mut().multiplier = l;
    }

    /// Known term `b`.
    fn rhs(&self) -> f64 {
        self.core().rhs
    }

    /// Set the known term `b`.
    fn set_rhs(&mut self, b: f64) {
        self.core_mut().rhs = b;
    }

    /// `Cq · state + b + cfm · l`, the row residual seen by iterative solvers.
    fn compute_residual(&self, blocks: &BlockSet) -> f64 {
        if !self.is_valid() {
            return 0.0;
        }
        let core = self.core();
        self.compute_jacobian_times_state(blocks) + core.rhs + core.cfm * core.multiplier
    }
}
