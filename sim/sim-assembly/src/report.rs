//! Assembly reports.

use crate::AssemblyLevel;

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

/// How the position pass ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum PositionStatus {
    /// `‖C‖` fell to the requested tolerance.
    Converged,
    /// The iteration budget was used up. Without a tolerance this is the only
    /// outcome; judge quality from the residual norm.
    BudgetExhausted,
}

/// Outcome of the position pass.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct PositionReport {
    /// Newton solves performed.
    pub iterations: usize,
    /// `‖C‖` before each solve.
    pub residual_history: Vec<f64>,
    /// `‖C‖` after the last solve.
    pub residual_norm: f64,
    /// How the pass ended.
    pub status: PositionStatus,
}

impl PositionReport {
    /// Whether the pass reached its tolerance.
    #[must_use]
    pub fn converged(&self) -> bool {
        self.status == PositionStatus::Converged
    }

    /// Ratio of final to initial residual, zero if there was nothing to fix.
    #[must_use]
    pub fn reduction_ratio(&self) -> f64 {
        match self.residual_history.first() {
            Some(&initial) if initial > 1e-15 => self.residual_norm / initial,
            _ => 0.0,
        }
    }
}

/// Outcome of one `assemble` call.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct AssemblyReport {
    /// Passes that ran.
    pub levels: AssemblyLevel,
    /// Position pass outcome, if it ran.
    pub position: Option<PositionReport>,
    /// `‖Cq v + Ct‖` after the velocity pass, if it ran and the mechanism
    /// can evaluate it.
    pub velocity_residual: Option<f64>,
}

impl AssemblyReport {
    /// Report of a call that ran nothing.
    #[must_use]
    pub fn empty() -> Self {
        Self {
            levels: AssemblyLevel::empty(),
            position: None,
            velocity_residual: None,
        }
    }
}
