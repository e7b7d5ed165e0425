//! Assembly parameters.

use crate::{AssemblyError, AssemblyResult};

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

/// Parameters of [`AssemblyAnalysis`](crate::AssemblyAnalysis).
#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct AssemblyParams {
    /// Newton iterations of the position pass.
    pub max_assembly_iters: usize,

    /// Step length of the velocity pass. Small enough that positions do
    /// not move noticeably.
    pub dt: f64,

    /// Optional stopping tolerance on `‖C‖` for the position pass.
    ///
    /// `None` runs exactly `max_assembly_iters` iterations.
    pub tolerance: Option<f64>,
}

impl Default for AssemblyParams {
    fn default() -> Self {
        Self {
            max_assembly_iters: 4,
            dt: 1e-7,
            tolerance: None,
        }
    }
}

impl AssemblyParams {
    /// Stop the position pass early once `‖C‖ ≤ 1e-10`, within 20 iterations.
    #[must_use]
    pub fn converging() -> Self {
        Self {
            max_assembly_iters: 20,
            tolerance: Some(1e-10),
            ..Self::default()
        }
    }

    /// Set the Newton iteration budget.
    #[must_use]
    pub const fn with_max_assembly_iters(mut self, iters: usize) -> Self {
        self.max_assembly_iters = iters;
        self
    }

    /// Set the velocity step length.
    #[must_use]
    pub const fn with_dt(mut self, dt: f64) -> Self {
        self.dt = dt;
        self
    }

    /// Set the position tolerance.
    #[must_use]
    pub const fn with_tolerance(mut self, tolerance: f64) -> Self {
        self.tolerance = Some(tolerance);
        self
    }

    /// Validate the parameters.
    ///
    /// # Errors
    ///
    /// Returns [`AssemblyError::InvalidTimestep`] if `dt` is not positive and
    /// finite.
    pub fn validate(&self) -> AssemblyResult<()> {
        if !(self.dt.is_finite() && self.dt > 0.0) {
            return Err(AssemblyError::InvalidTimestep { dt: self.dt });
        }
        Ok(())
    }
}
