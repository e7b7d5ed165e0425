//! The mechanism contract seen by assembly.
//!
//! A mechanism exposes its state as global vectors (`x` positions, `v`
//! velocities, `L` multipliers) and knows how to load residual terms and
//! solve one linearized correction. The correction solves
//!
//! ```text
//! [ c_a M + c_v ∂F/∂v + c_x ∂F/∂x    Cqᵀ ] [ Dv ]   [  R ]
//! [ Cq                               0   ] [ −L ] = [ −Qc ]
//! ```
//!
//! where the factors `(c_a, c_v, c_x)` are given by [`CorrectionFactors`].

use nalgebra::DVector;

use crate::AssemblyResult;

/// Scaling of the mass, damping and stiffness terms in a correction solve.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CorrectionFactors {
    /// `c_a`, multiplies `M`.
    pub mass: f64,
    /// `c_v`, multiplies `∂F/∂v`.
    pub damping: f64,
    /// `c_x`, multiplies `∂F/∂x`.
    pub stiffness: f64,
}

impl CorrectionFactors {
    /// Create factors `(c_a, c_v, c_x)`.
    #[must_use]
    pub const fn new(mass: f64, damping: f64, stiffness: f64) -> Self {
        Self {
            mass,
            damping,
            stiffness,
        }
    }

    /// Pure mass-metric projection `(1, 0, 0)`, used by the position pass.
    #[must_use]
    pub const fn mass_only() -> Self {
        Self::new(1.0, 0.0, 0.0)
    }

    /// Linearly implicit step of length `dt`: `(1, −dt, −dt²)`.
    #[must_use]
    pub fn implicit_step(dt: f64) -> Self {
        Self::new(1.0, -dt, -dt * dt)
    }
}

/// Result of one correction solve.
#[derive(Debug, Clone, PartialEq)]
pub struct Correction {
    /// Velocity-sized unknown `Dv`.
    pub dv: DVector<f64>,
    /// Multipliers `L`, one per active constraint.
    pub l: DVector<f64>,
}

/// A constrained mechanism that can be driven by
/// [`AssemblyAnalysis`](crate::AssemblyAnalysis).
///
/// All vectors handed to the `load_*` methods are sized by the `num_*`
/// methods; implementations add into them.
pub trait Integrable {
    /// Length of the position vector.
    fn num_coords_x(&self) -> usize;

    /// Length of the velocity vector.
    fn num_coords_v(&self) -> usize;

    /// Number of active constraint rows.
    fn num_constraints(&self) -> usize;

    /// Current `(x, v, t)`.
    fn state_gather(&self) -> (DVector<f64>, DVector<f64>, f64);

    /// Overwrite the state. A full update also re-evaluates constraint values
    /// and Jacobians at the new positions.
    ///
    /// # Errors
    ///
    /// Returns an error if the vectors do not fit the mechanism.
    fn state_scatter(
        &mut self,
        x: &DVector<f64>,
        v: &DVector<f64>,
        t: f64,
        full_update: bool,
    ) -> AssemblyResult<()>;

    /// `x ⊕ dx`. Plain addition unless positions live on a manifold.
    fn state_increment(&self, x: &DVector<f64>, dx: &DVector<f64>) -> DVector<f64> {
        x + dx
    }

    /// `r += c · F`.
    ///
    /// # Errors
    ///
    /// Returns an error if the mechanism cannot evaluate its forces.
    fn load_residual_f(&self, r: &mut DVector<f64>, c: f64) -> AssemblyResult<()>;

    /// `r += c · M w`.
    ///
    /// # Errors
    ///
    /// Returns an error if `w` does not fit the mechanism.
    fn load_residual_mv(&self, r: &mut DVector<f64>, w: &DVector<f64>, c: f64)
    -> AssemblyResult<()>;

    /// `qc += c · C`.
    ///
    /// # Errors
    ///
    /// Returns an error if the constraint values cannot be evaluated.
    fn load_constraint_c(&self, qc: &mut DVector<f64>, c: f64) -> AssemblyResult<()>;

    /// `qc += c · Ct`.
    ///
    /// # Errors
    ///
    /// Returns an error if the constraint time rates cannot be evaluated.
    fn load_constraint_ct(&self, qc: &mut DVector<f64>, c: f64) -> AssemblyResult<()>;

    /// Solve the correction system for the current state.
    ///
    /// # Errors
    ///
    /// Returns an error if the underlying linear solve fails.
    fn state_solve_correction(
        &mut self,
        r: &DVector<f64>,
        qc: &DVector<f64>,
        factors: CorrectionFactors,
    ) -> AssemblyResult<Correction>;

    /// Store accelerations.
    fn state_scatter_acceleration(&mut self, a: &DVector<f64>);

    /// Store constraint reactions.
    fn state_scatter_reactions(&mut self, l: &DVector<f64>);

    /// `‖Cq v + Ct‖` at the current state, if the mechanism can evaluate it.
    fn velocity_residual(&self) -> Option<f64> {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_factors() {
        let f = CorrectionFactors::implicit_step(0.1);
        assert!((f.mass - 1.0).abs() < 1e-15);
        assert!((f.damping + 0.1).abs() < 1e-15);
        assert!((f.stiffness + 0.01).abs() < 1e-15);
        assert_eq!(CorrectionFactors::mass_only(), CorrectionFactors::new(1.0, 0.0, 0.0));
    }
}
