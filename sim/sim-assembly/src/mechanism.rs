//! A mechanism built from a [`SystemDescriptor`] and coupling links.
//!
//! [`DescriptorMechanism`] keeps global position, velocity and force vectors
//! with one coordinate per active block DOF (positions are additive, so a
//! rigid body's last three coordinates are a small rotation vector). Each
//! [`Link`] owns one [`ThreeBodyShaftConstraint`] and evaluates
//!
//! ```text
//! C(x_a, x_b, x_c, t)     violation
//! Ct                      explicit time rate ∂C/∂t
//! Cq_a, Cq_b, Cq_c        Jacobian segments
//! ```
//!
//! at the current positions. Correction solves are forwarded to a
//! [`KktSolver`] (by default [`SchurComplementSolver`]). Coordinates of
//! inactive blocks read as zero.
//!
//! The mechanism has no velocity- or position-dependent forces, so the
//! damping and stiffness correction factors have nothing to multiply.

use std::fmt;

use nalgebra::{DVector, RowVector6, Vector6};
use sim_constraint::{
    BlockId, BlockSet, Constraint, ConstraintError, ConstraintId, KktSolver,
    SchurComplementSolver, SystemDescriptor, ThreeBodyShaftConstraint,
};
use tracing::debug;

use crate::{AssemblyError, AssemblyResult, Correction, CorrectionFactors, Integrable};

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

const ZEROS: [f64; 6] = [0.0; 6];

/// Coordinates a link sees.
#[derive(Debug, Clone, Copy)]
pub struct LinkState<'a> {
    /// Coordinates of body A (6).
    pub a: &'a [f64],
    /// Coordinates of body B (6).
    pub b: &'a [f64],
    /// Shaft coordinate.
    pub c: f64,
    /// Time.
    pub t: f64,
}

/// Value and derivatives of a link at one state.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct LinkEvaluation {
    /// Constraint violation `C`.
    pub violation: f64,
    /// Explicit time rate `Ct`.
    pub time_rate: f64,
    /// `∂C/∂x_a`.
    pub cq_a: RowVector6<f64>,
    /// `∂C/∂x_b`.
    pub cq_b: RowVector6<f64>,
    /// `∂C/∂x_c`.
    pub cq_c: f64,
}

/// A scalar coupling between two bodies and a shaft.
pub trait Link: Send {
    /// Evaluate the violation and Jacobians.
    fn evaluate(&self, state: &LinkState<'_>) -> LinkEvaluation;
}

impl<F> Link for F
where
    F: Fn(&LinkState<'_>) -> LinkEvaluation + Send,
{
    fn evaluate(&self, state: &LinkState<'_>) -> LinkEvaluation {
        self(state)
    }
}

/// Linear coupling `Cq_a · x_a + Cq_b · x_b + Cq_c · x_c = target + rate · t`.
#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct LinearCoupling {
    /// Coefficients on body A.
    pub cq_a: RowVector6<f64>,
    /// Coefficients on body B.
    pub cq_b: RowVector6<f64>,
    /// Coefficient on the shaft.
    pub cq_c: f64,
    /// Value of the combination at `t = 0`.
    pub target: f64,
    /// Rate at which the target moves.
    pub target_rate: f64,
}

impl LinearCoupling {
    /// Create a coupling with a zero target.
    #[must_use]
    pub fn new(cq_a: RowVector6<f64>, cq_b: RowVector6<f64>, cq_c: f64) -> Self {
        Self {
            cq_a,
            cq_b,
            cq_c,
            target: 0.0,
            target_rate: 0.0,
        }
    }

    /// Set the target value.
    #[must_use]
    pub const fn with_target(mut self, target: f64) -> Self {
        self.target = target;
        self
    }

    /// Set the target rate (a rheonomic coupling).
    #[must_use]
    pub const fn with_target_rate(mut self, rate: f64) -> Self {
        self.target_rate = rate;
        self
    }
}

impl Link for LinearCoupling {
    fn evaluate(&self, state: &LinkState<'_>) -> LinkEvaluation {
        LinkEvaluation {
            violation: self.cq_a.tr_dot(&Vector6::from_column_slice(state.a))
                + self.cq_b.tr_dot(&Vector6::from_column_slice(state.b))
                + self.cq_c * state.c
                - self.target
                - self.target_rate * state.t,
            time_rate: -self.target_rate,
            cq_a: self.cq_a,
            cq_b: self.cq_b,
            cq_c: self.cq_c,
        }
    }
}

struct LinkSlot {
    constraint: ConstraintId,
    blocks: [BlockId; 3],
    link: Box<dyn Link>,
    value: LinkEvaluation,
}

/// Descriptor-backed [`Integrable`].
pub struct DescriptorMechanism {
    descriptor: SystemDescriptor,
    links: Vec<LinkSlot>,
    solver: Box<dyn KktSolver>,
    x: DVector<f64>,
    v: DVector<f64>,
    f: DVector<f64>,
    a: DVector<f64>,
    reactions: DVector<f64>,
    t: f64,
}

impl fmt::Debug for DescriptorMechanism {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DescriptorMechanism")
            .field("descriptor", &self.descriptor)
            .field("links", &self.links.len())
            .field("solver", &self.solver)
            .field("t", &self.t)
            .finish_non_exhaustive()
    }
}

fn block_slice<'a>(blocks: &BlockSet, id: BlockId, vec: &'a DVector<f64>) -> Option<&'a [f64]> {
    blocks
        .active(id)
        .map(|block| &vec.as_slice()[block.offset()..block.offset() + block.dof()])
}

impl DescriptorMechanism {
    /// Wrap a descriptor. Positions, velocities and forces start at zero.
    ///
    /// Block activity is fixed from here on; it defines the coordinates.
    #[must_use]
    pub fn new(mut descriptor: SystemDescriptor) -> Self {
        let n = descriptor.assign_offsets();
        let m = descriptor.num_active_constraints();
        Self {
            descriptor,
            links: Vec::new(),
            solver: Box::new(SchurComplementSolver::default()),
            x: DVector::zeros(n),
            v: DVector::zeros(n),
            f: DVector::zeros(n),
            a: DVector::zeros(n),
            reactions: DVector::zeros(m),
            t: 0.0,
        }
    }

    /// Use another KKT solver for corrections.
    #[must_use]
    pub fn with_solver(mut self, solver: impl KktSolver + 'static) -> Self {
        self.solver = Box::new(solver);
        self
    }

    /// Add a link between bodies `a`, `b` and shaft `c`.
    ///
    /// # Errors
    ///
    /// Returns [`AssemblyError::Constraint`] if the blocks cannot be bound.
    pub fn add_link(
        &mut self,
        a: BlockId,
        b: BlockId,
        c: BlockId,
        link: impl Link + 'static,
    ) -> AssemblyResult<ConstraintId> {
        let constraint = ThreeBodyShaftConstraint::new(self.descriptor.blocks(), a, b, c)?;
        let id = self.descriptor.add_constraint(constraint);
        self.descriptor.assign_offsets();
        self.links.push(LinkSlot {
            constraint: id,
            blocks: [a, b, c],
            link: Box::new(link),
            value: LinkEvaluation::default(),
        });
        self.reactions = DVector::zeros(self.descriptor.num_active_constraints());
        self.refresh()?;
        Ok(id)
    }

    /// Enable or disable a link's constraint.
    ///
    /// # Errors
    ///
    /// Returns [`AssemblyError::Constraint`] if `id` is not a constraint of
    /// this mechanism.
    pub fn set_link_enabled(&mut self, id: ConstraintId, enabled: bool) -> AssemblyResult<()> {
        let constraint = self.descriptor.constraint_mut(id).ok_or_else(|| {
            ConstraintError::invalid_config(format!("no constraint {id} in this mechanism"))
        })?;
        constraint.set_disabled(!enabled);
        self.descriptor.assign_offsets();
        self.reactions = DVector::zeros(self.descriptor.num_active_constraints());
        Ok(())
    }

    /// Re-evaluate every link at the current positions and time and write
    /// the Jacobians into the constraints.
    ///
    /// # Errors
    ///
    /// Returns [`AssemblyError::Constraint`] if a Jacobian cannot be written.
    pub fn refresh(&mut self) -> AssemblyResult<()> {
        let blocks = self.descriptor.blocks();
        let values: Vec<LinkEvaluation> = self
            .links
            .iter()
            .map(|slot| {
                let [a, b, c] = slot.blocks;
                let state = LinkState {
                    a: block_slice(blocks, a, &self.x).unwrap_or(&ZEROS),
                    b: block_slice(blocks, b, &self.x).unwrap_or(&ZEROS),
                    c: block_slice(blocks, c, &self.x).map_or(0.0, |s| s[0]),
                    t: self.t,
                };
                slot.link.evaluate(&state)
            })
            .collect();

        for (slot, value) in self.links.iter_mut().zip(values) {
            if let Some(constraint) = self.descriptor.constraint_mut(slot.constraint) {
                constraint.set_jacobian(0, value.cq_a.as_slice())?;
                constraint.set_jacobian(1, value.cq_b.as_slice())?;
                constraint.set_jacobian(2, &[value.cq_c])?;
            }
            slot.value = value;
        }
        Ok(())
    }

    /// The descriptor.
    #[must_use]
    pub fn descriptor(&self) -> &SystemDescriptor {
        &self.descriptor
    }

    /// Last evaluation of a link.
    #[must_use]
    pub fn link_value(&self, id: ConstraintId) -> Option<&LinkEvaluation> {
        self.links
            .iter()
            .find(|slot| slot.constraint == id)
            .map(|slot| &slot.value)
    }

    /// Global positions.
    #[must_use]
    pub fn positions(&self) -> &DVector<f64> {
        &self.x
    }

    /// Global velocities.
    #[must_use]
    pub fn velocities(&self) -> &DVector<f64> {
        &self.v
    }

    /// Applied forces.
    #[must_use]
    pub fn forces(&self) -> &DVector<f64> {
        &self.f
    }

    /// Accelerations from the last acceleration assembly.
    #[must_use]
    pub fn accelerations(&self) -> &DVector<f64> {
        &self.a
    }

    /// Reactions from the last acceleration assembly, one per active link.
    #[must_use]
    pub fn reactions(&self) -> &DVector<f64> {
        &self.reactions
    }

    /// Reaction of one link, if it is active.
    #[must_use]
    pub fn reaction(&self, id: ConstraintId) -> Option<f64> {
        self.descriptor
            .constraint_row(id)
            .and_then(|row| self.reactions.get(row).copied())
    }

    /// Time.
    #[must_use]
    pub fn time(&self) -> f64 {
        self.t
    }

    /// Positions of one active block.
    #[must_use]
    pub fn block_positions(&self, id: BlockId) -> Option<&[f64]> {
        block_slice(self.descriptor.blocks(), id, &self.x)
    }

    /// Velocities of one active block.
    #[must_use]
    pub fn block_velocities(&self, id: BlockId) -> Option<&[f64]> {
        block_slice(self.descriptor.blocks(), id, &self.v)
    }

    /// Accelerations of one active block.
    #[must_use]
    pub fn block_accelerations(&self, id: BlockId) -> Option<&[f64]> {
        block_slice(self.descriptor.blocks(), id, &self.a)
    }

    fn block_range(&self, id: BlockId, len: usize) -> AssemblyResult<std::ops::Range<usize>> {
        let block = self.descriptor.blocks().active(id).ok_or_else(|| {
            ConstraintError::invalid_config(format!("{id} is not an active block"))
        })?;
        if len != block.dof() {
            return Err(AssemblyError::dimension_mismatch("block values", block.dof(), len));
        }
        Ok(block.offset()..block.offset() + len)
    }

    /// Overwrite the positions of one block and re-evaluate the links.
    ///
    /// # Errors
    ///
    /// Returns an error if `id` is not an active block or `values` has the
    /// wrong length.
    pub fn set_block_positions(&mut self, id: BlockId, values: &[f64]) -> AssemblyResult<()> {
        let range = self.block_range(id, values.len())?;
        self.x.as_mut_slice()[range].copy_from_slice(values);
        self.refresh()
    }

    /// Overwrite the velocities of one block.
    ///
    /// # Errors
    ///
    /// Returns an error if `id` is not an active block or `values` has the
    /// wrong length.
    pub fn set_block_velocities(&mut self, id: BlockId, values: &[f64]) -> AssemblyResult<()> {
        let range = self.block_range(id, values.len())?;
        self.v.as_mut_slice()[range].copy_from_slice(values);
        Ok(())
    }

    /// Overwrite the applied force of one block.
    ///
    /// # Errors
    ///
    /// Returns an error if `id` is not an active block or `values` has the
    /// wrong length.
    pub fn set_block_force(&mut self, id: BlockId, values: &[f64]) -> AssemblyResult<()> {
        let range = self.block_range(id, values.len())?;
        self.f.as_mut_slice()[range].copy_from_slice(values);
        Ok(())
    }

    /// Set the time and re-evaluate the links.
    ///
    /// # Errors
    ///
    /// Returns [`AssemblyError::Constraint`] if a Jacobian cannot be written.
    pub fn set_time(&mut self, t: f64) -> AssemblyResult<()> {
        self.t = t;
        self.refresh()
    }

    fn check(&self, what: &'static str, actual: usize) -> AssemblyResult<()> {
        if actual == self.x.len() {
            Ok(())
        } else {
            Err(AssemblyError::dimension_mismatch(what, self.x.len(), actual))
        }
    }

    fn check_rows(&self, actual: usize) -> AssemblyResult<()> {
        let rows = self.descriptor.num_active_constraints();
        if actual == rows {
            Ok(())
        } else {
            Err(AssemblyError::dimension_mismatch("constraint vector", rows, actual))
        }
    }

    fn load_per_row(&self, qc: &mut DVector<f64>, pick: impl Fn(&LinkEvaluation) -> f64) {
        for slot in &self.links {
            if let Some(row) = self.descriptor.constraint_row(slot.constraint) {
                qc[row] += pick(&slot.value);
            }
        }
    }
}

impl Integrable for DescriptorMechanism {
    fn num_coords_x(&self) -> usize {
        self.x.len()
    }

    fn num_coords_v(&self) -> usize {
        self.v.len()
    }

    fn num_constraints(&self) -> usize {
        self.descriptor.num_active_constraints()
    }

    fn state_gather(&self) -> (DVector<f64>, DVector<f64>, f64) {
        (self.x.clone(), self.v.clone(), self.t)
    }

    fn state_scatter(
        &mut self,
        x: &DVector<f64>,
        v: &DVector<f64>,
        t: f64,
        full_update: bool,
    ) -> AssemblyResult<()> {
        self.check("positions", x.len())?;
        self.check("velocities", v.len())?;
        self.x.copy_from(x);
        self.v.copy_from(v);
        self.t = t;
        if full_update {
            self.refresh()?;
        }
        Ok(())
    }

    fn load_residual_f(&self, r: &mut DVector<f64>, c: f64) -> AssemblyResult<()> {
        self.check("residual", r.len())?;
        r.axpy(c, &self.f, 1.0);
        Ok(())
    }

    fn load_residual_mv(
        &self,
        r: &mut DVector<f64>,
        w: &DVector<f64>,
        c: f64,
    ) -> AssemblyResult<()> {
        self.check("residual", r.len())?;
        *r += self.descriptor.mass_times(w, c)?;
        Ok(())
    }

    fn load_constraint_c(&self, qc: &mut DVector<f64>, c: f64) -> AssemblyResult<()> {
        self.check_rows(qc.len())?;
        self.load_per_row(qc, |value| c * value.violation);
        Ok(())
    }

    fn load_constraint_ct(&self, qc: &mut DVector<f64>, c: f64) -> AssemblyResult<()> {
        self.check_rows(qc.len())?;
        self.load_per_row(qc, |value| c * value.time_rate);
        Ok(())
    }

    fn state_solve_correction(
        &mut self,
        r: &DVector<f64>,
        qc: &DVector<f64>,
        factors: CorrectionFactors,
    ) -> AssemblyResult<Correction> {
        if !(factors.mass.is_finite() && factors.mass != 0.0) {
            return Err(
                ConstraintError::invalid_config("mass factor must be finite and non-zero").into(),
            );
        }

        // M x = r / c_a + Cqᵀ λ,  Cq x = −Qc,  L = c_a λ
        let solution = self
            .solver
            .solve(&mut self.descriptor, &(r / factors.mass), &(-qc))?;
        debug!(
            iterations = solution.iterations,
            residual_norm = solution.residual_norm,
            "Correction solve"
        );

        Ok(Correction {
            dv: solution.x,
            l: solution.multipliers * factors.mass,
        })
    }

    fn state_scatter_acceleration(&mut self, a: &DVector<f64>) {
        self.a.clone_from(a);
    }

    fn state_scatter_reactions(&mut self, l: &DVector<f64>) {
        self.reactions.clone_from(l);
    }

    fn velocity_residual(&self) -> Option<f64> {
        let mut residual = self.descriptor.jacobian_times(&self.v).ok()?;
        self.load_per_row(&mut residual, |value| value.time_rate);
        Some(residual.norm())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use sim_constraint::{RigidBodyBlock, ShaftBlock};

    fn rig() -> (DescriptorMechanism, [BlockId; 3]) {
        let mut system = SystemDescriptor::new();
        let a = system.blocks_mut().insert(RigidBodyBlock::unit());
        let b = system.blocks_mut().insert(RigidBodyBlock::unit().fixed());
        let c = system.blocks_mut().insert(ShaftBlock::new(2.0).unwrap());
        (DescriptorMechanism::new(system), [a, b, c])
    }

    fn spin_z() -> RowVector6<f64> {
        RowVector6::new(0.0, 0.0, 0.0, 0.0, 0.0, 1.0)
    }

    #[test]
    fn test_linear_coupling_evaluation() {
        let coupling = LinearCoupling::new(spin_z(), RowVector6::zeros(), -2.0)
            .with_target(0.5)
            .with_target_rate(0.1);
        let a = [0.0, 0.0, 0.0, 0.0, 0.0, 3.0];
        let value = coupling.evaluate(&LinkState {
            a: &a,
            b: &ZEROS,
            c: 1.0,
            t: 2.0,
        });

        assert_relative_eq!(value.violation, 3.0 - 2.0 - 0.5 - 0.2, epsilon = 1e-15);
        assert_relative_eq!(value.time_rate, -0.1, epsilon = 1e-15);
        assert_relative_eq!(value.cq_c, -2.0, epsilon = 1e-15);
    }

    #[test]
    fn test_coordinates_skip_inactive_blocks() {
        let (mechanism, [a, b, c]) = rig();
        assert_eq!(mechanism.num_coords_x(), 7);
        assert_eq!(mechanism.block_positions(a).unwrap().len(), 6);
        assert!(mechanism.block_positions(b).is_none());
        assert_eq!(mechanism.block_positions(c).unwrap().len(), 1);
    }

    #[test]
    fn test_link_writes_jacobians() {
        let (mut mechanism, [a, b, c]) = rig();
        let id = mechanism
            .add_link(a, b, c, LinearCoupling::new(spin_z(), spin_z(), -1.0))
            .unwrap();

        let constraint = mechanism.descriptor().constraint(id).unwrap();
        assert_eq!(constraint.jacobian(0), Some(spin_z().as_slice()));
        assert_eq!(constraint.jacobian(2), Some(&[-1.0][..]));
        assert_eq!(mechanism.num_constraints(), 1);
    }

    // C = x_a² − x_c
    fn square_link(s: &LinkState<'_>) -> LinkEvaluation {
        LinkEvaluation {
            violation: s.a[0] * s.a[0] - s.c,
            cq_a: RowVector6::new(2.0 * s.a[0], 0.0, 0.0, 0.0, 0.0, 0.0),
            cq_c: -1.0,
            ..LinkEvaluation::default()
        }
    }

    #[test]
    fn test_function_link_reevaluated_on_full_scatter() {
        let (mut mechanism, [a, b, c]) = rig();
        let id = mechanism.add_link(a, b, c, square_link).unwrap();

        let mut x = DVector::zeros(7);
        x[0] = 3.0;
        x[6] = 1.0;
        let v = DVector::zeros(7);

        mechanism.state_scatter(&x, &v, 0.0, false).unwrap();
        assert_relative_eq!(mechanism.link_value(id).unwrap().violation, 0.0);

        mechanism.state_scatter(&x, &v, 0.0, true).unwrap();
        assert_relative_eq!(mechanism.link_value(id).unwrap().violation, 8.0);
        let constraint = mechanism.descriptor().constraint(id).unwrap();
        assert_relative_eq!(constraint.jacobian(0).unwrap()[0], 6.0);

        let mut qc = DVector::zeros(1);
        mechanism.load_constraint_c(&mut qc, 0.5).unwrap();
        assert_relative_eq!(qc[0], 4.0);
    }

    #[test]
    fn test_correction_scales_multipliers() {
        let (mut mechanism, [a, b, c]) = rig();
        mechanism
            .add_link(a, b, c, LinearCoupling::new(spin_z(), RowVector6::zeros(), -1.0))
            .unwrap();

        let r = DVector::zeros(7);
        let qc = DVector::from_vec(vec![-0.3]);
        let unit = mechanism
            .state_solve_correction(&r, &qc, CorrectionFactors::mass_only())
            .unwrap();
        let doubled = mechanism
            .state_solve_correction(&r, &qc, CorrectionFactors::new(2.0, 0.0, 0.0))
            .unwrap();

        // Cq Dv = −Qc
        assert_relative_eq!(unit.dv[5] - unit.dv[6], 0.3, epsilon = 1e-8);
        assert_relative_eq!(doubled.dv[5] - doubled.dv[6], 0.3, epsilon = 1e-8);
        assert_relative_eq!(doubled.l[0], 2.0 * unit.l[0], epsilon = 1e-8);

        let err = mechanism
            .state_solve_correction(&r, &qc, CorrectionFactors::new(0.0, 0.0, 0.0))
            .unwrap_err();
        assert!(matches!(err, AssemblyError::Constraint(_)));
    }

    #[test]
    fn test_residual_loading() {
        let (mut mechanism, [a, _, c]) = rig();
        mechanism.set_block_force(c, &[4.0]).unwrap();

        let mut r = DVector::zeros(7);
        mechanism.load_residual_f(&mut r, 0.5).unwrap();
        let w = DVector::from_element(7, 1.0);
        mechanism.load_residual_mv(&mut r, &w, 1.0).unwrap();
        assert_relative_eq!(r[6], 2.0 + 2.0, epsilon = 1e-15);
        assert_relative_eq!(r[0], 1.0, epsilon = 1e-15);

        assert!(mechanism.set_block_force(a, &[1.0]).is_err());
        assert!(mechanism.load_residual_f(&mut DVector::zeros(3), 1.0).is_err());
    }

    #[test]
    fn test_disabled_link_has_no_row() {
        let (mut mechanism, [a, b, c]) = rig();
        let first = mechanism
            .add_link(a, b, c, LinearCoupling::new(spin_z(), RowVector6::zeros(), -1.0))
            .unwrap();
        mechanism
            .add_link(a, b, c, LinearCoupling::new(RowVector6::zeros(), RowVector6::zeros(), 1.0))
            .unwrap();
        assert_eq!(mechanism.num_constraints(), 2);

        mechanism.set_link_enabled(first, false).unwrap();
        assert_eq!(mechanism.num_constraints(), 1);
        assert_eq!(mechanism.reactions().len(), 1);
        assert!(mechanism.reaction(first).is_none());
    }

    #[test]
    fn test_bad_binding_rejected() {
        let (mut mechanism, [a, b, c]) = rig();
        let err = mechanism
            .add_link(c, b, a, LinearCoupling::new(spin_z(), spin_z(), 1.0))
            .unwrap_err();
        assert!(matches!(
            err,
            AssemblyError::Constraint(ConstraintError::IncompatibleBlockType { slot: 0, .. })
        ));
        assert_eq!(mechanism.descriptor().num_constraints(), 0);
    }
}
