//! System descriptor: blocks plus constraints, with global products.
//!
//! The descriptor is what a linear solver sees. It owns the [`BlockSet`] and a
//! constraint arena, numbers active blocks into columns and active
//! constraints into rows, and exposes the global operators
//!
//! ```text
//! J v          (m)     jacobian_times
//! Jᵀ λ         (n)     jacobian_transposed_times
//! M⁻¹ v        (n)     inverse_mass_times
//! c M v        (n)     mass_times
//! ```
//!
//! built block by block from the constraint contract. Call
//! [`assign_offsets`](SystemDescriptor::assign_offsets) after adding,
//! removing or (de)activating anything.

use nalgebra::DVector;

use crate::{
    BlockSet, Constraint, ConstraintError, ConstraintId, ConstraintResult, SparseJacobian,
    TripletSink,
};

/// Blocks and constraints of one linear problem.
#[derive(Debug, Default)]
pub struct SystemDescriptor {
    blocks: BlockSet,
    constraints: Vec<Box<dyn Constraint>>,
    rows: Vec<Option<usize>>,
    num_rows: usize,
}

impl SystemDescriptor {
    /// Create an empty descriptor.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a descriptor over an existing block set.
    #[must_use]
    pub fn with_blocks(blocks: BlockSet) -> Self {
        Self {
            blocks,
            ..Self::default()
        }
    }

    /// The block set.
    #[must_use]
    pub fn blocks(&self) -> &BlockSet {
        &self.blocks
    }

    /// The block set, mutable.
    pub fn blocks_mut(&mut self) -> &mut BlockSet {
        &mut self.blocks
    }

    /// Add a constraint and return its handle.
    pub fn add_constraint(&mut self, constraint: impl Constraint + 'static) -> ConstraintId {
        self.add_boxed_constraint(Box::new(constraint))
    }

    /// Add an already boxed constraint.
    pub fn add_boxed_constraint(&mut self, constraint: Box<dyn Constraint>) -> ConstraintId {
        let id = ConstraintId(self.constraints.len());
        self.constraints.push(constraint);
        self.rows.push(None);
        id
    }

    /// Look up a constraint.
    #[must_use]
    pub fn constraint(&self, id: ConstraintId) -> Option<&dyn Constraint> {
        self.constraints.get(id.0).map(|c| &**c)
    }

    /// Look up a constraint mutably.
    pub fn constraint_mut(&mut self, id: ConstraintId) -> Option<&mut (dyn Constraint + 'static)> {
        self.constraints.get_mut(id.0).map(|c| &mut **c)
    }

    /// Borrow the block set and the constraints at the same time.
    pub fn split_mut(&mut self) -> (&mut BlockSet, &mut [Box<dyn Constraint>]) {
        (&mut self.blocks, &mut self.constraints)
    }

    /// Total number of constraints, active or not.
    #[must_use]
    pub fn num_constraints(&self) -> usize {
        self.constraints.len()
    }

    /// Number of rows from the last [`assign_offsets`](Self::assign_offsets).
    #[must_use]
    pub fn num_active_constraints(&self) -> usize {
        self.num_rows
    }

    /// Number of columns from the last [`assign_offsets`](Self::assign_offsets).
    #[must_use]
    pub fn num_coords(&self) -> usize {
        self.blocks.num_coords()
    }

    /// Number block columns and active constraint rows in insertion order.
    ///
    /// Returns the coordinate count.
    pub fn assign_offsets(&mut self) -> usize {
        let n = self.blocks.assign_offsets();
        let mut row = 0;
        for (slot, constraint) in self.rows.iter_mut().zip(&self.constraints) {
            *slot = if constraint.is_active() {
                row += 1;
                Some(row - 1)
            } else {
                None
            };
        }
        self.num_rows = row;
        n
    }

    /// Row of a constraint, `None` if it was inactive at the last numbering.
    #[must_use]
    pub fn constraint_row(&self, id: ConstraintId) -> Option<usize> {
        self.rows.get(id.0).copied().flatten()
    }

    /// Active constraints with their rows.
    pub fn active_constraints(&self) -> impl Iterator<Item = (usize, &dyn Constraint)> {
        self.rows
            .iter()
            .zip(&self.constraints)
            .filter_map(|(row, c)| row.map(|r| (r, &**c)))
    }

    /// Refresh the effective-mass cache of every active constraint.
    pub fn update_auxiliary(&mut self) {
        for (row, constraint) in self.rows.iter().zip(self.constraints.iter_mut()) {
            if row.is_some() {
                constraint.update_auxiliary(&self.blocks);
            }
        }
    }

    /// Assemble the explicit `m × n` Jacobian.
    #[must_use]
    pub fn build_jacobian(&self) -> SparseJacobian {
        let mut sink = TripletSink::new(self.num_rows, self.num_coords());
        for (row, constraint) in self.active_constraints() {
            constraint.paste_jacobian_into(&self.blocks, &mut sink, row, 0);
        }
        sink.build()
    }

    /// Matrix-free `J v`.
    ///
    /// # Errors
    ///
    /// Returns [`ConstraintError::DimensionMismatch`] if `v` is not `n` long.
    pub fn jacobian_times(&self, v: &DVector<f64>) -> ConstraintResult<DVector<f64>> {
        check_len("J v operand", self.num_coords(), v.len())?;
        let mut out = DVector::<f64>::zeros(self.num_rows);
        for (row, constraint) in self.active_constraints() {
            constraint.add_jacobian_times_vector_into(&self.blocks, &mut out[row], v);
        }
        Ok(out)
    }

    /// Matrix-free `Jᵀ λ`.
    ///
    /// # Errors
    ///
    /// Returns [`ConstraintError::DimensionMismatch`] if `lambda` is not `m` long.
    pub fn jacobian_transposed_times(
        &self,
        lambda: &DVector<f64>,
    ) -> ConstraintResult<DVector<f64>> {
        check_len("Jᵀ λ operand", self.num_rows, lambda.len())?;
        let mut out = DVector::<f64>::zeros(self.num_coords());
        for (row, constraint) in self.active_constraints() {
            constraint.add_jacobian_transposed_times_scalar_into(
                &self.blocks,
                &mut out,
                lambda[row],
            );
        }
        Ok(out)
    }

    /// Block-diagonal `M⁻¹ v`.
    ///
    /// # Errors
    ///
    /// Returns [`ConstraintError::DimensionMismatch`] if `v` is not `n` long.
    pub fn inverse_mass_times(&self, v: &DVector<f64>) -> ConstraintResult<DVector<f64>> {
        let n = self.num_coords();
        check_len("M⁻¹ v operand", n, v.len())?;
        let mut out = DVector::<f64>::zeros(n);
        for (_, block) in self.blocks.iter_active() {
            let range = block.offset()..block.offset() + block.dof();
            block.apply_inverse_mass(&v.as_slice()[range.clone()], &mut out.as_mut_slice()[range]);
        }
        Ok(out)
    }

    /// Block-diagonal `c M v`.
    ///
    /// # Errors
    ///
    /// Returns [`ConstraintError::DimensionMismatch`] if `v` is not `n` long.
    pub fn mass_times(&self, v: &DVector<f64>, c: f64) -> ConstraintResult<DVector<f64>> {
        let n = self.num_coords();
        check_len("M v operand", n, v.len())?;
        let mut out = DVector::<f64>::zeros(n);
        for (_, block) in self.blocks.iter_active() {
            let range = block.offset()..block.offset() + block.dof();
            block.add_mass_times(&v.as_slice()[range.clone()], &mut out.as_mut_slice()[range], c);
        }
        Ok(out)
    }

    /// Concatenate the states of active blocks.
    #[must_use]
    pub fn gather_state(&self) -> DVector<f64> {
        let mut out = DVector::<f64>::zeros(self.num_coords());
        for (_, block) in self.blocks.iter_active() {
            let off = block.offset();
            out.as_mut_slice()[off..off + block.dof()].copy_from_slice(block.state());
        }
        out
    }

    /// Write a global vector back into the active block states.
    ///
    /// # Errors
    ///
    /// Returns [`ConstraintError::DimensionMismatch`] if `x` is not `n` long.
    pub fn scatter_state(&mut self, x: &DVector<f64>) -> ConstraintResult<()> {
        check_len("block state", self.num_coords(), x.len())?;
        let ids: Vec<_> = self.blocks.iter_active().map(|(id, _)| id).collect();
        for id in ids {
            if let Some(block) = self.blocks.get_mut(id) {
                let off = block.offset();
                let dof = block.dof();
                block.state_mut().copy_from_slice(&x.as_slice()[off..off + dof]);
            }
        }
        Ok(())
    }

    /// Row residuals `Cq · state + b + cfm · l` of the active constraints.
    #[must_use]
    pub fn residuals(&self) -> DVector<f64> {
        let mut out = DVector::<f64>::zeros(self.num_rows);
        for (row, constraint) in self.active_constraints() {
            out[row] = constraint.compute_residual(&self.blocks);
        }
        out
    }

    /// Constraint force mixing of the active constraints.
    #[must_use]
    pub fn cfm_vector(&self) -> DVector<f64> {
        let mut out = DVector::<f64>::zeros(self.num_rows);
        for (row, constraint) in self.active_constraints() {
            out[row] = constraint.cfm();
        }
        out
    }

    /// Multipliers of the active constraints.
    #[must_use]
    pub fn multipliers(&self) -> DVector<f64> {
        let mut out = DVector::<f64>::zeros(self.num_rows);
        for (row, constraint) in self.active_constraints() {
            out[row] = constraint.multiplier();
        }
        out
    }

    /// Store multipliers into the active constraints.
    ///
    /// # Errors
    ///
    /// Returns [`ConstraintError::DimensionMismatch`] if `l` is not `m` long.
    pub fn set_multipliers(&mut self, l: &DVector<f64>) -> ConstraintResult<()> {
        check_len("multipliers", self.num_rows, l.len())?;
        for (row, constraint) in self.rows.iter().zip(self.constraints.iter_mut()) {
            if let Some(row) = row {
                constraint.set_multiplier(l[*row]);
            }
        }
        Ok(())
    }

    /// Store known terms `b` into the active constraints.
    ///
    /// # Errors
    ///
    /// Returns [`ConstraintError::DimensionMismatch`] if `b` is not `m` long.
    pub fn set_rhs(&mut self, b: &DVector<f64>) -> ConstraintResult<()> {
        check_len("known terms", self.num_rows, b.len())?;
        for (row, constraint) in self.rows.iter().zip(self.constraints.iter_mut()) {
            if let Some(row) = row {
                constraint.set_rhs(b[*row]);
            }
        }
        Ok(())
    }
}

fn check_len(what: &'static str, expected: usize, actual: usize) -> ConstraintResult<()> {
    if expected == actual {
        Ok(())
    } else {
        Err(ConstraintError::DimensionMismatch {
            what,
            expected,
            actual,
        })
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::{RigidBodyBlock, ShaftBlock, StateBlock, ThreeBodyShaftConstraint};
    use approx::assert_relative_eq;
    use nalgebra::{RowVector6, Vector3, Vector6};

    fn two_row_system() -> (SystemDescriptor, ConstraintId, ConstraintId) {
        let mut desc = SystemDescriptor::new();
        let blocks = desc.blocks_mut();
        let a = blocks.insert(
            RigidBodyBlock::with_principal_inertia(2.0, Vector3::new(1.0, 1.0, 2.0))
                .unwrap()
                .with_state(Vector6::new(1.0, 0.0, 0.0, 0.0, 0.0, 0.5)),
        );
        let b = blocks.insert(RigidBodyBlock::unit());
        let c = blocks.insert(ShaftBlock::new(0.5).unwrap().with_state(2.0));
        desc.assign_offsets();

        let mut first = ThreeBodyShaftConstraint::new(desc.blocks(), a, b, c).unwrap();
        first.set_jacobian_a(RowVector6::new(1.0, 0.0, 0.0, 0.0, 0.0, 1.0));
        first.set_jacobian_c(-1.0);
        let mut second = ThreeBodyShaftConstraint::new(desc.blocks(), a, b, c).unwrap();
        second.set_jacobian_b(RowVector6::new(0.0, 1.0, 0.0, 0.0, 0.0, 0.0));
        second.set_jacobian_c(1.0);

        let first = desc.add_constraint(first);
        let second = desc.add_constraint(second);
        desc.assign_offsets();
        (desc, first, second)
    }

    #[test]
    fn test_row_numbering_skips_inactive() {
        let (mut desc, first, second) = two_row_system();
        assert_eq!(desc.num_coords(), 13);
        assert_eq!(desc.num_active_constraints(), 2);
        assert_eq!(desc.constraint_row(second), Some(1));

        desc.constraint_mut(first).unwrap().set_disabled(true);
        desc.assign_offsets();
        assert_eq!(desc.num_active_constraints(), 1);
        assert_eq!(desc.constraint_row(first), None);
        assert_eq!(desc.constraint_row(second), Some(0));
    }

    #[test]
    fn test_matrix_free_products_match_explicit_jacobian() {
        let (desc, _, _) = two_row_system();
        let jacobian = desc.build_jacobian();

        let v = DVector::from_fn(13, |i, _| 1.0 - 0.1 * i as f64);
        let jv = desc.jacobian_times(&v).unwrap();
        let expected = jacobian.mul_vec(&v);
        for i in 0..2 {
            assert_relative_eq!(jv[i], expected[i], epsilon = 1e-12);
        }

        let lambda = DVector::from_vec(vec![0.7, -1.3]);
        let jt = desc.jacobian_transposed_times(&lambda).unwrap();
        let expected = jacobian.mul_transpose_vec(&lambda);
        for i in 0..13 {
            assert_relative_eq!(jt[i], expected[i], epsilon = 1e-12);
        }
    }

    #[test]
    fn test_mass_and_inverse_mass() {
        let (desc, _, _) = two_row_system();
        let v = DVector::from_fn(13, |i, _| 1.0 + i as f64);

        let mv = desc.mass_times(&v, 1.0).unwrap();
        let back = desc.inverse_mass_times(&mv).unwrap();
        for i in 0..13 {
            assert_relative_eq!(back[i], v[i], epsilon = 1e-12);
        }

        let scaled = desc.mass_times(&v, 2.0).unwrap();
        assert_relative_eq!(scaled[12], 2.0 * 0.5 * 13.0, epsilon = 1e-12);
    }

    #[test]
    fn test_gather_scatter_and_residuals() {
        let (mut desc, _, _) = two_row_system();
        let state = desc.gather_state();
        assert_relative_eq!(state[0], 1.0, epsilon = 1e-15);
        assert_relative_eq!(state[12], 2.0, epsilon = 1e-15);

        // first: 1.0 + 0.5 - 2.0, second: 0 + 2.0
        let residuals = desc.residuals();
        assert_relative_eq!(residuals[0], -0.5, epsilon = 1e-12);
        assert_relative_eq!(residuals[1], 2.0, epsilon = 1e-12);

        desc.set_rhs(&DVector::from_vec(vec![0.5, 1.0])).unwrap();
        let residuals = desc.residuals();
        assert_relative_eq!(residuals[0], 0.0, epsilon = 1e-12);
        assert_relative_eq!(residuals[1], 3.0, epsilon = 1e-12);

        let mut zero = DVector::zeros(13);
        zero[12] = 4.0;
        desc.scatter_state(&zero).unwrap();
        assert_relative_eq!(desc.blocks().iter().nth(2).unwrap().1.state()[0], 4.0);
    }

    #[test]
    fn test_dimension_mismatch() {
        let (mut desc, _, _) = two_row_system();
        let err = desc.jacobian_times(&DVector::zeros(3)).unwrap_err();
        assert_eq!(
            err,
            ConstraintError::DimensionMismatch {
                what: "J v operand",
                expected: 13,
                actual: 3
            }
        );
        assert!(desc.set_multipliers(&DVector::zeros(5)).is_err());
        assert!(desc.scatter_state(&DVector::zeros(12)).is_err());
    }

    #[test]
    fn test_multipliers_round_trip() {
        let (mut desc, first, _) = two_row_system();
        desc.set_multipliers(&DVector::from_vec(vec![3.0, 4.0])).unwrap();
        assert_relative_eq!(desc.constraint(first).unwrap().multiplier(), 3.0);
        assert_eq!(desc.multipliers(), DVector::from_vec(vec![3.0, 4.0]));
    }
}
