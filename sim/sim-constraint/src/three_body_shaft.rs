//! Scalar constraint coupling two rigid bodies and one shaft.
//!
//! Typical uses are drivelines where a shaft angle is tied to the relative
//! rotation of two bodies (a motor housing on a chassis, a differential
//! carrier, a steering rack). The row is
//!
//! ```text
//! C(q) : Cq_a · v_a + Cq_b · v_b + Cq_c · ω_c
//!        (1×6)        (1×6)        (1×1)
//! ```
//!
//! # Auxiliary Data
//!
//! `Eq_i = M_i⁻¹ Cq_iᵀ` and the effective mass `g` are a cache. The cache is
//! fresh only for the Jacobians, bindings and block stamps it was computed
//! from; [`ThreeBodyShaftConstraint::increment_state`] refuses a stale cache.
//!
//! # Persistence
//!
//! Only the type tag, archive version and `cfm` are persisted. Jacobians and
//! bindings are runtime data: a deserialized constraint is unbound and invalid
//! until [`bind`](ThreeBodyShaftConstraint::bind) is called again.

use nalgebra::{DVector, RowVector6, Vector6};
use tracing::warn;

use crate::{
    BlockId, BlockKind, BlockSet, BlockStamp, Constraint, ConstraintCore, ConstraintError,
    ConstraintKind, ConstraintResult, PasteMode, SparseSink, StateBlock,
};

/// Current archive version written by serialization.
pub const THREE_BODY_SHAFT_ARCHIVE_VERSION: u32 = 1;

const SLOT_DOF: [usize; 3] = [6, 6, 1];

#[derive(Debug, Clone, Default, PartialEq)]
enum Auxiliary {
    #[default]
    Stale,
    Fresh {
        eq_a: Vector6<f64>,
        eq_b: Vector6<f64>,
        eq_c: f64,
        stamps: [Option<BlockStamp>; 3],
    },
}

/// Constraint row between rigid bodies A, B and shaft C.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ThreeBodyShaftConstraint {
    core: ConstraintCore,
    blocks: Option<[BlockId; 3]>,
    cq_a: RowVector6<f64>,
    cq_b: RowVector6<f64>,
    cq_c: [f64; 1],
    auxiliary: Auxiliary,
}

impl ThreeBodyShaftConstraint {
    /// Create a constraint bound to `a`, `b` (rigid bodies) and `c` (shaft).
    ///
    /// # Errors
    ///
    /// Returns [`ConstraintError::NullBlock`] or
    /// [`ConstraintError::IncompatibleBlockType`] if the binding fails.
    pub fn new(blocks: &BlockSet, a: BlockId, b: BlockId, c: BlockId) -> ConstraintResult<Self> {
        let mut constraint = Self::unbound();
        constraint.bind(blocks, a, b, c)?;
        Ok(constraint)
    }

    /// Create an invalid constraint with no bindings.
    #[must_use]
    pub fn unbound() -> Self {
        Self::default()
    }

    /// Builder: set constraint force mixing.
    #[must_use]
    pub fn with_cfm(mut self, cfm: f64) -> Self {
        self.core.cfm = cfm;
        self
    }

    /// Bind (or rebind) to three blocks and zero all Jacobian segments.
    ///
    /// A and B must be 6-DOF rigid-body blocks; C must have exactly one DOF.
    /// On failure the constraint is left unbound and invalid, so it acts as a
    /// neutral element in any system it belongs to.
    ///
    /// # Errors
    ///
    /// Returns [`ConstraintError::NullBlock`] if an id refers to no block, or
    /// [`ConstraintError::IncompatibleBlockType`] on a kind or DOF mismatch.
    pub fn bind(
        &mut self,
        blocks: &BlockSet,
        a: BlockId,
        b: BlockId,
        c: BlockId,
    ) -> ConstraintResult<()> {
        self.unbind();

        let ids = [a, b, c];
        for (slot, &id) in ids.iter().enumerate() {
            let result = blocks
                .get(id)
                .ok_or(ConstraintError::NullBlock { slot, id: id.raw() })
                .and_then(|block| check_slot(slot, block));
            if let Err(err) = result {
                warn!(%err, "three-body shaft constraint left unbound");
                return Err(err);
            }
        }

        self.blocks = Some(ids);
        self.core.valid = true;
        Ok(())
    }

    /// Drop the bindings and mark the constraint invalid.
    pub fn unbind(&mut self) {
        self.blocks = None;
        self.core.valid = false;
        self.core.g = 0.0;
        self.cq_a = RowVector6::zeros();
        self.cq_b = RowVector6::zeros();
        self.cq_c = [0.0];
        self.auxiliary = Auxiliary::Stale;
    }

    /// Bound block ids `(a, b, c)`.
    #[must_use]
    pub fn block_ids(&self) -> Option<[BlockId; 3]> {
        self.blocks
    }

    /// Jacobian segment of body A.
    #[must_use]
    pub fn jacobian_a(&self) -> &RowVector6<f64> {
        &self.cq_a
    }

    /// Jacobian segment of body B.
    #[must_use]
    pub fn jacobian_b(&self) -> &RowVector6<f64> {
        &self.cq_b
    }

    /// Jacobian entry of shaft C.
    #[must_use]
    pub fn jacobian_c(&self) -> f64 {
        self.cq_c[0]
    }

    /// Set the Jacobian segment of body A.
    pub fn set_jacobian_a(&mut self, row: RowVector6<f64>) {
        self.cq_a = row;
        self.auxiliary = Auxiliary::Stale;
    }

    /// Set the Jacobian segment of body B.
    pub fn set_jacobian_b(&mut self, row: RowVector6<f64>) {
        self.cq_b = row;
        self.auxiliary = Auxiliary::Stale;
    }

    /// Set the Jacobian entry of shaft C.
    pub fn set_jacobian_c(&mut self, value: f64) {
        self.cq_c = [value];
        self.auxiliary = Auxiliary::Stale;
    }

    /// `(Eq_a, Eq_b, Eq_c)` if the cache was computed and not invalidated since.
    #[must_use]
    pub fn auxiliary(&self, blocks: &BlockSet) -> Option<(Vector6<f64>, Vector6<f64>, f64)> {
        if !self.is_auxiliary_fresh(blocks) {
            return None;
        }
        match &self.auxiliary {
            Auxiliary::Fresh { eq_a, eq_b, eq_c, .. } => Some((*eq_a, *eq_b, *eq_c)),
            Auxiliary::Stale => None,
        }
    }

    /// Active bound block of a slot.
    fn active_block<'a>(&self, blocks: &'a BlockSet, slot: usize) -> Option<&'a dyn StateBlock> {
        if !self.core.valid {
            return None;
        }
        self.blocks.and_then(|ids| blocks.active(ids[slot]))
    }

    fn segment(&self, slot: usize) -> &[f64] {
        match slot {
            0 => self.cq_a.as_slice(),
            1 => self.cq_b.as_slice(),
            _ => &self.cq_c,
        }
    }
}

fn check_slot(slot: usize, block: &dyn StateBlock) -> ConstraintResult<()> {
    let ok = match slot {
        0 | 1 => block.kind() == BlockKind::RigidBody && block.dof() == 6,
        _ => block.dof() == 1,
    };
    if ok {
        Ok(())
    } else {
        Err(ConstraintError::IncompatibleBlockType {
            slot,
            expected: if slot < 2 { "6-DOF rigid body" } else { "1-DOF shaft" },
            actual: block.kind(),
            dof: block.dof(),
        })
    }
}

impl Constraint for ThreeBodyShaftConstraint {
    fn kind(&self) -> ConstraintKind {
        ConstraintKind::ThreeBodyShaft
    }

    fn core(&self) -> &ConstraintCore {
        &self.core
    }

    fn core_mut(&mut self) -> &mut ConstraintCore {
        &mut self.core
    }

    fn bound_blocks(&self) -> Vec<BlockId> {
        self.blocks.map(|ids| ids.to_vec()).unwrap_or_default()
    }

    fn jacobian(&self, slot: usize) -> Option<&[f64]> {
        (slot < 3).then(|| self.segment(slot))
    }

    fn set_jacobian(&mut self, slot: usize, row: &[f64]) -> ConstraintResult<()> {
        let expected = SLOT_DOF.get(slot).copied().unwrap_or(0);
        if expected == 0 || row.len() != expected {
            return Err(ConstraintError::InvalidSlot {
                slot,
                expected,
                actual: row.len(),
            });
        }
        match slot {
            0 => self.set_jacobian_a(RowVector6::from_row_slice(row)),
            1 => self.set_jacobian_b(RowVector6::from_row_slice(row)),
            _ => self.set_jacobian_c(row[0]),
        }
        Ok(())
    }

    fn is_auxiliary_fresh(&self, blocks: &BlockSet) -> bool {
        let (Some(ids), Auxiliary::Fresh { stamps, .. }) = (self.blocks, &self.auxiliary) else {
            return false;
        };
        self.core.valid
            && ids
                .iter()
                .zip(stamps)
                .all(|(&id, stamp)| blocks.stamp(id) == *stamp)
    }

    fn update_auxiliary(&mut self, blocks: &BlockSet) {
        let Some(ids) = self.blocks.filter(|_| self.core.valid) else {
            return;
        };

        // 1. Eq_i = M_i⁻¹ Cq_iᵀ for active blocks, zero otherwise
        let mut eq_a = Vector6::zeros();
        let mut eq_b = Vector6::zeros();
        let mut eq_c = [0.0];
        if let Some(block) = self.active_block(blocks, 0) {
            block.apply_inverse_mass(self.cq_a.as_slice(), eq_a.as_mut_slice());
        }
        if let Some(block) = self.active_block(blocks, 1) {
            block.apply_inverse_mass(self.cq_b.as_slice(), eq_b.as_mut_slice());
        }
        if let Some(block) = self.active_block(blocks, 2) {
            block.apply_inverse_mass(&self.cq_c, &mut eq_c);
        }

        // 2. g = Σ Cq_i · Eq_i (+ cfm)
        let mut g = self.cq_a.dot(&eq_a.transpose())
            + self.cq_b.dot(&eq_b.transpose())
            + self.cq_c[0] * eq_c[0];
        if self.core.cfm != 0.0 {
            g += self.core.cfm;
        }
        self.core.g = g;

        self.auxiliary = Auxiliary::Fresh {
            eq_a,
            eq_b,
            eq_c: eq_c[0],
            stamps: ids.map(|id| blocks.stamp(id)),
        };
    }

    fn compute_jacobian_times_state(&self, blocks: &BlockSet) -> f64 {
        let mut ret = 0.0;
        if let Some(block) = self.active_block(blocks, 0) {
            ret += self.cq_a.tr_dot(&Vector6::from_column_slice(block.state()));
        }
        if let Some(block) = self.active_block(blocks, 1) {
            ret += self.cq_b.tr_dot(&Vector6::from_column_slice(block.state()));
        }
        if let Some(block) = self.active_block(blocks, 2) {
            ret += self.cq_c[0] * block.state()[0];
        }
        ret
    }

    fn increment_state(&self, blocks: &mut BlockSet, delta: f64) -> ConstraintResult<()> {
        let Some(ids) = self.blocks.filter(|_| self.core.valid) else {
            return Ok(());
        };
        if !self.is_auxiliary_fresh(blocks) {
            return Err(ConstraintError::StaleAuxiliary);
        }
        let Auxiliary::Fresh { eq_a, eq_b, eq_c, .. } = &self.auxiliary else {
            return Err(ConstraintError::StaleAuxiliary);
        };

        if let Some(block) = blocks.active_mut(ids[0]) {
            for (s, e) in block.state_mut().iter_mut().zip(eq_a.iter()) {
                *s += e * delta;
            }
        }
        if let Some(block) = blocks.active_mut(ids[1]) {
            for (s, e) in block.state_mut().iter_mut().zip(eq_b.iter()) {
                *s += e * delta;
            }
        }
        if let Some(block) = blocks.active_mut(ids[2]) {
            block.state_mut()[0] += eq_c * delta;
        }
        Ok(())
    }

    fn add_jacobian_times_vector_into(
        &self,
        blocks: &BlockSet,
        result: &mut f64,
        vect: &DVector<f64>,
    ) {
        if let Some(block) = self.active_block(blocks, 0) {
            *result += self.cq_a.tr_dot(&vect.fixed_rows::<6>(block.offset()));
        }
        if let Some(block) = self.active_block(blocks, 1) {
            *result += self.cq_b.tr_dot(&vect.fixed_rows::<6>(block.offset()));
        }
        if let Some(block) = self.active_block(blocks, 2) {
            *result += self.cq_c[0] * vect[block.offset()];
        }
    }

    fn add_jacobian_transposed_times_scalar_into(
        &self,
        blocks: &BlockSet,
        result: &mut DVector<f64>,
        l: f64,
    ) {
        for slot in 0..3 {
            if let Some(block) = self.active_block(blocks, slot) {
                let off = block.offset();
                for (j, c) in self.segment(slot).iter().enumerate() {
                    result[off + j] += c * l;
                }
            }
        }
    }

    fn paste_jacobian_into(
        &self,
        blocks: &BlockSet,
        sink: &mut dyn SparseSink,
        start_row: usize,
        start_col: usize,
    ) {
        for slot in 0..3 {
            if let Some(block) = self.active_block(blocks, slot) {
                sink.paste_row(
                    start_row,
                    block.offset() + start_col,
                    self.segment(slot),
                    PasteMode::Overwrite,
                );
            }
        }
    }

    fn paste_jacobian_transposed_into(
        &self,
        blocks: &BlockSet,
        sink: &mut dyn SparseSink,
        start_row: usize,
        start_col: usize,
    ) {
        for slot in 0..3 {
            if let Some(block) = self.active_block(blocks, slot) {
                sink.paste_column(
                    block.offset() + start_row,
                    start_col,
                    self.segment(slot),
                    PasteMode::Overwrite,
                );
            }
        }
    }
}

#[cfg(feature = "serde")]
mod archive {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    use super::{THREE_BODY_SHAFT_ARCHIVE_VERSION, ThreeBodyShaftConstraint};
    use crate::{Constraint, ConstraintError, ConstraintKind};

    /// On-disk form: identity and base data only.
    #[derive(Serialize, Deserialize)]
    struct Archive {
        #[serde(rename = "type")]
        kind: ConstraintKind,
        version: u32,
        cfm: f64,
    }

    impl Serialize for ThreeBodyShaftConstraint {
        fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
            Archive {
                kind: self.kind(),
                version: THREE_BODY_SHAFT_ARCHIVE_VERSION,
                cfm: self.cfm(),
            }
            .serialize(serializer)
        }
    }

    impl<'de> Deserialize<'de> for ThreeBodyShaftConstraint {
        fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
            let archive = Archive::deserialize(deserializer)?;
            if archive.kind != ConstraintKind::ThreeBodyShaft {
                return Err(serde::de::Error::custom(ConstraintError::unsupported_archive(
                    format!("expected ThreeBodyShaft, found {}", archive.kind),
                )));
            }
            if archive.version == 0 || archive.version > THREE_BODY_SHAFT_ARCHIVE_VERSION {
                return Err(serde::de::Error::custom(ConstraintError::unsupported_archive(
                    format!("version {} is not supported", archive.version),
                )));
            }
            Ok(ThreeBodyShaftConstraint::unbound().with_cfm(archive.cfm))
        }
    }
}
