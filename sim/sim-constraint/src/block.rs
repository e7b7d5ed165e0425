//! State blocks and the arena that owns them.
//!
//! A state block is the set of generalized velocities of one independent
//! physical entity: a 6-DOF rigid body, a 1-DOF rotational shaft, or any other
//! variant that implements [`StateBlock`]. Constraints never hold references to
//! blocks; they hold [`BlockId`] handles into a [`BlockSet`].
//!
//! # Inverse Mass Operators
//!
//! ```text
//! RigidBodyBlock:  M⁻¹ = [1/m · I₃      0  ]
//!                        [   0       I⁻¹   ]
//! ShaftBlock:      M⁻¹ = 1/J
//! ```

use std::fmt;

use nalgebra::{Matrix3, Vector3, Vector6};

use crate::{ConstraintError, ConstraintResult};

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

/// Handle to a block stored in a [`BlockSet`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct BlockId(pub usize);

impl BlockId {
    /// Create a new block ID.
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

impl From<usize> for BlockId {
    fn from(id: usize) -> Self {
        Self(id)
    }
}

impl fmt::Display for BlockId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Block({})", self.0)
    }
}

/// Variant of a state block.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum BlockKind {
    /// 6-DOF rigid body (3 linear + 3 angular).
    RigidBody,
    /// 1-DOF rotational shaft.
    Shaft,
    /// Anything else.
    Generic,
}

/// Capability contract of a block of generalized coordinates.
///
/// `state` is the solver-level vector of length [`dof`](StateBlock::dof).
/// Implementations must bump [`revision`](StateBlock::revision) whenever the
/// mass operator or the activity flag changes.
pub trait StateBlock: fmt::Debug + Send {
    /// Variant of this block.
    fn kind(&self) -> BlockKind;

    /// Number of degrees of freedom.
    fn dof(&self) -> usize;

    /// Whether the block participates in assembly.
    fn is_active(&self) -> bool;

    /// Include or exclude the block from assembly.
    fn set_active(&mut self, active: bool);

    /// Offset of the first coordinate in the assembled system vector.
    fn offset(&self) -> usize;

    /// Set the offset in the assembled system vector.
    fn set_offset(&mut self, offset: usize);

    /// Solver state vector.
    fn state(&self) -> &[f64];

    /// Mutable solver state vector.
    fn state_mut(&mut self) -> &mut [f64];

    /// Compute `out = M⁻¹ · input`.
    fn apply_inverse_mass(&self, input: &[f64], out: &mut [f64]);

    /// Compute `out += c · M · input`.
    fn add_mass_times(&self, input: &[f64], out: &mut [f64], c: f64);

    /// Change counter for the mass operator and activity flag.
    fn revision(&self) -> u64;
}

fn check_positive(value: f64, what: &str) -> ConstraintResult<()> {
    if value.is_finite() && value > 0.0 {
        Ok(())
    } else {
        Err(ConstraintError::invalid_mass(format!(
            "{what} must be positive and finite, got {value}"
        )))
    }
}

// ============================================================================
// Rigid Body Block
// ============================================================================

/// 6-DOF rigid-body block with block-diagonal mass operator.
#[derive(Debug, Clone, PartialEq)]
pub struct RigidBodyBlock {
    mass: f64,
    inertia: Matrix3<f64>,
    inv_mass: f64,
    inv_inertia: Matrix3<f64>,
    state: Vector6<f64>,
    offset: usize,
    active: bool,
    revision: u64,
}

impl RigidBodyBlock {
    /// Create a rigid-body block from mass and world-frame inertia tensor.
    ///
    /// # Errors
    ///
    /// Returns [`ConstraintError::InvalidMass`] if the mass is not positive or
    /// the inertia tensor is not symmetric positive definite.
    pub fn new(mass: f64, inertia: Matrix3<f64>) -> ConstraintResult<Self> {
        check_positive(mass, "mass")?;
        let asymmetry = (inertia - inertia.transpose()).amax();
        if !inertia.iter().all(|v| v.is_finite()) || asymmetry > 1e-9 * inertia.amax().max(1.0) {
            return Err(ConstraintError::invalid_mass(
                "inertia tensor must be finite and symmetric",
            ));
        }
        let inv_inertia = inertia
            .cholesky()
            .map(|chol| chol.inverse())
            .ok_or_else(|| {
                ConstraintError::invalid_mass("inertia tensor must be positive definite")
            })?;

        Ok(Self {
            mass,
            inertia,
            inv_mass: 1.0 / mass,
            inv_inertia,
            state: Vector6::zeros(),
            offset: 0,
            active: true,
            revision: 0,
        })
    }

    /// Create a block with diagonal (principal) inertia.
    ///
    /// # Errors
    ///
    /// Returns [`ConstraintError::InvalidMass`] on non-positive values.
    pub fn with_principal_inertia(mass: f64, principal: Vector3<f64>) -> ConstraintResult<Self> {
        Self::new(mass, Matrix3::from_diagonal(&principal))
    }

    /// Create a block with unit mass and identity inertia.
    #[must_use]
    pub fn unit() -> Self {
        Self {
            mass: 1.0,
            inertia: Matrix3::identity(),
            inv_mass: 1.0,
            inv_inertia: Matrix3::identity(),
            state: Vector6::zeros(),
            offset: 0,
            active: true,
            revision: 0,
        }
    }

    /// Mass.
    #[must_use]
    pub fn mass(&self) -> f64 {
        self.mass
    }

    /// Inertia tensor.
    #[must_use]
    pub fn inertia(&self) -> &Matrix3<f64> {
        &self.inertia
    }

    /// Inverse inertia tensor.
    #[must_use]
    pub fn inv_inertia(&self) -> &Matrix3<f64> {
        &self.inv_inertia
    }

    /// Replace mass and inertia.
    ///
    /// # Errors
    ///
    /// Returns [`ConstraintError::InvalidMass`] and leaves the block unchanged
    /// if the new values are invalid.
    pub fn set_mass_properties(
        &mut self,
        mass: f64,
        inertia: Matrix3<f64>,
    ) -> ConstraintResult<()> {
        let fresh = Self::new(mass, inertia)?;
        self.mass = fresh.mass;
        self.inertia = fresh.inertia;
        self.inv_mass = fresh.inv_mass;
        self.inv_inertia = fresh.inv_inertia;
        self.revision += 1;
        Ok(())
    }

    /// Builder: start inactive (grounded).
    #[must_use]
    pub fn fixed(mut self) -> Self {
        self.active = false;
        self
    }

    /// Builder: set the initial state.
    #[must_use]
    pub fn with_state(mut self, state: Vector6<f64>) -> Self {
        self.state = state;
        self
    }
}

impl StateBlock for RigidBodyBlock {
    fn kind(&self) -> BlockKind {
        BlockKind::RigidBody
    }

    fn dof(&self) -> usize {
        6
    }

    fn is_active(&self) -> bool {
        self.active
    }

    fn set_active(&mut self, active: bool) {
        if self.active != active {
            self.active = active;
            self.revision += 1;
        }
    }

    fn offset(&self) -> usize {
        self.offset
    }

    fn set_offset(&mut self, offset: usize) {
        self.offset = offset;
    }

    fn state(&self) -> &[f64] {
        self.state.as_slice()
    }

    fn state_mut(&mut self) -> &mut [f64] {
        self.state.as_mut_slice()
    }

    fn apply_inverse_mass(&self, input: &[f64], out: &mut [f64]) {
        debug_assert_eq!(input.len(), 6);
        debug_assert_eq!(out.len(), 6);
        for i in 0..3 {
            out[i] = self.inv_mass * input[i];
        }
        let angular = self.inv_inertia * Vector3::new(input[3], input[4], input[5]);
        out[3..6].copy_from_slice(angular.as_slice());
    }

    fn add_mass_times(&self, input: &[f64], out: &mut [f64], c: f64) {
        debug_assert_eq!(input.len(), 6);
        debug_assert_eq!(out.len(), 6);
        for i in 0..3 {
            out[i] += c * self.mass * input[i];
        }
        let angular = self.inertia * Vector3::new(input[3], input[4], input[5]);
        for i in 0..3 {
            out[3 + i] += c * angular[i];
        }
    }

    fn revision(&self) -> u64 {
        self.revision
    }
}

// ============================================================================
// Shaft Block
// ============================================================================

/// 1-DOF rotational shaft block.
#[derive(Debug, Clone, PartialEq)]
pub struct ShaftBlock {
    inertia: f64,
    inv_inertia: f64,
    state: [f64; 1],
    offset: usize,
    active: bool,
    revision: u64,
}

impl ShaftBlock {
    /// Create a shaft with the given rotational inertia.
    ///
    /// # Errors
    ///
    /// Returns [`ConstraintError::InvalidMass`] if the inertia is not positive.
    pub fn new(inertia: f64) -> ConstraintResult<Self> {
        check_positive(inertia, "shaft inertia")?;
        Ok(Self {
            inertia,
            inv_inertia: 1.0 / inertia,
            state: [0.0],
            offset: 0,
            active: true,
            revision: 0,
        })
    }

    /// Rotational inertia.
    #[must_use]
    pub fn inertia(&self) -> f64 {
        self.inertia
    }

    /// Replace the rotational inertia.
    ///
    /// # Errors
    ///
    /// Returns [`ConstraintError::InvalidMass`] if the inertia is not positive.
    pub fn set_inertia(&mut self, inertia: f64) -> ConstraintResult<()> {
        check_positive(inertia, "shaft inertia")?;
        self.inertia = inertia;
        self.inv_inertia = 1.0 / inertia;
        self.revision += 1;
        Ok(())
    }

    /// Builder: start inactive (grounded).
    #[must_use]
    pub fn fixed(mut self) -> Self {
        self.active = false;
        self
    }

    /// Builder: set the initial state.
    #[must_use]
    pub fn with_state(mut self, value: f64) -> Self {
        self.state[0] = value;
        self
    }
}

impl StateBlock for ShaftBlock {
    fn kind(&self) -> BlockKind {
        BlockKind::Shaft
    }

    fn dof(&self) -> usize {
        1
    }

    fn is_active(&self) -> bool {
        self.active
    }

    fn set_active(&mut self, active: bool) {
        if self.active != active {
            self.active = active;
            self.revision += 1;
        }
    }

    fn offset(&self) -> usize {
        self.offset
    }

    fn set_offset(&mut self, offset: usize) {
        self.offset = offset;
    }

    fn state(&self) -> &[f64] {
        &self.state
    }

    fn state_mut(&mut self) -> &mut [f64] {
        &mut self.state
    }

    fn apply_inverse_mass(&self, input: &[f64], out: &mut [f64]) {
        out[0] = self.inv_inertia * input[0];
    }

    fn add_mass_times(&self, input: &[f64], out: &mut [f64], c: f64) {
        out[0] += c * self.inertia * input[0];
    }

    fn revision(&self) -> u64 {
        self.revision
    }
}

// ============================================================================
// Block Set
// ============================================================================

/// Identity of a block's mass operator at one point in time.
///
/// Two stamps taken from the same id compare equal only if the block's mass
/// operator and activity have not changed in between. Ids are never reused,
/// so the id together with the revision pins down one block state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BlockStamp {
    revision: u64,
}

/// Arena of state blocks addressed by [`BlockId`].
///
/// Removing a block leaves a hole; ids are never reused, so a removed id acts
/// as a null reference for every constraint still holding it.
#[derive(Debug, Default)]
pub struct BlockSet {
    slots: Vec<Option<Box<dyn StateBlock>>>,
    num_coords: usize,
}

impl BlockSet {
    /// Create an empty set.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a block and return its handle.
    pub fn insert(&mut self, block: impl StateBlock + 'static) -> BlockId {
        self.insert_boxed(Box::new(block))
    }

    /// Insert an already boxed block.
    pub fn insert_boxed(&mut self, block: Box<dyn StateBlock>) -> BlockId {
        let id = BlockId(self.slots.len());
        self.slots.push(Some(block));
        id
    }

    /// Remove a block, leaving a hole.
    pub fn remove(&mut self, id: BlockId) -> Option<Box<dyn StateBlock>> {
        self.slots.get_mut(id.0).and_then(Option::take)
    }

    /// Look up a block.
    #[must_use]
    pub fn get(&self, id: BlockId) -> Option<&dyn StateBlock> {
        self.slots
            .get(id.0)
            .and_then(Option::as_ref)
            .map(|block| &**block)
    }

    /// Look up a block mutably.
    pub fn get_mut(&mut self, id: BlockId) -> Option<&mut (dyn StateBlock + 'static)> {
        self.slots
            .get_mut(id.0)
            .and_then(Option::as_mut)
            .map(|block| &mut **block)
    }

    /// Look up a block only if it is active.
    #[must_use]
    pub fn active(&self, id: BlockId) -> Option<&dyn StateBlock> {
        self.get(id).filter(|block| block.is_active())
    }

    /// Look up an active block mutably.
    pub fn active_mut(&mut self, id: BlockId) -> Option<&mut (dyn StateBlock + 'static)> {
        self.get_mut(id).filter(|block| block.is_active())
    }

    /// Whether a block exists for this id.
    #[must_use]
    pub fn contains(&self, id: BlockId) -> bool {
        self.get(id).is_some()
    }

    /// Current stamp of a block, or `None` for a hole.
    #[must_use]
    pub fn stamp(&self, id: BlockId) -> Option<BlockStamp> {
        self.get(id).map(|block| BlockStamp {
            revision: block.revision(),
        })
    }

    /// Number of live blocks.
    #[must_use]
    pub fn len(&self) -> usize {
        self.slots.iter().filter(|slot| slot.is_some()).count()
    }

    /// Whether the set holds no blocks.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Iterate over live blocks with their ids.
    pub fn iter(&self) -> impl Iterator<Item = (BlockId, &dyn StateBlock)> {
        self.slots.iter().enumerate().filter_map(|(i, slot)| {
            slot.as_ref().map(|block| (BlockId(i), block.as_ref()))
        })
    }

    /// Iterate over active blocks with their ids.
    pub fn iter_active(&self) -> impl Iterator<Item = (BlockId, &dyn StateBlock)> {
        self.iter().filter(|(_, block)| block.is_active())
    }

    /// Assign contiguous offsets to active blocks in insertion order.
    ///
    /// Returns the number of coordinates of the assembled system. Inactive
    /// blocks keep whatever offset they had and contribute no columns.
    pub fn assign_offsets(&mut self) -> usize {
        let mut offset = 0;
        for block in self.slots.iter_mut().flatten() {
            if block.is_active() {
                block.set_offset(offset);
                offset += block.dof();
            }
        }
        self.num_coords = offset;
        offset
    }

    /// Coordinate count from the last [`assign_offsets`](Self::assign_offsets).
    #[must_use]
    pub fn num_coords(&self) -> usize {
        self.num_coords
    }
}
