//! Constraint Jacobian bookkeeping for rigid bodies and shafts.
//!
//! This crate stores the per-block Jacobian segments of scalar constraints,
//! derives their effective masses, and exposes them to linear solvers either
//! matrix-free or assembled into a sparse matrix.
//!
//! # State Blocks
//!
//! A [`StateBlock`] is a group of generalized coordinates with its own
//! inverse-mass operator:
//!
//! - [`RigidBodyBlock`]: 6 DOF, block-diagonal `diag(m I₃, J)`
//! - [`ShaftBlock`]: 1 DOF, scalar inertia
//!
//! Blocks live in a [`BlockSet`]. A removed block leaves a hole, so any
//! constraint still referring to it is bound to nothing.
//!
//! # Constraints
//!
//! Every constraint implements the [`Constraint`] contract. The provided
//! variant is [`ThreeBodyShaftConstraint`], one row over two rigid bodies and
//! one shaft:
//!
//! ```text
//! Cq · v = Cq_a · v_a + Cq_b · v_b + Cq_c · ω_c
//! g      = Σ_active Cq_i M_i⁻¹ Cq_iᵀ + cfm
//! ```
//!
//! # Solving
//!
//! A [`SystemDescriptor`] numbers blocks into columns and constraints into
//! rows. [`SchurComplementSolver`] and [`GaussSeidelSolver`] implement
//! [`KktSolver`] on top of it.
//!
//! # Example
//!
//! ```
//! use nalgebra::{DVector, RowVector6};
//! use sim_constraint::{
//!     Constraint, KktSolver, RigidBodyBlock, SchurComplementSolver, ShaftBlock,
//!     SystemDescriptor, ThreeBodyShaftConstraint,
//! };
//!
//! let mut system = SystemDescriptor::new();
//! let chassis = system.blocks_mut().insert(RigidBodyBlock::unit());
//! let housing = system.blocks_mut().insert(RigidBodyBlock::unit());
//! let shaft = system.blocks_mut().insert(ShaftBlock::new(0.1)?);
//!
//! // Shaft speed equals the relative spin of the housing about z
//! let mut motor = ThreeBodyShaftConstraint::new(system.blocks(), chassis, housing, shaft)?;
//! motor.set_jacobian_a(RowVector6::new(0.0, 0.0, 0.0, 0.0, 0.0, 1.0));
//! motor.set_jacobian_b(RowVector6::new(0.0, 0.0, 0.0, 0.0, 0.0, -1.0));
//! motor.set_jacobian_c(1.0);
//! let motor = system.add_constraint(motor);
//!
//! let n = system.assign_offsets();
//! let mut solver = SchurComplementSolver::default();
//! let solution = solver.solve(&mut system, &DVector::zeros(n), &DVector::from_vec(vec![0.5]))?;
//!
//! assert!(solution.residual_norm < 1e-6);
//! assert!(system.constraint(motor).is_some_and(|c| c.multiplier() != 0.0));
//! # Ok::<(), sim_constraint::ConstraintError>(())
//! ```

#![doc(html_root_url = "https://docs.rs/sim-constraint/0.3.0")]
#![deny(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
#![warn(missing_docs)]
#![allow(clippy::missing_const_for_fn)]

mod block;
mod constraint;
mod descriptor;
mod error;
mod solver;
mod sparse;
mod three_body_shaft;

pub use block::{BlockId, BlockKind, BlockSet, BlockStamp, RigidBodyBlock, ShaftBlock, StateBlock};
pub use constraint::{Constraint, ConstraintCore, ConstraintId, ConstraintKind};
pub use descriptor::SystemDescriptor;
pub use error::{ConstraintError, ConstraintResult};
pub use solver::{
    GaussSeidelConfig, GaussSeidelSolver, KktSolution, KktSolver, SchurComplementConfig,
    SchurComplementSolver,
};
pub use sparse::{PasteMode, SparseJacobian, SparseSink, TripletSink};
pub use three_body_shaft::{THREE_BODY_SHAFT_ARCHIVE_VERSION, ThreeBodyShaftConstraint};
