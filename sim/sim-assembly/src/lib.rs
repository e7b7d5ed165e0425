//! Position, velocity and acceleration assembly of constrained mechanisms.
//!
//! Before a time integrator starts, the initial state of a constrained
//! mechanism must satisfy its constraints. This crate drives any
//! [`Integrable`] system to such a state in up to three passes:
//!
//! ```text
//! POSITION       Newton on C(x, t) = 0, mass-metric corrections
//! VELOCITY       one implicit step: Cq v + Ct = 0, momentum-consistent
//! ACCELERATION   finite difference of two velocity solves, plus reactions
//! ```
//!
//! Passes always run in that order. Requesting `ACCELERATION` also runs the
//! velocity pass, which the acceleration pass builds on.
//!
//! # Mechanisms
//!
//! [`Integrable`] is the contract between [`AssemblyAnalysis`] and a
//! mechanism: gather and scatter the state, load residuals and constraint
//! values, and solve the saddle-point correction system.
//! [`DescriptorMechanism`] implements it over a
//! [`SystemDescriptor`](sim_constraint::SystemDescriptor) whose constraints
//! are driven by [`Link`]s.
//!
//! # Example
//!
//! ```
//! use nalgebra::RowVector6;
//! use sim_assembly::{
//!     AssemblyAnalysis, AssemblyLevel, AssemblyParams, DescriptorMechanism, LinearCoupling,
//! };
//! use sim_constraint::{RigidBodyBlock, ShaftBlock, SystemDescriptor};
//!
//! let mut system = SystemDescriptor::new();
//! let ground = system.blocks_mut().insert(RigidBodyBlock::unit().fixed());
//! let wheel = system.blocks_mut().insert(RigidBodyBlock::unit());
//! let axle = system.blocks_mut().insert(ShaftBlock::new(1.0)?);
//!
//! let mut mechanism = DescriptorMechanism::new(system);
//! // Axle angle is 0.2 rad ahead of the wheel's rotation about z
//! let spin = RowVector6::new(0.0, 0.0, 0.0, 0.0, 0.0, 1.0);
//! mechanism.add_link(
//!     ground,
//!     wheel,
//!     axle,
//!     LinearCoupling::new(RowVector6::zeros(), -spin, 1.0).with_target(0.2),
//! )?;
//!
//! let params = AssemblyParams::converging();
//! let mut analysis = AssemblyAnalysis::with_params(mechanism, params);
//! let report = analysis.assemble(AssemblyLevel::POSITION)?;
//!
//! assert!(report.position.is_some_and(|p| p.converged()));
//! # Ok::<(), sim_assembly::AssemblyError>(())
//! ```

#![doc(html_root_url = "https://docs.rs/sim-assembly/0.3.0")]
#![deny(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
#![warn(missing_docs)]
#![allow(clippy::missing_const_for_fn)]

mod analysis;
mod error;
mod integrable;
mod level;
mod mechanism;
mod params;
mod report;

pub use analysis::AssemblyAnalysis;
pub use error::{AssemblyError, AssemblyResult};
pub use integrable::{Correction, CorrectionFactors, Integrable};
pub use level::AssemblyLevel;
pub use mechanism::{DescriptorMechanism, LinearCoupling, Link, LinkEvaluation, LinkState};
pub use params::AssemblyParams;
pub use report::{AssemblyReport, PositionReport, PositionStatus};
