//! The assembly driver.
//!
//! [`AssemblyAnalysis`] brings a mechanism into a state that satisfies its
//! constraints at the position, velocity and acceleration levels.
//!
//! # Passes
//!
//! **Position**: Newton-Raphson on the constraint violation. Each iteration
//! loads `Qc = C`, solves the mass-metric correction with `R = 0` and factors
//! `(1, 0, 0)`, and applies `x ← x ⊕ Dx`.
//!
//! **Velocity**: one linearly implicit step of length `dt`:
//!
//! ```text
//! R  = dt · F + M v
//! Qc = C / dt + Ct          factors (1, −dt, −dt²)
//! ```
//!
//! The solved `Dv` is the new velocity, and `L / dt` are the reactions.
//!
//! **Acceleration**: finite differencing over one step. The mechanism is
//! moved to the offset state `x ⊕ dt · v₁` at `t + dt`, where a second
//! velocity solve from `v₁` with `Qc = Ct` gives `v₂`:
//!
//! ```text
//! Cq⁺ v₂ + Ct⁺ = 0          a = (v₂ − v₁) / dt
//! ```
//!
//! At first order this is `Cq a + Ċq v₁ + Ctt = 0`, so centripetal and
//! rheonomic terms show up in `a`. The mechanism is then restored to
//! `(x, v₁, t)`.
//!
//! # Example
//!
//! ```
//! use nalgebra::RowVector6;
//! use sim_assembly::{AssemblyAnalysis, AssemblyLevel, DescriptorMechanism, LinearCoupling};
//! use sim_constraint::{RigidBodyBlock, ShaftBlock, SystemDescriptor};
//!
//! let mut system = SystemDescriptor::new();
//! let ground = system.blocks_mut().insert(RigidBodyBlock::unit().fixed());
//! let rotor = system.blocks_mut().insert(RigidBodyBlock::unit());
//! let shaft = system.blocks_mut().insert(ShaftBlock::new(0.5)?);
//!
//! let mut mechanism = DescriptorMechanism::new(system);
//! // Shaft angle follows the rotor's rotation about z
//! mechanism.add_link(
//!     ground,
//!     rotor,
//!     shaft,
//!     LinearCoupling::new(
//!         RowVector6::zeros(),
//!         RowVector6::new(0.0, 0.0, 0.0, 0.0, 0.0, 1.0),
//!         -1.0,
//!     ),
//! )?;
//!
//! let mut analysis = AssemblyAnalysis::new(mechanism);
//! let report = analysis.assemble(AssemblyLevel::FULL)?;
//! assert_eq!(report.levels, AssemblyLevel::FULL);
//! # Ok::<(), sim_assembly::AssemblyError>(())
//! ```

use nalgebra::DVector;
use tracing::{debug, info, warn};

use crate::{
    AssemblyError, AssemblyLevel, AssemblyParams, AssemblyReport, AssemblyResult, Correction,
    CorrectionFactors, Integrable, PositionReport, PositionStatus,
};

/// Multi-level assembly of one mechanism.
///
/// The snapshots `x`, `v`, `a` and `l` are overwritten by every call to
/// [`assemble`](Self::assemble).
#[derive(Debug)]
pub struct AssemblyAnalysis<M> {
    mechanism: M,
    params: AssemblyParams,
    x: DVector<f64>,
    v: DVector<f64>,
    a: DVector<f64>,
    l: DVector<f64>,
}

fn check_len(what: &'static str, expected: usize, actual: usize) -> AssemblyResult<()> {
    if expected == actual {
        Ok(())
    } else {
        Err(AssemblyError::dimension_mismatch(what, expected, actual))
    }
}

fn is_finite(v: &DVector<f64>) -> bool {
    v.iter().all(|x| x.is_finite())
}

impl<M: Integrable> AssemblyAnalysis<M> {
    /// Create an analysis with default parameters.
    #[must_use]
    pub fn new(mechanism: M) -> Self {
        Self::with_params(mechanism, AssemblyParams::default())
    }

    /// Create an analysis with the given parameters.
    #[must_use]
    pub fn with_params(mechanism: M, params: AssemblyParams) -> Self {
        Self {
            mechanism,
            params,
            x: DVector::zeros(0),
            v: DVector::zeros(0),
            a: DVector::zeros(0),
            l: DVector::zeros(0),
        }
    }

    /// The mechanism.
    #[must_use]
    pub fn mechanism(&self) -> &M {
        &self.mechanism
    }

    /// The mechanism, mutable.
    pub fn mechanism_mut(&mut self) -> &mut M {
        &mut self.mechanism
    }

    /// Give the mechanism back.
    #[must_use]
    pub fn into_mechanism(self) -> M {
        self.mechanism
    }

    /// Current parameters.
    #[must_use]
    pub fn params(&self) -> &AssemblyParams {
        &self.params
    }

    /// Replace the parameters.
    pub fn set_params(&mut self, params: AssemblyParams) {
        self.params = params;
    }

    /// Newton iteration budget of the position pass.
    #[must_use]
    pub fn max_assembly_iters(&self) -> usize {
        self.params.max_assembly_iters
    }

    /// Set the Newton iteration budget.
    pub fn set_max_assembly_iters(&mut self, iters: usize) {
        self.params.max_assembly_iters = iters;
    }

    /// Position snapshot.
    #[must_use]
    pub fn x(&self) -> &DVector<f64> {
        &self.x
    }

    /// Velocity snapshot.
    #[must_use]
    pub fn v(&self) -> &DVector<f64> {
        &self.v
    }

    /// Acceleration snapshot (zero unless the acceleration pass ran).
    #[must_use]
    pub fn a(&self) -> &DVector<f64> {
        &self.a
    }

    /// Multipliers from the last solve.
    #[must_use]
    pub fn l(&self) -> &DVector<f64> {
        &self.l
    }

    /// Run the selected passes in the order position, velocity, acceleration.
    ///
    /// # Errors
    ///
    /// Returns [`AssemblyError::InvalidTimestep`] for a bad `dt`,
    /// [`AssemblyError::DimensionMismatch`] if the mechanism produces vectors
    /// of the wrong size, [`AssemblyError::Diverged`] on a non-finite state,
    /// or any error from the mechanism.
    pub fn assemble(&mut self, level: AssemblyLevel) -> AssemblyResult<AssemblyReport> {
        self.params.validate()?;

        info!(
            ?level,
            coords_x = self.mechanism.num_coords_x(),
            coords_v = self.mechanism.num_coords_v(),
            constraints = self.mechanism.num_constraints(),
            "Starting assembly"
        );

        let (x, v, _) = self.gather()?;
        self.x = x;
        self.v = v;
        self.a = DVector::zeros(self.mechanism.num_coords_v());
        self.l = DVector::zeros(self.mechanism.num_constraints());

        let mut report = AssemblyReport::empty();

        if level.contains(AssemblyLevel::POSITION) {
            report.position = Some(self.position_pass()?);
            report.levels |= AssemblyLevel::POSITION;
        }

        if level.runs_velocity() {
            self.velocity_pass()?;
            report.velocity_residual = self.mechanism.velocity_residual();
            report.levels |= AssemblyLevel::VELOCITY;
        }

        if level.contains(AssemblyLevel::ACCELERATION) {
            self.acceleration_pass()?;
            report.levels |= AssemblyLevel::ACCELERATION;
        }

        info!(
            levels = ?report.levels,
            position_residual = ?report.position.as_ref().map(|p| p.residual_norm),
            velocity_residual = ?report.velocity_residual,
            "Assembly complete"
        );

        Ok(report)
    }

    fn gather(&self) -> AssemblyResult<(DVector<f64>, DVector<f64>, f64)> {
        let (x, v, t) = self.mechanism.state_gather();
        check_len("position state", self.mechanism.num_coords_x(), x.len())?;
        check_len("velocity state", self.mechanism.num_coords_v(), v.len())?;
        Ok((x, v, t))
    }

    fn constraint_values(&self) -> AssemblyResult<DVector<f64>> {
        let nc = self.mechanism.num_constraints();
        let mut qc = DVector::zeros(nc);
        self.mechanism.load_constraint_c(&mut qc, 1.0)?;
        check_len("constraint values", nc, qc.len())?;
        Ok(qc)
    }

    fn solve(
        &mut self,
        r: &DVector<f64>,
        qc: &DVector<f64>,
        factors: CorrectionFactors,
        pass: &'static str,
        iteration: usize,
    ) -> AssemblyResult<Correction> {
        let correction = self.mechanism.state_solve_correction(r, qc, factors)?;
        check_len("correction", self.mechanism.num_coords_v(), correction.dv.len())?;
        check_len("multipliers", self.mechanism.num_constraints(), correction.l.len())?;
        if !is_finite(&correction.dv) || !is_finite(&correction.l) {
            return Err(AssemblyError::Diverged { pass, iteration });
        }
        Ok(correction)
    }

    fn position_pass(&mut self) -> AssemblyResult<PositionReport> {
        let budget = self.params.max_assembly_iters;
        let tolerance = self.params.tolerance;
        let mut residual_history = Vec::with_capacity(budget);
        let mut iterations = 0;

        for iteration in 1..=budget {
            let (x, v, t) = self.gather()?;
            let qc = self.constraint_values()?;
            let norm = qc.norm();
            residual_history.push(norm);
            debug!(iteration, residual_norm = norm, "Position iteration");

            if tolerance.is_some_and(|tol| norm <= tol) {
                break;
            }

            let r = DVector::zeros(self.mechanism.num_coords_v());
            let correction =
                self.solve(&r, &qc, CorrectionFactors::mass_only(), "position", iteration)?;

            let x_new = self.mechanism.state_increment(&x, &correction.dv);
            check_len("position state", self.mechanism.num_coords_x(), x_new.len())?;
            if !is_finite(&x_new) {
                return Err(AssemblyError::Diverged {
                    pass: "position",
                    iteration,
                });
            }
            self.mechanism.state_scatter(&x_new, &v, t, true)?;

            self.x = x_new;
            self.v = v;
            self.l = correction.l;
            iterations = iteration;
        }

        let residual_norm = self.constraint_values()?.norm();
        let status = match tolerance {
            Some(tol) if residual_norm <= tol => PositionStatus::Converged,
            Some(tol) => {
                warn!(
                    iterations,
                    residual_norm, tolerance = tol, "Position assembly did not converge"
                );
                PositionStatus::BudgetExhausted
            }
            None => PositionStatus::BudgetExhausted,
        };

        Ok(PositionReport {
            iterations,
            residual_history,
            residual_norm,
            status,
        })
    }

    /// One implicit step of length `dt` from `(x, v)`. Returns `(v_new, L / dt)`.
    ///
    /// `c_factor` weights the position feedback `C` in `Qc`; zero loads
    /// `Ct` alone.
    fn velocity_solve(
        &mut self,
        v: &DVector<f64>,
        c_factor: f64,
        pass: &'static str,
    ) -> AssemblyResult<(DVector<f64>, DVector<f64>)> {
        let dt = self.params.dt;
        let nv = self.mechanism.num_coords_v();
        let nc = self.mechanism.num_constraints();

        let mut r = DVector::zeros(nv);
        self.mechanism.load_residual_f(&mut r, dt)?;
        self.mechanism.load_residual_mv(&mut r, v, 1.0)?;
        check_len("residual", nv, r.len())?;

        let mut qc = DVector::zeros(nc);
        if c_factor != 0.0 {
            self.mechanism.load_constraint_c(&mut qc, c_factor)?;
        }
        self.mechanism.load_constraint_ct(&mut qc, 1.0)?;
        check_len("constraint values", nc, qc.len())?;

        let correction = self.solve(&r, &qc, CorrectionFactors::implicit_step(dt), pass, 1)?;
        Ok((correction.dv, correction.l / dt))
    }

    fn velocity_pass(&mut self) -> AssemblyResult<()> {
        let (x, v, t) = self.gather()?;
        let (v_new, l) = self.velocity_solve(&v, 1.0 / self.params.dt, "velocity")?;
        self.mechanism.state_scatter(&x, &v_new, t, true)?;
        debug!(reactions = l.norm(), "Velocity pass");

        self.x = x;
        self.v = v_new;
        self.l = l;
        Ok(())
    }

    fn acceleration_pass(&mut self) -> AssemblyResult<()> {
        let dt = self.params.dt;
        let (x, v1, t) = self.gather()?;

        let x_ahead = self.mechanism.state_increment(&x, &(&v1 * dt));
        check_len("position state", self.mechanism.num_coords_x(), x_ahead.len())?;
        if !is_finite(&x_ahead) {
            return Err(AssemblyError::Diverged {
                pass: "acceleration",
                iteration: 1,
            });
        }
        self.mechanism.state_scatter(&x_ahead, &v1, t + dt, true)?;

        // C at the offset state is the O(dt²) drift being differenced
        let solved = self.velocity_solve(&v1, 0.0, "acceleration");
        self.mechanism.state_scatter(&x, &v1, t, true)?;
        let (v2, l) = solved?;
        let a = (v2 - &v1) / dt;

        self.mechanism.state_scatter_acceleration(&a);
        self.mechanism.state_scatter_reactions(&l);
        debug!(acceleration = a.norm(), reactions = l.norm(), "Acceleration pass");

        self.x = x;
        self.v = v1;
        self.a = a;
        self.l = l;
        Ok(())
    }
}
