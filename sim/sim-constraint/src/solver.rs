//! Linear solvers for the constraint KKT system.
//!
//! Given a [`SystemDescriptor`], the solvers compute `x` and `λ` such that
//!
//! ```text
//! M x = r + Cqᵀ λ
//! Cq x + E λ = q          E = diag(cfm)
//! ```
//!
//! On return the solved multipliers are stored in the constraints and the
//! solution `x` is written into the active block states.
//!
//! # Solvers
//!
//! - [`SchurComplementSolver`]: direct. Assembles `Cq M⁻¹ Cqᵀ + E` from the
//!   matrix-free products and factorizes it.
//! - [`GaussSeidelSolver`]: iterative. Sweeps the constraints one row at a
//!   time through `compute_residual` and `increment_state`, never forming a
//!   matrix.

use std::fmt;

use nalgebra::{DMatrix, DVector};
use tracing::debug;

use crate::{ConstraintError, ConstraintResult, SystemDescriptor};

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

/// Solution of one KKT solve.
#[derive(Debug, Clone, PartialEq)]
pub struct KktSolution {
    /// Primal unknowns, one per active coordinate.
    pub x: DVector<f64>,
    /// Multipliers, one per active constraint row.
    pub multipliers: DVector<f64>,
    /// Iterations used (1 for direct solvers).
    pub iterations: usize,
    /// `‖Cq x + E λ − q‖` at the solution.
    pub residual_norm: f64,
    /// Whether the solver met its own stopping criterion.
    pub converged: bool,
}

/// A solver for the constraint KKT system.
pub trait KktSolver: fmt::Debug + Send {
    /// Solve for `x` and `λ`. Numbers the descriptor before solving.
    ///
    /// # Errors
    ///
    /// Returns [`ConstraintError::DimensionMismatch`] if `r` or `q` do not
    /// match the descriptor, [`ConstraintError::InvalidConfig`] for a bad
    /// configuration, or a solver-specific failure.
    fn solve(
        &mut self,
        descriptor: &mut SystemDescriptor,
        r: &DVector<f64>,
        q: &DVector<f64>,
    ) -> ConstraintResult<KktSolution>;
}

fn check_sizes(
    descriptor: &mut SystemDescriptor,
    r: &DVector<f64>,
    q: &DVector<f64>,
) -> ConstraintResult<()> {
    let n = descriptor.assign_offsets();
    let m = descriptor.num_active_constraints();
    if r.len() != n {
        return Err(ConstraintError::DimensionMismatch {
            what: "force term",
            expected: n,
            actual: r.len(),
        });
    }
    if q.len() != m {
        return Err(ConstraintError::DimensionMismatch {
            what: "constraint term",
            expected: m,
            actual: q.len(),
        });
    }
    Ok(())
}

// ============================================================================
// Schur complement
// ============================================================================

/// Configuration for [`SchurComplementSolver`].
#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct SchurComplementConfig {
    /// Added to the diagonal of `Cq M⁻¹ Cqᵀ + E`.
    pub regularization: f64,
}

impl Default for SchurComplementConfig {
    fn default() -> Self {
        Self {
            regularization: 1e-9,
        }
    }
}

impl SchurComplementConfig {
    /// No regularization. Redundant constraints make the system singular.
    #[must_use]
    pub fn exact() -> Self {
        Self {
            regularization: 0.0,
        }
    }

    /// Set the diagonal regularization.
    #[must_use]
    pub const fn with_regularization(mut self, regularization: f64) -> Self {
        self.regularization = regularization;
        self
    }

    /// Validate the configuration.
    ///
    /// # Errors
    ///
    /// Returns [`ConstraintError::InvalidConfig`] if the regularization is
    /// negative or not finite.
    pub fn validate(&self) -> ConstraintResult<()> {
        if !self.regularization.is_finite() || self.regularization < 0.0 {
            return Err(ConstraintError::invalid_config(
                "regularization must be finite and non-negative",
            ));
        }
        Ok(())
    }
}

/// Direct solver on the Schur complement `Cq M⁻¹ Cqᵀ + E`.
///
/// Tries a Cholesky factorization first and falls back to LU.
#[derive(Debug, Clone, Default)]
pub struct SchurComplementSolver {
    config: SchurComplementConfig,
}

impl SchurComplementSolver {
    /// Create a solver with the given configuration.
    #[must_use]
    pub fn new(config: SchurComplementConfig) -> Self {
        Self { config }
    }

    /// Get the configuration.
    #[must_use]
    pub fn config(&self) -> &SchurComplementConfig {
        &self.config
    }

    /// Assemble `Cq M⁻¹ Cqᵀ + E + εI` one column at a time.
    fn schur_matrix(&self, descriptor: &SystemDescriptor) -> ConstraintResult<DMatrix<f64>> {
        let m = descriptor.num_active_constraints();
        let mut a = DMatrix::<f64>::zeros(m, m);
        let mut unit = DVector::<f64>::zeros(m);
        for j in 0..m {
            unit[j] = 1.0;
            let column = descriptor.jacobian_transposed_times(&unit)?;
            let column = descriptor.inverse_mass_times(&column)?;
            let column = descriptor.jacobian_times(&column)?;
            a.set_column(j, &column);
            unit[j] = 0.0;
        }
        let cfm = descriptor.cfm_vector();
        for i in 0..m {
            a[(i, i)] += cfm[i] + self.config.regularization;
        }
        Ok(a)
    }
}

fn solve_dense(a: DMatrix<f64>, rhs: &DVector<f64>) -> Option<DVector<f64>> {
    let finite = |v: &DVector<f64>| v.iter().all(|x| x.is_finite());
    if let Some(solution) = a.clone().cholesky().map(|chol| chol.solve(rhs)) {
        if finite(&solution) {
            return Some(solution);
        }
    }
    a.lu().solve(rhs).filter(finite)
}

impl KktSolver for SchurComplementSolver {
    fn solve(
        &mut self,
        descriptor: &mut SystemDescriptor,
        r: &DVector<f64>,
        q: &DVector<f64>,
    ) -> ConstraintResult<KktSolution> {
        self.config.validate()?;
        check_sizes(descriptor, r, q)?;
        let m = descriptor.num_active_constraints();

        let minv_r = descriptor.inverse_mass_times(r)?;
        let lambda = if m == 0 {
            DVector::zeros(0)
        } else {
            let a = self.schur_matrix(descriptor)?;
            let rhs = q - descriptor.jacobian_times(&minv_r)?;
            solve_dense(a, &rhs).ok_or(ConstraintError::SingularSystem { rows: m })?
        };

        let reaction = descriptor.jacobian_transposed_times(&lambda)?;
        let x = descriptor.inverse_mass_times(&(r + reaction))?;
        let residual =
            descriptor.jacobian_times(&x)? + descriptor.cfm_vector().component_mul(&lambda) - q;
        let residual_norm = residual.norm();

        descriptor.set_multipliers(&lambda)?;
        descriptor.scatter_state(&x)?;

        debug!(rows = m, coords = x.len(), residual_norm, "schur complement solve");

        Ok(KktSolution {
            x,
            multipliers: lambda,
            iterations: 1,
            residual_norm,
            converged: true,
        })
    }
}

// ============================================================================
// Gauss-Seidel
// ============================================================================

/// Configuration for [`GaussSeidelSolver`].
#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct GaussSeidelConfig {
    /// Maximum number of sweeps.
    pub max_iterations: usize,

    /// Stop when the largest `|Δλ · g|` of a sweep falls below this.
    pub tolerance: f64,

    /// SOR factor ω.
    /// - 1.0: Standard Gauss-Seidel
    /// - < 1.0: Under-relaxation (more stable)
    /// - > 1.0: Over-relaxation (faster convergence, typically 1.2-1.8)
    pub sor_factor: f64,
}

impl Default for GaussSeidelConfig {
    fn default() -> Self {
        Self {
            max_iterations: 100,
            tolerance: 1e-10,
            sor_factor: 1.0,
        }
    }
}

impl GaussSeidelConfig {
    /// Many sweeps and a tight tolerance.
    #[must_use]
    pub fn high_accuracy() -> Self {
        Self {
            max_iterations: 1000,
            tolerance: 1e-13,
            sor_factor: 1.0,
        }
    }

    /// Few sweeps with mild over-relaxation.
    #[must_use]
    pub fn realtime() -> Self {
        Self {
            max_iterations: 20,
            tolerance: 1e-6,
            sor_factor: 1.3,
        }
    }

    /// Set the SOR factor.
    #[must_use]
    pub const fn with_sor_factor(mut self, factor: f64) -> Self {
        self.sor_factor = factor;
        self
    }

    /// Set maximum sweeps.
    #[must_use]
    pub const fn with_max_iterations(mut self, max_iter: usize) -> Self {
        self.max_iterations = max_iter;
        self
    }

    /// Set the stopping tolerance.
    #[must_use]
    pub const fn with_tolerance(mut self, tolerance: f64) -> Self {
        self.tolerance = tolerance;
        self
    }

    /// Validate the configuration.
    ///
    /// # Errors
    ///
    /// Returns [`ConstraintError::InvalidConfig`] if any value is out of range.
    pub fn validate(&self) -> ConstraintResult<()> {
        if self.max_iterations == 0 {
            return Err(ConstraintError::invalid_config("max_iterations must be positive"));
        }
        if !self.tolerance.is_finite() || self.tolerance <= 0.0 {
            return Err(ConstraintError::invalid_config("tolerance must be positive"));
        }
        if !(self.sor_factor > 0.0 && self.sor_factor < 2.0) {
            return Err(ConstraintError::invalid_config("SOR factor must be in range (0, 2)"));
        }
        Ok(())
    }
}

/// Matrix-free Gauss-Seidel solver with SOR.
///
/// For each active constraint, in row order:
///
/// ```text
/// Δλ = −ω · (Cq · x + b + cfm · λ) / g
/// λ += Δλ
/// x += M⁻¹ Cqᵀ Δλ
/// ```
///
/// with `b = −q` and the block states holding `x`.
#[derive(Debug, Clone, Default)]
pub struct GaussSeidelSolver {
    config: GaussSeidelConfig,
}

impl GaussSeidelSolver {
    /// Create a solver with the given configuration.
    #[must_use]
    pub fn new(config: GaussSeidelConfig) -> Self {
        Self { config }
    }

    /// Get the configuration.
    #[must_use]
    pub fn config(&self) -> &GaussSeidelConfig {
        &self.config
    }

    /// Get mutable configuration.
    pub fn config_mut(&mut self) -> &mut GaussSeidelConfig {
        &mut self.config
    }

    /// One sweep. Returns the largest `|Δλ · g|`.
    fn sweep(&self, descriptor: &mut SystemDescriptor) -> ConstraintResult<f64> {
        let omega = self.config.sor_factor;
        let (blocks, constraints) = descriptor.split_mut();
        let mut max_change = 0.0_f64;
        for constraint in constraints.iter_mut().filter(|c| c.is_active()) {
            let g = constraint.effective_mass();
            if g <= 0.0 {
                continue;
            }
            let delta = -omega * constraint.compute_residual(blocks) / g;
            constraint.set_multiplier(constraint.multiplier() + delta);
            constraint.increment_state(blocks, delta)?;
            max_change = max_change.max((delta * g).abs());
        }
        Ok(max_change)
    }
}

impl KktSolver for GaussSeidelSolver {
    fn solve(
        &mut self,
        descriptor: &mut SystemDescriptor,
        r: &DVector<f64>,
        q: &DVector<f64>,
    ) -> ConstraintResult<KktSolution> {
        self.config.validate()?;
        check_sizes(descriptor, r, q)?;
        let m = descriptor.num_active_constraints();

        // λ = 0, x = M⁻¹ r
        let x0 = descriptor.inverse_mass_times(r)?;
        descriptor.scatter_state(&x0)?;
        descriptor.set_rhs(&(-q))?;
        descriptor.set_multipliers(&DVector::zeros(m))?;
        descriptor.update_auxiliary();

        let mut iterations = 0;
        let mut converged = m == 0;
        while !converged && iterations < self.config.max_iterations {
            iterations += 1;
            converged = self.sweep(descriptor)? < self.config.tolerance;
        }

        let residual_norm = descriptor.residuals().norm();
        debug!(rows = m, iterations, converged, residual_norm, "gauss-seidel solve");

        Ok(KktSolution {
            x: descriptor.gather_state(),
            multipliers: descriptor.multipliers(),
            iterations,
            residual_norm,
            converged,
        })
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::{
        BlockId, Constraint, RigidBodyBlock, ShaftBlock, StateBlock, ThreeBodyShaftConstraint,
    };
    use approx::assert_relative_eq;
    use nalgebra::{RowVector6, Vector3};

    fn gearbox(cfm: f64) -> (SystemDescriptor, [BlockId; 3]) {
        let mut desc = SystemDescriptor::new();
        let blocks = desc.blocks_mut();
        let a = blocks.insert(
            RigidBodyBlock::with_principal_inertia(3.0, Vector3::new(1.0, 2.0, 0.5)).unwrap(),
        );
        let b = blocks.insert(RigidBodyBlock::unit());
        let c = blocks.insert(ShaftBlock::new(0.2).unwrap());

        // Shaft speed tied to the relative spin of A and B about z
        let mut spin = ThreeBodyShaftConstraint::new(desc.blocks(), a, b, c)
            .unwrap()
            .with_cfm(cfm);
        spin.set_jacobian_a(RowVector6::new(0.0, 0.0, 0.0, 0.0, 0.0, 1.0));
        spin.set_jacobian_b(RowVector6::new(0.0, 0.0, 0.0, 0.0, 0.0, -1.0));
        spin.set_jacobian_c(-0.5);
        desc.add_constraint(spin);

        // A and B share their x velocity
        let mut slide = ThreeBodyShaftConstraint::new(desc.blocks(), a, b, c)
            .unwrap()
            .with_cfm(cfm);
        slide.set_jacobian_a(RowVector6::new(1.0, 0.0, 0.0, 0.0, 0.0, 0.0));
        slide.set_jacobian_b(RowVector6::new(-1.0, 0.0, 0.0, 0.0, 0.0, 0.0));
        desc.add_constraint(slide);

        desc.assign_offsets();
        (desc, [a, b, c])
    }

    fn load(n: usize) -> DVector<f64> {
        DVector::from_fn(n, |i, _| ((i * 7 % 5) as f64) - 2.0)
    }

    #[test]
    fn test_schur_satisfies_kkt() {
        let (mut desc, _) = gearbox(0.0);
        let r = load(13);
        let q = DVector::from_vec(vec![0.3, -0.1]);

        let mut solver = SchurComplementSolver::new(SchurComplementConfig::exact());
        let solution = solver.solve(&mut desc, &r, &q).unwrap();

        assert!(solution.converged);
        assert!(solution.residual_norm < 1e-10);

        let jx = desc.jacobian_times(&solution.x).unwrap();
        assert_relative_eq!(jx[0], 0.3, epsilon = 1e-10);
        assert_relative_eq!(jx[1], -0.1, epsilon = 1e-10);

        // M x - Jᵀ λ = r
        let mx = desc.mass_times(&solution.x, 1.0).unwrap();
        let jt = desc.jacobian_transposed_times(&solution.multipliers).unwrap();
        for i in 0..13 {
            assert_relative_eq!(mx[i] - jt[i], r[i], epsilon = 1e-10);
        }

        // Written back
        assert_eq!(desc.multipliers(), solution.multipliers);
        assert_eq!(desc.gather_state(), solution.x);
    }

    #[test]
    fn test_gauss_seidel_matches_schur() {
        let r = load(13);
        let q = DVector::from_vec(vec![0.3, -0.1]);

        let (mut desc, _) = gearbox(1e-3);
        let direct = SchurComplementSolver::new(SchurComplementConfig::exact())
            .solve(&mut desc, &r, &q)
            .unwrap();

        let (mut desc, _) = gearbox(1e-3);
        let iterative = GaussSeidelSolver::new(GaussSeidelConfig::high_accuracy())
            .solve(&mut desc, &r, &q)
            .unwrap();

        assert!(iterative.converged);
        assert!(iterative.iterations > 1);
        for i in 0..2 {
            assert_relative_eq!(
                iterative.multipliers[i],
                direct.multipliers[i],
                epsilon = 1e-8
            );
        }
        for i in 0..13 {
            assert_relative_eq!(iterative.x[i], direct.x[i], epsilon = 1e-8);
        }
        assert!(iterative.residual_norm < 1e-8);
    }

    #[test]
    fn test_gauss_seidel_budget() {
        let (mut desc, _) = gearbox(0.0);
        let config = GaussSeidelConfig::default()
            .with_max_iterations(2)
            .with_tolerance(1e-15);
        let solution = GaussSeidelSolver::new(config)
            .solve(&mut desc, &load(13), &DVector::from_vec(vec![1.0, 1.0]))
            .unwrap();

        assert_eq!(solution.iterations, 2);
    }

    #[test]
    fn test_no_constraints() {
        let mut desc = SystemDescriptor::new();
        desc.blocks_mut().insert(ShaftBlock::new(2.0).unwrap());

        let r = DVector::from_vec(vec![4.0]);
        let q = DVector::zeros(0);
        let solution = SchurComplementSolver::default().solve(&mut desc, &r, &q).unwrap();
        assert_relative_eq!(solution.x[0], 2.0, epsilon = 1e-15);

        let solution = GaussSeidelSolver::default().solve(&mut desc, &r, &q).unwrap();
        assert!(solution.converged);
        assert_eq!(solution.iterations, 0);
        assert_relative_eq!(solution.x[0], 2.0, epsilon = 1e-15);
    }

    #[test]
    fn test_redundant_rows_singular_without_regularization() {
        let mut desc = SystemDescriptor::new();
        let blocks = desc.blocks_mut();
        let a = blocks.insert(RigidBodyBlock::unit());
        let b = blocks.insert(RigidBodyBlock::unit());
        let c = blocks.insert(ShaftBlock::new(1.0).unwrap());
        for _ in 0..2 {
            let mut row = ThreeBodyShaftConstraint::new(desc.blocks(), a, b, c).unwrap();
            row.set_jacobian_c(1.0);
            desc.add_constraint(row);
        }

        let r = DVector::zeros(13);
        let q = DVector::from_vec(vec![1.0, 2.0]);

        let err = SchurComplementSolver::new(SchurComplementConfig::exact())
            .solve(&mut desc, &r, &q)
            .unwrap_err();
        assert_eq!(err, ConstraintError::SingularSystem { rows: 2 });

        // Regularized: a finite compromise between the two rows
        let solution = SchurComplementSolver::default().solve(&mut desc, &r, &q).unwrap();
        assert!(solution.x.iter().all(|v| v.is_finite()));
        assert_relative_eq!(solution.x[12], 1.5, epsilon = 1e-6);
    }

    #[test]
    fn test_dimension_checks() {
        let (mut desc, _) = gearbox(0.0);
        let err = SchurComplementSolver::default()
            .solve(&mut desc, &DVector::zeros(4), &DVector::zeros(2))
            .unwrap_err();
        assert!(matches!(err, ConstraintError::DimensionMismatch { what: "force term", .. }));

        let err = GaussSeidelSolver::default()
            .solve(&mut desc, &DVector::zeros(13), &DVector::zeros(1))
            .unwrap_err();
        assert!(matches!(
            err,
            ConstraintError::DimensionMismatch {
                what: "constraint term",
                ..
            }
        ));
    }

    #[test]
    fn test_invalid_config() {
        assert!(GaussSeidelConfig::default().with_sor_factor(2.5).validate().is_err());
        assert!(GaussSeidelConfig::default().with_max_iterations(0).validate().is_err());
        assert!(GaussSeidelConfig::default().with_tolerance(f64::NAN).validate().is_err());
        assert!(SchurComplementConfig::default().with_regularization(-1.0).validate().is_err());
        assert!(GaussSeidelConfig::realtime().validate().is_ok());

        let (mut desc, _) = gearbox(0.0);
        let err = GaussSeidelSolver::new(GaussSeidelConfig::default().with_sor_factor(0.0))
            .solve(&mut desc, &DVector::zeros(13), &DVector::zeros(2))
            .unwrap_err();
        assert!(matches!(err, ConstraintError::InvalidConfig { .. }));
    }

    #[test]
    fn test_inactive_block_gets_no_columns() {
        let (mut desc, [a, _, _]) = gearbox(0.0);
        desc.blocks_mut().get_mut(a).unwrap().set_active(false);

        let r = DVector::zeros(7);
        let q = DVector::from_vec(vec![0.2, 0.0]);
        let solution = SchurComplementSolver::default().solve(&mut desc, &r, &q).unwrap();
        assert_eq!(solution.x.len(), 7);

        let spin = desc.active_constraints().next().unwrap().1;
        assert_relative_eq!(spin.compute_jacobian_times_state(desc.blocks()), 0.2, epsilon = 1e-6);
    }
}
