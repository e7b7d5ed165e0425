//! Property-based tests for the body/body/shaft constraint.
//!
//! Run with: cargo test -p sim-constraint -- proptest

#![allow(clippy::unwrap_used)]

use approx::assert_relative_eq;
use nalgebra::{DMatrix, DVector, Matrix3, Matrix6, RowVector6, Vector6};
use proptest::prelude::*;
use sim_constraint::{
    BlockId, BlockSet, Constraint, RigidBodyBlock, ShaftBlock, StateBlock,
    ThreeBodyShaftConstraint,
};

// =============================================================================
// Strategies
// =============================================================================

/// Symmetric, diagonally dominant (hence positive definite) inertia tensor.
fn arb_inertia() -> impl Strategy<Value = Matrix3<f64>> {
    (
        prop::array::uniform3(0.5..5.0f64),
        prop::array::uniform3(-0.2..0.2f64),
    )
        .prop_map(|([p0, p1, p2], [o0, o1, o2])| {
            Matrix3::new(p0, o0, o1, o0, p1, o2, o1, o2, p2)
        })
}

fn arb_body() -> impl Strategy<Value = (f64, Matrix3<f64>)> {
    (0.1..10.0f64, arb_inertia())
}

fn arb_row() -> impl Strategy<Value = RowVector6<f64>> {
    prop::array::uniform6(-5.0..5.0f64).prop_map(|r| RowVector6::from_row_slice(&r))
}

#[derive(Debug, Clone)]
struct Case {
    body_a: (f64, Matrix3<f64>),
    body_b: (f64, Matrix3<f64>),
    shaft_inertia: f64,
    cq_a: RowVector6<f64>,
    cq_b: RowVector6<f64>,
    cq_c: f64,
    cfm: f64,
}

fn arb_case() -> impl Strategy<Value = Case> {
    (
        arb_body(),
        arb_body(),
        0.05..5.0f64,
        arb_row(),
        arb_row(),
        -5.0..5.0f64,
        prop_oneof![Just(0.0), 0.0..1.0f64],
    )
        .prop_map(
            |(body_a, body_b, shaft_inertia, cq_a, cq_b, cq_c, cfm)| Case {
                body_a,
                body_b,
                shaft_inertia,
                cq_a,
                cq_b,
                cq_c,
                cfm,
            },
        )
}

// =============================================================================
// Helpers
// =============================================================================

fn build(case: &Case) -> (BlockSet, [BlockId; 3], ThreeBodyShaftConstraint) {
    let mut blocks = BlockSet::new();
    let a = blocks.insert(RigidBodyBlock::new(case.body_a.0, case.body_a.1).unwrap());
    let b = blocks.insert(RigidBodyBlock::new(case.body_b.0, case.body_b.1).unwrap());
    let c = blocks.insert(ShaftBlock::new(case.shaft_inertia).unwrap());
    blocks.assign_offsets();

    let mut constraint = ThreeBodyShaftConstraint::new(&blocks, a, b, c)
        .unwrap()
        .with_cfm(case.cfm);
    constraint.set_jacobian_a(case.cq_a);
    constraint.set_jacobian_b(case.cq_b);
    constraint.set_jacobian_c(case.cq_c);
    (blocks, [a, b, c], constraint)
}

/// `Cq M⁻¹ Cqᵀ` from an explicitly inverted 6×6 mass matrix.
fn body_term(row: &RowVector6<f64>, (mass, inertia): (f64, Matrix3<f64>)) -> f64 {
    let mut m = Matrix6::zeros();
    m.fixed_view_mut::<3, 3>(0, 0)
        .copy_from(&(Matrix3::identity() * mass));
    m.fixed_view_mut::<3, 3>(3, 3).copy_from(&inertia);
    let m_inv = m.try_inverse().unwrap();
    (row * m_inv * row.transpose())[0]
}

// =============================================================================
// Properties
// =============================================================================

proptest! {
    #![proptest_config(ProptestConfig::with_cases(128))]

    #[test]
    fn proptest_effective_mass_identity(case in arb_case()) {
        let (blocks, _, mut constraint) = build(&case);
        constraint.update_auxiliary(&blocks);

        let expected = body_term(&case.cq_a, case.body_a)
            + body_term(&case.cq_b, case.body_b)
            + case.cq_c * case.cq_c / case.shaft_inertia
            + case.cfm;
        let scale = expected.abs().max(1.0);
        prop_assert!((constraint.effective_mass() - expected).abs() < 1e-9 * scale);
    }

    #[test]
    fn proptest_effective_mass_additivity(case in arb_case(), skip in 0usize..3) {
        let (mut blocks, ids, mut constraint) = build(&case);
        constraint.update_auxiliary(&blocks);
        let full = constraint.effective_mass();

        let term = match skip {
            0 => body_term(&case.cq_a, case.body_a),
            1 => body_term(&case.cq_b, case.body_b),
            _ => case.cq_c * case.cq_c / case.shaft_inertia,
        };

        blocks.get_mut(ids[skip]).unwrap().set_active(false);
        prop_assert!(!constraint.is_auxiliary_fresh(&blocks));
        constraint.update_auxiliary(&blocks);

        let scale = full.abs().max(1.0);
        prop_assert!((constraint.effective_mass() - (full - term)).abs() < 1e-9 * scale);
    }

    #[test]
    fn proptest_increment_moves_residual_by_effective_mass(
        case in arb_case(),
        state in prop::array::uniform6(-3.0..3.0f64),
        delta in -2.0..2.0f64,
    ) {
        let (mut blocks, ids, mut constraint) = build(&case);
        blocks
            .get_mut(ids[0])
            .unwrap()
            .state_mut()
            .copy_from_slice(&state);
        constraint.update_auxiliary(&blocks);

        let before = constraint.compute_jacobian_times_state(&blocks);
        constraint.increment_state(&mut blocks, delta).unwrap();
        let after = constraint.compute_jacobian_times_state(&blocks);

        let expected = delta * (constraint.effective_mass() - case.cfm);
        let scale = expected.abs().max(before.abs()).max(1.0);
        prop_assert!((after - before - expected).abs() < 1e-9 * scale);
    }

    #[test]
    fn proptest_matrix_free_products_match_paste(
        case in arb_case(),
        v in prop::collection::vec(-4.0..4.0f64, 13),
        l in -3.0..3.0f64,
    ) {
        let (blocks, _, constraint) = build(&case);
        let v = DVector::from_vec(v);

        let mut row = DMatrix::<f64>::zeros(1, 13);
        constraint.paste_jacobian_into(&blocks, &mut row, 0, 0);

        let mut jv = 0.0;
        constraint.add_jacobian_times_vector_into(&blocks, &mut jv, &v);
        let expected = (&row * &v)[0];
        prop_assert!((jv - expected).abs() < 1e-10 * expected.abs().max(1.0));

        let mut jt = DVector::zeros(13);
        constraint.add_jacobian_transposed_times_scalar_into(&blocks, &mut jt, l);
        for i in 0..13 {
            prop_assert!((jt[i] - row[(0, i)] * l).abs() < 1e-12);
        }
    }
}

#[test]
fn test_shaft_first_element_only() {
    let case = Case {
        body_a: (1.0, Matrix3::identity()),
        body_b: (1.0, Matrix3::identity()),
        shaft_inertia: 2.0,
        cq_a: RowVector6::zeros(),
        cq_b: RowVector6::zeros(),
        cq_c: 3.0,
        cfm: 0.0,
    };
    let (mut blocks, ids, mut constraint) = build(&case);
    blocks.get_mut(ids[2]).unwrap().state_mut()[0] = 1.5;
    constraint.update_auxiliary(&blocks);

    assert_relative_eq!(
        constraint.compute_jacobian_times_state(&blocks),
        4.5,
        epsilon = 1e-12
    );
    assert_relative_eq!(constraint.effective_mass(), 4.5, epsilon = 1e-12);
    let (eq_a, _, eq_c) = constraint.auxiliary(&blocks).unwrap();
    assert_eq!(eq_a, Vector6::zeros());
    assert_relative_eq!(eq_c, 1.5, epsilon = 1e-12);
}
