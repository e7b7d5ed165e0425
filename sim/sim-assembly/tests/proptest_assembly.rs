//! Property-based tests for the velocity pass.
//!
//! Run with: cargo test -p sim-assembly -- proptest

#![allow(clippy::unwrap_used)]

use nalgebra::{RowVector6, Vector3};
use proptest::prelude::*;
use sim_assembly::{AssemblyAnalysis, AssemblyLevel, DescriptorMechanism, LinearCoupling};
use sim_constraint::{RigidBodyBlock, ShaftBlock, SystemDescriptor};

#[derive(Debug, Clone)]
struct Gear {
    rotor_inertia: f64,
    shaft_inertia: f64,
    ratio: f64,
    rotor_spin: f64,
    shaft_spin: f64,
}

fn arb_gear() -> impl Strategy<Value = Gear> {
    (
        0.1..10.0f64,
        0.1..10.0f64,
        prop_oneof![-4.0..-0.25f64, 0.25..4.0f64],
        -5.0..5.0f64,
        -5.0..5.0f64,
    )
        .prop_map(|(rotor_inertia, shaft_inertia, ratio, rotor_spin, shaft_spin)| Gear {
            rotor_inertia,
            shaft_inertia,
            ratio,
            rotor_spin,
            shaft_spin,
        })
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    /// `ω_rotor = ratio · ω_shaft` after the pass, and the generalized
    /// momentum along the gear's free direction is unchanged.
    #[test]
    fn proptest_velocity_pass_is_momentum_projection(gear in arb_gear()) {
        let mut system = SystemDescriptor::new();
        let ground = system.blocks_mut().insert(RigidBodyBlock::unit().fixed());
        let rotor = system.blocks_mut().insert(
            RigidBodyBlock::with_principal_inertia(
                1.0,
                Vector3::new(1.0, 1.0, gear.rotor_inertia),
            )
            .unwrap(),
        );
        let shaft = system.blocks_mut().insert(ShaftBlock::new(gear.shaft_inertia).unwrap());

        let mut mechanism = DescriptorMechanism::new(system);
        let spin = RowVector6::new(0.0, 0.0, 0.0, 0.0, 0.0, 1.0);
        let gearing = LinearCoupling::new(RowVector6::zeros(), spin, -gear.ratio);
        mechanism.add_link(ground, rotor, shaft, gearing).unwrap();
        mechanism
            .set_block_velocities(rotor, &[0.0, 0.0, 0.0, 0.0, 0.0, gear.rotor_spin])
            .unwrap();
        mechanism.set_block_velocities(shaft, &[gear.shaft_spin]).unwrap();

        let mut analysis = AssemblyAnalysis::new(mechanism);
        let report = analysis.assemble(AssemblyLevel::VELOCITY).unwrap();
        prop_assert!(report.velocity_residual.unwrap() < 1e-6);

        let mechanism = analysis.mechanism();
        let w_rotor = mechanism.block_velocities(rotor).unwrap()[5];
        let w_shaft = mechanism.block_velocities(shaft).unwrap()[0];
        prop_assert!((w_rotor - gear.ratio * w_shaft).abs() < 1e-6);

        // Momentum along the constrained motion (ratio, 1) is conserved
        let momentum = |wr: f64, ws: f64| {
            gear.ratio * gear.rotor_inertia * wr + gear.shaft_inertia * ws
        };
        let before = momentum(gear.rotor_spin, gear.shaft_spin);
        let after = momentum(w_rotor, w_shaft);
        prop_assert!((after - before).abs() < 1e-6 * before.abs().max(1.0));
    }
}
