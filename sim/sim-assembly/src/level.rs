//! Assembly level selection.

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

bitflags::bitflags! {
    /// Which passes an assembly call runs.
    ///
    /// Passes always run in the order position, velocity, acceleration,
    /// whatever order the bits were combined in.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    #[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
    pub struct AssemblyLevel: u32 {
        /// Newton iterations on the constraint violation.
        const POSITION = 1 << 0;
        /// Projection of velocities onto the constraint manifold.
        const VELOCITY = 1 << 1;
        /// Consistent accelerations and reactions.
        const ACCELERATION = 1 << 2;
        /// All three passes.
        const FULL = Self::POSITION.bits() | Self::VELOCITY.bits() | Self::ACCELERATION.bits();
    }
}

impl AssemblyLevel {
    /// Whether the velocity pass runs. Accelerations need consistent
    /// velocities, so it also runs for `ACCELERATION` alone.
    #[must_use]
    pub fn runs_velocity(self) -> bool {
        self.intersects(Self::VELOCITY | Self::ACCELERATION)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_full_is_union() {
        assert_eq!(
            AssemblyLevel::FULL,
            AssemblyLevel::POSITION | AssemblyLevel::VELOCITY | AssemblyLevel::ACCELERATION
        );
        assert_eq!(AssemblyLevel::FULL.bits(), 0b111);
        assert_eq!(AssemblyLevel::all(), AssemblyLevel::FULL);
    }

    #[test]
    fn test_runs_velocity() {
        assert!(AssemblyLevel::ACCELERATION.runs_velocity());
        assert!(AssemblyLevel::VELOCITY.runs_velocity());
        assert!(!AssemblyLevel::POSITION.runs_velocity());
        assert!(!AssemblyLevel::empty().runs_velocity());
    }
}
