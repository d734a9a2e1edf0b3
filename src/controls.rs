use std::fmt::Display;

use crate::error::{Result, SimError};

/// A conjunction of single-bit constraints on basis indices.
///
/// For every bit set in `inclusion_mask`, the basis index's bit must equal the
/// corresponding bit of `desired_value_mask`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Controls {
    inclusion_mask: u64,
    desired_value_mask: u64,
}

impl Controls {
    /// Satisfied by every basis index.
    pub const NONE: Controls = Controls {
        inclusion_mask: 0,
        desired_value_mask: 0,
    };

    pub fn new(inclusion_mask: u64, desired_value_mask: u64) -> Result<Self> {
        let stray = desired_value_mask & !inclusion_mask;
        if stray != 0 {
            return Err(SimError::ControlConflict {
                wire: stray.trailing_zeros(),
            });
        }
        Ok(Controls {
            inclusion_mask,
            desired_value_mask,
        })
    }

    /// A single constraint: `wire` must equal `desired`.
    pub fn bit(wire: u32, desired: bool) -> Self {
        let mask = 1u64 << wire;
        Controls {
            inclusion_mask: mask,
            desired_value_mask: if desired { mask } else { 0 },
        }
    }

    pub fn inclusion_mask(&self) -> u64 {
        self.inclusion_mask
    }

    pub fn desired_value_mask(&self) -> u64 {
        self.desired_value_mask
    }

    pub fn is_none(&self) -> bool {
        self.inclusion_mask == 0
    }

    /// The value `wire` is required to have, if it is constrained at all.
    pub fn desired_value_for(&self, wire: u32) -> Option<bool> {
        let mask = 1u64 << wire;
        if self.inclusion_mask & mask == 0 {
            None
        } else {
            Some(self.desired_value_mask & mask != 0)
        }
    }

    pub fn allows(&self, index: u64) -> bool {
        (index ^ self.desired_value_mask) & self.inclusion_mask == 0
    }

    /// Both sets of constraints at once.
    pub fn and(&self, other: &Controls) -> Result<Self> {
        let shared = self.inclusion_mask & other.inclusion_mask;
        let conflict = (self.desired_value_mask ^ other.desired_value_mask) & shared;
        if conflict != 0 {
            return Err(SimError::ControlConflict {
                wire: conflict.trailing_zeros(),
            });
        }
        Ok(Controls {
            inclusion_mask: self.inclusion_mask | other.inclusion_mask,
            desired_value_mask: self.desired_value_mask | other.desired_value_mask,
        })
    }

    /// Moves every constraint `offset` wires further down.
    pub fn shift(&self, offset: u32) -> Self {
        Controls {
            inclusion_mask: self.inclusion_mask << offset,
            desired_value_mask: self.desired_value_mask << offset,
        }
    }

    /// The constrained wires, lowest first.
    pub fn included_wires(&self) -> impl Iterator<Item = u32> {
        let mask = self.inclusion_mask;
        (0..u64::BITS).filter(move |&i| mask & (1u64 << i) != 0)
    }
}

impl Display for Controls {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.is_none() {
            return write!(f, "No Controls");
        }
        let parts: Vec<String> = self
            .included_wires()
            .map(|w| {
                let desired = self.desired_value_mask & (1u64 << w) != 0;
                format!("{}{w}", if desired { "" } else { "!" })
            })
            .collect();
        write!(f, "Controls({})", parts.join(", "))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn none_allows_everything() {
        for i in 0..64 {
            assert!(Controls::NONE.allows(i));
        }
        assert!(Controls::NONE.is_none());
        assert_eq!(Controls::default(), Controls::NONE);
    }

    #[test]
    fn bit_constraints() {
        let c = Controls::bit(2, true);
        assert!(c.allows(0b100));
        assert!(!c.allows(0b011));
        assert_eq!(c.desired_value_for(2), Some(true));
        assert_eq!(c.desired_value_for(1), None);

        let anti = Controls::bit(0, false);
        assert!(anti.allows(0b110));
        assert!(!anti.allows(0b001));
    }

    #[test]
    fn combination() {
        let c = Controls::bit(0, true).and(&Controls::bit(3, false)).unwrap();
        assert_eq!(c.inclusion_mask(), 0b1001);
        assert_eq!(c.desired_value_mask(), 0b0001);
        assert!(c.allows(0b0111));
        assert!(!c.allows(0b1001));
        assert_eq!(c.included_wires().collect::<Vec<_>>(), vec![0, 3]);

        assert_eq!(
            Controls::bit(1, true).and(&Controls::bit(1, false)),
            Err(SimError::ControlConflict { wire: 1 })
        );
        assert_eq!(
            Controls::bit(1, true).and(&Controls::bit(1, true)),
            Ok(Controls::bit(1, true))
        );
    }

    #[test]
    fn shifting() {
        let c = Controls::bit(0, true).and(&Controls::bit(1, false)).unwrap();
        let shifted = c.shift(2);
        assert_eq!(shifted.inclusion_mask(), 0b1100);
        assert_eq!(shifted.desired_value_mask(), 0b0100);
    }

    #[test]
    fn rejects_desired_bits_outside_inclusion() {
        assert!(Controls::new(0b01, 0b10).is_err());
        assert!(Controls::new(0b11, 0b10).is_ok());
    }

    #[test]
    fn display() {
        let c = Controls::bit(0, true).and(&Controls::bit(2, false)).unwrap();
        assert_eq!(c.to_string(), "Controls(0, !2)");
        assert_eq!(Controls::NONE.to_string(), "No Controls");
    }
}
