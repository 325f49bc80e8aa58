//! Binding remapper: `(set, binding)` addresses to flat hardware slots.
//!
//! Every set index owns a disjoint range in each slot class. The default ranges are the ones the
//! shader cross-compilation tooling assumes, so changing them requires recompiling shaders:
//!
//! | set | `b#` | `t#` | `u#` | `s#` |
//! |-----|------|------|------|------|
//! | 0 | 0..4 | 0..32 | 0..2 | 0..4 |
//! | 1 | 4..8 | 32..64 | 2..4 | 4..8 |
//! | 2 | 8..12 | 64..96 | 4..6 | 8..12 |
//! | 3 | 12..13 | 96..128 | 6..8 | 12..16 |
//!
//! `b13` is reserved for push constants.

use crate::hw::{
    MAX_CONSTANT_BUFFER_SLOTS, MAX_SAMPLER_SLOTS, MAX_SHADER_RESOURCE_SLOTS,
    MAX_UNORDERED_ACCESS_SLOTS,
};

/// Number of descriptor set indices the remapper knows about.
pub const MAX_DESCRIPTOR_SETS: usize = 4;

/// Constant-buffer slot carved out for push-constant emulation.
pub const PUSH_CONSTANT_SLOT: u32 = 13;

/// Hardware slot numbering a binding lands in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SlotClass {
    ConstantBuffer,
    ShaderResource,
    UnorderedAccess,
    Sampler,
}

impl SlotClass {
    pub const ALL: [SlotClass; 4] = [
        SlotClass::ConstantBuffer,
        SlotClass::ShaderResource,
        SlotClass::UnorderedAccess,
        SlotClass::Sampler,
    ];

    /// Per-stage hardware ceiling for this class.
    pub fn hardware_limit(self) -> u32 {
        match self {
            SlotClass::ConstantBuffer => MAX_CONSTANT_BUFFER_SLOTS,
            SlotClass::ShaderResource => MAX_SHADER_RESOURCE_SLOTS,
            SlotClass::UnorderedAccess => MAX_UNORDERED_ACCESS_SLOTS,
            SlotClass::Sampler => MAX_SAMPLER_SLOTS,
        }
    }
}

/// Slot ranges owned by one descriptor set index.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SlotAssignment {
    pub cb_base: u32,
    pub cb_count: u32,
    pub srv_base: u32,
    pub srv_count: u32,
    pub uav_base: u32,
    pub uav_count: u32,
    pub sampler_base: u32,
    pub sampler_count: u32,
}

impl SlotAssignment {
    /// (base, count) for one class.
    pub fn range(&self, class: SlotClass) -> (u32, u32) {
        match class {
            SlotClass::ConstantBuffer => (self.cb_base, self.cb_count),
            SlotClass::ShaderResource => (self.srv_base, self.srv_count),
            SlotClass::UnorderedAccess => (self.uav_base, self.uav_count),
            SlotClass::Sampler => (self.sampler_base, self.sampler_count),
        }
    }
}

pub const DEFAULT_SLOT_ASSIGNMENTS: [SlotAssignment; MAX_DESCRIPTOR_SETS] = [
    SlotAssignment {
        cb_base: 0,
        cb_count: 4,
        srv_base: 0,
        srv_count: 32,
        uav_base: 0,
        uav_count: 2,
        sampler_base: 0,
        sampler_count: 4,
    },
    SlotAssignment {
        cb_base: 4,
        cb_count: 4,
        srv_base: 32,
        srv_count: 32,
        uav_base: 2,
        uav_count: 2,
        sampler_base: 4,
        sampler_count: 4,
    },
    SlotAssignment {
        cb_base: 8,
        cb_count: 4,
        srv_base: 64,
        srv_count: 32,
        uav_base: 4,
        uav_count: 2,
        sampler_base: 8,
        sampler_count: 4,
    },
    SlotAssignment {
        cb_base: 12,
        cb_count: 1,
        srv_base: 96,
        srv_count: 32,
        uav_base: 6,
        uav_count: 2,
        sampler_base: 12,
        sampler_count: 4,
    },
];

/// A problem found by [`BindingRemapper::validate`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotConflict {
    Overlap { class: SlotClass, first_set: u32, second_set: u32 },
    CoversPushConstantSlot { set: u32 },
    ExceedsHardwareLimit { class: SlotClass, set: u32, end: u32 },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BindingRemapper {
    assignments: [SlotAssignment; MAX_DESCRIPTOR_SETS],
}

impl Default for BindingRemapper {
    fn default() -> Self {
        Self::new(DEFAULT_SLOT_ASSIGNMENTS)
    }
}

impl BindingRemapper {
    pub fn new(assignments: [SlotAssignment; MAX_DESCRIPTOR_SETS]) -> Self {
        Self { assignments }
    }

    /// Flat slot for `(set, binding)` in `class`, or `None` when either index is out of range.
    #[inline]
    pub fn get_slot(&self, class: SlotClass, set: u32, binding: u32) -> Option<u32> {
        let assignment = self.assignments.get(set as usize)?;
        let (base, count) = assignment.range(class);
        (binding < count).then_some(base + binding)
    }

    pub fn slot_assignment(&self, set: u32) -> Option<SlotAssignment> {
        self.assignments.get(set as usize).copied()
    }

    /// Startup tuning only. Last write wins.
    pub fn set_slot_assignment(&mut self, set: u32, assignment: SlotAssignment) {
        match self.assignments.get_mut(set as usize) {
            Some(slot) => *slot = assignment,
            None => log::warn!(
                "set_slot_assignment: set {} out of range (max {})",
                set,
                MAX_DESCRIPTOR_SETS - 1
            ),
        }
    }

    pub fn assignments(&self) -> &[SlotAssignment; MAX_DESCRIPTOR_SETS] {
        &self.assignments
    }

    /// Total slots handed out to sets in `class`.
    pub fn total_count(&self, class: SlotClass) -> u32 {
        self.assignments.iter().map(|a| a.range(class).1).sum()
    }

    /// Reports configuration contract violations. Never changes the configuration.
    pub fn validate(&self) -> Vec<SlotConflict> {
        let mut conflicts = Vec::new();
        for class in SlotClass::ALL {
            for (i, a) in self.assignments.iter().enumerate() {
                let (base, count) = a.range(class);
                if count == 0 {
                    continue;
                }
                let end = base + count;
                if end > class.hardware_limit() {
                    conflicts.push(SlotConflict::ExceedsHardwareLimit { class, set: i as u32, end });
                }
                if class == SlotClass::ConstantBuffer && (base..end).contains(&PUSH_CONSTANT_SLOT) {
                    conflicts.push(SlotConflict::CoversPushConstantSlot { set: i as u32 });
                }
                for (j, b) in self.assignments.iter().enumerate().skip(i + 1) {
                    let (other_base, other_count) = b.range(class);
                    if other_count > 0 && base < other_base + other_count && other_base < end {
                        conflicts.push(SlotConflict::Overlap {
                            class,
                            first_set: i as u32,
                            second_set: j as u32,
                        });
                    }
                }
            }
        }
        conflicts
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_totals_match_hardware_ceilings() {
        let remapper = BindingRemapper::default();
        assert_eq!(remapper.total_count(SlotClass::ConstantBuffer), 13);
        assert_eq!(remapper.total_count(SlotClass::ShaderResource), 128);
        assert_eq!(remapper.total_count(SlotClass::UnorderedAccess), 8);
        assert_eq!(remapper.total_count(SlotClass::Sampler), 16);
        assert!(remapper.validate().is_empty());
    }

    #[test]
    fn valid_addresses_are_base_plus_binding() {
        let remapper = BindingRemapper::default();
        for set in 0..MAX_DESCRIPTOR_SETS as u32 {
            let a = remapper.slot_assignment(set).unwrap();
            for class in SlotClass::ALL {
                let (base, count) = a.range(class);
                for binding in 0..count {
                    assert_eq!(remapper.get_slot(class, set, binding), Some(base + binding));
                }
                assert_eq!(remapper.get_slot(class, set, count), None);
            }
        }
    }

    #[test]
    fn out_of_range_set_is_none() {
        let remapper = BindingRemapper::default();
        assert_eq!(remapper.get_slot(SlotClass::ShaderResource, 4, 0), None);
        assert_eq!(remapper.get_slot(SlotClass::Sampler, u32::MAX, 0), None);
        assert_eq!(remapper.slot_assignment(4), None);
    }

    #[test]
    fn push_constant_slot_is_outside_every_set() {
        let remapper = BindingRemapper::default();
        for set in 0..MAX_DESCRIPTOR_SETS as u32 {
            for binding in 0..32 {
                assert_ne!(
                    remapper.get_slot(SlotClass::ConstantBuffer, set, binding),
                    Some(PUSH_CONSTANT_SLOT)
                );
            }
        }
    }

    #[test]
    fn override_is_last_write_wins_and_validated() {
        let mut remapper = BindingRemapper::default();
        let wide = SlotAssignment {
            cb_base: 12,
            cb_count: 2,
            ..DEFAULT_SLOT_ASSIGNMENTS[3]
        };
        remapper.set_slot_assignment(3, wide);
        remapper.set_slot_assignment(3, wide);
        assert_eq!(remapper.slot_assignment(3), Some(wide));
        assert_eq!(remapper.get_slot(SlotClass::ConstantBuffer, 3, 1), Some(13));
        assert_eq!(
            remapper.validate(),
            vec![SlotConflict::CoversPushConstantSlot { set: 3 }]
        );

        let overlapping = SlotAssignment {
            srv_base: 16,
            ..DEFAULT_SLOT_ASSIGNMENTS[1]
        };
        remapper.set_slot_assignment(1, overlapping);
        assert!(remapper.validate().contains(&SlotConflict::Overlap {
            class: SlotClass::ShaderResource,
            first_set: 0,
            second_set: 1,
        }));

        // Ignored with a warning.
        remapper.set_slot_assignment(7, wide);
        assert_eq!(remapper.assignments().len(), MAX_DESCRIPTOR_SETS);
    }
}
