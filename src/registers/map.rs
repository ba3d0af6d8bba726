//! # Register Map Builder
//!
//! Flattens the register set descriptors into one ordered table, assigning
//! each register its protocol-visible number and its byte offset into the
//! register context blob.
//!
//! The build runs in two passes. The first pass numbers every register
//! sequentially across all sets and hands out contiguous byte offsets, but
//! only to registers that own storage; registers whose value lives inside
//! another register are deferred. The second pass resolves those: a
//! contained register inherits the smallest offset among its containers
//! (plus its fixed offset within them), and the invalidation name lists
//! become register number lists. Two passes are needed because a container
//! may in principle appear anywhere in the table, and closing the offset
//! gaps first keeps the context blob contiguous.

use std::collections::HashMap;

use super::descriptors::{RegisterDescriptor, RegisterSetDescriptor, REGISTER_SETS};

/// One register of the flattened register table
#[derive(Debug)]
pub struct RegisterMapEntry {
    /// The protocol visible register number
    pub number: usize,
    /// Byte offset of the register value in the register context blob
    pub offset: usize,
    pub descriptor: &'static RegisterDescriptor,
    /// Numbers of the registers that store this register's value
    pub value_register_numbers: Vec<usize>,
    /// Numbers of the registers a write to this register invalidates
    pub invalidate_register_numbers: Vec<usize>,
}

/// The flattened, ordered register table of the architecture
///
/// Built once at startup from [`REGISTER_SETS`].
#[derive(Debug)]
pub struct RegisterMap {
    entries: Vec<RegisterMapEntry>,
    sets: &'static [RegisterSetDescriptor],
}

impl RegisterMap {
    pub fn build() -> Self {
        Self::build_from_sets(&REGISTER_SETS)
    }

    fn build_from_sets(sets: &'static [RegisterSetDescriptor]) -> Self {
        let mut entries = Vec::new();
        let mut name_to_number: HashMap<&'static str, usize> = HashMap::new();
        let mut number = 0usize;
        let mut data_offset = 0usize;

        for set in sets {
            for descriptor in set.registers {
                let offset = if descriptor.is_contained() {
                    // Resolved in the second pass.
                    usize::MAX
                } else {
                    let offset = data_offset;
                    data_offset += descriptor.size;
                    offset
                };
                name_to_number.insert(descriptor.name, number);
                entries.push(RegisterMapEntry {
                    number,
                    offset,
                    descriptor,
                    value_register_numbers: Vec::new(),
                    invalidate_register_numbers: Vec::new(),
                });
                number += 1;
            }
        }

        // Second pass: registers stored inside other registers get the
        // minimum offset of their containers, and the name lists become
        // number lists.
        let mut resolved = Vec::with_capacity(entries.len());
        for entry in &entries {
            let mut offset = entry.offset;
            let mut value_register_numbers = Vec::new();
            let mut invalidate_register_numbers = Vec::new();

            if let Some(containers) = entry.descriptor.container_registers {
                let mut minimum = usize::MAX;
                for name in containers {
                    let number = *name_to_number
                        .get(name)
                        .unwrap_or_else(|| panic!("unknown container register {name}"));
                    value_register_numbers.push(number);
                    let container_offset =
                        entries[number].offset + entry.descriptor.contained_offset;
                    minimum = minimum.min(container_offset);
                }
                assert_ne!(minimum, usize::MAX, "contained register without containers");
                offset = minimum;
            }

            if let Some(invalidated) = entry.descriptor.invalidate_registers {
                for name in invalidated {
                    let number = *name_to_number
                        .get(name)
                        .unwrap_or_else(|| panic!("unknown invalidated register {name}"));
                    invalidate_register_numbers.push(number);
                }
            }

            resolved.push(RegisterMapEntry {
                number: entry.number,
                offset,
                descriptor: entry.descriptor,
                value_register_numbers,
                invalidate_register_numbers,
            });
        }

        RegisterMap {
            entries: resolved,
            sets,
        }
    }

    pub fn entries(&self) -> &[RegisterMapEntry] {
        &self.entries
    }

    pub fn get(&self, number: usize) -> Option<&RegisterMapEntry> {
        self.entries.get(number)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Name of a register set, by set id
    pub fn set_name(&self, set_id: u32) -> Option<&'static str> {
        self.sets.get(set_id as usize).map(|set| set.name)
    }
}
