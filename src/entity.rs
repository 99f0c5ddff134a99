// Copyright 2024 Saptak Santra
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Entity identifiers and the slot allocator.
//!
//! An [`EntityId`] packs a 20-bit slot index and a 12-bit generation into
//! a single `u32`, rather than relying on `slotmap`'s own generational key
//! layout, so that the bit packing and wrap behavior are exactly specified
//! and serialize as a plain integer.

use crate::bitset::BitSet;
use crate::error::{EcsError, Result};

const SLOT_BITS: u32 = 20;
const GENERATION_BITS: u32 = 12;
const SLOT_MASK: u32 = (1 << SLOT_BITS) - 1;
const MAX_GENERATION: u16 = (1 << GENERATION_BITS) - 1;
const MAX_SLOTS: u32 = 1 << SLOT_BITS;

/// A 32-bit entity value: 20-bit slot index packed with a 12-bit
/// generation counter. The all-ones value denotes "no entity".
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct EntityId(u32);

impl EntityId {
    /// The distinguished "no entity" sentinel: all bits set.
    pub const NULL: EntityId = EntityId(u32::MAX);

    #[inline]
    pub fn new(slot: u32, generation: u16) -> Self {
        debug_assert!(slot <= SLOT_MASK);
        debug_assert!(generation <= MAX_GENERATION);
        EntityId((generation as u32) << SLOT_BITS | slot)
    }

    #[inline]
    pub fn slot(self) -> u32 {
        self.0 & SLOT_MASK
    }

    #[inline]
    pub fn generation(self) -> u16 {
        (self.0 >> SLOT_BITS) as u16
    }

    #[inline]
    pub fn is_null(self) -> bool {
        self == EntityId::NULL
    }

    #[inline]
    pub fn to_bits(self) -> u32 {
        self.0
    }

    #[inline]
    pub fn from_bits(bits: u32) -> Self {
        EntityId(bits)
    }
}

impl Default for EntityId {
    fn default() -> Self {
        EntityId::NULL
    }
}

/// An entity's location within the archetype store: `None` while the
/// entity has no components.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EntityLocation {
    pub archetype: usize,
    pub row: usize,
}

#[derive(Debug, Clone, Copy)]
struct SlotRecord {
    generation: u16,
    location: Option<EntityLocation>,
}

/// A slot table with a live bitmap, generation counters, and a LIFO free
/// list. Allocation order is deterministic given the sequence of
/// `allocate`/`free` calls.
pub struct EntityAllocator {
    records: Vec<SlotRecord>,
    live: BitSet,
    free: Vec<u32>,
    next_index: u32,
}

impl EntityAllocator {
    pub fn new() -> Self {
        Self { records: Vec::new(), live: BitSet::new(), free: Vec::new(), next_index: 0 }
    }

    /// Allocate a new entity, reusing a freed slot (with its existing
    /// generation) if one is available, otherwise taking the next unused
    /// slot at generation 0.
    pub fn allocate(&mut self) -> Result<EntityId> {
        if let Some(slot) = self.free.pop() {
            let record = &mut self.records[slot as usize];
            self.live.set(slot as usize);
            return Ok(EntityId::new(slot, record.generation));
        }
        if self.next_index >= MAX_SLOTS {
            return Err(EcsError::TooManyComponents { limit: MAX_SLOTS as usize });
        }
        let slot = self.next_index;
        self.next_index += 1;
        self.records.push(SlotRecord { generation: 0, location: None });
        self.live.set(slot as usize);
        Ok(EntityId::new(slot, 0))
    }

    /// Restore a specific entity identifier during snapshot load. Fails
    /// if the target slot is currently live, or if `entity`'s generation
    /// does not match the slot's stored generation (0 for a slot never
    /// before allocated).
    pub fn allocate_with_id(&mut self, entity: EntityId) -> Result<()> {
        let slot = entity.slot();
        if (slot as usize) < self.records.len() && self.live.test(slot as usize) {
            return Err(EcsError::SlotAlreadyLive(slot));
        }
        let expected = if (slot as usize) < self.records.len() { self.records[slot as usize].generation } else { 0 };
        if entity.generation() != expected {
            return Err(EcsError::GenerationMismatch { slot, expected, found: entity.generation() });
        }
        if let Some(pos) = self.free.iter().position(|&s| s == slot) {
            self.free.swap_remove(pos);
        }
        while (self.records.len() as u32) <= slot {
            self.records.push(SlotRecord { generation: 0, location: None });
        }
        if slot >= self.next_index {
            self.next_index = slot + 1;
        }
        self.records[slot as usize].generation = entity.generation();
        self.records[slot as usize].location = None;
        self.live.set(slot as usize);
        Ok(())
    }

    /// Returns `true` if a warning about generation wraparound should be
    /// surfaced by the caller (the allocator itself does not log).
    pub fn free(&mut self, entity: EntityId) -> bool {
        let slot = entity.slot();
        if (slot as usize) >= self.records.len() || !self.live.test(slot as usize) {
            return false;
        }
        self.live.clear(slot as usize);
        let record = &mut self.records[slot as usize];
        let wrapped = record.generation == MAX_GENERATION;
        record.generation = if wrapped { 0 } else { record.generation + 1 };
        record.location = None;
        self.free.push(slot);
        wrapped
    }

    pub fn is_alive(&self, entity: EntityId) -> bool {
        if entity.is_null() {
            return false;
        }
        let slot = entity.slot();
        (slot as usize) < self.records.len()
            && self.live.test(slot as usize)
            && self.records[slot as usize].generation == entity.generation()
    }

    /// Reconstruct the live [`EntityId`] currently occupying `slot`, if
    /// any. Used to recover a full (slot, generation) identifier from
    /// slot-only indices kept by the relation store.
    pub fn entity_at_slot(&self, slot: u32) -> Option<EntityId> {
        if (slot as usize) < self.records.len() && self.live.test(slot as usize) {
            Some(EntityId::new(slot, self.records[slot as usize].generation))
        } else {
            None
        }
    }

    pub fn location(&self, entity: EntityId) -> Option<EntityLocation> {
        if !self.is_alive(entity) {
            return None;
        }
        self.records[entity.slot() as usize].location
    }

    pub fn set_location(&mut self, entity: EntityId, location: Option<EntityLocation>) {
        if self.is_alive(entity) {
            self.records[entity.slot() as usize].location = location;
        }
    }

    pub fn slot_count(&self) -> usize {
        self.records.len()
    }

    pub fn live_count(&self) -> usize {
        self.live.count_ones()
    }
}

impl Default for EntityAllocator {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn packs_slot_and_generation() {
        let e = EntityId::new(42, 7);
        assert_eq!(e.slot(), 42);
        assert_eq!(e.generation(), 7);
    }

    #[test]
    fn null_entity_is_all_ones() {
        assert!(EntityId::NULL.is_null());
        assert_eq!(EntityId::NULL.to_bits(), u32::MAX);
    }

    #[test]
    fn allocate_then_free_recycles_slot_with_bumped_generation() {
        let mut alloc = EntityAllocator::new();
        let a = alloc.allocate().unwrap();
        assert!(alloc.is_alive(a));
        assert!(alloc.free(a));
        assert!(!alloc.is_alive(a));

        let b = alloc.allocate().unwrap();
        assert_eq!(b.slot(), a.slot());
        assert_eq!(b.generation(), a.generation() + 1);
        assert!(alloc.is_alive(b));
        assert!(!alloc.is_alive(a), "stale identifier must not resurrect");
    }

    #[test]
    fn generation_wraps_and_reports_it() {
        let mut alloc = EntityAllocator::new();
        let mut e = alloc.allocate().unwrap();
        for _ in 0..MAX_GENERATION {
            let wrapped = alloc.free(e);
            assert!(!wrapped);
            e = alloc.allocate().unwrap();
        }
        // e is now at generation MAX_GENERATION; freeing it wraps to 0.
        assert_eq!(e.generation(), MAX_GENERATION);
        assert!(alloc.free(e));
        let next = alloc.allocate().unwrap();
        assert_eq!(next.generation(), 0);
    }

    #[test]
    fn allocate_with_id_rejects_live_slot() {
        let mut alloc = EntityAllocator::new();
        let e = alloc.allocate().unwrap();
        let err = alloc.allocate_with_id(e).unwrap_err();
        assert_eq!(err, EcsError::SlotAlreadyLive(e.slot()));
    }

    #[test]
    fn allocate_with_id_restores_freed_entity_at_its_current_generation() {
        let mut alloc = EntityAllocator::new();
        let e = alloc.allocate().unwrap();
        alloc.free(e);
        let current = EntityId::new(e.slot(), e.generation() + 1);
        alloc.allocate_with_id(current).unwrap();
        assert!(alloc.is_alive(current));
        assert!(!alloc.is_alive(e), "stale generation must not resurrect");
    }

    #[test]
    fn allocate_with_id_rejects_stale_generation() {
        let mut alloc = EntityAllocator::new();
        let e = alloc.allocate().unwrap();
        alloc.free(e);
        let err = alloc.allocate_with_id(e).unwrap_err();
        assert_eq!(err, EcsError::GenerationMismatch { slot: e.slot(), expected: e.generation() + 1, found: e.generation() });
    }

    #[test]
    fn allocate_with_id_advances_next_index_for_future_slots() {
        let mut alloc = EntityAllocator::new();
        let future = EntityId::new(100, 0);
        alloc.allocate_with_id(future).unwrap();
        assert!(alloc.is_alive(future));
        let next = alloc.allocate().unwrap();
        assert_eq!(next.slot(), 101);
    }
}
