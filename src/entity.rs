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

//! The entity container: an intrusive free-list mapping an entity index
//! to its archetype/row location (§3.3/§4.3).
//!
//! The source material reuses a single `archetypePtr` field to double as
//! the next-free-slot link when a slot is dead. That pointer-reuse trick
//! doesn't carry over to a safe Rust representation (REDESIGN FLAGS: no
//! raw pointer graph); the same O(1) push/pop free-list behaviour is
//! kept using an explicit enum instead.

use crate::id::Id;

/// Per-entity bookkeeping flags.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EntityFlags {
    /// Entity is in the disabled partition of its chunk.
    pub disabled: bool,
}

/// Location of a live entity: which archetype, which chunk within it, and
/// which row within that chunk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Record {
    pub archetype: u32,
    pub chunk: u32,
    pub row: u32,
    pub flags: EntityFlags,
}

enum Slot {
    Occupied { record: Record, gen: u32 },
    Free { next: Option<u32>, gen: u32 },
}

/// Intrusive free-list entity container.
pub struct EntityContainer {
    slots: Vec<Slot>,
    free_head: Option<u32>,
    live_count: usize,
}

impl Default for EntityContainer {
    fn default() -> Self {
        Self::new()
    }
}

impl EntityContainer {
    pub fn new() -> Self {
        EntityContainer {
            slots: Vec::new(),
            free_head: None,
            live_count: 0,
        }
    }

    /// Number of currently-live entities.
    pub fn len(&self) -> usize {
        self.live_count
    }

    pub fn is_empty(&self) -> bool {
        self.live_count == 0
    }

    /// Allocate an entity id, reusing a freed slot (with incremented
    /// generation) when one is available, otherwise appending a new
    /// slot at generation 0.
    pub fn alloc(&mut self, archetype: u32, chunk: u32, row: u32) -> Id {
        self.live_count += 1;
        let record = Record {
            archetype,
            chunk,
            row,
            flags: EntityFlags::default(),
        };
        if let Some(index) = self.free_head {
            let slot = &mut self.slots[index as usize];
            let gen = match slot {
                Slot::Free { next, gen } => {
                    self.free_head = *next;
                    *gen
                }
                Slot::Occupied { .. } => unreachable!("free list points at an occupied slot"),
            };
            *slot = Slot::Occupied { record, gen };
            return Id::entity(index, gen);
        }
        let index = self.slots.len() as u32;
        self.slots.push(Slot::Occupied { record, gen: 0 });
        Id::entity(index, 0)
    }

    /// Reclaim `e`'s slot: bumps the generation and pushes the index
    /// onto the free-list stack. Caller must have already checked
    /// `valid(e)` and run any cleanup policy; freeing an already-free
    /// slot is undefined behaviour at the API level (spec §4.3) and here
    /// is simply a no-op guarded by `valid`.
    pub fn free(&mut self, e: Id) {
        if !self.valid(e) {
            return;
        }
        let index = e.id();
        let next_gen = self.slots[index as usize].gen().wrapping_add(1);
        self.slots[index as usize] = Slot::Free {
            next: self.free_head,
            gen: next_gen,
        };
        self.free_head = Some(index);
        self.live_count -= 1;
    }

    /// True if `e` refers to a currently-live entity at the matching
    /// generation.
    pub fn valid(&self, e: Id) -> bool {
        match self.slots.get(e.id() as usize) {
            Some(Slot::Occupied { gen, .. }) => *gen == e.gen(),
            _ => false,
        }
    }

    /// Resolve a live entity to its current location record.
    pub fn resolve(&self, e: Id) -> Option<&Record> {
        match self.slots.get(e.id() as usize) {
            Some(Slot::Occupied { record, gen }) if *gen == e.gen() => Some(record),
            _ => None,
        }
    }

    /// Resolve a live entity to its mutable location record.
    pub fn resolve_mut(&mut self, e: Id) -> Option<&mut Record> {
        match self.slots.get_mut(e.id() as usize) {
            Some(Slot::Occupied { record, gen }) if *gen == e.gen() => Some(record),
            _ => None,
        }
    }

    /// Reconstruct the full `Id` (with correct generation) for a live
    /// index, e.g. when resolving a raw row's back-reference.
    pub fn get(&self, index: u32) -> Option<Id> {
        match self.slots.get(index as usize) {
            Some(Slot::Occupied { gen, .. }) => Some(Id::entity(index, *gen)),
            _ => None,
        }
    }
}

impl Slot {
    fn gen(&self) -> u32 {
        match self {
            Slot::Occupied { gen, .. } => *gen,
            Slot::Free { gen, .. } => *gen,
        }
    }
}
