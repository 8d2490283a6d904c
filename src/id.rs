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

//! The 64-bit tagged identifier scheme shared by entities, components
//! and relationship pairs.
//!
//! An [`Id`] is one 64-bit value with three equivalent views (entity,
//! component, pair) depending on which bits are set. All three views
//! share the same id space so that a pair can stand in anywhere a plain
//! entity id can.

use std::fmt;

/// Per-entity ("generic") vs per-chunk-singleton ("unique") component
/// storage kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Kind {
    /// One value per row.
    Gen,
    /// One value per chunk, shared by every row.
    Uni,
}

const ID_BITS: u32 = 32;
const GEN_BITS: u32 = 28;
const GEN_SHIFT: u32 = ID_BITS;
const IS_ENTITY_SHIFT: u32 = ID_BITS + GEN_BITS;
const IS_PAIR_SHIFT: u32 = IS_ENTITY_SHIFT + 1;
const KIND_SHIFT: u32 = IS_PAIR_SHIFT + 1;

const ID_MASK: u64 = (1u64 << ID_BITS) - 1;
const GEN_MASK: u64 = (1u64 << GEN_BITS) - 1;

/// Sentinel reserved value: all bits set.
pub const ID_BAD: Id = Id(u64::MAX);

/// 64-bit identifier for an entity, a component, or a relationship pair.
///
/// Bit layout (`entity view`, §3.1): `{ id: 32, gen: 28, isEntity: 1,
/// isPair: 1, kind: 1, _: 1 }`, LSB first.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Id(u64);

impl Id {
    /// Build a raw identifier from its component fields.
    pub fn make(id: u32, gen: u32, is_entity: bool, is_pair: bool, kind: Kind) -> Self {
        debug_assert!(gen <= GEN_MASK as u32);
        let mut raw = id as u64;
        raw |= (gen as u64 & GEN_MASK) << GEN_SHIFT;
        if is_entity {
            raw |= 1 << IS_ENTITY_SHIFT;
        }
        if is_pair {
            raw |= 1 << IS_PAIR_SHIFT;
        }
        if matches!(kind, Kind::Uni) {
            raw |= 1 << KIND_SHIFT;
        }
        Id(raw)
    }

    /// Construct a plain entity id from an index and generation.
    pub fn entity(index: u32, gen: u32) -> Self {
        Self::make(index, gen, true, false, Kind::Gen)
    }

    /// Construct a plain component id (no generation, generic kind).
    pub fn component(index: u32) -> Self {
        Self::make(index, 0, false, false, Kind::Gen)
    }

    /// Construct a unique (per-chunk) component id.
    pub fn unique_component(index: u32) -> Self {
        Self::make(index, 0, false, false, Kind::Uni)
    }

    /// Build a pair identifier `(first, second)`.
    ///
    /// Per §4.1: `id = first.id()`, `gen = second.id()`, `isPair = 1`,
    /// `kind` is taken from `second`'s kind and `first`'s kind is stored
    /// in the `isEntity` bit position.
    pub fn make_pair(first: Id, second: Id) -> Self {
        Self::make(first.id(), second.id(), first.is_entity_kind(), true, second.kind())
    }

    /// Raw 64-bit value.
    pub fn raw(self) -> u64 {
        self.0
    }

    /// Construct from a raw 64-bit value (e.g. recovered from storage).
    pub fn from_raw(raw: u64) -> Self {
        Id(raw)
    }

    /// The `id` field: entity index, component index, or pair first.
    pub fn id(self) -> u32 {
        (self.0 & ID_MASK) as u32
    }

    /// The generation field (for plain entities) / pair second field.
    pub fn gen(self) -> u32 {
        ((self.0 >> GEN_SHIFT) & GEN_MASK) as u32
    }

    fn is_entity_kind(self) -> bool {
        (self.0 >> IS_ENTITY_SHIFT) & 1 != 0
    }

    /// True if this identifier is a relationship pair.
    pub fn is_pair(self) -> bool {
        (self.0 >> IS_PAIR_SHIFT) & 1 != 0
    }

    /// Storage kind (generic vs unique).
    pub fn kind(self) -> Kind {
        if (self.0 >> KIND_SHIFT) & 1 != 0 {
            Kind::Uni
        } else {
            Kind::Gen
        }
    }

    /// First element of a pair. Panics if this is not a pair.
    pub fn first(self) -> Id {
        assert!(self.is_pair(), "first() called on a non-pair id");
        Id::make(self.id(), 0, self.is_entity_kind(), false, Kind::Gen)
    }

    /// Second element of a pair. Panics if this is not a pair.
    pub fn second(self) -> Id {
        assert!(self.is_pair(), "second() called on a non-pair id");
        Id::make(self.gen(), 0, false, false, self.kind())
    }

    /// True if this is the reserved "bad id" sentinel.
    pub fn is_bad(self) -> bool {
        self == ID_BAD
    }

    /// True if either side of a pair is the [`ALL`] wildcard.
    pub fn is_wildcard_pair(self) -> bool {
        self.is_pair() && (self.first() == ALL || self.second() == ALL)
    }
}

impl fmt::Debug for Id {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_bad() {
            return write!(f, "Id(BAD)");
        }
        if self.is_pair() {
            write!(f, "Id(pair {}:{})", self.id(), self.gen())
        } else {
            write!(f, "Id({}#{})", self.id(), self.gen())
        }
    }
}

/// Wildcard sentinel matching any concrete id in a pair slot.
///
/// `ALL.id() == u32::MAX`.
pub const ALL: Id = Id(ID_MASK);

macro_rules! reserved_ids {
    ($($name:ident = $val:expr),* $(,)?) => {
        $(
            #[allow(missing_docs)]
            pub const $name: Id = Id($val);
        )*
    };
}

// Reserved low-id range for core entities (§4.1). Values are stable for
// the lifetime of the crate's ABI; they occupy raw index slots 1..=12 so
// that the first user-registered entity/component lands at index 13,
// leaving room to grow the reserved range without breaking existing ids.
reserved_ids! {
    CHILD_OF = 1,
    IS_A = 2,
    ON_DELETE = 3,
    ON_DELETE_TARGET = 4,
    DELETE = 5,
    REMOVE = 6,
    REQUIRES = 7,
    CANT_COMBINE = 8,
    EXCLUSIVE = 9,
    ACYCLIC = 10,
    TRAVERSABLE = 11,
    DEPENDS_ON = 12,
}

/// First non-reserved id available for user registration.
pub const FIRST_USER_ID: u32 = 13;
