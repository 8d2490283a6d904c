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

//! Component descriptors and the component cache (registry).
//!
//! A [`ComponentDescriptor`] is the type-erased, function-pointer-based
//! view of a Rust component type that the storage engine operates on
//! without generics once registration has happened. The [`ComponentCache`]
//! is the world-lifetime registry of descriptors, indexed both by
//! [`TypeId`] (for the typed `register::<T>()` entry point) and by
//! [`Id`] (the stable identifier the rest of the core stores everywhere).

use std::any::TypeId;
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};

use rustc_hash::FxHashMap;
use smallvec::SmallVec;

use crate::error::{EcsError, Result};
use crate::id::{Id, FIRST_USER_ID};

/// Marker trait for component types.
///
/// Components must be `'static` and safe to send/share across the
/// thread boundary a command buffer may cross before it is drained by
/// the writer. `Clone` is required too: [`World::duplicate`](crate::world::World::duplicate)
/// and command-buffer rollback (§4.7) both need a real copy of a
/// component's value, and a raw byte copy is unsound for any type that
/// owns a heap allocation or other resource. Requiring `Clone` at the
/// trait level means every registered descriptor gets a real `copy_fn`
/// (via `Clone::clone`), never a byte-level fallback.
pub trait Component: 'static + Send + Sync + Clone {}

impl<T: 'static + Send + Sync + Clone> Component for T {}

/// Structure-of-Arrays layout tag for a component (§3.2).
///
/// `AoS` components are stored as one packed array of `T`. `Soa` components
/// are stored as one sub-array per listed member, each sized and aligned
/// independently; `member_sizes` must sum to the component's `size`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SoaLayout {
    /// Array-of-Structures: one packed `Vec<T>`-equivalent array.
    AoS,
    /// Structure-of-Arrays with the given per-member byte sizes.
    Soa(SmallVec<[usize; 8]>),
}

impl SoaLayout {
    /// The arity tag used by the identifier's component view
    /// (`0` for AoS, `>=1` for SoA).
    pub fn arity(&self) -> u8 {
        match self {
            SoaLayout::AoS => 0,
            SoaLayout::Soa(members) => members.len() as u8,
        }
    }
}

/// The last `::`-delimited segment of a `std::any::type_name::<T>()`
/// string, e.g. `"archetype_ecs::world::tests::Position"` -> `"Position"`.
/// This is the identifier textual queries (§6.2) resolve against, since a
/// query string can't spell out a type's full module path.
fn short_name(full: &str) -> &str {
    full.rsplit("::").next().unwrap_or(full)
}

type DropFn = unsafe fn(*mut u8);
type CopyFn = unsafe fn(*const u8, *mut u8);
type MoveFn = unsafe fn(*mut u8, *mut u8);
type CompareFn = unsafe fn(*const u8, *const u8) -> bool;

/// Type-erased description of a registered component type.
#[derive(Clone)]
pub struct ComponentDescriptor {
    /// Stable identifier assigned at registration.
    pub id: Id,
    type_id: TypeId,
    /// Canonical name, typically `std::any::type_name::<T>()`.
    pub name: String,
    /// Hash of the canonical name, used as a cheap secondary key.
    pub hash: u64,
    /// Size in bytes (0 for zero-sized "tag" components).
    pub size: usize,
    /// Alignment in bytes, a power of two.
    pub align: usize,
    /// AoS or SoA storage layout.
    pub soa: SoaLayout,
    /// Destructor, `None` if `T` needs no drop glue.
    pub drop_fn: Option<DropFn>,
    /// Copy constructor. Always present: every [`Component`] is `Clone`,
    /// so this is synthesized from `Clone::clone` at registration and is
    /// never a raw byte copy.
    pub copy_fn: Option<CopyFn>,
    /// Move constructor; always present (falls back to a byte memcpy for
    /// `Copy` types, otherwise a typed `ptr::read`/`ptr::write` pair).
    pub move_fn: MoveFn,
    /// Equality comparison, `None` if `T` does not support it.
    pub compare_fn: Option<CompareFn>,
}

impl ComponentDescriptor {
    fn of<T: Component>(id: Id, drop_fn: Option<DropFn>, compare_fn: Option<CompareFn>) -> Self {
        let name = std::any::type_name::<T>().to_string();
        let mut hasher = DefaultHasher::new();
        name.hash(&mut hasher);
        unsafe fn move_typed<T>(src: *mut u8, dst: *mut u8) {
            let value = std::ptr::read(src as *const T);
            std::ptr::write(dst as *mut T, value);
        }
        unsafe fn copy_typed<T: Clone>(src: *const u8, dst: *mut u8) {
            let value = (*(src as *const T)).clone();
            std::ptr::write(dst as *mut T, value);
        }
        ComponentDescriptor {
            id,
            type_id: TypeId::of::<T>(),
            hash: hasher.finish(),
            name,
            size: std::mem::size_of::<T>(),
            align: std::mem::align_of::<T>().max(1),
            soa: SoaLayout::AoS,
            drop_fn,
            copy_fn: Some(copy_typed::<T>),
            move_fn: move_typed::<T>,
            compare_fn,
        }
    }

    /// Override this descriptor's layout to SoA with the given per-member
    /// byte sizes. The sizes must sum to `self.size`. SoA columns scatter
    /// a value's bytes across one sub-array per member, so there is never
    /// a single contiguous `&T` to run a destructor against; restricted
    /// to drop-free (`Copy`) components (see [`ComponentCache::register_soa`]).
    pub fn with_soa(mut self, member_sizes: &[usize]) -> Self {
        debug_assert_eq!(member_sizes.iter().sum::<usize>(), self.size);
        debug_assert!(self.drop_fn.is_none(), "SoA layout requires a drop-free (Copy) component");
        self.soa = SoaLayout::Soa(member_sizes.iter().copied().collect());
        self
    }

    /// True if this type is a zero-sized "tag" component.
    pub fn is_zero_sized(&self) -> bool {
        self.size == 0
    }
}

/// Registry of component descriptors, keyed by both `TypeId` and stable
/// [`Id`]. Write-once per type; registration must happen during
/// single-threaded setup (§4.2).
pub struct ComponentCache {
    next_id: u32,
    by_type: FxHashMap<TypeId, Id>,
    by_id: FxHashMap<u32, ComponentDescriptor>,
    by_name: FxHashMap<String, Id>,
}

impl Default for ComponentCache {
    fn default() -> Self {
        Self::new()
    }
}

impl ComponentCache {
    /// Create an empty cache. User ids start after the reserved core
    /// entity range (see [`crate::id::FIRST_USER_ID`]).
    pub fn new() -> Self {
        ComponentCache {
            next_id: FIRST_USER_ID,
            by_type: FxHashMap::default(),
            by_id: FxHashMap::default(),
            by_name: FxHashMap::default(),
        }
    }

    fn alloc_id(&mut self) -> Id {
        let idx = self.next_id;
        self.next_id += 1;
        Id::component(idx)
    }

    /// Register a plain (non-`Drop`-bearing or `Drop`-bearing, either
    /// way) component type. Idempotent: re-registering the same `T`
    /// returns the existing id.
    pub fn register<T: Component>(&mut self) -> Id {
        if let Some(&id) = self.by_type.get(&TypeId::of::<T>()) {
            return id;
        }
        let id = self.alloc_id();
        let drop_fn: Option<DropFn> = if std::mem::needs_drop::<T>() {
            Some(|ptr| unsafe { std::ptr::drop_in_place(ptr as *mut T) })
        } else {
            None
        };
        let descriptor = ComponentDescriptor::of::<T>(id, drop_fn, None);
        self.insert(id, descriptor)
    }

    /// Register a component type that also supports equality comparison
    /// (copy support is unconditional, see [`Component`]), e.g. for
    /// command-buffer `set` replay that wants to skip a no-op write.
    pub fn register_with_ops<T>(&mut self) -> Id
    where
        T: Component + PartialEq,
    {
        if let Some(&id) = self.by_type.get(&TypeId::of::<T>()) {
            return id;
        }
        let id = self.alloc_id();
        let drop_fn: Option<DropFn> = if std::mem::needs_drop::<T>() {
            Some(|ptr| unsafe { std::ptr::drop_in_place(ptr as *mut T) })
        } else {
            None
        };
        unsafe fn compare_typed<T: PartialEq>(a: *const u8, b: *const u8) -> bool {
            *(a as *const T) == *(b as *const T)
        }
        let descriptor = ComponentDescriptor::of::<T>(id, drop_fn, Some(compare_typed::<T>));
        self.insert(id, descriptor)
    }

    /// Register a component using a Structure-of-Arrays column layout:
    /// one contiguous sub-array per member instead of one packed array of
    /// `T` (§3.4/§4.4). `member_sizes` must list every member's byte size
    /// in declaration order and sum to `size_of::<T>()`. Restricted to
    /// `Copy` types — see [`ComponentDescriptor::with_soa`].
    pub fn register_soa<T: Component + Copy>(&mut self, member_sizes: &[usize]) -> Id {
        if let Some(&id) = self.by_type.get(&TypeId::of::<T>()) {
            return id;
        }
        let id = self.alloc_id();
        let descriptor = ComponentDescriptor::of::<T>(id, None, None).with_soa(member_sizes);
        self.insert(id, descriptor)
    }

    fn insert(&mut self, id: Id, descriptor: ComponentDescriptor) -> Id {
        self.by_type.insert(descriptor.type_id, id);
        self.by_name.insert(short_name(&descriptor.name).to_string(), id);
        self.by_id.insert(id.id(), descriptor);
        id
    }

    /// Register the descriptor for a reserved core entity (`ChildOf`,
    /// `Is`, ...) as a zero-sized tag with a fixed, pre-assigned id.
    pub(crate) fn register_reserved(&mut self, id: Id, name: &str) {
        if self.by_id.contains_key(&id.id()) {
            return;
        }
        let descriptor = ComponentDescriptor {
            id,
            type_id: TypeId::of::<()>(),
            name: name.to_string(),
            hash: 0,
            size: 0,
            align: 1,
            soa: SoaLayout::AoS,
            drop_fn: None,
            copy_fn: None,
            move_fn: |_, _| {},
            compare_fn: None,
        };
        self.by_name.insert(short_name(name).to_string(), id);
        self.by_id.insert(id.id(), descriptor);
    }

    /// Look up the id already assigned to `T`, if registered.
    pub fn id_of<T: Component>(&self) -> Option<Id> {
        self.by_type.get(&TypeId::of::<T>()).copied()
    }

    /// Find a descriptor by stable id.
    pub fn find_by_entity(&self, id: Id) -> Option<&ComponentDescriptor> {
        self.by_id.get(&id.id())
    }

    /// Find a descriptor by its short name (the last `::`-delimited
    /// segment of its `std::any::type_name::<T>()`), as textual queries
    /// (§6.2) spell it, e.g. `"Position"`.
    pub fn find_by_name(&self, name: &str) -> Option<&ComponentDescriptor> {
        let id = self.by_name.get(short_name(name))?;
        self.find_by_entity(*id)
    }

    /// Attempt to register `T`, returning `DuplicateRegistration` only
    /// in the (unreachable via the typed API, reachable via dynamic
    /// reconstruction) case where an id is already bound to a
    /// different `TypeId`.
    pub fn try_register<T: Component>(&mut self) -> Result<Id> {
        if let Some(&id) = self.by_type.get(&TypeId::of::<T>()) {
            return Ok(id);
        }
        if let Some(existing) = self.by_name.get(short_name(std::any::type_name::<T>())) {
            if self.find_by_entity(*existing).map(|d| d.type_id) != Some(TypeId::of::<T>()) {
                return Err(EcsError::DuplicateRegistration);
            }
        }
        Ok(self.register::<T>())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Clone, Copy, PartialEq)]
    struct Position {
        x: f32,
        y: f32,
        z: f32,
    }

    #[derive(Clone)]
    struct NonTrivial(String);

    #[test]
    fn register_is_idempotent() {
        let mut cache = ComponentCache::new();
        let a = cache.register::<Position>();
        let b = cache.register::<Position>();
        assert_eq!(a, b);
    }

    #[test]
    fn trivial_type_has_no_drop_fn() {
        let mut cache = ComponentCache::new();
        let id = cache.register::<Position>();
        let desc = cache.find_by_entity(id).unwrap();
        assert!(desc.drop_fn.is_none());
        assert_eq!(desc.size, std::mem::size_of::<Position>());
    }

    #[test]
    fn non_trivial_type_has_drop_fn() {
        let mut cache = ComponentCache::new();
        let id = cache.register::<NonTrivial>();
        let desc = cache.find_by_entity(id).unwrap();
        assert!(desc.drop_fn.is_some());
    }

    #[test]
    fn drop_bearing_type_still_gets_a_real_copy_fn() {
        // every Component is Clone, so even a type with drop glue (a
        // String field) gets copy_fn populated from Clone::clone rather
        // than falling back to an unsound raw byte copy.
        let mut cache = ComponentCache::new();
        let id = cache.register::<NonTrivial>();
        let desc = cache.find_by_entity(id).unwrap();
        assert!(desc.copy_fn.is_some());
    }

    #[test]
    fn zero_sized_component_occupies_no_storage() {
        let mut cache = ComponentCache::new();
        let id = cache.register::<()>();
        let desc = cache.find_by_entity(id).unwrap();
        assert!(desc.is_zero_sized());
    }

    #[test]
    fn find_by_name_round_trips() {
        let mut cache = ComponentCache::new();
        let id = cache.register::<Position>();
        let by_name = cache.find_by_name(std::any::type_name::<Position>()).unwrap();
        assert_eq!(by_name.id, id);
    }

    #[test]
    fn find_by_name_resolves_the_bare_short_name() {
        let mut cache = ComponentCache::new();
        let id = cache.register::<Position>();
        let by_name = cache.find_by_name("Position").unwrap();
        assert_eq!(by_name.id, id);
    }

    #[test]
    fn register_soa_records_member_sizes_and_layout() {
        let mut cache = ComponentCache::new();
        let id = cache.register_soa::<Position>(&[4, 4, 4]);
        let desc = cache.find_by_entity(id).unwrap();
        assert_eq!(desc.soa.arity(), 3);
        assert!(desc.copy_fn.is_some());
    }
}
