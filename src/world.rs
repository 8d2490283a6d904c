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

//! The world facade (§6.1): the single entry point tying together
//! component registration, entity storage, the archetype graph,
//! inheritance, queries, deferred commands and cleanup.
//!
//! Structural mutation (`add`/`remove`/`set`/`despawn`) is meant to come
//! from one writer thread; readers on other threads record edits into a
//! [`CommandBuffer`] and submit it through [`World::command_channel`]
//! instead of touching the world directly (§5).

use rustc_hash::FxHashMap;
use smallvec::SmallVec;

#[cfg(feature = "profiling")]
use tracing::info_span;

use crate::archetype::ArchRow;
use crate::cleanup::{self, CleanupHost};
use crate::command::{CommandChannel, CommandSink, ComponentSnapshot};
use crate::component::{Component, ComponentCache, SoaLayout};
use crate::entity::{EntityContainer, Record};
use crate::error::{EcsError, Result};
use crate::graph::ArchetypeGraph;
use crate::id::{Id, ALL, CHILD_OF, IS_A};
use crate::inherit::{self, InheritanceResolver};
use crate::query::{self, IterMode, PrototypeLookup, QueryCache, QueryPlan};

/// Borrows just the fields [`query::PrototypeLookup`] needs, so a query
/// lookup doesn't have to hold `&World` (which would collide with the
/// `&mut self.query_cache` borrow alongside it).
struct Prototypes<'a> {
    entities: &'a EntityContainer,
    graph: &'a ArchetypeGraph,
}

impl PrototypeLookup for Prototypes<'_> {
    fn has_component(&self, base: Id, component: Id) -> bool {
        match self.entities.resolve(base) {
            Some(record) => self.graph.get(record.archetype as usize).has(component),
            None => false,
        }
    }
}

/// Central ECS storage: components, entities, archetypes and the
/// systems built on top of them (queries, commands, cleanup).
pub struct World {
    components: ComponentCache,
    entities: EntityContainer,
    graph: ArchetypeGraph,
    inherit: InheritanceResolver,
    names: FxHashMap<Id, String>,
    name_lookup: FxHashMap<String, Id>,
    /// `target -> [(holder, relation)]`: reverse index over every pair
    /// component currently held by any entity, used for cleanup
    /// propagation and `relations`/`targets` queries.
    targets_index: FxHashMap<Id, SmallVec<[(Id, Id); 4]>>,
    delete_target_policies: FxHashMap<Id, Id>,
    cant_combine: FxHashMap<Id, SmallVec<[Id; 4]>>,
    /// `component -> [required]`: what `set_requires` has declared
    /// `component` depends on (§4.1's `Requires` relation).
    requires: FxHashMap<Id, SmallVec<[Id; 4]>>,
    query_cache: QueryCache,
    command_channel: CommandChannel,
    /// Monotonic world version; every chunk's per-component version is
    /// stamped from this counter (§4.6).
    tick: u64,
}

impl Default for World {
    fn default() -> Self {
        Self::new()
    }
}

impl World {
    pub fn new() -> Self {
        let mut components = ComponentCache::new();
        components.register_reserved(CHILD_OF, "ChildOf");
        components.register_reserved(IS_A, "IsA");

        let mut world = World {
            components,
            entities: EntityContainer::new(),
            graph: ArchetypeGraph::new(crate::chunk::CHUNK_BYTES),
            inherit: InheritanceResolver::new(),
            names: FxHashMap::default(),
            name_lookup: FxHashMap::default(),
            targets_index: FxHashMap::default(),
            delete_target_policies: FxHashMap::default(),
            cant_combine: FxHashMap::default(),
            requires: FxHashMap::default(),
            query_cache: QueryCache::new(),
            command_channel: CommandChannel::new(),
            tick: 1,
        };
        // ChildOf cascades delete to children by default (§4.8); this is
        // the one built-in override, everything else defaults to Remove.
        world.delete_target_policies.insert(CHILD_OF, crate::id::DELETE);
        world
    }

    /// Current world version. Bumped by [`World::update`].
    pub fn tick(&self) -> u64 {
        self.tick
    }

    /// Advance the world version and drain every command buffer
    /// submitted since the last call. Returns the number of buffers
    /// applied.
    pub fn update(&mut self) -> Result<usize> {
        #[cfg(feature = "profiling")]
        let _guard = info_span!("world_update", tick = self.tick).entered();

        self.tick += 1;
        self.flush_commands()
    }

    /// Channel readers submit deferred [`crate::command::CommandBuffer`]s
    /// through; the writer drains it via [`World::flush_commands`] or
    /// [`World::update`].
    pub fn command_channel(&self) -> &CommandChannel {
        &self.command_channel
    }

    pub fn flush_commands(&mut self) -> Result<usize> {
        #[cfg(feature = "profiling")]
        let _guard = info_span!("flush_commands", tick = self.tick).entered();

        let channel = std::mem::replace(&mut self.command_channel, CommandChannel::new());
        let result = channel.drain_into(self);
        self.command_channel = channel;
        result
    }

    // ---- component registration -----------------------------------

    pub fn register<T: Component>(&mut self) -> Id {
        self.components.register::<T>()
    }

    pub fn try_register<T: Component>(&mut self) -> Result<Id> {
        self.components.try_register::<T>()
    }

    /// Forbid `a` and `b` from ever being present on the same entity at
    /// once (`CantCombine`, §4.1); attempting to `add` one while the
    /// other is present fails with [`EcsError::ArchetypeConflict`].
    pub fn set_cant_combine(&mut self, a: Id, b: Id) {
        self.cant_combine.entry(a).or_default().push(b);
        self.cant_combine.entry(b).or_default().push(a);
    }

    fn conflicts(&self, existing: Id, incoming: Id) -> bool {
        self.cant_combine.get(&existing).is_some_and(|list| list.contains(&incoming))
    }

    /// Declare that `component` requires `required` (`Requires`, §4.1):
    /// an entity carrying `component` may not have `required` removed
    /// out from under it while `component` is still present.
    pub fn set_requires(&mut self, component: Id, required: Id) {
        self.requires.entry(component).or_default().push(required);
    }

    /// True if some other id in `signature` declares `removing` as a
    /// requirement, meaning it can't be removed without that id first.
    fn requires_violation(&self, signature: &[Id], removing: Id) -> bool {
        signature
            .iter()
            .any(|&held| held != removing && self.requires.get(&held).is_some_and(|reqs| reqs.contains(&removing)))
    }

    /// Override the `(OnDeleteTarget, policy)` cleanup behaviour for
    /// `relation` (§4.8). `policy` must be [`crate::id::DELETE`] or
    /// [`crate::id::REMOVE`].
    pub fn set_on_delete_target(&mut self, relation: Id, policy: Id) {
        self.delete_target_policies.insert(relation, policy);
    }

    // ---- entity lifecycle -------------------------------------------

    /// Create a new entity with no components, in the empty archetype.
    pub fn spawn(&mut self) -> Id {
        #[cfg(feature = "profiling")]
        let _guard = info_span!("spawn").entered();

        let archetype_idx = self.graph.empty_archetype();
        let e = self.entities.alloc(archetype_idx as u32, 0, 0);
        let row = self.graph.get_mut(archetype_idx).allocate(e, &self.components);
        if let Some(rec) = self.entities.resolve_mut(e) {
            rec.chunk = row.chunk as u32;
            rec.row = row.row as u32;
        }
        e
    }

    pub fn is_alive(&self, e: Id) -> bool {
        self.entities.valid(e)
    }

    /// Destroy `e`, cascading to referencing entities per each
    /// relation's cleanup policy (§4.8).
    pub fn despawn(&mut self, e: Id) -> Result<()> {
        #[cfg(feature = "profiling")]
        let _guard = info_span!("despawn", entity = e.id()).entered();

        if !self.entities.valid(e) {
            return Err(EcsError::InvalidEntity);
        }
        cleanup::delete_with_cleanup(e, self)
    }

    /// Create a full copy of `e`: same archetype, same component values,
    /// via each descriptor's `copy_fn` (always present, since every
    /// [`Component`] is `Clone`) for AoS columns, or a member-wise raw
    /// copy for SoA columns (sound because SoA is restricted to `Copy`
    /// components at registration) (§4.7).
    pub fn duplicate(&mut self, e: Id) -> Result<Id> {
        let record = *self.entities.resolve(e).ok_or(EcsError::InvalidEntity)?;
        let archetype_idx = record.archetype as usize;
        let new_entity = self.entities.alloc(archetype_idx as u32, 0, 0);
        let row = self.graph.get_mut(archetype_idx).allocate(new_entity, &self.components);
        if let Some(rec) = self.entities.resolve_mut(new_entity) {
            rec.chunk = row.chunk as u32;
            rec.row = row.row as u32;
        }

        let signature = self.graph.get(archetype_idx).signature().to_vec();
        for id in &signature {
            let Some(desc) = self.components.find_by_entity(*id) else { continue };
            if desc.size == 0 {
                continue;
            }
            let col = self.graph.get(archetype_idx).column_of(*id).unwrap();

            // Snapshot the source value into a scratch buffer first so the
            // read and write borrows of `self.graph` never overlap (the
            // new row can land in the very same chunk as the source row).
            match &desc.soa {
                SoaLayout::AoS => {
                    let mut scratch = vec![0u8; desc.size];
                    {
                        let src_chunk = self.graph.get(archetype_idx).chunk(record.chunk as usize);
                        let src_ptr = src_chunk.column_ptr(col, record.row as usize);
                        unsafe { std::ptr::copy_nonoverlapping(src_ptr, scratch.as_mut_ptr(), desc.size) };
                    }
                    let dst_chunk = self.graph.get_mut(archetype_idx).chunk_mut(row.chunk);
                    let dst_ptr = dst_chunk.column_ptr_mut(col, row.row, self.tick);
                    let copy_fn = desc.copy_fn.expect("every Component is Clone; copy_fn is always synthesized");
                    unsafe { copy_fn(scratch.as_ptr(), dst_ptr) };
                }
                SoaLayout::Soa(member_sizes) => {
                    let mut scratch = vec![0u8; desc.size];
                    {
                        let src_chunk = self.graph.get(archetype_idx).chunk(record.chunk as usize);
                        let mut offset = 0usize;
                        for (member, &size) in member_sizes.iter().enumerate() {
                            let src_ptr = src_chunk.member_ptr(col, member, record.row as usize);
                            unsafe { std::ptr::copy_nonoverlapping(src_ptr, scratch.as_mut_ptr().add(offset), size) };
                            offset += size;
                        }
                    }
                    let dst_chunk = self.graph.get_mut(archetype_idx).chunk_mut(row.chunk);
                    let mut offset = 0usize;
                    for (member, &size) in member_sizes.iter().enumerate() {
                        let dst_ptr = dst_chunk.member_ptr_mut(col, member, row.row);
                        unsafe { std::ptr::copy_nonoverlapping(scratch.as_ptr().add(offset), dst_ptr, size) };
                        offset += size;
                    }
                }
            }

            if id.is_pair() {
                self.targets_index.entry(id.second()).or_default().push((new_entity, id.first()));
            }
        }
        Ok(new_entity)
    }

    pub fn enable(&mut self, e: Id, enabled: bool) -> Result<()> {
        let record = *self.entities.resolve(e).ok_or(EcsError::InvalidEntity)?;
        let archetype = self.graph.get_mut(record.archetype as usize);
        let at = ArchRow { chunk: record.chunk as usize, row: record.row as usize };
        if let Some(displaced) = archetype.set_enabled(at, enabled) {
            self.relocate_displaced(record.archetype, record.chunk, displaced);
        }
        if let Some(rec) = self.entities.resolve_mut(e) {
            rec.flags.disabled = !enabled;
        }
        Ok(())
    }

    fn relocate_displaced(&mut self, archetype: u32, chunk: u32, displaced: crate::chunk::DisplacedRow) {
        if let Some(rec) = self.entities.resolve_mut(displaced.entity) {
            rec.archetype = archetype;
            rec.chunk = chunk;
            rec.row = displaced.new_row as u32;
        }
    }

    // ---- component access ---------------------------------------------

    pub fn has<T: Component>(&self, e: Id) -> bool {
        match self.components.id_of::<T>() {
            Some(id) => self.has_id(e, id),
            None => false,
        }
    }

    pub fn has_id(&self, e: Id, component: Id) -> bool {
        match self.entities.resolve(e) {
            Some(record) => self.graph.get(record.archetype as usize).has(component),
            None => false,
        }
    }

    pub fn get<T: Component>(&self, e: Id) -> Result<&T> {
        let id = self.components.id_of::<T>().ok_or(EcsError::ComponentNotFound)?;
        let record = self.entities.resolve(e).ok_or(EcsError::InvalidEntity)?;
        let archetype = self.graph.get(record.archetype as usize);
        let col = archetype.column_of(id).ok_or(EcsError::ComponentNotFound)?;
        let chunk = archetype.chunk(record.chunk as usize);
        Ok(unsafe { chunk.get::<T>(col, record.row as usize) })
    }

    pub fn get_mut<T: Component>(&mut self, e: Id) -> Result<&mut T> {
        let id = self.components.id_of::<T>().ok_or(EcsError::ComponentNotFound)?;
        let record = *self.entities.resolve(e).ok_or(EcsError::InvalidEntity)?;
        let tick = self.tick;
        let archetype = self.graph.get_mut(record.archetype as usize);
        let col = archetype.column_of(id).ok_or(EcsError::ComponentNotFound)?;
        let chunk = archetype.chunk_mut(record.chunk as usize);
        Ok(unsafe { chunk.get_mut::<T>(col, record.row as usize, tick) })
    }

    /// Add `component` (a component id, a tag entity, or a relationship
    /// pair) to `e`, transitioning it to the archetype with `component`
    /// added. A no-op if `e` already carries it.
    pub fn add_id(&mut self, e: Id, component: Id) -> Result<()> {
        let record = *self.entities.resolve(e).ok_or(EcsError::InvalidEntity)?;
        let current = self.graph.get(record.archetype as usize);
        if current.has(component) {
            return Ok(());
        }
        for &existing in current.signature() {
            if self.conflicts(existing, component) {
                return Err(EcsError::ArchetypeConflict);
            }
        }
        self.move_entity(e, record, component, true)?;
        if component.is_pair() {
            self.targets_index.entry(component.second()).or_default().push((e, component.first()));
            if component.first() == IS_A {
                self.inherit.add_is_edge(e, component.second());
            }
        }
        Ok(())
    }

    pub fn remove_id(&mut self, e: Id, component: Id) -> Result<()> {
        let record = *self.entities.resolve(e).ok_or(EcsError::InvalidEntity)?;
        let current = self.graph.get(record.archetype as usize);
        if !current.has(component) {
            return Ok(());
        }
        if self.requires_violation(current.signature(), component) {
            return Err(EcsError::ArchetypeConflict);
        }
        self.move_entity(e, record, component, false)?;
        if component.is_pair() {
            if let Some(list) = self.targets_index.get_mut(&component.second()) {
                list.retain(|&(h, r)| !(h == e && r == component.first()));
            }
            if component.first() == IS_A {
                self.inherit.remove_is_edge(e, component.second());
            }
        }
        Ok(())
    }

    fn move_entity(&mut self, e: Id, record: Record, component: Id, adding: bool) -> Result<()> {
        let src_idx = record.archetype as usize;
        let dst_idx = if adding {
            self.graph.transition_add(src_idx, component, &self.components)
        } else {
            self.graph.transition_remove(src_idx, component, &self.components)
        };
        if dst_idx == src_idx {
            return Ok(());
        }
        let src_row = ArchRow { chunk: record.chunk as usize, row: record.row as usize };
        let (src, dst) = self.graph.get_pair_mut(src_idx, dst_idx);
        let (dst_row, displaced) = src.move_into(src_row, dst, e, &self.components);
        if let Some(d) = displaced {
            self.relocate_displaced(record.archetype, record.chunk, d);
        }
        if let Some(rec) = self.entities.resolve_mut(e) {
            rec.archetype = dst_idx as u32;
            rec.chunk = dst_row.chunk as u32;
            rec.row = dst_row.row as u32;
        }
        Ok(())
    }

    /// Add `T`, registering it if needed, and write `value` into it,
    /// bumping the owning chunk's version for `T` (§4.2).
    pub fn set<T: Component>(&mut self, e: Id, value: T) -> Result<()> {
        let had_before = self.has::<T>(e);
        let id = self.components.register::<T>();
        self.add_id(e, id)?;
        let record = *self.entities.resolve(e).ok_or(EcsError::InvalidEntity)?;
        let tick = self.tick;
        let archetype = self.graph.get_mut(record.archetype as usize);
        let col = archetype.column_of(id).expect("component just added");
        let chunk = archetype.chunk_mut(record.chunk as usize);
        if had_before {
            unsafe { *chunk.get_mut::<T>(col, record.row as usize, tick) = value };
        } else {
            unsafe { chunk.write::<T>(col, record.row as usize, value) };
            let _ = chunk.column_ptr_mut(col, record.row as usize, tick);
        }
        Ok(())
    }

    /// Like [`World::set`] but never bumps the version (the silent
    /// `sset`, §4.2) — useful for restoring a value during
    /// deserialization or undo without tripping change-detecting
    /// systems.
    pub fn set_silent<T: Component>(&mut self, e: Id, value: T) -> Result<()> {
        let had_before = self.has::<T>(e);
        let id = self.components.register::<T>();
        self.add_id(e, id)?;
        let record = *self.entities.resolve(e).ok_or(EcsError::InvalidEntity)?;
        let archetype = self.graph.get_mut(record.archetype as usize);
        let col = archetype.column_of(id).expect("component just added");
        let chunk = archetype.chunk_mut(record.chunk as usize);
        if had_before {
            unsafe { chunk.overwrite_silent::<T>(col, record.row as usize, value) };
        } else {
            unsafe { chunk.write::<T>(col, record.row as usize, value) };
        }
        Ok(())
    }

    pub fn remove<T: Component>(&mut self, e: Id) -> Result<()> {
        let Some(id) = self.components.id_of::<T>() else { return Ok(()) };
        self.remove_id(e, id)
    }

    /// True if `T`'s column on `e` has been mutably accessed since
    /// `since` (compare against a tick captured earlier, §4.6).
    pub fn changed<T: Component>(&self, e: Id, since: u64) -> Result<bool> {
        let id = self.components.id_of::<T>().ok_or(EcsError::ComponentNotFound)?;
        let record = self.entities.resolve(e).ok_or(EcsError::InvalidEntity)?;
        let archetype = self.graph.get(record.archetype as usize);
        let col = archetype.column_of(id).ok_or(EcsError::ComponentNotFound)?;
        Ok(archetype.chunk(record.chunk as usize).changed(col, since))
    }

    // ---- naming -------------------------------------------------------

    pub fn set_name(&mut self, e: Id, name: impl Into<String>) -> Result<()> {
        if !self.entities.valid(e) {
            return Err(EcsError::InvalidEntity);
        }
        let name = name.into();
        if let Some(old) = self.names.insert(e, name.clone()) {
            self.name_lookup.remove(&old);
        }
        self.name_lookup.insert(name, e);
        Ok(())
    }

    pub fn name(&self, e: Id) -> Option<&str> {
        self.names.get(&e).map(String::as_str)
    }

    pub fn entity_by_name(&self, name: &str) -> Option<Id> {
        self.name_lookup.get(name).copied()
    }

    // ---- relationships --------------------------------------------------

    /// Make `sub` inherit every component-matching query result `base`
    /// satisfies, via an `(IsA, base)` pair (the `as` operation, §3.6).
    pub fn add_is_a(&mut self, sub: Id, base: Id) -> Result<()> {
        self.add_id(sub, Id::make_pair(IS_A, base))
    }

    /// First target of `relation` on `e`, if any.
    pub fn target(&self, e: Id, relation: Id) -> Option<Id> {
        let record = self.entities.resolve(e)?;
        let sig = self.graph.get(record.archetype as usize).signature();
        let mut found = None;
        inherit::targets(sig, relation, |t| {
            if found.is_none() {
                found = Some(t);
            }
        });
        found
    }

    pub fn for_each_target(&self, e: Id, relation: Id, mut callback: impl FnMut(Id)) {
        let Some(record) = self.entities.resolve(e) else { return };
        let sig = self.graph.get(record.archetype as usize).signature();
        inherit::targets(sig, relation, &mut callback);
    }

    pub fn for_each_relation(&self, e: Id, target: Id, mut callback: impl FnMut(Id)) {
        let Some(record) = self.entities.resolve(e) else { return };
        let sig = self.graph.get(record.archetype as usize).signature();
        inherit::relations(sig, target, &mut callback);
    }

    /// True if `sub` is (transitively) `IsA` `base`, or `sub == base`.
    pub fn is_a(&mut self, sub: Id, base: Id) -> bool {
        self.inherit.is(sub, base)
    }

    // ---- queries --------------------------------------------------------

    /// Compile a textual query (§6.2) against this world's registered
    /// component and entity names.
    pub fn compile_query(&self, text: &str) -> Result<QueryPlan> {
        let components = &self.components;
        let name_lookup = &self.name_lookup;
        let mut resolve = |name: &str| -> Option<Id> {
            match name {
                "ChildOf" => Some(CHILD_OF),
                "IsA" => Some(IS_A),
                "*" => Some(ALL),
                _ => components.find_by_name(name).map(|d| d.id).or_else(|| name_lookup.get(name).copied()),
            }
        };
        let (terms, changed) = query::parse(text, &mut resolve)?;
        let mut plan = QueryPlan::new(terms);
        for id in changed {
            plan = plan.changed(id);
        }
        Ok(plan)
    }

    /// Archetype indices matching `plan` that currently hold at least one
    /// entity, consulting (and refreshing) the query cache. The cache
    /// itself is append-only and signature-based — an archetype, once
    /// matched, stays matched for the life of the world even after every
    /// entity has moved out of it (signatures don't change). Emptied-out
    /// archetypes are filtered out here, at query time, so a caller never
    /// sees a "match" with nothing in it.
    pub fn query_archetypes(&mut self, plan: &QueryPlan) -> Vec<usize> {
        let prototypes = Prototypes { entities: &self.entities, graph: &self.graph };
        let inherit_version = self.inherit.version();
        let matches = self.query_cache.matches(plan, &self.graph, &prototypes, inherit_version);
        matches.iter().copied().filter(|&idx| !self.graph.get(idx).is_empty()).collect()
    }

    /// Group `plan`'s matched archetypes by the target of `relation`
    /// (`group_by`, §4.6).
    pub fn group_query(&mut self, plan: &QueryPlan, relation: Id) -> FxHashMap<Id, Vec<usize>> {
        let matches = self.query_archetypes(plan);
        query::group_matches(&matches, relation, &self.graph)
    }

    /// Count enabled rows matching `plan`, honoring any `changed<T>()`
    /// clause (§6.2, scenario S5): each call only reports rows whose
    /// chunk acquired a mutable view of every changed component since
    /// *this plan's own previous* `query_count` call (not since world
    /// creation) — a silent write (`set_silent`) never trips it.
    pub fn query_count(&mut self, plan: &QueryPlan) -> usize {
        let archetypes = self.query_archetypes(plan);
        if plan.changed.is_empty() {
            return archetypes
                .iter()
                .flat_map(|&idx| self.graph.get(idx).chunks())
                .map(|c| c.enabled_count())
                .sum();
        }

        // `since == None` means this plan has never run before: nothing
        // to compare against yet, so everything present counts.
        let since = self.query_cache.take_change_since(plan, self.tick);
        let mut total = 0usize;
        for idx in archetypes {
            let archetype = self.graph.get(idx);
            let change_cols: Vec<usize> = plan.changed.iter().filter_map(|&id| archetype.column_of(id)).collect();
            if change_cols.len() != plan.changed.len() {
                // A changed() component isn't on this archetype at all;
                // archetype_matches already requires its presence, so
                // this only happens for a zero-sized tag component,
                // which never changes.
                continue;
            }
            for chunk in archetype.chunks() {
                let passes = since.map_or(true, |since| change_cols.iter().all(|&col| chunk.changed(col, since)));
                if passes {
                    total += chunk.enabled_count();
                }
            }
        }
        total
    }

    /// Call `f` with `(entity, &mut T)` for every enabled row of every
    /// archetype matching `plan` that carries `T`.
    pub fn for_each<T: Component>(&mut self, plan: &QueryPlan, mode: IterMode, mut f: impl FnMut(Id, &mut T)) {
        let Some(id) = self.components.id_of::<T>() else { return };
        let matches = self.query_archetypes(plan);
        let tick = self.tick;
        for archetype_idx in matches {
            let archetype = self.graph.get_mut(archetype_idx);
            let Some(col) = archetype.column_of(id) else { continue };
            for chunk_idx in 0..archetype.chunks().len() {
                let chunk = archetype.chunk_mut(chunk_idx);
                for row in query::row_range(chunk, mode) {
                    let entity = chunk.entity_at(row);
                    let value = unsafe { chunk.get_mut::<T>(col, row, tick) };
                    f(entity, value);
                }
            }
        }
    }

    /// Read-only parallel iteration over every enabled row of every
    /// archetype matching `plan` that carries `T` (§5: safe across
    /// reader threads provided no writer is active concurrently).
    /// Does not consult or refresh the query cache, since that cache is
    /// only ever touched by the single writer thread.
    #[cfg(feature = "parallel")]
    pub fn par_for_each<T: Component + Sync>(&self, plan: &QueryPlan, mode: IterMode, f: impl Fn(Id, &T) + Sync + Send) {
        use rayon::prelude::*;

        let Some(id) = self.components.id_of::<T>() else { return };
        let prototypes = Prototypes { entities: &self.entities, graph: &self.graph };
        let matches: Vec<usize> = self
            .graph
            .iter()
            .filter(|(_, archetype)| query::archetype_matches(plan, archetype.signature(), &prototypes))
            .map(|(idx, _)| idx)
            .collect();

        matches.par_iter().for_each(|&archetype_idx| {
            let archetype = self.graph.get(archetype_idx);
            let Some(col) = archetype.column_of(id) else { return };
            for chunk in archetype.chunks() {
                for row in query::row_range(chunk, mode) {
                    let entity = chunk.entity_at(row);
                    let value = unsafe { chunk.get::<T>(col, row) };
                    f(entity, value);
                }
            }
        });
    }

    /// Start a chained entity builder on a freshly spawned entity
    /// (`build`, §6.1).
    pub fn build(&mut self) -> EntityBuilder<'_> {
        let entity = self.spawn();
        EntityBuilder { world: self, entity }
    }
}

impl CommandSink for World {
    fn create(&mut self) -> Id {
        self.spawn()
    }

    fn copy(&mut self, source: Id) -> Result<Id> {
        self.duplicate(source)
    }

    fn add(&mut self, target: Id, component: Id) -> Result<()> {
        self.add_id(target, component)
    }

    fn remove(&mut self, target: Id, component: Id) -> Result<()> {
        self.remove_id(target, component)
    }

    unsafe fn set_raw(&mut self, target: Id, component: Id, data: *const u8, write: unsafe fn(*const u8, *mut u8)) -> Result<()> {
        self.add_id(target, component)?;
        let record = *self.entities.resolve(target).ok_or(EcsError::InvalidEntity)?;
        let tick = self.tick;
        let archetype = self.graph.get_mut(record.archetype as usize);
        let col = archetype.column_of(component).expect("component just added");
        let chunk = archetype.chunk_mut(record.chunk as usize);
        let dst = chunk.column_ptr_mut(col, record.row as usize, tick);
        write(data, dst);
        Ok(())
    }

    fn destroy(&mut self, target: Id) -> Result<()> {
        self.despawn(target)
    }

    fn has(&self, target: Id, component: Id) -> bool {
        self.has_id(target, component)
    }

    fn exists(&self, target: Id) -> bool {
        self.is_alive(target)
    }

    fn snapshot(&self, target: Id, component: Id) -> Option<ComponentSnapshot> {
        let record = self.entities.resolve(target)?;
        let archetype = self.graph.get(record.archetype as usize);
        let col = archetype.column_of(component)?;
        let desc = self.components.find_by_entity(component)?;
        if desc.size == 0 {
            return None;
        }
        let copy_fn = desc.copy_fn?;
        let chunk = archetype.chunk(record.chunk as usize);
        let src = chunk.column_ptr(col, record.row as usize);
        let mut bytes = vec![0u8; desc.size];
        unsafe { copy_fn(src, bytes.as_mut_ptr()) };
        Some(ComponentSnapshot::new(component, bytes, copy_fn))
    }

    fn would_cleanup_cycle(&self, target: Id) -> bool {
        cleanup::would_cycle(target, self)
    }
}

impl CleanupHost for World {
    fn on_delete_target_policy(&self, relation: Id) -> Option<Id> {
        self.delete_target_policies.get(&relation).copied()
    }

    fn holders_of(&self, target: Id, callback: &mut dyn FnMut(Id, Id)) {
        if let Some(list) = self.targets_index.get(&target) {
            for &(holder, relation) in list {
                callback(holder, relation);
            }
        }
    }

    fn remove_pair(&mut self, holder: Id, relation: Id, target: Id) {
        let _ = self.remove_id(holder, Id::make_pair(relation, target));
    }

    fn delete_entity(&mut self, entity: Id) {
        let Some(record) = self.entities.resolve(entity).copied() else { return };
        let signature = self.graph.get(record.archetype as usize).signature().to_vec();
        for id in &signature {
            if id.is_pair() {
                if let Some(list) = self.targets_index.get_mut(&id.second()) {
                    list.retain(|&(h, r)| !(h == entity && r == id.first()));
                }
            }
        }
        self.targets_index.remove(&entity);
        if let Some(name) = self.names.remove(&entity) {
            self.name_lookup.remove(&name);
        }

        let at = ArchRow { chunk: record.chunk as usize, row: record.row as usize };
        let archetype = self.graph.get_mut(record.archetype as usize);
        if let Some(displaced) = archetype.remove(at) {
            self.relocate_displaced(record.archetype, record.chunk, displaced);
        }
        self.entities.free(entity);
    }
}

/// Chained builder returned by [`World::build`].
pub struct EntityBuilder<'a> {
    world: &'a mut World,
    entity: Id,
}

impl EntityBuilder<'_> {
    pub fn add_id(self, component: Id) -> Result<Self> {
        self.world.add_id(self.entity, component)?;
        Ok(self)
    }

    pub fn set<T: Component>(self, value: T) -> Result<Self> {
        self.world.set(self.entity, value)?;
        Ok(self)
    }

    pub fn child_of(self, parent: Id) -> Result<Self> {
        self.world.add_id(self.entity, Id::make_pair(CHILD_OF, parent))?;
        Ok(self)
    }

    pub fn named(self, name: impl Into<String>) -> Result<Self> {
        self.world.set_name(self.entity, name)?;
        Ok(self)
    }

    pub fn id(self) -> Id {
        self.entity
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Clone, Copy, PartialEq)]
    struct Position {
        x: f32,
        y: f32,
    }

    #[derive(Debug, Clone, Copy, PartialEq)]
    struct Velocity {
        dx: f32,
    }

    #[test]
    fn spawn_despawn_round_trip() {
        let mut world = World::new();
        let e = world.spawn();
        assert!(world.is_alive(e));
        world.despawn(e).unwrap();
        assert!(!world.is_alive(e));
    }

    #[test]
    fn add_get_remove_component() {
        let mut world = World::new();
        let e = world.spawn();
        world.set(e, Position { x: 1.0, y: 2.0 }).unwrap();
        assert!(world.has::<Position>(e));
        assert_eq!(*world.get::<Position>(e).unwrap(), Position { x: 1.0, y: 2.0 });
        world.remove::<Position>(e).unwrap();
        assert!(!world.has::<Position>(e));
    }

    #[test]
    fn despawning_a_parent_cascades_to_children() {
        let mut world = World::new();
        let parent = world.spawn();
        let child = world.spawn();
        world.add_id(child, Id::make_pair(CHILD_OF, parent)).unwrap();

        world.despawn(parent).unwrap();
        assert!(!world.is_alive(parent));
        assert!(!world.is_alive(child));
    }

    #[test]
    fn set_silent_does_not_bump_version() {
        let mut world = World::new();
        let e = world.spawn();
        world.set(e, Position { x: 0.0, y: 0.0 }).unwrap();
        let since = world.tick();
        world.set_silent(e, Position { x: 9.0, y: 9.0 }).unwrap();
        assert!(!world.changed::<Position>(e, since).unwrap());
        assert_eq!(*world.get::<Position>(e).unwrap(), Position { x: 9.0, y: 9.0 });
    }

    #[test]
    fn query_matches_archetypes_with_both_components() {
        let mut world = World::new();
        let with_both = world.spawn();
        world.set(with_both, Position { x: 0.0, y: 0.0 }).unwrap();
        world.set(with_both, Velocity { dx: 1.0 }).unwrap();
        let only_position = world.spawn();
        world.set(only_position, Position { x: 0.0, y: 0.0 }).unwrap();

        let plan = world.compile_query("Position, Velocity").unwrap();
        let mut seen = Vec::new();
        world.for_each::<Velocity>(&plan, IterMode::EnabledOnly, |e, _v| seen.push(e));
        assert_eq!(seen, vec![with_both]);
    }

    #[test]
    fn duplicate_copies_component_values() {
        let mut world = World::new();
        let e = world.spawn();
        world.set(e, Position { x: 3.0, y: 4.0 }).unwrap();
        let copy = world.duplicate(e).unwrap();
        assert_ne!(copy, e);
        assert_eq!(*world.get::<Position>(copy).unwrap(), Position { x: 3.0, y: 4.0 });
    }

    #[test]
    fn is_a_resolves_transitively_through_as() {
        let mut world = World::new();
        let base = world.spawn();
        let mid = world.spawn();
        let sub = world.spawn();
        world.add_is_a(mid, base).unwrap();
        world.add_is_a(sub, mid).unwrap();
        assert!(world.is_a(sub, base));
    }

    #[test]
    #[cfg(feature = "parallel")]
    fn par_for_each_visits_every_matching_row_read_only() {
        use std::sync::atomic::{AtomicUsize, Ordering};

        let mut world = World::new();
        for i in 0..64 {
            let e = world.spawn();
            world.set(e, Position { x: i as f32, y: 0.0 }).unwrap();
        }
        let plan = world.compile_query("Position").unwrap();

        let seen = AtomicUsize::new(0);
        world.par_for_each::<Position>(&plan, IterMode::EnabledOnly, |_e, _pos| {
            seen.fetch_add(1, Ordering::Relaxed);
        });
        assert_eq!(seen.load(Ordering::Relaxed), 64);
    }

    #[test]
    fn command_buffer_applies_through_the_channel() {
        let mut world = World::new();
        let position = world.register::<Position>();
        world.command_channel().record(|buffer| {
            let e = buffer.create();
            buffer.add(e, position);
        });
        let applied = world.flush_commands().unwrap();
        assert_eq!(applied, 1);
    }

    #[test]
    fn requires_blocks_removing_a_dependency_still_in_use() {
        let mut world = World::new();
        let engine = world.register::<Velocity>();
        let fuel = world.register::<Position>();
        world.set_requires(engine, fuel);

        let e = world.spawn();
        world.set(e, Position { x: 0.0, y: 0.0 }).unwrap();
        world.set(e, Velocity { dx: 1.0 }).unwrap();

        let result = world.remove_id(e, fuel);
        assert!(result.is_err());
        assert!(world.has::<Position>(e));
    }

    #[test]
    fn requires_does_not_block_removal_once_the_dependent_is_gone() {
        let mut world = World::new();
        let engine = world.register::<Velocity>();
        let fuel = world.register::<Position>();
        world.set_requires(engine, fuel);

        let e = world.spawn();
        world.set(e, Position { x: 0.0, y: 0.0 }).unwrap();
        world.set(e, Velocity { dx: 1.0 }).unwrap();

        world.remove::<Velocity>(e).unwrap();
        assert!(world.remove_id(e, fuel).is_ok());
        assert!(!world.has::<Position>(e));
    }

    #[test]
    fn builder_chains_add_set_and_name() {
        let mut world = World::new();
        let parent = world.spawn();
        let e = world.build().set(Position { x: 0.0, y: 0.0 }).unwrap().child_of(parent).unwrap().named("child").unwrap().id();
        assert!(world.has::<Position>(e));
        assert_eq!(world.target(e, CHILD_OF), Some(parent));
        assert_eq!(world.entity_by_name("child"), Some(e));
    }
}
