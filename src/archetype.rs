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

//! Archetype: the identity of a component set, its chunk list, and its
//! lazily-populated transition edges (§3.5/§4.5).

use rustc_hash::FxHashMap;
use smallvec::SmallVec;

use crate::chunk::{compute_capacity, Chunk, ChunkFull, DisplacedRow, CHUNK_BYTES};
use crate::component::{ComponentCache, ComponentDescriptor};
use crate::id::Id;

/// Canonical, sorted, duplicate-free component/pair id set identifying
/// an archetype.
pub type Signature = SmallVec<[Id; 8]>;

/// Where a row lives inside an archetype: which chunk and which row
/// within it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ArchRow {
    pub chunk: usize,
    pub row: usize,
}

/// The set of component ids an entity carries; entities with identical
/// sets share an archetype.
pub struct Archetype {
    signature: Signature,
    column_index: FxHashMap<Id, usize>,
    chunk_capacity: usize,
    chunks: Vec<Chunk>,
    /// Indices (into `chunks`) of chunks with at least one free row.
    open_chunks: Vec<usize>,
    /// Transition edges: adding `id` leads to the archetype at this
    /// graph index.
    add_edges: FxHashMap<Id, usize>,
    /// Transition edges: removing `id` leads to the archetype at this
    /// graph index.
    remove_edges: FxHashMap<Id, usize>,
    entity_count: usize,
}

impl Archetype {
    /// Build a new archetype for `signature`, resolving descriptors from
    /// `cache` and sizing chunks from the fixed byte budget.
    pub fn new(signature: Signature, cache: &ComponentCache) -> Self {
        Self::with_budget(signature, cache, CHUNK_BYTES)
    }

    /// Like [`Archetype::new`] but with an explicit chunk byte budget,
    /// primarily so tests can force small chunks and exercise multi-chunk
    /// behaviour without huge fixtures.
    pub fn with_budget(signature: Signature, cache: &ComponentCache, budget: usize) -> Self {
        let descriptors: Vec<&ComponentDescriptor> =
            signature.iter().map(|id| cache.find_by_entity(*id).expect("component not registered")).collect();
        let chunk_capacity = compute_capacity(&descriptors, budget);
        let column_index = signature.iter().enumerate().map(|(i, id)| (*id, i)).collect();
        Archetype {
            signature,
            column_index,
            chunk_capacity,
            chunks: Vec::new(),
            open_chunks: Vec::new(),
            add_edges: FxHashMap::default(),
            remove_edges: FxHashMap::default(),
            entity_count: 0,
        }
    }

    pub fn signature(&self) -> &[Id] {
        &self.signature
    }

    pub fn len(&self) -> usize {
        self.entity_count
    }

    pub fn is_empty(&self) -> bool {
        self.entity_count == 0
    }

    pub fn chunks(&self) -> &[Chunk] {
        &self.chunks
    }

    pub fn chunk(&self, idx: usize) -> &Chunk {
        &self.chunks[idx]
    }

    pub fn chunk_mut(&mut self, idx: usize) -> &mut Chunk {
        &mut self.chunks[idx]
    }

    /// Column index of `id` within this archetype's rows, if present.
    pub fn column_of(&self, id: Id) -> Option<usize> {
        self.column_index.get(&id).copied()
    }

    pub fn has(&self, id: Id) -> bool {
        self.column_index.contains_key(&id)
    }

    fn descriptors<'a>(&self, cache: &'a ComponentCache) -> Vec<&'a ComponentDescriptor> {
        self.signature.iter().map(|id| cache.find_by_entity(*id).unwrap()).collect()
    }

    fn push_chunk(&mut self, cache: &ComponentCache) -> usize {
        let descriptors = self.descriptors(cache);
        let chunk = Chunk::new(&descriptors, self.chunk_capacity);
        self.chunks.push(chunk);
        let idx = self.chunks.len() - 1;
        self.open_chunks.push(idx);
        idx
    }

    /// Allocate a row for `entity`, growing the chunk list if every
    /// existing chunk is full.
    pub fn allocate(&mut self, entity: Id, cache: &ComponentCache) -> ArchRow {
        loop {
            if let Some(&chunk_idx) = self.open_chunks.last() {
                match self.chunks[chunk_idx].add_entity(entity) {
                    Ok(row) => {
                        self.entity_count += 1;
                        if self.chunks[chunk_idx].is_full() {
                            self.open_chunks.pop();
                        }
                        return ArchRow { chunk: chunk_idx, row };
                    }
                    Err(ChunkFull) => {
                        self.open_chunks.pop();
                        continue;
                    }
                }
            }
            self.push_chunk(cache);
        }
    }

    /// Remove the row at `at`, destructing its component values. Returns
    /// the entity that was swapped into `at` to fill the gap, if any.
    pub fn remove(&mut self, at: ArchRow) -> Option<DisplacedRow> {
        let was_full = self.chunks[at.chunk].is_full();
        let displaced = self.chunks[at.chunk].remove_entity(at.row);
        self.entity_count -= 1;
        if was_full && !self.chunks[at.chunk].is_full() {
            self.open_chunks.push(at.chunk);
        }
        displaced
    }

    /// Move the entity at `src_row` in `self` into a newly allocated row
    /// of `dst`, moving shared components and dropping components only
    /// `self` has. Returns the destination row and any entity displaced
    /// in `self` by the vacancy left behind.
    pub fn move_into(
        &mut self,
        src_row: ArchRow,
        dst: &mut Archetype,
        dst_entity: Id,
        cache: &ComponentCache,
    ) -> (ArchRow, Option<DisplacedRow>) {
        let dst_row = dst.allocate(dst_entity, cache);

        let common: SmallVec<[(usize, usize); 8]> = self
            .signature
            .iter()
            .enumerate()
            .filter_map(|(src_col, id)| dst.column_of(*id).map(|dst_col| (src_col, dst_col)))
            .collect();
        let src_only: SmallVec<[usize; 8]> =
            self.signature.iter().enumerate().filter(|(_, id)| !dst.has(**id)).map(|(i, _)| i).collect();

        {
            let src_chunk = &mut self.chunks[src_row.chunk];
            let dst_chunk = &mut dst.chunks[dst_row.chunk];
            src_chunk.move_common_into(src_row.row, dst_chunk, dst_row.row, &common, &src_only);
        }

        let was_full = self.chunks[src_row.chunk].is_full();
        let displaced = self.chunks[src_row.chunk].vacate(src_row.row);
        self.entity_count -= 1;
        if was_full && !self.chunks[src_row.chunk].is_full() {
            self.open_chunks.push(src_row.chunk);
        }

        (dst_row, displaced)
    }

    pub fn set_enabled(&mut self, at: ArchRow, enabled: bool) -> Option<DisplacedRow> {
        self.chunks[at.chunk].set_enabled(at.row, enabled)
    }

    pub fn add_edge(&mut self, id: Id, target: usize) {
        self.add_edges.insert(id, target);
    }

    pub fn remove_edge(&mut self, id: Id, target: usize) {
        self.remove_edges.insert(id, target);
    }

    pub fn edge_add(&self, id: Id) -> Option<usize> {
        self.add_edges.get(&id).copied()
    }

    pub fn edge_remove(&self, id: Id) -> Option<usize> {
        self.remove_edges.get(&id).copied()
    }
}

/// Compute the canonical signature for a component set: sorted, deduped
/// ascending by raw 64-bit value (§3.5).
pub fn canonical_signature(mut ids: Vec<Id>) -> Signature {
    ids.sort_unstable();
    ids.dedup();
    ids.into()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chunk::TEST_CHUNK_BYTES;

    #[derive(Debug, Clone, Copy, PartialEq)]
    struct Pos {
        x: f32,
    }

    #[test]
    fn canonical_signature_sorts_and_dedups() {
        let a = Id::component(3);
        let b = Id::component(1);
        let sig = canonical_signature(vec![a, b, a]);
        assert_eq!(sig.as_slice(), &[b, a]);
    }

    #[test]
    fn allocate_spans_multiple_chunks_under_small_budget() {
        let mut cache = ComponentCache::new();
        let id = cache.register::<Pos>();
        let sig = canonical_signature(vec![id]);
        let mut arch = Archetype::with_budget(sig, &cache, TEST_CHUNK_BYTES);
        let per_chunk = arch.chunk_capacity;
        let mut locations = Vec::new();
        for i in 0..per_chunk + 1 {
            locations.push(arch.allocate(Id::entity(i as u32, 0), &cache));
        }
        assert_eq!(arch.chunks().len(), 2);
        assert_eq!(locations[per_chunk].chunk, 1);
    }

    #[test]
    fn remove_reports_displaced_entity() {
        let mut cache = ComponentCache::new();
        let id = cache.register::<Pos>();
        let sig = canonical_signature(vec![id]);
        let mut arch = Archetype::new(sig, &cache);
        let e0 = Id::entity(0, 0);
        let e1 = Id::entity(1, 0);
        let r0 = arch.allocate(e0, &cache);
        let _r1 = arch.allocate(e1, &cache);
        let displaced = arch.remove(r0).unwrap();
        assert_eq!(displaced.entity, e1);
        assert_eq!(arch.len(), 1);
    }

    #[test]
    fn move_into_carries_common_components_and_drops_the_rest() {
        let mut cache = ComponentCache::new();
        let pos_id = cache.register::<Pos>();
        let vel_id = cache.register::<i32>();
        let src_sig = canonical_signature(vec![pos_id, vel_id]);
        let dst_sig = canonical_signature(vec![pos_id]);
        let mut src = Archetype::new(src_sig, &cache);
        let mut dst = Archetype::new(dst_sig, &cache);

        let e = Id::entity(7, 0);
        let row = src.allocate(e, &cache);
        let pos_col = src.column_of(pos_id).unwrap();
        let vel_col = src.column_of(vel_id).unwrap();
        unsafe {
            src.chunks[row.chunk].write(pos_col, row.row, Pos { x: 9.0 });
            src.chunks[row.chunk].write(vel_col, row.row, 42i32);
        }

        let (dst_row, displaced) = src.move_into(row, &mut dst, e, &cache);
        assert!(displaced.is_none());
        let dst_pos_col = dst.column_of(pos_id).unwrap();
        let value = unsafe { dst.chunks[dst_row.chunk].get::<Pos>(dst_pos_col, dst_row.row) };
        assert_eq!(*value, Pos { x: 9.0 });
        assert_eq!(src.len(), 0);
    }
}
