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

//! The archetype graph: a hash index over archetypes keyed by their
//! component-id set, with lazily-computed add/remove transition edges
//! (§3.5/§4.5).

use ahash::AHashMap;

use crate::archetype::{canonical_signature, Archetype, Signature};
use crate::component::ComponentCache;
use crate::id::Id;

/// Owns every archetype that has ever been created in a world and the
/// signature→index lookup used to find or create them.
pub struct ArchetypeGraph {
    archetypes: Vec<Archetype>,
    by_signature: AHashMap<Signature, usize>,
    chunk_budget: usize,
}

impl ArchetypeGraph {
    pub fn new(chunk_budget: usize) -> Self {
        let mut graph = ArchetypeGraph {
            archetypes: Vec::new(),
            by_signature: AHashMap::new(),
            chunk_budget,
        };
        // Archetype 0 is always the empty archetype; this simplifies
        // every other lookup (freshly spawned entities start there).
        graph.find_or_create(&[], &ComponentCache::new());
        graph
    }

    pub fn get(&self, index: usize) -> &Archetype {
        &self.archetypes[index]
    }

    pub fn get_mut(&mut self, index: usize) -> &mut Archetype {
        &mut self.archetypes[index]
    }

    /// Get mutable references to two distinct archetypes at once (used
    /// by `move_entity`, which needs to mutate source and destination
    /// simultaneously).
    pub fn get_pair_mut(&mut self, a: usize, b: usize) -> (&mut Archetype, &mut Archetype) {
        assert_ne!(a, b, "get_pair_mut requires distinct archetype indices");
        if a < b {
            let (left, right) = self.archetypes.split_at_mut(b);
            (&mut left[a], &mut right[0])
        } else {
            let (left, right) = self.archetypes.split_at_mut(a);
            (&mut right[0], &mut left[b])
        }
    }

    pub fn len(&self) -> usize {
        self.archetypes.len()
    }

    pub fn empty_archetype(&self) -> usize {
        0
    }

    pub fn iter(&self) -> impl Iterator<Item = (usize, &Archetype)> {
        self.archetypes.iter().enumerate()
    }

    /// Look up the archetype for exactly this id set, creating it if
    /// this is the first time it's been seen.
    pub fn find_or_create(&mut self, ids: &[Id], cache: &ComponentCache) -> usize {
        let signature = canonical_signature(ids.to_vec());
        if let Some(&idx) = self.by_signature.get(&signature) {
            return idx;
        }
        #[cfg(feature = "profiling")]
        let _guard = tracing::info_span!("archetype_created", components = signature.len()).entered();

        let archetype = Archetype::with_budget(signature.clone(), cache, self.chunk_budget);
        let idx = self.archetypes.len();
        self.archetypes.push(archetype);
        self.by_signature.insert(signature, idx);
        idx
    }

    /// Follow (or lazily create) the add-transition edge for `id` from
    /// archetype `src`. Edges are add/remove-symmetric: the reverse
    /// `remove` edge on the destination is populated at the same time
    /// (§4.5).
    pub fn transition_add(&mut self, src: usize, id: Id, cache: &ComponentCache) -> usize {
        if let Some(dst) = self.archetypes[src].edge_add(id) {
            return dst;
        }
        if self.archetypes[src].has(id) {
            self.archetypes[src].add_edge(id, src);
            return src;
        }
        let mut ids: Vec<Id> = self.archetypes[src].signature().to_vec();
        ids.push(id);
        let dst = self.find_or_create(&ids, cache);
        self.archetypes[src].add_edge(id, dst);
        self.archetypes[dst].remove_edge(id, src);
        dst
    }

    /// Follow (or lazily create) the remove-transition edge for `id`
    /// from archetype `src`.
    pub fn transition_remove(&mut self, src: usize, id: Id, cache: &ComponentCache) -> usize {
        if let Some(dst) = self.archetypes[src].edge_remove(id) {
            return dst;
        }
        if !self.archetypes[src].has(id) {
            self.archetypes[src].remove_edge(id, src);
            return src;
        }
        let ids: Vec<Id> = self.archetypes[src].signature().iter().copied().filter(|i| *i != id).collect();
        let dst = self.find_or_create(&ids, cache);
        self.archetypes[src].remove_edge(id, dst);
        self.archetypes[dst].add_edge(id, src);
        dst
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Clone, Copy, PartialEq)]
    struct Pos {
        x: f32,
    }

    #[test]
    fn find_or_create_is_idempotent() {
        let mut cache = ComponentCache::new();
        let id = cache.register::<Pos>();
        let mut graph = ArchetypeGraph::new(16 * 1024);
        let a = graph.find_or_create(&[id], &cache);
        let b = graph.find_or_create(&[id], &cache);
        assert_eq!(a, b);
    }

    #[test]
    fn add_and_remove_edges_are_symmetric() {
        let mut cache = ComponentCache::new();
        let id = cache.register::<Pos>();
        let mut graph = ArchetypeGraph::new(16 * 1024);
        let empty = graph.empty_archetype();
        let with_pos = graph.transition_add(empty, id, &cache);
        assert_ne!(with_pos, empty);
        assert_eq!(graph.get(with_pos).edge_remove(id), Some(empty));

        let back = graph.transition_remove(with_pos, id, &cache);
        assert_eq!(back, empty);
        assert_eq!(graph.get(empty).edge_add(id), Some(with_pos));
    }

    #[test]
    fn adding_an_id_already_present_is_a_no_op_edge() {
        let mut cache = ComponentCache::new();
        let id = cache.register::<Pos>();
        let mut graph = ArchetypeGraph::new(16 * 1024);
        let empty = graph.empty_archetype();
        let with_pos = graph.transition_add(empty, id, &cache);
        let again = graph.transition_add(with_pos, id, &cache);
        assert_eq!(again, with_pos);
    }
}
