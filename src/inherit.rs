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

//! Relationship and `Is` (inheritance) resolver (§3.6/§4.9).
//!
//! `(Is, Base)` makes an entity logically subsume every query term `Base`
//! satisfies, transitively. Acyclic by convention (spec §3.6); cycles are
//! not expected to be introduced, but a pathological one cannot make
//! `is()` loop forever because the frontier walk tracks visited nodes.

use std::num::NonZeroUsize;

use lru::LruCache;
use rustc_hash::FxHashMap;
use smallvec::SmallVec;

use crate::id::Id;

const CACHE_CAPACITY: usize = 1024;

/// Walks and caches `(Is, *)` chains.
pub struct InheritanceResolver {
    /// child -> direct `Is` bases.
    direct: FxHashMap<Id, SmallVec<[Id; 4]>>,
    cache: LruCache<(Id, Id), bool>,
    version: u64,
}

impl Default for InheritanceResolver {
    fn default() -> Self {
        Self::new()
    }
}

impl InheritanceResolver {
    pub fn new() -> Self {
        InheritanceResolver {
            direct: FxHashMap::default(),
            cache: LruCache::new(NonZeroUsize::new(CACHE_CAPACITY).unwrap()),
            version: 0,
        }
    }

    /// Monotonic counter bumped every time an `Is` edge is added or
    /// removed; callers use this to decide whether a query cache entry
    /// needs a full rescan (§4.5).
    pub fn version(&self) -> u64 {
        self.version
    }

    /// Record `(Is, base)` on `child`. Invalidates cached results, since
    /// new inheritance matches may now exist.
    pub fn add_is_edge(&mut self, child: Id, base: Id) {
        let bases = self.direct.entry(child).or_default();
        if !bases.contains(&base) {
            bases.push(base);
        }
        self.cache.clear();
        self.version += 1;
    }

    /// Remove `(Is, base)` from `child`. Invalidates the cache for the
    /// same reason.
    pub fn remove_is_edge(&mut self, child: Id, base: Id) {
        if let Some(bases) = self.direct.get_mut(&child) {
            bases.retain(|b| *b != base);
        }
        self.cache.clear();
        self.version += 1;
    }

    /// True if there is a chain `a →Is c1 →Is … →Is b`.
    pub fn is(&mut self, a: Id, b: Id) -> bool {
        if a == b {
            return true;
        }
        if let Some(cached) = self.cache.get(&(a, b)) {
            return *cached;
        }
        let mut visited: SmallVec<[Id; 16]> = SmallVec::new();
        let mut frontier: Vec<Id> = vec![a];
        let mut found = false;
        while let Some(node) = frontier.pop() {
            if visited.contains(&node) {
                continue;
            }
            visited.push(node);
            if let Some(bases) = self.direct.get(&node) {
                for &base in bases {
                    if base == b {
                        found = true;
                        break;
                    }
                    frontier.push(base);
                }
            }
            if found {
                break;
            }
        }
        self.cache.put((a, b), found);
        found
    }

    /// Direct `Is` bases of `child` (not transitive).
    pub fn direct_bases(&self, child: Id) -> &[Id] {
        self.direct.get(&child).map(|v| v.as_slice()).unwrap_or(&[])
    }
}

/// Enumerate the second element (`target`) of every pair `(rel, target)`
/// present in `signature`, calling `callback` for each.
pub fn targets(signature: &[Id], rel: Id, mut callback: impl FnMut(Id)) {
    for &id in signature {
        if id.is_pair() && id.first() == rel {
            callback(id.second());
        }
    }
}

/// Enumerate the first element (`relation`) of every pair `(relation,
/// tgt)` present in `signature`, calling `callback` for each.
pub fn relations(signature: &[Id], tgt: Id, mut callback: impl FnMut(Id)) {
    for &id in signature {
        if id.is_pair() && id.second() == tgt {
            callback(id.first());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn direct_is_resolves() {
        let mut r = InheritanceResolver::new();
        let child = Id::entity(1, 0);
        let base = Id::entity(2, 0);
        r.add_is_edge(child, base);
        assert!(r.is(child, base));
    }

    #[test]
    fn transitive_is_resolves() {
        let mut r = InheritanceResolver::new();
        let a = Id::entity(1, 0);
        let b = Id::entity(2, 0);
        let c = Id::entity(3, 0);
        r.add_is_edge(a, b);
        r.add_is_edge(b, c);
        assert!(r.is(a, c));
    }

    #[test]
    fn unrelated_entities_do_not_satisfy_is() {
        let mut r = InheritanceResolver::new();
        let a = Id::entity(1, 0);
        let b = Id::entity(2, 0);
        assert!(!r.is(a, b));
    }

    #[test]
    fn removing_an_edge_invalidates_cached_result() {
        let mut r = InheritanceResolver::new();
        let a = Id::entity(1, 0);
        let b = Id::entity(2, 0);
        r.add_is_edge(a, b);
        assert!(r.is(a, b));
        r.remove_is_edge(a, b);
        assert!(!r.is(a, b));
    }

    #[test]
    fn targets_and_relations_enumerate_pairs() {
        let eats = Id::component(10);
        let carrot = Id::entity(1, 0);
        let pair = Id::make_pair(eats, carrot);
        let sig = [pair];

        let mut found_targets = Vec::new();
        targets(&sig, eats, |t| found_targets.push(t));
        assert_eq!(found_targets, vec![carrot]);

        let mut found_relations = Vec::new();
        relations(&sig, carrot, |r| found_relations.push(r));
        assert_eq!(found_relations, vec![eats]);
    }
}
