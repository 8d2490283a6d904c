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

//! Query compiler, cache and executor (§3.5/§4.6/§6.2).
//!
//! A query is a list of [`Term`]s compiled once into a [`QueryPlan`] and
//! matched against every archetype in the world's [`crate::graph::ArchetypeGraph`].
//! Matching results are cached by plan hash; the cache entry tracks how
//! many archetypes it has already scanned so a new archetype only costs
//! one incremental match, not a full rescan. A new `Is` edge can change
//! which archetypes satisfy an existing plan (prototype inheritance), so
//! every cache entry also records the inheritance resolver's version and
//! forces a full rescan when that version has moved on.

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::ops::Range;

use rustc_hash::FxHashMap;

use crate::chunk::Chunk;
use crate::error::{EcsError, Result};
use crate::graph::ArchetypeGraph;
use crate::id::{Id, ALL, IS_A};

/// How a term participates in matching.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Op {
    /// Must be present.
    All,
    /// At least one `Any` term among the plan's `Any` terms must be present.
    Any,
    /// Must be absent.
    None,
    /// May or may not be present; never affects matching.
    Opt,
}

/// Data access a term requests, used to decide whether iterating it
/// should bump the owning chunk's per-component version (§4.6).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Access {
    /// No data access, presence check only.
    None,
    Read,
    Write,
}

/// One clause of a query.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Term {
    pub op: Op,
    pub access: Access,
    pub id: Id,
}

impl Term {
    pub fn new(op: Op, access: Access, id: Id) -> Self {
        Term { op, access, id }
    }
}

/// A compiled, matchable query.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct QueryPlan {
    pub terms: Vec<Term>,
    pub group_by: Option<Id>,
    /// Components a `changed<T>()` clause (§6.2) was attached to. Each
    /// one is also implicitly required present, same as an `All` term —
    /// a component can't have "changed" on an archetype that never had
    /// it. Matching is evaluated at chunk granularity against the
    /// query's own last-run tick (see [`QueryCache::take_change_since`]),
    /// not per-row.
    pub changed: Vec<Id>,
}

impl QueryPlan {
    pub fn new(terms: Vec<Term>) -> Self {
        QueryPlan { terms, group_by: None, changed: Vec::new() }
    }

    pub fn grouped_by(mut self, relation: Id) -> Self {
        self.group_by = Some(relation);
        self
    }

    /// Add a `changed<T>()` clause for `id` (§6.2, scenario S5).
    pub fn changed(mut self, id: Id) -> Self {
        self.changed.push(id);
        self
    }

    /// Stable hash used as the query cache key.
    pub fn plan_hash(&self) -> u64 {
        let mut hasher = DefaultHasher::new();
        self.hash(&mut hasher);
        hasher.finish()
    }
}

/// Callback a caller supplies so the matcher can resolve prototype
/// (`IsA`) inheritance without the query module needing to know about
/// entity storage: "does `base` itself directly carry `component`?"
pub trait PrototypeLookup {
    fn has_component(&self, base: Id, component: Id) -> bool;
}

fn id_matches(candidate: Id, pattern: Id) -> bool {
    if !pattern.is_pair() {
        return candidate == pattern;
    }
    if !candidate.is_pair() {
        return false;
    }
    let first_ok = pattern.first() == ALL || pattern.first() == candidate.first();
    let second_ok = pattern.second() == ALL || pattern.second() == candidate.second();
    first_ok && second_ok
}

/// True if `term_id` is present on `signature`, directly or by way of an
/// `IsA` prototype chain.
fn term_present(term_id: Id, signature: &[Id], prototypes: &dyn PrototypeLookup) -> bool {
    if signature.iter().any(|&id| id_matches(id, term_id)) {
        return true;
    }
    if term_id.is_pair() {
        return false;
    }
    signature
        .iter()
        .filter(|id| id.is_pair() && id.first() == IS_A)
        .any(|pair| prototypes.has_component(pair.second(), term_id))
}

/// Evaluate `plan` against one archetype's signature.
pub fn archetype_matches(plan: &QueryPlan, signature: &[Id], prototypes: &dyn PrototypeLookup) -> bool {
    let has_any_terms = plan.terms.iter().any(|t| t.op == Op::Any);
    let mut any_satisfied = !has_any_terms;
    for term in &plan.terms {
        let present = term_present(term.id, signature, prototypes);
        match term.op {
            Op::All => {
                if !present {
                    return false;
                }
            }
            Op::None => {
                if present {
                    return false;
                }
            }
            Op::Opt => {}
            Op::Any => {
                if present {
                    any_satisfied = true;
                }
            }
        }
    }
    if !any_satisfied {
        return false;
    }
    plan.changed.iter().all(|&id| term_present(id, signature, prototypes))
}

/// Group already-matched archetypes by the target of `relation` on each
/// archetype's signature.
pub fn group_matches(matches: &[usize], relation: Id, graph: &ArchetypeGraph) -> FxHashMap<Id, Vec<usize>> {
    let mut groups: FxHashMap<Id, Vec<usize>> = FxHashMap::default();
    for &idx in matches {
        let sig = graph.get(idx).signature();
        for id in sig {
            if id.is_pair() && id.first() == relation {
                groups.entry(id.second()).or_default().push(idx);
            }
        }
    }
    groups
}

struct CacheEntry {
    plan: QueryPlan,
    matches: Vec<usize>,
    seen_up_to: usize,
    inherit_version_at_build: u64,
    /// The world tick this plan's `changed<T>()` clause was last
    /// evaluated against. `None` until the plan's first run, meaning
    /// "nothing to compare against yet — report everything present" (a
    /// freshly-set component reads as changed on the very first run).
    /// Advances to the current tick each time
    /// [`QueryCache::take_change_since`] is called, so a "changed since
    /// last run" query only reports what changed between two consecutive
    /// runs of the same plan.
    change_since: Option<u64>,
}

/// Caches per-plan matched-archetype lists, rescanning incrementally.
#[derive(Default)]
pub struct QueryCache {
    entries: FxHashMap<u64, CacheEntry>,
}

impl QueryCache {
    pub fn new() -> Self {
        QueryCache { entries: FxHashMap::default() }
    }

    /// Return the matched archetype list for `plan`, rescanning only the
    /// archetypes created since the last call (or doing a full rescan if
    /// an `Is` edge has been added since, per §4.5).
    pub fn matches(
        &mut self,
        plan: &QueryPlan,
        graph: &ArchetypeGraph,
        prototypes: &dyn PrototypeLookup,
        inherit_version: u64,
    ) -> &[usize] {
        let key = plan.plan_hash();
        #[cfg(feature = "profiling")]
        let is_new = !self.entries.contains_key(&key);
        let entry = self.entries.entry(key).or_insert_with(|| CacheEntry {
            plan: plan.clone(),
            matches: Vec::new(),
            seen_up_to: 0,
            inherit_version_at_build: inherit_version,
            change_since: None,
        });

        let stale = entry.inherit_version_at_build != inherit_version;
        if stale {
            entry.matches.clear();
            entry.seen_up_to = 0;
            entry.inherit_version_at_build = inherit_version;
        }

        #[cfg(feature = "profiling")]
        if is_new || stale {
            let _guard = tracing::info_span!("query_cache_miss", plan = key, stale).entered();
        }

        for (idx, archetype) in graph.iter().skip(entry.seen_up_to) {
            if archetype_matches(&entry.plan, archetype.signature(), prototypes) {
                entry.matches.push(idx);
            }
        }
        entry.seen_up_to = graph.len();
        &entry.matches
    }

    /// Drop every cached result, forcing every plan to rescan on next use.
    pub fn invalidate_all(&mut self) {
        self.entries.clear();
    }

    /// Read this plan's last-run tick for change detection and advance
    /// it to `new_tick` (scenario S5: each run of a `changed<T>()` query
    /// only sees changes since the *previous* run of that same plan).
    ///
    /// The plan's cache entry must already exist — call [`Self::matches`]
    /// (directly or via `World::query_archetypes`) first.
    pub fn take_change_since(&mut self, plan: &QueryPlan, new_tick: u64) -> Option<u64> {
        let key = plan.plan_hash();
        let entry = self
            .entries
            .get_mut(&key)
            .expect("take_change_since called before matches() populated this plan's cache entry");
        std::mem::replace(&mut entry.change_since, Some(new_tick))
    }
}

/// Which partition of a chunk's rows a query iterates.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IterMode {
    EnabledOnly,
    DisabledOnly,
    All,
}

/// Row index range a chunk contributes under `mode`.
pub fn row_range(chunk: &Chunk, mode: IterMode) -> Range<usize> {
    match mode {
        IterMode::EnabledOnly => 0..chunk.enabled_count(),
        IterMode::DisabledOnly => chunk.enabled_count()..chunk.count(),
        IterMode::All => 0..chunk.count(),
    }
}

/// Textual query grammar (§6.2):
///
/// ```text
/// query         := term (',' term)*
/// term          := any_group | changed_group | plain_term
/// any_group     := 'any' '(' plain_term (',' plain_term)* ')'
/// changed_group := 'changed' '(' ident (',' ident)* ')'
/// plain_term    := op? access? ref
/// op            := '!' | '?'
/// access        := '&'
/// ref           := ident | '(' ident ',' (ident | '*') ')'
/// ```
///
/// `resolve` maps a bare identifier (component/entity name, or `"*"` for
/// the [`ALL`] wildcard) to its [`Id`]. Returns the plain/any terms and,
/// separately, the component ids named by `changed(...)` clauses — the
/// caller attaches the latter to [`QueryPlan::changed`].
pub fn parse(text: &str, resolve: &mut dyn FnMut(&str) -> Option<Id>) -> Result<(Vec<Term>, Vec<Id>)> {
    let mut terms = Vec::new();
    let mut changed = Vec::new();
    for raw in split_top_level(text) {
        let raw = raw.trim();
        if raw.is_empty() {
            continue;
        }
        if let Some(inner) = raw.strip_prefix("any(").and_then(|s| s.strip_suffix(')')) {
            for part in split_top_level(inner) {
                let (access, id) = parse_ref(part.trim(), resolve)?;
                terms.push(Term::new(Op::Any, access, id));
            }
            continue;
        }
        if let Some(inner) = raw.strip_prefix("changed(").and_then(|s| s.strip_suffix(')')) {
            for part in split_top_level(inner) {
                changed.push(resolve_component_ref(part.trim(), resolve)?);
            }
            continue;
        }
        let (op, rest) = match raw.strip_prefix('!') {
            Some(rest) => (Op::None, rest),
            None => match raw.strip_prefix('?') {
                Some(rest) => (Op::Opt, rest),
                None => (Op::All, raw),
            },
        };
        let (access, id) = parse_ref(rest.trim(), resolve)?;
        terms.push(Term::new(op, access, id));
    }
    Ok((terms, changed))
}

fn parse_ref(text: &str, resolve: &mut dyn FnMut(&str) -> Option<Id>) -> Result<(Access, Id)> {
    let (access, rest) = match text.strip_prefix('&') {
        Some(rest) => (Access::Write, rest),
        None => (Access::Read, text),
    };
    let rest = rest.trim();
    let id = if let Some(inner) = rest.strip_prefix('(').and_then(|s| s.strip_suffix(')')) {
        let mut parts = inner.splitn(2, ',');
        let first = parts.next().unwrap_or("").trim();
        let second = parts.next().unwrap_or("").trim();
        let first_id = resolve_component_ref(first, resolve)?;
        let second_id = resolve_component_ref(second, resolve)?;
        Id::make_pair(first_id, second_id)
    } else {
        resolve_component_ref(rest, resolve)?
    };
    Ok((access, id))
}

fn resolve_component_ref(name: &str, resolve: &mut dyn FnMut(&str) -> Option<Id>) -> Result<Id> {
    if name == "*" {
        return Ok(ALL);
    }
    resolve(name).ok_or_else(|| EcsError::QueryParseError(format!("unknown query term '{name}'")))
}

fn split_top_level(text: &str) -> Vec<&str> {
    let mut parts = Vec::new();
    let mut depth = 0i32;
    let mut start = 0usize;
    for (i, ch) in text.char_indices() {
        match ch {
            '(' => depth += 1,
            ')' => depth -= 1,
            ',' if depth == 0 => {
                parts.push(&text[start..i]);
                start = i + 1;
            }
            _ => {}
        }
    }
    parts.push(&text[start..]);
    parts
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::archetype::canonical_signature;

    struct NoPrototypes;
    impl PrototypeLookup for NoPrototypes {
        fn has_component(&self, _base: Id, _component: Id) -> bool {
            false
        }
    }

    fn resolver(position: Id, velocity: Id) -> impl FnMut(&str) -> Option<Id> {
        move |name: &str| match name {
            "Position" => Some(position),
            "Velocity" => Some(velocity),
            _ => None,
        }
    }

    #[test]
    fn all_term_requires_presence() {
        let position = Id::component(20);
        let velocity = Id::component(21);
        let plan = QueryPlan::new(vec![Term::new(Op::All, Access::Read, position)]);
        let sig = canonical_signature(vec![position, velocity]);
        assert!(archetype_matches(&plan, &sig, &NoPrototypes));
        let empty = canonical_signature(vec![velocity]);
        assert!(!archetype_matches(&plan, &empty, &NoPrototypes));
    }

    #[test]
    fn none_term_forbids_presence() {
        let position = Id::component(20);
        let velocity = Id::component(21);
        let plan = QueryPlan::new(vec![
            Term::new(Op::All, Access::Read, position),
            Term::new(Op::None, Access::None, velocity),
        ]);
        let with_velocity = canonical_signature(vec![position, velocity]);
        assert!(!archetype_matches(&plan, &with_velocity, &NoPrototypes));
        let without = canonical_signature(vec![position]);
        assert!(archetype_matches(&plan, &without, &NoPrototypes));
    }

    #[test]
    fn any_term_matches_when_one_of_the_group_is_present() {
        let position = Id::component(20);
        let velocity = Id::component(21);
        let plan = QueryPlan::new(vec![
            Term::new(Op::Any, Access::Read, position),
            Term::new(Op::Any, Access::Read, velocity),
        ]);
        let only_velocity = canonical_signature(vec![velocity]);
        assert!(archetype_matches(&plan, &only_velocity, &NoPrototypes));
        let neither = canonical_signature(vec![Id::component(99)]);
        assert!(!archetype_matches(&plan, &neither, &NoPrototypes));
    }

    #[test]
    fn wildcard_pair_matches_any_target() {
        let likes = Id::component(30);
        let sugar = Id::entity(1, 0);
        let pair = Id::make_pair(likes, sugar);
        let plan = QueryPlan::new(vec![Term::new(Op::All, Access::Read, Id::make_pair(likes, ALL))]);
        let sig = canonical_signature(vec![pair]);
        assert!(archetype_matches(&plan, &sig, &NoPrototypes));
    }

    #[test]
    fn parse_reads_plain_none_and_optional_terms() {
        let position = Id::component(20);
        let velocity = Id::component(21);
        let (terms, changed) = parse("Position, !Velocity, ?Velocity", &mut resolver(position, velocity)).unwrap();
        assert_eq!(terms.len(), 3);
        assert_eq!(terms[0].op, Op::All);
        assert_eq!(terms[1].op, Op::None);
        assert_eq!(terms[2].op, Op::Opt);
        assert!(changed.is_empty());
    }

    #[test]
    fn parse_reads_any_group_and_write_access() {
        let position = Id::component(20);
        let velocity = Id::component(21);
        let (terms, _changed) = parse("any(&Position, Velocity)", &mut resolver(position, velocity)).unwrap();
        assert_eq!(terms.len(), 2);
        assert_eq!(terms[0].op, Op::Any);
        assert_eq!(terms[0].access, Access::Write);
        assert_eq!(terms[1].access, Access::Read);
    }

    #[test]
    fn parse_reads_changed_group() {
        let position = Id::component(20);
        let velocity = Id::component(21);
        let (terms, changed) = parse("Position, changed(Position)", &mut resolver(position, velocity)).unwrap();
        assert_eq!(terms.len(), 1);
        assert_eq!(changed, vec![position]);
    }

    #[test]
    fn unresolvable_term_is_a_parse_error_not_a_command_buffer_error() {
        let err = parse("Unknown", &mut resolver(Id::component(20), Id::component(21))).unwrap_err();
        assert!(matches!(err, EcsError::QueryParseError(_)));
    }

    #[test]
    fn query_cache_rescans_only_new_archetypes() {
        use crate::component::ComponentCache;

        let mut cache = ComponentCache::new();
        let position = cache.register::<f32>();
        let mut graph = ArchetypeGraph::new(16 * 1024);
        let empty = graph.empty_archetype();
        let with_pos = graph.transition_add(empty, position, &cache);

        let plan = QueryPlan::new(vec![Term::new(Op::All, Access::Read, position)]);
        let mut qcache = QueryCache::new();
        let matches = qcache.matches(&plan, &graph, &NoPrototypes, 0);
        assert_eq!(matches, &[with_pos]);

        let second = graph.transition_add(with_pos, Id::component(999), &cache);
        let matches = qcache.matches(&plan, &graph, &NoPrototypes, 0);
        assert!(matches.contains(&with_pos));
        assert!(matches.contains(&second));
    }
}
