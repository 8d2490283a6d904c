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

//! Cleanup policy engine (§4.8): deciding what happens to the entities
//! that reference a deleted entity as a relationship target.
//!
//! `ChildOf` carries a default `(OnDeleteTarget, Delete)` policy, so
//! deleting a parent cascades to its children; any other relation
//! defaults to `(OnDeleteTarget, Remove)`, which just strips the dangling
//! pair instead of deleting the holder. Both can be overridden by
//! attaching an explicit `(OnDeleteTarget, Delete | Remove)` pair to the
//! relation entity itself.

use smallvec::SmallVec;

use crate::error::{EcsError, Result};
use crate::id::{Id, CHILD_OF, DELETE, REMOVE};

/// The world-side operations the cleanup engine needs; kept as a trait
/// so the traversal algorithm can be unit-tested without a real world.
pub trait CleanupHost {
    /// The relation's explicit `(OnDeleteTarget, policy)` override, if any.
    fn on_delete_target_policy(&self, relation: Id) -> Option<Id>;
    /// Every `(holder, relation)` such that `holder` carries the pair
    /// `(relation, target)`.
    fn holders_of(&self, target: Id, callback: &mut dyn FnMut(Id, Id));
    fn remove_pair(&mut self, holder: Id, relation: Id, target: Id);
    fn delete_entity(&mut self, entity: Id);
}

fn default_policy(relation: Id) -> Id {
    if relation == CHILD_OF {
        DELETE
    } else {
        REMOVE
    }
}

/// Delete `root` and cascade per each referencing relation's cleanup
/// policy. Returns [`EcsError::CleanupCycle`] (leaving nothing deleted
/// from this call) if the reference graph loops back on itself.
pub fn delete_with_cleanup(root: Id, host: &mut dyn CleanupHost) -> Result<()> {
    #[cfg(feature = "profiling")]
    let _guard = tracing::info_span!("cleanup_traversal", root = root.id()).entered();

    let mut visited: SmallVec<[Id; 16]> = SmallVec::new();
    delete_recursive(root, host, &mut visited)
}

fn delete_recursive(target: Id, host: &mut dyn CleanupHost, visited: &mut SmallVec<[Id; 16]>) -> Result<()> {
    if visited.contains(&target) {
        return Err(EcsError::CleanupCycle);
    }
    visited.push(target);

    let mut holders: SmallVec<[(Id, Id); 8]> = SmallVec::new();
    host.holders_of(target, &mut |holder, relation| holders.push((holder, relation)));

    for (holder, relation) in holders {
        let policy = host.on_delete_target_policy(relation).unwrap_or_else(|| default_policy(relation));
        if policy == DELETE {
            delete_recursive(holder, host, visited)?;
        } else {
            host.remove_pair(holder, relation, target);
        }
    }

    host.delete_entity(target);
    Ok(())
}

/// Dry-run cycle probe: would deleting `root` hit a cleanup cycle,
/// without deleting or modifying anything? Mirrors [`delete_recursive`]'s
/// traversal exactly — same non-backtracking `visited` set, so it shares
/// its false-positive behavior on legitimate DAG/diamond reference
/// shapes — so a caller (the command buffer's destroy validation, §5)
/// can check before committing to a destroy it can't easily undo.
pub fn would_cycle(root: Id, host: &dyn CleanupHost) -> bool {
    let mut visited: SmallVec<[Id; 16]> = SmallVec::new();
    would_cycle_recursive(root, host, &mut visited)
}

fn would_cycle_recursive(target: Id, host: &dyn CleanupHost, visited: &mut SmallVec<[Id; 16]>) -> bool {
    if visited.contains(&target) {
        return true;
    }
    visited.push(target);

    let mut holders: SmallVec<[(Id, Id); 8]> = SmallVec::new();
    host.holders_of(target, &mut |holder, relation| holders.push((holder, relation)));

    for (holder, relation) in holders {
        let policy = host.on_delete_target_policy(relation).unwrap_or_else(|| default_policy(relation));
        if policy == DELETE && would_cycle_recursive(holder, host, visited) {
            return true;
        }
    }
    false
}
