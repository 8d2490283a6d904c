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

//! Error kinds surfaced by the core (see spec §7).

use std::fmt;

/// ECS core error type.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EcsError {
    /// Operation on a dead or malformed entity.
    InvalidEntity,

    /// `get<T>` on an entity lacking `T`.
    ComponentNotFound,

    /// Registering the same component type twice with mismatched
    /// descriptors. The existing descriptor is retained.
    DuplicateRegistration,

    /// Adding an id forbidden by a `CantCombine` relationship. The
    /// target component was not added.
    ArchetypeConflict,

    /// Recursive `Delete` cleanup policy cycle detected; the deletion
    /// that triggered it was rolled back.
    CleanupCycle,

    /// A command buffer replay step failed; the whole commit was rolled
    /// back and no part of it is observable.
    CommandBufferAborted(String),

    /// A textual query string (§6.2) did not parse: unknown term kind,
    /// unresolvable component name, or malformed grouping syntax.
    QueryParseError(String),
}

impl fmt::Display for EcsError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EcsError::InvalidEntity => write!(f, "invalid or dead entity"),
            EcsError::ComponentNotFound => write!(f, "component not present on entity"),
            EcsError::DuplicateRegistration => {
                write!(f, "component already registered with a different descriptor")
            }
            EcsError::ArchetypeConflict => write!(f, "id forbidden by a CantCombine relationship"),
            EcsError::CleanupCycle => write!(f, "cleanup policy cycle detected"),
            EcsError::CommandBufferAborted(msg) => write!(f, "command buffer commit aborted: {msg}"),
            EcsError::QueryParseError(msg) => write!(f, "query parse error: {msg}"),
        }
    }
}

impl std::error::Error for EcsError {}

/// Result type alias used throughout the core.
pub type Result<T> = std::result::Result<T, EcsError>;
