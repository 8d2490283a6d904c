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

//! Archetype ECS - archetype-based entity component storage and query core.
//!
//! Entities are grouped into archetypes by their exact component set and
//! stored in fixed-capacity chunks. Structural edits (`add`/`remove`/
//! `despawn`) move a row between archetypes along a lazily-built
//! transition graph; relationship pairs and `Is`-based prototype
//! inheritance let a query match more than plain component presence.

pub mod archetype;
pub mod bitset;
pub mod chunk;
pub mod cleanup;
pub mod command;
pub mod component;
pub mod entity;
pub mod error;
pub mod graph;
pub mod id;
pub mod inherit;
pub mod prelude;
pub mod query;
pub mod sparse;
pub mod utils;
pub mod world;

pub use archetype::{ArchRow, Archetype, Signature};
pub use command::{CommandBuffer, CommandChannel, CommandSink};
pub use component::{Component, ComponentCache, ComponentDescriptor};
pub use entity::EntityContainer;
pub use error::{EcsError, Result};
pub use id::{Id, ALL, ID_BAD};
pub use query::{IterMode, Op, QueryCache, QueryPlan, Term};
pub use world::World;
