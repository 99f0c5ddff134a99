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

//! AAA ECS - data-oriented Entity Component System
//!
//! Archetype-based storage with a phase-partitioned scheduler, built for
//! deterministic simulation: identical registration order and identical
//! seeded inputs reproduce bitwise-identical world states.

pub mod archetype;
pub mod archetype_graph;
pub mod bitset;
pub mod command;
pub mod component;
pub mod entity;
pub mod entity_ref;
pub mod error;
pub mod event;
pub mod mask;
pub mod observer;
pub mod query;
pub mod relation;
pub mod schedule;
pub mod string_pool;
pub mod world;

pub use archetype::{Archetype, ChangeFlag};
pub use command::{CommandBuffer, CommandKind};
pub use component::{ComponentDescriptor, ComponentId, ComponentRegistry, FieldDescriptor, FieldType, MAX_COMPONENTS};
pub use entity::{EntityAllocator, EntityId, EntityLocation};
pub use entity_ref::{EntityRefStore, RefSite};
pub use error::{EcsError, Result};
pub use event::EventQueue;
pub use mask::{ComponentMask, MASK_BITS};
pub use observer::ObserverManager;
pub use query::{ChangeFilter, Query, QueryCache, RelationDirection, RelationFilter};
pub use relation::{RelationFlags, RelationId, RelationRegistry, RelationStore};
pub use schedule::{Condition, Phase, Schedule, SystemConfig, SystemSetConfig};
pub use string_pool::{StringId, StringPool, EMPTY};
pub use world::{EntityBuilder, MemoryStats, World};
