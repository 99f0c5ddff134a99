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

//! Batched add/remove builder: folds a sequence of operations on one
//! entity into at most one archetype transition.

use rustc_hash::FxHashMap;

use crate::component::ComponentId;
use crate::entity::EntityId;

use super::World;

/// One queued operation in an [`EntityBuilder`] batch.
#[derive(Debug, Clone)]
pub enum BuilderOp {
    Add(ComponentId, Option<FxHashMap<String, f64>>),
    Remove(ComponentId),
}

/// Accumulates add/remove operations for one entity, applying them as a
/// single archetype move on [`EntityBuilder::commit`]. A remove beats any
/// add for the same component regardless of op order; among same-direction
/// ops on the same component, the later one wins. Add-observer firing
/// order follows the first time each component was mentioned.
pub struct EntityBuilder<'w> {
    world: &'w mut World,
    entity: EntityId,
    ops: Vec<BuilderOp>,
}

impl<'w> EntityBuilder<'w> {
    pub(super) fn new(world: &'w mut World, entity: EntityId) -> Self {
        Self { world, entity, ops: Vec::new() }
    }

    pub fn add(mut self, component: ComponentId) -> Self {
        self.ops.push(BuilderOp::Add(component, None));
        self
    }

    pub fn add_with_data(mut self, component: ComponentId, data: FxHashMap<String, f64>) -> Self {
        self.ops.push(BuilderOp::Add(component, Some(data)));
        self
    }

    pub fn remove(mut self, component: ComponentId) -> Self {
        self.ops.push(BuilderOp::Remove(component));
        self
    }

    /// Apply every queued operation as a single archetype transition.
    /// Returns `false` if the entity was already dead.
    pub fn commit(self) -> bool {
        self.world.commit_batch(self.entity, self.ops)
    }
}
