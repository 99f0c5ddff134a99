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

//! Mask-to-archetype map with memoized add/remove edges.
//!
//! Archetypes are created on demand and never destroyed — an archetype
//! that loses all its rows stays around empty rather than being dropped,
//! since queries cache against archetype indices.

use rustc_hash::FxHashMap;

use crate::archetype::Archetype;
use crate::component::{ComponentId, ComponentRegistry};
use crate::mask::ComponentMask;

/// Stable index of an archetype within the graph's storage.
pub type ArchetypeIndex = usize;

#[derive(Default)]
struct Edges {
    add: FxHashMap<u32, ArchetypeIndex>,
    remove: FxHashMap<u32, Option<ArchetypeIndex>>,
}

pub struct ArchetypeGraph {
    archetypes: Vec<Archetype>,
    by_mask: FxHashMap<ComponentMask, ArchetypeIndex>,
    edges: Vec<Edges>,
}

impl ArchetypeGraph {
    pub fn new(registry: &ComponentRegistry) -> Self {
        let mut graph = Self { archetypes: Vec::new(), by_mask: FxHashMap::default(), edges: Vec::new() };
        graph.get_or_create(ComponentMask::EMPTY, registry);
        graph
    }

    pub fn get(&self, index: ArchetypeIndex) -> &Archetype {
        &self.archetypes[index]
    }

    pub fn get_mut(&mut self, index: ArchetypeIndex) -> &mut Archetype {
        &mut self.archetypes[index]
    }

    pub fn len(&self) -> usize {
        self.archetypes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.archetypes.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (ArchetypeIndex, &Archetype)> {
        self.archetypes.iter().enumerate()
    }

    pub fn empty_archetype(&self) -> ArchetypeIndex {
        *self.by_mask.get(&ComponentMask::EMPTY).expect("empty archetype always exists")
    }

    /// Resolve `mask` to an archetype, creating it (and registering it in
    /// the by-mask index) if it hasn't been seen before.
    pub fn get_or_create(&mut self, mask: ComponentMask, registry: &ComponentRegistry) -> ArchetypeIndex {
        if let Some(&idx) = self.by_mask.get(&mask) {
            return idx;
        }
        let idx = self.archetypes.len();
        self.archetypes.push(Archetype::new(mask, registry));
        self.edges.push(Edges::default());
        self.by_mask.insert(mask, idx);
        idx
    }

    /// The archetype reached by adding `component` to `from`'s mask.
    /// Memoized per (archetype, component) pair.
    pub fn edge_add(&mut self, from: ArchetypeIndex, component: ComponentId, registry: &ComponentRegistry) -> ArchetypeIndex {
        if let Some(&cached) = self.edges[from].add.get(&component.0) {
            return cached;
        }
        let mut mask = *self.archetypes[from].mask();
        mask.set(component.0);
        let dest = self.get_or_create(mask, registry);
        self.edges[from].add.insert(component.0, dest);
        dest
    }

    /// The archetype reached by removing `component` from `from`'s mask,
    /// or `None` if the result mask is empty.
    pub fn edge_remove(&mut self, from: ArchetypeIndex, component: ComponentId, registry: &ComponentRegistry) -> Option<ArchetypeIndex> {
        if let Some(&cached) = self.edges[from].remove.get(&component.0) {
            return cached;
        }
        let mut mask = *self.archetypes[from].mask();
        mask.clear(component.0);
        let dest = if mask.is_empty() { None } else { Some(self.get_or_create(mask, registry)) };
        self.edges[from].remove.insert(component.0, dest);
        dest
    }

    /// Copy `component`'s bytes for `src_row` in the archetype at
    /// `src_idx` into `dest_row` of the archetype at `dest_idx`. The two
    /// indices must differ; used by world-level structural edits where a
    /// row is moved between archetypes one component at a time.
    pub fn copy_component(&mut self, dest_idx: ArchetypeIndex, dest_row: usize, src_idx: ArchetypeIndex, src_row: usize, component: ComponentId) {
        debug_assert_ne!(dest_idx, src_idx);
        let (lo, hi) = if src_idx < dest_idx { (src_idx, dest_idx) } else { (dest_idx, src_idx) };
        let (left, right) = self.archetypes.split_at_mut(hi);
        if src_idx < dest_idx {
            right[0].copy_component_from(dest_row, &left[lo], src_row, component);
        } else {
            left[lo].copy_component_from(dest_row, &right[0], src_row, component);
        }
    }
}
