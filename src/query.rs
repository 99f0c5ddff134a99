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

//! Query planner: resolves `(with, without)` mask pairs to archetype
//! lists, and iterates them through a fast path (no filters) or a slow
//! path (per-row change/predicate/relation tests).

use std::cell::RefCell;
use std::ops::Deref;
use std::rc::Rc;

use rustc_hash::FxHashMap;

use crate::archetype::ChangeFlag;
use crate::archetype_graph::{ArchetypeGraph, ArchetypeIndex};
use crate::component::ComponentId;
use crate::entity::EntityId;
use crate::mask::ComponentMask;
use crate::relation::{RelationId, RelationStore};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeFilter {
    Added,
    Modified,
    Either,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelationDirection {
    Outgoing,
    Incoming,
}

/// A relation test against a specific target, or a wildcard ("has any").
#[derive(Debug, Clone, Copy)]
pub struct RelationFilter {
    pub relation: RelationId,
    pub direction: RelationDirection,
    pub target: Option<EntityId>,
}

type Predicate = dyn Fn(&crate::archetype::Archetype, usize) -> bool;

/// A query descriptor. Build with `with`/`without`/filters, then run it
/// through [`run`].
#[derive(Default)]
pub struct Query {
    with: ComponentMask,
    without: ComponentMask,
    change_filter: Option<ChangeFilter>,
    component_change_mask: Option<u64>,
    predicates: Vec<Box<Predicate>>,
    relation_filters: Vec<RelationFilter>,
}

impl Query {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, id: ComponentId) -> Self {
        self.with.set(id.0);
        self
    }

    pub fn without(mut self, id: ComponentId) -> Self {
        self.without.set(id.0);
        self
    }

    pub fn changed(mut self, filter: ChangeFilter) -> Self {
        self.change_filter = Some(filter);
        self
    }

    pub fn component_changed(mut self, mask: u64) -> Self {
        self.component_change_mask = Some(mask);
        self
    }

    pub fn predicate(mut self, f: impl Fn(&crate::archetype::Archetype, usize) -> bool + 'static) -> Self {
        self.predicates.push(Box::new(f));
        self
    }

    pub fn relation_filter(mut self, filter: RelationFilter) -> Self {
        self.relation_filters.push(filter);
        self
    }

    pub fn with_mask(&self) -> ComponentMask {
        self.with
    }

    pub fn without_mask(&self) -> ComponentMask {
        self.without
    }

    fn has_filters(&self) -> bool {
        self.change_filter.is_some()
            || self.component_change_mask.is_some()
            || !self.predicates.is_empty()
            || !self.relation_filters.is_empty()
    }

    fn row_matches(
        &self,
        arch: &crate::archetype::Archetype,
        row: usize,
        relations: &RelationStore,
        entity: EntityId,
    ) -> bool {
        if let Some(cf) = self.change_filter {
            let flag = arch.change_flag(row);
            let ok = match cf {
                ChangeFilter::Added => flag == ChangeFlag::Added,
                ChangeFilter::Modified => flag == ChangeFlag::Modified,
                ChangeFilter::Either => matches!(flag, ChangeFlag::Added | ChangeFlag::Modified),
            };
            if !ok {
                return false;
            }
        }
        if let Some(mask) = self.component_change_mask {
            if arch.component_dirty_bits(row) & mask == 0 {
                return false;
            }
        }
        for predicate in &self.predicates {
            if !predicate(arch, row) {
                return false;
            }
        }
        for filter in &self.relation_filters {
            let matches = match (filter.direction, filter.target) {
                (RelationDirection::Outgoing, Some(t)) => relations.has(filter.relation, entity, t),
                (RelationDirection::Outgoing, None) => relations.has_any_target(filter.relation, entity),
                (RelationDirection::Incoming, Some(t)) => relations.has(filter.relation, t, entity),
                (RelationDirection::Incoming, None) => relations.has_any_source(filter.relation, entity),
            };
            if !matches {
                return false;
            }
        }
        true
    }
}

/// Caches `(with, without)` -> matching archetype indices. New
/// archetypes are tested lazily against every live cache entry the next
/// time that entry is resolved.
#[derive(Default)]
pub struct QueryCache {
    entries: FxHashMap<(ComponentMask, ComponentMask), (Vec<ArchetypeIndex>, usize)>,
}

impl QueryCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn resolve(&mut self, graph: &ArchetypeGraph, with: ComponentMask, without: ComponentMask) -> &[ArchetypeIndex] {
        let entry = self.entries.entry((with, without)).or_insert_with(|| (Vec::new(), 0));
        let (matches, checked) = entry;
        for (idx, arch) in graph.iter().skip(*checked) {
            if with.is_subset_of(arch.mask()) && without.is_disjoint(arch.mask()) {
                matches.push(idx);
            }
        }
        *checked = graph.len();
        matches
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }
}

/// A pool of reusable entity-id buffers, shared by the world's query
/// call sites.
#[derive(Default)]
pub struct ViewPool {
    free: Vec<Vec<EntityId>>,
}

impl ViewPool {
    pub fn new() -> Self {
        Self::default()
    }

    fn acquire(&mut self) -> Vec<EntityId> {
        self.free.pop().unwrap_or_default()
    }

    fn release(&mut self, mut buf: Vec<EntityId>) {
        buf.clear();
        self.free.push(buf);
    }

    pub fn pooled_count(&self) -> usize {
        self.free.len()
    }
}

/// A query result: a sorted list of entities. Returns its buffer to the
/// pool on drop.
pub struct PooledView {
    entities: Vec<EntityId>,
    pool: Rc<RefCell<ViewPool>>,
}

impl Deref for PooledView {
    type Target = [EntityId];

    fn deref(&self) -> &[EntityId] {
        &self.entities
    }
}

impl Drop for PooledView {
    fn drop(&mut self) {
        let buf = std::mem::take(&mut self.entities);
        self.pool.borrow_mut().release(buf);
    }
}

impl PooledView {
    pub fn len(&self) -> usize {
        self.entities.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entities.is_empty()
    }

    pub fn first(&self) -> Option<EntityId> {
        self.entities.first().copied()
    }
}

/// Execute `query` against `graph`/`relations`, sorting the result by
/// entity slot index for deterministic iteration.
pub fn run(
    query: &Query,
    graph: &ArchetypeGraph,
    cache: &mut QueryCache,
    relations: &RelationStore,
    pool: &Rc<RefCell<ViewPool>>,
) -> PooledView {
    let archetypes = cache.resolve(graph, query.with, query.without).to_vec();
    let mut buf = pool.borrow_mut().acquire();

    if !query.has_filters() {
        for idx in archetypes {
            buf.extend_from_slice(graph.get(idx).entities());
        }
    } else {
        for idx in archetypes {
            let arch = graph.get(idx);
            for row in 0..arch.len() {
                let Some(entity) = arch.entity_at(row) else { continue };
                if query.row_matches(arch, row, relations, entity) {
                    buf.push(entity);
                }
            }
        }
    }

    buf.sort_unstable_by_key(|e| e.slot());
    PooledView { entities: buf, pool: pool.clone() }
}

/// Count matching entities without materializing a view when there are
/// no filters.
pub fn count(query: &Query, graph: &ArchetypeGraph, cache: &mut QueryCache, relations: &RelationStore) -> usize {
    let archetypes = cache.resolve(graph, query.with, query.without).to_vec();
    if !query.has_filters() {
        return archetypes.iter().map(|&idx| graph.get(idx).len()).sum();
    }
    let mut total = 0;
    for idx in archetypes {
        let arch = graph.get(idx);
        for row in 0..arch.len() {
            if let Some(entity) = arch.entity_at(row) {
                if query.row_matches(arch, row, relations, entity) {
                    total += 1;
                }
            }
        }
    }
    total
}

/// The first matching entity, or `None`, without materializing a view
/// when there are no filters.
pub fn first(query: &Query, graph: &ArchetypeGraph, cache: &mut QueryCache, relations: &RelationStore) -> Option<EntityId> {
    let archetypes = cache.resolve(graph, query.with, query.without).to_vec();
    if !query.has_filters() {
        for idx in archetypes {
            if let Some(e) = graph.get(idx).entities().first() {
                return Some(*e);
            }
        }
        return None;
    }
    for idx in archetypes {
        let arch = graph.get(idx);
        for row in 0..arch.len() {
            if let Some(entity) = arch.entity_at(row) {
                if query.row_matches(arch, row, relations, entity) {
                    return Some(entity);
                }
            }
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::component::{ComponentDescriptor, ComponentRegistry, FieldType};

    fn setup() -> (ComponentRegistry, ArchetypeGraph, ComponentId) {
        let mut reg = ComponentRegistry::new();
        let pos = reg
            .register(ComponentDescriptor::new("Position", &[("x", FieldType::F32, 0.0)]))
            .unwrap();
        let graph = ArchetypeGraph::new(&reg);
        (reg, graph, pos)
    }

    #[test]
    fn fast_path_yields_sorted_entities() {
        let (reg, mut graph, pos) = setup();
        let mut mask = ComponentMask::new();
        mask.set(pos.0);
        let idx = graph.get_or_create(mask, &reg);
        let arch = graph.get_mut(idx);
        arch.allocate_row(EntityId::new(5, 0));
        arch.allocate_row(EntityId::new(1, 0));
        arch.allocate_row(EntityId::new(3, 0));

        let mut cache = QueryCache::new();
        let relations = RelationStore::new();
        let pool = Rc::new(RefCell::new(ViewPool::new()));
        let q = Query::new().with(pos);
        let view = run(&q, &graph, &mut cache, &relations, &pool);
        let slots: Vec<u32> = view.iter().map(|e| e.slot()).collect();
        assert_eq!(slots, vec![1, 3, 5]);
    }

    #[test]
    fn without_mask_excludes_archetype() {
        let mut reg = ComponentRegistry::new();
        let pos = reg.register(ComponentDescriptor::new("Position", &[("x", FieldType::F32, 0.0)])).unwrap();
        let dead = reg.register(ComponentDescriptor::new("Dead", &[])).unwrap();
        let mut graph = ArchetypeGraph::new(&reg);

        let mut alive_mask = ComponentMask::new();
        alive_mask.set(pos.0);
        let alive_idx = graph.get_or_create(alive_mask, &reg);
        graph.get_mut(alive_idx).allocate_row(EntityId::new(1, 0));

        let mut dead_mask = ComponentMask::new();
        dead_mask.set(pos.0);
        dead_mask.set(dead.0);
        let dead_idx = graph.get_or_create(dead_mask, &reg);
        graph.get_mut(dead_idx).allocate_row(EntityId::new(2, 0));

        let mut cache = QueryCache::new();
        let relations = RelationStore::new();
        let pool = Rc::new(RefCell::new(ViewPool::new()));
        let q = Query::new().with(pos).without(dead);
        let view = run(&q, &graph, &mut cache, &relations, &pool);
        assert_eq!(view.len(), 1);
        assert_eq!(view[0].slot(), 1);
    }

    #[test]
    fn cache_picks_up_archetypes_created_after_first_resolve() {
        let (reg, mut graph, pos) = setup();
        let mut cache = QueryCache::new();
        let with = {
            let mut m = ComponentMask::new();
            m.set(pos.0);
            m
        };
        assert!(cache.resolve(&graph, with, ComponentMask::EMPTY).is_empty());

        let idx = graph.get_or_create(with, &reg);
        graph.get_mut(idx).allocate_row(EntityId::new(0, 0));
        assert_eq!(cache.resolve(&graph, with, ComponentMask::EMPTY).len(), 1);
    }

    #[test]
    fn pooled_view_returns_buffer_on_drop() {
        let (_, graph, _pos) = setup();
        let mut cache = QueryCache::new();
        let relations = RelationStore::new();
        let pool = Rc::new(RefCell::new(ViewPool::new()));
        {
            let q = Query::new();
            let _view = run(&q, &graph, &mut cache, &relations, &pool);
        }
        assert_eq!(pool.borrow().pooled_count(), 1);
    }
}
