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

//! The world facade: the single type that wires the archetype store,
//! entity allocator, string pool, relations, queries, command buffer,
//! events, and observers into one coherent API.
//!
//! Every structural edit (spawn/despawn/add/remove/batch) moves at most
//! one row between archetypes and keeps the entity allocator's location
//! table, the string pool's refcounts, and the entity-reference index in
//! sync as part of that single move.

use std::cell::RefCell;
use std::rc::Rc;

use rustc_hash::{FxHashMap, FxHashSet};
use serde_json::Value;

use crate::archetype_graph::{ArchetypeGraph, ArchetypeIndex};
use crate::component::{ComponentDescriptor, ComponentId, ComponentRegistry, FieldType};
use crate::entity::{EntityAllocator, EntityId, EntityLocation};
use crate::entity_ref::{EntityRefStore, RefSite};
use crate::error::Result;
use crate::event::EventQueue;
use crate::mask::ComponentMask;
use crate::observer::ObserverManager;
use crate::query::{self, PooledView, Query, QueryCache, ViewPool};
use crate::relation::{RelationFlags, RelationId, RelationRegistry, RelationStore};
use crate::schedule::Schedule;
use crate::string_pool::{StringId, StringPool, EMPTY};

mod builder;
pub use builder::{BuilderOp, EntityBuilder};

use crate::command::{CommandBuffer, CommandKind};

#[inline]
fn as_u32(value: f64) -> u32 {
    value as i64 as u32
}

#[inline]
fn is_null_bits(bits: u32) -> bool {
    bits == EntityId::NULL.to_bits()
}

/// Point-in-time counts useful for diagnostics and tests; not part of the
/// serialization format.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemoryStats {
    pub archetype_count: usize,
    pub entity_count: usize,
    pub slot_count: usize,
    pub component_count: usize,
    pub interned_strings: usize,
    pub pooled_views: usize,
}

/// The ECS world: owns every entity, component byte buffer, relation,
/// and the deferred command/event machinery built on top of them.
pub struct World {
    registry: ComponentRegistry,
    strings: StringPool,
    allocator: EntityAllocator,
    graph: ArchetypeGraph,
    relation_registry: RelationRegistry,
    relations: RelationStore,
    entity_refs: EntityRefStore,
    query_cache: QueryCache,
    view_pool: Rc<RefCell<ViewPool>>,
    commands: CommandBuffer,
    events: EventQueue,
    observers: ObserverManager,
    despawning: FxHashSet<u32>,
    tick: u64,
    resources: FxHashMap<String, Value>,
    state: FxHashMap<String, String>,
}

impl World {
    pub fn new(registry: ComponentRegistry) -> Self {
        let graph = ArchetypeGraph::new(&registry);
        Self {
            registry,
            strings: StringPool::new(),
            allocator: EntityAllocator::new(),
            graph,
            relation_registry: RelationRegistry::new(),
            relations: RelationStore::new(),
            entity_refs: EntityRefStore::new(),
            query_cache: QueryCache::new(),
            view_pool: Rc::new(RefCell::new(ViewPool::new())),
            commands: CommandBuffer::new(),
            events: EventQueue::new(),
            observers: ObserverManager::new(),
            despawning: FxHashSet::default(),
            tick: 0,
            resources: FxHashMap::default(),
            state: FxHashMap::default(),
        }
    }

    // ---- component registry -------------------------------------------

    /// Register a component and make it a valid target for deferred
    /// add/remove commands.
    pub fn register_component(&mut self, descriptor: ComponentDescriptor) -> Result<ComponentId> {
        let id = self.registry.register(descriptor)?;
        self.commands.register_component(id);
        Ok(id)
    }

    pub fn component_registry(&self) -> &ComponentRegistry {
        &self.registry
    }

    // ---- string pool ----------------------------------------------------

    pub fn string_pool(&self) -> &StringPool {
        &self.strings
    }

    /// Intern `s` directly, bypassing a component field. Used by snapshot
    /// loaders that need a pool index before writing component data.
    pub fn intern_string(&mut self, s: &str) -> StringId {
        self.strings.intern(s)
    }

    pub fn release_string(&mut self, id: StringId) {
        self.strings.release_ref(id);
    }

    // ---- liveness --------------------------------------------------------

    pub fn is_alive(&self, entity: EntityId) -> bool {
        self.allocator.is_alive(entity)
    }

    pub fn entity_count(&self) -> usize {
        self.allocator.live_count()
    }

    fn current_archetype(&self, entity: EntityId) -> ArchetypeIndex {
        self.allocator.location(entity).map(|l| l.archetype).unwrap_or_else(|| self.graph.empty_archetype())
    }

    fn read_field_bits(&self, archetype_idx: ArchetypeIndex, row: usize, component: ComponentId, desc: &ComponentDescriptor, field_idx: usize) -> u32 {
        let field = &desc.fields[field_idx];
        let value = self.graph.get(archetype_idx).get_field(row, component, desc, &field.name).unwrap_or(field.default);
        as_u32(value)
    }

    /// After a component's bytes are freshly written (spawn/add/batch),
    /// adopt whatever String/EntityRef values landed there: add a pool
    /// ref for a non-empty string, record an entity-ref site.
    fn adopt_fresh_fields(&mut self, entity: EntityId, archetype_idx: ArchetypeIndex, row: usize, component: ComponentId, desc: &ComponentDescriptor) {
        for (idx, field) in desc.fields.iter().enumerate() {
            match field.ty {
                FieldType::String => {
                    let bits = self.read_field_bits(archetype_idx, row, component, desc, idx);
                    if bits != EMPTY {
                        self.strings.add_ref(bits);
                    }
                }
                FieldType::EntityRef => {
                    let bits = self.read_field_bits(archetype_idx, row, component, desc, idx);
                    let site = RefSite { source: entity, component, field_index: idx as u32 };
                    let target = if is_null_bits(bits) { None } else { Some(EntityId::from_bits(bits)) };
                    self.entity_refs.set(site, target);
                }
                _ => {}
            }
        }
    }

    /// Before a component's row is freed (despawn/remove), release
    /// whatever String/EntityRef bookkeeping it held.
    fn release_component_fields(&mut self, entity: EntityId, archetype_idx: ArchetypeIndex, row: usize, component: ComponentId, desc: &ComponentDescriptor) {
        for (idx, field) in desc.fields.iter().enumerate() {
            match field.ty {
                FieldType::String => {
                    let bits = self.read_field_bits(archetype_idx, row, component, desc, idx);
                    if bits != EMPTY {
                        self.strings.release_ref(bits);
                    }
                }
                FieldType::EntityRef => {
                    self.entity_refs.clear(RefSite { source: entity, component, field_index: idx as u32 });
                }
                _ => {}
            }
        }
    }

    fn place_new_entity(&mut self, entity: EntityId, components: &[ComponentId]) {
        if components.is_empty() {
            self.allocator.set_location(entity, None);
            return;
        }
        let mut mask = ComponentMask::new();
        for c in components {
            mask.set(c.0);
        }
        let archetype_idx = self.graph.get_or_create(mask, &self.registry);
        let row = self.graph.get_mut(archetype_idx).allocate_row(entity);
        self.allocator.set_location(entity, Some(EntityLocation { archetype: archetype_idx, row }));
        for &component in components {
            let Some(desc) = self.registry.lookup_by_index(component).cloned() else { continue };
            self.graph.get_mut(archetype_idx).init_component_defaults(row, component, &desc, &FxHashMap::default());
            self.adopt_fresh_fields(entity, archetype_idx, row, component, &desc);
            self.observers.notify_add(component, entity);
        }
    }

    // ---- spawn / despawn -------------------------------------------------

    /// Spawn a new entity with `components`, each initialized to its
    /// registered defaults.
    pub fn spawn(&mut self, components: &[ComponentId]) -> Result<EntityId> {
        let entity = self.allocator.allocate()?;
        self.place_new_entity(entity, components);
        Ok(entity)
    }

    /// Restore a specific identifier (snapshot load). Fails if the slot
    /// is currently live.
    pub fn spawn_with_id(&mut self, entity: EntityId, components: &[ComponentId]) -> Result<EntityId> {
        self.allocator.allocate_with_id(entity)?;
        self.place_new_entity(entity, components);
        Ok(entity)
    }

    /// Despawn `entity`: fires remove-observers for each of its
    /// components, releases string/entity-ref bookkeeping, nullifies
    /// incoming `EntityRef` fields, drops its relation triples (cascading
    /// to any cascade-delete source), and frees the slot. Returns `false`
    /// for a dead entity or one already being despawned on the current
    /// call stack (cascade-cycle guard).
    pub fn despawn(&mut self, entity: EntityId) -> bool {
        if !self.allocator.is_alive(entity) {
            return false;
        }
        if !self.despawning.insert(entity.slot()) {
            return false;
        }

        if let Some(loc) = self.allocator.location(entity) {
            let components: Vec<ComponentId> = self.graph.get(loc.archetype).component_order().to_vec();
            for component in components {
                let Some(desc) = self.registry.lookup_by_index(component).cloned() else { continue };
                self.observers.notify_remove(component, entity);
                self.release_component_fields(entity, loc.archetype, loc.row, component, &desc);
            }
            if let Some(moved_entity) = self.graph.get_mut(loc.archetype).free_row(loc.row) {
                self.allocator.set_location(moved_entity, Some(loc));
            }
        }
        self.allocator.set_location(entity, None);

        let incoming = self.entity_refs.sites_targeting(entity);
        self.entity_refs.remove_entity(entity);
        for site in incoming {
            if !self.allocator.is_alive(site.source) {
                continue;
            }
            let Some(source_loc) = self.allocator.location(site.source) else { continue };
            let Some(desc) = self.registry.lookup_by_index(site.component).cloned() else { continue };
            let Some(field) = desc.fields.get(site.field_index as usize) else { continue };
            self.graph.get_mut(source_loc.archetype).set_field(
                source_loc.row,
                site.component,
                &desc,
                &field.name,
                EntityId::NULL.to_bits() as f64,
            );
        }

        let cascades = {
            let World { relation_registry, relations, .. } = self;
            relations.remove_entity(entity, |rid| relation_registry.flags(rid).unwrap_or_default())
        };
        for cascade in cascades {
            let Some(resolved) = self.allocator.entity_at_slot(cascade.slot()) else { continue };
            if self.allocator.is_alive(resolved) {
                self.despawn(resolved);
            }
        }

        let wrapped = self.allocator.free(entity);
        if wrapped {
            #[cfg(feature = "profiling")]
            tracing::warn!(slot = entity.slot(), "entity generation wrapped; stale identifiers may resurrect");
            #[cfg(not(feature = "profiling"))]
            let _ = wrapped;
        }
        self.despawning.remove(&entity.slot());
        true
    }

    // ---- component data ---------------------------------------------------

    pub fn get(&self, entity: EntityId, component: ComponentId) -> Option<FxHashMap<String, f64>> {
        let loc = self.allocator.location(entity)?;
        let arch = self.graph.get(loc.archetype);
        if !arch.has_component(component) {
            return None;
        }
        let desc = self.registry.lookup_by_index(component)?;
        let mut out = FxHashMap::default();
        for field in &desc.fields {
            if let Some(v) = arch.get_field(loc.row, component, desc, &field.name) {
                out.insert(field.name.clone(), v);
            }
        }
        Some(out)
    }

    /// Like [`World::get`] but writes into a caller-owned buffer instead
    /// of allocating a fresh map.
    pub fn get_into(&self, entity: EntityId, component: ComponentId, buf: &mut FxHashMap<String, f64>) -> bool {
        let Some(loc) = self.allocator.location(entity) else { return false };
        let arch = self.graph.get(loc.archetype);
        if !arch.has_component(component) {
            return false;
        }
        let Some(desc) = self.registry.lookup_by_index(component) else { return false };
        buf.clear();
        for field in &desc.fields {
            if let Some(v) = arch.get_field(loc.row, component, desc, &field.name) {
                buf.insert(field.name.clone(), v);
            }
        }
        true
    }

    pub fn has_component(&self, entity: EntityId, component: ComponentId) -> bool {
        self.allocator.location(entity).map(|loc| self.graph.get(loc.archetype).has_component(component)).unwrap_or(false)
    }

    /// Raw single-field read, skipping the full-component map.
    pub fn get_field(&self, entity: EntityId, component: ComponentId, field: &str) -> Option<f64> {
        let loc = self.allocator.location(entity)?;
        let arch = self.graph.get(loc.archetype);
        if !arch.has_component(component) {
            return None;
        }
        let desc = self.registry.lookup_by_index(component)?;
        arch.get_field(loc.row, component, desc, field)
    }

    /// Raw single-field write. The hot numeric path: it updates the
    /// archetype's change flag but does not fire set-observers and does
    /// not adjust string/entity-ref bookkeeping — callers touching a
    /// `String` or `EntityRef` field should go through [`World::set`] or
    /// [`World::set_string`] instead.
    pub fn set_field(&mut self, entity: EntityId, component: ComponentId, field: &str, value: f64) -> bool {
        let Some(loc) = self.allocator.location(entity) else { return false };
        if !self.graph.get(loc.archetype).has_component(component) {
            return false;
        }
        let Some(desc) = self.registry.lookup_by_index(component).cloned() else { return false };
        let arch = self.graph.get_mut(loc.archetype);
        if !arch.set_field(loc.row, component, &desc, field, value) {
            return false;
        }
        arch.mark_changed(loc.row, component);
        true
    }

    /// Update a subset of `component`'s fields on `entity`, maintaining
    /// string-pool and entity-ref bookkeeping for any touched `String`/
    /// `EntityRef` field, and notifying set-observers with the full
    /// before/after component snapshot.
    pub fn set(&mut self, entity: EntityId, component: ComponentId, partial: &FxHashMap<String, f64>) -> bool {
        let Some(loc) = self.allocator.location(entity) else { return false };
        if !self.graph.get(loc.archetype).has_component(component) {
            return false;
        }
        let Some(desc) = self.registry.lookup_by_index(component).cloned() else { return false };
        if desc.is_tag {
            return false;
        }

        let mut old = FxHashMap::default();
        {
            let arch = self.graph.get(loc.archetype);
            for field in &desc.fields {
                let current = arch.get_field(loc.row, component, &desc, &field.name).unwrap_or(field.default);
                old.insert(field.name.clone(), current);
            }
        }

        for (idx, field) in desc.fields.iter().enumerate() {
            let Some(&new_value) = partial.get(&field.name) else { continue };
            let old_value = old[&field.name];
            if field.ty == FieldType::String {
                let old_id = as_u32(old_value);
                let new_id = as_u32(new_value);
                if old_id != new_id {
                    if old_id != EMPTY {
                        self.strings.release_ref(old_id);
                    }
                    if new_id != EMPTY {
                        self.strings.add_ref(new_id);
                    }
                }
            }
            self.graph.get_mut(loc.archetype).set_field(loc.row, component, &desc, &field.name, new_value);
            if field.ty == FieldType::EntityRef {
                let bits = as_u32(new_value);
                let site = RefSite { source: entity, component, field_index: idx as u32 };
                let target = if is_null_bits(bits) { None } else { Some(EntityId::from_bits(bits)) };
                self.entity_refs.set(site, target);
            }
        }
        self.graph.get_mut(loc.archetype).mark_changed(loc.row, component);

        let mut new = old.clone();
        for (k, &v) in partial {
            new.insert(k.clone(), v);
        }
        self.observers.notify_set(component, entity, &old, &new);
        true
    }

    /// Convenience wrapper over [`World::set`] for a single `String`
    /// field: interns `text` (or uses [`EMPTY`] for an empty string),
    /// skipping the intern/release pair entirely when `text` already
    /// matches the field's current value.
    pub fn set_string(&mut self, entity: EntityId, component: ComponentId, field: &str, text: &str) -> bool {
        let Some(loc) = self.allocator.location(entity) else { return false };
        if !self.graph.get(loc.archetype).has_component(component) {
            return false;
        }
        let Some(desc) = self.registry.lookup_by_index(component).cloned() else { return false };
        let Some(field_desc) = desc.field(field) else { return false };
        if field_desc.ty != FieldType::String {
            return false;
        }

        let old_id = as_u32(self.graph.get(loc.archetype).get_field(loc.row, component, &desc, field).unwrap_or(field_desc.default));
        let unchanged = match self.strings.get(old_id) {
            Some(current) => current == text,
            None => text.is_empty(),
        };
        if unchanged {
            return true;
        }

        let new_id = if text.is_empty() { EMPTY } else { self.strings.intern(text) };
        let mut partial = FxHashMap::default();
        partial.insert(field.to_string(), new_id as f64);
        let changed = self.set(entity, component, &partial);
        // `intern` above already bumped `new_id`'s refcount for this
        // occurrence; `set`'s String-field branch bumps it again for the
        // same transition. Undo the extra bump now that the slot is
        // guaranteed to still be interned (its count is at least 2 here),
        // rather than before `set`, which could recycle a brand-new slot
        // out from under it.
        if new_id != EMPTY {
            self.strings.release_ref(new_id);
        }
        changed
    }

    pub fn get_string(&self, entity: EntityId, component: ComponentId, field: &str) -> Option<String> {
        let value = self.get_field(entity, component, field)?;
        self.strings.get(as_u32(value)).map(|s| s.to_string())
    }

    /// Add `component` to `entity`, moving it to the archetype reached by
    /// [`crate::archetype_graph::ArchetypeGraph::edge_add`]. Fails (no-op)
    /// if the entity is dead or already has `component`.
    pub fn add(&mut self, entity: EntityId, component: ComponentId, data: Option<FxHashMap<String, f64>>) -> bool {
        if !self.allocator.is_alive(entity) {
            return false;
        }
        let current_idx = self.current_archetype(entity);
        if self.graph.get(current_idx).has_component(component) {
            return false;
        }
        let Some(desc) = self.registry.lookup_by_index(component).cloned() else { return false };

        let dest_idx = self.graph.edge_add(current_idx, component, &self.registry);
        let dest_row = self.graph.get_mut(dest_idx).allocate_row(entity);

        if let Some(loc) = self.allocator.location(entity) {
            let existing: Vec<ComponentId> = self.graph.get(loc.archetype).component_order().to_vec();
            for existing_component in existing {
                self.graph.copy_component(dest_idx, dest_row, loc.archetype, loc.row, existing_component);
            }
            if let Some(moved_entity) = self.graph.get_mut(loc.archetype).free_row(loc.row) {
                self.allocator.set_location(moved_entity, Some(loc));
            }
        }

        self.allocator.set_location(entity, Some(EntityLocation { archetype: dest_idx, row: dest_row }));
        let overrides = data.unwrap_or_default();
        self.graph.get_mut(dest_idx).init_component_defaults(dest_row, component, &desc, &overrides);
        self.adopt_fresh_fields(entity, dest_idx, dest_row, component, &desc);
        self.observers.notify_add(component, entity);
        true
    }

    /// `add` if `entity` doesn't already carry `component`, `set`
    /// otherwise.
    pub fn add_or_set(&mut self, entity: EntityId, component: ComponentId, data: Option<FxHashMap<String, f64>>) -> bool {
        if !self.allocator.is_alive(entity) {
            return false;
        }
        let current_idx = self.current_archetype(entity);
        if self.graph.get(current_idx).has_component(component) {
            self.set(entity, component, &data.unwrap_or_default())
        } else {
            self.add(entity, component, data)
        }
    }

    /// Remove `component` from `entity`, releasing its string/entity-ref
    /// bookkeeping first. Despawns no entity even if the resulting mask
    /// is empty — an entity with zero components stays alive with no
    /// archetype location.
    pub fn remove(&mut self, entity: EntityId, component: ComponentId) -> bool {
        let Some(loc) = self.allocator.location(entity) else { return false };
        if !self.graph.get(loc.archetype).has_component(component) {
            return false;
        }
        let Some(desc) = self.registry.lookup_by_index(component).cloned() else { return false };

        self.observers.notify_remove(component, entity);
        self.release_component_fields(entity, loc.archetype, loc.row, component, &desc);

        match self.graph.edge_remove(loc.archetype, component, &self.registry) {
            None => {
                if let Some(moved_entity) = self.graph.get_mut(loc.archetype).free_row(loc.row) {
                    self.allocator.set_location(moved_entity, Some(loc));
                }
                self.allocator.set_location(entity, None);
            }
            Some(dest_idx) => {
                let dest_row = self.graph.get_mut(dest_idx).allocate_row(entity);
                let remaining: Vec<ComponentId> = self.graph.get(dest_idx).component_order().to_vec();
                for remaining_component in remaining {
                    self.graph.copy_component(dest_idx, dest_row, loc.archetype, loc.row, remaining_component);
                }
                if let Some(moved_entity) = self.graph.get_mut(loc.archetype).free_row(loc.row) {
                    self.allocator.set_location(moved_entity, Some(loc));
                }
                self.allocator.set_location(entity, Some(EntityLocation { archetype: dest_idx, row: dest_row }));
            }
        }
        true
    }

    // ---- batched structural edits -----------------------------------------

    /// Begin a batch of add/remove operations on `entity`, applied as at
    /// most one archetype transition when [`EntityBuilder::commit`] is
    /// called.
    pub fn batch(&mut self, entity: EntityId) -> EntityBuilder<'_> {
        EntityBuilder::new(self, entity)
    }

    fn commit_batch(&mut self, entity: EntityId, ops: Vec<BuilderOp>) -> bool {
        if !self.allocator.is_alive(entity) {
            return false;
        }

        // A remove beats any add for the same component regardless of op
        // order; among same-direction ops on the same component, the later
        // one wins.
        let mut removed: FxHashSet<u32> = FxHashSet::default();
        let mut decisions: FxHashMap<u32, Option<FxHashMap<String, f64>>> = FxHashMap::default();
        let mut first_seen: Vec<u32> = Vec::new();
        for op in ops {
            match op {
                BuilderOp::Add(c, data) => {
                    if !decisions.contains_key(&c.0) {
                        first_seen.push(c.0);
                    }
                    decisions.insert(c.0, Some(data.unwrap_or_default()));
                }
                BuilderOp::Remove(c) => {
                    if !decisions.contains_key(&c.0) {
                        first_seen.push(c.0);
                    }
                    decisions.insert(c.0, None);
                    removed.insert(c.0);
                }
            }
        }
        for id in &removed {
            decisions.insert(*id, None);
        }

        let current_idx = self.current_archetype(entity);
        let current_components: Vec<ComponentId> = self.graph.get(current_idx).component_order().to_vec();

        let mut final_components: Vec<ComponentId> = Vec::new();
        let mut overrides: FxHashMap<u32, FxHashMap<String, f64>> = FxHashMap::default();
        for c in &current_components {
            match decisions.get(&c.0) {
                Some(None) => {}
                Some(Some(data)) => {
                    final_components.push(*c);
                    overrides.insert(c.0, data.clone());
                }
                None => final_components.push(*c),
            }
        }

        let mut newly_added: Vec<ComponentId> = Vec::new();
        for raw in &first_seen {
            if current_components.iter().any(|c| c.0 == *raw) {
                continue;
            }
            if let Some(Some(data)) = decisions.get(raw) {
                let c = ComponentId(*raw);
                final_components.push(c);
                overrides.insert(*raw, data.clone());
                newly_added.push(c);
            }
        }

        if final_components.is_empty() {
            return self.despawn(entity);
        }

        let mut mask = ComponentMask::new();
        for c in &final_components {
            mask.set(c.0);
        }

        if mask == *self.graph.get(current_idx).mask() {
            for c in &final_components {
                if let Some(data) = overrides.get(&c.0) {
                    self.set(entity, *c, data);
                }
            }
            return true;
        }

        let removed_components: Vec<ComponentId> = current_components.iter().copied().filter(|c| !final_components.iter().any(|fc| fc.0 == c.0)).collect();
        let intersecting: Vec<ComponentId> = current_components.iter().copied().filter(|c| final_components.iter().any(|fc| fc.0 == c.0)).collect();

        let old_loc = self.allocator.location(entity);
        if let Some(loc) = old_loc {
            for component in &removed_components {
                let Some(desc) = self.registry.lookup_by_index(*component).cloned() else { continue };
                self.observers.notify_remove(*component, entity);
                self.release_component_fields(entity, loc.archetype, loc.row, *component, &desc);
            }
        }

        let dest_idx = self.graph.get_or_create(mask, &self.registry);
        let dest_row = self.graph.get_mut(dest_idx).allocate_row(entity);

        if let Some(loc) = old_loc {
            for component in &intersecting {
                self.graph.copy_component(dest_idx, dest_row, loc.archetype, loc.row, *component);
            }
            if let Some(moved_entity) = self.graph.get_mut(loc.archetype).free_row(loc.row) {
                self.allocator.set_location(moved_entity, Some(loc));
            }
        }
        self.allocator.set_location(entity, Some(EntityLocation { archetype: dest_idx, row: dest_row }));

        for component in &newly_added {
            let Some(desc) = self.registry.lookup_by_index(*component).cloned() else { continue };
            let data = overrides.get(&component.0).cloned().unwrap_or_default();
            self.graph.get_mut(dest_idx).init_component_defaults(dest_row, *component, &desc, &data);
            self.adopt_fresh_fields(entity, dest_idx, dest_row, *component, &desc);
            self.observers.notify_add(*component, entity);
        }
        for component in &intersecting {
            if let Some(data) = overrides.get(&component.0).cloned() {
                self.set(entity, *component, &data);
            }
        }
        true
    }

    // ---- relations ---------------------------------------------------------

    pub fn register_relation(&mut self, name: impl Into<String>, flags: RelationFlags) -> Result<RelationId> {
        self.relation_registry.register(name, flags)
    }

    pub fn relation_registry(&self) -> &RelationRegistry {
        &self.relation_registry
    }

    pub fn relate(&mut self, relation: RelationId, source: EntityId, target: EntityId, data: Option<f64>) {
        if !self.allocator.is_alive(source) || !self.allocator.is_alive(target) {
            return;
        }
        let flags = self.relation_registry.flags(relation).unwrap_or_default();
        self.relations.add(relation, flags, source, target, data);
    }

    pub fn unrelate(&mut self, relation: RelationId, source: EntityId, target: EntityId) -> bool {
        let flags = self.relation_registry.flags(relation).unwrap_or_default();
        self.relations.remove(relation, flags, source, target)
    }

    pub fn has_relation(&self, relation: RelationId, source: EntityId, target: EntityId) -> bool {
        self.relations.has(relation, source, target)
    }

    /// For exclusive relations only: the one target, re-resolved through
    /// the entity allocator for a correct generation.
    pub fn relation_target(&self, relation: RelationId, source: EntityId) -> Result<Option<EntityId>> {
        let flags = self.relation_registry.flags(relation).unwrap_or_default();
        let name = self.relation_registry.name(relation).unwrap_or("<unknown>");
        let raw = self.relations.get_target(relation, flags, name, source)?;
        Ok(raw.and_then(|e| self.allocator.entity_at_slot(e.slot())))
    }

    pub fn relation_targets(&self, relation: RelationId, source: EntityId) -> Vec<EntityId> {
        self.relations.get_targets(relation, source).into_iter().filter_map(|e| self.allocator.entity_at_slot(e.slot())).collect()
    }

    pub fn relation_sources(&self, relation: RelationId, target: EntityId) -> Vec<EntityId> {
        self.relations.get_sources(relation, target).into_iter().filter_map(|e| self.allocator.entity_at_slot(e.slot())).collect()
    }

    pub fn has_any_relation_target(&self, relation: RelationId, source: EntityId) -> bool {
        self.relations.has_any_target(relation, source)
    }

    pub fn has_any_relation_source(&self, relation: RelationId, target: EntityId) -> bool {
        self.relations.has_any_source(relation, target)
    }

    pub fn relation_target_count(&self, relation: RelationId, source: EntityId) -> usize {
        self.relations.count_targets(relation, source)
    }

    pub fn relation_source_count(&self, relation: RelationId, target: EntityId) -> usize {
        self.relations.count_sources(relation, target)
    }

    pub fn relation_data(&self, relation: RelationId, source: EntityId, target: EntityId) -> Option<f64> {
        self.relations.get_data(relation, source, target)
    }

    pub fn set_relation_data(&mut self, relation: RelationId, source: EntityId, target: EntityId, value: f64) -> bool {
        self.relations.set_data(relation, source, target, value)
    }

    pub fn for_each_relation(&self, relation: RelationId, mut callback: impl FnMut(EntityId, EntityId)) {
        self.relations.for_each(relation, |s, t| {
            if let (Some(s), Some(t)) = (self.allocator.entity_at_slot(s.slot()), self.allocator.entity_at_slot(t.slot())) {
                callback(s, t);
            }
        });
    }

    pub fn has_any_relation(&self, entity: EntityId) -> bool {
        self.relations.has_any_relation(entity)
    }

    // ---- queries -------------------------------------------------------

    pub fn query(&self) -> Query {
        Query::new()
    }

    pub fn run_query(&mut self, q: &Query) -> PooledView {
        let World { graph, query_cache, relations, view_pool, .. } = self;
        query::run(q, graph, query_cache, relations, view_pool)
    }

    pub fn count_query(&mut self, q: &Query) -> usize {
        let World { graph, query_cache, relations, .. } = self;
        query::count(q, graph, query_cache, relations)
    }

    pub fn first_query(&mut self, q: &Query) -> Option<EntityId> {
        let World { graph, query_cache, relations, .. } = self;
        query::first(q, graph, query_cache, relations)
    }

    /// Whether any live row anywhere in the archetype store carries
    /// `component` — the `entity_exists_with_component` schedule
    /// condition.
    pub fn any_entity_has_component(&self, component: ComponentId) -> bool {
        self.graph.iter().any(|(_, arch)| arch.has_component(component) && !arch.is_empty())
    }

    // ---- command buffer --------------------------------------------------

    pub fn commands(&mut self) -> &mut CommandBuffer {
        &mut self.commands
    }

    /// Apply every queued command, in (sort-key, sequence) order.
    pub fn flush_commands(&mut self) -> Result<()> {
        let commands = self.commands.flush()?;
        for command in commands {
            match command {
                CommandKind::Spawn { components } => {
                    self.spawn(&components)?;
                }
                CommandKind::Despawn { entity } => {
                    self.despawn(entity);
                }
                CommandKind::Add { entity, component, data } => {
                    self.add(entity, component, data);
                }
                CommandKind::Remove { entity, component } => {
                    self.remove(entity, component);
                }
            }
        }
        Ok(())
    }

    // ---- events ----------------------------------------------------------

    pub fn emit(&mut self, event_type: &str, value: Value) {
        self.events.emit(event_type, value);
    }

    pub fn on_event(&mut self, event_type: &str, priority: i32, callback: impl FnMut(&Value) + 'static) -> u64 {
        self.events.on(event_type, priority, callback)
    }

    pub fn on_any_event(&mut self, priority: i32, callback: impl FnMut(&Value) + 'static) -> u64 {
        self.events.on_any(priority, callback)
    }

    pub fn unsubscribe_event(&mut self, id: u64) {
        self.events.unsubscribe(id);
    }

    pub fn flush_events(&mut self) -> Result<()> {
        self.events.flush()
    }

    pub fn flush_events_recursive(&mut self, max_depth: u32) -> Result<bool> {
        self.events.flush_recursive(max_depth)
    }

    pub fn drain_events(&mut self, event_type: &str) -> Vec<Value> {
        self.events.drain(event_type)
    }

    pub fn peek_events(&self, event_type: &str) -> Vec<Value> {
        self.events.peek(event_type)
    }

    pub fn clear_events(&mut self) {
        self.events.clear();
    }

    pub fn event_pending_count(&self, event_type: &str) -> usize {
        self.events.pending_count(event_type)
    }

    pub fn set_event_recording(&mut self, recording: bool) {
        self.events.set_recording(recording);
    }

    pub fn event_log(&self) -> impl Iterator<Item = (&str, u64, &Value)> {
        self.events.log_entries()
    }

    // ---- observers ---------------------------------------------------------

    pub fn on_add(&mut self, component: ComponentId, callback: impl FnMut(EntityId) + 'static) -> u64 {
        self.observers.on_add(component, callback)
    }

    pub fn on_remove(&mut self, component: ComponentId, callback: impl FnMut(EntityId) + 'static) -> u64 {
        self.observers.on_remove(component, callback)
    }

    pub fn on_set(&mut self, component: ComponentId, callback: impl FnMut(EntityId, &FxHashMap<String, f64>, &FxHashMap<String, f64>) + 'static) -> u64 {
        self.observers.on_set(component, callback)
    }

    pub fn on_component_change(&mut self, component: ComponentId, callback: impl FnMut(EntityId) + 'static) -> u64 {
        self.observers.on_change(component, callback)
    }

    pub fn unsubscribe_observer(&mut self, id: u64) {
        self.observers.unsubscribe(id);
    }

    // ---- resources / state (scheduler conditions) -------------------------

    pub fn tick(&self) -> u64 {
        self.tick
    }

    pub fn has_resource(&self, name: &str) -> bool {
        self.resources.contains_key(name)
    }

    pub fn set_resource(&mut self, name: impl Into<String>, value: Value) {
        self.resources.insert(name.into(), value);
    }

    pub fn get_resource(&self, name: &str) -> Option<&Value> {
        self.resources.get(name)
    }

    pub fn remove_resource(&mut self, name: &str) -> Option<Value> {
        self.resources.remove(name)
    }

    pub fn state_get(&self, key: &str) -> Option<&str> {
        self.state.get(key).map(|s| s.as_str())
    }

    pub fn set_state(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.state.insert(key.into(), value.into());
    }

    // ---- tick / scheduler integration --------------------------------------

    /// Run `schedule` once, then flush the event queue and clear every
    /// archetype's per-row change tracking before advancing the tick
    /// counter.
    pub fn run_tick(&mut self, schedule: &mut Schedule) -> Result<()> {
        self.events.set_current_tick(self.tick);
        schedule.run(self)?;
        self.events.flush()?;
        for idx in 0..self.graph.len() {
            self.graph.get_mut(idx).clear_change_flags();
        }
        self.tick += 1;
        Ok(())
    }

    // ---- diagnostics / reset ------------------------------------------------

    pub fn memory_stats(&self) -> MemoryStats {
        MemoryStats {
            archetype_count: self.graph.len(),
            entity_count: self.allocator.live_count(),
            slot_count: self.allocator.slot_count(),
            component_count: self.registry.count(),
            interned_strings: self.strings.len(),
            pooled_views: self.view_pool.borrow().pooled_count(),
        }
    }

    /// Drop every entity, archetype, and relation triple. Component and
    /// relation registries, observers, and event subscriptions survive —
    /// they describe the schema, not the simulated state.
    pub fn clear(&mut self) {
        self.graph = ArchetypeGraph::new(&self.registry);
        self.allocator = EntityAllocator::new();
        self.relations.clear();
        self.entity_refs = EntityRefStore::new();
        self.query_cache = QueryCache::new();
        self.commands.clear();
        self.events.clear();
        self.despawning.clear();
        self.tick = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::component::ComponentDescriptor;

    fn registry_with_position_velocity() -> (ComponentRegistry, ComponentId, ComponentId) {
        let mut reg = ComponentRegistry::new();
        let pos = reg
            .register(ComponentDescriptor::new("Position", &[("x", FieldType::F32, 0.0), ("y", FieldType::F32, 0.0)]))
            .unwrap();
        let vel = reg
            .register(ComponentDescriptor::new("Velocity", &[("dx", FieldType::F32, 1.0), ("dy", FieldType::F32, 1.0)]))
            .unwrap();
        (reg, pos, vel)
    }

    #[test]
    fn spawn_initializes_defaults_and_get_roundtrips() {
        let (reg, pos, _vel) = registry_with_position_velocity();
        let mut world = World::new(reg);
        let e = world.spawn(&[pos]).unwrap();
        let data = world.get(e, pos).unwrap();
        assert_eq!(data["x"], 0.0);
        assert_eq!(data["y"], 0.0);
        assert!(world.set_field(e, pos, "x", 5.0));
        assert_eq!(world.get_field(e, pos, "x"), Some(5.0));
    }

    #[test]
    fn despawn_frees_slot_and_rejects_stale_identifier() {
        let (reg, pos, _vel) = registry_with_position_velocity();
        let mut world = World::new(reg);
        let e = world.spawn(&[pos]).unwrap();
        assert!(world.despawn(e));
        assert!(!world.is_alive(e));
        assert!(!world.despawn(e));
        assert!(world.get(e, pos).is_none());
    }

    #[test]
    fn add_then_remove_round_trips_through_archetypes() {
        let (reg, pos, vel) = registry_with_position_velocity();
        let mut world = World::new(reg);
        let e = world.spawn(&[pos]).unwrap();
        assert!(world.add(e, vel, None));
        assert!(world.has_component(e, vel));
        assert_eq!(world.get_field(e, pos, "x"), Some(0.0));
        assert!(world.remove(e, vel));
        assert!(!world.has_component(e, vel));
        assert!(world.has_component(e, pos));
    }

    #[test]
    fn batch_builder_applies_single_archetype_transition_in_call_order() {
        let mut reg = ComponentRegistry::new();
        let pos = reg.register(ComponentDescriptor::new("Position", &[("x", FieldType::F32, 0.0)])).unwrap();
        let vel = reg.register(ComponentDescriptor::new("Velocity", &[("dx", FieldType::F32, 0.0)])).unwrap();
        let health = reg.register(ComponentDescriptor::new("Health", &[("hp", FieldType::I32, 100.0)])).unwrap();
        let mut world = World::new(reg);

        let order = Rc::new(RefCell::new(Vec::new()));
        {
            let order = order.clone();
            world.on_add(pos, move |_| order.borrow_mut().push("Position"));
        }
        {
            let order = order.clone();
            world.on_add(vel, move |_| order.borrow_mut().push("Velocity"));
        }
        {
            let order = order.clone();
            world.on_add(health, move |_| order.borrow_mut().push("Health"));
        }

        let e = world.spawn(&[]).unwrap();
        let archetype_count_before = world.memory_stats().archetype_count;
        world.batch(e).add(pos).add(vel).add(health).commit();

        assert!(world.has_component(e, pos));
        assert!(world.has_component(e, vel));
        assert!(world.has_component(e, health));
        assert_eq!(*order.borrow(), vec!["Position", "Velocity", "Health"]);
        // exactly one new archetype was created for the batched transition
        assert_eq!(world.memory_stats().archetype_count, archetype_count_before + 1);
    }

    #[test]
    fn batch_remove_beats_add_for_the_same_component_regardless_of_order() {
        let mut reg = ComponentRegistry::new();
        let pos = reg.register(ComponentDescriptor::new("Position", &[("x", FieldType::F32, 0.0)])).unwrap();
        let mut world = World::new(reg);

        let e = world.spawn(&[pos]).unwrap();
        world.batch(e).remove(pos).add(pos).commit();
        assert!(!world.has_component(e, pos), "remove must win over a later add in the same batch");

        let e2 = world.spawn(&[pos]).unwrap();
        world.batch(e2).add(pos).remove(pos).commit();
        assert!(!world.has_component(e2, pos), "remove must win over an earlier add in the same batch");
    }

    #[test]
    fn cascade_delete_relation_despawns_source_when_target_is_despawned() {
        let reg = ComponentRegistry::new();
        let mut world = World::new(reg);
        let owner = world.spawn(&[]).unwrap();
        let item = world.spawn(&[]).unwrap();
        let holds = world.register_relation("holds", RelationFlags { exclusive: true, cascade_delete: true, ..Default::default() }).unwrap();
        world.relate(holds, owner, item, None);

        assert!(world.despawn(item));
        assert!(!world.is_alive(owner), "owner should cascade-despawn with its exclusively held item");
    }

    #[test]
    fn string_field_refcounts_across_two_entities() {
        let mut reg = ComponentRegistry::new();
        let name = reg.register(ComponentDescriptor::new("Name", &[("s", FieldType::String, 0.0)])).unwrap();
        let mut world = World::new(reg);

        let e1 = world.spawn(&[name]).unwrap();
        world.set_string(e1, name, "s", "sword");
        let id = world.get_field(e1, name, "s").unwrap() as u32;
        assert_eq!(world.string_pool().refcount(id), Some(1));

        let e2 = world.spawn(&[name]).unwrap();
        world.set_string(e2, name, "s", "sword");
        assert_eq!(world.string_pool().refcount(id), Some(2));

        world.despawn(e1);
        assert_eq!(world.string_pool().refcount(id), Some(1));
        world.despawn(e2);
        assert_eq!(world.string_pool().refcount(id), None);
    }

    #[test]
    fn despawn_nullifies_incoming_entity_ref_fields() {
        let mut reg = ComponentRegistry::new();
        let owner = reg.register(ComponentDescriptor::new("Owner", &[("target", FieldType::EntityRef, EntityId::NULL.to_bits() as f64)])).unwrap();
        let mut world = World::new(reg);

        let target = world.spawn(&[]).unwrap();
        let referrer = world.spawn(&[owner]).unwrap();
        let mut data = FxHashMap::default();
        data.insert("target".to_string(), target.to_bits() as f64);
        assert!(world.set(referrer, owner, &data));

        world.despawn(target);
        let bits = world.get_field(referrer, owner, "target").unwrap() as i64 as u32;
        assert_eq!(bits, EntityId::NULL.to_bits());
    }

    #[test]
    fn query_sees_newly_added_entities_after_cache_resolved() {
        let (reg, pos, _vel) = registry_with_position_velocity();
        let mut world = World::new(reg);
        let q = world.query().with(pos);
        assert_eq!(world.count_query(&q), 0);
        world.spawn(&[pos]).unwrap();
        assert_eq!(world.count_query(&q), 1);
    }
}
