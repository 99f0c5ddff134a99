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

//! Relation registry and the bidirectional relationship store.

use rustc_hash::{FxHashMap, FxHashSet};

use crate::entity::EntityId;
use crate::error::{EcsError, Result};

/// Dense index assigned to a relation type at registration time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RelationId(pub u32);

/// Behavioral flags declared when a relation type is registered.
#[derive(Debug, Clone, Copy, Default)]
pub struct RelationFlags {
    /// Adding a new target replaces any existing target.
    pub exclusive: bool,
    /// Adding `(s, t)` also adds the mirror `(t, s)`.
    pub symmetric: bool,
    /// Despawning the target cascades to despawn the source.
    pub cascade_delete: bool,
    /// The entity's relation membership is dropped automatically on
    /// despawn (distinct from cascade: this only cleans up triples, it
    /// never despawns anything else).
    pub auto_cleanup: bool,
}

struct RelationType {
    name: String,
    flags: RelationFlags,
}

/// Registry of relation types, separate from the component registry
/// since relations are not archetype-bearing.
pub struct RelationRegistry {
    by_name: FxHashMap<String, RelationId>,
    types: Vec<RelationType>,
}

impl RelationRegistry {
    pub fn new() -> Self {
        Self { by_name: FxHashMap::default(), types: Vec::new() }
    }

    pub fn register(&mut self, name: impl Into<String>, flags: RelationFlags) -> Result<RelationId> {
        let name = name.into();
        if self.by_name.contains_key(&name) {
            return Err(EcsError::DuplicateName(name));
        }
        let id = RelationId(self.types.len() as u32);
        self.by_name.insert(name.clone(), id);
        self.types.push(RelationType { name, flags });
        Ok(id)
    }

    pub fn flags(&self, id: RelationId) -> Option<RelationFlags> {
        self.types.get(id.0 as usize).map(|t| t.flags)
    }

    pub fn lookup_by_name(&self, name: &str) -> Option<RelationId> {
        self.by_name.get(name).copied()
    }

    pub fn name(&self, id: RelationId) -> Option<&str> {
        self.types.get(id.0 as usize).map(|t| t.name.as_str())
    }
}

impl Default for RelationRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Default)]
struct PerRelation {
    by_source: FxHashMap<u32, FxHashSet<u32>>,
    by_target: FxHashMap<u32, FxHashSet<u32>>,
    data: FxHashMap<(u32, u32), f64>,
}

/// Bidirectional (relation, entity) indices plus per-entity relation
/// refcounts used to answer "has any relation" in O(1).
pub struct RelationStore {
    per_relation: FxHashMap<u32, PerRelation>,
    entity_refcount: FxHashMap<u32, u32>,
}

impl RelationStore {
    pub fn new() -> Self {
        Self { per_relation: FxHashMap::default(), entity_refcount: FxHashMap::default() }
    }

    fn bump_refcount(&mut self, slot: u32, delta: i32) {
        let entry = self.entity_refcount.entry(slot).or_insert(0);
        if delta > 0 {
            *entry += delta as u32;
        } else {
            *entry = entry.saturating_sub((-delta) as u32);
            if *entry == 0 {
                self.entity_refcount.remove(&slot);
            }
        }
    }

    fn add_directed(&mut self, relation: RelationId, source: EntityId, target: EntityId, data: Option<f64>) -> bool {
        let bucket = self.per_relation.entry(relation.0).or_default();
        let inserted = bucket.by_source.entry(source.slot()).or_default().insert(target.slot());
        if inserted {
            bucket.by_target.entry(target.slot()).or_default().insert(source.slot());
        }
        if let Some(value) = data {
            bucket.data.insert((source.slot(), target.slot()), value);
        }
        if inserted {
            self.bump_refcount(source.slot(), 1);
            self.bump_refcount(target.slot(), 1);
        }
        inserted
    }

    fn remove_directed(&mut self, relation: RelationId, source: EntityId, target: EntityId) -> bool {
        let Some(bucket) = self.per_relation.get_mut(&relation.0) else { return false };
        let removed = bucket
            .by_source
            .get_mut(&source.slot())
            .map(|targets| targets.remove(&target.slot()))
            .unwrap_or(false);
        if removed {
            if let Some(targets) = bucket.by_source.get(&source.slot()) {
                if targets.is_empty() {
                    bucket.by_source.remove(&source.slot());
                }
            }
            if let Some(sources) = bucket.by_target.get_mut(&target.slot()) {
                sources.remove(&source.slot());
                if sources.is_empty() {
                    bucket.by_target.remove(&target.slot());
                }
            }
            bucket.data.remove(&(source.slot(), target.slot()));
            self.bump_refcount(source.slot(), -1);
            self.bump_refcount(target.slot(), -1);
        }
        removed
    }

    /// Add `(source, relation, target)`. Exclusive relations replace any
    /// existing target first. Symmetric relations also add the mirror
    /// triple.
    pub fn add(&mut self, relation: RelationId, flags: RelationFlags, source: EntityId, target: EntityId, data: Option<f64>) {
        if flags.exclusive {
            let existing: Vec<u32> = self
                .per_relation
                .get(&relation.0)
                .and_then(|b| b.by_source.get(&source.slot()))
                .map(|set| set.iter().copied().collect())
                .unwrap_or_default();
            for old_target_slot in existing {
                self.remove_directed(relation, source, EntityId::new(old_target_slot, 0));
            }
        }
        self.add_directed(relation, source, target, data);
        if flags.symmetric {
            self.add_directed(relation, target, source, data);
        }
    }

    pub fn remove(&mut self, relation: RelationId, flags: RelationFlags, source: EntityId, target: EntityId) -> bool {
        let removed = self.remove_directed(relation, source, target);
        if flags.symmetric {
            self.remove_directed(relation, target, source);
        }
        removed
    }

    pub fn has(&self, relation: RelationId, source: EntityId, target: EntityId) -> bool {
        self.per_relation
            .get(&relation.0)
            .and_then(|b| b.by_source.get(&source.slot()))
            .map(|set| set.contains(&target.slot()))
            .unwrap_or(false)
    }

    /// For exclusive relations only: the single target, if any. Errors if
    /// the relation is not exclusive or currently has more than one
    /// target.
    pub fn get_target(&self, relation: RelationId, flags: RelationFlags, name: &str, source: EntityId) -> Result<Option<EntityId>> {
        let targets = self.get_targets(relation, source);
        if !flags.exclusive || targets.len() > 1 {
            return Err(EcsError::NotExclusive(name.to_string()));
        }
        Ok(targets.into_iter().next())
    }

    pub fn get_targets(&self, relation: RelationId, source: EntityId) -> Vec<EntityId> {
        let mut out: Vec<u32> = self
            .per_relation
            .get(&relation.0)
            .and_then(|b| b.by_source.get(&source.slot()))
            .map(|set| set.iter().copied().collect())
            .unwrap_or_default();
        out.sort_unstable();
        out.into_iter().map(|slot| EntityId::new(slot, 0)).collect()
    }

    pub fn get_sources(&self, relation: RelationId, target: EntityId) -> Vec<EntityId> {
        let mut out: Vec<u32> = self
            .per_relation
            .get(&relation.0)
            .and_then(|b| b.by_target.get(&target.slot()))
            .map(|set| set.iter().copied().collect())
            .unwrap_or_default();
        out.sort_unstable();
        out.into_iter().map(|slot| EntityId::new(slot, 0)).collect()
    }

    pub fn has_any_target(&self, relation: RelationId, source: EntityId) -> bool {
        self.per_relation
            .get(&relation.0)
            .map(|b| b.by_source.get(&source.slot()).map(|s| !s.is_empty()).unwrap_or(false))
            .unwrap_or(false)
    }

    pub fn has_any_source(&self, relation: RelationId, target: EntityId) -> bool {
        self.per_relation
            .get(&relation.0)
            .map(|b| b.by_target.get(&target.slot()).map(|s| !s.is_empty()).unwrap_or(false))
            .unwrap_or(false)
    }

    pub fn count_targets(&self, relation: RelationId, source: EntityId) -> usize {
        self.per_relation
            .get(&relation.0)
            .and_then(|b| b.by_source.get(&source.slot()))
            .map(|s| s.len())
            .unwrap_or(0)
    }

    pub fn count_sources(&self, relation: RelationId, target: EntityId) -> usize {
        self.per_relation
            .get(&relation.0)
            .and_then(|b| b.by_target.get(&target.slot()))
            .map(|s| s.len())
            .unwrap_or(0)
    }

    pub fn get_data(&self, relation: RelationId, source: EntityId, target: EntityId) -> Option<f64> {
        self.per_relation.get(&relation.0)?.data.get(&(source.slot(), target.slot())).copied()
    }

    pub fn set_data(&mut self, relation: RelationId, source: EntityId, target: EntityId, value: f64) -> bool {
        let Some(bucket) = self.per_relation.get_mut(&relation.0) else { return false };
        if !bucket.by_source.get(&source.slot()).map(|s| s.contains(&target.slot())).unwrap_or(false) {
            return false;
        }
        bucket.data.insert((source.slot(), target.slot()), value);
        true
    }

    /// Invoke `callback(source, target)` in deterministic order (sorted
    /// by source slot, then target slot).
    pub fn for_each(&self, relation: RelationId, mut callback: impl FnMut(EntityId, EntityId)) {
        let Some(bucket) = self.per_relation.get(&relation.0) else { return };
        let mut sources: Vec<&u32> = bucket.by_source.keys().collect();
        sources.sort_unstable();
        for &src_slot in sources {
            let mut targets: Vec<&u32> = bucket.by_source[&src_slot].iter().collect();
            targets.sort_unstable();
            for &tgt_slot in targets {
                callback(EntityId::new(src_slot, 0), EntityId::new(tgt_slot, 0));
            }
        }
    }

    /// Remove every triple involving `e` (as source or target), across
    /// every relation type. Returns, per cascade-delete relation, the
    /// sources that held a cascade-delete relation targeting `e` (these
    /// must be despawned by the caller).
    pub fn remove_entity(&mut self, e: EntityId, flag_lookup: impl Fn(RelationId) -> RelationFlags) -> Vec<EntityId> {
        let mut cascade_targets = Vec::new();
        let relation_ids: Vec<u32> = self.per_relation.keys().copied().collect();
        for rel_raw in relation_ids {
            let relation = RelationId(rel_raw);
            let flags = flag_lookup(relation);

            if flags.cascade_delete {
                for src in self.get_sources(relation, e) {
                    cascade_targets.push(src);
                }
            }

            let outgoing = self.get_targets(relation, e);
            for target in outgoing {
                self.remove(relation, flags, e, target);
            }
            let incoming = self.get_sources(relation, e);
            for source in incoming {
                self.remove(relation, flags, source, e);
            }
        }
        self.entity_refcount.remove(&e.slot());
        cascade_targets
    }

    pub fn has_any_relation(&self, e: EntityId) -> bool {
        self.entity_refcount.get(&e.slot()).copied().unwrap_or(0) > 0
    }

    pub fn clear_by_type(&mut self, relation: RelationId) {
        if let Some(bucket) = self.per_relation.remove(&relation.0) {
            for (slot, targets) in bucket.by_source {
                self.bump_refcount(slot, -(targets.len() as i32));
            }
        }
    }

    pub fn clear(&mut self) {
        self.per_relation.clear();
        self.entity_refcount.clear();
    }
}

impl Default for RelationStore {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exclusive_add_replaces_previous_target() {
        let mut store = RelationStore::new();
        let flags = RelationFlags { exclusive: true, ..Default::default() };
        let rel = RelationId(0);
        let s = EntityId::new(1, 0);
        let t1 = EntityId::new(2, 0);
        let t2 = EntityId::new(3, 0);
        store.add(rel, flags, s, t1, None);
        store.add(rel, flags, s, t2, None);
        assert!(!store.has(rel, s, t1));
        assert!(store.has(rel, s, t2));
        assert_eq!(store.count_targets(rel, s), 1);
    }

    #[test]
    fn symmetric_add_mirrors_both_directions() {
        let mut store = RelationStore::new();
        let flags = RelationFlags { symmetric: true, ..Default::default() };
        let rel = RelationId(0);
        let a = EntityId::new(1, 0);
        let b = EntityId::new(2, 0);
        store.add(rel, flags, a, b, None);
        assert!(store.has(rel, a, b));
        assert!(store.has(rel, b, a));
    }

    #[test]
    fn remove_entity_returns_cascade_sources() {
        let mut store = RelationStore::new();
        let flags = RelationFlags { cascade_delete: true, ..Default::default() };
        let rel = RelationId(0);
        let item = EntityId::new(1, 0);
        let owner = EntityId::new(2, 0);
        store.add(rel, flags, owner, item, None);
        let cascades = store.remove_entity(item, |_| flags);
        assert_eq!(cascades, vec![owner]);
        assert!(!store.has(rel, owner, item));
    }

    #[test]
    fn has_any_relation_tracks_refcount_to_zero() {
        let mut store = RelationStore::new();
        let flags = RelationFlags::default();
        let rel = RelationId(0);
        let a = EntityId::new(1, 0);
        let b = EntityId::new(2, 0);
        store.add(rel, flags, a, b, None);
        assert!(store.has_any_relation(a));
        store.remove(rel, flags, a, b);
        assert!(!store.has_any_relation(a));
    }

    #[test]
    fn for_each_is_sorted_by_source_then_target() {
        let mut store = RelationStore::new();
        let flags = RelationFlags::default();
        let rel = RelationId(0);
        store.add(rel, flags, EntityId::new(5, 0), EntityId::new(9, 0), None);
        store.add(rel, flags, EntityId::new(1, 0), EntityId::new(9, 0), None);
        store.add(rel, flags, EntityId::new(1, 0), EntityId::new(2, 0), None);
        let mut seen = Vec::new();
        store.for_each(rel, |s, t| seen.push((s.slot(), t.slot())));
        assert_eq!(seen, vec![(1, 2), (1, 9), (5, 9)]);
    }
}
