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

//! Tracks EntityRef field occurrences so despawn can nullify referring
//! fields and drop outgoing references.

use rustc_hash::{FxHashMap, FxHashSet};

use crate::component::ComponentId;
use crate::entity::EntityId;

/// One occurrence of an EntityRef field: which entity's component holds
/// a reference, which field, and what it currently points at.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RefSite {
    pub source: EntityId,
    pub component: ComponentId,
    pub field_index: u32,
}

#[derive(Default)]
pub struct EntityRefStore {
    by_source: FxHashMap<u32, FxHashSet<RefSite>>,
    by_target: FxHashMap<u32, FxHashSet<RefSite>>,
    target_of: FxHashMap<RefSite, u32>,
}

impl EntityRefStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record that `site` now points at `target` (or clear the record if
    /// `target` is `None`, i.e. the field was set to the null entity).
    pub fn set(&mut self, site: RefSite, target: Option<EntityId>) {
        self.clear(site);
        if let Some(target) = target {
            self.by_source.entry(site.source.slot()).or_default().insert(site);
            self.by_target.entry(target.slot()).or_default().insert(site);
            self.target_of.insert(site, target.slot());
        }
    }

    /// Remove any recorded target for `site` without setting a new one.
    pub fn clear(&mut self, site: RefSite) {
        if let Some(old_target_slot) = self.target_of.remove(&site) {
            if let Some(set) = self.by_target.get_mut(&old_target_slot) {
                set.remove(&site);
                if set.is_empty() {
                    self.by_target.remove(&old_target_slot);
                }
            }
        }
        if let Some(set) = self.by_source.get_mut(&site.source.slot()) {
            set.remove(&site);
            if set.is_empty() {
                self.by_source.remove(&site.source.slot());
            }
        }
    }

    /// All ref-sites that currently point at `target`, for
    /// despawn-time nullification.
    pub fn sites_targeting(&self, target: EntityId) -> Vec<RefSite> {
        self.by_target.get(&target.slot()).map(|s| s.iter().copied().collect()).unwrap_or_default()
    }

    /// All ref-sites originating from `source`, for despawn-time
    /// cleanup of outgoing references.
    pub fn sites_from(&self, source: EntityId) -> Vec<RefSite> {
        self.by_source.get(&source.slot()).map(|s| s.iter().copied().collect()).unwrap_or_default()
    }

    /// Drop every record involving `e`, as either referrer or target.
    pub fn remove_entity(&mut self, e: EntityId) {
        for site in self.sites_from(e) {
            self.clear(site);
        }
        for site in self.sites_targeting(e) {
            self.clear(site);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn site(source_slot: u32, component: u32) -> RefSite {
        RefSite { source: EntityId::new(source_slot, 0), component: ComponentId(component), field_index: 0 }
    }

    #[test]
    fn tracks_target_and_reports_both_directions() {
        let mut store = EntityRefStore::new();
        let s = site(1, 0);
        let target = EntityId::new(2, 0);
        store.set(s, Some(target));
        assert_eq!(store.sites_targeting(target), vec![s]);
        assert_eq!(store.sites_from(EntityId::new(1, 0)), vec![s]);
    }

    #[test]
    fn clearing_target_removes_from_both_indices() {
        let mut store = EntityRefStore::new();
        let s = site(1, 0);
        let target = EntityId::new(2, 0);
        store.set(s, Some(target));
        store.set(s, None);
        assert!(store.sites_targeting(target).is_empty());
        assert!(store.sites_from(EntityId::new(1, 0)).is_empty());
    }

    #[test]
    fn remove_entity_drops_outgoing_and_incoming() {
        let mut store = EntityRefStore::new();
        let a = EntityId::new(1, 0);
        let b = EntityId::new(2, 0);
        let out_site = site(1, 0);
        store.set(out_site, Some(b));
        store.remove_entity(a);
        assert!(store.sites_targeting(b).is_empty());
    }
}
