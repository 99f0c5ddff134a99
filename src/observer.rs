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

//! Synchronous component-lifecycle observers.
//!
//! Unlike [`crate::event::EventQueue`], observers are invoked inline by
//! the world operation that triggers them — there is no flush step.

use rustc_hash::FxHashMap;

use crate::component::ComponentId;
use crate::entity::EntityId;

type AddCallback = Box<dyn FnMut(EntityId)>;
type SetCallback = Box<dyn FnMut(EntityId, &FxHashMap<String, f64>, &FxHashMap<String, f64>)>;

struct Sub<F> {
    id: u64,
    callback: F,
}

/// Manages `on_add`/`on_remove`/`on_set`/`on_change` subscriptions per
/// component and fires them synchronously from world operations.
#[derive(Default)]
pub struct ObserverManager {
    on_add: FxHashMap<u32, Vec<Sub<AddCallback>>>,
    on_remove: FxHashMap<u32, Vec<Sub<AddCallback>>>,
    on_set: FxHashMap<u32, Vec<Sub<SetCallback>>>,
    on_change: FxHashMap<u32, Vec<Sub<AddCallback>>>,
    next_id: u64,
}

impl ObserverManager {
    pub fn new() -> Self {
        Self::default()
    }

    fn next_id(&mut self) -> u64 {
        let id = self.next_id;
        self.next_id += 1;
        id
    }

    pub fn on_add(&mut self, component: ComponentId, callback: impl FnMut(EntityId) + 'static) -> u64 {
        let id = self.next_id();
        self.on_add.entry(component.0).or_default().push(Sub { id, callback: Box::new(callback) });
        id
    }

    pub fn on_remove(&mut self, component: ComponentId, callback: impl FnMut(EntityId) + 'static) -> u64 {
        let id = self.next_id();
        self.on_remove.entry(component.0).or_default().push(Sub { id, callback: Box::new(callback) });
        id
    }

    pub fn on_set(
        &mut self,
        component: ComponentId,
        callback: impl FnMut(EntityId, &FxHashMap<String, f64>, &FxHashMap<String, f64>) + 'static,
    ) -> u64 {
        let id = self.next_id();
        self.on_set.entry(component.0).or_default().push(Sub { id, callback: Box::new(callback) });
        id
    }

    /// Notified on add, remove, or set — any change to the component.
    pub fn on_change(&mut self, component: ComponentId, callback: impl FnMut(EntityId) + 'static) -> u64 {
        let id = self.next_id();
        self.on_change.entry(component.0).or_default().push(Sub { id, callback: Box::new(callback) });
        id
    }

    pub fn unsubscribe(&mut self, id: u64) {
        for bucket in self.on_add.values_mut() {
            bucket.retain(|s| s.id != id);
        }
        for bucket in self.on_remove.values_mut() {
            bucket.retain(|s| s.id != id);
        }
        for bucket in self.on_set.values_mut() {
            bucket.retain(|s| s.id != id);
        }
        for bucket in self.on_change.values_mut() {
            bucket.retain(|s| s.id != id);
        }
    }

    pub fn notify_add(&mut self, component: ComponentId, entity: EntityId) {
        if let Some(bucket) = self.on_add.get_mut(&component.0) {
            for sub in bucket {
                (sub.callback)(entity);
            }
        }
        self.notify_change(component, entity);
    }

    pub fn notify_remove(&mut self, component: ComponentId, entity: EntityId) {
        if let Some(bucket) = self.on_remove.get_mut(&component.0) {
            for sub in bucket {
                (sub.callback)(entity);
            }
        }
        self.notify_change(component, entity);
    }

    pub fn notify_set(&mut self, component: ComponentId, entity: EntityId, old: &FxHashMap<String, f64>, new: &FxHashMap<String, f64>) {
        if let Some(bucket) = self.on_set.get_mut(&component.0) {
            for sub in bucket {
                (sub.callback)(entity, old, new);
            }
        }
        self.notify_change(component, entity);
    }

    fn notify_change(&mut self, component: ComponentId, entity: EntityId) {
        if let Some(bucket) = self.on_change.get_mut(&component.0) {
            for sub in bucket {
                (sub.callback)(entity);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;
    use std::rc::Rc;

    #[test]
    fn add_observer_fires_on_notify_add() {
        let mut obs = ObserverManager::new();
        let fired = Rc::new(RefCell::new(false));
        {
            let fired = fired.clone();
            obs.on_add(ComponentId(0), move |_| *fired.borrow_mut() = true);
        }
        obs.notify_add(ComponentId(0), EntityId::new(1, 0));
        assert!(*fired.borrow());
    }

    #[test]
    fn set_observer_receives_old_and_new() {
        let mut obs = ObserverManager::new();
        let seen = Rc::new(RefCell::new((0.0, 0.0)));
        {
            let seen = seen.clone();
            obs.on_set(ComponentId(0), move |_, old, new| {
                *seen.borrow_mut() = (old["x"], new["x"]);
            });
        }
        let mut old = FxHashMap::default();
        old.insert("x".to_string(), 1.0);
        let mut new = FxHashMap::default();
        new.insert("x".to_string(), 2.0);
        obs.notify_set(ComponentId(0), EntityId::new(1, 0), &old, &new);
        assert_eq!(*seen.borrow(), (1.0, 2.0));
    }

    #[test]
    fn on_change_fires_for_add_and_set() {
        let mut obs = ObserverManager::new();
        let count = Rc::new(RefCell::new(0));
        {
            let count = count.clone();
            obs.on_change(ComponentId(0), move |_| *count.borrow_mut() += 1);
        }
        obs.notify_add(ComponentId(0), EntityId::new(1, 0));
        obs.notify_set(ComponentId(0), EntityId::new(1, 0), &FxHashMap::default(), &FxHashMap::default());
        assert_eq!(*count.borrow(), 2);
    }

    #[test]
    fn unsubscribe_stops_future_notifications() {
        let mut obs = ObserverManager::new();
        let count = Rc::new(RefCell::new(0));
        let id = {
            let count = count.clone();
            obs.on_add(ComponentId(0), move |_| *count.borrow_mut() += 1)
        };
        obs.unsubscribe(id);
        obs.notify_add(ComponentId(0), EntityId::new(1, 0));
        assert_eq!(*count.borrow(), 0);
    }
}
