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

//! Deferred command log with stable (sort-key, sequence) ordering.
//!
//! Structural operations recorded here are data, not closures, so the
//! buffer has no dependency on the world it will eventually be applied
//! to, and its flush order is reproducible independent of submission
//! order.

use rustc_hash::{FxHashMap, FxHashSet};

use crate::component::ComponentId;
use crate::entity::EntityId;
use crate::error::{EcsError, Result};

/// A single deferred structural operation.
#[derive(Debug, Clone)]
pub enum CommandKind {
    Spawn { components: Vec<ComponentId> },
    Despawn { entity: EntityId },
    Add { entity: EntityId, component: ComponentId, data: Option<FxHashMap<String, f64>> },
    Remove { entity: EntityId, component: ComponentId },
}

#[derive(Debug, Clone)]
struct Entry {
    sort_key: i64,
    sequence: u64,
    kind: CommandKind,
}

/// A deferred log of spawn/despawn/add/remove operations. Each entry is
/// tagged with an externally supplied sort key (the scheduler typically
/// uses system-index × 1000) and a monotonically increasing sequence
/// number that breaks ties.
#[derive(Default)]
pub struct CommandBuffer {
    entries: Vec<Entry>,
    next_sequence: u64,
    registered: FxHashSet<u32>,
}

impl CommandBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Declare that `component` is a valid target for add/remove
    /// commands. Flushing an add/remove for a component that was never
    /// declared this way is an error.
    pub fn register_component(&mut self, component: ComponentId) {
        self.registered.insert(component.0);
    }

    fn push(&mut self, sort_key: i64, kind: CommandKind) {
        let sequence = self.next_sequence;
        self.next_sequence += 1;
        self.entries.push(Entry { sort_key, sequence, kind });
    }

    pub fn spawn(&mut self, sort_key: i64, components: Vec<ComponentId>) {
        self.push(sort_key, CommandKind::Spawn { components });
    }

    pub fn despawn(&mut self, sort_key: i64, entity: EntityId) {
        self.push(sort_key, CommandKind::Despawn { entity });
    }

    pub fn add(&mut self, sort_key: i64, entity: EntityId, component: ComponentId, data: Option<FxHashMap<String, f64>>) {
        self.push(sort_key, CommandKind::Add { entity, component, data });
    }

    pub fn remove(&mut self, sort_key: i64, entity: EntityId, component: ComponentId) {
        self.push(sort_key, CommandKind::Remove { entity, component });
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    /// Sort by (sort-key ascending, sequence ascending — a stable order
    /// under sort-key ties) and return the ordered commands, failing if
    /// any add/remove references a component that was never declared via
    /// [`CommandBuffer::register_component`].
    pub fn flush(&mut self) -> Result<Vec<CommandKind>> {
        self.entries.sort_by(|a, b| a.sort_key.cmp(&b.sort_key).then(a.sequence.cmp(&b.sequence)));
        for entry in &self.entries {
            let component = match &entry.kind {
                CommandKind::Add { component, .. } => Some(*component),
                CommandKind::Remove { component, .. } => Some(*component),
                _ => None,
            };
            if let Some(component) = component {
                if !self.registered.contains(&component.0) {
                    return Err(EcsError::UnknownComponent(format!("component index {}", component.0)));
                }
            }
        }
        Ok(self.entries.drain(..).map(|e| e.kind).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flush_orders_by_sort_key_then_sequence() {
        let mut buf = CommandBuffer::new();
        let e = EntityId::new(0, 0);
        buf.despawn(5, e);
        buf.despawn(1, e);
        buf.despawn(1, e);
        let flushed = buf.flush().unwrap();
        // first two entries share sort_key 1 and must keep submission order
        assert!(matches!(flushed[0], CommandKind::Despawn { .. }));
        assert_eq!(flushed.len(), 3);
        assert!(buf.is_empty());
    }

    #[test]
    fn flush_rejects_unregistered_component() {
        let mut buf = CommandBuffer::new();
        let e = EntityId::new(0, 0);
        buf.add(0, e, ComponentId(3), None);
        let err = buf.flush().unwrap_err();
        assert_eq!(err, EcsError::UnknownComponent("component index 3".to_string()));
    }

    #[test]
    fn registered_component_flushes_cleanly() {
        let mut buf = CommandBuffer::new();
        buf.register_component(ComponentId(3));
        let e = EntityId::new(0, 0);
        buf.add(0, e, ComponentId(3), None);
        assert!(buf.flush().is_ok());
    }
}
