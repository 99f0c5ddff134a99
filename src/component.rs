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

//! Component registry: dense indices, field layout, and name resolution.
//!
//! Components are declared as data — a [`ComponentDescriptor`] listing
//! named, typed fields — rather than derived from Rust struct syntax, so
//! that the schema itself is the serialization contract.

use rustc_hash::FxHashMap;

use crate::error::{EcsError, Result};
use crate::mask::MASK_BITS;

/// Upper bound on the number of components a single process may register,
/// fixed by the width of [`crate::mask::ComponentMask`].
pub const MAX_COMPONENTS: usize = MASK_BITS;

/// Dense index assigned to a component at registration time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ComponentId(pub u32);

/// Primitive field types. Storage uses the exact primitive width; the
/// public accessors widen to `f64` as needed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldType {
    F32,
    F64,
    I8,
    I16,
    I32,
    U8,
    U16,
    U32,
    Bool,
    /// A 32-bit entity value, tracked by the entity-reference store.
    EntityRef,
    /// A 32-bit index into the string pool.
    String,
}

impl FieldType {
    pub fn byte_size(self) -> usize {
        match self {
            FieldType::F32 => 4,
            FieldType::F64 => 8,
            FieldType::I8 => 1,
            FieldType::I16 => 2,
            FieldType::I32 => 4,
            FieldType::U8 => 1,
            FieldType::U16 => 2,
            FieldType::U32 => 4,
            FieldType::Bool => 1,
            FieldType::EntityRef => 4,
            FieldType::String => 4,
        }
    }
}

/// One field within a component's layout.
#[derive(Debug, Clone)]
pub struct FieldDescriptor {
    pub name: String,
    pub ty: FieldType,
    pub offset: usize,
    pub default: f64,
}

/// A component's declared schema: its field list, byte stride, and
/// whether it carries any data (a tag component has no fields).
#[derive(Debug, Clone)]
pub struct ComponentDescriptor {
    pub name: String,
    pub fields: Vec<FieldDescriptor>,
    pub stride: usize,
    pub is_tag: bool,
}

impl ComponentDescriptor {
    /// Build a descriptor from `(name, type, default)` triples, laying
    /// fields out sequentially in declaration order and computing the
    /// stride.
    pub fn new(name: impl Into<String>, fields: &[(&str, FieldType, f64)]) -> Self {
        let mut offset = 0usize;
        let mut laid_out = Vec::with_capacity(fields.len());
        for (fname, ty, default) in fields {
            laid_out.push(FieldDescriptor {
                name: (*fname).to_string(),
                ty: *ty,
                offset,
                default: *default,
            });
            offset += ty.byte_size();
        }
        Self {
            name: name.into(),
            is_tag: laid_out.is_empty(),
            stride: offset,
            fields: laid_out,
        }
    }

    pub fn field(&self, name: &str) -> Option<&FieldDescriptor> {
        self.fields.iter().find(|f| f.name == name)
    }
}

/// Assigns each registered component a dense [`ComponentId`] and resolves
/// components by name or index.
pub struct ComponentRegistry {
    by_name: FxHashMap<String, ComponentId>,
    descriptors: Vec<ComponentDescriptor>,
}

impl ComponentRegistry {
    pub fn new() -> Self {
        Self { by_name: FxHashMap::default(), descriptors: Vec::new() }
    }

    /// Register a component, returning its dense index. Registration
    /// order determines the index and must be stable across a run so
    /// serialized snapshots keep their component identity.
    pub fn register(&mut self, descriptor: ComponentDescriptor) -> Result<ComponentId> {
        if self.by_name.contains_key(&descriptor.name) {
            return Err(EcsError::DuplicateName(descriptor.name));
        }
        if self.descriptors.len() >= MAX_COMPONENTS {
            return Err(EcsError::TooManyComponents { limit: MAX_COMPONENTS });
        }
        let id = ComponentId(self.descriptors.len() as u32);
        self.by_name.insert(descriptor.name.clone(), id);
        self.descriptors.push(descriptor);
        Ok(id)
    }

    pub fn lookup_by_index(&self, id: ComponentId) -> Option<&ComponentDescriptor> {
        self.descriptors.get(id.0 as usize)
    }

    pub fn lookup_by_name(&self, name: &str) -> Option<(ComponentId, &ComponentDescriptor)> {
        let id = *self.by_name.get(name)?;
        self.descriptors.get(id.0 as usize).map(|d| (id, d))
    }

    pub fn count(&self) -> usize {
        self.descriptors.len()
    }
}

impl Default for ComponentRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn registration_order_is_dense_and_stable() {
        let mut reg = ComponentRegistry::new();
        let pos = reg
            .register(ComponentDescriptor::new(
                "Position",
                &[("x", FieldType::F32, 0.0), ("y", FieldType::F32, 0.0)],
            ))
            .unwrap();
        let vel = reg
            .register(ComponentDescriptor::new(
                "Velocity",
                &[("vx", FieldType::F32, 0.0), ("vy", FieldType::F32, 0.0)],
            ))
            .unwrap();
        assert_eq!(pos, ComponentId(0));
        assert_eq!(vel, ComponentId(1));
        assert_eq!(reg.count(), 2);
    }

    #[test]
    fn duplicate_name_is_rejected() {
        let mut reg = ComponentRegistry::new();
        reg.register(ComponentDescriptor::new("Position", &[("x", FieldType::F32, 0.0)]))
            .unwrap();
        let err = reg
            .register(ComponentDescriptor::new("Position", &[("y", FieldType::F32, 0.0)]))
            .unwrap_err();
        assert_eq!(err, EcsError::DuplicateName("Position".into()));
    }

    #[test]
    fn tag_component_has_zero_stride() {
        let desc = ComponentDescriptor::new("Marker", &[]);
        assert!(desc.is_tag);
        assert_eq!(desc.stride, 0);
    }

    #[test]
    fn field_offsets_are_sequential() {
        let desc = ComponentDescriptor::new(
            "Health",
            &[("current", FieldType::I32, 100.0), ("max", FieldType::I32, 100.0)],
        );
        assert_eq!(desc.field("current").unwrap().offset, 0);
        assert_eq!(desc.field("max").unwrap().offset, 4);
        assert_eq!(desc.stride, 8);
    }
}
