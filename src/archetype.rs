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

//! Archetype storage: one byte-buffer column per set bit of a mask.
//!
//! Rows grow by power-of-two reallocation; removing a row swaps the last
//! row into the freed slot so the entity vector (and every column) stays
//! dense and contiguous.

use rustc_hash::FxHashMap;

use crate::component::{ComponentDescriptor, ComponentId, ComponentRegistry, FieldType};
use crate::entity::EntityId;
use crate::mask::ComponentMask;

/// Per-row summary of what happened to that row this tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeFlag {
    None,
    Added,
    Modified,
    Removed,
}

/// A contiguous primitive buffer sized to the archetype's row capacity,
/// one per set bit of the owning archetype's mask.
pub struct ComponentColumn {
    data: Vec<u8>,
    stride: usize,
}

impl ComponentColumn {
    fn new(stride: usize) -> Self {
        Self { data: Vec::new(), stride }
    }

    fn ensure_capacity(&mut self, rows: usize) {
        let needed = rows * self.stride;
        if needed > self.data.len() {
            let mut new_cap = self.data.len().max(self.stride).next_power_of_two();
            while new_cap < needed {
                new_cap *= 2;
            }
            self.data.resize(new_cap, 0);
        }
    }

    fn row_bytes(&self, row: usize) -> &[u8] {
        let start = row * self.stride;
        &self.data[start..start + self.stride]
    }

    fn row_bytes_mut(&mut self, row: usize) -> &mut [u8] {
        let start = row * self.stride;
        &mut self.data[start..start + self.stride]
    }

    fn swap_rows(&mut self, a: usize, b: usize) {
        if a == b || self.stride == 0 {
            return;
        }
        let (lo, hi) = if a < b { (a, b) } else { (b, a) };
        let (left, right) = self.data.split_at_mut(hi * self.stride);
        let lo_slice = &mut left[lo * self.stride..lo * self.stride + self.stride];
        let hi_slice = &mut right[..self.stride];
        lo_slice.swap_with_slice(hi_slice);
    }
}

fn write_numeric(bytes: &mut [u8], ty: FieldType, value: f64) {
    match ty {
        FieldType::F32 => bytes.copy_from_slice(&(value as f32).to_ne_bytes()),
        FieldType::F64 => bytes.copy_from_slice(&value.to_ne_bytes()),
        FieldType::I8 => bytes[0] = (value as i64 as i8).to_ne_bytes()[0],
        FieldType::I16 => bytes.copy_from_slice(&(value as i64 as i16).to_ne_bytes()),
        FieldType::I32 => bytes.copy_from_slice(&(value as i64 as i32).to_ne_bytes()),
        FieldType::U8 => bytes[0] = (value as i64 as u8).to_ne_bytes()[0],
        FieldType::U16 => bytes.copy_from_slice(&(value as i64 as u16).to_ne_bytes()),
        FieldType::U32 => bytes.copy_from_slice(&(value as i64 as u32).to_ne_bytes()),
        FieldType::Bool => bytes[0] = if value != 0.0 { 1 } else { 0 },
        FieldType::EntityRef => bytes.copy_from_slice(&(value as i64 as u32).to_ne_bytes()),
        FieldType::String => bytes.copy_from_slice(&(value as i64 as u32).to_ne_bytes()),
    }
}

fn read_numeric(bytes: &[u8], ty: FieldType) -> f64 {
    match ty {
        FieldType::F32 => f32::from_ne_bytes(bytes.try_into().unwrap()) as f64,
        FieldType::F64 => f64::from_ne_bytes(bytes.try_into().unwrap()),
        FieldType::I8 => i8::from_ne_bytes([bytes[0]]) as f64,
        FieldType::I16 => i16::from_ne_bytes(bytes.try_into().unwrap()) as f64,
        FieldType::I32 => i32::from_ne_bytes(bytes.try_into().unwrap()) as f64,
        FieldType::U8 => bytes[0] as f64,
        FieldType::U16 => u16::from_ne_bytes(bytes.try_into().unwrap()) as f64,
        FieldType::U32 => u32::from_ne_bytes(bytes.try_into().unwrap()) as f64,
        FieldType::Bool => {
            if bytes[0] != 0 {
                1.0
            } else {
                0.0
            }
        }
        FieldType::EntityRef => u32::from_ne_bytes(bytes.try_into().unwrap()) as f64,
        FieldType::String => u32::from_ne_bytes(bytes.try_into().unwrap()) as f64,
    }
}

/// One column per set bit of a mask, SoA-style, plus per-row metadata.
pub struct Archetype {
    mask: ComponentMask,
    entities: Vec<EntityId>,
    columns: FxHashMap<u32, ComponentColumn>,
    component_order: Vec<ComponentId>,
    change_flags: Vec<ChangeFlag>,
    /// Per-row bitmap of which components (index < 64) mutated this tick.
    component_dirty: Vec<u64>,
}

impl Archetype {
    pub fn new(mask: ComponentMask, registry: &ComponentRegistry) -> Self {
        let mut columns = FxHashMap::default();
        let mut component_order = Vec::new();
        for idx in mask.iter() {
            let id = ComponentId(idx);
            if let Some(desc) = registry.lookup_by_index(id) {
                if !desc.is_tag {
                    columns.insert(idx, ComponentColumn::new(desc.stride));
                }
            }
            component_order.push(id);
        }
        Self {
            mask,
            entities: Vec::new(),
            columns,
            component_order,
            change_flags: Vec::new(),
            component_dirty: Vec::new(),
        }
    }

    pub fn mask(&self) -> &ComponentMask {
        &self.mask
    }

    pub fn component_order(&self) -> &[ComponentId] {
        &self.component_order
    }

    pub fn has_component(&self, id: ComponentId) -> bool {
        self.mask.test(id.0)
    }

    pub fn len(&self) -> usize {
        self.entities.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entities.is_empty()
    }

    pub fn entities(&self) -> &[EntityId] {
        &self.entities
    }

    pub fn entity_at(&self, row: usize) -> Option<EntityId> {
        self.entities.get(row).copied()
    }

    pub fn change_flag(&self, row: usize) -> ChangeFlag {
        self.change_flags.get(row).copied().unwrap_or(ChangeFlag::None)
    }

    pub fn component_dirty_bits(&self, row: usize) -> u64 {
        self.component_dirty.get(row).copied().unwrap_or(0)
    }

    /// Allocate a new row for `entity`, marked `Added`.
    pub fn allocate_row(&mut self, entity: EntityId) -> usize {
        let row = self.entities.len();
        self.entities.push(entity);
        self.change_flags.push(ChangeFlag::Added);
        self.component_dirty.push(0);
        for column in self.columns.values_mut() {
            column.ensure_capacity(row + 1);
        }
        row
    }

    /// Free `row`, swapping the last row into its place. Returns the
    /// entity that moved into `row`, if any.
    pub fn free_row(&mut self, row: usize) -> Option<EntityId> {
        if row >= self.entities.len() {
            return None;
        }
        let last = self.entities.len() - 1;
        self.entities.swap_remove(row);
        self.change_flags.swap_remove(row);
        self.component_dirty.swap_remove(row);
        for column in self.columns.values_mut() {
            column.swap_rows(row, last);
        }
        if row < self.entities.len() {
            Some(self.entities[row])
        } else {
            None
        }
    }

    fn column_for(&self, id: ComponentId) -> Option<&ComponentColumn> {
        self.columns.get(&id.0)
    }

    fn column_for_mut(&mut self, id: ComponentId) -> Option<&mut ComponentColumn> {
        self.columns.get_mut(&id.0)
    }

    /// Initialize every field of `component` at `row` to its registered
    /// default, overlaid by `overrides` (field name -> value).
    pub fn init_component_defaults(
        &mut self,
        row: usize,
        component: ComponentId,
        desc: &ComponentDescriptor,
        overrides: &FxHashMap<String, f64>,
    ) {
        if desc.is_tag {
            return;
        }
        let Some(column) = self.column_for_mut(component) else { return };
        column.ensure_capacity(row + 1);
        let bytes = column.row_bytes_mut(row);
        for field in &desc.fields {
            let value = overrides.get(&field.name).copied().unwrap_or(field.default);
            write_numeric(&mut bytes[field.offset..field.offset + field.ty.byte_size()], field.ty, value);
        }
    }

    pub fn get_field(&self, row: usize, component: ComponentId, desc: &ComponentDescriptor, name: &str) -> Option<f64> {
        let field = desc.field(name)?;
        let column = self.column_for(component)?;
        let bytes = column.row_bytes(row);
        Some(read_numeric(&bytes[field.offset..field.offset + field.ty.byte_size()], field.ty))
    }

    pub fn set_field(&mut self, row: usize, component: ComponentId, desc: &ComponentDescriptor, name: &str, value: f64) -> bool {
        let Some(field) = desc.field(name) else { return false };
        let ty = field.ty;
        let offset = field.offset;
        let size = ty.byte_size();
        let Some(column) = self.column_for_mut(component) else { return false };
        column.ensure_capacity(row + 1);
        let bytes = column.row_bytes_mut(row);
        write_numeric(&mut bytes[offset..offset + size], ty, value);
        true
    }

    /// Mark `row` Modified (unless it was Added this tick) and flag
    /// `component` as dirty in the per-row bitmap.
    pub fn mark_changed(&mut self, row: usize, component: ComponentId) {
        if let Some(flag) = self.change_flags.get_mut(row) {
            if *flag == ChangeFlag::None {
                *flag = ChangeFlag::Modified;
            }
        }
        if component.0 < 64 {
            if let Some(bits) = self.component_dirty.get_mut(row) {
                *bits |= 1u64 << component.0;
            }
        }
    }

    /// Copy `component`'s bytes for `src_row` in `src` into `dest_row` of
    /// `self`.
    pub fn copy_component_from(&mut self, dest_row: usize, src: &Archetype, src_row: usize, component: ComponentId) {
        let Some(src_column) = src.column_for(component) else { return };
        let bytes: Vec<u8> = src_column.row_bytes(src_row).to_vec();
        let Some(dest_column) = self.column_for_mut(component) else { return };
        dest_column.ensure_capacity(dest_row + 1);
        dest_column.row_bytes_mut(dest_row).copy_from_slice(&bytes);
    }

    /// Clear all per-row change tracking; called at tick end.
    pub fn clear_change_flags(&mut self) {
        for flag in &mut self.change_flags {
            *flag = ChangeFlag::None;
        }
        for bits in &mut self.component_dirty {
            *bits = 0;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::component::FieldType;

    fn registry_with_position() -> (ComponentRegistry, ComponentId) {
        let mut reg = ComponentRegistry::new();
        let id = reg
            .register(ComponentDescriptor::new(
                "Position",
                &[("x", FieldType::F32, 1.0), ("y", FieldType::F32, 2.0)],
            ))
            .unwrap();
        (reg, id)
    }

    #[test]
    fn allocate_row_marks_added() {
        let (reg, id) = registry_with_position();
        let mut mask = ComponentMask::new();
        mask.set(id.0);
        let mut arch = Archetype::new(mask, &reg);
        let row = arch.allocate_row(EntityId::new(0, 0));
        assert_eq!(arch.change_flag(row), ChangeFlag::Added);
    }

    #[test]
    fn defaults_then_overrides_roundtrip() {
        let (reg, id) = registry_with_position();
        let mut mask = ComponentMask::new();
        mask.set(id.0);
        let mut arch = Archetype::new(mask, &reg);
        let row = arch.allocate_row(EntityId::new(0, 0));
        let desc = reg.lookup_by_index(id).unwrap();
        arch.init_component_defaults(row, id, desc, &FxHashMap::default());
        assert_eq!(arch.get_field(row, id, desc, "x"), Some(1.0));
        assert_eq!(arch.get_field(row, id, desc, "y"), Some(2.0));

        let mut overrides = FxHashMap::default();
        overrides.insert("x".to_string(), 9.0);
        arch.init_component_defaults(row, id, desc, &overrides);
        assert_eq!(arch.get_field(row, id, desc, "x"), Some(9.0));
        assert_eq!(arch.get_field(row, id, desc, "y"), Some(2.0));
    }

    #[test]
    fn free_row_swaps_last_entity_in() {
        let (reg, id) = registry_with_position();
        let mut mask = ComponentMask::new();
        mask.set(id.0);
        let mut arch = Archetype::new(mask, &reg);
        let e0 = EntityId::new(0, 0);
        let e1 = EntityId::new(1, 0);
        let e2 = EntityId::new(2, 0);
        arch.allocate_row(e0);
        arch.allocate_row(e1);
        arch.allocate_row(e2);
        let moved = arch.free_row(0);
        assert_eq!(moved, Some(e2));
        assert_eq!(arch.entity_at(0), Some(e2));
        assert_eq!(arch.len(), 2);
    }

    #[test]
    fn set_field_marks_modified_and_dirty_bit() {
        let (reg, id) = registry_with_position();
        let mut mask = ComponentMask::new();
        mask.set(id.0);
        let mut arch = Archetype::new(mask, &reg);
        let row = arch.allocate_row(EntityId::new(0, 0));
        arch.clear_change_flags();
        assert_eq!(arch.change_flag(row), ChangeFlag::None);
        let desc = reg.lookup_by_index(id).unwrap();
        arch.set_field(row, id, desc, "x", 5.0);
        arch.mark_changed(row, id);
        assert_eq!(arch.change_flag(row), ChangeFlag::Modified);
        assert_ne!(arch.component_dirty_bits(row) & (1 << id.0), 0);
    }
}
