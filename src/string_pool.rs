//! Reference-counted string interner.
//!
//! Index 0 is the permanent empty/absent string and is never reference
//! counted. All other indices are recycled once their refcount drops to
//! zero; re-interning the same text later may therefore return a
//! different index (spec §4.2).

use rustc_hash::FxHashMap;

/// 32-bit index into a [`StringPool`].
pub type StringId = u32;

/// The permanent index denoting the empty/absent string.
pub const EMPTY: StringId = 0;

struct Slot {
    text: String,
    refcount: u32,
}

/// Reference-counted string interner.
pub struct StringPool {
    slots: Vec<Option<Slot>>,
    by_text: FxHashMap<String, StringId>,
    free: Vec<StringId>,
}

impl StringPool {
    pub fn new() -> Self {
        Self {
            slots: vec![Some(Slot { text: String::new(), refcount: 1 })],
            by_text: FxHashMap::default(),
            free: Vec::new(),
        }
    }

    /// Intern `s`, returning its index. Interning the empty string always
    /// returns [`EMPTY`] and never changes a refcount. Interning text that
    /// is already interned bumps its refcount and returns the existing
    /// index.
    pub fn intern(&mut self, s: &str) -> StringId {
        if s.is_empty() {
            return EMPTY;
        }
        if let Some(&id) = self.by_text.get(s) {
            if let Some(slot) = self.slots[id as usize].as_mut() {
                slot.refcount += 1;
            }
            return id;
        }

        let id = if let Some(id) = self.free.pop() {
            self.slots[id as usize] = Some(Slot { text: s.to_string(), refcount: 1 });
            id
        } else {
            let id = self.slots.len() as StringId;
            self.slots.push(Some(Slot { text: s.to_string(), refcount: 1 }));
            id
        };
        self.by_text.insert(s.to_string(), id);
        id
    }

    /// Look up the text for `id`, if still interned.
    pub fn get(&self, id: StringId) -> Option<&str> {
        if id == EMPTY {
            return Some("");
        }
        self.slots.get(id as usize)?.as_ref().map(|s| s.text.as_str())
    }

    /// Increment the refcount of an already-interned index.
    pub fn add_ref(&mut self, id: StringId) {
        if id == EMPTY {
            return;
        }
        if let Some(Some(slot)) = self.slots.get_mut(id as usize) {
            slot.refcount += 1;
        }
    }

    /// Decrement the refcount of `id`; recycles the slot when it reaches
    /// zero.
    pub fn release_ref(&mut self, id: StringId) {
        if id == EMPTY {
            return;
        }
        let Some(Some(slot)) = self.slots.get_mut(id as usize) else { return };
        slot.refcount = slot.refcount.saturating_sub(1);
        if slot.refcount == 0 {
            let text = std::mem::take(&mut slot.text);
            self.slots[id as usize] = None;
            self.by_text.remove(&text);
            self.free.push(id);
        }
    }

    /// Current refcount of `id`, or `None` if the slot is not interned.
    pub fn refcount(&self, id: StringId) -> Option<u32> {
        if id == EMPTY {
            return None;
        }
        self.slots.get(id as usize)?.as_ref().map(|s| s.refcount)
    }

    /// Number of distinct strings currently interned (excluding the
    /// permanent empty string).
    pub fn len(&self) -> usize {
        self.slots.iter().filter(|s| s.is_some()).count().saturating_sub(1)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for StringPool {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_string_is_permanent() {
        let mut pool = StringPool::new();
        assert_eq!(pool.intern(""), EMPTY);
        assert_eq!(pool.refcount(EMPTY), None);
    }

    #[test]
    fn repeated_intern_shares_index_and_refcount() {
        let mut pool = StringPool::new();
        let a = pool.intern("sword");
        let b = pool.intern("sword");
        assert_eq!(a, b);
        assert_eq!(pool.refcount(a), Some(2));
    }

    #[test]
    fn release_to_zero_recycles_index() {
        let mut pool = StringPool::new();
        let a = pool.intern("sword");
        pool.release_ref(a);
        assert_eq!(pool.get(a), None);
        let b = pool.intern("shield");
        assert_eq!(b, a, "freed slot should be recycled");
    }
}
