// Open-addressed, linear-probed string -> Value map.
//
// A slot is empty, a tombstone (deleted, but still splitting a probe
// sequence so later lookups don't stop short), or occupied. Open
// addressing with tombstones keeps string interning lookups and global
// variable storage O(1) without a second allocation per bucket.

use std::ptr::NonNull;

use crate::value::{ObjString, Value};

const LOAD_FACTOR_MAX: f64 = 0.75;
const INITIAL_CAPACITY: usize = 8;

#[derive(Clone, Copy)]
enum Slot {
    Empty,
    Tombstone,
    Occupied(NonNull<ObjString>, Value),
}

pub struct Table {
    entries: Vec<Slot>,
    count: usize, // occupied + tombstones
    live: usize,  // occupied only
}

impl Table {
    pub fn new() -> Table {
        Table { entries: Vec::new(), count: 0, live: 0 }
    }

    pub fn len(&self) -> usize {
        self.live
    }

    pub fn is_empty(&self) -> bool {
        self.live == 0
    }

    fn capacity(&self) -> usize {
        self.entries.len()
    }

    /// Probe for `key`'s slot index. A tombstone seen along the way is
    /// remembered and reused for insertion if the key isn't found.
    fn find_slot(entries: &[Slot], key: NonNull<ObjString>) -> usize {
        let cap = entries.len();
        let hash = unsafe { key.as_ref().hash };
        let mut index = (hash as usize) % cap;
        let mut tombstone: Option<usize> = None;
        loop {
            match entries[index] {
                Slot::Empty => return tombstone.unwrap_or(index),
                Slot::Tombstone => {
                    if tombstone.is_none() {
                        tombstone = Some(index);
                    }
                }
                Slot::Occupied(k, _) => {
                    if same_string(k, key) {
                        return index;
                    }
                }
            }
            index = (index + 1) % cap;
        }
    }

    fn grow(&mut self, new_capacity: usize) {
        let mut new_entries = vec![Slot::Empty; new_capacity];
        let mut live = 0;
        for slot in self.entries.drain(..) {
            if let Slot::Occupied(key, value) = slot {
                let index = Self::find_slot(&new_entries, key);
                new_entries[index] = Slot::Occupied(key, value);
                live += 1;
            }
        }
        self.entries = new_entries;
        self.count = live;
        self.live = live;
    }

    /// Returns true if this inserted a brand new key (not an update).
    pub fn set(&mut self, key: NonNull<ObjString>, value: Value) -> bool {
        if self.entries.is_empty() {
            self.grow(INITIAL_CAPACITY);
        } else if (self.count + 1) as f64 > self.capacity() as f64 * LOAD_FACTOR_MAX {
            self.grow(self.capacity() * 2);
        }

        let index = Self::find_slot(&self.entries, key);
        let is_new = !matches!(self.entries[index], Slot::Occupied(..));
        let was_tombstone = matches!(self.entries[index], Slot::Tombstone);
        self.entries[index] = Slot::Occupied(key, value);
        if is_new {
            self.live += 1;
            if !was_tombstone {
                self.count += 1;
            }
        }
        is_new
    }

    pub fn get(&self, key: NonNull<ObjString>) -> Option<Value> {
        if self.entries.is_empty() {
            return None;
        }
        let index = Self::find_slot(&self.entries, key);
        match self.entries[index] {
            Slot::Occupied(_, value) => Some(value),
            _ => None,
        }
    }

    pub fn delete(&mut self, key: NonNull<ObjString>) -> bool {
        if self.entries.is_empty() {
            return false;
        }
        let index = Self::find_slot(&self.entries, key);
        match self.entries[index] {
            Slot::Occupied(..) => {
                self.entries[index] = Slot::Tombstone;
                self.live -= 1;
                true
            }
            _ => false,
        }
    }

    pub fn add_all(&mut self, dst: &mut Table) {
        for slot in &self.entries {
            if let Slot::Occupied(key, value) = slot {
                dst.set(*key, *value);
            }
        }
    }

    /// Find the interned string with the given bytes+hash, for use by the
    /// string interner (see `memory::Heap::alloc_string`).
    pub fn find_string(&self, chars: &str, hash: u32) -> Option<NonNull<ObjString>> {
        if self.entries.is_empty() {
            return None;
        }
        let cap = self.capacity();
        let mut index = (hash as usize) % cap;
        loop {
            match self.entries[index] {
                Slot::Empty => return None,
                Slot::Occupied(key, _) => {
                    let s = unsafe { key.as_ref() };
                    if s.len() == chars.len() && s.hash == hash && s.as_str() == chars {
                        return Some(key);
                    }
                }
                Slot::Tombstone => {}
            }
            index = (index + 1) % cap;
        }
    }

    /// Remove entries whose key is not marked. Run on the string intern
    /// table right before sweep so unreferenced interned strings don't
    /// outlive their last reachable use (the table holds a weak reference
    /// to each string, not an owning one).
    pub fn remove_white(&mut self) {
        for slot in self.entries.iter_mut() {
            if let Slot::Occupied(key, _) = slot {
                let marked = unsafe { key.as_ref().header.marked };
                if !marked {
                    *slot = Slot::Tombstone;
                    self.live -= 1;
                }
            }
        }
    }

    /// Every live key, for GC root marking / blackening of owning tables.
    pub fn iter(&self) -> impl Iterator<Item = (NonNull<ObjString>, Value)> + '_ {
        self.entries.iter().filter_map(|slot| match slot {
            Slot::Occupied(k, v) => Some((*k, *v)),
            _ => None,
        })
    }
}

fn same_string(a: NonNull<ObjString>, b: NonNull<ObjString>) -> bool {
    a == b
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value::fnv1a_hash;
    use std::collections::HashMap as StdMap;

    // Leaked strings for table unit tests: the table itself never owns
    // `ObjString`s (the heap does), so tests manufacture their own.
    fn intern(s: &str) -> NonNull<ObjString> {
        let hash = fnv1a_hash(s.as_bytes());
        let boxed = Box::new(ObjString::new(s.to_string().into_boxed_str(), hash));
        NonNull::new(Box::into_raw(boxed)).unwrap()
    }

    #[test]
    fn set_get_delete_roundtrip() {
        let mut t = Table::new();
        let k1 = intern("a");
        let k2 = intern("b");
        assert!(t.set(k1, Value::Number(1.0)));
        assert!(t.set(k2, Value::Number(2.0)));
        assert!(!t.set(k1, Value::Number(3.0)));
        assert_eq!(t.get(k1).unwrap().as_number(), Some(3.0));
        assert_eq!(t.get(k2).unwrap().as_number(), Some(2.0));
        assert!(t.delete(k1));
        assert!(t.get(k1).is_none());
        assert!(t.get(k2).is_some());
    }

    #[test]
    fn find_string_locates_interned_entry() {
        let mut t = Table::new();
        let k = intern("hello");
        t.set(k, Value::Nil);
        let hash = fnv1a_hash(b"hello");
        assert_eq!(t.find_string("hello", hash), Some(k));
        assert_eq!(t.find_string("nope", fnv1a_hash(b"nope")), None);
    }

    #[test]
    fn grows_past_load_factor_and_preserves_entries() {
        let mut t = Table::new();
        let mut keys = Vec::new();
        for i in 0..100 {
            let k = intern(&format!("key{}", i));
            keys.push(k);
            t.set(k, Value::Number(i as f64));
        }
        for (i, k) in keys.iter().enumerate() {
            assert_eq!(t.get(*k).unwrap().as_number(), Some(i as f64));
        }
    }

    // A randomized sequence of set/delete must agree with a reference map
    // for every key.
    #[derive(Clone, Debug)]
    enum Op {
        Set(u8, i64),
        Delete(u8),
    }

    impl quickcheck::Arbitrary for Op {
        fn arbitrary(g: &mut quickcheck::Gen) -> Op {
            let key = u8::arbitrary(g) % 12;
            if bool::arbitrary(g) {
                Op::Set(key, i64::arbitrary(g))
            } else {
                Op::Delete(key)
            }
        }
    }

    #[quickcheck_macros::quickcheck]
    fn table_matches_reference_map(ops: Vec<Op>) -> bool {
        let mut table = Table::new();
        let mut model: StdMap<u8, i64> = StdMap::new();
        let keys: Vec<NonNull<ObjString>> = (0..12u8).map(|i| intern(&i.to_string())).collect();

        for op in ops {
            match op {
                Op::Set(k, v) => {
                    table.set(keys[k as usize], Value::Number(v as f64));
                    model.insert(k, v);
                }
                Op::Delete(k) => {
                    table.delete(keys[k as usize]);
                    model.remove(&k);
                }
            }
        }

        for (i, key) in keys.iter().enumerate() {
            let i = i as u8;
            match (table.get(*key), model.get(&i)) {
                (Some(v), Some(expected)) => {
                    if v.as_number() != Some(*expected as f64) {
                        return false;
                    }
                }
                (None, None) => {}
                _ => return false,
            }
        }
        true
    }
}
