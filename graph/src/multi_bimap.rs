/*
 * Copyright 2026 The quern project developers
 *
 * Licensed under the Apache License, Version 2.0 (the "License");
 * you may not use this file except in compliance with the License.
 * You may obtain a copy of the License at
 *
 *     http://www.apache.org/licenses/LICENSE-2.0
 *
 * Unless required by applicable law or agreed to in writing, software
 * distributed under the License is distributed on an "AS IS" BASIS,
 * WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
 * See the License for the specific language governing permissions and
 * limitations under the License.
 */

use std::collections::HashMap;
use std::hash::Hash;

/// Insertion-ordered bidirectional multimap.
///
/// Each key maps to an ordered list of values; each value belongs to exactly
/// one key. Key iteration follows insertion order, which is what lets the
/// planner hand groups to the drivers in dependency order.
#[derive(Debug)]
pub struct MultiBiMap<K, V> {
    keys: Vec<K>,
    index: HashMap<K, usize>,
    values: Vec<Vec<V>>,
    owner: HashMap<V, usize>,
}

impl<K, V> MultiBiMap<K, V>
where
    K: Clone + Eq + Hash,
    V: Copy + Eq + Hash,
{
    pub fn new() -> MultiBiMap<K, V> {
        MultiBiMap {
            keys: Vec::new(),
            index: HashMap::new(),
            values: Vec::new(),
            owner: HashMap::new(),
        }
    }

    pub fn key_count(&self) -> usize {
        self.keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }

    fn key_slot(&mut self, key: &K) -> usize {
        if let Some(&i) = self.index.get(key) {
            return i;
        }
        let i = self.keys.len();
        self.keys.push(key.clone());
        self.index.insert(key.clone(), i);
        self.values.push(Vec::new());
        i
    }

    /// Associates `value` with `key`. A value may belong to only one key;
    /// re-adding it under any key is ignored.
    pub fn add(&mut self, key: K, value: V) {
        let slot = self.key_slot(&key);
        if self.owner.contains_key(&value) {
            return;
        }
        self.owner.insert(value, slot);
        self.values[slot].push(value);
    }

    pub fn add_all<I: IntoIterator<Item = V>>(&mut self, key: K, values: I) {
        let slot = self.key_slot(&key);
        for value in values {
            if self.owner.contains_key(&value) {
                continue;
            }
            self.owner.insert(value, slot);
            self.values[slot].push(value);
        }
    }

    pub fn contains_value(&self, value: &V) -> bool {
        self.owner.contains_key(value)
    }

    /// Values belonging to `key`, in insertion order.
    pub fn lookup_key(&self, key: &K) -> Option<&[V]> {
        self.index.get(key).map(|&i| self.values[i].as_slice())
    }

    /// The key a value belongs to.
    pub fn lookup_value(&self, value: &V) -> Option<&K> {
        self.owner.get(value).map(|&i| &self.keys[i])
    }

    /// Position of a value's owning key in insertion order.
    pub fn value_owner_index(&self, value: &V) -> Option<usize> {
        self.owner.get(value).copied()
    }

    pub fn keys(&self) -> impl Iterator<Item = &K> {
        self.keys.iter()
    }

    pub fn items(&self) -> impl Iterator<Item = (&K, &[V])> {
        self.keys
            .iter()
            .zip(self.values.iter().map(|v| v.as_slice()))
    }
}

impl<K, V> Default for MultiBiMap<K, V>
where
    K: Clone + Eq + Hash,
    V: Copy + Eq + Hash,
{
    fn default() -> Self {
        MultiBiMap::new()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn preserves_key_insertion_order() {
        let mut map = MultiBiMap::new();
        map.add_all("b", vec![1, 2]);
        map.add_all("a", vec![3]);
        map.add("c", 4);
        let keys: Vec<_> = map.keys().copied().collect();
        assert_eq!(keys, vec!["b", "a", "c"]);
        assert_eq!(map.key_count(), 3);
    }

    #[test]
    fn value_lookup_is_inverse() {
        let mut map = MultiBiMap::new();
        map.add_all("x", vec![10, 11]);
        map.add_all("y", vec![12]);
        assert_eq!(map.lookup_value(&11), Some(&"x"));
        assert_eq!(map.lookup_value(&12), Some(&"y"));
        assert_eq!(map.lookup_value(&13), None);
        assert_eq!(map.value_owner_index(&12), Some(1));
        assert_eq!(map.lookup_key(&"x"), Some(&[10, 11][..]));
    }

    #[test]
    fn values_claimed_once() {
        let mut map = MultiBiMap::new();
        map.add("first", 1);
        map.add("second", 1);
        assert_eq!(map.lookup_value(&1), Some(&"first"));
        assert_eq!(map.lookup_key(&"second"), Some(&[][..]));
    }
}
