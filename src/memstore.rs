use kube::runtime::watcher::Event;
use std::collections::{btree_map, BTreeMap};

pub trait KeyValueFrom<V>: Sized {
    type Key: Ord;
    fn key_from(v: &V) -> Option<Self::Key>;
    fn value_from(v: V) -> Option<Self>;
}

pub struct Map<F, T: KeyValueFrom<F>> {
    map: BTreeMap<T::Key, T>,
    ready: bool,
}

impl<F, T: KeyValueFrom<F> + PartialEq> Map<F, T> {
    pub fn new() -> Self {
        Self {
            map: BTreeMap::new(),
            ready: false,
        }
    }

    pub fn is_ready(&self) -> bool {
        self.ready
    }

    pub fn iter(&self) -> btree_map::Iter<'_, T::Key, T> {
        self.map.iter()
    }

    /// Consume a watch event; reports whether the stored state changed.
    pub fn ingest(&mut self, event: Event<F>) -> bool {
        use Event::*;
        match event {
            Init => {
                let changed = self.ready || !self.map.is_empty();
                self.map.clear();
                self.ready = false;
                changed
            }
            InitApply(v) | Apply(v) => {
                let (Some(key), Some(value)) = (T::key_from(&v), T::value_from(v)) else {
                    return false;
                };
                let changed = self.map.get(&key) != Some(&value);
                self.map.insert(key, value);
                changed
            }
            InitDone => {
                let changed = !self.ready;
                self.ready = true;
                changed
            }
            Delete(v) => match T::key_from(&v) {
                Some(key) => self.map.remove(&key).is_some(),
                None => false,
            },
        }
    }
}

impl<F, T: KeyValueFrom<F> + PartialEq> Default for Map<F, T> {
    fn default() -> Self {
        Self::new()
    }
}
