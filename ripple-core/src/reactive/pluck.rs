//! Plucking
//!
//! `pluck` derives a node that focuses on one entry of a collection. Reading
//! the plucked node reads the entry; when the collection node is settable,
//! setting the plucked node writes a copy of the collection with that entry
//! replaced.
//!
//! How an entry is read and replaced is up to the [`Pluckable`]
//! implementation. Maps and vectors are covered out of the box.

use std::collections::{BTreeMap, HashMap};
use std::hash::Hash;

use crate::error::Error;

use super::derivable::Derivable;

/// Get/set strategy for one entry of a collection.
pub trait Pluckable<K>: Clone + 'static {
    type Value: Clone + PartialEq + 'static;

    /// The entry at `key`, if there is one.
    fn plucked(&self, key: &K) -> Option<Self::Value>;

    /// A copy of `self` with the entry at `key` replaced. `None` when the
    /// entry does not exist.
    fn with_plucked(&self, key: &K, value: Self::Value) -> Option<Self>;
}

impl<K, V> Pluckable<K> for HashMap<K, V>
where
    K: Hash + Eq + Clone + 'static,
    V: Clone + PartialEq + 'static,
{
    type Value = V;

    fn plucked(&self, key: &K) -> Option<V> {
        self.get(key).cloned()
    }

    fn with_plucked(&self, key: &K, value: V) -> Option<Self> {
        if !self.contains_key(key) {
            return None;
        }
        let mut next = self.clone();
        next.insert(key.clone(), value);
        Some(next)
    }
}

impl<K, V> Pluckable<K> for BTreeMap<K, V>
where
    K: Ord + Clone + 'static,
    V: Clone + PartialEq + 'static,
{
    type Value = V;

    fn plucked(&self, key: &K) -> Option<V> {
        self.get(key).cloned()
    }

    fn with_plucked(&self, key: &K, value: V) -> Option<Self> {
        if !self.contains_key(key) {
            return None;
        }
        let mut next = self.clone();
        next.insert(key.clone(), value);
        Some(next)
    }
}

impl<V: Clone + PartialEq + 'static> Pluckable<usize> for Vec<V> {
    type Value = V;

    fn plucked(&self, index: &usize) -> Option<V> {
        self.get(*index).cloned()
    }

    fn with_plucked(&self, index: &usize, value: V) -> Option<Self> {
        let mut next = self.clone();
        *next.get_mut(*index)? = value;
        Some(next)
    }
}

impl<C: Clone + 'static> Derivable<C> {
    /// Focus on the entry at `key`.
    ///
    /// A missing entry reads as unresolved. Setting a missing entry fails with
    /// [`Error::KeyNotFound`].
    ///
    /// ```
    /// use std::collections::HashMap;
    /// use ripple_core::Graph;
    ///
    /// let graph = Graph::new();
    /// let scores = graph.atom(HashMap::from([("ada", 3), ("alan", 5)]));
    /// let ada = scores.pluck("ada");
    ///
    /// ada.set(4).unwrap();
    /// assert_eq!(scores.get().unwrap()["ada"], 4);
    /// ```
    pub fn pluck<K: 'static>(&self, key: K) -> Derivable<C::Value>
    where
        C: Pluckable<K>,
    {
        let key = std::rc::Rc::new(key);
        let read_key = std::rc::Rc::clone(&key);
        self.lens(
            move |collection| collection.plucked(&read_key).ok_or(Error::Unresolved),
            move |collection, value| collection.with_plucked(&key, value).ok_or(Error::KeyNotFound),
        )
    }
}
