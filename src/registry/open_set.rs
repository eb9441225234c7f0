//! The open-set: an index of every in-use slot (spec.md §4.2).
//!
//! The source walks this linearly for `by_gxid`/`by_gid`/`by_session`.
//! Per the design note in spec.md §9, this implementation keeps that
//! O(N) baseline honest by construction (`members` preserves insertion
//! order) but backs the three lookups with auxiliary hash indexes
//! maintained on every membership change, so the hot lookups are O(1)
//! while iteration order is still available for `TXN_GXID_LIST`.

use crate::gxid::Gxid;
use crate::handle::Handle;
use crate::ids::Gid;
use std::collections::HashMap;

#[derive(Debug, Default)]
pub struct OpenSet {
    members: Vec<Handle>,
    position: HashMap<Handle, usize>,
    by_gxid: HashMap<Gxid, Handle>,
    by_gid: HashMap<Gid, Handle>,
    by_session: HashMap<String, Handle>,
}

impl OpenSet {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, handle: Handle) {
        let pos = self.members.len();
        self.members.push(handle);
        self.position.insert(handle, pos);
    }

    /// Removes a handle from the membership list and every auxiliary index
    /// it might appear in. Swap-remove keeps this O(1) at the cost of
    /// member ordering (acceptable: nothing in the spec requires the
    /// open-set to iterate in allocation order).
    pub fn remove(&mut self, handle: Handle) {
        if let Some(&pos) = self.position.get(&handle) {
            let last = self.members.len() - 1;
            self.members.swap_remove(pos);
            self.position.remove(&handle);
            if pos != last
                && let Some(moved) = self.members.get(pos).copied()
            {
                self.position.insert(moved, pos);
            }
        }
        self.by_gxid.retain(|_, h| *h != handle);
        self.by_gid.retain(|_, h| *h != handle);
        self.by_session.retain(|_, h| *h != handle);
    }

    #[must_use]
    pub fn contains(&self, handle: Handle) -> bool {
        self.position.contains_key(&handle)
    }

    pub fn index_gxid(&mut self, gxid: Gxid, handle: Handle) {
        self.by_gxid.insert(gxid, handle);
    }

    pub fn index_gid(&mut self, gid: Gid, handle: Handle) {
        self.by_gid.insert(gid, handle);
    }

    pub fn index_session(&mut self, session: &str, handle: Handle) {
        if !session.is_empty() {
            self.by_session.insert(session.to_string(), handle);
        }
    }

    #[must_use]
    pub fn by_gxid(&self, gxid: Gxid) -> Option<Handle> {
        self.by_gxid.get(&gxid).copied()
    }

    #[must_use]
    pub fn by_gid(&self, gid: &Gid) -> Option<Handle> {
        self.by_gid.get(gid).copied()
    }

    #[must_use]
    pub fn by_session(&self, session: &str) -> Option<Handle> {
        if session.is_empty() {
            return None;
        }
        self.by_session.get(session).copied()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.members.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = Handle> + '_ {
        self.members.iter().copied()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn insert_and_lookup_by_gxid() {
        let mut set = OpenSet::new();
        let h = Handle::from_index(3);
        set.insert(h);
        set.index_gxid(Gxid::new(9), h);
        assert_eq!(set.by_gxid(Gxid::new(9)), Some(h));
        assert!(set.contains(h));
    }

    #[test]
    fn remove_clears_all_indexes() {
        let mut set = OpenSet::new();
        let h = Handle::from_index(1);
        set.insert(h);
        set.index_gxid(Gxid::new(4), h);
        set.index_session("s1", h);
        set.remove(h);
        assert!(!set.contains(h));
        assert_eq!(set.by_gxid(Gxid::new(4)), None);
        assert_eq!(set.by_session("s1"), None);
    }

    #[test]
    fn swap_remove_keeps_remaining_positions_valid() {
        let mut set = OpenSet::new();
        let handles: Vec<_> = (0..5).map(Handle::from_index).collect();
        for h in &handles {
            set.insert(*h);
        }
        set.remove(handles[1]);
        for h in [handles[0], handles[2], handles[3], handles[4]] {
            assert!(set.contains(h));
        }
        assert_eq!(set.len(), 4);
    }
}
