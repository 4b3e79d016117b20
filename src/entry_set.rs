// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Child index for directories: a name-to-entry mapping with stable
//! positional iteration.
//!
//! Removal tombstones a slot instead of shifting later entries, so a
//! directory handle's readdir offset stays meaningful across concurrent
//! unlinks. Tombstones are reused by later inserts and compacted away once
//! no directory handles reference the directory.

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::{Arc, Weak};

use crate::entry::Entry;
use crate::error::{FsError, FsResult};

/// Reference from a directory slot to an entry.
///
/// Real children are owned; the `.` and `..` slots are back references so
/// the cycles they form never own anything.
#[derive(Clone)]
pub(crate) enum ChildRef {
    Owned(Arc<Entry>),
    Back(Weak<Entry>),
}

impl ChildRef {
    pub(crate) fn upgrade(&self) -> Option<Arc<Entry>> {
        match self {
            ChildRef::Owned(e) => Some(Arc::clone(e)),
            ChildRef::Back(w) => w.upgrade(),
        }
    }

    pub(crate) fn is_owned(&self) -> bool {
        matches!(self, ChildRef::Owned(_))
    }
}

struct Slot {
    hash: u64,
    name: String,
    child: ChildRef,
}

/// Hash used for the name fast path before string comparison.
pub(crate) fn name_hash(name: &str) -> u64 {
    let mut h = DefaultHasher::new();
    name.hash(&mut h);
    h.finish()
}

#[derive(Default)]
pub(crate) struct EntrySet {
    slots: Vec<Option<Slot>>,
    live: usize,
}

impl EntrySet {
    pub(crate) fn new() -> Self {
        Self {
            slots: Vec::new(),
            live: 0,
        }
    }

    /// Number of slots, tombstones included. Readdir offsets index into this.
    pub(crate) fn len(&self) -> usize {
        self.slots.len()
    }

    /// Number of occupied slots.
    pub(crate) fn live_len(&self) -> usize {
        self.live
    }

    pub(crate) fn find(&self, name: &str) -> Option<&ChildRef> {
        let hash = name_hash(name);
        self.slots
            .iter()
            .flatten()
            .find(|s| s.hash == hash && s.name == name)
            .map(|s| &s.child)
    }

    /// Insert a child under `name`, reusing the first tombstone if any.
    pub(crate) fn insert(&mut self, name: &str, child: ChildRef) -> FsResult<()> {
        if self.find(name).is_some() {
            return Err(FsError::AlreadyExists);
        }
        let slot = Slot {
            hash: name_hash(name),
            name: name.to_string(),
            child,
        };
        match self.slots.iter_mut().find(|s| s.is_none()) {
            Some(empty) => *empty = Some(slot),
            None => self.slots.push(Some(slot)),
        }
        self.live += 1;
        Ok(())
    }

    /// Remove `name`, leaving a tombstone in its position.
    pub(crate) fn remove(&mut self, name: &str) -> Option<ChildRef> {
        let hash = name_hash(name);
        for slot in self.slots.iter_mut() {
            let matched = matches!(slot, Some(s) if s.hash == hash && s.name == name);
            if matched {
                self.live -= 1;
                return slot.take().map(|s| s.child);
            }
        }
        None
    }

    pub(crate) fn child_at(&self, i: usize) -> Option<&ChildRef> {
        self.slots.get(i)?.as_ref().map(|s| &s.child)
    }

    pub(crate) fn name_at(&self, i: usize) -> Option<&str> {
        self.slots.get(i)?.as_ref().map(|s| s.name.as_str())
    }

    /// Drop tombstones. Only safe while no directory handle holds a
    /// positional cursor into this set.
    pub(crate) fn compact(&mut self) {
        self.slots.retain(|s| s.is_some());
    }

    /// Iterate occupied slots as (name, child).
    pub(crate) fn iter_live(&self) -> impl Iterator<Item = (&str, &ChildRef)> {
        self.slots
            .iter()
            .flatten()
            .map(|s| (s.name.as_str(), &s.child))
    }
}
