// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! The process-wide map from a [`TagHandle`] to its [`Tag`], the Rust
//! analogue of the teacher's session table: handles are allocated from
//! an atomic counter and never reused while a tag is live, and every
//! public API call resolves through here first so an unknown or
//! already-destroyed handle fails the same way regardless of which
//! operation was attempted.

use std::sync::{
    atomic::{AtomicU32, Ordering},
    Arc,
};

use dashmap::DashMap;

use crate::{
    error::{ArgumentError, Error},
    tag::{Tag, TagHandle},
};

/// Cheaply `Clone`-able: the map and counter both live behind an `Arc`,
/// so every clone (one per [`crate::client::TagClient`] method call, one
/// held by the auto-sync worker task) sees the same tags.
#[derive(Clone)]
pub struct TagRegistry {
    tags: Arc<DashMap<TagHandle, Arc<Tag>>>,
    next_handle: Arc<AtomicU32>,
}

impl Default for TagRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl TagRegistry {
    pub fn new() -> Self {
        Self {
            tags: Arc::new(DashMap::new()),
            // Start at 1 so 0 stays free for callers to use as a "no tag" sentinel.
            next_handle: Arc::new(AtomicU32::new(1)),
        }
    }

    pub fn alloc_handle(&self) -> TagHandle {
        self.next_handle.fetch_add(1, Ordering::Relaxed)
    }

    pub fn insert(&self, tag: Arc<Tag>) {
        self.tags.insert(tag.handle, tag);
    }

    pub fn get(&self, handle: TagHandle) -> Result<Arc<Tag>, Error> {
        self.tags
            .get(&handle)
            .map(|entry| Arc::clone(entry.value()))
            .ok_or_else(|| ArgumentError::InvalidHandle(handle).into())
    }

    /// Remove a tag, invalidating its handle for good: a later `get` or
    /// second `remove` for the same handle fails even though the
    /// counter never looks at removed handles again.
    pub fn remove(&self, handle: TagHandle) -> Option<Arc<Tag>> {
        self.tags.remove(&handle).map(|(_, tag)| tag)
    }

    pub fn len(&self) -> usize {
        self.tags.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tags.is_empty()
    }

    /// Snapshot of every live tag. Used by the auto-sync worker, which
    /// needs to walk the whole table once per sweep without holding any
    /// shard locked for the duration.
    pub fn snapshot(&self) -> Vec<Arc<Tag>> {
        self.tags.iter().map(|entry| Arc::clone(entry.value())).collect()
    }
}
