//! Local mirror of the tag index for backends without native tag support.
//!
//! The index maps every tag to the set of keys stored with it. Its copy of record is a single
//! entry in the backend under [`TAG_INDEX_KEY`], shared by every process using that backend. A
//! [`TagIndex`] is loaded once, mutated in memory and written back by [`TagIndex::flush`] only if
//! it changed. Concurrent writers in other processes are not merged: the last flush wins.

use std::collections::{BTreeMap, BTreeSet};

use crate::backend::{Backend, StoreError};
use crate::expiry::Expiry;

/// Backend key holding the serialized index.
///
/// Keys produced by a separated [`KeySanitizer`](crate::key::KeySanitizer) always end with the
/// separator, so this key can never be chosen by a caller.
pub const TAG_INDEX_KEY: &str = "__tag_index__";

/// Mapping from tag to the keys associated with it.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct TagIndex {
    mapping: BTreeMap<String, BTreeSet<String>>,
    dirty: bool,
}

impl TagIndex {
    /// Create an empty index.
    pub fn new() -> Self {
        Self::default()
    }

    /// Load the index stored in `backend`.
    ///
    /// Absent, unreadable or corrupt data yields an empty index.
    pub fn load<B: Backend + ?Sized>(backend: &mut B) -> Self {
        let raw = match backend.get(TAG_INDEX_KEY) {
            Ok(Some(raw)) => raw,
            Ok(None) => return Self::new(),
            Err(err) => {
                log::warn!("failed to load tag index, starting empty: {err}");
                return Self::new();
            }
        };
        match postcard::from_bytes(&raw) {
            Ok(mapping) => {
                let index = Self {
                    mapping,
                    dirty: false,
                };
                log::debug!("loaded tag index with {} tags", index.mapping.len());
                index
            }
            Err(err) => {
                log::warn!("discarding corrupt tag index: {err}");
                Self::new()
            }
        }
    }

    /// Write the index back to `backend` if it changed since it was loaded or last flushed.
    ///
    /// Returns whether anything was written.
    pub fn flush<B: Backend + ?Sized>(&mut self, backend: &mut B) -> Result<bool, StoreError> {
        if !self.dirty {
            return Ok(false);
        }
        let raw = postcard::to_stdvec(&self.mapping)?;
        backend.set(TAG_INDEX_KEY, &raw, Expiry::Never)?;
        self.dirty = false;
        log::debug!("flushed tag index with {} tags", self.mapping.len());
        Ok(true)
    }

    /// Whether the index has unflushed changes.
    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    /// Add `key` to the set of `tag`.
    pub fn associate(&mut self, tag: &str, key: &str) {
        if self
            .mapping
            .entry(tag.to_owned())
            .or_default()
            .insert(key.to_owned())
        {
            self.dirty = true;
        }
    }

    /// Remove `key` from the set of `tag`.
    pub fn disassociate(&mut self, tag: &str, key: &str) {
        let Some(keys) = self.mapping.get_mut(tag) else {
            return;
        };
        if keys.remove(key) {
            if keys.is_empty() {
                self.mapping.remove(tag);
            }
            self.dirty = true;
        }
    }

    /// Remove `key` from every tag.
    ///
    /// This scans all tags, as the index keeps no reverse mapping.
    pub fn remove_key(&mut self, key: &str) {
        let before = self.mapping.len();
        let mut changed = false;
        self.mapping.retain(|_, keys| {
            changed |= keys.remove(key);
            !keys.is_empty()
        });
        if changed || self.mapping.len() != before {
            self.dirty = true;
        }
    }

    /// Keys currently associated with `tag`, empty if the tag is unknown.
    pub fn keys_for_tag(&self, tag: &str) -> BTreeSet<String> {
        self.mapping.get(tag).cloned().unwrap_or_default()
    }

    /// All known tags.
    pub fn tags(&self) -> impl Iterator<Item = &str> {
        self.mapping.keys().map(String::as_str)
    }

    /// Delete every entry associated with `tag` from `backend`, then forget the tag.
    ///
    /// Every deletion is attempted even if an earlier one failed. Keys whose deletion failed stay
    /// associated with the tag, so a later call can retry them, and are returned as the error.
    /// On success, returns whether the tag had any keys.
    pub fn delete_tag<B: Backend + ?Sized>(
        &mut self,
        tag: &str,
        backend: &mut B,
    ) -> Result<bool, Vec<(String, StoreError)>> {
        let Some(keys) = self.mapping.remove(tag) else {
            return Ok(false);
        };
        self.dirty = true;

        let mut failed = BTreeSet::new();
        let mut failures = Vec::new();
        for key in keys {
            if let Err(err) = backend.delete(&key) {
                log::warn!("failed to delete {key:?} while deleting tag {tag:?}: {err}");
                failed.insert(key.clone());
                failures.push((key, err));
            }
        }
        if failures.is_empty() {
            return Ok(true);
        }
        self.mapping.insert(tag.to_owned(), failed);
        Err(failures)
    }

    /// Forget all tags.
    pub fn clear(&mut self) {
        if !self.mapping.is_empty() {
            self.mapping.clear();
            self.dirty = true;
        }
    }
}
