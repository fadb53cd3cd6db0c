//! Cache backend in process memory.

use std::{collections::HashMap, sync::Arc};

use parking_lot::Mutex;

use crate::{
    backend::{parse_counter, ArithmeticBackend, Backend, StoreError},
    expiry::{self, Expiry},
};

#[derive(Debug, Clone)]
struct Entry {
    value: Vec<u8>,
    expiry: Expiry,
}

/// Cache backend keeping entries in a map shared by all clones of the backend.
///
/// Clones behave like separate clients of one shared memory segment: an entry written through
/// one clone is visible to all others.
#[derive(Debug, Clone, Default)]
pub struct MemoryBackend {
    entries: Arc<Mutex<HashMap<String, Entry>>>,
}

impl MemoryBackend {
    /// Create a new, empty [`MemoryBackend`].
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored entries, expired ones included.
    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    /// Whether no entries are stored.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn live(&self, key: &str) -> Option<Entry> {
        let mut entries = self.entries.lock();
        match entries.get(key) {
            Some(entry) if entry.expiry.is_expired() => {
                entries.remove(key);
                None
            }
            entry => entry.cloned(),
        }
    }
}

impl Backend for MemoryBackend {
    fn get(&mut self, key: &str) -> Result<Option<Vec<u8>>, StoreError> {
        Ok(self.live(key).map(|entry| entry.value))
    }

    fn set(&mut self, key: &str, value: &[u8], expiry: Expiry) -> Result<bool, StoreError> {
        self.entries.lock().insert(
            key.to_owned(),
            Entry {
                value: value.to_vec(),
                expiry,
            },
        );
        Ok(true)
    }

    fn delete(&mut self, key: &str) -> Result<bool, StoreError> {
        Ok(self.entries.lock().remove(key).is_some())
    }

    fn delete_all(&mut self) -> Result<bool, StoreError> {
        self.entries.lock().clear();
        Ok(true)
    }

    fn purge_expired(&mut self) -> Result<usize, StoreError> {
        let now = expiry::now();
        let mut entries = self.entries.lock();
        let before = entries.len();
        entries.retain(|_, entry| !entry.expiry.is_expired_at(now));
        Ok(before - entries.len())
    }

    fn arithmetic(&mut self) -> Option<&mut dyn ArithmeticBackend> {
        Some(self)
    }
}

impl ArithmeticBackend for MemoryBackend {
    fn set_counter(&mut self, key: &str, value: i64, expiry: Expiry) -> Result<(), StoreError> {
        self.set(key, value.to_string().as_bytes(), expiry)?;
        Ok(())
    }

    fn get_counter(&mut self, key: &str) -> Result<Option<i64>, StoreError> {
        self.live(key)
            .map(|entry| parse_counter(&entry.value))
            .transpose()
    }

    fn increment(&mut self, key: &str, step: i64) -> Result<Option<i64>, StoreError> {
        let now = expiry::now();
        let mut entries = self.entries.lock();
        let Some(entry) = entries.get_mut(key) else {
            return Ok(None);
        };
        if entry.expiry.is_expired_at(now) {
            entries.remove(key);
            return Ok(None);
        }
        let value = parse_counter(&entry.value)?
            .checked_add(step)
            .ok_or(StoreError::Overflow)?;
        entry.value = value.to_string().into_bytes();
        Ok(Some(value))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clones_share_entries() {
        let mut a = MemoryBackend::new();
        let mut b = a.clone();
        a.set("k", b"v", Expiry::Never).unwrap();
        assert_eq!(b.get("k").unwrap().as_deref(), Some(&b"v"[..]));
        assert!(b.delete("k").unwrap());
        assert!(!a.delete("k").unwrap());
    }

    #[test]
    fn expired_entries_are_removed_on_read() {
        let mut backend = MemoryBackend::new();
        backend.set("old", b"v", Expiry::At(1)).unwrap();
        assert_eq!(backend.len(), 1);
        assert_eq!(backend.get("old").unwrap(), None);
        assert!(backend.is_empty());
    }

    #[test]
    fn purge_removes_only_expired_entries() {
        let mut backend = MemoryBackend::new();
        backend.set("old", b"v", Expiry::At(1)).unwrap();
        backend.set("new", b"v", Expiry::Never).unwrap();
        assert_eq!(backend.purge_expired().unwrap(), 1);
        assert_eq!(backend.len(), 1);
    }

    #[test]
    fn counters() {
        let mut backend = MemoryBackend::new();
        assert_eq!(backend.increment("c", 1).unwrap(), None);
        backend.set_counter("c", 10, Expiry::Never).unwrap();
        assert_eq!(backend.increment("c", 5).unwrap(), Some(15));
        assert_eq!(backend.decrement("c", 20).unwrap(), Some(-5));
        assert_eq!(backend.get_counter("c").unwrap(), Some(-5));
        backend.set("c", b"nope", Expiry::Never).unwrap();
        assert!(matches!(backend.increment("c", 1), Err(StoreError::NotACounter)));
    }
}
