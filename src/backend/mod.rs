//! Backends are used to communicate with the cache and implement the most basic low level functions
//! like [`get`](Backend::get) and [`set`](Backend::set).
//!
//! Backends store opaque bytes. Optional capabilities are exposed through
//! [`Backend::tagged`] and [`Backend::arithmetic`], which return `None` for backends that do not
//! support them.

use std::fmt::Debug;

use thiserror::Error;

use crate::expiry::{Expiry, ExpiryPolicy};

pub use file::FileBackend;
pub use memcache::MemcacheBackend;
pub use memory::MemoryBackend;
pub use redis::RedisBackend;
pub use sqlite::SqliteBackend;

pub mod file;
pub mod memcache;
pub mod memory;
pub mod redis;
pub mod sqlite;

/// A cache backend.
///
/// A backend instance owns its connection or handle exclusively, hence every operation takes
/// `&mut self`.
pub trait Backend: Debug {
    /// Get a cached value. Expired entries are reported as `None`.
    fn get(&mut self, key: &str) -> Result<Option<Vec<u8>>, StoreError>;

    /// Set a cached value, overwriting any previous entry.
    fn set(&mut self, key: &str, value: &[u8], expiry: Expiry) -> Result<bool, StoreError>;

    /// Remove a cached value.
    ///
    /// Returns `false` if the backend reports that there was nothing to remove.
    fn delete(&mut self, key: &str) -> Result<bool, StoreError>;

    /// Remove every cached value in this backend's namespace.
    fn delete_all(&mut self) -> Result<bool, StoreError>;

    /// Lifetime rules of this backend.
    fn expiry_policy(&self) -> ExpiryPolicy {
        ExpiryPolicy::UNBOUNDED
    }

    /// Physically remove expired entries and return how many were removed.
    ///
    /// Backends that cannot enumerate their entries return `0`.
    fn purge_expired(&mut self) -> Result<usize, StoreError> {
        Ok(0)
    }

    /// Native tag support, if the backend has it.
    fn tagged(&mut self) -> Option<&mut dyn TaggedBackend> {
        None
    }

    /// Native counter support, if the backend has it.
    fn arithmetic(&mut self) -> Option<&mut dyn ArithmeticBackend> {
        None
    }
}

/// A backend that maintains the tag index itself.
pub trait TaggedBackend {
    /// Set a cached value and associate it with the given tags.
    fn set_tagged(
        &mut self,
        key: &str,
        value: &[u8],
        expiry: Expiry,
        tags: &[&str],
    ) -> Result<bool, StoreError>;

    /// Remove all cached values that are associated with the given tag.
    ///
    /// Returns `true` if at least one value was associated with the tag.
    fn delete_tag(&mut self, tag: &str) -> Result<bool, StoreError>;

    /// Get all live values that are associated with the given tag.
    fn find_tag(&mut self, tag: &str) -> Result<Vec<(String, Vec<u8>)>, StoreError>;
}

/// A backend that supports counters.
///
/// Counters are stored as decimal text so the backend can update them in place.
pub trait ArithmeticBackend {
    /// Create or overwrite a counter.
    fn set_counter(&mut self, key: &str, value: i64, expiry: Expiry) -> Result<(), StoreError>;

    /// Read a counter. Returns `None` if it does not exist.
    fn get_counter(&mut self, key: &str) -> Result<Option<i64>, StoreError>;

    /// Add `step` to an existing counter and return the new value.
    ///
    /// Returns `None` if the counter does not exist.
    fn increment(&mut self, key: &str, step: i64) -> Result<Option<i64>, StoreError>;

    /// Subtract `step` from an existing counter and return the new value.
    fn decrement(&mut self, key: &str, step: i64) -> Result<Option<i64>, StoreError> {
        self.increment(key, step.checked_neg().ok_or(StoreError::Overflow)?)
    }
}

impl<B: Backend + ?Sized> Backend for Box<B> {
    fn get(&mut self, key: &str) -> Result<Option<Vec<u8>>, StoreError> {
        (**self).get(key)
    }

    fn set(&mut self, key: &str, value: &[u8], expiry: Expiry) -> Result<bool, StoreError> {
        (**self).set(key, value, expiry)
    }

    fn delete(&mut self, key: &str) -> Result<bool, StoreError> {
        (**self).delete(key)
    }

    fn delete_all(&mut self) -> Result<bool, StoreError> {
        (**self).delete_all()
    }

    fn expiry_policy(&self) -> ExpiryPolicy {
        (**self).expiry_policy()
    }

    fn purge_expired(&mut self) -> Result<usize, StoreError> {
        (**self).purge_expired()
    }

    fn tagged(&mut self) -> Option<&mut dyn TaggedBackend> {
        (**self).tagged()
    }

    fn arithmetic(&mut self) -> Option<&mut dyn ArithmeticBackend> {
        (**self).arithmetic()
    }
}

pub(crate) fn parse_counter(raw: &[u8]) -> Result<i64, StoreError> {
    std::str::from_utf8(raw)
        .ok()
        .and_then(|s| s.trim().parse().ok())
        .ok_or(StoreError::NotACounter)
}

#[allow(missing_docs)]
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("redis error: {0}")]
    Redis(#[from] ::redis::RedisError),
    #[error("memcache error: {0}")]
    Memcache(#[from] ::memcache::MemcacheError),
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("postcard error: {0}")]
    Postcard(#[from] postcard::Error),
    #[error("invalid tag: {0:?}")]
    InvalidTag(String),
    #[error("stored value is not a counter")]
    NotACounter,
    #[error("counter overflow")]
    Overflow,
}
