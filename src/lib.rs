//! Key-value cache drivers with TTL expiry and cache invalidation via tags.
//!
//! A [`Cache`] wraps a [`Backend`] (in-process memory, files, SQLite, memcached or Redis) and
//! adds typed values, default lifetimes and tags. Backends that cannot index tags themselves get
//! a local mirror of the tag index which is stored in the backend on [`Cache::close`] (or when
//! the cache is dropped).
//!
//! #### Example
//! ```
//! use tagcache::{backend::MemoryBackend, format::PostcardFormatter, Cache};
//!
//! let mut cache = Cache::new(MemoryBackend::new(), PostcardFormatter, 600);
//!
//! cache.set_with_tags("user:42", &"alice".to_owned(), Some(60), &["users", "active"])?;
//! assert_eq!(cache.get::<String>("user:42")?.as_deref(), Some("alice"));
//!
//! cache.delete_tag("active")?; // invalidate everything tagged with "active"
//! assert_eq!(cache.get::<String>("user:42")?, None);
//! assert!(cache.find_by_tag::<String>("users")?.is_empty());
//!
//! cache.close()?; // write the tag index back to the backend
//! # Ok::<(), tagcache::Error>(())
//! ```

#![forbid(unsafe_code)]
#![warn(clippy::dbg_macro)]
#![warn(missing_docs, missing_debug_implementations)]
#![cfg_attr(docsrs, feature(doc_cfg, doc_auto_cfg))]

use std::collections::BTreeMap;

use backend::{Backend, StoreError};
use config::{CacheConfig, Registry, DEFAULT_EXPIRE};
use format::Formatter;
use key::{KeySanitizer, DEFAULT_SEPARATOR};
use serde::{de::DeserializeOwned, Serialize};
use tags::TagIndex;

pub use postcard;
pub use serde;
#[cfg(feature = "serde_json")]
pub use serde_json;

pub mod backend;
pub mod config;
pub mod expiry;
pub mod format;
pub mod key;
pub mod tags;

/// Options of a [`Cache`] that are independent of the backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Options {
    /// Lifetime in seconds for entries stored without an explicit lifetime. `0` = never expire.
    pub default_expire: i64,
    /// Keep a tag index for backends without native tag support.
    pub tagging: bool,
    /// Separator appended to keys of backends without native tag support.
    pub key_separator: char,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            default_expire: DEFAULT_EXPIRE,
            tagging: true,
            key_separator: DEFAULT_SEPARATOR,
        }
    }
}

impl From<&CacheConfig> for Options {
    fn from(config: &CacheConfig) -> Self {
        Self {
            default_expire: config.default_expire,
            tagging: config.tagging,
            key_separator: config.key_separator.unwrap_or(DEFAULT_SEPARATOR),
        }
    }
}

#[derive(Debug)]
enum Tags {
    /// The backend indexes tags itself.
    Native,
    /// Local mirror of the index stored in the backend.
    Mirror(TagIndex),
    Disabled,
}

/// A cache with optional tag support.
///
/// The cache owns its backend exclusively and is meant to be created once at startup and handed
/// to whoever needs it. It is not synchronized: share it between threads behind a lock or create
/// one instance per thread.
///
/// Reads never fail because of the backend: a failing or undecodable lookup is logged and
/// reported as a miss. Writes and tag operations report backend failures to the caller.
#[derive(Debug)]
pub struct Cache<B: Backend = Box<dyn Backend>, F: Formatter = format::PostcardFormatter> {
    backend: B,
    formatter: F,
    default_expire: i64,
    sanitizer: KeySanitizer,
    tags: Tags,
    closed: bool,
}

impl<F: Formatter> Cache<Box<dyn Backend>, F> {
    /// Create a cache from configuration, selecting the backend from the default [`Registry`].
    ///
    /// #### Example
    /// ```
    /// # use tagcache::{config::CacheConfig, format::PostcardFormatter, Cache};
    /// let dir = tempfile::tempdir()?;
    /// let mut config = CacheConfig::new("sqlite");
    /// config.database = Some(dir.path().join("cache.sqlite3"));
    ///
    /// let mut cache = Cache::from_config(&config, PostcardFormatter)?;
    /// cache.set("answer", &42, None)?;
    /// assert_eq!(cache.get("answer")?, Some(42));
    /// # Ok::<(), Box<dyn std::error::Error>>(())
    /// ```
    pub fn from_config(config: &CacheConfig, formatter: F) -> Result<Self, Error> {
        Self::from_registry(&Registry::default(), config, formatter)
    }

    /// Create a cache from configuration, selecting the backend from `registry`.
    pub fn from_registry(
        registry: &Registry,
        config: &CacheConfig,
        formatter: F,
    ) -> Result<Self, Error> {
        let backend = registry.build(config)?;
        Self::with_options(backend, formatter, config.into())
    }
}

impl<B, F> Cache<B, F>
where
    B: Backend,
    F: Formatter,
{
    /// Create a new [`Cache`] with tags enabled.
    pub fn new(backend: B, formatter: F, default_expire: i64) -> Self {
        Self::assemble(
            backend,
            formatter,
            default_expire,
            true,
            KeySanitizer::default_separated(),
        )
    }

    /// Create a new [`Cache`] with the given options.
    ///
    /// Fails if the key separator is unusable.
    pub fn with_options(backend: B, formatter: F, options: Options) -> Result<Self, Error> {
        let separated = KeySanitizer::separated(options.key_separator)?;
        Ok(Self::assemble(
            backend,
            formatter,
            options.default_expire,
            options.tagging,
            separated,
        ))
    }

    fn assemble(
        mut backend: B,
        formatter: F,
        default_expire: i64,
        tagging: bool,
        separated: KeySanitizer,
    ) -> Self {
        // keys of native backends are never mixed with the index key
        let (sanitizer, tags) = if backend.tagged().is_some() {
            (KeySanitizer::plain(), Tags::Native)
        } else if tagging {
            (separated, Tags::Mirror(TagIndex::load(&mut backend)))
        } else {
            (separated, Tags::Disabled)
        };
        Self {
            backend,
            formatter,
            default_expire,
            sanitizer,
            tags,
            closed: false,
        }
    }

    /// The backend of this cache.
    pub fn backend(&self) -> &B {
        &self.backend
    }

    /// Whether tags can be used with this cache.
    pub fn supports_tags(&self) -> bool {
        !matches!(self.tags, Tags::Disabled)
    }

    /// Whether [`close`](Self::close) has been called successfully.
    pub fn is_closed(&self) -> bool {
        self.closed
    }

    fn ready(&self) -> Result<(), Error> {
        if self.closed {
            return Err(Error::AlreadyClosed);
        }
        Ok(())
    }

    /// Wrap a function to add a caching layer.
    ///
    /// #### Example
    /// ```
    /// # use tagcache::{backend::MemoryBackend, format::PostcardFormatter, Cache};
    /// let mut cache = Cache::new(MemoryBackend::new(), PostcardFormatter, 600);
    /// let sum = cache.cached("sum", &["math"], None, || (1..=1000u64).sum::<u64>())?;
    /// assert_eq!(sum, 500500);
    /// // now served from the cache
    /// assert_eq!(cache.cached("sum", &["math"], None, || 0u64)?, 500500);
    /// # Ok::<(), tagcache::Error>(())
    /// ```
    pub fn cached<T, Func>(
        &mut self,
        id: &str,
        tags: &[&str],
        ttl: Option<i64>,
        func: Func,
    ) -> Result<T, Error>
    where
        Func: FnOnce() -> T,
        T: Serialize + DeserializeOwned,
    {
        if let Some(value) = self.get(id)? {
            return Ok(value);
        }
        let value = func();
        self.set_with_tags(id, &value, ttl, tags)?;
        Ok(value)
    }

    /// Wrap a fallible function to add a caching layer.
    /// Cache [`Result::Ok`] variants only.
    pub fn cached_result<T, E, Func>(
        &mut self,
        id: &str,
        tags: &[&str],
        ttl: Option<i64>,
        func: Func,
    ) -> Result<Result<T, E>, Error>
    where
        Func: FnOnce() -> Result<T, E>,
        T: Serialize + DeserializeOwned,
    {
        if let Some(value) = self.get(id)? {
            return Ok(Ok(value));
        }
        let value = match func() {
            Ok(x) => x,
            Err(err) => return Ok(Err(err)),
        };
        self.set_with_tags(id, &value, ttl, tags)?;
        Ok(Ok(value))
    }

    /// Get a cached value. Returns `None` on a miss, an expired entry, a backend failure or an
    /// undecodable entry.
    pub fn get<T: DeserializeOwned>(&mut self, id: &str) -> Result<Option<T>, Error> {
        self.ready()?;
        let key = self.sanitizer.sanitize(id);
        let raw = match self.backend.get(&key) {
            Ok(Some(raw)) => raw,
            Ok(None) => {
                log::debug!("cache miss for {key:?}");
                return Ok(None);
            }
            Err(err) => {
                log::warn!("cache lookup for {key:?} failed, treating as miss: {err}");
                return Ok(None);
            }
        };
        Ok(self.decode(&key, &raw))
    }

    /// Get a cached value or `default` if there is none.
    pub fn get_or<T: DeserializeOwned>(&mut self, id: &str, default: T) -> Result<T, Error> {
        Ok(self.get(id)?.unwrap_or(default))
    }

    fn decode<T: DeserializeOwned>(&self, key: &str, raw: &[u8]) -> Option<T> {
        match self.formatter.deserialize(raw) {
            Ok(value) => Some(value),
            Err(err) => {
                log::warn!("cache entry {key:?} cannot be decoded, treating as miss: {err}");
                None
            }
        }
    }

    /// Insert a new or update an existing cache entry.
    ///
    /// `ttl` is the lifetime in seconds: `None` uses the default lifetime, `0` never expires and
    /// lifetimes beyond the backend's ceiling are clamped.
    pub fn set<T: Serialize>(
        &mut self,
        id: &str,
        value: &T,
        ttl: Option<i64>,
    ) -> Result<bool, Error> {
        self.set_with_tags(id, value, ttl, &[])
    }

    /// Insert a new or update an existing cache entry and associate it with `tags`.
    ///
    /// The value can be invalidated with [`delete`](Self::delete) or by deleting any of its tags
    /// with [`delete_tag`](Self::delete_tag).
    pub fn set_with_tags<T: Serialize>(
        &mut self,
        id: &str,
        value: &T,
        ttl: Option<i64>,
        tags: &[&str],
    ) -> Result<bool, Error> {
        self.ready()?;
        if !tags.is_empty() && !self.supports_tags() {
            return Err(Error::TaggingUnsupported);
        }
        let key = self.sanitizer.sanitize(id);
        let serialized = self
            .formatter
            .serialize(value)
            .map_err(|err| Error::Format(Box::new(err)))?;
        let expiry = self.backend.expiry_policy().resolve(ttl, self.default_expire);

        if tags.is_empty() {
            return Ok(self.backend.set(&key, &serialized, expiry)?);
        }
        match &mut self.tags {
            Tags::Native => match self.backend.tagged() {
                Some(tagged) => Ok(tagged.set_tagged(&key, &serialized, expiry, tags)?),
                None => Err(Error::TaggingUnsupported),
            },
            Tags::Mirror(index) => {
                let stored = self.backend.set(&key, &serialized, expiry)?;
                if stored {
                    for tag in tags {
                        index.associate(tag, &key);
                    }
                }
                Ok(stored)
            }
            Tags::Disabled => Err(Error::TaggingUnsupported),
        }
    }

    /// Invalidate a specific cache entry by its id.
    ///
    /// Returns `false` if the backend reports there was no such entry.
    pub fn delete(&mut self, id: &str) -> Result<bool, Error> {
        self.ready()?;
        let key = self.sanitizer.sanitize(id);
        let deleted = self.backend.delete(&key)?;
        if let Tags::Mirror(index) = &mut self.tags {
            index.remove_key(&key);
        }
        Ok(deleted)
    }

    /// Invalidate every entry of this cache.
    pub fn delete_all(&mut self) -> Result<bool, Error> {
        self.ready()?;
        let deleted = self.backend.delete_all()?;
        if let Tags::Mirror(index) = &mut self.tags {
            index.clear();
        }
        Ok(deleted)
    }

    /// Invalidate all cache entries that are associated with the given tag.
    ///
    /// Returns whether any entry was associated with the tag. If some entries cannot be deleted,
    /// the others are deleted anyway and [`Error::TagInvalidation`] lists the failures.
    pub fn delete_tag(&mut self, tag: &str) -> Result<bool, Error> {
        self.ready()?;
        match &mut self.tags {
            Tags::Native => match self.backend.tagged() {
                Some(tagged) => Ok(tagged.delete_tag(tag)?),
                None => Err(Error::TaggingUnsupported),
            },
            Tags::Mirror(index) => {
                index
                    .delete_tag(tag, &mut self.backend)
                    .map_err(|failures| Error::TagInvalidation {
                        tag: tag.to_owned(),
                        failures,
                    })
            }
            Tags::Disabled => Err(Error::TaggingUnsupported),
        }
    }

    /// Get all live entries associated with the given tag, by id.
    ///
    /// Entries that expired or were removed behind the cache's back are left out.
    pub fn find_by_tag<T: DeserializeOwned>(
        &mut self,
        tag: &str,
    ) -> Result<BTreeMap<String, T>, Error> {
        self.ready()?;
        let entries = match &mut self.tags {
            Tags::Native => match self.backend.tagged() {
                Some(tagged) => tagged.find_tag(tag)?,
                None => return Err(Error::TaggingUnsupported),
            },
            Tags::Mirror(index) => {
                let mut entries = Vec::new();
                for key in index.keys_for_tag(tag) {
                    match self.backend.get(&key) {
                        Ok(Some(raw)) => entries.push((key, raw)),
                        Ok(None) => log::debug!("tag {tag:?} lists missing entry {key:?}"),
                        Err(err) => log::warn!("cache lookup for {key:?} failed, skipping: {err}"),
                    }
                }
                entries
            }
            Tags::Disabled => return Err(Error::TaggingUnsupported),
        };
        Ok(entries
            .into_iter()
            .filter_map(|(key, raw)| {
                let value = self.decode(&key, &raw)?;
                Some((self.sanitizer.unsanitize(&key).to_owned(), value))
            })
            .collect())
    }

    /// Create or overwrite a counter.
    pub fn set_counter(&mut self, id: &str, value: i64, ttl: Option<i64>) -> Result<(), Error> {
        self.ready()?;
        let key = self.sanitizer.sanitize(id);
        let expiry = self.backend.expiry_policy().resolve(ttl, self.default_expire);
        let counters = self.backend.arithmetic().ok_or(Error::ArithmeticUnsupported)?;
        Ok(counters.set_counter(&key, value, expiry)?)
    }

    /// Read a counter. Like [`get`](Self::get), backend failures are reported as a miss.
    pub fn get_counter(&mut self, id: &str) -> Result<Option<i64>, Error> {
        self.ready()?;
        let key = self.sanitizer.sanitize(id);
        let counters = self.backend.arithmetic().ok_or(Error::ArithmeticUnsupported)?;
        match counters.get_counter(&key) {
            Ok(value) => Ok(value),
            Err(err) => {
                log::warn!("counter lookup for {key:?} failed, treating as miss: {err}");
                Ok(None)
            }
        }
    }

    /// Add `step` to a counter and return the new value, `None` if the counter does not exist.
    pub fn increment(&mut self, id: &str, step: i64) -> Result<Option<i64>, Error> {
        self.ready()?;
        let key = self.sanitizer.sanitize(id);
        let counters = self.backend.arithmetic().ok_or(Error::ArithmeticUnsupported)?;
        Ok(counters.increment(&key, step)?)
    }

    /// Subtract `step` from a counter and return the new value, `None` if the counter does not
    /// exist.
    pub fn decrement(&mut self, id: &str, step: i64) -> Result<Option<i64>, Error> {
        self.ready()?;
        let key = self.sanitizer.sanitize(id);
        let counters = self.backend.arithmetic().ok_or(Error::ArithmeticUnsupported)?;
        Ok(counters.decrement(&key, step)?)
    }

    /// Physically remove expired entries, for backends that can enumerate them.
    pub fn garbage_collect(&mut self) -> Result<usize, Error> {
        self.ready()?;
        let purged = self.backend.purge_expired()?;
        log::debug!("purged {purged} expired cache entries");
        Ok(purged)
    }

    /// Write the tag index back to the backend if it changed.
    ///
    /// Returns whether anything was written.
    pub fn flush(&mut self) -> Result<bool, Error> {
        self.ready()?;
        match &mut self.tags {
            Tags::Mirror(index) => Ok(index.flush(&mut self.backend)?),
            Tags::Native | Tags::Disabled => Ok(false),
        }
    }

    /// Flush the tag index and close the cache. Every later operation fails with
    /// [`Error::AlreadyClosed`].
    ///
    /// If flushing fails the cache stays open, so the flush can be retried.
    pub fn close(&mut self) -> Result<(), Error> {
        self.flush()?;
        self.closed = true;
        Ok(())
    }
}

impl<B: Backend, F: Formatter> Drop for Cache<B, F> {
    fn drop(&mut self) {
        if self.closed {
            return;
        }
        if let Err(err) = self.flush() {
            log::warn!("failed to flush tag index on drop: {err}");
        }
    }
}

#[allow(missing_docs)]
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("cache backend unavailable: {0}")]
    BackendUnavailable(String),
    #[error("backend error: {0}")]
    Store(#[from] StoreError),
    #[error("tagging is not supported by this cache")]
    TaggingUnsupported,
    #[error("counters are not supported by this cache")]
    ArithmeticUnsupported,
    #[error("cache is already closed")]
    AlreadyClosed,
    #[error("configuration error: {0}")]
    Config(String),
    #[error("formatter error: {0}")]
    Format(#[source] Box<dyn std::error::Error + Send + Sync>),
    #[error("failed to delete {} entries of tag {tag:?}", .failures.len())]
    TagInvalidation {
        tag: String,
        failures: Vec<(String, StoreError)>,
    },
}
