//! Cache configuration and the registry of drivers that can be selected by name.

use std::{collections::HashMap, path::PathBuf, time::Duration};

use serde::Deserialize;

use crate::{
    backend::{Backend, FileBackend, MemcacheBackend, MemoryBackend, RedisBackend, SqliteBackend},
    Error,
};

/// Lifetime used when neither the caller nor the configuration specify one (one hour).
pub const DEFAULT_EXPIRE: i64 = 3600;

/// Configuration of a single cache instance.
///
/// Deserializable from any serde format, e.g. JSON:
///
/// ```
/// # use tagcache::config::CacheConfig;
/// let config: CacheConfig = serde_json::from_str(r#"{
///     "driver": "memcache",
///     "default_expire": 600,
///     "servers": [{ "host": "localhost", "port": 11211 }]
/// }"#).unwrap();
/// assert_eq!(config.servers[0].weight, 1);
/// assert!(config.tagging);
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CacheConfig {
    /// Name of the driver in the [`Registry`].
    pub driver: String,
    /// Lifetime in seconds for entries stored without an explicit lifetime. `0` = never expire.
    #[serde(default = "default_expire")]
    pub default_expire: i64,
    /// Servers of network backends.
    #[serde(default)]
    pub servers: Vec<ServerConfig>,
    /// Directory of the file backend.
    #[serde(default)]
    pub cache_dir: Option<PathBuf>,
    /// Database path of the sqlite backend.
    #[serde(default)]
    pub database: Option<PathBuf>,
    /// Compress stored payloads, where the backend supports it.
    #[serde(default)]
    pub compression: bool,
    /// Enable tags on backends without native tag support.
    ///
    /// The index is kept in a single backend entry, which may be too large for some backends
    /// (memcached limits entries to 1MB by default).
    #[serde(default = "default_tagging")]
    pub tagging: bool,
    /// Prefix separating this cache from others sharing a network backend.
    #[serde(default = "default_namespace")]
    pub namespace: String,
    /// Separator appended to keys of backends without native tag support.
    #[serde(default)]
    pub key_separator: Option<char>,
    /// Connect, read and write timeout in milliseconds, passed to the backend client.
    #[serde(default)]
    pub timeout: Option<u64>,
}

impl CacheConfig {
    /// Configuration for `driver` with every other option at its default.
    pub fn new(driver: impl Into<String>) -> Self {
        Self {
            driver: driver.into(),
            default_expire: DEFAULT_EXPIRE,
            servers: Vec::new(),
            cache_dir: None,
            database: None,
            compression: false,
            tagging: true,
            namespace: default_namespace(),
            key_separator: None,
            timeout: None,
        }
    }

    /// The configured timeout.
    pub fn timeout(&self) -> Option<Duration> {
        self.timeout.map(Duration::from_millis)
    }
}

/// A server of a network backend.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ServerConfig {
    /// Host name or address.
    pub host: String,
    /// Port number.
    pub port: u16,
    /// Relative weight in the server pool.
    #[serde(default = "default_weight")]
    pub weight: u32,
    /// Keep the connection open across cache instances.
    #[serde(default)]
    pub persistent: bool,
}

fn default_expire() -> i64 {
    DEFAULT_EXPIRE
}

fn default_tagging() -> bool {
    true
}

fn default_namespace() -> String {
    "tagcache".to_owned()
}

fn default_weight() -> u32 {
    1
}

/// Constructor of a backend from configuration.
pub type Constructor = fn(&CacheConfig) -> Result<Box<dyn Backend>, Error>;

/// Maps driver names to backend constructors.
///
/// #### Example
/// ```
/// # use tagcache::{backend::MemoryBackend, config::{CacheConfig, Registry}};
/// let mut registry = Registry::default();
/// registry.register("scratch", |_| Ok(Box::new(MemoryBackend::new())));
/// assert!(registry.build(&CacheConfig::new("scratch")).is_ok());
/// assert!(registry.build(&CacheConfig::new("xcache")).is_err());
/// ```
#[derive(Clone)]
pub struct Registry {
    drivers: HashMap<String, Constructor>,
}

impl std::fmt::Debug for Registry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_set().entries(self.drivers.keys()).finish()
    }
}

impl Default for Registry {
    /// Registry with the drivers of this crate: `memory`, `file`, `sqlite`, `memcache` and
    /// `redis`.
    fn default() -> Self {
        let mut registry = Self::empty();
        registry.register("memory", build_memory);
        registry.register("file", build_file);
        registry.register("sqlite", build_sqlite);
        registry.register("memcache", build_memcache);
        registry.register("redis", build_redis);
        registry
    }
}

impl Registry {
    /// Registry without any drivers.
    pub fn empty() -> Self {
        Self {
            drivers: HashMap::new(),
        }
    }

    /// Register (or replace) a driver.
    pub fn register(&mut self, name: impl Into<String>, constructor: Constructor) -> &mut Self {
        self.drivers.insert(name.into(), constructor);
        self
    }

    /// Names of all registered drivers.
    pub fn drivers(&self) -> impl Iterator<Item = &str> {
        self.drivers.keys().map(String::as_str)
    }

    /// Construct the backend selected by `config.driver`.
    pub fn build(&self, config: &CacheConfig) -> Result<Box<dyn Backend>, Error> {
        let constructor = self
            .drivers
            .get(&config.driver)
            .ok_or_else(|| Error::Config(format!("unknown cache driver {:?}", config.driver)))?;
        log::debug!("creating {} cache backend", config.driver);
        constructor(config)
    }
}

fn build_memory(_: &CacheConfig) -> Result<Box<dyn Backend>, Error> {
    Ok(Box::new(MemoryBackend::new()))
}

fn build_file(config: &CacheConfig) -> Result<Box<dyn Backend>, Error> {
    let dir = config
        .cache_dir
        .as_ref()
        .ok_or_else(|| Error::Config("the file driver requires `cache_dir`".to_owned()))?;
    let backend = FileBackend::open(dir, config.compression)
        .map_err(|err| Error::BackendUnavailable(format!("{}: {err}", dir.display())))?;
    Ok(Box::new(backend))
}

fn build_sqlite(config: &CacheConfig) -> Result<Box<dyn Backend>, Error> {
    let database = config
        .database
        .as_ref()
        .ok_or_else(|| Error::Config("the sqlite driver requires `database`".to_owned()))?;
    let mut backend = SqliteBackend::open(database)
        .map_err(|err| Error::BackendUnavailable(format!("{}: {err}", database.display())))?;
    if let Some(timeout) = config.timeout() {
        backend.set_busy_timeout(timeout)?;
    }
    Ok(Box::new(backend))
}

fn build_memcache(config: &CacheConfig) -> Result<Box<dyn Backend>, Error> {
    if config.servers.is_empty() {
        return Err(Error::Config(
            "no memcache servers defined in configuration".to_owned(),
        ));
    }
    let servers = config
        .servers
        .iter()
        .map(|server| format!("memcache://{}:{}", server.host, server.port))
        .collect();
    let backend = MemcacheBackend::connect(
        servers,
        config.namespace.clone(),
        config.compression,
        config.timeout(),
    )
    .map_err(|err| Error::BackendUnavailable(err.to_string()))?;
    Ok(Box::new(backend))
}

fn build_redis(config: &CacheConfig) -> Result<Box<dyn Backend>, Error> {
    let url = match config.servers.as_slice() {
        [] => "redis://localhost:6379".to_owned(),
        [server] => format!("redis://{}:{}", server.host, server.port),
        _ => {
            return Err(Error::Config(
                "the redis driver supports a single server".to_owned(),
            ))
        }
    };
    let backend = RedisBackend::connect(&url, config.namespace.clone(), config.timeout())
        .map_err(|err| Error::BackendUnavailable(format!("{url}: {err}")))?;
    Ok(Box::new(backend))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let config: CacheConfig = serde_json::from_str(r#"{"driver": "sqlite"}"#).unwrap();
        assert_eq!(config, CacheConfig::new("sqlite"));
        assert_eq!(config.default_expire, DEFAULT_EXPIRE);
        assert_eq!(config.timeout(), None);
    }

    #[test]
    fn missing_driver_is_rejected() {
        assert!(serde_json::from_str::<CacheConfig>(r#"{"notdriver": "x"}"#).is_err());
    }

    #[test]
    fn drivers_require_their_options() {
        let registry = Registry::default();
        for driver in ["file", "sqlite", "memcache"] {
            assert!(matches!(
                registry.build(&CacheConfig::new(driver)),
                Err(Error::Config(_))
            ));
        }
    }

    #[test]
    fn default_registry_knows_all_drivers() {
        let mut drivers: Vec<_> = Registry::default().drivers().map(str::to_owned).collect();
        drivers.sort();
        assert_eq!(drivers, ["file", "memcache", "memory", "redis", "sqlite"]);
        assert_eq!(Registry::empty().drivers().count(), 0);
    }
}
