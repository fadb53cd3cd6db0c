//! Cache backend for [memcached](https://memcached.org/).

use std::{
    io::{Read, Write},
    time::{Duration, SystemTime, UNIX_EPOCH},
};

use flate2::{read::ZlibDecoder, write::ZlibEncoder, Compression};
use memcache::Client;
use sha2::{Digest, Sha256};

use crate::{
    backend::{parse_counter, ArithmeticBackend, Backend, StoreError},
    expiry::{Expiry, ExpiryPolicy, MEMCACHE_CEILING},
};

/// Longest key memcached accepts.
const MAX_KEY_LENGTH: usize = 250;

const RAW: u8 = 0;
const ZLIB: u8 = 1;

/// Cache backend for memcached.
///
/// memcached has no notion of namespaces, so every key is prefixed with the namespace and a
/// generation number. [`delete_all`](Backend::delete_all) bumps the generation, which makes all
/// entries of the namespace unreachable without touching anything else on the servers; memcached
/// evicts the orphaned entries on its own.
pub struct MemcacheBackend {
    client: Client,
    namespace: String,
    compression: bool,
}

impl std::fmt::Debug for MemcacheBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemcacheBackend")
            .field("namespace", &self.namespace)
            .field("compression", &self.compression)
            .finish_non_exhaustive()
    }
}

impl MemcacheBackend {
    /// Create a new [`MemcacheBackend`] from an existing client.
    pub fn new(client: Client, namespace: String, compression: bool) -> Self {
        Self {
            client,
            namespace,
            compression,
        }
    }

    /// Connect to the given servers (`memcache://host:port` urls).
    pub fn connect(
        servers: Vec<String>,
        namespace: String,
        compression: bool,
        timeout: Option<Duration>,
    ) -> Result<Self, StoreError> {
        let client = Client::connect(servers)?;
        if timeout.is_some() {
            client.set_read_timeout(timeout)?;
            client.set_write_timeout(timeout)?;
        }
        // fail now rather than on the first cache operation
        client.version()?;
        Ok(Self::new(client, namespace, compression))
    }

    fn generation_key(&self) -> String {
        format!("{}:generation", self.namespace)
    }

    fn generation(&self) -> Result<u64, StoreError> {
        let key = self.generation_key();
        if let Some(raw) = self.client.get::<String>(&key)? {
            return Ok(parse_counter(raw.as_bytes())? as u64);
        }
        // the key may have been evicted after a `delete_all`, so never restart at a used value
        let seed = fresh_generation();
        // `add` keeps whatever another client may have stored in the meantime
        if self.client.add(&key, seed.to_string().as_str(), 0).is_ok() {
            return Ok(seed);
        }
        Ok(self
            .client
            .get::<String>(&key)?
            .map(|raw| parse_counter(raw.as_bytes()))
            .transpose()?
            .map_or(seed, |generation| generation as u64))
    }

    fn key(&self, key: &str) -> Result<String, StoreError> {
        let generation = self.generation()?;
        let prefixed = format!("{}:{generation}:{key}", self.namespace);
        if prefixed.len() <= MAX_KEY_LENGTH {
            return Ok(prefixed);
        }
        let digest = Sha256::new().chain_update(key.as_bytes()).finalize();
        Ok(format!("{}:{generation}:{digest:x}", self.namespace))
    }

    fn encode(&self, value: &[u8]) -> Result<Vec<u8>, StoreError> {
        if !self.compression {
            let mut encoded = Vec::with_capacity(value.len() + 1);
            encoded.push(RAW);
            encoded.extend_from_slice(value);
            return Ok(encoded);
        }
        let mut encoder = ZlibEncoder::new(vec![ZLIB], Compression::default());
        encoder.write_all(value)?;
        Ok(encoder.finish()?)
    }

    fn decode(raw: Vec<u8>) -> Result<Option<Vec<u8>>, StoreError> {
        match raw.split_first() {
            Some((&RAW, value)) => Ok(Some(value.to_vec())),
            Some((&ZLIB, compressed)) => {
                let mut value = Vec::new();
                ZlibDecoder::new(compressed).read_to_end(&mut value)?;
                Ok(Some(value))
            }
            _ => {
                log::warn!("ignoring memcache entry in unknown format");
                Ok(None)
            }
        }
    }
}

/// Generation for a namespace without one: the current time in microseconds, which is ahead of
/// any generation handed out before unless `delete_all` ran a million times per second.
fn fresh_generation() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_micros() as u64)
        .unwrap_or(1)
}

/// memcached reads expirations beyond 30 days as absolute unix timestamps, which is what
/// [`Expiry::At`] holds.
fn expiration(expiry: Expiry) -> u32 {
    match expiry {
        Expiry::Never => 0,
        Expiry::At(ts) => ts.clamp(MEMCACHE_CEILING + 1, u32::MAX as i64) as u32,
    }
}

impl Backend for MemcacheBackend {
    fn get(&mut self, key: &str) -> Result<Option<Vec<u8>>, StoreError> {
        match self.client.get::<Vec<u8>>(&self.key(key)?)? {
            Some(raw) => Self::decode(raw),
            None => Ok(None),
        }
    }

    fn set(&mut self, key: &str, value: &[u8], expiry: Expiry) -> Result<bool, StoreError> {
        let key = self.key(key)?;
        if expiry.is_expired() {
            self.client.delete(&key)?;
            return Ok(true);
        }
        let encoded = self.encode(value)?;
        self.client.set(&key, encoded.as_slice(), expiration(expiry))?;
        Ok(true)
    }

    fn delete(&mut self, key: &str) -> Result<bool, StoreError> {
        Ok(self.client.delete(&self.key(key)?)?)
    }

    fn delete_all(&mut self) -> Result<bool, StoreError> {
        // make sure the generation exists before bumping it
        self.generation()?;
        self.client.increment(&self.generation_key(), 1)?;
        Ok(true)
    }

    fn expiry_policy(&self) -> ExpiryPolicy {
        ExpiryPolicy::with_ceiling(MEMCACHE_CEILING)
    }

    fn arithmetic(&mut self) -> Option<&mut dyn ArithmeticBackend> {
        Some(self)
    }
}

/// memcached counters are unsigned; decrementing stops at zero.
impl ArithmeticBackend for MemcacheBackend {
    fn set_counter(&mut self, key: &str, value: i64, expiry: Expiry) -> Result<(), StoreError> {
        if value < 0 {
            return Err(StoreError::Overflow);
        }
        let key = self.key(key)?;
        self.client
            .set(&key, value.to_string().as_str(), expiration(expiry))?;
        Ok(())
    }

    fn get_counter(&mut self, key: &str) -> Result<Option<i64>, StoreError> {
        self.client
            .get::<String>(&self.key(key)?)?
            .map(|raw| parse_counter(raw.as_bytes()))
            .transpose()
    }

    fn increment(&mut self, key: &str, step: i64) -> Result<Option<i64>, StoreError> {
        let key = self.key(key)?;
        if self.client.get::<String>(&key)?.is_none() {
            return Ok(None);
        }
        let value = if step >= 0 {
            self.client.increment(&key, step as u64)?
        } else {
            self.client.decrement(&key, step.unsigned_abs())?
        };
        i64::try_from(value)
            .map(Some)
            .map_err(|_| StoreError::Overflow)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn expirations() {
        assert_eq!(expiration(Expiry::Never), 0);
        assert_eq!(expiration(Expiry::At(1_700_000_000)), 1_700_000_000);
        // tiny timestamps would be read as relative lifetimes
        assert_eq!(expiration(Expiry::At(5)), (MEMCACHE_CEILING + 1) as u32);
    }

    #[test]
    fn fresh_generations_do_not_restart() {
        let first = fresh_generation();
        // far beyond the generations a namespace reaches by counting up from an earlier seed
        assert!(first > 1_000_000_000_000_000);
        assert!(fresh_generation() >= first);
    }

    #[test]
    fn decode_rejects_unknown_format() {
        assert_eq!(MemcacheBackend::decode(vec![RAW, 1, 2]).unwrap(), Some(vec![1, 2]));
        assert_eq!(MemcacheBackend::decode(vec![7, 1, 2]).unwrap(), None);
        assert_eq!(MemcacheBackend::decode(Vec::new()).unwrap(), None);
    }
}
