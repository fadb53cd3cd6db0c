//! Cache backend for [Redis](https://redis.io/).
//!
//! Values live under `{namespace}:cache:{key}`. Every tag is a sorted set under
//! `{namespace}:tag:{tag}` whose members are keys scored by their expiry timestamp, so expired
//! members can be dropped with a single range deletion.

use std::time::Duration;

use redis::{Client, Commands, Connection, ConnectionLike};

use crate::{
    backend::{parse_counter, ArithmeticBackend, Backend, StoreError, TaggedBackend},
    expiry::{self, Expiry},
};

/// Cache backend for Redis with native tag support.
pub struct RedisBackend<C = Connection> {
    conn: C,
    namespace: String,
}

impl RedisBackend {
    /// Connect to the server at `url` (`redis://host:port/db`).
    pub fn connect(
        url: &str,
        namespace: String,
        timeout: Option<Duration>,
    ) -> Result<Self, StoreError> {
        let client = Client::open(url)?;
        let conn = match timeout {
            Some(timeout) => {
                let conn = client.get_connection_with_timeout(timeout)?;
                conn.set_read_timeout(Some(timeout))?;
                conn.set_write_timeout(Some(timeout))?;
                conn
            }
            None => client.get_connection()?,
        };
        Ok(Self::new(conn, namespace))
    }
}

impl<C> RedisBackend<C> {
    /// Create a new [`RedisBackend`] from an existing connection.
    pub fn new(conn: C, namespace: String) -> Self {
        Self { conn, namespace }
    }

    fn cache_key(&self, key: &str) -> String {
        format!("{}:cache:{}", self.namespace, key)
    }

    fn tag_key(&self, tag: &str) -> String {
        format!("{}:tag:{}", self.namespace, tag)
    }
}

impl<C> std::fmt::Debug for RedisBackend<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisBackend")
            .field("namespace", &self.namespace)
            .finish_non_exhaustive()
    }
}

impl<C: ConnectionLike> RedisBackend<C> {
    fn write(
        &mut self,
        key: &str,
        value: &[u8],
        expiry: Expiry,
        tags: &[&str],
    ) -> Result<bool, StoreError> {
        let now = expiry::now();
        let cache_key = self.cache_key(key);
        let mut pipe = redis::pipe();
        match expiry.remaining_at(now) {
            Some(0) => {
                pipe.del(&cache_key);
                pipe.query::<()>(&mut self.conn)?;
                return Ok(true);
            }
            Some(ttl) => pipe.set_ex(&cache_key, value, ttl as usize),
            None => pipe.set(&cache_key, value),
        };
        for tag in tags {
            let k = self.tag_key(tag);
            pipe.zrembyscore(&k, "-inf", now);
            match expiry {
                Expiry::Never => pipe.zadd(&k, key, "+inf"),
                Expiry::At(ts) => pipe.zadd(&k, key, ts),
            };
        }
        pipe.query::<()>(&mut self.conn)?;
        Ok(true)
    }
}

impl<C: ConnectionLike> Backend for RedisBackend<C> {
    fn get(&mut self, key: &str) -> Result<Option<Vec<u8>>, StoreError> {
        let key = self.cache_key(key);
        Ok(self.conn.get(key)?)
    }

    fn set(&mut self, key: &str, value: &[u8], expiry: Expiry) -> Result<bool, StoreError> {
        self.write(key, value, expiry, &[])
    }

    fn delete(&mut self, key: &str) -> Result<bool, StoreError> {
        let key = self.cache_key(key);
        let deleted: usize = self.conn.del(key)?;
        Ok(deleted > 0)
    }

    /// Removes the values and tags of this backend's namespace only.
    fn delete_all(&mut self) -> Result<bool, StoreError> {
        let keys: Vec<String> = self.conn.keys(format!("{}:*", self.namespace))?;
        if keys.is_empty() {
            return Ok(true);
        }
        let mut pipe = redis::pipe();
        for key in keys {
            pipe.del(key);
        }
        pipe.query::<()>(&mut self.conn)?;
        Ok(true)
    }

    fn tagged(&mut self) -> Option<&mut dyn TaggedBackend> {
        Some(self)
    }

    fn arithmetic(&mut self) -> Option<&mut dyn ArithmeticBackend> {
        Some(self)
    }
}

impl<C: ConnectionLike> TaggedBackend for RedisBackend<C> {
    fn set_tagged(
        &mut self,
        key: &str,
        value: &[u8],
        expiry: Expiry,
        tags: &[&str],
    ) -> Result<bool, StoreError> {
        self.write(key, value, expiry, tags)
    }

    fn delete_tag(&mut self, tag: &str) -> Result<bool, StoreError> {
        let k = self.tag_key(tag);
        let keys: Vec<String> = self.conn.zrange(&k, 0, -1)?;
        let mut pipe = redis::pipe();
        for key in &keys {
            pipe.del(self.cache_key(key));
        }
        pipe.del(k);
        pipe.query::<()>(&mut self.conn)?;
        Ok(!keys.is_empty())
    }

    fn find_tag(&mut self, tag: &str) -> Result<Vec<(String, Vec<u8>)>, StoreError> {
        let k = self.tag_key(tag);
        // scores can be stale after an untagged `set`, so MGET decides what is live
        let keys: Vec<String> = self.conn.zrange(&k, 0, -1)?;
        if keys.is_empty() {
            return Ok(Vec::new());
        }
        let values: Vec<Option<Vec<u8>>> = redis::cmd("MGET")
            .arg(keys.iter().map(|key| self.cache_key(key)).collect::<Vec<_>>())
            .query(&mut self.conn)?;
        Ok(keys
            .into_iter()
            .zip(values)
            .filter_map(|(key, value)| value.map(|value| (key, value)))
            .collect())
    }
}

impl<C: ConnectionLike> ArithmeticBackend for RedisBackend<C> {
    fn set_counter(&mut self, key: &str, value: i64, expiry: Expiry) -> Result<(), StoreError> {
        self.write(key, value.to_string().as_bytes(), expiry, &[])?;
        Ok(())
    }

    fn get_counter(&mut self, key: &str) -> Result<Option<i64>, StoreError> {
        let raw: Option<Vec<u8>> = self.conn.get(self.cache_key(key))?;
        raw.map(|raw| parse_counter(&raw)).transpose()
    }

    fn increment(&mut self, key: &str, step: i64) -> Result<Option<i64>, StoreError> {
        let key = self.cache_key(key);
        // INCRBY would create missing counters
        let exists: bool = self.conn.exists(&key)?;
        if !exists {
            return Ok(None);
        }
        Ok(Some(self.conn.incr(&key, step)?))
    }
}
