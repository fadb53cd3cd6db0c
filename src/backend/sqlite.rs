//! Cache backend for [SQLite](https://sqlite.org/).
//!
//! Entries live in a single `caches` table:
//!
//! | column       | content                                              |
//! |--------------|------------------------------------------------------|
//! | `id`         | sanitized key (primary key)                          |
//! | `cache`      | serialized value                                     |
//! | `expiration` | absolute unix timestamp, `0` = never                 |
//! | `tags`       | `<tag1>,<tag2>` or `NULL`, matched with `LIKE`       |
//!
//! Only this table is ever touched, so the database may be shared with other data.

use std::{path::Path, time::Duration};

use rusqlite::{params, Connection, OptionalExtension};

use crate::{
    backend::{Backend, StoreError, TaggedBackend},
    expiry::{self, Expiry},
};

const SCHEMA: &str = "CREATE TABLE IF NOT EXISTS caches(
    id VARCHAR(127) PRIMARY KEY,
    tags VARCHAR(255),
    expiration INTEGER NOT NULL DEFAULT 0,
    cache BLOB
)";

/// Cache backend for SQLite with native tag support.
#[derive(Debug)]
pub struct SqliteBackend {
    conn: Connection,
}

impl SqliteBackend {
    /// Open (or create) the database at `path`. `":memory:"` opens a private in-memory database.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let path = path.as_ref();
        let conn = if path == Path::new(":memory:") {
            Connection::open_in_memory()?
        } else {
            Connection::open(path)?
        };
        Self::new(conn)
    }

    /// Wrap an existing connection, creating the `caches` table if needed.
    pub fn new(conn: Connection) -> Result<Self, StoreError> {
        conn.execute(SCHEMA, [])?;
        Ok(Self { conn })
    }

    /// Set how long to wait for a locked database before failing.
    pub fn set_busy_timeout(&mut self, timeout: Duration) -> Result<(), StoreError> {
        Ok(self.conn.busy_timeout(timeout)?)
    }

    fn write(
        &mut self,
        key: &str,
        value: &[u8],
        expiry: Expiry,
        tags: Option<String>,
    ) -> Result<bool, StoreError> {
        let changed = self.conn.execute(
            "INSERT OR REPLACE INTO caches (id, cache, expiration, tags) VALUES (?1, ?2, ?3, ?4)",
            params![key, value, expiry.timestamp(), tags],
        )?;
        Ok(changed > 0)
    }
}

impl Backend for SqliteBackend {
    fn get(&mut self, key: &str) -> Result<Option<Vec<u8>>, StoreError> {
        let row: Option<(i64, Vec<u8>)> = self
            .conn
            .query_row(
                "SELECT expiration, cache FROM caches WHERE id = ?1 LIMIT 1",
                params![key],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()?;
        match row {
            Some((expiration, _)) if Expiry::from_timestamp(expiration).is_expired() => {
                self.delete(key)?;
                Ok(None)
            }
            Some((_, cache)) => Ok(Some(cache)),
            None => Ok(None),
        }
    }

    fn set(&mut self, key: &str, value: &[u8], expiry: Expiry) -> Result<bool, StoreError> {
        self.write(key, value, expiry, None)
    }

    fn delete(&mut self, key: &str) -> Result<bool, StoreError> {
        let changed = self
            .conn
            .execute("DELETE FROM caches WHERE id = ?1", params![key])?;
        Ok(changed > 0)
    }

    fn delete_all(&mut self) -> Result<bool, StoreError> {
        self.conn.execute("DELETE FROM caches", [])?;
        Ok(true)
    }

    fn purge_expired(&mut self) -> Result<usize, StoreError> {
        Ok(self.conn.execute(
            "DELETE FROM caches WHERE expiration != 0 AND expiration <= ?1",
            params![expiry::now()],
        )?)
    }

    fn tagged(&mut self) -> Option<&mut dyn TaggedBackend> {
        Some(self)
    }
}

impl TaggedBackend for SqliteBackend {
    fn set_tagged(
        &mut self,
        key: &str,
        value: &[u8],
        expiry: Expiry,
        tags: &[&str],
    ) -> Result<bool, StoreError> {
        self.write(key, value, expiry, encode_tags(tags)?)
    }

    fn delete_tag(&mut self, tag: &str) -> Result<bool, StoreError> {
        let changed = self.conn.execute(
            "DELETE FROM caches WHERE tags LIKE ?1 ESCAPE '\\' AND instr(tags, ?2) > 0",
            params![tag_pattern(tag)?, format!("<{tag}>")],
        )?;
        Ok(changed > 0)
    }

    fn find_tag(&mut self, tag: &str) -> Result<Vec<(String, Vec<u8>)>, StoreError> {
        let mut stmt = self.conn.prepare(
            "SELECT id, cache FROM caches WHERE tags LIKE ?1 ESCAPE '\\' \
             AND instr(tags, ?2) > 0 AND (expiration = 0 OR expiration > ?3) ORDER BY id",
        )?;
        let pattern = tag_pattern(tag)?;
        let rows = stmt.query_map(params![pattern, format!("<{tag}>"), expiry::now()], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, Vec<u8>>(1)?))
        })?;
        let found = rows.collect::<Result<Vec<_>, _>>()?;
        Ok(found)
    }
}

fn check_tag(tag: &str) -> Result<(), StoreError> {
    if tag.is_empty() || tag.contains(['<', '>']) {
        return Err(StoreError::InvalidTag(tag.to_owned()));
    }
    Ok(())
}

/// `["a", "b"]` becomes `<a>,<b>`, no tags become `NULL`.
fn encode_tags(tags: &[&str]) -> Result<Option<String>, StoreError> {
    if tags.is_empty() {
        return Ok(None);
    }
    let mut encoded = Vec::with_capacity(tags.len());
    for tag in tags {
        check_tag(tag)?;
        encoded.push(format!("<{tag}>"));
    }
    Ok(Some(encoded.join(",")))
}

fn tag_pattern(tag: &str) -> Result<String, StoreError> {
    check_tag(tag)?;
    let mut pattern = String::from("%<");
    for c in tag.chars() {
        if matches!(c, '%' | '_' | '\\') {
            pattern.push('\\');
        }
        pattern.push(c);
    }
    pattern.push_str(">%");
    Ok(pattern)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tags_are_wrapped_in_angle_brackets() {
        assert_eq!(encode_tags(&[]).unwrap(), None);
        assert_eq!(
            encode_tags(&["tagA", "tagB"]).unwrap().as_deref(),
            Some("<tagA>,<tagB>")
        );
        assert!(matches!(encode_tags(&["a>b"]), Err(StoreError::InvalidTag(_))));
    }

    #[test]
    fn like_wildcards_are_escaped() {
        assert_eq!(tag_pattern("users").unwrap(), "%<users>%");
        assert_eq!(tag_pattern("a_b%").unwrap(), "%<a\\_b\\%>%");
    }

    #[test]
    fn underscore_tag_does_not_match_other_tags() {
        let mut backend = SqliteBackend::open(":memory:").unwrap();
        backend.set_tagged("k1", b"1", Expiry::Never, &["a_b"]).unwrap();
        backend.set_tagged("k2", b"2", Expiry::Never, &["axb"]).unwrap();
        let found = backend.find_tag("a_b").unwrap();
        assert_eq!(found, vec![("k1".to_owned(), b"1".to_vec())]);
    }

    #[test]
    fn tags_are_case_sensitive() {
        let mut backend = SqliteBackend::open(":memory:").unwrap();
        backend.set_tagged("lower", b"1", Expiry::Never, &["admin"]).unwrap();
        backend.set_tagged("upper", b"2", Expiry::Never, &["Admin"]).unwrap();
        assert_eq!(
            backend.find_tag("Admin").unwrap(),
            vec![("upper".to_owned(), b"2".to_vec())]
        );
        assert!(backend.delete_tag("Admin").unwrap());
        assert_eq!(backend.get("lower").unwrap(), Some(b"1".to_vec()));
        assert_eq!(backend.get("upper").unwrap(), None);
        assert!(!backend.delete_tag("Admin").unwrap());
    }

    #[test]
    fn expired_rows_are_purged() {
        let mut backend = SqliteBackend::open(":memory:").unwrap();
        backend.set("old", b"1", Expiry::At(1)).unwrap();
        backend.set("new", b"2", Expiry::Never).unwrap();
        assert_eq!(backend.purge_expired().unwrap(), 1);
        assert_eq!(backend.get("new").unwrap(), Some(b"2".to_vec()));
    }
}
