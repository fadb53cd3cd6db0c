//! Conversion of relative lifetimes into absolute expiry timestamps.
//!
//! Lifetimes are given in seconds. `None` means "use the default lifetime", `0` means "never
//! expires" on every backend of this crate and a negative lifetime yields an expiry in the past,
//! i.e. the entry is absent as soon as it is written.

use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

/// Maximum lifetime memcached accepts as a relative value (30 days).
pub const MEMCACHE_CEILING: i64 = 2_592_000;

/// Current unix time in seconds.
pub fn now() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or_default()
}

/// Absolute point in time at which an entry stops being valid.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Expiry {
    /// The entry is kept until it is deleted or evicted by the backend.
    Never,
    /// Unix timestamp in seconds.
    At(i64),
}

impl Expiry {
    /// Decode the `0 = never` timestamp convention used by the sqlite and file backends.
    pub fn from_timestamp(ts: i64) -> Self {
        match ts {
            0 => Self::Never,
            ts => Self::At(ts),
        }
    }

    /// Encode as a timestamp where `0` means never.
    ///
    /// An expiry of exactly the epoch is shifted by one second so it cannot be confused with
    /// [`Expiry::Never`].
    pub fn timestamp(self) -> i64 {
        match self {
            Self::Never => 0,
            Self::At(0) => -1,
            Self::At(ts) => ts,
        }
    }

    /// Whether the entry is expired at `now`.
    pub fn is_expired_at(self, now: i64) -> bool {
        matches!(self, Self::At(ts) if ts <= now)
    }

    /// Whether the entry is expired right now.
    pub fn is_expired(self) -> bool {
        self.is_expired_at(now())
    }

    /// Seconds left until expiry at `now`, `None` if the entry never expires.
    pub fn remaining_at(self, now: i64) -> Option<i64> {
        match self {
            Self::Never => None,
            Self::At(ts) => Some((ts - now).max(0)),
        }
    }
}

/// Per-backend lifetime rules.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ExpiryPolicy {
    /// Longest lifetime the backend accepts. Longer lifetimes are clamped.
    pub ceiling: Option<i64>,
}

impl ExpiryPolicy {
    /// Policy without a lifetime ceiling.
    pub const UNBOUNDED: Self = Self { ceiling: None };

    /// Policy clamping lifetimes to `ceiling` seconds.
    pub const fn with_ceiling(ceiling: i64) -> Self {
        Self {
            ceiling: Some(ceiling),
        }
    }

    /// Resolve a requested lifetime relative to the current time.
    pub fn resolve(&self, requested: Option<i64>, default_ttl: i64) -> Expiry {
        resolve_ttl(requested, default_ttl, self.ceiling, now())
    }
}

/// Resolve a requested lifetime into an absolute expiry.
///
/// #### Example
/// ```
/// # use tagcache::expiry::{resolve_ttl, Expiry};
/// let now = 1_000;
/// assert_eq!(resolve_ttl(None, 60, None, now), Expiry::At(1_060));
/// assert_eq!(resolve_ttl(Some(10), 60, None, now), Expiry::At(1_010));
/// assert_eq!(resolve_ttl(Some(0), 60, None, now), Expiry::Never);
/// assert_eq!(resolve_ttl(Some(500), 60, Some(100), now), Expiry::At(1_100));
/// ```
pub fn resolve_ttl(
    requested: Option<i64>,
    default_ttl: i64,
    ceiling: Option<i64>,
    now: i64,
) -> Expiry {
    let ttl = requested.unwrap_or(default_ttl);
    if ttl == 0 {
        return Expiry::Never;
    }
    let ttl = match ceiling {
        Some(ceiling) if ttl > ceiling => ceiling,
        _ => ttl,
    };
    Expiry::At(now.saturating_add(ttl))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_is_used_when_nothing_requested() {
        assert_eq!(resolve_ttl(None, 3600, None, 10), Expiry::At(3610));
        assert_eq!(resolve_ttl(None, 0, None, 10), Expiry::Never);
    }

    #[test]
    fn negative_lifetime_is_already_expired() {
        let expiry = resolve_ttl(Some(-5), 3600, None, 100);
        assert_eq!(expiry, Expiry::At(95));
        assert!(expiry.is_expired_at(100));
    }

    #[test]
    fn ceiling_clamps_long_lifetimes() {
        let now = 1_700_000_000;
        assert_eq!(
            resolve_ttl(Some(MEMCACHE_CEILING * 2), 0, Some(MEMCACHE_CEILING), now),
            Expiry::At(now + MEMCACHE_CEILING)
        );
        assert_eq!(
            resolve_ttl(Some(60), 0, Some(MEMCACHE_CEILING), now),
            Expiry::At(now + 60)
        );
        assert_eq!(resolve_ttl(Some(0), 0, Some(MEMCACHE_CEILING), now), Expiry::Never);
    }

    #[test]
    fn timestamp_encoding() {
        assert_eq!(Expiry::from_timestamp(0), Expiry::Never);
        assert_eq!(Expiry::from_timestamp(42), Expiry::At(42));
        assert_eq!(Expiry::Never.timestamp(), 0);
        assert_eq!(Expiry::At(0).timestamp(), -1);
        assert!(!Expiry::Never.is_expired_at(i64::MAX));
        assert_eq!(Expiry::At(10).remaining_at(4), Some(6));
        assert_eq!(Expiry::At(10).remaining_at(40), Some(0));
    }
}
