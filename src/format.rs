//! Formatters turn values into the opaque bytes a [`Backend`](crate::backend::Backend) stores and
//! back.

use std::fmt::Debug;

use serde::{de::DeserializeOwned, Serialize};

/// A formatter that can serialize data before storing it in a cache and deserialize it after
/// retrieving it from the cache.
pub trait Formatter: Debug {
    /// The error to return if serialization or deserialization fails.
    type Error: std::error::Error + Send + Sync + 'static;

    /// Serialize a `T` into bytes.
    fn serialize<T: Serialize>(&self, value: &T) -> Result<Vec<u8>, Self::Error>;
    /// Deserialize bytes produced by [`serialize`](Self::serialize) into a `T`.
    fn deserialize<T: DeserializeOwned>(&self, value: &[u8]) -> Result<T, Self::Error>;
}

/// A formatter using the [`postcard`] crate.
#[derive(Debug, Clone, Copy, Default)]
pub struct PostcardFormatter;

impl Formatter for PostcardFormatter {
    type Error = postcard::Error;

    fn serialize<T: Serialize>(&self, value: &T) -> Result<Vec<u8>, Self::Error> {
        postcard::to_stdvec(value)
    }

    fn deserialize<T: DeserializeOwned>(&self, value: &[u8]) -> Result<T, Self::Error> {
        postcard::from_bytes(value)
    }
}

/// A formatter using the [`serde_json`] crate.
///
/// Entries stay human readable in the backend, which helps when other applications share it.
#[cfg(feature = "serde_json")]
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonFormatter;

#[cfg(feature = "serde_json")]
impl Formatter for JsonFormatter {
    type Error = serde_json::Error;

    fn serialize<T: Serialize>(&self, value: &T) -> Result<Vec<u8>, Self::Error> {
        serde_json::to_vec(value)
    }

    fn deserialize<T: DeserializeOwned>(&self, value: &[u8]) -> Result<T, Self::Error> {
        serde_json::from_slice(value)
    }
}
