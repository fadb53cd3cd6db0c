//! Cache backend on the local filesystem.

use std::{
    fs,
    io::{self, Read, Write},
    path::{Path, PathBuf},
};

use flate2::{read::ZlibDecoder, write::ZlibEncoder, Compression};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tempfile::NamedTempFile;

use crate::{
    backend::{Backend, StoreError},
    expiry::{self, Expiry},
};

const EXTENSION: &str = "cache";

#[derive(Serialize, Deserialize)]
struct FileEntry {
    expiration: i64,
    compressed: bool,
    payload: Vec<u8>,
}

/// Cache backend storing every entry in its own file inside a cache directory.
///
/// File names are the SHA-256 of the key, so any key maps to a valid file name. Only files with
/// the backend's own extension are ever removed by [`delete_all`](Backend::delete_all).
#[derive(Debug)]
pub struct FileBackend {
    dir: PathBuf,
    compression: bool,
}

impl FileBackend {
    /// Create a new [`FileBackend`], creating `dir` if it does not exist yet.
    pub fn open(dir: impl Into<PathBuf>, compression: bool) -> io::Result<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;
        if fs::metadata(&dir)?.permissions().readonly() {
            return Err(io::Error::new(
                io::ErrorKind::PermissionDenied,
                format!("cache directory {} is not writable", dir.display()),
            ));
        }
        Ok(Self { dir, compression })
    }

    /// The cache directory.
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path(&self, key: &str) -> PathBuf {
        let digest = Sha256::new().chain_update(key.as_bytes()).finalize();
        self.dir.join(format!("{digest:x}.{EXTENSION}"))
    }

    fn read(&self, path: &Path) -> Result<Option<FileEntry>, StoreError> {
        match fs::read(path) {
            Ok(raw) => Ok(Some(postcard::from_bytes(&raw)?)),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(err) => Err(err.into()),
        }
    }

    fn cache_files(&self) -> io::Result<impl Iterator<Item = PathBuf>> {
        Ok(fs::read_dir(&self.dir)?
            .filter_map(Result::ok)
            .map(|entry| entry.path())
            .filter(|path| {
                path.is_file() && path.extension().map_or(false, |ext| ext == EXTENSION)
            }))
    }
}

impl Backend for FileBackend {
    fn get(&mut self, key: &str) -> Result<Option<Vec<u8>>, StoreError> {
        let path = self.path(key);
        let Some(entry) = self.read(&path)? else {
            return Ok(None);
        };
        if Expiry::from_timestamp(entry.expiration).is_expired() {
            remove(&path)?;
            return Ok(None);
        }
        if !entry.compressed {
            return Ok(Some(entry.payload));
        }
        let mut payload = Vec::new();
        ZlibDecoder::new(entry.payload.as_slice()).read_to_end(&mut payload)?;
        Ok(Some(payload))
    }

    fn set(&mut self, key: &str, value: &[u8], expiry: Expiry) -> Result<bool, StoreError> {
        let payload = if self.compression {
            let mut encoder = ZlibEncoder::new(Vec::new(), Compression::default());
            encoder.write_all(value)?;
            encoder.finish()?
        } else {
            value.to_vec()
        };
        let raw = postcard::to_stdvec(&FileEntry {
            expiration: expiry.timestamp(),
            compressed: self.compression,
            payload,
        })?;

        // write to a uniquely named sibling first so readers never observe a partial entry
        let mut tmp = NamedTempFile::new_in(&self.dir)?;
        tmp.write_all(&raw)?;
        tmp.persist(self.path(key)).map_err(|err| err.error)?;
        Ok(true)
    }

    fn delete(&mut self, key: &str) -> Result<bool, StoreError> {
        Ok(remove(&self.path(key))?)
    }

    fn delete_all(&mut self) -> Result<bool, StoreError> {
        let mut ok = true;
        for path in self.cache_files()? {
            if let Err(err) = fs::remove_file(&path) {
                log::warn!("failed to remove cache file {}: {err}", path.display());
                ok = false;
            }
        }
        Ok(ok)
    }

    fn purge_expired(&mut self) -> Result<usize, StoreError> {
        let now = expiry::now();
        let mut purged = 0;
        for path in self.cache_files()? {
            let expired = match self.read(&path) {
                Ok(Some(entry)) => Expiry::from_timestamp(entry.expiration).is_expired_at(now),
                Ok(None) => false,
                // unreadable entries would never be served anyway
                Err(StoreError::Postcard(_)) => true,
                Err(err) => return Err(err),
            };
            if expired && remove(&path)? {
                purged += 1;
            }
        }
        Ok(purged)
    }
}

fn remove(path: &Path) -> io::Result<bool> {
    match fs::remove_file(path) {
        Ok(()) => Ok(true),
        Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(false),
        Err(err) => Err(err),
    }
}
