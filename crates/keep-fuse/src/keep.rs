use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use bytes::Bytes;
use parking_lot::RwLock;
use thiserror::Error;
use tracing::{debug, warn};

use crate::manifest::{Locator, Manifest, ManifestError};

pub type Result<T> = std::result::Result<T, KeepError>;

/// md5 of zero bytes; `<hash>+0` is readable from every store.
pub const EMPTY_BLOCK_HASH: &str = "d41d8cd98f00b204e9800998ecf8427e";

#[derive(Debug, Error)]
pub enum KeepError {
    #[error("block not found: {0}")]
    NotFound(String),
    #[error("transport error: {0}")]
    Transport(String),
    #[error("manifest error: {0}")]
    Manifest(#[from] ManifestError),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl KeepError {
    pub fn not_found(locator: impl Into<String>) -> Self {
        Self::NotFound(locator.into())
    }

    pub fn transport(message: impl Into<String>) -> Self {
        Self::Transport(message.into())
    }
}

/// Content-addressed block storage.
///
/// Only `get` is required. Clients that can fetch partial blocks should
/// override `get_range`.
pub trait KeepClient: Send + Sync {
    /// Fetch a whole block by locator.
    fn get(&self, locator: &str) -> Result<Bytes>;

    /// Fetch `length` bytes of a block starting at `offset`. Short reads past
    /// the end of the block are not an error.
    fn get_range(&self, locator: &str, offset: u64, length: u64) -> Result<Bytes> {
        let block = self.get(locator)?;
        let start = usize::try_from(offset).unwrap_or(usize::MAX).min(block.len());
        let len = usize::try_from(length).unwrap_or(usize::MAX);
        let end = start.saturating_add(len).min(block.len());
        Ok(block.slice(start..end))
    }

    /// Fetch a block and parse it as manifest text.
    fn resolve(&self, locator: &str) -> Result<Manifest> {
        let block = self.get(locator)?;
        let text = std::str::from_utf8(&block).map_err(|_| ManifestError::NotUtf8)?;
        Ok(Manifest::parse(text)?)
    }
}

/// In-memory block store keyed by `hash+size`.
///
/// Locator hints are ignored on both insert and lookup.
#[derive(Default)]
pub struct MemoryKeep {
    blocks: RwLock<HashMap<String, Bytes>>,
    fetches: AtomicUsize,
    offline: AtomicBool,
}

impl MemoryKeep {
    pub fn new() -> Self {
        Self::default()
    }

    /// Load every file in `dir` whose name parses as a locator.
    pub fn load_dir(dir: &Path) -> Result<Self> {
        let keep = Self::new();
        for entry in std::fs::read_dir(dir)? {
            let entry = entry?;
            if !entry.file_type()?.is_file() {
                continue;
            }
            let name = entry.file_name();
            let Some(locator) = name.to_str().and_then(|n| Locator::parse(n).ok()) else {
                warn!("skipping {:?}: file name is not a block locator", name);
                continue;
            };
            let data = std::fs::read(entry.path())?;
            keep.put(&locator.to_string(), data);
        }
        debug!("loaded {} blocks from {}", keep.len(), dir.display());
        Ok(keep)
    }

    pub fn put(&self, locator: &str, data: impl Into<Bytes>) {
        self.blocks.write().insert(block_key(locator), data.into());
    }

    pub fn remove(&self, locator: &str) -> Option<Bytes> {
        self.blocks.write().remove(&block_key(locator))
    }

    pub fn len(&self) -> usize {
        self.blocks.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.blocks.read().is_empty()
    }

    /// Number of `get` calls served so far, successful or not.
    pub fn fetch_count(&self) -> usize {
        self.fetches.load(Ordering::SeqCst)
    }

    /// While offline every fetch fails with a transport error.
    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }
}

impl KeepClient for MemoryKeep {
    fn get(&self, locator: &str) -> Result<Bytes> {
        self.fetches.fetch_add(1, Ordering::SeqCst);
        if self.offline.load(Ordering::SeqCst) {
            return Err(KeepError::transport("keep is offline"));
        }
        if is_empty_block(locator) {
            return Ok(Bytes::new());
        }
        self.blocks
            .read()
            .get(&block_key(locator))
            .cloned()
            .ok_or_else(|| KeepError::not_found(locator))
    }
}

fn is_empty_block(locator: &str) -> bool {
    Locator::parse(locator).is_ok_and(|loc| loc.hash() == EMPTY_BLOCK_HASH && loc.size() == 0)
}

fn block_key(locator: &str) -> String {
    match Locator::parse(locator) {
        Ok(loc) => loc.to_string(),
        Err(_) => locator.to_string(),
    }
}
