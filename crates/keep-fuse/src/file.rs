use std::sync::Arc;

use bytes::{Bytes, BytesMut};
use serde_json::Value;

use crate::keep::{KeepClient, KeepError};
use crate::manifest::Segment;

/// A manifest file: an ordered list of block segments fetched on demand.
#[derive(Clone)]
pub struct StreamFile {
    segments: Arc<[Segment]>,
    size: u64,
    keep: Arc<dyn KeepClient>,
}

impl StreamFile {
    pub fn new(segments: Vec<Segment>, keep: Arc<dyn KeepClient>) -> Self {
        let size = segments.iter().map(|s| s.length).sum();
        Self {
            segments: segments.into(),
            size,
            keep,
        }
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    /// Read up to `length` bytes at `offset`, touching only the blocks that
    /// overlap the range.
    pub fn readfrom(&self, offset: u64, length: u64) -> Result<Bytes, KeepError> {
        if offset >= self.size || length == 0 {
            return Ok(Bytes::new());
        }
        let end = offset.saturating_add(length).min(self.size);
        let mut out = BytesMut::with_capacity((end - offset) as usize);

        let mut seg_start = 0u64;
        for seg in self.segments.iter() {
            let seg_end = seg_start + seg.length;
            if seg_start >= end {
                break;
            }
            if seg_end > offset {
                let from = offset.max(seg_start) - seg_start;
                let to = end.min(seg_end) - seg_start;
                let chunk = self
                    .keep
                    .get_range(&seg.locator, seg.offset + from, to - from)?;
                if chunk.len() as u64 != to - from {
                    return Err(KeepError::transport(format!(
                        "short read from {}: wanted {} bytes, got {}",
                        seg.locator,
                        to - from,
                        chunk.len()
                    )));
                }
                out.extend_from_slice(&chunk);
            }
            seg_start = seg_end;
        }
        Ok(out.freeze())
    }
}

impl std::fmt::Debug for StreamFile {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamFile")
            .field("segments", &self.segments.len())
            .field("size", &self.size)
            .finish()
    }
}

/// A metadata object rendered as pretty-printed JSON.
#[derive(Debug, Clone)]
pub struct ObjectFile {
    uuid: String,
    contents: Bytes,
}

impl ObjectFile {
    pub fn from_item(uuid: impl Into<String>, item: &Value) -> Self {
        let mut contents = serde_json::to_vec_pretty(item).unwrap_or_default();
        contents.push(b'\n');
        Self {
            uuid: uuid.into(),
            contents: contents.into(),
        }
    }

    pub fn uuid(&self) -> &str {
        &self.uuid
    }

    pub fn size(&self) -> u64 {
        self.contents.len() as u64
    }

    pub fn readfrom(&self, offset: u64, length: u64) -> Bytes {
        let len = self.contents.len();
        let start = usize::try_from(offset).unwrap_or(usize::MAX).min(len);
        let end = start
            .saturating_add(usize::try_from(length).unwrap_or(usize::MAX))
            .min(len);
        self.contents.slice(start..end)
    }
}
