use std::collections::HashMap;
use std::time::{Duration, Instant};

use bytes::Bytes;

use crate::error::FsError;
use crate::file::{ObjectFile, StreamFile};

/// Default interval between refreshes for directories that poll.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(60);

/// How a directory learns that its entries are out of date.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Freshness {
    /// Only explicit invalidation (change notification or cascade).
    Push,
    /// Additionally considered stale once `interval` has passed since the
    /// last refresh.
    Poll { interval: Duration },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DirectoryKind {
    /// Static children, never refreshed.
    Plain,
    /// One collection's file tree, keyed by locator.
    Collection { locator: String },
    /// Collections materialized on first lookup by locator.
    Magic,
    /// One entry per distinct tag name.
    Tags,
    /// Collections carrying one tag.
    Tag { tag: String },
    /// One entry per visible group.
    Groups,
    /// Contents of one group.
    Group { uuid: String },
}

impl DirectoryKind {
    /// Kinds whose invalidation is passed on to their child directories.
    pub fn cascades(&self) -> bool {
        matches!(
            self,
            DirectoryKind::Tags | DirectoryKind::Groups | DirectoryKind::Group { .. }
        )
    }

    /// Kinds whose content can never change once loaded.
    pub fn immutable(&self) -> bool {
        matches!(
            self,
            DirectoryKind::Plain | DirectoryKind::Collection { .. }
        )
    }
}

#[derive(Debug, Clone)]
pub struct DirectoryNode {
    pub inode: u64,
    pub parent_inode: u64,
    pub kind: DirectoryKind,
    pub(crate) entries: HashMap<String, u64>,
    stale: bool,
    freshness: Freshness,
    last_update: Instant,
}

impl DirectoryNode {
    /// A new directory. Everything except `Plain` starts stale.
    pub fn new(parent_inode: u64, kind: DirectoryKind, freshness: Freshness) -> Self {
        Self {
            inode: 0,
            parent_inode,
            stale: kind != DirectoryKind::Plain,
            kind,
            entries: HashMap::new(),
            freshness,
            last_update: Instant::now(),
        }
    }

    pub fn plain(parent_inode: u64) -> Self {
        Self::new(parent_inode, DirectoryKind::Plain, Freshness::Push)
    }

    pub fn freshness(&self) -> Freshness {
        self.freshness
    }

    pub(crate) fn set_freshness(&mut self, freshness: Freshness) {
        self.freshness = freshness;
    }

    pub fn is_stale(&self, now: Instant) -> bool {
        if self.stale {
            return true;
        }
        match self.freshness {
            Freshness::Push => false,
            Freshness::Poll { interval } => now >= self.last_update + interval,
        }
    }

    pub fn mark_fresh(&mut self) {
        self.stale = false;
        self.last_update = Instant::now();
    }

    /// Mark stale. Immutable kinds that have loaded once ignore this.
    pub fn invalidate(&mut self) {
        if !self.kind.immutable() {
            self.stale = true;
        }
    }

    /// Raw entries, without any freshness check.
    pub fn cached_entries(&self) -> &HashMap<String, u64> {
        &self.entries
    }

    pub fn remote_id(&self) -> Option<&str> {
        match &self.kind {
            DirectoryKind::Collection { locator } => Some(locator),
            DirectoryKind::Tag { tag } => Some(tag),
            DirectoryKind::Group { uuid } => Some(uuid),
            _ => None,
        }
    }
}

#[derive(Debug, Clone)]
pub enum FileKind {
    Stream(StreamFile),
    Object(ObjectFile),
}

#[derive(Debug, Clone)]
pub struct FileNode {
    pub inode: u64,
    pub parent_inode: u64,
    pub kind: FileKind,
}

impl FileNode {
    pub fn new(parent_inode: u64, kind: FileKind) -> Self {
        Self {
            inode: 0,
            parent_inode,
            kind,
        }
    }

    pub fn size(&self) -> u64 {
        match &self.kind {
            FileKind::Stream(f) => f.size(),
            FileKind::Object(f) => f.size(),
        }
    }

    pub fn readfrom(&self, offset: u64, length: u64) -> Result<Bytes, FsError> {
        match &self.kind {
            FileKind::Stream(f) => Ok(f.readfrom(offset, length)?),
            FileKind::Object(f) => Ok(f.readfrom(offset, length)),
        }
    }

    pub fn remote_id(&self) -> Option<&str> {
        match &self.kind {
            FileKind::Object(f) => Some(f.uuid()),
            FileKind::Stream(_) => None,
        }
    }
}

/// Anything that can sit in the inode table.
#[derive(Debug, Clone)]
pub enum Node {
    File(FileNode),
    Directory(DirectoryNode),
}

impl Node {
    pub fn inode(&self) -> u64 {
        match self {
            Node::File(f) => f.inode,
            Node::Directory(d) => d.inode,
        }
    }

    pub(crate) fn set_inode(&mut self, ino: u64) {
        match self {
            Node::File(f) => f.inode = ino,
            Node::Directory(d) => d.inode = ino,
        }
    }

    pub fn parent_inode(&self) -> u64 {
        match self {
            Node::File(f) => f.parent_inode,
            Node::Directory(d) => d.parent_inode,
        }
    }

    /// Byte size; always 0 for directories.
    pub fn size(&self) -> u64 {
        match self {
            Node::File(f) => f.size(),
            Node::Directory(_) => 0,
        }
    }

    pub fn is_dir(&self) -> bool {
        matches!(self, Node::Directory(_))
    }

    /// Remote identifier used together with the name when deciding whether a
    /// child survives a refresh.
    pub fn remote_id(&self) -> Option<&str> {
        match self {
            Node::File(f) => f.remote_id(),
            Node::Directory(d) => d.remote_id(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_plain_starts_fresh_others_stale() {
        let now = Instant::now();
        assert!(!DirectoryNode::plain(1).is_stale(now));
        assert!(DirectoryNode::new(1, DirectoryKind::Tags, Freshness::Push).is_stale(now));
    }

    #[test]
    fn test_poll_goes_stale_after_interval() {
        let mut dir = DirectoryNode::new(
            1,
            DirectoryKind::Groups,
            Freshness::Poll {
                interval: Duration::from_secs(60),
            },
        );
        dir.mark_fresh();
        let now = Instant::now();
        assert!(!dir.is_stale(now));
        assert!(dir.is_stale(now + Duration::from_secs(61)));
    }

    #[test]
    fn test_push_stays_fresh_until_invalidated() {
        let mut dir = DirectoryNode::new(1, DirectoryKind::Tags, Freshness::Push);
        dir.mark_fresh();
        assert!(!dir.is_stale(Instant::now() + Duration::from_secs(3600)));
        dir.invalidate();
        assert!(dir.is_stale(Instant::now()));
    }

    #[test]
    fn test_loaded_collection_ignores_invalidate() {
        let mut dir = DirectoryNode::new(
            1,
            DirectoryKind::Collection {
                locator: "d41d8cd98f00b204e9800998ecf8427e+0".into(),
            },
            Freshness::Push,
        );
        dir.mark_fresh();
        dir.invalidate();
        assert!(!dir.is_stale(Instant::now()));
    }

    #[test]
    fn test_node_remote_ids() {
        let group = Node::Directory(DirectoryNode::new(
            1,
            DirectoryKind::Group {
                uuid: "zzzzz-j7d0g-000000000000000".into(),
            },
            Freshness::Push,
        ));
        assert_eq!(group.remote_id(), Some("zzzzz-j7d0g-000000000000000"));
        assert_eq!(group.size(), 0);

        let object = Node::File(FileNode::new(
            1,
            FileKind::Object(ObjectFile::from_item("zzzzz-xxxxx-0", &json!({}))),
        ));
        assert_eq!(object.remote_id(), Some("zzzzz-xxxxx-0"));
        assert!(!object.is_dir());
    }
}
