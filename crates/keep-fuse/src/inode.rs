use std::collections::HashMap;
use std::time::UNIX_EPOCH;

use fuser::{FileAttr, FileType};

use crate::error::FsError;
use crate::node::{DirectoryNode, Node};

/// Inode of the mount root.
pub const ROOT_INO: u64 = 1;

/// Permission bits shared by every node. Directories add the execute bits.
pub const READ_ONLY_PERM: u16 = 0o444;
pub const DIR_EXEC_PERM: u16 = 0o111;

pub const BLOCK_SIZE: u32 = 1024;

/// Maps inode numbers to nodes.
///
/// The table owns every node for the lifetime of the mount. Numbers are
/// handed out sequentially from [`ROOT_INO`] and never reused; there is no
/// removal.
#[derive(Debug)]
pub struct InodeTable {
    entries: HashMap<u64, Node>,
    next_inode: u64,
}

impl Default for InodeTable {
    fn default() -> Self {
        Self::new()
    }
}

impl InodeTable {
    pub fn new() -> Self {
        Self {
            entries: HashMap::new(),
            next_inode: ROOT_INO,
        }
    }

    /// Register `node` under the next free inode number and return it.
    pub fn add(&mut self, mut node: Node) -> u64 {
        let ino = self.next_inode;
        self.next_inode += 1;
        node.set_inode(ino);
        self.entries.insert(ino, node);
        ino
    }

    pub fn get(&self, ino: u64) -> Result<&Node, FsError> {
        self.entries
            .get(&ino)
            .ok_or_else(|| FsError::not_found(format!("inode {ino}")))
    }

    pub fn get_mut(&mut self, ino: u64) -> Result<&mut Node, FsError> {
        self.entries
            .get_mut(&ino)
            .ok_or_else(|| FsError::not_found(format!("inode {ino}")))
    }

    pub fn contains_inode(&self, ino: u64) -> bool {
        self.entries.contains_key(&ino)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Every registered node, in no particular order.
    pub fn iter(&self) -> impl Iterator<Item = (u64, &Node)> {
        self.entries.iter().map(|(ino, node)| (*ino, node))
    }

    pub fn dir(&self, ino: u64) -> Result<&DirectoryNode, FsError> {
        match self.get(ino)? {
            Node::Directory(d) => Ok(d),
            Node::File(_) => Err(FsError::NotADirectory(ino)),
        }
    }

    pub fn dir_mut(&mut self, ino: u64) -> Result<&mut DirectoryNode, FsError> {
        match self.get_mut(ino)? {
            Node::Directory(d) => Ok(d),
            Node::File(_) => Err(FsError::NotADirectory(ino)),
        }
    }
}

/// Protocol attributes for a node. Permissions are uniform read-only and
/// timestamps are not tracked.
pub fn node_attr(ino: u64, node: &Node, uid: u32, gid: u32) -> FileAttr {
    let size = node.size();
    let (kind, perm) = if node.is_dir() {
        (FileType::Directory, READ_ONLY_PERM | DIR_EXEC_PERM)
    } else {
        (FileType::RegularFile, READ_ONLY_PERM)
    };
    FileAttr {
        ino,
        size,
        blocks: size.div_ceil(512),
        atime: UNIX_EPOCH,
        mtime: UNIX_EPOCH,
        ctime: UNIX_EPOCH,
        crtime: UNIX_EPOCH,
        kind,
        perm,
        nlink: 1,
        uid,
        gid,
        rdev: 0,
        blksize: BLOCK_SIZE,
        flags: 0,
    }
}
