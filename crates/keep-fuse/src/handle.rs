use std::collections::HashMap;

use fuser::FileAttr;

use crate::error::FsError;
use crate::node::FileNode;

/// One row of an opendir snapshot.
#[derive(Debug, Clone)]
pub struct ListingEntry {
    pub name: String,
    pub attr: FileAttr,
}

/// What an open handle is bound to.
#[derive(Debug, Clone)]
pub enum FileHandle {
    /// An open regular file.
    File(FileNode),
    /// Directory entries captured at opendir, including `.` and `..`.
    Listing(Vec<ListingEntry>),
}

/// Open handles keyed by the number returned to the kernel.
#[derive(Debug)]
pub struct HandleTable {
    handles: HashMap<u64, FileHandle>,
    next_fh: u64,
}

impl Default for HandleTable {
    fn default() -> Self {
        Self::new()
    }
}

impl HandleTable {
    pub fn new() -> Self {
        Self {
            handles: HashMap::new(),
            next_fh: 1,
        }
    }

    /// Store `handle` under a fresh number. Numbers are never reused.
    pub fn alloc(&mut self, handle: FileHandle) -> u64 {
        let fh = self.next_fh;
        self.next_fh += 1;
        self.handles.insert(fh, handle);
        fh
    }

    pub fn get(&self, fh: u64) -> Result<&FileHandle, FsError> {
        self.handles.get(&fh).ok_or(FsError::BadHandle(fh))
    }

    pub fn remove(&mut self, fh: u64) -> Result<FileHandle, FsError> {
        self.handles.remove(&fh).ok_or(FsError::BadHandle(fh))
    }

    pub fn len(&self) -> usize {
        self.handles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handles.is_empty()
    }
}
