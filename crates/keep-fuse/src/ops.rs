//! The protocol handler.
//!
//! `Operations` owns the mount state behind one mutex and exposes each FUSE
//! request as a plain method returning `Result<_, FsError>`. The `fuser`
//! adapter in [`crate::fs`] only translates these into replies, so everything
//! here can be driven directly from tests without a kernel mount.

use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::{Arc, Weak};
use std::time::Duration;

use bytes::Bytes;
use fuser::FileAttr;
use parking_lot::{Condvar, Mutex, MutexGuard};
use tracing::{debug, error, info, warn};

use crate::api::{Filter, LINK_KIND};
use crate::directory::Backend;
use crate::error::FsError;
use crate::events::{Event, EventSource, Subscription};
use crate::handle::{FileHandle, HandleTable, ListingEntry};
use crate::inode::{InodeTable, ROOT_INO, node_attr};
use crate::node::{DEFAULT_POLL_INTERVAL, DirectoryKind, DirectoryNode, Freshness, Node};

/// How long the kernel may cache attributes.
pub const ATTR_TTL: Duration = Duration::from_secs(300);
/// How long the kernel may cache name lookups.
pub const ENTRY_TTL: Duration = Duration::from_secs(300);

/// Block size reported by `statfs`.
pub const STATFS_BLOCK_SIZE: u32 = 1024 * 1024;

#[derive(Debug, Clone)]
pub struct FsOptions {
    pub uid: u32,
    pub gid: u32,
    /// Refresh interval for directories whose change feed is unavailable.
    pub poll_interval: Duration,
}

impl Default for FsOptions {
    fn default() -> Self {
        Self {
            uid: 0,
            gid: 0,
            poll_interval: DEFAULT_POLL_INTERVAL,
        }
    }
}

/// What the root inode of a mount is.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Layout {
    /// A plain root holding `by_id`, `by_tag` and `groups`.
    Home,
    /// The root is this directory kind.
    Single(DirectoryKind),
}

/// Everything the mount lock guards.
pub struct MountState {
    pub inodes: InodeTable,
    pub handles: HandleTable,
    pub backend: Backend,
}

/// One `readdir` result.
#[derive(Debug, Clone)]
pub struct DirEntry {
    pub name: String,
    pub attr: FileAttr,
    /// Offset to pass back to continue after this entry.
    pub next_offset: i64,
}

/// Filesystem statistics. Every counter is zero.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StatFs {
    pub blocks: u64,
    pub bfree: u64,
    pub bavail: u64,
    pub files: u64,
    pub ffree: u64,
    pub bsize: u32,
    pub namelen: u32,
    pub frsize: u32,
}

pub struct Operations {
    state: Arc<Mutex<MountState>>,
    events: Arc<dyn EventSource>,
    subscriptions: Mutex<Vec<Subscription>>,
    ready: Mutex<bool>,
    ready_cond: Condvar,
    options: FsOptions,
}

impl Operations {
    /// A mount with the given root layout. Subscriptions for the root (and,
    /// for `Home`, its index directories) are set up here.
    pub fn new(
        backend: Backend,
        events: Arc<dyn EventSource>,
        layout: Layout,
        options: FsOptions,
    ) -> Self {
        let ops = Self {
            state: Arc::new(Mutex::new(MountState {
                inodes: InodeTable::new(),
                handles: HandleTable::new(),
                backend,
            })),
            events,
            subscriptions: Mutex::new(Vec::new()),
            ready: Mutex::new(false),
            ready_cond: Condvar::new(),
            options,
        };
        match layout {
            Layout::Home => {
                let root = ops.add_directory(ROOT_INO, DirectoryKind::Plain);
                for (name, kind) in [
                    ("by_id", DirectoryKind::Magic),
                    ("by_tag", DirectoryKind::Tags),
                    ("groups", DirectoryKind::Groups),
                ] {
                    // Only fails if `root` is missing, which it cannot be here.
                    if let Err(e) = ops.attach(root, name, kind) {
                        error!("failed to attach {name}: {e}");
                    }
                }
            }
            Layout::Single(kind) => {
                ops.add_directory(ROOT_INO, kind);
            }
        }
        ops
    }

    pub fn options(&self) -> &FsOptions {
        &self.options
    }

    /// Add a directory of `kind` under `parent` as `name`. Returns the new
    /// inode.
    fn attach(&self, parent: u64, name: &str, kind: DirectoryKind) -> Result<u64, FsError> {
        self.state.lock().inodes.dir(parent)?;
        let ino = self.add_directory(parent, kind);
        self.state
            .lock()
            .inodes
            .dir_mut(parent)?
            .entries
            .insert(name.to_string(), ino);
        Ok(ino)
    }

    /// Register a directory and choose its freshness: directories fed by the
    /// change feed subscribe, and fall back to polling if that fails.
    fn add_directory(&self, parent: u64, kind: DirectoryKind) -> u64 {
        let filters = match &kind {
            DirectoryKind::Tags => Some(vec![Filter::is_a("object_uuid", LINK_KIND)]),
            DirectoryKind::Groups => Some(Vec::new()),
            _ => None,
        };
        let ino = self.state.lock().inodes.add(Node::Directory(DirectoryNode::new(
            parent,
            kind,
            Freshness::Push,
        )));
        let Some(filters) = filters else {
            return ino;
        };

        let weak: Weak<Mutex<MountState>> = Arc::downgrade(&self.state);
        let callback = Box::new(move |event: &Event| {
            if let Some(state) = weak.upgrade() {
                debug!(
                    "{} {}: invalidating inode {ino}",
                    event.event_type, event.object_uuid
                );
                state.lock().inodes.invalidate(ino);
            }
        });
        match self.events.subscribe(filters, callback) {
            Ok(subscription) => self.subscriptions.lock().push(subscription),
            Err(e) => {
                warn!(
                    "inode {ino}: {e}; polling every {:?}",
                    self.options.poll_interval
                );
                if let Ok(dir) = self.state.lock().inodes.dir_mut(ino) {
                    dir.set_freshness(Freshness::Poll {
                        interval: self.options.poll_interval,
                    });
                }
            }
        }
        ino
    }

    /// Run `f` with the mount lock held.
    pub fn with_state<R>(&self, f: impl FnOnce(&mut MountState) -> R) -> R {
        f(&mut self.state.lock())
    }

    /// Mark the mount as ready and wake everyone in [`wait_ready`].
    ///
    /// [`wait_ready`]: Operations::wait_ready
    pub fn init(&self) {
        info!("keep-fuse initialized");
        *self.ready.lock() = true;
        self.ready_cond.notify_all();
    }

    /// Block until `init` has run or `timeout` passes. Returns whether the
    /// mount is ready.
    pub fn wait_ready(&self, timeout: Duration) -> bool {
        let mut ready = self.ready.lock();
        if !*ready {
            let _ = self
                .ready_cond
                .wait_while_for(&mut ready, |ready| !*ready, timeout);
        }
        *ready
    }

    fn attr(&self, inodes: &InodeTable, ino: u64) -> Result<FileAttr, FsError> {
        let node = inodes.get(ino)?;
        Ok(node_attr(ino, node, self.options.uid, self.options.gid))
    }

    pub fn lookup(&self, parent: u64, name: &str) -> Result<FileAttr, FsError> {
        debug!("lookup: parent={parent} name={name:?}");
        let mut guard = self.state.lock();
        let state = &mut *guard;
        let ino = match name {
            "." => parent,
            ".." => state.inodes.get(parent)?.parent_inode(),
            _ => state
                .inodes
                .child(&state.backend, parent, name)?
                .ok_or_else(|| FsError::not_found(name))?,
        };
        self.attr(&state.inodes, ino)
    }

    pub fn getattr(&self, ino: u64) -> Result<FileAttr, FsError> {
        debug!("getattr: ino={ino}");
        self.attr(&self.state.lock().inodes, ino)
    }

    /// Open a file for reading. Returns the new handle.
    pub fn open(&self, ino: u64, flags: i32) -> Result<u64, FsError> {
        debug!("open: ino={ino} flags={flags:#o}");
        if flags & libc::O_ACCMODE != libc::O_RDONLY {
            return Err(FsError::ReadOnly);
        }
        let mut state = self.state.lock();
        let file = match state.inodes.get(ino)? {
            Node::File(file) => file.clone(),
            Node::Directory(_) => return Err(FsError::IsADirectory(ino)),
        };
        Ok(state.handles.alloc(FileHandle::File(file)))
    }

    /// Read from an open file. The mount lock is released while the data is
    /// fetched.
    pub fn read(&self, fh: u64, offset: u64, size: u32) -> Result<Bytes, FsError> {
        debug!("read: fh={fh} offset={offset} size={size}");
        let mut guard = self.state.lock();
        let file = match guard.handles.get(fh)? {
            FileHandle::File(file) => file.clone(),
            FileHandle::Listing(_) => return Err(FsError::BadHandle(fh)),
        };
        let result = MutexGuard::unlocked(&mut guard, || {
            catch_unwind(AssertUnwindSafe(|| file.readfrom(offset, u64::from(size))))
        });
        drop(guard);
        match result {
            Ok(Ok(data)) => Ok(data),
            Ok(Err(e)) => {
                error!("read of inode {} failed: {e}", file.inode);
                Err(FsError::io(e.to_string()))
            }
            Err(_) => {
                error!("read of inode {} panicked", file.inode);
                Err(FsError::io("read panicked"))
            }
        }
    }

    pub fn release(&self, fh: u64) -> Result<(), FsError> {
        debug!("release: fh={fh}");
        self.state.lock().handles.remove(fh).map(|_| ())
    }

    /// Snapshot a directory's entries into a new handle.
    pub fn opendir(&self, ino: u64) -> Result<u64, FsError> {
        debug!("opendir: ino={ino}");
        let mut guard = self.state.lock();
        let state = &mut *guard;
        let node = state.inodes.get(ino)?;
        if !node.is_dir() {
            return Err(FsError::NotADirectory(ino));
        }
        let parent = node.parent_inode();
        let parent_attr = self
            .attr(&state.inodes, parent)
            .map_err(|_| FsError::io(format!("parent {parent} of inode {ino} is missing")))?;

        let items = state.inodes.items(&state.backend, ino)?;
        let mut listing = Vec::with_capacity(items.len() + 2);
        listing.push(ListingEntry {
            name: ".".into(),
            attr: self.attr(&state.inodes, ino)?,
        });
        listing.push(ListingEntry {
            name: "..".into(),
            attr: parent_attr,
        });
        for (name, child) in items {
            listing.push(ListingEntry {
                name,
                attr: self.attr(&state.inodes, child)?,
            });
        }
        Ok(state.handles.alloc(FileHandle::Listing(listing)))
    }

    /// Entries of an opendir snapshot starting at `offset`.
    pub fn readdir(&self, fh: u64, offset: i64) -> Result<Vec<DirEntry>, FsError> {
        debug!("readdir: fh={fh} offset={offset}");
        let state = self.state.lock();
        let FileHandle::Listing(listing) = state.handles.get(fh)? else {
            return Err(FsError::BadHandle(fh));
        };
        let start = usize::try_from(offset).unwrap_or(0);
        Ok(listing
            .iter()
            .enumerate()
            .skip(start)
            .map(|(i, entry)| DirEntry {
                name: entry.name.clone(),
                attr: entry.attr,
                next_offset: i as i64 + 1,
            })
            .collect())
    }

    pub fn releasedir(&self, fh: u64) -> Result<(), FsError> {
        debug!("releasedir: fh={fh}");
        self.state.lock().handles.remove(fh).map(|_| ())
    }

    /// Permission checks always pass; the bits in the attributes already
    /// deny writes.
    pub fn access(&self, ino: u64, mask: i32) -> Result<(), FsError> {
        debug!("access: ino={ino} mask={mask:#o}");
        Ok(())
    }

    pub fn statfs(&self) -> StatFs {
        StatFs {
            blocks: 0,
            bfree: 0,
            bavail: 0,
            files: 0,
            ffree: 0,
            bsize: STATFS_BLOCK_SIZE,
            namelen: 255,
            frsize: 0,
        }
    }

    /// The filesystem is immutable; creating files always fails.
    pub fn create(&self, parent: u64, name: &str) -> Result<(FileAttr, u64), FsError> {
        debug!("create: parent={parent} name={name:?} refused");
        Err(FsError::ReadOnly)
    }
}
