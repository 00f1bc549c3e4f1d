use std::ffi::OsStr;
use std::sync::Arc;

use fuser::{
    Filesystem, KernelConfig, ReplyAttr, ReplyCreate, ReplyData, ReplyDirectory, ReplyEmpty,
    ReplyEntry, ReplyOpen, ReplyStatfs, Request as FuseRequest,
};
use tokio::runtime::Handle;
use tracing::{debug, info};

use crate::ops::{ATTR_TTL, ENTRY_TTL, Operations};

/// The `fuser` adapter. Each request is forwarded to [`Operations`] and its
/// result turned into a reply; reads run on the tokio blocking pool so that a
/// slow fetch does not hold up the session loop.
pub struct KeepFs {
    ops: Arc<Operations>,
    rt: Handle,
}

impl KeepFs {
    pub fn new(ops: Arc<Operations>, rt: Handle) -> Self {
        Self { ops, rt }
    }

    pub fn operations(&self) -> &Arc<Operations> {
        &self.ops
    }
}

impl Filesystem for KeepFs {
    fn init(
        &mut self,
        _req: &FuseRequest<'_>,
        _config: &mut KernelConfig,
    ) -> Result<(), libc::c_int> {
        self.ops.init();
        Ok(())
    }

    fn lookup(&mut self, _req: &FuseRequest<'_>, parent: u64, name: &OsStr, reply: ReplyEntry) {
        let Some(name) = name.to_str() else {
            reply.error(libc::ENOENT);
            return;
        };
        match self.ops.lookup(parent, name) {
            Ok(attr) => reply.entry(&ENTRY_TTL, &attr, 0),
            Err(e) => reply.error(e.errno()),
        }
    }

    fn getattr(
        &mut self,
        _req: &FuseRequest<'_>,
        ino: u64,
        _fh: Option<u64>,
        reply: ReplyAttr,
    ) {
        match self.ops.getattr(ino) {
            Ok(attr) => reply.attr(&ATTR_TTL, &attr),
            Err(e) => reply.error(e.errno()),
        }
    }

    fn open(&mut self, _req: &FuseRequest<'_>, ino: u64, flags: i32, reply: ReplyOpen) {
        match self.ops.open(ino, flags) {
            Ok(fh) => reply.opened(fh, 0),
            Err(e) => reply.error(e.errno()),
        }
    }

    fn read(
        &mut self,
        _req: &FuseRequest<'_>,
        _ino: u64,
        fh: u64,
        offset: i64,
        size: u32,
        _flags: i32,
        _lock_owner: Option<u64>,
        reply: ReplyData,
    ) {
        let Ok(offset) = u64::try_from(offset) else {
            reply.error(libc::EINVAL);
            return;
        };
        let ops = self.ops.clone();
        self.rt.spawn_blocking(move || match ops.read(fh, offset, size) {
            Ok(data) => reply.data(&data),
            Err(e) => reply.error(e.errno()),
        });
    }

    fn release(
        &mut self,
        _req: &FuseRequest<'_>,
        _ino: u64,
        fh: u64,
        _flags: i32,
        _lock_owner: Option<u64>,
        _flush: bool,
        reply: ReplyEmpty,
    ) {
        match self.ops.release(fh) {
            Ok(()) => reply.ok(),
            Err(e) => reply.error(e.errno()),
        }
    }

    fn opendir(&mut self, _req: &FuseRequest<'_>, ino: u64, _flags: i32, reply: ReplyOpen) {
        match self.ops.opendir(ino) {
            Ok(fh) => reply.opened(fh, 0),
            Err(e) => reply.error(e.errno()),
        }
    }

    fn readdir(
        &mut self,
        _req: &FuseRequest<'_>,
        _ino: u64,
        fh: u64,
        offset: i64,
        mut reply: ReplyDirectory,
    ) {
        let entries = match self.ops.readdir(fh, offset) {
            Ok(entries) => entries,
            Err(e) => {
                reply.error(e.errno());
                return;
            }
        };
        for entry in entries {
            // reply.add returns true when the buffer is full.
            if reply.add(entry.attr.ino, entry.next_offset, entry.attr.kind, &entry.name) {
                break;
            }
        }
        reply.ok();
    }

    fn releasedir(
        &mut self,
        _req: &FuseRequest<'_>,
        _ino: u64,
        fh: u64,
        _flags: i32,
        reply: ReplyEmpty,
    ) {
        match self.ops.releasedir(fh) {
            Ok(()) => reply.ok(),
            Err(e) => reply.error(e.errno()),
        }
    }

    fn statfs(&mut self, _req: &FuseRequest<'_>, _ino: u64, reply: ReplyStatfs) {
        let st = self.ops.statfs();
        reply.statfs(
            st.blocks, st.bfree, st.bavail, st.files, st.ffree, st.bsize, st.namelen, st.frsize,
        );
    }

    fn access(&mut self, _req: &FuseRequest<'_>, ino: u64, mask: i32, reply: ReplyEmpty) {
        match self.ops.access(ino, mask) {
            Ok(()) => reply.ok(),
            Err(e) => reply.error(e.errno()),
        }
    }

    fn create(
        &mut self,
        _req: &FuseRequest<'_>,
        parent: u64,
        name: &OsStr,
        _mode: u32,
        _umask: u32,
        _flags: i32,
        reply: ReplyCreate,
    ) {
        let name = name.to_string_lossy();
        match self.ops.create(parent, &name) {
            Ok((attr, fh)) => reply.created(&ENTRY_TTL, &attr, 0, fh, 0),
            Err(e) => {
                debug!("create refused: {e}");
                reply.error(e.errno());
            }
        }
    }

    fn destroy(&mut self) {
        info!("keep-fuse unmounted");
    }
}
