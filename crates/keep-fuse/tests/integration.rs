use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{Receiver, Sender, channel};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use bytes::Bytes;
use fuser::{FileAttr, FileType};
use keep_fuse::keep::Result as KeepResult;
use keep_fuse::{
    Backend, DirectoryKind, Event, EventSource, FsError, FsOptions, GroupContents, KeepClient,
    Layout, Link, MemoryApi, MemoryEvents, MemoryKeep, NoEvents, Operations, ROOT_INO,
};
use serde_json::json;

const EMPTY_COLLECTION: &str = "d41d8cd98f00b204e9800998ecf8427e+0";
const GROUP: &str = "zzzzz-j7d0g-000000000000001";
const LINK_UUID: &str = "zzzzz-o0j2j-000000000000001";

/// Deterministic test content: `len` bytes of a repeating pattern.
fn pattern(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i * 7 % 251) as u8).collect()
}

fn locator(seed: u64, len: usize) -> String {
    format!("{seed:032x}+{len}")
}

/// Store `data` as blocks of at most `block` bytes, returning their locators.
fn put_blocks(keep: &MemoryKeep, seed: u64, data: &[u8], block: usize) -> Vec<String> {
    data.chunks(block)
        .enumerate()
        .map(|(i, chunk)| {
            let loc = locator(seed * 1000 + i as u64, chunk.len());
            keep.put(&loc, chunk.to_vec());
            loc
        })
        .collect()
}

/// Store a manifest block and return its locator.
fn put_manifest(keep: &MemoryKeep, seed: u64, text: String) -> String {
    let loc = locator(seed, text.len());
    keep.put(&loc, text.into_bytes());
    loc
}

/// A collection with `big.bin` (10000 bytes over three blocks) at the top and
/// `docs/readme.txt` below.
fn put_collection(keep: &MemoryKeep, seed: u64) -> String {
    let big = put_blocks(keep, seed + 1, &pattern(10_000), 4096);
    let readme = put_blocks(keep, seed + 2, b"read me\n", 4096);
    let text = format!(
        ". {} 0:10000:big.bin\n./docs {} 0:8:readme.txt\n",
        big.join(" "),
        readme.join(" ")
    );
    put_manifest(keep, seed, text)
}

struct World {
    keep: Arc<MemoryKeep>,
    api: Arc<MemoryApi>,
    events: MemoryEvents,
    ops: Operations,
}

fn world_with(events: Arc<dyn EventSource>, poll_interval: Duration) -> World {
    let keep = Arc::new(MemoryKeep::new());
    let api = Arc::new(MemoryApi::new());
    let ops = Operations::new(
        Backend::new(keep.clone(), api.clone()),
        events,
        Layout::Home,
        FsOptions {
            uid: 501,
            gid: 20,
            poll_interval,
        },
    );
    World {
        keep,
        api,
        events: MemoryEvents::new(),
        ops,
    }
}

fn world() -> World {
    let events = MemoryEvents::new();
    let mut w = world_with(Arc::new(events.clone()), Duration::from_secs(60));
    w.events = events;
    w
}

fn lookup_path(ops: &Operations, path: &[&str]) -> Result<FileAttr, FsError> {
    let mut attr = ops.getattr(ROOT_INO)?;
    for name in path {
        attr = ops.lookup(attr.ino, name)?;
    }
    Ok(attr)
}

/// Names and inodes in a directory, without `.` and `..`.
fn list(ops: &Operations, ino: u64) -> Vec<(String, u64)> {
    let fh = ops.opendir(ino).unwrap();
    let entries = ops.readdir(fh, 0).unwrap();
    ops.releasedir(fh).unwrap();
    entries
        .into_iter()
        .skip(2)
        .map(|e| (e.name, e.attr.ino))
        .collect()
}

fn names(ops: &Operations, ino: u64) -> Vec<String> {
    list(ops, ino).into_iter().map(|(n, _)| n).collect()
}

fn read_all(ops: &Operations, ino: u64, chunk: u32) -> Vec<u8> {
    let fh = ops.open(ino, libc::O_RDONLY).unwrap();
    let mut out = Vec::new();
    loop {
        let data = ops.read(fh, out.len() as u64, chunk).unwrap();
        if data.is_empty() {
            break;
        }
        out.extend_from_slice(&data);
    }
    ops.release(fh).unwrap();
    out
}

#[test]
fn test_tree_parent_links_are_consistent() {
    let w = world();
    let coll = put_collection(&w.keep, 10);
    w.api.add_link(Link::tag("qc-passed", coll.clone()));
    lookup_path(&w.ops, &["by_id", coll.as_str()]).unwrap();

    let mut pending = vec![ROOT_INO];
    let mut visited = 0;
    while let Some(dir) = pending.pop() {
        let fh = w.ops.opendir(dir).unwrap();
        let entries = w.ops.readdir(fh, 0).unwrap();
        w.ops.releasedir(fh).unwrap();
        assert_eq!(entries[0].name, ".");
        assert_eq!(entries[0].attr.ino, dir);
        for entry in entries.into_iter().skip(2) {
            visited += 1;
            let parent = w
                .ops
                .with_state(|s| s.inodes.get(entry.attr.ino).unwrap().parent_inode());
            assert_eq!(parent, dir, "{} has the wrong parent", entry.name);
            if entry.attr.kind == FileType::Directory {
                let dotdot = w.ops.lookup(entry.attr.ino, "..").unwrap();
                assert_eq!(dotdot.ino, dir);
                pending.push(entry.attr.ino);
            }
        }
    }
    // root children, by_id/<coll>/{big.bin,docs/readme.txt}, by_tag/qc-passed/<coll>/...
    assert!(visited >= 12, "only visited {visited} entries");
}

#[test]
fn test_chunked_read_matches_manifest() {
    let w = world();
    let coll = put_collection(&w.keep, 20);
    let big = lookup_path(&w.ops, &["by_id", coll.as_str(), "big.bin"]).unwrap();
    assert_eq!(big.size, 10_000);
    assert_eq!(big.kind, FileType::RegularFile);
    assert_eq!(big.perm, 0o444);
    assert_eq!(read_all(&w.ops, big.ino, 1000), pattern(10_000));
    assert_eq!(read_all(&w.ops, big.ino, 4096), pattern(10_000));

    let readme = lookup_path(&w.ops, &["by_id", coll.as_str(), "docs", "readme.txt"]).unwrap();
    assert_eq!(read_all(&w.ops, readme.ino, 3), b"read me\n");
}

#[test]
fn test_magic_directory_materializes_empty_collection() {
    let w = world();
    let by_id = lookup_path(&w.ops, &["by_id"]).unwrap();
    assert!(names(&w.ops, by_id.ino).is_empty());

    let coll = w.ops.lookup(by_id.ino, EMPTY_COLLECTION).unwrap();
    assert_eq!(coll.kind, FileType::Directory);
    assert_eq!(coll.perm, 0o555);
    assert!(names(&w.ops, coll.ino).is_empty());
    assert_eq!(names(&w.ops, by_id.ino), vec![EMPTY_COLLECTION]);

    // Unknown locators do not exist.
    let missing = locator(0xdead, 3);
    assert!(matches!(
        w.ops.lookup(by_id.ino, &missing),
        Err(FsError::NotFound(_))
    ));
    assert_eq!(names(&w.ops, by_id.ino), vec![EMPTY_COLLECTION]);
}

#[test]
fn test_corrupt_collection_does_not_take_down_the_mount() {
    let w = world();
    let good = put_collection(&w.keep, 7);
    let corrupt = put_manifest(
        &w.keep,
        50,
        format!(
            ". {} {} 0:1:x\n",
            locator(0xa, usize::MAX),
            locator(0xb, 1)
        ),
    );
    let by_id = lookup_path(&w.ops, &["by_id"]).unwrap();

    let coll = w.ops.lookup(by_id.ino, &corrupt).unwrap();
    assert!(matches!(w.ops.opendir(coll.ino), Err(FsError::Io(_))));
    assert!(matches!(w.ops.lookup(coll.ino, "x"), Err(FsError::Io(_))));

    let readme = lookup_path(&w.ops, &["by_id", good.as_str(), "docs", "readme.txt"]).unwrap();
    assert_eq!(read_all(&w.ops, readme.ino, 4096), b"read me\n");
}

#[test]
fn test_error_codes() {
    let w = world();
    let coll = put_collection(&w.keep, 30);
    let dir = lookup_path(&w.ops, &["by_id", coll.as_str()]).unwrap();
    let file = lookup_path(&w.ops, &["by_id", coll.as_str(), "big.bin"]).unwrap();

    let err = w.ops.open(dir.ino, libc::O_RDONLY).unwrap_err();
    assert_eq!(err.errno(), libc::EISDIR);
    let err = w.ops.open(file.ino, libc::O_RDWR).unwrap_err();
    assert_eq!(err.errno(), libc::EROFS);
    let err = w.ops.opendir(file.ino).unwrap_err();
    assert_eq!(err.errno(), libc::ENOTDIR);
    let err = w.ops.create(dir.ino, "new.txt").unwrap_err();
    assert_eq!(err.errno(), libc::EROFS);
    let err = w.ops.lookup(dir.ino, "nope").unwrap_err();
    assert_eq!(err.errno(), libc::ENOENT);

    let fh = w.ops.open(file.ino, libc::O_RDONLY).unwrap();
    w.ops.release(fh).unwrap();
    let err = w.ops.read(fh, 0, 10).unwrap_err();
    assert_eq!(err.errno(), libc::EBADF);
}

#[test]
fn test_read_failure_is_io_error() {
    let w = world();
    let coll = put_collection(&w.keep, 40);
    let file = lookup_path(&w.ops, &["by_id", coll.as_str(), "big.bin"]).unwrap();
    let fh = w.ops.open(file.ino, libc::O_RDONLY).unwrap();

    w.keep.set_offline(true);
    let err = w.ops.read(fh, 0, 100).unwrap_err();
    assert!(matches!(err, FsError::Io(_)));
    w.keep.set_offline(false);
    assert_eq!(w.ops.read(fh, 0, 100).unwrap().len(), 100);
}

#[test]
fn test_tag_lists_exactly_tagged_collections() {
    let w = world();
    let a = put_collection(&w.keep, 50);
    let b = put_collection(&w.keep, 60);
    w.api.add_link(Link::tag("qc-passed", a.clone()));
    w.api.add_link(Link::tag("qc-passed", b.clone()));
    w.api.add_link(Link::tag("raw", b.clone()));

    let by_tag = lookup_path(&w.ops, &["by_tag"]).unwrap();
    assert_eq!(names(&w.ops, by_tag.ino), vec!["qc-passed", "raw"]);

    let qc = lookup_path(&w.ops, &["by_tag", "qc-passed"]).unwrap();
    let before = list(&w.ops, qc.ino);
    let mut expected = vec![a.clone(), b.clone()];
    expected.sort();
    assert_eq!(
        before.iter().map(|(n, _)| n.clone()).collect::<Vec<_>>(),
        expected
    );

    w.api.remove_links(|l| l.name == "qc-passed" && l.head_uuid == b);
    w.events.emit(&Event::new(LINK_UUID, "delete"));

    let after = list(&w.ops, qc.ino);
    assert_eq!(after.len(), 1);
    assert_eq!(after[0].0, a);
    let a_before = before.iter().find(|(n, _)| *n == a).unwrap().1;
    assert_eq!(after[0].1, a_before);
    assert_eq!(lookup_path(&w.ops, &["by_tag", "qc-passed"]).unwrap().ino, qc.ino);
}

#[test]
fn test_refresh_without_change_is_idempotent() {
    let w = world();
    let a = put_collection(&w.keep, 70);
    w.api.add_link(Link::tag("qc-passed", a));
    let by_tag = lookup_path(&w.ops, &["by_tag"]).unwrap();
    let qc = lookup_path(&w.ops, &["by_tag", "qc-passed"]).unwrap();
    let tags_before = list(&w.ops, by_tag.ino);
    let qc_before = list(&w.ops, qc.ino);
    let inodes_before = w.ops.with_state(|s| s.inodes.len());

    w.events.emit(&Event::new(LINK_UUID, "update"));
    assert_eq!(list(&w.ops, by_tag.ino), tags_before);
    assert_eq!(list(&w.ops, qc.ino), qc_before);
    assert_eq!(w.ops.with_state(|s| s.inodes.len()), inodes_before);
}

#[test]
fn test_readdir_snapshot_ignores_later_changes() {
    let w = world();
    w.api.add_link(Link::tag("one", EMPTY_COLLECTION));
    let by_tag = lookup_path(&w.ops, &["by_tag"]).unwrap();
    let fh = w.ops.opendir(by_tag.ino).unwrap();

    w.api.add_link(Link::tag("two", EMPTY_COLLECTION));
    w.events.emit(&Event::new(LINK_UUID, "create"));
    assert_eq!(names(&w.ops, by_tag.ino), vec!["one", "two"]);

    let snapshot: Vec<String> = w
        .ops
        .readdir(fh, 0)
        .unwrap()
        .into_iter()
        .map(|e| e.name)
        .collect();
    assert_eq!(snapshot, vec![".", "..", "one"]);
    w.ops.releasedir(fh).unwrap();
}

#[test]
fn test_group_events_invalidate_group_contents() {
    let w = world();
    let coll = put_collection(&w.keep, 80);
    w.api.add_group(keep_fuse::Group::new(GROUP, "Project"));
    w.api.set_contents(
        GROUP,
        GroupContents {
            items: vec![json!({ "uuid": coll, "name": "input" })],
            links: vec![],
        },
    );
    let project = lookup_path(&w.ops, &["groups", "Project"]).unwrap();
    let input = lookup_path(&w.ops, &["groups", "Project", "input"]).unwrap();
    assert_eq!(names(&w.ops, project.ino), vec!["input"]);

    let object = "zzzzz-xxxxx-000000000000042";
    w.api.set_contents(
        GROUP,
        GroupContents {
            items: vec![
                json!({ "uuid": coll, "name": "input" }),
                json!({ "uuid": object, "name": "notes", "owner_uuid": GROUP }),
            ],
            links: vec![],
        },
    );
    // Nothing has told the directory yet.
    assert_eq!(names(&w.ops, project.ino), vec!["input"]);

    w.events.emit(&Event::new(GROUP, "update"));
    assert_eq!(names(&w.ops, project.ino), vec!["input", "notes"]);
    assert_eq!(
        lookup_path(&w.ops, &["groups", "Project", "input"]).unwrap().ino,
        input.ino
    );

    let notes = lookup_path(&w.ops, &["groups", "Project", "notes"]).unwrap();
    let text = read_all(&w.ops, notes.ino, 7);
    assert_eq!(text.last(), Some(&b'\n'));
    let value: serde_json::Value = serde_json::from_slice(&text).unwrap();
    assert_eq!(value["owner_uuid"], GROUP);
}

#[test]
fn test_poll_fallback_refreshes_without_events() {
    let w = world_with(Arc::new(NoEvents), Duration::ZERO);
    w.api.add_link(Link::tag("one", EMPTY_COLLECTION));
    let by_tag = lookup_path(&w.ops, &["by_tag"]).unwrap();
    assert_eq!(names(&w.ops, by_tag.ino), vec!["one"]);

    w.api.add_link(Link::tag("two", EMPTY_COLLECTION));
    assert_eq!(names(&w.ops, by_tag.ino), vec!["one", "two"]);
}

#[test]
fn test_metadata_outage_keeps_listing() {
    let w = world_with(Arc::new(NoEvents), Duration::ZERO);
    w.api.add_link(Link::tag("one", EMPTY_COLLECTION));
    let by_tag = lookup_path(&w.ops, &["by_tag"]).unwrap();
    assert_eq!(names(&w.ops, by_tag.ino), vec!["one"]);

    w.api.set_offline(true);
    assert_eq!(names(&w.ops, by_tag.ino), vec!["one"]);
    w.api.set_offline(false);
    w.api.add_link(Link::tag("two", EMPTY_COLLECTION));
    assert_eq!(names(&w.ops, by_tag.ino), vec!["one", "two"]);
}

#[test]
fn test_single_collection_layout() {
    let keep = Arc::new(MemoryKeep::new());
    let coll = put_collection(&keep, 90);
    let ops = Operations::new(
        Backend::new(keep, Arc::new(MemoryApi::new())),
        Arc::new(NoEvents),
        Layout::Single(DirectoryKind::Collection { locator: coll }),
        FsOptions::default(),
    );
    assert_eq!(names(&ops, ROOT_INO), vec!["big.bin", "docs"]);
    assert_eq!(ops.lookup(ROOT_INO, "..").unwrap().ino, ROOT_INO);
}

/// A store whose fetches block until the test lets them through.
struct GatedKeep {
    inner: MemoryKeep,
    gated: AtomicBool,
    entered: Mutex<Sender<()>>,
    release: Mutex<Receiver<()>>,
}

impl KeepClient for GatedKeep {
    fn get(&self, locator: &str) -> KeepResult<Bytes> {
        if self.gated.load(Ordering::SeqCst) {
            self.entered.lock().unwrap().send(()).unwrap();
            self.release
                .lock()
                .unwrap()
                .recv_timeout(Duration::from_secs(10))
                .unwrap();
        }
        self.inner.get(locator)
    }
}

#[test]
fn test_read_releases_mount_lock() {
    let (entered_tx, entered_rx) = channel();
    let (release_tx, release_rx) = channel();
    let keep = Arc::new(GatedKeep {
        inner: MemoryKeep::new(),
        gated: AtomicBool::new(false),
        entered: Mutex::new(entered_tx),
        release: Mutex::new(release_rx),
    });
    let coll = put_collection(&keep.inner, 100);
    let ops = Arc::new(Operations::new(
        Backend::new(keep.clone(), Arc::new(MemoryApi::new())),
        Arc::new(NoEvents),
        Layout::Home,
        FsOptions::default(),
    ));
    let file = lookup_path(&ops, &["by_id", coll.as_str(), "big.bin"]).unwrap();
    let fh = ops.open(file.ino, libc::O_RDONLY).unwrap();

    keep.gated.store(true, Ordering::SeqCst);
    let reader = {
        let ops = ops.clone();
        thread::spawn(move || ops.read(fh, 0, 16))
    };
    entered_rx.recv_timeout(Duration::from_secs(10)).unwrap();

    // The reader is parked inside the fetch; other requests still run.
    assert_eq!(ops.getattr(file.ino).unwrap().size, 10_000);
    assert_eq!(names(&ops, ROOT_INO), vec!["by_id", "by_tag", "groups"]);

    keep.gated.store(false, Ordering::SeqCst);
    release_tx.send(()).unwrap();
    let data = reader.join().unwrap().unwrap();
    assert_eq!(data.as_ref(), &pattern(10_000)[..16]);
}

#[test]
fn test_concurrent_readers() {
    let w = world();
    let coll = put_collection(&w.keep, 110);
    w.api.add_link(Link::tag("qc-passed", coll.clone()));
    let ops = Arc::new(w.ops);

    let workers: Vec<_> = (0..8)
        .map(|i| {
            let ops = ops.clone();
            let coll = coll.clone();
            thread::spawn(move || {
                let path: Vec<&str> = if i % 2 == 0 {
                    vec!["by_id", coll.as_str(), "big.bin"]
                } else {
                    vec!["by_tag", "qc-passed", coll.as_str(), "big.bin"]
                };
                let file = lookup_path(&ops, &path).unwrap();
                read_all(&ops, file.ino, 1500 + i * 100)
            })
        })
        .collect();
    for worker in workers {
        assert_eq!(worker.join().unwrap(), pattern(10_000));
    }
    assert!(ops.with_state(|s| s.handles.is_empty()));
}
